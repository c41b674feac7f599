//! TC3-HMAC-SHA256 request signing
//!
//! Every Tencent Cloud API 3.0 call is a `POST /` with a JSON body, signed
//! over a canonical request made of the content type, host and action
//! headers plus the SHA-256 of the payload. The signing key is derived from
//! the secret key, the UTC date and the service name.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use fireflow_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "TC3-HMAC-SHA256";
pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";

/// What gets signed for one request
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    /// Service short name ("lighthouse", "cvm")
    pub service: &'a str,
    /// Host header exactly as sent
    pub host: &'a str,
    /// API action ("DescribeFirewallRules")
    pub action: &'a str,
    /// Serialized JSON body
    pub payload: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl SigningRequest<'_> {
    fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    fn credential_scope(&self) -> String {
        format!("{}/{}/tc3_request", self.date(), self.service)
    }

    /// Canonical request string
    pub fn canonical_request(&self) -> String {
        let canonical_headers = format!(
            "content-type:{}\nhost:{}\nx-tc-action:{}\n",
            CONTENT_TYPE,
            self.host,
            self.action.to_ascii_lowercase()
        );
        format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers,
            SIGNED_HEADERS,
            sha256_hex(self.payload.as_bytes())
        )
    }

    /// String to sign
    pub fn string_to_sign(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            self.timestamp.timestamp(),
            self.credential_scope(),
            sha256_hex(self.canonical_request().as_bytes())
        )
    }
}

/// Build the `Authorization` header value
pub fn authorization(secret_id: &str, secret_key: &str, request: &SigningRequest<'_>) -> Result<String> {
    let secret_date = hmac_sha256(format!("TC3{}", secret_key).as_bytes(), request.date().as_bytes())?;
    let secret_service = hmac_sha256(&secret_date, request.service.as_bytes())?;
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request")?;
    let signature = hex::encode(hmac_sha256(
        &secret_signing,
        request.string_to_sign().as_bytes(),
    )?);

    Ok(format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        secret_id,
        request.credential_scope(),
        SIGNED_HEADERS,
        signature
    ))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::permanent(crate::PROVIDER_NAME, format!("invalid signing key: {}", e)))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
