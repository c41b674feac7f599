// # Address Source Trait
//
// Defines the interface for discovering the operator's current public
// IPv4 address.
//
// ## Implementations
//
// - HTTP IP-echo endpoint: `fireflow-ip-http` crate
//
// ## Validation
//
// Every implementation must run the raw text through [`validate_address`]
// before returning it. IP-echo endpoints misbehave in creative ways (HTML
// error pages, JSON bodies, IPv6 answers), and a bogus address would be
// written straight into firewall rules.

use async_trait::async_trait;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Longest answer accepted from an address source, after trimming
pub const MAX_RAW_ADDRESS_LEN: usize = 40;

static IPV4_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)$")
        .expect("IPv4 grammar is a valid regex")
});

/// Validate the raw text returned by an address source
///
/// The substring checks are a fast reject; the dotted-quad grammar is the
/// authority. Never returns a partially validated address.
///
/// # Errors
///
/// [`Error::AddressInvalid`] on any validation failure.
pub fn validate_address(raw: &str) -> Result<Ipv4Addr> {
    let candidate = raw.trim();
    if candidate.len() > MAX_RAW_ADDRESS_LEN {
        return Err(Error::address_invalid(format!(
            "response too long ({} bytes)",
            candidate.len()
        )));
    }

    let lowered = candidate.to_ascii_lowercase();

    if candidate.contains(':') {
        return Err(Error::address_invalid(format!(
            "not a bare IPv4 address: {}",
            candidate
        )));
    }
    if candidate.contains('[') || candidate.contains('{') {
        return Err(Error::address_invalid("structured response body"));
    }
    if lowered.contains("error") || lowered.contains("html") {
        return Err(Error::address_invalid("error page instead of an address"));
    }
    if !IPV4_GRAMMAR.is_match(candidate) {
        return Err(Error::address_invalid(format!(
            "not a dotted-quad IPv4 address: {}",
            candidate
        )));
    }

    candidate
        .parse::<Ipv4Addr>()
        .map_err(|e| Error::address_invalid(format!("{}: {}", candidate, e)))
}

/// Trait for public address sources
///
/// Implementations fetch and validate; they hold no state between calls and
/// implement no retries. A failed resolution aborts the pass that asked.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Resolve the current public IPv4 address from `source_url`
    ///
    /// # Returns
    ///
    /// - `Ok(Ipv4Addr)`: a fully validated address
    /// - `Err(Error::AddressUnavailable)`: transport failure
    /// - `Err(Error::AddressInvalid)`: the answer failed validation
    async fn resolve(&self, source_url: &str) -> Result<Ipv4Addr>;

    /// Name for logging
    fn source_name(&self) -> &'static str;
}
