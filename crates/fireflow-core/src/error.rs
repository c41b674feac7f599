//! Error types for the FireFlow system
//!
//! The taxonomy mirrors where a failure is handled:
//!
//! - resolver errors ([`Error::AddressUnavailable`], [`Error::AddressInvalid`])
//!   abort a whole pass
//! - provider errors ([`Error::RuleNotFound`], [`Error::ProviderTransient`],
//!   [`Error::ProviderPermanent`]) are caught at the rule boundary
//! - [`Error::Storage`] covers the rule repository and config source

use thiserror::Error;

/// Result type alias for FireFlow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the FireFlow system
#[derive(Error, Debug)]
pub enum Error {
    /// The address source could not be reached or read
    #[error("public address unavailable: {0}")]
    AddressUnavailable(String),

    /// The address source answered with something that is not a plain IPv4 address
    #[error("public address invalid: {0}")]
    AddressInvalid(String),

    /// No remote rule matches the local rule (triggers the create fallback)
    #[error("remote rule not found: {0}")]
    RuleNotFound(String),

    /// The instance does not exist at the provider
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Network failure or throttling; the next pass may succeed
    #[error("provider error ({provider}, transient): {message}")]
    ProviderTransient {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// Bad credentials, unsupported provider or rejected request
    #[error("provider error ({provider}): {message}")]
    ProviderPermanent {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// Rule repository or config source failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A reconciliation pass is already running
    #[error("a reconciliation pass is already running")]
    PassInProgress,

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an address-unavailable error
    pub fn address_unavailable(msg: impl Into<String>) -> Self {
        Self::AddressUnavailable(msg.into())
    }

    /// Create an address-invalid error
    pub fn address_invalid(msg: impl Into<String>) -> Self {
        Self::AddressInvalid(msg.into())
    }

    /// Create a rule-not-found error
    pub fn rule_not_found(msg: impl Into<String>) -> Self {
        Self::RuleNotFound(msg.into())
    }

    /// Create an instance-not-found error
    pub fn instance_not_found(msg: impl Into<String>) -> Self {
        Self::InstanceNotFound(msg.into())
    }

    /// Create a transient provider error
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a permanent provider error
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderPermanent {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether retrying on a later pass may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderTransient { .. } | Self::AddressUnavailable(_)
        )
    }

    /// Whether the remote counterpart of a rule is missing
    pub fn is_rule_not_found(&self) -> bool {
        matches!(self, Self::RuleNotFound(_))
    }

    /// Whether the failure needs operator attention
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ProviderPermanent { .. } | Self::Config(_) | Self::InvalidInput(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
