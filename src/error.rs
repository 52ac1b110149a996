use ethers::types::Address;
use thiserror::Error;

pub type Result<T, E = AaError> = std::result::Result<T, E>;

/// Everything the user-operation pipeline can fail with.
///
/// Nothing in this crate retries: the first error aborts the whole
/// `send_transaction` call and is handed back as-is.
#[derive(Error, Debug)]
pub enum AaError {
    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("gas estimation failed: {0}")]
    EstimationFailed(String),

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("entry point {entry_point:?} is not supported by the relay (supported: {supported:?})")]
    EntryPointUnsupported {
        entry_point: Address,
        supported: Vec<Address>,
    },

    #[error("user operation rejected{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    SubmissionRejected { code: Option<i64>, message: String },

    #[error("timed out after {0:?} waiting for user operation receipt")]
    Timeout(std::time::Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("config error: {0}")]
    Config(String),
}

impl AaError {
    pub(crate) fn abi(e: impl std::fmt::Display) -> Self {
        Self::Abi(e.to_string())
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self::SubmissionRejected {
            code: None,
            message: message.into(),
        }
    }
}

/// Parses a hex address, reporting `field` on failure.
pub fn parse_address(field: &'static str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|_| AaError::InvalidAddress {
            field,
            value: value.to_string(),
        })
}
