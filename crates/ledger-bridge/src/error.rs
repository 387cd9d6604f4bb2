//! Ledger errors

use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use ledger_types::RecordError;
use solana_sdk::signature::Signature;
use thiserror::Error;

/// HTTP status providers answer with when a key is over quota
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// Failure of a remote ledger call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Provider congestion signal; worth one more attempt after a cool-down
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// The record a create targeted is already there
    #[error("Account already exists: {0}")]
    AlreadyExists(String),

    /// A record the operation depends on is not visible yet
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    /// The program refused the instruction
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Malformed record: {0}")]
    Malformed(#[from] RecordError),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction {0} was not confirmed in time")]
    Unconfirmed(Signature),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl LedgerError {
    /// Only congestion is retried locally
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::RateLimited(_))
    }

    /// Map a provider error message onto the taxonomy. Status codes are never
    /// parsed out of free text; see [`LedgerError::from_http_status`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("too many requests") || lower.contains("rate limit") {
            LedgerError::RateLimited(message)
        } else if lower.contains("already in use") {
            LedgerError::AlreadyExists(message)
        } else if lower.contains("accountnotinitialized") || lower.contains("0xbc4") {
            LedgerError::PreconditionNotMet(message)
        } else if lower.contains("custom program error")
            || lower.contains("instructionerror")
            || lower.contains("simulation failed")
        {
            LedgerError::Rejected(message)
        } else {
            LedgerError::Transport(message)
        }
    }

    /// Map a response that carried an HTTP status
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        if status == HTTP_TOO_MANY_REQUESTS {
            LedgerError::RateLimited(message.into())
        } else {
            LedgerError::classify(message)
        }
    }
}

impl From<ClientError> for LedgerError {
    fn from(e: ClientError) -> Self {
        let message = e.to_string();
        match &e {
            ClientError::Transport(inner) => match inner.downcast_ref::<HttpTransportError>() {
                Some(HttpTransportError::Rejected { status_code }) => {
                    LedgerError::from_http_status(*status_code, message)
                }
                _ => LedgerError::classify(message),
            },
            ClientError::Call(call) if call.code() == i32::from(HTTP_TOO_MANY_REQUESTS) => {
                LedgerError::RateLimited(message)
            }
            _ => LedgerError::classify(message),
        }
    }
}
