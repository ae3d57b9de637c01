pub mod events;
pub mod matchmaking;
pub mod session;
pub mod verifier;

pub use events::{EventSender, EventStream};
pub use matchmaking::Matchmaker;
pub use session::{CallReceipt, Connector, ContractCall, Session, Sign, SignError};
pub use verifier::{BytecodeVerifier, CompilerVerifier, DigestVerifier};

use rochambeau_types::Address;
use std::fmt;
use thiserror::Error;

/// Why the channel refused to apply a contract call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The peer did not co-sign in time.
    Timeout,
    /// Another update was in flight for the same channel round.
    Conflict,
    /// The peer refused to co-sign.
    Declined(String),
    /// The caller cannot fund the call.
    Insufficient,
    Other(String),
}

impl RejectReason {
    /// Transient rejections worth reconciling and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Conflict)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Conflict => f.write_str("conflict"),
            Self::Declined(reason) => write!(f, "declined: {reason}"),
            Self::Insufficient => f.write_str("insufficient balance"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("failed: {status}: {body}")]
    FailedWithBody {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("account is greylisted")]
    Greylisted,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("call rejected: {0}")]
    Rejected(RejectReason),
    #[error("no call by {caller} to {contract} at round {round}")]
    CallNotFound {
        caller: Address,
        contract: Address,
        round: u64,
    },
    #[error("session closed")]
    SessionClosed,
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
    #[error("unexpected response")]
    UnexpectedResponse,
}

impl Error {
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
