use crate::{swap::Status, SwapId, Timestamp};

/// Everything that can go wrong while driving a swap.
///
/// Only [`Error::Network`] is worth retrying. A [`Error::ScriptMismatch`]
/// halts the swap it was raised for.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    Validation(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("insufficient funds: needed {needed} sat, available {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("script mismatch: expected {expected}, got {actual}")]
    ScriptMismatch { expected: String, actual: String },
    #[error("timelock violation: now is {now}, timelock is {timelock}")]
    TimelockViolation { now: Timestamp, timelock: Timestamp },
    #[error("transaction {txid} was rejected: {reason}")]
    BroadcastRejected { txid: String, reason: String },
    #[error("swap cannot move from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("swap {0} is not known")]
    UnknownSwap(SwapId),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn network(msg: impl std::fmt::Display) -> Self {
        Error::Network(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}
