use crate::lifecycle::{TradeAction, TradeStatus};
use crate::trader::TraderStatus;

/// Coarse classification of [`ExchangeError`], used by callers to map
/// failures onto their own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    /// Caller is not allowed to act on the record.
    Forbidden,
    InvalidTradeState,
    InsufficientBond,
    /// The record already carries the thing being created.
    Conflict,
    InvariantViolation,
    Storage,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("trade {0} not found")]
    TradeNotFound(String),
    #[error("trader {0} not found")]
    TraderNotFound(String),
    #[error("dispute {0} not found")]
    DisputeNotFound(String),
    #[error("trader {0} is not active")]
    TraderInactive(String),
    #[error("trader {0} is not assigned to this trade")]
    WrongTrader(String),
    #[error("user {0} does not own this trade")]
    NotOwner(String),
    #[error("{0} is not a participant in this trade")]
    NotParticipant(String),
    #[error("cannot {action} a trade that is {status}")]
    InvalidTradeState {
        status: TradeStatus,
        action: TradeAction,
    },
    #[error("cannot {action} a trader that is {status}")]
    InvalidTraderState {
        status: TraderStatus,
        action: &'static str,
    },
    #[error("insufficient bond: {available} available, {required} required")]
    InsufficientBond { available: u64, required: u64 },
    #[error("trader has no {from}->{to} corridor accepting {amount}")]
    CorridorUnavailable {
        from: String,
        to: String,
        amount: u64,
    },
    #[error("trade {0} already has a dispute")]
    DisputeAlreadyOpen(String),
    #[error("dispute {0} is already resolved")]
    AlreadyResolved(String),
    #[error("trade {0} is not completed")]
    NotCompleted(String),
    #[error("trade {0} has already been rated by this user")]
    AlreadyRated(String),
    #[error("user {0} already has a trader record")]
    AlreadyApplied(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidAmount(_) | Self::CorridorUnavailable { .. } => {
                ErrorKind::Validation
            }
            Self::TradeNotFound(_) | Self::TraderNotFound(_) | Self::DisputeNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::WrongTrader(_) | Self::NotOwner(_) | Self::NotParticipant(_) => {
                ErrorKind::Forbidden
            }
            Self::InvalidTradeState { .. }
            | Self::InvalidTraderState { .. }
            | Self::TraderInactive(_)
            | Self::NotCompleted(_) => ErrorKind::InvalidTradeState,
            Self::InsufficientBond { .. } => ErrorKind::InsufficientBond,
            Self::DisputeAlreadyOpen(_) | Self::AlreadyResolved(_) | Self::AlreadyRated(_) => {
                ErrorKind::Conflict
            }
            Self::AlreadyApplied(_) => ErrorKind::Conflict,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only storage failures are safe to retry: nothing partial was committed.
    /// Business rejections must not be retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(violation = %msg, "bond/trade invariant violated");
        Self::InvariantViolation(msg)
    }
}

impl From<sled::Error> for ExchangeError {
    fn from(value: sled::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<minicbor::decode::Error> for ExchangeError {
    fn from(value: minicbor::decode::Error) -> Self {
        Self::Storage(format!("corrupt record: {value}"))
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for ExchangeError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        Self::Storage(format!("failed to encode record: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(ExchangeError::Storage("io".into()).is_retryable());
        assert!(
            !ExchangeError::InsufficientBond {
                available: 1,
                required: 2
            }
            .is_retryable()
        );
        assert!(
            !ExchangeError::InvalidTradeState {
                status: TradeStatus::Pending,
                action: TradeAction::MarkDelivered,
            }
            .is_retryable()
        );
    }

    #[test]
    fn invalid_state_message_names_action_and_status() {
        let err = ExchangeError::InvalidTradeState {
            status: TradeStatus::Pending,
            action: TradeAction::MarkDelivered,
        };
        assert_eq!(err.to_string(), "cannot mark-delivered a trade that is pending");
        assert_eq!(err.kind(), ErrorKind::InvalidTradeState);
    }
}
