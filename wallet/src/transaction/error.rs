//! Errors raised while negotiating a transaction.

use thiserror::Error;

use super::parameters::ParameterError;
use super::types::TxFailureReason;
use crate::keykeeper::KeeperError;
use crate::storage::DbError;

#[derive(Debug, Error)]
pub enum TxError {
    /// A protocol-level failure with a reason the user (and the peer) sees.
    #[error("{0}")]
    Failed(TxFailureReason),

    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("key keeper error: {0}")]
    Keeper(#[from] KeeperError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl TxError {
    /// Reason recorded on the transaction when this error ends it.
    pub fn reason(&self) -> TxFailureReason {
        match self {
            TxError::Failed(reason) => *reason,
            TxError::Parameter(_) => TxFailureReason::InvalidParameters,
            TxError::Keeper(KeeperError::State(_)) => TxFailureReason::NonceUnavailable,
            TxError::Keeper(_) => TxFailureReason::KeyKeeperError,
            TxError::Storage(_) => TxFailureReason::Unknown,
        }
    }

    /// Whether the peer should hear about this failure. A failed send is
    /// not worth repeating over the same channel.
    pub fn notify_peer(&self) -> bool {
        !matches!(self, TxError::Failed(TxFailureReason::FailedToSendParameters))
    }
}

impl From<TxFailureReason> for TxError {
    fn from(reason: TxFailureReason) -> Self {
        TxError::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::parameters::ParameterId;

    #[test]
    fn keeper_state_errors_mean_the_nonce_is_gone() {
        let err = TxError::from(KeeperError::State("consumed".into()));
        assert_eq!(err.reason(), TxFailureReason::NonceUnavailable);
        let err = TxError::from(KeeperError::Abandoned);
        assert_eq!(err.reason(), TxFailureReason::KeyKeeperError);
    }

    #[test]
    fn missing_parameter_is_invalid_parameters() {
        let err = TxError::from(ParameterError::Missing(ParameterId::AMOUNT));
        assert_eq!(err.reason(), TxFailureReason::InvalidParameters);
    }

    #[test]
    fn failed_send_is_not_echoed() {
        assert!(!TxError::Failed(TxFailureReason::FailedToSendParameters).notify_peer());
        assert!(TxError::Failed(TxFailureReason::InvalidPeerSignature).notify_peer());
    }
}
