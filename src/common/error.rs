use thiserror::Error;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("Escrow-Error | Other - {0}")]
    Simple(String),

    #[error("Escrow-Error | InvalidStateTransition - from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Escrow-Error | UnexpectedPhase - {trigger} not expected in phase {phase}")]
    UnexpectedPhase { trigger: String, phase: String },

    #[error("Escrow-Error | ContractHashMismatch - expected {expected}, received {received}")]
    ContractHashMismatch { expected: String, received: String },

    #[error("Escrow-Error | DataIntegrity - {0}")]
    DataIntegrity(String),

    #[error(
        "Escrow-Error | InsufficientFunds - required {required} sat, available {available} sat"
    )]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Escrow-Error | MessageDelivery - {0}")]
    MessageDelivery(String),

    #[error("Escrow-Error | Broadcast - {0}")]
    Broadcast(String),

    #[error("Escrow-Error | DisallowedPayload - {0}")]
    DisallowedPayload(String),

    #[error("Escrow-Error | Persistence - {0}")]
    Persistence(String),

    #[error("Escrow-Error | Timeout - {0}")]
    Timeout(String),

    #[error("Escrow-Error | TaskFailed - {0}")]
    TaskFailed(String),

    #[error("Escrow-Error | Io - {0}")]
    Io(#[from] std::io::Error),

    #[error("Escrow-Error | SerdesJson - {0}")]
    SerdesJson(#[from] serde_json::Error),

    #[error("Escrow-Error | Bincode - {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Escrow-Error | Secp256k1 - {0}")]
    Secp256k1(#[from] secp256k1::Error),

    #[error("Escrow-Error | MpscSend - {0}")]
    MpscSend(String),

    #[error("Escrow-Error | OneshotRecv - {0}")]
    OneshotRecv(#[from] tokio::sync::oneshot::error::RecvError),

    #[error("Escrow-Error | Join - {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EscrowError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> EscrowError {
        EscrowError::MpscSend(e.to_string())
    }
}

impl EscrowError {
    /// Errors that stem from the counterparty handing us data that does not add up.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            EscrowError::DataIntegrity(_) | EscrowError::ContractHashMismatch { .. }
        )
    }
}
