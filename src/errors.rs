// src/errors.rs
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

/// Closed rejection taxonomy for transaction validation. Every reason a
/// transaction can be refused before any state change is one of these
/// variants; callers must not retry a rejected transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRejection {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("amount must be a positive integer")]
    BadAmount,

    #[error("signature verification failed")]
    BadSignature,

    #[error("transaction id does not match signed payload")]
    BadTxId,

    #[error("signer public key does not derive the from account")]
    FromMismatch,

    #[error("bad nonce: got {got}, expected {expected}")]
    BadNonce { got: u64, expected: u64 },

    #[error("insufficient balance: available {available}, need {needed}")]
    InsufficientBalance { available: i64, needed: i64 },

    #[error("escrow release must be signed by the leader key")]
    NotLeader,

    #[error("bad escrow account: {0}")]
    BadEscrowAccount(String),

    #[error("duplicate transaction {0}")]
    DuplicateTx(String),

    #[error("mint is only valid as the genesis entry of an empty log")]
    MintNotAllowed,

    #[error("log entry out of order: got seq {got}, expected {expected}")]
    OutOfOrder { got: u64, expected: u64 },
}

/// Node-level errors surfaced by the coordinator and the stores.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transaction rejected: {0}")]
    Rejected(#[from] TxRejection),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("bad key material: {0}")]
    BadKeyMaterial(String),

    #[error("unknown capsule: {0}")]
    UnknownCapsule(String),

    #[error("capsule content does not match its asset id: {0}")]
    CapsuleTampered(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task is no longer open for bids")]
    TaskNotOpen,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<String> for MeshError {
    fn from(s: String) -> Self {
        MeshError::Storage(s)
    }
}
