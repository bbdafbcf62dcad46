//! Consensus errors

use crate::types::ReplicaId;
use thiserror::Error;

/// Errors surfaced by replica construction, configuration and the drivers
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Replica count must be at least 1")]
    NoReplicas,

    #[error("Replica {id} out of range for {total} replicas")]
    ReplicaOutOfRange { id: ReplicaId, total: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Wire codec error: {0}")]
    Codec(#[from] borsh::io::Error),

    #[error("Replica {0} has stopped")]
    ReplicaStopped(ReplicaId),
}

/// Why a replica refused a proposal. Logged, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Block failed validity check")]
    InvalidBlock,

    #[error("Proposer mismatch: claimed {claimed}, block carries {embedded:?}")]
    ProposerMismatch {
        claimed: ReplicaId,
        embedded: Option<ReplicaId>,
    },
}
