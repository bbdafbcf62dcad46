//! Streamlet consensus - epoch-based, leader-rotating BFT agreement
//!
//! Architecture:
//! - Each epoch has one round-robin leader that extends its chain head
//! - Every replica validates the proposal and votes for it
//! - A block with 2f+1 votes is notarized
//! - A notarized block directly followed by another notarized block is final
//!
//! `StreamletProtocol` runs all replicas synchronously in-process;
//! `AsyncProtocol` runs one tokio task per replica behind a round barrier.

pub mod config;
pub mod error;
pub mod protocol;
pub mod replica;
pub mod report;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{synthetic_transactions, Fault, ProtocolConfig, SimulationConfig};
pub use error::{ConsensusError, RejectReason};
pub use protocol::StreamletProtocol;
pub use replica::Replica;
pub use report::{ConsensusMetrics, EpochReport, SimulationReport};
pub use runtime::AsyncProtocol;
pub use types::*;
