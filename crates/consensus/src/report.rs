//! Read-only projections of replica progress

use crate::types::{short_hash, BlockHash, Epoch, ReplicaId, ReplicaStats};
use serde::Serialize;
use std::collections::BTreeMap;

/// Upper bound on report slots reserved before a run starts
const MAX_RESERVED_EPOCHS: u64 = 1024;

/// Capacity to reserve for `epochs` epoch reports
pub(crate) fn reserved_epochs(epochs: u64) -> usize {
    epochs.min(MAX_RESERVED_EPOCHS) as usize
}

/// State of every replica after one epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: Epoch,
    pub leader: ReplicaId,
    /// `None` if the leader proposed nothing
    pub block_hash: Option<BlockHash>,
    pub replicas: Vec<ReplicaStats>,
}

impl EpochReport {
    pub fn new(
        epoch: Epoch,
        leader: ReplicaId,
        block_hash: Option<BlockHash>,
        replicas: Vec<ReplicaStats>,
    ) -> Self {
        Self {
            epoch,
            leader,
            block_hash,
            replicas,
        }
    }

    pub fn log(&self) {
        match &self.block_hash {
            Some(hash) => tracing::info!(
                "Epoch {}: leader {} proposed {}",
                self.epoch,
                self.leader,
                short_hash(hash)
            ),
            None => tracing::info!("Epoch {}: leader {} proposed nothing", self.epoch, self.leader),
        }
        for stats in &self.replicas {
            tracing::info!(
                "  Replica {} blocks={} finalized={} notarized={}",
                stats.replica_id,
                stats.total_blocks,
                stats.finalized_blocks,
                stats.notarized_blocks
            );
        }
    }
}

/// Network-wide counters for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusMetrics {
    /// Epochs in which the leader produced a block
    pub blocks_proposed: u64,
    /// Votes emitted by all replicas, the leader's own vote included
    pub votes_cast: u64,
    /// Most notarized blocks on any replica, genesis excluded
    pub blocks_notarized: usize,
    /// Longest finalized sequence on any replica
    pub blocks_finalized: usize,
}

impl ConsensusMetrics {
    fn collect(epochs: &[EpochReport], final_stats: &[ReplicaStats], votes_cast: u64) -> Self {
        Self {
            blocks_proposed: epochs.iter().filter(|e| e.block_hash.is_some()).count() as u64,
            votes_cast,
            blocks_notarized: final_stats
                .iter()
                .map(|s| s.notarized_blocks.saturating_sub(1))
                .max()
                .unwrap_or(0),
            blocks_finalized: final_stats
                .iter()
                .map(|s| s.finalized_blocks)
                .max()
                .unwrap_or(0),
        }
    }
}

/// Outcome of a full simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub epochs: Vec<EpochReport>,
    pub final_stats: Vec<ReplicaStats>,
    pub finalized_per_replica: BTreeMap<ReplicaId, usize>,
    pub metrics: ConsensusMetrics,
}

impl SimulationReport {
    pub fn new(epochs: Vec<EpochReport>, final_stats: Vec<ReplicaStats>, votes_cast: u64) -> Self {
        let finalized_per_replica = final_stats
            .iter()
            .map(|s| (s.replica_id, s.finalized_blocks))
            .collect();
        let metrics = ConsensusMetrics::collect(&epochs, &final_stats, votes_cast);
        Self {
            epochs,
            final_stats,
            finalized_per_replica,
            metrics,
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("Finalized blocks per replica:");
        for (id, finalized) in &self.finalized_per_replica {
            tracing::info!("  Replica {}: {}", id, finalized);
        }
        tracing::info!(
            "Proposed={} votes={} notarized={} finalized={}",
            self.metrics.blocks_proposed,
            self.metrics.votes_cast,
            self.metrics.blocks_notarized,
            self.metrics.blocks_finalized
        );
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalized_per_replica() {
        let stats = vec![
            ReplicaStats {
                replica_id: 0,
                total_blocks: 3,
                finalized_blocks: 1,
                notarized_blocks: 2,
                latest_epoch: 2,
            },
            ReplicaStats {
                replica_id: 1,
                total_blocks: 3,
                finalized_blocks: 2,
                notarized_blocks: 3,
                latest_epoch: 2,
            },
        ];
        let epochs = vec![
            EpochReport::new(1, 1, Some("aa".to_string()), stats.clone()),
            EpochReport::new(2, 2, None, stats.clone()),
        ];
        let report = SimulationReport::new(epochs, stats, 7);
        assert_eq!(report.finalized_per_replica.get(&0), Some(&1));
        assert_eq!(report.finalized_per_replica.get(&1), Some(&2));
        assert_eq!(
            report.metrics,
            ConsensusMetrics {
                blocks_proposed: 1,
                votes_cast: 7,
                blocks_notarized: 2,
                blocks_finalized: 2,
            }
        );

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["final_stats"][1]["finalized_blocks"], 2);
        assert_eq!(json["metrics"]["votes_cast"], 7);
    }

    #[test]
    fn test_empty_run_metrics() {
        let report = SimulationReport::new(Vec::new(), Vec::new(), 0);
        assert_eq!(report.metrics, ConsensusMetrics::default());
    }

    #[test]
    fn test_reservation_is_bounded() {
        assert_eq!(reserved_epochs(6), 6);
        assert_eq!(reserved_epochs(u64::MAX), MAX_RESERVED_EPOCHS as usize);
        let reports: Vec<EpochReport> = Vec::with_capacity(reserved_epochs(u64::MAX));
        assert!(reports.capacity() >= MAX_RESERVED_EPOCHS as usize);
    }
}
