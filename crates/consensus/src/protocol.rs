//! Synchronous protocol driver
//!
//! Runs every replica in-process. Each epoch completes, including vote
//! relay, before the next one starts.

use crate::config::{synthetic_transactions, Fault, ProtocolConfig};
use crate::error::ConsensusError;
use crate::replica::Replica;
use crate::report::{reserved_epochs, EpochReport, SimulationReport};
use crate::types::{short_hash, Block, Epoch, Message, ReplicaId, ReplicaStats};
use std::sync::Arc;

/// Drives epochs across all replicas by direct calls
pub struct StreamletProtocol {
    replicas: Vec<Replica>,
    config: ProtocolConfig,
    votes_cast: u64,
}

impl StreamletProtocol {
    /// Create replicas `0..n`
    pub fn new(config: ProtocolConfig) -> Result<Self, ConsensusError> {
        config.validate()?;
        let replicas = (0..config.replicas)
            .map(|id| Replica::new(id as ReplicaId, config.replicas))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            "Streamlet protocol with {} replicas (quorum {}, vote relay {})",
            config.replicas,
            replicas.first().map_or(1, Replica::threshold),
            if config.relay_votes { "on" } else { "off" }
        );

        Ok(Self {
            replicas,
            config,
            votes_cast: 0,
        })
    }

    /// `n` honest replicas with default settings
    pub fn with_replicas(n: usize) -> Result<Self, ConsensusError> {
        Self::new(ProtocolConfig::with_replicas(n))
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.get(id as usize)
    }

    /// Leader of `epoch` as computed by any replica
    pub fn epoch_leader(&self, epoch: Epoch) -> ReplicaId {
        self.replicas.first().map_or(0, |r| r.epoch_leader(epoch))
    }

    /// Run one epoch. Returns the leader's block, or `None` if it stayed silent.
    pub fn run_epoch(&mut self, epoch: Epoch, transactions: Vec<String>) -> Option<Arc<Block>> {
        let leader = self.epoch_leader(epoch);
        let config = &self.config;

        if config.is_silent(leader) {
            tracing::info!("Leader {} is silent in epoch {}", leader, epoch);
            return None;
        }

        let block = self
            .replicas
            .get_mut(leader as usize)?
            .propose_block(epoch, transactions);
        let claimed = config.claimed_proposer(leader);
        if config.fault_of(leader) == Some(Fault::Misattribute) {
            tracing::info!(
                "Leader {} delivers block {} as replica {}",
                leader,
                short_hash(block.hash()),
                claimed
            );
        }

        // Deliver to everyone but the leader, which already adopted it
        for replica in self.replicas.iter_mut() {
            if replica.id() == leader || config.is_silent(replica.id()) {
                continue;
            }
            if !replica.receive_proposal(block.clone(), claimed) {
                tracing::debug!("Replica {} did not vote in epoch {}", replica.id(), epoch);
            }
        }

        let votes: Vec<Message> = self
            .replicas
            .iter_mut()
            .flat_map(Replica::take_outbox)
            .collect();
        self.votes_cast += votes.len() as u64;
        if config.relay_votes {
            relay_votes(&mut self.replicas, &votes);
        }

        Some(block)
    }

    /// Run epochs `1..=epochs` with synthetic transactions, logging a summary after each
    pub fn run_simulation(
        &mut self,
        epochs: u64,
        transactions_per_epoch: usize,
    ) -> SimulationReport {
        let mut reports = Vec::with_capacity(reserved_epochs(epochs));
        let votes_before = self.votes_cast;

        for epoch in 1..=epochs {
            let leader = self.epoch_leader(epoch);
            let transactions = synthetic_transactions(epoch, transactions_per_epoch);
            let block = self.run_epoch(epoch, transactions);

            let report = EpochReport::new(
                epoch,
                leader,
                block.map(|b| b.hash().to_string()),
                self.stats(),
            );
            report.log();
            reports.push(report);
        }

        let votes_cast = self.votes_cast - votes_before;
        let summary = SimulationReport::new(reports, self.stats(), votes_cast);
        summary.log_summary();
        summary
    }

    pub fn stats(&self) -> Vec<ReplicaStats> {
        self.replicas.iter().map(Replica::stats).collect()
    }

    /// Votes emitted by all replicas since the driver was created
    pub fn votes_cast(&self) -> u64 {
        self.votes_cast
    }

    /// True if every pair of replicas agrees on the finalized blocks they share,
    /// i.e. one finalized sequence is a prefix of the other.
    pub fn consistency_holds(&self) -> bool {
        self.replicas.iter().enumerate().all(|(i, a)| {
            self.replicas[i + 1..]
                .iter()
                .all(|b| prefix_compatible(a.finalized(), b.finalized()))
        })
    }
}

fn prefix_compatible(a: &[Arc<Block>], b: &[Arc<Block>]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.hash() == y.hash())
}

fn relay_votes(replicas: &mut [Replica], votes: &[Message]) {
    for replica in replicas.iter_mut() {
        let id = replica.id();
        for vote in votes.iter().filter(|v| v.sender != id) {
            replica.receive_vote(vote);
        }
    }
}
