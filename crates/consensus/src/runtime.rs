//! Async protocol driver - one tokio task per replica
//!
//! Each task owns its `Replica` exclusively and reads encoded frames from an
//! ordered inbox. The driver acts as a per-epoch barrier: it waits for every
//! replica up to the round timeout, then closes the round. Frames that arrive
//! after their deadline, or for an epoch already closed, are dropped.

use crate::config::{synthetic_transactions, ProtocolConfig};
use crate::error::ConsensusError;
use crate::replica::Replica;
use crate::report::{reserved_epochs, EpochReport, SimulationReport};
use crate::types::{
    epoch_leader, short_hash, BlockHash, Epoch, ReplicaId, ReplicaStats, WireMessage,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Commands buffered per replica before the driver blocks
const INBOX_CAPACITY: usize = 1024;

/// Encoded `WireMessage` frames
type Frames = Vec<Vec<u8>>;

/// Leader output for one epoch
#[derive(Debug)]
struct Proposed {
    hash: BlockHash,
    proposal: Vec<u8>,
    votes: Frames,
}

enum Command {
    /// Build, adopt and encode a block. `claim_as` is the proposer written on the envelope.
    Propose {
        epoch: Epoch,
        transactions: Vec<String>,
        claim_as: ReplicaId,
        deadline: Instant,
        reply: oneshot::Sender<Option<Proposed>>,
    },
    /// Apply a proposal or vote frame; reply with any votes it produced
    Deliver {
        frame: Vec<u8>,
        deadline: Instant,
        reply: oneshot::Sender<Frames>,
    },
    /// No further frames for this epoch (or earlier) are applied
    CloseRound(Epoch),
}

struct ReplicaTask {
    replica: Replica,
    stats: Arc<RwLock<ReplicaStats>>,
    closed_through: Option<Epoch>,
}

impl ReplicaTask {
    fn new(replica: Replica, stats: Arc<RwLock<ReplicaStats>>) -> Self {
        Self {
            replica,
            stats,
            closed_through: None,
        }
    }

    /// Process commands until cancelled or the driver goes away.
    /// A command is always handled to completion before cancellation is observed.
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Replica {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        tracing::info!("Replica {} stopped", self.replica.id());
        self.replica
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Propose {
                epoch,
                transactions,
                claim_as,
                deadline,
                reply,
            } => {
                let proposed = self.propose(epoch, transactions, claim_as, deadline);
                self.publish_stats();
                let _ = reply.send(proposed);
            }
            Command::Deliver {
                frame,
                deadline,
                reply,
            } => {
                self.deliver(&frame, deadline);
                let votes = self.drain_outbox();
                self.publish_stats();
                let _ = reply.send(votes);
            }
            Command::CloseRound(epoch) => {
                self.closed_through = Some(self.closed_through.map_or(epoch, |c| c.max(epoch)));
            }
        }
    }

    /// Snapshot is written before replying so the driver never reads a stale one
    fn publish_stats(&self) {
        *self.stats.write() = self.replica.stats();
    }

    fn is_closed(&self, epoch: Epoch) -> bool {
        self.closed_through.is_some_and(|closed| epoch <= closed)
    }

    /// A request read after its deadline leaves the chain untouched
    fn propose(
        &mut self,
        epoch: Epoch,
        transactions: Vec<String>,
        claim_as: ReplicaId,
        deadline: Instant,
    ) -> Option<Proposed> {
        if self.is_closed(epoch) || Instant::now() >= deadline {
            tracing::warn!(
                "Replica {} asked too late to propose for epoch {}",
                self.replica.id(),
                epoch
            );
            return None;
        }

        let block = self.replica.propose_block(epoch, transactions);
        let envelope = WireMessage::Proposal {
            block: block.as_ref().clone(),
            proposer: claim_as,
        };

        match envelope.to_bytes() {
            Ok(proposal) => Some(Proposed {
                hash: block.hash().to_string(),
                proposal,
                votes: self.drain_outbox(),
            }),
            Err(e) => {
                let id = self.replica.id();
                tracing::error!("Replica {} failed to encode proposal: {}", id, e);
                None
            }
        }
    }

    fn deliver(&mut self, frame: &[u8], deadline: Instant) {
        let id = self.replica.id();
        let message = match WireMessage::from_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Replica {} dropped malformed frame: {}", id, e);
                return;
            }
        };

        let epoch = message.epoch();
        if self.is_closed(epoch) || Instant::now() >= deadline {
            tracing::warn!("Replica {} dropped late message for epoch {}", id, epoch);
            return;
        }

        match message {
            WireMessage::Proposal { block, proposer } => {
                if !block.hash_matches_content() {
                    tracing::warn!(
                        "Replica {} dropped block {} with mismatched hash",
                        id,
                        short_hash(block.hash())
                    );
                    return;
                }
                self.replica.receive_proposal(Arc::new(block), proposer);
            }
            WireMessage::Vote(vote) => {
                self.replica.receive_vote(&vote);
            }
        }
    }

    fn drain_outbox(&mut self) -> Frames {
        let id = self.replica.id();
        self.replica
            .take_outbox()
            .into_iter()
            .filter_map(|vote| match WireMessage::Vote(vote).to_bytes() {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::error!("Replica {} failed to encode vote: {}", id, e);
                    None
                }
            })
            .collect()
    }
}

/// Driver-side handle to one replica task
struct ReplicaHandle {
    id: ReplicaId,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    stats: Arc<RwLock<ReplicaStats>>,
    task: JoinHandle<Replica>,
}

impl ReplicaHandle {
    async fn deliver(
        &self,
        frame: Vec<u8>,
        deadline: Instant,
    ) -> Option<oneshot::Receiver<Frames>> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Deliver {
            frame,
            deadline,
            reply,
        };
        match self.commands.send(command).await {
            Ok(()) => Some(rx),
            Err(_) => {
                tracing::debug!("Replica {} has stopped, skipping delivery", self.id);
                None
            }
        }
    }
}

/// Protocol driver running every replica as an independent task
pub struct AsyncProtocol {
    config: ProtocolConfig,
    handles: Vec<ReplicaHandle>,
    votes_cast: AtomicU64,
}

impl AsyncProtocol {
    /// Spawn one task per replica. Must be called within a tokio runtime.
    pub fn spawn(config: ProtocolConfig) -> Result<Self, ConsensusError> {
        config.validate()?;

        let mut handles = Vec::with_capacity(config.replicas);
        for id in 0..config.replicas as ReplicaId {
            let replica = Replica::new(id, config.replicas)?;
            let stats = Arc::new(RwLock::new(replica.stats()));
            let (commands, inbox) = mpsc::channel(INBOX_CAPACITY);
            let (shutdown, shutdown_rx) = watch::channel(false);

            let task = ReplicaTask::new(replica, stats.clone());
            let task = tokio::spawn(task.run(inbox, shutdown_rx));

            handles.push(ReplicaHandle {
                id,
                commands,
                shutdown,
                stats,
                task,
            });
        }

        tracing::info!(
            "Spawned {} replica tasks (round timeout {}ms)",
            config.replicas,
            config.round_timeout_ms
        );

        Ok(Self {
            config,
            handles,
            votes_cast: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn epoch_leader(&self, epoch: Epoch) -> ReplicaId {
        epoch_leader(epoch, self.handles.len())
    }

    /// Run one epoch as a barrier, then close it on every replica.
    /// Returns the proposed block's hash, or `None` if there was no proposal.
    pub async fn run_epoch(&self, epoch: Epoch, transactions: Vec<String>) -> Option<BlockHash> {
        let outcome = self.drive_round(epoch, transactions).await;

        for handle in &self.handles {
            let _ = handle.commands.send(Command::CloseRound(epoch)).await;
        }

        outcome
    }

    async fn drive_round(&self, epoch: Epoch, transactions: Vec<String>) -> Option<BlockHash> {
        let leader = self.epoch_leader(epoch);
        if self.config.is_silent(leader) {
            tracing::info!("Leader {} is silent in epoch {}", leader, epoch);
            return None;
        }

        let deadline = Instant::now() + self.config.round_timeout();
        let (reply, rx) = oneshot::channel();
        let command = Command::Propose {
            epoch,
            transactions,
            claim_as: self.config.claimed_proposer(leader),
            deadline,
            reply,
        };
        if self.handles.get(leader as usize)?.commands.send(command).await.is_err() {
            tracing::warn!("Leader {} has stopped, no proposal in epoch {}", leader, epoch);
            return None;
        }

        let proposed = match timeout_at(deadline, rx).await {
            Ok(Ok(Some(proposed))) => proposed,
            Ok(_) => {
                tracing::warn!("Leader {} produced no proposal for epoch {}", leader, epoch);
                return None;
            }
            Err(_) => {
                tracing::warn!("Leader {} timed out proposing for epoch {}", leader, epoch);
                return None;
            }
        };

        let mut votes: Vec<(ReplicaId, Vec<u8>)> =
            proposed.votes.into_iter().map(|frame| (leader, frame)).collect();

        // Proposal phase
        let mut pending = Vec::new();
        for handle in self.participants().filter(|h| h.id != leader) {
            if let Some(rx) = handle.deliver(proposed.proposal.clone(), deadline).await {
                pending.push((handle.id, rx));
            }
        }
        for (id, frames) in collect_acks(pending, deadline, epoch).await {
            votes.extend(frames.into_iter().map(|frame| (id, frame)));
        }

        self.votes_cast.fetch_add(votes.len() as u64, Ordering::Relaxed);

        // Vote relay phase
        if self.config.relay_votes {
            let deadline = Instant::now() + self.config.round_timeout();
            let mut pending = Vec::new();
            for handle in self.participants() {
                for (_, frame) in votes.iter().filter(|(from, _)| *from != handle.id) {
                    if let Some(rx) = handle.deliver(frame.clone(), deadline).await {
                        pending.push((handle.id, rx));
                    }
                }
            }
            collect_acks(pending, deadline, epoch).await;
        }

        Some(proposed.hash)
    }

    fn participants(&self) -> impl Iterator<Item = &ReplicaHandle> {
        self.handles
            .iter()
            .filter(|handle| !self.config.is_silent(handle.id))
    }

    /// Run epochs `1..=epochs` with synthetic transactions
    pub async fn run_simulation(
        &self,
        epochs: u64,
        transactions_per_epoch: usize,
    ) -> SimulationReport {
        let mut reports = Vec::with_capacity(reserved_epochs(epochs));
        let votes_before = self.votes_cast();

        for epoch in 1..=epochs {
            let leader = self.epoch_leader(epoch);
            let hash = self
                .run_epoch(epoch, synthetic_transactions(epoch, transactions_per_epoch))
                .await;

            let report = EpochReport::new(epoch, leader, hash, self.stats());
            report.log();
            reports.push(report);
        }

        let votes_cast = self.votes_cast() - votes_before;
        let summary = SimulationReport::new(reports, self.stats(), votes_cast);
        summary.log_summary();
        summary
    }

    /// Latest published snapshot of every replica
    pub fn stats(&self) -> Vec<ReplicaStats> {
        self.handles.iter().map(|h| h.stats.read().clone()).collect()
    }

    /// Votes collected by the driver since spawn
    pub fn votes_cast(&self) -> u64 {
        self.votes_cast.load(Ordering::Relaxed)
    }

    /// Stop one replica. Its state stays intact; it just stops participating.
    pub fn cancel(&self, id: ReplicaId) -> Result<(), ConsensusError> {
        let handle = self
            .handles
            .get(id as usize)
            .ok_or(ConsensusError::ReplicaOutOfRange {
                id,
                total: self.handles.len(),
            })?;

        handle
            .shutdown
            .send(true)
            .map_err(|_| ConsensusError::ReplicaStopped(id))?;
        tracing::info!("Cancelling replica {}", id);
        Ok(())
    }

    pub fn is_running(&self, id: ReplicaId) -> bool {
        self.handles
            .get(id as usize)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Cancel every replica and wait for the tasks, returning their final stats
    pub async fn shutdown(self) -> Vec<ReplicaStats> {
        for handle in &self.handles {
            let _ = handle.shutdown.send(true);
        }

        let mut stats = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.task.await {
                Ok(replica) => stats.push(replica.stats()),
                Err(e) => {
                    tracing::error!("Replica {} task failed: {}", handle.id, e);
                    stats.push(handle.stats.read().clone());
                }
            }
        }
        stats
    }
}

async fn collect_acks(
    pending: Vec<(ReplicaId, oneshot::Receiver<Frames>)>,
    deadline: Instant,
    epoch: Epoch,
) -> Vec<(ReplicaId, Frames)> {
    let mut acks = Vec::with_capacity(pending.len());
    for (id, rx) in pending {
        match timeout_at(deadline, rx).await {
            Ok(Ok(frames)) => acks.push((id, frames)),
            Ok(Err(_)) => {
                tracing::warn!("Replica {} stopped before acknowledging epoch {}", id, epoch)
            }
            Err(_) => tracing::warn!("Replica {} missed the epoch {} deadline", id, epoch),
        }
    }
    acks
}
