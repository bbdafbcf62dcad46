//! Replica - one participant's view of the chain, votes and finality
//!
//! Block lifecycle inside a replica is monotone:
//! unknown -> adopted -> notarized -> finalized.

use crate::error::{ConsensusError, RejectReason};
use crate::types::{
    epoch_leader, quorum_threshold, short_hash, Block, BlockHash, Epoch, Message, MessageKind,
    ReplicaId, ReplicaStats,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Streamlet replica state machine
pub struct Replica {
    /// This replica's id
    id: ReplicaId,
    /// Total replicas (n)
    total: usize,
    /// Votes needed to notarize
    threshold: usize,
    /// Genesis, shared by every replica
    genesis: Arc<Block>,
    /// Adopted blocks in adoption order
    chain: Vec<Arc<Block>>,
    /// Block registry
    blocks: HashMap<BlockHash, Arc<Block>>,
    /// epoch -> block hash -> voters
    votes: HashMap<Epoch, HashMap<BlockHash, HashSet<ReplicaId>>>,
    notarized: HashSet<BlockHash>,
    /// Finalized blocks, append-only
    finalized: Vec<Arc<Block>>,
    finalized_hashes: HashSet<BlockHash>,
    /// Votes this replica has cast and not yet handed to a driver
    outbox: Vec<Message>,
}

impl Replica {
    /// Create a replica holding only the (notarized) genesis block
    pub fn new(id: ReplicaId, total: usize) -> Result<Self, ConsensusError> {
        if total == 0 {
            return Err(ConsensusError::NoReplicas);
        }
        if id as usize >= total {
            return Err(ConsensusError::ReplicaOutOfRange { id, total });
        }

        let genesis = Arc::new(Block::genesis());
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash().to_string(), genesis.clone());
        let mut notarized = HashSet::new();
        notarized.insert(genesis.hash().to_string());

        Ok(Self {
            id,
            total,
            threshold: quorum_threshold(total),
            chain: vec![genesis.clone()],
            genesis,
            blocks,
            votes: HashMap::new(),
            notarized,
            finalized: Vec::new(),
            finalized_hashes: HashSet::new(),
            outbox: Vec::new(),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn total_replicas(&self) -> usize {
        self.total
    }

    /// Votes needed to notarize a block
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Leader of `epoch`; every replica computes the same value
    pub fn epoch_leader(&self, epoch: Epoch) -> ReplicaId {
        epoch_leader(epoch, self.total)
    }

    /// Most recently adopted block.
    ///
    /// This is the tail of the adoption order, not the deepest notarized tip.
    /// The two only coincide while no competing proposals exist.
    pub fn chain_head(&self) -> &Arc<Block> {
        self.chain.last().unwrap_or(&self.genesis)
    }

    /// Build a block extending the chain head and adopt it immediately.
    /// Only meaningful for the epoch's leader.
    pub fn propose_block(&mut self, epoch: Epoch, transactions: Vec<String>) -> Arc<Block> {
        let parent = self.chain_head().hash().to_string();
        let block = Arc::new(Block::new(epoch, parent, transactions, self.id));

        tracing::info!(
            "Replica {} proposing block {} for epoch {} ({} txs)",
            self.id,
            short_hash(block.hash()),
            epoch,
            block.transactions().len()
        );

        self.receive_proposal(block.clone(), self.id);
        block
    }

    /// Check a proposal without touching state
    pub fn validate_proposal(block: &Block, proposer: ReplicaId) -> Result<(), RejectReason> {
        if !block.is_valid() {
            return Err(RejectReason::InvalidBlock);
        }
        if block.proposer() != Some(proposer) {
            return Err(RejectReason::ProposerMismatch {
                claimed: proposer,
                embedded: block.proposer(),
            });
        }
        Ok(())
    }

    /// Adopt and vote for a proposal. Returns false, with no state change,
    /// if the block is invalid or `proposer` is not its embedded proposer.
    pub fn receive_proposal(&mut self, block: Arc<Block>, proposer: ReplicaId) -> bool {
        if let Err(reason) = Self::validate_proposal(&block, proposer) {
            tracing::warn!(
                "Replica {} rejected block {} for epoch {}: {}",
                self.id,
                short_hash(block.hash()),
                block.epoch(),
                reason
            );
            return false;
        }

        let hash = block.hash().to_string();
        let epoch = block.epoch();

        // Re-delivery of an adopted block must not grow the chain
        if self.blocks.contains_key(&hash) {
            tracing::debug!("Replica {} already adopted block {}", self.id, short_hash(&hash));
            return true;
        }

        self.blocks.insert(hash.clone(), block.clone());
        self.chain.push(block);
        tracing::debug!(
            "Replica {} adopted block {} for epoch {} (chain length {})",
            self.id,
            short_hash(&hash),
            epoch,
            self.chain.len()
        );

        self.cast_vote(&hash, epoch);
        self.outbox.push(Message::vote(self.id, epoch, hash));
        true
    }

    /// Record this replica's own vote for `block_hash` in `epoch`
    pub fn cast_vote(&mut self, block_hash: &str, epoch: Epoch) {
        self.record_vote(self.id, block_hash, epoch);
    }

    /// Apply a vote relayed from a peer. Returns true if it was newly recorded.
    pub fn receive_vote(&mut self, message: &Message) -> bool {
        if message.kind != MessageKind::Vote {
            return false;
        }
        if message.sender as usize >= self.total {
            tracing::warn!(
                "Replica {} ignoring vote from unknown replica {}",
                self.id,
                message.sender
            );
            return false;
        }
        self.record_vote(message.sender, &message.block_hash, message.epoch)
    }

    fn record_vote(&mut self, voter: ReplicaId, block_hash: &str, epoch: Epoch) -> bool {
        // Notarized hashes must stay inside the registry
        if !self.blocks.contains_key(block_hash) {
            tracing::debug!(
                "Replica {} ignoring vote for unknown block {}",
                self.id,
                short_hash(block_hash)
            );
            return false;
        }

        let voters = self
            .votes
            .entry(epoch)
            .or_default()
            .entry(block_hash.to_string())
            .or_default();
        let fresh = voters.insert(voter);
        let count = voters.len();

        if fresh {
            tracing::debug!(
                "Replica {} recorded vote from {} for block {} ({}/{})",
                self.id,
                voter,
                short_hash(block_hash),
                count,
                self.threshold
            );
        }

        if count >= self.threshold && self.notarized.insert(block_hash.to_string()) {
            tracing::info!(
                "Replica {} notarized block {} in epoch {} with {} votes",
                self.id,
                short_hash(block_hash),
                epoch,
                count
            );
        }

        self.check_finalization();
        fresh
    }

    /// Finalize the penultimate adopted block once it and the tail are both notarized
    pub fn check_finalization(&mut self) {
        let [.., prev, last] = self.chain.as_slice() else {
            return;
        };

        if self.notarized.contains(last.hash())
            && self.notarized.contains(prev.hash())
            && self.finalized_hashes.insert(prev.hash().to_string())
        {
            self.finalized.push(prev.clone());
            tracing::info!(
                "Replica {} finalized block {} from epoch {} ({} finalized)",
                self.id,
                short_hash(prev.hash()),
                prev.epoch(),
                self.finalized.len()
            );
        }
    }

    /// Hand over votes cast since the last call
    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn chain(&self) -> &[Arc<Block>] {
        &self.chain
    }

    pub fn finalized(&self) -> &[Arc<Block>] {
        &self.finalized
    }

    pub fn block(&self, hash: &str) -> Option<&Arc<Block>> {
        self.blocks.get(hash)
    }

    pub fn is_notarized(&self, hash: &str) -> bool {
        self.notarized.contains(hash)
    }

    pub fn is_finalized(&self, hash: &str) -> bool {
        self.finalized_hashes.contains(hash)
    }

    /// Number of distinct voters for `hash` in `epoch`
    pub fn vote_count(&self, epoch: Epoch, hash: &str) -> usize {
        self.votes
            .get(&epoch)
            .and_then(|by_hash| by_hash.get(hash))
            .map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            replica_id: self.id,
            total_blocks: self.chain.len(),
            finalized_blocks: self.finalized.len(),
            notarized_blocks: self.notarized.len(),
            latest_epoch: self.chain_head().epoch(),
        }
    }
}
