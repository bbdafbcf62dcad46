//! Core types for blocks, votes and the replica wire envelope

use crate::error::ConsensusError;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Replica identifier, `0..n`
pub type ReplicaId = u32;

/// Epoch (round) number
pub type Epoch = u64;

/// Lowercase hex blake3 digest of a block's contents
pub type BlockHash = String;

/// Parent hash carried by the genesis block
pub const GENESIS_PARENT: &str = "GENESIS";

/// Placeholder transaction carried by the genesis block
pub const GENESIS_TRANSACTION: &str = "genesis";

/// Proposer value hashed for the genesis block, which has no proposer
const GENESIS_PROPOSER: i64 = -1;

/// Maximum number of Byzantine replicas tolerated by `total` replicas: floor((n - 1) / 3)
pub fn fault_tolerance(total: usize) -> usize {
    total.saturating_sub(1) / 3
}

/// Votes needed to notarize a block: max(1, 2f + 1)
pub fn quorum_threshold(total: usize) -> usize {
    (2 * fault_tolerance(total) + 1).max(1)
}

/// Round-robin leader for `epoch`. Returns 0 when `total` is 0.
pub fn epoch_leader(epoch: Epoch, total: usize) -> ReplicaId {
    epoch.checked_rem(total as u64).unwrap_or(0) as ReplicaId
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An immutable, content-addressed block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    epoch: Epoch,
    parent_hash: BlockHash,
    transactions: Vec<String>,
    /// `None` only for genesis
    proposer: Option<ReplicaId>,
    /// Creation time (unix millis)
    timestamp_ms: i64,
    hash: BlockHash,
}

impl Block {
    /// Create a block stamped with the current time
    pub fn new(
        epoch: Epoch,
        parent_hash: impl Into<BlockHash>,
        transactions: Vec<String>,
        proposer: ReplicaId,
    ) -> Self {
        Self::with_timestamp(epoch, parent_hash, transactions, Some(proposer), now_millis())
    }

    /// Create a block with an explicit creation time
    pub fn with_timestamp(
        epoch: Epoch,
        parent_hash: impl Into<BlockHash>,
        transactions: Vec<String>,
        proposer: Option<ReplicaId>,
        timestamp_ms: i64,
    ) -> Self {
        let parent_hash = parent_hash.into();
        let hash = compute_hash(epoch, &parent_hash, &transactions, proposer, timestamp_ms);
        Self {
            epoch,
            parent_hash,
            transactions,
            proposer,
            timestamp_ms,
            hash,
        }
    }

    /// The genesis block. Its timestamp is fixed so every replica derives the same hash.
    pub fn genesis() -> Self {
        Self::with_timestamp(
            0,
            GENESIS_PARENT,
            vec![GENESIS_TRANSACTION.to_string()],
            None,
            0,
        )
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn parent_hash(&self) -> &str {
        &self.parent_hash
    }

    pub fn transactions(&self) -> &[String] {
        &self.transactions
    }

    pub fn proposer(&self) -> Option<ReplicaId> {
        self.proposer
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.proposer.is_none() && self.parent_hash == GENESIS_PARENT
    }

    /// Structural validity: non-empty hash and a real proposer.
    ///
    /// Genesis is never valid as a proposal; replicas trust it a priori instead.
    pub fn is_valid(&self) -> bool {
        !self.hash.is_empty() && self.proposer.is_some()
    }

    /// Recompute the digest and compare it with the carried hash.
    /// Used on blocks decoded from the wire.
    pub fn hash_matches_content(&self) -> bool {
        compute_hash(
            self.epoch,
            &self.parent_hash,
            &self.transactions,
            self.proposer,
            self.timestamp_ms,
        ) == self.hash
    }
}

/// Canonical encoding fed to blake3. Variable-length fields are length-prefixed.
fn compute_hash(
    epoch: Epoch,
    parent_hash: &str,
    transactions: &[String],
    proposer: Option<ReplicaId>,
    timestamp_ms: i64,
) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&epoch.to_le_bytes());
    hasher.update(&(parent_hash.len() as u64).to_le_bytes());
    hasher.update(parent_hash.as_bytes());

    hasher.update(&(transactions.len() as u64).to_le_bytes());
    for tx in transactions {
        hasher.update(&(tx.len() as u64).to_le_bytes());
        hasher.update(tx.as_bytes());
    }

    let proposer = proposer.map_or(GENESIS_PROPOSER, i64::from);
    hasher.update(&proposer.to_le_bytes());
    hasher.update(&timestamp_ms.to_le_bytes());

    hasher.finalize().to_hex().to_string()
}

/// Kind of epoch-scoped action a message announces
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum MessageKind {
    Proposal,
    Vote,
}

/// Notification that `sender` proposed or voted for `block_hash` in `epoch`.
/// Carries no block; the receiver must already hold it.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: ReplicaId,
    pub epoch: Epoch,
    pub block_hash: BlockHash,
    /// Creation time (unix millis)
    pub timestamp_ms: i64,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        sender: ReplicaId,
        epoch: Epoch,
        block_hash: impl Into<BlockHash>,
    ) -> Self {
        Self {
            kind,
            sender,
            epoch,
            block_hash: block_hash.into(),
            timestamp_ms: now_millis(),
        }
    }

    pub fn vote(sender: ReplicaId, epoch: Epoch, block_hash: impl Into<BlockHash>) -> Self {
        Self::new(MessageKind::Vote, sender, epoch, block_hash)
    }

    pub fn proposal(sender: ReplicaId, epoch: Epoch, block_hash: impl Into<BlockHash>) -> Self {
        Self::new(MessageKind::Proposal, sender, epoch, block_hash)
    }
}

/// Envelope exchanged between replica tasks
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum WireMessage {
    /// Leader distributing its block; `proposer` is the claimed author
    Proposal { block: Block, proposer: ReplicaId },

    /// A replica announcing its vote
    Vote(Message),
}

impl WireMessage {
    /// Serialize for transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(borsh::to_vec(self)?)
    }

    /// Deserialize a received frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, ConsensusError> {
        Ok(borsh::from_slice(data)?)
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            WireMessage::Proposal { block, .. } => block.epoch(),
            WireMessage::Vote(message) => message.epoch,
        }
    }
}

/// Read-only snapshot of one replica's progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStats {
    pub replica_id: ReplicaId,
    pub total_blocks: usize,
    pub finalized_blocks: usize,
    pub notarized_blocks: usize,
    pub latest_epoch: Epoch,
}

/// First eight hex characters of a hash, for log lines
pub(crate) fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
