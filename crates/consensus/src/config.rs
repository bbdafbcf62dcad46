//! Protocol and simulation configuration

use crate::error::ConsensusError;
use crate::types::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Misbehaviour injected by the drivers on behalf of a replica.
/// The replica state machine itself always behaves honestly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Proposes nothing as leader and never receives proposals
    Silent,
    /// As leader, its proposal reaches peers attributed to another replica
    Misattribute,
}

/// Configuration shared by the synchronous and async drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of replicas (n)
    pub replicas: usize,
    /// Relay every vote produced in an epoch to all other replicas
    pub relay_votes: bool,
    /// Per-phase deadline for the async driver's round barrier
    pub round_timeout_ms: u64,
    /// Injected faults by replica id
    pub faults: BTreeMap<ReplicaId, Fault>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            replicas: 4,
            relay_votes: true,
            round_timeout_ms: 250,
            faults: BTreeMap::new(),
        }
    }
}

impl ProtocolConfig {
    /// Config for `replicas` honest replicas with default settings
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas,
            ..Default::default()
        }
    }

    /// Reject configurations that would silently degrade fault tolerance semantics
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.replicas == 0 {
            return Err(ConsensusError::NoReplicas);
        }
        if self.round_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "round_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(&id) = self.faults.keys().find(|&&id| id as usize >= self.replicas) {
            return Err(ConsensusError::ReplicaOutOfRange {
                id,
                total: self.replicas,
            });
        }
        Ok(())
    }

    pub fn fault_of(&self, id: ReplicaId) -> Option<Fault> {
        self.faults.get(&id).copied()
    }

    pub fn is_silent(&self, id: ReplicaId) -> bool {
        self.fault_of(id) == Some(Fault::Silent)
    }

    /// Proposer a leader's block is attributed to when delivered to peers
    pub fn claimed_proposer(&self, leader: ReplicaId) -> ReplicaId {
        match self.fault_of(leader) {
            Some(Fault::Misattribute) => {
                ((leader as usize + 1) % self.replicas.max(1)) as ReplicaId
            }
            _ => leader,
        }
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

/// Parameters of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Epochs to run, starting at 1
    pub epochs: u64,
    /// Synthetic transactions per epoch
    pub transactions_per_epoch: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            epochs: 6,
            transactions_per_epoch: 3,
        }
    }
}

/// Placeholder transaction identifiers for one epoch: `tx_<epoch>_<i>`
pub fn synthetic_transactions(epoch: u64, count: usize) -> Vec<String> {
    (0..count).map(|t| format!("tx_{}_{}", epoch, t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ProtocolConfig::default().validate().is_ok());
        assert!(matches!(
            ProtocolConfig::with_replicas(0).validate(),
            Err(ConsensusError::NoReplicas)
        ));

        let mut config = ProtocolConfig::with_replicas(4);
        config.faults.insert(4, Fault::Silent);
        assert!(matches!(
            config.validate(),
            Err(ConsensusError::ReplicaOutOfRange { id: 4, total: 4 })
        ));

        let config = ProtocolConfig {
            round_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn test_claimed_proposer() {
        let mut config = ProtocolConfig::with_replicas(4);
        config.faults.insert(3, Fault::Misattribute);
        assert_eq!(config.claimed_proposer(1), 1);
        assert_eq!(config.claimed_proposer(3), 0);
    }

    #[test]
    fn test_parse_partial_json() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"replicas": 7, "faults": {"2": "silent"}}"#).unwrap();
        assert_eq!(config.replicas, 7);
        assert!(config.relay_votes);
        assert_eq!(config.round_timeout_ms, 250);
        assert!(config.is_silent(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_synthetic_transactions() {
        assert_eq!(synthetic_transactions(3, 2), vec!["tx_3_0", "tx_3_1"]);
        assert!(synthetic_transactions(1, 0).is_empty());
    }
}
