//! End-to-end simulation tests
//!
//! Drives full epochs through `StreamletProtocol` and checks the safety
//! properties every replica must keep:
//! - Chain growth and adoption across all replicas
//! - Monotone notarization and finalization
//! - Finalized blocks form a subsequence of the local chain
//! - Finalized sequences agree across replicas, faults included

use std::collections::HashSet;

use crate::{
    config::{Fault, ProtocolConfig},
    protocol::StreamletProtocol,
    replica::Replica,
    report::ConsensusMetrics,
    types::quorum_threshold,
};

/// Finalized blocks appear in the chain, in chain order, and are registered
fn assert_finalized_is_subsequence(replica: &Replica) {
    let mut chain = replica.chain().iter();
    for finalized in replica.finalized() {
        assert!(replica.block(finalized.hash()).is_some());
        assert!(
            chain.any(|b| b.hash() == finalized.hash()),
            "finalized block {} out of chain order on replica {}",
            finalized.hash(),
            replica.id()
        );
    }
}

#[test]
fn test_four_replicas_three_epochs() {
    let mut protocol = StreamletProtocol::with_replicas(4).unwrap();
    let report = protocol.run_simulation(3, 2);

    assert_eq!(report.epochs.len(), 3);
    for stats in &report.final_stats {
        assert!(stats.total_blocks >= 2);
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.notarized_blocks, 4);
        assert_eq!(stats.finalized_blocks, 3);
        assert_eq!(stats.latest_epoch, 3);
    }
    for replica in protocol.replicas() {
        assert_finalized_is_subsequence(replica);
    }
    assert!(protocol.consistency_holds());
    assert_eq!(
        report.metrics,
        ConsensusMetrics {
            blocks_proposed: 3,
            votes_cast: 12,
            blocks_notarized: 3,
            blocks_finalized: 3,
        }
    );
}

#[test]
fn test_four_replicas_without_relay() {
    let config = ProtocolConfig {
        relay_votes: false,
        ..ProtocolConfig::with_replicas(4)
    };
    let mut protocol = StreamletProtocol::new(config).unwrap();
    let report = protocol.run_simulation(3, 2);

    // Each replica only ever counts its own vote, below the quorum of 3
    for stats in &report.final_stats {
        assert!(stats.total_blocks >= 2);
        assert_eq!(stats.notarized_blocks, 1);
        assert_eq!(stats.finalized_blocks, 0);
    }
}

#[test]
fn test_single_replica_notarizes_immediately() {
    let mut protocol = StreamletProtocol::with_replicas(1).unwrap();
    assert_eq!(quorum_threshold(1), 1);

    for epoch in 1..=3 {
        let block = protocol.run_epoch(epoch, vec![format!("tx_{}", epoch)]).unwrap();
        let replica = protocol.replica(0).unwrap();
        assert!(replica.is_notarized(block.hash()));
        assert_eq!(replica.finalized().len() as u64, epoch);
    }
}

#[test]
fn test_chain_links_parent_hashes() {
    let mut protocol = StreamletProtocol::with_replicas(3).unwrap();
    protocol.run_simulation(5, 1);

    for replica in protocol.replicas() {
        let chain = replica.chain();
        assert_eq!(chain.len(), 6);
        assert!(chain[0].is_genesis());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].parent_hash(), pair[0].hash());
            assert_eq!(pair[1].epoch(), pair[0].epoch() + 1);
        }
    }
}

#[test]
fn test_progress_is_monotone() {
    let mut protocol = StreamletProtocol::with_replicas(7).unwrap();
    let mut previous = protocol.stats();
    let mut notarized_so_far: Vec<HashSet<String>> = vec![HashSet::new(); 7];

    for epoch in 1..=10 {
        protocol.run_epoch(epoch, vec!["tx".to_string()]);
        let current = protocol.stats();
        for (before, after) in previous.iter().zip(&current) {
            assert!(after.total_blocks >= before.total_blocks);
            assert!(after.notarized_blocks >= before.notarized_blocks);
            assert!(after.finalized_blocks >= before.finalized_blocks);
        }

        for (replica, seen) in protocol.replicas().iter().zip(notarized_so_far.iter_mut()) {
            for hash in seen.iter() {
                assert!(replica.is_notarized(hash));
            }
            for block in replica.chain() {
                if replica.is_notarized(block.hash()) {
                    if !block.is_genesis() {
                        let votes = replica.vote_count(block.epoch(), block.hash());
                        assert!(votes >= replica.threshold());
                    }
                    seen.insert(block.hash().to_string());
                }
            }
        }
        previous = current;
    }
}

#[test]
fn test_silent_minority_tolerated() {
    let mut config = ProtocolConfig::with_replicas(4);
    config.faults.insert(3, Fault::Silent);
    let mut protocol = StreamletProtocol::new(config).unwrap();
    let report = protocol.run_simulation(6, 1);

    // Only epoch 3 is led by the silent replica
    for (index, epoch) in report.epochs.iter().enumerate() {
        assert_eq!(epoch.block_hash.is_none(), index == 2);
    }

    // Three votes still meet the quorum of 3
    for stats in &report.final_stats[..3] {
        assert_eq!(stats.total_blocks, 6);
        assert_eq!(stats.notarized_blocks, 6);
        assert_eq!(stats.finalized_blocks, 5);
    }
    assert_eq!(report.final_stats[3].total_blocks, 1);
    assert!(protocol.consistency_holds());

    // The silent replica never votes on the five proposals
    assert_eq!(report.metrics.blocks_proposed, 5);
    assert_eq!(report.metrics.votes_cast, 15);
    assert_eq!(report.metrics.blocks_notarized, 5);
}

#[test]
fn test_misattributing_leader_breaks_two_chain() {
    let mut config = ProtocolConfig::with_replicas(4);
    config.faults.insert(1, Fault::Misattribute);
    let mut protocol = StreamletProtocol::new(config).unwrap();
    protocol.run_simulation(2, 1);

    // Replica 1 adopted its own unnotarized block, so (b1, b2) is not a notarized pair
    let leader = protocol.replica(1).unwrap();
    assert_eq!(leader.chain().len(), 3);
    assert_eq!(leader.finalized().len(), 0);

    for id in [0, 2, 3] {
        let replica = protocol.replica(id).unwrap();
        assert_eq!(replica.chain().len(), 2);
        assert_eq!(replica.finalized().len(), 1);
        assert!(replica.finalized()[0].is_genesis());
        assert_finalized_is_subsequence(replica);
    }
    assert!(protocol.consistency_holds());
}
