//! Simulator configuration: optional JSON file, then command-line overrides

use crate::Args;
use anyhow::Context;
use std::path::Path;
use streamlet_consensus::{Fault, ProtocolConfig, SimulationConfig};

/// Load a `ProtocolConfig` from a JSON file
pub fn load_protocol_config(path: &Path) -> anyhow::Result<ProtocolConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config file {:?}", path))
}

/// Merge the file (or defaults) with flags and validate the result
pub fn resolve(args: &Args) -> anyhow::Result<(ProtocolConfig, SimulationConfig)> {
    let mut protocol = match &args.config {
        Some(path) => load_protocol_config(path)?,
        None => ProtocolConfig::default(),
    };

    if let Some(replicas) = args.replicas {
        protocol.replicas = replicas;
    }
    if args.no_relay_votes {
        protocol.relay_votes = false;
    }
    if let Some(timeout) = args.round_timeout_ms {
        protocol.round_timeout_ms = timeout;
    }
    for &id in &args.silent {
        protocol.faults.insert(id, Fault::Silent);
    }
    for &id in &args.misattribute {
        protocol.faults.insert(id, Fault::Misattribute);
    }

    protocol.validate()?;

    let simulation = SimulationConfig {
        epochs: args.epochs,
        transactions_per_epoch: args.tx_per_epoch,
    };

    Ok((protocol, simulation))
}
