//! The master's deterministic namespace/lease state machine (C2). Pure
//! function of the committed command stream: `apply` never reads the wall
//! clock, randomness, or the network, so replaying the same command
//! sequence on any peer yields byte-identical state (invariant I6 / property
//! P1).

use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};

/// Tagged command variants proposed through the replicated log. Placement is
/// carried inside `AddFile` rather than computed after commit - see the
/// design notes on why placement must be frozen into the log at propose
/// time, not derived from volatile membership after the fact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    AddFile {
        filename: String,
        chunk_ids: Vec<String>,
        placement: BTreeMap<String, Vec<String>>,
    },
    LeaseFile {
        filename: String,
        holder: String,
        expires_at: u64,
    },
    UnleaseFile {
        filename: String,
    },
    UpdateReplicas {
        chunk_id: String,
        replicas: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub expires_at: u64,
}

/// Replicated namespace and lease state. Survives leader change because it
/// is rebuilt identically on every peer from the committed log (plus
/// snapshots - see `raft::storage`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterState {
    /// filename -> ordered chunk ids
    pub file_map: BTreeMap<String, Vec<String>>,
    /// chunk id -> replica set (a `BTreeSet` because replica membership is
    /// a set, not a sequence - this also gives deterministic equality for
    /// property tests)
    pub chunk_locations: BTreeMap<String, BTreeSet<String>>,
    /// filename -> active lease
    pub leases: BTreeMap<String, Lease>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed command. Idempotent where the spec requires it
    /// (`AddFile` on an existing filename, `UnleaseFile` on an absent lease,
    /// `UpdateReplicas` on an unknown chunk id all no-op rather than error -
    /// the caller already observed success or failure at propose time).
    pub fn apply(&mut self, command: &Command) {
        match command {
            Command::AddFile {
                filename,
                chunk_ids,
                placement,
            } => {
                if self.file_map.contains_key(filename) {
                    return;
                }
                self.file_map.insert(filename.clone(), chunk_ids.clone());
                for chunk_id in chunk_ids {
                    let replicas = placement
                        .get(chunk_id)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    self.chunk_locations.insert(chunk_id.clone(), replicas);
                }
            }
            Command::LeaseFile {
                filename,
                holder,
                expires_at,
            } => {
                self.leases.insert(
                    filename.clone(),
                    Lease {
                        holder: holder.clone(),
                        expires_at: *expires_at,
                    },
                );
            }
            Command::UnleaseFile { filename } => {
                self.leases.remove(filename);
            }
            Command::UpdateReplicas { chunk_id, replicas } => {
                if let Some(entry) = self.chunk_locations.get_mut(chunk_id) {
                    *entry = replicas.iter().cloned().collect();
                }
            }
        }
    }

    pub fn active_lease(&self, filename: &str, now: u64) -> Option<&Lease> {
        self.leases
            .get(filename)
            .filter(|lease| lease.expires_at > now)
    }
}
