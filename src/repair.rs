//! Repair loop (C6). Leader-only periodic scan comparing `chunk_locations`
//! against the live set, driving physical re-replication via chunk servers'
//! `Replicate` RPC before committing the updated replica set to the log.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::membership::Membership;
use crate::placement::select_targets;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{DownloadRequest, StoreRequest};
use crate::raft::RaftNode;
use crate::state_machine::{Command, MasterState};

/// Attempts per target this repair cycle before giving up on it; the next
/// cycle's scan will pick the chunk back up if it's still under-replicated.
const MAX_REPAIR_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

pub struct RepairLoop {
    raft: Arc<RaftNode>,
    state: Arc<RwLock<MasterState>>,
    membership: Arc<Membership>,
    replication_factor: usize,
    period: Duration,
    in_flight: Mutex<HashSet<String>>,
    self_weak: Weak<RepairLoop>,
}

impl RepairLoop {
    pub fn new(
        raft: Arc<RaftNode>,
        state: Arc<RwLock<MasterState>>,
        membership: Arc<Membership>,
        replication_factor: usize,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            raft,
            state,
            membership,
            replication_factor,
            period,
            in_flight: Mutex::new(HashSet::new()),
            self_weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<RepairLoop> {
        self.self_weak
            .upgrade()
            .expect("repair loop dropped while still in use")
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            interval.tick().await;
            if !self.raft.is_leader().await {
                continue;
            }
            self.scan_once().await;
        }
    }

    async fn scan_once(&self) {
        let live = self.membership.live_set().await;
        let snapshot: BTreeMap<String, HashSet<String>> = {
            let state = self.state.read().await;
            state
                .chunk_locations
                .iter()
                .map(|(chunk_id, replicas)| (chunk_id.clone(), replicas.iter().cloned().collect()))
                .collect()
        };

        for (chunk_id, replicas) in snapshot {
            let alive: HashSet<String> = replicas.intersection(&live).cloned().collect();
            if alive.len() >= self.replication_factor {
                if alive.len() < replicas.len() {
                    // Dead replicas exist even though we're at goal; purge them.
                    self.commit_replica_set(&chunk_id, alive).await;
                }
                continue;
            }

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(chunk_id.clone()) {
                    continue;
                }
            }

            let node = self.arc();
            let chunk_id_owned = chunk_id.clone();
            tokio::spawn(async move {
                node.repair_chunk(chunk_id_owned.clone(), alive).await;
                node.in_flight.lock().await.remove(&chunk_id_owned);
            });
        }
    }

    async fn repair_chunk(&self, chunk_id: String, alive: HashSet<String>) {
        if alive.is_empty() {
            warn!(chunk_id, "chunk has no live replicas, unrecoverable");
            return;
        }

        let deficit = self.replication_factor - alive.len();
        let live = self.membership.live_set().await;
        let snapshot: BTreeMap<String, std::collections::BTreeSet<String>> =
            self.state.read().await.chunk_locations.clone();
        let exclude: HashSet<String> = alive.clone();
        let targets = select_targets(deficit, &exclude, &live, &snapshot);
        if targets.is_empty() {
            return;
        }

        let (filename, short_id) = split_chunk_id(&chunk_id);
        let source = alive.iter().next().cloned().expect("alive is non-empty");

        let mut new_replicas = alive.clone();
        for target in &targets {
            match push_replica_with_retry(&source, &filename, &short_id, target).await {
                Ok(()) => {
                    new_replicas.insert(target.clone());
                    info!(chunk_id, target, "repaired chunk replica");
                }
                Err(e) => {
                    warn!(
                        chunk_id,
                        target,
                        error = %e,
                        "giving up on replica for this cycle, will retry next scan"
                    );
                }
            }
        }

        self.commit_replica_set(&chunk_id, new_replicas).await;
    }

    async fn commit_replica_set(&self, chunk_id: &str, replicas: HashSet<String>) {
        let replicas: Vec<String> = replicas.into_iter().collect();
        if let Err(e) = self
            .raft
            .propose(Command::UpdateReplicas {
                chunk_id: chunk_id.to_string(),
                replicas,
            })
            .await
        {
            warn!(chunk_id, error = %e, "failed to commit repaired replica set");
        }
    }
}

/// Splits a full chunk id (`<filename>_chunk_<i>`) into the filename and
/// the short id (`chunk_<i>`) the chunk server's own RPCs address chunks by.
fn split_chunk_id(chunk_id: &str) -> (String, String) {
    match chunk_id.rsplit_once("_chunk_") {
        Some((filename, idx)) => (filename.to_string(), format!("chunk_{idx}")),
        None => (chunk_id.to_string(), chunk_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::split_chunk_id;

    #[test]
    fn splits_full_chunk_id_into_filename_and_short_id() {
        assert_eq!(
            split_chunk_id("foo.txt_chunk_2"),
            ("foo.txt".to_string(), "chunk_2".to_string())
        );
    }

    #[test]
    fn falls_back_to_whole_string_when_unrecognized() {
        assert_eq!(
            split_chunk_id("weird-id"),
            ("weird-id".to_string(), "weird-id".to_string())
        );
    }
}

/// Retries `push_replica` with exponential backoff, bounded to
/// `MAX_REPAIR_ATTEMPTS` for this chunk this cycle - a target that stays
/// unreachable is left for the next `scan_once` to pick up rather than
/// blocking this one.
async fn push_replica_with_retry(
    source: &str,
    filename: &str,
    chunk_id: &str,
    target: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;
    for attempt in 1..=MAX_REPAIR_ATTEMPTS {
        match push_replica(source, filename, chunk_id, target).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(target, attempt, error = %e, "repair push attempt failed");
                last_err = Some(e);
                if attempt < MAX_REPAIR_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

async fn push_replica(
    source: &str,
    filename: &str,
    chunk_id: &str,
    target: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut source_client: ChunkClient<Channel> =
        ChunkClient::connect(format!("http://{}", source)).await?;
    let downloaded = source_client
        .download(DownloadRequest {
            filename: filename.to_string(),
            chunk_id: chunk_id.to_string(),
        })
        .await?
        .into_inner();

    if !downloaded.success {
        return Err(downloaded.message.into());
    }

    let mut target_client: ChunkClient<Channel> =
        ChunkClient::connect(format!("http://{}", target)).await?;
    let stored = target_client
        .replicate(StoreRequest {
            filename: filename.to_string(),
            chunk_id: chunk_id.to_string(),
            data: downloaded.data,
            checksum: downloaded.checksum,
        })
        .await?
        .into_inner();

    if stored.success {
        Ok(())
    } else {
        Err(stored.message.into())
    }
}
