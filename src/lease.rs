//! Lease manager (C5). Grant/release are thin wrappers around proposing
//! `LeaseFile`/`UnleaseFile` through the replicated log; the interesting
//! part is serializing the check-then-propose sequence so two concurrent
//! grant requests for the same file can't both observe "free" and both
//! propose (the second apply would silently clobber the first).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::errors::MasterError;
use crate::raft::RaftNode;
use crate::state_machine::{Command, MasterState};
use crate::util::now_unix;

pub struct LeaseManager {
    raft: Arc<RaftNode>,
    state: Arc<RwLock<MasterState>>,
    queue: Mutex<()>,
    lease_duration_secs: u64,
    sweep_period: Duration,
}

impl LeaseManager {
    pub fn new(
        raft: Arc<RaftNode>,
        state: Arc<RwLock<MasterState>>,
        lease_duration_secs: u64,
        sweep_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            raft,
            state,
            queue: Mutex::new(()),
            lease_duration_secs,
            sweep_period,
        })
    }

    /// Grants a lease on `filename` to `holder`, or returns
    /// `MasterError::AlreadyLeased` if a lease on it hasn't expired yet -
    /// unconditionally, even if `holder` is the existing lease's own
    /// holder. A lease is a fixed-length grant, not a renewable one; the
    /// holder must wait for expiry (or `unlease`) before re-acquiring.
    pub async fn grant(&self, filename: &str, holder: &str) -> Result<u64, MasterError> {
        let _permit = self.queue.lock().await;

        let now = now_unix();
        {
            let state = self.state.read().await;
            if state.active_lease(filename, now).is_some() {
                return Err(MasterError::AlreadyLeased(filename.to_string()));
            }
        }

        let expires_at = now + self.lease_duration_secs;
        self.raft
            .propose(Command::LeaseFile {
                filename: filename.to_string(),
                holder: holder.to_string(),
                expires_at,
            })
            .await
            .map_err(MasterError::from_raft)?;

        info!(filename, holder, expires_at, "lease granted");
        Ok(expires_at)
    }

    /// Releases any lease on `filename`. Idempotent: succeeds whether or
    /// not a lease currently exists.
    pub async fn release(&self, filename: &str) -> Result<(), MasterError> {
        let _permit = self.queue.lock().await;
        self.raft
            .propose(Command::UnleaseFile {
                filename: filename.to_string(),
            })
            .await
            .map_err(MasterError::from_raft)?;
        info!(filename, "lease released");
        Ok(())
    }

    /// Runs forever, sweeping expired leases while this node is the
    /// leader. Must only be driven on the leader; a follower that swept
    /// would propose redundant unleases that the leader already handles.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.sweep_period);
        loop {
            interval.tick().await;
            if !self.raft.is_leader().await {
                continue;
            }
            let now = now_unix();
            let expired: Vec<String> = {
                let state = self.state.read().await;
                state
                    .leases
                    .iter()
                    .filter(|(_, lease)| lease.expires_at <= now)
                    .map(|(filename, _)| filename.clone())
                    .collect()
            };
            for filename in expired {
                if let Err(e) = self.release(&filename).await {
                    warn!(filename, error = %e, "failed to sweep expired lease");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftConfig;

    /// A single-node raft cluster commits its own proposals immediately,
    /// which is all `LeaseManager`'s tests need - no peers, no network.
    async fn single_node_raft(dir: &std::path::Path) -> (Arc<RaftNode>, Arc<RwLock<MasterState>>) {
        let state = Arc::new(RwLock::new(MasterState::new()));
        let apply_state = Arc::clone(&state);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                apply_state.write().await.apply(&command);
            }
        });

        let raft = RaftNode::new(
            RaftConfig {
                id: "test-node".into(),
                peers: Vec::new(),
                data_dir: dir.to_path_buf(),
                election_timeout_min: Duration::from_millis(20),
                election_timeout_max: Duration::from_millis(40),
                heartbeat_interval: Duration::from_millis(10),
                commit_timeout: Duration::from_secs(2),
            },
            move |command| {
                let _ = tx.send(command.clone());
            },
        );
        raft.start();
        for _ in 0..50 {
            if raft.is_leader().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (raft, state)
    }

    #[tokio::test]
    async fn second_lease_on_live_lease_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (raft, state) = single_node_raft(dir.path()).await;
        let leases = LeaseManager::new(raft, state, 30, Duration::from_secs(5));

        leases.grant("foo", "client-a").await.unwrap();
        let err = leases.grant("foo", "client-b").await.unwrap_err();
        assert_eq!(err, MasterError::AlreadyLeased("foo".to_string()));
    }

    #[tokio::test]
    async fn same_holder_cannot_renew_before_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (raft, state) = single_node_raft(dir.path()).await;
        let leases = LeaseManager::new(raft, state, 30, Duration::from_secs(5));

        leases.grant("foo", "client-a").await.unwrap();
        let err = leases.grant("foo", "client-a").await.unwrap_err();
        assert_eq!(err, MasterError::AlreadyLeased("foo".to_string()));
    }

    #[tokio::test]
    async fn release_then_grant_by_new_holder_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (raft, state) = single_node_raft(dir.path()).await;
        let leases = LeaseManager::new(raft, state, 30, Duration::from_secs(5));

        leases.grant("foo", "client-a").await.unwrap();
        leases.release("foo").await.unwrap();
        leases.grant("foo", "client-b").await.unwrap();
    }
}
