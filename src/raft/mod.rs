//! Replicated log (C1): wraps a first-party Raft-style consensus engine.
//! Exposes `propose`/`leader`/an implicit "subscribe" (the apply callback
//! supplied at construction, invoked in commit order) to the rest of the
//! master, and owns leader election, log replication, and persistence.
//!
//! This module is specialized to the master's own `Command` type rather
//! than generic over an abstract state machine - the crate has exactly one
//! state machine, and a generic consensus engine would buy nothing but
//! trait-bound noise. See DESIGN.md for why no external consensus crate is
//! used here.

mod rpc;
mod storage;

pub use rpc::ConsensusService;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::proto::raft::consensus_client::ConsensusClient;
use crate::proto::raft::{AppendEntriesRequest as WireAppendEntries, VoteRequest as WireVoteRequest};
use crate::state_machine::Command;
use storage::{Meta, Storage};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    #[error("not leader, current leader hint: {0:?}")]
    NotLeader(Option<String>),
    #[error("propose timed out waiting for commit")]
    Timeout,
    #[error("log error: {0}")]
    LogError(String),
}

pub struct RaftConfig {
    pub id: String,
    pub peers: Vec<String>,
    pub data_dir: std::path::PathBuf,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub commit_timeout: Duration,
}

struct PersistentState {
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
    role: Role,
    leader_id: Option<String>,
}

#[derive(Default)]
struct LeaderState {
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

struct VolatileState {
    commit_index: u64,
    last_applied: u64,
    leader_state: LeaderState,
}

pub struct RaftNode {
    config: RaftConfig,
    storage: Storage,
    state: RwLock<PersistentState>,
    volatile: RwLock<VolatileState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<(), RaftError>>>>,
    apply_callback: Box<dyn Fn(&Command) + Send + Sync>,
    last_heartbeat_received: RwLock<Instant>,
    election_timeout: RwLock<Duration>,
    self_weak: Weak<RaftNode>,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        apply_callback: impl Fn(&Command) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let storage = Storage::new(&config.data_dir).expect("failed to open raft data dir");
        let (meta, log) = storage.load().expect("failed to load raft storage");
        let election_timeout = random_election_timeout(&config);

        Arc::new_cyclic(|weak| Self {
            state: RwLock::new(PersistentState {
                current_term: meta.current_term,
                voted_for: meta.voted_for,
                log,
                role: Role::Follower,
                leader_id: None,
            }),
            volatile: RwLock::new(VolatileState {
                commit_index: 0,
                last_applied: 0,
                leader_state: LeaderState::default(),
            }),
            pending: Mutex::new(HashMap::new()),
            apply_callback: Box::new(apply_callback),
            last_heartbeat_received: RwLock::new(Instant::now()),
            election_timeout: RwLock::new(election_timeout),
            storage,
            config,
            self_weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<RaftNode> {
        self.self_weak
            .upgrade()
            .expect("raft node dropped while still in use")
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == Role::Leader
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.state.read().await.leader_id.clone()
    }

    fn quorum(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    /// Starts the background election-timer / heartbeat loop. Must be
    /// called once per process.
    pub fn start(&self) {
        let node = self.arc();
        tokio::spawn(async move {
            node.tick_loop().await;
        });
    }

    async fn tick_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_millis(25));
        loop {
            interval.tick().await;
            let role = self.state.read().await.role;
            match role {
                Role::Leader => {
                    self.replicate_all().await;
                }
                Role::Follower | Role::Candidate => {
                    let elapsed = self.last_heartbeat_received.read().await.elapsed();
                    let timeout = *self.election_timeout.read().await;
                    if elapsed >= timeout {
                        self.start_election().await;
                    }
                }
            }
        }
    }

    /// Submits `command` to the log. Returns once it has been committed and
    /// applied on this (leader) node, or an error if this node is not the
    /// leader, the commit deadline elapses, or persistence fails.
    pub async fn propose(&self, command: Command) -> Result<(), RaftError> {
        let index = {
            let mut state = self.state.write().await;
            if state.role != Role::Leader {
                return Err(RaftError::NotLeader(state.leader_id.clone()));
            }
            let index = state.log.len() as u64 + 1;
            let term = state.current_term;
            state.log.push(LogEntry {
                index,
                term,
                command,
            });
            self.storage
                .save_log(&state.log)
                .map_err(|e| RaftError::LogError(e.to_string()))?;
            index
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(index, tx);

        self.replicate_all().await;

        match tokio::time::timeout(self.config.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::LogError("applier channel dropped".into())),
            Err(_) => {
                self.pending.lock().await.remove(&index);
                Err(RaftError::Timeout)
            }
        }
    }

    async fn replicate_all(&self) {
        for peer in self.config.peers.clone() {
            let node = self.arc();
            tokio::spawn(async move {
                node.send_append_entries(peer).await;
            });
        }
        // A single-node cluster commits its own proposals immediately.
        if self.config.peers.is_empty() {
            self.advance_commit_index().await;
        }
    }

    async fn send_append_entries(&self, peer: String) {
        let (term, prev_log_index, prev_log_term, entries, leader_commit, leader_id) = {
            let state = self.state.read().await;
            if state.role != Role::Leader {
                return;
            }
            let volatile = self.volatile.read().await;
            let next_index = *volatile
                .leader_state
                .next_index
                .get(&peer)
                .unwrap_or(&(state.log.len() as u64 + 1));
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                state
                    .log
                    .get((prev_log_index - 1) as usize)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };
            let entries: Vec<LogEntry> = state
                .log
                .iter()
                .filter(|e| e.index >= next_index)
                .cloned()
                .collect();
            (
                state.current_term,
                prev_log_index,
                prev_log_term,
                entries,
                volatile.commit_index,
                state.leader_id.clone().unwrap_or_else(|| self.config.id.clone()),
            )
        };

        let wire_entries = entries
            .iter()
            .map(|e| crate::proto::raft::LogEntry {
                index: e.index,
                term: e.term,
                command: serde_json::to_vec(&e.command).unwrap_or_default(),
            })
            .collect();

        let request = WireAppendEntries {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: wire_entries,
            leader_commit,
        };

        let response = match connect(&peer).await {
            Some(mut client) => client.append_entries(request).await,
            None => return,
        };

        let response = match response {
            Ok(r) => r.into_inner(),
            Err(_) => return,
        };

        if response.term > term {
            self.step_down(response.term).await;
            return;
        }

        if response.success {
            let match_index = response.match_index;
            let mut volatile = self.volatile.write().await;
            volatile
                .leader_state
                .match_index
                .insert(peer.clone(), match_index);
            volatile
                .leader_state
                .next_index
                .insert(peer, match_index + 1);
            drop(volatile);
            self.advance_commit_index().await;
        } else {
            let mut volatile = self.volatile.write().await;
            let next = volatile
                .leader_state
                .next_index
                .entry(peer)
                .or_insert(prev_log_index + 1);
            *next = next.saturating_sub(1).max(1);
        }
    }

    async fn advance_commit_index(&self) {
        let state = self.state.read().await;
        if state.role != Role::Leader {
            return;
        }
        let last_index = state.log.len() as u64;
        let current_term = state.current_term;

        let starting_commit_index = self.volatile.read().await.commit_index;
        let mut new_commit_index = starting_commit_index;

        for candidate_index in (new_commit_index + 1)..=last_index {
            let entry_term = state.log[(candidate_index - 1) as usize].term;
            if entry_term != current_term {
                continue;
            }
            let mut count = 1; // self
            let volatile = self.volatile.read().await;
            for match_index in volatile.leader_state.match_index.values() {
                if *match_index >= candidate_index {
                    count += 1;
                }
            }
            if count >= self.quorum() {
                new_commit_index = candidate_index;
            }
        }

        if new_commit_index > starting_commit_index {
            self.apply_up_to(&state, new_commit_index).await;
        }
    }

    /// Applies every committed entry up to `commit_index` that has not yet
    /// been applied, in order, then wakes any pending `propose` callers.
    async fn apply_up_to(&self, state: &PersistentState, commit_index: u64) {
        let mut volatile = self.volatile.write().await;
        volatile.commit_index = commit_index;
        while volatile.last_applied < commit_index {
            let next = volatile.last_applied + 1;
            if let Some(entry) = state.log.get((next - 1) as usize) {
                (self.apply_callback)(&entry.command);
                volatile.last_applied = next;
                if let Some(tx) = self.pending.lock().await.remove(&next) {
                    let _ = tx.send(Ok(()));
                }
            } else {
                break;
            }
        }
    }

    async fn start_election(&self) {
        let (term, candidate_id, last_log_index, last_log_term) = {
            let mut state = self.state.write().await;
            state.current_term += 1;
            state.role = Role::Candidate;
            state.voted_for = Some(self.config.id.clone());
            state.leader_id = None;
            let _ = self.storage.save_meta(&Meta {
                current_term: state.current_term,
                voted_for: state.voted_for.clone(),
            });
            let last_log_index = state.log.len() as u64;
            let last_log_term = state.log.last().map(|e| e.term).unwrap_or(0);
            (
                state.current_term,
                self.config.id.clone(),
                last_log_index,
                last_log_term,
            )
        };

        *self.last_heartbeat_received.write().await = Instant::now();
        *self.election_timeout.write().await = random_election_timeout(&self.config);

        info!(term, "starting election");

        let mut votes = 1usize; // vote for self
        let mut futures = Vec::new();
        for peer in self.config.peers.clone() {
            let request = WireVoteRequest {
                term,
                candidate_id: candidate_id.clone(),
                last_log_index,
                last_log_term,
            };
            futures.push(async move {
                match connect(&peer).await {
                    Some(mut client) => client.request_vote(request).await.ok(),
                    None => None,
                }
            });
        }
        let results = futures::future::join_all(futures).await;

        for response in results.into_iter().flatten() {
            let response = response.into_inner();
            if response.term > term {
                self.step_down(response.term).await;
                return;
            }
            if response.vote_granted {
                votes += 1;
            }
        }

        if votes >= self.quorum() {
            self.become_leader(term).await;
        }
    }

    async fn become_leader(&self, term: u64) {
        let mut state = self.state.write().await;
        if state.current_term != term || state.role == Role::Leader {
            return;
        }
        state.role = Role::Leader;
        state.leader_id = Some(self.config.id.clone());
        let next_index = state.log.len() as u64 + 1;
        drop(state);

        let mut volatile = self.volatile.write().await;
        volatile.leader_state = LeaderState::default();
        for peer in &self.config.peers {
            volatile.leader_state.next_index.insert(peer.clone(), next_index);
            volatile.leader_state.match_index.insert(peer.clone(), 0);
        }
        drop(volatile);

        info!(term, id = %self.config.id, "elected leader");
        self.replicate_all().await;
    }

    async fn step_down(&self, new_term: u64) {
        let mut state = self.state.write().await;
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
            let _ = self.storage.save_meta(&Meta {
                current_term: state.current_term,
                voted_for: None,
            });
        }
        state.role = Role::Follower;
        *self.last_heartbeat_received.write().await = Instant::now();
    }

    /// Handles an incoming `RequestVote` RPC (called by `ConsensusService`).
    pub async fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (u64, bool) {
        let mut state = self.state.write().await;
        if term < state.current_term {
            return (state.current_term, false);
        }
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            state.role = Role::Follower;
        }

        let our_last_index = state.log.len() as u64;
        let our_last_term = state.log.last().map(|e| e.term).unwrap_or(0);
        let candidate_up_to_date = last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index);

        let can_vote = match &state.voted_for {
            None => true,
            Some(existing) => existing == &candidate_id,
        };

        if can_vote && candidate_up_to_date {
            state.voted_for = Some(candidate_id);
            let _ = self.storage.save_meta(&Meta {
                current_term: state.current_term,
                voted_for: state.voted_for.clone(),
            });
            let term = state.current_term;
            drop(state);
            *self.last_heartbeat_received.write().await = Instant::now();
            (term, true)
        } else {
            (state.current_term, false)
        }
    }

    /// Handles an incoming `AppendEntries` RPC (called by `ConsensusService`).
    pub async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (u64, bool, u64) {
        {
            let mut state = self.state.write().await;
            if term < state.current_term {
                return (state.current_term, false, 0);
            }
            state.current_term = term;
            state.role = Role::Follower;
            state.leader_id = Some(leader_id);
        }
        *self.last_heartbeat_received.write().await = Instant::now();

        let mut state = self.state.write().await;

        if prev_log_index > 0 {
            let ok = state
                .log
                .get((prev_log_index - 1) as usize)
                .map(|e| e.term == prev_log_term)
                .unwrap_or(false);
            if !ok {
                return (state.current_term, false, state.log.len() as u64);
            }
        }

        state.log.truncate(prev_log_index as usize);
        state.log.extend(entries);
        let _ = self.storage.save_log(&state.log);
        let match_index = state.log.len() as u64;
        let current_term = state.current_term;

        let current_commit_index = self.volatile.read().await.commit_index;
        if leader_commit > current_commit_index {
            let new_commit = leader_commit.min(match_index);
            self.apply_up_to(&state, new_commit).await;
        }

        (current_term, true, match_index)
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    let millis = rand::thread_rng().gen_range(min..=max.max(min));
    Duration::from_millis(millis)
}

async fn connect(peer: &str) -> Option<ConsensusClient<Channel>> {
    match ConsensusClient::connect(format!("http://{}", peer)).await {
        Ok(client) => Some(client),
        Err(e) => {
            debug!(peer, error = %e, "failed to connect to raft peer");
            None
        }
    }
}
