//! Wire adapter between the generated `Consensus` gRPC service and
//! `RaftNode`. Log entries cross the wire with their `Command` payload
//! serialized as JSON bytes - raft itself never interprets the payload, so
//! there's no need for it to share a wire format with the client-facing
//! `master` proto.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::proto::raft::consensus_server::Consensus;
use crate::proto::raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry as WireLogEntry, VoteRequest,
    VoteResponse,
};

use super::{LogEntry, RaftNode};

pub struct ConsensusService {
    node: Arc<RaftNode>,
}

impl ConsensusService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl Consensus for ConsensusService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        let (term, vote_granted) = self
            .node
            .handle_request_vote(
                req.term,
                req.candidate_id,
                req.last_log_index,
                req.last_log_term,
            )
            .await;
        Ok(Response::new(VoteResponse { term, vote_granted }))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let entries = req
            .entries
            .into_iter()
            .filter_map(decode_entry)
            .collect::<Vec<_>>();

        let (term, success, match_index) = self
            .node
            .handle_append_entries(
                req.term,
                req.leader_id,
                req.prev_log_index,
                req.prev_log_term,
                entries,
                req.leader_commit,
            )
            .await;

        Ok(Response::new(AppendEntriesResponse {
            term,
            success,
            match_index,
        }))
    }
}

fn decode_entry(wire: WireLogEntry) -> Option<LogEntry> {
    serde_json::from_slice(&wire.command)
        .ok()
        .map(|command| LogEntry {
            index: wire.index,
            term: wire.term,
            command,
        })
}
