//! Typed error currency for the master's logic layer (C2-C6). The RPC layer
//! converts these into `tonic::Status` or into the wire protocol's `Status`
//! discriminant at the boundary, the way the upstream prototype's
//! `*_impl.rs` handlers build ad hoc `Status::internal(...)` strings - but
//! from a single typed source instead of scattered format!() calls.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MasterError {
    #[error("not leader, current leader hint: {0:?}")]
    NotLeader(Option<(String, u16)>),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file already leased: {0}")]
    AlreadyLeased(String),

    #[error("commit did not complete within the deadline")]
    CommitTimeout,

    #[error("no live chunk servers available")]
    NoCapacity,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// Translates a consensus-layer failure into the master's own error
    /// currency, splitting the raft peer id (a `host:port` string) back
    /// into the pieces the wire protocol's `Redirect` message wants.
    pub fn from_raft(err: crate::raft::RaftError) -> Self {
        match err {
            crate::raft::RaftError::NotLeader(hint) => {
                MasterError::NotLeader(hint.as_deref().and_then(crate::util::split_host_port))
            }
            crate::raft::RaftError::Timeout => MasterError::CommitTimeout,
            crate::raft::RaftError::LogError(msg) => MasterError::Internal(msg),
        }
    }
}

impl From<MasterError> for tonic::Status {
    fn from(err: MasterError) -> Self {
        match err {
            MasterError::NotLeader(_) => tonic::Status::failed_precondition(err.to_string()),
            MasterError::NotFound(_) => tonic::Status::not_found(err.to_string()),
            MasterError::AlreadyExists(_) => tonic::Status::already_exists(err.to_string()),
            MasterError::AlreadyLeased(_) => tonic::Status::failed_precondition(err.to_string()),
            MasterError::CommitTimeout => tonic::Status::deadline_exceeded(err.to_string()),
            MasterError::NoCapacity => tonic::Status::resource_exhausted(err.to_string()),
            MasterError::Internal(_) => tonic::Status::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("checksum mismatch for {filename}_chunk_{chunk_id}")]
    ChecksumMismatch { filename: String, chunk_id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChunkError> for tonic::Status {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::ChecksumMismatch { .. } => tonic::Status::invalid_argument(err.to_string()),
            ChunkError::Io(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
