//! Request frontend (C7): the `Master` gRPC surface. Stateless dispatch -
//! every request's life is accept -> parse -> dispatch -> reply. Write
//! paths propose through the replicated log and wait for apply; read
//! paths (`download`, `list_files`) are served only by the leader to avoid
//! stale reads, the simplest correct choice for this design.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::config::CommonConfig;
use crate::errors::MasterError;
use crate::lease::LeaseManager;
use crate::membership::Membership;
use crate::placement::{num_chunks, select_targets};
use crate::proto::master::master_server::Master;
use crate::proto::master::{
    ChunkLocations, DownloadRequest, DownloadResponse, HeartbeatRequest, HeartbeatResponse,
    LeaseRequest, LeaseResponse, ListFilesRequest, ListFilesResponse, Redirect, Status as WireStatus,
    UnleaseRequest, UnleaseResponse, UploadRequest, UploadResponse,
};
use crate::raft::RaftNode;
use crate::repair::RepairLoop;
use crate::state_machine::{Command, MasterState};
use crate::util::split_host_port;

pub struct MasterService {
    raft: Arc<RaftNode>,
    state: Arc<tokio::sync::RwLock<MasterState>>,
    membership: Arc<Membership>,
    leases: Arc<LeaseManager>,
    repair: Arc<RepairLoop>,
    common_config: CommonConfig,
    /// Serializes the duplicate-filename check-then-propose sequence in
    /// `upload` - without it, two concurrent uploads of the same new
    /// filename can both pass the `contains_key` check before either
    /// commits, each compute their own placement, and both report success
    /// to their caller even though only the first-committed `AddFile`
    /// survives `apply`'s idempotent no-op.
    upload_lock: Mutex<()>,
}

impl MasterService {
    pub fn new(
        raft: Arc<RaftNode>,
        state: Arc<tokio::sync::RwLock<MasterState>>,
        membership: Arc<Membership>,
        leases: Arc<LeaseManager>,
        repair: Arc<RepairLoop>,
        common_config: CommonConfig,
    ) -> Self {
        Self {
            raft,
            state,
            membership,
            leases,
            repair,
            common_config,
            upload_lock: Mutex::new(()),
        }
    }

    /// Starts the background tasks this frontend depends on: the raft
    /// election/replication timer, the lease expiry sweep, and the repair
    /// loop. All three self-gate on leadership except the raft timer.
    pub fn start_background_tasks(&self) {
        self.raft.start();
        tokio::spawn(Arc::clone(&self.leases).run_sweep_loop());
        let repair = Arc::clone(&self.repair);
        tokio::spawn(async move { repair.run().await });
    }

    async fn redirect(&self) -> Option<Redirect> {
        let hint = self.raft.leader_hint().await?;
        let (host, port) = split_host_port(&hint)?;
        Some(Redirect {
            leader_host: host,
            leader_port: port as u32,
        })
    }
}

#[tonic::async_trait]
impl Master for MasterService {
    async fn upload(
        &self,
        request: Request<UploadRequest>,
    ) -> Result<Response<UploadResponse>, Status> {
        let req = request.into_inner();

        if !self.raft.is_leader().await {
            return Ok(Response::new(UploadResponse {
                status: WireStatus::Redirect as i32,
                message: "not leader".into(),
                redirect: self.redirect().await,
                chunks: HashMap::new(),
            }));
        }

        // Held across the whole check-then-propose sequence: `apply` doesn't
        // record a filename until its `AddFile` commits, so two concurrent
        // uploads of the same new filename would otherwise both pass the
        // `contains_key` check and both report success, even though only
        // the first-committed one survives.
        let _upload_permit = self.upload_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.file_map.contains_key(&req.filename) {
                return Err(MasterError::AlreadyExists(req.filename.clone()).into());
            }
        }

        let count = num_chunks(req.file_size, self.common_config.chunk_size);
        let chunk_ids: Vec<String> = (0..count)
            .map(|i| format!("{}_chunk_{}", req.filename, i))
            .collect();

        let live = self.membership.live_set().await;
        let mut placement: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let snapshot = self.state.read().await.chunk_locations.clone();
        for chunk_id in &chunk_ids {
            let targets = select_targets(
                self.common_config.replication_factor,
                &HashSet::new(),
                &live,
                &snapshot,
            );
            if targets.is_empty() {
                return Err(MasterError::NoCapacity.into());
            }
            placement.insert(chunk_id.clone(), targets);
        }

        self.raft
            .propose(Command::AddFile {
                filename: req.filename.clone(),
                chunk_ids: chunk_ids.clone(),
                placement: placement.clone(),
            })
            .await
            .map_err(MasterError::from_raft)?;

        info!(filename = %req.filename, chunks = count, "uploaded");

        let chunks: HashMap<String, ChunkLocations> = placement
            .into_iter()
            .map(|(id, servers)| (id, ChunkLocations { servers }))
            .collect();

        Ok(Response::new(UploadResponse {
            status: WireStatus::Success as i32,
            message: "ok".into(),
            redirect: None,
            chunks,
        }))
    }

    async fn download(
        &self,
        request: Request<DownloadRequest>,
    ) -> Result<Response<DownloadResponse>, Status> {
        let req = request.into_inner();

        if !self.raft.is_leader().await {
            return Ok(Response::new(DownloadResponse {
                status: WireStatus::Redirect as i32,
                message: "not leader".into(),
                redirect: self.redirect().await,
                chunk_ids: Vec::new(),
                chunk_locations: HashMap::new(),
            }));
        }

        let state = self.state.read().await;
        let chunk_ids = match state.file_map.get(&req.filename) {
            Some(ids) => ids.clone(),
            None => return Err(MasterError::NotFound(req.filename.clone()).into()),
        };

        let chunk_locations: HashMap<String, ChunkLocations> = chunk_ids
            .iter()
            .map(|id| {
                let servers: Vec<String> = state
                    .chunk_locations
                    .get(id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                (id.clone(), ChunkLocations { servers })
            })
            .collect();

        Ok(Response::new(DownloadResponse {
            status: WireStatus::Success as i32,
            message: "ok".into(),
            redirect: None,
            chunk_ids,
            chunk_locations,
        }))
    }

    async fn list_files(
        &self,
        _request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        if !self.raft.is_leader().await {
            return Ok(Response::new(ListFilesResponse {
                status: WireStatus::Redirect as i32,
                message: "not leader".into(),
                redirect: self.redirect().await,
                filenames: Vec::new(),
            }));
        }

        let state = self.state.read().await;
        let filenames = state.file_map.keys().cloned().collect();
        Ok(Response::new(ListFilesResponse {
            status: WireStatus::Success as i32,
            message: "ok".into(),
            redirect: None,
            filenames,
        }))
    }

    async fn lease(
        &self,
        request: Request<LeaseRequest>,
    ) -> Result<Response<LeaseResponse>, Status> {
        let req = request.into_inner();

        if !self.raft.is_leader().await {
            return Ok(Response::new(LeaseResponse {
                status: WireStatus::Redirect as i32,
                message: "not leader".into(),
                redirect: self.redirect().await,
                expires_at_unix_secs: 0,
            }));
        }

        match self.leases.grant(&req.filename, &req.client_id).await {
            Ok(expires_at) => Ok(Response::new(LeaseResponse {
                status: WireStatus::Success as i32,
                message: "ok".into(),
                redirect: None,
                expires_at_unix_secs: expires_at,
            })),
            Err(MasterError::AlreadyLeased(_)) => Ok(Response::new(LeaseResponse {
                status: WireStatus::Error as i32,
                message: "file already leased".into(),
                redirect: None,
                expires_at_unix_secs: 0,
            })),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlease(
        &self,
        request: Request<UnleaseRequest>,
    ) -> Result<Response<UnleaseResponse>, Status> {
        let req = request.into_inner();

        if !self.raft.is_leader().await {
            return Ok(Response::new(UnleaseResponse {
                status: WireStatus::Redirect as i32,
                message: "not leader".into(),
                redirect: self.redirect().await,
            }));
        }

        self.leases.release(&req.filename).await?;

        Ok(Response::new(UnleaseResponse {
            status: WireStatus::Success as i32,
            message: "ok".into(),
            redirect: None,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.membership.record_heartbeat(&req.chunkserver_address).await;
        Ok(Response::new(HeartbeatResponse {
            message: "ack".into(),
        }))
    }
}
