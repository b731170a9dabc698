//! Chunk server gRPC surface: checksum-verified `store`/`download`, plus
//! `replicate` (used by the master's repair loop, identical semantics to
//! `store`).

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::chunkserver_service::ChunkService;
use crate::errors::ChunkError;
use crate::proto::chunk::chunk_server::Chunk;
use crate::proto::chunk::{DownloadRequest, DownloadResponse, StoreRequest, StoreResponse};
use crate::util::sha256_hex;

#[tonic::async_trait]
impl Chunk for ChunkService {
    async fn store(&self, request: Request<StoreRequest>) -> Result<Response<StoreResponse>, Status> {
        let req = request.into_inner();
        match self
            .store_chunk(&req.filename, &req.chunk_id, &req.data, &req.checksum)
            .await
        {
            Ok(()) => {
                info!(filename = %req.filename, chunk_id = %req.chunk_id, "stored chunk");
                Ok(Response::new(StoreResponse {
                    success: true,
                    message: "ok".into(),
                }))
            }
            Err(ChunkError::ChecksumMismatch { .. }) => {
                warn!(filename = %req.filename, chunk_id = %req.chunk_id, "checksum mismatch on store");
                Ok(Response::new(StoreResponse {
                    success: false,
                    message: "checksum mismatch".into(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download(
        &self,
        request: Request<DownloadRequest>,
    ) -> Result<Response<DownloadResponse>, Status> {
        let req = request.into_inner();
        match self.load_chunk(&req.filename, &req.chunk_id).await {
            Ok(data) => {
                let checksum = sha256_hex(&data);
                Ok(Response::new(DownloadResponse {
                    success: true,
                    message: "ok".into(),
                    data,
                    checksum,
                }))
            }
            Err(ChunkError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Response::new(DownloadResponse {
                    success: false,
                    message: format!("chunk not found: {}_{}", req.filename, req.chunk_id),
                    data: Vec::new(),
                    checksum: String::new(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replicate(
        &self,
        request: Request<StoreRequest>,
    ) -> Result<Response<StoreResponse>, Status> {
        self.store(request).await
    }
}
