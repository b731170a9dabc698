//! Chunk server (C8): a stateless, checksum-verified blob store plus a
//! background task that announces this server's address and chunk
//! inventory to the current master candidate list every heartbeat
//! interval, failing over to the next configured address the way the
//! original prototype's chunk server tried each master in turn.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::warn;

use crate::config::{ChunkServerConfig, CommonConfig};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::HeartbeatRequest;
use crate::util::sha256_hex;

#[derive(Clone)]
pub struct ChunkService {
    pub addr: String,
    data_dir: PathBuf,
    pub stored_chunks: Arc<Mutex<HashSet<String>>>,
    common_config: CommonConfig,
}

impl ChunkService {
    pub fn new(addr: &str, config: &ChunkServerConfig, common_config: CommonConfig) -> Self {
        Self {
            addr: addr.to_string(),
            data_dir: PathBuf::from(&config.data_dir),
            stored_chunks: Arc::new(Mutex::new(HashSet::new())),
            common_config,
        }
    }

    fn chunk_path(&self, filename: &str, chunk_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}_{}", filename, chunk_id))
    }

    /// Persists `data` under `(filename, chunk_id)` after verifying it
    /// against `checksum`. Creates the data directory on first use.
    pub async fn store_chunk(
        &self,
        filename: &str,
        chunk_id: &str,
        data: &[u8],
        checksum: &str,
    ) -> Result<(), crate::errors::ChunkError> {
        let computed = sha256_hex(data);
        if computed != checksum {
            return Err(crate::errors::ChunkError::ChecksumMismatch {
                filename: filename.to_string(),
                chunk_id: chunk_id.to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.chunk_path(filename, chunk_id);
        tokio::fs::write(&path, data).await?;

        let key = format!("{}_{}", filename, chunk_id);
        self.stored_chunks.lock().await.insert(key);
        Ok(())
    }

    pub async fn load_chunk(
        &self,
        filename: &str,
        chunk_id: &str,
    ) -> Result<Vec<u8>, crate::errors::ChunkError> {
        let path = self.chunk_path(filename, chunk_id);
        let data = tokio::fs::read(&path).await?;
        Ok(data)
    }

    /// Spawns the heartbeat loop; returns immediately. Takes ownership of
    /// an `Arc` handle so the background task can outlive the caller.
    pub fn start_heartbeat_loop(self: Arc<Self>, master_addrs: Vec<String>) {
        let interval = Duration::from_secs(self.common_config.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.send_heartbeat_once(&master_addrs).await;
            }
        });
    }

    /// Sends a heartbeat to every configured master, not just the first
    /// reachable one - C3's membership table is per-node local state, never
    /// replicated, so whichever master is currently leader still needs its
    /// own fresh view of this chunk server even if it isn't first in the
    /// configured address list.
    async fn send_heartbeat_once(&self, master_addrs: &[String]) {
        let chunks: Vec<String> = self.stored_chunks.lock().await.iter().cloned().collect();
        let mut acked = 0;
        for addr in master_addrs {
            let client: Result<MasterClient<Channel>, _> =
                MasterClient::connect(format!("http://{}", addr)).await;
            let mut client = match client {
                Ok(c) => c,
                Err(_) => continue,
            };
            let request = HeartbeatRequest {
                chunkserver_address: self.addr.clone(),
                chunks: chunks.clone(),
            };
            match client.heartbeat(request).await {
                Ok(_) => acked += 1,
                Err(e) => {
                    warn!(addr, error = %e, "heartbeat rejected");
                }
            }
        }
        if acked == 0 {
            warn!("heartbeat failed against every configured master address");
        }
    }
}
