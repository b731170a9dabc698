//! CLI client helpers (C9): request drivers used by the `qfs-client`
//! binary. `upload_file` asks the master for placement, then pushes each
//! chunk directly to its assigned chunk servers; `download_file` asks the
//! master for locations, pulls each chunk from the first reachable
//! replica, and reassembles the file in chunk order.

use std::time::Duration;

use tonic::transport::Channel;

use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{DownloadRequest as ChunkDownloadRequest, StoreRequest};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{
    DownloadRequest, LeaseRequest, ListFilesRequest, Status as WireStatus, UnleaseRequest,
    UploadRequest,
};
use crate::util::{dial, sha256_hex};

pub async fn upload_file(
    master: &mut MasterClient<Channel>,
    filename: &str,
    data: &[u8],
    chunk_size: u64,
    read_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = master
        .upload(UploadRequest {
            filename: filename.to_string(),
            file_size: data.len() as u64,
        })
        .await?
        .into_inner();

    if response.status != WireStatus::Success as i32 {
        return Err(format!("upload rejected: {}", response.message).into());
    }

    for (chunk_id, locations) in response.chunks {
        let index: usize = chunk_id
            .rsplit("_chunk_")
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let start = index * chunk_size as usize;
        let end = (start + chunk_size as usize).min(data.len());
        let payload = &data[start.min(data.len())..end];
        let checksum = sha256_hex(payload);

        let mut stored = false;
        for server in &locations.servers {
            let mut client = match dial(server, read_timeout).await {
                Ok(channel) => ChunkClient::new(channel),
                Err(_) => continue,
            };
            let short_id = short_chunk_id(&chunk_id);
            let result = client
                .store(StoreRequest {
                    filename: filename.to_string(),
                    chunk_id: short_id,
                    data: payload.to_vec(),
                    checksum: checksum.clone(),
                })
                .await;
            if let Ok(r) = result {
                if r.into_inner().success {
                    stored = true;
                    break;
                }
            }
        }
        if !stored {
            return Err(format!("failed to store {} on any replica", chunk_id).into());
        }
    }

    Ok(())
}

pub async fn download_file(
    master: &mut MasterClient<Channel>,
    filename: &str,
    read_timeout: Duration,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let response = master
        .download(DownloadRequest {
            filename: filename.to_string(),
        })
        .await?
        .into_inner();

    if response.status != WireStatus::Success as i32 {
        return Err(format!("download rejected: {}", response.message).into());
    }

    let mut contents = Vec::new();
    for chunk_id in &response.chunk_ids {
        let locations = response
            .chunk_locations
            .get(chunk_id)
            .ok_or(format!("no locations for chunk {}", chunk_id))?;

        let mut fetched = None;
        for server in &locations.servers {
            let mut client = match dial(server, read_timeout).await {
                Ok(channel) => ChunkClient::new(channel),
                Err(_) => continue,
            };
            let short_id = short_chunk_id(chunk_id);
            if let Ok(resp) = client
                .download(ChunkDownloadRequest {
                    filename: filename.to_string(),
                    chunk_id: short_id,
                })
                .await
            {
                let resp = resp.into_inner();
                if resp.success {
                    fetched = Some(resp.data);
                    break;
                }
            }
        }

        match fetched {
            Some(data) => contents.extend(data),
            None => return Err(format!("no reachable replica for chunk {}", chunk_id).into()),
        }
    }

    Ok(contents)
}

pub async fn list_files(
    master: &mut MasterClient<Channel>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let response = master.list_files(ListFilesRequest {}).await?.into_inner();
    if response.status != WireStatus::Success as i32 {
        return Err(format!("list_files rejected: {}", response.message).into());
    }
    Ok(response.filenames)
}

pub async fn lease(
    master: &mut MasterClient<Channel>,
    filename: &str,
    client_id: &str,
) -> Result<u64, Box<dyn std::error::Error>> {
    let response = master
        .lease(LeaseRequest {
            filename: filename.to_string(),
            client_id: client_id.to_string(),
        })
        .await?
        .into_inner();
    if response.status != WireStatus::Success as i32 {
        return Err(format!("lease rejected: {}", response.message).into());
    }
    Ok(response.expires_at_unix_secs)
}

pub async fn unlease(
    master: &mut MasterClient<Channel>,
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = master
        .unlease(UnleaseRequest {
            filename: filename.to_string(),
        })
        .await?
        .into_inner();
    if response.status != WireStatus::Success as i32 {
        return Err(format!("unlease rejected: {}", response.message).into());
    }
    Ok(())
}

fn short_chunk_id(full_chunk_id: &str) -> String {
    match full_chunk_id.rsplit_once("_chunk_") {
        Some((_, idx)) => format!("chunk_{idx}"),
        None => full_chunk_id.to_string(),
    }
}
