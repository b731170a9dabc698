//! CLI client entry point (C9 bootstrap): `upload`/`download`/`list`/
//! `lease`/`unlease` subcommands over the master's wire protocol, driven by
//! the helpers in `client_lib`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use quorumfs::client_lib;
use quorumfs::config::load_config;
use quorumfs::util::connect_to_master;

#[derive(Parser, Debug)]
#[command(
    name = "qfs-client",
    about = "Uploads, downloads, and manages leases against a quorumfs master"
)]
struct Args {
    /// Path to a TOML config file; built-in defaults apply if it's absent.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Master address (host:port) to try first; may be repeated.
    #[arg(long = "master", value_name = "HOST:PORT")]
    master: Vec<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Upload a local file.
    Upload { path: PathBuf },
    /// Download a file to a local destination path.
    Download { filename: String, dest: PathBuf },
    /// List files known to the master.
    List,
    /// Acquire a write lease on a file.
    Lease { filename: String, client_id: String },
    /// Release a held lease.
    Unlease { filename: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let mut master_addrs = config.client.master_addrs;
    master_addrs.extend(args.master.clone());
    if master_addrs.is_empty() {
        master_addrs.push("127.0.0.1:50051".to_string());
    }

    let read_timeout = Duration::from_secs(config.common.client_read_timeout_secs);
    let mut master = connect_to_master(&master_addrs, read_timeout).await?;

    match args.command {
        Cmd::Upload { path } => {
            let data = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .ok_or("path has no file name")?
                .to_string_lossy()
                .to_string();
            client_lib::upload_file(
                &mut master,
                &filename,
                &data,
                config.common.chunk_size,
                read_timeout,
            )
            .await?;
            println!("uploaded {}", filename);
        }
        Cmd::Download { filename, dest } => {
            let data = client_lib::download_file(&mut master, &filename, read_timeout).await?;
            tokio::fs::write(&dest, &data).await?;
            println!("downloaded {} -> {}", filename, dest.display());
        }
        Cmd::List => {
            let files = client_lib::list_files(&mut master).await?;
            for file in files {
                println!("{}", file);
            }
        }
        Cmd::Lease {
            filename,
            client_id,
        } => {
            let expires_at = client_lib::lease(&mut master, &filename, &client_id).await?;
            println!("leased {} until unix time {}", filename, expires_at);
        }
        Cmd::Unlease { filename } => {
            client_lib::unlease(&mut master, &filename).await?;
            println!("released lease on {}", filename);
        }
    }

    Ok(())
}
