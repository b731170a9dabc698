//! On-disk persistence for one raft peer: the term/vote metadata and the
//! log itself. Format is the consensus module's own private concern -
//! opaque to the rest of the master (see spec §6, "Persisted state").
//! Kept deliberately simple (whole-file rewrite on every mutation, JSON) -
//! correct and easy to reason about; a production system would want an
//! append-only log file and periodic snapshotting instead.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::LogEntry;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Meta {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

pub struct Storage {
    meta_path: PathBuf,
    log_path: PathBuf,
}

impl Storage {
    pub fn new(data_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            meta_path: data_dir.join("meta.json"),
            log_path: data_dir.join("log.json"),
        })
    }

    pub fn load(&self) -> io::Result<(Meta, Vec<LogEntry>)> {
        let meta = if self.meta_path.exists() {
            let raw = fs::read_to_string(&self.meta_path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Meta::default()
        };

        let log = if self.log_path.exists() {
            let raw = fs::read_to_string(&self.log_path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok((meta, log))
    }

    pub fn save_meta(&self, meta: &Meta) -> io::Result<()> {
        let raw = serde_json::to_string(meta)?;
        write_atomic(&self.meta_path, &raw)
    }

    pub fn save_log(&self, log: &[LogEntry]) -> io::Result<()> {
        let raw = serde_json::to_string(log)?;
        write_atomic(&self.log_path, &raw)
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Command;

    #[test]
    fn round_trips_meta_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();

        let meta = Meta {
            current_term: 3,
            voted_for: Some("a:1".into()),
        };
        storage.save_meta(&meta).unwrap();

        let log = vec![LogEntry {
            index: 1,
            term: 1,
            command: Command::UnleaseFile {
                filename: "foo".into(),
            },
        }];
        storage.save_log(&log).unwrap();

        let (loaded_meta, loaded_log) = storage.load().unwrap();
        assert_eq!(loaded_meta.current_term, 3);
        assert_eq!(loaded_log.len(), 1);
        assert_eq!(loaded_log[0].index, 1);
    }

    #[test]
    fn missing_files_load_as_empty_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let (meta, log) = storage.load().unwrap();
        assert_eq!(meta.current_term, 0);
        assert!(log.is_empty());
    }
}
