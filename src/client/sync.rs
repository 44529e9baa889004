//! The client sync loop: walks each configured backup location against
//! its directory record, decides what to upload, defer, or delete, and
//! talks to the store through the [`ServerSession`] trait.
//!
//! [`ServerSession`] abstracts the transport exactly the way
//! [`crate::store::object_store::ObjectStore`] abstracts the store's
//! on-disk layout: the decision logic below never depends on how a
//! session is actually wired to a socket, so it is exercised here against
//! an in-memory fake and is free of any TLS/TCP concern.

use crate::attr_block::{self, Attributes};
use crate::client::record::{ChildRecord, ExcludeFilter, LocationState};
use crate::diff::{self, CancellationToken};
use crate::file_object::index::BlockIndexEntry;
use crate::file_object::Chunk;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("server rejected operation: {0}")]
    Server(String),
    #[error("filesystem error reading {path}: {source}")]
    Filesystem { path: PathBuf, source: std::io::Error },
    #[error("account is over its storage quota")]
    QuotaExceeded,
}

/// What the sync loop needs from a live connection to the store. A real
/// implementation wraps the protocol framing in `crate::protocol` over a
/// TLS stream; tests use an in-memory fake.
pub trait ServerSession {
    fn find_child(&mut self, container_id: u64, name: &str) -> Result<Option<u64>, SyncError>;
    fn get_block_index(&mut self, object_id: u64) -> Result<Vec<BlockIndexEntry>, SyncError>;
    fn create_directory(&mut self, container_id: u64, name: &str, attrs: &Attributes) -> Result<u64, SyncError>;
    fn store_file(
        &mut self,
        container_id: u64,
        name: &str,
        mod_time_us: u64,
        attrs: &Attributes,
        chunks: Vec<Chunk>,
        diff_from_id: u64,
    ) -> Result<u64, SyncError>;
    fn delete_file(&mut self, container_id: u64, name: &str) -> Result<(), SyncError>;
    fn keep_alive(&mut self) -> Result<(), SyncError>;
    fn quota_exceeded(&self) -> bool;
}

/// One file or directory found during the local tree walk.
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_directory: bool,
    pub mod_time_us: u64,
    pub size: u64,
    pub attrs: Attributes,
}

/// Reads local metadata for every direct child of `dir`, skipping entries
/// the exclude filter rejects. Does not recurse — the caller drives
/// recursion per subdirectory.
pub fn list_local_children(dir: &Path, exclude: &ExcludeFilter) -> Result<Vec<LocalEntry>, SyncError> {
    let mut out = Vec::new();
    let read_dir = fs::read_dir(dir).map_err(|e| SyncError::Filesystem { path: dir.to_path_buf(), source: e })?;
    for entry in read_dir {
        let entry = entry.map_err(|e| SyncError::Filesystem { path: dir.to_path_buf(), source: e })?;
        let path = entry.path();
        if exclude.excludes(&path) {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| SyncError::Filesystem { path: path.clone(), source: e })?;
        let mod_time_us = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let name = entry.file_name().to_string_lossy().to_string();
        let attrs = Attributes {
            mode: unix_mode(&metadata),
            uid: unix_uid(&metadata),
            gid: unix_gid(&metadata),
            mtime_us: mod_time_us,
            is_symlink: metadata.is_symlink(),
            symlink_target: None,
            xattrs: Vec::new(),
        };
        out.push(LocalEntry {
            name,
            path,
            is_directory: metadata.is_dir(),
            mod_time_us,
            size: metadata.len(),
            attrs,
        });
    }
    Ok(out)
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}
#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn unix_uid(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.uid()
}
#[cfg(not(unix))]
fn unix_uid(_metadata: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn unix_gid(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.gid()
}
#[cfg(not(unix))]
fn unix_gid(_metadata: &fs::Metadata) -> u32 {
    0
}

/// Whether `entry` falls inside the configured sync window: new enough
/// that it might still be changing, unless it has been waiting past
/// `max_upload_wait_secs`, in which case it is uploaded regardless.
pub enum WindowDecision {
    Upload,
    Defer,
    Skip,
}

pub struct SyncCycle<'a> {
    pub location_name: &'a str,
    pub minimum_file_age_secs: u64,
    pub max_upload_wait_secs: u64,
    pub file_tracking_size_threshold: u64,
    pub diffing_upload_size_threshold: u64,
    pub maximum_diffing_time_secs: u64,
}

impl<'a> SyncCycle<'a> {
    /// `now_us` and `lastSyncEnd` delimit the safe window: files modified
    /// before `now_us - minimumFileAge` are stable enough to upload.
    fn decide_window(&self, mod_time_us: u64, first_seen_us: u64, now_us: u64) -> WindowDecision {
        let min_age_us = self.minimum_file_age_secs * 1_000_000;
        let safe_cutoff = now_us.saturating_sub(min_age_us);
        if mod_time_us <= safe_cutoff {
            return WindowDecision::Upload;
        }
        let waited_us = now_us.saturating_sub(first_seen_us);
        if self.max_upload_wait_secs > 0 && waited_us >= self.max_upload_wait_secs * 1_000_000 {
            return WindowDecision::Upload;
        }
        WindowDecision::Defer
    }

    /// Run one sync pass over a single directory level (non-recursive;
    /// the caller recurses into subdirectories using the returned record).
    pub fn sync_directory(
        &self,
        session: &mut dyn ServerSession,
        local_dir: &Path,
        state: &mut LocationState,
        container_id: u64,
        now_us: u64,
    ) -> Result<Vec<PathBuf>, SyncError> {
        let local_entries = list_local_children(local_dir, &state.exclude)?;
        let current_names: Vec<String> = local_entries.iter().map(|e| e.name.clone()).collect();
        let mut subdirs_to_recurse = Vec::new();

        for entry in &local_entries {
            if entry.is_directory {
                let existing = state.root.child(&entry.name).map(|c| c.server_object_id);
                let server_id = match existing {
                    Some(id) => id,
                    None => session.create_directory(container_id, &entry.name, &entry.attrs)?,
                };
                state.root.set_child(
                    &entry.name,
                    ChildRecord {
                        last_seen_mod_time_us: entry.mod_time_us,
                        last_seen_attr_hash: 0,
                        server_object_id: server_id,
                        is_directory: true,
                    },
                );
                state.root.ensure_subdirectory(&entry.name, server_id);
                subdirs_to_recurse.push(entry.path.clone());
                continue;
            }

            let attr_secret = [0u8; 128];
            let attr_hash = attr_block::hash(&attr_secret, &entry.attrs);
            if let Some(record) = state.root.child(&entry.name) {
                if record.last_seen_mod_time_us == entry.mod_time_us && record.last_seen_attr_hash == attr_hash {
                    continue;
                }
            }

            match self.decide_window(entry.mod_time_us, entry.mod_time_us, now_us) {
                WindowDecision::Skip => continue,
                WindowDecision::Defer => {
                    debug!(file = %entry.name, "deferring upload, inside unsafe mtime window");
                    continue;
                }
                WindowDecision::Upload => {}
            }

            if session.quota_exceeded() {
                warn!(location = self.location_name, "storage quota exceeded, uploads suspended this cycle");
                return Err(SyncError::QuotaExceeded);
            }

            let existing_id = session.find_child(container_id, &entry.name)?;
            let data = fs::read(&entry.path).map_err(|e| SyncError::Filesystem { path: entry.path.clone(), source: e })?;

            let (chunks, diff_from_id) = if let Some(prior_id) = existing_id {
                if entry.size >= self.diffing_upload_size_threshold {
                    let prior_index = session.get_block_index(prior_id)?;
                    let token = CancellationToken::new();
                    if self.maximum_diffing_time_secs > 0 {
                        schedule_cancellation(token.clone(), Duration::from_secs(self.maximum_diffing_time_secs));
                    }
                    let result = diff::diff(&data, prior_id, &prior_index, &token);
                    (result.chunks, prior_id)
                } else {
                    (full_upload_chunks(&data), 0)
                }
            } else {
                (full_upload_chunks(&data), 0)
            };

            let new_id = session.store_file(container_id, &entry.name, entry.mod_time_us, &entry.attrs, chunks, diff_from_id)?;
            state.root.set_child(
                &entry.name,
                ChildRecord {
                    last_seen_mod_time_us: entry.mod_time_us,
                    last_seen_attr_hash: attr_hash,
                    server_object_id: new_id,
                    is_directory: false,
                },
            );
            info!(file = %entry.name, object_id = new_id, "uploaded");
        }

        let stale: Vec<String> = state
            .root
            .stale_children(&current_names)
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in &stale {
            session.delete_file(container_id, name)?;
            state.root.remove_child(name);
            state.root.remove_subdirectory(name);
        }

        Ok(subdirs_to_recurse)
    }
}

fn full_upload_chunks(data: &[u8]) -> Vec<Chunk> {
    let block_size = crate::file_object::choose_block_size(data.len() as u64);
    crate::file_object::split_blocks(data, block_size)
        .into_iter()
        .map(|b| Chunk::Data(b.to_vec()))
        .collect()
}

fn schedule_cancellation(token: CancellationToken, after: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(after);
        token.cancel();
    });
}
