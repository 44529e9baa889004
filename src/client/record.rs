//! The directory record: a tree mirroring the server directory layout,
//! cached across runs so a sync cycle can tell which local files are
//! unchanged without re-hashing or re-uploading them.
//!
//! Persisted as JSON via `serde_json` to a temp file, then renamed over
//! the live record — the same atomic-replace pattern the object store
//! uses for object writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What the client last saw for one child of a directory: used to decide
/// whether a local file needs re-uploading without touching the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub last_seen_mod_time_us: u64,
    pub last_seen_attr_hash: u64,
    pub server_object_id: u64,
    pub is_directory: bool,
}

/// One directory's worth of cached child state, keyed by local filename
/// (not the encoded name — this lives entirely client-side).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub server_object_id: u64,
    pub children: HashMap<String, ChildRecord>,
    #[serde(default)]
    pub subdirectories: HashMap<String, DirectoryRecord>,
}

impl DirectoryRecord {
    pub fn new(server_object_id: u64) -> Self {
        Self {
            server_object_id,
            children: HashMap::new(),
            subdirectories: HashMap::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&ChildRecord> {
        self.children.get(name)
    }

    pub fn set_child(&mut self, name: &str, record: ChildRecord) {
        self.children.insert(name.to_string(), record);
    }

    pub fn remove_child(&mut self, name: &str) -> Option<ChildRecord> {
        self.children.remove(name)
    }

    pub fn subdirectory(&self, name: &str) -> Option<&DirectoryRecord> {
        self.subdirectories.get(name)
    }

    pub fn subdirectory_mut(&mut self, name: &str) -> Option<&mut DirectoryRecord> {
        self.subdirectories.get_mut(name)
    }

    pub fn ensure_subdirectory(&mut self, name: &str, server_object_id: u64) -> &mut DirectoryRecord {
        self.subdirectories
            .entry(name.to_string())
            .or_insert_with(|| DirectoryRecord::new(server_object_id))
    }

    pub fn remove_subdirectory(&mut self, name: &str) -> Option<DirectoryRecord> {
        self.subdirectories.remove(name)
    }

    /// Names present in the record but absent from `current_names` — the
    /// candidates for the delete queue.
    pub fn stale_children<'a>(&'a self, current_names: &[String]) -> Vec<&'a str> {
        self.children
            .keys()
            .filter(|name| !current_names.contains(&name.to_string()))
            .map(String::as_str)
            .collect()
    }
}

/// A per-location exclude filter: a list of path prefixes (as configured)
/// that are tracked so reinstatement later isn't silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExcludeFilter {
    prefixes: Vec<String>,
}

impl ExcludeFilter {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn excludes(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.prefixes.iter().any(|p| path_str.starts_with(p.as_str()))
    }
}

/// The full persisted state for one backup location: its root directory
/// record, exclude filter, and the end of the last completed sync window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationState {
    pub root: DirectoryRecord,
    pub exclude: ExcludeFilter,
    pub last_sync_end_us: u64,
}

impl LocationState {
    pub fn new(root_server_object_id: u64, exclude: ExcludeFilter) -> Self {
        Self {
            root: DirectoryRecord::new(root_server_object_id),
            exclude,
            last_sync_end_us: 0,
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write via a temp file in the same directory, then rename — the
    /// record is never observed half-written.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
