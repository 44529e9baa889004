//! The trait boundary to the black-box RAID-like store. Only get/put/
//! exists/delete by 64-bit ID matter here; the on-disk layout of a real
//! deployment's redundant store is out of scope. Two implementations are
//! provided: an in-memory store for tests, and a single-directory
//! filesystem store (one file per object, named by hex ID) for small real
//! deployments.

use crate::store::object_id::{ObjectId, ObjectIdAllocator, ROOT_DIRECTORY_ID};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub trait ObjectStore: Send + Sync {
    fn get(&self, id: ObjectId) -> Result<Vec<u8>, ObjectStoreError>;
    fn put(&self, id: ObjectId, bytes: &[u8]) -> Result<(), ObjectStoreError>;
    fn exists(&self, id: ObjectId) -> bool;
    fn delete(&self, id: ObjectId) -> Result<(), ObjectStoreError>;
    fn next_id(&self) -> ObjectId;
}

/// In-memory object store. Used by unit tests and the sync-loop tests;
/// never durable across process restarts.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    allocator: Mutex<ObjectIdAllocator>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            allocator: Mutex::new(ObjectIdAllocator::starting_from(ROOT_DIRECTORY_ID)),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, id: ObjectId) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ObjectStoreError::NotFound(id))
    }

    fn put(&self, id: ObjectId, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().insert(id, bytes.to_vec());
        Ok(())
    }

    fn exists(&self, id: ObjectId) -> bool {
        self.objects.lock().unwrap().contains_key(&id)
    }

    fn delete(&self, id: ObjectId) -> Result<(), ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(ObjectStoreError::NotFound(id))
    }

    fn next_id(&self) -> ObjectId {
        self.allocator.lock().unwrap().allocate()
    }
}

/// One file per object, named by its hex-encoded ID, under a single
/// directory. Suitable for small real deployments; the production
/// RAID-like layout this stands in for is out of scope.
pub struct FsObjectStore {
    root: PathBuf,
    allocator: Mutex<ObjectIdAllocator>,
}

impl FsObjectStore {
    pub fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        let highest = fs::read_dir(&root)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| u64::from_str_radix(&name, 16).ok())
            .max()
            .unwrap_or(ROOT_DIRECTORY_ID);
        Ok(Self {
            root,
            allocator: Mutex::new(ObjectIdAllocator::starting_from(highest)),
        })
    }

    fn path_for(&self, id: ObjectId) -> PathBuf {
        self.root.join(format!("{id:016x}"))
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, id: ObjectId) -> Result<Vec<u8>, ObjectStoreError> {
        fs::read(self.path_for(id)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ObjectStoreError::NotFound(id),
            _ => ObjectStoreError::Io(e),
        })
    }

    fn put(&self, id: ObjectId, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let tmp = self.root.join(format!(".{id:016x}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path_for(id))?;
        Ok(())
    }

    fn exists(&self, id: ObjectId) -> bool {
        self.path_for(id).exists()
    }

    fn delete(&self, id: ObjectId) -> Result<(), ObjectStoreError> {
        fs::remove_file(self.path_for(id)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ObjectStoreError::NotFound(id),
            _ => ObjectStoreError::Io(e),
        })
    }

    fn next_id(&self) -> ObjectId {
        self.allocator.lock().unwrap().allocate()
    }
}
