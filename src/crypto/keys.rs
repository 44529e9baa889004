//! Role-separated key material, loaded once per daemon from a fixed-layout
//! key file (`KeysFile` in the configuration). The layout mirrors the
//! original key-material format byte-for-byte: a flat 1024-byte file with
//! fixed offsets per role, generated once by an operator and never
//! transmitted or rotated automatically.

use std::fs;
use std::path::Path;
use thiserror::Error;

/// Total on-disk size of the key material file.
pub const CRYPTO_KEYS_FILE_SIZE: usize = 1024;

const FILENAME_KEY_START: usize = 0;
const FILENAME_KEY_LEN: usize = 56;
const ATTRIBUTES_KEY_START: usize = FILENAME_KEY_START + 64;
const ATTRIBUTES_KEY_LEN: usize = 56;
const FILE_KEY_START: usize = ATTRIBUTES_KEY_START + 64;
const FILE_KEY_LEN: usize = 56;
const BLOCK_INDEX_KEY_START: usize = FILE_KEY_START + 64;
const BLOCK_INDEX_KEY_LEN: usize = 56;
const ATTR_HASH_SECRET_START: usize = BLOCK_INDEX_KEY_START + 64;
const ATTR_HASH_SECRET_LEN: usize = 128;

/// Which symmetric role a key is used for. Never serialised; purely an
/// in-process selector into [`KeySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Filename,
    Attributes,
    FileData,
    BlockIndex,
}

#[derive(Error, Debug)]
pub enum KeysError {
    #[error("key material file must be exactly {CRYPTO_KEYS_FILE_SIZE} bytes, got {0}")]
    WrongSize(usize),
    #[error("io error reading key material: {0}")]
    Io(#[from] std::io::Error),
}

/// Every role's key, held in memory for the lifetime of the daemon.
#[derive(Clone)]
pub struct KeySet {
    filename_key: Vec<u8>,
    attributes_key: Vec<u8>,
    file_data_key: Vec<u8>,
    block_index_key: Vec<u8>,
    attr_hash_secret: Vec<u8>,
}

impl KeySet {
    /// Load from a key material file on disk.
    pub fn load(path: &Path) -> Result<Self, KeysError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Parse an in-memory key material buffer (used by tests and by
    /// `load`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeysError> {
        if bytes.len() != CRYPTO_KEYS_FILE_SIZE {
            return Err(KeysError::WrongSize(bytes.len()));
        }
        let slice = |start: usize, len: usize| bytes[start..start + len].to_vec();
        Ok(Self {
            filename_key: slice(FILENAME_KEY_START, FILENAME_KEY_LEN),
            attributes_key: slice(ATTRIBUTES_KEY_START, ATTRIBUTES_KEY_LEN),
            file_data_key: slice(FILE_KEY_START, FILE_KEY_LEN),
            block_index_key: slice(BLOCK_INDEX_KEY_START, BLOCK_INDEX_KEY_LEN),
            attr_hash_secret: slice(ATTR_HASH_SECRET_START, ATTR_HASH_SECRET_LEN),
        })
    }

    /// Generate a fresh, random key set — used by tests and by key
    /// provisioning tooling (not part of the daemon's runtime path).
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut buf = vec![0u8; CRYPTO_KEYS_FILE_SIZE];
        rand::thread_rng().fill_bytes(&mut buf);
        Self::from_bytes(&buf).expect("buffer is exactly CRYPTO_KEYS_FILE_SIZE")
    }

    pub fn key_for(&self, role: KeyRole) -> &[u8] {
        match role {
            KeyRole::Filename => &self.filename_key,
            KeyRole::Attributes => &self.attributes_key,
            KeyRole::FileData => &self.file_data_key,
            KeyRole::BlockIndex => &self.block_index_key,
        }
    }

    pub fn attr_hash_secret(&self) -> &[u8] {
        &self.attr_hash_secret
    }
}
