//! # vaultsync — block-level, deduplicating, encrypted backup
//!
//! Design guarantees:
//! - All wire and on-disk integers are big-endian, consistently across the
//!   protocol, encoded file objects, and directory serialisation.
//! - Every stored object is addressed by a 64-bit ID; the object store
//!   abstraction (`store::object_store`) is the only place that knows
//!   whether an object lives on a local filesystem or somewhere else.
//! - Filenames and file data are encrypted client-side; the server never
//!   holds a key and matches/sorts only on ciphertext.
//! - An encoded file object's block index can depend on blocks physically
//!   stored in an earlier object (`dependsOn`/`requiredBy`); housekeeping
//!   merges these chains before a depended-on object is ever removed.

pub mod attr_block;
pub mod client;
pub mod config;
pub mod crypto;
pub mod diff;
pub mod error;
pub mod file_object;
pub mod logging;
pub mod name_codec;
pub mod protocol;
pub mod server;
pub mod store;

pub use crypto::{CryptoError, KeyRole, KeySet};
pub use error::{Error, Result};
pub use file_object::{Chunk, FileObjectError};
pub use name_codec::EncodedName;
pub use protocol::Message;
pub use store::{Directory, DirectoryEntry, DirectoryError, ObjectId, ObjectStore};
