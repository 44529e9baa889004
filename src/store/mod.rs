//! Store-side object model: directories, the object ID space, and the
//! pluggable object store backing the account's block data.

pub mod directory;
pub mod object_id;
pub mod object_store;

pub use directory::{Directory, DirectoryEntry, DirectoryError, EntryFlags};
pub use object_id::ObjectId;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
