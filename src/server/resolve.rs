//! Server-side patch-chain resolution: walking `dependsOn`/`Prior` block
//! references across stored objects to materialise a stand-alone plaintext,
//! without ever touching a filename or attribute key.
//!
//! [`GetFile`](crate::protocol::messages::Message::GetFile) and
//! [`housekeeping`](crate::server::housekeeping)'s merge step both need
//! this: a patch object's block index only records where each block
//! physically lives (`SelfOffset` in some object), so resolving one
//! `Prior { object_id, ordinal }` reference means decoding that object,
//! which may itself contain further references to other objects.

use crate::file_object::index::BlockLocation;
use crate::file_object::{self, FileObjectError};
use crate::store::object_store::ObjectStore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("object {0} not found while resolving a patch chain")]
    NotFound(u64),
    #[error("object {object_id} has no block at ordinal {ordinal}")]
    NoSuchOrdinal { object_id: u64, ordinal: u32 },
    #[error(transparent)]
    FileObject(#[from] FileObjectError),
    #[error(transparent)]
    Store(#[from] crate::store::object_store::ObjectStoreError),
}

// `file_object::decode`'s `resolve` callback returns `FileObjectError`, so
// store/ordinal lookup failures are folded into it at the call site and
// unwrapped back into `ResolveError` once decoding returns.
impl From<ResolveError> for FileObjectError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::FileObject(inner) => inner,
            other => FileObjectError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
        }
    }
}

/// Fetch and decode `object_id`'s block at `ordinal`, recursively
/// resolving any further `Prior` references it contains. This is the
/// `resolve` hook `file_object::decode`/`decode_blocks` needs, made
/// self-referential across the whole chain.
pub fn resolve_block(
    store: &dyn ObjectStore,
    file_data_key: &[u8],
    block_index_key: &[u8],
    object_id: u64,
    ordinal: u32,
) -> Result<Vec<u8>, ResolveError> {
    let bytes = store
        .get(object_id)
        .map_err(|_| ResolveError::NotFound(object_id))?;
    let mut cursor = std::io::Cursor::new(bytes);
    let (_, _, _, _, blocks, index) = file_object::decode_blocks(
        &mut cursor,
        file_data_key,
        block_index_key,
        |ref_object_id, ref_ordinal| {
            resolve_block(store, file_data_key, block_index_key, ref_object_id, ref_ordinal)
                .map_err(FileObjectError::from)
        },
    )?;

    index
        .iter()
        .position(|entry| matches!(entry.location, BlockLocation::SelfOffset(o) if o as u32 == ordinal))
        .map(|pos| blocks[pos].clone())
        .ok_or(ResolveError::NoSuchOrdinal { object_id, ordinal })
}

/// Fully materialise a stored object's plaintext, resolving any patch
/// references transitively through the objects it depends on. Used by
/// `GetFile` to hand back a stand-alone stream regardless of whether the
/// object is stored whole or as a patch, and by housekeeping to re-encode
/// a patch as a full object before its victim is deleted.
pub fn materialize(
    store: &dyn ObjectStore,
    file_data_key: &[u8],
    block_index_key: &[u8],
    object_id: u64,
) -> Result<(u64, u64, crate::name_codec::EncodedName, crate::attr_block::AttrBlock, Vec<Vec<u8>>), ResolveError> {
    let bytes = store
        .get(object_id)
        .map_err(|_| ResolveError::NotFound(object_id))?;
    let mut cursor = std::io::Cursor::new(bytes);
    let (container_dir_id, mod_time_us, name, attrs, blocks, _index) = file_object::decode_blocks(
        &mut cursor,
        file_data_key,
        block_index_key,
        |ref_object_id, ref_ordinal| {
            resolve_block(store, file_data_key, block_index_key, ref_object_id, ref_ordinal)
                .map_err(FileObjectError::from)
        },
    )?;
    Ok((container_dir_id, mod_time_us, name, attrs, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr_block::{self, Attributes};
    use crate::diff::{self, CancellationToken};
    use crate::file_object::Chunk;
    use crate::name_codec;
    use crate::store::object_store::MemoryObjectStore;

    fn keys() -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        (vec![0x01; 56], vec![0x02; 56], vec![0x03; 56], vec![0x04; 56])
    }

    fn attrs() -> Attributes {
        Attributes {
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_us: 1,
            is_symlink: false,
            symlink_target: None,
            xattrs: vec![],
        }
    }

    #[test]
    fn resolves_a_single_hop_patch_chain() {
        let (fname_key, attr_key, data_key, index_key) = keys();
        let store = MemoryObjectStore::new();

        let original = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let block_size = file_object::choose_block_size(original.len() as u64);
        let chunks: Vec<Chunk> = file_object::split_blocks(&original, block_size)
            .into_iter()
            .map(|b| Chunk::Data(b.to_vec()))
            .collect();
        let name = name_codec::encode(&fname_key, "a.txt");
        let attr_block = attr_block::encode(&attr_key, &attrs());

        let mut full_bytes = Vec::new();
        let full_index = file_object::encode(
            &mut full_bytes,
            &data_key,
            &index_key,
            1,
            1,
            &name,
            &attr_block,
            &chunks,
        )
        .unwrap();
        let full_id = store.next_id();
        store.put(full_id, &full_bytes).unwrap();

        let mut edited = original.clone();
        edited[10] ^= 0xff;
        let token = CancellationToken::new();
        let result = diff::diff(&edited, full_id, &full_index, &token);
        assert!(!result.is_completely_different);

        let mut patch_bytes = Vec::new();
        file_object::encode(
            &mut patch_bytes,
            &data_key,
            &index_key,
            1,
            2,
            &name,
            &attr_block,
            &result.chunks,
        )
        .unwrap();
        let patch_id = store.next_id();
        store.put(patch_id, &patch_bytes).unwrap();

        let (_, _, _, _, blocks) = materialize(&store, &data_key, &index_key, patch_id).unwrap();
        assert_eq!(blocks.concat(), edited);
    }
}
