//! Background account maintenance: enforces quotas, removes deleted and
//! superseded objects, and merges patches when a depended-on object is
//! removed so a broken chain never leaves a dangling reference.
//!
//! Object commit here follows a scoped unit-of-work: a merge stages its
//! rewritten object under a temporary ID and only registers the final ID
//! on success. If the process crashes mid-merge, [`UnitOfWork::drop`]
//! (implicit, never called directly) discards the stage rather than
//! leaving a half-rewritten object, so the old chain survives a crash
//! intact.

use crate::file_object::{self, Chunk, FileObjectError};
use crate::server::context::AccountInfo;
use crate::server::resolve::{self, ResolveError};
use crate::store::directory::{Directory, DirectoryError, EntryFlags};
use crate::store::object_id::ObjectId;
use crate::store::object_store::{ObjectStore, ObjectStoreError};
use thiserror::Error;
use tracing::{info, warn};

/// Grace period before a `Deleted`/`RemoveASAP` entry becomes eligible
/// for the sweep, matching the source format's default.
#[cfg(not(debug_assertions))]
pub const DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS: u64 = 172_800;
#[cfg(debug_assertions)]
pub const DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum HousekeepingError {
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("object store error: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("file object error: {0}")]
    FileObject(#[from] FileObjectError),
    #[error("patch chain resolution error: {0}")]
    Resolve(#[from] ResolveError),
}

/// Stages a replacement object under a temporary ID; only `commit`
/// registers it at the final ID, and only one of `commit`/`discard` may
/// run. If neither runs (panic, early return), the temp object is simply
/// orphaned — visible state never changes.
struct UnitOfWork<'a> {
    store: &'a dyn ObjectStore,
    temp_id: ObjectId,
    committed: bool,
}

impl<'a> UnitOfWork<'a> {
    fn stage(store: &'a dyn ObjectStore, bytes: &[u8]) -> Result<Self, ObjectStoreError> {
        let temp_id = store.next_id();
        store.put(temp_id, bytes)?;
        Ok(Self {
            store,
            temp_id,
            committed: false,
        })
    }

    fn commit(mut self, final_id: ObjectId) -> Result<(), ObjectStoreError> {
        let bytes = self.store.get(self.temp_id)?;
        self.store.put(final_id, &bytes)?;
        self.store.delete(self.temp_id)?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Drop for UnitOfWork<'a> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.store.delete(self.temp_id);
        }
    }
}

/// Run one housekeeping pass for an account: sweep eligible deleted/
/// removeASAP entries, merging patch chains as needed, then continue
/// deleting oldest eligible entries until under the soft limit.
pub fn run_housekeeping(
    store: &dyn ObjectStore,
    account: &mut AccountInfo,
    root_dir_id: ObjectId,
    now_unix_secs: u64,
    file_data_key: &[u8],
    block_index_key: &[u8],
) -> Result<(), HousekeepingError> {
    let mut root = load_directory(store, root_dir_id)?;

    sweep_eligible(store, &mut root, now_unix_secs, file_data_key, block_index_key)?;

    while account_over_soft_limit(account) {
        let Some(victim) = oldest_eligible_entry(&root) else {
            break;
        };
        remove_entry(store, &mut root, victim, file_data_key, block_index_key)?;
    }

    verify_no_dangling_dependencies(&root);
    rebuild_blocks_used(account, &root);

    let mut serialized = Vec::new();
    root.serialize(&mut serialized)?;
    store.put(root_dir_id, &serialized)?;

    info!(account = account.account_id, blocks_used = account.blocks_used(), "housekeeping pass complete");
    Ok(())
}

fn load_directory(store: &dyn ObjectStore, id: ObjectId) -> Result<Directory, HousekeepingError> {
    let bytes = store.get(id)?;
    Directory::deserialize(&mut std::io::Cursor::new(bytes)).map_err(HousekeepingError::Directory)
}

fn sweep_eligible(
    store: &dyn ObjectStore,
    dir: &mut Directory,
    now: u64,
    file_data_key: &[u8],
    block_index_key: &[u8],
) -> Result<(), HousekeepingError> {
    let grace_us = DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS * 1_000_000;
    let now_us = now * 1_000_000;

    let eligible: Vec<ObjectId> = dir
        .entries()
        .iter()
        .filter(|e| {
            let flagged = e.flags.contains(EntryFlags::DELETED) || e.flags.contains(EntryFlags::REMOVE_ASAP);
            flagged && now_us.saturating_sub(e.mod_time_us) >= grace_us
        })
        .map(|e| e.object_id)
        .collect();

    for victim in eligible {
        remove_entry(store, dir, victim, file_data_key, block_index_key)?;
    }
    Ok(())
}

/// Remove `victim` from `dir`, merging its dependent object first if one
/// exists so the chain is never left pointing at a missing object.
fn remove_entry(
    store: &dyn ObjectStore,
    dir: &mut Directory,
    victim: ObjectId,
    file_data_key: &[u8],
    block_index_key: &[u8],
) -> Result<(), HousekeepingError> {
    let Some(entry) = dir.entries().iter().find(|e| e.object_id == victim).cloned() else {
        return Ok(());
    };

    if entry.required_by != crate::store::object_id::NONE {
        merge_patch_chain(store, dir, entry.required_by, victim, file_data_key, block_index_key)?;
    }

    if store.exists(victim) {
        store.delete(victim)?;
    }
    dir.delete_entry(victim);
    Ok(())
}

/// Materialise the dependent object `dependent_id` (a patch referencing
/// `victim`) fully by resolving its block references through `victim`'s
/// object, re-encode it as a stand-alone full object at the same ID, and
/// clear its `dependsOn` so `victim` can be safely removed.
///
/// The re-encode is staged under a temporary ID and only registered at
/// `dependent_id` on success, so a crash mid-merge leaves either the old
/// patch chain intact (temp object orphaned) or a complete new full
/// object — never a half-rewritten one.
fn merge_patch_chain(
    store: &dyn ObjectStore,
    dir: &mut Directory,
    dependent_id: ObjectId,
    victim: ObjectId,
    file_data_key: &[u8],
    block_index_key: &[u8],
) -> Result<(), HousekeepingError> {
    warn!(dependent_id, victim, "merging patch chain before removing depended-on object");

    let (container_dir_id, mod_time_us, name, attrs, blocks) =
        resolve::materialize(store, file_data_key, block_index_key, dependent_id)?;
    let chunks: Vec<Chunk> = blocks.into_iter().map(Chunk::Data).collect();

    let mut rewritten = Vec::new();
    file_object::encode(
        &mut rewritten,
        file_data_key,
        block_index_key,
        container_dir_id,
        mod_time_us,
        &name,
        &attrs,
        &chunks,
    )?;

    let work = UnitOfWork::stage(store, &rewritten)?;
    work.commit(dependent_id)?;

    if let Some(dependent_entry) = dir.entries().iter().find(|e| e.object_id == dependent_id).cloned() {
        let mut updated = dependent_entry;
        updated.depends_on = crate::store::object_id::NONE;
        dir.add_entry(updated);
    }
    Ok(())
}

fn account_over_soft_limit(account: &AccountInfo) -> bool {
    account.blocks_used() > account.soft_limit
}

/// Oldest `OldVersion`/`Deleted` entry by modification time, preferring
/// old versions before deleted files per the sweep ordering.
fn oldest_eligible_entry(dir: &Directory) -> Option<ObjectId> {
    dir.entries()
        .iter()
        .filter(|e| e.flags.contains(EntryFlags::OLD_VERSION) || e.flags.contains(EntryFlags::DELETED))
        .min_by_key(|e| (!e.flags.contains(EntryFlags::OLD_VERSION), e.mod_time_us))
        .map(|e| e.object_id)
}

fn verify_no_dangling_dependencies(dir: &Directory) {
    let ids: std::collections::HashSet<ObjectId> = dir.entries().iter().map(|e| e.object_id).collect();
    for entry in dir.entries() {
        debug_assert!(
            entry.depends_on == crate::store::object_id::NONE || ids.contains(&entry.depends_on),
            "dangling dependsOn after housekeeping"
        );
    }
}

fn rebuild_blocks_used(account: &mut AccountInfo, dir: &Directory) {
    let mut current = 0u64;
    let mut old = 0u64;
    let mut deleted = 0u64;
    for entry in dir.entries() {
        if entry.flags.contains(EntryFlags::DELETED) {
            deleted += entry.size_blocks;
        } else if entry.flags.contains(EntryFlags::OLD_VERSION) {
            old += entry.size_blocks;
        } else {
            current += entry.size_blocks;
        }
    }
    account.blocks_current = current;
    account.blocks_old = old;
    account.blocks_deleted = deleted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_codec::EncodedName;
    use crate::store::object_store::MemoryObjectStore;

    fn entry(id: ObjectId, flags: EntryFlags, mod_time_us: u64, size_blocks: u64) -> crate::store::directory::DirectoryEntry {
        crate::store::directory::DirectoryEntry {
            name: EncodedName::from_bytes(format!("e{id}").into_bytes()),
            object_id: id,
            mod_time_us,
            attr_hash: 0,
            size_blocks,
            flags,
            attributes: None,
            depends_on: crate::store::object_id::NONE,
            required_by: crate::store::object_id::NONE,
        }
    }

    #[test]
    fn sweep_removes_old_enough_deleted_entries() {
        let store = MemoryObjectStore::new();
        let root_id = store.next_id();
        let mut dir = Directory::new(root_id, 0);
        dir.add_entry(entry(100, EntryFlags::FILE | EntryFlags::DELETED, 0, 5));
        store.put(100, b"obj").unwrap();
        let mut buf = Vec::new();
        dir.serialize(&mut buf).unwrap();
        store.put(root_id, &buf).unwrap();

        let mut account = AccountInfo {
            account_id: 1,
            soft_limit: 1_000_000,
            hard_limit: 2_000_000,
            ..Default::default()
        };

        let far_future_secs = DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS * 10;
        run_housekeeping(&store, &mut account, root_id, far_future_secs, &[0x22; 56], &[0x33; 56]).unwrap();

        let reloaded = load_directory(&store, root_id).unwrap();
        assert!(reloaded.entries().is_empty());
        assert!(!store.exists(100));
    }

    #[test]
    fn entries_within_grace_period_survive() {
        let store = MemoryObjectStore::new();
        let root_id = store.next_id();
        let mut dir = Directory::new(root_id, 0);
        dir.add_entry(entry(100, EntryFlags::FILE | EntryFlags::DELETED, 0, 5));
        store.put(100, b"obj").unwrap();
        let mut buf = Vec::new();
        dir.serialize(&mut buf).unwrap();
        store.put(root_id, &buf).unwrap();

        let mut account = AccountInfo {
            account_id: 1,
            soft_limit: 1_000_000,
            hard_limit: 2_000_000,
            ..Default::default()
        };

        run_housekeeping(&store, &mut account, root_id, 1, &[0x22; 56], &[0x33; 56]).unwrap();

        let reloaded = load_directory(&store, root_id).unwrap();
        assert_eq!(reloaded.entries().len(), 1);
    }

    #[test]
    fn merging_a_patch_chain_leaves_the_dependent_decodable_after_the_victim_is_gone() {
        use crate::attr_block::{self, Attributes};
        use crate::file_object::{self, Chunk};
        use crate::name_codec;

        let fname_key = [0x11u8; 56];
        let attr_key = [0x44u8; 56];
        let data_key = [0x22u8; 56];
        let index_key = [0x33u8; 56];

        let store = MemoryObjectStore::new();
        let root_id = store.next_id();

        let original = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let block_size = file_object::choose_block_size(original.len() as u64);
        let chunks: Vec<Chunk> = file_object::split_blocks(&original, block_size)
            .into_iter()
            .map(|b| Chunk::Data(b.to_vec()))
            .collect();
        let name = name_codec::encode(&fname_key, "report.txt");
        let attrs = Attributes {
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_us: 1,
            is_symlink: false,
            symlink_target: None,
            xattrs: vec![],
        };
        let attr_block = attr_block::encode(&attr_key, &attrs);

        let mut full_bytes = Vec::new();
        let full_index =
            file_object::encode(&mut full_bytes, &data_key, &index_key, root_id, 1, &name, &attr_block, &chunks)
                .unwrap();
        let victim_id = store.next_id();
        store.put(victim_id, &full_bytes).unwrap();

        let mut edited = original.clone();
        edited[10] ^= 0xff;
        let token = crate::diff::CancellationToken::new();
        let diff_result = crate::diff::diff(&edited, victim_id, &full_index, &token);
        assert!(!diff_result.is_completely_different);

        let mut patch_bytes = Vec::new();
        file_object::encode(
            &mut patch_bytes,
            &data_key,
            &index_key,
            root_id,
            2,
            &name,
            &attr_block,
            &diff_result.chunks,
        )
        .unwrap();
        let dependent_id = store.next_id();
        store.put(dependent_id, &patch_bytes).unwrap();

        let mut dir = Directory::new(root_id, 0);
        let mut victim_entry = entry(victim_id, EntryFlags::FILE | EntryFlags::DELETED, 0, 5);
        victim_entry.required_by = dependent_id;
        dir.add_entry(victim_entry);
        let mut dependent_entry = entry(dependent_id, EntryFlags::FILE, 2, 5);
        dependent_entry.depends_on = victim_id;
        dir.add_entry(dependent_entry);
        let mut buf = Vec::new();
        dir.serialize(&mut buf).unwrap();
        store.put(root_id, &buf).unwrap();

        let mut account = AccountInfo {
            account_id: 1,
            soft_limit: 1_000_000,
            hard_limit: 2_000_000,
            ..Default::default()
        };
        let far_future_secs = DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS * 10;
        run_housekeeping(&store, &mut account, root_id, far_future_secs, &data_key, &index_key).unwrap();

        assert!(!store.exists(victim_id));
        assert!(store.exists(dependent_id));

        let mut cursor = std::io::Cursor::new(store.get(dependent_id).unwrap());
        let (_, _, _, _, resolved) =
            file_object::decode(&mut cursor, &data_key, &index_key, |_, _| unreachable!("no references should remain")).unwrap();
        assert_eq!(resolved, edited);
    }
}
