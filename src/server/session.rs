//! Per-connection request dispatch: reads framed [`Message`]s off a
//! `Read + Write` stream and applies them to a [`StoreContext`], an
//! [`ObjectStore`], and the directory tree, replying with `Success`/
//! `Error`. `StoreFile`/`GetObject`/`GetFile`/`ListDirectory` carry their
//! bulk payload as a sub-stream immediately following the reply, per the
//! framing's own convention. One call to [`serve_connection`] handles one
//! connection end to end; the binary spawns one OS thread per accepted
//! connection.

use crate::crypto::keys::{KeyRole, KeySet};
use crate::file_object::{self, Chunk, FileObjectError};
use crate::name_codec::EncodedName;
use crate::protocol::messages::{Message, LOGIN_FLAG_READ_WRITE};
use crate::protocol::{self, ProtocolError, SubStreamReader, SubStreamWriter};
use crate::server::context::{AccountInfo, AccountLocks, ContextError, Phase, StoreContext};
use crate::server::resolve::{self, ResolveError};
use crate::store::directory::{Directory, DirectoryError, DirectoryEntry, EntryFlags};
use crate::store::object_id::{ObjectId, NONE};
use crate::store::object_store::{ObjectStore, ObjectStoreError};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

const SUBSTREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("object store error: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("file object error: {0}")]
    FileObject(#[from] FileObjectError),
    #[error("patch chain resolution error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown account {0}")]
    UnknownAccount(u64),
}

/// Shared, cross-connection server state. A single account is served per
/// process, matching the one-writer-per-account concurrency model; a
/// `parent_of` map stands in for the reverse directory-tree links a real
/// deployment's directory cache would maintain, so directory-targeted
/// operations (`DeleteDirectory`, `MoveObject`, `ChangeDirAttributes`) can
/// find the entry describing an object without a full tree walk from the
/// root on every request.
pub struct ServerState {
    pub store: Arc<dyn ObjectStore>,
    pub account: Arc<Mutex<AccountInfo>>,
    pub locks: Arc<AccountLocks>,
    pub keys: Arc<KeySet>,
    pub root_dir_id: ObjectId,
    parent_of: Mutex<HashMap<ObjectId, ObjectId>>,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        account: AccountInfo,
        locks: Arc<AccountLocks>,
        keys: Arc<KeySet>,
        root_dir_id: ObjectId,
    ) -> Self {
        Self {
            store,
            account: Arc::new(Mutex::new(account)),
            locks,
            keys,
            root_dir_id,
            parent_of: Mutex::new(HashMap::new()),
        }
    }

    fn remember_parent(&self, child: ObjectId, parent: ObjectId) {
        self.parent_of.lock().unwrap().insert(child, parent);
    }

    fn parent_of(&self, child: ObjectId) -> Option<ObjectId> {
        self.parent_of.lock().unwrap().get(&child).copied()
    }
}

/// Drive one connection's request/response loop until the peer sends
/// `Finished` or closes the stream.
pub fn serve_connection<S: Read + Write>(stream: &mut S, state: &ServerState) -> Result<(), SessionError> {
    let mut ctx = StoreContext::new(state.locks.clone());

    loop {
        let msg = match Message::read(stream) {
            Ok(m) => m,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if matches!(msg, Message::Finished) {
            ctx.finish();
            Message::Finished.write(stream)?;
            return Ok(());
        }

        if let Err(err) = dispatch(&mut ctx, state, msg, stream) {
            warn!(error = %err, "request failed");
            Message::Error { kind: 1, sub_kind: 0 }.write(stream)?;
        }
    }
}

fn dispatch<S: Read + Write>(
    ctx: &mut StoreContext,
    state: &ServerState,
    msg: Message,
    stream: &mut S,
) -> Result<(), SessionError> {
    match msg {
        Message::Version(v) => {
            ctx.handle_version()?;
            if v != protocol::PROTOCOL_VERSION {
                return Err(ProtocolError::WrongVersion(v).into());
            }
            Message::VersionConfirmed(protocol::PROTOCOL_VERSION).write(stream)?;
        }

        Message::Login { account, flags } => {
            let mut acc = state.account.lock().unwrap();
            if account != acc.account_id {
                return Err(SessionError::UnknownAccount(account));
            }
            let write_requested = flags & LOGIN_FLAG_READ_WRITE != 0;
            let marker = ctx.handle_login(&mut acc, write_requested)?;
            Message::LoginConfirmed {
                marker,
                blocks_used: acc.blocks_used(),
                blocks_soft_limit: acc.soft_limit,
                blocks_hard_limit: acc.hard_limit,
            }
            .write(stream)?;
        }

        Message::SetClientStoreMarker { marker } => {
            let mut acc = state.account.lock().unwrap();
            ctx.set_client_store_marker(&mut acc, marker)?;
            Message::Success { obj_id: NONE }.write(stream)?;
        }

        Message::GetIsAlive => Message::Success { obj_id: NONE }.write(stream)?,

        Message::ListDirectory { obj_id, must_have, must_not_have, want_attrs } => {
            require_authed(ctx)?;
            let dir = load_directory(&*state.store, obj_id)?;
            let filtered = dir.list_filtered(EntryFlags::from_bits(must_have), EntryFlags::from_bits(must_not_have), want_attrs);
            let mut listing = Directory::new(dir.object_id, dir.container_id);
            for entry in filtered {
                listing.add_entry(entry);
            }
            let mut listing_bytes = Vec::new();
            listing.serialize(&mut listing_bytes)?;

            Message::Success { obj_id }.write(stream)?;
            SubStreamWriter::new(stream).write_from(Cursor::new(listing_bytes), SUBSTREAM_CHUNK_SIZE)?;
        }

        Message::StoreFile { container_dir_id, mod_time_us, attr_hash, diff_from_id, name } => {
            {
                let acc = state.account.lock().unwrap();
                ctx.require_authed_for_upload(&acc)?;
            }

            let mut object_bytes = Vec::new();
            SubStreamReader::new(stream).read_to_end(&mut object_bytes)?;

            let new_id = state.store.next_id();
            state.store.put(new_id, &object_bytes)?;
            let encoded_name = EncodedName::from_bytes(name);

            mutate_directory(&*state.store, container_dir_id, |dir| {
                if diff_from_id != NONE {
                    dir.set_flags(diff_from_id, EntryFlags::OLD_VERSION, EntryFlags::empty());
                }
                dir.add_entry(DirectoryEntry {
                    name: encoded_name.clone(),
                    object_id: new_id,
                    mod_time_us,
                    attr_hash,
                    size_blocks: ((object_bytes.len() / 4096) + 1) as u64,
                    flags: EntryFlags::FILE,
                    attributes: None,
                    depends_on: diff_from_id,
                    required_by: NONE,
                });
            })?;
            state.remember_parent(new_id, container_dir_id);

            info!(new_id, container_dir_id, diff_from_id, "stored file object");
            Message::Success { obj_id: new_id }.write(stream)?;
        }

        Message::GetObject { obj_id } => {
            require_authed(ctx)?;
            let bytes = state.store.get(obj_id)?;
            Message::Success { obj_id }.write(stream)?;
            SubStreamWriter::new(stream).write_from(Cursor::new(bytes), SUBSTREAM_CHUNK_SIZE)?;
        }

        Message::GetFile { obj_id, .. } => {
            require_authed(ctx)?;
            let (container_dir_id, mod_time_us, name, attrs, blocks) = resolve::materialize(
                &*state.store,
                state.keys.key_for(KeyRole::FileData),
                state.keys.key_for(KeyRole::BlockIndex),
                obj_id,
            )?;
            let chunks: Vec<Chunk> = blocks.into_iter().map(Chunk::Data).collect();
            let mut standalone = Vec::new();
            file_object::encode(
                &mut standalone,
                state.keys.key_for(KeyRole::FileData),
                state.keys.key_for(KeyRole::BlockIndex),
                container_dir_id,
                mod_time_us,
                &name,
                &attrs,
                &chunks,
            )?;

            Message::Success { obj_id }.write(stream)?;
            SubStreamWriter::new(stream).write_from(Cursor::new(standalone), SUBSTREAM_CHUNK_SIZE)?;
        }

        Message::GetBlockIndexById { obj_id } => {
            require_authed(ctx)?;
            let bytes = state.store.get(obj_id)?;
            let index_blob = file_object::read_index_blob(&mut Cursor::new(bytes))?;
            Message::Success { obj_id }.write(stream)?;
            SubStreamWriter::new(stream).write_from(Cursor::new(index_blob), SUBSTREAM_CHUNK_SIZE)?;
        }

        Message::GetBlockIndexByName { container_dir_id, name } => {
            require_authed(ctx)?;
            let dir = load_directory(&*state.store, container_dir_id)?;
            let encoded_name = EncodedName::from_bytes(name);
            let obj_id = dir
                .find_by_encoded_name(&encoded_name, EntryFlags::FILE)
                .map(|e| e.object_id)
                .ok_or(ObjectStoreError::NotFound(container_dir_id))?;
            let bytes = state.store.get(obj_id)?;
            let index_blob = file_object::read_index_blob(&mut Cursor::new(bytes))?;
            Message::Success { obj_id }.write(stream)?;
            SubStreamWriter::new(stream).write_from(Cursor::new(index_blob), SUBSTREAM_CHUNK_SIZE)?;
        }

        Message::CreateDirectory { container_dir_id, attr_hash, name } => {
            require_authed(ctx)?;
            let new_id = state.store.next_id();
            let new_dir = Directory::new(new_id, container_dir_id);
            let mut buf = Vec::new();
            new_dir.serialize(&mut buf)?;
            state.store.put(new_id, &buf)?;

            mutate_directory(&*state.store, container_dir_id, |dir| {
                dir.add_entry(DirectoryEntry {
                    name: EncodedName::from_bytes(name.clone()),
                    object_id: new_id,
                    mod_time_us: 0,
                    attr_hash,
                    size_blocks: 1,
                    flags: EntryFlags::DIR,
                    attributes: None,
                    depends_on: NONE,
                    required_by: NONE,
                });
            })?;
            state.remember_parent(new_id, container_dir_id);
            Message::Success { obj_id: new_id }.write(stream)?;
        }

        Message::DeleteFile { container_dir_id, name } => {
            require_authed(ctx)?;
            let encoded_name = EncodedName::from_bytes(name);
            let mut deleted_id = NONE;
            mutate_directory(&*state.store, container_dir_id, |dir| {
                if let Some(entry) = dir.find_by_encoded_name(&encoded_name, EntryFlags::FILE) {
                    deleted_id = entry.object_id;
                }
                if deleted_id != NONE {
                    dir.set_flags(deleted_id, EntryFlags::DELETED, EntryFlags::empty());
                }
            })?;
            Message::Success { obj_id: deleted_id }.write(stream)?;
        }

        Message::DeleteDirectory { obj_id } => {
            require_authed(ctx)?;
            if let Some(parent) = state.parent_of(obj_id) {
                mutate_directory(&*state.store, parent, |dir| {
                    dir.set_flags(obj_id, EntryFlags::DELETED, EntryFlags::empty());
                })?;
            }
            Message::Success { obj_id }.write(stream)?;
        }

        Message::MoveObject { obj_id, from_container_id, to_container_id, new_name } => {
            require_authed(ctx)?;
            let encoded_name = EncodedName::from_bytes(new_name);
            let mut moved = None;
            mutate_directory(&*state.store, from_container_id, |dir| {
                if let Some(entry) = dir.entries().iter().find(|e| e.object_id == obj_id).cloned() {
                    dir.delete_entry(obj_id);
                    moved = Some(entry);
                }
            })?;
            if let Some(mut entry) = moved {
                entry.name = encoded_name;
                mutate_directory(&*state.store, to_container_id, |dir| {
                    dir.add_entry(entry.clone());
                })?;
                state.remember_parent(obj_id, to_container_id);
            }
            Message::Success { obj_id }.write(stream)?;
        }

        Message::ChangeDirAttributes { obj_id, attr_hash } => {
            require_authed(ctx)?;
            if let Some(parent) = state.parent_of(obj_id) {
                mutate_directory(&*state.store, parent, |dir| {
                    if let Some(mut entry) = dir.entries().iter().find(|e| e.object_id == obj_id).cloned() {
                        entry.attr_hash = attr_hash;
                        dir.add_entry(entry);
                    }
                })?;
            }
            Message::Success { obj_id }.write(stream)?;
        }

        Message::SetReplacementFileAttributes { container_dir_id, attr_hash, name } => {
            require_authed(ctx)?;
            let encoded_name = EncodedName::from_bytes(name);
            mutate_directory(&*state.store, container_dir_id, |dir| {
                if let Some(mut entry) = dir.find_by_encoded_name(&encoded_name, EntryFlags::FILE).cloned() {
                    entry.attr_hash = attr_hash;
                    dir.add_entry(entry);
                }
            })?;
            Message::Success { obj_id: container_dir_id }.write(stream)?;
        }

        Message::Finished | Message::VersionConfirmed(_) | Message::LoginConfirmed { .. } | Message::Success { .. } | Message::Error { .. } => {
            return Err(ProtocolError::Malformed("client sent a server-only message type".into()).into());
        }
    }
    Ok(())
}

fn require_authed(ctx: &StoreContext) -> Result<(), SessionError> {
    if ctx.phase != Phase::Authed {
        return Err(ContextError::WrongPhase {
            required: Phase::Authed,
            actual: ctx.phase,
        }
        .into());
    }
    Ok(())
}

fn load_directory(store: &dyn ObjectStore, id: ObjectId) -> Result<Directory, SessionError> {
    let bytes = store.get(id)?;
    Ok(Directory::deserialize(&mut Cursor::new(bytes))?)
}

fn mutate_directory(store: &dyn ObjectStore, id: ObjectId, f: impl FnOnce(&mut Directory)) -> Result<(), SessionError> {
    let mut dir = load_directory(store, id)?;
    f(&mut dir);
    let mut buf = Vec::new();
    dir.serialize(&mut buf)?;
    store.put(id, &buf)?;
    Ok(())
}
