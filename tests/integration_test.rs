//! End-to-end smoke tests driving the real wire protocol against a live
//! `ServerState`/`serve_connection` over a loopback TCP socket: store a
//! file, patch it, fetch the patch back through `GetFile` and confirm the
//! store resolved the chain to the edited bytes, then run a housekeeping
//! pass and confirm a deleted entry is swept.

use std::io::Cursor;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use vaultsync::attr_block::{self, Attributes};
use vaultsync::crypto::keys::CRYPTO_KEYS_FILE_SIZE;
use vaultsync::crypto::{KeyRole, KeySet};
use vaultsync::diff::{self, CancellationToken};
use vaultsync::file_object::{self, Chunk};
use vaultsync::name_codec;
use vaultsync::protocol::messages::{Message, LOGIN_FLAG_READ_WRITE};
use vaultsync::protocol::{self, SubStreamReader, SubStreamWriter};
use vaultsync::server::context::{AccountInfo, AccountLocks};
use vaultsync::server::run_housekeeping;
use vaultsync::server::session::{serve_connection, ServerState};
use vaultsync::store::directory::{Directory, EntryFlags};
use vaultsync::store::object_id::ROOT_DIRECTORY_ID;
use vaultsync::store::object_store::{FsObjectStore, ObjectStore};

fn sample_attrs() -> Attributes {
    Attributes {
        mode: 0o644,
        uid: 1000,
        gid: 1000,
        mtime_us: 1_700_000_000_000_000,
        is_symlink: false,
        symlink_target: None,
        xattrs: Vec::new(),
    }
}

fn start_store(data_dir: &std::path::Path) -> (std::net::SocketAddr, Arc<KeySet>) {
    let store = FsObjectStore::open(data_dir.to_path_buf()).unwrap();
    let empty_root = Directory::new(ROOT_DIRECTORY_ID, 0);
    let mut buf = Vec::new();
    empty_root.serialize(&mut buf).unwrap();
    store.put(ROOT_DIRECTORY_ID, &buf).unwrap();

    let keys = Arc::new(KeySet::from_bytes(&vec![0x7au8; CRYPTO_KEYS_FILE_SIZE]).unwrap());
    let account = AccountInfo {
        account_id: 1,
        soft_limit: 1_000_000,
        hard_limit: 2_000_000,
        ..Default::default()
    };
    let state = Arc::new(ServerState::new(
        Arc::new(store) as Arc<dyn ObjectStore>,
        account,
        AccountLocks::new(),
        keys.clone(),
        ROOT_DIRECTORY_ID,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for incoming in listener.incoming() {
            let Ok(mut stream) = incoming else { break };
            let state = state.clone();
            std::thread::spawn(move || {
                let _ = serve_connection(&mut stream, &state);
            });
        }
    });
    (addr, keys)
}

fn handshake(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    Message::Version(protocol::PROTOCOL_VERSION).write(&mut stream).unwrap();
    assert!(matches!(Message::read(&mut stream).unwrap(), Message::VersionConfirmed(_)));
    Message::Login { account: 1, flags: LOGIN_FLAG_READ_WRITE }.write(&mut stream).unwrap();
    assert!(matches!(Message::read(&mut stream).unwrap(), Message::LoginConfirmed { .. }));
    stream
}

/// Encodes `content` as a file object (patching against `diff_from_id`
/// when nonzero) and stores it, returning the new object id.
fn store_file(stream: &mut TcpStream, keys: &KeySet, name: &str, diff_from_id: u64, chunks: Vec<Chunk>) -> u64 {
    let encoded_name = name_codec::encode(keys.key_for(KeyRole::Filename), name);
    let attrs = sample_attrs();
    let attr_blob = attr_block::encode(keys.key_for(KeyRole::Attributes), &attrs);
    let attr_hash = attr_block::hash(keys.attr_hash_secret(), &attrs);

    let mut encoded = Vec::new();
    file_object::encode(
        &mut encoded,
        keys.key_for(KeyRole::FileData),
        keys.key_for(KeyRole::BlockIndex),
        ROOT_DIRECTORY_ID,
        attrs.mtime_us,
        &encoded_name,
        &attr_blob,
        &chunks,
    )
    .unwrap();

    Message::StoreFile {
        container_dir_id: ROOT_DIRECTORY_ID,
        mod_time_us: attrs.mtime_us,
        attr_hash,
        diff_from_id,
        name: encoded_name.as_bytes().to_vec(),
    }
    .write(stream)
    .unwrap();
    SubStreamWriter::new(stream).write_from(Cursor::new(encoded), 64 * 1024).unwrap();

    match Message::read(stream).unwrap() {
        Message::Success { obj_id } => obj_id,
        other => panic!("unexpected reply to StoreFile: {other:?}"),
    }
}

fn get_block_index(stream: &mut TcpStream, keys: &KeySet, obj_id: u64) -> Vec<vaultsync::file_object::index::BlockIndexEntry> {
    Message::GetBlockIndexById { obj_id }.write(stream).unwrap();
    match Message::read(stream).unwrap() {
        Message::Success { .. } => {}
        other => panic!("unexpected reply to GetBlockIndexById: {other:?}"),
    }
    let mut blob = Vec::new();
    std::io::Read::read_to_end(&mut SubStreamReader::new(stream), &mut blob).unwrap();
    vaultsync::file_object::index::decode_index(keys.key_for(KeyRole::BlockIndex), &blob).unwrap()
}

fn get_file(stream: &mut TcpStream, keys: &KeySet, obj_id: u64) -> Vec<u8> {
    Message::GetFile { container_dir_id: ROOT_DIRECTORY_ID, obj_id }.write(stream).unwrap();
    match Message::read(stream).unwrap() {
        Message::Success { .. } => {}
        other => panic!("unexpected reply to GetFile: {other:?}"),
    }
    let mut object_bytes = Vec::new();
    std::io::Read::read_to_end(&mut SubStreamReader::new(stream), &mut object_bytes).unwrap();

    let mut cursor = Cursor::new(object_bytes);
    let (_, _, _, _, blocks, _index) = file_object::decode_blocks(
        &mut cursor,
        keys.key_for(KeyRole::FileData),
        keys.key_for(KeyRole::BlockIndex),
        |ref_object_id, ref_ordinal| {
            panic!("a materialised object fetched via GetFile should carry no Prior references, got one to {ref_object_id}/{ref_ordinal}")
        },
    )
    .unwrap();
    blocks.concat()
}

#[test]
fn patch_chain_resolves_to_edited_bytes_through_get_file() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, keys) = start_store(dir.path());
    let mut stream = handshake(addr);

    let original = b"the quick brown fox jumps over the lazy dog".repeat(200);
    let block_size = file_object::choose_block_size(original.len() as u64);
    let original_chunks: Vec<Chunk> = file_object::split_blocks(&original, block_size)
        .into_iter()
        .map(|b| Chunk::Data(b.to_vec()))
        .collect();
    let original_id = store_file(&mut stream, &keys, "report.txt", 0, original_chunks);

    let index = get_block_index(&mut stream, &keys, original_id);

    let mut edited = original.clone();
    edited[1000] ^= 0xff;
    let token = CancellationToken::new();
    let diffed = diff::diff(&edited, original_id, &index, &token);
    assert!(!diffed.is_completely_different);
    let reference_count = diffed.chunks.iter().filter(|c| matches!(c, Chunk::Reference { .. })).count();
    assert!(reference_count > 0, "a localized edit should still reference most of the prior object");

    let patch_id = store_file(&mut stream, &keys, "report.txt", original_id, diffed.chunks);
    assert_ne!(patch_id, original_id);

    let resolved = get_file(&mut stream, &keys, patch_id);
    assert_eq!(resolved, edited);

    Message::Finished.write(&mut stream).unwrap();
    assert!(matches!(Message::read(&mut stream).unwrap(), Message::Finished));
}

#[test]
fn housekeeping_merges_the_patch_chain_before_sweeping_the_victim() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::open(dir.path().to_path_buf()).unwrap();
    let keys = KeySet::from_bytes(&vec![0x5bu8; CRYPTO_KEYS_FILE_SIZE]).unwrap();
    let file_data_key = keys.key_for(KeyRole::FileData).to_vec();
    let block_index_key = keys.key_for(KeyRole::BlockIndex).to_vec();
    let filename_key = keys.key_for(KeyRole::Filename).to_vec();
    let attr_key = keys.key_for(KeyRole::Attributes).to_vec();

    let original = b"the quick brown fox jumps over the lazy dog".repeat(200);
    let block_size = file_object::choose_block_size(original.len() as u64);
    let chunks: Vec<Chunk> = file_object::split_blocks(&original, block_size)
        .into_iter()
        .map(|b| Chunk::Data(b.to_vec()))
        .collect();
    let encoded_name = name_codec::encode(&filename_key, "report.txt");
    let attrs = sample_attrs();
    let attr_blob = attr_block::encode(&attr_key, &attrs);
    let attr_hash = attr_block::hash(keys.attr_hash_secret(), &attrs);

    let mut full_bytes = Vec::new();
    let full_index = file_object::encode(
        &mut full_bytes,
        &file_data_key,
        &block_index_key,
        ROOT_DIRECTORY_ID,
        attrs.mtime_us,
        &encoded_name,
        &attr_blob,
        &chunks,
    )
    .unwrap();
    let full_id = store.next_id();
    store.put(full_id, &full_bytes).unwrap();

    let mut edited = original.clone();
    edited[1000] ^= 0xff;
    let token = CancellationToken::new();
    let diffed = diff::diff(&edited, full_id, &full_index, &token);
    assert!(!diffed.is_completely_different);

    let mut patch_bytes = Vec::new();
    file_object::encode(
        &mut patch_bytes,
        &file_data_key,
        &block_index_key,
        ROOT_DIRECTORY_ID,
        attrs.mtime_us + 1,
        &encoded_name,
        &attr_blob,
        &diffed.chunks,
    )
    .unwrap();
    let patch_id = store.next_id();
    store.put(patch_id, &patch_bytes).unwrap();

    let mut root = Directory::new(ROOT_DIRECTORY_ID, 0);
    root.add_entry(vaultsync::store::directory::DirectoryEntry {
        name: encoded_name.clone(),
        object_id: full_id,
        mod_time_us: attrs.mtime_us,
        attr_hash,
        size_blocks: (full_bytes.len() / 4096 + 1) as u64,
        flags: EntryFlags::FILE | EntryFlags::DELETED,
        attributes: None,
        depends_on: 0,
        required_by: patch_id,
    });
    root.add_entry(vaultsync::store::directory::DirectoryEntry {
        name: encoded_name,
        object_id: patch_id,
        mod_time_us: attrs.mtime_us + 1,
        attr_hash,
        size_blocks: (patch_bytes.len() / 4096 + 1) as u64,
        flags: EntryFlags::FILE,
        attributes: None,
        depends_on: full_id,
        required_by: 0,
    });
    let mut serialized_root = Vec::new();
    root.serialize(&mut serialized_root).unwrap();
    store.put(ROOT_DIRECTORY_ID, &serialized_root).unwrap();

    let mut account = AccountInfo {
        account_id: 1,
        soft_limit: 1_000_000,
        hard_limit: 2_000_000,
        ..Default::default()
    };
    let far_future = vaultsync::server::housekeeping::DELETE_UNUSED_ROOT_ENTRIES_AFTER_SECS * 10;
    run_housekeeping(&store, &mut account, ROOT_DIRECTORY_ID, far_future, &file_data_key, &block_index_key).unwrap();

    let reloaded_bytes = store.get(ROOT_DIRECTORY_ID).unwrap();
    let reloaded = Directory::deserialize(&mut Cursor::new(reloaded_bytes)).unwrap();
    assert!(!store.exists(full_id), "the merged-from object should be swept once its dependent no longer needs it");
    assert!(store.exists(patch_id), "the merged-into object should survive, now standalone");

    let surviving = reloaded.entries().iter().find(|e| e.object_id == patch_id).unwrap();
    assert_eq!(surviving.depends_on, 0, "merging should clear dependsOn once the chain is flattened");

    let (_, _, _, _, blocks) = vaultsync::server::resolve::materialize(&store, &file_data_key, &block_index_key, patch_id).unwrap();
    assert_eq!(blocks.concat(), edited, "the merged object must still decode to the patched content");
}
