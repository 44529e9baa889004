//! A live [`ServerSession`] talking the wire protocol over a `Read + Write`
//! stream, mirroring the request/reply/sub-stream pattern the store side
//! drives in `server::session`. The sync loop in [`super::sync`] never sees
//! the transport directly; it only ever calls through the trait.

use crate::attr_block::{self, Attributes};
use crate::client::sync::{ServerSession, SyncError};
use crate::crypto::keys::{KeyRole, KeySet};
use crate::file_object::index::{self, BlockIndexEntry};
use crate::file_object::{self, Chunk};
use crate::name_codec;
use crate::protocol::messages::{Message, LOGIN_FLAG_READ_WRITE};
use crate::protocol::{self, ProtocolError, SubStreamReader, SubStreamWriter};
use crate::store::directory::{Directory, EntryFlags};
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

const SUBSTREAM_CHUNK_SIZE: usize = 64 * 1024;

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Server(e.to_string())
    }
}

/// One logged-in connection to a store server. Generic over the stream so
/// tests can drive it with an in-memory duplex the way `server::session`
/// does; `connect` wires up the real `TcpStream` case.
pub struct RemoteSession<S: Read + Write> {
    stream: S,
    keys: Arc<KeySet>,
    quota_exceeded: bool,
}

/// Dial `hostname` (appending the default store port if none is given),
/// then perform the `Version`/`Login` handshake.
pub fn connect(hostname: &str, account: u64, write_requested: bool, keys: Arc<KeySet>) -> Result<RemoteSession<TcpStream>, SyncError> {
    let addr = if hostname.contains(':') { hostname.to_string() } else { format!("{hostname}:2124") };
    let stream = TcpStream::connect(&addr).map_err(|e| SyncError::Server(format!("connecting to {addr}: {e}")))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(120)))
        .map_err(|e| SyncError::Server(e.to_string()))?;
    RemoteSession::handshake(stream, account, write_requested, keys)
}

impl<S: Read + Write> RemoteSession<S> {
    pub fn handshake(mut stream: S, account: u64, write_requested: bool, keys: Arc<KeySet>) -> Result<Self, SyncError> {
        Message::Version(protocol::PROTOCOL_VERSION).write(&mut stream)?;
        match Message::read(&mut stream)? {
            Message::VersionConfirmed(_) => {}
            other => return Err(SyncError::Server(format!("unexpected reply to Version: {other:?}"))),
        }

        let flags = if write_requested { LOGIN_FLAG_READ_WRITE } else { 0 };
        Message::Login { account, flags }.write(&mut stream)?;
        let quota_exceeded = match Message::read(&mut stream)? {
            Message::LoginConfirmed { blocks_used, blocks_hard_limit, .. } => blocks_used >= blocks_hard_limit,
            other => return Err(SyncError::Server(format!("unexpected reply to Login: {other:?}"))),
        };

        Ok(Self { stream, keys, quota_exceeded })
    }

    /// Sends `Finished` and waits for the peer's echo, ending the session
    /// cleanly rather than just dropping the socket.
    pub fn finish(mut self) -> Result<(), SyncError> {
        Message::Finished.write(&mut self.stream)?;
        match Message::read(&mut self.stream)? {
            Message::Finished => Ok(()),
            other => Err(SyncError::Server(format!("unexpected reply to Finished: {other:?}"))),
        }
    }

    fn request(&mut self, msg: Message) -> Result<Message, SyncError> {
        msg.write(&mut self.stream)?;
        match Message::read(&mut self.stream)? {
            Message::Error { kind, sub_kind } => Err(SyncError::Server(format!("store returned error {kind}/{sub_kind}"))),
            reply => Ok(reply),
        }
    }

    fn read_substream(&mut self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        SubStreamReader::new(&mut self.stream)
            .read_to_end(&mut buf)
            .map_err(|e| SyncError::Server(e.to_string()))?;
        Ok(buf)
    }
}

impl<S: Read + Write> ServerSession for RemoteSession<S> {
    fn find_child(&mut self, container_id: u64, name: &str) -> Result<Option<u64>, SyncError> {
        let reply = self.request(Message::ListDirectory {
            obj_id: container_id,
            must_have: 0,
            must_not_have: EntryFlags::DELETED.bits(),
            want_attrs: false,
        })?;
        match reply {
            Message::Success { .. } => {}
            other => return Err(SyncError::Server(format!("unexpected reply to ListDirectory: {other:?}"))),
        }
        let listing_bytes = self.read_substream()?;
        let dir = Directory::deserialize(&mut Cursor::new(listing_bytes)).map_err(|e| SyncError::Server(e.to_string()))?;
        let encoded_name = name_codec::encode(self.keys.key_for(KeyRole::Filename), name);
        Ok(dir.entries().iter().find(|e| e.name == encoded_name).map(|e| e.object_id))
    }

    fn get_block_index(&mut self, object_id: u64) -> Result<Vec<BlockIndexEntry>, SyncError> {
        let reply = self.request(Message::GetBlockIndexById { obj_id: object_id })?;
        match reply {
            Message::Success { .. } => {}
            other => return Err(SyncError::Server(format!("unexpected reply to GetBlockIndexById: {other:?}"))),
        }
        let index_blob = self.read_substream()?;
        index::decode_index(self.keys.key_for(KeyRole::BlockIndex), &index_blob).map_err(|e| SyncError::Server(e.to_string()))
    }

    fn create_directory(&mut self, container_id: u64, name: &str, attrs: &Attributes) -> Result<u64, SyncError> {
        let encoded_name = name_codec::encode(self.keys.key_for(KeyRole::Filename), name);
        let attr_hash = attr_block::hash(self.keys.attr_hash_secret(), attrs);
        match self.request(Message::CreateDirectory {
            container_dir_id: container_id,
            attr_hash,
            name: encoded_name.as_bytes().to_vec(),
        })? {
            Message::Success { obj_id } => Ok(obj_id),
            other => Err(SyncError::Server(format!("unexpected reply to CreateDirectory: {other:?}"))),
        }
    }

    fn store_file(
        &mut self,
        container_id: u64,
        name: &str,
        mod_time_us: u64,
        attrs: &Attributes,
        chunks: Vec<Chunk>,
        diff_from_id: u64,
    ) -> Result<u64, SyncError> {
        let encoded_name = name_codec::encode(self.keys.key_for(KeyRole::Filename), name);
        let attr_blk = attr_block::encode(self.keys.key_for(KeyRole::Attributes), attrs);
        let attr_hash = attr_block::hash(self.keys.attr_hash_secret(), attrs);

        let mut object_bytes = Vec::new();
        file_object::encode(
            &mut object_bytes,
            self.keys.key_for(KeyRole::FileData),
            self.keys.key_for(KeyRole::BlockIndex),
            container_id,
            mod_time_us,
            &encoded_name,
            &attr_blk,
            &chunks,
        )
        .map_err(|e| SyncError::Server(e.to_string()))?;

        Message::StoreFile {
            container_dir_id: container_id,
            mod_time_us,
            attr_hash,
            diff_from_id,
            name: encoded_name.as_bytes().to_vec(),
        }
        .write(&mut self.stream)?;
        SubStreamWriter::new(&mut self.stream).write_from(Cursor::new(object_bytes), SUBSTREAM_CHUNK_SIZE)?;

        match Message::read(&mut self.stream)? {
            Message::Success { obj_id } => Ok(obj_id),
            Message::Error { kind, sub_kind } => Err(SyncError::Server(format!("store rejected upload ({kind}/{sub_kind})"))),
            other => Err(SyncError::Server(format!("unexpected reply to StoreFile: {other:?}"))),
        }
    }

    fn delete_file(&mut self, container_id: u64, name: &str) -> Result<(), SyncError> {
        let encoded_name = name_codec::encode(self.keys.key_for(KeyRole::Filename), name);
        match self.request(Message::DeleteFile {
            container_dir_id: container_id,
            name: encoded_name.as_bytes().to_vec(),
        })? {
            Message::Success { .. } => Ok(()),
            other => Err(SyncError::Server(format!("unexpected reply to DeleteFile: {other:?}"))),
        }
    }

    fn keep_alive(&mut self) -> Result<(), SyncError> {
        match self.request(Message::GetIsAlive)? {
            Message::Success { .. } => Ok(()),
            other => Err(SyncError::Server(format!("unexpected reply to GetIsAlive: {other:?}"))),
        }
    }

    fn quota_exceeded(&self) -> bool {
        self.quota_exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::CRYPTO_KEYS_FILE_SIZE;
    use crate::server::context::{AccountInfo, AccountLocks};
    use crate::server::session::{serve_connection, ServerState};
    use crate::store::object_id::ROOT_DIRECTORY_ID;
    use crate::store::object_store::{MemoryObjectStore, ObjectStore};
    use std::sync::mpsc;
    use std::thread;

    /// A pair of in-memory pipes wired so each end's writes land on the
    /// other's reads, letting the client and server halves run on ordinary
    /// threads without touching a real socket.
    struct Pipe {
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        buf: Vec<u8>,
    }

    fn pipe_pair() -> (Pipe, Pipe) {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        (Pipe { rx: rx_a, tx: tx_b, buf: Vec::new() }, Pipe { rx: rx_b, tx: tx_a, buf: Vec::new() })
    }

    impl Read for Pipe {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.buf.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.buf = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            Ok(n)
        }
    }
    impl Write for Pipe {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.tx.send(data.to_vec()).map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn spawn_server() -> (Pipe, Arc<KeySet>) {
        let (client_end, mut server_end) = pipe_pair();
        let keys = Arc::new(KeySet::from_bytes(&vec![0x11u8; CRYPTO_KEYS_FILE_SIZE]).unwrap());
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let root = Directory::new(ROOT_DIRECTORY_ID, 0);
        let mut buf = Vec::new();
        root.serialize(&mut buf).unwrap();
        store.put(ROOT_DIRECTORY_ID, &buf).unwrap();

        let account = AccountInfo { account_id: 1, soft_limit: 1_000_000, hard_limit: 2_000_000, ..Default::default() };
        let state = Arc::new(ServerState::new(store, account, AccountLocks::new(), keys.clone(), ROOT_DIRECTORY_ID));

        thread::spawn(move || {
            let _ = serve_connection(&mut server_end, &state);
        });

        (client_end, keys)
    }

    #[test]
    fn handshake_then_store_and_list_round_trips() {
        let (client_end, keys) = spawn_server();
        let mut session = RemoteSession::handshake(client_end, 1, true, keys).unwrap();

        let attrs = Attributes {
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_us: 1,
            is_symlink: false,
            symlink_target: None,
            xattrs: vec![],
        };
        let new_id = session
            .store_file(ROOT_DIRECTORY_ID, "a.txt", 123, &attrs, vec![Chunk::Data(b"hello world".to_vec())], 0)
            .unwrap();
        assert_ne!(new_id, 0);

        let found = session.find_child(ROOT_DIRECTORY_ID, "a.txt").unwrap();
        assert_eq!(found, Some(new_id));

        assert!(!session.quota_exceeded());
    }
}
