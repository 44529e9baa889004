//! Typed request/response messages carried by the framing in
//! [`super`]. Each variant's binary layout is a fixed sequence of typed
//! fields; strings are `{u32 len, bytes}`.

use super::ProtocolError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

macro_rules! msg_types {
    ($($name:ident = $val:expr,)*) => {
        $(pub const $name: u8 = $val;)*
    };
}

msg_types! {
    TYPE_VERSION = 1,
    TYPE_VERSION_CONFIRMED = 2,
    TYPE_LOGIN = 3,
    TYPE_LOGIN_CONFIRMED = 4,
    TYPE_LIST_DIRECTORY = 5,
    TYPE_STORE_FILE = 6,
    TYPE_GET_OBJECT = 7,
    TYPE_GET_FILE = 8,
    TYPE_GET_BLOCK_INDEX_BY_ID = 9,
    TYPE_GET_BLOCK_INDEX_BY_NAME = 10,
    TYPE_CREATE_DIRECTORY = 11,
    TYPE_DELETE_FILE = 12,
    TYPE_DELETE_DIRECTORY = 13,
    TYPE_MOVE_OBJECT = 14,
    TYPE_CHANGE_DIR_ATTRIBUTES = 15,
    TYPE_SET_REPLACEMENT_FILE_ATTRIBUTES = 16,
    TYPE_SET_CLIENT_STORE_MARKER = 17,
    TYPE_GET_IS_ALIVE = 18,
    TYPE_FINISHED = 19,
    TYPE_SUCCESS = 20,
    TYPE_ERROR = 21,
}

/// Login flags: bit 0 requests write access.
pub const LOGIN_FLAG_READ_WRITE: u32 = 0x0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(u32),
    VersionConfirmed(u32),
    Login { account: u64, flags: u32 },
    LoginConfirmed { marker: u64, blocks_used: u64, blocks_soft_limit: u64, blocks_hard_limit: u64 },
    ListDirectory { obj_id: u64, must_have: u16, must_not_have: u16, want_attrs: bool },
    StoreFile { container_dir_id: u64, mod_time_us: u64, attr_hash: u64, diff_from_id: u64, name: Vec<u8> },
    GetObject { obj_id: u64 },
    GetFile { container_dir_id: u64, obj_id: u64 },
    GetBlockIndexById { obj_id: u64 },
    GetBlockIndexByName { container_dir_id: u64, name: Vec<u8> },
    CreateDirectory { container_dir_id: u64, attr_hash: u64, name: Vec<u8> },
    DeleteFile { container_dir_id: u64, name: Vec<u8> },
    DeleteDirectory { obj_id: u64 },
    MoveObject { obj_id: u64, from_container_id: u64, to_container_id: u64, new_name: Vec<u8> },
    ChangeDirAttributes { obj_id: u64, attr_hash: u64 },
    SetReplacementFileAttributes { container_dir_id: u64, attr_hash: u64, name: Vec<u8> },
    SetClientStoreMarker { marker: u64 },
    GetIsAlive,
    Finished,
    Success { obj_id: u64 },
    Error { kind: u8, sub_kind: u32 },
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Version(_) => TYPE_VERSION,
            Message::VersionConfirmed(_) => TYPE_VERSION_CONFIRMED,
            Message::Login { .. } => TYPE_LOGIN,
            Message::LoginConfirmed { .. } => TYPE_LOGIN_CONFIRMED,
            Message::ListDirectory { .. } => TYPE_LIST_DIRECTORY,
            Message::StoreFile { .. } => TYPE_STORE_FILE,
            Message::GetObject { .. } => TYPE_GET_OBJECT,
            Message::GetFile { .. } => TYPE_GET_FILE,
            Message::GetBlockIndexById { .. } => TYPE_GET_BLOCK_INDEX_BY_ID,
            Message::GetBlockIndexByName { .. } => TYPE_GET_BLOCK_INDEX_BY_NAME,
            Message::CreateDirectory { .. } => TYPE_CREATE_DIRECTORY,
            Message::DeleteFile { .. } => TYPE_DELETE_FILE,
            Message::DeleteDirectory { .. } => TYPE_DELETE_DIRECTORY,
            Message::MoveObject { .. } => TYPE_MOVE_OBJECT,
            Message::ChangeDirAttributes { .. } => TYPE_CHANGE_DIR_ATTRIBUTES,
            Message::SetReplacementFileAttributes { .. } => TYPE_SET_REPLACEMENT_FILE_ATTRIBUTES,
            Message::SetClientStoreMarker { .. } => TYPE_SET_CLIENT_STORE_MARKER,
            Message::GetIsAlive => TYPE_GET_IS_ALIVE,
            Message::Finished => TYPE_FINISHED,
            Message::Success { .. } => TYPE_SUCCESS,
            Message::Error { .. } => TYPE_ERROR,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => buf.write_u32::<BigEndian>(*v).unwrap(),
            Message::VersionConfirmed(v) => buf.write_u32::<BigEndian>(*v).unwrap(),
            Message::Login { account, flags } => {
                buf.write_u64::<BigEndian>(*account).unwrap();
                buf.write_u32::<BigEndian>(*flags).unwrap();
            }
            Message::LoginConfirmed { marker, blocks_used, blocks_soft_limit, blocks_hard_limit } => {
                buf.write_u64::<BigEndian>(*marker).unwrap();
                buf.write_u64::<BigEndian>(*blocks_used).unwrap();
                buf.write_u64::<BigEndian>(*blocks_soft_limit).unwrap();
                buf.write_u64::<BigEndian>(*blocks_hard_limit).unwrap();
            }
            Message::ListDirectory { obj_id, must_have, must_not_have, want_attrs } => {
                buf.write_u64::<BigEndian>(*obj_id).unwrap();
                buf.write_u16::<BigEndian>(*must_have).unwrap();
                buf.write_u16::<BigEndian>(*must_not_have).unwrap();
                buf.write_u8(*want_attrs as u8).unwrap();
            }
            Message::StoreFile { container_dir_id, mod_time_us, attr_hash, diff_from_id, name } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                buf.write_u64::<BigEndian>(*mod_time_us).unwrap();
                buf.write_u64::<BigEndian>(*attr_hash).unwrap();
                buf.write_u64::<BigEndian>(*diff_from_id).unwrap();
                write_bytes(&mut buf, name);
            }
            Message::GetObject { obj_id } => buf.write_u64::<BigEndian>(*obj_id).unwrap(),
            Message::GetFile { container_dir_id, obj_id } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                buf.write_u64::<BigEndian>(*obj_id).unwrap();
            }
            Message::GetBlockIndexById { obj_id } => buf.write_u64::<BigEndian>(*obj_id).unwrap(),
            Message::GetBlockIndexByName { container_dir_id, name } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                write_bytes(&mut buf, name);
            }
            Message::CreateDirectory { container_dir_id, attr_hash, name } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                buf.write_u64::<BigEndian>(*attr_hash).unwrap();
                write_bytes(&mut buf, name);
            }
            Message::DeleteFile { container_dir_id, name } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                write_bytes(&mut buf, name);
            }
            Message::DeleteDirectory { obj_id } => buf.write_u64::<BigEndian>(*obj_id).unwrap(),
            Message::MoveObject { obj_id, from_container_id, to_container_id, new_name } => {
                buf.write_u64::<BigEndian>(*obj_id).unwrap();
                buf.write_u64::<BigEndian>(*from_container_id).unwrap();
                buf.write_u64::<BigEndian>(*to_container_id).unwrap();
                write_bytes(&mut buf, new_name);
            }
            Message::ChangeDirAttributes { obj_id, attr_hash } => {
                buf.write_u64::<BigEndian>(*obj_id).unwrap();
                buf.write_u64::<BigEndian>(*attr_hash).unwrap();
            }
            Message::SetReplacementFileAttributes { container_dir_id, attr_hash, name } => {
                buf.write_u64::<BigEndian>(*container_dir_id).unwrap();
                buf.write_u64::<BigEndian>(*attr_hash).unwrap();
                write_bytes(&mut buf, name);
            }
            Message::SetClientStoreMarker { marker } => buf.write_u64::<BigEndian>(*marker).unwrap(),
            Message::GetIsAlive => {}
            Message::Finished => {}
            Message::Success { obj_id } => buf.write_u64::<BigEndian>(*obj_id).unwrap(),
            Message::Error { kind, sub_kind } => {
                buf.write_u8(*kind).unwrap();
                buf.write_u32::<BigEndian>(*sub_kind).unwrap();
            }
        }
        buf
    }

    pub fn decode(msg_type: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = Cursor::new(body);
        let msg = match msg_type {
            TYPE_VERSION => Message::Version(read_u32(&mut cur)?),
            TYPE_VERSION_CONFIRMED => Message::VersionConfirmed(read_u32(&mut cur)?),
            TYPE_LOGIN => Message::Login {
                account: read_u64(&mut cur)?,
                flags: read_u32(&mut cur)?,
            },
            TYPE_LOGIN_CONFIRMED => Message::LoginConfirmed {
                marker: read_u64(&mut cur)?,
                blocks_used: read_u64(&mut cur)?,
                blocks_soft_limit: read_u64(&mut cur)?,
                blocks_hard_limit: read_u64(&mut cur)?,
            },
            TYPE_LIST_DIRECTORY => Message::ListDirectory {
                obj_id: read_u64(&mut cur)?,
                must_have: read_u16(&mut cur)?,
                must_not_have: read_u16(&mut cur)?,
                want_attrs: read_u8(&mut cur)? != 0,
            },
            TYPE_STORE_FILE => Message::StoreFile {
                container_dir_id: read_u64(&mut cur)?,
                mod_time_us: read_u64(&mut cur)?,
                attr_hash: read_u64(&mut cur)?,
                diff_from_id: read_u64(&mut cur)?,
                name: read_bytes(&mut cur)?,
            },
            TYPE_GET_OBJECT => Message::GetObject { obj_id: read_u64(&mut cur)? },
            TYPE_GET_FILE => Message::GetFile {
                container_dir_id: read_u64(&mut cur)?,
                obj_id: read_u64(&mut cur)?,
            },
            TYPE_GET_BLOCK_INDEX_BY_ID => Message::GetBlockIndexById { obj_id: read_u64(&mut cur)? },
            TYPE_GET_BLOCK_INDEX_BY_NAME => Message::GetBlockIndexByName {
                container_dir_id: read_u64(&mut cur)?,
                name: read_bytes(&mut cur)?,
            },
            TYPE_CREATE_DIRECTORY => Message::CreateDirectory {
                container_dir_id: read_u64(&mut cur)?,
                attr_hash: read_u64(&mut cur)?,
                name: read_bytes(&mut cur)?,
            },
            TYPE_DELETE_FILE => Message::DeleteFile {
                container_dir_id: read_u64(&mut cur)?,
                name: read_bytes(&mut cur)?,
            },
            TYPE_DELETE_DIRECTORY => Message::DeleteDirectory { obj_id: read_u64(&mut cur)? },
            TYPE_MOVE_OBJECT => Message::MoveObject {
                obj_id: read_u64(&mut cur)?,
                from_container_id: read_u64(&mut cur)?,
                to_container_id: read_u64(&mut cur)?,
                new_name: read_bytes(&mut cur)?,
            },
            TYPE_CHANGE_DIR_ATTRIBUTES => Message::ChangeDirAttributes {
                obj_id: read_u64(&mut cur)?,
                attr_hash: read_u64(&mut cur)?,
            },
            TYPE_SET_REPLACEMENT_FILE_ATTRIBUTES => Message::SetReplacementFileAttributes {
                container_dir_id: read_u64(&mut cur)?,
                attr_hash: read_u64(&mut cur)?,
                name: read_bytes(&mut cur)?,
            },
            TYPE_SET_CLIENT_STORE_MARKER => Message::SetClientStoreMarker { marker: read_u64(&mut cur)? },
            TYPE_GET_IS_ALIVE => Message::GetIsAlive,
            TYPE_FINISHED => Message::Finished,
            TYPE_SUCCESS => Message::Success { obj_id: read_u64(&mut cur)? },
            TYPE_ERROR => Message::Error {
                kind: read_u8(&mut cur)?,
                sub_kind: read_u32(&mut cur)?,
            },
            other => return Err(ProtocolError::Malformed(format!("unknown message type {other}"))),
        };
        Ok(msg)
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<(), ProtocolError> {
        super::write_frame(out, self.msg_type(), &self.encode_body())
    }

    pub fn read<R: Read>(input: &mut R) -> Result<Self, ProtocolError> {
        let (msg_type, body) = super::read_frame(input)?;
        Self::decode(msg_type, &body)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

fn read_bytes(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u32(cur)? as usize;
    let mut out = vec![0u8; len];
    Read::read_exact(cur, &mut out).map_err(|_| ProtocolError::Malformed("truncated field".into()))?;
    Ok(out)
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    cur.read_u8().map_err(|_| ProtocolError::Malformed("truncated field".into()))
}

fn read_u16(cur: &mut Cursor<&[u8]>) -> Result<u16, ProtocolError> {
    cur.read_u16::<BigEndian>().map_err(|_| ProtocolError::Malformed("truncated field".into()))
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, ProtocolError> {
    cur.read_u32::<BigEndian>().map_err(|_| ProtocolError::Malformed("truncated field".into()))
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64, ProtocolError> {
    cur.read_u64::<BigEndian>().map_err(|_| ProtocolError::Malformed("truncated field".into()))
}
