//! Block index — the trailing, separately-encrypted table of a file
//! object enumerating its blocks. Separable from the data: a client can
//! fetch just the index (`GetBlockIndexByID`) to drive the diff engine
//! without downloading the object's payload.
//!
//! # Plaintext layout (before encryption under the block-index key)
//! ```text
//! entryCount (u32) |
//! { weakChecksum (u32), strongHash (16 bytes), size (u32),
//!   locationTag (u8), locationBody }*
//! ```
//! `locationTag` 0 = self-block, body is `offset (u64)`; 1 = prior-object
//! reference, body is `{priorObjectID (u64), blockOrdinal (u32)}`.

use crate::crypto::cipher::{self, CryptoError};
use crate::crypto::hash::StrongHash;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

/// Where a block's plaintext physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    /// The block's ordinal position among this object's own self-blocks.
    SelfOffset(u64),
    /// A reference into a prior object's block, by ordinal.
    Prior { object_id: u64, ordinal: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub weak: u32,
    pub strong: StrongHash,
    pub size: u32,
    pub location: BlockLocation,
}

pub fn encode_index(block_index_key: &[u8], entries: &[BlockIndexEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    for e in entries {
        buf.write_u32::<BigEndian>(e.weak).unwrap();
        buf.extend_from_slice(&e.strong);
        buf.write_u32::<BigEndian>(e.size).unwrap();
        match e.location {
            BlockLocation::SelfOffset(offset) => {
                buf.write_u8(0).unwrap();
                buf.write_u64::<BigEndian>(offset).unwrap();
            }
            BlockLocation::Prior { object_id, ordinal } => {
                buf.write_u8(1).unwrap();
                buf.write_u64::<BigEndian>(object_id).unwrap();
                buf.write_u32::<BigEndian>(ordinal).unwrap();
            }
        }
    }
    cipher::encrypt_random(block_index_key, &buf)
}

pub fn decode_index(
    block_index_key: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<BlockIndexEntry>, CryptoError> {
    let plaintext = cipher::decrypt_fixed_iv(block_index_key, ciphertext)?;
    let mut cur = Cursor::new(plaintext);
    let count = read_u32(&mut cur)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let weak = read_u32(&mut cur)?;
        let mut strong = [0u8; 16];
        io::Read::read_exact(&mut cur, &mut strong).map_err(|_| CryptoError::NotCanonical)?;
        let size = read_u32(&mut cur)?;
        let tag = cur.read_u8().map_err(|_| CryptoError::NotCanonical)?;
        let location = match tag {
            0 => BlockLocation::SelfOffset(read_u64(&mut cur)?),
            1 => {
                let object_id = read_u64(&mut cur)?;
                let ordinal = read_u32(&mut cur)?;
                BlockLocation::Prior { object_id, ordinal }
            }
            other => return Err(CryptoError::BadEncoding(other)),
        };
        entries.push(BlockIndexEntry {
            weak,
            strong,
            size,
            location,
        });
    }
    Ok(entries)
}

fn read_u32(cur: &mut Cursor<Vec<u8>>) -> Result<u32, CryptoError> {
    cur.read_u32::<BigEndian>().map_err(|_| CryptoError::NotCanonical)
}

fn read_u64(cur: &mut Cursor<Vec<u8>>) -> Result<u64, CryptoError> {
    cur.read_u64::<BigEndian>().map_err(|_| CryptoError::NotCanonical)
}
