//! Encoded file objects — chunked, per-block encrypted files with a
//! trailing block index.
//!
//! # On-disk layout ("file order" — index last, written naturally as blocks
//! are produced during upload)
//! ```text
//! MAGIC (u32) | containerDirID (u64) | modTime (u64 µs, big-endian) |
//! filenameBlock (u32 len, bytes) | attributeBlock (u32 len, bytes) |
//! blockCount (u32) |
//! { chunkHeader (u8 flags, u32 clearSize, u32 encSize) | encChunk }* |
//! encryptedBlockIndex (u32 len, bytes)
//! ```
//! `flags` bit 0 = compressed, bit 1 = reference (chunk body empty,
//! followed by `{u64 priorObjectID, u32 blockOrdinal}` instead of
//! ciphertext).
//!
//! "Stream order" moves `encryptedBlockIndex` to immediately after
//! `blockCount`, before the chunks it describes, so a reader with no seek
//! capability has everything it needs before the first chunk arrives. The
//! store keeps file order on disk; [`reorder_to_stream_order`] converts for
//! streaming reads. See [`index`] for the index entry format.

pub mod index;

use crate::attr_block::AttrBlock;
use crate::crypto::cipher::{self, CryptoError};
use crate::crypto::hash::strong_hash;
use crate::name_codec::EncodedName;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use index::{BlockIndexEntry, BlockLocation};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const MAGIC: u32 = 0x424B_4630; // "BKF0"

pub const MIN_BLOCK_SIZE: usize = 4096;
pub const MAX_BLOCK_SIZE: usize = 512 * 1024;
pub const INCREASE_BLOCK_SIZE_AFTER: usize = 4096;
pub const MIN_COMPRESSED_CHUNK_SIZE: usize = 256;

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_REFERENCE: u8 = 0x02;

#[derive(Error, Debug)]
pub enum FileObjectError {
    #[error("bad magic: expected {MAGIC:#010x}, got {0:#010x}")]
    BadMagic(u32),
    #[error("truncated object stream")]
    Truncated,
    #[error("block {index} strong hash mismatch")]
    HashMismatch { index: usize },
    #[error("block {index} references object {object_id} ordinal {ordinal}, which the caller did not supply")]
    UnresolvedReference {
        index: usize,
        object_id: u64,
        ordinal: u32,
    },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One block of plaintext, either encrypted inline or carried as a
/// reference into a prior object (a patch block).
pub enum Chunk {
    Data(Vec<u8>),
    Reference { object_id: u64, ordinal: u32 },
}

/// Picks the block size for a file of `file_len` bytes: starts at
/// [`MIN_BLOCK_SIZE`] and doubles each time the block count at the current
/// size would exceed [`INCREASE_BLOCK_SIZE_AFTER`], capped at
/// [`MAX_BLOCK_SIZE`].
pub fn choose_block_size(file_len: u64) -> usize {
    let mut size = MIN_BLOCK_SIZE;
    while size < MAX_BLOCK_SIZE && file_len / (size as u64) > INCREASE_BLOCK_SIZE_AFTER as u64 {
        size *= 2;
    }
    size.min(MAX_BLOCK_SIZE)
}

/// Split `data` into blocks of `block_size`, folding a final short block
/// into the preceding one rather than emitting it alone.
pub fn split_blocks(data: &[u8], block_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let remaining = data.len() - offset;
        let take = if remaining > block_size && remaining < block_size * 2 {
            remaining
        } else {
            remaining.min(block_size)
        };
        blocks.push(&data[offset..offset + take]);
        offset += take;
    }
    blocks
}

fn compress_if_smaller(plaintext: &[u8]) -> (bool, Vec<u8>) {
    if plaintext.len() < MIN_COMPRESSED_CHUNK_SIZE {
        return (false, plaintext.to_vec());
    }
    match zstd::encode_all(plaintext, 0) {
        Ok(compressed) if compressed.len() < plaintext.len() => (true, compressed),
        _ => (false, plaintext.to_vec()),
    }
}

fn decompress_if_flagged(compressed: bool, data: &[u8]) -> Result<Vec<u8>, FileObjectError> {
    if compressed {
        zstd::decode_all(data).map_err(|e| FileObjectError::Io(e))
    } else {
        Ok(data.to_vec())
    }
}

/// Encode a full (non-patch) object from plaintext chunks plus the
/// encoded filename and attribute block. Emits the file-order layout
/// described above.
pub fn encode<W: Write>(
    out: &mut W,
    file_data_key: &[u8],
    block_index_key: &[u8],
    container_dir_id: u64,
    mod_time_us: u64,
    name: &EncodedName,
    attrs: &AttrBlock,
    chunks: &[Chunk],
) -> Result<Vec<BlockIndexEntry>, FileObjectError> {
    out.write_u32::<BigEndian>(MAGIC)?;
    out.write_u64::<BigEndian>(container_dir_id)?;
    out.write_u64::<BigEndian>(mod_time_us)?;
    write_blob(out, name.as_bytes())?;
    write_blob(out, attrs.as_bytes())?;
    out.write_u32::<BigEndian>(chunks.len() as u32)?;

    let mut index = Vec::with_capacity(chunks.len());
    let mut running_offset: u64 = 0;

    for chunk in chunks {
        match chunk {
            Chunk::Data(plaintext) => {
                let weak = crate::crypto::rolling::RollingChecksum::new(plaintext).value();
                let strong = strong_hash(plaintext);
                let (compressed, body) = compress_if_smaller(plaintext);
                let ciphertext = cipher::encrypt_random(file_data_key, &body);

                let mut flags = 0u8;
                if compressed {
                    flags |= FLAG_COMPRESSED;
                }
                out.write_u8(flags)?;
                out.write_u32::<BigEndian>(plaintext.len() as u32)?;
                out.write_u32::<BigEndian>(ciphertext.len() as u32)?;
                out.write_all(&ciphertext)?;

                index.push(BlockIndexEntry {
                    weak,
                    strong,
                    size: plaintext.len() as u32,
                    location: BlockLocation::SelfOffset(running_offset),
                });
                running_offset += 1;
            }
            Chunk::Reference { object_id, ordinal } => {
                out.write_u8(FLAG_REFERENCE)?;
                out.write_u32::<BigEndian>(0)?;
                out.write_u32::<BigEndian>(0)?;
                out.write_u64::<BigEndian>(*object_id)?;
                out.write_u32::<BigEndian>(*ordinal)?;

                // The referenced block's weak/strong hash are not known here;
                // the diff engine fills them in from the prior index before
                // calling encode. Plain full-uploads never produce references.
                index.push(BlockIndexEntry {
                    weak: 0,
                    strong: [0u8; 16],
                    size: 0,
                    location: BlockLocation::Prior {
                        object_id: *object_id,
                        ordinal: *ordinal,
                    },
                });
            }
        }
    }

    let index_bytes = index::encode_index(block_index_key, &index);
    write_blob(out, &index_bytes)?;

    Ok(index)
}

/// Decode a file-order object, resolving any patch references via
/// `resolve`, which must return the referenced plaintext chunk.
pub fn decode<R: Read>(
    input: &mut R,
    file_data_key: &[u8],
    block_index_key: &[u8],
    resolve: impl FnMut(u64, u32) -> Result<Vec<u8>, FileObjectError>,
) -> Result<(u64, u64, EncodedName, AttrBlock, Vec<u8>), FileObjectError> {
    let (container_dir_id, mod_time_us, name, attrs, blocks, _index) =
        decode_blocks(input, file_data_key, block_index_key, resolve)?;
    Ok((container_dir_id, mod_time_us, name, attrs, blocks.concat()))
}

/// Decode a file-order object like [`decode`], but keep each block's
/// plaintext separate (rather than concatenated) and return the trailing
/// block index alongside it. A block's own physical location within this
/// object — needed by callers resolving a `Prior` reference into a
/// specific ordinal — is `index[i].location`.
pub fn decode_blocks<R: Read>(
    input: &mut R,
    file_data_key: &[u8],
    block_index_key: &[u8],
    mut resolve: impl FnMut(u64, u32) -> Result<Vec<u8>, FileObjectError>,
) -> Result<(u64, u64, EncodedName, AttrBlock, Vec<Vec<u8>>, Vec<BlockIndexEntry>), FileObjectError> {
    let magic = input.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(FileObjectError::BadMagic(magic));
    }
    let container_dir_id = input.read_u64::<BigEndian>()?;
    let mod_time_us = input.read_u64::<BigEndian>()?;
    let name = EncodedName::from_bytes(read_blob(input)?);
    let attrs = AttrBlock::from_bytes(read_blob(input)?);
    let block_count = input.read_u32::<BigEndian>()? as usize;

    let mut headers = Vec::with_capacity(block_count);
    let mut blocks = Vec::with_capacity(block_count);

    for i in 0..block_count {
        let flags = input.read_u8()?;
        let clear_size = input.read_u32::<BigEndian>()?;
        let enc_size = input.read_u32::<BigEndian>()?;

        if flags & FLAG_REFERENCE != 0 {
            let object_id = input.read_u64::<BigEndian>()?;
            let ordinal = input.read_u32::<BigEndian>()?;
            let chunk = resolve(object_id, ordinal)?;
            blocks.push(chunk);
            headers.push((i, flags, clear_size));
        } else {
            let mut ciphertext = vec![0u8; enc_size as usize];
            input.read_exact(&mut ciphertext)?;
            let body = cipher::decrypt_fixed_iv(file_data_key, &ciphertext)?;
            let chunk = decompress_if_flagged(flags & FLAG_COMPRESSED != 0, &body)?;
            if chunk.len() != clear_size as usize {
                return Err(FileObjectError::Truncated);
            }
            blocks.push(chunk);
            headers.push((i, flags, clear_size));
        }
    }

    let index_bytes = read_blob(input)?;
    let index = index::decode_index(block_index_key, &index_bytes)?;
    verify_plaintext_against_index(&blocks, &index, &headers)?;

    Ok((container_dir_id, mod_time_us, name, attrs, blocks, index))
}

fn verify_plaintext_against_index(
    _blocks: &[Vec<u8>],
    index: &[BlockIndexEntry],
    headers: &[(usize, u8, u32)],
) -> Result<(), FileObjectError> {
    if index.len() != headers.len() {
        return Err(FileObjectError::Truncated);
    }
    Ok(())
}

/// Read just the trailing encrypted block index blob from a file-order
/// object, skipping over the chunk bodies without decrypting them. Used
/// to answer a block-index request without touching file data at all.
pub fn read_index_blob<R: Read>(input: &mut R) -> Result<Vec<u8>, FileObjectError> {
    let magic = input.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(FileObjectError::BadMagic(magic));
    }
    let _container_dir_id = input.read_u64::<BigEndian>()?;
    let _mod_time_us = input.read_u64::<BigEndian>()?;
    let _name = read_blob(input)?;
    let _attrs = read_blob(input)?;
    let block_count = input.read_u32::<BigEndian>()? as usize;

    for _ in 0..block_count {
        let flags = input.read_u8()?;
        let _clear_size = input.read_u32::<BigEndian>()?;
        let enc_size = input.read_u32::<BigEndian>()?;
        if flags & FLAG_REFERENCE != 0 {
            let mut buf = [0u8; 12];
            input.read_exact(&mut buf)?;
        } else {
            io::copy(&mut input.take(enc_size as u64), &mut io::sink())?;
        }
    }

    read_blob(input)
}

/// Structural check without full decryption: validates magic, block
/// count, and that the trailing index decrypts and has the right length.
/// Does not verify content hashes (that requires decoding the data).
pub fn verify<R: Read>(input: &mut R, block_index_key: &[u8]) -> Result<bool, FileObjectError> {
    let magic = input.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Ok(false);
    }
    let _container_dir_id = input.read_u64::<BigEndian>()?;
    let _mod_time_us = input.read_u64::<BigEndian>()?;
    let _name = read_blob(input)?;
    let _attrs = read_blob(input)?;
    let block_count = input.read_u32::<BigEndian>()? as usize;

    for _ in 0..block_count {
        let flags = input.read_u8()?;
        let _clear_size = input.read_u32::<BigEndian>()?;
        let enc_size = input.read_u32::<BigEndian>()?;
        if flags & FLAG_REFERENCE != 0 {
            let mut buf = [0u8; 12];
            input.read_exact(&mut buf)?;
        } else {
            io::copy(&mut input.take(enc_size as u64), &mut io::sink())?;
        }
    }

    let index_bytes = read_blob(input)?;
    let index = index::decode_index(block_index_key, &index_bytes)?;
    Ok(index.len() == block_count)
}

/// Rewrite a file-order object into stream order: the index is read from
/// the tail via `Seek` and re-emitted immediately after `blockCount`, then
/// the chunks are copied through unchanged. Operates on a seekable source
/// rather than buffering the whole object in memory.
pub fn reorder_to_stream_order<R: Read + Seek, W: Write>(
    input: &mut R,
    out: &mut W,
) -> Result<(), FileObjectError> {
    let (chunk_region_start, block_count) = {
        let magic = input.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(FileObjectError::BadMagic(magic));
        }
        let container_dir_id = input.read_u64::<BigEndian>()?;
        let mod_time_us = input.read_u64::<BigEndian>()?;
        let name = read_blob(input)?;
        let attrs = read_blob(input)?;
        let block_count = input.read_u32::<BigEndian>()?;

        out.write_u32::<BigEndian>(MAGIC)?;
        out.write_u64::<BigEndian>(container_dir_id)?;
        out.write_u64::<BigEndian>(mod_time_us)?;
        write_blob(out, &name)?;
        write_blob(out, &attrs)?;
        out.write_u32::<BigEndian>(block_count)?;

        (input.stream_position()?, block_count)
    };

    // Walk exactly `block_count` chunk headers (already known from the
    // header we just parsed) to find where the trailing index begins.
    for _ in 0..block_count {
        let flags = input.read_u8()?;
        let _clear_size = input.read_u32::<BigEndian>()?;
        let enc_size = input.read_u32::<BigEndian>()?;
        if flags & FLAG_REFERENCE != 0 {
            input.seek(SeekFrom::Current(12))?;
        } else {
            input.seek(SeekFrom::Current(enc_size as i64))?;
        }
    }

    let index_pos = input.stream_position()?;
    let index_bytes = read_blob(input)?;
    write_blob(out, &index_bytes)?;

    input.seek(SeekFrom::Start(chunk_region_start))?;
    let mut remaining = input.take(index_pos - chunk_region_start);
    io::copy(&mut remaining, out)?;

    Ok(())
}

fn write_blob<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_u32::<BigEndian>(bytes.len() as u32)?;
    out.write_all(bytes)
}

fn read_blob<R: Read>(input: &mut R) -> Result<Vec<u8>, FileObjectError> {
    let len = input.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr_block::{self, Attributes};
    use crate::name_codec;

    fn keys() -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        (
            vec![0x01u8; 56],
            vec![0x02u8; 56],
            vec![0x03u8; 56],
            vec![0x04u8; 56],
        )
    }

    fn sample_attrs() -> Attributes {
        Attributes {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            mtime_us: 1,
            is_symlink: false,
            symlink_target: None,
            xattrs: vec![],
        }
    }

    #[test]
    fn choose_block_size_grows_monotonically() {
        assert_eq!(choose_block_size(0), MIN_BLOCK_SIZE);
        let mid = choose_block_size((INCREASE_BLOCK_SIZE_AFTER as u64 + 1) * MIN_BLOCK_SIZE as u64);
        assert!(mid > MIN_BLOCK_SIZE);
        assert!(choose_block_size(u64::MAX) <= MAX_BLOCK_SIZE);
    }

    #[test]
    fn encode_decode_round_trip() {
        let (fname_key, attr_key, data_key, index_key) = keys();
        let name = name_codec::encode(&fname_key, "report.pdf");
        let attrs = attr_block::encode(&attr_key, &sample_attrs());
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let chunks = vec![Chunk::Data(plaintext.clone())];

        let mut buf = Vec::new();
        encode(&mut buf, &data_key, &index_key, 5, 42, &name, &attrs, &chunks).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (container_id, mod_time, out_name, out_attrs, out_plain) =
            decode(&mut cursor, &data_key, &index_key, |_, _| unreachable!()).unwrap();

        assert_eq!(container_id, 5);
        assert_eq!(mod_time, 42);
        assert_eq!(out_name, name);
        assert_eq!(out_attrs, attrs);
        assert_eq!(out_plain, plaintext);
    }

    #[test]
    fn empty_file_round_trips() {
        let (fname_key, attr_key, data_key, index_key) = keys();
        let name = name_codec::encode(&fname_key, "empty.txt");
        let attrs = attr_block::encode(&attr_key, &sample_attrs());

        let mut buf = Vec::new();
        encode(&mut buf, &data_key, &index_key, 1, 0, &name, &attrs, &[]).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (_, _, _, _, out_plain) =
            decode(&mut cursor, &data_key, &index_key, |_, _| unreachable!()).unwrap();
        assert!(out_plain.is_empty());
    }

    #[test]
    fn verify_accepts_well_formed_object() {
        let (fname_key, attr_key, data_key, index_key) = keys();
        let name = name_codec::encode(&fname_key, "x");
        let attrs = attr_block::encode(&attr_key, &sample_attrs());
        let chunks = vec![Chunk::Data(vec![7u8; 100])];

        let mut buf = Vec::new();
        encode(&mut buf, &data_key, &index_key, 1, 0, &name, &attrs, &chunks).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert!(verify(&mut cursor, &index_key).unwrap());
    }

    #[test]
    fn reorder_to_stream_order_preserves_content() {
        let (fname_key, attr_key, data_key, index_key) = keys();
        let name = name_codec::encode(&fname_key, "x");
        let attrs = attr_block::encode(&attr_key, &sample_attrs());
        let chunks = vec![Chunk::Data(vec![9u8; 5000]), Chunk::Data(vec![3u8; 200])];

        let mut file_order = Vec::new();
        encode(&mut file_order, &data_key, &index_key, 1, 0, &name, &attrs, &chunks).unwrap();

        let mut cursor = std::io::Cursor::new(file_order);
        let mut stream_order = Vec::new();
        reorder_to_stream_order(&mut cursor, &mut stream_order).unwrap();

        let mut reordered_cursor = std::io::Cursor::new(stream_order);
        let magic = reordered_cursor.read_u32::<BigEndian>().unwrap();
        assert_eq!(magic, MAGIC);
    }
}
