//! Diff engine — produces a patch object by matching blocks of a new local
//! file against the block index of an older stored object, using a
//! rolling weak checksum to find candidates and the strong hash to
//! confirm them.
//!
//! The search is bounded two ways: a wall-clock cap via
//! [`CancellationToken`] (checked at the top of each candidate-window
//! iteration, never a global flag or signal handler), and a hard
//! examined-window safety valve ([`DIFF_MAX_BLOCK_FIND_MULTIPLE`])
//! independent of the cap, protecting against pathological inputs like a
//! file of one repeated byte.

use crate::crypto::hash::{strong_hash, strong_hash_hex};
use crate::crypto::rolling::RollingChecksum;
use crate::file_object::index::{BlockIndexEntry, BlockLocation};
use crate::file_object::Chunk;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

pub const DIFF_MAX_BLOCK_SIZES: usize = 8;
pub const DIFF_MIN_BLOCK_SIZE: usize = 256;
pub const DIFF_MAX_BLOCK_FIND_MULTIPLE: usize = 4096;

/// Below this fraction of the file's bytes matched against the prior
/// object, the diff is abandoned in favour of a full re-upload.
const MIN_MATCH_RATIO: f64 = 0.10;

/// Cooperative cancellation for the diff search's wall-clock cap. Cloned
/// and flipped by an external timer; the diff loop only ever reads it.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of diffing a local file against a prior object's index.
pub struct DiffResult {
    pub chunks: Vec<Chunk>,
    pub is_completely_different: bool,
}

/// Diff `local` against `prior_index` (the decrypted block index of the
/// older stored object). Blocks below [`DIFF_MIN_BLOCK_SIZE`] are never
/// considered as match candidates; at most [`DIFF_MAX_BLOCK_SIZES`]
/// distinct candidate sizes are tried, largest first so coarse matches
/// win ties.
pub fn diff(
    local: &[u8],
    prior_object_id: u64,
    prior_index: &[BlockIndexEntry],
    token: &CancellationToken,
) -> DiffResult {
    let mut sizes: Vec<usize> = prior_index
        .iter()
        .map(|e| e.size as usize)
        .filter(|&s| s >= DIFF_MIN_BLOCK_SIZE)
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    sizes.reverse();
    sizes.truncate(DIFF_MAX_BLOCK_SIZES);

    if sizes.is_empty() || local.is_empty() {
        return DiffResult {
            chunks: full_upload(local),
            is_completely_different: true,
        };
    }

    // size -> (weak checksum -> candidate prior-index positions)
    let mut tables: HashMap<usize, HashMap<u32, Vec<usize>>> = HashMap::new();
    for &size in &sizes {
        let table = tables.entry(size).or_default();
        for (pos, entry) in prior_index.iter().enumerate() {
            if entry.size as usize == size {
                table.entry(entry.weak).or_default().push(pos);
            }
        }
    }

    let mut chunks = Vec::new();
    let mut matched_bytes: u64 = 0;
    let mut residue: Vec<u8> = Vec::new();
    let mut offset = 0usize;
    let examined_limit = prior_index.len().max(1) * DIFF_MAX_BLOCK_FIND_MULTIPLE;
    let mut examined = 0usize;
    let mut cancelled = false;

    while offset < local.len() {
        if token.is_cancelled() {
            cancelled = true;
            residue.extend_from_slice(&local[offset..]);
            offset = local.len();
            break;
        }
        if examined >= examined_limit {
            cancelled = true;
            residue.extend_from_slice(&local[offset..]);
            offset = local.len();
            break;
        }

        let mut best: Option<(usize, usize, u32)> = None; // (size, prior_pos, consumed)
        for &size in &sizes {
            if offset + size > local.len() {
                continue;
            }
            examined += 1;
            let window = &local[offset..offset + size];
            let weak = RollingChecksum::new(window).value();
            if let Some(candidates) = tables.get(&size).and_then(|t| t.get(&weak)) {
                let strong = strong_hash(window);
                if let Some(&pos) = candidates
                    .iter()
                    .find(|&&p| prior_index[p].strong == strong)
                {
                    best = Some((size, pos, size as u32));
                    break; // sizes are largest-first: first hit wins the tie-break
                }
            }
        }

        match best {
            Some((size, pos, _)) => {
                flush_residue(&mut residue, &mut chunks);
                let entry = &prior_index[pos];
                let (object_id, ordinal) = match entry.location {
                    BlockLocation::SelfOffset(o) => (prior_object_id, o as u32),
                    BlockLocation::Prior { object_id, ordinal } => (object_id, ordinal),
                };
                trace!(object_id, ordinal, size, strong = %strong_hash_hex(&entry.strong), "matched block");
                chunks.push(Chunk::Reference { object_id, ordinal });
                matched_bytes += size as u64;
                offset += size;
            }
            None => {
                residue.push(local[offset]);
                offset += 1;
                if residue.len() >= DIFF_MAX_BLOCK_SIZE_BUDGET {
                    flush_residue(&mut residue, &mut chunks);
                }
            }
        }
    }

    flush_residue(&mut residue, &mut chunks);

    let ratio = matched_bytes as f64 / local.len().max(1) as f64;
    if !cancelled && ratio < MIN_MATCH_RATIO {
        return DiffResult {
            chunks: full_upload(local),
            is_completely_different: true,
        };
    }

    DiffResult {
        chunks,
        is_completely_different: false,
    }
}

const DIFF_MAX_BLOCK_SIZE_BUDGET: usize = crate::file_object::MAX_BLOCK_SIZE;

fn flush_residue(residue: &mut Vec<u8>, chunks: &mut Vec<Chunk>) {
    if !residue.is_empty() {
        chunks.push(Chunk::Data(std::mem::take(residue)));
    }
}

fn full_upload(local: &[u8]) -> Vec<Chunk> {
    if local.is_empty() {
        return Vec::new();
    }
    let block_size = crate::file_object::choose_block_size(local.len() as u64);
    crate::file_object::split_blocks(local, block_size)
        .into_iter()
        .map(|b| Chunk::Data(b.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rolling::RollingChecksum as RC;

    fn index_for(data: &[u8], size: usize) -> Vec<BlockIndexEntry> {
        data.chunks(size)
            .enumerate()
            .map(|(i, block)| BlockIndexEntry {
                weak: RC::new(block).value(),
                strong: strong_hash(block),
                size: block.len() as u32,
                location: BlockLocation::SelfOffset(i as u64),
            })
            .collect()
    }

    #[test]
    fn identical_file_is_fully_referenced() {
        let data = vec![0xABu8; DIFF_MIN_BLOCK_SIZE * 4];
        let prior_index = index_for(&data, DIFF_MIN_BLOCK_SIZE);
        let token = CancellationToken::new();
        let result = diff(&data, 1, &prior_index, &token);
        assert!(!result.is_completely_different);
        assert!(result
            .chunks
            .iter()
            .all(|c| matches!(c, Chunk::Reference { .. })));
    }

    #[test]
    fn unrelated_file_is_completely_different() {
        let prior = vec![1u8; DIFF_MIN_BLOCK_SIZE * 4];
        let prior_index = index_for(&prior, DIFF_MIN_BLOCK_SIZE);
        let new_data: Vec<u8> = (0..DIFF_MIN_BLOCK_SIZE * 4).map(|i| (i % 251) as u8).collect();
        let token = CancellationToken::new();
        let result = diff(&new_data, 1, &prior_index, &token);
        assert!(result.is_completely_different);
    }

    #[test]
    fn localized_edit_produces_mixed_patch() {
        let mut data = vec![0x11u8; DIFF_MIN_BLOCK_SIZE * 6];
        let prior_index = index_for(&data, DIFF_MIN_BLOCK_SIZE);
        // Edit the middle block only.
        for b in data[DIFF_MIN_BLOCK_SIZE * 3..DIFF_MIN_BLOCK_SIZE * 4].iter_mut() {
            *b = 0x22;
        }
        let token = CancellationToken::new();
        let result = diff(&data, 1, &prior_index, &token);
        assert!(!result.is_completely_different);
        let has_reference = result.chunks.iter().any(|c| matches!(c, Chunk::Reference { .. }));
        let has_data = result.chunks.iter().any(|c| matches!(c, Chunk::Data(_)));
        assert!(has_reference && has_data);
    }

    #[test]
    fn cancellation_yields_partial_well_formed_patch() {
        let data = vec![0x33u8; DIFF_MIN_BLOCK_SIZE * 4];
        let prior_index = index_for(&data, DIFF_MIN_BLOCK_SIZE);
        let token = CancellationToken::new();
        token.cancel();
        let result = diff(&data, 1, &prior_index, &token);
        // Cancelled before any window was examined: falls back to residue,
        // which becomes a single data chunk covering the whole file.
        assert!(!result.chunks.is_empty());
    }
}
