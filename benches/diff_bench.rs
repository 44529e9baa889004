use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vaultsync::diff::{diff, CancellationToken};
use vaultsync::file_object::{choose_block_size, split_blocks};

fn make_prior_index(data: &[u8]) -> Vec<vaultsync::file_object::index::BlockIndexEntry> {
    use vaultsync::crypto::strong_hash;
    use vaultsync::crypto::RollingChecksum;
    use vaultsync::file_object::index::BlockLocation;

    let block_size = choose_block_size(data.len() as u64);
    split_blocks(data, block_size)
        .iter()
        .enumerate()
        .map(|(i, block)| vaultsync::file_object::index::BlockIndexEntry {
            weak: RollingChecksum::new(block).value(),
            strong: strong_hash(block),
            size: block.len() as u32,
            location: BlockLocation::Prior { object_id: 1, ordinal: i as u32 },
        })
        .collect()
}

fn bench_diff(c: &mut Criterion) {
    let mut base = vec![0u8; 4 * 1024 * 1024];
    for (i, byte) in base.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let prior_index = make_prior_index(&base);

    let mut edited = base.clone();
    edited[2_000_000] ^= 0xff;

    c.bench_function("diff_4mb_single_edit", |b| {
        b.iter(|| {
            let token = CancellationToken::new();
            diff(black_box(&edited), 1, black_box(&prior_index), &token)
        })
    });

    c.bench_function("diff_4mb_unrelated", |b| {
        let unrelated = vec![0x42u8; base.len()];
        b.iter(|| {
            let token = CancellationToken::new();
            diff(black_box(&unrelated), 1, black_box(&prior_index), &token)
        })
    });
}

criterion_group!(benches, bench_diff);
criterion_main!(benches);
