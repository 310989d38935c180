// State tree benchmarks for the quorum ledger.
//
// Covers insertion, lookup, root hashing, snapshot encoding and the
// node-set rebuild used on startup.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use quorum_ledger::crypto::hash::blake3_hash;
use quorum_ledger::state::{Snapshot, Tree, Value};

/// Deterministic 36-byte keys, shaped like output keys.
fn keys(n: usize) -> Vec<Vec<u8>> {
    (0..n as u64)
        .map(|i| {
            let mut key = blake3_hash(&i.to_be_bytes()).to_vec();
            key.extend_from_slice(&(i as u32).to_be_bytes());
            key
        })
        .collect()
}

fn build(keys: &[Vec<u8>]) -> Tree {
    let mut tree = Tree::new();
    for key in keys {
        tree.insert(key, Value::Hash(blake3_hash(key)))
            .expect("distinct equal-length keys never conflict");
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("patricia/insert");
    for size in [100usize, 1_000, 10_000] {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &keys, |b, keys| {
            b.iter(|| build(keys));
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let keys = keys(10_000);
    let tree = build(&keys);
    c.bench_function("patricia/lookup_10k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            tree.lookup(&keys[i])
        });
    });
}

fn bench_copy_on_write_update(c: &mut Criterion) {
    let keys = keys(10_000);
    let tree = build(&keys);
    c.bench_function("patricia/update_snapshot_10k", |b| {
        b.iter(|| {
            let mut next = tree.clone();
            next.insert(&keys[42], Value::Bytes(vec![1, 2, 3]))
                .expect("existing key");
            next.root_hash()
        });
    });
}

fn bench_snapshot_codec(c: &mut Criterion) {
    let snapshot = Snapshot::new(build(&keys(5_000)));
    let encoded = snapshot.encode().expect("encode");

    c.bench_function("snapshot/encode_5k", |b| {
        b.iter(|| snapshot.encode().expect("encode"));
    });
    c.bench_function("snapshot/decode_5k", |b| {
        b.iter(|| Snapshot::decode(&encoded).expect("decode"));
    });
}

fn bench_from_nodes(c: &mut Criterion) {
    let records = build(&keys(5_000)).records();
    c.bench_function("patricia/from_nodes_5k", |b| {
        b.iter(|| Tree::from_nodes(records.clone()).expect("valid node set"));
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_lookup,
    bench_copy_on_write_update,
    bench_snapshot_codec,
    bench_from_nodes,
);
criterion_main!(benches);
