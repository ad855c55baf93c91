#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use t5_pretrain::corpus::{Document, PathTemplate, ShardWriter, TokenShard};
use t5_pretrain::data::{BatchLoader, PretrainingDataset, SpanMaskingConfig};
use t5_pretrain::tokenization::SpecialTokens;
use tempfile::TempDir;

fn synthetic_documents(count: usize) -> Vec<Document> {
    (0..count as i64)
        .map(|d| {
            (0..8i64)
                .map(|line| (0..40i64).map(|j| 200 + (d * 31 + line * 7 + j) % 30_000).collect())
                .collect()
        })
        .collect()
}

fn special_tokens() -> SpecialTokens {
    SpecialTokens {
        pad_token_id: 0,
        eos_token_id: 1,
        sentinel_token_ids: (2..102).collect(),
    }
}

fn write_shards(iters: u64, writer: &ShardWriter, documents: &[Document]) -> Duration {
    let mut duration = Duration::new(0, 0);
    for _i in 0..iters {
        let start = Instant::now();
        let _ = writer.write(0, documents);
        duration = duration.saturating_add(start.elapsed());
    }
    duration
}

fn bench_shards(c: &mut Criterion) {
    //    Set-up shard directory
    let directory = TempDir::new().unwrap();
    let template =
        PathTemplate::parse(directory.path().join("shard_{:04d}.bin.gz").to_str().unwrap())
            .unwrap();
    let writer = ShardWriter::new(template, 8).unwrap();
    let documents = synthetic_documents(2_000);
    let paths = writer.write(0, &documents).unwrap();

    c.bench_function("Write shards", |b| {
        b.iter_custom(|iters| black_box(write_shards(iters, &writer, &documents)))
    });
    c.bench_function("Read shard", |b| {
        b.iter(|| black_box(TokenShard::open(&paths[0]).unwrap()))
    });
}

fn bench_span_corruption(c: &mut Criterion) {
    let shard = TokenShard::from_documents(synthetic_documents(500));
    let dataset = PretrainingDataset::new(shard, special_tokens(), SpanMaskingConfig::default())
        .unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    c.bench_function("Span corruption", |b| {
        b.iter(|| black_box(dataset.get(black_box(0), &mut rng)))
    });

    let loader = BatchLoader::new(Arc::new(dataset), 32, 4).unwrap();
    c.bench_function("Batch epoch", |b| {
        b.iter(|| black_box(loader.epoch(7).count()))
    });
}

criterion_group! {
name = benches;
config = Criterion::default().sample_size(20);
targets = bench_shards, bench_span_corruption
}

criterion_main!(benches);
