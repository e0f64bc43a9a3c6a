use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quire_core::{Document, DocumentId, DocumentType, Entity};
use quire_engine::services::{EngineDeps, Services};
use quire_engine::{
    CodecConfig, CompressionCodec, LedgerConfig, ManualClock, ManualScheduler, MemoryStore,
    MetricsConfig, NetworkMonitor, OfflineConfig, OfflineQueue, Priority, SavePayload,
    ScriptedTransport, VersionLedger,
};
use std::sync::Arc;

fn quiz(count: usize, tag: &str) -> Document {
    let entities = (0..count)
        .map(|i| {
            Entity::new(format!("q{i}"))
                .with("question", format!("Question number {i}?"))
                .with("answer", format!("{tag}-{i}"))
        })
        .collect();
    Document::entities(DocumentType::Quiz, entities)
}

fn bench_compress(c: &mut Criterion) {
    let codec = CompressionCodec::new(CodecConfig::default());
    let bytes = quiz(1000, "answer").to_canonical_json().unwrap();
    let compressed = codec.compress(&bytes);

    let mut group = c.benchmark_group("Codec");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("compress_quiz_1000", |b| {
        b.iter(|| black_box(codec.compress(black_box(&bytes))))
    });
    group.bench_function("decompress_quiz_1000", |b| {
        b.iter(|| black_box(codec.decompress_payload(black_box(&compressed)).unwrap()))
    });
    group.bench_function("hash_quiz_1000", |b| {
        b.iter(|| black_box(codec.hash(black_box(&bytes))))
    });
    group.finish();
}

fn bench_create_version(c: &mut Criterion) {
    let doc = DocumentId::new();
    let config = LedgerConfig::default();
    let base = quiz(500, "answer");
    let edited = quiz(500, "edited");

    c.bench_function("ledger_create_version_500_entities", |b| {
        b.iter_batched(
            || {
                let mut ledger = VersionLedger::new(doc, &config);
                ledger.create_version(&base, "bench", None, None, 0).unwrap();
                ledger
            },
            |mut ledger| {
                black_box(
                    ledger
                        .create_version(&edited, "bench", None, None, 1)
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_offline_drain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let deps = EngineDeps {
        clock: clock.clone(),
        scheduler: Arc::new(ManualScheduler::new(clock)),
        store: Arc::new(MemoryStore::new()),
        transport: Arc::new(ScriptedTransport::new()),
    };
    let services = Services::new(
        &deps,
        CodecConfig::default(),
        MetricsConfig::default(),
        Arc::new(NetworkMonitor::new(true)),
    );
    let payloads: Vec<SavePayload> = (0..100)
        .map(|i| {
            SavePayload::from_document(
                &services.codec,
                DocumentId::new(),
                &quiz(20, &format!("v{i}")),
                1,
                None,
                "bench",
            )
            .unwrap()
        })
        .collect();
    let config = OfflineConfig {
        max_queue_size: 1000,
        ..OfflineConfig::default()
    };

    c.bench_function("offline_drain_100_items", |b| {
        b.iter_batched(
            || {
                let queue = OfflineQueue::new(config.clone(), services.clone());
                for payload in &payloads {
                    queue.enqueue(payload.clone(), Priority::Medium).unwrap();
                }
                queue
            },
            |queue| black_box(runtime.block_on(queue.drain())),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_compress,
    bench_create_version,
    bench_offline_drain,
);
criterion_main!(benches);
