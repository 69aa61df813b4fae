/// Scanner and event bus benchmarks using Criterion
///
/// Run with: cargo bench --bench scanner_benchmark
///
/// Benchmarks cover:
/// - Keyword scan over chunks of growing size
/// - Chunk scanner with carry-over enabled
/// - Chunk fan-out through the event bus
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sos_core::keywords::ScannerConfig;
use sos_core::{ChunkScanner, Event, EventBus, EventPayload, KeywordTable, QoSLevel, Topic};

/// Device output with no keyword in it, `len` bytes long.
fn quiet_chunk(len: usize) -> String {
    "temp:23.5,hum:41%,pressure:1013\n"
        .chars()
        .cycle()
        .take(len)
        .collect()
}

fn bench_table_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyword_table_scan");
    let table = KeywordTable::default();

    for len in [64usize, 1_024, 16_384].iter() {
        let miss = quiet_chunk(*len);
        let mut hit = quiet_chunk(*len);
        hit.push_str("EMG|EMG");

        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::new("miss", len), &miss, |b, text| {
            b.iter(|| black_box(table.scan(black_box(text))));
        });
        group.bench_with_input(BenchmarkId::new("hit_last", len), &hit, |b, text| {
            b.iter(|| black_box(table.scan(black_box(text))));
        });
    }
    group.finish();
}

fn bench_chunk_scanner(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_scanner");

    for span in [false, true] {
        let chunks: Vec<String> = (0..100).map(|_| quiet_chunk(256)).collect();
        group.throughput(Throughput::Elements(chunks.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("span_chunks", span),
            &chunks,
            |b, chunks| {
                b.iter(|| {
                    let mut scanner =
                        ChunkScanner::new(KeywordTable::default(), ScannerConfig { span_chunks: span });
                    for chunk in chunks {
                        black_box(scanner.scan_chunk(chunk));
                    }
                });
            },
        );
    }
    group.finish();
}

/// Chunk events through a batched subscriber, as the serial read loop emits them.
fn bench_chunk_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_fanout");

    for event_count in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(event_count),
            event_count,
            |b, &count| {
                b.iter(|| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let bus = EventBus::new().await.unwrap();
                        let (_sub_id, mut rx) = bus
                            .subscribe(Topic::Serial, vec![], QoSLevel::Batched)
                            .await
                            .unwrap();

                        let consumer = tokio::spawn(async move {
                            let mut received = 0;
                            while rx.recv().await.is_some() {
                                received += 1;
                                if received >= count {
                                    break;
                                }
                            }
                        });

                        for _ in 0..count {
                            let evt = Event::new(
                                "bench",
                                EventPayload::ChunkReceived {
                                    text: "temp:23.5\n".into(),
                                },
                            );
                            bus.publish(evt).await.unwrap();
                        }

                        consumer.await.unwrap();
                        black_box(bus);
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_table_scan, bench_chunk_scanner, bench_chunk_fanout);
criterion_main!(benches);
