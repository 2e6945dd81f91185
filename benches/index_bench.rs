// 时间戳索引 / 内存日志性能基准测试
//
// 使用 Criterion 框架测试：
// - 满容量时的 TimestampIndex::add（每次插入都淘汰最旧条目）
// - nearest_offset 查询
// - MemLog 写入
//
// 运行: cargo bench --bench index_bench

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::sync::CancellationToken;

use stream2sse::storage::index::TimestampIndex;
use stream2sse::storage::MemLog;

fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn full_index(capacity: usize) -> TimestampIndex {
    let mut index = TimestampIndex::new(capacity).unwrap();
    for i in 0..capacity as i64 {
        index.add(i, ts(i * 10)).unwrap();
    }
    index
}

fn benchmark_index_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_add_at_capacity");
    group.throughput(Throughput::Elements(1));

    for capacity in [1_000usize, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &cap| {
            let mut index = full_index(cap);
            let mut next = cap as i64;
            b.iter(|| {
                index.add(black_box(next), ts(next * 10)).unwrap();
                next += 1;
            })
        });
    }

    group.finish();
}

fn benchmark_nearest_offset(c: &mut Criterion) {
    let mut group = c.benchmark_group("nearest_offset");

    for capacity in [1_000usize, 100_000] {
        let index = full_index(capacity);
        let span = capacity as i64 * 10;

        group.bench_with_input(BenchmarkId::new("exact", capacity), &capacity, |b, _| {
            let mut probe = 0i64;
            b.iter(|| {
                probe = (probe + 7_919 * 10) % span;
                black_box(index.nearest_offset(ts(probe)))
            })
        });

        group.bench_with_input(BenchmarkId::new("between", capacity), &capacity, |b, _| {
            let mut probe = 5i64;
            b.iter(|| {
                probe = (probe + 7_919 * 10) % span;
                black_box(index.nearest_offset(ts(probe)))
            })
        });

        group.bench_with_input(BenchmarkId::new("after_last", capacity), &capacity, |b, _| {
            b.iter(|| black_box(index.nearest_offset(ts(span + 1))))
        });
    }

    group.finish();
}

fn benchmark_memlog_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("memlog_write");
    group.throughput(Throughput::Elements(1));

    let payload = bytes::Bytes::from_static(br#"{"price":3800.0,"volume":1}"#);
    let log = MemLog::new(100_000, CancellationToken::new()).unwrap();

    group.bench_function("sequential", |b| {
        b.iter(|| log.write(black_box(payload.clone())).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_index_add,
    benchmark_nearest_offset,
    benchmark_memlog_write
);
criterion_main!(benches);
