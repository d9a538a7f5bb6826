//! Throughput benchmarks for the Huddle data structures.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use huddle_core::{Membership, Message, MessageLog, PresenceRegistry};
use huddle_protocol::{MemberRole, MessageKind, MessageRow};

fn confirmed(id: usize, correlation: Option<String>) -> Message {
    Message::from(MessageRow {
        id: id.to_string(),
        channel_id: "bench".into(),
        sender_id: "u-1".into(),
        sender_name: "bench".into(),
        content: format!("message {id}"),
        kind: MessageKind::Text,
        created_at: id as u64,
        correlation_id: correlation,
    })
}

/// Benchmark confirming optimistic entries by correlation id.
fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for pending in [1, 16, 256] {
        group.throughput(Throughput::Elements(pending as u64));
        group.bench_with_input(
            BenchmarkId::new("correlated", pending),
            &pending,
            |b, &pending| {
                b.iter_batched(
                    || {
                        let mut log = MessageLog::new();
                        for i in 0..pending {
                            log.append(Message::optimistic(
                                format!("temp_{i}"),
                                "bench",
                                "u-1",
                                "bench",
                                format!("message {i}"),
                            ));
                        }
                        log
                    },
                    |mut log| {
                        for i in 0..pending {
                            log.reconcile(confirmed(i, Some(format!("temp_{i}"))));
                        }
                        log
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.bench_function("duplicate_delivery", |b| {
        let mut log = MessageLog::new();
        log.load_history((0..1000).map(|i| confirmed(i, None)).collect());
        b.iter(|| log.reconcile(black_box(confirmed(500, None))));
    });

    group.bench_function("heuristic_fallback", |b| {
        b.iter_batched(
            || {
                let mut log = MessageLog::new();
                log.load_history((0..256).map(|i| confirmed(i, None)).collect());
                log.append(Message::optimistic("temp_x", "bench", "u-1", "bench", "tail"));
                log
            },
            |mut log| {
                let mut row = confirmed(10_000, None);
                row.content = "tail".into();
                log.reconcile(row)
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark bootstrap history loading.
fn bench_load_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_history");

    for size in [100, 1000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || (0..size).rev().map(|i| confirmed(i, None)).collect::<Vec<_>>(),
                |history| {
                    let mut log = MessageLog::new();
                    log.load_history(history);
                    log
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark roster updates from the change feed.
fn bench_presence(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence");

    group.bench_function("apply", |b| {
        let registry = PresenceRegistry::new();
        let mut seen = 0u64;
        b.iter(|| {
            seen += 1;
            let mut membership =
                Membership::new("bench", format!("u-{}", seen % 64), MemberRole::Member);
            membership.last_seen_at = seen;
            registry.apply(black_box(membership))
        });
    });

    group.bench_function("online_members_64", |b| {
        let registry = PresenceRegistry::new();
        for i in 0..64 {
            registry.upsert("bench", &format!("u-{i}"), MemberRole::Member);
        }
        b.iter(|| registry.online_members(black_box("bench")));
    });

    group.finish();
}

criterion_group!(benches, bench_reconcile, bench_load_history, bench_presence);
criterion_main!(benches);
