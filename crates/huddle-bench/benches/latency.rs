//! Latency benchmarks for Huddle.
//!
//! These benchmarks measure how long an optimistic send takes to be
//! confirmed by the store when the controller runs against the in-memory
//! backend.

use criterion::{criterion_group, criterion_main, Criterion};
use huddle_client::{CurrentUser, SessionContext, SyncConfig, SyncController};
use huddle_core::ConnectionState;
use huddle_transport::MemoryBackend;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

async fn ready_controller(backend: Arc<MemoryBackend>, user: &str) -> SyncController {
    let session = SessionContext::signed_in(CurrentUser::new(user));
    let mut controller = SyncController::new(backend.clone(), backend, SyncConfig::default());
    controller
        .start("bench", &session)
        .await
        .expect("start controller");
    while controller.connection_state() != ConnectionState::Subscribed {
        controller.process_next().await;
    }
    controller
}

/// Process events until every sent message is confirmed.
async fn settle(controller: &mut SyncController) {
    while controller.messages().iter().any(|m| m.optimistic) {
        controller.process_next().await;
    }
}

/// Benchmark send + confirm latency.
fn bench_send_confirm(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("send_confirm");

    group.bench_function("single_client", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let backend = Arc::new(MemoryBackend::new());
                let mut controller = ready_controller(backend, "u-1").await;

                let start = Instant::now();
                for i in 0..iters {
                    controller.send(&format!("message {i}")).expect("send");
                    settle(&mut controller).await;
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("with_observer", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let backend = Arc::new(MemoryBackend::new());
                let mut sender = ready_controller(Arc::clone(&backend), "u-1").await;
                let mut observer = ready_controller(backend, "u-2").await;

                let mut total = Duration::ZERO;
                for i in 0..iters {
                    let start = Instant::now();
                    sender.send(&format!("message {i}")).expect("send");
                    settle(&mut sender).await;
                    while observer.messages().len() < sender.messages().len() {
                        observer.process_next().await;
                    }
                    total += start.elapsed();
                }
                total
            })
        });
    });

    group.finish();
}

/// Benchmark a full channel switch: stop, bootstrap, subscribe.
fn bench_channel_start(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("channel_start");

    group.bench_function("history_100", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let backend = Arc::new(MemoryBackend::new());
                let mut seeder = ready_controller(Arc::clone(&backend), "u-2").await;
                for i in 0..100 {
                    seeder.send(&format!("history {i}")).expect("send");
                }
                settle(&mut seeder).await;

                let session = SessionContext::signed_in(CurrentUser::new("u-1"));
                let mut controller =
                    SyncController::new(backend.clone(), backend, SyncConfig::default());

                let start = Instant::now();
                for _ in 0..iters {
                    controller.start("bench", &session).await.expect("start");
                    while controller.connection_state() != ConnectionState::Subscribed {
                        controller.process_next().await;
                    }
                    controller.stop();
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_send_confirm, bench_channel_start);
criterion_main!(benches);
