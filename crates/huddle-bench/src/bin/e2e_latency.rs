//! End-to-end latency benchmark for Huddle.
//!
//! Measures send-to-confirm latency of optimistic sends against a running
//! relay, with real network I/O.
//!
//! ```bash
//! huddle-relay &
//! e2e_latency 8 200
//! ```

use huddle_client::{CurrentUser, SessionContext, SyncConfig, SyncController};
use huddle_core::ConnectionState;
use huddle_transport::{WebSocketBackend, WebSocketConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RELAY_URL: &str = "ws://127.0.0.1:8080/ws";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);
    let sends: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(200);
    let url = std::env::var("HUDDLE_URL").unwrap_or_else(|_| RELAY_URL.to_string());

    println!("Huddle end-to-end latency: {num_clients} clients x {sends} sends via {url}");

    let channel = format!("bench-{}", huddle_core::now_millis());
    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let url = url.clone();
        let channel = channel.clone();
        handles.push(tokio::spawn(async move {
            run_client(client_id, &url, &channel, sends).await
        }));
    }

    let mut samples = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(mut client_samples)) => samples.append(&mut client_samples),
            Ok(Err(e)) => eprintln!("Client error: {e}"),
            Err(e) => eprintln!("Client task failed: {e}"),
        }
    }

    if samples.is_empty() {
        eprintln!("No samples collected. Is the relay running?");
        return;
    }

    samples.sort();
    let percentile = |p: f64| samples[((samples.len() - 1) as f64 * p) as usize];
    let mean = samples.iter().sum::<Duration>() / samples.len() as u32;

    println!();
    println!("  samples: {}", samples.len());
    println!("  mean:    {mean:?}");
    println!("  p50:     {:?}", percentile(0.50));
    println!("  p99:     {:?}", percentile(0.99));
    println!("  max:     {:?}", percentile(1.0));
}

async fn run_client(
    client_id: usize,
    url: &str,
    channel: &str,
    sends: usize,
) -> Result<Vec<Duration>, Box<dyn std::error::Error + Send + Sync>> {
    let backend = Arc::new(
        WebSocketBackend::connect(WebSocketConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .await?,
    );
    let session = SessionContext::signed_in(CurrentUser::new(format!("bench-{client_id}")));
    let mut controller = SyncController::new(backend.clone(), backend, SyncConfig::default());

    controller.start(channel, &session).await?;
    while controller.connection_state() == ConnectionState::Connecting {
        controller.process_next().await;
    }
    if controller.connection_state() != ConnectionState::Subscribed {
        return Err(format!("subscription ended in {}", controller.connection_state()).into());
    }

    let mut samples = Vec::with_capacity(sends);
    for i in 0..sends {
        let start = Instant::now();
        let id = controller.send(&format!("client {client_id} message {i}"))?;
        while controller
            .messages()
            .iter()
            .any(|m| m.optimistic && m.id == id)
        {
            controller.process_next().await;
        }
        samples.push(start.elapsed());
    }

    controller.stop();
    Ok(samples)
}
