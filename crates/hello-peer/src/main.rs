//! Reference "hello-world" peer for the VoiceLink SDK.
//!
//! Opens a resilient link to a VoiceLink server, registers a couple of
//! handlers, sends a greeting, and prints every status change until
//! ctrl-c.
//!
//! Usage:
//!   vl-hello-peer ws://localhost:8080/ws
//!
//! Env vars:
//!   VL_ORIGIN  — derive the endpoint from a page origin instead of the
//!                positional URL (e.g. https://app.example)

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vl_link_sdk::{handler_fn, LinkClientBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut builder = LinkClientBuilder::new()
        .on_status(|status| {
            tracing::info!(usable = status.usable(), "status: {}", status.message());
        })
        .on_timeout(|id| {
            tracing::warn!(%id, "message was never acknowledged");
        });

    builder = if let Ok(origin) = std::env::var("VL_ORIGIN") {
        builder.origin(&origin)?
    } else {
        let endpoint = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "ws://localhost:8080/ws".into());
        builder.endpoint(endpoint)
    };

    let link = builder.spawn()?;

    link.register_handler_boxed(
        "query_result",
        handler_fn(|delivery| {
            tracing::info!(
                echoed_id = ?delivery.echoed_id,
                "query result: {}",
                delivery.payload
            );
            Ok(())
        }),
    );
    link.register_handler_boxed(
        "notice",
        handler_fn(|delivery| {
            tracing::info!("server notice: {}", delivery.payload);
            Ok(())
        }),
    );

    link.connect();

    let id = link.send(serde_json::json!({
        "type": "query",
        "text": "hello from the reference peer",
        "sent_at": chrono::Utc::now().timestamp_millis(),
    }));
    tracing::info!(%id, "greeting queued");

    // Report connection quality every so often until interrupted.
    let mut report = tokio::time::interval(Duration::from_secs(10));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let m = link.metrics();
                tracing::info!(
                    sent = m.messages_sent,
                    received = m.messages_received,
                    avg_latency = ?m.avg_latency,
                    "link metrics"
                );
            }
        }
    }

    tracing::info!("shutting down");
    link.destroy().await;
    Ok(())
}
