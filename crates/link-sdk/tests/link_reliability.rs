//! End-to-end reliability scenarios against an in-process WebSocket
//! server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use vl_link_sdk::{LinkClientBuilder, LinkStatus, MessageId, ReconnectBackoff};

/// Test peer behavior.
#[derive(Clone, Copy)]
enum Peer {
    /// Acknowledge application frames and answer keepalives.
    Ack,
    /// Read and record everything, never write back.
    Silent,
}

/// Spawn an accept loop on an ephemeral port. Reconnections are served;
/// every received application frame is recorded.
async fn spawn_server(peer: Peer) -> (String, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
    let received = Arc::new(Mutex::new(Vec::new()));

    let record = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let record = record.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    match frame["type"].as_str() {
                        Some("ping") => {
                            if matches!(peer, Peer::Ack) {
                                let pong = json!({
                                    "type": "pong",
                                    "timestamp": frame["timestamp"],
                                });
                                let _ = ws.send(Message::Text(pong.to_string())).await;
                            }
                        }
                        _ => {
                            record.lock().push(frame.clone());
                            if matches!(peer, Peer::Ack) {
                                let ack = json!({
                                    "type": "ack",
                                    "messageId": frame["messageId"],
                                });
                                let _ = ws.send(Message::Text(ack.to_string())).await;
                            }
                        }
                    }
                }
            });
        }
    });

    (endpoint, received)
}

/// An endpoint nothing listens on; connections are refused immediately.
async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);
    endpoint
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn status_collector() -> (
    Arc<Mutex<Vec<LinkStatus>>>,
    impl Fn(LinkStatus) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |status| sink.lock().push(status))
}

#[tokio::test]
async fn acknowledged_message_never_times_out() {
    let (endpoint, received) = spawn_server(Peer::Ack).await;
    let timeouts: Arc<Mutex<Vec<MessageId>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = timeouts.clone();
    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .message_timeout(Duration::from_millis(300))
        .min_reconnect_wait(Duration::from_millis(1))
        .on_timeout(move |id| sink.lock().push(id))
        .spawn()
        .unwrap();

    link.connect();
    assert!(wait_for(|| link.is_healthy(), Duration::from_secs(3)).await);

    link.send(json!({ "type": "query", "text": "hello" }));
    assert!(
        wait_for(|| !received.lock().is_empty(), Duration::from_secs(3)).await,
        "server never saw the frame"
    );

    // Well past the ack window: the timeout hook must stay silent.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(timeouts.lock().is_empty());

    let metrics = link.metrics();
    assert_eq!(metrics.messages_sent, 1);
    assert!(metrics.messages_received >= 1);
    assert!(metrics.last_latency.is_some());
    link.destroy().await;
}

#[tokio::test]
async fn unacknowledged_message_times_out_exactly_once() {
    let (endpoint, _received) = spawn_server(Peer::Silent).await;
    let timeouts: Arc<Mutex<Vec<MessageId>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = timeouts.clone();
    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .message_timeout(Duration::from_millis(200))
        .min_reconnect_wait(Duration::from_millis(1))
        .on_timeout(move |id| sink.lock().push(id))
        .spawn()
        .unwrap();

    link.connect();
    assert!(wait_for(|| link.is_healthy(), Duration::from_secs(3)).await);

    let id = link.send(json!({ "type": "query" }));
    assert!(
        wait_for(|| !timeouts.lock().is_empty(), Duration::from_secs(3)).await,
        "timeout hook never fired"
    );
    assert_eq!(*timeouts.lock(), vec![id]);

    // And never again for the same id.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(timeouts.lock().len(), 1);
    link.destroy().await;
}

#[tokio::test]
async fn third_send_at_capacity_two_emits_queue_full_once() {
    let endpoint = dead_endpoint().await;
    let (statuses, hook) = status_collector();

    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .queue_capacity(2)
        .min_reconnect_wait(Duration::from_millis(1))
        .reconnect_backoff(ReconnectBackoff {
            floor: Duration::from_millis(100),
            ceiling: Duration::from_millis(200),
            max_attempts: 0,
        })
        .on_status(hook)
        .spawn()
        .unwrap();

    link.send(json!({ "type": "query", "n": 1 }));
    link.send(json!({ "type": "query", "n": 2 }));
    link.send(json!({ "type": "query", "n": 3 }));

    assert!(
        wait_for(
            || statuses
                .lock()
                .iter()
                .any(|s| matches!(s, LinkStatus::QueueFull)),
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    let full = statuses
        .lock()
        .iter()
        .filter(|s| matches!(s, LinkStatus::QueueFull))
        .count();
    assert_eq!(full, 1);
    link.destroy().await;
}

#[tokio::test]
async fn gives_up_after_attempt_budget_is_spent() {
    let endpoint = dead_endpoint().await;
    let (statuses, hook) = status_collector();

    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .min_reconnect_wait(Duration::from_millis(1))
        .reconnect_backoff(ReconnectBackoff {
            floor: Duration::from_millis(10),
            ceiling: Duration::from_millis(40),
            max_attempts: 5,
        })
        .on_status(hook)
        .spawn()
        .unwrap();

    link.connect();
    assert!(
        wait_for(
            || statuses
                .lock()
                .iter()
                .any(|s| matches!(s, LinkStatus::MaxRetriesExhausted { attempts: 5 })),
            Duration::from_secs(5)
        )
        .await,
        "never gave up: {:?}",
        statuses.lock()
    );

    // Auto-reconnect has stopped; no attempt follows on its own.
    let attempts_before = statuses
        .lock()
        .iter()
        .filter(|s| matches!(s, LinkStatus::Connecting))
        .count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let attempts_after = statuses
        .lock()
        .iter()
        .filter(|s| matches!(s, LinkStatus::Connecting))
        .count();
    assert_eq!(attempts_before, attempts_after);

    // An explicit connect() restarts the budget and dials again.
    link.connect();
    assert!(
        wait_for(
            || {
                statuses
                    .lock()
                    .iter()
                    .filter(|s| matches!(s, LinkStatus::Connecting))
                    .count()
                    > attempts_after
            },
            Duration::from_secs(2)
        )
        .await
    );
    link.destroy().await;
}

#[tokio::test]
async fn keepalive_silence_forces_a_reconnect() {
    let (endpoint, _received) = spawn_server(Peer::Silent).await;
    let (statuses, hook) = status_collector();

    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .keepalive_interval(Duration::from_millis(100))
        .min_reconnect_wait(Duration::from_millis(1))
        .reconnect_backoff(ReconnectBackoff {
            floor: Duration::from_millis(10),
            ceiling: Duration::from_millis(40),
            max_attempts: 0,
        })
        .on_status(hook)
        .spawn()
        .unwrap();

    link.connect();
    // The peer never answers keepalives, so the health monitor must tear
    // the connection down and dial again without external input.
    assert!(
        wait_for(
            || {
                statuses
                    .lock()
                    .iter()
                    .filter(|s| matches!(s, LinkStatus::Connected))
                    .count()
                    >= 2
            },
            Duration::from_secs(5)
        )
        .await,
        "no self-healing reconnect: {:?}",
        statuses.lock()
    );
    link.destroy().await;
}

#[tokio::test]
async fn messages_sent_while_disconnected_flush_on_connect() {
    let (endpoint, received) = spawn_server(Peer::Ack).await;

    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .min_reconnect_wait(Duration::from_millis(1))
        .drain_pause(Duration::from_millis(10))
        .spawn()
        .unwrap();

    // No connect() yet: the first send triggers the dial itself.
    let first = link.send(json!({ "type": "query", "n": 1 }));
    let second = link.send(json!({ "type": "query", "n": 2 }));
    assert!(first < second, "ids must be strictly increasing");

    assert!(
        wait_for(|| received.lock().len() == 2, Duration::from_secs(3)).await,
        "queued messages were not flushed: {:?}",
        received.lock()
    );

    let ids: Vec<u64> = received
        .lock()
        .iter()
        .map(|f| f["messageId"].as_u64().unwrap())
        .collect();
    assert!(ids.contains(&first.0));
    assert!(ids.contains(&second.0));
    link.destroy().await;
}

#[tokio::test]
async fn rate_limit_signal_slows_the_queue_drain() {
    // Reserve a port but leave it dead so the first dial fails and the
    // sends pile up in the queue during the backoff wait.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let link = LinkClientBuilder::new()
        .endpoint(format!("ws://{addr}/ws"))
        .min_reconnect_wait(Duration::from_millis(1))
        .drain_pause(Duration::from_millis(150))
        .reconnect_backoff(ReconnectBackoff {
            floor: Duration::from_millis(400),
            ceiling: Duration::from_secs(1),
            max_attempts: 0,
        })
        .spawn()
        .unwrap();

    link.send(json!({ "type": "query", "n": 1 }));
    link.send(json!({ "type": "query", "n": 2 }));
    link.send(json!({ "type": "query", "n": 3 }));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Bring the server up on the reserved port. It answers the first
    // frame with a backpressure signal and records arrival times.
    let arrivals: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let record = arrivals.clone();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let record = record.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut signalled = false;
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if frame["type"].as_str() == Some("ping") {
                        continue;
                    }
                    record.lock().push(tokio::time::Instant::now());
                    if !signalled {
                        signalled = true;
                        let _ = ws
                            .send(Message::Text(r#"{"type":"rate_limit"}"#.to_string()))
                            .await;
                    }
                }
            });
        }
    });

    assert!(
        wait_for(|| arrivals.lock().len() == 3, Duration::from_secs(5)).await,
        "queued messages never flushed"
    );
    let times = arrivals.lock().clone();
    // The baseline pause is 150ms; after the signal every remaining drain
    // must be paced by the doubled 300ms delay.
    let gap1 = times[1] - times[0];
    let gap2 = times[2] - times[1];
    assert!(gap1 >= Duration::from_millis(250), "gap after signal was {gap1:?}");
    assert!(gap2 >= Duration::from_millis(250), "paced drain gap was {gap2:?}");
    link.destroy().await;
}

#[tokio::test]
async fn handler_failures_do_not_break_the_channel() {
    let (endpoint, received) = spawn_server(Peer::Ack).await;
    let handled = Arc::new(Mutex::new(0u32));

    let link = LinkClientBuilder::new()
        .endpoint(endpoint)
        .min_reconnect_wait(Duration::from_millis(1))
        .spawn()
        .unwrap();

    let count = handled.clone();
    link.register_handler_boxed(
        "ack",
        vl_link_sdk::handler_fn(move |_| {
            *count.lock() += 1;
            anyhow::bail!("flaky handler")
        }),
    );

    link.connect();
    assert!(wait_for(|| link.is_healthy(), Duration::from_secs(3)).await);

    link.send(json!({ "type": "query", "n": 1 }));
    assert!(wait_for(|| *handled.lock() == 1, Duration::from_secs(3)).await);

    // The handler failed, but the link stays usable and keeps delivering.
    assert!(link.is_healthy());
    link.send(json!({ "type": "query", "n": 2 }));
    assert!(wait_for(|| received.lock().len() == 2, Duration::from_secs(3)).await);
    link.destroy().await;
}
