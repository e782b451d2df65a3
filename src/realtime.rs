//! Realtime metrics bus
//!
//! In-process pub/sub for analytics updates with a WebSocket adapter.
//! Publishers broadcast typed metric updates; connected clients subscribe to
//! the metric types they care about and receive each matching update as a
//! JSON text frame. Slow clients are dropped on send error rather than
//! blocking publishers.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broadcast channel depth before slow receivers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// One realtime metric update
#[derive(Debug, Clone)]
pub struct MetricUpdate {
    /// When the update was published
    pub timestamp: DateTime<Utc>,
    /// Metric type, e.g. `routing_decision` or `cache_stats`
    pub metric_type: String,
    /// Metric payload
    pub data: Value,
}

impl MetricUpdate {
    /// Wire form: `{timestamp, type, data}`
    #[must_use]
    pub fn to_message(&self) -> String {
        json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "type": self.metric_type,
            "data": self.data,
        })
        .to_string()
    }
}

/// Bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStatistics {
    /// Clients currently connected
    pub connected_clients: usize,
    /// Clients ever connected
    pub total_connections: u64,
    /// Messages sent to clients
    pub messages_sent: u64,
    /// Messages received from clients
    pub messages_received: u64,
    /// Seconds since the bus was created
    pub uptime_seconds: u64,
}

/// Event bus broadcasting metric updates to WebSocket clients
pub struct MetricsBus {
    sender: broadcast::Sender<MetricUpdate>,
    connected: AtomicUsize,
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    started_at: Instant,
}

impl MetricsBus {
    /// Creates a bus
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            sender,
            connected: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Publishes a metric update to all subscribed clients
    pub fn broadcast(&self, metric_type: &str, data: Value) {
        let update = MetricUpdate {
            timestamp: Utc::now(),
            metric_type: metric_type.to_string(),
            data,
        };
        // A send error just means no client is listening right now
        let receivers = self.sender.send(update).unwrap_or(0);
        debug!(metric_type, receivers, "broadcast metric update");
    }

    /// Subscribes to the raw update stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MetricUpdate> {
        self.sender.subscribe()
    }

    /// Current counters
    #[must_use]
    pub fn statistics(&self) -> BusStatistics {
        BusStatistics {
            connected_clients: self.connected.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
            messages_sent: self.messages_sent.load(Ordering::SeqCst),
            messages_received: self.messages_received.load(Ordering::SeqCst),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Publishes a routing decision (query text truncated to 100 chars)
    pub fn publish_routing_decision(
        &self,
        query: &str,
        project: &str,
        confidence: f64,
        routing_time_ms: f64,
        cache_hit: bool,
        mode: &str,
    ) {
        let truncated: String = query.chars().take(100).collect();
        self.broadcast(
            "routing_decision",
            json!({
                "query": truncated,
                "project": project,
                "confidence": confidence,
                "routing_time_ms": routing_time_ms,
                "cache_hit": cache_hit,
                "mode": mode,
            }),
        );
    }

    /// Publishes cache statistics
    pub fn publish_cache_statistics(&self, stats: &crate::routing::cache::CacheStatistics) {
        self.broadcast(
            "cache_stats",
            json!({
                "total_queries": stats.total_queries,
                "hits": stats.hits,
                "misses": stats.misses,
                "entries": stats.entries,
                "evictions": stats.evictions,
                "hit_rate": stats.hit_rate(),
            }),
        );
    }

    /// Publishes an analytics summary payload
    pub fn publish_analytics_summary(&self, summary: Value) {
        self.broadcast("analytics_summary", summary);
    }

    /// Publishes a user feedback event (query text truncated to 100 chars)
    pub fn publish_feedback_event(
        &self,
        query: &str,
        project: &str,
        feedback: &str,
        correct_project: Option<&str>,
    ) {
        let truncated: String = query.chars().take(100).collect();
        self.broadcast(
            "feedback_event",
            json!({
                "query": truncated,
                "project": project,
                "feedback": feedback,
                "correct_project": correct_project,
            }),
        );
    }
}

/// Whether an update should reach a client with the given subscription set
///
/// An empty set means the client receives everything.
#[must_use]
pub fn should_deliver(subscriptions: &HashSet<String>, metric_type: &str) -> bool {
    subscriptions.is_empty() || subscriptions.contains(metric_type)
}

/// Builds an axum router exposing the bus at `GET /ws`
#[must_use]
pub fn websocket_router(bus: Arc<MetricsBus>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .with_state(bus)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bus): State<Arc<MetricsBus>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, bus))
}

async fn handle_client(socket: WebSocket, bus: Arc<MetricsBus>) {
    let client_id = format!("client_{}", Uuid::new_v4());
    bus.connected.fetch_add(1, Ordering::SeqCst);
    bus.total_connections.fetch_add(1, Ordering::SeqCst);
    info!(client_id, "websocket client connected");

    let mut updates = bus.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut subscriptions: HashSet<String> = HashSet::new();

    let welcome = json!({
        "type": "welcome",
        "client_id": client_id,
        "server_time": Utc::now().to_rfc3339(),
    });
    if sink.send(Message::Text(welcome.to_string().into())).await.is_err() {
        bus.connected.fetch_sub(1, Ordering::SeqCst);
        return;
    }
    bus.messages_sent.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                bus.messages_received.fetch_add(1, Ordering::SeqCst);

                let Some(reply) = handle_client_message(text.as_str(), &mut subscriptions, &client_id) else {
                    continue;
                };
                if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
                bus.messages_sent.fetch_add(1, Ordering::SeqCst);
            }
            update = updates.recv() => {
                let update = match update {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "client lagged behind metric stream");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !should_deliver(&subscriptions, &update.metric_type) {
                    continue;
                }
                // Slow clients are dropped rather than blocking the bus
                if sink.send(Message::Text(update.to_message().into())).await.is_err() {
                    break;
                }
                bus.messages_sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    bus.connected.fetch_sub(1, Ordering::SeqCst);
    info!(client_id, "websocket client disconnected");
}

fn handle_client_message(
    raw: &str,
    subscriptions: &mut HashSet<String>,
    client_id: &str,
) -> Option<Value> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            warn!(client_id, %error, "invalid JSON from client");
            return None;
        }
    };

    let metric_types = || {
        parsed
            .get("metric_types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    match parsed.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            subscriptions.extend(metric_types());
            debug!(client_id, count = subscriptions.len(), "client subscribed");
            Some(json!({
                "type": "subscribed",
                "metric_types": subscriptions.iter().collect::<Vec<_>>(),
            }))
        }
        Some("unsubscribe") => {
            let removed = metric_types();
            for metric_type in &removed {
                subscriptions.remove(metric_type);
            }
            Some(json!({"type": "unsubscribed", "metric_types": removed}))
        }
        Some("ping") => Some(json!({
            "type": "pong",
            "timestamp": Utc::now().to_rfc3339(),
        })),
        other => {
            warn!(client_id, message_type = ?other, "unknown message type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let bus = MetricsBus::new();
        let mut receiver = bus.subscribe();
        bus.broadcast("routing_decision", json!({"project": "weather"}));

        let update = receiver.recv().await.unwrap();
        assert_eq!(update.metric_type, "routing_decision");
        assert_eq!(update.data["project"], "weather");

        let message: Value = serde_json::from_str(&update.to_message()).unwrap();
        assert_eq!(message["type"], "routing_decision");
        assert!(message["timestamp"].is_string());
    }

    #[tokio::test]
    async fn broadcast_without_listeners_does_not_panic() {
        let bus = MetricsBus::new();
        bus.broadcast("cache_stats", json!({}));
        assert_eq!(bus.statistics().connected_clients, 0);
    }

    #[test]
    fn delivery_respects_subscription_sets() {
        let empty = HashSet::new();
        assert!(should_deliver(&empty, "routing_decision"));

        let mut filtered = HashSet::new();
        filtered.insert("cache_stats".to_string());
        assert!(should_deliver(&filtered, "cache_stats"));
        assert!(!should_deliver(&filtered, "routing_decision"));
    }

    #[test]
    fn subscribe_message_updates_subscription_set() {
        let mut subscriptions = HashSet::new();
        let reply = handle_client_message(
            r#"{"type": "subscribe", "metric_types": ["cache_stats", "feedback_event"]}"#,
            &mut subscriptions,
            "client_test",
        )
        .unwrap();
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(subscriptions.len(), 2);

        let reply = handle_client_message(
            r#"{"type": "unsubscribe", "metric_types": ["cache_stats"]}"#,
            &mut subscriptions,
            "client_test",
        )
        .unwrap();
        assert_eq!(reply["type"], "unsubscribed");
        assert_eq!(subscriptions.len(), 1);
        assert!(subscriptions.contains("feedback_event"));
    }

    #[test]
    fn ping_gets_pong_and_junk_is_ignored() {
        let mut subscriptions = HashSet::new();
        let reply =
            handle_client_message(r#"{"type": "ping"}"#, &mut subscriptions, "client_test").unwrap();
        assert_eq!(reply["type"], "pong");

        assert!(handle_client_message("{not json", &mut subscriptions, "client_test").is_none());
        assert!(
            handle_client_message(r#"{"type": "mystery"}"#, &mut subscriptions, "client_test")
                .is_none()
        );
    }

    #[tokio::test]
    async fn publisher_helpers_shape_payloads() {
        let bus = MetricsBus::new();
        let mut receiver = bus.subscribe();

        bus.publish_routing_decision(&"q".repeat(300), "weather", 0.9, 12.0, false, "automatic");
        let update = receiver.recv().await.unwrap();
        assert_eq!(update.metric_type, "routing_decision");
        assert_eq!(update.data["query"].as_str().unwrap().len(), 100);
        assert_eq!(update.data["mode"], "automatic");

        bus.publish_feedback_event("query", "weather", "incorrect", Some("mps"));
        let update = receiver.recv().await.unwrap();
        assert_eq!(update.metric_type, "feedback_event");
        assert_eq!(update.data["correct_project"], "mps");
    }
}
