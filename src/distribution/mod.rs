//! Distribution: transport-bound outbound sinks (distributors), grouped into
//! named sessions with per-event-kind routing.
//!
//! Every distributor sits behind a bounded outbound queue drained by its own
//! worker task, so routing an event never blocks the caller. Repeated send
//! failures flip a distributor to `degraded` (recoverable on the next
//! success) and notify session observers.

pub mod http;
pub mod mqtt;
pub mod recording;
pub mod session;
pub mod udp;
pub mod websocket;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::StreamKind;

/// Transport kinds a distributor can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributorKind {
    Udp,
    Websocket,
    Mqtt,
    Http,
}

impl DistributorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributorKind::Udp => "udp",
            DistributorKind::Websocket => "websocket",
            DistributorKind::Mqtt => "mqtt",
            DistributorKind::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "udp" => Some(DistributorKind::Udp),
            "websocket" | "ws" => Some(DistributorKind::Websocket),
            "mqtt" => Some(DistributorKind::Mqtt),
            "http" => Some(DistributorKind::Http),
            _ => None,
        }
    }
}

/// Distributor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributorState {
    Idle,
    Starting,
    Active,
    Degraded,
    Stopped,
}

/// What to drop when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Drop the oldest queued event — right for live streams.
    #[default]
    DropHead,
    /// Drop the incoming event, keep the backlog.
    DropTail,
}

/// Optional per-distributor event filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorFilter {
    /// Cap on events per second; excess events are dropped before queueing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_cap_hz: Option<f64>,
    /// Events whose payload confidence falls below this are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    /// When set, only these top-level payload fields survive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// Kind-specific destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Udp {
        host: String,
        port: u16,
    },
    Websocket {
        /// Listen address for the status/stream server, e.g. "0.0.0.0:8765".
        bind: String,
    },
    Mqtt {
        host: String,
        port: u16,
        #[serde(default)]
        client_id: Option<String>,
        /// event kind → topic. Missing kinds publish under the topic prefix.
        #[serde(default)]
        topics: HashMap<String, String>,
        #[serde(default = "default_topic_prefix")]
        topic_prefix: String,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
    Http {
        base_url: String,
        /// event kind → path. Missing kinds post to /events/<kind>.
        #[serde(default)]
        paths: HashMap<String, String>,
    },
}

fn default_topic_prefix() -> String {
    "eyetracking".to_string()
}

impl Destination {
    pub fn kind(&self) -> DistributorKind {
        match self {
            Destination::Udp { .. } => DistributorKind::Udp,
            Destination::Websocket { .. } => DistributorKind::Websocket,
            Destination::Mqtt { .. } => DistributorKind::Mqtt,
            Destination::Http { .. } => DistributorKind::Http,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    pub name: String,
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<DistributorFilter>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowMode,
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_degraded_threshold() -> u32 {
    5
}

/// One event headed out a distributor.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub event: String,
    /// RFC 3339 wall-clock stamp (egress boundary).
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(kind: StreamKind, data: serde_json::Value) -> Self {
        Self {
            event: kind.as_str().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: None,
            data,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub compress: bool,
}

/// What a single send accomplished.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SendOutcome {
    pub bytes_sent: usize,
    pub clients_reached: usize,
}

#[derive(Debug, Default)]
pub struct DistributorStats {
    pub sent: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
    pub dropped: AtomicU64,
    /// Monotonic µs of the last successful send, 0 = never.
    pub last_send_us: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributorStatsSnapshot {
    pub sent: u64,
    pub bytes: u64,
    pub errors: u64,
    pub dropped: u64,
    pub last_send_us: u64,
}

impl DistributorStats {
    pub fn snapshot(&self) -> DistributorStatsSnapshot {
        DistributorStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_send_us: self.last_send_us.load(Ordering::Relaxed),
        }
    }
}

/// The kind-specific transport each distributor implements.
#[async_trait]
pub trait Distributor: Send + Sync {
    fn kind(&self) -> DistributorKind;
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn send(&self, event: &OutboundEvent, opts: &SendOptions) -> Result<SendOutcome>;
}

/// Build a transport from a destination. Nothing is opened yet.
pub fn build_transport(destination: &Destination) -> Arc<dyn Distributor> {
    match destination {
        Destination::Udp { host, port } => Arc::new(udp::UdpDistributor::new(host.clone(), *port)),
        Destination::Websocket { bind } => Arc::new(websocket::WebsocketDistributor::new(bind.clone())),
        Destination::Mqtt {
            host,
            port,
            client_id,
            topics,
            topic_prefix,
            qos,
            retain,
        } => Arc::new(mqtt::MqttDistributor::new(mqtt::MqttSettings {
            host: host.clone(),
            port: *port,
            client_id: client_id.clone(),
            topics: topics.clone(),
            topic_prefix: topic_prefix.clone(),
            qos: *qos,
            retain: *retain,
        })),
        Destination::Http { base_url, paths } => {
            Arc::new(http::HttpDistributor::new(base_url.clone(), paths.clone()))
        }
    }
}

/// Bounded outbound queue with selectable overflow policy.
struct BoundedQueue {
    items: Mutex<VecDeque<OutboundEvent>>,
    capacity: usize,
    overflow: OverflowMode,
    notify: Notify,
}

impl BoundedQueue {
    fn new(capacity: usize, overflow: OverflowMode) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            overflow,
            notify: Notify::new(),
        }
    }

    /// Returns the number of events dropped to make room (0 or 1).
    fn push(&self, event: OutboundEvent) -> u64 {
        let mut items = self.items.lock();
        let mut dropped = 0;
        if items.len() >= self.capacity {
            match self.overflow {
                OverflowMode::DropHead => {
                    items.pop_front();
                    dropped = 1;
                }
                OverflowMode::DropTail => {
                    drop(items);
                    return 1;
                }
            }
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Option<OutboundEvent> {
        loop {
            if let Some(event) = self.items.lock().pop_front() {
                return Some(event);
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// A transport plus its queue, worker, filter, and health state.
///
/// This is the unit a session owns; the raw `Distributor` never leaks out.
pub struct DistributorHandle {
    config: RwLock<DistributorConfig>,
    transport: RwLock<Arc<dyn Distributor>>,
    state: RwLock<DistributorState>,
    queue: Arc<BoundedQueue>,
    stats: Arc<DistributorStats>,
    enabled: AtomicBool,
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Monotonic µs of the last event accepted by the rate-cap filter.
    last_accepted_us: AtomicU64,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// (distributor_name, new_state) notifications for session observers.
    state_tx: tokio::sync::broadcast::Sender<(String, DistributorState)>,
}

impl DistributorHandle {
    pub fn new(config: DistributorConfig) -> Arc<Self> {
        let transport = build_transport(&config.destination);
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity, config.overflow));
        let (state_tx, _) = tokio::sync::broadcast::channel(64);
        Arc::new(Self {
            transport: RwLock::new(transport),
            queue,
            stats: Arc::new(DistributorStats::default()),
            state: RwLock::new(DistributorState::Idle),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_accepted_us: AtomicU64::new(0),
            worker: Mutex::new(None),
            state_tx,
            config: RwLock::new(config),
        })
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn kind(&self) -> DistributorKind {
        self.config.read().destination.kind()
    }

    pub fn state(&self) -> DistributorState {
        *self.state.read()
    }

    pub fn stats(&self) -> DistributorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn subscribe_state(&self) -> tokio::sync::broadcast::Receiver<(String, DistributorState)> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, new_state: DistributorState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != new_state;
            *state = new_state;
            changed
        };
        if changed {
            let _ = self.state_tx.send((self.name(), new_state));
        }
    }

    /// Open the transport and start the drain worker.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        self.set_state(DistributorState::Starting);
        let transport = self.transport.read().clone();
        if let Err(e) = transport.open().await {
            self.set_state(DistributorState::Idle);
            return Err(e);
        }
        self.set_state(DistributorState::Active);

        if !self.running.swap(true, Ordering::SeqCst) {
            let handle = Arc::clone(self);
            let worker = tokio::spawn(async move { handle.drain_loop().await });
            *self.worker.lock() = Some(worker);
        }
        Ok(())
    }

    async fn drain_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let Some(event) = self.queue.pop().await else {
                continue;
            };
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if !self.is_enabled() {
                continue;
            }
            let transport = self.transport.read().clone();
            match transport.send(&event, &SendOptions::default()).await {
                Ok(outcome) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes.fetch_add(outcome.bytes_sent as u64, Ordering::Relaxed);
                    self.stats
                        .last_send_us
                        .store(crate::models::now_us(), Ordering::Relaxed);
                    if self.consecutive_failures.swap(0, Ordering::Relaxed) > 0
                        && self.state() == DistributorState::Degraded
                    {
                        self.set_state(DistributorState::Active);
                    }
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    let threshold = self.config.read().degraded_threshold;
                    debug!(
                        distributor = %self.name(),
                        failures,
                        error = %e,
                        "distributor send failed"
                    );
                    if failures >= threshold && self.state() == DistributorState::Active {
                        warn!(
                            distributor = %self.name(),
                            failures,
                            "distributor degraded after consecutive failures"
                        );
                        self.set_state(DistributorState::Degraded);
                    }
                }
            }
        }
    }

    /// Queue an event for transmission. Non-blocking; overflow drops per the
    /// configured policy and only bumps the drop counter.
    pub fn enqueue(&self, event: OutboundEvent) {
        if !self.is_enabled() {
            return;
        }
        if !self.passes_filter(&event) {
            return;
        }
        let event = self.project_fields(event);
        let dropped = self.queue.push(event);
        if dropped > 0 {
            self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    fn passes_filter(&self, event: &OutboundEvent) -> bool {
        let config = self.config.read();
        let Some(filter) = &config.filter else {
            return true;
        };

        if let Some(threshold) = filter.confidence_threshold {
            let confidence = event.data.get("confidence").and_then(|c| c.as_f64());
            if let Some(c) = confidence {
                if c < threshold {
                    return false;
                }
            }
        }

        if let Some(cap_hz) = filter.sample_rate_cap_hz {
            if cap_hz > 0.0 {
                let min_gap_us = (1_000_000.0 / cap_hz) as u64;
                let now = crate::models::now_us();
                let last = self.last_accepted_us.load(Ordering::Relaxed);
                if now.saturating_sub(last) < min_gap_us {
                    return false;
                }
                self.last_accepted_us.store(now, Ordering::Relaxed);
            }
        }
        true
    }

    fn project_fields(&self, mut event: OutboundEvent) -> OutboundEvent {
        let fields = {
            let config = self.config.read();
            match config.filter.as_ref().and_then(|f| f.fields.clone()) {
                Some(fields) => fields,
                None => return event,
            }
        };
        if let serde_json::Value::Object(map) = &mut event.data {
            map.retain(|k, _| fields.iter().any(|f| f == k));
        }
        event
    }

    /// Close and reopen the transport with an updated configuration. Events
    /// keep buffering (up to the queue cap) while the transport is swapped.
    pub async fn reconfigure(self: &Arc<Self>, destination: Option<Destination>, filter: Option<DistributorFilter>) -> Result<()> {
        self.set_state(DistributorState::Starting);
        let old = self.transport.read().clone();
        let _ = old.close().await;

        {
            let mut config = self.config.write();
            if let Some(destination) = destination {
                config.destination = destination;
            }
            if let Some(filter) = filter {
                config.filter = Some(filter);
            }
        }

        let new_transport = build_transport(&self.config.read().destination);
        match new_transport.open().await {
            Ok(()) => {
                *self.transport.write() = new_transport;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.set_state(DistributorState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(DistributorState::Degraded);
                Err(e)
            }
        }
    }

    /// Stop the worker and close the transport, draining first when a grace
    /// period is given.
    pub async fn stop(&self, grace: Option<std::time::Duration>) {
        if let Some(grace) = grace {
            let deadline = tokio::time::Instant::now() + grace;
            while self.queue.len() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.queue.notify.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        let transport = self.transport.read().clone();
        let _ = transport.close().await;
        self.set_state(DistributorState::Stopped);
    }
}

/// Serialize an outbound event to the JSON text shape shared by the
/// WebSocket and recording formats.
pub fn event_json(event: &OutboundEvent) -> Result<String> {
    serde_json::to_string(event).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: StreamKind, data: serde_json::Value) -> OutboundEvent {
        OutboundEvent::new(kind, data)
    }

    #[test]
    fn bounded_queue_head_drop() {
        let q = BoundedQueue::new(2, OverflowMode::DropHead);
        assert_eq!(q.push(event(StreamKind::Gaze, serde_json::json!({"n": 1}))), 0);
        assert_eq!(q.push(event(StreamKind::Gaze, serde_json::json!({"n": 2}))), 0);
        assert_eq!(q.push(event(StreamKind::Gaze, serde_json::json!({"n": 3}))), 1);
        let items = q.items.lock();
        assert_eq!(items.len(), 2);
        assert_eq!(items.front().unwrap().data["n"], 2);
        assert_eq!(items.back().unwrap().data["n"], 3);
    }

    #[test]
    fn bounded_queue_tail_drop() {
        let q = BoundedQueue::new(2, OverflowMode::DropTail);
        q.push(event(StreamKind::Gaze, serde_json::json!({"n": 1})));
        q.push(event(StreamKind::Gaze, serde_json::json!({"n": 2})));
        assert_eq!(q.push(event(StreamKind::Gaze, serde_json::json!({"n": 3}))), 1);
        let items = q.items.lock();
        assert_eq!(items.back().unwrap().data["n"], 2);
    }

    #[test]
    fn confidence_filter_skips_low_events() {
        let handle = DistributorHandle::new(DistributorConfig {
            name: "udp-out".into(),
            destination: Destination::Udp { host: "127.0.0.1".into(), port: 9999 },
            filter: Some(DistributorFilter {
                confidence_threshold: Some(0.5),
                ..Default::default()
            }),
            queue_capacity: 8,
            overflow: OverflowMode::DropHead,
            degraded_threshold: 5,
        });
        handle.enqueue(event(StreamKind::Gaze, serde_json::json!({"confidence": 0.2})));
        assert_eq!(handle.queue_depth(), 0);
        handle.enqueue(event(StreamKind::Gaze, serde_json::json!({"confidence": 0.9})));
        assert_eq!(handle.queue_depth(), 1);
        // Events without a confidence field pass through.
        handle.enqueue(event(StreamKind::Gaze, serde_json::json!({"x": 1.0})));
        assert_eq!(handle.queue_depth(), 2);
    }

    #[test]
    fn field_projection_strips_unlisted_keys() {
        let handle = DistributorHandle::new(DistributorConfig {
            name: "udp-out".into(),
            destination: Destination::Udp { host: "127.0.0.1".into(), port: 9999 },
            filter: Some(DistributorFilter {
                fields: Some(vec!["x".into(), "y".into()]),
                ..Default::default()
            }),
            queue_capacity: 8,
            overflow: OverflowMode::DropHead,
            degraded_threshold: 5,
        });
        handle.enqueue(event(
            StreamKind::Gaze,
            serde_json::json!({"x": 0.1, "y": 0.2, "pupil": 3.2}),
        ));
        let queued = handle.queue.items.lock().pop_front().unwrap();
        assert_eq!(queued.data, serde_json::json!({"x": 0.1, "y": 0.2}));
    }

    #[test]
    fn disabled_distributor_drops_silently() {
        let handle = DistributorHandle::new(DistributorConfig {
            name: "udp-out".into(),
            destination: Destination::Udp { host: "127.0.0.1".into(), port: 9999 },
            filter: None,
            queue_capacity: 8,
            overflow: OverflowMode::DropHead,
            degraded_threshold: 5,
        });
        handle.set_enabled(false);
        handle.enqueue(event(StreamKind::Gaze, serde_json::json!({})));
        assert_eq!(handle.queue_depth(), 0);
        handle.set_enabled(true);
        handle.enqueue(event(StreamKind::Gaze, serde_json::json!({})));
        assert_eq!(handle.queue_depth(), 1);
    }

    #[test]
    fn kind_parse_round_trip() {
        for kind in [
            DistributorKind::Udp,
            DistributorKind::Websocket,
            DistributorKind::Mqtt,
            DistributorKind::Http,
        ] {
            assert_eq!(DistributorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
