//! Distribution session manager: named bundles of distributors plus an
//! event-routing table, with atomic creation and runtime reconfiguration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::StreamKind;

use super::{
    Destination, DistributorConfig, DistributorFilter, DistributorHandle, DistributorKind,
    DistributorState, DistributorStatsSnapshot, OutboundEvent,
};

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub distributors: Vec<DistributorConfig>,
    /// event kind → distributor names. Every target must name a distributor
    /// in this session.
    pub event_routing: HashMap<StreamKind, Vec<String>>,
}

/// Change notifications consumed by the status WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistributionEvent {
    SessionCreated { session_id: String },
    SessionUpdate { session_id: String },
    SessionEnded { session_id: String },
    DistributorDegraded { session_id: String, distributor: String },
}

pub struct Session {
    pub id: String,
    pub created_at: String,
    distributors: RwLock<HashMap<String, Arc<DistributorHandle>>>,
    routing: RwLock<HashMap<StreamKind, Vec<String>>>,
    events_routed: AtomicU64,
    watchers: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributorStatus {
    pub name: String,
    pub kind: DistributorKind,
    pub state: DistributorState,
    pub enabled: bool,
    pub queue_depth: usize,
    pub stats: DistributorStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub created_at: String,
    pub events_routed: u64,
    pub distributors: Vec<DistributorStatus>,
    pub event_routing: HashMap<String, Vec<String>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        let distributors = self
            .distributors
            .read()
            .values()
            .map(|handle| DistributorStatus {
                name: handle.name(),
                kind: handle.kind(),
                state: handle.state(),
                enabled: handle.is_enabled(),
                queue_depth: handle.queue_depth(),
                stats: handle.stats(),
            })
            .collect();
        let event_routing = self
            .routing
            .read()
            .iter()
            .map(|(kind, targets)| (kind.as_str().to_string(), targets.clone()))
            .collect();
        SessionStatus {
            id: self.id.clone(),
            created_at: self.created_at.clone(),
            events_routed: self.events_routed.load(Ordering::Relaxed),
            distributors,
            event_routing,
        }
    }

    pub fn distributor(&self, name: &str) -> Option<Arc<DistributorHandle>> {
        self.distributors.read().get(name).cloned()
    }

    pub fn distributor_names(&self) -> Vec<String> {
        self.distributors.read().keys().cloned().collect()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events_tx: broadcast::Sender<DistributionEvent>,
    /// Queue-drain budget applied when a session ends.
    end_grace: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl SessionManager {
    pub fn new(end_grace: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            end_grace,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DistributionEvent> {
        self.events_tx.subscribe()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    fn validate_config(config: &SessionConfig) -> Result<()> {
        if config.distributors.is_empty() {
            return Err(Error::validation("session needs at least one distributor"));
        }
        let mut names = std::collections::HashSet::new();
        for d in &config.distributors {
            if d.name.trim().is_empty() {
                return Err(Error::validation("distributor name must be non-empty"));
            }
            if !names.insert(d.name.as_str()) {
                return Err(Error::validation(format!("duplicate distributor name {}", d.name)));
            }
        }
        for (kind, targets) in &config.event_routing {
            for target in targets {
                if !names.contains(target.as_str()) {
                    return Err(Error::validation(format!(
                        "routing for {} targets unknown distributor {target}",
                        kind.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Instantiate and open every distributor. Fails atomically: any open
    /// failure tears down whatever was already opened and leaves no session.
    pub async fn create_session(&self, session_id: impl Into<String>, config: SessionConfig) -> Result<Arc<Session>> {
        let session_id = session_id.into();
        Self::validate_config(&config)?;
        if self.sessions.read().contains_key(&session_id) {
            return Err(Error::validation(format!("session {session_id} already exists")));
        }

        let mut opened: Vec<Arc<DistributorHandle>> = Vec::with_capacity(config.distributors.len());
        for dist_config in &config.distributors {
            let handle = DistributorHandle::new(dist_config.clone());
            match handle.open().await {
                Ok(()) => opened.push(handle),
                Err(e) => {
                    warn!(
                        session = %session_id,
                        distributor = %dist_config.name,
                        error = %e,
                        "session creation failed, tearing down"
                    );
                    for handle in &opened {
                        handle.stop(None).await;
                    }
                    return Err(e);
                }
            }
        }

        let session = Arc::new(Session {
            id: session_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            distributors: RwLock::new(
                opened.iter().map(|h| (h.name(), Arc::clone(h))).collect(),
            ),
            routing: RwLock::new(config.event_routing),
            events_routed: AtomicU64::new(0),
            watchers: RwLock::new(Vec::new()),
        });

        // Forward degradation to session observers.
        for handle in &opened {
            let mut state_rx = handle.subscribe_state();
            let events_tx = self.events_tx.clone();
            let sid = session_id.clone();
            let watcher = tokio::spawn(async move {
                while let Ok((name, state)) = state_rx.recv().await {
                    if state == DistributorState::Degraded {
                        let _ = events_tx.send(DistributionEvent::DistributorDegraded {
                            session_id: sid.clone(),
                            distributor: name,
                        });
                    }
                }
            });
            session.watchers.write().push(watcher);
        }

        self.sessions.write().insert(session_id.clone(), Arc::clone(&session));
        info!(session = %session_id, distributors = session.distributor_names().len(), "session created");
        let _ = self.events_tx.send(DistributionEvent::SessionCreated { session_id });
        Ok(session)
    }

    /// Route one event to every distributor the session maps its kind to.
    /// Best-effort and non-blocking: target failures surface later through
    /// stats and degradation, never here.
    pub fn route_event(
        &self,
        session_id: &str,
        event_kind: StreamKind,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let session = self.get_session(session_id)?;

        let targets = session
            .routing
            .read()
            .get(&event_kind)
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!(
                    "no routing configured for event kind {}",
                    event_kind.as_str()
                ))
            })?;

        let event = OutboundEvent::new(event_kind, payload);
        let distributors = session.distributors.read();
        let mut reached = 0;
        for target in &targets {
            if let Some(handle) = distributors.get(target) {
                handle.enqueue(event.clone());
                reached += 1;
            }
        }
        session.events_routed.fetch_add(1, Ordering::Relaxed);
        Ok(reached)
    }

    /// Update routing for a live session. Targets must exist.
    pub fn set_routing(
        &self,
        session_id: &str,
        event_kind: StreamKind,
        targets: Vec<String>,
    ) -> Result<()> {
        let session = self.get_session(session_id)?;
        {
            let distributors = session.distributors.read();
            for target in &targets {
                if !distributors.contains_key(target) {
                    return Err(Error::validation(format!(
                        "routing targets unknown distributor {target}"
                    )));
                }
            }
        }
        session.routing.write().insert(event_kind, targets);
        let _ = self.events_tx.send(DistributionEvent::SessionUpdate {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Apply a partial config change in place; the transport is closed and
    /// reopened while queued events keep buffering.
    pub async fn reconfigure_distributor(
        &self,
        session_id: &str,
        name: &str,
        destination: Option<Destination>,
        filter: Option<DistributorFilter>,
    ) -> Result<()> {
        let session = self.get_session(session_id)?;
        let handle = session
            .distributor(name)
            .ok_or_else(|| Error::not_found(format!("distributor {name} in session {session_id}")))?;
        handle.reconfigure(destination, filter).await?;
        let _ = self.events_tx.send(DistributionEvent::SessionUpdate {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub fn enable_distributor(&self, session_id: &str, name: &str) -> Result<()> {
        self.set_distributor_enabled(session_id, name, true)
    }

    pub fn disable_distributor(&self, session_id: &str, name: &str) -> Result<()> {
        self.set_distributor_enabled(session_id, name, false)
    }

    fn set_distributor_enabled(&self, session_id: &str, name: &str, enabled: bool) -> Result<()> {
        let session = self.get_session(session_id)?;
        let handle = session
            .distributor(name)
            .ok_or_else(|| Error::not_found(format!("distributor {name} in session {session_id}")))?;
        handle.set_enabled(enabled);
        Ok(())
    }

    /// Drain queues up to the grace period, stop distributors, remove.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))?;

        for watcher in session.watchers.write().drain(..) {
            watcher.abort();
        }
        let handles: Vec<_> = session.distributors.read().values().cloned().collect();
        for handle in handles {
            handle.stop(Some(self.end_grace)).await;
        }
        info!(session = %session_id, "session ended");
        let _ = self.events_tx.send(DistributionEvent::SessionEnded {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub fn get_session_status(&self, session_id: &str) -> Result<SessionStatus> {
        Ok(self.get_session(session_id)?.status())
    }

    pub fn all_statuses(&self) -> Vec<SessionStatus> {
        self.sessions.read().values().map(|s| s.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::OverflowMode;

    fn udp_config(name: &str, port: u16) -> DistributorConfig {
        DistributorConfig {
            name: name.to_string(),
            destination: Destination::Udp { host: "127.0.0.1".to_string(), port },
            filter: None,
            queue_capacity: 64,
            overflow: OverflowMode::DropHead,
            degraded_threshold: 5,
        }
    }

    #[tokio::test]
    async fn create_and_route_to_udp() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![udp_config("udp-out", port)],
            event_routing: HashMap::from([(StreamKind::Gaze, vec!["udp-out".to_string()])]),
        };
        manager.create_session("s1", config).await.unwrap();

        let reached = manager
            .route_event("s1", StreamKind::Gaze, serde_json::json!({"x": 0.1, "y": 0.2}))
            .unwrap();
        assert_eq!(reached, 1);

        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .expect("datagram within deadline")
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value, serde_json::json!({"x": 0.1, "y": 0.2}));

        manager.end_session("s1").await.unwrap();
        assert!(manager.get_session("s1").is_err());
    }

    #[tokio::test]
    async fn routing_unknown_kind_is_validation_error() {
        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![udp_config("udp-out", 9)],
            event_routing: HashMap::from([(StreamKind::Gaze, vec!["udp-out".to_string()])]),
        };
        manager.create_session("s1", config).await.unwrap();

        let err = manager
            .route_event("s1", StreamKind::Face, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn routing_to_unknown_session_is_not_found() {
        let manager = SessionManager::default();
        let err = manager
            .route_event("missing", StreamKind::Gaze, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn create_session_rejects_routing_to_unknown_distributor() {
        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![udp_config("udp-out", 9)],
            event_routing: HashMap::from([(StreamKind::Gaze, vec!["nope".to_string()])]),
        };
        assert!(matches!(
            manager.create_session("s1", config).await,
            Err(Error::Validation(_))
        ));
        assert!(manager.session_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_open_leaves_no_session_behind() {
        // Occupy a port with a plain TCP listener so the websocket
        // distributor cannot bind it.
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap();

        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![
                udp_config("udp-out", 9),
                DistributorConfig {
                    name: "ws-out".to_string(),
                    destination: Destination::Websocket { bind: taken.to_string() },
                    filter: None,
                    queue_capacity: 64,
                    overflow: OverflowMode::DropHead,
                    degraded_threshold: 5,
                },
            ],
            event_routing: HashMap::new(),
        };

        assert!(manager.create_session("s1", config).await.is_err());
        assert!(manager.session_ids().is_empty());
    }

    #[tokio::test]
    async fn enable_disable_round_trip() {
        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![udp_config("udp-out", 9)],
            event_routing: HashMap::new(),
        };
        let session = manager.create_session("s1", config).await.unwrap();

        manager.disable_distributor("s1", "udp-out").unwrap();
        assert!(!session.distributor("udp-out").unwrap().is_enabled());
        manager.enable_distributor("s1", "udp-out").unwrap();
        assert!(session.distributor("udp-out").unwrap().is_enabled());

        assert!(matches!(
            manager.enable_distributor("s1", "nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_aggregates_distributors() {
        let manager = SessionManager::default();
        let config = SessionConfig {
            distributors: vec![udp_config("udp-out", 9)],
            event_routing: HashMap::from([(StreamKind::Gaze, vec!["udp-out".to_string()])]),
        };
        manager.create_session("s1", config).await.unwrap();

        let status = manager.get_session_status("s1").unwrap();
        assert_eq!(status.id, "s1");
        assert_eq!(status.distributors.len(), 1);
        assert_eq!(status.distributors[0].kind, DistributorKind::Udp);
        assert_eq!(
            status.event_routing.get("gaze"),
            Some(&vec!["udp-out".to_string()])
        );
    }
}
