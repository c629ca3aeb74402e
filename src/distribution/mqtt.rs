//! MQTT distributor: publishes events to a per-kind topic map via rumqttc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::{Distributor, DistributorKind, OutboundEvent, SendOptions, SendOutcome};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    /// event kind → explicit topic.
    pub topics: HashMap<String, String>,
    /// Fallback topic prefix: events publish under `<prefix>/<kind>`.
    pub topic_prefix: String,
    /// 0, 1 or 2.
    pub qos: u8,
    pub retain: bool,
}

pub struct MqttDistributor {
    settings: MqttSettings,
    client: Mutex<Option<AsyncClient>>,
    event_loop_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    connected: std::sync::Arc<AtomicBool>,
}

impl MqttDistributor {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
            event_loop_task: Mutex::new(None),
            connected: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    fn qos(&self) -> QoS {
        match self.settings.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Resolve the topic for an event kind.
    pub fn topic_for(&self, event_kind: &str) -> String {
        self.settings
            .topics
            .get(event_kind)
            .cloned()
            .unwrap_or_else(|| format!("{}/{}", self.settings.topic_prefix, event_kind))
    }
}

#[async_trait]
impl Distributor for MqttDistributor {
    fn kind(&self) -> DistributorKind {
        DistributorKind::Mqtt
    }

    async fn open(&self) -> Result<()> {
        let client_id = self
            .settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("synopticon-{}", uuid::Uuid::new_v4().simple()));
        let mut options = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        info!(host = %self.settings.host, port = self.settings.port, "mqtt distributor connecting");

        let connected = std::sync::Arc::clone(&self.connected);
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        debug!("mqtt connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!(error = %e, "mqtt event loop error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *self.client.lock() = Some(client);
        *self.event_loop_task.lock() = Some(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.event_loop_task.lock().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, event: &OutboundEvent, _opts: &SendOptions) -> Result<SendOutcome> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| Error::transport("mqtt distributor not open"))?;

        let topic = self.topic_for(&event.event);
        let payload = serde_json::to_vec(&event.data)?;
        let bytes = payload.len();

        client
            .publish(topic, self.qos(), self.settings.retain, payload)
            .await
            .map_err(|e| Error::transport(format!("mqtt publish: {e}")))?;

        Ok(SendOutcome {
            bytes_sent: bytes,
            clients_reached: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: None,
            topics: HashMap::from([("face".to_string(), "vision/faces".to_string())]),
            topic_prefix: "eyetracking".to_string(),
            qos: 0,
            retain: false,
        }
    }

    #[test]
    fn topic_map_overrides_prefix() {
        let dist = MqttDistributor::new(settings());
        assert_eq!(dist.topic_for("gaze"), "eyetracking/gaze");
        assert_eq!(dist.topic_for("face"), "vision/faces");
    }

    #[test]
    fn qos_levels_map() {
        let mut s = settings();
        s.qos = 0;
        assert_eq!(MqttDistributor::new(s.clone()).qos(), QoS::AtMostOnce);
        s.qos = 1;
        assert_eq!(MqttDistributor::new(s.clone()).qos(), QoS::AtLeastOnce);
        s.qos = 2;
        assert_eq!(MqttDistributor::new(s).qos(), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn send_before_open_is_transport_error() {
        let dist = MqttDistributor::new(settings());
        let event = OutboundEvent::new(crate::models::StreamKind::Gaze, serde_json::json!({}));
        assert!(matches!(
            dist.send(&event, &SendOptions::default()).await,
            Err(Error::Transport(_))
        ));
    }
}
