//! UDP distributor: raw payload bytes, one datagram per event.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::info;

use crate::error::{Error, Result};

use super::{Distributor, DistributorKind, OutboundEvent, SendOptions, SendOutcome};

/// Largest payload a single datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpDistributor {
    host: String,
    port: u16,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpDistributor {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            socket: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Distributor for UdpDistributor {
    fn kind(&self) -> DistributorKind {
        DistributorKind::Udp
    }

    async fn open(&self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::transport(format!("udp connect {}:{}: {e}", self.host, self.port)))?;
        info!(host = %self.host, port = self.port, "udp distributor open");
        *self.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.socket.write().take();
        Ok(())
    }

    async fn send(&self, event: &OutboundEvent, _opts: &SendOptions) -> Result<SendOutcome> {
        let socket = self
            .socket
            .read()
            .clone()
            .ok_or_else(|| Error::transport("udp distributor not open"))?;

        let payload = serde_json::to_vec(&event.data)?;
        if payload.len() > MAX_DATAGRAM {
            return Err(Error::Overflow(format!(
                "event of {} bytes exceeds datagram limit",
                payload.len()
            )));
        }

        let sent = socket
            .send(&payload)
            .await
            .map_err(|e| Error::transport(format!("udp send: {e}")))?;
        Ok(SendOutcome {
            bytes_sent: sent,
            clients_reached: 1,
        })
    }
}
