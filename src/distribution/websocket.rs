//! WebSocket distributor: a small server that pushes text JSON frames
//! `{event, timestamp, data}` to every connected client.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::{event_json, Distributor, DistributorKind, OutboundEvent, SendOptions, SendOutcome};

struct Client {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

pub struct WebsocketDistributor {
    bind: String,
    clients: Arc<RwLock<Vec<Client>>>,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_client_id: Arc<AtomicU64>,
}

impl WebsocketDistributor {
    pub fn new(bind: String) -> Self {
        Self {
            bind,
            clients: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

#[async_trait]
impl Distributor for WebsocketDistributor {
    fn kind(&self) -> DistributorKind {
        DistributorKind::Websocket
    }

    async fn open(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|e| Error::transport(format!("ws bind {}: {e}", self.bind)))?;
        info!(bind = %self.bind, "websocket distributor listening");

        self.running.store(true, Ordering::SeqCst);
        let clients = Arc::clone(&self.clients);
        let running = Arc::clone(&self.running);
        let id_counter = Arc::clone(&self.next_client_id);

        let task = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let Ok((stream, peer)) = listener.accept().await else {
                    continue;
                };
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        debug!(error = %e, "ws handshake failed");
                        continue;
                    }
                };
                debug!(%peer, "ws client connected");

                let (mut sink, mut source) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                let id = id_counter.fetch_add(1, Ordering::Relaxed);
                clients.write().push(Client { id, tx });

                // Writer: forward queued frames to the socket.
                let writer_clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    writer_clients.write().retain(|c| c.id != id);
                });

                // Reader: answer pings, notice disconnects.
                let reader_clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    while let Some(msg) = source.next().await {
                        match msg {
                            Ok(Message::Ping(payload)) => {
                                let clients = reader_clients.read();
                                if let Some(client) = clients.iter().find(|c| c.id == id) {
                                    let _ = client.tx.send(Message::Pong(payload));
                                }
                            }
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => {}
                        }
                    }
                    reader_clients.write().retain(|c| c.id != id);
                });
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.clients.write().clear();
        Ok(())
    }

    async fn send(&self, event: &OutboundEvent, _opts: &SendOptions) -> Result<SendOutcome> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(Error::transport("ws distributor not open"));
        }
        let text = event_json(event)?;
        let bytes = text.len();

        let mut reached = 0usize;
        let mut dead: Vec<u64> = Vec::new();
        {
            let clients = self.clients.read();
            for client in clients.iter() {
                if client.tx.send(Message::Text(text.clone())).is_ok() {
                    reached += 1;
                } else {
                    dead.push(client.id);
                }
            }
        }
        if !dead.is_empty() {
            warn!(count = dead.len(), "pruning dead ws clients");
            self.clients.write().retain(|c| !dead.contains(&c.id));
        }

        Ok(SendOutcome {
            bytes_sent: bytes * reached,
            clients_reached: reached,
        })
    }
}
