//! WebSocket sequencer server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── SequencerState ── fan-out
//! Client B ──┘         │
//!                      ├── chain validation (accept / drop stale)
//!                      └── accepted history → late joiners
//! ```
//!
//! The server holds no document replica: it validates each content
//! message against the room's revision chain, keeps the accepted history,
//! and fans accepted messages out to every connected socket — including
//! the sender, whose echo doubles as the acknowledgment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::StateUpdateMessage;
use crate::transport::SequencerState;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sockets per room
    pub max_clients_per_room: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_room: 100,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

struct Room {
    sequencer: SequencerState,
    /// (connection id, encoded-frame sender) per attached socket.
    sockets: Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>,
}

impl Room {
    fn new() -> Self {
        Self {
            sequencer: SequencerState::new(),
            sockets: Vec::new(),
        }
    }

    fn broadcast(&mut self, frame: Vec<u8>) {
        self.sockets
            .retain(|(_, tx)| tx.send(frame.clone()).is_ok());
    }
}

/// The sequencer server.
pub struct CollabServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>>,
    stats: Arc<RwLock<ServerStats>>,
    connection_counter: Arc<AtomicU64>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            connection_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Listen for WebSocket connections. Runs the accept loop forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let connection_id = self.connection_counter.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, connection_id).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Room>>>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        connection_id: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The request path carries the document id: `/{doc_id}`.
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;
        let doc_id = path
            .trim_start_matches('/')
            .parse::<Uuid>()
            .unwrap_or_else(|_| Uuid::nil());
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        log::info!("websocket connection from {addr} joined doc {doc_id}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let room = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w
                .entry(doc_id)
                .or_insert_with(|| Arc::new(Mutex::new(Room::new())))
                .clone();
            let mut s = stats.write().await;
            s.active_rooms = rooms_w.len();
            room
        };

        // Register the socket and collect the history replay under one
        // lock, so no accepted message can slip between the two.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let history = {
            let mut room_l = room.lock().expect("room lock poisoned");
            if room_l.sockets.len() >= config.max_clients_per_room {
                log::warn!("room {doc_id} is full, refusing {addr}");
                return Ok(());
            }
            let frames: Vec<Vec<u8>> = room_l
                .sequencer
                .history()
                .iter()
                .filter_map(|m| m.encode().ok())
                .collect();
            room_l.sockets.push((connection_id, out_tx));
            frames
        };
        for frame in history {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        loop {
            tokio::select! {
                // Accepted message fan-out for this socket.
                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                // Incoming WebSocket message.
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match StateUpdateMessage::decode(&bytes) {
                                Ok(message) => {
                                    let mut room_l = room.lock().expect("room lock poisoned");
                                    if let Some(accepted) = room_l.sequencer.accept(message) {
                                        if let Ok(frame) = accepted.encode() {
                                            room_l.broadcast(frame);
                                        }
                                    }
                                }
                                Err(e) => log::warn!("undecodable frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    }
                }
            }
        }

        // Detach the socket; the room and its history stay for rejoiners.
        room.lock()
            .expect("room lock poisoned")
            .sockets
            .retain(|(id, _)| *id != connection_id);
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("connection from {addr} left doc {doc_id}");
        Ok(())
    }
}
