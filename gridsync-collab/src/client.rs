//! WebSocket client transport.
//!
//! [`WsTransport`] implements [`Transport`] over a `tokio-tungstenite`
//! connection to a [`crate::server::CollabServer`]. Outbound messages go
//! through an unbounded channel drained by a writer task; a reader task
//! decodes incoming frames and fans them out to registered receivers.
//! Once the socket drops, `send` fails with `Disconnected` and the
//! session's resend queue takes over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use gridsync_core::ClientId;

use crate::protocol::{ProtocolError, StateUpdateMessage};
use crate::transport::{Transport, TransportError};

type Routes = Arc<Mutex<RouteTable>>;

/// Registered receivers, plus a backlog for frames that arrive before the
/// first receiver registers (the server replays room history immediately
/// after the handshake).
#[derive(Default)]
struct RouteTable {
    subscribers: Vec<(ClientId, mpsc::UnboundedSender<StateUpdateMessage>)>,
    backlog: Vec<StateUpdateMessage>,
}

pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<StateUpdateMessage>,
    connected: Arc<AtomicBool>,
    routes: Routes,
}

impl WsTransport {
    /// Connect to `{server_url}/{doc_id}` and spawn the reader/writer
    /// tasks.
    pub async fn connect(server_url: &str, doc_id: Uuid) -> Result<Arc<Self>, ProtocolError> {
        let url = format!("{server_url}/{doc_id}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<StateUpdateMessage>();
        let connected = Arc::new(AtomicBool::new(true));
        let routes: Routes = Arc::new(Mutex::new(RouteTable::default()));

        // Writer task: drain the outgoing channel onto the socket.
        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message.encode() {
                    Ok(bytes) => {
                        if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode outgoing message: {e}"),
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader task: decode frames and fan out to registered receivers.
        let reader_connected = connected.clone();
        let reader_routes = routes.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match StateUpdateMessage::decode(&bytes) {
                            Ok(message) => {
                                let mut table =
                                    reader_routes.lock().expect("route lock poisoned");
                                if table.subscribers.is_empty() {
                                    table.backlog.push(message);
                                } else {
                                    table
                                        .subscribers
                                        .retain(|(_, tx)| tx.send(message.clone()).is_ok());
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            log::info!("websocket connection closed");
        });

        Ok(Arc::new(Self {
            outgoing: out_tx,
            connected,
            routes,
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Transport for WsTransport {
    fn send(&self, message: StateUpdateMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outgoing
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    fn register(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<StateUpdateMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.routes.lock().expect("route lock poisoned");
        for message in table.backlog.drain(..) {
            let _ = tx.send(message);
        }
        table.subscribers.push((client_id, tx));
        rx
    }

    fn leave(&self, client_id: ClientId) {
        self.routes
            .lock()
            .expect("route lock poisoned")
            .subscribers
            .retain(|(id, _)| *id != client_id);
    }
}
