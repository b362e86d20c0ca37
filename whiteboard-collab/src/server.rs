//! WebSocket whiteboard server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Broadcaster ──► other sessions in the room
//!            ├── RoomSession ──────┤   (local or relay)
//! Client B ──┘   (per connection)  └── RoomStore ──► RoomWriters ──► HotLog (RocksDB)
//!                                      (here, or on       (per room)      │
//!                                       the relay hub)                    └── Compactor ──► SnapshotStore
//! ```
//!
//! Each connection is authenticated during the handshake, then runs one
//! loop that multiplexes client frames with room events from other
//! connections.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, Credentials};
use crate::broadcast::{Broadcaster, LocalBroadcaster};
use crate::config::WhiteboardConfig;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::relay::RelayLink;
use crate::session::WhiteboardService;
use crate::storage::{FsSnapshotStore, RocksHotLog};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The whiteboard server.
pub struct WhiteboardServer {
    config: ServerConfig,
    service: Arc<WhiteboardService>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl WhiteboardServer {
    pub fn new(config: ServerConfig, service: Arc<WhiteboardService>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            service,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Build the server from configuration.
    ///
    /// With a relay hub configured, fan-out and room storage both go through
    /// the hub and no local store is opened. Otherwise the stores are opened
    /// here and fan-out stays in this process.
    pub async fn open(config: &WhiteboardConfig) -> Result<Self, BoxError> {
        let capacity = config.server.broadcast_capacity;
        let service = match &config.relay_url {
            Some(url) => {
                let link = RelayLink::connect(url, capacity).await?;
                WhiteboardService::with_store(Arc::new(link.store()), Arc::new(link.broadcaster()))
            }
            None => {
                let hot_log = Arc::new(RocksHotLog::open(config.hot_log.clone())?);
                let snapshots = Arc::new(FsSnapshotStore::open(config.snapshots.clone())?);
                WhiteboardService::new(hot_log, snapshots, Arc::new(LocalBroadcaster::new(capacity)), config.compaction)
            }
        };
        Ok(Self::new(config.server.clone(), service, config.authenticator()))
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Whiteboard server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, auth, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<WhiteboardService>,
        auth: Arc<dyn Authenticator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let mut authorized = false;
        let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let credentials = Credentials::from_parts(
                request.uri().query(),
                request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            );
            if auth.authenticate(&credentials) {
                authorized = true;
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                if !authorized {
                    stats.write().await.rejected_connections += 1;
                    log::warn!("Rejected handshake from {addr}: {e}");
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = service.open_session();
        let result = async {
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.as_str().len() as u64;
                                }
                                match ClientEvent::decode(text.as_str()) {
                                    Ok(event) => {
                                        log::debug!("{} from {}", event.name(), session.id());
                                        for reply in session.handle(event).await {
                                            send_event(&mut ws_sender, &reply).await?;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode event from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    event = session.next_event() => {
                        match event {
                            Some(event) => send_event(&mut ws_sender, &event).await?,
                            None => {
                                log::warn!("Room closed under connection {}", session.id());
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        session.disconnect().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.service.broadcaster().room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<WhiteboardService> {
        &self.service
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), BoxError> {
    let text = event.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
