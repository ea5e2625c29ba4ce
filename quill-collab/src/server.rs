//! WebSocket front end for the session registry.
//!
//! Architecture:
//! ```text
//! TCP accept ── WebSocket upgrade ── per connection:
//!
//!   reader task ── decode ClientMessage ── SessionRegistry ── session actor
//!                                                                 │
//!   writer task ◄── outbound channel (Sync, Operation, Ack, ...) ◄┘
//!        ▲
//!        └── local replies (Pong, errors the session never sees)
//! ```
//!
//! The writer owns the socket sink. It stops when a write exceeds
//! `write_timeout` or when the session drops the outbound channel
//! (eviction), and the connection then goes through the normal leave path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::AllowAll;
use crate::broadcast::{Connection, ConnectionId};
use crate::error::{CollabError, CollabResult};
use crate::protocol::{self, ClientMessage, DocumentId, Encoding, Frame, ParticipantId, ProtocolError, ServerMessage};
use crate::registry::{RegistryStats, SessionRegistry};
use crate::session::SessionConfig;
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig};

const LOCAL_CAPACITY: usize = 32;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Longest a single socket write may take before the connection is dropped
    pub write_timeout: Duration,
    /// Session tuning shared by every document
    pub session: SessionConfig,
    /// RocksDB directory for checkpoints (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            write_timeout: Duration::from_secs(5),
            session: SessionConfig::default(),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timers, in-memory storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            write_timeout: Duration::from_secs(1),
            session: SessionConfig::for_testing(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub errors_sent: u64,
    pub registry: RegistryStats,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors_sent: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if `storage_path` is set.
    pub fn new(config: ServerConfig) -> CollabResult<Self> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let registry = SessionRegistry::new(config.session.clone(), store, Arc::new(AllowAll), None);
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    /// Serve an existing registry (custom storage or authorization).
    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            messages_received: s.messages_received.load(Ordering::Relaxed),
            messages_sent: s.messages_sent.load(Ordering::Relaxed),
            bytes_received: s.bytes_received.load(Ordering::Relaxed),
            errors_sent: s.errors_sent.load(Ordering::Relaxed),
            registry: self.registry.stats().await,
        }
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind().await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (sink, mut source) = ws_stream.split();
        log::debug!("WebSocket connection established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (local_tx, local_rx) = mpsc::channel(LOCAL_CAPACITY);
        let json = Arc::new(AtomicBool::new(false));
        let mut writer = tokio::spawn(write_loop(
            sink,
            local_rx,
            json.clone(),
            config.write_timeout,
            stats.clone(),
        ));

        let mut conn = ClientConnection {
            addr,
            registry: registry.clone(),
            local_tx,
            json,
            stats: stats.clone(),
            outbound_capacity: registry.config().outbound_capacity,
            joined: None,
        };

        let mut writer_done = false;
        let result = tokio::select! {
            r = conn.read_loop(&mut source) => r,
            _ = &mut writer => {
                writer_done = true;
                log::debug!("Writer for {addr} stopped");
                Ok(())
            }
        };

        if let Some(joined) = conn.joined.take() {
            registry
                .disconnect(joined.document_id, joined.participant_id, joined.connection_id)
                .await;
        }
        drop(conn);
        if !writer_done {
            // Let queued replies flush, bounded by the write timeout.
            if time::timeout(config.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }

        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Connection from {addr} closed");
        result
    }
}

enum WriterCommand {
    Send(Arc<ServerMessage>),
    /// Start forwarding a session's outbound channel.
    Attach(mpsc::Receiver<Arc<ServerMessage>>),
}

enum Flow {
    Continue,
    Close,
}

struct Joined {
    document_id: DocumentId,
    participant_id: ParticipantId,
    connection_id: ConnectionId,
}

/// Reader-side state of one WebSocket connection.
struct ClientConnection {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    local_tx: mpsc::Sender<WriterCommand>,
    json: Arc<AtomicBool>,
    stats: Arc<AtomicServerStats>,
    outbound_capacity: usize,
    joined: Option<Joined>,
}

impl ClientConnection {
    async fn read_loop(&mut self, source: &mut WsSource) -> Result<(), ProtocolError> {
        while let Some(msg) = source.next().await {
            let frame = match msg {
                Ok(Message::Binary(data)) => Frame::Binary(data.into()),
                Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(ProtocolError::Transport(e.to_string())),
            };

            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);
            self.json.store(frame.encoding() == Encoding::Json, Ordering::Relaxed);

            let msg: ClientMessage = match protocol::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Undecodable frame from {}: {e}", self.addr);
                    self.send_error(&CollabError::Protocol(e)).await;
                    continue;
                }
            };

            if let Flow::Close = self.handle_message(msg).await {
                break;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Flow {
        match msg {
            ClientMessage::Join { document_id, participant_id } => {
                if self.joined.is_some() {
                    self.send_unexpected("join on a connection that already joined").await;
                    return Flow::Continue;
                }
                let (connection, outbound) = Connection::channel(self.outbound_capacity);
                let connection_id = connection.id();
                match self.registry.join(document_id, participant_id, connection).await {
                    Ok(_) => {
                        self.joined = Some(Joined {
                            document_id,
                            participant_id,
                            connection_id,
                        });
                        if self.local_tx.send(WriterCommand::Attach(outbound)).await.is_err() {
                            return Flow::Close;
                        }
                    }
                    Err(e) => self.send_error(&e).await,
                }
            }
            ClientMessage::Operation { base_revision, operation } => {
                let Some(joined) = &self.joined else {
                    self.send_unexpected("operation before join").await;
                    return Flow::Continue;
                };
                let result = self
                    .registry
                    .send_operation(joined.document_id, joined.participant_id, base_revision, operation)
                    .await;
                if let Err(e) = result {
                    self.send_error(&e).await;
                }
            }
            ClientMessage::Cursor { position, seq } => {
                if let Some(joined) = &self.joined {
                    self.registry
                        .move_cursor(joined.document_id, joined.participant_id, position, seq)
                        .await;
                }
            }
            ClientMessage::Sync => {
                let Some(joined) = &self.joined else {
                    self.send_unexpected("sync before join").await;
                    return Flow::Continue;
                };
                // The snapshot itself arrives through the outbound channel.
                if let Err(e) = self.registry.sync(joined.document_id, joined.participant_id).await {
                    self.send_error(&e).await;
                }
            }
            ClientMessage::Leave => {
                if let Some(joined) = self.joined.take() {
                    self.registry.leave(joined.document_id, joined.participant_id).await;
                }
                return Flow::Close;
            }
            ClientMessage::Ping => {
                self.send_local(ServerMessage::Pong).await;
            }
        }
        Flow::Continue
    }

    async fn send_local(&self, msg: ServerMessage) {
        let _ = self.local_tx.send(WriterCommand::Send(Arc::new(msg))).await;
    }

    async fn send_error(&self, err: &CollabError) {
        self.stats.errors_sent.fetch_add(1, Ordering::Relaxed);
        self.send_local(ServerMessage::error(err)).await;
    }

    async fn send_unexpected(&self, what: &str) {
        log::warn!("Protocol violation from {}: {what}", self.addr);
        let err = CollabError::Protocol(ProtocolError::UnexpectedMessage(what.to_string()));
        self.send_error(&err).await;
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut local_rx: mpsc::Receiver<WriterCommand>,
    json: Arc<AtomicBool>,
    write_timeout: Duration,
    stats: Arc<AtomicServerStats>,
) {
    let mut outbound: Option<mpsc::Receiver<Arc<ServerMessage>>> = None;

    loop {
        let msg = tokio::select! {
            biased;
            cmd = local_rx.recv() => match cmd {
                Some(WriterCommand::Send(msg)) => msg,
                Some(WriterCommand::Attach(rx)) => {
                    outbound = Some(rx);
                    continue;
                }
                None => break,
            },
            msg = recv_outbound(&mut outbound) => match msg {
                Some(msg) => msg,
                None => {
                    log::warn!("Session released this connection, closing");
                    break;
                }
            },
        };

        let encoding = if json.load(Ordering::Relaxed) {
            Encoding::Json
        } else {
            Encoding::Binary
        };
        match write_frame(&mut sink, &msg, encoding, write_timeout).await {
            Ok(()) => {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Dropping connection after failed {} write: {e}", msg.kind());
                break;
            }
        }
    }

    let _ = time::timeout(write_timeout, sink.close()).await;
}

async fn recv_outbound(outbound: &mut Option<mpsc::Receiver<Arc<ServerMessage>>>) -> Option<Arc<ServerMessage>> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_frame(
    sink: &mut WsSink,
    msg: &ServerMessage,
    encoding: Encoding,
    write_timeout: Duration,
) -> Result<(), ProtocolError> {
    let message = match protocol::encode(msg, encoding)? {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    };
    match time::timeout(write_timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProtocolError::Transport(e.to_string())),
        Err(_) => Err(ProtocolError::Timeout),
    }
}
