//! WebSocket front-end for the planning registry.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── DocumentActor (planning 1) ──► PlanningStore
//!             ├── handle_connection ─┤
//! Client B ──┘         ▲            └── DocumentActor (planning 2)
//!                      │                        │
//!                      └──── Subscription ◄──── LocalTransport ("planning:{id}")
//! ```
//!
//! Each connection joins one planning at a time. Requests are answered in
//! order; realtime events from other participants are interleaved as
//! `event` frames.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::engine::PlanningRegistry;
use crate::error::{CollabError, Result};
use crate::identity::CurrentUser;
use crate::model::{PlanningId, UserId};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::storage::{MemoryStore, PlanningStore, RocksStore, StoreConfig, StoreError};
use crate::transport::{planning_channel, EventType, LocalTransport, RealtimeEvent, Subscription, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            collab: CollabConfig::default(),
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
    /// Frames answered with an error
    pub rejected_messages: u64,
    pub open_plannings: usize,
    pub participants: usize,
    pub events_published: u64,
    pub events_dropped: u64,
}

pub struct PlanningServer {
    config: ServerConfig,
    registry: Arc<PlanningRegistry>,
    transport: Arc<LocalTransport>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PlanningServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> std::result::Result<Self, StoreError> {
        let store: Arc<dyn PlanningStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig { path: path.clone(), ..StoreConfig::default() })?;
                log::info!("Opened planning store at {} ({} plannings)", path.display(), store.list_plannings()?.len());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn PlanningStore>) -> Self {
        let transport = Arc::new(LocalTransport::new(
            config.collab.subscriber_capacity,
            config.collab.publish_timeout,
        ));
        let registry = Arc::new(PlanningRegistry::new(store, transport.clone(), config.collab.clone()));
        Self {
            config,
            registry,
            transport,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> std::result::Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Planning server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::result::Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<PlanningRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> std::result::Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new(registry);
        let outcome: std::result::Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.as_str().len() as u64;
                            }
                            let reply = match ClientMessage::decode(text.as_str()) {
                                Ok(request) => conn.dispatch(request).await,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    ServerMessage::protocol_error(&e)
                                }
                            };
                            if matches!(reply, ServerMessage::Error { .. }) {
                                stats.write().await.rejected_messages += 1;
                            }
                            send(&mut ws_sender, &reply).await?;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let reply = ServerMessage::protocol_error(&ProtocolError::Decode(
                                "expected a text frame".into(),
                            ));
                            send(&mut ws_sender, &reply).await?;
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
                    },

                    event = async {
                        match conn.subscription.as_mut() {
                            Some(sub) => sub.recv().await,
                            None => std::future::pending().await,
                        }
                    } => match event {
                        Some(event) => {
                            if conn.is_echo(&event) {
                                continue;
                            }
                            send(&mut ws_sender, &ServerMessage::Event { event: (*event).clone() }).await?;
                        }
                        None => {
                            log::warn!("Event stream for {addr} closed");
                            conn.subscription = None;
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        conn.close().await;
        stats.write().await.active_connections -= 1;
        outcome
    }

    /// Flush and close every open planning.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let registry = self.registry.stats().await;
        let transport = self.transport.stats();
        stats.open_plannings = registry.open_plannings;
        stats.participants = registry.participants;
        stats.events_published = transport.events_published;
        stats.events_dropped = transport.events_dropped;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<PlanningRegistry> {
        &self.registry
    }
}

async fn send(sink: &mut WsSink, msg: &ServerMessage) -> std::result::Result<(), BoxError> {
    match msg.encode() {
        Ok(text) => sink.send(Message::Text(text.into())).await?,
        Err(e) => log::error!("Dropping outgoing frame: {e}"),
    }
    Ok(())
}

/// Per-connection state: who is talking and which planning they joined.
struct Connection {
    registry: Arc<PlanningRegistry>,
    user: Option<CurrentUser>,
    planning_id: Option<PlanningId>,
    subscription: Option<Subscription>,
}

impl Connection {
    fn new(registry: Arc<PlanningRegistry>) -> Self {
        Self { registry, user: None, planning_id: None, subscription: None }
    }

    /// Own edits and cursor moves come back as receipts, not events.
    fn is_echo(&self, event: &RealtimeEvent) -> bool {
        let own = self.user.as_ref().is_some_and(|u| u.user_id == event.user_id);
        own && matches!(event.event_type, EventType::OperationApplied | EventType::CursorMoved)
    }

    fn scope(&self) -> Result<(PlanningId, UserId)> {
        match (self.planning_id, &self.user) {
            (Some(planning_id), Some(user)) => Ok((planning_id, user.user_id)),
            (_, user) => Err(CollabError::NotParticipant {
                planning_id: Uuid::nil(),
                user_id: user.as_ref().map_or(Uuid::nil(), |u| u.user_id),
            }),
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> ServerMessage {
        self.handle(msg).await.unwrap_or_else(|e| {
            log::debug!("Request rejected: {e}");
            ServerMessage::error(&e)
        })
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        let registry = self.registry.clone();
        match msg {
            ClientMessage::Ping => Ok(ServerMessage::Pong),
            ClientMessage::Stats => Ok(ServerMessage::Stats { stats: registry.stats().await }),
            ClientMessage::Create { planning } => {
                let planning = registry.create_planning(planning).await?;
                Ok(ServerMessage::Created { planning })
            }
            ClientMessage::Join { planning_id, user } => self.join(planning_id, user).await,
            ClientMessage::Leave => {
                let (planning_id, _) = self.scope()?;
                self.leave().await?;
                Ok(ServerMessage::Left { planning_id })
            }
            ClientMessage::Snapshot => {
                let (planning_id, _) = self.scope()?;
                let snapshot = registry.snapshot(planning_id).await?;
                Ok(ServerMessage::Snapshot { snapshot })
            }
            ClientMessage::Resync { since } => {
                let (planning_id, _) = self.scope()?;
                let snapshot = registry.resync(planning_id, since).await?;
                Ok(ServerMessage::Snapshot { snapshot })
            }
            ClientMessage::Submit { operation } => {
                let (planning_id, user_id) = self.scope()?;
                if operation.planning_id != planning_id {
                    return Err(CollabError::Validation(format!(
                        "operation targets {} but the connection joined {planning_id}",
                        operation.planning_id
                    )));
                }
                if operation.author != user_id {
                    return Err(CollabError::Validation("operation author does not match the connection".into()));
                }
                let receipt = registry.submit(operation).await?;
                Ok(ServerMessage::Receipt { receipt })
            }
            ClientMessage::Cursor { field, position, selection } => {
                let (planning_id, user_id) = self.scope()?;
                registry.update_cursor(planning_id, user_id, field, position, selection).await?;
                Ok(ServerMessage::Ack)
            }
            ClientMessage::Lock { reason } => {
                let (planning_id, user_id) = self.scope()?;
                let lock = registry.acquire_lock(planning_id, user_id, reason).await?;
                Ok(ServerMessage::Locked { lock })
            }
            ClientMessage::Release => {
                let (planning_id, user_id) = self.scope()?;
                let released = registry.release_lock(planning_id, user_id).await?;
                Ok(ServerMessage::Released { released })
            }
            ClientMessage::Acknowledge { version } => {
                let (planning_id, user_id) = self.scope()?;
                registry.acknowledge(planning_id, user_id, version).await?;
                Ok(ServerMessage::Ack)
            }
            ClientMessage::Conflicts => {
                let (planning_id, _) = self.scope()?;
                let conflicts = registry.conflicts(planning_id).await?;
                Ok(ServerMessage::Conflicts { conflicts })
            }
            ClientMessage::ResolveConflict { conflict_id, note } => {
                let (planning_id, user_id) = self.scope()?;
                let conflict = registry.resolve_conflict(planning_id, conflict_id, user_id, note).await?;
                Ok(ServerMessage::ConflictResolved { conflict })
            }
        }
    }

    async fn join(&mut self, planning_id: PlanningId, user: CurrentUser) -> Result<ServerMessage> {
        if self.planning_id.is_some() {
            self.leave().await?;
        }

        // Subscribe first so no event between snapshot and subscription is lost.
        let subscription = self
            .registry
            .transport()
            .subscribe(&planning_channel(planning_id), &EventType::ALL);
        let snapshot = self.registry.join(planning_id, &user).await?;

        log::info!("{} ({}) joined planning {planning_id}", user.user_name, user.user_id);
        self.subscription = Some(subscription);
        self.planning_id = Some(planning_id);
        self.user = Some(user);
        Ok(ServerMessage::Joined { snapshot })
    }

    async fn leave(&mut self) -> Result<()> {
        self.subscription = None;
        let (Some(planning_id), Some(user)) = (self.planning_id.take(), self.user.as_ref()) else {
            return Ok(());
        };
        self.registry.leave(planning_id, user.user_id).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.leave().await {
            log::warn!("Leave on disconnect failed: {e}");
        }
    }
}
