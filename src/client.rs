//! Client facade: owns the node pool, players and queues of one bot user.
//!
//! Node socket tasks report through a single dispatcher task, which routes
//! player updates and events by guild and migrates players off dead nodes.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::player::{PlayOptions, Player, PlayerContext};
use crate::audio::queue::Queue;
use crate::audio::voice::VoiceGateway;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, DestroyReason, EventBus};
use crate::id::{ChannelId, GuildId, UserId};
use crate::node::{MigrationReport, Node, NodeManager, NodeSignal};
use crate::sources::{LoadKind, ResolveResult, SourceResolver};
use crate::storage::{HistoryStore, JsonStore, MemoryStore, QueueStore};
use crate::track::{QueueEntry, Requester};

/// Queues by guild. A queue outlives its player, so a re-created player
/// picks up where the old one stopped, until the voice session ends.
pub struct QueueManager {
    queues: DashMap<GuildId, Arc<AsyncMutex<Queue>>>,
    queue_store: Arc<dyn QueueStore>,
    history_store: Arc<dyn HistoryStore>,
    history_limit: usize,
}

impl QueueManager {
    pub fn new(
        queue_store: Arc<dyn QueueStore>,
        history_store: Arc<dyn HistoryStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            queue_store,
            history_store,
            history_limit,
        }
    }

    /// The guild's queue, loaded from the store on first access.
    pub async fn get(&self, guild_id: GuildId) -> Arc<AsyncMutex<Queue>> {
        let existing = self.queues.get(&guild_id).map(|queue| queue.clone());
        if let Some(queue) = existing {
            return queue;
        }

        let mut queue = Queue::new(
            guild_id,
            self.history_limit,
            self.queue_store.clone(),
            self.history_store.clone(),
        );
        if let Err(e) = queue.load().await {
            warn!("Failed to restore queue for guild {}: {}", guild_id, e);
        }

        self.queues
            .entry(guild_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(queue)))
            .clone()
    }

    /// Drops the in-memory queue; the stored snapshot stays.
    pub fn evict(&self, guild_id: GuildId) {
        self.queues.remove(&guild_id);
    }

    /// Drops the queue and its stored snapshot. History is kept.
    pub async fn discard(&self, guild_id: GuildId) {
        self.evict(guild_id);
        if let Err(e) = self.queue_store.delete_queue(guild_id).await {
            warn!("Failed to delete queue for guild {}: {}", guild_id, e);
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

pub struct PlayerManager {
    players: DashMap<GuildId, Arc<Player>>,
    nodes: Arc<NodeManager>,
    queues: QueueManager,
    ctx: PlayerContext,
    default_volume: u16,
}

impl PlayerManager {
    pub fn new(
        nodes: Arc<NodeManager>,
        queues: QueueManager,
        ctx: PlayerContext,
        default_volume: u16,
    ) -> Self {
        Self {
            players: DashMap::new(),
            nodes,
            queues,
            ctx,
            default_volume,
        }
    }

    /// Returns the guild's player, creating it on `node` (default: the
    /// least loaded ready node) if needed.
    pub async fn create(&self, guild_id: GuildId, node: Option<Arc<Node>>) -> Result<Arc<Player>> {
        if let Some(player) = self.get(guild_id) {
            return Ok(player);
        }

        let node = match node {
            Some(node) => node,
            None => self.nodes.require_best()?,
        };
        let queue = self.queues.get(guild_id).await;

        match self.players.entry(guild_id) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let player = Player::spawn(
                    guild_id,
                    node.clone(),
                    queue,
                    self.ctx.clone(),
                    self.default_volume,
                );
                slot.insert(player.clone());

                info!("🎧 Created player for guild {} on {}", guild_id, node.name());
                self.ctx.events.emit(ClientEvent::PlayerCreate {
                    guild_id,
                    node: node.name().to_string(),
                });
                Ok(player)
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|player| player.clone())
    }

    /// Removes the player and tears it down on its node. A node that cannot
    /// be reached does not keep the player registered. The stored queue is
    /// deleted only when the voice session itself ended.
    pub async fn destroy(&self, guild_id: GuildId, reason: DestroyReason) -> Result<()> {
        let (_, player) = self
            .players
            .remove(&guild_id)
            .ok_or_else(|| Error::PlayerNotFound(guild_id.to_string()))?;
        if reason.ends_session() {
            self.queues.discard(guild_id).await;
        } else {
            self.queues.evict(guild_id);
        }

        if let Err(e) = player.destroy(reason).await {
            warn!("Node cleanup for guild {} failed: {}", guild_id, e);
        }
        Ok(())
    }

    /// Players currently owned by `node`.
    pub fn on_node(&self, node: &str) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .filter(|entry| entry.value().node().name() == node)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

pub struct Client {
    config: Config,
    events: EventBus,
    user_id: watch::Sender<Option<UserId>>,
    nodes: Arc<NodeManager>,
    resolver: Arc<SourceResolver>,
    players: Arc<PlayerManager>,
    signals: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<NodeSignal>>>,
    cancel: CancellationToken,
}

impl Client {
    pub async fn new(config: Config, gateway: Arc<dyn VoiceGateway>) -> Result<Self> {
        let resolver_config = config
            .resolver_config()
            .map_err(|e| Error::Config(format!("{e:#}")))?;

        let events = EventBus::new(config.event_capacity);
        let (user_id, user_rx) = watch::channel(config.user_id);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let nodes = Arc::new(NodeManager::new(
            config.client_name.clone(),
            config.reconnect_policy(),
            user_rx,
            events.clone(),
            signal_tx,
        ));
        let resolver = Arc::new(SourceResolver::new(nodes.clone(), resolver_config));

        let (queue_store, history_store): (Arc<dyn QueueStore>, Arc<dyn HistoryStore>) =
            match &config.data_dir {
                Some(dir) => {
                    let store = Arc::new(JsonStore::new(dir.clone()).await?);
                    match store.stats().await {
                        Ok(stats) => info!("💾 {}", stats),
                        Err(e) => warn!("Failed to read storage stats: {}", e),
                    }
                    (store.clone(), store)
                }
                None => {
                    let store = Arc::new(MemoryStore::new());
                    (store.clone(), store)
                }
            };

        let ctx = PlayerContext {
            events: events.clone(),
            resolver: resolver.clone(),
            gateway,
        };
        let players = Arc::new(PlayerManager::new(
            nodes.clone(),
            QueueManager::new(queue_store, history_store, config.history_limit),
            ctx,
            config.default_volume,
        ));

        Ok(Self {
            config,
            events,
            user_id,
            nodes,
            resolver,
            players,
            signals: parking_lot::Mutex::new(Some(signal_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Connects the configured nodes and starts routing their traffic.
    pub fn start(&self) -> Result<()> {
        let Some(signals) = self.signals.lock().take() else {
            warn!("Client already started");
            return Ok(());
        };

        for node in &self.config.nodes {
            self.nodes.add(node.clone())?;
        }

        tokio::spawn(dispatch(
            self.players.clone(),
            self.nodes.clone(),
            signals,
            self.config.migrate_on_disconnect,
            self.cancel.clone(),
        ));
        info!("🚀 Client started with {} nodes", self.nodes.len());
        Ok(())
    }

    /// Identity the nodes act for. Node sockets wait for it.
    pub fn set_user_id(&self, user_id: UserId) {
        self.user_id.send_replace(Some(user_id));
    }

    pub fn user_id(&self) -> Option<UserId> {
        *self.user_id.borrow()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn nodes(&self) -> &Arc<NodeManager> {
        &self.nodes
    }

    pub fn resolver(&self) -> &Arc<SourceResolver> {
        &self.resolver
    }

    pub fn players(&self) -> &Arc<PlayerManager> {
        &self.players
    }

    /// Resolves `input` and queues the result: every track of a playlist,
    /// otherwise the first match. Starts playback if the player is idle.
    pub async fn play_input(
        &self,
        guild_id: GuildId,
        input: &str,
        requester: Option<Requester>,
    ) -> Result<ResolveResult> {
        let result = self.resolver.resolve(input, requester).await?;
        let Some(first) = result.first().cloned() else {
            debug!("Nothing found for {:?}", input);
            return Ok(result);
        };

        let player = self.players.create(guild_id, None).await?;
        {
            let queue = player.queue();
            let mut queue = queue.lock().await;
            if result.kind == LoadKind::Playlist {
                let entries: Vec<QueueEntry> =
                    result.tracks.iter().cloned().map(QueueEntry::from).collect();
                queue.add_many(entries).await;
            } else {
                queue.add(first).await;
            }
        }

        if !player.is_playing() && !player.is_paused() {
            player.play(PlayOptions::default()).await?;
        }
        Ok(result)
    }

    /// Voice state of a guild member. Only the bot's own state matters;
    /// leaving the channel destroys the player.
    pub async fn handle_voice_state_update(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) -> Result<()> {
        if self.user_id() != Some(user_id) {
            return Ok(());
        }
        let Some(player) = self.players.get(guild_id) else {
            return Ok(());
        };

        match channel_id {
            None => {
                self.players
                    .destroy(guild_id, DestroyReason::Disconnected)
                    .await
            }
            Some(_) => player.handle_voice_state(session_id, channel_id).await,
        }
    }

    pub async fn handle_voice_server_update(
        &self,
        guild_id: GuildId,
        token: String,
        endpoint: Option<String>,
    ) -> Result<()> {
        match self.players.get(guild_id) {
            Some(player) => player.handle_voice_server(token, endpoint).await,
            None => Ok(()),
        }
    }

    pub async fn handle_channel_delete(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<()> {
        match self.players.get(guild_id) {
            Some(player) if player.channel_id() == Some(channel_id) => {
                self.players
                    .destroy(guild_id, DestroyReason::ChannelDeleted)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Feeds a raw gateway dispatch (`{"t": ..., "d": ...}`). Anything
    /// other than voice and channel-delete dispatches is ignored.
    pub async fn handle_gateway_packet(&self, packet: &Value) -> Result<()> {
        let Some(kind) = packet.get("t").and_then(Value::as_str) else {
            return Ok(());
        };
        let data = packet.get("d").cloned().unwrap_or(Value::Null);

        match kind {
            "VOICE_STATE_UPDATE" => {
                let Some(state) = parse::<VoiceStatePacket>(kind, data) else {
                    return Ok(());
                };
                let Some(guild_id) = state.guild_id else {
                    return Ok(());
                };
                self.handle_voice_state_update(
                    guild_id,
                    state.user_id,
                    state.session_id,
                    state.channel_id,
                )
                .await
            }
            "VOICE_SERVER_UPDATE" => {
                let Some(server) = parse::<VoiceServerPacket>(kind, data) else {
                    return Ok(());
                };
                self.handle_voice_server_update(server.guild_id, server.token, server.endpoint)
                    .await
            }
            "CHANNEL_DELETE" => {
                let Some(channel) = parse::<ChannelPacket>(kind, data) else {
                    return Ok(());
                };
                match channel.guild_id {
                    Some(guild_id) => self.handle_channel_delete(guild_id, channel.id).await,
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Removes a node and moves its players elsewhere.
    pub async fn destroy_node(&self, name: &str) -> Result<MigrationReport> {
        self.nodes.destroy(name, self.players.on_node(name)).await
    }

    pub fn shutdown(&self) {
        info!("👋 Shutting down client");
        self.cancel.cancel();
        self.nodes.shutdown();
    }
}

#[derive(Deserialize)]
struct VoiceStatePacket {
    guild_id: Option<GuildId>,
    user_id: UserId,
    session_id: String,
    channel_id: Option<ChannelId>,
}

#[derive(Deserialize)]
struct VoiceServerPacket {
    guild_id: GuildId,
    token: String,
    endpoint: Option<String>,
}

#[derive(Deserialize)]
struct ChannelPacket {
    id: ChannelId,
    guild_id: Option<GuildId>,
}

fn parse<T: for<'de> Deserialize<'de>>(kind: &str, data: Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Malformed {} dispatch: {}", kind, e);
            None
        }
    }
}

async fn dispatch(
    players: Arc<PlayerManager>,
    nodes: Arc<NodeManager>,
    mut signals: mpsc::UnboundedReceiver<NodeSignal>,
    migrate_on_disconnect: bool,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        match signal {
            NodeSignal::Failed { node } => {
                tokio::spawn(migrate_from(players.clone(), nodes.clone(), node));
            }
            NodeSignal::Disconnected { node } if migrate_on_disconnect => {
                tokio::spawn(migrate_from(players.clone(), nodes.clone(), node));
            }
            signal => route(&players, signal),
        }
    }
    debug!("Dispatcher stopped");
}

/// Hands player traffic to the owning player. Traffic from a node that no
/// longer owns the guild is stale and dropped.
fn route(players: &PlayerManager, signal: NodeSignal) {
    match signal {
        NodeSignal::Update { node, update } => match players.get(update.guild_id) {
            Some(player) if player.node().name() == node => player.update_transport(update.state),
            _ => trace!("Ignoring update for guild {} from {}", update.guild_id, node),
        },
        NodeSignal::Event { node, event } => match players.get(event.guild_id()) {
            Some(player) if player.node().name() == node => player.dispatch(event),
            _ => debug!("Ignoring event for guild {} from {}", event.guild_id(), node),
        },
        NodeSignal::Disconnected { node } => debug!("Node {} dropped, waiting for reconnect", node),
        NodeSignal::Failed { .. } => {}
    }
}

async fn migrate_from(players: Arc<PlayerManager>, nodes: Arc<NodeManager>, node: String) -> MigrationReport {
    let report = nodes.migrate(&node, None, players.on_node(&node)).await;
    if !report.moved.is_empty() || !report.failed.is_empty() {
        info!(
            "🚚 Migration from {}: {} moved, {} failed",
            node,
            report.moved.len(),
            report.failed.len()
        );
    }
    report
}
