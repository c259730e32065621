//! Node registry: least-loaded selection and player migration.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::socket::{self, NodeSignal, ReconnectPolicy, SocketContext};
use super::{Node, NodeConfig};
use crate::audio::player::Player;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::id::{GuildId, UserId};

/// Outcome of moving a dead node's players.
#[derive(Debug, Default, PartialEq)]
pub struct MigrationReport {
    pub target: Option<String>,
    pub moved: Vec<GuildId>,
    pub failed: Vec<(GuildId, String)>,
}

pub struct NodeManager {
    nodes: DashMap<String, Arc<Node>>,
    client_name: String,
    policy: ReconnectPolicy,
    user_id: watch::Receiver<Option<UserId>>,
    events: EventBus,
    signals: mpsc::UnboundedSender<NodeSignal>,
}

impl NodeManager {
    pub fn new(
        client_name: String,
        policy: ReconnectPolicy,
        user_id: watch::Receiver<Option<UserId>>,
        events: EventBus,
        signals: mpsc::UnboundedSender<NodeSignal>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            client_name,
            policy,
            user_id,
            events,
            signals,
        }
    }

    /// Registers a node and starts its socket task.
    pub fn add(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let node = Arc::new(Node::connect(config)?);
        self.register(node.clone())?;

        socket::spawn(
            node.clone(),
            SocketContext {
                client_name: self.client_name.clone(),
                user_id: self.user_id.clone(),
                policy: self.policy,
                events: self.events.clone(),
                signals: self.signals.clone(),
            },
        );
        info!("🎛️ Added node {}", node.name());
        Ok(node)
    }

    /// Inserts a node without touching its connection.
    pub(crate) fn register(&self, node: Arc<Node>) -> Result<()> {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(Error::Config(format!("duplicate node name: {name}")));
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Point-in-time copy of the registry.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Ready node with the fewest players.
    pub fn best(&self) -> Option<Arc<Node>> {
        self.snapshot()
            .into_iter()
            .filter(|node| node.is_ready())
            .min_by_key(|node| node.player_count())
    }

    pub fn require_best(&self) -> Result<Arc<Node>> {
        self.best().ok_or(Error::NoAvailableNodes)
    }

    /// Moves every player owned by `dead` to `target` (default: the best
    /// ready node). Moves run independently: a failed guild stays on the
    /// dead node and does not hold back the others.
    pub async fn migrate(
        &self,
        dead: &str,
        target: Option<Arc<Node>>,
        players: Vec<Arc<Player>>,
    ) -> MigrationReport {
        let target = target.or_else(|| {
            self.snapshot()
                .into_iter()
                .filter(|node| node.is_ready() && node.name() != dead)
                .min_by_key(|node| node.player_count())
        });
        let Some(target) = target.filter(|node| node.name() != dead) else {
            warn!("No node to migrate {}'s players to", dead);
            return MigrationReport::default();
        };

        let owned: Vec<_> = players
            .into_iter()
            .filter(|player| player.node().name() == dead)
            .collect();
        if owned.is_empty() {
            return MigrationReport {
                target: Some(target.name().to_string()),
                ..Default::default()
            };
        }

        info!(
            "🚚 Migrating {} players from {} to {}",
            owned.len(),
            dead,
            target.name()
        );

        let moves = owned.iter().map(|player| {
            let target = target.clone();
            async move { (player.guild_id(), player.move_to_node(target).await) }
        });

        let mut report = MigrationReport {
            target: Some(target.name().to_string()),
            ..Default::default()
        };
        for (guild_id, outcome) in join_all(moves).await {
            match outcome {
                Ok(()) => report.moved.push(guild_id),
                Err(e) => {
                    warn!("Failed to migrate guild {}: {}", guild_id, e);
                    report.failed.push((guild_id, e.to_string()));
                }
            }
        }
        report
    }

    /// Removes a node, stops its socket task and migrates its players.
    pub async fn destroy(&self, name: &str, players: Vec<Arc<Player>>) -> Result<MigrationReport> {
        let (_, node) = self
            .nodes
            .remove(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        node.shutdown();
        info!("🗑️ Destroyed node {}", name);
        Ok(self.migrate(name, None, players).await)
    }

    /// Stops every socket task.
    pub fn shutdown(&self) {
        for node in self.snapshot() {
            node.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
