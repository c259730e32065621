//! Audio nodes: wire protocol, REST control plane, duplex stream and the
//! registry that picks between them.

pub mod manager;
pub mod protocol;
pub mod rest;
pub mod socket;

pub use manager::{MigrationReport, NodeManager};
pub use rest::{NodeApi, RestClient};
pub use socket::{NodeSignal, ReconnectPolicy};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::id::GuildId;
use protocol::{LoadResult, NodeInfo, NodeStats, PlayerPatch, RawTrack};

/// Static connection settings of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
}

fn default_port() -> u16 {
    2333
}

impl NodeConfig {
    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, self.host, self.port)
    }

    pub fn socket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

#[derive(Debug, Default)]
struct NodeState {
    connected: bool,
    session_id: Option<String>,
    stats: NodeStats,
    failed: bool,
}

/// One audio node. Connection state is written by its socket task and
/// read everywhere else through short lock sections.
pub struct Node {
    config: NodeConfig,
    rest: Arc<dyn NodeApi>,
    state: RwLock<NodeState>,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(config: NodeConfig, rest: Arc<dyn NodeApi>) -> Self {
        Self {
            config,
            rest,
            state: RwLock::new(NodeState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Node talking to `config` over HTTP.
    pub fn connect(config: NodeConfig) -> Result<Self> {
        let rest = RestClient::new(config.rest_url(), &config.password)?;
        Ok(Self::new(config, Arc::new(rest)))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stream open and a session id received.
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.connected && state.session_id.is_some() && !state.failed
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    pub fn is_failed(&self) -> bool {
        self.state.read().failed
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    /// Last stats frame received.
    pub fn last_stats(&self) -> NodeStats {
        self.state.read().stats.clone()
    }

    pub fn player_count(&self) -> u32 {
        self.state.read().stats.players
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        let mut state = self.state.write();
        state.connected = connected;
        if connected {
            state.failed = false;
        } else {
            state.session_id = None;
        }
    }

    pub(crate) fn set_session(&self, session_id: String) {
        info!("🟢 Node {} ready (session {})", self.config.name, session_id);
        self.state.write().session_id = Some(session_id);
    }

    pub(crate) fn set_stats(&self, stats: NodeStats) {
        debug!(
            "📊 Node {}: {} players, {} playing",
            self.config.name, stats.players, stats.playing_players
        );
        self.state.write().stats = stats;
    }

    pub(crate) fn mark_failed(&self) {
        let mut state = self.state.write();
        state.failed = true;
        state.connected = false;
        state.session_id = None;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the socket task, including any pending reconnect.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.set_connected(false);
    }

    fn require_session(&self) -> Result<String> {
        self.session_id().ok_or_else(|| Error::SessionUnavailable {
            node: self.config.name.clone(),
        })
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.rest.load_tracks(identifier).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<RawTrack> {
        self.rest.decode_track(encoded).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<RawTrack>> {
        self.rest.decode_tracks(encoded).await
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        self.rest.info().await
    }

    /// Fresh stats from the REST endpoint; also refreshes the cached copy.
    pub async fn stats(&self) -> Result<NodeStats> {
        let stats = self.rest.stats().await?;
        self.set_stats(stats.clone());
        Ok(stats)
    }

    /// Session-scoped player PATCH. Fails fast without a session.
    pub async fn update_player(
        &self,
        guild_id: GuildId,
        patch: &PlayerPatch,
        no_replace: bool,
    ) -> Result<()> {
        let session_id = self.require_session()?;
        self.rest
            .update_player(&session_id, guild_id, patch, no_replace)
            .await
    }

    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let session_id = self.require_session()?;
        self.rest.destroy_player(&session_id, guild_id).await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use rest::MockNodeApi;

    pub fn config(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
        }
    }

    /// A node that is connected, ready and reports `players`.
    pub fn ready_node(name: &str, players: u32, api: MockNodeApi) -> Arc<Node> {
        let node = Arc::new(Node::new(config(name), Arc::new(api)));
        node.set_connected(true);
        node.set_session(format!("session-{name}"));
        node.set_stats(NodeStats {
            players,
            ..Default::default()
        });
        node
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{config, ready_node};
    use super::*;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use rest::MockNodeApi;

    #[test]
    fn test_urls_follow_tls_flag() {
        let mut config = config("main");
        assert_eq!(config.rest_url(), "http://localhost:2333/v4");
        config.secure = true;
        assert_eq!(config.socket_url(), "wss://localhost:2333/v4/websocket");
    }

    #[tokio::test]
    async fn test_player_calls_fail_fast_without_session() {
        let node = Node::new(config("main"), Arc::new(MockNodeApi::new()));
        node.set_connected(true);
        assert!(!node.is_ready());

        let err = node
            .update_player(GuildId(1), &PlayerPatch::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionUnavailable { node } if node == "main"));
        assert!(node.destroy_player(GuildId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_player_calls_carry_session() {
        let mut api = MockNodeApi::new();
        api.expect_destroy_player()
            .with(eq("session-main"), eq(GuildId(7)))
            .times(1)
            .returning(|_, _| Ok(()));
        let node = ready_node("main", 0, api);
        node.destroy_player(GuildId(7)).await.unwrap();
    }

    #[test]
    fn test_disconnect_drops_session_and_readiness() {
        let node = ready_node("main", 3, MockNodeApi::new());
        assert!(node.is_ready());
        node.set_connected(false);
        assert!(!node.is_ready());
        assert_eq!(node.session_id(), None);
        assert_eq!(node.player_count(), 3);
    }
}
