//! Duplex stream to one node: connect, decode frames, reconnect.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{IncomingMessage, PlayerEvent, PlayerUpdate};
use super::{Node, NodeConfig};
use crate::error::Result;
use crate::events::{ClientEvent, EventBus};
use crate::id::UserId;

/// What a socket task reports to the client's dispatcher.
#[derive(Debug, Clone)]
pub enum NodeSignal {
    Update { node: String, update: PlayerUpdate },
    Event { node: String, event: PlayerEvent },
    /// The stream closed; a reconnect is scheduled.
    Disconnected { node: String },
    /// The reconnect ceiling was hit. The task has stopped.
    Failed { node: String },
}

/// Linear backoff: `attempt * step`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (1-based) attempt, or `None` once the
    /// ceiling is exceeded.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        Some((self.step * attempt).min(self.max_delay))
    }
}

pub struct SocketContext {
    pub client_name: String,
    pub user_id: watch::Receiver<Option<UserId>>,
    pub policy: ReconnectPolicy,
    pub events: EventBus,
    pub signals: mpsc::UnboundedSender<NodeSignal>,
}

enum SessionEnd {
    Closed { code: Option<u16>, reason: String },
    Cancelled,
}

pub fn spawn(node: Arc<Node>, ctx: SocketContext) -> JoinHandle<()> {
    tokio::spawn(run(node, ctx))
}

async fn run(node: Arc<Node>, mut ctx: SocketContext) {
    let cancel = node.cancel_token();
    let name = node.name().to_string();
    let mut attempt: u32 = 0;

    loop {
        let Some((user_id, waited)) = wait_for_identity(&mut ctx.user_id, &cancel).await else {
            break;
        };
        if waited {
            attempt = 0;
        }

        let outcome = session(&node, &ctx, user_id, &cancel, &mut attempt).await;
        node.set_connected(false);

        match outcome {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Closed { code, reason }) => {
                warn!("🔴 Node {} disconnected ({:?}): {}", name, code, reason);
                ctx.events.emit(ClientEvent::NodeDisconnect {
                    node: name.clone(),
                    code,
                    reason,
                });
                let _ = ctx.signals.send(NodeSignal::Disconnected { node: name.clone() });
            }
            Err(e) => {
                warn!("⚠️ Node {} connection error: {}", name, e);
                ctx.events.emit(ClientEvent::NodeError {
                    node: name.clone(),
                    error: e.to_string(),
                });
            }
        }

        attempt += 1;
        let Some(delay) = ctx.policy.delay(attempt) else {
            error!("❌ Node {} failed after {} attempts", name, attempt - 1);
            node.mark_failed();
            ctx.events.emit(ClientEvent::NodeFailed { node: name.clone() });
            let _ = ctx.signals.send(NodeSignal::Failed { node: name.clone() });
            break;
        };

        info!("🔄 Reconnecting to node {} in {:?} (attempt {})", name, delay, attempt);
        ctx.events.emit(ClientEvent::NodeReconnect {
            node: name.clone(),
            attempt,
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Socket task for node {} stopped", name);
}

/// Waits until the caller identity is known. The flag tells whether the
/// identity was missing at first.
async fn wait_for_identity(
    user_id: &mut watch::Receiver<Option<UserId>>,
    cancel: &CancellationToken,
) -> Option<(UserId, bool)> {
    let mut waited = false;
    loop {
        let current = *user_id.borrow_and_update();
        if let Some(id) = current {
            return Some((id, waited));
        }

        waited = true;
        debug!("Waiting for user id before connecting");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            changed = user_id.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

fn connect_request(config: &NodeConfig, client_name: &str, user_id: UserId) -> Result<Request> {
    let mut request = config.socket_url().into_client_request()?;
    let headers = request.headers_mut();
    let mut auth = HeaderValue::from_str(&config.password)?;
    auth.set_sensitive(true);
    headers.insert("Authorization", auth);
    headers.insert("User-Id", HeaderValue::from_str(&user_id.to_string())?);
    headers.insert("Client-Name", HeaderValue::from_str(client_name)?);
    Ok(request)
}

async fn session(
    node: &Node,
    ctx: &SocketContext,
    user_id: UserId,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> Result<SessionEnd> {
    let request = connect_request(node.config(), &ctx.client_name, user_id)?;
    debug!("Connecting to {}", node.config().socket_url());

    let (stream, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        connected = tokio_tungstenite::connect_async(request) => connected?,
    };
    let (mut write, mut read) = stream.split();

    node.set_connected(true);
    *attempt = 0;
    info!("🔌 Connected to node {}", node.name());
    ctx.events.emit(ClientEvent::NodeConnect {
        node: node.name().to_string(),
    });

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Cancelled);
            }
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(node, ctx, text.as_str()),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                    None => (None, String::new()),
                };
                return Ok(SessionEnd::Closed { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Ok(SessionEnd::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
            }
        }
    }
}

/// Decodes one text frame. Ready and stats are applied to the node,
/// player frames are forwarded, malformed frames are dropped.
pub(crate) fn handle_frame(node: &Node, ctx: &SocketContext, text: &str) {
    let payload: Value = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Discarding malformed frame from node {}: {}", node.name(), e);
            return;
        }
    };

    ctx.events.emit(ClientEvent::Raw {
        node: node.name().to_string(),
        payload: payload.clone(),
    });

    let message: IncomingMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Discarding unknown frame from node {}: {}", node.name(), e);
            return;
        }
    };

    let name = node.name().to_string();
    match message {
        IncomingMessage::Ready(ready) => {
            node.set_session(ready.session_id.clone());
            ctx.events.emit(ClientEvent::NodeReady {
                node: name,
                session_id: ready.session_id,
                resumed: ready.resumed,
            });
        }
        IncomingMessage::Stats(stats) => node.set_stats(stats),
        IncomingMessage::PlayerUpdate(update) => {
            let _ = ctx.signals.send(NodeSignal::Update { node: name, update });
        }
        IncomingMessage::Event(event) => {
            debug!("Node {} event for guild {}", name, event.guild_id());
            let _ = ctx.signals.send(NodeSignal::Event { node: name, event });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::GuildId;
    use crate::node::rest::MockNodeApi;
    use crate::node::testing::config;
    use pretty_assertions::assert_eq;

    fn context() -> (SocketContext, mpsc::UnboundedReceiver<NodeSignal>, EventBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, user_id) = watch::channel(Some(UserId(1)));
        let events = EventBus::new(16);
        let ctx = SocketContext {
            client_name: "lavx".into(),
            user_id,
            policy: ReconnectPolicy::default(),
            events: events.clone(),
            signals: tx,
        };
        (ctx, rx, events)
    }

    #[test]
    fn test_backoff_is_linear_then_capped_then_gives_up() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=10)
            .map(|n| policy.delay(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 15, 20, 25, 30, 30, 30, 30, 30]);
        assert_eq!(policy.delay(11), None);

        let forever = ReconnectPolicy {
            max_attempts: None,
            ..policy
        };
        assert_eq!(forever.delay(500), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_ready_frame_marks_node_ready() {
        let node = Node::new(config("main"), Arc::new(MockNodeApi::new()));
        node.set_connected(true);
        let (ctx, _rx, events) = context();
        let mut sub = events.subscribe();

        handle_frame(&node, &ctx, r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#);

        assert!(node.is_ready());
        assert_eq!(node.session_id().as_deref(), Some("abc"));
        assert!(matches!(sub.try_recv().unwrap(), ClientEvent::Raw { .. }));
        assert!(
            matches!(sub.try_recv().unwrap(), ClientEvent::NodeReady { session_id, .. } if session_id == "abc")
        );
    }

    #[test]
    fn test_stats_frame_updates_load() {
        let node = Node::new(config("main"), Arc::new(MockNodeApi::new()));
        let (ctx, _rx, _) = context();
        handle_frame(
            &node,
            &ctx,
            r#"{"op":"stats","players":4,"playingPlayers":2,"uptime":1000,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":2,"systemLoad":0.5,"lavalinkLoad":0.1}}"#,
        );
        assert_eq!(node.player_count(), 4);
    }

    #[test]
    fn test_player_frames_are_forwarded() {
        let node = Node::new(config("main"), Arc::new(MockNodeApi::new()));
        let (ctx, mut rx, _) = context();
        handle_frame(
            &node,
            &ctx,
            r#"{"op":"playerUpdate","guildId":"42","state":{"time":1,"position":500,"connected":true,"ping":20}}"#,
        );
        handle_frame(
            &node,
            &ctx,
            r#"{"op":"event","type":"WebSocketClosedEvent","guildId":"42","code":4006,"reason":"gone","byRemote":true}"#,
        );

        match rx.try_recv().unwrap() {
            NodeSignal::Update { update, .. } => {
                assert_eq!(update.guild_id, GuildId(42));
                assert_eq!(update.state.position, 500);
            }
            other => panic!("unexpected signal {other:?}"),
        }
        match rx.try_recv().unwrap() {
            NodeSignal::Event { event, .. } => assert_eq!(event.guild_id(), GuildId(42)),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let node = Node::new(config("main"), Arc::new(MockNodeApi::new()));
        let (ctx, mut rx, _) = context();
        handle_frame(&node, &ctx, "{not json");
        handle_frame(&node, &ctx, r#"{"op":"mystery"}"#);
        handle_frame(&node, &ctx, r#"{"op":"playerUpdate","guildId":"x"}"#);
        assert!(rx.try_recv().is_err());
        assert!(!node.is_ready());
    }

    #[test]
    fn test_connect_request_carries_identity_headers() {
        let request = connect_request(&config("main"), "lavx/1.0", UserId(99)).unwrap();
        let headers = request.headers();
        assert_eq!(headers["User-Id"], "99");
        assert_eq!(headers["Client-Name"], "lavx/1.0");
        assert_eq!(headers["Authorization"], "youshallnotpass");
        assert_eq!(request.uri().path(), "/v4/websocket");
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_after_reconnect_ceiling() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let node = Arc::new(Node::new(
            NodeConfig {
                host: "127.0.0.1".into(),
                port,
                ..config("dead")
            },
            Arc::new(MockNodeApi::new()),
        ));

        let (mut ctx, mut rx, events) = context();
        ctx.policy = ReconnectPolicy {
            step: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(2),
        };
        let mut sub = events.subscribe();

        let task = spawn(node.clone(), ctx);
        let signal = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        assert!(matches!(signal, Some(NodeSignal::Failed { node }) if node == "dead"));
        task.await.unwrap();

        let seen: Vec<&str> = std::iter::from_fn(|| sub.try_recv().ok())
            .map(|event| match event {
                ClientEvent::NodeError { .. } => "error",
                ClientEvent::NodeReconnect { .. } => "reconnect",
                ClientEvent::NodeFailed { .. } => "failed",
                _ => "other",
            })
            .collect();
        assert_eq!(
            seen,
            vec!["error", "reconnect", "error", "reconnect", "error", "failed"]
        );
        assert!(!node.is_ready());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_wait_is_cancellable() {
        let (tx, mut rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { wait_for_identity(&mut rx, &cancel).await })
        };
        tokio::task::yield_now().await;
        tx.send(Some(UserId(5))).unwrap();
        assert_eq!(waiter.await.unwrap(), Some((UserId(5), true)));

        let (_tx, mut rx) = watch::channel(None::<UserId>);
        cancel.cancel();
        assert_eq!(wait_for_identity(&mut rx, &cancel).await, None);
    }
}
