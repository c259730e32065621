//! Per-client typed event bus.
//!
//! Every component publishes through a cloned [`EventBus`]; the host
//! subscribes with [`EventBus::subscribe`]. Lagging subscribers lose the
//! oldest events, publishers never block.

use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

use crate::id::{ChannelId, GuildId};
use crate::node::protocol::{TrackEndReason, TrackException};
use crate::track::Track;

/// Why a player went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    ChannelDeleted,
    Disconnected,
    PlayerDestroyed,
    NodeDestroyed,
    LoadFailed,
}

impl DestroyReason {
    /// The guild's voice session is over, not just this player.
    pub fn ends_session(self) -> bool {
        matches!(self, DestroyReason::ChannelDeleted | DestroyReason::Disconnected)
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestroyReason::ChannelDeleted => "channel-deleted",
            DestroyReason::Disconnected => "disconnected",
            DestroyReason::PlayerDestroyed => "player-destroyed",
            DestroyReason::NodeDestroyed => "node-destroyed",
            DestroyReason::LoadFailed => "load-failed",
        })
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    NodeConnect {
        node: String,
    },
    NodeDisconnect {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    NodeError {
        node: String,
        error: String,
    },
    NodeReconnect {
        node: String,
        attempt: u32,
    },
    NodeReady {
        node: String,
        session_id: String,
        resumed: bool,
    },
    /// The reconnect ceiling was hit; the node's players are being migrated.
    NodeFailed {
        node: String,
    },
    PlayerCreate {
        guild_id: GuildId,
        node: String,
    },
    PlayerDestroy {
        guild_id: GuildId,
        reason: DestroyReason,
    },
    /// The bot was moved between voice channels.
    PlayerMove {
        guild_id: GuildId,
        old: Option<ChannelId>,
        new: Option<ChannelId>,
    },
    /// The player was migrated to another node.
    PlayerNodeMove {
        guild_id: GuildId,
        from: String,
        to: String,
    },
    PlayerDisconnect {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    TrackStart {
        guild_id: GuildId,
        track: Track,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackError {
        guild_id: GuildId,
        track: Option<Track>,
        exception: TrackException,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Option<Track>,
        threshold_ms: u64,
    },
    QueueEnd {
        guild_id: GuildId,
    },
    /// Every well-formed frame received from a node, before dispatch.
    Raw {
        node: String,
        payload: Value,
    },
}

impl ClientEvent {
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            ClientEvent::PlayerCreate { guild_id, .. }
            | ClientEvent::PlayerDestroy { guild_id, .. }
            | ClientEvent::PlayerMove { guild_id, .. }
            | ClientEvent::PlayerNodeMove { guild_id, .. }
            | ClientEvent::PlayerDisconnect { guild_id, .. }
            | ClientEvent::TrackStart { guild_id, .. }
            | ClientEvent::TrackEnd { guild_id, .. }
            | ClientEvent::TrackError { guild_id, .. }
            | ClientEvent::TrackStuck { guild_id, .. }
            | ClientEvent::QueueEnd { guild_id } => Some(*guild_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::trace!(?event, "client_event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(ClientEvent::NodeConnect { node: "a".into() });
        bus.emit(ClientEvent::QueueEnd {
            guild_id: GuildId(1),
        });

        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::NodeConnect { node } if node == "a"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.guild_id(), Some(GuildId(1)));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(0);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(ClientEvent::NodeFailed { node: "a".into() });
    }

    #[test]
    fn test_destroy_reason_tags() {
        assert_eq!(DestroyReason::ChannelDeleted.to_string(), "channel-deleted");
        assert_eq!(DestroyReason::LoadFailed.to_string(), "load-failed");
    }
}
