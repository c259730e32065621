//! Voice credential bridge between the host's gateway and the node.

use serde::Serialize;
use serde_json::{json, Value};

use crate::id::{ChannelId, GuildId};
use crate::node::protocol::VoiceState;

/// Channel join/leave request for the host's gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceDirective {
    pub guild_id: GuildId,
    /// `None` leaves the current channel.
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceDirective {
    /// Gateway `VOICE_STATE_UPDATE` (op 4) payload.
    pub fn to_payload(&self) -> Value {
        json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": self.channel_id,
                "self_mute": self.self_mute,
                "self_deaf": self.self_deaf,
            }
        })
    }
}

/// Outbound side of the host's gateway connection.
#[cfg_attr(test, mockall::automock)]
pub trait VoiceGateway: Send + Sync {
    fn send(&self, directive: VoiceDirective);
}

/// What a credential fragment changed.
#[derive(Debug, Default, PartialEq)]
pub struct VoiceChange {
    /// Credentials to forward to the node.
    pub attach: Option<VoiceState>,
    /// Channel before and after a move.
    pub moved: Option<(Option<ChannelId>, Option<ChannelId>)>,
}

/// Per-guild holder of the two credential fragments. Hands out each
/// distinct (token, endpoint, session) triple exactly once.
#[derive(Debug, Default)]
pub struct VoiceBridge {
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
    channel_id: Option<ChannelId>,
    attached: Option<VoiceState>,
}

impl VoiceBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session fragment, from the bot's own voice state update.
    pub fn update_state(&mut self, session_id: String, channel_id: Option<ChannelId>) -> VoiceChange {
        let seen_before = self.session_id.is_some();
        self.session_id = Some(session_id);

        let moved = if seen_before && channel_id != self.channel_id {
            Some((self.channel_id, channel_id))
        } else {
            None
        };
        self.channel_id = channel_id;

        VoiceChange {
            attach: self.take_new_triple(),
            moved,
        }
    }

    /// Server fragment. A missing endpoint means the voice server is being
    /// reallocated; the token is kept until the endpoint shows up.
    pub fn update_server(&mut self, token: String, endpoint: Option<String>) -> VoiceChange {
        self.token = Some(token);
        self.endpoint = endpoint;

        VoiceChange {
            attach: self.take_new_triple(),
            moved: None,
        }
    }

    /// The complete credential set, if any. Replayed on node migration.
    pub fn credentials(&self) -> Option<VoiceState> {
        match (&self.token, &self.endpoint, &self.session_id) {
            (Some(token), Some(endpoint), Some(session_id)) => Some(VoiceState {
                token: token.clone(),
                endpoint: endpoint.clone(),
                session_id: session_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel_id
    }

    pub fn set_channel(&mut self, channel_id: Option<ChannelId>) {
        self.channel_id = channel_id;
    }

    /// Forgets what was sent, so the same credentials attach again (after
    /// a move to a fresh node session).
    pub fn reset_attached(&mut self) {
        self.attached = None;
    }

    fn take_new_triple(&mut self) -> Option<VoiceState> {
        let credentials = self.credentials()?;
        if self.attached.as_ref() == Some(&credentials) {
            return None;
        }
        self.attached = Some(credentials.clone());
        Some(credentials)
    }
}
