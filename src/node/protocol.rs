//! Wire types of the node's duplex stream and REST control plane.
//!
//! Frames are decoded once at the socket boundary into [`IncomingMessage`]
//! and matched exhaustively from there on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::filters::Filters;
use crate::id::GuildId;

/// Frames pushed by the node over the duplex stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready(Ready),
    Stats(NodeStats),
    PlayerUpdate(PlayerUpdate),
    Event(PlayerEvent),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: GuildId,
    pub state: PlayerState,
}

/// Transport state reported by the node for one player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            time: 0,
            position: 0,
            connected: false,
            ping: -1,
        }
    }
}

/// Player lifecycle events, routed by guild.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { guild_id: GuildId, track: RawTrack },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        guild_id: GuildId,
        track: RawTrack,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        guild_id: GuildId,
        track: RawTrack,
        exception: TrackException,
    },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        guild_id: GuildId,
        track: RawTrack,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        #[serde(default)]
        reason: String,
        by_remote: bool,
    },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlayerEvent::TrackStart { guild_id, .. }
            | PlayerEvent::TrackEnd { guild_id, .. }
            | PlayerEvent::TrackException { guild_id, .. }
            | PlayerEvent::TrackStuck { guild_id, .. }
            | PlayerEvent::WebSocketClosed { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Caller-initiated ends never advance the queue.
    pub fn advances_queue(self) -> bool {
        !matches!(self, TrackEndReason::Stopped | TrackEndReason::Replaced)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

/// Track exactly as the node encodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrack {
    pub encoded: String,
    pub info: RawTrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: Option<u64>,
    /// Some plugins report `duration` instead of `length`.
    pub duration: Option<u64>,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    /// Non-standard artwork field used by a few source plugins.
    pub image: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

/// `GET /loadtracks` body before its `data` is interpreted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadEnvelope {
    load_type: LoadType,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylist {
    pub info: RawPlaylistInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub tracks: Vec<RawTrack>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPlaylistInfo {
    pub name: String,
    pub selected_track: i64,
    pub artwork_url: Option<String>,
}

/// Node-native search result.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(RawTrack),
    Playlist(RawPlaylist),
    Search(Vec<RawTrack>),
    Empty,
    Error(TrackException),
}

impl LoadResult {
    pub fn load_type(&self) -> LoadType {
        match self {
            LoadResult::Track(_) => LoadType::Track,
            LoadResult::Playlist(_) => LoadType::Playlist,
            LoadResult::Search(_) => LoadType::Search,
            LoadResult::Empty => LoadType::Empty,
            LoadResult::Error(_) => LoadType::Error,
        }
    }

    pub fn is_unusable(&self) -> bool {
        match self {
            LoadResult::Empty | LoadResult::Error(_) => true,
            LoadResult::Search(tracks) => tracks.is_empty(),
            LoadResult::Playlist(playlist) => playlist.tracks.is_empty(),
            LoadResult::Track(_) => false,
        }
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        let envelope: LoadEnvelope = serde_json::from_value(value)?;
        Ok(match envelope.load_type {
            LoadType::Track => LoadResult::Track(serde_json::from_value(envelope.data)?),
            LoadType::Playlist => LoadResult::Playlist(serde_json::from_value(envelope.data)?),
            LoadType::Search => LoadResult::Search(serde_json::from_value(envelope.data)?),
            LoadType::Empty => LoadResult::Empty,
            LoadType::Error => LoadResult::Error(serde_json::from_value(envelope.data)?),
        })
    }
}

/// Voice credentials forwarded to the node once all three are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Value of `encodedTrack` in a player PATCH: absent, explicit `null`
/// (stop), or a track payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EncodedTrack {
    #[default]
    Keep,
    Stop,
    Play(String),
}

impl EncodedTrack {
    fn is_keep(&self) -> bool {
        matches!(self, EncodedTrack::Keep)
    }
}

impl Serialize for EncodedTrack {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EncodedTrack::Keep | EncodedTrack::Stop => serializer.serialize_none(),
            EncodedTrack::Play(encoded) => serializer.serialize_str(encoded),
        }
    }
}

/// Body of the session-scoped `PATCH /sessions/{id}/players/{guild}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    #[serde(skip_serializing_if = "EncodedTrack::is_keep")]
    pub encoded_track: EncodedTrack,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl PlayerPatch {
    pub fn is_empty(&self) -> bool {
        *self == PlayerPatch::default()
    }
}

/// Subset of `GET /info` the client cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: NodeVersion,
    pub build_time: u64,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<NodePlugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePlugin {
    pub name: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn track_json() -> Value {
        json!({
            "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "RickAstleyVEVO",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": "Never Gonna Give You Up",
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "sourceName": "youtube"
            },
            "pluginInfo": {},
            "userData": {}
        })
    }

    #[test]
    fn test_decode_ready_and_stats() {
        let ready: IncomingMessage =
            serde_json::from_value(json!({"op": "ready", "resumed": false, "sessionId": "abc"}))
                .unwrap();
        assert!(matches!(ready, IncomingMessage::Ready(Ready { ref session_id, .. }) if session_id == "abc"));

        let stats: IncomingMessage = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 1,
            "uptime": 1000,
            "memory": {"free": 1, "used": 2, "allocated": 3, "reservable": 4},
            "cpu": {"cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.1}
        }))
        .unwrap();
        match stats {
            IncomingMessage::Stats(stats) => {
                assert_eq!(stats.players, 3);
                assert_eq!(stats.cpu.cores, 4);
                assert_eq!(stats.frame_stats, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_track_end_event() {
        let message: IncomingMessage = serde_json::from_value(json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "42",
            "track": track_json(),
            "reason": "loadFailed"
        }))
        .unwrap();

        match message {
            IncomingMessage::Event(PlayerEvent::TrackEnd {
                guild_id, reason, track,
            }) => {
                assert_eq!(guild_id, GuildId(42));
                assert_eq!(reason, TrackEndReason::LoadFailed);
                assert_eq!(track.info.length, Some(212000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_websocket_closed_event() {
        let message: IncomingMessage = serde_json::from_value(json!({
            "op": "event",
            "type": "WebSocketClosedEvent",
            "guildId": "7",
            "code": 4006,
            "reason": "Your session is no longer valid.",
            "byRemote": true
        }))
        .unwrap();
        let IncomingMessage::Event(event) = message else {
            panic!("expected event");
        };
        assert_eq!(event.guild_id(), GuildId(7));
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(serde_json::from_value::<IncomingMessage>(json!({"op": "nope"})).is_err());
    }

    #[test]
    fn test_end_reasons_that_advance() {
        assert!(TrackEndReason::Finished.advances_queue());
        assert!(TrackEndReason::LoadFailed.advances_queue());
        assert!(TrackEndReason::Cleanup.advances_queue());
        assert!(!TrackEndReason::Stopped.advances_queue());
        assert!(!TrackEndReason::Replaced.advances_queue());
    }

    #[test]
    fn test_load_result_shapes() {
        let empty = LoadResult::from_value(json!({"loadType": "empty", "data": {}})).unwrap();
        assert_eq!(empty, LoadResult::Empty);

        let search =
            LoadResult::from_value(json!({"loadType": "search", "data": [track_json()]})).unwrap();
        assert_eq!(search.load_type(), LoadType::Search);
        assert!(!search.is_unusable());

        let error = LoadResult::from_value(json!({
            "loadType": "error",
            "data": {"message": "boom", "severity": "common", "cause": "x"}
        }))
        .unwrap();
        assert!(error.is_unusable());

        let playlist = LoadResult::from_value(json!({
            "loadType": "playlist",
            "data": {
                "info": {"name": "Mix", "selectedTrack": -1},
                "pluginInfo": {"artworkUrl": "https://img"},
                "tracks": [track_json()]
            }
        }))
        .unwrap();
        match playlist {
            LoadResult::Playlist(playlist) => {
                assert_eq!(playlist.info.name, "Mix");
                assert_eq!(playlist.tracks.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_patch_serialization_stop_vs_keep() {
        let keep = PlayerPatch {
            paused: Some(true),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&keep).unwrap(), json!({"paused": true}));

        let stop = PlayerPatch {
            encoded_track: EncodedTrack::Stop,
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            json!({"encodedTrack": null})
        );

        let play = PlayerPatch {
            encoded_track: EncodedTrack::Play("abc".into()),
            position: Some(1500),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&play).unwrap(),
            json!({"encodedTrack": "abc", "position": 1500})
        );
        assert!(PlayerPatch::default().is_empty());
    }
}
