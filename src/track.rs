//! Canonical track representation shared by the queue, player and resolver.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Opaque requester attached by the host (a user id, a member object...).
pub type Requester = Value;

/// A playable track, as resolved by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Node payload used to command playback.
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plugin_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Requester>,
    /// Set on tracks picked by autoplay; those never enter the history.
    #[serde(default)]
    pub autoplay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    /// Milliseconds.
    pub duration: u64,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

impl Track {
    pub fn with_requester(mut self, requester: Option<Requester>) -> Self {
        self.requester = requester;
        self
    }

    pub fn into_autoplay(mut self) -> Self {
        self.autoplay = true;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.duration)
    }

    /// Identity used for de-duplication: the encoded payload, falling back
    /// to the URI when a node hands out an empty payload.
    pub fn identity(&self) -> Option<&str> {
        if !self.encoded.is_empty() {
            Some(&self.encoded)
        } else {
            self.info.uri.as_deref()
        }
    }
}

/// Placeholder that only knows what to search for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedTrack {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Requester>,
}

impl UnresolvedTrack {
    pub fn new(query: impl Into<String>, requester: Option<Requester>) -> Self {
        Self {
            query: query.into(),
            requester,
        }
    }
}

/// One queue slot. Resolution swaps `Pending` for `Ready` in place, so the
/// slot keeps its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum QueueEntry {
    Ready(Track),
    Pending(UnresolvedTrack),
}

impl QueueEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, QueueEntry::Pending(_))
    }

    pub fn track(&self) -> Option<&Track> {
        match self {
            QueueEntry::Ready(track) => Some(track),
            QueueEntry::Pending(_) => None,
        }
    }

    pub fn into_track(self) -> Option<Track> {
        match self {
            QueueEntry::Ready(track) => Some(track),
            QueueEntry::Pending(_) => None,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            QueueEntry::Ready(track) => &track.info.title,
            QueueEntry::Pending(pending) => &pending.query,
        }
    }

    pub fn author(&self) -> Option<&str> {
        self.track().map(|track| track.info.author.as_str())
    }

    pub fn identity(&self) -> Option<&str> {
        self.track().and_then(Track::identity)
    }

    /// Turns a pending slot into the given track. Returns `false` (and
    /// leaves the slot alone) when it was already resolved.
    pub fn fulfil(&mut self, track: Track) -> bool {
        match self {
            QueueEntry::Pending(pending) => {
                let requester = pending.requester.take();
                let requester = requester.or(track.requester.clone());
                *self = QueueEntry::Ready(track.with_requester(requester));
                true
            }
            QueueEntry::Ready(_) => false,
        }
    }
}

impl From<Track> for QueueEntry {
    fn from(track: Track) -> Self {
        QueueEntry::Ready(track)
    }
}

impl From<UnresolvedTrack> for QueueEntry {
    fn from(pending: UnresolvedTrack) -> Self {
        QueueEntry::Pending(pending)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::track;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_fulfil_swaps_in_place_and_keeps_requester() {
        let mut entry = QueueEntry::from(UnresolvedTrack::new("never gonna", Some(json!(7))));
        assert!(entry.is_pending());
        assert!(entry.fulfil(track("a")));
        assert_eq!(entry.track().unwrap().requester, Some(json!(7)));
        assert!(!entry.fulfil(track("b")));
        assert_eq!(entry.title(), "a");
    }

    #[test]
    fn test_identity_falls_back_to_uri() {
        let mut t = track("a");
        assert_eq!(t.identity(), Some("enc-a"));
        t.encoded.clear();
        assert_eq!(t.identity(), Some("https://example.com/a"));
        assert_eq!(
            QueueEntry::from(UnresolvedTrack::new("q", None)).identity(),
            None
        );
    }
}
