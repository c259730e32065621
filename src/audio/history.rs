//! Bounded play history, newest last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::id::GuildId;
use crate::storage::HistoryStore;
use crate::track::{Requester, Track};

/// Metadata snapshot of a played track. Autoplay builds its
/// recommendation query from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub title: String,
    pub author: String,
    pub uri: Option<String>,
    pub identifier: String,
    /// Milliseconds.
    pub duration: u64,
    pub source_name: String,
    pub played_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Requester>,
}

impl HistoryEntry {
    pub fn from_track(track: &Track) -> Self {
        Self {
            title: track.info.title.clone(),
            author: track.info.author.clone(),
            uri: track.info.uri.clone(),
            identifier: track.info.identifier.clone(),
            duration: track.info.duration,
            source_name: track.info.source_name.clone(),
            played_at: Utc::now(),
            requester: track.requester.clone(),
        }
    }

    /// Key used for de-duplication.
    fn key(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.identifier)
    }
}

/// Bounded, de-duplicated log of recently played tracks for one guild.
pub struct History {
    guild_id: GuildId,
    entries: VecDeque<HistoryEntry>,
    limit: usize,
    store: Arc<dyn HistoryStore>,
}

impl History {
    pub fn new(guild_id: GuildId, limit: usize, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            guild_id,
            entries: VecDeque::new(),
            limit: limit.max(1),
            store,
        }
    }

    pub async fn load(&mut self) -> Result<()> {
        let mut entries: VecDeque<_> = self.store.load_history(self.guild_id).await?.into();
        while entries.len() > self.limit {
            entries.pop_front();
        }
        self.entries = entries;
        Ok(())
    }

    /// Records a played track. Autoplay picks and repeats of a URI already
    /// in the log are skipped. Returns whether an entry was added.
    pub async fn push(&mut self, track: &Track) -> bool {
        if track.autoplay {
            return false;
        }

        let entry = HistoryEntry::from_track(track);
        if self.entries.iter().any(|e| e.key() == entry.key()) {
            debug!("History already has {}", entry.key());
            return false;
        }

        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }

        self.persist().await;
        true
    }

    /// The most recent `max` entries, oldest first.
    pub fn entries(&self, max: Option<usize>) -> Vec<HistoryEntry> {
        let max = max.unwrap_or(self.limit);
        let skip = self.entries.len().saturating_sub(max);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub async fn clear(&mut self) {
        self.entries.clear();
        if let Err(e) = self.store.clear_history(self.guild_id).await {
            warn!("Failed to clear history for guild {}: {}", self.guild_id, e);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    async fn persist(&self) {
        let entries: Vec<_> = self.entries.iter().cloned().collect();
        if let Err(e) = self.store.save_history(self.guild_id, &entries).await {
            warn!("Failed to persist history for guild {}: {}", self.guild_id, e);
        }
    }
}
