//! Per-guild queue with loop modes, lazily resolved entries and paging.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::history::History;
use crate::error::{Error, Result};
use crate::id::GuildId;
use crate::storage::{HistoryStore, QueueSnapshot, QueueStore};
use crate::track::{QueueEntry, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    #[serde(rename = "none")]
    Off,
    Track,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "none",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        })
    }
}

impl FromStr for LoopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::Off),
            "track" | "song" => Ok(LoopMode::Track),
            "queue" | "all" => Ok(LoopMode::Queue),
            other => Err(Error::Config(format!("unknown loop mode: {other}"))),
        }
    }
}

/// Per-guild queue: the current track, the pending entries, loop mode,
/// autoplay flag and play history.
///
/// `current` only ever holds a resolved track. An unresolved entry stays at
/// the head of `tracks` until the player resolves it.
pub struct Queue {
    guild_id: GuildId,
    current: Option<Track>,
    tracks: VecDeque<QueueEntry>,
    loop_mode: LoopMode,
    autoplay: bool,
    history: History,
    store: Arc<dyn QueueStore>,
}

impl Queue {
    pub fn new(
        guild_id: GuildId,
        history_limit: usize,
        store: Arc<dyn QueueStore>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            guild_id,
            current: None,
            tracks: VecDeque::new(),
            loop_mode: LoopMode::Off,
            autoplay: false,
            history: History::new(guild_id, history_limit, history_store),
            store,
        }
    }

    /// Restores the persisted queue and history, if any.
    pub async fn load(&mut self) -> Result<()> {
        if let Some(snapshot) = self.store.load_queue(self.guild_id).await? {
            self.current = snapshot.current;
            self.tracks = snapshot.tracks.into();
            info!(
                "📂 Restored queue for guild {} ({} pending)",
                self.guild_id,
                self.tracks.len()
            );
        }
        self.history.load().await
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn head(&self) -> Option<&QueueEntry> {
        self.tracks.front()
    }

    pub fn entries(&self) -> &VecDeque<QueueEntry> {
        &self.tracks
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    /// Pending entries, not counting the current track.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.current.is_none()
    }

    /// Appends an entry and promotes it to current when nothing is playing.
    pub async fn add(&mut self, entry: impl Into<QueueEntry>) {
        let entry = entry.into();
        info!("➕ Queued: {}", entry.title());
        self.tracks.push_back(entry);
        self.promote();
        self.persist().await;
    }

    pub async fn add_many(&mut self, entries: Vec<QueueEntry>) {
        let count = entries.len();
        self.tracks.extend(entries);
        self.promote();
        info!("➕ Queued {} tracks", count);
        self.persist().await;
    }

    /// Places an entry at the head so it plays next.
    pub async fn add_next(&mut self, entry: impl Into<QueueEntry>) {
        let entry = entry.into();
        info!("⏭️ Queued next: {}", entry.title());
        self.tracks.push_front(entry);
        self.promote();
        self.persist().await;
    }

    /// Inserts at `index`, clamped to the end of the queue.
    pub async fn insert(&mut self, index: usize, entry: impl Into<QueueEntry>) {
        let index = index.min(self.tracks.len());
        self.tracks.insert(index, entry.into());
        debug!("📍 Inserted at position {}", index);
        self.promote();
        self.persist().await;
    }

    /// Advances to the next entry. Returns whether there is something to
    /// play: a current track, or an unresolved head.
    pub async fn next(&mut self) -> bool {
        if let Some(current) = self.current.take() {
            if self.loop_mode == LoopMode::Track {
                debug!("🔂 Repeating {}", current.info.title);
                self.current = Some(current);
                return true;
            }

            self.history.push(&current).await;
            if self.loop_mode == LoopMode::Queue {
                debug!("🔁 Requeued {}", current.info.title);
                self.tracks.push_back(QueueEntry::Ready(current));
            }
        }

        self.promote();
        self.persist().await;

        match (&self.current, self.tracks.front()) {
            (Some(track), _) => {
                info!("➡️ Next up: {}", track.info.title);
                true
            }
            (None, Some(entry)) if entry.is_pending() => true,
            _ => {
                info!("📭 Queue finished for guild {}", self.guild_id);
                false
            }
        }
    }

    pub async fn skip(&mut self) -> bool {
        self.next().await
    }

    /// Drops every entry before `index` and makes the entry at `index`
    /// current. Out-of-range indices are ignored.
    pub async fn jump(&mut self, index: usize) -> bool {
        if index >= self.tracks.len() {
            return false;
        }

        if let Some(current) = self.current.take() {
            self.history.push(&current).await;
        }
        self.tracks.drain(..index);
        self.promote();
        self.persist().await;

        self.current.is_some() || self.tracks.front().is_some_and(QueueEntry::is_pending)
    }

    /// Moves an entry. `to` is clamped; an out-of-range `from` is a no-op.
    pub async fn move_entry(&mut self, from: usize, to: usize) {
        if from >= self.tracks.len() {
            return;
        }
        let to = to.min(self.tracks.len() - 1);
        if from != to {
            if let Some(entry) = self.tracks.remove(from) {
                self.tracks.insert(to, entry);
                debug!("📍 Moved track from position {} to {}", from, to);
            }
        }
        self.promote();
        self.persist().await;
    }

    pub async fn swap(&mut self, a: usize, b: usize) {
        if a >= self.tracks.len() || b >= self.tracks.len() {
            return;
        }
        self.tracks.swap(a, b);
        self.promote();
        self.persist().await;
    }

    pub async fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        let removed = self.tracks.remove(index)?;
        debug!("❌ Removed {} at position {}", removed.title(), index);
        self.promote();
        self.persist().await;
        Some(removed)
    }

    /// Drops repeated tracks from the pending list, keeping the first of
    /// each. Unresolved entries have no identity and always stay.
    pub async fn dedupe(&mut self) -> usize {
        let before = self.tracks.len();
        let mut seen = HashSet::new();
        self.tracks.retain(|entry| match entry.identity() {
            Some(identity) => seen.insert(identity.to_string()),
            None => true,
        });

        let removed = before - self.tracks.len();
        if removed > 0 {
            info!("🗑️ Removed {} duplicates", removed);
            self.promote();
            self.persist().await;
        }
        removed
    }

    pub async fn shuffle(&mut self) {
        self.tracks
            .make_contiguous()
            .shuffle(&mut rand::thread_rng());
        self.promote();
        info!("🔀 Queue shuffled");
        self.persist().await;
    }

    /// Empties the pending list, the current slot and the history.
    pub async fn clear(&mut self) {
        self.tracks.clear();
        self.current = None;
        self.history.clear().await;
        info!("🗑️ Queue cleared");
        self.persist().await;
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Loop disabled"),
            LoopMode::Track => info!("🔂 Looping current track"),
            LoopMode::Queue => info!("🔁 Looping queue"),
        }
    }

    pub fn set_autoplay(&mut self, enabled: bool) {
        self.autoplay = enabled;
    }

    /// Pending entries whose title or author contains `query`.
    pub fn find(&self, query: &str) -> Vec<(usize, &QueueEntry)> {
        let query = query.to_lowercase();
        self.tracks
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.title().to_lowercase().contains(&query)
                    || entry
                        .author()
                        .is_some_and(|author| author.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub fn total_duration(&self) -> Duration {
        self.current
            .iter()
            .chain(self.tracks.iter().filter_map(QueueEntry::track))
            .filter(|track| !track.info.is_stream)
            .map(Track::duration)
            .sum()
    }

    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let current_page = page.max(1);
        let total_items = self.tracks.len();
        let total_pages = total_items.div_ceil(per_page).max(1);
        let start = (current_page - 1) * per_page;

        QueuePage {
            items: self
                .tracks
                .iter()
                .skip(start)
                .take(per_page)
                .cloned()
                .collect(),
            current_page,
            total_pages,
            total_items,
        }
    }

    /// Resolves the unresolved head in place. Ignored if the head changed
    /// (or was already resolved) while the query was out.
    pub async fn fulfil_head(&mut self, query: &str, track: Track) -> bool {
        let fulfilled = match self.tracks.front_mut() {
            Some(entry) if entry.is_pending() && entry.title() == query => entry.fulfil(track),
            _ => false,
        };
        if fulfilled {
            self.promote();
            self.persist().await;
        }
        fulfilled
    }

    /// Drops an unresolved head that failed to resolve.
    pub async fn drop_head(&mut self, query: &str) -> Option<QueueEntry> {
        match self.tracks.front() {
            Some(QueueEntry::Pending(pending)) if pending.query == query => {
                let dropped = self.tracks.pop_front();
                warn!("Dropped unresolvable entry: {}", query);
                self.persist().await;
                dropped
            }
            _ => None,
        }
    }

    /// Current plus pending, as written to the store.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            tracks: self.tracks.iter().cloned().collect(),
        }
    }

    /// Moves a resolved head into the empty current slot.
    fn promote(&mut self) {
        if self.current.is_none() && self.tracks.front().is_some_and(|e| !e.is_pending()) {
            self.current = self.tracks.pop_front().and_then(QueueEntry::into_track);
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save_queue(self.guild_id, &self.snapshot()).await {
            warn!("Failed to persist queue for guild {}: {}", self.guild_id, e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<QueueEntry>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::track::fixtures::track;
    use crate::track::UnresolvedTrack;
    use pretty_assertions::assert_eq;

    fn queue() -> (Queue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Queue::new(GuildId(1), 30, store.clone(), store.clone()), store)
    }

    fn current(queue: &Queue) -> Option<String> {
        queue.current().map(|t| t.info.title.clone())
    }

    fn pending(queue: &Queue) -> Vec<String> {
        queue.entries().iter().map(|e| e.title().to_string()).collect()
    }

    fn history(queue: &Queue) -> Vec<String> {
        queue
            .history()
            .entries(None)
            .into_iter()
            .map(|e| e.title)
            .collect()
    }

    async fn filled(names: &[&str]) -> Queue {
        let (mut queue, _) = queue();
        for name in names {
            queue.add(track(name)).await;
        }
        queue
    }

    #[tokio::test]
    async fn test_add_promotes_resolved_head() {
        let queue = filled(&["a", "b", "c"]).await;
        assert_eq!(current(&queue), Some("a".into()));
        assert_eq!(pending(&queue), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_add_leaves_unresolved_head_pending() {
        let (mut queue, _) = queue();
        queue.add(UnresolvedTrack::new("some query", None)).await;
        assert_eq!(current(&queue), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.head().unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_next_walks_queue_and_records_history() {
        let mut queue = filled(&["a", "b", "c"]).await;

        assert!(queue.next().await);
        assert_eq!(current(&queue), Some("b".into()));
        assert!(queue.next().await);
        assert_eq!(current(&queue), Some("c".into()));
        assert_eq!(history(&queue), vec!["a", "b"]);

        assert!(!queue.next().await);
        assert_eq!(current(&queue), None);
        assert_eq!(history(&queue), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_loop_track_keeps_current() {
        let mut queue = filled(&["a", "b"]).await;
        queue.set_loop(LoopMode::Track);
        for _ in 0..5 {
            assert!(queue.next().await);
            assert_eq!(current(&queue), Some("a".into()));
        }
        assert_eq!(pending(&queue), vec!["b"]);
        assert!(queue.history().is_empty());
    }

    #[tokio::test]
    async fn test_loop_queue_full_cycle_restores_order() {
        let mut queue = filled(&["a", "b", "c", "d"]).await;
        queue.set_loop(LoopMode::Queue);
        let before = pending(&queue);

        for _ in 0..4 {
            assert!(queue.next().await);
        }

        assert_eq!(current(&queue), Some("a".into()));
        assert_eq!(pending(&queue), before);
    }

    #[tokio::test]
    async fn test_next_stops_at_unresolved_head() {
        let mut queue = filled(&["a"]).await;
        queue.add(UnresolvedTrack::new("later", None)).await;

        assert!(queue.next().await);
        assert_eq!(current(&queue), None);
        assert_eq!(pending(&queue), vec!["later"]);
    }

    #[tokio::test]
    async fn test_fulfil_head_resolves_in_place_then_promotes() {
        let (mut queue, _) = queue();
        queue.add(UnresolvedTrack::new("q", None)).await;
        queue.add(track("b")).await;

        assert!(!queue.fulfil_head("other", track("x")).await);
        assert!(queue.fulfil_head("q", track("a")).await);
        assert_eq!(current(&queue), Some("a".into()));
        assert_eq!(pending(&queue), vec!["b"]);
    }

    #[tokio::test]
    async fn test_drop_head_only_drops_matching_pending() {
        let (mut queue, _) = queue();
        queue.add(UnresolvedTrack::new("q", None)).await;
        assert!(queue.drop_head("nope").await.is_none());
        assert!(queue.drop_head("q").await.is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_jump_discards_up_to_index() {
        let mut queue = filled(&["a", "b", "c", "d"]).await;
        assert!(queue.jump(1).await);
        assert_eq!(current(&queue), Some("c".into()));
        assert_eq!(pending(&queue), vec!["d"]);
        assert_eq!(history(&queue), vec!["a"]);

        assert!(!queue.jump(7).await);
        assert_eq!(current(&queue), Some("c".into()));
    }

    #[tokio::test]
    async fn test_move_clamps_and_ignores_out_of_range() {
        let mut queue = filled(&["x", "a", "b", "c"]).await;
        queue.move_entry(0, 99).await;
        assert_eq!(pending(&queue), vec!["b", "c", "a"]);
        queue.move_entry(5, 0).await;
        assert_eq!(pending(&queue), vec!["b", "c", "a"]);

        queue.swap(0, 2).await;
        assert_eq!(pending(&queue), vec!["a", "c", "b"]);
        queue.swap(0, 9).await;
        assert_eq!(pending(&queue), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_pending_length_tracks_adds_and_removals() {
        let (mut queue, _) = queue();
        let mut adds = 0;
        let mut removals = 0;
        for name in ["a", "b", "c", "d", "e", "f"] {
            queue.add(track(name)).await;
            adds += 1;
        }
        // "a" was promoted to current.
        let promotions = 1;

        assert!(queue.remove(2).await.is_some());
        removals += 1;
        assert!(queue.remove(40).await.is_none());
        queue.move_entry(0, 3).await;
        queue.swap(1, 2).await;
        assert!(queue.next().await);
        let promotions = promotions + 1;

        assert_eq!(queue.len(), adds - removals - promotions);
    }

    #[tokio::test]
    async fn test_mutations_promote_resolved_head_when_idle() {
        let (mut next, _) = queue();
        next.add_next(track("a")).await;
        assert_eq!(current(&next), Some("a".into()));

        let (mut inserted, _) = queue();
        inserted.insert(0, track("a")).await;
        assert_eq!(current(&inserted), Some("a".into()));

        let (mut removed, _) = queue();
        removed.add(UnresolvedTrack::new("q", None)).await;
        removed.add(track("b")).await;
        assert_eq!(current(&removed), None);
        assert!(removed.remove(0).await.is_some());
        assert_eq!(current(&removed), Some("b".into()));
        assert!(removed.entries().is_empty());

        for reorder in 0..2 {
            let (mut reordered, _) = queue();
            reordered.add(UnresolvedTrack::new("q", None)).await;
            reordered.add(track("b")).await;
            match reorder {
                0 => reordered.move_entry(1, 0).await,
                _ => reordered.swap(0, 1).await,
            }
            assert_eq!(current(&reordered), Some("b".into()));
            assert_eq!(pending(&reordered), vec!["q"]);
        }
    }

    #[tokio::test]
    async fn test_dedupe_keeps_first_occurrence() {
        let mut queue = filled(&["now", "a", "b", "a", "c", "b"]).await;
        queue.add(UnresolvedTrack::new("q", None)).await;
        queue.add(UnresolvedTrack::new("q", None)).await;

        assert_eq!(queue.dedupe().await, 2);
        assert_eq!(pending(&queue), vec!["a", "b", "c", "q", "q"]);
        assert_eq!(current(&queue), Some("now".into()));
    }

    #[tokio::test]
    async fn test_shuffle_is_a_permutation() {
        let names: Vec<String> = (0..50).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut queue = filled(&refs).await;

        let mut before = pending(&queue);
        queue.shuffle().await;
        let mut after = pending(&queue);

        before.sort();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(current(&queue), Some("t0".into()));
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let mut queue = filled(&["a", "b", "c"]).await;
        queue.next().await;
        queue.clear().await;
        assert!(queue.is_empty());
        assert!(queue.history().is_empty());
    }

    #[tokio::test]
    async fn test_every_mutation_is_persisted() {
        let (mut queue, store) = queue();
        queue.add(track("a")).await;
        queue.add(track("b")).await;

        let saved = store.load_queue(GuildId(1)).await.unwrap().unwrap();
        assert_eq!(saved, queue.snapshot());

        queue.next().await;
        let saved = store.load_queue(GuildId(1)).await.unwrap().unwrap();
        assert_eq!(saved.current.unwrap().info.title, "b");
        assert!(saved.tracks.is_empty());

        let mut restored = Queue::new(GuildId(1), 30, store.clone(), store.clone());
        restored.load().await.unwrap();
        assert_eq!(current(&restored), Some("b".into()));
        assert_eq!(history(&restored), vec!["a"]);
    }

    #[tokio::test]
    async fn test_find_and_page() {
        let mut queue = filled(&["now", "Alpha", "beta", "alphabet"]).await;
        let found: Vec<usize> = queue.find("ALPHA").into_iter().map(|(i, _)| i).collect();
        assert_eq!(found, vec![0, 2]);

        for i in 0..9 {
            queue.add(track(&format!("t{i}"))).await;
        }
        let page = queue.page(2, 5);
        assert_eq!(page.total_items, 12);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.items[0].title(), "t2");
        assert_eq!(queue.page(9, 5).items.len(), 0);
    }

    #[tokio::test]
    async fn test_total_duration_counts_resolved_tracks() {
        let mut queue = filled(&["a", "b"]).await;
        queue.add(UnresolvedTrack::new("q", None)).await;
        assert_eq!(queue.total_duration(), Duration::from_secs(360));
    }

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!("none".parse::<LoopMode>().unwrap(), LoopMode::Off);
        assert_eq!("Queue".parse::<LoopMode>().unwrap(), LoopMode::Queue);
        assert!("sideways".parse::<LoopMode>().is_err());
        assert_eq!(serde_json::to_string(&LoopMode::Off).unwrap(), "\"none\"");
    }
}
