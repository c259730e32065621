//! Queue and history persistence: in-memory, or one JSON file per guild.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::history::HistoryEntry;
use crate::error::Result;
use crate::id::GuildId;
use crate::track::{QueueEntry, Track};

/// Persisted shape of a guild queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub tracks: Vec<QueueEntry>,
}

/// Where queue snapshots live between restarts.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load_queue(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>>;
    async fn save_queue(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<()>;
    async fn delete_queue(&self, guild_id: GuildId) -> Result<()>;
}

/// Where per-guild play history lives between restarts.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load_history(&self, guild_id: GuildId) -> Result<Vec<HistoryEntry>>;
    async fn save_history(&self, guild_id: GuildId, entries: &[HistoryEntry]) -> Result<()>;
    async fn clear_history(&self, guild_id: GuildId) -> Result<()>;
}

/// In-process default store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: DashMap<GuildId, QueueSnapshot>,
    history: DashMap<GuildId, Vec<HistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn load_queue(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>> {
        Ok(self.queues.get(&guild_id).map(|entry| entry.clone()))
    }

    async fn save_queue(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<()> {
        self.queues.insert(guild_id, snapshot.clone());
        Ok(())
    }

    async fn delete_queue(&self, guild_id: GuildId) -> Result<()> {
        self.queues.remove(&guild_id);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn load_history(&self, guild_id: GuildId) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .history
            .get(&guild_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn save_history(&self, guild_id: GuildId, entries: &[HistoryEntry]) -> Result<()> {
        self.history.insert(guild_id, entries.to_vec());
        Ok(())
    }

    async fn clear_history(&self, guild_id: GuildId) -> Result<()> {
        self.history.remove(&guild_id);
        Ok(())
    }
}

/// Store backed by one JSON file per guild:
/// `data_dir/queues/guild_<id>.json` and `data_dir/history/guild_<id>.json`.
pub struct JsonStore {
    data_dir: PathBuf,
}

impl JsonStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(data_dir.join("queues")).await?;
        fs::create_dir_all(data_dir.join("history")).await?;

        info!("📁 Storage initialised at {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// File counts and sizes for the startup log.
    pub async fn stats(&self) -> Result<StorageStats> {
        let (queue_files, queue_bytes) = count_json(&self.data_dir.join("queues")).await?;
        let (history_files, history_bytes) = count_json(&self.data_dir.join("history")).await?;

        Ok(StorageStats {
            queue_files,
            history_files,
            total_size_bytes: queue_bytes + history_bytes,
            data_dir: self.data_dir.clone(),
        })
    }

    fn file_path(&self, kind: &str, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join(kind)
            .join(format!("guild_{}.json", guild_id))
    }

    async fn read<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content).await?;
        debug!("💾 Wrote {}", path.display());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl QueueStore for JsonStore {
    async fn load_queue(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>> {
        let path = self.file_path("queues", guild_id);
        match self.read(&path).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!("Discarding unreadable queue for guild {}: {}", guild_id, e);
                Ok(None)
            }
        }
    }

    async fn save_queue(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<()> {
        self.write(&self.file_path("queues", guild_id), snapshot).await
    }

    async fn delete_queue(&self, guild_id: GuildId) -> Result<()> {
        self.remove(&self.file_path("queues", guild_id)).await
    }
}

#[async_trait]
impl HistoryStore for JsonStore {
    async fn load_history(&self, guild_id: GuildId) -> Result<Vec<HistoryEntry>> {
        let path = self.file_path("history", guild_id);
        Ok(self.read(&path).await?.unwrap_or_default())
    }

    async fn save_history(&self, guild_id: GuildId, entries: &[HistoryEntry]) -> Result<()> {
        self.write(&self.file_path("history", guild_id), entries).await
    }

    async fn clear_history(&self, guild_id: GuildId) -> Result<()> {
        self.remove(&self.file_path("history", guild_id)).await
    }
}

async fn count_json(dir: &Path) -> Result<(usize, u64)> {
    let mut files = fs::read_dir(dir).await?;
    let mut count = 0;
    let mut size = 0;

    while let Some(entry) = files.next_entry().await? {
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
            if let Ok(metadata) = entry.metadata().await {
                size += metadata.len();
            }
        }
    }

    Ok((count, size))
}

#[derive(Debug)]
pub struct StorageStats {
    pub queue_files: usize,
    pub history_files: usize,
    pub total_size_bytes: u64,
    pub data_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage: {} queues, {} histories, {:.2} KB in {}",
            self.queue_files,
            self.history_files,
            self.total_size_bytes as f64 / 1024.0,
            self.data_dir.display()
        )
    }
}
