//! # Audio Module
//!
//! Per-guild playback state kept on the client side of a Lavalink node.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - Mirrors the node's playback state for one guild
//! - Advances the queue on track end and runs autoplay
//! - Volume fades, filter merging and node migration
//!
//! ### [`queue`] - Queue Management
//! - Ordered entries with lazily resolved items
//! - Loop modes, shuffle, dedupe and paging
//! - Persisted on every mutation
//!
//! ### [`history`] - Play History
//! - Bounded, deduplicated record of finished tracks
//! - Seeds autoplay recommendations
//!
//! ### [`filters`] - Filters
//! - Sparse Lavalink filter sets with shallow merge
//! - Presets, 10-band EQ curves and channel routing
//!
//! ### [`voice`] - Voice Credentials
//! - Joins the two gateway fragments into one node update
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use lavx::audio::player::PlayOptions;
//! use lavx::audio::filters::FilterPreset;
//! use lavx::{Client, GuildId};
//!
//! # async fn example(client: &Client) -> lavx::Result<()> {
//! let player = client.players().create(GuildId(123456789), None).await?;
//! player.queue().lock().await.add(lavx::UnresolvedTrack::new("never gonna give you up", None)).await;
//! player.play(PlayOptions::default()).await?;
//! player.apply_preset(&FilterPreset::Nightcore).await?;
//! # Ok(())
//! # }
//! ```

pub mod filters;
pub mod history;
pub mod player;
pub mod queue;
pub mod voice;

pub use filters::{FilterPreset, Filters};
pub use history::{History, HistoryEntry};
pub use player::{PlayOptions, Player, PlayerContext, PlayerSettings};
pub use queue::{LoopMode, Queue, QueuePage};
pub use voice::{VoiceDirective, VoiceGateway};
