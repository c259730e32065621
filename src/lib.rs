//! # lavx
//!
//! Client for a pool of Lavalink v4 audio nodes.
//!
//! The host owns the chat gateway connection; lavx owns everything between
//! it and the nodes:
//!
//! - [`node`] - node sockets, REST control plane, least-loaded selection
//!   and player migration when a node dies
//! - [`audio`] - per-guild players, queues, history and filters
//! - [`sources`] - query classification, search and autoplay
//! - [`events`] - broadcast bus of client events
//! - [`storage`] - queue and history persistence
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lavx::{Client, Config, GuildId, UserId, VoiceDirective, VoiceGateway};
//!
//! struct Gateway;
//!
//! impl VoiceGateway for Gateway {
//!     fn send(&self, directive: VoiceDirective) {
//!         // Write directive.to_payload() to the gateway shard.
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Client::new(Config::load()?, Arc::new(Gateway)).await?;
//! client.set_user_id(UserId(1234));
//! client.start()?;
//!
//! client.play_input(GuildId(42), "lofi beats", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod node;
pub mod sources;
pub mod storage;
pub mod track;

pub use audio::{
    FilterPreset, Filters, LoopMode, PlayOptions, Player, PlayerSettings, VoiceDirective,
    VoiceGateway,
};
pub use client::{Client, PlayerManager, QueueManager};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{ClientEvent, DestroyReason, EventBus};
pub use id::{ChannelId, GuildId, UserId};
pub use node::{Node, NodeConfig, NodeManager};
pub use sources::{LoadKind, ResolveResult, SearchPlatform, SourceResolver};
pub use track::{QueueEntry, Track, TrackInfo, UnresolvedTrack};
