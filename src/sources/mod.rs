//! Turns free text and URLs into tracks through the best node's search
//! endpoint.

pub mod autoplay;

pub use autoplay::AutoplayConfig;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::history::HistoryEntry;
use crate::error::{Error, Result};
use crate::node::protocol::{LoadResult, RawTrack};
use crate::node::NodeManager;
use crate::track::{Requester, Track, TrackInfo, UnresolvedTrack};

/// Search prefixes understood by the node and its source plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPlatform {
    Spotify,
    AppleMusic,
    Deezer,
    Yandex,
    YouTube,
    YouTubeMusic,
    SoundCloud,
}

impl SearchPlatform {
    pub fn prefix(self) -> &'static str {
        match self {
            SearchPlatform::Spotify => "spsearch",
            SearchPlatform::AppleMusic => "amsearch",
            SearchPlatform::Deezer => "dzsearch",
            SearchPlatform::Yandex => "ymsearch",
            SearchPlatform::YouTube => "ytsearch",
            SearchPlatform::YouTubeMusic => "ytmsearch",
            SearchPlatform::SoundCloud => "scsearch",
        }
    }
}

impl FromStr for SearchPlatform {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        Ok(match name.to_lowercase().as_str() {
            "spotify" | "sp" | "spsearch" => SearchPlatform::Spotify,
            "apple" | "applemusic" | "am" | "amsearch" => SearchPlatform::AppleMusic,
            "deezer" | "dz" | "dzsearch" => SearchPlatform::Deezer,
            "yandex" | "yandexmusic" | "ym" | "ymsearch" => SearchPlatform::Yandex,
            "youtube" | "yt" | "ytsearch" => SearchPlatform::YouTube,
            "youtubemusic" | "ytm" | "ytmsearch" => SearchPlatform::YouTubeMusic,
            "soundcloud" | "sc" | "scsearch" => SearchPlatform::SoundCloud,
            other => return Err(Error::Config(format!("unknown search platform: {other}"))),
        })
    }
}

/// Source platform a URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    YouTube,
    Spotify,
    Deezer,
    AppleMusic,
    SoundCloud,
    Unknown,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::YouTube => "youtube",
            SourceType::Spotify => "spotify",
            SourceType::Deezer => "deezer",
            SourceType::AppleMusic => "applemusic",
            SourceType::SoundCloud => "soundcloud",
            SourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a URL by host.
pub fn detect_source(input: &str) -> SourceType {
    let Some(host) = Url::parse(input)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
    else {
        return SourceType::Unknown;
    };
    let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

    if matches("youtube.com") || matches("youtu.be") {
        SourceType::YouTube
    } else if matches("spotify.com") {
        SourceType::Spotify
    } else if matches("deezer.com") || matches("deezer.page.link") {
        SourceType::Deezer
    } else if matches("apple.com") {
        SourceType::AppleMusic
    } else if matches("soundcloud.com") {
        SourceType::SoundCloud
    } else {
        SourceType::Unknown
    }
}

/// An http(s) URL the node may resolve directly.
pub fn is_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

/// `ytsearch:...`, `sprec:...` and friends go to the node untouched.
pub fn has_search_prefix(input: &str) -> bool {
    input.split_once(':').is_some_and(|(prefix, _)| {
        !prefix.is_empty()
            && prefix.bytes().all(|b| b.is_ascii_lowercase())
            && (prefix.ends_with("search") || prefix.ends_with("rec"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadKind {
    Track,
    Playlist,
    Search,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistInfo {
    pub name: String,
    pub artwork_url: Option<String>,
}

/// Canonical search outcome. An empty search is a result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveResult {
    pub kind: LoadKind,
    pub tracks: Vec<Track>,
    pub playlist: Option<PlaylistInfo>,
    /// Node or filter message for `LoadKind::Error`.
    pub error: Option<String>,
}

impl ResolveResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: LoadKind::Error,
            tracks: Vec::new(),
            playlist: None,
            error: Some(message.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn first(&self) -> Option<&Track> {
        self.tracks.first()
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_platform: String,
    pub allow_list: Vec<Regex>,
    pub deny_list: Vec<Regex>,
    pub autoplay: AutoplayConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_platform: SearchPlatform::YouTube.prefix().to_string(),
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            autoplay: AutoplayConfig::default(),
        }
    }
}

pub struct SourceResolver {
    nodes: Arc<NodeManager>,
    config: ResolverConfig,
}

impl SourceResolver {
    pub fn new(nodes: Arc<NodeManager>, config: ResolverConfig) -> Self {
        Self { nodes, config }
    }

    pub fn default_platform(&self) -> &str {
        &self.config.default_platform
    }

    /// Resolves free text or a URL. Plain text gets the default search
    /// prefix; a URL the node cannot load is retried once as a search.
    pub async fn resolve(&self, input: &str, requester: Option<Requester>) -> Result<ResolveResult> {
        let input = input.trim();
        if let Some(reason) = self.rejection(input) {
            warn!("🚫 Rejected input {:?}: {}", input, reason);
            return Ok(ResolveResult::error(reason));
        }

        let node = self.nodes.require_best()?;
        let url = is_url(input);
        let identifier = if url || has_search_prefix(input) {
            input.to_string()
        } else {
            format!("{}:{}", self.config.default_platform, input)
        };

        debug!("🔍 Loading {} on node {}", identifier, node.name());
        let mut result = node.load_tracks(&identifier).await?;

        if url && matches!(result, LoadResult::Empty | LoadResult::Error(_)) {
            let fallback = format!("{}:{}", self.config.default_platform, input);
            debug!("🔁 Retrying {} as {}", input, fallback);
            result = node.load_tracks(&fallback).await?;
        }

        let resolved = map_result(result, requester);
        info!(
            "✅ Resolved {:?}: {:?} with {} tracks",
            input,
            resolved.kind,
            resolved.tracks.len()
        );
        Ok(resolved)
    }

    /// Searches one platform, or the default one.
    pub async fn search(
        &self,
        query: &str,
        platform: Option<SearchPlatform>,
        requester: Option<Requester>,
    ) -> Result<ResolveResult> {
        let prefix = platform
            .map(SearchPlatform::prefix)
            .unwrap_or(self.config.default_platform.as_str());
        self.resolve(&format!("{}:{}", prefix, query), requester).await
    }

    pub fn create_unresolved(&self, query: &str, requester: Option<Requester>) -> UnresolvedTrack {
        UnresolvedTrack::new(query, requester)
    }

    /// First track for a placeholder, carrying the placeholder's requester.
    pub async fn resolve_unresolved(&self, pending: &UnresolvedTrack) -> Result<Option<Track>> {
        let result = self.resolve(&pending.query, pending.requester.clone()).await?;
        Ok(result.tracks.into_iter().next())
    }

    /// Recommendation following `last`: the platform query first, then the
    /// text fallback. Never returns `last` itself.
    pub async fn autoplay(&self, last: &HistoryEntry) -> Result<Option<Track>> {
        let not_last = |track: &Track| {
            track.info.identifier != last.identifier
                && (last.uri.is_none() || track.info.uri != last.uri)
        };

        if let Some(identifier) = self.config.autoplay.recommendation(last) {
            let result = self.resolve(&identifier, None).await?;
            if let Some(track) = result.tracks.into_iter().find(not_last) {
                return Ok(Some(track));
            }
        }

        let Some(query) = self.config.autoplay.fallback_query(last) else {
            return Ok(None);
        };
        let result = self.search(&query, None, None).await?;
        Ok(result.tracks.into_iter().find(not_last))
    }

    fn rejection(&self, input: &str) -> Option<&'static str> {
        if input.is_empty() {
            return Some("empty input");
        }
        if !self.config.allow_list.is_empty()
            && !self.config.allow_list.iter().any(|re| re.is_match(input))
        {
            return Some("input is not on the allow list");
        }
        if self.config.deny_list.iter().any(|re| re.is_match(input)) {
            return Some("input is on the deny list");
        }
        None
    }
}

fn map_result(result: LoadResult, requester: Option<Requester>) -> ResolveResult {
    let (kind, tracks, playlist, error) = match result {
        LoadResult::Track(raw) => (LoadKind::Track, vec![raw], None, None),
        LoadResult::Playlist(raw) => {
            let artwork_url = raw
                .plugin_info
                .get("artworkUrl")
                .and_then(Value::as_str)
                .map(String::from)
                .or(raw.info.artwork_url);
            let playlist = PlaylistInfo {
                name: raw.info.name,
                artwork_url,
            };
            (LoadKind::Playlist, raw.tracks, Some(playlist), None)
        }
        LoadResult::Search(raw) => (LoadKind::Search, raw, None, None),
        LoadResult::Empty => (LoadKind::Search, Vec::new(), None, None),
        LoadResult::Error(exception) => {
            let message = exception
                .message
                .unwrap_or_else(|| "failed to load track".to_string());
            (LoadKind::Error, Vec::new(), None, Some(message))
        }
    };

    ResolveResult {
        kind,
        tracks: tracks
            .into_iter()
            .map(|raw| map_track(raw, requester.clone()))
            .collect(),
        playlist,
        error,
    }
}

/// Reconciles the fields plugins disagree on: duration from `length`,
/// artwork from plugin info and then `image`.
pub fn map_track(raw: RawTrack, requester: Option<Requester>) -> Track {
    let info = raw.info;
    let artwork_url = info
        .artwork_url
        .or_else(|| {
            raw.plugin_info
                .get("artworkUrl")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .or(info.image);

    Track {
        encoded: raw.encoded,
        info: TrackInfo {
            identifier: info.identifier,
            title: info.title,
            author: info.author,
            uri: info.uri,
            duration: info.duration.or(info.length).unwrap_or_default(),
            is_seekable: info.is_seekable,
            is_stream: info.is_stream,
            artwork_url,
            isrc: info.isrc,
            source_name: info.source_name,
        },
        plugin_info: raw.plugin_info,
        requester,
        autoplay: false,
    }
}
