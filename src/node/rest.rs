//! REST control plane of a node.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::id::GuildId;
use crate::node::protocol::{LoadResult, NodeInfo, NodeStats, PlayerPatch, RawTrack};

/// Request/response calls a node accepts. Player calls are scoped by the
/// session id handed out in the node's `ready` frame.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult>;

    async fn decode_track(&self, encoded: &str) -> Result<RawTrack>;

    async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<RawTrack>>;

    async fn info(&self) -> Result<NodeInfo>;

    async fn stats(&self) -> Result<NodeStats>;

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        patch: &PlayerPatch,
        no_replace: bool,
    ) -> Result<()>;

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()>;
}

/// [`NodeApi`] over HTTP.
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: String, password: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(password)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .default_headers(headers)
            .build()?;

        Ok(Self { base_url, client })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!("{} {}{}", method, self.base_url, path);
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    fn player_path(session_id: &str, guild_id: GuildId) -> String {
        format!(
            "/sessions/{}/players/{}",
            urlencoding::encode(session_id),
            guild_id
        )
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Turns a non-2xx answer into [`Error::Rest`], keeping the node's
    /// `message` when the body is the usual error object.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(body);

        error!("❌ Node rejected request: {} - {}", status, message);
        Err(Error::Rest { status, message })
    }
}

#[async_trait]
impl NodeApi for RestClient {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let request = self
            .request(Method::GET, "/loadtracks")
            .query(&[("identifier", identifier)]);
        let value: Value = Self::json(request).await?;
        Ok(LoadResult::from_value(value)?)
    }

    async fn decode_track(&self, encoded: &str) -> Result<RawTrack> {
        let request = self
            .request(Method::GET, "/decodetrack")
            .query(&[("encodedTrack", encoded)]);
        Self::json(request).await
    }

    async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<RawTrack>> {
        let request = self.request(Method::POST, "/decodetracks").json(encoded);
        Self::json(request).await
    }

    async fn info(&self) -> Result<NodeInfo> {
        Self::json(self.request(Method::GET, "/info")).await
    }

    async fn stats(&self) -> Result<NodeStats> {
        Self::json(self.request(Method::GET, "/stats")).await
    }

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        patch: &PlayerPatch,
        no_replace: bool,
    ) -> Result<()> {
        let request = self
            .request(Method::PATCH, &Self::player_path(session_id, guild_id))
            .query(&[("noReplace", no_replace)])
            .json(patch);
        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()> {
        let request = self.request(Method::DELETE, &Self::player_path(session_id, guild_id));
        Self::check(request.send().await?).await?;
        Ok(())
    }
}
