//! Per-guild playback state machine.
//!
//! Local flags change only after the node accepted the command. Node
//! events are queued to a per-player worker, so a slow guild never holds up
//! the socket read loop.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::filters::{ChannelOutput, EqCurve, FilterPreset, Filters};
use crate::audio::queue::Queue;
use crate::audio::voice::{VoiceBridge, VoiceChange, VoiceDirective, VoiceGateway};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, DestroyReason, EventBus};
use crate::id::{ChannelId, GuildId};
use crate::node::protocol::{
    EncodedTrack, PlayerEvent, PlayerPatch, PlayerState, RawTrack, TrackEndReason,
};
use crate::node::Node;
use crate::sources::{map_track, SourceResolver};
use crate::track::{QueueEntry, Track};

pub const MAX_VOLUME: u16 = 1000;
const FADE_TICK: Duration = Duration::from_millis(100);

/// Behaviour flags the host reads; the player only stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    pub auto_recover: bool,
    pub auto_resume: bool,
    pub gapless: bool,
    pub smart_buffer: bool,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            auto_recover: true,
            auto_resume: true,
            gapless: false,
            smart_buffer: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Plays this track instead of the queue's current one.
    pub track: Option<Track>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub paused: Option<bool>,
    /// Leave an already playing track alone.
    pub no_replace: bool,
}

/// Shared collaborators of every player of a client.
#[derive(Clone)]
pub struct PlayerContext {
    pub events: EventBus,
    pub resolver: Arc<SourceResolver>,
    pub gateway: Arc<dyn VoiceGateway>,
}

#[derive(Debug, Clone)]
struct PlaybackState {
    playing: bool,
    paused: bool,
    volume: u16,
    filters: Filters,
    transport: PlayerState,
    self_mute: bool,
    self_deaf: bool,
}

enum Head {
    Ready(Track),
    Unresolvable,
    Empty,
}

pub struct Player {
    guild_id: GuildId,
    node: RwLock<Arc<Node>>,
    state: RwLock<PlaybackState>,
    settings: RwLock<PlayerSettings>,
    voice: Mutex<VoiceBridge>,
    queue: Arc<AsyncMutex<Queue>>,
    ctx: PlayerContext,
    fade: Mutex<Option<CancellationToken>>,
    inbox: mpsc::UnboundedSender<PlayerEvent>,
    closed: CancellationToken,
}

impl Player {
    /// Creates the player and starts its event worker.
    pub fn spawn(
        guild_id: GuildId,
        node: Arc<Node>,
        queue: Arc<AsyncMutex<Queue>>,
        ctx: PlayerContext,
        volume: u16,
    ) -> Arc<Self> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let player = Arc::new(Self {
            guild_id,
            node: RwLock::new(node),
            state: RwLock::new(PlaybackState {
                playing: false,
                paused: false,
                volume: volume.min(MAX_VOLUME),
                filters: Filters::default(),
                transport: PlayerState::default(),
                self_mute: false,
                self_deaf: true,
            }),
            settings: RwLock::new(PlayerSettings::default()),
            voice: Mutex::new(VoiceBridge::new()),
            queue,
            ctx,
            fade: Mutex::new(None),
            inbox,
            closed: CancellationToken::new(),
        });

        tokio::spawn(run_events(
            Arc::downgrade(&player),
            rx,
            player.closed.clone(),
        ));
        player
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    pub fn queue(&self) -> Arc<AsyncMutex<Queue>> {
        self.queue.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.read().playing
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    pub fn volume(&self) -> u16 {
        self.state.read().volume
    }

    pub fn filters(&self) -> Filters {
        self.state.read().filters.clone()
    }

    /// Transport state last reported by the node.
    pub fn transport(&self) -> PlayerState {
        self.state.read().transport
    }

    pub fn position(&self) -> u64 {
        self.state.read().transport.position
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.voice.lock().channel_id()
    }

    pub fn is_destroyed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queues a node event for the worker.
    pub(crate) fn dispatch(&self, event: PlayerEvent) {
        if self.inbox.send(event).is_err() {
            debug!("Dropping event for closed player {}", self.guild_id);
        }
    }

    pub(crate) fn update_transport(&self, transport: PlayerState) {
        self.state.write().transport = transport;
    }

    fn set_flags(&self, playing: bool, paused: bool) {
        let mut state = self.state.write();
        state.playing = playing;
        state.paused = paused;
    }

    async fn update(&self, patch: PlayerPatch) -> Result<()> {
        self.node()
            .update_player(self.guild_id, &patch, false)
            .await
    }

    // Playback

    /// Plays the override track, the queue's current track, or resolves an
    /// unresolved head first. A head that fails to resolve is dropped and
    /// handled as a `loadFailed` track end.
    pub async fn play(&self, options: PlayOptions) -> Result<()> {
        let track = match options.track {
            Some(track) => track,
            None => match self.playable_head().await {
                Head::Ready(track) => track,
                Head::Unresolvable => {
                    self.ctx.events.emit(ClientEvent::TrackEnd {
                        guild_id: self.guild_id,
                        track: None,
                        reason: TrackEndReason::LoadFailed,
                    });
                    return self.on_track_end(TrackEndReason::LoadFailed).await;
                }
                Head::Empty => return Err(Error::NoTrack),
            },
        };

        let patch = PlayerPatch {
            encoded_track: EncodedTrack::Play(track.encoded.clone()),
            position: options.start_time,
            end_time: options.end_time,
            paused: options.paused,
            ..Default::default()
        };
        self.node()
            .update_player(self.guild_id, &patch, options.no_replace)
            .await?;

        self.set_flags(true, options.paused.unwrap_or(false));
        info!("▶️ Playing {} in guild {}", track.info.title, self.guild_id);
        Ok(())
    }

    async fn playable_head(&self) -> Head {
        let pending = {
            let queue = self.queue.lock().await;
            if let Some(current) = queue.current() {
                return Head::Ready(current.clone());
            }
            match queue.head() {
                Some(QueueEntry::Pending(pending)) => pending.clone(),
                _ => return Head::Empty,
            }
        };

        debug!("Resolving {:?} for guild {}", pending.query, self.guild_id);
        let resolved = match self.ctx.resolver.resolve_unresolved(&pending).await {
            Ok(track) => track,
            Err(e) => {
                warn!("Failed to resolve {:?}: {}", pending.query, e);
                None
            }
        };

        let mut queue = self.queue.lock().await;
        if let Some(track) = resolved {
            queue.fulfil_head(&pending.query, track).await;
        }
        match queue.current() {
            Some(current) => Head::Ready(current.clone()),
            None => {
                queue.drop_head(&pending.query).await;
                Head::Unresolvable
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.cancel_fade();
        self.update(PlayerPatch {
            encoded_track: EncodedTrack::Stop,
            ..Default::default()
        })
        .await?;
        self.set_flags(false, false);
        info!("⏹️ Stopped playback in guild {}", self.guild_id);
        Ok(())
    }

    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.update(PlayerPatch {
            paused: Some(paused),
            ..Default::default()
        })
        .await?;
        self.state.write().paused = paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.pause(false).await
    }

    pub async fn seek(&self, position: u64) -> Result<()> {
        self.update(PlayerPatch {
            position: Some(position),
            ..Default::default()
        })
        .await?;
        self.state.write().transport.position = position;
        Ok(())
    }

    /// Skips to the next queue entry, or stops when there is none.
    pub async fn skip(&self) -> Result<bool> {
        let has_next = self.queue.lock().await.skip().await;
        if has_next {
            self.play(PlayOptions::default()).await?;
        } else {
            self.stop().await?;
        }
        Ok(has_next)
    }

    /// Sets the volume, clamped to `0..=1000`. Cancels a running fade.
    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        self.cancel_fade();
        self.apply_volume(volume).await
    }

    async fn apply_volume(&self, volume: u16) -> Result<u16> {
        let volume = volume.min(MAX_VOLUME);
        self.update(PlayerPatch {
            volume: Some(volume),
            ..Default::default()
        })
        .await?;
        self.state.write().volume = volume;
        Ok(volume)
    }

    // Fades

    /// Ramps the volume to `target` in 100 ms steps. Returns `false` when a
    /// newer fade (or a manual volume change) cut it short.
    pub async fn fade_to(&self, target: u16, duration: Duration) -> Result<bool> {
        let token = self.begin_fade();
        self.ramp(target, duration, token).await
    }

    async fn ramp(&self, target: u16, duration: Duration, token: CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(false);
        }

        let start = f64::from(self.volume());
        let target = f64::from(target.min(MAX_VOLUME));
        let steps = (duration.as_millis() / FADE_TICK.as_millis()).max(1) as u32;

        for step in 1..=steps {
            tokio::select! {
                _ = token.cancelled() => return Ok(false),
                _ = tokio::time::sleep(FADE_TICK) => {}
            }
            let volume = start + (target - start) * f64::from(step) / f64::from(steps);
            self.apply_volume(volume.round() as u16).await?;
        }
        Ok(true)
    }

    /// Starts from silence and ramps up to `target` in the background.
    pub fn fade_in(self: &Arc<Self>, target: u16, duration: Duration) -> JoinHandle<Result<bool>> {
        let token = self.begin_fade();
        let player = self.clone();
        tokio::spawn(async move {
            if token.is_cancelled() {
                return Ok(false);
            }
            player.apply_volume(0).await?;
            player.ramp(target, duration, token).await
        })
    }

    pub fn fade_out(self: &Arc<Self>, duration: Duration) -> JoinHandle<Result<bool>> {
        let token = self.begin_fade();
        let player = self.clone();
        tokio::spawn(async move { player.ramp(0, duration, token).await })
    }

    /// Registers a new fade, cancelling the one it replaces.
    fn begin_fade(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.fade.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn cancel_fade(&self) {
        if let Some(token) = self.fade.lock().take() {
            token.cancel();
        }
    }

    // Filters

    /// Shallow-merges `update` into the active filters and sends the result.
    pub async fn set_filters(&self, update: Filters) -> Result<()> {
        let mut merged = self.filters();
        merged.merge(update);
        self.update(PlayerPatch {
            filters: Some(merged.clone()),
            ..Default::default()
        })
        .await?;
        self.state.write().filters = merged;
        Ok(())
    }

    /// Resets every filter on the node.
    pub async fn clear_filters(&self) -> Result<()> {
        self.update(PlayerPatch {
            filters: Some(Filters::neutral()),
            ..Default::default()
        })
        .await?;
        self.state.write().filters = Filters::default();
        Ok(())
    }

    pub async fn apply_preset(&self, preset: &FilterPreset) -> Result<()> {
        debug!("🎛️ Applying {} in guild {}", preset, self.guild_id);
        self.set_filters(preset.filters()).await
    }

    pub async fn set_equalizer(&self, curve: &EqCurve) -> Result<()> {
        self.set_filters(curve.filters()).await
    }

    pub async fn set_channel_output(&self, output: ChannelOutput) -> Result<()> {
        self.set_filters(Filters::with_channel_mix(output.mix())).await
    }

    // Track lifecycle

    /// Reacts to the end of a track: advance, autoplay or report the end
    /// of the queue. Caller-initiated ends (`stopped`, `replaced`) are
    /// ignored.
    pub fn on_track_end(&self, reason: TrackEndReason) -> BoxFuture<'_, Result<()>> {
        async move {
            if !reason.advances_queue() {
                debug!("Track ended ({:?}) in guild {}", reason, self.guild_id);
                return Ok(());
            }
            self.set_flags(false, false);

            let has_next = self.queue.lock().await.next().await;
            if has_next {
                return self.play(PlayOptions::default()).await;
            }

            let autoplay = self.queue.lock().await.autoplay();
            if autoplay && self.autoplay_next().await {
                return Ok(());
            }

            info!("📭 Queue ended in guild {}", self.guild_id);
            self.ctx.events.emit(ClientEvent::QueueEnd {
                guild_id: self.guild_id,
            });
            Ok(())
        }
        .boxed()
    }

    async fn autoplay_next(&self) -> bool {
        let last = self.queue.lock().await.history().last().cloned();
        let Some(last) = last else {
            return false;
        };

        let track = match self.ctx.resolver.autoplay(&last).await {
            Ok(Some(track)) => track,
            Ok(None) => {
                debug!("No recommendation after {}", last.title);
                return false;
            }
            Err(e) => {
                warn!("Autoplay search failed in guild {}: {}", self.guild_id, e);
                return false;
            }
        };

        info!("🤖 Autoplay picked {} in guild {}", track.info.title, self.guild_id);
        self.queue.lock().await.add(track.into_autoplay()).await;
        match self.play(PlayOptions::default()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Autoplay failed to start in guild {}: {}", self.guild_id, e);
                false
            }
        }
    }

    async fn handle_event(&self, event: PlayerEvent) {
        let guild_id = self.guild_id;
        match event {
            PlayerEvent::TrackStart { track, .. } => {
                let track = self.known_track(track).await;
                debug!("🎵 Started {} in guild {}", track.info.title, guild_id);
                self.ctx
                    .events
                    .emit(ClientEvent::TrackStart { guild_id, track });
            }
            PlayerEvent::TrackEnd { track, reason, .. } => {
                let track = self.known_track(track).await;
                self.ctx.events.emit(ClientEvent::TrackEnd {
                    guild_id,
                    track: Some(track),
                    reason,
                });
                if let Err(e) = self.on_track_end(reason).await {
                    warn!("Failed to advance queue in guild {}: {}", guild_id, e);
                }
            }
            PlayerEvent::TrackException {
                track, exception, ..
            } => {
                warn!(
                    "Track exception in guild {}: {:?}",
                    guild_id, exception.message
                );
                let track = self.known_track(track).await;
                self.ctx.events.emit(ClientEvent::TrackError {
                    guild_id,
                    track: Some(track),
                    exception,
                });
            }
            PlayerEvent::TrackStuck {
                track,
                threshold_ms,
                ..
            } => {
                warn!("Track stuck in guild {} ({} ms)", guild_id, threshold_ms);
                let track = self.known_track(track).await;
                self.ctx.events.emit(ClientEvent::TrackStuck {
                    guild_id,
                    track: Some(track),
                    threshold_ms,
                });
            }
            PlayerEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
                ..
            } => {
                warn!(
                    "Voice connection closed in guild {} ({}): {}",
                    guild_id, code, reason
                );
                self.ctx.events.emit(ClientEvent::PlayerDisconnect {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }

    /// The queue's copy of a node track (it carries the requester), or a
    /// fresh mapping.
    async fn known_track(&self, raw: RawTrack) -> Track {
        let queue = self.queue.lock().await;
        match queue.current() {
            Some(current) if current.encoded == raw.encoded => current.clone(),
            _ => map_track(raw, None),
        }
    }

    // Nodes

    /// Moves the player to `target`, resuming from the last known
    /// position. The target must accept the state before the player is
    /// reassigned.
    pub async fn move_to_node(&self, target: Arc<Node>) -> Result<()> {
        let current = self.node();
        if Arc::ptr_eq(&current, &target) || current.name() == target.name() {
            return Ok(());
        }

        let voice = self.voice.lock().credentials();
        let state = self.state.read().clone();
        let track = if state.playing || state.paused {
            self.queue.lock().await.current().cloned()
        } else {
            None
        };

        let mut patch = PlayerPatch {
            volume: Some(state.volume),
            filters: (!state.filters.is_empty()).then_some(state.filters),
            voice,
            ..Default::default()
        };
        if let Some(track) = &track {
            patch.encoded_track = EncodedTrack::Play(track.encoded.clone());
            patch.position = Some(state.transport.position);
            patch.paused = Some(state.paused);
        }

        target.update_player(self.guild_id, &patch, false).await?;
        *self.node.write() = target.clone();

        if current.is_ready() {
            if let Err(e) = current.destroy_player(self.guild_id).await {
                debug!("Could not remove player from {}: {}", current.name(), e);
            }
        }

        info!(
            "🚚 Moved guild {} from {} to {}",
            self.guild_id,
            current.name(),
            target.name()
        );
        self.ctx.events.emit(ClientEvent::PlayerNodeMove {
            guild_id: self.guild_id,
            from: current.name().to_string(),
            to: target.name().to_string(),
        });
        Ok(())
    }

    // Voice

    /// Asks the host to join `channel_id`.
    pub fn connect(&self, channel_id: ChannelId, self_mute: bool, self_deaf: bool) {
        {
            let mut state = self.state.write();
            state.self_mute = self_mute;
            state.self_deaf = self_deaf;
        }
        info!("🔊 Joining channel {} in guild {}", channel_id, self.guild_id);
        self.ctx.gateway.send(VoiceDirective {
            guild_id: self.guild_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        });
    }

    pub fn move_to_channel(&self, channel_id: ChannelId) {
        let (self_mute, self_deaf) = {
            let state = self.state.read();
            (state.self_mute, state.self_deaf)
        };
        self.connect(channel_id, self_mute, self_deaf);
    }

    /// Leaves the voice channel and stops playback.
    pub async fn disconnect(&self) -> Result<()> {
        self.ctx.gateway.send(VoiceDirective {
            guild_id: self.guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        });
        self.voice.lock().set_channel(None);
        self.stop().await
    }

    pub async fn handle_voice_state(
        &self,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) -> Result<()> {
        let change = self.voice.lock().update_state(session_id, channel_id);
        self.apply_voice_change(change).await
    }

    pub async fn handle_voice_server(&self, token: String, endpoint: Option<String>) -> Result<()> {
        let change = self.voice.lock().update_server(token, endpoint);
        self.apply_voice_change(change).await
    }

    async fn apply_voice_change(&self, change: VoiceChange) -> Result<()> {
        if let Some((old, new)) = change.moved {
            info!("🔀 Guild {} moved from {:?} to {:?}", self.guild_id, old, new);
            self.ctx.events.emit(ClientEvent::PlayerMove {
                guild_id: self.guild_id,
                old,
                new,
            });
        }

        if let Some(voice) = change.attach {
            debug!("Attaching voice for guild {}", self.guild_id);
            let attached = self
                .update(PlayerPatch {
                    voice: Some(voice),
                    ..Default::default()
                })
                .await;
            if attached.is_err() {
                // Send again on the next fragment.
                self.voice.lock().reset_attached();
            }
            attached?;
        }
        Ok(())
    }

    // Settings

    pub fn settings(&self) -> PlayerSettings {
        *self.settings.read()
    }

    pub fn set_settings(&self, settings: PlayerSettings) {
        *self.settings.write() = settings;
    }

    pub fn toggle_auto_recover(&self) -> bool {
        let mut settings = self.settings.write();
        settings.auto_recover = !settings.auto_recover;
        settings.auto_recover
    }

    pub fn toggle_auto_resume(&self) -> bool {
        let mut settings = self.settings.write();
        settings.auto_resume = !settings.auto_resume;
        settings.auto_resume
    }

    pub fn toggle_gapless(&self) -> bool {
        let mut settings = self.settings.write();
        settings.gapless = !settings.gapless;
        settings.gapless
    }

    pub fn toggle_smart_buffer(&self) -> bool {
        let mut settings = self.settings.write();
        settings.smart_buffer = !settings.smart_buffer;
        settings.smart_buffer
    }

    /// Flips the queue's autoplay flag and returns the new value.
    pub async fn toggle_autoplay(&self) -> bool {
        let mut queue = self.queue.lock().await;
        let enabled = !queue.autoplay();
        queue.set_autoplay(enabled);
        enabled
    }

    /// Tears the player down on the node. The worker and any fade stop.
    pub async fn destroy(&self, reason: DestroyReason) -> Result<()> {
        self.closed.cancel();
        self.cancel_fade();
        self.set_flags(false, false);

        info!("💥 Destroying player for guild {} ({})", self.guild_id, reason);
        self.ctx.events.emit(ClientEvent::PlayerDestroy {
            guild_id: self.guild_id,
            reason,
        });
        self.node().destroy_player(self.guild_id).await
    }
}

async fn run_events(
    player: Weak<Player>,
    mut rx: mpsc::UnboundedReceiver<PlayerEvent>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(player) = player.upgrade() else {
            break;
        };
        player.handle_event(event).await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{context, queue};
    use super::*;
    use crate::audio::filters::Timescale;
    use crate::node::manager::testing::manager;
    use crate::node::protocol::{LoadResult, TrackException};
    use crate::node::rest::MockNodeApi;
    use crate::node::testing::ready_node;
    use crate::sources::testing::raw_track;
    use crate::track::fixtures::track;
    use crate::track::UnresolvedTrack;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    type Patches = Arc<Mutex<Vec<PlayerPatch>>>;

    fn record_patches(api: &mut MockNodeApi) -> Patches {
        let patches: Patches = Arc::default();
        let log = patches.clone();
        api.expect_update_player()
            .returning(move |_, _, patch, _| {
                log.lock().push(patch.clone());
                Ok(())
            });
        patches
    }

    struct Harness {
        player: Arc<Player>,
        events: broadcast::Receiver<ClientEvent>,
    }

    fn harness(api: MockNodeApi) -> Harness {
        let node = ready_node("main", 0, api);
        let nodes = manager();
        nodes.register(node.clone()).unwrap();
        let events = EventBus::new(64);
        let subscriber = events.subscribe();
        let ctx = context(Arc::new(nodes), events);
        Harness {
            player: Player::spawn(GuildId(1), node, queue(GuildId(1)), ctx, 100),
            events: subscriber,
        }
    }

    fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    fn played(patches: &Patches) -> Vec<String> {
        patches
            .lock()
            .iter()
            .filter_map(|patch| match &patch.encoded_track {
                EncodedTrack::Play(encoded) => Some(encoded.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_play_sends_current_track() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        h.player.queue().lock().await.add(track("a")).await;
        h.player.play(PlayOptions::default()).await.unwrap();

        assert_eq!(played(&patches), vec!["enc-a"]);
        assert!(h.player.is_playing());
        assert!(!h.player.is_paused());
    }

    #[tokio::test]
    async fn test_play_after_head_edits_on_idle_queue() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        h.player.queue().lock().await.add_next(track("a")).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        assert_eq!(played(&patches), vec!["enc-a"]);

        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);
        {
            let queue = h.player.queue();
            let mut queue = queue.lock().await;
            queue.add(UnresolvedTrack::new("unreachable", None)).await;
            queue.add(track("b")).await;
            queue.remove(0).await;
        }
        h.player.play(PlayOptions::default()).await.unwrap();
        assert_eq!(played(&patches), vec!["enc-b"]);
    }

    #[tokio::test]
    async fn test_play_with_empty_queue_fails() {
        let h = harness(MockNodeApi::new());
        assert!(matches!(
            h.player.play(PlayOptions::default()).await,
            Err(Error::NoTrack)
        ));
    }

    #[tokio::test]
    async fn test_rejected_commands_leave_state_unchanged() {
        let mut api = MockNodeApi::new();
        api.expect_update_player().returning(|_, _, _, _| {
            Err(Error::Rest {
                status: reqwest::StatusCode::BAD_REQUEST,
                message: "no".into(),
            })
        });
        let h = harness(api);
        h.player.queue().lock().await.add(track("a")).await;

        let err = h.player.play(PlayOptions::default()).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(!h.player.is_playing());

        assert!(h.player.pause(true).await.is_err());
        assert!(!h.player.is_paused());
        assert!(h.player.set_volume(50).await.is_err());
        assert_eq!(h.player.volume(), 100);
    }

    #[tokio::test]
    async fn test_play_resolves_pending_head_in_place() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        api.expect_load_tracks()
            .with(eq("ytsearch:song a"))
            .returning(|_| Ok(LoadResult::Search(vec![raw_track("a")])));
        let h = harness(api);

        h.player
            .queue()
            .lock()
            .await
            .add(UnresolvedTrack::new("song a", Some(serde_json::json!("req"))))
            .await;
        h.player.play(PlayOptions::default()).await.unwrap();

        assert_eq!(played(&patches), vec!["enc-a"]);
        let queue = h.player.queue();
        let queue = queue.lock().await;
        let current = queue.current().unwrap();
        assert_eq!(current.info.title, "a");
        assert_eq!(current.requester, Some(serde_json::json!("req")));
    }

    #[tokio::test]
    async fn test_unresolvable_head_is_dropped_and_next_plays() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        api.expect_load_tracks()
            .with(eq("ytsearch:gibberish"))
            .returning(|_| Ok(LoadResult::Empty));
        let mut h = harness(api);

        {
            let queue = h.player.queue();
            let mut queue = queue.lock().await;
            queue.add(UnresolvedTrack::new("gibberish", None)).await;
            queue.add(track("b")).await;
        }
        h.player.play(PlayOptions::default()).await.unwrap();

        assert_eq!(played(&patches), vec!["enc-b"]);
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            e,
            ClientEvent::TrackEnd {
                reason: TrackEndReason::LoadFailed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_track_end_advances_then_reports_queue_end() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let mut h = harness(api);
        {
            let queue = h.player.queue();
            let mut queue = queue.lock().await;
            queue.add(track("a")).await;
            queue.add(track("b")).await;
        }
        h.player.play(PlayOptions::default()).await.unwrap();

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();
        assert_eq!(played(&patches), vec!["enc-a", "enc-b"]);

        h.player.on_track_end(TrackEndReason::Replaced).await.unwrap();
        h.player.on_track_end(TrackEndReason::Stopped).await.unwrap();
        assert_eq!(played(&patches).len(), 2);
        assert!(h.player.is_playing());

        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();
        assert!(!h.player.is_playing());
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, ClientEvent::QueueEnd { guild_id } if *guild_id == GuildId(1))));
    }

    #[tokio::test]
    async fn test_autoplay_plays_a_recommendation() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        api.expect_load_tracks()
            .with(eq("https://www.youtube.com/watch?v=id-a&list=RDid-a"))
            .returning(|_| Ok(LoadResult::Search(vec![raw_track("a"), raw_track("next")])));
        let h = harness(api);

        {
            let queue = h.player.queue();
            let mut queue = queue.lock().await;
            queue.add(track("a")).await;
            queue.set_autoplay(true);
        }
        h.player.play(PlayOptions::default()).await.unwrap();
        h.player.on_track_end(TrackEndReason::Finished).await.unwrap();

        assert_eq!(played(&patches), vec!["enc-a", "enc-next"]);
        let queue = h.player.queue();
        let queue = queue.lock().await;
        assert!(queue.current().unwrap().autoplay);
        assert_eq!(queue.history().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_handles_node_events_in_order() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let mut h = harness(api);
        {
            let queue = h.player.queue();
            let mut queue = queue.lock().await;
            queue.add(track("a").with_requester(Some(serde_json::json!(9)))).await;
            queue.add(track("b")).await;
        }
        h.player.play(PlayOptions::default()).await.unwrap();

        h.player.dispatch(PlayerEvent::TrackStart {
            guild_id: GuildId(1),
            track: raw_track("a"),
        });
        h.player.dispatch(PlayerEvent::TrackEnd {
            guild_id: GuildId(1),
            track: raw_track("a"),
            reason: TrackEndReason::Finished,
        });

        for _ in 0..100 {
            if played(&patches).len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(played(&patches), vec!["enc-a", "enc-b"]);

        let events = drain(&mut h.events);
        match &events[0] {
            ClientEvent::TrackStart { track, .. } => {
                assert_eq!(track.requester, Some(serde_json::json!(9)))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exception_and_socket_close_become_events() {
        let mut h = harness(MockNodeApi::new());
        h.player.dispatch(PlayerEvent::TrackException {
            guild_id: GuildId(1),
            track: raw_track("a"),
            exception: TrackException {
                message: Some("boom".into()),
                severity: "fault".into(),
                cause: String::new(),
            },
        });
        h.player.dispatch(PlayerEvent::WebSocketClosed {
            guild_id: GuildId(1),
            code: 4014,
            reason: "kicked".into(),
            by_remote: true,
        });

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(h.events.recv().await.unwrap());
        }
        assert!(matches!(seen[0], ClientEvent::TrackError { .. }));
        assert!(matches!(seen[1], ClientEvent::PlayerDisconnect { code: 4014, .. }));
    }

    #[tokio::test]
    async fn test_filters_merge_and_clear() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        h.player
            .set_filters(Filters {
                timescale: Some(Timescale {
                    speed: 1.2,
                    pitch: 1.0,
                    rate: 1.0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        h.player.apply_preset(&FilterPreset::Karaoke).await.unwrap();

        let active = h.player.filters();
        assert!(active.timescale.is_some());
        assert!(active.karaoke.is_some());
        assert_eq!(patches.lock().last().unwrap().filters, Some(active));

        h.player.clear_filters().await.unwrap();
        assert!(h.player.filters().is_empty());
        assert_eq!(
            patches.lock().last().unwrap().filters,
            Some(Filters::neutral())
        );
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        assert_eq!(h.player.set_volume(5000).await.unwrap(), MAX_VOLUME);
        assert_eq!(patches.lock()[0].volume, Some(MAX_VOLUME));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_out_ramps_to_zero() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        let finished = h.player.fade_out(Duration::from_millis(500)).await.unwrap();
        assert!(finished.unwrap());

        let volumes: Vec<u16> = patches.lock().iter().filter_map(|p| p.volume).collect();
        assert_eq!(volumes, vec![80, 60, 40, 20, 0]);
        assert_eq!(h.player.volume(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_fade_cancels_running_one() {
        let mut api = MockNodeApi::new();
        record_patches(&mut api);
        let h = harness(api);

        let first = h.player.fade_out(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(350)).await;
        let second = h.player.fade_in(100, Duration::from_millis(200));

        assert!(!first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        assert_eq!(h.player.volume(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_fades_keep_only_the_last() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let h = harness(api);

        let first = h.player.fade_out(Duration::from_millis(300));
        let second = h.player.fade_in(50, Duration::from_millis(200));

        assert!(!first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        let volumes: Vec<u16> = patches.lock().iter().filter_map(|p| p.volume).collect();
        assert_eq!(volumes, vec![0, 25, 50]);
        assert_eq!(h.player.volume(), 50);
    }

    #[tokio::test]
    async fn test_voice_credentials_attach_once() {
        let mut api = MockNodeApi::new();
        let patches = record_patches(&mut api);
        let mut h = harness(api);

        h.player
            .handle_voice_state("sess".into(), Some(ChannelId(10)))
            .await
            .unwrap();
        for _ in 0..3 {
            h.player
                .handle_voice_server("tok".into(), Some("ep".into()))
                .await
                .unwrap();
        }
        h.player
            .handle_voice_state("sess".into(), Some(ChannelId(11)))
            .await
            .unwrap();

        let attaches = patches.lock().iter().filter(|p| p.voice.is_some()).count();
        assert_eq!(attaches, 1);
        assert_eq!(h.player.channel_id(), Some(ChannelId(11)));
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerMove { new: Some(ChannelId(11)), .. })));
    }

    #[tokio::test]
    async fn test_move_to_node_resumes_position() {
        let mut api = MockNodeApi::new();
        record_patches(&mut api);
        api.expect_destroy_player().times(1).returning(|_, _| Ok(()));
        let h = harness(api);

        h.player.queue().lock().await.add(track("a")).await;
        h.player.play(PlayOptions::default()).await.unwrap();
        h.player.set_filters(FilterPreset::Nightcore.filters()).await.unwrap();
        h.player.update_transport(PlayerState {
            position: 42_000,
            connected: true,
            ..Default::default()
        });

        let mut backup_api = MockNodeApi::new();
        let moved = record_patches(&mut backup_api);
        let backup = ready_node("backup", 0, backup_api);

        h.player.move_to_node(backup.clone()).await.unwrap();
        assert_eq!(h.player.node().name(), "backup");

        let patch = moved.lock()[0].clone();
        assert_eq!(patch.encoded_track, EncodedTrack::Play("enc-a".into()));
        assert_eq!(patch.position, Some(42_000));
        assert_eq!(patch.volume, Some(100));
        assert!(patch.filters.unwrap().timescale.is_some());

        // Already there.
        h.player.move_to_node(backup).await.unwrap();
        assert_eq!(moved.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_settings_toggles() {
        let h = harness(MockNodeApi::new());
        assert_eq!(h.player.settings(), PlayerSettings::default());
        assert!(h.player.toggle_gapless());
        assert!(!h.player.toggle_gapless());
        assert!(!h.player.toggle_auto_recover());
        assert!(h.player.toggle_smart_buffer());
        assert!(!h.player.toggle_auto_resume());
        assert!(h.player.toggle_autoplay().await);
        assert!(h.player.queue().lock().await.autoplay());
    }

    #[tokio::test]
    async fn test_destroy_emits_reason_and_deletes() {
        let mut api = MockNodeApi::new();
        api.expect_destroy_player()
            .with(eq("session-main"), eq(GuildId(1)))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut h = harness(api);

        h.player.destroy(DestroyReason::ChannelDeleted).await.unwrap();
        assert!(h.player.is_destroyed());
        assert!(drain(&mut h.events).iter().any(|e| matches!(
            e,
            ClientEvent::PlayerDestroy {
                reason: DestroyReason::ChannelDeleted,
                ..
            }
        )));
    }
}
