//! Top-level playback controller
//!
//! Owns the session model and the main program. UI collaborators call the
//! operations here and observe the player through [`Controller::subscribe`].

use crate::{
    adapter::{MediaAdapter, MediaEvent, MediaEventSink, PlayOutcome},
    config::{Autostart, ControllerConfig},
    element::{ContainerHandle, MediaElementPool},
    error::PlayRejection,
    events::{EventBus, ModelChange, PlayerEvent},
    instream::InstreamAdapter,
    item::PlaylistItem,
    model::{SessionModel, SessionSnapshot},
    program::{ProgramController, ProgramRole},
    provider::{Provider, ProviderConfig, ProviderRegistry},
    queue::{CommandQueue, QueuedCommand},
    types::*,
    Error, Result,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct ControlState {
    container: Option<ContainerHandle>,
    play: Option<(u64, CancellationToken)>,
    play_seq: u64,
    play_reason: Reason,
    pause_reason: Reason,
    instream: Option<InstreamAdapter>,
    /// Autostart waiting for the player to become viewable
    pending_viewable: bool,
    /// Completion held for a postroll
    deferred_complete: bool,
    /// Item index and media generation a background load was requested for
    background_key: Option<(usize, u64)>,
    /// The selected item failed setup and no media is active
    setup_failed: bool,
    destroyed: bool,
}

pub(crate) struct ControllerInner {
    config: ControllerConfig,
    bus: EventBus,
    registry: Arc<ProviderRegistry>,
    pool: MediaElementPool,
    adapter_ids: Arc<AtomicU64>,
    program: ProgramController,
    session: Mutex<SessionModel>,
    queue: Mutex<CommandQueue>,
    control: Mutex<ControlState>,
    this: Weak<ControllerInner>,
}

/// Handle to one player instance
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

/// Non-owning controller handle held by ad sessions
#[derive(Clone)]
pub(crate) struct WeakController {
    inner: Weak<ControllerInner>,
}

impl WeakController {
    pub(crate) fn upgrade(&self) -> Option<Controller> {
        self.inner.upgrade().map(|inner| Controller { inner })
    }
}

impl Controller {
    /// Create a controller over `registry`
    pub fn new(config: ControllerConfig, registry: Arc<ProviderRegistry>) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.event_capacity);
        let mut session = SessionModel::new(bus.clone());
        session.volume = config.volume;
        session.mute = config.mute;
        session.playback_rate = config.playback_rate;
        let session_id = session.id;

        let pool = MediaElementPool::new(config.element_pool_size);
        let adapter_ids = Arc::new(AtomicU64::new(0));
        let program = ProgramController::new(
            ProgramRole::Main,
            registry.clone(),
            pool.clone(),
            adapter_ids.clone(),
            ProviderConfig {
                volume: config.volume,
                mute: config.mute,
                playback_rate: config.playback_rate,
                min_dvr_window: config.min_dvr_window,
            },
        );

        let inner = Arc::new_cyclic(|this: &Weak<ControllerInner>| {
            let upstream: Weak<dyn MediaEventSink> = this.clone();
            program.set_upstream(upstream);
            ControllerInner {
                queue: Mutex::new(CommandQueue::new(config.max_queued_commands)),
                config,
                bus,
                registry,
                pool,
                adapter_ids,
                program,
                session: Mutex::new(session),
                control: Mutex::new(ControlState::default()),
                this: this.clone(),
            }
        });
        info!(session = %session_id, "Controller created");
        Ok(Self { inner })
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn element_pool(&self) -> &MediaElementPool {
        &self.inner.pool
    }

    /// Replace the playlist and select its first item
    #[instrument(skip(self, playlist), fields(count = playlist.len()))]
    pub async fn load(&self, playlist: Vec<PlaylistItem>) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.cancel_play();
        self.inner.program.background().clear_next();
        {
            let mut control = self.inner.control.lock();
            control.deferred_complete = false;
            control.pending_viewable = false;
            control.background_key = None;
        }

        let first = {
            let mut session = self.inner.session.lock();
            session.set_playlist(playlist);
            session.playlist.first().cloned()
        };
        let count = self.inner.session.lock().playlist.len();
        self.inner.bus.publish(PlayerEvent::PlaylistLoaded { count });
        info!(count, "Playlist loaded");

        let Some(first) = first else {
            self.inner.session.lock().set_state(PlaybackState::Idle);
            return Ok(());
        };
        let reason = self.inner.autostart_reason(&first);
        self.inner.select_item(0, reason).await
    }

    /// Select an item without starting playback
    pub async fn set_active_item(&self, index: usize) -> Result<()> {
        self.inner.select_item(index, None).await
    }

    /// Select an item and play it
    pub async fn playlist_item(&self, index: usize) -> Result<()> {
        self.inner.select_item(index, Some(Reason::Interaction)).await
    }

    pub async fn next(&self) -> Result<()> {
        let (index, len) = self.inner.position_in_playlist();
        let next = match index {
            Some(i) if i + 1 < len => i + 1,
            Some(_) if self.inner.config.repeat && len > 0 => 0,
            _ => return Err(Error::InvalidItemIndex { index: len, len }),
        };
        self.inner.select_item(next, Some(Reason::Playlist)).await
    }

    pub async fn previous(&self) -> Result<()> {
        let (index, len) = self.inner.position_in_playlist();
        match index {
            Some(i) if i > 0 => self.inner.select_item(i - 1, Some(Reason::Playlist)).await,
            _ => Err(Error::InvalidItemIndex { index: 0, len }),
        }
    }

    /// Start or resume playback.
    ///
    /// Resolves when the provider's attempt settles. A newer operation
    /// cancels a pending attempt, which then resolves to
    /// [`PlayOutcome::Cancelled`] without side effects.
    pub async fn play(&self, reason: Reason) -> Result<PlayOutcome> {
        self.inner.ensure_alive()?;
        if reason != Reason::Instream && self.inner.instream().is_some() {
            return Err(Error::InstreamActive);
        }
        if !self.inner.container_ready() {
            self.inner.enqueue(QueuedCommand::Play(reason));
            return Ok(PlayOutcome::Queued);
        }
        self.inner.play_internal(reason).await
    }

    pub fn pause(&self, reason: Reason) -> Result<()> {
        self.inner.ensure_alive()?;
        if let Some(instream) = self.inner.instream() {
            instream.pause();
            return Ok(());
        }
        if !self.inner.container_ready() {
            self.inner.enqueue(QueuedCommand::Pause(reason));
            return Ok(());
        }
        self.inner.pause_internal(reason);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.ensure_alive()?;
        if !self.inner.container_ready() {
            self.inner.enqueue(QueuedCommand::Stop);
            return Ok(());
        }
        self.inner.cancel_play();
        self.inner.control.lock().deferred_complete = false;
        self.inner.program.stop_video();
        info!("Playback stopped");
        Ok(())
    }

    /// Seek the active item; returns the clamped target
    pub async fn seek(&self, position: f64, reason: Reason) -> Result<f64> {
        self.inner.ensure_alive()?;
        if !self.inner.container_ready() {
            self.inner.enqueue(QueuedCommand::Seek { position, reason });
            return Ok(position);
        }
        let adapter = self.inner.active()?;
        let was_pending = self.inner.cancel_play();
        let from = adapter.model().position;
        let target = adapter.seek(position);
        self.inner.bus.publish(PlayerEvent::Seek {
            position: from,
            offset: target,
            reason,
        });
        debug!(requested = position, target, "Seek");

        if was_pending {
            let resume = self.inner.control.lock().play_reason;
            self.inner.play_internal(resume).await?;
        }
        Ok(target)
    }

    /// Set the volume, clamped to 0..=100. Positive volumes unmute; 0 mutes.
    pub fn set_volume(&self, volume: i32) -> Result<()> {
        self.inner.ensure_alive()?;
        let volume = clamp_volume(volume);
        let mute = volume == 0;
        {
            let mut session = self.inner.session.lock();
            session.set_volume(volume);
            session.set_mute(mute);
            if !mute {
                session.autostart_muted = false;
            }
        }
        self.inner.program.update_provider_config(|config| {
            config.volume = volume;
            config.mute = mute;
        });
        if let Some(adapter) = self.inner.program.active() {
            adapter.set_volume(volume);
            adapter.set_mute(mute);
        }
        Ok(())
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.apply_mute(mute);
        Ok(())
    }

    /// Select a quality level; out-of-range indices leave the state unchanged
    pub fn set_quality(&self, index: usize) -> Result<bool> {
        self.inner.ensure_alive()?;
        Ok(self.inner.active()?.set_quality(index))
    }

    pub fn set_audio_track(&self, index: usize) -> Result<bool> {
        self.inner.ensure_alive()?;
        Ok(self.inner.active()?.set_audio_track(index))
    }

    /// Select a caption track; 0 turns captions off
    pub fn set_captions_track(&self, index: usize) -> Result<bool> {
        self.inner.ensure_alive()?;
        Ok(self.inner.active()?.set_captions_track(index))
    }

    /// Set the playback rate; returns the applied rate
    pub fn set_playback_rate(&self, rate: f64) -> Result<f64> {
        self.inner.ensure_alive()?;
        let stream_type = self.inner.session.lock().stream_type;
        let rate = clamp_playback_rate(rate, stream_type);
        self.inner.apply_playback_rate(rate);
        Ok(rate)
    }

    pub fn set_fullscreen(&self, fullscreen: bool) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.session.lock().set_fullscreen(fullscreen);
        Ok(())
    }

    pub fn set_controls(&self, enabled: bool) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.session.lock().set_controls(enabled);
        Ok(())
    }

    /// Attach the view container and run the commands queued before it existed
    #[instrument(skip(self))]
    pub async fn set_container(&self, container: ContainerHandle) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.control.lock().container = Some(container.clone());
        self.inner.program.set_container(Some(container));

        let commands = self.inner.queue.lock().drain();
        if !commands.is_empty() {
            debug!(count = commands.len(), "Flushing queued commands");
        }
        for command in commands {
            match command {
                QueuedCommand::Play(reason) => {
                    self.play(reason).await?;
                }
                QueuedCommand::Pause(reason) => self.pause(reason)?,
                QueuedCommand::Stop => self.stop()?,
                QueuedCommand::Seek { position, reason } => {
                    self.seek(position, reason).await?;
                }
            }
        }
        Ok(())
    }

    /// Report viewability; starts a viewable-gated autostart
    pub async fn set_viewable(&self, viewable: bool) -> Result<()> {
        self.inner.ensure_alive()?;
        self.inner.session.lock().set_viewable(viewable);
        if !viewable {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.inner.control.lock().pending_viewable);
        if pending {
            self.play(Reason::Viewable).await?;
        }
        Ok(())
    }

    /// Prime every media element; call from inside a user gesture
    pub fn prime_elements(&self) {
        self.inner.pool.prime_all();
        if let Some(adapter) = self.inner.program.active() {
            adapter.prime_element();
        }
    }

    /// Begin an ad session over the main content
    pub fn create_instream(&self) -> Result<InstreamAdapter> {
        self.inner.ensure_alive()?;
        let mut control = self.inner.control.lock();
        if control.instream.is_some() {
            return Err(Error::InstreamActive);
        }
        let instream = InstreamAdapter::new(
            WeakController {
                inner: self.inner.this.clone(),
            },
            self.inner.registry.clone(),
            self.inner.pool.clone(),
            self.inner.adapter_ids.clone(),
            self.inner.bus.clone(),
            self.inner.program.provider_config(),
            self.inner.config.advertising(),
        );
        control.instream = Some(instream.clone());
        Ok(instream)
    }

    /// Hand playback to a cast receiver
    pub async fn cast_video(&self, receiver: Arc<dyn Provider>) -> Result<()> {
        self.inner.ensure_alive()?;
        let (item, was_playing) = {
            let session = self.inner.session.lock();
            let item = session.active_item().cloned().ok_or(Error::NotReady)?;
            let playing = matches!(
                session.state,
                PlaybackState::Playing | PlaybackState::Buffering
            );
            (item, playing)
        };
        if was_playing {
            self.inner.pause_internal(Reason::Cast);
        } else {
            self.inner.cancel_play();
        }
        self.inner.program.cast_video(receiver, item)?;
        self.inner.session.lock().set_cast_active(true);
        self.inner.bus.publish(PlayerEvent::Cast { active: true });

        if was_playing {
            self.inner.play_internal(Reason::Cast).await?;
        }
        Ok(())
    }

    /// Return from a cast receiver to local playback
    pub async fn stop_cast(&self) -> Result<()> {
        self.inner.ensure_alive()?;
        if !self.inner.program.is_casting() {
            return Ok(());
        }
        let was_playing = matches!(
            self.inner.session.lock().state,
            PlaybackState::Playing | PlaybackState::Buffering
        );
        self.inner.cancel_play();
        let local = self.inner.program.stop_cast();
        self.inner.session.lock().set_cast_active(false);
        self.inner.bus.publish(PlayerEvent::Cast { active: false });

        if was_playing && local.is_some() {
            self.inner.play_internal(Reason::Cast).await?;
        }
        Ok(())
    }

    pub fn container(&self) -> Option<ContainerHandle> {
        self.inner.control.lock().container.clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session.lock().id
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.session.lock().state
    }

    pub fn item_index(&self) -> Option<usize> {
        self.inner.session.lock().item_index
    }

    pub fn playlist(&self) -> Vec<PlaylistItem> {
        self.inner.session.lock().playlist.clone()
    }

    pub fn active_item(&self) -> Option<PlaylistItem> {
        self.inner.session.lock().active_item().cloned()
    }

    pub fn volume(&self) -> u8 {
        self.inner.session.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.inner.session.lock().mute
    }

    pub fn is_autostart_muted(&self) -> bool {
        self.inner.session.lock().autostart_muted
    }

    pub fn is_fullscreen(&self) -> bool {
        self.inner.session.lock().fullscreen
    }

    pub fn controls_enabled(&self) -> bool {
        self.inner.session.lock().controls
    }

    pub fn is_casting(&self) -> bool {
        self.inner.session.lock().cast_active
    }

    pub fn stream_type(&self) -> StreamType {
        self.inner.session.lock().stream_type
    }

    pub fn playback_rate(&self) -> f64 {
        self.inner.session.lock().playback_rate
    }

    pub fn instream_active(&self) -> bool {
        self.inner.instream().is_some()
    }

    pub fn active_adapter(&self) -> Option<Arc<MediaAdapter>> {
        self.inner.program.active()
    }

    /// Media-level state of the active adapter
    pub fn media_state(&self) -> MediaState {
        match self.inner.program.active() {
            Some(adapter) => adapter.state(),
            None if self.inner.control.lock().setup_failed => MediaState::Error,
            None => MediaState::default(),
        }
    }

    pub fn position(&self) -> f64 {
        self.inner.media(|m| m.position).unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.inner.media(|m| m.duration).unwrap_or(0.0)
    }

    pub fn quality_levels(&self) -> Vec<QualityLevel> {
        self.inner.media(|m| m.levels.clone()).unwrap_or_default()
    }

    pub fn current_quality(&self) -> usize {
        self.inner.media(|m| m.current_level).unwrap_or(0)
    }

    pub fn audio_tracks(&self) -> Vec<AudioTrack> {
        self.inner.media(|m| m.audio_tracks.clone()).unwrap_or_default()
    }

    pub fn current_audio_track(&self) -> usize {
        self.inner.media(|m| m.current_audio_track).unwrap_or(0)
    }

    /// Caption tracks; index 0 is "off"
    pub fn captions_list(&self) -> Vec<CaptionTrack> {
        self.inner
            .media(|m| m.captions.clone())
            .unwrap_or_else(|| vec![CaptionTrack::off()])
    }

    pub fn captions_index(&self) -> usize {
        self.inner.media(|m| m.captions_index).unwrap_or(0)
    }

    /// Serializable copy of the session and active media state
    pub fn snapshot(&self) -> SessionSnapshot {
        let media = self.inner.program.active().map(|a| a.model());
        let session = self.inner.session.lock();
        SessionSnapshot::capture(&session, media)
    }

    /// Cancel pending work, destroy every adapter and emit `Destroyed`
    pub fn destroy(&self) {
        let instream = {
            let mut control = self.inner.control.lock();
            if control.destroyed {
                return;
            }
            control.destroyed = true;
            if let Some((_, token)) = control.play.take() {
                token.cancel();
            }
            control.instream.take()
        };
        if let Some(instream) = instream {
            instream.abort();
        }
        self.inner.queue.lock().clear();
        self.inner.program.destroy();
        self.inner.bus.publish(PlayerEvent::Destroyed);
        info!("Controller destroyed");
    }

    pub(crate) fn main_program(&self) -> &ProgramController {
        &self.inner.program
    }

    /// Pause main content for an ad break
    pub(crate) fn pause_for_instream(&self) {
        self.inner.pause_internal(Reason::Instream);
    }

    /// Bring main content back after an ad break
    pub(crate) async fn resume_after_instream(
        &self,
        main_state: Option<PlaybackState>,
        resume: bool,
        completed_during_break: bool,
    ) -> Result<()> {
        let deferred = {
            let mut control = self.inner.control.lock();
            control.instream = None;
            std::mem::take(&mut control.deferred_complete)
        };
        if self.inner.ensure_alive().is_err() {
            return Ok(());
        }

        if completed_during_break {
            self.inner.bus.publish(PlayerEvent::Complete);
            return self.inner.advance().await;
        }
        match main_state {
            Some(PlaybackState::Complete) if deferred => self.inner.advance().await,
            Some(PlaybackState::Playing | PlaybackState::Buffering) if resume => {
                self.inner.play_internal(Reason::Instream).await.map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("session", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

impl ControllerInner {
    fn ensure_alive(&self) -> Result<()> {
        if self.control.lock().destroyed {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    fn active(&self) -> Result<Arc<MediaAdapter>> {
        self.program.active().ok_or(Error::NotReady)
    }

    fn media<T>(&self, read: impl FnOnce(&crate::model::MediaModel) -> T) -> Option<T> {
        self.program.active().map(|a| read(&a.model()))
    }

    fn instream(&self) -> Option<InstreamAdapter> {
        self.control.lock().instream.clone()
    }

    fn container_ready(&self) -> bool {
        self.control.lock().container.is_some()
    }

    fn position_in_playlist(&self) -> (Option<usize>, usize) {
        let session = self.session.lock();
        (session.item_index, session.playlist.len())
    }

    fn enqueue(&self, command: QueuedCommand) {
        debug!(?command, "Container not attached, queueing");
        self.queue.lock().push(command);
    }

    /// Start a tracked play attempt, cancelling any pending one
    fn begin_play(&self, reason: Reason) -> (u64, CancellationToken) {
        let mut control = self.control.lock();
        if let Some((_, previous)) = control.play.take() {
            previous.cancel();
        }
        control.play_seq += 1;
        let token = CancellationToken::new();
        control.play = Some((control.play_seq, token.clone()));
        control.play_reason = reason;
        (control.play_seq, token)
    }

    fn end_play(&self, id: u64) {
        let mut control = self.control.lock();
        if matches!(control.play, Some((current, _)) if current == id) {
            control.play = None;
        }
    }

    /// Cancel the pending play attempt; true if one was still running
    fn cancel_play(&self) -> bool {
        let pending = self.control.lock().play.take();
        match pending {
            Some((_, token)) => {
                let running = !token.is_cancelled();
                token.cancel();
                running
            }
            None => false,
        }
    }

    fn play_pending(&self) -> bool {
        self.control
            .lock()
            .play
            .as_ref()
            .map(|(_, token)| !token.is_cancelled())
            .unwrap_or(false)
    }

    fn autostart_reason(&self, item: &PlaylistItem) -> Option<Reason> {
        let mode = match item.autostart {
            Some(true) if self.config.autostart == Autostart::Viewable => Autostart::Viewable,
            Some(true) => Autostart::On,
            Some(false) => Autostart::Off,
            None => self.config.autostart,
        };
        match mode {
            Autostart::Off => None,
            Autostart::On => Some(Reason::Autostart),
            Autostart::Viewable => {
                if self.session.lock().viewable {
                    Some(Reason::Viewable)
                } else {
                    self.control.lock().pending_viewable = true;
                    None
                }
            }
        }
    }

    fn apply_mute(&self, mute: bool) {
        {
            let mut session = self.session.lock();
            session.set_mute(mute);
            if !mute {
                session.autostart_muted = false;
            }
        }
        self.program.update_provider_config(|config| config.mute = mute);
        if let Some(adapter) = self.program.active() {
            adapter.set_mute(mute);
        }
    }

    fn apply_playback_rate(&self, rate: f64) {
        self.session.lock().set_playback_rate(rate);
        self.program
            .update_provider_config(|config| config.playback_rate = rate);
        if let Some(adapter) = self.program.active() {
            adapter.set_playback_rate(rate);
        }
    }

    fn pause_internal(&self, reason: Reason) {
        {
            let mut control = self.control.lock();
            control.pending_viewable = false;
            control.pause_reason = reason;
        }
        self.cancel_play();
        if let Some(adapter) = self.program.active() {
            adapter.pause();
        }
    }

    /// Select `index` and optionally play it. Setup failures skip forward.
    fn select_item(
        self: &Arc<Self>,
        index: usize,
        play: Option<Reason>,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.ensure_alive()?;
            let item = {
                let session = this.session.lock();
                session
                    .playlist
                    .get(index)
                    .cloned()
                    .ok_or(Error::InvalidItemIndex {
                        index,
                        len: session.playlist.len(),
                    })?
            };

            this.cancel_play();
            {
                let mut control = this.control.lock();
                control.deferred_complete = false;
                control.background_key = None;
                control.setup_failed = false;
            }
            {
                let mut session = this.session.lock();
                session.set_item_index(index);
                session.set_state(PlaybackState::Idle);
            }
            // a repeat wrap reselects the same index and still announces it
            this.bus.publish(PlayerEvent::PlaylistItem {
                index,
                title: item.title.clone(),
            });
            info!(index, item = %item.describe(), "Item selected");

            if let Some(mute) = item.mute {
                this.apply_mute(mute);
            }

            match this.program.set_active_item(item).await {
                Ok(_) => this.session.lock().setup_failures = 0,
                Err(Error::Cancelled) => {
                    debug!(index, "Item selection superseded");
                    return Ok(());
                }
                Err(e) if e.is_setup_error() => return this.on_setup_error(index, e, play).await,
                Err(e) => return Err(e),
            }

            if let Some(reason) = play {
                if this.container_ready() {
                    this.play_internal(reason).await?;
                } else {
                    this.enqueue(QueuedCommand::Play(reason));
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn on_setup_error(
        self: &Arc<Self>,
        index: usize,
        error: Error,
        play: Option<Reason>,
    ) -> Result<()> {
        warn!(index, error = %error, "Item setup failed");
        let (failures, len) = {
            let mut session = self.session.lock();
            session.setup_failures += 1;
            session.set_state(PlaybackState::Error);
            (session.setup_failures, session.playlist.len())
        };
        self.program.release_active();
        self.control.lock().setup_failed = true;
        self.bus.publish(ModelChange::MediaState(MediaState::Error));
        self.bus.publish(ModelChange::Position(0.0));
        self.bus.publish(ModelChange::Duration(0.0));
        self.bus.publish(PlayerEvent::SetupError(error.to_payload(true)));

        if failures <= self.config.max_setup_skips && index + 1 < len {
            info!(from = index, to = index + 1, failures, "Skipping to next item");
            return self.select_item(index + 1, play).await;
        }
        Err(error)
    }

    /// Move on after the active item completed
    fn advance(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            let (index, len) = this.position_in_playlist();
            let Some(index) = index else {
                return Ok(());
            };
            let next = if index + 1 < len {
                Some(index + 1)
            } else if this.config.repeat && len > 0 {
                Some(0)
            } else {
                None
            };
            match next {
                Some(next) => this.select_item(next, Some(Reason::Playlist)).await,
                None => {
                    info!("Playlist complete");
                    this.bus.publish(PlayerEvent::PlaylistComplete);
                    Ok(())
                }
            }
        }
        .boxed()
    }

    async fn play_internal(self: &Arc<Self>, reason: Reason) -> Result<PlayOutcome> {
        let adapter = self.active()?;
        if adapter.state().is_playing_or_buffering() && !self.play_pending() {
            return Ok(PlayOutcome::Started);
        }
        self.control.lock().pending_viewable = false;
        self.bus.publish(PlayerEvent::PlayAttempt { reason });

        let (id, token) = self.begin_play(reason);
        let outcome = adapter.play(&token).await;
        self.end_play(id);

        match outcome {
            PlayOutcome::Rejected(rejection) => {
                self.on_play_rejected(&adapter, reason, rejection).await
            }
            other => Ok(other),
        }
    }

    async fn on_play_rejected(
        self: &Arc<Self>,
        adapter: &Arc<MediaAdapter>,
        reason: Reason,
        rejection: PlayRejection,
    ) -> Result<PlayOutcome> {
        let fallback = if adapter.model().started {
            PlaybackState::Paused
        } else {
            PlaybackState::Idle
        };

        if !reason.is_automatic() {
            self.session.lock().set_state(fallback);
            self.bus
                .publish(PlayerEvent::PlayRejected { reason, rejection });
            return Ok(PlayOutcome::Rejected(rejection));
        }

        let already_muted = self.session.lock().mute;
        if already_muted {
            self.autostart_failed(rejection, fallback);
            return Ok(PlayOutcome::Rejected(rejection));
        }

        info!(%rejection, "Autostart blocked, retrying muted");
        self.apply_mute(true);
        self.session.lock().autostart_muted = true;
        self.bus.publish(PlayerEvent::AutostartMuted);

        let (id, token) = self.begin_play(reason);
        let retry = adapter.play(&token).await;
        self.end_play(id);

        match retry {
            PlayOutcome::Rejected(second) => {
                self.autostart_failed(second, fallback);
                Ok(PlayOutcome::Rejected(second))
            }
            other => Ok(other),
        }
    }

    fn autostart_failed(&self, rejection: PlayRejection, fallback: PlaybackState) {
        warn!(%rejection, "Autostart not allowed");
        self.session.lock().set_state(fallback);
        self.bus
            .publish(PlayerEvent::AutostartNotAllowed { rejection });
    }

    fn on_media_state(&self, state: MediaState) {
        self.bus.publish(ModelChange::MediaState(state));
        if state == MediaState::Loaded && self.play_pending() {
            return;
        }

        let target = state.playback_state();
        let (changed, old) = {
            let mut session = self.session.lock();
            let old = session.state;
            (session.set_state(target), old)
        };
        if !changed {
            return;
        }

        let (play_reason, pause_reason) = {
            let control = self.control.lock();
            (control.play_reason, control.pause_reason)
        };
        match target {
            PlaybackState::Playing => {
                self.bus.publish(PlayerEvent::Play {
                    reason: play_reason,
                    old_state: old,
                });
                self.request_background_load();
            }
            PlaybackState::Paused => self.bus.publish(PlayerEvent::Pause {
                reason: pause_reason,
            }),
            PlaybackState::Buffering => self.bus.publish(PlayerEvent::Buffer { old_state: old }),
            PlaybackState::Idle => self.bus.publish(PlayerEvent::Idle),
            PlaybackState::Complete | PlaybackState::Error => {}
        }
    }

    /// Preload the item after the active one, once per item
    fn request_background_load(&self) {
        if !self.config.background_loading {
            return;
        }
        let Some(generation) = self.program.active().map(|a| a.generation()) else {
            return;
        };
        let next = {
            let session = self.session.lock();
            let Some(index) = session.item_index else {
                return;
            };
            let len = session.playlist.len();
            let next = if index + 1 < len {
                index + 1
            } else if self.config.repeat && len > 1 {
                0
            } else {
                return;
            };
            (index, session.playlist[next].clone())
        };

        let (index, item) = next;
        {
            let mut control = self.control.lock();
            if control.background_key == Some((index, generation)) {
                return;
            }
            control.background_key = Some((index, generation));
        }
        debug!(item = %item.describe(), "Requesting background load");
        self.program.background_load(item);
    }

    fn on_complete(&self) {
        self.bus.publish(PlayerEvent::Complete);
        if self.config.advertising().postroll {
            debug!("Holding completion for postroll");
            self.control.lock().deferred_complete = true;
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.advance().await {
                warn!(error = %e, "Playlist advance failed");
            }
        });
    }
}

impl MediaEventSink for ControllerInner {
    fn on_media_event(&self, _adapter: AdapterId, event: MediaEvent) {
        if self.control.lock().destroyed {
            return;
        }
        match event {
            MediaEvent::State { new, .. } => self.on_media_state(new),
            MediaEvent::Time { position, duration } => {
                self.bus.publish(ModelChange::Position(position));
                self.bus.publish(PlayerEvent::Time { position, duration });
            }
            MediaEvent::Duration(duration) => self.bus.publish(ModelChange::Duration(duration)),
            MediaEvent::StreamType(stream_type) => {
                let force_rate = {
                    let mut session = self.session.lock();
                    session.set_stream_type(stream_type);
                    stream_type == StreamType::Live && session.playback_rate != 1.0
                };
                if force_rate {
                    self.apply_playback_rate(1.0);
                }
            }
            MediaEvent::Buffer(percent) => self.bus.publish(ModelChange::Buffer(percent)),
            MediaEvent::FirstFrame => self.bus.publish(PlayerEvent::FirstFrame),
            MediaEvent::Seeked => self.bus.publish(PlayerEvent::Seeked),
            MediaEvent::Complete => self.on_complete(),
            MediaEvent::Levels { levels, current } => {
                self.bus.publish(PlayerEvent::LevelsChanged { levels, current })
            }
            MediaEvent::LevelChanged(index) => self.bus.publish(ModelChange::CurrentLevel(index)),
            MediaEvent::AudioTracks { tracks, current } => {
                self.bus
                    .publish(PlayerEvent::AudioTracksChanged { tracks, current })
            }
            MediaEvent::AudioTrackChanged(index) => {
                self.bus.publish(ModelChange::CurrentAudioTrack(index))
            }
            MediaEvent::Captions { tracks, current } => {
                self.bus
                    .publish(PlayerEvent::CaptionsListChanged { tracks, current })
            }
            MediaEvent::CaptionsChanged(index) => {
                self.bus.publish(ModelChange::CaptionsIndex(index))
            }
            MediaEvent::Error(error) => {
                warn!(error = %error, "Playback error");
                self.bus.publish(PlayerEvent::Error(error.to_payload(true)));
            }
        }
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::provider::simulated::{AutoplayPolicy, SimulatedBackends, SimulationProfile};

    fn controller(config: ControllerConfig, profile: SimulationProfile) -> Controller {
        let registry = Arc::new(ProviderRegistry::new());
        SimulatedBackends::register(&registry, profile);
        Controller::new(config, registry).unwrap()
    }

    fn playlist() -> Vec<PlaylistItem> {
        vec![
            PlaylistItem::from_url("https://cdn.example.com/a.mp4")
                .unwrap()
                .with_title("A")
                .with_duration(20.0),
            PlaylistItem::from_url("https://cdn.example.com/b.mp4")
                .unwrap()
                .with_title("B")
                .with_duration(10.0),
        ]
    }

    fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_wait_for_container() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        player.load(playlist()).await.unwrap();

        let outcome = player.play(Reason::External).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Queued);
        assert_eq!(player.state(), PlaybackState::Idle);

        player.set_container(ContainerHandle::new("player")).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_events() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        let mut rx = player.subscribe();
        player.load(playlist()).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&PlayerEvent::PlaylistLoaded { count: 2 }));
        assert!(events.contains(&PlayerEvent::PlaylistItem {
            index: 0,
            title: Some("A".into())
        }));
        assert_eq!(player.item_index(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_clamped_and_unmutes() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        player.set_mute(true).unwrap();
        player.set_volume(150).unwrap();
        assert_eq!(player.volume(), 100);
        assert!(!player.is_muted());

        player.set_volume(-3).unwrap();
        assert_eq!(player.volume(), 0);
        assert!(player.is_muted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autostart_retries_muted() {
        let config = ControllerConfig {
            autostart: Autostart::On,
            ..Default::default()
        };
        let profile = SimulationProfile {
            autoplay: AutoplayPolicy::MutedOnly,
            ..Default::default()
        };
        let player = controller(config, profile);
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        let mut rx = player.subscribe();

        player.load(playlist()).await.unwrap();

        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.is_muted());
        assert!(player.is_autostart_muted());
        assert!(drain(&mut rx).contains(&PlayerEvent::AutostartMuted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autostart_not_allowed() {
        let config = ControllerConfig {
            autostart: Autostart::On,
            ..Default::default()
        };
        let profile = SimulationProfile {
            autoplay: AutoplayPolicy::Deny,
            ..Default::default()
        };
        let player = controller(config, profile);
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        let mut rx = player.subscribe();

        player.load(playlist()).await.unwrap();

        assert_eq!(player.state(), PlaybackState::Idle);
        let events = drain(&mut rx);
        assert!(events.contains(&PlayerEvent::AutostartMuted));
        assert!(events.contains(&PlayerEvent::AutostartNotAllowed {
            rejection: PlayRejection::Blocked
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interaction_rejection_not_retried() {
        let profile = SimulationProfile {
            autoplay: AutoplayPolicy::MutedOnly,
            ..Default::default()
        };
        let player = controller(ControllerConfig::default(), profile);
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        player.load(playlist()).await.unwrap();
        let mut rx = player.subscribe();

        let outcome = player.play(Reason::Interaction).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Rejected(PlayRejection::NotAllowed));
        assert!(!player.is_muted());
        assert!(drain(&mut rx).contains(&PlayerEvent::PlayRejected {
            reason: Reason::Interaction,
            rejection: PlayRejection::NotAllowed
        }));

        player.prime_elements();
        let outcome = player.play(Reason::Interaction).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewable_autostart() {
        let config = ControllerConfig {
            autostart: Autostart::Viewable,
            ..Default::default()
        };
        let player = controller(config, SimulationProfile::default());
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        player.load(playlist()).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Idle);

        player.set_viewable(true).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_error_skips_item() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        let mut rx = player.subscribe();
        let mut items = playlist();
        items.insert(
            0,
            PlaylistItem::from_url("https://cdn.example.com/a.xyz").unwrap(),
        );

        player.load(items).await.unwrap();

        assert_eq!(player.item_index(), Some(1));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PlayerEvent::SetupError(p) if p.key == "NO_PROVIDER")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stream_forces_rate() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        player
            .load(vec![PlaylistItem::from_url("https://cdn.example.com/live.m3u8")
                .unwrap()
                .with_duration(f64::INFINITY)])
            .await
            .unwrap();
        player.play(Reason::Interaction).await.unwrap();

        assert_eq!(player.stream_type(), StreamType::Live);
        assert_eq!(player.set_playback_rate(2.0).unwrap(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_rejects_operations() {
        let player = controller(ControllerConfig::default(), SimulationProfile::default());
        let mut rx = player.subscribe();
        player.destroy();

        assert_eq!(player.load(playlist()).await, Err(Error::NotReady));
        assert_eq!(player.set_volume(10), Err(Error::NotReady));
        assert!(drain(&mut rx).contains(&PlayerEvent::Destroyed));
    }
}
