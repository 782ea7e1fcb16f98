//! Media adapter
//!
//! Binds one provider instance to one [`MediaModel`] and at most one media
//! element. Provider events are folded into the model and re-emitted as
//! [`MediaEvent`]s to whatever owns the adapter.

use crate::{
    element::{ContainerHandle, MediaElement, MediaElementPool},
    error::PlayRejection,
    item::PlaylistItem,
    model::MediaModel,
    provider::{Provider, ProviderEvent, ProviderEventSink, ProviderKind},
    types::*,
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Events held while an adapter sits in the background
const MAX_QUEUED_EVENTS: usize = 128;

/// Normalized media event
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    State { old: MediaState, new: MediaState },
    Time { position: f64, duration: f64 },
    Duration(f64),
    StreamType(StreamType),
    Buffer(f64),
    FirstFrame,
    Seeked,
    Complete,
    Levels { levels: Vec<QualityLevel>, current: usize },
    LevelChanged(usize),
    AudioTracks { tracks: Vec<AudioTrack>, current: usize },
    AudioTrackChanged(usize),
    /// Caption tracks including the "off" entry at index 0
    Captions { tracks: Vec<CaptionTrack>, current: usize },
    CaptionsChanged(usize),
    Error(Error),
}

/// Receiver of adapter events
pub trait MediaEventSink: Send + Sync {
    fn on_media_event(&self, adapter: AdapterId, event: MediaEvent);
}

/// How a play attempt settled
#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Started,
    /// Superseded by a newer operation; no effects were applied
    Cancelled,
    Rejected(PlayRejection),
    Failed(Error),
    /// Held until the container is attached
    Queued,
}

impl PlayOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, PlayOutcome::Started)
    }
}

#[derive(Debug)]
struct AdapterInner {
    model: MediaModel,
    item: Option<PlaylistItem>,
    element: Option<MediaElement>,
    container: Option<ContainerHandle>,
    attached: bool,
    background: bool,
    deferred_complete: bool,
    queued: VecDeque<MediaEvent>,
    then_play: Option<CancellationToken>,
    /// Generation the provider finished loading
    loaded_generation: Option<u64>,
    pending_seek: Option<f64>,
    recovery_attempted: bool,
    destroyed: bool,
}

impl AdapterInner {
    fn transition(&mut self, state: MediaState, out: &mut Vec<MediaEvent>) {
        let old = self.model.state;
        if self.model.set_state(state) {
            out.push(MediaEvent::State { old, new: state });
        }
    }

    fn force(&mut self, state: MediaState, out: &mut Vec<MediaEvent>) {
        let old = self.model.state;
        if self.model.force_state(state) {
            out.push(MediaEvent::State { old, new: state });
        }
    }

    fn is_setup(&self) -> bool {
        self.loaded_generation == Some(self.model.generation)
    }

    fn cancel_then_play(&mut self) {
        if let Some(token) = self.then_play.take() {
            token.cancel();
        }
    }
}

/// Work the adapter must do after releasing its lock
enum FollowUp {
    Seek(f64),
    Recover(Error),
}

pub struct MediaAdapter {
    id: AdapterId,
    provider: Arc<dyn Provider>,
    pool: MediaElementPool,
    min_dvr_window: f64,
    sink: RwLock<Option<Weak<dyn MediaEventSink>>>,
    inner: Mutex<AdapterInner>,
}

impl MediaAdapter {
    /// Wrap a provider and bind its event callback
    pub fn new(
        id: AdapterId,
        provider: Arc<dyn Provider>,
        pool: MediaElementPool,
        min_dvr_window: f64,
    ) -> Arc<Self> {
        let adapter = Arc::new(Self {
            id,
            provider,
            pool,
            min_dvr_window,
            sink: RwLock::new(None),
            inner: Mutex::new(AdapterInner {
                model: MediaModel::new(),
                item: None,
                element: None,
                container: None,
                attached: false,
                background: false,
                deferred_complete: false,
                queued: VecDeque::new(),
                then_play: None,
                loaded_generation: None,
                pending_seek: None,
                recovery_attempted: false,
                destroyed: false,
            }),
        });

        let weak = Arc::downgrade(&adapter);
        adapter
            .provider
            .bind_events(ProviderEventSink::new(move |event| {
                if let Some(adapter) = weak.upgrade() {
                    adapter.on_provider_event(event);
                }
            }));
        debug!(adapter = %id, provider = adapter.provider.name(), "Created media adapter");
        adapter
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Route normalized events to `sink`
    pub fn set_sink(&self, sink: Weak<dyn MediaEventSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn model(&self) -> MediaModel {
        self.inner.lock().model.clone()
    }

    pub fn state(&self) -> MediaState {
        self.inner.lock().model.state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().model.generation
    }

    pub fn item(&self) -> Option<PlaylistItem> {
        self.inner.lock().item.clone()
    }

    /// The provider has finished loading the current item
    pub fn is_setup(&self) -> bool {
        self.inner.lock().is_setup()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    pub fn is_background(&self) -> bool {
        self.inner.lock().background
    }

    pub fn has_element(&self) -> bool {
        self.inner.lock().element.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Point the adapter at a new item, resetting its model
    pub fn set_item(&self, item: PlaylistItem) {
        let mut inner = self.inner.lock();
        inner.cancel_then_play();
        inner.model.reset();
        inner.pending_seek = None;
        inner.loaded_generation = None;
        inner.deferred_complete = false;
        inner.recovery_attempted = false;
        inner.queued.clear();
        info!(adapter = %self.id, item = %item.describe(), generation = inner.model.generation, "Item set");
        inner.item = Some(item);
    }

    /// Load the current item into the provider unless it is already loaded
    #[instrument(skip(self, token), fields(adapter = %self.id))]
    pub async fn load(&self, token: &CancellationToken) -> Result<()> {
        let mut out = Vec::new();
        let (item, generation) = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(Error::Cancelled);
            }
            let item = inner
                .item
                .clone()
                .ok_or_else(|| Error::Internal("adapter has no item".into()))?;
            if inner.is_setup() {
                return Ok(());
            }
            inner.force(MediaState::Loading, &mut out);
            (item, inner.model.generation)
        };
        self.dispatch(out);

        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = self.provider.load(&item) => result,
        };

        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.model.generation != generation || token.is_cancelled() {
                debug!(adapter = %self.id, generation, "Dropping stale load result");
                return Err(Error::Cancelled);
            }
            match &result {
                Ok(()) => {
                    inner.loaded_generation = Some(generation);
                    inner.model.setup = true;
                    if inner.model.state == MediaState::Loading {
                        inner.transition(MediaState::Loaded, &mut out);
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(adapter = %self.id, error = %e, "Load failed");
                    inner.transition(MediaState::Error, &mut out);
                    out.push(MediaEvent::Error(e.clone()));
                }
            }
        }
        self.dispatch(out);
        result
    }

    /// Load the current item without starting playback
    pub async fn preload(&self, token: &CancellationToken) -> Result<()> {
        self.load(token).await
    }

    /// Load if needed, then play.
    ///
    /// The chain is tracked as the adapter's then-play token, so `stop`,
    /// `pause` or a new item cancels it before it touches the model.
    #[instrument(skip(self, token), fields(adapter = %self.id))]
    pub async fn play(&self, token: &CancellationToken) -> PlayOutcome {
        let chain = token.child_token();
        let generation = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return PlayOutcome::Cancelled;
            }
            inner.cancel_then_play();
            inner.then_play = Some(chain.clone());
            inner.model.generation
        };

        match self.load(&chain).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return PlayOutcome::Cancelled,
            Err(e) => return PlayOutcome::Failed(e),
        }
        if chain.is_cancelled() {
            return PlayOutcome::Cancelled;
        }

        let result = tokio::select! {
            _ = chain.cancelled() => return PlayOutcome::Cancelled,
            result = self.provider.play() => result,
        };

        let mut out = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.model.generation != generation || chain.is_cancelled() {
                debug!(adapter = %self.id, generation, "Dropping stale play result");
                return PlayOutcome::Cancelled;
            }
            inner.then_play = None;
            match result {
                Ok(()) => {
                    if !inner.model.state.is_playing_or_buffering() {
                        inner.transition(MediaState::Started, &mut out);
                    }
                    PlayOutcome::Started
                }
                Err(Error::PlayRejected(rejection)) => {
                    debug!(adapter = %self.id, %rejection, "Play rejected");
                    PlayOutcome::Rejected(rejection)
                }
                Err(Error::Cancelled) => PlayOutcome::Cancelled,
                Err(e) => {
                    warn!(adapter = %self.id, error = %e, "Play failed");
                    inner.transition(MediaState::Error, &mut out);
                    out.push(MediaEvent::Error(e.clone()));
                    PlayOutcome::Failed(e)
                }
            }
        };
        self.dispatch(out);
        outcome
    }

    pub fn pause(&self) {
        self.inner.lock().cancel_then_play();
        self.provider.pause();

        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.model.state,
                MediaState::Loading | MediaState::Started | MediaState::Buffering
            ) {
                inner.transition(MediaState::Paused, &mut out);
            }
        }
        self.dispatch(out);
    }

    pub fn stop(&self) {
        self.inner.lock().cancel_then_play();
        self.provider.stop();

        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.loaded_generation = None;
            inner.model.setup = false;
            inner.model.set_position(0.0);
            inner.force(MediaState::Idle, &mut out);
        }
        self.dispatch(out);
    }

    /// Clamp and apply a seek, or hold it until the item has a duration
    pub fn seek(&self, target: f64) -> f64 {
        let (position, ready) = {
            let mut inner = self.inner.lock();
            let position = inner.model.clamp_seek(target);
            let ready = inner.is_setup() && inner.model.duration != 0.0;
            if !ready {
                inner.pending_seek = Some(target);
            }
            (position, ready)
        };
        if ready {
            self.provider.seek(position);
        }
        position
    }

    /// Mark the element as gesture-primed
    pub fn prime_element(&self) {
        let element = {
            let mut inner = self.inner.lock();
            if let Some(element) = inner.element.as_mut() {
                element.prime();
            }
            if !inner.attached {
                return;
            }
            inner.element.take()
        };
        // rebind so the provider sees the primed element
        if let Some(mut element) = element {
            self.provider.attach_media(&mut element);
            self.inner.lock().element = Some(element);
        }
    }

    /// Bind the provider to the element and replay a deferred completion
    pub fn attach(&self) {
        let element = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.attached = true;
            inner.element.take()
        };
        if let Some(mut element) = element {
            self.provider.attach_media(&mut element);
            self.inner.lock().element = Some(element);
        }

        let replay = std::mem::take(&mut self.inner.lock().deferred_complete);
        if replay {
            debug!(adapter = %self.id, "Replaying deferred completion");
            self.dispatch(vec![MediaEvent::Complete]);
        }
    }

    /// Release the element binding while keeping position and model
    pub fn detach(&self) {
        self.provider.detach_media();
        self.inner.lock().attached = false;
    }

    /// Hand the element out, detaching first
    pub fn take_element(&self) -> Option<MediaElement> {
        self.detach();
        self.inner.lock().element.take()
    }

    /// Give the adapter an element; it is bound on the next `attach`
    pub fn put_element(&self, element: MediaElement) {
        let previous = self.inner.lock().element.replace(element);
        if let Some(previous) = previous {
            self.pool.recycle(previous);
        }
    }

    /// Move into or out of the background.
    ///
    /// In the background the element binding is dropped and events are held.
    /// Leaving it rebinds the element and flushes the held events in order.
    pub fn set_background(&self, background: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.background == background {
                return;
            }
            inner.background = background;
        }
        if background {
            self.detach();
        } else {
            let queued: Vec<MediaEvent> = self.inner.lock().queued.drain(..).collect();
            debug!(adapter = %self.id, flushed = queued.len(), "Leaving background");
            self.dispatch(queued);
            self.attach();
        }
    }

    pub fn set_container(&self, container: Option<ContainerHandle>) {
        self.inner.lock().container = container.clone();
        self.provider.set_container(container);
    }

    pub fn set_volume(&self, volume: u8) {
        self.provider.set_volume(volume);
    }

    pub fn set_mute(&self, mute: bool) {
        self.provider.set_mute(mute);
    }

    /// Select a quality level. Out-of-range indices are ignored.
    pub fn set_quality(&self, index: usize) -> bool {
        {
            let mut inner = self.inner.lock();
            if index >= inner.model.levels.len() {
                debug!(adapter = %self.id, index, "Ignoring out-of-range quality");
                return false;
            }
            if inner.model.current_level == index {
                return true;
            }
            inner.model.current_level = index;
        }
        self.dispatch(vec![MediaEvent::LevelChanged(index)]);
        self.provider.set_current_quality(index);
        true
    }

    /// Select an audio track. Out-of-range indices are ignored.
    pub fn set_audio_track(&self, index: usize) -> bool {
        {
            let mut inner = self.inner.lock();
            if index >= inner.model.audio_tracks.len() {
                return false;
            }
            if inner.model.current_audio_track == index {
                return true;
            }
            inner.model.current_audio_track = index;
        }
        self.dispatch(vec![MediaEvent::AudioTrackChanged(index)]);
        self.provider.set_current_audio_track(index);
        true
    }

    /// Select a caption track; 0 turns captions off
    pub fn set_captions_track(&self, index: usize) -> bool {
        {
            let mut inner = self.inner.lock();
            if index >= inner.model.captions.len() {
                return false;
            }
            if inner.model.captions_index == index {
                return true;
            }
            inner.model.captions_index = index;
        }
        self.dispatch(vec![MediaEvent::CaptionsChanged(index)]);
        self.provider.set_subtitles_track(index);
        true
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.inner.lock().model.playback_rate = rate;
        self.provider.set_playback_rate(rate);
    }

    /// Tear down the provider and return the element to the pool
    pub fn destroy(&self) {
        let element = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.cancel_then_play();
            inner.queued.clear();
            inner.attached = false;
            inner.element.take()
        };
        self.provider.destroy();
        if let Some(element) = element {
            self.pool.recycle(element);
        }
        debug!(adapter = %self.id, "Destroyed media adapter");
    }

    fn on_provider_event(&self, event: ProviderEvent) {
        let mut out = Vec::new();
        let mut follow_up = None;
        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            match event {
                ProviderEvent::Loaded => {
                    inner.model.setup = true;
                    if inner.model.state == MediaState::Loading {
                        inner.transition(MediaState::Loaded, &mut out);
                    }
                }
                ProviderEvent::Duration(duration) => {
                    if inner.model.set_duration(duration, self.min_dvr_window) {
                        out.push(MediaEvent::Duration(duration));
                        out.push(MediaEvent::StreamType(inner.model.stream_type));
                    }
                    follow_up = Self::initial_seek(&mut inner).map(FollowUp::Seek);
                }
                ProviderEvent::Time { position, duration } => {
                    if duration != inner.model.duration
                        && inner.model.set_duration(duration, self.min_dvr_window)
                    {
                        out.push(MediaEvent::Duration(duration));
                    }
                    inner.model.set_position(position);
                    out.push(MediaEvent::Time { position, duration });
                }
                ProviderEvent::Buffer(percent) => {
                    if inner.model.set_buffer(percent) {
                        out.push(MediaEvent::Buffer(inner.model.buffer));
                    }
                }
                ProviderEvent::Playing => inner.transition(MediaState::Playing, &mut out),
                ProviderEvent::Paused => inner.transition(MediaState::Paused, &mut out),
                ProviderEvent::Buffering => inner.transition(MediaState::Buffering, &mut out),
                ProviderEvent::FirstFrame => {
                    if !inner.model.started {
                        inner.model.started = true;
                        out.push(MediaEvent::FirstFrame);
                    }
                }
                ProviderEvent::Seeked => out.push(MediaEvent::Seeked),
                ProviderEvent::Complete => {
                    inner.transition(MediaState::Complete, &mut out);
                    if inner.attached && !inner.background {
                        out.push(MediaEvent::Complete);
                    } else {
                        debug!(adapter = %self.id, "Deferring completion while detached");
                        inner.deferred_complete = true;
                    }
                }
                ProviderEvent::Levels { levels, current } => {
                    let current = current.min(levels.len().saturating_sub(1));
                    inner.model.levels = levels.clone();
                    inner.model.current_level = current;
                    out.push(MediaEvent::Levels { levels, current });
                }
                ProviderEvent::LevelChanged(index) => {
                    if index < inner.model.levels.len() && inner.model.current_level != index {
                        inner.model.current_level = index;
                        out.push(MediaEvent::LevelChanged(index));
                    }
                }
                ProviderEvent::AudioTracks { tracks, current } => {
                    inner.model.audio_tracks = tracks.clone();
                    inner.model.current_audio_track = current;
                    out.push(MediaEvent::AudioTracks { tracks, current });
                }
                ProviderEvent::AudioTrackChanged(index) => {
                    if index < inner.model.audio_tracks.len()
                        && inner.model.current_audio_track != index
                    {
                        inner.model.current_audio_track = index;
                        out.push(MediaEvent::AudioTrackChanged(index));
                    }
                }
                ProviderEvent::Subtitles { tracks, current } => {
                    let mut captions = Vec::with_capacity(tracks.len() + 1);
                    captions.push(CaptionTrack::off());
                    captions.extend(tracks);
                    let current = if current < captions.len() { current } else { 0 };
                    inner.model.captions = captions.clone();
                    inner.model.captions_index = current;
                    out.push(MediaEvent::Captions {
                        tracks: captions,
                        current,
                    });
                }
                ProviderEvent::Error(error) => {
                    if inner.recovery_attempted {
                        inner.transition(MediaState::Error, &mut out);
                        out.push(MediaEvent::Error(error));
                    } else {
                        inner.recovery_attempted = true;
                        follow_up = Some(FollowUp::Recover(error));
                    }
                }
            }
        }

        self.dispatch(out);

        match follow_up {
            Some(FollowUp::Seek(position)) => self.provider.seek(position),
            Some(FollowUp::Recover(error)) => {
                if self.provider.try_recover(&error) {
                    info!(adapter = %self.id, %error, "Provider recovered");
                } else {
                    let mut out = Vec::new();
                    {
                        let mut inner = self.inner.lock();
                        inner.transition(MediaState::Error, &mut out);
                    }
                    out.push(MediaEvent::Error(error));
                    self.dispatch(out);
                }
            }
            None => {}
        }
    }

    /// Seek to apply once a duration is known: a pending seek, else the item's start time
    fn initial_seek(inner: &mut AdapterInner) -> Option<f64> {
        if let Some(target) = inner.pending_seek.take() {
            inner.model.start_applied = true;
            return Some(inner.model.clamp_seek(target));
        }
        if inner.model.start_applied {
            return None;
        }
        inner.model.start_applied = true;
        let start = inner.item.as_ref()?.start_time?;
        (start > 0.0).then(|| inner.model.clamp_seek(start))
    }

    fn dispatch(&self, events: Vec<MediaEvent>) {
        if events.is_empty() {
            return;
        }
        let events = {
            let mut inner = self.inner.lock();
            if inner.background {
                for event in events {
                    if inner.queued.len() >= MAX_QUEUED_EVENTS {
                        inner.queued.pop_front();
                    }
                    inner.queued.push_back(event);
                }
                return;
            }
            events
        };
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            for event in events {
                sink.on_media_event(self.id, event);
            }
        }
    }
}

impl std::fmt::Debug for MediaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAdapter")
            .field("id", &self.id)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}
