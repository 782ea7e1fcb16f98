//! Simulated provider
//!
//! Plays items against a virtual clock driven by tokio timers, so it runs
//! deterministically under `tokio::time::pause()` in tests and in the CLI.
//! It reports the same events a real backend would and can be configured to
//! refuse autoplay, fail loading, or fail mid-playback.

use super::{
    Playable, Provider, ProviderConfig, ProviderDescriptor, ProviderEvent, ProviderEventSink,
    ProviderFactory, ProviderKind, ProviderLoader, ProviderRegistry, Seekable, VolumeControllable,
};
use crate::{
    element::{ContainerHandle, MediaElement},
    error::PlayRejection,
    item::PlaylistItem,
    types::*,
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How the simulated host treats play attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoplayPolicy {
    /// Every attempt succeeds
    #[default]
    Allow,
    /// Unmuted playback needs a primed element
    MutedOnly,
    /// Playback needs a primed element, muted or not
    Deny,
}

/// Behaviour of the simulated backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    /// Time spent loading an item
    pub load_delay_ms: u64,
    /// Clock granularity; one `Time` event per tick
    pub tick_ms: u64,
    /// Duration used when an item does not advertise one
    pub default_duration: f64,
    pub levels: Vec<QualityLevel>,
    pub audio_tracks: Vec<AudioTrack>,
    pub captions: Vec<CaptionTrack>,
    pub autoplay: AutoplayPolicy,
    /// Every load fails
    pub fail_load: bool,
    /// Playback fails once this position is reached
    pub fail_at: Option<f64>,
    /// `try_recover` succeeds once per item
    pub recoverable: bool,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            load_delay_ms: 100,
            tick_ms: 250,
            default_duration: 30.0,
            levels: vec![
                QualityLevel {
                    label: "360p".into(),
                    bitrate: Some(800_000),
                    width: Some(640),
                    height: Some(360),
                },
                QualityLevel {
                    label: "720p".into(),
                    bitrate: Some(2_500_000),
                    width: Some(1280),
                    height: Some(720),
                },
                QualityLevel {
                    label: "1080p".into(),
                    bitrate: Some(5_000_000),
                    width: Some(1920),
                    height: Some(1080),
                },
            ],
            audio_tracks: vec![AudioTrack {
                name: "English".into(),
                language: Some("en".into()),
                default: true,
            }],
            captions: vec![CaptionTrack {
                id: "en".into(),
                label: "English".into(),
                language: Some("en".into()),
            }],
            autoplay: AutoplayPolicy::Allow,
            fail_load: false,
            fail_at: None,
            recoverable: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    item: Option<PlaylistItem>,
    load_seq: u64,
    loaded: bool,
    position: f64,
    duration: f64,
    playing: bool,
    first_frame: bool,
    attached: bool,
    primed: bool,
    volume: u8,
    mute: bool,
    rate: f64,
    level: usize,
    audio_track: usize,
    subtitles: usize,
    recovered: bool,
    failed: bool,
    ticker: Option<CancellationToken>,
    destroyed: bool,
}

impl SimState {
    fn stop_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    fn is_bounded(&self) -> bool {
        self.duration.is_finite() && self.duration > 0.0
    }
}

/// A backend that plays on a virtual clock
pub struct SimulatedProvider {
    name: String,
    kind: ProviderKind,
    profile: SimulationProfile,
    this: Weak<SimulatedProvider>,
    sink: RwLock<ProviderEventSink>,
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        profile: SimulationProfile,
        config: &ProviderConfig,
    ) -> Arc<Self> {
        let state = SimState {
            volume: config.volume,
            mute: config.mute,
            rate: config.playback_rate,
            ..Default::default()
        };
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            kind,
            profile,
            this: this.clone(),
            sink: RwLock::new(ProviderEventSink::noop()),
            state: Mutex::new(state),
        })
    }

    /// Emit an event as if the backend had reported it
    pub fn inject(&self, event: ProviderEvent) {
        self.emit(vec![event]);
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    pub fn volume(&self) -> u8 {
        self.state.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().mute
    }

    pub fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn current_subtitles(&self) -> usize {
        self.state.lock().subtitles
    }

    fn emit(&self, events: Vec<ProviderEvent>) {
        let sink = self.sink.read().clone();
        for event in events {
            sink.emit(event);
        }
    }

    fn start_ticker(&self, state: &mut SimState) {
        state.stop_ticker();
        let token = CancellationToken::new();
        state.ticker = Some(token.clone());

        let tick = Duration::from_millis(self.profile.tick_ms.max(1));
        let provider = self.this.clone();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                if !provider.advance(tick.as_secs_f64()) {
                    break;
                }
            }
        });
    }

    /// Move the clock forward one tick. Returns false once playback stopped.
    fn advance(&self, elapsed: f64) -> bool {
        let (events, running) = {
            let mut state = self.state.lock();
            if !state.playing {
                return false;
            }
            state.position += elapsed * state.rate;
            let time = ProviderEvent::Time {
                position: state.position,
                duration: state.duration,
            };

            match self.profile.fail_at {
                Some(at) if !state.failed && state.position >= at => {
                    state.failed = true;
                    state.playing = false;
                    state.ticker = None;
                    let error = Error::provider(3, format!("{} decode failure", self.name));
                    (vec![time, ProviderEvent::Error(error)], false)
                }
                _ if state.is_bounded() && state.position >= state.duration => {
                    state.position = state.duration;
                    state.playing = false;
                    state.ticker = None;
                    let time = ProviderEvent::Time {
                        position: state.duration,
                        duration: state.duration,
                    };
                    (vec![time, ProviderEvent::Complete], false)
                }
                _ => (vec![time], true),
            }
        };
        trace!(provider = %self.name, "tick");
        self.emit(events);
        running
    }
}

#[async_trait]
impl Playable for SimulatedProvider {
    async fn load(&self, item: &PlaylistItem) -> Result<()> {
        let seq = {
            let mut state = self.state.lock();
            state.stop_ticker();
            state.load_seq += 1;
            state.item = Some(item.clone());
            state.loaded = false;
            state.playing = false;
            state.first_frame = false;
            state.failed = false;
            state.recovered = false;
            state.position = 0.0;
            state.level = 0;
            state.audio_track = 0;
            state.load_seq
        };

        tokio::time::sleep(Duration::from_millis(self.profile.load_delay_ms)).await;

        if self.profile.fail_load {
            return Err(Error::provider(
                2,
                format!("{} could not load {}", self.name, item.describe()),
            ));
        }

        let duration = item.duration.unwrap_or(self.profile.default_duration);
        {
            let mut state = self.state.lock();
            if state.load_seq != seq || state.destroyed {
                return Err(Error::Cancelled);
            }
            state.loaded = true;
            state.duration = duration;
        }
        debug!(provider = %self.name, item = %item.describe(), duration, "Simulated load finished");

        self.emit(vec![
            ProviderEvent::Duration(duration),
            ProviderEvent::Levels {
                levels: self.profile.levels.clone(),
                current: 0,
            },
            ProviderEvent::AudioTracks {
                tracks: self.profile.audio_tracks.clone(),
                current: 0,
            },
            ProviderEvent::Subtitles {
                tracks: self.profile.captions.clone(),
                current: 0,
            },
            ProviderEvent::Loaded,
        ]);
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::Cancelled);
            }
            if !state.loaded {
                return Err(Error::provider(1, "play requested before load"));
            }
            if self.kind != ProviderKind::Cast && !state.attached {
                return Err(Error::ElementUnavailable);
            }
            match self.profile.autoplay {
                AutoplayPolicy::Allow => {}
                AutoplayPolicy::MutedOnly if !state.primed && !state.mute => {
                    return Err(Error::PlayRejected(PlayRejection::NotAllowed));
                }
                AutoplayPolicy::MutedOnly => {}
                AutoplayPolicy::Deny if !state.primed => {
                    return Err(Error::PlayRejected(PlayRejection::Blocked));
                }
                AutoplayPolicy::Deny => {}
            }
            if state.playing {
                return Ok(());
            }
            if state.is_bounded() && state.position >= state.duration {
                state.position = 0.0;
            }

            state.playing = true;
            let mut events = vec![ProviderEvent::Playing];
            if !state.first_frame {
                state.first_frame = true;
                events.push(ProviderEvent::FirstFrame);
            }
            self.start_ticker(&mut state);
            events
        };
        self.emit(events);
        Ok(())
    }

    fn pause(&self) {
        let was_playing = {
            let mut state = self.state.lock();
            state.stop_ticker();
            std::mem::replace(&mut state.playing, false)
        };
        if was_playing {
            self.emit(vec![ProviderEvent::Paused]);
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stop_ticker();
        state.load_seq += 1;
        state.playing = false;
        state.loaded = false;
        state.position = 0.0;
        state.item = None;
    }
}

impl Seekable for SimulatedProvider {
    fn seek(&self, position: f64) {
        let events = {
            let mut state = self.state.lock();
            if !state.loaded {
                return;
            }
            state.position = if state.is_bounded() {
                position.clamp(0.0, state.duration)
            } else {
                position
            };
            vec![
                ProviderEvent::Seeked,
                ProviderEvent::Time {
                    position: state.position,
                    duration: state.duration,
                },
            ]
        };
        self.emit(events);
    }
}

impl VolumeControllable for SimulatedProvider {
    fn set_volume(&self, volume: u8) {
        self.state.lock().volume = volume;
    }

    fn set_mute(&self, mute: bool) {
        self.state.lock().mute = mute;
    }
}

impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn bind_events(&self, events: ProviderEventSink) {
        *self.sink.write() = events;
    }

    fn set_current_quality(&self, index: usize) {
        let changed = {
            let mut state = self.state.lock();
            if index < self.profile.levels.len() && index != state.level {
                state.level = index;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(vec![ProviderEvent::LevelChanged(index)]);
        }
    }

    fn set_current_audio_track(&self, index: usize) {
        let changed = {
            let mut state = self.state.lock();
            if index < self.profile.audio_tracks.len() && index != state.audio_track {
                state.audio_track = index;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(vec![ProviderEvent::AudioTrackChanged(index)]);
        }
    }

    fn set_subtitles_track(&self, index: usize) {
        self.state.lock().subtitles = index;
    }

    fn set_playback_rate(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    fn attach_media(&self, element: &mut MediaElement) {
        let mut state = self.state.lock();
        element.add_listener();
        element.set_src(
            state
                .item
                .as_ref()
                .and_then(|item| item.primary_source())
                .map(|source| source.file.clone()),
        );
        state.attached = true;
        state.primed = element.is_primed();
    }

    fn detach_media(&self) {
        let mut state = self.state.lock();
        state.stop_ticker();
        state.playing = false;
        state.attached = false;
    }

    fn set_container(&self, container: Option<ContainerHandle>) {
        debug!(provider = %self.name, ?container, "Container changed");
    }

    fn try_recover(&self, error: &Error) -> bool {
        let mut state = self.state.lock();
        if self.profile.recoverable && !state.recovered {
            state.recovered = true;
            debug!(provider = %self.name, %error, "Recovered from error");
            return true;
        }
        false
    }

    fn destroy(&self) {
        {
            let mut state = self.state.lock();
            state.stop_ticker();
            state.playing = false;
            state.destroyed = true;
        }
        *self.sink.write() = ProviderEventSink::noop();
    }
}

/// Creates [`SimulatedProvider`]s and counts them
pub struct SimulatedFactory {
    name: String,
    kind: ProviderKind,
    profile: SimulationProfile,
    constructed: AtomicUsize,
    instances: Mutex<Vec<Weak<SimulatedProvider>>>,
}

impl SimulatedFactory {
    pub fn new(name: impl Into<String>, profile: SimulationProfile) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Html5,
            profile,
            constructed: AtomicUsize::new(0),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of providers built so far
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Most recently built provider that is still alive
    pub fn last_instance(&self) -> Option<Arc<SimulatedProvider>> {
        self.instances.lock().iter().rev().find_map(Weak::upgrade)
    }
}

impl ProviderFactory for SimulatedFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, config: &ProviderConfig) -> Arc<dyn Provider> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        let provider = SimulatedProvider::new(&self.name, self.kind, self.profile.clone(), config);
        let mut instances = self.instances.lock();
        instances.retain(|w| w.strong_count() > 0);
        instances.push(Arc::downgrade(&provider));
        provider
    }
}

/// Loader that fetches a [`SimulatedFactory`] after a delay
pub struct SimulatedLoader {
    factory: Arc<SimulatedFactory>,
    delay: Duration,
    fail: bool,
    loads: AtomicUsize,
}

impl SimulatedLoader {
    pub fn new(factory: Arc<SimulatedFactory>, delay: Duration) -> Self {
        Self {
            factory,
            delay,
            fail: false,
            loads: AtomicUsize::new(0),
        }
    }

    /// Every fetch fails
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderLoader for SimulatedLoader {
    async fn load(&self, descriptor: &ProviderDescriptor) -> Result<Arc<dyn ProviderFactory>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::ProviderLoad {
                name: descriptor.name.clone(),
                reason: "fetch failed".into(),
            });
        }
        Ok(self.factory.clone())
    }
}

/// The standard set of simulated backends
pub struct SimulatedBackends {
    pub html5: Arc<SimulatedFactory>,
    pub mse: Arc<SimulatedFactory>,
    pub vpaid: Arc<SimulatedFactory>,
}

impl SimulatedBackends {
    /// Register html5, mse and vpaid backends in that priority order
    pub fn register(registry: &ProviderRegistry, profile: SimulationProfile) -> Self {
        let html5 = Arc::new(SimulatedFactory::new("html5", profile.clone()));
        let mse = Arc::new(
            SimulatedFactory::new("mse", profile.clone()).with_kind(ProviderKind::Mse),
        );
        let vpaid = Arc::new(SimulatedFactory::new("vpaid", profile).with_kind(ProviderKind::Vpaid));

        registry.register_static(
            ProviderDescriptor::new("html5", ProviderKind::Html5).with_priority(10),
            html5.clone(),
        );
        registry.register_static(
            ProviderDescriptor::new("mse", ProviderKind::Mse).with_priority(20),
            mse.clone(),
        );
        registry.register_static(
            ProviderDescriptor::new("vpaid", ProviderKind::Vpaid).with_priority(30),
            vpaid.clone(),
        );

        Self { html5, mse, vpaid }
    }

    /// Providers built across all backends
    pub fn constructed(&self) -> usize {
        self.html5.constructed() + self.mse.constructed() + self.vpaid.constructed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::MediaElementPool;

    fn recorder(provider: &SimulatedProvider) -> Arc<Mutex<Vec<ProviderEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        provider.bind_events(ProviderEventSink::new(move |e| captured.lock().push(e)));
        seen
    }

    fn item(duration: f64) -> PlaylistItem {
        PlaylistItem::from_url("https://cdn.example.com/a.mp4")
            .unwrap()
            .with_duration(duration)
    }

    fn attached(profile: SimulationProfile, primed: bool) -> Arc<SimulatedProvider> {
        let provider =
            SimulatedProvider::new("html5", ProviderKind::Html5, profile, &ProviderConfig::default());
        let pool = MediaElementPool::new(1);
        if primed {
            pool.prime_all();
        }
        let mut element = pool.take();
        provider.attach_media(&mut element);
        provider
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_reports_metadata() {
        let provider = attached(SimulationProfile::default(), false);
        let seen = recorder(&provider);

        provider.load(&item(12.0)).await.unwrap();

        let events = seen.lock();
        assert_eq!(events[0], ProviderEvent::Duration(12.0));
        assert!(matches!(events[1], ProviderEvent::Levels { ref levels, .. } if levels.len() == 3));
        assert_eq!(*events.last().unwrap(), ProviderEvent::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_to_completion() {
        let provider = attached(SimulationProfile::default(), false);
        let seen = recorder(&provider);

        provider.load(&item(1.0)).await.unwrap();
        provider.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = seen.lock();
        assert!(events.contains(&ProviderEvent::Playing));
        assert!(events.contains(&ProviderEvent::FirstFrame));
        assert_eq!(*events.last().unwrap(), ProviderEvent::Complete);
        assert!(!provider.is_playing());
        assert_eq!(provider.position(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_reports_once() {
        let provider = attached(SimulationProfile::default(), false);
        let seen = recorder(&provider);

        provider.load(&item(10.0)).await.unwrap();
        provider.play().await.unwrap();
        provider.pause();
        provider.pause();

        let pauses = seen
            .lock()
            .iter()
            .filter(|e| **e == ProviderEvent::Paused)
            .count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_only_policy() {
        let profile = SimulationProfile {
            autoplay: AutoplayPolicy::MutedOnly,
            ..Default::default()
        };
        let provider = attached(profile, false);
        provider.load(&item(10.0)).await.unwrap();

        assert_eq!(
            provider.play().await,
            Err(Error::PlayRejected(PlayRejection::NotAllowed))
        );
        provider.set_mute(true);
        assert!(provider.play().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primed_element_bypasses_policy() {
        let profile = SimulationProfile {
            autoplay: AutoplayPolicy::Deny,
            ..Default::default()
        };
        let provider = attached(profile, true);
        provider.load(&item(10.0)).await.unwrap();
        assert!(provider.play().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_without_element() {
        let provider = SimulatedProvider::new(
            "html5",
            ProviderKind::Html5,
            SimulationProfile::default(),
            &ProviderConfig::default(),
        );
        provider.load(&item(10.0)).await.unwrap();
        assert_eq!(provider.play().await, Err(Error::ElementUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_failure() {
        let profile = SimulationProfile {
            fail_at: Some(0.5),
            ..Default::default()
        };
        let provider = attached(profile, false);
        let seen = recorder(&provider);

        provider.load(&item(10.0)).await.unwrap();
        provider.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(
            seen.lock().last(),
            Some(ProviderEvent::Error(Error::Provider { code: 3, .. }))
        ));
        assert!(!provider.is_playing());
    }

    #[test]
    fn test_factory_counts_instances() {
        let factory = SimulatedFactory::new("html5", SimulationProfile::default());
        let first = factory.create(&ProviderConfig::default());
        let _second = factory.create(&ProviderConfig::default());
        assert_eq!(factory.constructed(), 2);
        assert_eq!(first.name(), "html5");
        assert!(factory.last_instance().is_some());
    }
}
