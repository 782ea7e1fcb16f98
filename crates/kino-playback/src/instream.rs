//! Ad sessions
//!
//! An [`InstreamAdapter`] runs its own program over the main content. While
//! it is active the main adapter is paused and detached, its element is lent
//! to the ad program and its events are held back from the session. Ending
//! the session hands everything back and resumes content when appropriate.

use crate::{
    adapter::{MediaAdapter, MediaEvent, MediaEventSink, PlayOutcome},
    config::AdvertisingConfig,
    controller::{Controller, WeakController},
    element::MediaElementPool,
    events::{AdEvent, EventBus},
    item::PlaylistItem,
    program::{ProgramController, ProgramRole},
    provider::{ProviderConfig, ProviderRegistry},
    types::*,
    Error, Result,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Holds main-content events during a break
#[derive(Default)]
struct MainGuard {
    completed: AtomicBool,
}

impl MediaEventSink for MainGuard {
    fn on_media_event(&self, adapter: AdapterId, event: MediaEvent) {
        if matches!(event, MediaEvent::Complete) {
            self.completed.store(true, Ordering::SeqCst);
        }
        debug!(%adapter, ?event, "Main event held during ad break");
    }
}

struct InstreamState {
    items: Vec<PlaylistItem>,
    index: usize,
    skip_offset: Option<f64>,
    /// Resume content when the break ends
    resume: bool,
    resume_after_skip: bool,
    position: f64,
    main_state: Option<PlaybackState>,
    initialized: bool,
    finished: bool,
    play_token: Option<CancellationToken>,
}

struct InstreamInner {
    controller: WeakController,
    program: ProgramController,
    bus: EventBus,
    guard: Arc<MainGuard>,
    state: Mutex<InstreamState>,
    this: Weak<InstreamInner>,
}

/// Handle to one ad session
#[derive(Clone)]
pub struct InstreamAdapter {
    inner: Arc<InstreamInner>,
}

impl InstreamAdapter {
    pub(crate) fn new(
        controller: WeakController,
        registry: Arc<ProviderRegistry>,
        pool: MediaElementPool,
        adapter_ids: Arc<AtomicU64>,
        bus: EventBus,
        provider_config: ProviderConfig,
        settings: AdvertisingConfig,
    ) -> Self {
        let program = ProgramController::new(
            ProgramRole::Instream,
            registry,
            pool,
            adapter_ids,
            provider_config,
        );
        let inner = Arc::new_cyclic(|this: &Weak<InstreamInner>| {
            let upstream: Weak<dyn MediaEventSink> = this.clone();
            program.set_upstream(upstream);
            InstreamInner {
                controller,
                program,
                bus,
                guard: Arc::new(MainGuard::default()),
                state: Mutex::new(InstreamState {
                    items: Vec::new(),
                    index: 0,
                    skip_offset: settings.skip_offset,
                    resume: true,
                    resume_after_skip: settings.resume_after_skip,
                    position: 0.0,
                    main_state: None,
                    initialized: false,
                    finished: false,
                    play_token: None,
                }),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    fn controller(&self) -> Result<Controller> {
        self.inner.controller.upgrade().ok_or(Error::NotReady)
    }

    /// Take over the media element from main content
    pub fn init(&self) -> Result<()> {
        let controller = self.controller()?;
        {
            let mut state = self.inner.state.lock();
            if state.finished {
                return Err(Error::NotReady);
            }
            if state.initialized {
                return Ok(());
            }
            state.initialized = true;
            state.main_state = Some(controller.state());
        }

        controller.pause_for_instream();
        let main = controller.main_program();
        main.route_events(self.inner.guard.clone());
        if let Some(element) = main.background_active_media() {
            self.inner.program.lend_element(element);
        }
        self.inner.program.set_container(controller.container());
        if let Err(e) = controller.set_controls(false) {
            debug!(error = %e, "Controls left enabled");
        }
        info!(main_state = ?controller.state(), "Ad break initialized");
        Ok(())
    }

    /// Play a single ad
    pub async fn load_item(&self, item: PlaylistItem) -> Result<PlayOutcome> {
        self.load_items(vec![item]).await
    }

    /// Play a pod of ads in order
    pub async fn load_items(&self, items: Vec<PlaylistItem>) -> Result<PlayOutcome> {
        if items.is_empty() {
            return Err(Error::EmptyPlaylist);
        }
        self.init()?;
        let count = items.len();
        {
            let mut state = self.inner.state.lock();
            state.items = items;
            state.index = 0;
        }
        self.inner.bus.publish(AdEvent::BreakStart { count });
        self.play_current().await
    }

    async fn play_current(&self) -> Result<PlayOutcome> {
        let (item, index, count) = {
            let state = self.inner.state.lock();
            if state.finished {
                return Ok(PlayOutcome::Cancelled);
            }
            let item = state
                .items
                .get(state.index)
                .cloned()
                .ok_or(Error::InvalidItemIndex {
                    index: state.index,
                    len: state.items.len(),
                })?;
            (item, state.index, state.items.len())
        };

        match self.inner.program.set_active_item(item).await {
            Ok(_) => {}
            Err(Error::Cancelled) => return Ok(PlayOutcome::Cancelled),
            Err(e) => {
                warn!(index, error = %e, "Ad setup failed");
                self.inner.bus.publish(AdEvent::Error(e.to_payload(false)));
                self.advance(index).await?;
                return Ok(PlayOutcome::Failed(e));
            }
        }

        let token = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            state.position = 0.0;
            if let Some(previous) = state.play_token.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.inner.bus.publish(AdEvent::Impression { index, count });
        debug!(index, count, "Ad impression");

        let outcome = self.inner.program.play_video(&token).await;
        if let PlayOutcome::Rejected(rejection) = outcome {
            self.inner
                .bus
                .publish(AdEvent::Error(Error::PlayRejected(rejection).to_payload(false)));
            self.advance(index).await?;
        }
        Ok(outcome)
    }

    /// Move past the ad at `from`; ends the break after the last one.
    ///
    /// A skip earlier in the pod decides whether content resumes.
    fn advance(&self, from: usize) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            let (more, resume) = {
                let mut state = this.inner.state.lock();
                if state.finished || state.index != from {
                    return Ok(());
                }
                state.index += 1;
                (state.index < state.items.len(), state.resume)
            };
            if more {
                this.play_current().await.map(|_| ())
            } else {
                this.finish(resume).await
            }
        }
        .boxed()
    }

    /// Resume the current ad
    pub async fn play(&self) -> Result<PlayOutcome> {
        if self.inner.state.lock().finished {
            return Err(Error::NotReady);
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.state.lock().play_token.replace(token.clone()) {
            previous.cancel();
        }
        Ok(self.inner.program.play_video(&token).await)
    }

    pub fn pause(&self) {
        if let Some(token) = self.inner.state.lock().play_token.take() {
            token.cancel();
        }
        if let Some(adapter) = self.inner.program.active() {
            adapter.pause();
        }
    }

    /// Skip the current ad. Viewer skips honour the skip offset.
    pub async fn skip_ad(&self, reason: Reason) -> Result<()> {
        let (index, resume) = {
            let mut state = self.inner.state.lock();
            if state.finished {
                return Ok(());
            }
            if reason == Reason::Interaction {
                match state.skip_offset {
                    Some(offset) if state.position >= offset => {}
                    _ => {
                        debug!(position = state.position, "Ad not skippable yet");
                        return Ok(());
                    }
                }
            }
            state.resume = state.resume_after_skip;
            (state.index, state.resume)
        };

        info!(index, %reason, resume, "Ad skipped");
        self.inner.bus.publish(AdEvent::Skipped { reason });
        self.inner.program.stop_video();
        self.advance(index).await
    }

    pub fn set_skip_offset(&self, offset: Option<f64>) {
        self.inner.state.lock().skip_offset = offset;
    }

    /// Whether content resumes when a skip ends the break
    pub fn set_resume_after_skip(&self, resume: bool) {
        self.inner.state.lock().resume_after_skip = resume;
    }

    pub fn is_active(&self) -> bool {
        let state = self.inner.state.lock();
        state.initialized && !state.finished
    }

    pub fn current_index(&self) -> usize {
        self.inner.state.lock().index
    }

    pub fn item_count(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn position(&self) -> f64 {
        self.inner.state.lock().position
    }

    pub fn is_skippable(&self) -> bool {
        let state = self.inner.state.lock();
        matches!(state.skip_offset, Some(offset) if state.position >= offset)
    }

    pub fn active_adapter(&self) -> Option<Arc<MediaAdapter>> {
        self.inner.program.active()
    }

    /// End the break and hand control back to content
    pub async fn destroy(&self) -> Result<()> {
        let resume = self.inner.state.lock().resume;
        self.finish(resume).await
    }

    fn finish(&self, resume: bool) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            let main_state = {
                let mut state = this.inner.state.lock();
                if state.finished {
                    return Ok(());
                }
                state.finished = true;
                if let Some(token) = state.play_token.take() {
                    token.cancel();
                }
                state.main_state
            };

            let element = this.inner.program.reclaim_element();
            this.inner.program.destroy();

            let Some(controller) = this.inner.controller.upgrade() else {
                if let Some(element) = element {
                    this.inner.program.pool().recycle(element);
                }
                return Ok(());
            };
            let main = controller.main_program();
            main.restore_background_media(element);
            main.forward_events();
            if let Err(e) = controller.set_controls(true) {
                debug!(error = %e, "Controls not restored");
            }
            this.inner.bus.publish(AdEvent::BreakEnd { resumed: resume });
            info!(resume, "Ad break ended");

            let completed = this.inner.guard.completed.load(Ordering::SeqCst);
            controller
                .resume_after_instream(main_state, resume, completed)
                .await
        }
        .boxed()
    }

    /// Tear down without touching main content
    pub(crate) fn abort(&self) {
        {
            let mut state = self.inner.state.lock();
            state.finished = true;
            if let Some(token) = state.play_token.take() {
                token.cancel();
            }
        }
        self.inner.program.destroy();
    }
}

impl MediaEventSink for InstreamInner {
    fn on_media_event(&self, _adapter: AdapterId, event: MediaEvent) {
        let (index, finished) = {
            let state = self.state.lock();
            (state.index, state.finished)
        };
        if finished {
            return;
        }
        match event {
            MediaEvent::State { new, .. } => self.bus.publish(AdEvent::State {
                state: new.playback_state(),
            }),
            MediaEvent::Time { position, duration } => {
                let skippable = {
                    let mut state = self.state.lock();
                    state.position = position;
                    matches!(state.skip_offset, Some(offset) if position >= offset)
                };
                self.bus.publish(AdEvent::Time {
                    position,
                    duration,
                    skippable,
                });
            }
            MediaEvent::Complete => {
                self.bus.publish(AdEvent::Complete { index });
                self.spawn_advance(index);
            }
            MediaEvent::Error(error) => {
                warn!(index, error = %error, "Ad playback failed");
                self.bus.publish(AdEvent::Error(error.to_payload(false)));
                self.spawn_advance(index);
            }
            _ => {}
        }
    }
}

impl InstreamInner {
    fn spawn_advance(&self, index: usize) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let adapter = InstreamAdapter { inner };
        tokio::spawn(async move {
            if let Err(e) = adapter.advance(index).await {
                warn!(error = %e, "Ad advance failed");
            }
        });
    }
}

impl std::fmt::Debug for InstreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InstreamAdapter")
            .field("index", &state.index)
            .field("count", &state.items.len())
            .field("finished", &state.finished)
            .finish()
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::element::ContainerHandle;
    use crate::events::PlayerEvent;
    use crate::provider::simulated::{SimulatedBackends, SimulationProfile};
    use std::time::Duration;

    async fn playing_controller(config: ControllerConfig) -> Controller {
        let registry = Arc::new(ProviderRegistry::new());
        SimulatedBackends::register(&registry, SimulationProfile::default());
        let player = Controller::new(config, registry).unwrap();
        player.set_container(ContainerHandle::new("player")).await.unwrap();
        player
            .load(vec![PlaylistItem::from_url("https://cdn.example.com/main.mp4")
                .unwrap()
                .with_duration(120.0)])
            .await
            .unwrap();
        player.play(Reason::Interaction).await.unwrap();
        player
    }

    fn ad(duration: f64) -> PlaylistItem {
        PlaylistItem::from_url("https://ads.example.com/spot.mp4")
            .unwrap()
            .with_duration(duration)
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_pauses_and_resumes_content() {
        let player = playing_controller(ControllerConfig::default()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let instream = player.create_instream().unwrap();
        assert!(matches!(player.create_instream(), Err(Error::InstreamActive)));

        let outcome = instream.load_item(ad(5.0)).await.unwrap();
        assert!(outcome.is_started());
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(!player.controls_enabled());
        let paused_at = player.position();

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(!instream.is_active());
        assert!(!player.instream_active());
        assert!(player.controls_enabled());
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.position() >= paused_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_rejected_during_break() {
        let player = playing_controller(ControllerConfig::default()).await;
        let instream = player.create_instream().unwrap();
        instream.load_item(ad(30.0)).await.unwrap();

        assert_eq!(
            player.play(Reason::Interaction).await,
            Err(Error::InstreamActive)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_honours_offset() {
        let player = playing_controller(ControllerConfig::default()).await;
        let instream = player.create_instream().unwrap();
        instream.set_skip_offset(Some(3.0));
        instream.load_item(ad(30.0)).await.unwrap();

        instream.skip_ad(Reason::Interaction).await.unwrap();
        assert!(instream.is_active());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(instream.is_skippable());
        instream.skip_ad(Reason::Interaction).await.unwrap();
        assert!(!instream.is_active());
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_without_resume_keeps_content_paused() {
        let player = playing_controller(ControllerConfig::default()).await;
        let mut rx = player.subscribe();
        let instream = player.create_instream().unwrap();
        instream.set_resume_after_skip(false);
        instream.load_item(ad(30.0)).await.unwrap();

        instream.skip_ad(Reason::External).await.unwrap();

        assert_eq!(player.state(), PlaybackState::Paused);
        let mut ended = false;
        while let Ok(event) = rx.try_recv() {
            if event == PlayerEvent::Ad(AdEvent::BreakEnd { resumed: false }) {
                ended = true;
            }
        }
        assert!(ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_plays_in_order() {
        let player = playing_controller(ControllerConfig::default()).await;
        let instream = player.create_instream().unwrap();
        instream.load_items(vec![ad(2.0), ad(2.0)]).await.unwrap();
        assert_eq!(instream.item_count(), 2);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(instream.current_index(), 1);
        assert!(instream.is_active());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!instream.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_without_resume_holds_for_rest_of_pod() {
        let player = playing_controller(ControllerConfig {
            event_capacity: 4096,
            ..Default::default()
        })
        .await;
        let mut rx = player.subscribe();
        let instream = player.create_instream().unwrap();
        instream.set_resume_after_skip(false);
        instream.load_items(vec![ad(30.0), ad(2.0)]).await.unwrap();

        instream.skip_ad(Reason::External).await.unwrap();
        assert!(instream.is_active());
        assert_eq!(instream.current_index(), 1);

        // the last ad ends on its own
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!instream.is_active());
        assert_eq!(player.state(), PlaybackState::Paused);

        let mut resumed = None;
        while let Ok(event) = rx.try_recv() {
            if let PlayerEvent::Ad(AdEvent::BreakEnd { resumed: r }) = event {
                resumed = Some(r);
            }
        }
        assert_eq!(resumed, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_outlived_by_destroyed_player_settles() {
        let player = playing_controller(ControllerConfig::default()).await;
        let instream = player.create_instream().unwrap();
        instream.load_item(ad(30.0)).await.unwrap();

        player.destroy();

        assert!(!instream.is_active());
        assert!(instream.destroy().await.is_ok());
        assert!(matches!(instream.init(), Err(Error::NotReady)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_element_returned_to_content() {
        let player = playing_controller(ControllerConfig::default()).await;
        let in_use = player.element_pool().in_use();
        let instream = player.create_instream().unwrap();
        instream.load_item(ad(30.0)).await.unwrap();
        assert_eq!(player.element_pool().in_use(), in_use);

        instream.destroy().await.unwrap();
        assert_eq!(player.element_pool().in_use(), in_use);
        assert!(player.active_item().is_some());
        assert_eq!(player.media_state(), MediaState::Playing);
    }
}
