//! Program controller
//!
//! Sits between the top-level controller and the media adapters. It decides
//! which adapter is active for an item, promotes background preloads, hands
//! the element over during ad breaks and cast sessions, and forwards events
//! from the active adapter only.

use crate::{
    adapter::{MediaAdapter, MediaEvent, MediaEventSink, PlayOutcome},
    background::BackgroundManager,
    element::{ContainerHandle, MediaElement, MediaElementPool},
    item::PlaylistItem,
    provider::{Provider, ProviderConfig, ProviderRegistry},
    types::AdapterId,
    Error, Result,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Which session a program drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramRole {
    Main,
    Instream,
}

struct CastSession {
    /// Local adapter to return to when the cast ends
    previous: Option<Arc<MediaAdapter>>,
}

struct ProgramState {
    active: Option<Arc<MediaAdapter>>,
    setup_token: Option<CancellationToken>,
    container: Option<ContainerHandle>,
    provider_config: ProviderConfig,
    cast: Option<CastSession>,
    /// Element lent by another program
    spare_element: Option<MediaElement>,
    destroyed: bool,
}

struct ProgramInner {
    role: ProgramRole,
    registry: Arc<ProviderRegistry>,
    pool: MediaElementPool,
    background: BackgroundManager,
    adapter_ids: Arc<AtomicU64>,
    preload_token: CancellationToken,
    this: Weak<ProgramInner>,
    upstream: RwLock<Option<Weak<dyn MediaEventSink>>>,
    route: RwLock<Option<Arc<dyn MediaEventSink>>>,
    state: Mutex<ProgramState>,
}

impl ProgramInner {
    fn new_adapter(&self, provider: Arc<dyn Provider>) -> Arc<MediaAdapter> {
        let id = AdapterId(self.adapter_ids.fetch_add(1, Ordering::SeqCst) + 1);
        let (min_dvr_window, config) = {
            let state = self.state.lock();
            (state.provider_config.min_dvr_window, state.provider_config.clone())
        };
        let adapter = MediaAdapter::new(id, provider, self.pool.clone(), min_dvr_window);
        let sink: Weak<dyn MediaEventSink> = self.this.clone();
        adapter.set_sink(sink);
        adapter.set_volume(config.volume);
        adapter.set_mute(config.mute);
        adapter.set_playback_rate(config.playback_rate);
        adapter
    }
}

impl MediaEventSink for ProgramInner {
    fn on_media_event(&self, adapter: AdapterId, event: MediaEvent) {
        let active = self.state.lock().active.as_ref().map(|a| a.id());
        if active != Some(adapter) {
            debug!(%adapter, role = ?self.role, "Dropping event from inactive adapter");
            return;
        }
        let route = self.route.read().clone();
        if let Some(route) = route {
            route.on_media_event(adapter, event);
            return;
        }
        let upstream = self.upstream.read().as_ref().and_then(Weak::upgrade);
        if let Some(upstream) = upstream {
            upstream.on_media_event(adapter, event);
        }
    }
}

/// Orchestrates the adapters of one session
#[derive(Clone)]
pub struct ProgramController {
    inner: Arc<ProgramInner>,
}

impl ProgramController {
    pub fn new(
        role: ProgramRole,
        registry: Arc<ProviderRegistry>,
        pool: MediaElementPool,
        adapter_ids: Arc<AtomicU64>,
        provider_config: ProviderConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| ProgramInner {
            role,
            registry,
            pool,
            background: BackgroundManager::new(),
            adapter_ids,
            preload_token: CancellationToken::new(),
            this: this.clone(),
            upstream: RwLock::new(None),
            route: RwLock::new(None),
            state: Mutex::new(ProgramState {
                active: None,
                setup_token: None,
                container: None,
                provider_config,
                cast: None,
                spare_element: None,
                destroyed: false,
            }),
        });
        Self { inner }
    }

    pub fn role(&self) -> ProgramRole {
        self.inner.role
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &MediaElementPool {
        &self.inner.pool
    }

    pub fn background(&self) -> &BackgroundManager {
        &self.inner.background
    }

    pub fn active(&self) -> Option<Arc<MediaAdapter>> {
        self.inner.state.lock().active.clone()
    }

    pub fn is_casting(&self) -> bool {
        self.inner.state.lock().cast.is_some()
    }

    /// Default destination of forwarded events
    pub fn set_upstream(&self, upstream: Weak<dyn MediaEventSink>) {
        *self.inner.upstream.write() = Some(upstream);
    }

    /// Send active-adapter events to `sink` instead of upstream
    pub fn route_events(&self, sink: Arc<dyn MediaEventSink>) {
        *self.inner.route.write() = Some(sink);
    }

    /// Resume forwarding to upstream
    pub fn forward_events(&self) {
        *self.inner.route.write() = None;
    }

    pub fn provider_config(&self) -> ProviderConfig {
        self.inner.state.lock().provider_config.clone()
    }

    /// Settings applied to providers created from now on
    pub fn update_provider_config(&self, update: impl FnOnce(&mut ProviderConfig)) {
        update(&mut self.inner.state.lock().provider_config);
    }

    pub fn set_container(&self, container: Option<ContainerHandle>) {
        let active = {
            let mut state = self.inner.state.lock();
            state.container = container.clone();
            state.active.clone()
        };
        if let Some(active) = active {
            active.set_container(container);
        }
    }

    /// Make `item` the active item.
    ///
    /// Promotes a matching preload, else reuses the active provider when it
    /// can play the item, else loads and instantiates the chosen provider.
    /// A newer call cancels an older one that has not settled.
    #[instrument(skip(self, item), fields(role = ?self.inner.role, item = %item.describe()))]
    pub async fn set_active_item(&self, item: PlaylistItem) -> Result<Arc<MediaAdapter>> {
        let (token, casting) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::NotReady);
            }
            let token = CancellationToken::new();
            if let Some(previous) = state.setup_token.replace(token.clone()) {
                previous.cancel();
            }
            (token, state.cast.is_some())
        };

        if casting {
            self.inner.background.clear_next();
            if let Some(active) = self.active() {
                active.set_item(item);
                return Ok(active);
            }
        }

        if self.inner.background.has_pending() {
            if let Some(adapter) = self.inner.background.activate(&item).await {
                if token.is_cancelled() {
                    adapter.destroy();
                    return Err(Error::Cancelled);
                }
                info!(adapter = %adapter.id(), "Promoting preloaded adapter");
                self.promote(adapter.clone());
                return Ok(adapter);
            }
        }

        let descriptor = self.inner.registry.require(&item)?;

        if let Some(active) = self.active() {
            if active.provider_name() == descriptor.name && !active.is_destroyed() {
                debug!(adapter = %active.id(), provider = %descriptor.name, "Reusing provider");
                active.set_item(item);
                return Ok(active);
            }
        }

        let factory = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            factory = self.inner.registry.load(&descriptor.name) => factory?,
        };
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let config = self.provider_config();
        let provider = self.inner.registry.instantiate(&factory, &config);
        let adapter = self.inner.new_adapter(provider);
        adapter.set_item(item);

        if token.is_cancelled() {
            adapter.destroy();
            return Err(Error::Cancelled);
        }

        self.install(adapter.clone());
        info!(adapter = %adapter.id(), provider = %descriptor.name, "Provider ready");
        Ok(adapter)
    }

    /// Replace the active adapter, moving the element over
    fn install(&self, adapter: Arc<MediaAdapter>) {
        let (old, container) = {
            let mut state = self.inner.state.lock();
            (state.active.take(), state.container.clone())
        };

        let element = old.as_ref().and_then(|old| old.take_element());
        if let Some(old) = old {
            old.destroy();
        }
        if !adapter.has_element() {
            let element = element
                .or_else(|| self.inner.state.lock().spare_element.take())
                .unwrap_or_else(|| self.inner.pool.take());
            adapter.put_element(element);
        } else if let Some(element) = element {
            self.inner.pool.recycle(element);
        }

        adapter.set_container(container);
        adapter.attach();
        self.inner.state.lock().active = Some(adapter);
    }

    /// Bring a preloaded adapter to the foreground
    fn promote(&self, adapter: Arc<MediaAdapter>) {
        let (old, container, config) = {
            let mut state = self.inner.state.lock();
            (
                state.active.take(),
                state.container.clone(),
                state.provider_config.clone(),
            )
        };

        let element = old.as_ref().and_then(|old| old.take_element());
        if let Some(old) = old {
            old.destroy();
        }
        if !adapter.has_element() {
            let element = element
                .or_else(|| self.inner.state.lock().spare_element.take())
                .unwrap_or_else(|| self.inner.pool.take());
            adapter.put_element(element);
        } else if let Some(element) = element {
            self.inner.pool.recycle(element);
        }

        adapter.set_volume(config.volume);
        adapter.set_mute(config.mute);
        adapter.set_playback_rate(config.playback_rate);
        adapter.set_container(container);
        self.inner.state.lock().active = Some(adapter.clone());

        if adapter.is_background() {
            adapter.set_background(false);
        } else {
            adapter.attach();
        }
    }

    /// Play the active adapter
    pub async fn play_video(&self, token: &CancellationToken) -> PlayOutcome {
        match self.active() {
            Some(adapter) => adapter.play(token).await,
            None => PlayOutcome::Failed(Error::NotReady),
        }
    }

    pub fn stop_video(&self) {
        let active = {
            let mut state = self.inner.state.lock();
            if let Some(token) = state.setup_token.take() {
                token.cancel();
            }
            state.active.clone()
        };
        if let Some(active) = active {
            active.stop();
        }
    }

    /// Drop the active adapter after the next item failed to set up.
    ///
    /// The element stays with the program for the next adapter it installs.
    pub fn release_active(&self) {
        let Some(active) = self.inner.state.lock().active.take() else {
            return;
        };
        if let Some(element) = active.take_element() {
            self.lend_element(element);
        }
        active.destroy();
        debug!(role = ?self.inner.role, adapter = %active.id(), "Released active adapter");
    }

    /// Load the active item without playing it
    pub async fn preload_video(&self, token: &CancellationToken) -> Result<()> {
        match self.active() {
            Some(adapter) => adapter.preload(token).await,
            None => Err(Error::NotReady),
        }
    }

    /// Start preloading `item` into a background adapter
    pub fn background_load(&self, item: PlaylistItem) {
        if self.is_casting() || self.inner.background.is_next(&item) {
            return;
        }
        if let Some(active) = self.active() {
            if active.item().map(|a| a.same_media(&item)).unwrap_or(false) {
                return;
            }
        }
        let Some(descriptor) = self.inner.registry.choose(&item) else {
            debug!(item = %item.describe(), "No provider for background item");
            return;
        };

        let program = self.inner.this.clone();
        let token = self.inner.preload_token.child_token();
        let next = item.clone();
        let load = async move {
            let program = program.upgrade()?;
            let factory = program.registry.load(&descriptor.name).await.ok()?;
            if token.is_cancelled() {
                return None;
            }
            let config = program.state.lock().provider_config.clone();
            let provider = program.registry.instantiate(&factory, &config);
            let adapter = program.new_adapter(provider);
            adapter.set_background(true);
            if let Some(element) = program.pool.take_background() {
                adapter.put_element(element);
            }
            adapter.set_item(next);
            match adapter.preload(&token).await {
                Ok(()) => Some(adapter),
                Err(e) => {
                    debug!(error = %e, "Background load failed");
                    adapter.destroy();
                    None
                }
            }
        }
        .boxed();

        self.inner.background.set_next(item, load);
    }

    /// Detach the active adapter and hand its element out
    pub fn background_active_media(&self) -> Option<MediaElement> {
        let element = self.active()?.take_element();
        debug!(role = ?self.inner.role, lent = element.is_some(), "Active media moved to background");
        element
    }

    /// Give the element back to the active adapter and rebind it
    pub fn restore_background_media(&self, element: Option<MediaElement>) {
        match self.active() {
            Some(active) => {
                if let Some(element) = element {
                    active.put_element(element);
                }
                active.attach();
            }
            None => {
                if let Some(element) = element {
                    self.inner.pool.recycle(element);
                }
            }
        }
    }

    /// Use `element` for the next adapter this program installs
    pub fn lend_element(&self, element: MediaElement) {
        let previous = self.inner.state.lock().spare_element.replace(element);
        if let Some(previous) = previous {
            self.inner.pool.recycle(previous);
        }
    }

    /// Take back a lent element, wherever it currently is
    pub fn reclaim_element(&self) -> Option<MediaElement> {
        let spare = self.inner.state.lock().spare_element.take();
        if spare.is_some() {
            return spare;
        }
        self.active().and_then(|active| active.take_element())
    }

    /// Switch playback to a cast receiver, carrying position and volume
    #[instrument(skip(self, provider, item), fields(receiver = provider.name()))]
    pub fn cast_video(
        &self,
        provider: Arc<dyn Provider>,
        item: PlaylistItem,
    ) -> Result<Arc<MediaAdapter>> {
        let (previous, existing_cast, container) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::NotReady);
            }
            let existing = state.cast.take();
            let previous = match &existing {
                Some(cast) => cast.previous.clone(),
                None => state.active.clone(),
            };
            let replaced_cast = if existing.is_some() {
                state.active.take()
            } else {
                None
            };
            (previous, replaced_cast, state.container.clone())
        };
        if let Some(cast) = existing_cast {
            cast.destroy();
        }

        let position = previous.as_ref().map(|p| p.model().position).unwrap_or(0.0);
        if let Some(previous) = &previous {
            previous.detach();
        }

        let adapter = self.inner.new_adapter(provider);
        let mut item = item;
        if position > 0.0 {
            item.start_time = Some(position);
        }
        adapter.set_item(item);
        adapter.set_container(container);
        adapter.attach();

        {
            let mut state = self.inner.state.lock();
            state.cast = Some(CastSession { previous });
            state.active = Some(adapter.clone());
        }
        info!(adapter = %adapter.id(), position, "Cast started");
        Ok(adapter)
    }

    /// Return from a cast session to the local adapter
    pub fn stop_cast(&self) -> Option<Arc<MediaAdapter>> {
        let (cast_adapter, previous) = {
            let mut state = self.inner.state.lock();
            let cast = state.cast.take()?;
            (state.active.take(), cast.previous)
        };

        let (position, item) = match &cast_adapter {
            Some(cast) => (cast.model().position, cast.item()),
            None => (0.0, None),
        };
        if let Some(cast) = cast_adapter {
            cast.destroy();
        }

        let previous = previous?;
        if let Some(item) = item {
            let same = previous.item().map(|p| p.same_media(&item)).unwrap_or(false);
            if !same {
                previous.set_item(item);
            }
        }
        self.inner.state.lock().active = Some(previous.clone());
        previous.attach();
        previous.seek(position);
        info!(adapter = %previous.id(), position, "Cast stopped");
        Some(previous)
    }

    /// Tear down every adapter this program owns
    pub fn destroy(&self) {
        let (active, cast, spare) = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            if let Some(token) = state.setup_token.take() {
                token.cancel();
            }
            (state.active.take(), state.cast.take(), state.spare_element.take())
        };
        self.inner.preload_token.cancel();
        self.inner.background.clear_next();
        if let Some(active) = active {
            active.destroy();
        }
        if let Some(previous) = cast.and_then(|c| c.previous) {
            previous.destroy();
        }
        if let Some(spare) = spare {
            self.inner.pool.recycle(spare);
        }
        debug!(role = ?self.inner.role, "Program destroyed");
    }
}

impl std::fmt::Debug for ProgramController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramController")
            .field("role", &self.inner.role)
            .field("active", &self.active().map(|a| a.id()))
            .finish()
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::provider::simulated::{SimulatedBackends, SimulatedFactory, SimulationProfile};
    use crate::provider::{ProviderFactory, ProviderKind};
    use crate::types::MediaState;
    use std::time::Duration;

    fn program() -> (ProgramController, SimulatedBackends) {
        let registry = Arc::new(ProviderRegistry::new());
        let backends = SimulatedBackends::register(&registry, SimulationProfile::default());
        let program = ProgramController::new(
            ProgramRole::Main,
            registry,
            MediaElementPool::new(2),
            Arc::new(AtomicU64::new(0)),
            ProviderConfig::default(),
        );
        (program, backends)
    }

    fn item(path: &str) -> PlaylistItem {
        PlaylistItem::from_url(&format!("https://cdn.example.com/{}", path))
            .unwrap()
            .with_duration(30.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_provider_reused() {
        let (program, backends) = program();
        let first = program.set_active_item(item("a.mp4")).await.unwrap();
        let second = program.set_active_item(item("b.mp4")).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(backends.html5.constructed(), 1);
        assert!(second.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_switch_tears_down_old() {
        let (program, backends) = program();
        let first = program.set_active_item(item("a.mp4")).await.unwrap();
        let second = program.set_active_item(item("b.m3u8")).await.unwrap();

        assert!(first.is_destroyed());
        assert_eq!(second.provider_name(), "mse");
        assert!(second.has_element());
        assert_eq!(backends.constructed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_provider_is_setup_error() {
        let (program, _backends) = program();
        let err = program.set_active_item(item("a.xyz")).await.unwrap_err();
        assert!(err.is_setup_error());
        assert!(program.active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_promotion_without_new_provider() {
        let (program, backends) = program();
        program.set_active_item(item("a.mp4")).await.unwrap();
        program.background_load(item("b.webm"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let built = backends.html5.constructed();

        let promoted = program.set_active_item(item("b.webm")).now_or_never();
        let promoted = promoted.unwrap().unwrap();

        assert_eq!(backends.html5.constructed(), built);
        assert!(promoted.is_setup());
        assert!(promoted.is_attached());
        assert!(!promoted.is_background());
        assert_eq!(promoted.state(), MediaState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_setup_cancels_older() {
        let registry = Arc::new(ProviderRegistry::new());
        let factory = Arc::new(SimulatedFactory::new("html5", SimulationProfile::default()));
        registry.register(
            crate::provider::ProviderDescriptor::new("html5", ProviderKind::Html5),
            Arc::new(crate::provider::simulated::SimulatedLoader::new(
                factory.clone(),
                Duration::from_millis(200),
            )),
        );
        let program = ProgramController::new(
            ProgramRole::Main,
            registry,
            MediaElementPool::new(2),
            Arc::new(AtomicU64::new(0)),
            ProviderConfig::default(),
        );

        let (first, second) = tokio::join!(
            program.set_active_item(item("a.mp4")),
            program.set_active_item(item("b.mp4")),
        );
        assert_eq!(first.unwrap_err(), Error::Cancelled);
        let adapter = second.unwrap();
        assert!(adapter.item().unwrap().describe().ends_with("b.mp4"));
        assert_eq!(factory.constructed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lent_element_returns() {
        let (program, _backends) = program();
        let active = program.set_active_item(item("a.mp4")).await.unwrap();

        let element = program.background_active_media();
        assert!(element.is_some());
        assert!(!active.is_attached());
        assert!(!active.has_element());

        program.restore_background_media(element);
        assert!(active.is_attached());
        assert!(active.has_element());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cast_round_trip() {
        let (program, _backends) = program();
        let local = program.set_active_item(item("a.mp4")).await.unwrap();
        local.play(&CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let receiver = SimulatedFactory::new("cast", SimulationProfile::default())
            .with_kind(ProviderKind::Cast)
            .create(&ProviderConfig::default());
        let cast = program.cast_video(receiver, item("a.mp4")).unwrap();
        assert!(program.is_casting());
        assert!(cast.item().unwrap().start_time.unwrap() >= 1.5);

        let back = program.stop_cast().unwrap();
        assert_eq!(back.id(), local.id());
        assert!(!program.is_casting());
        assert!(cast.is_destroyed());
    }
}
