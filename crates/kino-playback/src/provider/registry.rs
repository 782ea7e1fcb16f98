//! Provider registry
//!
//! Holds the providers a player may use, in priority order, and loads their
//! implementations lazily. The registry is an explicit object passed to the
//! controller at construction; there is no process-wide provider list.

use super::{Provider, ProviderConfig, ProviderKind};
use crate::{
    item::{CapabilitySet, PlaylistItem},
    Error, Result,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Immutable description of a registered backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub capabilities: CapabilitySet,
    /// Lower values are tried first
    pub priority: u32,
}

impl ProviderDescriptor {
    /// Descriptor with the default capabilities of `kind`
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: kind.default_capabilities(),
            priority: 100,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// True if this provider can play the item's primary source
    pub fn supports(&self, item: &PlaylistItem) -> bool {
        let Some(source) = item.primary_source() else {
            return false;
        };
        if source.container().is_none() {
            return false;
        }
        self.capabilities.satisfies(&source.requirements())
    }
}

/// Builds provider instances once the implementation is loaded
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, config: &ProviderConfig) -> Arc<dyn Provider>;
}

/// Fetches a provider implementation
#[async_trait]
pub trait ProviderLoader: Send + Sync {
    async fn load(&self, descriptor: &ProviderDescriptor) -> Result<Arc<dyn ProviderFactory>>;
}

/// Loader for providers compiled into the host
pub struct StaticLoader {
    factory: Arc<dyn ProviderFactory>,
}

impl StaticLoader {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl ProviderLoader for StaticLoader {
    async fn load(&self, _descriptor: &ProviderDescriptor) -> Result<Arc<dyn ProviderFactory>> {
        Ok(self.factory.clone())
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<dyn ProviderFactory>>>>;

struct Entry {
    descriptor: ProviderDescriptor,
    loader: Arc<dyn ProviderLoader>,
}

/// Registered providers plus their load state
pub struct ProviderRegistry {
    entries: RwLock<Vec<Entry>>,
    loaded: Mutex<HashMap<String, Arc<dyn ProviderFactory>>>,
    in_flight: Mutex<HashMap<String, LoadFuture>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            loaded: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Register a provider. Equal priorities keep registration order.
    pub fn register(&self, descriptor: ProviderDescriptor, loader: Arc<dyn ProviderLoader>) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.descriptor.name != descriptor.name);
        debug!(name = %descriptor.name, priority = descriptor.priority, "Registered provider");
        entries.push(Entry { descriptor, loader });
        entries.sort_by_key(|e| e.descriptor.priority);
    }

    /// Register a compiled-in provider
    pub fn register_static(&self, descriptor: ProviderDescriptor, factory: Arc<dyn ProviderFactory>) {
        self.register(descriptor, Arc::new(StaticLoader::new(factory)));
    }

    /// Descriptors in priority order
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .read()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// First provider, in priority order, that supports the item
    pub fn choose(&self, item: &PlaylistItem) -> Option<ProviderDescriptor> {
        self.entries
            .read()
            .iter()
            .find(|e| e.descriptor.supports(item))
            .map(|e| e.descriptor.clone())
    }

    /// Like [`choose`](Self::choose) but failing with [`Error::NoProvider`]
    pub fn require(&self, item: &PlaylistItem) -> Result<ProviderDescriptor> {
        self.choose(item).ok_or_else(|| Error::NoProvider {
            item: item.describe(),
        })
    }

    /// Already-loaded implementation, if any
    pub fn loaded(&self, name: &str) -> Option<Arc<dyn ProviderFactory>> {
        self.loaded.lock().get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().contains_key(name)
    }

    /// Load a provider implementation.
    ///
    /// Concurrent calls for the same provider share one in-flight load. A
    /// failed load is not cached; the next call starts a fresh attempt.
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> Result<Arc<dyn ProviderFactory>> {
        if let Some(factory) = self.loaded(name) {
            return Ok(factory);
        }

        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(name) {
                Some(pending) => pending.clone(),
                None => {
                    let (descriptor, loader) = {
                        let entries = self.entries.read();
                        let entry = entries
                            .iter()
                            .find(|e| e.descriptor.name == name)
                            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
                        (entry.descriptor.clone(), entry.loader.clone())
                    };
                    let provider_name = name.to_string();
                    let pending = async move {
                        loader.load(&descriptor).await.map_err(|e| match e {
                            Error::ProviderLoad { .. } => e,
                            other => Error::ProviderLoad {
                                name: provider_name,
                                reason: other.to_string(),
                            },
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(name.to_string(), pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;
        self.clear_in_flight(name, &pending);

        match &result {
            Ok(factory) => {
                info!(name, "Provider loaded");
                self.loaded
                    .lock()
                    .entry(name.to_string())
                    .or_insert_with(|| factory.clone());
            }
            Err(e) => warn!(name, error = %e, "Provider load failed"),
        }
        result
    }

    /// Drop the in-flight entry for `name` if it is still `pending`.
    ///
    /// A sharer that wakes late must not evict a newer load of the same name.
    fn clear_in_flight(&self, name: &str, pending: &LoadFuture) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(name)
            .is_some_and(|current| current.ptr_eq(pending))
        {
            in_flight.remove(name);
        }
    }

    /// Create a provider instance from a loaded implementation
    pub fn instantiate(
        &self,
        factory: &Arc<dyn ProviderFactory>,
        config: &ProviderConfig,
    ) -> Arc<dyn Provider> {
        debug!(name = factory.name(), "Instantiating provider");
        factory.create(config)
    }

    /// Forget loaded implementations and pending loads
    pub fn teardown(&self) {
        self.loaded.lock().clear();
        self.in_flight.lock().clear();
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.descriptors())
            .finish()
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::provider::simulated::{SimulatedFactory, SimulationProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ProviderLoader for CountingLoader {
        async fn load(&self, _descriptor: &ProviderDescriptor) -> Result<Arc<dyn ProviderFactory>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(Error::Internal("chunk failed".into()));
            }
            Ok(Arc::new(SimulatedFactory::new("html5", SimulationProfile::default())))
        }
    }

    fn item(url: &str) -> PlaylistItem {
        PlaylistItem::from_url(url).unwrap()
    }

    #[test]
    fn test_choose_respects_priority() {
        let registry = ProviderRegistry::new();
        let factory = Arc::new(SimulatedFactory::new("any", SimulationProfile::default()));
        registry.register_static(
            ProviderDescriptor::new("mse", ProviderKind::Mse).with_priority(20),
            factory.clone(),
        );
        registry.register_static(
            ProviderDescriptor::new("html5", ProviderKind::Html5).with_priority(10),
            factory,
        );

        let mp4 = item("https://cdn.example.com/a.mp4");
        assert_eq!(registry.choose(&mp4).unwrap().name, "html5");

        let hls = item("https://cdn.example.com/a.m3u8");
        assert_eq!(registry.choose(&hls).unwrap().name, "mse");

        let flv = item("https://cdn.example.com/a.flv");
        assert!(registry.choose(&flv).is_none());
        assert!(matches!(registry.require(&flv), Err(Error::NoProvider { .. })));
    }

    #[test]
    fn test_unknown_container_has_no_provider() {
        let registry = ProviderRegistry::new();
        registry.register_static(
            ProviderDescriptor::new("html5", ProviderKind::Html5),
            Arc::new(SimulatedFactory::new("html5", SimulationProfile::default())),
        );
        assert!(registry.choose(&item("https://cdn.example.com/a.xyz")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderDescriptor::new("html5", ProviderKind::Html5),
            Arc::new(CountingLoader {
                calls: calls.clone(),
                fail: false,
            }),
        );

        let (a, b) = tokio::join!(registry.load("html5"), registry.load("html5"));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(registry.is_loaded("html5"));
        registry.load("html5").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        registry.register(
            ProviderDescriptor::new("html5", ProviderKind::Html5),
            Arc::new(CountingLoader {
                calls: calls.clone(),
                fail: true,
            }),
        );

        let err = registry.load("html5").await.err().unwrap();
        assert!(matches!(err, Error::ProviderLoad { .. }));
        assert!(!registry.is_loaded("html5"));

        let _ = registry.load("html5").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_load_keeps_newer_entry() {
        let registry = ProviderRegistry::new();
        let stale: LoadFuture = async { Err::<Arc<dyn ProviderFactory>, _>(Error::Cancelled) }
            .boxed()
            .shared();
        let current: LoadFuture = async { Err::<Arc<dyn ProviderFactory>, _>(Error::Cancelled) }
            .boxed()
            .shared();
        registry
            .in_flight
            .lock()
            .insert("html5".to_string(), current.clone());

        registry.clear_in_flight("html5", &stale);
        assert!(registry.in_flight.lock().contains_key("html5"));

        registry.clear_in_flight("html5", &current);
        assert!(!registry.in_flight.lock().contains_key("html5"));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.load("nope").await,
            Err(Error::UnknownProvider(_))
        ));
    }
}
