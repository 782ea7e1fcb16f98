//! Media element pool
//!
//! Media elements are the host surfaces a provider renders into. An element
//! that was touched during a user gesture keeps the permission to start
//! unmuted playback, so elements are primed up front and recycled instead of
//! recreated. One element is held back for background preloading.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Handle to one host media element
#[derive(Debug, PartialEq, Eq)]
pub struct MediaElement {
    id: u32,
    primed: bool,
    listeners: usize,
    src: Option<Url>,
}

impl MediaElement {
    fn new(id: u32) -> Self {
        Self {
            id,
            primed: false,
            listeners: 0,
            src: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this element carries gesture-derived play permission
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn prime(&mut self) {
        self.primed = true;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
    }

    pub fn add_listener(&mut self) {
        self.listeners += 1;
    }

    pub fn src(&self) -> Option<&Url> {
        self.src.as_ref()
    }

    pub fn set_src(&mut self, src: Option<Url>) {
        self.src = src;
    }

    /// Drop listeners and source so the element can be handed out again
    fn scrub(&mut self) {
        self.listeners = 0;
        self.src = None;
    }
}

/// Host container the active element is mounted into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<MediaElement>,
    background: Option<MediaElement>,
    capacity: usize,
    next_id: u32,
    in_use: usize,
}

impl PoolInner {
    fn create(&mut self) -> MediaElement {
        self.next_id += 1;
        MediaElement::new(self.next_id)
    }
}

/// Shared pool of media elements for one player
#[derive(Clone, Debug)]
pub struct MediaElementPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl MediaElementPool {
    /// Create a pool holding `capacity` foreground elements plus one background element
    pub fn new(capacity: usize) -> Self {
        let mut inner = PoolInner {
            free: Vec::with_capacity(capacity),
            background: None,
            capacity: capacity.max(1),
            next_id: 0,
            in_use: 0,
        };
        for _ in 0..inner.capacity {
            let element = inner.create();
            inner.free.push(element);
        }
        let background = inner.create();
        inner.background = Some(background);

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Prime every pooled element, called from inside a user gesture
    pub fn prime_all(&self) {
        let mut inner = self.inner.lock();
        for element in inner.free.iter_mut() {
            element.prime();
        }
        if let Some(element) = inner.background.as_mut() {
            element.prime();
        }
        debug!(free = inner.free.len(), "Primed media elements");
    }

    /// Take a foreground element, creating an unprimed one if the pool is drained
    pub fn take(&self) -> MediaElement {
        let mut inner = self.inner.lock();
        inner.in_use += 1;
        match inner.free.pop() {
            Some(element) => element,
            None => {
                let element = inner.create();
                debug!(id = element.id, "Pool drained, created element");
                element
            }
        }
    }

    /// Take the element reserved for background preloading
    pub fn take_background(&self) -> Option<MediaElement> {
        let mut inner = self.inner.lock();
        let element = inner.background.take();
        if element.is_some() {
            inner.in_use += 1;
        }
        element
    }

    /// Return an element to the pool with its listeners stripped
    pub fn recycle(&self, mut element: MediaElement) {
        element.scrub();
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);
        debug!(id = element.id, "Recycled media element");
        if inner.background.is_none() {
            inner.background = Some(element);
        } else if inner.free.len() < inner.capacity {
            inner.free.push(element);
        }
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    pub fn has_background(&self) -> bool {
        self.inner.lock().background.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserves_background_element() {
        let pool = MediaElementPool::new(2);
        assert_eq!(pool.available(), 2);
        assert!(pool.has_background());

        let bg = pool.take_background().unwrap();
        assert!(pool.take_background().is_none());
        pool.recycle(bg);
        assert!(pool.has_background());
    }

    #[test]
    fn test_primed_elements_keep_permission() {
        let pool = MediaElementPool::new(1);
        pool.prime_all();
        let element = pool.take();
        assert!(element.is_primed());
    }

    #[test]
    fn test_recycle_strips_listeners() {
        let pool = MediaElementPool::new(1);
        let mut element = pool.take();
        let id = element.id();
        element.add_listener();
        element.add_listener();
        element.set_src(Some(Url::parse("https://cdn.example.com/a.mp4").unwrap()));
        pool.recycle(element);

        let again = pool.take();
        assert_eq!(again.id(), id);
        assert_eq!(again.listener_count(), 0);
        assert!(again.src().is_none());
    }

    #[test]
    fn test_drained_pool_creates_unprimed() {
        let pool = MediaElementPool::new(1);
        pool.prime_all();
        let first = pool.take();
        let second = pool.take();
        assert!(first.is_primed());
        assert!(!second.is_primed());
        assert_eq!(pool.in_use(), 2);
    }
}
