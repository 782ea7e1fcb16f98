//! Background preloading
//!
//! Keeps at most one "next" adapter loading behind the active one. A newer
//! preload replaces the slot immediately; the superseded load keeps running
//! and its adapter is destroyed when it arrives.

use crate::{adapter::MediaAdapter, item::PlaylistItem};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// A background load resolving to a ready adapter, or `None` if it failed
pub type BackgroundLoad = BoxFuture<'static, Option<Arc<MediaAdapter>>>;

type SharedLoad = Shared<BackgroundLoad>;

struct Slot {
    generation: u64,
    item: PlaylistItem,
    load: SharedLoad,
}

#[derive(Default)]
struct SlotState {
    slot: Option<Slot>,
    generation: u64,
    /// Generation handed out by `activate`, kept alive on arrival
    claimed: Option<u64>,
}

impl SlotState {
    fn keeps(&self, generation: u64) -> bool {
        self.claimed == Some(generation)
            || self.slot.as_ref().map(|s| s.generation) == Some(generation)
    }
}

/// Holder of the single next-item preload
#[derive(Clone, Default)]
pub struct BackgroundManager {
    state: Arc<Mutex<SlotState>>,
}

impl BackgroundManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `load` as the preload for `item`, superseding any previous one
    pub fn set_next(&self, item: PlaylistItem, load: BackgroundLoad) {
        let load = load.shared();
        let (generation, previous) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let generation = state.generation;
            let previous = state.slot.replace(Slot {
                generation,
                item: item.clone(),
                load: load.clone(),
            });
            (generation, previous)
        };
        if let Some(previous) = previous {
            dispose_if_ready(previous);
        }
        debug!(item = %item.describe(), generation, "Background load started");

        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            let adapter = load.await;
            let keep = state
                .upgrade()
                .map(|state| state.lock().keeps(generation))
                .unwrap_or(false);
            if !keep {
                if let Some(adapter) = adapter {
                    debug!(adapter = %adapter.id(), generation, "Disposing superseded preload");
                    adapter.destroy();
                }
            }
        });
    }

    /// Whether the retained preload is for the same media as `item`
    pub fn is_next(&self, item: &PlaylistItem) -> bool {
        self.state
            .lock()
            .slot
            .as_ref()
            .map(|slot| slot.item.same_media(item))
            .unwrap_or(false)
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    /// Drop the retained preload
    pub fn clear_next(&self) {
        let previous = self.state.lock().slot.take();
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "Background load cleared");
            dispose_if_ready(previous);
        }
    }

    /// Take the preloaded adapter if it was prepared for `item`.
    ///
    /// Returns without waiting when the load already settled. A preload for
    /// different media is discarded.
    pub async fn activate(&self, item: &PlaylistItem) -> Option<Arc<MediaAdapter>> {
        let slot = {
            let mut state = self.state.lock();
            let slot = state.slot.take()?;
            if !slot.item.same_media(item) {
                drop(state);
                debug!(generation = slot.generation, "Discarding preload for other media");
                dispose_if_ready(slot);
                return None;
            }
            state.claimed = Some(slot.generation);
            slot
        };

        if let Some(ready) = slot.load.peek() {
            return ready.clone();
        }
        slot.load.await
    }
}

/// Destroy an already-arrived adapter; pending ones are handled by their driver
fn dispose_if_ready(slot: Slot) {
    if let Some(Some(adapter)) = slot.load.peek() {
        adapter.destroy();
    }
}

impl std::fmt::Debug for BackgroundManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BackgroundManager")
            .field("generation", &state.generation)
            .field("pending", &state.slot.is_some())
            .finish()
    }
}
