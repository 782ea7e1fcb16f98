//! Kino Playback - Playback orchestration for Kino
//!
//! This crate drives one player session end to end:
//! - Provider selection from a capability-ranked registry
//! - Media adapters with a validated media state machine
//! - Background preloading of the next playlist item
//! - Media element pooling and handover
//! - Ad break takeover and content handback
//! - Cast handoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Controller                              │
//! │        session model · command queue · autostart policy         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐                        ┌──────────────┐       │
//! │  │   Program    │◄───── element lend ───►│   Instream   │       │
//! │  │    (main)    │                        │   (ads)      │       │
//! │  └──────┬───────┘                        └──────┬───────┘       │
//! │         │                                       │               │
//! │  ┌──────┴───────┐  ┌──────────────┐      ┌──────┴───────┐       │
//! │  │    Media     │  │  Background  │      │    Media     │       │
//! │  │   Adapter    │  │   Preload    │      │   Adapter    │       │
//! │  └──────┬───────┘  └──────────────┘      └──────┬───────┘       │
//! │         │                                       │               │
//! │  ┌──────┴───────────────────────────────────────┴───────┐       │
//! │  │          Provider Registry · Element Pool            │       │
//! │  └──────────────────────────────────────────────────────┘       │
//! │                                                                 │
//! │                    ┌─────────────┐                              │
//! │                    │  Event Bus  │──► UI subscribers            │
//! │                    └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod item;
pub mod config;
pub mod events;
pub mod model;
pub mod element;
pub mod provider;
pub mod adapter;
pub mod background;
pub mod program;
pub mod queue;
pub mod instream;
pub mod controller;

pub use error::{Error, ErrorCode, ErrorPayload, PlayRejection, Result};
pub use types::*;
pub use item::{Capability, CapabilitySet, DrmScheme, PlaylistItem, Source};
pub use config::{AdvertisingConfig, Autostart, ControllerConfig};
pub use events::{AdEvent, EventBus, ModelChange, PlayerEvent};
pub use model::{MediaModel, SessionModel, SessionSnapshot};
pub use element::{ContainerHandle, MediaElement, MediaElementPool};
pub use provider::{
    Provider, ProviderConfig, ProviderDescriptor, ProviderFactory, ProviderKind, ProviderLoader,
    ProviderRegistry, StaticLoader,
};
pub use adapter::{MediaAdapter, MediaEvent, PlayOutcome};
pub use instream::InstreamAdapter;
pub use controller::Controller;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the playback library
pub fn init() {
    tracing::info!(version = VERSION, "Kino Playback initialized");
}
