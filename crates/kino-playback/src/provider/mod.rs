//! Playback providers
//!
//! A provider is the backend that actually decodes and renders a source. The
//! contract is split into small capability traits so adapters and tests can
//! depend on only what they use:
//!
//! - [`Playable`]: load, play, pause, stop
//! - [`Seekable`]: seek
//! - [`VolumeControllable`]: volume and mute
//!
//! [`Provider`] combines them with track selection and element binding.
//! Providers report back through a [`ProviderEventSink`] bound once by the
//! owning adapter.

mod registry;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use registry::{
    ProviderDescriptor, ProviderFactory, ProviderLoader, ProviderRegistry, StaticLoader,
};

use crate::{
    element::{ContainerHandle, MediaElement},
    item::{Capability, CapabilitySet, PlaylistItem},
    types::*,
    Error, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Backend family, used to dispatch construction and default capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Native progressive playback
    Html5,
    /// Media Source Extensions based adaptive streaming
    Mse,
    /// Legacy plugin playback
    Flash,
    /// Ad units that run their own creative
    Vpaid,
    /// Remote playback on a cast receiver
    Cast,
}

impl ProviderKind {
    /// Capabilities a provider of this kind supports when none are declared
    pub fn default_capabilities(&self) -> CapabilitySet {
        use Capability::*;
        let caps: &[Capability] = match self {
            ProviderKind::Html5 => &[Mp4, WebM, Mp3, Aac],
            ProviderKind::Mse => &[Mp4, Hls, Dash, Widevine, PlayReady, ClearKey],
            ProviderKind::Flash => &[Flv, Rtmp, Mp4],
            ProviderKind::Vpaid => &[Vpaid],
            ProviderKind::Cast => &[Mp4, WebM, Mp3, Aac, Hls, Dash],
        };
        caps.iter().copied().collect()
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Html5 => write!(f, "html5"),
            ProviderKind::Mse => write!(f, "mse"),
            ProviderKind::Flash => write!(f, "flash"),
            ProviderKind::Vpaid => write!(f, "vpaid"),
            ProviderKind::Cast => write!(f, "cast"),
        }
    }
}

/// Settings handed to a provider when it is instantiated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub volume: u8,
    pub mute: bool,
    pub playback_rate: f64,
    pub min_dvr_window: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            volume: 90,
            mute: false,
            playback_rate: 1.0,
            min_dvr_window: 120.0,
        }
    }
}

/// What a provider reports back to its adapter
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The source finished loading and metadata is available
    Loaded,
    Duration(f64),
    Time { position: f64, duration: f64 },
    /// Buffered percentage
    Buffer(f64),
    Playing,
    Paused,
    Buffering,
    FirstFrame,
    Seeked,
    Complete,
    Levels { levels: Vec<QualityLevel>, current: usize },
    LevelChanged(usize),
    AudioTracks { tracks: Vec<AudioTrack>, current: usize },
    AudioTrackChanged(usize),
    /// Caption tracks, excluding the synthetic "off" entry
    Subtitles { tracks: Vec<CaptionTrack>, current: usize },
    Error(Error),
}

/// Callback a provider emits through. Emission is synchronous.
#[derive(Clone)]
pub struct ProviderEventSink {
    inner: Arc<dyn Fn(ProviderEvent) + Send + Sync>,
}

impl ProviderEventSink {
    pub fn new(f: impl Fn(ProviderEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Sink that drops everything
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, event: ProviderEvent) {
        (self.inner)(event)
    }
}

impl std::fmt::Debug for ProviderEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEventSink").finish_non_exhaustive()
    }
}

/// Load and transport control
#[async_trait]
pub trait Playable: Send + Sync {
    /// Prepare the item; resolves once the provider can accept `play()`
    async fn load(&self, item: &PlaylistItem) -> Result<()>;

    /// Start playback; resolves when the attempt settles.
    ///
    /// A refusal by the host is reported as [`Error::PlayRejected`].
    async fn play(&self) -> Result<()>;

    fn pause(&self);

    fn stop(&self);
}

/// Position control
pub trait Seekable: Send + Sync {
    fn seek(&self, position: f64);
}

/// Volume control
pub trait VolumeControllable: Send + Sync {
    fn set_volume(&self, volume: u8);

    fn set_mute(&self, mute: bool);
}

/// A complete playback backend
pub trait Provider: Playable + Seekable + VolumeControllable {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Route subsequent events to `events`
    fn bind_events(&self, events: ProviderEventSink);

    fn set_current_quality(&self, index: usize);

    fn set_current_audio_track(&self, index: usize);

    /// 0 disables captions
    fn set_subtitles_track(&self, index: usize);

    fn set_playback_rate(&self, rate: f64);

    fn attach_media(&self, element: &mut MediaElement);

    fn detach_media(&self);

    fn set_container(&self, _container: Option<ContainerHandle>) {}

    /// One provider-specific recovery attempt for a runtime error
    fn try_recover(&self, _error: &Error) -> bool {
        false
    }

    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_default_capabilities() {
        assert!(ProviderKind::Mse.default_capabilities().contains(Capability::Hls));
        assert!(!ProviderKind::Html5.default_capabilities().contains(Capability::Hls));
        assert!(ProviderKind::Vpaid.default_capabilities().contains(Capability::Vpaid));
    }

    #[test]
    fn test_sink_emits_synchronously() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = ProviderEventSink::new(move |event| captured.lock().push(event));

        sink.emit(ProviderEvent::Playing);
        sink.emit(ProviderEvent::Duration(30.0));

        assert_eq!(
            *seen.lock(),
            vec![ProviderEvent::Playing, ProviderEvent::Duration(30.0)]
        );
    }
}
