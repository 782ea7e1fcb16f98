//! Typed event channel exposed to the UI layer
//!
//! Two kinds of notification share one channel:
//! - field changes on the session or active media model ([`ModelChange`])
//! - discrete playback events ([`PlayerEvent`])
//!
//! Every component publishes through the same [`EventBus`]. Publishing is a
//! sync call made while the mutation that caused it is already visible.

use crate::{
    error::{ErrorPayload, PlayRejection},
    types::*,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A named model field took a new value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum ModelChange {
    State(PlaybackState),
    MediaState(MediaState),
    Item(usize),
    Position(f64),
    Duration(f64),
    Buffer(f64),
    Volume(u8),
    Mute(bool),
    Fullscreen(bool),
    StreamType(StreamType),
    CurrentLevel(usize),
    CurrentAudioTrack(usize),
    CaptionsIndex(usize),
    PlaybackRate(f64),
    ControlsEnabled(bool),
    CastActive(bool),
    Viewable(bool),
}

impl ModelChange {
    /// Name of the changed field
    pub fn field(&self) -> &'static str {
        match self {
            ModelChange::State(_) => "state",
            ModelChange::MediaState(_) => "mediaState",
            ModelChange::Item(_) => "item",
            ModelChange::Position(_) => "position",
            ModelChange::Duration(_) => "duration",
            ModelChange::Buffer(_) => "buffer",
            ModelChange::Volume(_) => "volume",
            ModelChange::Mute(_) => "mute",
            ModelChange::Fullscreen(_) => "fullscreen",
            ModelChange::StreamType(_) => "streamType",
            ModelChange::CurrentLevel(_) => "currentLevel",
            ModelChange::CurrentAudioTrack(_) => "currentAudioTrack",
            ModelChange::CaptionsIndex(_) => "captionsIndex",
            ModelChange::PlaybackRate(_) => "playbackRate",
            ModelChange::ControlsEnabled(_) => "controls",
            ModelChange::CastActive(_) => "castActive",
            ModelChange::Viewable(_) => "viewable",
        }
    }
}

/// Events forwarded from an ad session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdEvent {
    /// The ad break took over the media element
    BreakStart { count: usize },
    /// An ad in the break started playing
    Impression { index: usize, count: usize },
    State { state: PlaybackState },
    Time { position: f64, duration: f64, skippable: bool },
    Skipped { reason: Reason },
    Complete { index: usize },
    Error(ErrorPayload),
    /// Control returned to content
    BreakEnd { resumed: bool },
}

/// Everything external collaborators observe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// A model field changed
    Change(ModelChange),
    PlaylistLoaded { count: usize },
    PlaylistItem { index: usize, title: Option<String> },
    PlaylistComplete,
    PlayAttempt { reason: Reason },
    Play { reason: Reason, old_state: PlaybackState },
    Pause { reason: Reason },
    Buffer { old_state: PlaybackState },
    Idle,
    Complete,
    FirstFrame,
    Time { position: f64, duration: f64 },
    Seek { position: f64, offset: f64, reason: Reason },
    Seeked,
    LevelsChanged { levels: Vec<QualityLevel>, current: usize },
    AudioTracksChanged { tracks: Vec<AudioTrack>, current: usize },
    CaptionsListChanged { tracks: Vec<CaptionTrack>, current: usize },
    /// Unmuted autostart was blocked; playback was retried muted
    AutostartMuted,
    /// Autostart could not start even muted
    AutostartNotAllowed { rejection: PlayRejection },
    /// A play attempt from a gesture or API call was refused
    PlayRejected { reason: Reason, rejection: PlayRejection },
    SetupError(ErrorPayload),
    Error(ErrorPayload),
    Cast { active: bool },
    Ad(AdEvent),
    Destroyed,
}

impl From<ModelChange> for PlayerEvent {
    fn from(change: ModelChange) -> Self {
        PlayerEvent::Change(change)
    }
}

impl From<AdEvent> for PlayerEvent {
    fn from(event: AdEvent) -> Self {
        PlayerEvent::Ad(event)
    }
}

/// Unified event bus for one player instance.
///
/// `publish()` never blocks. If there are no subscribers, events are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers.
    pub fn publish<E: Into<PlayerEvent>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
