//! Core types for Kino Playback

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest accepted volume
pub const MIN_VOLUME: u8 = 0;
/// Highest accepted volume
pub const MAX_VOLUME: u8 = 100;
/// Slowest accepted playback rate
pub const MIN_PLAYBACK_RATE: f64 = 0.25;
/// Fastest accepted playback rate
pub const MAX_PLAYBACK_RATE: f64 = 4.0;
/// Distance kept from the end of a VOD item when clamping seeks (seconds)
pub const SEEK_END_MARGIN: f64 = 0.25;

/// Unique identifier for a player session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one media adapter within a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterId(pub u64);

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "adapter-{}", self.0)
    }
}

/// Aggregate session state seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Complete,
    Error,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Buffering => write!(f, "buffering"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Complete => write!(f, "complete"),
            PlaybackState::Error => write!(f, "error"),
        }
    }
}

/// Media-level state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    /// Nothing loaded
    #[default]
    Idle,
    /// Provider is loading the item
    Loading,
    /// Item loaded, play not yet requested
    Loaded,
    /// Play accepted, first frame pending
    Started,
    /// Playback paused
    Paused,
    /// Content is playing
    Playing,
    /// Waiting for data
    Buffering,
    /// Reached the end of the item
    Complete,
    /// Playback failed
    Error,
}

impl MediaState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: MediaState) -> bool {
        use MediaState::*;
        if target == Error {
            return true;
        }
        matches!(
            (self, target),
            // From Idle
            (Idle, Loading) | (Idle, Loaded) |
            // From Loading
            (Loading, Loaded) | (Loading, Started) | (Loading, Buffering) |
            (Loading, Playing) | (Loading, Paused) |
            // From Loaded
            (Loaded, Loading) | (Loaded, Started) | (Loaded, Buffering) |
            (Loaded, Playing) | (Loaded, Paused) |
            // From Started
            (Started, Playing) | (Started, Buffering) | (Started, Paused) |
            // From Playing
            (Playing, Paused) | (Playing, Buffering) | (Playing, Complete) |
            // From Paused
            (Paused, Playing) | (Paused, Buffering) | (Paused, Started) | (Paused, Complete) |
            // From Buffering
            (Buffering, Playing) | (Buffering, Paused) | (Buffering, Complete) |
            // From Complete (repeat or replay)
            (Complete, Loading) | (Complete, Started) | (Complete, Buffering) | (Complete, Playing)
        )
    }

    /// Session state this media state presents as
    pub fn playback_state(&self) -> PlaybackState {
        match self {
            MediaState::Idle | MediaState::Loaded => PlaybackState::Idle,
            MediaState::Loading | MediaState::Started | MediaState::Buffering => {
                PlaybackState::Buffering
            }
            MediaState::Playing => PlaybackState::Playing,
            MediaState::Paused => PlaybackState::Paused,
            MediaState::Complete => PlaybackState::Complete,
            MediaState::Error => PlaybackState::Error,
        }
    }

    /// True while the provider is actively trying to play
    pub fn is_playing_or_buffering(&self) -> bool {
        matches!(
            self,
            MediaState::Started | MediaState::Playing | MediaState::Buffering
        )
    }
}

impl std::fmt::Display for MediaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaState::Idle => write!(f, "idle"),
            MediaState::Loading => write!(f, "loading"),
            MediaState::Loaded => write!(f, "loaded"),
            MediaState::Started => write!(f, "started"),
            MediaState::Paused => write!(f, "paused"),
            MediaState::Playing => write!(f, "playing"),
            MediaState::Buffering => write!(f, "buffering"),
            MediaState::Complete => write!(f, "complete"),
            MediaState::Error => write!(f, "error"),
        }
    }
}

/// Seekability classification of the current source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamType {
    #[default]
    Vod,
    Live,
    Dvr,
}

impl StreamType {
    /// Classify a reported duration.
    ///
    /// Infinite durations are live. Negative durations describe a rewind
    /// window behind the live edge, which counts as DVR once it reaches
    /// `min_dvr_window` seconds.
    pub fn from_duration(duration: f64, min_dvr_window: f64) -> Self {
        if duration.is_infinite() {
            StreamType::Live
        } else if duration < 0.0 {
            if duration.abs() >= min_dvr_window.max(0.0) {
                StreamType::Dvr
            } else {
                StreamType::Live
            }
        } else {
            StreamType::Vod
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, StreamType::Vod)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Vod => write!(f, "VOD"),
            StreamType::Live => write!(f, "LIVE"),
            StreamType::Dvr => write!(f, "DVR"),
        }
    }
}

/// Seekable window of the current media in seconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SeekRange {
    pub start: f64,
    pub end: f64,
}

impl SeekRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0.0
    }
}

/// Why an operation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// The viewer clicked or pressed something
    Interaction,
    /// Configured autostart
    Autostart,
    /// Autostart gated on visibility
    Viewable,
    /// Playlist advance
    Playlist,
    /// Host API call
    #[default]
    External,
    /// Ad session handoff
    Instream,
    /// Cast session handoff
    Cast,
}

impl Reason {
    /// True for reasons that did not come from a user gesture
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            Reason::Autostart | Reason::Viewable | Reason::Playlist
        )
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::Interaction => "interaction",
            Reason::Autostart => "autostart",
            Reason::Viewable => "viewable",
            Reason::Playlist => "playlist",
            Reason::External => "external",
            Reason::Instream => "instream",
            Reason::Cast => "cast",
        };
        write!(f, "{}", s)
    }
}

/// A quality level offered by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    /// Display label, e.g. "720p"
    pub label: String,
    /// Bandwidth in bits per second
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl QualityLevel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bitrate: None,
            width: None,
            height: None,
        }
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }
}

/// Audio rendition offered by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub name: String,
    pub language: Option<String>,
    pub default: bool,
}

/// Caption or subtitle track offered by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub id: String,
    pub label: String,
    pub language: Option<String>,
}

impl CaptionTrack {
    /// The synthetic entry at index 0
    pub fn off() -> Self {
        Self {
            id: "off".to_string(),
            label: "Off".to_string(),
            language: None,
        }
    }
}

/// Clamp a volume request into the accepted range
pub fn clamp_volume(volume: i32) -> u8 {
    volume.clamp(MIN_VOLUME as i32, MAX_VOLUME as i32) as u8
}

/// Clamp a playback rate request, forcing 1.0 for live streams
pub fn clamp_playback_rate(rate: f64, stream_type: StreamType) -> f64 {
    if stream_type == StreamType::Live || !rate.is_finite() {
        return 1.0;
    }
    rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_state_transitions() {
        assert!(MediaState::Idle.can_transition_to(MediaState::Loading));
        assert!(MediaState::Loading.can_transition_to(MediaState::Playing));
        assert!(MediaState::Playing.can_transition_to(MediaState::Buffering));
        assert!(MediaState::Buffering.can_transition_to(MediaState::Playing));
        assert!(MediaState::Paused.can_transition_to(MediaState::Playing));
        assert!(MediaState::Complete.can_transition_to(MediaState::Loading));

        assert!(!MediaState::Idle.can_transition_to(MediaState::Playing));
        assert!(!MediaState::Playing.can_transition_to(MediaState::Loading));
        assert!(!MediaState::Complete.can_transition_to(MediaState::Paused));
    }

    #[test]
    fn test_error_reachable_from_anywhere() {
        for state in [
            MediaState::Idle,
            MediaState::Loading,
            MediaState::Playing,
            MediaState::Complete,
        ] {
            assert!(state.can_transition_to(MediaState::Error));
        }
    }

    #[test]
    fn test_stream_type_from_duration() {
        assert_eq!(StreamType::from_duration(120.0, 120.0), StreamType::Vod);
        assert_eq!(StreamType::from_duration(f64::INFINITY, 120.0), StreamType::Live);
        assert_eq!(StreamType::from_duration(-300.0, 120.0), StreamType::Dvr);
        assert_eq!(StreamType::from_duration(-60.0, 120.0), StreamType::Live);
    }

    #[test]
    fn test_clamp_helpers() {
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(150), 100);
        assert_eq!(clamp_volume(42), 42);

        assert_eq!(clamp_playback_rate(8.0, StreamType::Vod), 4.0);
        assert_eq!(clamp_playback_rate(0.1, StreamType::Dvr), 0.25);
        assert_eq!(clamp_playback_rate(2.0, StreamType::Live), 1.0);
    }
}
