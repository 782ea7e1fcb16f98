//! Session and media models
//!
//! [`SessionModel`] is owned by the controller and publishes a change event for
//! every effective mutation. [`MediaModel`] belongs to one adapter; it records
//! what the provider reported and is reset, not replaced, when the adapter is
//! reused for a new item.

use crate::{
    events::{EventBus, ModelChange},
    item::PlaylistItem,
    types::*,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Per-resource media state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaModel {
    /// Bumped by every reset; play attempts compare it to drop stale results
    pub generation: u64,
    pub state: MediaState,
    pub position: f64,
    pub duration: f64,
    pub seek_range: SeekRange,
    /// Buffered percentage (0-100)
    pub buffer: f64,
    pub stream_type: StreamType,
    pub levels: Vec<QualityLevel>,
    pub current_level: usize,
    pub audio_tracks: Vec<AudioTrack>,
    pub current_audio_track: usize,
    /// Index 0 is "off"
    pub captions: Vec<CaptionTrack>,
    pub captions_index: usize,
    pub playback_rate: f64,
    /// The provider finished loading the current item
    pub setup: bool,
    /// The first frame of the current item was rendered
    pub started: bool,
    /// The item's start time was applied
    pub start_applied: bool,
}

impl MediaModel {
    pub fn new() -> Self {
        Self {
            playback_rate: 1.0,
            captions: vec![CaptionTrack::off()],
            ..Default::default()
        }
    }

    /// Forget everything about the previous item
    pub fn reset(&mut self) {
        let generation = self.generation + 1;
        let playback_rate = self.playback_rate;
        *self = Self::new();
        self.generation = generation;
        self.playback_rate = playback_rate;
    }

    /// Apply a state transition. Invalid transitions are logged and ignored.
    pub fn set_state(&mut self, state: MediaState) -> bool {
        if self.state == state {
            return false;
        }
        if !self.state.can_transition_to(state) {
            warn!(from = %self.state, to = %state, "Ignoring invalid media state transition");
            return false;
        }
        debug!(from = %self.state, to = %state, generation = self.generation, "Media state");
        self.state = state;
        true
    }

    /// Force a state without checking the transition table (stop/repeat)
    pub fn force_state(&mut self, state: MediaState) -> bool {
        let changed = self.state != state;
        self.state = state;
        changed
    }

    pub fn set_position(&mut self, position: f64) -> bool {
        if self.position == position {
            return false;
        }
        self.position = position;
        true
    }

    /// Record a reported duration and derive stream type and seek range
    pub fn set_duration(&mut self, duration: f64, min_dvr_window: f64) -> bool {
        if self.duration == duration {
            return false;
        }
        self.duration = duration;
        self.stream_type = StreamType::from_duration(duration, min_dvr_window);
        self.seek_range = match self.stream_type {
            StreamType::Vod => SeekRange::new(0.0, duration),
            StreamType::Dvr => SeekRange::new(duration, 0.0),
            StreamType::Live => SeekRange::default(),
        };
        true
    }

    pub fn set_buffer(&mut self, percent: f64) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        if self.buffer == percent {
            return false;
        }
        self.buffer = percent;
        true
    }

    /// Clamp a seek target into what this media can reach
    pub fn clamp_seek(&self, target: f64) -> f64 {
        match self.stream_type {
            StreamType::Vod => {
                let max = (self.duration - SEEK_END_MARGIN).max(self.seek_range.start);
                if self.duration > 0.0 {
                    target.clamp(self.seek_range.start, max)
                } else {
                    target.max(0.0)
                }
            }
            StreamType::Dvr => target.clamp(self.duration, 0.0),
            StreamType::Live => 0.0,
        }
    }
}

/// State of the whole player instance
#[derive(Debug)]
pub struct SessionModel {
    bus: EventBus,
    pub id: SessionId,
    pub playlist: Vec<PlaylistItem>,
    pub item_index: Option<usize>,
    pub state: PlaybackState,
    pub volume: u8,
    pub mute: bool,
    pub fullscreen: bool,
    pub stream_type: StreamType,
    pub controls: bool,
    pub cast_active: bool,
    pub viewable: bool,
    pub autostart_muted: bool,
    pub playback_rate: f64,
    /// Consecutive items skipped because setup failed
    pub setup_failures: usize,
}

impl SessionModel {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            id: SessionId::new(),
            playlist: Vec::new(),
            item_index: None,
            state: PlaybackState::Idle,
            volume: 90,
            mute: false,
            fullscreen: false,
            stream_type: StreamType::Vod,
            controls: true,
            cast_active: false,
            viewable: false,
            autostart_muted: false,
            playback_rate: 1.0,
            setup_failures: 0,
        }
    }

    /// The item at the active index
    pub fn active_item(&self) -> Option<&PlaylistItem> {
        self.item_index.and_then(|i| self.playlist.get(i))
    }

    /// Replace the playlist; the active index points at item 0 or is cleared
    pub fn set_playlist(&mut self, playlist: Vec<PlaylistItem>) {
        self.playlist = playlist;
        self.item_index = None;
        self.setup_failures = 0;
    }

    pub fn set_item_index(&mut self, index: usize) -> bool {
        if index >= self.playlist.len() {
            return false;
        }
        if self.item_index == Some(index) {
            return false;
        }
        self.item_index = Some(index);
        self.bus.publish(ModelChange::Item(index));
        true
    }

    pub fn set_state(&mut self, state: PlaybackState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.bus.publish(ModelChange::State(state));
        true
    }

    pub fn set_volume(&mut self, volume: u8) -> bool {
        if self.volume == volume {
            return false;
        }
        self.volume = volume;
        self.bus.publish(ModelChange::Volume(volume));
        true
    }

    pub fn set_mute(&mut self, mute: bool) -> bool {
        if self.mute == mute {
            return false;
        }
        self.mute = mute;
        self.bus.publish(ModelChange::Mute(mute));
        true
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) -> bool {
        if self.fullscreen == fullscreen {
            return false;
        }
        self.fullscreen = fullscreen;
        self.bus.publish(ModelChange::Fullscreen(fullscreen));
        true
    }

    pub fn set_stream_type(&mut self, stream_type: StreamType) -> bool {
        if self.stream_type == stream_type {
            return false;
        }
        self.stream_type = stream_type;
        self.bus.publish(ModelChange::StreamType(stream_type));
        true
    }

    pub fn set_controls(&mut self, controls: bool) -> bool {
        if self.controls == controls {
            return false;
        }
        self.controls = controls;
        self.bus.publish(ModelChange::ControlsEnabled(controls));
        true
    }

    pub fn set_cast_active(&mut self, active: bool) -> bool {
        if self.cast_active == active {
            return false;
        }
        self.cast_active = active;
        self.bus.publish(ModelChange::CastActive(active));
        true
    }

    pub fn set_viewable(&mut self, viewable: bool) -> bool {
        if self.viewable == viewable {
            return false;
        }
        self.viewable = viewable;
        self.bus.publish(ModelChange::Viewable(viewable));
        true
    }

    pub fn set_playback_rate(&mut self, rate: f64) -> bool {
        if self.playback_rate == rate {
            return false;
        }
        self.playback_rate = rate;
        self.bus.publish(ModelChange::PlaybackRate(rate));
        true
    }
}

/// Serializable view of the session and the active media
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub playlist_len: usize,
    pub item_index: Option<usize>,
    pub state: PlaybackState,
    pub volume: u8,
    pub mute: bool,
    pub fullscreen: bool,
    pub stream_type: StreamType,
    pub controls: bool,
    pub cast_active: bool,
    pub media: Option<MediaModel>,
}

impl SessionSnapshot {
    pub fn capture(session: &SessionModel, media: Option<MediaModel>) -> Self {
        Self {
            session_id: session.id,
            playlist_len: session.playlist.len(),
            item_index: session.item_index,
            state: session.state,
            volume: session.volume,
            mute: session.mute,
            fullscreen: session.fullscreen,
            stream_type: session.stream_type,
            controls: session.controls,
            cast_active: session.cast_active,
            media,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PlayerEvent;

    #[test]
    fn test_media_reset_bumps_generation() {
        let mut model = MediaModel::new();
        model.set_state(MediaState::Loading);
        model.set_position(12.0);
        model.playback_rate = 1.5;

        model.reset();
        assert_eq!(model.generation, 1);
        assert_eq!(model.state, MediaState::Idle);
        assert_eq!(model.position, 0.0);
        assert_eq!(model.playback_rate, 1.5);
        assert_eq!(model.captions.len(), 1);
    }

    #[test]
    fn test_invalid_transition_ignored() {
        let mut model = MediaModel::new();
        assert!(!model.set_state(MediaState::Playing));
        assert_eq!(model.state, MediaState::Idle);
    }

    #[test]
    fn test_seek_clamped_below_duration() {
        let mut model = MediaModel::new();
        model.set_duration(120.0, 120.0);
        let target = model.clamp_seek(150.0);
        assert!(target < 120.0);
        assert_eq!(model.clamp_seek(-4.0), 0.0);
    }

    #[test]
    fn test_dvr_seek_range() {
        let mut model = MediaModel::new();
        model.set_duration(-600.0, 120.0);
        assert_eq!(model.stream_type, StreamType::Dvr);
        assert_eq!(model.clamp_seek(-900.0), -600.0);
        assert_eq!(model.clamp_seek(10.0), 0.0);
    }

    #[test]
    fn test_session_emits_once_per_change() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut session = SessionModel::new(bus);

        assert!(session.set_volume(40));
        assert!(!session.set_volume(40));
        assert!(session.set_mute(true));

        assert_eq!(
            rx.try_recv().unwrap(),
            PlayerEvent::Change(ModelChange::Volume(40))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PlayerEvent::Change(ModelChange::Mute(true))
        );
        assert!(rx.try_recv().is_err());
    }
}
