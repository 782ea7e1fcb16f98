//! Output formatting for CLI

use chrono::{DateTime, Utc};
use kino_playback::{AdEvent, ModelChange, PlayerEvent};
use serde::Serialize;

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Format output based on selected format
pub fn format_output<T: Serialize>(data: &T, format: &str) -> String {
    match OutputFormat::from(format) {
        OutputFormat::Json => {
            serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table | OutputFormat::Text => {
            let value = serde_json::to_value(data).unwrap_or_default();
            let mut lines = Vec::new();
            flatten("", &value, &mut lines);
            lines.join("\n")
        }
    }
}

fn flatten(prefix: &str, value: &serde_json::Value, lines: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&key, v, lines);
            }
        }
        serde_json::Value::Array(items) if !items.is_empty() => {
            lines.push(format!("  {}: {} entries", prefix, items.len()));
        }
        other => lines.push(format!("  {}: {}", prefix, other)),
    }
}

/// True for the high-frequency clock events
pub fn is_clock_event(event: &PlayerEvent) -> bool {
    matches!(
        event,
        PlayerEvent::Time { .. }
            | PlayerEvent::Change(ModelChange::Position(_))
            | PlayerEvent::Change(ModelChange::Buffer(_))
            | PlayerEvent::Ad(AdEvent::Time { .. })
    )
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a PlayerEvent,
}

/// One event as a single output line
pub fn event_line(event: &PlayerEvent, format: &str) -> String {
    let timestamp = Utc::now();
    match OutputFormat::from(format) {
        OutputFormat::Json => serde_json::to_string(&EventLine { timestamp, event })
            .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Table | OutputFormat::Text => {
            format!("[{}] {}", timestamp.format("%H:%M:%S%.3f"), describe(event))
        }
    }
}

fn describe(event: &PlayerEvent) -> String {
    match event {
        PlayerEvent::Change(change) => match change {
            ModelChange::State(state) => format!("state -> {}", state),
            ModelChange::MediaState(state) => format!("media -> {}", state),
            ModelChange::Position(p) => format!("position {:.2}s", p),
            ModelChange::Duration(d) => format!("duration {:.2}s", d),
            ModelChange::StreamType(t) => format!("stream type {}", t),
            other => format!("{} changed: {:?}", other.field(), other),
        },
        PlayerEvent::PlaylistLoaded { count } => format!("playlist loaded ({} items)", count),
        PlayerEvent::PlaylistItem { index, title } => format!(
            "item {} selected{}",
            index,
            title.as_deref().map(|t| format!(" ({})", t)).unwrap_or_default()
        ),
        PlayerEvent::Play { reason, old_state } => {
            format!("play ({}, from {})", reason, old_state)
        }
        PlayerEvent::Pause { reason } => format!("pause ({})", reason),
        PlayerEvent::Time { position, duration } => {
            format!("time {:.2}/{:.2}", position, duration)
        }
        PlayerEvent::Seek {
            position, offset, ..
        } => format!("seek {:.2} -> {:.2}", position, offset),
        PlayerEvent::SetupError(payload) | PlayerEvent::Error(payload) => format!(
            "error {} {} - {}",
            payload.code, payload.key, payload.message
        ),
        PlayerEvent::Ad(ad) => format!("ad: {:?}", ad),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_playback::PlaybackState;

    #[test]
    fn test_json_event_line_has_timestamp() {
        let line = event_line(&PlayerEvent::Complete, "json");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "complete");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_text_event_line() {
        let line = event_line(
            &PlayerEvent::Change(ModelChange::State(PlaybackState::Playing)),
            "text",
        );
        assert!(line.ends_with("state -> playing"));
    }

    #[test]
    fn test_clock_events_detected() {
        assert!(is_clock_event(&PlayerEvent::Time {
            position: 1.0,
            duration: 2.0
        }));
        assert!(!is_clock_event(&PlayerEvent::Complete));
    }
}
