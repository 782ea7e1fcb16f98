//! Playlist items and the technical requirements they place on providers

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

/// A single flag a source requires or a provider supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    // Containers
    Mp4,
    WebM,
    Mp3,
    Aac,
    Flv,
    // Streaming protocols
    Hls,
    Dash,
    Rtmp,
    // DRM systems
    Widevine,
    PlayReady,
    FairPlay,
    ClearKey,
    // Ad units that execute their own creative
    Vpaid,
}

/// Set of capabilities, compared by superset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// True if every requirement in `other` is present here
    pub fn satisfies(&self, other: &CapabilitySet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// DRM scheme attached to a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrmScheme {
    Widevine,
    PlayReady,
    FairPlay,
    ClearKey,
}

impl From<DrmScheme> for Capability {
    fn from(scheme: DrmScheme) -> Self {
        match scheme {
            DrmScheme::Widevine => Capability::Widevine,
            DrmScheme::PlayReady => Capability::PlayReady,
            DrmScheme::FairPlay => Capability::FairPlay,
            DrmScheme::ClearKey => Capability::ClearKey,
        }
    }
}

/// One playable rendition of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Location of the media or manifest
    pub file: Url,
    /// Explicit type ("mp4", "hls", "dash", "vpaid", ...), inferred from the URL when absent
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub drm: Option<DrmScheme>,
    #[serde(default)]
    pub default: bool,
}

impl Source {
    pub fn new(file: Url) -> Self {
        Self {
            file,
            media_type: None,
            label: None,
            drm: None,
            default: false,
        }
    }

    pub fn with_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_drm(mut self, drm: DrmScheme) -> Self {
        self.drm = Some(drm);
        self
    }

    /// Container or protocol flag for this source
    pub fn container(&self) -> Option<Capability> {
        if let Some(kind) = self.media_type.as_deref() {
            return capability_for_type(kind);
        }
        if self.file.scheme().starts_with("rtmp") {
            return Some(Capability::Rtmp);
        }
        let path = self.file.path().to_lowercase();
        let ext = path.rsplit('.').next().unwrap_or_default();
        capability_for_type(ext)
    }

    /// Everything a provider needs to support to play this source
    pub fn requirements(&self) -> CapabilitySet {
        let mut set = CapabilitySet::new();
        if let Some(container) = self.container() {
            set.insert(container);
        }
        if let Some(drm) = self.drm {
            set.insert(drm.into());
        }
        set
    }
}

fn capability_for_type(kind: &str) -> Option<Capability> {
    match kind.to_lowercase().as_str() {
        "mp4" | "m4v" | "mov" | "video/mp4" => Some(Capability::Mp4),
        "webm" | "video/webm" => Some(Capability::WebM),
        "mp3" | "mpeg" | "audio/mpeg" => Some(Capability::Mp3),
        "aac" | "m4a" | "audio/aac" => Some(Capability::Aac),
        "flv" | "video/x-flv" => Some(Capability::Flv),
        "hls" | "m3u8" | "m3u" | "application/vnd.apple.mpegurl" => Some(Capability::Hls),
        "dash" | "mpd" | "application/dash+xml" => Some(Capability::Dash),
        "rtmp" => Some(Capability::Rtmp),
        "vpaid" | "application/javascript" => Some(Capability::Vpaid),
        _ => None,
    }
}

/// A playlist entry handed to the controller by collaborator code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    #[serde(default)]
    pub title: Option<String>,
    pub sources: Vec<Source>,
    /// Initial position in seconds
    #[serde(default)]
    pub start_time: Option<f64>,
    /// Advertised duration, used by simulated providers and for display before load
    #[serde(default)]
    pub duration: Option<f64>,
    /// Per-item mute override
    #[serde(default)]
    pub mute: Option<bool>,
    /// Per-item autostart override
    #[serde(default)]
    pub autostart: Option<bool>,
}

impl PlaylistItem {
    /// Create an item with a single source
    pub fn new(file: Url) -> Self {
        Self {
            title: None,
            sources: vec![Source::new(file)],
            start_time: None,
            duration: None,
            mute: None,
            autostart: None,
        }
    }

    /// Parse the URL and create an item from it
    pub fn from_url(file: &str) -> crate::Result<Self> {
        let url = Url::parse(file)
            .map_err(|e| crate::Error::InvalidConfig(format!("bad source url {}: {}", file, e)))?;
        Ok(Self::new(url))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_start_time(mut self, start: f64) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    /// The source a provider is chosen for: the one flagged default, else the first
    pub fn primary_source(&self) -> Option<&Source> {
        self.sources
            .iter()
            .find(|s| s.default)
            .or_else(|| self.sources.first())
    }

    /// True when both items resolve to the same primary source
    pub fn same_media(&self, other: &PlaylistItem) -> bool {
        match (self.primary_source(), other.primary_source()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Requirements of the primary source
    pub fn requirements(&self) -> CapabilitySet {
        self.primary_source()
            .map(Source::requirements)
            .unwrap_or_default()
    }

    /// Short label for logs and errors
    pub fn describe(&self) -> String {
        match (&self.title, self.primary_source()) {
            (Some(title), _) => title.clone(),
            (None, Some(source)) => source.file.to_string(),
            (None, None) => "<no sources>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_container_from_extension() {
        let source = Source::new(url("https://cdn.example.com/master.m3u8"));
        assert_eq!(source.container(), Some(Capability::Hls));

        let source = Source::new(url("https://cdn.example.com/movie.MP4"));
        assert_eq!(source.container(), Some(Capability::Mp4));
    }

    #[test]
    fn test_explicit_type_wins() {
        let source = Source::new(url("https://cdn.example.com/stream")).with_type("dash");
        assert_eq!(source.container(), Some(Capability::Dash));
    }

    #[test]
    fn test_requirements_include_drm() {
        let source = Source::new(url("https://cdn.example.com/manifest.mpd"))
            .with_drm(DrmScheme::Widevine);
        let reqs = source.requirements();
        assert!(reqs.contains(Capability::Dash));
        assert!(reqs.contains(Capability::Widevine));
    }

    #[test]
    fn test_superset_matching() {
        let provider: CapabilitySet = [Capability::Dash, Capability::Hls, Capability::Widevine]
            .into_iter()
            .collect();
        let needs: CapabilitySet = [Capability::Dash, Capability::Widevine].into_iter().collect();
        assert!(provider.satisfies(&needs));
        assert!(!needs.satisfies(&provider));
    }

    #[test]
    fn test_same_media_uses_primary_source() {
        let a = PlaylistItem::new(url("https://cdn.example.com/a.mp4")).with_title("A");
        let a2 = PlaylistItem::new(url("https://cdn.example.com/a.mp4")).with_title("Other");
        let b = PlaylistItem::new(url("https://cdn.example.com/b.mp4"));
        assert!(a.same_media(&a2));
        assert!(!a.same_media(&b));
    }

    #[test]
    fn test_item_deserializes() {
        let json = r#"{
            "title": "Intro",
            "sources": [{ "file": "https://cdn.example.com/intro.mp4" }],
            "duration": 30.0
        }"#;
        let item: PlaylistItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.describe(), "Intro");
        assert_eq!(item.duration, Some(30.0));
        assert!(item.requirements().contains(Capability::Mp4));
    }
}
