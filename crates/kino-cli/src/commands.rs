//! CLI command implementations

use crate::output::{event_line, format_output, is_clock_event, OutputFormat};
use anyhow::Context;
use kino_playback::provider::simulated::{SimulatedBackends, SimulationProfile};
use kino_playback::{
    AdEvent, ContainerHandle, Controller, ControllerConfig, PlayerEvent, PlaylistItem,
    ProviderRegistry, Reason,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Arguments of the `simulate` command
pub struct SimulateOptions {
    pub urls: Vec<String>,
    pub playlist: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub profile: Option<PathBuf>,
    pub ad: Option<String>,
    pub ad_at: f64,
    pub timeout: u64,
    pub all_events: bool,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::from_path(path)
            .with_context(|| format!("Invalid configuration {}", path.display())),
        None => Ok(ControllerConfig::default()),
    }
}

fn load_playlist(options: &SimulateOptions) -> anyhow::Result<Vec<PlaylistItem>> {
    let mut items: Vec<PlaylistItem> = match &options.playlist {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read playlist {}", path.display()))?;
            serde_json::from_str(&contents).context("Playlist must be a JSON array of items")?
        }
        None => Vec::new(),
    };
    for url in &options.urls {
        items.push(PlaylistItem::from_url(url)?);
    }
    if items.is_empty() {
        anyhow::bail!("No media given; pass URLs or --playlist");
    }
    Ok(items)
}

/// Play a playlist through simulated providers
pub async fn simulate(options: SimulateOptions, format: &str) -> anyhow::Result<()> {
    let config = load_config(options.config.as_ref())?;
    let profile: SimulationProfile = match &options.profile {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)
            .with_context(|| format!("Invalid profile {}", path.display()))?,
        None => SimulationProfile::default(),
    };
    let playlist = load_playlist(&options)?;
    let autostart = config.autostart.is_enabled();

    let registry = Arc::new(ProviderRegistry::new());
    SimulatedBackends::register(&registry, profile);
    let player = Controller::new(config, registry)?;
    info!(session = %player.session_id(), items = playlist.len(), "Starting simulation");

    let mut rx = player.subscribe();
    player.set_container(ContainerHandle::new("cli")).await?;
    player.set_viewable(true).await?;
    player.load(playlist).await?;
    if !autostart {
        player.play(Reason::External).await?;
    }

    let mut ad = options.ad.clone();
    let deadline = (options.timeout > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(options.timeout));

    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    info!("Simulation timed out");
                    break;
                }
            },
            None => rx.recv().await,
        };
        let event = match next {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if options.all_events || !is_clock_event(&event) {
            println!("{}", event_line(&event, format));
        }

        if let PlayerEvent::Time { position, .. } = event {
            if position >= options.ad_at && !player.instream_active() {
                if let Some(url) = ad.take() {
                    start_ad_break(&player, &url)?;
                }
            }
        }
        if matches!(
            event,
            PlayerEvent::PlaylistComplete | PlayerEvent::Destroyed
        ) {
            break;
        }
    }

    let snapshot = player.snapshot();
    player.destroy();
    println!("{}", format_output(&snapshot, format));
    Ok(())
}

fn start_ad_break(player: &Controller, url: &str) -> anyhow::Result<()> {
    let item = PlaylistItem::from_url(url)?;
    let instream = player.create_instream()?;
    info!(ad = %item.describe(), "Starting ad break");
    tokio::spawn(async move {
        if let Err(e) = instream.load_item(item).await {
            warn!(error = %e, "Ad break failed");
            let _ = instream.destroy().await;
        }
    });
    Ok(())
}

#[derive(Serialize, Tabled)]
struct ProviderMatch {
    url: String,
    provider: String,
    kind: String,
    priority: String,
}

/// Show which provider would handle each URL
pub fn providers(urls: &[String], format: &str) -> anyhow::Result<()> {
    let registry = ProviderRegistry::new();
    SimulatedBackends::register(&registry, SimulationProfile::default());

    if urls.is_empty() {
        let rows: Vec<ProviderMatch> = registry
            .descriptors()
            .into_iter()
            .map(|d| ProviderMatch {
                url: "-".into(),
                provider: d.name.clone(),
                kind: format!("{:?}", d.kind),
                priority: d.priority.to_string(),
            })
            .collect();
        print_rows(&rows, format);
        return Ok(());
    }

    let mut rows = Vec::new();
    for url in urls {
        let item = PlaylistItem::from_url(url)?;
        let row = match registry.choose(&item) {
            Some(d) => ProviderMatch {
                url: url.clone(),
                provider: d.name.clone(),
                kind: format!("{:?}", d.kind),
                priority: d.priority.to_string(),
            },
            None => ProviderMatch {
                url: url.clone(),
                provider: "none".into(),
                kind: "-".into(),
                priority: "-".into(),
            },
        };
        rows.push(row);
    }
    print_rows(&rows, format);
    Ok(())
}

fn print_rows(rows: &[ProviderMatch], format: &str) {
    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", format_output(&rows, format)),
        OutputFormat::Table => println!("{}", Table::new(rows).with(Style::rounded())),
        OutputFormat::Text => {
            for row in rows {
                println!(
                    "  {} -> {} ({}, priority {})",
                    row.url, row.provider, row.kind, row.priority
                );
            }
        }
    }
}

/// Validate a configuration file
pub fn config(path: Option<PathBuf>, format: &str) -> anyhow::Result<()> {
    let config = load_config(path.as_ref())?;
    if let Some(path) = &path {
        println!("Configuration {} is valid", path.display());
    }
    println!("{}", format_output(&config, format));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(urls: &[&str]) -> SimulateOptions {
        SimulateOptions {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            playlist: None,
            config: None,
            profile: None,
            ad: None,
            ad_at: 5.0,
            timeout: 0,
            all_events: false,
        }
    }

    #[test]
    fn test_playlist_from_urls() {
        let items = load_playlist(&options(&["https://cdn.example.com/a.mp4"])).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_empty_playlist_rejected() {
        assert!(load_playlist(&options(&[])).is_err());
    }

    #[test]
    fn test_default_config_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.volume, ControllerConfig::default().volume);
    }
}
