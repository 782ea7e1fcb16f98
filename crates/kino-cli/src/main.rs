//! Kino CLI - Headless playback driver
//!
//! Features:
//! - Playlist simulation against simulated providers
//! - Ad break insertion
//! - Provider selection inspection
//! - Configuration validation

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Kino CLI - Playback orchestration toolkit
#[derive(Parser)]
#[command(name = "kino-cli")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Headless playback simulation and inspection", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a playlist through simulated providers and print events
    Simulate {
        /// Media URLs to play in order
        urls: Vec<String>,

        /// JSON playlist file (array of items)
        #[arg(short, long)]
        playlist: Option<PathBuf>,

        /// JSON controller configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON simulation profile
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Insert an ad break with this media URL
        #[arg(long)]
        ad: Option<String>,

        /// Content position (seconds) at which the ad break starts
        #[arg(long, default_value = "5")]
        ad_at: f64,

        /// Stop after this many seconds (0 = until the playlist completes)
        #[arg(short = 't', long, default_value = "0")]
        timeout: u64,

        /// Include time and position updates
        #[arg(long)]
        all_events: bool,
    },

    /// Show which provider would handle each URL
    Providers {
        /// Media URLs to match
        urls: Vec<String>,
    },

    /// Validate a configuration file and print the effective settings
    Config {
        /// JSON controller configuration
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    kino_playback::init();

    match cli.command {
        Commands::Simulate {
            urls,
            playlist,
            config,
            profile,
            ad,
            ad_at,
            timeout,
            all_events,
        } => {
            let options = commands::SimulateOptions {
                urls,
                playlist,
                config,
                profile,
                ad,
                ad_at,
                timeout,
                all_events,
            };
            commands::simulate(options, &cli.format).await?;
        }
        Commands::Providers { urls } => {
            commands::providers(&urls, &cli.format)?;
        }
        Commands::Config { path } => {
            commands::config(path, &cli.format)?;
        }
    }

    Ok(())
}
