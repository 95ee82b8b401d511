use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prayer_times::{
    FetchRequest, Prayer, PrayerTimesApp, PrayerTimesResult,
    config::AppConfig,
    models::Coordinates,
    schedule,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "prayer-times")]
#[command(about = "Daily prayer times with caching and notifications")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print today's prayer times
    Show {
        /// Ignore the cache and fetch again
        #[arg(long)]
        refresh: bool,
        /// Use these coordinates instead of the configured location
        #[arg(long, requires = "longitude", allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[arg(long, requires = "latitude", allow_hyphen_values = true)]
        longitude: Option<f64>,
    },
    /// Print the next prayer and the time remaining
    Next,
    /// Print cache and notification state
    Status,
    /// Delete the cached prayer times
    ClearCache,
    /// Turn notifications for one prayer on or off
    Toggle { prayer: Prayer, state: Switch },
    /// Keep prayer times fresh and deliver notifications (headless)
    Daemon,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("prayer_times=debug");

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let config = Arc::new(config);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let app = PrayerTimesApp::from_config(config)?;
        run(&app, args.command).await
    })
}

async fn run(app: &PrayerTimesApp, command: Command) -> Result<()> {
    match command {
        Command::Show {
            refresh,
            latitude,
            longitude,
        } => {
            let coordinates = latitude
                .zip(longitude)
                .map(|(lat, lon)| Coordinates::new(lat, lon));
            let result = app
                .fetch(FetchRequest {
                    force_refresh: refresh,
                    coordinates,
                })
                .await?;
            if let Some(place) = app.describe_location(coordinates).await {
                println!("{}", place);
            }
            print_timings(&result);
        }
        Command::Next => {
            let result = app.fetch(FetchRequest::default()).await?;
            match app.countdown(&result) {
                Some(countdown) => println!(
                    "{} at {} (in {}){}",
                    countdown.next_prayer,
                    countdown.time,
                    countdown.formatted(),
                    if countdown.is_imminent { " - now" } else { "" }
                ),
                None => println!("No upcoming prayer found"),
            }
        }
        Command::Status => {
            let manager = app.manager();
            let valid = manager.has_valid_cached_data().await;
            println!("Cache valid for today: {}", if valid { "yes" } else { "no" });

            let include = app.include_map().await;
            let scheduled = schedule::load_schedule_map(app.store()).await;
            for prayer in Prayer::ALL {
                let enabled = include.get(&prayer).copied().unwrap_or(false);
                let id = scheduled.get(&prayer).map(String::as_str).unwrap_or("-");
                println!(
                    "{:<8} notify: {:<3} scheduled: {}",
                    prayer,
                    if enabled { "on" } else { "off" },
                    id
                );
            }
        }
        Command::ClearCache => {
            app.manager().clear_cache().await;
            println!("Cache cleared");
        }
        Command::Toggle { prayer, state } => {
            let included = matches!(state, Switch::On);
            app.set_included(prayer, included).await?;
            println!(
                "{} notifications {}",
                prayer,
                if included { "enabled" } else { "disabled" }
            );
        }
        Command::Daemon => app.run_daemon().await?,
    }

    Ok(())
}

fn print_timings(result: &PrayerTimesResult) {
    if !result.date.readable.is_empty() {
        println!("{}", result.date.readable);
    }
    if let Some(hijri) = &result.date.hijri {
        println!("{}", hijri);
    }
    println!("Timezone: {}", result.timezone);
    for (prayer, time) in result.timings.iter() {
        println!("{:<8} {}", prayer, time);
    }
}
