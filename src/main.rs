use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nimbus_core::{AppError, NimbusConfig, TemperatureUnit};
use nimbus_store::{HistoryStore, PreferenceStore, WeatherObservation};
use nimbus_weather::{
    format_size, is_valid_city_name, normalize_city_query, IconCache, WeatherSession,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about = "Local weather history, favorites and icon cache", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recent observations, newest first
    History {
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only observations for this exact city name
        #[arg(short, long)]
        city: Option<String>,
    },
    /// Delete one observation by id
    HistoryDelete { id: Uuid },
    /// Delete all observations
    HistoryClear,

    /// List favorite cities
    Favorites,
    FavoriteAdd { city: String },
    FavoriteRemove { city: String },
    FavoriteToggle { city: String },
    FavoritesClear,

    /// Show or set the temperature unit
    Unit { unit: Option<TemperatureUnit> },

    /// Show icon cache size
    CacheSize,
    CacheClear,
    /// Evict expired icons now
    CacheSweep,

    /// Record an observation manually
    Record {
        #[arg(long)]
        city: String,
        #[arg(long, allow_negative_numbers = true)]
        temperature: f64,
        #[arg(long, allow_negative_numbers = true)]
        feels_like: f64,
        #[arg(long)]
        description: String,
        #[arg(long)]
        icon: String,
        #[arg(long)]
        humidity: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = start(cli).await {
        eprintln!("{}", e.user_message());
        return Err(e.into());
    }
    Ok(())
}

async fn start(cli: Cli) -> Result<(), AppError> {
    let config_path = match cli.config {
        Some(path) => path,
        None => NimbusConfig::config_path()?,
    };
    let (config, validation) = NimbusConfig::load_validated(&config_path)?;
    nimbus_core::init(&config.logging.level)?;
    for warning in &validation.warnings {
        tracing::warn!("Config warning: {}", warning);
    }

    let session = open_session(&config)?;
    tracing::debug!("Nimbus session ready");

    run(cli.command, &session, &config).await
}

/// The one place the stores are constructed.
fn open_session(config: &NimbusConfig) -> Result<WeatherSession, AppError> {
    let history =
        HistoryStore::open(config.history_db_path())?.with_lock_timeout(config.lock_timeout());
    let preferences = PreferenceStore::open(config.preferences_db_path())?
        .with_lock_timeout(config.lock_timeout());
    let icons = IconCache::new(config.icon_cache_dir(), config.cache_ttl());

    Ok(WeatherSession::new(
        Arc::new(history),
        Arc::new(preferences),
        Arc::new(icons),
    ))
}

async fn run(
    command: Commands,
    session: &WeatherSession,
    config: &NimbusConfig,
) -> Result<(), AppError> {
    match command {
        Commands::History { limit, city } => {
            let observations = match city {
                Some(city) => session.history().fetch_by_city(&city)?,
                None => session
                    .history()
                    .fetch_all(limit.unwrap_or(config.history.default_limit))?,
            };
            if observations.is_empty() {
                println!("No history");
            }
            for obs in &observations {
                print_observation(obs);
            }
        }
        Commands::HistoryDelete { id } => {
            if session.history().delete_one(id)? {
                println!("Deleted {}", id);
            } else {
                println!("No observation with id {}", id);
            }
        }
        Commands::HistoryClear => {
            let removed = session.clear_history()?;
            println!("Cleared {} observations", removed);
        }

        Commands::Favorites => {
            let favorites = session.preferences().favorites()?;
            if favorites.is_empty() {
                println!("No favorite cities");
            }
            for city in favorites {
                println!("{}", city);
            }
        }
        Commands::FavoriteAdd { city } => {
            let city = checked_city(&city)?;
            if session.preferences().add_favorite(city)? {
                println!("Added {}", city);
            } else {
                println!("{} is already a favorite", city);
            }
        }
        Commands::FavoriteRemove { city } => {
            let city = normalize_city_query(&city);
            if session.preferences().remove_favorite(city)? {
                println!("Removed {}", city);
            } else {
                println!("{} is not a favorite", city);
            }
        }
        Commands::FavoriteToggle { city } => {
            let city = checked_city(&city)?;
            let now_favorite = session.preferences().toggle_favorite(city)?;
            println!(
                "{} {}",
                city,
                if now_favorite { "added to favorites" } else { "removed from favorites" }
            );
        }
        Commands::FavoritesClear => {
            session.clear_favorites()?;
            println!("Favorites cleared");
        }

        Commands::Unit { unit } => match unit {
            Some(unit) => {
                session.preferences().set_unit(unit)?;
                println!("Temperature unit set to {}", unit.label());
            }
            None => {
                let choices: Vec<&str> =
                    TemperatureUnit::ALL.iter().map(TemperatureUnit::as_str).collect();
                println!(
                    "{} (choices: {})",
                    session.preferences().unit()?.label(),
                    choices.join(", ")
                );
            }
        },

        Commands::CacheSize => {
            println!(
                "{} ({} icons)",
                format_size(session.icon_cache_size()),
                session.icons().len()
            );
        }
        Commands::CacheClear => {
            let removed = session.clear_icon_cache();
            println!("Removed {} cached icons", removed);
        }
        Commands::CacheSweep => {
            let evicted = session.sweep_icon_cache();
            println!("Evicted {} expired icons", evicted);
        }

        Commands::Record {
            city,
            temperature,
            feels_like,
            description,
            icon,
            humidity,
        } => {
            let city = checked_city(&city)?;
            let obs = WeatherObservation::new(
                city,
                temperature,
                feels_like,
                description,
                icon,
                humidity,
            );
            let outcome = session.record_observation(&obs).await;
            if let Err(e) = &outcome.history {
                eprintln!("History not saved: {}", e.user_message());
            }
            if let Err(e) = &outcome.last_city {
                eprintln!("Last search not saved: {}", e.user_message());
            }
            print_observation(&obs);
            outcome.into_result()?;
        }
    }

    Ok(())
}

fn checked_city(input: &str) -> Result<&str, AppError> {
    if !is_valid_city_name(input) {
        return Err(anyhow::anyhow!("City name must be at least 2 characters: {:?}", input).into());
    }
    Ok(normalize_city_query(input))
}

fn print_observation(obs: &WeatherObservation) {
    println!(
        "{}  {:<16} {:>6.1}°C (feels {:.1}°C)  {:<16} {:>3}%  {}  [{}]",
        obs.timestamp.format("%Y-%m-%d %H:%M"),
        obs.city,
        obs.temperature,
        obs.feels_like,
        obs.description,
        obs.humidity,
        obs.icon,
        obs.id,
    );
}
