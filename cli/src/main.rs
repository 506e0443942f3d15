// contact-tracer: desktop CLI
//
// Runs the tracing engine against a simulated radio, inspects the local
// encounter log and manages configuration.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use contact_tracer_core::{EncounterSession, EncounterStore};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "contact-tracer")]
#[command(about = "Contact Tracer: BLE proximity encounter logging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against simulated nearby devices
    Simulate {
        /// Number of synthetic nearby devices
        #[arg(short, long, default_value = "8")]
        peers: usize,
        /// Simulated seconds to run
        #[arg(short, long, default_value = "1800")]
        seconds: u64,
        /// Keep encounters in memory instead of the on-disk log
        #[arg(long)]
        memory: bool,
        /// Wall-clock milliseconds per simulated second
        #[arg(long, default_value = "5")]
        step_ms: u64,
    },
    /// Inspect the encounter log
    Encounters {
        #[command(subcommand)]
        action: EncounterAction,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show configuration and encounter log summary
    Status,
}

#[derive(Subcommand)]
enum EncounterAction {
    /// List encounters active within the last SECS_AGO seconds
    List {
        #[arg(short, long)]
        since: Option<u64>,
    },
    Stats,
    /// Remove encounters older than the retention period
    Purge {
        #[arg(short, long)]
        days: Option<u64>,
    },
    /// Print the whole log as JSON
    Export,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config)?;

    match cli.command {
        Commands::Simulate {
            peers,
            seconds,
            memory,
            step_ms,
        } => {
            let options = simulate::SimulationOptions {
                peers,
                seconds,
                memory,
                step_ms,
            };
            cmd_simulate(&config, options).await
        }
        Commands::Encounters { action } => cmd_encounters(&config, action),
        Commands::Config { action } => cmd_config(config, action),
        Commands::Status => cmd_status(&config),
    }
}

fn init_logging(
    config: &config::Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    if config.log_to_file {
        let appender =
            tracing_appender::rolling::daily(config::Config::data_dir()?, "contact-tracer.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        Ok(None)
    }
}

async fn cmd_simulate(config: &config::Config, options: simulate::SimulationOptions) -> Result<()> {
    println!(
        "{} {} peers for {} simulated seconds",
        "Simulating".bold(),
        options.peers,
        options.seconds
    );
    println!();

    let report = simulate::run(config, &options).await?;

    println!();
    println!("{}", "Simulation Summary".bold());
    println!("  Sightings:          {}", report.stats.sightings_received);
    println!("  Dropped sightings:  {}", report.stats.sightings_dropped);
    println!("  Sessions opened:    {}", report.stats.sessions_opened);
    println!("  Sessions persisted: {}", report.stats.sessions_persisted);
    if report.stats.storage_failures > 0 {
        println!(
            "  Storage failures:   {}",
            report.stats.storage_failures.to_string().bright_red()
        );
    }
    println!();
    println!(
        "  Encounter log: {} sessions, {} distinct identifiers",
        report.store.sessions, report.store.distinct_identifiers
    );
    Ok(())
}

fn open_store(config: &config::Config) -> Result<EncounterStore> {
    let path = config.encounter_db()?;
    EncounterStore::open(&path)
        .with_context(|| format!("Failed to open encounter log at {}", path.display()))
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn cmd_encounters(config: &config::Config, action: EncounterAction) -> Result<()> {
    let store = open_store(config)?;

    match action {
        EncounterAction::List { since } => {
            let since_ts = since.map(|ago| now_secs().saturating_sub(ago)).unwrap_or(0);
            let sessions = store.list_since(since_ts)?;

            if sessions.is_empty() {
                println!("{}", "No encounters recorded".dimmed());
                return Ok(());
            }

            println!("{} ({})", "Encounters".bold(), sessions.len());
            println!();
            println!(
                "  {:<10} {:<20} {:>9} {:>9} {:>16}",
                "DEVICE", "FIRST SEEN", "DURATION", "SIGHTINGS", "RSSI min/avg/max"
            );
            for session in &sessions {
                print_session(session);
            }
        }

        EncounterAction::Stats => {
            let stats = store.stats()?;
            println!("{}", "Encounter Log".bold());
            println!("  Sessions:             {}", stats.sessions);
            println!("  Distinct identifiers: {}", stats.distinct_identifiers);
            println!("  Total sightings:      {}", stats.total_sightings);
            if let Some(oldest) = stats.oldest_first_seen {
                println!("  Oldest:               {}", format_timestamp(oldest));
            }
            if let Some(newest) = stats.newest_last_seen {
                println!("  Newest:               {}", format_timestamp(newest));
            }
        }

        EncounterAction::Purge { days } => {
            let days = days.unwrap_or(config.tracer.retention.retention_days);
            let purged = store.purge_older_than(Duration::from_secs(days * 86_400), now_secs())?;
            store.flush()?;
            println!(
                "{} Purged {} encounters older than {} days",
                "✓".green(),
                purged,
                days
            );
        }

        EncounterAction::Export => {
            let sessions = store.list_since(0)?;
            let json =
                serde_json::to_string_pretty(&sessions).context("Failed to serialize encounters")?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn print_session(session: &EncounterSession) {
    println!(
        "  {:<10} {:<20} {:>8}s {:>9} {:>16}",
        session.remote.display_name().bright_cyan(),
        format_timestamp(session.first_seen),
        session.duration_secs,
        session.sighting_count,
        format!(
            "{}/{:.0}/{}",
            session.rssi_min,
            session.rssi_mean(),
            session.rssi_max
        )
    );
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<32} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_status(config: &config::Config) -> Result<()> {
    println!("{}", "Contact Tracer Status".bold());
    println!();

    println!("Config file:   {}", config::Config::config_file()?.display());
    println!("Encounter log: {}", config.encounter_db()?.display());
    println!(
        "Identifiers:   {} (rotate every {}s)",
        if config.user_id.is_some() { "keyed" } else { "random" },
        config.tracer.rotation.validity_secs
    );
    println!(
        "Scanning:      {}% duty cycle, {}ms interval",
        config.tracer.scan.duty_cycle_percent, config.tracer.scan.scan_interval_ms
    );
    println!(
        "Encounters:    {}s gap timeout, {} day retention",
        config.tracer.encounter.gap_timeout_secs, config.tracer.retention.retention_days
    );
    println!();

    let stats = open_store(config)?.stats()?;
    println!(
        "Encounters: {} sessions, {} distinct identifiers, {} sightings",
        stats.sessions, stats.distinct_identifiers, stats.total_sightings
    );

    Ok(())
}

fn format_timestamp(timestamp: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
