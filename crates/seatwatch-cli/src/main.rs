use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use seatwatch_adapters::{extract_matches, AvailabilitySource, ETicketSource};
use seatwatch_core::{
    parse_time_of_day, parse_travel_date, Filters, NewSubscription, QueryKey, QuietWindow, Station,
    Subscription,
};
use seatwatch_storage::{HttpFetcher, PgSubscriptionStore, SubscriptionStore};
use seatwatch_sync::{StationRegistry, WatchConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "seatwatch")]
#[command(about = "Train seat availability watcher")]
struct Cli {
    /// Log level for seatwatch crates when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured interval until interrupted.
    Run,
    /// Run a single polling cycle and exit.
    Tick,
    Migrate,
    /// List known station keys.
    Stations,
    /// Fetch one route/date and print the ranked seat matches.
    Probe {
        origin: String,
        destination: String,
        date: String,
        #[arg(long, default_value_t = 1)]
        min_seats: u32,
        #[arg(long)]
        max_price: Option<u64>,
    },
    Add {
        #[arg(long)]
        owner: i64,
        origin: String,
        destination: String,
        date: String,
        #[arg(long, default_value_t = 1)]
        min_seats: u32,
        #[arg(long)]
        max_price: Option<u64>,
    },
    List {
        #[arg(long)]
        owner: i64,
    },
    Remove {
        #[arg(long)]
        owner: i64,
        id: i64,
    },
    Pause {
        #[arg(long)]
        owner: i64,
        id: i64,
    },
    Resume {
        #[arg(long)]
        owner: i64,
        id: i64,
    },
    /// `quiet off` or `quiet HH:MM HH:MM`; applies to all of the owner's watches.
    Quiet {
        #[arg(long)]
        owner: i64,
        start: String,
        end: Option<String>,
    },
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("seatwatch={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn resolve_station<'a>(registry: &'a StationRegistry, key: &str) -> Result<&'a Station> {
    if let Some(station) = registry.get(key) {
        return Ok(station);
    }
    match registry.suggest(key) {
        Some(near) => bail!("unknown station '{key}'; did you mean '{}'?", near.key),
        None => bail!("unknown station '{key}'; run `seatwatch stations` for the list"),
    }
}

fn quiet_window_from_args(start: &str, end: Option<&str>) -> Result<QuietWindow> {
    match (start.trim(), end) {
        (s, None) if s.eq_ignore_ascii_case("off") => Ok(QuietWindow::disabled()),
        (_, None) => bail!("quiet expects `off` or a start and end time"),
        (s, Some(e)) => Ok(QuietWindow::new(parse_time_of_day(s)?, parse_time_of_day(e)?)),
    }
}

fn describe(sub: &Subscription) -> String {
    let price = sub
        .filters
        .max_price
        .map(|p| format!(" max_price={p}"))
        .unwrap_or_default();
    let quiet = if sub.quiet.enabled {
        format!(
            "{}-{}",
            sub.quiet.start.format("%H:%M"),
            sub.quiet.end.format("%H:%M")
        )
    } else {
        "off".to_string()
    };
    format!(
        "#{} {} → {} {} min_seats={}{} quiet={} {}{}",
        sub.id,
        sub.origin.label,
        sub.destination.label,
        sub.travel_date.format("%Y-%m-%d"),
        sub.filters.min_seats,
        price,
        quiet,
        if sub.active { "active" } else { "paused" },
        if sub.state.last_available { " (seats seen)" } else { "" },
    )
}

async fn store(config: &WatchConfig) -> Result<PgSubscriptionStore> {
    PgSubscriptionStore::connect(&config.database_url)
        .await
        .context("connecting to subscription store")
}

fn not_found(id: i64) -> anyhow::Error {
    anyhow!("subscription #{id} not found for this owner")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            seatwatch_sync::run_watch_from_env().await?;
        }
        Commands::Tick => {
            let summary = seatwatch_sync::tick_once_from_env().await?;
            println!(
                "tick complete: run_id={} subscriptions={} groups={} failed_groups={} notified={} delivery_failures={}",
                summary.run_id,
                summary.subscriptions,
                summary.groups,
                summary.failed_groups,
                summary.notified,
                summary.delivery_failures
            );
        }
        Commands::Migrate => {
            store(&config).await?.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Stations => {
            let registry = StationRegistry::load(&config.workspace_root)?;
            for station in registry.stations() {
                println!("{:<12} {:<8} {}", station.key, station.code, station.label);
            }
        }
        Commands::Probe {
            origin,
            destination,
            date,
            min_seats,
            max_price,
        } => {
            let registry = StationRegistry::load(&config.workspace_root)?;
            let query = QueryKey {
                origin_code: resolve_station(&registry, &origin)?.code.clone(),
                destination_code: resolve_station(&registry, &destination)?.code.clone(),
                travel_date: parse_travel_date(&date)?,
            };
            let filters = Filters::new(min_seats, max_price)?;
            let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
            let source = ETicketSource::new(http, config.eticket_base_url.clone());
            let snapshot = source.fetch(&query).await?;
            let matches = extract_matches(&snapshot.body, &filters);
            if matches.is_empty() {
                println!("no matching seats for {query}");
            }
            for m in matches {
                let fare = m.min_fare.map(|f| f.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{} {} {} {:<10} seats={} fare={}",
                    m.run_type, m.run_number, m.departure_date, m.fare_class, m.free_seats, fare
                );
            }
        }
        Commands::Add {
            owner,
            origin,
            destination,
            date,
            min_seats,
            max_price,
        } => {
            let registry = StationRegistry::load(&config.workspace_root)?;
            let new = NewSubscription::new(
                owner,
                resolve_station(&registry, &origin)?.clone(),
                resolve_station(&registry, &destination)?.clone(),
                parse_travel_date(&date)?,
                Filters::new(min_seats, max_price)?,
            )?;
            let created = store(&config).await?.create(new).await?;
            println!("added {}", describe(&created));
        }
        Commands::List { owner } => {
            let subs = store(&config).await?.list_for_owner(owner).await?;
            if subs.is_empty() {
                println!("no subscriptions");
            }
            for sub in &subs {
                println!("{}", describe(sub));
            }
        }
        Commands::Remove { owner, id } => {
            if !store(&config).await?.delete(id, owner).await? {
                return Err(not_found(id));
            }
            println!("removed #{id}");
        }
        Commands::Pause { owner, id } => {
            if !store(&config).await?.set_active(id, owner, false).await? {
                return Err(not_found(id));
            }
            println!("paused #{id}");
        }
        Commands::Resume { owner, id } => {
            if !store(&config).await?.set_active(id, owner, true).await? {
                return Err(not_found(id));
            }
            println!("resumed #{id}");
        }
        Commands::Quiet { owner, start, end } => {
            let window = quiet_window_from_args(&start, end.as_deref())?;
            let updated = store(&config)
                .await?
                .set_quiet_window(owner, &window)
                .await?;
            println!("quiet window updated on {updated} subscription(s)");
        }
    }

    Ok(())
}
