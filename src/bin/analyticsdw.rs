use std::process::ExitCode;
use std::time::Duration;

use analyticsdw::{
    AnalyticsDW, CancelToken, CleanupReport, DataSummary, DateFilter, ErrorKind, HealthReport,
    RunRecord, RunSummary, WarehouseStatus,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Environment variable holding the pre-authenticated bearer token.
const ACCESS_TOKEN_ENV: &str = "GA_ACCESS_TOKEN";
/// Environment override for the configured property id.
const PROPERTY_ID_ENV: &str = "GA_PROPERTY_ID";

#[derive(Parser)]
#[command(name = "analyticsdw", about = "Web analytics data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.analyticsdw/analyticsdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the trailing window from Google Analytics and store it
    Fetch {
        /// Days to look back from today (1-365, default: config default_days_back)
        #[arg(long)]
        days_back: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarize stored metrics
    Summary {
        /// Only include dates on or after this day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        /// Only include dates on or before this day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Permanently delete old metrics
    Cleanup {
        /// Days of data to keep (minimum 7, default: config days_to_keep)
        #[arg(long)]
        days_to_keep: Option<u32>,
        /// Confirm the deletion. Without this flag nothing is deleted.
        #[arg(long)]
        yes: bool,
    },
    /// Fetch on a fixed interval until interrupted
    Schedule {
        /// Minutes between runs (default: config schedule_interval_minutes)
        #[arg(long)]
        every_minutes: Option<u64>,
        /// Days to look back on each run
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Show recent pipeline runs
    Runs {
        /// Maximum runs to show
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show warehouse status
    Status,
    /// Check that the analytics property is reachable (fetches one day, stores nothing)
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    analyticsdw::date_util::parse_date_key(s).ok_or_else(|| format!("expected YYYY-MM-DD, got {s:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Process status for a failed command, by error kind.
fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(e) = err.downcast_ref::<analyticsdw::Error>() else {
        return 1;
    };
    match e.kind() {
        ErrorKind::InvalidArgument | ErrorKind::Config => 2,
        kind if kind.is_upstream() => 3,
        kind if kind.is_storage() => 4,
        ErrorKind::RunAlreadyInProgress => 5,
        ErrorKind::RunCancelled => 130,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db = match &cli.db {
        Some(path) => analyticsdw::Database::open_at(path).await?,
        None => analyticsdw::Database::open().await?,
    };
    let dw = AnalyticsDW::open(db).await?;

    match cli.command {
        Commands::Fetch { days_back, json } => {
            let dw = with_fetcher(dw)?;
            let cancel = cancel_on_ctrl_c();
            let summary = dw.fetch_data_with_cancel(days_back, cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_run_summary(&summary);
            }
        }
        Commands::Summary { from, to, json } => {
            let filter = DateFilter::new(from, to)?;
            let summary = dw.data_summary(Some(filter)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_data_summary(&summary);
            }
        }
        Commands::Cleanup { days_to_keep, yes } => {
            handle_cleanup(&dw, days_to_keep, yes).await?;
        }
        Commands::Schedule {
            every_minutes,
            days_back,
        } => {
            let dw = with_fetcher(dw)?;
            if every_minutes == Some(0) {
                return Err(analyticsdw::Error::InvalidArgument(
                    "--every-minutes must be greater than zero".into(),
                )
                .into());
            }
            let interval = every_minutes.map(|m| Duration::from_secs(m * 60));
            let scheduler = dw.scheduler(interval, days_back)?;
            let shutdown = cancel_on_ctrl_c();
            eprintln!("Scheduler running. Press Ctrl-C to stop.");
            let stats = scheduler.run_until(&shutdown).await;
            println!(
                "Stopped after {} runs: {} succeeded, {} failed, {} skipped",
                stats.ticks, stats.succeeded, stats.failed, stats.skipped_busy
            );
        }
        Commands::Runs { limit, json } => {
            let runs = dw.runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_runs(&runs);
            }
        }
        Commands::Status => {
            let status = dw.status().await?;
            print_status(&status);
        }
        Commands::Health { json } => {
            let dw = with_fetcher(dw)?;
            let health = dw.health().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                print_health(&health);
            }
            if !health.connected {
                anyhow::bail!("upstream check failed");
            }
        }
        Commands::Config { action } => {
            handle_config(&dw, action).await?;
        }
    }
    Ok(())
}

/// Attach the Google Analytics fetcher from the environment.
fn with_fetcher(dw: AnalyticsDW) -> anyhow::Result<AnalyticsDW> {
    let token = std::env::var(ACCESS_TOKEN_ENV).map_err(|_| {
        analyticsdw::Error::Config(format!(
            "{ACCESS_TOKEN_ENV} is not set (expected a pre-authenticated bearer token)"
        ))
    })?;

    let dw = match std::env::var(PROPERTY_ID_ENV) {
        Ok(id) if !id.trim().is_empty() => {
            let mut config = dw.config().clone();
            config.apply(analyticsdw::config::KEY_PROPERTY_ID, &id)?;
            AnalyticsDW::new(dw.store().database().clone(), config)
        }
        _ => dw,
    };
    Ok(dw.with_google_analytics(&token)?)
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, cancelling...");
                token.cancel();
            }
        }
    });
    token
}

async fn handle_cleanup(dw: &AnalyticsDW, days_to_keep: Option<u32>, yes: bool) -> anyhow::Result<()> {
    let days_to_keep = days_to_keep.unwrap_or(dw.config().days_to_keep);
    analyticsdw::config::validate_days_to_keep(days_to_keep)?;

    if !yes {
        let cutoff = analyticsdw::date_util::days_before(analyticsdw::date_util::today(), days_to_keep);
        let affected = match cutoff.pred_opt() {
            Some(last) => {
                dw.data_summary(Some(DateFilter::new(None, Some(last))?))
                    .await?
                    .total_records
            }
            None => 0,
        };
        println!("WARNING: cleanup permanently deletes every record dated before {cutoff}.");
        println!("  {affected} records would be deleted. This cannot be undone.");
        println!("  Re-run with --yes to proceed.");
        return Ok(());
    }

    let report = dw.cleanup_data(Some(days_to_keep)).await?;
    print_cleanup(&report);
    Ok(())
}

async fn handle_config(dw: &AnalyticsDW, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match dw.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            dw.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = dw.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

fn print_run_summary(s: &RunSummary) {
    println!("Run {}: {}", s.run_id, s.window);
    println!("  Fetched:  {}", s.records_fetched);
    println!(
        "  Written:  {} ({} new, {} updated)",
        s.records_written, s.records_inserted, s.records_updated
    );
    if s.skipped_duplicate > 0 {
        println!("  Skipped:  {} duplicates", s.skipped_duplicate);
    }
    println!("  Duration: {}ms", s.duration.as_millis());
}

fn print_data_summary(s: &DataSummary) {
    println!("Data Summary");
    println!("  Records:      {}", s.total_records);
    match &s.date_range {
        Some(range) => println!("  Date range:   {} to {} ({} days with data)", range.start, range.end, s.distinct_dates),
        None => println!("  Date range:   (no data)"),
    }
    if !s.metric_names.is_empty() {
        println!("  Metrics:      {}", s.metric_names.join(", "));
    }
    if !s.sources.is_empty() {
        println!("  Sources:      {}", s.sources.join(", "));
    }
    if !s.properties.is_empty() {
        println!("  Properties:   {}", s.properties.join(", "));
    }
    println!(
        "  Last updated: {}",
        s.last_updated.as_deref().unwrap_or("never")
    );
}

fn print_cleanup(r: &CleanupReport) {
    println!(
        "Deleted {} records dated before {} (kept {} days).",
        r.deleted, r.cutoff, r.days_to_keep
    );
}

fn print_runs(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    for r in runs {
        let outcome = match (&r.error_kind, &r.error_message) {
            (Some(kind), Some(msg)) => format!("{kind}: {msg}"),
            _ => format!(
                "fetched {}, inserted {}, updated {}",
                r.records_fetched, r.records_inserted, r.records_updated
            ),
        };
        println!(
            "#{:<5} {:<10} {} {}..{}  {}",
            r.id, r.status, r.started_at, r.window_start, r.window_end, outcome
        );
    }
}

fn print_status(s: &WarehouseStatus) {
    println!("Warehouse Status");
    println!("  Records:   {}", s.summary.total_records);
    match &s.summary.date_range {
        Some(range) => println!("  Covered:   {} to {}", range.start, range.end),
        None => println!("  Covered:   (no data)"),
    }
    match &s.last_run {
        Some(run) => println!(
            "  Last run:  #{} {} at {}",
            run.id,
            run.status,
            run.completed_at.as_deref().unwrap_or(&run.started_at)
        ),
        None => println!("  Last run:  never"),
    }
    if s.gaps.is_empty() {
        println!("  Gaps:      none in the default window");
    } else {
        let gaps: Vec<String> = s.gaps.iter().map(|g| g.to_string()).collect();
        println!("  Gaps:      {}", gaps.join(", "));
    }
}

fn print_health(h: &HealthReport) {
    println!("Upstream Health");
    println!(
        "  Property:  {}",
        h.property_id.as_deref().unwrap_or("(not configured)")
    );
    if h.connected {
        println!("  Status:    connected");
        println!("  Records:   {} available for {}", h.records_available, h.window);
        if let Some(last) = h.last_data_date {
            println!("  Latest:    {last}");
        }
    } else {
        let kind = h.error_kind.map_or("unknown".to_string(), |k| k.to_string());
        println!("  Status:    error [{kind}]");
        println!("  Error:     {}", h.error.as_deref().unwrap_or(""));
    }
    println!("  Stored:    {} records", h.database.total_records);
}
