//! Hyperchunk CLI
//!
//! Command-line interface for Hyperchunk operations:
//! - Generate and load sample data
//! - Inspect chunks and compressed segments
//! - Compress, decompress and tier chunks
//! - Refresh and query continuous aggregates
//! - Run policy jobs once or as a service

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use hyperchunk::aggregate::{parse_duration, QueryOptions, ResultRow};
use hyperchunk::ingest::{self, CsvRecord, GeneratorConfig, ProductionGenerator, QualityGenerator, SensorGenerator};
use hyperchunk::storage::{format_millis, Event, ScanFilter, TimeRange};
use hyperchunk::{Config, Database, JobStatus, LoggingConfig, PolicyIntervals, RefreshOutcome};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "hyperchunk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chunked time-series storage with continuous aggregates")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: user config dir, /etc/hyperchunk, ./config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overrides the config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub format: Format,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

/// Sample data set written by `generate`
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Feed {
    /// Sensor readings per machine
    Sensors,
    /// Throughput and efficiency per line and machine
    Production,
    /// Quality control tests per batch
    Quality,
    /// Preventive and corrective maintenance per machine
    Maintenance,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write sample plant data as CSV
    Generate {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Data set to write
        #[arg(long, value_enum, default_value = "sensors")]
        feed: Feed,
        /// Days of data
        #[arg(long, default_value = "3")]
        days: i64,
        /// Time between rows of one machine (default: 2m for sensors, 5m for production)
        #[arg(long)]
        interval: Option<String>,
        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
        /// First timestamp (default: `days` ago)
        #[arg(long)]
        start: Option<String>,
    },

    /// Bulk-load a CSV file into a table
    Load {
        /// Table name
        table: String,
        /// Path to CSV file
        path: PathBuf,
    },

    /// Print raw rows
    Scan {
        table: String,
        /// Range start: timestamp, or a duration back from now (e.g. 7d)
        #[arg(long)]
        start: Option<String>,
        /// Range end: timestamp, or a duration back from now
        #[arg(long)]
        end: Option<String>,
        /// Tag filters in key=value format
        #[arg(short = 'T', long)]
        tag: Vec<String>,
        /// Maximum rows to print
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// List a table's chunks
    Chunks { table: String },

    /// List the segments of a compressed chunk
    Segments { table: String, chunk: u32 },

    /// Compress a chunk
    Compress { table: String, chunk: u32 },

    /// Decompress a chunk back to rows
    Decompress { table: String, chunk: u32 },

    /// Move a compressed chunk to cold storage
    Tier { table: String, chunk: u32 },

    /// Refresh a continuous aggregate
    Refresh {
        aggregate: String,
        /// Force-refresh from this time instead of a regular run
        #[arg(long)]
        start: Option<String>,
        /// Force-refresh up to this time
        #[arg(long)]
        end: Option<String>,
    },

    /// Query a continuous aggregate
    Query {
        aggregate: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Roll buckets up to a wider width (e.g. 1d)
        #[arg(short, long)]
        bucket: Option<String>,
        /// Ignore rows above the watermark
        #[arg(long)]
        materialized_only: bool,
        /// Aggregate raw rows directly
        #[arg(long)]
        raw: bool,
    },

    /// Run due jobs once
    Jobs {
        /// List jobs instead of running them
        #[arg(long)]
        list: bool,
        /// Job ids to leave out of this run (e.g. compression:sensor_data)
        #[arg(long)]
        skip: Vec<String>,
    },

    /// Run the job scheduler until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Config { output } => {
            let template = hyperchunk::generate_default_config();
            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &template)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", template),
            }
        }

        Commands::Generate {
            output,
            feed,
            days,
            interval,
            seed,
            start,
        } => {
            let now = Utc::now().timestamp_millis();
            let interval = match (interval, feed) {
                (Some(interval), _) => parse_duration(&interval)?,
                (None, Feed::Production) => ingest::PRODUCTION_INTERVAL,
                (None, _) => GeneratorConfig::default().interval,
            };
            let config = GeneratorConfig {
                start: start.as_deref().map(|s| parse_time(s, now)).transpose()?,
                days,
                interval,
                seed,
            };
            let rows = match feed {
                Feed::Sensors => write_feed(output.as_ref(), SensorGenerator::new(&config))?,
                Feed::Production => write_feed(output.as_ref(), ProductionGenerator::new(&config))?,
                Feed::Quality => write_feed(output.as_ref(), QualityGenerator::new(&config))?,
                Feed::Maintenance => write_feed(output.as_ref(), ingest::maintenance_events(&config))?,
            };
            if let Some(path) = output {
                eprintln!("Wrote {} rows to {:?}", rows, path);
            }
        }

        Commands::Load { table, path } => {
            if !path.exists() {
                bail!("File not found: {:?}", path);
            }
            let db = open_database(&config).await?;
            let table = db.table(&table)?;
            let report = tokio::task::spawn_blocking(move || {
                let report = ingest::load_csv(&table, &path);
                table.sync()?;
                anyhow::Ok(report?)
            })
            .await??;

            println!("Load results:");
            println!("  Rows read: {}", report.rows_read);
            println!("  Rows failed: {}", report.rows_failed);
            println!("  Inserted: {}", report.batch.inserted);
            println!("  Rejected: {}", report.batch.rejected.len());
            if !report.errors.is_empty() {
                println!();
                println!("Errors (first 10):");
                for error in report.errors.iter().take(10) {
                    println!("  {}", error);
                }
            }
            for rejection in report.batch.rejected.iter().take(10) {
                println!("  Rejected row {}: {}", rejection.index, rejection.error);
            }
        }

        Commands::Scan {
            table,
            start,
            end,
            tag,
            limit,
        } => {
            let db = open_database(&config).await?;
            let range = parse_range(start.as_deref(), end.as_deref())?;
            let mut filter = ScanFilter::new();
            for pair in &tag {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("Invalid tag filter '{}', expected key=value", pair);
                };
                filter = filter.tag(key, value);
            }
            let rows = db.table(&table)?.scan(&range, &filter)?;
            print_events(&rows[..rows.len().min(limit)], rows.len(), cli.format)?;
        }

        Commands::Chunks { table } => {
            let db = open_database(&config).await?;
            let chunks = db.table(&table)?.chunks()?;
            if cli.format == Format::Json {
                return print_json(&chunks);
            }
            if chunks.is_empty() {
                println!("No chunks");
            } else {
                println!(
                    "{:<6} {:<21} {:<21} {:<11} {:>10} {:>12} {:>12}",
                    "ID", "Start", "End", "State", "Rows", "Raw bytes", "Stored"
                );
                println!("{}", "-".repeat(99));
                for c in chunks {
                    println!(
                        "{:<6} {:<21} {:<21} {:<11} {:>10} {:>12} {:>12}",
                        c.id,
                        format_millis(c.range.start),
                        format_millis(c.range.end),
                        c.state,
                        c.row_count,
                        c.uncompressed_bytes,
                        c.compressed_bytes
                    );
                }
            }
        }

        Commands::Segments { table, chunk } => {
            let db = open_database(&config).await?;
            let segments = db.table(&table)?.segments(chunk)?;
            if cli.format == Format::Json {
                return print_json(&segments);
            }
            println!(
                "{:<30} {:>8} {:<21} {:<21} {:>10}",
                "Segment", "Rows", "Min time", "Max time", "Bytes"
            );
            println!("{}", "-".repeat(94));
            for s in segments {
                let key = s
                    .segment_key
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.as_deref().unwrap_or("NULL")))
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{:<30} {:>8} {:<21} {:<21} {:>10}",
                    if key.is_empty() { "-".to_string() } else { key },
                    s.row_count,
                    format_millis(s.min_timestamp),
                    format_millis(s.max_timestamp),
                    s.compressed_bytes
                );
            }
        }

        Commands::Compress { table, chunk } => {
            let db = open_database(&config).await?;
            let outcome = db.force_compress(&table, chunk)?;
            println!("Chunk {}: {}", chunk, outcome);
        }

        Commands::Decompress { table, chunk } => {
            let db = open_database(&config).await?;
            let rows = db.force_decompress(&table, chunk)?;
            println!("Chunk {}: decompressed {} rows", chunk, rows);
        }

        Commands::Tier { table, chunk } => {
            let db = open_database(&config).await?;
            match db.force_tier(&table, chunk)? {
                hyperchunk::TierOutcome::Tiered { bytes } => {
                    println!("Chunk {}: moved {} bytes to cold storage", chunk, bytes)
                }
                hyperchunk::TierOutcome::AlreadyTiered => println!("Chunk {}: already tiered", chunk),
            }
        }

        Commands::Refresh {
            aggregate,
            start,
            end,
        } => {
            let db = open_database(&config).await?;
            let now = Utc::now().timestamp_millis();
            let range = match (start.as_deref(), end.as_deref()) {
                (None, None) => None,
                (start, end) => Some(parse_range(start, end)?),
            };
            let outcome = db.force_refresh(&aggregate, range.as_ref(), now)?;
            if cli.format == Format::Json {
                return print_json(&outcome);
            }
            match outcome {
                RefreshOutcome::AlreadyRunning => println!("{}: refresh already running", aggregate),
                RefreshOutcome::Ran(report) => {
                    println!("Refreshed {}", report.aggregate);
                    println!("  Watermark: {} -> {}", show_time(report.old_watermark), show_time(report.new_watermark));
                    println!("  Ranges: {}", report.ranges.len());
                    println!("  Rows written: {}", report.rows_written);
                    println!("  Pending invalidations: {}", report.pending_invalidations);
                    for failure in &report.failures {
                        println!(
                            "  Failed [{}, {}): {}",
                            format_millis(failure.range.start),
                            format_millis(failure.range.end),
                            failure.error
                        );
                    }
                }
            }
        }

        Commands::Query {
            aggregate,
            start,
            end,
            bucket,
            materialized_only,
            raw,
        } => {
            let db = open_database(&config).await?;
            let cagg = db.aggregate(&aggregate)?;
            let range = parse_range(start.as_deref(), end.as_deref())?;
            let mut options = QueryOptions::default();
            if materialized_only {
                options = options.materialized_only(true);
            }
            if let Some(width) = bucket {
                options = options.bucket_width(parse_duration(&width)?);
            }
            let rows = if raw {
                cagg.query_raw(&range, &options)?
            } else {
                cagg.query(&range, &options)?
            };
            print_results(&rows, cli.format)?;
        }

        Commands::Jobs { list, skip } => {
            let db = open_database(&config).await?;
            for id in &skip {
                if !db.scheduler().set_enabled(id, false).await {
                    bail!("Unknown job '{}'", id);
                }
            }
            if list {
                let jobs = db.scheduler().list().await;
                if cli.format == Format::Json {
                    return print_json(&jobs);
                }
                println!("{:<36} {:>12} {:<8} {}", "Job", "Interval", "Enabled", "Last status");
                println!("{}", "-".repeat(72));
                for job in jobs {
                    println!(
                        "{:<36} {:>12} {:<8} {}",
                        job.id,
                        hyperchunk::aggregate::format_duration(job.interval),
                        job.enabled,
                        job.last_status
                            .as_ref()
                            .map(status_line)
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
                return Ok(());
            }

            let runs = db.run_jobs(Utc::now().timestamp_millis()).await;
            db.sync()?;
            if cli.format == Format::Json {
                return print_json(&runs);
            }
            if runs.is_empty() {
                println!("No jobs due");
            }
            for run in runs {
                println!("{:<36} {}", run.id, status_line(&run.status));
            }
        }

        Commands::Serve => {
            let db = open_database(&config).await?;
            let tick = parse_duration(&config.jobs.tick)?;
            tracing::info!(
                "Hyperchunk v{} serving {} table(s), {} aggregate(s)",
                env!("CARGO_PKG_VERSION"),
                db.table_names()?.len(),
                db.aggregate_names()?.len()
            );

            let scheduler = db.scheduler();
            let handle = scheduler
                .clone()
                .start(std::time::Duration::from_millis(tick.max(1) as u64));

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");
            scheduler.stop().await;
            handle.abort();
            db.sync()?;
            tracing::info!("Hyperchunk shutdown complete");
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("hyperchunk={}", logging.level)))
    };
    let json = logging.format.eq_ignore_ascii_case("json");

    let stderr = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr.with_filter(filter()))
        .with(file)
        .init();
    Ok(())
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let intervals = PolicyIntervals {
        compression: config.jobs.compression_interval_millis()?,
        retention: config.jobs.retention_interval_millis()?,
    };
    let db = Database::bootstrap(
        config.storage.data_path(),
        intervals,
        config.table_configs()?,
        config.aggregate_defs()?,
    )
    .await
    .with_context(|| format!("Failed to open data directory {}", config.storage.data_dir))?;
    Ok(db)
}

/// A timestamp, or a duration counted back from `now`
fn parse_time(value: &str, now: i64) -> anyhow::Result<i64> {
    if value.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Some(ts) = ingest::parse_timestamp(value) {
        return Ok(ts);
    }
    match parse_duration(value) {
        Ok(ago) => Ok(now.saturating_sub(ago)),
        Err(_) => bail!("Invalid time '{}': use a timestamp, epoch millis or a duration like 7d", value),
    }
}

fn write_feed<R: CsvRecord>(output: Option<&PathBuf>, records: impl IntoIterator<Item = R>) -> anyhow::Result<usize> {
    let rows = match output {
        Some(path) => ingest::write_csv(std::fs::File::create(path)?, records)?,
        None => ingest::write_csv(std::io::stdout().lock(), records)?,
    };
    Ok(rows)
}

fn parse_range(start: Option<&str>, end: Option<&str>) -> anyhow::Result<TimeRange> {
    let now = Utc::now().timestamp_millis();
    let start = start.map(|s| parse_time(s, now)).transpose()?.unwrap_or(i64::MIN);
    let end = end.map(|s| parse_time(s, now)).transpose()?.unwrap_or(i64::MAX);
    TimeRange::try_new(start, end).context("Range start must be before its end")
}

fn show_time(ts: Option<i64>) -> String {
    ts.map(format_millis).unwrap_or_else(|| "unset".to_string())
}

fn status_line(status: &JobStatus) -> String {
    match status {
        JobStatus::Success { summary } => format!("ok: {}", summary),
        JobStatus::Failed { error } => format!("FAILED: {}", error),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_events(rows: &[Event], total: usize, format: Format) -> anyhow::Result<()> {
    if format == Format::Json {
        return print_json(rows);
    }
    if rows.is_empty() {
        println!("No data for the selected time range");
        return Ok(());
    }
    for event in rows {
        let tags = event
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let fields = event
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        println!("{:<21} {:<40} {}", format_millis(event.timestamp), tags, fields);
    }
    if total > rows.len() {
        println!("... {} more rows", total - rows.len());
    }
    Ok(())
}

fn print_results(rows: &[ResultRow], format: Format) -> anyhow::Result<()> {
    if format == Format::Json {
        return print_json(rows);
    }
    let Some(first) = rows.first() else {
        println!("No data for the selected time range");
        return Ok(());
    };

    // Header
    print!("{:<21}", "Bucket");
    for (column, _) in &first.group {
        print!(" | {:<12}", column);
    }
    for (alias, _) in &first.values {
        print!(" | {:<12}", alias);
    }
    println!();
    println!("{}", "-".repeat(21 + (first.group.len() + first.values.len()) * 15));

    for row in rows {
        print!("{:<21}", format_millis(row.bucket));
        for (_, value) in &row.group {
            print!(" | {:<12}", value.as_deref().unwrap_or("NULL"));
        }
        for (_, value) in &row.values {
            let value = value
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string());
            print!(" | {:<12}", value);
        }
        println!();
    }
    Ok(())
}
