//! Configuration for the `hyperchunk` binary
//!
//! One TOML file sets the data directory, job intervals and logging. `HYPERCHUNK_*`
//! environment variables override what the file says.
//!
//! Tables and continuous aggregates are declared in the same file; durations
//! are written as `5s`, `2m`, `1h`, `7d` or `1w` and aggregate expressions as
//! `avg(temperature) as avg_temp`.

use crate::aggregate::{
    parse_aggregate, parse_duration, parse_millis_or_duration, parse_order_by, BucketSpec,
    ContinuousAggregateDef, TieBreak,
};
use crate::storage::{
    BatchMode, CompressionLayout, OrderBy, TableConfig, TieredReads, WalSyncMode,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Everything read from `config.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub tables: Vec<TableSection>,

    #[serde(default)]
    pub continuous_aggregates: Vec<AggregateSection>,
}

/// `[storage]`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub wal_sync: WalSyncMode,

    /// Default policy for reads that touch tiered chunks
    #[serde(default)]
    pub tiered_reads: TieredReads,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("hyperchunk").to_string_lossy().to_string())
        .unwrap_or_else(|| "./hyperchunk_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wal_sync: WalSyncMode::default(),
            tiered_reads: TieredReads::default(),
        }
    }
}

impl StorageConfig {
    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.data_dir)),
            None => PathBuf::from(&self.data_dir),
        }
    }
}

/// Background job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// How often the scheduler checks for due jobs
    #[serde(default = "default_tick")]
    pub tick: String,

    /// How often compression policies run
    #[serde(default = "default_policy_interval")]
    pub compression_interval: String,

    /// How often retention policies run
    #[serde(default = "default_policy_interval")]
    pub retention_interval: String,
}

fn default_tick() -> String {
    "1m".to_string()
}

fn default_policy_interval() -> String {
    "1h".to_string()
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            compression_interval: default_policy_interval(),
            retention_interval: default_policy_interval(),
        }
    }
}

impl JobsConfig {
    pub fn tick_millis(&self) -> Result<i64, ConfigError> {
        duration("jobs", "tick", &self.tick)
    }

    pub fn compression_interval_millis(&self) -> Result<i64, ConfigError> {
        duration("jobs", "compression_interval", &self.compression_interval)
    }

    pub fn retention_interval_millis(&self) -> Result<i64, ConfigError> {
        duration("jobs", "retention_interval", &self.retention_interval)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// One `[[tables]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct TableSection {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval: String,
    #[serde(default)]
    pub segment_by: Vec<String>,
    /// Keys like `"time DESC"`; defaults to time descending
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub bloom_columns: Vec<String>,
    /// Grace period before an ended chunk is closed
    pub close_after: Option<String>,
    /// Retention policy
    pub drop_after: Option<String>,
    /// Compression policy lag
    pub compress_after: Option<String>,
    #[serde(default)]
    pub batch_mode: BatchMode,
    /// Overrides `storage.tiered_reads`
    pub tiered_reads: Option<TieredReads>,
}

fn default_chunk_interval() -> String {
    "1d".to_string()
}

impl TableSection {
    /// Build the table configuration, inheriting storage defaults
    pub fn to_table_config(&self, storage: &StorageConfig) -> Result<TableConfig, ConfigError> {
        let section = format!("tables.{}", self.name);
        let order_by = if self.order_by.is_empty() {
            OrderBy::time_desc()
        } else {
            self.order_by
                .iter()
                .map(|key| parse_order_by(key).map_err(|e| invalid(&section, e)))
                .collect::<Result<_, _>>()?
        };

        let mut config = TableConfig::new(&self.name)
            .tags(self.tags.iter().cloned())
            .fields(self.fields.iter().cloned())
            .chunk_interval(duration(&section, "chunk_interval", &self.chunk_interval)?)
            .layout(CompressionLayout {
                segment_by: self.segment_by.clone(),
                order_by,
                bloom_columns: self.bloom_columns.clone(),
            })
            .batch_mode(self.batch_mode)
            .wal_sync(storage.wal_sync)
            .tiered_reads(self.tiered_reads.unwrap_or(storage.tiered_reads));
        config.close_after = optional_duration(&section, "close_after", &self.close_after)?.unwrap_or(0);
        config.retention = optional_duration(&section, "drop_after", &self.drop_after)?;
        config.compress_after = optional_duration(&section, "compress_after", &self.compress_after)?;

        config.validate().map_err(|e| invalid(&section, e))?;
        Ok(config)
    }
}

/// One `[[continuous_aggregates]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateSection {
    pub name: String,
    pub source: String,
    pub bucket_width: String,
    /// Bucket alignment origin: milliseconds or a duration
    pub origin: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub aggregates: Vec<String>,
    pub start_offset: Option<String>,
    pub end_offset: Option<String>,
    /// Defaults to the bucket width
    pub schedule_interval: Option<String>,
    #[serde(default)]
    pub materialized_only: bool,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl AggregateSection {
    pub fn to_definition(&self) -> Result<ContinuousAggregateDef, ConfigError> {
        let section = format!("continuous_aggregates.{}", self.name);

        let mut spec = BucketSpec::new(duration(&section, "bucket_width", &self.bucket_width)?)
            .group_by(self.group_by.iter().cloned())
            .tie_break(self.tie_break);
        if let Some(origin) = &self.origin {
            spec = spec.origin(parse_millis_or_duration(origin).map_err(|e| invalid(&section, e))?);
        }
        for expr in &self.aggregates {
            spec = spec.aggregate(parse_aggregate(expr).map_err(|e| invalid(&section, e))?);
        }

        let schedule_interval = optional_duration(&section, "schedule_interval", &self.schedule_interval)?
            .unwrap_or(spec.width);
        Ok(ContinuousAggregateDef::new(&self.name, &self.source, spec)
            .start_offset(optional_duration(&section, "start_offset", &self.start_offset)?)
            .end_offset(optional_duration(&section, "end_offset", &self.end_offset)?.unwrap_or(0))
            .schedule_interval(schedule_interval)
            .materialized_only(self.materialized_only))
    }
}

fn invalid(section: &str, error: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        section: section.to_string(),
        error: error.to_string(),
    }
}

fn duration(section: &str, key: &str, value: &str) -> Result<i64, ConfigError> {
    parse_duration(value).map_err(|e| invalid(section, format!("{}: {}", key, e)))
}

/// Optional duration where `"0"` or `"0s"` means zero
fn optional_duration(section: &str, key: &str, value: &Option<String>) -> Result<Option<i64>, ConfigError> {
    let Some(v) = value.as_deref().map(str::trim) else {
        return Ok(None);
    };
    let digits = v.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    if !digits.is_empty() && digits.chars().all(|c| c == '0') {
        return Ok(Some(0));
    }
    duration(section, key, v).map(Some)
}

impl Config {
    /// Parse one file, without environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// The bundled default configuration with environment overrides
    pub fn from_env() -> Self {
        let mut config: Config = match toml::from_str(&generate_default_config()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Bundled config failed to parse: {}", e);
                Config::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// Parse one file, then apply `HYPERCHUNK_*` overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// First readable file among the search paths, else the bundled template
    pub fn load_default() -> Self {
        // User config dir, then /etc, then the working directory
        let config_paths = [
            dirs::config_dir().map(|p| p.join("hyperchunk").join("config.toml")),
            Some(PathBuf::from("/etc/hyperchunk/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// `HYPERCHUNK_DATA_DIR`, `HYPERCHUNK_LOG_LEVEL`, `HYPERCHUNK_LOG_FORMAT`, `HYPERCHUNK_TIERED_READS`
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("HYPERCHUNK_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(policy) = std::env::var("HYPERCHUNK_TIERED_READS") {
            match policy.parse() {
                Ok(policy) => self.storage.tiered_reads = policy,
                Err(e) => tracing::warn!("Ignoring HYPERCHUNK_TIERED_READS: {}", e),
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("HYPERCHUNK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("HYPERCHUNK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Table configurations in declaration order
    pub fn table_configs(&self) -> Result<Vec<TableConfig>, ConfigError> {
        self.tables
            .iter()
            .map(|t| t.to_table_config(&self.storage))
            .collect()
    }

    /// Continuous aggregate definitions in declaration order
    pub fn aggregate_defs(&self) -> Result<Vec<ContinuousAggregateDef>, ConfigError> {
        self.continuous_aggregates
            .iter()
            .map(AggregateSection::to_definition)
            .collect()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid [{section}]: {error}")]
    Invalid { section: String, error: String },
}

/// The commented template printed by `hyperchunk config`
pub fn generate_default_config() -> String {
    r#"# Hyperchunk Configuration
#
# These environment variables take precedence over this file:
# - HYPERCHUNK_DATA_DIR
# - HYPERCHUNK_LOG_LEVEL
# - HYPERCHUNK_LOG_FORMAT
# - HYPERCHUNK_TIERED_READS
#
# Durations: 250ms, 5s, 2m, 1h, 7d, 1w (or combined, e.g. 1h30m)

[storage]
# Directory for tables and materialized aggregates
data_dir = "~/.local/share/hyperchunk"

# WAL fsync strategy: every_write, batched, none
wal_sync = "batched"

# Reads touching tiered chunks: fetch (load from cold storage) or deny
tiered_reads = "fetch"

[jobs]
# How often the scheduler looks for due jobs
tick = "1m"

# How often compression and retention policies run
compression_interval = "1h"
retention_interval = "1h"

[logging]
# trace, debug, info, warn or error
level = "info"

# pretty for terminals, json for log shippers
format = "pretty"

# Optional log file path
# file = "/var/log/hyperchunk/hyperchunk.log"

[[tables]]
name = "sensor_data"
tags = ["equipment_id", "status"]
fields = ["temperature", "vibration"]

# Width of each chunk
chunk_interval = "1d"

# Compressed layout: one segment per equipment, newest rows first
segment_by = ["equipment_id"]
order_by = ["time DESC"]
bloom_columns = ["status"]

# Batch inserts: per_event or all_or_nothing
batch_mode = "per_event"

# Policies
compress_after = "7d"
drop_after = "90d"

[[tables]]
name = "production_metrics"
tags = ["line_id", "equipment_id"]
fields = [
    "cycle_time",
    "throughput",
    "efficiency_score",
    "energy_consumption",
    "downtime_duration",
    "defect_rate",
]
chunk_interval = "1d"
segment_by = ["equipment_id"]
order_by = ["time DESC"]
bloom_columns = ["line_id"]
compress_after = "7d"
drop_after = "90d"

[[tables]]
name = "quality_control"
tags = ["batch_id", "line_id", "product_id", "test_type", "test_result", "inspector_id"]
fields = ["measurement_value", "tolerance_min", "tolerance_max"]
chunk_interval = "7d"
segment_by = ["line_id"]
bloom_columns = ["batch_id", "test_result"]
drop_after = "365d"

[[tables]]
name = "maintenance_events"
tags = ["equipment_id", "event_type", "maintenance_type", "technician_id", "description", "parts_replaced"]
fields = ["duration", "cost"]
chunk_interval = "30d"

[[continuous_aggregates]]
name = "hourly_temps"
source = "sensor_data"
bucket_width = "1h"
group_by = ["equipment_id"]
aggregates = [
    "avg(temperature) as avg_temp",
    "max(temperature) as max_temp",
    "first(temperature) as first_temp",
    "count(*) as readings",
]

# Recompute late data up to a week back; leave the current hour to real time
start_offset = "7d"
end_offset = "1h"
schedule_interval = "1h"
materialized_only = false

# first/last tie-break for equal timestamps: ingestion or value
tie_break = "ingestion"

[[continuous_aggregates]]
name = "hourly_line_efficiency"
source = "production_metrics"
bucket_width = "1h"
group_by = ["line_id"]
aggregates = [
    "avg(efficiency_score) as avg_efficiency",
    "sum(downtime_duration) as downtime",
    "max(defect_rate) as worst_defect_rate",
]
start_offset = "7d"
end_offset = "1h"
schedule_interval = "1h"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggFunc;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.storage.wal_sync, WalSyncMode::Batched);
        assert_eq!(config.jobs.tick_millis().unwrap(), 60_000);

        let tables = config.table_configs().unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["sensor_data", "production_metrics", "quality_control", "maintenance_events"]);
        let table = &tables[0];
        assert_eq!(table.chunk_interval, 86_400_000);
        assert_eq!(table.layout.segment_by, vec!["equipment_id".to_string()]);
        assert_eq!(table.layout.order_by, vec![OrderBy::desc("time")]);
        assert_eq!(table.retention, Some(90 * 86_400_000));
        assert_eq!(table.compress_after, Some(7 * 86_400_000));

        let defs = config.aggregate_defs().unwrap();
        assert_eq!(defs.len(), 2);
        let def = &defs[0];
        assert_eq!(def.spec.width, 3_600_000);
        assert_eq!(def.spec.aggregates.len(), 4);
        assert_eq!(def.spec.aggregates[3].func, AggFunc::Count(None));
        assert_eq!(def.spec.aggregates[3].alias, "readings");
        assert_eq!(def.start_offset, Some(7 * 86_400_000));
        assert_eq!(def.end_offset, 3_600_000);
        assert!(def.validate(table).is_ok());

        let line_efficiency = &defs[1];
        assert_eq!(line_efficiency.source, "production_metrics");
        assert!(line_efficiency.validate(&tables[1]).is_ok());
        assert_eq!(tables[2].chunk_interval, 7 * 86_400_000);
        assert_eq!(tables[3].retention, None);
    }

    #[test]
    fn test_minimal_table_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            tiered_reads = "deny"

            [[tables]]
            name = "steps"
            tags = ["device_id"]
            fields = ["total_steps"]
            close_after = "0s"
            "#,
        )
        .unwrap();

        let table = &config.table_configs().unwrap()[0];
        assert_eq!(table.chunk_interval, 86_400_000);
        assert_eq!(table.close_after, 0);
        assert_eq!(table.tiered_reads, TieredReads::Deny);
        assert_eq!(table.batch_mode, BatchMode::PerEvent);
        assert_eq!(table.layout.order_by, OrderBy::time_desc());
    }

    #[test]
    fn test_invalid_sections_are_reported() {
        let config: Config = toml::from_str(
            r#"
            [[tables]]
            name = "steps"
            chunk_interval = "5 parsecs"

            [[continuous_aggregates]]
            name = "daily"
            source = "steps"
            bucket_width = "1d"
            aggregates = ["median(total_steps)"]
            "#,
        )
        .unwrap();

        let err = config.table_configs().unwrap_err();
        assert!(err.to_string().contains("tables.steps"));
        let err = config.aggregate_defs().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_keys_in_values_fail_to_parse() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [storage]
            wal_sync = "sometimes"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_data_path_expands_home() {
        let storage = StorageConfig {
            data_dir: "/var/lib/hyperchunk".into(),
            ..Default::default()
        };
        assert_eq!(storage.data_path(), PathBuf::from("/var/lib/hyperchunk"));
    }
}
