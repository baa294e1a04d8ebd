use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
}

/// Tunables of the storage engine.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Holds the metadata database and the payload tree.
    pub data_path: PathBuf,
    pub gc_period: Duration,
    pub gc_max_objects_per_iteration: usize,
    pub gc_max_process_time: Duration,
    pub retry_max_attempts: u32,
    /// `None` leaves the write-ahead log unbounded.
    pub wal_size_limit: Option<u64>,
    pub wal_checkpoint_use_sqlite_default: bool,
    pub wal_checkpoint_interval: Duration,
    /// Writers fail with a quota error below this many free bytes.
    pub min_free_space: u64,
    pub multipart_min_part_size: u64,
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/sfs"),
            gc_period: Duration::from_secs(3600),
            gc_max_objects_per_iteration: 100,
            gc_max_process_time: Duration::from_secs(2),
            retry_max_attempts: 10,
            wal_size_limit: Some(16 * MIB),
            wal_checkpoint_use_sqlite_default: false,
            wal_checkpoint_interval: Duration::from_secs(5),
            min_free_space: 0,
            multipart_min_part_size: 5 * MIB,
            busy_timeout: Duration::from_secs(5),
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    pub fn with_data_path(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            ..Self::default()
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned object metadata store")]
pub struct Args {
    /// Host to bind to (overrides SFS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SFS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding metadata and payloads (overrides SFS_DATA_PATH)
    #[arg(long)]
    pub data_path: Option<PathBuf>,

    /// Seconds between garbage collector runs (overrides SFS_GC_PERIOD)
    #[arg(long)]
    pub gc_period: Option<u64>,

    /// Deletions allowed per collector run (overrides SFS_GC_MAX_OBJECTS)
    #[arg(long)]
    pub gc_max_objects: Option<usize>,

    /// Milliseconds a collector run may take (overrides SFS_GC_MAX_PROCESS_TIME_MS)
    #[arg(long)]
    pub gc_max_process_time_ms: Option<u64>,

    /// Attempts for busy database work (overrides SFS_RETRY_MAX_ATTEMPTS)
    #[arg(long)]
    pub retry_max_attempts: Option<u32>,

    /// WAL ceiling in bytes, 0 disables truncation (overrides SFS_WAL_SIZE_LIMIT)
    #[arg(long)]
    pub wal_size_limit: Option<u64>,

    /// Leave WAL checkpointing to SQLite (overrides SFS_WAL_USE_SQLITE_DEFAULT)
    #[arg(long)]
    pub wal_use_sqlite_default: bool,

    /// Free bytes below which writes are refused (overrides SFS_MIN_FREE_SPACE)
    #[arg(long)]
    pub min_free_space: Option<u64>,

    /// Minimum size of every multipart part but the last (overrides SFS_MULTIPART_MIN_PART_SIZE)
    #[arg(long)]
    pub multipart_min_part_size: Option<u64>,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let defaults = StoreConfig::default();

        // --- Environment fallback ---
        let env_host = env::var("SFS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("SFS_PORT", 7480u16)?;
        let env_data = env_or("SFS_DATA_PATH", defaults.data_path.clone())?;
        let env_gc_period = env_or("SFS_GC_PERIOD", defaults.gc_period.as_secs())?;
        let env_gc_max = env_or("SFS_GC_MAX_OBJECTS", defaults.gc_max_objects_per_iteration)?;
        let env_gc_time = env_or(
            "SFS_GC_MAX_PROCESS_TIME_MS",
            defaults.gc_max_process_time.as_millis() as u64,
        )?;
        let env_retries = env_or("SFS_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?;
        let env_wal_limit = env_or("SFS_WAL_SIZE_LIMIT", defaults.wal_size_limit.unwrap_or(0))?;
        let env_wal_default = env_or("SFS_WAL_USE_SQLITE_DEFAULT", false)?;
        let env_free = env_or("SFS_MIN_FREE_SPACE", defaults.min_free_space)?;
        let env_part = env_or(
            "SFS_MULTIPART_MIN_PART_SIZE",
            defaults.multipart_min_part_size,
        )?;

        // --- Merge ---
        let wal_limit = args.wal_size_limit.unwrap_or(env_wal_limit);
        let store = StoreConfig {
            data_path: args.data_path.unwrap_or(env_data),
            gc_period: Duration::from_secs(args.gc_period.unwrap_or(env_gc_period)),
            gc_max_objects_per_iteration: args.gc_max_objects.unwrap_or(env_gc_max),
            gc_max_process_time: Duration::from_millis(
                args.gc_max_process_time_ms.unwrap_or(env_gc_time),
            ),
            retry_max_attempts: args.retry_max_attempts.unwrap_or(env_retries),
            wal_size_limit: (wal_limit > 0).then_some(wal_limit),
            wal_checkpoint_use_sqlite_default: args.wal_use_sqlite_default || env_wal_default,
            min_free_space: args.min_free_space.unwrap_or(env_free),
            multipart_min_part_size: args.multipart_min_part_size.unwrap_or(env_part),
            ..defaults
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            store,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
