use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Worker pool size; also the upper bound for the `worker` replica count.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sources not fetched within this window are re-queued by the refresh trigger.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            freshness_hours: default_freshness_hours(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_lease_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_freshness_hours() -> u64 {
    168
}
fn default_refresh_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            respect_robots: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_user_agent() -> String {
    concat!("ecost/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_max_body_bytes() -> usize {
    5_000_000
}

/// Seed search backend. The built-in backend answers every query with the
/// configured URL list.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_seed_urls")]
    pub seed_urls: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            seed_urls: default_seed_urls(),
        }
    }
}

fn default_seed_urls() -> Vec<String> {
    vec![
        "https://www.nrel.gov/analysis/tech-lcoe-documentation.html".to_string(),
        "https://atb.nrel.gov/electricity/2024/utility-scale_pv".to_string(),
        "https://www.eia.gov/outlooks/aeo/electricity_generation/".to_string(),
        "https://www.lazard.com/research-insights/levelized-cost-of-energyplus/".to_string(),
        "https://www.tesla.com/powerwall".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_actor")]
    pub default_actor: String,
    /// How long `scale_worker` waits for a held target lock before answering 409.
    #[serde(default = "default_serialize_wait_ms")]
    pub serialize_wait_ms: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default = "default_scale_targets")]
    pub scale_targets: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            default_actor: default_actor(),
            serialize_wait_ms: default_serialize_wait_ms(),
            lock_lease_secs: default_lock_lease_secs(),
            backup_dir: default_backup_dir(),
            max_replicas: default_max_replicas(),
            scale_targets: default_scale_targets(),
        }
    }
}

fn default_actor() -> String {
    "admin@system".to_string()
}
fn default_serialize_wait_ms() -> u64 {
    5000
}
fn default_lock_lease_secs() -> u64 {
    60
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("./data/backups")
}
fn default_max_replicas() -> u32 {
    64
}
fn default_scale_targets() -> Vec<String> {
    vec!["worker".to_string(), "api".to_string()]
}

impl Config {
    /// In-code configuration with every default applied, rooted at `db_path`.
    /// Backups land in a `backups` directory beside the database.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = db_path.into();
        let backup_dir = path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(default_backup_dir);
        Self {
            db: DbConfig { path },
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            fetch: FetchConfig::default(),
            search: SearchConfig::default(),
            admin: AdminConfig {
                backup_dir,
                ..AdminConfig::default()
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate pipeline
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }
    if config.pipeline.max_attempts == 0 {
        anyhow::bail!("pipeline.max_attempts must be > 0");
    }
    if config.pipeline.backoff_base_ms > config.pipeline.backoff_max_ms {
        anyhow::bail!("pipeline.backoff_base_ms must be <= pipeline.backoff_max_ms");
    }
    if config.pipeline.lease_secs == 0 {
        anyhow::bail!("pipeline.lease_secs must be > 0");
    }
    if config.pipeline.refresh_interval_secs == 0 {
        anyhow::bail!("pipeline.refresh_interval_secs must be > 0");
    }

    // Validate fetch
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }
    if config.fetch.user_agent.trim().is_empty() {
        anyhow::bail!("fetch.user_agent must not be empty");
    }

    // Validate admin
    if config.admin.scale_targets.is_empty() {
        anyhow::bail!("admin.scale_targets must not be empty");
    }
    if config.admin.lock_lease_secs == 0 {
        anyhow::bail!("admin.lock_lease_secs must be > 0");
    }
    if config.admin.default_actor.trim().is_empty() {
        anyhow::bail!("admin.default_actor must not be empty");
    }

    Ok(())
}
