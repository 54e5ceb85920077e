use clap::Parser;
use lib_realtime::RealtimeConfig;
use lib_realtime::transport::PhoenixConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[clap(about = "REBIL realtime notification listener", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "NOTIFY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "NOTIFY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "NOTIFY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "NOTIFY_REALTIME_URL", help = "Realtime endpoint, e.g. wss://<project>.supabase.co/realtime/v1.")]
    pub realtime_url: Option<String>,

    #[clap(long, env = "NOTIFY_API_KEY", help = "API key sent with the socket handshake and every join.")]
    pub api_key: Option<String>,

    #[clap(long, env = "NOTIFY_ADMIN_USER_ID", help = "Also follow the notifications of this admin.")]
    pub admin_user_id: Option<String>,

    #[clap(long, env = "NOTIFY_STATS_INTERVAL_SECONDS", help = "Interval in seconds between service stats log lines.")]
    pub stats_interval_seconds: Option<u64>,

    #[clap(long, env = "NOTIFY_HEARTBEAT_INTERVAL_SECONDS", help = "Socket heartbeat interval in seconds.")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "NOTIFY_MAX_CONNECTIONS", help = "Maximum concurrent channels (1-10).")]
    pub max_connections: Option<usize>,

    #[clap(long, env = "NOTIFY_CONNECTION_TIMEOUT_MS", help = "Milliseconds a channel may stay connecting.")]
    pub connection_timeout_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_ERROR_GRACE_PERIOD_MS", help = "Milliseconds an errored channel is kept before it is swept.")]
    pub error_grace_period_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_HEALTH_SWEEP_INTERVAL_MS", help = "Milliseconds between connection health sweeps.")]
    pub health_sweep_interval_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for channel reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for channel reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "NOTIFY_MAX_RETRIES", help = "Reconnect attempts before a channel is given up.")]
    pub max_retries: Option<u32>,

    #[clap(long, env = "NOTIFY_INIT_TIMEOUT_MS", help = "Milliseconds allowed for the initial connection.")]
    pub init_timeout_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            realtime_url: other.realtime_url.or(self.realtime_url),
            api_key: other.api_key.or(self.api_key),
            admin_user_id: other.admin_user_id.or(self.admin_user_id),
            stats_interval_seconds: other.stats_interval_seconds.or(self.stats_interval_seconds),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            max_connections: other.max_connections.or(self.max_connections),
            connection_timeout_ms: other.connection_timeout_ms.or(self.connection_timeout_ms),
            error_grace_period_ms: other.error_grace_period_ms.or(self.error_grace_period_ms),
            health_sweep_interval_ms: other.health_sweep_interval_ms.or(self.health_sweep_interval_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_retries: other.max_retries.or(self.max_retries),
            init_timeout_ms: other.init_timeout_ms.or(self.init_timeout_ms),
        }
    }

    fn defaults() -> Config {
        let realtime = RealtimeConfig::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            stats_interval_seconds: Some(60),
            heartbeat_interval_seconds: Some(25),
            max_connections: Some(realtime.max_connections),
            connection_timeout_ms: Some(realtime.connection_timeout_ms),
            error_grace_period_ms: Some(realtime.error_grace_period_ms),
            health_sweep_interval_ms: Some(realtime.health_sweep_interval_ms),
            reconnect_base_delay_ms: Some(realtime.reconnect_base_delay_ms),
            reconnect_max_delay_ms: Some(realtime.reconnect_max_delay_ms),
            max_retries: Some(realtime.max_retries),
            init_timeout_ms: Some(realtime.init_timeout_ms),
            ..Default::default()
        }
    }

    /// The library tunables, falling back to library defaults per field.
    pub fn realtime_config(&self) -> RealtimeConfig {
        let base = RealtimeConfig::default();
        RealtimeConfig {
            max_connections: self.max_connections.unwrap_or(base.max_connections),
            connection_timeout_ms: self.connection_timeout_ms.unwrap_or(base.connection_timeout_ms),
            error_grace_period_ms: self.error_grace_period_ms.unwrap_or(base.error_grace_period_ms),
            health_sweep_interval_ms: self.health_sweep_interval_ms.unwrap_or(base.health_sweep_interval_ms),
            reconnect_base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(base.reconnect_base_delay_ms),
            reconnect_max_delay_ms: self.reconnect_max_delay_ms.unwrap_or(base.reconnect_max_delay_ms),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            init_timeout_ms: self.init_timeout_ms.unwrap_or(base.init_timeout_ms),
        }
    }

    /// Socket settings, or `None` while the endpoint or key is missing.
    pub fn phoenix_config(&self) -> Option<PhoenixConfig> {
        let mut phoenix = PhoenixConfig::new(self.realtime_url.clone()?, self.api_key.clone()?);
        if let Some(seconds) = self.heartbeat_interval_seconds {
            phoenix.heartbeat_interval = Duration::from_secs(seconds.max(1));
        }
        if let Some(ms) = self.connection_timeout_ms {
            phoenix.join_timeout = Duration::from_millis(ms);
        }
        Some(phoenix)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds.unwrap_or(60).max(1))
    }
}

pub fn load_config() -> Config {
    // Statement: .env values become environment variables before clap reads them.
    if let Err(e) = dotenvy::dotenv() {
        log::debug!("No .env file loaded: {}", e);
    }
    resolve(Config::parse())
}

/// Defaults, then the JSON file, then environment/CLI.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_notify.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
