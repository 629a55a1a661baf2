//! Configuration module
//!
//! Pod configuration is read from the environment (optionally seeded from a `.env`
//! file). Every value has a default except `DATABASE_URL` and `POD_HOST`.

use std::env;

// Common constants
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const SERVER_PORT: u16 = 9000;
const TX_MAX_RETRIES: u32 = 5;
const MAX_CONCURRENT_TRANSCODES: usize = 2;
const JOB_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const FEDERATION_MAX_DELIVERY_ATTEMPTS: i32 = 10;
const FEDERATION_DELIVERY_TIMEOUT_SECS: u64 = 10;
const FEDERATION_RETRY_BASE_MS: u64 = 500;
const FEDERATION_RETRY_MAX_SECS: u64 = 300;
const FEDERATION_POLL_INTERVAL_MS: u64 = 2000;

/// Settings shared by every service binary
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
}

/// Pod configuration: identity, processing and federation knobs
#[derive(Clone, Debug)]
pub struct PodConfig {
    pub base: BaseConfig,
    pub database_url: String,
    /// Public host name peers use to reach this pod (e.g. `pod1.example.org:9000`).
    pub pod_host: String,
    // Transactions
    pub tx_max_retries: u32,
    // Processing
    pub transcoding_enabled: bool,
    pub ffmpeg_path: String,
    pub videos_dir: String,
    pub max_concurrent_transcodes: usize,
    pub job_queue_poll_interval_ms: u64,
    // Federation delivery
    pub federation_max_delivery_attempts: i32,
    pub federation_delivery_timeout_seconds: u64,
    pub federation_retry_base_ms: u64,
    pub federation_retry_max_seconds: u64,
    pub federation_poll_interval_ms: u64,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<PodConfig>);

impl Config {
    fn as_pod(&self) -> &PodConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let environment = self.as_pod().base.environment.to_lowercase();
        environment == "production" || environment == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = PodConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.as_pod().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.as_pod().base.server_port
    }

    pub fn environment(&self) -> &str {
        &self.as_pod().base.environment
    }

    pub fn db_max_connections(&self) -> u32 {
        self.as_pod().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.as_pod().base.db_timeout_seconds
    }

    pub fn database_url(&self) -> &str {
        &self.as_pod().database_url
    }

    pub fn pod_host(&self) -> &str {
        &self.as_pod().pod_host
    }

    pub fn tx_max_retries(&self) -> u32 {
        self.as_pod().tx_max_retries
    }

    pub fn transcoding_enabled(&self) -> bool {
        self.as_pod().transcoding_enabled
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.as_pod().ffmpeg_path
    }

    pub fn videos_dir(&self) -> &str {
        &self.as_pod().videos_dir
    }

    pub fn max_concurrent_transcodes(&self) -> usize {
        self.as_pod().max_concurrent_transcodes
    }

    pub fn job_queue_poll_interval_ms(&self) -> u64 {
        self.as_pod().job_queue_poll_interval_ms
    }

    pub fn federation_max_delivery_attempts(&self) -> i32 {
        self.as_pod().federation_max_delivery_attempts
    }

    pub fn federation_delivery_timeout_seconds(&self) -> u64 {
        self.as_pod().federation_delivery_timeout_seconds
    }

    pub fn federation_retry_base_ms(&self) -> u64 {
        self.as_pod().federation_retry_base_ms
    }

    pub fn federation_retry_max_seconds(&self) -> u64 {
        self.as_pod().federation_retry_max_seconds
    }

    pub fn federation_poll_interval_ms(&self) -> u64 {
        self.as_pod().federation_poll_interval_ms
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|s| s.trim().to_lowercase())
        .ok()
        .and_then(|s| match s.as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

impl PodConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let base = BaseConfig {
            server_port: env::var("SERVER_PORT")
                .or_else(|_| env::var("PORT"))
                .unwrap_or_else(|_| SERVER_PORT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SERVER_PORT must be a valid number"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            environment,
        };

        let config = PodConfig {
            base,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            pod_host: env::var("POD_HOST")
                .map_err(|_| anyhow::anyhow!("POD_HOST must be set to this pod's public host"))?,
            tx_max_retries: env_or("TX_MAX_RETRIES", TX_MAX_RETRIES),
            transcoding_enabled: env_bool("TRANSCODING_ENABLED", false),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            videos_dir: env::var("VIDEOS_DIR").unwrap_or_else(|_| "./storage/videos".to_string()),
            max_concurrent_transcodes: env_or(
                "MAX_CONCURRENT_TRANSCODES",
                MAX_CONCURRENT_TRANSCODES,
            ),
            job_queue_poll_interval_ms: env_or(
                "JOB_QUEUE_POLL_INTERVAL_MS",
                JOB_QUEUE_POLL_INTERVAL_MS,
            ),
            federation_max_delivery_attempts: env_or(
                "FEDERATION_MAX_DELIVERY_ATTEMPTS",
                FEDERATION_MAX_DELIVERY_ATTEMPTS,
            ),
            federation_delivery_timeout_seconds: env_or(
                "FEDERATION_DELIVERY_TIMEOUT_SECONDS",
                FEDERATION_DELIVERY_TIMEOUT_SECS,
            ),
            federation_retry_base_ms: env_or("FEDERATION_RETRY_BASE_MS", FEDERATION_RETRY_BASE_MS),
            federation_retry_max_seconds: env_or(
                "FEDERATION_RETRY_MAX_SECONDS",
                FEDERATION_RETRY_MAX_SECS,
            ),
            federation_poll_interval_ms: env_or(
                "FEDERATION_POLL_INTERVAL_MS",
                FEDERATION_POLL_INTERVAL_MS,
            ),
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.pod_host.trim().is_empty() || self.pod_host.contains('/') {
            return Err(anyhow::anyhow!(
                "POD_HOST must be a bare host[:port], got '{}'",
                self.pod_host
            ));
        }

        if self.max_concurrent_transcodes == 0 {
            return Err(anyhow::anyhow!(
                "MAX_CONCURRENT_TRANSCODES must be at least 1"
            ));
        }

        if self.federation_max_delivery_attempts < 1 {
            return Err(anyhow::anyhow!(
                "FEDERATION_MAX_DELIVERY_ATTEMPTS must be at least 1"
            ));
        }

        if self.federation_delivery_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "FEDERATION_DELIVERY_TIMEOUT_SECONDS must be greater than 0"
            ));
        }

        if self.federation_retry_base_ms == 0
            || self.federation_retry_base_ms > self.federation_retry_max_seconds * 1000
        {
            return Err(anyhow::anyhow!(
                "FEDERATION_RETRY_BASE_MS must be positive and not exceed FEDERATION_RETRY_MAX_SECONDS"
            ));
        }

        Ok(())
    }
}
