use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::KeySpace;
use crate::runtime::WorkerConfig;

/// Sorted set holding job identifiers scored by due time.
pub const DEFAULT_QUEUE_KEY: &str = "notification_queue";
/// Prefix of the string keys holding serialized payloads.
pub const DEFAULT_PAYLOAD_PREFIX: &str = "notification:data:";
/// Maximum number of due jobs claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection settings for the Redis instance backing the queue and store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Hostname, or a full `redis://` / `rediss://` URL.
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
}

impl StoreConfig {
    /// The full URL when `host` carries a `redis://` or `rediss://` scheme.
    ///
    /// Otherwise the client is built from the individual fields, so the
    /// password never passes through URL parsing.
    pub fn url(&self) -> Option<&str> {
        (self.host.starts_with("redis://") || self.host.starts_with("rediss://"))
            .then_some(self.host.as_str())
    }

    /// Password to authenticate with, treating an empty value as unset.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|password| !password.is_empty())
    }

    /// Address without credentials, safe to log.
    pub fn display_addr(&self) -> String {
        if self.host.contains("://") {
            return self
                .host
                .rsplit('@')
                .next()
                .unwrap_or(&self.host)
                .to_string();
        }
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
        }
    }
}

/// Queue naming and batching.
///
/// Key names must match what producers write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_key: String,
    pub payload_prefix: String,
    /// Number of due jobs fetched per claim cycle.
    pub batch_size: usize,
}

impl QueueConfig {
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.queue_key.clone(), self.payload_prefix.clone())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            payload_prefix: DEFAULT_PAYLOAD_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Delivery gateway credentials and HTTP limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path to the service-account JSON key.
    pub credentials_file: String,
    /// Overrides the project id found in the credentials file.
    pub project_id: Option<String>,
    pub request_timeout_secs: u64,
    /// Upper bound on concurrent per-token sends within one multicast.
    pub max_concurrent_sends: usize,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            credentials_file: "serviceAccountKey.json".to_string(),
            project_id: None,
            request_timeout_secs: 10,
            max_concurrent_sends: 16,
        }
    }
}

/// What to do with a claimed job whose payload could not be read because
/// the store failed (as opposed to the key being missing).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientPolicy {
    /// Log and drop the job. It is already out of the queue.
    #[default]
    Drop,
    /// Put the job back under its original due time and keep the payload,
    /// so a later cycle can claim it again.
    Requeue,
}

impl FromStr for TransientPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(TransientPolicy::Drop),
            "requeue" => Ok(TransientPolicy::Requeue),
            other => Err(format!("expected `drop` or `requeue`, got `{other}`")),
        }
    }
}

impl fmt::Display for TransientPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientPolicy::Drop => f.write_str("drop"),
            TransientPolicy::Requeue => f.write_str("requeue"),
        }
    }
}

/// Logging output settings for the worker binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Complete process configuration for the dispatcher worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

impl HeraldConfig {
    /// Read configuration from process environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = HeraldConfig::default();

        if let Some(host) = lookup("REDIS_URL") {
            config.store.host = host;
        }
        if let Some(port) = parse(&lookup, "REDIS_PORT")? {
            config.store.port = port;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            config.store.password = Some(password);
        }
        if let Some(db) = parse(&lookup, "REDIS_DB")? {
            config.store.database = db;
        }

        if let Some(key) = lookup("HERALD_QUEUE_KEY") {
            config.queue.queue_key = key;
        }
        if let Some(prefix) = lookup("HERALD_PAYLOAD_PREFIX") {
            config.queue.payload_prefix = prefix;
        }
        if let Some(batch) = parse::<usize, _>(&lookup, "HERALD_BATCH_SIZE")? {
            if batch == 0 {
                return Err(ConfigError::Invalid {
                    key: "HERALD_BATCH_SIZE",
                    value: batch.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.queue.batch_size = batch;
        }

        if let Some(path) = lookup("FCM_CREDENTIALS_FILE") {
            config.gateway.credentials_file = path;
        }
        if let Some(project) = lookup("FCM_PROJECT_ID") {
            config.gateway.project_id = Some(project);
        }
        if let Some(secs) = parse(&lookup, "FCM_REQUEST_TIMEOUT_SECS")? {
            config.gateway.request_timeout_secs = secs;
        }

        if let Some(worker_id) = lookup("HERALD_WORKER_ID") {
            config.worker.worker_id = worker_id;
        }
        if let Some(ms) = parse(&lookup, "HERALD_POLL_INTERVAL_MS")? {
            config.worker.poll_interval_ms = ms;
        }
        if let Some(limit) = parse::<usize, _>(&lookup, "HERALD_MAX_IN_FLIGHT")? {
            config.worker.max_in_flight = limit.max(1);
        }
        if let Some(secs) =
            parse::<u64, _>(&lookup, "HERALD_DISPATCH_TIMEOUT_SECS")?
        {
            config.worker.dispatch_timeout_ms =
                (secs > 0).then(|| secs.saturating_mul(1000));
        }
        if let Some(secs) =
            parse::<u64, _>(&lookup, "HERALD_SHUTDOWN_GRACE_SECS")?
        {
            config.worker.shutdown_grace_ms = secs.saturating_mul(1000);
        }
        if let Some(policy) = parse(&lookup, "HERALD_TRANSIENT_POLICY")? {
            config.worker.transient_policy = policy;
        }

        if let Some(json) = parse(&lookup, "HERALD_LOG_JSON")? {
            config.log.json = json;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
            ConfigError::Invalid {
                key,
                value: raw,
                reason: err.to_string(),
            }
        }),
    }
}
