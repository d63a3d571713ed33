//! Daemon configuration: a JSON file with defaults for every optional field,
//! overridden by command-line flags.

use anyhow::{Context, Result, bail};
use liveness_core::{
    ConnectionDescriptor, HeartbeatConfig, NodeConfig, NodeOptions, NodeRole, RetryPolicy,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often a client sends a request when no heartbeat interval is configured.
pub const DEFAULT_CLIENT_INTERVAL: Duration = Duration::from_secs(1);

fn default_role() -> NodeRole {
    NodeRole::Worker
}

fn default_identity_file() -> PathBuf {
    PathBuf::from("liveness-identity.json")
}

fn default_workers() -> usize {
    1
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Node role (default: worker)
    #[serde(default = "default_role")]
    pub role: NodeRole,
    /// Main socket endpoint, as a connection string or a tagged object
    #[serde(default)]
    pub endpoint: Option<ConnectionDescriptor>,
    /// Heartbeat link; omitted means no heartbeat
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSection>,
    /// Where node ids are persisted (default: liveness-identity.json)
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    /// Worker nodes sharing one context; more than one needs the worker role
    /// (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub options: OptionsSection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            endpoint: None,
            heartbeat: None,
            identity_file: default_identity_file(),
            workers: default_workers(),
            options: OptionsSection::default(),
        }
    }
}

/// Heartbeat settings in file form. Times are in seconds and may be fractional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    pub endpoint: ConnectionDescriptor,
    /// Seconds between heartbeats (default: 10)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    /// Seconds of silence that count as a miss (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Misses tolerated before eviction (default: 3)
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

fn default_interval_secs() -> f64 {
    HeartbeatConfig::DEFAULT_INTERVAL.as_secs_f64()
}

fn default_timeout_secs() -> f64 {
    HeartbeatConfig::DEFAULT_TIMEOUT.as_secs_f64()
}

fn default_max_missed() -> u32 {
    HeartbeatConfig::DEFAULT_MAX_MISSED
}

impl HeartbeatSection {
    fn new(endpoint: ConnectionDescriptor) -> Self {
        Self {
            endpoint,
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            max_missed: default_max_missed(),
        }
    }

    pub fn to_heartbeat_config(&self) -> Result<HeartbeatConfig> {
        let config = HeartbeatConfig::new(self.endpoint.clone())
            .with_interval(seconds("heartbeat.interval_secs", self.interval_secs)?)
            .with_timeout(seconds("heartbeat.timeout_secs", self.timeout_secs)?)
            .with_max_missed(self.max_missed);
        config.validate()?;
        Ok(config)
    }
}

/// Connection and retry tunables, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsSection {
    /// Wait for a connection after attaching (default: 2000)
    pub connect_timeout_ms: u64,
    /// Socket monitor poll bound (default: 500)
    pub poll_timeout_ms: u64,
    /// Attempts before connect or request gives up (default: 3)
    pub attempts: u32,
    /// Pause between connection attempts (default: 1000)
    pub retry_timeout_ms: u64,
    /// Wait for a reply (default: 5000)
    pub reply_timeout_ms: u64,
}

impl Default for OptionsSection {
    fn default() -> Self {
        let options = NodeOptions::default();
        Self {
            connect_timeout_ms: millis(options.connect_timeout),
            poll_timeout_ms: millis(options.poll_timeout),
            attempts: options.retry.attempts,
            retry_timeout_ms: millis(options.retry.retry_timeout),
            reply_timeout_ms: millis(options.retry.reply_timeout),
        }
    }
}

impl OptionsSection {
    pub fn to_node_options(&self) -> Result<NodeOptions> {
        if self.attempts == 0 {
            bail!("options.attempts must be at least 1");
        }
        Ok(NodeOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            retry: RetryPolicy {
                attempts: self.attempts,
                retry_timeout: Duration::from_millis(self.retry_timeout_ms),
                reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            },
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{} must be a non-negative number of seconds, got {}", field, value))
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub role: Option<NodeRole>,
    pub endpoint: Option<ConnectionDescriptor>,
    pub heartbeat: Option<ConnectionDescriptor>,
    pub interval_secs: Option<f64>,
    pub timeout_secs: Option<f64>,
    pub max_missed: Option<u32>,
    pub identity_file: Option<PathBuf>,
    pub workers: Option<usize>,
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config")
    }

    /// Apply command-line overrides on top of the loaded values.
    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(role) = overrides.role {
            self.role = role;
        }
        if let Some(endpoint) = overrides.endpoint {
            self.endpoint = Some(endpoint);
        }
        if let Some(identity_file) = overrides.identity_file {
            self.identity_file = identity_file;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }

        if let Some(endpoint) = overrides.heartbeat {
            match &mut self.heartbeat {
                Some(section) => section.endpoint = endpoint,
                None => self.heartbeat = Some(HeartbeatSection::new(endpoint)),
            }
        }

        let tuning = overrides.interval_secs.is_some()
            || overrides.timeout_secs.is_some()
            || overrides.max_missed.is_some();
        match &mut self.heartbeat {
            Some(section) => {
                if let Some(interval) = overrides.interval_secs {
                    section.interval_secs = interval;
                }
                if let Some(timeout) = overrides.timeout_secs {
                    section.timeout_secs = timeout;
                }
                if let Some(max_missed) = overrides.max_missed {
                    section.max_missed = max_missed;
                }
            }
            None if tuning => {
                bail!("--interval, --timeout and --max-missed need a heartbeat endpoint");
            }
            None => {}
        }
        Ok(())
    }

    /// Build the node configuration.
    pub fn to_node_config(&self) -> Result<NodeConfig> {
        let endpoint = self
            .endpoint
            .clone()
            .context("No endpoint configured; set \"endpoint\" or pass --endpoint")?;
        let mut config =
            NodeConfig::new(self.role, endpoint).with_options(self.options.to_node_options()?);
        if let Some(section) = &self.heartbeat {
            config = config.with_heartbeat(section.to_heartbeat_config()?);
        }
        Ok(config)
    }

    /// Number of worker nodes to run.
    pub fn worker_count(&self) -> Result<usize> {
        match self.workers {
            0 => bail!("workers must be at least 1"),
            1 => Ok(1),
            n if self.role == NodeRole::Worker => Ok(n),
            n => bail!("{} workers requested but the role is {}", n, self.role.as_str()),
        }
    }

    /// Pause between client requests: the heartbeat interval when there is one.
    pub fn client_interval(&self) -> Result<Duration> {
        match &self.heartbeat {
            Some(section) => Ok(section.to_heartbeat_config()?.interval),
            None => Ok(DEFAULT_CLIENT_INTERVAL),
        }
    }
}
