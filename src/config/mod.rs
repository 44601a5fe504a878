//! Configuration management for the talon watcher
//!
//! Configuration loads from a TOML file with environment variable overrides
//! for the values most often changed per deployment. Credentials themselves
//! never appear in the file, only the names of the environment variables that
//! hold them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::limiter::CooldownPolicy;
use crate::pool::CredentialRef;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Polling behavior
    pub watch: WatchConfig,

    /// Accounts in rotation, in priority order
    pub accounts: Vec<AccountConfig>,

    /// Optional egress paths; empty means direct egress
    pub egress: Vec<EgressConfig>,

    /// Rate-limit detection and cooldown tuning
    pub limiter: LimiterConfig,

    /// Durable state locations
    pub state: StateConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Polling behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Timeline endpoint of the watched list
    pub list_url: String,

    /// Login endpoint used by bootstrap
    pub login_url: String,

    /// Seconds between polls
    pub interval_secs: u64,

    /// Additional load/scroll cycles to follow after the initial page
    pub max_scrolls: u32,

    /// Per-poll record limit, 0 for unbounded
    pub record_limit: usize,

    /// Deadline for one full renderer call
    pub fetch_timeout_secs: u64,
}

/// One account in rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub username_env: String,
    pub password_env: String,
}

/// One egress path descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressConfig {
    pub id: String,
    /// Proxy URL, e.g. `http://proxy.example:8080` or `socks5://...`
    pub url: String,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
}

/// Rate-limit detection and cooldown tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Regex patterns marking a rate-limited response; empty selects the
    /// built-in defaults
    pub markers: Vec<String>,

    /// Consecutive network failures at/above this count retire an identity
    pub failure_threshold: u32,

    /// Cooldown after an explicit rate limit
    pub rate_limited_cooldown_secs: u64,

    /// Cooldown after a quiet (zero record) poll
    pub quiet_cooldown_secs: u64,

    /// Base of the transient-failure backoff
    pub transient_base_secs: u64,

    /// Ceiling of the transient-failure backoff
    pub transient_cap_secs: u64,

    /// Minimum idle time before an egress path is reused
    pub egress_dwell_secs: u64,

    /// Cooldown after an egress connectivity failure
    pub egress_cooldown_secs: u64,
}

/// Durable state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory for watermark, sessions, and pool state
    pub dir: PathBuf,

    /// Output document path
    pub output_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            list_url: String::new(),
            login_url: String::from("https://x.com/i/flow/login"),
            interval_secs: 60,
            max_scrolls: 3,
            record_limit: 10,
            fetch_timeout_secs: 45,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            markers: Vec::new(),
            failure_threshold: 3,
            rate_limited_cooldown_secs: 600,
            quiet_cooldown_secs: 300,
            transient_base_secs: 30,
            transient_cap_secs: 480,
            egress_dwell_secs: 300,
            egress_cooldown_secs: 300,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            output_path: PathBuf::from("data/records.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            accounts: Vec::new(),
            egress: Vec::new(),
            limiter: LimiterConfig::default(),
            state: StateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for per-deployment values
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TALON_LIST_URL") {
            self.watch.list_url = url;
        }
        if let Ok(secs) = std::env::var("TALON_POLL_INTERVAL") {
            if let Ok(parsed) = secs.parse() {
                self.watch.interval_secs = parsed;
            }
        }
        if let Ok(dir) = std::env::var("TALON_STATE_DIR") {
            self.state.dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("TALON_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.watch.list_url.is_empty() {
            anyhow::bail!("watch.list_url must be set");
        }
        url::Url::parse(&self.watch.list_url).context("watch.list_url is not a valid URL")?;
        url::Url::parse(&self.watch.login_url).context("watch.login_url is not a valid URL")?;

        if self.accounts.is_empty() {
            anyhow::bail!("at least one account must be configured");
        }
        if self.watch.interval_secs == 0 {
            anyhow::bail!("watch.interval_secs must be greater than 0");
        }
        if self.watch.fetch_timeout_secs == 0 {
            anyhow::bail!("watch.fetch_timeout_secs must be greater than 0");
        }
        if self.limiter.failure_threshold == 0 {
            anyhow::bail!("limiter.failure_threshold must be greater than 0");
        }

        for egress in &self.egress {
            url::Url::parse(&egress.url)
                .with_context(|| format!("egress url for {} is not valid", egress.id))?;
        }

        Ok(())
    }

    /// Accounts in pool insertion order
    pub fn credentials(&self) -> Vec<(String, CredentialRef)> {
        self.accounts
            .iter()
            .map(|account| {
                (
                    account.name.clone(),
                    CredentialRef {
                        username_env: account.username_env.clone(),
                        password_env: account.password_env.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            rate_limited: Duration::from_secs(self.limiter.rate_limited_cooldown_secs),
            quiet: Duration::from_secs(self.limiter.quiet_cooldown_secs),
            transient_base: Duration::from_secs(self.limiter.transient_base_secs),
            transient_cap: Duration::from_secs(self.limiter.transient_cap_secs),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch.interval_secs)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch.fetch_timeout_secs)
    }

    #[must_use]
    pub fn egress_dwell(&self) -> Duration {
        Duration::from_secs(self.limiter.egress_dwell_secs)
    }

    #[must_use]
    pub fn egress_cooldown(&self) -> Duration {
        Duration::from_secs(self.limiter.egress_cooldown_secs)
    }
}
