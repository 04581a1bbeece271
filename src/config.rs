//! Configuration types for the bot runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Runtime state persistence settings.
    pub state: StateConfig,
    /// Recurring job settings.
    pub scheduler: SchedulerConfig,
    /// Inbound trigger listener settings.
    pub ingest: IngestConfig,
    /// Outbound notification settings.
    pub notifier: NotifierConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Runtime state persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Location of the JSON state document.
    pub path: PathBuf,
    /// Quiet window before a burst of mutations is written (milliseconds).
    pub debounce_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            debounce_ms: 5_000,
        }
    }
}

impl StateConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Recurring job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay before each job's first tick (seconds).
    pub stagger_secs: u64,
    /// Expired timer notification job.
    pub timer_sweep: JobConfig,
    /// Stale session cleanup job.
    pub session_reaper: SessionReaperConfig,
    /// External feed refresh + announcement job.
    pub feed_sync: FeedSyncConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stagger_secs: 5,
            timer_sweep: JobConfig {
                enabled: true,
                interval_secs: 30,
            },
            session_reaper: SessionReaperConfig::default(),
            feed_sync: FeedSyncConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }
}

/// Enable switch and interval shared by simple jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl JobConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Stale session cleanup. Each session category ages on its own clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Activity sessions older than this are dropped (seconds).
    pub activity_max_age_secs: u64,
    /// Voice sessions older than this are dropped (seconds).
    pub voice_max_age_secs: u64,
}

impl Default for SessionReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            activity_max_age_secs: 12 * 3600,
            voice_max_age_secs: 24 * 3600,
        }
    }
}

impl SessionReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// External feed refresh job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSyncConfig {
    pub enabled: bool,
    /// JSON feed URL.
    pub url: Option<String>,
    pub interval_secs: u64,
}

impl Default for FeedSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            interval_secs: 900,
        }
    }
}

impl FeedSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Inbound trigger listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    pub host: String,
    /// TCP port (0 picks a free port).
    pub port: u16,
    /// Path of the trigger endpoint.
    pub path: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_owned(),
            port: 5080,
            path: "/trigger".to_owned(),
        }
    }
}

/// Outbound notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Chat webhook URL. Notifications are only logged when unset.
    pub webhook_url: Option<String>,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Directory for daily-rolling log files (stderr only when unset).
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tether=info".to_owned(),
            directory: None,
        }
    }
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| std::env::temp_dir().join("tether"))
        .join("state.json")
}

impl BotConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::BotError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::BotError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/tether/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("tether"))
            .unwrap_or_else(|| std::env::temp_dir().join("tether-config"))
            .join("config.toml")
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigIssueSeverity {
    Warning,
    Error,
}

/// Validation issue surfaced at startup and by `check-config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub id: String,
    pub severity: ConfigIssueSeverity,
    pub summary: String,
}

impl ConfigIssue {
    fn warning(id: &str, summary: impl Into<String>) -> Self {
        Self {
            id: id.to_owned(),
            severity: ConfigIssueSeverity::Warning,
            summary: summary.into(),
        }
    }

    fn error(id: &str, summary: impl Into<String>) -> Self {
        Self {
            id: id.to_owned(),
            severity: ConfigIssueSeverity::Error,
            summary: summary.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            ConfigIssueSeverity::Warning => "warning",
            ConfigIssueSeverity::Error => "error",
        };
        write!(f, "{level} [{}]: {}", self.id, self.summary)
    }
}

/// Validate configuration without network calls.
#[must_use]
pub fn validate_config(config: &BotConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if config.state.debounce_ms == 0 {
        issues.push(ConfigIssue::warning(
            "state-zero-debounce",
            "state.debounce_ms is 0; every mutation burst is written immediately.",
        ));
    }

    let scheduler = &config.scheduler;
    let jobs = [
        ("timer_sweep", scheduler.timer_sweep.enabled, scheduler.timer_sweep.interval_secs),
        (
            "session_reaper",
            scheduler.session_reaper.enabled,
            scheduler.session_reaper.interval_secs,
        ),
        ("feed_sync", scheduler.feed_sync.enabled, scheduler.feed_sync.interval_secs),
    ];
    for (name, enabled, interval_secs) in jobs {
        if enabled && interval_secs == 0 {
            issues.push(ConfigIssue::error(
                &format!("{name}-zero-interval"),
                format!("scheduler.{name}.interval_secs must be greater than 0."),
            ));
        }
    }

    if scheduler.feed_sync.enabled
        && scheduler
            .feed_sync
            .url
            .as_deref()
            .is_none_or(|url| url.trim().is_empty())
    {
        issues.push(ConfigIssue::error(
            "feed_sync-missing-url",
            "scheduler.feed_sync is enabled but no url is set.",
        ));
    }

    if config.ingest.enabled {
        if !crate::ingest::is_valid_route_path(&config.ingest.path) {
            issues.push(ConfigIssue::error(
                "ingest-invalid-path",
                format!(
                    "ingest.path `{}` must start with `/` and contain no route patterns.",
                    config.ingest.path
                ),
            ));
        }
        if config.ingest.host.trim() == "0.0.0.0" {
            issues.push(ConfigIssue::warning(
                "ingest-public-bind",
                "Binding the trigger listener to 0.0.0.0 exposes it on every interface.",
            ));
        }
    }

    issues
}
