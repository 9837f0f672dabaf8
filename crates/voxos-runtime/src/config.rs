//! Runtime configuration.
//!
//! [`RuntimeConfig`] carries every timeout and interval used by the
//! scheduler, the event bus and the launchers.  Defaults are provided via
//! [`Default`], and a builder-style API allows callers to override fields.
//!
//! [`RuntimeFile`] loads a TOML file with a `[runtime]` table (all fields in
//! milliseconds, all optional) and an `[[apps]]` array of installed
//! application descriptors.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RuntimeError};
use crate::types::AppMetadata;

/// Timeouts and intervals of the application runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a launched app may take to report `ready`.
    ///
    /// Default: **15 s**.
    pub ready_timeout: Duration,

    /// How long a suspended app may take to exit.
    ///
    /// Default: **5 s**.
    pub suspend_timeout: Duration,

    /// Interval of the ANR sentinel.
    ///
    /// Default: **5 s**.
    pub anr_check_interval: Duration,

    /// Liveness silence after which an app is considered not responding.
    ///
    /// Default: **15 s**.
    pub anr_threshold: Duration,

    /// Delay before relaunching an exited daemon app.
    ///
    /// Default: **5 s**.
    pub daemon_restart_delay: Duration,

    /// Launch mode used when neither options nor metadata name one.
    ///
    /// Default: **"default"**.
    pub default_mode: String,

    /// Capacity of the runtime signal bus.
    ///
    /// Default: **256**.
    pub signal_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(15),
            suspend_timeout: Duration::from_secs(5),
            anr_check_interval: Duration::from_secs(5),
            anr_threshold: Duration::from_secs(15),
            daemon_restart_delay: Duration::from_secs(5),
            default_mode: "default".to_string(),
            signal_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn with_anr_check_interval(mut self, interval: Duration) -> Self {
        self.anr_check_interval = interval;
        self
    }

    pub fn with_anr_threshold(mut self, threshold: Duration) -> Self {
        self.anr_threshold = threshold;
        self
    }

    pub fn with_daemon_restart_delay(mut self, delay: Duration) -> Self {
        self.daemon_restart_delay = delay;
        self
    }

    pub fn with_default_mode(mut self, mode: impl Into<String>) -> Self {
        self.default_mode = mode.into();
        self
    }

    /// Check that every timeout and interval is non-zero.
    ///
    /// `daemon_restart_delay` may be zero (relaunch immediately).
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("ready_timeout_ms", self.ready_timeout),
            ("suspend_timeout_ms", self.suspend_timeout),
            ("anr_check_interval_ms", self.anr_check_interval),
            ("anr_threshold_ms", self.anr_threshold),
        ];
        for (key, value) in required {
            if value.is_zero() {
                return Err(RuntimeError::Config {
                    reason: format!("`{key}` must be greater than zero"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// `[runtime]` table as written in the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSection {
    ready_timeout_ms: Option<u64>,
    suspend_timeout_ms: Option<u64>,
    anr_check_interval_ms: Option<u64>,
    anr_threshold_ms: Option<u64>,
    daemon_restart_delay_ms: Option<u64>,
    default_mode: Option<String>,
    signal_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLayout {
    #[serde(default)]
    runtime: RuntimeSection,
    #[serde(default)]
    apps: Vec<AppMetadata>,
}

/// Parsed configuration file.
#[derive(Debug, Clone)]
pub struct RuntimeFile {
    pub config: RuntimeConfig,
    pub apps: Vec<AppMetadata>,
}

impl RuntimeFile {
    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| RuntimeError::Config {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let file = Self::parse(&content)?;
        tracing::info!(path = %path.display(), apps = file.apps.len(), "configuration loaded");
        Ok(file)
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let layout: FileLayout = toml::from_str(content).map_err(|e| RuntimeError::Config {
            reason: e.to_string(),
        })?;

        let defaults = RuntimeConfig::default();
        let section = layout.runtime;
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

        let config = RuntimeConfig {
            ready_timeout: ms(section.ready_timeout_ms, defaults.ready_timeout),
            suspend_timeout: ms(section.suspend_timeout_ms, defaults.suspend_timeout),
            anr_check_interval: ms(section.anr_check_interval_ms, defaults.anr_check_interval),
            anr_threshold: ms(section.anr_threshold_ms, defaults.anr_threshold),
            daemon_restart_delay: ms(
                section.daemon_restart_delay_ms,
                defaults.daemon_restart_delay,
            ),
            default_mode: section.default_mode.unwrap_or(defaults.default_mode),
            signal_capacity: section
                .signal_capacity
                .map(|c| c.max(1))
                .unwrap_or(defaults.signal_capacity),
        };
        config.validate()?;

        let mut seen = std::collections::HashSet::new();
        for app in &layout.apps {
            if !seen.insert(app.id.as_str()) {
                return Err(RuntimeError::Config {
                    reason: format!("duplicate app id `{}`", app.id),
                });
            }
            if app.launch_type == crate::types::LaunchType::Exe && app.exec.is_none() {
                return Err(RuntimeError::Config {
                    reason: format!("app `{}` has type exe but no exec path", app.id),
                });
            }
        }

        Ok(Self {
            config,
            apps: layout.apps,
        })
    }
}
