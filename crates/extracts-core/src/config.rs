//! Worker configuration.
//!
//! Built from defaults, then an optional TOML file, then `EXTRACTS_*` environment
//! variables, then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthSettings;
use crate::domain::{ActiveInterval, Backoff, JobOptions, ScheduleRecord};

/// Path of the TOML file, if any.
pub const CONFIG_PATH_ENV: &str = "EXTRACTS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "compact" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub target_domain: String,
    pub code_timeout_secs: u64,
    pub redirect_timeout_secs: u64,
    pub redirect_poll_millis: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            target_domain: "rosreestr.ru".to_string(),
            code_timeout_secs: 300,
            redirect_timeout_secs: 60,
            redirect_poll_millis: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// Concurrent consumers per job kind.
    pub concurrency: usize,
    /// Delay before the first status check of a freshly registered order.
    pub status_check_delay_secs: u64,
    /// Delay before a job blocked on operator action is tried again.
    pub operator_action_delay_secs: u64,
    /// JSON file the queue is mirrored to. In memory only when unset.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_secs: 10,
            backoff_max_secs: 600,
            concurrency: 1,
            status_check_delay_secs: 60,
            operator_action_delay_secs: 600,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub task_name: String,
    /// `HH:MM-HH:MM` in `utc_offset` local time.
    pub window: String,
    pub utc_offset: String,
    pub sweep_period_secs: u64,
    pub sweep_pause_min_millis: u64,
    pub sweep_pause_max_millis: u64,
    /// JSON file holding run state. In memory only when unset.
    pub state_path: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            task_name: "order-status-checker".to_string(),
            window: "20:00-07:00".to_string(),
            utc_offset: "+03:00".to_string(),
            sweep_period_secs: 1800,
            sweep_pause_min_millis: 1000,
            sweep_pause_max_millis: 3000,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Portal account this worker signs in as.
    pub operator_username: String,
    pub downloads_dir: PathBuf,
    pub captcha_dir: PathBuf,
    pub portal: PortalConfig,
    pub queue: QueueConfig,
    pub schedule: ScheduleConfig,
    pub log: LogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            operator_username: "operator".to_string(),
            downloads_dir: PathBuf::from("downloads"),
            captcha_dir: PathBuf::from("captcha"),
            portal: PortalConfig::default(),
            queue: QueueConfig::default(),
            schedule: ScheduleConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string()))
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Defaults, then `$EXTRACTS_CONFIG` if set, then environment overrides. Validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `EXTRACTS_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("EXTRACTS_OPERATOR") {
            self.operator_username = v.trim().to_string();
        }
        if let Some(v) = get("EXTRACTS_DOWNLOADS_DIR") {
            self.downloads_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("EXTRACTS_CAPTCHA_DIR") {
            self.captcha_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = get("EXTRACTS_CODE_TIMEOUT_SECS") {
            self.portal.code_timeout_secs = parse_env("EXTRACTS_CODE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("EXTRACTS_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_env("EXTRACTS_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("EXTRACTS_BACKOFF_SECS") {
            self.queue.backoff_initial_secs = parse_env("EXTRACTS_BACKOFF_SECS", &v)?;
        }
        if let Some(v) = get("EXTRACTS_STATUS_CHECK_DELAY_SECS") {
            self.queue.status_check_delay_secs = parse_env("EXTRACTS_STATUS_CHECK_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("EXTRACTS_QUEUE_SNAPSHOT") {
            self.queue.snapshot_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("EXTRACTS_SWEEP_PERIOD_SECS") {
            self.schedule.sweep_period_secs = parse_env("EXTRACTS_SWEEP_PERIOD_SECS", &v)?;
        }
        if let Some(v) = get("EXTRACTS_SCHEDULE_WINDOW") {
            self.schedule.window = v.trim().to_string();
        }
        if let Some(v) = get("EXTRACTS_SCHEDULE_OFFSET") {
            self.schedule.utc_offset = v.trim().to_string();
        }
        if let Some(v) = get("EXTRACTS_SCHEDULE_STATE") {
            self.schedule.state_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("EXTRACTS_LOG_LEVEL") {
            self.log.level = v.trim().to_lowercase();
        }
        if let Some(v) = get("EXTRACTS_LOG_FORMAT") {
            self.log.format = parse_env("EXTRACTS_LOG_FORMAT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_username.trim().is_empty() {
            return Err(invalid("operator_username", "cannot be empty"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }
        if self.queue.concurrency == 0 {
            return Err(invalid("queue.concurrency", "must be at least 1"));
        }
        if self.queue.backoff_initial_secs > self.queue.backoff_max_secs {
            return Err(invalid(
                "queue.backoff_initial_secs",
                format!("exceeds backoff_max_secs ({})", self.queue.backoff_max_secs),
            ));
        }
        if self.portal.code_timeout_secs == 0 {
            return Err(invalid("portal.code_timeout_secs", "must be positive"));
        }
        if self.portal.redirect_poll_millis == 0 {
            return Err(invalid("portal.redirect_poll_millis", "must be positive"));
        }
        if self.schedule.sweep_period_secs == 0 {
            return Err(invalid("schedule.sweep_period_secs", "must be positive"));
        }
        if self.schedule.sweep_pause_min_millis > self.schedule.sweep_pause_max_millis {
            return Err(invalid(
                "schedule.sweep_pause_min_millis",
                "exceeds sweep_pause_max_millis",
            ));
        }
        self.window()?;
        self.utc_offset()?;

        let levels = ["error", "warn", "info", "debug", "trace"];
        if !levels.contains(&self.log.level.as_str()) {
            return Err(invalid(
                "log.level",
                format!("must be one of: {}", levels.join(", ")),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Result<ActiveInterval, ConfigError> {
        self.schedule
            .window
            .parse()
            .map_err(|e: String| invalid("schedule.window", e))
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.schedule
            .utc_offset
            .parse()
            .map_err(|e: chrono::ParseError| invalid("schedule.utc_offset", e.to_string()))
    }

    /// Record seeded for the status sweep task.
    pub fn schedule_record(&self) -> Result<ScheduleRecord, ConfigError> {
        Ok(ScheduleRecord::new(
            self.schedule.task_name.clone(),
            self.window()?,
        ))
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.queue.max_attempts,
            backoff: Backoff {
                initial_delay: Duration::from_secs(self.queue.backoff_initial_secs),
                max_delay: Duration::from_secs(self.queue.backoff_max_secs),
            },
            ..JobOptions::default()
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            code_timeout: Duration::from_secs(self.portal.code_timeout_secs),
            redirect_timeout: Duration::from_secs(self.portal.redirect_timeout_secs),
            redirect_poll: Duration::from_millis(self.portal.redirect_poll_millis),
            target_domain: self.portal.target_domain.clone(),
            captcha_dir: self.captcha_dir.clone(),
        }
    }

    pub fn status_check_delay(&self) -> Duration {
        Duration::from_secs(self.queue.status_check_delay_secs)
    }

    pub fn operator_action_delay(&self) -> Duration {
        Duration::from_secs(self.queue.operator_action_delay_secs)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.schedule.sweep_period_secs)
    }

    pub fn sweep_pause(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.schedule.sweep_pause_min_millis),
            Duration::from_millis(self.schedule.sweep_pause_max_millis),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use chrono::NaiveTime;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.job_options().max_attempts, 3);
        assert_eq!(config.auth_settings().code_timeout, Duration::from_secs(300));
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), 3 * 3600);
        assert!(config.window().unwrap().wraps_midnight());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            r#"
operator_username = "user1"

[queue]
max_attempts = 5
snapshot_path = "/var/lib/extracts/queue.json"

[schedule]
window = "21:30-06:00"

[log]
format = "json"
"#,
        )
        .unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.operator_username, "user1");
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.backoff_initial_secs, 10);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.window().unwrap().start,
            NaiveTime::from_hms_opt(21, 30, 0).unwrap()
        );
    }

    #[test]
    fn env_overrides_win() {
        let mut config = WorkerConfig::default();
        config
            .apply_overrides(env(&[
                ("EXTRACTS_OPERATOR", "user2"),
                ("EXTRACTS_CODE_TIMEOUT_SECS", "30"),
                ("EXTRACTS_SCHEDULE_WINDOW", "00:00-06:00"),
                ("EXTRACTS_LOG_FORMAT", "JSON"),
                ("EXTRACTS_DOWNLOADS_DIR", "  "),
            ]))
            .unwrap();

        assert_eq!(config.operator_username, "user2");
        assert_eq!(config.portal.code_timeout_secs, 30);
        assert_eq!(config.schedule.window, "00:00-06:00");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.downloads_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_overrides(env(&[("EXTRACTS_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "EXTRACTS_MAX_ATTEMPTS"));

        let mut config = WorkerConfig::default();
        config.schedule.window = "evening".into();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.log.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
