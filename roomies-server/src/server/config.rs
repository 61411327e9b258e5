use crate::engine::{BadgeCatalog, BadgeRule, EngineError, EngineSettings};
use chrono_tz::Tz;
use roomies_shared::domain::{Household, Task, User};
use serde::Deserialize;
use std::{env, fs, path::Path};

pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub households: Vec<Household>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub dev_cors_origin: Option<String>,
    pub listen_port: Option<u16>,
    /// IANA zone whose midnight separates calendar days. Defaults to UTC.
    pub timezone: Option<String>,
    /// Per-connection SSE queue length.
    pub event_buffer: Option<usize>,
    /// Replaces the built-in badge catalog when present.
    pub badges: Option<Vec<BadgeRule>>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Yaml(e) => write!(f, "YAML error: {}", e),
            ConfigError::Invalid(m) => write!(f, "invalid config: {}", m),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Yaml(value)
    }
}

impl From<EngineError> for ConfigError {
    fn from(value: EngineError) -> Self {
        ConfigError::Invalid(value.to_string())
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_path(path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate; a bad zone or badge list fails here rather than at first use.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = serde_yaml::from_str(text)?;
        cfg.engine_settings()?;
        if cfg.event_buffer == Some(0) {
            return Err(ConfigError::Invalid("event_buffer must be at least 1".into()));
        }
        Ok(cfg)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        match self.timezone.as_deref() {
            None => Ok(Tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {}", name))),
        }
    }

    pub fn badge_catalog(&self) -> Result<BadgeCatalog, ConfigError> {
        match &self.badges {
            None => Ok(BadgeCatalog::default()),
            Some(rules) => Ok(BadgeCatalog::new(rules.clone())?),
        }
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER).max(1)
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            timezone: self.timezone()?,
            catalog: self.badge_catalog()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = AppConfig::from_yaml("listen_port: 8080\n").unwrap();
        assert_eq!(cfg.listen_port, Some(8080));
        assert_eq!(cfg.event_buffer(), DEFAULT_EVENT_BUFFER);
        let settings = cfg.engine_settings().unwrap();
        assert_eq!(settings.timezone, Tz::UTC);
        assert_eq!(settings.catalog, BadgeCatalog::default());
    }

    #[test]
    fn seed_data_and_overrides_parse() {
        let cfg = AppConfig::from_yaml(
            r#"
timezone: Europe/Warsaw
event_buffer: 8
users:
  - { id: u1, display_name: Ala }
households:
  - { id: h1, name: Flat, members: [u1] }
tasks:
  - { id: t1, household_id: h1, title: Dishes, points: 10, priority: high }
badges:
  - { type_key: first_task, name: First, description: one, icon_key: star, metric: tasks_completed, threshold: 1 }
"#,
        )
        .unwrap();
        assert_eq!(cfg.timezone().unwrap(), Tz::Europe__Warsaw);
        assert_eq!(cfg.event_buffer(), 8);
        assert_eq!(cfg.households[0].members, vec!["u1".to_string()]);
        assert_eq!(cfg.tasks[0].points, 10);
        assert_eq!(cfg.badge_catalog().unwrap().rules().len(), 1);
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let err = AppConfig::from_yaml("timezone: Mars/Olympus\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        assert!(matches!(
            AppConfig::from_yaml("event_buffer: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
