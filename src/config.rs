use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::types::Game;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Restart window in whole hours; an extra random fraction of an hour is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RestartWindow {
    pub from_hours: u32,
    pub to_hours: u32,
}

impl Default for RestartWindow {
    fn default() -> Self {
        Self {
            from_hours: 4,
            to_hours: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Restart agent sessions periodically
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default)]
    pub restart_policy: RestartWindow,
    /// 64-bit ids of partners whose offers are accepted automatically
    #[serde(default)]
    pub whitelist: Vec<u64>,
    /// Cancel sent offers that stay unresolved for too long
    #[serde(default = "default_true")]
    pub auto_cancel_offers: bool,
    #[serde(default = "default_offer_cancel_delay")]
    pub offer_cancel_delay_secs: u64,
    /// Domain used when registering an api key
    #[serde(default = "default_registration_domain")]
    pub registration_domain: String,
    /// Games whose inventory is fetched once a session is ready
    #[serde(default)]
    pub prefetch_games: Vec<Game>,
    /// Per-agent readiness timeout during startup
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_offer_cancel_delay() -> u64 {
    300
}

fn default_registration_domain() -> String {
    "localhost".to_string()
}

fn default_start_timeout() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            restart_policy: RestartWindow::default(),
            whitelist: Vec::new(),
            auto_cancel_offers: true,
            offer_cancel_delay_secs: default_offer_cancel_delay(),
            registration_domain: default_registration_domain(),
            prefetch_games: Vec::new(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rotated log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("pool.auto_restart", true)?
            .set_default("pool.auto_cancel_offers", true)?
            .set_default("pool.offer_cancel_delay_secs", 300)?
            .set_default("pool.registration_domain", "localhost")?
            .set_default("pool.start_timeout_secs", 60)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEPOOL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (e.g., TRADEPOOL_POOL__REGISTRATION_DOMAIN)
            .add_source(
                Environment::with_prefix("TRADEPOOL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let window = &self.pool.restart_policy;
        if self.pool.auto_restart && window.from_hours > window.to_hours {
            errors.push(format!(
                "restart_policy.from_hours ({}) must not exceed to_hours ({})",
                window.from_hours, window.to_hours
            ));
        }

        if self.pool.registration_domain.trim().is_empty() {
            errors.push("registration_domain must not be empty".to_string());
        }

        if self.pool.start_timeout_secs == 0 {
            errors.push("start_timeout_secs must be positive".to_string());
        }

        if let Some(game) = self.pool.prefetch_games.iter().find(|g| g.id.0 == 0) {
            errors.push(format!("prefetch game '{}' has no app id", game.name));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.offer_cancel_delay_secs, 300);
        assert_eq!(config.pool.registration_domain, "localhost");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_directory() {
        let dir = std::env::temp_dir().join(format!("tradepool-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            r#"
[pool]
whitelist = [76561198000000001]
offer_cancel_delay_secs = 30
restart_policy = { from_hours = 10, to_hours = 11 }

[[pool.prefetch_games]]
id = 440
name = "Team Fortress 2"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&dir).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(config.pool.offer_cancel_delay_secs, 30);
        assert_eq!(config.pool.whitelist, vec![76_561_198_000_000_001]);
        assert_eq!(config.pool.restart_policy.from_hours, 10);
        assert_eq!(config.pool.prefetch_games.len(), 1);
        assert_eq!(config.pool.prefetch_games[0].context_id, 2);
        assert!(config.pool.auto_cancel_offers);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.pool.restart_policy = RestartWindow {
            from_hours: 5,
            to_hours: 1,
        };
        config.pool.start_timeout_secs = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
