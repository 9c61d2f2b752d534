use rumbo_core::rules::EngineRules;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub rules: EngineRules,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

/// Sweep intervals in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_no_show_interval")]
    pub no_show_interval_secs: u64,
    #[serde(default = "default_forgotten_closure_interval")]
    pub forgotten_closure_interval_secs: u64,
    #[serde(default = "default_violation_expiry_interval")]
    pub violation_expiry_interval_secs: u64,
}

fn default_no_show_interval() -> u64 { 60 }
fn default_forgotten_closure_interval() -> u64 { 300 }
fn default_violation_expiry_interval() -> u64 { 3600 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            no_show_interval_secs: default_no_show_interval(),
            forgotten_closure_interval_secs: default_forgotten_closure_interval(),
            violation_expiry_interval_secs: default_violation_expiry_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize { 256 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `RUMBO_DATABASE__URL=postgres://...` sets `database.url`
            .add_source(config::Environment::with_prefix("RUMBO").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
