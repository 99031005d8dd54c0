// =============================================================================
// Engine Configuration
// =============================================================================
//
// Every tunable the engine needs before it can start: venue credentials,
// bindings, global risk parameters, and scheduler tuning. Persistence uses
// an atomic tmp + rename pattern, and every field carries a serde default so
// an older config file still loads after new fields are added.
//
// Validation (turning raw JSON into bound `InstrumentBinding`s, checked
// against a `StrategyRegistry`) happens once, at startup — a bad strategy
// name here is a fatal `ConfigError`, never a runtime surprise.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::risk::RiskConfig;
use crate::strategy::StrategyRegistry;
use crate::types::{InstrumentBinding, Timeframe};

fn default_venue() -> String {
    "paper".to_string()
}

fn default_starting_cash() -> f64 {
    10_000.0
}

fn default_bar_history_limit() -> usize {
    200
}

fn default_update_interval_secs() -> u64 {
    5
}

fn default_scheduler_jitter_secs() -> u64 {
    2
}

fn default_requests_per_minute() -> u32 {
    1200
}

fn default_order_rate_limit_per_minute() -> u32 {
    60
}

fn default_circuit_breaker_trip_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config from {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
    #[error("failed to write config to {path}: {source}")]
    Write { path: String, #[source] source: std::io::Error },
    #[error("binding '{symbol}' names unknown strategy '{strategy}'")]
    UnknownStrategy { symbol: String, strategy: String },
    #[error("binding '{symbol}' has invalid strategy parameters: {reason}")]
    InvalidStrategyParameters { symbol: String, reason: String },
    #[error("no bindings configured")]
    NoBindings,
}

/// One `(symbol, timeframe, strategy)` entry as it appears in the config
/// file, before validation turns it into an [`InstrumentBinding`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub fixed_quantity: Option<f64>,
    #[serde(default = "default_max_allocation_fraction")]
    pub max_allocation_fraction: f64,
    #[serde(default)]
    pub risk_overrides: Option<crate::risk::RiskOverrides>,
}

fn default_max_allocation_fraction() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_venue")]
    pub venue: String,
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default = "default_bar_history_limit")]
    pub bar_history_limit: usize,
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "default_scheduler_jitter_secs")]
    pub scheduler_jitter_secs: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_order_rate_limit_per_minute")]
    pub order_rate_limit_per_minute: u32,
    #[serde(default = "default_circuit_breaker_trip_threshold")]
    pub circuit_breaker_trip_threshold: u32,
    #[serde(default = "default_circuit_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            venue: default_venue(),
            starting_cash: default_starting_cash(),
            bindings: Vec::new(),
            risk: RiskConfig::default(),
            bar_history_limit: default_bar_history_limit(),
            update_interval_secs: default_update_interval_secs(),
            scheduler_jitter_secs: default_scheduler_jitter_secs(),
            requests_per_minute: default_requests_per_minute(),
            order_rate_limit_per_minute: default_order_rate_limit_per_minute(),
            circuit_breaker_trip_threshold: default_circuit_breaker_trip_threshold(),
            circuit_breaker_cooldown_secs: default_circuit_breaker_cooldown_secs(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        info!(path = %path.display(), bindings = config.bindings.len(), "engine config loaded");
        Ok(config)
    }

    /// Persist via write-to-tmp-then-rename so a crash mid-write never
    /// leaves a half-written config file in place.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).expect("EngineConfig is always serializable");
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .map_err(|source| ConfigError::Write { path: tmp_path.display().to_string(), source })?;
        std::fs::rename(&tmp_path, path)
            .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })?;

        info!(path = %path.display(), "engine config saved");
        Ok(())
    }

    /// Turn the raw binding configs into validated [`InstrumentBinding`]s,
    /// checking every strategy name and its parameters against `registry`.
    /// This is the only place an unknown strategy name can surface — always
    /// at startup, never inside the trading loop.
    pub fn validate_bindings(&self, registry: &StrategyRegistry) -> Result<Vec<InstrumentBinding>, ConfigError> {
        if self.bindings.is_empty() {
            return Err(ConfigError::NoBindings);
        }

        let mut bindings = Vec::with_capacity(self.bindings.len());
        for raw in &self.bindings {
            registry.declare_parameters(&raw.strategy).map_err(|_| ConfigError::UnknownStrategy {
                symbol: raw.symbol.clone(),
                strategy: raw.strategy.clone(),
            })?;
            registry.build(&raw.strategy, &raw.parameters).map_err(|e| ConfigError::InvalidStrategyParameters {
                symbol: raw.symbol.clone(),
                reason: e.to_string(),
            })?;

            bindings.push(InstrumentBinding {
                symbol: raw.symbol.clone(),
                timeframe: raw.timeframe,
                strategy_name: raw.strategy.clone(),
                strategy_parameters: raw.parameters.clone(),
                fixed_quantity: raw.fixed_quantity,
                max_allocation_fraction: raw.max_allocation_fraction,
                risk_overrides: raw.risk_overrides.clone(),
            });
        }
        Ok(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.venue, config.venue);
        assert_eq!(parsed.bar_history_limit, config.bar_history_limit);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.venue, "paper");
        assert_eq!(parsed.starting_cash, 10_000.0);
    }

    #[test]
    fn validate_bindings_rejects_empty_list() {
        let config = EngineConfig::default();
        let registry = StrategyRegistry::with_builtins();
        assert!(matches!(config.validate_bindings(&registry), Err(ConfigError::NoBindings)));
    }

    #[test]
    fn validate_bindings_rejects_unknown_strategy() {
        let mut config = EngineConfig::default();
        config.bindings.push(BindingConfig {
            symbol: "XRPUSDT".to_string(),
            timeframe: Timeframe::M15,
            strategy: "does_not_exist".to_string(),
            parameters: serde_json::Map::new(),
            fixed_quantity: None,
            max_allocation_fraction: 0.1,
            risk_overrides: None,
        });
        let registry = StrategyRegistry::with_builtins();
        assert!(matches!(config.validate_bindings(&registry), Err(ConfigError::UnknownStrategy { .. })));
    }

    #[test]
    fn validate_bindings_accepts_known_strategy() {
        let mut config = EngineConfig::default();
        config.bindings.push(BindingConfig {
            symbol: "XRPUSDT".to_string(),
            timeframe: Timeframe::M15,
            strategy: "sma_crossover".to_string(),
            parameters: serde_json::Map::new(),
            fixed_quantity: None,
            max_allocation_fraction: 0.1,
            risk_overrides: None,
        });
        let registry = StrategyRegistry::with_builtins();
        let bindings = config.validate_bindings(&registry).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].key(), "XRPUSDT@15m/sma_crossover");
    }

    #[test]
    fn save_then_load_round_trips_to_disk() {
        let dir = std::env::temp_dir().join(format!("aurora-engine-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");

        let mut config = EngineConfig::default();
        config.venue = "binance".to_string();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.venue, "binance");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
