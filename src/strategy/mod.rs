// =============================================================================
// Strategy Plug-in Contract
// =============================================================================
//
// Every strategy is a small state machine over a bar window: it declares its
// parameter schema up front, is constructed (initialized) once per binding,
// and is then asked for a signal on each closed bar. Strategies never touch
// I/O — they are pure functions of their own state plus the bar window
// they're handed.
//
// A name -> factory registry means an unknown strategy name fails at
// binding time, never partway through a running trading loop.

pub mod rsi_bollinger;
pub mod rsi_mean_reversion;
pub mod sma_crossover;

use std::collections::HashMap;
use thiserror::Error;

use crate::types::{Bar, Signal};

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterKind {
    Integer,
    Float,
    Bool,
}

/// One entry in a strategy's declared parameter schema.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub default: serde_json::Value,
}

/// A strategy's per-bar decision engine. Constructed once per instrument
/// binding by a `StrategyFactory`; `on_bar` is called once per closed bar.
pub trait Strategy: Send {
    /// Compute a signal for the most recent bar in `bar_window` (oldest
    /// first, newest last). Must be side-effect-free except for the
    /// strategy's own internal state, and must not block on I/O.
    fn on_bar(&mut self, bar_window: &[Bar]) -> Signal;
}

type BuildFn = fn(&serde_json::Map<String, serde_json::Value>) -> Result<Box<dyn Strategy>, StrategyError>;
type DeclareFn = fn() -> Vec<ParameterSpec>;

#[derive(Clone, Copy)]
struct StrategyFactory {
    declare_parameters: DeclareFn,
    build: BuildFn,
}

/// Maps a strategy name to its factory. Populated with the built-ins at
/// construction; the Engine Root may register additional ones before
/// validating configuration. Unknown names fail at `build`/`declare_parameters`
/// time, which the configuration validator calls during startup — never
/// inside the Trading Loop.
pub struct StrategyRegistry {
    factories: HashMap<&'static str, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn with_builtins() -> Self {
        let mut factories = HashMap::new();
        factories.insert(
            "sma_crossover",
            StrategyFactory {
                declare_parameters: sma_crossover::declare_parameters,
                build: sma_crossover::build,
            },
        );
        factories.insert(
            "rsi_mean_reversion",
            StrategyFactory {
                declare_parameters: rsi_mean_reversion::declare_parameters,
                build: rsi_mean_reversion::build,
            },
        );
        factories.insert(
            "rsi_bollinger",
            StrategyFactory {
                declare_parameters: rsi_bollinger::declare_parameters,
                build: rsi_bollinger::build,
            },
        );
        Self { factories }
    }

    pub fn declare_parameters(&self, name: &str) -> Result<Vec<ParameterSpec>, StrategyError> {
        self.factories
            .get(name)
            .map(|f| (f.declare_parameters)())
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))
    }

    pub fn build(
        &self,
        name: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
        (factory.build)(parameters)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Read a numeric parameter from a raw parameter map, falling back to the
/// declared default when absent, and rejecting a present-but-wrong type.
pub(crate) fn param_f64(
    parameters: &serde_json::Map<String, serde_json::Value>,
    name: &str,
    default: f64,
) -> Result<f64, StrategyError> {
    match parameters.get(name) {
        None => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| StrategyError::InvalidParameter {
            name: name.to_string(),
            reason: format!("expected a number, got {v}"),
        }),
    }
}

pub(crate) fn param_usize(
    parameters: &serde_json::Map<String, serde_json::Value>,
    name: &str,
    default: usize,
) -> Result<usize, StrategyError> {
    match parameters.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| StrategyError::InvalidParameter {
                name: name.to_string(),
                reason: format!("expected a non-negative integer, got {v}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_name_fails_at_build_time() {
        let registry = StrategyRegistry::with_builtins();
        let err = registry.build("does_not_exist", &serde_json::Map::new());
        assert!(matches!(err, Err(StrategyError::UnknownStrategy(_))));
    }

    #[test]
    fn unknown_strategy_name_fails_declare_parameters_too() {
        let registry = StrategyRegistry::with_builtins();
        let err = registry.declare_parameters("does_not_exist");
        assert!(matches!(err, Err(StrategyError::UnknownStrategy(_))));
    }

    #[test]
    fn all_builtins_are_registered() {
        let registry = StrategyRegistry::with_builtins();
        for name in ["sma_crossover", "rsi_mean_reversion", "rsi_bollinger"] {
            assert!(registry.declare_parameters(name).is_ok(), "{name} should be registered");
            assert!(registry.build(name, &serde_json::Map::new()).is_ok());
        }
    }
}
