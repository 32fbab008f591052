// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridge configuration.
//!
//! Built with [`BridgeConfig::builder`] or read from `INTEROP_*` environment
//! variables with [`BridgeConfig::from_env`].

use std::time::Duration;

use derive_builder::Builder;
use interop_logging::{is_falsey, is_truthy};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::lock::MAX_REENTRANCY_DEPTH;

pub const ENV_MAX_REENTRANCY_DEPTH: &str = "INTEROP_MAX_REENTRANCY_DEPTH";
pub const ENV_LOCK_WAIT_WARN_MS: &str = "INTEROP_LOCK_WAIT_WARN_MS";
pub const ENV_PRINT_PYTHON_ERRORS: &str = "INTEROP_PRINT_PYTHON_ERRORS";
pub const ENV_INITIALIZE_PYTHON: &str = "INTEROP_INITIALIZE_PYTHON";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
#[builder(derive(Debug))]
pub struct BridgeConfig {
    /// Nested acquisitions of the execution lock allowed on one thread.
    #[builder(default = "64")]
    pub max_reentrancy_depth: u32,

    /// Waiting longer than this for the execution lock logs a warning.
    #[builder(default = "Duration::from_millis(1000)")]
    pub lock_wait_warn: Duration,

    /// Print interpreter tracebacks to stderr when a callback raises.
    #[builder(default = "true")]
    pub print_python_errors: bool,

    /// Bring up the embedded interpreter if the host has not done so.
    #[builder(default = "false")]
    pub initialize_python: bool,
}

impl BridgeConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.max_reentrancy_depth {
            Some(0) => Err("max_reentrancy_depth must be at least 1".to_string()),
            Some(depth) if depth > MAX_REENTRANCY_DEPTH => Err(format!(
                "max_reentrancy_depth must be at most {MAX_REENTRANCY_DEPTH}, got {depth}"
            )),
            _ => Ok(()),
        }
    }
}

impl From<BridgeConfigBuilderError> for BridgeError {
    fn from(err: BridgeConfigBuilderError) -> Self {
        BridgeError::Config {
            reason: err.to_string(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_reentrancy_depth: 64,
            lock_wait_warn: Duration::from_millis(1000),
            print_python_errors: true,
            initialize_python: false,
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Defaults overridden by whichever `INTEROP_*` variables are set.
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BridgeConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BridgeResult<Self> {
        let mut builder = Self::builder();

        if let Some(value) = lookup(ENV_MAX_REENTRANCY_DEPTH) {
            builder.max_reentrancy_depth(parse_number(ENV_MAX_REENTRANCY_DEPTH, &value)?);
        }
        if let Some(value) = lookup(ENV_LOCK_WAIT_WARN_MS) {
            let millis: u64 = parse_number(ENV_LOCK_WAIT_WARN_MS, &value)?;
            builder.lock_wait_warn(Duration::from_millis(millis));
        }
        if let Some(value) = lookup(ENV_PRINT_PYTHON_ERRORS) {
            builder.print_python_errors(parse_flag(ENV_PRINT_PYTHON_ERRORS, &value)?);
        }
        if let Some(value) = lookup(ENV_INITIALIZE_PYTHON) {
            builder.initialize_python(parse_flag(ENV_INITIALIZE_PYTHON, &value)?);
        }

        let config = builder.build()?;
        tracing::debug!(
            config = %serde_json::to_string(&config).unwrap_or_default(),
            "bridge configuration loaded"
        );
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> BridgeResult<T> {
    value.trim().parse().map_err(|_| BridgeError::Config {
        reason: format!("{key}={value:?} is not a valid number"),
    })
}

fn parse_flag(key: &str, value: &str) -> BridgeResult<bool> {
    if is_truthy(value) {
        Ok(true)
    } else if is_falsey(value) {
        Ok(false)
    } else {
        Err(BridgeError::Config {
            reason: format!("{key}={value:?} is not a boolean"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_builder_defaults_match_default() {
        let built = BridgeConfig::builder().build().unwrap();
        assert_eq!(built, BridgeConfig::default());
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        let err = BridgeConfig::builder()
            .max_reentrancy_depth(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_reentrancy_depth"));
    }

    #[test]
    fn test_depth_beyond_token_range_is_rejected() {
        let err = BridgeConfig::builder()
            .max_reentrancy_depth(MAX_REENTRANCY_DEPTH + 1)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("at most"));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_MAX_REENTRANCY_DEPTH, "4294967295")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));

        let config = BridgeConfig::builder()
            .max_reentrancy_depth(MAX_REENTRANCY_DEPTH)
            .build()
            .unwrap();
        assert_eq!(config.max_reentrancy_depth, MAX_REENTRANCY_DEPTH);
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (ENV_MAX_REENTRANCY_DEPTH, "8"),
            (ENV_LOCK_WAIT_WARN_MS, "250"),
            (ENV_PRINT_PYTHON_ERRORS, "off"),
            (ENV_INITIALIZE_PYTHON, "YES"),
        ]))
        .unwrap();

        assert_eq!(config.max_reentrancy_depth, 8);
        assert_eq!(config.lock_wait_warn, Duration::from_millis(250));
        assert!(!config.print_python_errors);
        assert!(config.initialize_python);
    }

    #[test]
    fn test_empty_env_gives_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_bad_env_values() {
        let err = BridgeConfig::from_lookup(lookup(&[(ENV_MAX_REENTRANCY_DEPTH, "many")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_PRINT_PYTHON_ERRORS, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PRINT_PYTHON_ERRORS));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_MAX_REENTRANCY_DEPTH, "0")]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }
}
