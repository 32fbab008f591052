// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Environment driven switches for the logging module.

/// Filter directive variable checked first, before `RUST_LOG`.
pub const INTEROP_LOG: &str = "INTEROP_LOG";

/// Filter used when neither [`INTEROP_LOG`] nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check if a string is truthy
/// This is used to evaluate environment variables and any other user supplied
/// switches that should be read as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey, the mirror of [`is_truthy`]
pub fn is_falsey(val: &str) -> bool {
    matches!(val.trim().to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

/// Check whether JSONL logging enabled
/// Set the `INTEROP_LOGGING_JSONL` environment variable to a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy("INTEROP_LOGGING_JSONL")
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
/// Set the `INTEROP_DISABLE_ANSI_LOGGING` environment variable to a [`is_truthy`] value
pub fn disable_ansi_logging() -> bool {
    env_is_truthy("INTEROP_DISABLE_ANSI_LOGGING")
}

/// Filter directives for the subscriber.
///
/// `INTEROP_LOG` wins over `RUST_LOG`; an empty value counts as unset.
pub fn filter_directives() -> String {
    [INTEROP_LOG, "RUST_LOG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|val| !val.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("True"));
        assert!(is_truthy("on"));
        assert!(is_truthy("ON"));
        assert!(is_truthy("yes"));
        assert!(is_truthy(" yes "));

        assert!(!is_truthy("0"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy("no"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("enabled"));
    }

    #[test]
    fn test_is_falsey() {
        assert!(is_falsey("0"));
        assert!(is_falsey("FALSE"));
        assert!(is_falsey("Off"));
        assert!(is_falsey("no"));

        assert!(!is_falsey("1"));
        assert!(!is_falsey(""));
    }

    #[test]
    fn test_unset_variable_is_not_truthy() {
        assert!(!env_is_truthy("INTEROP_LOGGING_TEST_SURELY_UNSET_VARIABLE"));
    }
}
