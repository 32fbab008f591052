// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup shared by the interop bridge crates.
//!
//! Everything logs through `tracing`. Binaries and embedding hosts call
//! [`init`] once; library code never installs a subscriber on its own.

pub mod config;

pub use config::{env_is_truthy, is_falsey, is_truthy};

use once_cell::sync::OnceCell;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; only the first call has an effect. If another
/// subscriber was already installed by the host the error is ignored and the
/// host's subscriber stays in charge.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_new(config::filter_directives())
            .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_FILTER));

        let result = if config::jsonl_logging_enabled() {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_target(true)
                .try_init()
        } else {
            fmt()
                .with_env_filter(filter)
                .with_ansi(!config::disable_ansi_logging())
                .with_thread_ids(true)
                .try_init()
        };

        match result {
            Ok(()) => tracing::debug!("tracing initialized"),
            Err(err) => tracing::debug!("tracing subscriber already installed: {err}"),
        }
    });
}
