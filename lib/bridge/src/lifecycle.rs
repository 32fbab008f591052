// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide bridge with an explicit initialize/shutdown lifecycle.
//!
//! Code that can take a [`Bridge`] by reference should; this slot exists for
//! entry points that cannot, such as the C ABI.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::interpreter::Interpreter;

static BRIDGE: Lazy<RwLock<Option<Arc<Bridge>>>> = Lazy::new(|| RwLock::new(None));

/// Build a bridge around `interpreter` and install it process-wide.
///
/// Succeeds even when the interpreter failed to come up; callers check
/// [`Bridge::initialized`] before every call.
pub fn initialize(
    interpreter: Arc<dyn Interpreter>,
    config: BridgeConfig,
) -> BridgeResult<Arc<Bridge>> {
    let bridge = Arc::new(Bridge::new(interpreter, config));
    install(bridge.clone())?;
    Ok(bridge)
}

/// Install an already constructed bridge.
pub fn install(bridge: Arc<Bridge>) -> BridgeResult<()> {
    let mut slot = BRIDGE.write();
    if slot.is_some() {
        return Err(BridgeError::AlreadyInstalled);
    }
    tracing::info!(
        interpreter = bridge.interpreter().name(),
        initialized = bridge.initialized(),
        "interop bridge installed"
    );
    *slot = Some(bridge);
    Ok(())
}

/// The installed bridge.
pub fn current() -> BridgeResult<Arc<Bridge>> {
    BRIDGE.read().clone().ok_or(BridgeError::NotInstalled)
}

pub fn is_installed() -> bool {
    BRIDGE.read().is_some()
}

/// Uninstall the bridge and hand it back. In-flight calls keep their own
/// reference and finish normally.
pub fn shutdown() -> BridgeResult<Arc<Bridge>> {
    let bridge = BRIDGE.write().take().ok_or(BridgeError::NotInstalled)?;
    tracing::info!(
        interpreter = bridge.interpreter().name(),
        calls = bridge.calls(),
        "interop bridge shut down"
    );
    Ok(bridge)
}
