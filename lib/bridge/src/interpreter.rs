// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam between the bridge and an embedded interpreter runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::CallFrame;
use crate::error::BridgeResult;
use crate::handle::ForeignHandle;
use crate::lock::GilToken;

/// Which computation path of a custom operator is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// An error raised by interpreter-level code during a callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InterpreterError {
    message: String,
    traceback: Option<String>,
}

impl InterpreterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }
}

/// An embedded interpreter the bridge can call into.
pub trait Interpreter: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the runtime was brought up successfully.
    fn is_initialized(&self) -> bool;

    /// Acquire the global execution lock, blocking until it is held.
    fn acquire_lock(&self) -> BridgeResult<GilToken>;

    /// Release one acquisition made by [`Interpreter::acquire_lock`].
    fn release_lock(&self, token: GilToken) -> BridgeResult<()>;

    /// Run `callback` on `frame` and return the produced values as new
    /// references owned by the caller. Holding `guard` proves the lock is held.
    ///
    /// On error the interpreter releases anything it produced itself.
    fn invoke(
        &self,
        guard: &GilGuard<'_>,
        direction: Direction,
        callback: ForeignHandle,
        frame: &CallFrame<'_>,
    ) -> Result<Vec<ForeignHandle>, InterpreterError>;

    /// Drop one reference produced by [`Interpreter::invoke`].
    fn release_object(&self, handle: ForeignHandle);
}

/// Scoped acquisition of an interpreter's execution lock.
///
/// Releases on drop; [`GilGuard::release`] does the same but reports errors.
pub struct GilGuard<'a> {
    interpreter: &'a dyn Interpreter,
    token: Option<GilToken>,
}

impl<'a> GilGuard<'a> {
    pub fn acquire(interpreter: &'a dyn Interpreter) -> BridgeResult<Self> {
        let token = interpreter.acquire_lock()?;
        tracing::debug!(
            interpreter = interpreter.name(),
            depth = token.depth(),
            prior = ?token.prior(),
            "execution lock acquired"
        );
        Ok(Self {
            interpreter,
            token: Some(token),
        })
    }

    pub fn release(mut self) -> BridgeResult<()> {
        match self.token.take() {
            Some(token) => self.release_token(token),
            None => Ok(()),
        }
    }

    fn release_token(&self, token: GilToken) -> BridgeResult<()> {
        let depth = token.depth();
        self.interpreter.release_lock(token)?;
        tracing::debug!(
            interpreter = self.interpreter.name(),
            depth,
            "execution lock released"
        );
        Ok(())
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.release_token(token) {
                tracing::error!(
                    interpreter = self.interpreter.name(),
                    "failed to release execution lock: {err}"
                );
            }
        }
    }
}

impl fmt::Debug for GilGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GilGuard")
            .field("interpreter", &self.interpreter.name())
            .field("token", &self.token)
            .finish()
    }
}
