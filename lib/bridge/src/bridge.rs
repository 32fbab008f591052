// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Forward and backward entry points of a custom operator.
//!
//! Each call checks its preconditions, reassembles the argument list, takes
//! the interpreter's execution lock, runs the callback and hands the produced
//! values to the caller. The lock is released on every path out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::args::CallFrame;
use crate::config::BridgeConfig;
use crate::dlpack::TensorRef;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{ForeignHandle, OwnedHandle, ReleaseHook};
use crate::interpreter::{Direction, GilGuard, Interpreter};
use crate::lock::GilToken;

/// Routes produced handles back to the interpreter that created them.
struct InterpreterRelease(Arc<dyn Interpreter>);

impl ReleaseHook for InterpreterRelease {
    fn release(&self, handle: ForeignHandle) {
        self.0.release_object(handle);
    }
}

pub struct Bridge {
    interpreter: Arc<dyn Interpreter>,
    release: Arc<dyn ReleaseHook>,
    config: BridgeConfig,
    calls: AtomicU64,
}

impl Bridge {
    pub fn new(interpreter: Arc<dyn Interpreter>, config: BridgeConfig) -> Self {
        let release: Arc<dyn ReleaseHook> = Arc::new(InterpreterRelease(interpreter.clone()));
        tracing::info!(
            interpreter = interpreter.name(),
            initialized = interpreter.is_initialized(),
            "interop bridge created"
        );
        Self {
            interpreter,
            release,
            config,
            calls: AtomicU64::new(0),
        }
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.interpreter
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Whether the embedded interpreter came up. Callers check this before
    /// [`Bridge::forward`] / [`Bridge::backward`].
    pub fn initialized(&self) -> bool {
        self.interpreter.is_initialized()
    }

    /// Number of forward/backward calls dispatched so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Acquire the execution lock. Pair with exactly one [`Bridge::put_gil`].
    pub fn get_gil(&self) -> BridgeResult<GilToken> {
        self.ensure_initialized()?;
        self.interpreter.acquire_lock()
    }

    pub fn put_gil(&self, token: GilToken) -> BridgeResult<()> {
        self.interpreter.release_lock(token)
    }

    /// Take ownership of a handle previously produced by this bridge and
    /// handed out raw.
    pub fn adopt(&self, handle: ForeignHandle) -> OwnedHandle {
        OwnedHandle::new(handle, self.release.clone())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        callback: Option<ForeignHandle>,
        requires_grads: &[bool],
        tensor_args: &[TensorRef<'_>],
        tensor_indices: &[i64],
        obj_args: &[ForeignHandle],
        obj_indices: &[i64],
        outputs: &mut Vec<OwnedHandle>,
    ) -> BridgeResult<()> {
        self.dispatch(
            Direction::Forward,
            callback,
            requires_grads,
            tensor_args,
            tensor_indices,
            obj_args,
            obj_indices,
            outputs,
        )
    }

    /// Same contract as [`Bridge::forward`], running the gradient path.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        callback: Option<ForeignHandle>,
        requires_grads: &[bool],
        tensor_args: &[TensorRef<'_>],
        tensor_indices: &[i64],
        obj_args: &[ForeignHandle],
        obj_indices: &[i64],
        outputs: &mut Vec<OwnedHandle>,
    ) -> BridgeResult<()> {
        self.dispatch(
            Direction::Backward,
            callback,
            requires_grads,
            tensor_args,
            tensor_indices,
            obj_args,
            obj_indices,
            outputs,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        direction: Direction,
        callback: Option<ForeignHandle>,
        requires_grads: &[bool],
        tensor_args: &[TensorRef<'_>],
        tensor_indices: &[i64],
        obj_args: &[ForeignHandle],
        obj_indices: &[i64],
        outputs: &mut Vec<OwnedHandle>,
    ) -> BridgeResult<()> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!(
            "interop_call",
            call,
            %direction,
            num_args = tensor_args.len() + obj_args.len()
        );
        let _entered = span.enter();

        let callback = callback.ok_or(BridgeError::NullCallback)?;
        self.ensure_initialized()?;
        let frame = CallFrame::assemble(
            requires_grads,
            tensor_args,
            tensor_indices,
            obj_args,
            obj_indices,
        )?;

        let produced = {
            let guard = GilGuard::acquire(self.interpreter.as_ref())?;
            let result = self
                .interpreter
                .invoke(&guard, direction, callback, &frame)
                .map_err(|err| {
                    tracing::debug!(
                        traceback = err.traceback().unwrap_or_default(),
                        "{direction} callback raised: {err}"
                    );
                    BridgeError::CallbackFailed {
                        direction,
                        message: err.message().to_string(),
                    }
                });
            // adopt before releasing the lock so nothing leaks if release fails
            let produced = result.map(|handles| {
                handles
                    .into_iter()
                    .map(|handle| self.adopt(handle))
                    .collect::<Vec<_>>()
            });
            guard.release()?;
            produced?
        };

        tracing::debug!(outputs = produced.len(), "{direction} callback completed");
        outputs.extend(produced);
        Ok(())
    }

    fn ensure_initialized(&self) -> BridgeResult<()> {
        if self.interpreter.is_initialized() {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized {
                interpreter: self.interpreter.name().to_string(),
            })
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("interpreter", &self.interpreter.name())
            .field("config", &self.config)
            .field("calls", &self.calls())
            .finish()
    }
}
