// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CPython behind the bridge's [`Interpreter`] seam.
//!
//! The execution lock is the GIL, taken with `PyGILState_Ensure` so that
//! threads CPython has never seen can call in. Tensors cross as DLPack
//! capsules; every other argument is an object the engine already holds.

use interop_bridge::{
    BridgeConfig, BridgeError, BridgeResult, CallArg, CallFrame, DepthTracker, Direction,
    ForeignHandle, GilGuard, GilState, GilToken, HandleKind, Interpreter, InterpreterError,
};
use pyo3::exceptions::{PyRuntimeError, PyTypeError};
use pyo3::ffi::PyGILState_STATE;
use pyo3::prelude::*;
use pyo3::types::{PyTracebackMethods, PyTuple};

use crate::{dlpack, pool};

pub struct PythonInterpreter {
    print_errors: bool,
    depths: DepthTracker,
}

impl PythonInterpreter {
    pub fn new(config: &BridgeConfig) -> Self {
        if config.initialize_python {
            pyo3::prepare_freethreaded_python();
        }
        let interpreter = Self {
            print_errors: config.print_python_errors,
            depths: DepthTracker::new(config.max_reentrancy_depth),
        };
        if !interpreter.is_initialized() {
            tracing::warn!("CPython is not initialized; bridged calls will fail");
        }
        interpreter
    }

    fn call<'py>(
        &self,
        py: Python<'py>,
        direction: Direction,
        callback: ForeignHandle,
        frame: &CallFrame<'_>,
    ) -> PyResult<Vec<ForeignHandle>> {
        // SAFETY: the engine keeps the callback and object arguments alive
        // for the duration of the call.
        let callback = unsafe { Bound::from_borrowed_ptr(py, callback.as_ptr().cast()) };
        let args = frame
            .args()
            .iter()
            .map(|arg| match arg {
                CallArg::Tensor(tensor) => dlpack::to_capsule(py, tensor),
                CallArg::Object(handle) => {
                    // SAFETY: see above.
                    Ok(unsafe { Bound::from_borrowed_ptr(py, handle.as_ptr().cast()) })
                }
            })
            .collect::<PyResult<Vec<_>>>()?;

        let runner = pool::global().read().runner(py, direction);
        let result = match runner {
            Some(runner) => {
                let requires_grads = PyTuple::new(py, frame.requires_grads())?;
                let mut full = Vec::with_capacity(args.len() + 2);
                full.push(callback);
                full.push(requires_grads.into_any());
                full.extend(args);
                runner.bind(py).call1(PyTuple::new(py, full)?)?
            }
            None => {
                let method = match direction {
                    Direction::Forward => "apply",
                    Direction::Backward => "backward",
                };
                callback.call_method1(method, PyTuple::new(py, args)?)?
            }
        };

        let outputs = result.downcast_into::<PyTuple>().map_err(|err| {
            PyTypeError::new_err(format!(
                "{direction} callback must return a tuple, got {}",
                err.into_inner().get_type()
            ))
        })?;
        outputs
            .iter()
            .map(|output| {
                ForeignHandle::from_raw(output.into_ptr().cast(), HandleKind::Object)
                    .ok_or_else(|| PyRuntimeError::new_err("callback produced a null object"))
            })
            .collect()
    }

    fn to_interpreter_error(&self, py: Python<'_>, err: PyErr) -> InterpreterError {
        let traceback = err.traceback(py).and_then(|tb| tb.format().ok());
        if self.print_errors {
            err.print(py);
        }
        let error = InterpreterError::new(err.to_string());
        match traceback {
            Some(traceback) => error.with_traceback(traceback),
            None => error,
        }
    }
}

impl Interpreter for PythonInterpreter {
    fn name(&self) -> &str {
        "python"
    }

    fn is_initialized(&self) -> bool {
        // SAFETY: safe to call at any time, with or without the GIL.
        unsafe { pyo3::ffi::Py_IsInitialized() != 0 }
    }

    fn acquire_lock(&self) -> BridgeResult<GilToken> {
        if !self.is_initialized() {
            return Err(BridgeError::NotInitialized {
                interpreter: self.name().to_string(),
            });
        }
        let depth = self.depths.enter()?;
        // SAFETY: CPython is initialized; Ensure may be called from any thread.
        let state = unsafe { pyo3::ffi::PyGILState_Ensure() };
        let prior = match state {
            PyGILState_STATE::PyGILState_LOCKED => GilState::Locked,
            PyGILState_STATE::PyGILState_UNLOCKED => GilState::Unlocked,
        };
        Ok(GilToken::new(prior, depth))
    }

    fn release_lock(&self, token: GilToken) -> BridgeResult<()> {
        self.depths.check(token.depth())?;
        let state = match token.prior() {
            GilState::Locked => PyGILState_STATE::PyGILState_LOCKED,
            GilState::Unlocked => PyGILState_STATE::PyGILState_UNLOCKED,
        };
        // SAFETY: pairs with the Ensure that produced `token`; the depth
        // tracker enforces reverse order on this thread.
        unsafe { pyo3::ffi::PyGILState_Release(state) };
        self.depths.exit(token.depth())
    }

    fn invoke(
        &self,
        _guard: &GilGuard<'_>,
        direction: Direction,
        callback: ForeignHandle,
        frame: &CallFrame<'_>,
    ) -> Result<Vec<ForeignHandle>, InterpreterError> {
        Python::with_gil(|py| {
            self.call(py, direction, callback, frame)
                .map_err(|err| self.to_interpreter_error(py, err))
        })
    }

    fn release_object(&self, handle: ForeignHandle) {
        if !self.is_initialized() {
            tracing::warn!(?handle, "CPython is gone; leaking object");
            return;
        }
        // SAFETY: `handle` is a strong reference produced by `invoke`.
        Python::with_gil(|_py| unsafe { pyo3::ffi::Py_DecRef(handle.as_ptr().cast()) });
    }
}
