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

use std::sync::Arc;

use interop_bridge::{BridgeConfig, BridgeError, Direction, ForeignHandle, TensorRef, lifecycle};
use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;

mod dlpack;
mod interpreter;
mod pool;
mod tensor;

pub use interpreter::PythonInterpreter;
pub use tensor::TensorView;

/// A Python module implemented in Rust. The name of this function must match
/// the `lib.name` setting in the `Cargo.toml`, else Python will not be able to
/// import the module.
#[pymodule]
fn _interop_bridge(m: &Bound<'_, PyModule>) -> PyResult<()> {
    interop_logging::init();

    m.add_class::<TensorView>()?;
    m.add_function(wrap_pyfunction!(register_forward_runner, m)?)?;
    m.add_function(wrap_pyfunction!(register_backward_runner, m)?)?;
    m.add_function(wrap_pyfunction!(register_function, m)?)?;
    m.add_function(wrap_pyfunction!(unregister_function, m)?)?;
    m.add_function(wrap_pyfunction!(get_function, m)?)?;
    m.add_function(wrap_pyfunction!(function_names, m)?)?;
    m.add_function(wrap_pyfunction!(clear_pool, m)?)?;
    m.add_function(wrap_pyfunction!(install, m)?)?;
    m.add_function(wrap_pyfunction!(shutdown, m)?)?;
    m.add_function(wrap_pyfunction!(is_installed, m)?)?;
    m.add_function(wrap_pyfunction!(initialized, m)?)?;
    m.add_function(wrap_pyfunction!(call, m)?)?;
    m.add_function(wrap_pyfunction!(exported_tensors, m)?)?;

    Ok(())
}

pub fn to_pyerr(err: BridgeError) -> PyErr {
    match err {
        BridgeError::Config { .. }
        | BridgeError::ArgumentLayout { .. }
        | BridgeError::InvalidHandle { .. } => PyValueError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

fn ensure_callable(py: Python<'_>, what: &str, object: &PyObject) -> PyResult<()> {
    if object.bind(py).is_callable() {
        Ok(())
    } else {
        Err(PyTypeError::new_err(format!("{what} must be callable")))
    }
}

/// Wrap every forward call as `runner(callback, requires_grads, *args)`.
#[pyfunction]
fn register_forward_runner(py: Python<'_>, runner: PyObject) -> PyResult<()> {
    ensure_callable(py, "forward runner", &runner)?;
    let previous = pool::global().write().set_runner(Direction::Forward, runner);
    drop(previous);
    tracing::debug!("forward runner registered");
    Ok(())
}

/// Wrap every backward call as `runner(callback, requires_grads, *args)`.
#[pyfunction]
fn register_backward_runner(py: Python<'_>, runner: PyObject) -> PyResult<()> {
    ensure_callable(py, "backward runner", &runner)?;
    let previous = pool::global().write().set_runner(Direction::Backward, runner);
    drop(previous);
    tracing::debug!("backward runner registered");
    Ok(())
}

#[pyfunction]
fn register_function(name: String, function: PyObject) -> PyResult<()> {
    tracing::debug!(%name, "autograd function registered");
    let replaced = pool::global().write().register_function(name, function);
    if replaced.is_some() {
        tracing::debug!("replaced an earlier registration");
    }
    Ok(())
}

/// Returns whether `name` was registered.
#[pyfunction]
fn unregister_function(name: &str) -> bool {
    let removed = pool::global().write().unregister_function(name);
    removed.is_some()
}

#[pyfunction]
fn get_function(py: Python<'_>, name: &str) -> Option<PyObject> {
    pool::global().read().function(py, name)
}

#[pyfunction]
fn function_names() -> Vec<String> {
    pool::global().read().function_names()
}

#[pyfunction]
fn clear_pool() {
    let dropped = pool::global().write().clear();
    tracing::debug!(count = dropped.len(), "function pool cleared");
}

/// Install the process-wide bridge over the running interpreter.
#[pyfunction]
#[pyo3(signature = (max_reentrancy_depth=None, print_python_errors=None))]
fn install(max_reentrancy_depth: Option<u32>, print_python_errors: Option<bool>) -> PyResult<()> {
    let base = BridgeConfig::from_env().map_err(to_pyerr)?;
    let config = BridgeConfig::builder()
        .max_reentrancy_depth(max_reentrancy_depth.unwrap_or(base.max_reentrancy_depth))
        .lock_wait_warn(base.lock_wait_warn)
        .print_python_errors(print_python_errors.unwrap_or(base.print_python_errors))
        // already running inside Python
        .initialize_python(false)
        .build()
        .map_err(|err| to_pyerr(err.into()))?;

    let interpreter = PythonInterpreter::new(&config);
    lifecycle::initialize(Arc::new(interpreter), config).map_err(to_pyerr)?;
    Ok(())
}

/// Uninstall the bridge; returns how many calls it served.
#[pyfunction]
fn shutdown() -> PyResult<u64> {
    let bridge = lifecycle::shutdown().map_err(to_pyerr)?;
    Ok(bridge.calls())
}

#[pyfunction]
fn is_installed() -> bool {
    lifecycle::is_installed()
}

#[pyfunction]
fn initialized() -> bool {
    lifecycle::current()
        .map(|bridge| bridge.initialized())
        .unwrap_or(false)
}

/// Run `callback` through the installed bridge the way the engine does.
/// `TensorView` arguments cross as DLPack capsules, everything else as the
/// object itself. `requires_grads` has one flag per tensor and defaults to
/// all false. Returns the produced values.
#[pyfunction]
#[pyo3(signature = (callback, args, backward=false, requires_grads=None))]
fn call(
    py: Python<'_>,
    callback: PyObject,
    args: Vec<Bound<'_, PyAny>>,
    backward: bool,
    requires_grads: Option<Vec<bool>>,
) -> PyResult<Vec<PyObject>> {
    let bridge = lifecycle::current().map_err(to_pyerr)?;
    let callback = ForeignHandle::callback(callback.as_ptr().cast()).map_err(to_pyerr)?;

    let mut descriptors = Vec::new();
    let mut tensor_indices = Vec::new();
    let mut objects = Vec::new();
    let mut obj_indices = Vec::new();
    for (index, arg) in args.iter().enumerate() {
        match arg.downcast::<TensorView>() {
            Ok(view) => {
                descriptors.push(view.get().descriptor());
                tensor_indices.push(index as i64);
            }
            Err(_) => {
                objects.push(ForeignHandle::object(arg.as_ptr().cast()).map_err(to_pyerr)?);
                obj_indices.push(index as i64);
            }
        }
    }
    // SAFETY: each descriptor points into a TensorView that `args` keeps alive.
    let tensors: Vec<TensorRef<'_>> = descriptors
        .iter()
        .map(|raw| unsafe { TensorRef::new(raw) })
        .collect();
    let requires_grads = requires_grads.unwrap_or_else(|| vec![false; tensors.len()]);

    let mut outputs = Vec::new();
    let result = if backward {
        bridge.backward(
            Some(callback),
            &requires_grads,
            &tensors,
            &tensor_indices,
            &objects,
            &obj_indices,
            &mut outputs,
        )
    } else {
        bridge.forward(
            Some(callback),
            &requires_grads,
            &tensors,
            &tensor_indices,
            &objects,
            &obj_indices,
            &mut outputs,
        )
    };
    result.map_err(to_pyerr)?;

    Ok(outputs
        .into_iter()
        // SAFETY: each output is a strong reference produced by the callback.
        .map(|owned| unsafe { PyObject::from_owned_ptr(py, owned.into_raw().cast()) })
        .collect())
}

/// Tensors exported as DLPack capsules whose deleter has not run yet.
#[pyfunction]
fn exported_tensors() -> usize {
    dlpack::live_exports()
}
