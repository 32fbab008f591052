// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Python functions registered for the bridge to call.
//!
//! A forward and a backward runner wrap every callback invocation when set.
//! Named functions are autograd functions the engine refers to by name.

use std::collections::HashMap;
use std::sync::Arc;

use interop_bridge::Direction;
use parking_lot::RwLock;
use pyo3::prelude::*;

static FUNCTION_POOL: once_cell::sync::Lazy<Arc<RwLock<FunctionPool>>> =
    once_cell::sync::Lazy::new(|| Arc::new(RwLock::new(FunctionPool::default())));

pub fn global() -> Arc<RwLock<FunctionPool>> {
    FUNCTION_POOL.clone()
}

#[derive(Debug, Default)]
pub struct FunctionPool {
    forward_runner: Option<PyObject>,
    backward_runner: Option<PyObject>,
    functions: HashMap<String, PyObject>,
}

impl FunctionPool {
    /// Replace the runner for `direction`, returning the previous one.
    pub fn set_runner(&mut self, direction: Direction, runner: PyObject) -> Option<PyObject> {
        match direction {
            Direction::Forward => self.forward_runner.replace(runner),
            Direction::Backward => self.backward_runner.replace(runner),
        }
    }

    pub fn runner(&self, py: Python<'_>, direction: Direction) -> Option<PyObject> {
        let runner = match direction {
            Direction::Forward => self.forward_runner.as_ref(),
            Direction::Backward => self.backward_runner.as_ref(),
        };
        runner.map(|runner| runner.clone_ref(py))
    }

    /// Register `function` under `name`, returning what it replaced.
    pub fn register_function(&mut self, name: String, function: PyObject) -> Option<PyObject> {
        self.functions.insert(name, function)
    }

    pub fn unregister_function(&mut self, name: &str) -> Option<PyObject> {
        self.functions.remove(name)
    }

    pub fn function(&self, py: Python<'_>, name: &str) -> Option<PyObject> {
        self.functions.get(name).map(|function| function.clone_ref(py))
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every registration, handing back what was held so the caller can
    /// release it under the GIL.
    pub fn clear(&mut self) -> Vec<PyObject> {
        let mut dropped: Vec<PyObject> = self.functions.drain().map(|(_, f)| f).collect();
        dropped.extend(self.forward_runner.take());
        dropped.extend(self.backward_runner.take());
        dropped
    }
}
