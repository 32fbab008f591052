// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
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

//! Interop bridge between a native inference engine and an embedded
//! interpreter that runs custom-operator code.
//!
//! A custom operator's forward and backward passes are executed by calling a
//! user callback inside the interpreter. The [`Bridge`] takes the interpreter's
//! global execution lock, places tensor and object arguments in the order the
//! callback expects, invokes it, and hands the produced values back as
//! [`OwnedHandle`]s.
//!
//! The interpreter itself sits behind the [`Interpreter`] trait. The Python
//! binding crate provides the CPython implementation; the `testing` feature
//! provides an in-process mock.

pub mod args;
pub mod bridge;
pub mod config;
pub mod dlpack;
pub mod error;
pub mod handle;
pub mod interpreter;
pub mod lifecycle;
pub mod lock;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use args::{CallArg, CallFrame};
pub use bridge::Bridge;
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use dlpack::TensorRef;
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use handle::{ForeignHandle, HandleKind, OwnedHandle, ReleaseHook};
pub use interpreter::{Direction, GilGuard, Interpreter, InterpreterError};
pub use lock::{DepthTracker, ExecutionLock, GilState, GilToken, MAX_REENTRANCY_DEPTH};
