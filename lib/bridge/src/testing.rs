// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles: an in-process interpreter and host-memory tensors.
//!
//! [`MockInterpreter`] runs callbacks written as Rust closures under a real
//! [`ExecutionLock`] and records every lock event, invocation and release so
//! tests can check pairing without a live foreign runtime.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

use crate::args::{CallArg, CallFrame};
use crate::config::BridgeConfig;
use crate::dlpack::{DLTensor, DataType, Device, TensorRef};
use crate::error::BridgeResult;
use crate::handle::{ForeignHandle, HandleKind};
use crate::interpreter::{Direction, GilGuard, Interpreter, InterpreterError};
use crate::lock::{ExecutionLock, GilToken};

/// Callback body run by [`MockInterpreter::invoke`].
pub type MockCallbackFn = dyn Fn(&MockInterpreter, Direction, &CallFrame<'_>) -> Result<Vec<ForeignHandle>, InterpreterError>
    + Send
    + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired { thread: ThreadId, depth: u32 },
    Released { thread: ThreadId, depth: u32 },
}

/// What a callback saw in one argument position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgRecord {
    Tensor { data: usize, shape: Vec<i64> },
    Object(ForeignHandle),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub direction: Direction,
    pub callback: ForeignHandle,
    pub args: Vec<ArgRecord>,
    pub requires_grads: Vec<bool>,
    /// Acquisitions held by the invoking thread while the callback ran.
    pub lock_depth: u32,
}

pub struct MockInterpreter {
    name: String,
    initialized: AtomicBool,
    lock: ExecutionLock,
    next_addr: AtomicUsize,
    callbacks: RwLock<HashMap<ForeignHandle, Arc<MockCallbackFn>>>,
    lock_events: Mutex<Vec<LockEvent>>,
    invocations: Mutex<Vec<Invocation>>,
    live: Mutex<HashSet<ForeignHandle>>,
    released: Mutex<Vec<ForeignHandle>>,
    inside: Mutex<HashMap<ThreadId, u32>>,
    max_threads_inside: AtomicUsize,
}

impl MockInterpreter {
    pub fn new() -> Self {
        Self::with_config(&BridgeConfig::default())
    }

    pub fn with_config(config: &BridgeConfig) -> Self {
        Self {
            name: "mock".to_string(),
            initialized: AtomicBool::new(true),
            lock: ExecutionLock::from_config(config),
            next_addr: AtomicUsize::new(0x1000),
            callbacks: RwLock::new(HashMap::new()),
            lock_events: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
            released: Mutex::new(Vec::new()),
            inside: Mutex::new(HashMap::new()),
            max_threads_inside: AtomicUsize::new(0),
        }
    }

    /// An interpreter that failed to come up.
    pub fn uninitialized() -> Self {
        let mock = Self::new();
        mock.set_initialized(false);
        mock
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    fn mint(&self, kind: HandleKind) -> ForeignHandle {
        let addr = self.next_addr.fetch_add(0x10, Ordering::Relaxed);
        ForeignHandle::new(NonZeroUsize::new(addr).unwrap_or(NonZeroUsize::MIN), kind)
    }

    /// Create a fresh interpreter object, as a callback producing a value would.
    pub fn new_object(&self) -> ForeignHandle {
        let handle = self.mint(HandleKind::Object);
        self.live.lock().insert(handle);
        handle
    }

    pub fn register_callback<F>(&self, callback: F) -> ForeignHandle
    where
        F: Fn(&MockInterpreter, Direction, &CallFrame<'_>) -> Result<Vec<ForeignHandle>, InterpreterError>
            + Send
            + Sync
            + 'static,
    {
        let handle = self.mint(HandleKind::Callback);
        self.callbacks.write().insert(handle, Arc::new(callback));
        handle
    }

    /// Produces one new object per argument.
    pub fn register_echo(&self) -> ForeignHandle {
        self.register_callback(|mock, _, frame| {
            Ok(frame.args().iter().map(|_| mock.new_object()).collect())
        })
    }

    /// Produces `count` objects, then raises.
    pub fn register_failing(&self, count: usize, message: &str) -> ForeignHandle {
        let message = message.to_string();
        self.register_callback(move |mock, _, _| {
            for _ in 0..count {
                let handle = mock.new_object();
                mock.release_object(handle);
            }
            Err(InterpreterError::new(message.clone()).with_traceback("Traceback: mock"))
        })
    }

    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.lock_events.lock().clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.lock_events
            .lock()
            .iter()
            .filter(|event| matches!(event, LockEvent::Acquired { .. }))
            .count()
    }

    pub fn releases(&self) -> usize {
        self.lock_events
            .lock()
            .iter()
            .filter(|event| matches!(event, LockEvent::Released { .. }))
            .count()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn released(&self) -> Vec<ForeignHandle> {
        self.released.lock().clone()
    }

    /// Objects created and not yet released.
    pub fn live_objects(&self) -> usize {
        self.live.lock().len()
    }

    /// Most distinct threads ever seen inside callbacks at the same time.
    pub fn max_threads_inside(&self) -> usize {
        self.max_threads_inside.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn held_depth(&self) -> u32 {
        self.lock.held_depth()
    }

    fn enter_callback(&self) {
        let mut inside = self.inside.lock();
        *inside.entry(thread::current().id()).or_insert(0) += 1;
        self.max_threads_inside
            .fetch_max(inside.len(), Ordering::SeqCst);
    }

    fn leave_callback(&self) {
        let me = thread::current().id();
        let mut inside = self.inside.lock();
        if let Some(count) = inside.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                inside.remove(&me);
            }
        }
    }
}

impl Default for MockInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter for MockInterpreter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn acquire_lock(&self) -> BridgeResult<GilToken> {
        let token = self.lock.acquire()?;
        self.lock_events.lock().push(LockEvent::Acquired {
            thread: thread::current().id(),
            depth: token.depth(),
        });
        Ok(token)
    }

    fn release_lock(&self, token: GilToken) -> BridgeResult<()> {
        let depth = token.depth();
        self.lock.release(token)?;
        self.lock_events.lock().push(LockEvent::Released {
            thread: thread::current().id(),
            depth,
        });
        Ok(())
    }

    fn invoke(
        &self,
        _guard: &GilGuard<'_>,
        direction: Direction,
        callback: ForeignHandle,
        frame: &CallFrame<'_>,
    ) -> Result<Vec<ForeignHandle>, InterpreterError> {
        let body = self
            .callbacks
            .read()
            .get(&callback)
            .cloned()
            .ok_or_else(|| InterpreterError::new(format!("unknown callback {callback:?}")))?;

        let args = frame
            .args()
            .iter()
            .map(|arg| match arg {
                CallArg::Tensor(tensor) => ArgRecord::Tensor {
                    data: tensor.data_ptr() as usize,
                    shape: tensor.shape().to_vec(),
                },
                CallArg::Object(handle) => ArgRecord::Object(*handle),
            })
            .collect();
        self.invocations.lock().push(Invocation {
            direction,
            callback,
            args,
            requires_grads: frame.requires_grads().to_vec(),
            lock_depth: self.lock.held_depth(),
        });

        self.enter_callback();
        let result = body(self, direction, frame);
        self.leave_callback();
        result
    }

    fn release_object(&self, handle: ForeignHandle) {
        self.live.lock().remove(&handle);
        self.released.lock().push(handle);
    }
}

/// A tensor living in host memory, described the way an engine would.
pub struct HostTensor {
    data: Vec<f32>,
    shape: Vec<i64>,
    raw: DLTensor,
}

impl HostTensor {
    pub fn new(mut data: Vec<f32>, shape: &[i64]) -> Self {
        let mut shape = shape.to_vec();
        let raw = DLTensor {
            data: data.as_mut_ptr().cast::<c_void>(),
            device: Device::CPU,
            ndim: shape.len() as i32,
            dtype: DataType::F32,
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        };
        Self { data, shape, raw }
    }

    pub fn zeros(shape: &[i64]) -> Self {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        Self::new(vec![0.0; numel], shape)
    }

    pub fn view(&self) -> TensorRef<'_> {
        // SAFETY: `raw` points into `data` and `shape`, whose heap buffers
        // live as long as `self` and are never reallocated.
        unsafe { TensorRef::new(&self.raw) }
    }

    pub fn data_ptr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn as_raw(&self) -> &DLTensor {
        &self.raw
    }
}
