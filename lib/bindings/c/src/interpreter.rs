// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! An [`Interpreter`] implemented by the host through a table of C function
//! pointers.

use std::ffi::c_void;
use std::ptr;

use interop_bridge::dlpack::DLTensor;
use interop_bridge::{
    BridgeConfig, BridgeError, BridgeResult, CallArg, CallFrame, DepthTracker, Direction,
    ForeignHandle, GilGuard, GilState, GilToken, Interpreter, InterpreterError,
};

/// Direction of a callback invocation as seen by the host.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropDirection {
    Forward = 0,
    Backward = 1,
}

impl From<Direction> for InteropDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => InteropDirection::Forward,
            Direction::Backward => InteropDirection::Backward,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropArgKind {
    Tensor = 0,
    Object = 1,
}

/// One positional argument handed to the host's `invoke`. Exactly one of
/// `tensor` and `object` is set, according to `kind`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InteropArg {
    pub kind: InteropArgKind,
    pub tensor: *const DLTensor,
    pub object: *mut c_void,
}

impl InteropArg {
    fn from_call_arg(arg: &CallArg<'_>) -> Self {
        match arg {
            CallArg::Tensor(tensor) => Self {
                kind: InteropArgKind::Tensor,
                tensor: tensor.as_raw() as *const DLTensor,
                object: ptr::null_mut(),
            },
            CallArg::Object(handle) => Self {
                kind: InteropArgKind::Object,
                tensor: ptr::null(),
                object: handle.as_ptr(),
            },
        }
    }
}

/// Collects the values produced by one host `invoke`. Opaque to C; filled
/// through `interop_output_push`.
#[derive(Debug, Default)]
pub struct InteropOutputSink {
    handles: Vec<ForeignHandle>,
}

impl InteropOutputSink {
    pub(crate) fn push(&mut self, handle: ForeignHandle) {
        self.handles.push(handle);
    }
}

pub type IsInitializedFn = unsafe extern "C" fn(user_data: *mut c_void) -> bool;
pub type AcquireLockFn = unsafe extern "C" fn(user_data: *mut c_void, out_state: *mut i32) -> i32;
pub type ReleaseLockFn = unsafe extern "C" fn(user_data: *mut c_void, state: i32) -> i32;
pub type InvokeFn = unsafe extern "C" fn(
    user_data: *mut c_void,
    direction: InteropDirection,
    callback: *mut c_void,
    args: *const InteropArg,
    num_args: usize,
    requires_grads: *const bool,
    num_requires_grads: usize,
    sink: *mut InteropOutputSink,
) -> i32;
pub type ReleaseObjectFn = unsafe extern "C" fn(user_data: *mut c_void, object: *mut c_void);

/// Host interpreter entry points.
///
/// Functions returning `i32` return 0 on success. `acquire_lock` blocks until
/// the calling thread holds the host's execution lock and writes the state the
/// thread saw before acquiring: 0 when it did not hold the lock, 1 when it
/// already did. `release_lock` receives that same value back. `invoke` pushes
/// each produced value, as a new reference, into `sink`. `release_object` may
/// be called without the lock held. `is_initialized` may be null, in which
/// case the interpreter is assumed to be up.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InteropInterpreterVTable {
    pub user_data: *mut c_void,
    pub is_initialized: Option<IsInitializedFn>,
    pub acquire_lock: Option<AcquireLockFn>,
    pub release_lock: Option<ReleaseLockFn>,
    pub invoke: Option<InvokeFn>,
    pub release_object: Option<ReleaseObjectFn>,
}

pub struct VTableInterpreter {
    user_data: *mut c_void,
    is_initialized: Option<IsInitializedFn>,
    acquire_lock: AcquireLockFn,
    release_lock: ReleaseLockFn,
    invoke: InvokeFn,
    release_object: ReleaseObjectFn,
    depths: DepthTracker,
}

// SAFETY: the host guarantees its entry points and `user_data` may be used
// from any thread; exclusion is provided by the host's own lock.
unsafe impl Send for VTableInterpreter {}
unsafe impl Sync for VTableInterpreter {}

fn missing(entry: &str) -> BridgeError {
    BridgeError::Config {
        reason: format!("interpreter vtable has no {entry} entry"),
    }
}

impl VTableInterpreter {
    pub fn new(vtable: InteropInterpreterVTable, config: &BridgeConfig) -> BridgeResult<Self> {
        Ok(Self {
            user_data: vtable.user_data,
            is_initialized: vtable.is_initialized,
            acquire_lock: vtable.acquire_lock.ok_or_else(|| missing("acquire_lock"))?,
            release_lock: vtable.release_lock.ok_or_else(|| missing("release_lock"))?,
            invoke: vtable.invoke.ok_or_else(|| missing("invoke"))?,
            release_object: vtable
                .release_object
                .ok_or_else(|| missing("release_object"))?,
            depths: DepthTracker::new(config.max_reentrancy_depth),
        })
    }
}

impl Interpreter for VTableInterpreter {
    fn name(&self) -> &str {
        "host"
    }

    fn is_initialized(&self) -> bool {
        match self.is_initialized {
            // SAFETY: host entry point, see `InteropInterpreterVTable`.
            Some(is_initialized) => unsafe { is_initialized(self.user_data) },
            None => true,
        }
    }

    fn acquire_lock(&self) -> BridgeResult<GilToken> {
        let depth = self.depths.enter()?;
        let mut state = -1;
        // SAFETY: host entry point; `state` is valid for writes.
        let status = unsafe { (self.acquire_lock)(self.user_data, &mut state) };
        if status != 0 {
            self.depths.abandon(depth);
            return Err(BridgeError::LockUnavailable {
                reason: format!("host acquire_lock returned {status}"),
            });
        }
        let prior = match state {
            0 => GilState::Unlocked,
            1 => GilState::Locked,
            other => {
                // SAFETY: hand the acquisition straight back to the host.
                unsafe { (self.release_lock)(self.user_data, other) };
                self.depths.abandon(depth);
                return Err(BridgeError::LockMisuse {
                    reason: format!("host acquire_lock reported unknown state {other}"),
                });
            }
        };
        Ok(GilToken::new(prior, depth))
    }

    fn release_lock(&self, token: GilToken) -> BridgeResult<()> {
        // the host still holds the lock if its release fails
        self.depths.check(token.depth())?;
        // SAFETY: host entry point.
        let status = unsafe { (self.release_lock)(self.user_data, token.prior() as i32) };
        if status != 0 {
            return Err(BridgeError::LockUnavailable {
                reason: format!("host release_lock returned {status}"),
            });
        }
        self.depths.exit(token.depth())
    }

    fn invoke(
        &self,
        _guard: &GilGuard<'_>,
        direction: Direction,
        callback: ForeignHandle,
        frame: &CallFrame<'_>,
    ) -> Result<Vec<ForeignHandle>, InterpreterError> {
        let args: Vec<InteropArg> = frame.args().iter().map(InteropArg::from_call_arg).collect();
        let requires_grads = frame.requires_grads();
        let mut sink = InteropOutputSink::default();

        // SAFETY: host entry point; `args`, `requires_grads` and `sink`
        // outlive the call.
        let status = unsafe {
            (self.invoke)(
                self.user_data,
                direction.into(),
                callback.as_ptr(),
                args.as_ptr(),
                args.len(),
                requires_grads.as_ptr(),
                requires_grads.len(),
                &mut sink,
            )
        };

        if status != 0 {
            for handle in sink.handles.drain(..) {
                self.release_object(handle);
            }
            return Err(InterpreterError::new(format!(
                "host invoke returned {status}"
            )));
        }
        Ok(sink.handles)
    }

    fn release_object(&self, handle: ForeignHandle) {
        // SAFETY: host entry point.
        unsafe { (self.release_object)(self.user_data, handle.as_ptr()) }
    }
}
