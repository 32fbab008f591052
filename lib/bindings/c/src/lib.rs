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

use anyhow::Context;
use libc::c_char;
use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use interop_bridge::dlpack::DLTensor;
use interop_bridge::{
    BridgeConfig, BridgeError, BridgeResult, Direction, ForeignHandle, GilToken, HandleKind,
    TensorRef, lifecycle,
};

mod interpreter;

pub use interpreter::{
    InteropArg, InteropArgKind, InteropDirection, InteropInterpreterVTable, InteropOutputSink,
    VTableInterpreter,
};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropStatus {
    Ok = 0,
    NullCallback = 1,
    NotInitialized = 2,
    NotInstalled = 3,
    AlreadyInstalled = 4,
    InvalidConfig = 5,
    InvalidArgument = 6,
    CallbackFailed = 7,
    LockUnavailable = 8,
    LockMisuse = 9,
    BufferTooSmall = 10,
}

impl From<&BridgeError> for InteropStatus {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::NullCallback => InteropStatus::NullCallback,
            BridgeError::NotInitialized { .. } => InteropStatus::NotInitialized,
            BridgeError::NotInstalled => InteropStatus::NotInstalled,
            BridgeError::AlreadyInstalled => InteropStatus::AlreadyInstalled,
            BridgeError::Config { .. } => InteropStatus::InvalidConfig,
            BridgeError::ArgumentLayout { .. } | BridgeError::InvalidHandle { .. } => {
                InteropStatus::InvalidArgument
            }
            BridgeError::CallbackFailed { .. } => InteropStatus::CallbackFailed,
            BridgeError::LockUnavailable { .. } => InteropStatus::LockUnavailable,
            BridgeError::LockMisuse { .. } => InteropStatus::LockMisuse,
        }
    }
}

impl InteropStatus {
    fn of(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<BufferTooSmall>().is_some() {
            InteropStatus::BufferTooSmall
        } else {
            err.downcast_ref::<BridgeError>()
                .map(InteropStatus::from)
                .unwrap_or(InteropStatus::InvalidArgument)
        }
    }
}

#[derive(Debug)]
struct BufferTooSmall {
    required: usize,
    capacity: usize,
}

impl fmt::Display for BufferTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output buffer too small: {} handles produced, room for {}",
            self.required, self.capacity
        )
    }
}

impl std::error::Error for BufferTooSmall {}

fn report(result: anyhow::Result<()>) -> InteropStatus {
    match result {
        Ok(()) => {
            LAST_ERROR.with(|slot| slot.borrow_mut().take());
            InteropStatus::Ok
        }
        Err(err) => {
            let status = InteropStatus::of(&err);
            tracing::debug!(?status, "interop call failed: {err:#}");
            LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(format!("{err:#}")));
            status
        }
    }
}

/// A call into the interpreter. Each array holds the number of elements
/// given by its `num_` field and may be null when that number is zero.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InteropCall {
    pub callback: *mut c_void,
    pub requires_grads: *const bool,
    pub num_requires_grads: usize,
    pub tensor_args: *const *const DLTensor,
    pub num_tensor_args: usize,
    pub tensor_indices: *const i64,
    pub num_tensor_indices: usize,
    pub obj_args: *const *mut c_void,
    pub num_obj_args: usize,
    pub obj_indices: *const i64,
    pub num_obj_indices: usize,
}

/// # Safety
/// A non-null `ptr` must point to `len` readable elements living for `'a`.
unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize, what: &str) -> BridgeResult<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(BridgeError::ArgumentLayout {
            reason: format!("{what} is null but holds {len} elements"),
        });
    }
    // SAFETY: non-null and sized by the caller.
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
}

/// # Safety
/// `vtable` must be null or point to a valid `InteropInterpreterVTable`.
unsafe fn bridge_init(vtable: *const InteropInterpreterVTable) -> anyhow::Result<()> {
    // SAFETY: the caller passes null or a valid vtable.
    let vtable = unsafe { vtable.as_ref() }.context("interpreter vtable is null")?;
    let config = BridgeConfig::from_env().context("loading bridge configuration")?;
    let interpreter = VTableInterpreter::new(*vtable, &config)?;
    let bridge = lifecycle::initialize(Arc::new(interpreter), config)?;
    if !bridge.initialized() {
        tracing::warn!("host interpreter is not initialized; calls will fail until it is");
    }
    Ok(())
}

/// Install the process-wide bridge over the host's interpreter.
///
/// # Safety
/// `vtable` must be null or point to a valid `InteropInterpreterVTable`
/// whose entry points stay callable until `interop_bridge_shutdown`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_bridge_init(
    vtable: *const InteropInterpreterVTable,
) -> InteropStatus {
    interop_logging::init();
    report(unsafe { bridge_init(vtable) })
}

#[unsafe(no_mangle)]
pub extern "C" fn interop_bridge_shutdown() -> InteropStatus {
    report(lifecycle::shutdown().map(drop).map_err(Into::into))
}

#[unsafe(no_mangle)]
pub extern "C" fn interop_bridge_initialized() -> bool {
    lifecycle::current()
        .map(|bridge| bridge.initialized())
        .unwrap_or(false)
}

/// # Safety
/// `out_token` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_get_gil(out_token: *mut i32) -> InteropStatus {
    report((|| -> anyhow::Result<()> {
        anyhow::ensure!(!out_token.is_null(), "out_token is null");
        let token = lifecycle::current()?.get_gil()?;
        // SAFETY: checked non-null; the caller guarantees it is writable.
        unsafe { out_token.write(token.into_raw()) };
        Ok(())
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn interop_put_gil(token: i32) -> InteropStatus {
    report((|| -> anyhow::Result<()> {
        let bridge = lifecycle::current()?;
        let token = GilToken::from_raw(token).ok_or_else(|| BridgeError::LockMisuse {
            reason: format!("{token} is not a lock token"),
        })?;
        bridge.put_gil(token)?;
        Ok(())
    })())
}

/// # Safety
/// `call` must point to a valid `InteropCall`. `outputs` must have room for
/// `capacity` handles and `out_len` must be valid for writes.
unsafe fn call_into(
    direction: Direction,
    call: *const InteropCall,
    outputs: *mut *mut c_void,
    capacity: usize,
    out_len: *mut usize,
) -> anyhow::Result<()> {
    anyhow::ensure!(!out_len.is_null(), "out_len is null");
    // SAFETY: checked non-null; the caller guarantees it is writable.
    unsafe { out_len.write(0) };
    // SAFETY: the caller passes null or a valid descriptor.
    let call = unsafe { call.as_ref() }.context("call descriptor is null")?;
    let bridge = lifecycle::current()?;

    // SAFETY: every array is sized by its count, per the caller contract.
    let (requires_grads, tensor_ptrs, tensor_indices, obj_ptrs, obj_indices) = unsafe {
        (
            raw_slice(call.requires_grads, call.num_requires_grads, "requires_grads")?,
            raw_slice(call.tensor_args, call.num_tensor_args, "tensor_args")?,
            raw_slice(call.tensor_indices, call.num_tensor_indices, "tensor_indices")?,
            raw_slice(call.obj_args, call.num_obj_args, "obj_args")?,
            raw_slice(call.obj_indices, call.num_obj_indices, "obj_indices")?,
        )
    };

    let tensors = tensor_ptrs
        .iter()
        .enumerate()
        .map(|(i, &ptr)| {
            // SAFETY: the engine keeps each tensor alive for the call.
            unsafe { TensorRef::from_raw(ptr) }.ok_or_else(|| BridgeError::InvalidHandle {
                reason: format!("tensor argument {i} is null or malformed"),
            })
        })
        .collect::<BridgeResult<Vec<_>>>()?;
    let objects = obj_ptrs
        .iter()
        .map(|&ptr| ForeignHandle::object(ptr))
        .collect::<BridgeResult<Vec<_>>>()?;
    let callback = ForeignHandle::from_raw(call.callback, HandleKind::Callback);

    let mut produced = Vec::new();
    match direction {
        Direction::Forward => bridge.forward(
            callback,
            requires_grads,
            &tensors,
            tensor_indices,
            &objects,
            obj_indices,
            &mut produced,
        )?,
        Direction::Backward => bridge.backward(
            callback,
            requires_grads,
            &tensors,
            tensor_indices,
            &objects,
            obj_indices,
            &mut produced,
        )?,
    }

    // SAFETY: checked non-null above.
    unsafe { out_len.write(produced.len()) };
    if produced.len() > capacity || (!produced.is_empty() && outputs.is_null()) {
        // dropping `produced` releases every handle
        return Err(BufferTooSmall {
            required: produced.len(),
            capacity,
        }
        .into());
    }
    for (i, handle) in produced.into_iter().enumerate() {
        // SAFETY: i < capacity and the caller sized `outputs` accordingly.
        unsafe { outputs.add(i).write(handle.into_raw()) };
    }
    Ok(())
}

/// Run a custom operator's forward pass. On success the produced handles
/// are written to `outputs` and owned by the caller; `out_len` receives their
/// number. When `capacity` is too small every produced handle is released,
/// `out_len` receives the required capacity and `BufferTooSmall` is returned.
/// Any other failure leaves `out_len` at 0.
///
/// # Safety
/// See `InteropCall`. `outputs` must have room for `capacity` handles and
/// `out_len` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_forward(
    call: *const InteropCall,
    outputs: *mut *mut c_void,
    capacity: usize,
    out_len: *mut usize,
) -> InteropStatus {
    report(unsafe { call_into(Direction::Forward, call, outputs, capacity, out_len) })
}

/// Run a custom operator's backward pass. Same contract as `interop_forward`.
///
/// # Safety
/// See `interop_forward`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_backward(
    call: *const InteropCall,
    outputs: *mut *mut c_void,
    capacity: usize,
    out_len: *mut usize,
) -> InteropStatus {
    report(unsafe { call_into(Direction::Backward, call, outputs, capacity, out_len) })
}

/// Release a handle returned by `interop_forward` or `interop_backward`.
#[unsafe(no_mangle)]
pub extern "C" fn interop_release_handle(handle: *mut c_void) -> InteropStatus {
    report((|| -> anyhow::Result<()> {
        let bridge = lifecycle::current()?;
        drop(bridge.adopt(ForeignHandle::object(handle)?));
        Ok(())
    })())
}

/// Hand one produced value to the bridge from inside the host's `invoke`.
///
/// # Safety
/// `sink` must be the pointer passed to the running `invoke`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_output_push(
    sink: *mut InteropOutputSink,
    handle: *mut c_void,
) -> InteropStatus {
    report((|| -> anyhow::Result<()> {
        // SAFETY: the caller passes null or the live sink.
        let sink = unsafe { sink.as_mut() }.context("output sink is null")?;
        sink.push(ForeignHandle::object(handle)?);
        Ok(())
    })())
}

/// Copy the calling thread's last error message into `buf` as a
/// NUL-terminated string, truncating to `len`. Returns the buffer size the
/// full message needs, or 0 when the last call on this thread succeeded.
///
/// # Safety
/// `buf` must be null or valid for `len` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn interop_last_error(buf: *mut c_char, len: usize) -> usize {
    LAST_ERROR.with(|slot| {
        let slot = slot.borrow();
        let Some(message) = slot.as_deref() else {
            return 0;
        };
        let bytes = message.as_bytes();
        if !buf.is_null() && len > 0 {
            let n = bytes.len().min(len - 1);
            // SAFETY: `buf` holds `len` bytes and n < len.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), buf, n);
                buf.add(n).write(0);
            }
        }
        bytes.len() + 1
    })
}
