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

//! Export engine tensors to Python as DLPack capsules.
//!
//! The capsule borrows the engine's memory. It owns only a copy of the shape
//! and strides, so it stays well formed if Python keeps it past the call;
//! the data itself is valid only for the duration of the call.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use interop_bridge::TensorRef;
use interop_bridge::dlpack::ffi;
use pyo3::prelude::*;

static LIVE_EXPORTS: AtomicUsize = AtomicUsize::new(0);

pub fn live_exports() -> usize {
    LIVE_EXPORTS.load(Ordering::Relaxed)
}

/// Shape and strides copied out of the engine's descriptor.
enum ShapeAndStrides {
    Contiguous(Box<[i64]>),  // shape only
    WithStrides(Box<[i64]>), // [shape | strides]
}

impl ShapeAndStrides {
    fn from_tensor(tensor: &TensorRef<'_>) -> Self {
        match tensor.strides() {
            None => Self::Contiguous(tensor.shape().into()),
            Some(strides) => {
                let mut buf = Vec::with_capacity(tensor.ndim() * 2);
                buf.extend_from_slice(tensor.shape());
                buf.extend_from_slice(strides);
                Self::WithStrides(buf.into_boxed_slice())
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Contiguous(v) => v.len(),
            Self::WithStrides(v) => v.len() / 2,
        }
    }

    fn shape_ptr(&mut self) -> *mut i64 {
        match self {
            Self::Contiguous(v) | Self::WithStrides(v) => v.as_mut_ptr(),
        }
    }

    fn strides_ptr(&mut self) -> *mut i64 {
        let len = self.len();
        match self {
            Self::Contiguous(_) => std::ptr::null_mut(),
            Self::WithStrides(v) => v[len..].as_mut_ptr(),
        }
    }
}

/// Owner of everything a [`ffi::DLManagedTensor`] points at besides data.
struct ManagerCtx {
    data: *mut c_void,
    device: ffi::Device,
    dtype: ffi::DataType,
    byte_offset: u64,
    shape_and_strides: ShapeAndStrides,
    tensor: Option<ffi::DLManagedTensor>,
}

unsafe extern "C" fn deleter_fn(dl_managed_tensor: *mut ffi::DLManagedTensor) {
    // SAFETY: manager_ctx was leaked from a Box<ManagerCtx> by `into_dlpack`
    // and the consumer calls the deleter exactly once.
    unsafe {
        let ctx = (*dl_managed_tensor).manager_ctx as *mut ManagerCtx;
        drop(Box::from_raw(ctx));
    }
}

impl ManagerCtx {
    fn new(tensor: &TensorRef<'_>) -> Self {
        LIVE_EXPORTS.fetch_add(1, Ordering::Relaxed);
        Self {
            data: tensor.data_ptr(),
            device: tensor.device(),
            dtype: tensor.dtype(),
            byte_offset: tensor.byte_offset(),
            shape_and_strides: ShapeAndStrides::from_tensor(tensor),
            tensor: None,
        }
    }

    /// Leak onto the heap; the returned tensor's deleter frees it.
    fn into_dlpack(self) -> NonNull<ffi::DLManagedTensor> {
        let ctx = Box::leak(Box::new(self));
        let dl_tensor = ffi::DLTensor {
            data: ctx.data,
            device: ctx.device,
            ndim: ctx.shape_and_strides.len() as i32,
            dtype: ctx.dtype,
            shape: ctx.shape_and_strides.shape_ptr(),
            strides: ctx.shape_and_strides.strides_ptr(),
            byte_offset: ctx.byte_offset,
        };
        let manager_ctx = ctx as *mut Self as *mut c_void;
        let managed = ctx.tensor.insert(ffi::DLManagedTensor {
            dl_tensor,
            manager_ctx,
            deleter: Some(deleter_fn),
        });
        NonNull::from(managed)
    }
}

impl Drop for ManagerCtx {
    fn drop(&mut self) {
        LIVE_EXPORTS.fetch_sub(1, Ordering::Relaxed);
    }
}

const DLPACK_CAPSULE_NAME: &[u8] = b"dltensor\0";
const DLPACK_CAPSULE_USED_NAME: &[u8] = b"used_dltensor\0";

// Runs when Python drops the capsule. A consumer that imported the tensor
// renames it to "used_dltensor" and takes over the deleter.
unsafe extern "C" fn dlpack_capsule_deleter(capsule: *mut pyo3::ffi::PyObject) {
    unsafe {
        if pyo3::ffi::PyCapsule_IsValid(capsule, DLPACK_CAPSULE_USED_NAME.as_ptr().cast()) == 1 {
            return;
        }

        let mut exc_type = std::ptr::null_mut();
        let mut exc_value = std::ptr::null_mut();
        let mut exc_trace = std::ptr::null_mut();
        pyo3::ffi::PyErr_Fetch(&mut exc_type, &mut exc_value, &mut exc_trace);

        let managed = pyo3::ffi::PyCapsule_GetPointer(capsule, DLPACK_CAPSULE_NAME.as_ptr().cast())
            as *mut ffi::DLManagedTensor;

        if managed.is_null() {
            pyo3::ffi::PyErr_WriteUnraisable(capsule);
        } else if let Some(deleter) = (*managed).deleter {
            deleter(managed);
        }

        pyo3::ffi::PyErr_Restore(exc_type, exc_value, exc_trace);
    }
}

/// Wrap `tensor` in a `"dltensor"` capsule, importable with
/// `torch.utils.dlpack.from_dlpack`.
pub fn to_capsule<'py>(py: Python<'py>, tensor: &TensorRef<'_>) -> PyResult<Bound<'py, PyAny>> {
    let managed = ManagerCtx::new(tensor).into_dlpack();
    // SAFETY: `managed` stays valid until its deleter runs.
    let capsule = unsafe {
        pyo3::ffi::PyCapsule_New(
            managed.as_ptr().cast(),
            DLPACK_CAPSULE_NAME.as_ptr().cast(),
            Some(dlpack_capsule_deleter),
        )
    };
    // SAFETY: PyCapsule_New returns a new reference or null with an error set.
    unsafe { Bound::from_owned_ptr_or_err(py, capsule) }.inspect_err(|_| {
        // the capsule never took ownership
        // SAFETY: `managed` came from `into_dlpack` and was not handed out.
        unsafe { deleter_fn(managed.as_ptr()) }
    })
}
