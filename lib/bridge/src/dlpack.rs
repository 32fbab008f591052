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

//! Native tensor values as seen by the bridge.
//!
//! The engine describes each tensor argument with a DLPack `DLTensor`. The
//! bridge only borrows that description for the duration of one call and
//! never touches the data it points at.

use std::ffi::c_void;
use std::fmt;

/// Raw FFI layout of the DLPack structs.
pub mod ffi {
    use std::ffi::c_void;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum DeviceType {
        /// CPU device
        Cpu = 1,
        /// CUDA GPU device
        Cuda = 2,
        /// Pinned CUDA CPU memory by cudaMallocHost
        CudaHost = 3,
        /// OpenCL devices.
        OpenCl = 4,
        /// Vulkan buffer for next generation graphics.
        Vulkan = 7,
        /// Metal for Apple GPU.
        Metal = 8,
        /// Verilog simulator buffer
        Vpi = 9,
        /// ROCm GPUs for AMD GPUs
        Rocm = 10,
        /// Pinned ROCm CPU memory allocated by hipMallocHost
        RocmHost = 11,
        /// Reserved extension device type
        ExtDev = 12,
        /// CUDA managed/unified memory allocated by cudaMallocManaged
        CudaManaged = 13,
        /// Unified shared memory allocated on a oneAPI non-partititioned device
        OneApi = 14,
        /// GPU support for next generation WebGPU standard.
        WebGpu = 15,
        /// Qualcomm Hexagon DSP
        Hexagon = 16,
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Device {
        pub device_type: DeviceType,
        /// 0 for vanilla CPU memory, pinned memory, or managed memory.
        pub device_id: i32,
    }

    impl Device {
        pub const CPU: Self = Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        };
    }

    #[repr(u8)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum DataTypeCode {
        Int = 0,
        UInt = 1,
        Float = 2,
        /// Frameworks need to agree on the handle data type for the exchange
        /// to be well-defined.
        OpaqueHandle = 3,
        Bfloat = 4,
        /// C/C++/Python layout: compact struct per complex number
        Complex = 5,
        Bool = 6,
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DataType {
        pub code: DataTypeCode,
        /// Number of bits, common choices are 8, 16, 32.
        pub bits: u8,
        /// Number of lanes in the type, used for vector types.
        pub lanes: u16,
    }

    impl DataType {
        pub const BF16: Self = Self::scalar(DataTypeCode::Bfloat, 16);
        pub const BOOL: Self = Self::scalar(DataTypeCode::Bool, 8);
        pub const F16: Self = Self::scalar(DataTypeCode::Float, 16);
        pub const F32: Self = Self::scalar(DataTypeCode::Float, 32);
        pub const F64: Self = Self::scalar(DataTypeCode::Float, 64);
        pub const I8: Self = Self::scalar(DataTypeCode::Int, 8);
        pub const I16: Self = Self::scalar(DataTypeCode::Int, 16);
        pub const I32: Self = Self::scalar(DataTypeCode::Int, 32);
        pub const I64: Self = Self::scalar(DataTypeCode::Int, 64);
        pub const U8: Self = Self::scalar(DataTypeCode::UInt, 8);

        const fn scalar(code: DataTypeCode, bits: u8) -> Self {
            Self {
                code,
                bits,
                lanes: 1,
            }
        }

        /// Calculate `DataType` size as (bits * lanes + 7) // 8
        pub fn size(&self) -> usize {
            (self.bits as u32 * self.lanes as u32).div_ceil(8) as usize
        }

        /// Parse a framework dtype name such as `"float32"` or `"bf16"`.
        pub fn from_name(name: &str) -> Option<Self> {
            let dtype = match name.to_ascii_lowercase().as_str() {
                "bfloat16" | "bf16" => Self::BF16,
                "bool" => Self::BOOL,
                "float16" | "half" | "fp16" => Self::F16,
                "float32" | "float" | "fp32" => Self::F32,
                "float64" | "double" | "fp64" => Self::F64,
                "int8" => Self::I8,
                "int16" => Self::I16,
                "int32" => Self::I32,
                "int64" | "long" => Self::I64,
                "uint8" => Self::U8,
                _ => return None,
            };
            Some(dtype)
        }
    }

    #[repr(C)]
    #[derive(Debug)]
    pub struct DLTensor {
        pub data: *mut c_void,
        pub device: Device,
        pub ndim: i32,
        pub dtype: DataType,
        pub shape: *mut i64,
        /// Null means compact row-major.
        pub strides: *mut i64,
        pub byte_offset: u64,
    }

    #[repr(C)]
    pub struct DLManagedTensor {
        pub dl_tensor: DLTensor,
        pub manager_ctx: *mut c_void,
        pub deleter: Option<unsafe extern "C" fn(*mut Self)>,
    }
}

pub use ffi::{DLTensor, DataType, Device};

/// Borrowed view of an engine-owned tensor.
///
/// Constructing one is `unsafe` because the bridge trusts the `DLTensor` to
/// describe valid shape and stride arrays; every accessor afterwards is safe.
#[derive(Clone, Copy)]
pub struct TensorRef<'a> {
    raw: &'a DLTensor,
}

impl<'a> TensorRef<'a> {
    /// # Safety
    /// `raw.shape` must point to `raw.ndim` readable elements and
    /// `raw.strides` must be null or point to `raw.ndim` readable elements,
    /// both for at least `'a`. `raw.ndim` must not be negative.
    pub unsafe fn new(raw: &'a DLTensor) -> Self {
        Self { raw }
    }

    /// View a tensor handed over as a raw pointer. Returns `None` for a null
    /// pointer or a malformed descriptor.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a `DLTensor` that satisfies the
    /// requirements of [`TensorRef::new`] for `'a`.
    pub unsafe fn from_raw(ptr: *const DLTensor) -> Option<Self> {
        // SAFETY: the caller guarantees a non-null pointer is valid for 'a.
        let raw = unsafe { ptr.as_ref() }?;
        if raw.ndim < 0 || (raw.ndim > 0 && raw.shape.is_null()) {
            return None;
        }
        Some(Self { raw })
    }

    pub fn as_raw(&self) -> &'a DLTensor {
        self.raw
    }

    pub fn data_ptr(&self) -> *mut c_void {
        self.raw.data
    }

    pub fn device(&self) -> Device {
        self.raw.device
    }

    pub fn dtype(&self) -> DataType {
        self.raw.dtype
    }

    pub fn byte_offset(&self) -> u64 {
        self.raw.byte_offset
    }

    pub fn ndim(&self) -> usize {
        self.raw.ndim.max(0) as usize
    }

    pub fn shape(&self) -> &'a [i64] {
        if self.ndim() == 0 {
            return &[];
        }
        // SAFETY: guaranteed by the constructor contract.
        unsafe { std::slice::from_raw_parts(self.raw.shape, self.ndim()) }
    }

    /// `None` when the tensor is compact row-major.
    pub fn strides(&self) -> Option<&'a [i64]> {
        if self.raw.strides.is_null() || self.ndim() == 0 {
            return None;
        }
        // SAFETY: guaranteed by the constructor contract.
        Some(unsafe { std::slice::from_raw_parts(self.raw.strides, self.ndim()) })
    }

    pub fn numel(&self) -> i64 {
        self.shape().iter().product()
    }

    /// Bytes spanned by a compact tensor of this shape and dtype.
    pub fn nbytes(&self) -> usize {
        self.numel().max(0) as usize * self.dtype().size()
    }
}

impl fmt::Debug for TensorRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorRef")
            .field("data", &self.data_ptr())
            .field("device", &self.device())
            .field("dtype", &self.dtype())
            .field("shape", &self.shape())
            .field("strides", &self.strides())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(data: &mut [f32], shape: &mut [i64]) -> DLTensor {
        DLTensor {
            data: data.as_mut_ptr().cast(),
            device: Device::CPU,
            ndim: shape.len() as i32,
            dtype: DataType::F32,
            shape: shape.as_mut_ptr(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        }
    }

    #[test]
    fn test_view_reads_descriptor() {
        let mut data = vec![0.0f32; 6];
        let mut shape = vec![2, 3];
        let raw = descriptor(&mut data, &mut shape);
        let view = unsafe { TensorRef::from_raw(&raw) }.unwrap();

        assert_eq!(view.shape(), &[2, 3]);
        assert_eq!(view.strides(), None);
        assert_eq!(view.numel(), 6);
        assert_eq!(view.dtype().size(), 4);
        assert_eq!(view.nbytes(), 24);
        assert_eq!(view.device(), Device::CPU);
        assert_eq!(view.data_ptr(), data.as_mut_ptr().cast());
    }

    #[test]
    fn test_scalar_has_empty_shape() {
        let mut data = vec![1.0f32];
        let mut shape: Vec<i64> = vec![];
        let mut raw = descriptor(&mut data, &mut shape);
        raw.shape = std::ptr::null_mut();
        let view = unsafe { TensorRef::from_raw(&raw) }.unwrap();
        assert!(view.shape().is_empty());
        assert_eq!(view.numel(), 1);
    }

    #[test]
    fn test_malformed_descriptors_are_rejected() {
        assert!(unsafe { TensorRef::from_raw(std::ptr::null()) }.is_none());

        let mut data = vec![0.0f32; 2];
        let mut shape = vec![2];
        let mut raw = descriptor(&mut data, &mut shape);
        raw.shape = std::ptr::null_mut();
        assert!(unsafe { TensorRef::from_raw(&raw) }.is_none());

        let mut raw = descriptor(&mut data, &mut shape);
        raw.ndim = -1;
        assert!(unsafe { TensorRef::from_raw(&raw) }.is_none());
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DataType::BOOL.size(), 1);
        assert_eq!(DataType::BF16.size(), 2);
        assert_eq!(DataType::I64.size(), 8);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!(DataType::from_name("float32"), Some(DataType::F32));
        assert_eq!(DataType::from_name("BF16"), Some(DataType::BF16));
        assert_eq!(DataType::from_name("int64"), Some(DataType::I64));
        assert_eq!(DataType::from_name("complex64"), None);
    }
}
