// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Python-owned memory described as an engine tensor.
//!
//! A `TensorView` does not own the memory at `address`; whoever created it
//! keeps the buffer alive while the view is in use.

use std::ffi::c_void;

use interop_bridge::TensorRef;
use interop_bridge::dlpack::ffi::{DLTensor, DataType, Device, DeviceType};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

#[pyclass(frozen)]
pub struct TensorView {
    address: usize,
    device: Device,
    dtype: DataType,
    shape: Box<[i64]>,
    strides: Option<Box<[i64]>>,
}

fn parse_device(device: &str) -> PyResult<Device> {
    match device.to_lowercase().as_str() {
        "cpu" => Ok(Device::CPU),
        d if d == "cuda" || d.starts_with("cuda:") => {
            let device_id = match d.split_once(':') {
                Some((_, id)) => id
                    .parse::<i32>()
                    .map_err(|_| PyValueError::new_err(format!("Invalid device: {device}")))?,
                None => 0,
            };
            Ok(Device {
                device_type: DeviceType::Cuda,
                device_id,
            })
        }
        _ => Err(PyValueError::new_err(format!("Invalid device: {device}"))),
    }
}

#[pymethods]
impl TensorView {
    #[new]
    #[pyo3(signature = (address, shape, dtype="float32", strides=None, device="cpu"))]
    fn new(
        address: usize,
        shape: Vec<i64>,
        dtype: &str,
        strides: Option<Vec<i64>>,
        device: &str,
    ) -> PyResult<Self> {
        if address == 0 {
            return Err(PyValueError::new_err("address must not be null"));
        }
        if shape.iter().any(|&dim| dim < 0) {
            return Err(PyValueError::new_err(format!(
                "shape must not have negative dimensions: {shape:?}"
            )));
        }
        if let Some(strides) = &strides {
            if strides.len() != shape.len() {
                return Err(PyValueError::new_err(format!(
                    "{} strides given for {} dimensions",
                    strides.len(),
                    shape.len()
                )));
            }
        }
        let dtype = DataType::from_name(dtype)
            .ok_or_else(|| PyValueError::new_err(format!("Invalid dtype: {dtype}")))?;

        Ok(Self {
            address,
            device: parse_device(device)?,
            dtype,
            shape: shape.into_boxed_slice(),
            strides: strides.map(Vec::into_boxed_slice),
        })
    }

    #[getter]
    fn address(&self) -> usize {
        self.address
    }

    #[getter]
    fn shape(&self) -> Vec<i64> {
        self.shape.to_vec()
    }

    #[getter]
    fn strides(&self) -> Option<Vec<i64>> {
        self.strides.as_deref().map(<[i64]>::to_vec)
    }

    /// Bytes covered by the view if it is compact.
    #[getter]
    fn nbytes(&self) -> usize {
        let raw = self.descriptor();
        // SAFETY: `raw` points into `self`, which outlives this call.
        unsafe { TensorRef::new(&raw) }.nbytes()
    }

    fn __repr__(&self) -> String {
        format!(
            "TensorView(address={:#x}, shape={:?}, dtype={:?}/{}, device={:?}:{})",
            self.address,
            self.shape,
            self.dtype.code,
            self.dtype.bits,
            self.device.device_type,
            self.device.device_id
        )
    }
}

impl TensorView {
    /// DLPack descriptor over this view; valid while `self` is alive.
    pub fn descriptor(&self) -> DLTensor {
        DLTensor {
            data: self.address as *mut c_void,
            device: self.device,
            ndim: self.shape.len() as i32,
            dtype: self.dtype,
            shape: self.shape.as_ptr().cast_mut(),
            strides: self
                .strides
                .as_ref()
                .map_or(std::ptr::null_mut(), |strides| strides.as_ptr().cast_mut()),
            byte_offset: 0,
        }
    }
}
