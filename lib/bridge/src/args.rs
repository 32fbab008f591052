// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reassembly of the mixed argument list a callback expects.
//!
//! Tensors and interpreter objects arrive in two parallel lists, each with
//! the argument positions its values occupy. Together the positions must
//! cover `0..N` exactly once.

use crate::dlpack::TensorRef;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::ForeignHandle;

/// One positional argument of a callback invocation.
#[derive(Debug, Clone, Copy)]
pub enum CallArg<'a> {
    Tensor(TensorRef<'a>),
    Object(ForeignHandle),
}

impl CallArg<'_> {
    pub fn is_tensor(&self) -> bool {
        matches!(self, CallArg::Tensor(_))
    }
}

/// Fully ordered arguments plus the per-tensor gradient flags.
#[derive(Debug)]
pub struct CallFrame<'a> {
    args: Vec<CallArg<'a>>,
    requires_grads: &'a [bool],
}

impl<'a> CallFrame<'a> {
    /// Place every tensor and object at its recorded position.
    ///
    /// Fails before anything is invoked if the lengths disagree or the
    /// positions are negative, out of range, duplicated or leave a gap.
    pub fn assemble(
        requires_grads: &'a [bool],
        tensor_args: &[TensorRef<'a>],
        tensor_indices: &[i64],
        obj_args: &[ForeignHandle],
        obj_indices: &[i64],
    ) -> BridgeResult<Self> {
        if tensor_args.len() != tensor_indices.len() {
            return Err(BridgeError::layout(format!(
                "{} tensor arguments but {} tensor indices",
                tensor_args.len(),
                tensor_indices.len()
            )));
        }
        if obj_args.len() != obj_indices.len() {
            return Err(BridgeError::layout(format!(
                "{} object arguments but {} object indices",
                obj_args.len(),
                obj_indices.len()
            )));
        }
        if requires_grads.len() != tensor_args.len() {
            return Err(BridgeError::layout(format!(
                "{} requires_grad flags for {} tensor arguments",
                requires_grads.len(),
                tensor_args.len()
            )));
        }

        let total = tensor_args.len() + obj_args.len();
        let mut slots: Vec<Option<CallArg<'a>>> = vec![None; total];

        let tensors = tensor_indices
            .iter()
            .zip(tensor_args)
            .map(|(&index, &tensor)| (index, CallArg::Tensor(tensor)));
        let objects = obj_indices
            .iter()
            .zip(obj_args)
            .map(|(&index, &handle)| (index, CallArg::Object(handle)));

        for (index, arg) in tensors.chain(objects) {
            let slot = usize::try_from(index)
                .ok()
                .and_then(|position| slots.get_mut(position))
                .ok_or_else(|| {
                    BridgeError::layout(format!(
                        "argument index {index} is outside 0..{total}"
                    ))
                })?;
            if slot.is_some() {
                return Err(BridgeError::layout(format!(
                    "argument index {index} is assigned more than once"
                )));
            }
            *slot = Some(arg);
        }

        let args = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.ok_or_else(|| {
                    BridgeError::layout(format!("argument index {position} is never assigned"))
                })
            })
            .collect::<BridgeResult<Vec<_>>>()?;

        Ok(Self {
            args,
            requires_grads,
        })
    }

    pub fn args(&self) -> &[CallArg<'a>] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// One flag per tensor argument, in tensor-list order.
    pub fn requires_grads(&self) -> &'a [bool] {
        self.requires_grads
    }

    pub fn num_tensors(&self) -> usize {
        self.args.iter().filter(|arg| arg.is_tensor()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostTensor;
    use rstest::rstest;
    use std::ffi::c_void;

    fn object(addr: usize) -> ForeignHandle {
        ForeignHandle::object(addr as *mut c_void).unwrap()
    }

    fn describe(frame: &CallFrame<'_>) -> Vec<String> {
        frame
            .args()
            .iter()
            .map(|arg| match arg {
                CallArg::Tensor(t) => format!("T{}", t.shape()[0]),
                CallArg::Object(h) => format!("O{:x}", h.addr()),
            })
            .collect()
    }

    #[test]
    fn test_interleaves_tensors_and_objects() {
        let t0 = HostTensor::zeros(&[0]);
        let t1 = HostTensor::zeros(&[1]);
        let grads = [true, false];

        let frame = CallFrame::assemble(
            &grads,
            &[t0.view(), t1.view()],
            &[0, 2],
            &[object(0xa0)],
            &[1],
        )
        .unwrap();

        assert_eq!(describe(&frame), vec!["T0", "Oa0", "T1"]);
        assert_eq!(frame.num_tensors(), 2);
        assert_eq!(frame.requires_grads(), &[true, false]);
    }

    #[test]
    fn test_empty_call() {
        let frame = CallFrame::assemble(&[], &[], &[], &[], &[]).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_objects_only() {
        let frame =
            CallFrame::assemble(&[], &[], &[], &[object(0xb0), object(0xb1)], &[1, 0]).unwrap();
        assert_eq!(describe(&frame), vec!["Ob1", "Ob0"]);
    }

    #[rstest]
    #[case::gap(&[0, 3], &[1], "outside")]
    #[case::duplicate(&[0, 1], &[1], "more than once")]
    #[case::negative(&[-1, 2], &[1], "outside")]
    #[case::out_of_range(&[0, 5], &[1], "outside")]
    fn test_rejects_bad_indices(
        #[case] tensor_indices: &[i64],
        #[case] obj_indices: &[i64],
        #[case] expected: &str,
    ) {
        let t0 = HostTensor::zeros(&[0]);
        let t1 = HostTensor::zeros(&[1]);
        let grads = [false, false];
        let objects: Vec<ForeignHandle> = obj_indices.iter().map(|_| object(0xc0)).collect();

        let err = CallFrame::assemble(
            &grads,
            &[t0.view(), t1.view()],
            tensor_indices,
            &objects,
            obj_indices,
        )
        .unwrap_err();

        assert!(matches!(err, BridgeError::ArgumentLayout { .. }));
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[test]
    fn test_rejects_length_mismatches() {
        let t0 = HostTensor::zeros(&[0]);

        let err = CallFrame::assemble(&[true], &[t0.view()], &[0, 1], &[], &[]).unwrap_err();
        assert!(err.to_string().contains("tensor indices"));

        let err = CallFrame::assemble(&[true], &[t0.view()], &[0], &[object(1)], &[]).unwrap_err();
        assert!(err.to_string().contains("object indices"));

        let err = CallFrame::assemble(&[], &[t0.view()], &[0], &[], &[]).unwrap_err();
        assert!(err.to_string().contains("requires_grad"));
    }
}
