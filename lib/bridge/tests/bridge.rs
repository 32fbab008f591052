// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::c_void;
use std::sync::Arc;

use interop_bridge::testing::{ArgRecord, HostTensor, LockEvent, MockInterpreter};
use interop_bridge::{
    Bridge, BridgeConfig, BridgeError, Direction, ErrorKind, ForeignHandle, GilState,
    InterpreterError, OwnedHandle,
};

fn setup() -> (Arc<MockInterpreter>, Bridge) {
    let mock = Arc::new(MockInterpreter::new());
    let bridge = Bridge::new(mock.clone(), BridgeConfig::default());
    (mock, bridge)
}

fn object(addr: usize) -> ForeignHandle {
    ForeignHandle::object(addr as *mut c_void).unwrap()
}

#[test]
fn test_forward_reconstructs_mixed_arguments() {
    let (mock, bridge) = setup();
    let callback = mock.register_echo();
    let t0 = HostTensor::zeros(&[2, 2]);
    let t1 = HostTensor::zeros(&[3]);
    let o0 = object(0xdead0);

    let mut outputs = Vec::new();
    bridge
        .forward(
            Some(callback),
            &[true, false],
            &[t0.view(), t1.view()],
            &[0, 2],
            &[o0],
            &[1],
            &mut outputs,
        )
        .unwrap();

    let invocations = mock.invocations();
    assert_eq!(invocations.len(), 1);
    let call = &invocations[0];
    assert_eq!(call.direction, Direction::Forward);
    assert_eq!(call.callback, callback);
    assert_eq!(call.requires_grads, vec![true, false]);
    assert_eq!(
        call.args,
        vec![
            ArgRecord::Tensor {
                data: t0.data_ptr(),
                shape: vec![2, 2]
            },
            ArgRecord::Object(o0),
            ArgRecord::Tensor {
                data: t1.data_ptr(),
                shape: vec![3]
            },
        ]
    );

    // one output per argument, owned by the caller
    assert_eq!(outputs.len(), 3);
    assert_eq!(mock.live_objects(), 3);
    drop(outputs);
    assert_eq!(mock.live_objects(), 0);
    assert_eq!(mock.released().len(), 3);
}

#[test]
fn test_backward_uses_reverse_path() {
    let (mock, bridge) = setup();
    let callback = mock.register_callback(|mock, direction, frame| {
        assert_eq!(direction, Direction::Backward);
        Ok((0..frame.num_tensors()).map(|_| mock.new_object()).collect())
    });
    let grad = HostTensor::new(vec![1.0, 2.0], &[2]);

    let mut outputs = Vec::new();
    bridge
        .backward(
            Some(callback),
            &[false],
            &[grad.view()],
            &[0],
            &[],
            &[],
            &mut outputs,
        )
        .unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(mock.invocations()[0].direction, Direction::Backward);
}

#[test]
fn test_outputs_are_appended_in_order() {
    let (mock, bridge) = setup();
    let produced = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let callback = {
        let produced = produced.clone();
        mock.register_callback(move |mock, _, _| {
            let handles = vec![mock.new_object(), mock.new_object()];
            produced.lock().extend(handles.iter().copied());
            Ok(handles)
        })
    };

    let existing = bridge.adopt(mock.new_object());
    let first = existing.handle();
    let mut outputs: Vec<OwnedHandle> = vec![existing];
    bridge
        .forward(Some(callback), &[], &[], &[], &[], &[], &mut outputs)
        .unwrap();

    let handles: Vec<ForeignHandle> = outputs.iter().map(OwnedHandle::handle).collect();
    let mut expected = vec![first];
    expected.extend(produced.lock().iter().copied());
    assert_eq!(handles, expected);
}

#[test]
fn test_uninitialized_fails_without_locking() {
    let mock = Arc::new(MockInterpreter::uninitialized());
    let bridge = Bridge::new(mock.clone(), BridgeConfig::default());
    let callback = mock.register_echo();
    assert!(!bridge.initialized());

    let mut outputs = Vec::new();
    let err = bridge
        .forward(Some(callback), &[], &[], &[], &[], &[], &mut outputs)
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotInitialized { .. }));
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let err = bridge
        .backward(Some(callback), &[], &[], &[], &[], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    assert!(bridge.get_gil().is_err());
    assert!(mock.lock_events().is_empty());
    assert!(mock.invocations().is_empty());
    assert!(outputs.is_empty());
}

#[test]
fn test_null_callback_is_a_precondition_error() {
    let (mock, bridge) = setup();
    let mut outputs = Vec::new();
    let err = bridge
        .forward(None, &[], &[], &[], &[], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err, BridgeError::NullCallback);
    assert!(mock.lock_events().is_empty());
}

#[test]
fn test_bad_layout_fails_before_invoking() {
    let (mock, bridge) = setup();
    let callback = mock.register_echo();
    let t0 = HostTensor::zeros(&[1]);
    let t1 = HostTensor::zeros(&[1]);

    let mut outputs = Vec::new();
    let err = bridge
        .forward(
            Some(callback),
            &[false, false],
            &[t0.view(), t1.view()],
            &[0, 0],
            &[object(0x10)],
            &[2],
            &mut outputs,
        )
        .unwrap_err();

    assert!(matches!(err, BridgeError::ArgumentLayout { .. }));
    assert_eq!(err.kind(), ErrorKind::Interop);
    assert!(mock.invocations().is_empty());
    assert!(mock.lock_events().is_empty());
}

#[test]
fn test_raising_callback_releases_the_lock() {
    let (mock, bridge) = setup();
    let callback = mock.register_failing(2, "RuntimeError: shape mismatch");
    let t0 = HostTensor::zeros(&[4]);

    let mut outputs = Vec::new();
    let err = bridge
        .forward(
            Some(callback),
            &[true],
            &[t0.view()],
            &[0],
            &[],
            &[],
            &mut outputs,
        )
        .unwrap_err();

    assert_eq!(
        err,
        BridgeError::CallbackFailed {
            direction: Direction::Forward,
            message: "RuntimeError: shape mismatch".to_string(),
        }
    );
    assert!(outputs.is_empty());
    assert_eq!(mock.acquisitions(), 1);
    assert_eq!(mock.releases(), 1);
    assert!(!mock.is_locked());
    assert_eq!(mock.live_objects(), 0);
}

#[test]
fn test_unknown_callback_is_reported() {
    let (mock, bridge) = setup();
    let mut outputs = Vec::new();
    let err = bridge
        .backward(Some(object(0x77)), &[], &[], &[], &[], &[], &mut outputs)
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::CallbackFailed {
            direction: Direction::Backward,
            ..
        }
    ));
    assert_eq!(mock.acquisitions(), mock.releases());
}

#[test]
fn test_get_put_round_trip() {
    let (mock, bridge) = setup();

    let token = bridge.get_gil().unwrap();
    assert_eq!(token.prior(), GilState::Unlocked);
    assert!(mock.is_locked());
    bridge.put_gil(token).unwrap();
    assert!(!mock.is_locked());

    let outer = bridge.get_gil().unwrap();
    let inner = bridge.get_gil().unwrap();
    assert_eq!(inner.prior(), GilState::Locked);
    bridge.put_gil(inner).unwrap();
    assert!(mock.is_locked());
    bridge.put_gil(outer).unwrap();
    assert!(!mock.is_locked());
}

#[test]
fn test_calls_inside_held_lock_nest() {
    let (mock, bridge) = setup();
    let callback = mock.register_echo();

    let token = bridge.get_gil().unwrap();
    let mut outputs = Vec::new();
    bridge
        .forward(Some(callback), &[], &[], &[], &[object(0x20)], &[0], &mut outputs)
        .unwrap();
    assert_eq!(mock.invocations()[0].lock_depth, 2);
    bridge.put_gil(token).unwrap();

    let thread = std::thread::current().id();
    assert_eq!(
        mock.lock_events(),
        vec![
            LockEvent::Acquired { thread, depth: 0 },
            LockEvent::Acquired { thread, depth: 1 },
            LockEvent::Released { thread, depth: 1 },
            LockEvent::Released { thread, depth: 0 },
        ]
    );
}

#[test]
fn test_callback_error_keeps_traceback_out_of_message() {
    let (mock, bridge) = setup();
    let callback = mock.register_callback(|_, _, _| {
        Err(InterpreterError::new("ValueError: nope").with_traceback("File \"op.py\", line 3"))
    });
    let mut outputs = Vec::new();
    let err = bridge
        .forward(Some(callback), &[], &[], &[], &[], &[], &mut outputs)
        .unwrap_err();
    assert_eq!(err.to_string(), "forward callback failed: ValueError: nope");
    assert_eq!(bridge.calls(), 1);
}
