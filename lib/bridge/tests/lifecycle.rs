// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use interop_bridge::lifecycle;
use interop_bridge::testing::MockInterpreter;
use interop_bridge::{BridgeConfig, BridgeError};

// The installed bridge is process-wide, so the whole lifecycle runs in one test.
#[test]
fn test_install_current_shutdown() {
    assert!(!lifecycle::is_installed());
    assert_eq!(lifecycle::current().unwrap_err(), BridgeError::NotInstalled);
    assert_eq!(lifecycle::shutdown().unwrap_err(), BridgeError::NotInstalled);

    let mock = Arc::new(MockInterpreter::new());
    let bridge = lifecycle::initialize(mock.clone(), BridgeConfig::default()).unwrap();
    assert!(lifecycle::is_installed());
    assert!(Arc::ptr_eq(&bridge, &lifecycle::current().unwrap()));

    let err = lifecycle::initialize(mock.clone(), BridgeConfig::default()).unwrap_err();
    assert_eq!(err, BridgeError::AlreadyInstalled);

    let callback = mock.register_echo();
    let object = mock.new_object();
    let mut outputs = Vec::new();
    lifecycle::current()
        .unwrap()
        .forward(Some(callback), &[], &[], &[], &[object], &[0], &mut outputs)
        .unwrap();
    assert_eq!(outputs.len(), 1);

    let removed = lifecycle::shutdown().unwrap();
    assert!(Arc::ptr_eq(&bridge, &removed));
    assert!(!lifecycle::is_installed());

    // handles outlive the slot and still release through their bridge
    drop(outputs);
    assert_eq!(mock.released().len(), 1);

    // an uninitialized interpreter installs; calls fail later
    let failed = lifecycle::initialize(
        Arc::new(MockInterpreter::uninitialized()),
        BridgeConfig::default(),
    )
    .unwrap();
    assert!(!failed.initialized());
    lifecycle::shutdown().unwrap();
}
