// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Opaque references into the interpreter's object space.
//!
//! The bridge never dereferences these. A [`ForeignHandle`] is a borrowed
//! reference, valid for as long as its owner says so. An [`OwnedHandle`] is a
//! reference the caller is responsible for, released through the
//! interpreter's own [`ReleaseHook`] when dropped.

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};

/// What a handle points at on the interpreter side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// A callable implementing a custom operator.
    Callback,
    /// Any other interpreter value, including produced tensors.
    Object,
}

/// Borrowed, tagged reference to an interpreter value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignHandle {
    addr: NonZeroUsize,
    kind: HandleKind,
}

impl ForeignHandle {
    pub fn new(addr: NonZeroUsize, kind: HandleKind) -> Self {
        Self { addr, kind }
    }

    /// Wrap a raw pointer handed over by the interpreter or the engine.
    /// Returns `None` for null.
    pub fn from_raw(ptr: *mut c_void, kind: HandleKind) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(|addr| Self { addr, kind })
    }

    /// Callback handle from a raw pointer; null is a precondition failure.
    pub fn callback(ptr: *mut c_void) -> BridgeResult<Self> {
        Self::from_raw(ptr, HandleKind::Callback).ok_or(BridgeError::NullCallback)
    }

    /// Object handle from a raw pointer; null is rejected.
    pub fn object(ptr: *mut c_void) -> BridgeResult<Self> {
        Self::from_raw(ptr, HandleKind::Object).ok_or_else(|| BridgeError::InvalidHandle {
            reason: "object handle is null".to_string(),
        })
    }

    pub fn addr(&self) -> usize {
        self.addr.get()
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.addr.get() as *mut c_void
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x})", self.kind, self.addr)
    }
}

/// Hands a produced handle back to the runtime that created it.
pub trait ReleaseHook: Send + Sync {
    fn release(&self, handle: ForeignHandle);
}

/// A handle whose ownership has been transferred to the holder.
///
/// Dropping it releases the underlying value through its hook;
/// [`OwnedHandle::into_raw`] moves ownership out instead.
pub struct OwnedHandle {
    handle: ForeignHandle,
    hook: Option<Arc<dyn ReleaseHook>>,
}

impl OwnedHandle {
    pub fn new(handle: ForeignHandle, hook: Arc<dyn ReleaseHook>) -> Self {
        Self {
            handle,
            hook: Some(hook),
        }
    }

    pub fn handle(&self) -> ForeignHandle {
        self.handle
    }

    /// Give up ownership without releasing. The caller must eventually
    /// release the pointer through the interpreter's own deallocation path.
    pub fn into_raw(mut self) -> *mut c_void {
        self.hook = None;
        self.handle.as_ptr()
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("handle", &self.handle)
            .field("owned", &self.hook.is_some())
            .finish()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            tracing::trace!(handle = ?self.handle, "releasing owned handle");
            hook.release(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<ForeignHandle>>,
    }

    impl ReleaseHook for Recorder {
        fn release(&self, handle: ForeignHandle) {
            self.released.lock().push(handle);
        }
    }

    #[test]
    fn test_null_pointers_are_rejected() {
        assert!(ForeignHandle::from_raw(std::ptr::null_mut(), HandleKind::Object).is_none());
        assert_eq!(
            ForeignHandle::callback(std::ptr::null_mut()),
            Err(BridgeError::NullCallback)
        );
        assert!(matches!(
            ForeignHandle::object(std::ptr::null_mut()),
            Err(BridgeError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_raw_round_trip() {
        let handle = ForeignHandle::object(0x1000 as *mut c_void).unwrap();
        assert_eq!(handle.addr(), 0x1000);
        assert_eq!(handle.as_ptr() as usize, 0x1000);
        assert_eq!(handle.kind(), HandleKind::Object);
        assert_eq!(format!("{handle:?}"), "Object(0x1000)");
    }

    #[test]
    fn test_drop_releases_once() {
        let recorder = Arc::new(Recorder::default());
        let handle = ForeignHandle::object(0x2000 as *mut c_void).unwrap();
        drop(OwnedHandle::new(handle, recorder.clone()));
        assert_eq!(*recorder.released.lock(), vec![handle]);
    }

    #[test]
    fn test_into_raw_skips_release() {
        let recorder = Arc::new(Recorder::default());
        let handle = ForeignHandle::object(0x3000 as *mut c_void).unwrap();
        let raw = OwnedHandle::new(handle, recorder.clone()).into_raw();
        assert_eq!(raw as usize, 0x3000);
        assert!(recorder.released.lock().is_empty());
    }
}
