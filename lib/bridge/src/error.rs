// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::interpreter::Direction;
use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The call was attempted in a state where it can never succeed.
    Precondition,
    /// Marshaling across the boundary or the callback itself failed.
    Interop,
    /// The global execution lock could not be obtained or was misused.
    Resource,
}

/// Errors that can occur while bridging a call into the embedded interpreter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Callback handle is null")]
    NullCallback,

    #[error("Embedded interpreter '{interpreter}' is not initialized")]
    NotInitialized { interpreter: String },

    #[error("No interop bridge is installed")]
    NotInstalled,

    #[error("An interop bridge is already installed")]
    AlreadyInstalled,

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Invalid argument layout: {reason}")]
    ArgumentLayout { reason: String },

    #[error("{direction} callback failed: {message}")]
    CallbackFailed { direction: Direction, message: String },

    #[error("Invalid handle: {reason}")]
    InvalidHandle { reason: String },

    #[error("Execution lock unavailable: {reason}")]
    LockUnavailable { reason: String },

    #[error("Execution lock misuse: {reason}")]
    LockMisuse { reason: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NullCallback
            | BridgeError::NotInitialized { .. }
            | BridgeError::NotInstalled
            | BridgeError::AlreadyInstalled
            | BridgeError::Config { .. } => ErrorKind::Precondition,
            BridgeError::ArgumentLayout { .. }
            | BridgeError::CallbackFailed { .. }
            | BridgeError::InvalidHandle { .. } => ErrorKind::Interop,
            BridgeError::LockUnavailable { .. } | BridgeError::LockMisuse { .. } => {
                ErrorKind::Resource
            }
        }
    }

    pub(crate) fn layout(reason: impl Into<String>) -> Self {
        BridgeError::ArgumentLayout {
            reason: reason.into(),
        }
    }

    pub(crate) fn misuse(reason: impl Into<String>) -> Self {
        BridgeError::LockMisuse {
            reason: reason.into(),
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for BridgeError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        BridgeError::Config {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BridgeError::NullCallback.kind(), ErrorKind::Precondition);
        assert_eq!(
            BridgeError::NotInitialized {
                interpreter: "mock".into()
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(BridgeError::layout("gap").kind(), ErrorKind::Interop);
        assert_eq!(
            BridgeError::CallbackFailed {
                direction: Direction::Backward,
                message: "boom".into()
            }
            .kind(),
            ErrorKind::Interop
        );
        assert_eq!(BridgeError::misuse("twice").kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_callback_failure_message_names_direction() {
        let err = BridgeError::CallbackFailed {
            direction: Direction::Forward,
            message: "ValueError: bad shape".into(),
        };
        assert_eq!(err.to_string(), "forward callback failed: ValueError: bad shape");
    }
}
