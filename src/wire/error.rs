// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of RPC error codes carried on the wire.
///
/// Every `Close`, `OpenAck`, and locally synthesized error uses one of these.
/// There is no "extend the set" escape hatch: a new condition must be mapped
/// onto an existing code, the same contract the wire protocol itself relies
/// on for cross-version compatibility.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    None = 0,
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Canceled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }

    /// Default classification used by the retry interceptor (§4.5): errors
    /// that are safe to retry blind (no side effect was guaranteed to have
    /// landed, or the failure is transport-level).
    #[inline]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::Internal | Self::Unavailable | Self::ResourceExhausted | Self::Aborted
        )
    }

    /// Codes the hedge policy treats as fatal: abort remaining hedges rather
    /// than waiting for them to also fail.
    #[inline]
    pub fn is_hedge_fatal(self) -> bool {
        matches!(
            self,
            Self::Canceled
                | Self::DeadlineExceeded
                | Self::InvalidArgument
                | Self::NotFound
                | Self::AlreadyExists
                | Self::PermissionDenied
                | Self::Unauthenticated
                | Self::Unimplemented
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The typed error that crosses the client/server boundary: a code plus a
/// free-form message, mirroring the `errCode`/`errMessage` pair carried by
/// `Close` and `OpenAck`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(ErrorCode::None, "")
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, msg)
    }

    pub fn canceled(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, msg)
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, msg)
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, msg)
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, msg)
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// Maps a handler's `anyhow::Error` onto the wire per §7: unless the
/// implementation attaches a richer carrier (a `RpcStatus` downcast), every
/// handler failure collapses to `Internal` (Open Question (a)).
pub fn status_from_handler_error(err: &anyhow::Error) -> RpcStatus {
    if let Some(status) = err.downcast_ref::<RpcStatus>() {
        return status.clone();
    }
    RpcStatus::internal(err.to_string())
}
