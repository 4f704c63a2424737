// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal stand-in for "the caller's context" that spec.md refers to
//! throughout (§4.2 "context cancel", §4.6 "the caller's context does not
//! already carry a deadline", §5 "Every call observes its context"). Rust has
//! no built-in context type; this is the idiomatic tokio shape — a deadline
//! plus a `CancellationToken` — used the same way the teacher's state
//! machines race a `CancellationToken` against I/O (see `io_with_timeout` in
//! `client/common.rs`).

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wire::error::{ErrorCode, RpcStatus};

#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Applies `timeout` only if this context carries no deadline of its own
    /// — the exact rule service config timeouts must follow (§4.6).
    pub fn with_fallback_timeout(&self, timeout: Duration) -> Self {
        if self.deadline.is_some() {
            self.clone()
        } else {
            Self {
                deadline: Some(Instant::now() + timeout),
                cancel: self.cancel.clone(),
            }
        }
    }

    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves to the reason this context ended, suspending until either
    /// the deadline elapses or `cancel()` fires. Never resolves if neither
    /// is ever triggered — callers race this against real work.
    pub async fn done(&self) -> RpcStatus {
        match self.deadline {
            Some(d) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => RpcStatus::canceled("context canceled"),
                    _ = tokio::time::sleep_until(d) => RpcStatus::deadline_exceeded("context deadline exceeded"),
                }
            },
            None => {
                self.cancel.cancelled().await;
                RpcStatus::canceled("context canceled")
            },
        }
    }

    /// `true` once either the deadline has passed or cancel has fired.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn err_if_done(&self) -> Option<RpcStatus> {
        if self.is_cancelled() {
            return Some(RpcStatus::new(ErrorCode::Canceled, "context canceled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(RpcStatus::new(ErrorCode::DeadlineExceeded, "context deadline exceeded"));
        }
        None
    }
}
