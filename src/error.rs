// Copyright 2025 LDLM Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::types::LockHandle;
use std::time::Duration;
use thiserror::Error;

/// Lock manager error types
#[derive(Error, Debug)]
pub enum LockError {
    /// Malformed request: bad resource type, out-of-range mode, policy
    /// payload not matching the resource type. Rejected synchronously,
    /// never retried.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A handle referenced no live lock. Benign: the lock was already
    /// dropped, e.g. after an eviction.
    #[error("Stale lock handle: {handle}")]
    StaleHandle { handle: LockHandle },

    /// The request referenced a disconnected or unknown export
    #[error("Export not connected: {export}")]
    NotConnected { export: String },

    /// A callback RPC did not complete before its deadline
    #[error("Callback timed out for lock {handle} after {timeout:?}")]
    CallbackTimeout { handle: LockHandle, timeout: Duration },

    /// A callback RPC failed with a benign, lock-local error
    #[error("Callback failed for lock {handle}: {message}")]
    CallbackFailed { handle: LockHandle, message: String },

    /// A callback RPC failed in a way that indicts the client itself;
    /// the owning export is scheduled for eviction
    #[error("Client unreachable on export {export}: {message}")]
    ClientUnreachable { export: String, message: String },

    /// The manager is stopping or not started
    #[error("Lock manager is shut down")]
    ShutDown,

    /// Teardown found resources still referenced; a consistency bug
    #[error("Teardown consistency violation: {count} resources still referenced")]
    ResourcesBusy { count: usize },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LockError {
    /// Create protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create stale handle error
    pub fn stale_handle(handle: LockHandle) -> Self {
        Self::StaleHandle { handle }
    }

    /// Create not connected error
    pub fn not_connected(export: impl Into<String>) -> Self {
        Self::NotConnected { export: export.into() }
    }

    /// Create callback timeout error
    pub fn callback_timeout(handle: LockHandle, timeout: Duration) -> Self {
        Self::CallbackTimeout { handle, timeout }
    }

    /// Create callback failure error
    pub fn callback_failed(handle: LockHandle, message: impl Into<String>) -> Self {
        Self::CallbackFailed {
            handle,
            message: message.into(),
        }
    }

    /// Create client unreachable error
    pub fn client_unreachable(export: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClientUnreachable {
            export: export.into(),
            message: message.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Benign "already gone" outcome: callers short-circuit, never fail hard
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleHandle { .. })
    }

    /// Whether a callback failure indicts the client itself, so the owning
    /// export must be evicted rather than just the one lock cancelled
    pub fn requires_eviction(&self) -> bool {
        matches!(self, Self::CallbackTimeout { .. } | Self::ClientUnreachable { .. })
    }

    /// Fatal internal consistency violations that must never be ignored
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourcesBusy { .. })
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: format!("unparsable request: {err}"),
        }
    }
}
