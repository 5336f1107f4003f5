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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdlmConfig {
    /// How long a client gets to answer a blocking callback before its
    /// lock is considered expired
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout: Duration,

    /// Deadline for a completion callback RPC
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout: Duration,

    /// Deadline for a synchronous glimpse callback
    #[serde(default = "default_glimpse_timeout")]
    pub glimpse_timeout: Duration,

    /// Extension granted to a busy lock instead of expiring it
    #[serde(default = "default_busy_extension")]
    pub busy_extension: Duration,

    /// Bound on the per-export blocked-lock list
    #[serde(default = "default_max_blocked_per_export")]
    pub max_blocked_per_export: usize,

    /// Callback dispatch pool configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Callback dispatch pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Workers started with the pool
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound on pool growth
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Combined queue depth beyond which the pool grows
    #[serde(default = "default_grow_threshold")]
    pub grow_threshold: usize,
}

impl Default for LdlmConfig {
    fn default() -> Self {
        Self {
            blocking_timeout: default_blocking_timeout(),
            completion_timeout: default_completion_timeout(),
            glimpse_timeout: default_glimpse_timeout(),
            busy_extension: default_busy_extension(),
            max_blocked_per_export: default_max_blocked_per_export(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            grow_threshold: default_grow_threshold(),
        }
    }
}

// Default value functions
fn default_blocking_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_glimpse_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_busy_extension() -> Duration {
    Duration::from_secs(10)
}

fn default_max_blocked_per_export() -> usize {
    1024
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    16
}

fn default_grow_threshold() -> usize {
    8
}

impl LdlmConfig {
    /// Small configuration for tests and embedded use
    pub fn minimal() -> Self {
        Self {
            blocking_timeout: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(1),
            glimpse_timeout: Duration::from_millis(500),
            busy_extension: Duration::from_secs(1),
            max_blocked_per_export: 64,
            dispatch: DispatchConfig {
                min_workers: 1,
                max_workers: 2,
                grow_threshold: 4,
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.blocking_timeout.is_zero() {
            return Err(crate::error::LockError::configuration("Blocking timeout must be greater than zero"));
        }

        if self.completion_timeout.is_zero() {
            return Err(crate::error::LockError::configuration(
                "Completion timeout must be greater than zero",
            ));
        }

        if self.glimpse_timeout.is_zero() {
            return Err(crate::error::LockError::configuration("Glimpse timeout must be greater than zero"));
        }

        if self.dispatch.min_workers == 0 {
            return Err(crate::error::LockError::configuration("Dispatch pool needs at least one worker"));
        }

        if self.dispatch.max_workers < self.dispatch.min_workers {
            return Err(crate::error::LockError::configuration(
                "Dispatch max workers must be >= min workers",
            ));
        }

        Ok(())
    }
}
