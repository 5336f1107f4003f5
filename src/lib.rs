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

//! Server-side distributed lock manager.
//!
//! Clients enqueue mode-typed locks against named resources; the server
//! grants compatible requests immediately and queues the rest, revoking
//! conflicting holders through asynchronous callbacks (ASTs). Holders that
//! never answer are timed out and their whole connection is evicted, so one
//! sick client cannot wedge a resource forever.
//!
//! The moving parts:
//! - [`registry::LockRegistry`] owns resources, grant/wait lists and handle
//!   indexes
//! - [`dispatch::AstDispatcher`] runs callback RPCs on a growable worker
//!   pool with a priority lane
//! - [`tracker::WaitingTracker`] is the single timer watching every
//!   unanswered callback
//! - [`reaper::Reaper`] turns expiries into at-most-once export evictions
//! - [`manager::LockManager`] glues them together behind the
//!   enqueue/convert/cancel/glimpse surface
//!
//! ```no_run
//! use std::sync::Arc;
//! use ldlm::{LdlmConfig, LockManager, LoopbackClient};
//!
//! # async fn demo() -> ldlm::Result<()> {
//! let manager = LockManager::new(LdlmConfig::default(), Arc::new(LoopbackClient::new()))?;
//! manager.start()?;
//! // ... serve enqueue/convert/cancel traffic ...
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod manager;
pub mod reaper;
pub mod registry;
pub mod resource;
pub mod tracker;
pub mod types;

pub use client::{CallbackClient, LoopbackClient, ResendObserver};
pub use config::{DispatchConfig, LdlmConfig};
pub use dispatch::{AstDispatcher, AstHooks, QueueClass, WorkKind};
pub use error::{LockError, Result};
pub use export::{Export, ExportRegistry};
pub use manager::{ChildIntent, IntentPolicy, LockManager, LockManagerBuilder};
pub use reaper::{ExportEvictor, Reaper};
pub use registry::{GrantOutcome, LockRegistry};
pub use resource::{Lock, Resource};
pub use tracker::{BusyPolicy, NeverBusy, WaitingTracker};
pub use types::{
    flags, CancelReply, ConvertReply, EnqueueFlags, EnqueueReply, EnqueueRequest, Intent, IntentOpcode,
    LockDescription, LockHandle, LockMode, LockPolicy, LockState, LockStats, RemoteHandle, ResourceKey, ResourceType,
};

/// Crate version, as baked in at compile time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
