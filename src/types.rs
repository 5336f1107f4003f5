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
use std::fmt;
use std::time::SystemTime;

/// Lock mode enumeration, ordered weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No access, placeholder mode
    Null,
    /// Concurrent read (unprotected read)
    ConcurrentRead,
    /// Concurrent write (unprotected write)
    ConcurrentWrite,
    /// Protected read (shared read, excludes writers)
    ProtectedRead,
    /// Protected write (single writer, concurrent readers excluded)
    ProtectedWrite,
    /// Exclusive access
    Exclusive,
    /// Group lock; members of one group cooperate outside the manager
    Group,
}

impl LockMode {
    /// Check whether two granted modes can coexist on one resource.
    ///
    /// Group locks are only compatible with other group locks; their
    /// holder set is coordinated by the owners themselves.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Null, _) | (_, Null) => true,
            (Group, Group) => true,
            (Group, _) | (_, Group) => false,
            (Exclusive, _) | (_, Exclusive) => false,
            (ConcurrentRead, _) | (_, ConcurrentRead) => true,
            (ConcurrentWrite, ConcurrentWrite) => true,
            (ConcurrentWrite, _) | (_, ConcurrentWrite) => false,
            (ProtectedRead, ProtectedRead) => true,
            _ => false,
        }
    }

    /// Whether a conflict exists between two modes
    pub fn conflicts_with(self, other: LockMode) -> bool {
        !self.compatible_with(other)
    }

    pub fn is_group(self) -> bool {
        matches!(self, LockMode::Group)
    }

    /// Modes a client may legally request; Null is reply-only
    pub fn is_requestable(self) -> bool {
        !matches!(self, LockMode::Null)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::Null => "NL",
            LockMode::ConcurrentRead => "CR",
            LockMode::ConcurrentWrite => "CW",
            LockMode::ProtectedRead => "PR",
            LockMode::ProtectedWrite => "PW",
            LockMode::Exclusive => "EX",
            LockMode::Group => "GROUP",
        };
        write!(f, "{s}")
    }
}

/// Resource type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Whole-object lock, no policy payload
    Plain,
    /// Byte-range lock over object data
    Extent,
    /// Inode-bits lock over metadata sub-objects
    Ibits,
    /// POSIX advisory file lock
    Flock,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Plain => "plain",
            ResourceType::Extent => "extent",
            ResourceType::Ibits => "ibits",
            ResourceType::Flock => "flock",
        };
        write!(f, "{s}")
    }
}

/// Policy payload carried by a lock, keyed by resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockPolicy {
    Plain,
    Extent { start: u64, end: u64 },
    Ibits { bits: u64 },
    Flock { start: u64, end: u64, owner: u64 },
}

impl LockPolicy {
    /// Whether this payload is legal for the given resource type
    pub fn matches(&self, rtype: ResourceType) -> bool {
        matches!(
            (self, rtype),
            (LockPolicy::Plain, ResourceType::Plain)
                | (LockPolicy::Extent { .. }, ResourceType::Extent)
                | (LockPolicy::Ibits { .. }, ResourceType::Ibits)
                | (LockPolicy::Flock { .. }, ResourceType::Flock)
        )
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy::Plain
    }
}

/// Composite key identifying a lockable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Object identifier
    pub id: u64,
    /// Object generation, distinguishes reused identifiers
    pub generation: u64,
}

impl ResourceKey {
    pub fn new(id: u64, generation: u64) -> Self {
        Self { id, generation }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.id, self.generation)
    }
}

/// Server-side lock cookie, opaque to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockHandle(u64);

impl LockHandle {
    pub fn new(cookie: u64) -> Self {
        Self(cookie)
    }

    pub fn cookie(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Client-side lock cookie, opaque to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle(pub u64);

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lock lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Created, queued on the resource wait list
    Waiting,
    /// Granted, on the resource grant list
    Granted,
    /// Unlinked from all lists; the record is draining
    Destroyed,
}

/// Lock flag bits, stored atomically on the lock record.
///
/// List membership (resource lists, timeout tracker) is tracked separately
/// from these bits; the bits only describe protocol state.
pub mod flags {
    /// A callback has been decided for this lock
    pub const CB_PENDING: u32 = 1 << 0;
    /// The blocking AST RPC has been handed to the dispatch pool
    pub const AST_SENT: u32 = 1 << 1;
    /// Cancel requested
    pub const CANCEL: u32 = 1 << 2;
    /// Cancel in progress on some thread
    pub const CANCELING: u32 = 1 << 3;
    /// This lock blocks another request
    pub const BL_AST: u32 = 1 << 4;
    /// Unlinked from every list; terminal
    pub const DESTROYED: u32 = 1 << 5;
    /// Client asked to cancel instead of blocking
    pub const CANCEL_ON_BLOCK: u32 = 1 << 6;
    /// Request was a resend of an earlier enqueue
    pub const RESENT: u32 = 1 << 7;
    /// Request replays a lock from before recovery
    pub const REPLAY: u32 = 1 << 8;
}

/// Enqueue request flags as sent by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueFlags {
    /// Locate the existing lock by remote handle instead of creating one
    #[serde(default)]
    pub resent: bool,
    /// Recovery replay of a previously granted lock
    #[serde(default)]
    pub replay: bool,
    /// Cancel this lock rather than sending it a blocking callback
    #[serde(default)]
    pub cancel_on_block: bool,
}

/// Intent opcode embedded in an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentOpcode {
    Lookup,
    Open,
    Getattr,
}

/// Intent-based combined operation: the policy may substitute the resource
/// the lock ultimately applies to (e.g. parent directory -> looked-up child).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub opcode: IntentOpcode,
    /// Name component being resolved, if any
    pub name: Option<String>,
    /// Key of the object the intent resolves to, when already known
    pub child: Option<ResourceKey>,
}

/// Enqueue request as decoded from the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub resource: ResourceKey,
    pub rtype: ResourceType,
    pub mode: LockMode,
    pub flags: EnqueueFlags,
    #[serde(default)]
    pub policy: LockPolicy,
    pub remote_handle: RemoteHandle,
    pub intent: Option<Intent>,
}

/// Description of a lock as carried in callback RPCs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDescription {
    pub handle: LockHandle,
    pub remote_handle: RemoteHandle,
    pub resource: ResourceKey,
    pub rtype: ResourceType,
    pub requested_mode: LockMode,
    pub granted_mode: LockMode,
    pub policy: LockPolicy,
}

/// Reply to an enqueue request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReply {
    pub handle: LockHandle,
    pub mode: LockMode,
    /// Granted synchronously; otherwise the client waits for a completion
    /// callback against `handle`
    pub granted: bool,
    pub description: LockDescription,
}

/// Reply to a convert request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvertReply {
    pub handle: LockHandle,
    pub mode: LockMode,
    /// False when the conversion would have introduced a conflict; the mode
    /// is then unchanged
    pub granted: bool,
}

/// Reply to a batched cancel request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CancelReply {
    /// Handles actually cancelled
    pub cancelled: usize,
    /// Handles that referenced no live lock; benign
    pub stale: usize,
}

/// Aggregate manager statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStats {
    pub granted_total: u64,
    pub cancelled_total: u64,
    pub timed_out_total: u64,
    pub evicted_exports: u64,
    pub blocking_asts_sent: u64,
    pub completion_asts_sent: u64,
    pub glimpse_asts_sent: u64,
    pub granted_count: usize,
    pub waiting_count: usize,
    pub resource_count: usize,
    pub last_updated: SystemTime,
}

impl Default for LockStats {
    fn default() -> Self {
        Self {
            granted_total: 0,
            cancelled_total: 0,
            timed_out_total: 0,
            evicted_exports: 0,
            blocking_asts_sent: 0,
            completion_asts_sent: 0,
            glimpse_asts_sent: 0,
            granted_count: 0,
            waiting_count: 0,
            resource_count: 0,
            last_updated: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_compatibility_matrix() {
        use LockMode::*;

        // Null is compatible with everything
        for m in [Null, ConcurrentRead, ConcurrentWrite, ProtectedRead, ProtectedWrite, Exclusive, Group] {
            assert!(Null.compatible_with(m), "NL vs {m}");
            assert!(m.compatible_with(Null), "{m} vs NL");
        }

        // Exclusive conflicts with every non-null mode
        for m in [ConcurrentRead, ConcurrentWrite, ProtectedRead, ProtectedWrite, Exclusive, Group] {
            assert!(Exclusive.conflicts_with(m), "EX vs {m}");
        }

        // Concurrent read coexists with everything but EX and GROUP
        assert!(ConcurrentRead.compatible_with(ConcurrentWrite));
        assert!(ConcurrentRead.compatible_with(ProtectedRead));
        assert!(ConcurrentRead.compatible_with(ProtectedWrite));
        assert!(ConcurrentRead.conflicts_with(Exclusive));
        assert!(ConcurrentRead.conflicts_with(Group));

        // Protected read shares with itself, excludes writers
        assert!(ProtectedRead.compatible_with(ProtectedRead));
        assert!(ProtectedRead.conflicts_with(ProtectedWrite));
        assert!(ProtectedRead.conflicts_with(ConcurrentWrite));

        // Group only pairs with group
        assert!(Group.compatible_with(Group));
        assert!(Group.conflicts_with(ProtectedWrite));

        // The matrix is symmetric
        let all = [Null, ConcurrentRead, ConcurrentWrite, ProtectedRead, ProtectedWrite, Exclusive, Group];
        for a in all {
            for b in all {
                assert_eq!(a.compatible_with(b), b.compatible_with(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_policy_matches_type() {
        assert!(LockPolicy::Plain.matches(ResourceType::Plain));
        assert!(LockPolicy::Extent { start: 0, end: 4096 }.matches(ResourceType::Extent));
        assert!(LockPolicy::Ibits { bits: 0x3 }.matches(ResourceType::Ibits));
        assert!(!LockPolicy::Plain.matches(ResourceType::Extent));
        assert!(!LockPolicy::Ibits { bits: 1 }.matches(ResourceType::Flock));
    }

    #[test]
    fn test_requestable_modes() {
        assert!(!LockMode::Null.is_requestable());
        assert!(LockMode::Exclusive.is_requestable());
        assert!(LockMode::Group.is_requestable());
    }

    #[test]
    fn test_request_serialization() {
        let request = EnqueueRequest {
            resource: ResourceKey::new(0x1000, 1),
            rtype: ResourceType::Extent,
            mode: LockMode::ProtectedWrite,
            flags: EnqueueFlags::default(),
            policy: LockPolicy::Extent { start: 0, end: u64::MAX },
            remote_handle: RemoteHandle(42),
            intent: None,
        };

        let serialized = serde_json::to_string(&request).unwrap();
        let deserialized: EnqueueRequest = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.resource, request.resource);
        assert_eq!(deserialized.mode, LockMode::ProtectedWrite);
        assert_eq!(deserialized.policy, request.policy);
    }
}
