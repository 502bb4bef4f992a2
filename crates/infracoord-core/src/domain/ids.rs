//! Identifiers used on the cluster manager protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit instance identifier: `epoch << 32 | counter`.
///
/// Instance ids order requests that share a [`TaskId`]. A larger id always
/// supersedes a smaller one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(i64);

impl InstanceId {
    pub const ZERO: InstanceId = InstanceId(0);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn from_parts(epoch: i32, counter: u32) -> Self {
        Self((i64::from(epoch) << 32) | i64::from(counter))
    }

    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    pub const fn epoch(&self) -> i32 {
        (self.0 >> 32) as i32
    }

    pub const fn counter(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Stable identifier of an infrastructure task, e.g. `Coordinator/tenant/partition`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `{prefix}/{tenant}/{partition}`
    pub fn for_coordinator(prefix: &str, tenant: &str, partition: &PartitionId) -> Self {
        Self(format!("{prefix}/{tenant}/{partition}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
