//! Infrastructure task descriptions and node tasks.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::errors::CoordinatorError;
use super::ids::{InstanceId, PartitionId, TaskId};
use super::state::InfrastructureTaskState;

/// Action requested on a single node.
///
/// Severity is defined by [`NodeTask::severity_rank`], not by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTask {
    Invalid,
    Restart,
    Relocate,
    Remove,
}

impl NodeTask {
    pub const fn severity_rank(self) -> u8 {
        match self {
            NodeTask::Invalid => 0,
            NodeTask::Restart => 1,
            NodeTask::Relocate => 2,
            NodeTask::Remove => 3,
        }
    }

    pub fn most_severe(self, other: NodeTask) -> NodeTask {
        if other > self { other } else { self }
    }
}

impl PartialOrd for NodeTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity_rank().cmp(&other.severity_rank())
    }
}

impl fmt::Display for NodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeTask::Invalid => "Invalid",
            NodeTask::Restart => "Restart",
            NodeTask::Relocate => "Relocate",
            NodeTask::Remove => "Remove",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeTask {
    type Err = CoordinatorError;

    /// Only the actionable types parse; `Invalid` is never accepted from text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "restart" => Ok(NodeTask::Restart),
            "relocate" => Ok(NodeTask::Relocate),
            "remove" => Ok(NodeTask::Remove),
            _ => Err(CoordinatorError::CommandParse(format!(
                "Invalid node task type '{s}' (expected restart, relocate or remove)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeTaskDescription {
    pub node_name: String,
    pub task_type: NodeTask,
}

impl NodeTaskDescription {
    pub fn new(node_name: impl Into<String>, task_type: NodeTask) -> Self {
        Self {
            node_name: node_name.into(),
            task_type,
        }
    }
}

impl fmt::Display for NodeTaskDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_name, self.task_type)
    }
}

/// Task submitted to the cluster manager. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureTaskDescription {
    pub partition_id: PartitionId,
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    pub node_tasks: Vec<NodeTaskDescription>,
}

impl InfrastructureTaskDescription {
    pub fn new(
        partition_id: PartitionId,
        task_id: TaskId,
        instance_id: InstanceId,
        node_tasks: Vec<NodeTaskDescription>,
    ) -> Self {
        Self {
            partition_id,
            task_id,
            instance_id,
            node_tasks,
        }
    }
}

impl fmt::Display for InfrastructureTaskDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} [", self.task_id, self.instance_id)?;
        for (i, t) in self.node_tasks.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str("]")
    }
}

/// One row of a cluster manager query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureTaskResultItem {
    pub description: InfrastructureTaskDescription,
    pub state: InfrastructureTaskState,
}

fn sorted(tasks: &[NodeTaskDescription]) -> Vec<(&str, u8)> {
    let mut keys: Vec<(&str, u8)> = tasks
        .iter()
        .map(|t| (t.node_name.as_str(), t.task_type.severity_rank()))
        .collect();
    keys.sort_unstable();
    keys
}

/// Order-insensitive comparison; membership and multiplicity must match.
pub fn node_tasks_equal(a: &[NodeTaskDescription], b: &[NodeTaskDescription]) -> bool {
    a.len() == b.len() && sorted(a) == sorted(b)
}

/// Like [`node_tasks_equal`], except that `Remove` entries of `old` may be
/// missing from `new`.
///
/// The platform drops removed instances from the impact list once a job is
/// executing. A node that was `Remove` in `old` and shows up in `new` with a
/// different type is still a mismatch.
pub fn node_tasks_equal_ignoring_missing_removals(
    old: &[NodeTaskDescription],
    new: &[NodeTaskDescription],
) -> bool {
    let removed: Vec<&str> = old
        .iter()
        .filter(|t| t.task_type == NodeTask::Remove)
        .map(|t| t.node_name.as_str())
        .collect();

    let old_kept: Vec<NodeTaskDescription> = old
        .iter()
        .filter(|t| t.task_type != NodeTask::Remove)
        .cloned()
        .collect();
    let new_kept: Vec<NodeTaskDescription> = new
        .iter()
        .filter(|t| !(t.task_type == NodeTask::Remove && removed.contains(&t.node_name.as_str())))
        .cloned()
        .collect();

    node_tasks_equal(&old_kept, &new_kept)
}
