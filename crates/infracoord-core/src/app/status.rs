//! Status - コーディネーターの状態ビュー（GetCurrentState の応答）

use serde::Serialize;

use crate::domain::ids::{InstanceId, TaskId};
use crate::domain::notification::{JobDetailedStatus, JobType, Notification, NotificationType};
use crate::domain::policy::JobBlockingPolicy;
use crate::domain::state::JobState;
use crate::domain::task::{InfrastructureTaskDescription, NodeTaskDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoordinatorStatus {
    pub infrastructure_task_id: TaskId,
    pub job_blocking_policy: JobBlockingPolicy,
    pub last_known_job_state: JobState,
    pub last_known_task: Option<TaskView>,
    pub notification: Option<NotificationView>,
    pub is_notification_available: bool,
    pub nodes_impacted_count: i64,
    pub mode: &'static str,
    pub last_hit_breakpoint: Option<String>,
    pub continue_past_breakpoint: Option<String>,
}

impl CoordinatorStatus {
    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskView {
    pub instance_id: InstanceId,
    pub node_tasks: Vec<NodeTaskDescription>,
}

impl From<&InfrastructureTaskDescription> for TaskView {
    fn from(task: &InfrastructureTaskDescription) -> Self {
        Self {
            instance_id: task.instance_id,
            node_tasks: task.node_tasks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationView {
    pub notification_type: NotificationType,
    pub job_id: String,
    pub target_ud: i32,
    pub job_type: JobType,
    pub detailed_status: JobDetailedStatus,
    pub impacted_instances: usize,
}

impl From<&Notification> for NotificationView {
    fn from(n: &Notification) -> Self {
        Self {
            notification_type: n.notification_type,
            job_id: n.active_job_id.clone(),
            target_ud: n.active_job_step_target_ud,
            job_type: n.active_job_type,
            detailed_status: n.active_job_detailed_status,
            impacted_instances: n.impacted_instances.len(),
        }
    }
}
