//! Notification - クラウド基盤からのメンテナンス通知（読み取り専用）

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    StartJobStep,
    CompleteJobStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    DeploymentUpdateJob,
    PlatformUpdateJob,
    DeploymentMaintenanceJob,
    PlatformMaintenanceJob,
    PlatformRepairJob,
}

impl JobType {
    pub fn is_update(self) -> bool {
        matches!(self, JobType::DeploymentUpdateJob | JobType::PlatformUpdateJob)
    }

    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            JobType::DeploymentMaintenanceJob
                | JobType::PlatformMaintenanceJob
                | JobType::PlatformRepairJob
        )
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImpactReason {
    Unknown,
    AddInstance,
    ConfigurationUpdate,
    ApplicationUpdate,
    OSUpdate,
    Reboot,
    ReimageOS,
    HostReboot,
    Relocation,
    RepaveData,
    HostRepaveData,
    RemoveInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobDetailedStatus {
    Unknown,
    WaitingForStartStepAcknowledgement,
    Executing,
    WaitingForCompleteStepAcknowledgement,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactedInstance {
    pub instance_name: String,
    pub impact_reasons: Vec<ImpactReason>,
}

impl ImpactedInstance {
    pub fn new(instance_name: impl Into<String>, impact_reasons: Vec<ImpactReason>) -> Self {
        Self {
            instance_name: instance_name.into(),
            impact_reasons,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub notification_type: NotificationType,
    pub active_job_id: String,
    pub active_job_step_target_ud: i32,
    pub active_job_type: JobType,
    pub active_job_detailed_status: JobDetailedStatus,
    pub impacted_instances: Vec<ImpactedInstance>,
    pub active_job_includes_topology_change: bool,
    pub requires_manual_approval: bool,
}

impl Notification {
    pub fn is_for_job_step(&self, job_id: &str, target_ud: i32) -> bool {
        self.active_job_id == job_id && self.active_job_step_target_ud == target_ud
    }

    pub fn is_start(&self) -> bool {
        self.notification_type == NotificationType::StartJobStep
    }

    pub fn is_complete(&self) -> bool {
        self.notification_type == NotificationType::CompleteJobStep
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} job={} ud={} type={} status={:?} instances={}",
            self.notification_type,
            self.active_job_id,
            self.active_job_step_target_ud,
            self.active_job_type,
            self.active_job_detailed_status,
            self.impacted_instances.len()
        )
    }
}

/// Translate a role instance name (`WebRole_IN_3`) to a node name (`_WebRole_3`).
///
/// Names without the `_IN_` marker are already node names.
pub fn role_instance_to_node_name(instance_name: &str) -> String {
    match instance_name.rsplit_once("_IN_") {
        Some((role, index)) if !role.is_empty() && !index.is_empty() => {
            format!("_{role}_{index}")
        }
        _ => instance_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::role_instance("WebRole_IN_3", "_WebRole_3")]
    #[case::underscored_role("Front_End_IN_0", "_Front_End_0")]
    #[case::plain_node("NodeA", "NodeA")]
    #[case::missing_index("WebRole_IN_", "WebRole_IN_")]
    fn translates_role_instance_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(role_instance_to_node_name(input), expected);
    }

    #[test]
    fn job_type_groups() {
        assert!(JobType::PlatformUpdateJob.is_update());
        assert!(!JobType::PlatformUpdateJob.is_maintenance());
        assert!(JobType::PlatformRepairJob.is_maintenance());
    }
}
