//! Impact translation: notification impact reasons -> node tasks.

use std::collections::HashMap;

use super::errors::CoordinatorError;
use super::ids::{InstanceId, PartitionId, TaskId};
use super::notification::{ImpactReason, JobType, Notification, role_instance_to_node_name};
use super::task::{InfrastructureTaskDescription, NodeTask, NodeTaskDescription};

#[derive(Debug, Clone)]
pub struct ImpactTranslator {
    overrides: HashMap<ImpactReason, NodeTask>,
    minimum_platform_update_impact: NodeTask,
}

impl Default for ImpactTranslator {
    fn default() -> Self {
        Self::new(HashMap::new(), NodeTask::Restart)
    }
}

impl ImpactTranslator {
    pub fn new(
        overrides: HashMap<ImpactReason, NodeTask>,
        minimum_platform_update_impact: NodeTask,
    ) -> Self {
        Self {
            overrides,
            minimum_platform_update_impact,
        }
    }

    pub fn node_task_for_reason(&self, reason: ImpactReason) -> Result<NodeTask, CoordinatorError> {
        if let Some(task) = self.overrides.get(&reason) {
            return Ok(*task);
        }

        match reason {
            ImpactReason::AddInstance => Ok(NodeTask::Invalid),
            ImpactReason::ConfigurationUpdate
            | ImpactReason::ApplicationUpdate
            | ImpactReason::OSUpdate
            | ImpactReason::Reboot
            | ImpactReason::ReimageOS
            | ImpactReason::HostReboot => Ok(NodeTask::Restart),
            ImpactReason::Relocation | ImpactReason::RepaveData | ImpactReason::HostRepaveData => {
                Ok(NodeTask::Relocate)
            }
            ImpactReason::RemoveInstance => Ok(NodeTask::Remove),
            ImpactReason::Unknown => Err(CoordinatorError::Translation(
                "unknown impact reason".to_string(),
            )),
        }
    }

    /// Most severe task over all reasons of one instance.
    pub fn node_task_for_reasons(
        &self,
        job_type: JobType,
        reasons: &[ImpactReason],
    ) -> Result<NodeTask, CoordinatorError> {
        if reasons.is_empty() {
            return if job_type == JobType::PlatformUpdateJob {
                Ok(self.minimum_platform_update_impact)
            } else {
                Err(CoordinatorError::Translation(format!(
                    "no impact reasons for a {job_type}"
                )))
            };
        }

        let mut task = NodeTask::Invalid;
        for reason in reasons {
            task = task.most_severe(self.node_task_for_reason(*reason)?);
        }
        Ok(task)
    }

    /// Build the task description for `notification`. Instances whose
    /// reasons only add capacity produce no node task.
    pub fn translate(
        &self,
        notification: &Notification,
        partition_id: &PartitionId,
        task_id: &TaskId,
        instance_id: InstanceId,
    ) -> Result<InfrastructureTaskDescription, CoordinatorError> {
        let mut node_tasks = Vec::with_capacity(notification.impacted_instances.len());
        for instance in &notification.impacted_instances {
            let task = self
                .node_task_for_reasons(notification.active_job_type, &instance.impact_reasons)
                .map_err(|e| {
                    CoordinatorError::Translation(format!("instance {}: {e}", instance.instance_name))
                })?;
            if task != NodeTask::Invalid {
                node_tasks.push(NodeTaskDescription::new(
                    role_instance_to_node_name(&instance.instance_name),
                    task,
                ));
            }
        }

        Ok(InfrastructureTaskDescription::new(
            partition_id.clone(),
            task_id.clone(),
            instance_id,
            node_tasks,
        ))
    }
}
