//! RecordingInfrastructureAgent - 開発用のクラスタマネージャー
//!
//! Keeps a task table the way the cluster manager does and records every
//! call. A driver (test or demo) plays the cluster manager's side by
//! reading [`RecordingInfrastructureAgent::pending_acknowledgements`] and
//! calling back into the coordinator.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, PartitionId, TaskId};
use crate::domain::state::InfrastructureTaskState;
use crate::domain::task::{
    InfrastructureTaskDescription, InfrastructureTaskResultItem, NodeTaskDescription,
};
use crate::ports::InfrastructureAgent;

#[derive(Default)]
struct AgentState {
    tasks: BTreeMap<TaskId, InfrastructureTaskResultItem>,
    start_calls: Vec<InfrastructureTaskDescription>,
    finish_calls: Vec<(TaskId, InstanceId)>,
    query_count: usize,
    start_failures: VecDeque<CoordinatorError>,
    finish_failures: VecDeque<CoordinatorError>,
    query_failures: VecDeque<CoordinatorError>,
    node_task_rewrite: Option<Vec<NodeTaskDescription>>,
}

/// Stand-in for the cluster manager of one partition.
pub struct RecordingInfrastructureAgent {
    partition_id: PartitionId,
    state: Mutex<AgentState>,
}

impl RecordingInfrastructureAgent {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            state: Mutex::new(AgentState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_start(&self, err: CoordinatorError) {
        self.lock().start_failures.push_back(err);
    }

    pub fn fail_next_finish(&self, err: CoordinatorError) {
        self.lock().finish_failures.push_back(err);
    }

    pub fn fail_next_query(&self, err: CoordinatorError) {
        self.lock().query_failures.push_back(err);
    }

    /// Store `node_tasks` instead of the submitted ones on the next starts.
    pub fn rewrite_node_tasks_on_start(&self, node_tasks: Vec<NodeTaskDescription>) {
        self.lock().node_task_rewrite = Some(node_tasks);
    }

    /// Seed the task table, e.g. to simulate a task left over from a previous primary.
    pub fn set_task(&self, description: InfrastructureTaskDescription, state: InfrastructureTaskState) {
        self.lock().tasks.insert(
            description.task_id.clone(),
            InfrastructureTaskResultItem { description, state },
        );
    }

    pub fn start_calls(&self) -> Vec<InfrastructureTaskDescription> {
        self.lock().start_calls.clone()
    }

    pub fn finish_calls(&self) -> Vec<(TaskId, InstanceId)> {
        self.lock().finish_calls.clone()
    }

    pub fn query_count(&self) -> usize {
        self.lock().query_count
    }

    pub fn total_calls(&self) -> usize {
        let state = self.lock();
        state.start_calls.len() + state.finish_calls.len() + state.query_count
    }

    pub fn task_state(&self, task_id: &TaskId) -> Option<InfrastructureTaskState> {
        self.lock().tasks.get(task_id).map(|item| item.state)
    }

    /// Tasks waiting for an acknowledgement from their owner.
    pub fn pending_acknowledgements(&self) -> Vec<InfrastructureTaskResultItem> {
        self.lock()
            .tasks
            .values()
            .filter(|item| {
                matches!(
                    item.state,
                    InfrastructureTaskState::PreAckPending | InfrastructureTaskState::PostAckPending
                )
            })
            .cloned()
            .collect()
    }

    /// Advance an acknowledged task: PreAckPending -> PreAcked, PostAckPending -> PostAcked.
    pub fn mark_acknowledged(&self, task_id: &TaskId) {
        if let Some(item) = self.lock().tasks.get_mut(task_id) {
            item.state = match item.state {
                InfrastructureTaskState::PreAckPending => InfrastructureTaskState::PreAcked,
                InfrastructureTaskState::PostAckPending => InfrastructureTaskState::PostAcked,
                other => other,
            };
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), CoordinatorError> {
    if cancel.is_cancelled() {
        Err(CoordinatorError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl InfrastructureAgent for RecordingInfrastructureAgent {
    async fn start_infrastructure_task(
        &self,
        description: &InfrastructureTaskDescription,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        check_cancelled(cancel)?;
        let mut state = self.lock();
        state.start_calls.push(description.clone());
        if let Some(err) = state.start_failures.pop_front() {
            return Err(err);
        }

        let mut stored = description.clone();
        if let Some(rewrite) = &state.node_task_rewrite {
            stored.node_tasks = rewrite.clone();
        }

        let keep_existing = state.tasks.get(&description.task_id).is_some_and(|existing| {
            existing.description.instance_id > description.instance_id
                || (existing.description.instance_id == description.instance_id
                    && matches!(
                        existing.state,
                        InfrastructureTaskState::PreAckPending | InfrastructureTaskState::PreAcked
                    ))
        });
        if !keep_existing {
            state.tasks.insert(
                description.task_id.clone(),
                InfrastructureTaskResultItem {
                    description: stored,
                    state: InfrastructureTaskState::PreAckPending,
                },
            );
        }
        Ok(())
    }

    async fn finish_infrastructure_task(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        check_cancelled(cancel)?;
        let mut state = self.lock();
        state.finish_calls.push((task_id.clone(), instance_id));
        if let Some(err) = state.finish_failures.pop_front() {
            return Err(err);
        }

        match state.tasks.get_mut(task_id) {
            Some(item) if item.description.instance_id <= instance_id => {
                item.description.instance_id = instance_id;
                if item.state != InfrastructureTaskState::PostAcked {
                    item.state = InfrastructureTaskState::PostAckPending;
                }
            }
            Some(_) => {}
            None => {
                state.tasks.insert(
                    task_id.clone(),
                    InfrastructureTaskResultItem {
                        description: InfrastructureTaskDescription::new(
                            self.partition_id.clone(),
                            task_id.clone(),
                            instance_id,
                            Vec::new(),
                        ),
                        state: InfrastructureTaskState::PostAckPending,
                    },
                );
            }
        }
        Ok(())
    }

    async fn query_infrastructure_task(
        &self,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<InfrastructureTaskResultItem>, CoordinatorError> {
        check_cancelled(cancel)?;
        let mut state = self.lock();
        state.query_count += 1;
        if let Some(err) = state.query_failures.pop_front() {
            return Err(err);
        }
        Ok(state.tasks.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::NodeTask;

    fn description(instance: i64) -> InfrastructureTaskDescription {
        InfrastructureTaskDescription::new(
            PartitionId::new("p"),
            TaskId::new("T"),
            InstanceId::new(instance),
            vec![NodeTaskDescription::new("n1", NodeTask::Restart)],
        )
    }

    #[tokio::test]
    async fn task_table_follows_protocol() {
        let agent = RecordingInfrastructureAgent::new(PartitionId::new("p"));
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(1);
        let task = TaskId::new("T");

        agent
            .start_infrastructure_task(&description(4), timeout, &cancel)
            .await
            .unwrap();
        assert_eq!(agent.task_state(&task), Some(InfrastructureTaskState::PreAckPending));
        assert_eq!(agent.pending_acknowledgements().len(), 1);

        agent.mark_acknowledged(&task);
        assert_eq!(agent.task_state(&task), Some(InfrastructureTaskState::PreAcked));

        // Repeating the same start does not reset an acknowledged task.
        agent
            .start_infrastructure_task(&description(4), timeout, &cancel)
            .await
            .unwrap();
        assert_eq!(agent.task_state(&task), Some(InfrastructureTaskState::PreAcked));

        agent
            .finish_infrastructure_task(&task, InstanceId::new(4), timeout, &cancel)
            .await
            .unwrap();
        assert_eq!(agent.task_state(&task), Some(InfrastructureTaskState::PostAckPending));
        agent.mark_acknowledged(&task);
        assert_eq!(agent.task_state(&task), Some(InfrastructureTaskState::PostAcked));
        assert!(agent.pending_acknowledgements().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let agent = RecordingInfrastructureAgent::new(PartitionId::new("p"));
        let cancel = CancellationToken::new();
        agent.fail_next_query(CoordinatorError::Timeout("query".into()));

        assert!(agent
            .query_infrastructure_task(Duration::from_secs(1), &cancel)
            .await
            .is_err());
        assert!(agent
            .query_infrastructure_task(Duration::from_secs(1), &cancel)
            .await
            .is_ok());
        assert_eq!(agent.query_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_calls_are_not_recorded() {
        let agent = RecordingInfrastructureAgent::new(PartitionId::new("p"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = agent
            .start_infrastructure_task(&description(4), Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(result, Err(CoordinatorError::Cancelled));
        assert_eq!(agent.total_calls(), 0);
    }

    #[tokio::test]
    async fn finish_of_unknown_task_reports_own_partition() {
        let agent = RecordingInfrastructureAgent::new(PartitionId::new("p7"));
        let cancel = CancellationToken::new();

        agent
            .finish_infrastructure_task(&TaskId::new("T"), InstanceId::new(8), Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let items = agent
            .query_infrastructure_task(Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description.partition_id, PartitionId::new("p7"));
        assert_eq!(items[0].state, InfrastructureTaskState::PostAckPending);
    }
}
