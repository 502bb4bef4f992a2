//! CommandProcessor - 管理コマンド（start / finish）の処理
//!
//! # 流れ
//! 1. コマンドを PendingCommandContext に包む
//! 2. map に TryAdd（古い instance id は stale として拒否）
//! 3. クラスタマネージャーに start / finish を送信し、query で検証
//! 4. ack（report_*）で context を完了させる

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::{CommandKind, PendingCommandContext, PendingCommandContextMap};
use crate::domain::command::TaskCommand;
use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, PartitionId, TaskId};
use crate::domain::sequence::SharedSequenceIssuer;
use crate::domain::task::{InfrastructureTaskDescription, NodeTaskDescription, node_tasks_equal};
use crate::ports::InfrastructureAgent;
use crate::retry::RetryPolicy;

pub struct CommandProcessor {
    agent: Arc<dyn InfrastructureAgent>,
    retry: RetryPolicy,
    partition_id: PartitionId,
    issuer: SharedSequenceIssuer,
    request_timeout: Duration,
    inject_ack_fault_once: bool,
    start_contexts: Arc<PendingCommandContextMap>,
    finish_contexts: Arc<PendingCommandContextMap>,
}

impl CommandProcessor {
    pub fn new(
        agent: Arc<dyn InfrastructureAgent>,
        retry: RetryPolicy,
        partition_id: PartitionId,
        issuer: SharedSequenceIssuer,
        request_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            retry,
            partition_id,
            issuer,
            request_timeout,
            inject_ack_fault_once: true,
            start_contexts: PendingCommandContextMap::new("start"),
            finish_contexts: PendingCommandContextMap::new("finish"),
        }
    }

    pub fn with_ack_fault_injection(mut self, enabled: bool) -> Self {
        self.inject_ack_fault_once = enabled;
        self
    }

    pub fn start_contexts(&self) -> &Arc<PendingCommandContextMap> {
        &self.start_contexts
    }

    pub fn finish_contexts(&self) -> &Arc<PendingCommandContextMap> {
        &self.finish_contexts
    }

    /// Whether acknowledgements for `task_id` belong to this processor.
    pub fn is_tracking(&self, task_id: &TaskId) -> bool {
        self.start_contexts.contains(task_id) || self.finish_contexts.contains(task_id)
    }

    /// Run `command` to completion: dispatch, verify, then wait for the
    /// cluster manager's acknowledgement, a timeout or cancellation.
    pub async fn schedule_process_command(
        &self,
        command: TaskCommand,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        match command {
            TaskCommand::Start {
                task_id,
                node_tasks,
            } => {
                let instance_id = self.issuer.issue()?;
                let context = self.new_context(
                    CommandKind::Start,
                    task_id,
                    instance_id,
                    node_tasks,
                    timeout,
                    cancel,
                );
                self.process_start(context).await
            }
            TaskCommand::Finish { task_id } => {
                // A finish supersedes the start of the same task.
                let (instance_id, node_tasks) = match self.start_contexts.remove(&task_id) {
                    Some(start) => {
                        debug!(task_id = %task_id, instance_id = %start.instance_id(), "finish supersedes start");
                        start.cancel();
                        (start.instance_id(), start.node_tasks().to_vec())
                    }
                    None => (self.issuer.issue()?, Vec::new()),
                };
                let context = self.new_context(
                    CommandKind::Finish,
                    task_id,
                    instance_id,
                    node_tasks,
                    timeout,
                    cancel,
                );
                self.process_finish(context).await
            }
        }
    }

    fn new_context(
        &self,
        command: CommandKind,
        task_id: TaskId,
        instance_id: InstanceId,
        node_tasks: Vec<NodeTaskDescription>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Arc<PendingCommandContext> {
        let context = PendingCommandContext::new(
            command,
            task_id,
            instance_id,
            node_tasks,
            timeout,
            cancel.child_token(),
        );
        Arc::new(if self.inject_ack_fault_once {
            context
        } else {
            context.without_fault_injection()
        })
    }

    async fn process_start(&self, context: Arc<PendingCommandContext>) -> Result<(), CoordinatorError> {
        if !self.start_contexts.try_add(Arc::clone(&context)) {
            return Err(CoordinatorError::Stale("start command".to_string()));
        }
        info!(task_id = %context.task_id(), instance_id = %context.instance_id(), "processing start command");

        if let Err(err) = self.send_start(&context).await {
            context.fail(err.clone());
            return Err(err);
        }
        if let Err(err) = self.verify(&context).await {
            context.fail(err.clone());
            return Err(err);
        }
        context.wait_result().await
    }

    async fn process_finish(&self, context: Arc<PendingCommandContext>) -> Result<(), CoordinatorError> {
        if !self.finish_contexts.try_add(Arc::clone(&context)) {
            return Err(CoordinatorError::Stale("finish command".to_string()));
        }
        info!(task_id = %context.task_id(), instance_id = %context.instance_id(), "processing finish command");

        if let Err(err) = self.send_finish(&context).await {
            context.fail(err.clone());
            return Err(err);
        }
        if let Err(err) = self.verify(&context).await {
            context.fail(err.clone());
            return Err(err);
        }
        let result = context.wait_result().await;
        self.finish_contexts.remove_if_same(&context);
        result
    }

    fn description(&self, context: &PendingCommandContext) -> InfrastructureTaskDescription {
        InfrastructureTaskDescription::new(
            self.partition_id.clone(),
            context.task_id().clone(),
            context.instance_id(),
            context.node_tasks().to_vec(),
        )
    }

    async fn send_start(&self, context: &PendingCommandContext) -> Result<(), CoordinatorError> {
        let description = self.description(context);
        let cancel = context.cancellation();
        self.retry
            .execute_async("StartInfrastructureTask", cancel, || {
                self.agent
                    .start_infrastructure_task(&description, self.request_timeout, cancel)
            })
            .await
    }

    async fn send_finish(&self, context: &PendingCommandContext) -> Result<(), CoordinatorError> {
        let cancel = context.cancellation();
        self.retry
            .execute_async("FinishInfrastructureTask", cancel, || {
                self.agent.finish_infrastructure_task(
                    context.task_id(),
                    context.instance_id(),
                    self.request_timeout,
                    cancel,
                )
            })
            .await
    }

    /// Check that the cluster manager knows the submitted task. Node tasks
    /// must match exactly when the context carries them.
    async fn verify(&self, context: &PendingCommandContext) -> Result<(), CoordinatorError> {
        let cancel = context.cancellation();
        let items = self
            .retry
            .execute_async("QueryInfrastructureTask", cancel, || {
                self.agent
                    .query_infrastructure_task(self.request_timeout, cancel)
            })
            .await?;

        let Some(item) = items.iter().find(|item| {
            item.description.task_id == *context.task_id()
                && item.description.instance_id >= context.instance_id()
        }) else {
            return Err(CoordinatorError::VerificationFailed(format!(
                "{} ({}) not found in cluster manager query",
                context.task_id(),
                context.instance_id()
            )));
        };

        let check_nodes = context.command() == CommandKind::Start || !context.node_tasks().is_empty();
        if check_nodes && !node_tasks_equal(&item.description.node_tasks, context.node_tasks()) {
            return Err(CoordinatorError::VerificationFailed(format!(
                "node tasks of {} do not match: submitted {:?}, found {}",
                context.task_id(),
                context.node_tasks(),
                item.description
            )));
        }
        Ok(())
    }

    pub async fn on_report_start_task_success(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
    ) -> Result<(), CoordinatorError> {
        let Some(context) = self.start_contexts.get(task_id) else {
            debug!(task_id = %task_id, instance_id = %instance_id, "no pending start command");
            return Ok(());
        };
        self.acknowledge(&context, instance_id).await
    }

    pub async fn on_report_finish_task_success(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
    ) -> Result<(), CoordinatorError> {
        if let Some(start) = self.start_contexts.remove(task_id) {
            start.cancel();
        }
        let Some(context) = self.finish_contexts.get(task_id) else {
            debug!(task_id = %task_id, instance_id = %instance_id, "no pending finish command");
            return Ok(());
        };
        self.acknowledge(&context, instance_id).await
    }

    async fn acknowledge(
        &self,
        context: &Arc<PendingCommandContext>,
        instance_id: InstanceId,
    ) -> Result<(), CoordinatorError> {
        let expected = context.instance_id();
        if instance_id == expected {
            if context.should_inject_fault() {
                info!(task_id = %context.task_id(), instance_id = %instance_id, "injecting fault into first acknowledgement");
                return Err(CoordinatorError::InjectedFault {
                    task_id: context.task_id().clone(),
                    instance_id,
                });
            }
            context.complete();
            return Ok(());
        }

        if instance_id > expected {
            // The cluster manager lost our request and answered a later
            // instance; send ours again.
            info!(task_id = %context.task_id(), expected = %expected, reported = %instance_id, command = %context.command(), "re-issuing command");
            self.reissue(context).await;
        } else {
            debug!(task_id = %context.task_id(), expected = %expected, reported = %instance_id, "ignoring stale acknowledgement");
        }
        Ok(())
    }

    pub async fn on_report_task_failure(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
    ) -> Result<(), CoordinatorError> {
        let start = self.start_contexts.get(task_id);
        let finish = self.finish_contexts.get(task_id);

        let mut matched = false;
        for context in [&start, &finish].into_iter().flatten() {
            if context.instance_id() == instance_id {
                warn!(task_id = %task_id, instance_id = %instance_id, command = %context.command(), "task failed");
                context.fail(CoordinatorError::TaskFailed {
                    task_id: task_id.clone(),
                    instance_id,
                });
                matched = true;
            }
        }
        if matched {
            return Ok(());
        }

        // A failure for another instance is noise; keep ours going.
        if let Some(context) = finish.or(start) {
            info!(task_id = %task_id, expected = %context.instance_id(), reported = %instance_id, "failure report does not match, re-issuing");
            self.reissue(&context).await;
        }
        Ok(())
    }

    async fn reissue(&self, context: &Arc<PendingCommandContext>) {
        let result = match context.command() {
            CommandKind::Start => self.send_start(context).await,
            CommandKind::Finish => self.send_finish(context).await,
        };
        if let Err(err) = result {
            warn!(task_id = %context.task_id(), instance_id = %context.instance_id(), error = %err, "re-issue failed");
            context.fail(err);
        }
    }

    /// Cancel every pending command (shutdown).
    pub fn cancel_all(&self) {
        self.start_contexts.cancel();
        self.finish_contexts.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::domain::state::InfrastructureTaskState;
    use crate::domain::task::NodeTask;
    use crate::impls::RecordingInfrastructureAgent;

    fn processor(agent: Arc<RecordingInfrastructureAgent>) -> Arc<CommandProcessor> {
        let issuer = SharedSequenceIssuer::new();
        issuer.begin_epoch(1).unwrap();
        Arc::new(CommandProcessor::new(
            agent,
            RetryPolicy::no_retry(),
            PartitionId::new("p"),
            issuer,
            Duration::from_secs(5),
        ))
    }

    fn start(task: &str) -> TaskCommand {
        TaskCommand::Start {
            task_id: TaskId::new(task),
            node_tasks: vec![NodeTaskDescription::new("NodeA", NodeTask::Restart)],
        }
    }

    fn finish(task: &str) -> TaskCommand {
        TaskCommand::Finish {
            task_id: TaskId::new(task),
        }
    }

    async fn wait_for_context(map: &PendingCommandContextMap, task: &str) -> Arc<PendingCommandContext> {
        loop {
            if let Some(ctx) = map.get(&TaskId::new(task)) {
                return ctx;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_completes_after_second_acknowledgement() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();

        let run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(start("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };

        let ctx = wait_for_context(processor.start_contexts(), "T1").await;
        let task = TaskId::new("T1");

        let first = processor
            .on_report_start_task_success(&task, ctx.instance_id())
            .await;
        assert!(matches!(first, Err(CoordinatorError::InjectedFault { .. })));

        processor
            .on_report_start_task_success(&task, ctx.instance_id())
            .await
            .unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(agent.start_calls().len(), 1);
        // Completed starts stay around for finish correlation.
        assert!(processor.start_contexts().contains(&task));
    }

    #[tokio::test]
    async fn newer_acknowledgement_reissues_start() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();

        let run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(start("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };
        let ctx = wait_for_context(processor.start_contexts(), "T1").await;
        while agent.start_calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let newer = InstanceId::new(ctx.instance_id().as_i64() + 4);
        processor
            .on_report_start_task_success(&TaskId::new("T1"), newer)
            .await
            .unwrap();
        assert_eq!(agent.start_calls().len(), 2);
        assert!(!ctx.is_resolved());

        cancel.cancel();
        assert!(matches!(run.await.unwrap(), Err(CoordinatorError::Cancelled)));
    }

    #[tokio::test]
    async fn verification_fails_when_node_tasks_differ() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        agent.rewrite_node_tasks_on_start(vec![NodeTaskDescription::new(
            "NodeB",
            NodeTask::Relocate,
        )]);
        let processor = processor(Arc::clone(&agent));

        let result = processor
            .schedule_process_command(start("T1"), Duration::from_secs(60), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CoordinatorError::VerificationFailed(_))));
        assert!(processor.start_contexts().is_empty());
    }

    #[tokio::test]
    async fn finish_inherits_start_instance_and_cancels_it() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();
        let task = TaskId::new("T1");

        let start_run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(start("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };
        let start_ctx = wait_for_context(processor.start_contexts(), "T1").await;

        let finish_run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(
                        TaskCommand::Finish {
                            task_id: TaskId::new("T1"),
                        },
                        Duration::from_secs(60),
                        &cancel,
                    )
                    .await
            })
        };
        let finish_ctx = wait_for_context(processor.finish_contexts(), "T1").await;
        assert_eq!(finish_ctx.instance_id(), start_ctx.instance_id());
        assert!(matches!(start_run.await.unwrap(), Err(CoordinatorError::Cancelled)));

        while agent.finish_calls().is_empty() {
            tokio::task::yield_now().await;
        }
        // Wait until verification has seen the finished task.
        while agent.query_count() < 2 {
            tokio::task::yield_now().await;
        }

        let _ = processor
            .on_report_finish_task_success(&task, finish_ctx.instance_id())
            .await;
        processor
            .on_report_finish_task_success(&task, finish_ctx.instance_id())
            .await
            .unwrap();

        finish_run.await.unwrap().unwrap();
        assert!(processor.finish_contexts().is_empty());
        assert_eq!(
            agent.task_state(&task),
            Some(InfrastructureTaskState::PostAckPending)
        );
    }

    #[tokio::test]
    async fn matching_failure_fails_command() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();

        let run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(start("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };
        let ctx = wait_for_context(processor.start_contexts(), "T1").await;
        while agent.start_calls().is_empty() {
            tokio::task::yield_now().await;
        }

        // A failure for another instance only re-issues.
        processor
            .on_report_task_failure(&TaskId::new("T1"), InstanceId::new(ctx.instance_id().as_i64() + 4))
            .await
            .unwrap();
        assert_eq!(agent.start_calls().len(), 2);
        assert!(!ctx.is_resolved());

        processor
            .on_report_task_failure(&TaskId::new("T1"), ctx.instance_id())
            .await
            .unwrap();

        assert!(matches!(
            run.await.unwrap(),
            Err(CoordinatorError::TaskFailed { .. })
        ));
        assert!(processor.start_contexts().is_empty());
    }

    #[rstest]
    #[case::newer_acknowledgement_reissues_finish(4, 2)]
    #[case::older_acknowledgement_is_ignored(-4, 1)]
    #[tokio::test]
    async fn finish_acknowledgement_for_other_instance(#[case] offset: i64, #[case] expected_calls: usize) {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();

        let run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(finish("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };
        let ctx = wait_for_context(processor.finish_contexts(), "T1").await;
        while agent.query_count() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(agent.finish_calls().len(), 1);

        let reported = InstanceId::new(ctx.instance_id().as_i64() + offset);
        processor
            .on_report_finish_task_success(&TaskId::new("T1"), reported)
            .await
            .unwrap();
        assert_eq!(agent.finish_calls().len(), expected_calls);
        assert!(agent
            .finish_calls()
            .iter()
            .all(|(_, instance_id)| *instance_id == ctx.instance_id()));
        assert!(!ctx.is_resolved());
        assert!(processor.finish_contexts().contains(&TaskId::new("T1")));

        cancel.cancel();
        assert!(matches!(run.await.unwrap(), Err(CoordinatorError::Cancelled)));
    }

    #[tokio::test]
    async fn mismatched_failure_reissues_pending_finish() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));
        let cancel = CancellationToken::new();

        let run = {
            let processor = Arc::clone(&processor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                processor
                    .schedule_process_command(finish("T1"), Duration::from_secs(60), &cancel)
                    .await
            })
        };
        let ctx = wait_for_context(processor.finish_contexts(), "T1").await;
        while agent.query_count() < 1 {
            tokio::task::yield_now().await;
        }

        processor
            .on_report_task_failure(&TaskId::new("T1"), InstanceId::new(ctx.instance_id().as_i64() + 4))
            .await
            .unwrap();
        assert_eq!(agent.finish_calls().len(), 2);
        assert!(agent.start_calls().is_empty());
        assert!(!ctx.is_resolved());

        processor
            .on_report_task_failure(&TaskId::new("T1"), ctx.instance_id())
            .await
            .unwrap();
        assert!(matches!(
            run.await.unwrap(),
            Err(CoordinatorError::TaskFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_command_times_out() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let processor = processor(Arc::clone(&agent));

        let result = processor
            .schedule_process_command(start("T1"), Duration::from_secs(30), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(CoordinatorError::Timeout(_))));
        assert!(processor.start_contexts().is_empty());
    }

    #[tokio::test]
    async fn stale_start_is_rejected() {
        let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
        let issuer = SharedSequenceIssuer::new();
        issuer.begin_epoch(1).unwrap();
        let processor = CommandProcessor::new(
            agent,
            RetryPolicy::no_retry(),
            PartitionId::new("p"),
            issuer,
            Duration::from_secs(5),
        );

        let newer = Arc::new(PendingCommandContext::new(
            CommandKind::Start,
            TaskId::new("T1"),
            InstanceId::from_parts(9, 0),
            Vec::new(),
            Duration::from_secs(60),
            CancellationToken::new(),
        ));
        assert!(processor.start_contexts().try_add(newer));

        let result = processor
            .schedule_process_command(start("T1"), Duration::from_secs(60), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CoordinatorError::Stale(_))));
        assert_eq!(result.unwrap_err().to_string(), "abort: stale start command");
    }
}
