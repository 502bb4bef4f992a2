//! CoordinatorMachine - ジョブ状態機械
//!
//! 単一のタスク（`{prefix}/{tenant}/{partition}`）について、プラットフォームの
//! 通知とクラスタマネージャー（CM）のタスク状態を突き合わせる。
//!
//! # 不変条件
//! - 状態はイベントループだけが変更する（`&mut self`）
//! - CM 呼び出しは同時に 1 つまで。完了は `cm_call_finished` で受け取る
//! - ack は instance id が既知のタスク以下のものだけ受け付ける

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breakpoint::{self, BreakpointManager};
use super::reack::{AckAction, LastCompletedJobStep};
use super::status::{CoordinatorStatus, NotificationView, TaskView};
use crate::config::CoordinatorConfig;
use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, PartitionId, TaskId};
use crate::domain::impact::ImpactTranslator;
use crate::domain::notification::{JobDetailedStatus, Notification, NotificationType};
use crate::domain::policy::JobBlockingPolicy;
use crate::domain::sequence::SharedSequenceIssuer;
use crate::domain::state::JobState;
use crate::domain::task::{
    InfrastructureTaskDescription, InfrastructureTaskResultItem, node_tasks_equal,
    node_tasks_equal_ignoring_missing_removals,
};
use crate::ports::{
    Clock, HealthReport, HealthReporter, HealthState, InfrastructureAgent, NotificationSource,
    PolicyStore,
};
use crate::retry::RetryPolicy;

pub const HEALTH_SOURCE_ID: &str = "InfrastructureCoordinator";
pub const NOTIFICATION_APPROVAL_PROPERTY: &str = "NotificationApprovalStatus";
pub const COORDINATOR_STATUS_PROPERTY: &str = "CoordinatorStatus";

/// External collaborators of one coordinator.
#[derive(Clone)]
pub struct CoordinatorPorts {
    pub agent: Arc<dyn InfrastructureAgent>,
    pub notifications: Arc<dyn NotificationSource>,
    pub policy_store: Arc<dyn PolicyStore>,
    pub health: Arc<dyn HealthReporter>,
    pub clock: Arc<dyn Clock>,
}

/// Result of the single in-flight cluster manager call.
#[derive(Debug)]
pub enum CmCompletion {
    Query(Result<Vec<InfrastructureTaskResultItem>, CoordinatorError>),
    Start {
        instance_id: InstanceId,
        result: Result<(), CoordinatorError>,
    },
    Finish {
        instance_id: InstanceId,
        result: Result<(), CoordinatorError>,
    },
    /// Delay before the next recovery query elapsed.
    RetryDelay,
    /// The call task itself died.
    Aborted(String),
}

pub struct CoordinatorMachine {
    ports: CoordinatorPorts,
    config: Arc<CoordinatorConfig>,
    task_id: TaskId,
    partition_id: PartitionId,
    issuer: SharedSequenceIssuer,
    translator: ImpactTranslator,
    retry: RetryPolicy,
    cancel: CancellationToken,
    cm_call: Option<JoinHandle<CmCompletion>>,

    job_state: JobState,
    state_updated_at: DateTime<Utc>,
    last_known_task: Option<InfrastructureTaskDescription>,
    last_notification: Option<Notification>,
    notification_available: bool,
    last_incarnation: Option<u64>,
    incarnation_updated_at: Option<DateTime<Utc>>,
    nodes_impacted_count: i64,
    breakpoints: BreakpointManager,
    last_completed: LastCompletedJobStep,
}

impl CoordinatorMachine {
    pub fn new(
        ports: CoordinatorPorts,
        config: Arc<CoordinatorConfig>,
        task_id: TaskId,
        partition_id: PartitionId,
        issuer: SharedSequenceIssuer,
        cancel: CancellationToken,
    ) -> Self {
        let translator = config.impact_translator();
        let retry = config.retry_policy();
        let now = ports.clock.now();
        Self {
            ports,
            config,
            task_id,
            partition_id,
            issuer,
            translator,
            retry,
            cancel,
            cm_call: None,
            job_state: JobState::Unknown,
            state_updated_at: now,
            last_known_task: None,
            last_notification: None,
            notification_available: false,
            last_incarnation: None,
            incarnation_updated_at: None,
            nodes_impacted_count: -1,
            breakpoints: BreakpointManager::new(),
            last_completed: LastCompletedJobStep::new(),
        }
    }

    pub fn job_state(&self) -> JobState {
        self.job_state
    }

    pub fn last_known_task(&self) -> Option<&InfrastructureTaskDescription> {
        self.last_known_task.as_ref()
    }

    pub fn is_notification_available(&self) -> bool {
        self.notification_available
    }

    pub fn is_cm_call_in_flight(&self) -> bool {
        self.cm_call.is_some()
    }

    // ------------------------------------------------------------------
    // Cluster manager calls
    // ------------------------------------------------------------------

    fn begin_cm_call<F>(&mut self, call: F)
    where
        F: Future<Output = CmCompletion> + Send + 'static,
    {
        debug_assert!(self.cm_call.is_none(), "cluster manager call already in flight");
        self.cm_call = Some(tokio::spawn(call));
    }

    /// Resolve with the in-flight call's completion; pending forever when
    /// there is none.
    pub async fn cm_call_finished(&mut self) -> CmCompletion {
        match self.cm_call.as_mut() {
            Some(handle) => match handle.await {
                Ok(completion) => completion,
                Err(err) => CmCompletion::Aborted(err.to_string()),
            },
            None => std::future::pending().await,
        }
    }

    pub fn on_cm_completion(&mut self, completion: CmCompletion) {
        self.cm_call = None;

        if self.cancel.is_cancelled() {
            info!(?completion, "discarding cluster manager result, coordinator is stopping");
            return;
        }

        match completion {
            CmCompletion::Query(Ok(items)) => self.apply_query_result(&items),
            CmCompletion::Query(Err(err)) if err.is_timeout() => {
                warn!(error = %err, "recovery query timed out, retrying");
                self.recover_state();
            }
            CmCompletion::Query(Err(err)) => {
                let delay = self.config.query_retry_delay();
                warn!(error = %err, ?delay, "recovery query failed");
                self.delay_recover_state();
            }
            CmCompletion::Start { instance_id, result } => match result {
                Ok(()) => info!(instance_id = %instance_id, "start infrastructure task sent"),
                Err(err) => {
                    // Possibly a stale instance id; refresh from the cluster manager.
                    warn!(instance_id = %instance_id, error = %err, "start infrastructure task failed");
                    self.recover_state();
                }
            },
            CmCompletion::Finish { instance_id, result } => match result {
                Ok(()) => info!(instance_id = %instance_id, "finish infrastructure task sent"),
                Err(err) => {
                    warn!(instance_id = %instance_id, error = %err, "finish infrastructure task failed");
                    self.recover_state();
                }
            },
            CmCompletion::RetryDelay => self.recover_state(),
            CmCompletion::Aborted(reason) => {
                error!(reason = %reason, "cluster manager call aborted");
                self.recover_state();
            }
        }
    }

    /// Forget local knowledge and query the cluster manager for our task.
    pub fn recover_state(&mut self) {
        info!(task_id = %self.task_id, "recovering state");
        let agent = Arc::clone(&self.ports.agent);
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.cluster_manager_request_timeout();

        self.begin_cm_call(async move {
            let result = retry
                .execute_async("QueryInfrastructureTask", &cancel, || {
                    agent.query_infrastructure_task(timeout, &cancel)
                })
                .await;
            CmCompletion::Query(result)
        });
        self.set_job_state_and_task(JobState::Unknown, None);
    }

    fn delay_recover_state(&mut self) {
        let delay = self.config.query_retry_delay();
        let cancel = self.cancel.clone();
        self.begin_cm_call(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            CmCompletion::RetryDelay
        });
    }

    fn apply_query_result(&mut self, items: &[InfrastructureTaskResultItem]) {
        let mut found = None;
        for item in items {
            let ours = item.description.task_id == self.task_id;
            debug!(
                task_id = %item.description.task_id,
                instance_id = %item.description.instance_id,
                state = ?item.state,
                ours,
                "infrastructure task"
            );
            if ours {
                found = Some(item);
            }
        }

        match found {
            Some(item) => {
                let state = JobState::from(item.state);
                self.set_job_state_and_task(state, Some(item.description.clone()));
            }
            None => self.set_job_state_and_task(JobState::Idle, None),
        }
        info!(
            job_state = %self.job_state,
            instance_id = ?self.last_known_task.as_ref().map(|t| t.instance_id.to_string()),
            "state recovered"
        );
    }

    fn send_start(&mut self, description: InfrastructureTaskDescription) {
        let agent = Arc::clone(&self.ports.agent);
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.cluster_manager_request_timeout();
        let instance_id = description.instance_id;

        info!(task = %description, "starting infrastructure task");
        self.begin_cm_call(async move {
            let result = retry
                .execute_async("StartInfrastructureTask", &cancel, || {
                    agent.start_infrastructure_task(&description, timeout, &cancel)
                })
                .await;
            CmCompletion::Start { instance_id, result }
        });
    }

    fn send_finish(&mut self, instance_id: InstanceId) {
        let agent = Arc::clone(&self.ports.agent);
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.cluster_manager_request_timeout();
        let task_id = self.task_id.clone();

        info!(task_id = %task_id, instance_id = %instance_id, "finishing infrastructure task");
        self.begin_cm_call(async move {
            let result = retry
                .execute_async("FinishInfrastructureTask", &cancel, || {
                    agent.finish_infrastructure_task(&task_id, instance_id, timeout, &cancel)
                })
                .await;
            CmCompletion::Finish { instance_id, result }
        });
    }

    // ------------------------------------------------------------------
    // Notification processing
    // ------------------------------------------------------------------

    /// One reconciliation pass over the current notification.
    ///
    /// Returns `Fatal` when the notification channel shows no liveness.
    pub async fn process_current_notification(&mut self) -> Result<(), CoordinatorError> {
        let notification = self.ports.notifications.current_notification();
        debug!(
            task_id = %self.task_id,
            next_instance_id = ?self.issuer.peek().ok(),
            notification = ?notification.as_ref().map(|n| n.to_string()),
            "processing notification"
        );

        if self.is_cm_call_in_flight() {
            debug!("cluster manager call in flight, skipping");
            return Ok(());
        }

        self.last_notification = notification.clone();
        self.nodes_impacted_count = -1;

        if !self.config.wait_for_incarnation_change_on_startup {
            self.notification_available = true;
        }
        self.observe_incarnation();
        self.check_channel_health()?;

        if !self.notification_available {
            debug!("waiting for the notification channel incarnation to change");
            return Ok(());
        }

        if !self.should_allow_state_transition(notification.as_ref()).await? {
            return Ok(());
        }

        if let Some(n) = &notification
            && n.requires_manual_approval
        {
            warn!(notification = %n, "notification requires manual approval");
            self.report_approval(
                HealthState::Warning,
                format!(
                    "notification '{}' requires manual approval by an operator",
                    n.notification_id
                ),
            );
            return Ok(());
        }
        self.report_approval(
            HealthState::Ok,
            match &notification {
                Some(n) => format!("notification '{}' approved for processing", n.notification_id),
                None => "no notification".to_string(),
            },
        );

        match self.job_state {
            JobState::Idle => self.idle_action(notification).await,
            JobState::WaitingForApproval | JobState::Executing => {
                self.executing_action(notification).await
            }
            JobState::WaitingForHealthCheck => {
                // The acknowledgement moves us back to Idle.
                self.finish_last_known_task();
                Ok(())
            }
            JobState::Unknown => {
                debug!("state not recovered yet");
                Ok(())
            }
        }
    }

    async fn idle_action(&mut self, notification: Option<Notification>) -> Result<(), CoordinatorError> {
        match notification {
            None if self.last_known_task.is_none() => {
                self.recover_state();
                Ok(())
            }
            None => {
                self.finish_last_known_task();
                Ok(())
            }
            Some(n) if n.is_start() => {
                let instance_id = self.issuer.issue()?;
                self.start_infrastructure_task(&n, instance_id).await
            }
            Some(n) => self.re_ack(&n),
        }
    }

    async fn executing_action(
        &mut self,
        notification: Option<Notification>,
    ) -> Result<(), CoordinatorError> {
        let Some(instance_id) = self.last_known_task.as_ref().map(|t| t.instance_id) else {
            warn!(job_state = %self.job_state, "no known task, recovering");
            self.recover_state();
            return Ok(());
        };

        if let Some(n) = &notification
            && self.notification_matches(Some(n), NotificationType::StartJobStep)
        {
            // Same start again; covers a lost pre-ack.
            return self.start_infrastructure_task(n, instance_id).await;
        }

        if is_job_execution_complete(notification.as_ref()) {
            let stop = self.config.breakpoints.job_execution_completed
                && self
                    .breakpoints
                    .stop_at(&breakpoint::job_execution_completed(instance_id));
            if !stop {
                self.finish_last_known_task();
            }
            return Ok(());
        }

        warn!(
            notification = ?notification.as_ref().map(|n| n.to_string()),
            instance_id = %instance_id,
            "unexpected notification; impact changed or job not waiting for acknowledgement"
        );
        Ok(())
    }

    async fn start_infrastructure_task(
        &mut self,
        notification: &Notification,
        instance_id: InstanceId,
    ) -> Result<(), CoordinatorError> {
        let task = match self.translator.translate(
            notification,
            &self.partition_id,
            &self.task_id,
            instance_id,
        ) {
            Ok(task) => task,
            Err(err) => {
                warn!(notification = %notification, error = %err, "cannot translate notification");
                return Ok(());
            }
        };

        self.nodes_impacted_count = task.node_tasks.len() as i64;
        if self.job_state == JobState::Idle && !task.node_tasks.is_empty() {
            let policy = self.ports.policy_store.get_policy().await?;
            if policy.blocks_impactful_job(notification.active_job_type) {
                warn!(
                    policy = %policy,
                    nodes = self.nodes_impacted_count,
                    job_id = %notification.active_job_id,
                    "blocking impactful job"
                );
                if self
                    .breakpoints
                    .stop_at(&breakpoint::job_blocked(policy, notification))
                {
                    return Ok(());
                }
            }
        }

        self.send_start(task.clone());
        if self.job_state == JobState::Idle {
            info!(notification = %notification, "new job step");
            self.set_job_state_and_task(JobState::WaitingForApproval, Some(task));
        }
        Ok(())
    }

    fn finish_last_known_task(&mut self) {
        let Some(instance_id) = self.last_known_task.as_ref().map(|t| t.instance_id) else {
            warn!(job_state = %self.job_state, "nothing to finish, recovering");
            self.recover_state();
            return;
        };
        self.send_finish(instance_id);
        if self.job_state != JobState::Idle {
            self.set_job_state(JobState::WaitingForHealthCheck);
        }
    }

    /// Replay the last acknowledgement for a repeated post-step notification.
    fn re_ack(&mut self, notification: &Notification) -> Result<(), CoordinatorError> {
        if notification.is_complete() && self.config.always_ack_post_notifications {
            return self.ports.notifications.signal_ready(notification);
        }

        let recent = self.is_state_recently_updated();
        if !self.config.allow_completed_job_step_reack {
            if recent {
                info!(notification = %notification, "post-step notification shortly after the last job");
            } else {
                warn!(notification = %notification, "unexpected post-step notification; manual approval may be required");
            }
            return Ok(());
        }

        let now = self.ports.clock.now();
        let threshold = self.config.recent_job_state_update_threshold();
        let Some(action) = self
            .last_completed
            .replay_for(notification, now, threshold)
            .cloned()
        else {
            warn!(
                notification = %notification,
                recently_updated = recent,
                "unexpected post-step notification; manual approval may be required if it persists"
            );
            return Ok(());
        };

        match &action {
            AckAction::SignalReady => self.ports.notifications.signal_ready(notification)?,
            AckAction::SignalError(detail) => {
                self.ports.notifications.signal_error(notification, detail)?
            }
        }
        info!(notification = %notification, action = ?action, "re-acknowledged notification");
        self.last_completed.update(notification, action, now);
        Ok(())
    }

    async fn should_allow_state_transition(
        &mut self,
        notification: Option<&Notification>,
    ) -> Result<bool, CoordinatorError> {
        let policy = self.ports.policy_store.get_policy().await?;
        match policy {
            JobBlockingPolicy::Invalid | JobBlockingPolicy::BlockAllJobs => {
                debug!(policy = %policy, "state transitions blocked");
                return Ok(false);
            }
            JobBlockingPolicy::BlockNone => return Ok(true),
            _ => {}
        }

        let Some(n) = notification else {
            return Ok(true);
        };
        if n.is_start()
            && self.job_state == JobState::Idle
            && policy.blocks_new_job(n.active_job_type)
        {
            warn!(policy = %policy, job_id = %n.active_job_id, "new job blocked by policy");
            return Ok(!self.breakpoints.stop_at(&breakpoint::job_blocked(policy, n)));
        }
        Ok(true)
    }

    fn notification_matches(&self, notification: Option<&Notification>, expected: NotificationType) -> bool {
        let Some(n) = notification else {
            return false;
        };
        if n.notification_type != expected {
            return false;
        }
        let Some(old) = &self.last_known_task else {
            return false;
        };
        let new = match self
            .translator
            .translate(n, &self.partition_id, &self.task_id, InstanceId::ZERO)
        {
            Ok(task) => task,
            Err(err) => {
                warn!(notification = %n, error = %err, "cannot translate notification for matching");
                return false;
            }
        };

        let mut equal = node_tasks_equal(&old.node_tasks, &new.node_tasks);
        if !equal && n.is_complete() {
            equal = node_tasks_equal_ignoring_missing_removals(&old.node_tasks, &new.node_tasks);
            if equal {
                warn!(old = %old, new = %new, "notification matches only when missing Remove impacts are ignored");
            }
        }
        debug!(matches = equal, old = %old, new = %new, "matched notification against current task");
        equal
    }

    // ------------------------------------------------------------------
    // Notification channel liveness
    // ------------------------------------------------------------------

    fn observe_incarnation(&mut self) {
        let now = self.ports.clock.now();
        match (self.ports.notifications.health_incarnation(), self.last_incarnation) {
            (None, _) => {
                // Liveness window starts now if the channel never reports one.
                if self.incarnation_updated_at.is_none() {
                    self.incarnation_updated_at = Some(now);
                }
            }
            (Some(current), None) => {
                debug!(incarnation = current, "first health incarnation");
                self.last_incarnation = Some(current);
                self.incarnation_updated_at = Some(now);
            }
            (Some(current), Some(last)) if current != last => {
                debug!(from = last, to = current, "health incarnation changed");
                self.last_incarnation = Some(current);
                self.incarnation_updated_at = Some(now);
                if !self.notification_available {
                    info!("notification channel is live, notifications available");
                }
                self.notification_available = true;
            }
            _ => {}
        }
    }

    fn check_channel_health(&self) -> Result<(), CoordinatorError> {
        if let Some(max_wait) = self.config.max_incarnation_update_wait()
            && let Some(updated_at) = self.incarnation_updated_at
        {
            let elapsed = self.ports.clock.now() - updated_at;
            if elapsed > max_wait {
                error!(
                    incarnation = ?self.last_incarnation,
                    %updated_at,
                    elapsed_secs = elapsed.num_seconds(),
                    "notification channel shows no liveness"
                );
                return Err(CoordinatorError::Fatal(format!(
                    "health incarnation unchanged for {}s",
                    elapsed.num_seconds()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cluster manager acknowledgements
    // ------------------------------------------------------------------

    fn verify_known_instance_id(&self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        match &self.last_known_task {
            Some(task) if task.instance_id >= instance_id => Ok(()),
            _ => Err(CoordinatorError::NotReady(format!(
                "not ready to process instance ID {instance_id} yet"
            ))),
        }
    }

    fn is_stale(&self, instance_id: InstanceId) -> bool {
        self.last_known_task
            .as_ref()
            .is_some_and(|task| instance_id < task.instance_id)
    }

    fn current_notification(&self) -> Result<Option<Notification>, CoordinatorError> {
        if !self.notification_available {
            return Err(CoordinatorError::NotReady(
                "notification is not available yet".to_string(),
            ));
        }
        Ok(self.ports.notifications.current_notification())
    }

    /// Common checks; `Ok(None)` means the report is stale and accepted as is.
    async fn accept_report(
        &mut self,
        report: &'static str,
        instance_id: InstanceId,
    ) -> Result<Option<Option<Notification>>, CoordinatorError> {
        info!(report, task_id = %self.task_id, instance_id = %instance_id, "cluster manager report");
        if !self.should_allow_state_transition(None).await? {
            return Ok(None);
        }
        self.verify_known_instance_id(instance_id)?;
        if self.is_stale(instance_id) {
            info!(report, instance_id = %instance_id, "acknowledging stale instance id");
            return Ok(None);
        }
        self.current_notification().map(Some)
    }

    pub async fn on_start_task_success(&mut self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        let Some(notification) = self.accept_report("StartTaskSuccess", instance_id).await? else {
            return Ok(());
        };

        match &notification {
            Some(n) if self.notification_matches(Some(n), NotificationType::StartJobStep) => {
                if self.job_state == JobState::WaitingForApproval
                    && self.config.is_ready_to_execute_breakpoint_enabled(n.active_job_type)
                    && self.breakpoints.stop_at(&breakpoint::ready_to_execute(n))
                {
                    // Keep the cluster manager task in PreAckPending.
                    return Err(CoordinatorError::NotReady(
                        "start task success waits for the ReadyToExecute breakpoint".to_string(),
                    ));
                }
                info!(notification = %n, instance_id = %instance_id, "signalling ready for start step");
                self.ports.notifications.signal_ready(n)?;
            }
            _ => warn!(
                notification = ?notification.as_ref().map(|n| n.to_string()),
                job_state = %self.job_state,
                "skipping SignalReady, notification does not match current task"
            ),
        }

        if self.job_state < JobState::Executing {
            self.set_job_state(JobState::Executing);
        }
        Ok(())
    }

    pub async fn on_finish_task_success(&mut self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        let Some(notification) = self.accept_report("FinishTaskSuccess", instance_id).await? else {
            return Ok(());
        };

        match &notification {
            Some(n) if self.notification_matches(Some(n), NotificationType::CompleteJobStep) => {
                info!(notification = %n, instance_id = %instance_id, "signalling ready for complete step");
                self.ports.notifications.signal_ready(n)?;
                let now = self.ports.clock.now();
                self.last_completed.update(n, AckAction::SignalReady, now);
            }
            None => info!("skipping SignalReady, no active notification"),
            Some(n) => warn!(
                notification = %n,
                job_state = %self.job_state,
                "skipping SignalReady, notification does not match current task"
            ),
        }

        self.set_job_state(JobState::Idle);
        Ok(())
    }

    pub async fn on_task_failure(&mut self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        warn!(task_id = %self.task_id, instance_id = %instance_id, "cluster manager reported task failure");
        if self.config.always_ack_post_notifications {
            info!("always acknowledging post notifications, treating failure as finish");
            return self.on_finish_task_success(instance_id).await;
        }

        let Some(notification) = self.accept_report("TaskFailure", instance_id).await? else {
            return Ok(());
        };

        if matches!(
            self.job_state,
            JobState::WaitingForApproval | JobState::Executing
        ) {
            return Err(CoordinatorError::NotReady(format!(
                "unexpected failure report for task instance ID {instance_id}"
            )));
        }

        match &notification {
            Some(n) if self.notification_matches(Some(n), NotificationType::CompleteJobStep) => {
                if n.active_job_includes_topology_change
                    && !self.config.allow_job_alert_on_topology_change
                {
                    return Err(CoordinatorError::Aborted(format!(
                        "job {} cannot be alerted; operator intervention may be required",
                        n.active_job_id
                    )));
                }
                let description = format!("task instance ID {instance_id} failed");
                info!(notification = %n, description = %description, "signalling error for complete step");
                self.ports.notifications.signal_error(n, &description)?;
                let now = self.ports.clock.now();
                self.last_completed
                    .update(n, AckAction::SignalError(description), now);
            }
            None => info!("skipping SignalError, no active notification"),
            Some(n) => warn!(
                notification = %n,
                job_state = %self.job_state,
                "skipping SignalError, notification does not match current task"
            ),
        }

        self.set_job_state(JobState::Idle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    pub fn signal_ready_command(&mut self, job_id: &str, ud: i32) -> Result<(), CoordinatorError> {
        let notification = self.ports.notifications.current_notification();
        match notification {
            Some(n) if n.is_for_job_step(job_id, ud) => {
                self.ports.notifications.signal_ready(&n)?;
                if n.is_complete() {
                    let now = self.ports.clock.now();
                    self.last_completed.update(&n, AckAction::SignalReady, now);
                }
                info!(job_id, ud, "SignalReady completed");
            }
            _ => warn!(job_id, ud, "SignalReady does not match current notification"),
        }
        Ok(())
    }

    pub fn signal_error_command(
        &mut self,
        job_id: &str,
        ud: i32,
        description: &str,
    ) -> Result<(), CoordinatorError> {
        let notification = self.ports.notifications.current_notification();
        match notification {
            Some(n) if n.is_for_job_step(job_id, ud) => {
                self.ports.notifications.signal_error(&n, description)?;
                if n.is_complete() {
                    let now = self.ports.clock.now();
                    self.last_completed
                        .update(&n, AckAction::SignalError(description.to_string()), now);
                }
                info!(job_id, ud, "SignalError completed");
            }
            _ => warn!(job_id, ud, "SignalError does not match current notification"),
        }
        Ok(())
    }

    pub fn breakpoint_continue(&mut self, name: &str) {
        self.breakpoints.continue_past(name);
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let policy = self.ports.policy_store.get_policy().await?;
        Ok(CoordinatorStatus {
            infrastructure_task_id: self.task_id.clone(),
            job_blocking_policy: policy,
            last_known_job_state: self.job_state,
            last_known_task: self.last_known_task.as_ref().map(TaskView::from),
            notification: self.last_notification.as_ref().map(NotificationView::from),
            is_notification_available: self.notification_available,
            nodes_impacted_count: self.nodes_impacted_count,
            mode: "Serial",
            last_hit_breakpoint: self.breakpoints.last_hit().map(str::to_string),
            continue_past_breakpoint: self.breakpoints.continue_past_name().map(str::to_string),
        })
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn report_health(&self) {
        let (state, description) = if self.notification_available {
            (HealthState::Ok, format!("job state {}", self.job_state))
        } else {
            (
                HealthState::Warning,
                "notification channel not available yet".to_string(),
            )
        };
        self.ports.health.report(
            HealthReport::new(HEALTH_SOURCE_ID, COORDINATOR_STATUS_PROPERTY, state, description)
                .with_time_to_live(self.config.health_report_time_to_live()),
        );
    }

    fn report_approval(&self, state: HealthState, description: String) {
        self.ports.health.report(HealthReport::new(
            HEALTH_SOURCE_ID,
            NOTIFICATION_APPROVAL_PROPERTY,
            state,
            description,
        ));
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    fn set_job_state(&mut self, state: JobState) {
        if self.job_state != state {
            info!(from = %self.job_state, to = %state, task_id = %self.task_id, "job state changed");
            self.job_state = state;
            self.state_updated_at = self.ports.clock.now();
        }
    }

    fn set_job_state_and_task(&mut self, state: JobState, task: Option<InfrastructureTaskDescription>) {
        self.set_job_state(state);
        self.last_known_task = task;
    }

    fn is_state_recently_updated(&self) -> bool {
        self.ports.clock.now() - self.state_updated_at < self.config.recent_job_state_update_threshold()
    }

    /// Wait for the in-flight call and drop all transient state.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.cm_call.take() {
            info!("waiting for in-flight cluster manager call");
            let _ = handle.await;
        }
        self.set_job_state_and_task(JobState::Unknown, None);
        self.last_notification = None;
        self.notification_available = false;
        self.last_incarnation = None;
        self.incarnation_updated_at = None;
    }
}

/// No notification, a complete step, or the platform already waiting for
/// the next start step.
fn is_job_execution_complete(notification: Option<&Notification>) -> bool {
    match notification {
        None => true,
        Some(n) => {
            n.is_complete()
                || n.active_job_detailed_status == JobDetailedStatus::WaitingForStartStepAcknowledgement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{ImpactReason, ImpactedInstance, JobType};
    use crate::domain::state::InfrastructureTaskState;
    use crate::domain::task::{NodeTask, NodeTaskDescription};
    use crate::impls::{
        InMemoryPolicyStore, RecordingHealthReporter, RecordingInfrastructureAgent,
        ScriptedNotificationSource, SignalRecord,
    };
    use crate::ports::FixedClock;
    use std::time::Duration;

    struct Harness {
        agent: Arc<RecordingInfrastructureAgent>,
        source: Arc<ScriptedNotificationSource>,
        policy: Arc<InMemoryPolicyStore>,
        health: Arc<RecordingHealthReporter>,
        clock: Arc<FixedClock>,
        machine: CoordinatorMachine,
    }

    impl Harness {
        fn new(config: CoordinatorConfig) -> Self {
            let agent = Arc::new(RecordingInfrastructureAgent::new(PartitionId::new("p")));
            let source = Arc::new(ScriptedNotificationSource::new());
            let policy = Arc::new(InMemoryPolicyStore::default());
            let health = Arc::new(RecordingHealthReporter::new());
            let clock = Arc::new(FixedClock::new(Utc::now()));
            let issuer = SharedSequenceIssuer::new();
            issuer.begin_epoch(1).unwrap();

            let ports = CoordinatorPorts {
                agent: agent.clone(),
                notifications: source.clone(),
                policy_store: policy.clone(),
                health: health.clone(),
                clock: clock.clone(),
            };
            let machine = CoordinatorMachine::new(
                ports,
                Arc::new(config),
                TaskId::new("Coordinator/tenant/p"),
                PartitionId::new("p"),
                issuer,
                CancellationToken::new(),
            );
            Self {
                agent,
                source,
                policy,
                health,
                clock,
                machine,
            }
        }

        async fn recovered(config: CoordinatorConfig) -> Self {
            let mut h = Self::new(config);
            h.machine.recover_state();
            h.settle().await;
            h
        }

        /// Deliver the result of the in-flight cluster manager call.
        async fn settle(&mut self) {
            let completion = self.machine.cm_call_finished().await;
            self.machine.on_cm_completion(completion);
        }

        async fn poll(&mut self) {
            self.machine.process_current_notification().await.unwrap();
            if self.machine.is_cm_call_in_flight() {
                self.settle().await;
            }
        }

        fn instance_id(&self) -> InstanceId {
            self.machine.last_known_task().unwrap().instance_id
        }
    }

    fn notification(kind: NotificationType, reasons: Vec<ImpactReason>) -> Notification {
        Notification {
            notification_id: "n-1".into(),
            notification_type: kind,
            active_job_id: "job-1".into(),
            active_job_step_target_ud: 0,
            active_job_type: JobType::PlatformUpdateJob,
            active_job_detailed_status: JobDetailedStatus::WaitingForStartStepAcknowledgement,
            impacted_instances: vec![ImpactedInstance::new("Web_IN_0", reasons)],
            active_job_includes_topology_change: false,
            requires_manual_approval: false,
        }
    }

    fn start_step() -> Notification {
        notification(NotificationType::StartJobStep, vec![ImpactReason::Reboot])
    }

    fn complete_step() -> Notification {
        Notification {
            active_job_detailed_status: JobDetailedStatus::WaitingForCompleteStepAcknowledgement,
            ..notification(NotificationType::CompleteJobStep, vec![ImpactReason::Reboot])
        }
    }

    #[tokio::test]
    async fn recovery_maps_cluster_manager_state() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let task = InfrastructureTaskDescription::new(
            PartitionId::new("p"),
            TaskId::new("Coordinator/tenant/p"),
            InstanceId::from_parts(1, 8),
            vec![NodeTaskDescription::new("_Web_0", NodeTask::Restart)],
        );
        h.agent.set_task(task.clone(), InfrastructureTaskState::PreAcked);

        h.machine.recover_state();
        assert_eq!(h.machine.job_state(), JobState::Unknown);
        assert!(h.machine.is_cm_call_in_flight());
        h.settle().await;

        assert_eq!(h.machine.job_state(), JobState::Executing);
        assert_eq!(h.machine.last_known_task(), Some(&task));
    }

    #[tokio::test]
    async fn recovery_without_our_task_is_idle() {
        let h = Harness::recovered(CoordinatorConfig::default()).await;
        assert_eq!(h.machine.job_state(), JobState::Idle);
        assert_eq!(h.machine.last_known_task(), None);
    }

    #[tokio::test]
    async fn timed_out_query_is_retried_immediately() {
        let mut h = Harness::new(CoordinatorConfig::default());
        h.agent.fail_next_query(CoordinatorError::Aggregate(vec![
            CoordinatorError::Timeout("query".into()),
            CoordinatorError::VerificationFailed("x".into()),
        ]));

        h.machine.recover_state();
        h.settle().await;
        assert_eq!(h.machine.job_state(), JobState::Unknown);
        assert!(h.machine.is_cm_call_in_flight());

        h.settle().await;
        assert_eq!(h.machine.job_state(), JobState::Idle);
        assert_eq!(h.agent.query_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_is_retried_after_delay() {
        let mut h = Harness::new(CoordinatorConfig::default());
        h.agent
            .fail_next_query(CoordinatorError::transport("refused", false));

        h.machine.recover_state();
        h.settle().await;
        let started = tokio::time::Instant::now();

        // Delay, then a fresh query.
        h.settle().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        h.settle().await;
        assert_eq!(h.machine.job_state(), JobState::Idle);
    }

    #[tokio::test]
    async fn completion_after_cancellation_is_discarded() {
        let mut h = Harness::new(CoordinatorConfig::default());
        h.machine.recover_state();
        h.machine.cancel.cancel();
        h.settle().await;

        assert!(!h.machine.is_cm_call_in_flight());
        assert_eq!(h.machine.job_state(), JobState::Unknown);
    }

    #[tokio::test]
    async fn update_job_round_trip() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;

        h.source.set_notification(Some(start_step()));
        h.machine.process_current_notification().await.unwrap();
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);
        h.settle().await;

        let starts = h.agent.start_calls();
        assert_eq!(starts.len(), 1);
        assert_eq!(
            starts[0].node_tasks,
            vec![NodeTaskDescription::new("_Web_0", NodeTask::Restart)]
        );
        let instance_id = h.instance_id();
        assert_eq!(instance_id, InstanceId::from_parts(1, 4));

        h.machine.on_start_task_success(instance_id).await.unwrap();
        assert_eq!(h.source.ready_count(), 1);
        assert_eq!(h.machine.job_state(), JobState::Executing);

        h.source.set_notification(Some(complete_step()));
        h.machine.process_current_notification().await.unwrap();
        assert_eq!(h.machine.job_state(), JobState::WaitingForHealthCheck);
        h.settle().await;
        assert_eq!(
            h.agent.finish_calls(),
            vec![(TaskId::new("Coordinator/tenant/p"), instance_id)]
        );

        h.machine.on_finish_task_success(instance_id).await.unwrap();
        assert_eq!(h.source.ready_count(), 2);
        assert_eq!(h.machine.job_state(), JobState::Idle);

        // The platform lost our ack and repeats the complete step.
        let calls = h.agent.total_calls();
        h.machine.process_current_notification().await.unwrap();
        assert_eq!(h.source.ready_count(), 3);
        assert_eq!(h.agent.total_calls(), calls);
        assert!(!h.machine.is_cm_call_in_flight());
    }

    #[tokio::test]
    async fn repeated_start_step_reuses_instance_id() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();

        h.poll().await;

        let starts = h.agent.start_calls();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].instance_id, instance_id);
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);
        assert_eq!(h.instance_id(), instance_id);
    }

    #[tokio::test]
    async fn stale_re_ack_is_not_replayed() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();
        h.machine.on_start_task_success(instance_id).await.unwrap();
        h.source.set_notification(Some(complete_step()));
        h.poll().await;
        h.machine.on_finish_task_success(instance_id).await.unwrap();

        h.clock.advance(chrono::Duration::minutes(10));
        h.machine.process_current_notification().await.unwrap();
        assert_eq!(h.source.ready_count(), 2);
    }

    #[tokio::test]
    async fn unknown_instance_id_is_not_ready() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        assert!(matches!(
            h.machine.on_start_task_success(InstanceId::from_parts(1, 4)).await,
            Err(CoordinatorError::NotReady(_))
        ));

        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let newer = InstanceId::new(h.instance_id().as_i64() + 4);
        assert!(matches!(
            h.machine.on_start_task_success(newer).await,
            Err(CoordinatorError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn stale_instance_id_is_accepted_without_effect() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;

        let older = InstanceId::new(h.instance_id().as_i64() - 4);
        h.machine.on_start_task_success(older).await.unwrap();
        assert_eq!(h.source.ready_count(), 0);
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);
    }

    #[tokio::test]
    async fn failure_signals_error_and_records_it_for_re_ack() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();

        assert!(matches!(
            h.machine.on_task_failure(instance_id).await,
            Err(CoordinatorError::NotReady(_))
        ));

        h.machine.on_start_task_success(instance_id).await.unwrap();
        h.source.set_notification(Some(complete_step()));
        h.poll().await;
        h.machine.on_task_failure(instance_id).await.unwrap();
        assert_eq!(h.machine.job_state(), JobState::Idle);

        h.machine.process_current_notification().await.unwrap();
        let errors: Vec<_> = h
            .source
            .signals()
            .into_iter()
            .filter_map(|s| match s {
                SignalRecord::Error { description, .. } => Some(description),
                SignalRecord::Ready { .. } => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![
                "task instance ID 0x100000004 failed".to_string(),
                "task instance ID 0x100000004 failed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn topology_change_job_cannot_be_alerted() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();
        h.machine.on_start_task_success(instance_id).await.unwrap();
        h.source.set_notification(Some(Notification {
            active_job_includes_topology_change: true,
            ..complete_step()
        }));
        h.poll().await;

        assert!(matches!(
            h.machine.on_task_failure(instance_id).await,
            Err(CoordinatorError::Aborted(_))
        ));
        assert_eq!(h.source.error_count(), 0);
    }

    #[tokio::test]
    async fn missing_removal_still_matches_complete_step() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        let mut start = start_step();
        start
            .impacted_instances
            .push(ImpactedInstance::new("Web_IN_1", vec![ImpactReason::RemoveInstance]));
        h.source.set_notification(Some(start));
        h.poll().await;
        let instance_id = h.instance_id();
        h.machine.on_start_task_success(instance_id).await.unwrap();

        h.source.set_notification(Some(complete_step()));
        h.poll().await;
        h.machine.on_finish_task_success(instance_id).await.unwrap();
        assert_eq!(h.source.ready_count(), 2);
    }

    #[tokio::test]
    async fn blocking_policy_stops_new_jobs_until_continued() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.policy.update_policy(JobBlockingPolicy::BlockNewUpdateJob).await.unwrap();
        h.source.set_notification(Some(start_step()));

        h.machine.process_current_notification().await.unwrap();
        assert!(h.agent.start_calls().is_empty());
        assert_eq!(h.machine.job_state(), JobState::Idle);
        let status = h.machine.status().await.unwrap();
        assert_eq!(
            status.last_hit_breakpoint.as_deref(),
            Some("BlockNewUpdateJob:job-1:0")
        );

        h.machine.breakpoint_continue("BlockNewUpdateJob:job-1:0");
        h.poll().await;
        assert_eq!(h.agent.start_calls().len(), 1);
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);
    }

    #[tokio::test]
    async fn block_all_jobs_ignores_reports() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        h.policy.update_policy(JobBlockingPolicy::BlockAllJobs).await.unwrap();

        h.machine.on_start_task_success(h.instance_id()).await.unwrap();
        assert_eq!(h.source.ready_count(), 0);
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);
    }

    #[tokio::test]
    async fn impactful_update_policy_blocks_start() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.policy
            .update_policy(JobBlockingPolicy::BlockNewImpactfulPlatformUpdateJobs)
            .await
            .unwrap();
        h.source.set_notification(Some(start_step()));

        h.machine.process_current_notification().await.unwrap();
        assert!(h.agent.start_calls().is_empty());
        assert_eq!(h.machine.status().await.unwrap().nodes_impacted_count, 1);
    }

    #[tokio::test]
    async fn ready_to_execute_breakpoint_holds_start_ack() {
        let mut config = CoordinatorConfig::default();
        config.breakpoints.ready_to_execute = vec![JobType::PlatformUpdateJob];
        let mut h = Harness::recovered(config).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();

        assert!(matches!(
            h.machine.on_start_task_success(instance_id).await,
            Err(CoordinatorError::NotReady(_))
        ));
        assert_eq!(h.machine.job_state(), JobState::WaitingForApproval);

        h.machine.breakpoint_continue("ReadyToExecute:job-1:0");
        h.machine.on_start_task_success(instance_id).await.unwrap();
        assert_eq!(h.machine.job_state(), JobState::Executing);
    }

    #[tokio::test]
    async fn job_execution_completed_breakpoint_delays_finish() {
        let mut config = CoordinatorConfig::default();
        config.breakpoints.job_execution_completed = true;
        let mut h = Harness::recovered(config).await;
        h.source.set_notification(Some(start_step()));
        h.poll().await;
        let instance_id = h.instance_id();
        h.machine.on_start_task_success(instance_id).await.unwrap();

        h.source.set_notification(Some(complete_step()));
        h.machine.process_current_notification().await.unwrap();
        assert!(h.agent.finish_calls().is_empty());
        assert_eq!(h.machine.job_state(), JobState::Executing);

        h.machine
            .breakpoint_continue(&breakpoint::job_execution_completed(instance_id));
        h.poll().await;
        assert_eq!(h.agent.finish_calls().len(), 1);
        assert_eq!(h.machine.job_state(), JobState::WaitingForHealthCheck);
    }

    #[tokio::test]
    async fn manual_approval_reports_warning_and_waits() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(Notification {
            requires_manual_approval: true,
            ..start_step()
        }));

        h.machine.process_current_notification().await.unwrap();
        assert!(h.agent.start_calls().is_empty());
        let report = h.health.last_for(NOTIFICATION_APPROVAL_PROPERTY).unwrap();
        assert_eq!(report.state, HealthState::Warning);
    }

    #[tokio::test]
    async fn notifications_wait_for_incarnation_change() {
        let mut config = CoordinatorConfig::default();
        config.wait_for_incarnation_change_on_startup = true;
        let mut h = Harness::recovered(config).await;
        h.source.set_incarnation(Some(7));
        h.source.set_notification(Some(start_step()));

        h.machine.process_current_notification().await.unwrap();
        assert!(!h.machine.is_notification_available());
        assert!(matches!(
            h.machine.on_start_task_success(InstanceId::ZERO).await,
            Err(CoordinatorError::NotReady(_))
        ));
        h.machine.report_health();
        assert_eq!(
            h.health.last_for(COORDINATOR_STATUS_PROPERTY).unwrap().state,
            HealthState::Warning
        );

        h.source.bump_incarnation();
        h.poll().await;
        assert!(h.machine.is_notification_available());
        assert_eq!(h.agent.start_calls().len(), 1);
    }

    #[tokio::test]
    async fn silent_channel_is_fatal() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.machine.process_current_notification().await.unwrap();
        h.settle().await;

        h.clock.advance(chrono::Duration::minutes(31));
        let err = h.machine.process_current_notification().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn signal_commands_require_matching_notification() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(complete_step()));

        h.machine.signal_ready_command("job-2", 0).unwrap();
        assert_eq!(h.source.ready_count(), 0);

        h.machine.signal_error_command("job-1", 0, "operator says no").unwrap();
        assert_eq!(h.source.error_count(), 1);

        // Recorded, so the repeated notification is re-acked the same way.
        h.machine.process_current_notification().await.unwrap();
        assert_eq!(h.source.error_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_clears_transient_state() {
        let mut h = Harness::recovered(CoordinatorConfig::default()).await;
        h.source.set_notification(Some(start_step()));
        h.machine.process_current_notification().await.unwrap();
        assert!(h.machine.is_cm_call_in_flight());

        h.machine.shutdown().await;
        assert!(!h.machine.is_cm_call_in_flight());
        assert_eq!(h.machine.job_state(), JobState::Unknown);
        assert_eq!(h.machine.last_known_task(), None);
        assert!(!h.machine.is_notification_available());
    }
}
