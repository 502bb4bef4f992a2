//! JobCoordinator - イベントループと外部 API
//!
//! `run` が 1 つのタスクで [`CoordinatorMachine`] を所有し、以下を
//! `tokio::select!` で直列に処理する:
//! - キャンセル
//! - 実行中の CM 呼び出しの完了
//! - mailbox 経由のリクエスト（CM の ack、管理コマンド）
//! - job / health のポーリングタイマー
//!
//! CM 呼び出しが実行中の間、タイマーは止まる（完了後に再開）。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command_processor::CommandProcessor;
use super::machine::{CoordinatorMachine, CoordinatorPorts};
use super::status::CoordinatorStatus;
use super::timer::{self, PollTimer};
use crate::config::CoordinatorConfig;
use crate::domain::command::{CoordinatorCommand, UNRECOGNIZED_COMMAND};
use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, PartitionId, TaskId};
use crate::domain::sequence::SharedSequenceIssuer;

const MAILBOX_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum CoordinatorEvent {
    StartTaskSucceeded {
        instance_id: InstanceId,
        reply: Reply<()>,
    },
    FinishTaskSucceeded {
        instance_id: InstanceId,
        reply: Reply<()>,
    },
    TaskFailed {
        instance_id: InstanceId,
        reply: Reply<()>,
    },
    ProcessCurrentNotification {
        reply: Reply<()>,
    },
    SignalReady {
        job_id: String,
        ud: i32,
        reply: Reply<()>,
    },
    SignalError {
        job_id: String,
        ud: i32,
        description: String,
        reply: Reply<()>,
    },
    BreakpointContinue {
        name: String,
        reply: Reply<()>,
    },
    GetCurrentState {
        reply: Reply<CoordinatorStatus>,
    },
}

impl CoordinatorEvent {
    fn reject(self, err: CoordinatorError) {
        match self {
            CoordinatorEvent::StartTaskSucceeded { reply, .. }
            | CoordinatorEvent::FinishTaskSucceeded { reply, .. }
            | CoordinatorEvent::TaskFailed { reply, .. }
            | CoordinatorEvent::ProcessCurrentNotification { reply }
            | CoordinatorEvent::SignalReady { reply, .. }
            | CoordinatorEvent::SignalError { reply, .. }
            | CoordinatorEvent::BreakpointContinue { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            CoordinatorEvent::GetCurrentState { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct Shared {
    task_id: TaskId,
    partition_id: PartitionId,
    config: Arc<CoordinatorConfig>,
    ports: CoordinatorPorts,
    issuer: SharedSequenceIssuer,
    commands: CommandProcessor,
    active: Mutex<Option<ActiveRun>>,
}

/// Present only while `run` is active.
struct ActiveRun {
    mailbox: mpsc::Sender<CoordinatorEvent>,
    // Cancelled under the same lock that removes this entry, so admin
    // commands never outlive the run.
    stopped: CancellationToken,
}

/// Handle to one coordinator. Cheap to clone; every clone talks to the
/// same event loop.
#[derive(Clone)]
pub struct JobCoordinator {
    shared: Arc<Shared>,
}

impl JobCoordinator {
    pub fn new(
        task_id: TaskId,
        partition_id: PartitionId,
        config: CoordinatorConfig,
        ports: CoordinatorPorts,
    ) -> Self {
        let issuer = SharedSequenceIssuer::new();
        let commands = CommandProcessor::new(
            Arc::clone(&ports.agent),
            config.retry_policy(),
            partition_id.clone(),
            issuer.clone(),
            config.cluster_manager_request_timeout(),
        )
        .with_ack_fault_injection(config.commands.inject_ack_fault_once);

        Self {
            shared: Arc::new(Shared {
                task_id,
                partition_id,
                config: Arc::new(config),
                ports,
                issuer,
                commands,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.shared.task_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mailbox(&self) -> Option<mpsc::Sender<CoordinatorEvent>> {
        self.active().as_ref().map(|run| run.mailbox.clone())
    }

    /// Token for one admin command, cancelled when the current run stops.
    fn command_scope(&self) -> Option<CancellationToken> {
        self.active().as_ref().map(|run| run.stopped.child_token())
    }

    /// Run the coordinator as primary with `primary_epoch` until `cancel`
    /// fires. Returns `Fatal` when the notification channel stops showing
    /// liveness.
    pub async fn run(
        &self,
        primary_epoch: i64,
        cancel: CancellationToken,
    ) -> Result<(), CoordinatorError> {
        let epoch = i32::try_from(primary_epoch)
            .ok()
            .filter(|e| *e >= 0)
            .ok_or_else(|| {
                CoordinatorError::InvalidArgument(format!(
                    "primary epoch {primary_epoch} must fit in 31 bits"
                ))
            })?;

        let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
        {
            let mut active = self.active();
            if active.is_some() {
                return Err(CoordinatorError::InvalidOperation(
                    "coordinator is already running".to_string(),
                ));
            }
            self.shared.issuer.begin_epoch(epoch)?;
            *active = Some(ActiveRun {
                mailbox: tx,
                stopped: cancel.child_token(),
            });
        }
        info!(task_id = %self.shared.task_id, epoch, "coordinator starting");

        self.shared.ports.policy_store.clear_cache();
        let mut machine = CoordinatorMachine::new(
            self.shared.ports.clone(),
            Arc::clone(&self.shared.config),
            self.shared.task_id.clone(),
            self.shared.partition_id.clone(),
            self.shared.issuer.clone(),
            cancel.clone(),
        );
        let mut job_timer = PollTimer::new("job", self.shared.config.job_polling_interval());
        let mut health_timer =
            PollTimer::new("health", self.shared.config.health_polling_interval());

        machine.recover_state();
        rearm(&mut job_timer, &machine);
        rearm(&mut health_timer, &machine);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                completion = machine.cm_call_finished() => {
                    machine.on_cm_completion(completion);
                    if !machine.is_cm_call_in_flight() {
                        job_timer.resume();
                        health_timer.resume();
                    }
                }

                event = rx.recv() => {
                    let Some(event) = event else {
                        break Ok(());
                    };
                    if let Err(err) = dispatch(&mut machine, event).await {
                        break Err(err);
                    }
                    rearm(&mut job_timer, &machine);
                }

                _ = timer::sleep_until(job_timer.deadline()) => {
                    job_timer.fire();
                    if !machine.is_cm_call_in_flight() {
                        match machine.process_current_notification().await {
                            Err(err) if err.is_fatal() => break Err(err),
                            Err(err) => warn!(error = %err, "processing notification failed"),
                            Ok(()) => {}
                        }
                    }
                    rearm(&mut job_timer, &machine);
                }

                _ = timer::sleep_until(health_timer.deadline()) => {
                    health_timer.fire();
                    if !machine.is_cm_call_in_flight() {
                        machine.report_health();
                    }
                    rearm(&mut health_timer, &machine);
                }
            }
        };

        match &result {
            Ok(()) => info!(task_id = %self.shared.task_id, "coordinator stopping"),
            Err(err) => error!(task_id = %self.shared.task_id, error = %err, "coordinator stopping"),
        }

        job_timer.stop();
        health_timer.stop();
        if let Some(active) = self.active().take() {
            active.stopped.cancel();
        }
        machine.shutdown().await;

        rx.close();
        while let Some(event) = rx.recv().await {
            event.reject(not_running());
        }
        self.shared.commands.cancel_all();

        result
    }

    pub async fn report_start_task_success(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        if *task_id == self.shared.task_id {
            self.request(
                |reply| CoordinatorEvent::StartTaskSucceeded { instance_id, reply },
                timeout,
                cancel,
            )
            .await
        } else if self.shared.commands.is_tracking(task_id) {
            self.shared
                .commands
                .on_report_start_task_success(task_id, instance_id)
                .await
        } else {
            Err(invalid_task_id(task_id))
        }
    }

    pub async fn report_finish_task_success(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        if *task_id == self.shared.task_id {
            self.request(
                |reply| CoordinatorEvent::FinishTaskSucceeded { instance_id, reply },
                timeout,
                cancel,
            )
            .await
        } else if self.shared.commands.is_tracking(task_id) {
            self.shared
                .commands
                .on_report_finish_task_success(task_id, instance_id)
                .await
        } else {
            Err(invalid_task_id(task_id))
        }
    }

    pub async fn report_task_failure(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        if *task_id == self.shared.task_id {
            self.request(
                |reply| CoordinatorEvent::TaskFailed { instance_id, reply },
                timeout,
                cancel,
            )
            .await
        } else if self.shared.commands.is_tracking(task_id) {
            self.shared
                .commands
                .on_report_task_failure(task_id, instance_id)
                .await
        } else {
            Err(invalid_task_id(task_id))
        }
    }

    /// Execute one text command. Admin commands require `is_admin`.
    pub async fn run_command(
        &self,
        is_admin: bool,
        text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, CoordinatorError> {
        let command = CoordinatorCommand::parse(text)?;
        if command.is_admin() && !is_admin {
            return Err(CoordinatorError::CommandParse(UNRECOGNIZED_COMMAND.to_string()));
        }
        debug!(?command, is_admin, "running command");

        match command {
            CoordinatorCommand::Task(task) => {
                let Some(scope) = self.command_scope() else {
                    return Err(not_running());
                };
                let command = self
                    .shared
                    .commands
                    .schedule_process_command(task, timeout, &scope);
                tokio::pin!(command);
                tokio::select! {
                    result = &mut command => result?,
                    _ = cancel.cancelled() => {
                        scope.cancel();
                        command.await?
                    }
                }
                Ok(String::new())
            }
            CoordinatorCommand::UpdateJobBlockingPolicy(policy) => {
                self.shared.ports.policy_store.update_policy(policy).await?;
                info!(policy = %policy, "job blocking policy updated");
                Ok(String::new())
            }
            CoordinatorCommand::GetJobBlockingPolicy => {
                let policy = self.shared.ports.policy_store.get_policy().await?;
                Ok(policy.to_string())
            }
            CoordinatorCommand::GetCurrentState => {
                let status = self
                    .request(
                        |reply| CoordinatorEvent::GetCurrentState { reply },
                        timeout,
                        cancel,
                    )
                    .await?;
                Ok(status.to_json())
            }
            CoordinatorCommand::ProcessCurrentNotification => {
                self.request(
                    |reply| CoordinatorEvent::ProcessCurrentNotification { reply },
                    timeout,
                    cancel,
                )
                .await?;
                Ok(String::new())
            }
            CoordinatorCommand::SignalReady { job_id, ud } => {
                self.request(
                    |reply| CoordinatorEvent::SignalReady { job_id, ud, reply },
                    timeout,
                    cancel,
                )
                .await?;
                Ok(String::new())
            }
            CoordinatorCommand::SignalError {
                job_id,
                ud,
                description,
            } => {
                self.request(
                    |reply| CoordinatorEvent::SignalError {
                        job_id,
                        ud,
                        description,
                        reply,
                    },
                    timeout,
                    cancel,
                )
                .await?;
                Ok(String::new())
            }
            CoordinatorCommand::BreakpointContinue(name) => {
                self.request(
                    |reply| CoordinatorEvent::BreakpointContinue { name, reply },
                    timeout,
                    cancel,
                )
                .await?;
                Ok(String::new())
            }
        }
    }

    /// Send an event to the loop and wait for its reply.
    async fn request<T>(
        &self,
        event: impl FnOnce(Reply<T>) -> CoordinatorEvent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, CoordinatorError> {
        let Some(mailbox) = self.mailbox() else {
            return Err(not_running());
        };
        let (reply, response) = oneshot::channel();

        let exchange = async move {
            if mailbox.send(event(reply)).await.is_err() {
                return Err(not_running());
            }
            match response.await {
                Ok(result) => result,
                Err(_) => Err(not_running()),
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(result) => result,
                Err(_) => Err(CoordinatorError::Timeout(format!(
                    "coordinator did not answer within {timeout:?}"
                ))),
            },
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
        }
    }
}

/// Apply one mailbox event. Only a fatal error escapes.
async fn dispatch(
    machine: &mut CoordinatorMachine,
    event: CoordinatorEvent,
) -> Result<(), CoordinatorError> {
    match event {
        CoordinatorEvent::StartTaskSucceeded { instance_id, reply } => {
            let _ = reply.send(machine.on_start_task_success(instance_id).await);
        }
        CoordinatorEvent::FinishTaskSucceeded { instance_id, reply } => {
            let _ = reply.send(machine.on_finish_task_success(instance_id).await);
        }
        CoordinatorEvent::TaskFailed { instance_id, reply } => {
            let _ = reply.send(machine.on_task_failure(instance_id).await);
        }
        CoordinatorEvent::ProcessCurrentNotification { reply } => {
            let result = machine.process_current_notification().await;
            if let Err(err) = &result
                && err.is_fatal()
            {
                let fatal = err.clone();
                let _ = reply.send(result);
                return Err(fatal);
            }
            let _ = reply.send(result);
        }
        CoordinatorEvent::SignalReady { job_id, ud, reply } => {
            let _ = reply.send(machine.signal_ready_command(&job_id, ud));
        }
        CoordinatorEvent::SignalError {
            job_id,
            ud,
            description,
            reply,
        } => {
            let _ = reply.send(machine.signal_error_command(&job_id, ud, &description));
        }
        CoordinatorEvent::BreakpointContinue { name, reply } => {
            machine.breakpoint_continue(&name);
            let _ = reply.send(Ok(()));
        }
        CoordinatorEvent::GetCurrentState { reply } => {
            let _ = reply.send(machine.status().await);
        }
    }
    Ok(())
}

/// Timers wait while a cluster manager call is outstanding.
fn rearm(timer: &mut PollTimer, machine: &CoordinatorMachine) {
    if machine.is_cm_call_in_flight() {
        timer.park();
    } else {
        timer.schedule();
    }
}

fn not_running() -> CoordinatorError {
    CoordinatorError::NotPrimary("coordinator is not running".to_string())
}

fn invalid_task_id(task_id: &TaskId) -> CoordinatorError {
    CoordinatorError::InvalidArgument(format!("invalid task ID {task_id}"))
}
