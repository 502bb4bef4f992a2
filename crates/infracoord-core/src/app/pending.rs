//! PendingCommandContext - 実行中の管理コマンドの追跡
//!
//! A context is resolved exactly once (complete, cancel, fail or time out).
//! Contexts live in a [`PendingCommandContextMap`] keyed by task id; a newer
//! instance id supersedes an older one, never the other way round.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, TaskId};
use crate::domain::task::NodeTaskDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Finish,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Start => f.write_str("start"),
            CommandKind::Finish => f.write_str("finish"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed(CoordinatorError),
}

type FaultHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Lifecycle {
    started: bool,
    timer: Option<JoinHandle<()>>,
    fault_handler: Option<FaultHandler>,
}

pub struct PendingCommandContext {
    command: CommandKind,
    task_id: TaskId,
    instance_id: InstanceId,
    node_tasks: Vec<NodeTaskDescription>,
    timeout: Duration,
    cancellation: CancellationToken,
    inject_fault: AtomicBool,
    outcome: watch::Sender<Option<ContextOutcome>>,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for PendingCommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommandContext")
            .field("command", &self.command)
            .field("task_id", &self.task_id)
            .field("instance_id", &self.instance_id)
            .field("outcome", &*self.outcome.borrow())
            .finish()
    }
}

impl PendingCommandContext {
    /// `cancellation` should be a child of the caller's token, so that
    /// cancelling the caller cancels the context but not the other way round.
    pub fn new(
        command: CommandKind,
        task_id: TaskId,
        instance_id: InstanceId,
        node_tasks: Vec<NodeTaskDescription>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            command,
            task_id,
            instance_id,
            node_tasks,
            timeout,
            cancellation,
            inject_fault: AtomicBool::new(true),
            outcome,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Disable the one-shot acknowledgement fault.
    pub fn without_fault_injection(self) -> Self {
        self.inject_fault.store(false, Ordering::Release);
        self
    }

    pub fn command(&self) -> CommandKind {
        self.command
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn node_tasks(&self) -> &[NodeTaskDescription] {
        &self.node_tasks
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn outcome(&self) -> Option<ContextOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// True exactly once per context, then false forever.
    pub fn should_inject_fault(&self) -> bool {
        self.inject_fault.swap(false, Ordering::AcqRel)
    }

    /// Arm the timeout timer and the cancellation hook.
    ///
    /// Returns false if the context was already resolved or started.
    pub fn try_start_context(self: &Arc<Self>, fault_handler: impl FnOnce() + Send + 'static) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.started || self.is_resolved() {
            return false;
        }
        lifecycle.started = true;
        lifecycle.fault_handler = Some(Box::new(fault_handler));

        let token = self.cancellation.clone();
        let timeout = self.timeout;
        let weak: Weak<Self> = Arc::downgrade(self);
        lifecycle.timer = Some(tokio::spawn(async move {
            let timed_out = tokio::select! {
                _ = tokio::time::sleep(timeout) => true,
                _ = token.cancelled() => false,
            };
            if let Some(context) = weak.upgrade() {
                if timed_out {
                    context.time_out();
                } else {
                    context.cancel();
                }
            }
        }));
        true
    }

    /// Resolve successfully. The timer stays armed; its later expiry is a no-op.
    pub fn complete(&self) -> bool {
        let resolved = self.resolve(ContextOutcome::Completed);
        if resolved {
            debug!(task_id = %self.task_id, instance_id = %self.instance_id, command = %self.command, "command completed");
        }
        resolved
    }

    pub fn cancel(&self) -> bool {
        let resolved = self.resolve(ContextOutcome::Cancelled);
        if resolved {
            debug!(task_id = %self.task_id, instance_id = %self.instance_id, command = %self.command, "command cancelled");
            self.cleanup();
        }
        resolved
    }

    pub fn fail(&self, err: CoordinatorError) -> bool {
        let resolved = self.resolve(ContextOutcome::Failed(err));
        if resolved {
            self.cleanup();
        }
        resolved
    }

    fn time_out(&self) -> bool {
        let resolved = self.resolve(ContextOutcome::TimedOut);
        if resolved {
            info!(task_id = %self.task_id, instance_id = %self.instance_id, command = %self.command, timeout = ?self.timeout, "command timed out");
            self.cleanup();
        }
        resolved
    }

    /// Wait for the context to be resolved.
    pub async fn wait(&self) -> ContextOutcome {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(ContextOutcome::Cancelled),
            Err(_) => ContextOutcome::Cancelled,
        }
    }

    /// Wait and map the outcome onto the caller's result.
    pub async fn wait_result(&self) -> Result<(), CoordinatorError> {
        match self.wait().await {
            ContextOutcome::Completed => Ok(()),
            ContextOutcome::Cancelled => Err(CoordinatorError::Cancelled),
            ContextOutcome::TimedOut => Err(CoordinatorError::Timeout(format!(
                "{} command for {} ({}) did not complete within {:?}",
                self.command, self.task_id, self.instance_id, self.timeout
            ))),
            ContextOutcome::Failed(err) => Err(err),
        }
    }

    fn resolve(&self, outcome: ContextOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    fn cleanup(&self) {
        let (timer, handler) = {
            let mut lifecycle = self.lock_lifecycle();
            (lifecycle.timer.take(), lifecycle.fault_handler.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.cancellation.cancel();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pending contexts keyed by task id.
#[derive(Debug)]
pub struct PendingCommandContextMap {
    name: &'static str,
    entries: Mutex<HashMap<TaskId, Arc<PendingCommandContext>>>,
}

impl PendingCommandContextMap {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Accept `context` unless a context with a larger instance id exists
    /// for the same task. A superseded context is cancelled after the map
    /// lock is released.
    pub fn try_add(self: &Arc<Self>, context: Arc<PendingCommandContext>) -> bool {
        let superseded = {
            let mut entries = self.lock_entries();
            if let Some(existing) = entries.get(context.task_id())
                && existing.instance_id() > context.instance_id()
            {
                info!(
                    map = self.name,
                    task_id = %context.task_id(),
                    existing = %existing.instance_id(),
                    rejected = %context.instance_id(),
                    "rejecting stale command"
                );
                return false;
            }

            let map = Arc::downgrade(self);
            let weak_context = Arc::downgrade(&context);
            let started = context.try_start_context(move || {
                if let (Some(map), Some(context)) = (map.upgrade(), weak_context.upgrade()) {
                    map.remove_if_same(&context);
                }
            });
            if !started {
                return false;
            }

            entries.insert(context.task_id().clone(), Arc::clone(&context))
        };

        if let Some(old) = superseded
            && !Arc::ptr_eq(&old, &context)
        {
            debug!(map = self.name, task_id = %old.task_id(), instance_id = %old.instance_id(), "cancelling superseded command");
            old.cancel();
        }
        true
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Arc<PendingCommandContext>> {
        self.lock_entries().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &TaskId) -> Option<Arc<PendingCommandContext>> {
        self.lock_entries().remove(task_id)
    }

    /// Remove the entry for `context`'s task id only if it is `context` itself.
    pub fn remove_if_same(&self, context: &Arc<PendingCommandContext>) -> bool {
        let mut entries = self.lock_entries();
        match entries.get(context.task_id()) {
            Some(current) if Arc::ptr_eq(current, context) => {
                entries.remove(context.task_id());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.lock_entries().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot and clear the map, then cancel every context outside the lock.
    pub fn cancel(&self) {
        let drained: Vec<Arc<PendingCommandContext>> =
            self.lock_entries().drain().map(|(_, c)| c).collect();
        for context in drained {
            context.cancel();
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<PendingCommandContext>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
