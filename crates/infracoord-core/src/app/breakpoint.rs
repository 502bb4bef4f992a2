//! Named breakpoints that let a test driver pause the state machine.
//!
//! `stop_at(name)` returns true while the breakpoint is engaged. The guarded
//! action is skipped and retried on the next poll, until a driver calls
//! `continue_past(name)`.

use tracing::{debug, info};

use crate::domain::ids::InstanceId;
use crate::domain::notification::Notification;
use crate::domain::policy::JobBlockingPolicy;

pub fn ready_to_execute(notification: &Notification) -> String {
    format!(
        "ReadyToExecute:{}:{}",
        notification.active_job_id, notification.active_job_step_target_ud
    )
}

pub fn job_execution_completed(instance_id: InstanceId) -> String {
    format!("JobExecutionCompleted:{instance_id}")
}

pub fn job_blocked(policy: JobBlockingPolicy, notification: &Notification) -> String {
    format!(
        "{policy}:{}:{}",
        notification.active_job_id, notification.active_job_step_target_ud
    )
}

#[derive(Debug, Default, Clone)]
pub struct BreakpointManager {
    last_hit: Option<String>,
    continue_past: Option<String>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_at(&mut self, name: &str) -> bool {
        if self.continue_past.as_deref() == Some(name) {
            debug!(breakpoint = name, "continuing past breakpoint");
            return false;
        }
        if self.last_hit.as_deref() != Some(name) {
            info!(breakpoint = name, "stopped at breakpoint");
        }
        self.last_hit = Some(name.to_string());
        true
    }

    pub fn continue_past(&mut self, name: impl Into<String>) {
        let name = name.into();
        info!(breakpoint = %name, "breakpoint continue");
        self.continue_past = Some(name);
    }

    pub fn last_hit(&self) -> Option<&str> {
        self.last_hit.as_deref()
    }

    pub fn continue_past_name(&self) -> Option<&str> {
        self.continue_past.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engaged_until_continued() {
        let mut bp = BreakpointManager::new();
        assert!(bp.stop_at("ReadyToExecute:job:0"));
        assert!(bp.stop_at("ReadyToExecute:job:0"));
        assert_eq!(bp.last_hit(), Some("ReadyToExecute:job:0"));

        bp.continue_past("ReadyToExecute:job:0");
        assert!(!bp.stop_at("ReadyToExecute:job:0"));
        assert!(bp.stop_at("ReadyToExecute:job:1"));
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(
            job_execution_completed(InstanceId::from_parts(1, 4)),
            "JobExecutionCompleted:0x100000004"
        );
    }
}
