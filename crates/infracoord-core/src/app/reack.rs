//! Bookkeeping for re-acknowledging the last completed job step.
//!
//! Kept in memory only. After a failover the platform re-sends the
//! notification and the coordinator acts on it again.

use chrono::{DateTime, Duration, Utc};

use crate::domain::notification::{Notification, NotificationType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckAction {
    SignalReady,
    SignalError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompletedJobStep {
    job_id: String,
    target_ud: i32,
    notification_type: NotificationType,
    action: AckAction,
    acked_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct LastCompletedJobStep {
    last: Option<CompletedJobStep>,
}

impl LastCompletedJobStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, notification: &Notification, action: AckAction, now: DateTime<Utc>) {
        self.last = Some(CompletedJobStep {
            job_id: notification.active_job_id.clone(),
            target_ud: notification.active_job_step_target_ud,
            notification_type: notification.notification_type,
            action,
            acked_at: now,
        });
    }

    /// Action to replay for `notification`, if it repeats the last
    /// acknowledged step and that ack is recent enough.
    pub fn replay_for(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Option<&AckAction> {
        let last = self.last.as_ref()?;
        let same_step = last.job_id == notification.active_job_id
            && last.target_ud == notification.active_job_step_target_ud
            && last.notification_type == notification.notification_type;
        (same_step && now - last.acked_at < threshold).then_some(&last.action)
    }
}
