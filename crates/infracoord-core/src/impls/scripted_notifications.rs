//! ScriptedNotificationSource - テスト用の通知チャネル

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::errors::CoordinatorError;
use crate::domain::notification::{Notification, NotificationType};
use crate::ports::NotificationSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRecord {
    Ready {
        job_id: String,
        ud: i32,
        notification_type: NotificationType,
    },
    Error {
        job_id: String,
        ud: i32,
        notification_type: NotificationType,
        description: String,
    },
}

#[derive(Default)]
struct SourceState {
    current: Option<Notification>,
    incarnation: Option<u64>,
    signals: Vec<SignalRecord>,
    signal_failures: VecDeque<CoordinatorError>,
}

/// Notification source whose current notification is set by the test.
#[derive(Default)]
pub struct ScriptedNotificationSource {
    state: Mutex<SourceState>,
}

impl ScriptedNotificationSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_notification(&self, notification: Option<Notification>) {
        self.lock().current = notification;
    }

    pub fn set_incarnation(&self, incarnation: Option<u64>) {
        self.lock().incarnation = incarnation;
    }

    pub fn bump_incarnation(&self) {
        let mut state = self.lock();
        state.incarnation = Some(state.incarnation.map_or(1, |i| i + 1));
    }

    pub fn fail_next_signal(&self, err: CoordinatorError) {
        self.lock().signal_failures.push_back(err);
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.lock().signals.clone()
    }

    pub fn ready_count(&self) -> usize {
        self.lock()
            .signals
            .iter()
            .filter(|s| matches!(s, SignalRecord::Ready { .. }))
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.lock()
            .signals
            .iter()
            .filter(|s| matches!(s, SignalRecord::Error { .. }))
            .count()
    }

    fn record(&self, record: SignalRecord) -> Result<(), CoordinatorError> {
        let mut state = self.lock();
        if let Some(err) = state.signal_failures.pop_front() {
            return Err(err);
        }
        state.signals.push(record);
        Ok(())
    }
}

impl NotificationSource for ScriptedNotificationSource {
    fn current_notification(&self) -> Option<Notification> {
        self.lock().current.clone()
    }

    fn signal_ready(&self, notification: &Notification) -> Result<(), CoordinatorError> {
        self.record(SignalRecord::Ready {
            job_id: notification.active_job_id.clone(),
            ud: notification.active_job_step_target_ud,
            notification_type: notification.notification_type,
        })
    }

    fn signal_error(
        &self,
        notification: &Notification,
        description: &str,
    ) -> Result<(), CoordinatorError> {
        self.record(SignalRecord::Error {
            job_id: notification.active_job_id.clone(),
            ud: notification.active_job_step_target_ud,
            notification_type: notification.notification_type,
            description: description.to_string(),
        })
    }

    fn health_incarnation(&self) -> Option<u64> {
        self.lock().incarnation
    }
}
