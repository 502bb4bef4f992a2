//! NotificationSource port - メンテナンス通知チャネル

use crate::domain::errors::CoordinatorError;
use crate::domain::notification::Notification;

/// Read side and acknowledgement side of the platform notification channel.
pub trait NotificationSource: Send + Sync {
    fn current_notification(&self) -> Option<Notification>;

    fn signal_ready(&self, notification: &Notification) -> Result<(), CoordinatorError>;

    fn signal_error(
        &self,
        notification: &Notification,
        description: &str,
    ) -> Result<(), CoordinatorError>;

    /// Liveness counter of the channel. It changes whenever the platform
    /// refreshes its view; `None` when the channel does not expose one.
    fn health_incarnation(&self) -> Option<u64> {
        None
    }
}
