//! HealthReporter port - ヘルスレポート（fire-and-forget）

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub source_id: String,
    pub property: String,
    pub state: HealthState,
    pub description: String,
    pub time_to_live: Option<Duration>,
}

impl HealthReport {
    pub fn new(
        source_id: impl Into<String>,
        property: impl Into<String>,
        state: HealthState,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            property: property.into(),
            state,
            description: description.into(),
            time_to_live: None,
        }
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

pub trait HealthReporter: Send + Sync {
    fn report(&self, report: HealthReport);
}
