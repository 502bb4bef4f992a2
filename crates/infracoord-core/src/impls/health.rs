//! HealthReporter の実装（開発用）

use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::ports::{HealthReport, HealthReporter, HealthState};

#[derive(Debug, Default, Clone, Copy)]
pub struct NullHealthReporter;

impl HealthReporter for NullHealthReporter {
    fn report(&self, _report: HealthReport) {}
}

/// Writes every report to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthReporter;

impl HealthReporter for TracingHealthReporter {
    fn report(&self, report: HealthReport) {
        match report.state {
            HealthState::Ok => info!(source = %report.source_id, property = %report.property, description = %report.description, "health ok"),
            HealthState::Warning | HealthState::Error => warn!(source = %report.source_id, property = %report.property, state = ?report.state, description = %report.description, "health degraded"),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    reports: Mutex<Vec<HealthReport>>,
}

impl RecordingHealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_for(&self, property: &str) -> Option<HealthReport> {
        self.reports()
            .into_iter()
            .rev()
            .find(|r| r.property == property)
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn report(&self, report: HealthReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}
