//! Coordinator configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::errors::CoordinatorError;
use crate::domain::impact::ImpactTranslator;
use crate::domain::notification::{ImpactReason, JobType};
use crate::domain::task::NodeTask;
use crate::retry::RetryPolicy;

const MAX_JOB_POLLING_INTERVAL_SECS: u64 = 10 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub task_id_prefix: String,
    pub job_polling_interval_secs: u64,
    pub health_polling_interval_secs: u64,
    pub health_report_expiry_factor: u32,
    pub cluster_manager_request_timeout_secs: u64,
    pub query_retry_delay_secs: u64,
    pub recent_job_state_update_threshold_secs: u64,
    pub allow_completed_job_step_reack: bool,
    pub always_ack_post_notifications: bool,
    pub allow_job_alert_on_topology_change: bool,
    pub wait_for_incarnation_change_on_startup: bool,
    pub max_incarnation_update_wait_secs: u64,
    pub node_task_for_impact_reason: HashMap<ImpactReason, NodeTask>,
    pub minimum_impact_platform_update_job: NodeTask,
    pub breakpoints: BreakpointConfig,
    pub retry: RetrySettings,
    pub commands: CommandSettings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_id_prefix: "Coordinator".to_string(),
            job_polling_interval_secs: 15,
            health_polling_interval_secs: 30,
            health_report_expiry_factor: 6,
            cluster_manager_request_timeout_secs: 30,
            query_retry_delay_secs: 5,
            recent_job_state_update_threshold_secs: 300,
            allow_completed_job_step_reack: true,
            always_ack_post_notifications: false,
            allow_job_alert_on_topology_change: false,
            wait_for_incarnation_change_on_startup: false,
            max_incarnation_update_wait_secs: 1800,
            node_task_for_impact_reason: HashMap::new(),
            minimum_impact_platform_update_job: NodeTask::Restart,
            breakpoints: BreakpointConfig::default(),
            retry: RetrySettings::default(),
            commands: CommandSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointConfig {
    /// Job types whose `ReadyToExecute` breakpoint is enabled.
    pub ready_to_execute: Vec<JobType>,
    pub job_execution_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delta_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delta_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub default_timeout_secs: u64,
    /// Fail the first acknowledgement of each admin task once.
    pub inject_ack_fault_once: bool,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            inject_ack_fault_once: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(s: &str) -> Result<Self, CoordinatorError> {
        serde_json::from_str(s)
            .map_err(|e| CoordinatorError::InvalidArgument(format!("config: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::InvalidArgument(format!("config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// `None` disables job polling.
    pub fn job_polling_interval(&self) -> Option<Duration> {
        match self.job_polling_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs.min(MAX_JOB_POLLING_INTERVAL_SECS))),
        }
    }

    /// `None` disables health polling.
    pub fn health_polling_interval(&self) -> Option<Duration> {
        match self.health_polling_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn health_report_time_to_live(&self) -> Duration {
        Duration::from_secs(
            self.health_polling_interval_secs
                .saturating_mul(u64::from(self.health_report_expiry_factor)),
        )
    }

    pub fn cluster_manager_request_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_manager_request_timeout_secs)
    }

    pub fn query_retry_delay(&self) -> Duration {
        Duration::from_secs(self.query_retry_delay_secs)
    }

    pub fn recent_job_state_update_threshold(&self) -> chrono::Duration {
        to_chrono(self.recent_job_state_update_threshold_secs)
    }

    /// `None` disables the notification channel liveness check.
    pub fn max_incarnation_update_wait(&self) -> Option<chrono::Duration> {
        match self.max_incarnation_update_wait_secs {
            0 => None,
            secs => Some(to_chrono(secs)),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.default_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delta_backoff_ms),
        )
    }

    pub fn impact_translator(&self) -> ImpactTranslator {
        ImpactTranslator::new(
            self.node_task_for_impact_reason.clone(),
            self.minimum_impact_platform_update_job,
        )
    }

    pub fn is_ready_to_execute_breakpoint_enabled(&self, job_type: JobType) -> bool {
        self.breakpoints.ready_to_execute.contains(&job_type)
    }
}

fn to_chrono(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = CoordinatorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.job_polling_interval(), Some(Duration::from_secs(15)));
        assert_eq!(config.health_report_time_to_live(), Duration::from_secs(180));
        assert!(config.allow_completed_job_step_reack);
        assert!(config.commands.inject_ack_fault_once);
    }

    #[test]
    fn partial_config_overrides_selected_fields() {
        let config = CoordinatorConfig::from_json_str(
            r#"{
                "job_polling_interval_secs": 0,
                "node_task_for_impact_reason": { "Reboot": "Relocate" },
                "breakpoints": { "ready_to_execute": ["PlatformUpdateJob"] },
                "retry": { "max_attempts": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.job_polling_interval(), None);
        assert_eq!(
            config.node_task_for_impact_reason.get(&ImpactReason::Reboot),
            Some(&NodeTask::Relocate)
        );
        assert!(config.is_ready_to_execute_breakpoint_enabled(JobType::PlatformUpdateJob));
        assert!(!config.is_ready_to_execute_breakpoint_enabled(JobType::DeploymentUpdateJob));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delta_backoff_ms, 500);
    }

    #[test]
    fn polling_interval_is_capped() {
        let config = CoordinatorConfig {
            job_polling_interval_secs: u64::MAX,
            ..CoordinatorConfig::default()
        };
        assert_eq!(
            config.job_polling_interval(),
            Some(Duration::from_secs(MAX_JOB_POLLING_INTERVAL_SECS))
        );
    }

    #[test]
    fn malformed_json_is_invalid_argument() {
        assert!(matches!(
            CoordinatorConfig::from_json_str("{ not json"),
            Err(CoordinatorError::InvalidArgument(_))
        ));
    }
}
