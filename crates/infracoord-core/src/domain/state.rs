//! JobState - コーディネーターのジョブ状態
//!
//! # 状態遷移
//! ```text
//! Unknown -> Idle -> WaitingForApproval -> Executing -> WaitingForHealthCheck -> Idle ...
//! ```
//! `Unknown` is only observed before the first successful recovery query.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of the single outstanding infrastructure task.
///
/// Ordered by progress, so `state < JobState::Executing` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Unknown,
    Idle,
    WaitingForApproval,
    Executing,
    WaitingForHealthCheck,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Unknown => "Unknown",
            JobState::Idle => "Idle",
            JobState::WaitingForApproval => "WaitingForApproval",
            JobState::Executing => "Executing",
            JobState::WaitingForHealthCheck => "WaitingForHealthCheck",
        };
        f.write_str(s)
    }
}

/// Task state as reported by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfrastructureTaskState {
    PreProcessing,
    PreAckPending,
    PreAcked,
    PostProcessing,
    PostAckPending,
    PostAcked,
}

impl From<InfrastructureTaskState> for JobState {
    fn from(state: InfrastructureTaskState) -> Self {
        match state {
            InfrastructureTaskState::PreProcessing | InfrastructureTaskState::PreAckPending => {
                JobState::WaitingForApproval
            }
            InfrastructureTaskState::PreAcked => JobState::Executing,
            InfrastructureTaskState::PostProcessing | InfrastructureTaskState::PostAckPending => {
                JobState::WaitingForHealthCheck
            }
            InfrastructureTaskState::PostAcked => JobState::Idle,
        }
    }
}
