//! JobBlockingPolicy - ジョブのブロックポリシー

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::CoordinatorError;
use super::notification::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobBlockingPolicy {
    Invalid,
    #[default]
    BlockNone,
    BlockNewUpdateJob,
    BlockNewMaintenanceJob,
    BlockAllNewJobs,
    BlockAllJobs,
    BlockNewImpactfulUpdateJobs,
    BlockNewImpactfulTenantUpdateJobs,
    BlockNewImpactfulPlatformUpdateJobs,
}

const ALL: [JobBlockingPolicy; 9] = [
    JobBlockingPolicy::Invalid,
    JobBlockingPolicy::BlockNone,
    JobBlockingPolicy::BlockNewUpdateJob,
    JobBlockingPolicy::BlockNewMaintenanceJob,
    JobBlockingPolicy::BlockAllNewJobs,
    JobBlockingPolicy::BlockAllJobs,
    JobBlockingPolicy::BlockNewImpactfulUpdateJobs,
    JobBlockingPolicy::BlockNewImpactfulTenantUpdateJobs,
    JobBlockingPolicy::BlockNewImpactfulPlatformUpdateJobs,
];

impl JobBlockingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            JobBlockingPolicy::Invalid => "Invalid",
            JobBlockingPolicy::BlockNone => "BlockNone",
            JobBlockingPolicy::BlockNewUpdateJob => "BlockNewUpdateJob",
            JobBlockingPolicy::BlockNewMaintenanceJob => "BlockNewMaintenanceJob",
            JobBlockingPolicy::BlockAllNewJobs => "BlockAllNewJobs",
            JobBlockingPolicy::BlockAllJobs => "BlockAllJobs",
            JobBlockingPolicy::BlockNewImpactfulUpdateJobs => "BlockNewImpactfulUpdateJobs",
            JobBlockingPolicy::BlockNewImpactfulTenantUpdateJobs => {
                "BlockNewImpactfulTenantUpdateJobs"
            }
            JobBlockingPolicy::BlockNewImpactfulPlatformUpdateJobs => {
                "BlockNewImpactfulPlatformUpdateJobs"
            }
        }
    }

    /// Whether starting a new job of `job_type` is blocked while idle.
    pub fn blocks_new_job(self, job_type: JobType) -> bool {
        match self {
            JobBlockingPolicy::BlockAllNewJobs => true,
            JobBlockingPolicy::BlockNewMaintenanceJob => job_type.is_maintenance(),
            JobBlockingPolicy::BlockNewUpdateJob => job_type.is_update(),
            _ => false,
        }
    }

    /// Whether starting an update job that impacts at least one node is blocked.
    pub fn blocks_impactful_job(self, job_type: JobType) -> bool {
        match self {
            JobBlockingPolicy::BlockNewImpactfulUpdateJobs => job_type.is_update(),
            JobBlockingPolicy::BlockNewImpactfulPlatformUpdateJobs => {
                job_type == JobType::PlatformUpdateJob
            }
            JobBlockingPolicy::BlockNewImpactfulTenantUpdateJobs => {
                job_type == JobType::DeploymentUpdateJob
            }
            _ => false,
        }
    }
}

impl fmt::Display for JobBlockingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobBlockingPolicy {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                CoordinatorError::InvalidArgument(format!("Unknown job blocking policy '{s}'"))
            })
    }
}
