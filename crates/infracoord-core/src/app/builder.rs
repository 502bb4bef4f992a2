//! CoordinatorBuilder - コーディネーターの構築とワイヤリング
//!
//! # 方針
//! - 必須の port（agent / notifications / policy_store）が無ければ build() で失敗
//! - health と clock は省略可（NullHealthReporter / SystemClock）
//! - task id は `{prefix}/{tenant}/{partition}` で固定

use std::sync::Arc;

use super::coordinator::JobCoordinator;
use super::machine::CoordinatorPorts;
use crate::config::CoordinatorConfig;
use crate::domain::ids::{PartitionId, TaskId};
use crate::impls::NullHealthReporter;
use crate::ports::{
    Clock, HealthReporter, InfrastructureAgent, NotificationSource, PolicyStore, SystemClock,
};

/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new("contoso", PartitionId::new("p1"))
///     .agent(agent)
///     .notifications(source)
///     .policy_store(store)
///     .build()?;
/// ```
pub struct CoordinatorBuilder {
    tenant: String,
    partition_id: PartitionId,
    config: CoordinatorConfig,
    agent: Option<Arc<dyn InfrastructureAgent>>,
    notifications: Option<Arc<dyn NotificationSource>>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    health: Option<Arc<dyn HealthReporter>>,
    clock: Option<Arc<dyn Clock>>,
}

/// BuildError はコーディネーター構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing port: {0}. It must be set before build().")]
    MissingPort(&'static str),

    #[error("tenant id must not be empty")]
    EmptyTenant,
}

impl CoordinatorBuilder {
    pub fn new(tenant: impl Into<String>, partition_id: PartitionId) -> Self {
        Self {
            tenant: tenant.into(),
            partition_id,
            config: CoordinatorConfig::default(),
            agent: None,
            notifications: None,
            policy_store: None,
            health: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agent(mut self, agent: Arc<dyn InfrastructureAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationSource>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn policy_store(mut self, policy_store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(policy_store);
        self
    }

    pub fn health(mut self, health: Arc<dyn HealthReporter>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<JobCoordinator, BuildError> {
        if self.tenant.trim().is_empty() {
            return Err(BuildError::EmptyTenant);
        }
        let ports = CoordinatorPorts {
            agent: self.agent.ok_or(BuildError::MissingPort("agent"))?,
            notifications: self
                .notifications
                .ok_or(BuildError::MissingPort("notifications"))?,
            policy_store: self
                .policy_store
                .ok_or(BuildError::MissingPort("policy_store"))?,
            health: self
                .health
                .unwrap_or_else(|| Arc::new(NullHealthReporter)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        let task_id = TaskId::for_coordinator(
            &self.config.task_id_prefix,
            &self.tenant,
            &self.partition_id,
        );
        Ok(JobCoordinator::new(
            task_id,
            self.partition_id,
            self.config,
            ports,
        ))
    }
}
