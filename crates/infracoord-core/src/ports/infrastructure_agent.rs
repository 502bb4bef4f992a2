//! InfrastructureAgent port - クラスタマネージャーとの非同期タスクプロトコル

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::CoordinatorError;
use crate::domain::ids::{InstanceId, TaskId};
use crate::domain::task::{InfrastructureTaskDescription, InfrastructureTaskResultItem};

/// Client of the cluster manager's long-running infrastructure task API.
///
/// Every call is bounded by `timeout`; implementations report an elapsed
/// bound as [`CoordinatorError::Timeout`] so the retry layer can classify it.
#[async_trait]
pub trait InfrastructureAgent: Send + Sync {
    async fn start_infrastructure_task(
        &self,
        description: &InfrastructureTaskDescription,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError>;

    async fn finish_infrastructure_task(
        &self,
        task_id: &TaskId,
        instance_id: InstanceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError>;

    async fn query_infrastructure_task(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<InfrastructureTaskResultItem>, CoordinatorError>;
}
