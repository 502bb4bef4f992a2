//! PolicyStore port - JobBlockingPolicy の永続化

use async_trait::async_trait;

use crate::domain::errors::CoordinatorError;
use crate::domain::policy::JobBlockingPolicy;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self) -> Result<JobBlockingPolicy, CoordinatorError>;

    async fn update_policy(&self, policy: JobBlockingPolicy) -> Result<(), CoordinatorError>;

    /// Drop any cached value, e.g. after a primary/secondary role change.
    fn clear_cache(&self);
}
