//! InMemoryPolicyStore - 開発用の JobBlockingPolicy ストア
//!
//! # 実装詳細
//! - バージョン付きの値（楽観的並行性制御）
//! - get はキャッシュから返す。clear_cache で破棄
//! - update は compare-and-set を RetryPolicy で再試行

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::domain::errors::{CoordinatorError, ErrorKind};
use crate::domain::policy::JobBlockingPolicy;
use crate::ports::PolicyStore;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedPolicy {
    pub policy: JobBlockingPolicy,
    pub version: u64,
}

fn conflicts_are_transient(err: &CoordinatorError) -> ErrorKind {
    match err {
        CoordinatorError::PolicyConflict { .. } => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

pub struct InMemoryPolicyStore {
    stored: Mutex<VersionedPolicy>,
    cache: Mutex<Option<JobBlockingPolicy>>,
    retry: RetryPolicy,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new(JobBlockingPolicy::default())
    }
}

impl InMemoryPolicyStore {
    pub fn new(initial: JobBlockingPolicy) -> Self {
        Self {
            stored: Mutex::new(VersionedPolicy {
                policy: initial,
                version: 0,
            }),
            cache: Mutex::new(None),
            retry: RetryPolicy::new(5, Duration::ZERO).with_classifier(conflicts_are_transient),
        }
    }

    fn stored(&self) -> MutexGuard<'_, VersionedPolicy> {
        self.stored.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, Option<JobBlockingPolicy>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> VersionedPolicy {
        *self.stored()
    }

    /// Write `policy` only if the stored version is still `expected_version`.
    pub fn compare_and_set(
        &self,
        expected_version: u64,
        policy: JobBlockingPolicy,
    ) -> Result<u64, CoordinatorError> {
        let mut stored = self.stored();
        if stored.version != expected_version {
            return Err(CoordinatorError::PolicyConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }
        stored.policy = policy;
        stored.version += 1;
        Ok(stored.version)
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(&self) -> Result<JobBlockingPolicy, CoordinatorError> {
        let mut cache = self.cache();
        if let Some(policy) = *cache {
            return Ok(policy);
        }
        let policy = self.stored().policy;
        *cache = Some(policy);
        Ok(policy)
    }

    async fn update_policy(&self, policy: JobBlockingPolicy) -> Result<(), CoordinatorError> {
        let version = self.retry.execute("UpdateJobBlockingPolicy", || {
            let current = self.snapshot().version;
            self.compare_and_set(current, policy)
        })?;
        *self.cache() = Some(policy);
        info!(%policy, version, "job blocking policy updated");
        Ok(())
    }

    fn clear_cache(&self) {
        *self.cache() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_bumps_version_and_refreshes_cache() {
        let store = InMemoryPolicyStore::default();
        assert_eq!(store.get_policy().await.unwrap(), JobBlockingPolicy::BlockNone);

        store
            .update_policy(JobBlockingPolicy::BlockAllJobs)
            .await
            .unwrap();

        assert_eq!(store.get_policy().await.unwrap(), JobBlockingPolicy::BlockAllJobs);
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn stale_version_conflicts() {
        let store = InMemoryPolicyStore::default();
        store.compare_and_set(0, JobBlockingPolicy::BlockNewUpdateJob).unwrap();

        assert_eq!(
            store.compare_and_set(0, JobBlockingPolicy::BlockAllJobs),
            Err(CoordinatorError::PolicyConflict {
                expected: 0,
                actual: 1
            })
        );
        assert_eq!(store.snapshot().policy, JobBlockingPolicy::BlockNewUpdateJob);
    }

    #[tokio::test]
    async fn cache_hides_writes_until_cleared() {
        let store = InMemoryPolicyStore::default();
        assert_eq!(store.get_policy().await.unwrap(), JobBlockingPolicy::BlockNone);

        // Written behind the cache's back, e.g. by another replica.
        store.compare_and_set(0, JobBlockingPolicy::BlockAllNewJobs).unwrap();
        assert_eq!(store.get_policy().await.unwrap(), JobBlockingPolicy::BlockNone);

        store.clear_cache();
        assert_eq!(store.get_policy().await.unwrap(), JobBlockingPolicy::BlockAllNewJobs);
    }
}
