//! Domain model (ids, node tasks, notifications, job state, policy, errors).
//!
//! - ids / sequence: InstanceId の構成と単調増加の発行
//! - task / impact: NodeTask と通知からの変換
//! - notification / state / policy: 外部から見える状態
//! - command: 管理コマンドのテキストプロトコル

pub mod command;
pub mod errors;
pub mod ids;
pub mod impact;
pub mod notification;
pub mod policy;
pub mod sequence;
pub mod state;
pub mod task;

pub use self::command::{CoordinatorCommand, TaskCommand};
pub use self::errors::{Classifier, CoordinatorError, ErrorKind, classify};
pub use self::ids::{InstanceId, PartitionId, TaskId};
pub use self::impact::ImpactTranslator;
pub use self::notification::{
    ImpactReason, ImpactedInstance, JobDetailedStatus, JobType, Notification, NotificationType,
};
pub use self::policy::JobBlockingPolicy;
pub use self::sequence::{SEQUENCE_NUMBER_STRIDE, SequenceIssuer, SharedSequenceIssuer};
pub use self::state::{InfrastructureTaskState, JobState};
pub use self::task::{
    InfrastructureTaskDescription, InfrastructureTaskResultItem, NodeTask, NodeTaskDescription,
};
