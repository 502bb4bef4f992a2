//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **RecordingInfrastructureAgent**: タスクテーブルを持つクラスタマネージャーの代役
//! - **ScriptedNotificationSource**: 通知を差し替え可能な通知チャネル
//! - **InMemoryPolicyStore**: バージョン付きのポリシーストア
//! - **RecordingHealthReporter / TracingHealthReporter / NullHealthReporter**

pub mod health;
pub mod inmem_policy;
pub mod recording_agent;
pub mod scripted_notifications;

pub use self::health::{NullHealthReporter, RecordingHealthReporter, TracingHealthReporter};
pub use self::inmem_policy::{InMemoryPolicyStore, VersionedPolicy};
pub use self::recording_agent::RecordingInfrastructureAgent;
pub use self::scripted_notifications::{ScriptedNotificationSource, SignalRecord};
