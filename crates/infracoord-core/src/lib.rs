//! infracoord-core
//!
//! Infrastructure coordinator: reconciles platform maintenance
//! notifications with the cluster manager's infrastructure task protocol.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, sequence, task, impact, notification, state, policy, errors, command）
//! - **ports**: 抽象化レイヤー（InfrastructureAgent, NotificationSource, PolicyStore, HealthReporter, Clock）
//! - **retry**: RetryPolicy（回数上限 + 固定バックオフ）
//! - **config**: CoordinatorConfig（JSON）
//! - **app**: アプリケーションロジック（builder, coordinator, machine, command_processor, など）
//! - **impls**: 実装（RecordingInfrastructureAgent など開発用）
//! - **observability**: tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod retry;

pub use self::app::{CoordinatorBuilder, JobCoordinator};
pub use self::config::CoordinatorConfig;
pub use self::domain::CoordinatorError;
