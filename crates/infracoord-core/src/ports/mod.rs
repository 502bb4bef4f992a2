//! Ports - 抽象化レイヤー
//!
//! コーディネーターが消費する外部システムへのインターフェース。
//! 実装はこのクレートの外（またはテスト用に impls）に置きます。
//!
//! - InfrastructureAgent: クラスタマネージャー（start / finish / query）
//! - NotificationSource: クラウド基盤の通知チャネル
//! - PolicyStore: JobBlockingPolicy の保存先
//! - HealthReporter: ヘルスレポートの送信先
//! - Clock: 時刻

pub mod clock;
pub mod health;
pub mod infrastructure_agent;
pub mod notification_source;
pub mod policy_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::health::{HealthReport, HealthReporter, HealthState};
pub use self::infrastructure_agent::InfrastructureAgent;
pub use self::notification_source::NotificationSource;
pub use self::policy_store::PolicyStore;
