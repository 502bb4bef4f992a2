//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてコーディネーターを実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: コーディネーターの構築とワイヤリング
//! - **JobCoordinator**: イベントループと外部 API（report_* / run_command / run）
//! - **CoordinatorMachine**: 通知と CM タスクを突き合わせる状態機械
//! - **CommandProcessor**: 管理コマンド（start / finish）と ack の照合
//! - **PollTimer**: job / health のポーリング
//! - **BreakpointManager**: テスト用の一時停止ポイント

pub mod breakpoint;
pub mod builder;
pub mod command_processor;
pub mod coordinator;
pub mod machine;
pub mod pending;
pub mod reack;
pub mod status;
pub mod timer;

// 主要な型を再エクスポート
pub use self::breakpoint::BreakpointManager;
pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::command_processor::CommandProcessor;
pub use self::coordinator::JobCoordinator;
pub use self::machine::{CoordinatorMachine, CoordinatorPorts};
pub use self::pending::{CommandKind, ContextOutcome, PendingCommandContext, PendingCommandContextMap};
pub use self::status::CoordinatorStatus;
pub use self::timer::PollTimer;
