use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use infracoord_core::app::{CoordinatorBuilder, JobCoordinator};
use infracoord_core::config::CoordinatorConfig;
use infracoord_core::domain::{
    ImpactReason, ImpactedInstance, InfrastructureTaskState, JobDetailedStatus, JobType,
    Notification, NotificationType, PartitionId,
};
use infracoord_core::impls::{
    InMemoryPolicyStore, RecordingInfrastructureAgent, ScriptedNotificationSource,
    TracingHealthReporter,
};
use infracoord_core::observability::{LogFormat, coordinator_span, init_tracing};

const PRIMARY_EPOCH: i64 = 1;

/// クラスタマネージャー役：ack 待ちのタスクを見つけたらコーディネーターに報告する
async fn simulated_cluster_manager(
    agent: Arc<RecordingInfrastructureAgent>,
    coordinator: JobCoordinator,
    cancel: CancellationToken,
) {
    let timeout = coordinator.config().cluster_manager_request_timeout();
    loop {
        for item in agent.pending_acknowledgements() {
            let task_id = &item.description.task_id;
            let instance_id = item.description.instance_id;
            let result = match item.state {
                InfrastructureTaskState::PreAckPending => {
                    coordinator
                        .report_start_task_success(task_id, instance_id, timeout, &cancel)
                        .await
                }
                _ => {
                    coordinator
                        .report_finish_task_success(task_id, instance_id, timeout, &cancel)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    info!(task_id = %task_id, instance_id = %instance_id, state = ?item.state, "acknowledged");
                    agent.mark_acknowledged(task_id);
                }
                // NotReady などは次の周回でやり直す
                Err(err) => warn!(task_id = %task_id, error = %err, "acknowledgement rejected"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }
}

fn notification(kind: NotificationType, status: JobDetailedStatus) -> Notification {
    Notification {
        notification_id: "demo-1".into(),
        notification_type: kind,
        active_job_id: "demo-job".into(),
        active_job_step_target_ud: 0,
        active_job_type: JobType::PlatformMaintenanceJob,
        active_job_detailed_status: status,
        impacted_instances: vec![
            ImpactedInstance::new("WebRole_IN_0", vec![ImpactReason::Reboot]),
            ImpactedInstance::new("WebRole_IN_1", vec![ImpactReason::OSUpdate]),
        ],
        active_job_includes_topology_change: false,
        requires_manual_approval: false,
    }
}

async fn wait_for_signals(source: &ScriptedNotificationSource, count: usize) {
    while source.ready_count() < count {
        sleep(Duration::from_millis(100)).await;
    }
}

/// 通知を start → complete と進めて、1 ジョブを最後まで流す
async fn drive_demo_job(
    source: Arc<ScriptedNotificationSource>,
    coordinator: JobCoordinator,
    cancel: CancellationToken,
) -> Result<String, infracoord_core::CoordinatorError> {
    source.set_notification(Some(notification(
        NotificationType::StartJobStep,
        JobDetailedStatus::WaitingForStartStepAcknowledgement,
    )));
    wait_for_signals(&source, 1).await;
    info!("start step acknowledged");

    source.set_notification(Some(notification(
        NotificationType::CompleteJobStep,
        JobDetailedStatus::WaitingForCompleteStepAcknowledgement,
    )));
    wait_for_signals(&source, 2).await;
    info!("complete step acknowledged");

    source.set_notification(None);
    let timeout = coordinator.config().command_timeout();
    coordinator
        .run_command(false, "GetCurrentState", timeout, &cancel)
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("INFRACOORD_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse().ok())
        .unwrap_or(LogFormat::Text);
    init_tracing(format);

    // (A) 設定：引数があれば JSON ファイル、なければデモ向けの短い周期
    let config = match std::env::args().nth(1) {
        Some(path) => CoordinatorConfig::from_json_file(path)?,
        None => CoordinatorConfig {
            job_polling_interval_secs: 1,
            health_polling_interval_secs: 5,
            ..CoordinatorConfig::default()
        },
    };

    // (B) 開発用の collaborator をつなぐ
    let partition_id = PartitionId::new("partition-0");
    let agent = Arc::new(RecordingInfrastructureAgent::new(partition_id.clone()));
    let source = Arc::new(ScriptedNotificationSource::new());
    let coordinator = CoordinatorBuilder::new("demo-tenant", partition_id)
        .config(config)
        .agent(agent.clone())
        .notifications(source.clone())
        .policy_store(Arc::new(InMemoryPolicyStore::default()))
        .health(Arc::new(TracingHealthReporter))
        .build()?;

    // (C) コーディネーターとクラスタマネージャー役を起動
    let cancel = CancellationToken::new();
    let run = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        let span = coordinator_span(coordinator.task_id(), PRIMARY_EPOCH);
        tokio::spawn(async move { coordinator.run(PRIMARY_EPOCH, cancel).await }.instrument(span))
    };
    let cluster_manager = tokio::spawn(simulated_cluster_manager(
        agent.clone(),
        coordinator.clone(),
        cancel.clone(),
    ));

    // (D) デモジョブを流す（Ctrl-C で中断）
    tokio::select! {
        status = drive_demo_job(source.clone(), coordinator.clone(), cancel.clone()) => {
            let status: serde_json::Value = serde_json::from_str(&status?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!(
                "cluster manager calls: start={} finish={} query={}",
                agent.start_calls().len(),
                agent.finish_calls().len(),
                agent.query_count()
            );
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // (E) 停止
    cancel.cancel();
    let _ = cluster_manager.await;
    run.await??;
    Ok(())
}
