//! End-to-end distributed flow: a controller and one worker in-process,
//! talking over loopback TCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use vajra_controller::{ControllerSettings, Coordinator, DistributedTestRequest};
use vajra_core::engine::TestStatus;
use vajra_core::task::TaskRegistry;
use vajra_rpc::messages::{RampConfig, RampKind};
use vajra_worker::{WorkerConfig, WorkerRuntime};

struct Cluster {
    coordinator: Arc<Coordinator>,
    controller_cancel: CancellationToken,
    worker_cancel: CancellationToken,
}

impl Cluster {
    async fn shutdown(self) {
        self.worker_cancel.cancel();
        self.controller_cancel.cancel();
        // Give the worker a moment to drain its farewell heartbeat.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Boot a controller plus one worker on ephemeral loopback ports and wait
/// for the worker's registration to land.
async fn start_cluster() -> Cluster {
    let coordinator = Arc::new(Coordinator::new(ControllerSettings {
        min_workers: 1,
        heartbeat_interval_seconds: 1,
        metrics_interval_seconds: 1,
        ..ControllerSettings::default()
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind controller");
    let controller_addr = listener.local_addr().expect("controller addr").to_string();
    let controller_cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&coordinator).serve(listener, controller_cancel.clone()));

    let mut worker_config = WorkerConfig::new(controller_addr);
    worker_config.rpc_port = 0; // ephemeral
    worker_config.max_capacity = 1_000;
    let runtime = Arc::new(WorkerRuntime::new(
        worker_config,
        Arc::new(TaskRegistry::with_builtin_tasks()),
    ));
    let worker_cancel = runtime.cancel_token();
    tokio::spawn(Arc::clone(&runtime).run());

    let deadline = Instant::now() + Duration::from_secs(10);
    while coordinator.manager().workers().is_empty() {
        assert!(
            Instant::now() < deadline,
            "worker did not register with the controller in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Cluster {
        coordinator,
        controller_cancel,
        worker_cancel,
    }
}

fn sleep_request(test_id: &str, duration_seconds: u64, target_tps: u32) -> DistributedTestRequest {
    DistributedTestRequest {
        test_id: test_id.to_string(),
        task_type: "SLEEP".to_string(),
        parameters: HashMap::from([("duration".to_string(), "5".to_string())]),
        target_tps,
        duration_seconds,
        max_concurrency: 2,
        ramp: RampConfig {
            kind: RampKind::Linear,
            starting_concurrency: 1,
            step: 1,
            interval_seconds: 1,
            duration_seconds: 1,
        },
    }
}

async fn wait_for_status(
    coordinator: &Coordinator,
    test_id: &str,
    wanted: TestStatus,
    budget: Duration,
) {
    let deadline = Instant::now() + budget;
    loop {
        let status = coordinator.status(test_id).await.expect("status").status;
        if status == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "test {test_id} did not reach {wanted:?} (currently {status:?})"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn distributed_test_runs_to_completion_with_aggregated_metrics() {
    let cluster = start_cluster().await;

    let test_id = cluster
        .coordinator
        .start_test(sleep_request("e2e-complete", 2, 200))
        .await
        .expect("distributed start");

    wait_for_status(
        &cluster.coordinator,
        &test_id,
        TestStatus::Completed,
        Duration::from_secs(30),
    )
    .await;

    let snapshot = cluster
        .coordinator
        .metrics(&test_id)
        .await
        .expect("aggregated metrics");
    assert!(
        snapshot.total_tasks > 0,
        "aggregate must reflect executed tasks: {snapshot:?}"
    );
    assert_eq!(snapshot.failed_tasks, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn distributed_test_stops_on_request() {
    let cluster = start_cluster().await;

    let test_id = cluster
        .coordinator
        .start_test(sleep_request("e2e-stop", 60, 100))
        .await
        .expect("distributed start");

    // Let the stream deliver at least one running report.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let status = cluster.coordinator.status(&test_id).await.expect("status");
    assert!(
        matches!(status.status, TestStatus::Running),
        "expected a running distributed test, got {:?}",
        status.status
    );

    cluster
        .coordinator
        .stop_test(&test_id, true)
        .await
        .expect("stop");

    wait_for_status(
        &cluster.coordinator,
        &test_id,
        TestStatus::Stopped,
        Duration::from_secs(30),
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn worker_heartbeats_report_booked_load() {
    let cluster = start_cluster().await;

    cluster
        .coordinator
        .start_test(sleep_request("e2e-load", 10, 300))
        .await
        .expect("distributed start");

    // The distributor books the share immediately; heartbeats keep
    // confirming it while the test runs.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let workers = cluster.coordinator.manager().workers();
        if workers.first().map(|w| w.current_load) == Some(300) {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "controller never observed the booked load: {workers:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cluster
        .coordinator
        .stop_test("e2e-load", true)
        .await
        .expect("stop");
    cluster.shutdown().await;
}
