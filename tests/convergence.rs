use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{Mutex, oneshot},
};

use cloudscale::{
    clock::SystemClock,
    http::build_router,
    configure::{ConfigureFuture, Configurator, VerifyFuture},
    ledger::RequestLedger,
    provision::{ProvisionError, ProvisionFuture, Provisioner},
    reconcile::{ConvergeOutcome, Reconciler},
    scheduler::{Scheduler, SubmitError, SubmitOutcome},
    topology::{ClusterState, PrimaryNode, ProvisionOutput},
};

fn outputs(target: ClusterState) -> Value {
    let ips = |prefix: u8, n: u32| {
        (1..=n)
            .map(|i| format!("{prefix}.1.1.{i}"))
            .collect::<Vec<_>>()
    };
    json!({
        "master_ip_addresses": { "value": ips(3, target.master_count) },
        "master_private_ip_addresses": { "value": ips(30, target.master_count) },
        "servant_ip_addresses": { "value": ips(4, target.servant_count) },
        "servant_private_ip_addresses": { "value": ips(40, target.servant_count) },
    })
}

#[derive(Default)]
struct SlowCloud {
    delay: Duration,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    targets: StdMutex<Vec<ClusterState>>,
}

#[derive(Clone)]
struct SlowCloudHandle(Arc<SlowCloud>);

impl Provisioner for SlowCloudHandle {
    fn provision(&self, target: ClusterState) -> ProvisionFuture {
        let cloud = self.0.clone();
        Box::pin(async move {
            cloud.calls.fetch_add(1, Ordering::SeqCst);
            let now = cloud.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            cloud.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(cloud.delay).await;
            cloud.in_flight.fetch_sub(1, Ordering::SeqCst);
            cloud.targets.lock().unwrap().push(target);

            let failed = cloud
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(ProvisionError::Other("quota exceeded".to_string()));
            }
            Ok(outputs(target))
        })
    }

    fn name(&self) -> &'static str {
        "slow-cloud"
    }
}

struct HealthySwarm;

impl Configurator for HealthySwarm {
    fn configure(&self, _output: ProvisionOutput) -> ConfigureFuture {
        Box::pin(async { Ok(()) })
    }

    fn verify(&self, _target: ClusterState) -> VerifyFuture {
        Box::pin(async { Ok(true) })
    }

    fn name(&self) -> &'static str {
        "healthy"
    }
}

fn reconciler(cloud: &Arc<SlowCloud>) -> Arc<Reconciler> {
    let ledger = Arc::new(Mutex::new(RequestLedger::new(Arc::new(SystemClock))));
    Arc::new(Reconciler::new(
        ledger,
        Arc::new(SlowCloudHandle(cloud.clone())),
        Arc::new(HealthySwarm),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_and_timer_never_overlap_provisioning() {
    let cloud = Arc::new(SlowCloud {
        delay: Duration::from_millis(25),
        ..Default::default()
    });
    let scheduler = Arc::new(Scheduler::new(
        reconciler(&cloud),
        Duration::from_millis(10),
    ));
    assert!(scheduler.start());

    let mut tasks = Vec::new();
    for n in 1..=8u32 {
        let s = scheduler.clone();
        tasks.push(tokio::spawn(async move {
            s.submit(Some(format!("svc-{n}")), 0, n).await
        }));
    }
    for t in tasks {
        let outcome = t.await.unwrap().unwrap();
        assert!(matches!(outcome, SubmitOutcome::Satisfied { .. }));
    }

    let applied = scheduler.reconciler().applied().await.unwrap();
    assert_eq!(applied.state, ClusterState::new(0, 8));
    assert_eq!(applied.primary, PrimaryNode::Local);
    assert_eq!(cloud.max_in_flight.load(Ordering::SeqCst), 1);

    scheduler.stop().await;
    let calls = cloud.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cloud.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn transient_failure_is_retried_to_convergence() {
    let cloud = Arc::new(SlowCloud {
        failures_left: AtomicUsize::new(1),
        ..Default::default()
    });
    let reconciler = reconciler(&cloud);
    reconciler
        .ledger()
        .lock()
        .await
        .record_request("web", 1, 3)
        .unwrap();

    let err = reconciler.converge().await.unwrap_err();
    assert_eq!(err.code(), "terraform_operation");
    assert_eq!(reconciler.applied().await, None);

    let outcome = reconciler.converge().await.unwrap();
    match outcome {
        ConvergeOutcome::Converged(applied) => {
            assert_eq!(applied.state, ClusterState::new(1, 3));
            assert_eq!(applied.primary, PrimaryNode::Remote("3.1.1.1".to_string()));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        *cloud.targets.lock().unwrap(),
        vec![ClusterState::new(1, 3), ClusterState::new(1, 3)]
    );
}

#[tokio::test]
async fn stopped_scheduler_rejects_new_work() {
    let cloud = Arc::new(SlowCloud::default());
    let scheduler = Scheduler::new(reconciler(&cloud), Duration::from_millis(10));
    scheduler.start();
    scheduler.stop().await;

    assert_eq!(
        scheduler.submit(Some("late".to_string()), 0, 1).await,
        Err(SubmitError::Stopped)
    );
    assert!(!scheduler.start());
    assert!(scheduler.reconciler().ledger().lock().await.is_empty());
}

#[tokio::test]
async fn graceful_shutdown_answers_blocked_scale_call_with_503() {
    let cloud = Arc::new(SlowCloud {
        delay: Duration::from_secs(2),
        ..Default::default()
    });
    let scheduler = Arc::new(Scheduler::new(reconciler(&cloud), Duration::from_secs(3600)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (signal_tx, signal_rx) = oneshot::channel::<()>();
    let shutdown = scheduler.clone().stop_on(async move {
        let _ = signal_rx.await;
    });
    let server = tokio::spawn(async move {
        axum::serve(listener, build_router(scheduler.clone()))
            .with_graceful_shutdown(shutdown)
            .await
            .unwrap();
        scheduler.stop().await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /scale?key=k&servant_count=2 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while cloud.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    signal_tx.send(()).unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_millis(500), stream.read_to_string(&mut response))
        .await
        .expect("scale call left hanging during shutdown")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "{response}");
    assert!(response.contains("\"key\":\"k\""), "{response}");

    tokio::time::timeout(Duration::from_millis(500), server)
        .await
        .expect("server did not drain")
        .unwrap();
}
