use chrono::Duration as ChronoDuration;
use queue_autoscaler::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_test::{assert_err, assert_ok};

/// Spawns real workers that poll a private broker, so the measured queues
/// are never drained behind the test's back.
struct IdleSpawner {
    sandbox: Arc<MemoryBroker>,
    spawned: AtomicUsize,
    retired: AtomicUsize,
}

impl IdleSpawner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sandbox: Arc::new(MemoryBroker::new()),
            spawned: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WorkerSpawner for IdleSpawner {
    async fn spawn(&self, queue: &str, worker_id: String) -> Result<WorkerHandle, AutoscalerError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let handler: Arc<dyn JobHandler> = Arc::new(handler_fn(|_job: Job| async { Ok(()) }));
        WorkerHandle::start(
            worker_id,
            queue.to_string(),
            self.sandbox.clone(),
            handler,
            Duration::from_millis(20),
        )
        .await
    }

    async fn retire(&self, handle: WorkerHandle, timeout: Duration) -> Result<(), AutoscalerError> {
        self.retired.fetch_add(1, Ordering::SeqCst);
        handle.close(timeout).await
    }
}

fn policy(name: &str) -> QueueConfig {
    QueueConfig::new(name)
        .workers(1, 5)
        .lag_threshold_ms(30_000)
        .target_jobs_per_worker(10)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn build(
    broker: &Arc<MemoryBroker>,
    spawner: &Arc<IdleSpawner>,
    queues: Vec<QueueConfig>,
) -> Autoscaler {
    AutoscalerBuilder::new(AutoscalerConfig::default())
        .queues(queues)
        .broker(broker.clone())
        .spawner(spawner.clone())
        .tick_interval(Duration::from_millis(20))
        .worker_close_timeout(Duration::from_secs(1))
        .build()
        .await
        .expect("Failed to build autoscaler")
}

async fn enqueue_aged(broker: &MemoryBroker, queue: &str, count: usize, age_secs: i64) {
    let enqueued_at = Utc::now() - ChronoDuration::seconds(age_secs);
    for i in 0..count {
        broker
            .enqueue(queue, Job::new(queue, format!("job-{}", i), vec![]).enqueued_at(enqueued_at))
            .await
            .expect("Failed to enqueue");
    }
}

/// Move `take` waiting jobs to active and complete `finish` of them.
async fn work_off(broker: &MemoryBroker, queue: &str, take: usize, finish: usize) {
    for i in 0..take {
        let job = broker
            .fetch_next(queue, Duration::from_millis(10))
            .await
            .expect("fetch failed")
            .expect("queue ran dry");
        if i < finish {
            broker.complete(&job).await.expect("complete failed");
        }
    }
}

fn decision(report: &PassReport, queue: &str) -> ScalingDecision {
    match report.outcome(queue) {
        Some(QueueOutcome::Scaled { decision, .. }) => decision.clone(),
        other => panic!("queue {} was not scaled: {:?}", queue, other),
    }
}

#[tokio::test]
async fn test_initialization_starts_min_workers_per_queue() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(
        &broker,
        &spawner,
        vec![policy("emails"), policy("reports").workers(3, 6)],
    )
    .await;

    assert_ok!(autoscaler.initialize().await);

    assert_eq!(autoscaler.worker_count("emails"), 1);
    assert_eq!(autoscaler.worker_count("reports"), 3);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 4);

    assert_ok!(autoscaler.shutdown().await);
    assert_eq!(spawner.retired.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_urgent_backlog_scales_to_max_then_idle_returns_to_min() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(&broker, &spawner, vec![policy("q")]).await;
    assert_ok!(autoscaler.initialize().await);

    // waiting=50, lag=40s, current=1 -> 5
    enqueue_aged(&broker, "q", 50, 40).await;
    let report = autoscaler.tick().await;
    let d = decision(&report, "q");
    assert_eq!(d.rule, ScalingRule::UrgentScaleUp);
    assert_eq!((d.current, d.recommended), (1, 5));
    assert_eq!(autoscaler.worker_count("q"), 5);

    // waiting=0, active=0, current=5 -> 1
    work_off(&broker, "q", 50, 50).await;
    let report = autoscaler.tick().await;
    let d = decision(&report, "q");
    assert_eq!(d.rule, ScalingRule::Idle);
    assert_eq!(d.recommended, 1);
    assert_eq!(autoscaler.worker_count("q"), 1);

    assert_ok!(autoscaler.shutdown().await);
}

#[tokio::test]
async fn test_steady_scale_up_then_sticky_hold() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(&broker, &spawner, vec![policy("q")]).await;
    assert_ok!(autoscaler.initialize().await);

    // waiting=25, lag=5s, current=1 -> 3
    enqueue_aged(&broker, "q", 25, 5).await;
    let report = autoscaler.tick().await;
    let d = decision(&report, "q");
    assert_eq!(d.rule, ScalingRule::Steady);
    assert_eq!(d.recommended, 3);
    assert_eq!(autoscaler.worker_count("q"), 3);

    // waiting=8, active=2, current=3 -> 3
    work_off(&broker, "q", 17, 15).await;
    let report = autoscaler.tick().await;
    let d = decision(&report, "q");
    assert_eq!(d.rule, ScalingRule::Sticky);
    assert_eq!(d.recommended, 3);
    assert_eq!(report.mutations(), 0);
    assert_eq!(autoscaler.worker_count("q"), 3);

    assert_ok!(autoscaler.shutdown().await);
}

#[tokio::test]
async fn test_identical_metrics_cause_no_second_mutation() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(&broker, &spawner, vec![policy("q")]).await;
    assert_ok!(autoscaler.initialize().await);

    enqueue_aged(&broker, "q", 25, 5).await;
    let first = autoscaler.tick().await;
    let spawned_after_first = spawner.spawned.load(Ordering::SeqCst);

    let second = autoscaler.tick().await;
    assert_eq!(decision(&first, "q").recommended, decision(&second, "q").recommended);
    assert_eq!(second.mutations(), 0);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), spawned_after_first);
    assert_eq!(spawner.retired.load(Ordering::SeqCst), 0);

    assert_ok!(autoscaler.shutdown().await);
}

#[tokio::test]
async fn test_unreachable_queue_is_skipped_and_others_still_scale() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(&broker, &spawner, vec![policy("broken"), policy("healthy")]).await;
    assert_ok!(autoscaler.initialize().await);

    broker.set_unreachable("broken", true);
    enqueue_aged(&broker, "healthy", 50, 40).await;

    let report = autoscaler.tick().await;
    assert_eq!(report.skipped(), 1);
    match report.outcome("broken") {
        Some(QueueOutcome::Skipped { reason, .. }) => assert!(reason.contains("unreachable")),
        other => panic!("expected skip, got {:?}", other),
    }
    assert_eq!(autoscaler.worker_count("broken"), 1);
    assert_eq!(autoscaler.worker_count("healthy"), 5);

    // Recovers on the next pass once the broker answers again.
    broker.set_unreachable("broken", false);
    let report = autoscaler.tick().await;
    assert_eq!(report.skipped(), 0);
    assert_eq!(decision(&report, "broken").rule, ScalingRule::Idle);

    assert_ok!(autoscaler.shutdown().await);
}

#[tokio::test]
async fn test_worker_counts_stay_within_bounds_over_many_passes() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let mut autoscaler = build(&broker, &spawner, vec![policy("q").workers(2, 4)]).await;
    assert_ok!(autoscaler.initialize().await);

    for round in 0..6 {
        enqueue_aged(&broker, "q", 7 * round, (round as i64) * 10).await;
        autoscaler.tick().await;
        let count = autoscaler.worker_count("q");
        assert!((2..=4).contains(&count), "round {} left {} workers", round, count);
    }

    assert_ok!(autoscaler.shutdown().await);
}

#[tokio::test]
async fn test_scaling_events_carry_snapshot() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let (sink, mut events) = ChannelEventSink::new();
    let mut autoscaler = AutoscalerBuilder::new(AutoscalerConfig::default())
        .queues(vec![policy("q")])
        .broker(broker.clone())
        .spawner(spawner.clone())
        .event_sink(Arc::new(sink))
        .build()
        .await
        .unwrap();

    assert_ok!(autoscaler.initialize().await);
    let init = events.recv().await.unwrap();
    assert_eq!(init.trigger, ScaleTrigger::Initialization);
    assert_eq!((init.before, init.after), (0, 1));

    enqueue_aged(&broker, "q", 50, 40).await;
    autoscaler.tick().await;
    let scaled = events.recv().await.unwrap();
    assert_eq!(scaled.trigger, ScaleTrigger::Decision);
    assert_eq!(scaled.rule, Some(ScalingRule::UrgentScaleUp));
    assert_eq!((scaled.before, scaled.after), (1, 5));
    let snapshot = scaled.snapshot.expect("decision events carry the snapshot");
    assert_eq!(snapshot.waiting_jobs, 50);
    assert!(snapshot.lag_ms >= 40_000);

    assert_ok!(autoscaler.shutdown().await);
    let drained = events.recv().await.unwrap();
    assert_eq!(drained.trigger, ScaleTrigger::Shutdown);
    assert_eq!(drained.after, 0);
}

#[tokio::test]
async fn test_start_processes_jobs_and_stop_drains_everything() {
    let broker = Arc::new(MemoryBroker::new());
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();

    let autoscaler = AutoscalerBuilder::new(AutoscalerConfig::default())
        .queues(vec![policy("emails").workers(2, 4)])
        .broker(broker.clone())
        .handler("emails", handler_fn(move |_job: Job| {
            let counter = counter.clone();
            async move {
                sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .tick_interval(Duration::from_millis(20))
        .worker_poll_timeout(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    let mut handle = autoscaler.start();
    assert!(handle.wait_for(AutoscalerState::Running).await);
    assert_eq!(broker.registered_workers("emails").len(), 2);

    enqueue_aged(&broker, "emails", 30, 0).await;
    for _ in 0..300 {
        if processed.load(Ordering::SeqCst) == 30 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(processed.load(Ordering::SeqCst), 30);

    handle.stop().await.unwrap();
    assert!(broker.registered_workers("emails").is_empty());
    assert_eq!(broker.get_completed_count("emails").await.unwrap(), 30);
}

#[tokio::test]
async fn test_stop_handle_from_another_task() {
    let broker = Arc::new(MemoryBroker::new());
    let spawner = IdleSpawner::new();
    let autoscaler = build(&broker, &spawner, vec![policy("q")]).await;

    let mut handle = autoscaler.start();
    assert!(handle.wait_for(AutoscalerState::Running).await);

    let stopper = handle.stopper();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        stopper.stop();
    });

    handle.join().await.unwrap();
    assert_eq!(
        spawner.spawned.load(Ordering::SeqCst),
        spawner.retired.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_missing_handler_fails_the_build() {
    let broker = Arc::new(MemoryBroker::new());
    let result = AutoscalerBuilder::new(AutoscalerConfig::default())
        .queues(vec![policy("emails"), policy("reports")])
        .broker(broker)
        .handler("emails", handler_fn(|_job: Job| async { Ok(()) }))
        .build()
        .await;

    let err = assert_err!(result);
    assert!(err.to_string().contains("reports"));
}
