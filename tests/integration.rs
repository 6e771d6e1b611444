use std::{
    collections::HashSet,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use serde_json::{json, Map};
use sluice::{
    broker::DeclaredQueues,
    error::Error,
    promoter::Promoter,
    report::{FailureKind, FAILURE_MARKER},
    store::now_millis,
    Actor, ActorPolicy, Broker, Config, FailureReport, FailureReporter, MessageOptions, Payload,
    Registry, SendOptions, Store, Worker,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

struct TmpBroker {
    broker: Broker,
    reports: Reports,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpBroker {
    type Target = Broker;

    fn deref(&self) -> &Self::Target {
        &self.broker
    }
}

impl TmpBroker {
    fn store(&self) -> &Store {
        self.broker.store().unwrap()
    }
}

#[derive(Clone, Default)]
struct Reports(Arc<Mutex<Vec<FailureReport>>>);

impl Reports {
    fn all(&self) -> Vec<FailureReport> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl FailureReporter for Reports {
    fn report(&self, report: &FailureReport) {
        self.0.lock().unwrap().push(report.clone());
    }
}

/// Counting semaphore that blocking actors wait on.
#[derive(Clone, Default)]
struct Permits(Arc<(Mutex<usize>, Condvar)>);

impl Permits {
    fn acquire(&self) {
        let (count, cvar) = &*self.0;
        let mut count = count.lock().unwrap();
        while *count == 0 {
            count = cvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self, n: usize) {
        let (count, cvar) = &*self.0;
        *count.lock().unwrap() += n;
        cvar.notify_all();
    }
}

/// Start and end markers written by a blocking actor.
#[derive(Clone, Default)]
struct Calls {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Calls {
    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

fn blocking(name: &str, permits: &Permits, calls: &Calls) -> Actor {
    let permits = permits.clone();
    let calls = calls.clone();
    Actor::new(name, move |_| {
        calls.started.fetch_add(1, Ordering::SeqCst);
        permits.acquire();
        calls.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn config(tmpdir: &TempDir, worker_threads: usize) -> Config {
    Config {
        db_path: Some(
            tmpdir
                .path()
                .join("sluice.db")
                .to_string_lossy()
                .to_string(),
        ),
        worker_threads: Some(worker_threads),
        prefetch_multiplier: Some(2),
        promoter_interval_ms: Some(20),
        idle_interval_ms: Some(20),
        heartbeat_interval_ms: Some(100),
        consumer_timeout_ms: Some(60_000),
        queues: None,
    }
}

async fn setup_with(registry: Registry, config: impl FnOnce(&TempDir) -> Config) -> TmpBroker {
    let tmpdir = tempfile::tempdir().unwrap();
    let reports = Reports::default();

    let broker = Broker::builder()
        .config(config(&tmpdir))
        .registry(registry)
        .reporter(Arc::new(reports.clone()))
        .build();

    broker.on_boot().await.unwrap();

    TmpBroker {
        broker,
        reports,
        tmpdir,
    }
}

async fn setup(registry: Registry) -> TmpBroker {
    setup_with(registry, |dir| config(dir, 2)).await
}

fn counting(name: &str, calls: &Arc<AtomicUsize>) -> Actor {
    let calls = Arc::clone(calls);
    Actor::new(name, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Polls `check` until it holds, panicking after [`WAIT`].
async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls the store until exactly `claimed` of `total` messages are claimed.
async fn wait_for_counts(store: &Store, claimed: u64, total: u64) {
    let deadline = Instant::now() + WAIT;
    loop {
        let have_claimed = store.claimed_count().await.unwrap();
        let have_total = store.total_count().await.unwrap();
        if (have_claimed, have_total) == (claimed, total) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "expected claimed={claimed} total={total}, have claimed={have_claimed} total={have_total}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_messages_run_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = setup(Registry::new().with(counting("basic", &calls)).unwrap()).await;

    for i in 0..3 {
        broker.send("basic", vec![json!(i)]).await.unwrap();
    }
    assert_eq!(broker.store().total_count().await.unwrap(), 3);

    let worker = Worker::start(&broker).await.unwrap();
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.store().total_count().await.unwrap(), 0);
    assert!(broker.reports.all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actor_receives_args_and_kwargs() {
    let seen = Arc::new(Mutex::new(None));
    let actor = {
        let seen = Arc::clone(&seen);
        Actor::new("add", move |payload: &Payload| {
            let a: i64 = payload.arg(0)?;
            let b: i64 = payload.kwarg("b")?;
            *seen.lock().unwrap() = Some(a + b);
            Ok(())
        })
    };
    let broker = setup(Registry::new().with(actor).unwrap()).await;

    let mut kwargs = Map::new();
    kwargs.insert("b".to_owned(), json!(2));
    broker
        .send_with_options("add", vec![json!(40)], kwargs, SendOptions::default())
        .await
        .unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(*seen.lock().unwrap(), Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_message_waits_for_eta() {
    let permits = Permits::default();
    let calls = Calls::default();
    let broker = setup(
        Registry::new()
            .with(blocking("delayed", &permits, &calls))
            .unwrap(),
    )
    .await;

    let sent_at = Instant::now();
    let id = broker
        .send_with_options(
            "delayed",
            vec![],
            Map::new(),
            SendOptions::builder()
                .delay(Duration::from_millis(500))
                .build(),
        )
        .await
        .unwrap();

    let message = broker.store().get(&id).await.unwrap().unwrap();
    assert_eq!(message.queue, "default.DQ");
    assert!(message.options().eta.is_some());

    let worker = Worker::start(&broker).await.unwrap();
    wait_until("delayed actor to start", || calls.started() == 1).await;
    assert!(sent_at.elapsed() >= Duration::from_millis(500));

    // Promoted and claimed while the actor is still blocked.
    let message = broker.store().get(&id).await.unwrap().unwrap();
    assert_eq!(message.queue, "default");
    assert_eq!(message.options().eta, None);
    assert!(message.is_claimed());
    assert_eq!(calls.finished(), 0);

    permits.release(1);
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(calls.finished(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_message_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actor = {
        let calls = Arc::clone(&calls);
        Actor::new("flaky", move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                eyre::bail!("first call fails");
            }
            Ok(())
        })
        .with_policy(
            ActorPolicy::builder()
                .min_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_millis(50))
                .build(),
        )
    };
    let broker = setup(Registry::new().with(actor).unwrap()).await;

    broker.send("flaky", vec![]).await.unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(broker.reports.all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_are_reported_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actor = {
        let calls = Arc::clone(&calls);
        Actor::new("always_fails", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            eyre::bail!("I always fail!")
        })
        .with_policy(
            ActorPolicy::builder()
                .max_retries(1)
                .max_backoff(Duration::from_millis(1))
                .build(),
        )
    };
    let broker = setup(Registry::new().with(actor).unwrap()).await;

    broker.send("always_fails", vec![json!(1)]).await.unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    broker.join("default", WAIT).await.unwrap();
    wait_until("failure report", || broker.reports.len() == 1).await;
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let reports = broker.reports.all();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureKind::RetriesExhausted);
    assert_eq!(reports[0].attempts, 2);

    let rendered = reports[0].to_string();
    assert!(rendered.contains(FAILURE_MARKER));
    assert!(rendered.contains("I always fail!"));
    assert!(rendered.contains("always_fails"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_overrides_retry_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actor = {
        let calls = Arc::clone(&calls);
        Actor::new("always_fails", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            eyre::bail!("I always fail!")
        })
    };
    let broker = setup(Registry::new().with(actor).unwrap()).await;

    broker
        .send_with_options(
            "always_fails",
            vec![],
            Map::new(),
            SendOptions::builder().max_retries(0).build(),
        )
        .await
        .unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    wait_until("failure report", || broker.reports.len() == 1).await;
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.store().total_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backlog_claims_at_most_prefetch_budget() {
    let permits = Permits::default();
    let calls = Calls::default();
    let broker = setup_with(
        Registry::new()
            .with(blocking("blocked", &permits, &calls))
            .unwrap(),
        |dir| config(dir, 4),
    )
    .await;

    for _ in 0..16 {
        broker.send("blocked", vec![]).await.unwrap();
    }

    let worker = Worker::start(&broker).await.unwrap();
    let budget = broker.config().prefetch_budget() as u64;
    assert_eq!(budget, 8);

    wait_until("all consumers to block", || calls.started() == 4).await;
    wait_for_counts(broker.store(), 8, 16).await;

    // Give the consumers time to overreach if they were going to.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.store().claimed_count().await.unwrap(), budget);
    assert_eq!(calls.started(), 4);

    // Finishing one call frees one slot, which is refilled from the backlog.
    permits.release(1);
    wait_until("one call to finish", || calls.finished() == 1).await;
    wait_for_counts(broker.store(), 8, 15).await;
    wait_until("prefetched message to start", || calls.started() == 5).await;
    assert_eq!(calls.finished(), 1);

    permits.release(15);
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(calls.started(), 16);
    assert_eq!(calls.finished(), 16);
    assert_eq!(calls.started() + calls.finished(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_consumes_every_declared_queue() {
    let default_calls = Arc::new(AtomicUsize::new(0));
    let other_calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::new()
        .with(counting("on_default", &default_calls))
        .unwrap()
        .with(
            counting("on_other", &other_calls)
                .with_policy(ActorPolicy::builder().queue_name("other-queue").build()),
        )
        .unwrap();
    let broker = setup(registry).await;

    for _ in 0..3 {
        broker.send("on_default", vec![]).await.unwrap();
        broker.send("on_other", vec![]).await.unwrap();
    }
    assert_eq!(broker.store().count("other-queue").await.unwrap(), 3);

    let worker = Worker::start(&broker).await.unwrap();
    broker.join("default", WAIT).await.unwrap();
    broker.join("other-queue", WAIT).await.unwrap();
    worker.stop().await;

    assert_eq!(default_calls.load(Ordering::SeqCst), 3);
    assert_eq!(other_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_ignores_unlisted_queues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::new()
        .with(
            counting("on_other", &calls)
                .with_policy(ActorPolicy::builder().queue_name("other-queue").build()),
        )
        .unwrap();
    let broker = setup_with(registry, |dir| Config {
        queues: Some("default".to_owned()),
        ..config(dir, 2)
    })
    .await;

    broker.send("on_other", vec![]).await.unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    assert_eq!(worker.queues(), ["default"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.store().count("other-queue").await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_without_queues_fails() {
    let broker = setup(Registry::new()).await;

    assert!(matches!(
        Worker::start(&broker).await,
        Err(Error::InvalidParameter { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_disjoint() {
    let broker = setup(Registry::new()).await;
    let store = broker.store().clone();

    for _ in 0..40 {
        store
            .enqueue(
                "default",
                "basic",
                &Payload::default(),
                MessageOptions::with_retries(0),
                None,
            )
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for n in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let consumer = format!("consumer-{n}");
            let mut ids = Vec::new();
            loop {
                let claimed = store.claim("default", &consumer, 3).await.unwrap();
                if claimed.is_empty() {
                    break ids;
                }
                for message in claimed {
                    assert_eq!(message.consumer_id.as_deref(), Some(consumer.as_str()));
                    ids.push(message.id);
                }
            }
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(store.claimed_count().await.unwrap(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_actor_is_dropped_and_reported() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = setup(Registry::new().with(counting("basic", &calls)).unwrap()).await;

    let id = broker
        .store()
        .enqueue(
            "default",
            "ghost",
            &Payload::new(vec![json!("boo")], Map::new()),
            MessageOptions::with_retries(3),
            None,
        )
        .await
        .unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    wait_until("failure report", || broker.reports.len() == 1).await;
    broker.join("default", WAIT).await.unwrap();
    worker.stop().await;

    let reports = broker.reports.all();
    assert_eq!(reports[0].kind, FailureKind::UnknownActor);
    assert_eq!(reports[0].message_id, id);
    assert_eq!(reports[0].actor_name, "ghost");
    assert!(reports[0].to_string().contains(FAILURE_MARKER));
    assert!(reports[0].error.contains("Unknown actor: ghost on queue default"));
    assert!(reports[0].error.contains("no retry policy applies"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_promoter_moves_due_messages() {
    let broker = setup(Registry::new()).await;
    let store = broker.store().clone();
    let queues = DeclaredQueues::default();
    queues.declare("default");

    let promoter = Promoter::new(
        store.clone(),
        queues,
        Duration::from_millis(20),
        Duration::from_secs(60),
        CancellationToken::new(),
    );

    let id = store
        .enqueue(
            "default",
            "basic",
            &Payload::default(),
            MessageOptions::default(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(promoter.pass().await.promoted, 0);
    assert!(store.claim("default", "consumer", 10).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(promoter.pass().await.promoted, 1);

    let message = store.get(&id).await.unwrap().unwrap();
    assert_eq!(message.queue, "default");
    assert_eq!(message.options().eta, None);
}

#[tokio::test]
async fn test_promoter_releases_orphaned_messages() {
    let broker = setup(Registry::new()).await;
    let store = broker.store().clone();

    for _ in 0..2 {
        store
            .enqueue(
                "default",
                "basic",
                &Payload::default(),
                MessageOptions::default(),
                None,
            )
            .await
            .unwrap();
    }

    store.heartbeat("live").await.unwrap();
    let live = store.claim("default", "live", 1).await.unwrap();
    let dead = store.claim("default", "dead", 1).await.unwrap();
    assert_eq!(store.claimed_count().await.unwrap(), 2);

    let promoter = Promoter::new(
        store.clone(),
        DeclaredQueues::default(),
        Duration::from_millis(20),
        Duration::from_secs(60),
        CancellationToken::new(),
    );

    assert_eq!(promoter.pass().await.released, 1);

    let live = store.get(&live[0].id).await.unwrap().unwrap();
    let dead = store.get(&dead[0].id).await.unwrap().unwrap();
    assert_eq!(live.consumer_id.as_deref(), Some("live"));
    assert_eq!(dead.consumer_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_releases_prefetched_messages() {
    let permits = Permits::default();
    let calls = Calls::default();
    let broker = setup_with(
        Registry::new()
            .with(blocking("blocked", &permits, &calls))
            .unwrap(),
        |dir| config(dir, 1),
    )
    .await;

    for _ in 0..3 {
        broker.send("blocked", vec![]).await.unwrap();
    }

    let worker = Worker::start(&broker).await.unwrap();
    wait_until("actor to start", || calls.started() == 1).await;
    wait_for_counts(broker.store(), 2, 3).await;

    let stopping = tokio::spawn(worker.stop());
    tokio::time::sleep(Duration::from_millis(100)).await;
    permits.release(1);
    stopping.await.unwrap();

    assert_eq!(calls.started(), 1);
    assert_eq!(calls.finished(), 1);
    assert_eq!(broker.store().total_count().await.unwrap(), 2);
    assert_eq!(broker.store().claimed_count().await.unwrap(), 0);
    assert!(broker.store().consumers().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopping_consumer_keeps_heartbeat_until_call_returns() {
    let permits = Permits::default();
    let calls = Calls::default();
    let broker = setup_with(
        Registry::new()
            .with(blocking("slow", &permits, &calls))
            .unwrap(),
        |dir| Config {
            heartbeat_interval_ms: Some(50),
            ..config(dir, 1)
        },
    )
    .await;
    let store = broker.store().clone();

    let id = broker.send("slow", vec![]).await.unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    let owner = worker.consumer_ids()[0].clone();
    wait_until("actor to start", || calls.started() == 1).await;

    // Another pool's promoter, with a consumer timeout shorter than the call.
    let other = CancellationToken::new();
    let promoter = tokio::spawn(
        Promoter::new(
            store.clone(),
            DeclaredQueues::default(),
            Duration::from_millis(20),
            Duration::from_millis(300),
            other.clone(),
        )
        .run(),
    );

    let stopping = tokio::spawn(worker.stop());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let message = store.get(&id).await.unwrap().unwrap();
    assert_eq!(message.consumer_id.as_deref(), Some(owner.as_str()));

    permits.release(1);
    stopping.await.unwrap();
    other.cancel();
    promoter.await.unwrap();

    assert_eq!(calls.started(), 1);
    assert_eq!(calls.finished(), 1);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_range_delay_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let broker = setup(Registry::new().with(counting("basic", &calls)).unwrap()).await;

    let res = broker
        .send_with_options(
            "basic",
            vec![],
            Map::new(),
            SendOptions::builder()
                .delay(Duration::from_secs(10_000_000_000_000))
                .build(),
        )
        .await;

    assert!(matches!(res, Err(Error::InvalidParameter { .. })));
    assert_eq!(broker.store().total_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_range_backoff_keeps_consumer_alive() {
    let failures = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let always_fails = {
        let failures = Arc::clone(&failures);
        Actor::new("always_fails", move |_| {
            failures.fetch_add(1, Ordering::SeqCst);
            eyre::bail!("I always fail!")
        })
    };
    let broker = setup_with(
        Registry::new()
            .with(always_fails)
            .unwrap()
            .with(counting("basic", &successes))
            .unwrap(),
        |dir| config(dir, 1),
    )
    .await;

    let huge = Duration::from_secs(10_000_000_000_000);
    let id = broker
        .send_with_options(
            "always_fails",
            vec![],
            Map::new(),
            SendOptions::builder()
                .max_retries(3)
                .min_backoff(huge)
                .max_backoff(huge)
                .build(),
        )
        .await
        .unwrap();

    let worker = Worker::start(&broker).await.unwrap();
    wait_until("first failure", || failures.load(Ordering::SeqCst) == 1).await;

    // The only consumer must still be running to pick this up.
    broker.send("basic", vec![]).await.unwrap();
    wait_until("follow-up message", || successes.load(Ordering::SeqCst) == 1).await;
    worker.stop().await;

    let message = broker.store().get(&id).await.unwrap().unwrap();
    assert_eq!(message.queue, "default.DQ");
    assert!(!message.is_claimed());
    assert_eq!(message.options().retries_remaining, 2);
    assert_eq!(message.options().retries, 1);

    let century_ms = 100 * 365 * 24 * 60 * 60 * 1000_i64;
    assert!(message.options().eta.unwrap() > now_millis() + century_ms);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}
