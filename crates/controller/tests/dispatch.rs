#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use weir_controller::{handler_fn, Controller, ControllerConfig, HandlerError, ObjectKey, WeirError};
use weir_core::RemoteSource;
use weir_memsource::MemorySource;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cm(name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
        data: Some([("v".to_string(), value.to_string())].into()),
        ..Default::default()
    }
}

fn value(obj: Option<&ConfigMap>) -> Option<String> { obj.and_then(|o| o.data.as_ref()?.get("v").cloned()) }

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        retry_base_ms: 1,
        retry_max_ms: 50,
        watch_backoff_initial_ms: 10,
        watch_backoff_max_secs: 1,
        ..ControllerConfig::default()
    }
}

type Seen = Arc<Mutex<Vec<(ObjectKey, Option<String>)>>>;

fn controller(src: &MemorySource<ConfigMap>, config: ControllerConfig) -> (Controller<ConfigMap>, Seen) {
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let c = Controller::new("configmaps", remote, config);
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    c.add_handler(
        "record",
        handler_fn(move |key, obj: Option<Arc<ConfigMap>>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((key, value(obj.as_deref())));
                Ok(())
            }
        }),
    );
    (c, seen)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn stored(c: &Controller<ConfigMap>, name: &str) -> Option<String> {
    value(c.informer().get(&ObjectKey::new(Some("ns"), name)).as_deref())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn modification_is_observed_at_the_new_version() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let (c, seen) = controller(&src, fast_config());
    let token = CancellationToken::new();
    c.start(&token, 2);
    eventually("initial dispatch", || seen.lock().unwrap().len() == 1).await;

    src.put(cm("a", "2")).unwrap();
    eventually("v2 dispatch", || seen.lock().unwrap().last().is_some_and(|(_, v)| v.as_deref() == Some("2"))).await;
    assert_eq!(stored(&c, "a").as_deref(), Some("2"));

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), c.stopped()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_dispatches_with_no_object() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("b", "1")).unwrap();
    let (c, seen) = controller(&src, fast_config());
    let token = CancellationToken::new();
    c.start(&token, 1);
    eventually("initial dispatch", || seen.lock().unwrap().len() == 1).await;

    src.remove("b");
    eventually("delete dispatch", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(seen.lock().unwrap()[1], (ObjectKey::from("ns/b"), None));
    assert!(c.informer().get(&ObjectKey::from("ns/b")).is_none());
    assert!(c.lister().get(Some("ns"), "b").unwrap_err().is_not_found());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), c.stopped()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn updates_before_dispatch_coalesce_to_the_latest() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let (c, seen) = controller(&src, fast_config());
    let token = CancellationToken::new();

    // no workers yet: sync drains the initial key inline
    c.sync(&token).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    eventually("watch open", || src.open_watches() > 0).await;

    src.put(cm("a", "2")).unwrap();
    src.put(cm("a", "3")).unwrap();
    eventually("v3 cached", || stored(&c, "a").as_deref() == Some("3")).await;
    assert_eq!(c.queue().len(), 1);

    c.start(&token, 2);
    eventually("dispatch", || seen.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2, "one dispatch for both updates");
    assert_eq!(seen[1], (ObjectKey::from("ns/a"), Some("3".to_string())));

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_without_event_dispatches_current_state_once() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "7")).unwrap();
    let (c, seen) = controller(&src, fast_config());
    let token = CancellationToken::new();
    c.sync(&token).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);

    c.enqueue(Some("ns"), "a");
    c.start(&token, 2);
    eventually("dispatch", || seen.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(seen.lock().unwrap()[1], (ObjectKey::from("ns/a"), Some("7".to_string())));

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_is_retried_with_growing_delay() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let config = ControllerConfig { retry_base_ms: 20, retry_max_ms: 1_000, ..fast_config() };
    let c = Controller::new("configmaps", remote, config);
    let calls: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let log = Arc::clone(&calls);
    c.add_handler(
        "flaky",
        handler_fn(move |_key, _obj: Option<Arc<ConfigMap>>| {
            let log = Arc::clone(&log);
            async move {
                let n = {
                    let mut log = log.lock().unwrap();
                    log.push(Instant::now());
                    log.len()
                };
                if n <= 3 {
                    return Err(anyhow::anyhow!("attempt {n} failed").into());
                }
                Ok(())
            }
        }),
    );
    let mut errors = c.subscribe_errors();
    let token = CancellationToken::new();
    c.start(&token, 1);

    eventually("four calls", || calls.lock().unwrap().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(20), "{gaps:?}");
    assert!(gaps[1] >= Duration::from_millis(40), "{gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(80), "{gaps:?}");
    assert_eq!(c.queue().num_requeues(&ObjectKey::from("ns/a")), 0);

    for retries in 0..3 {
        let f = errors.recv().await.unwrap();
        assert_eq!(f.key, ObjectKey::from("ns/a"));
        assert_eq!(f.handler, "flaky");
        assert_eq!(f.retries, retries);
        assert!(!f.terminal);
    }
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_errors_and_exhausted_retries_are_not_requeued() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("bad", "1")).unwrap();
    src.put(cm("flaky", "1")).unwrap();
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let config = ControllerConfig { max_retries: Some(2), ..fast_config() };
    let c = Controller::new("configmaps", remote, config);
    let calls: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let log = Arc::clone(&calls);
    c.add_handler(
        "picky",
        handler_fn(move |key: ObjectKey, _obj: Option<Arc<ConfigMap>>| {
            let log = Arc::clone(&log);
            async move {
                *log.lock().unwrap().entry(key.name().to_string()).or_default() += 1;
                if key.name() == "bad" {
                    Err(HandlerError::terminal(anyhow::anyhow!("invalid payload")))
                } else {
                    Err(WeirError::Transport("remote down".into()).into())
                }
            }
        }),
    );
    let mut errors = c.subscribe_errors();
    let token = CancellationToken::new();
    c.start(&token, 2);

    let mut terminal = Vec::new();
    while terminal.len() < 2 {
        let f = tokio::time::timeout(Duration::from_secs(2), errors.recv()).await.unwrap().unwrap();
        if f.terminal {
            terminal.push(f);
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls["bad"], 1);
    // two requeues allowed, the third failure gives up
    assert_eq!(calls["flaky"], 3);
    terminal.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
    assert_eq!(terminal[0].key, ObjectKey::from("ns/bad"));
    assert_eq!(terminal[0].retries, 0);
    assert_eq!(terminal[1].key, ObjectKey::from("ns/flaky"));
    assert_eq!(terminal[1].retries, 2);
    assert!(c.queue().is_empty());
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_run_in_order_and_stop_at_first_error() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let c = Controller::new("configmaps", remote, fast_config());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    for (name, fail) in [("first", false), ("second", true), ("third", false)] {
        let order = Arc::clone(&order);
        c.add_handler(
            name,
            handler_fn(move |_key, _obj: Option<Arc<ConfigMap>>| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    if fail {
                        return Err(HandlerError::terminal(anyhow::anyhow!("stop")));
                    }
                    Ok(())
                }
            }),
        );
    }
    assert_eq!(c.handler_names(), vec!["first", "second", "third"]);
    let token = CancellationToken::new();
    c.sync(&token).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_dispatched_concurrently() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    for i in 0..4 {
        src.put(cm(&format!("k{i}"), "0")).unwrap();
    }
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let c = Controller::new("configmaps", remote, fast_config());
    let in_flight: Arc<Mutex<HashMap<ObjectKey, usize>>> = Arc::default();
    let violations = Arc::new(AtomicUsize::new(0));
    let dispatched = Arc::new(AtomicUsize::new(0));
    {
        let (in_flight, violations, dispatched) = (Arc::clone(&in_flight), Arc::clone(&violations), Arc::clone(&dispatched));
        c.add_handler(
            "slow",
            handler_fn(move |key: ObjectKey, _obj: Option<Arc<ConfigMap>>| {
                let (in_flight, violations, dispatched) =
                    (Arc::clone(&in_flight), Arc::clone(&violations), Arc::clone(&dispatched));
                async move {
                    {
                        let mut m = in_flight.lock().unwrap();
                        let n = m.entry(key.clone()).or_insert(0);
                        *n += 1;
                        if *n > 1 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.lock().unwrap().entry(key).and_modify(|n| *n -= 1);
                    dispatched.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
    }
    let token = CancellationToken::new();
    c.start(&token, 4);
    eventually("watch open", || src.open_watches() > 0).await;

    for round in 1..=20 {
        for i in 0..4 {
            src.put(cm(&format!("k{i}"), &round.to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    eventually("final versions dispatched", || {
        c.queue().is_empty() && (0..4).all(|i| stored(&c, &format!("k{i}")).as_deref() == Some("20"))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(dispatched.load(Ordering::SeqCst) >= 8);
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), c.stopped()).await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_every_task() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    let (c, _seen) = controller(&src, ControllerConfig { resync_secs: 1, ..fast_config() });
    let token = CancellationToken::new();
    c.start(&token, 3);
    eventually("watch open", || src.open_watches() > 0).await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), c.stopped()).await.unwrap();
    assert!(c.queue().is_shutting_down());
    assert_eq!(src.open_watches(), 0);
}

#[tokio::test]
async fn sync_gives_up_when_cancelled_before_the_first_list() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.fail_next_lists(usize::MAX);
    let (c, _seen) = controller(&src, fast_config());
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert_eq!(c.sync(&token).await, Err(WeirError::Cancelled));
    assert!(!c.has_synced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_re_enqueues_cached_keys() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let (c, seen) = controller(&src, ControllerConfig { resync_secs: 1, ..fast_config() });
    let token = CancellationToken::new();
    c.start(&token, 1);
    eventually("initial dispatch", || seen.lock().unwrap().len() == 1).await;

    tokio::time::timeout(Duration::from_secs(3), async {
        while seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("resync did not re-dispatch");
    assert_eq!(seen.lock().unwrap()[1], (ObjectKey::from("ns/a"), Some("1".to_string())));
    token.cancel();
}

#[tokio::test]
async fn inline_sync_dispatches_each_pending_key_once() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    // zero backoff requeues a failing key immediately
    let config = ControllerConfig { retry_base_ms: 0, retry_max_ms: 0, ..fast_config() };
    let remote: Arc<dyn RemoteSource<ConfigMap>> = Arc::new(src.clone());
    let c = Controller::new("configmaps", remote, config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    c.add_handler(
        "always-fails",
        handler_fn(move |_key, _obj: Option<Arc<ConfigMap>>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::from(anyhow::anyhow!("boom"))) }
        }),
    );
    let token = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(1), c.sync(&token)).await.expect("sync drained forever").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(c.queue().len(), 1);

    tokio::time::timeout(Duration::from_secs(1), c.sync(&token)).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_stopped_controller_stays_stopped() {
    init_tracing();
    let src = MemorySource::<ConfigMap>::new("configmaps").namespaced("ns");
    src.put(cm("a", "1")).unwrap();
    let (c, seen) = controller(&src, fast_config());
    let token = CancellationToken::new();
    c.start(&token, 1);
    eventually("initial dispatch", || seen.lock().unwrap().len() == 1).await;
    assert!(!c.is_stopped());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), c.stopped()).await.unwrap();
    assert!(c.is_stopped());

    let fresh = CancellationToken::new();
    c.start(&fresh, 1);
    assert_eq!(c.sync(&fresh).await, Err(WeirError::Cancelled));
    src.put(cm("b", "1")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(src.open_watches(), 0);
    fresh.cancel();
}
