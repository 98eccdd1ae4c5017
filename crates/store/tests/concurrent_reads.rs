#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use weir_core::{LabelSelector, ObjectKey};
use weir_store::Indexer;

fn cm(ns: &str, name: &str, rv: u64) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn readers_never_observe_half_applied_writes() {
    let store: Arc<Indexer<ConfigMap>> = Arc::new(Indexer::new());
    let stop = Arc::new(AtomicBool::new(false));

    let writer = std::thread::spawn({
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        move || {
            let mut rv = 0u64;
            while !stop.load(Ordering::Relaxed) {
                for i in 0..32 {
                    rv += 1;
                    let ns = if i % 2 == 0 { "even" } else { "odd" };
                    store.put_if_newer(cm(ns, &format!("o{i}"), rv));
                }
                for i in (0..32).step_by(3) {
                    let ns = if i % 2 == 0 { "even" } else { "odd" };
                    store.delete(&ObjectKey::new(Some(ns), &format!("o{i}")));
                }
            }
        }
    });

    let readers: Vec<_> = (0..4)
        .map(|r| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let ns = if r % 2 == 0 { "even" } else { "odd" };
                for _ in 0..2_000 {
                    for o in store.list(Some(ns), &LabelSelector::everything()) {
                        assert_eq!(o.metadata.namespace.as_deref(), Some(ns));
                    }
                    let n = store.list(None, &LabelSelector::everything()).len();
                    assert!(n <= 32, "at most one entry per key (got {n})");
                }
            })
        })
        .collect();

    for r in readers {
        r.join().expect("reader panicked");
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().expect("writer panicked");
}
