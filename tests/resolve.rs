//! Resolution scenarios: value flow through chains, late-init cycles,
//! panics and memoization under concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use armature::{provide, provide_with_error, use_late_ref, Component, LateRef, ProvideError};

struct Config {
    addr: &'static str,
}

struct Pool {
    config: Arc<Config>,
}

struct Api {
    pool: Arc<Pool>,
}

#[test]
fn chain_resolves_with_wired_references() {
    let config = provide(|| Arc::new(Config { addr: "db:5432" }));
    let pool = {
        let config = config.clone();
        provide(move || Arc::new(Pool {
            config: config.get(),
        }))
    };
    let api = {
        let pool = pool.clone();
        provide(move || Arc::new(Api { pool: pool.get() }))
    };

    let api = api.get();
    assert_eq!(api.pool.config.addr, "db:5432");
    // the transitively reached components are the same singletons
    assert!(Arc::ptr_eq(&api.pool, &pool.get()));
    assert!(Arc::ptr_eq(&api.pool.config, &config.get()));
}

struct Publisher {
    subscriber: LateRef<Arc<Subscriber>>,
}

struct Subscriber {
    publisher: Arc<Publisher>,
}

#[test]
fn late_init_breaks_a_two_node_cycle() {
    let subscriber_slot: Arc<OnceLock<Component<Arc<Subscriber>>>> = Arc::new(OnceLock::new());

    let publisher = {
        let slot = subscriber_slot.clone();
        provide(move || {
            let subscriber = use_late_ref({
                let slot = slot.clone();
                move || slot.get().expect("subscriber defined").get()
            });
            Arc::new(Publisher { subscriber })
        })
    };
    let subscriber = {
        let publisher = publisher.clone();
        provide(move || Arc::new(Subscriber {
            publisher: publisher.get(),
        }))
    };
    subscriber_slot.set(subscriber.clone()).ok();

    // after the root accessor returns, both directions are wired
    let publisher_value = publisher.get();
    let wired = publisher_value.subscriber.get();
    assert!(Arc::ptr_eq(&wired.publisher, &publisher_value));

    // an extra dependent still sees the fully initialized component
    let reader = {
        let publisher = publisher.clone();
        provide(move || publisher.get().subscriber.get().publisher.clone())
    };
    assert!(Arc::ptr_eq(&reader.get(), &publisher_value));
}

#[test]
fn constructor_panic_propagates_structured_through_dependents() {
    let broken: Component<u32> = provide(|| panic!("boom"));

    let first = std::panic::catch_unwind(|| broken.get()).unwrap_err();
    let err = first.downcast::<ProvideError>().expect("structured payload");
    assert_eq!(err.registration().unwrap().panic_message(), Some("boom"));

    // the memoized failure re-panics on every later accessor call
    let again = std::panic::catch_unwind(|| broken.try_get()).unwrap_err();
    assert!(again.downcast_ref::<ProvideError>().is_some());

    // a dependent that does not catch re-panics with its own frame added
    let dependent = {
        let broken = broken.clone();
        provide(move || broken.get() + 1)
    };
    let from_dependent = std::panic::catch_unwind(|| dependent.get()).unwrap_err();
    let err = from_dependent
        .downcast::<ProvideError>()
        .expect("structured payload");
    let failure = err.registration().unwrap();
    assert_eq!(failure.panic_message(), Some("boom"));
    assert!(!failure.frames().is_empty());
}

#[test]
fn dependent_tolerating_a_failure_registers_cleanly() {
    let flaky: Component<u32> = provide_with_error(|| Err::<u32, _>("backend offline"));
    let resilient = {
        let flaky = flaky.clone();
        provide(move || match flaky.try_get() {
            Ok(v) => v,
            Err(_) => 0,
        })
    };
    assert_eq!(resilient.get(), 0);
    assert_eq!(resilient.get(), 0);
}

#[test]
fn constructor_runs_once_under_concurrent_access() {
    let runs = Arc::new(AtomicUsize::new(0));
    let component = {
        let runs = runs.clone();
        provide(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(10));
            String::from("singleton")
        })
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let component = component.clone();
        handles.push(std::thread::spawn(move || component.get()));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), "singleton");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn three_node_cycle_reports_the_full_path() {
    let a_slot: Arc<OnceLock<Component<u32>>> = Arc::new(OnceLock::new());

    let c = {
        let slot = a_slot.clone();
        provide_with_error(move || slot.get().expect("a defined").try_get())
    };
    let b = {
        let c = c.clone();
        provide_with_error(move || c.try_get())
    };
    let a = {
        let b = b.clone();
        provide_with_error(move || b.try_get())
    };
    a_slot.set(a.clone()).ok();

    let err = a.try_get().unwrap_err();
    let ProvideError::Cyclic(trace) = err else {
        panic!("expected a cycle, got: {err}");
    };
    assert_eq!(trace.components().count(), 3);
}

#[test]
fn late_init_failure_cascades_to_captured_dependents() {
    let source = provide_with_error(|| {
        armature::use_late_init_with_error(|| Err("deferred wiring failed".into()));
        Ok::<u8, armature::BoxError>(7)
    });
    let dependent = {
        let source = source.clone();
        provide_with_error(move || source.try_get())
    };

    // the dependent captured the value before the late-init could fail
    let err = dependent.try_get().unwrap_err();
    let failure = err.registration().expect("registration failure");
    assert_eq!(
        failure.source_error().unwrap().to_string(),
        "deferred wiring failed"
    );
    // and the chain names both components
    assert!(failure.frames().len() >= 2, "frames: {:?}", failure.frames());

    // the failing component itself is failed too
    assert!(source.try_get().is_err());
}

#[test]
fn accessor_order_inside_constructor_is_observed() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let order = order.clone();
        provide(move || order.lock().unwrap().push("first"))
    };
    let second = {
        let order = order.clone();
        provide(move || order.lock().unwrap().push("second"))
    };
    let root = {
        let (first, second) = (first.clone(), second.clone());
        provide(move || {
            first.get();
            second.get();
        })
    };
    root.get();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}
