//! Lifecycle runner scenarios: topological start and shutdown ordering,
//! timeouts, failure propagation and cancellation.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use armature::{
    provide, use_lifecycle, BuildError, CancelSource, CancelToken, Cause, Component,
    LifecyclePhase, Runner, UnexpectedOkRunResult,
};
use common::{Event, Recorder};

/// A component with one readiness runnable that serves until cancelled.
fn serving(tag: &'static str) -> Component<&'static str> {
    provide(move || {
        use_lifecycle()
            .add_readiness_run_fn(|ctx, ready| async move {
                ready.notify();
                ctx.cancelled().await;
                Ok(())
            })
            .tag(tag);
        tag
    })
}

fn custom_cause() -> Cause {
    Cause::new(std::io::Error::other("maintenance window"))
}

#[tokio::test]
async fn chain_starts_in_topological_order_and_closes_in_reverse() {
    let recorder = Recorder::new();
    let a = serving("a");
    let b = {
        let a = a.clone();
        provide(move || {
            let value = a.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("b");
            value
        })
    };
    let c = {
        let b = b.clone();
        provide(move || {
            let value = b.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("c");
            value
        })
    };

    let runner = Runner::builder()
        .listener(recorder.clone())
        .build(move || {
            c.get();
        })
        .unwrap();

    let source = CancelSource::new();
    let token = source.token();
    let err = runner
        .run(token, move || {
            source.cancel_with(custom_cause());
        })
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    // starts and readiness flow from the leaf up
    assert!(recorder.index_of(&Event::Start("a")) < recorder.index_of(&Event::Start("b")));
    assert!(recorder.index_of(&Event::Start("b")) < recorder.index_of(&Event::Start("c")));
    assert!(recorder.index_of(&Event::Ready("a")) < recorder.index_of(&Event::Start("b")));
    assert!(recorder.index_of(&Event::Ready("b")) < recorder.index_of(&Event::Start("c")));

    // closes flow from the root down
    assert!(recorder.index_of(&Event::Close("c")) < recorder.index_of(&Event::Close("b")));
    assert!(recorder.index_of(&Event::Close("b")) < recorder.index_of(&Event::Close("a")));
    // a dependent is fully done before its dependency begins closing
    assert!(recorder.index_of(&Event::Done("c")) < recorder.index_of(&Event::Close("b")));
    assert!(recorder.index_of(&Event::Done("b")) < recorder.index_of(&Event::Close("a")));

    assert_eq!(recorder.count_of(&Event::Shutdown), 1);
}

#[tokio::test]
async fn diamond_waits_for_both_branches() {
    let recorder = Recorder::new();
    let base = serving("base");
    let left = {
        let base = base.clone();
        provide(move || {
            base.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("left");
        })
    };
    let right = {
        let base = base.clone();
        provide(move || {
            base.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("right");
        })
    };
    let top = {
        let (left, right) = (left.clone(), right.clone());
        provide(move || {
            left.get();
            right.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("top");
        })
    };

    let runner = Runner::builder()
        .listener(recorder.clone())
        .build(move || {
            top.get();
        })
        .unwrap();

    let source = CancelSource::new();
    let token = source.token();
    runner
        .run(token, move || {
            source.cancel_with(custom_cause());
        })
        .await
        .unwrap_err();

    // the top starts only after both branches signalled readiness
    assert!(recorder.index_of(&Event::Ready("left")) < recorder.index_of(&Event::Start("top")));
    assert!(recorder.index_of(&Event::Ready("right")) < recorder.index_of(&Event::Start("top")));
    // and is done before either branch closes
    assert!(recorder.index_of(&Event::Done("top")) < recorder.index_of(&Event::Close("left")));
    assert!(recorder.index_of(&Event::Done("top")) < recorder.index_of(&Event::Close("right")));
    // the shared base closes last
    assert!(recorder.index_of(&Event::Close("left")) < recorder.index_of(&Event::Close("base")));
    assert!(recorder.index_of(&Event::Close("right")) < recorder.index_of(&Event::Close("base")));

    // observability: the only root hook is the top, with two dependencies
    let roots = runner.root_lifecycle_hooks();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].depends_on().len(), 2);
}

#[tokio::test]
async fn start_timeout_fails_the_slow_starter() {
    let recorder = Recorder::new();
    let slow = provide(|| {
        use_lifecycle()
            .add_start_fn(|ctx| async move {
                // never becomes ready on its own
                ctx.cancelled().await;
                assert!(ctx
                    .cause()
                    .map(|cause| cause.is::<armature::DeadlineExceeded>())
                    .unwrap_or(false));
                Err("start timed out".into())
            })
            .start_timeout(Duration::from_millis(50))
            .tag("slow");
    });
    let dependent = {
        let slow = slow.clone();
        provide(move || {
            slow.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("dependent");
        })
    };

    let runner = Runner::builder()
        .listener(recorder.clone())
        .build(move || {
            dependent.get();
        })
        .unwrap();

    let began = Instant::now();
    let ready_fired = Arc::new(AtomicBool::new(false));
    let flag = ready_fired.clone();
    let err = runner
        .run(CancelToken::never(), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    let (hook, phase, cause) = err.hook_failure().expect("hook failure");
    assert_eq!(phase, LifecyclePhase::Start);
    assert_eq!(
        hook.tag().and_then(|t| t.downcast_ref::<&str>()).copied(),
        Some("slow")
    );
    assert_eq!(cause.to_string(), "start timed out");
    assert!(began.elapsed() < Duration::from_secs(2));
    assert!(!ready_fired.load(Ordering::SeqCst));
    // the dependent never started
    assert!(!recorder.contains(&Event::Start("dependent")));
    assert_eq!(recorder.count_of(&Event::Shutdown), 1);
}

#[tokio::test]
async fn failing_runnable_shuts_the_graph_down() {
    let recorder = Recorder::new();
    let worker = provide(|| {
        use_lifecycle()
            .add_run_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err("disk full".into())
            })
            .tag("worker");
    });
    let cause_seen = Arc::new(AtomicBool::new(false));
    let server = {
        let worker = worker.clone();
        let cause_seen = cause_seen.clone();
        provide(move || {
            worker.get();
            let cause_seen = cause_seen.clone();
            use_lifecycle()
                .add_run_fn(move |ctx| {
                    let cause_seen = cause_seen.clone();
                    async move {
                        ctx.cancelled().await;
                        // the failure that began the shutdown is observable
                        // as the cancellation cause
                        if let Some(cause) = ctx.cause() {
                            cause_seen.store(
                                cause.to_string().contains("disk full"),
                                Ordering::SeqCst,
                            );
                        }
                        Ok(())
                    }
                })
                .tag("server");
        })
    };

    let runner = Runner::builder()
        .listener(recorder.clone())
        .build(move || {
            server.get();
        })
        .unwrap();

    let err = runner.run(CancelToken::never(), || {}).await.unwrap_err();
    let (hook, phase, cause) = err.hook_failure().expect("hook failure");
    assert_eq!(phase, LifecyclePhase::Wait);
    assert_eq!(
        hook.tag().and_then(|t| t.downcast_ref::<&str>()).copied(),
        Some("worker")
    );
    assert_eq!(cause.to_string(), "disk full");

    // the dependent is closed after the failure and before the session ends
    assert!(recorder.index_of(&Event::Done("worker")) < recorder.index_of(&Event::Close("server")));
    assert_eq!(recorder.count_of(&Event::Shutdown), 1);
    assert!(cause_seen.load(Ordering::SeqCst));
}

#[tokio::test]
async fn ok_run_result_as_error_per_hook() {
    let quitter = provide(|| {
        use_lifecycle()
            .add_run_fn(|_ctx| async { Ok(()) })
            .ok_run_result_as_error()
            .tag("quitter");
    });
    let runner = Runner::new(move || {
        quitter.get();
    })
    .unwrap();

    let err = runner.run(CancelToken::never(), || {}).await.unwrap_err();
    let (_, phase, cause) = err.hook_failure().expect("hook failure");
    assert_eq!(phase, LifecyclePhase::Wait);
    assert!(cause.is::<UnexpectedOkRunResult>());
}

#[tokio::test]
async fn ok_run_result_as_error_at_runner_scope() {
    let quitter = provide(|| {
        use_lifecycle().add_run_fn(|_ctx| async { Ok(()) }).tag("quitter");
    });
    let runner = Runner::builder()
        .ok_run_result_as_error()
        .build(move || {
            quitter.get();
        })
        .unwrap();

    let err = runner.run(CancelToken::never(), || {}).await.unwrap_err();
    assert!(err
        .hook_failure()
        .is_some_and(|(_, _, cause)| cause.is::<UnexpectedOkRunResult>()));
}

#[tokio::test]
async fn runnables_finishing_cleanly_end_the_session_without_error() {
    let batch = provide(|| {
        use_lifecycle()
            .add_run_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
            .tag("batch");
    });
    let runner = Runner::new(move || {
        batch.get();
    })
    .unwrap();
    runner.run(CancelToken::never(), || {}).await.unwrap();
}

#[tokio::test]
async fn cancellation_during_startup_aborts_in_flight_starts() {
    let recorder = Recorder::new();

    fn slow_starter(
        tag: &'static str,
        dep: Option<Component<()>>,
    ) -> Component<()> {
        provide(move || {
            if let Some(dep) = &dep {
                dep.get();
            }
            use_lifecycle()
                .add_start_fn(|ctx| async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(()),
                        _ = ctx.cancelled() => Err("start aborted".into()),
                    }
                })
                .tag(tag);
        })
    }

    let d = slow_starter("d", None);
    let c = slow_starter("c", Some(d));
    let b = slow_starter("b", Some(c));
    let a = slow_starter("a", Some(b));

    let runner = Runner::builder()
        .listener(recorder.clone())
        .build(move || {
            a.get();
        })
        .unwrap();

    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.cancel_with(custom_cause());
    });

    let ready_fired = Arc::new(AtomicBool::new(false));
    let flag = ready_fired.clone();
    let err = runner
        .run(token, move || flag.store(true, Ordering::SeqCst))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!ready_fired.load(Ordering::SeqCst));
    // only the leaf had begun starting
    assert!(recorder.contains(&Event::Start("d")));
    assert!(!recorder.contains(&Event::Start("c")));
    assert!(!recorder.contains(&Event::Start("b")));
    assert!(!recorder.contains(&Event::Start("a")));
    // nothing ever started successfully, so nothing is closed
    assert!(!recorder.events().iter().any(|e| matches!(e, Event::Close(_))));
    assert_eq!(recorder.count_of(&Event::Shutdown), 1);
}

#[tokio::test]
async fn second_concurrent_run_is_rejected() {
    let service = serving("service");
    let runner = Arc::new(
        Runner::new(move || {
            service.get();
        })
        .unwrap(),
    );

    let source = CancelSource::new();
    let token = source.token();
    let first = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run(token, || {}).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = runner.run(CancelToken::never(), || {}).await.unwrap_err();
    assert!(matches!(second, armature::RunError::AlreadyRunning));

    source.cancel_with(custom_cause());
    first.await.unwrap().unwrap_err();

    // once the first run returned, running again is possible
    let source = CancelSource::new();
    let token = source.token();
    source.cancel_with(custom_cause());
    runner.run(token, || {}).await.unwrap_err();
}

#[tokio::test]
async fn hook_free_graph_is_ready_immediately() {
    let plain = provide(|| 42u32);
    let runner = Runner::new(move || {
        plain.get();
    })
    .unwrap();
    let ready_fired = Arc::new(AtomicBool::new(false));
    let flag = ready_fired.clone();
    runner
        .run(CancelToken::never(), move || {
            flag.store(true, Ordering::SeqCst)
        })
        .await
        .unwrap();
    assert!(ready_fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn building_a_runner_inside_a_constructor_is_rejected() {
    let component = provide(|| {
        let result = Runner::new(|| {});
        assert!(matches!(
            result,
            Err(BuildError::InProviderContext { .. })
        ));
        1u8
    });
    component.get();
}

#[tokio::test]
async fn two_hooked_components_on_a_cycle_cannot_be_scheduled() {
    use std::sync::OnceLock;

    let consumer_slot: Arc<OnceLock<Component<()>>> = Arc::new(OnceLock::new());
    let producer = {
        let slot = consumer_slot.clone();
        provide(move || {
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("producer");
            let slot = slot.clone();
            armature::use_late_init(move || {
                slot.get().expect("consumer defined").get();
            });
        })
    };
    let consumer = {
        let producer = producer.clone();
        provide(move || {
            producer.get();
            use_lifecycle()
                .add_readiness_run_fn(|ctx, ready| async move {
                    ready.notify();
                    ctx.cancelled().await;
                    Ok(())
                })
                .tag("consumer");
        })
    };
    consumer_slot.set(consumer.clone()).ok();

    let result = Runner::new(move || {
        producer.get();
    });
    match result {
        Err(BuildError::LifecycleCycle(path)) => {
            assert!(path.components().count() >= 2);
        }
        other => panic!("expected a lifecycle cycle, got: {other:?}"),
    }
}

#[tokio::test]
async fn single_hooked_component_on_a_cycle_still_runs() {
    use std::sync::OnceLock;

    let follower_slot: Arc<OnceLock<Component<()>>> = Arc::new(OnceLock::new());
    let leader = {
        let slot = follower_slot.clone();
        provide(move || {
            use_lifecycle()
                .add_run_fn(|_ctx| async { Ok(()) })
                .tag("leader");
            let slot = slot.clone();
            armature::use_late_init(move || {
                slot.get().expect("follower defined").get();
            });
        })
    };
    let follower = {
        let leader = leader.clone();
        provide(move || {
            leader.get();
        })
    };
    follower_slot.set(follower.clone()).ok();

    let runner = Runner::new(move || {
        leader.get();
    })
    .unwrap();
    runner.run(CancelToken::never(), || {}).await.unwrap();
}
