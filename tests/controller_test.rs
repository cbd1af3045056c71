//! Integration tests for the controller lifecycle and worker pool.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Widget, fast_config, wait_until};
use reconcile_rs::config::ControllerConfig;
use reconcile_rs::engine::Controller;
use reconcile_rs::error::Error;
use reconcile_rs::model::ObjectKey;
use reconcile_rs::queue::rate_limit::ExponentialFailureRateLimiter;
use reconcile_rs::source::MemorySource;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

fn widget_source(widgets: &[Widget]) -> Arc<MemorySource<Widget>> {
    let source = Arc::new(MemorySource::new());
    for w in widgets {
        source.apply(w.clone()).unwrap();
    }
    source
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconciles_every_object_once_synced() {
    let widgets = [
        Widget::new("ns", "a"),
        Widget::new("ns", "b"),
        Widget::new("other", "a"),
    ];
    let source = widget_source(&widgets);
    source.mark_synced();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = Controller::builder("widgets", Arc::clone(&source), move |key: ObjectKey| {
        let tx = tx.clone();
        async move {
            tx.send(key).ok();
            anyhow::Ok(())
        }
    })
    .config(fast_config(2))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    let mut seen = HashSet::new();
    for _ in 0..widgets.len() {
        let key = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reconcile should run")
            .unwrap();
        seen.insert(key);
    }
    let expected: HashSet<_> = widgets.iter().map(Widget::key).collect();
    assert_eq!(seen, expected);

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn workers_wait_for_cache_sync() {
    let source = widget_source(&[Widget::new("ns", "a")]);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let controller = Controller::builder("widgets", Arc::clone(&source), move |_key: ObjectKey| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    })
    .config(fast_config(1))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "reconciled against a cold cache");

    source.mark_synced();
    wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1).await;

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cache_sync_timeout_refuses_to_start_workers() {
    let source = widget_source(&[Widget::new("ns", "a")]);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let controller = Controller::builder("widgets", source, move |_key: ObjectKey| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    })
    .config(ControllerConfig {
        cache_sync_timeout: Some(Duration::from_millis(100)),
        ..fast_config(2)
    })
    .build();

    let err = controller.run().await.unwrap_err();
    match err {
        Error::CacheSync { controller, waited } => {
            assert_eq!(controller, "widgets");
            assert_eq!(waited, Duration::from_millis(100));
        }
        other => panic!("expected CacheSync, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn shutdown_before_sync_returns_cleanly() {
    let source = widget_source(&[Widget::new("ns", "a")]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let controller = Controller::builder("widgets", source, move |_key: ObjectKey| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { anyhow::Ok(()) }
    })
    .config(fast_config(1))
    .build();

    controller.shutdown();
    controller.run().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn zero_workers_is_rejected() {
    let source = widget_source(&[Widget::new("ns", "a")]);
    source.mark_synced();

    let controller = Controller::builder("widgets", source, |_key: ObjectKey| async {
        anyhow::Ok(())
    })
    .config(fast_config(0))
    .build();

    let err = tokio::time::timeout(Duration::from_secs(1), controller.run())
        .await
        .expect("run should fail fast")
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    assert!(controller.queue().is_shutting_down());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failing_key_backs_off_then_resets_after_success() {
    let b = Widget::new("ns", "b");
    let source = widget_source(&[b.clone()]);
    source.mark_synced();

    let calls = Arc::new(AtomicU32::new(0));
    let times = Arc::new(Mutex::new(Vec::new()));

    let (counter, stamps) = (Arc::clone(&calls), Arc::clone(&times));
    let controller = Controller::builder("widgets", Arc::clone(&source), move |_key: ObjectKey| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        stamps.lock().unwrap().push(Instant::now());
        async move {
            match call {
                1 | 2 | 4 => anyhow::bail!("transient failure #{call}"),
                _ => anyhow::Ok(()),
            }
        }
    })
    .config(fast_config(1))
    .rate_limiter(ExponentialFailureRateLimiter::new(
        Duration::from_millis(100),
        Duration::from_secs(10),
    ))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    let key = b.key();
    wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 3).await;
    wait_until(Duration::from_secs(1), || {
        controller.queue().num_requeues(&key) == 0 && !controller.queue().is_processing(&key)
    })
    .await;

    // A fresh failure after the success starts again from the base delay.
    source.apply(b.bumped()).unwrap();
    wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 5).await;

    let t = times.lock().unwrap().clone();
    let d0 = t[1] - t[0];
    let d1 = t[2] - t[1];
    let reset = t[4] - t[3];
    assert!(d0 >= Duration::from_millis(100), "d0 = {d0:?}");
    assert!(d1 >= Duration::from_millis(200), "d1 = {d1:?}");
    assert!(d0 < d1);
    assert!(reset >= Duration::from_millis(100) && reset < d1, "reset = {reset:?}");

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn panicking_reconcile_is_retried_and_pool_survives() {
    let source = widget_source(&[Widget::new("ns", "boom"), Widget::new("ns", "fine")]);
    source.mark_synced();

    let boom_calls = Arc::new(AtomicU32::new(0));
    let fine_calls = Arc::new(AtomicU32::new(0));

    let (boom, fine) = (Arc::clone(&boom_calls), Arc::clone(&fine_calls));
    let controller = Controller::builder("widgets", Arc::clone(&source), move |key: ObjectKey| {
        let (boom, fine) = (Arc::clone(&boom), Arc::clone(&fine));
        async move {
            if key.name() == "boom" {
                if boom.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("reconciler bug");
                }
            } else {
                fine.fetch_add(1, Ordering::SeqCst);
            }
            anyhow::Ok(())
        }
    })
    .config(fast_config(1))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    wait_until(Duration::from_secs(2), || {
        boom_calls.load(Ordering::SeqCst) == 2 && fine_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    let key = Widget::new("ns", "boom").key();
    wait_until(Duration::from_secs(1), || controller.queue().num_requeues(&key) == 0).await;

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn panic_while_building_the_reconcile_future_is_recovered() {
    let boom = Widget::new("ns", "boom");
    let fine = Widget::new("ns", "fine");
    let source = widget_source(&[boom.clone(), fine.clone()]);
    source.mark_synced();

    let boom_calls = Arc::new(AtomicU32::new(0));
    let fine_calls = Arc::new(AtomicU32::new(0));

    let (b, f) = (Arc::clone(&boom_calls), Arc::clone(&fine_calls));
    let controller = Controller::builder("widgets", Arc::clone(&source), move |key: ObjectKey| {
        // Panics synchronously, before any future exists.
        if key.name() == "boom" {
            if b.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("reconciler bug");
            }
        } else {
            f.fetch_add(1, Ordering::SeqCst);
        }
        async { anyhow::Ok(()) }
    })
    .config(fast_config(1))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    wait_until(Duration::from_secs(2), || {
        boom_calls.load(Ordering::SeqCst) == 2 && fine_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    wait_until(Duration::from_secs(1), || !controller.queue().is_processing(&boom.key())).await;

    // The single worker is still alive and picks up new work.
    source.apply(fine.bumped()).unwrap();
    wait_until(Duration::from_secs(2), || fine_calls.load(Ordering::SeqCst) == 2).await;

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_retries_emit_one_dead_letter() {
    let w = Widget::new("ns", "doomed");
    let source = widget_source(&[w.clone()]);
    source.mark_synced();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel();

    let controller = Controller::builder("widgets", Arc::clone(&source), move |_key: ObjectKey| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(anyhow::anyhow!("backend unavailable")) }
    })
    .config(ControllerConfig {
        max_retries: Some(2),
        ..fast_config(1)
    })
    .rate_limiter(ExponentialFailureRateLimiter::new(
        Duration::from_millis(1),
        Duration::from_millis(10),
    ))
    .dead_letters(dead_tx)
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    let letter = tokio::time::timeout(Duration::from_secs(2), dead_rx.recv())
        .await
        .expect("dead letter should arrive")
        .unwrap();
    assert_eq!(letter.key, w.key());
    assert_eq!(letter.controller, "widgets");
    assert_eq!(letter.run_id, controller.run_id());
    assert_eq!(letter.attempts, 3);
    assert!(letter.last_error.contains("backend unavailable"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(controller.queue().num_requeues(&w.key()), 0);
    assert!(dead_rx.try_recv().is_err());

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Per-key serialization and shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn updates_during_slow_reconcile_cause_exactly_one_more_pass() {
    let a = Widget::new("ns", "a");
    let source = widget_source(&[a.clone()]);
    source.mark_synced();

    let calls = Arc::new(AtomicU32::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let controller = {
        let (calls, active, overlapped) =
            (Arc::clone(&calls), Arc::clone(&active), Arc::clone(&overlapped));
        let (started, release) = (Arc::clone(&started), Arc::clone(&release));
        Controller::builder("widgets", Arc::clone(&source), move |_key: ObjectKey| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let (active, overlapped) = (Arc::clone(&active), Arc::clone(&overlapped));
            let (started, release) = (Arc::clone(&started), Arc::clone(&release));
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                if call == 1 {
                    started.notify_one();
                    release.notified().await;
                }
                active.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .config(fast_config(3))
        .build()
    };

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    started.notified().await;
    let mut latest = a.clone();
    for _ in 0..3 {
        latest = latest.bumped();
        source.apply(latest.clone()).unwrap();
    }
    release.notify_one();

    wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!overlapped.load(Ordering::SeqCst));

    controller.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_lets_in_flight_reconcile_finish() {
    let source = widget_source(&[Widget::new("ns", "slow")]);
    source.mark_synced();

    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    let controller = Controller::builder("widgets", Arc::clone(&source), move |_key: ObjectKey| {
        let (s, f) = (Arc::clone(&s), Arc::clone(&f));
        async move {
            s.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            f.store(true, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })
    .config(fast_config(2))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    started.notified().await;
    controller.shutdown();
    handle.await.unwrap().unwrap();

    assert!(finished.load(Ordering::SeqCst), "in-flight reconcile was cut short");
    assert!(controller.queue().is_shutting_down());
}

#[tokio::test]
async fn deleted_object_is_reconciled_as_absent() {
    let w = Widget::new("ns", "gone");
    let source = widget_source(&[w.clone()]);
    source.mark_synced();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = Arc::clone(&source);
    let controller = Controller::builder("widgets", Arc::clone(&source), move |key: ObjectKey| {
        let present = store.get(&key).is_some();
        let tx = tx.clone();
        async move {
            tx.send(present).ok();
            anyhow::Ok(())
        }
    })
    .config(fast_config(1))
    .build();

    let ctrl = controller.clone();
    let handle = tokio::spawn(async move { ctrl.run().await });

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(first, Some(true));

    source.remove(&w.key()).unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(second, Some(false));

    controller.shutdown();
    handle.await.unwrap().unwrap();
}
