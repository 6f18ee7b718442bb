#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Tests for the action dispatcher
//!
//! # Test Coverage
//!
//! - Async actions queued on the worker pool and slot recycling
//! - Sync fallback when the pool is missing, closed or shedding
//! - Failing and panicking actions contained at the dispatch boundary
//! - Handler sees the whole submission and the session matrix
//!
//! # Known Issues
//!
//! Panics are only exercised on the Sync path; a panic inside a `may`
//! coroutine under the test harness is not reliable to observe.

mod common;

use common::setup_may_runtime;
use panelcore::dispatcher::{DispatchMetrics, DEFAULT_ACTION};
use panelcore::post::ParamVec;
use panelcore::worker_pool::{BackpressureMode, WorkerPoolConfig};
use panelcore::{ActionContext, ActionDispatcher, DispatchOutcome, ExecMode, SessionId, ValueMatrix};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn params(pairs: &[(&str, &str)]) -> ParamVec {
    pairs
        .iter()
        .map(|(k, v)| (Arc::from(*k), (*v).to_string()))
        .collect()
}

fn submit(dispatcher: &ActionDispatcher, pairs: &[(&str, &str)]) -> Option<DispatchOutcome> {
    dispatcher.dispatch(&SessionId::new(), params(pairs), ValueMatrix::new())
}

fn counter(dispatcher: &ActionDispatcher, key: &str, mode: ExecMode) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    dispatcher.register(
        key,
        move |_: &ActionContext| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        mode,
    );
    calls
}

fn pool_config(workers: usize, bound: usize, mode: BackpressureMode) -> WorkerPoolConfig {
    WorkerPoolConfig::new(workers, bound, mode, 10, 0x10000)
}

#[test]
fn test_async_action_runs_on_worker() {
    setup_may_runtime();
    let dispatcher = ActionDispatcher::new();
    dispatcher.start_workers(pool_config(2, 16, BackpressureMode::Block));

    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    dispatcher.register(
        "scan",
        move |ctx: &ActionContext| {
            tx.lock().send(ctx.value.clone())?;
            Ok(())
        },
        ExecMode::Async,
    );

    let outcome = submit(&dispatcher, &[("scan", "full")]);
    assert_eq!(outcome, Some(DispatchOutcome::Queued));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "full");

    // The worker releases the slot after the handler returns.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while dispatcher.slots().running() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(dispatcher.slots().running(), 0);
    assert_eq!(dispatcher.slots().len(), 1);
    dispatcher.stop_workers();
}

#[test]
fn test_async_without_pool_falls_back_once() {
    let dispatcher = ActionDispatcher::new();
    let calls = counter(&dispatcher, "rescan", ExecMode::Async);

    let outcome = submit(&dispatcher, &[("rescan", "1")]);
    assert_eq!(outcome, Some(DispatchOutcome::FellBack { ok: true }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(DispatchMetrics::get(&dispatcher.metrics().fallback), 1);
    assert_eq!(dispatcher.slots().running(), 0);
}

#[test]
fn test_stopped_pool_falls_back() {
    setup_may_runtime();
    let dispatcher = ActionDispatcher::new();
    dispatcher.start_workers(pool_config(1, 16, BackpressureMode::Block));
    dispatcher.stop_workers();
    let calls = counter(&dispatcher, "eject", ExecMode::Async);

    let outcome = submit(&dispatcher, &[("eject", "")]);
    assert_eq!(outcome, Some(DispatchOutcome::FellBack { ok: true }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shedding_pool_falls_back() {
    setup_may_runtime();
    let dispatcher = ActionDispatcher::new();
    dispatcher.start_workers(pool_config(1, 0, BackpressureMode::Shed));
    let calls = counter(&dispatcher, "shuffle", ExecMode::Async);

    for _ in 0..3 {
        let outcome = submit(&dispatcher, &[("shuffle", "on")]);
        assert_eq!(outcome, Some(DispatchOutcome::FellBack { ok: true }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    dispatcher.stop_workers();
}

#[test]
fn test_failing_fallback_reports_not_ok() {
    let dispatcher = ActionDispatcher::new();
    dispatcher.register(
        "format",
        |_: &ActionContext| Err(anyhow::anyhow!("card is read-only")),
        ExecMode::Async,
    );

    let outcome = submit(&dispatcher, &[("format", "sd")]);
    assert_eq!(outcome, Some(DispatchOutcome::FellBack { ok: false }));
    assert_eq!(
        DispatchMetrics::get(&dispatcher.metrics().failed),
        1
    );
}

#[test]
fn test_panicking_action_contained() {
    let dispatcher = ActionDispatcher::new();
    dispatcher.register(
        "crash",
        |_: &ActionContext| -> anyhow::Result<()> { panic!("decoder exploded") },
        ExecMode::Sync,
    );
    let calls = counter(&dispatcher, "volume", ExecMode::Sync);

    let outcome = submit(&dispatcher, &[("crash", "1")]);
    assert_eq!(outcome, Some(DispatchOutcome::Inline { ok: false }));

    // The dispatcher keeps working afterwards.
    let outcome = submit(&dispatcher, &[("volume", "4")]);
    assert_eq!(outcome, Some(DispatchOutcome::Inline { ok: true }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_sees_submission_and_matrix() {
    let dispatcher = ActionDispatcher::new();
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    dispatcher.register(
        DEFAULT_ACTION,
        move |ctx: &ActionContext| {
            let seen = (
                ctx.key.to_string(),
                ctx.param("band").map(str::to_owned),
                ctx.values.get("theme").map(str::to_owned),
            );
            tx.lock().send(seen)?;
            Ok(())
        },
        ExecMode::Sync,
    );

    let mut values = ValueMatrix::new();
    values.set("theme", "dark");
    dispatcher.dispatch(
        &SessionId::new(),
        params(&[("eq", "rock"), ("band", "3")]),
        values,
    );

    let (key, band, theme) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(key, "eq");
    assert_eq!(band.as_deref(), Some("3"));
    assert_eq!(theme.as_deref(), Some("dark"));
}

#[test]
fn test_empty_submission_not_dispatched() {
    let dispatcher = ActionDispatcher::new();
    let calls = counter(&dispatcher, DEFAULT_ACTION, ExecMode::Sync);
    assert_eq!(
        dispatcher.dispatch(&SessionId::new(), ParamVec::new(), ValueMatrix::new()),
        None
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
