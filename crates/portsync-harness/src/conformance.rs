//! Behavioral scenarios run against the installed dispatch table.
//!
//! Each scenario builds its own primitives through [`portsync_sys::Mutex`] and
//! [`portsync_sys::Condvar`] using the table snapshot taken when the run
//! starts, so a table installed by the embedding program is what gets
//! exercised. Scenarios that prove something blocks forever leave the blocked
//! helper thread parked until process exit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use portsync_core::{MutexKind, SyncError, Timeout, fallback_policy};
use portsync_sys::backend::fallback_substitutions;
use portsync_sys::{Condvar, Mutex, SyncOps, dispatch, live_primitive_count};
use serde::Serialize;
use tracing::{info, warn};

/// Longest a scenario waits on a helper thread before declaring failure.
const WATCHDOG: Duration = Duration::from_secs(5);
/// A lock still pending after this long counts as blocked.
const BLOCK_PROBE: Duration = Duration::from_millis(100);
/// Allowed lateness of a timed wait past its requested duration.
const TIMEOUT_SLACK: Duration = Duration::from_millis(250);
/// Allowed earliness; the POSIX deadline is taken on the realtime clock.
const TIMEOUT_EARLY: Duration = Duration::from_millis(2);

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub passed: bool,
    pub elapsed_micros: u64,
    pub detail: String,
}

/// Full conformance run.
#[derive(Debug, Clone, Serialize)]
pub struct ConformanceReport {
    /// Name of the table the scenarios ran against.
    pub backend: &'static str,
    /// True when the embedding program installed its own table.
    pub dispatch_replaced: bool,
    pub fallback_policy: &'static str,
    pub timeout_ms: u64,
    pub ok: bool,
    pub passed: usize,
    pub failed: usize,
    pub fallback_mutex_substitutions: u64,
    pub fallback_cond_var_substitutions: u64,
    pub scenarios: Vec<ScenarioResult>,
}

type Outcome = Result<String, String>;

struct Context {
    ops: SyncOps,
    timeout: Duration,
}

struct Scenario {
    name: &'static str,
    run: fn(&Context) -> Outcome,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "try_lock_cross_thread",
        run: try_lock_cross_thread,
    },
    Scenario {
        name: "try_lock_same_thread",
        run: try_lock_same_thread,
    },
    Scenario {
        name: "reentrant_nesting",
        run: reentrant_nesting,
    },
    Scenario {
        name: "non_reentrant_relock_blocks",
        run: non_reentrant_relock_blocks,
    },
    Scenario {
        name: "release_is_balanced",
        run: release_is_balanced,
    },
    Scenario {
        name: "timed_wait_times_out",
        run: timed_wait_times_out,
    },
    Scenario {
        name: "signal_wakes_waiter",
        run: signal_wakes_waiter,
    },
    Scenario {
        name: "broadcast_wakes_waiters",
        run: broadcast_wakes_waiters,
    },
];

/// Run every scenario against the currently installed dispatch table.
///
/// `timeout_ms` is the duration requested by the timed-wait scenario.
#[must_use]
pub fn run_conformance(timeout_ms: u64) -> ConformanceReport {
    let dispatch_replaced = dispatch::is_replaced();
    let ctx = Context {
        ops: dispatch::current(),
        timeout: Duration::from_millis(timeout_ms),
    };
    let scenarios: Vec<ScenarioResult> = SCENARIOS.iter().map(|s| run_one(s, &ctx)).collect();
    let passed = scenarios.iter().filter(|s| s.passed).count();
    let failed = scenarios.len() - passed;
    let (fallback_mutex_substitutions, fallback_cond_var_substitutions) = fallback_substitutions();

    ConformanceReport {
        backend: ctx.ops.name(),
        dispatch_replaced,
        fallback_policy: fallback_policy().name(),
        timeout_ms,
        ok: failed == 0,
        passed,
        failed,
        fallback_mutex_substitutions,
        fallback_cond_var_substitutions,
        scenarios,
    }
}

fn run_one(scenario: &Scenario, ctx: &Context) -> ScenarioResult {
    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| (scenario.run)(ctx)))
        .unwrap_or_else(|payload| Err(format!("panicked: {}", panic_message(&*payload))));
    let elapsed_micros = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);

    let (passed, detail) = match outcome {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    if passed {
        info!(scenario = scenario.name, elapsed_micros, "scenario passed");
    } else {
        warn!(scenario = scenario.name, elapsed_micros, %detail, "scenario failed");
    }
    ScenarioResult {
        name: scenario.name,
        passed,
        elapsed_micros,
        detail,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

fn check(cond: bool, failure: &str) -> Result<(), String> {
    if cond { Ok(()) } else { Err(failure.to_owned()) }
}

/// True when a fresh thread cannot acquire `mutex` right now.
fn held_elsewhere(mutex: &Mutex) -> bool {
    std::thread::scope(|s| s.spawn(|| mutex.try_lock().is_none()).join().unwrap_or(false))
}

// ---------------------------------------------------------------------------
// Mutex scenarios
// ---------------------------------------------------------------------------

fn try_lock_cross_thread(ctx: &Context) -> Outcome {
    let m = Mutex::with_ops(ctx.ops, MutexKind::NonReentrant);
    let guard = m.lock();
    check(held_elsewhere(&m), "second thread acquired a held mutex")?;
    drop(guard);
    check(!held_elsewhere(&m), "second thread could not acquire a released mutex")?;
    Ok("try_lock fails while held and succeeds after unlock".into())
}

fn try_lock_same_thread(ctx: &Context) -> Outcome {
    let plain = Mutex::with_ops(ctx.ops, MutexKind::NonReentrant);
    let held = plain.try_lock().ok_or("try_lock on an unlocked mutex failed")?;
    check(held_elsewhere(&plain), "successful try_lock left the mutex unlocked")?;
    check(
        plain.try_lock().is_none(),
        "owner re-acquired a non-reentrant mutex via try_lock",
    )?;
    drop(held);

    let recursive = Mutex::with_ops(ctx.ops, MutexKind::Reentrant);
    let _outer = recursive.lock();
    check(
        recursive.try_lock().is_some(),
        "owner could not nest a reentrant mutex via try_lock",
    )?;
    Ok("owner try_lock: non-reentrant refuses, reentrant nests".into())
}

fn reentrant_nesting(ctx: &Context) -> Outcome {
    const DEPTH: usize = 3;
    let m = Mutex::with_ops(ctx.ops, MutexKind::Reentrant);
    let mut guards: Vec<_> = (0..DEPTH).map(|_| m.lock()).collect();
    while guards.len() > 1 {
        drop(guards.pop());
        check(
            held_elsewhere(&m),
            "reentrant mutex released before the final unlock",
        )?;
    }
    drop(guards.pop());
    check(
        !held_elsewhere(&m),
        "reentrant mutex still held after matching unlocks",
    )?;
    Ok(format!("{DEPTH} nested locks released by {DEPTH} unlocks"))
}

fn non_reentrant_relock_blocks(ctx: &Context) -> Outcome {
    let m = Arc::new(Mutex::with_ops(ctx.ops, MutexKind::NonReentrant));
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _first = m.lock();
        let _ = tx.send("first");
        let _second = m.lock();
        let _ = tx.send("second");
    });

    match rx.recv_timeout(WATCHDOG) {
        Ok("first") => {}
        other => return Err(format!("first lock did not complete: {other:?}")),
    }
    match rx.recv_timeout(BLOCK_PROBE) {
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(format!(
            "self-relock still blocked after {}ms",
            BLOCK_PROBE.as_millis()
        )),
        other => Err(format!("self-relock returned: {other:?}")),
    }
}

fn release_is_balanced(ctx: &Context) -> Outcome {
    let before = live_primitive_count();
    {
        let _mutexes: Vec<_> = [MutexKind::NonReentrant, MutexKind::Reentrant]
            .into_iter()
            .cycle()
            .take(4)
            .map(|kind| Mutex::with_ops(ctx.ops, kind))
            .collect();
        let _conds: Vec<_> = (0..2).map(|_| Condvar::with_ops(ctx.ops)).collect();
    }
    let after = live_primitive_count();
    check(
        after == before,
        &format!("live primitives went from {before} to {after}"),
    )?;
    Ok(format!("{before} live primitives before and after"))
}

// ---------------------------------------------------------------------------
// Condition variable scenarios
// ---------------------------------------------------------------------------

fn timed_wait_times_out(ctx: &Context) -> Outcome {
    let m = Mutex::with_ops(ctx.ops, MutexKind::NonReentrant);
    let cv = Condvar::with_ops(ctx.ops);
    let mut guard = m.lock();

    let start = Instant::now();
    let deadline = start + ctx.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match cv.wait(&mut guard, Timeout::from_duration(remaining)) {
            Err(SyncError::OperationTimedOut) => break,
            // Spurious wakeup.
            Ok(()) if Instant::now() < deadline => {}
            Ok(()) => return Err("wait reported success past its deadline".into()),
            Err(err) => return Err(format!("wait failed: {err}")),
        }
    }
    let elapsed = start.elapsed();

    check(
        elapsed + TIMEOUT_EARLY >= ctx.timeout,
        &format!("timed out early after {elapsed:?}"),
    )?;
    check(
        elapsed <= ctx.timeout + TIMEOUT_SLACK,
        &format!("timed out late after {elapsed:?}"),
    )?;
    check(held_elsewhere(&m), "mutex not reacquired after timeout")?;
    drop(guard);
    Ok(format!(
        "requested {}ms, timed out after {}us holding the mutex",
        ctx.timeout.as_millis(),
        elapsed.as_micros()
    ))
}

fn signal_wakes_waiter(ctx: &Context) -> Outcome {
    wake_waiters(ctx, MutexKind::Reentrant, 1, false)
}

fn broadcast_wakes_waiters(ctx: &Context) -> Outcome {
    wake_waiters(ctx, MutexKind::NonReentrant, 3, true)
}

struct Shared {
    mutex: Mutex,
    cond: Condvar,
    ready: AtomicBool,
}

/// `waiters` threads wait with no timeout until `ready` is published, then
/// report whether they hold the mutex again.
fn wake_waiters(ctx: &Context, kind: MutexKind, waiters: usize, broadcast: bool) -> Outcome {
    let shared = Arc::new(Shared {
        mutex: Mutex::with_ops(ctx.ops, kind),
        cond: Condvar::with_ops(ctx.ops),
        ready: AtomicBool::new(false),
    });
    let (waiting_tx, waiting_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    for _ in 0..waiters {
        let shared = Arc::clone(&shared);
        let waiting_tx = waiting_tx.clone();
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            let mut guard = shared.mutex.lock();
            let _ = waiting_tx.send(());
            let mut result = Ok(());
            while result.is_ok() && !shared.ready.load(Ordering::Acquire) {
                result = shared.cond.wait(&mut guard, Timeout::INFINITE);
            }
            let reacquired = held_elsewhere(&shared.mutex);
            drop(guard);
            let _ = done_tx.send(result.map(|()| reacquired));
        });
    }

    for _ in 0..waiters {
        waiting_rx
            .recv_timeout(WATCHDOG)
            .map_err(|_| "waiter never acquired the mutex".to_owned())?;
    }
    {
        // Every waiter published while holding the mutex, so taking it here
        // means each one is parked in `wait`.
        let _guard = shared.mutex.lock();
        shared.ready.store(true, Ordering::Release);
        let woke = if broadcast {
            shared.cond.broadcast()
        } else {
            shared.cond.signal()
        };
        woke.map_err(|err| format!("wake failed: {err}"))?;
    }

    for _ in 0..waiters {
        match done_rx.recv_timeout(WATCHDOG) {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err("waiter returned without holding the mutex".into()),
            Ok(Err(err)) => return Err(format!("wait failed: {err}")),
            Err(_) => return Err("waiter was never woken".into()),
        }
    }
    let verb = if broadcast { "broadcast" } else { "signal" };
    Ok(format!(
        "{verb} woke {waiters} {} waiter(s), each holding the mutex on return",
        kind.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_panic() {
        panic!("boom");
    }

    fn formatted_panic() {
        panic!("{} {}", "formatted", 1);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p = catch_unwind(static_panic).unwrap_err();
        assert_eq!(panic_message(&*p), "boom");
        let p = catch_unwind(formatted_panic).unwrap_err();
        assert_eq!(panic_message(&*p), "formatted 1");
    }

    #[test]
    fn scenario_names_are_unique() {
        let mut names: Vec<_> = SCENARIOS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
    }
}
