#![forbid(unsafe_code)]

//! Wake-up events and the shared "poll a predicate until it holds" helper
//! used by every blocking wait in the log (`wait_for_checkpoint`,
//! `free_check`, archiver start and stop).

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::types::{LogError, Result};

/// Generation-counting wake-up event.
///
/// Waiters remember the generation they last observed and sleep until it
/// changes, so a `notify` that races with the start of a wait is never lost.
#[derive(Default)]
pub struct Event {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Event {
    /// Creates an event at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Advances the generation and wakes every waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Blocks until the generation moves past `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cv.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        *generation
    }
}

/// Outcome of one evaluation of a wait predicate.
#[derive(Debug)]
pub enum Poll {
    /// The awaited condition holds.
    Ready,
    /// Not yet; keep waiting.
    Pending,
    /// Shutdown began while waiting.
    Interrupted,
    /// The awaited work failed and will never complete.
    Failed(LogError),
}

/// Tuning for [`poll_until`].
#[derive(Clone, Copy, Debug)]
pub struct WaitOptions {
    /// Label used in alert messages and timeout errors.
    pub what: &'static str,
    /// Busy rounds before the first sleep.
    pub spin_rounds: u32,
    /// Sleep quantum between evaluations.
    pub sleep: Duration,
    /// Interval between liveness warnings.
    pub alert_every: Duration,
    /// Upper bound on the wait, `None` to wait until ready or interrupted.
    pub timeout: Option<Duration>,
}

impl WaitOptions {
    /// Options with a fixed sleep quantum and no timeout.
    pub fn new(what: &'static str, sleep: Duration, alert_every: Duration) -> Self {
        Self {
            what,
            spin_rounds: 0,
            sleep,
            alert_every,
            timeout: None,
        }
    }

    /// Sets the number of spin rounds before sleeping.
    pub fn with_spins(mut self, spin_rounds: u32) -> Self {
        self.spin_rounds = spin_rounds;
        self
    }

    /// Bounds the total wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Statistics returned by a completed wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitStats {
    /// Number of predicate evaluations that returned `Pending`.
    pub rounds: u64,
    /// Wall time spent waiting.
    pub waited: Duration,
}

impl WaitStats {
    /// True when the caller never had to wait.
    pub fn is_immediate(&self) -> bool {
        self.rounds == 0
    }
}

/// Evaluates `check` until it reports a terminal outcome.
///
/// Between evaluations the caller sleeps for `opts.sleep`, or until `event`
/// is notified when one is supplied. A warning is logged every
/// `opts.alert_every` while the wait continues.
pub fn poll_until<F>(opts: &WaitOptions, event: Option<&Event>, mut check: F) -> Result<WaitStats>
where
    F: FnMut() -> Poll,
{
    let start = Instant::now();
    let mut next_alert = start + opts.alert_every;
    let mut rounds = 0u64;
    loop {
        let seen = event.map(Event::generation);
        match check() {
            Poll::Ready => {
                return Ok(WaitStats {
                    rounds,
                    waited: start.elapsed(),
                })
            }
            Poll::Interrupted => return Err(LogError::Interrupted),
            Poll::Failed(err) => return Err(err),
            Poll::Pending => {}
        }
        rounds += 1;
        if rounds <= u64::from(opts.spin_rounds) {
            std::hint::spin_loop();
            continue;
        }
        let now = Instant::now();
        if let Some(timeout) = opts.timeout {
            if now.duration_since(start) >= timeout {
                return Err(LogError::Timeout(opts.what));
            }
        }
        if now >= next_alert {
            warn!(
                what = opts.what,
                waited_ms = now.duration_since(start).as_millis() as u64,
                "wait.alert"
            );
            next_alert = now + opts.alert_every;
        }
        match (event, seen) {
            (Some(event), Some(seen)) => {
                event.wait_past(seen, opts.sleep);
            }
            _ => std::thread::sleep(opts.sleep),
        }
    }
}
