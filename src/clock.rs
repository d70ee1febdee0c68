//! Abstraction over wall time.
//!
//! Every time-dependent component takes a [`Clock`] collaborator instead of
//! reaching for the tokio timer directly. [`SystemClock`] is the production
//! implementation; [`MockClock`] only moves when a test calls
//! [`MockClock::advance`], waking any sleeper whose deadline has been
//! crossed. This is what makes the probe loops and the controller watch loop
//! deterministically testable.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Capability to read the current instant, sleep, and obtain one-shot timer
/// signals.
///
/// `after` returns a receiver that fires once the duration has elapsed; it is
/// the raceable form of `sleep` used to time out in-flight checks inside
/// `select!`.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current instant, for relative measurements.
    fn now(&self) -> Instant;

    /// Current UTC timestamp, used when recording probe errors.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Returns a one-shot signal that fires after `duration`.
    fn after(&self, duration: Duration) -> oneshot::Receiver<()>;
}

/// Production clock backed by the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn after(&self, duration: Duration) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(());
        });
        rx
    }
}

struct MockSleeper {
    deadline: Duration,
    seq: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct MockState {
    elapsed: Duration,
    next_seq: u64,
    sleepers: Vec<MockSleeper>,
}

/// Deterministic clock for tests.
///
/// Virtual time starts at the Unix epoch and only moves on [`advance`].
/// Sleepers whose deadlines are crossed by an advance are woken in
/// (deadline, registration) order.
///
/// [`advance`]: MockClock::advance
pub struct MockClock {
    base: Instant,
    epoch: DateTime<Utc>,
    state: Mutex<MockState>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            epoch: DateTime::UNIX_EPOCH,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Moves virtual time forward and wakes every sleeper whose deadline is
    /// now due. Wakes happen outside the state lock.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            state.elapsed += duration;
            let now = state.elapsed;
            let mut due: Vec<MockSleeper> = Vec::new();
            let mut rest: Vec<MockSleeper> = Vec::new();
            for sleeper in state.sleepers.drain(..) {
                if sleeper.deadline <= now {
                    due.push(sleeper);
                } else {
                    rest.push(sleeper);
                }
            }
            state.sleepers = rest;
            due.sort_by_key(|sleeper| (sleeper.deadline, sleeper.seq));
            due
        };
        for sleeper in due {
            // The receiver may have been dropped (e.g. a timed-out tick that
            // completed first); a failed send is fine.
            let _ = sleeper.tx.send(());
        }
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .elapsed
    }
}

#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.epoch + chrono::Duration::from_std(self.elapsed()).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let _ = self.after(duration).await;
    }

    fn after(&self, duration: Duration) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if duration.is_zero() {
            let _ = tx.send(());
            return rx;
        }
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let deadline = state.elapsed + duration;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleepers.push(MockSleeper { deadline, seq, tx });
        rx
    }
}
