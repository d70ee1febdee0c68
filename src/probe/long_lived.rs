//! Periodic thresholded probe.
//!
//! A [`LongLivedProbe`] keeps performing the same check at an interval and
//! only stops when its failure threshold is reached or it is told to. Each
//! tick races the check against a clock timeout; a timed out check's late
//! completion lands on a oneshot owned by that tick and is discarded, so it
//! can never corrupt probe state.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    check::{Check, CheckError, CheckResult},
    clock::Clock,
    probe::{Probe, ProbeTiming},
};

struct LongLivedState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    has_succeeded: bool,
    has_failed: bool,
    healthy: bool,
    err: Option<CheckError>,
    running: bool,
    started: bool,
}

/// Supervises one check according to [`ProbeTiming`].
pub struct LongLivedProbe {
    check: Arc<dyn Check>,
    clock: Arc<dyn Clock>,
    timing: ProbeTiming,
    state: Arc<Mutex<LongLivedState>>,
}

impl LongLivedProbe {
    fn new(
        check: Arc<dyn Check>,
        clock: Arc<dyn Clock>,
        timing: ProbeTiming,
        initially_healthy: bool,
    ) -> Self {
        Self {
            check,
            clock,
            timing,
            state: Arc::new(Mutex::new(LongLivedState {
                consecutive_successes: 0,
                consecutive_failures: 0,
                has_succeeded: false,
                has_failed: false,
                healthy: initially_healthy,
                err: None,
                running: false,
                started: false,
            })),
        }
    }

    /// Liveness probe. Reports healthy before its first conclusion so a pod
    /// is not flagged unhealthy while it boots; callers rely on this.
    pub fn liveness(check: Arc<dyn Check>, clock: Arc<dyn Clock>, timing: ProbeTiming) -> Self {
        Self::new(check, clock, timing, true)
    }

    /// Readiness probe. Reports unready until its first success.
    pub fn readiness(check: Arc<dyn Check>, clock: Arc<dyn Clock>, timing: ProbeTiming) -> Self {
        Self::new(check, clock, timing, false)
    }
}

impl Probe for LongLivedProbe {
    fn start(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            if state.started {
                warn!("[Probe] start() called twice; ignoring");
                return;
            }
            state.started = true;
            state.running = true;
        }

        let check = self.check.clone();
        let clock = self.clock.clone();
        let timing = self.timing;
        let state = self.state.clone();
        tokio::spawn(async move {
            run_loop(check, clock, timing, state).await;
        });
    }

    fn healthy(&self) -> (bool, Option<CheckError>) {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        (state.healthy, state.err.clone())
    }

    fn started(&self) -> bool {
        self.state.lock().unwrap_or_else(|err| err.into_inner()).started
    }

    fn running(&self) -> bool {
        self.state.lock().unwrap_or_else(|err| err.into_inner()).running
    }

    fn stop(&self) {
        self.state.lock().unwrap_or_else(|err| err.into_inner()).running = false;
    }
}

async fn run_loop(
    check: Arc<dyn Check>,
    clock: Arc<dyn Clock>,
    timing: ProbeTiming,
    state: Arc<Mutex<LongLivedState>>,
) {
    clock.sleep(timing.initial_delay).await;

    loop {
        // Stop requested (or failure threshold tripped) between ticks.
        if !state.lock().unwrap_or_else(|err| err.into_inner()).running {
            return;
        }

        // Fire the check on its own task so a slow or blocked check cannot
        // hold up the timeout race. The oneshot belongs to this tick; a late
        // completion after the timeout has won is dropped on the floor.
        let (done_tx, done_rx) = oneshot::channel();
        let tick_check = check.clone();
        tokio::spawn(async move {
            let _ = done_tx.send(tick_check.run().await);
        });

        let timeout = clock.after(timing.timeout);
        let outcome = tokio::select! {
            _ = timeout => None,
            result = done_rx => Some(result.unwrap_or_else(|_| CheckResult::fail(None))),
        };

        let mut threshold_reached = false;
        {
            let mut s = state.lock().unwrap_or_else(|err| err.into_inner());
            let success = match outcome {
                None => {
                    debug!(timeout = ?timing.timeout, "[Probe] tick timed out");
                    s.has_failed = true;
                    s.consecutive_failures += 1;
                    s.consecutive_successes = 0;
                    false
                }
                Some(result) => {
                    s.has_failed = s.has_failed || !result.success;
                    s.has_succeeded = s.has_succeeded || result.success;
                    if let Some(err) = result.error {
                        debug!(error = %err, "[Probe] tick reported an error");
                        s.err = Some(err);
                    }
                    if result.success {
                        s.consecutive_successes += 1;
                        s.consecutive_failures = 0;
                    } else {
                        s.consecutive_failures += 1;
                        s.consecutive_successes = 0;
                    }
                    result.success
                }
            };

            if s.consecutive_failures >= timing.failure_threshold {
                debug!(
                    failures = s.consecutive_failures,
                    "[Probe] failure threshold reached; giving up"
                );
                s.healthy = false;
                s.running = false;
                threshold_reached = true;
            } else if s.consecutive_successes >= timing.success_threshold
                || (!s.has_failed && success)
                || (!s.has_succeeded && success)
            {
                s.healthy = true;
            } else if !success {
                s.healthy = false;
            }
        }

        if threshold_reached {
            return;
        }

        clock.sleep(timing.period).await;
    }
}
