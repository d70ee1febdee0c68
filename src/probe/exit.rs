//! One-shot exit probe.
//!
//! An [`ExitProbe`] launches the container (start-then-wait) as a background
//! task and models "has the process finished, and with what status?". It
//! reports healthy while running, and after completion reports the wait
//! outcome forever: once unhealthy it never goes back. The underlying wait
//! cannot be cancelled from here, so `stop` is a no-op; callers rely on
//! `kill` against the container handle instead.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::{
    check::{Check, CheckError, ExitCheck},
    probe::Probe,
};

struct ExitState {
    running: bool,
    started: bool,
    success: bool,
    err: Option<CheckError>,
}

pub struct ExitProbe {
    check: Arc<ExitCheck>,
    state: Arc<Mutex<ExitState>>,
}

impl ExitProbe {
    pub fn new(check: Arc<ExitCheck>) -> Self {
        Self {
            check,
            state: Arc::new(Mutex::new(ExitState {
                running: false,
                started: false,
                success: false,
                err: None,
            })),
        }
    }

    /// True once the container has been started and the wait phase entered.
    /// The probe set gates liveness and readiness startup on this.
    pub fn waiting(&self) -> bool {
        self.check.waiting()
    }
}

impl Probe for ExitProbe {
    fn start(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
            if state.started {
                warn!("[ExitProbe] start() called twice; ignoring");
                return;
            }
            state.started = true;
            state.running = true;
        }

        let check = self.check.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let result = check.run().await;
            let mut s = state.lock().unwrap_or_else(|err| err.into_inner());
            s.success = result.success;
            s.err = result.error;
            s.running = false;
            debug!(success = s.success, "[ExitProbe] container finished");
        });
    }

    fn healthy(&self) -> (bool, Option<CheckError>) {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if state.running {
            return (true, None);
        }
        (state.success, state.err.clone())
    }

    fn started(&self) -> bool {
        self.state.lock().unwrap_or_else(|err| err.into_inner()).started
    }

    fn running(&self) -> bool {
        self.state.lock().unwrap_or_else(|err| err.into_inner()).running
    }

    // Once the underlying wait is issued it cannot be cancelled from here.
    fn stop(&self) {}
}
