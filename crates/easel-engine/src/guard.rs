use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// At-most-one-concurrent-run gate.
///
/// `try_begin` moves `Idle -> Running` and hands out a permit; dropping the
/// permit moves the state back to `Idle`.
#[derive(Debug, Clone)]
pub struct SingleFlight {
    name: &'static str,
    state: Arc<Mutex<RunState>>,
}

#[derive(Debug)]
pub struct SingleFlightPermit {
    name: &'static str,
    state: Arc<Mutex<RunState>>,
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn try_begin(&self) -> Option<SingleFlightPermit> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == RunState::Running {
            tracing::debug!(target: "guard", name = self.name, "already running");
            return None;
        }
        *state = RunState::Running;
        Some(SingleFlightPermit {
            name: self.name,
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for SingleFlightPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = RunState::Idle;
        tracing::trace!(target: "guard", name = self.name, "released");
    }
}
