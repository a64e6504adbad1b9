//! Completion events for asynchronous transfers

use std::sync::{Arc, Condvar, Mutex};

use crate::platform::{DriverError, DriverResult};

#[derive(Debug, Clone)]
enum EventStatus {
    Pending,
    Complete,
    Failed(DriverError),
}

#[derive(Debug)]
struct EventState {
    status: Mutex<EventStatus>,
    ready: Condvar,
}

/// Marks the point at which a device buffer's contents become valid.
///
/// Clones share the same state. The first `record_*` call wins; later ones
/// are ignored.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    state: Arc<EventState>,
}

impl TransferEvent {
    fn with_status(status: EventStatus) -> Self {
        TransferEvent {
            state: Arc::new(EventState {
                status: Mutex::new(status),
                ready: Condvar::new(),
            }),
        }
    }

    /// Event for work that has not run yet
    pub fn pending() -> Self {
        Self::with_status(EventStatus::Pending)
    }

    /// Event for data that is already valid
    pub fn completed() -> Self {
        Self::with_status(EventStatus::Complete)
    }

    fn record(&self, status: EventStatus) {
        let mut current = match self.state.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matches!(*current, EventStatus::Pending) {
            *current = status;
            self.state.ready.notify_all();
        }
    }

    pub fn record_success(&self) {
        self.record(EventStatus::Complete);
    }

    pub fn record_failure(&self, error: DriverError) {
        self.record(EventStatus::Failed(error));
    }

    /// Whether the event has completed or failed
    pub fn is_ready(&self) -> bool {
        self.state
            .status
            .lock()
            .map(|status| !matches!(*status, EventStatus::Pending))
            .unwrap_or(true)
    }

    /// Block until the event is recorded; returns the recorded failure if any
    pub fn synchronize(&self) -> DriverResult<()> {
        let mut status = self.state.status.lock()?;
        while matches!(*status, EventStatus::Pending) {
            status = self.state.ready.wait(status)?;
        }
        match &*status {
            EventStatus::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }
}
