//! # Per-Session Exclusion Gate
//!
//! Serializes generation and prefill on one session so at most one native
//! operation is in flight. Waiters are granted the gate in FIFO order.
//!
//! The gate is a single-permit tokio semaphore. Dropping an `acquire` future
//! before it completes removes the waiter from the queue, and dropping a
//! [`GatePermit`] releases the gate to the next waiter. Permits are owned, so
//! the bridge can keep one alive past the caller's future until the native
//! terminal callback arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

use crate::ffi::types::SessionHandle;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The session is being disposed; no further operations are admitted
    #[error("exclusion gate for {0} is closed")]
    Closed(SessionHandle),
    /// Only returned by `try_acquire`
    #[error("exclusion gate for {0} is held by another operation")]
    Busy(SessionHandle),
}

#[derive(Debug)]
pub struct ExclusionGate {
    session: SessionHandle,
    permits: Arc<Semaphore>,
}

/// Exclusive ownership of a session's gate; released on drop
#[derive(Debug)]
pub struct GatePermit {
    session: SessionHandle,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Hand the gate to the next waiter
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        trace!(
            session = %self.session,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "exclusion gate released"
        );
    }
}

impl ExclusionGate {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until the gate is free, then take it
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed(self.session))?;
        Ok(self.wrap(permit))
    }

    /// Take the gate only if nobody holds it
    pub fn try_acquire(&self) -> Result<GatePermit, GateError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.wrap(permit)),
            Err(TryAcquireError::NoPermits) => Err(GateError::Busy(self.session)),
            Err(TryAcquireError::Closed) => Err(GateError::Closed(self.session)),
        }
    }

    /// Fail every current and future waiter. Held permits stay valid until dropped.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn is_free(&self) -> bool {
        self.permits.available_permits() == 1
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        trace!(session = %self.session, "exclusion gate acquired");
        GatePermit {
            session: self.session,
            acquired_at: Instant::now(),
            _permit: permit,
        }
    }
}
