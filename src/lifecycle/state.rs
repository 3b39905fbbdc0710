//! # Lifecycle State Machines
//!
//! Session: `Idle → InFlight → Idle`, and one-way `Idle|InFlight → Disposing → Destroyed`.
//! Engine: `Unloaded → Loaded → Destroyed`.
//!
//! Only the one-way part is stored here, as an atomic phase. Whether a live
//! session is idle or in flight is read from the callback bridge, which is the
//! single owner of in-flight state.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Observable state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    InFlight,
    Disposing,
    Destroyed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::InFlight => "in_flight",
            SessionStatus::Disposing => "disposing",
            SessionStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Observable state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Unloaded = 0,
    Loaded = 1,
    Destroyed = 2,
}

impl From<u8> for EngineStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => EngineStatus::Unloaded,
            1 => EngineStatus::Loaded,
            _ => EngineStatus::Destroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    Live = 0,
    Disposing = 1,
    Destroyed = 2,
}

impl From<u8> for SessionPhase {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionPhase::Live,
            1 => SessionPhase::Disposing,
            _ => SessionPhase::Destroyed,
        }
    }
}

/// One-way session phase with a single-winner dispose transition
#[derive(Debug)]
pub struct SessionPhaseCell(AtomicU8);

impl Default for SessionPhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionPhase::Live as u8))
    }

    pub fn current(&self) -> SessionPhase {
        SessionPhase::from(self.0.load(Ordering::Acquire))
    }

    pub fn is_live(&self) -> bool {
        self.current() == SessionPhase::Live
    }

    /// `Live → Disposing`. Exactly one caller ever gets `true`.
    pub fn begin_dispose(&self) -> bool {
        self.0
            .compare_exchange(
                SessionPhase::Live as u8,
                SessionPhase::Disposing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_destroyed(&self) {
        self.0.store(SessionPhase::Destroyed as u8, Ordering::Release);
    }
}

/// Engine status with a single-winner destroy transition
#[derive(Debug)]
pub struct EngineStatusCell(AtomicU8);

impl Default for EngineStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(EngineStatus::Unloaded as u8))
    }

    pub fn current(&self) -> EngineStatus {
        EngineStatus::from(self.0.load(Ordering::Acquire))
    }

    pub fn is_loaded(&self) -> bool {
        self.current() == EngineStatus::Loaded
    }

    /// `Unloaded → Loaded`
    pub fn mark_loaded(&self) -> bool {
        self.0
            .compare_exchange(
                EngineStatus::Unloaded as u8,
                EngineStatus::Loaded as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Loaded → Destroyed`. Exactly one caller ever gets `true`.
    pub fn begin_destroy(&self) -> bool {
        self.0
            .compare_exchange(
                EngineStatus::Loaded as u8,
                EngineStatus::Destroyed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
