//! Event catalogue carried on the bus: a tagged sum type in place of the
//! opaque `payload: *const void` + disposal-callback pattern the original
//! event bus used. Each variant owns its payload, so Rust's ordinary drop
//! glue gives the "disposed exactly once" guarantee for free — no disposer
//! hook needed.

use std::sync::Arc;

use crate::live_data::LiveData;

/// Severity shared by status messages and alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Where a status message or alarm originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Serial,
    Can,
    Cvl,
    Config,
    Keepalive,
}

/// Stable alarm codes. The upstream C++ `AlarmCode` enum these mirror lives
/// in `event/event_types_v2.h`, which is not part of the retrieved sources;
/// the two codes this gateway emits (`CanTxError`, `CanKeepAliveLost`) are
/// assigned here and must not be renumbered once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCode {
    CanTxError = 1,
    CanKeepAliveLost = 2,
}

/// CVL controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvlState {
    Bulk,
    Transition,
    FloatApproach,
    Float,
    ImbalanceHold,
    Sustain,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub level: Severity,
    pub source: EventSource,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct AlarmRaised {
    pub code: AlarmCode,
    pub severity: Severity,
    pub message: String,
    pub value: f32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct CvlStateChanged {
    pub previous: CvlState,
    pub current: CvlState,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    /// Time spent in `previous` before this transition.
    pub state_duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigUpdated {
    pub payload: serde_json::Value,
}

/// One event flowing through the bus. `LiveDataUpdate` wraps its snapshot in
/// an `Arc` so fan-out to several subscribers is a refcount bump rather than
/// a deep copy, echoing the pointer-sharing the original payload carried.
#[derive(Debug, Clone)]
pub enum Event {
    LiveDataUpdate(Arc<LiveData>),
    StatusMessage(StatusMessage),
    AlarmRaised(AlarmRaised),
    CvlStateChanged(CvlStateChanged),
    ConfigUpdated(ConfigUpdated),
}

impl Event {
    /// Stable 32-bit id for the event's kind, matching the original
    /// `app_event_id_t` convention of application-specific identifiers.
    pub fn id(&self) -> u32 {
        match self {
            Event::LiveDataUpdate(_) => 0x2000,
            Event::StatusMessage(_) => 0x2001,
            Event::AlarmRaised(_) => 0x2002,
            Event::CvlStateChanged(_) => 0x2003,
            Event::ConfigUpdated(_) => 0x2004,
        }
    }
}
