//! Bidirectional CAN keepalive: transmits PGN 0x305 on its own cadence and
//! tracks RX freshness of the same PGN, publishing edge triggered
//! status/alarm events. Grounded in the original periodic task idiom
//! (`events.rs`'s `periodic_inverter_event`) generalised from a single poll
//! to a TX/RX pair.

use crate::bus::{AlarmCode, AlarmRaised, Event, EventBus, EventSource, Severity, StatusMessage};
use crate::collaborators::{CanBus, CanFrame};

pub const KEEPALIVE_PGN: u32 = 0x305;
const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 1000;
const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 10_000;

/// TX/RX heartbeat state machine.
pub struct KeepaliveMonitor {
    keepalive_interval_ms: u64,
    keepalive_timeout_ms: u64,
    next_tx_ms: u64,
    last_rx_ms: Option<u64>,
    ok: bool,
}

impl Default for KeepaliveMonitor {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            next_tx_ms: 0,
            last_rx_ms: None,
            ok: false,
        }
    }
}

impl KeepaliveMonitor {
    pub fn new(keepalive_interval_ms: u64, keepalive_timeout_ms: u64) -> Self {
        Self {
            keepalive_interval_ms,
            keepalive_timeout_ms,
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Transmits PGN 0x305 if its deadline has passed.
    pub fn tick_tx(&mut self, can: &mut dyn CanBus, now_ms: u64) {
        if now_ms < self.next_tx_ms {
            return;
        }
        let frame = CanFrame::new(KEEPALIVE_PGN, &[0x00]);
        let _ = can.transmit(&frame);
        self.next_tx_ms = now_ms + self.keepalive_interval_ms;
    }

    /// Records an observed RX frame's id, refreshing freshness when it
    /// matches the keepalive PGN.
    pub fn note_rx_frame(&mut self, id: u32, now_ms: u64) {
        if id == KEEPALIVE_PGN {
            self.last_rx_ms = Some(now_ms);
        }
    }

    /// Re-evaluates OK/LOST and returns the edge-triggered event, if any.
    /// Transitions are edge-triggered: sustained OK or sustained LOST emits
    /// nothing.
    pub fn evaluate(&mut self, now_ms: u64) -> Option<Event> {
        let fresh = match self.last_rx_ms {
            Some(last_rx) => now_ms.saturating_sub(last_rx) <= self.keepalive_timeout_ms,
            None => false,
        };

        if fresh && !self.ok {
            self.ok = true;
            Some(Event::StatusMessage(StatusMessage {
                level: Severity::Info,
                source: EventSource::Can,
                text: "VE.Can keepalive OK".to_string(),
            }))
        } else if !fresh && self.ok {
            self.ok = false;
            Some(Event::AlarmRaised(AlarmRaised {
                code: AlarmCode::CanKeepAliveLost,
                severity: Severity::Warning,
                message: "VE.Can keepalive lost".to_string(),
                value: 0.0,
                is_active: true,
            }))
        } else {
            None
        }
    }

    /// Convenience combining tick_tx + evaluate, publishing onto `bus`.
    pub fn tick(&mut self, can: &mut dyn CanBus, bus: &EventBus, now_ms: u64) {
        self.tick_tx(can, now_ms);
        if let Some(event) = self.evaluate(now_ms) {
            bus.publish(event, std::time::Duration::from_millis(50));
        }
    }
}
