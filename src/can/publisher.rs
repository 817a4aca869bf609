//! CAN publisher: holds the static channel catalogue, schedules periodic
//! transmissions against per-channel deadlines and keeps the last prepared
//! frame for channels whose source data has not changed since the previous
//! tick. Immediate publishing (emit-on-snapshot) is just `publish_all`
//! called once per new `LiveData`.

use crate::bus::{AlarmCode, AlarmRaised, Event, EventBus, EventSource, Severity};
use crate::can::mapper::MappingContext;
use crate::collaborators::{CanBus, CanFrame};

/// One row of the static channel catalogue: a PGN, its dlc and how often
/// it should be re-sent in periodic mode. `period_ms = 0` means "use the
/// publisher's global default period".
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub pgn: u32,
    pub dlc: u8,
    pub period_ms: u64,
    pub description: &'static str,
}

pub const CHANNEL_CATALOGUE: &[ChannelSpec] = &[
    ChannelSpec { pgn: 0x351, dlc: 8, period_ms: 0, description: "CVL/CCL/DCL limits" },
    ChannelSpec { pgn: 0x355, dlc: 8, period_ms: 0, description: "State of charge / state of health" },
    ChannelSpec { pgn: 0x356, dlc: 8, period_ms: 0, description: "Pack voltage/current/temperature" },
    ChannelSpec { pgn: 0x35A, dlc: 8, period_ms: 0, description: "Alarms and warnings" },
    ChannelSpec { pgn: 0x35E, dlc: 8, period_ms: 60_000, description: "Manufacturer name" },
    ChannelSpec { pgn: 0x35F, dlc: 8, period_ms: 60_000, description: "Battery info, name part 1" },
    ChannelSpec { pgn: 0x371, dlc: 8, period_ms: 60_000, description: "Battery name, part 2" },
    ChannelSpec { pgn: 0x378, dlc: 8, period_ms: 0, description: "Energy counters" },
    ChannelSpec { pgn: 0x379, dlc: 8, period_ms: 60_000, description: "Installed capacity" },
    ChannelSpec { pgn: 0x382, dlc: 8, period_ms: 60_000, description: "Battery family" },
];

const DEFAULT_PERIOD_MS: u64 = 1_000;

/// Per-channel scheduling + last-known-good payload state.
struct ChannelState {
    spec: ChannelSpec,
    next_deadline_ms: u64,
    last_frame: Option<[u8; 8]>,
}

/// Cumulative publish attempt counters, distinct from the lower-level
/// [`crate::collaborators::CanStats`] the driver itself reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishStats {
    pub frames_sent: u64,
    pub frames_failed: u64,
}

pub struct CanPublisher {
    channels: Vec<ChannelState>,
    default_period_ms: u64,
    stats: PublishStats,
}

impl CanPublisher {
    pub fn new(default_period_ms: u64) -> Self {
        Self::with_catalogue(CHANNEL_CATALOGUE, default_period_ms)
    }

    pub fn with_catalogue(catalogue: &[ChannelSpec], default_period_ms: u64) -> Self {
        let channels = catalogue
            .iter()
            .map(|spec| ChannelState { spec: *spec, next_deadline_ms: 0, last_frame: None })
            .collect();
        Self {
            channels,
            default_period_ms: if default_period_ms == 0 { DEFAULT_PERIOD_MS } else { default_period_ms },
            stats: PublishStats::default(),
        }
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    fn period_for(&self, spec: &ChannelSpec) -> u64 {
        if spec.period_ms == 0 {
            self.default_period_ms
        } else {
            spec.period_ms
        }
    }

    fn transmit(&mut self, can: &mut dyn CanBus, bus: &EventBus, pgn: u32, frame: &[u8; 8], dlc: u8) {
        let can_frame = CanFrame::new(pgn, &frame[..dlc as usize]);
        match can.transmit(&can_frame) {
            Ok(()) => self.stats.frames_sent += 1,
            Err(_) => {
                self.stats.frames_failed += 1;
                bus.publish(
                    Event::AlarmRaised(AlarmRaised {
                        code: AlarmCode::CanTxError,
                        severity: Severity::Warning,
                        message: format!("CAN TX failed for PGN 0x{pgn:03X}"),
                        value: pgn as f32,
                        is_active: true,
                    }),
                    std::time::Duration::from_millis(50),
                );
            }
        }
    }

    /// Immediate mode: encodes and transmits every channel right now,
    /// regardless of its periodic deadline, and seeds `last_frame` so a
    /// subsequent periodic tick can re-emit it if no fresher data arrives.
    pub fn publish_all(&mut self, can: &mut dyn CanBus, bus: &EventBus, ctx: &MappingContext) {
        let frames = ctx.encode_all();
        for (pgn, bytes) in frames {
            if let Some(channel) = self.channels.iter_mut().find(|c| c.spec.pgn == pgn) {
                channel.last_frame = Some(bytes);
                self.transmit_stored(can, bus, pgn);
            }
        }
    }

    fn transmit_stored(&mut self, can: &mut dyn CanBus, bus: &EventBus, pgn: u32) {
        let (frame, dlc) = {
            let channel = self.channels.iter().find(|c| c.spec.pgn == pgn).expect("known pgn");
            match channel.last_frame {
                Some(frame) => (frame, channel.spec.dlc),
                None => return,
            }
        };
        self.transmit(can, bus, pgn, &frame, dlc);
    }

    /// Periodic mode: encodes the current context once, stores each
    /// channel's latest frame, then transmits only the channels whose
    /// deadline has passed. Channels without a prepared frame advance their
    /// deadline without transmitting, so missing data never causes a spin.
    /// Returns the number of milliseconds to sleep before the next wake.
    pub fn tick(&mut self, can: &mut dyn CanBus, bus: &EventBus, ctx: &MappingContext, now_ms: u64) -> u64 {
        for (pgn, bytes) in ctx.encode_all() {
            if let Some(channel) = self.channels.iter_mut().find(|c| c.spec.pgn == pgn) {
                channel.last_frame = Some(bytes);
            }
        }

        let mut pgns_due = Vec::new();
        for channel in &mut self.channels {
            if channel.next_deadline_ms <= now_ms {
                if channel.last_frame.is_some() {
                    pgns_due.push(channel.spec.pgn);
                }
                let period = if channel.spec.period_ms == 0 { self.default_period_ms } else { channel.spec.period_ms };
                channel.next_deadline_ms = now_ms + period;
            }
        }

        for pgn in pgns_due {
            self.transmit_stored(can, bus, pgn);
        }

        self.channels
            .iter()
            .map(|c| c.next_deadline_ms.saturating_sub(now_ms))
            .min()
            .unwrap_or(self.default_period_ms)
            .max(1)
    }
}
