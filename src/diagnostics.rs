//! Aggregated diagnostics surface: one call pulls together the parser's
//! frame counters, the CAN publisher's send/fail counts, the CAN driver's
//! own bus statistics, keepalive health and the running energy counters,
//! so a host application has a single snapshot to log or expose over its
//! own status endpoint.

use crate::can::PublishStats;
use crate::collaborators::CanStats;
use crate::energy::EnergyCounters;
use crate::parser::ParserDiagnostics;

#[derive(Debug, Clone, Copy)]
pub struct GatewayDiagnostics {
    pub parser: ParserDiagnostics,
    pub can_publish: PublishStats,
    pub can_bus: CanStats,
    pub keepalive_ok: bool,
    pub energy: EnergyCounters,
}

impl GatewayDiagnostics {
    /// True once any counter suggests the link or bus needs attention:
    /// parser CRC/header/missing-register errors, publish failures, CAN
    /// bus errors, or a dropped keepalive.
    pub fn is_degraded(&self) -> bool {
        self.parser.crc_errors > 0
            || self.parser.header_errors > 0
            || self.parser.missing_register_errors > 0
            || self.parser.timeout_errors > 0
            || self.can_publish.frames_failed > 0
            || self.can_bus.tx_errors > 0
            || self.can_bus.rx_errors > 0
            || self.can_bus.bus_off_events > 0
            || !self.keepalive_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> GatewayDiagnostics {
        GatewayDiagnostics {
            parser: ParserDiagnostics::default(),
            can_publish: PublishStats::default(),
            can_bus: CanStats::default(),
            keepalive_ok: true,
            energy: EnergyCounters::default(),
        }
    }

    #[test]
    fn healthy_snapshot_is_not_degraded() {
        assert!(!healthy().is_degraded());
    }

    #[test]
    fn a_single_crc_error_marks_the_snapshot_degraded() {
        let mut diag = healthy();
        diag.parser.crc_errors = 1;
        assert!(diag.is_degraded());
    }

    #[test]
    fn lost_keepalive_marks_the_snapshot_degraded() {
        let mut diag = healthy();
        diag.keepalive_ok = false;
        assert!(diag.is_degraded());
    }
}
