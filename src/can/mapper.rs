//! Field mapper: resolves each channel's payload from live telemetry, the
//! CVL controller's latest outputs and the alarm threshold table, then
//! hands the encoded bytes to the publisher. Keeps the "what goes in byte
//! N" concern (`pgn`) separate from "where does the value come from"
//! (this module), the same split frame builders and the business logic
//! that fills them keep elsewhere in this crate.

use crate::can::pgn;
use crate::cvl::CvlOutputs;
use crate::energy::EnergyCounters;
use crate::live_data::LiveData;

/// Threshold table behind the `alarm_*`/`warn_*` computed functions.
/// Grounded in the "Victron thresholds" section of the configuration model.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct AlarmThresholds {
    pub cell_undervoltage_mv: u16,
    pub cell_overvoltage_mv: u16,
    pub overtemperature_c: f32,
    pub low_temp_charge_c: f32,
    pub imbalance_alarm_mv: u16,
    pub imbalance_warn_mv: u16,
    pub soc_low_pct: f32,
    pub soc_high_pct: f32,
}

/// Everything the mapper needs beyond the raw `LiveData` snapshot: the
/// CVL controller's latest tick, comms health, derating status and the
/// running energy counters.
pub struct MappingContext<'a> {
    pub live_data: &'a LiveData,
    pub cvl: Option<CvlOutputs>,
    pub energy: EnergyCounters,
    pub thresholds: AlarmThresholds,
    pub uart_errors: u64,
    pub can_tx_errors: u64,
    pub keepalive_ok: bool,
    pub derating_active: bool,
    pub manufacturer: &'a str,
    pub battery_name: &'a str,
    pub battery_family: &'a str,
    pub installed_capacity_ah: f32,
}

fn alarm_level(breached: bool) -> u8 {
    if breached {
        2
    } else {
        0
    }
}

impl MappingContext<'_> {
    pub fn cvl_dynamic(&self) -> f32 {
        match self.cvl {
            Some(outputs) => outputs.cvl_v,
            None => self.live_data.pack_voltage_v,
        }
    }

    pub fn ccl_limit(&self) -> f32 {
        match self.cvl {
            Some(outputs) => outputs.ccl_a,
            None => self.live_data.charge_overcurrent_limit_a,
        }
    }

    pub fn dcl_limit(&self) -> f32 {
        match self.cvl {
            Some(outputs) => outputs.dcl_a,
            None => self.live_data.discharge_overcurrent_limit_a,
        }
    }

    pub fn alarm_undervoltage(&self) -> u8 {
        alarm_level(self.live_data.min_cell_mv < self.thresholds.cell_undervoltage_mv)
    }

    pub fn alarm_overvoltage(&self) -> u8 {
        alarm_level(self.live_data.max_cell_mv > self.thresholds.cell_overvoltage_mv)
    }

    pub fn alarm_overtemperature(&self) -> u8 {
        alarm_level(self.live_data.average_temperature_c > self.thresholds.overtemperature_c)
    }

    pub fn alarm_low_temp_charge(&self) -> u8 {
        let charging = self.live_data.pack_current_a > 0.0;
        alarm_level(charging && self.live_data.average_temperature_c < self.thresholds.low_temp_charge_c)
    }

    pub fn alarm_cell_imbalance(&self) -> u8 {
        let imbalance = self.live_data.cell_imbalance_mv;
        if imbalance > self.thresholds.imbalance_alarm_mv {
            2
        } else if imbalance > self.thresholds.imbalance_warn_mv {
            1
        } else {
            0
        }
    }

    pub fn alarm_comms(&self) -> u8 {
        if self.uart_errors > 0 || self.can_tx_errors > 0 || !self.keepalive_ok {
            1
        } else {
            0
        }
    }

    pub fn warn_low_soc(&self) -> u8 {
        u8::from(self.live_data.state_of_charge_pct < self.thresholds.soc_low_pct)
    }

    pub fn warn_derate_high_soc(&self) -> u8 {
        let high_soc = self.live_data.state_of_charge_pct > self.thresholds.soc_high_pct;
        u8::from(high_soc || self.derating_active)
    }

    /// 2 if any `alarm_*` computed function fires, else 1.
    pub fn summary_status(&self) -> u8 {
        let any_alarm = [
            self.alarm_undervoltage(),
            self.alarm_overvoltage(),
            self.alarm_overtemperature(),
            self.alarm_low_temp_charge(),
            self.alarm_cell_imbalance(),
            self.alarm_comms(),
        ]
        .into_iter()
        .any(|level| level > 0);
        if any_alarm {
            2
        } else {
            1
        }
    }

    fn alarm_levels(&self) -> pgn::AlarmLevels {
        let as_level = |raw: u8| match raw {
            0 => pgn::AlarmLevel::Normal,
            1 => pgn::AlarmLevel::Warning,
            _ => pgn::AlarmLevel::Alarm,
        };
        pgn::AlarmLevels {
            undervoltage: as_level(self.alarm_undervoltage()),
            overvoltage: as_level(self.alarm_overvoltage()),
            overtemperature: as_level(self.alarm_overtemperature()),
            low_temp_charge: as_level(self.alarm_low_temp_charge()),
            imbalance: as_level(self.alarm_cell_imbalance()),
            comms: as_level(self.alarm_comms()),
            low_soc: as_level(self.warn_low_soc()),
            derate_high_soc: as_level(self.warn_derate_high_soc()),
            summary: as_level(self.summary_status()),
        }
    }

    /// Encodes every channel's payload for the current snapshot, in
    /// catalogue order.
    pub fn encode_all(&self) -> Vec<(u32, [u8; 8])> {
        vec![
            (pgn::PGN_CVL_LIMITS, pgn::encode_cvl_limits(self.cvl_dynamic(), self.ccl_limit(), self.dcl_limit())),
            (
                pgn::PGN_SOC_SOH,
                pgn::encode_soc_soh(self.live_data.state_of_charge_pct, self.live_data.state_of_health_pct),
            ),
            (
                pgn::PGN_VOLTAGE_CURRENT_TEMP,
                pgn::encode_voltage_current_temp(
                    self.live_data.pack_voltage_v,
                    self.live_data.pack_current_a,
                    self.live_data.average_temperature_c,
                ),
            ),
            (pgn::PGN_ALARMS, pgn::encode_alarms(&self.alarm_levels())),
            (pgn::PGN_MANUFACTURER, pgn::encode_manufacturer(self.manufacturer)),
            (pgn::PGN_BATTERY_INFO, pgn::encode_battery_info(self.battery_name)),
            (pgn::PGN_BMS_NAME_PART2, pgn::encode_bms_name_part2(self.battery_name)),
            (pgn::PGN_ENERGY_COUNTERS, pgn::encode_energy_counters(self.energy.charged_wh, self.energy.discharged_wh)),
            (pgn::PGN_INSTALLED_CAPACITY, pgn::encode_installed_capacity(self.installed_capacity_ah)),
            (pgn::PGN_BATTERY_FAMILY, pgn::encode_battery_family(self.battery_family)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CvlState;

    fn thresholds() -> AlarmThresholds {
        AlarmThresholds {
            cell_undervoltage_mv: 2800,
            cell_overvoltage_mv: 3650,
            overtemperature_c: 55.0,
            low_temp_charge_c: 0.0,
            imbalance_alarm_mv: 200,
            imbalance_warn_mv: 100,
            soc_low_pct: 10.0,
            soc_high_pct: 95.0,
        }
    }

    fn context(live_data: &LiveData) -> MappingContext<'_> {
        MappingContext {
            live_data,
            cvl: None,
            energy: EnergyCounters::default(),
            thresholds: thresholds(),
            uart_errors: 0,
            can_tx_errors: 0,
            keepalive_ok: true,
            derating_active: false,
            manufacturer: "Acme",
            battery_name: "Acme Pack 01",
            battery_family: "LFP16S",
            installed_capacity_ah: 280.0,
        }
    }

    #[test]
    fn cvl_dynamic_falls_back_to_pack_voltage_without_a_controller() {
        let live_data = LiveData { pack_voltage_v: 53.4, ..Default::default() };
        let ctx = context(&live_data);
        assert_eq!(ctx.cvl_dynamic(), 53.4);
    }

    #[test]
    fn cvl_dynamic_prefers_controller_output_when_present() {
        let live_data = LiveData { pack_voltage_v: 53.4, ..Default::default() };
        let mut ctx = context(&live_data);
        ctx.cvl = Some(CvlOutputs {
            state: CvlState::Bulk,
            cvl_v: 58.4,
            ccl_a: 100.0,
            dcl_a: 150.0,
            imbalance_hold_active: false,
            cell_protection_active: false,
        });
        assert_eq!(ctx.cvl_dynamic(), 58.4);
    }

    #[test]
    fn alarm_cell_imbalance_distinguishes_warn_from_alarm() {
        let mut live_data = LiveData { min_cell_mv: 3300, ..Default::default() };
        live_data.max_cell_mv = 3450; // imbalance 150 -> warn
        live_data.recompute_imbalance();
        let ctx = context(&live_data);
        assert_eq!(ctx.alarm_cell_imbalance(), 1);

        live_data.max_cell_mv = 3550; // imbalance 250 -> alarm
        live_data.recompute_imbalance();
        let ctx = context(&live_data);
        assert_eq!(ctx.alarm_cell_imbalance(), 2);
    }

    #[test]
    fn alarm_comms_fires_on_keepalive_loss_even_without_counter_errors() {
        let live_data = LiveData::default();
        let mut ctx = context(&live_data);
        ctx.keepalive_ok = false;
        assert_eq!(ctx.alarm_comms(), 1);
    }

    #[test]
    fn summary_status_reflects_any_fired_alarm() {
        let live_data = LiveData::default();
        let ctx = context(&live_data);
        assert_eq!(ctx.summary_status(), 1);

        let mut hot = LiveData::default();
        hot.average_temperature_c = 80.0;
        let ctx = context(&hot);
        assert_eq!(ctx.summary_status(), 2);
    }

    #[test]
    fn encode_all_produces_one_entry_per_catalogue_pgn() {
        let live_data = LiveData::default();
        let ctx = context(&live_data);
        let frames = ctx.encode_all();
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().any(|(id, _)| *id == pgn::PGN_CVL_LIMITS));
        assert!(frames.iter().any(|(id, _)| *id == pgn::PGN_BATTERY_FAMILY));
    }
}
