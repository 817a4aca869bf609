//! Live-data snapshot: the data model produced by the parser and consumed
//! read-only by every other component.

use heapless::Vec as HVec;

/// Maximum number of raw registers a single poll response can carry. Mirrors
/// `UART_BMS_MAX_REGISTERS` in the original fixed-size C arrays.
pub const MAX_RAW_REGISTERS: usize = 64;

/// Number of cells this gateway supports: 16-cell lithium packs only.
pub const CELL_COUNT: usize = 16;

/// Tag describing how a raw register word (or word pair) should be
/// interpreted when reflected into the raw-register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValueType {
    U16,
    I16,
    U32,
    F32,
    I8Pair,
}

/// One entry of the raw-register snapshot appended during decoding, so that
/// unknown/unmapped addresses are still reflected to the host application.
#[derive(Debug, Clone, Copy)]
pub struct RawRegister {
    pub address: u16,
    pub value_type: RegisterValueType,
    pub raw_value: i64,
    pub word_count: u8,
}

/// Timestamped, immutable record of the live BMS state.
#[derive(Debug, Clone)]
pub struct LiveData {
    pub timestamp_ms: u64,

    pub pack_voltage_v: f32,
    pub pack_current_a: f32,

    pub cell_mv: [u16; CELL_COUNT],
    pub cell_imbalance_mv: u16,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,

    pub state_of_charge_pct: f32,
    pub state_of_health_pct: f32,

    pub average_temperature_c: f32,
    pub auxiliary_temperature_c: f32,
    pub mosfet_temperature_c: f32,

    pub balancing_bits: u16,
    pub alarm_bits: u16,
    pub warning_bits: u16,
    pub online_status: u16,

    pub uptime_seconds: u32,
    pub cycle_count: u32,

    pub battery_capacity_ah: f32,
    pub series_cell_count: u16,

    pub overvoltage_cutoff_mv: u16,
    pub undervoltage_cutoff_mv: u16,
    pub overheat_cutoff_c: f32,
    pub low_temp_charge_cutoff_c: f32,
    pub discharge_overcurrent_limit_a: f32,
    pub charge_overcurrent_limit_a: f32,
    pub max_discharge_current_limit_a: f32,
    pub max_charge_current_limit_a: f32,

    pub hardware_version: u8,
    pub firmware_version: u8,

    pub raw_registers: HVec<RawRegister, MAX_RAW_REGISTERS>,
}

impl Default for LiveData {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            pack_voltage_v: 0.0,
            pack_current_a: 0.0,
            cell_mv: [0; CELL_COUNT],
            cell_imbalance_mv: 0,
            min_cell_mv: 0,
            max_cell_mv: 0,
            state_of_charge_pct: 0.0,
            state_of_health_pct: 0.0,
            average_temperature_c: 0.0,
            auxiliary_temperature_c: 0.0,
            mosfet_temperature_c: 0.0,
            balancing_bits: 0,
            alarm_bits: 0,
            warning_bits: 0,
            online_status: 0,
            uptime_seconds: 0,
            cycle_count: 0,
            battery_capacity_ah: 0.0,
            series_cell_count: 0,
            overvoltage_cutoff_mv: 0,
            undervoltage_cutoff_mv: 0,
            overheat_cutoff_c: 0.0,
            low_temp_charge_cutoff_c: 0.0,
            discharge_overcurrent_limit_a: 0.0,
            charge_overcurrent_limit_a: 0.0,
            max_discharge_current_limit_a: 0.0,
            max_charge_current_limit_a: 0.0,
            hardware_version: 0,
            firmware_version: 0,
            raw_registers: HVec::new(),
        }
    }
}

impl LiveData {
    /// Recomputes the derived imbalance field: `max(max - min, 0)`.
    pub fn recompute_imbalance(&mut self) {
        self.cell_imbalance_mv = self.max_cell_mv.saturating_sub(self.min_cell_mv);
    }

    /// Invariants: `min_cell_mv <= max_cell_mv`, `cell_imbalance_mv == max -
    /// min` and `soc`/`soh` within `[0, 100]`.
    pub fn check_invariants(&self) -> bool {
        self.min_cell_mv <= self.max_cell_mv
            && self.cell_imbalance_mv == self.max_cell_mv.saturating_sub(self.min_cell_mv)
            && (0.0..=100.0).contains(&self.state_of_charge_pct)
            && (0.0..=100.0).contains(&self.state_of_health_pct)
    }

    pub fn push_raw_register(&mut self, entry: RawRegister) -> bool {
        self.raw_registers.push(entry).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_satisfies_invariants() {
        assert!(LiveData::default().check_invariants());
    }

    #[test]
    fn imbalance_recomputed_from_min_max() {
        let mut data = LiveData {
            min_cell_mv: 3150,
            max_cell_mv: 4200,
            ..Default::default()
        };
        data.recompute_imbalance();
        assert_eq!(data.cell_imbalance_mv, 1050);
        assert!(data.check_invariants());
    }
}
