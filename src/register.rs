//! Register descriptor catalogue: static metadata describing every BMS
//! register the gateway knows about, plus the user<->raw conversion the
//! config manager and parser both rely on.

use crate::error::{Error, Result};
use crate::live_data::RegisterValueType;

/// Register access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Ro,
    Wo,
    Rw,
}

/// Register value class, orthogonal to the wire `RegisterValueType` (which
/// only describes word layout): this describes how raw<->user conversion
/// behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Unsigned,
    Signed,
    Float,
    Enum,
}

/// One labelled value of an enum-typed register.
#[derive(Debug, Clone, Copy)]
pub struct EnumOption {
    pub value: i64,
    pub label: &'static str,
}

/// Static metadata for a single register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    pub group: &'static str,
    pub access: Access,
    pub value_class: ValueClass,
    pub wire_type: RegisterValueType,
    pub scale: f64,
    pub offset: f64,
    pub step: f64,
    pub min_raw: i64,
    pub max_raw: i64,
    pub precision: u8,
    pub default_raw: i64,
    pub enum_options: &'static [EnumOption],
}

impl RegisterDescriptor {
    fn word_count(&self) -> u8 {
        match self.wire_type {
            RegisterValueType::U16 | RegisterValueType::I16 | RegisterValueType::I8Pair => 1,
            RegisterValueType::U32 | RegisterValueType::F32 => 2,
        }
    }

    /// Raw -> user conversion: `user = raw * scale + offset`, rounded to
    /// `precision` digits for display purposes.
    pub fn raw_to_user(&self, raw: i64) -> f64 {
        let value = raw as f64 * self.scale + self.offset;
        let factor = 10f64.powi(self.precision as i32);
        (value * factor).round() / factor
    }

    /// User -> raw conversion: enforces enum membership, `scale > 0`,
    /// alignment to `step`, and `[min_raw, max_raw]` bounds.
    pub fn user_to_raw(&self, user: f64) -> Result<i64> {
        if self.scale <= 0.0 {
            return Err(Error::InvalidState("register scale must be > 0"));
        }

        if self.value_class == ValueClass::Enum {
            let raw = user.round() as i64;
            if !self.enum_options.iter().any(|opt| opt.value == raw) {
                return Err(Error::InvalidArg("value is not a member of the enum"));
            }
            return Ok(raw);
        }

        let mut raw = (user - self.offset) / self.scale;
        if self.step > 0.0 {
            let raw_step = self.step / self.scale;
            if raw_step > 0.0 {
                raw = (raw / raw_step).round() * raw_step;
            }
        }
        let raw = raw.round() as i64;

        if raw < self.min_raw || raw > self.max_raw {
            return Err(Error::InvalidArg(
                "converted raw value is outside the register's bounds",
            ));
        }
        Ok(raw)
    }

    /// Snaps `user` to the nearest representable step, for the round-trip
    /// law `raw_to_user(user_to_raw(v)) == aligned(v)`.
    pub fn aligned(&self, user: f64) -> Result<f64> {
        let raw = self.user_to_raw(user)?;
        Ok(self.raw_to_user(raw))
    }

    /// Invariants: `scale > 0` for numeric classes, enum options exhaustive
    /// (non-empty for `Enum`), `min_raw <= default_raw <= max_raw`.
    pub fn check_invariants(&self) -> bool {
        let scale_ok = self.value_class == ValueClass::Enum || self.scale > 0.0;
        let enum_ok = self.value_class != ValueClass::Enum || !self.enum_options.is_empty();
        let bounds_ok = self.min_raw <= self.default_raw && self.default_raw <= self.max_raw;
        scale_ok && enum_ok && bounds_ok
    }
}

/// Per-cell voltage registers (addresses `0x0000..=0x000F`), one per series
/// cell. Declared via a macro to avoid repeating the sixteen near-identical
/// descriptor literals by hand.
macro_rules! cell_mv_register {
    ($name:ident, $address:expr, $key:expr, $label:expr) => {
        const $name: RegisterDescriptor = RegisterDescriptor {
            address: $address,
            key: $key,
            label: $label,
            unit: "mV",
            group: "telemetry",
            access: Access::Ro,
            value_class: ValueClass::Unsigned,
            wire_type: RegisterValueType::U16,
            scale: 1.0,
            offset: 0.0,
            step: 1.0,
            min_raw: 0,
            max_raw: 65535,
            precision: 0,
            default_raw: 0,
            enum_options: &[],
        };
    };
}

cell_mv_register!(CELL_01_MV, 0x0000, "cell_01_mv", "Cell 1 voltage");
cell_mv_register!(CELL_02_MV, 0x0001, "cell_02_mv", "Cell 2 voltage");
cell_mv_register!(CELL_03_MV, 0x0002, "cell_03_mv", "Cell 3 voltage");
cell_mv_register!(CELL_04_MV, 0x0003, "cell_04_mv", "Cell 4 voltage");
cell_mv_register!(CELL_05_MV, 0x0004, "cell_05_mv", "Cell 5 voltage");
cell_mv_register!(CELL_06_MV, 0x0005, "cell_06_mv", "Cell 6 voltage");
cell_mv_register!(CELL_07_MV, 0x0006, "cell_07_mv", "Cell 7 voltage");
cell_mv_register!(CELL_08_MV, 0x0007, "cell_08_mv", "Cell 8 voltage");
cell_mv_register!(CELL_09_MV, 0x0008, "cell_09_mv", "Cell 9 voltage");
cell_mv_register!(CELL_10_MV, 0x0009, "cell_10_mv", "Cell 10 voltage");
cell_mv_register!(CELL_11_MV, 0x000A, "cell_11_mv", "Cell 11 voltage");
cell_mv_register!(CELL_12_MV, 0x000B, "cell_12_mv", "Cell 12 voltage");
cell_mv_register!(CELL_13_MV, 0x000C, "cell_13_mv", "Cell 13 voltage");
cell_mv_register!(CELL_14_MV, 0x000D, "cell_14_mv", "Cell 14 voltage");
cell_mv_register!(CELL_15_MV, 0x000E, "cell_15_mv", "Cell 15 voltage");
cell_mv_register!(CELL_16_MV, 0x000F, "cell_16_mv", "Cell 16 voltage");

/// Static, address-ordered table of every register descriptor the gateway
/// decodes; decoding walks this table in order. Two SoC scalings coexist on
/// the wire (addresses 0x0032 and 0x0034) — both are kept as distinct
/// entries rather than guessed away.
pub static REGISTER_TABLE: &[RegisterDescriptor] = &[
    CELL_01_MV,
    CELL_02_MV,
    CELL_03_MV,
    CELL_04_MV,
    CELL_05_MV,
    CELL_06_MV,
    CELL_07_MV,
    CELL_08_MV,
    CELL_09_MV,
    CELL_10_MV,
    CELL_11_MV,
    CELL_12_MV,
    CELL_13_MV,
    CELL_14_MV,
    CELL_15_MV,
    CELL_16_MV,
    RegisterDescriptor {
        address: 0x0020,
        key: "pack_voltage_v",
        label: "Pack voltage",
        unit: "V",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Float,
        wire_type: RegisterValueType::F32,
        scale: 1.0,
        offset: 0.0,
        step: 0.01,
        min_raw: 0,
        max_raw: 0,
        precision: 3,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0022,
        key: "pack_current_a",
        label: "Pack current",
        unit: "A",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Float,
        wire_type: RegisterValueType::F32,
        scale: 1.0,
        offset: 0.0,
        step: 0.01,
        min_raw: 0,
        max_raw: 0,
        precision: 3,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0024,
        key: "min_cell_mv",
        label: "Minimum cell voltage",
        unit: "mV",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 65535,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0025,
        key: "max_cell_mv",
        label: "Maximum cell voltage",
        unit: "mV",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 65535,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0032,
        key: "state_of_charge_pct",
        label: "State of charge",
        unit: "%",
        group: "telemetry",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U32,
        scale: 0.000001,
        offset: 0.0,
        step: 0.01,
        min_raw: 0,
        max_raw: 100_000_000,
        precision: 2,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0034,
        key: "state_of_charge_pct_alt_scale",
        label: "State of charge (0.002% scaling variant)",
        unit: "%",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U32,
        scale: 0.00002,
        offset: 0.0,
        step: 0.01,
        min_raw: 0,
        max_raw: 5_000_000,
        precision: 2,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0036,
        key: "state_of_health_pct",
        label: "State of health",
        unit: "%",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.01,
        offset: 0.0,
        step: 0.01,
        min_raw: 0,
        max_raw: 10_000,
        precision: 2,
        default_raw: 10_000,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0037,
        key: "average_temperature_c",
        label: "Average temperature",
        unit: "C",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Signed,
        wire_type: RegisterValueType::I16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: -2000,
        max_raw: 2000,
        precision: 1,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0038,
        key: "mosfet_temperature_c",
        label: "MOSFET temperature",
        unit: "C",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Signed,
        wire_type: RegisterValueType::I16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: -2000,
        max_raw: 2000,
        precision: 1,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0039,
        key: "balancing_bits",
        label: "Balancing bitmap",
        unit: "",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 0xFFFF,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x003A,
        key: "alarm_bits",
        label: "Alarm bitmap",
        unit: "",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 0xFFFF,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x003B,
        key: "warning_bits",
        label: "Warning bitmap",
        unit: "",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 0xFFFF,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x003C,
        key: "uptime_seconds",
        label: "Uptime",
        unit: "s",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U32,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: i64::MAX,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x003E,
        key: "cycle_count",
        label: "Cycle count",
        unit: "",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U32,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: i64::MAX,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0042,
        key: "series_cell_count",
        label: "Series cell count",
        unit: "",
        group: "config",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 1,
        max_raw: 16,
        precision: 0,
        default_raw: 16,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0106,
        key: "overvoltage_cutoff_mv",
        label: "Cell overvoltage cutoff",
        unit: "mV",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 2500,
        max_raw: 4500,
        precision: 0,
        default_raw: 3650,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0107,
        key: "undervoltage_cutoff_mv",
        label: "Cell undervoltage cutoff",
        unit: "mV",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 1500,
        max_raw: 3500,
        precision: 0,
        default_raw: 2500,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0108,
        key: "overheat_cutoff_c",
        label: "Overheat cutoff",
        unit: "C",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Signed,
        wire_type: RegisterValueType::I16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 800,
        precision: 1,
        default_raw: 600,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0109,
        key: "low_temp_charge_cutoff_c",
        label: "Low-temperature charge cutoff",
        unit: "C",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Signed,
        wire_type: RegisterValueType::I16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: -200,
        max_raw: 200,
        precision: 1,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x010A,
        key: "charge_overcurrent_limit_a",
        label: "Charge overcurrent limit",
        unit: "A",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 5000,
        precision: 1,
        default_raw: 1000,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x010B,
        key: "discharge_overcurrent_limit_a",
        label: "Discharge overcurrent limit",
        unit: "A",
        group: "safety",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 5000,
        precision: 1,
        default_raw: 1500,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x010C,
        key: "battery_capacity_ah",
        label: "Battery capacity",
        unit: "Ah",
        group: "config",
        access: Access::Rw,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 10_000,
        precision: 1,
        default_raw: 1000,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0110,
        key: "max_charge_current_limit_a",
        label: "Max charge current limit (BMS reported)",
        unit: "A",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 5000,
        precision: 1,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0111,
        key: "max_discharge_current_limit_a",
        label: "Max discharge current limit (BMS reported)",
        unit: "A",
        group: "telemetry",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::U16,
        scale: 0.1,
        offset: 0.0,
        step: 0.1,
        min_raw: 0,
        max_raw: 5000,
        precision: 1,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0120,
        key: "hardware_version",
        label: "Hardware version",
        unit: "",
        group: "identity",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::I8Pair,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 255,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0121,
        key: "firmware_version",
        label: "Firmware version",
        unit: "",
        group: "identity",
        access: Access::Ro,
        value_class: ValueClass::Unsigned,
        wire_type: RegisterValueType::I8Pair,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 255,
        precision: 0,
        default_raw: 0,
        enum_options: &[],
    },
    RegisterDescriptor {
        address: 0x0130,
        key: "online_status",
        label: "Online status",
        unit: "",
        group: "diagnostics",
        access: Access::Ro,
        value_class: ValueClass::Enum,
        wire_type: RegisterValueType::U16,
        scale: 1.0,
        offset: 0.0,
        step: 1.0,
        min_raw: 0,
        max_raw: 3,
        precision: 0,
        default_raw: 0,
        enum_options: &[
            EnumOption { value: 0, label: "charging" },
            EnumOption { value: 1, label: "fully_charged" },
            EnumOption { value: 2, label: "discharging" },
            EnumOption { value: 3, label: "regeneration" },
        ],
    },
];

/// Returns the total number of 16-bit words the table consumes, in address
/// order — used by the poll builder and by the parser's word-walk.
pub fn table_word_count() -> usize {
    REGISTER_TABLE.iter().map(|d| d.word_count() as usize).sum()
}

/// Looks up a descriptor by its stable key (used by
/// `ConfigManager::apply_register_update`).
pub fn find_by_key(key: &str) -> Option<&'static RegisterDescriptor> {
    REGISTER_TABLE.iter().find(|d| d.key == key)
}

/// Looks up a descriptor by wire address.
pub fn find_by_address(address: u16) -> Option<&'static RegisterDescriptor> {
    REGISTER_TABLE.iter().find(|d| d.address == address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_descriptor_satisfies_its_invariants() {
        for descriptor in REGISTER_TABLE {
            assert!(
                descriptor.check_invariants(),
                "descriptor {} failed invariant check",
                descriptor.key
            );
        }
    }

    #[test]
    fn round_trip_law_holds_for_every_rw_register() {
        for descriptor in REGISTER_TABLE {
            if descriptor.access != Access::Rw || descriptor.value_class == ValueClass::Enum {
                continue;
            }
            let sample_raw = (descriptor.min_raw + descriptor.max_raw) / 2;
            let user = descriptor.raw_to_user(sample_raw);
            let aligned = descriptor.aligned(user).unwrap();
            assert!((aligned - user).abs() < 1e-6, "key={}", descriptor.key);
        }
    }

    #[test]
    fn round_trip_law_holds_for_randomly_sampled_raw_values() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for descriptor in REGISTER_TABLE {
            if descriptor.access != Access::Rw || descriptor.value_class == ValueClass::Enum {
                continue;
            }
            for _ in 0..20 {
                let sample_raw = rng.gen_range(descriptor.min_raw..=descriptor.max_raw);
                let user = descriptor.raw_to_user(sample_raw);
                let aligned = descriptor.aligned(user).unwrap();
                assert!(
                    (aligned - user).abs() < 1e-6,
                    "key={} raw={} user={} aligned={}",
                    descriptor.key,
                    sample_raw,
                    user,
                    aligned
                );
            }
        }
    }

    #[test]
    fn enum_register_rejects_non_member_values() {
        let status = find_by_key("online_status").unwrap();
        assert!(status.user_to_raw(0.0).is_ok());
        assert!(status.user_to_raw(99.0).is_err());
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let soh = find_by_key("state_of_health_pct").unwrap();
        assert!(soh.user_to_raw(150.0).is_err());
    }
}
