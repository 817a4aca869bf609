//! Response parser: validates and decodes a poll-all-registers response
//! frame into a [`LiveData`] snapshot.

use crate::crc::crc16_modbus;
use crate::error::Error;
use crate::frame::{Opcode, PREAMBLE};
use crate::live_data::{LiveData, RawRegister, RegisterValueType};
use crate::register::REGISTER_TABLE;

const FRAME_HEADER_SIZE: usize = 3; // preamble + opcode + payload length
const CRC_SIZE: usize = 2;

/// Per-component diagnostic counters, invariant: `frames_valid +
/// crc_errors + header_errors + length_errors + missing_register_errors ==
/// frames_total + timeout_errors`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParserDiagnostics {
    pub frames_total: u64,
    pub frames_valid: u64,
    pub crc_errors: u64,
    pub header_errors: u64,
    pub length_errors: u64,
    pub timeout_errors: u64,
    pub missing_register_errors: u64,
}

impl ParserDiagnostics {
    fn record(&mut self, outcome: &Result<LiveData, Error>) {
        self.frames_total += 1;
        match outcome {
            Ok(_) => self.frames_valid += 1,
            Err(Error::InvalidCrc { .. }) => self.crc_errors += 1,
            Err(Error::InvalidHeader(_)) => self.header_errors += 1,
            Err(Error::InvalidSize { .. }) => self.length_errors += 1,
            Err(Error::MissingRegister { .. }) => self.missing_register_errors += 1,
            Err(_) => {}
        }
    }

    pub fn record_timeout(&mut self) {
        self.timeout_errors += 1;
    }
}

/// Stateful parser wrapping the pure decode routine with diagnostic
/// counters, mirroring `UartResponseParser`'s split between a pure decode
/// step and its running counters.
#[derive(Debug, Default)]
pub struct ResponseParser {
    pub diagnostics: ParserDiagnostics,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `parse(frame, now_ms) -> Result<LiveData, ParseError>`.
    pub fn parse(&mut self, frame: &[u8], now_ms: u64) -> Result<LiveData, Error> {
        let outcome = decode_frame(frame, now_ms);
        self.diagnostics.record(&outcome);
        outcome
    }
}

/// Pure decode routine: no side effects beyond computing the snapshot. Kept
/// separate from [`ResponseParser`] so it can be property-tested directly,
/// the same split a pure `encode` and a side-effecting `transmit`/`parse`
/// pair keep elsewhere in this crate.
pub fn decode_frame(frame: &[u8], now_ms: u64) -> Result<LiveData, Error> {
    if frame.len() < FRAME_HEADER_SIZE + CRC_SIZE {
        return Err(Error::InvalidSize {
            needed: FRAME_HEADER_SIZE + CRC_SIZE,
            available: frame.len(),
        });
    }

    if frame[0] != PREAMBLE || frame[1] != Opcode::PollAll as u8 {
        return Err(Error::InvalidHeader("expected preamble 0xAA / opcode 0x09"));
    }

    let payload_len = frame[2] as usize;
    if payload_len % 2 != 0 {
        return Err(Error::InvalidSize {
            needed: payload_len,
            available: payload_len,
        });
    }

    let expected_len = FRAME_HEADER_SIZE + payload_len + CRC_SIZE;
    if frame.len() != expected_len {
        return Err(Error::InvalidSize {
            needed: expected_len,
            available: frame.len(),
        });
    }

    let crc_expected = u16::from_le_bytes([frame[expected_len - 2], frame[expected_len - 1]]);
    let crc_computed = crc16_modbus(&frame[..expected_len - CRC_SIZE]);
    if crc_expected != crc_computed {
        return Err(Error::InvalidCrc {
            expected: crc_expected,
            computed: crc_computed,
        });
    }

    let word_count = payload_len / 2;
    let words: Vec<u16> = (0..word_count)
        .map(|i| u16::from_le_bytes([frame[3 + i * 2], frame[4 + i * 2]]))
        .collect();

    let mut data = LiveData {
        timestamp_ms: now_ms,
        ..Default::default()
    };

    let mut cursor = 0usize;
    let mut cell_index = 0usize;

    for descriptor in REGISTER_TABLE {
        let consumed = match descriptor.wire_type {
            RegisterValueType::U16 | RegisterValueType::I16 | RegisterValueType::I8Pair => 1,
            RegisterValueType::U32 | RegisterValueType::F32 => 2,
        };

        if cursor + consumed > word_count {
            return Err(Error::MissingRegister {
                address: descriptor.address,
            });
        }

        let raw_i64 = apply_register(&mut data, descriptor, &words[cursor..cursor + consumed], &mut cell_index);

        if !data.push_raw_register(RawRegister {
            address: descriptor.address,
            value_type: descriptor.wire_type,
            raw_value: raw_i64,
            word_count: consumed as u8,
        }) {
            return Err(Error::MissingRegister {
                address: descriptor.address,
            });
        }

        cursor += consumed;
    }

    data.recompute_imbalance();
    Ok(data)
}

/// Applies one descriptor's decoded value onto `data`, returning the raw
/// integer form appended to the raw-register snapshot. Matches on the
/// descriptor's stable key, the same role `meta.primary_field` plays in the
/// original C decoder's `switch` statement.
fn apply_register(
    data: &mut LiveData,
    descriptor: &crate::register::RegisterDescriptor,
    words: &[u16],
    cell_index: &mut usize,
) -> i64 {
    use crate::live_data::CELL_COUNT;

    match descriptor.wire_type {
        RegisterValueType::U16 => {
            let raw = words[0];
            let scaled = raw as f64 * descriptor.scale;
            match descriptor.key {
                "min_cell_mv" => data.min_cell_mv = raw,
                "max_cell_mv" => data.max_cell_mv = raw,
                "state_of_health_pct" => data.state_of_health_pct = scaled as f32,
                "balancing_bits" => data.balancing_bits = raw,
                "alarm_bits" => data.alarm_bits = raw,
                "warning_bits" => data.warning_bits = raw,
                "series_cell_count" => data.series_cell_count = raw,
                "overvoltage_cutoff_mv" => data.overvoltage_cutoff_mv = raw,
                "undervoltage_cutoff_mv" => data.undervoltage_cutoff_mv = raw,
                "charge_overcurrent_limit_a" => data.charge_overcurrent_limit_a = scaled as f32,
                "discharge_overcurrent_limit_a" => {
                    data.discharge_overcurrent_limit_a = scaled as f32
                }
                "battery_capacity_ah" => data.battery_capacity_ah = scaled as f32,
                "max_charge_current_limit_a" => data.max_charge_current_limit_a = scaled as f32,
                "max_discharge_current_limit_a" => {
                    data.max_discharge_current_limit_a = scaled as f32
                }
                "online_status" => data.online_status = raw,
                key if key.starts_with("cell_") && *cell_index < CELL_COUNT => {
                    data.cell_mv[*cell_index] = raw;
                    *cell_index += 1;
                }
                _ => {}
            }
            raw as i64
        }
        RegisterValueType::I16 => {
            let raw = words[0] as i16;
            let scaled = raw as f64 * descriptor.scale;
            match descriptor.key {
                "average_temperature_c" => data.average_temperature_c = scaled as f32,
                "mosfet_temperature_c" => data.mosfet_temperature_c = scaled as f32,
                "overheat_cutoff_c" => data.overheat_cutoff_c = scaled as f32,
                "low_temp_charge_cutoff_c" => data.low_temp_charge_cutoff_c = scaled as f32,
                _ => {}
            }
            raw as i64
        }
        RegisterValueType::U32 => {
            let raw = words[0] as u32 | ((words[1] as u32) << 16);
            let scaled = raw as f64 * descriptor.scale;
            match descriptor.key {
                "state_of_charge_pct" => data.state_of_charge_pct = scaled as f32,
                "uptime_seconds" => data.uptime_seconds = raw,
                "cycle_count" => data.cycle_count = raw,
                _ => {}
            }
            raw as i64
        }
        RegisterValueType::F32 => {
            let raw_bits = words[0] as u32 | ((words[1] as u32) << 16);
            let value = f32::from_bits(raw_bits) * descriptor.scale as f32;
            match descriptor.key {
                "pack_voltage_v" => data.pack_voltage_v = value,
                "pack_current_a" => data.pack_current_a = value,
                _ => {}
            }
            raw_bits as i64
        }
        RegisterValueType::I8Pair => {
            let low = (words[0] & 0xFF) as u8;
            match descriptor.key {
                "hardware_version" => data.hardware_version = low,
                "firmware_version" => data.firmware_version = low,
                _ => {}
            }
            low as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_response_frame(words: &[u16]) -> Vec<u8> {
        let payload_len = words.len() * 2;
        let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload_len + CRC_SIZE];
        frame[0] = PREAMBLE;
        frame[1] = Opcode::PollAll as u8;
        frame[2] = payload_len as u8;
        for (i, w) in words.iter().enumerate() {
            let bytes = w.to_le_bytes();
            frame[3 + i * 2] = bytes[0];
            frame[4 + i * 2] = bytes[1];
        }
        let crc = crc16_modbus(&frame[..frame.len() - CRC_SIZE]);
        let len = frame.len();
        frame[len - 2..].copy_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Builds a register response walking `REGISTER_TABLE` in order,
    /// overriding a handful of keys with realistic values and leaving the
    /// rest at their descriptor default, so the frame always matches the
    /// table's actual word count.
    fn scenario_one_frame() -> Vec<u8> {
        let mut words = Vec::new();

        for descriptor in REGISTER_TABLE {
            match descriptor.key {
                "pack_voltage_v" => {
                    let bits = 51.350f32.to_bits();
                    words.push((bits & 0xFFFF) as u16);
                    words.push((bits >> 16) as u16);
                }
                "pack_current_a" => {
                    let bits = (-12.3f32).to_bits();
                    words.push((bits & 0xFFFF) as u16);
                    words.push((bits >> 16) as u16);
                }
                "min_cell_mv" => words.push(3280),
                "max_cell_mv" => words.push(3296),
                "state_of_charge_pct" => {
                    let raw: u32 = 75_640_000; // 0.000001 scale -> 75.64%
                    words.push((raw & 0xFFFF) as u16);
                    words.push((raw >> 16) as u16);
                }
                "state_of_charge_pct_alt_scale" => {
                    let raw: u32 = (75.64 / 0.00002) as u32;
                    words.push((raw & 0xFFFF) as u16);
                    words.push((raw >> 16) as u16);
                }
                "state_of_health_pct" => words.push(9500), // 0.01 scale -> 95.00
                "average_temperature_c" => words.push(255), // 0.1 scale -> 25.5
                "mosfet_temperature_c" => words.push((-30i16) as u16), // -3.0
                "balancing_bits" => words.push(0x0003),
                "alarm_bits" => words.push(0x1000),
                "warning_bits" => words.push(0x0001),
                "uptime_seconds" => {
                    let raw: u32 = 123_456;
                    words.push((raw & 0xFFFF) as u16);
                    words.push((raw >> 16) as u16);
                }
                "cycle_count" => {
                    let raw: u32 = 321;
                    words.push((raw & 0xFFFF) as u16);
                    words.push((raw >> 16) as u16);
                }
                key if key.starts_with("cell_") => {
                    let index: u16 = key[5..7].parse().unwrap();
                    words.push(3280 + index - 1);
                }
                _ => {
                    // Leave every other register at its descriptor default.
                    let words_needed = match descriptor.wire_type {
                        RegisterValueType::U16
                        | RegisterValueType::I16
                        | RegisterValueType::I8Pair => 1,
                        RegisterValueType::U32 | RegisterValueType::F32 => 2,
                    };
                    let raw = descriptor.default_raw as u32;
                    words.push((raw & 0xFFFF) as u16);
                    if words_needed == 2 {
                        words.push((raw >> 16) as u16);
                    }
                }
            }
        }

        build_response_frame(&words)
    }

    #[test]
    fn parses_well_formed_register_frame() {
        let frame = scenario_one_frame();
        let word_count = crate::register::table_word_count();
        assert_eq!(frame.len(), 3 + word_count * 2 + 2);

        let mut parser = ResponseParser::new();
        let data = parser.parse(&frame, 1_000).expect("valid frame");

        assert_eq!(parser.diagnostics.frames_valid, 1);
        assert_eq!(parser.diagnostics.frames_total, 1);
        assert_eq!(parser.diagnostics.crc_errors, 0);

        assert!((data.pack_voltage_v - 51.350).abs() < 0.001);
        assert!((data.pack_current_a - (-12.3)).abs() < 0.001);
        assert!((data.state_of_charge_pct - 75.64).abs() < 0.01);
        assert_eq!(data.raw_registers.len(), REGISTER_TABLE.len());
        assert!(data.check_invariants());
    }

    #[test]
    fn rejects_bad_crc_and_counts_it() {
        let mut frame = scenario_one_frame();
        let len = frame.len();
        frame[len - 1] ^= 0xFF;

        let mut parser = ResponseParser::new();
        let err = parser.parse(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidCrc { .. }));
        assert_eq!(parser.diagnostics.crc_errors, 1);
        assert_eq!(parser.diagnostics.frames_valid, 0);
        assert_eq!(parser.diagnostics.frames_total, 1);
    }

    #[test]
    fn rejects_wrong_opcode() {
        let mut frame = scenario_one_frame();
        frame[1] = 0x03;
        let mut parser = ResponseParser::new();
        let err = parser.parse(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
        assert_eq!(parser.diagnostics.header_errors, 1);
    }

    #[test]
    fn rejects_odd_payload_length() {
        let mut frame = scenario_one_frame();
        frame[2] = 3; // odd length, frame left otherwise unmodified
        let mut parser = ResponseParser::new();
        let err = parser.parse(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidSize { .. }));
    }

    #[test]
    fn rejects_truncated_frame_as_missing_register() {
        let frame = build_response_frame(&[1, 2]); // far fewer words than the table needs
        let mut parser = ResponseParser::new();
        let err = parser.parse(&frame, 0).unwrap_err();
        assert!(matches!(err, Error::MissingRegister { .. }));
        assert_eq!(parser.diagnostics.missing_register_errors, 1);
    }

    #[test]
    fn diagnostics_accounting_invariant_holds_across_mixed_frames() {
        let mut parser = ResponseParser::new();
        let good = scenario_one_frame();
        let mut bad = good.clone();
        let len = bad.len();
        bad[len - 1] ^= 0xFF;

        parser.parse(&good, 0).unwrap();
        parser.parse(&bad, 0).unwrap_err();
        parser.diagnostics.record_timeout();

        let d = parser.diagnostics;
        assert_eq!(
            d.frames_valid + d.crc_errors + d.header_errors + d.length_errors + d.missing_register_errors,
            d.frames_total
        );
        assert_eq!(d.timeout_errors, 1);
    }
}
