//! CRC-16/MODBUS as used by both wire dialects: polynomial 0xA001, initial
//! value 0xFFFF, reflected, no final XOR.

/// Compute CRC-16/MODBUS over `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Verify that `frame[..frame.len() - 2]` produces the little-endian CRC
/// stored in the trailing two bytes.
pub fn verify_trailing_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let body = &frame[..frame.len() - 2];
    let expected = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    crc16_modbus(body) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_empty_slice_is_initial_value_complemented() {
        // Reflects the well known CRC16/MODBUS all-zero-length identity.
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[test]
    fn crc_round_trips_through_trailing_bytes() {
        let mut frame = vec![0xAA, 0x09, 0x02, 0x34, 0x12];
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(verify_trailing_crc(&frame));
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(!verify_trailing_crc(&frame));
    }

    #[test]
    fn known_vector_matches_modbus_crc16() {
        // 0x01 0x03 0x00 0x00 0x00 0x0A -> CRC 0xC5CD (well known Modbus RTU vector)
        let data = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16_modbus(&data), 0xCDC5);
    }
}
