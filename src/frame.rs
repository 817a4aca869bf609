//! Wire framing for both dialects that share the serial link.
//!
//! Frames are `AA <OP> <PL_LEN> <payload...> <CRC_LO> <CRC_HI>`, CRC being
//! CRC-16/MODBUS over every byte preceding it. The proprietary dialect
//! (opcodes 0x07/0x09/0x0D/0x11) is little-endian; the MODBUS-compat dialect
//! (0x03/0x10) is big-endian, matching `solax_x1_air.rs`'s use of
//! `byteorder::BigEndian` for its own Modbus-flavoured link.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const PREAMBLE: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReadSingle = 0x07,
    PollAll = 0x09,
    WriteSingle = 0x0D,
    ReadEvents = 0x11,
    ModbusReadHolding = 0x03,
    ModbusWriteMultiple = 0x10,
    Ack = 0x01,
    Nack = 0x81,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0x07 => Opcode::ReadSingle,
            0x09 => Opcode::PollAll,
            0x0D => Opcode::WriteSingle,
            0x11 => Opcode::ReadEvents,
            0x03 => Opcode::ModbusReadHolding,
            0x10 => Opcode::ModbusWriteMultiple,
            0x01 => Opcode::Ack,
            0x81 => Opcode::Nack,
            _ => return None,
        })
    }
}

fn require_capacity(buffer_len: usize, needed: usize) -> Result<()> {
    if buffer_len < needed {
        Err(Error::InvalidSize {
            needed,
            available: buffer_len,
        })
    } else {
        Ok(())
    }
}

/// Appends the CRC to `buffer[..body_len]` and returns the total frame
/// length (`body_len + 2`).
fn finish_with_crc(buffer: &mut [u8], body_len: usize) -> usize {
    let crc = crate::crc::crc16_modbus(&buffer[..body_len]);
    buffer[body_len..body_len + 2].copy_from_slice(&crc.to_le_bytes());
    body_len + 2
}

/// *poll-all-registers* (opcode 0x09): payload = concatenated register
/// addresses, little-endian.
pub fn build_poll_all(buffer: &mut [u8], addresses: &[u16]) -> Result<usize> {
    let payload_len = addresses.len() * 2;
    let total = 3 + payload_len + 2;
    require_capacity(buffer.len(), total)?;

    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::PollAll as u8;
    buffer[2] = payload_len as u8;
    for (i, addr) in addresses.iter().enumerate() {
        LittleEndian::write_u16(&mut buffer[3 + i * 2..5 + i * 2], *addr);
    }
    Ok(finish_with_crc(buffer, 3 + payload_len))
}

/// *read-single-register* (opcode 0x07): payload = address, little-endian.
pub fn build_read_single(buffer: &mut [u8], address: u16) -> Result<usize> {
    let total = 3 + 2 + 2;
    require_capacity(buffer.len(), total)?;
    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::ReadSingle as u8;
    buffer[2] = 2;
    LittleEndian::write_u16(&mut buffer[3..5], address);
    Ok(finish_with_crc(buffer, 5))
}

/// *write-single-register* (opcode 0x0D): payload = address + value,
/// little-endian.
pub fn build_write_single(buffer: &mut [u8], address: u16, value: u16) -> Result<usize> {
    let total = 3 + 4 + 2;
    require_capacity(buffer.len(), total)?;
    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::WriteSingle as u8;
    buffer[2] = 4;
    LittleEndian::write_u16(&mut buffer[3..5], address);
    LittleEndian::write_u16(&mut buffer[5..7], value);
    Ok(finish_with_crc(buffer, 7))
}

/// *read-events* (opcode 0x11): no payload beyond the header.
pub fn build_read_events(buffer: &mut [u8]) -> Result<usize> {
    let total = 3 + 2;
    require_capacity(buffer.len(), total)?;
    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::ReadEvents as u8;
    buffer[2] = 0;
    Ok(finish_with_crc(buffer, 3))
}

/// *modbus-read-holding* (opcode 0x03): payload = address + count,
/// big-endian, `count` in `[1, 127]`.
pub fn build_modbus_read_holding(buffer: &mut [u8], address: u16, count: u16) -> Result<usize> {
    if !(1..=127).contains(&count) {
        return Err(Error::InvalidArg("modbus read count out of [1, 127]"));
    }
    let total = 3 + 4 + 2;
    require_capacity(buffer.len(), total)?;
    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::ModbusReadHolding as u8;
    buffer[2] = 4;
    BigEndian::write_u16(&mut buffer[3..5], address);
    BigEndian::write_u16(&mut buffer[5..7], count);
    Ok(finish_with_crc(buffer, 7))
}

/// *modbus-write-multiple* (opcode 0x10): payload = address + count +
/// byte-length + values, big-endian, `count` in `[1, 100]`.
pub fn build_modbus_write_multiple(
    buffer: &mut [u8],
    address: u16,
    values: &[u16],
) -> Result<usize> {
    let count = values.len();
    if !(1..=100).contains(&count) {
        return Err(Error::InvalidArg("modbus write count out of [1, 100]"));
    }
    let byte_len = count * 2;
    let payload_len = 5 + byte_len;
    let total = 3 + payload_len + 2;
    require_capacity(buffer.len(), total)?;

    buffer[0] = PREAMBLE;
    buffer[1] = Opcode::ModbusWriteMultiple as u8;
    buffer[2] = payload_len as u8;
    BigEndian::write_u16(&mut buffer[3..5], address);
    BigEndian::write_u16(&mut buffer[5..7], count as u16);
    buffer[7] = byte_len as u8;
    for (i, value) in values.iter().enumerate() {
        BigEndian::write_u16(&mut buffer[8 + i * 2..10 + i * 2], *value);
    }
    Ok(finish_with_crc(buffer, 3 + payload_len))
}
