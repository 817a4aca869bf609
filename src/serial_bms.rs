//! Serial BMS transport: the polling loop and the write-with-readback
//! sequence, built on the [`SerialPort`] collaborator, [`frame`] builders
//! and [`ResponseParser`]. Grounded in `aurora.rs`'s request/response
//! cycle over a half-duplex UART, generalised from Aurora's fixed command
//! set to the poll-all/read/write-single trio this protocol uses.
//!
//! Write-with-readback: flush stale RX, send the write frame, wait for
//! ACK/NACK, then issue a single-register read to confirm the write before
//! reporting success back to the caller.

use std::time::Duration;

use crate::collaborators::SerialPort;
use crate::crc::crc16_modbus;
use crate::error::{Error, Result};
use crate::frame::{self, Opcode, PREAMBLE};
use crate::live_data::LiveData;
use crate::parser::ResponseParser;
use crate::register::REGISTER_TABLE;
use crate::time::Clock;

pub const MIN_POLL_INTERVAL_MS: u64 = 20;
pub const MAX_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const RESPONSE_TIMEOUT_MS: u64 = 500;

/// Owns the RX resync buffer and the parser's running diagnostics.
pub struct SerialBms {
    rx_buffer: Vec<u8>,
    parser: ResponseParser,
    poll_addresses: Vec<u16>,
}

impl Default for SerialBms {
    fn default() -> Self {
        Self {
            rx_buffer: Vec::new(),
            parser: ResponseParser::new(),
            poll_addresses: REGISTER_TABLE.iter().map(|d| d.address).collect(),
        }
    }
}

impl SerialBms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> crate::parser::ParserDiagnostics {
        self.parser.diagnostics
    }

    /// One poll cycle: builds and sends the poll-all request, then drains
    /// RX up to `timeout_ms`, resyncing on preamble until a CRC-valid frame
    /// is extracted or the deadline passes.
    pub fn poll_once(&mut self, port: &mut dyn SerialPort, clock: &dyn Clock, timeout_ms: u64) -> Result<LiveData> {
        let mut request = vec![0u8; 3 + self.poll_addresses.len() * 2 + 2];
        let len = frame::build_poll_all(&mut request, &self.poll_addresses)?;
        port.write_all(&request[..len])?;

        let deadline_ms = clock.now_millis() + timeout_ms;
        match self.read_one_frame(port, clock, deadline_ms) {
            Ok(raw_frame) => {
                let outcome = self.parser.parse(&raw_frame, clock.now_millis());
                outcome
            }
            Err(Error::Timeout(_)) => {
                self.parser.diagnostics.record_timeout();
                Err(Error::Timeout(Duration::from_millis(timeout_ms)))
            }
            Err(e) => Err(e),
        }
    }

    /// Sends the write frame, waits for ACK/NACK, then issues a
    /// single-register read to confirm. On any failure the caller's own
    /// `raw` is still the best-known value; callers typically log and keep
    /// using it.
    pub fn write_register(
        &mut self,
        port: &mut dyn SerialPort,
        clock: &dyn Clock,
        address: u16,
        raw: u16,
        timeout_ms: u64,
    ) -> Result<u16> {
        port.flush_input()?;
        self.rx_buffer.clear();

        let mut write_buf = [0u8; 16];
        let len = frame::build_write_single(&mut write_buf, address, raw)?;
        port.write_all(&write_buf[..len])?;

        let deadline_ms = clock.now_millis() + timeout_ms;
        let ack_frame = self.read_one_frame(port, clock, deadline_ms)?;
        match Opcode::from_byte(ack_frame[1]) {
            Some(Opcode::Ack) => {}
            Some(Opcode::Nack) => {
                let code = ack_frame.get(3).copied().unwrap_or(0);
                return Err(Error::RemoteNack(code));
            }
            Some(other) => return Err(Error::UnexpectedOpcode(other as u8)),
            None => return Err(Error::UnexpectedOpcode(ack_frame[1])),
        }

        let mut read_buf = [0u8; 16];
        let read_len = frame::build_read_single(&mut read_buf, address)?;
        port.write_all(&read_buf[..read_len])?;

        let response_frame = self.read_one_frame(port, clock, deadline_ms)?;
        if Opcode::from_byte(response_frame[1]) != Some(Opcode::ReadSingle) {
            return Err(Error::UnexpectedOpcode(response_frame[1]));
        }
        if response_frame.len() < 5 {
            return Err(Error::InvalidSize { needed: 5, available: response_frame.len() });
        }
        Ok(u16::from_le_bytes([response_frame[3], response_frame[4]]))
    }

    fn read_one_frame(&mut self, port: &mut dyn SerialPort, clock: &dyn Clock, deadline_ms: u64) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 128];
        loop {
            if let Some(frame) = self.try_extract_frame() {
                return Ok(frame);
            }
            if clock.now_millis() >= deadline_ms {
                return Err(Error::Timeout(Duration::from_millis(0)));
            }
            let n = port.read(&mut chunk)?;
            if n > 0 {
                self.rx_buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Slides the buffer to the next `0xAA` byte, and on a CRC mismatch
    /// drops a single byte and searches again, matching the "resynchronises
    /// on preamble" contract rather than discarding the whole buffer.
    fn try_extract_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.rx_buffer.iter().position(|&b| b == PREAMBLE)?;
            if start > 0 {
                self.rx_buffer.drain(..start);
            }
            if self.rx_buffer.len() < 3 {
                return None;
            }
            let payload_len = self.rx_buffer[2] as usize;
            let total_len = 3 + payload_len + 2;
            if self.rx_buffer.len() < total_len {
                return None;
            }

            let candidate = self.rx_buffer[..total_len].to_vec();
            let crc_expected = u16::from_le_bytes([candidate[total_len - 2], candidate[total_len - 1]]);
            let crc_computed = crc16_modbus(&candidate[..total_len - 2]);
            if crc_expected == crc_computed {
                self.rx_buffer.drain(..total_len);
                return Some(candidate);
            }
            self.rx_buffer.drain(..1);
        }
    }
}
