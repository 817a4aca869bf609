//! Collaborator traits at the gateway's external seams: serial I/O, CAN TX,
//! key-value persistence and randomness are injected rather than reached
//! for as globals, so the core types can be exercised with in-memory
//! doubles instead of real hardware.

use crate::error::Result;

/// Half-duplex serial link to the BMS. Mirrors `embedded_hal::serial::{Read,
/// Write}` (the UART abstraction `aurora.rs` builds on), collapsed into a
/// blocking, buffer-oriented interface more convenient for framing code
/// that already owns its own byte buffers.
pub trait SerialPort: Send {
    /// Writes the whole of `data`, blocking until accepted by the driver.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Reads at most `buffer.len()` bytes, returning how many were read.
    /// A return of `0` means no bytes were available within the port's own
    /// read timeout, not end-of-stream.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Discards any buffered but unread input.
    fn flush_input(&mut self) -> Result<()>;
}

/// A single outgoing CAN frame (classic CAN, up to 8 data bytes).
#[derive(Debug, Clone, Copy)]
pub struct CanFrame {
    pub id: u32,
    pub len: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        Self { id, len: len as u8, data: buf }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Cumulative transmit/receive statistics pulled from the CAN driver after
/// every attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanStats {
    pub tx_success: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub bus_off_events: u64,
    pub rx_dropped: u64,
}

/// CAN bus transmit + receive-presence surface used by the publisher and
/// the keepalive monitor.
pub trait CanBus: Send {
    fn transmit(&mut self, frame: &CanFrame) -> Result<()>;

    /// Non-blocking receive: `Ok(None)` when nothing is pending.
    fn try_receive(&mut self) -> Result<Option<CanFrame>>;

    fn stats(&self) -> CanStats;
}

/// Small persistence surface for energy counters and configuration,
/// grounded in the original `storage/` module's key-addressed NVS access.
pub trait KvStore: Send {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// Cryptographic randomness for AP-secret generation. Kept as a trait
/// rather than calling `rand` directly so the config manager's tests can
/// inject a deterministic source.
pub trait Rng: Send {
    fn fill_bytes(&mut self, buffer: &mut [u8]);
}

/// Hardware watchdog timer. Fed periodically by the task orchestrator so a
/// wedged task (a stuck UART read, a hung CAN transmit) reboots the device
/// instead of leaving the gateway silently unresponsive.
pub trait Watchdog: Send {
    fn feed(&mut self);
}
