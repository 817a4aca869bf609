//! Core of a serial BMS to inverter-CAN protocol gateway: decodes a
//! battery management system's proprietary/MODBUS-compat serial protocol,
//! derives charge limits through a CVL state machine, and republishes
//! everything as standard inverter-CAN PGNs alongside a JSON-configurable
//! settings layer. No hardware or networking of its own — every external
//! dependency (serial port, CAN bus, persistence, RNG, clock, watchdog) is
//! injected through the traits in [`collaborators`] and [`time`], the same
//! seam discipline the UART/Wi-Fi/MQTT clients elsewhere in this codebase
//! use. Task scheduling is the crate's own: [`orchestrate::GatewayTasks`]
//! spawns the serial-poll, can-publish and cvl-compute tasks around a
//! shared [`GatewayRuntime`].

pub mod bus;
pub mod can;
pub mod collaborators;
pub mod config;
pub mod crc;
pub mod cvl;
pub mod diagnostics;
pub mod energy;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod live_data;
pub mod orchestrate;
pub mod parser;
pub mod register;
pub mod serial_bms;
pub mod time;

pub use collaborators::{CanBus, CanFrame, CanStats, KvStore, Rng, SerialPort, Watchdog};
pub use diagnostics::GatewayDiagnostics;
pub use error::{Error, Result};
pub use live_data::LiveData;
pub use orchestrate::{GatewayRuntime, GatewayStats, GatewayTasks, TaskIntervals};
pub use time::{Clock, MonotonicClock};
