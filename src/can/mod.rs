//! CAN publishing side of the gateway: byte-exact PGN encoders, the field
//! mapper that resolves live telemetry into those encoders' inputs, and the
//! publisher that schedules and transmits the result.

pub mod mapper;
pub mod pgn;
pub mod publisher;

pub use mapper::{AlarmThresholds, MappingContext};
pub use publisher::{CanPublisher, ChannelSpec, PublishStats, CHANNEL_CATALOGUE};
