//! Reader for the P1 port of DSMR and other smart electricity meters
//!
//! Bytes from a serial line are assembled into telegrams (ASCII or binary
//! HDLC framing), checked against their CRC and decoded into values that are
//! handed to registered sensors by OBIS code.

pub mod config;
pub mod metering_p1;
pub mod obis_utils;
pub mod sensors;
pub mod transport;
pub mod triggers;

// Re-export common types for easier access
pub use config::Config;
pub use metering_p1::{P1Config, P1Error, P1Reader, P1State};
pub use obis_utils::Obis;
pub use sensors::SensorRegistry;
pub use triggers::P1Event;
