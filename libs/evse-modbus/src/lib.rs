//! EVSE Modbus RTU register layer
//!
//! Talks to a charge controller over a serial Modbus RTU link.
//!
//! # Modules
//!
//! - `catalog` - symbolic register names mapped to addresses, widths and access
//! - `codec` - typed values to/from 16-bit words, with the device's word order
//! - `frame` - RTU request/response frames and CRC
//! - `transport` - the transport seam and its serial implementation
//! - `session` - single-link session with retry, reconnect and health check
//! - `keepalive` - periodic heartbeat scheduler
//!
//! # Features
//!
//! - `serial` (default) - `SerialConnector` backed by `tokio-serial`

pub mod catalog;
pub mod codec;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod session;
pub mod transport;

pub use catalog::{Access, DataType, RegisterCatalog, RegisterDescriptor};
pub use codec::RegisterValue;
pub use error::{ChargerError, Result};
pub use session::{ChargerSession, ConnectionState, SessionConfig, SessionEvent};
pub use transport::{
    DeviceMode, ModbusTransport, Parity, RtuTransport, SerialConfig, TransportConnector,
};

#[cfg(feature = "serial")]
pub use transport::SerialConnector;
