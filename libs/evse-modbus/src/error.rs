//! Error types for the EVSE register layer

use thiserror::Error;

/// Result type for evse-modbus operations
pub type Result<T> = std::result::Result<T, ChargerError>;

/// Charger communication errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChargerError {
    /// Register name is not part of the catalog
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    /// Read on a write-only register or write on a read-only register
    #[error("Access violation: register '{register}' is not {operation}")]
    AccessViolation {
        register: String,
        operation: &'static str,
    },

    /// Operation attempted while the session is not connected
    #[error("Not connected")]
    NotConnected,

    /// Wire words could not be interpreted as the register's data type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Value cannot be represented in the register's data type
    #[error("Encode error: {0}")]
    Encode(String),

    /// No response within the configured window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Underlying serial handle closed or unusable
    #[error("Port closed: {0}")]
    PortClosed(String),

    /// Other transport I/O errors
    #[error("IO error: {0}")]
    Io(String),

    /// Malformed response frame (CRC, length, echo mismatch)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Modbus exception response from the device
    #[error(
        "Device exception: function 0x{function:02X}, code 0x{code:02X} ({})",
        exception_name(*code)
    )]
    DeviceException { function: u8, code: u8 },

    /// Invalid catalog or connection parameters
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChargerError {
    pub fn decode(msg: impl Into<String>) -> Self {
        ChargerError::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        ChargerError::Encode(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ChargerError::Timeout(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ChargerError::Frame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ChargerError::Config(msg.into())
    }

    /// Whether this error means the link itself is gone.
    ///
    /// Timeouts count as connection loss: on a half-duplex serial bus an
    /// unanswered request leaves the line state unknown.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ChargerError::Timeout(_) | ChargerError::PortClosed(_))
    }

    /// Whether the operation may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChargerError::Timeout(_)
                | ChargerError::PortClosed(_)
                | ChargerError::Io(_)
                | ChargerError::Frame(_)
                | ChargerError::DeviceException { .. }
        )
    }
}

impl From<std::io::Error> for ChargerError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => ChargerError::Timeout(err.to_string()),
            ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset => ChargerError::PortClosed(err.to_string()),
            _ => ChargerError::Io(err.to_string()),
        }
    }
}

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for ChargerError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice => ChargerError::PortClosed(err.to_string()),
            tokio_serial::ErrorKind::InvalidInput => ChargerError::Config(err.to_string()),
            _ => ChargerError::Io(err.to_string()),
        }
    }
}

/// Standard Modbus exception code names
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
