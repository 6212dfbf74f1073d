//! Transport seam between the session and the serial line
//!
//! [`ModbusTransport`] is a single open link that performs one request/response
//! exchange at a time. [`TransportConnector`] opens fresh links; the session
//! calls it on connect and on every reconnect attempt.

use async_trait::async_trait;
use common::hex::Hex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::{ChargerError, Result};
use crate::frame::{Request, RESPONSE_HEADER_LEN};

/// One open Modbus link
#[async_trait]
pub trait ModbusTransport: Send {
    /// FC 0x03
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// FC 0x06
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;

    /// FC 0x10
    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()>;

    /// Release the underlying handle. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for transports
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ModbusTransport>>;

    /// Human readable endpoint, used in logs
    fn endpoint(&self) -> String;
}

/// RTU framing over any byte stream
///
/// Responses are read with exact lengths derived from the function code, so
/// no inter-character silence detection is needed.
pub struct RtuTransport<S> {
    stream: S,
    unit_id: u8,
    closed: bool,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, unit_id: u8) -> Self {
        Self {
            stream,
            unit_id,
            closed: false,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    async fn exchange(&mut self, request: Request) -> Result<Vec<u16>> {
        if self.closed {
            return Err(ChargerError::PortClosed("transport closed".to_string()));
        }

        let frame = request.to_frame(self.unit_id)?;
        trace!("RTU TX: {}", Hex(&frame));
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        debug!("RTU TX: {}B", frame.len());

        let mut header = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        let remaining = request.remaining_len(&header);
        let mut response = Vec::with_capacity(RESPONSE_HEADER_LEN + remaining);
        response.extend_from_slice(&header);
        response.resize(RESPONSE_HEADER_LEN + remaining, 0);
        self.stream
            .read_exact(&mut response[RESPONSE_HEADER_LEN..])
            .await?;

        trace!("RTU RX: {}", Hex(&response));
        debug!("RTU RX: {}B", response.len());

        request.parse_response(self.unit_id, &response)
    }
}

#[async_trait]
impl<S> ModbusTransport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.exchange(Request::ReadHolding { address, count }).await
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.exchange(Request::WriteSingle { address, value })
            .await
            .map(|_| ())
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        self.exchange(Request::WriteMultiple {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            warn!("RTU close: {}", e);
        }
        Ok(())
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// How the controller is addressed on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Controller wired directly, unit id 1
    #[default]
    Direct,
    /// Controller behind a satellite/load-management master, unit id 50
    Satellite,
}

impl DeviceMode {
    pub fn unit_id(self) -> u8 {
        match self {
            DeviceMode::Direct => 1,
            DeviceMode::Satellite => 50,
        }
    }
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub mode: DeviceMode,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            parity: Parity::None,
            stop_bits: 2,
            mode: DeviceMode::Direct,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(ChargerError::config("serial port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(ChargerError::config("baud rate must be positive"));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ChargerError::config(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

/// Opens [`RtuTransport`]s on a local serial port, 8 data bits
#[cfg(feature = "serial")]
pub struct SerialConnector {
    config: SerialConfig,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    pub fn new(config: SerialConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl TransportConnector for SerialConnector {
    async fn open(&self) -> Result<Box<dyn ModbusTransport>> {
        use tokio_serial::SerialPortBuilderExt;

        let cfg = &self.config;
        let parity = match cfg.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match cfg.stop_bits {
            1 => tokio_serial::StopBits::One,
            _ => tokio_serial::StopBits::Two,
        };

        debug!("RTU: {} @{}baud", cfg.port, cfg.baud_rate);
        let port = tokio_serial::new(&cfg.port, cfg.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()?;

        Ok(Box::new(RtuTransport::new(port, cfg.mode.unit_id())))
    }

    fn endpoint(&self) -> String {
        format!(
            "{} ({} baud, unit {})",
            self.config.port,
            self.config.baud_rate,
            self.config.mode.unit_id()
        )
    }
}
