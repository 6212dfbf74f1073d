//! Modbus RTU framing
//!
//! RTU frame layout: `[unit id][function code][data...][crc lo][crc hi]`.
//! Only the three function codes the charge controller speaks are handled.

use tracing::debug;

use crate::error::{ChargerError, Result};

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Max registers per read request
pub const MAX_READ_COUNT: u16 = 125;
/// Max registers per write-multiple request
pub const MAX_WRITE_COUNT: u16 = 123;

/// Bytes read before the total frame length is known: unit, function, first data byte
pub const RESPONSE_HEADER_LEN: usize = 3;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Request PDU sent to the charge controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHolding { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadHolding { .. } => FC_READ_HOLDING_REGISTERS,
            Request::WriteSingle { .. } => FC_WRITE_SINGLE_REGISTER,
            Request::WriteMultiple { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Request::ReadHolding { count, .. } if *count == 0 || *count > MAX_READ_COUNT => {
                Err(ChargerError::frame(format!(
                    "read count {count} outside 1..={MAX_READ_COUNT}"
                )))
            },
            Request::WriteMultiple { values, .. }
                if values.is_empty() || values.len() > usize::from(MAX_WRITE_COUNT) =>
            {
                Err(ChargerError::frame(format!(
                    "write count {} outside 1..={MAX_WRITE_COUNT}",
                    values.len()
                )))
            },
            _ => Ok(()),
        }
    }

    /// Build the complete RTU frame, CRC included
    pub fn to_frame(&self, unit_id: u8) -> Result<Vec<u8>> {
        self.validate()?;

        let mut frame = Vec::with_capacity(8);
        frame.push(unit_id);
        frame.push(self.function_code());

        match self {
            Request::ReadHolding { address, count } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
            },
            Request::WriteSingle { address, value } => {
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&value.to_be_bytes());
            },
            Request::WriteMultiple { address, values } => {
                let count = values.len() as u16;
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
                frame.push((count * 2) as u8);
                for value in values {
                    frame.extend_from_slice(&value.to_be_bytes());
                }
            },
        }

        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        debug!(
            "RTU frame: unit={}, FC={:02X}, len={}, CRC={:04X}",
            unit_id,
            self.function_code(),
            frame.len(),
            crc
        );

        Ok(frame)
    }

    /// Bytes still to read once the 3-byte response header is in
    pub fn remaining_len(&self, header: &[u8; RESPONSE_HEADER_LEN]) -> usize {
        let function = header[1];
        if function & 0x80 != 0 {
            // exception code already read, CRC left
            return 2;
        }
        match function {
            FC_READ_HOLDING_REGISTERS => usize::from(header[2]) + 2,
            // address(2) + value/count(2) + crc(2), first byte already read
            FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => 5,
            // Unknown function code: read as if our own request, parse will reject it
            _ => match self {
                Request::ReadHolding { count, .. } => usize::from(*count) * 2 + 2,
                _ => 5,
            },
        }
    }

    /// Validate a full response frame and extract register words (empty for writes)
    pub fn parse_response(&self, unit_id: u8, frame: &[u8]) -> Result<Vec<u16>> {
        if frame.len() < 5 {
            return Err(ChargerError::frame(format!(
                "response too short: {} bytes",
                frame.len()
            )));
        }

        let body_len = frame.len() - 2;
        let received_crc = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
        let calculated_crc = crc16(&frame[..body_len]);
        if received_crc != calculated_crc {
            return Err(ChargerError::frame(format!(
                "CRC mismatch: expected 0x{calculated_crc:04X}, got 0x{received_crc:04X}"
            )));
        }

        if frame[0] != unit_id {
            return Err(ChargerError::frame(format!(
                "unit id mismatch: expected {unit_id}, got {}",
                frame[0]
            )));
        }

        let function = frame[1];
        let expected = self.function_code();
        if function == expected | 0x80 {
            return Err(ChargerError::DeviceException {
                function,
                code: frame[2],
            });
        }
        if function != expected {
            return Err(ChargerError::frame(format!(
                "function code mismatch: expected {expected:02X}, got {function:02X}"
            )));
        }

        let data = &frame[2..body_len];
        match self {
            Request::ReadHolding { count, .. } => {
                let byte_count = usize::from(data[0]);
                let expected_bytes = usize::from(*count) * 2;
                if byte_count != expected_bytes || data.len() != byte_count + 1 {
                    return Err(ChargerError::frame(format!(
                        "byte count mismatch: expected {expected_bytes}, got {byte_count}"
                    )));
                }
                Ok(data[1..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect())
            },
            Request::WriteSingle { address, value } => {
                check_echo(data, *address, *value)?;
                Ok(Vec::new())
            },
            Request::WriteMultiple { address, values } => {
                check_echo(data, *address, values.len() as u16)?;
                Ok(Vec::new())
            },
        }
    }
}

fn check_echo(data: &[u8], address: u16, second: u16) -> Result<()> {
    if data.len() != 4 {
        return Err(ChargerError::frame(format!(
            "write echo length {} != 4",
            data.len()
        )));
    }
    let echoed_address = u16::from_be_bytes([data[0], data[1]]);
    let echoed_second = u16::from_be_bytes([data[2], data[3]]);
    if echoed_address != address || echoed_second != second {
        return Err(ChargerError::frame(format!(
            "write echo mismatch: sent {address}/{second}, got {echoed_address}/{echoed_second}"
        )));
    }
    Ok(())
}

/// Append CRC to a frame body; used to script device responses
pub fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}
