//! Register catalog
//!
//! Static mapping from symbolic register names to their wire layout. The
//! built-in table is a representative map for a wallbox charge controller;
//! firmware with a different layout needs its own table passed to
//! [`RegisterCatalog::new`]. The catalog is built once at startup, validated,
//! and then shared read-only by every session.
//!
//! Address blocks:
//!
//! ```text
//! 100..=130   device identification   (read-only)
//! 200..=231   live measurements        (read-only)
//! 300..=310   control and fallback     (read-write)
//! 399         heartbeat                (write-only)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::error::{ChargerError, Result};

/// Register holding the heartbeat the master must refresh
pub const KEEP_ALIVE_REGISTER: &str = "heartbeat";

/// Value written on every keep-alive beat
pub const KEEP_ALIVE_VALUE: u16 = 0x55AA;

/// Cheap status register polled by the session health check
pub const HEALTH_CHECK_REGISTER: &str = "charge_point_state";

/// Wire data type of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Unsigned16,
    Signed16,
    Unsigned32,
    Signed32,
    Float32,
    /// Text spread over N words, bytes swapped within each word
    AsciiString,
}

impl DataType {
    /// Fixed word width, `None` for variable-length strings
    pub fn fixed_width(self) -> Option<u16> {
        match self {
            DataType::Unsigned16 | DataType::Signed16 => Some(1),
            DataType::Unsigned32 | DataType::Signed32 | DataType::Float32 => Some(2),
            DataType::AsciiString => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Unsigned16 => "uint16",
            DataType::Signed16 => "int16",
            DataType::Unsigned32 => "uint32",
            DataType::Signed32 => "int32",
            DataType::Float32 => "float32",
            DataType::AsciiString => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access rights of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// Immutable wire layout of one register
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub word_count: u16,
    pub data_type: DataType,
    pub access: Access,
    /// Advisory bound; enforced by callers that know the domain semantics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<RangeInclusive<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
}

impl RegisterDescriptor {
    /// Last wire address covered by this register
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.word_count) - 1
    }

    /// Check a numeric value against the advisory range
    pub fn in_range(&self, value: f64) -> bool {
        self.valid_range
            .as_ref()
            .map_or(true, |range| range.contains(&value))
    }
}

const fn reg(
    name: &'static str,
    address: u16,
    word_count: u16,
    data_type: DataType,
    access: Access,
) -> RegisterDescriptor {
    RegisterDescriptor {
        name,
        address,
        word_count,
        data_type,
        access,
        valid_range: None,
        unit: None,
    }
}

const fn with_unit(mut desc: RegisterDescriptor, unit: &'static str) -> RegisterDescriptor {
    desc.unit = Some(unit);
    desc
}

const fn with_range(mut desc: RegisterDescriptor, min: f64, max: f64) -> RegisterDescriptor {
    desc.valid_range = Some(min..=max);
    desc
}

use Access::{ReadOnly, ReadWrite, WriteOnly};
use DataType::{AsciiString, Float32, Signed16, Signed32, Unsigned16, Unsigned32};

/// Representative charge controller register map
pub static STANDARD_REGISTERS: &[RegisterDescriptor] = &[
    // Device identification
    reg("firmware_version", 100, 8, AsciiString, ReadOnly),
    reg("serial_number", 108, 10, AsciiString, ReadOnly),
    reg("register_table_version", 118, 1, Unsigned16, ReadOnly),
    with_unit(reg("hardware_max_current", 119, 1, Unsigned16, ReadOnly), "A"),
    reg("device_name", 120, 8, AsciiString, ReadOnly),
    // Status
    reg("charge_point_state", 200, 1, Unsigned16, ReadOnly),
    reg("cable_state", 201, 1, Unsigned16, ReadOnly),
    reg("error_code", 202, 1, Unsigned16, ReadOnly),
    with_unit(reg("temperature", 203, 1, Signed16, ReadOnly), "0.1°C"),
    with_unit(reg("current_l1", 204, 2, Float32, ReadOnly), "A"),
    with_unit(reg("current_l2", 206, 2, Float32, ReadOnly), "A"),
    with_unit(reg("current_l3", 208, 2, Float32, ReadOnly), "A"),
    with_unit(reg("voltage_l1", 210, 2, Float32, ReadOnly), "V"),
    with_unit(reg("voltage_l2", 212, 2, Float32, ReadOnly), "V"),
    with_unit(reg("voltage_l3", 214, 2, Float32, ReadOnly), "V"),
    with_unit(reg("active_power", 216, 2, Float32, ReadOnly), "W"),
    with_unit(reg("grid_power", 218, 2, Signed32, ReadOnly), "W"),
    // Energy
    with_unit(reg("energy_meter", 220, 2, Unsigned32, ReadOnly), "Wh"),
    with_unit(reg("session_energy", 222, 2, Unsigned32, ReadOnly), "Wh"),
    with_unit(reg("session_duration", 224, 2, Unsigned32, ReadOnly), "s"),
    // Control
    with_unit(
        with_range(
            reg("charging_current_limit", 300, 1, Unsigned16, ReadWrite),
            0.0,
            32.0,
        ),
        "A",
    ),
    with_range(reg("charging_enabled", 301, 1, Unsigned16, ReadWrite), 0.0, 1.0),
    with_unit(
        with_range(
            reg("charging_power_limit", 302, 2, Float32, ReadWrite),
            0.0,
            22_000.0,
        ),
        "W",
    ),
    with_unit(
        with_range(
            reg("failsafe_current", 304, 1, Unsigned16, ReadWrite),
            0.0,
            32.0,
        ),
        "A",
    ),
    with_unit(
        with_range(
            reg("failsafe_timeout", 305, 1, Unsigned16, ReadWrite),
            10.0,
            3600.0,
        ),
        "s",
    ),
    with_unit(
        with_range(
            reg("session_energy_limit", 306, 2, Unsigned32, ReadWrite),
            0.0,
            200_000.0,
        ),
        "Wh",
    ),
    with_range(reg("phase_mode", 308, 1, Unsigned16, ReadWrite), 1.0, 3.0),
    with_unit(
        with_range(
            reg("power_offset", 309, 2, Signed32, ReadWrite),
            -22_000.0,
            22_000.0,
        ),
        "W",
    ),
    // Heartbeat
    reg(KEEP_ALIVE_REGISTER, 399, 1, Unsigned16, WriteOnly),
];

/// Validated, name-indexed register table
#[derive(Debug, Clone)]
pub struct RegisterCatalog {
    registers: Vec<RegisterDescriptor>,
    by_name: HashMap<&'static str, usize>,
}

impl RegisterCatalog {
    /// Build a catalog from descriptors, rejecting authoring mistakes
    pub fn new(descriptors: &[RegisterDescriptor]) -> Result<Self> {
        let mut registers = descriptors.to_vec();
        registers.sort_by_key(|d| d.address);

        let mut by_name = HashMap::with_capacity(registers.len());
        for (index, desc) in registers.iter().enumerate() {
            if desc.name.is_empty() {
                return Err(ChargerError::config(format!(
                    "register at address {} has an empty name",
                    desc.address
                )));
            }
            if desc.word_count == 0 {
                return Err(ChargerError::config(format!(
                    "register '{}' has zero word count",
                    desc.name
                )));
            }
            if let Some(width) = desc.data_type.fixed_width() {
                if desc.word_count != width {
                    return Err(ChargerError::config(format!(
                        "register '{}' is {} but spans {} words (expected {})",
                        desc.name, desc.data_type, desc.word_count, width
                    )));
                }
            }
            if desc.end_address() > u32::from(u16::MAX) {
                return Err(ChargerError::config(format!(
                    "register '{}' runs past the address space",
                    desc.name
                )));
            }
            if by_name.insert(desc.name, index).is_some() {
                return Err(ChargerError::config(format!(
                    "duplicate register name '{}'",
                    desc.name
                )));
            }
        }

        for pair in registers.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.address == next.address {
                return Err(ChargerError::config(format!(
                    "registers '{}' and '{}' share address {}",
                    prev.name, next.name, next.address
                )));
            }
            if prev.end_address() >= u32::from(next.address) {
                return Err(ChargerError::config(format!(
                    "register '{}' ({}..={}) overlaps '{}' at {}",
                    prev.name,
                    prev.address,
                    prev.end_address(),
                    next.name,
                    next.address
                )));
            }
        }

        Ok(Self { registers, by_name })
    }

    /// Catalog over [`STANDARD_REGISTERS`]
    pub fn standard() -> Result<Self> {
        Self::new(STANDARD_REGISTERS)
    }

    /// Resolve a symbolic name
    pub fn lookup(&self, name: &str) -> Result<&RegisterDescriptor> {
        self.by_name
            .get(name)
            .map(|&index| &self.registers[index])
            .ok_or_else(|| ChargerError::UnknownRegister(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Descriptors in address order
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn readable(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter().filter(|d| d.access.readable())
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}
