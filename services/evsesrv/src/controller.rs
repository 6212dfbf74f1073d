//! High-level charger operations
//!
//! Groups register reads into response objects and range-checks control
//! writes before they reach the wire. Failed reads come back as `None` and
//! serialise as `null`.

use std::collections::HashMap;

use evse_modbus::{ChargerError, ChargerSession, RegisterValue};
use serde::Serialize;
use tracing::info;

use crate::error::{ControllerError, Result};

const DEVICE_INFO_REGISTERS: &[&str] = &[
    "firmware_version",
    "serial_number",
    "register_table_version",
    "hardware_max_current",
    "device_name",
];

const STATUS_REGISTERS: &[&str] = &[
    "charge_point_state",
    "cable_state",
    "error_code",
    "temperature",
    "current_l1",
    "current_l2",
    "current_l3",
    "voltage_l1",
    "voltage_l2",
    "voltage_l3",
    "active_power",
    "charging_current_limit",
    "charging_enabled",
];

const ENERGY_REGISTERS: &[&str] = &["energy_meter", "session_energy", "session_duration"];

/// IEC 61851 control pilot state for the controller's numeric state register
///
/// The controller reports either 1..=6 or the ASCII letter itself.
pub fn iec61851_state(raw: u16) -> Option<char> {
    match raw {
        1..=6 => char::from_u32(u32::from('A') + u32::from(raw) - 1),
        0x41..=0x46 => char::from_u32(u32::from(raw)),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub register_table_version: Option<u16>,
    /// Amps
    pub hardware_max_current: Option<u16>,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Phases {
    pub l1: Option<f32>,
    pub l2: Option<f32>,
    pub l3: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChargerStatus {
    /// Raw charge point state
    pub state: Option<u16>,
    /// IEC 61851 letter, A..F
    pub iec_state: Option<char>,
    pub cable_state: Option<u16>,
    pub error_code: Option<u16>,
    /// Amps per phase
    pub currents: Phases,
    /// Volts per phase
    pub voltages: Phases,
    /// Watts
    pub active_power: Option<f32>,
    /// Degrees Celsius
    pub temperature: Option<f32>,
    /// Amps
    pub current_limit: Option<u16>,
    pub charging_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnergyReport {
    pub meter_wh: Option<u32>,
    pub meter_kwh: Option<f64>,
    pub session_energy_wh: Option<u32>,
    pub session_energy_kwh: Option<f64>,
    /// Seconds
    pub session_duration: Option<u32>,
}

/// Batch read result keyed by register name
struct Readings(HashMap<String, RegisterValue>);

impl Readings {
    fn new(results: Vec<(String, Option<RegisterValue>)>) -> Self {
        Self(
            results
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v)))
                .collect(),
        )
    }

    fn text(&self, name: &str) -> Option<String> {
        self.0.get(name).and_then(|v| v.as_str()).map(str::to_string)
    }

    fn number(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(RegisterValue::as_f64)
    }

    fn u16(&self, name: &str) -> Option<u16> {
        match self.0.get(name)? {
            RegisterValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    fn u32(&self, name: &str) -> Option<u32> {
        match self.0.get(name)? {
            RegisterValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    fn f32(&self, name: &str) -> Option<f32> {
        self.number(name).map(|v| v as f32)
    }
}

fn kwh(wh: Option<u32>) -> Option<f64> {
    wh.map(|v| f64::from(v) / 1000.0)
}

/// Charger operations on top of a session
#[derive(Clone)]
pub struct ChargerController {
    session: ChargerSession,
}

impl ChargerController {
    pub fn new(session: ChargerSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &ChargerSession {
        &self.session
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.session.is_connected() {
            Ok(())
        } else {
            Err(ChargerError::NotConnected.into())
        }
    }

    pub async fn device_info(&self) -> Result<DeviceInfo> {
        self.ensure_connected()?;
        let r = Readings::new(self.session.read_many(DEVICE_INFO_REGISTERS).await);
        Ok(DeviceInfo {
            firmware_version: r.text("firmware_version"),
            serial_number: r.text("serial_number"),
            register_table_version: r.u16("register_table_version"),
            hardware_max_current: r.u16("hardware_max_current"),
            device_name: r.text("device_name"),
        })
    }

    pub async fn status(&self) -> Result<ChargerStatus> {
        self.ensure_connected()?;
        let r = Readings::new(self.session.read_many(STATUS_REGISTERS).await);
        let state = r.u16("charge_point_state");
        Ok(ChargerStatus {
            state,
            iec_state: state.and_then(iec61851_state),
            cable_state: r.u16("cable_state"),
            error_code: r.u16("error_code"),
            currents: Phases {
                l1: r.f32("current_l1"),
                l2: r.f32("current_l2"),
                l3: r.f32("current_l3"),
            },
            voltages: Phases {
                l1: r.f32("voltage_l1"),
                l2: r.f32("voltage_l2"),
                l3: r.f32("voltage_l3"),
            },
            active_power: r.f32("active_power"),
            // Tenths of a degree on the wire
            temperature: r.number("temperature").map(|t| (t / 10.0) as f32),
            current_limit: r.u16("charging_current_limit"),
            charging_enabled: r.u16("charging_enabled").map(|v| v != 0),
        })
    }

    pub async fn energy(&self) -> Result<EnergyReport> {
        self.ensure_connected()?;
        let r = Readings::new(self.session.read_many(ENERGY_REGISTERS).await);
        let meter_wh = r.u32("energy_meter");
        let session_energy_wh = r.u32("session_energy");
        Ok(EnergyReport {
            meter_wh,
            meter_kwh: kwh(meter_wh),
            session_energy_wh,
            session_energy_kwh: kwh(session_energy_wh),
            session_duration: r.u32("session_duration"),
        })
    }

    /// Reject `value` if it falls outside the register's advisory range
    fn check_range(&self, register: &str, value: f64) -> Result<()> {
        let descriptor = self.session.catalog().lookup(register)?;
        match &descriptor.valid_range {
            Some(range) if !descriptor.in_range(value) => Err(ControllerError::OutOfRange {
                register: register.to_string(),
                value,
                min: *range.start(),
                max: *range.end(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn set_charging_current(&self, amps: u16) -> Result<()> {
        self.check_range("charging_current_limit", f64::from(amps))?;
        self.session
            .write_register("charging_current_limit", RegisterValue::U16(amps))
            .await?;
        info!("Charging current limit set to {}A", amps);
        Ok(())
    }

    pub async fn set_charging_enabled(&self, enabled: bool) -> Result<()> {
        self.session
            .write_register("charging_enabled", RegisterValue::U16(u16::from(enabled)))
            .await?;
        info!("Charging {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Fallback current applied when the controller stops hearing from us
    ///
    /// Both values are checked before either is written.
    pub async fn set_failsafe(&self, current: u16, timeout_secs: u16) -> Result<()> {
        self.check_range("failsafe_current", f64::from(current))?;
        self.check_range("failsafe_timeout", f64::from(timeout_secs))?;
        self.session
            .write_register("failsafe_current", RegisterValue::U16(current))
            .await?;
        self.session
            .write_register("failsafe_timeout", RegisterValue::U16(timeout_secs))
            .await?;
        info!("Failsafe set to {}A after {}s", current, timeout_secs);
        Ok(())
    }

    pub async fn set_power_limit(&self, watts: f32) -> Result<()> {
        self.check_range("charging_power_limit", f64::from(watts))?;
        self.session
            .write_register("charging_power_limit", RegisterValue::F32(watts))
            .await?;
        info!("Charging power limit set to {}W", watts);
        Ok(())
    }
}
