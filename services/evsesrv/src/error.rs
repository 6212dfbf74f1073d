//! Controller error type

use evse_modbus::ChargerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControllerError {
    /// Control value outside the register's advisory range; nothing was written
    #[error("Value {value} out of range for {register} ({min}..={max})")]
    OutOfRange {
        register: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error(transparent)]
    Charger(#[from] ChargerError),
}
