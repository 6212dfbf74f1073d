//! EVSE gateway service
//!
//! Exposes a Modbus RTU charge controller as a JSON-RPC 2.0 API. The binary
//! in `main.rs` is the composition root; this library holds the pieces so
//! they can be exercised in tests against a simulated controller.

pub mod config;
pub mod controller;
pub mod error;
pub mod rpc;

pub use config::ServiceConfig;
pub use controller::ChargerController;
pub use error::ControllerError;
pub use rpc::{create_routes, AppState};
