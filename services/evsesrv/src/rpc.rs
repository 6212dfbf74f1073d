//! JSON-RPC 2.0 over HTTP
//!
//! `POST /rpc` takes one request object per call; batch arrays are rejected.
//! `GET /health` reports the service and link state.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use evse_modbus::{ChargerError, ConnectionState, RegisterDescriptor, RegisterValue};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::controller::ChargerController;
use crate::error::ControllerError;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const DEVICE_ERROR: i32 = -32000;
pub const UNKNOWN_REGISTER: i32 = -32001;
pub const ACCESS_VIOLATION: i32 = -32002;
pub const NOT_CONNECTED: i32 = -32003;
pub const VALUE_ERROR: i32 = -32004;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ChargerController>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: Arc<ChargerController>) -> Self {
        Self {
            controller,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(message: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {message}"))
    }
}

impl From<ChargerError> for RpcError {
    fn from(err: ChargerError) -> Self {
        let code = match &err {
            ChargerError::UnknownRegister(_) => UNKNOWN_REGISTER,
            ChargerError::AccessViolation { .. } => ACCESS_VIOLATION,
            ChargerError::NotConnected => NOT_CONNECTED,
            ChargerError::Encode(_) => VALUE_ERROR,
            _ => DEVICE_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ControllerError> for RpcError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::OutOfRange { .. } => Self::new(VALUE_ERROR, err.to_string()),
            ControllerError::Charger(e) => e.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub service: &'static str,
    pub version: &'static str,
    pub connection: ConnectionState,
    pub keep_alive: bool,
    pub uptime_seconds: u64,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/rpc", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let session = state.controller.session();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(HealthStatus {
        service: "evsesrv",
        version: env!("CARGO_PKG_VERSION"),
        connection: session.state(),
        keep_alive: session.keep_alive_active(),
        uptime_seconds: u64::try_from(uptime).unwrap_or(0),
    })
}

async fn handle_rpc(State(state): State<AppState>, body: Bytes) -> Json<RpcResponse> {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return Json(RpcResponse::failure(
                Value::Null,
                RpcError::new(PARSE_ERROR, format!("Parse error: {e}")),
            ))
        },
    };

    let (id, method, params) = match split_request(request) {
        Ok(parts) => parts,
        Err((id, error)) => return Json(RpcResponse::failure(id, error)),
    };

    debug!("RPC {} id={}", method, id);
    match dispatch(&state.controller, &method, params).await {
        Ok(result) => Json(RpcResponse::success(id, result)),
        Err(error) => {
            if error.code == DEVICE_ERROR {
                warn!("RPC {} failed: {}", method, error.message);
            }
            Json(RpcResponse::failure(id, error))
        },
    }
}

/// Validate the envelope and pull out `(id, method, params)`
fn split_request(request: Value) -> Result<(Value, String, Value), (Value, RpcError)> {
    let mut object = match request {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err((
                Value::Null,
                RpcError::new(INVALID_REQUEST, "Invalid request: batch requests are not supported"),
            ))
        },
        _ => {
            return Err((
                Value::Null,
                RpcError::new(INVALID_REQUEST, "Invalid request: expected an object"),
            ))
        },
    };

    let id = object.remove("id").unwrap_or(Value::Null);
    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err((id, RpcError::new(INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\"")));
    }
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => return Err((id, RpcError::new(INVALID_REQUEST, "Invalid request: missing method"))),
    };
    let params = object.remove("params").unwrap_or(Value::Null);
    Ok((id, method, params))
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

/// JSON number to a register value; the codec narrows it per target type
fn value_from_json(value: &Value) -> Option<RegisterValue> {
    if let Some(v) = value.as_u64() {
        if let Ok(v) = u32::try_from(v) {
            return Some(RegisterValue::U32(v));
        }
    } else if let Some(v) = value.as_i64() {
        if let Ok(v) = i32::try_from(v) {
            return Some(RegisterValue::I32(v));
        }
    }
    value.as_f64().map(RegisterValue::F64)
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct WriteParams {
    name: String,
    value: Value,
}

#[derive(Deserialize)]
struct NamesParams {
    names: Vec<String>,
}

#[derive(Deserialize)]
struct CurrentParams {
    current: u16,
}

#[derive(Deserialize)]
struct EnabledParams {
    enabled: bool,
}

#[derive(Deserialize)]
struct FailsafeParams {
    current: u16,
    timeout: u16,
}

#[derive(Deserialize)]
struct PowerParams {
    power: f32,
}

#[derive(Serialize)]
struct RegisterInfo<'a> {
    #[serde(flatten)]
    descriptor: &'a RegisterDescriptor,
    readable: bool,
    writable: bool,
}

pub async fn dispatch(
    controller: &ChargerController,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    let session = controller.session();
    match method {
        "connect" => {
            session.connect().await?;
            Ok(json!({ "state": session.state() }))
        },
        "disconnect" => {
            session.disconnect().await;
            Ok(json!({ "state": session.state() }))
        },
        "getConnectionState" => Ok(json!({
            "state": session.state(),
            "keepAlive": session.keep_alive_active(),
        })),
        "readRegister" => {
            let p: NameParams = parse_params(params)?;
            let value = session.read_register(&p.name).await?;
            to_result(&value)
        },
        "writeRegister" => {
            let p: WriteParams = parse_params(params)?;
            let value = value_from_json(&p.value)
                .ok_or_else(|| RpcError::invalid_params("value must be a number"))?;
            session.write_register(&p.name, value).await?;
            Ok(Value::Bool(true))
        },
        "readMany" => {
            let p: NamesParams = parse_params(params)?;
            let mut values = serde_json::Map::new();
            for (name, value) in session.read_many(&p.names).await {
                values.insert(name, to_result(&value)?);
            }
            Ok(Value::Object(values))
        },
        "startKeepAlive" => {
            session.start_keep_alive();
            Ok(Value::Bool(session.keep_alive_active()))
        },
        "stopKeepAlive" => {
            session.stop_keep_alive();
            Ok(Value::Bool(session.keep_alive_active()))
        },
        "getDeviceInfo" => to_result(&controller.device_info().await?),
        "getStatus" => to_result(&controller.status().await?),
        "getEnergy" => to_result(&controller.energy().await?),
        "setChargingCurrent" => {
            let p: CurrentParams = parse_params(params)?;
            controller.set_charging_current(p.current).await?;
            Ok(Value::Bool(true))
        },
        "setChargingEnabled" => {
            let p: EnabledParams = parse_params(params)?;
            controller.set_charging_enabled(p.enabled).await?;
            Ok(Value::Bool(true))
        },
        "setFailsafe" => {
            let p: FailsafeParams = parse_params(params)?;
            controller.set_failsafe(p.current, p.timeout).await?;
            Ok(Value::Bool(true))
        },
        "setPowerLimit" => {
            let p: PowerParams = parse_params(params)?;
            controller.set_power_limit(p.power).await?;
            Ok(Value::Bool(true))
        },
        "listRegisters" => {
            let registers: Vec<RegisterInfo<'_>> = session
                .catalog()
                .iter()
                .map(|descriptor| RegisterInfo {
                    descriptor,
                    readable: descriptor.access.readable(),
                    writable: descriptor.access.writable(),
                })
                .collect();
            to_result(&registers)
        },
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}
