//! Simulated charge controller behind the `TransportConnector` seam

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use evse_modbus::{
    ChargerSession, ModbusTransport, RegisterCatalog, Result, SessionConfig, TransportConnector,
};
use evsesrv::{create_routes, AppState, ChargerController};

/// Register image of the controller; answers every address, unset ones read 0
#[derive(Default)]
pub struct SimCharger {
    registers: Mutex<HashMap<u16, u16>>,
    pub exchanges: AtomicUsize,
    pub writes: AtomicUsize,
}

impl SimCharger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn word(&self, address: u16) -> u16 {
        self.registers.lock().get(&address).copied().unwrap_or(0)
    }

    pub fn set_u16(&self, address: u16, value: u16) {
        self.registers.lock().insert(address, value);
    }

    /// Low word first
    pub fn set_u32(&self, address: u16, value: u32) {
        let mut registers = self.registers.lock();
        registers.insert(address, (value & 0xFFFF) as u16);
        registers.insert(address + 1, (value >> 16) as u16);
    }

    pub fn set_f32(&self, address: u16, value: f32) {
        self.set_u32(address, value.to_bits());
    }

    pub fn f32_at(&self, address: u16) -> f32 {
        let bits = u32::from(self.word(address)) | (u32::from(self.word(address + 1)) << 16);
        f32::from_bits(bits)
    }

    /// Bytes swapped inside each word, NUL padded
    pub fn set_text(&self, address: u16, text: &str) {
        let mut registers = self.registers.lock();
        for (i, pair) in text.as_bytes().chunks(2).enumerate() {
            let high = pair.get(1).copied().unwrap_or(0);
            registers.insert(address + i as u16, u16::from_be_bytes([high, pair[0]]));
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

struct SimTransport(Arc<SimCharger>);

#[async_trait]
impl ModbusTransport for SimTransport {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.0.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok((address..address + count).map(|a| self.0.word(a)).collect())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.0.exchanges.fetch_add(1, Ordering::SeqCst);
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        self.0.set_u16(address, value);
        Ok(())
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        self.0.exchanges.fetch_add(1, Ordering::SeqCst);
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        let mut registers = self.0.registers.lock();
        for (i, value) in values.iter().enumerate() {
            registers.insert(address + i as u16, *value);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SimConnector(pub Arc<SimCharger>);

#[async_trait]
impl TransportConnector for SimConnector {
    async fn open(&self) -> Result<Box<dyn ModbusTransport>> {
        Ok(Box::new(SimTransport(self.0.clone())))
    }

    fn endpoint(&self) -> String {
        "simulated charger".to_string()
    }
}

/// Controller populated with a plausible charging session
pub fn populated_charger() -> Arc<SimCharger> {
    let charger = SimCharger::new();
    charger.set_text(100, "V2.1");
    charger.set_text(108, "EV-0042");
    charger.set_u16(118, 3);
    charger.set_u16(119, 32);
    charger.set_u16(200, 3);
    charger.set_u16(201, 2);
    charger.set_u16(203, (-45i16) as u16);
    charger.set_f32(204, 16.0);
    charger.set_f32(206, 15.5);
    charger.set_f32(208, 16.25);
    charger.set_f32(210, 230.0);
    charger.set_f32(212, 231.5);
    charger.set_f32(214, 229.0);
    charger.set_f32(216, 11_000.0);
    charger.set_u32(220, 4_294_967_000);
    charger.set_u32(222, 12_345);
    charger.set_u32(224, 3_600);
    charger.set_u16(300, 16);
    charger.set_u16(301, 1);
    charger
}

pub async fn connected_controller(charger: &Arc<SimCharger>) -> Arc<ChargerController> {
    let catalog = Arc::new(RegisterCatalog::standard().unwrap());
    let connector = Arc::new(SimConnector(charger.clone()));
    let session = ChargerSession::new(catalog, connector, SessionConfig::default());
    session.connect().await.unwrap();
    Arc::new(ChargerController::new(session))
}

pub async fn test_router(charger: &Arc<SimCharger>) -> (axum::Router, Arc<ChargerController>) {
    let controller = connected_controller(charger).await;
    let router = create_routes(AppState::new(controller.clone()));
    (router, controller)
}
