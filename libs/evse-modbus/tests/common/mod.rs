//! Scriptable in-memory charge controller for session tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use evse_modbus::frame::{FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use evse_modbus::{
    ChargerError, ChargerSession, ModbusTransport, RegisterCatalog, Result, SessionConfig,
    SessionEvent, TransportConnector,
};

/// Simulated time one exchange occupies the line
pub const LINE_TIME: Duration = Duration::from_millis(5);

/// Injected failure for the next exchange
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Transient I/O error
    Io,
    /// Never answer (the session's response timeout fires)
    Hang,
    /// Port closed underneath us
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireWrite {
    pub function: u8,
    pub address: u16,
    pub values: Vec<u16>,
}

/// Shared device state behind every transport the connector hands out
#[derive(Default)]
pub struct MockDevice {
    registers: Mutex<HashMap<u16, u16>>,
    faults: Mutex<VecDeque<Fault>>,
    sticky_fault: Mutex<Option<Fault>>,
    writes: Mutex<Vec<WireWrite>>,
    pub exchanges: AtomicUsize,
    pub reads: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_open: AtomicBool,
    in_flight: AtomicBool,
    pub overlap: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_word(&self, address: u16, value: u16) {
        self.registers.lock().insert(address, value);
    }

    pub fn set_words(&self, address: u16, values: &[u16]) {
        let mut registers = self.registers.lock();
        for (offset, value) in values.iter().enumerate() {
            registers.insert(address + offset as u16, *value);
        }
    }

    pub fn push_faults(&self, faults: &[Fault]) {
        self.faults.lock().extend(faults.iter().copied());
    }

    /// Fault applied to every exchange until cleared
    pub fn set_sticky_fault(&self, fault: Option<Fault>) {
        *self.sticky_fault.lock() = fault;
    }

    pub fn writes(&self) -> Vec<WireWrite> {
        self.writes.lock().clone()
    }

    pub fn writes_to(&self, address: u16) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.address == address)
            .count()
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults
            .lock()
            .pop_front()
            .or(*self.sticky_fault.lock())
    }
}

/// Clears the in-flight flag even when the exchange future is dropped by a timeout
struct InFlight<'a>(&'a MockDevice);

impl<'a> InFlight<'a> {
    fn enter(device: &'a MockDevice) -> Self {
        if device.in_flight.swap(true, Ordering::SeqCst) {
            device.overlap.store(true, Ordering::SeqCst);
        }
        device.exchanges.fetch_add(1, Ordering::SeqCst);
        Self(device)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    device: Arc<MockDevice>,
}

impl MockTransport {
    async fn occupy_line(&self) -> Result<()> {
        tokio::time::sleep(LINE_TIME).await;
        match self.device.next_fault() {
            None => Ok(()),
            Some(Fault::Io) => Err(ChargerError::Io("framing error".to_string())),
            Some(Fault::Closed) => Err(ChargerError::PortClosed("device gone".to_string())),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            },
        }
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let _guard = InFlight::enter(&self.device);
        self.occupy_line().await?;
        self.device.reads.fetch_add(1, Ordering::SeqCst);

        let registers = self.device.registers.lock();
        Ok((address..address + count)
            .map(|a| registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        let _guard = InFlight::enter(&self.device);
        self.occupy_line().await?;

        self.device.set_word(address, value);
        self.device.writes.lock().push(WireWrite {
            function: FC_WRITE_SINGLE_REGISTER,
            address,
            values: vec![value],
        });
        Ok(())
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        let _guard = InFlight::enter(&self.device);
        self.occupy_line().await?;

        self.device.set_words(address, values);
        self.device.writes.lock().push(WireWrite {
            function: FC_WRITE_MULTIPLE_REGISTERS,
            address,
            values: values.to_vec(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.device.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockConnector {
    pub device: Arc<MockDevice>,
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self) -> Result<Box<dyn ModbusTransport>> {
        self.device.opens.fetch_add(1, Ordering::SeqCst);
        if self.device.fail_open.load(Ordering::SeqCst) {
            return Err(ChargerError::PortClosed("no such device".to_string()));
        }
        Ok(Box::new(MockTransport {
            device: self.device.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        response_timeout: Duration::from_millis(200),
        max_retries: 3,
        reconnect_interval: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn session_with(config: SessionConfig) -> (ChargerSession, Arc<MockDevice>) {
    let device = MockDevice::new();
    let catalog = Arc::new(RegisterCatalog::standard().expect("standard catalog"));
    let connector = Arc::new(MockConnector {
        device: device.clone(),
    });
    (ChargerSession::new(catalog, connector, config), device)
}

pub async fn connected_session() -> (ChargerSession, Arc<MockDevice>) {
    let (session, device) = session_with(test_config());
    session.connect().await.expect("connect");
    (session, device)
}

/// Drain events until one matches, panicking after `within`
pub async fn expect_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    within: Duration,
    mut matches: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel: {e}"),
            }
        }
    })
    .await
    .expect("expected session event")
}
