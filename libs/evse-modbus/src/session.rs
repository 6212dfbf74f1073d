//! Charger session: one logical connection to the charge controller
//!
//! All wire traffic (application reads/writes, health checks, keep-alive
//! beats) is funnelled through a single async mutex around the transport, so
//! at most one request/response exchange is ever on the serial line.
//!
//! Connection loss (timeout or closed port) tears the link down, emits
//! [`SessionEvent::ConnectionLost`] and schedules exactly one reconnect
//! attempt; failed attempts reschedule on the same fixed interval forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{RegisterCatalog, RegisterDescriptor, KEEP_ALIVE_REGISTER, KEEP_ALIVE_VALUE};
use crate::codec::{self, RegisterValue};
use crate::error::{ChargerError, Result};
use crate::frame::Request;
use crate::keepalive::{self, KeepAliveScheduler};
use crate::transport::{ModbusTransport, TransportConnector};

const EVENT_CAPACITY: usize = 64;

/// Session timing and retry parameters, fixed after construction
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Per-exchange response window
    pub response_timeout: Duration,
    /// Window for opening the port
    pub connect_timeout: Duration,
    /// Total wire attempts per operation
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub reconnect_interval: Duration,
    pub health_check_interval: Duration,
    pub health_check_register: String,
    pub keep_alive_delay: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            health_check_register: crate::catalog::HEALTH_CHECK_REGISTER.to_string(),
            keep_alive_delay: keepalive::DEFAULT_INITIAL_DELAY,
            keep_alive_interval: keepalive::DEFAULT_INTERVAL,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(ChargerError::config("max_retries must be at least 1"));
        }
        if self.response_timeout.is_zero() {
            return Err(ChargerError::config("response timeout must be positive"));
        }
        if self.reconnect_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(ChargerError::config(
                "reconnect and health check intervals must be positive",
            ));
        }
        if self.keep_alive_interval.is_zero()
            || self.keep_alive_interval >= keepalive::DEVICE_WINDOW
        {
            return Err(ChargerError::config(format!(
                "keep-alive interval must be within (0, {}s)",
                keepalive::DEVICE_WINDOW.as_secs()
            )));
        }
        Ok(())
    }

    /// Timing checks plus the health-check register against the catalog
    pub fn validate_with(&self, catalog: &RegisterCatalog) -> Result<()> {
        self.validate()?;

        let name = &self.health_check_register;
        let desc = catalog.lookup(name).map_err(|_| {
            ChargerError::config(format!("health check register '{name}' is not in the catalog"))
        })?;
        if !desc.access.readable() {
            return Err(ChargerError::config(format!(
                "health check register '{name}' is not readable"
            )));
        }
        if desc.word_count != 1 {
            return Err(ChargerError::config(format!(
                "health check register '{name}' spans {} words, expected 1",
                desc.word_count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Link down, a reconnect attempt is pending
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ConnectionLost { reason: String },
    Error { message: String },
}

struct SessionInner {
    catalog: Arc<RegisterCatalog>,
    connector: Arc<dyn TransportConnector>,
    config: SessionConfig,
    /// The wire lock: holding it means owning the serial line
    wire: tokio::sync::Mutex<Option<Box<dyn ModbusTransport>>>,
    /// Serialises connect / disconnect / connection-lost transitions
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    health_check: Mutex<Option<CancellationToken>>,
    reconnect: Mutex<Option<CancellationToken>>,
    keep_alive: KeepAliveScheduler,
    keep_alive_requested: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(token) = self.health_check.get_mut().take() {
            token.cancel();
        }
        if let Some(token) = self.reconnect.get_mut().take() {
            token.cancel();
        }
        self.keep_alive.stop();
    }
}

/// Cheaply cloneable handle to a charger session
#[derive(Clone)]
pub struct ChargerSession {
    inner: Arc<SessionInner>,
}

impl ChargerSession {
    pub fn new(
        catalog: Arc<RegisterCatalog>,
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let keep_alive = KeepAliveScheduler::new(config.keep_alive_delay, config.keep_alive_interval);

        Self {
            inner: Arc::new(SessionInner {
                catalog,
                connector,
                config,
                wire: tokio::sync::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(ConnectionState::Disconnected),
                events,
                health_check: Mutex::new(None),
                reconnect: Mutex::new(None),
                keep_alive,
                keep_alive_requested: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn catalog(&self) -> &Arc<RegisterCatalog> {
        &self.inner.catalog
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.inner.state.lock(), state)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the serial link
    ///
    /// On failure an `Error` event is emitted, a reconnect is scheduled and
    /// the error is returned. Connecting an already connected session is a no-op.
    pub async fn connect(&self) -> Result<()> {
        self.connect_inner(false).await
    }

    async fn connect_inner(&self, from_reconnect: bool) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            // explicit disconnect won the race against the timer
            ConnectionState::Disconnected if from_reconnect => return Ok(()),
            _ => {},
        }

        let endpoint = self.inner.connector.endpoint();
        debug!("Connecting: {}", endpoint);

        let opened = match timeout(self.inner.config.connect_timeout, self.inner.connector.open()).await {
            Ok(result) => result,
            Err(_) => Err(ChargerError::timeout(format!(
                "opening {endpoint} took longer than {}ms",
                self.inner.config.connect_timeout.as_millis()
            ))),
        };

        match opened {
            Ok(transport) => {
                let previous = self.inner.wire.lock().await.replace(transport);
                if let Some(mut stale) = previous {
                    let _ = stale.close().await;
                }

                self.cancel_reconnect();
                self.set_state(ConnectionState::Connected);
                self.start_health_check();
                if self.inner.keep_alive_requested.load(Ordering::SeqCst) {
                    self.arm_keep_alive();
                }

                info!("Connected: {}", endpoint);
                self.emit(SessionEvent::Connected);
                Ok(())
            },
            Err(e) => {
                error!("Connect failed: {} - {}", endpoint, e);
                self.emit(SessionEvent::Error {
                    message: e.to_string(),
                });
                self.schedule_reconnect();
                Err(e)
            },
        }
    }

    /// Close the link and stop every timer. Idempotent.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        self.cancel_reconnect();
        self.stop_health_check();
        self.inner.keep_alive_requested.store(false, Ordering::SeqCst);
        self.inner.keep_alive.stop();

        // waits for any in-flight exchange
        let transport = self.inner.wire.lock().await.take();
        if let Some(mut transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Close failed: {}", e);
            }
        }

        let previous = self.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!("Disconnected");
            self.emit(SessionEvent::Disconnected);
        }
    }

    async fn handle_connection_lost(&self, reason: String) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        warn!("Connection lost: {}", reason);

        self.stop_health_check();
        // requested flag survives so the next connect re-arms the beat
        self.inner.keep_alive.stop();

        let transport = self.inner.wire.lock().await.take();
        if let Some(mut transport) = transport {
            let _ = transport.close().await;
        }

        self.emit(SessionEvent::ConnectionLost { reason });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let mut pending = self.inner.reconnect.lock();
        if pending.is_some() {
            debug!("Reconnect already pending");
            return;
        }

        let token = CancellationToken::new();
        *pending = Some(token.clone());
        drop(pending);

        self.set_state(ConnectionState::Reconnecting);

        let delay = self.inner.config.reconnect_interval;
        let weak = Arc::downgrade(&self.inner);
        info!("Reconnect in {}ms", delay.as_millis());

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {},
            }

            let Some(session) = Self::from_weak(&weak) else {
                return;
            };
            {
                let mut pending = session.inner.reconnect.lock();
                if token.is_cancelled() {
                    return;
                }
                pending.take();
            }

            if let Err(e) = session.connect_inner(true).await {
                debug!("Reconnect attempt failed: {}", e);
            }
        });
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.inner.reconnect.lock().take() {
            token.cancel();
        }
    }

    // ========================================================================
    // Health check
    // ========================================================================

    fn start_health_check(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.inner.health_check.lock().replace(token.clone()) {
            old.cancel();
        }

        let period = self.inner.config.health_check_interval;
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                let Some(session) = Self::from_weak(&weak) else {
                    break;
                };
                session.health_check().await;
            }
        });
    }

    fn stop_health_check(&self) {
        if let Some(token) = self.inner.health_check.lock().take() {
            token.cancel();
        }
    }

    /// One un-retried read of the status register
    async fn health_check(&self) {
        let register = &self.inner.config.health_check_register;
        let descriptor = match self.inner.catalog.lookup(register) {
            Ok(d) => d,
            Err(e) => {
                warn!("Health check skipped: {}", e);
                return;
            },
        };

        let request = Request::ReadHolding {
            address: descriptor.address,
            count: descriptor.word_count,
        };
        match self.exchange(&request).await {
            Ok(_) => trace!("Health check ok"),
            Err(e) => {
                warn!("Health check failed: {}", e);
                self.handle_connection_lost(format!("health check failed: {e}"))
                    .await;
            },
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    /// Start the periodic heartbeat write
    ///
    /// If the link is down the request is remembered and the beat starts on
    /// the next successful connect.
    pub fn start_keep_alive(&self) {
        self.inner.keep_alive_requested.store(true, Ordering::SeqCst);
        if self.is_connected() {
            self.arm_keep_alive();
        }
    }

    pub fn stop_keep_alive(&self) {
        self.inner.keep_alive_requested.store(false, Ordering::SeqCst);
        self.inner.keep_alive.stop();
    }

    pub fn keep_alive_active(&self) -> bool {
        self.inner.keep_alive.is_active()
    }

    fn arm_keep_alive(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.keep_alive.start(move || {
            let session = Self::from_weak(&weak);
            async move {
                let session = session.ok_or(ChargerError::NotConnected)?;
                session
                    .write_register(KEEP_ALIVE_REGISTER, RegisterValue::U16(KEEP_ALIVE_VALUE))
                    .await
            }
        });
    }

    // ========================================================================
    // Register operations
    // ========================================================================

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChargerError::NotConnected)
        }
    }

    fn readable(&self, name: &str) -> Result<&RegisterDescriptor> {
        let descriptor = self.inner.catalog.lookup(name)?;
        if !descriptor.access.readable() {
            return Err(ChargerError::AccessViolation {
                register: name.to_string(),
                operation: "readable",
            });
        }
        Ok(descriptor)
    }

    fn writable(&self, name: &str) -> Result<&RegisterDescriptor> {
        let descriptor = self.inner.catalog.lookup(name)?;
        if !descriptor.access.writable() {
            return Err(ChargerError::AccessViolation {
                register: name.to_string(),
                operation: "writable",
            });
        }
        Ok(descriptor)
    }

    /// Read and decode one register
    pub async fn read_register(&self, name: &str) -> Result<RegisterValue> {
        let descriptor = self.readable(name)?;
        self.ensure_connected()?;

        let request = Request::ReadHolding {
            address: descriptor.address,
            count: descriptor.word_count,
        };
        let words = self.exchange_with_retry(name, &request).await?;
        codec::decode(descriptor.data_type, &words)
    }

    /// Encode and write one register
    ///
    /// Single-word registers use FC 0x06, wider ones FC 0x10.
    pub async fn write_register(&self, name: &str, value: RegisterValue) -> Result<()> {
        let descriptor = self.writable(name)?;
        let words = codec::encode(descriptor.data_type, &value)?;
        if words.len() != usize::from(descriptor.word_count) {
            return Err(ChargerError::encode(format!(
                "{name} spans {} word(s), encoded {}",
                descriptor.word_count,
                words.len()
            )));
        }
        self.ensure_connected()?;

        let request = if descriptor.word_count == 1 {
            Request::WriteSingle {
                address: descriptor.address,
                value: words[0],
            }
        } else {
            Request::WriteMultiple {
                address: descriptor.address,
                values: words,
            }
        };
        self.exchange_with_retry(name, &request).await?;
        debug!("Wrote {} = {}", name, value);
        Ok(())
    }

    /// Read several registers one after another
    ///
    /// A failed read yields `None` for that name; the batch never aborts.
    /// Results keep the input order.
    pub async fn read_many<I, S>(&self, names: I) -> Vec<(String, Option<RegisterValue>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = Vec::new();
        for name in names {
            let name = name.as_ref();
            let value = match self.read_register(name).await {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("read_many: {} - {}", name, e);
                    None
                },
            };
            results.push((name.to_string(), value));
        }
        results
    }

    /// Bounded retry loop around [`Self::exchange`]
    async fn exchange_with_retry(&self, name: &str, request: &Request) -> Result<Vec<u16>> {
        let attempts = self.inner.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.exchange(request).await {
                Ok(words) => return Ok(words),
                Err(e) if e.is_connection_loss() => {
                    self.handle_connection_lost(e.to_string()).await;
                    return Err(e);
                },
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("{}: attempt {}/{} failed: {}", name, attempt, attempts, e);
                    attempt += 1;
                    sleep(self.inner.config.retry_delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/response exchange under the wire lock
    async fn exchange(&self, request: &Request) -> Result<Vec<u16>> {
        let mut wire = self.inner.wire.lock().await;
        let transport = wire.as_mut().ok_or(ChargerError::NotConnected)?;
        let window = self.inner.config.response_timeout;

        let result = timeout(window, async {
            match request {
                Request::ReadHolding { address, count } => {
                    transport.read_holding_registers(*address, *count).await
                },
                Request::WriteSingle { address, value } => transport
                    .write_single_register(*address, *value)
                    .await
                    .map(|_| Vec::new()),
                Request::WriteMultiple { address, values } => transport
                    .write_multiple_registers(*address, values)
                    .await
                    .map(|_| Vec::new()),
            }
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => Err(ChargerError::timeout(format!(
                "no response to FC {:02X} within {}ms",
                request.function_code(),
                window.as_millis()
            ))),
        }
    }
}
