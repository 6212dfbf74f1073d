//! Session behaviour against a scripted in-memory device
//!
//! All tests run on a paused clock, so retry delays, reconnect intervals and
//! keep-alive periods elapse instantly and deterministically.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;

use common::*;
use evse_modbus::catalog::KEEP_ALIVE_VALUE;
use evse_modbus::frame::{FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use evse_modbus::{ChargerError, ConnectionState, RegisterValue, SessionEvent};

const HEARTBEAT_ADDRESS: u16 = 399;

// ============================================================================
// Preconditions: rejected before any wire I/O
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unknown_register_fails_without_io() {
    let (session, device) = connected_session().await;

    let err = session.read_register("no_such_register").await.unwrap_err();
    assert_eq!(err, ChargerError::UnknownRegister("no_such_register".into()));
    assert_eq!(device.exchanges(), 0);

    let err = session
        .write_register("no_such_register", RegisterValue::U16(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChargerError::UnknownRegister(_)));
    assert_eq!(device.exchanges(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_register_reported_before_connection_state() {
    let (session, device) = session_with(test_config());

    let err = session.read_register("bogus").await.unwrap_err();
    assert!(matches!(err, ChargerError::UnknownRegister(_)));
    assert_eq!(device.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_register_is_write_only() {
    let (session, device) = connected_session().await;

    let err = session.read_register("heartbeat").await.unwrap_err();
    assert!(matches!(err, ChargerError::AccessViolation { .. }));

    let err = session
        .write_register("firmware_version", RegisterValue::U16(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChargerError::AccessViolation { .. }));
    assert_eq!(device.exchanges(), 0);
}

#[tokio::test(start_paused = true)]
async fn operations_require_connection() {
    let (session, device) = session_with(test_config());

    let err = session.read_register("charge_point_state").await.unwrap_err();
    assert_eq!(err, ChargerError::NotConnected);

    let err = session
        .write_register("charging_current_limit", RegisterValue::U16(16))
        .await
        .unwrap_err();
    assert_eq!(err, ChargerError::NotConnected);
    assert_eq!(device.exchanges(), 0);
}

#[tokio::test(start_paused = true)]
async fn unencodable_value_fails_without_io() {
    let (session, device) = connected_session().await;

    let err = session
        .write_register("charging_current_limit", RegisterValue::U32(70_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ChargerError::Encode(_)));
    assert_eq!(device.exchanges(), 0);
}

// ============================================================================
// Typed reads and writes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reads_decode_device_word_order() {
    let (session, device) = connected_session().await;
    device.set_words(204, &[0x0000, 0x41A0]);
    device.set_words(100, &[0x3256, 0x312E]);
    device.set_words(220, &[0x1170, 0x0001]);

    assert_eq!(
        session.read_register("current_l1").await.unwrap(),
        RegisterValue::F32(20.0)
    );
    assert_eq!(
        session.read_register("firmware_version").await.unwrap(),
        RegisterValue::Text("V2.1".into())
    );
    assert_eq!(
        session.read_register("energy_meter").await.unwrap(),
        RegisterValue::U32(70_000)
    );
}

#[tokio::test(start_paused = true)]
async fn write_picks_function_code_by_width() {
    let (session, device) = connected_session().await;

    session
        .write_register("charging_current_limit", RegisterValue::U16(16))
        .await
        .unwrap();
    session
        .write_register("charging_power_limit", RegisterValue::F32(20.0))
        .await
        .unwrap();
    session
        .write_register("session_energy_limit", RegisterValue::U32(70_000))
        .await
        .unwrap();

    let writes = device.writes();
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0].function, FC_WRITE_SINGLE_REGISTER);
    assert_eq!(writes[0].values, vec![16]);
    assert_eq!(writes[1].function, FC_WRITE_MULTIPLE_REGISTERS);
    assert_eq!(writes[1].address, 302);
    assert_eq!(writes[1].values, vec![0x0000, 0x41A0]);
    assert_eq!(writes[2].values, vec![0x1170, 0x0001]);
}

#[tokio::test(start_paused = true)]
async fn read_many_keeps_order_and_absorbs_failures() {
    let (session, device) = connected_session().await;
    device.set_word(200, 2);
    device.set_words(204, &[0x0000, 0x41A0]);

    let results = session
        .read_many(["charge_point_state", "missing", "heartbeat", "current_l1"])
        .await;

    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        ["charge_point_state", "missing", "heartbeat", "current_l1"]
    );
    assert_eq!(results[0].1, Some(RegisterValue::U16(2)));
    assert_eq!(results[1].1, None);
    assert_eq!(results[2].1, None);
    assert_eq!(results[3].1, Some(RegisterValue::F32(20.0)));
}

// ============================================================================
// Retry policy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let (session, device) = connected_session().await;
    device.set_word(200, 3);
    // max_retries = 3: fail twice, succeed on the last attempt
    device.push_faults(&[Fault::Io, Fault::Io]);

    let value = session.read_register("charge_point_state").await.unwrap();
    assert_eq!(value, RegisterValue::U16(3));
    assert_eq!(device.exchanges(), 3);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_surfaces_last_error() {
    let (session, device) = connected_session().await;
    device.push_faults(&[Fault::Io, Fault::Io, Fault::Io, Fault::Io]);

    let started = tokio::time::Instant::now();
    let err = session.read_register("charge_point_state").await.unwrap_err();
    assert!(matches!(err, ChargerError::Io(_)));
    assert_eq!(device.exchanges(), 3);
    // two 500 ms pauses between three attempts
    assert!(started.elapsed() >= Duration::from_millis(1000));
    // I/O noise alone does not drop the link
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn timeout_tears_down_and_reconnects() {
    let (session, device) = connected_session().await;
    let mut events = session.subscribe();
    device.set_sticky_fault(Some(Fault::Hang));

    let err = session.read_register("charge_point_state").await.unwrap_err();
    assert!(matches!(err, ChargerError::Timeout(_)));
    assert_eq!(device.exchanges(), 1);
    assert_ne!(session.state(), ConnectionState::Connected);
    assert_eq!(device.closes.load(Ordering::SeqCst), 1);

    let event = expect_event(&mut events, Duration::from_millis(10), |e| {
        matches!(e, SessionEvent::ConnectionLost { .. })
    })
    .await;
    assert!(matches!(event, SessionEvent::ConnectionLost { reason } if reason.contains("Timeout")));

    device.set_sticky_fault(None);
    assert_eq!(device.opens(), 1);
    expect_event(&mut events, Duration::from_secs(6), |e| {
        *e == SessionEvent::Connected
    })
    .await;
    assert_eq!(device.opens(), 2);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn closed_port_is_not_retried() {
    let (session, device) = connected_session().await;
    device.push_faults(&[Fault::Closed]);

    let err = session
        .write_register("charging_enabled", RegisterValue::U16(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChargerError::PortClosed(_)));
    assert_eq!(device.exchanges(), 1);
    assert_eq!(session.state(), ConnectionState::Reconnecting);
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_connect_emits_error_and_schedules_one_reconnect() {
    let (session, device) = session_with(test_config());
    let mut events = session.subscribe();
    device.fail_open.store(true, Ordering::SeqCst);

    assert!(session.connect().await.is_err());
    assert!(session.connect().await.is_err());
    assert_eq!(device.opens(), 2);
    assert_eq!(session.state(), ConnectionState::Reconnecting);
    assert!(matches!(
        events.try_recv(),
        Ok(SessionEvent::Error { .. })
    ));

    // only one pending attempt despite two failures
    sleep(Duration::from_millis(5100)).await;
    assert_eq!(device.opens(), 3);

    // keeps trying on the same interval
    sleep(Duration::from_secs(5)).await;
    assert_eq!(device.opens(), 4);

    device.fail_open.store(false, Ordering::SeqCst);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(device.opens(), 5);
    assert_eq!(session.state(), ConnectionState::Connected);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(device.opens(), 5);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_cancels_reconnect() {
    let (session, device) = connected_session().await;
    let mut events = session.subscribe();

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Disconnected);
    assert_eq!(device.closes.load(Ordering::SeqCst), 1);

    session.disconnect().await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    // a pending reconnect dies with the disconnect
    device.fail_open.store(true, Ordering::SeqCst);
    assert!(session.connect().await.is_err());
    session.disconnect().await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(device.opens(), 2);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn health_check_failure_triggers_connection_lost() {
    let (session, device) = connected_session().await;
    let mut events = session.subscribe();
    device.set_sticky_fault(Some(Fault::Hang));

    let event = expect_event(&mut events, Duration::from_secs(31), |e| {
        matches!(e, SessionEvent::ConnectionLost { .. })
    })
    .await;
    assert!(
        matches!(event, SessionEvent::ConnectionLost { reason } if reason.contains("health check"))
    );
    // single un-retried probe
    assert_eq!(device.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn healthy_link_is_probed_every_thirty_seconds() {
    let (session, device) = connected_session().await;

    sleep(Duration::from_millis(29_900)).await;
    assert_eq!(device.reads.load(Ordering::SeqCst), 0);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(device.reads.load(Ordering::SeqCst), 2);
    assert!(session.is_connected());
}

// ============================================================================
// Keep-alive
// ============================================================================

#[tokio::test(start_paused = true)]
async fn keep_alive_writes_heartbeat_on_schedule() {
    let (session, device) = connected_session().await;
    session.start_keep_alive();
    assert!(session.keep_alive_active());

    sleep(Duration::from_millis(2100)).await;
    let writes = device.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].address, HEARTBEAT_ADDRESS);
    assert_eq!(writes[0].function, FC_WRITE_SINGLE_REGISTER);
    assert_eq!(writes[0].values, vec![KEEP_ALIVE_VALUE]);

    sleep(Duration::from_secs(9)).await;
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 2);

    session.stop_keep_alive();
    assert!(!session.keep_alive_active());
    sleep(Duration::from_secs(30)).await;
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 2);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_failure_does_not_stop_the_beat() {
    let config = evse_modbus::SessionConfig {
        max_retries: 1,
        ..test_config()
    };
    let (session, device) = session_with(config);
    session.connect().await.unwrap();
    session.start_keep_alive();
    device.push_faults(&[Fault::Io]);

    sleep(Duration::from_millis(11_100)).await;
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 1);
    assert!(session.keep_alive_active());
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn keep_alive_rearms_after_reconnect() {
    let (session, device) = connected_session().await;
    session.start_keep_alive();
    // the first beat finds the port gone
    device.push_faults(&[Fault::Closed]);

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(session.state(), ConnectionState::Reconnecting);
    assert!(!session.keep_alive_active());

    // reconnect at ~7 s, first beat 2 s later
    sleep(Duration::from_millis(7400)).await;
    assert_eq!(device.opens(), 2);
    assert!(session.keep_alive_active());
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 1);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_requested_before_connect_starts_on_connect() {
    let (session, device) = session_with(test_config());
    session.start_keep_alive();
    assert!(!session.keep_alive_active());

    session.connect().await.unwrap();
    assert!(session.keep_alive_active());

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 1);

    session.disconnect().await;
    assert!(!session.keep_alive_active());
}

#[tokio::test(start_paused = true)]
async fn keep_alive_and_reads_never_overlap_on_the_wire() {
    let (session, device) = connected_session().await;
    device.set_word(200, 2);
    session.start_keep_alive();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let session = session.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..600 {
                session.read_register("charge_point_state").await.unwrap();
            }
        }));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    // 2400 reads of 5 ms each span the beats at 2 s and 11 s
    assert!(device.writes_to(HEARTBEAT_ADDRESS) >= 2);
    assert!(!device.overlap.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn dropping_last_handle_stops_background_tasks() {
    let (session, device) = connected_session().await;
    session.start_keep_alive();
    drop(session);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(device.writes_to(HEARTBEAT_ADDRESS), 0);
    assert_eq!(device.reads.load(Ordering::SeqCst), 0);
}
