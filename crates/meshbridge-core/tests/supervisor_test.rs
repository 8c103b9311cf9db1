#![allow(clippy::unwrap_used)]
// Link lifecycle: start, retry, stop, soft reset and the idle watchdog.

mod common;

use std::time::Duration;

use meshbridge_api::{CoordinatorEvent, Decoder, Device, DeviceType, MappedDevice, ResetMode};
use meshbridge_core::testing::{COORDINATOR_IDENTITY, StaticRegistry, end_device, report};
use meshbridge_core::{BridgeError, BridgeEvent, LinkState, Owner};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{SENSOR, Setup, WEATHER_MODEL, next_event, passthrough, started, wait_until};

fn weather() -> StaticRegistry {
    StaticRegistry::new().with_model(
        WEATHER_MODEL,
        MappedDevice::new("WSDCGQ11LM", "Xiaomi")
            .with_decoder(Decoder::new("msTemperatureMeasurement", ["attributeReport"], passthrough)),
    )
}

// ── Start ───────────────────────────────────────────────────────────

#[tokio::test]
async fn start_announces_link_and_closes_joining() {
    let harness = Setup::new(weather()).build();
    let mut events = harness.bridge.events();

    harness.bridge.init().await;

    assert_eq!(harness.bridge.supervisor().state(), LinkState::Started);
    assert_eq!(harness.coordinator.starts(), 1);
    assert_eq!(harness.coordinator.permit_join_calls(), vec![false]);
    assert!(harness.bridge.supervisor().watchdog_deadline().is_some());

    next_event(&mut events, |e| matches!(e, BridgeEvent::PermitJoin(false))).await;
    next_event(&mut events, |e| matches!(e, BridgeEvent::Started)).await;
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let harness = started(weather()).await;

    harness.bridge.supervisor().start().await;

    assert_eq!(harness.coordinator.starts(), 1);
    assert_eq!(harness.factory.creations(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_start_is_retried_after_the_interval() {
    let harness = Setup::new(weather()).build();
    harness.coordinator.fail_next_starts(1);
    let mut events = harness.bridge.events();

    harness.bridge.init().await;

    assert_eq!(harness.bridge.supervisor().state(), LinkState::Error);
    next_event(&mut events, |e| matches!(e, BridgeEvent::LinkError(_))).await;
    next_event(&mut events, |e| matches!(e, BridgeEvent::Stopped)).await;
    let failure = next_event(&mut events, |e| matches!(e, BridgeEvent::StartError(_))).await;
    assert!(matches!(&*failure, BridgeEvent::StartError(m) if m.contains("serial port not found")));

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_until("retried start", || harness.bridge.supervisor().is_started()).await;

    assert_eq!(harness.coordinator.starts(), 2);
    assert_eq!(harness.factory.creations(), 2);
    // The half-started first link was torn down before the retry.
    assert_eq!(harness.coordinator.adapter_stops(), 1);
}

// ── Stop ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_takes_the_link_down() {
    let harness = started(weather()).await;
    let mut events = harness.bridge.events();

    harness.bridge.supervisor().stop().await.unwrap();

    assert_eq!(harness.bridge.supervisor().state(), LinkState::Idle);
    assert_eq!(harness.coordinator.stops(), 1);
    assert!(harness.bridge.supervisor().watchdog_deadline().is_none());
    next_event(&mut events, |e| matches!(e, BridgeEvent::Stopped)).await;
}

#[tokio::test]
async fn stop_before_start_is_quiet() {
    let harness = Setup::new(weather()).build();

    harness.bridge.supervisor().stop().await.unwrap();

    assert_eq!(harness.coordinator.stops(), 0);
    assert_eq!(harness.bridge.supervisor().state(), LinkState::Idle);
}

#[tokio::test]
async fn failing_stop_requests_exit() {
    let harness = started(weather()).await;
    harness.coordinator.fail_stop(true);
    let mut events = harness.bridge.events();

    let err = harness.bridge.supervisor().stop().await.unwrap_err();

    assert!(err.is_connection());
    let exit = next_event(&mut events, |e| matches!(e, BridgeEvent::Exit { .. })).await;
    assert!(matches!(&*exit, BridgeEvent::Exit { code: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn stop_gives_up_on_a_start_that_never_settles() {
    let harness = Setup::new(weather()).build();
    harness.coordinator.set_start_delay(Duration::from_secs(30));
    let mut events = harness.bridge.events();

    let supervisor = harness.bridge.supervisor().clone();
    tokio::spawn(async move { supervisor.start().await });
    wait_until("link starting", || harness.bridge.supervisor().state() == LinkState::Starting).await;

    let err = harness.bridge.supervisor().stop().await.unwrap_err();

    assert!(matches!(err, BridgeError::Timeout { timeout_secs: 5 }));
    let exit = next_event(&mut events, |e| matches!(e, BridgeEvent::Exit { .. })).await;
    assert!(
        matches!(&*exit, BridgeEvent::Exit { reason, code: 1 } if reason == "Timeout error on stop coordinator")
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_queued_behind_stop_keeps_the_link_down() {
    let harness = started(weather()).await;
    harness.coordinator.set_stop_delay(Duration::from_secs(1));

    let supervisor = harness.bridge.supervisor().clone();
    let stopping = tokio::spawn(async move { supervisor.stop().await });
    wait_until("stop in flight", || harness.coordinator.stops() == 1).await;
    harness.coordinator.emit(CoordinatorEvent::AdapterDisconnected);

    stopping.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.bridge.supervisor().state(), LinkState::Idle);
    assert_eq!(harness.coordinator.starts(), 1);
    assert_eq!(harness.factory.creations(), 1);
    assert!(harness.bridge.supervisor().soft_reset().await.unwrap_err().is_connection());

    // An explicit start lifts the stop.
    harness.bridge.supervisor().start().await;
    assert!(harness.bridge.supervisor().is_started());
    assert_eq!(harness.coordinator.starts(), 2);
}

// ── Soft reset / watchdog ───────────────────────────────────────────

#[tokio::test]
async fn soft_reset_restarts_and_rearms_the_watchdog() {
    let harness = started(weather()).await;
    let mut events = harness.bridge.events();

    harness
        .bridge
        .set_property(&Owner::Device, "soft-reset", "true")
        .await
        .unwrap();

    wait_until("soft reset", || {
        harness.coordinator.resets() == vec![ResetMode::Soft] && harness.coordinator.starts() == 2
    })
    .await;
    wait_until("link back up", || harness.bridge.supervisor().is_started()).await;
    assert!(harness.bridge.supervisor().watchdog_deadline().is_some());
    next_event(&mut events, |e| matches!(e, BridgeEvent::Stopped)).await;
    next_event(&mut events, |e| matches!(e, BridgeEvent::Started)).await;
}

#[tokio::test]
async fn soft_reset_needs_a_started_link() {
    let harness = Setup::new(weather()).build();
    harness.bridge.registry().attach().await;

    let err = harness
        .bridge
        .set_property(&Owner::Device, "soft-reset", "true")
        .await
        .unwrap_err();

    assert!(err.is_connection());
    assert!(harness.coordinator.resets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_link_is_soft_reset() {
    let harness = started(weather()).await;

    tokio::time::advance(Duration::from_secs(601)).await;

    wait_until("watchdog reset", || harness.coordinator.resets() == vec![ResetMode::Soft]).await;
    wait_until("link back up", || harness.bridge.supervisor().is_started()).await;
    assert_eq!(harness.coordinator.starts(), 2);
    assert!(harness.bridge.supervisor().watchdog_deadline().is_some());
}

#[tokio::test(start_paused = true)]
async fn admitted_traffic_keeps_the_watchdog_quiet() {
    let harness = started(weather()).await;
    let device = end_device(SENSOR, WEATHER_MODEL);
    let mut events = harness.bridge.events();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(300)).await;
        harness
            .coordinator
            .emit_message(report(&device, "msTemperatureMeasurement", json!({"temperature": 21})));
        next_event(&mut events, |e| matches!(e, BridgeEvent::Message { .. })).await;
    }

    assert!(harness.coordinator.resets().is_empty());
    assert!(harness.bridge.supervisor().last_message().borrow().is_some());
}

#[tokio::test(start_paused = true)]
async fn filtered_traffic_leaves_the_watchdog_alone() {
    let harness = started(weather()).await;
    let mut events = harness.bridge.events();
    let armed = harness.bridge.supervisor().watchdog_deadline().unwrap();
    tokio::time::advance(Duration::from_secs(60)).await;

    let unsupported = end_device("0x00158d0000000099", "lumi.unknown");
    harness
        .coordinator
        .emit_message(report(&unsupported, "msTemperatureMeasurement", json!({"temperature": 20})));
    // Coordinator events are forwarded in order, so the report is handled
    // once this error reaches the bus.
    harness.coordinator.emit(CoordinatorEvent::Error("marker".into()));
    next_event(&mut events, |e| matches!(e, BridgeEvent::LinkError(_))).await;

    assert_eq!(harness.bridge.supervisor().watchdog_deadline(), Some(armed));
    assert!(harness.bridge.supervisor().last_message().borrow().is_none());

    let sensor = end_device(SENSOR, WEATHER_MODEL);
    harness
        .coordinator
        .emit_message(report(&sensor, "msTemperatureMeasurement", json!({"temperature": 20})));
    next_event(&mut events, |e| matches!(e, BridgeEvent::Message { .. })).await;

    assert!(harness.bridge.supervisor().watchdog_deadline().unwrap() > armed);
}

// ── Admission ───────────────────────────────────────────────────────

#[tokio::test]
async fn only_admitted_messages_reach_the_bus() {
    let harness = started(weather()).await;
    let mut events = harness.bridge.events();

    let coordinator = Device::new(COORDINATOR_IDENTITY, DeviceType::Coordinator);
    let unsupported = end_device("0x00158d0000000099", "lumi.unknown");
    let sensor = end_device(SENSOR, WEATHER_MODEL);

    for device in [&coordinator, &unsupported, &sensor] {
        harness
            .coordinator
            .emit_message(report(device, "msTemperatureMeasurement", json!({"temperature": 20})));
    }

    let admitted = next_event(&mut events, |e| matches!(e, BridgeEvent::Message { .. })).await;
    match &*admitted {
        BridgeEvent::Message { message, mapped } => {
            assert_eq!(message.device.identity.as_str(), SENSOR);
            assert_eq!(mapped.model, "WSDCGQ11LM");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn adapter_disconnect_reconnects() {
    let harness = started(weather()).await;
    let mut events = harness.bridge.events();

    harness
        .coordinator
        .emit(CoordinatorEvent::AdapterDisconnected);

    next_event(&mut events, |e| matches!(e, BridgeEvent::Stopped)).await;
    next_event(&mut events, |e| matches!(e, BridgeEvent::Started)).await;
    assert_eq!(harness.coordinator.starts(), 2);
    assert_eq!(harness.factory.creations(), 2);
}

#[tokio::test]
async fn destroy_stops_the_link() {
    let harness = started(weather()).await;
    let permitjoin = harness.bridge.registry().bridge_property("permitjoin").unwrap();

    harness.bridge.destroy().await;

    assert_eq!(harness.coordinator.stops(), 1);
    assert!(permitjoin.is_detached());
}
