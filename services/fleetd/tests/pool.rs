//! Integration tests for the instance pool: registry, aggregation,
//! startup and reconfiguration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fleet_events::{ConnectionState, FleetEvent, InstanceKind, ModeName};
use fleet_supervisor::connection::{ConnectionEvent, MockBehavior, TelemetryUpdate};
use fleet_supervisor::{ConfigPatch, MemoryRoster, MockConnector, RosterStore, SingleConnectOptions};

#[tokio::test(start_paused = true)]
async fn test_add_twice_while_pending_keeps_one_supervisor() {
    let h = Harness::with_connector(MockConnector::with_default(MockBehavior::Silent));
    let s1 = id("s1");

    let first = h.pool.add_instance(full("s1")).await.unwrap();
    let second = h.pool.add_instance(full("s1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(first.id, second.id);
    assert_eq!(h.pool.len().await, 1);
    assert_eq!(h.connector.open_count(&host("s1")), 1);
    assert_eq!(
        h.pool.get_status(&s1).await.unwrap().state,
        ConnectionState::Connecting
    );
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_add_existing_disconnected_instance_reconnects_it() {
    let h = Harness::with_connector(MockConnector::refusing());
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    let repairing = wait_for_state(&h.pool, &s1, ConnectionState::Repairing).await;

    h.connector.set_host_behavior(&host("s1"), MockBehavior::Ready);
    h.pool.add_instance(full("s1")).await.unwrap();
    let status = wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    // Same supervisor: the failure history carried over.
    assert_eq!(status.retry.repairs, repairing.retry.repairs);
    assert_eq!(h.pool.len().await, 1);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_picks_connected_representative() {
    let roster = Arc::new(MemoryRoster::new());
    for raw in ["s1", "s2", "s3"] {
        let mut config = full(raw);
        config.auto_connect = false;
        roster.upsert_instance(&config).unwrap();
    }
    let h = Harness::with_roster(roster);
    assert_eq!(h.pool.start().await.unwrap(), 3);

    let s2 = id("s2");
    h.pool.connect_instance(&s2).await.unwrap();
    h.connector
        .emit(
            &host("s2"),
            ConnectionEvent::Telemetry(TelemetryUpdate {
                health: Some(17.0),
                ..Default::default()
            }),
        )
        .await;
    wait_for(&h.pool, &s2, "telemetry", |s| s.telemetry.health == Some(17.0)).await;

    let aggregate = h.pool.get_aggregate_status().await;
    assert!(aggregate.connected);
    assert_eq!(aggregate.connected_bots, 1);
    assert_eq!(aggregate.total_bots, 3);
    let representative = aggregate.representative.unwrap();
    assert_eq!(representative.id, s2);
    assert_eq!(representative.telemetry.health, Some(17.0));

    let order: Vec<_> = aggregate.instances.iter().map(|i| i.id.to_string()).collect();
    assert_eq!(order, ["s1", "s2", "s3"]);

    // Reading the aggregate changes nothing.
    assert_eq!(
        h.pool.get_status(&id("s1")).await.unwrap().state,
        ConnectionState::Disconnected
    );
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_failures_are_isolated() {
    let roster = Arc::new(MemoryRoster::new());
    roster.upsert_instance(&full("bad")).unwrap();
    roster.upsert_instance(&full("good")).unwrap();
    let h = Harness::with_roster(roster);
    h.connector
        .set_host_behavior(&host("bad"), MockBehavior::Refuse("nope".to_string()));

    h.pool.start().await.unwrap();

    wait_for_state(&h.pool, &id("good"), ConnectionState::Connected).await;
    wait_for_state(&h.pool, &id("bad"), ConnectionState::Repairing).await;
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_display_name_update_keeps_session() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    let patch = ConfigPatch {
        display_name: Some("Lobby".to_string()),
        ..Default::default()
    };
    h.pool.update_instance_config(&s1, patch).await.unwrap();
    let status = wait_for(&h.pool, &s1, "rename", |s| s.display_name == "Lobby").await;

    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(h.connector.open_count(&host("s1")), 1);
    let stored = h.roster.load_roster().unwrap();
    assert_eq!(stored[0].display_name.as_deref(), Some("Lobby"));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_address_update_rebuilds_supervisor() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    let patch = ConfigPatch {
        host: Some("moved.local".to_string()),
        ..Default::default()
    };
    h.pool.update_instance_config(&s1, patch).await.unwrap();
    let status = wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    assert_eq!(status.address, "moved.local:25565");
    assert_eq!(h.connector.live_handles(&host("s1")), 0);
    assert_eq!(h.connector.live_handles("moved.local"), 1);
    assert_eq!(h.roster.load_roster().unwrap()[0].host, "moved.local");
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_switch_kind_to_status_only() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    let status = h
        .pool
        .switch_kind(&s1, InstanceKind::StatusOnly)
        .await
        .unwrap();
    assert_eq!(status.kind, InstanceKind::StatusOnly);
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    assert_eq!(h.connector.live_handles(&host("s1")), 0);
    assert!(h.prober.probe_count(&host("s1")) >= 1);
    assert_eq!(
        h.roster.load_roster().unwrap()[0].kind,
        InstanceKind::StatusOnly
    );
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_single_replaces_default_instance() {
    let h = Harness::new();
    let first = SingleConnectOptions {
        host: "one.local".to_string(),
        ..Default::default()
    };
    let second = SingleConnectOptions {
        host: "two.local".to_string(),
        ..Default::default()
    };

    let status = h.pool.connect_single(first).await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    let status = h.pool.connect_single(second).await.unwrap();
    assert_eq!(status.address, "two.local:25565");

    assert_eq!(h.pool.len().await, 1);
    assert_eq!(h.connector.live_handles("one.local"), 0);
    assert_eq!(h.connector.live_handles("two.local"), 1);
    // Never written to the roster.
    assert!(h.roster.load_roster().unwrap().is_empty());
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_and_aggregate_relay() {
    let h = Harness::new();
    let mut events = h.pool.subscribe();
    let relay = h.pool.spawn_aggregate_relay();

    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &id("s1"), ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut saw_connected_status = false;
    let mut saw_log = false;
    let mut saw_connected_aggregate = false;
    while let Ok(event) = events.try_recv() {
        match event {
            FleetEvent::InstanceStatus { status, .. } => {
                saw_connected_status |= status.state == ConnectionState::Connected;
            }
            FleetEvent::Log { entry } => saw_log |= entry.instance_id == Some(id("s1")),
            FleetEvent::Aggregate { status } => {
                saw_connected_aggregate |= status.connected_bots == 1;
            }
            FleetEvent::InstanceRemoved { .. } => {}
        }
    }
    assert!(saw_connected_status);
    assert!(saw_log);
    assert!(saw_connected_aggregate);

    h.pool.remove_instance(&id("s1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_removed = false;
    while let Ok(event) = events.try_recv() {
        saw_removed |= matches!(event, FleetEvent::InstanceRemoved { .. });
    }
    assert!(saw_removed);
    relay.abort();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_sessions_and_keeps_roster() {
    let h = Harness::new();
    for raw in ["s1", "s2"] {
        h.pool.add_instance(full(raw)).await.unwrap();
        wait_for_state(&h.pool, &id(raw), ConnectionState::Connected).await;
    }

    h.pool.shutdown().await;

    assert!(h.pool.is_empty().await);
    assert_eq!(h.connector.live_handles(&host("s1")), 0);
    assert_eq!(h.connector.live_handles(&host("s2")), 0);
    assert_eq!(h.roster.load_roster().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_only_touches_disconnected() {
    let roster = Arc::new(MemoryRoster::new());
    for raw in ["s1", "s2"] {
        let mut config = full(raw);
        config.auto_connect = false;
        roster.upsert_instance(&config).unwrap();
    }
    let h = Harness::with_roster(roster);
    h.pool.start().await.unwrap();
    h.pool.connect_instance(&id("s1")).await.unwrap();

    assert_eq!(h.pool.connect_all().await, 1);
    wait_for_state(&h.pool, &id("s2"), ConnectionState::Connected).await;
    assert_eq!(h.connector.open_count(&host("s1")), 1);

    assert_eq!(h.pool.disconnect_all().await, 2);
    assert!(h.roster.load_roster().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_modes_survive_reconnect_via_pool() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    let modes = h.pool.set_mode(&s1, ModeName::Mining, true).await.unwrap();
    assert!(modes.is_enabled(ModeName::Mining));

    h.connector.emit(&host("s1"), ConnectionEvent::Closed).await;
    let status = wait_for(&h.pool, &s1, "reconnect", |s| {
        s.connected && s.retry.repairs == 1
    })
    .await;
    assert!(status.modes.is_enabled(ModeName::Mining));
    h.pool.shutdown().await;
}
