//! Integration tests for mode restoration after (re)connects.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fleet_events::{ConnectionState, ModeName, ModeSet};
use fleet_supervisor::connection::ConnectionEvent;
use fleet_supervisor::{PoolError, RosterStore, SqliteRoster, SupervisorError};

/// Longer than the settle delay.
const SETTLE: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn test_restoration_follows_group_order() {
    let h = Harness::new();
    let s1 = id("s1");
    let mut config = full("s1");
    config.modes = ModeName::ALL.iter().rev().copied().collect();
    h.pool.add_instance(config).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        h.effector.activations(),
        [
            ModeName::AiView,
            ModeName::Follow,
            ModeName::Patrol,
            ModeName::Mining,
            ModeName::AutoAttack,
            ModeName::Invincible,
            ModeName::AutoChat,
        ]
    );
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_mode_is_disabled_alone() {
    let h = Harness::new();
    let s1 = id("s1");
    h.effector.fail(ModeName::Patrol);
    let mut config = full("s1");
    config.modes = [ModeName::Follow, ModeName::Patrol, ModeName::AutoAttack]
        .into_iter()
        .collect();
    h.pool.add_instance(config).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        h.effector.activations(),
        [ModeName::Follow, ModeName::Patrol, ModeName::AutoAttack]
    );
    let status = h.pool.get_status(&s1).await.unwrap();
    assert!(status.modes.is_enabled(ModeName::Follow));
    assert!(!status.modes.is_enabled(ModeName::Patrol));
    assert!(status.modes.is_enabled(ModeName::AutoAttack));
    assert_eq!(status.state, ConnectionState::Connected);

    let stored = &h.roster.load_roster().unwrap()[0];
    assert!(!stored.modes.is_enabled(ModeName::Patrol));
    assert!(stored.modes.is_enabled(ModeName::Follow));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_mode_is_not_restored() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    tokio::time::sleep(SETTLE).await;

    h.pool.set_mode(&s1, ModeName::Follow, true).await.unwrap();
    h.pool.set_mode(&s1, ModeName::Mining, true).await.unwrap();
    h.pool.set_mode(&s1, ModeName::Follow, false).await.unwrap();
    h.effector.clear();

    h.connector.emit(&host("s1"), ConnectionEvent::Closed).await;
    wait_for(&h.pool, &s1, "reconnect", |s| s.connected && s.retry.repairs == 1).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(h.effector.activations(), [ModeName::Mining]);
    let status = h.pool.get_status(&s1).await.unwrap();
    assert!(!status.modes.is_enabled(ModeName::Follow));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_stops_active_effectors() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    h.pool.set_mode(&s1, ModeName::AutoAttack, true).await.unwrap();

    h.pool.remove_instance(&s1).await.unwrap();
    assert_eq!(h.effector.deactivations(), [ModeName::AutoAttack]);
}

#[tokio::test(start_paused = true)]
async fn test_activation_failure_is_reported_and_not_recorded() {
    let h = Harness::new();
    let s1 = id("s1");
    h.effector.fail(ModeName::Invincible);
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;

    let err = h
        .pool
        .set_mode(&s1, ModeName::Invincible, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Supervisor {
            source: SupervisorError::ModeActivation {
                mode: ModeName::Invincible,
                ..
            },
            ..
        }
    ));
    let status = h.pool.get_status(&s1).await.unwrap();
    assert!(!status.modes.is_enabled(ModeName::Invincible));
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_mode_change_applies_on_connect() {
    let h = Harness::new();
    let s1 = id("s1");
    let mut config = full("s1");
    config.auto_connect = false;
    h.roster.upsert_instance(&config).unwrap();
    h.pool.start().await.unwrap();

    h.pool.set_mode(&s1, ModeName::Follow, true).await.unwrap();
    assert!(h.effector.activations().is_empty());

    h.pool.connect_instance(&s1).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(h.effector.activations(), [ModeName::Follow]);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_modes() {
    let h = Harness::new();
    let s1 = id("s1");
    h.pool.add_instance(full("s1")).await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    h.pool.set_mode(&s1, ModeName::Follow, true).await.unwrap();
    h.pool.set_mode(&s1, ModeName::Mining, true).await.unwrap();

    let modes = h.pool.stop_all_modes(&s1).await.unwrap();
    assert!(!modes.any_enabled());
    let mut stopped = h.effector.deactivations();
    stopped.sort();
    assert_eq!(stopped, [ModeName::Follow, ModeName::Mining]);
    h.pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mode_set_round_trips_through_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.db");
    let s1 = id("s1");

    let wanted: ModeSet = [ModeName::Follow, ModeName::Invincible, ModeName::AutoChat]
        .into_iter()
        .collect();
    {
        let roster: Arc<dyn RosterStore> = Arc::new(SqliteRoster::open(&path).unwrap());
        let h = Harness::with_roster(roster);
        h.pool.add_instance(full("s1")).await.unwrap();
        wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
        for mode in wanted.enabled() {
            h.pool.set_mode(&s1, mode, true).await.unwrap();
        }
        h.pool.shutdown().await;
    }

    // Second process: Invincible can no longer be activated.
    let roster: Arc<dyn RosterStore> = Arc::new(SqliteRoster::open(&path).unwrap());
    let h = Harness::with_roster(roster);
    h.effector.fail(ModeName::Invincible);
    h.pool.start().await.unwrap();
    wait_for_state(&h.pool, &s1, ConnectionState::Connected).await;
    tokio::time::sleep(SETTLE).await;

    let status = h.pool.get_status(&s1).await.unwrap();
    let expected: ModeSet = [ModeName::Follow, ModeName::AutoChat].into_iter().collect();
    assert_eq!(status.modes, expected);
    assert_eq!(
        h.effector.activations(),
        [ModeName::Follow, ModeName::Invincible, ModeName::AutoChat]
    );
    h.pool.shutdown().await;
}
