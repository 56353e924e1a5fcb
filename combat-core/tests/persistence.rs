//! Sessions survive a service restart when backed by `JsonFileStore`.

use combat_core::testing::{assert_invariants, assert_phase, sample_player, FixedStats, ManualClock, ScriptedRng};
use combat_core::{
    Action, Bestiary, CombatConfig, CombatService, Collaborators, JsonFileStore, SessionError, SessionStore,
    TurnPhase,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const START: u64 = 5_000_000;

fn service(
    store: Arc<JsonFileStore>,
    clock: &ManualClock,
    config: CombatConfig,
    rolls: impl IntoIterator<Item = f64>,
) -> CombatService {
    let stats = FixedStats::new().with_player("p1", sample_player("Lin Feng"));
    let collaborators = Collaborators::new(Arc::new(stats))
        .with_store(store)
        .with_clock(Arc::new(clock.clone()));
    CombatService::with_rng(config, collaborators, Bestiary::new(), ScriptedRng::new(rolls))
}

#[tokio::test]
async fn test_session_survives_restart() {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let clock = ManualClock::new(START);
    let store = Arc::new(JsonFileStore::new(temp.path().join("sessions"), Arc::new(clock.clone())));

    // player: hit, no crit / boar: Tusk Charge, hit, no crit
    let first = service(store.clone(), &clock, CombatConfig::default(), [0.0, 99.0, 0.0, 0.0, 99.0]);
    let session = first.start_combat("p1", "wild_boar").await.unwrap();
    let session = first
        .perform_action(session.id, &"p1".into(), Action::Attack)
        .await
        .unwrap();
    assert!(store.path_for(session.id).exists());
    drop(first);

    let second = service(store.clone(), &clock, CombatConfig::default(), []);
    let restored = second.get_combat_state(session.id).await.unwrap();
    assert_eq!(restored.id, session.id);
    assert_eq!(restored.enemy_state.current_hp, 103);
    assert_eq!(restored.player_state.current_hp, 160);
    assert_eq!(restored.log, session.log);
    assert_phase(&restored, TurnPhase::PlayerTurn);
    assert_invariants(&restored);

    let next = second
        .perform_action(session.id, &"p1".into(), Action::Defend)
        .await
        .unwrap();
    assert_eq!(next.round, 3);
}

#[tokio::test]
async fn test_restored_enemy_turn_is_repaired() {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let clock = ManualClock::new(START);
    let store = Arc::new(JsonFileStore::new(temp.path(), Arc::new(clock.clone())));
    let config = CombatConfig::new().with_enemy_turn_delay(Duration::from_secs(1));

    let first = service(store.clone(), &clock, config.clone(), [0.0, 99.0]);
    let session = first.start_combat("p1", "wild_boar").await.unwrap();
    let session = first
        .perform_action(session.id, &"p1".into(), Action::Attack)
        .await
        .unwrap();
    assert_phase(&session, TurnPhase::EnemyTurn);
    drop(first);

    clock.advance(2_000);
    let second = service(store.clone(), &clock, config, []);
    let restored = second.get_combat_state(session.id).await.unwrap();
    assert_phase(&restored, TurnPhase::PlayerTurn);
    assert_eq!(restored.round, 2);

    let saved = store.load(session.id).await.unwrap().unwrap();
    assert_eq!(saved.revision, restored.revision);
}

#[tokio::test]
async fn test_archive_deletes_file() {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let clock = ManualClock::new(START);
    let store = Arc::new(JsonFileStore::new(temp.path(), Arc::new(clock.clone())));

    let svc = service(store.clone(), &clock, CombatConfig::default(), [10.0]);
    let session = svc.start_combat("p1", "wild_boar").await.unwrap();
    svc.perform_action(session.id, &"p1".into(), Action::Flee)
        .await
        .unwrap();

    svc.archive(session.id).await.unwrap();
    assert!(!store.path_for(session.id).exists());

    let fresh = service(store, &clock, CombatConfig::default(), []);
    let err = fresh.get_combat_state(session.id).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionNotFound(_)));
}
