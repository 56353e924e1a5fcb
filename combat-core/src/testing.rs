//! Testing utilities for the combat engine.
//!
//! This module provides tools for deterministic tests:
//! - `ScriptedRng` for forcing every roll in order
//! - `ManualClock` for moving wall-clock time by hand
//! - Recording and scripted collaborators (`FixedStats`, `RecordingInventory`,
//!   `RecordingQuests`, `ScriptedPet`)
//! - `StallingStore` for simulating a stuck or failing persistence layer
//! - `TestHarness` wiring all of the above into a `CombatService`
//! - Assertion helpers for verifying session state

use crate::bestiary::Bestiary;
use crate::clock::{Clock, Millis};
use crate::collaborators::{
    CollaboratorError, Inventory, NoPet, PetAbilityOutcome, PetCompanion, PetError, PlayerSnapshot,
    QuestEvent, QuestTracker, StatsProvider,
};
use crate::config::CombatConfig;
use crate::damage::DamageType;
use crate::persist::{MemoryStore, PersistError, SessionStore};
use crate::session::{CombatService, Collaborators, SessionError};
use crate::state::{CombatOutcome, CombatSession, CombatStatus, ParticipantId, SessionId, TurnPhase};
use crate::stats::CoreStats;
use crate::turn::Action;
use async_trait::async_trait;
use rand::RngCore;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Randomness and Time
// ============================================================================

/// A random source that replays scripted percent rolls.
///
/// Each value is a roll in `[0, 100)` and is consumed by exactly one 64-bit
/// draw, so `ScriptedRng::new([0.0, 99.0])` means "hit, no crit" for a plain
/// attack. The same draw feeds integer picks: a roll of `p` selects bucket
/// `floor(p / 100 * n)` out of `n`. Once the script runs out the fallback
/// roll (50 by default) is used.
#[derive(Debug, Clone)]
pub struct ScriptedRng {
    rolls: VecDeque<f64>,
    fallback: f64,
    draws: usize,
}

impl ScriptedRng {
    pub fn new(rolls: impl IntoIterator<Item = f64>) -> Self {
        Self {
            rolls: rolls.into_iter().collect(),
            fallback: 50.0,
            draws: 0,
        }
    }

    pub fn with_fallback(mut self, percent: f64) -> Self {
        self.fallback = percent;
        self
    }

    /// How many values have been drawn so far.
    pub fn draws(&self) -> usize {
        self.draws
    }

    /// Scripted rolls not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rolls.len()
    }
}

/// Encode a percent so that rand's `f64` sampling (top 53 bits scaled to
/// `[0, 1)`) returns it back.
fn encode_percent(percent: f64) -> u64 {
    const SCALE: u64 = 1 << 53;
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let bits = ((fraction * SCALE as f64) as u64).min(SCALE - 1);
    bits << 11
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        let percent = self.rolls.pop_front().unwrap_or(self.fallback);
        encode_percent(percent)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, ms: Millis) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Stats provider backed by a fixed map of players.
#[derive(Debug, Default)]
pub struct FixedStats {
    players: HashMap<ParticipantId, PlayerSnapshot>,
}

impl FixedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_player(mut self, id: impl Into<ParticipantId>, snapshot: PlayerSnapshot) -> Self {
        self.players.insert(id.into(), snapshot);
        self
    }
}

impl StatsProvider for FixedStats {
    fn combined_stats(&self, player: &ParticipantId) -> Option<PlayerSnapshot> {
        self.players.get(player).cloned()
    }
}

/// A level 10 cultivator with 180 HP and 85 energy.
///
/// The stat object uses character-layer spellings on purpose, so it goes
/// through the same normalization as real data.
pub fn sample_player(name: &str) -> PlayerSnapshot {
    PlayerSnapshot {
        name: name.to_string(),
        level: 10,
        stats: json!({
            "strength": 20,
            "defense": 15,
            "vitality": "30",
            "spiritPower": 25,
            "agility": 12,
            "luck": 10,
        }),
        techniques: ["flame_palm", "jade_rejuvenation", "venom_needle", "iron_skin", "spirit_surge"]
            .into_iter()
            .map(String::from)
            .collect(),
        element: Some(DamageType::Fire),
    }
}

/// Inventory that records every item it receives.
#[derive(Debug, Default)]
pub struct RecordingInventory {
    items: Mutex<Vec<(String, String, u32)>>,
    failing: bool,
}

impl RecordingInventory {
    /// Reject every item.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// `(player, item, quantity)` in the order received.
    pub fn items(&self) -> Vec<(String, String, u32)> {
        lock(&self.items).clone()
    }
}

impl Inventory for RecordingInventory {
    fn add_item(
        &self,
        player: &ParticipantId,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), CollaboratorError> {
        if self.failing {
            return Err(CollaboratorError::Unavailable("inventory offline".to_string()));
        }
        lock(&self.items).push((player.to_string(), item_id.to_string(), quantity));
        Ok(())
    }
}

/// Quest tracker with scripted objectives that records completions.
#[derive(Debug, Default)]
pub struct RecordingQuests {
    objectives: Vec<(QuestEvent, String)>,
    completed: Mutex<Vec<String>>,
    failing: bool,
}

impl RecordingQuests {
    /// Quest satisfied by defeating a specific enemy.
    pub fn with_objective(mut self, enemy_id: &str, quest_id: &str) -> Self {
        let event = QuestEvent::DefeatEnemy {
            enemy_id: enemy_id.to_string(),
        };
        self.objectives.push((event, quest_id.to_string()));
        self
    }

    /// Quest satisfied by defeating anything.
    pub fn with_any_enemy_objective(mut self, quest_id: &str) -> Self {
        self.objectives.push((QuestEvent::DefeatAnyEnemy, quest_id.to_string()));
        self
    }

    /// Refuse every completion.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn completed(&self) -> Vec<String> {
        lock(&self.completed).clone()
    }
}

impl QuestTracker for RecordingQuests {
    fn check_event(&self, _player: &ParticipantId, event: &QuestEvent) -> Vec<String> {
        let completed = lock(&self.completed);
        self.objectives
            .iter()
            .filter(|(objective, quest)| objective == event && !completed.contains(quest))
            .map(|(_, quest)| quest.clone())
            .collect()
    }

    fn complete_quest(&self, _player: &ParticipantId, quest_id: &str) -> Result<(), CollaboratorError> {
        if self.failing {
            return Err(CollaboratorError::Unavailable("quest log offline".to_string()));
        }
        lock(&self.completed).push(quest_id.to_string());
        Ok(())
    }
}

/// A spirit pet with scripted abilities that records every use.
#[derive(Debug, Default)]
pub struct ScriptedPet {
    abilities: HashMap<String, PetAbilityOutcome>,
    bonuses: CoreStats,
    flee_bonus: f64,
    affinity: Option<(DamageType, f64)>,
    refusal: Option<PetError>,
    uses: Mutex<Vec<String>>,
    refunds: Mutex<Vec<String>>,
}

impl ScriptedPet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A damaging ability.
    pub fn with_ability(self, id: &str, damage: u32, damage_type: DamageType) -> Self {
        let outcome = PetAbilityOutcome {
            name: id.to_string(),
            damage,
            damage_type,
            ..PetAbilityOutcome::default()
        };
        self.with_outcome(id, outcome)
    }

    /// An ability with a fully specified outcome.
    pub fn with_outcome(mut self, id: &str, outcome: PetAbilityOutcome) -> Self {
        self.abilities.insert(id.to_string(), outcome);
        self
    }

    pub fn with_bonuses(mut self, bonuses: CoreStats) -> Self {
        self.bonuses = bonuses;
        self
    }

    pub fn with_flee_bonus(mut self, bonus: f64) -> Self {
        self.flee_bonus = bonus;
        self
    }

    pub fn with_affinity(mut self, damage_type: DamageType, multiplier: f64) -> Self {
        self.affinity = Some((damage_type, multiplier));
        self
    }

    /// Refuse every ability with this error.
    pub fn refusing(mut self, error: PetError) -> Self {
        self.refusal = Some(error);
        self
    }

    /// Ability ids used so far, in order.
    pub fn uses(&self) -> Vec<String> {
        lock(&self.uses).clone()
    }

    /// Ability ids refunded so far, in order.
    pub fn refunds(&self) -> Vec<String> {
        lock(&self.refunds).clone()
    }
}

impl PetCompanion for ScriptedPet {
    fn combat_bonuses(&self, _player: &ParticipantId) -> CoreStats {
        self.bonuses
    }

    fn elemental_bonus(&self, _player: &ParticipantId, damage_type: DamageType) -> f64 {
        match self.affinity {
            Some((element, multiplier)) if element == damage_type => multiplier,
            _ => 1.0,
        }
    }

    fn flee_bonus(&self, _player: &ParticipantId) -> f64 {
        self.flee_bonus
    }

    fn use_ability(
        &self,
        _player: &ParticipantId,
        ability_id: &str,
    ) -> Result<PetAbilityOutcome, PetError> {
        if let Some(error) = &self.refusal {
            return Err(error.clone());
        }
        let outcome = self
            .abilities
            .get(ability_id)
            .cloned()
            .ok_or_else(|| PetError::UnknownAbility(ability_id.to_string()))?;
        lock(&self.uses).push(ability_id.to_string());
        Ok(outcome)
    }

    fn refund_ability(&self, _player: &ParticipantId, ability_id: &str) {
        lock(&self.refunds).push(ability_id.to_string());
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// In-memory store that can be told to hang or fail.
///
/// A stalled save waits until [`StallingStore::release`] is called. Tests
/// that never release it simulate a request dropped halfway through an
/// action.
#[derive(Debug, Default)]
pub struct StallingStore {
    inner: MemoryStore,
    stall_next: AtomicBool,
    fail_next: AtomicBool,
    waiting: AtomicBool,
    release: Notify,
    saves: AtomicUsize,
}

impl StallingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next save hangs until released.
    pub fn stall_next_save(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    /// Whether a stalled save is currently waiting.
    pub fn is_stalled(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Let a stalled save continue.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// The next save fails with an IO error.
    pub fn fail_next_save(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Saves that completed successfully.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last successfully saved copy of a session.
    pub async fn stored(&self, id: SessionId) -> Option<CombatSession> {
        self.inner.load(id).await.ok().flatten()
    }
}

#[async_trait]
impl SessionStore for StallingStore {
    async fn save(&self, session: &CombatSession) -> Result<(), PersistError> {
        if self.stall_next.swap(false, Ordering::SeqCst) {
            self.waiting.store(true, Ordering::SeqCst);
            self.release.notified().await;
            self.waiting.store(false, Ordering::SeqCst);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PersistError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk on fire",
            )));
        }
        self.inner.save(session).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<Option<CombatSession>, PersistError> {
        self.inner.load(id).await
    }

    async fn remove(&self, id: SessionId) -> Result<(), PersistError> {
        self.inner.remove(id).await
    }
}

// ============================================================================
// Test Harness
// ============================================================================

/// Time every harness starts at.
pub const HARNESS_START: Millis = 1_000_000;

/// A `CombatService` wired to scripted collaborators.
///
/// The player is `"p1"` built from [`sample_player`].
pub struct TestHarness {
    pub service: CombatService,
    pub clock: ManualClock,
    pub store: Arc<StallingStore>,
    pub inventory: Arc<RecordingInventory>,
    pub quests: Arc<RecordingQuests>,
    pub player: ParticipantId,
}

impl TestHarness {
    /// Default config and calm weather, rolls taken from `rolls`.
    pub fn new(rolls: impl IntoIterator<Item = f64>) -> Self {
        Self::build(CombatConfig::default(), Arc::new(NoPet), rolls)
    }

    pub fn with_config(config: CombatConfig, rolls: impl IntoIterator<Item = f64>) -> Self {
        Self::build(config, Arc::new(NoPet), rolls)
    }

    pub fn with_pet(pet: Arc<dyn PetCompanion>, rolls: impl IntoIterator<Item = f64>) -> Self {
        Self::build(CombatConfig::default(), pet, rolls)
    }

    fn build(config: CombatConfig, pet: Arc<dyn PetCompanion>, rolls: impl IntoIterator<Item = f64>) -> Self {
        let player = ParticipantId::from("p1");
        let clock = ManualClock::new(HARNESS_START);
        let store = Arc::new(StallingStore::new());
        let inventory = Arc::new(RecordingInventory::default());
        let quests = Arc::new(
            RecordingQuests::default()
                .with_objective("wild_boar", "cull_the_boars")
                .with_any_enemy_objective("first_blood"),
        );
        let stats = FixedStats::new().with_player(player.clone(), sample_player("Lin Feng"));

        let collaborators = Collaborators::new(Arc::new(stats))
            .with_inventory(inventory.clone())
            .with_quests(quests.clone())
            .with_pets(pet)
            .with_store(store.clone())
            .with_clock(Arc::new(clock.clone()));
        let service = CombatService::with_rng(config, collaborators, Bestiary::new(), ScriptedRng::new(rolls));

        Self {
            service,
            clock,
            store,
            inventory,
            quests,
            player,
        }
    }

    /// Start a fight against a catalog NPC.
    pub async fn start(&self, enemy_id: &str) -> Result<CombatSession, SessionError> {
        self.service.start_combat(self.player.clone(), enemy_id).await
    }

    /// Submit an action as the harness player.
    pub async fn act(&self, id: SessionId, action: Action) -> Result<CombatSession, SessionError> {
        self.service.perform_action(id, &self.player, action).await
    }

    pub async fn state(&self, id: SessionId) -> Result<CombatSession, SessionError> {
        self.service.get_combat_state(id).await
    }

    /// Move the service clock forward.
    pub fn advance(&self, ms: Millis) {
        self.clock.advance(ms);
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the structural invariants every session must hold.
#[track_caller]
pub fn assert_invariants(session: &CombatSession) {
    for c in [&session.player_state, &session.enemy_state] {
        assert!(
            c.current_hp <= c.max_hp,
            "{} has {} HP over max {}",
            c.name,
            c.current_hp,
            c.max_hp
        );
        assert!(
            c.current_energy <= c.max_energy,
            "{} has {} energy over max {}",
            c.name,
            c.current_energy,
            c.max_energy
        );
    }
    assert!(!session.log.is_empty(), "Expected a non-empty combat log");
    assert!(session.round >= 1, "Rounds start at 1");

    match session.status {
        CombatStatus::Active => {
            assert!(session.outcome.is_none(), "Active session has outcome {:?}", session.outcome);
            assert!(session.winner.is_none(), "Active session has winner {:?}", session.winner);
        }
        CombatStatus::Completed => {
            let Some(outcome) = session.outcome else {
                panic!("Completed session without outcome");
            };
            assert_eq!(session.winner, outcome.winner(), "Winner does not match {outcome}");
            assert!(session.processing.is_none(), "Completed session is still resolving");
        }
    }
}

#[track_caller]
pub fn assert_phase(session: &CombatSession, expected: TurnPhase) {
    assert_eq!(
        session.phase(),
        expected,
        "Expected phase {expected:?}, got {:?}",
        session.phase()
    );
}

#[track_caller]
pub fn assert_outcome(session: &CombatSession, expected: CombatOutcome) {
    assert_eq!(
        session.outcome,
        Some(expected),
        "Expected outcome {expected}, got {:?}",
        session.outcome
    );
    assert_phase(session, TurnPhase::Completed);
}
