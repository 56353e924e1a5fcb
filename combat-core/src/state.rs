//! Combat session data model.
//!
//! Everything here is plain serde data. Mutation rules live in
//! [`crate::turn::TurnController`]; this module only offers accessors and
//! small bookkeeping helpers.

use crate::clock::Millis;
use crate::damage::{ActionOutcome, DamageType};
use crate::effects::Effect;
use crate::rewards::Rewards;
use crate::stats::{CoreStats, SecondaryStats, StatResolver};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier of a combat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a combatant: a player id, or the NPC definition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Turn State
// ============================================================================

/// One side of a fight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Player,
    Enemy,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::Player => Side::Enemy,
            Side::Enemy => Side::Player,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Player => f.write_str("player"),
            Side::Enemy => f.write_str("enemy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatStatus {
    Active,
    Completed,
}

/// How a completed session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatOutcome {
    Victory,
    Defeat,
    /// The player escaped. Nobody wins.
    Fled,
    /// The player gave up. The enemy wins, no rewards.
    Forfeited,
}

impl CombatOutcome {
    pub fn winner(self) -> Option<Side> {
        match self {
            CombatOutcome::Victory => Some(Side::Player),
            CombatOutcome::Defeat | CombatOutcome::Forfeited => Some(Side::Enemy),
            CombatOutcome::Fled => None,
        }
    }
}

impl fmt::Display for CombatOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CombatOutcome::Victory => "victory",
            CombatOutcome::Defeat => "defeat",
            CombatOutcome::Fled => "fled",
            CombatOutcome::Forfeited => "forfeited",
        };
        f.write_str(name)
    }
}

/// Derived phase of the turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    PlayerTurn,
    EnemyTurn,
    /// An action is being resolved; new submissions are rejected.
    Resolving,
    Completed,
}

/// Marks a session as mid-resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingGuard {
    /// Side whose action is being resolved.
    pub owner: Side,
    pub since: Millis,
}

// ============================================================================
// Log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Action,
    Effect,
    System,
}

/// One line of the combat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub turn: u32,
    /// `None` for system messages.
    pub actor_id: Option<ParticipantId>,
    pub kind: LogKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing: Option<u32>,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub is_dodge: bool,
    pub timestamp: Millis,
}

impl LogEntry {
    pub fn system(turn: u32, message: impl Into<String>, timestamp: Millis) -> Self {
        Self {
            turn,
            actor_id: None,
            kind: LogKind::System,
            message: message.into(),
            damage: None,
            healing: None,
            is_critical: false,
            is_dodge: false,
            timestamp,
        }
    }

    pub fn action(
        turn: u32,
        actor_id: ParticipantId,
        message: impl Into<String>,
        outcome: &ActionOutcome,
        timestamp: Millis,
    ) -> Self {
        Self {
            turn,
            actor_id: Some(actor_id),
            kind: LogKind::Action,
            message: message.into(),
            damage: (outcome.damage > 0 || outcome.is_dodge).then_some(outcome.damage),
            healing: (outcome.healing > 0).then_some(outcome.healing),
            is_critical: outcome.is_critical,
            is_dodge: outcome.is_dodge,
            timestamp,
        }
    }

    pub fn effect(
        turn: u32,
        actor_id: ParticipantId,
        message: impl Into<String>,
        damage: u32,
        healing: u32,
        timestamp: Millis,
    ) -> Self {
        Self {
            turn,
            actor_id: Some(actor_id),
            kind: LogKind::Effect,
            message: message.into(),
            damage: (damage > 0).then_some(damage),
            healing: (healing > 0).then_some(healing),
            is_critical: false,
            is_dodge: false,
            timestamp,
        }
    }
}

// ============================================================================
// Combatants
// ============================================================================

/// A fighter inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatantState {
    pub id: ParticipantId,
    pub name: String,
    pub is_player: bool,
    pub level: u32,
    pub current_hp: u32,
    pub max_hp: u32,
    pub current_energy: u32,
    pub max_energy: u32,
    /// Snapshot taken at session start, already including equipment and
    /// pet bonuses. Never changes afterwards.
    pub base_stats: CoreStats,
    pub modified_stats: CoreStats,
    pub secondary_stats: SecondaryStats,
    #[serde(default)]
    pub effects: Vec<Effect>,
    #[serde(default)]
    pub element: Option<DamageType>,
    /// Technique ids this combatant may use.
    #[serde(default)]
    pub techniques: Vec<String>,
}

impl CombatantState {
    /// Create a combatant at full HP and energy.
    pub fn new(
        id: ParticipantId,
        name: impl Into<String>,
        is_player: bool,
        level: u32,
        base_stats: CoreStats,
    ) -> Self {
        let base_stats = base_stats.clamped();
        let mut combatant = Self {
            id,
            name: name.into(),
            is_player,
            level,
            current_hp: 0,
            max_hp: 0,
            current_energy: 0,
            max_energy: 0,
            base_stats,
            modified_stats: base_stats,
            secondary_stats: SecondaryStats::default(),
            effects: Vec::new(),
            element: None,
            techniques: Vec::new(),
        };
        StatResolver::refresh(&mut combatant);
        combatant.current_hp = combatant.max_hp;
        combatant.current_energy = combatant.max_energy;
        combatant
    }

    pub fn with_techniques(mut self, techniques: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.techniques = techniques.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_element(mut self, element: DamageType) -> Self {
        self.element = Some(element);
        self
    }

    pub fn is_defeated(&self) -> bool {
        self.current_hp == 0
    }

    pub fn knows_technique(&self, id: &str) -> bool {
        self.techniques.iter().any(|t| t.eq_ignore_ascii_case(id))
    }

    pub fn has_effect(&self, name: &str) -> bool {
        self.effects.iter().any(|e| e.name == name)
    }

    pub fn effect(&self, name: &str) -> Option<&Effect> {
        self.effects.iter().find(|e| e.name == name)
    }

    /// Lose HP, never below zero. Returns the HP actually lost.
    pub fn take_damage(&mut self, amount: u32) -> u32 {
        let lost = amount.min(self.current_hp);
        self.current_hp -= lost;
        lost
    }

    /// Restore HP, never above max. Returns the HP actually restored.
    pub fn heal(&mut self, amount: u32) -> u32 {
        let restored = amount.min(self.max_hp - self.current_hp.min(self.max_hp));
        self.current_hp += restored;
        restored
    }

    /// Spend energy if enough is available.
    pub fn spend_energy(&mut self, amount: u32) -> bool {
        if self.current_energy < amount {
            return false;
        }
        self.current_energy -= amount;
        true
    }

    /// Regain energy, never above max. Returns the energy actually gained.
    pub fn restore_energy(&mut self, amount: u32) -> u32 {
        let gained = amount.min(self.max_energy.saturating_sub(self.current_energy));
        self.current_energy += gained;
        gained
    }
}

// ============================================================================
// Session
// ============================================================================

/// A fight between the player and one NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatSession {
    pub id: SessionId,
    pub player_id: ParticipantId,
    /// NPC definition key.
    pub enemy_id: String,
    pub player_state: CombatantState,
    pub enemy_state: CombatantState,
    /// Current turn owner.
    pub turn: Side,
    pub status: CombatStatus,
    pub winner: Option<Side>,
    pub outcome: Option<CombatOutcome>,
    pub log: Vec<LogEntry>,
    pub rewards: Option<Rewards>,
    /// Last time wall-clock effects were charged.
    pub last_updated_at: Millis,
    /// Full rounds started so far, starting at 1.
    pub round: u32,
    /// Individual turns taken so far.
    pub turn_number: u32,
    pub turn_started_at: Millis,
    #[serde(default)]
    pub processing: Option<ProcessingGuard>,
    /// Bumped on every mutation.
    #[serde(default)]
    pub revision: u64,
}

impl CombatSession {
    pub fn new(
        player_state: CombatantState,
        enemy_state: CombatantState,
        enemy_id: impl Into<String>,
        now: Millis,
    ) -> Self {
        let intro = format!("{} faces {}!", player_state.name, enemy_state.name);
        Self {
            id: SessionId::new(),
            player_id: player_state.id.clone(),
            enemy_id: enemy_id.into(),
            player_state,
            enemy_state,
            turn: Side::Player,
            status: CombatStatus::Active,
            winner: None,
            outcome: None,
            log: vec![LogEntry::system(1, intro, now)],
            rewards: None,
            last_updated_at: now,
            round: 1,
            turn_number: 1,
            turn_started_at: now,
            processing: None,
            revision: 0,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        if self.status == CombatStatus::Completed {
            return TurnPhase::Completed;
        }
        if self.processing.is_some() {
            return TurnPhase::Resolving;
        }
        match self.turn {
            Side::Player => TurnPhase::PlayerTurn,
            Side::Enemy => TurnPhase::EnemyTurn,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CombatStatus::Active
    }

    pub fn combatant(&self, side: Side) -> &CombatantState {
        match side {
            Side::Player => &self.player_state,
            Side::Enemy => &self.enemy_state,
        }
    }

    pub fn combatant_mut(&mut self, side: Side) -> &mut CombatantState {
        match side {
            Side::Player => &mut self.player_state,
            Side::Enemy => &mut self.enemy_state,
        }
    }

    /// Which side an actor fights on, if any.
    pub fn side_of(&self, actor: &ParticipantId) -> Option<Side> {
        if *actor == self.player_state.id {
            Some(Side::Player)
        } else if *actor == self.enemy_state.id {
            Some(Side::Enemy)
        } else {
            None
        }
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    pub fn touch(&mut self) {
        self.revision += 1;
    }

    /// Mark the session completed. Idempotent: a completed session keeps its
    /// first outcome.
    pub fn finish(&mut self, outcome: CombatOutcome, now: Millis) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = CombatStatus::Completed;
        self.outcome = Some(outcome);
        self.winner = outcome.winner();
        self.processing = None;

        let message = match outcome {
            CombatOutcome::Victory => format!("{} is defeated. Victory!", self.enemy_state.name),
            CombatOutcome::Defeat => format!("{} has fallen. Defeat.", self.player_state.name),
            CombatOutcome::Fled => format!("{} escaped from battle.", self.player_state.name),
            CombatOutcome::Forfeited => format!("{} forfeits the fight.", self.player_state.name),
        };
        self.push_log(LogEntry::system(self.turn_number, message, now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CombatSession {
        let player = CombatantState::new(
            ParticipantId::from("p1"),
            "Lin Feng",
            true,
            10,
            CoreStats::new(20, 15, 30, 25, 12, 10),
        );
        let enemy = CombatantState::new(
            ParticipantId::from("wild_boar"),
            "Wild Boar",
            false,
            3,
            CoreStats::new(8, 5, 10, 0, 4, 0),
        );
        CombatSession::new(player, enemy, "wild_boar", 1_000)
    }

    #[test]
    fn test_new_combatant_starts_full() {
        let s = session();
        assert_eq!(s.player_state.current_hp, 180);
        assert_eq!(s.player_state.current_energy, 85);
        assert_eq!(s.enemy_state.current_hp, 126);
    }

    #[test]
    fn test_new_session_is_player_turn() {
        let s = session();
        assert_eq!(s.phase(), TurnPhase::PlayerTurn);
        assert_eq!(s.round, 1);
        assert_eq!(s.log.len(), 1);
        assert_eq!(s.log[0].kind, LogKind::System);
    }

    #[test]
    fn test_phase_reflects_processing_and_completion() {
        let mut s = session();
        s.processing = Some(ProcessingGuard {
            owner: Side::Player,
            since: 1_000,
        });
        assert_eq!(s.phase(), TurnPhase::Resolving);

        s.finish(CombatOutcome::Victory, 2_000);
        assert_eq!(s.phase(), TurnPhase::Completed);
        assert!(s.processing.is_none());
    }

    #[test]
    fn test_side_of() {
        let s = session();
        assert_eq!(s.side_of(&ParticipantId::from("p1")), Some(Side::Player));
        assert_eq!(s.side_of(&ParticipantId::from("wild_boar")), Some(Side::Enemy));
        assert_eq!(s.side_of(&ParticipantId::from("stranger")), None);
    }

    #[test]
    fn test_finish_sets_winner_and_is_idempotent() {
        let mut s = session();
        assert!(s.finish(CombatOutcome::Fled, 2_000));
        assert_eq!(s.winner, None);
        assert_eq!(s.outcome, Some(CombatOutcome::Fled));

        assert!(!s.finish(CombatOutcome::Victory, 3_000));
        assert_eq!(s.outcome, Some(CombatOutcome::Fled));
    }

    #[test]
    fn test_hp_helpers_clamp() {
        let mut s = session();
        let p = &mut s.player_state;
        assert_eq!(p.take_damage(500), 180);
        assert!(p.is_defeated());
        assert_eq!(p.heal(500), 180);
        assert!(!p.spend_energy(86));
        assert!(p.spend_energy(85));
        assert_eq!(p.restore_energy(100), 85);
    }

    #[test]
    fn test_session_serde_shape() {
        let s = session();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["turn"], "player");
        assert_eq!(json["status"], "active");
        assert!(json["winner"].is_null());
        assert!(json["player_state"].is_object());

        let back: CombatSession = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, s.id);
        assert_eq!(back.enemy_state.current_hp, s.enemy_state.current_hp);
        assert_eq!(back.log, s.log);
    }
}
