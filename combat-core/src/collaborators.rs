//! External collaborators consumed by the combat engine.
//!
//! The engine never reaches for globals. Character stats, inventory, quest
//! tracking, weather and spirit pets are all handed in as trait objects
//! through [`crate::session::Collaborators`]. The null implementations at
//! the bottom of this file let a host leave out whatever it does not have.

use crate::damage::DamageType;
use crate::effects::Effect;
use crate::state::ParticipantId;
use crate::stats::CoreStats;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

// ============================================================================
// Character Stats
// ============================================================================

/// Combined character snapshot handed over when a fight starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub name: String,
    pub level: u32,
    /// Raw stat object including equipment bonuses, normalized through
    /// [`CoreStats::from_raw`].
    pub stats: Value,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default)]
    pub element: Option<DamageType>,
}

pub trait StatsProvider: Send + Sync {
    /// Combined stats for a player, or `None` if the player is unknown.
    fn combined_stats(&self, player: &ParticipantId) -> Option<PlayerSnapshot>;
}

// ============================================================================
// Inventory and Quests
// ============================================================================

pub trait Inventory: Send + Sync {
    fn add_item(
        &self,
        player: &ParticipantId,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), CollaboratorError>;
}

/// Combat events quests can react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestEvent {
    DefeatEnemy { enemy_id: String },
    DefeatAnyEnemy,
}

pub trait QuestTracker: Send + Sync {
    /// Quest ids whose objectives are satisfied by this event.
    fn check_event(&self, player: &ParticipantId, event: &QuestEvent) -> Vec<String>;

    fn complete_quest(&self, player: &ParticipantId, quest_id: &str) -> Result<(), CollaboratorError>;
}

// ============================================================================
// Weather
// ============================================================================

/// Snapshot of weather effects on combat. Every modifier is a multiplier
/// where `1.0` means no effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherModifiers {
    pub damage_modifiers: HashMap<DamageType, f64>,
    pub hit_chance_modifier: f64,
    pub crit_chance_modifier: f64,
    pub dodge_chance_modifier: f64,
}

impl Default for WeatherModifiers {
    fn default() -> Self {
        Self {
            damage_modifiers: HashMap::new(),
            hit_chance_modifier: 1.0,
            crit_chance_modifier: 1.0,
            dodge_chance_modifier: 1.0,
        }
    }
}

impl WeatherModifiers {
    /// Damage multiplier for a damage type.
    pub fn damage_modifier(&self, damage_type: DamageType) -> f64 {
        match self.damage_modifiers.get(&damage_type) {
            Some(m) if m.is_finite() && *m >= 0.0 => *m,
            _ => 1.0,
        }
    }

    pub fn with_damage_modifier(mut self, damage_type: DamageType, modifier: f64) -> Self {
        self.damage_modifiers.insert(damage_type, modifier);
        self
    }

    pub fn with_hit_chance_modifier(mut self, modifier: f64) -> Self {
        self.hit_chance_modifier = modifier;
        self
    }

    pub fn with_crit_chance_modifier(mut self, modifier: f64) -> Self {
        self.crit_chance_modifier = modifier;
        self
    }

    pub fn with_dodge_chance_modifier(mut self, modifier: f64) -> Self {
        self.dodge_chance_modifier = modifier;
        self
    }
}

pub trait WeatherSource: Send + Sync {
    fn current_modifiers(&self) -> WeatherModifiers;
}

/// A fixed snapshot is its own source.
impl WeatherSource for WeatherModifiers {
    fn current_modifiers(&self) -> WeatherModifiers {
        self.clone()
    }
}

// ============================================================================
// Spirit Pets
// ============================================================================

/// Why a pet refused to act.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PetError {
    #[error("no active spirit pet")]
    NoPet,

    #[error("pet is too hungry to act (hunger {hunger})")]
    TooHungry { hunger: u32 },

    #[error("pet loyalty too low (loyalty {loyalty})")]
    LowLoyalty { loyalty: u32 },

    #[error("unknown pet ability: {0}")]
    UnknownAbility(String),
}

/// What a pet ability does once the pet agrees to use it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PetAbilityOutcome {
    pub name: String,
    /// Precomputed damage against the enemy; zero for support abilities.
    pub damage: u32,
    pub damage_type: DamageType,
    /// Healing for the player.
    pub healing: u32,
    pub target_effects: Vec<Effect>,
    pub self_effects: Vec<Effect>,
}

pub trait PetCompanion: Send + Sync {
    /// Passive stat bonuses folded into the player's base stats at start.
    fn combat_bonuses(&self, player: &ParticipantId) -> CoreStats;

    /// Damage multiplier for an element the pet has affinity with.
    fn elemental_bonus(&self, player: &ParticipantId, damage_type: DamageType) -> f64;

    /// Added to the base flee chance (0.1 = +10 percentage points).
    fn flee_bonus(&self, player: &ParticipantId) -> f64;

    /// Use an active ability. The pet pays its own hunger and loyalty cost
    /// and may refuse.
    fn use_ability(
        &self,
        player: &ParticipantId,
        ability_id: &str,
    ) -> Result<PetAbilityOutcome, PetError>;

    /// Undo the cost of a `use_ability` call whose action was rolled back
    /// or discarded before it took effect.
    fn refund_ability(&self, _player: &ParticipantId, _ability_id: &str) {}
}

// ============================================================================
// Null Implementations
// ============================================================================

/// Player without a spirit pet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPet;

impl PetCompanion for NoPet {
    fn combat_bonuses(&self, _player: &ParticipantId) -> CoreStats {
        CoreStats::default()
    }

    fn elemental_bonus(&self, _player: &ParticipantId, _damage_type: DamageType) -> f64 {
        1.0
    }

    fn flee_bonus(&self, _player: &ParticipantId) -> f64 {
        0.0
    }

    fn use_ability(
        &self,
        _player: &ParticipantId,
        _ability_id: &str,
    ) -> Result<PetAbilityOutcome, PetError> {
        Err(PetError::NoPet)
    }
}

/// Quest tracker that never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuests;

impl QuestTracker for NoQuests {
    fn check_event(&self, _player: &ParticipantId, _event: &QuestEvent) -> Vec<String> {
        Vec::new()
    }

    fn complete_quest(&self, _player: &ParticipantId, quest_id: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Rejected(format!("no quest tracking for {quest_id}")))
    }
}

/// Inventory that accepts and drops every item.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardInventory;

impl Inventory for DiscardInventory {
    fn add_item(
        &self,
        _player: &ParticipantId,
        _item_id: &str,
        _quantity: u32,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_weather_defaults_are_neutral() {
        let weather = WeatherModifiers::default();
        assert_eq!(weather.damage_modifier(DamageType::Fire), 1.0);
        assert_eq!(weather.hit_chance_modifier, 1.0);
    }

    #[test]
    fn test_weather_from_partial_json() {
        let weather: WeatherModifiers = serde_json::from_value(json!({
            "damage_modifiers": { "fire": 0.8, "water": 1.25 },
            "dodge_chance_modifier": 1.1
        }))
        .unwrap();

        assert_eq!(weather.damage_modifier(DamageType::Fire), 0.8);
        assert_eq!(weather.damage_modifier(DamageType::Water), 1.25);
        assert_eq!(weather.damage_modifier(DamageType::Earth), 1.0);
        assert_eq!(weather.crit_chance_modifier, 1.0);
        assert_eq!(weather.dodge_chance_modifier, 1.1);
    }

    #[test]
    fn test_bad_damage_modifier_is_ignored() {
        let weather = WeatherModifiers::default().with_damage_modifier(DamageType::Wind, f64::NAN);
        assert_eq!(weather.damage_modifier(DamageType::Wind), 1.0);
    }

    #[test]
    fn test_no_pet_refuses_abilities() {
        let player = ParticipantId::from("p1");
        assert_eq!(NoPet.use_ability(&player, "ember"), Err(PetError::NoPet));
        assert_eq!(NoPet.flee_bonus(&player), 0.0);
        assert!(NoPet.combat_bonuses(&player).is_zero());
    }

    #[test]
    fn test_quest_event_serde() {
        let event = QuestEvent::DefeatEnemy {
            enemy_id: "wild_boar".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({ "type": "defeat_enemy", "enemy_id": "wild_boar" }));
    }
}
