//! Balance rules and timeouts for combat sessions.

use crate::damage::DamageRules;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`crate::session::CombatService`].
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatConfig {
    /// Base chance in `[0, 1]` that fleeing succeeds.
    pub flee_chance: f64,

    /// Protect value of the "Defend" effect.
    pub defend_reduction: f64,

    /// Rounds the "Defend" effect lasts.
    pub defend_rounds: u32,

    /// Damage floor for player attacks.
    pub player_min_damage: u32,

    /// Cap on combined mitigation when the player is hit.
    pub max_player_mitigation: f64,

    /// Energy both sides regain at the end of each full round.
    pub energy_regen_per_round: u32,

    /// How long a player action may stay in the resolving phase, in ms.
    pub player_turn_timeout_ms: u64,

    /// How long an enemy turn may stay unresolved, in ms.
    pub enemy_turn_timeout_ms: u64,

    /// Delay before the enemy acts, in ms. Zero resolves it inline.
    ///
    /// Capped at half of `enemy_turn_timeout_ms`; a longer delay would let
    /// the watchdog hand every enemy turn back before it ran.
    pub enemy_turn_delay_ms: u64,

    /// Seed for the service's random source. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            flee_chance: 0.30,
            defend_reduction: 0.5,
            defend_rounds: 1,
            player_min_damage: 5,
            max_player_mitigation: 0.8,
            energy_regen_per_round: 5,
            player_turn_timeout_ms: 5_000,
            enemy_turn_timeout_ms: 2_000,
            enemy_turn_delay_ms: 0,
            rng_seed: None,
        }
    }
}

impl CombatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flee_chance(mut self, chance: f64) -> Self {
        self.flee_chance = chance;
        self
    }

    pub fn with_defend(mut self, reduction: f64, rounds: u32) -> Self {
        self.defend_reduction = reduction;
        self.defend_rounds = rounds;
        self
    }

    pub fn with_player_min_damage(mut self, damage: u32) -> Self {
        self.player_min_damage = damage;
        self
    }

    pub fn with_max_player_mitigation(mut self, cap: f64) -> Self {
        self.max_player_mitigation = cap;
        self
    }

    pub fn with_energy_regen(mut self, per_round: u32) -> Self {
        self.energy_regen_per_round = per_round;
        self
    }

    pub fn with_player_turn_timeout(mut self, timeout: Duration) -> Self {
        self.player_turn_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enemy_turn_timeout(mut self, timeout: Duration) -> Self {
        self.enemy_turn_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enemy_turn_delay(mut self, delay: Duration) -> Self {
        self.enemy_turn_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn damage_rules(&self) -> DamageRules {
        DamageRules {
            player_min_damage: self.player_min_damage,
            max_player_mitigation: self.max_player_mitigation.clamp(0.0, 1.0),
        }
    }

    pub fn player_turn_timeout(&self) -> Duration {
        Duration::from_millis(self.player_turn_timeout_ms)
    }

    pub fn enemy_turn_timeout(&self) -> Duration {
        Duration::from_millis(self.enemy_turn_timeout_ms)
    }

    /// Effective enemy delay, capped at half the enemy turn timeout.
    pub fn enemy_turn_delay(&self) -> Duration {
        Duration::from_millis(self.enemy_turn_delay_ms.min(self.enemy_turn_timeout_ms / 2))
    }
}
