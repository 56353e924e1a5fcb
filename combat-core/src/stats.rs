//! Stat resolution: base stats + effect deltas -> modified and secondary stats.
//!
//! Stats enter the engine exactly once, through [`CoreStats::from_raw`],
//! which normalizes the loosely-shaped stat objects handed over by the
//! character layer into one canonical schema. Nothing past this boundary
//! ever looks at alternative field spellings.

use crate::state::CombatantState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{Add, AddAssign};

/// Attack assumed when a stat object carries no usable attack value.
pub const DEFAULT_ATTACK: i32 = 5;

/// Upper bound for critical hit chance, in percent.
pub const MAX_CRIT_CHANCE: f64 = 50.0;

// ============================================================================
// Core Stats
// ============================================================================

/// The canonical primary stats of a combatant.
///
/// Also used for additive deltas (effects, pet bonuses), which is why the
/// fields are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreStats {
    pub attack: i32,
    pub defense: i32,
    pub vitality: i32,
    pub spirit: i32,
    pub agility: i32,
    pub luck: i32,
}

/// Accepted spellings for each canonical stat, in priority order.
const ATTACK_KEYS: &[&str] = &["attack", "strength", "physicalAttack", "physical_attack", "atk", "power"];
const DEFENSE_KEYS: &[&str] = &["defense", "defence", "physicalDefense", "physical_defense", "def"];
const VITALITY_KEYS: &[&str] = &["vitality", "vit", "constitution", "health", "body"];
const SPIRIT_KEYS: &[&str] = &["spirit", "spiritPower", "spirit_power", "qi", "wisdom", "intelligence"];
const AGILITY_KEYS: &[&str] = &["agility", "agi", "dexterity", "speed"];
const LUCK_KEYS: &[&str] = &["luck", "fortune", "luk"];

impl CoreStats {
    pub const fn new(
        attack: i32,
        defense: i32,
        vitality: i32,
        spirit: i32,
        agility: i32,
        luck: i32,
    ) -> Self {
        Self {
            attack,
            defense,
            vitality,
            spirit,
            agility,
            luck,
        }
    }

    /// Normalize a raw stat object into canonical stats.
    ///
    /// Accepts the field spellings used across the character layer, numbers
    /// encoded as strings, and a nested `stats` object. Missing or malformed
    /// values fall back to safe defaults instead of failing: attack becomes
    /// [`DEFAULT_ATTACK`], everything else zero.
    pub fn from_raw(raw: &Value) -> Self {
        let source = match raw.get("stats") {
            Some(nested) if nested.is_object() => nested,
            _ => raw,
        };

        Self {
            attack: read_stat(source, ATTACK_KEYS).unwrap_or(DEFAULT_ATTACK),
            defense: read_stat(source, DEFENSE_KEYS).unwrap_or(0),
            vitality: read_stat(source, VITALITY_KEYS).unwrap_or(0),
            spirit: read_stat(source, SPIRIT_KEYS).unwrap_or(0),
            agility: read_stat(source, AGILITY_KEYS).unwrap_or(0),
            luck: read_stat(source, LUCK_KEYS).unwrap_or(0),
        }
    }

    /// Copy with every negative stat raised to zero.
    pub fn clamped(self) -> Self {
        Self {
            attack: self.attack.max(0),
            defense: self.defense.max(0),
            vitality: self.vitality.max(0),
            spirit: self.spirit.max(0),
            agility: self.agility.max(0),
            luck: self.luck.max(0),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn read_stat(source: &Value, keys: &[&str]) -> Option<i32> {
    let object = source.as_object()?;
    keys.iter()
        .find_map(|key| object.get(*key).and_then(stat_number))
}

fn stat_number(value: &Value) -> Option<i32> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;

    if !number.is_finite() {
        return None;
    }
    Some(number.clamp(0.0, i32::MAX as f64) as i32)
}

impl Add for CoreStats {
    type Output = CoreStats;

    fn add(self, rhs: CoreStats) -> CoreStats {
        CoreStats {
            attack: self.attack.saturating_add(rhs.attack),
            defense: self.defense.saturating_add(rhs.defense),
            vitality: self.vitality.saturating_add(rhs.vitality),
            spirit: self.spirit.saturating_add(rhs.spirit),
            agility: self.agility.saturating_add(rhs.agility),
            luck: self.luck.saturating_add(rhs.luck),
        }
    }
}

impl AddAssign for CoreStats {
    fn add_assign(&mut self, rhs: CoreStats) {
        *self = *self + rhs;
    }
}

// ============================================================================
// Secondary Stats
// ============================================================================

/// Stats derived from level and modified core stats.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SecondaryStats {
    pub accuracy: f64,
    pub evasion: f64,
    /// Critical hit chance in percent.
    pub crit_chance: f64,
    /// Bonus damage of a critical hit in percent (50 = x1.5).
    pub crit_damage: f64,
    pub defense: i32,
    /// Fraction of plain-attack damage removed by defense, in `[0, 1)`.
    pub damage_reduction: f64,
}

/// Everything the resolver derives for one combatant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedStats {
    pub modified: CoreStats,
    pub secondary: SecondaryStats,
    pub max_hp: u32,
    pub max_energy: u32,
}

/// Folds base stats and active effects into resolved stats.
pub struct StatResolver;

impl StatResolver {
    /// `100 + 2·level + 2·vitality`
    pub fn max_hp(level: u32, vitality: i32) -> u32 {
        let vitality = vitality.max(0) as u32;
        100u32
            .saturating_add(level.saturating_mul(2))
            .saturating_add(vitality.saturating_mul(2))
    }

    /// `50 + level + spirit`
    pub fn max_energy(level: u32, spirit: i32) -> u32 {
        50u32
            .saturating_add(level)
            .saturating_add(spirit.max(0) as u32)
    }

    pub fn secondary(level: u32, stats: &CoreStats) -> SecondaryStats {
        let level = level as f64;
        let agility = stats.agility.max(0) as f64;
        let luck = stats.luck.max(0) as f64;
        let defense = stats.defense.max(0);

        SecondaryStats {
            accuracy: 100.0 + 2.0 * agility + level,
            evasion: 2.0 * agility + level,
            crit_chance: (5.0 + luck / 2.0).min(MAX_CRIT_CHANCE),
            crit_damage: 50.0 + luck,
            defense,
            damage_reduction: defense as f64 / (defense as f64 + 100.0),
        }
    }

    /// Resolve a combatant's stats from its base stats and active effects.
    pub fn resolve(combatant: &CombatantState) -> ResolvedStats {
        let mut modified = combatant.base_stats;
        for effect in &combatant.effects {
            modified += effect.stat_deltas;
        }
        let modified = modified.clamped();

        ResolvedStats {
            modified,
            secondary: Self::secondary(combatant.level, &modified),
            max_hp: Self::max_hp(combatant.level, modified.vitality),
            max_energy: Self::max_energy(combatant.level, modified.spirit),
        }
    }

    /// Resolve and write the result back, clamping current HP and energy
    /// down to the new maxima.
    pub fn refresh(combatant: &mut CombatantState) {
        let resolved = Self::resolve(combatant);
        combatant.modified_stats = resolved.modified;
        combatant.secondary_stats = resolved.secondary;
        combatant.max_hp = resolved.max_hp;
        combatant.max_energy = resolved.max_energy;
        combatant.current_hp = combatant.current_hp.min(combatant.max_hp);
        combatant.current_energy = combatant.current_energy.min(combatant.max_energy);
    }
}
