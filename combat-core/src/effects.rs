//! Status effects and their lifecycle.
//!
//! Effects are keyed by name per combatant: applying an effect whose name is
//! already present replaces the old one (last write wins) instead of
//! stacking. Timed effects advance with wall-clock seconds, round effects
//! advance once per full combat round.

use crate::clock::{whole_seconds_between, Millis};
use crate::state::CombatantState;
use crate::stats::{CoreStats, StatResolver};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of modifier an effect is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectCategory {
    /// Raises outgoing damage by `value` (0.25 = +25%).
    Buff,
    Debuff,
    DamageOverTime,
    HealOverTime,
    /// Flat percentage reduction of incoming plain-attack damage (`value`).
    Protect,
    StatModifier,
}

impl EffectCategory {
    pub fn name(&self) -> &'static str {
        match self {
            EffectCategory::Buff => "buff",
            EffectCategory::Debuff => "debuff",
            EffectCategory::DamageOverTime => "damage-over-time",
            EffectCategory::HealOverTime => "heal-over-time",
            EffectCategory::Protect => "protect",
            EffectCategory::StatModifier => "stat-modifier",
        }
    }
}

/// How long an effect lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "amount", rename_all = "snake_case")]
pub enum EffectDuration {
    /// Wall-clock seconds.
    Seconds(u32),
    /// Full combat rounds.
    Rounds(u32),
}

impl EffectDuration {
    pub fn amount(&self) -> u32 {
        match self {
            EffectDuration::Seconds(n) | EffectDuration::Rounds(n) => *n,
        }
    }
}

/// A status effect attached to a combatant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub id: Uuid,
    pub name: String,
    pub category: EffectCategory,
    #[serde(default)]
    pub source: String,
    /// Damage per second (timed) or per round (round-based).
    #[serde(default)]
    pub damage: u32,
    /// Healing per second (timed) or per round (round-based).
    #[serde(default)]
    pub healing: u32,
    /// Energy change per second or round; negative drains.
    #[serde(default)]
    pub energy: i32,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub stat_deltas: CoreStats,
    pub duration: EffectDuration,
    /// Seconds or rounds already consumed.
    #[serde(default)]
    pub elapsed: u32,
    #[serde(default)]
    pub applied_at: Millis,
}

impl Effect {
    pub fn new(name: impl Into<String>, category: EffectCategory, duration: EffectDuration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            category,
            source: String::new(),
            damage: 0,
            healing: 0,
            energy: 0,
            value: 0.0,
            stat_deltas: CoreStats::default(),
            duration,
            elapsed: 0,
            applied_at: 0,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_damage(mut self, damage: u32) -> Self {
        self.damage = damage;
        self
    }

    pub fn with_healing(mut self, healing: u32) -> Self {
        self.healing = healing;
        self
    }

    pub fn with_energy(mut self, energy: i32) -> Self {
        self.energy = energy;
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_stat_deltas(mut self, deltas: CoreStats) -> Self {
        self.stat_deltas = deltas;
        self
    }

    pub fn applied_at(mut self, at: Millis) -> Self {
        self.applied_at = at;
        self
    }

    /// Seconds or rounds left before expiry.
    pub fn remaining(&self) -> u32 {
        self.duration.amount().saturating_sub(self.elapsed)
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed >= self.duration.amount()
    }

    pub fn is_timed(&self) -> bool {
        matches!(self.duration, EffectDuration::Seconds(_))
    }

    /// Outgoing damage bonus contributed by this effect.
    pub fn damage_bonus(&self) -> f64 {
        match self.category {
            EffectCategory::Buff if self.value.is_finite() => self.value,
            _ => 0.0,
        }
    }

    /// Incoming damage reduction contributed by this effect, in `[0, 1]`.
    pub fn damage_reduction(&self) -> f64 {
        match self.category {
            EffectCategory::Protect if self.value.is_finite() => self.value.clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Net result of advancing effects on one combatant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// HP actually lost.
    pub damage: u32,
    /// HP actually restored.
    pub healing: u32,
    /// Net energy change actually applied.
    pub energy: i32,
    /// Names of effects that expired.
    pub expired: Vec<String>,
    /// HP reached zero during this pass.
    pub defeated: bool,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.damage == 0 && self.healing == 0 && self.energy == 0 && self.expired.is_empty()
    }
}

/// Owns the effect lifecycle of a combatant.
pub struct EffectEngine;

impl EffectEngine {
    /// Apply effects, replacing any existing effect with the same name.
    ///
    /// Returns the names of effects that were replaced.
    pub fn apply(
        combatant: &mut CombatantState,
        new_effects: impl IntoIterator<Item = Effect>,
    ) -> Vec<String> {
        let mut replaced = Vec::new();
        for effect in new_effects {
            if let Some(existing) = combatant.effects.iter_mut().find(|e| e.name == effect.name) {
                replaced.push(effect.name.clone());
                *existing = effect;
            } else {
                combatant.effects.push(effect);
            }
        }
        StatResolver::refresh(combatant);
        replaced
    }

    /// Catch timed effects up to `now`.
    ///
    /// Each effect counts whole seconds from its own `applied_at` and
    /// contributes its per-second values once per second it has not yet
    /// been charged for, never past its duration. One large catch-up tick
    /// therefore yields the same totals as many small ones.
    pub fn tick(combatant: &mut CombatantState, now: Millis) -> TickReport {
        let mut damage: u64 = 0;
        let mut healing: u64 = 0;
        let mut energy: i64 = 0;

        for effect in combatant.effects.iter_mut().filter(|e| e.is_timed()) {
            let due = whole_seconds_between(effect.applied_at, now).min(effect.duration.amount());
            let seconds = due.saturating_sub(effect.elapsed);
            if seconds == 0 {
                continue;
            }
            damage += u64::from(effect.damage) * u64::from(seconds);
            healing += u64::from(effect.healing) * u64::from(seconds);
            energy += i64::from(effect.energy) * i64::from(seconds);
            effect.elapsed += seconds;
        }

        let mut report = Self::apply_totals(combatant, damage, healing, energy);
        report.expired = Self::expire(combatant);
        report
    }

    /// Advance round-based effects by one full round.
    pub fn advance_round(combatant: &mut CombatantState) -> TickReport {
        let mut damage: u64 = 0;
        let mut healing: u64 = 0;
        let mut energy: i64 = 0;

        for effect in combatant.effects.iter_mut().filter(|e| !e.is_timed()) {
            if effect.is_expired() {
                continue;
            }
            damage += u64::from(effect.damage);
            healing += u64::from(effect.healing);
            energy += i64::from(effect.energy);
            effect.elapsed += 1;
        }

        let mut report = Self::apply_totals(combatant, damage, healing, energy);
        report.expired = Self::expire(combatant);
        report
    }

    /// Remove effects whose duration is used up. Stats are recomputed when
    /// anything was removed.
    pub fn expire(combatant: &mut CombatantState) -> Vec<String> {
        let mut expired = Vec::new();
        combatant.effects.retain(|effect| {
            if effect.is_expired() {
                expired.push(effect.name.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            StatResolver::refresh(combatant);
        }
        expired
    }

    /// Remove an effect by name.
    pub fn remove(combatant: &mut CombatantState, name: &str) -> Option<Effect> {
        let index = combatant.effects.iter().position(|e| e.name == name)?;
        let removed = combatant.effects.remove(index);
        StatResolver::refresh(combatant);
        Some(removed)
    }

    /// Sum of active outgoing damage bonuses.
    pub fn damage_bonus(combatant: &CombatantState) -> f64 {
        combatant.effects.iter().map(Effect::damage_bonus).sum()
    }

    /// Strongest active protect reduction.
    pub fn protection(combatant: &CombatantState) -> f64 {
        combatant
            .effects
            .iter()
            .map(Effect::damage_reduction)
            .fold(0.0, f64::max)
    }

    fn apply_totals(
        combatant: &mut CombatantState,
        damage: u64,
        healing: u64,
        energy: i64,
    ) -> TickReport {
        let hp_before = i64::from(combatant.current_hp);
        let hp_after = (hp_before + healing as i64 - damage as i64).clamp(0, i64::from(combatant.max_hp));
        combatant.current_hp = hp_after as u32;

        let energy_before = i64::from(combatant.current_energy);
        let energy_after = (energy_before + energy).clamp(0, i64::from(combatant.max_energy));
        combatant.current_energy = energy_after as u32;

        let hp_delta = hp_after - hp_before;
        TickReport {
            damage: if hp_delta < 0 { (-hp_delta) as u32 } else { 0 },
            healing: if hp_delta > 0 { hp_delta as u32 } else { 0 },
            energy: (energy_after - energy_before) as i32,
            expired: Vec::new(),
            defeated: damage > 0 && hp_after == 0,
        }
    }
}
