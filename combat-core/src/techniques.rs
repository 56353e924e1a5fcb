//! Cultivation techniques: named actions with precomputed magnitudes and an
//! energy cost.

use crate::clock::Millis;
use crate::damage::DamageType;
use crate::effects::{Effect, EffectCategory, EffectDuration};
use crate::state::CombatantState;
use crate::stats::CoreStats;
use serde::{Deserialize, Serialize};

/// Blueprint for an effect a technique or NPC attack attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectTemplate {
    pub name: String,
    pub category: EffectCategory,
    #[serde(default)]
    pub damage: u32,
    #[serde(default)]
    pub healing: u32,
    #[serde(default)]
    pub energy: i32,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub stat_deltas: CoreStats,
    pub duration: EffectDuration,
}

impl EffectTemplate {
    pub fn new(name: impl Into<String>, category: EffectCategory, duration: EffectDuration) -> Self {
        Self {
            name: name.into(),
            category,
            damage: 0,
            healing: 0,
            energy: 0,
            value: 0.0,
            stat_deltas: CoreStats::default(),
            duration,
        }
    }

    pub fn with_damage(mut self, damage: u32) -> Self {
        self.damage = damage;
        self
    }

    pub fn with_healing(mut self, healing: u32) -> Self {
        self.healing = healing;
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

    /// Create a live effect with a fresh id.
    pub fn instantiate(&self, source: &str, now: Millis) -> Effect {
        Effect::new(self.name.clone(), self.category, self.duration)
            .with_source(source)
            .with_damage(self.damage)
            .with_healing(self.healing)
            .with_energy(self.energy)
            .with_value(self.value)
            .with_stat_deltas(self.stat_deltas)
            .applied_at(now)
    }
}

/// A technique a cultivator can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technique {
    pub id: String,
    pub name: String,
    pub element: DamageType,
    pub energy_cost: u32,
    /// Flat damage before spirit scaling. Zero for support techniques.
    pub power: u32,
    /// Fraction of the caster's spirit added to damage or healing.
    pub spirit_scaling: f64,
    /// Flat healing for the caster before spirit scaling.
    pub healing: u32,
    #[serde(default)]
    pub target_effects: Vec<EffectTemplate>,
    #[serde(default)]
    pub self_effects: Vec<EffectTemplate>,
}

impl Technique {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        element: DamageType,
        energy_cost: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            element,
            energy_cost,
            power: 0,
            spirit_scaling: 0.0,
            healing: 0,
            target_effects: Vec::new(),
            self_effects: Vec::new(),
        }
    }

    pub fn with_power(mut self, power: u32, spirit_scaling: f64) -> Self {
        self.power = power;
        self.spirit_scaling = spirit_scaling;
        self
    }

    pub fn with_healing(mut self, healing: u32, spirit_scaling: f64) -> Self {
        self.healing = healing;
        self.spirit_scaling = spirit_scaling;
        self
    }

    pub fn with_target_effect(mut self, effect: EffectTemplate) -> Self {
        self.target_effects.push(effect);
        self
    }

    pub fn with_self_effect(mut self, effect: EffectTemplate) -> Self {
        self.self_effects.push(effect);
        self
    }

    pub fn is_offensive(&self) -> bool {
        self.power > 0
    }

    /// Damage against `defender`, with half its defense already subtracted.
    ///
    /// The result feeds a precomputed damage request, so the resolver does
    /// not subtract defense a second time. Zero for support techniques.
    pub fn precompute_damage(&self, attacker: &CombatantState, defender: &CombatantState) -> u32 {
        if !self.is_offensive() {
            return 0;
        }
        let scaled = self.power as f64 + self.spirit_scaling * attacker.modified_stats.spirit as f64;
        let after_defense = scaled - defender.modified_stats.defense as f64 / 2.0;
        after_defense.floor().max(1.0) as u32
    }

    /// Healing for the caster. Zero for techniques that do not heal.
    pub fn precompute_healing(&self, caster: &CombatantState) -> u32 {
        if self.healing == 0 {
            return 0;
        }
        let scaled = self.healing as f64 + self.spirit_scaling * caster.modified_stats.spirit as f64;
        scaled.floor().max(0.0) as u32
    }
}

lazy_static::lazy_static! {
    /// Built-in techniques.
    pub static ref TECHNIQUES: Vec<Technique> = vec![
        Technique::new("flame_palm", "Flame Palm", DamageType::Fire, 15)
            .with_power(25, 0.5),
        Technique::new("jade_rejuvenation", "Jade Rejuvenation", DamageType::Wood, 20)
            .with_healing(30, 0.5),
        Technique::new("venom_needle", "Venom Needle", DamageType::Poison, 12)
            .with_power(10, 0.2)
            .with_target_effect(
                EffectTemplate::new("Venom", EffectCategory::DamageOverTime, EffectDuration::Seconds(5))
                    .with_damage(3),
            ),
        Technique::new("iron_skin", "Iron Skin", DamageType::Metal, 15)
            .with_self_effect(
                EffectTemplate::new("Iron Skin", EffectCategory::StatModifier, EffectDuration::Rounds(3))
                    .with_stat_deltas(CoreStats::new(0, 15, 0, 0, 0, 0)),
            ),
        Technique::new("thunder_strike", "Thunder Strike", DamageType::Lightning, 30)
            .with_power(45, 0.8),
        Technique::new("spirit_surge", "Spirit Surge", DamageType::Spirit, 10)
            .with_self_effect(
                EffectTemplate::new("Spirit Surge", EffectCategory::Buff, EffectDuration::Rounds(2))
                    .with_value(0.25),
            ),
    ];
}

/// Look up a technique by id or display name (case-insensitive).
pub fn get_technique(id: &str) -> Option<Technique> {
    TECHNIQUES
        .iter()
        .find(|t| t.id.eq_ignore_ascii_case(id) || t.name.eq_ignore_ascii_case(id))
        .cloned()
}
