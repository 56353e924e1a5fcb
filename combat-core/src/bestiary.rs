//! NPC definitions: stats, attack lists and reward tables.

use crate::damage::DamageType;
use crate::effects::{EffectCategory, EffectDuration};
use crate::state::{CombatantState, ParticipantId};
use crate::stats::CoreStats;
use crate::techniques::EffectTemplate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One attack in an NPC's repertoire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcAttack {
    pub name: String,
    /// Precomputed damage. `None` means a plain attack.
    #[serde(default)]
    pub damage: Option<u32>,
    #[serde(default)]
    pub damage_type: DamageType,
    #[serde(default)]
    pub energy_cost: u32,
    /// Effects attached to the target on hit.
    #[serde(default)]
    pub effects: Vec<EffectTemplate>,
}

impl NpcAttack {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            damage: None,
            damage_type: DamageType::Physical,
            energy_cost: 0,
            effects: Vec::new(),
        }
    }

    pub fn special(name: impl Into<String>, damage: u32, damage_type: DamageType, energy_cost: u32) -> Self {
        Self {
            name: name.into(),
            damage: Some(damage),
            damage_type,
            energy_cost,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: EffectTemplate) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Item rarity tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    /// Relative selection weight among eligible loot.
    pub fn weight(&self) -> u32 {
        match self {
            Rarity::Common => 60,
            Rarity::Uncommon => 25,
            Rarity::Rare => 10,
            Rarity::Epic => 4,
            Rarity::Legendary => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LootEntry {
    pub item_id: String,
    pub name: String,
    pub rarity: Rarity,
}

impl LootEntry {
    pub fn new(item_id: impl Into<String>, name: impl Into<String>, rarity: Rarity) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            rarity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTable {
    /// Base experience before the random bonus.
    pub experience: u32,
    /// Probability in `[0, 1]` that anything drops at all.
    pub drop_chance: f64,
    #[serde(default)]
    pub loot: Vec<LootEntry>,
}

/// A kind of enemy the player can fight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcDefinition {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub stats: CoreStats,
    #[serde(default)]
    pub element: Option<DamageType>,
    pub attacks: Vec<NpcAttack>,
    pub rewards: RewardTable,
}

impl NpcDefinition {
    /// Fresh combatant for a new fight.
    pub fn to_combatant(&self) -> CombatantState {
        let combatant = CombatantState::new(
            ParticipantId::from(self.id.as_str()),
            self.name.clone(),
            false,
            self.level,
            self.stats,
        );
        match self.element {
            Some(element) => combatant.with_element(element),
            None => combatant,
        }
    }
}

fn venom(damage: u32, seconds: u32) -> EffectTemplate {
    EffectTemplate::new("Venom", EffectCategory::DamageOverTime, EffectDuration::Seconds(seconds))
        .with_damage(damage)
}

lazy_static::lazy_static! {
    /// Built-in NPCs.
    pub static ref NPCS: Vec<NpcDefinition> = vec![
        NpcDefinition {
            id: "wild_boar".to_string(),
            name: "Wild Boar".to_string(),
            level: 3,
            stats: CoreStats::new(8, 5, 10, 0, 4, 0),
            element: None,
            attacks: vec![
                NpcAttack::plain("Tusk Charge"),
                NpcAttack::special("Gore", 18, DamageType::Physical, 15),
            ],
            rewards: RewardTable {
                experience: 50,
                drop_chance: 0.5,
                loot: vec![
                    LootEntry::new("boar_hide", "Boar Hide", Rarity::Common),
                    LootEntry::new("boar_tusk", "Boar Tusk", Rarity::Uncommon),
                ],
            },
        },
        NpcDefinition {
            id: "jade_serpent".to_string(),
            name: "Jade Serpent".to_string(),
            level: 6,
            stats: CoreStats::new(10, 8, 12, 15, 14, 4),
            element: Some(DamageType::Wood),
            attacks: vec![
                NpcAttack::plain("Bite"),
                NpcAttack::special("Poison Bite", 12, DamageType::Poison, 10).with_effect(venom(2, 6)),
            ],
            rewards: RewardTable {
                experience: 90,
                drop_chance: 0.6,
                loot: vec![
                    LootEntry::new("serpent_scale", "Jade Serpent Scale", Rarity::Common),
                    LootEntry::new("venom_sac", "Venom Sac", Rarity::Uncommon),
                    LootEntry::new("jade_fang", "Jade Fang", Rarity::Rare),
                ],
            },
        },
        NpcDefinition {
            id: "bandit_cultivator".to_string(),
            name: "Bandit Cultivator".to_string(),
            level: 8,
            stats: CoreStats::new(16, 12, 18, 12, 10, 6),
            element: Some(DamageType::Metal),
            attacks: vec![
                NpcAttack::plain("Saber Slash"),
                NpcAttack::special("Iron Fist", 24, DamageType::Metal, 15),
            ],
            rewards: RewardTable {
                experience: 140,
                drop_chance: 0.7,
                loot: vec![
                    LootEntry::new("qi_pill", "Qi Gathering Pill", Rarity::Common),
                    LootEntry::new("bandit_saber", "Notched Saber", Rarity::Uncommon),
                    LootEntry::new("stolen_manual", "Stolen Cultivation Manual", Rarity::Rare),
                ],
            },
        },
        NpcDefinition {
            id: "frost_wolf".to_string(),
            name: "Frost Wolf".to_string(),
            level: 10,
            stats: CoreStats::new(18, 10, 16, 8, 20, 5),
            element: Some(DamageType::Water),
            attacks: vec![
                NpcAttack::plain("Claw"),
                NpcAttack::special("Frost Fang", 22, DamageType::Water, 12).with_effect(
                    EffectTemplate::new("Frostbite", EffectCategory::Debuff, EffectDuration::Rounds(2))
                        .with_stat_deltas(CoreStats::new(0, 0, 0, 0, -5, 0)),
                ),
            ],
            rewards: RewardTable {
                experience: 180,
                drop_chance: 0.6,
                loot: vec![
                    LootEntry::new("wolf_pelt", "Frost Wolf Pelt", Rarity::Common),
                    LootEntry::new("ice_core", "Ice Beast Core", Rarity::Rare),
                ],
            },
        },
        NpcDefinition {
            id: "ancient_tree_spirit".to_string(),
            name: "Ancient Tree Spirit".to_string(),
            level: 15,
            stats: CoreStats::new(12, 30, 40, 30, 2, 8),
            element: Some(DamageType::Wood),
            attacks: vec![
                NpcAttack::plain("Thorn Lash"),
                NpcAttack::special("Root Crush", 35, DamageType::Wood, 20),
                NpcAttack::special("Spore Cloud", 10, DamageType::Poison, 15).with_effect(venom(4, 5)),
            ],
            rewards: RewardTable {
                experience: 320,
                drop_chance: 0.8,
                loot: vec![
                    LootEntry::new("spirit_wood", "Spirit Wood", Rarity::Uncommon),
                    LootEntry::new("heartwood_core", "Heartwood Core", Rarity::Epic),
                    LootEntry::new("world_seed", "Seed of the World Tree", Rarity::Legendary),
                ],
            },
        },
    ];
}

/// Look up a built-in NPC by id (case-insensitive).
pub fn get_npc(id: &str) -> Option<NpcDefinition> {
    NPCS.iter().find(|n| n.id.eq_ignore_ascii_case(id)).cloned()
}

/// Built-in NPCs plus definitions registered by the host.
#[derive(Debug, Clone, Default)]
pub struct Bestiary {
    custom: HashMap<String, NpcDefinition>,
}

impl Bestiary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Shadows a built-in NPC with the same id.
    pub fn register(&mut self, definition: NpcDefinition) {
        self.custom.insert(definition.id.to_lowercase(), definition);
    }

    pub fn with(mut self, definition: NpcDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, id: &str) -> Option<NpcDefinition> {
        self.custom
            .get(&id.to_lowercase())
            .cloned()
            .or_else(|| get_npc(id))
    }
}
