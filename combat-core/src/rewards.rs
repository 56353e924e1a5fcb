//! Victory rewards: experience, currency, loot and quest progress.

use crate::bestiary::{NpcDefinition, Rarity};
use crate::collaborators::{Inventory, QuestEvent, QuestTracker};
use crate::rolls;
use crate::state::ParticipantId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Copper value of one silver coin.
pub const COPPER_PER_SILVER: u64 = 100;
/// Copper value of one gold coin.
pub const COPPER_PER_GOLD: u64 = 10_000;

/// Relative weights of the copper / silver / gold payout tiers.
const CURRENCY_TIER_WEIGHTS: [u32; 3] = [75, 22, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Currency {
    pub copper: u32,
    pub silver: u32,
    pub gold: u32,
}

impl Currency {
    /// Total value in copper.
    pub fn total_value(&self) -> u64 {
        u64::from(self.copper)
            + u64::from(self.silver) * COPPER_PER_SILVER
            + u64::from(self.gold) * COPPER_PER_GOLD
    }

    pub fn is_empty(&self) -> bool {
        self.total_value() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDrop {
    pub item_id: String,
    pub name: String,
    pub rarity: Rarity,
    pub quantity: u32,
}

/// Everything granted for a victory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rewards {
    pub experience: u32,
    pub currency: Currency,
    #[serde(default)]
    pub items: Vec<ItemDrop>,
    /// Quests completed by this victory.
    #[serde(default)]
    pub completed_quests: Vec<String>,
}

/// Computes and grants victory rewards.
pub struct RewardResolver;

impl RewardResolver {
    /// Roll rewards for defeating `npc`.
    pub fn resolve<R: Rng + ?Sized>(npc: &NpcDefinition, rng: &mut R) -> Rewards {
        let experience = Self::experience(npc.rewards.experience, rng);
        let currency = Self::currency(npc.level, rng);
        let items = Self::roll_drop(npc, rng).into_iter().collect();

        Rewards {
            experience,
            currency,
            items,
            completed_quests: Vec::new(),
        }
    }

    /// Base experience plus a random bonus of up to 20%.
    pub fn experience<R: Rng + ?Sized>(base: u32, rng: &mut R) -> u32 {
        let bonus = rolls::range_inclusive(rng, 0, base / 5);
        base.saturating_add(bonus)
    }

    /// One payout tier, amount scaled by NPC level. Never empty.
    pub fn currency<R: Rng + ?Sized>(level: u32, rng: &mut R) -> Currency {
        let level = level.max(1);
        match rolls::weighted_index(rng, &CURRENCY_TIER_WEIGHTS) {
            Some(2) => Currency {
                gold: 1 + level / 10,
                ..Currency::default()
            },
            Some(1) => Currency {
                silver: rolls::range_inclusive(rng, 1, 1 + level / 2),
                ..Currency::default()
            },
            _ => Currency {
                copper: rolls::range_inclusive(rng, 5 * level, 10 * level),
                ..Currency::default()
            },
        }
    }

    /// At most one item: a drop-chance roll, then a rarity-weighted pick.
    pub fn roll_drop<R: Rng + ?Sized>(npc: &NpcDefinition, rng: &mut R) -> Option<ItemDrop> {
        let loot = &npc.rewards.loot;
        if loot.is_empty() || !rolls::probability(rng, npc.rewards.drop_chance) {
            return None;
        }

        let weights: Vec<u32> = loot.iter().map(|entry| entry.rarity.weight()).collect();
        let entry = &loot[rolls::weighted_index(rng, &weights)?];
        Some(ItemDrop {
            item_id: entry.item_id.clone(),
            name: entry.name.clone(),
            rarity: entry.rarity,
            quantity: 1,
        })
    }

    /// Hand item drops to the inventory and settle quest progress.
    ///
    /// Failures are logged and skipped; a victory is never undone.
    pub fn grant(
        rewards: &mut Rewards,
        player: &ParticipantId,
        enemy_id: &str,
        inventory: &dyn Inventory,
        quests: &dyn QuestTracker,
    ) {
        for item in &rewards.items {
            if let Err(e) = inventory.add_item(player, &item.item_id, item.quantity) {
                warn!(player = %player, item = %item.item_id, error = %e, "Failed to add reward item");
            }
        }

        let events = [
            QuestEvent::DefeatEnemy {
                enemy_id: enemy_id.to_string(),
            },
            QuestEvent::DefeatAnyEnemy,
        ];
        let mut satisfied: Vec<String> = Vec::new();
        for event in &events {
            for quest in quests.check_event(player, event) {
                if !satisfied.contains(&quest) {
                    satisfied.push(quest);
                }
            }
        }

        for quest in satisfied {
            match quests.complete_quest(player, &quest) {
                Ok(()) => {
                    debug!(player = %player, quest = %quest, "Quest completed");
                    rewards.completed_quests.push(quest);
                }
                Err(e) => {
                    warn!(player = %player, quest = %quest, error = %e, "Failed to complete quest");
                }
            }
        }
    }
}
