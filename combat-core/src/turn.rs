//! The turn state machine.
//!
//! Actions are handled in two steps, mirroring intent resolution elsewhere
//! in the engine:
//!
//! 1. **Resolve**: validate an [`Action`] and compute a [`Resolution`], a
//!    list of [`CombatEvent`]s plus a narrative line, without touching the
//!    session.
//! 2. **Apply**: [`TurnController::apply`] mutates the session according to
//!    those events, advances turn ownership and ends the fight when a side
//!    falls.
//!
//! Rejected actions never mutate the session.

use crate::bestiary::{NpcAttack, NpcDefinition};
use crate::clock::Millis;
use crate::collaborators::{PetAbilityOutcome, PetCompanion, PetError, WeatherModifiers};
use crate::config::CombatConfig;
use crate::damage::{ActionOutcome, DamageRequest, DamageResolver, DamageType};
use crate::effects::{Effect, EffectCategory, EffectDuration, EffectEngine, TickReport};
use crate::rolls;
use crate::state::{
    CombatOutcome, CombatSession, LogEntry, ParticipantId, ProcessingGuard, Side,
};
use crate::techniques::{get_technique, Technique};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the protect effect attached by the defend action.
pub const DEFEND_EFFECT: &str = "Defend";

// ============================================================================
// Actions and Errors
// ============================================================================

/// An action submitted by the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Attack,
    Technique {
        id: String,
        /// Overrides the catalog cost.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_cost: Option<u32>,
        /// Damage computed by the caller. Used as-is, defense is not
        /// subtracted again.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        damage: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        damage_type: Option<DamageType>,
    },
    PetAbility {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_cost: Option<u32>,
    },
    Defend,
    Flee,
}

impl Action {
    pub fn technique(id: impl Into<String>) -> Self {
        Action::Technique {
            id: id.into(),
            energy_cost: None,
            damage: None,
            damage_type: None,
        }
    }

    pub fn pet_ability(id: impl Into<String>) -> Self {
        Action::PetAbility {
            id: id.into(),
            energy_cost: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Attack => "attack",
            Action::Technique { .. } => "technique",
            Action::PetAbility { .. } => "pet-ability",
            Action::Defend => "defend",
            Action::Flee => "flee",
        }
    }
}

/// Why an action was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CombatError {
    #[error("combat has already ended")]
    SessionCompleted,

    #[error("{0} is not part of this fight")]
    NotAParticipant(ParticipantId),

    #[error("the enemy acts on its own")]
    EnemyControlled,

    #[error("another action is still being resolved")]
    ActionInProgress,

    #[error("it is not your turn")]
    NotYourTurn,

    #[error("not enough energy: need {required}, have {available}")]
    InsufficientEnergy { required: u32, available: u32 },

    #[error("unknown technique: {0}")]
    UnknownTechnique(String),

    #[error("pet ability failed: {0}")]
    PetAbility(#[from] PetError),

    #[error("the session changed while the action was resolving")]
    ResolutionAbandoned,
}

// ============================================================================
// Events and Resolutions
// ============================================================================

/// A concrete state change produced by resolving an action.
#[derive(Debug, Clone, PartialEq)]
pub enum CombatEvent {
    EnergySpent { side: Side, amount: u32 },
    Damaged { side: Side, amount: u32, is_critical: bool },
    Dodged { side: Side },
    Healed { side: Side, amount: u32 },
    EffectApplied { side: Side, effect: Effect },
    FleeFailed,
    TurnPassed { to: Side },
    /// Control returned to the player; round-based effects decay and both
    /// sides regenerate energy.
    RoundCompleted { round: u32 },
    CombatEnded { outcome: CombatOutcome },
}

/// The result of resolving one action, ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub actor: Side,
    pub events: Vec<CombatEvent>,
    pub narrative: String,
    pub outcome: ActionOutcome,
}

impl Resolution {
    pub fn new(actor: Side, narrative: impl Into<String>) -> Self {
        Self {
            actor,
            events: Vec::new(),
            narrative: narrative.into(),
            outcome: ActionOutcome::default(),
        }
    }

    pub fn with_event(mut self, event: CombatEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = CombatEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn with_outcome(mut self, outcome: ActionOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Damage dealt to `side` by this resolution.
    pub fn damage_to(&self, side: Side) -> u32 {
        self.events
            .iter()
            .map(|event| match event {
                CombatEvent::Damaged { side: s, amount, .. } if *s == side => *amount,
                _ => 0,
            })
            .sum()
    }
}

/// A validated player action with everything it needs from collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedAction {
    Attack {
        elemental_bonus: f64,
    },
    Technique {
        technique: Technique,
        energy_cost: u32,
        damage: Option<u32>,
        damage_type: DamageType,
        elemental_bonus: f64,
    },
    PetAbility {
        ability: PetAbilityOutcome,
        energy_cost: u32,
        elemental_bonus: f64,
    },
    Defend,
    Flee {
        chance: f64,
    },
}

/// Per-resolution inputs that come from outside the session.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub weather: WeatherModifiers,
    pub now: Millis,
}

impl TurnContext {
    pub fn new(weather: WeatherModifiers, now: Millis) -> Self {
        Self { weather, now }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Drives sessions through `PlayerTurn -> Resolving -> EnemyTurn -> ...`.
#[derive(Debug, Clone)]
pub struct TurnController {
    config: CombatConfig,
    damage: DamageResolver,
}

impl TurnController {
    pub fn new(config: CombatConfig) -> Self {
        let damage = DamageResolver::new(config.damage_rules());
        Self { config, damage }
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }

    /// Check that `actor` may act right now. Returns the actor's side.
    pub fn validate(&self, session: &CombatSession, actor: &ParticipantId) -> Result<Side, CombatError> {
        if !session.is_active() {
            return Err(CombatError::SessionCompleted);
        }
        let side = session
            .side_of(actor)
            .ok_or_else(|| CombatError::NotAParticipant(actor.clone()))?;
        if side == Side::Enemy {
            return Err(CombatError::EnemyControlled);
        }
        if session.processing.is_some() {
            return Err(CombatError::ActionInProgress);
        }
        if session.turn != side {
            return Err(CombatError::NotYourTurn);
        }
        Ok(side)
    }

    /// Validate an action and gather what it needs.
    ///
    /// The pet is consulted last: using an ability costs the pet hunger and
    /// loyalty, so it only happens once everything else checks out. Callers
    /// that discard the prepared action afterwards must call
    /// [`PetCompanion::refund_ability`].
    pub fn prepare(
        &self,
        session: &CombatSession,
        actor: &ParticipantId,
        action: &Action,
        pet: &dyn PetCompanion,
    ) -> Result<PreparedAction, CombatError> {
        self.validate(session, actor)?;
        let player = &session.player_state;

        match action {
            Action::Attack => Ok(PreparedAction::Attack {
                elemental_bonus: pet.elemental_bonus(actor, DamageType::Physical),
            }),
            Action::Technique {
                id,
                energy_cost,
                damage,
                damage_type,
            } => {
                let technique = get_technique(id)
                    .filter(|t| player.techniques.is_empty() || player.knows_technique(&t.id))
                    .ok_or_else(|| CombatError::UnknownTechnique(id.clone()))?;
                let energy_cost = energy_cost.unwrap_or(technique.energy_cost);
                ensure_energy(player.current_energy, energy_cost)?;
                let damage_type = damage_type.unwrap_or(technique.element);

                Ok(PreparedAction::Technique {
                    elemental_bonus: pet.elemental_bonus(actor, damage_type),
                    technique,
                    energy_cost,
                    damage: *damage,
                    damage_type,
                })
            }
            Action::PetAbility { id, energy_cost } => {
                let energy_cost = energy_cost.unwrap_or(0);
                ensure_energy(player.current_energy, energy_cost)?;
                let ability = pet.use_ability(actor, id)?;
                Ok(PreparedAction::PetAbility {
                    elemental_bonus: pet.elemental_bonus(actor, ability.damage_type),
                    ability,
                    energy_cost,
                })
            }
            Action::Defend => Ok(PreparedAction::Defend),
            Action::Flee => Ok(PreparedAction::Flee {
                chance: (self.config.flee_chance + pet.flee_bonus(actor)).clamp(0.0, 1.0),
            }),
        }
    }

    /// Enter the resolving phase.
    pub fn begin_resolving(&self, session: &mut CombatSession, owner: Side, now: Millis) {
        session.processing = Some(ProcessingGuard { owner, since: now });
        session.touch();
    }

    /// Resolve a prepared player action.
    pub fn resolve_player_action<R: Rng + ?Sized>(
        &self,
        session: &CombatSession,
        prepared: PreparedAction,
        ctx: &TurnContext,
        rng: &mut R,
    ) -> Resolution {
        let player = &session.player_state;
        let enemy = &session.enemy_state;
        let source = player.id.as_str();

        let resolution = match prepared {
            PreparedAction::Attack { elemental_bonus } => {
                let request = DamageRequest::plain().with_elemental_bonus(elemental_bonus);
                let outcome = self.damage.compute_action(player, enemy, &request, &ctx.weather, rng);
                Resolution::new(Side::Player, describe(&player.name, "attacks", &enemy.name, &outcome))
                    .with_events(hit_events(Side::Enemy, &outcome))
                    .with_outcome(outcome)
            }
            PreparedAction::Technique {
                technique,
                energy_cost,
                damage,
                damage_type,
                elemental_bonus,
            } => {
                let mut events = vec![CombatEvent::EnergySpent {
                    side: Side::Player,
                    amount: energy_cost,
                }];
                let mut outcome = ActionOutcome::default();

                let healing = technique.precompute_healing(player);
                if healing > 0 {
                    let heal = self.damage.compute_action(
                        player,
                        player,
                        &DamageRequest::healing(healing),
                        &ctx.weather,
                        rng,
                    );
                    outcome.healing = heal.healing;
                    events.push(CombatEvent::Healed {
                        side: Side::Player,
                        amount: heal.healing,
                    });
                }

                let damage = damage.or_else(|| {
                    technique
                        .is_offensive()
                        .then(|| technique.precompute_damage(player, enemy))
                });
                let mut landed = damage.is_none();
                if let Some(damage) = damage {
                    let request = DamageRequest::precomputed(damage, damage_type)
                        .with_elemental_bonus(elemental_bonus);
                    let hit = self.damage.compute_action(player, enemy, &request, &ctx.weather, rng);
                    events.extend(hit_events(Side::Enemy, &hit));
                    landed = !hit.is_dodge;
                    outcome = ActionOutcome {
                        healing: outcome.healing,
                        ..hit
                    };
                }

                if landed {
                    events.extend(technique.target_effects.iter().map(|t| CombatEvent::EffectApplied {
                        side: Side::Enemy,
                        effect: t.instantiate(source, ctx.now),
                    }));
                }
                events.extend(technique.self_effects.iter().map(|t| CombatEvent::EffectApplied {
                    side: Side::Player,
                    effect: t.instantiate(source, ctx.now),
                }));

                let verb = format!("uses {}", technique.name);
                Resolution::new(Side::Player, describe(&player.name, &verb, &enemy.name, &outcome))
                    .with_events(events)
                    .with_outcome(outcome)
            }
            PreparedAction::PetAbility {
                ability,
                energy_cost,
                elemental_bonus,
            } => {
                let mut events = Vec::new();
                if energy_cost > 0 {
                    events.push(CombatEvent::EnergySpent {
                        side: Side::Player,
                        amount: energy_cost,
                    });
                }
                let mut outcome = ActionOutcome::default();

                if ability.healing > 0 {
                    outcome.healing = ability.healing;
                    events.push(CombatEvent::Healed {
                        side: Side::Player,
                        amount: ability.healing,
                    });
                }

                let mut landed = true;
                if ability.damage > 0 {
                    let request = DamageRequest::precomputed(ability.damage, ability.damage_type)
                        .with_elemental_bonus(elemental_bonus);
                    let hit = self.damage.compute_action(player, enemy, &request, &ctx.weather, rng);
                    events.extend(hit_events(Side::Enemy, &hit));
                    landed = !hit.is_dodge;
                    outcome = ActionOutcome {
                        healing: outcome.healing,
                        ..hit
                    };
                }

                if landed {
                    events.extend(ability.target_effects.iter().cloned().map(|effect| {
                        CombatEvent::EffectApplied {
                            side: Side::Enemy,
                            effect: effect.applied_at(ctx.now),
                        }
                    }));
                }
                events.extend(ability.self_effects.iter().cloned().map(|effect| {
                    CombatEvent::EffectApplied {
                        side: Side::Player,
                        effect: effect.applied_at(ctx.now),
                    }
                }));

                let pet_name = format!("{}'s spirit pet", player.name);
                let verb = format!("uses {}", ability.name);
                Resolution::new(Side::Player, describe(&pet_name, &verb, &enemy.name, &outcome))
                    .with_events(events)
                    .with_outcome(outcome)
            }
            PreparedAction::Defend => {
                let guard = Effect::new(
                    DEFEND_EFFECT,
                    EffectCategory::Protect,
                    EffectDuration::Rounds(self.config.defend_rounds),
                )
                .with_value(self.config.defend_reduction)
                .with_source(source)
                .applied_at(ctx.now);
                Resolution::new(Side::Player, format!("{} takes a defensive stance.", player.name))
                    .with_event(CombatEvent::EffectApplied {
                        side: Side::Player,
                        effect: guard,
                    })
            }
            PreparedAction::Flee { chance } => {
                if rolls::probability(rng, chance) {
                    return Resolution::new(Side::Player, format!("{} flees from battle!", player.name))
                        .with_event(CombatEvent::CombatEnded {
                            outcome: CombatOutcome::Fled,
                        });
                }
                Resolution::new(Side::Player, format!("{} tries to flee but cannot escape!", player.name))
                    .with_event(CombatEvent::FleeFailed)
            }
        };

        debug!(
            session = %session.id,
            narrative = %resolution.narrative,
            events = resolution.events.len(),
            "Resolved player action"
        );
        resolution.with_event(CombatEvent::TurnPassed { to: Side::Enemy })
    }

    /// Resolve the enemy's turn: a random affordable attack from its
    /// repertoire, or a plain strike when nothing is affordable.
    pub fn resolve_enemy_turn<R: Rng + ?Sized>(
        &self,
        session: &CombatSession,
        npc: &NpcDefinition,
        ctx: &TurnContext,
        rng: &mut R,
    ) -> Resolution {
        let enemy = &session.enemy_state;
        let player = &session.player_state;

        let affordable: Vec<&NpcAttack> = npc
            .attacks
            .iter()
            .filter(|a| a.energy_cost <= enemy.current_energy)
            .collect();
        let fallback = NpcAttack::plain("Strike");
        let attack = rolls::pick(rng, &affordable).copied().unwrap_or(&fallback);

        let request = match attack.damage {
            Some(damage) => DamageRequest::precomputed(damage, attack.damage_type),
            None => DamageRequest::plain().with_damage_type(attack.damage_type),
        };
        let outcome = self.damage.compute_action(enemy, player, &request, &ctx.weather, rng);

        let mut events = Vec::new();
        if attack.energy_cost > 0 {
            events.push(CombatEvent::EnergySpent {
                side: Side::Enemy,
                amount: attack.energy_cost,
            });
        }
        events.extend(hit_events(Side::Player, &outcome));
        if !outcome.is_dodge {
            events.extend(attack.effects.iter().map(|t| CombatEvent::EffectApplied {
                side: Side::Player,
                effect: t.instantiate(enemy.id.as_str(), ctx.now),
            }));
        }
        events.push(CombatEvent::TurnPassed { to: Side::Player });
        events.push(CombatEvent::RoundCompleted { round: session.round });

        let verb = format!("uses {}", attack.name);
        let resolution = Resolution::new(Side::Enemy, describe(&enemy.name, &verb, &player.name, &outcome))
            .with_events(events)
            .with_outcome(outcome);

        debug!(
            session = %session.id,
            attack = %attack.name,
            damage = outcome.damage,
            "Resolved enemy turn"
        );
        resolution
    }

    /// Apply a resolution to the session.
    ///
    /// Events after the fight ends are skipped. Clears the resolving guard.
    pub fn apply(&self, session: &mut CombatSession, resolution: &Resolution, now: Millis) {
        let actor_id = session.combatant(resolution.actor).id.clone();
        session.push_log(LogEntry::action(
            session.turn_number,
            actor_id,
            resolution.narrative.clone(),
            &resolution.outcome,
            now,
        ));

        for event in &resolution.events {
            if !session.is_active() {
                break;
            }
            self.apply_event(session, event, now);
            self.settle_defeat(session, now);
        }

        session.processing = None;
        session.touch();
    }

    fn apply_event(&self, session: &mut CombatSession, event: &CombatEvent, now: Millis) {
        match event {
            CombatEvent::EnergySpent { side, amount } => {
                let combatant = session.combatant_mut(*side);
                combatant.current_energy = combatant.current_energy.saturating_sub(*amount);
            }
            CombatEvent::Damaged { side, amount, .. } => {
                session.combatant_mut(*side).take_damage(*amount);
            }
            CombatEvent::Healed { side, amount } => {
                session.combatant_mut(*side).heal(*amount);
            }
            CombatEvent::EffectApplied { side, effect } => {
                EffectEngine::apply(session.combatant_mut(*side), [effect.clone()]);
            }
            CombatEvent::Dodged { .. } | CombatEvent::FleeFailed => {}
            CombatEvent::TurnPassed { to } => {
                session.turn = *to;
                session.turn_number += 1;
                session.turn_started_at = now;
            }
            CombatEvent::RoundCompleted { .. } => {
                self.complete_round(session, now);
            }
            CombatEvent::CombatEnded { outcome } => {
                session.finish(*outcome, now);
            }
        }
    }

    /// Decay round-based effects and regenerate energy on both sides.
    fn complete_round(&self, session: &mut CombatSession, now: Millis) {
        for side in [Side::Player, Side::Enemy] {
            let report = EffectEngine::advance_round(session.combatant_mut(side));
            log_tick(session, side, &report, now);
            session
                .combatant_mut(side)
                .restore_energy(self.config.energy_regen_per_round);
        }
        session.round += 1;
    }

    /// End the fight if a side has fallen. The player falling takes
    /// precedence when both have.
    pub fn settle_defeat(&self, session: &mut CombatSession, now: Millis) -> Option<CombatOutcome> {
        if !session.is_active() {
            return None;
        }
        let outcome = if session.player_state.is_defeated() {
            CombatOutcome::Defeat
        } else if session.enemy_state.is_defeated() {
            CombatOutcome::Victory
        } else {
            return None;
        };
        session.finish(outcome, now);
        Some(outcome)
    }

    /// Catch up time-based effects to `now`.
    ///
    /// Every timed effect is charged for the whole seconds elapsed since it
    /// was applied. Skipped while an action is resolving, since that action
    /// will replace the session. Returns whether the session changed.
    pub fn evaluate(&self, session: &mut CombatSession, now: Millis) -> bool {
        if !session.is_active() || session.processing.is_some() {
            return false;
        }

        let mut changed = false;
        for side in [Side::Player, Side::Enemy] {
            let report = EffectEngine::tick(session.combatant_mut(side), now);
            changed |= !report.is_empty();
            log_tick(session, side, &report, now);
        }
        if !changed {
            return false;
        }
        session.last_updated_at = now;
        self.settle_defeat(session, now);
        session.touch();
        true
    }

    /// Repair a stuck session.
    ///
    /// Clears a resolving guard older than its timeout. When the stuck side
    /// was the enemy, or the enemy turn sat idle past its timeout, the turn
    /// goes back to the player as if the enemy had acted. Returns whether
    /// the session changed.
    pub fn watchdog_check(&self, session: &mut CombatSession, now: Millis) -> bool {
        if !session.is_active() {
            return false;
        }

        if let Some(guard) = session.processing {
            let timeout = match guard.owner {
                Side::Player => self.config.player_turn_timeout_ms,
                Side::Enemy => self.config.enemy_turn_timeout_ms,
            };
            let stalled_for = now.saturating_sub(guard.since);
            if stalled_for < timeout {
                return false;
            }

            warn!(
                session = %session.id,
                owner = %guard.owner,
                stalled_ms = stalled_for,
                "Clearing stale resolving guard"
            );
            session.processing = None;
            session.push_log(LogEntry::system(
                session.turn_number,
                "The action was interrupted and has been reset.",
                now,
            ));
            if guard.owner == Side::Enemy {
                self.hand_back_to_player(session, now);
            }
            session.touch();
            return true;
        }

        if session.turn == Side::Enemy
            && now.saturating_sub(session.turn_started_at) >= self.config.enemy_turn_timeout_ms
        {
            warn!(session = %session.id, "Enemy turn stalled, returning control to player");
            self.hand_back_to_player(session, now);
            session.touch();
            return true;
        }

        false
    }

    fn hand_back_to_player(&self, session: &mut CombatSession, now: Millis) {
        let message = format!("{} hesitates.", session.enemy_state.name);
        session.push_log(LogEntry::system(session.turn_number, message, now));
        self.apply_event(session, &CombatEvent::TurnPassed { to: Side::Player }, now);
        self.complete_round(session, now);
        self.settle_defeat(session, now);
    }

    /// The player gives up the fight.
    pub fn forfeit(
        &self,
        session: &mut CombatSession,
        actor: &ParticipantId,
        now: Millis,
    ) -> Result<(), CombatError> {
        if !session.is_active() {
            return Err(CombatError::SessionCompleted);
        }
        match session.side_of(actor) {
            None => return Err(CombatError::NotAParticipant(actor.clone())),
            Some(Side::Enemy) => return Err(CombatError::EnemyControlled),
            Some(Side::Player) => {}
        }
        session.finish(CombatOutcome::Forfeited, now);
        session.touch();
        Ok(())
    }
}

fn ensure_energy(available: u32, required: u32) -> Result<(), CombatError> {
    if available < required {
        return Err(CombatError::InsufficientEnergy {
            required,
            available,
        });
    }
    Ok(())
}

fn hit_events(target: Side, outcome: &ActionOutcome) -> Vec<CombatEvent> {
    if outcome.is_dodge {
        vec![CombatEvent::Dodged { side: target }]
    } else if outcome.damage > 0 {
        vec![CombatEvent::Damaged {
            side: target,
            amount: outcome.damage,
            is_critical: outcome.is_critical,
        }]
    } else {
        Vec::new()
    }
}

fn describe(actor: &str, verb: &str, target: &str, outcome: &ActionOutcome) -> String {
    if outcome.is_dodge {
        return format!("{actor} {verb}, but {target} dodges!");
    }
    let mut line = format!("{actor} {verb}");
    if outcome.damage > 0 {
        line.push_str(&format!(" and deals {} damage to {target}", outcome.damage));
        if outcome.is_critical {
            line.push_str(" (critical hit)");
        }
    }
    if outcome.healing > 0 {
        line.push_str(&format!(", restoring {} HP", outcome.healing));
    }
    line.push('.');
    line
}

fn log_tick(session: &mut CombatSession, side: Side, report: &TickReport, now: Millis) {
    if report.is_empty() {
        return;
    }
    let combatant = session.combatant(side);
    let id = combatant.id.clone();
    let mut parts = Vec::new();
    if report.damage > 0 {
        parts.push(format!("{} suffers {} damage from lingering effects", combatant.name, report.damage));
    }
    if report.healing > 0 {
        parts.push(format!("{} recovers {} HP", combatant.name, report.healing));
    }
    for name in &report.expired {
        parts.push(format!("{name} wears off {}", combatant.name));
    }
    if parts.is_empty() {
        return;
    }
    let entry = LogEntry::effect(
        session.turn_number,
        id,
        format!("{}.", parts.join("; ")),
        report.damage,
        report.healing,
        now,
    );
    session.push_log(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bestiary::{get_npc, RewardTable};
    use crate::collaborators::NoPet;
    use crate::state::{CombatStatus, CombatantState, LogKind, TurnPhase};
    use crate::stats::CoreStats;
    use crate::testing::{ScriptedPet, ScriptedRng};

    const T0: Millis = 1_000_000;

    fn player() -> CombatantState {
        // hp 180, energy 85
        CombatantState::new(
            ParticipantId::from("p1"),
            "Lin Feng",
            true,
            10,
            CoreStats::new(20, 15, 30, 25, 12, 10),
        )
        .with_techniques(["flame_palm", "jade_rejuvenation", "venom_needle", "iron_skin", "spirit_surge"])
    }

    fn session() -> CombatSession {
        let boar = get_npc("wild_boar").unwrap();
        CombatSession::new(player(), boar.to_combatant(), "wild_boar", T0)
    }

    fn controller() -> TurnController {
        TurnController::new(CombatConfig::default())
    }

    fn ctx() -> TurnContext {
        TurnContext::new(WeatherModifiers::default(), T0)
    }

    fn p1() -> ParticipantId {
        ParticipantId::from("p1")
    }

    /// Prepare, resolve and apply a player action.
    fn act(tc: &TurnController, s: &mut CombatSession, action: Action, rolls: &[f64]) -> Resolution {
        act_with_pet(tc, s, action, &NoPet, rolls)
    }

    fn act_with_pet(
        tc: &TurnController,
        s: &mut CombatSession,
        action: Action,
        pet: &dyn PetCompanion,
        rolls: &[f64],
    ) -> Resolution {
        let prepared = tc.prepare(s, &p1(), &action, pet).unwrap();
        tc.begin_resolving(s, Side::Player, T0);
        let mut rng = ScriptedRng::new(rolls.iter().copied());
        let resolution = tc.resolve_player_action(s, prepared, &ctx(), &mut rng);
        tc.apply(s, &resolution, T0);
        resolution
    }

    fn enemy_turn(tc: &TurnController, s: &mut CombatSession, rolls: &[f64]) -> Resolution {
        let npc = get_npc(&s.enemy_id).unwrap();
        let mut rng = ScriptedRng::new(rolls.iter().copied());
        let resolution = tc.resolve_enemy_turn(s, &npc, &ctx(), &mut rng);
        tc.apply(s, &resolution, T0);
        resolution
    }

    #[test]
    fn test_validate_rejections() {
        let tc = controller();
        let mut s = session();

        assert_eq!(
            tc.validate(&s, &ParticipantId::from("stranger")),
            Err(CombatError::NotAParticipant(ParticipantId::from("stranger")))
        );
        assert_eq!(
            tc.validate(&s, &ParticipantId::from("wild_boar")),
            Err(CombatError::EnemyControlled)
        );

        s.turn = Side::Enemy;
        assert_eq!(tc.validate(&s, &p1()), Err(CombatError::NotYourTurn));

        s.turn = Side::Player;
        tc.begin_resolving(&mut s, Side::Player, T0);
        assert_eq!(tc.validate(&s, &p1()), Err(CombatError::ActionInProgress));

        s.finish(CombatOutcome::Victory, T0);
        assert_eq!(tc.validate(&s, &p1()), Err(CombatError::SessionCompleted));
        assert_eq!(
            tc.validate(&s, &ParticipantId::from("stranger")),
            Err(CombatError::SessionCompleted)
        );
    }

    #[test]
    fn test_insufficient_energy_rejected() {
        let tc = controller();
        let mut s = session();
        s.player_state.current_energy = 10;
        let before = s.clone();

        let err = tc
            .prepare(&s, &p1(), &Action::technique("flame_palm"), &NoPet)
            .unwrap_err();
        assert_eq!(
            err,
            CombatError::InsufficientEnergy {
                required: 15,
                available: 10
            }
        );
        assert_eq!(s, before);
    }

    #[test]
    fn test_unknown_technique_rejected() {
        let tc = controller();
        let s = session();
        for id in ["dragon_fist", "thunder_strike"] {
            let err = tc.prepare(&s, &p1(), &Action::technique(id), &NoPet).unwrap_err();
            assert_eq!(err, CombatError::UnknownTechnique(id.to_string()));
        }
    }

    #[test]
    fn test_pet_refusal_rejected() {
        let tc = controller();
        let s = session();
        let err = tc
            .prepare(&s, &p1(), &Action::pet_ability("ember"), &NoPet)
            .unwrap_err();
        assert_eq!(err, CombatError::PetAbility(PetError::NoPet));
    }

    #[test]
    fn test_plain_attack_passes_turn() {
        let tc = controller();
        let mut s = session();
        // hit, no crit
        let resolution = act(&tc, &mut s, Action::Attack, &[0.0, 99.0]);

        // floor(126 · 20 / 100) = 25, less 5/105 defense reduction -> 23
        assert_eq!(resolution.damage_to(Side::Enemy), 23);
        assert_eq!(s.enemy_state.current_hp, 103);
        assert_eq!(s.phase(), TurnPhase::EnemyTurn);
        assert_eq!(s.turn_number, 2);
        assert!(s.processing.is_none());
        assert_eq!(s.log.last().unwrap().damage, Some(23));
    }

    #[test]
    fn test_dodged_attack_logs_dodge() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::Attack, &[99.9]);

        let entry = s.log.last().unwrap();
        assert!(entry.is_dodge);
        assert_eq!(entry.damage, Some(0));
        assert_eq!(s.enemy_state.current_hp, 126);
    }

    #[test]
    fn test_enemy_turn_completes_round() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::Attack, &[0.0, 99.0]);
        s.player_state.current_energy = 50;

        // pick Tusk Charge (plain), hit, no crit
        enemy_turn(&tc, &mut s, &[0.0, 0.0, 99.0]);

        // floor(180 · 13 / 100) = 23, less 15/115 defense reduction -> 20
        assert_eq!(s.player_state.current_hp, 160);
        assert_eq!(s.phase(), TurnPhase::PlayerTurn);
        assert_eq!(s.round, 2);
        assert_eq!(s.player_state.current_energy, 55);
    }

    #[test]
    fn test_defend_halves_next_enemy_attack_then_expires() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::Defend, &[]);
        assert!(s.player_state.has_effect(DEFEND_EFFECT));

        enemy_turn(&tc, &mut s, &[0.0, 0.0, 99.0]);
        // 20 without the stance
        assert_eq!(s.player_state.current_hp, 170);
        assert!(!s.player_state.has_effect(DEFEND_EFFECT));
    }

    #[test]
    fn test_enemy_falls_back_to_plain_strike() {
        let tc = controller();
        let mut s = session();
        s.turn = Side::Enemy;
        s.enemy_state.current_energy = 0;
        let npc = NpcDefinition {
            attacks: vec![NpcAttack::special("Gore", 18, DamageType::Physical, 15)],
            rewards: RewardTable {
                experience: 1,
                drop_chance: 0.0,
                loot: Vec::new(),
            },
            ..get_npc("wild_boar").unwrap()
        };

        let mut rng = ScriptedRng::new([0.0, 99.0]);
        let resolution = tc.resolve_enemy_turn(&s, &npc, &ctx(), &mut rng);
        assert!(resolution.narrative.contains("Strike"));
        assert!(!resolution
            .events
            .iter()
            .any(|e| matches!(e, CombatEvent::EnergySpent { .. })));
    }

    #[test]
    fn test_flee_success_and_failure() {
        let tc = controller();

        let mut s = session();
        act(&tc, &mut s, Action::Flee, &[10.0]);
        assert_eq!(s.status, CombatStatus::Completed);
        assert_eq!(s.outcome, Some(CombatOutcome::Fled));
        assert_eq!(s.winner, None);

        let mut s = session();
        let resolution = act(&tc, &mut s, Action::Flee, &[50.0]);
        assert!(resolution.events.contains(&CombatEvent::FleeFailed));
        assert!(s.is_active());
        assert_eq!(s.turn, Side::Enemy);
    }

    #[test]
    fn test_pet_flee_bonus_raises_flee_chance() {
        let tc = controller();
        let pet = ScriptedPet::new().with_flee_bonus(0.25);

        // 30% + 25%: a roll of 50 now gets away
        let mut s = session();
        act_with_pet(&tc, &mut s, Action::Flee, &pet, &[50.0]);
        assert_eq!(s.outcome, Some(CombatOutcome::Fled));

        let mut s = session();
        let resolution = act_with_pet(&tc, &mut s, Action::Flee, &pet, &[60.0]);
        assert!(resolution.events.contains(&CombatEvent::FleeFailed));

        let prepared = tc
            .prepare(&session(), &p1(), &Action::Flee, &ScriptedPet::new().with_flee_bonus(5.0))
            .unwrap();
        assert!(matches!(prepared, PreparedAction::Flee { chance } if chance == 1.0));
    }

    #[test]
    fn test_pet_affinity_boosts_matching_attack() {
        let tc = controller();
        let mut s = session();
        let pet = ScriptedPet::new().with_affinity(DamageType::Physical, 1.5);
        act_with_pet(&tc, &mut s, Action::Attack, &pet, &[0.0, 99.0]);

        // 25 · 1.5 = 37.5, less 5/105 defense reduction -> 35
        assert_eq!(s.enemy_state.current_hp, 91);
    }

    #[test]
    fn test_pet_affinity_follows_technique_element() {
        let tc = controller();
        let fire_palm = || Action::Technique {
            id: "flame_palm".to_string(),
            energy_cost: None,
            damage: Some(40),
            damage_type: Some(DamageType::Fire),
        };

        let mut s = session();
        let fire = ScriptedPet::new().with_affinity(DamageType::Fire, 2.0);
        act_with_pet(&tc, &mut s, fire_palm(), &fire, &[0.0, 99.0]);
        assert_eq!(s.enemy_state.current_hp, 46);

        let mut s = session();
        let water = ScriptedPet::new().with_affinity(DamageType::Water, 2.0);
        act_with_pet(&tc, &mut s, fire_palm(), &water, &[0.0, 99.0]);
        assert_eq!(s.enemy_state.current_hp, 86);
    }

    #[test]
    fn test_venom_needle_applies_dot_and_spends_energy() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::technique("venom_needle"), &[0.0, 99.0]);

        // 10 + 0.2·25 - 5/2 = 12.5 -> 12
        assert_eq!(s.enemy_state.current_hp, 114);
        assert_eq!(s.player_state.current_energy, 73);
        let venom = s.enemy_state.effect("Venom").unwrap();
        assert_eq!(venom.damage, 3);
        assert_eq!(venom.source, "p1");
    }

    #[test]
    fn test_dodged_technique_applies_no_target_effects() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::technique("venom_needle"), &[99.9]);
        assert!(!s.enemy_state.has_effect("Venom"));
        assert_eq!(s.player_state.current_energy, 73);
    }

    #[test]
    fn test_action_overrides_cost_and_damage() {
        let tc = controller();
        let mut s = session();
        let action = Action::Technique {
            id: "flame_palm".to_string(),
            energy_cost: Some(5),
            damage: Some(40),
            damage_type: Some(DamageType::Fire),
        };
        act(&tc, &mut s, action, &[0.0, 99.0]);
        assert_eq!(s.enemy_state.current_hp, 86);
        assert_eq!(s.player_state.current_energy, 80);
    }

    #[test]
    fn test_healing_technique_caps_at_max() {
        let tc = controller();
        let mut s = session();
        s.player_state.current_hp = 100;
        let resolution = act(&tc, &mut s, Action::technique("jade_rejuvenation"), &[]);

        // 30 + 0.5·25 = 42
        assert_eq!(resolution.outcome.healing, 42);
        assert_eq!(s.player_state.current_hp, 142);

        let mut s = session();
        s.player_state.current_hp = 170;
        act(&tc, &mut s, Action::technique("jade_rejuvenation"), &[]);
        assert_eq!(s.player_state.current_hp, 180);
    }

    #[test]
    fn test_pet_ability_resolves_like_technique() {
        let tc = controller();
        let mut s = session();
        let pet = ScriptedPet::new().with_ability("ember", 20, DamageType::Fire);

        let prepared = tc.prepare(&s, &p1(), &Action::pet_ability("ember"), &pet).unwrap();
        tc.begin_resolving(&mut s, Side::Player, T0);
        let mut rng = ScriptedRng::new([0.0, 99.0]);
        let resolution = tc.resolve_player_action(&s, prepared, &ctx(), &mut rng);
        tc.apply(&mut s, &resolution, T0);

        assert_eq!(s.enemy_state.current_hp, 106);
        assert_eq!(pet.uses(), vec!["ember".to_string()]);
    }

    #[test]
    fn test_killing_blow_ends_without_passing_turn() {
        let tc = controller();
        let mut s = session();
        s.enemy_state.current_hp = 10;
        act(&tc, &mut s, Action::Attack, &[0.0, 99.0]);

        assert_eq!(s.status, CombatStatus::Completed);
        assert_eq!(s.outcome, Some(CombatOutcome::Victory));
        assert_eq!(s.winner, Some(Side::Player));
        assert_eq!(s.turn, Side::Player);
        assert_eq!(s.enemy_state.current_hp, 0);
    }

    fn venom(damage: u32, applied_at: Millis) -> Effect {
        Effect::new("Venom", EffectCategory::DamageOverTime, EffectDuration::Seconds(10))
            .with_damage(damage)
            .applied_at(applied_at)
    }

    #[test]
    fn test_evaluate_ticks_whole_seconds() {
        let tc = controller();
        let mut s = session();
        EffectEngine::apply(&mut s.enemy_state, [venom(3, T0)]);

        assert!(!tc.evaluate(&mut s, T0 + 999));
        assert!(tc.evaluate(&mut s, T0 + 2_500));
        assert_eq!(s.enemy_state.current_hp, 120);
        assert_eq!(s.last_updated_at, T0 + 2_500);
        assert_eq!(s.log.last().unwrap().kind, LogKind::Effect);

        assert!(tc.evaluate(&mut s, T0 + 3_000));
        assert_eq!(s.enemy_state.current_hp, 117);
    }

    #[test]
    fn test_evaluate_counts_from_application_time() {
        let tc = controller();
        let mut s = session();
        EffectEngine::apply(&mut s.enemy_state, [venom(3, T0 + 900)]);

        assert!(!tc.evaluate(&mut s, T0 + 1_100));
        assert_eq!(s.enemy_state.current_hp, 126);
        assert_eq!(s.enemy_state.effect("Venom").unwrap().remaining(), 10);

        assert!(tc.evaluate(&mut s, T0 + 1_900));
        assert_eq!(s.enemy_state.current_hp, 123);
    }

    #[test]
    fn test_evaluate_dot_kill_completes_session() {
        let tc = controller();
        let mut s = session();
        s.enemy_state.current_hp = 5;
        EffectEngine::apply(&mut s.enemy_state, [venom(3, T0)]);

        tc.evaluate(&mut s, T0 + 2_000);
        assert_eq!(s.outcome, Some(CombatOutcome::Victory));
        assert_eq!(s.phase(), TurnPhase::Completed);
    }

    #[test]
    fn test_player_death_takes_precedence() {
        let tc = controller();
        let mut s = session();
        for side in [Side::Player, Side::Enemy] {
            let c = s.combatant_mut(side);
            c.current_hp = 3;
            EffectEngine::apply(c, [venom(5, T0)]);
        }

        tc.evaluate(&mut s, T0 + 1_000);
        assert_eq!(s.outcome, Some(CombatOutcome::Defeat));
        assert_eq!(s.winner, Some(Side::Enemy));
    }

    #[test]
    fn test_evaluate_skipped_while_resolving() {
        let tc = controller();
        let mut s = session();
        tc.begin_resolving(&mut s, Side::Player, T0);
        assert!(!tc.evaluate(&mut s, T0 + 10_000));
        assert_eq!(s.last_updated_at, T0);
    }

    #[test]
    fn test_watchdog_clears_stale_player_guard() {
        let tc = controller();
        let mut s = session();
        tc.begin_resolving(&mut s, Side::Player, T0);

        assert!(!tc.watchdog_check(&mut s, T0 + 4_999));
        assert_eq!(s.phase(), TurnPhase::Resolving);

        assert!(tc.watchdog_check(&mut s, T0 + 5_000));
        assert_eq!(s.phase(), TurnPhase::PlayerTurn);
        assert_eq!(s.log.last().unwrap().kind, LogKind::System);
    }

    #[test]
    fn test_watchdog_hands_stuck_enemy_turn_back() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::Attack, &[0.0, 99.0]);
        tc.begin_resolving(&mut s, Side::Enemy, T0);

        assert!(tc.watchdog_check(&mut s, T0 + 2_000));
        assert_eq!(s.phase(), TurnPhase::PlayerTurn);
        assert_eq!(s.round, 2);
    }

    #[test]
    fn test_watchdog_hands_idle_enemy_turn_back() {
        let tc = controller();
        let mut s = session();
        act(&tc, &mut s, Action::Attack, &[0.0, 99.0]);
        assert_eq!(s.phase(), TurnPhase::EnemyTurn);

        assert!(!tc.watchdog_check(&mut s, T0 + 1_500));
        assert!(tc.watchdog_check(&mut s, T0 + 2_000));
        assert_eq!(s.phase(), TurnPhase::PlayerTurn);
    }

    #[test]
    fn test_forfeit() {
        let tc = controller();
        let mut s = session();
        assert_eq!(
            tc.forfeit(&mut s, &ParticipantId::from("wild_boar"), T0),
            Err(CombatError::EnemyControlled)
        );
        tc.forfeit(&mut s, &p1(), T0).unwrap();
        assert_eq!(s.outcome, Some(CombatOutcome::Forfeited));
        assert_eq!(s.winner, Some(Side::Enemy));
        assert_eq!(tc.forfeit(&mut s, &p1(), T0), Err(CombatError::SessionCompleted));
    }

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_str(
            r#"{"type":"technique","id":"flame_palm","energy_cost":5,"damage_type":"fire"}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            Action::Technique {
                id: "flame_palm".to_string(),
                energy_cost: Some(5),
                damage: None,
                damage_type: Some(DamageType::Fire),
            }
        );

        let action: Action = serde_json::from_str(r#"{"type":"pet-ability","id":"ember"}"#).unwrap();
        assert_eq!(action, Action::pet_ability("ember"));

        let json = serde_json::to_string(&Action::Defend).unwrap();
        assert_eq!(json, r#"{"type":"defend"}"#);
    }
}
