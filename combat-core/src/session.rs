//! CombatService - the public API for running fights.
//!
//! The service owns every live session and is the only thing that mutates
//! them. It exposes the entry points a game server needs:
//! [`start_combat`](CombatService::start_combat),
//! [`perform_action`](CombatService::perform_action),
//! [`get_combat_state`](CombatService::get_combat_state),
//! [`forfeit_combat`](CombatService::forfeit_combat) and
//! [`archive`](CombatService::archive).
//!
//! An action moves the session into the resolving phase under the service
//! lock, resolves it on a working copy, releases the lock while the copy is
//! persisted and then commits only if nobody touched the session in the
//! meantime. A dropped action future therefore leaves the session
//! resolving; the per-session watchdog (and every state read) repairs that
//! once the timeout has passed.

use crate::bestiary::Bestiary;
use crate::clock::{Clock, Millis, SystemClock};
use crate::collaborators::{
    DiscardInventory, Inventory, NoPet, NoQuests, PetCompanion, QuestTracker, StatsProvider,
    WeatherModifiers, WeatherSource,
};
use crate::config::CombatConfig;
use crate::persist::{MemoryStore, PersistError, SessionStore};
use crate::rewards::{RewardResolver, Rewards};
use crate::state::{
    CombatOutcome, CombatSession, CombatantState, LogEntry, ParticipantId, SessionId, Side, TurnPhase,
};
use crate::stats::CoreStats;
use crate::turn::{Action, CombatError, TurnContext, TurnController};
use crate::watchdog::{TimeoutFuture, TimeoutTask};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors from CombatService operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Player not found: {0}")]
    PlayerNotFound(ParticipantId),

    #[error("Enemy not found: {0}")]
    EnemyNotFound(String),

    #[error("Session {0} is still active")]
    SessionStillActive(SessionId),

    #[error("Combat error: {0}")]
    Combat(#[from] CombatError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Everything the service needs from the rest of the game.
#[derive(Clone)]
pub struct Collaborators {
    pub stats: Arc<dyn StatsProvider>,
    pub inventory: Arc<dyn Inventory>,
    pub quests: Arc<dyn QuestTracker>,
    pub weather: Arc<dyn WeatherSource>,
    pub pets: Arc<dyn PetCompanion>,
    pub store: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Only the stats provider is required. Everything else defaults to a
    /// null implementation, calm weather, an in-memory store and the
    /// system clock.
    pub fn new(stats: Arc<dyn StatsProvider>) -> Self {
        Self {
            stats,
            inventory: Arc::new(DiscardInventory),
            quests: Arc::new(NoQuests),
            weather: Arc::new(WeatherModifiers::default()),
            pets: Arc::new(NoPet),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_quests(mut self, quests: Arc<dyn QuestTracker>) -> Self {
        self.quests = quests;
        self
    }

    pub fn with_weather(mut self, weather: Arc<dyn WeatherSource>) -> Self {
        self.weather = weather;
        self
    }

    pub fn with_pets(mut self, pets: Arc<dyn PetCompanion>) -> Self {
        self.pets = pets;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// A live session and its timers.
struct SessionSlot {
    session: CombatSession,
    watchdog: TimeoutTask,
    enemy_turn: TimeoutTask,
}

impl SessionSlot {
    fn new(session: CombatSession) -> Self {
        Self {
            session,
            watchdog: TimeoutTask::new(),
            enemy_turn: TimeoutTask::new(),
        }
    }
}

struct Shared {
    slots: HashMap<SessionId, SessionSlot>,
    rng: Box<dyn RngCore + Send>,
}

struct Inner {
    controller: TurnController,
    bestiary: Bestiary,
    collaborators: Collaborators,
    state: Mutex<Shared>,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Watchdog,
    EnemyTurn,
}

/// Runs combat sessions.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct CombatService {
    inner: Arc<Inner>,
}

impl CombatService {
    /// Create a service. The random source is seeded from
    /// [`CombatConfig::rng_seed`], or from entropy when unset.
    pub fn new(config: CombatConfig, collaborators: Collaborators, bestiary: Bestiary) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, collaborators, bestiary, rng)
    }

    /// Create a service with an explicit random source.
    pub fn with_rng(
        config: CombatConfig,
        collaborators: Collaborators,
        bestiary: Bestiary,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller: TurnController::new(config),
                bestiary,
                collaborators,
                state: Mutex::new(Shared {
                    slots: HashMap::new(),
                    rng: Box::new(rng),
                }),
            }),
        }
    }

    pub fn config(&self) -> &CombatConfig {
        self.inner.controller.config()
    }

    fn now(&self) -> Millis {
        self.inner.collaborators.clock.now_ms()
    }

    // ========================================================================
    // Entry Points
    // ========================================================================

    /// Start a fight between a player and an NPC definition.
    pub async fn start_combat(
        &self,
        player_id: impl Into<ParticipantId>,
        enemy_id: &str,
    ) -> Result<CombatSession, SessionError> {
        let player_id = player_id.into();
        let collaborators = &self.inner.collaborators;

        let snapshot = collaborators
            .stats
            .combined_stats(&player_id)
            .ok_or_else(|| SessionError::PlayerNotFound(player_id.clone()))?;
        let npc = self
            .inner
            .bestiary
            .get(enemy_id)
            .ok_or_else(|| SessionError::EnemyNotFound(enemy_id.to_string()))?;

        let base = CoreStats::from_raw(&snapshot.stats) + collaborators.pets.combat_bonuses(&player_id);
        let mut player = CombatantState::new(player_id.clone(), snapshot.name, true, snapshot.level, base)
            .with_techniques(snapshot.techniques);
        if let Some(element) = snapshot.element {
            player = player.with_element(element);
        }

        let session = CombatSession::new(player, npc.to_combatant(), npc.id.clone(), self.now());
        collaborators.store.save(&session).await?;

        let mut shared = self.inner.state.lock().await;
        let mut slot = SessionSlot::new(session.clone());
        self.schedule(&mut slot);
        shared.slots.insert(session.id, slot);

        info!(session = %session.id, player = %player_id, enemy = %npc.id, "Combat started");
        Ok(session)
    }

    /// Submit a player action.
    ///
    /// Invalid actions are rejected without touching the session. When the
    /// action hands the turn to the enemy and no enemy delay is configured,
    /// the enemy's turn is resolved before this returns. A pet ability whose
    /// resolution is rolled back or abandoned is refunded to the pet.
    pub async fn perform_action(
        &self,
        session_id: SessionId,
        actor_id: &ParticipantId,
        action: Action,
    ) -> Result<CombatSession, SessionError> {
        self.ensure_loaded(session_id).await?;
        let controller = &self.inner.controller;
        let collaborators = &self.inner.collaborators;
        let now = self.now();

        let (working, revision) = {
            let mut shared = self.inner.state.lock().await;
            let Shared { slots, rng } = &mut *shared;
            let slot = slots
                .get_mut(&session_id)
                .ok_or(SessionError::SessionNotFound(session_id))?;

            let refreshed = self.refresh(&mut slot.session, rng.as_mut(), now);
            let prepared = match controller.prepare(&slot.session, actor_id, &action, collaborators.pets.as_ref()) {
                Ok(prepared) => prepared,
                Err(e) => {
                    debug!(session = %session_id, action = action.kind(), error = %e, "Action rejected");
                    if refreshed {
                        self.schedule(slot);
                        let snapshot = slot.session.clone();
                        drop(shared);
                        self.persist(&snapshot).await;
                    }
                    return Err(e.into());
                }
            };

            controller.begin_resolving(&mut slot.session, Side::Player, now);
            self.schedule(slot);

            let mut working = slot.session.clone();
            let ctx = TurnContext::new(collaborators.weather.current_modifiers(), now);
            let resolution = controller.resolve_player_action(&working, prepared, &ctx, rng.as_mut());
            controller.apply(&mut working, &resolution, now);
            self.settle(&mut working, rng.as_mut(), now);
            (working, slot.session.revision)
        };

        let committed = match self.commit(session_id, working, revision).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Action::PetAbility { id, .. } = &action {
                    collaborators.pets.refund_ability(actor_id, id);
                }
                return Err(e);
            }
        };
        if committed.phase() != TurnPhase::EnemyTurn {
            return Ok(committed);
        }

        let delay = self.config().enemy_turn_delay();
        if !delay.is_zero() {
            let mut shared = self.inner.state.lock().await;
            if let Some(slot) = shared.slots.get_mut(&session_id) {
                slot.enemy_turn.arm(delay, self.timer_future(session_id, Timer::EnemyTurn));
            }
            return Ok(committed);
        }

        match self.run_enemy_turn(session_id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Ok(committed),
            Err(e) => {
                warn!(session = %session_id, error = %e, "Enemy turn failed");
                Ok(committed)
            }
        }
    }

    /// Current state of a session.
    ///
    /// Catches time-based effects up to now and runs the watchdog first, so
    /// a damage-over-time kill or a stalled turn is settled by the read
    /// itself.
    pub async fn get_combat_state(&self, session_id: SessionId) -> Result<CombatSession, SessionError> {
        self.ensure_loaded(session_id).await?;
        let now = self.now();

        let (snapshot, changed) = {
            let mut shared = self.inner.state.lock().await;
            let Shared { slots, rng } = &mut *shared;
            let slot = slots
                .get_mut(&session_id)
                .ok_or(SessionError::SessionNotFound(session_id))?;

            let changed = self.refresh(&mut slot.session, rng.as_mut(), now);
            if changed {
                self.schedule(slot);
            }
            (slot.session.clone(), changed)
        };

        if changed {
            self.inner.collaborators.store.save(&snapshot).await?;
        }
        Ok(snapshot)
    }

    /// The player gives up. The enemy wins and no rewards are granted.
    pub async fn forfeit_combat(
        &self,
        session_id: SessionId,
        actor_id: &ParticipantId,
    ) -> Result<CombatSession, SessionError> {
        self.ensure_loaded(session_id).await?;
        let now = self.now();

        let (snapshot, result) = {
            let mut shared = self.inner.state.lock().await;
            let Shared { slots, rng } = &mut *shared;
            let slot = slots
                .get_mut(&session_id)
                .ok_or(SessionError::SessionNotFound(session_id))?;

            let refreshed = self.refresh(&mut slot.session, rng.as_mut(), now);
            let result = self.inner.controller.forfeit(&mut slot.session, actor_id, now);
            if let Err(e) = &result {
                if !refreshed {
                    return Err(e.clone().into());
                }
            }
            self.schedule(slot);
            (slot.session.clone(), result)
        };

        self.inner.collaborators.store.save(&snapshot).await?;
        result?;
        info!(session = %session_id, player = %actor_id, "Combat forfeited");
        Ok(snapshot)
    }

    /// Drop a completed session from memory and from the store.
    pub async fn archive(&self, session_id: SessionId) -> Result<CombatSession, SessionError> {
        self.ensure_loaded(session_id).await?;

        let session = {
            let mut shared = self.inner.state.lock().await;
            let slot = shared
                .slots
                .get(&session_id)
                .ok_or(SessionError::SessionNotFound(session_id))?;
            if slot.session.is_active() {
                return Err(SessionError::SessionStillActive(session_id));
            }
            shared
                .slots
                .remove(&session_id)
                .map(|slot| slot.session)
                .ok_or(SessionError::SessionNotFound(session_id))?
        };

        self.inner.collaborators.store.remove(session_id).await?;
        info!(session = %session_id, "Combat archived");
        Ok(session)
    }

    /// Raw in-memory state, without catching up effects or the watchdog.
    pub async fn snapshot(&self, session_id: SessionId) -> Option<CombatSession> {
        let shared = self.inner.state.lock().await;
        shared.slots.get(&session_id).map(|slot| slot.session.clone())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Load a session from the store if it is not live in memory.
    async fn ensure_loaded(&self, session_id: SessionId) -> Result<(), SessionError> {
        if self.inner.state.lock().await.slots.contains_key(&session_id) {
            return Ok(());
        }

        let session = self
            .inner
            .collaborators
            .store
            .load(session_id)
            .await?
            .ok_or(SessionError::SessionNotFound(session_id))?;

        let mut shared = self.inner.state.lock().await;
        if !shared.slots.contains_key(&session_id) {
            debug!(session = %session_id, "Rehydrated session from store");
            let mut slot = SessionSlot::new(session);
            self.schedule(&mut slot);
            shared.slots.insert(session_id, slot);
        }
        Ok(())
    }

    /// Watchdog, wall-clock catch-up and victory settlement.
    fn refresh(&self, session: &mut CombatSession, rng: &mut dyn RngCore, now: Millis) -> bool {
        let controller = &self.inner.controller;
        let was_active = session.is_active();

        let mut changed = controller.watchdog_check(session, now);
        changed |= controller.evaluate(session, now);
        changed |= self.settle(session, rng, now);

        if was_active && !session.is_active() {
            info!(session = %session.id, outcome = ?session.outcome, "Combat ended");
        }
        changed
    }

    /// Grant victory rewards once. Returns whether anything changed.
    fn settle(&self, session: &mut CombatSession, rng: &mut dyn RngCore, now: Millis) -> bool {
        if session.outcome != Some(CombatOutcome::Victory) || session.rewards.is_some() {
            return false;
        }
        let collaborators = &self.inner.collaborators;

        let mut rewards = match self.inner.bestiary.get(&session.enemy_id) {
            Some(npc) => RewardResolver::resolve(&npc, rng),
            None => {
                warn!(session = %session.id, enemy = %session.enemy_id, "No definition for defeated enemy");
                Rewards::default()
            }
        };
        RewardResolver::grant(
            &mut rewards,
            &session.player_id,
            &session.enemy_id,
            collaborators.inventory.as_ref(),
            collaborators.quests.as_ref(),
        );

        let message = format!(
            "Gained {} experience and {} copper worth of coin.",
            rewards.experience,
            rewards.currency.total_value()
        );
        session.push_log(LogEntry::system(session.turn_number, message, now));
        info!(
            session = %session.id,
            experience = rewards.experience,
            items = rewards.items.len(),
            "Victory rewards granted"
        );
        session.rewards = Some(rewards);
        session.touch();
        true
    }

    /// Persist a resolved working copy and make it the live session, unless
    /// the live session changed since resolution started.
    async fn commit(
        &self,
        session_id: SessionId,
        working: CombatSession,
        revision: u64,
    ) -> Result<CombatSession, SessionError> {
        let store = &self.inner.collaborators.store;

        if let Err(e) = store.save(&working).await {
            warn!(session = %session_id, error = %e, "Failed to persist resolution, rolling back");
            let mut shared = self.inner.state.lock().await;
            if let Some(slot) = shared.slots.get_mut(&session_id) {
                if slot.session.revision == revision {
                    slot.session.processing = None;
                    slot.session.touch();
                    self.schedule(slot);
                }
            }
            return Err(e.into());
        }

        let mut shared = self.inner.state.lock().await;
        let Some(slot) = shared.slots.get_mut(&session_id) else {
            return Err(SessionError::SessionNotFound(session_id));
        };

        if slot.session.revision != revision {
            warn!(
                session = %session_id,
                expected = revision,
                found = slot.session.revision,
                "Session changed during resolution, discarding result"
            );
            // The discarded copy may already be stored; supersede it.
            slot.session.revision = slot.session.revision.max(working.revision);
            slot.session.touch();
            let live = slot.session.clone();
            drop(shared);
            self.persist(&live).await;
            return Err(CombatError::ResolutionAbandoned.into());
        }

        let was_active = slot.session.is_active();
        slot.session = working;
        self.schedule(slot);
        if was_active && !slot.session.is_active() {
            info!(session = %session_id, outcome = ?slot.session.outcome, "Combat ended");
        }
        Ok(slot.session.clone())
    }

    /// Resolve the enemy's turn if it is due. Returns the new state, or
    /// `None` when it was not the enemy's turn.
    async fn run_enemy_turn(&self, session_id: SessionId) -> Result<Option<CombatSession>, SessionError> {
        let controller = &self.inner.controller;
        let collaborators = &self.inner.collaborators;
        let now = self.now();

        let (working, revision) = {
            let mut shared = self.inner.state.lock().await;
            let Shared { slots, rng } = &mut *shared;
            let Some(slot) = slots.get_mut(&session_id) else {
                return Ok(None);
            };
            slot.enemy_turn.detach();

            if self.refresh(&mut slot.session, rng.as_mut(), now) {
                self.schedule(slot);
            }
            if slot.session.phase() != TurnPhase::EnemyTurn {
                return Ok(None);
            }
            let npc = self
                .inner
                .bestiary
                .get(&slot.session.enemy_id)
                .ok_or_else(|| SessionError::EnemyNotFound(slot.session.enemy_id.clone()))?;

            controller.begin_resolving(&mut slot.session, Side::Enemy, now);
            self.schedule(slot);

            let mut working = slot.session.clone();
            let ctx = TurnContext::new(collaborators.weather.current_modifiers(), now);
            let resolution = controller.resolve_enemy_turn(&working, &npc, &ctx, rng.as_mut());
            controller.apply(&mut working, &resolution, now);
            self.settle(&mut working, rng.as_mut(), now);
            (working, slot.session.revision)
        };

        self.commit(session_id, working, revision).await.map(Some)
    }

    /// Watchdog timer fired: run the same repair pass a read would.
    async fn run_watchdog(&self, session_id: SessionId) {
        let now = self.now();
        let snapshot = {
            let mut shared = self.inner.state.lock().await;
            let Shared { slots, rng } = &mut *shared;
            let Some(slot) = slots.get_mut(&session_id) else {
                return;
            };
            slot.watchdog.detach();
            let changed = self.refresh(&mut slot.session, rng.as_mut(), now);
            self.schedule(slot);
            if !changed {
                return;
            }
            slot.session.clone()
        };
        self.persist(&snapshot).await;
    }

    /// Best-effort save for paths that have nothing to report back.
    async fn persist(&self, session: &CombatSession) {
        if let Err(e) = self.inner.collaborators.store.save(session).await {
            warn!(session = %session.id, error = %e, "Failed to persist session");
        }
    }

    /// Re-arm the session's watchdog for its current phase.
    fn schedule(&self, slot: &mut SessionSlot) {
        let config = self.config();
        let now = self.now();
        let session = &slot.session;

        let deadline = match session.phase() {
            TurnPhase::Resolving => session.processing.map(|guard| {
                let timeout = match guard.owner {
                    Side::Player => config.player_turn_timeout_ms,
                    Side::Enemy => config.enemy_turn_timeout_ms,
                };
                guard.since + timeout
            }),
            TurnPhase::EnemyTurn => Some(session.turn_started_at + config.enemy_turn_timeout_ms),
            TurnPhase::PlayerTurn | TurnPhase::Completed => None,
        };

        match deadline {
            Some(deadline) => {
                let delay = Duration::from_millis(deadline.saturating_sub(now));
                slot.watchdog.arm(delay, self.timer_future(session.id, Timer::Watchdog));
            }
            None => slot.watchdog.cancel(),
        }
        if !session.is_active() {
            slot.enemy_turn.cancel();
        }
    }

    fn timer_future(&self, session_id: SessionId, timer: Timer) -> TimeoutFuture {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = CombatService { inner };
            match timer {
                Timer::Watchdog => service.run_watchdog(session_id).await,
                Timer::EnemyTurn => {
                    if let Err(e) = service.run_enemy_turn(session_id).await {
                        warn!(session = %session_id, error = %e, "Delayed enemy turn failed");
                    }
                }
            }
        })
    }
}
