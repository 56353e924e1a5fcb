//! Turn-based combat engine for a cultivation RPG.
//!
//! This crate provides:
//! - Player-vs-NPC combat sessions with a strict turn state machine
//! - Damage, healing, critical hits, dodges and elemental modifiers
//! - Timed and round-based status effects evaluated against wall-clock time
//! - Victory rewards (experience, currency, loot) and quest hooks
//! - Session persistence and a watchdog that repairs stalled turns
//!
//! # Quick Start
//!
//! ```ignore
//! use combat_core::{Action, Bestiary, CombatConfig, CombatService, Collaborators};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collaborators = Collaborators::new(Arc::new(MyCharacters::default()));
//!     let service = CombatService::new(CombatConfig::default(), collaborators, Bestiary::new());
//!
//!     let session = service.start_combat("player-1", "wild_boar").await?;
//!     let session = service
//!         .perform_action(session.id, &"player-1".into(), Action::technique("flame_palm"))
//!         .await?;
//!     println!("{}", session.log.last().map(|e| e.message.as_str()).unwrap_or_default());
//!     Ok(())
//! }
//! ```

pub mod bestiary;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod damage;
pub mod effects;
pub mod persist;
pub mod rewards;
pub mod rolls;
pub mod session;
pub mod state;
pub mod stats;
pub mod techniques;
pub mod testing;
pub mod turn;
pub mod watchdog;

// Primary public API
pub use bestiary::{get_npc, Bestiary, NpcDefinition};
pub use collaborators::{
    Inventory, PetCompanion, PlayerSnapshot, QuestTracker, StatsProvider, WeatherModifiers,
    WeatherSource,
};
pub use config::CombatConfig;
pub use damage::DamageType;
pub use persist::{JsonFileStore, MemoryStore, PersistError, SessionStore};
pub use session::{CombatService, Collaborators, SessionError};
pub use state::{CombatOutcome, CombatSession, CombatStatus, ParticipantId, SessionId, Side, TurnPhase};
pub use techniques::get_technique;
pub use turn::{Action, CombatError};
