//! Replication semantics independent of any backend
//!
//! - [`state_machine`]: legal transitions between unified states
//! - [`translation`]: unified to native vocabulary and back

pub mod state_machine;
pub mod translation;

pub use state_machine::{evaluate, legal_targets, validate, TransitionKind, TransitionVerdict};
pub use translation::{
    CephState, NativeMode, NativeState, PowerStoreAction, TranslationEngine, TridentState,
};
