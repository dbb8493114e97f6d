//! Recovery of parent containers and their dependents
//!
//! Provides:
//! - Per-parent recovery gating and dependent restart cooldown
//! - The bounded set of container ids known to be unrestartable
//! - Error triage for restart/inspect failures
//! - The restart -> wait-for-healthy -> cascade flow

pub mod cooldown;
pub mod recovery;
pub mod triage;
pub mod unrestartable;

pub use cooldown::{DependentCooldown, RecoveryCooldown};
pub use recovery::{RecoveryFlow, RecoveryOutcome};
pub use unrestartable::UnrestartableSet;
