//! Rate limiting and admission control.

mod admission;
mod gate;
pub mod rules;
mod scope;
mod window;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionStats, ScopeStats};
pub use gate::{ConcurrencyGate, GateToken};
pub use rules::{AdmissionRules, TimeUnit, WindowRule};
pub use scope::Scope;
pub use window::{Decision, SlidingWindowLimiter};
