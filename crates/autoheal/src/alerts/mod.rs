//! Alert normalization.
//!
//! Inbound alerts arrive from metric alarms (threshold breaches, status
//! checks) and active monitoring (service/host checks) in loosely typed
//! shapes. Everything downstream works on the canonical [`HealthAlert`].

pub mod normalize;
pub mod types;

pub use normalize::{normalize, normalize_body};
pub use types::{AlertSource, CheckKind, CheckResult, CheckState, HealthAlert};
