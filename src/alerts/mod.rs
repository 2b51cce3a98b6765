//! Alert derivation: turns noisy per-frame classifications into sustained,
//! hysteresis-filtered alert signals.

pub mod config;
pub mod engine;
pub mod hysteresis;
pub mod perclos;

pub use config::AlertConfig;
pub use engine::{AlertEngine, DerivedMetrics};
pub use hysteresis::{SustainedCondition, SustainedUpdate};
pub use perclos::PerclosWindow;
