//! Session lifecycle: the controller that applications drive, the state
//! machine it enforces, and the per-session loop that processes results.

pub mod controller;
mod runtime;
pub mod state;

pub use controller::{AlertConfigUpdate, SessionController};
pub use runtime::RuntimeExit;
pub use state::{SessionState, StatusSnapshot};
