//! # strand-core
//!
//! Platform-independent building blocks for the strand fiber runtime.
//!
//! This crate carries no dependencies and holds the pieces shared by the
//! runtime and by embedders:
//! - Fiber identifiers and lifecycle states
//! - Error types
//! - The `sprint` leveled logging macros
//! - Environment-variable parsing helpers
//! - The counting semaphore used by the thread-spawn handshake

pub mod env;
pub mod error;
pub mod id;
pub mod semaphore;
pub mod sprint;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{RtError, RtResult};
pub use id::{next_fiber_id, FiberId};
pub use semaphore::Semaphore;
pub use sprint::LogLevel;
pub use state::FiberState;
