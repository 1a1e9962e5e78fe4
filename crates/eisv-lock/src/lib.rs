//! Per-agent exclusive locks
//!
//! One lock per agent identity. Holders are identified by an opaque token;
//! a holder whose heartbeat goes stale, or whose lock outlives the age
//! ceiling, is reclaimed on the next acquisition attempt and by the reaper.

pub mod manager;

pub use manager::{LockGuard, LockManager, LockSettings, LockToken};
