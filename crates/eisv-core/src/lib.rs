//! Shared types for the EISV governance service

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod protocol;
pub mod types;
pub mod watcher;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::GovernanceConfig;
pub use error::{Error, Result};
pub use events::EventBus;
pub use model::*;
pub use protocol::*;
pub use types::*;
pub use watcher::{ConfigHandle, ConfigWatcher};
