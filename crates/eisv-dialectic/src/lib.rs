//! Dialectic peer review
//!
//! A paused agent argues for its own recovery (thesis) and a reviewer answers
//! (antithesis). Both then negotiate syntheses until they agree or the round
//! limit runs out. The outcome decides whether the agent goes back to work.

pub mod coordinator;
pub mod delegate;
pub mod discovery;
pub mod protocol;

pub use coordinator::{DialecticCoordinator, DraftTicket, OpenRequest};
pub use delegate::{
    delegate_from_config, DelegateError, DraftRequest, HttpDelegate, PlaceholderDelegate,
    ReasoningDelegate,
};
pub use discovery::DiscoveryRecord;
