//! Identity & session registry
//!
//! Maps opaque transport sessions onto persistent agent identities. Agent
//! UUIDs stay internal; peers only ever see display ids and names.

pub mod federated;
pub mod naming;
pub mod registry;
pub mod view;

pub use federated::FederatedKeys;
pub use registry::{IdentityRegistry, Resolved, ResolveRequest};
pub use view::AgentView;
