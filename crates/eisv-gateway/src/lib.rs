//! EISV gateway: JSON-RPC over HTTP and WebSocket

pub mod auth;
pub mod rpc;
pub mod server;
pub mod state;
pub mod ws;

pub use auth::ResolvedAuth;
pub use server::{router, serve};
pub use state::AppState;
