//! Shared-token transport authentication
//!
//! Off unless a token is configured. Identity is resolved separately and is
//! not a security perimeter.

use eisv_core::config::ServerConfig;
use eisv_core::{Error, Result};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedAuth {
    pub token: Option<String>,
}

impl ResolvedAuth {
    pub fn from_config(config: &ServerConfig, env_token: Option<String>) -> Self {
        let token = config
            .auth_token
            .clone()
            .or(env_token)
            .filter(|t| !t.is_empty());
        Self { token }
    }

    pub fn required(&self) -> bool {
        self.token.is_some()
    }

    pub fn verify_token(&self, provided: Option<&str>) -> Result<()> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        let provided = provided.ok_or_else(|| Error::auth_failed("token required"))?;
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(Error::auth_failed("invalid token"));
        }
        Ok(())
    }

    /// Accepts `Bearer <token>` or a bare token.
    pub fn verify_header(&self, header: Option<&str>) -> Result<()> {
        let token = header.map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim());
        self.verify_token(token)
    }
}
