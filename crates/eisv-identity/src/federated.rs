//! Federated identities
//!
//! The agent UUID is derived deterministically from `(issuer, subject)`.
//! A credential is the HMAC-SHA256 of the pair under the server secret. It is
//! kept on the agent record and never transmitted; rotating the secret
//! rotates every credential on next contact.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use eisv_core::AgentId;
use ring::hmac;
use uuid::Uuid;

pub struct FederatedKeys {
    key: hmac::Key,
}

impl FederatedKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn agent_id(issuer: &str, subject: &str) -> AgentId {
        let namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, issuer.as_bytes());
        AgentId::from_uuid(Uuid::new_v5(&namespace, subject.as_bytes()))
    }

    pub fn credential(&self, issuer: &str, subject: &str) -> String {
        let tag = hmac::sign(&self.key, &message(issuer, subject));
        URL_SAFE_NO_PAD.encode(tag.as_ref())
    }

    /// Constant-time check of a stored credential against the current secret.
    pub fn verify(&self, issuer: &str, subject: &str, credential: &str) -> bool {
        match URL_SAFE_NO_PAD.decode(credential) {
            Ok(tag) => hmac::verify(&self.key, &message(issuer, subject), &tag).is_ok(),
            Err(_) => false,
        }
    }
}

fn message(issuer: &str, subject: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(issuer.len() + subject.len() + 1);
    msg.extend_from_slice(issuer.as_bytes());
    msg.push(b'|');
    msg.extend_from_slice(subject.as_bytes());
    msg
}
