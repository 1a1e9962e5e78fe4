//! External reasoning delegate for drafting dialectic messages

use eisv_core::config::DialecticConfig;
use eisv_core::{DialecticContent, DialecticMessage, MessageType};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub type DelegateResult<T> = Result<T, DelegateError>;

#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Everything the delegate sees when drafting one message.
#[derive(Debug, Clone, Serialize)]
pub struct DraftRequest {
    pub session: String,
    pub kind: MessageType,
    pub reason: String,
    pub author: String,
    pub messages: Vec<DialecticMessage>,
    pub metrics: serde_json::Value,
}

#[async_trait::async_trait]
pub trait ReasoningDelegate: Send + Sync {
    fn name(&self) -> &str;

    async fn draft(&self, request: &DraftRequest) -> DelegateResult<DialecticContent>;
}

/// POSTs the draft request as JSON and expects a `DialecticContent` body.
pub struct HttpDelegate {
    client: Client,
    url: String,
}

impl HttpDelegate {
    pub fn new(url: impl Into<String>, timeout: Duration) -> DelegateResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ReasoningDelegate for HttpDelegate {
    fn name(&self) -> &str {
        "http"
    }

    async fn draft(&self, request: &DraftRequest) -> DelegateResult<DialecticContent> {
        debug!("delegate draft: {} for {}", request.kind.as_str(), request.session);
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("delegate error {}: {}", status, text);
            return Err(DelegateError::RequestFailed(format!("{}: {}", status, text)));
        }
        response
            .json::<DialecticContent>()
            .await
            .map_err(|e| DelegateError::InvalidResponse(e.to_string()))
    }
}

/// Offline fallback: a draft built only from the session and observed metrics.
pub struct PlaceholderDelegate;

impl PlaceholderDelegate {
    pub fn build(request: &DraftRequest) -> DialecticContent {
        let metric = |key: &str| request.metrics.get(key).and_then(|v| v.as_f64());
        let mut concerns = Vec::new();
        if let Some(c) = metric("coherence").filter(|c| *c < 0.5) {
            concerns.push(format!("coherence {c:.3} below target"));
        }
        if let Some(r) = metric("risk").filter(|r| *r >= 0.3) {
            concerns.push(format!("risk {r:.3} above the approve threshold"));
        }
        if request.metrics.get("void_active").and_then(|v| v.as_bool()) == Some(true) {
            concerns.push("void active: energy and integrity diverging".into());
        }

        let thesis = request
            .messages
            .iter()
            .rev()
            .find(|m| m.kind == MessageType::Thesis)
            .map(|m| &m.content);

        let mut content = DialecticContent {
            reasoning: Some("automated draft, reasoning delegate unavailable".into()),
            observed_metrics: Some(request.metrics.clone()),
            ..Default::default()
        };
        match request.kind {
            MessageType::Thesis => {
                content.root_cause = Some(request.reason.clone());
                content.proposed_conditions = vec!["reduce complexity of the next steps".into()];
            }
            MessageType::Antithesis => content.concerns = concerns,
            MessageType::Synthesis => {
                content.root_cause = thesis.and_then(|t| t.root_cause.clone());
                content.proposed_conditions = thesis
                    .map(|t| t.proposed_conditions.clone())
                    .unwrap_or_default();
                content.concerns = concerns;
            }
        }
        content
    }
}

#[async_trait::async_trait]
impl ReasoningDelegate for PlaceholderDelegate {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn draft(&self, request: &DraftRequest) -> DelegateResult<DialecticContent> {
        Ok(Self::build(request))
    }
}

/// HTTP delegate when a URL is configured, else the placeholder.
pub fn delegate_from_config(config: &DialecticConfig) -> Arc<dyn ReasoningDelegate> {
    if let Some(url) = config.delegate_url.as_deref().filter(|u| !u.trim().is_empty()) {
        match HttpDelegate::new(url, Duration::from_millis(config.delegate_timeout_ms)) {
            Ok(d) => return Arc::new(d),
            Err(e) => error!("delegate client for {} failed: {}", url, e),
        }
    }
    Arc::new(PlaceholderDelegate)
}
