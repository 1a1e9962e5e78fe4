//! Activity reports as submitted by agents

use serde::Deserialize;

/// One self-report. Values are clamped on [`UpdateReport::sanitized`];
/// arithmetic downstream is total.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateReport {
    #[serde(default)]
    pub complexity: f64,
    #[serde(default, alias = "description", alias = "text")]
    pub response_text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Optional caller-estimated drift components.
    #[serde(default)]
    pub ethical_drift: Option<Vec<f64>>,
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl UpdateReport {
    pub fn new(complexity: f64, response_text: impl Into<String>) -> Self {
        Self {
            complexity,
            response_text: response_text.into(),
            confidence: None,
            ethical_drift: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Clamp every numeric field into range; non-finite values become 0.
    pub fn sanitized(&self) -> Self {
        Self {
            complexity: unit(self.complexity),
            response_text: self.response_text.clone(),
            confidence: self.confidence.map(unit),
            ethical_drift: self.ethical_drift.as_ref().map(|v| {
                v.iter()
                    .map(|x| if x.is_finite() { x.clamp(-1.0, 1.0) } else { 0.0 })
                    .collect()
            }),
        }
    }
}
