//! Governance engine
//!
//! Integrates the EISV dynamics for each report, scores risk, applies the
//! circuit breaker and the adaptive controller, and returns a verdict.

pub mod circuit;
pub mod controller;
pub mod decision;
pub mod drift;
pub mod dynamics;
pub mod governor;
pub mod health;
pub mod monitor;
pub mod report;
pub mod risk;
pub mod sweep;
pub mod void_state;

pub use circuit::LoopPattern;
pub use controller::SamplingParams;
pub use decision::Verdict;
pub use governor::{Governor, MetricsSnapshot, TagUpdate, UpdateResponse};
pub use monitor::Evaluation;
pub use report::UpdateReport;
pub use risk::{RiskBreakdown, RiskScorer};
