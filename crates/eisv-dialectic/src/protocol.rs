//! Dialectic state machine
//!
//! ```text
//! pending ──thesis──▶ thesis ──antithesis──▶ antithesis ──synthesis──▶ negotiation
//!                                                                   │  ▲ synthesis
//!                                                                   ▼──┘
//!                                                           resolved | timeout
//! ```
//!
//! Pure functions over [`DialecticSession`]; persistence and lifecycle
//! effects live in the coordinator.

use chrono::{DateTime, Duration, Utc};
use eisv_core::config::DialecticConfig;
use eisv_core::{
    AgentId, Agreement, DialecticMessage, DialecticContent, DialecticSession, DialecticStatus,
    Error, MessageType, ResolutionOutcome, Result,
};

/// Message as submitted, before it gets a sequence number.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: MessageType,
    pub author: AgentId,
    pub author_display: String,
    pub content: DialecticContent,
}

#[derive(Debug, Clone, Copy)]
pub struct Rules {
    pub max_rounds: usize,
    pub allow_self_review: bool,
}

impl Rules {
    pub fn from_config(config: &DialecticConfig) -> Self {
        Self {
            max_rounds: config.max_negotiation_rounds.max(1),
            allow_self_review: config.allow_self_review,
        }
    }
}

/// Validate and append one message, advancing the status.
pub fn submit(
    session: &mut DialecticSession,
    sub: Submission,
    rules: &Rules,
    now: DateTime<Utc>,
) -> Result<()> {
    if session.status.is_terminal() {
        return Err(Error::InvalidState(format!(
            "dialectic {} is already {}",
            session.id,
            session.status.as_str()
        )));
    }
    let paused = session.paused_agent;

    match (sub.kind, session.status) {
        (MessageType::Thesis, DialecticStatus::Pending) => {
            if sub.author != paused {
                return Err(Error::InvalidState(
                    "only the paused agent may submit the thesis".into(),
                ));
            }
            session.status = DialecticStatus::Thesis;
        }
        (MessageType::Antithesis, DialecticStatus::Thesis) => {
            match session.reviewer {
                Some(reviewer) if reviewer != sub.author => {
                    return Err(Error::InvalidState(
                        "antithesis must come from the assigned reviewer".into(),
                    ));
                }
                Some(_) => {}
                None => {
                    if sub.author == paused && !rules.allow_self_review {
                        return Err(Error::InvalidState("self-review is disabled".into()));
                    }
                    session.reviewer = Some(sub.author);
                }
            }
            session.status = DialecticStatus::Antithesis;
        }
        (MessageType::Synthesis, DialecticStatus::Antithesis | DialecticStatus::Negotiation) => {
            if sub.author != paused && Some(sub.author) != session.reviewer {
                return Err(Error::InvalidState(
                    "only the paused agent or its reviewer may negotiate".into(),
                ));
            }
            session.status = DialecticStatus::Negotiation;
            session.synthesis_rounds += 1;
        }
        (kind, status) => {
            return Err(Error::InvalidState(format!(
                "{} not accepted while {}",
                kind.as_str(),
                status.as_str()
            )));
        }
    }

    session.messages.push(DialecticMessage {
        seq: session.next_seq,
        kind: sub.kind,
        author: sub.author,
        author_display: sub.author_display,
        content: sub.content,
        at: now,
    });
    session.next_seq += 1;
    session.updated_at = now;

    if sub.kind == MessageType::Synthesis {
        settle(session, sub.author, rules, now);
    }
    Ok(())
}

/// Close the negotiation when both sides' latest syntheses agree, or when
/// the round limit is used up.
fn settle(session: &mut DialecticSession, author: AgentId, rules: &Rules, now: DateTime<Utc>) {
    let paused = session.paused_agent;
    let reviewer = session.reviewer.unwrap_or(paused);
    let other = if author == paused { reviewer } else { paused };

    let latest = session.last_message_by(MessageType::Synthesis, author);
    let counterpart = session.last_message_by(MessageType::Synthesis, other);

    let agreement = match (latest, counterpart) {
        (Some(mine), Some(theirs))
            if mine.content.agrees == Some(true) && theirs.content.agrees == Some(true) =>
        {
            let mut conditions: Vec<String> = Vec::new();
            for c in mine
                .content
                .proposed_conditions
                .iter()
                .chain(theirs.content.proposed_conditions.iter())
            {
                let c = c.trim();
                if !c.is_empty() && !conditions.iter().any(|seen| seen.eq_ignore_ascii_case(c)) {
                    conditions.push(c.to_string());
                }
            }
            let root_cause = mine
                .content
                .root_cause
                .clone()
                .or_else(|| theirs.content.root_cause.clone())
                .or_else(|| {
                    session
                        .last_message(MessageType::Thesis)
                        .and_then(|t| t.content.root_cause.clone())
                });
            Some(Agreement {
                agreed: true,
                root_cause,
                conditions,
            })
        }
        _ if session.synthesis_rounds >= rules.max_rounds => Some(Agreement {
            agreed: false,
            root_cause: None,
            conditions: Vec::new(),
        }),
        _ => None,
    };

    if let Some(agreement) = agreement {
        session.agreement = Some(agreement);
        session.status = DialecticStatus::Resolved;
        session.resolved_at = Some(now);
    }
}

/// Move an idle, non-terminal session to `timeout`. Returns whether it did.
pub fn expire_if_idle(session: &mut DialecticSession, now: DateTime<Utc>, timeout: Duration) -> bool {
    if session.status.is_terminal() || now - session.updated_at < timeout {
        return false;
    }
    session.status = DialecticStatus::Timeout;
    session.resolved_at = Some(now);
    true
}

/// First agreed condition containing a forbidden phrase, case-insensitively.
pub fn forbidden_condition<'a>(conditions: &'a [String], forbidden: &[String]) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| {
            let lower = c.to_lowercase();
            forbidden
                .iter()
                .any(|f| !f.trim().is_empty() && lower.contains(&f.trim().to_lowercase()))
        })
        .map(String::as_str)
}

/// Outcome for a terminal session given the paused agent's coherence now.
pub fn decide_outcome(
    session: &DialecticSession,
    coherence: f64,
    coherence_critical: f64,
    forbidden: &[String],
) -> (ResolutionOutcome, String) {
    if session.status == DialecticStatus::Timeout {
        return (
            ResolutionOutcome::Escalate,
            "no activity before the inactivity timeout".into(),
        );
    }
    match &session.agreement {
        Some(a) if a.agreed => {
            if let Some(c) = forbidden_condition(&a.conditions, forbidden) {
                (
                    ResolutionOutcome::Escalate,
                    format!("agreed condition {c:?} is not permitted"),
                )
            } else if coherence < coherence_critical {
                (
                    ResolutionOutcome::Cooldown,
                    format!("coherence {coherence:.3} still below {coherence_critical:.2}"),
                )
            } else {
                (ResolutionOutcome::Resume, "agreement reached".into())
            }
        }
        _ => (
            ResolutionOutcome::Escalate,
            "negotiation ended without agreement".into(),
        ),
    }
}

/// Who writes the next message, and which kind. `None` when the session is
/// terminal or waits on an unassigned reviewer that cannot be the agent itself.
pub fn next_step(session: &DialecticSession, rules: &Rules) -> Option<(MessageType, AgentId)> {
    let paused = session.paused_agent;
    match session.status {
        DialecticStatus::Pending => Some((MessageType::Thesis, paused)),
        DialecticStatus::Thesis => match session.reviewer {
            Some(r) => Some((MessageType::Antithesis, r)),
            None if rules.allow_self_review => Some((MessageType::Antithesis, paused)),
            None => None,
        },
        DialecticStatus::Antithesis => Some((MessageType::Synthesis, paused)),
        DialecticStatus::Negotiation => {
            let reviewer = session.reviewer.unwrap_or(paused);
            let last = session
                .messages
                .iter()
                .rev()
                .find(|m| m.kind == MessageType::Synthesis)
                .map(|m| m.author);
            let next = if last == Some(paused) { reviewer } else { paused };
            Some((MessageType::Synthesis, next))
        }
        DialecticStatus::Resolved | DialecticStatus::Timeout => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eisv_core::SessionType;

    fn rules() -> Rules {
        Rules {
            max_rounds: 3,
            allow_self_review: true,
        }
    }

    fn sub(kind: MessageType, author: AgentId, content: DialecticContent) -> Submission {
        Submission {
            kind,
            author,
            author_display: author.to_string(),
            content,
        }
    }

    fn synthesis(agrees: bool, conditions: &[&str]) -> DialecticContent {
        DialecticContent {
            agrees: Some(agrees),
            proposed_conditions: conditions.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn opened() -> (DialecticSession, AgentId, AgentId) {
        let paused = AgentId::new();
        let reviewer = AgentId::new();
        let mut s = DialecticSession::new(paused, SessionType::Review, "risk", Utc::now());
        s.reviewer = Some(reviewer);
        (s, paused, reviewer)
    }

    #[test]
    fn out_of_order_message_is_rejected() {
        let (mut s, paused, _) = opened();
        let err = submit(&mut s, sub(MessageType::Synthesis, paused, Default::default()), &rules(), Utc::now());
        assert!(matches!(err, Err(Error::InvalidState(_))));
        assert!(s.messages.is_empty());
    }

    #[test]
    fn thesis_only_from_paused_agent() {
        let (mut s, _, reviewer) = opened();
        let err = submit(&mut s, sub(MessageType::Thesis, reviewer, Default::default()), &rules(), Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn agreement_merges_conditions_and_resolves() {
        let (mut s, paused, reviewer) = opened();
        let now = Utc::now();
        let thesis = DialecticContent {
            root_cause: Some("looping on retries".into()),
            ..Default::default()
        };
        submit(&mut s, sub(MessageType::Thesis, paused, thesis), &rules(), now).unwrap();
        submit(&mut s, sub(MessageType::Antithesis, reviewer, Default::default()), &rules(), now).unwrap();
        submit(&mut s, sub(MessageType::Synthesis, paused, synthesis(true, &["cap retries"])), &rules(), now).unwrap();
        assert_eq!(s.status, DialecticStatus::Negotiation);
        submit(
            &mut s,
            sub(MessageType::Synthesis, reviewer, synthesis(true, &["Cap retries", "log each attempt"])),
            &rules(),
            now,
        )
        .unwrap();

        assert_eq!(s.status, DialecticStatus::Resolved);
        let agreement = s.agreement.clone().unwrap();
        assert!(agreement.agreed);
        assert_eq!(agreement.conditions, vec!["Cap retries", "log each attempt"]);
        assert_eq!(agreement.root_cause.as_deref(), Some("looping on retries"));
        let seqs: Vec<u64> = s.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn round_limit_resolves_without_agreement() {
        let (mut s, paused, reviewer) = opened();
        let now = Utc::now();
        submit(&mut s, sub(MessageType::Thesis, paused, Default::default()), &rules(), now).unwrap();
        submit(&mut s, sub(MessageType::Antithesis, reviewer, Default::default()), &rules(), now).unwrap();
        for author in [paused, reviewer, paused] {
            submit(&mut s, sub(MessageType::Synthesis, author, synthesis(false, &[])), &rules(), now).unwrap();
        }
        assert_eq!(s.status, DialecticStatus::Resolved);
        assert!(!s.agreement.as_ref().unwrap().agreed);
        let (outcome, _) = decide_outcome(&s, 0.6, 0.4, &[]);
        assert_eq!(outcome, ResolutionOutcome::Escalate);
    }

    #[test]
    fn self_review_needs_permission() {
        let paused = AgentId::new();
        let mut s = DialecticSession::new(paused, SessionType::Review, "risk", Utc::now());
        let strict = Rules {
            allow_self_review: false,
            ..rules()
        };
        submit(&mut s, sub(MessageType::Thesis, paused, Default::default()), &strict, Utc::now()).unwrap();
        assert!(submit(&mut s, sub(MessageType::Antithesis, paused, Default::default()), &strict, Utc::now()).is_err());
        submit(&mut s, sub(MessageType::Antithesis, paused, Default::default()), &rules(), Utc::now()).unwrap();
        assert_eq!(s.reviewer, Some(paused));
        // one agreeing synthesis settles a self-review
        submit(&mut s, sub(MessageType::Synthesis, paused, synthesis(true, &[])), &rules(), Utc::now()).unwrap();
        assert_eq!(s.status, DialecticStatus::Resolved);
    }

    #[test]
    fn idle_session_times_out() {
        let (mut s, _, _) = opened();
        let later = s.updated_at + Duration::seconds(1800);
        assert!(!expire_if_idle(&mut s, later - Duration::seconds(1), Duration::seconds(1800)));
        assert!(expire_if_idle(&mut s, later, Duration::seconds(1800)));
        assert_eq!(s.status, DialecticStatus::Timeout);
        assert_eq!(decide_outcome(&s, 0.9, 0.4, &[]).0, ResolutionOutcome::Escalate);
    }

    #[test]
    fn outcome_screens_conditions_and_gates_on_coherence() {
        let (mut s, _, _) = opened();
        s.status = DialecticStatus::Resolved;
        s.agreement = Some(Agreement {
            agreed: true,
            root_cause: None,
            conditions: vec!["Disable governance checks for a day".into()],
        });
        let forbidden = vec!["disable governance".to_string()];
        assert_eq!(decide_outcome(&s, 0.6, 0.4, &forbidden).0, ResolutionOutcome::Escalate);

        s.agreement.as_mut().unwrap().conditions = vec!["smaller steps".into()];
        assert_eq!(decide_outcome(&s, 0.35, 0.4, &forbidden).0, ResolutionOutcome::Cooldown);
        assert_eq!(decide_outcome(&s, 0.55, 0.4, &forbidden).0, ResolutionOutcome::Resume);
    }

    #[test]
    fn next_step_alternates_during_negotiation() {
        let (mut s, paused, reviewer) = opened();
        let now = Utc::now();
        assert_eq!(next_step(&s, &rules()), Some((MessageType::Thesis, paused)));
        submit(&mut s, sub(MessageType::Thesis, paused, Default::default()), &rules(), now).unwrap();
        assert_eq!(next_step(&s, &rules()), Some((MessageType::Antithesis, reviewer)));
        submit(&mut s, sub(MessageType::Antithesis, reviewer, Default::default()), &rules(), now).unwrap();
        submit(&mut s, sub(MessageType::Synthesis, paused, synthesis(false, &[])), &rules(), now).unwrap();
        assert_eq!(next_step(&s, &rules()), Some((MessageType::Synthesis, reviewer)));
    }
}
