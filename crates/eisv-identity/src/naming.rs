//! Display ids and display-name validation

use chrono::{DateTime, Utc};
use eisv_core::{AgentId, Error, Result};

/// Render a display id such as `agent_20261014_a1b2c3`.
///
/// `suffix_len` hex characters of the UUID are used; callers widen it on
/// collision.
pub fn display_id(
    template: &str,
    prefix: &str,
    created: DateTime<Utc>,
    id: AgentId,
    suffix_len: usize,
) -> String {
    let simple = id.as_uuid().simple().to_string();
    let suffix = &simple[..suffix_len.clamp(4, simple.len())];
    template
        .replace("{prefix}", prefix)
        .replace("{date}", &created.format("%Y%m%d").to_string())
        .replace("{suffix}", suffix)
}

/// Validate and normalize a caller-chosen display name.
pub fn validate_name(raw: &str, max_len: usize) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::InvalidArgument("name must not be empty".into()));
    }
    if name.chars().count() > max_len {
        return Err(Error::InvalidArgument(format!(
            "name longer than {max_len} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ')))
    {
        return Err(Error::InvalidArgument(format!(
            "name contains invalid character {bad:?}"
        )));
    }
    if AgentId::parse(name).is_some() {
        return Err(Error::InvalidArgument("name must not be a UUID".into()));
    }
    Ok(name.to_string())
}

/// Key used for case-insensitive uniqueness.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn display_id_follows_template() {
        let created = Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap();
        let id = AgentId::from_uuid(
            uuid::Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap(),
        );
        let rendered = display_id("{prefix}_{date}_{suffix}", "agent", created, id, 6);
        assert_eq!(rendered, "agent_20261014_a1b2c3");
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(validate_name("  reviewer-1 ", 64).unwrap(), "reviewer-1");
        assert!(validate_name("", 64).is_err());
        assert!(validate_name("a/b", 64).is_err());
        assert!(validate_name(&"x".repeat(65), 64).is_err());
        assert!(validate_name(&AgentId::new().to_string(), 64).is_err());
    }
}
