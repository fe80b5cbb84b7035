//! Slug formatting, project-key normalization, and slug classification.
//!
//! Slugs are `KEY-N` for tasks, `KEY-S-N` for sprints and `KEY-P-N` for
//! projects. Keys are 2-10 ASCII alphanumerics, stored uppercase, so a key
//! can never contain the `-S-` / `-P-` infixes used for classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::models::EntityKind;
use crate::errors::SlugError;

pub const MIN_KEY_LEN: usize = 2;
pub const MAX_KEY_LEN: usize = 10;

// Compile regexes once using LazyLock
static TASK_SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]+-\d+$").unwrap());
static SPRINT_SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]+-S-\d+$").unwrap());
static PROJECT_SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]+-P-\d+$").unwrap());

/// A formatted slug together with the components it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slug {
    pub slug: String,
    pub key: String,
    pub number: i64,
}

impl Slug {
    pub fn new(kind: EntityKind, key: &str, number: i64) -> Self {
        Self {
            slug: format_slug(kind, key, number),
            key: key.to_string(),
            number,
        }
    }
}

impl std::fmt::Display for Slug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.slug)
    }
}

pub fn format_slug(kind: EntityKind, key: &str, number: i64) -> String {
    match kind {
        EntityKind::Task => format!("{}-{}", key, number),
        EntityKind::Sprint => format!("{}-S-{}", key, number),
        EntityKind::Project => format!("{}-P-{}", key, number),
    }
}

/// Trim and uppercase a user-supplied project key, rejecting anything that
/// is not 2-10 ASCII letters or digits.
pub fn normalize_key(raw: &str) -> Result<String, SlugError> {
    let key = raw.trim().to_ascii_uppercase();
    let valid = (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len())
        && key.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(key)
    } else {
        Err(SlugError::InvalidKey(raw.to_string()))
    }
}

/// Derive a project key from a client name: initials of a multi-word name,
/// otherwise the leading characters of a single word, capped at four.
pub fn suggest_key(name: &str) -> Option<String> {
    let words: Vec<String> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();

    let key: String = match words.as_slice() {
        [] => return None,
        [single] => single.chars().take(4).collect(),
        many => many.iter().filter_map(|w| w.chars().next()).take(4).collect(),
    };

    normalize_key(&key).ok()
}

/// Canonical form used for lookups: trimmed and uppercased.
pub fn normalize_slug(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Guess the entity kind from a normalized slug's shape.
///
/// Returns `None` when the shape matches no kind, in which case callers
/// probe task, project, then sprint.
pub fn classify(slug: &str) -> Option<EntityKind> {
    if slug.contains("-S-") {
        return SPRINT_SLUG_REGEX
            .is_match(slug)
            .then_some(EntityKind::Sprint);
    }
    if PROJECT_SLUG_REGEX.is_match(slug) {
        return Some(EntityKind::Project);
    }
    if TASK_SLUG_REGEX.is_match(slug) {
        return Some(EntityKind::Task);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_slug_per_kind() {
        assert_eq!(format_slug(EntityKind::Task, "ACME", 7), "ACME-7");
        assert_eq!(format_slug(EntityKind::Sprint, "ACME", 7), "ACME-S-7");
        assert_eq!(format_slug(EntityKind::Project, "ACME", 7), "ACME-P-7");
    }

    #[test]
    fn test_slug_new_keeps_components() {
        let slug = Slug::new(EntityKind::Sprint, "WEB", 12);
        assert_eq!(slug.slug, "WEB-S-12");
        assert_eq!(slug.key, "WEB");
        assert_eq!(slug.number, 12);
        assert_eq!(slug.to_string(), "WEB-S-12");
    }

    #[test]
    fn test_normalize_key_uppercases_and_trims() {
        assert_eq!(normalize_key("  acme ").unwrap(), "ACME");
        assert_eq!(normalize_key("a1").unwrap(), "A1");
    }

    #[test]
    fn test_normalize_key_rejects_bad_shapes() {
        assert!(normalize_key("").is_err());
        assert!(normalize_key("A").is_err());
        assert!(normalize_key("AC-ME").is_err());
        assert!(normalize_key("ABCDEFGHIJK").is_err());
        assert!(matches!(normalize_key("ÄCME"), Err(SlugError::InvalidKey(_))));
    }

    #[test]
    fn test_suggest_key_uses_initials_or_prefix() {
        assert_eq!(suggest_key("Acme Rocket Supply").as_deref(), Some("ARS"));
        assert_eq!(suggest_key("globex").as_deref(), Some("GLOB"));
        assert_eq!(suggest_key("a b c d e f").as_deref(), Some("ABCD"));
        assert_eq!(suggest_key("X"), None);
        assert_eq!(suggest_key("  --  "), None);
    }

    #[test]
    fn test_classify_by_shape() {
        assert_eq!(classify("ACME-S-3"), Some(EntityKind::Sprint));
        assert_eq!(classify("ACME-P-3"), Some(EntityKind::Project));
        assert_eq!(classify("ACME-7"), Some(EntityKind::Task));
        assert_eq!(classify("ACME"), None);
        assert_eq!(classify("ACME-X-1"), None);
        assert_eq!(classify("ACME-S-"), None);
    }

    #[test]
    fn test_normalize_slug() {
        assert_eq!(normalize_slug("  acme-s-3 "), "ACME-S-3");
    }
}
