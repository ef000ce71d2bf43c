//! Authorization checker: email/domain allow-list evaluation.
//!
//! The matching discipline (ordered entries, `@domain` suffix matching,
//! case-insensitive) is grounded on `key_server::policy::PolicyEngine`'s
//! rule evaluation, simplified here to a single allow/deny predicate since
//! this system has no scope-intersection concept.

/// Allow-list of bare emails and `@domain` suffixes.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationChecker {
    entries: Vec<String>,
}

impl AuthorizationChecker {
    /// Build from raw config entries (each a full email or `@domain`).
    /// Entries are normalized (lowercased, trimmed) at construction.
    #[must_use]
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// True iff the allow-list is non-empty — i.e. an email is required at all.
    #[must_use]
    pub fn requires_email(&self) -> bool {
        !self.entries.is_empty()
    }

    /// True iff no allow-list is configured, or `email` matches an entry.
    #[must_use]
    pub fn is_allowed(&self, email: &str) -> bool {
        if !self.requires_email() {
            return true;
        }
        let Some(normalized) = normalize(email) else {
            return false;
        };
        let Some(domain) = normalized.rsplit('@').next() else {
            return false;
        };
        self.entries.iter().any(|entry| {
            if let Some(allowed_domain) = entry.strip_prefix('@') {
                domain == allowed_domain
            } else {
                *entry == normalized
            }
        })
    }
}

/// Lowercase and trim; reject anything that isn't exactly one `@`.
fn normalize(email: &str) -> Option<String> {
    let trimmed = email.trim().to_lowercase();
    if trimmed.matches('@').count() != 1 {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_allows_everything() {
        let checker = AuthorizationChecker::new(vec![]);
        assert!(!checker.requires_email());
        assert!(checker.is_allowed("anyone@example.com"));
    }

    #[test]
    fn exact_email_match_is_case_insensitive() {
        let checker = AuthorizationChecker::new(vec!["Alice@Example.com".to_string()]);
        assert!(checker.is_allowed("alice@example.com"));
        assert!(checker.is_allowed("  ALICE@EXAMPLE.COM  "));
        assert!(!checker.is_allowed("bob@example.com"));
    }

    #[test]
    fn domain_suffix_match() {
        let checker = AuthorizationChecker::new(vec!["@example.com".to_string()]);
        assert!(checker.is_allowed("anyone@example.com"));
        assert!(!checker.is_allowed("anyone@evil.com"));
        assert!(!checker.is_allowed("anyone@sub.example.com"));
    }

    #[test]
    fn invalid_email_is_never_allowed_with_whitelist() {
        let checker = AuthorizationChecker::new(vec!["@example.com".to_string()]);
        assert!(!checker.is_allowed("no-at-sign"));
        assert!(!checker.is_allowed("a@b@example.com"));
    }

    #[test]
    fn requires_email_tracks_whether_list_is_populated() {
        assert!(!AuthorizationChecker::new(vec![]).requires_email());
        assert!(AuthorizationChecker::new(vec!["a@b.com".into()]).requires_email());
    }
}
