//! Route classifier: rule evaluation over the request path.
//!
//! Tagged-variant matchers rather than a trait-object-per-rule hierarchy —
//! add a matcher by adding an enum variant and its predicate, following the
//! rules-engine note in the design notes this system inherited.

use regex::Regex;

/// What a matched (or unmatched) route should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Forward to upstream without a session check.
    Allow,
    /// Forward to upstream only if a valid session is present.
    Auth,
    /// Always reject with 403.
    Deny,
}

/// A single matcher, exactly one of the tagged variants.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Byte-equal match.
    Exact(String),
    /// Path starts with this string.
    Prefix(String),
    /// Regex, anchored exactly as written (no implicit `^`/`$`).
    Regex(Regex),
    /// Glob supporting `*`, `**`, `?`, `{a,b}`. The `glob` crate's own
    /// `Pattern` has no brace-alternation syntax, so a single top-level
    /// `{a,b,c}` group is expanded at construction time into one pattern
    /// per alternative; matching is "any alternative matches".
    Minimatch(Vec<glob::Pattern>),
    /// Unconditional.
    All,
}

/// Build a [`Matcher::Minimatch`] from a minimatch-style glob string,
/// expanding a single top-level `{a,b}` brace group into alternatives.
pub fn minimatch(pattern: &str) -> Result<Matcher, glob::PatternError> {
    let alternatives = expand_braces(pattern);
    let compiled = alternatives
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Matcher::Minimatch(compiled))
}

fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close_rel) = pattern[open..].find('}') else {
        return vec![pattern.to_string()];
    };
    let close = open + close_rel;
    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];
    body.split(',')
        .map(|alt| format!("{prefix}{alt}{suffix}"))
        .collect()
}

/// A configured rule: a matcher plus the action to take when it matches.
#[derive(Debug, Clone)]
pub struct Rule {
    /// The matcher.
    pub matcher: Matcher,
    /// The action when `matcher` matches.
    pub action: Action,
}

impl Rule {
    fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(s) => path == s,
            Matcher::Prefix(p) => path.starts_with(p.as_str()),
            Matcher::Regex(re) => re.is_match(path),
            Matcher::Minimatch(pats) => pats.iter().any(|p| p.matches(path)),
            Matcher::All => true,
        }
    }
}

/// Evaluates rules top-to-bottom; first match wins; unmatched paths deny.
pub struct RouteClassifier {
    rules: Vec<Rule>,
}

impl RouteClassifier {
    /// Build a classifier from an ordered rule list.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Classify `path`, returning the action of the first matching rule, or
    /// [`Action::Deny`] if none matches.
    #[must_use]
    pub fn classify(&self, path: &str) -> Action {
        self.rules
            .iter()
            .find(|r| r.matches(path))
            .map_or(Action::Deny, |r| r.action)
    }
}

/// Static resources that bypass classification entirely, always allowed:
/// favicon/robots/apple-touch icons.
#[must_use]
pub fn is_builtin_static_asset(path: &str) -> bool {
    matches!(
        path,
        "/favicon.ico" | "/robots.txt"
    ) || path.starts_with("/apple-touch-icon")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(matcher: Matcher, action: Action) -> Rule {
        Rule { matcher, action }
    }

    #[test]
    fn first_match_wins() {
        let classifier = RouteClassifier::new(vec![
            rule(Matcher::Prefix("/admin".into()), Action::Deny),
            rule(Matcher::Prefix("/".into()), Action::Auth),
        ]);
        assert_eq!(classifier.classify("/admin/panel"), Action::Deny);
        assert_eq!(classifier.classify("/app"), Action::Auth);
    }

    #[test]
    fn unmatched_path_denies() {
        let classifier = RouteClassifier::new(vec![rule(Matcher::Exact("/only".into()), Action::Allow)]);
        assert_eq!(classifier.classify("/other"), Action::Deny);
    }

    #[test]
    fn exact_matcher_is_byte_equal() {
        let classifier = RouteClassifier::new(vec![rule(Matcher::Exact("/x".into()), Action::Allow)]);
        assert_eq!(classifier.classify("/x"), Action::Allow);
        assert_eq!(classifier.classify("/x/"), Action::Deny);
    }

    #[test]
    fn regex_matcher_is_not_implicitly_anchored() {
        let re = Regex::new("^/api/v[0-9]+/").unwrap();
        let classifier = RouteClassifier::new(vec![rule(Matcher::Regex(re), Action::Allow)]);
        assert_eq!(classifier.classify("/api/v2/users"), Action::Allow);
        assert_eq!(classifier.classify("/other/api/v2/users"), Action::Deny);
    }

    #[test]
    fn minimatch_supports_double_star_and_braces() {
        let matcher = minimatch("/assets/**/*.{css,js}").unwrap();
        let classifier = RouteClassifier::new(vec![rule(matcher, Action::Allow)]);
        assert_eq!(classifier.classify("/assets/app/main.js"), Action::Allow);
        assert_eq!(classifier.classify("/assets/app.png"), Action::Deny);
    }

    #[test]
    fn brace_expansion_produces_one_pattern_per_alternative() {
        let matcher = minimatch("/a.{png,jpg}").unwrap();
        let Matcher::Minimatch(pats) = matcher else { panic!() };
        assert_eq!(pats.len(), 2);
    }

    #[test]
    fn all_matches_unconditionally() {
        let classifier = RouteClassifier::new(vec![rule(Matcher::All, Action::Auth)]);
        assert_eq!(classifier.classify("/literally/anything"), Action::Auth);
    }

    #[test]
    fn builtin_static_assets_recognized() {
        assert!(is_builtin_static_asset("/favicon.ico"));
        assert!(is_builtin_static_asset("/robots.txt"));
        assert!(is_builtin_static_asset("/apple-touch-icon.png"));
        assert!(!is_builtin_static_asset("/index.html"));
    }
}
