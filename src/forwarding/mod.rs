//! Identity forwarding: projects the authenticated user onto upstream
//! headers and query parameters.

pub mod filters;

use std::collections::HashMap;

use serde_json::Value;

use crate::session::Session;
use filters::FilterSpec;

/// Where a resolved field value is injected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Header(String),
    Query(String),
}

/// One configured `forwarding` entry: a path into the user view, a filter
/// chain, and the destination it targets.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub path: String,
    pub filters: Vec<FilterSpec>,
    pub destination: Destination,
}

/// A read-only projection of [`Session`] used for path resolution.
struct UserView<'a> {
    session: &'a Session,
}

impl<'a> UserView<'a> {
    fn resolve(&self, path: &str) -> Option<Value> {
        let path = path.strip_prefix('.').unwrap_or(path);
        if path.is_empty() {
            return Some(serde_json::json!({
                "email": self.session.email,
                "username": self.session.username,
                "provider": self.session.provider,
                "extra": self.session.extra,
            }));
        }
        match path {
            "email" => Some(Value::String(self.session.email.clone())),
            "username" => Some(Value::String(self.session.username.clone())),
            "provider" => Some(Value::String(self.session.provider.clone())),
            other => other
                .strip_prefix("extra.")
                .and_then(|key| self.session.extra.get(key))
                .cloned(),
        }
    }
}

/// Control characters (`< 32`, `== 127`) stripped and length clamped to this
/// many bytes before a value is injected into an HTTP header.
const MAX_HEADER_VALUE_BYTES: usize = 8192;

fn sanitize_header_value(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    if cleaned.len() <= MAX_HEADER_VALUE_BYTES {
        cleaned
    } else {
        cleaned.chars().take(MAX_HEADER_VALUE_BYTES).collect()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every `mapping` against `session`, applying the priority rule:
/// the first successfully resolved path for a given destination wins, and a
/// later resolution never overwrites it. Header values are sanitized;
/// query values are not (the HTTP client layer percent-encodes them).
#[must_use]
pub fn resolve(session: &Session, mappings: &[FieldMapping]) -> (HashMap<String, String>, HashMap<String, String>) {
    let view = UserView { session };
    let mut headers = HashMap::new();
    let mut query = HashMap::new();

    for mapping in mappings {
        let Some(value) = view.resolve(&mapping.path) else {
            continue;
        };
        let raw = value_to_string(&value);
        let Ok(filtered) = filters::run_pipeline(&raw, &mapping.filters) else {
            continue;
        };

        match &mapping.destination {
            Destination::Header(name) => {
                headers.entry(name.clone()).or_insert_with(|| sanitize_header_value(&filtered));
            }
            Destination::Query(name) => {
                query.entry(name.clone()).or_insert(filtered);
            }
        }
    }

    (headers, query)
}
