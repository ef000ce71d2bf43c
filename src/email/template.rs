//! Magic-link email bodies: a small internal string-substitution generator,
//! no template-engine dependency. A translated string table covers `en`;
//! unknown languages fall back to `en` untranslated rather than failing.

use std::collections::HashMap;

struct Strings {
    subject: &'static str,
    greeting: &'static str,
    body: &'static str,
    button: &'static str,
    footer: &'static str,
}

const EN: Strings = Strings {
    subject: "Sign in to {service}",
    greeting: "Hello,",
    body: "Click the link below to sign in to {service}. This link expires in {minutes} minutes and can only be used once.",
    button: "Sign in",
    footer: "If you didn't request this email, you can safely ignore it.",
};

fn strings_for(_lang: &str) -> &'static Strings {
    // Only `en` is built in today; unknown languages pass through `en`
    // untranslated rather than erroring.
    &EN
}

/// A rendered magic-link email, ready for dispatch.
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

fn substitute(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end_rel) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        let end = start + end_rel;
        let key = &rest[start + 1..end];
        out.push_str(&rest[..start]);
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..=end]),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Render the magic-link email for `email`, pointing at `login_url`, naming
/// `service` and optionally `logo_url`, valid for `ttl_minutes`.
#[must_use]
pub fn render(lang: &str, service: &str, logo_url: Option<&str>, login_url: &str, ttl_minutes: u64) -> RenderedEmail {
    let strings = strings_for(lang);
    let minutes = ttl_minutes.to_string();
    let vars: HashMap<&str, &str> = HashMap::from([
        ("service", service),
        ("login_url", login_url),
        ("minutes", minutes.as_str()),
    ]);

    let subject = substitute(strings.subject, &vars);
    let greeting = substitute(strings.greeting, &vars);
    let body = substitute(strings.body, &vars);
    let button = substitute(strings.button, &vars);
    let footer = substitute(strings.footer, &vars);

    let logo_html = logo_url
        .map(|url| format!("<p><img src=\"{url}\" alt=\"{service}\" height=\"32\"></p>"))
        .unwrap_or_default();

    let html = format!(
        "<html><body>{logo_html}<p>{greeting}</p><p>{body}</p>\
         <p><a href=\"{login_url}\">{button}</a></p><p style=\"color:#888\">{footer}</p></body></html>"
    );
    let text = format!("{greeting}\n\n{body}\n\n{login_url}\n\n{footer}");

    RenderedEmail { subject, html, text }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_placeholders() {
        let email = render("en", "Acme", None, "https://gw/_auth/verify?t=abc", 15);
        assert!(email.subject.contains("Acme"));
        assert!(email.html.contains("https://gw/_auth/verify?t=abc"));
        assert!(email.text.contains("15 minutes") || email.html.contains("15 minutes"));
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let known = render("en", "Acme", None, "https://x", 5);
        let unknown = render("xx-not-a-real-lang", "Acme", None, "https://x", 5);
        assert_eq!(known.subject, unknown.subject);
    }

    #[test]
    fn logo_url_is_embedded_when_present() {
        let email = render("en", "Acme", Some("https://acme.test/logo.png"), "https://x", 5);
        assert!(email.html.contains("https://acme.test/logo.png"));
    }

    #[test]
    fn unknown_placeholder_is_left_untouched() {
        let out = substitute("hello {unknown} world", &HashMap::new());
        assert_eq!(out, "hello {unknown} world");
    }
}
