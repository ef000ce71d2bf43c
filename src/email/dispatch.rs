//! Outbound delivery for magic-link emails: SMTP, an HTTPS mail API, a local
//! `sendmail` pipe, or a JSONL file sink for tests and local E2E.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};

use crate::email::template::RenderedEmail;
use crate::{Error, Result};

/// SMTP delivery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// When true, connect with implicit TLS instead of STARTTLS.
    #[serde(default)]
    pub implicit_tls: bool,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// HTTPS mail-API delivery settings (e.g. a transactional email provider).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub from: String,
}

/// Local `sendmail`-compatible binary pipe settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendmailConfig {
    #[serde(default = "default_sendmail_path")]
    pub binary_path: String,
    pub from: String,
}

fn default_sendmail_path() -> String {
    "/usr/sbin/sendmail".to_string()
}

/// JSONL file sink settings, for tests and local E2E runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSinkConfig {
    pub path: PathBuf,
}

/// Which dispatch backend to use, as configured under `email_auth.dispatch`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispatchConfig {
    Smtp(SmtpConfig),
    Api(ApiConfig),
    Sendmail(SendmailConfig),
    File(FileSinkConfig),
}

/// The magic-link fields the file sink records alongside the rendered
/// email, so a test harness can extract them without scraping HTML.
pub struct OtpRecord<'a> {
    pub token: &'a str,
    pub expires_at: i64,
    pub login_url: &'a str,
}

/// Send `email` to `to`, using the configured backend. `otp` carries the
/// issued token and its expiry; only the file sink records it.
pub async fn dispatch(config: &DispatchConfig, to: &str, otp: &OtpRecord<'_>, email: &RenderedEmail) -> Result<()> {
    match config {
        DispatchConfig::Smtp(cfg) => send_smtp(cfg, to, email).await,
        DispatchConfig::Api(cfg) => send_api(cfg, to, email).await,
        DispatchConfig::Sendmail(cfg) => send_sendmail(cfg, to, email).await,
        DispatchConfig::File(cfg) => send_file_sink(cfg, to, otp, email).await,
    }
}

async fn send_smtp(cfg: &SmtpConfig, to: &str, email: &RenderedEmail) -> Result<()> {
    let from: Mailbox = cfg
        .from
        .parse()
        .map_err(|e| Error::EmailSendFailed(format!("invalid from address: {e}")))?;
    let to_mailbox: Mailbox = to
        .parse()
        .map_err(|e| Error::EmailSendFailed(format!("invalid to address: {e}")))?;

    let message = Message::builder()
        .from(from)
        .to(to_mailbox)
        .subject(&email.subject)
        .multipart(
            lettre::message::MultiPart::alternative()
                .singlepart(lettre::message::SinglePart::plain(email.text.clone()))
                .singlepart(lettre::message::SinglePart::html(email.html.clone())),
        )
        .map_err(|e| Error::EmailSendFailed(e.to_string()))?;

    let mut builder = if cfg.implicit_tls {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
    }
    .map_err(|e| Error::EmailSendFailed(e.to_string()))?
    .port(cfg.port);

    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }

    let transport = builder.build();
    transport
        .send(message)
        .await
        .map_err(|e| Error::EmailSendFailed(e.to_string()))?;
    Ok(())
}

async fn send_api(cfg: &ApiConfig, to: &str, email: &RenderedEmail) -> Result<()> {
    let client = reqwest::Client::new();
    let payload = serde_json::json!({
        "from": cfg.from,
        "to": to,
        "subject": email.subject,
        "html": email.html,
        "text": email.text,
    });
    let response = client
        .post(&cfg.endpoint)
        .bearer_auth(&cfg.api_key)
        .json(&payload)
        .send()
        .await
        .map_err(|e| Error::EmailSendFailed(e.to_string()))?;
    if !response.status().is_success() {
        let status = response.status();
        return Err(Error::EmailSendFailed(format!("mail api returned {status}")));
    }
    Ok(())
}

async fn send_sendmail(cfg: &SendmailConfig, to: &str, email: &RenderedEmail) -> Result<()> {
    let binary = cfg.binary_path.clone();
    let from = cfg.from.clone();
    let to = to.to_string();
    let body = format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}",
        subject = email.subject,
        html = email.html,
    );

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut child = std::process::Command::new(&binary)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| Error::EmailSendFailed(format!("spawning sendmail: {e}")))?;
        child
            .stdin
            .take()
            .ok_or_else(|| Error::EmailSendFailed("sendmail stdin unavailable".into()))?
            .write_all(body.as_bytes())
            .map_err(|e| Error::EmailSendFailed(format!("writing to sendmail: {e}")))?;
        let status = child
            .wait()
            .map_err(|e| Error::EmailSendFailed(format!("waiting on sendmail: {e}")))?;
        if !status.success() {
            return Err(Error::EmailSendFailed(format!("sendmail exited with {status}")));
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::EmailSendFailed(e.to_string()))?
}

async fn send_file_sink(cfg: &FileSinkConfig, to: &str, otp: &OtpRecord<'_>, _email: &RenderedEmail) -> Result<()> {
    #[derive(Serialize)]
    struct Record<'a> {
        email: &'a str,
        token: &'a str,
        expires_at: i64,
        login_url: &'a str,
    }
    let record = Record {
        email: to,
        token: otp.token,
        expires_at: otp.expires_at,
        login_url: otp.login_url,
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    let path = cfg.path.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(&path)
                .map_err(|e| Error::EmailSendFailed(format!("opening file sink: {e}")))?
        };
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::EmailSendFailed(format!("opening file sink: {e}")))?;

        let mut lock = fd_lock::RwLock::new(&mut file);
        let mut guard = lock
            .write()
            .map_err(|e| Error::EmailSendFailed(format!("locking file sink: {e}")))?;
        guard
            .write_all(line.as_bytes())
            .map_err(|e| Error::EmailSendFailed(format!("writing file sink: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::EmailSendFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> RenderedEmail {
        RenderedEmail {
            subject: "Sign in".into(),
            html: "<p>link</p>".into(),
            text: "link".into(),
        }
    }

    fn otp(token: &str, login_url: &str) -> OtpRecord<'_> {
        OtpRecord {
            token,
            expires_at: 1_700_000_900,
            login_url,
        }
    }

    #[tokio::test]
    async fn file_sink_appends_one_json_line_per_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otp.jsonl");
        let cfg = DispatchConfig::File(FileSinkConfig { path: path.clone() });

        dispatch(&cfg, "a@x.com", &otp("tok-a", "https://gw/_auth/verify?t=tok-a"), &email())
            .await
            .unwrap();
        dispatch(&cfg, "b@x.com", &otp("tok-b", "https://gw/_auth/verify?t=tok-b"), &email())
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["email"], "a@x.com");
        assert_eq!(first["token"], "tok-a");
        assert_eq!(first["login_url"], "https://gw/_auth/verify?t=tok-a");
        assert_eq!(first["expires_at"], 1_700_000_900);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_sink_creates_file_with_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otp.jsonl");
        let cfg = DispatchConfig::File(FileSinkConfig { path: path.clone() });
        dispatch(&cfg, "a@x.com", &otp("tok-a", "https://gw/_auth/verify?t=tok-a"), &email())
            .await
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
