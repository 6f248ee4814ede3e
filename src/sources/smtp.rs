//! Outbound SMTP via lettre, used by the `forward` rule action.

use std::collections::BTreeMap;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::config::{Settings, SmtpAccount};
use crate::error::SourceError;
use crate::model::Message;

/// Implicit-TLS submission port; anything else uses STARTTLS when TLS is on.
const SMTPS_PORT: u16 = 465;

/// One configured SMTP account.
#[derive(Clone)]
pub struct SmtpForwarder {
    name: String,
    server: String,
    port: u16,
    username: String,
    password: Option<SecretString>,
    use_tls: bool,
    from_address: String,
}

impl SmtpForwarder {
    pub fn new(name: &str, account: &SmtpAccount) -> Self {
        Self {
            name: name.to_string(),
            server: account.server.clone(),
            port: account.port,
            username: account.username.clone(),
            password: account.password.clone(),
            use_tls: account.use_tls,
            from_address: account
                .from_address
                .clone()
                .unwrap_or_else(|| account.username.clone()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn error(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Forward {
            account: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, SourceError> {
        let password = self
            .password
            .as_ref()
            .ok_or_else(|| self.error("no password loaded"))?;
        let creds = Credentials::new(
            self.username.clone(),
            password.expose_secret().to_string(),
        );

        let builder = if !self.use_tls {
            SmtpTransport::builder_dangerous(&self.server)
        } else if self.port == SMTPS_PORT {
            SmtpTransport::relay(&self.server)
                .map_err(|e| self.error(format!("SMTP relay error: {e}")))?
        } else {
            SmtpTransport::starttls_relay(&self.server)
                .map_err(|e| self.error(format!("SMTP relay error: {e}")))?
        };
        Ok(builder.port(self.port).credentials(creds).build())
    }

    /// Send `message` on to `to` as a plain-text forward. Blocking.
    pub fn forward(&self, message: &Message, to: &str) -> Result<(), SourceError> {
        let email = lettre::Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| self.error(format!("Invalid from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| self.error(format!("Invalid to address: {e}")))?)
            .subject(forward_subject(&message.subject))
            .header(ContentType::TEXT_PLAIN)
            .body(forward_body(message))
            .map_err(|e| self.error(format!("Failed to build email: {e}")))?;

        self.transport()?
            .send(&email)
            .map_err(|e| self.error(format!("SMTP send failed: {e}")))?;

        info!(smtp_account = %self.name, to, message_id = %message.id, "Message forwarded");
        Ok(())
    }

    /// Open a connection and authenticate. Blocking.
    pub fn check(&self) -> Result<(), SourceError> {
        match self.transport()?.test_connection() {
            Ok(true) => Ok(()),
            Ok(false) => Err(SourceError::Unavailable {
                account: self.name.clone(),
                reason: "SMTP server refused connection".into(),
            }),
            Err(e) => Err(SourceError::Unavailable {
                account: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn forward_subject(subject: &str) -> String {
    if subject.to_ascii_lowercase().starts_with("fwd:") {
        subject.to_string()
    } else {
        format!("Fwd: {subject}")
    }
}

fn forward_body(message: &Message) -> String {
    let mut body = String::from("---------- Forwarded message ---------\n");
    body.push_str(&format!("From: {}\n", message.sender));
    body.push_str(&format!("Date: {}\n", message.timestamp.to_rfc2822()));
    body.push_str(&format!("Subject: {}\n", message.subject));
    if !message.recipients.is_empty() {
        body.push_str(&format!("To: {}\n", message.recipients.join(", ")));
    }
    body.push('\n');
    body.push_str(&message.body.to_text());
    body
}

/// All configured SMTP accounts, shared by every source.
#[derive(Clone, Default)]
pub struct Forwarders {
    accounts: BTreeMap<String, SmtpForwarder>,
}

impl Forwarders {
    pub fn from_settings(settings: &Settings) -> Self {
        let accounts = settings
            .smtp_accounts
            .iter()
            .map(|(name, account)| (name.clone(), SmtpForwarder::new(name, account)))
            .collect();
        Self { accounts }
    }

    pub fn get(&self, name: &str) -> Option<&SmtpForwarder> {
        self.accounts.get(name)
    }

    /// The named account, or the first configured one.
    pub fn select(&self, name: Option<&str>) -> Option<&SmtpForwarder> {
        match name {
            Some(n) => self.accounts.get(n),
            None => self.accounts.values().next(),
        }
    }

    /// Forward on a blocking thread.
    pub async fn forward(
        &self,
        source_account: &str,
        message: &Message,
        to: &str,
        smtp_account: Option<&str>,
    ) -> Result<(), SourceError> {
        let forwarder = self
            .select(smtp_account)
            .cloned()
            .ok_or_else(|| SourceError::Unsupported {
                account: source_account.to_string(),
                action: "forward (no smtp account configured)".into(),
            })?;
        let message = message.clone();
        let to = to.to_string();
        tokio::task::spawn_blocking(move || forwarder.forward(&message, &to))
            .await
            .map_err(|e| SourceError::Forward {
                account: source_account.to_string(),
                reason: format!("forward task panicked: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::model::MessageBody;

    fn message() -> Message {
        Message {
            id: "m1".into(),
            account: "work".into(),
            folder: "INBOX".into(),
            source_ref: "1".into(),
            message_id_header: None,
            sender: "client@acme.com".into(),
            recipients: vec!["me@example.com".into()],
            cc: vec![],
            subject: "Quarterly numbers".into(),
            timestamp: Utc::now(),
            body: MessageBody::plain("See attached."),
            headers: BTreeMap::new(),
            attachments: vec![],
        }
    }

    #[test]
    fn subject_is_prefixed_once() {
        assert_eq!(forward_subject("Hello"), "Fwd: Hello");
        assert_eq!(forward_subject("FWD: Hello"), "FWD: Hello");
    }

    #[test]
    fn body_carries_original_headers() {
        let body = forward_body(&message());
        assert!(body.starts_with("---------- Forwarded message"));
        assert!(body.contains("From: client@acme.com"));
        assert!(body.contains("Subject: Quarterly numbers"));
        assert!(body.ends_with("See attached."));
    }

    #[tokio::test]
    async fn forward_without_smtp_is_unsupported() {
        let forwarders = Forwarders::default();
        let err = forwarders
            .forward("work", &message(), "x@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
    }

    #[test]
    fn missing_password_fails_before_connecting() {
        let account: SmtpAccount = serde_yaml::from_str(
            "server: smtp.example.com\nusername: me@example.com\npassword_file: /nonexistent\n",
        )
        .unwrap();
        let forwarder = SmtpForwarder::new("out", &account);
        assert!(matches!(
            forwarder.forward(&message(), "x@example.com"),
            Err(SourceError::Forward { .. })
        ));
    }
}
