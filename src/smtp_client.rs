//! Delivery to the downstream SMTP relay.

use crate::error::Error;
use crate::message::Envelope;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::response::Code;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::fmt;

/// Whether retrying a failed delivery can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retrying later may succeed.
    Transient,
    /// The relay rejected the message; it must not be resent unmodified.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Result of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The relay accepted the message for these recipients.
    Delivered(Vec<String>),
    Failed { kind: FailureKind, reason: String },
}

impl DeliveryOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Failed {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    /// Returns the failure kind, or `None` for a successful delivery.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DeliveryOutcome::Delivered(_) => None,
            DeliveryOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Classifies a failed delivery by the status code the relay reported.
///
/// Only a `5xx` reply is permanent. A `4xx` reply or a failure without any
/// reply (connection refused, timeout, protocol error) is transient.
pub fn classify(status: Option<u16>) -> FailureKind {
    match status {
        Some(500..=599) => FailureKind::Permanent,
        _ => FailureKind::Transient,
    }
}

/// Three-digit reply code, e.g. `550`.
fn status_code(code: Code) -> u16 {
    code.severity as u16 * 100 + code.category as u16 * 10 + code.detail as u16
}

/// Something that can hand an envelope to a mail relay.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Sends the envelope and reports the classified outcome.
    async fn send(&self, envelope: &Envelope) -> DeliveryOutcome;
}

/// Connection settings of the downstream relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    /// Upgrade to TLS with STARTTLS when the relay offers it.
    pub starttls: bool,
}

/// [`Relay`] backed by a lettre SMTP transport.
pub struct SmtpRelay {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    settings: RelaySettings,
}

impl fmt::Debug for SmtpRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpRelay")
            .field("host", &self.settings.host)
            .field("port", &self.settings.port)
            .field("starttls", &self.settings.starttls)
            .finish_non_exhaustive()
    }
}

impl SmtpRelay {
    pub fn new(settings: RelaySettings) -> Result<Self, Error> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
            .port(settings.port);

        if settings.starttls {
            let parameters = TlsParameters::new(settings.host.clone())?;
            builder = builder.tls(Tls::Opportunistic(parameters));
        }
        if let Some((username, password)) = &settings.credentials {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            settings,
        })
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn send(&self, envelope: &Envelope) -> DeliveryOutcome {
        let mail_from = match envelope.mail_from.parse() {
            Ok(addr) => addr,
            Err(e) => return DeliveryOutcome::transient(format!("Invalid from address: {e}")),
        };
        let rcpt_to = match envelope
            .rcpt_to
            .iter()
            .map(|addr| addr.parse())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(addrs) => addrs,
            Err(e) => return DeliveryOutcome::transient(format!("Invalid to address: {e}")),
        };
        let envelope_data = match lettre::address::Envelope::new(Some(mail_from), rcpt_to) {
            Ok(data) => data,
            Err(e) => return DeliveryOutcome::transient(format!("Failed to create envelope: {e}")),
        };

        log::debug!(
            "Relaying mail to {}:{} for {:?}",
            self.settings.host,
            self.settings.port,
            envelope.rcpt_to
        );

        match self.mailer.send_raw(&envelope_data, &envelope.data).await {
            Ok(response) => {
                log::info!(
                    "Relay accepted mail for {:?}: {}",
                    envelope.rcpt_to,
                    response.code()
                );
                DeliveryOutcome::Delivered(envelope.rcpt_to.clone())
            }
            Err(e) => {
                let kind = classify(e.status().map(status_code));
                log::warn!("Relay delivery failed ({kind}): {e}");
                DeliveryOutcome::Failed {
                    kind,
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_relay::{Replies, StubRelay};
    use lettre::transport::smtp::response::{Category, Detail, Severity};
    use rstest::*;
    use testresult::TestResult;

    fn settings(port: u16) -> RelaySettings {
        RelaySettings {
            host: "127.0.0.1".to_string(),
            port,
            credentials: None,
            starttls: false,
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            mail_from: "forwarder@relay.example".to_string(),
            rcpt_to: vec!["a@x.com".to_string(), "b@x.com".to_string()],
            original_from: None,
            data: b"From: forwarder@relay.example\r\nTo: a@x.com\r\n\r\nhello\r\n".to_vec(),
        }
    }

    #[rstest]
    #[case(Some(500), FailureKind::Permanent)]
    #[case(Some(550), FailureKind::Permanent)]
    #[case(Some(554), FailureKind::Permanent)]
    #[case(Some(599), FailureKind::Permanent)]
    #[case(Some(421), FailureKind::Transient)]
    #[case(Some(450), FailureKind::Transient)]
    #[case(Some(499), FailureKind::Transient)]
    #[case(Some(600), FailureKind::Transient)]
    #[case(Some(250), FailureKind::Transient)]
    #[case(None, FailureKind::Transient)]
    fn test_classify(#[case] status: Option<u16>, #[case] expected: FailureKind) {
        assert_eq!(classify(status), expected);
    }

    #[rstest]
    #[case(Code::new(Severity::PositiveCompletion, Category::MailSystem, Detail::Zero), 250)]
    #[case(Code::new(Severity::TransientNegativeCompletion, Category::MailSystem, Detail::One), 451)]
    #[case(Code::new(Severity::PermanentNegativeCompletion, Category::MailSystem, Detail::Four), 554)]
    fn test_status_code(#[case] code: Code, #[case] expected: u16) {
        assert_eq!(status_code(code), expected);
    }

    #[tokio::test]
    async fn test_send_delivers_to_relay() -> TestResult {
        let stub = StubRelay::start(Replies::default()).await?;
        let relay = SmtpRelay::new(settings(stub.port))?;

        let outcome = relay.send(&envelope()).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Delivered(vec!["a@x.com".to_string(), "b@x.com".to_string()])
        );

        let received = stub.transactions();
        assert_eq!(received.len(), 1);
        let transaction = received.first().ok_or("no transaction")?;
        assert_eq!(transaction.mail_from, "forwarder@relay.example");
        assert_eq!(transaction.rcpt_to, vec!["a@x.com", "b@x.com"]);
        assert!(
            transaction
                .data
                .windows(5)
                .any(|window| window == b"hello")
        );
        Ok(())
    }

    #[rstest]
    #[case::rejected_recipient("550 5.1.1 No such user", FailureKind::Permanent)]
    #[case::greylisted("451 4.7.1 Try again later", FailureKind::Transient)]
    #[tokio::test]
    async fn test_send_classifies_recipient_rejection(
        #[case] rcpt_reply: &'static str,
        #[case] expected: FailureKind,
    ) -> TestResult {
        let stub = StubRelay::start(Replies {
            rcpt: rcpt_reply,
            ..Replies::default()
        })
        .await?;
        let relay = SmtpRelay::new(settings(stub.port))?;

        let outcome = relay.send(&envelope()).await;
        assert_eq!(outcome.failure_kind(), Some(expected));
        assert!(stub.transactions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_send_classifies_data_rejection_as_permanent() -> TestResult {
        let stub = StubRelay::start(Replies {
            data: "554 5.6.0 Message content rejected",
            ..Replies::default()
        })
        .await?;
        let relay = SmtpRelay::new(settings(stub.port))?;

        let outcome = relay.send(&envelope()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Permanent));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_connection_refused_is_transient() -> TestResult {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let relay = SmtpRelay::new(settings(port))?;

        let outcome = relay.send(&envelope()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Transient));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_invalid_recipient_is_transient() -> TestResult {
        let relay = SmtpRelay::new(settings(25))?;
        let mut envelope = envelope();
        envelope.rcpt_to = vec!["not an address".to_string()];

        let outcome = relay.send(&envelope).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Transient));
        Ok(())
    }
}
