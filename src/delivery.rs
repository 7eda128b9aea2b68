//! Single entry point used by both ingestion paths: normalize, then relay.

use crate::message::{AddressPolicy, normalize};
use crate::smtp_client::{DeliveryOutcome, Relay};
use crate::telemetry::Observer;
use std::fmt;
use std::sync::Arc;

/// Normalizes raw messages and hands them to the relay.
#[derive(Clone)]
pub struct Dispatcher {
    relay: Arc<dyn Relay>,
    policy: AddressPolicy,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(relay: Arc<dyn Relay>, policy: AddressPolicy, observer: Arc<dyn Observer>) -> Self {
        Self {
            relay,
            policy,
            observer,
        }
    }

    /// Delivers one raw message.
    ///
    /// A message that can't be normalized is reported as a transient failure,
    /// so the queue path retries it instead of dropping it.
    pub async fn process(&self, raw: &[u8]) -> DeliveryOutcome {
        let outcome = match normalize(raw, &self.policy) {
            Ok(envelope) => {
                log::info!(
                    "Relaying mail from {} to {:?}",
                    envelope
                        .original_from
                        .as_ref()
                        .map_or("<unknown>", |sender| sender.addr.as_str()),
                    envelope.rcpt_to
                );
                self.relay.send(&envelope).await
            }
            Err(e) => {
                log::warn!("Failed to normalize message: {e}");
                DeliveryOutcome::transient(e.to_string())
            }
        };

        self.observer.delivery(&outcome);
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRelay;
    use super::*;
    use crate::smtp_client::FailureKind;
    use crate::telemetry::fake::{Event, RecordingObserver};
    use rstest::*;
    use testresult::TestResult;

    fn policy() -> AddressPolicy {
        AddressPolicy {
            forwarder_address: "forwarder@relay.example".to_string(),
            fallback_recipient: "postmaster@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_process_relays_normalized_envelope() -> TestResult {
        let relay = Arc::new(FakeRelay::accepting());
        let observer = Arc::new(RecordingObserver::default());
        let dispatcher = Dispatcher::new(relay.clone(), policy(), observer.clone());

        let raw = std::fs::read("test_data/plain.eml")?;
        let outcome = dispatcher.process(&raw).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered(vec!["a@x.com".to_string()]));
        let sent = relay.sent();
        assert_eq!(sent.len(), 1);
        let envelope = sent.first().ok_or("nothing sent")?;
        assert_eq!(envelope.mail_from, "forwarder@relay.example");
        assert_eq!(envelope.rcpt_to, vec!["a@x.com"]);
        assert_eq!(observer.events(), vec![Event::Delivery(outcome)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unparseable_message_is_transient_without_relaying() {
        let relay = Arc::new(FakeRelay::accepting());
        let observer = Arc::new(RecordingObserver::default());
        let dispatcher = Dispatcher::new(relay.clone(), policy(), observer.clone());

        let outcome = dispatcher.process(b"").await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Transient));
        assert!(relay.sent().is_empty());
    }

    #[rstest]
    #[case(FailureKind::Transient)]
    #[case(FailureKind::Permanent)]
    #[tokio::test]
    async fn test_relay_failure_kind_is_kept(#[case] kind: FailureKind) -> TestResult {
        let relay = Arc::new(FakeRelay::failing(kind));
        let observer = Arc::new(RecordingObserver::default());
        let dispatcher = Dispatcher::new(relay, policy(), observer);

        let raw = std::fs::read("test_data/plain.eml")?;
        assert_eq!(dispatcher.process(&raw).await.failure_kind(), Some(kind));
        Ok(())
    }
}
