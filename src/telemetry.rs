//! Counters and the failure ledger behind a single observer seam.

use crate::error::Error;
use crate::health::FailureLedger;
use crate::smtp_client::{DeliveryOutcome, FailureKind};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::fmt;

/// Receives the events the delivery pipeline reports.
///
/// Implementations must be cheap and thread-safe: they are called from
/// concurrent HTTP requests and from the queue consumer.
pub trait Observer: Send + Sync {
    /// A request to `/incoming` carried a missing or wrong credential.
    fn auth_rejected(&self);
    /// A delivery attempt finished, successfully or not.
    fn delivery(&self, outcome: &DeliveryOutcome);
    /// A referenced object no longer exists and was skipped.
    fn already_handled(&self);
    /// A queue record was forwarded to the dead-letter queue.
    fn dead_lettered(&self);
    /// A queue record carried no object references.
    fn malformed_event(&self, reason: &str);
    /// A poll cycle failed while talking to the broker or the store.
    fn loop_error(&self, reason: &str);
    /// A poll cycle finished without any loop-level error.
    fn poll_succeeded(&self);
}

/// Prometheus counters plus the [`FailureLedger`].
pub struct Telemetry {
    registry: Registry,
    auth_failures: IntCounter,
    deliveries: IntCounterVec,
    already_handled: IntCounter,
    dead_lettered: IntCounter,
    malformed_events: IntCounter,
    queue_errors: IntCounter,
    ledger: FailureLedger,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(failure_threshold: usize) -> Result<Self, Error> {
        let registry = Registry::new();

        let auth_failures = IntCounter::new(
            "mailbridge_auth_failures_total",
            "Requests to /incoming rejected for a bad credential",
        )?;
        let deliveries = IntCounterVec::new(
            Opts::new(
                "mailbridge_deliveries_total",
                "Delivery attempts by outcome",
            ),
            &["outcome"],
        )?;
        let already_handled = IntCounter::new(
            "mailbridge_objects_already_handled_total",
            "Referenced objects that no longer existed",
        )?;
        let dead_lettered = IntCounter::new(
            "mailbridge_dead_lettered_total",
            "Queue records forwarded to the dead-letter queue",
        )?;
        let malformed_events = IntCounter::new(
            "mailbridge_malformed_events_total",
            "Queue records without object references",
        )?;
        let queue_errors = IntCounter::new(
            "mailbridge_queue_errors_total",
            "Poll cycles that failed talking to the broker or object store",
        )?;

        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(already_handled.clone()))?;
        registry.register(Box::new(dead_lettered.clone()))?;
        registry.register(Box::new(malformed_events.clone()))?;
        registry.register(Box::new(queue_errors.clone()))?;

        Ok(Self {
            registry,
            auth_failures,
            deliveries,
            already_handled,
            dead_lettered,
            malformed_events,
            queue_errors,
            ledger: FailureLedger::new(failure_threshold),
        })
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Renders all counters in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, Error> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

impl Observer for Telemetry {
    fn auth_rejected(&self) {
        self.auth_failures.inc();
    }

    fn delivery(&self, outcome: &DeliveryOutcome) {
        let label = match outcome.failure_kind() {
            None => "delivered",
            Some(FailureKind::Transient) => "transient",
            Some(FailureKind::Permanent) => "permanent",
        };
        self.deliveries.with_label_values(&[label]).inc();
    }

    fn already_handled(&self) {
        self.already_handled.inc();
    }

    fn dead_lettered(&self) {
        self.dead_lettered.inc();
    }

    fn malformed_event(&self, reason: &str) {
        self.malformed_events.inc();
        self.ledger.record(format!("malformed event: {reason}"));
    }

    fn loop_error(&self, reason: &str) {
        self.queue_errors.inc();
        self.ledger.record(reason);
    }

    fn poll_succeeded(&self) {
        self.ledger.clear();
    }
}

#[cfg(test)]
pub mod fake {
    //! Recording [`Observer`] for tests.

    use super::Observer;
    use crate::smtp_client::DeliveryOutcome;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        AuthRejected,
        Delivery(DeliveryOutcome),
        AlreadyHandled,
        DeadLettered,
        MalformedEvent,
        LoopError(String),
        PollSucceeded,
    }

    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
            self.events().iter().filter(|event| predicate(event)).count()
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Observer for RecordingObserver {
        fn auth_rejected(&self) {
            self.push(Event::AuthRejected);
        }
        fn delivery(&self, outcome: &DeliveryOutcome) {
            self.push(Event::Delivery(outcome.clone()));
        }
        fn already_handled(&self) {
            self.push(Event::AlreadyHandled);
        }
        fn dead_lettered(&self) {
            self.push(Event::DeadLettered);
        }
        fn malformed_event(&self, _reason: &str) {
            self.push(Event::MalformedEvent);
        }
        fn loop_error(&self, reason: &str) {
            self.push(Event::LoopError(reason.to_string()));
        }
        fn poll_succeeded(&self) {
            self.push(Event::PollSucceeded);
        }
    }
}
