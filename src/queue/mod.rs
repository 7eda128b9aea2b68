//! Queue consumption: storage notifications in, relayed mail out.
//!
//! Each poll cycle receives at most one record, delivers every object it
//! references and then decides whether the record is acknowledged, left for
//! redelivery or moved to the dead-letter queue. Nothing is kept between
//! cycles; the broker and the object store hold all durable state.

pub mod aws;
pub mod event;

use crate::delivery::Dispatcher;
use crate::error::Error;
use crate::smtp_client::{DeliveryOutcome, FailureKind};
use crate::telemetry::Observer;
use async_trait::async_trait;
use event::ObjectRef;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One unit of work pulled from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// Token used to acknowledge the record.
    pub receipt: String,
    /// How often the broker handed this record out, including this time.
    pub receive_count: u32,
    pub body: String,
}

/// Message broker with visibility-timeout based at-least-once delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Long-polls for at most one record.
    async fn receive(&self) -> Result<Option<QueueRecord>, Error>;

    /// Removes the record from the queue.
    async fn acknowledge(&self, record: &QueueRecord) -> Result<(), Error>;

    fn has_dead_letter_queue(&self) -> bool;

    /// Forwards a raw record body to the dead-letter queue.
    async fn dead_letter(&self, body: &str) -> Result<(), Error>;
}

/// Object store holding the raw messages.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the object contents, or `None` if the object does not exist.
    async fn fetch(&self, object: &ObjectRef) -> Result<Option<Vec<u8>>, Error>;

    async fn remove(&self, object: &ObjectRef) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Receive count at which a still failing record is dead-lettered.
    pub max_receive_count: u32,
    /// Pause after a failed poll cycle.
    pub error_backoff: Duration,
}

/// What happened to a received record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every object was handled, or one failed permanently.
    Acknowledged,
    /// Retries are exhausted; the body went to the dead-letter queue.
    DeadLettered,
    /// Left unacknowledged; the broker redelivers it after the visibility timeout.
    Retry,
    /// The record referenced no objects and was discarded.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// The broker had nothing to deliver.
    Idle,
    Handled(Disposition),
}

/// Result of handling a single object reference.
enum ObjectOutcome {
    Delivered,
    AlreadyHandled,
    Failed(FailureKind),
}

/// Long-running consumer of storage notifications.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    dispatcher: Dispatcher,
    observer: Arc<dyn Observer>,
    settings: ConsumerSettings,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("dispatcher", &self.dispatcher)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        dispatcher: Dispatcher,
        observer: Arc<dyn Observer>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            store,
            dispatcher,
            observer,
            settings,
        }
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// A failed cycle is recorded with the observer and followed by a pause of
    /// `error_backoff`; the loop itself never gives up.
    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!("Queue consumer started");

        loop {
            let cycle = tokio::select! {
                _ = shutdown.cancelled() => break,
                cycle = self.poll_once() => cycle,
            };

            match cycle {
                // The malformed record was already counted as a failure.
                Ok(Cycle::Handled(Disposition::Malformed)) => {}
                Ok(_) => self.observer.poll_succeeded(),
                Err(e) => {
                    log::error!(
                        "Queue poll failed, retrying in {:?}: {}",
                        self.settings.error_backoff,
                        e
                    );
                    self.observer.loop_error(&e.to_string());
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }

        log::info!("Queue consumer stopped");
    }

    /// Runs a single poll cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker or the object store can't be reached, or
    /// if the record body is not a JSON notification. The record, if any,
    /// stays unacknowledged and is redelivered later.
    pub async fn poll_once(&self) -> Result<Cycle, Error> {
        let Some(record) = self.broker.receive().await? else {
            return Ok(Cycle::Idle);
        };
        log::debug!(
            "Received queue record (receive count {})",
            record.receive_count
        );
        self.handle_record(&record).await.map(Cycle::Handled)
    }

    async fn handle_record(&self, record: &QueueRecord) -> Result<Disposition, Error> {
        // An undecodable body is a loop-level fault; the record stays queued.
        let objects = event::object_refs(&record.body)?;
        if objects.is_empty() {
            return self.discard(record, "no object references").await;
        }

        let mut transient = false;
        let mut permanent = false;
        for object in &objects {
            match self.handle_object(object).await? {
                ObjectOutcome::Delivered | ObjectOutcome::AlreadyHandled => {}
                ObjectOutcome::Failed(FailureKind::Transient) => transient = true,
                ObjectOutcome::Failed(FailureKind::Permanent) => permanent = true,
            }
        }

        if permanent {
            log::error!("Permanent delivery failure, acknowledging record without retry");
            self.broker.acknowledge(record).await?;
            return Ok(Disposition::Acknowledged);
        }
        if !transient {
            self.broker.acknowledge(record).await?;
            return Ok(Disposition::Acknowledged);
        }

        if record.receive_count < self.settings.max_receive_count {
            log::info!(
                "Leaving record for redelivery (attempt {}/{})",
                record.receive_count,
                self.settings.max_receive_count
            );
            return Ok(Disposition::Retry);
        }

        if !self.broker.has_dead_letter_queue() {
            log::warn!(
                "Record exhausted {} attempts but no dead-letter queue is configured",
                record.receive_count
            );
            return Ok(Disposition::Retry);
        }

        self.broker.dead_letter(&record.body).await?;
        self.broker.acknowledge(record).await?;
        self.observer.dead_lettered();
        log::warn!(
            "Record moved to dead-letter queue after {} attempts",
            record.receive_count
        );
        Ok(Disposition::DeadLettered)
    }

    /// Acknowledges a record that carries nothing to deliver.
    async fn discard(&self, record: &QueueRecord, reason: &str) -> Result<Disposition, Error> {
        log::warn!("Discarding malformed queue record: {reason}");
        self.broker.acknowledge(record).await?;
        self.observer.malformed_event(reason);
        Ok(Disposition::Malformed)
    }

    async fn handle_object(&self, object: &ObjectRef) -> Result<ObjectOutcome, Error> {
        // A missing object was removed by an earlier successful cycle; the
        // notification is a redelivery.
        let Some(raw) = self.store.fetch(object).await? else {
            log::info!("{object} no longer exists, treating as already handled");
            self.observer.already_handled();
            return Ok(ObjectOutcome::AlreadyHandled);
        };

        match self.dispatcher.process(&raw).await {
            DeliveryOutcome::Delivered(recipients) => {
                self.store.remove(object).await?;
                log::info!("Delivered {object} to {recipients:?}, object removed");
                Ok(ObjectOutcome::Delivered)
            }
            DeliveryOutcome::Failed { kind, reason } => {
                log::warn!("Delivery of {object} failed ({kind}): {reason}");
                Ok(ObjectOutcome::Failed(kind))
            }
        }
    }
}
