//! SQS and S3 implementations of [`Broker`] and [`ObjectStore`].

use super::event::ObjectRef;
use super::{Broker, ObjectStore, QueueRecord};
use crate::error::Error;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;

/// Loads the shared AWS configuration from the environment.
///
/// `region` overrides whatever region the environment provides.
pub async fn load_sdk_config(region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    loader.load().await
}

/// [`Broker`] backed by an SQS queue.
#[derive(Debug, Clone)]
pub struct SqsBroker {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    dead_letter_queue_url: Option<String>,
    wait_time_seconds: i32,
}

impl SqsBroker {
    pub fn new(
        sdk_config: &SdkConfig,
        queue_url: String,
        dead_letter_queue_url: Option<String>,
        wait_time_seconds: i32,
    ) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url,
            dead_letter_queue_url,
            wait_time_seconds,
        }
    }
}

#[async_trait]
impl Broker for SqsBroker {
    async fn receive(&self) -> Result<Option<QueueRecord>, Error> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| Error::Queue(format!("receive: {}", DisplayErrorContext(&e))))?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let receipt = message
            .receipt_handle()
            .ok_or_else(|| Error::Queue("received message without receipt handle".to_string()))?;
        let receive_count = message
            .attributes()
            .and_then(|attributes| {
                attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
            })
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);

        Ok(Some(QueueRecord {
            receipt: receipt.to_string(),
            receive_count,
            body: message.body().unwrap_or_default().to_string(),
        }))
    }

    async fn acknowledge(&self, record: &QueueRecord) -> Result<(), Error> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&record.receipt)
            .send()
            .await
            .map_err(|e| Error::Queue(format!("delete: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    fn has_dead_letter_queue(&self) -> bool {
        self.dead_letter_queue_url.is_some()
    }

    async fn dead_letter(&self, body: &str) -> Result<(), Error> {
        let Some(url) = &self.dead_letter_queue_url else {
            return Err(Error::MissingSetting("dead_letter_queue_url"));
        };
        self.client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| Error::Queue(format!("send to dead-letter queue: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }
}

/// [`ObjectStore`] backed by S3.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn fetch(&self, object: &ObjectRef) -> Result<Option<Vec<u8>>, Error> {
        let result = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e)
                if e.as_service_error().is_some_and(|e| e.is_no_such_key())
                    || e.raw_response()
                        .is_some_and(|response| response.status().as_u16() == 404) =>
            {
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Store(format!(
                    "get {object}: {}",
                    DisplayErrorContext(&e)
                )));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Store(format!("read {object}: {e}")))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn remove(&self, object: &ObjectRef) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| Error::Store(format!("delete {object}: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }
}
