//! Kafka producers for the replacements, commit-log, and dead-letter
//! topics.
//!
//! Delivery callbacks run on the producer's poll thread, so they never
//! raise directly: the first failure is recorded into a flag that `flush`
//! consults, which is where batch joins pick it up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use hopper_core::RecordProducer;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::ClientContext;
use tracing::warn;

/// Overrides for the replacements producer: replacement keys must hash
/// consistently, and replacement payloads can be large.
pub const REPLACEMENTS_PRODUCER_OVERRIDES: &[(&str, &str)] = &[
    ("partitioner", "consistent"),
    ("message.max.bytes", "50000000"),
];

struct DeliveryTracker {
    error: Arc<Mutex<Option<String>>>,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: ()) {
        if let Err((err, _)) = result {
            warn!(error = %err, "message delivery failed");
            if let Ok(mut guard) = self.error.lock() {
                guard.get_or_insert_with(|| err.to_string());
            }
        }
    }
}

/// `RecordProducer` backed by an rdkafka threaded producer.
pub struct KafkaRecordProducer {
    inner: ThreadedProducer<DeliveryTracker>,
    delivery_error: Arc<Mutex<Option<String>>>,
}

impl KafkaRecordProducer {
    pub fn new(brokers: &str, overrides: &[(&str, &str)]) -> Result<Self> {
        let delivery_error = Arc::new(Mutex::new(None));
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", brokers);
        for (key, value) in overrides {
            config.set(*key, *value);
        }
        let inner = config
            .create_with_context(DeliveryTracker {
                error: delivery_error.clone(),
            })
            .context("failed to create kafka producer")?;
        Ok(KafkaRecordProducer {
            inner,
            delivery_error,
        })
    }

    fn take_delivery_error(&self) -> Option<String> {
        self.delivery_error.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl RecordProducer for KafkaRecordProducer {
    fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let owned_headers = if headers.is_empty() {
            None
        } else {
            let mut owned = OwnedHeaders::new();
            for (name, header_value) in headers {
                owned = owned.insert(Header {
                    key: name,
                    value: Some(header_value.as_slice()),
                });
            }
            Some(owned)
        };

        match key {
            Some(key) => {
                let mut record = BaseRecord::to(topic).key(key).payload(value);
                if let Some(owned) = owned_headers {
                    record = record.headers(owned);
                }
                self.inner
                    .send(record)
                    .map_err(|(err, _)| anyhow!("produce to {topic} failed: {err}"))
            }
            None => {
                let mut record: BaseRecord<'_, (), [u8]> = BaseRecord::to(topic).payload(value);
                if let Some(owned) = owned_headers {
                    record = record.headers(owned);
                }
                self.inner
                    .send(record)
                    .map_err(|(err, _)| anyhow!("produce to {topic} failed: {err}"))
            }
        }
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner
            .flush(timeout)
            .context("producer flush timed out")?;
        if let Some(error) = self.take_delivery_error() {
            bail!("message delivery failed: {error}");
        }
        Ok(())
    }
}
