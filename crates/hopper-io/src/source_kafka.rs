//! Kafka-facing side of the consumer: frame conversion, the processing
//! strategy factory, and the poll/commit run loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{TimeZone, Utc};
use hopper_core::{
    BrokerMessage, ConsumerSpec, Context, PipelineStep, RawMessage, RecordMetadata,
    RecordProducer, StorageRegistry,
};
use hopper_tx::pool::{PoolConfig, PoolTransformStep};
use hopper_tx::{DlqProducer, FanoutStep, Transform, TransformStep};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collect::{
    CommitLogConfig, InsertBatchWriter, MultistorageCollector, ReplacementBatchWriter,
};
use crate::producer::{KafkaRecordProducer, REPLACEMENTS_PRODUCER_OVERRIDES};
use crate::reduce::{CollectorFactory, CommitFn, Reduce};
use crate::sink_clickhouse::ClickhouseHttpWriter;

/// The fully composed processing strategy for one consumer.
pub type Strategy = FanoutStep<Transform<Reduce>>;

/// Convert a consumed frame into the pipeline's raw message type.
pub fn raw_message_from(message: &BorrowedMessage<'_>) -> BrokerMessage<RawMessage> {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    let metadata = RecordMetadata {
        partition: message.partition().max(0) as u32,
        offset: message.offset().max(0) as u64,
        timestamp,
    };
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(|value| value.to_vec()).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    let raw = RawMessage {
        metadata: metadata.clone(),
        key: message.key().map(|key| key.to_vec()),
        value: message
            .payload()
            .map(|payload| payload.to_vec())
            .unwrap_or_default(),
        headers,
    };
    BrokerMessage::new(metadata, raw)
}

/// Builds consumers and their processing strategies from a validated spec.
pub struct ConsumerFactory {
    spec: ConsumerSpec,
    registry: Arc<StorageRegistry>,
    context: Context,
}

impl ConsumerFactory {
    pub fn new(
        spec: ConsumerSpec,
        registry: Arc<StorageRegistry>,
        context: Context,
    ) -> Result<Self> {
        spec.validate()?;
        Ok(ConsumerFactory {
            spec,
            registry,
            context,
        })
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn build_consumer(&self) -> Result<BaseConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.spec.kafka.brokers)
            .set("group.id", &self.spec.kafka.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .context("failed to create kafka consumer")
    }

    /// Compose fan-out -> transform -> batcher for this consumer.
    ///
    /// Producers are created once and shared across batches; collectors and
    /// their insert writers are built fresh per batch by the factory
    /// closure handed to the batcher.
    pub fn build_strategy(&self, consumer: Arc<BaseConsumer>) -> Result<Strategy> {
        let spec = &self.spec;
        let names: Vec<String> = spec.storages.iter().map(|s| s.name.clone()).collect();
        let storages = self.registry.resolve(&names)?;

        let replacements = match &spec.replacements_topic {
            Some(topic) => {
                let producer: Arc<dyn RecordProducer> = Arc::new(KafkaRecordProducer::new(
                    &spec.kafka.brokers,
                    REPLACEMENTS_PRODUCER_OVERRIDES,
                )?);
                Some((producer, topic.clone()))
            }
            None => None,
        };

        let commit_log = match &spec.commit_log {
            Some(commit_log) => Some(CommitLogConfig {
                producer: Arc::new(KafkaRecordProducer::new(&spec.kafka.brokers, &[])?),
                topic: commit_log.topic.clone(),
                group_id: commit_log
                    .group_id
                    .clone()
                    .unwrap_or_else(|| spec.kafka.group_id.clone()),
            }),
            None => None,
        };

        let dlq_handle: Option<Arc<dyn RecordProducer>> = match &spec.dlq_topic {
            Some(_) => Some(Arc::new(KafkaRecordProducer::new(&spec.kafka.brokers, &[])?)),
            None => None,
        };

        let http_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(spec.clickhouse.http_timeout_ms))
            .build()
            .context("failed to build clickhouse http client")?;

        let clickhouse = spec.clickhouse.clone();
        let slice_id = spec.slice_id;
        let factory_storages = storages.clone();
        let factory_replacements = replacements.clone();
        let factory_commit_log = commit_log.clone();
        let factory: CollectorFactory = Box::new(move || {
            let mut inserts = Vec::with_capacity(factory_storages.len());
            let mut replacement_writers = Vec::new();
            let mut ignore_errors = HashSet::new();
            for storage in &factory_storages {
                let writer = ClickhouseHttpWriter::new(
                    http_client.clone(),
                    &clickhouse,
                    storage,
                    slice_id,
                )?;
                inserts.push((
                    storage.key.clone(),
                    InsertBatchWriter::new(storage.key.clone(), Box::new(writer)),
                ));
                if let Some((producer, topic)) = &factory_replacements {
                    replacement_writers.push((
                        storage.key.clone(),
                        ReplacementBatchWriter::new(producer.clone(), topic.clone()),
                    ));
                }
                if storage.ignore_write_errors {
                    ignore_errors.insert(storage.key.clone());
                }
            }
            Ok(MultistorageCollector::new(
                inserts,
                replacement_writers,
                factory_commit_log.clone(),
                ignore_errors,
            ))
        });

        let topic = spec.kafka.topic.clone();
        let commit: CommitFn = Box::new(move |offsets| {
            let mut positions = TopicPartitionList::new();
            for (partition, (offset, _timestamp)) in offsets {
                // Kafka positions name the next offset to consume.
                positions.add_partition_offset(
                    &topic,
                    *partition as i32,
                    Offset::Offset(*offset as i64 + 1),
                )?;
            }
            consumer
                .commit(&positions, CommitMode::Sync)
                .context("offset commit failed")?;
            debug!(partitions = offsets.len(), "offsets committed");
            Ok(())
        });

        let reduce = Reduce::new(
            spec.max_batch_size,
            spec.max_batch_time(),
            factory,
            commit,
            spec.parallel_collect_timeout(),
            dlq_handle.clone(),
        )?;

        let dlq = match (&spec.dlq_topic, dlq_handle) {
            (Some(topic), Some(handle)) => Some(DlqProducer::new(handle, topic.clone())),
            _ => None,
        };

        let transform = match spec.processes {
            None => Transform::Inline(TransformStep::new(
                self.registry.clone(),
                self.context.clone(),
                spec.kafka.topic.clone(),
                dlq,
                reduce,
            )),
            Some(workers) => {
                let input_bound = spec
                    .input_block_size
                    .context("input block size required with processes")?;
                let output_bound = spec
                    .output_block_size
                    .context("output block size required with processes")?;
                Transform::Pool(PoolTransformStep::new(
                    self.registry.clone(),
                    self.context.clone(),
                    spec.kafka.topic.clone(),
                    dlq,
                    PoolConfig {
                        workers,
                        input_bound,
                        output_bound,
                    },
                    reduce,
                )?)
            }
        };

        Ok(FanoutStep::new(storages, transform))
    }
}

/// Drives one consumer: polls the broker, feeds the strategy, and shuts
/// down cleanly on cancellation.
pub struct ConsumerRunner {
    consumer: Arc<BaseConsumer>,
    strategy: Strategy,
    topic: String,
    join_timeout: Duration,
    cancel: CancellationToken,
}

impl ConsumerRunner {
    pub fn new(factory: &ConsumerFactory, cancel: CancellationToken) -> Result<Self> {
        let consumer = Arc::new(factory.build_consumer()?);
        let strategy = factory.build_strategy(consumer.clone())?;
        Ok(ConsumerRunner {
            consumer,
            strategy,
            topic: factory.spec().kafka.topic.clone(),
            join_timeout: factory.spec().parallel_collect_timeout(),
            cancel,
        })
    }

    /// Poll the broker and feed the strategy until cancelled or a fatal
    /// pipeline error. On the way out, in-flight batches are closed and
    /// joined; a batch that fails to join is never committed.
    pub fn run(mut self) -> Result<()> {
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .with_context(|| format!("failed to subscribe to {}", self.topic))?;
        info!(topic = %self.topic, "consumer started");

        let result = loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested");
                break Ok(());
            }
            match self.consumer.poll(Duration::from_millis(100)) {
                None => {}
                Some(Err(err)) => warn!(error = %err, "kafka poll failed"),
                Some(Ok(frame)) => {
                    let message = raw_message_from(&frame);
                    if let Err(err) = self.strategy.submit(message) {
                        break Err(anyhow::Error::from(err));
                    }
                }
            }
            if let Err(err) = self.strategy.poll() {
                break Err(anyhow::Error::from(err));
            }
        };

        info!("flushing in-flight batches");
        self.strategy.close();
        let joined = self
            .strategy
            .join(Some(self.join_timeout))
            .map_err(anyhow::Error::from);
        result.and(joined)
    }
}
