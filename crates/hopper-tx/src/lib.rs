//! # Hopper Transform - Per-Record Processing Stages
//!
//! This crate provides the record-level stages of the hopper pipeline: the
//! pre-filter fan-out that tags each raw record with its destination
//! storages, and the transform stage that decodes the payload once, invokes
//! every destination's processor, and encodes the resulting rows to wire
//! bytes.
//!
//! The transform runs either inline on the consumer thread or on a bounded
//! worker pool ([`pool::PoolTransformStep`]); both feed the downstream
//! batcher in broker order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use hopper_core::{
    BrokerMessage, BytesInsertBatch, Context, MultiStoragePayload, PipelineError, PipelineStep,
    ProcessedMessage, ProcessorOutput, RawMessage, RecordMetadata, RecordProducer, StorageKey,
    StorageOutput, StorageRegistry, StorageSpec,
};
use metrics::{counter, histogram};
use tracing::warn;

use crate::encoder::{JsonRowEncoder, ValuesRowEncoder};

pub mod encoder;
pub mod pool;

/// Compute the subset of storages whose pre-filter accepted the record.
///
/// Filters only see raw bytes and headers; the payload is not decoded here.
pub fn find_destination_storages(
    storages: &[Arc<StorageSpec>],
    raw: &RawMessage,
) -> Vec<StorageKey> {
    storages
        .iter()
        .filter(|storage| match storage.pre_filter() {
            Some(filter) => !filter.should_drop(raw),
            None => true,
        })
        .map(|storage| storage.key.clone())
        .collect()
}

/// First pipeline stage: annotates each raw record with the destination
/// storages that accepted it.
///
/// Records rejected by every pre-filter are forwarded with an empty
/// destination set rather than dropped, so their offsets still advance
/// commit progress downstream.
pub struct FanoutStep<N> {
    storages: Vec<Arc<StorageSpec>>,
    next: N,
}

impl<N: PipelineStep<MultiStoragePayload>> FanoutStep<N> {
    pub fn new(storages: Vec<Arc<StorageSpec>>, next: N) -> Self {
        FanoutStep { storages, next }
    }
}

impl<N: PipelineStep<MultiStoragePayload>> PipelineStep<RawMessage> for FanoutStep<N> {
    fn submit(&mut self, message: BrokerMessage<RawMessage>) -> Result<(), PipelineError> {
        let BrokerMessage { metadata, payload } = message;
        let storage_keys = find_destination_storages(&self.storages, &payload);
        let dropped = self.storages.len() - storage_keys.len();
        if dropped > 0 {
            counter!("prefilter_dropped", dropped as u64);
        }
        self.next.submit(BrokerMessage::new(
            metadata,
            MultiStoragePayload {
                storage_keys,
                raw: payload,
            },
        ))
    }

    fn poll(&mut self) -> Result<(), PipelineError> {
        self.next.poll()
    }

    fn close(&mut self) {
        self.next.close();
    }

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        self.next.join(timeout)
    }
}

/// Result of transforming one record.
#[derive(Debug)]
pub enum TransformOutput {
    /// One tuple per destination storage, in fan-out order.
    Processed(ProcessedMessage),
    /// The record could not be decoded or processed; the raw bytes travel
    /// back so the enclosing stage can route them to the dead-letter sink.
    Invalid { raw: RawMessage, error: String },
}

/// Decode the payload once and run it through every destination storage's
/// processor, encoding rows to the storage's wire format.
///
/// Deterministic with respect to the payload and metadata; safe to run on
/// any worker thread.
pub fn process_multistorage(
    registry: &StorageRegistry,
    context: &Context,
    topic: &str,
    metadata: &RecordMetadata,
    payload: MultiStoragePayload,
) -> TransformOutput {
    if payload.storage_keys.is_empty() {
        // Nothing to decode; the empty result still advances offsets.
        return TransformOutput::Processed(Vec::new());
    }

    let MultiStoragePayload { storage_keys, raw } = payload;

    let decoded: serde_json::Value = match serde_json::from_slice(&raw.value) {
        Ok(value) => value,
        Err(err) => {
            return TransformOutput::Invalid {
                raw,
                error: format!("payload decode failed: {err}"),
            }
        }
    };

    maybe_validate(context, topic, &decoded);

    let mut results: ProcessedMessage = Vec::with_capacity(storage_keys.len());
    for storage_key in storage_keys {
        let Some(spec) = registry.get(&storage_key) else {
            warn!(storage = %storage_key, "record fanned out to an unregistered storage");
            results.push((storage_key, None));
            continue;
        };

        let output = match spec.processor().process_message(&decoded, metadata) {
            Ok(output) => output,
            Err(err) => {
                return TransformOutput::Invalid {
                    raw,
                    error: format!("processor failed for storage {storage_key}: {err}"),
                }
            }
        };

        let encoded = match output {
            None => None,
            Some(ProcessorOutput::Insert(batch)) => {
                let encoder = JsonRowEncoder;
                match batch
                    .rows
                    .iter()
                    .map(|row| encoder.encode(row))
                    .collect::<Result<Vec<_>>>()
                {
                    Ok(rows) => Some(StorageOutput::Rows(BytesInsertBatch {
                        rows,
                        origin_timestamp: batch.origin_timestamp,
                    })),
                    Err(err) => {
                        return TransformOutput::Invalid {
                            raw,
                            error: format!("row encoding failed for storage {storage_key}: {err}"),
                        }
                    }
                }
            }
            Some(ProcessorOutput::AggregateInsert(batch)) => {
                let encoder = ValuesRowEncoder::new(&spec.writable_columns);
                match batch
                    .rows
                    .iter()
                    .map(|row| encoder.encode(row))
                    .collect::<Result<Vec<_>>>()
                {
                    Ok(rows) => Some(StorageOutput::Rows(BytesInsertBatch {
                        rows,
                        origin_timestamp: batch.origin_timestamp,
                    })),
                    Err(err) => {
                        return TransformOutput::Invalid {
                            raw,
                            error: format!("row encoding failed for storage {storage_key}: {err}"),
                        }
                    }
                }
            }
            Some(ProcessorOutput::Replacement(batch)) => {
                Some(StorageOutput::Replacements(batch))
            }
        };

        results.push((storage_key, encoded));
    }

    TransformOutput::Processed(results)
}

// Sampled schema validation. Failures are reported, never dropped.
fn maybe_validate(context: &Context, topic: &str, decoded: &serde_json::Value) {
    let sample_rate = context.validate_sample_rate(topic);
    if sample_rate <= 0.0 || rand::random::<f64>() >= sample_rate {
        return;
    }
    let Some(validator) = &context.validator else {
        return;
    };

    let start = Instant::now();
    if let Err(err) = validator.validate(decoded) {
        counter!("schema_validation_failures", 1, "topic" => topic.to_string());
        if rand::random::<f64>() < context.log_validate_sample_rate(topic) {
            warn!(topic, error = %err, "decoded payload failed schema validation");
        }
    }
    histogram!(
        "codec_decode_and_validate",
        start.elapsed().as_secs_f64() * 1000.0,
        "topic" => topic.to_string()
    );
}

/// Hands refused records to the dead-letter topic, carrying their original
/// broker position in headers.
pub struct DlqProducer {
    producer: Arc<dyn RecordProducer>,
    topic: String,
}

impl DlqProducer {
    pub fn new(producer: Arc<dyn RecordProducer>, topic: impl Into<String>) -> Self {
        DlqProducer {
            producer,
            topic: topic.into(),
        }
    }

    pub fn produce(&self, raw: &RawMessage) -> Result<()> {
        let mut headers = raw.headers.clone();
        headers.push((
            "original_partition".to_string(),
            raw.metadata.partition.to_string().into_bytes(),
        ));
        headers.push((
            "original_offset".to_string(),
            raw.metadata.offset.to_string().into_bytes(),
        ));
        self.producer
            .produce(&self.topic, raw.key.as_deref(), &raw.value, &headers)
    }

    /// The underlying producer handle, for flushing before offsets commit.
    pub fn handle(&self) -> Arc<dyn RecordProducer> {
        self.producer.clone()
    }
}

/// Shared handling of a transform result: forward processed fan-outs, route
/// invalid records to the dead-letter sink when enabled, and always push an
/// offset-bearing message downstream.
pub(crate) fn forward_output<N: PipelineStep<ProcessedMessage>>(
    context: &Context,
    topic: &str,
    dlq: Option<&DlqProducer>,
    next: &mut N,
    metadata: RecordMetadata,
    output: TransformOutput,
) -> Result<(), PipelineError> {
    match output {
        TransformOutput::Processed(processed) => {
            next.submit(BrokerMessage::new(metadata, processed))
        }
        TransformOutput::Invalid { raw, error } => {
            counter!("invalid_messages", 1, "topic" => topic.to_string());
            warn!(
                partition = metadata.partition,
                offset = metadata.offset,
                %error,
                "invalid message"
            );
            if context.dlq_enabled(topic) {
                match dlq {
                    Some(sink) => {
                        sink.produce(&raw).map_err(PipelineError::Fatal)?;
                        counter!("dlq_produced", 1, "topic" => topic.to_string());
                    }
                    None => warn!(
                        topic,
                        "dead-letter routing enabled but no dead-letter topic configured"
                    ),
                }
            }
            // The empty fan-out still advances this record's offset.
            next.submit(BrokerMessage::new(metadata, Vec::new()))
        }
    }
}

/// Inline transform: decode and process on the consumer thread.
pub struct TransformStep<N> {
    registry: Arc<StorageRegistry>,
    context: Context,
    topic: String,
    dlq: Option<DlqProducer>,
    next: N,
}

impl<N: PipelineStep<ProcessedMessage>> TransformStep<N> {
    pub fn new(
        registry: Arc<StorageRegistry>,
        context: Context,
        topic: impl Into<String>,
        dlq: Option<DlqProducer>,
        next: N,
    ) -> Self {
        TransformStep {
            registry,
            context,
            topic: topic.into(),
            dlq,
            next,
        }
    }
}

impl<N: PipelineStep<ProcessedMessage>> PipelineStep<MultiStoragePayload> for TransformStep<N> {
    fn submit(&mut self, message: BrokerMessage<MultiStoragePayload>) -> Result<(), PipelineError> {
        let BrokerMessage { metadata, payload } = message;
        let output =
            process_multistorage(&self.registry, &self.context, &self.topic, &metadata, payload);
        forward_output(
            &self.context,
            &self.topic,
            self.dlq.as_ref(),
            &mut self.next,
            metadata,
            output,
        )
    }

    fn poll(&mut self) -> Result<(), PipelineError> {
        self.next.poll()
    }

    fn close(&mut self) {
        self.next.close();
    }

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        self.next.join(timeout)
    }
}

/// The transform stage in either of its two execution modes.
pub enum Transform<N: PipelineStep<ProcessedMessage>> {
    Inline(TransformStep<N>),
    Pool(pool::PoolTransformStep<N>),
}

impl<N: PipelineStep<ProcessedMessage>> PipelineStep<MultiStoragePayload> for Transform<N> {
    fn submit(&mut self, message: BrokerMessage<MultiStoragePayload>) -> Result<(), PipelineError> {
        match self {
            Transform::Inline(step) => step.submit(message),
            Transform::Pool(step) => step.submit(message),
        }
    }

    fn poll(&mut self) -> Result<(), PipelineError> {
        match self {
            Transform::Inline(step) => step.poll(),
            Transform::Pool(step) => step.poll(),
        }
    }

    fn close(&mut self) {
        match self {
            Transform::Inline(step) => step.close(),
            Transform::Pool(step) => step.close(),
        }
    }

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        match self {
            Transform::Inline(step) => step.join(timeout),
            Transform::Pool(step) => step.join(timeout),
        }
    }
}
