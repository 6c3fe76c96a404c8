//! # Hopper Core - Ingestion Pipeline Types and Contracts
//!
//! This crate provides the foundational types, traits, and configuration for the
//! hopper ingestion pipeline: a batched, at-least-once Kafka consumer that fans
//! every record out to one or more destination storages in an analytic
//! column-store.
//!
//! ## Key Components
//!
//! - **Message Model**: broker frames, storage identities, and the payloads
//!   exchanged between pipeline stages
//! - **Plug-in Contracts**: per-storage processors, pre-filters, validators,
//!   batch writers, and record producers
//! - **Pipeline Contract**: the `submit`/`poll`/`close`/`join` step interface
//!   every stage implements
//! - **Configuration**: YAML-based consumer specification and the mutable
//!   runtime option store
//! - **Error Handling**: structured error types for pipeline operations

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, ensure, Context as _, Result};
use arcstr::ArcStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Interned identifier of a destination storage (a writable table in the
/// column-store). Cheap to clone, stable, comparable, and hashable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(ArcStr);

impl StorageKey {
    pub fn new(name: &str) -> Self {
        StorageKey(ArcStr::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageKey {
    fn from(name: &str) -> Self {
        StorageKey::new(name)
    }
}

/// Position of a record on the broker, captured from the consumed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Partition index within the consumed topic
    pub partition: u32,
    /// Offset of the record within its partition
    pub offset: u64,
    /// Broker-assigned timestamp of the record
    pub timestamp: DateTime<Utc>,
}

/// A raw record as received from the broker. Immutable after receipt.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub metadata: RecordMetadata,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// A payload travelling through the pipeline together with the broker
/// position of the record it came from.
///
/// Every stage re-tags the same broker frame with a new payload type via
/// [`BrokerMessage::replace`]; the metadata is what ultimately drives offset
/// commits, so it is never dropped between stages.
#[derive(Debug, Clone)]
pub struct BrokerMessage<T> {
    pub metadata: RecordMetadata,
    pub payload: T,
}

impl<T> BrokerMessage<T> {
    pub fn new(metadata: RecordMetadata, payload: T) -> Self {
        BrokerMessage { metadata, payload }
    }

    /// Swap the payload while keeping the broker position.
    pub fn replace<U>(self, payload: U) -> BrokerMessage<U> {
        BrokerMessage {
            metadata: self.metadata,
            payload,
        }
    }
}

/// A raw record annotated with the destination storages whose pre-filter
/// accepted it. Produced by the fan-out stage.
#[derive(Debug, Clone)]
pub struct MultiStoragePayload {
    pub storage_keys: Vec<StorageKey>,
    pub raw: RawMessage,
}

/// Rows produced by a processor, not yet encoded to wire bytes.
///
/// `origin_timestamp` is the event's real-world time, used for end-to-end
/// latency accounting when present.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBatch {
    pub rows: Vec<Value>,
    pub origin_timestamp: Option<DateTime<Utc>>,
}

/// Mutation descriptors forwarded to the replacements topic.
///
/// `key` partitions the downstream topic; each value is produced as one
/// JSON-serialized record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementBatch {
    pub key: String,
    pub values: Vec<Value>,
}

/// Everything a processor can hand back for one record.
///
/// The two insert flavors differ only in the row encoder picked downstream:
/// ordinary inserts become newline-terminated JSON objects, aggregate inserts
/// become tab-separated VALUES tuples over the storage's writable columns.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutput {
    Insert(InsertBatch),
    AggregateInsert(InsertBatch),
    Replacement(ReplacementBatch),
}

/// Rows already encoded to wire bytes, ready for the bulk insert body.
#[derive(Debug, Clone, PartialEq)]
pub struct BytesInsertBatch {
    pub rows: Vec<Vec<u8>>,
    pub origin_timestamp: Option<DateTime<Utc>>,
}

/// Per-storage result of transforming one record.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOutput {
    Rows(BytesInsertBatch),
    Replacements(ReplacementBatch),
}

/// The fan-out result for one record: exactly one tuple per storage that
/// accepted the record, `None` where the processor dropped it.
pub type ProcessedMessage = Vec<(StorageKey, Option<StorageOutput>)>;

/// Highest observed offset and its broker timestamp, per partition.
pub type OffsetMap = BTreeMap<u32, (u64, DateTime<Utc>)>;

/// Domain plug-in: turns a decoded record into rows, replacements, or nothing.
///
/// Processors run on the transform worker pool and must be deterministic with
/// respect to the payload and metadata alone.
pub trait MessageProcessor: Send + Sync {
    fn process_message(
        &self,
        value: &Value,
        metadata: &RecordMetadata,
    ) -> Result<Option<ProcessorOutput>>;
}

/// Stateless drop predicate applied on the raw record before decoding.
///
/// Filters must not decode the payload; they only look at bytes and headers.
pub trait PreFilter: Send + Sync {
    fn should_drop(&self, message: &RawMessage) -> bool;
}

/// Schema validator invoked on a sampled fraction of decoded records.
/// Outcomes are reported but never drop a record.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<()>;
}

/// Handle to the column-store's bulk insert interface. One call writes one
/// batch; the call returns only once the store has confirmed the insert.
pub trait BatchWriter: Send {
    fn write(&mut self, rows: &mut dyn Iterator<Item = &[u8]>) -> Result<()>;
}

/// An async record producer (replacements, commit-log, dead-letter).
///
/// `produce` enqueues; delivery errors surface at `flush`, which blocks up to
/// the given timeout. Implementations must be safe for concurrent `produce`.
pub trait RecordProducer: Send + Sync {
    fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> Result<()>;

    fn flush(&self, timeout: Duration) -> Result<()>;
}

/// Default processor: maps a decoded JSON object to a single insert row.
///
/// Lets a configured pipeline run end-to-end before any domain-specific
/// processors are registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

impl MessageProcessor for PassthroughProcessor {
    fn process_message(
        &self,
        value: &Value,
        _metadata: &RecordMetadata,
    ) -> Result<Option<ProcessorOutput>> {
        if !value.is_object() {
            bail!("expected a JSON object payload");
        }
        Ok(Some(ProcessorOutput::Insert(InsertBatch {
            rows: vec![value.clone()],
            origin_timestamp: None,
        })))
    }
}

/// Error types for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A record that could not be decoded or processed, identified by its
    /// broker position so the enclosing stage can route it to the
    /// dead-letter sink.
    #[error("invalid message at partition {partition} offset {offset}")]
    InvalidMessage { partition: u32, offset: u64 },

    /// An internal pipeline channel closed unexpectedly, typically because a
    /// worker thread died.
    #[error("pipeline channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Unrecoverable failure. The consumer must stop without committing the
    /// affected batch; the host restarts it from the last committed offset.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Contract implemented by every pipeline stage, chained by ownership:
/// each stage owns the next and forwards transformed messages into it.
///
/// - `submit` hands one message to the stage; it may block on internal
///   back-pressure (this is how the pipeline pushes back on the broker).
/// - `poll` drives time-based work: draining worker results, rotating a
///   batch whose deadline elapsed, surfacing asynchronous failures.
/// - `close` stops accepting new messages. After `close`, only `poll` and
///   `join` may be called.
/// - `join` waits (bounded by `timeout`) until all in-flight work has been
///   durably completed downstream.
pub trait PipelineStep<T>: Send {
    fn submit(&mut self, message: BrokerMessage<T>) -> Result<(), PipelineError>;

    fn poll(&mut self) -> Result<(), PipelineError>;

    fn close(&mut self);

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipelineError>;
}

/// Wire format of the rows a storage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFormat {
    /// One newline-terminated JSON object per row
    #[default]
    Json,
    /// One tab-separated tuple per row, over the writable-column schema
    Values,
}

/// Everything the pipeline needs to know about one destination storage.
#[derive(Clone)]
pub struct StorageSpec {
    pub key: StorageKey,
    /// Target table in the column-store
    pub table: String,
    /// Column order for the VALUES encoder; empty for JSON-format storages
    pub writable_columns: Vec<String>,
    pub row_format: RowFormat,
    /// When set, insert failures for this storage are reported but do not
    /// fail the batch; other storages and offset progress still commit.
    pub ignore_write_errors: bool,
    processor: Arc<dyn MessageProcessor>,
    pre_filter: Option<Arc<dyn PreFilter>>,
}

impl StorageSpec {
    pub fn new(key: StorageKey, table: impl Into<String>) -> Self {
        StorageSpec {
            key,
            table: table.into(),
            writable_columns: Vec::new(),
            row_format: RowFormat::Json,
            ignore_write_errors: false,
            processor: Arc::new(PassthroughProcessor),
            pre_filter: None,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_pre_filter(mut self, filter: Arc<dyn PreFilter>) -> Self {
        self.pre_filter = Some(filter);
        self
    }

    /// Switch the storage to the VALUES wire format with the given column order.
    pub fn with_values_format(mut self, columns: Vec<String>) -> Self {
        self.row_format = RowFormat::Values;
        self.writable_columns = columns;
        self
    }

    pub fn with_ignore_write_errors(mut self, ignore: bool) -> Self {
        self.ignore_write_errors = ignore;
        self
    }

    pub fn processor(&self) -> &Arc<dyn MessageProcessor> {
        &self.processor
    }

    pub fn pre_filter(&self) -> Option<&Arc<dyn PreFilter>> {
        self.pre_filter.as_ref()
    }
}

impl fmt::Debug for StorageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSpec")
            .field("key", &self.key)
            .field("table", &self.table)
            .field("row_format", &self.row_format)
            .field("ignore_write_errors", &self.ignore_write_errors)
            .finish()
    }
}

/// One-way lookup of storage specs by key.
///
/// Processors and filters are reached through the registry rather than by
/// direct imports, so storage definitions stay decoupled from the pipeline.
#[derive(Debug, Default)]
pub struct StorageRegistry {
    specs: HashMap<StorageKey, Arc<StorageSpec>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        StorageRegistry::default()
    }

    pub fn register(&mut self, spec: StorageSpec) {
        self.specs.insert(spec.key.clone(), Arc::new(spec));
    }

    pub fn get(&self, key: &StorageKey) -> Option<&Arc<StorageSpec>> {
        self.specs.get(key)
    }

    /// Resolve configured storage names, preserving their order.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<StorageSpec>>> {
        names
            .iter()
            .map(|name| {
                self.specs
                    .get(&StorageKey::new(name))
                    .cloned()
                    .with_context(|| format!("unknown storage: {name}"))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Mutable store for options that can change while the consumer runs,
/// such as validation sample rates and dead-letter toggles.
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    values: RwLock<HashMap<String, String>>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        RuntimeConfig {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// Shared state threaded explicitly through the pipeline constructors:
/// the runtime option store and the optional schema validator for the
/// consumed topic. No process-wide singletons.
#[derive(Clone)]
pub struct Context {
    pub runtime: Arc<RuntimeConfig>,
    pub validator: Option<Arc<dyn SchemaValidator>>,
}

impl Context {
    pub fn new(runtime: Arc<RuntimeConfig>) -> Self {
        Context {
            runtime,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Fraction of records whose decoded payload is schema-validated.
    pub fn validate_sample_rate(&self, topic: &str) -> f64 {
        self.runtime
            .get_float(&format!("validate_schema_{topic}"), 0.0)
    }

    /// Fraction of validation failures that produce a detailed log entry.
    pub fn log_validate_sample_rate(&self, topic: &str) -> f64 {
        self.runtime
            .get_float(&format!("log_validate_schema_{topic}"), 1.0)
    }

    /// Whether undecodable records on this topic go to the dead-letter sink.
    pub fn dlq_enabled(&self, topic: &str) -> bool {
        self.runtime.get_bool(&format!("enable_new_dlq_{topic}"))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("runtime", &self.runtime)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

fn default_max_batch_time_ms() -> u64 {
    1000
}

fn default_parallel_collect_timeout_ms() -> u64 {
    10_000
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

/// Broker connection settings for the consumed topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSpec {
    /// Comma-separated list of broker addresses
    pub brokers: String,
    /// Consumer group for offset tracking and load balancing
    pub group_id: String,
    /// Topic to consume from
    pub topic: String,
}

/// Column-store endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickhouseSpec {
    /// One HTTP endpoint per shard slice; `slice_id` indexes into this list
    pub urls: Vec<String>,
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

/// Configuration for one destination storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    pub table: String,
    /// Writable-column order for `values`-format storages
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub format: RowFormat,
    #[serde(default)]
    pub ignore_write_errors: bool,
}

/// Commit-log publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLogSpec {
    pub topic: String,
    /// Defaults to the consumer's group id
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Complete consumer specification, loaded from a YAML file.
///
/// # Example
///
/// ```yaml
/// kafka:
///   brokers: "localhost:9092"
///   group_id: "hopper-events"
///   topic: "events"
/// clickhouse:
///   urls: ["http://localhost:8123"]
///   database: "default"
/// storages:
///   - name: "events"
///     table: "events_local"
/// max_batch_size: 1000
/// max_batch_time_ms: 1000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub kafka: KafkaSpec,
    pub clickhouse: ClickhouseSpec,
    /// Ordered list of destination storages
    pub storages: Vec<StorageConfig>,
    /// Messages per batch before the collector is flushed
    pub max_batch_size: usize,
    /// Wallclock deadline for a batch, from its first message
    #[serde(default = "default_max_batch_time_ms")]
    pub max_batch_time_ms: u64,
    /// Transform worker pool size; unset runs the transform inline
    #[serde(default)]
    pub processes: Option<usize>,
    /// Transform input queue bound; required iff `processes` is set
    #[serde(default)]
    pub input_block_size: Option<usize>,
    /// Transform output queue bound; required iff `processes` is set
    #[serde(default)]
    pub output_block_size: Option<usize>,
    #[serde(default)]
    pub commit_log: Option<CommitLogSpec>,
    /// Topic for replacement batches produced by processors
    #[serde(default)]
    pub replacements_topic: Option<String>,
    /// Topic for records the pipeline refuses to process
    #[serde(default)]
    pub dlq_topic: Option<String>,
    /// Shard selector passed to the batch writer
    #[serde(default)]
    pub slice_id: Option<usize>,
    /// Deadline for joining a batch across all storages
    #[serde(default = "default_parallel_collect_timeout_ms")]
    pub parallel_collect_timeout_ms: u64,
    /// Initial values for the runtime option store
    #[serde(default)]
    pub runtime: HashMap<String, String>,
}

impl ConsumerSpec {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.storages.is_empty(), "at least one storage is required");
        ensure!(self.max_batch_size >= 1, "max_batch_size must be at least 1");
        ensure!(
            !self.clickhouse.urls.is_empty(),
            "at least one clickhouse url is required"
        );
        if let Some(slice) = self.slice_id {
            ensure!(
                slice < self.clickhouse.urls.len(),
                "slice_id {} out of range for {} clickhouse urls",
                slice,
                self.clickhouse.urls.len()
            );
        }
        match self.processes {
            Some(n) => {
                ensure!(n >= 1, "processes must be at least 1");
                ensure!(
                    self.input_block_size.is_some(),
                    "input block size required with processes"
                );
                ensure!(
                    self.output_block_size.is_some(),
                    "output block size required with processes"
                );
            }
            None => {
                ensure!(
                    self.input_block_size.is_none(),
                    "input block size cannot be used without processes"
                );
                ensure!(
                    self.output_block_size.is_none(),
                    "output block size cannot be used without processes"
                );
            }
        }
        for storage in &self.storages {
            if storage.format == RowFormat::Values {
                ensure!(
                    !storage.columns.is_empty(),
                    "storage {} uses the values format but lists no columns",
                    storage.name
                );
            }
        }
        Ok(())
    }

    pub fn max_batch_time(&self) -> Duration {
        Duration::from_millis(self.max_batch_time_ms)
    }

    pub fn parallel_collect_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_collect_timeout_ms)
    }
}
