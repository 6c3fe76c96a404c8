//! The collector owns everything one batch writes: per-storage bulk
//! inserts, replacement records, and commit-log records, plus the offset
//! bookkeeping that drives the commit step.
//!
//! A collector is built fresh for every batch, populated by `submit`,
//! frozen by `close` (which performs the writes), and made durable by
//! `join` (which flushes the producers under a shared budget).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, TimeZone, Utc};
use hopper_core::{
    BatchWriter, BrokerMessage, BytesInsertBatch, OffsetMap, ProcessedMessage, RecordProducer,
    ReplacementBatch, StorageKey, StorageOutput,
};
use metrics::{counter, histogram};
use tracing::{debug, warn};

/// Commit-log publishing configuration: where consumption progress is
/// republished for external watchers.
#[derive(Clone)]
pub struct CommitLogConfig {
    pub producer: Arc<dyn RecordProducer>,
    pub topic: String,
    pub group_id: String,
}

/// A consumer-group position on one partition, as published to the
/// commit-log topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub group: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
}

/// Encode a commit-log record: key `"{group}:{partition}"`, value
/// `{"offset", "orig_message_ts"}` with the timestamp in epoch seconds.
pub fn encode_commit(commit: &Commit) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = format!("{}:{}", commit.group, commit.partition).into_bytes();
    let value = serde_json::to_vec(&serde_json::json!({
        "offset": commit.offset,
        "orig_message_ts": commit.timestamp.timestamp_millis() as f64 / 1000.0,
    }))?;
    Ok((key, value))
}

/// Inverse of [`encode_commit`], for consumers of the commit-log topic.
pub fn decode_commit(key: &[u8], value: &[u8]) -> Result<Commit> {
    let key = std::str::from_utf8(key).context("commit key is not utf-8")?;
    let (group, partition) = key
        .rsplit_once(':')
        .with_context(|| format!("malformed commit key: {key}"))?;
    let decoded: serde_json::Value = serde_json::from_slice(value)?;
    let offset = decoded["offset"]
        .as_u64()
        .context("commit value missing offset")?;
    let seconds = decoded["orig_message_ts"]
        .as_f64()
        .context("commit value missing orig_message_ts")?;
    let timestamp = Utc
        .timestamp_millis_opt((seconds * 1000.0) as i64)
        .single()
        .context("commit timestamp out of range")?;
    Ok(Commit {
        group: group.to_string(),
        partition: partition.parse()?,
        offset,
        timestamp,
    })
}

/// Buffers encoded rows for one storage and writes them as a single bulk
/// insert when the batch closes. The write is synchronous, so `join` has
/// nothing left to wait for.
pub struct InsertBatchWriter {
    storage: StorageKey,
    writer: Box<dyn BatchWriter>,
    messages: Vec<BrokerMessage<BytesInsertBatch>>,
    closed: bool,
}

impl InsertBatchWriter {
    pub fn new(storage: StorageKey, writer: Box<dyn BatchWriter>) -> Self {
        InsertBatchWriter {
            storage,
            writer,
            messages: Vec::new(),
            closed: false,
        }
    }

    pub fn submit(&mut self, message: BrokerMessage<BytesInsertBatch>) {
        debug_assert!(!self.closed, "submit on a closed insert writer");
        self.messages.push(message);
    }

    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        if self.messages.is_empty() {
            return Ok(());
        }

        let write_start = Instant::now();
        {
            let mut rows = self
                .messages
                .iter()
                .flat_map(|message| message.payload.rows.iter().map(|row| row.as_slice()));
            self.writer.write(&mut rows)?;
        }
        let write_ms = write_start.elapsed().as_secs_f64() * 1000.0;
        let write_finish = Utc::now();

        let mut max_latency: Option<f64> = None;
        let mut latency_sum = 0.0;
        let mut max_end_to_end: Option<f64> = None;
        let mut end_to_end_sum = 0.0;
        let mut end_to_end_count = 0usize;
        for message in &self.messages {
            let latency = (write_finish - message.metadata.timestamp).num_milliseconds() as f64;
            latency_sum += latency;
            max_latency = Some(max_latency.map_or(latency, |max| max.max(latency)));
            if let Some(origin) = message.payload.origin_timestamp {
                let end_to_end = (write_finish - origin).num_milliseconds() as f64;
                end_to_end_sum += end_to_end;
                end_to_end_count += 1;
                max_end_to_end = Some(max_end_to_end.map_or(end_to_end, |max| max.max(end_to_end)));
            }
        }

        let storage = self.storage.to_string();
        if let Some(max_latency) = max_latency {
            histogram!("max_latency_ms", max_latency, "storage" => storage.clone());
            histogram!(
                "latency_ms",
                latency_sum / self.messages.len() as f64,
                "storage" => storage.clone()
            );
        }
        if let Some(max_end_to_end) = max_end_to_end {
            histogram!("max_end_to_end_latency_ms", max_end_to_end, "storage" => storage.clone());
            histogram!(
                "end_to_end_latency_ms",
                end_to_end_sum / end_to_end_count as f64,
                "storage" => storage.clone()
            );
        }
        let rows: usize = self
            .messages
            .iter()
            .map(|message| message.payload.rows.len())
            .sum();
        histogram!("batch_write_ms", write_ms, "storage" => storage.clone());
        counter!("batch_write_msgs", rows as u64, "storage" => storage);

        debug!(
            rows,
            elapsed_ms = write_ms,
            storage = %self.storage,
            "bulk insert confirmed"
        );
        Ok(())
    }

    pub fn join(&mut self) {}
}

/// Buffers replacement batches and produces one record per replacement
/// value when the batch closes. Delivery errors surface at `join`.
pub struct ReplacementBatchWriter {
    producer: Arc<dyn RecordProducer>,
    topic: String,
    messages: Vec<BrokerMessage<ReplacementBatch>>,
    closed: bool,
}

impl ReplacementBatchWriter {
    pub fn new(producer: Arc<dyn RecordProducer>, topic: impl Into<String>) -> Self {
        ReplacementBatchWriter {
            producer,
            topic: topic.into(),
            messages: Vec::new(),
            closed: false,
        }
    }

    pub fn submit(&mut self, message: BrokerMessage<ReplacementBatch>) {
        debug_assert!(!self.closed, "submit on a closed replacement writer");
        self.messages.push(message);
    }

    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        for message in &self.messages {
            let key = message.payload.key.as_bytes();
            for value in &message.payload.values {
                self.producer
                    .produce(&self.topic, Some(key), &serde_json::to_vec(value)?, &[])?;
            }
        }
        Ok(())
    }

    pub fn join(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        self.producer.flush(timeout)?;
        let produced: usize = self
            .messages
            .iter()
            .map(|message| message.payload.values.len())
            .sum();
        debug!(
            produced,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            topic = %self.topic,
            "replacements flushed"
        );
        Ok(())
    }
}

/// Per-batch aggregator: one insert writer (plus optional replacement
/// writer) per storage, the optional commit-log producer, and the highest
/// observed offset per partition.
///
/// Offsets advance for every submitted record, including records whose
/// fan-out came back empty, so progress never stalls behind filtered or
/// refused records.
pub struct MultistorageCollector {
    inserts: Vec<(StorageKey, InsertBatchWriter)>,
    replacements: Vec<(StorageKey, ReplacementBatchWriter)>,
    commit_log: Option<CommitLogConfig>,
    ignore_errors: HashSet<StorageKey>,
    offsets_to_commit: OffsetMap,
    closed: bool,
}

impl MultistorageCollector {
    pub fn new(
        inserts: Vec<(StorageKey, InsertBatchWriter)>,
        replacements: Vec<(StorageKey, ReplacementBatchWriter)>,
        commit_log: Option<CommitLogConfig>,
        ignore_errors: HashSet<StorageKey>,
    ) -> Self {
        MultistorageCollector {
            inserts,
            replacements,
            commit_log,
            ignore_errors,
            offsets_to_commit: OffsetMap::new(),
            closed: false,
        }
    }

    pub fn submit(&mut self, message: BrokerMessage<ProcessedMessage>) -> Result<()> {
        assert!(!self.closed, "submit on a closed collector");

        let BrokerMessage { metadata, payload } = message;

        let entry = self
            .offsets_to_commit
            .entry(metadata.partition)
            .or_insert((metadata.offset, metadata.timestamp));
        if metadata.offset >= entry.0 {
            *entry = (metadata.offset, metadata.timestamp);
        }

        for (storage_key, output) in payload {
            match output {
                None => {}
                Some(StorageOutput::Rows(batch)) => {
                    let writer = self
                        .inserts
                        .iter_mut()
                        .find(|(key, _)| key == &storage_key)
                        .map(|(_, writer)| writer)
                        .ok_or_else(|| anyhow!("no insert writer for storage {storage_key}"))?;
                    writer.submit(BrokerMessage::new(metadata.clone(), batch));
                }
                Some(StorageOutput::Replacements(batch)) => {
                    let writer = self
                        .replacements
                        .iter_mut()
                        .find(|(key, _)| key == &storage_key)
                        .map(|(_, writer)| writer)
                        .ok_or_else(|| {
                            anyhow!("storage {storage_key} is not configured for replacements")
                        })?;
                    writer.submit(BrokerMessage::new(metadata.clone(), batch));
                }
            }
        }
        Ok(())
    }

    /// Close ordering: inserts for every storage, then replacements, then
    /// commit-log records. A replacement or commit record must never be
    /// visible before the rows it refers to.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;

        for (storage_key, writer) in &mut self.inserts {
            match writer.close() {
                Ok(()) => {}
                Err(err) if self.ignore_errors.contains(storage_key) => {
                    counter!("ignored_write_errors", 1, "storage" => storage_key.to_string());
                    warn!(
                        storage = %storage_key,
                        error = ?err,
                        "ignoring insert failure"
                    );
                }
                Err(err) => {
                    return Err(err.context(format!("insert failed for storage {storage_key}")))
                }
            }
        }

        for (storage_key, writer) in &mut self.replacements {
            writer
                .close()
                .with_context(|| format!("replacements failed for storage {storage_key}"))?;
        }

        if let Some(commit_log) = &self.commit_log {
            for (partition, (offset, timestamp)) in &self.offsets_to_commit {
                let (key, value) = encode_commit(&Commit {
                    group: commit_log.group_id.clone(),
                    partition: *partition,
                    offset: *offset,
                    timestamp: *timestamp,
                })?;
                commit_log
                    .producer
                    .produce(&commit_log.topic, Some(&key), &value, &[])
                    .context("commit-log produce failed")?;
            }
        }

        Ok(())
    }

    /// Wait for durability in close order, under one shared budget.
    /// The commit-log producer is flushed here, once.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        for (_, writer) in &mut self.inserts {
            writer.join();
        }

        for (storage_key, writer) in &mut self.replacements {
            writer
                .join(remaining_budget(deadline))
                .with_context(|| format!("replacement delivery failed for storage {storage_key}"))?;
        }

        if let Some(commit_log) = &self.commit_log {
            commit_log
                .producer
                .flush(remaining_budget(deadline))
                .context("commit-log delivery failed")?;
        }

        Ok(())
    }

    pub fn offsets_to_commit(&self) -> &OffsetMap {
        &self.offsets_to_commit
    }

    pub fn take_offsets(&mut self) -> OffsetMap {
        std::mem::take(&mut self.offsets_to_commit)
    }
}

// Producer flushes need a finite wait even when the caller gave no budget.
fn remaining_budget(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => Duration::from_secs(300),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;
    use hopper_core::RecordMetadata;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Insert(String, usize),
        Produce(String),
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    struct LoggingWriter {
        storage: String,
        log: EventLog,
        fail: bool,
    }

    impl BatchWriter for LoggingWriter {
        fn write(&mut self, rows: &mut dyn Iterator<Item = &[u8]>) -> Result<()> {
            let count = rows.count();
            if self.fail {
                bail!("write refused");
            }
            self.log
                .lock()
                .unwrap()
                .push(Event::Insert(self.storage.clone(), count));
            Ok(())
        }
    }

    struct LoggingProducer {
        log: EventLog,
    }

    impl RecordProducer for LoggingProducer {
        fn produce(
            &self,
            topic: &str,
            _key: Option<&[u8]>,
            _value: &[u8],
            _headers: &[(String, Vec<u8>)],
        ) -> Result<()> {
            self.log.lock().unwrap().push(Event::Produce(topic.to_string()));
            Ok(())
        }

        fn flush(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn metadata(partition: u32, offset: u64) -> RecordMetadata {
        RecordMetadata {
            partition,
            offset,
            timestamp: Utc.timestamp_opt(1_700_000_000 + offset as i64, 0).unwrap(),
        }
    }

    fn rows_batch(rows: &[&str]) -> BytesInsertBatch {
        BytesInsertBatch {
            rows: rows.iter().map(|row| row.as_bytes().to_vec()).collect(),
            origin_timestamp: None,
        }
    }

    fn insert_writer(storage: &str, log: &EventLog, fail: bool) -> (StorageKey, InsertBatchWriter) {
        let key = StorageKey::new(storage);
        (
            key.clone(),
            InsertBatchWriter::new(
                key,
                Box::new(LoggingWriter {
                    storage: storage.to_string(),
                    log: log.clone(),
                    fail,
                }),
            ),
        )
    }

    #[test]
    fn commit_codec_round_trip() {
        let commit = Commit {
            group: "hopper-events".to_string(),
            partition: 2,
            offset: 99,
            timestamp: Utc.timestamp_opt(1_700_000_099, 0).unwrap(),
        };
        let (key, value) = encode_commit(&commit).unwrap();
        assert_eq!(key, b"hopper-events:2".to_vec());
        assert_eq!(decode_commit(&key, &value).unwrap(), commit);
    }

    #[test]
    fn offsets_track_the_highest_offset_per_partition() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut collector = MultistorageCollector::new(
            vec![insert_writer("events", &log, false)],
            Vec::new(),
            None,
            HashSet::new(),
        );

        for (partition, offset) in [(0u32, 10u64), (1, 3), (0, 11), (1, 2)] {
            collector
                .submit(BrokerMessage::new(
                    metadata(partition, offset),
                    vec![(
                        StorageKey::new("events"),
                        Some(StorageOutput::Rows(rows_batch(&["{}\n"]))),
                    )],
                ))
                .unwrap();
        }

        let offsets = collector.offsets_to_commit();
        assert_eq!(offsets[&0].0, 11);
        assert_eq!(offsets[&1].0, 3);
    }

    #[test]
    fn empty_fanouts_still_advance_offsets() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut collector = MultistorageCollector::new(
            vec![insert_writer("events", &log, false)],
            Vec::new(),
            None,
            HashSet::new(),
        );

        collector
            .submit(BrokerMessage::new(metadata(0, 5), Vec::new()))
            .unwrap();
        collector.close().unwrap();
        collector.join(None).unwrap();

        assert_eq!(collector.offsets_to_commit()[&0].0, 5);
        // No rows were submitted, so no insert was issued.
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn close_orders_inserts_before_replacements_before_commit_log() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(LoggingProducer { log: log.clone() });
        let commit_log = CommitLogConfig {
            producer: producer.clone(),
            topic: "commits".to_string(),
            group_id: "group".to_string(),
        };
        let mut collector = MultistorageCollector::new(
            vec![insert_writer("events", &log, false)],
            vec![(
                StorageKey::new("events"),
                ReplacementBatchWriter::new(producer, "replacements"),
            )],
            Some(commit_log),
            HashSet::new(),
        );

        collector
            .submit(BrokerMessage::new(
                metadata(0, 1),
                vec![(
                    StorageKey::new("events"),
                    Some(StorageOutput::Rows(rows_batch(&["{}\n"]))),
                )],
            ))
            .unwrap();
        collector
            .submit(BrokerMessage::new(
                metadata(0, 2),
                vec![(
                    StorageKey::new("events"),
                    Some(StorageOutput::Replacements(ReplacementBatch {
                        key: "k".to_string(),
                        values: vec![json!({"op": "del"})],
                    })),
                )],
            ))
            .unwrap();

        collector.close().unwrap();
        collector.join(Some(Duration::from_secs(1))).unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::Insert("events".to_string(), 1),
                Event::Produce("replacements".to_string()),
                Event::Produce("commits".to_string()),
            ]
        );
    }

    #[test]
    fn ignored_storages_do_not_fail_the_batch() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut collector = MultistorageCollector::new(
            vec![
                insert_writer("primary", &log, false),
                insert_writer("experimental", &log, true),
            ],
            Vec::new(),
            None,
            HashSet::from([StorageKey::new("experimental")]),
        );

        collector
            .submit(BrokerMessage::new(
                metadata(0, 1),
                vec![
                    (
                        StorageKey::new("primary"),
                        Some(StorageOutput::Rows(rows_batch(&["{}\n"]))),
                    ),
                    (
                        StorageKey::new("experimental"),
                        Some(StorageOutput::Rows(rows_batch(&["{}\n"]))),
                    ),
                ],
            ))
            .unwrap();

        collector.close().unwrap();
        collector.join(None).unwrap();
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![Event::Insert("primary".to_string(), 1)]
        );
    }

    #[test]
    fn non_ignored_write_failures_fail_the_close() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut collector = MultistorageCollector::new(
            vec![insert_writer("primary", &log, true)],
            Vec::new(),
            None,
            HashSet::new(),
        );

        collector
            .submit(BrokerMessage::new(
                metadata(0, 1),
                vec![(
                    StorageKey::new("primary"),
                    Some(StorageOutput::Rows(rows_batch(&["{}\n"]))),
                )],
            ))
            .unwrap();

        assert!(collector.close().is_err());
    }

    #[test]
    fn replacement_writer_produces_one_record_per_value() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(LoggingProducer { log: log.clone() });
        let mut writer = ReplacementBatchWriter::new(producer, "replacements");

        writer.submit(BrokerMessage::new(
            metadata(0, 1),
            ReplacementBatch {
                key: "k".to_string(),
                values: vec![json!({"op": "del", "id": 1}), json!({"op": "del", "id": 2})],
            },
        ));
        writer.close().unwrap();
        writer.join(Duration::from_secs(1)).unwrap();

        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
