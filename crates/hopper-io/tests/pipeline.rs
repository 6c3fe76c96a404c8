//! End-to-end pipeline scenarios against in-memory writers and producers:
//! fan-out -> transform -> batcher -> collector -> commit, with no broker
//! or column-store required.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use hopper_core::{
    BatchWriter, BrokerMessage, Context, MessageProcessor, OffsetMap, PipelineStep, PreFilter,
    ProcessorOutput, RawMessage, RecordMetadata, RecordProducer, ReplacementBatch, RuntimeConfig,
    StorageKey, StorageSpec, StorageRegistry,
};
use hopper_io::collect::{
    decode_commit, CommitLogConfig, InsertBatchWriter, MultistorageCollector,
    ReplacementBatchWriter,
};
use hopper_io::reduce::{CollectorFactory, CommitFn, Reduce};
use hopper_tx::{DlqProducer, FanoutStep, Transform, TransformStep};
use serde_json::json;

type Strategy = FanoutStep<Transform<Reduce>>;

#[derive(Default)]
struct InsertLog {
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl InsertLog {
    fn inserts(&self) -> Vec<Vec<Vec<u8>>> {
        self.batches.lock().unwrap().clone()
    }
}

struct SharedWriter {
    log: Arc<InsertLog>,
    fail: bool,
}

impl BatchWriter for SharedWriter {
    fn write(&mut self, rows: &mut dyn Iterator<Item = &[u8]>) -> anyhow::Result<()> {
        let collected: Vec<Vec<u8>> = rows.map(|row| row.to_vec()).collect();
        if self.fail {
            anyhow::bail!("write refused");
        }
        self.log.batches.lock().unwrap().push(collected);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ProducedRecord {
    topic: String,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    headers: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct FakeProducer {
    records: Mutex<Vec<ProducedRecord>>,
}

impl FakeProducer {
    fn produced(&self) -> Vec<ProducedRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordProducer for FakeProducer {
    fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        headers: &[(String, Vec<u8>)],
    ) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(ProducedRecord {
            topic: topic.to_string(),
            key: key.map(|k| k.to_vec()),
            value: value.to_vec(),
            headers: headers.to_vec(),
        });
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

struct DropAlways;

impl PreFilter for DropAlways {
    fn should_drop(&self, _message: &RawMessage) -> bool {
        true
    }
}

struct ReplacementProcessor;

impl MessageProcessor for ReplacementProcessor {
    fn process_message(
        &self,
        _value: &serde_json::Value,
        _metadata: &RecordMetadata,
    ) -> anyhow::Result<Option<ProcessorOutput>> {
        Ok(Some(ProcessorOutput::Replacement(ReplacementBatch {
            key: "k".to_string(),
            values: vec![json!({"op": "del", "id": 1})],
        })))
    }
}

struct PipelineBuilder {
    specs: Vec<StorageSpec>,
    max_batch_size: usize,
    max_batch_time: Duration,
    runtime: Vec<(String, String)>,
    replacements: Option<(Arc<FakeProducer>, String)>,
    commit_log: Option<(Arc<FakeProducer>, String, String)>,
    dlq: Option<(Arc<FakeProducer>, String)>,
    insert_logs: HashMap<String, Arc<InsertLog>>,
    failing: HashSet<String>,
}

struct Pipeline {
    strategy: Strategy,
    commits: Arc<Mutex<Vec<OffsetMap>>>,
    insert_logs: HashMap<String, Arc<InsertLog>>,
}

impl PipelineBuilder {
    fn new(max_batch_size: usize, max_batch_time: Duration) -> Self {
        PipelineBuilder {
            specs: Vec::new(),
            max_batch_size,
            max_batch_time,
            runtime: Vec::new(),
            replacements: None,
            commit_log: None,
            dlq: None,
            insert_logs: HashMap::new(),
            failing: HashSet::new(),
        }
    }

    fn storage(mut self, spec: StorageSpec) -> Self {
        self.insert_logs
            .insert(spec.key.to_string(), Arc::new(InsertLog::default()));
        self.specs.push(spec);
        self
    }

    fn failing_storage(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    fn runtime(mut self, key: &str, value: &str) -> Self {
        self.runtime.push((key.to_string(), value.to_string()));
        self
    }

    fn replacements(mut self, producer: Arc<FakeProducer>, topic: &str) -> Self {
        self.replacements = Some((producer, topic.to_string()));
        self
    }

    fn commit_log(mut self, producer: Arc<FakeProducer>, topic: &str, group: &str) -> Self {
        self.commit_log = Some((producer, topic.to_string(), group.to_string()));
        self
    }

    fn dlq(mut self, producer: Arc<FakeProducer>, topic: &str) -> Self {
        self.dlq = Some((producer, topic.to_string()));
        self
    }

    fn build(self) -> Pipeline {
        let mut registry = StorageRegistry::new();
        for spec in &self.specs {
            registry.register(spec.clone());
        }
        let registry = Arc::new(registry);
        let names: Vec<String> = self.specs.iter().map(|s| s.key.to_string()).collect();
        let storages = registry.resolve(&names).unwrap();

        let commits: Arc<Mutex<Vec<OffsetMap>>> = Arc::new(Mutex::new(Vec::new()));
        let commit_sink = commits.clone();
        let commit: CommitFn = Box::new(move |offsets| {
            commit_sink.lock().unwrap().push(offsets.clone());
            Ok(())
        });

        let ignore_errors: HashSet<StorageKey> = self
            .specs
            .iter()
            .filter(|spec| spec.ignore_write_errors)
            .map(|spec| spec.key.clone())
            .collect();
        let insert_logs = self.insert_logs.clone();
        let failing = self.failing.clone();
        let replacements = self
            .replacements
            .as_ref()
            .map(|(producer, topic)| (producer.clone() as Arc<dyn RecordProducer>, topic.clone()));
        let commit_log_config = self.commit_log.as_ref().map(|(producer, topic, group)| {
            CommitLogConfig {
                producer: producer.clone() as Arc<dyn RecordProducer>,
                topic: topic.clone(),
                group_id: group.clone(),
            }
        });
        let factory_storages = storages.clone();
        let factory: CollectorFactory = Box::new(move || {
            let mut inserts = Vec::new();
            let mut replacement_writers = Vec::new();
            for storage in &factory_storages {
                let name = storage.key.to_string();
                inserts.push((
                    storage.key.clone(),
                    InsertBatchWriter::new(
                        storage.key.clone(),
                        Box::new(SharedWriter {
                            log: insert_logs[&name].clone(),
                            fail: failing.contains(&name),
                        }),
                    ),
                ));
                if let Some((producer, topic)) = &replacements {
                    replacement_writers.push((
                        storage.key.clone(),
                        ReplacementBatchWriter::new(producer.clone(), topic.clone()),
                    ));
                }
            }
            Ok(MultistorageCollector::new(
                inserts,
                replacement_writers,
                commit_log_config.clone(),
                ignore_errors.clone(),
            ))
        });

        let dlq_handle = self
            .dlq
            .as_ref()
            .map(|(producer, _)| producer.clone() as Arc<dyn RecordProducer>);
        let reduce = Reduce::new(
            self.max_batch_size,
            self.max_batch_time,
            factory,
            commit,
            Duration::from_secs(5),
            dlq_handle,
        )
        .unwrap();

        let runtime = Arc::new(RuntimeConfig::new());
        for (key, value) in &self.runtime {
            runtime.set(key, value);
        }
        let context = Context::new(runtime);
        let dlq = self
            .dlq
            .as_ref()
            .map(|(producer, topic)| {
                DlqProducer::new(producer.clone() as Arc<dyn RecordProducer>, topic.clone())
            });
        let transform = Transform::Inline(TransformStep::new(
            registry, context, "events", dlq, reduce,
        ));

        Pipeline {
            strategy: FanoutStep::new(storages, transform),
            commits,
            insert_logs: self.insert_logs,
        }
    }
}

impl Pipeline {
    fn submit_bytes(&mut self, partition: u32, offset: u64, value: &[u8]) {
        let metadata = RecordMetadata {
            partition,
            offset,
            timestamp: Utc.timestamp_opt(1_700_000_000 + offset as i64, 0).unwrap(),
        };
        let raw = RawMessage {
            metadata: metadata.clone(),
            key: None,
            value: value.to_vec(),
            headers: Vec::new(),
        };
        self.strategy
            .submit(BrokerMessage::new(metadata, raw))
            .unwrap();
    }

    fn submit_json(&mut self, partition: u32, offset: u64, value: &serde_json::Value) {
        self.submit_bytes(partition, offset, &serde_json::to_vec(value).unwrap());
    }

    fn wait_for_commits(&mut self, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.commits.lock().unwrap().len() >= expected {
                return;
            }
            self.strategy.poll().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {expected} commits");
    }

    fn commits(&self) -> Vec<OffsetMap> {
        self.commits.lock().unwrap().clone()
    }

    fn inserts(&self, storage: &str) -> Vec<Vec<Vec<u8>>> {
        self.insert_logs[storage].inserts()
    }

    fn finish(mut self) -> (Vec<OffsetMap>, HashMap<String, Arc<InsertLog>>) {
        self.strategy.close();
        self.strategy.join(Some(Duration::from_secs(5))).unwrap();
        let commits = self.commits.lock().unwrap().clone();
        (commits, self.insert_logs)
    }
}

#[test]
fn size_triggered_flush_writes_and_commits() {
    let mut pipeline = PipelineBuilder::new(2, Duration::from_secs(60))
        .storage(StorageSpec::new(StorageKey::new("events"), "events_local"))
        .build();

    pipeline.submit_json(0, 10, &json!({"a": 1}));
    pipeline.submit_json(0, 11, &json!({"a": 2}));
    pipeline.wait_for_commits(1);

    let inserts = pipeline.inserts("events");
    assert_eq!(
        inserts,
        vec![vec![b"{\"a\":1}\n".to_vec(), b"{\"a\":2}\n".to_vec()]]
    );
    let commits = pipeline.commits();
    assert_eq!(commits[0][&0].0, 11);

    // A third record starts a new batch that does not flush on its own.
    pipeline.submit_json(0, 12, &json!({"a": 3}));
    assert_eq!(pipeline.inserts("events").len(), 1);
    assert_eq!(pipeline.commits().len(), 1);

    let (commits, logs) = pipeline.finish();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[1][&0].0, 12);
    assert_eq!(logs["events"].inserts()[1], vec![b"{\"a\":3}\n".to_vec()]);
}

#[test]
fn pre_filtered_storage_gets_no_rows_but_offsets_advance() {
    let mut pipeline = PipelineBuilder::new(1, Duration::from_secs(60))
        .storage(StorageSpec::new(StorageKey::new("kept"), "kept_local"))
        .storage(
            StorageSpec::new(StorageKey::new("filtered"), "filtered_local")
                .with_pre_filter(Arc::new(DropAlways)),
        )
        .build();

    pipeline.submit_json(0, 5, &json!({"a": 1}));
    pipeline.wait_for_commits(1);

    let (commits, logs) = pipeline.finish();
    assert_eq!(logs["kept"].inserts(), vec![vec![b"{\"a\":1}\n".to_vec()]]);
    assert!(logs["filtered"].inserts().is_empty());
    assert_eq!(commits[0][&0].0, 5);
}

#[test]
fn records_dropped_by_every_pre_filter_still_commit() {
    let mut pipeline = PipelineBuilder::new(1, Duration::from_secs(60))
        .storage(
            StorageSpec::new(StorageKey::new("filtered"), "filtered_local")
                .with_pre_filter(Arc::new(DropAlways)),
        )
        .build();

    pipeline.submit_json(0, 42, &json!({"a": 1}));
    pipeline.wait_for_commits(1);

    let (commits, logs) = pipeline.finish();
    assert!(logs["filtered"].inserts().is_empty());
    assert_eq!(commits[0][&0].0, 42);
}

#[test]
fn undecodable_records_reach_the_dead_letter_topic_before_committing() {
    let dlq = Arc::new(FakeProducer::default());
    let mut pipeline = PipelineBuilder::new(1, Duration::from_secs(60))
        .storage(StorageSpec::new(StorageKey::new("events"), "events_local"))
        .runtime("enable_new_dlq_events", "1")
        .dlq(dlq.clone(), "events-dlq")
        .build();

    pipeline.submit_bytes(0, 7, b"not json");
    pipeline.wait_for_commits(1);

    let (commits, logs) = pipeline.finish();
    assert!(logs["events"].inserts().is_empty());

    let dead_lettered = dlq.produced();
    assert_eq!(dead_lettered.len(), 1);
    assert_eq!(dead_lettered[0].topic, "events-dlq");
    assert_eq!(dead_lettered[0].value, b"not json".to_vec());
    assert!(dead_lettered[0]
        .headers
        .contains(&("original_offset".to_string(), b"7".to_vec())));

    assert_eq!(commits[0][&0].0, 7);
}

#[test]
fn replacements_and_commit_log_are_published_per_batch() {
    let replacements = Arc::new(FakeProducer::default());
    let commit_log = Arc::new(FakeProducer::default());
    let mut pipeline = PipelineBuilder::new(1, Duration::from_secs(60))
        .storage(
            StorageSpec::new(StorageKey::new("events"), "events_local")
                .with_processor(Arc::new(ReplacementProcessor)),
        )
        .replacements(replacements.clone(), "event-replacements")
        .commit_log(commit_log.clone(), "event-commits", "hopper-events")
        .build();

    pipeline.submit_json(2, 99, &json!({"ignored": true}));
    pipeline.wait_for_commits(1);
    let (commits, _) = pipeline.finish();

    let replaced = replacements.produced();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].topic, "event-replacements");
    assert_eq!(replaced[0].key, Some(b"k".to_vec()));
    let value: serde_json::Value = serde_json::from_slice(&replaced[0].value).unwrap();
    assert_eq!(value, json!({"op": "del", "id": 1}));

    let committed = commit_log.produced();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].topic, "event-commits");
    let commit = decode_commit(
        committed[0].key.as_deref().unwrap(),
        &committed[0].value,
    )
    .unwrap();
    assert_eq!(commit.group, "hopper-events");
    assert_eq!(commit.partition, 2);
    assert_eq!(commit.offset, 99);
    assert_eq!(
        commit.timestamp,
        Utc.timestamp_opt(1_700_000_000 + 99, 0).unwrap()
    );

    assert_eq!(commits[0][&2].0, 99);
}

#[test]
fn time_triggered_flush_commits_a_partial_batch() {
    let mut pipeline = PipelineBuilder::new(1000, Duration::from_millis(50))
        .storage(StorageSpec::new(StorageKey::new("events"), "events_local"))
        .build();

    pipeline.submit_json(0, 1, &json!({"a": 1}));
    pipeline.wait_for_commits(1);

    assert_eq!(
        pipeline.inserts("events"),
        vec![vec![b"{\"a\":1}\n".to_vec()]]
    );
    let (commits, _) = pipeline.finish();
    assert_eq!(commits[0][&0].0, 1);
}

#[test]
fn ignorable_insert_failures_do_not_block_commits() {
    let mut pipeline = PipelineBuilder::new(1, Duration::from_secs(60))
        .storage(StorageSpec::new(StorageKey::new("primary"), "primary_local"))
        .storage(
            StorageSpec::new(StorageKey::new("experimental"), "experimental_local")
                .with_ignore_write_errors(true),
        )
        .failing_storage("experimental")
        .build();

    pipeline.submit_json(0, 8, &json!({"a": 1}));
    pipeline.wait_for_commits(1);

    let (commits, logs) = pipeline.finish();
    assert_eq!(logs["primary"].inserts(), vec![vec![b"{\"a\":1}\n".to_vec()]]);
    assert!(logs["experimental"].inserts().is_empty());
    assert_eq!(commits[0][&0].0, 8);
}

#[test]
fn commits_arrive_in_batch_order_and_are_monotonic() {
    let mut pipeline = PipelineBuilder::new(2, Duration::from_secs(60))
        .storage(StorageSpec::new(StorageKey::new("events"), "events_local"))
        .build();

    for offset in 0..6u64 {
        pipeline.submit_json(0, offset, &json!({"n": offset}));
    }
    pipeline.wait_for_commits(3);
    let (commits, _) = pipeline.finish();

    let offsets: Vec<u64> = commits.iter().map(|c| c[&0].0).collect();
    assert_eq!(offsets, vec![1, 3, 5]);
}
