//! The batcher: accumulates processed messages into the current collector
//! and rotates it to a single background flush worker when the message
//! count or the batch deadline is reached.
//!
//! Rotation hands the collector over a rendezvous channel, so at most one
//! flush is outstanding: the next batch fills while the previous one
//! flushes, and a second rotation blocks until the worker is free. The
//! single worker also fixes the commit order: batch k commits before
//! batch k+1.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use hopper_core::{
    BrokerMessage, OffsetMap, PipelineError, PipelineStep, ProcessedMessage, RecordProducer,
};
use tracing::{debug, error};

use crate::collect::MultistorageCollector;

/// Builds a fresh collector for each batch.
pub type CollectorFactory = Box<dyn Fn() -> Result<MultistorageCollector> + Send>;

/// Advances the durable consumer position after a batch has fully joined.
pub type CommitFn = Box<dyn Fn(&OffsetMap) -> Result<()> + Send>;

struct ActiveBatch {
    collector: MultistorageCollector,
    first_submit: Instant,
    messages: usize,
}

/// Size- and time-bounded accumulator feeding the flush worker.
pub struct Reduce {
    max_batch_size: usize,
    max_batch_time: Duration,
    factory: CollectorFactory,
    batch: Option<ActiveBatch>,
    flush_tx: Option<SyncSender<MultistorageCollector>>,
    worker: Option<thread::JoinHandle<()>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl Reduce {
    pub fn new(
        max_batch_size: usize,
        max_batch_time: Duration,
        factory: CollectorFactory,
        commit: CommitFn,
        join_timeout: Duration,
        dlq: Option<Arc<dyn RecordProducer>>,
    ) -> Result<Self> {
        // Rendezvous channel: a rotation blocks until the worker takes the
        // batch, capping the pipeline at one outstanding flush.
        let (flush_tx, flush_rx) = mpsc::sync_channel::<MultistorageCollector>(0);
        let fatal = Arc::new(Mutex::new(None));
        let worker_fatal = fatal.clone();
        let worker = thread::Builder::new()
            .name("hopper-flush".to_string())
            .spawn(move || flush_worker(flush_rx, commit, join_timeout, dlq, worker_fatal))
            .context("failed to spawn flush worker")?;

        Ok(Reduce {
            max_batch_size,
            max_batch_time,
            factory,
            batch: None,
            flush_tx: Some(flush_tx),
            worker: Some(worker),
            fatal,
        })
    }

    fn check_fatal(&self) -> Result<(), PipelineError> {
        let guard = match self.fatal.lock() {
            Ok(guard) => guard,
            Err(_) => return Err(PipelineError::Fatal(anyhow!("flush worker panicked"))),
        };
        match guard.as_ref() {
            Some(error) => Err(PipelineError::Fatal(anyhow!("batch flush failed: {error}"))),
            None => Ok(()),
        }
    }

    fn rotate(&mut self) -> Result<(), PipelineError> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        debug!(messages = batch.messages, "rotating batch to the flush worker");
        let Some(flush_tx) = &self.flush_tx else {
            return Err(PipelineError::ChannelClosed("flush worker"));
        };
        flush_tx
            .send(batch.collector)
            .map_err(|_| PipelineError::ChannelClosed("flush worker"))?;
        Ok(())
    }
}

impl PipelineStep<ProcessedMessage> for Reduce {
    fn submit(&mut self, message: BrokerMessage<ProcessedMessage>) -> Result<(), PipelineError> {
        self.check_fatal()?;

        if self.batch.is_none() {
            self.batch = Some(ActiveBatch {
                collector: (self.factory)().map_err(PipelineError::Fatal)?,
                first_submit: Instant::now(),
                messages: 0,
            });
        }
        let Some(batch) = self.batch.as_mut() else {
            return Err(PipelineError::ChannelClosed("batcher"));
        };

        batch.collector.submit(message).map_err(PipelineError::Fatal)?;
        batch.messages += 1;

        if batch.messages >= self.max_batch_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<(), PipelineError> {
        self.check_fatal()?;
        let deadline_reached = self
            .batch
            .as_ref()
            .map(|batch| batch.first_submit.elapsed() >= self.max_batch_time)
            .unwrap_or(false);
        if deadline_reached {
            self.rotate()?;
        }
        Ok(())
    }

    fn close(&mut self) {}

    fn join(&mut self, _timeout: Option<Duration>) -> Result<(), PipelineError> {
        // The per-batch budget is enforced by the flush worker itself; here
        // we rotate the final partial batch and wait for the worker to drain.
        self.check_fatal()?;
        self.rotate()?;
        self.flush_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.check_fatal()
    }
}

fn flush_worker(
    flush_rx: Receiver<MultistorageCollector>,
    commit: CommitFn,
    join_timeout: Duration,
    dlq: Option<Arc<dyn RecordProducer>>,
    fatal: Arc<Mutex<Option<String>>>,
) {
    while let Ok(mut collector) = flush_rx.recv() {
        if let Err(err) = flush_one(&mut collector, &commit, join_timeout, dlq.as_deref()) {
            error!(error = ?err, "batch flush failed; halting the consumer");
            if let Ok(mut guard) = fatal.lock() {
                guard.get_or_insert(format!("{err:#}"));
            }
            break;
        }
    }
    debug!("flush worker exiting");
}

fn flush_one(
    collector: &mut MultistorageCollector,
    commit: &CommitFn,
    join_timeout: Duration,
    dlq: Option<&dyn RecordProducer>,
) -> Result<()> {
    collector.close()?;
    collector.join(Some(join_timeout))?;
    if let Some(dlq) = dlq {
        // Dead-lettered records must be durable before their offsets commit.
        dlq.flush(join_timeout)?;
    }
    let offsets = collector.take_offsets();
    if offsets.is_empty() {
        return Ok(());
    }
    commit(&offsets).context("offset commit failed")
}
