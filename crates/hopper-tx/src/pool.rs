//! Worker-pool execution of the transform stage.
//!
//! Messages enter a bounded input queue, are decoded and processed on a pool
//! of OS threads, and leave through a bounded output queue. Results are
//! re-sequenced before they reach the downstream step, so per-partition
//! order is preserved end to end. A full input queue blocks `submit`, which
//! is the pipeline's back-pressure onto the broker.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use hopper_core::{
    BrokerMessage, Context, MultiStoragePayload, PipelineError, PipelineStep, ProcessedMessage,
    RecordMetadata, StorageRegistry,
};
use tracing::debug;

use crate::{forward_output, process_multistorage, DlqProducer, TransformOutput};

/// Sizing of the worker pool and its queues.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    /// Capacity of the queue feeding the workers
    pub input_bound: usize,
    /// Capacity of the queue carrying results back
    pub output_bound: usize,
}

type Job = (u64, RecordMetadata, MultiStoragePayload);
type Done = (u64, RecordMetadata, TransformOutput);

/// Transform stage backed by a pool of worker threads.
///
/// Workers are deterministic with respect to the payload; the sequence
/// number assigned at submit restores input order on the way out.
pub struct PoolTransformStep<N> {
    context: Context,
    topic: String,
    dlq: Option<DlqProducer>,
    next: N,
    input: Option<SyncSender<Job>>,
    output: Receiver<Done>,
    workers: Vec<thread::JoinHandle<()>>,
    pending: BTreeMap<u64, (RecordMetadata, TransformOutput)>,
    next_submit: u64,
    next_emit: u64,
}

impl<N: PipelineStep<ProcessedMessage>> PoolTransformStep<N> {
    pub fn new(
        registry: Arc<StorageRegistry>,
        context: Context,
        topic: impl Into<String>,
        dlq: Option<DlqProducer>,
        config: PoolConfig,
        next: N,
    ) -> Result<Self> {
        let topic = topic.into();
        let (input_tx, input_rx) = mpsc::sync_channel::<Job>(config.input_bound);
        let (output_tx, output_rx) = mpsc::sync_channel::<Done>(config.output_bound);
        let input_rx = Arc::new(Mutex::new(input_rx));

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let input = input_rx.clone();
            let output = output_tx.clone();
            let registry = registry.clone();
            let context = context.clone();
            let topic = topic.clone();
            let handle = thread::Builder::new()
                .name(format!("hopper-transform-{index}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = match input.lock() {
                                Ok(guard) => guard,
                                Err(_) => break,
                            };
                            guard.recv()
                        };
                        let Ok((seq, metadata, payload)) = job else {
                            break;
                        };
                        let result =
                            process_multistorage(&registry, &context, &topic, &metadata, payload);
                        if output.send((seq, metadata, result)).is_err() {
                            break;
                        }
                    }
                    debug!("transform worker exiting");
                })
                .context("failed to spawn transform worker")?;
            workers.push(handle);
        }

        Ok(PoolTransformStep {
            context,
            topic,
            dlq,
            next,
            input: Some(input_tx),
            output: output_rx,
            workers,
            pending: BTreeMap::new(),
            next_submit: 0,
            next_emit: 0,
        })
    }

    // Pull completed results off the output queue and forward every message
    // that is next in sequence.
    fn drain_ready(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.output.try_recv() {
                Ok((seq, metadata, result)) => {
                    self.pending.insert(seq, (metadata, result));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.emit_in_order()
    }

    fn emit_in_order(&mut self) -> Result<(), PipelineError> {
        while let Some((metadata, result)) = self.pending.remove(&self.next_emit) {
            forward_output(
                &self.context,
                &self.topic,
                self.dlq.as_ref(),
                &mut self.next,
                metadata,
                result,
            )?;
            self.next_emit += 1;
        }
        Ok(())
    }
}

impl<N: PipelineStep<ProcessedMessage>> PipelineStep<MultiStoragePayload>
    for PoolTransformStep<N>
{
    fn submit(&mut self, message: BrokerMessage<MultiStoragePayload>) -> Result<(), PipelineError> {
        let Some(input) = self.input.clone() else {
            return Err(PipelineError::ChannelClosed("transform input"));
        };

        let mut job = (self.next_submit, message.metadata, message.payload);
        loop {
            match input.try_send(job) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    // Queue full: keep draining results so workers blocked on
                    // the output queue can make room, then retry.
                    job = returned;
                    self.drain_ready()?;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(PipelineError::ChannelClosed("transform input"));
                }
            }
        }
        self.next_submit += 1;
        self.drain_ready()
    }

    fn poll(&mut self) -> Result<(), PipelineError> {
        self.drain_ready()?;
        self.next.poll()
    }

    fn close(&mut self) {
        // Dropping the sender lets the workers drain the queue and exit.
        self.input = None;
    }

    fn join(&mut self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        self.input = None;
        let deadline = timeout.map(|t| Instant::now() + t);

        enum RecvFailure {
            Timeout,
            Disconnected,
        }

        while self.next_emit < self.next_submit {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.output.recv_timeout(remaining).map_err(|err| match err {
                        mpsc::RecvTimeoutError::Timeout => RecvFailure::Timeout,
                        mpsc::RecvTimeoutError::Disconnected => RecvFailure::Disconnected,
                    })
                }
                None => self.output.recv().map_err(|_| RecvFailure::Disconnected),
            };

            match received {
                Ok((seq, metadata, result)) => {
                    self.pending.insert(seq, (metadata, result));
                    self.emit_in_order()?;
                }
                Err(RecvFailure::Timeout) => {
                    return Err(PipelineError::Fatal(anyhow!(
                        "timed out waiting for transform results"
                    )));
                }
                Err(RecvFailure::Disconnected) => {
                    // Workers are gone; whatever is buffered is all there is.
                    self.emit_in_order()?;
                    if self.next_emit < self.next_submit {
                        return Err(PipelineError::ChannelClosed("transform output"));
                    }
                    break;
                }
            }
        }

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        self.next.close();
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.next.join(remaining)
    }
}
