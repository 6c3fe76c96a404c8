//! # Hopper I/O - Broker and Column-Store Plumbing
//!
//! This crate provides the I/O half of the hopper pipeline: the per-batch
//! collector that groups processed rows, replacements, and commit-log
//! records into a single flush; the size/time-bounded batcher driving it
//! from a single background flush worker; and the concrete ClickHouse and
//! Kafka endpoints those components write to.
//!
//! ## Delivery model
//!
//! Batches are written at-least-once: a batch's offsets commit only after
//! its bulk insert has been confirmed and every producer involved in the
//! batch has flushed. A failed flush halts the consumer without committing,
//! so the host restarts from the last durable position.

/// Per-batch collector composing insert, replacement, and commit-log writers
pub mod collect;

/// Kafka producers surfacing delivery errors at join time
pub mod producer;

/// Size- and time-bounded batcher with the single flush worker
pub mod reduce;

/// ClickHouse bulk inserts over HTTP
pub mod sink_clickhouse;

/// Kafka consumer runner and processing strategy factory
pub mod source_kafka;
