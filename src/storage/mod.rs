//! The storage interface the core consumes.
//!
//! The core only ever talks to [`Store`]: named priority queues, three
//! time-sorted sets (scheduled, retries, dead), a reservation map and two
//! monotone counters. Payloads are opaque serialized job documents; all
//! ordering guarantees within a queue come from the store's atomic
//! primitives, which must be linearizable per key.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::job::Reservation;

pub mod memory;

pub use memory::MemoryStore;

/// Cached per-queue bookkeeping surfaced by INFO and the queue admin verbs.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStat {
    pub name: String,
    pub size: u64,
    pub paused: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Append a payload to the named queue, creating it on first use.
    /// `priority` orders fetches within the queue (9 before 5 before 1);
    /// equal priorities keep push order.
    async fn push(&self, queue: &str, priority: u8, payload: Vec<u8>) -> Result<()>;

    /// Pop the front payload: highest priority, earliest push. Returns
    /// `None` when the queue is empty, missing, or paused.
    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    async fn queue_size(&self, queue: &str) -> Result<u64>;

    /// Every known queue with its cached size.
    async fn queues(&self) -> Result<Vec<QueueStat>>;

    async fn remove_queue(&self, queue: &str) -> Result<()>;

    async fn pause_queue(&self, queue: &str, paused: bool) -> Result<()>;

    fn scheduled(&self) -> &dyn SortedSet;
    fn retries(&self) -> &dyn SortedSet;
    fn dead(&self) -> &dyn SortedSet;

    async fn add_reservation(&self, reservation: Reservation) -> Result<()>;
    async fn get_reservation(&self, jid: &str) -> Result<Option<Reservation>>;
    /// Remove and return the reservation for `jid`, if any. Acknowledge and
    /// fail both funnel through this so a jid can only be settled once.
    async fn delete_reservation(&self, jid: &str) -> Result<Option<Reservation>>;
    /// Remove and return every reservation whose expiry is at or before `now`.
    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;
    async fn reservation_count(&self) -> Result<u64>;

    async fn total_processed(&self) -> Result<u64>;
    async fn total_failures(&self) -> Result<u64>;
    async fn incr_processed(&self) -> Result<u64>;
    async fn incr_failures(&self) -> Result<u64>;

    /// Clear all queues, sets, reservations and counters.
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A collection of payloads sorted by timestamp: the shape shared by the
/// scheduled, retries and dead sets.
#[async_trait]
pub trait SortedSet: Send + Sync {
    async fn add(&self, at: DateTime<Utc>, payload: Vec<u8>) -> Result<()>;

    /// Atomically remove and return every payload scored at or before `ts`,
    /// oldest first. Two concurrent sweeps never see the same entry.
    async fn remove_before(&self, ts: DateTime<Utc>) -> Result<Vec<Vec<u8>>>;

    /// Snapshot of all entries, oldest first. Admin-surface only; the hot
    /// paths never call this.
    async fn entries(&self) -> Result<Vec<(DateTime<Utc>, Vec<u8>)>>;

    /// Remove one specific entry. Returns false if it was already gone.
    async fn remove_entry(&self, at: DateTime<Utc>, payload: &[u8]) -> Result<bool>;

    async fn size(&self) -> Result<u64>;

    /// Remove everything, returning the number of entries dropped.
    async fn clear(&self) -> Result<u64>;

    /// Enforce size and age caps, dropping oldest entries first. Returns the
    /// number of entries dropped.
    async fn trim(&self, max_size: usize, max_age: Duration) -> Result<u64>;
}
