use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;
use crate::job::Reservation;
use crate::storage::{QueueStat, SortedSet, Store};

/// In-process implementation of the storage interface.
///
/// Every operation takes one short lock and never suspends while holding it,
/// which gives the linearizable-per-key behavior the core assumes of the
/// networked sorted-set backend it normally runs against.
pub struct MemoryStore {
    queues: RwLock<HashMap<String, MemoryQueue>>,
    scheduled: MemorySortedSet,
    retries: MemorySortedSet,
    dead: MemorySortedSet,
    reservations: Mutex<HashMap<String, Reservation>>,
    processed: AtomicU64,
    failures: AtomicU64,
}

/// Jobs ordered by (priority desc, push order asc). The BTreeMap key makes
/// that ordering structural: `Reverse(priority)` sorts 9 first, the sequence
/// number breaks ties in favor of the earliest push.
#[derive(Default)]
struct MemoryQueue {
    entries: BTreeMap<(Reverse<u8>, u64), Vec<u8>>,
    next_seq: u64,
    paused: bool,
}

impl MemoryQueue {
    fn push(&mut self, priority: u8, payload: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((Reverse(priority), seq), payload);
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        self.entries.pop_first().map(|(_, payload)| payload)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            scheduled: MemorySortedSet::default(),
            retries: MemorySortedSet::default(),
            dead: MemorySortedSet::default(),
            reservations: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, queue: &str, priority: u8, payload: Vec<u8>) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default().push(priority, payload);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut queues = self.queues.write().await;
        Ok(queues.get_mut(queue).filter(|q| !q.paused).and_then(MemoryQueue::pop))
    }

    async fn queue_size(&self, queue: &str) -> Result<u64> {
        let queues = self.queues.read().await;
        Ok(queues.get(queue).map(|q| q.entries.len() as u64).unwrap_or(0))
    }

    async fn queues(&self) -> Result<Vec<QueueStat>> {
        let queues = self.queues.read().await;
        let mut stats: Vec<QueueStat> = queues
            .iter()
            .map(|(name, q)| QueueStat {
                name: name.clone(),
                size: q.entries.len() as u64,
                paused: q.paused,
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    async fn remove_queue(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues.remove(queue);
        Ok(())
    }

    async fn pause_queue(&self, queue: &str, paused: bool) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default().paused = paused;
        Ok(())
    }

    fn scheduled(&self) -> &dyn SortedSet {
        &self.scheduled
    }

    fn retries(&self) -> &dyn SortedSet {
        &self.retries
    }

    fn dead(&self) -> &dyn SortedSet {
        &self.dead
    }

    async fn add_reservation(&self, reservation: Reservation) -> Result<()> {
        let mut reservations = self.reservations.lock().await;
        reservations.insert(reservation.job.jid.clone(), reservation);
        Ok(())
    }

    async fn get_reservation(&self, jid: &str) -> Result<Option<Reservation>> {
        let reservations = self.reservations.lock().await;
        Ok(reservations.get(jid).cloned())
    }

    async fn delete_reservation(&self, jid: &str) -> Result<Option<Reservation>> {
        let mut reservations = self.reservations.lock().await;
        Ok(reservations.remove(jid))
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut reservations = self.reservations.lock().await;
        let expired: Vec<String> = reservations
            .iter()
            .filter(|(_, r)| r.expired(now))
            .map(|(jid, _)| jid.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|jid| reservations.remove(jid))
            .collect())
    }

    async fn reservation_count(&self) -> Result<u64> {
        let reservations = self.reservations.lock().await;
        Ok(reservations.len() as u64)
    }

    async fn total_processed(&self) -> Result<u64> {
        Ok(self.processed.load(Ordering::Relaxed))
    }

    async fn total_failures(&self) -> Result<u64> {
        Ok(self.failures.load(Ordering::Relaxed))
    }

    async fn incr_processed(&self) -> Result<u64> {
        Ok(self.processed.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn incr_failures(&self) -> Result<u64> {
        Ok(self.failures.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn flush(&self) -> Result<()> {
        self.queues.write().await.clear();
        self.scheduled.clear().await?;
        self.retries.clear().await?;
        self.dead.clear().await?;
        self.reservations.lock().await.clear();
        self.processed.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Payloads keyed by (timestamp, insertion sequence); the sequence keeps
/// same-instant entries distinct.
#[derive(Default)]
struct MemorySortedSet {
    inner: Mutex<SortedInner>,
}

#[derive(Default)]
struct SortedInner {
    entries: BTreeMap<(DateTime<Utc>, u64), Vec<u8>>,
    next_seq: u64,
}

#[async_trait]
impl SortedSet for MemorySortedSet {
    async fn add(&self, at: DateTime<Utc>, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert((at, seq), payload);
        Ok(())
    }

    async fn remove_before(&self, ts: DateTime<Utc>) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();
        while let Some(entry) = inner.entries.first_entry() {
            if entry.key().0 > ts {
                break;
            }
            due.push(entry.remove());
        }
        Ok(due)
    }

    async fn entries(&self) -> Result<Vec<(DateTime<Utc>, Vec<u8>)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .map(|((at, _), payload)| (*at, payload.clone()))
            .collect())
    }

    async fn remove_entry(&self, at: DateTime<Utc>, payload: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .entries
            .range((at, 0)..(at, u64::MAX))
            .find(|(_, p)| p.as_slice() == payload)
            .map(|(k, _)| *k);
        match key {
            Some(key) => {
                inner.entries.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn size(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.len() as u64)
    }

    async fn clear(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let dropped = inner.entries.len() as u64;
        inner.entries.clear();
        Ok(dropped)
    }

    async fn trim(&self, max_size: usize, max_age: Duration) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut dropped = 0u64;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365_000));
        while let Some(entry) = inner.entries.first_entry() {
            if entry.key().0 >= cutoff {
                break;
            }
            entry.remove();
            dropped += 1;
        }

        while inner.entries.len() > max_size {
            inner.entries.pop_first();
            dropped += 1;
        }

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn job(jid: &str) -> Job {
        Job::parse(&format!(r#"{{"jid":"{jid}","jobtype":"T"}}"#)).unwrap()
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let store = MemoryStore::new();
        store.push("q", 3, b"lo".to_vec()).await.unwrap();
        store.push("q", 9, b"hi".to_vec()).await.unwrap();
        store.push("q", 5, b"mid".to_vec()).await.unwrap();

        assert_eq!(store.pop("q").await.unwrap().unwrap(), b"hi");
        assert_eq!(store.pop("q").await.unwrap().unwrap(), b"mid");
        assert_eq!(store.pop("q").await.unwrap().unwrap(), b"lo");
        assert!(store.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.push("q", 5, format!("job{i}").into_bytes()).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(
                store.pop("q").await.unwrap().unwrap(),
                format!("job{i}").into_bytes()
            );
        }
    }

    #[tokio::test]
    async fn test_paused_queue_pops_nothing() {
        let store = MemoryStore::new();
        store.push("q", 5, b"a".to_vec()).await.unwrap();
        store.pause_queue("q", true).await.unwrap();
        assert!(store.pop("q").await.unwrap().is_none());
        assert_eq!(store.queue_size("q").await.unwrap(), 1);

        store.pause_queue("q", false).await.unwrap();
        assert_eq!(store.pop("q").await.unwrap().unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let store = MemoryStore::new();
        store.push("alpha", 5, b"a".to_vec()).await.unwrap();
        store.push("beta", 5, b"b".to_vec()).await.unwrap();
        store.push("beta", 5, b"c".to_vec()).await.unwrap();

        let stats = store.queues().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "alpha");
        assert_eq!(stats[0].size, 1);
        assert_eq!(stats[1].name, "beta");
        assert_eq!(stats[1].size, 2);

        store.remove_queue("beta").await.unwrap();
        assert_eq!(store.queues().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_remove_before() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let set = store.scheduled();

        set.add(now - chrono::Duration::seconds(10), b"past".to_vec()).await.unwrap();
        set.add(now, b"now".to_vec()).await.unwrap();
        set.add(now + chrono::Duration::seconds(10), b"future".to_vec()).await.unwrap();

        let due = set.remove_before(now).await.unwrap();
        assert_eq!(due, vec![b"past".to_vec(), b"now".to_vec()]);
        assert_eq!(set.size().await.unwrap(), 1);

        // A second sweep sees nothing: the first take was a removal.
        assert!(set.remove_before(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_remove_entry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let set = store.retries();

        set.add(now, b"a".to_vec()).await.unwrap();
        set.add(now, b"b".to_vec()).await.unwrap();

        assert!(set.remove_entry(now, b"a").await.unwrap());
        assert!(!set.remove_entry(now, b"a").await.unwrap());
        assert_eq!(set.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_trim() {
        let store = MemoryStore::new();
        let set = store.dead();
        let now = Utc::now();

        // One entry far past the age cap, five recent ones.
        set.add(now - chrono::Duration::days(200), b"ancient".to_vec()).await.unwrap();
        for i in 0..5 {
            set.add(now, format!("d{i}").into_bytes()).await.unwrap();
        }

        let dropped = set
            .trim(3, Duration::from_secs(180 * 24 * 3600))
            .await
            .unwrap();
        // The ancient entry goes for age, then the two oldest for size.
        assert_eq!(dropped, 3);
        assert_eq!(set.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reservations() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let res = Reservation::new(job("j1"), "w1", now);
        store.add_reservation(res).await.unwrap();
        assert_eq!(store.reservation_count().await.unwrap(), 1);
        assert!(store.get_reservation("j1").await.unwrap().is_some());

        let removed = store.delete_reservation("j1").await.unwrap();
        assert_eq!(removed.unwrap().job.jid, "j1");
        assert!(store.delete_reservation("j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_reservations() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .add_reservation(Reservation::new(job("fresh"), "w1", now))
            .await
            .unwrap();
        let mut stale = Reservation::new(job("stale"), "w1", now);
        stale.expiry = now - chrono::Duration::seconds(5);
        store.add_reservation(stale).await.unwrap();

        let expired = store.expired_reservations(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].job.jid, "stale");
        // Expired reservations are removed by the scan.
        assert_eq!(store.reservation_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_resets_everything() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.push("q", 5, b"a".to_vec()).await.unwrap();
        store.scheduled().add(now, b"s".to_vec()).await.unwrap();
        store
            .add_reservation(Reservation::new(job("j1"), "w1", now))
            .await
            .unwrap();
        store.incr_processed().await.unwrap();
        store.incr_failures().await.unwrap();

        store.flush().await.unwrap();

        assert_eq!(store.queue_size("q").await.unwrap(), 0);
        assert_eq!(store.scheduled().size().await.unwrap(), 0);
        assert_eq!(store.reservation_count().await.unwrap(), 0);
        assert_eq!(store.total_processed().await.unwrap(), 0);
        assert_eq!(store.total_failures().await.unwrap(), 0);
    }
}
