//! The job manager: pure logic over the storage interface.
//!
//! Owns the per-job state machine. A job lives in exactly one of five
//! places at any instant: a queue, the scheduled set, a reservation, the
//! retries set, or the dead set. Every operation here moves a job between
//! those places or settles it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::job::{Failure, Job, Reservation};
use crate::protocol::command::{
    wildcard_match, MutateCommand, MutateFilter, MutateOperation, MutateTarget,
};
use crate::storage::{SortedSet, Store};

pub mod sweeps;

pub struct Manager {
    store: Arc<dyn Store>,
    /// Wakes parked FETCHes when work may have arrived.
    fetch_signal: Notify,
    fetch_timeout: Duration,
    dead_max_size: usize,
    dead_max_age: Duration,
}

impl Manager {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            fetch_signal: Notify::new(),
            fetch_timeout: config.fetch_timeout,
            dead_max_size: config.dead_max_size,
            dead_max_age: config.dead_max_age,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Accept a job: future `at` goes to the scheduled set, everything else
    /// straight to its queue.
    pub async fn push(&self, mut job: Job) -> Result<()> {
        job.validate()?;
        job.normalize();

        let now = Utc::now();
        if let Some(at) = job.at {
            if at > now {
                let payload = serde_json::to_vec(&job)?;
                self.store.scheduled().add(at, payload).await?;
                tracing::debug!(jid = %job.jid, at = %at, "Job scheduled");
                return Ok(());
            }
        }
        self.enqueue(job).await
    }

    /// Append a job to its queue and wake any parked FETCH.
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.enqueued_at = Some(Utc::now());
        let payload = serde_json::to_vec(&job)?;
        self.store.push(&job.queue, job.priority(), payload).await?;
        tracing::debug!(jid = %job.jid, queue = %job.queue, "Job enqueued");
        self.fetch_signal.notify_waiters();
        Ok(())
    }

    /// Reserve the next job from the given queues, tried in caller order.
    ///
    /// Misses park on the fetch signal (fed by push and the sweepers) up to
    /// the configured bound, re-scanning after each wake. A hit persists a
    /// reservation before the payload is handed out, so an unacked job is
    /// never lost to a dropped connection.
    pub async fn fetch(&self, wid: &str, queues: &[String]) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + self.fetch_timeout;

        loop {
            // Register interest before scanning so a push that lands between
            // the scan and the park still wakes us.
            let notified = self.fetch_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for queue in queues {
                if let Some(payload) = self.store.pop(queue).await? {
                    let job: Job = serde_json::from_slice(&payload)?;
                    let jid = job.jid.clone();
                    let reservation = Reservation::new(job, wid, Utc::now());
                    self.store.add_reservation(reservation).await?;
                    tracing::debug!(jid = %jid, queue = %queue, wid = %wid, "Job reserved");
                    return Ok(Some(payload));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Settle a reservation successfully. Acking an unknown jid is not an
    /// error; the reaper may have got there first.
    pub async fn ack(&self, jid: &str) -> Result<bool> {
        match self.store.delete_reservation(jid).await? {
            Some(_) => {
                self.store.incr_processed().await?;
                tracing::debug!(jid = %jid, "Job acknowledged");
                Ok(true)
            }
            None => {
                tracing::debug!(jid = %jid, "ACK for unknown jid ignored");
                Ok(false)
            }
        }
    }

    /// Settle a reservation as failed and route the job onward: back to the
    /// retries set with a backoff while attempts remain, to the dead set
    /// once exhausted, discarded entirely when retry is disabled.
    pub async fn fail(
        &self,
        jid: &str,
        errtype: Option<String>,
        message: Option<String>,
        backtrace: Vec<String>,
    ) -> Result<bool> {
        match self.store.delete_reservation(jid).await? {
            Some(reservation) => {
                self.retry_later(reservation.job, errtype, message, backtrace)
                    .await?;
                self.store.incr_failures().await?;
                Ok(true)
            }
            None => {
                tracing::debug!(jid = %jid, "FAIL for unknown jid ignored");
                Ok(false)
            }
        }
    }

    async fn retry_later(
        &self,
        mut job: Job,
        errtype: Option<String>,
        message: Option<String>,
        backtrace: Vec<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let limit = job.retry_limit();
        let count = job.retry_count() + 1;

        if limit < 0 {
            tracing::debug!(jid = %job.jid, "Retry disabled, discarding failed job");
            return Ok(());
        }

        let mut failure = Failure {
            retry_count: count,
            failed_at: Some(now),
            next_at: None,
            message,
            errtype,
            backtrace,
        };

        if limit > 0 && count < limit as u32 {
            let next_at = now + chrono::Duration::seconds(retry_backoff(count));
            failure.next_at = Some(next_at);
            job.failure = Some(failure);
            let payload = serde_json::to_vec(&job)?;
            self.store.retries().add(next_at, payload).await?;
            tracing::debug!(jid = %job.jid, retry_count = count, next_at = %next_at, "Job will retry");
        } else {
            job.failure = Some(failure);
            self.bury(job, now).await?;
        }
        Ok(())
    }

    async fn bury(&self, job: Job, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_vec(&job)?;
        let dead = self.store.dead();
        dead.add(now, payload).await?;
        dead.trim(self.dead_max_size, self.dead_max_age).await?;
        tracing::info!(jid = %job.jid, jobtype = %job.jobtype, "Job moved to dead set");
        Ok(())
    }

    /// Promote every due entry of `set` into its queue. Shared by the
    /// scheduled and retry sweepers.
    async fn promote_due(&self, set: &dyn SortedSet) -> Result<usize> {
        let due = set.remove_before(Utc::now()).await?;
        let count = due.len();
        for payload in due {
            let job: Job = serde_json::from_slice(&payload)?;
            self.enqueue(job).await?;
        }
        Ok(count)
    }

    pub async fn enqueue_scheduled(&self) -> Result<usize> {
        self.promote_due(self.store.scheduled()).await
    }

    pub async fn enqueue_retries(&self) -> Result<usize> {
        self.promote_due(self.store.retries()).await
    }

    /// Route every expired reservation through the failure path, exactly as
    /// if the owning worker had sent FAIL.
    pub async fn reap_expired_reservations(&self) -> Result<usize> {
        let expired = self.store.expired_reservations(Utc::now()).await?;
        let count = expired.len();
        for reservation in expired {
            tracing::warn!(
                jid = %reservation.job.jid,
                wid = %reservation.wid,
                "Reservation expired, returning job"
            );
            self.retry_later(
                reservation.job,
                None,
                Some("reservation expired".to_string()),
                Vec::new(),
            )
            .await?;
            self.store.incr_failures().await?;
        }
        if count > 0 {
            self.fetch_signal.notify_waiters();
        }
        Ok(count)
    }

    pub async fn trim_dead(&self) -> Result<u64> {
        self.store
            .dead()
            .trim(self.dead_max_size, self.dead_max_age)
            .await
    }

    /// Apply an admin operation to one of the sorted sets. Returns the
    /// number of entries affected.
    pub async fn mutate(&self, op: MutateOperation) -> Result<u64> {
        let set = match op.target {
            MutateTarget::Scheduled => self.store.scheduled(),
            MutateTarget::Retries => self.store.retries(),
            MutateTarget::Dead => self.store.dead(),
        };

        if op.cmd == MutateCommand::Clear {
            return set.clear().await;
        }

        let filter = op.filter.unwrap_or_default();
        let mut affected = 0u64;
        for (at, payload) in set.entries().await? {
            if !filter_matches(&filter, &payload) {
                continue;
            }
            if !set.remove_entry(at, &payload).await? {
                // Raced with a sweep; the entry found a queue on its own.
                continue;
            }
            affected += 1;
            let job: Job = serde_json::from_slice(&payload)?;
            match op.cmd {
                MutateCommand::Kill => self.bury(job, Utc::now()).await?,
                MutateCommand::Requeue => self.enqueue(job).await?,
                MutateCommand::Discard => {
                    tracing::debug!(jid = %job.jid, "Job discarded by MUTATE");
                }
                MutateCommand::Clear => unreachable!("handled above"),
            }
        }
        Ok(affected)
    }

    pub async fn pause_queues(&self, queues: &[String], paused: bool) -> Result<()> {
        for queue in queues {
            self.store.pause_queue(queue, paused).await?;
        }
        if !paused {
            self.fetch_signal.notify_waiters();
        }
        Ok(())
    }

    pub async fn remove_queues(&self, queues: &[String]) -> Result<()> {
        for queue in queues {
            self.store.remove_queue(queue).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

/// Seconds until the next attempt after the `retry_count`th failure.
fn retry_backoff(retry_count: u32) -> i64 {
    let count = retry_count as i64;
    count.pow(4) + 15 + rand::thread_rng().gen_range(0..30) * (count + 1)
}

/// Every specified filter field must match; an empty filter matches all.
fn filter_matches(filter: &MutateFilter, payload: &[u8]) -> bool {
    let job: Job = match serde_json::from_slice(payload) {
        Ok(job) => job,
        Err(_) => return false,
    };
    if !filter.jids.is_empty() && !filter.jids.iter().any(|jid| *jid == job.jid) {
        return false;
    }
    if let Some(jobtype) = &filter.jobtype {
        if *jobtype != job.jobtype {
            return false;
        }
    }
    if let Some(pattern) = &filter.regexp {
        let text = String::from_utf8_lossy(payload);
        if !wildcard_match(pattern, &text) {
            return false;
        }
    }
    true
}
