use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Default queue for jobs that name none.
pub const DEFAULT_QUEUE: &str = "default";

/// Default maximum retry attempts before a job is moved to the dead set.
pub const DEFAULT_RETRY: i32 = 25;

pub const DEFAULT_PRIORITY: u8 = 5;

/// Default and minimum reservation window in seconds.
pub const DEFAULT_RESERVE_FOR: u64 = 1800;
pub const MIN_RESERVE_FOR: u64 = 60;

/// A unit of work as submitted by a producer and handed to a consumer.
///
/// The wire form is a JSON document; unknown keys under `custom` pass through
/// untouched. `jid` and `jobtype` are the only required fields, everything
/// else is defaulted by [`Job::normalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// Retry bookkeeping attached to a job after its first failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Failure {
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errtype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl Job {
    /// Parse a job document and apply defaults, rejecting anything a
    /// well-formed producer would never send.
    pub fn parse(raw: &str) -> Result<Job> {
        let mut job: Job = serde_json::from_str(raw)?;
        job.validate()?;
        job.normalize();
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jid.is_empty() {
            return Err(ServerError::Malformed("jid must not be empty".into()));
        }
        if self.jobtype.is_empty() {
            return Err(ServerError::Malformed("jobtype must not be empty".into()));
        }
        Ok(())
    }

    /// Fill in defaults: queue, priority (clamping out-of-range values back
    /// to the default), retry and creation time.
    pub fn normalize(&mut self) {
        if self.queue.is_empty() {
            self.queue = DEFAULT_QUEUE.to_string();
        }
        match self.priority {
            Some(p) if (1..=9).contains(&p) => {}
            _ => self.priority = Some(DEFAULT_PRIORITY),
        }
        if self.retry.is_none() {
            self.retry = Some(DEFAULT_RETRY);
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
    }

    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn retry_limit(&self) -> i32 {
        self.retry.unwrap_or(DEFAULT_RETRY)
    }

    /// Seconds a reservation for this job stays valid, clamped to the minimum.
    pub fn reservation_window(&self) -> u64 {
        self.reserve_for.unwrap_or(DEFAULT_RESERVE_FOR).max(MIN_RESERVE_FOR)
    }

    /// How many times this job has already failed.
    pub fn retry_count(&self) -> u32 {
        self.failure.as_ref().map(|f| f.retry_count).unwrap_or(0)
    }
}

/// Proof that a worker has taken a job. Created at FETCH, deleted at ACK or
/// FAIL; a reservation left past its expiry is swept back into the retry
/// path by the reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub job: Job,
    pub wid: String,
    pub expiry: DateTime<Utc>,
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(job: Job, wid: impl Into<String>, now: DateTime<Utc>) -> Self {
        let expiry = now + chrono::Duration::seconds(job.reservation_window() as i64);
        Self {
            job,
            wid: wid.into(),
            expiry,
            reserved_at: now,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}
