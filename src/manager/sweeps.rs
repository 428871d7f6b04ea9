//! Background sweeps registered with the task runner.
//!
//! Each sweep is a thin [`Taskable`] over a manager operation; all the
//! state-machine logic stays in the manager where it can be tested without
//! a ticker.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::manager::Manager;
use crate::tasks::Taskable;

/// Promotes due entries of the scheduled set into their queues.
pub struct ScheduledSweep {
    manager: Arc<Manager>,
}

impl ScheduledSweep {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Taskable for ScheduledSweep {
    fn name(&self) -> &'static str {
        "scheduled"
    }

    async fn execute(&self) -> Result<()> {
        let promoted = self.manager.enqueue_scheduled().await?;
        if promoted > 0 {
            tracing::debug!(count = promoted, "Promoted scheduled jobs");
        }
        Ok(())
    }
}

/// Promotes due entries of the retries set into their queues.
pub struct RetrySweep {
    manager: Arc<Manager>,
}

impl RetrySweep {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Taskable for RetrySweep {
    fn name(&self) -> &'static str {
        "retries"
    }

    async fn execute(&self) -> Result<()> {
        let promoted = self.manager.enqueue_retries().await?;
        if promoted > 0 {
            tracing::debug!(count = promoted, "Promoted retryable jobs");
        }
        Ok(())
    }
}

/// Returns jobs whose reservation expired to the retry path.
pub struct ReservationReaper {
    manager: Arc<Manager>,
}

impl ReservationReaper {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Taskable for ReservationReaper {
    fn name(&self) -> &'static str {
        "reservations"
    }

    async fn execute(&self) -> Result<()> {
        self.manager.reap_expired_reservations().await?;
        Ok(())
    }
}

/// Enforces the dead set's size and age caps.
pub struct DeadTrim {
    manager: Arc<Manager>,
}

impl DeadTrim {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Taskable for DeadTrim {
    fn name(&self) -> &'static str {
        "dead_trim"
    }

    async fn execute(&self) -> Result<()> {
        let dropped = self.manager.trim_dead().await?;
        if dropped > 0 {
            tracing::info!(count = dropped, "Trimmed dead set");
        }
        Ok(())
    }
}
