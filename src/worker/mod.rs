//! Worker liveness tracking.
//!
//! An in-memory mapping from worker id to its client data, heartbeat time,
//! desired state and open connections. Only the dispatcher mutates entries;
//! the heartbeat reaper scans and deletes them. The registry never calls
//! back into a connection: it holds a cancellation token per connection and
//! force-closing is just cancelling those tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::tasks::Taskable;

/// Client identity sent in the HELLO payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientData {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub wid: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pwdhash: Option<String>,
    /// Client protocol version; pre-v2 clients hash with a single iteration.
    #[serde(default = "default_version")]
    pub v: u32,
}

fn default_version() -> u32 {
    1
}

/// Desired lifecycle state the server wants a worker to move to, delivered
/// as the reply to its next BEAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Running,
    Quiet,
    Terminate,
}

impl WorkerState {
    /// The signal value carried in a BEAT reply, if any.
    pub fn signal(self) -> Option<&'static str> {
        match self {
            WorkerState::Running => None,
            WorkerState::Quiet => Some("quiet"),
            WorkerState::Terminate => Some("terminate"),
        }
    }
}

#[derive(Debug)]
pub struct WorkerEntry {
    pub client: ClientData,
    pub last_heartbeat: Instant,
    pub state: WorkerState,
    connections: HashMap<u64, CancellationToken>,
}

impl WorkerEntry {
    fn new(client: ClientData) -> Self {
        Self {
            client,
            last_heartbeat: Instant::now(),
            state: WorkerState::Running,
            connections: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerEntry>,
    next_conn_id: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer connection under its worker id, creating the
    /// entry on first contact. Returns the connection's registration id,
    /// which the dispatcher hands back on cleanup.
    pub fn register_connection(
        &mut self,
        wid: &str,
        client: ClientData,
        token: CancellationToken,
    ) -> u64 {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let entry = self
            .workers
            .entry(wid.to_string())
            .or_insert_with(|| {
                tracing::info!(wid, "Worker registered");
                WorkerEntry::new(client)
            });
        entry.last_heartbeat = Instant::now();
        entry.connections.insert(conn_id, token);
        conn_id
    }

    /// Remove one connection from its worker's set. The entry itself stays;
    /// the reaper owns entry removal.
    pub fn remove_connection(&mut self, wid: &str, conn_id: u64) {
        if let Some(entry) = self.workers.get_mut(wid) {
            entry.connections.remove(&conn_id);
        }
    }

    /// Record a heartbeat and return the state the worker should move to.
    /// An unknown wid is re-registered on the spot; workers survive server
    /// registry reaps as long as they keep beating.
    pub fn beat(&mut self, wid: &str) -> WorkerState {
        let entry = self
            .workers
            .entry(wid.to_string())
            .or_insert_with(|| WorkerEntry::new(ClientData::default()));
        entry.last_heartbeat = Instant::now();
        entry.state
    }

    pub fn quiet(&mut self, wid: &str) -> bool {
        self.signal(wid, WorkerState::Quiet)
    }

    pub fn terminate(&mut self, wid: &str) -> bool {
        self.signal(wid, WorkerState::Terminate)
    }

    fn signal(&mut self, wid: &str, state: WorkerState) -> bool {
        match self.workers.get_mut(wid) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Ask every known worker to move to the given state.
    pub fn signal_all(&mut self, state: WorkerState) {
        for entry in self.workers.values_mut() {
            entry.state = state;
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, wid: &str) -> Option<&WorkerEntry> {
        self.workers.get(wid)
    }

    /// Drop workers that stopped heartbeating. Entries silent past
    /// `force_after` also get their remaining connections force-closed.
    /// Returns the dropped worker ids.
    pub fn reap(&mut self, timeout: Duration, force_after: Duration) -> Vec<String> {
        let mut dropped = Vec::new();
        self.workers.retain(|wid, entry| {
            let age = entry.last_heartbeat.elapsed();
            if age < timeout {
                return true;
            }
            if age >= force_after {
                for token in entry.connections.values() {
                    token.cancel();
                }
                tracing::warn!(wid = %wid, connections = entry.connections.len(), "Force-closing silent worker");
            }
            dropped.push(wid.clone());
            false
        });
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "Reaped silent workers");
        }
        dropped
    }
}

/// Periodic task that reaps workers whose heartbeats went silent.
pub struct WorkerReaper {
    registry: Arc<RwLock<WorkerRegistry>>,
    timeout: Duration,
}

impl WorkerReaper {
    pub fn new(registry: Arc<RwLock<WorkerRegistry>>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }
}

#[async_trait]
impl Taskable for WorkerReaper {
    fn name(&self) -> &'static str {
        "heartbeats"
    }

    async fn execute(&self) -> Result<()> {
        let mut registry = self.registry.write().await;
        registry.reap(self.timeout, self.timeout * 2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(wid: &str) -> ClientData {
        ClientData {
            wid: Some(wid.to_string()),
            hostname: Some("host1".to_string()),
            pid: Some(42),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_beat_returns_desired_state() {
        let mut registry = WorkerRegistry::new();
        registry.register_connection("w1", client("w1"), CancellationToken::new());

        assert_eq!(registry.beat("w1"), WorkerState::Running);

        assert!(registry.quiet("w1"));
        assert_eq!(registry.beat("w1"), WorkerState::Quiet);

        assert!(registry.terminate("w1"));
        assert_eq!(registry.beat("w1"), WorkerState::Terminate);
    }

    #[tokio::test]
    async fn test_beat_auto_registers() {
        let mut registry = WorkerRegistry::new();
        assert_eq!(registry.beat("ghost"), WorkerState::Running);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_unknown_worker() {
        let mut registry = WorkerRegistry::new();
        assert!(!registry.quiet("nobody"));
    }

    #[tokio::test]
    async fn test_connection_cleanup_keeps_entry() {
        let mut registry = WorkerRegistry::new();
        let c1 = registry.register_connection("w1", client("w1"), CancellationToken::new());
        let c2 = registry.register_connection("w1", client("w1"), CancellationToken::new());
        assert_ne!(c1, c2);
        assert_eq!(registry.len(), 1);

        registry.remove_connection("w1", c1);
        registry.remove_connection("w1", c2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_drops_silent_workers() {
        let mut registry = WorkerRegistry::new();
        registry.register_connection("silent", client("silent"), CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.register_connection("fresh", client("fresh"), CancellationToken::new());

        let dropped = registry.reap(Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(dropped, vec!["silent".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_force_closes_after_double_timeout() {
        let mut registry = WorkerRegistry::new();
        let token = CancellationToken::new();
        registry.register_connection("w1", client("w1"), token.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let dropped = registry.reap(Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(dropped, vec!["w1".to_string()]);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_within_timeout_cancels_nothing() {
        let mut registry = WorkerRegistry::new();
        let token = CancellationToken::new();
        registry.register_connection("w1", client("w1"), token.clone());

        tokio::time::sleep(Duration::from_millis(70)).await;
        let dropped = registry.reap(Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(dropped, vec!["w1".to_string()]);
        // Dropped from the registry but its socket is left alone.
        assert!(!token.is_cancelled());
    }
}
