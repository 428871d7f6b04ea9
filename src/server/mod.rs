//! Server lifecycle and the connection accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::manager::sweeps::{DeadTrim, ReservationReaper, RetrySweep, ScheduledSweep};
use crate::manager::Manager;
use crate::server::commands::Disposition;
use crate::server::connection::Connection;
use crate::storage::{MemoryStore, Store};
use crate::tasks::TaskRunner;
use crate::worker::{WorkerReaper, WorkerRegistry, WorkerState};

pub mod commands;
pub mod connection;
pub mod handshake;

/// Hot counters kept outside the server mutex so the fast paths never
/// widen a critical section.
pub struct RuntimeStats {
    pub connections: AtomicU64,
    pub commands: AtomicU64,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    stats: RuntimeStats,
    store: Arc<dyn Store>,
    manager: Arc<Manager>,
    workers: Arc<RwLock<WorkerRegistry>>,
    task_runner: Arc<TaskRunner>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the listener and wire every subsystem together: store, manager,
    /// worker registry and the periodic sweeps.
    pub async fn new(config: ServerConfig) -> Result<Arc<Server>> {
        Self::with_store(config, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(config: ServerConfig, store: Arc<dyn Store>) -> Result<Arc<Server>> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let manager = Arc::new(Manager::new(store.clone(), &config));
        let workers = Arc::new(RwLock::new(WorkerRegistry::new()));

        let mut task_runner = TaskRunner::new();
        task_runner.add_task(
            config.sweep_interval_secs,
            Arc::new(ScheduledSweep::new(manager.clone())),
        );
        task_runner.add_task(
            config.sweep_interval_secs,
            Arc::new(RetrySweep::new(manager.clone())),
        );
        task_runner.add_task(
            config.reaper_interval_secs,
            Arc::new(ReservationReaper::new(manager.clone())),
        );
        task_runner.add_task(
            config.reaper_interval_secs,
            Arc::new(WorkerReaper::new(workers.clone(), config.heartbeat_timeout)),
        );
        task_runner.add_task(
            config.dead_trim_interval_secs,
            Arc::new(DeadTrim::new(manager.clone())),
        );

        Ok(Arc::new(Server {
            config,
            stats: RuntimeStats {
                connections: AtomicU64::new(0),
                commands: AtomicU64::new(0),
                started_at: Instant::now(),
            },
            store,
            manager,
            workers,
            task_runner: Arc::new(task_runner),
            listener: Mutex::new(Some(listener)),
            local_addr,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn workers(&self) -> &Arc<RwLock<WorkerRegistry>> {
        &self.workers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Run the accept loop until shutdown. Each accepted connection is
    /// handled by its own task; the periodic task runner is spawned
    /// alongside.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = {
            let mut slot = self.listener.lock().await;
            slot.take()
                .ok_or_else(|| ServerError::Internal("server already running".into()))?
        };

        tokio::spawn(self.task_runner.clone().run(self.shutdown.clone()));

        tracing::info!(addr = %self.local_addr, "Listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(error) => {
                    tracing::warn!(%error, "Failed to accept connection");
                    continue;
                }
            };

            if self.is_closed() {
                break;
            }

            let server = self.clone();
            tokio::spawn(async move {
                handle_connection(server, socket, peer).await;
            });
        }

        // Dropping the listener here refuses every connect attempt from now
        // on while in-flight handlers drain.
        drop(listener);
        Ok(())
    }

    /// Graceful stop: refuse new work, tell workers to terminate, give
    /// in-flight handshakes a moment to settle, then close the store.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.workers.write().await.signal_all(WorkerState::Terminate);
        self.shutdown.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Err(error) = self.store.close().await {
            tracing::warn!(%error, "Error closing store");
        }
        tracing::info!("Server stopped");
    }

    /// Build the INFO payload.
    pub async fn current_state(&self) -> Result<serde_json::Value> {
        let default_size = self.store.queue_size(crate::job::DEFAULT_QUEUE).await?;
        let queues = self.store.queues().await?;
        let total_enqueued: u64 = queues.iter().map(|q| q.size).sum();

        Ok(json!({
            "server_utc_time": chrono::Utc::now().format("%I:%M:%S UTC").to_string(),
            "faktory": {
                "default_size": default_size,
                "total_failures": self.store.total_failures().await?,
                "total_processed": self.store.total_processed().await?,
                "total_enqueued": total_enqueued,
                "total_queues": queues.len(),
                "tasks": self.task_runner.stats(),
            },
            "server": {
                "faktory_version": crate::VERSION,
                "uptime": self.stats.started_at.elapsed().as_secs(),
                "connections": self.stats.connections.load(Ordering::Relaxed),
                "command_count": self.stats.commands.load(Ordering::Relaxed),
                "used_memory_mb": used_memory_mb(),
            },
        }))
    }
}

async fn handle_connection(server: Arc<Server>, socket: TcpStream, peer: SocketAddr) {
    if let Err(error) = socket.set_nodelay(true) {
        tracing::debug!(%peer, %error, "set_nodelay failed");
    }

    let mut conn = Connection::new(socket, peer);
    tracing::debug!(%peer, "Accepted connection");

    if let Err(error) = handshake::perform(server.config(), &mut conn).await {
        tracing::info!(%peer, %error, "Handshake failed");
        return;
    }

    // A wid marks this connection as a consumer; register it so BEAT
    // signalling and the heartbeat reaper can see it.
    let conn_token = server.shutdown.child_token();
    if let Some(wid) = conn.wid().map(str::to_string) {
        let conn_id = server.workers.write().await.register_connection(
            &wid,
            conn.client.clone(),
            conn_token.clone(),
        );
        conn.registration = Some((wid, conn_id));
    }

    server.stats.connections.fetch_add(1, Ordering::Relaxed);
    process_lines(&server, &mut conn, conn_token).await;
    server.stats.connections.fetch_sub(1, Ordering::Relaxed);

    if let Some((wid, conn_id)) = conn.registration.take() {
        server.workers.write().await.remove_connection(&wid, conn_id);
    }
    tracing::debug!(%peer, "Closed connection");
}

async fn process_lines(server: &Arc<Server>, conn: &mut Connection, token: CancellationToken) {
    loop {
        let line = tokio::select! {
            line = conn.read_line() => line,
            _ = token.cancelled() => {
                let _ = conn.write_error(&ServerError::Shutdown).await;
                return;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(error) => {
                tracing::debug!(peer = %conn.peer, %error, "Read failed");
                return;
            }
        };

        if server.is_closed() {
            let _ = conn.write_error(&ServerError::Shutdown).await;
            return;
        }

        match commands::dispatch(server, conn, &line).await {
            Ok(Disposition::Continue) => {}
            Ok(Disposition::Close) => return,
            Err(error) => {
                tracing::debug!(peer = %conn.peer, %error, "Write failed");
                return;
            }
        }
    }
}

/// Resident set size in megabytes, read from procfs. Zero when unavailable.
fn used_memory_mb() -> u64 {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return 0,
    };
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
        .unwrap_or(0)
}
