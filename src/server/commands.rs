//! Command handlers.
//!
//! The dispatcher parses a line into a typed [`Command`] and routes it
//! here. Handler failures are serialized back to the client as tagged
//! errors and leave the connection open; only I/O failures and `END`
//! close it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::protocol::command::{Command, QueueAction};
use crate::server::connection::Connection;
use crate::server::Server;

/// What the command loop should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Parse and run one command line. Returns `Err` only for connection-fatal
/// I/O failures.
pub async fn dispatch(
    server: &Arc<Server>,
    conn: &mut Connection,
    line: &str,
) -> crate::error::Result<Disposition> {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(error) => {
            tracing::debug!(peer = %conn.peer, %error, "Rejected command");
            conn.write_error(&error).await?;
            return Ok(Disposition::Continue);
        }
    };

    server.stats().commands.fetch_add(1, Ordering::Relaxed);

    let outcome = execute(server, conn, command).await;
    match outcome {
        Ok(disposition) => Ok(disposition),
        Err(error) => {
            // The command failed but the connection is fine: report and
            // keep reading.
            tracing::warn!(peer = %conn.peer, %error, "Command failed");
            conn.write_error(&error).await?;
            Ok(Disposition::Continue)
        }
    }
}

async fn execute(
    server: &Arc<Server>,
    conn: &mut Connection,
    command: Command,
) -> crate::error::Result<Disposition> {
    match command {
        Command::Push(job) => {
            server.manager().push(*job).await?;
            conn.write_ok().await?;
        }
        Command::Fetch { queues } => {
            let wid = conn.wid().unwrap_or("").to_string();
            let payload = server.manager().fetch(&wid, &queues).await?;
            conn.write_blob(payload.as_deref()).await?;
        }
        Command::Ack { jid } => {
            server.manager().ack(&jid).await?;
            conn.write_ok().await?;
        }
        Command::Fail(payload) => {
            server
                .manager()
                .fail(
                    &payload.jid,
                    payload.errtype,
                    payload.message,
                    payload.backtrace,
                )
                .await?;
            conn.write_ok().await?;
        }
        Command::Beat(payload) => {
            let state = server.workers().write().await.beat(&payload.wid);
            if let Some(reported) = payload.current_state {
                tracing::debug!(wid = %payload.wid, state = %reported, "Worker reported state");
            }
            match state.signal() {
                None => conn.write_ok().await?,
                Some(signal) => {
                    conn.write_simple(&format!(r#"{{"state":"{signal}"}}"#))
                        .await?
                }
            }
        }
        Command::Info => {
            let state = server.current_state().await?;
            let body = serde_json::to_vec(&state)?;
            conn.write_blob(Some(&body)).await?;
        }
        Command::Flush => {
            tracing::warn!(peer = %conn.peer, "Flushing all job state");
            server.manager().flush().await?;
            conn.write_ok().await?;
        }
        Command::Mutate(op) => {
            let affected = server.manager().mutate(op).await?;
            tracing::info!(peer = %conn.peer, affected, "MUTATE applied");
            conn.write_ok().await?;
        }
        Command::Queue(op) => {
            match op.action {
                QueueAction::Pause => server.manager().pause_queues(&op.queues, true).await?,
                QueueAction::Resume => server.manager().pause_queues(&op.queues, false).await?,
                QueueAction::Remove => server.manager().remove_queues(&op.queues).await?,
            }
            conn.write_ok().await?;
        }
        Command::End => {
            conn.write_ok().await?;
            return Ok(Disposition::Close);
        }
    }
    Ok(Disposition::Continue)
}
