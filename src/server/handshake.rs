//! The mutual HI/HELLO handshake.
//!
//! The server speaks first: `+HI {"v":2[,"i":...,"s":...]}`. The client
//! answers `HELLO <json>` identifying itself and, when a password is
//! configured, proving it with a salted iterated SHA-256 hash. The whole
//! exchange must finish within the configured deadline.

use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::server::connection::Connection;
use crate::worker::ClientData;

/// Run the handshake. On success the connection's `client` is populated;
/// any error means the caller must drop the connection.
pub async fn perform(config: &ServerConfig, conn: &mut Connection) -> Result<()> {
    tokio::time::timeout(config.handshake_timeout, exchange(config, conn))
        .await
        .map_err(|_| ServerError::Internal("handshake deadline exceeded".into()))?
}

async fn exchange(config: &ServerConfig, conn: &mut Connection) -> Result<()> {
    // Around 1ms of hashing at the low end; the range keeps precomputation
    // unattractive without slowing legitimate clients noticeably.
    let iterations: u32 = rand::thread_rng().gen_range(4000..8096);
    let salt = format!("{:x}", rand::thread_rng().gen::<u64>() >> 1);

    let hi = match &config.password {
        Some(_) => json!({ "v": crate::PROTOCOL_VERSION, "i": iterations, "s": salt }),
        None => json!({ "v": crate::PROTOCOL_VERSION }),
    };
    conn.write_simple(&format!("HI {hi}")).await?;

    let line = conn
        .read_line()
        .await?
        .ok_or_else(|| ServerError::Malformed("connection closed before HELLO".into()))?;
    let payload = line
        .strip_prefix("HELLO ")
        .ok_or_else(|| ServerError::Malformed("expected HELLO".into()))?;
    let client: ClientData = serde_json::from_str(payload)?;

    if let Some(password) = &config.password {
        // Legacy clients hash exactly once even though we offered an
        // iteration count; see the protocol v1 compatibility rule.
        let rounds = if client.v >= 2 { iterations } else { 1 };
        let expected = iterated_hash(password, &salt, rounds);
        let provided = client.pwdhash.as_deref().unwrap_or("");
        if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
            conn.write_error(&ServerError::Auth).await?;
            return Err(ServerError::Auth);
        }
    }

    conn.client = client;
    conn.write_ok().await?;
    Ok(())
}

/// Iterated SHA-256: round one hashes `password || salt`, every later round
/// hashes the previous raw digest. The wire form is lowercase hex.
pub fn iterated_hash(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{password}{salt}").as_bytes());
    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }
    format!("{digest:x}")
}
