use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, ServerError};
use crate::protocol::reply;
use crate::worker::ClientData;

/// One accepted client connection.
///
/// Owns both stream halves plus whatever the handshake learned about the
/// peer. A consumer connection (HELLO carried a wid) also records its
/// registration so cleanup can remove exactly itself from the registry.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub peer: SocketAddr,
    pub client: ClientData,
    pub registration: Option<(String, u64)>,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        let (read_half, write_half) = socket.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            client: ClientData::default(),
            registration: None,
        }
    }

    pub fn wid(&self) -> Option<&str> {
        self.client.wid.as_deref()
    }

    /// Read one command line, accepting `\r\n` or bare `\n` terminators.
    /// Returns `None` on a clean end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    pub async fn write_ok(&mut self) -> Result<()> {
        self.writer.write_all(reply::OK).await?;
        Ok(())
    }

    pub async fn write_simple(&mut self, s: &str) -> Result<()> {
        self.writer.write_all(&reply::simple(s)).await?;
        Ok(())
    }

    pub async fn write_error(&mut self, err: &ServerError) -> Result<()> {
        self.writer.write_all(&reply::error(err)).await?;
        Ok(())
    }

    pub async fn write_blob(&mut self, payload: Option<&[u8]>) -> Result<()> {
        self.writer.write_all(&reply::blob(payload)).await?;
        Ok(())
    }
}
