use crate::error::ServerError;

/// `+OK\r\n`, the reply for every command that has nothing else to say.
pub const OK: &[u8] = b"+OK\r\n";

/// Render a simple string reply: `+<s>\r\n`.
pub fn simple(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 3);
    out.push(b'+');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Render a tagged error reply: `-<TAG> <message>\r\n`.
pub fn error(err: &ServerError) -> Vec<u8> {
    format!("-{} {}\r\n", err.tag(), err).into_bytes()
}

/// Render a length-prefixed blob reply: `$<len>\r\n<bytes>\r\n`.
/// `None` renders the null blob `$-1\r\n`.
pub fn blob(payload: Option<&[u8]>) -> Vec<u8> {
    match payload {
        Some(bytes) => {
            let mut out = format!("${}\r\n", bytes.len()).into_bytes();
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
            out
        }
        None => b"$-1\r\n".to_vec(),
    }
}
