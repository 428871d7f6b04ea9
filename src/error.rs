use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    Malformed(String),

    #[error("Unknown command {0}")]
    UnknownCommand(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("Invalid password")]
    Auth,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Tag prepended to the wire form of this error, as in `-MALFORMED <msg>\r\n`.
    ///
    /// Authentication failures and unknown verbs use the generic `ERR` tag so
    /// the wire output stays compatible with existing clients.
    pub fn tag(&self) -> &'static str {
        use ServerError::*;

        match self {
            Malformed(_) | Json(_) => "MALFORMED",
            UnknownCommand(_) | Auth => "ERR",
            NotFound(_) => "NOTFOUND",
            Shutdown => "SHUTDOWN",
            Storage(_) => "STORAGE",
            Io(_) | Internal(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tags() {
        assert_eq!(ServerError::Malformed("no jid".into()).tag(), "MALFORMED");
        assert_eq!(ServerError::UnknownCommand("BLAH".into()).tag(), "ERR");
        assert_eq!(ServerError::Auth.tag(), "ERR");
        assert_eq!(ServerError::Shutdown.tag(), "SHUTDOWN");
        assert_eq!(ServerError::NotFound("j1".into()).tag(), "NOTFOUND");
    }

    #[test]
    fn test_wire_messages() {
        assert_eq!(ServerError::Auth.to_string(), "Invalid password");
        assert_eq!(ServerError::Shutdown.to_string(), "Shutdown in progress");
        assert_eq!(
            ServerError::UnknownCommand("FROB".into()).to_string(),
            "Unknown command FROB"
        );
    }
}
