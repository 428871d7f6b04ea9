//! Wire protocol: command parsing and reply framing.
//!
//! Commands are single ASCII lines of the form `VERB[ ARG]\r\n`. Replies use
//! a three-shape framing: `+` simple string, `-` tagged error, `$` length
//! prefixed blob, all CRLF terminated.

pub mod command;
pub mod reply;

pub use command::Command;
