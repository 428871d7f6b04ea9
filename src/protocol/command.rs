use serde::Deserialize;

use crate::error::{Result, ServerError};
use crate::job::{Job, DEFAULT_QUEUE};

/// A fully parsed client command.
///
/// The verb is the substring before the first space; whatever follows is the
/// command argument, JSON for most verbs. Parsing rejects bad documents up
/// front so handlers only ever see well-formed input.
#[derive(Debug, Clone)]
pub enum Command {
    /// `PUSH <json job>`
    Push(Box<Job>),
    /// `FETCH [queue ...]`; no queues means `default`.
    Fetch { queues: Vec<String> },
    /// `ACK {"jid":...}`
    Ack { jid: String },
    /// `FAIL {"jid":...,"errtype":...,"message":...,"backtrace":[...]}`
    Fail(FailPayload),
    /// `BEAT {"wid":...[,"current_state":...]}`
    Beat(BeatPayload),
    /// `INFO`
    Info,
    /// `FLUSH`
    Flush,
    /// `MUTATE <json operation>`
    Mutate(MutateOperation),
    /// `QUEUE PAUSE|RESUME|REMOVE <name> [name ...]`
    Queue(QueueOperation),
    /// `END`
    End,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailPayload {
    pub jid: String,
    #[serde(default)]
    pub errtype: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeatPayload {
    pub wid: String,
    #[serde(default)]
    pub current_state: Option<String>,
}

/// Admin operation over one of the sorted sets.
#[derive(Debug, Clone, Deserialize)]
pub struct MutateOperation {
    pub cmd: MutateCommand,
    pub target: MutateTarget,
    #[serde(default)]
    pub filter: Option<MutateFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateCommand {
    /// Move matching entries to the dead set.
    Kill,
    /// Delete matching entries outright.
    Discard,
    /// Move matching entries back to their queue.
    Requeue,
    /// Empty the entire target set; any filter is ignored.
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutateTarget {
    Scheduled,
    Retries,
    Dead,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MutateFilter {
    #[serde(default)]
    pub jids: Vec<String>,
    #[serde(default)]
    pub jobtype: Option<String>,
    /// `*`-wildcard pattern matched against the serialized payload.
    #[serde(default)]
    pub regexp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueOperation {
    pub action: QueueAction,
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Pause,
    Resume,
    Remove,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command> {
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb {
            "PUSH" => {
                let job = Job::parse(arg)?;
                Ok(Command::Push(Box::new(job)))
            }
            "FETCH" => {
                let queues: Vec<String> =
                    arg.split_whitespace().map(str::to_string).collect();
                let queues = if queues.is_empty() {
                    vec![DEFAULT_QUEUE.to_string()]
                } else {
                    queues
                };
                Ok(Command::Fetch { queues })
            }
            "ACK" => {
                #[derive(Deserialize)]
                struct AckPayload {
                    jid: String,
                }
                let payload: AckPayload = serde_json::from_str(arg)?;
                if payload.jid.is_empty() {
                    return Err(ServerError::Malformed("jid must not be empty".into()));
                }
                Ok(Command::Ack { jid: payload.jid })
            }
            "FAIL" => {
                let payload: FailPayload = serde_json::from_str(arg)?;
                if payload.jid.is_empty() {
                    return Err(ServerError::Malformed("jid must not be empty".into()));
                }
                Ok(Command::Fail(payload))
            }
            "BEAT" => {
                let payload: BeatPayload = serde_json::from_str(arg)?;
                if payload.wid.is_empty() {
                    return Err(ServerError::Malformed("wid must not be empty".into()));
                }
                Ok(Command::Beat(payload))
            }
            "INFO" => Ok(Command::Info),
            "FLUSH" => Ok(Command::Flush),
            "MUTATE" => {
                let op: MutateOperation = serde_json::from_str(arg)?;
                Ok(Command::Mutate(op))
            }
            "QUEUE" => {
                let mut words = arg.split_whitespace();
                let action = match words.next() {
                    Some("PAUSE") => QueueAction::Pause,
                    Some("RESUME") => QueueAction::Resume,
                    Some("REMOVE") => QueueAction::Remove,
                    _ => {
                        return Err(ServerError::Malformed(
                            "QUEUE requires PAUSE, RESUME or REMOVE".into(),
                        ))
                    }
                };
                let queues: Vec<String> = words.map(str::to_string).collect();
                if queues.is_empty() {
                    return Err(ServerError::Malformed(
                        "QUEUE requires at least one queue name".into(),
                    ));
                }
                Ok(Command::Queue(QueueOperation { action, queues }))
            }
            "END" => Ok(Command::End),
            _ => Err(ServerError::UnknownCommand(verb.to_string())),
        }
    }
}

/// Match a serialized payload against a `*`-wildcard pattern, the same
/// matching the original admin surface applies server-side.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(pat: &[u8], txt: &[u8]) -> bool {
        match (pat.split_first(), txt.split_first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some((&b'*', rest)), _) => (0..=txt.len()).any(|skip| inner(rest, &txt[skip..])),
            (Some((p, prest)), Some((t, trest))) => p == t && inner(prest, trest),
            (Some(_), None) => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
