//! Event types from borg's structured-log stream.
//!
//! With `--log-json`, borg emits one JSON object per line on the structured
//! stream. This module decodes those lines into typed messages and classifies
//! them by message id into plain information, prompts awaiting an answer, and
//! fatal conditions.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::BorgError;

/// Message ids that terminate a run with [`BorgError::ToolReported`].
///
/// Versioned against borg 1.x; ids absent from this list never escalate.
pub const FATAL_MSGIDS: &[&str] = &[
    "Archive.AlreadyExists",
    "Archive.DoesNotExist",
    "Archive.IncompatibleFilesystemEncodingError",
    "Cache.CacheInitAbortedError",
    "Cache.EncryptionMethodMismatch",
    "Cache.RepositoryAccessAborted",
    "ConnectionClosed",
    "ConnectionClosedWithHint",
    "KeyfileNotFoundError",
    "LockFailed",
    "LockTimeout",
    "PassphraseWrong",
    "PasscommandFailure",
    "PathNotAllowed",
    "Repository.AlreadyExists",
    "Repository.CheckNeeded",
    "Repository.DoesNotExist",
    "Repository.InsufficientFreeSpaceError",
    "Repository.InvalidRepository",
    "Repository.ObjectNotFound",
];

/// Message ids that require an interactive answer before borg proceeds.
pub const PROMPT_MSGIDS: &[&str] = &[
    "BORG_CHECK_I_KNOW_WHAT_I_AM_DOING",
    "BORG_DELETE_I_KNOW_WHAT_I_AM_DOING",
    "BORG_RELOCATED_REPO_ACCESS_IS_OK",
    "BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK",
];

/// How a decoded message steers the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Informational; does not affect control flow.
    Info,
    /// Borg is waiting for an answer on stdin.
    Prompt,
    /// The run has failed; surfaced as [`BorgError::ToolReported`].
    Fatal,
}

/// Classify a message id against the fatal and prompt tables.
///
/// Absent or unmapped ids are informational.
#[must_use]
pub fn classify_msgid(msgid: Option<&str>) -> Classification {
    match msgid {
        Some(id) if FATAL_MSGIDS.contains(&id) => Classification::Fatal,
        Some(id) if PROMPT_MSGIDS.contains(&id) => Classification::Prompt,
        _ => Classification::Info,
    }
}

/// A `log_message` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogMessage {
    /// Symbolic message id, set for conditions borg wants callers to react to.
    #[serde(default)]
    pub msgid: Option<String>,
    /// Log level name (DEBUG, INFO, WARNING, ERROR).
    #[serde(default)]
    pub levelname: Option<String>,
    /// Logger name (e.g. `borg.archiver`).
    #[serde(default)]
    pub name: Option<String>,
    /// Message text.
    #[serde(default)]
    pub message: Option<String>,
    /// Any additional fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogMessage {
    pub(crate) fn to_tool_reported(&self) -> BorgError {
        BorgError::ToolReported {
            msgid: self.msgid.clone().unwrap_or_default(),
            message: self.message.clone().unwrap_or_default(),
            payload: self.extra.clone(),
        }
    }

    pub(crate) fn to_prompt_required(&self) -> BorgError {
        BorgError::PromptRequired {
            msgid: self.msgid.clone().unwrap_or_default(),
            message: self.message.clone().unwrap_or_default(),
        }
    }
}

/// A `progress_message` event: an operation started, progressed, or finished.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressMessage {
    /// Operation identifier, stable across one operation's updates.
    #[serde(default)]
    pub operation: Option<u64>,
    /// Symbolic message id, if any.
    #[serde(default)]
    pub msgid: Option<String>,
    /// Whether the operation is done.
    #[serde(default)]
    pub finished: bool,
    /// Progress text.
    #[serde(default)]
    pub message: Option<String>,
    /// Any additional fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A `progress_percent` event: quantified progress of an operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressPercent {
    /// Operation identifier, stable across one operation's updates.
    #[serde(default)]
    pub operation: Option<u64>,
    /// Symbolic message id, if any.
    #[serde(default)]
    pub msgid: Option<String>,
    /// Whether the operation is done.
    #[serde(default)]
    pub finished: bool,
    /// Units processed so far.
    #[serde(default)]
    pub current: Option<u64>,
    /// Total units, when known.
    #[serde(default)]
    pub total: Option<u64>,
    /// Progress text.
    #[serde(default)]
    pub message: Option<String>,
    /// Any additional fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Messages borg emits on the structured stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BorgMessage {
    /// A log record.
    LogMessage(LogMessage),
    /// Unquantified progress.
    ProgressMessage(ProgressMessage),
    /// Quantified progress.
    ProgressPercent(ProgressPercent),
    /// Catch-all for message types this version does not know.
    #[serde(other)]
    Unknown,
}

impl BorgMessage {
    /// Decode one structured-stream line.
    ///
    /// # Errors
    ///
    /// Returns [`BorgError::MalformedEvent`] if the line is not valid JSON or
    /// lacks a recognizable `type` field.
    pub fn parse(line: &str) -> Result<Self, BorgError> {
        serde_json::from_str(line).map_err(|err| BorgError::MalformedEvent {
            line: line.to_string(),
            reason: err.to_string(),
        })
    }

    /// The message id, if this message carries one.
    #[must_use]
    pub fn msgid(&self) -> Option<&str> {
        match self {
            Self::LogMessage(m) => m.msgid.as_deref(),
            Self::ProgressMessage(m) => m.msgid.as_deref(),
            Self::ProgressPercent(m) => m.msgid.as_deref(),
            Self::Unknown => None,
        }
    }

    /// Classify this message; only `log_message` events can escalate.
    #[must_use]
    pub fn classify(&self) -> Classification {
        match self {
            Self::LogMessage(m) => classify_msgid(m.msgid.as_deref()),
            _ => Classification::Info,
        }
    }
}

/// An item yielded while consuming a run.
#[derive(Debug, Clone, PartialEq)]
pub enum BorgEvent {
    /// A decoded structured-stream message.
    Message(BorgMessage),
    /// A primary-stream line, yielded when capture is off.
    RawOutput(String),
}

impl BorgEvent {
    /// Returns true if this event is a prompt awaiting an answer.
    #[must_use]
    pub fn is_prompt(&self) -> bool {
        matches!(self, Self::Message(msg) if msg.classify() == Classification::Prompt)
    }

    /// The decoded message, if this is a structured event.
    #[must_use]
    pub fn as_message(&self) -> Option<&BorgMessage> {
        match self {
            Self::Message(msg) => Some(msg),
            Self::RawOutput(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_message() {
        let line = r#"{"type":"log_message","levelname":"INFO","name":"borg.archiver","message":"done","msgid":null}"#;
        let msg = BorgMessage::parse(line).unwrap();
        match msg {
            BorgMessage::LogMessage(m) => {
                assert_eq!(m.levelname.as_deref(), Some("INFO"));
                assert_eq!(m.message.as_deref(), Some("done"));
                assert!(m.msgid.is_none());
            }
            other => panic!("expected LogMessage, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_percent() {
        let line = r#"{"type":"progress_percent","operation":1,"current":25,"total":100,"message":"25%","finished":false}"#;
        let msg = BorgMessage::parse(line).unwrap();
        match msg {
            BorgMessage::ProgressPercent(p) => {
                assert_eq!(p.operation, Some(1));
                assert_eq!(p.current, Some(25));
                assert_eq!(p.total, Some(100));
                assert!(!p.finished);
            }
            other => panic!("expected ProgressPercent, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_passes_through() {
        let line = r#"{"type":"question_prompt","message":"really?"}"#;
        let msg = BorgMessage::parse(line).unwrap();
        assert_eq!(msg, BorgMessage::Unknown);
        assert_eq!(msg.classify(), Classification::Info);
    }

    #[test]
    fn parse_invalid_json_is_malformed() {
        let result = BorgMessage::parse("not json at all");
        match result {
            Err(BorgError::MalformedEvent { line, .. }) => {
                assert_eq!(line, "not json at all");
            }
            other => panic!("expected MalformedEvent, got {other:?}"),
        }
    }

    #[test]
    fn parse_missing_type_is_malformed() {
        let result = BorgMessage::parse(r#"{"message":"no type here"}"#);
        assert!(matches!(result, Err(BorgError::MalformedEvent { .. })));
    }

    #[test]
    fn classify_fatal_msgid() {
        let line = r#"{"type":"log_message","msgid":"Repository.DoesNotExist","message":"gone"}"#;
        let msg = BorgMessage::parse(line).unwrap();
        assert_eq!(msg.classify(), Classification::Fatal);
    }

    #[test]
    fn classify_prompt_msgid() {
        let line = r#"{"type":"log_message","msgid":"BORG_DELETE_I_KNOW_WHAT_I_AM_DOING","message":"sure?"}"#;
        let msg = BorgMessage::parse(line).unwrap();
        assert_eq!(msg.classify(), Classification::Prompt);
        assert!(BorgEvent::Message(msg).is_prompt());
    }

    #[test]
    fn classify_unmapped_msgid_is_info() {
        assert_eq!(classify_msgid(Some("Archive.TotallyNewCondition")), Classification::Info);
        assert_eq!(classify_msgid(None), Classification::Info);
    }

    #[test]
    fn progress_msgid_never_escalates() {
        let line = r#"{"type":"progress_message","msgid":"Repository.DoesNotExist","message":"odd"}"#;
        let msg = BorgMessage::parse(line).unwrap();
        assert_eq!(msg.classify(), Classification::Info);
    }

    #[test]
    fn msgid_tables_are_disjoint() {
        for id in FATAL_MSGIDS {
            assert!(!PROMPT_MSGIDS.contains(id), "{id} is in both tables");
        }
    }

    #[test]
    fn extra_fields_are_preserved() {
        let line = r#"{"type":"log_message","msgid":"Repository.DoesNotExist","message":"gone","time":1700000000.0}"#;
        let msg = BorgMessage::parse(line).unwrap();
        match msg {
            BorgMessage::LogMessage(m) => {
                assert!(m.extra.contains_key("time"));
                let err = m.to_tool_reported();
                match err {
                    BorgError::ToolReported { msgid, payload, .. } => {
                        assert_eq!(msgid, "Repository.DoesNotExist");
                        assert!(payload.contains_key("time"));
                    }
                    other => panic!("expected ToolReported, got {other:?}"),
                }
            }
            other => panic!("expected LogMessage, got {other:?}"),
        }
    }
}
