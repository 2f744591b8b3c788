//! Error taxonomy for the borg engine.

use serde_json::{Map, Value};

use super::process::SpawnError;

/// Errors produced while driving a borg subprocess.
#[derive(thiserror::Error, Debug)]
pub enum BorgError {
    /// The borg executable could not be launched.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// An operation was invoked in the wrong lifecycle state.
    #[error("cannot {operation} while the controller is {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The lifecycle state the controller was in.
        state: &'static str,
    },
    /// A structured-stream line violated the line protocol.
    #[error("malformed event line {line:?}: {reason}")]
    MalformedEvent {
        /// The offending line.
        line: String,
        /// Why it failed to decode.
        reason: String,
    },
    /// Borg reported a fatal condition via a classified message id.
    #[error("borg error [{msgid}]: {message}")]
    ToolReported {
        /// The message id that triggered the escalation.
        msgid: String,
        /// Human-readable message text, if borg supplied one.
        message: String,
        /// Remaining fields of the originating event.
        payload: Map<String, Value>,
    },
    /// A prompt arrived but no answer policy was supplied.
    #[error("borg requires confirmation [{msgid}]: {message}")]
    PromptRequired {
        /// The prompt's message id.
        msgid: String,
        /// The prompt text, if borg supplied one.
        message: String,
    },
    /// No interactive input channel is attached to the subprocess.
    #[error("no input channel attached to the borg process")]
    NotSupported,
    /// A command operation was given invalid arguments.
    #[error("{0}")]
    InvalidArgument(String),
    /// An I/O error while talking to the subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
