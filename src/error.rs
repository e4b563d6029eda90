use crate::protocol::{ActionFlags, Phase};
use thiserror::Error;

/// Bytes on the wire that cannot be turned into a packet.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("unknown reply byte {0:#04x}")]
    UnknownReply(u8),

    #[error("invalid packet length {0}")]
    InvalidLength(u32),

    #[error("malformed {packet} packet: {reason}")]
    Malformed {
        packet: &'static str,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn malformed(packet: &'static str, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            packet,
            reason: reason.into(),
        }
    }
}

/// Failures surfaced by a protocol context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{operation} is not allowed in {state} state")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("{operation} requires the negotiated {required:?} action")]
    InvalidAction {
        operation: &'static str,
        required: ActionFlags,
    },

    #[error("invalid reply code: {0}")]
    InvalidCode(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(Phase),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("connection closed")]
    Closed,
}

impl ContextError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        ContextError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}
