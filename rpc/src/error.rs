//! Error taxonomy of the messaging core.

use crate::message::ResponseError;

/// Everything a [`RpcClient`](crate::RpcClient) call can fail with.
///
/// Malformed inbound frames, unmatched responses, and requests no handler
/// claims are absorbed by the dispatch loop and never show up here; only
/// remote-reported errors and local failures reach callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `params` was present but not an array or object. Raised before
    /// anything touches the wire.
    #[error("params must be an array or object")]
    InvalidParams,

    /// The connection is gone: the server closed its stdout, a stream
    /// failed, or the client was shut down. Pending requests fail with
    /// this instead of waiting forever.
    #[error("connection to the server is closed")]
    Closed,

    /// The server answered the request with an error object.
    #[error("server rejected the request: {0}")]
    Rpc(#[source] ResponseError),

    /// The server answered with a response carrying neither `result` nor
    /// `error`.
    #[error("response carried neither result nor error")]
    InvalidResponse,

    /// The server executable could not be found in PATH.
    #[error("cannot find {command} in PATH")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    /// Spawning the server process failed.
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An outgoing message could not be serialized.
    #[error("failed to encode outgoing message")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    /// The remote error object, when the failure came from the server.
    #[must_use]
    pub fn as_rpc(&self) -> Option<&ResponseError> {
        match self {
            Self::Rpc(error) => Some(error),
            _ => None,
        }
    }
}
