//! Runtime errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised inside the service. None of these cross the RPC boundary
/// as-is; the front converts them into booleans, states or result codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The program binary could not be opened.
    #[error("failed to load program '{0}'")]
    Load(SmolStr),

    /// A required entry point is not exported by the program.
    #[error("missing required symbol '{0}'")]
    MissingSymbol(SmolStr),

    /// Local file I/O failure.
    #[error("i/o error '{0}'")]
    Io(SmolStr),

    /// Invalid program digest or extra file name.
    #[error("invalid artifact '{0}'")]
    InvalidArtifact(SmolStr),

    /// Unknown or incomplete blob.
    #[error("blob error '{0}'")]
    Blob(SmolStr),

    /// Debug buffer does not match the registered trace list.
    #[error("debug decode error '{0}'")]
    DebugDecode(SmolStr),

    /// Unsupported IEC type tag.
    #[error("unsupported IEC type '{0}'")]
    UnsupportedType(SmolStr),

    /// Worker thread is gone.
    #[error("worker unavailable")]
    WorkerUnavailable,

    /// Thread spawn error.
    #[error("thread spawn error '{0}'")]
    ThreadSpawn(SmolStr),

    /// Configuration error.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),

    /// Wire codec error (malformed frame or value).
    #[error("codec error '{0}'")]
    Codec(SmolStr),

    /// Transport (socket) error.
    #[error("transport error '{0}'")]
    Transport(SmolStr),

    /// Service publication error.
    #[error("publisher error '{0}'")]
    Publisher(SmolStr),
}

impl From<std::io::Error> for RuntimeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string().into())
    }
}
