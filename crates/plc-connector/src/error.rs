//! Connector errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Failure of one remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The connection failed or the reply could not be decoded. The service
    /// state is unknown; reconnect and ask for the status again.
    #[error("transport failure: {0}")]
    Transport(SmolStr),

    /// The service does not offer the operation.
    #[error("{0} is not implemented by the service")]
    NotImplemented(SmolStr),

    /// The service refused or failed the call.
    #[error("application error {code}: {message}")]
    Application { code: i32, message: SmolStr },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Malformed service URI.
    #[error("invalid uri '{0}'")]
    InvalidUri(SmolStr),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The upload did not end with the expected blob id.
    #[error("upload failed '{0}'")]
    Upload(SmolStr),

    /// PSK store failure.
    #[error("psk store error '{0}'")]
    Psk(SmolStr),
}
