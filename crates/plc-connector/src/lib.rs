//! `plc-connector` - client for the plc-runtime remote service.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Typed remote calls.
pub mod connector;
/// Per-operation fallback replies.
pub mod defaults;
/// Connector errors.
pub mod error;
/// Client-side identity and pre-shared secret store.
pub mod psk;
/// Chunked uploads.
pub mod upload;
/// Service URIs.
pub mod uri;

pub use connector::Connector;
pub use error::{ConnectorError, RemoteError};
pub use psk::PskStore;
pub use uri::{Scheme, ServiceUri};
