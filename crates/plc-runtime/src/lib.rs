//! `plc-runtime` - remote execution service for compiled IEC 61131-3 programs.
//!
//! The service loads a PLC program (a native shared library), starts and
//! stops it, samples its debug variables, and exposes all of that to remote
//! clients over a small RPC surface.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Content-addressed chunked uploads.
pub mod blob;
/// Service configuration.
pub mod config;
/// PLC lifecycle state machine.
pub mod controller;
/// Debug sampling and trace buffering.
pub mod debug;
/// Runtime errors.
pub mod error;
/// Remote operations and their wire bindings.
pub mod front;
/// Service identity and pre-shared secret.
pub mod identity;
/// Program loaders (native and simulated).
pub mod loader;
/// PLC log channel.
pub mod log;
/// Local network announcement.
pub mod publisher;
/// `RemoteExec` scripts.
pub mod remote_exec;
/// Service context wiring.
pub mod service;
/// TCP listeners.
pub mod transport;
/// Serialized worker thread.
pub mod worker;

pub use config::ServiceConfig;
pub use controller::{PlcController, PlcState};
pub use error::RuntimeError;
pub use service::ServiceContext;
pub use worker::Worker;
