//! Binary loader.
//!
//! A program is a compiled artifact exporting a fixed set of entry points.
//! [`ProgramLoader`] opens an artifact and resolves those entry points into a
//! [`PlcProgram`] handle; dropping the last handle unloads it.

#![allow(missing_docs)]

mod native;
mod simulated;

use std::path::Path;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::log::PlcLog;

pub use native::NativeLoader;
pub use simulated::{SimulatedLoader, SIMULATED_EXTENSION};

/// Entry points every program must export.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "startPLC",
    "stopPLC",
    "ResetDebugVariables",
    "RegisterDebugVariable",
    "FreeDebugData",
    "GetDebugData",
    "suspendDebug",
    "resumeDebug",
];

/// Entry points that may be absent.
pub const OPTIONAL_SYMBOLS: &[&str] = &[
    "PythonIterator",
    "ResetLogCount",
    "GetLogCount",
    "LogMessage",
    "GetLogMessage",
    "PLC_ID",
];

/// One debug buffer snapshot copied out of the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugData {
    pub tick: u32,
    pub buffer: Vec<u8>,
}

/// A loaded program.
///
/// Lifecycle calls (`start`, `stop`, debug registration) are only issued from
/// the serialized worker. `debug_data` is called from the trace thread under
/// the sampler lock.
pub trait PlcProgram: Send + Sync {
    /// Run the program's start routine; `0` means success.
    fn start(&self, args: &[String]) -> i32;
    fn stop(&self);

    fn reset_debug_variables(&self);
    /// Register variable `idx` for tracing, forcing it to `force` (native
    /// layout) when given.
    fn register_debug_variable(&self, idx: u32, force: Option<&[u8]>);
    /// `disable = true` turns debug off; returns `0` when debug is available.
    fn suspend_debug(&self, disable: bool) -> i32;
    fn resume_debug(&self);
    /// Wait for the next published debug buffer. `None` when nothing was
    /// published (debug disabled, program stopping, or a wait timed out).
    fn debug_data(&self) -> Option<DebugData>;

    /// Whether the program exports the execution-thread bridge.
    fn has_bridge(&self) -> bool {
        false
    }

    /// Hand the previous command result to the program and receive the next
    /// command. `None` ends the bridge loop.
    fn bridge_step(&self, _result: &str) -> Option<String> {
        None
    }

    /// The program's own log, when it exports one.
    fn log(&self) -> Option<&dyn PlcLog> {
        None
    }

    /// Publish the service identity to the program.
    fn set_identity(&self, _id: &str) {}
}

/// Opens program artifacts.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn PlcProgram>, RuntimeError>;

    /// File extension (including the dot) used for installed artifacts.
    fn extension(&self) -> &'static str;
}

/// Loader selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    #[default]
    Native,
    Simulated,
}

impl LoaderKind {
    #[must_use]
    pub fn build(self) -> Arc<dyn ProgramLoader> {
        match self {
            Self::Native => Arc::new(NativeLoader),
            Self::Simulated => Arc::new(SimulatedLoader),
        }
    }
}
