//! Remote service front.
//!
//! The closed set of remote operations, their arguments and replies, and the
//! dispatch onto the controller. The wire bindings in [`codec`] and [`json`]
//! only translate bytes to and from these types.

#![allow(missing_docs)]

pub mod codec;
pub mod json;

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::controller::{PlcController, PlcState};
use crate::debug::{TraceOrder, TraceRequest};
use crate::identity::Identity;
use crate::log::{LogEntry, LogLevel, LOG_LEVELS};

/// Highest protocol revision this build speaks.
pub const PROTOCOL_VERSION: u8 = 2;

/// Application code: the connection did not authenticate.
pub const CODE_UNAUTHORIZED: i32 = -2;
/// Application code: blob transfer failure.
pub const CODE_BLOB: i32 = -3;

/// Every remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartPlc,
    StopPlc,
    ForceReload,
    GetPlcStatus,
    NewPlc,
    MatchMd5,
    SetTraceVariablesList,
    GetTraceVariables,
    GetPlcId,
    GetLogMessage,
    RemoteExec,
    SeedBlob,
    AppendChunkToBlob,
    PurgeBlobs,
    RepairPlc,
    ResetLogCount,
    Hello,
}

impl Operation {
    pub const ALL: [Operation; 17] = [
        Operation::StartPlc,
        Operation::StopPlc,
        Operation::ForceReload,
        Operation::GetPlcStatus,
        Operation::NewPlc,
        Operation::MatchMd5,
        Operation::SetTraceVariablesList,
        Operation::GetTraceVariables,
        Operation::GetPlcId,
        Operation::GetLogMessage,
        Operation::RemoteExec,
        Operation::SeedBlob,
        Operation::AppendChunkToBlob,
        Operation::PurgeBlobs,
        Operation::RepairPlc,
        Operation::ResetLogCount,
        Operation::Hello,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::StartPlc => 1,
            Self::StopPlc => 2,
            Self::ForceReload => 3,
            Self::GetPlcStatus => 4,
            Self::NewPlc => 5,
            Self::MatchMd5 => 6,
            Self::SetTraceVariablesList => 7,
            Self::GetTraceVariables => 8,
            Self::GetPlcId => 9,
            Self::GetLogMessage => 10,
            Self::RemoteExec => 11,
            Self::SeedBlob => 12,
            Self::AppendChunkToBlob => 13,
            Self::PurgeBlobs => 14,
            Self::RepairPlc => 15,
            Self::ResetLogCount => 16,
            Self::Hello => 17,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Method name on the JSON binding.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::StartPlc => "StartPLC",
            Self::StopPlc => "StopPLC",
            Self::ForceReload => "ForceReload",
            Self::GetPlcStatus => "GetPLCstatus",
            Self::NewPlc => "NewPLC",
            Self::MatchMd5 => "MatchMD5",
            Self::SetTraceVariablesList => "SetTraceVariablesList",
            Self::GetTraceVariables => "GetTraceVariables",
            Self::GetPlcId => "GetPLCID",
            Self::GetLogMessage => "GetLogMessage",
            Self::RemoteExec => "RemoteExec",
            Self::SeedBlob => "SeedBlob",
            Self::AppendChunkToBlob => "AppendChunkToBlob",
            Self::PurgeBlobs => "PurgeBlobs",
            Self::RepairPlc => "RepairPLC",
            Self::ResetLogCount => "ResetLogCount",
            Self::Hello => "Hello",
        }
    }

    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.wire_name() == name)
    }

    /// First protocol revision that has this operation.
    #[must_use]
    pub fn since_version(self) -> u8 {
        match self {
            Self::PurgeBlobs | Self::RepairPlc | Self::ResetLogCount => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Extra file shipped with a program, by uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraFileRef {
    pub name: String,
    pub blob_id: String,
}

/// Login data sent with `Hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StartPlc,
    StopPlc,
    ForceReload,
    GetPlcStatus,
    NewPlc {
        digest: String,
        blob_id: String,
        extra_files: Vec<ExtraFileRef>,
    },
    MatchMd5 {
        digest: String,
    },
    SetTraceVariablesList {
        orders: Vec<TraceOrder>,
    },
    GetTraceVariables,
    GetPlcId,
    GetLogMessage {
        level: u8,
        msg_id: u32,
    },
    RemoteExec {
        script: String,
        kwargs: IndexMap<String, String>,
    },
    SeedBlob {
        seed: Vec<u8>,
    },
    AppendChunkToBlob {
        chunk: Vec<u8>,
        blob_id: String,
    },
    PurgeBlobs,
    RepairPlc,
    ResetLogCount,
    Hello {
        version: u8,
        credentials: Option<Credentials>,
    },
}

impl Request {
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::StartPlc => Operation::StartPlc,
            Self::StopPlc => Operation::StopPlc,
            Self::ForceReload => Operation::ForceReload,
            Self::GetPlcStatus => Operation::GetPlcStatus,
            Self::NewPlc { .. } => Operation::NewPlc,
            Self::MatchMd5 { .. } => Operation::MatchMd5,
            Self::SetTraceVariablesList { .. } => Operation::SetTraceVariablesList,
            Self::GetTraceVariables => Operation::GetTraceVariables,
            Self::GetPlcId => Operation::GetPlcId,
            Self::GetLogMessage { .. } => Operation::GetLogMessage,
            Self::RemoteExec { .. } => Operation::RemoteExec,
            Self::SeedBlob { .. } => Operation::SeedBlob,
            Self::AppendChunkToBlob { .. } => Operation::AppendChunkToBlob,
            Self::PurgeBlobs => Operation::PurgeBlobs,
            Self::RepairPlc => Operation::RepairPlc,
            Self::ResetLogCount => Operation::ResetLogCount,
            Self::Hello { .. } => Operation::Hello,
        }
    }

    /// Request without arguments for `op`, if it takes none.
    #[must_use]
    pub fn bare(op: Operation) -> Option<Self> {
        Some(match op {
            Operation::StartPlc => Self::StartPlc,
            Operation::StopPlc => Self::StopPlc,
            Operation::ForceReload => Self::ForceReload,
            Operation::GetPlcStatus => Self::GetPlcStatus,
            Operation::GetTraceVariables => Self::GetTraceVariables,
            Operation::GetPlcId => Self::GetPlcId,
            Operation::PurgeBlobs => Self::PurgeBlobs,
            Operation::RepairPlc => Self::RepairPlc,
            Operation::ResetLogCount => Self::ResetLogCount,
            _ => return None,
        })
    }
}

/// One buffered debug sample as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSample {
    pub tick: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Unit,
    Bool(bool),
    Status {
        state: PlcState,
        log_counts: [u32; LOG_LEVELS],
    },
    Traces {
        state: PlcState,
        samples: Vec<TraceSample>,
    },
    PlcId(Option<Credentials>),
    LogMessage(Option<LogEntry>),
    Exec {
        code: i32,
        message: Option<String>,
    },
    BlobId(String),
    Version(u8),
}

/// Outcome of one remote call as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Response),
    Application { code: i32, message: String },
    /// The operation (by wire code) is unknown to this build.
    NotImplemented(u8),
}

/// Per-connection state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub authenticated: bool,
    pub peer_version: Option<u8>,
}

/// Dispatches decoded requests onto the controller.
pub struct ServiceFront {
    controller: PlcController,
    blobs: BlobStore,
    identity: Option<Identity>,
    require_psk: bool,
}

impl std::fmt::Debug for ServiceFront {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFront")
            .field("controller", &self.controller)
            .field("require_psk", &self.require_psk)
            .finish_non_exhaustive()
    }
}

impl ServiceFront {
    #[must_use]
    pub fn new(
        controller: PlcController,
        blobs: BlobStore,
        identity: Option<Identity>,
        require_psk: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            blobs,
            identity,
            require_psk,
        })
    }

    #[must_use]
    pub fn controller(&self) -> &PlcController {
        &self.controller
    }

    #[must_use]
    pub fn new_session(&self) -> Session {
        Session {
            authenticated: !self.require_psk,
            peer_version: None,
        }
    }

    pub fn dispatch(&self, session: &mut Session, request: Request) -> Reply {
        let op = request.operation();
        if op != Operation::Hello && !session.authenticated {
            warn!(op = %op, "unauthenticated call refused");
            return unauthorized();
        }
        debug!(op = %op, "dispatch");
        let controller = &self.controller;
        let response = match request {
            Request::StartPlc => Response::Bool(controller.start_plc()),
            Request::StopPlc => Response::Bool(controller.stop_plc()),
            Request::ForceReload => Response::Bool(controller.force_reload()),
            Request::GetPlcStatus => {
                let (state, log_counts) = controller.get_status();
                Response::Status { state, log_counts }
            }
            Request::NewPlc {
                digest,
                blob_id,
                extra_files,
            } => Response::Bool(self.new_plc(&digest, &blob_id, &extra_files)),
            Request::MatchMd5 { digest } => Response::Bool(controller.match_md5(&digest)),
            Request::SetTraceVariablesList { orders } => {
                Response::Bool(controller.set_trace_variables_list(TraceRequest::new(orders)))
            }
            Request::GetTraceVariables => {
                let (state, samples) = controller.get_trace_variables();
                Response::Traces {
                    state,
                    samples: samples
                        .into_iter()
                        .map(|sample| TraceSample {
                            tick: sample.tick,
                            data: sample.raw,
                        })
                        .collect(),
                }
            }
            Request::GetPlcId => Response::PlcId(self.identity.as_ref().map(|identity| {
                Credentials {
                    id: identity.id.to_string(),
                    secret: identity.secret.to_string(),
                }
            })),
            Request::GetLogMessage { level, msg_id } => Response::LogMessage(
                LogLevel::from_index(level)
                    .and_then(|level| controller.get_log_message(level, msg_id)),
            ),
            Request::RemoteExec { script, kwargs } => {
                let (code, message) = controller.remote_exec(&script, &kwargs);
                Response::Exec { code, message }
            }
            Request::SeedBlob { seed } => match self.blobs.seed_blob(&seed) {
                Ok(id) => Response::BlobId(id),
                Err(err) => return blob_failure(&err),
            },
            Request::AppendChunkToBlob { chunk, blob_id } => {
                match self.blobs.append_chunk(&chunk, &blob_id) {
                    Ok(id) => Response::BlobId(id),
                    Err(err) => return blob_failure(&err),
                }
            }
            Request::PurgeBlobs => {
                self.blobs.purge();
                Response::Unit
            }
            Request::RepairPlc => Response::Bool(controller.repair_plc()),
            Request::ResetLogCount => {
                controller.reset_log_count();
                Response::Unit
            }
            Request::Hello {
                version,
                credentials,
            } => return self.hello(session, version, credentials.as_ref()),
        };
        Reply::Ok(response)
    }

    fn hello(&self, session: &mut Session, version: u8, credentials: Option<&Credentials>) -> Reply {
        session.peer_version = Some(version);
        let valid = match (&self.identity, credentials) {
            (Some(identity), Some(given)) => identity.matches(&given.id, &given.secret),
            _ => false,
        };
        if valid {
            session.authenticated = true;
        } else if self.require_psk {
            warn!("hello with missing or wrong credentials");
            return unauthorized();
        }
        info!(client_version = version, "client connected");
        Reply::Ok(Response::Version(PROTOCOL_VERSION))
    }

    /// Resolve every blob before the controller sees anything, so a bad
    /// transfer leaves the installed program untouched.
    fn new_plc(&self, digest: &str, blob_id: &str, extra_files: &[ExtraFileRef]) -> bool {
        let mut ids = vec![blob_id];
        ids.extend(extra_files.iter().map(|file| file.blob_id.as_str()));
        let mut data = match self.blobs.take_all(&ids) {
            Ok(data) => data.into_iter(),
            Err(err) => {
                warn!("NewPLC rejected: {err}");
                return false;
            }
        };
        let binary = data.next().unwrap_or_default();
        let extras = extra_files
            .iter()
            .map(|file| file.name.clone())
            .zip(data)
            .collect();
        self.controller.new_plc(digest, binary, extras)
    }
}

fn unauthorized() -> Reply {
    Reply::Application {
        code: CODE_UNAUTHORIZED,
        message: "unauthorized".into(),
    }
}

fn blob_failure(err: &crate::error::RuntimeError) -> Reply {
    Reply::Application {
        code: CODE_BLOB,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_names_are_unique() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_code(op.code()), Some(op));
            assert_eq!(Operation::from_wire_name(op.wire_name()), Some(op));
        }
        assert_eq!(Operation::from_code(0), None);
        assert_eq!(Operation::from_wire_name("Reboot"), None);
    }

    #[test]
    fn maintenance_operations_are_version_two() {
        let v2: Vec<_> = Operation::ALL
            .into_iter()
            .filter(|op| op.since_version() == 2)
            .collect();
        assert_eq!(
            v2,
            vec![
                Operation::PurgeBlobs,
                Operation::RepairPlc,
                Operation::ResetLogCount
            ]
        );
    }
}
