//! Reply used for an operation the service cannot answer.

use plc_runtime::front::{Operation, Response};
use plc_runtime::log::LOG_LEVELS;
use plc_runtime::PlcState;

/// Message of the `RemoteExec` fallback.
pub const REMOTE_EXEC_FAILED: &str = "RemoteExec script failed!";

/// Fallback reply for `op`.
#[must_use]
pub fn default_response(op: Operation) -> Response {
    match op {
        Operation::StartPlc
        | Operation::StopPlc
        | Operation::ForceReload
        | Operation::NewPlc
        | Operation::MatchMd5
        | Operation::SetTraceVariablesList
        | Operation::RepairPlc => Response::Bool(false),
        Operation::GetPlcStatus => Response::Status {
            state: PlcState::Broken,
            log_counts: [0; LOG_LEVELS],
        },
        Operation::GetTraceVariables => Response::Traces {
            state: PlcState::Broken,
            samples: Vec::new(),
        },
        Operation::GetPlcId => Response::PlcId(None),
        Operation::GetLogMessage => Response::LogMessage(None),
        Operation::RemoteExec => Response::Exec {
            code: -1,
            message: Some(REMOTE_EXEC_FAILED.to_string()),
        },
        Operation::SeedBlob | Operation::AppendChunkToBlob => Response::BlobId(String::new()),
        Operation::PurgeBlobs | Operation::ResetLogCount => Response::Unit,
        Operation::Hello => Response::Version(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_status_reads_as_broken() {
        assert_eq!(
            default_response(Operation::GetPlcStatus),
            Response::Status {
                state: PlcState::Broken,
                log_counts: [0; LOG_LEVELS],
            }
        );
        assert_eq!(default_response(Operation::MatchMd5), Response::Bool(false));
        assert!(matches!(
            default_response(Operation::RemoteExec),
            Response::Exec { code: -1, .. }
        ));
    }
}
