//! JSON binding: one request or reply object per line.
//!
//! ```text
//! {"id":1,"method":"MatchMD5","params":{"digest":"..."}}
//! {"id":1,"ok":true,"result":false}
//! {"id":2,"ok":false,"error":{"kind":"application","code":-2,"message":"unauthorized"}}
//! ```
//!
//! Byte strings travel as standard base64.

use std::io::{BufRead, Read};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codec::MAX_FRAME_LEN;
use super::{Credentials, ExtraFileRef, Operation, Reply, Request, Response, TraceSample};
use crate::controller::PlcState;
use crate::debug::TraceOrder;
use crate::error::RuntimeError;
use crate::log::{LogEntry, LOG_LEVELS};

#[derive(Debug, Serialize, Deserialize)]
struct JsonRequest {
    id: u64,
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonResponse {
    id: u64,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorKind {
    Application,
    NotImplemented,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonError {
    kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    message: String,
}

#[derive(Serialize, Deserialize)]
struct NewPlcParams {
    digest: String,
    blob_id: String,
    #[serde(default)]
    extra_files: Vec<ExtraFileJson>,
}

#[derive(Serialize, Deserialize)]
struct ExtraFileJson {
    name: String,
    blob_id: String,
}

#[derive(Serialize, Deserialize)]
struct DigestParams {
    digest: String,
}

#[derive(Serialize, Deserialize)]
struct TraceParams {
    orders: Vec<TraceOrder>,
}

#[derive(Serialize, Deserialize)]
struct LogParams {
    level: u8,
    msg_id: u32,
}

#[derive(Serialize, Deserialize)]
struct ExecParams {
    script: String,
    #[serde(default)]
    kwargs: IndexMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct SeedParams {
    seed: String,
}

#[derive(Serialize, Deserialize)]
struct ChunkParams {
    chunk: String,
    blob_id: String,
}

#[derive(Serialize, Deserialize)]
struct HelloParams {
    version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StatusResult {
    state: PlcState,
    log_counts: [u32; LOG_LEVELS],
}

#[derive(Serialize, Deserialize)]
struct TracesResult {
    state: PlcState,
    samples: Vec<SampleJson>,
}

#[derive(Serialize, Deserialize)]
struct SampleJson {
    tick: u32,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct CredentialsJson {
    id: String,
    secret: String,
}

#[derive(Serialize, Deserialize)]
struct ExecResult {
    code: i32,
    message: Option<String>,
}

/// A request line after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLine {
    pub id: u64,
    /// `Err` carries a method name this build does not know.
    pub request: Result<Request, String>,
}

pub fn encode_request(id: u64, request: &Request) -> Result<String, RuntimeError> {
    let params = match request {
        Request::NewPlc {
            digest,
            blob_id,
            extra_files,
        } => Some(to_value(&NewPlcParams {
            digest: digest.clone(),
            blob_id: blob_id.clone(),
            extra_files: extra_files
                .iter()
                .map(|file| ExtraFileJson {
                    name: file.name.clone(),
                    blob_id: file.blob_id.clone(),
                })
                .collect(),
        })?),
        Request::MatchMd5 { digest } => Some(json!({ "digest": digest })),
        Request::SetTraceVariablesList { orders } => Some(json!({ "orders": to_value(orders)? })),
        Request::GetLogMessage { level, msg_id } => {
            Some(json!({ "level": level, "msg_id": msg_id }))
        }
        Request::RemoteExec { script, kwargs } => {
            Some(json!({ "script": script, "kwargs": to_value(kwargs)? }))
        }
        Request::SeedBlob { seed } => Some(json!({ "seed": BASE64_STANDARD.encode(seed) })),
        Request::AppendChunkToBlob { chunk, blob_id } => Some(json!({
            "chunk": BASE64_STANDARD.encode(chunk),
            "blob_id": blob_id,
        })),
        Request::Hello {
            version,
            credentials,
        } => Some(to_value(&HelloParams {
            version: *version,
            id: credentials.as_ref().map(|c| c.id.clone()),
            secret: credentials.as_ref().map(|c| c.secret.clone()),
        })?),
        _ => None,
    };
    to_line(&JsonRequest {
        id,
        method: request.operation().wire_name().to_string(),
        params,
    })
}

/// Parse a request line; a line that is not a request object is malformed.
pub fn decode_request(line: &str) -> Result<RequestLine, RuntimeError> {
    let raw: JsonRequest = serde_json::from_str(line)
        .map_err(|err| RuntimeError::Codec(format!("invalid request: {err}").into()))?;
    let Some(op) = Operation::from_wire_name(&raw.method) else {
        return Ok(RequestLine {
            id: raw.id,
            request: Err(raw.method),
        });
    };
    let params = raw.params.unwrap_or(Value::Null);
    let request = match Request::bare(op) {
        Some(request) => request,
        None => match op {
            Operation::NewPlc => {
                let params: NewPlcParams = from_value(params)?;
                Request::NewPlc {
                    digest: params.digest,
                    blob_id: params.blob_id,
                    extra_files: params
                        .extra_files
                        .into_iter()
                        .map(|file| ExtraFileRef {
                            name: file.name,
                            blob_id: file.blob_id,
                        })
                        .collect(),
                }
            }
            Operation::MatchMd5 => Request::MatchMd5 {
                digest: from_value::<DigestParams>(params)?.digest,
            },
            Operation::SetTraceVariablesList => {
                let params: TraceParams = from_value(params)?;
                for order in &params.orders {
                    order.force_bytes()?;
                }
                Request::SetTraceVariablesList {
                    orders: params.orders,
                }
            }
            Operation::GetLogMessage => {
                let params: LogParams = from_value(params)?;
                Request::GetLogMessage {
                    level: params.level,
                    msg_id: params.msg_id,
                }
            }
            Operation::RemoteExec => {
                let params: ExecParams = from_value(params)?;
                Request::RemoteExec {
                    script: params.script,
                    kwargs: params.kwargs,
                }
            }
            Operation::SeedBlob => Request::SeedBlob {
                seed: decode_base64(&from_value::<SeedParams>(params)?.seed)?,
            },
            Operation::AppendChunkToBlob => {
                let params: ChunkParams = from_value(params)?;
                Request::AppendChunkToBlob {
                    chunk: decode_base64(&params.chunk)?,
                    blob_id: params.blob_id,
                }
            }
            Operation::Hello => {
                let params: HelloParams = from_value(params)?;
                let credentials = match (params.id, params.secret) {
                    (Some(id), Some(secret)) => Some(Credentials { id, secret }),
                    _ => None,
                };
                Request::Hello {
                    version: params.version,
                    credentials,
                }
            }
            other => {
                return Err(RuntimeError::Codec(
                    format!("{other} has no parameter layout").into(),
                ))
            }
        },
    };
    Ok(RequestLine {
        id: raw.id,
        request: Ok(request),
    })
}

pub fn encode_reply(id: u64, reply: &Reply) -> Result<String, RuntimeError> {
    let response = match reply {
        Reply::Ok(response) => JsonResponse {
            id,
            ok: true,
            result: Some(response_value(response)?),
            error: None,
        },
        Reply::Application { code, message } => JsonResponse {
            id,
            ok: false,
            result: None,
            error: Some(JsonError {
                kind: ErrorKind::Application,
                code: Some(*code),
                message: message.clone(),
            }),
        },
        Reply::NotImplemented(code) => {
            let name = Operation::from_code(*code)
                .map_or_else(|| format!("operation {code}"), |op| op.wire_name().to_string());
            return encode_not_implemented(id, &name);
        }
    };
    to_line(&response)
}

/// Reply for a method this build does not know.
pub fn encode_not_implemented(id: u64, method: &str) -> Result<String, RuntimeError> {
    to_line(&JsonResponse {
        id,
        ok: false,
        result: None,
        error: Some(JsonError {
            kind: ErrorKind::NotImplemented,
            code: None,
            message: format!("{method} not implemented"),
        }),
    })
}

/// Parse a reply line for a call to `op`.
pub fn decode_reply(line: &str, op: Operation) -> Result<(u64, Reply), RuntimeError> {
    let raw: JsonResponse = serde_json::from_str(line)
        .map_err(|err| RuntimeError::Codec(format!("invalid reply: {err}").into()))?;
    if !raw.ok {
        let error = raw
            .error
            .ok_or_else(|| RuntimeError::Codec("failed reply without error".into()))?;
        let reply = match error.kind {
            ErrorKind::NotImplemented => Reply::NotImplemented(op.code()),
            ErrorKind::Application => Reply::Application {
                code: error.code.unwrap_or(-1),
                message: error.message,
            },
        };
        return Ok((raw.id, reply));
    }
    let result = raw.result.unwrap_or(Value::Null);
    Ok((raw.id, Reply::Ok(response_from_value(op, result)?)))
}

fn response_value(response: &Response) -> Result<Value, RuntimeError> {
    Ok(match response {
        Response::Unit => Value::Null,
        Response::Bool(value) => Value::Bool(*value),
        Response::Status { state, log_counts } => to_value(&StatusResult {
            state: *state,
            log_counts: *log_counts,
        })?,
        Response::Traces { state, samples } => to_value(&TracesResult {
            state: *state,
            samples: samples
                .iter()
                .map(|sample| SampleJson {
                    tick: sample.tick,
                    data: BASE64_STANDARD.encode(&sample.data),
                })
                .collect(),
        })?,
        Response::PlcId(credentials) => match credentials {
            Some(credentials) => json!({ "id": credentials.id, "secret": credentials.secret }),
            None => Value::Null,
        },
        Response::LogMessage(entry) => to_value(entry)?,
        Response::Exec { code, message } => json!({ "code": code, "message": message }),
        Response::BlobId(id) => Value::String(id.clone()),
        Response::Version(version) => json!(version),
    })
}

fn response_from_value(op: Operation, value: Value) -> Result<Response, RuntimeError> {
    Ok(match op {
        Operation::StartPlc
        | Operation::StopPlc
        | Operation::ForceReload
        | Operation::NewPlc
        | Operation::MatchMd5
        | Operation::SetTraceVariablesList
        | Operation::RepairPlc => Response::Bool(from_value(value)?),
        Operation::GetPlcStatus => {
            let status: StatusResult = from_value(value)?;
            Response::Status {
                state: status.state,
                log_counts: status.log_counts,
            }
        }
        Operation::GetTraceVariables => {
            let traces: TracesResult = from_value(value)?;
            let samples = traces
                .samples
                .into_iter()
                .map(|sample| {
                    Ok(TraceSample {
                        tick: sample.tick,
                        data: decode_base64(&sample.data)?,
                    })
                })
                .collect::<Result<_, RuntimeError>>()?;
            Response::Traces {
                state: traces.state,
                samples,
            }
        }
        Operation::GetPlcId => Response::PlcId(
            from_value::<Option<CredentialsJson>>(value)?
                .map(|c| Credentials {
                    id: c.id,
                    secret: c.secret,
                }),
        ),
        Operation::GetLogMessage => Response::LogMessage(from_value::<Option<LogEntry>>(value)?),
        Operation::RemoteExec => {
            let result: ExecResult = from_value(value)?;
            Response::Exec {
                code: result.code,
                message: result.message,
            }
        }
        Operation::SeedBlob | Operation::AppendChunkToBlob => Response::BlobId(from_value(value)?),
        Operation::PurgeBlobs | Operation::ResetLogCount => Response::Unit,
        Operation::Hello => Response::Version(from_value(value)?),
    })
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, RuntimeError> {
    serde_json::to_value(value).map_err(|err| RuntimeError::Codec(err.to_string().into()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, RuntimeError> {
    serde_json::from_value(value)
        .map_err(|err| RuntimeError::Codec(format!("invalid params: {err}").into()))
}

fn to_line<T: Serialize>(value: &T) -> Result<String, RuntimeError> {
    serde_json::to_string(value).map_err(|err| RuntimeError::Codec(err.to_string().into()))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, RuntimeError> {
    BASE64_STANDARD
        .decode(text.as_bytes())
        .map_err(|err| RuntimeError::Codec(format!("invalid base64: {err}").into()))
}

/// Read one line of at most [`MAX_FRAME_LEN`] bytes, without the line
/// break. `None` on a clean end of stream.
pub fn read_line(reader: &mut impl BufRead) -> Result<Option<String>, RuntimeError> {
    read_line_limited(reader, MAX_FRAME_LEN)
}

fn read_line_limited(
    reader: &mut impl BufRead,
    limit: usize,
) -> Result<Option<String>, RuntimeError> {
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let read = reader.by_ref().take(cap).read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > limit {
        return Err(RuntimeError::Codec(
            format!("line longer than {limit} bytes").into(),
        ));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| RuntimeError::Codec("line is not UTF-8".into()))
}
