//! Binary binding.
//!
//! Every message is a frame: a little-endian `u32` payload length followed
//! by the payload.
//!
//! ```text
//! request  = version:u8 op:u8 seq:u32 args...
//! reply    = seq:u32 status:u8 body...
//!   status 0  ok           body = tag:u8 fields...
//!   status 1  application  body = code:i32 message:str
//!   status 2  not impl.    body = op:u8
//! ```
//!
//! Strings and byte strings carry a `u32` length prefix, optional values a
//! `u8` presence tag, and lists a `u32` element count.

use std::io::{ErrorKind, Read, Write};

use indexmap::IndexMap;

use super::{Credentials, ExtraFileRef, Operation, Reply, Request, Response, TraceSample};
use crate::controller::PlcState;
use crate::debug::{IecType, TraceOrder};
use crate::error::RuntimeError;
use crate::log::{LogEntry, LOG_LEVELS};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Reply bytes around a trace batch: sequence, status, tag, state, count.
const TRACE_REPLY_HEADER: usize = 4 + 1 + 1 + 1 + 4;

/// Largest trace backlog, as counted by [`crate::debug::TraceBuffer`], that
/// still fits in one `GetTraceVariables` reply.
pub const MAX_TRACE_BACKLOG: usize = MAX_FRAME_LEN - TRACE_REPLY_HEADER;

const STATUS_OK: u8 = 0;
const STATUS_APPLICATION: u8 = 1;
const STATUS_NOT_IMPLEMENTED: u8 = 2;

const TAG_UNIT: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_STATUS: u8 = 2;
const TAG_TRACES: u8 = 3;
const TAG_PLC_ID: u8 = 4;
const TAG_LOG_MESSAGE: u8 = 5;
const TAG_EXEC: u8 = 6;
const TAG_BLOB_ID: u8 = 7;
const TAG_VERSION: u8 = 8;

/// A request as read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub version: u8,
    pub seq: u32,
    /// `Err` carries an operation code this build does not know.
    pub request: Result<Request, u8>,
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>, RuntimeError> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(RuntimeError::Transport(err.to_string().into())),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RuntimeError::Codec(
            format!("frame of {len} bytes exceeds limit").into(),
        ));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| RuntimeError::Transport(err.to_string().into()))?;
    Ok(Some(payload))
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), RuntimeError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| RuntimeError::Codec("frame too large".into()))?;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|()| writer.write_all(payload))
        .and_then(|()| writer.flush())
        .map_err(|err| RuntimeError::Transport(err.to_string().into()))
}

pub fn encode_request(version: u8, seq: u32, request: &Request) -> Result<Vec<u8>, RuntimeError> {
    let mut out = Encoder::default();
    out.u8(version);
    out.u8(request.operation().code());
    out.u32(seq);
    match request {
        Request::StartPlc
        | Request::StopPlc
        | Request::ForceReload
        | Request::GetPlcStatus
        | Request::GetTraceVariables
        | Request::GetPlcId
        | Request::PurgeBlobs
        | Request::RepairPlc
        | Request::ResetLogCount => {}
        Request::NewPlc {
            digest,
            blob_id,
            extra_files,
        } => {
            out.str(digest);
            out.str(blob_id);
            out.count(extra_files.len())?;
            for file in extra_files {
                out.str(&file.name);
                out.str(&file.blob_id);
            }
        }
        Request::MatchMd5 { digest } => out.str(digest),
        Request::SetTraceVariablesList { orders } => {
            out.count(orders.len())?;
            for order in orders {
                out.u32(order.idx);
                out.u8(order.iec_type.code());
                match order.force_bytes()? {
                    Some(bytes) => {
                        out.u8(1);
                        out.bytes(&bytes);
                    }
                    None => out.u8(0),
                }
            }
        }
        Request::GetLogMessage { level, msg_id } => {
            out.u8(*level);
            out.u32(*msg_id);
        }
        Request::RemoteExec { script, kwargs } => {
            out.str(script);
            out.count(kwargs.len())?;
            for (name, value) in kwargs {
                out.str(name);
                out.str(value);
            }
        }
        Request::SeedBlob { seed } => out.bytes(seed),
        Request::AppendChunkToBlob { chunk, blob_id } => {
            out.bytes(chunk);
            out.str(blob_id);
        }
        Request::Hello {
            version,
            credentials,
        } => {
            out.u8(*version);
            out.credentials(credentials.as_ref());
        }
    }
    Ok(out.finish())
}

pub fn decode_request(payload: &[u8]) -> Result<RequestFrame, RuntimeError> {
    let mut input = Decoder::new(payload);
    let version = input.u8()?;
    let code = input.u8()?;
    let seq = input.u32()?;
    let Some(op) = Operation::from_code(code) else {
        return Ok(RequestFrame {
            version,
            seq,
            request: Err(code),
        });
    };
    let request = match Request::bare(op) {
        Some(request) => request,
        None => match op {
            Operation::NewPlc => {
                let digest = input.string()?;
                let blob_id = input.string()?;
                let count = input.count()?;
                let mut extra_files = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    extra_files.push(ExtraFileRef {
                        name: input.string()?,
                        blob_id: input.string()?,
                    });
                }
                Request::NewPlc {
                    digest,
                    blob_id,
                    extra_files,
                }
            }
            Operation::MatchMd5 => Request::MatchMd5 {
                digest: input.string()?,
            },
            Operation::SetTraceVariablesList => {
                let count = input.count()?;
                let mut orders = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let idx = input.u32()?;
                    let code = input.u8()?;
                    let iec_type = IecType::from_code(code).ok_or_else(|| {
                        RuntimeError::Codec(format!("unknown type code {code}").into())
                    })?;
                    let mut order = TraceOrder::new(idx, iec_type);
                    if input.flag()? {
                        let bytes = input.bytes()?;
                        order = order.forced(iec_type.decode_force(&bytes)?);
                    }
                    orders.push(order);
                }
                Request::SetTraceVariablesList { orders }
            }
            Operation::GetLogMessage => Request::GetLogMessage {
                level: input.u8()?,
                msg_id: input.u32()?,
            },
            Operation::RemoteExec => {
                let script = input.string()?;
                let count = input.count()?;
                let mut kwargs = IndexMap::with_capacity(count.min(64));
                for _ in 0..count {
                    let name = input.string()?;
                    kwargs.insert(name, input.string()?);
                }
                Request::RemoteExec { script, kwargs }
            }
            Operation::SeedBlob => Request::SeedBlob {
                seed: input.bytes()?,
            },
            Operation::AppendChunkToBlob => Request::AppendChunkToBlob {
                chunk: input.bytes()?,
                blob_id: input.string()?,
            },
            Operation::Hello => Request::Hello {
                version: input.u8()?,
                credentials: input.credentials()?,
            },
            other => {
                return Err(RuntimeError::Codec(
                    format!("{other} has no argument layout").into(),
                ))
            }
        },
    };
    input.finish()?;
    Ok(RequestFrame {
        version,
        seq,
        request: Ok(request),
    })
}

pub fn encode_reply(seq: u32, reply: &Reply) -> Result<Vec<u8>, RuntimeError> {
    let mut out = Encoder::default();
    out.u32(seq);
    match reply {
        Reply::Ok(response) => {
            out.u8(STATUS_OK);
            encode_response(&mut out, response)?;
        }
        Reply::Application { code, message } => {
            out.u8(STATUS_APPLICATION);
            out.i32(*code);
            out.str(message);
        }
        Reply::NotImplemented(op) => {
            out.u8(STATUS_NOT_IMPLEMENTED);
            out.u8(*op);
        }
    }
    Ok(out.finish())
}

fn encode_response(out: &mut Encoder, response: &Response) -> Result<(), RuntimeError> {
    match response {
        Response::Unit => out.u8(TAG_UNIT),
        Response::Bool(value) => {
            out.u8(TAG_BOOL);
            out.u8(u8::from(*value));
        }
        Response::Status { state, log_counts } => {
            out.u8(TAG_STATUS);
            out.u8(state.code());
            for count in log_counts {
                out.u32(*count);
            }
        }
        Response::Traces { state, samples } => {
            out.u8(TAG_TRACES);
            out.u8(state.code());
            out.count(samples.len())?;
            for sample in samples {
                out.u32(sample.tick);
                out.bytes(&sample.data);
            }
        }
        Response::PlcId(credentials) => {
            out.u8(TAG_PLC_ID);
            out.credentials(credentials.as_ref());
        }
        Response::LogMessage(entry) => {
            out.u8(TAG_LOG_MESSAGE);
            match entry {
                Some(entry) => {
                    out.u8(1);
                    out.str(&entry.message);
                    out.u32(entry.tick);
                    out.u32(entry.sec);
                    out.u32(entry.nsec);
                }
                None => out.u8(0),
            }
        }
        Response::Exec { code, message } => {
            out.u8(TAG_EXEC);
            out.i32(*code);
            match message {
                Some(message) => {
                    out.u8(1);
                    out.str(message);
                }
                None => out.u8(0),
            }
        }
        Response::BlobId(id) => {
            out.u8(TAG_BLOB_ID);
            out.str(id);
        }
        Response::Version(version) => {
            out.u8(TAG_VERSION);
            out.u8(*version);
        }
    }
    Ok(())
}

pub fn decode_reply(payload: &[u8]) -> Result<(u32, Reply), RuntimeError> {
    let mut input = Decoder::new(payload);
    let seq = input.u32()?;
    let reply = match input.u8()? {
        STATUS_OK => Reply::Ok(decode_response(&mut input)?),
        STATUS_APPLICATION => Reply::Application {
            code: input.i32()?,
            message: input.string()?,
        },
        STATUS_NOT_IMPLEMENTED => Reply::NotImplemented(input.u8()?),
        other => {
            return Err(RuntimeError::Codec(
                format!("unknown reply status {other}").into(),
            ))
        }
    };
    input.finish()?;
    Ok((seq, reply))
}

fn decode_response(input: &mut Decoder<'_>) -> Result<Response, RuntimeError> {
    Ok(match input.u8()? {
        TAG_UNIT => Response::Unit,
        TAG_BOOL => Response::Bool(input.flag()?),
        TAG_STATUS => {
            let state = input.state()?;
            let mut log_counts = [0u32; LOG_LEVELS];
            for count in &mut log_counts {
                *count = input.u32()?;
            }
            Response::Status { state, log_counts }
        }
        TAG_TRACES => {
            let state = input.state()?;
            let count = input.count()?;
            let mut samples = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                samples.push(TraceSample {
                    tick: input.u32()?,
                    data: input.bytes()?,
                });
            }
            Response::Traces { state, samples }
        }
        TAG_PLC_ID => Response::PlcId(input.credentials()?),
        TAG_LOG_MESSAGE => {
            let entry = if input.flag()? {
                Some(LogEntry {
                    message: input.string()?,
                    tick: input.u32()?,
                    sec: input.u32()?,
                    nsec: input.u32()?,
                })
            } else {
                None
            };
            Response::LogMessage(entry)
        }
        TAG_EXEC => {
            let code = input.i32()?;
            let message = if input.flag()? {
                Some(input.string()?)
            } else {
                None
            };
            Response::Exec { code, message }
        }
        TAG_BLOB_ID => Response::BlobId(input.string()?),
        TAG_VERSION => Response::Version(input.u8()?),
        other => {
            return Err(RuntimeError::Codec(
                format!("unknown response tag {other}").into(),
            ))
        }
    })
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn count(&mut self, len: usize) -> Result<(), RuntimeError> {
        let len = u32::try_from(len).map_err(|_| RuntimeError::Codec("list too long".into()))?;
        self.u32(len);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bytes(&mut self, value: &[u8]) {
        // Frames are capped well below u32::MAX, write_frame rejects the rest.
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn credentials(&mut self, credentials: Option<&Credentials>) {
        match credentials {
            Some(credentials) => {
                self.u8(1);
                self.str(&credentials.id);
                self.str(&credentials.secret);
            }
            None => self.u8(0),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], RuntimeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                RuntimeError::Codec(format!("truncated payload at offset {}", self.pos).into())
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RuntimeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, RuntimeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn i32(&mut self) -> Result<i32, RuntimeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn flag(&mut self) -> Result<bool, RuntimeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RuntimeError::Codec(format!("invalid flag {other}").into())),
        }
    }

    fn count(&mut self) -> Result<usize, RuntimeError> {
        Ok(self.u32()? as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, RuntimeError> {
        let len = self.count()?;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, RuntimeError> {
        String::from_utf8(self.bytes()?)
            .map_err(|_| RuntimeError::Codec("string is not valid UTF-8".into()))
    }

    fn state(&mut self) -> Result<PlcState, RuntimeError> {
        let code = self.u8()?;
        PlcState::from_code(code)
            .ok_or_else(|| RuntimeError::Codec(format!("unknown PLC state {code}").into()))
    }

    fn credentials(&mut self) -> Result<Option<Credentials>, RuntimeError> {
        if !self.flag()? {
            return Ok(None);
        }
        Ok(Some(Credentials {
            id: self.string()?,
            secret: self.string()?,
        }))
    }

    fn finish(&self) -> Result<(), RuntimeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(RuntimeError::Codec(
                format!("{} trailing bytes", self.buf.len() - self.pos).into(),
            ))
        }
    }
}
