//! Typed remote calls over either binding.

#![allow(missing_docs)]

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use plc_runtime::debug::TraceOrder;
use plc_runtime::front::{
    codec, json, Credentials, ExtraFileRef, Operation, Reply, Request, Response, TraceSample,
    PROTOCOL_VERSION,
};
use plc_runtime::log::{LogEntry, LogLevel, LOG_LEVELS};
use plc_runtime::PlcState;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::defaults::default_response;
use crate::error::{ConnectorError, RemoteError};
use crate::psk::PskStore;
use crate::upload::{upload_blob, CHUNK_SIZE};
use crate::uri::{Scheme, ServiceUri};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

enum Link {
    Binary(TcpStream),
    Json {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    },
}

#[derive(Default)]
struct LinkState {
    link: Option<Link>,
    seq: u32,
}

/// Connection to one service.
///
/// A transport failure drops the connection; the next call reconnects and
/// repeats the handshake.
pub struct Connector {
    uri: ServiceUri,
    credentials: Option<Credentials>,
    psk: Option<PskStore>,
    state: Mutex<LinkState>,
    server_version: AtomicU8,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("uri", &self.uri)
            .field("server_version", &self.server_version())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Connect and handshake. With a PSK store and an `#ID` in the URI the
    /// stored secret is presented.
    pub fn connect(uri: ServiceUri, psk: Option<PskStore>) -> Result<Self, ConnectorError> {
        let credentials = match (&uri.id, &psk) {
            (Some(id), Some(store)) => store.secret(id)?.map(|secret| Credentials {
                id: id.clone(),
                secret,
            }),
            _ => None,
        };
        let connector = Self {
            uri,
            credentials,
            psk,
            state: Mutex::new(LinkState::default()),
            server_version: AtomicU8::new(PROTOCOL_VERSION),
        };
        {
            let mut state = connector.state.lock();
            connector.ensure_link(&mut state)?;
        }
        Ok(connector)
    }

    #[must_use]
    pub fn uri(&self) -> &ServiceUri {
        &self.uri
    }

    /// Protocol revision agreed with the service.
    #[must_use]
    pub fn server_version(&self) -> u8 {
        self.server_version.load(Ordering::SeqCst)
    }

    pub fn call(&self, request: Request) -> Result<Response, RemoteError> {
        let op = request.operation();
        if op.since_version() > self.server_version() {
            return Err(RemoteError::NotImplemented(op.wire_name().into()));
        }
        let mut state = self.state.lock();
        self.ensure_link(&mut state)?;
        match self.exchange(&mut state, &request)? {
            Reply::Ok(response) => Ok(response),
            Reply::NotImplemented(_) => Err(RemoteError::NotImplemented(op.wire_name().into())),
            Reply::Application { code, message } => Err(RemoteError::Application {
                code,
                message: message.into(),
            }),
        }
    }

    /// Like [`Connector::call`], falling back to the operation's default reply.
    pub fn call_or_default(&self, request: Request) -> Response {
        let op = request.operation();
        match self.call(request) {
            Ok(response) => response,
            Err(err) => {
                warn!(op = %op, "{err}; using default reply");
                default_response(op)
            }
        }
    }

    pub fn start_plc(&self) -> Result<bool, RemoteError> {
        expect_bool(Operation::StartPlc, self.call(Request::StartPlc)?)
    }

    pub fn stop_plc(&self) -> Result<bool, RemoteError> {
        expect_bool(Operation::StopPlc, self.call(Request::StopPlc)?)
    }

    pub fn force_reload(&self) -> Result<bool, RemoteError> {
        expect_bool(Operation::ForceReload, self.call(Request::ForceReload)?)
    }

    pub fn repair_plc(&self) -> Result<bool, RemoteError> {
        expect_bool(Operation::RepairPlc, self.call(Request::RepairPlc)?)
    }

    pub fn get_plc_status(&self) -> Result<(PlcState, [u32; LOG_LEVELS]), RemoteError> {
        match self.call(Request::GetPlcStatus)? {
            Response::Status { state, log_counts } => Ok((state, log_counts)),
            _ => Err(unexpected(Operation::GetPlcStatus)),
        }
    }

    /// Status that never fails: an unreachable service reads as
    /// `Disconnected`.
    #[must_use]
    pub fn poll_status(&self) -> (PlcState, [u32; LOG_LEVELS]) {
        match self.get_plc_status() {
            Ok(status) => status,
            Err(RemoteError::Transport(_)) => (PlcState::Disconnected, [0; LOG_LEVELS]),
            Err(_) => match default_response(Operation::GetPlcStatus) {
                Response::Status { state, log_counts } => (state, log_counts),
                _ => (PlcState::Broken, [0; LOG_LEVELS]),
            },
        }
    }

    pub fn match_md5(&self, digest: &str) -> Result<bool, RemoteError> {
        expect_bool(
            Operation::MatchMd5,
            self.call(Request::MatchMd5 {
                digest: digest.to_string(),
            })?,
        )
    }

    /// Upload the program and its extra files, then install them.
    pub fn new_plc(
        &self,
        digest: &str,
        binary: &[u8],
        extra_files: &[(String, Vec<u8>)],
    ) -> Result<bool, ConnectorError> {
        let blob_id = upload_blob(self, binary, CHUNK_SIZE)?;
        let mut refs = Vec::with_capacity(extra_files.len());
        for (name, data) in extra_files {
            refs.push(ExtraFileRef {
                name: name.clone(),
                blob_id: upload_blob(self, data, CHUNK_SIZE)?,
            });
        }
        let response = self.call(Request::NewPlc {
            digest: digest.to_string(),
            blob_id,
            extra_files: refs,
        })?;
        Ok(expect_bool(Operation::NewPlc, response)?)
    }

    pub fn set_trace_variables_list(&self, orders: Vec<TraceOrder>) -> Result<bool, RemoteError> {
        expect_bool(
            Operation::SetTraceVariablesList,
            self.call(Request::SetTraceVariablesList { orders })?,
        )
    }

    pub fn get_trace_variables(&self) -> Result<(PlcState, Vec<TraceSample>), RemoteError> {
        match self.call(Request::GetTraceVariables)? {
            Response::Traces { state, samples } => Ok((state, samples)),
            _ => Err(unexpected(Operation::GetTraceVariables)),
        }
    }

    /// Identity of the service. A returned identity is recorded in the PSK
    /// store, if there is one; failing to record it is only logged.
    pub fn get_plc_id(&self) -> Result<Option<Credentials>, RemoteError> {
        let credentials = match self.call(Request::GetPlcId)? {
            Response::PlcId(credentials) => credentials,
            _ => return Err(unexpected(Operation::GetPlcId)),
        };
        if let (Some(credentials), Some(store)) = (&credentials, &self.psk) {
            let uri = self.uri.clone().with_id(credentials.id.clone()).to_string();
            if let Err(err) = store.update_id(&credentials.id, &credentials.secret, &uri) {
                warn!("identity bookkeeping failed: {err}");
            }
        }
        Ok(credentials)
    }

    pub fn get_log_message(
        &self,
        level: LogLevel,
        msg_id: u32,
    ) -> Result<Option<LogEntry>, RemoteError> {
        #[allow(clippy::cast_possible_truncation)]
        let level = level.index() as u8;
        match self.call(Request::GetLogMessage { level, msg_id })? {
            Response::LogMessage(entry) => Ok(entry),
            _ => Err(unexpected(Operation::GetLogMessage)),
        }
    }

    pub fn reset_log_count(&self) -> Result<(), RemoteError> {
        self.call(Request::ResetLogCount).map(|_| ())
    }

    pub fn remote_exec(
        &self,
        script: &str,
        kwargs: IndexMap<String, String>,
    ) -> Result<(i32, Option<String>), RemoteError> {
        match self.call(Request::RemoteExec {
            script: script.to_string(),
            kwargs,
        })? {
            Response::Exec { code, message } => Ok((code, message)),
            _ => Err(unexpected(Operation::RemoteExec)),
        }
    }

    pub fn seed_blob(&self, seed: &[u8]) -> Result<String, RemoteError> {
        expect_blob_id(
            Operation::SeedBlob,
            self.call(Request::SeedBlob {
                seed: seed.to_vec(),
            })?,
        )
    }

    pub fn append_chunk_to_blob(&self, chunk: &[u8], blob_id: &str) -> Result<String, RemoteError> {
        expect_blob_id(
            Operation::AppendChunkToBlob,
            self.call(Request::AppendChunkToBlob {
                chunk: chunk.to_vec(),
                blob_id: blob_id.to_string(),
            })?,
        )
    }

    pub fn purge_blobs(&self) -> Result<(), RemoteError> {
        self.call(Request::PurgeBlobs).map(|_| ())
    }

    fn ensure_link(&self, state: &mut LinkState) -> Result<(), RemoteError> {
        if state.link.is_some() {
            return Ok(());
        }
        state.link = Some(open_link(&self.uri)?);
        let hello = Request::Hello {
            version: PROTOCOL_VERSION,
            credentials: self.credentials.clone(),
        };
        let version = match self.exchange(state, &hello)? {
            Reply::Ok(Response::Version(version)) => version.min(PROTOCOL_VERSION),
            Reply::NotImplemented(_) => 1,
            Reply::Application { code, message } => {
                state.link = None;
                return Err(RemoteError::Application {
                    code,
                    message: message.into(),
                });
            }
            Reply::Ok(_) => {
                state.link = None;
                return Err(unexpected(Operation::Hello));
            }
        };
        debug!(uri = %self.uri, version, "connected");
        self.server_version.store(version, Ordering::SeqCst);
        Ok(())
    }

    /// Send one request and read its reply. Any I/O or decoding failure
    /// drops the link.
    fn exchange(&self, state: &mut LinkState, request: &Request) -> Result<Reply, RemoteError> {
        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;
        let op = request.operation();
        let Some(link) = state.link.as_mut() else {
            return Err(RemoteError::Transport("not connected".into()));
        };
        let result = match link {
            Link::Binary(stream) => {
                let payload = codec::encode_request(PROTOCOL_VERSION, seq, request)
                    .map_err(|err| transport(&err))?;
                binary_roundtrip(stream, seq, &payload)
            }
            Link::Json { reader, writer } => {
                let line = json::encode_request(u64::from(seq), request)
                    .map_err(|err| transport(&err))?;
                json_roundtrip(reader, writer, seq, op, &line)
            }
        };
        if result.is_err() {
            state.link = None;
        }
        result
    }
}

fn open_link(uri: &ServiceUri) -> Result<Link, RemoteError> {
    let addr = uri
        .address()
        .to_socket_addrs()
        .map_err(|err| transport(&err))?
        .next()
        .ok_or_else(|| RemoteError::Transport(format!("{} does not resolve", uri.host).into()))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|err| transport(&err))?;
    stream
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .map_err(|err| transport(&err))?;
    let _ = stream.set_nodelay(true);
    Ok(match uri.scheme {
        Scheme::Binary => Link::Binary(stream),
        Scheme::Json => Link::Json {
            reader: BufReader::new(stream.try_clone().map_err(|err| transport(&err))?),
            writer: stream,
        },
    })
}

fn binary_roundtrip(stream: &mut TcpStream, seq: u32, payload: &[u8]) -> Result<Reply, RemoteError> {
    codec::write_frame(stream, payload).map_err(|err| transport(&err))?;
    let frame = codec::read_frame(stream)
        .map_err(|err| transport(&err))?
        .ok_or_else(|| RemoteError::Transport("connection closed".into()))?;
    let (reply_seq, reply) = codec::decode_reply(&frame).map_err(|err| transport(&err))?;
    if reply_seq != seq {
        return Err(RemoteError::Transport(
            format!("reply {reply_seq} does not answer request {seq}").into(),
        ));
    }
    Ok(reply)
}

fn json_roundtrip(
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    seq: u32,
    op: Operation,
    line: &str,
) -> Result<Reply, RemoteError> {
    writeln!(writer, "{line}")
        .and_then(|()| writer.flush())
        .map_err(|err| transport(&err))?;
    let reply = json::read_line(reader)
        .map_err(|err| transport(&err))?
        .ok_or_else(|| RemoteError::Transport("connection closed".into()))?;
    let (id, reply) = json::decode_reply(&reply, op).map_err(|err| transport(&err))?;
    if id != u64::from(seq) {
        return Err(RemoteError::Transport(
            format!("reply {id} does not answer request {seq}").into(),
        ));
    }
    Ok(reply)
}

fn transport(err: &impl std::fmt::Display) -> RemoteError {
    RemoteError::Transport(SmolStr::new(err.to_string()))
}

fn unexpected(op: Operation) -> RemoteError {
    RemoteError::Transport(format!("unexpected reply to {op}").into())
}

fn expect_bool(op: Operation, response: Response) -> Result<bool, RemoteError> {
    match response {
        Response::Bool(value) => Ok(value),
        _ => Err(unexpected(op)),
    }
}

fn expect_blob_id(op: Operation, response: Response) -> Result<String, RemoteError> {
    match response {
        Response::BlobId(id) => Ok(id),
        _ => Err(unexpected(op)),
    }
}
