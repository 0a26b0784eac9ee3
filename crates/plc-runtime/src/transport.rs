//! TCP listeners for the binary and JSON bindings.
//!
//! One accept thread per listener and one thread per connection. Each
//! connection carries its own [`Session`]. A frame or line that cannot be
//! decoded closes the connection.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::front::{codec, json, Reply, ServiceFront, Session};

/// A running listener.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    connections: Arc<Connections>,
}

/// Open connections, so shutdown can close them.
#[derive(Debug, Default)]
struct Connections {
    next: AtomicU64,
    open: Mutex<HashMap<u64, TcpStream>>,
}

impl Connections {
    fn register(&self, stream: &TcpStream) -> Option<u64> {
        let clone = stream.try_clone().ok()?;
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(id, clone);
        Some(id)
    }

    fn release(&self, id: Option<u64>) {
        if let Some(id) = id {
            self.open.lock().remove(&id);
        }
    }

    fn close_all(&self) {
        for (_, stream) in self.open.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl ServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close the open ones.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(self.addr);
        self.connections.close_all();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Listen for the binary binding on `addr`.
pub fn spawn_binary_server(
    addr: &str,
    front: Arc<ServiceFront>,
) -> Result<ServerHandle, RuntimeError> {
    spawn_server("binary", addr, front, handle_binary_client)
}

/// Listen for the JSON binding on `addr`.
pub fn spawn_json_server(addr: &str, front: Arc<ServiceFront>) -> Result<ServerHandle, RuntimeError> {
    spawn_server("json", addr, front, handle_json_client)
}

fn spawn_server(
    binding: &'static str,
    addr: &str,
    front: Arc<ServiceFront>,
    handler: fn(TcpStream, &ServiceFront),
) -> Result<ServerHandle, RuntimeError> {
    let listener = TcpListener::bind(addr)
        .map_err(|err| RuntimeError::Transport(format!("bind {addr}: {err}").into()))?;
    let local = listener
        .local_addr()
        .map_err(|err| RuntimeError::Transport(format!("local address: {err}").into()))?;
    let stop = Arc::new(AtomicBool::new(false));
    let connections = Arc::new(Connections::default());
    let accept_stop = stop.clone();
    let accept_connections = connections.clone();
    thread::Builder::new()
        .name(format!("plc-{binding}-accept"))
        .spawn(move || {
            for stream in listener.incoming().map_while(Result::ok) {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                let peer = stream
                    .peer_addr()
                    .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
                debug!(binding, peer = %peer, "connection accepted");
                let front = front.clone();
                let connections = accept_connections.clone();
                let id = connections.register(&stream);
                let spawned = thread::Builder::new()
                    .name(format!("plc-{binding}-conn"))
                    .spawn(move || {
                        handler(stream, &front);
                        connections.release(id);
                        debug!(binding, peer = %peer, "connection closed");
                    });
                if let Err(err) = spawned {
                    warn!(binding, "connection thread spawn failed: {err}");
                }
            }
        })
        .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
    info!(binding, addr = %local, "listening");
    Ok(ServerHandle {
        addr: local,
        stop,
        connections,
    })
}

fn handle_binary_client(stream: TcpStream, front: &ServiceFront) {
    let mut reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(_) => return,
    };
    let mut writer = stream;
    let mut session = front.new_session();
    loop {
        let payload = match codec::read_frame(&mut reader) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(err) => {
                warn!("closing connection: {err}");
                return;
            }
        };
        let response = match handle_frame(front, &mut session, &payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("closing connection: {err}");
                return;
            }
        };
        if codec::write_frame(&mut writer, &response).is_err() {
            return;
        }
    }
}

fn handle_json_client(stream: TcpStream, front: &ServiceFront) {
    let mut reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(_) => return,
    };
    let mut writer = stream;
    let mut session = front.new_session();
    loop {
        let line = match json::read_line(&mut reader) {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                warn!("closing connection: {err}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match handle_line(front, &mut session, &line) {
            Ok(response) => {
                if writeln!(writer, "{response}").is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("closing connection: {err}");
                return;
            }
        }
    }
}

/// Answer one binary request payload.
pub fn handle_frame(
    front: &ServiceFront,
    session: &mut Session,
    payload: &[u8],
) -> Result<Vec<u8>, RuntimeError> {
    let frame = codec::decode_request(payload)?;
    let reply = match frame.request {
        Ok(request) => front.dispatch(session, request),
        Err(code) => {
            debug!(op = code, "unknown operation");
            Reply::NotImplemented(code)
        }
    };
    codec::encode_reply(frame.seq, &reply)
}

/// Answer one JSON request line.
pub fn handle_line(
    front: &ServiceFront,
    session: &mut Session,
    line: &str,
) -> Result<String, RuntimeError> {
    let parsed = json::decode_request(line)?;
    match parsed.request {
        Ok(request) => json::encode_reply(parsed.id, &front.dispatch(session, request)),
        Err(method) => {
            debug!(method = %method, "unknown method");
            json::encode_not_implemented(parsed.id, &method)
        }
    }
}
