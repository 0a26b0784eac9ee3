use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use plc_runtime::blob::content_id;
use plc_runtime::config::{Binding, ServiceConfig};
use plc_runtime::debug::{decode_buffer, IecType, TraceOrder};
use plc_runtime::front::{
    codec, Credentials, Reply, Request, Response, CODE_UNAUTHORIZED, PROTOCOL_VERSION,
};
use plc_runtime::identity::{Identity, SECRET_FILE_NAME};
use plc_runtime::loader::SimulatedLoader;
use plc_runtime::{PlcState, ServiceContext};

const COUNTER: &str = r#"
[program]
name = "counter"
cycle_ms = 2

[[variable]]
type = "INT"
value = 0
step = 1

[[variable]]
type = "BOOL"
step = 1
"#;

const MISSING_EXPORT: &str = r#"
[program]
exports = ["startPLC", "stopPLC"]
"#;

fn temp_dir(name: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "plc-runtime-service-{name}-{}-{stamp}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        interface: "127.0.0.1".into(),
        port: 0,
        json_port: 0,
        binding: Binding::Both,
        trace_idle_suspend: Duration::from_secs(30),
        ..ServiceConfig::default()
    }
}

struct Harness {
    service: ServiceContext,
    worker: Option<JoinHandle<()>>,
    dir: PathBuf,
}

impl Harness {
    fn start(name: &str) -> Self {
        Self::start_with(temp_dir(name), test_config())
    }

    fn start_with(dir: PathBuf, config: ServiceConfig) -> Self {
        let service = ServiceContext::start(config, &dir, Arc::new(SimulatedLoader)).unwrap();
        let worker = service.worker().spawn("test-worker").unwrap();
        service.bootstrap();
        Self {
            service,
            worker: Some(worker),
            dir,
        }
    }

    fn binary(&self) -> BinClient {
        BinClient::connect(self.service.binary_addr().unwrap())
    }

    /// Stop everything but keep the working directory.
    fn stop(mut self) -> PathBuf {
        self.service.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
        std::mem::take(&mut self.dir)
    }

    fn finish(self) {
        let dir = self.stop();
        let _ = std::fs::remove_dir_all(dir);
    }
}

struct BinClient {
    stream: TcpStream,
    seq: u32,
}

impl BinClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self { stream, seq: 0 }
    }

    fn call(&mut self, request: Request) -> Reply {
        self.seq += 1;
        let payload = codec::encode_request(PROTOCOL_VERSION, self.seq, &request).unwrap();
        codec::write_frame(&mut self.stream, &payload).unwrap();
        let reply = codec::read_frame(&mut self.stream).unwrap().expect("reply frame");
        let (seq, reply) = codec::decode_reply(&reply).unwrap();
        assert_eq!(seq, self.seq);
        reply
    }

    fn flag(&mut self, request: Request) -> bool {
        match self.call(request) {
            Reply::Ok(Response::Bool(value)) => value,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn status(&mut self) -> (PlcState, [u32; 4]) {
        match self.call(Request::GetPlcStatus) {
            Reply::Ok(Response::Status { state, log_counts }) => (state, log_counts),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn blob_id(&mut self, request: Request) -> String {
        match self.call(request) {
            Reply::Ok(Response::BlobId(id)) => id,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn upload(&mut self, data: &[u8], chunk: usize) -> String {
        let seed = b"seed".to_vec();
        let mut id = self.blob_id(Request::SeedBlob { seed: seed.clone() });
        for part in data.chunks(chunk) {
            id = self.blob_id(Request::AppendChunkToBlob {
                chunk: part.to_vec(),
                blob_id: id,
            });
        }
        assert_eq!(id, content_id(&seed, data));
        id
    }

    fn new_plc(&mut self, digest: &str, program: &str) -> bool {
        let blob_id = self.upload(program.as_bytes(), 16);
        self.flag(Request::NewPlc {
            digest: digest.into(),
            blob_id,
            extra_files: Vec::new(),
        })
    }
}

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn fresh_install_then_start_and_stop() {
    let harness = Harness::start("lifecycle");
    let mut client = harness.binary();

    assert_eq!(client.status().0, PlcState::Empty);
    assert!(client.new_plc("abc", COUNTER));
    assert_eq!(client.status().0, PlcState::Stopped);

    assert!(client.flag(Request::StartPlc));
    assert_eq!(client.status().0, PlcState::Started);
    assert!(!client.flag(Request::StartPlc));
    assert_eq!(client.status().0, PlcState::Started);

    assert!(client.flag(Request::StopPlc));
    assert_eq!(client.status().0, PlcState::Stopped);
    assert!(!client.flag(Request::StopPlc));
    harness.finish();
}

#[test]
fn missing_entry_point_breaks_until_reinstalled() {
    let harness = Harness::start("broken");
    let mut client = harness.binary();

    assert!(!client.new_plc("bad", MISSING_EXPORT));
    let (state, counts) = client.status();
    assert_eq!(state, PlcState::Broken);
    assert!(counts[0] >= 1);
    assert!(!client.flag(Request::StartPlc));
    assert_eq!(client.status().0, PlcState::Broken);

    assert!(client.new_plc("good", COUNTER));
    assert_eq!(client.status().0, PlcState::Stopped);
    harness.finish();
}

#[test]
fn traces_arrive_in_tick_order() {
    let harness = Harness::start("trace");
    let mut client = harness.binary();
    assert!(client.new_plc("abc", COUNTER));
    assert!(client.flag(Request::SetTraceVariablesList {
        orders: vec![
            TraceOrder::new(0, IecType::Int),
            TraceOrder::new(1, IecType::Bool),
        ],
    }));
    assert!(client.flag(Request::StartPlc));

    let mut ticks = Vec::new();
    assert!(wait_until(|| {
        match client.call(Request::GetTraceVariables) {
            Reply::Ok(Response::Traces { state, samples }) => {
                assert_eq!(state, PlcState::Started);
                for sample in samples {
                    let values =
                        decode_buffer(&[IecType::Int, IecType::Bool], &sample.data).unwrap();
                    assert_eq!(values.len(), 2);
                    ticks.push(sample.tick);
                }
            }
            other => panic!("unexpected reply {other:?}"),
        }
        ticks.len() >= 5
    }));
    assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));

    assert!(client.flag(Request::StopPlc));
    match client.call(Request::GetTraceVariables) {
        Reply::Ok(Response::Traces { state, samples }) => {
            assert_eq!(state, PlcState::Stopped);
            assert!(samples.is_empty());
        }
        other => panic!("unexpected reply {other:?}"),
    }
    harness.finish();
}

#[test]
fn concurrent_clients_agree_on_digest() {
    let harness = Harness::start("match");
    let mut installer = harness.binary();
    assert!(installer.new_plc("abc", COUNTER));

    let addr = harness.service.binary_addr().unwrap();
    let checks: Vec<_> = ["abc", "abc", "xyz"]
        .into_iter()
        .map(|digest| {
            thread::spawn(move || {
                BinClient::connect(addr).flag(Request::MatchMd5 {
                    digest: digest.into(),
                })
            })
        })
        .collect();
    let results: Vec<bool> = checks.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![true, true, false]);
    harness.finish();
}

#[test]
fn interrupted_upload_keeps_installed_program() {
    let harness = Harness::start("no-partial");
    let mut client = harness.binary();
    assert!(client.new_plc("first", COUNTER));

    let seed = b"s".to_vec();
    let id = client.blob_id(Request::SeedBlob { seed });
    let partial = client.blob_id(Request::AppendChunkToBlob {
        chunk: b"[program]\n".to_vec(),
        blob_id: id.clone(),
    });
    // The client resumes from a stale id: the server no longer knows it.
    match client.call(Request::AppendChunkToBlob {
        chunk: b"cycle_ms = 2\n".to_vec(),
        blob_id: id,
    }) {
        Reply::Application { .. } => {}
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(!client.flag(Request::NewPlc {
        digest: "second".into(),
        blob_id: "not-a-blob".into(),
        extra_files: Vec::new(),
    }));
    assert!(client.flag(Request::MatchMd5 {
        digest: "first".into()
    }));
    assert_eq!(client.status().0, PlcState::Stopped);

    client.call(Request::PurgeBlobs);
    assert!(!client.flag(Request::NewPlc {
        digest: "second".into(),
        blob_id: partial,
        extra_files: Vec::new(),
    }));
    assert!(client.flag(Request::MatchMd5 {
        digest: "first".into()
    }));

    let dir = harness.stop();
    let restarted = Harness::start_with(dir, test_config());
    let mut client = restarted.binary();
    assert_eq!(client.status().0, PlcState::Stopped);
    assert!(client.flag(Request::MatchMd5 {
        digest: "first".into()
    }));
    restarted.finish();
}

#[test]
fn state_machine_stays_within_defined_states() {
    let harness = Harness::start("totality");
    let mut client = harness.binary();
    let ops = [
        "start", "new", "new", "start", "start", "stop", "stop", "bad", "start", "new", "start",
        "new", "stop",
    ];
    for op in ops {
        let before = client.status().0;
        let changed = match op {
            "start" => client.flag(Request::StartPlc),
            "stop" => client.flag(Request::StopPlc),
            "new" => client.new_plc("abc", COUNTER),
            _ => client.new_plc("bad", MISSING_EXPORT),
        };
        let after = client.status().0;
        assert_ne!(after, PlcState::Disconnected);
        if !changed && op != "bad" {
            assert_eq!(before, after, "no-op {op} changed state");
        }
    }
    harness.finish();
}

#[test]
fn unknown_operation_is_not_implemented() {
    let harness = Harness::start("unknown-op");
    let mut stream = TcpStream::connect(harness.service.binary_addr().unwrap()).unwrap();
    codec::write_frame(&mut stream, &[PROTOCOL_VERSION, 200, 1, 0, 0, 0]).unwrap();
    let reply = codec::read_frame(&mut stream).unwrap().unwrap();
    assert_eq!(
        codec::decode_reply(&reply).unwrap(),
        (1, Reply::NotImplemented(200))
    );
    harness.finish();
}

#[test]
fn malformed_frame_closes_connection() {
    let harness = Harness::start("malformed");
    let mut stream = TcpStream::connect(harness.service.binary_addr().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    codec::write_frame(&mut stream, &[PROTOCOL_VERSION]).unwrap();
    assert_eq!(codec::read_frame(&mut stream).unwrap(), None);
    harness.finish();
}

#[test]
fn json_binding_serves_the_same_operations() {
    let harness = Harness::start("json");
    let stream = TcpStream::connect(harness.service.json_addr().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    writeln!(writer, r#"{{"id":1,"method":"GetPLCstatus"}}"#).unwrap();
    reader.read_line(&mut line).unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["id"], 1);
    assert_eq!(value["ok"], true);
    assert_eq!(value["result"]["state"], "Empty");

    line.clear();
    writeln!(writer, r#"{{"id":2,"method":"Reboot"}}"#).unwrap();
    reader.read_line(&mut line).unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["kind"], "not_implemented");

    line.clear();
    writeln!(
        writer,
        r#"{{"id":3,"method":"RemoteExec","params":{{"script":"returnVal = status() + who","kwargs":{{"who":"!"}}}}}}"#
    )
    .unwrap();
    reader.read_line(&mut line).unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["result"]["code"], 0);
    assert_eq!(value["result"]["message"], "Empty!");
    harness.finish();
}

#[test]
fn psk_is_required_when_configured() {
    let dir = temp_dir("psk");
    let identity = Identity::parse("plc-1:s3cret").unwrap();
    identity.save(&dir.join(SECRET_FILE_NAME)).unwrap();
    let config = ServiceConfig {
        require_psk: true,
        ..test_config()
    };
    let harness = Harness::start_with(dir, config);
    let mut client = harness.binary();

    match client.call(Request::GetPlcStatus) {
        Reply::Application { code, .. } => assert_eq!(code, CODE_UNAUTHORIZED),
        other => panic!("unexpected reply {other:?}"),
    }
    match client.call(Request::Hello {
        version: PROTOCOL_VERSION,
        credentials: Some(Credentials {
            id: "plc-1".into(),
            secret: "wrong".into(),
        }),
    }) {
        Reply::Application { code, .. } => assert_eq!(code, CODE_UNAUTHORIZED),
        other => panic!("unexpected reply {other:?}"),
    }
    assert_eq!(
        client.call(Request::Hello {
            version: PROTOCOL_VERSION,
            credentials: Some(Credentials {
                id: "plc-1".into(),
                secret: "s3cret".into(),
            }),
        }),
        Reply::Ok(Response::Version(PROTOCOL_VERSION))
    );
    assert_eq!(client.status().0, PlcState::Empty);
    match client.call(Request::GetPlcId) {
        Reply::Ok(Response::PlcId(Some(credentials))) => assert_eq!(credentials.id, "plc-1"),
        other => panic!("unexpected reply {other:?}"),
    }
    harness.finish();
}

#[test]
fn repair_uninstalls_and_quits_worker() {
    let harness = Harness::start("repair");
    let mut client = harness.binary();
    assert!(client.new_plc("abc", COUNTER));
    assert!(client.flag(Request::RepairPlc));
    assert!(!Path::new(&harness.dir).join("abc.plc").exists());
    assert_eq!(client.status().0, PlcState::Empty);
    harness.finish();
}
