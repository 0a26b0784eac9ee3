use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use plc_connector::upload::upload_with_seed;
use plc_connector::{Connector, ConnectorError, PskStore, RemoteError, Scheme, ServiceUri};
use plc_runtime::config::{Binding, ServiceConfig};
use plc_runtime::debug::{decode_buffer, IecType, IecValue, TraceOrder};
use plc_runtime::front::{Request, Response};
use plc_runtime::log::LogLevel;
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
"#;

fn temp_dir(name: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "plc-connector-{name}-{}-{stamp}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct Service {
    context: ServiceContext,
    worker: Option<JoinHandle<()>>,
    dir: PathBuf,
}

impl Service {
    fn start(name: &str) -> Self {
        let dir = temp_dir(name);
        let config = ServiceConfig {
            interface: "127.0.0.1".into(),
            port: 0,
            json_port: 0,
            binding: Binding::Both,
            ..ServiceConfig::default()
        };
        let context =
            ServiceContext::start(config, dir.join("work"), Arc::new(SimulatedLoader)).unwrap();
        let worker = context.worker().spawn("test-worker").unwrap();
        context.bootstrap();
        Self {
            context,
            worker: Some(worker),
            dir,
        }
    }

    fn uri(&self, scheme: Scheme) -> ServiceUri {
        let addr = match scheme {
            Scheme::Binary => self.context.binary_addr(),
            Scheme::Json => self.context.json_addr(),
        }
        .unwrap();
        ServiceUri {
            scheme,
            host: addr.ip().to_string(),
            port: addr.port(),
            id: None,
        }
    }

    fn stop(&mut self) {
        self.context.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn exercise(connector: &Connector) {
    assert_eq!(connector.get_plc_status().unwrap().0, PlcState::Empty);
    assert!(connector.new_plc("abc", COUNTER.as_bytes(), &[]).unwrap());
    assert!(connector.match_md5("abc").unwrap());
    assert!(!connector.match_md5("xyz").unwrap());
    assert!(connector
        .set_trace_variables_list(vec![TraceOrder::new(0, IecType::Int)])
        .unwrap());
    assert!(connector.start_plc().unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut last = None;
    while last.is_none() && Instant::now() < deadline {
        let (state, samples) = connector.get_trace_variables().unwrap();
        assert_eq!(state, PlcState::Started);
        last = samples.last().cloned();
        thread::sleep(Duration::from_millis(20));
    }
    let sample = last.expect("no trace sample");
    let values = decode_buffer(&[IecType::Int], &sample.data).unwrap();
    assert!(matches!(values[0], IecValue::Signed(_)));

    assert!(connector.stop_plc().unwrap());
    let (state, counts) = connector.get_plc_status().unwrap();
    assert_eq!(state, PlcState::Stopped);
    assert!(counts[LogLevel::Info.index()] >= 1);
    let messages: Vec<String> = (0..counts[LogLevel::Info.index()])
        .filter_map(|id| connector.get_log_message(LogLevel::Info, id).unwrap())
        .map(|entry| entry.message)
        .collect();
    assert!(messages.iter().any(|message| message.contains("NewPLC (abc)")));
}

#[test]
fn binary_connector_drives_full_lifecycle() {
    let service = Service::start("binary");
    let connector = Connector::connect(service.uri(Scheme::Binary), None).unwrap();
    assert_eq!(connector.server_version(), 2);
    exercise(&connector);
}

#[test]
fn json_connector_drives_full_lifecycle() {
    let service = Service::start("json");
    let connector = Connector::connect(service.uri(Scheme::Json), None).unwrap();
    exercise(&connector);
}

#[test]
fn chunking_does_not_change_blob_id() {
    let service = Service::start("chunks");
    let connector = Connector::connect(service.uri(Scheme::Binary), None).unwrap();
    let data: Vec<u8> = (0..5000u32).map(|n| (n % 251) as u8).collect();
    let whole = upload_with_seed(&connector, b"seed", &data, data.len()).unwrap();
    let small = upload_with_seed(&connector, b"seed", &data, 7).unwrap();
    let odd = upload_with_seed(&connector, b"seed", &data, 1023).unwrap();
    assert_eq!(whole, small);
    assert_eq!(whole, odd);
    connector.purge_blobs().unwrap();
}

#[test]
fn remote_exec_failures_are_results_not_errors() {
    let service = Service::start("exec");
    let connector = Connector::connect(service.uri(Scheme::Binary), None).unwrap();
    let mut kwargs = IndexMap::new();
    kwargs.insert("n".to_string(), "4".to_string());
    let (code, message) = connector.remote_exec("returnVal = n + 1", kwargs).unwrap();
    assert_eq!(code, 0);
    assert_eq!(message.as_deref(), Some("41"));

    let (code, message) = connector
        .remote_exec("returnVal = missing", IndexMap::new())
        .unwrap();
    assert_eq!(code, -1);
    assert!(message.unwrap().starts_with("RemoteExec script failed!"));
}

#[test]
fn plc_id_updates_psk_store() {
    let service = Service::start("psk");
    let store = PskStore::new(&service.dir);
    let connector =
        Connector::connect(service.uri(Scheme::Binary), Some(store.clone())).unwrap();
    let credentials = connector.get_plc_id().unwrap().unwrap();
    let records = store.load().unwrap();
    let record = &records[&credentials.id];
    assert!(record.uri.ends_with(&format!("#{}", credentials.id)));
    assert_eq!(
        store.secret(&credentials.id).unwrap().as_deref(),
        Some(credentials.secret.as_str())
    );

    let with_id = service.uri(Scheme::Binary).with_id(credentials.id.clone());
    let authenticated = Connector::connect(with_id, Some(store)).unwrap();
    assert_eq!(authenticated.get_plc_status().unwrap().0, PlcState::Empty);
}

#[test]
fn lost_service_reads_as_disconnected() {
    let service = Service::start("lost");
    let connector = Connector::connect(service.uri(Scheme::Binary), None).unwrap();
    drop(service);

    assert!(matches!(
        connector.get_plc_status(),
        Err(RemoteError::Transport(_))
    ));
    assert_eq!(connector.poll_status().0, PlcState::Disconnected);
    assert_eq!(
        connector.call_or_default(Request::MatchMd5 {
            digest: "abc".into()
        }),
        Response::Bool(false)
    );
    assert!(matches!(
        connector.new_plc("abc", b"x", &[]),
        Err(ConnectorError::Remote(RemoteError::Transport(_)))
    ));
}
