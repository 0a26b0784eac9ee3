//! PLC execution controller.
//!
//! Owns the installed program artifact, the loaded program handle and the
//! execution thread. Every operation touching the program is marshalled onto
//! the serialized worker; status reads are lock-free.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, CONFIG_FILE_NAME};
use crate::debug::{spawn_trace_thread, DebugSample, DebugSampler, TraceBuffer, TraceRequest, TraceThread};
use crate::error::RuntimeError;
use crate::identity::SECRET_FILE_NAME;
use crate::loader::{PlcProgram, ProgramLoader};
use crate::log::{CombinedLog, LogEntry, LogLevel, LogStore, PlcLog, LOG_LEVELS};
use crate::remote_exec::{self, ExecContext};
use crate::service::BLOB_DIR_NAME;
use crate::worker::Worker;

/// Marker file holding the digest of the installed program.
pub const DIGEST_MARKER: &str = "lasttransferedPLC.md5";
/// Manifest of the extra files installed with the program.
pub const EXTRA_FILES_MANIFEST: &str = "extra_files.txt";

const RELOAD_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle state of the PLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PlcState {
    Empty = 0,
    Stopped = 1,
    Started = 2,
    Broken = 3,
    /// Client-side only: the service cannot be reached.
    Disconnected = 4,
}

impl PlcState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Stopped => "Stopped",
            Self::Started => "Started",
            Self::Broken => "Broken",
            Self::Disconnected => "Disconnected",
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Empty),
            1 => Some(Self::Stopped),
            2 => Some(Self::Started),
            3 => Some(Self::Broken),
            4 => Some(Self::Disconnected),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        [
            Self::Empty,
            Self::Stopped,
            Self::Started,
            Self::Broken,
            Self::Disconnected,
        ]
        .into_iter()
        .find(|state| state.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for PlcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Called on the worker thread right after a program loaded or right before
/// it unloads. Must return promptly.
pub type LifecycleCallback = Arc<dyn Fn(&dyn PlcProgram) + Send + Sync>;

/// Answers commands the execution thread posts through the program bridge.
pub trait BridgeHandler: Send + Sync {
    fn handle(&self, command: &str) -> String;
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub start_timeout: Option<Duration>,
    pub trace_idle_suspend: Duration,
    pub trace_buffer_limit: usize,
    /// Arguments handed to the program's start routine.
    pub start_args: Vec<String>,
    /// Working-directory entries the service owns; extra files may not use
    /// these names.
    pub reserved_names: Vec<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for ControllerOptions {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            start_timeout: config.start_timeout,
            trace_idle_suspend: config.trace_idle_suspend,
            trace_buffer_limit: config.trace_buffer_limit,
            start_args: Vec::new(),
            reserved_names: reserved_names(config),
        }
    }
}

fn reserved_names(config: &ServiceConfig) -> Vec<String> {
    let mut names = vec![
        CONFIG_FILE_NAME.to_string(),
        SECRET_FILE_NAME.to_string(),
        BLOB_DIR_NAME.to_string(),
    ];
    let secret = config
        .identity
        .secret_file
        .as_deref()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str());
    if let Some(secret) = secret {
        if !names.iter().any(|name| name == secret) {
            names.push(secret.to_string());
        }
    }
    names
}

#[derive(Default)]
struct ExecFlags {
    stop: bool,
    /// The controller gave up waiting for the start routine.
    abandoned: bool,
}

/// Coordinates the execution thread with the controller.
#[derive(Default)]
struct ExecSignal {
    flags: Mutex<ExecFlags>,
    cvar: Condvar,
}

impl ExecSignal {
    fn raise(&self) {
        self.flags.lock().stop = true;
        self.cvar.notify_all();
    }

    /// Block a program thread that has nothing to run until stop.
    fn wait(&self) {
        let mut flags = self.flags.lock();
        while !flags.stop {
            self.cvar.wait(&mut flags);
        }
    }

    /// Report the start routine's result unless the controller already gave
    /// up. Returns `false` when abandoned.
    fn report_started(&self, tx: &crossbeam_channel::Sender<i32>, rc: i32) -> bool {
        let flags = self.flags.lock();
        if flags.abandoned {
            return false;
        }
        let _ = tx.send(rc);
        true
    }

    /// Give up waiting, unless the result arrived in the meantime.
    fn abandon(&self, rx: &crossbeam_channel::Receiver<i32>) -> Option<i32> {
        let mut flags = self.flags.lock();
        if let Ok(rc) = rx.try_recv() {
            return Some(rc);
        }
        flags.abandoned = true;
        flags.stop = true;
        None
    }
}

enum StartOutcome {
    Returned(i32),
    TimedOut,
    Panicked,
}

struct ExecThread {
    join: JoinHandle<()>,
    signal: Arc<ExecSignal>,
}

#[derive(Default)]
struct ProgramSlot {
    program: Option<Arc<dyn PlcProgram>>,
    exec: Option<ExecThread>,
    trace: Option<TraceThread>,
}

struct Inner {
    working_dir: PathBuf,
    loader: Arc<dyn ProgramLoader>,
    worker: Worker,
    options: ControllerOptions,
    state: AtomicU8,
    sampler: Arc<DebugSampler>,
    traces: Arc<TraceBuffer>,
    log: LogStore,
    slot: Mutex<ProgramSlot>,
    trace_request: Mutex<TraceRequest>,
    load_callbacks: Mutex<IndexMap<SmolStr, LifecycleCallback>>,
    unload_callbacks: Mutex<IndexMap<SmolStr, LifecycleCallback>>,
    bridge: Mutex<Option<Arc<dyn BridgeHandler>>>,
    identity: Mutex<Option<SmolStr>>,
    reload_hook: Mutex<Option<Hook>>,
    quit_hook: Mutex<Option<Hook>>,
}

/// Handle to the execution controller. Clones share state.
#[derive(Clone)]
pub struct PlcController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PlcController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcController")
            .field("working_dir", &self.inner.working_dir)
            .field("state", &self.status())
            .finish()
    }
}

impl PlcController {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        loader: Arc<dyn ProgramLoader>,
        worker: Worker,
        options: ControllerOptions,
    ) -> Result<Self, RuntimeError> {
        let working_dir = working_dir.into();
        fs::create_dir_all(&working_dir)?;
        let traces = Arc::new(TraceBuffer::new(
            options.trace_buffer_limit,
            options.trace_idle_suspend,
        ));
        Ok(Self {
            inner: Arc::new(Inner {
                working_dir,
                loader,
                worker,
                options,
                state: AtomicU8::new(PlcState::Empty.code()),
                sampler: Arc::new(DebugSampler::new()),
                traces,
                log: LogStore::default(),
                slot: Mutex::new(ProgramSlot::default()),
                trace_request: Mutex::new(TraceRequest::default()),
                load_callbacks: Mutex::new(IndexMap::new()),
                unload_callbacks: Mutex::new(IndexMap::new()),
                bridge: Mutex::new(None),
                identity: Mutex::new(None),
                reload_hook: Mutex::new(None),
                quit_hook: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    #[must_use]
    pub fn worker(&self) -> &Worker {
        &self.inner.worker
    }

    /// Current state. Never blocks.
    #[must_use]
    pub fn status(&self) -> PlcState {
        PlcState::from_code(self.inner.state.load(Ordering::SeqCst)).unwrap_or(PlcState::Broken)
    }

    /// State plus per-level log counts. Never blocks.
    #[must_use]
    pub fn get_status(&self) -> (PlcState, [u32; LOG_LEVELS]) {
        let counts = self.inner.try_with_log(|log| log.log_counts());
        (self.status(), counts)
    }

    /// Install the previously transferred program, if any.
    pub fn autoload(&self) -> PlcState {
        self.on_worker(PlcState::Empty, |inner| inner.autoload())
    }

    pub fn new_plc(&self, digest: &str, binary: Vec<u8>, extra_files: Vec<(String, Vec<u8>)>) -> bool {
        let digest = digest.to_string();
        self.on_worker(false, move |inner| inner.new_plc(&digest, &binary, &extra_files))
    }

    pub fn start_plc(&self) -> bool {
        self.on_worker(false, Inner::start_plc)
    }

    pub fn stop_plc(&self) -> bool {
        self.on_worker(false, Inner::stop_plc)
    }

    /// Whether `digest` names the installed program.
    #[must_use]
    pub fn match_md5(&self, digest: &str) -> bool {
        self.current_digest().is_some_and(|current| current == digest)
    }

    #[must_use]
    pub fn current_digest(&self) -> Option<String> {
        self.inner.current_digest()
    }

    pub fn set_trace_variables_list(&self, request: TraceRequest) -> bool {
        self.on_worker(false, move |inner| inner.set_trace_variables(request))
    }

    /// Samples buffered since the last call. Empty unless started.
    #[must_use]
    pub fn get_trace_variables(&self) -> (PlcState, Vec<DebugSample>) {
        let state = self.status();
        if state != PlcState::Started {
            return (state, Vec::new());
        }
        (state, self.inner.traces.swap())
    }

    #[must_use]
    pub fn get_log_message(&self, level: LogLevel, msg_id: u32) -> Option<LogEntry> {
        self.inner.with_log(|log| log.log_entry(level, msg_id))
    }

    pub fn reset_log_count(&self) {
        self.inner.with_log(|log| log.reset_log_count());
    }

    /// Record a message in the PLC log.
    pub fn log_message(&self, level: LogLevel, message: &str) {
        self.inner.log(level, message);
    }

    /// Schedule the reload hook (normally a process re-exec) shortly after
    /// returning, so the reply still reaches the caller.
    pub fn force_reload(&self) -> bool {
        let Some(hook) = self.inner.reload_hook.lock().clone() else {
            warn!("force reload requested but no reload hook is installed");
            return false;
        };
        let spawned = thread::Builder::new()
            .name("plc-reload".into())
            .spawn(move || {
                thread::sleep(RELOAD_DELAY);
                hook();
            });
        spawned.is_ok()
    }

    /// Uninstall the program and ask the service to quit.
    pub fn repair_plc(&self) -> bool {
        let repaired = self.on_worker(false, Inner::repair);
        if repaired {
            if let Some(hook) = self.inner.quit_hook.lock().clone() {
                hook();
            }
        }
        repaired
    }

    /// Stop and unload before the process exits.
    pub fn shutdown(&self) {
        self.on_worker((), |inner| {
            if inner.state() == PlcState::Started {
                inner.stop_plc();
            }
            inner.unload();
        });
    }

    pub fn remote_exec(&self, script: &str, kwargs: &IndexMap<String, String>) -> (i32, Option<String>) {
        remote_exec::run_script(script, kwargs, self)
    }

    pub fn register_load_callback(
        &self,
        name: impl Into<SmolStr>,
        callback: impl Fn(&dyn PlcProgram) + Send + Sync + 'static,
    ) {
        self.inner
            .load_callbacks
            .lock()
            .insert(name.into(), Arc::new(callback));
    }

    pub fn register_unload_callback(
        &self,
        name: impl Into<SmolStr>,
        callback: impl Fn(&dyn PlcProgram) + Send + Sync + 'static,
    ) {
        self.inner
            .unload_callbacks
            .lock()
            .insert(name.into(), Arc::new(callback));
    }

    pub fn set_bridge_handler(&self, handler: Arc<dyn BridgeHandler>) {
        *self.inner.bridge.lock() = Some(handler);
    }

    /// Identity published to programs that export `PLC_ID`.
    pub fn set_identity(&self, id: impl Into<SmolStr>) {
        *self.inner.identity.lock() = Some(id.into());
    }

    pub fn set_reload_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.reload_hook.lock() = Some(Arc::new(hook));
    }

    pub fn set_quit_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.quit_hook.lock() = Some(Arc::new(hook));
    }

    fn on_worker<R, F>(&self, fallback: R, job: F) -> R
    where
        F: FnOnce(&Inner) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        match self.inner.worker.call(move || job(&inner)) {
            Ok(result) => result,
            Err(err) => {
                error!("controller job not run: {err}");
                fallback
            }
        }
    }
}

impl ExecContext for PlcController {
    fn status(&self) -> PlcState {
        PlcController::status(self)
    }

    fn digest(&self) -> Option<String> {
        self.current_digest()
    }

    fn log(&self, message: &str) {
        self.log_message(LogLevel::Info, message);
    }
}

impl Inner {
    fn state(&self) -> PlcState {
        PlcState::from_code(self.state.load(Ordering::SeqCst)).unwrap_or(PlcState::Broken)
    }

    fn set_state(&self, state: PlcState) {
        let previous = self.state.swap(state.code(), Ordering::SeqCst);
        if previous != state.code() {
            debug!(state = %state, "PLC state changed");
        }
    }

    fn with_log<R>(&self, f: impl FnOnce(&dyn PlcLog) -> R) -> R {
        let program = self.slot.lock().program.clone();
        let native = program.as_deref().and_then(|program| program.log());
        f(&CombinedLog::new(&self.log, native))
    }

    /// Like [`Inner::with_log`] but never waits for the slot lock.
    fn try_with_log<R>(&self, f: impl FnOnce(&dyn PlcLog) -> R) -> R {
        let program = self
            .slot
            .try_lock()
            .and_then(|slot| slot.program.clone());
        let native = program.as_deref().and_then(|program| program.log());
        f(&CombinedLog::new(&self.log, native))
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Critical => error!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Debug => debug!("{message}"),
        }
        self.log.log_message(level, message);
    }

    fn marker_path(&self) -> PathBuf {
        self.working_dir.join(DIGEST_MARKER)
    }

    fn manifest_path(&self) -> PathBuf {
        self.working_dir.join(EXTRA_FILES_MANIFEST)
    }

    fn binary_path(&self, digest: &str) -> PathBuf {
        self.working_dir
            .join(format!("{digest}{}", self.loader.extension()))
    }

    fn current_digest(&self) -> Option<String> {
        let text = fs::read_to_string(self.marker_path()).ok()?;
        let digest = text.trim();
        (!digest.is_empty()).then(|| digest.to_string())
    }

    fn installed_extra_files(&self) -> Vec<String> {
        fs::read_to_string(self.manifest_path())
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn autoload(&self) -> PlcState {
        let Some(digest) = self.current_digest() else {
            self.set_state(PlcState::Empty);
            return PlcState::Empty;
        };
        if !self.binary_path(&digest).is_file() {
            warn!(digest = %digest, "digest marker without program binary");
            self.set_state(PlcState::Empty);
            return PlcState::Empty;
        }
        let state = match self.load() {
            Ok(_) => PlcState::Stopped,
            Err(_) => PlcState::Empty,
        };
        self.set_state(state);
        state
    }

    /// Load the installed program. On failure the loading error becomes the
    /// only critical log message and the state is `Broken`.
    fn load(&self) -> Result<Arc<dyn PlcProgram>, RuntimeError> {
        if let Some(program) = self.slot.lock().program.clone() {
            return Ok(program);
        }
        let result = self
            .current_digest()
            .ok_or_else(|| RuntimeError::Load("no program installed".into()))
            .and_then(|digest| self.loader.load(&self.binary_path(&digest)));
        let program = match result {
            Ok(program) => program,
            Err(err) => {
                error!("PLC load failed: {err}");
                self.log.clear();
                self.log.log_message(LogLevel::Critical, &err.to_string());
                self.set_state(PlcState::Broken);
                return Err(err);
            }
        };
        if let Some(id) = self.identity.lock().clone() {
            program.set_identity(&id);
        }
        self.slot.lock().program = Some(program.clone());
        self.sampler.attach(program.clone());
        let callbacks: Vec<_> = self.load_callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(program.as_ref());
        }
        let request = self.trace_request.lock().clone();
        if !request.is_empty() {
            if let Err(err) = self.sampler.configure(&request) {
                warn!("re-applying trace request failed: {err}");
            }
        }
        debug!("PLC program loaded");
        Ok(program)
    }

    fn unload(&self) {
        let Some(program) = self.slot.lock().program.take() else {
            return;
        };
        let callbacks: Vec<_> = self.unload_callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(program.as_ref());
        }
        self.sampler.detach();
        drop(program);
        debug!("PLC program unloaded");
    }

    fn new_plc(&self, digest: &str, binary: &[u8], extra_files: &[(String, Vec<u8>)]) -> bool {
        let state = self.state();
        if !matches!(state, PlcState::Stopped | PlcState::Empty | PlcState::Broken) {
            warn!(state = %state, "NewPLC refused");
            return false;
        }
        if let Err(err) = self.install(digest, binary, extra_files) {
            self.log(LogLevel::Critical, &format!("NewPLC ({digest}) failed: {err}"));
            return false;
        }
        self.log(LogLevel::Info, &format!("NewPLC ({digest})"));
        match self.load() {
            Ok(_) => {
                self.set_state(PlcState::Stopped);
                true
            }
            Err(_) => false,
        }
    }

    fn install(
        &self,
        digest: &str,
        binary: &[u8],
        extra_files: &[(String, Vec<u8>)],
    ) -> Result<(), RuntimeError> {
        if !is_valid_digest(digest) {
            return Err(RuntimeError::InvalidArtifact(
                format!("digest '{digest}'").into(),
            ));
        }
        if let Some((name, _)) = extra_files.iter().find(|(name, _)| !self.is_valid_extra_name(name)) {
            return Err(RuntimeError::InvalidArtifact(
                format!("extra file name '{name}'").into(),
            ));
        }
        self.unload();
        let previous_digest = self.current_digest();
        let previous_extras = self.installed_extra_files();

        let binary_path = self.binary_path(digest);
        write_atomic(&binary_path, binary)?;
        for (name, data) in extra_files {
            write_atomic(&self.working_dir.join(name), data)?;
        }

        if let Some(previous) = previous_digest.filter(|previous| previous != digest) {
            remove_if_exists(&self.binary_path(&previous));
        }
        for stale in previous_extras
            .iter()
            .filter(|stale| !extra_files.iter().any(|(name, _)| name == *stale))
        {
            if self.is_valid_extra_name(stale) {
                remove_if_exists(&self.working_dir.join(stale));
            }
        }

        let manifest: String = extra_files
            .iter()
            .map(|(name, _)| format!("{name}\n"))
            .collect();
        write_atomic(&self.manifest_path(), manifest.as_bytes())?;
        // Written last: the marker commits the new artifact.
        write_atomic(&self.marker_path(), digest.as_bytes())?;
        Ok(())
    }

    fn is_valid_extra_name(&self, name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0'])
            && name != DIGEST_MARKER
            && name != EXTRA_FILES_MANIFEST
            && !self.options.reserved_names.iter().any(|reserved| reserved == name)
            && !name.ends_with(self.loader.extension())
    }

    fn start_plc(&self) -> bool {
        if self.state() != PlcState::Stopped {
            return false;
        }
        let Ok(program) = self.load() else {
            return false;
        };
        let signal = Arc::new(ExecSignal::default());
        let bridge = self.bridge.lock().clone();
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let args = self.options.start_args.clone();
        let thread_program = program.clone();
        let thread_signal = signal.clone();
        let spawned = thread::Builder::new()
            .name("plc-exec".into())
            .spawn(move || {
                let rc = thread_program.start(&args);
                if !thread_signal.report_started(&started_tx, rc) {
                    if rc == 0 {
                        thread_program.stop();
                    }
                    return;
                }
                if rc == 0 {
                    run_program_thread(thread_program.as_ref(), bridge.as_deref(), &thread_signal);
                }
            });
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                self.log(LogLevel::Critical, &format!("Problem starting PLC : {err}"));
                self.fail_start();
                return false;
            }
        };
        let outcome = match self.options.start_timeout {
            Some(timeout) => match started_rx.recv_timeout(timeout) {
                Ok(rc) => StartOutcome::Returned(rc),
                Err(RecvTimeoutError::Timeout) => signal
                    .abandon(&started_rx)
                    .map_or(StartOutcome::TimedOut, StartOutcome::Returned),
                Err(RecvTimeoutError::Disconnected) => StartOutcome::Panicked,
            },
            None => started_rx
                .recv()
                .map_or(StartOutcome::Panicked, StartOutcome::Returned),
        };
        match outcome {
            StartOutcome::Returned(0) => {
                self.set_state(PlcState::Started);
                self.slot.lock().exec = Some(ExecThread { join, signal });
                self.log(LogLevel::Info, "PLC started");
                self.ensure_trace_thread();
                true
            }
            StartOutcome::Returned(rc) => {
                let _ = join.join();
                self.log(LogLevel::Critical, &format!("Problem starting PLC : error {rc}"));
                self.fail_start();
                false
            }
            StartOutcome::TimedOut => {
                // The thread keeps its own program handle and stops the
                // program once the start routine returns.
                self.log(LogLevel::Critical, "Problem starting PLC : start timed out");
                self.fail_start();
                false
            }
            StartOutcome::Panicked => {
                let _ = join.join();
                self.log(LogLevel::Critical, "Problem starting PLC : start routine panicked");
                self.fail_start();
                false
            }
        }
    }

    fn fail_start(&self) {
        self.set_state(PlcState::Broken);
        self.unload();
    }

    fn stop_plc(&self) -> bool {
        if self.state() != PlcState::Started {
            return false;
        }
        self.set_state(PlcState::Stopped);
        let (program, exec, trace) = {
            let mut slot = self.slot.lock();
            (slot.program.clone(), slot.exec.take(), slot.trace.take())
        };
        if let Some(program) = &program {
            program.stop();
        }
        if let Some(exec) = exec {
            exec.signal.raise();
            if exec.join.join().is_err() {
                warn!("PLC execution thread panicked");
            }
        }
        if let Some(trace) = trace {
            trace.stop();
        }
        self.traces.clear();
        self.log(LogLevel::Info, "PLC stopped");
        self.unload();
        true
    }

    fn set_trace_variables(&self, request: TraceRequest) -> bool {
        *self.trace_request.lock() = request.clone();
        if request.is_empty() {
            let trace = self.slot.lock().trace.take();
            if let Some(trace) = trace {
                trace.stop();
            }
            self.traces.clear();
            if let Err(err) = self.sampler.configure(&request) {
                warn!("disabling trace failed: {err}");
            }
            return true;
        }
        if let Err(err) = self.sampler.configure(&request) {
            warn!("trace request rejected: {err}");
            return false;
        }
        self.traces.clear();
        self.traces.touch();
        if self.state() == PlcState::Started {
            self.ensure_trace_thread();
        }
        true
    }

    fn ensure_trace_thread(&self) {
        if self.trace_request.lock().is_empty() {
            return;
        }
        let mut slot = self.slot.lock();
        if slot.trace.as_ref().is_some_and(|trace| !trace.is_finished()) {
            return;
        }
        match spawn_trace_thread(self.sampler.clone(), self.traces.clone()) {
            Ok(trace) => slot.trace = Some(trace),
            Err(err) => error!("trace thread not started: {err}"),
        }
    }

    fn repair(&self) -> bool {
        if self.state() == PlcState::Started {
            self.stop_plc();
        }
        self.unload();
        if let Some(digest) = self.current_digest() {
            remove_if_exists(&self.binary_path(&digest));
        }
        for name in self.installed_extra_files() {
            if self.is_valid_extra_name(&name) {
                remove_if_exists(&self.working_dir.join(name));
            }
        }
        remove_if_exists(&self.manifest_path());
        remove_if_exists(&self.marker_path());
        self.set_state(PlcState::Empty);
        self.log(LogLevel::Warning, "PLC repaired, installed program removed");
        true
    }
}

fn run_program_thread(
    program: &dyn PlcProgram,
    bridge: Option<&dyn BridgeHandler>,
    signal: &ExecSignal,
) {
    if !program.has_bridge() {
        signal.wait();
        return;
    }
    let mut result = String::new();
    while let Some(command) = program.bridge_step(&result) {
        result = match bridge {
            Some(handler) => handler.handle(&command),
            None => String::new(),
        };
    }
}

fn is_valid_digest(digest: &str) -> bool {
    !digest.is_empty()
        && digest
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RuntimeError> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    fs::write(&partial, data)?;
    fs::rename(&partial, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "remove failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SimulatedLoader;
    use std::time::{SystemTime, UNIX_EPOCH};

    const PROGRAM: &str = "[program]\ncycle_ms = 2\n\n[[variable]]\ntype = \"INT\"\nstep = 1\n";

    fn temp_dir(name: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "plc-runtime-controller-{name}-{}-{stamp}",
            std::process::id()
        ))
    }

    fn make_controller(dir: &Path) -> (PlcController, JoinHandle<()>) {
        make_controller_with(dir, Arc::new(SimulatedLoader))
    }

    fn make_controller_with(
        dir: &Path,
        loader: Arc<dyn ProgramLoader>,
    ) -> (PlcController, JoinHandle<()>) {
        let worker = Worker::new();
        let join = worker.spawn("test-worker").unwrap();
        let controller =
            PlcController::new(dir, loader, worker, ControllerOptions::default()).unwrap();
        (controller, join)
    }

    fn finish(controller: PlcController, join: JoinHandle<()>, dir: &Path) {
        controller.shutdown();
        controller.worker().quit();
        join.join().unwrap();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn new_plc_writes_marker_manifest_and_extras() {
        let dir = temp_dir("install");
        let (controller, join) = make_controller(&dir);
        assert!(controller.new_plc(
            "d1",
            PROGRAM.as_bytes().to_vec(),
            vec![("runtime.py".into(), b"print()".to_vec())]
        ));
        assert_eq!(fs::read_to_string(dir.join(DIGEST_MARKER)).unwrap(), "d1");
        assert_eq!(fs::read_to_string(dir.join(EXTRA_FILES_MANIFEST)).unwrap(), "runtime.py\n");
        assert!(dir.join("d1.plc").is_file());

        assert!(controller.new_plc("d2", PROGRAM.as_bytes().to_vec(), Vec::new()));
        assert!(!dir.join("d1.plc").exists());
        assert!(!dir.join("runtime.py").exists());
        assert!(controller.match_md5("d2"));
        finish(controller, join, &dir);
    }

    #[test]
    fn rejects_unsafe_names() {
        let dir = temp_dir("names");
        let (controller, join) = make_controller(&dir);
        assert!(!controller.new_plc("../x", PROGRAM.as_bytes().to_vec(), Vec::new()));
        assert!(!controller.new_plc(
            "ok",
            PROGRAM.as_bytes().to_vec(),
            vec![("../escape".into(), Vec::new())]
        ));
        assert_eq!(controller.status(), PlcState::Empty);
        finish(controller, join, &dir);
    }

    #[test]
    fn extra_files_cannot_replace_service_files() {
        let dir = temp_dir("reserved");
        let (controller, join) = make_controller(&dir);
        for name in ["psk.secret", "service.toml", "tmp", "extra_files.txt"] {
            assert!(
                !controller.new_plc(
                    "ok",
                    PROGRAM.as_bytes().to_vec(),
                    vec![(name.into(), b"x".to_vec())]
                ),
                "{name} accepted"
            );
            assert!(!dir.join(name).exists());
        }
        assert!(controller.new_plc(
            "ok",
            PROGRAM.as_bytes().to_vec(),
            vec![("settings.json".into(), b"{}".to_vec())]
        ));
        finish(controller, join, &dir);
    }

    #[test]
    fn configured_secret_file_name_is_reserved() {
        let mut config = ServiceConfig::default();
        config.identity.secret_file = Some(PathBuf::from("/etc/plc/line3.key"));
        let options = ControllerOptions::from(&config);
        assert!(options.reserved_names.iter().any(|name| name == "line3.key"));
        assert!(options.reserved_names.iter().any(|name| name == "psk.secret"));
    }

    #[test]
    fn load_error_is_reported_through_log() {
        let dir = temp_dir("load-error");
        let (controller, join) = make_controller(&dir);
        assert!(!controller.new_plc("bad", b"not = [toml".to_vec(), Vec::new()));
        let (state, counts) = controller.get_status();
        assert_eq!(state, PlcState::Broken);
        assert_eq!(counts[0], 1);
        let entry = controller.get_log_message(LogLevel::Critical, 0).unwrap();
        assert!(entry.message.contains("simulated artifact"));
        finish(controller, join, &dir);
    }

    #[test]
    fn autoload_restores_installed_program() {
        let dir = temp_dir("autoload");
        {
            let (controller, join) = make_controller(&dir);
            assert!(controller.new_plc("keep", PROGRAM.as_bytes().to_vec(), Vec::new()));
            controller.shutdown();
            controller.worker().quit();
            join.join().unwrap();
        }
        let (controller, join) = make_controller(&dir);
        assert_eq!(controller.status(), PlcState::Empty);
        assert_eq!(controller.autoload(), PlcState::Stopped);
        assert!(controller.match_md5("keep"));
        finish(controller, join, &dir);
    }

    #[test]
    fn callbacks_run_on_load_and_unload() {
        let dir = temp_dir("callbacks");
        let (controller, join) = make_controller(&dir);
        let events = Arc::new(Mutex::new(Vec::new()));
        let on_load = events.clone();
        controller.register_load_callback("hmi", move |_| on_load.lock().push("load"));
        let on_unload = events.clone();
        controller.register_unload_callback("hmi", move |_| on_unload.lock().push("unload"));
        assert!(controller.new_plc("cb", PROGRAM.as_bytes().to_vec(), Vec::new()));
        assert!(controller.start_plc());
        assert!(controller.stop_plc());
        assert!(controller.start_plc());
        assert!(controller.stop_plc());
        assert_eq!(*events.lock(), vec!["load", "unload", "load", "unload"]);
        finish(controller, join, &dir);
    }

    #[test]
    fn start_failure_breaks_until_new_plc() {
        let dir = temp_dir("start-fail");
        let (controller, join) = make_controller(&dir);
        let failing = "[program]\nstart_result = 4\n";
        assert!(controller.new_plc("f", failing.as_bytes().to_vec(), Vec::new()));
        assert!(!controller.start_plc());
        assert_eq!(controller.status(), PlcState::Broken);
        assert!(!controller.start_plc());
        let entry = controller.get_log_message(LogLevel::Critical, 0).unwrap();
        assert_eq!(entry.message, "Problem starting PLC : error 4");
        assert!(controller.new_plc("g", PROGRAM.as_bytes().to_vec(), Vec::new()));
        assert_eq!(controller.status(), PlcState::Stopped);
        finish(controller, join, &dir);
    }

    /// Program with its own log, pre-filled with one message.
    struct LoggingProgram {
        log: LogStore,
    }

    impl PlcProgram for LoggingProgram {
        fn start(&self, _args: &[String]) -> i32 {
            0
        }
        fn stop(&self) {}
        fn reset_debug_variables(&self) {}
        fn register_debug_variable(&self, _idx: u32, _force: Option<&[u8]>) {}
        fn suspend_debug(&self, _disable: bool) -> i32 {
            0
        }
        fn resume_debug(&self) {}
        fn debug_data(&self) -> Option<crate::loader::DebugData> {
            None
        }
        fn log(&self) -> Option<&dyn PlcLog> {
            Some(&self.log)
        }
    }

    struct LoggingLoader;

    impl ProgramLoader for LoggingLoader {
        fn load(&self, _path: &Path) -> Result<Arc<dyn PlcProgram>, RuntimeError> {
            let log = LogStore::default();
            log.log_message(LogLevel::Info, "native hello");
            Ok(Arc::new(LoggingProgram { log }))
        }

        fn extension(&self) -> &'static str {
            ".so"
        }
    }

    fn info_messages(controller: &PlcController) -> Vec<String> {
        let count = controller.get_status().1[LogLevel::Info.index()];
        (0..count)
            .filter_map(|id| controller.get_log_message(LogLevel::Info, id))
            .map(|entry| entry.message)
            .collect()
    }

    #[test]
    fn lifecycle_messages_survive_native_unload() {
        let dir = temp_dir("native-log");
        let (controller, join) = make_controller_with(&dir, Arc::new(LoggingLoader));
        assert!(controller.new_plc("n", b"lib".to_vec(), Vec::new()));
        assert!(controller.start_plc());
        assert_eq!(
            info_messages(&controller),
            vec!["NewPLC (n)", "PLC started", "native hello"]
        );

        assert!(controller.stop_plc());
        assert_eq!(
            info_messages(&controller),
            vec!["NewPLC (n)", "PLC started", "PLC stopped"]
        );
        finish(controller, join, &dir);
    }

    struct Echo(Mutex<Vec<String>>);

    impl BridgeHandler for Echo {
        fn handle(&self, command: &str) -> String {
            self.0.lock().push(command.to_string());
            format!("ok:{command}")
        }
    }

    #[test]
    fn bridge_commands_reach_handler() {
        let dir = temp_dir("bridge");
        let (controller, join) = make_controller(&dir);
        let echo = Arc::new(Echo(Mutex::new(Vec::new())));
        controller.set_bridge_handler(echo.clone());
        let program = "[program]\nbridge = [\"init\", \"poll\"]\n";
        assert!(controller.new_plc("br", program.as_bytes().to_vec(), Vec::new()));
        assert!(controller.start_plc());
        for _ in 0..100 {
            if echo.0.lock().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*echo.0.lock(), vec!["init".to_string(), "poll".to_string()]);
        assert!(controller.stop_plc());
        finish(controller, join, &dir);
    }

    #[test]
    fn repair_uninstalls_and_calls_quit_hook() {
        let dir = temp_dir("repair");
        let (controller, join) = make_controller(&dir);
        let quit = Arc::new(Mutex::new(false));
        let flag = quit.clone();
        controller.set_quit_hook(move || *flag.lock() = true);
        assert!(controller.new_plc("r", PROGRAM.as_bytes().to_vec(), Vec::new()));
        assert!(controller.start_plc());
        assert!(controller.repair_plc());
        assert_eq!(controller.status(), PlcState::Empty);
        assert!(!dir.join(DIGEST_MARKER).exists());
        assert!(!dir.join("r.plc").exists());
        assert!(*quit.lock());
        finish(controller, join, &dir);
    }

    #[test]
    fn state_codes_round_trip_names() {
        assert_eq!(PlcState::parse("started"), Some(PlcState::Started));
        assert_eq!(PlcState::from_code(3), Some(PlcState::Broken));
        assert_eq!(PlcState::from_code(9), None);
    }
}
