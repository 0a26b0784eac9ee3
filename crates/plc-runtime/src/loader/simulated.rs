//! Simulated programs.
//!
//! A simulated artifact is a TOML description of a program whose variables
//! change by a fixed step every cycle. It behaves like a native program on
//! every entry point (start/stop, debug registration, forcing, the bridge) so
//! the service can run without a C toolchain.
//!
//! ```toml
//! [program]
//! name = "counter"
//! cycle_ms = 10
//!
//! [[variable]]
//! type = "INT"
//! value = 0
//! step = 1
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::debug::{IecType, IecValue};
use crate::error::RuntimeError;

use super::{DebugData, PlcProgram, ProgramLoader, REQUIRED_SYMBOLS};

/// Extension of installed simulated artifacts.
pub const SIMULATED_EXTENSION: &str = ".plc";

const DEBUG_WAIT: Duration = Duration::from_millis(100);

/// Loads TOML-described simulated programs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedLoader;

impl ProgramLoader for SimulatedLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn PlcProgram>, RuntimeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| RuntimeError::Load(format!("{}: {err}", path.display()).into()))?;
        let program = SimulatedProgram::from_toml(&text)?;
        Ok(Arc::new(program))
    }

    fn extension(&self) -> &'static str {
        SIMULATED_EXTENSION
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactToml {
    program: ProgramToml,
    #[serde(default)]
    variable: Vec<VariableToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramToml {
    name: Option<String>,
    cycle_ms: Option<u64>,
    start_result: Option<i32>,
    exports: Option<Vec<String>>,
    bridge: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableToml {
    #[serde(rename = "type")]
    ty: String,
    value: Option<toml::Value>,
    step: Option<f64>,
}

#[derive(Debug, Clone)]
struct SimVariable {
    ty: IecType,
    initial: IecValue,
    value: IecValue,
    step: f64,
}

#[derive(Debug, Default)]
struct SimState {
    running: bool,
    tick: u32,
    debug_enabled: bool,
    registered: Vec<(u32, Option<IecValue>)>,
    published: Option<DebugData>,
    published_seq: u64,
    consumed_seq: u64,
    bridge_pos: usize,
}

struct Shared {
    state: Mutex<SimState>,
    cycle: Condvar,
    variables: Mutex<Vec<SimVariable>>,
}

pub(crate) struct SimulatedProgram {
    name: SmolStr,
    cycle: Duration,
    start_result: i32,
    bridge: Option<Vec<String>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedProgram {
    pub(crate) fn from_toml(text: &str) -> Result<Self, RuntimeError> {
        let artifact: ArtifactToml = toml::from_str(text)
            .map_err(|err| RuntimeError::Load(format!("simulated artifact: {err}").into()))?;
        if let Some(exports) = &artifact.program.exports {
            if let Some(missing) = REQUIRED_SYMBOLS
                .iter()
                .find(|symbol| !exports.iter().any(|export| export == *symbol))
            {
                return Err(RuntimeError::MissingSymbol(SmolStr::new(missing)));
            }
        }
        let variables = artifact
            .variable
            .into_iter()
            .map(SimVariable::from_toml)
            .collect::<Result<Vec<_>, _>>()?;
        let cycle_ms = artifact.program.cycle_ms.unwrap_or(10).max(1);
        Ok(Self {
            name: SmolStr::new(artifact.program.name.as_deref().unwrap_or("simulated")),
            cycle: Duration::from_millis(cycle_ms),
            start_result: artifact.program.start_result.unwrap_or(0),
            bridge: artifact.program.bridge,
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::default()),
                cycle: Condvar::new(),
                variables: Mutex::new(variables),
            }),
            worker: Mutex::new(None),
        })
    }
}

impl SimVariable {
    fn from_toml(raw: VariableToml) -> Result<Self, RuntimeError> {
        let ty = IecType::parse(&raw.ty)?;
        let initial = match raw.value {
            Some(value) => value_from_toml(ty, &value)?,
            None => zero_value(ty),
        };
        Ok(Self {
            ty,
            value: initial.clone(),
            initial,
            step: raw.step.unwrap_or(0.0),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn advance(&mut self) {
        if self.step == 0.0 {
            return;
        }
        let step = self.step;
        let next = match &self.value {
            IecValue::Bool(flag) => IecValue::Bool(!flag),
            IecValue::Signed(raw) => IecValue::Signed(raw.wrapping_add(step as i64)),
            IecValue::Unsigned(raw) => IecValue::Unsigned(raw.wrapping_add(step as u64)),
            IecValue::Real(raw) => IecValue::Real(raw + step),
            IecValue::Time(spec) => IecValue::Time(crate::debug::IecTimespec {
                sec: spec.sec.wrapping_add(step as i64),
                nsec: spec.nsec,
            }),
            IecValue::Text(text) => IecValue::Text(text.clone()),
        };
        self.value = if self.ty.encode_sample(&next).is_ok() {
            next
        } else {
            self.initial.clone()
        };
    }
}

fn zero_value(ty: IecType) -> IecValue {
    match ty {
        IecType::Bool => IecValue::Bool(false),
        IecType::Sint | IecType::Int | IecType::Dint | IecType::Lint => IecValue::Signed(0),
        IecType::Real | IecType::Lreal => IecValue::Real(0.0),
        IecType::Time | IecType::Date | IecType::Tod | IecType::Dt => {
            IecValue::Time(crate::debug::IecTimespec { sec: 0, nsec: 0 })
        }
        IecType::String => IecValue::Text(String::new()),
        _ => IecValue::Unsigned(0),
    }
}

fn value_from_toml(ty: IecType, value: &toml::Value) -> Result<IecValue, RuntimeError> {
    let parsed = match (ty, value) {
        (IecType::Bool, toml::Value::Boolean(flag)) => IecValue::Bool(*flag),
        (IecType::Real | IecType::Lreal, toml::Value::Float(raw)) => IecValue::Real(*raw),
        #[allow(clippy::cast_precision_loss)]
        (IecType::Real | IecType::Lreal, toml::Value::Integer(raw)) => IecValue::Real(*raw as f64),
        (IecType::String, toml::Value::String(text)) => IecValue::Text(text.clone()),
        (IecType::Time | IecType::Date | IecType::Tod | IecType::Dt, toml::Value::Integer(sec)) => {
            IecValue::Time(crate::debug::IecTimespec { sec: *sec, nsec: 0 })
        }
        (_, toml::Value::Integer(raw)) => match zero_value(ty) {
            IecValue::Signed(_) => IecValue::Signed(*raw),
            IecValue::Unsigned(_) => IecValue::Unsigned(u64::try_from(*raw).map_err(|_| {
                RuntimeError::Load(format!("negative initial value for {ty}").into())
            })?),
            _ => return Err(RuntimeError::Load(format!("bad initial value for {ty}").into())),
        },
        _ => return Err(RuntimeError::Load(format!("bad initial value for {ty}").into())),
    };
    ty.encode_sample(&parsed)
        .map_err(|err| RuntimeError::Load(format!("initial value: {err}").into()))?;
    Ok(parsed)
}

fn run_cycles(shared: &Shared, cycle: Duration) {
    loop {
        let mut state = shared.state.lock();
        if !state.running {
            break;
        }
        shared.cycle.wait_for(&mut state, cycle);
        if !state.running {
            break;
        }
        state.tick = state.tick.wrapping_add(1);
        let mut variables = shared.variables.lock();
        for variable in variables.iter_mut() {
            variable.advance();
        }
        for (idx, force) in &state.registered {
            if let (Some(force), Some(variable)) = (force, variables.get_mut(*idx as usize)) {
                variable.value = force.clone();
            }
        }
        if state.debug_enabled && !state.registered.is_empty() {
            let mut buffer = Vec::new();
            for (idx, _) in &state.registered {
                if let Some(variable) = variables.get(*idx as usize) {
                    match variable.ty.encode_sample(&variable.value) {
                        Ok(bytes) => buffer.extend(bytes),
                        Err(err) => warn!("simulated variable {idx}: {err}"),
                    }
                }
            }
            drop(variables);
            state.published = Some(DebugData {
                tick: state.tick,
                buffer,
            });
            state.published_seq += 1;
        }
        shared.cycle.notify_all();
    }
}

impl PlcProgram for SimulatedProgram {
    fn start(&self, _args: &[String]) -> i32 {
        if self.start_result != 0 {
            return self.start_result;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return 0;
        }
        self.shared.state.lock().running = true;
        let shared = Arc::clone(&self.shared);
        let cycle = self.cycle;
        let spawned = thread::Builder::new()
            .name(format!("plc-sim-{}", self.name))
            .spawn(move || run_cycles(&shared, cycle));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                debug!(program = %self.name, "simulated program started");
                0
            }
            Err(err) => {
                warn!("simulated program thread: {err}");
                self.shared.state.lock().running = false;
                -1
            }
        }
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.published = None;
        }
        self.shared.cycle.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn reset_debug_variables(&self) {
        let mut state = self.shared.state.lock();
        state.registered.clear();
        state.published = None;
        state.consumed_seq = state.published_seq;
    }

    fn register_debug_variable(&self, idx: u32, force: Option<&[u8]>) {
        let ty = self
            .shared
            .variables
            .lock()
            .get(idx as usize)
            .map(|variable| variable.ty);
        let Some(ty) = ty else {
            warn!(idx, "simulated program has no such variable");
            return;
        };
        let force = force.and_then(|bytes| ty.decode_force(bytes).ok());
        self.shared.state.lock().registered.push((idx, force));
    }

    fn suspend_debug(&self, disable: bool) -> i32 {
        let mut state = self.shared.state.lock();
        state.debug_enabled = !disable;
        if disable {
            state.published = None;
        }
        0
    }

    fn resume_debug(&self) {}

    fn debug_data(&self) -> Option<DebugData> {
        let mut state = self.shared.state.lock();
        if state.published_seq == state.consumed_seq && state.running {
            self.shared.cycle.wait_for(&mut state, DEBUG_WAIT);
        }
        if state.published_seq == state.consumed_seq {
            return None;
        }
        state.consumed_seq = state.published_seq;
        state.published.clone()
    }

    fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    fn bridge_step(&self, _result: &str) -> Option<String> {
        let commands = self.bridge.as_ref()?;
        let mut state = self.shared.state.lock();
        if !state.running {
            return None;
        }
        if let Some(command) = commands.get(state.bridge_pos) {
            state.bridge_pos += 1;
            return Some(command.clone());
        }
        while state.running {
            self.shared.cycle.wait(&mut state);
        }
        None
    }
}

impl Drop for SimulatedProgram {
    fn drop(&mut self) {
        self.stop();
    }
}
