//! Shared-library programs loaded with `libloading`.

#![allow(unsafe_code)]

use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::debug;

use crate::error::RuntimeError;
use crate::log::{LogEntry, LogLevel, PlcLog};

use super::{DebugData, PlcProgram, ProgramLoader};

type StartFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;
type StopFn = unsafe extern "C" fn() -> c_int;
type VoidFn = unsafe extern "C" fn();
type RegisterDebugFn = unsafe extern "C" fn(c_uint, *mut c_void);
type GetDebugFn = unsafe extern "C" fn(*mut c_ulong, *mut c_ulong, *mut *mut c_void) -> c_int;
type SuspendFn = unsafe extern "C" fn(c_int) -> c_int;
type IteratorFn = unsafe extern "C" fn(*const c_char, *mut *mut c_void) -> *mut c_char;
type GetLogCountFn = unsafe extern "C" fn(u8) -> u32;
type LogMessageFn = unsafe extern "C" fn(u8, *const c_char, u32) -> c_int;
type GetLogMessageFn =
    unsafe extern "C" fn(u8, u32, *mut c_char, u32, *mut u32, *mut u32, *mut u32) -> u32;

const LOG_BUFFER_SIZE: usize = 1 << 14;

/// Loads platform shared libraries (`.so`, `.dylib`, `.dll`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLoader;

impl ProgramLoader for NativeLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn PlcProgram>, RuntimeError> {
        let program = NativeProgram::open(path)?;
        Ok(Arc::new(program))
    }

    fn extension(&self) -> &'static str {
        std::env::consts::DLL_SUFFIX
    }
}

struct NativeLog {
    reset: VoidFn,
    count: GetLogCountFn,
    message: LogMessageFn,
    get: GetLogMessageFn,
}

/// Address of the program's `PLC_ID` string pointer.
struct IdSlot(*mut *const c_char);

// SAFETY: the slot is a static inside the loaded library; writes are
// serialized through `NativeProgram::identity`.
unsafe impl Send for IdSlot {}
unsafe impl Sync for IdSlot {}

struct BridgeState {
    block_id: *mut c_void,
    last_result: CString,
}

// SAFETY: `block_id` is an opaque cookie owned by the program and only
// handed back to it.
unsafe impl Send for BridgeState {}

struct NativeProgram {
    start: StartFn,
    stop: StopFn,
    reset_debug: VoidFn,
    register_debug: RegisterDebugFn,
    free_debug: VoidFn,
    get_debug: GetDebugFn,
    suspend_debug: SuspendFn,
    resume_debug: VoidFn,
    iterator: Option<IteratorFn>,
    log: Option<NativeLog>,
    id_slot: Option<IdSlot>,
    identity: Mutex<Option<CString>>,
    argv: Mutex<Vec<CString>>,
    bridge: Mutex<BridgeState>,
    // Declared last: dropped after every pointer above is gone.
    _library: Library,
}

impl NativeProgram {
    fn open(path: &Path) -> Result<Self, RuntimeError> {
        // SAFETY: loading runs the library's initializers; programs are trusted
        // output of the PLC build toolchain.
        let library = unsafe { Library::new(path) }.map_err(|err| {
            RuntimeError::Load(format!("{}: {err}", path.display()).into())
        })?;
        debug!(path = %path.display(), "program library opened");

        let log = match (
            optional::<VoidFn>(&library, "ResetLogCount"),
            optional::<GetLogCountFn>(&library, "GetLogCount"),
            optional::<LogMessageFn>(&library, "LogMessage"),
            optional::<GetLogMessageFn>(&library, "GetLogMessage"),
        ) {
            (Some(reset), Some(count), Some(message), Some(get)) => Some(NativeLog {
                reset,
                count,
                message,
                get,
            }),
            _ => None,
        };
        // SAFETY: `PLC_ID` is declared `char *PLC_ID` in the generated code.
        let id_slot = unsafe { library.get::<*mut *const c_char>(b"PLC_ID\0") }
            .ok()
            .map(|symbol| IdSlot(*symbol));

        Ok(Self {
            start: required(&library, "startPLC")?,
            stop: required(&library, "stopPLC")?,
            reset_debug: required(&library, "ResetDebugVariables")?,
            register_debug: required(&library, "RegisterDebugVariable")?,
            free_debug: required(&library, "FreeDebugData")?,
            get_debug: required(&library, "GetDebugData")?,
            suspend_debug: required(&library, "suspendDebug")?,
            resume_debug: required(&library, "resumeDebug")?,
            iterator: optional(&library, "PythonIterator"),
            log,
            id_slot,
            identity: Mutex::new(None),
            argv: Mutex::new(Vec::new()),
            bridge: Mutex::new(BridgeState {
                block_id: std::ptr::null_mut(),
                last_result: CString::default(),
            }),
            _library: library,
        })
    }
}

fn symbol_name(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn required<T: Copy>(library: &Library, name: &str) -> Result<T, RuntimeError> {
    optional(library, name).ok_or_else(|| RuntimeError::MissingSymbol(SmolStr::new(name)))
}

fn optional<T: Copy>(library: &Library, name: &str) -> Option<T> {
    // SAFETY: the caller names the exact C signature of each entry point.
    unsafe { library.get::<T>(&symbol_name(name)) }
        .ok()
        .map(|symbol| *symbol)
}

fn to_cstring(text: &str) -> CString {
    CString::new(text.replace('\0', "")).unwrap_or_default()
}

impl PlcProgram for NativeProgram {
    fn start(&self, args: &[String]) -> i32 {
        let mut argv_store = self.argv.lock();
        *argv_store = args.iter().map(|arg| to_cstring(arg)).collect();
        let mut argv: Vec<*mut c_char> = argv_store
            .iter()
            .map(|arg| arg.as_ptr().cast_mut())
            .collect();
        argv.push(std::ptr::null_mut());
        let argc = c_int::try_from(args.len()).unwrap_or(c_int::MAX);
        // SAFETY: argv is NUL-terminated and its strings outlive the program.
        unsafe { (self.start)(argc, argv.as_mut_ptr()) }
    }

    fn stop(&self) {
        // SAFETY: plain C entry point without arguments.
        let rc = unsafe { (self.stop)() };
        debug!(rc, "stopPLC returned");
    }

    fn reset_debug_variables(&self) {
        // SAFETY: plain C entry point without arguments.
        unsafe { (self.reset_debug)() }
    }

    fn register_debug_variable(&self, idx: u32, force: Option<&[u8]>) {
        let mut owned = force.map(<[u8]>::to_vec);
        let ptr = owned
            .as_mut()
            .map_or(std::ptr::null_mut(), |bytes| bytes.as_mut_ptr().cast::<c_void>());
        // SAFETY: the program copies the force value during registration.
        unsafe { (self.register_debug)(idx, ptr) }
    }

    fn suspend_debug(&self, disable: bool) -> i32 {
        // SAFETY: plain C entry point.
        unsafe { (self.suspend_debug)(c_int::from(disable)) }
    }

    fn resume_debug(&self) {
        // SAFETY: plain C entry point without arguments.
        unsafe { (self.resume_debug)() }
    }

    fn debug_data(&self) -> Option<DebugData> {
        let mut tick: c_ulong = 0;
        let mut size: c_ulong = 0;
        let mut buffer: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointers are valid locals; on success the buffer stays
        // valid until FreeDebugData.
        let rc = unsafe { (self.get_debug)(&mut tick, &mut size, &mut buffer) };
        if rc != 0 {
            return None;
        }
        let len = usize::try_from(size).unwrap_or(0);
        let bytes = if buffer.is_null() || len == 0 {
            Vec::new()
        } else {
            // SAFETY: the program guarantees `size` readable bytes at `buffer`.
            unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), len) }.to_vec()
        };
        // SAFETY: releases the lock taken by a successful GetDebugData.
        unsafe { (self.free_debug)() };
        #[allow(clippy::cast_possible_truncation)]
        let tick = tick as u32;
        Some(DebugData {
            tick,
            buffer: bytes,
        })
    }

    fn has_bridge(&self) -> bool {
        self.iterator.is_some()
    }

    fn bridge_step(&self, result: &str) -> Option<String> {
        let iterator = self.iterator?;
        let mut state = self.bridge.lock();
        state.last_result = to_cstring(result);
        let result_ptr = state.last_result.as_ptr();
        // SAFETY: result string and block cookie live in `state` across calls.
        let command = unsafe { iterator(result_ptr, &mut state.block_id) };
        if command.is_null() {
            return None;
        }
        // SAFETY: the program returns a NUL-terminated string it owns.
        Some(unsafe { CStr::from_ptr(command) }.to_string_lossy().into_owned())
    }

    fn log(&self) -> Option<&dyn PlcLog> {
        self.log.as_ref().map(|_| self as &dyn PlcLog)
    }

    fn set_identity(&self, id: &str) {
        let Some(slot) = &self.id_slot else {
            return;
        };
        let mut identity = self.identity.lock();
        let value = identity.insert(to_cstring(id));
        // SAFETY: the slot points at the program's `PLC_ID` global; the string
        // is kept alive in `identity`.
        unsafe { *slot.0 = value.as_ptr() };
    }
}

impl PlcLog for NativeProgram {
    fn log_message(&self, level: LogLevel, message: &str) {
        let Some(log) = &self.log else { return };
        let text = to_cstring(message);
        let len = u32::try_from(text.as_bytes().len()).unwrap_or(u32::MAX);
        // SAFETY: the program copies `len` bytes from `text`.
        unsafe { (log.message)(level as u8, text.as_ptr(), len) };
    }

    fn log_count(&self, level: LogLevel) -> u32 {
        let Some(log) = &self.log else { return 0 };
        // SAFETY: plain C entry point.
        unsafe { (log.count)(level as u8) }
    }

    fn log_entry(&self, level: LogLevel, msg_id: u32) -> Option<LogEntry> {
        let log = self.log.as_ref()?;
        let mut buffer = vec![0u8; LOG_BUFFER_SIZE];
        let (mut tick, mut sec, mut nsec) = (0u32, 0u32, 0u32);
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: buffer and out-pointers are valid for the call.
        let size = unsafe {
            (log.get)(
                level as u8,
                msg_id,
                buffer.as_mut_ptr().cast::<c_char>(),
                LOG_BUFFER_SIZE as u32,
                &mut tick,
                &mut sec,
                &mut nsec,
            )
        };
        if size == 0 {
            return None;
        }
        buffer.truncate(usize::try_from(size).unwrap_or(0).min(LOG_BUFFER_SIZE));
        Some(LogEntry {
            message: String::from_utf8_lossy(&buffer).into_owned(),
            tick,
            sec,
            nsec,
        })
    }

    fn reset_log_count(&self) {
        if let Some(log) = &self.log {
            // SAFETY: plain C entry point without arguments.
            unsafe { (log.reset)() }
        }
    }
}
