//! PLC log channel.
//!
//! Four severity levels, each with its own message sequence. Clients poll
//! per-level counts through `GetPLCstatus` and fetch individual messages with
//! `GetLogMessage`. Service messages always land in the in-process
//! [`LogStore`]; a program that exports its own log is appended behind them
//! through [`CombinedLog`].

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of log levels exposed on the wire.
pub const LOG_LEVELS: usize = 4;

/// Messages kept per level before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub const ALL: [LogLevel; LOG_LEVELS] = [
        LogLevel::Critical,
        LogLevel::Warning,
        LogLevel::Info,
        LogLevel::Debug,
    ];

    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One stored log message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub tick: u32,
    pub sec: u32,
    pub nsec: u32,
}

/// A source of PLC log messages.
pub trait PlcLog: Send + Sync {
    fn log_message(&self, level: LogLevel, message: &str);
    fn log_count(&self, level: LogLevel) -> u32;
    fn log_entry(&self, level: LogLevel, msg_id: u32) -> Option<LogEntry>;
    fn reset_log_count(&self);

    fn log_counts(&self) -> [u32; LOG_LEVELS] {
        LogLevel::ALL.map(|level| self.log_count(level))
    }
}

/// Bounded in-process log.
#[derive(Debug)]
pub struct LogStore {
    levels: Mutex<[LevelLog; LOG_LEVELS]>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct LevelLog {
    /// Id of the first entry still held in `entries`.
    first_id: u32,
    entries: VecDeque<LogEntry>,
}

impl LevelLog {
    fn count(&self) -> u32 {
        let held = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.first_id.saturating_add(held)
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LogStore {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            levels: Mutex::new(Default::default()),
            capacity: capacity.max(1),
        }
    }

    /// Drop every message and restart ids at zero.
    pub fn clear(&self) {
        *self.levels.lock() = Default::default();
    }

    pub fn log_with_tick(&self, level: LogLevel, message: &str, tick: u32) {
        let (sec, nsec) = now_parts();
        let mut levels = self.levels.lock();
        let log = &mut levels[level.index()];
        log.entries.push_back(LogEntry {
            message: message.to_string(),
            tick,
            sec,
            nsec,
        });
        while log.entries.len() > self.capacity {
            log.entries.pop_front();
            log.first_id = log.first_id.saturating_add(1);
        }
    }
}

impl PlcLog for LogStore {
    fn log_message(&self, level: LogLevel, message: &str) {
        self.log_with_tick(level, message, 0);
    }

    fn log_count(&self, level: LogLevel) -> u32 {
        self.levels.lock()[level.index()].count()
    }

    fn log_entry(&self, level: LogLevel, msg_id: u32) -> Option<LogEntry> {
        let levels = self.levels.lock();
        let log = &levels[level.index()];
        let offset = msg_id.checked_sub(log.first_id)?;
        log.entries.get(usize::try_from(offset).ok()?).cloned()
    }

    fn reset_log_count(&self) {
        self.clear();
    }
}

/// The service log followed by the loaded program's log, per level.
///
/// Ids below the service count address the service log, the rest address the
/// program log. Service entries keep their ids when the program goes away.
pub struct CombinedLog<'a> {
    service: &'a LogStore,
    program: Option<&'a dyn PlcLog>,
}

impl<'a> CombinedLog<'a> {
    #[must_use]
    pub fn new(service: &'a LogStore, program: Option<&'a dyn PlcLog>) -> Self {
        Self { service, program }
    }
}

impl PlcLog for CombinedLog<'_> {
    fn log_message(&self, level: LogLevel, message: &str) {
        self.service.log_message(level, message);
    }

    fn log_count(&self, level: LogLevel) -> u32 {
        let native = self.program.map_or(0, |log| log.log_count(level));
        self.service.log_count(level).saturating_add(native)
    }

    fn log_entry(&self, level: LogLevel, msg_id: u32) -> Option<LogEntry> {
        let own = self.service.log_count(level);
        match msg_id.checked_sub(own) {
            None => self.service.log_entry(level, msg_id),
            Some(native_id) => self.program?.log_entry(level, native_id),
        }
    }

    fn reset_log_count(&self) {
        self.service.reset_log_count();
        if let Some(program) = self.program {
            program.reset_log_count();
        }
    }
}

fn now_parts() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (
        u32::try_from(now.as_secs()).unwrap_or(u32::MAX),
        now.subsec_nanos(),
    )
}
