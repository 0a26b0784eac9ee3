//! Debug sampler.
//!
//! Registration and reads share one lock: `configure` takes it blocking,
//! `poll` only tries it, so a poll either sees the whole old variable set or
//! the whole new one. The first buffer read after a registration may have
//! been published under the previous one and is dropped.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::loader::PlcProgram;

use super::{decode_buffer, DebugSample, IecType, TraceRequest};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Sample(DebugSample),
    /// Registration in progress; retry next round.
    Busy,
    /// No sample this round (debug off, nothing published, or undecodable).
    Empty,
}

#[derive(Default)]
struct SamplerState {
    program: Option<Arc<dyn PlcProgram>>,
    request: TraceRequest,
    types: Vec<IecType>,
    enabled: bool,
    /// Next buffer read may predate the current registration.
    stale: bool,
}

#[derive(Default)]
pub struct DebugSampler {
    state: Mutex<SamplerState>,
}

impl std::fmt::Debug for DebugSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSampler").finish_non_exhaustive()
    }
}

impl DebugSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to a freshly loaded program. Debug starts disabled.
    pub fn attach(&self, program: Arc<dyn PlcProgram>) {
        let mut state = self.state.lock();
        state.program = Some(program);
        state.types.clear();
        state.enabled = false;
    }

    /// Forget the program before it is unloaded.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.program = None;
        state.types.clear();
        state.enabled = false;
    }

    /// Replace the registered variable set. Returns whether debug is active
    /// afterwards. An empty request disables debug.
    pub fn configure(&self, request: &TraceRequest) -> Result<bool, RuntimeError> {
        let forces = request
            .orders
            .iter()
            .map(super::TraceOrder::force_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.state.lock();
        state.request = request.clone();
        let Some(program) = state.program.clone() else {
            state.enabled = false;
            return Ok(false);
        };
        if request.is_empty() {
            program.suspend_debug(true);
            state.types.clear();
            state.enabled = false;
            return Ok(false);
        }
        if program.suspend_debug(false) != 0 {
            warn!("program refused to enable debug");
            state.enabled = false;
            return Ok(false);
        }
        program.reset_debug_variables();
        for (order, force) in request.orders.iter().zip(&forces) {
            program.register_debug_variable(order.idx, force.as_deref());
        }
        state.types = request.types();
        state.enabled = true;
        state.stale = true;
        program.resume_debug();
        debug!(variables = request.orders.len(), "trace variables registered");
        Ok(true)
    }

    /// Re-apply the last request, e.g. after an idle suspension.
    pub fn reenable(&self) -> Result<bool, RuntimeError> {
        let request = self.state.lock().request.clone();
        self.configure(&request)
    }

    /// Take one sample without waiting on a concurrent registration.
    pub fn poll(&self) -> PollOutcome {
        let Some(mut state) = self.state.try_lock() else {
            return PollOutcome::Busy;
        };
        let Some(program) = state.program.clone().filter(|_| state.enabled) else {
            return PollOutcome::Empty;
        };
        let Some(data) = program.debug_data() else {
            return PollOutcome::Empty;
        };
        if std::mem::take(&mut state.stale) {
            debug!(tick = data.tick, "dropping buffer from previous registration");
            return PollOutcome::Empty;
        }
        match decode_buffer(&state.types, &data.buffer) {
            Ok(values) => PollOutcome::Sample(DebugSample {
                tick: data.tick,
                values,
                raw: data.buffer,
            }),
            Err(err) => {
                warn!(tick = data.tick, "dropping debug sample: {err}");
                PollOutcome::Empty
            }
        }
    }

    /// Switch native debug off, keeping the request for [`Self::reenable`].
    pub fn disable(&self) {
        let mut state = self.state.lock();
        if let Some(program) = &state.program {
            program.suspend_debug(true);
        }
        state.enabled = false;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{IecValue, TraceOrder};
    use crate::loader::DebugData;

    /// Publishes a fixed buffer regardless of registration.
    struct FixedProgram {
        buffer: Vec<u8>,
        registered: Mutex<Vec<(u32, Option<Vec<u8>>)>>,
        suspended: Mutex<Option<bool>>,
    }

    impl FixedProgram {
        fn new(buffer: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                buffer,
                registered: Mutex::new(Vec::new()),
                suspended: Mutex::new(None),
            })
        }
    }

    impl PlcProgram for FixedProgram {
        fn start(&self, _args: &[String]) -> i32 {
            0
        }
        fn stop(&self) {}
        fn reset_debug_variables(&self) {
            self.registered.lock().clear();
        }
        fn register_debug_variable(&self, idx: u32, force: Option<&[u8]>) {
            self.registered.lock().push((idx, force.map(<[u8]>::to_vec)));
        }
        fn suspend_debug(&self, disable: bool) -> i32 {
            *self.suspended.lock() = Some(disable);
            0
        }
        fn resume_debug(&self) {}
        fn debug_data(&self) -> Option<DebugData> {
            Some(DebugData {
                tick: 9,
                buffer: self.buffer.clone(),
            })
        }
    }

    fn int_bool_request() -> TraceRequest {
        TraceRequest::new(vec![
            TraceOrder::new(0, IecType::Int),
            TraceOrder::new(1, IecType::Bool).forced(IecValue::Bool(true)),
        ])
    }

    #[test]
    fn configure_registers_in_order_with_forces() {
        let program = FixedProgram::new(vec![1, 0, 1]);
        let sampler = DebugSampler::new();
        sampler.attach(program.clone());
        assert!(sampler.configure(&int_bool_request()).unwrap());
        assert_eq!(
            *program.registered.lock(),
            vec![(0, None), (1, Some(vec![1]))]
        );
        assert_eq!(*program.suspended.lock(), Some(false));
        assert_eq!(sampler.poll(), PollOutcome::Empty);
        match sampler.poll() {
            PollOutcome::Sample(sample) => {
                assert_eq!(sample.tick, 9);
                assert_eq!(
                    sample.values,
                    vec![IecValue::Signed(1), IecValue::Bool(true)]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatched_buffer_yields_no_sample() {
        let sampler = DebugSampler::new();
        sampler.attach(FixedProgram::new(vec![1]));
        sampler.configure(&int_bool_request()).unwrap();
        assert_eq!(sampler.poll(), PollOutcome::Empty);
    }

    #[test]
    fn empty_request_disables_debug() {
        let program = FixedProgram::new(Vec::new());
        let sampler = DebugSampler::new();
        sampler.attach(program.clone());
        assert!(!sampler.configure(&TraceRequest::default()).unwrap());
        assert_eq!(*program.suspended.lock(), Some(true));
        assert_eq!(sampler.poll(), PollOutcome::Empty);
    }

    #[test]
    fn poll_is_busy_while_locked() {
        let sampler = DebugSampler::new();
        let _guard = sampler.state.lock();
        assert_eq!(sampler.poll(), PollOutcome::Busy);
    }

    #[test]
    fn unencodable_force_is_rejected_before_registration() {
        let program = FixedProgram::new(Vec::new());
        let sampler = DebugSampler::new();
        sampler.attach(program.clone());
        let request = TraceRequest::new(vec![
            TraceOrder::new(0, IecType::Sint).forced(IecValue::Signed(1000))
        ]);
        assert!(sampler.configure(&request).is_err());
        assert!(program.registered.lock().is_empty());
    }

    /// Keeps one published buffer until it is read, whatever gets
    /// registered in between.
    struct LatchedProgram {
        registered: Mutex<Vec<u32>>,
        published: Mutex<Option<Vec<u8>>>,
    }

    impl LatchedProgram {
        fn publish(&self) {
            let buffer = self
                .registered
                .lock()
                .iter()
                .flat_map(|idx| i16::try_from(*idx).unwrap().to_le_bytes())
                .collect();
            *self.published.lock() = Some(buffer);
        }
    }

    impl PlcProgram for LatchedProgram {
        fn start(&self, _args: &[String]) -> i32 {
            0
        }
        fn stop(&self) {}
        fn reset_debug_variables(&self) {
            self.registered.lock().clear();
        }
        fn register_debug_variable(&self, idx: u32, _force: Option<&[u8]>) {
            self.registered.lock().push(idx);
        }
        fn suspend_debug(&self, _disable: bool) -> i32 {
            0
        }
        fn resume_debug(&self) {}
        fn debug_data(&self) -> Option<DebugData> {
            self.published
                .lock()
                .take()
                .map(|buffer| DebugData { tick: 1, buffer })
        }
    }

    #[test]
    fn buffer_from_previous_registration_is_dropped() {
        let program = Arc::new(LatchedProgram {
            registered: Mutex::new(Vec::new()),
            published: Mutex::new(None),
        });
        let sampler = DebugSampler::new();
        sampler.attach(program.clone());
        sampler
            .configure(&TraceRequest::new(vec![TraceOrder::new(7, IecType::Int)]))
            .unwrap();
        // Published under [7], still unread when the set changes to [9].
        program.publish();
        sampler
            .configure(&TraceRequest::new(vec![TraceOrder::new(9, IecType::Int)]))
            .unwrap();
        assert_eq!(sampler.poll(), PollOutcome::Empty);

        program.publish();
        match sampler.poll() {
            PollOutcome::Sample(sample) => assert_eq!(sample.values, vec![IecValue::Signed(9)]),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Publishes each registered index as an INT holding that index.
    #[derive(Default)]
    struct MirrorProgram {
        registered: Mutex<Vec<u32>>,
    }

    impl PlcProgram for MirrorProgram {
        fn start(&self, _args: &[String]) -> i32 {
            0
        }
        fn stop(&self) {}
        fn reset_debug_variables(&self) {
            self.registered.lock().clear();
        }
        fn register_debug_variable(&self, idx: u32, _force: Option<&[u8]>) {
            self.registered.lock().push(idx);
            std::thread::yield_now();
        }
        fn suspend_debug(&self, _disable: bool) -> i32 {
            0
        }
        fn resume_debug(&self) {}
        fn debug_data(&self) -> Option<DebugData> {
            let buffer = self
                .registered
                .lock()
                .iter()
                .flat_map(|idx| i16::try_from(*idx).unwrap().to_le_bytes())
                .collect();
            Some(DebugData { tick: 1, buffer })
        }
    }

    #[test]
    fn poll_never_sees_half_registered_set() {
        let sampler = Arc::new(DebugSampler::new());
        sampler.attach(Arc::new(MirrorProgram::default()));
        let first = TraceRequest::new(vec![
            TraceOrder::new(1, IecType::Int),
            TraceOrder::new(2, IecType::Int),
        ]);
        let second = TraceRequest::new(vec![
            TraceOrder::new(3, IecType::Int),
            TraceOrder::new(4, IecType::Int),
            TraceOrder::new(5, IecType::Int),
        ]);
        sampler.configure(&first).unwrap();

        let poller = {
            let sampler = sampler.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..2000 {
                    if let PollOutcome::Sample(sample) = sampler.poll() {
                        seen.push(sample.values);
                    }
                }
                seen
            })
        };
        for round in 0..200 {
            let request = if round % 2 == 0 { &second } else { &first };
            sampler.configure(request).unwrap();
        }
        let seen = poller.join().unwrap();

        let old = vec![IecValue::Signed(1), IecValue::Signed(2)];
        let new = vec![
            IecValue::Signed(3),
            IecValue::Signed(4),
            IecValue::Signed(5),
        ];
        assert!(seen.iter().all(|values| *values == old || *values == new));
    }
}
