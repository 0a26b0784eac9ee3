//! Trace buffering between the sampler and polling clients.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::RuntimeError;

use super::{DebugSample, DebugSampler, PollOutcome};

const POLL_BACKOFF: Duration = Duration::from_millis(5);
const WAKE_CHECK: Duration = Duration::from_millis(50);

/// Encoded size of a sample beyond its payload: tick and length prefix.
pub const SAMPLE_OVERHEAD: usize = 8;

/// Bounded FIFO of samples not yet delivered to a client.
///
/// The bound is on encoded sample bytes (payload plus [`SAMPLE_OVERHEAD`]);
/// the oldest samples go first.
#[derive(Debug)]
pub struct TraceBuffer {
    queue: Mutex<TraceQueue>,
    wake: Condvar,
    limit: usize,
    idle: Duration,
}

#[derive(Debug)]
struct TraceQueue {
    samples: VecDeque<DebugSample>,
    bytes: usize,
    last_swap: Instant,
    swaps: u64,
}

impl TraceBuffer {
    #[must_use]
    pub fn new(limit: usize, idle: Duration) -> Self {
        Self {
            queue: Mutex::new(TraceQueue {
                samples: VecDeque::new(),
                bytes: 0,
                last_swap: Instant::now(),
                swaps: 0,
            }),
            wake: Condvar::new(),
            limit,
            idle,
        }
    }

    pub fn push(&self, sample: DebugSample) {
        let mut queue = self.queue.lock();
        queue.bytes += encoded_len(&sample);
        queue.samples.push_back(sample);
        while queue.bytes > self.limit {
            let Some(dropped) = queue.samples.pop_front() else {
                break;
            };
            queue.bytes -= encoded_len(&dropped);
        }
    }

    /// Take every buffered sample and reset the idle timer.
    pub fn swap(&self) -> Vec<DebugSample> {
        let mut queue = self.queue.lock();
        queue.last_swap = Instant::now();
        queue.swaps = queue.swaps.wrapping_add(1);
        queue.bytes = 0;
        let samples = std::mem::take(&mut queue.samples).into();
        self.wake.notify_all();
        samples
    }

    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.samples.clear();
        queue.bytes = 0;
    }

    /// Restart the idle timer without delivering anything.
    pub fn touch(&self) {
        self.queue.lock().last_swap = Instant::now();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when no client swapped for longer than the idle timeout.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.lock().last_swap.elapsed() > self.idle
    }

    /// Block until the next [`Self::swap`]. Returns `false` if `stop` was
    /// raised first.
    fn wait_for_swap(&self, stop: &AtomicBool) -> bool {
        let mut queue = self.queue.lock();
        let seen = queue.swaps;
        while queue.swaps == seen {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            self.wake.wait_for(&mut queue, WAKE_CHECK);
        }
        true
    }

    fn notify(&self) {
        self.wake.notify_all();
    }
}

/// Handle to the thread moving samples from the sampler into a buffer.
#[derive(Debug)]
pub struct TraceThread {
    stop: Arc<AtomicBool>,
    buffer: Arc<TraceBuffer>,
    join: Option<JoinHandle<()>>,
}

impl TraceThread {
    /// Ask the thread to finish and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.buffer.notify();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TraceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start polling `sampler` into `buffer`.
///
/// When no client swapped the buffer for the idle timeout the thread drops
/// the buffered samples, switches native debug off and sleeps until the next
/// swap, then registers the variables again.
pub fn spawn_trace_thread(
    sampler: Arc<DebugSampler>,
    buffer: Arc<TraceBuffer>,
) -> Result<TraceThread, RuntimeError> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let buffer_thread = buffer.clone();
    buffer.touch();
    let join = thread::Builder::new()
        .name("plc-trace".into())
        .spawn(move || run_trace_loop(&sampler, &buffer_thread, &stop_thread))
        .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
    Ok(TraceThread {
        stop,
        buffer,
        join: Some(join),
    })
}

fn run_trace_loop(sampler: &DebugSampler, buffer: &TraceBuffer, stop: &AtomicBool) {
    debug!("trace thread running");
    while !stop.load(Ordering::SeqCst) {
        if buffer.is_idle() {
            debug!("no trace client, suspending debug");
            buffer.clear();
            sampler.disable();
            if !buffer.wait_for_swap(stop) {
                break;
            }
            if let Err(err) = sampler.reenable() {
                warn!("re-enabling trace failed: {err}");
            }
            continue;
        }
        match sampler.poll() {
            PollOutcome::Sample(sample) => buffer.push(sample),
            PollOutcome::Busy | PollOutcome::Empty => thread::sleep(POLL_BACKOFF),
        }
    }
    debug!("trace thread finished");
}

fn encoded_len(sample: &DebugSample) -> usize {
    sample.raw.len() + SAMPLE_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tick: u32, size: usize) -> DebugSample {
        DebugSample {
            tick,
            values: Vec::new(),
            raw: vec![0; size],
        }
    }

    #[test]
    fn oldest_samples_drop_past_limit() {
        // 12 encoded bytes per sample: two fit.
        let buffer = TraceBuffer::new(30, Duration::from_secs(3));
        for tick in 0..5 {
            buffer.push(sample(tick, 4));
        }
        let ticks: Vec<u32> = buffer.swap().iter().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn swap_resets_idle_timer() {
        let buffer = TraceBuffer::new(1024, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        assert!(buffer.is_idle());
        buffer.swap();
        assert!(!buffer.is_idle());
    }

    #[test]
    fn wait_for_swap_returns_on_stop() {
        let buffer = TraceBuffer::new(16, Duration::from_millis(1));
        let stop = AtomicBool::new(true);
        assert!(!buffer.wait_for_swap(&stop));
    }

    #[test]
    fn idle_thread_without_program_stops_cleanly() {
        let sampler = Arc::new(DebugSampler::new());
        let buffer = Arc::new(TraceBuffer::new(64, Duration::from_millis(10)));
        let handle = spawn_trace_thread(sampler, buffer).unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.stop();
    }
}
