//! Debug sampling of a running program.

#![allow(missing_docs)]

mod sampler;
mod trace;
mod types;

pub use sampler::{DebugSampler, PollOutcome};
pub use trace::{spawn_trace_thread, TraceBuffer, TraceThread, SAMPLE_OVERHEAD};
pub use types::{decode_buffer, IecTimespec, IecType, IecValue, STRING_CAPACITY};

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// One variable the client wants traced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOrder {
    /// Index in the program's debug variable table.
    pub idx: u32,
    /// Type used to decode the variable's bytes.
    #[serde(rename = "type")]
    pub iec_type: IecType,
    /// Value written over the variable every cycle, if any.
    #[serde(default)]
    pub force: Option<IecValue>,
}

impl TraceOrder {
    #[must_use]
    pub fn new(idx: u32, iec_type: IecType) -> Self {
        Self {
            idx,
            iec_type,
            force: None,
        }
    }

    #[must_use]
    pub fn forced(mut self, value: IecValue) -> Self {
        self.force = Some(value);
        self
    }

    /// Force value in the program's native layout.
    pub fn force_bytes(&self) -> Result<Option<Vec<u8>>, RuntimeError> {
        self.force
            .as_ref()
            .map(|value| self.iec_type.encode_force(value))
            .transpose()
    }
}

/// The complete set of traced variables; replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub orders: Vec<TraceOrder>,
}

impl TraceRequest {
    #[must_use]
    pub fn new(orders: Vec<TraceOrder>) -> Self {
        Self { orders }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    #[must_use]
    pub fn types(&self) -> Vec<IecType> {
        self.orders.iter().map(|order| order.iec_type).collect()
    }
}

/// One decoded snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugSample {
    pub tick: u32,
    /// Values in trace request order.
    pub values: Vec<IecValue>,
    /// The debug buffer the values were decoded from.
    pub raw: Vec<u8>,
}
