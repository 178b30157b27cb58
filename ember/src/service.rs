//! The service operation record.
//!
//! All privileged work (stack growth, collection, exception delivery,
//! blocking channel I/O, monitor parking) is described by this one
//! fixed-arity record and performed by the service context.
//! Exactly one record may be in flight system-wide; posting a second
//! is a runtime bug and fatal.

use crate::fault::fatal;
use crate::object::{NULL_REF, Ref};
use crate::scheduler::ThreadId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceOp {
    /// Voluntary reschedule at a backward-branch safepoint.
    Yield,
    /// Grow the current stack; `i[0]` = shortfall in words.
    Extend,
    /// Run the collector; `i[0]` != 0 forces a full collection.
    /// `o1` optionally carries the class whose allocation failed.
    Gc,
    /// Deliver the pending exception in `o1`.
    Throw,
    /// Generic channel request: `channel`, `i[0..6]`, `o1`/`o2`.
    Channel,
    /// Park until the monitor for `o1` can be acquired.
    MonitorEnter,
    /// Wait on `o1`'s condition queue; `i[0]`/`i[1]` = timeout millis
    /// (hi/lo), 0 = forever.
    MonitorWait,
    /// Sleep; `i[0]`/`i[1]` = millis (hi/lo).
    Sleep,
    /// Join thread id `i[0]`.
    Join,
}

/// The engine <-> service contract. Every new blocking capability
/// must be expressible in these fields.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub context: ThreadId,
    pub op: ServiceOp,
    pub channel: u32,
    pub i: [i32; 6],
    pub o1: Ref,
    pub o2: Ref,
    pub result: i64,
    pub address_result: Ref,
}

impl ServiceRecord {
    pub fn new(context: ThreadId, op: ServiceOp) -> Self {
        Self {
            context,
            op,
            channel: 0,
            i: [0; 6],
            o1: NULL_REF,
            o2: NULL_REF,
            result: 0,
            address_result: NULL_REF,
        }
    }
}

/// Single-writer slot holding the in-flight record.
#[derive(Default)]
pub struct ServiceSlot {
    current: Option<ServiceRecord>,
}

impl ServiceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, record: ServiceRecord) {
        if let Some(live) = &self.current {
            fatal!(
                "service record posted while {:?} from {:?} is in flight",
                live.op,
                live.context
            );
        }
        self.current = Some(record);
    }

    pub fn take(&mut self) -> ServiceRecord {
        match self.current.take() {
            Some(r) => r,
            None => fatal!("service context woken without a record"),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }
}
