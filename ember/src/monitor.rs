//! Managed monitors: the pending fast-path cache and the promoted
//! monitor table.
//!
//! Short uncontended lock scopes never allocate a monitor: the object
//! ref is pushed on the thread's pending cache and popped by the
//! matching exit. Contention, cache pressure, or out-of-range objects
//! promote to a full monitor with owner, depth and queues.

use std::collections::VecDeque;

use ahash::AHashMap;

use crate::fault::fatal;
use crate::object::Ref;
use crate::scheduler::ThreadId;

pub const PENDING_MONITOR_CAPACITY: usize = 6;

/// Per-thread LIFO of monitor-entered objects not yet promoted.
#[derive(Debug, Clone)]
pub struct PendingMonitors {
    slots: [Ref; PENDING_MONITOR_CAPACITY],
    depth: usize,
    pub enabled: bool,
}

impl PendingMonitors {
    pub fn new() -> Self {
        Self {
            slots: [0; PENDING_MONITOR_CAPACITY],
            depth: 0,
            enabled: true,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    #[inline]
    pub fn has_room(&self) -> bool {
        self.enabled && self.depth < PENDING_MONITOR_CAPACITY
    }

    pub fn push(&mut self, obj: Ref) {
        if !self.has_room() {
            fatal!("pending monitor push without room");
        }
        self.slots[self.depth] = obj;
        self.depth += 1;
    }

    /// Pop iff `obj` is the most recent entry.
    pub fn pop_if_top(&mut self, obj: Ref) -> bool {
        if self.depth > 0 && self.slots[self.depth - 1] == obj {
            self.depth -= 1;
            return true;
        }
        false
    }

    pub fn contains(&self, obj: Ref) -> bool {
        self.slots[..self.depth].contains(&obj)
    }

    /// Drain for promotion, most recent last.
    pub fn drain(&mut self) -> Vec<Ref> {
        let out = self.slots[..self.depth].to_vec();
        self.depth = 0;
        out
    }
}

impl Default for PendingMonitors {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct MonitorState {
    pub owner: Option<ThreadId>,
    pub depth: u32,
    /// Threads blocked trying to enter.
    pub entry_queue: VecDeque<ThreadId>,
    /// Threads parked in wait() until a notify.
    pub wait_queue: VecDeque<ThreadId>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Enter {
    Acquired,
    /// Caller must park on the entry queue.
    Contended,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    StillHeld,
    /// Released; the next owner to wake, if any.
    Released(Option<ThreadId>),
}

#[derive(Default)]
pub struct MonitorTable {
    map: AHashMap<Ref, MonitorState>,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_promoted(&self, obj: Ref) -> bool {
        self.map.contains_key(&obj)
    }

    pub fn state_mut(&mut self, obj: Ref) -> &mut MonitorState {
        self.map.entry(obj).or_default()
    }

    pub fn state(&self, obj: Ref) -> Option<&MonitorState> {
        self.map.get(&obj)
    }

    /// Full (promoted) monitor entry.
    pub fn enter(&mut self, obj: Ref, thread: ThreadId) -> Enter {
        let state = self.state_mut(obj);
        match state.owner {
            None => {
                state.owner = Some(thread);
                state.depth = 1;
                Enter::Acquired
            }
            Some(owner) if owner == thread => {
                state.depth += 1;
                Enter::Acquired
            }
            Some(_) => {
                state.entry_queue.push_back(thread);
                Enter::Contended
            }
        }
    }

    /// Full monitor exit; exiting a monitor the thread does not own is
    /// a lock-discipline violation and fatal.
    pub fn exit(&mut self, obj: Ref, thread: ThreadId) -> Exit {
        let state = match self.map.get_mut(&obj) {
            Some(s) => s,
            None => fatal!("monitor exit on {obj:#x} which was never entered"),
        };
        if state.owner != Some(thread) {
            fatal!("monitor exit on {obj:#x} by non-owner {thread:?}");
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Exit::StillHeld;
        }
        state.owner = None;
        let next = state.entry_queue.pop_front();
        if next.is_none() && state.wait_queue.is_empty() {
            // demote: nobody cares about this monitor anymore
            self.map.remove(&obj);
        }
        Exit::Released(next)
    }

    /// Drop a thread from every entry and wait queue (cancellation).
    pub fn purge_thread(&mut self, thread: ThreadId) {
        for state in self.map.values_mut() {
            state.entry_queue.retain(|&t| t != thread);
            state.wait_queue.retain(|&t| t != thread);
        }
    }

    /// Some monitor currently owned by `thread`, if any.
    pub fn owned_by(&self, thread: ThreadId) -> Option<Ref> {
        self.map
            .iter()
            .find(|(_, s)| s.owner == Some(thread))
            .map(|(&obj, _)| obj)
    }

    /// Hand the released monitor to a woken waiter.
    pub fn grant(&mut self, obj: Ref, thread: ThreadId) {
        let state = self.state_mut(obj);
        if state.owner.is_some() {
            fatal!("monitor grant while owned");
        }
        state.owner = Some(thread);
        state.depth = 1;
    }
}
