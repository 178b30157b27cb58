//! Thread control blocks and the service context.
//!
//! Exactly one managed thread occupies the interpreter at a time. The
//! scheduler loop below is the privileged service context: it owns the
//! handoff, consumes service records, grows stacks, runs the
//! collector, delivers exceptions and drives channel I/O through the
//! native bridge. It executes no bytecode itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{Priority, TaskExecutor, Timeout};
use crate::fault::fatal;
use crate::heap::NoopCollector;
use crate::interp::{self, RunExit};
use crate::isolate::IsolateId;
use crate::meta::MethodId;
use crate::monitor::PendingMonitors;
use crate::object::{NULL_REF, Ref};
use crate::service::{ServiceOp, ServiceRecord};
use crate::stack::{
    FIXED_FRAME_WORDS, FRAME_METHOD, FRAME_RETURN_FP, FRAME_RETURN_IP, NO_FRAME,
    STACK_GUARD_WORDS, ThreadStack,
};
use crate::tags::Tag;
use crate::vm::{PendingIo, Vm};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Runnable,
    Running,
    WaitingOnMonitor,
    WaitingOnCondition,
    WaitingOnJoin,
    WaitingOnTimer,
    Dead,
}

/// Interpreter registers of a suspended thread. The instruction
/// offset is method-relative so code may move underneath it.
#[derive(Debug, Copy, Clone)]
pub struct SavedFrame {
    pub method: MethodId,
    pub ip: u32,
}

/// Value the scheduler hands a thread to push when it resumes (native
/// and channel results).
#[derive(Debug, Copy, Clone)]
pub enum ResumeValue {
    Word(u32, Tag),
    Long(u64, Tag),
}

pub struct Tcb {
    pub id: ThreadId,
    pub state: ThreadState,
    pub isolate: IsolateId,
    pub entry: MethodId,
    pub stack: Option<ThreadStack>,
    pub saved: SavedFrame,
    pub pending: PendingMonitors,
    pub pending_exception: Ref,
    pub resume_push: Option<ResumeValue>,
    pub branch_quota: i32,
    pub gc_retried: bool,
    /// Cancellation request; honored at the next safepoint.
    pub kill_requested: bool,
    pub exit_value: i64,
    pub wake_at: Option<Instant>,
    /// Monitor and depth to re-acquire after a wait.
    pub wait_rejoin: Option<(Ref, u32)>,
    pub join_waiters: Vec<ThreadId>,
}

impl Tcb {
    fn new(id: ThreadId, entry: MethodId, isolate: IsolateId) -> Self {
        Self {
            id,
            state: ThreadState::New,
            isolate,
            entry,
            stack: None,
            saved: SavedFrame { method: entry, ip: 0 },
            pending: PendingMonitors::new(),
            pending_exception: NULL_REF,
            resume_push: None,
            branch_quota: 0,
            gc_retried: false,
            kill_requested: false,
            exit_value: 0,
            wake_at: None,
            wait_rejoin: None,
            join_waiters: Vec::new(),
        }
    }
}

pub fn spawn_thread(vm: &mut Vm, entry: MethodId, isolate: IsolateId) -> ThreadId {
    let id = ThreadId(vm.threads.len() as u32);
    vm.threads.push(Tcb::new(id, entry, isolate));
    vm.run_queue.push_back(id);
    log::debug!("thread {id:?} spawned on {:?}", entry);
    id
}

/// Drive managed threads until every one is dead or nothing can make
/// progress.
pub fn run(vm: &mut Vm) {
    loop {
        service_timers(vm);
        poll_channel_completions(vm);

        let tid = loop {
            match vm.run_queue.pop_front() {
                Some(t) if vm.tcb(t).state != ThreadState::Dead => break Some(t),
                Some(_) => continue,
                None => break None,
            }
        };

        let Some(tid) = tid else {
            if !idle_wait(vm) {
                break;
            }
            continue;
        };

        if vm.tcb(tid).kill_requested {
            // cancellation lands here, at a safepoint, never
            // mid-instruction
            finish_thread(vm, tid);
            continue;
        }

        switch_in(vm, tid);
        match interp::run(vm) {
            RunExit::Suspend => handle_service(vm),
            RunExit::ThreadDone => finish_thread(vm, tid),
        }
        // control is back on the service context
        vm.current = None;
    }
}

/// Ask a thread to die. Takes effect at its next safepoint; a thread
/// parked on a timer or condition is unparked so the request is seen.
pub fn kill_thread(vm: &mut Vm, tid: ThreadId) {
    let state = vm.tcb(tid).state;
    if state == ThreadState::Dead {
        return;
    }
    vm.tcb_mut(tid).kill_requested = true;
    if matches!(
        state,
        ThreadState::WaitingOnTimer
            | ThreadState::WaitingOnCondition
            | ThreadState::WaitingOnJoin
            | ThreadState::WaitingOnMonitor
    ) {
        vm.monitors.purge_thread(tid);
        make_runnable(vm, tid, false);
    }
}

fn switch_in(vm: &mut Vm, tid: ThreadId) {
    vm.stats.switches += 1;

    let isolate = vm.tcb(tid).isolate;
    if isolate != vm.current_isolate {
        // cached class-state pointers belong to the old isolate
        vm.current_isolate = isolate;
        vm.class_cache.invalidate();
    }

    if vm.tcb(tid).state == ThreadState::New {
        materialize(vm, tid);
    }

    let quota = vm.yield_quota;
    let tcb = vm.tcb_mut(tid);
    tcb.state = ThreadState::Running;
    tcb.branch_quota = quota;
    vm.current = Some(tid);
}

/// First switch-in: build the stack and the synthetic entry frame
/// with null return linkage.
fn materialize(vm: &mut Vm, tid: ThreadId) {
    let entry = vm.tcb(tid).entry;
    let header = vm.classes.method(entry).header;
    if header.param_words != 0 {
        fatal!("entry method {entry:?} declares parameters");
    }
    let required = FIXED_FRAME_WORDS
        + header.local_words as u32
        + header.stack_words as u32
        + STACK_GUARD_WORDS
        + 4;
    let words = vm.default_stack_words.max(required);
    let mut stack = ThreadStack::new(words, &vm.config);
    stack.push_frame(entry.0, &header, 0, &[]);

    let tcb = vm.tcb_mut(tid);
    tcb.stack = Some(stack);
    tcb.saved = SavedFrame { method: entry, ip: 0 };
}

fn make_runnable(vm: &mut Vm, tid: ThreadId, front: bool) {
    let tcb = vm.tcb_mut(tid);
    if tcb.state == ThreadState::Dead {
        return;
    }
    tcb.state = ThreadState::Runnable;
    tcb.wake_at = None;
    if front {
        vm.run_queue.push_front(tid);
    } else {
        vm.run_queue.push_back(tid);
    }
}

/// A managed-to-managed switch with live pending monitors is a lock
/// discipline violation; only the service context itself is exempt.
fn assert_no_pending(vm: &Vm, tid: ThreadId, what: &str) {
    if !vm.tcb(tid).pending.is_empty() {
        fatal!("{what} with {} pending monitors on {tid:?}", vm.tcb(tid).pending.depth());
    }
}

fn handle_service(vm: &mut Vm) {
    let rec = vm.service.take();
    let tid = rec.context;

    match rec.op {
        ServiceOp::Yield => {
            assert_no_pending(vm, tid, "yield");
            make_runnable(vm, tid, false);
        }
        ServiceOp::Extend => {
            let extra = rec.i[0] as u32;
            let config = vm.config.clone();
            match vm.tcb_mut(tid).stack.as_mut() {
                Some(stack) => stack.grow(extra, &config),
                None => fatal!("stack extension for a stackless thread"),
            }
            make_runnable(vm, tid, true);
        }
        ServiceOp::Gc => {
            vm.stats.collections += 1;
            let force = rec.i[0] != 0;
            let mut collector = std::mem::replace(&mut vm.collector, Box::new(NoopCollector));
            let reclaimed = collector.collect(&mut vm.heap, force);
            vm.collector = collector;
            log::debug!(
                "collection (force={force}) reclaimed={reclaimed}, {} bytes used",
                vm.heap.used_bytes()
            );
            make_runnable(vm, tid, true);
        }
        ServiceOp::Throw => deliver_exception(vm, tid, rec.o1),
        ServiceOp::Channel => {
            assert_no_pending(vm, tid, "channel request");
            start_channel(vm, tid, rec);
        }
        ServiceOp::MonitorEnter => {
            assert_no_pending(vm, tid, "monitor park");
            vm.tcb_mut(tid).state = ThreadState::WaitingOnMonitor;
        }
        ServiceOp::MonitorWait => {
            promote_pending(vm, tid);
            release_for_wait(vm, tid, rec.o1, millis_of(&rec));
        }
        ServiceOp::Sleep => {
            assert_no_pending(vm, tid, "sleep");
            let tcb = vm.tcb_mut(tid);
            tcb.wake_at = Some(Instant::now() + Duration::from_millis(millis_of(&rec)));
            tcb.state = ThreadState::WaitingOnTimer;
        }
        ServiceOp::Join => {
            assert_no_pending(vm, tid, "join");
            let target = rec.i[0] as usize;
            if vm.threads[target].state == ThreadState::Dead {
                make_runnable(vm, tid, false);
            } else {
                vm.threads[target].join_waiters.push(tid);
                vm.tcb_mut(tid).state = ThreadState::WaitingOnJoin;
            }
        }
    }
}

fn millis_of(rec: &ServiceRecord) -> u64 {
    ((rec.i[0] as u32 as u64) << 32) | rec.i[1] as u32 as u64
}

fn promote_pending(vm: &mut Vm, tid: ThreadId) {
    let drained = vm.tcb_mut(tid).pending.drain();
    for obj in drained {
        match vm.monitors.enter(obj, tid) {
            crate::monitor::Enter::Acquired => {}
            crate::monitor::Enter::Contended => {
                fatal!("pending monitor {obj:#x} contended during promotion")
            }
        }
    }
}

fn release_for_wait(vm: &mut Vm, tid: ThreadId, obj: Ref, millis: u64) {
    let (depth, next) = {
        let state = vm.monitors.state_mut(obj);
        if state.owner != Some(tid) {
            fatal!("wait released a monitor not owned by {tid:?}");
        }
        let depth = state.depth;
        state.owner = None;
        state.depth = 0;
        let next = state.entry_queue.pop_front();
        state.wait_queue.push_back(tid);
        (depth, next)
    };
    {
        let tcb = vm.tcb_mut(tid);
        tcb.wait_rejoin = Some((obj, depth));
        tcb.state = ThreadState::WaitingOnCondition;
        if millis != 0 {
            tcb.wake_at = Some(Instant::now() + Duration::from_millis(millis));
        }
    }
    if let Some(next) = next {
        grant_monitor(vm, obj, next);
    }
}

/// Hand a released monitor to `tid`, restoring a wait depth if this
/// was a re-acquisition, and schedule it.
pub fn grant_monitor(vm: &mut Vm, obj: Ref, tid: ThreadId) {
    vm.monitors.grant(obj, tid);
    let rejoin = vm.tcb_mut(tid).wait_rejoin.take();
    if let Some((waited, depth)) = rejoin {
        if waited == obj {
            vm.monitors.state_mut(obj).depth = depth;
        } else {
            vm.tcb_mut(tid).wait_rejoin = Some((waited, depth));
        }
    }
    make_runnable(vm, tid, false);
}

/// Move one or all waiters of `obj` to the entry queue.
pub fn notify_waiters(vm: &mut Vm, obj: Ref, all: bool) {
    let moved: Vec<ThreadId> = {
        let state = vm.monitors.state_mut(obj);
        let moved: Vec<ThreadId> = if all {
            state.wait_queue.drain(..).collect()
        } else {
            state.wait_queue.pop_front().into_iter().collect()
        };
        for &t in &moved {
            state.entry_queue.push_back(t);
        }
        moved
    };
    for t in moved {
        let tcb = vm.tcb_mut(t);
        tcb.state = ThreadState::WaitingOnMonitor;
        tcb.wake_at = None;
    }
}

fn start_channel(vm: &mut Vm, tid: ThreadId, rec: ServiceRecord) {
    let handler = vm.channels.get(&rec.channel).cloned();
    let Some(handler) = handler else {
        log::warn!("request on unknown channel {}", rec.channel);
        vm.tcb_mut(tid).resume_push = Some(ResumeValue::Long(-1i64 as u64, Tag::LongHalf));
        make_runnable(vm, tid, false);
        return;
    };
    let monitor = Arc::clone(&vm.bridge);
    let name = format!("channel-{}", rec.channel);
    let request = rec.clone();
    match TaskExecutor::spawn(&name, Priority::Med, 64 * 1024, monitor, move || {
        handler.handle(&request)
    }) {
        Ok(exec) => {
            vm.pending_io.push(PendingIo { thread: tid, exec });
            vm.tcb_mut(tid).state = ThreadState::WaitingOnCondition;
        }
        Err(err) => {
            // misconfiguration at the bridge level is not recoverable
            fatal!(
                "channel executor creation failed: {} (errno {:?})",
                err.message,
                err.errno
            );
        }
    }
}

fn poll_channel_completions(vm: &mut Vm) {
    let mut still_pending = Vec::new();
    let drained: Vec<PendingIo> = vm.pending_io.drain(..).collect();
    for io in drained {
        if io.exec.state() == crate::bridge::ExecutorState::Done {
            let result = io.exec.result().unwrap_or(-1);
            let tid = io.thread;
            if let Err(exec) = io.exec.destroy() {
                still_pending.push(PendingIo { thread: tid, exec });
                continue;
            }
            let tcb = vm.tcb_mut(tid);
            tcb.resume_push = Some(ResumeValue::Long(result as u64, Tag::LongHalf));
            make_runnable(vm, tid, false);
        } else {
            still_pending.push(io);
        }
    }
    vm.pending_io = still_pending;
}

fn service_timers(vm: &mut Vm) {
    let now = Instant::now();
    let expired: Vec<ThreadId> = vm
        .threads
        .iter()
        .filter(|t| matches!(t.wake_at, Some(at) if at <= now))
        .map(|t| t.id)
        .collect();

    for tid in expired {
        match vm.tcb(tid).state {
            ThreadState::WaitingOnTimer => {
                make_runnable(vm, tid, false);
            }
            ThreadState::WaitingOnCondition => {
                // timed-out monitor wait: leave the wait queue and
                // compete for the monitor again
                let Some((obj, _)) = vm.tcb(tid).wait_rejoin else {
                    fatal!("condition wait timeout without a rejoin record");
                };
                {
                    let state = vm.monitors.state_mut(obj);
                    state.wait_queue.retain(|&t| t != tid);
                }
                vm.tcb_mut(tid).wake_at = None;
                let unowned = vm
                    .monitors
                    .state(obj)
                    .map(|s| s.owner.is_none())
                    .unwrap_or(true);
                if unowned {
                    grant_monitor(vm, obj, tid);
                } else {
                    vm.monitors.state_mut(obj).entry_queue.push_back(tid);
                    vm.tcb_mut(tid).state = ThreadState::WaitingOnMonitor;
                }
            }
            _ => {
                vm.tcb_mut(tid).wake_at = None;
            }
        }
    }
}

/// Nothing runnable: wait for a channel completion or the nearest
/// timer. Returns false when no progress is possible anymore.
fn idle_wait(vm: &mut Vm) -> bool {
    let nearest = vm.threads.iter().filter_map(|t| t.wake_at).min();
    let has_io = !vm.pending_io.is_empty();

    if !has_io && nearest.is_none() {
        let blocked = vm
            .threads
            .iter()
            .filter(|t| !matches!(t.state, ThreadState::Dead))
            .count();
        if blocked > 0 {
            log::error!("{blocked} threads blocked with no wake source: deadlock");
        }
        return false;
    }

    let timeout = match nearest {
        Some(at) => {
            let now = Instant::now();
            Timeout::Millis(at.saturating_duration_since(now).as_millis() as u64 + 1)
        }
        None => Timeout::Millis(50),
    };
    vm.bridge.wait_signal(timeout);
    // an external interrupt burns its pending wake here
    vm.waker.consume();
    true
}

fn finish_thread(vm: &mut Vm, tid: ThreadId) {
    if !vm.tcb(tid).pending.is_empty() {
        fatal!("thread {tid:?} finished while holding pending monitors");
    }
    if let Some(obj) = vm.monitors.owned_by(tid) {
        fatal!("thread {tid:?} finished while owning monitor {obj:#x}");
    }
    let joiners = {
        let tcb = vm.tcb_mut(tid);
        tcb.state = ThreadState::Dead;
        // detaching the stack retires the thread
        tcb.stack = None;
        std::mem::take(&mut tcb.join_waiters)
    };
    for j in joiners {
        make_runnable(vm, j, false);
    }
    log::debug!("thread {tid:?} finished");
}

fn deliver_exception(vm: &mut Vm, tid: ThreadId, exc: Ref) {
    let mut stack = match vm.tcb_mut(tid).stack.take() {
        Some(s) => s,
        None => fatal!("exception delivery to a stackless thread"),
    };
    let exc_class = vm.heap.class_of(exc);

    let mut fp = stack.fp;
    let mut method = vm.tcb(tid).saved.method;
    let mut pc = vm.tcb(tid).saved.ip;

    loop {
        let mut target = None;
        for h in &vm.classes.method(method).handlers {
            if pc >= h.start && pc < h.end && vm.classes.assignable(exc_class, h.class) {
                target = Some(h.target);
                break;
            }
        }
        if let Some(target) = target {
            // unwind to the handler frame and clear its operand stack
            let header = vm.classes.method(method).header;
            stack.fp = fp;
            stack.base = fp - header.local_words as u32;
            stack.sp = stack.base;
            let tcb = vm.tcb_mut(tid);
            tcb.saved = SavedFrame { method, ip: target };
            tcb.pending_exception = exc;
            tcb.stack = Some(stack);
            make_runnable(vm, tid, true);
            return;
        }

        let ret_fp = stack.read_ix(fp + FRAME_RETURN_FP, Tag::Int);
        if ret_fp == NO_FRAME {
            break;
        }
        // the return address points past the invoke; back up into it
        // so handler ranges cover the call site
        pc = stack
            .read_ix(fp + FRAME_RETURN_IP, Tag::Int)
            .saturating_sub(1);
        fp = ret_fp;
        method = MethodId(stack.read_ix(fp + FRAME_METHOD, Tag::Int));
    }

    let name = vm.classes.class(exc_class).name.clone();
    log::error!("unhandled {name} in thread {tid:?}");
    vm.tcb_mut(tid).stack = Some(stack);
    vm.tcb_mut(tid).exit_value = -1;
    finish_thread(vm, tid);
}
