//! The dispatch loop.
//!
//! One instruction at a time against the current activation frame.
//! Application faults (null deref, bounds, arithmetic, cast,
//! array-store, uninitialized class) become managed exceptions via the
//! throw protocol; invariant violations die on the spot. Anything that
//! needs privileged work returns a suspension to the scheduler after
//! posting the service record.

use crate::fault::fatal;
use crate::meta::{ABSTRACT_METHOD, ClassModifiers, MethodId};
use crate::object::{ClassId, NULL_REF, Ref};
use crate::opcode::{Decoded, Opcode, decode};
use crate::scheduler::{SavedFrame, ThreadId, grant_monitor};
use crate::service::{ServiceOp, ServiceRecord};
use crate::stack::{FRAME_METHOD, NO_FRAME, ThreadStack};
use crate::tags::Tag;
use crate::monitor::Enter;
use crate::vm::Vm;

/// Why the interpreter handed control back.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    /// A service record is posted; the thread's saved state is valid.
    Suspend,
    /// The entry frame returned; the thread is finished.
    ThreadDone,
}

pub(crate) enum Step {
    Next,
    Jump(usize),
    Suspend,
    Done,
}

pub(crate) struct Engine<'vm> {
    pub vm: &'vm mut Vm,
    pub stack: ThreadStack,
    pub thread: ThreadId,
    pub method: MethodId,
    pub ip: usize,
    /// Offset of the instruction currently executing.
    pub start: usize,
    /// Offset of the following instruction.
    pub next: usize,
}

/// Run the current thread until it suspends or finishes.
pub fn run(vm: &mut Vm) -> RunExit {
    let tid = match vm.current {
        Some(t) => t,
        None => fatal!("interpreter entered from the service context"),
    };
    let (stack, method, ip, resume) = {
        let tcb = vm.tcb_mut(tid);
        let stack = match tcb.stack.take() {
            Some(s) => s,
            None => fatal!("thread {tid:?} scheduled without a stack"),
        };
        (stack, tcb.saved.method, tcb.saved.ip as usize, tcb.resume_push.take())
    };

    let mut engine = Engine {
        vm,
        stack,
        thread: tid,
        method,
        ip,
        start: ip,
        next: ip,
    };

    if let Some(value) = resume {
        engine.push_resume(value);
    }

    let exit = engine.run_loop();
    let Engine { vm, stack, .. } = engine;
    vm.tcb_mut(tid).stack = Some(stack);
    match exit {
        Step::Suspend => RunExit::Suspend,
        Step::Done => RunExit::ThreadDone,
        _ => fatal!("dispatch loop stopped without an exit condition"),
    }
}

impl<'vm> Engine<'vm> {
    fn run_loop(&mut self) -> Step {
        loop {
            self.start = self.ip;
            let d = {
                let m = self.vm.classes.method(self.method);
                decode(m.code(), self.ip, self.vm.config.little_endian)
            };
            self.next = d.next;
            self.vm.stats.instructions += 1;
            match self.execute(d) {
                Step::Next => self.ip = self.next,
                Step::Jump(target) => self.ip = target,
                stop @ (Step::Suspend | Step::Done) => return stop,
            }
        }
    }

    fn push_resume(&mut self, value: crate::scheduler::ResumeValue) {
        use crate::scheduler::ResumeValue;
        match value {
            ResumeValue::Word(v, tag) => self.stack.push(v, tag),
            ResumeValue::Long(v, tag) => self.stack.push_long(v, tag),
        }
    }

    // ---- service protocol -------------------------------------------------

    pub(crate) fn suspend(&mut self, record: ServiceRecord, resume_ip: usize) -> Step {
        self.vm.service.post(record);
        let method = self.method;
        let tcb = self.vm.tcb_mut(self.thread);
        tcb.saved = SavedFrame {
            method,
            ip: resume_ip as u32,
        };
        Step::Suspend
    }

    /// Allocate and throw a runtime exception of `class`.
    pub(crate) fn raise(&mut self, class: ClassId, detail: i32, o2: Ref) -> Step {
        let bytes = self.vm.classes.class(class).instance_bytes;
        let exc = self
            .vm
            .heap
            .allocate_object(class, bytes)
            .unwrap_or(self.vm.oome);
        self.post_throw(exc, detail, o2)
    }

    fn post_throw(&mut self, exc: Ref, detail: i32, o2: Ref) -> Step {
        if self.vm.tcb(self.thread).pending_exception != NULL_REF {
            fatal!("throw while an exception is already pending");
        }
        let mut rec = ServiceRecord::new(self.thread, ServiceOp::Throw);
        rec.o1 = exc;
        rec.o2 = o2;
        rec.i[0] = detail;
        self.suspend(rec, self.start)
    }

    fn null_check(&mut self, r: Ref) -> Result<(), Step> {
        if r == NULL_REF {
            let npe = self.vm.classes.well_known.null_pointer;
            Err(self.raise(npe, 0, NULL_REF))
        } else {
            Ok(())
        }
    }

    // ---- heap helpers -----------------------------------------------------

    /// 64-bit heap layout: low half at `addr`, high at `addr + 4`.
    fn read_heap_long(&self, addr: u32, tag: Tag) -> u64 {
        let lo = self.vm.heap.mem.read_word(addr, tag);
        let hi = self.vm.heap.mem.read_word(addr + 4, tag);
        ((hi as u64) << 32) | lo as u64
    }

    fn write_heap_long(&mut self, addr: u32, value: u64, tag: Tag) {
        self.vm.heap.mem.write_word(addr, value as u32, tag);
        self.vm.heap.mem.write_word(addr + 4, (value >> 32) as u32, tag);
    }

    // ---- class state ------------------------------------------------------

    fn class_state_missing(&mut self, class: ClassId) -> bool {
        if self.vm.class_cache.lookup(class).is_some() {
            return false;
        }
        self.vm.live_isolate().state(class).is_none()
    }

    fn statics_for(&mut self, class: ClassId) -> Result<Ref, Step> {
        if let Some(r) = self.vm.class_cache.lookup(class) {
            return Ok(r);
        }
        match self.vm.live_isolate().state(class) {
            Some(state) => {
                self.vm.class_cache.insert(class, state.statics);
                Ok(state.statics)
            }
            None => {
                let failed = self.vm.classes.well_known.clinit_failure;
                Err(self.raise(failed, class.0 as i32, NULL_REF))
            }
        }
    }

    fn install_class_state(&mut self, class: ClassId) -> Result<(), Step> {
        let words = self.vm.classes.class(class).static_words as u32;
        match self.vm.heap.allocate_object(class, words * 4) {
            Some(statics) => {
                self.vm.live_isolate_mut().install(class, statics);
                self.vm.class_cache.insert(class, statics);
                self.vm.tcb_mut(self.thread).gc_retried = false;
                Ok(())
            }
            None => Err(self.alloc_failure(class)),
        }
    }

    /// Allocation slow-path terminal: one collection attempt, then a
    /// managed out-of-memory.
    fn alloc_failure(&mut self, class: ClassId) -> Step {
        let retried = self.vm.tcb(self.thread).gc_retried;
        if retried {
            self.vm.tcb_mut(self.thread).gc_retried = false;
            let oome = self.vm.classes.well_known.out_of_memory;
            self.raise(oome, 0, NULL_REF)
        } else {
            self.vm.tcb_mut(self.thread).gc_retried = true;
            let mut rec = ServiceRecord::new(self.thread, ServiceOp::Gc);
            rec.i[1] = class.0 as i32;
            self.suspend(rec, self.start)
        }
    }

    // ---- invocation -------------------------------------------------------

    fn invoke_method(&mut self, target: MethodId, return_ip: usize) -> Step {
        if target == ABSTRACT_METHOD {
            let ame = self.vm.classes.well_known.abstract_method;
            return self.raise(ame, 0, NULL_REF);
        }
        let header = self.vm.classes.method(target).header;
        let shortfall = self.stack.shortfall_for(&header);
        if shortfall > 0 {
            self.vm.stats.extends += 1;
            let mut rec = ServiceRecord::new(self.thread, ServiceOp::Extend);
            rec.i[0] = shortfall as i32;
            return self.suspend(rec, self.start);
        }
        let count = header.param_words as usize;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            // parameters are pushed param0-last, so they pop in order
            args.push(self.stack.pop_raw());
        }
        self.stack
            .push_frame(target.0, &header, return_ip as u32, &args);
        self.method = target;
        Step::Jump(0)
    }

    fn receiver_class(&mut self) -> Result<ClassId, Step> {
        let receiver = self.stack.peek(Tag::Ref);
        self.null_check(receiver)?;
        Ok(self.vm.heap.class_of(receiver))
    }

    fn do_return(&mut self, value: ReturnValue) -> Step {
        let callee_fp = self.stack.fp;
        let callee_params = self.vm.classes.method(self.method).header.param_words;
        let (frame_method, return_ip, return_fp) = self.stack.pop_frame();
        debug_assert_eq!(frame_method, self.method.0, "frame belongs to another method");

        if return_fp == NO_FRAME {
            // entry frame: the thread is done
            match value {
                ReturnValue::One(v, _) => {
                    self.vm.tcb_mut(self.thread).exit_value = v as i32 as i64;
                }
                ReturnValue::Ref(v) => {
                    self.vm.tcb_mut(self.thread).exit_value = v as i64;
                }
                _ => {}
            }
            return Step::Done;
        }

        let caller = MethodId(self.stack.read_ix(self.stack.fp + FRAME_METHOD, Tag::Int));
        let caller_header = self.vm.classes.method(caller).header;
        self.stack
            .reseat_after_return(callee_fp, callee_params, &caller_header);

        match value {
            ReturnValue::None => {}
            ReturnValue::One(v, tag) => self.stack.push(v, tag),
            ReturnValue::Ref(v) => self.stack.push(v, Tag::Ref),
            ReturnValue::Two(under, top) => {
                self.stack.push(under.0, under.1);
                self.stack.push(top.0, top.1);
            }
        }
        self.method = caller;
        Step::Jump(return_ip as usize)
    }

    // ---- monitors ---------------------------------------------------------

    /// Move every pending entry of this thread into full monitors.
    fn promote_pending(&mut self) {
        let drained = self.vm.tcb_mut(self.thread).pending.drain();
        for obj in drained {
            match self.vm.monitors.enter(obj, self.thread) {
                Enter::Acquired => {}
                Enter::Contended => {
                    fatal!("pending monitor {obj:#x} contended during promotion")
                }
            }
        }
    }

    fn monitor_enter(&mut self, obj: Ref) -> Step {
        let fast = {
            let tcb = self.vm.tcb(self.thread);
            tcb.pending.has_room()
                && self.vm.heap.in_managed_range(obj)
                && !self.vm.monitors.is_promoted(obj)
        };
        if fast {
            self.vm.tcb_mut(self.thread).pending.push(obj);
            return Step::Next;
        }
        self.promote_pending();
        match self.vm.monitors.enter(obj, self.thread) {
            Enter::Acquired => Step::Next,
            Enter::Contended => {
                let mut rec = ServiceRecord::new(self.thread, ServiceOp::MonitorEnter);
                rec.o1 = obj;
                // the monitor is granted before the thread resumes
                self.suspend(rec, self.next)
            }
        }
    }

    fn monitor_exit(&mut self, obj: Ref) -> Step {
        if self.vm.tcb_mut(self.thread).pending.pop_if_top(obj) {
            return Step::Next;
        }
        self.promote_pending();
        match self.vm.monitors.exit(obj, self.thread) {
            crate::monitor::Exit::StillHeld => Step::Next,
            crate::monitor::Exit::Released(None) => Step::Next,
            crate::monitor::Exit::Released(Some(next)) => {
                grant_monitor(self.vm, obj, next);
                Step::Next
            }
        }
    }

    // ---- branches ---------------------------------------------------------

    fn branch(&mut self, taken: bool, offset: i64) -> Step {
        if !taken {
            return Step::Next;
        }
        self.vm.stats.branches += 1;
        let target = (self.start as i64 + offset) as usize;
        if offset < 0 {
            // backward-branch safepoint
            let tcb = self.vm.tcb_mut(self.thread);
            tcb.branch_quota -= 1;
            if tcb.branch_quota <= 0 {
                self.vm.stats.yields += 1;
                let rec = ServiceRecord::new(self.thread, ServiceOp::Yield);
                return self.suspend(rec, target);
            }
        }
        Step::Jump(target)
    }

    // ---- allocation -------------------------------------------------------

    fn new_object(&mut self, class: ClassId) -> Step {
        let def = self.vm.classes.class(class);
        let bytes = def.instance_bytes;
        let must_clinit = def.modifiers.contains(ClassModifiers::MUST_CLINIT);
        let clinit = def.clinit;

        if must_clinit && self.class_state_missing(class) {
            if let Err(step) = self.install_class_state(class) {
                return step;
            }
            if let Some(init) = clinit {
                // run the initializer, then retry this instruction
                return self.invoke_method(init, self.start);
            }
            return self.slow_allocate_object(class, bytes);
        }

        if self.vm.heap.fast_path_open() {
            if let Some(r) = self.vm.heap.allocate_object(class, bytes) {
                self.vm.stats.fast_allocs += 1;
                self.vm.tcb_mut(self.thread).gc_retried = false;
                self.stack.push(r, Tag::Ref);
                return Step::Next;
            }
        }
        self.slow_allocate_object(class, bytes)
    }

    fn slow_allocate_object(&mut self, class: ClassId, bytes: u32) -> Step {
        self.vm.stats.slow_allocs += 1;
        match self.vm.heap.allocate_object(class, bytes) {
            Some(r) => {
                self.vm.tcb_mut(self.thread).gc_retried = false;
                self.stack.push(r, Tag::Ref);
                Step::Next
            }
            None => self.alloc_failure(class),
        }
    }

    fn new_array(&mut self, class: ClassId) -> Step {
        let length = self.stack.pop(Tag::Int) as i32;
        let elem = match self.vm.classes.class(class).element {
            Some(e) => e,
            None => fatal!("newarray on non-array class {class:?}"),
        };
        if length < 0 || length as u32 > crate::object::ARRAY_MAX_LENGTH {
            let oob = self.vm.classes.well_known.index_out_of_bounds;
            return self.raise(oob, length, NULL_REF);
        }
        let length = length as u32;

        if self.vm.heap.fast_path_open() {
            if let Some(r) = self.vm.heap.allocate_array(class, length, elem.size) {
                self.vm.stats.fast_allocs += 1;
                self.vm.tcb_mut(self.thread).gc_retried = false;
                self.stack.push(r, Tag::Ref);
                return Step::Next;
            }
        }
        self.vm.stats.slow_allocs += 1;
        match self.vm.heap.allocate_array(class, length, elem.size) {
            Some(r) => {
                self.vm.tcb_mut(self.thread).gc_retried = false;
                self.stack.push(r, Tag::Ref);
                Step::Next
            }
            None => self.alloc_failure(class),
        }
    }

    // ---- array access -----------------------------------------------------

    fn array_check(&mut self, arr: Ref, index: i32) -> Result<(crate::meta::ElementKind, u32), Step> {
        self.null_check(arr)?;
        let class = self.vm.heap.class_of(arr);
        let elem = match self.vm.classes.class(class).element {
            Some(e) => e,
            None => fatal!("array access on non-array object {arr:#x}"),
        };
        let length = self.vm.heap.array_length(arr);
        if index < 0 || index as u32 >= length {
            let oob = self.vm.classes.well_known.index_out_of_bounds;
            return Err(self.raise(oob, index, arr));
        }
        Ok((elem, arr + index as u32 * elem.size))
    }

    fn array_load(&mut self) -> Step {
        let index = self.stack.pop(Tag::Int) as i32;
        let arr = self.stack.pop(Tag::Ref);
        let (elem, addr) = match self.array_check(arr, index) {
            Ok(v) => v,
            Err(step) => return step,
        };
        match elem.size {
            1 => {
                let v = self.vm.heap.mem.read_u8(addr) as i8 as i32;
                self.stack.push(v as u32, Tag::Int);
            }
            2 => {
                let v = self.vm.heap.mem.read_u16(addr) as i16 as i32;
                self.stack.push(v as u32, Tag::Int);
            }
            4 => {
                let v = self.vm.heap.mem.read_word(addr, elem.tag);
                self.stack.push(v, elem.tag);
            }
            8 => {
                let v = self.read_heap_long(addr, elem.tag);
                self.stack.push_long(v, elem.tag);
            }
            other => fatal!("array element size {other}"),
        }
        Step::Next
    }

    fn array_store(&mut self) -> Step {
        let arr = self.stack.pop(Tag::Ref);
        let index = self.stack.pop(Tag::Int) as i32;
        let (elem, addr) = match self.array_check(arr, index) {
            Ok(v) => v,
            Err(step) => return step,
        };
        match elem.size {
            1 => {
                let v = self.stack.pop(Tag::Int);
                self.vm.heap.mem.write_u8(addr, v as u8);
            }
            2 => {
                let v = self.stack.pop(Tag::Int);
                self.vm.heap.mem.write_u16(addr, v as u16);
            }
            4 => {
                let (v, _) = self.stack.pop_raw();
                if elem.tag == Tag::Ref && v != NULL_REF {
                    let value_class = self.vm.heap.class_of(v);
                    let arr_class = self.vm.heap.class_of(arr);
                    let target = self
                        .vm
                        .classes
                        .class(arr_class)
                        .element_class
                        .unwrap_or(self.vm.classes.well_known.object);
                    if !self.vm.classes.assignable(value_class, target) {
                        let ase = self.vm.classes.well_known.array_store;
                        return self.raise(ase, index, arr);
                    }
                }
                self.vm.heap.mem.write_word(addr, v, elem.tag);
            }
            8 => {
                let v = self.stack.pop_long(elem.tag);
                self.write_heap_long(addr, v, elem.tag);
            }
            other => fatal!("array element size {other}"),
        }
        Step::Next
    }

    // ---- the dispatch -----------------------------------------------------

    fn execute(&mut self, d: Decoded) -> Step {
        let imm = d.imm;
        match d.op {
            Opcode::Nop => Step::Next,

            Opcode::ConstNull => {
                self.stack.push(NULL_REF, Tag::Ref);
                Step::Next
            }
            Opcode::Const => {
                self.stack.push(imm as i32 as u32, Tag::Int);
                Step::Next
            }
            Opcode::ConstLong => {
                self.stack.push_long(imm as u64, Tag::LongHalf);
                Step::Next
            }
            Opcode::ConstFloat => {
                self.stack.push(imm as u32, Tag::FloatWord);
                Step::Next
            }
            Opcode::ConstDouble => {
                self.stack.push_long(imm as u64, Tag::DoubleHalf);
                Step::Next
            }

            Opcode::Pop => {
                let _ = self.stack.pop_raw();
                Step::Next
            }
            Opcode::Pop2 => {
                let _ = self.stack.pop_raw();
                let _ = self.stack.pop_raw();
                Step::Next
            }
            Opcode::Dup => {
                let (v, tag) = self.stack.pop_raw();
                self.stack.push(v, tag);
                self.stack.push(v, tag);
                Step::Next
            }

            Opcode::Load => self.copy_to_stack(self.stack.local_ix(imm as u32)),
            Opcode::Store => self.copy_from_stack(self.stack.local_ix(imm as u32)),
            Opcode::LoadParm => self.copy_to_stack(self.stack.param_ix(imm as u32)),
            Opcode::StoreParm => self.copy_from_stack(self.stack.param_ix(imm as u32)),
            Opcode::Load2 => {
                let i = imm as u32;
                self.copy_to_stack(self.stack.local_ix(i));
                self.copy_to_stack(self.stack.local_ix(i + 1))
            }
            Opcode::Store2 => {
                let i = imm as u32;
                self.copy_from_stack(self.stack.local_ix(i + 1));
                self.copy_from_stack(self.stack.local_ix(i))
            }
            Opcode::LoadParm2 => {
                let i = imm as u32;
                self.copy_to_stack(self.stack.param_ix(i));
                self.copy_to_stack(self.stack.param_ix(i + 1))
            }
            Opcode::StoreParm2 => {
                let i = imm as u32;
                self.copy_from_stack(self.stack.param_ix(i + 1));
                self.copy_from_stack(self.stack.param_ix(i))
            }

            Opcode::GetField => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                let addr = obj + imm as u32;
                let tag = self.vm.heap.mem.recorded_tag(addr);
                let v = self.vm.heap.mem.read_word(addr, Tag::Any);
                self.stack.push(v, tag);
                Step::Next
            }
            Opcode::PutField => {
                let (v, tag) = self.stack.pop_raw();
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                self.vm.heap.mem.write_word(obj + imm as u32, v, tag);
                Step::Next
            }
            Opcode::GetFieldB => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                let v = self.vm.heap.mem.read_u8(obj + imm as u32) as i8 as i32;
                self.stack.push(v as u32, Tag::Int);
                Step::Next
            }
            Opcode::PutFieldB => {
                let v = self.stack.pop(Tag::Int);
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                self.vm.heap.mem.write_u8(obj + imm as u32, v as u8);
                Step::Next
            }
            Opcode::GetFieldS => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                let v = self.vm.heap.mem.read_u16(obj + imm as u32) as i16 as i32;
                self.stack.push(v as u32, Tag::Int);
                Step::Next
            }
            Opcode::PutFieldS => {
                let v = self.stack.pop(Tag::Int);
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                self.vm.heap.mem.write_u16(obj + imm as u32, v as u16);
                Step::Next
            }
            Opcode::GetField2 => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                let addr = obj + imm as u32;
                let t0 = self.vm.heap.mem.recorded_tag(addr);
                let v0 = self.vm.heap.mem.read_word(addr, Tag::Any);
                let t1 = self.vm.heap.mem.recorded_tag(addr + 4);
                let v1 = self.vm.heap.mem.read_word(addr + 4, Tag::Any);
                self.stack.push(v0, t0);
                self.stack.push(v1, t1);
                Step::Next
            }
            Opcode::PutField2 => {
                let top = self.stack.pop_raw();
                let under = self.stack.pop_raw();
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                let addr = obj + imm as u32;
                self.vm.heap.mem.write_word(addr, under.0, under.1);
                self.vm.heap.mem.write_word(addr + 4, top.0, top.1);
                Step::Next
            }

            Opcode::GetStatic | Opcode::PutStatic => {
                let class = self.vm.classes.method(self.method).owner;
                self.static_access(class, imm as u32, d.op == Opcode::PutStatic)
            }
            Opcode::GetStaticC | Opcode::PutStaticC => {
                let class = ClassId((imm as u32) >> 16);
                let slot = imm as u32 & 0xFFFF;
                self.static_access(class, slot, d.op == Opcode::PutStaticC)
            }

            Opcode::ALoad => self.array_load(),
            Opcode::AStore => self.array_store(),
            Opcode::ArrayLength => {
                let arr = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(arr) {
                    return step;
                }
                let class = self.vm.heap.class_of(arr);
                if self.vm.classes.class(class).element.is_none() {
                    fatal!("arraylength on non-array object {arr:#x}");
                }
                let len = self.vm.heap.array_length(arr);
                self.stack.push(len, Tag::Int);
                Step::Next
            }

            Opcode::New => self.new_object(ClassId(imm as u32)),
            Opcode::NewArray => self.new_array(ClassId(imm as u32)),

            Opcode::CheckCast => {
                let target = ClassId(imm as u32);
                let obj = self.stack.peek(Tag::Ref);
                if obj != NULL_REF {
                    let class = self.vm.heap.class_of(obj);
                    if !self.vm.classes.assignable(class, target) {
                        let cce = self.vm.classes.well_known.class_cast;
                        return self.raise(cce, class.0 as i32, obj);
                    }
                }
                Step::Next
            }
            Opcode::InstanceOf => {
                let target = ClassId(imm as u32);
                let obj = self.stack.pop(Tag::Ref);
                let is = obj != NULL_REF
                    && self.vm.classes.assignable(self.vm.heap.class_of(obj), target);
                self.stack.push(is as u32, Tag::Int);
                Step::Next
            }

            Opcode::AddI => self.binary_int(|a, b| a.wrapping_add(b)),
            Opcode::SubI => self.binary_int(|a, b| a.wrapping_sub(b)),
            Opcode::MulI => self.binary_int(|a, b| a.wrapping_mul(b)),
            Opcode::DivI => {
                let b = self.stack.pop(Tag::Int) as i32;
                let a = self.stack.pop(Tag::Int) as i32;
                if b == 0 {
                    let arith = self.vm.classes.well_known.arithmetic;
                    return self.raise(arith, a, NULL_REF);
                }
                let q = if a == i32::MIN && b == -1 { i32::MIN } else { a / b };
                self.stack.push(q as u32, Tag::Int);
                Step::Next
            }
            Opcode::RemI => {
                let b = self.stack.pop(Tag::Int) as i32;
                let a = self.stack.pop(Tag::Int) as i32;
                if b == 0 {
                    let arith = self.vm.classes.well_known.arithmetic;
                    return self.raise(arith, a, NULL_REF);
                }
                let r = if a == i32::MIN && b == -1 { 0 } else { a % b };
                self.stack.push(r as u32, Tag::Int);
                Step::Next
            }
            Opcode::NegI => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.stack.push(a.wrapping_neg() as u32, Tag::Int);
                Step::Next
            }
            Opcode::ShlI => self.binary_int(|a, b| a.wrapping_shl(b as u32 & 31)),
            Opcode::ShrI => self.binary_int(|a, b| a.wrapping_shr(b as u32 & 31)),
            Opcode::UshrI => {
                self.binary_int(|a, b| ((a as u32).wrapping_shr(b as u32 & 31)) as i32)
            }
            Opcode::AndI => self.binary_int(|a, b| a & b),
            Opcode::OrI => self.binary_int(|a, b| a | b),
            Opcode::XorI => self.binary_int(|a, b| a ^ b),
            Opcode::I2B => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.stack.push((a as i8 as i32) as u32, Tag::Int);
                Step::Next
            }
            Opcode::I2S => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.stack.push((a as i16 as i32) as u32, Tag::Int);
                Step::Next
            }

            Opcode::Goto => self.branch(true, imm),
            Opcode::IfEqZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a == 0, imm)
            }
            Opcode::IfNeZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a != 0, imm)
            }
            Opcode::IfLtZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a < 0, imm)
            }
            Opcode::IfLeZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a <= 0, imm)
            }
            Opcode::IfGtZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a > 0, imm)
            }
            Opcode::IfGeZ => {
                let a = self.stack.pop(Tag::Int) as i32;
                self.branch(a >= 0, imm)
            }
            Opcode::IfICmpEq => self.compare_branch(imm, |a, b| a == b),
            Opcode::IfICmpNe => self.compare_branch(imm, |a, b| a != b),
            Opcode::IfICmpLt => self.compare_branch(imm, |a, b| a < b),
            Opcode::IfICmpLe => self.compare_branch(imm, |a, b| a <= b),
            Opcode::IfICmpGt => self.compare_branch(imm, |a, b| a > b),
            Opcode::IfICmpGe => self.compare_branch(imm, |a, b| a >= b),

            Opcode::InvokeStatic => {
                let class = ClassId((imm as u32) >> 16);
                let slot = (imm as u32 & 0xFFFF) as u16;
                let target = self.vm.classes.static_method(class, slot);
                self.invoke_method(target, self.next)
            }
            Opcode::InvokeVirtual => {
                let class = match self.receiver_class() {
                    Ok(c) => c,
                    Err(step) => return step,
                };
                let target = self.vm.classes.virtual_method(class, imm as u16);
                self.invoke_method(target, self.next)
            }
            Opcode::InvokeSuper => {
                let class = ClassId((imm as u32) >> 16);
                let slot = (imm as u32 & 0xFFFF) as u16;
                let receiver = self.stack.peek(Tag::Ref);
                if let Err(step) = self.null_check(receiver) {
                    return step;
                }
                // explicit class: dynamic dispatch bypassed
                let target = self.vm.classes.virtual_method(class, slot);
                self.invoke_method(target, self.next)
            }
            Opcode::InvokeSlot => {
                let interface = crate::meta::InterfaceId((imm as u32) >> 16);
                let index = (imm as u32 & 0xFFFF) as u16;
                let class = match self.receiver_class() {
                    Ok(c) => c,
                    Err(step) => return step,
                };
                let slot = match self.vm.classes.interface_slot(class, interface, index) {
                    Some(s) => s,
                    None => {
                        let ame = self.vm.classes.well_known.abstract_method;
                        return self.raise(ame, index as i32, NULL_REF);
                    }
                };
                let target = self.vm.classes.virtual_method(class, slot);
                self.invoke_method(target, self.next)
            }
            Opcode::InvokeNative => crate::natives::dispatch(self, imm as u16),

            Opcode::Return => self.do_return(ReturnValue::None),
            Opcode::ReturnI => {
                let (v, tag) = self.stack.pop_raw();
                self.do_return(ReturnValue::One(v, tag))
            }
            Opcode::ReturnR => {
                let v = self.stack.pop(Tag::Ref);
                self.do_return(ReturnValue::Ref(v))
            }
            Opcode::ReturnL => {
                let top = self.stack.pop_raw();
                let under = self.stack.pop_raw();
                self.do_return(ReturnValue::Two(under, top))
            }

            Opcode::Throw => {
                let exc = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(exc) {
                    return step;
                }
                self.post_throw(exc, 0, NULL_REF)
            }
            Opcode::Catch => {
                let exc = self.vm.tcb(self.thread).pending_exception;
                if exc == NULL_REF {
                    fatal!("catch without a pending exception");
                }
                self.vm.tcb_mut(self.thread).pending_exception = NULL_REF;
                self.stack.push(exc, Tag::Ref);
                Step::Next
            }

            Opcode::MonitorEnter => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                self.monitor_enter(obj)
            }
            Opcode::MonitorExit => {
                let obj = self.stack.pop(Tag::Ref);
                if let Err(step) = self.null_check(obj) {
                    return step;
                }
                self.monitor_exit(obj)
            }

            Opcode::ClassClinit => {
                let class = ClassId(imm as u32);
                let def = self.vm.classes.class(class);
                let must = def.modifiers.contains(ClassModifiers::MUST_CLINIT);
                let clinit = def.clinit;
                if !must || !self.class_state_missing(class) {
                    return Step::Next;
                }
                if let Err(step) = self.install_class_state(class) {
                    return step;
                }
                match clinit {
                    Some(init) => self.invoke_method(init, self.next),
                    None => Step::Next,
                }
            }
        }
    }

    fn static_access(&mut self, class: ClassId, slot: u32, store: bool) -> Step {
        let statics = match self.statics_for(class) {
            Ok(r) => r,
            Err(step) => return step,
        };
        let addr = statics + slot * 4;
        if store {
            let (v, tag) = self.stack.pop_raw();
            self.vm.heap.mem.write_word(addr, v, tag);
        } else {
            let tag = self.vm.heap.mem.recorded_tag(addr);
            let v = self.vm.heap.mem.read_word(addr, Tag::Any);
            self.stack.push(v, tag);
        }
        Step::Next
    }

    fn copy_to_stack(&mut self, src: u32) -> Step {
        let tag = self.stack.tag_at(src);
        let v = self.stack.read_ix(src, Tag::Any);
        self.stack.push(v, tag);
        Step::Next
    }

    fn copy_from_stack(&mut self, dst: u32) -> Step {
        let (v, tag) = self.stack.pop_raw();
        self.stack.write_ix(dst, v, tag);
        Step::Next
    }

    fn binary_int(&mut self, f: impl Fn(i32, i32) -> i32) -> Step {
        let b = self.stack.pop(Tag::Int) as i32;
        let a = self.stack.pop(Tag::Int) as i32;
        self.stack.push(f(a, b) as u32, Tag::Int);
        Step::Next
    }

    fn compare_branch(&mut self, offset: i64, f: impl Fn(i32, i32) -> bool) -> Step {
        let b = self.stack.pop(Tag::Int) as i32;
        let a = self.stack.pop(Tag::Int) as i32;
        self.branch(f(a, b), offset)
    }
}

#[derive(Copy, Clone)]
enum ReturnValue {
    None,
    One(u32, Tag),
    Ref(u32),
    Two((u32, Tag), (u32, Tag)),
}
