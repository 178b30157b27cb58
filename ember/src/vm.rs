//! Runtime assembly: heap, metadata, isolates, threads, bridge.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;

use crate::bridge::{Interrupter, NativeMonitor, TaskExecutor, WakeToken};
use crate::fault::fatal;
use crate::heap::{Collector, Heap, NoopCollector};
use crate::isolate::{ClassStateCache, Isolate, IsolateId};
use crate::memory::MemoryConfig;
use crate::meta::{ClassTable, MethodId};
use crate::monitor::MonitorTable;
use crate::natives::HostFn;
use crate::object::Ref;
use crate::scheduler::{self, Tcb, ThreadId};
use crate::service::{ServiceRecord, ServiceSlot};

/// Blocking channel work executed on a bridge thread.
pub trait ChannelHandler: Send + Sync {
    fn handle(&self, request: &ServiceRecord) -> i64;
}

pub struct PendingIo {
    pub thread: ThreadId,
    pub exec: TaskExecutor,
}

#[derive(Debug, Default)]
pub struct VmStats {
    pub instructions: u64,
    pub branches: u64,
    pub yields: u64,
    pub switches: u64,
    pub extends: u64,
    pub collections: u64,
    pub fast_allocs: u64,
    pub slow_allocs: u64,
}

#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub heap_bytes: u32,
    pub heap_window: u32,
    pub stack_words: u32,
    pub yield_quota: i32,
    pub config: MemoryConfig,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            heap_bytes: 256 * 1024,
            heap_window: 64 * 1024,
            stack_words: 256,
            yield_quota: 1000,
            config: MemoryConfig::default(),
        }
    }
}

pub struct Vm {
    pub config: MemoryConfig,
    pub heap: Heap,
    pub classes: ClassTable,
    pub isolates: Vec<Isolate>,
    pub current_isolate: IsolateId,
    pub class_cache: ClassStateCache,
    pub monitors: MonitorTable,
    pub threads: Vec<Tcb>,
    pub run_queue: VecDeque<ThreadId>,
    pub current: Option<ThreadId>,
    pub service: ServiceSlot,
    pub collector: Box<dyn Collector>,
    pub bridge: Arc<NativeMonitor>,
    pub waker: Arc<WakeToken>,
    pub pending_io: Vec<PendingIo>,
    pub channels: AHashMap<u32, Arc<dyn ChannelHandler>>,
    pub host_calls: Vec<HostFn>,
    pub stats: VmStats,
    pub default_stack_words: u32,
    pub yield_quota: i32,
    /// Preallocated out-of-memory error, thrown when the heap cannot
    /// even allocate the exception itself.
    pub oome: Ref,
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> Self {
        let classes = ClassTable::new();
        let mut heap = Heap::new(info.heap_bytes, info.heap_window, &info.config);
        let oome_class = classes.well_known.out_of_memory;
        let oome_bytes = classes.class(oome_class).instance_bytes;
        let oome = match heap.allocate_object(oome_class, oome_bytes) {
            Some(r) => r,
            None => fatal!("heap too small for the bootstrap image"),
        };

        Self {
            config: info.config,
            heap,
            classes,
            isolates: vec![Isolate::new(IsolateId(0))],
            current_isolate: IsolateId(0),
            class_cache: ClassStateCache::new(),
            monitors: MonitorTable::new(),
            threads: Vec::new(),
            run_queue: VecDeque::new(),
            current: None,
            service: ServiceSlot::new(),
            collector: Box::new(NoopCollector),
            bridge: Arc::new(NativeMonitor::new()),
            waker: Arc::new(WakeToken::new()),
            pending_io: Vec::new(),
            channels: AHashMap::new(),
            host_calls: Vec::new(),
            stats: VmStats::default(),
            default_stack_words: info.stack_words,
            yield_quota: info.yield_quota,
            oome,
        }
    }

    #[inline]
    pub fn tcb(&self, id: ThreadId) -> &Tcb {
        &self.threads[id.0 as usize]
    }

    #[inline]
    pub fn tcb_mut(&mut self, id: ThreadId) -> &mut Tcb {
        &mut self.threads[id.0 as usize]
    }

    pub fn live_isolate(&self) -> &Isolate {
        &self.isolates[self.current_isolate.0 as usize]
    }

    pub fn live_isolate_mut(&mut self) -> &mut Isolate {
        let id = self.current_isolate.0 as usize;
        &mut self.isolates[id]
    }

    pub fn new_isolate(&mut self) -> IsolateId {
        let id = IsolateId(self.isolates.len() as u32);
        self.isolates.push(Isolate::new(id));
        id
    }

    /// Handle for waking an idle scheduler from another native
    /// thread (event sources, signal handlers).
    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(Arc::clone(&self.bridge), Arc::clone(&self.waker))
    }

    pub fn register_channel(&mut self, id: u32, handler: Arc<dyn ChannelHandler>) {
        self.channels.insert(id, handler);
    }

    pub fn register_host_call(&mut self, f: HostFn) -> u32 {
        self.host_calls.push(f);
        (self.host_calls.len() - 1) as u32
    }

    /// Start a managed thread on `entry` in the primary isolate.
    pub fn start(&mut self, entry: MethodId) -> ThreadId {
        scheduler::spawn_thread(self, entry, IsolateId(0))
    }

    /// Run until every managed thread is finished.
    pub fn run(&mut self) {
        scheduler::run(self);
    }

    pub fn exit_value(&self, thread: ThreadId) -> i64 {
        self.tcb(thread).exit_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Asm;
    use crate::meta::{ClassDef, ClassModifiers, ElementKind, InterfaceId, InterfaceMap, MethodHeader};
    use crate::tags::Tag;
    use crate::natives::NativeOp;
    use crate::object::ClassId;
    use crate::opcode::Opcode;
    use crate::scheduler::ThreadState;
    use std::time::Instant;

    fn vm() -> Vm {
        Vm::new(VmCreateInfo::default())
    }

    fn run_entry(vm: &mut Vm, entry: MethodId) -> i64 {
        let tid = vm.start(entry);
        vm.run();
        assert_eq!(vm.tcb(tid).state, ThreadState::Dead);
        vm.exit_value(tid)
    }

    fn plain_class(vm: &mut Vm, name: &str, bytes: u32) -> ClassId {
        vm.classes.add_class(ClassDef::plain(name, bytes))
    }

    #[test]
    fn int_subtract_leaves_two() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_int(5);
        a.const_int(3);
        a.op(Opcode::SubI);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 2);
    }

    #[test]
    fn long_add_crosses_the_word_boundary() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_long(0x1_0000_0000);
        a.const_long(1);
        a.native(NativeOp::LongAdd);
        a.const_long(0x1_0000_0001);
        a.native(NativeOp::LongCmp);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 0, "sum must equal 0x1_0000_0001");
    }

    #[test]
    fn float_arithmetic_through_the_native_switch() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_float(1.5);
        a.const_float(2.25);
        a.native(NativeOp::FloatAdd);
        a.const_float(3.75);
        a.native(NativeOp::FloatCmpL);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 0);
    }

    #[test]
    fn division_by_zero_takes_the_exception_path() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let arith = vm.classes.well_known.arithmetic;
        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.const_int(10);
        a.const_int(0);
        a.op(Opcode::DivI);
        a.bind(to);
        a.op(Opcode::Pop);
        a.const_int(-1);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, arith);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 1, "handler must receive control");
    }

    #[test]
    fn min_int_divided_by_minus_one_does_not_trap() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_int(i32::MIN);
        a.const_int(-1);
        a.op(Opcode::DivI);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry) as i32, i32::MIN);

        let mut vm = Vm::new(VmCreateInfo::default());
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_int(i32::MIN);
        a.const_int(-1);
        a.op(Opcode::RemI);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 0);
    }

    #[test]
    fn static_call_balances_the_stack() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);

        // callee(a, b) = a - b
        let mut callee = Asm::new(true);
        callee.op_u8(Opcode::LoadParm, 0);
        callee.op_u8(Opcode::LoadParm, 1);
        callee.op(Opcode::SubI);
        callee.op(Opcode::ReturnI);
        let callee = vm.classes.add_method(callee.build(owner, 2, 0, 4));
        vm.classes.class_mut(owner).static_methods.push(callee);

        // marker stays under the call; a balanced call leaves it intact
        let mut a = Asm::new(true);
        a.const_int(100);
        a.const_int(3); // param1
        a.const_int(8); // param0 on top
        a.invoke_static(owner, 0);
        a.op(Opcode::AddI); // 100 + (8 - 3)
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 105);
    }

    #[test]
    fn void_and_long_returns_balance_too() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);

        let mut void_m = Asm::new(true);
        void_m.const_int(9);
        void_m.op(Opcode::Pop);
        void_m.op(Opcode::Return);
        let void_m = vm.classes.add_method(void_m.build(owner, 0, 0, 4));

        let mut long_m = Asm::new(true);
        long_m.const_long(0x0000_0007_0000_0009);
        long_m.op(Opcode::ReturnL);
        let long_m = vm.classes.add_method(long_m.build(owner, 0, 0, 4));

        let mut ref_m = Asm::new(true);
        ref_m.op(Opcode::ConstNull);
        ref_m.op(Opcode::ReturnR);
        let ref_m = vm.classes.add_method(ref_m.build(owner, 0, 0, 4));

        let statics = &mut vm.classes.class_mut(owner).static_methods;
        statics.push(void_m); // slot 0
        statics.push(long_m); // slot 1
        statics.push(ref_m); // slot 2

        let mut a = Asm::new(true);
        a.const_int(50);
        a.invoke_static(owner, 0);
        a.invoke_static(owner, 1);
        a.const_long(0x0000_0007_0000_0009);
        a.native(NativeOp::LongCmp);
        a.invoke_static(owner, 2);
        a.op(Opcode::Pop); // drop the null ref
        a.op(Opcode::AddI);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 50);
    }

    #[test]
    fn virtual_dispatch_uses_the_receiver_class() {
        let mut vm = vm();
        let base = plain_class(&mut vm, "Base", 4);

        let mut base_m = Asm::new(true);
        base_m.const_int(1);
        base_m.op(Opcode::ReturnI);
        let base_m = vm.classes.add_method(base_m.build(base, 1, 0, 4));

        let mut derived = ClassDef::plain("Derived", 4);
        derived.super_class = Some(base);
        let derived = vm.classes.add_class(derived);
        let mut derived_m = Asm::new(true);
        derived_m.const_int(2);
        derived_m.op(Opcode::ReturnI);
        let derived_m = vm.classes.add_method(derived_m.build(derived, 1, 0, 4));

        vm.classes.class_mut(base).vtable.push(base_m);
        vm.classes.class_mut(derived).vtable.push(derived_m);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, derived.0 as u8);
        a.invoke_virtual(0); // receiver is param0 on top
        a.op_u8(Opcode::New, base.0 as u8);
        a.invoke_virtual(0);
        a.op(Opcode::AddI); // 2 + 1
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(base, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 3);
    }

    #[test]
    fn super_send_bypasses_dynamic_dispatch() {
        let mut vm = vm();
        let base = plain_class(&mut vm, "Base", 4);
        let mut base_m = Asm::new(true);
        base_m.const_int(7);
        base_m.op(Opcode::ReturnI);
        let base_m = vm.classes.add_method(base_m.build(base, 1, 0, 4));
        vm.classes.class_mut(base).vtable.push(base_m);

        let mut derived = ClassDef::plain("Derived", 4);
        derived.super_class = Some(base);
        let derived = vm.classes.add_class(derived);
        let mut derived_m = Asm::new(true);
        derived_m.const_int(9);
        derived_m.op(Opcode::ReturnI);
        let derived_m = vm.classes.add_method(derived_m.build(derived, 1, 0, 4));
        vm.classes.class_mut(derived).vtable.push(derived_m);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, derived.0 as u8);
        a.invoke_super(base, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(base, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 7);
    }

    #[test]
    fn interface_call_resolves_through_the_slot_map() {
        let mut vm = vm();
        let iface = InterfaceId(4);
        let cls = plain_class(&mut vm, "Impl", 4);

        let mut m0 = Asm::new(true);
        m0.const_int(11);
        m0.op(Opcode::ReturnI);
        let m0 = vm.classes.add_method(m0.build(cls, 1, 0, 4));
        let mut m1 = Asm::new(true);
        m1.const_int(22);
        m1.op(Opcode::ReturnI);
        let m1 = vm.classes.add_method(m1.build(cls, 1, 0, 4));

        {
            let def = vm.classes.class_mut(cls);
            def.vtable.push(m0);
            def.vtable.push(m1);
            def.interfaces.push(InterfaceMap {
                interface: iface,
                slots: vec![1, 0], // interface method 0 -> vtable slot 1
            });
        }

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, cls.0 as u8);
        a.invoke_slot(iface, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 22);
    }

    #[test]
    fn pending_monitor_round_trip_and_reverse_order() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let obj = plain_class(&mut vm, "Lock", 0);

        let mut a = Asm::new(true);
        // two distinct objects in locals, entered then exited in reverse
        a.op_u8(Opcode::New, obj.0 as u8);
        a.op_u8(Opcode::Store, 0);
        a.op_u8(Opcode::New, obj.0 as u8);
        a.op_u8(Opcode::Store, 1);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::MonitorEnter);
        a.op_u8(Opcode::Load, 1);
        a.op(Opcode::MonitorEnter);
        a.op_u8(Opcode::Load, 1);
        a.op(Opcode::MonitorExit);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::MonitorExit);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 2, 4));
        let tid = vm.start(entry);
        vm.run();
        assert_eq!(vm.exit_value(tid), 1);
        assert!(
            vm.tcb(tid).pending.is_empty(),
            "pending cache must return to its initial depth"
        );
        assert!(vm.monitors.owned_by(tid).is_none(), "nothing promoted");
    }

    #[test]
    fn clinit_gates_the_allocation_fast_path() {
        let mut vm = vm();
        let mut def = ClassDef::plain("Lazy", 8);
        def.modifiers = ClassModifiers::MUST_CLINIT;
        def.static_words = 1;
        let lazy = vm.classes.add_class(def);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, lazy.0 as u8);
        a.op(Opcode::Pop);
        a.op_u8(Opcode::New, lazy.0 as u8);
        a.op(Opcode::Pop);
        a.op(Opcode::Return);
        let entry = vm.classes.add_method(a.build(lazy, 0, 0, 4));
        run_entry(&mut vm, entry);

        assert_eq!(
            vm.stats.slow_allocs, 1,
            "first new with missing class state must take the slow path"
        );
        assert_eq!(
            vm.stats.fast_allocs, 1,
            "second new with installed state must bump-allocate"
        );
        assert!(
            vm.live_isolate().state(lazy).is_some(),
            "class state installed by the slow path"
        );
    }

    #[test]
    fn clinit_method_runs_before_the_retried_new() {
        let mut vm = vm();
        let mut def = ClassDef::plain("WithInit", 4);
        def.modifiers = ClassModifiers::MUST_CLINIT;
        def.static_words = 1;
        let cls = vm.classes.add_class(def);

        let mut init = Asm::new(true);
        init.const_int(77);
        init.op_u8(Opcode::PutStatic, 0);
        init.op(Opcode::Return);
        let init = vm.classes.add_method(init.build(cls, 0, 0, 4));
        vm.classes.class_mut(cls).clinit = Some(init);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, cls.0 as u8);
        a.op(Opcode::Pop);
        a.op_u8(Opcode::GetStatic, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 77);
    }

    #[test]
    fn class_clinit_opcode_initializes_once() {
        let mut vm = vm();
        let mut def = ClassDef::plain("Counted", 4);
        def.modifiers = ClassModifiers::MUST_CLINIT;
        def.static_words = 1;
        let cls = vm.classes.add_class(def);

        // clinit increments its own static slot
        let mut init = Asm::new(true);
        init.op_u8(Opcode::GetStatic, 0);
        init.const_int(1);
        init.op(Opcode::AddI);
        init.op_u8(Opcode::PutStatic, 0);
        init.op(Opcode::Return);
        let init = vm.classes.add_method(init.build(cls, 0, 0, 4));
        vm.classes.class_mut(cls).clinit = Some(init);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::ClassClinit, cls.0 as u8);
        a.op_u8(Opcode::ClassClinit, cls.0 as u8);
        a.op_u8(Opcode::GetStatic, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 1, "initializer must run exactly once");
    }

    #[test]
    fn uninitialized_static_access_is_a_managed_exception() {
        let mut vm = vm();
        let mut def = ClassDef::plain("Cold", 4);
        def.modifiers = ClassModifiers::MUST_CLINIT;
        def.static_words = 1;
        let cls = vm.classes.add_class(def);
        let failure = vm.classes.well_known.clinit_failure;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.op_u8(Opcode::GetStatic, 0);
        a.bind(to);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(-7);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, failure);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), -7);
    }

    #[test]
    fn stack_extension_retries_the_call() {
        let mut vm = Vm::new(VmCreateInfo {
            stack_words: 48,
            ..VmCreateInfo::default()
        });
        let owner = plain_class(&mut vm, "Main", 0);

        // a callee whose frame cannot fit the initial stack
        let mut big = Asm::new(true);
        big.const_int(5);
        big.op(Opcode::ReturnI);
        let header = MethodHeader {
            param_words: 0,
            local_words: 40,
            stack_words: 64,
            clear_words: 40,
        };
        let big = vm.classes.add_method(big.build_with_header(owner, header));
        vm.classes.class_mut(owner).static_methods.push(big);

        let mut a = Asm::new(true);
        a.invoke_static(owner, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 5);
        assert_eq!(vm.stats.extends, 1, "exactly one extension record");
    }

    #[test]
    fn arrays_bounds_and_store_checks() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let int_array = vm.classes.well_known.int_array;
        let oob = vm.classes.well_known.index_out_of_bounds;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        // arr = new int[3]; arr[2] = 41; x = arr[2] + arr.length; arr[3] -> oob
        a.const_int(3);
        a.op_u8(Opcode::NewArray, int_array.0 as u8);
        a.op_u8(Opcode::Store, 0);
        a.const_int(41);
        a.const_int(2);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::AStore);
        a.op_u8(Opcode::Load, 0);
        a.const_int(2);
        a.op(Opcode::ALoad);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::ArrayLength);
        a.op(Opcode::AddI);
        a.op_u8(Opcode::Store, 1);
        a.bind(from);
        a.op_u8(Opcode::Load, 0);
        a.const_int(3);
        a.op(Opcode::ALoad);
        a.bind(to);
        a.op(Opcode::Pop);
        a.const_int(-1);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.op_u8(Opcode::Load, 1);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, oob);
        let entry = vm.classes.add_method(a.build(owner, 0, 2, 8));
        assert_eq!(run_entry(&mut vm, entry), 44, "41 + length 3 after catching oob");
    }

    #[test]
    fn ref_array_store_violation_is_managed() {
        let mut vm = vm();
        let base = plain_class(&mut vm, "Base", 4);
        let other = plain_class(&mut vm, "Other", 4);
        let mut arr_def = ClassDef::array("Base[]", ElementKind { size: 4, tag: Tag::Ref });
        arr_def.element_class = Some(base);
        let arr_cls = vm.classes.add_class(arr_def);
        let ase = vm.classes.well_known.array_store;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.const_int(2);
        a.op_u8(Opcode::NewArray, arr_cls.0 as u8);
        a.op_u8(Opcode::Store, 0);
        // a Base store is fine
        a.op_u8(Opcode::New, base.0 as u8);
        a.const_int(0);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::AStore);
        a.bind(from);
        // an unrelated class is not
        a.op_u8(Opcode::New, other.0 as u8);
        a.const_int(1);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::AStore);
        a.bind(to);
        a.const_int(-1);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, ase);
        let entry = vm.classes.add_method(a.build(base, 0, 1, 8));
        assert_eq!(run_entry(&mut vm, entry), 1);
    }

    #[test]
    fn null_dereference_is_a_managed_exception() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let npe = vm.classes.well_known.null_pointer;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.op(Opcode::ConstNull);
        a.op_u8(Opcode::GetField, 0);
        a.bind(to);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(13);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, npe);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 13);
    }

    #[test]
    fn fields_roundtrip_with_tags() {
        let mut vm = vm();
        let holder = plain_class(&mut vm, "Holder", 16);

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, holder.0 as u8);
        a.op_u8(Opcode::Store, 0);
        a.op_u8(Opcode::Load, 0);
        a.const_int(123);
        a.op_u8(Opcode::PutField, 0);
        a.op_u8(Opcode::Load, 0);
        a.const_int(-5);
        a.op_u8(Opcode::PutFieldB, 4);
        a.op_u8(Opcode::Load, 0);
        a.const_long(0xDEAD_BEEF_CAFE);
        a.op_u8(Opcode::PutField2, 8);
        a.op_u8(Opcode::Load, 0);
        a.op_u8(Opcode::GetField, 0);
        a.op_u8(Opcode::Load, 0);
        a.op_u8(Opcode::GetFieldB, 4);
        a.op(Opcode::AddI); // 123 + (-5)
        a.op_u8(Opcode::Load, 0);
        a.op_u8(Opcode::GetField2, 8);
        a.const_long(0xDEAD_BEEF_CAFE);
        a.native(NativeOp::LongCmp); // 0
        a.op(Opcode::AddI);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(holder, 0, 1, 8));
        assert_eq!(run_entry(&mut vm, entry), 118);
    }

    #[test]
    fn checkcast_failure_is_managed() {
        let mut vm = vm();
        let a_cls = plain_class(&mut vm, "A", 4);
        let b_cls = plain_class(&mut vm, "B", 4);
        let cce = vm.classes.well_known.class_cast;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.op_u8(Opcode::New, a_cls.0 as u8);
        a.op_u8(Opcode::CheckCast, b_cls.0 as u8);
        a.bind(to);
        a.op(Opcode::Pop);
        a.const_int(0);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, cce);
        let entry = vm.classes.add_method(a.build(a_cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 1);
    }

    #[test]
    fn backward_branches_yield_at_the_quota() {
        let mut vm = Vm::new(VmCreateInfo {
            yield_quota: 10,
            ..VmCreateInfo::default()
        });
        let owner = plain_class(&mut vm, "Main", 0);

        // sum 1..=100 with a backward branch per iteration
        let mut a = Asm::new(true);
        a.const_int(0); // sum
        a.op_u8(Opcode::Store, 0);
        a.const_int(100); // i
        a.op_u8(Opcode::Store, 1);
        let top = a.label();
        a.bind(top);
        a.op_u8(Opcode::Load, 0);
        a.op_u8(Opcode::Load, 1);
        a.op(Opcode::AddI);
        a.op_u8(Opcode::Store, 0);
        a.op_u8(Opcode::Load, 1);
        a.const_int(1);
        a.op(Opcode::SubI);
        a.op_u8(Opcode::Store, 1);
        a.op_u8(Opcode::Load, 1);
        a.jump(Opcode::IfGtZ, top);
        a.op_u8(Opcode::Load, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 2, 8));
        assert_eq!(run_entry(&mut vm, entry), 5050);
        assert!(vm.stats.yields >= 9, "quota of 10 over 99 backward branches");
    }

    #[test]
    fn spawn_join_and_cross_thread_statics() {
        let mut vm = vm();
        let mut def = ClassDef::plain("Shared", 4);
        def.static_words = 1;
        def.modifiers = ClassModifiers::MUST_CLINIT;
        let cls = vm.classes.add_class(def);

        let mut worker = Asm::new(true);
        worker.const_int(42);
        worker.op_u8(Opcode::PutStatic, 0);
        worker.op(Opcode::Return);
        let worker = vm.classes.add_method(worker.build(cls, 0, 0, 4));

        let mut a = Asm::new(true);
        a.op_u8(Opcode::ClassClinit, cls.0 as u8);
        a.const_int(worker.0 as i32);
        a.native(NativeOp::SpawnThread);
        a.native(NativeOp::JoinThread);
        a.op_u8(Opcode::GetStatic, 0);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 42);
        assert_eq!(vm.threads.len(), 2);
    }

    #[test]
    fn sleep_parks_on_the_timer_queue() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_long(40);
        a.native(NativeOp::Sleep);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        let started = Instant::now();
        assert_eq!(run_entry(&mut vm, entry), 1);
        assert!(
            started.elapsed().as_millis() >= 35,
            "sleep must actually park the thread"
        );
    }

    #[test]
    fn wait_notify_across_threads() {
        let mut vm = vm();
        let mut def = ClassDef::plain("Cell", 4);
        def.static_words = 2; // slot 0: lock object, slot 1: flag
        def.modifiers = ClassModifiers::MUST_CLINIT;
        let cls = vm.classes.add_class(def);
        let lock_cls = plain_class(&mut vm, "Lock", 0);

        // notifier: enter, set flag, notify, exit
        let mut n = Asm::new(true);
        n.op_u8(Opcode::GetStatic, 0);
        n.op(Opcode::MonitorEnter);
        n.const_int(1);
        n.op_u8(Opcode::PutStatic, 1);
        n.op_u8(Opcode::GetStatic, 0);
        n.native(NativeOp::MonitorNotify);
        n.op_u8(Opcode::GetStatic, 0);
        n.op(Opcode::MonitorExit);
        n.op(Opcode::Return);
        let notifier = vm.classes.add_method(n.build(cls, 0, 0, 4));

        // main: install lock, enter, spawn notifier, wait, read flag
        let mut a = Asm::new(true);
        a.op_u8(Opcode::ClassClinit, cls.0 as u8);
        a.op_u8(Opcode::New, lock_cls.0 as u8);
        a.op_u8(Opcode::PutStatic, 0);
        a.op_u8(Opcode::GetStatic, 0);
        a.op(Opcode::MonitorEnter);
        a.const_int(notifier.0 as i32);
        a.native(NativeOp::SpawnThread);
        a.op(Opcode::Pop);
        a.op_u8(Opcode::GetStatic, 0);
        a.const_long(0); // forever
        a.native(NativeOp::MonitorWait);
        a.op_u8(Opcode::GetStatic, 0);
        a.op(Opcode::MonitorExit);
        a.op_u8(Opcode::GetStatic, 1);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(cls, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 1, "waiter must observe the flag");
    }

    struct SumChannel;
    impl ChannelHandler for SumChannel {
        fn handle(&self, request: &ServiceRecord) -> i64 {
            (request.i[0] + request.i[1]) as i64
        }
    }

    #[test]
    fn channel_request_round_trips_through_a_native_thread() {
        let mut vm = vm();
        vm.register_channel(9, Arc::new(SumChannel));
        let owner = plain_class(&mut vm, "Main", 0);

        let mut a = Asm::new(true);
        a.op(Opcode::ConstNull); // o1
        a.const_int(30); // i2
        a.const_int(12); // i1
        a.const_int(9); // channel
        a.native(NativeOp::ChannelRequest);
        a.const_long(42);
        a.native(NativeOp::LongCmp);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 8));
        assert_eq!(run_entry(&mut vm, entry), 0, "channel result must be 42");
    }

    #[test]
    fn host_trampolines_marshal_arguments() {
        fn mul(args: &[u32]) -> crate::natives::HostValue {
            crate::natives::HostValue::Word(args[0].wrapping_mul(args[1]))
        }
        let mut vm = vm();
        let idx = vm.register_host_call(mul);
        let owner = plain_class(&mut vm, "Main", 0);

        let mut a = Asm::new(true);
        a.const_int(6);
        a.const_int(7);
        a.const_int(idx as i32);
        a.native(NativeOp::Call2);
        a.op(Opcode::ReturnI);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 42);
    }

    #[test]
    fn unknown_native_opcode_traps_as_managed_error() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let undefined = vm.classes.well_known.undefined_native;

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.op_u8(Opcode::InvokeNative, 200);
        a.bind(to);
        a.const_int(0);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op(Opcode::Pop);
        a.const_int(1);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, undefined);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(run_entry(&mut vm, entry), 1);
    }

    #[test]
    fn explicit_throw_reaches_a_caller_frame_handler() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let npe_cls = vm.classes.well_known.null_pointer;

        // callee throws a fresh NullPointerException instance
        let mut callee = Asm::new(true);
        callee.op_u8(Opcode::New, npe_cls.0 as u8);
        callee.op(Opcode::Throw);
        callee.op(Opcode::Return);
        let callee = vm.classes.add_method(callee.build(owner, 0, 0, 4));
        vm.classes.class_mut(owner).static_methods.push(callee);

        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.invoke_static(owner, 0);
        a.bind(to);
        a.const_int(0);
        a.op(Opcode::ReturnI);
        a.bind(catch);
        a.op(Opcode::Catch);
        a.op_u8(Opcode::InstanceOf, npe_cls.0 as u8);
        a.op(Opcode::ReturnI);
        a.handler(from, to, catch, npe_cls);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        assert_eq!(
            run_entry(&mut vm, entry),
            1,
            "caught object must be the thrown instance"
        );
    }

    #[test]
    fn unhandled_exception_kills_only_its_thread() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let npe_cls = vm.classes.well_known.null_pointer;

        let mut a = Asm::new(true);
        a.op_u8(Opcode::New, npe_cls.0 as u8);
        a.op(Opcode::Throw);
        a.op(Opcode::Return);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        let tid = vm.start(entry);
        vm.run();
        assert_eq!(vm.tcb(tid).state, ThreadState::Dead);
        assert_eq!(vm.exit_value(tid), -1);
    }

    #[test]
    #[should_panic(expected = "already pending")]
    fn second_throw_while_pending_is_fatal() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let npe_cls = vm.classes.well_known.null_pointer;

        // the handler throws again without catching first
        let mut a = Asm::new(true);
        let from = a.label();
        let to = a.label();
        let catch = a.label();
        a.bind(from);
        a.op_u8(Opcode::New, npe_cls.0 as u8);
        a.op(Opcode::Throw);
        a.bind(to);
        a.op(Opcode::Return);
        a.bind(catch);
        // no Catch opcode: the pending exception is still set
        a.op_u8(Opcode::New, npe_cls.0 as u8);
        a.op(Opcode::Throw);
        a.op(Opcode::Return);
        a.handler(from, to, catch, vm.classes.well_known.object);
        let entry = vm.classes.add_method(a.build(owner, 0, 0, 4));
        let _ = vm.start(entry);
        vm.run();
    }

    #[test]
    fn cancellation_lands_at_a_safepoint() {
        let mut vm = vm();
        let owner = plain_class(&mut vm, "Main", 0);
        let mut a = Asm::new(true);
        a.const_long(60_000); // would park for a minute
        a.native(NativeOp::Sleep);
        a.op(Opcode::Return);
        let sleeper = vm.classes.add_method(a.build(owner, 0, 0, 4));

        let tid = vm.start(sleeper);
        scheduler::kill_thread(&mut vm, tid);
        let started = Instant::now();
        vm.run();
        assert_eq!(vm.tcb(tid).state, ThreadState::Dead);
        assert!(
            started.elapsed().as_millis() < 1000,
            "killed thread must not serve its sleep"
        );
    }

    #[test]
    fn isolates_do_not_share_class_state() {
        let mut vm = vm();
        let mut def = ClassDef::plain("PerIsolate", 4);
        def.static_words = 1;
        def.modifiers = ClassModifiers::MUST_CLINIT;
        let cls = vm.classes.add_class(def);

        // writer: initialize + set static to 5
        let mut w = Asm::new(true);
        w.op_u8(Opcode::ClassClinit, cls.0 as u8);
        w.const_int(5);
        w.op_u8(Opcode::PutStatic, 0);
        w.op(Opcode::Return);
        let writer = vm.classes.add_method(w.build(cls, 0, 0, 4));

        let iso2 = vm.new_isolate();
        let t1 = scheduler::spawn_thread(&mut vm, writer, IsolateId(0));
        let t2 = scheduler::spawn_thread(&mut vm, writer, iso2);
        vm.run();
        assert_eq!(vm.tcb(t1).state, ThreadState::Dead);
        assert_eq!(vm.tcb(t2).state, ThreadState::Dead);

        let s1 = vm.isolates[0].state(cls).expect("isolate 0 state");
        let s2 = vm.isolates[iso2.0 as usize].state(cls).expect("isolate 2 state");
        assert_ne!(s1.statics, s2.statics, "each isolate owns its statics");
    }
}
