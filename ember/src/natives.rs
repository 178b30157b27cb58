//! The native-call opcode space.
//!
//! A dense integer enumeration dispatched through one switch:
//! arithmetic on the 64-bit and float abstractions, raw memory
//! accessors, host-call trampolines of arity 0-6 and 10, and the
//! runtime services. Unknown values trap as an undefined native
//! method, never as undefined behavior.

use crate::fault::fatal;
use crate::interp::{Engine, Step};
use crate::meta::MethodId;
use crate::object::NULL_REF;
use crate::scheduler::{self, ThreadState};
use crate::service::{ServiceOp, ServiceRecord};
use crate::softfloat;
use crate::tags::Tag;

/// Host function callable through the trampolines.
pub type HostFn = fn(&[u32]) -> HostValue;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostValue {
    Void,
    Word(u32),
    Long(u64),
}

macro_rules! native_ops {
    ($($name:ident = $value:expr,)*) => {
        #[repr(u16)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum NativeOp {
            $($name = $value,)*
        }

        impl NativeOp {
            pub fn from_raw(raw: u16) -> Option<NativeOp> {
                match raw {
                    $($value => Some(NativeOp::$name),)*
                    _ => None,
                }
            }
        }
    };
}

native_ops! {
    // arithmetic on abstractions
    LongAdd = 0,
    LongSub = 1,
    LongMul = 2,
    LongDiv = 3,
    LongRem = 4,
    LongNeg = 5,
    LongShl = 6,
    LongShr = 7,
    LongUshr = 8,
    LongAnd = 9,
    LongOr = 10,
    LongXor = 11,
    LongCmp = 12,
    FloatAdd = 13,
    FloatSub = 14,
    FloatMul = 15,
    FloatDiv = 16,
    FloatRem = 17,
    FloatNeg = 18,
    FloatCmpL = 19,
    FloatCmpG = 20,
    DoubleAdd = 21,
    DoubleSub = 22,
    DoubleMul = 23,
    DoubleDiv = 24,
    DoubleRem = 25,
    DoubleNeg = 26,
    DoubleCmpL = 27,
    DoubleCmpG = 28,
    I2L = 29,
    L2I = 30,
    I2F = 31,
    F2I = 32,
    I2D = 33,
    D2I = 34,
    L2F = 35,
    F2L = 36,
    L2D = 37,
    D2L = 38,
    F2D = 39,
    D2F = 40,
    // raw memory accessors
    PeekByte = 41,
    PokeByte = 42,
    PeekShort = 43,
    PokeShort = 44,
    PeekInt = 45,
    PokeInt = 46,
    // host-call trampolines
    Call0 = 47,
    Call1 = 48,
    Call2 = 49,
    Call3 = 50,
    Call4 = 51,
    Call5 = 52,
    Call6 = 53,
    Call10 = 54,
    // runtime services
    YieldNow = 55,
    Sleep = 56,
    CurrentThread = 57,
    SpawnThread = 58,
    JoinThread = 59,
    MonitorWait = 60,
    MonitorNotify = 61,
    MonitorNotifyAll = 62,
    RequestGc = 63,
    ChannelRequest = 64,
}

pub(crate) fn dispatch(e: &mut Engine<'_>, raw: u16) -> Step {
    let op = match NativeOp::from_raw(raw) {
        Some(op) => op,
        None => {
            // undefined native method trap
            let undefined = e.vm.classes.well_known.undefined_native;
            return e.raise(undefined, raw as i32, NULL_REF);
        }
    };
    match op {
        NativeOp::LongAdd => binary_long(e, |a, b| a.wrapping_add(b)),
        NativeOp::LongSub => binary_long(e, |a, b| a.wrapping_sub(b)),
        NativeOp::LongMul => binary_long(e, |a, b| a.wrapping_mul(b)),
        NativeOp::LongDiv => {
            let b = e.stack.pop_long(Tag::LongHalf) as i64;
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            if b == 0 {
                let arith = e.vm.classes.well_known.arithmetic;
                return e.raise(arith, 0, NULL_REF);
            }
            let q = if a == i64::MIN && b == -1 { i64::MIN } else { a / b };
            e.stack.push_long(q as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::LongRem => {
            let b = e.stack.pop_long(Tag::LongHalf) as i64;
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            if b == 0 {
                let arith = e.vm.classes.well_known.arithmetic;
                return e.raise(arith, 0, NULL_REF);
            }
            let r = if a == i64::MIN && b == -1 { 0 } else { a % b };
            e.stack.push_long(r as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::LongNeg => {
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            e.stack.push_long(a.wrapping_neg() as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::LongShl => shift_long(e, |a, s| a.wrapping_shl(s)),
        NativeOp::LongShr => shift_long(e, |a, s| a.wrapping_shr(s)),
        NativeOp::LongUshr => shift_long(e, |a, s| ((a as u64).wrapping_shr(s)) as i64),
        NativeOp::LongAnd => binary_long(e, |a, b| a & b),
        NativeOp::LongOr => binary_long(e, |a, b| a | b),
        NativeOp::LongXor => binary_long(e, |a, b| a ^ b),
        NativeOp::LongCmp => {
            let b = e.stack.pop_long(Tag::LongHalf) as i64;
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            e.stack.push(a.cmp(&b) as i32 as u32, Tag::Int);
            Step::Next
        }

        NativeOp::FloatAdd => binary_float(e, softfloat::float_add),
        NativeOp::FloatSub => binary_float(e, softfloat::float_sub),
        NativeOp::FloatMul => binary_float(e, softfloat::float_mul),
        NativeOp::FloatDiv => binary_float(e, softfloat::float_div),
        NativeOp::FloatRem => binary_float(e, softfloat::float_rem),
        NativeOp::FloatNeg => {
            let a = e.stack.pop(Tag::FloatWord);
            e.stack.push(softfloat::float_neg(a), Tag::FloatWord);
            Step::Next
        }
        NativeOp::FloatCmpL => float_compare(e, -1),
        NativeOp::FloatCmpG => float_compare(e, 1),

        NativeOp::DoubleAdd => binary_double(e, softfloat::double_add),
        NativeOp::DoubleSub => binary_double(e, softfloat::double_sub),
        NativeOp::DoubleMul => binary_double(e, softfloat::double_mul),
        NativeOp::DoubleDiv => binary_double(e, softfloat::double_div),
        NativeOp::DoubleRem => binary_double(e, softfloat::double_rem),
        NativeOp::DoubleNeg => {
            let a = e.stack.pop_long(Tag::DoubleHalf);
            e.stack.push_long(softfloat::double_neg(a), Tag::DoubleHalf);
            Step::Next
        }
        NativeOp::DoubleCmpL => double_compare(e, -1),
        NativeOp::DoubleCmpG => double_compare(e, 1),

        NativeOp::I2L => {
            let a = e.stack.pop(Tag::Int) as i32;
            e.stack.push_long(a as i64 as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::L2I => {
            let a = e.stack.pop_long(Tag::LongHalf);
            e.stack.push(a as u32, Tag::Int);
            Step::Next
        }
        NativeOp::I2F => {
            let a = e.stack.pop(Tag::Int) as i32;
            e.stack.push(softfloat::int_to_float(a), Tag::FloatWord);
            Step::Next
        }
        NativeOp::F2I => {
            let a = e.stack.pop(Tag::FloatWord);
            e.stack.push(softfloat::float_to_int(a) as u32, Tag::Int);
            Step::Next
        }
        NativeOp::I2D => {
            let a = e.stack.pop(Tag::Int) as i32;
            e.stack.push_long(softfloat::int_to_double(a), Tag::DoubleHalf);
            Step::Next
        }
        NativeOp::D2I => {
            let a = e.stack.pop_long(Tag::DoubleHalf);
            e.stack.push(softfloat::double_to_int(a) as u32, Tag::Int);
            Step::Next
        }
        NativeOp::L2F => {
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            e.stack.push(softfloat::long_to_float(a), Tag::FloatWord);
            Step::Next
        }
        NativeOp::F2L => {
            let a = e.stack.pop(Tag::FloatWord);
            e.stack.push_long(softfloat::float_to_long(a) as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::L2D => {
            let a = e.stack.pop_long(Tag::LongHalf) as i64;
            e.stack.push_long(softfloat::long_to_double(a), Tag::DoubleHalf);
            Step::Next
        }
        NativeOp::D2L => {
            let a = e.stack.pop_long(Tag::DoubleHalf);
            e.stack.push_long(softfloat::double_to_long(a) as u64, Tag::LongHalf);
            Step::Next
        }
        NativeOp::F2D => {
            let a = e.stack.pop(Tag::FloatWord);
            e.stack.push_long(softfloat::float_to_double(a), Tag::DoubleHalf);
            Step::Next
        }
        NativeOp::D2F => {
            let a = e.stack.pop_long(Tag::DoubleHalf);
            e.stack.push(softfloat::double_to_float(a), Tag::FloatWord);
            Step::Next
        }

        NativeOp::PeekByte => {
            let addr = e.stack.pop(Tag::Int);
            let v = e.vm.heap.mem.read_raw_u8(addr) as i8 as i32;
            e.stack.push(v as u32, Tag::Int);
            Step::Next
        }
        NativeOp::PokeByte => {
            let v = e.stack.pop(Tag::Int);
            let addr = e.stack.pop(Tag::Int);
            e.vm.heap.mem.write_raw_u8(addr, v as u8);
            Step::Next
        }
        NativeOp::PeekShort => {
            let addr = e.stack.pop(Tag::Int);
            let v = compose_raw(e, addr, 2) as i16 as i32;
            e.stack.push(v as u32, Tag::Int);
            Step::Next
        }
        NativeOp::PokeShort => {
            let v = e.stack.pop(Tag::Int);
            let addr = e.stack.pop(Tag::Int);
            scatter_raw(e, addr, 2, v);
            Step::Next
        }
        NativeOp::PeekInt => {
            let addr = e.stack.pop(Tag::Int);
            let v = compose_raw(e, addr, 4);
            e.stack.push(v, Tag::Int);
            Step::Next
        }
        NativeOp::PokeInt => {
            let v = e.stack.pop(Tag::Int);
            let addr = e.stack.pop(Tag::Int);
            scatter_raw(e, addr, 4, v);
            Step::Next
        }

        NativeOp::Call0 => trampoline(e, 0),
        NativeOp::Call1 => trampoline(e, 1),
        NativeOp::Call2 => trampoline(e, 2),
        NativeOp::Call3 => trampoline(e, 3),
        NativeOp::Call4 => trampoline(e, 4),
        NativeOp::Call5 => trampoline(e, 5),
        NativeOp::Call6 => trampoline(e, 6),
        NativeOp::Call10 => trampoline(e, 10),

        NativeOp::YieldNow => {
            e.vm.stats.yields += 1;
            let rec = ServiceRecord::new(e.thread, ServiceOp::Yield);
            let resume = e.next;
            e.suspend(rec, resume)
        }
        NativeOp::Sleep => {
            let millis = e.stack.pop_long(Tag::LongHalf);
            let mut rec = ServiceRecord::new(e.thread, ServiceOp::Sleep);
            rec.i[0] = (millis >> 32) as i32;
            rec.i[1] = millis as i32;
            let resume = e.next;
            e.suspend(rec, resume)
        }
        NativeOp::CurrentThread => {
            e.stack.push(e.thread.0, Tag::Int);
            Step::Next
        }
        NativeOp::SpawnThread => {
            let raw = e.stack.pop(Tag::Int);
            if raw as usize >= e.vm.classes.method_count() {
                fatal!("spawn of unknown method id {raw}");
            }
            let isolate = e.vm.tcb(e.thread).isolate;
            let tid = scheduler::spawn_thread(e.vm, MethodId(raw), isolate);
            e.stack.push(tid.0, Tag::Int);
            Step::Next
        }
        NativeOp::JoinThread => {
            let target = e.stack.pop(Tag::Int);
            if target as usize >= e.vm.threads.len() {
                fatal!("join of unknown thread id {target}");
            }
            if e.vm.threads[target as usize].state == ThreadState::Dead {
                return Step::Next;
            }
            let mut rec = ServiceRecord::new(e.thread, ServiceOp::Join);
            rec.i[0] = target as i32;
            let resume = e.next;
            e.suspend(rec, resume)
        }
        NativeOp::MonitorWait => {
            let millis = e.stack.pop_long(Tag::LongHalf);
            let obj = e.stack.pop(Tag::Ref);
            let owned = e
                .vm
                .monitors
                .state(obj)
                .map(|s| s.owner == Some(e.thread))
                .unwrap_or(false)
                || e.vm.tcb(e.thread).pending.contains(obj);
            if !owned {
                fatal!("wait on monitor {obj:#x} not owned by {:?}", e.thread);
            }
            let mut rec = ServiceRecord::new(e.thread, ServiceOp::MonitorWait);
            rec.o1 = obj;
            rec.i[0] = (millis >> 32) as i32;
            rec.i[1] = millis as i32;
            let resume = e.next;
            e.suspend(rec, resume)
        }
        NativeOp::MonitorNotify => notify(e, false),
        NativeOp::MonitorNotifyAll => notify(e, true),
        NativeOp::RequestGc => {
            let mut rec = ServiceRecord::new(e.thread, ServiceOp::Gc);
            rec.i[0] = 1;
            let resume = e.next;
            e.suspend(rec, resume)
        }
        NativeOp::ChannelRequest => {
            let channel = e.stack.pop(Tag::Int);
            let i1 = e.stack.pop(Tag::Int) as i32;
            let i2 = e.stack.pop(Tag::Int) as i32;
            let o1 = e.stack.pop(Tag::Ref);
            let mut rec = ServiceRecord::new(e.thread, ServiceOp::Channel);
            rec.channel = channel;
            rec.i[0] = i1;
            rec.i[1] = i2;
            rec.o1 = o1;
            let resume = e.next;
            e.suspend(rec, resume)
        }
    }
}

fn binary_long(e: &mut Engine<'_>, f: impl Fn(i64, i64) -> i64) -> Step {
    let b = e.stack.pop_long(Tag::LongHalf) as i64;
    let a = e.stack.pop_long(Tag::LongHalf) as i64;
    e.stack.push_long(f(a, b) as u64, Tag::LongHalf);
    Step::Next
}

fn shift_long(e: &mut Engine<'_>, f: impl Fn(i64, u32) -> i64) -> Step {
    let s = e.stack.pop(Tag::Int) & 63;
    let a = e.stack.pop_long(Tag::LongHalf) as i64;
    e.stack.push_long(f(a, s) as u64, Tag::LongHalf);
    Step::Next
}

fn binary_float(e: &mut Engine<'_>, f: impl Fn(u32, u32) -> u32) -> Step {
    let b = e.stack.pop(Tag::FloatWord);
    let a = e.stack.pop(Tag::FloatWord);
    e.stack.push(f(a, b), Tag::FloatWord);
    Step::Next
}

fn binary_double(e: &mut Engine<'_>, f: impl Fn(u64, u64) -> u64) -> Step {
    let b = e.stack.pop_long(Tag::DoubleHalf);
    let a = e.stack.pop_long(Tag::DoubleHalf);
    e.stack.push_long(f(a, b), Tag::DoubleHalf);
    Step::Next
}

fn float_compare(e: &mut Engine<'_>, nan: i32) -> Step {
    let b = e.stack.pop(Tag::FloatWord);
    let a = e.stack.pop(Tag::FloatWord);
    e.stack.push(softfloat::float_cmp(a, b, nan) as u32, Tag::Int);
    Step::Next
}

fn double_compare(e: &mut Engine<'_>, nan: i32) -> Step {
    let b = e.stack.pop_long(Tag::DoubleHalf);
    let a = e.stack.pop_long(Tag::DoubleHalf);
    e.stack.push(softfloat::double_cmp(a, b, nan) as u32, Tag::Int);
    Step::Next
}

fn compose_raw(e: &Engine<'_>, addr: u32, len: u32) -> u32 {
    let mem = &e.vm.heap.mem;
    let mut v = 0u32;
    for i in 0..len {
        let byte = mem.read_raw_u8(addr + i) as u32;
        if mem.is_little_endian() {
            v |= byte << (8 * i);
        } else {
            v = (v << 8) | byte;
        }
    }
    v
}

fn scatter_raw(e: &mut Engine<'_>, addr: u32, len: u32, value: u32) {
    let little = e.vm.heap.mem.is_little_endian();
    for i in 0..len {
        let shift = if little { 8 * i } else { 8 * (len - 1 - i) };
        e.vm.heap.mem.write_raw_u8(addr + i, (value >> shift) as u8);
    }
}

fn trampoline(e: &mut Engine<'_>, arity: usize) -> Step {
    let index = e.stack.pop(Tag::Int) as usize;
    let mut args = vec![0u32; arity];
    for slot in (0..arity).rev() {
        args[slot] = e.stack.pop(Tag::Any);
    }
    let host = match e.vm.host_calls.get(index) {
        Some(&f) => f,
        None => {
            let undefined = e.vm.classes.well_known.undefined_native;
            return e.raise(undefined, index as i32, NULL_REF);
        }
    };
    match host(&args) {
        HostValue::Void => {}
        HostValue::Word(v) => e.stack.push(v, Tag::Int),
        HostValue::Long(v) => e.stack.push_long(v, Tag::LongHalf),
    }
    Step::Next
}

fn notify(e: &mut Engine<'_>, all: bool) -> Step {
    let obj = e.stack.pop(Tag::Ref);
    let owned = e
        .vm
        .monitors
        .state(obj)
        .map(|s| s.owner == Some(e.thread))
        .unwrap_or(false)
        || e.vm.tcb(e.thread).pending.contains(obj);
    if !owned {
        fatal!("notify on monitor {obj:#x} not owned by {:?}", e.thread);
    }
    scheduler::notify_waiters(e.vm, obj, all);
    Step::Next
}
