//! Minimal bytecode assembler.
//!
//! Test and driver convenience: emits the smallest prefix form for
//! immediates, fixed-width (wide-half) branches so labels can be
//! patched, and packs the two-part immediates of the invoke and
//! static-access families.
//!
//! Operand conventions of the instruction set:
//! - calls: parameters are pushed so that param0 (the receiver for
//!   virtual calls) ends up on top of the stack;
//! - `aload` pops index then array; `astore` pops array, index, value;
//! - `putfield` pops value then object.

use crate::fault::fatal;
use crate::meta::{HandlerEntry, InterfaceId, MethodDef, MethodHeader};
use crate::object::ClassId;
use crate::opcode::{ESCAPE, ESCAPE_DELTA, Opcode, WIDE_FULL, WIDE_HALF};

#[derive(Debug, Copy, Clone)]
pub struct Label(usize);

pub struct Asm {
    code: Vec<u8>,
    little_endian: bool,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<(Label, Label, Label, ClassId)>,
}

struct Fixup {
    imm_at: usize,
    instr_start: usize,
    label: usize,
}

impl Asm {
    pub fn new(little_endian: bool) -> Self {
        Self {
            code: Vec::new(),
            little_endian,
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn emit_opcode(&mut self, op: Opcode) {
        let raw = op as u16;
        if raw >= ESCAPE_DELTA {
            self.code.push(ESCAPE);
            self.code.push((raw - ESCAPE_DELTA) as u8);
        } else {
            self.code.push(raw as u8);
        }
    }

    fn emit_bytes(&mut self, value: u64, len: usize) {
        for i in 0..len {
            let shift = if self.little_endian {
                8 * i
            } else {
                8 * (len - 1 - i)
            };
            self.code.push((value >> shift) as u8);
        }
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit_opcode(op);
        self
    }

    pub fn op_u8(&mut self, op: Opcode, imm: u8) -> &mut Self {
        self.emit_opcode(op);
        self.code.push(imm);
        self
    }

    pub fn op_half(&mut self, op: Opcode, imm: u16) -> &mut Self {
        self.code.push(WIDE_HALF);
        self.emit_opcode(op);
        self.emit_bytes(imm as u64, 2);
        self
    }

    pub fn op_full(&mut self, op: Opcode, imm: u32) -> &mut Self {
        self.code.push(WIDE_FULL);
        self.emit_opcode(op);
        self.emit_bytes(imm as u64, 4);
        self
    }

    /// Push an int constant in the smallest encoding.
    pub fn const_int(&mut self, value: i32) -> &mut Self {
        if (-128..=127).contains(&value) {
            self.emit_opcode(Opcode::Const);
            self.code.push(value as i8 as u8);
        } else if (-32768..=32767).contains(&value) {
            self.op_half(Opcode::Const, value as i16 as u16);
        } else {
            self.op_full(Opcode::Const, value as u32);
        }
        self
    }

    pub fn const_long(&mut self, value: u64) -> &mut Self {
        self.emit_opcode(Opcode::ConstLong);
        self.emit_bytes(value, 8);
        self
    }

    pub fn const_float(&mut self, value: f32) -> &mut Self {
        self.emit_opcode(Opcode::ConstFloat);
        self.emit_bytes(value.to_bits() as u64, 4);
        self
    }

    pub fn const_double(&mut self, value: f64) -> &mut Self {
        self.emit_opcode(Opcode::ConstDouble);
        self.emit_bytes(value.to_bits(), 8);
        self
    }

    /// Branch with a label; encoded wide-half for fixed size.
    pub fn jump(&mut self, op: Opcode, target: Label) -> &mut Self {
        let start = self.code.len();
        self.code.push(WIDE_HALF);
        self.emit_opcode(op);
        self.fixups.push(Fixup {
            imm_at: self.code.len(),
            instr_start: start,
            label: target.0,
        });
        self.emit_bytes(0, 2);
        self
    }

    pub fn invoke_static(&mut self, class: ClassId, slot: u16) -> &mut Self {
        self.op_full(Opcode::InvokeStatic, (class.0 << 16) | slot as u32)
    }

    pub fn invoke_virtual(&mut self, slot: u16) -> &mut Self {
        self.op_u8(Opcode::InvokeVirtual, slot as u8)
    }

    pub fn invoke_super(&mut self, class: ClassId, slot: u16) -> &mut Self {
        self.op_full(Opcode::InvokeSuper, (class.0 << 16) | slot as u32)
    }

    pub fn invoke_slot(&mut self, interface: InterfaceId, index: u16) -> &mut Self {
        self.op_full(Opcode::InvokeSlot, (interface.0 << 16) | index as u32)
    }

    pub fn native(&mut self, op: crate::natives::NativeOp) -> &mut Self {
        self.op_u8(Opcode::InvokeNative, op as u16 as u8)
    }

    pub fn get_static_c(&mut self, class: ClassId, slot: u16) -> &mut Self {
        self.op_full(Opcode::GetStaticC, (class.0 << 16) | slot as u32)
    }

    pub fn put_static_c(&mut self, class: ClassId, slot: u16) -> &mut Self {
        self.op_full(Opcode::PutStaticC, (class.0 << 16) | slot as u32)
    }

    /// Register an exception handler over [from, to) targeting `at`.
    pub fn handler(&mut self, from: Label, to: Label, at: Label, class: ClassId) {
        self.handlers.push((from, to, at, class));
    }

    pub fn build(self, owner: ClassId, params: u16, locals: u16, stack: u16) -> MethodDef {
        let header = MethodHeader {
            param_words: params,
            local_words: locals,
            stack_words: stack,
            clear_words: locals,
        };
        self.build_with_header(owner, header)
    }

    pub fn build_with_header(mut self, owner: ClassId, header: MethodHeader) -> MethodDef {
        let resolve = |labels: &[Option<usize>], l: Label| match labels[l.0] {
            Some(at) => at,
            None => fatal!("unbound label in assembler"),
        };
        for fix in &self.fixups {
            let target = match self.labels[fix.label] {
                Some(at) => at,
                None => fatal!("unbound branch label"),
            };
            let offset = target as i64 - fix.instr_start as i64;
            let raw = offset as i16 as u16;
            let bytes = if self.little_endian {
                raw.to_le_bytes()
            } else {
                raw.to_be_bytes()
            };
            self.code[fix.imm_at] = bytes[0];
            self.code[fix.imm_at + 1] = bytes[1];
        }
        let mut def = MethodDef::new(owner, header, self.code.clone());
        for (from, to, at, class) in &self.handlers {
            def.handlers.push(HandlerEntry {
                start: resolve(&self.labels, *from) as u32,
                end: resolve(&self.labels, *to) as u32,
                target: resolve(&self.labels, *at) as u32,
                class: *class,
            });
        }
        def
    }
}
