mod asm;
mod bridge;
mod fault;
mod heap;
mod interp;
mod isolate;
mod memory;
mod meta;
mod monitor;
mod natives;
mod object;
mod opcode;
mod scheduler;
mod service;
mod softfloat;
mod stack;
mod tags;
mod vm;

pub use asm::*;
pub use bridge::*;
pub use heap::*;
pub use interp::RunExit;
pub use isolate::*;
pub use memory::*;
pub use meta::*;
pub use monitor::*;
pub use natives::{HostFn, HostValue, NativeOp};
pub use object::*;
pub use opcode::*;
pub use scheduler::{ResumeValue, SavedFrame, Tcb, ThreadId, ThreadState, kill_thread, spawn_thread};
pub use service::*;
pub use softfloat::*;
pub use stack::*;
pub use tags::*;
pub use vm::*;
