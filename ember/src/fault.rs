//! Fatal-error funnel.
//!
//! Fatal conditions (tag mismatch, stack invariant violation, lock
//! discipline violation, unreachable opcodes) indicate a corrupted
//! bytecode stream or a runtime bug. They are never recovered: the
//! diagnostic is logged and the process dies. Application-level faults
//! go through the managed exception protocol instead, see
//! `interp::raise`.

macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;
