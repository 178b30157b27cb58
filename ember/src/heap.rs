//! Managed heap: a typed-memory region with a bump allocation window.
//!
//! The engine only allocates; reclamation belongs to the collector,
//! which is a collaborator consumed through [`Collector`]. Allocation
//! first bumps inside the current window and falls back to the rest of
//! the region before reporting failure.

use crate::fault::fatal;
use crate::memory::{MemoryConfig, TypedMemory};
use crate::object::{
    ARRAY_HEADER_BYTES, ARRAY_MAX_LENGTH, ClassId, HEADER_BYTES, HeaderWord, NULL_REF, Ref,
};
use crate::tags::Tag;

/// Words below which allocation never reaches, so that 0 stays null.
const BASE_GUARD: u32 = 8;

/// Contract the engine requires from the collector: given the heap
/// with its current allocation pointer, reclaim space. `true` means
/// the allocation that triggered the call is worth retrying.
pub trait Collector {
    fn collect(&mut self, heap: &mut Heap, force_full: bool) -> bool;
}

/// Collector stub for configurations without reclamation.
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn collect(&mut self, _heap: &mut Heap, _force_full: bool) -> bool {
        false
    }
}

pub struct Heap {
    pub mem: TypedMemory,
    start: u32,
    alloc_ptr: u32,
    window_end: u32,
    end: u32,
    /// Fast-path gate: bump allocation is only legal while set.
    pub allocation_enabled: bool,
    /// A full collection has been requested; everything slow-paths.
    pub gc_forced: bool,
    /// Allocation tracing is observing; everything slow-paths.
    pub tracing: bool,
}

impl Heap {
    pub fn new(size: u32, window: u32, config: &MemoryConfig) -> Self {
        let size = size & !3;
        if size <= BASE_GUARD {
            fatal!("heap size {size} too small");
        }
        let window_end = (BASE_GUARD + window.min(size - BASE_GUARD)) & !3;
        Self {
            mem: TypedMemory::new(size, config),
            start: BASE_GUARD,
            alloc_ptr: BASE_GUARD,
            window_end,
            end: size,
            allocation_enabled: true,
            gc_forced: false,
            tracing: false,
        }
    }

    #[inline]
    pub fn in_managed_range(&self, r: Ref) -> bool {
        r >= self.start && r < self.end
    }

    #[inline]
    pub fn alloc_ptr(&self) -> u32 {
        self.alloc_ptr
    }

    /// Collector hand-back: new allocation pointer after compaction.
    pub fn reset_alloc_ptr(&mut self, ptr: u32) {
        if ptr < self.start || ptr > self.end {
            fatal!("collector returned allocation pointer {ptr:#x} outside heap");
        }
        self.alloc_ptr = ptr;
        self.window_end = self.end;
    }

    pub fn used_bytes(&self) -> u32 {
        self.alloc_ptr - self.start
    }

    /// All three fast-path conditions hold.
    #[inline]
    pub fn fast_path_open(&self) -> bool {
        self.allocation_enabled && !self.gc_forced && !self.tracing
    }

    /// Bump-allocate a zeroed, wildcard-tagged block. `None` when
    /// neither the window nor the remaining heap has room.
    pub fn allocate_block(&mut self, bytes: u32) -> Option<u32> {
        let bytes = (bytes + 3) & !3;
        let fits = |limit: u32, at: u32| (limit - at) >= bytes && at.checked_add(bytes).is_some();
        if !fits(self.window_end, self.alloc_ptr) {
            if fits(self.end, self.alloc_ptr) {
                log::debug!(
                    "allocation window exhausted at {:#x}, widening to heap end",
                    self.window_end
                );
                self.window_end = self.end;
            } else {
                return None;
            }
        }
        let at = self.alloc_ptr;
        self.alloc_ptr += bytes;
        self.mem.zero(at, bytes);
        Some(at)
    }

    /// Allocate an instance body of `body_bytes` with a class header.
    pub fn allocate_object(&mut self, class: ClassId, body_bytes: u32) -> Option<Ref> {
        let block = self.allocate_block(HEADER_BYTES + body_bytes)?;
        let r = block + HEADER_BYTES;
        self.mem
            .write_word(block, HeaderWord::Class(class).encode(), Tag::Any);
        Some(r)
    }

    /// Allocate an array; `None` for space failure. Oversized or
    /// negative lengths are the caller's (managed-exception) problem.
    pub fn allocate_array(&mut self, class: ClassId, length: u32, elem_size: u32) -> Option<Ref> {
        debug_assert!(length <= ARRAY_MAX_LENGTH);
        let body = length.checked_mul(elem_size)?;
        let block = self.allocate_block(ARRAY_HEADER_BYTES + body)?;
        let r = block + ARRAY_HEADER_BYTES;
        self.mem.write_word(block, length, Tag::Any);
        self.mem.write_word(
            block + 4,
            HeaderWord::Class(class).encode(),
            Tag::Any,
        );
        Some(r)
    }

    pub fn header(&self, r: Ref) -> HeaderWord {
        if r == NULL_REF || !self.in_managed_range(r) {
            fatal!("header read on non-heap ref {r:#x}");
        }
        HeaderWord::decode(self.mem.read_word(r - HEADER_BYTES, Tag::Any))
    }

    /// Class of a live object.
    pub fn class_of(&self, r: Ref) -> ClassId {
        match self.header(r) {
            HeaderWord::Class(id) => id,
            other => fatal!("object {r:#x} has non-class header {other:?}"),
        }
    }

    pub fn array_length(&self, r: Ref) -> u32 {
        self.mem.read_word(r - ARRAY_HEADER_BYTES, Tag::Any)
    }
}
