//! Host-side class and method metadata.
//!
//! The loader/translator is a collaborator, not part of this runtime:
//! it hands over ready-made tables which the engine only indexes. The
//! one piece of encoded data the engine still decodes itself is the
//! method header, which exists in a compact form for small methods and
//! an extended form for large ones.

use bitflags::bitflags;

use crate::fault::fatal;
use crate::object::ClassId;
use crate::tags::Tag;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// Vtable slot sentinel for methods without an implementation.
pub const ABSTRACT_METHOD: MethodId = MethodId(u32::MAX);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ClassModifiers: u16 {
        /// Static initializer must run before first use.
        const MUST_CLINIT = 1 << 0;
        const ARRAY = 1 << 1;
        const INTERFACE = 1 << 2;
    }
}

/// Element geometry of an array class.
#[derive(Debug, Copy, Clone)]
pub struct ElementKind {
    pub size: u32,
    pub tag: Tag,
}

/// Per-interface slot remapping: entry `i` is the vtable slot
/// implementing the interface's method `i`.
#[derive(Debug, Clone)]
pub struct InterfaceMap {
    pub interface: InterfaceId,
    pub slots: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub modifiers: ClassModifiers,
    /// Body size of an instance in bytes (word multiple).
    pub instance_bytes: u32,
    /// Number of static slots in this class's per-isolate state.
    pub static_words: u16,
    pub vtable: Vec<MethodId>,
    pub static_methods: Vec<MethodId>,
    pub interfaces: Vec<InterfaceMap>,
    pub element: Option<ElementKind>,
    /// Component class of a reference array, for store checks.
    pub element_class: Option<ClassId>,
    pub clinit: Option<MethodId>,
}

impl ClassDef {
    pub fn plain(name: &str, instance_bytes: u32) -> Self {
        Self {
            name: name.to_string(),
            super_class: None,
            modifiers: ClassModifiers::empty(),
            instance_bytes,
            static_words: 0,
            vtable: Vec::new(),
            static_methods: Vec::new(),
            interfaces: Vec::new(),
            element: None,
            element_class: None,
            clinit: None,
        }
    }

    pub fn array(name: &str, element: ElementKind) -> Self {
        let mut def = Self::plain(name, 0);
        def.modifiers = ClassModifiers::ARRAY;
        def.element = Some(element);
        def
    }

    pub fn is_subclass_of(&self, table: &ClassTable, ancestor: ClassId) -> bool {
        let mut cur = self.super_class;
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = table.class(id).super_class;
        }
        false
    }
}

/// Parameter/local/stack geometry of a method, decoded from the head
/// of its bytecode stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    pub param_words: u16,
    pub local_words: u16,
    pub stack_words: u16,
    /// Local slots that must be zeroed on entry; the rest are
    /// written before use or covered by parameters.
    pub clear_words: u16,
}

const EXTENDED_MARKER: u8 = 0x80;

impl MethodHeader {
    /// Decode a compact (2-byte) or extended (9-byte) header.
    /// Returns the header and the offset of the first instruction.
    pub fn decode(stream: &[u8]) -> (MethodHeader, usize) {
        if stream.is_empty() {
            fatal!("empty method stream");
        }
        if stream[0] & EXTENDED_MARKER == 0 {
            let params = (stream[0] >> 4) as u16;
            let locals = (stream[0] & 0x0F) as u16;
            let stack = stream[1] as u16;
            (
                MethodHeader {
                    param_words: params,
                    local_words: locals,
                    stack_words: stack,
                    clear_words: locals,
                },
                2,
            )
        } else {
            if stream.len() < 9 {
                fatal!("truncated extended method header");
            }
            let field = |i: usize| u16::from_le_bytes([stream[i], stream[i + 1]]);
            (
                MethodHeader {
                    param_words: field(1),
                    local_words: field(3),
                    stack_words: field(5),
                    clear_words: field(7),
                },
                9,
            )
        }
    }

    /// Encode in the smallest form that fits.
    pub fn encode(&self) -> Vec<u8> {
        let compact = self.param_words < 8
            && self.local_words < 16
            && self.stack_words < 256
            && self.clear_words == self.local_words;
        if compact {
            vec![
                ((self.param_words as u8) << 4) | self.local_words as u8,
                self.stack_words as u8,
            ]
        } else {
            let mut out = vec![EXTENDED_MARKER];
            for v in [
                self.param_words,
                self.local_words,
                self.stack_words,
                self.clear_words,
            ] {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out
        }
    }
}

/// One entry of a method's exception table (collaborator data used by
/// handler resolution).
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub class: ClassId,
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub owner: ClassId,
    pub header: MethodHeader,
    /// Full stream: encoded header followed by instructions.
    pub stream: Vec<u8>,
    /// Offset of the first instruction within `stream`.
    pub code_start: usize,
    pub handlers: Vec<HandlerEntry>,
}

impl MethodDef {
    pub fn new(owner: ClassId, header: MethodHeader, code: Vec<u8>) -> Self {
        let mut stream = header.encode();
        let code_start = stream.len();
        stream.extend_from_slice(&code);
        Self {
            owner,
            header,
            stream,
            code_start,
            handlers: Vec::new(),
        }
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.stream[self.code_start..]
    }
}

/// Well-known bootstrap classes the engine raises and allocates.
#[derive(Debug, Copy, Clone)]
pub struct WellKnown {
    pub object: ClassId,
    pub null_pointer: ClassId,
    pub index_out_of_bounds: ClassId,
    pub arithmetic: ClassId,
    pub class_cast: ClassId,
    pub abstract_method: ClassId,
    pub array_store: ClassId,
    pub out_of_memory: ClassId,
    pub clinit_failure: ClassId,
    pub undefined_native: ClassId,
    pub byte_array: ClassId,
    pub short_array: ClassId,
    pub int_array: ClassId,
    pub long_array: ClassId,
    pub ref_array: ClassId,
}

pub struct ClassTable {
    classes: Vec<ClassDef>,
    methods: Vec<MethodDef>,
    pub well_known: WellKnown,
}

fn push_class(classes: &mut Vec<ClassDef>, def: ClassDef) -> ClassId {
    let id = ClassId(classes.len() as u32);
    classes.push(def);
    id
}

fn push_exception(classes: &mut Vec<ClassDef>, name: &str, sup: ClassId) -> ClassId {
    let mut def = ClassDef::plain(name, 4);
    def.super_class = Some(sup);
    push_class(classes, def)
}

impl ClassTable {
    pub fn new() -> Self {
        let mut classes = Vec::new();

        let object = push_class(&mut classes, ClassDef::plain("Object", 0));
        let throwable = push_exception(&mut classes, "Throwable", object);
        let null_pointer = push_exception(&mut classes, "NullPointerException", throwable);
        let index_out_of_bounds =
            push_exception(&mut classes, "IndexOutOfBoundsException", throwable);
        let arithmetic = push_exception(&mut classes, "ArithmeticException", throwable);
        let class_cast = push_exception(&mut classes, "ClassCastException", throwable);
        let abstract_method = push_exception(&mut classes, "AbstractMethodError", throwable);
        let array_store = push_exception(&mut classes, "ArrayStoreException", throwable);
        let out_of_memory = push_exception(&mut classes, "OutOfMemoryError", throwable);
        let clinit_failure =
            push_exception(&mut classes, "ExceptionInInitializerError", throwable);
        let undefined_native =
            push_exception(&mut classes, "UndefinedNativeMethodError", throwable);

        let byte_array = push_class(
            &mut classes,
            ClassDef::array("byte[]", ElementKind { size: 1, tag: Tag::Byte }),
        );
        let short_array = push_class(
            &mut classes,
            ClassDef::array("short[]", ElementKind { size: 2, tag: Tag::Short }),
        );
        let int_array = push_class(
            &mut classes,
            ClassDef::array("int[]", ElementKind { size: 4, tag: Tag::Int }),
        );
        let long_array = push_class(
            &mut classes,
            ClassDef::array("long[]", ElementKind { size: 8, tag: Tag::LongHalf }),
        );
        let ref_array = {
            let mut def = ClassDef::array("Object[]", ElementKind { size: 4, tag: Tag::Ref });
            def.element_class = Some(object);
            push_class(&mut classes, def)
        };

        Self {
            classes,
            methods: Vec::new(),
            well_known: WellKnown {
                object,
                null_pointer,
                index_out_of_bounds,
                arithmetic,
                class_cast,
                abstract_method,
                array_store,
                out_of_memory,
                clinit_failure,
                undefined_native,
                byte_array,
                short_array,
                int_array,
                long_array,
                ref_array,
            },
        }
    }

    pub fn add_class(&mut self, def: ClassDef) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(def);
        id
    }

    pub fn add_method(&mut self, def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(def);
        id
    }

    #[inline]
    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassDef {
        &mut self.classes[id.0 as usize]
    }

    #[inline]
    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn static_method(&self, class: ClassId, slot: u16) -> MethodId {
        let def = self.class(class);
        match def.static_methods.get(slot as usize) {
            Some(&id) => id,
            None => fatal!("static slot {slot} out of range for class {}", def.name),
        }
    }

    pub fn virtual_method(&self, class: ClassId, slot: u16) -> MethodId {
        let def = self.class(class);
        match def.vtable.get(slot as usize) {
            Some(&id) => id,
            None => fatal!("vtable slot {slot} out of range for class {}", def.name),
        }
    }

    /// Linear scan of the class's interface map; `None` means the
    /// class does not implement the interface.
    pub fn interface_slot(
        &self,
        class: ClassId,
        interface: InterfaceId,
        index: u16,
    ) -> Option<u16> {
        let def = self.class(class);
        for map in &def.interfaces {
            if map.interface == interface {
                return map.slots.get(index as usize).copied();
            }
        }
        None
    }

    /// `value_class` is assignable to `target` (identity or subclass).
    pub fn assignable(&self, value_class: ClassId, target: ClassId) -> bool {
        value_class == target
            || target == self.well_known.object
            || self.class(value_class).is_subclass_of(self, target)
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}
