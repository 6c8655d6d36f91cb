//! Heap allocation and garbage collection
//!
//! A slot arena owned by the VM holds every heap object behind an [`ObjRef`]
//! handle; the sweep phase walks the arena the way the classic intrusive
//! all-objects list is walked, and a free list recycles vacated slots.
//! Collection is precise, non-moving, stop-the-world tri-color mark–sweep:
//! roots are marked into a gray worklist, the worklist is traced to
//! fixpoint, the intern table drops unmarked keys, and unmarked slots are
//! freed.
//!
//! The heap never starts a collection on its own. The VM checks
//! [`Heap::should_collect`] at its allocation points and marks the roots
//! itself between [`Heap::begin_collection`] and [`Heap::finish_collection`].

use crate::object::{hash_string, Obj, ObjRef, StringObj, Upvalue};
use crate::table::Table;
use crate::value::Value;

/// Heap growth factor applied to the live size after each collection
const GC_GROW_FACTOR: usize = 2;
/// Allocation volume before the first collection
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug)]
struct Slot {
    obj: Obj,
    marked: bool,
    /// Size recorded at allocation and given back at free
    size: usize,
}

/// Object arena plus collector state and the weak intern table
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Marked-but-not-yet-traced worklist
    gray: Vec<ObjRef>,
    /// Interned strings, keyed by content. Weak: entries do not keep their
    /// keys alive, and dead keys are dropped each collection.
    strings: Table,
    stress: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            strings: Table::new(),
            stress: false,
        }
    }

    /// Move an object into the heap and return its handle
    pub fn allocate(&mut self, obj: Obj) -> ObjRef {
        let size = object_size(&obj);
        self.bytes_allocated += size;

        #[cfg(feature = "log-gc")]
        eprintln!("allocate {} bytes for {}", size, obj.kind_name());

        let slot = Slot {
            obj,
            marked: false,
            size,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Return the canonical string object for `chars`, allocating and
    /// registering it on first sight.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);

        let slots = &self.slots;
        let found = self.strings.find_string(chars, hash, |r| {
            match &slots[r.index()].as_ref().expect("interned string freed").obj {
                Obj::String(s) => &*s.chars,
                _ => unreachable!("intern table key is not a string"),
            }
        });
        if let Some(existing) = found {
            return existing;
        }

        let r = self.allocate(Obj::String(StringObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Whether the VM should run a collection before its next allocation
    pub fn should_collect(&self) -> bool {
        self.stress || cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc
    }

    /// Force a collection before every allocation point (test hook; the
    /// `stress-gc` feature does the same at compile time)
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Currently accounted heap bytes
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // === Collection ===

    /// Start a collection cycle. The caller marks every root before calling
    /// [`finish_collection`].
    pub fn begin_collection(&mut self) {
        #[cfg(feature = "log-gc")]
        eprintln!("-- gc begin ({} bytes)", self.bytes_allocated);
    }

    /// Trace from the marked roots, scrub the intern table, sweep, and set
    /// the next collection threshold.
    pub fn finish_collection(&mut self) {
        self.trace_references();
        self.remove_unmarked_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;

        #[cfg(feature = "log-gc")]
        eprintln!(
            "-- gc end ({} bytes live, next collection at {})",
            self.bytes_allocated, self.next_gc
        );
    }

    /// Mark a value's object, if it has one
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark an object and queue it for tracing
    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = match self.slots[r.index()].as_mut() {
            Some(slot) => slot,
            None => return,
        };
        if slot.marked {
            return;
        }
        slot.marked = true;

        #[cfg(feature = "log-gc")]
        eprintln!("mark {} ({})", r.0, slot.obj.kind_name());

        self.gray.push(r);
    }

    /// Drain the gray worklist, blackening each object
    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Mark everything an object refers to
    fn blacken(&mut self, r: ObjRef) {
        #[cfg(feature = "log-gc")]
        eprintln!("blacken {}", r.0);

        let mut referenced: Vec<Value> = Vec::new();
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    referenced.push(Value::Obj(name));
                }
                referenced.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                referenced.push(Value::Obj(c.function));
                referenced.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            // Open upvalues point into the stack, which is a root already
            Obj::Upvalue(Upvalue::Open(_)) => {}
            Obj::Upvalue(Upvalue::Closed(value)) => referenced.push(*value),
            Obj::Class(c) => {
                referenced.push(Value::Obj(c.name));
                for (key, value) in c.methods.entries() {
                    referenced.push(Value::Obj(key));
                    referenced.push(value);
                }
            }
            Obj::Instance(i) => {
                referenced.push(Value::Obj(i.class));
                for (key, value) in i.fields.entries() {
                    referenced.push(Value::Obj(key));
                    referenced.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                referenced.push(b.receiver);
                referenced.push(Value::Obj(b.method));
            }
        }
        for value in referenced {
            self.mark_value(value);
        }
    }

    /// Drop intern-table entries whose string died this cycle. Must run
    /// before the sweep frees them.
    fn remove_unmarked_strings(&mut self) {
        let Heap { slots, strings, .. } = self;
        strings.remove_unmarked(|r| slots[r.index()].as_ref().is_some_and(|slot| slot.marked));
    }

    /// Free unmarked slots and clear the mark on survivors
    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let freed = match self.slots[index].as_mut() {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    None
                }
                Some(slot) => Some(slot.size),
                None => None,
            };
            if let Some(size) = freed {
                #[cfg(feature = "log-gc")]
                eprintln!(
                    "free {} ({})",
                    index,
                    self.slots[index].as_ref().map_or("", |s| s.obj.kind_name())
                );

                self.bytes_allocated -= size;
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }
    }

    // === Typed accessors ===
    //
    // Handles are produced by this heap and never outlive the objects they
    // name while reachable, so a stale or mistyped handle is an interpreter
    // bug; these panic rather than propagate.

    /// Borrow the object behind a handle
    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.slots[r.index()]
            .as_ref()
            .expect("dangling object handle")
            .obj
    }

    /// Mutably borrow the object behind a handle
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slots[r.index()]
            .as_mut()
            .expect("dangling object handle")
            .obj
    }

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::String(s) => &s.chars,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::String(s) => s.hash,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::Function {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::Closure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::Class {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::Class {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::Instance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::Instance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn is_instance(&self, r: ObjRef) -> bool {
        matches!(self.get(r), Obj::Instance(_))
    }
}

/// Payload estimate recorded per object for trigger accounting
fn object_size(obj: &Obj) -> usize {
    let payload = match obj {
        Obj::String(s) => s.chars.len(),
        Obj::Function(f) => f.chunk.byte_size(),
        Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.byte_size(),
        Obj::Instance(i) => i.fields.byte_size(),
        Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
    };
    std::mem::size_of::<Obj>() + payload
}
