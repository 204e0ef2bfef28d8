// Veld Heap
// Arena-style object heap. Objects live in slots addressed by `Handle`;
// freed slots go on a free list and are reused. Collection is tri-color
// mark-sweep with a gray worklist, triggered by byte accounting. The heap
// itself never collects inside `allocate`; the VM decides when to run a
// cycle, at instruction boundaries where every root is enumerable.

use rustc_hash::FxHashMap;

use crate::vm::table::hash_bytes;
use crate::vm::value::{ClassKind, Obj, ObjString, ObjUpvalue, Value};

const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Index of a heap slot. Copyable and trivially comparable; two handles are
/// equal exactly when they address the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Self {
        Handle(index as u32)
    }
}

#[derive(Debug)]
struct GcBox {
    marked: bool,
    size: usize,
    obj: Obj,
}

/// Result of one collection cycle, for `-d gc` logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcCycle {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub live_bytes: usize,
}

pub struct Heap {
    slots: Vec<Option<GcBox>>,
    free: Vec<u32>,
    /// Content -> handle; every `ObjString` on the heap is registered here.
    interner: FxHashMap<Box<str>, Handle>,
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            interner: FxHashMap::default(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
        }
    }

    /// Place an object in a slot. Never collects; callers poll
    /// `should_collect` at their safepoints.
    pub fn allocate(&mut self, obj: Obj) -> Handle {
        let size = obj.size_hint();
        self.bytes_allocated += size;
        let boxed = GcBox {
            marked: false,
            size,
            obj,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(boxed);
                Handle(index)
            }
            None => {
                self.slots.push(Some(boxed));
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // ---- strings ------------------------------------------------------

    /// Intern a borrowed string.
    pub fn copy_string(&mut self, chars: &str) -> Handle {
        if let Some(&handle) = self.interner.get(chars) {
            return handle;
        }
        self.intern_new(chars.to_owned().into_boxed_str())
    }

    /// Intern an owned string without re-copying on a miss.
    pub fn take_string(&mut self, chars: String) -> Handle {
        if let Some(&handle) = self.interner.get(chars.as_str()) {
            return handle;
        }
        self.intern_new(chars.into_boxed_str())
    }

    fn intern_new(&mut self, chars: Box<str>) -> Handle {
        let hash = hash_bytes(chars.as_bytes());
        let handle = self.allocate(Obj::String(ObjString {
            chars: chars.clone(),
            hash,
        }));
        self.interner.insert(chars, handle);
        handle
    }

    // ---- accessors ----------------------------------------------------

    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.index()] {
            Some(boxed) => &boxed.obj,
            None => panic!("use of freed heap slot {}", handle.index()),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.index()] {
            Some(boxed) => &mut boxed.obj,
            None => panic!("use of freed heap slot {}", handle.index()),
        }
    }

    pub fn string(&self, handle: Handle) -> &str {
        match self.get(handle) {
            Obj::String(s) => &s.chars,
            other => panic!("expected string, found {:?}", other),
        }
    }

    pub fn string_hash(&self, handle: Handle) -> u32 {
        match self.get(handle) {
            Obj::String(s) => s.hash,
            other => panic!("expected string, found {:?}", other),
        }
    }

    pub fn function(&self, handle: Handle) -> &crate::vm::value::ObjFunction {
        match self.get(handle) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    pub fn try_function(&self, handle: Handle) -> Option<&crate::vm::value::ObjFunction> {
        match self.get(handle) {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn closure(&self, handle: Handle) -> &crate::vm::value::ObjClosure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> ObjUpvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => *u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut ObjUpvalue {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn class(&self, handle: Handle) -> &crate::vm::value::ObjClass {
        match self.get(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, handle: Handle) -> &mut crate::vm::value::ObjClass {
        match self.get_mut(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn instance(&self, handle: Handle) -> &crate::vm::value::ObjInstance {
        match self.get(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, handle: Handle) -> &mut crate::vm::value::ObjInstance {
        match self.get_mut(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn module(&self, handle: Handle) -> &crate::vm::value::ObjModule {
        match self.get(handle) {
            Obj::Module(m) => m,
            other => panic!("expected module, found {:?}", other),
        }
    }

    pub fn module_mut(&mut self, handle: Handle) -> &mut crate::vm::value::ObjModule {
        match self.get_mut(handle) {
            Obj::Module(m) => m,
            other => panic!("expected module, found {:?}", other),
        }
    }

    pub fn list(&self, handle: Handle) -> &Vec<Value> {
        match self.get(handle) {
            Obj::List(items) => items,
            other => panic!("expected list, found {:?}", other),
        }
    }

    pub fn list_mut(&mut self, handle: Handle) -> &mut Vec<Value> {
        match self.get_mut(handle) {
            Obj::List(items) => items,
            other => panic!("expected list, found {:?}", other),
        }
    }

    /// Function name for diagnostics; handles closures too.
    pub fn function_name(&self, handle: Handle) -> String {
        let function = match self.get(handle) {
            Obj::Function(f) => f,
            Obj::Closure(c) => self.function(c.function),
            other => panic!("expected function or closure, found {:?}", other),
        };
        match function.name {
            Some(name) => self.string(name).to_owned(),
            None => "<script>".to_owned(),
        }
    }

    // ---- hashing and formatting ---------------------------------------

    /// Hash a value for Dict/Set keys. `None` means the value is not
    /// hashable; the VM raises on it.
    pub fn hash_value(&self, value: Value) -> Option<u32> {
        match value {
            Value::Nil => Some(11),
            Value::Bool(true) => Some(3),
            Value::Bool(false) => Some(5),
            Value::Number(n) => Some(crate::vm::table::hash_number(n)),
            Value::Obj(handle) => match self.get(handle) {
                Obj::String(s) => Some(s.hash),
                _ => None,
            },
            Value::Empty => None,
        }
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Empty => "empty",
            Value::Obj(handle) => match self.get(handle) {
                Obj::String(_) => "string",
                Obj::Function(_) | Obj::Closure(_) | Obj::BoundMethod(_) => "function",
                Obj::Native(_) => "native",
                Obj::Upvalue(_) => "upvalue",
                Obj::Class(c) => match c.kind {
                    ClassKind::Trait => "trait",
                    _ => "class",
                },
                Obj::Instance(_) => "instance",
                Obj::Module(_) => "module",
                Obj::List(_) => "list",
                Obj::Dict(_) => "dict",
                Obj::Set(_) => "set",
                Obj::Result(_) => "result",
                Obj::File(_) => "file",
                Obj::Abstract(a) => a.data.type_name(),
            },
        }
    }

    /// Printable form: strings bare, for `print`.
    pub fn value_display(&self, value: Value) -> String {
        self.format_value(value, false, &mut Vec::new())
    }

    /// Debug form: strings quoted, for REPL echo and collection elements.
    pub fn value_repr(&self, value: Value) -> String {
        self.format_value(value, true, &mut Vec::new())
    }

    fn format_value(&self, value: Value, quoted: bool, active: &mut Vec<Handle>) -> String {
        match value {
            Value::Nil => "nil".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Empty => "<empty>".to_owned(),
            Value::Obj(handle) => {
                // Self-referential collections print "..." instead of
                // recursing forever.
                if active.contains(&handle) {
                    return "...".to_owned();
                }
                active.push(handle);
                let out = self.format_object(handle, quoted, active);
                active.pop();
                out
            }
        }
    }

    fn format_object(&self, handle: Handle, quoted: bool, active: &mut Vec<Handle>) -> String {
        match self.get(handle) {
            Obj::String(s) => {
                if quoted {
                    format!("\"{}\"", s.chars)
                } else {
                    s.chars.to_string()
                }
            }
            Obj::Function(_) | Obj::Closure(_) => {
                format!("<fn {}>", self.function_name(handle))
            }
            Obj::Upvalue(_) => "<upvalue>".to_owned(),
            Obj::Native(n) => format!("<native fn {}>", self.string(n.name)),
            Obj::BoundMethod(b) => match b.method {
                Value::Obj(method) => format!("<bound method {}>", self.function_name(method)),
                _ => "<bound method>".to_owned(),
            },
            Obj::Class(c) => match c.kind {
                ClassKind::Trait => format!("<trait {}>", self.string(c.name)),
                _ => format!("<class {}>", self.string(c.name)),
            },
            Obj::Instance(i) => {
                format!("<{} instance>", self.string(self.class(i.class).name))
            }
            Obj::Module(m) => format!("<module {}>", self.string(m.name)),
            Obj::List(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| self.format_value(*item, true, active))
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            Obj::Dict(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            self.format_value(k, true, active),
                            self.format_value(v, true, active)
                        )
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Obj::Set(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, _)| self.format_value(k, true, active))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Obj::Result(r) => {
                let inner = self.format_value(r.value, true, active);
                if r.success {
                    format!("Ok({})", inner)
                } else {
                    format!("Err({})", inner)
                }
            }
            Obj::File(f) => format!("<file {}>", self.string(f.path)),
            Obj::Abstract(a) => a.data.display(),
        }
    }

    // ---- garbage collection -------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: Handle) {
        if let Some(boxed) = &mut self.slots[handle.index()] {
            if boxed.marked {
                return;
            }
            boxed.marked = true;
            self.gray.push(handle);
        }
    }

    /// Drain the gray worklist, marking everything reachable from already
    /// marked objects.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: Handle) {
        // Children are gathered first so marking can re-borrow the arena.
        let mut values: Vec<Value> = Vec::new();
        let mut handles: Vec<Handle> = Vec::new();

        match self.get(handle) {
            Obj::String(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    handles.push(name);
                }
                handles.push(f.module);
                values.extend(f.chunk.constants.iter().copied());
                handles.extend(f.init_properties.iter().map(|(_, name)| *name));
            }
            Obj::Closure(c) => {
                handles.push(c.function);
                handles.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let ObjUpvalue::Closed(value) = u {
                    values.push(*value);
                }
            }
            Obj::Native(n) => handles.push(n.name),
            Obj::BoundMethod(b) => {
                values.push(b.receiver);
                values.push(b.method);
            }
            Obj::Class(c) => {
                handles.push(c.name);
                if let Some(superclass) = c.superclass {
                    handles.push(superclass);
                }
                for table in [
                    &c.methods,
                    &c.private_methods,
                    &c.abstract_methods,
                    &c.private_props,
                    &c.static_methods,
                    &c.static_vars,
                    &c.static_consts,
                ] {
                    for (key, value) in table.iter() {
                        handles.push(key);
                        values.push(value);
                    }
                }
            }
            Obj::Instance(i) => {
                handles.push(i.class);
                for (key, value) in i.fields.iter().chain(i.private_fields.iter()) {
                    handles.push(key);
                    values.push(value);
                }
            }
            Obj::Module(m) => {
                handles.push(m.name);
                handles.push(m.path);
                for (key, value) in m.table.iter() {
                    handles.push(key);
                    values.push(value);
                }
            }
            Obj::List(items) => values.extend(items.iter().copied()),
            Obj::Dict(map) | Obj::Set(map) => {
                for (key, value) in map.iter() {
                    values.push(key);
                    values.push(value);
                }
            }
            Obj::Result(r) => values.push(r.value),
            Obj::File(f) => handles.push(f.path),
            Obj::Abstract(a) => {
                values.extend(a.data.referents());
                for (key, value) in a.methods.iter() {
                    handles.push(key);
                    values.push(value);
                }
            }
        }

        for child in handles {
            self.mark_object(child);
        }
        for child in values {
            self.mark_value(child);
        }
    }

    /// Drop interner entries whose strings were not marked. Runs between
    /// tracing and sweeping so the weak table never holds freed handles.
    pub fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.interner.retain(|_, handle| {
            slots[handle.index()]
                .as_ref()
                .map_or(false, |boxed| boxed.marked)
        });
    }

    /// Free unmarked objects, clear marks on survivors, retune the trigger.
    pub fn sweep(&mut self) -> GcCycle {
        let mut cycle = GcCycle::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(boxed) if boxed.marked => {
                    boxed.marked = false;
                }
                Some(boxed) => {
                    cycle.freed_objects += 1;
                    cycle.freed_bytes += boxed.size;
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated -= cycle.freed_bytes;
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(FIRST_GC_THRESHOLD);
        cycle.live_bytes = self.bytes_allocated;
        cycle
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_identical_handles() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        let c = heap.take_string("hello".to_owned());
        assert_eq!(a, b);
        assert_eq!(a, c);
        let d = heap.copy_string("world");
        assert_ne!(a, d);
    }

    #[test]
    fn reachable_objects_survive_collection() {
        let mut heap = Heap::new();
        let name = heap.copy_string("kept");
        let list = heap.allocate(Obj::List(vec![Value::Obj(name), Value::Number(1.0)]));

        heap.mark_object(list);
        heap.trace_references();
        heap.remove_white_strings();
        let cycle = heap.sweep();

        assert_eq!(cycle.freed_objects, 0);
        assert_eq!(heap.string(name), "kept");
        assert_eq!(heap.list(list).len(), 2);
    }

    #[test]
    fn unreachable_objects_are_freed_and_slots_reused() {
        let mut heap = Heap::new();
        let garbage = heap.allocate(Obj::List(vec![Value::Number(9.0)]));
        let kept = heap.copy_string("root");

        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        let cycle = heap.sweep();

        assert_eq!(cycle.freed_objects, 1);
        // The freed slot is recycled for the next allocation.
        let recycled = heap.allocate(Obj::List(Vec::new()));
        assert_eq!(recycled, garbage);
    }

    #[test]
    fn dead_strings_leave_the_interner() {
        let mut heap = Heap::new();
        heap.copy_string("transient");
        let kept = heap.copy_string("kept");

        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        // A fresh intern of the dead content gets a fresh slot, and the
        // surviving entry still resolves.
        let again = heap.copy_string("transient");
        assert_eq!(heap.string(again), "transient");
        assert_eq!(heap.copy_string("kept"), kept);
    }

    #[test]
    fn repeated_collections_do_not_leak_bytes() {
        let mut heap = Heap::new();
        let root = heap.copy_string("root");
        let baseline = heap.bytes_allocated();

        for _ in 0..2 {
            for i in 0..100 {
                heap.allocate(Obj::List(vec![Value::Number(i as f64)]));
            }
            heap.mark_object(root);
            heap.trace_references();
            heap.remove_white_strings();
            heap.sweep();
            assert_eq!(heap.bytes_allocated(), baseline);
        }
    }

    #[test]
    fn cyclic_list_formats_without_recursing() {
        let mut heap = Heap::new();
        let list = heap.allocate(Obj::List(Vec::new()));
        heap.list_mut(list).push(Value::Obj(list));
        assert_eq!(heap.value_repr(Value::Obj(list)), "[...]");
    }

    #[test]
    fn integral_numbers_print_without_fraction() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(-0.0), "0");
    }
}
