// Veld Runtime Values
// A small Copy value type plus the heap object kinds it can reference.
// Heap objects live in arena slots addressed by Handle; see heap.rs.

use crate::compiler::chunk::Chunk;
use crate::vm::heap::Handle;
use crate::vm::table::{Table, ValueMap};
use crate::vm::vm::Vm;

/// Native function signature. `args` is a copy of the argument window;
/// `args[0]` is the receiver for method-style natives. A native signals an
/// already-raised error by calling `Vm::native_error` and returning
/// `Value::Empty`, which the VM checks after every native call.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// Runtime value. `Empty` is the error-in-flight sentinel used by native
/// functions; it is never observable from the language.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(Handle),
    Empty,
}

impl Value {
    /// Only nil and false are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Obj(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// What kind of function a chunk was compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    StaticMethod,
    Initializer,
}

/// Class flavor carried from `OpCode::Class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Default,
    Abstract,
    Trait,
}

/// Immutable interned string. Equal content always maps to the same
/// handle, so equality elsewhere is handle comparison; the content hash is
/// cached for value-keyed maps (Dict/Set).
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// Compiled function: bytecode plus calling metadata.
#[derive(Debug)]
pub struct ObjFunction {
    /// Interned name; None for the top-level script and lambdas.
    pub name: Option<Handle>,
    /// Required parameter count.
    pub arity: u8,
    /// Trailing parameters with compiler-emitted defaults.
    pub optional_count: u8,
    /// Whether a trailing `...rest` parameter collects extra arguments.
    pub variadic: bool,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Module this function was compiled in; globals resolve here.
    pub module: Handle,
    pub kind: FunctionKind,
    /// Constructor auto-properties: (parameter slot, field name). Applied
    /// to the receiver before the initializer body runs.
    pub init_properties: Vec<(u8, Handle)>,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// An upvalue is open (pointing at a live stack slot) until the slot's
/// frame dies, at which point the value is copied in and it closes.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

/// Host function installed into a namespace table.
pub struct ObjNative {
    pub name: Handle,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

/// A method (closure or native) bound to a receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    pub kind: ClassKind,
    pub methods: Table,
    pub private_methods: Table,
    /// Abstract declarations awaiting a concrete override; values are Nil.
    pub abstract_methods: Table,
    /// Field names declared `private` in the class body; values are Nil.
    /// Instances route these through their private field table.
    pub private_props: Table,
    pub static_methods: Table,
    pub static_vars: Table,
    pub static_consts: Table,
    pub superclass: Option<Handle>,
}

impl ObjClass {
    pub fn new(name: Handle, kind: ClassKind) -> Self {
        Self {
            name,
            kind,
            methods: Table::new(),
            private_methods: Table::new(),
            abstract_methods: Table::new(),
            private_props: Table::new(),
            static_methods: Table::new(),
            static_vars: Table::new(),
            static_consts: Table::new(),
            superclass: None,
        }
    }
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: Handle,
    pub fields: Table,
    pub private_fields: Table,
}

impl ObjInstance {
    pub fn new(class: Handle) -> Self {
        Self {
            class,
            fields: Table::new(),
            private_fields: Table::new(),
        }
    }
}

/// A module namespace: its top-level variables plus identity metadata.
#[derive(Debug)]
pub struct ObjModule {
    pub name: Handle,
    pub path: Handle,
    pub table: Table,
}

/// Success/error wrapper for routinely-fallible operations. An ordinary
/// value, requiring explicit unwrapping at the script level.
#[derive(Debug)]
pub struct ObjResult {
    pub success: bool,
    pub value: Value,
}

/// An open (or already closed) file handle. The compiler guarantees a
/// matching close on every exit edge of a `with` block.
#[derive(Debug)]
pub struct ObjFile {
    pub file: Option<std::fs::File>,
    pub path: Handle,
}

/// Extension point for native modules: an opaque host resource carried on
/// the GC heap with custom trace/display hooks.
pub trait AbstractData {
    fn type_name(&self) -> &'static str;
    fn display(&self) -> String {
        format!("<{}>", self.type_name())
    }
    /// Values this resource keeps alive; traced by the GC.
    fn referents(&self) -> Vec<Value> {
        Vec::new()
    }
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

pub struct ObjAbstract {
    pub data: Box<dyn AbstractData>,
    /// Per-instance native method table.
    pub methods: Table,
}

impl std::fmt::Debug for ObjAbstract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjAbstract({})", self.data.type_name())
    }
}

/// Every heap object kind.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    BoundMethod(ObjBoundMethod),
    Class(ObjClass),
    Instance(ObjInstance),
    Module(ObjModule),
    List(Vec<Value>),
    Dict(ValueMap),
    Set(ValueMap),
    Result(ObjResult),
    File(ObjFile),
    Abstract(ObjAbstract),
}

impl Obj {
    /// Approximate heap footprint, used for the GC trigger accounting.
    pub fn size_hint(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            Obj::Closure(c) => c.upvalues.len() * 4,
            Obj::List(items) => items.capacity() * std::mem::size_of::<Value>(),
            Obj::Dict(map) | Obj::Set(map) => map.capacity() * 24,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_nil_and_false_only() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
    }

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
    }
}
