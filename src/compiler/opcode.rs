// Veld Bytecode Instructions

/// Bytecode operation codes.
///
/// Operand encoding: constant-pool indexes and jump offsets are big-endian
/// u16; stack slots, argument counts and flag bytes are u8. `Closure`
/// additionally carries one `(is_local, index)` byte pair per upvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and stack operations
    Constant, // u16 constant index
    Nil,
    True,
    False,
    Pop,
    PopEcho, // REPL: pop and echo non-nil values
    Dup,
    DupTwo, // [a, b] -> [a, b, a, b], for compound subscript assignment

    // Variables
    DefineGlobal, // u16 name constant
    GetGlobal,    // u16 name constant
    SetGlobal,    // u16 name constant
    GetLocal,     // u8 slot
    SetLocal,     // u8 slot
    GetUpvalue,   // u8 upvalue index
    SetUpvalue,   // u8 upvalue index
    CloseUpvalue,

    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Negate,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftLeft,
    ShiftRight,

    // Comparison and logic
    Not,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Control flow
    Jump,        // u16 forward offset
    JumpIfFalse, // u16 forward offset; peeks
    JumpIfNil,   // u16 forward offset; peeks (optional chaining, ?? and defaults)
    Loop,        // u16 backward offset

    // Functions and calls
    Call,        // u8 arg count
    Invoke,      // u16 method name constant, u8 arg count
    SuperInvoke, // u16 method name constant, u8 arg count
    Closure,     // u16 function constant + (u8 is_local, u8 index) per upvalue
    Return,

    // Classes
    Class,       // u16 name constant, u8 class kind
    Inherit,
    Method,      // u16 name constant, u8 member flags
    ClassVar,    // u16 name constant, u8 is_const
    UseTrait,
    EndClass,
    GetProperty, // u16 name constant
    SetProperty, // u16 name constant
    GetSuper,    // u16 method name constant

    // Collections
    NewList,      // u16 element count
    NewDict,      // u16 entry count
    Subscript,
    SubscriptSet,
    Slice,
    UnpackList, // u8 target count (destructuring)

    // Modules
    ImportModule, // u16 name/path constant

    // Scoped resources
    OpenFile,
    CloseFile, // u8 local slot
}

/// Class kind byte carried by `OpCode::Class`.
pub const CLASS_DEFAULT: u8 = 0;
pub const CLASS_ABSTRACT: u8 = 1;
pub const CLASS_TRAIT: u8 = 2;

/// Member flag byte carried by `OpCode::Method`.
pub const METHOD_PUBLIC: u8 = 0;
pub const METHOD_PRIVATE: u8 = 1;
pub const METHOD_STATIC: u8 = 2;
pub const METHOD_ABSTRACT: u8 = 3;
/// `private name;` field declaration; no value operand on the stack.
pub const FIELD_PRIVATE: u8 = 4;

impl OpCode {
    /// Fixed operand byte count (Closure's upvalue pairs not included).
    pub fn operand_bytes(&self) -> usize {
        use OpCode::*;
        match self {
            Constant | DefineGlobal | GetGlobal | SetGlobal | Jump | JumpIfFalse | JumpIfNil
            | Loop | GetProperty | SetProperty | GetSuper | NewList | NewDict | ImportModule
            | Closure => 2,
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | UnpackList | CloseFile => 1,
            Invoke | SuperInvoke | Class | Method | ClassVar => 3,
            _ => 0,
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        // Safe for bytes emitted by the compiler; the VM only reads chunks
        // it produced itself.
        unsafe { std::mem::transmute(byte) }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}
