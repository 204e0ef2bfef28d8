// Veld Virtual Machine
// Stack machine over the arena heap. One shared value stack, a frame stack,
// open upvalues, module and global tables. Garbage collection runs only at
// instruction boundaries, where every root is enumerable.

use crate::compiler::compile;
use crate::compiler::opcode::{
    OpCode, CLASS_ABSTRACT, CLASS_TRAIT, FIELD_PRIVATE, METHOD_ABSTRACT, METHOD_PRIVATE,
    METHOD_PUBLIC, METHOD_STATIC,
};
use smallvec::SmallVec;

use crate::error::{RuntimeError, TraceFrame, VeldError};
use crate::vm::heap::{Handle, Heap};
use crate::vm::modules;
use crate::vm::natives;
use crate::vm::table::{Table, ValueMap};
use crate::vm::value::{
    ClassKind, FunctionKind, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFile, ObjInstance,
    ObjModule, ObjNative, ObjUpvalue, Value,
};

const FRAMES_MAX: usize = 4096;
const STACK_MAX: usize = 65536;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Handle,
    function: Handle,
    ip: usize,
    /// Stack index of slot 0 (the callee or receiver).
    base: usize,
}

/// The interpreter context. Everything the runtime touches hangs off this
/// one struct, passed explicitly wherever it is needed.
pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<Handle>,
    /// Native globals shared by every module (print, type, ...).
    globals: Table,
    /// Loaded modules, keyed by name or path.
    modules: Table,
    init_string: Handle,
    pending_error: Option<String>,
    /// Per-type method tables for non-instance receivers.
    pub(crate) string_methods: Table,
    pub(crate) list_methods: Table,
    pub(crate) dict_methods: Table,
    pub(crate) set_methods: Table,
    pub(crate) number_methods: Table,
    pub(crate) bool_methods: Table,
    pub(crate) nil_methods: Table,
    pub(crate) result_methods: Table,
    pub(crate) file_methods: Table,
    /// `-d gc`: log each collection cycle.
    pub log_gc: bool,
    /// `-d asm`: disassemble each compiled script before running it.
    pub dump_asm: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.copy_string("init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            modules: Table::new(),
            init_string,
            pending_error: None,
            string_methods: Table::new(),
            list_methods: Table::new(),
            dict_methods: Table::new(),
            set_methods: Table::new(),
            number_methods: Table::new(),
            bool_methods: Table::new(),
            nil_methods: Table::new(),
            result_methods: Table::new(),
            file_methods: Table::new(),
            log_gc: false,
            dump_asm: false,
        };
        natives::install(&mut vm);
        vm
    }

    /// Compile and run one source unit in the module named `name`. The
    /// module persists across calls, which is what keeps REPL state alive.
    pub fn interpret(&mut self, source: &str, name: &str, repl: bool) -> Result<(), VeldError> {
        let module = self.ensure_module(name, name);
        let script = compile(source, name, module, repl, &mut self.heap)?;
        if self.dump_asm {
            self.heap
                .function(script)
                .chunk
                .disassemble(&format!("<script {}>", name), &self.heap);
        }

        self.push(Value::Obj(script));
        let closure = self.heap.allocate(Obj::Closure(ObjClosure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        let depth = self.frames.len() - 1;
        self.run(depth)?;
        self.pop();
        Ok(())
    }

    fn ensure_module(&mut self, name: &str, path: &str) -> Handle {
        let key = self.heap.copy_string(name);
        if let Some(Value::Obj(module)) = self.modules.get(key) {
            return module;
        }
        let path = self.heap.copy_string(path);
        let module = self.heap.allocate(Obj::Module(ObjModule {
            name: key,
            path,
            table: Table::new(),
        }));
        self.modules.insert(key, Value::Obj(module));
        module
    }

    /// Wrap a host function in a heap object, ready for a namespace table.
    pub(crate) fn make_native(
        &mut self,
        name: &str,
        function: crate::vm::value::NativeFn,
    ) -> (Handle, Value) {
        let name = self.heap.copy_string(name);
        let native = self.heap.allocate(Obj::Native(ObjNative { name, function }));
        (name, Value::Obj(native))
    }

    pub(crate) fn define_native_global(
        &mut self,
        name: &str,
        function: crate::vm::value::NativeFn,
    ) {
        let (name, native) = self.make_native(name, function);
        self.globals.insert(name, native);
    }

    #[cfg(test)]
    pub(crate) fn modules_table(&self) -> &Table {
        &self.modules
    }

    // ---- stack --------------------------------------------------------

    /// Also the temporary-rooting primitive for native functions.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Raise from inside a native function; pair with returning `Empty`.
    pub fn native_error(&mut self, message: impl Into<String>) {
        self.pending_error = Some(message.into());
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = self.heap.function(frame.function).chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let frame = self.frame();
        self.heap.function(frame.function).chunk.constants[index]
    }

    fn read_string_constant(&mut self) -> Handle {
        match self.read_constant() {
            Value::Obj(handle) => handle,
            other => panic!("expected string constant, found {:?}", other),
        }
    }

    // ---- errors -------------------------------------------------------

    /// Build the traceback, then reset to a clean idle state. Runtime
    /// errors are fatal to the current run; there is no in-language catch.
    fn error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let module = self.heap.module(function.module);
            trace.push(TraceFrame {
                function: self.heap.function_name(frame.function),
                module: self.heap.string(module.name).to_owned(),
                line,
            });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.pending_error = None;
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    fn type_error(&mut self, expected: &str, value: Value) -> RuntimeError {
        let found = self.heap.type_name(value);
        self.error(format!("{} (found '{}').", expected, found))
    }

    // ---- garbage collection -------------------------------------------

    fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
            self.heap.mark_object(frame.function);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        let tables = [
            &self.globals,
            &self.modules,
            &self.string_methods,
            &self.list_methods,
            &self.dict_methods,
            &self.set_methods,
            &self.number_methods,
            &self.bool_methods,
            &self.nil_methods,
            &self.result_methods,
            &self.file_methods,
        ];
        for table in tables {
            for (key, value) in table.iter() {
                self.heap.mark_object(key);
                self.heap.mark_value(value);
            }
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        let cycle = self.heap.sweep();
        if self.log_gc {
            eprintln!(
                "[gc] freed {} objects ({} bytes), {} bytes live",
                cycle.freed_objects, cycle.freed_bytes, cycle.live_bytes
            );
        }
    }

    // ---- upvalues -----------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        for &upvalue in &self.open_upvalues {
            if let ObjUpvalue::Open(existing) = self.heap.upvalue(upvalue) {
                if existing == slot {
                    return upvalue;
                }
            }
        }
        let upvalue = self.heap.allocate(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.push(upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// in so the closure keeps it after the slot dies.
    fn close_upvalues(&mut self, from: usize) {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let handle = self.open_upvalues[index];
            if let ObjUpvalue::Open(slot) = self.heap.upvalue(handle) {
                if slot >= from {
                    let value = self.stack[slot];
                    *self.heap.upvalue_mut(handle) = ObjUpvalue::Closed(value);
                    self.open_upvalues.swap_remove(index);
                    continue;
                }
            }
            index += 1;
        }
    }

    // ---- calls --------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let handle = match callee {
            Value::Obj(handle) => handle,
            _ => return Err(self.type_error("Can only call functions and classes", callee)),
        };
        enum Kind {
            Closure,
            Native,
            Class(ClassKind),
            Bound(Value, Value),
        }
        let kind = match self.heap.get(handle) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(_) => Kind::Native,
            Obj::Class(class) => Kind::Class(class.kind),
            Obj::BoundMethod(bound) => Kind::Bound(bound.receiver, bound.method),
            _ => return Err(self.type_error("Can only call functions and classes", callee)),
        };
        match kind {
            Kind::Closure => self.call_closure(handle, argc),
            Kind::Native => self.call_native(handle, argc),
            Kind::Class(class_kind) => self.instantiate(handle, class_kind, argc),
            Kind::Bound(receiver, method) => {
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = receiver;
                self.call_value(method, argc)
            }
        }
    }

    fn call_closure(&mut self, closure: Handle, argc: u8) -> Result<(), RuntimeError> {
        if self.frames.len() >= FRAMES_MAX || self.stack.len() >= STACK_MAX {
            return Err(self.error("Stack overflow."));
        }
        let function = self.heap.closure(closure).function;
        let (arity, optional, variadic, kind) = {
            let f = self.heap.function(function);
            (f.arity, f.optional_count, f.variadic, f.kind)
        };
        let argc = argc as usize;
        let required = arity as usize;
        let maximum = required + optional as usize;

        if variadic {
            if argc < required {
                return Err(self.error(format!(
                    "Expected at least {} arguments but got {}.",
                    required, argc
                )));
            }
            let rest = self.stack.split_off(self.stack.len() - (argc - required));
            let list = self.heap.allocate(Obj::List(rest));
            self.push(Value::Obj(list));
        } else {
            if argc < required || argc > maximum {
                let expected = if optional == 0 {
                    format!("{}", required)
                } else {
                    format!("{} to {}", required, maximum)
                };
                return Err(self.error(format!(
                    "Expected {} arguments but got {}.",
                    expected, argc
                )));
            }
            // Omitted optionals arrive as nil; the callee's preamble
            // substitutes the defaults.
            for _ in argc..maximum {
                self.push(Value::Nil);
            }
        }

        let slots = if variadic { required + 1 } else { maximum };
        let base = self.stack.len() - slots - 1;

        if kind == FunctionKind::Initializer {
            self.apply_init_properties(function, base)?;
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Constructor `var` parameters assign their matching instance field
    /// before the initializer body runs.
    fn apply_init_properties(&mut self, function: Handle, base: usize) -> Result<(), RuntimeError> {
        let properties = self.heap.function(function).init_properties.clone();
        if properties.is_empty() {
            return Ok(());
        }
        let receiver = match self.stack[base] {
            Value::Obj(handle) => handle,
            other => return Err(self.type_error("'init' requires an instance", other)),
        };
        for (slot, name) in properties {
            let value = self.stack[base + slot as usize];
            let class = self.heap.instance(receiver).class;
            if self.heap.class(class).private_props.contains(name) {
                self.heap.instance_mut(receiver).private_fields.insert(name, value);
            } else {
                self.heap.instance_mut(receiver).fields.insert(name, value);
            }
        }
        Ok(())
    }

    fn call_native(&mut self, native: Handle, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.get(native) {
            Obj::Native(n) => n.function,
            other => panic!("expected native, found {:?}", other),
        };
        let start = self.stack.len() - 1 - argc as usize;
        // args[0] is the receiver (or the callee itself for plain calls).
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[start..]);
        let result = function(self, &args);
        if matches!(result, Value::Empty) || self.pending_error.is_some() {
            let message = self
                .pending_error
                .take()
                .unwrap_or_else(|| "Native call failed.".to_owned());
            return Err(self.error(message));
        }
        self.stack.truncate(start);
        self.push(result);
        Ok(())
    }

    fn instantiate(&mut self, class: Handle, kind: ClassKind, argc: u8) -> Result<(), RuntimeError> {
        match kind {
            ClassKind::Abstract => {
                let name = self.heap.class(class).name;
                let name = self.heap.string(name).to_owned();
                return Err(self.error(format!("Cannot instantiate abstract class '{}'.", name)));
            }
            ClassKind::Trait => {
                let name = self.heap.class(class).name;
                let name = self.heap.string(name).to_owned();
                return Err(self.error(format!("Cannot instantiate trait '{}'.", name)));
            }
            ClassKind::Default => {}
        }
        let instance = self.heap.allocate(Obj::Instance(ObjInstance::new(class)));
        let slot = self.stack.len() - 1 - argc as usize;
        self.stack[slot] = Value::Obj(instance);

        let initializer = self.heap.class(class).methods.get(self.init_string);
        match initializer {
            Some(Value::Obj(init)) => self.call_closure(init, argc),
            _ if argc != 0 => Err(self.error(format!("Expected 0 arguments but got {}.", argc))),
            _ => Ok(()),
        }
    }

    fn builtin_methods(&self, value: Value) -> Option<&Table> {
        match value {
            Value::Nil => Some(&self.nil_methods),
            Value::Bool(_) => Some(&self.bool_methods),
            Value::Number(_) => Some(&self.number_methods),
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::String(_) => Some(&self.string_methods),
                Obj::List(_) => Some(&self.list_methods),
                Obj::Dict(_) => Some(&self.dict_methods),
                Obj::Set(_) => Some(&self.set_methods),
                Obj::Result(_) => Some(&self.result_methods),
                Obj::File(_) => Some(&self.file_methods),
                _ => None,
            },
            Value::Empty => None,
        }
    }

    /// Is `value` the receiver of the current frame? Private members are
    /// only reachable through `this`.
    fn is_current_receiver(&self, value: Value) -> bool {
        match self.frames.last() {
            Some(frame) => self.stack[frame.base] == value,
            None => false,
        }
    }

    fn invoke(&mut self, name: Handle, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let receiver_handle = match receiver {
            Value::Obj(handle) => Some(handle),
            _ => None,
        };

        if let Some(handle) = receiver_handle {
            match self.heap.get(handle) {
                Obj::Instance(instance) => {
                    let class = instance.class;
                    // A field shadowing the method wins, as with property
                    // access.
                    if let Some(field) = self.field_value(handle, class, name)? {
                        let slot = self.stack.len() - 1 - argc as usize;
                        self.stack[slot] = field;
                        return self.call_value(field, argc);
                    }
                    if let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name) {
                        return self.call_closure(method, argc);
                    }
                    if let Some(Value::Obj(method)) = self.heap.class(class).private_methods.get(name)
                    {
                        if !self.is_current_receiver(receiver) {
                            let method_name = self.heap.string(name).to_owned();
                            return Err(self.error(format!(
                                "Cannot call private method '{}' outside of its class.",
                                method_name
                            )));
                        }
                        return self.call_closure(method, argc);
                    }
                    let method_name = self.heap.string(name).to_owned();
                    let class_name = self.heap.string(self.heap.class(class).name).to_owned();
                    return Err(self.error(format!(
                        "Undefined method '{}' on '{}' instance.",
                        method_name, class_name
                    )));
                }
                Obj::Class(_) => {
                    if let Some(value) = self.static_member(handle, name) {
                        let slot = self.stack.len() - 1 - argc as usize;
                        if let Value::Obj(member) = value {
                            if matches!(self.heap.get(member), Obj::Closure(_)) {
                                return self.call_closure(member, argc);
                            }
                        }
                        self.stack[slot] = value;
                        return self.call_value(value, argc);
                    }
                    let method_name = self.heap.string(name).to_owned();
                    return Err(self.error(format!("Undefined static member '{}'.", method_name)));
                }
                Obj::Module(module) => {
                    if let Some(value) = module.table.get(name) {
                        let slot = self.stack.len() - 1 - argc as usize;
                        self.stack[slot] = value;
                        return self.call_value(value, argc);
                    }
                    let member = self.heap.string(name).to_owned();
                    let module_name = self.heap.string(module.name).to_owned();
                    return Err(self.error(format!(
                        "Undefined name '{}' in module '{}'.",
                        member, module_name
                    )));
                }
                Obj::Abstract(wrapped) => {
                    if let Some(Value::Obj(native)) = wrapped.methods.get(name) {
                        return self.call_native(native, argc);
                    }
                }
                _ => {}
            }
        }

        // Built-in per-type methods for everything else.
        if let Some(methods) = self.builtin_methods(receiver) {
            if let Some(Value::Obj(native)) = methods.get(name) {
                return self.call_native(native, argc);
            }
        }
        let method_name = self.heap.string(name).to_owned();
        Err(self.type_error(
            &format!("Undefined method '{}'", method_name),
            receiver,
        ))
    }

    /// Look up an instance field, enforcing the private access rule.
    /// Returns Ok(None) when no field (public or private) exists.
    fn field_value(
        &mut self,
        instance: Handle,
        class: Handle,
        name: Handle,
    ) -> Result<Option<Value>, RuntimeError> {
        if self.heap.class(class).private_props.contains(name) {
            if !self.is_current_receiver(Value::Obj(instance)) {
                let field = self.heap.string(name).to_owned();
                return Err(self.error(format!(
                    "Cannot access private field '{}' outside of its class.",
                    field
                )));
            }
            return Ok(self.heap.instance(instance).private_fields.get(name));
        }
        Ok(self.heap.instance(instance).fields.get(name))
    }

    fn static_member(&self, class: Handle, name: Handle) -> Option<Value> {
        let c = self.heap.class(class);
        c.static_methods
            .get(name)
            .or_else(|| c.static_vars.get(name))
            .or_else(|| c.static_consts.get(name))
    }

    fn bind_method(&mut self, receiver: Value, method: Value) -> Value {
        self.push(receiver);
        self.push(method);
        let bound = self
            .heap
            .allocate(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.pop();
        Value::Obj(bound)
    }

    // ---- property access ----------------------------------------------

    fn get_property(&mut self, name: Handle) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        if let Value::Obj(handle) = receiver {
            match self.heap.get(handle) {
                Obj::Instance(instance) => {
                    let class = instance.class;
                    if let Some(value) = self.field_value(handle, class, name)? {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    if let Some(method) = self.heap.class(class).methods.get(name) {
                        self.pop();
                        let bound = self.bind_method(receiver, method);
                        self.push(bound);
                        return Ok(());
                    }
                    if let Some(method) = self.heap.class(class).private_methods.get(name) {
                        if self.is_current_receiver(receiver) {
                            self.pop();
                            let bound = self.bind_method(receiver, method);
                            self.push(bound);
                            return Ok(());
                        }
                        let method_name = self.heap.string(name).to_owned();
                        return Err(self.error(format!(
                            "Cannot access private method '{}' outside of its class.",
                            method_name
                        )));
                    }
                    let property = self.heap.string(name).to_owned();
                    return Err(self.error(format!("Undefined property '{}'.", property)));
                }
                Obj::Class(_) => {
                    if let Some(value) = self.static_member(handle, name) {
                        self.pop();
                        let result = match value {
                            Value::Obj(member)
                                if matches!(self.heap.get(member), Obj::Closure(_)) =>
                            {
                                self.bind_method(receiver, value)
                            }
                            _ => value,
                        };
                        self.push(result);
                        return Ok(());
                    }
                    let member = self.heap.string(name).to_owned();
                    return Err(self.error(format!("Undefined static member '{}'.", member)));
                }
                Obj::Module(module) => {
                    if let Some(value) = module.table.get(name) {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                    let member = self.heap.string(name).to_owned();
                    let module_name = self.heap.string(module.name).to_owned();
                    return Err(self.error(format!(
                        "Undefined name '{}' in module '{}'.",
                        member, module_name
                    )));
                }
                Obj::Abstract(wrapped) => {
                    if let Some(method) = wrapped.methods.get(name) {
                        self.pop();
                        let bound = self.bind_method(receiver, method);
                        self.push(bound);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        if let Some(methods) = self.builtin_methods(receiver) {
            if let Some(method) = methods.get(name) {
                self.pop();
                let bound = self.bind_method(receiver, method);
                self.push(bound);
                return Ok(());
            }
        }
        let property = self.heap.string(name).to_owned();
        Err(self.type_error(&format!("Undefined property '{}'", property), receiver))
    }

    fn set_property(&mut self, name: Handle) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let target = self.peek(1);
        let handle = match target {
            Value::Obj(handle) => handle,
            _ => return Err(self.type_error("Only instances and classes have fields", target)),
        };
        match self.heap.get(handle) {
            Obj::Instance(instance) => {
                let class = instance.class;
                if self.heap.class(class).private_props.contains(name) {
                    if !self.is_current_receiver(target) {
                        let field = self.heap.string(name).to_owned();
                        return Err(self.error(format!(
                            "Cannot access private field '{}' outside of its class.",
                            field
                        )));
                    }
                    self.heap.instance_mut(handle).private_fields.insert(name, value);
                } else {
                    self.heap.instance_mut(handle).fields.insert(name, value);
                }
            }
            Obj::Class(class) => {
                if class.static_consts.contains(name) {
                    let member = self.heap.string(name).to_owned();
                    return Err(
                        self.error(format!("Cannot reassign class constant '{}'.", member))
                    );
                }
                self.heap.class_mut(handle).static_vars.insert(name, value);
            }
            _ => return Err(self.type_error("Only instances and classes have fields", target)),
        }
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ---- the dispatch loop --------------------------------------------

    /// Execute until the frame stack returns to `stop_depth`. Module
    /// imports re-enter this loop one level deeper.
    fn run(&mut self, stop_depth: usize) -> Result<(), RuntimeError> {
        loop {
            // Safepoint: every root is enumerable between instructions.
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            // Calls check the cap too, but pushes inside one frame (long
            // list literals, say) have to hit it here.
            if self.stack.len() >= STACK_MAX {
                return Err(self.error("Stack overflow."));
            }

            let op = OpCode::from(self.read_byte());
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopEcho => {
                    let value = self.pop();
                    if !value.is_nil() {
                        println!("{}", self.heap.value_repr(value));
                    }
                }
                OpCode::Dup => self.push(self.peek(0)),
                OpCode::DupTwo => {
                    self.push(self.peek(1));
                    self.push(self.peek(1));
                }

                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.pop();
                    let module = self.heap.function(self.frame().function).module;
                    self.heap.module_mut(module).table.insert(name, value);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let module = self.heap.function(self.frame().function).module;
                    let value = self
                        .heap
                        .module(module)
                        .table
                        .get(name)
                        .or_else(|| self.globals.get(name));
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            let variable = self.heap.string(name).to_owned();
                            return Err(
                                self.error(format!("Undefined variable '{}'.", variable))
                            );
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    let module = self.heap.function(self.frame().function).module;
                    if self.heap.module(module).table.contains(name) {
                        self.heap.module_mut(module).table.insert(name, value);
                    } else {
                        let variable = self.heap.string(name).to_owned();
                        return Err(self.error(format!("Undefined variable '{}'.", variable)));
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(slot) => self.stack[slot] = value,
                        ObjUpvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(op, |a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(op, |a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(op, |a, b| a / b)?,
                OpCode::Modulo => self.numeric_binary(op, |a, b| a % b)?,
                OpCode::Power => self.numeric_binary(op, f64::powf)?,
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.type_error("Operand must be a number", value)),
                    }
                }

                OpCode::BitAnd => self.integer_binary(|a, b| a & b)?,
                OpCode::BitOr => self.integer_binary(|a, b| a | b)?,
                OpCode::BitXor => self.integer_binary(|a, b| a ^ b)?,
                OpCode::ShiftLeft => self.integer_binary(|a, b| a.wrapping_shl(b as u32))?,
                OpCode::ShiftRight => self.integer_binary(|a, b| a.wrapping_shr(b as u32))?,
                OpCode::BitNot => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(!(n as i64) as f64)),
                        None => return Err(self.type_error("Operand must be a number", value)),
                    }
                }

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => self.comparison(|a, b| a > b)?,
                OpCode::GreaterEqual => self.comparison(|a, b| a >= b)?,
                OpCode::Less => self.comparison(|a, b| a < b)?,
                OpCode::LessEqual => self.comparison(|a, b| a <= b)?,

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("no active frame").ip += offset;
                    }
                }
                OpCode::JumpIfNil => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_nil() {
                        self.frames.last_mut().expect("no active frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("no active frame").ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => return Err(self.type_error("Superclass must be a class", other)),
                    };
                    match self.heap.class(superclass).methods.get(name) {
                        Some(Value::Obj(method)) => self.call_closure(method, argc)?,
                        _ => {
                            let method = self.heap.string(name).to_owned();
                            return Err(
                                self.error(format!("Undefined superclass method '{}'.", method))
                            );
                        }
                    }
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(handle) => handle,
                        other => panic!("expected function constant, found {:?}", other),
                    };
                    let count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.heap.closure(self.frame().closure).upvalues[index]);
                        }
                    }
                    let closure = self
                        .heap
                        .allocate(Obj::Closure(ObjClosure { function, upvalues }));
                    self.push(Value::Obj(closure));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    self.push(result);
                    if self.frames.len() == stop_depth {
                        return Ok(());
                    }
                }

                OpCode::Class => {
                    let name = self.read_string_constant();
                    let kind = match self.read_byte() {
                        CLASS_ABSTRACT => ClassKind::Abstract,
                        CLASS_TRAIT => ClassKind::Trait,
                        _ => ClassKind::Default,
                    };
                    let class = self.heap.allocate(Obj::Class(ObjClass::new(name, kind)));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let subclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => panic!("expected class on stack, found {:?}", other),
                    };
                    let superclass = match self.peek(0) {
                        Value::Obj(handle)
                            if matches!(self.heap.get(handle), Obj::Class(_)) =>
                        {
                            handle
                        }
                        other => return Err(self.type_error("Superclass must be a class", other)),
                    };
                    if self.heap.class(superclass).kind == ClassKind::Trait {
                        return Err(self.error("Cannot inherit from a trait; 'use' it instead."));
                    }
                    // Copy-down inheritance; statics stay on the class that
                    // declared them.
                    let methods = self.heap.class(superclass).methods.clone();
                    let abstracts = self.heap.class(superclass).abstract_methods.clone();
                    let target = self.heap.class_mut(subclass);
                    target.methods.add_all(&methods);
                    target.abstract_methods.add_all(&abstracts);
                    target.superclass = Some(superclass);
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let flags = self.read_byte();
                    self.define_member(name, flags)?;
                }
                OpCode::ClassVar => {
                    let name = self.read_string_constant();
                    let is_const = self.read_byte() != 0;
                    let value = self.pop();
                    let class = match self.peek(0) {
                        Value::Obj(handle) => handle,
                        other => panic!("expected class on stack, found {:?}", other),
                    };
                    let class = self.heap.class_mut(class);
                    if is_const {
                        class.static_consts.insert(name, value);
                    } else {
                        class.static_vars.insert(name, value);
                    }
                }
                OpCode::UseTrait => {
                    self.use_trait()?;
                }
                OpCode::EndClass => {
                    let class = match self.peek(0) {
                        Value::Obj(handle) => handle,
                        other => panic!("expected class on stack, found {:?}", other),
                    };
                    let c = self.heap.class(class);
                    if c.kind == ClassKind::Default && !c.abstract_methods.is_empty() {
                        let missing = c
                            .abstract_methods
                            .keys()
                            .next()
                            .map(|k| self.heap.string(k).to_owned())
                            .unwrap_or_default();
                        let name = self.heap.string(c.name).to_owned();
                        return Err(self.error(format!(
                            "Class '{}' does not implement abstract method '{}'.",
                            name, missing
                        )));
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    self.set_property(name)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = match self.pop() {
                        Value::Obj(handle) => handle,
                        other => panic!("expected class on stack, found {:?}", other),
                    };
                    let receiver = self.pop();
                    match self.heap.class(superclass).methods.get(name) {
                        Some(method) => {
                            let bound = self.bind_method(receiver, method);
                            self.push(bound);
                        }
                        None => {
                            let method = self.heap.string(name).to_owned();
                            return Err(
                                self.error(format!("Undefined superclass method '{}'.", method))
                            );
                        }
                    }
                }

                OpCode::NewList => {
                    let count = self.read_u16() as usize;
                    let items = self.stack.split_off(self.stack.len() - count);
                    let list = self.heap.allocate(Obj::List(items));
                    self.push(Value::Obj(list));
                }
                OpCode::NewDict => {
                    let count = self.read_u16() as usize;
                    let start = self.stack.len() - count * 2;
                    let mut map = ValueMap::new();
                    for pair in 0..count {
                        let key = self.stack[start + pair * 2];
                        let value = self.stack[start + pair * 2 + 1];
                        let hash = match self.heap.hash_value(key) {
                            Some(hash) => hash,
                            None => return Err(self.type_error("Unhashable dict key", key)),
                        };
                        map.insert(key, hash, value);
                    }
                    self.stack.truncate(start);
                    let dict = self.heap.allocate(Obj::Dict(map));
                    self.push(Value::Obj(dict));
                }
                OpCode::Subscript => self.subscript()?,
                OpCode::SubscriptSet => self.subscript_set()?,
                OpCode::Slice => self.slice()?,
                OpCode::UnpackList => {
                    let count = self.read_byte() as usize;
                    let value = self.pop();
                    let items = match value {
                        Value::Obj(handle) => match self.heap.get(handle) {
                            Obj::List(items) => items.clone(),
                            _ => return Err(self.type_error("Can only unpack a list", value)),
                        },
                        _ => return Err(self.type_error("Can only unpack a list", value)),
                    };
                    if items.len() > count {
                        return Err(self.error("Too many values to unpack."));
                    }
                    if items.len() < count {
                        return Err(self.error("Not enough values to unpack."));
                    }
                    for item in items {
                        self.push(item);
                    }
                }

                OpCode::ImportModule => {
                    let name = self.read_string_constant();
                    self.import_module(name)?;
                }

                OpCode::OpenFile => self.open_file()?,
                OpCode::CloseFile => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    if let Value::Obj(handle) = self.stack[base + slot] {
                        if let Obj::File(file) = self.heap.get_mut(handle) {
                            // Dropping the handle closes it; reclosing a
                            // closed file is a no-op.
                            file.file.take();
                        }
                    }
                }
            }
        }
    }

    // ---- operator helpers ---------------------------------------------

    /// `+` works on two numbers, two strings or two lists.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
                Ok(())
            }
            (Value::Obj(x), Value::Obj(y)) => {
                match (self.heap.get(x), self.heap.get(y)) {
                    (Obj::String(sx), Obj::String(sy)) => {
                        let joined = format!("{}{}", sx.chars, sy.chars);
                        let handle = self.heap.take_string(joined);
                        self.push(Value::Obj(handle));
                        Ok(())
                    }
                    (Obj::List(lx), Obj::List(ly)) => {
                        let mut items = lx.clone();
                        items.extend(ly.iter().copied());
                        let handle = self.heap.allocate(Obj::List(items));
                        self.push(Value::Obj(handle));
                        Ok(())
                    }
                    _ => Err(self.error(
                        "Operands to '+' must be two numbers, two strings or two lists.",
                    )),
                }
            }
            _ => Err(self.error("Operands to '+' must be two numbers, two strings or two lists.")),
        }
    }

    fn numeric_binary(
        &mut self,
        op: OpCode,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => {
                let offender = if a.as_number().is_none() { a } else { b };
                Err(self.type_error(&format!("Operands to '{:?}' must be numbers", op), offender))
            }
        }
    }

    fn integer_binary(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(f(x as i64, y as i64) as f64));
                Ok(())
            }
            _ => {
                let offender = if a.as_number().is_none() { a } else { b };
                Err(self.type_error("Bitwise operands must be numbers", offender))
            }
        }
    }

    fn comparison(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(f(x, y)));
                Ok(())
            }
            _ => {
                let offender = if a.as_number().is_none() { a } else { b };
                Err(self.type_error("Comparison operands must be numbers", offender))
            }
        }
    }

    fn define_member(&mut self, name: Handle, flags: u8) -> Result<(), RuntimeError> {
        let class = match self.peek(if flags == METHOD_ABSTRACT || flags == FIELD_PRIVATE {
            0
        } else {
            1
        }) {
            Value::Obj(handle) => handle,
            other => panic!("expected class on stack, found {:?}", other),
        };
        match flags {
            METHOD_ABSTRACT => {
                self.heap
                    .class_mut(class)
                    .abstract_methods
                    .insert(name, Value::Nil);
            }
            FIELD_PRIVATE => {
                self.heap
                    .class_mut(class)
                    .private_props
                    .insert(name, Value::Nil);
            }
            METHOD_PRIVATE => {
                let method = self.pop();
                self.heap.class_mut(class).private_methods.insert(name, method);
            }
            METHOD_STATIC => {
                let method = self.pop();
                self.heap.class_mut(class).static_methods.insert(name, method);
            }
            METHOD_PUBLIC => {
                let method = self.pop();
                let target = self.heap.class_mut(class);
                target.methods.insert(name, method);
                // A concrete body satisfies an inherited abstract slot.
                target.abstract_methods.remove(name);
            }
            other => panic!("unknown method flags {}", other),
        }
        Ok(())
    }

    fn use_trait(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let source = match value {
            Value::Obj(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
            other => return Err(self.type_error("Can only 'use' a trait", other)),
        };
        if self.heap.class(source).kind != ClassKind::Trait {
            let name = self.heap.string(self.heap.class(source).name).to_owned();
            return Err(self.error(format!("'{}' is not a trait.", name)));
        }
        let class = match self.peek(0) {
            Value::Obj(handle) => handle,
            other => panic!("expected class on stack, found {:?}", other),
        };
        // Methods already on the class win over trait methods.
        let methods: Vec<(Handle, Value)> = self.heap.class(source).methods.iter().collect();
        for (name, method) in methods {
            let target = self.heap.class_mut(class);
            if !target.methods.contains(name) {
                target.methods.insert(name, method);
            }
            target.abstract_methods.remove(name);
        }
        Ok(())
    }

    // ---- collections --------------------------------------------------

    fn index_of(&mut self, raw: f64, len: usize) -> Result<usize, RuntimeError> {
        let mut index = raw as i64;
        if index < 0 {
            index += len as i64;
        }
        if index < 0 || index as usize >= len {
            return Err(self.error(format!("Index {} out of range (length {}).", raw, len)));
        }
        Ok(index as usize)
    }

    fn subscript(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let target = self.pop();
        let handle = match target {
            Value::Obj(handle) => handle,
            _ => return Err(self.type_error("Type is not subscriptable", target)),
        };
        match self.heap.get(handle) {
            Obj::List(items) => {
                let len = items.len();
                let raw = match index.as_number() {
                    Some(n) => n,
                    None => return Err(self.type_error("List index must be a number", index)),
                };
                let i = self.index_of(raw, len)?;
                let value = self.heap.list(handle)[i];
                self.push(value);
                Ok(())
            }
            Obj::String(s) => {
                let chars: Vec<char> = s.chars.chars().collect();
                let raw = match index.as_number() {
                    Some(n) => n,
                    None => return Err(self.type_error("String index must be a number", index)),
                };
                let i = self.index_of(raw, chars.len())?;
                let one = chars[i].to_string();
                let value = self.heap.take_string(one);
                self.push(Value::Obj(value));
                Ok(())
            }
            Obj::Dict(map) => {
                let hash = match self.heap.hash_value(index) {
                    Some(hash) => hash,
                    None => return Err(self.type_error("Unhashable dict key", index)),
                };
                match map.get(index, hash) {
                    Some(value) => {
                        self.push(value);
                        Ok(())
                    }
                    None => {
                        let key = self.heap.value_repr(index);
                        Err(self.error(format!("Key {} not found in dict.", key)))
                    }
                }
            }
            _ => Err(self.type_error("Type is not subscriptable", target)),
        }
    }

    fn subscript_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let target = self.pop();
        let handle = match target {
            Value::Obj(handle) => handle,
            _ => return Err(self.type_error("Type is not subscriptable", target)),
        };
        match self.heap.get(handle) {
            Obj::List(items) => {
                let len = items.len();
                let raw = match index.as_number() {
                    Some(n) => n,
                    None => return Err(self.type_error("List index must be a number", index)),
                };
                let i = self.index_of(raw, len)?;
                self.heap.list_mut(handle)[i] = value;
            }
            Obj::Dict(_) => {
                let hash = match self.heap.hash_value(index) {
                    Some(hash) => hash,
                    None => return Err(self.type_error("Unhashable dict key", index)),
                };
                if let Obj::Dict(map) = self.heap.get_mut(handle) {
                    map.insert(index, hash, value);
                }
            }
            _ => return Err(self.type_error("Type does not support index assignment", target)),
        }
        self.push(value);
        Ok(())
    }

    /// `x[a:b]` with either bound optional; indices clamp to range and
    /// count from the end when negative.
    fn slice(&mut self) -> Result<(), RuntimeError> {
        let end = self.pop();
        let start = self.pop();
        let target = self.pop();

        fn bound(value: Value, len: usize, default: usize) -> usize {
            match value.as_number() {
                Some(n) => {
                    let mut index = n as i64;
                    if index < 0 {
                        index += len as i64;
                    }
                    index.clamp(0, len as i64) as usize
                }
                None => default,
            }
        }

        let handle = match target {
            Value::Obj(handle) => handle,
            _ => return Err(self.type_error("Only lists and strings can be sliced", target)),
        };
        match self.heap.get(handle) {
            Obj::List(items) => {
                let len = items.len();
                let lo = bound(start, len, 0);
                let hi = bound(end, len, len);
                let slice = if lo < hi {
                    items[lo..hi].to_vec()
                } else {
                    Vec::new()
                };
                let result = self.heap.allocate(Obj::List(slice));
                self.push(Value::Obj(result));
                Ok(())
            }
            Obj::String(s) => {
                let chars: Vec<char> = s.chars.chars().collect();
                let len = chars.len();
                let lo = bound(start, len, 0);
                let hi = bound(end, len, len);
                let slice: String = if lo < hi {
                    chars[lo..hi].iter().collect()
                } else {
                    String::new()
                };
                let result = self.heap.take_string(slice);
                self.push(Value::Obj(result));
                Ok(())
            }
            _ => Err(self.type_error("Only lists and strings can be sliced", target)),
        }
    }

    // ---- modules and files --------------------------------------------

    fn import_module(&mut self, name: Handle) -> Result<(), RuntimeError> {
        if let Some(cached) = self.modules.get(name) {
            self.push(cached);
            return Ok(());
        }

        let spec = self.heap.string(name).to_owned();
        if let Some(module) = modules::build_builtin(self, &spec) {
            self.modules.insert(name, Value::Obj(module));
            self.push(Value::Obj(module));
            return Ok(());
        }

        // File import: read, compile and run the module body, caching the
        // module before execution so cyclic imports see the partial table.
        let path = if spec.ends_with(".veld") {
            spec.clone()
        } else {
            format!("{}.veld", spec)
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.error(format!("Could not open module '{}': {}.", path, err)))
            }
        };
        let path_handle = self.heap.copy_string(&path);
        let module = self.heap.allocate(Obj::Module(ObjModule {
            name,
            path: path_handle,
            table: Table::new(),
        }));
        self.modules.insert(name, Value::Obj(module));

        let script = match compile(&source, &path, module, false, &mut self.heap) {
            Ok(script) => script,
            Err(errors) => {
                return Err(self.error(format!("Failed to compile module '{}':\n{}", path, errors)))
            }
        };
        self.push(Value::Obj(script));
        let closure = self.heap.allocate(Obj::Closure(ObjClosure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        let depth = self.frames.len();
        self.call_closure(closure, 0)?;
        self.run(depth)?;
        self.pop(); // the module body's nil result
        self.push(Value::Obj(module));
        Ok(())
    }

    fn open_file(&mut self) -> Result<(), RuntimeError> {
        let mode = self.pop();
        let path = self.pop();
        let (path_handle, mode_str) = match (path, mode) {
            (Value::Obj(p), Value::Obj(m)) => {
                match (self.heap.get(p), self.heap.get(m)) {
                    (Obj::String(_), Obj::String(m)) => (p, m.chars.to_string()),
                    _ => return Err(self.error("File path and mode must be strings.")),
                }
            }
            _ => return Err(self.error("File path and mode must be strings.")),
        };
        let path_str = self.heap.string(path_handle).to_owned();

        let mut options = std::fs::OpenOptions::new();
        match mode_str.as_str() {
            "r" => options.read(true),
            "w" => options.write(true).create(true).truncate(true),
            "a" => options.append(true).create(true),
            "r+" => options.read(true).write(true),
            other => return Err(self.error(format!("Invalid file mode '{}'.", other))),
        };
        let file = match options.open(&path_str) {
            Ok(file) => file,
            Err(err) => {
                return Err(self.error(format!("Could not open file '{}': {}.", path_str, err)))
            }
        };
        let handle = self.heap.allocate(Obj::File(ObjFile {
            file: Some(file),
            path: path_handle,
        }));
        self.push(Value::Obj(handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), VeldError> {
        let mut vm = Vm::new();
        vm.interpret(source, "test", false)
    }

    fn eval(source: &str) -> Result<Value, VeldError> {
        // Runs the source, then reads back a module global named `out`.
        let mut vm = Vm::new();
        vm.interpret(source, "test", false)?;
        let key = vm.heap.copy_string("out");
        let module = vm.ensure_module("test", "test");
        Ok(vm.heap.module(module).table.get(key).unwrap_or(Value::Nil))
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("var out = 2 + 3 * 4;").unwrap(), Value::Number(14.0));
        assert_eq!(eval("var a = 10; var out = a % 3;").unwrap(), Value::Number(1.0));
        assert_eq!(eval("var b = 2; var out = b ** 8;").unwrap(), Value::Number(256.0));
    }

    #[test]
    fn string_concat_reinterns() {
        let mut vm = Vm::new();
        vm.interpret("var out = \"foo\" + \"bar\";", "test", false)
            .unwrap();
        let key = vm.heap.copy_string("out");
        let module = vm.ensure_module("test", "test");
        let value = vm.heap.module(module).table.get(key).unwrap();
        // The concatenation and a fresh intern of the same content must
        // be the same handle.
        let direct = vm.heap.copy_string("foobar");
        assert_eq!(value, Value::Obj(direct));
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(
            eval("var out = 0; { var x = 5; out = x + 1; }").unwrap(),
            Value::Number(6.0)
        );
    }

    #[test]
    fn control_flow() {
        assert_eq!(
            eval("var out = 0; for (var i = 0; i < 5; i += 1) { out += i; }").unwrap(),
            Value::Number(10.0)
        );
        assert_eq!(
            eval("var out = 0; var i = 0; while (true) { i += 1; if (i == 3) { break; } } out = i;")
                .unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn switch_selects_one_arm() {
        assert_eq!(
            eval(
                "var out = 0; switch (2) { case 1: out = 1; \
                 case 2, 3: out = 23; default: out = 99; }"
            )
            .unwrap(),
            Value::Number(23.0)
        );
        assert_eq!(
            eval("var out = 0; switch (9) { case 1: out = 1; default: out = 99; }").unwrap(),
            Value::Number(99.0)
        );
    }

    #[test]
    fn closure_counter_increments() {
        assert_eq!(
            eval(
                "fun counter() { var n = 0; return fun() { n += 1; return n; }; } \
                 var c = counter(); c(); c(); var out = c();"
            )
            .unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn two_closures_alias_one_local() {
        assert_eq!(
            eval(
                "fun pair() { var n = 0; \
                   var bump = fun() { n += 1; return n; }; \
                   var read = fun() { return n; }; \
                   bump(); bump(); return read(); } \
                 var out = pair();"
            )
            .unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn class_counter_scenario() {
        assert_eq!(
            eval(
                "class Counter { init() { this.count = 0; } \
                   inc() { this.count = this.count + 1; return this.count; } } \
                 var c = Counter(); c.inc(); c.inc(); var out = c.inc();"
            )
            .unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn inheritance_and_super() {
        assert_eq!(
            eval(
                "class A { value() { return 10; } } \
                 class B < A { value() { return super.value() + 1; } } \
                 var out = B().value();"
            )
            .unwrap(),
            Value::Number(11.0)
        );
    }

    #[test]
    fn traits_merge_methods() {
        assert_eq!(
            eval(
                "trait Greets { greet() { return \"hi \" + this.name; } } \
                 class P { init(var name) {} use Greets; } \
                 var out = P(\"ada\").greet() == \"hi ada\";"
            )
            .unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn abstract_class_cannot_be_instantiated() {
        let err = run("abstract class S { abstract run(); } S();").unwrap_err();
        assert!(matches!(err, VeldError::Runtime(_)));
    }

    #[test]
    fn missing_abstract_override_fails_at_class_end() {
        let err = run(
            "abstract class S { abstract run(); } class T < S { }",
        )
        .unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("run")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn arity_window_with_optionals() {
        assert_eq!(
            eval("fun f(a, b = 10) { return a + b; } var out = f(1) + f(1, 2);").unwrap(),
            Value::Number(14.0)
        );
        let err = run("fun f(a, b = 10) { return a + b; } f();").unwrap_err();
        assert!(matches!(err, VeldError::Runtime(_)));
        let err = run("fun f(a, b = 10) { return a + b; } f(1, 2, 3);").unwrap_err();
        assert!(matches!(err, VeldError::Runtime(_)));
    }

    #[test]
    fn vm_is_resettable_after_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("var x = 1 + nil;", "test", false).is_err());
        assert!(vm.interpret("var ok = 1 + 1;", "test", false).is_ok());
    }

    #[test]
    fn variadic_packs_extras() {
        assert_eq!(
            eval("fun f(a, ...rest) { return rest.len(); } var out = f(1, 2, 3, 4);").unwrap(),
            Value::Number(3.0)
        );
        assert_eq!(
            eval("fun f(...rest) { return rest.len(); } var out = f();").unwrap(),
            Value::Number(0.0)
        );
    }

    #[test]
    fn destructuring_binds_and_checks_arity() {
        assert_eq!(
            eval("var [a, b] = [1, 2]; var out = a * 10 + b;").unwrap(),
            Value::Number(12.0)
        );
        let err = run("var [a, b] = [1, 2, 3];").unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("Too many values")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn optional_chaining_and_coalescing() {
        assert_eq!(
            eval("var x = nil; var out = x?.missing ?? 42;").unwrap(),
            Value::Number(42.0)
        );
    }

    #[test]
    fn subscript_and_slice() {
        assert_eq!(
            eval("var l = [1, 2, 3, 4]; var out = l[1] + l[-1];").unwrap(),
            Value::Number(6.0)
        );
        assert_eq!(
            eval("var l = [1, 2, 3, 4]; var out = l[1:3].len();").unwrap(),
            Value::Number(2.0)
        );
        let err = run("var l = [1]; l[5];").unwrap_err();
        assert!(matches!(err, VeldError::Runtime(_)));
    }

    #[test]
    fn dict_literal_and_access() {
        assert_eq!(
            eval("var d = {\"a\": 1, \"b\": 2}; d[\"a\"] = 5; var out = d[\"a\"] + d[\"b\"];")
                .unwrap(),
            Value::Number(7.0)
        );
    }

    #[test]
    fn private_fields_are_sealed() {
        let err = run(
            "class Safe { private secret; init() { this.secret = 1; } } \
             var s = Safe(); s.secret;",
        )
        .unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("private")),
            other => panic!("expected runtime error, got {:?}", other),
        }
        // But methods on the class reach it fine.
        assert_eq!(
            eval(
                "class Safe { private secret; init() { this.secret = 7; } \
                   reveal() { return this.secret; } } \
                 var out = Safe().reveal();"
            )
            .unwrap(),
            Value::Number(7.0)
        );
    }

    #[test]
    fn static_members_resolve_on_the_class() {
        assert_eq!(
            eval(
                "class M { static var count = 0; static bump() { M.count += 1; return M.count; } } \
                 M.bump(); var out = M.bump();"
            )
            .unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn builtin_module_import() {
        assert_eq!(
            eval("import Math; var out = Math.sqrt(16) + Math.abs(0 - 2);").unwrap(),
            Value::Number(6.0)
        );
    }

    #[test]
    fn ternary_and_bitwise() {
        assert_eq!(
            eval("var out = 1 < 2 ? 10 : 20;").unwrap(),
            Value::Number(10.0)
        );
        assert_eq!(
            eval("var out = (6 & 3) + (6 | 3) + (1 << 3);").unwrap(),
            Value::Number(17.0)
        );
    }

    #[test]
    fn short_circuit_results_feed_arithmetic() {
        // The branch result must flow through the operator on both paths.
        assert_eq!(eval("var out = (1 || 2) + 3;").unwrap(), Value::Number(4.0));
        assert_eq!(
            eval("var out = (true ? 1 : 2) * 3;").unwrap(),
            Value::Number(3.0)
        );
        assert_eq!(eval("var out = (nil ?? 2) + 5;").unwrap(), Value::Number(7.0));
        assert_eq!(eval("var out = -(1 || 2);").unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn short_circuit_operand_reaches_the_operator() {
        // `false && 1` is false, and multiplying a bool must raise.
        let err = run("var out = (false && 1) * 2;").unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("numbers")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn stack_cap_holds_within_a_single_frame() {
        let mut source = String::with_capacity(2 * u16::MAX as usize + 16);
        source.push_str("var x = [");
        for _ in 0..u16::MAX - 1 {
            source.push_str("0,");
        }
        source.push_str("0];");
        let err = run(&source).unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("Stack overflow")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn continue_skips_to_next_iteration() {
        assert_eq!(
            eval(
                "var out = 0; for (var i = 0; i < 6; i += 1) { \
                   if (i % 2 == 0) { continue; } out += i; }"
            )
            .unwrap(),
            Value::Number(9.0)
        );
    }

    #[test]
    fn with_statement_reads_a_file() {
        let path = std::env::temp_dir().join("veld_with_read.txt");
        std::fs::write(&path, "hello").unwrap();
        let source = format!(
            "var out = \"\"; with (\"{}\", \"r\") as f {{ out = f.read(); }}",
            path.display()
        );
        let mut vm = Vm::new();
        vm.interpret(&source, "test", false).unwrap();
        let key = vm.heap.copy_string("out");
        let module = vm.ensure_module("test", "test");
        let value = vm.heap.module(module).table.get(key).unwrap();
        let expected = vm.heap.copy_string("hello");
        assert_eq!(value, Value::Obj(expected));
    }

    #[test]
    fn with_closes_the_file_on_early_return() {
        let path = std::env::temp_dir().join("veld_with_close.txt");
        let source = format!(
            "fun open() {{ with (\"{}\", \"w\") as f {{ return f; }} }} \
             open().write(\"late\");",
            path.display()
        );
        let mut vm = Vm::new();
        let err = vm.interpret(&source, "test", false).unwrap_err();
        match err {
            VeldError::Runtime(e) => assert!(e.message.contains("closed")),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn file_imports_resolve_and_cache() {
        let path = std::env::temp_dir().join("veld_import_target.veld");
        std::fs::write(&path, "var value = 40; fun double(x) { return x * 2; }").unwrap();
        let source = format!(
            "import \"{}\" as M; var out = M.double(M.value) + 4;",
            path.display()
        );
        let mut vm = Vm::new();
        vm.interpret(&source, "test", false).unwrap();
        let key = vm.heap.copy_string("out");
        let module = vm.ensure_module("test", "test");
        assert_eq!(
            vm.heap.module(module).table.get(key),
            Some(Value::Number(84.0))
        );
    }

    #[test]
    fn gc_survives_a_busy_loop() {
        // Enough transient allocation to cross the first GC threshold.
        assert!(run(
            "var keep = []; \
             for (var i = 0; i < 2000; i += 1) { \
               var s = \"x\" + str(i); \
               if (i % 100 == 0) { keep.push(s); } \
             }"
        )
        .is_ok());
    }
}
