// Veld Compiler
// Single-pass compiler: recursive-descent statements, Pratt expressions,
// bytecode emitted directly into per-function chunks. No AST. Function,
// class and loop contexts are explicit stacks on the compiler, so nesting
// is plain push/pop.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::chunk::Chunk;
use super::opcode::{
    OpCode, CLASS_ABSTRACT, CLASS_DEFAULT, CLASS_TRAIT, FIELD_PRIVATE, METHOD_ABSTRACT,
    METHOD_PRIVATE, METHOD_PUBLIC, METHOD_STATIC,
};
use crate::error::{CompileErrors, Diagnostic};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::vm::heap::{Handle, Heap};
use crate::vm::value::{ClassKind, FunctionKind, Obj, ObjFunction, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile one module's source into a script function.
pub fn compile(
    source: &str,
    file: &str,
    module: Handle,
    repl: bool,
    heap: &mut Heap,
) -> Result<Handle, CompileErrors> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token::empty(),
        current: Token::empty(),
        heap,
        module,
        file: file.to_owned(),
        repl,
        errors: Vec::new(),
        panic_mode: false,
        functions: vec![FunctionState::new(FunctionKind::Script, None)],
        classes: Vec::new(),
        loops: Vec::new(),
        const_globals: FxHashSet::default(),
    };

    compiler.advance();
    while !compiler.match_token(&TokenKind::Eof) {
        compiler.declaration();
    }
    let script = compiler.finish_function();

    if compiler.errors.is_empty() {
        Ok(script)
    } else {
        Err(CompileErrors(compiler.errors))
    }
}

/// Operator binding strength, weakest first. `parse_precedence(p)` consumes
/// everything binding at least as tightly as `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Ternary,    // ?:
    Coalesce,   // ??
    Or,         // ||
    And,        // &&
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Equality,   // == !=
    Comparison, // < > <= >=
    Shift,      // << >>
    Term,       // + -
    Factor,     // * / %
    Power,      // ** (right-associative)
    Unary,      // ! - ~
    Call,       // . () [] ?.
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Coalesce,
            Coalesce => Or,
            Or => And,
            And => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Power,
            Power => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'h> = fn(&mut Compiler<'h>, bool);

struct ParseRule<'h> {
    prefix: Option<ParseFn<'h>>,
    infix: Option<ParseFn<'h>>,
    precedence: Precedence,
}

impl<'h> ParseRule<'h> {
    const fn new(
        prefix: Option<ParseFn<'h>>,
        infix: Option<ParseFn<'h>>,
        precedence: Precedence,
    ) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

fn rule<'h>(kind: &TokenKind) -> ParseRule<'h> {
    use Precedence as P;
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule::new(Some(Compiler::grouping), Some(Compiler::call), P::Call),
        LeftBracket => ParseRule::new(Some(Compiler::list_literal), Some(Compiler::subscript), P::Call),
        LeftBrace => ParseRule::new(Some(Compiler::dict_literal), None, P::None),
        Dot => ParseRule::new(None, Some(Compiler::dot), P::Call),
        QuestionDot => ParseRule::new(None, Some(Compiler::question_dot), P::Call),
        Minus => ParseRule::new(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        Plus => ParseRule::new(None, Some(Compiler::binary), P::Term),
        Star | Slash | Percent => ParseRule::new(None, Some(Compiler::binary), P::Factor),
        StarStar => ParseRule::new(None, Some(Compiler::binary), P::Power),
        Bang | Tilde => ParseRule::new(Some(Compiler::unary), None, P::None),
        BangEqual | EqualEqual => ParseRule::new(None, Some(Compiler::binary), P::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            ParseRule::new(None, Some(Compiler::binary), P::Comparison)
        }
        LessLess | GreaterGreater => ParseRule::new(None, Some(Compiler::binary), P::Shift),
        Ampersand => ParseRule::new(None, Some(Compiler::binary), P::BitAnd),
        Caret => ParseRule::new(None, Some(Compiler::binary), P::BitXor),
        Pipe => ParseRule::new(None, Some(Compiler::binary), P::BitOr),
        AmpersandAmpersand => ParseRule::new(None, Some(Compiler::and_), P::And),
        PipePipe => ParseRule::new(None, Some(Compiler::or_), P::Or),
        QuestionQuestion => ParseRule::new(None, Some(Compiler::coalesce), P::Coalesce),
        Question => ParseRule::new(None, Some(Compiler::ternary), P::Ternary),
        Identifier => ParseRule::new(Some(Compiler::variable), None, P::None),
        String(_) => ParseRule::new(Some(Compiler::string), None, P::None),
        Number(_) => ParseRule::new(Some(Compiler::number), None, P::None),
        True | False | Nil => ParseRule::new(Some(Compiler::literal), None, P::None),
        This => ParseRule::new(Some(Compiler::this_), None, P::None),
        Super => ParseRule::new(Some(Compiler::super_), None, P::None),
        Fun => ParseRule::new(Some(Compiler::lambda), None, P::None),
        _ => ParseRule::new(None, None, P::None),
    }
}

#[derive(Debug)]
struct Local {
    name: String,
    /// -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
    is_const: bool,
}

/// A `with`-bound file local; a close is emitted on every exit edge.
#[derive(Debug, Clone, Copy)]
struct Resource {
    slot: u8,
    depth: i32,
}

struct FunctionState {
    kind: FunctionKind,
    name: Option<Handle>,
    chunk: Chunk,
    arity: u8,
    optional_count: u8,
    variadic: bool,
    init_properties: Vec<(u8, Handle)>,
    locals: Vec<Local>,
    upvalues: SmallVec<[UpvalueRef; 8]>,
    scope_depth: i32,
    resources: Vec<Resource>,
    /// Start offset of every emitted instruction; the folding peephole
    /// inspects and rewrites the tail.
    instruction_starts: Vec<usize>,
    /// Highest patched jump landing offset. Folding must not rewrite code
    /// at or past a landing site, or the short-circuit path breaks.
    fold_barrier: usize,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<Handle>) -> Self {
        // Slot 0 holds the receiver in methods, the callee elsewhere.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            kind,
            name,
            chunk: Chunk::new(),
            arity: 0,
            optional_count: 0,
            variadic: false,
            init_properties: Vec::new(),
            locals: vec![Local {
                name: slot_zero.to_owned(),
                depth: 0,
                is_captured: false,
                is_const: false,
            }],
            upvalues: SmallVec::new(),
            scope_depth: 0,
            resources: Vec::new(),
            instruction_starts: Vec::new(),
            fold_barrier: 0,
        }
    }
}

struct ClassState {
    name: String,
    kind: ClassKind,
    has_superclass: bool,
}

struct LoopState {
    /// `continue` target: loop condition, or the increment clause in `for`.
    start: usize,
    scope_depth: i32,
    breaks: Vec<usize>,
}

enum VarTarget {
    Local(u8),
    Upvalue(u8),
    Global(u16),
}

struct Compiler<'h> {
    scanner: Scanner,
    previous: Token,
    current: Token,
    heap: &'h mut Heap,
    module: Handle,
    file: String,
    repl: bool,
    errors: Vec<Diagnostic>,
    panic_mode: bool,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
    loops: Vec<LoopState>,
    /// Module-level constants; reassignment is a compile error.
    const_globals: FxHashSet<String>,
}

impl<'h> Compiler<'h> {
    // ---- token plumbing -----------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::empty());
        loop {
            self.current = self.scanner.scan_token();
            if let TokenKind::Error(message) = &self.current.kind {
                let message = message.clone();
                self.error_at_current(&message);
            } else {
                break;
            }
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let message = match token.kind {
            TokenKind::Eof => format!("{} (at end)", message),
            _ => format!("{} (near '{}')", message, token.lexeme),
        };
        self.errors.push(Diagnostic {
            message,
            file: self.file.clone(),
            line: token.line,
        });
    }

    /// Skip to the next statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !matches!(self.current.kind, TokenKind::Eof) {
            if matches!(self.previous.kind, TokenKind::Semicolon) {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Trait | Abstract | Fun | Var | Const | For | If | While | Return
                | Import | Switch | With | Break | Continue => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emit helpers -------------------------------------------------

    fn state(&self) -> &FunctionState {
        self.functions.last().expect("function stack underflow")
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("function stack underflow")
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        let state = self.state_mut();
        let offset = state.chunk.current_offset();
        state.instruction_starts.push(offset);
        state.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().chunk.write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.state_mut().chunk.write_u16(value, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_op_u16(&mut self, op: OpCode, value: u16) {
        self.emit_op(op);
        self.emit_u16(value);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let index = self.state_mut().chunk.add_constant(value);
        if index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_u16(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let handle = self.heap.copy_string(name);
        self.make_constant(Value::Obj(handle))
    }

    /// Emit a forward jump, returning the operand offset to patch later.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xFFFF);
        self.state().chunk.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.state().chunk.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let state = self.state_mut();
        let target = state.chunk.current_offset();
        state.fold_barrier = state.fold_barrier.max(target);
        state.chunk.patch_jump(offset);
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let jump = self.state().chunk.current_offset() - start + 2;
        if jump > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(jump as u16);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ---- constant folding ---------------------------------------------

    /// Arithmetic on two trailing number constants folds in place.
    fn emit_arith(&mut self, op: OpCode) {
        if self.try_fold_binary(op) {
            return;
        }
        self.emit_op(op);
    }

    fn tail_constant(&self, start: usize) -> Option<f64> {
        let chunk = &self.state().chunk;
        if chunk.code[start] != OpCode::Constant as u8 {
            return None;
        }
        let index = chunk.read_u16(start + 1) as usize;
        match chunk.constants.get(index) {
            Some(Value::Number(n)) => Some(*n),
            _ => None,
        }
    }

    fn try_fold_binary(&mut self, op: OpCode) -> bool {
        let folded = {
            let state = self.state();
            let n = state.instruction_starts.len();
            if n < 2 {
                return false;
            }
            let (first, second) = (state.instruction_starts[n - 2], state.instruction_starts[n - 1]);
            // Both operands must be trailing, adjacent number constants,
            // and no jump may land inside the region to be rewritten.
            if second != first + 3 || state.chunk.current_offset() != second + 3 {
                return false;
            }
            if first < state.fold_barrier {
                return false;
            }
            let (a, b) = match (self.tail_constant(first), self.tail_constant(second)) {
                (Some(a), Some(b)) => (a, b),
                _ => return false,
            };
            match op {
                OpCode::Add => a + b,
                OpCode::Subtract => a - b,
                OpCode::Multiply => a * b,
                OpCode::Divide => a / b,
                OpCode::Modulo => a % b,
                OpCode::Power => a.powf(b),
                _ => return false,
            }
        };
        let state = self.state_mut();
        let n = state.instruction_starts.len();
        let first = state.instruction_starts[n - 2];
        state.chunk.truncate(first);
        state.instruction_starts.truncate(n - 2);
        self.emit_constant(Value::Number(folded));
        true
    }

    fn emit_negate(&mut self) {
        let folded = {
            let state = self.state();
            match state.instruction_starts.last() {
                Some(&start)
                    if state.chunk.current_offset() == start + 3
                        && start >= state.fold_barrier =>
                {
                    self.tail_constant(start)
                }
                _ => None,
            }
        };
        match folded {
            Some(n) => {
                let state = self.state_mut();
                let start = *state.instruction_starts.last().expect("checked above");
                state.chunk.truncate(start);
                state.instruction_starts.pop();
                self.emit_constant(Value::Number(-n));
            }
            None => self.emit_op(OpCode::Negate),
        }
    }

    // ---- scopes and variables -----------------------------------------

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let (slot, captured) = {
                let state = self.state();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => {
                        (state.locals.len() - 1, local.is_captured)
                    }
                    _ => break,
                }
            };
            if let Some(pos) = self
                .state()
                .resources
                .iter()
                .position(|r| r.slot as usize == slot)
            {
                self.state_mut().resources.remove(pos);
                self.emit_op_byte(OpCode::CloseFile, slot as u8);
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    /// Emit pops (and resource closes) for locals deeper than `depth`
    /// without forgetting them; used by `break` and `continue`, where the
    /// locals stay live on other paths.
    fn discard_locals(&mut self, depth: i32) {
        let pending: Vec<(usize, bool, bool)> = self
            .state()
            .locals
            .iter()
            .enumerate()
            .rev()
            .take_while(|(_, local)| local.depth > depth)
            .map(|(slot, local)| {
                let is_resource = self.state().resources.iter().any(|r| r.slot as usize == slot);
                (slot, local.is_captured, is_resource)
            })
            .collect();
        for (slot, captured, is_resource) in pending {
            if is_resource {
                self.emit_op_byte(OpCode::CloseFile, slot as u8);
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Close every `with`-bound file in the current function; used by
    /// `return`, which exits all of them at once.
    fn close_function_resources(&mut self) {
        let slots: Vec<u8> = self.state().resources.iter().map(|r| r.slot).collect();
        for slot in slots.into_iter().rev() {
            self.emit_op_byte(OpCode::CloseFile, slot);
        }
    }

    fn add_local(&mut self, name: &str, is_const: bool) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name: name.to_owned(),
            depth: -1,
            is_captured: false,
            is_const,
        });
    }

    fn declare_variable(&mut self, is_const: bool) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let state = self.state();
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                let message = format!("A variable named '{}' already exists in this scope.", name);
                self.error(&message);
                break;
            }
        }
        self.add_local(&name, is_const);
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        if let Some(local) = state.locals.last_mut() {
            local.depth = state.scope_depth;
        }
    }

    fn parse_variable(&mut self, message: &str, is_const: bool) -> u16 {
        self.consume(&TokenKind::Identifier, message);
        self.declare_variable(is_const);
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u16) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_u16(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func: usize, name: &str) -> Option<(u8, bool)> {
        let mut uninitialized = false;
        let found = {
            let state = &self.functions[func];
            state
                .locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name == name)
                .map(|(slot, local)| {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    (slot as u8, local.is_const)
                })
        };
        if uninitialized {
            self.error("Cannot read a local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, func: usize, index: u8, is_local: bool, is_const: bool) -> u8 {
        let reference = UpvalueRef {
            index,
            is_local,
            is_const,
        };
        let state = &mut self.functions[func];
        if let Some(existing) = state.upvalues.iter().position(|u| *u == reference) {
            return existing as u8;
        }
        if state.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closed-over variables in function.");
            return 0;
        }
        state.upvalues.push(reference);
        (state.upvalues.len() - 1) as u8
    }

    /// Capture `name` from an enclosing function, flattening through every
    /// intermediate function on the way.
    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<(u8, bool)> {
        if func == 0 {
            return None;
        }
        if let Some((slot, is_const)) = self.resolve_local(func - 1, name) {
            self.functions[func - 1].locals[slot as usize].is_captured = true;
            return Some((self.add_upvalue(func, slot, true, is_const), is_const));
        }
        if let Some((index, is_const)) = self.resolve_upvalue(func - 1, name) {
            return Some((self.add_upvalue(func, index, false, is_const), is_const));
        }
        None
    }

    fn match_compound(&mut self) -> Option<OpCode> {
        let op = match self.current.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            TokenKind::PercentEqual => OpCode::Modulo,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn check_assignable(&mut self, name: &str, is_const: bool) {
        if is_const {
            let message = format!("Cannot reassign constant '{}'.", name);
            self.error(&message);
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.functions.len() - 1;
        let (target, is_const) = if let Some((slot, c)) = self.resolve_local(top, name) {
            (VarTarget::Local(slot), c)
        } else if let Some((index, c)) = self.resolve_upvalue(top, name) {
            (VarTarget::Upvalue(index), c)
        } else {
            let constant = self.identifier_constant(name);
            (VarTarget::Global(constant), self.const_globals.contains(name))
        };

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.check_assignable(name, is_const);
            self.expression();
            self.emit_store(&target);
        } else if can_assign && self.current_is_compound() {
            let op = self.match_compound().expect("checked above");
            self.check_assignable(name, is_const);
            self.emit_load(&target);
            self.expression();
            self.emit_arith(op);
            self.emit_store(&target);
        } else {
            self.emit_load(&target);
        }
    }

    fn current_is_compound(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::PercentEqual
        )
    }

    fn emit_load(&mut self, target: &VarTarget) {
        match target {
            VarTarget::Local(slot) => self.emit_op_byte(OpCode::GetLocal, *slot),
            VarTarget::Upvalue(index) => self.emit_op_byte(OpCode::GetUpvalue, *index),
            VarTarget::Global(constant) => self.emit_op_u16(OpCode::GetGlobal, *constant),
        }
    }

    fn emit_store(&mut self, target: &VarTarget) {
        match target {
            VarTarget::Local(slot) => self.emit_op_byte(OpCode::SetLocal, *slot),
            VarTarget::Upvalue(index) => self.emit_op_byte(OpCode::SetUpvalue, *index),
            VarTarget::Global(constant) => self.emit_op_u16(OpCode::SetGlobal, *constant),
        }
    }

    // ---- expressions --------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule(&self.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expected expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(&self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(&self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && (self.check(&TokenKind::Equal) || self.current_is_compound()) {
            self.advance();
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(&TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        if let TokenKind::Number(n) = self.previous.kind {
            self.emit_constant(Value::Number(n));
        }
    }

    fn string(&mut self, _can_assign: bool) {
        if let TokenKind::String(s) = &self.previous.kind {
            let s = s.clone();
            let handle = self.heap.copy_string(&s);
            self.emit_constant(Value::Obj(handle));
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_negate(),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        let precedence = rule(&operator).precedence;
        // `**` is right-associative; everything else binds left.
        let rhs = if operator == TokenKind::StarStar {
            precedence
        } else {
            precedence.next()
        };
        self.parse_precedence(rhs);

        match operator {
            TokenKind::Plus => self.emit_arith(OpCode::Add),
            TokenKind::Minus => self.emit_arith(OpCode::Subtract),
            TokenKind::Star => self.emit_arith(OpCode::Multiply),
            TokenKind::Slash => self.emit_arith(OpCode::Divide),
            TokenKind::Percent => self.emit_arith(OpCode::Modulo),
            TokenKind::StarStar => self.emit_arith(OpCode::Power),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::LessLess => self.emit_op(OpCode::ShiftLeft),
            TokenKind::GreaterGreater => self.emit_op(OpCode::ShiftRight),
            TokenKind::Ampersand => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            _ => {}
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end);
    }

    fn or_(&mut self, _can_assign: bool) {
        let rhs = self.emit_jump(OpCode::JumpIfFalse);
        let end = self.emit_jump(OpCode::Jump);
        self.patch_jump(rhs);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end);
    }

    fn coalesce(&mut self, _can_assign: bool) {
        let rhs = self.emit_jump(OpCode::JumpIfNil);
        let end = self.emit_jump(OpCode::Jump);
        self.patch_jump(rhs);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Coalesce);
        self.patch_jump(end);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.consume(&TokenKind::Colon, "Expected ':' in conditional expression.");
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > u8::MAX as usize {
                    self.error("Cannot pass more than 255 arguments.");
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments.");
        count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(&TokenKind::Identifier, "Expected property name after '.'.");
        let name_lexeme = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name_lexeme);

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op_u16(OpCode::SetProperty, name);
        } else if can_assign && self.current_is_compound() {
            let op = self.match_compound().expect("checked above");
            self.emit_op(OpCode::Dup);
            self.emit_op_u16(OpCode::GetProperty, name);
            self.expression();
            self.emit_arith(op);
            self.emit_op_u16(OpCode::SetProperty, name);
        } else if self.match_token(&TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_u16(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_u16(OpCode::GetProperty, name);
        }
    }

    /// `a?.b` evaluates to nil, without touching `b`, when `a` is nil.
    fn question_dot(&mut self, _can_assign: bool) {
        let end = self.emit_jump(OpCode::JumpIfNil);
        self.consume(&TokenKind::Identifier, "Expected property name after '?.'.");
        let name_lexeme = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name_lexeme);
        if self.match_token(&TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_u16(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_u16(OpCode::GetProperty, name);
        }
        self.patch_jump(end);
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after list elements.");
        if count > u16::MAX as usize {
            self.error("List literal has too many elements.");
        }
        self.emit_op_u16(OpCode::NewList, count as u16);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(&TokenKind::Colon, "Expected ':' after dict key.");
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after dict entries.");
        if count > u16::MAX as usize {
            self.error("Dict literal has too many entries.");
        }
        self.emit_op_u16(OpCode::NewDict, count as u16);
    }

    fn subscript(&mut self, can_assign: bool) {
        // `[:end]`, `[start:]`, `[start:end]` or plain `[index]`.
        if self.match_token(&TokenKind::Colon) {
            self.emit_op(OpCode::Nil);
            self.finish_slice();
            return;
        }
        self.expression();
        if self.match_token(&TokenKind::Colon) {
            self.finish_slice();
            return;
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after index.");

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SubscriptSet);
        } else if can_assign && self.current_is_compound() {
            let op = self.match_compound().expect("checked above");
            self.emit_op(OpCode::DupTwo);
            self.emit_op(OpCode::Subscript);
            self.expression();
            self.emit_arith(op);
            self.emit_op(OpCode::SubscriptSet);
        } else {
            self.emit_op(OpCode::Subscript);
        }
    }

    fn finish_slice(&mut self) {
        if self.check(&TokenKind::RightBracket) {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after slice.");
        self.emit_op(OpCode::Slice);
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionKind::Function, None);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Cannot use 'this' outside of a class.");
            return;
        }
        if self.state().kind == FunctionKind::StaticMethod {
            self.error("Cannot use 'this' in a static method.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => {
                self.error("Cannot use 'super' outside of a class.");
                return;
            }
            Some(class) if !class.has_superclass => {
                self.error("Cannot use 'super' in a class with no superclass.");
                return;
            }
            _ => {}
        }
        if self.state().kind == FunctionKind::StaticMethod {
            self.error("Cannot use 'super' in a static method.");
            return;
        }
        self.consume(&TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(&TokenKind::Identifier, "Expected superclass method name.");
        let name_lexeme = self.previous.lexeme.clone();
        let name = self.identifier_constant(&name_lexeme);

        self.named_variable("this", false);
        if self.match_token(&TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_u16(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_u16(OpCode::GetSuper, name);
        }
    }

    // ---- functions ----------------------------------------------------

    fn function(&mut self, kind: FunctionKind, name: Option<Handle>) {
        self.functions.push(FunctionState::new(kind, name));
        self.begin_scope();

        self.consume(&TokenKind::LeftParen, "Expected '(' before parameters.");
        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.state().arity as usize + self.state().optional_count as usize
                    >= u8::MAX as usize
                {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }

                if self.match_token(&TokenKind::Ellipsis) {
                    if self.state().optional_count > 0 {
                        self.error("Cannot combine optional and variadic parameters.");
                    }
                    self.parse_variable("Expected parameter name after '...'.", false);
                    self.mark_initialized();
                    self.state_mut().variadic = true;
                    if self.match_token(&TokenKind::Comma) {
                        self.error("Variadic parameter must be last.");
                    }
                    break;
                }

                let auto_assign = self.match_token(&TokenKind::Var);
                if auto_assign && kind != FunctionKind::Initializer {
                    self.error("'var' parameters are only allowed in 'init'.");
                }
                self.parse_variable("Expected parameter name.", false);
                self.mark_initialized();
                let slot = (self.state().locals.len() - 1) as u8;
                if auto_assign {
                    let param = self.previous.lexeme.clone();
                    let handle = self.heap.copy_string(&param);
                    self.state_mut().init_properties.push((slot, handle));
                }

                if self.match_token(&TokenKind::Equal) {
                    if auto_assign {
                        self.error("'var' parameters cannot have default values.");
                    }
                    self.state_mut().optional_count += 1;
                    self.emit_default_preamble(slot);
                } else {
                    if self.state().optional_count > 0 {
                        self.error("Required parameter cannot follow an optional one.");
                    }
                    self.state_mut().arity += 1;
                }

                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters.");
        self.consume(&TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        let upvalues: Vec<UpvalueRef> = self.state().upvalues.iter().copied().collect();
        let handle = self.finish_function();
        let constant = self.make_constant(Value::Obj(handle));
        self.emit_op_u16(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    /// Omitted optional arguments arrive as nil; each default fills its
    /// slot only when the caller left it empty.
    fn emit_default_preamble(&mut self, slot: u8) {
        self.emit_op_byte(OpCode::GetLocal, slot);
        let use_default = self.emit_jump(OpCode::JumpIfNil);
        self.emit_op(OpCode::Pop);
        let done = self.emit_jump(OpCode::Jump);
        self.patch_jump(use_default);
        self.emit_op(OpCode::Pop);
        self.expression();
        self.emit_op_byte(OpCode::SetLocal, slot);
        self.emit_op(OpCode::Pop);
        self.patch_jump(done);
    }

    /// Seal the innermost function: emit its implicit return, pop its
    /// state and allocate the finished function object.
    fn finish_function(&mut self) -> Handle {
        self.emit_return();
        let state = self.functions.pop().expect("function stack underflow");
        let function = ObjFunction {
            name: state.name,
            arity: state.arity,
            optional_count: state.optional_count,
            variadic: state.variadic,
            upvalue_count: state.upvalues.len(),
            chunk: state.chunk,
            module: self.module,
            kind: state.kind,
            init_properties: state.init_properties,
        };
        self.heap.allocate(Obj::Function(function))
    }

    // ---- declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(&TokenKind::Class) {
            self.class_declaration(ClassKind::Default);
        } else if self.match_token(&TokenKind::Abstract) {
            self.consume(&TokenKind::Class, "Expected 'class' after 'abstract'.");
            self.class_declaration(ClassKind::Abstract);
        } else if self.match_token(&TokenKind::Trait) {
            self.class_declaration(ClassKind::Trait);
        } else if self.match_token(&TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(&TokenKind::Const) {
            self.const_declaration();
        } else if self.match_token(&TokenKind::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.", false);
        let name = self.previous.lexeme.clone();
        let handle = self.heap.copy_string(&name);
        // Initialized before the body so the function can recurse.
        self.mark_initialized();
        self.function(FunctionKind::Function, Some(handle));
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        if self.check(&TokenKind::LeftBracket) {
            self.advance();
            self.destructuring_declaration();
            return;
        }
        loop {
            let global = self.parse_variable("Expected variable name.", false);
            if self.match_token(&TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.define_variable(global);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::Semicolon, "Expected ';' after variable declaration.");
    }

    /// `var [a, b] = expr;`
    fn destructuring_declaration(&mut self) {
        let mut names = Vec::new();
        loop {
            self.consume(&TokenKind::Identifier, "Expected variable name.");
            names.push(self.previous.lexeme.clone());
            if names.len() > u8::MAX as usize {
                self.error("Too many destructuring targets.");
            }
            self.declare_variable(false);
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after destructuring targets.");
        self.consume(&TokenKind::Equal, "Destructuring declarations must be initialized.");
        self.expression();
        self.emit_op_byte(OpCode::UnpackList, names.len() as u8);
        self.consume(&TokenKind::Semicolon, "Expected ';' after variable declaration.");

        if self.state().scope_depth > 0 {
            // The unpacked values sit exactly where the new locals live.
            let state = self.state_mut();
            let depth = state.scope_depth;
            let len = state.locals.len();
            for local in &mut state.locals[len - names.len()..] {
                local.depth = depth;
            }
        } else {
            for name in names.iter().rev() {
                let name = name.clone();
                let constant = self.identifier_constant(&name);
                self.emit_op_u16(OpCode::DefineGlobal, constant);
            }
        }
    }

    fn const_declaration(&mut self) {
        let global = self.parse_variable("Expected constant name.", true);
        let name = self.previous.lexeme.clone();
        self.consume(&TokenKind::Equal, "Constants must be initialized.");
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expected ';' after constant declaration.");
        if self.state().scope_depth == 0 {
            self.const_globals.insert(name);
        }
        self.define_variable(global);
    }

    fn import_declaration(&mut self) {
        let (constant, mut alias) = if self.check(&TokenKind::String(String::new())) {
            self.advance();
            let path = match &self.previous.kind {
                TokenKind::String(path) => path.clone(),
                _ => String::new(),
            };
            let handle = self.heap.copy_string(&path);
            let constant = self.make_constant(Value::Obj(handle));
            (constant, None)
        } else {
            self.consume(&TokenKind::Identifier, "Expected module name or file path.");
            let name = self.previous.lexeme.clone();
            let constant = self.identifier_constant(&name);
            (constant, Some(name))
        };

        if self.match_token(&TokenKind::As) {
            self.consume(&TokenKind::Identifier, "Expected alias after 'as'.");
            alias = Some(self.previous.lexeme.clone());
        }
        let alias = match alias {
            Some(alias) => alias,
            None => {
                self.error("File imports require an 'as' alias.");
                self.consume(&TokenKind::Semicolon, "Expected ';' after import.");
                return;
            }
        };

        self.emit_op_u16(OpCode::ImportModule, constant);
        if self.state().scope_depth > 0 {
            self.add_local(&alias, false);
            self.mark_initialized();
        } else {
            let constant = self.identifier_constant(&alias);
            self.emit_op_u16(OpCode::DefineGlobal, constant);
        }
        self.consume(&TokenKind::Semicolon, "Expected ';' after import.");
    }

    // ---- classes ------------------------------------------------------

    fn class_declaration(&mut self, kind: ClassKind) {
        self.consume(&TokenKind::Identifier, "Expected class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable(false);

        let kind_byte = match kind {
            ClassKind::Default => CLASS_DEFAULT,
            ClassKind::Abstract => CLASS_ABSTRACT,
            ClassKind::Trait => CLASS_TRAIT,
        };
        self.emit_op_u16(OpCode::Class, name_constant);
        self.emit_byte(kind_byte);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            name: class_name.clone(),
            kind,
            has_superclass: false,
        });

        let mut scoped_super = false;
        if self.match_token(&TokenKind::Less) {
            if kind == ClassKind::Trait {
                self.error("A trait cannot have a superclass.");
            }
            self.consume(&TokenKind::Identifier, "Expected superclass name.");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("A class cannot inherit from itself.");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.add_local("super", false);
            self.mark_initialized();
            scoped_super = true;

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(&TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.class_member(kind);
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit_op(OpCode::EndClass);
        self.emit_op(OpCode::Pop);

        if scoped_super {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn class_member(&mut self, class_kind: ClassKind) {
        if self.match_token(&TokenKind::Use) {
            loop {
                self.consume(&TokenKind::Identifier, "Expected trait name after 'use'.");
                let trait_name = self.previous.lexeme.clone();
                self.named_variable(&trait_name, false);
                self.emit_op(OpCode::UseTrait);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(&TokenKind::Semicolon, "Expected ';' after trait list.");
            return;
        }

        if self.match_token(&TokenKind::Static) {
            if self.match_token(&TokenKind::Var) || self.match_token(&TokenKind::Const) {
                let is_const = self.previous.kind == TokenKind::Const;
                self.consume(&TokenKind::Identifier, "Expected class variable name.");
                let name_lexeme = self.previous.lexeme.clone();
                let name = self.identifier_constant(&name_lexeme);
                if self.match_token(&TokenKind::Equal) {
                    self.expression();
                } else if is_const {
                    self.error("Class constants must be initialized.");
                    self.emit_op(OpCode::Nil);
                } else {
                    self.emit_op(OpCode::Nil);
                }
                self.emit_op_u16(OpCode::ClassVar, name);
                self.emit_byte(is_const as u8);
                self.consume(&TokenKind::Semicolon, "Expected ';' after class variable.");
            } else {
                self.consume(&TokenKind::Identifier, "Expected method name after 'static'.");
                let name = self.previous.lexeme.clone();
                self.method(&name, METHOD_STATIC);
            }
            return;
        }

        if self.match_token(&TokenKind::Private) {
            self.consume(&TokenKind::Identifier, "Expected member name after 'private'.");
            let name = self.previous.lexeme.clone();
            if self.check(&TokenKind::LeftParen) {
                self.method(&name, METHOD_PRIVATE);
            } else {
                // `private x, y;` declares private instance fields.
                let mut pending = vec![name];
                while self.match_token(&TokenKind::Comma) {
                    self.consume(&TokenKind::Identifier, "Expected field name.");
                    pending.push(self.previous.lexeme.clone());
                }
                self.consume(&TokenKind::Semicolon, "Expected ';' after private fields.");
                for field in pending {
                    let constant = self.identifier_constant(&field);
                    self.emit_op_u16(OpCode::Method, constant);
                    self.emit_byte(FIELD_PRIVATE);
                }
            }
            return;
        }

        if self.match_token(&TokenKind::Abstract) {
            if class_kind != ClassKind::Abstract {
                self.error("Abstract methods require an abstract class.");
            }
            self.consume(&TokenKind::Identifier, "Expected method name after 'abstract'.");
            let name_lexeme = self.previous.lexeme.clone();
            let name = self.identifier_constant(&name_lexeme);
            self.consume(&TokenKind::LeftParen, "Expected '(' after method name.");
            if !self.check(&TokenKind::RightParen) {
                loop {
                    self.match_token(&TokenKind::Ellipsis);
                    self.consume(&TokenKind::Identifier, "Expected parameter name.");
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RightParen, "Expected ')' after parameters.");
            self.consume(&TokenKind::Semicolon, "Expected ';' after abstract method.");
            self.emit_op_u16(OpCode::Method, name);
            self.emit_byte(METHOD_ABSTRACT);
            return;
        }

        self.consume(&TokenKind::Identifier, "Expected method name.");
        let name = self.previous.lexeme.clone();
        self.method(&name, METHOD_PUBLIC);
    }

    fn method(&mut self, name: &str, flags: u8) {
        let constant = self.identifier_constant(name);
        let kind = if name == "init" {
            if flags != METHOD_PUBLIC {
                self.error("'init' cannot be private or static.");
            }
            FunctionKind::Initializer
        } else if flags == METHOD_STATIC {
            FunctionKind::StaticMethod
        } else {
            FunctionKind::Method
        };
        let handle = self.heap.copy_string(name);
        self.function(kind, Some(handle));
        self.emit_op_u16(OpCode::Method, constant);
        self.emit_byte(flags);
    }

    // ---- statements ---------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(&TokenKind::With) {
            self.with_statement();
        } else if self.match_token(&TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(&TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.check(&TokenKind::LeftBracket) && self.try_destructure_statement() {
            // `[a, b] = expr;` handled by the retry above.
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expected ';' after expression.");
        if self.repl && self.functions.len() == 1 && self.state().scope_depth == 0 {
            self.emit_op(OpCode::PopEcho);
        } else {
            self.emit_op(OpCode::Pop);
        }
    }

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.");

        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self) {
        let start = self.state().chunk.current_offset();
        let depth = self.state().scope_depth;
        self.loops.push(LoopState {
            start,
            scope_depth: depth,
            breaks: Vec::new(),
        });

        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.");

        let exit = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(start);
        self.patch_jump(exit);
        self.emit_op(OpCode::Pop);

        let finished = self.loops.pop().expect("loop stack underflow");
        for offset in finished.breaks {
            self.patch_jump(offset);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'.");

        if self.match_token(&TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state().chunk.current_offset();
        let mut exit = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(&TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().chunk.current_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(&TokenKind::RightParen, "Expected ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.state().scope_depth;
        self.loops.push(LoopState {
            start: loop_start,
            scope_depth: depth,
            breaks: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        let finished = self.loops.pop().expect("loop stack underflow");
        for offset in finished.breaks {
            self.patch_jump(offset);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(&TokenKind::Semicolon, "Expected ';' after 'break'.");
        let depth = match self.loops.last() {
            Some(state) => state.scope_depth,
            None => {
                self.error("Cannot use 'break' outside of a loop.");
                return;
            }
        };
        self.discard_locals(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(state) = self.loops.last_mut() {
            state.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(&TokenKind::Semicolon, "Expected ';' after 'continue'.");
        let (start, depth) = match self.loops.last() {
            Some(state) => (state.start, state.scope_depth),
            None => {
                self.error("Cannot use 'continue' outside of a loop.");
                return;
            }
        };
        self.discard_locals(depth);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.functions.len() == 1 {
            self.error("Cannot return from top-level code.");
        }
        if self.match_token(&TokenKind::Semicolon) {
            self.close_function_resources();
            self.emit_return();
            return;
        }
        if self.state().kind == FunctionKind::Initializer {
            self.error("Cannot return a value from an initializer.");
        }
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expected ';' after return value.");
        self.close_function_resources();
        self.emit_op(OpCode::Return);
    }

    fn switch_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'switch'.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expected ')' after switch value.");
        self.consume(&TokenKind::LeftBrace, "Expected '{' before switch cases.");

        let mut end_jumps = Vec::new();
        let mut saw_default = false;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.match_token(&TokenKind::Case) {
                if saw_default {
                    self.error("'case' cannot follow 'default'.");
                }
                // Any matching value in the comma list selects this body.
                let mut body_jumps = Vec::new();
                loop {
                    self.emit_op(OpCode::Dup);
                    self.expression();
                    self.emit_op(OpCode::Equal);
                    let next_value = self.emit_jump(OpCode::JumpIfFalse);
                    self.emit_op(OpCode::Pop);
                    body_jumps.push(self.emit_jump(OpCode::Jump));
                    self.patch_jump(next_value);
                    self.emit_op(OpCode::Pop);
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
                let next_case = self.emit_jump(OpCode::Jump);
                for offset in body_jumps {
                    self.patch_jump(offset);
                }
                self.consume(&TokenKind::Colon, "Expected ':' after case value.");
                self.emit_op(OpCode::Pop);
                while !self.check(&TokenKind::Case)
                    && !self.check(&TokenKind::Default)
                    && !self.check(&TokenKind::RightBrace)
                    && !self.check(&TokenKind::Eof)
                {
                    self.declaration();
                }
                end_jumps.push(self.emit_jump(OpCode::Jump));
                self.patch_jump(next_case);
            } else if self.match_token(&TokenKind::Default) {
                saw_default = true;
                self.consume(&TokenKind::Colon, "Expected ':' after 'default'.");
                self.emit_op(OpCode::Pop);
                while !self.check(&TokenKind::Case)
                    && !self.check(&TokenKind::Default)
                    && !self.check(&TokenKind::RightBrace)
                    && !self.check(&TokenKind::Eof)
                {
                    self.declaration();
                }
                end_jumps.push(self.emit_jump(OpCode::Jump));
            } else {
                self.error_at_current("Expected 'case' or 'default'.");
                self.advance();
            }
        }
        if !saw_default {
            self.emit_op(OpCode::Pop);
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after switch cases.");
        for offset in end_jumps {
            self.patch_jump(offset);
        }
    }

    /// `with (path, mode) as f { ... }` opens a file, binds it, and closes
    /// it on every exit from the block.
    fn with_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'with'.");
        self.expression();
        self.consume(&TokenKind::Comma, "Expected ',' between file path and mode.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expected ')' after file mode.");
        self.emit_op(OpCode::OpenFile);

        self.consume(&TokenKind::As, "Expected 'as' after 'with (...)'.");
        self.consume(&TokenKind::Identifier, "Expected resource name after 'as'.");
        self.declare_variable(false);
        self.mark_initialized();
        let slot = (self.state().locals.len() - 1) as u8;
        let depth = self.state().scope_depth;
        self.state_mut().resources.push(Resource { slot, depth });

        self.consume(&TokenKind::LeftBrace, "Expected '{' after resource binding.");
        self.block();
        self.end_scope();
    }

    /// `[a, b] = expr;` at statement position. The shape is probed with
    /// the scanner checkpointed; on a mismatch everything rewinds and the
    /// `[` parses as an ordinary list expression instead.
    fn try_destructure_statement(&mut self) -> bool {
        let checkpoint = self.scanner.checkpoint();
        let saved_previous = self.previous.clone();
        let saved_current = self.current.clone();

        self.advance(); // consume '['
        let mut names = Vec::new();
        let matched = loop {
            if !self.check(&TokenKind::Identifier) {
                break false;
            }
            self.advance();
            names.push(self.previous.lexeme.clone());
            if self.match_token(&TokenKind::Comma) {
                continue;
            }
            if !self.check(&TokenKind::RightBracket) {
                break false;
            }
            self.advance();
            break self.check(&TokenKind::Equal);
        };

        if !matched || names.len() > u8::MAX as usize {
            self.scanner.restore(checkpoint);
            self.previous = saved_previous;
            self.current = saved_current;
            return false;
        }

        self.advance(); // consume '='
        self.expression();
        self.emit_op_byte(OpCode::UnpackList, names.len() as u8);
        for name in names.iter().rev() {
            let top = self.functions.len() - 1;
            let target = if let Some((slot, c)) = self.resolve_local(top, name) {
                self.check_assignable(name, c);
                VarTarget::Local(slot)
            } else if let Some((index, c)) = self.resolve_upvalue(top, name) {
                self.check_assignable(name, c);
                VarTarget::Upvalue(index)
            } else {
                let is_const = self.const_globals.contains(name.as_str());
                self.check_assignable(name, is_const);
                VarTarget::Global(self.identifier_constant(name))
            };
            self.emit_store(&target);
            self.emit_op(OpCode::Pop);
        }
        self.consume(&TokenKind::Semicolon, "Expected ';' after assignment.");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::table::Table;
    use crate::vm::value::ObjModule;

    fn compile_source(source: &str) -> (Heap, Result<Handle, CompileErrors>) {
        let mut heap = Heap::new();
        let name = heap.copy_string("main");
        let module = heap.allocate(Obj::Module(ObjModule {
            name,
            path: name,
            table: Table::new(),
        }));
        let result = compile(source, "main", module, false, &mut heap);
        (heap, result)
    }

    fn expect_ok(source: &str) -> (Heap, Handle) {
        let (heap, result) = compile_source(source);
        match result {
            Ok(handle) => (heap, handle),
            Err(errors) => panic!("compile failed: {}", errors),
        }
    }

    #[test]
    fn arithmetic_on_constants_folds() {
        let (heap, script) = expect_ok("var x = 1 + 2 * 3;");
        let chunk = &heap.function(script).chunk;
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        let index = chunk.read_u16(1) as usize;
        assert_eq!(chunk.constants[index], Value::Number(7.0));
        // The folded constant feeds straight into the definition.
        assert_eq!(chunk.code[3], OpCode::DefineGlobal as u8);
    }

    #[test]
    fn negation_of_a_constant_folds() {
        let (heap, script) = expect_ok("var x = -5;");
        let chunk = &heap.function(script).chunk;
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        let index = chunk.read_u16(1) as usize;
        assert_eq!(chunk.constants[index], Value::Number(-5.0));
    }

    #[test]
    fn division_and_power_fold() {
        let (heap, script) = expect_ok("var x = 2 ** 10 / 4;");
        let chunk = &heap.function(script).chunk;
        let index = chunk.read_u16(1) as usize;
        assert_eq!(chunk.constants[index], Value::Number(256.0));
    }

    #[test]
    fn folding_stops_at_a_jump_landing_site() {
        // `||` patches its end jump to land right after the rhs constant;
        // folding `2 + 3` there would strand the short-circuit path.
        let (heap, script) = expect_ok("var x = (1 || 2) + 3;");
        let chunk = &heap.function(script).chunk;
        assert!(!chunk.constants.contains(&Value::Number(5.0)));
        assert!(chunk.constants.contains(&Value::Number(2.0)));
        assert!(chunk.constants.contains(&Value::Number(3.0)));

        let (heap, script) = expect_ok("var x = -(1 || 2);");
        let chunk = &heap.function(script).chunk;
        assert!(!chunk.constants.contains(&Value::Number(-2.0)));

        // Straight-line folding still happens after an earlier patch.
        let (heap, script) = expect_ok("if (true) {} var x = 2 + 3;");
        let chunk = &heap.function(script).chunk;
        assert!(chunk.constants.contains(&Value::Number(5.0)));
    }

    #[test]
    fn folding_stops_at_non_constants() {
        let (heap, script) = expect_ok("var a = 1; var x = a + 2;");
        let chunk = &heap.function(script).chunk;
        // An Add op must survive somewhere in the emitted code.
        let mut offset = 0;
        let mut found_add = false;
        while offset < chunk.code.len() {
            let op = OpCode::from(chunk.code[offset]);
            if op == OpCode::Add {
                found_add = true;
            }
            offset += 1 + op.operand_bytes();
        }
        assert!(found_add);
    }

    #[test]
    fn multiple_errors_are_collected() {
        let (_, result) = compile_source("var 1;\nvar y = ;\n");
        let errors = result.expect_err("expected compile errors");
        assert_eq!(errors.0.len(), 2);
        assert_eq!(errors.0[0].line, 1);
        assert_eq!(errors.0[1].line, 2);
    }

    #[test]
    fn constant_reassignment_is_rejected() {
        let (_, result) = compile_source("const LIMIT = 10; LIMIT = 11;");
        let errors = result.expect_err("expected compile errors");
        assert!(errors.0[0].message.contains("constant 'LIMIT'"));
    }

    #[test]
    fn local_constants_are_protected_too() {
        let (_, result) = compile_source("{ const x = 1; x = 2; }");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_locals_are_rejected() {
        let (_, result) = compile_source("{ var a = 1; var a = 2; }");
        let errors = result.expect_err("expected compile errors");
        assert!(errors.0[0].message.contains("already exists"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let (_, result) = compile_source("break;");
        assert!(result.is_err());
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        let (_, result) = compile_source("return 1;");
        assert!(result.is_err());
    }

    #[test]
    fn this_outside_class_is_rejected() {
        let (_, result) = compile_source("this.x = 1;");
        assert!(result.is_err());
    }

    #[test]
    fn closures_and_upvalues_compile() {
        let (_, result) = compile_source(
            "fun counter() { var n = 0; return fun() { n = n + 1; return n; }; }",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn destructuring_statement_compiles() {
        let (_, result) = compile_source("var a = 0; var b = 0; [a, b] = [1, 2];");
        assert!(result.is_ok());
    }

    #[test]
    fn bracket_expression_statement_still_parses() {
        // Not a destructuring shape; must rewind and parse as a list.
        let (_, result) = compile_source("[1, 2, 3];");
        assert!(result.is_ok());
    }

    #[test]
    fn optional_and_variadic_cannot_mix() {
        let (_, result) = compile_source("fun f(a = 1, ...rest) {}");
        assert!(result.is_err());
    }

    #[test]
    fn required_after_optional_is_rejected() {
        let (_, result) = compile_source("fun f(a = 1, b) {}");
        assert!(result.is_err());
    }

    #[test]
    fn var_parameters_only_in_init() {
        let (_, result) = compile_source("fun f(var a) {}");
        assert!(result.is_err());
        let (_, result) = compile_source("class P { init(var name) {} }");
        assert!(result.is_ok());
    }

    #[test]
    fn abstract_methods_require_abstract_class() {
        let (_, result) = compile_source("class C { abstract run(); }");
        assert!(result.is_err());
        let (_, result) = compile_source("abstract class C { abstract run(); }");
        assert!(result.is_ok());
    }

    #[test]
    fn class_with_inheritance_and_super_compiles() {
        let (_, result) = compile_source(
            "class A { greet() { return 1; } } \
             class B < A { greet() { return super.greet() + 1; } }",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn with_statement_closes_on_return() {
        let (heap, script) = expect_ok("fun read() { with (\"f.txt\", \"r\") as f { return f; } }");
        // The function body is a constant of the script chunk; its early
        // return must carry a file close.
        let closes = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .filter_map(|constant| match constant {
                Value::Obj(handle) => heap.try_function(*handle),
                _ => None,
            })
            .any(|function| function.chunk.code.contains(&(OpCode::CloseFile as u8)));
        assert!(closes);
    }

    #[test]
    fn switch_statement_compiles() {
        let (_, result) = compile_source(
            "var x = 2; switch (x) { case 1, 2: var y = 1; case 3: var z = 2; default: x = 0; }",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn repl_mode_echoes_expressions() {
        let mut heap = Heap::new();
        let name = heap.copy_string("repl");
        let module = heap.allocate(Obj::Module(ObjModule {
            name,
            path: name,
            table: Table::new(),
        }));
        let script = compile("1 + 2;", "repl", module, true, &mut heap).expect("compiles");
        let chunk = &heap.function(script).chunk;
        assert!(chunk.code.contains(&(OpCode::PopEcho as u8)));
    }
}
