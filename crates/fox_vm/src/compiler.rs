use fox_lexer::{Lexer, Token, TokenKind};

use crate::chunk::Chunk;
use crate::error::CompileError;
use crate::gc::Gc;
use crate::object::{GcRef, ObjData};
use crate::opcode::Op;
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_DESTRUCTURE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Destructure,
    Assignment,
    Pipe,
    Ternary,
    Or,
    And,
    BitOr,
    Xor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Range,
    Unary,
    Postfix,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Destructure,
            Destructure => Assignment,
            Assignment => Pipe,
            Pipe => Ternary,
            Ternary => Or,
            Or => And,
            And => BitOr,
            BitOr => Xor,
            Xor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Range,
            Range => Unary,
            Unary => Postfix,
            Postfix => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn infix_precedence(kind: &TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual | PercentEqual | AmpEqual
        | PipeEqual | CaretEqual | ShiftLeftEqual | ShiftRightEqual | UnsignedShiftRightEqual => {
            Precedence::Assignment
        }
        PipeArrow => Precedence::Pipe,
        Question => Precedence::Ternary,
        PipePipe | Or => Precedence::Or,
        AmpAmp | And => Precedence::And,
        Pipe => Precedence::BitOr,
        CaretOp => Precedence::Xor,
        Amp => Precedence::BitAnd,
        EqualEqual | BangEqual | Is | In | Implements => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        ShiftLeft | ShiftRight | UnsignedShiftRight => Precedence::Shift,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        DotDot => Precedence::Range,
        PlusPlus | MinusMinus => Precedence::Postfix,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Lambda,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDef {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

/// Bookkeeping for the single in-flight lvalue a prefix/postfix `++`/`--`
/// needs re-store instructions for; reset after every statement.
#[derive(Clone)]
enum Lvalue {
    None,
    Local(u8),
    Upvalue(u8),
    Global(u8),
    Property(u8),
    Index,
}

struct Frame {
    kind: FunctionKind,
    name: Option<String>,
    arity: u8,
    lambda: bool,
    varargs: bool,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDef>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    lvalue: Lvalue,
}

impl Frame {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        let mut locals = Vec::new();
        // Slot 0 is the implicit receiver: `this` for methods, otherwise
        // unnamed and used only for stack alignment.
        locals.push(Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        });
        Frame {
            kind,
            name,
            arity: 0,
            lambda: matches!(kind, FunctionKind::Lambda),
            varargs: false,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            lvalue: Lvalue::None,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

/// Single-pass Pratt parser: reads tokens from `fox_lexer` and writes
/// bytecode directly into the current frame's `Chunk`. There is no
/// intermediate AST.
pub struct Compiler<'gc, 'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    gc: &'gc mut Gc,
    frames: Vec<Frame>,
    classes: Vec<ClassCtx>,
}

pub fn compile(source: &str, gc: &mut Gc) -> Result<GcRef, Vec<CompileError>> {
    let mut lexer = Lexer::new(source);
    let first = lexer.next_token();
    let mut c = Compiler {
        lexer,
        previous: first.clone(),
        current: first,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        gc,
        frames: vec![Frame::new(FunctionKind::Script, None)],
        classes: Vec::new(),
    };
    while !c.check(&TokenKind::Eof) {
        c.declaration();
    }
    let line = c.previous.line();
    c.emit_op(Op::Null, line);
    c.emit_op(Op::Return, line);

    if c.had_error {
        return Err(c.errors);
    }
    let frame = c.frames.pop().unwrap();
    let name = c.gc.intern("<script>");
    let func = c
        .gc
        .new_function(Some(name), 0, false, false, frame.chunk);
    Ok(func)
}

impl<'gc, 'src> Compiler<'gc, 'src> {
    // ── Token stream ────────────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if let TokenKind::Error(msg) = &self.current.kind {
                let line = self.current.line();
                self.error_at_current(&msg.clone());
                let _ = line;
                continue;
            }
            break;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.line(), message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.line(), message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError::new(line, message.to_string()));
    }

    /// Consumes tokens until a statement boundary so one error doesn't
    /// cascade into a wall of follow-on diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match &self.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::Foreach
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Try
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::From
                | TokenKind::Export => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── Frame / chunk helpers ───────────────────────────────────────────

    fn frame(&self) -> &Frame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap()
    }

    fn line(&self) -> u32 {
        self.previous.line()
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.frame_mut().chunk.emit_u8(byte, line);
    }

    fn emit_op(&mut self, op: Op, line: u32) {
        self.frame_mut().chunk.emit_op(op, line);
    }

    fn emit(&mut self, op: Op) {
        let line = self.line();
        self.emit_op(op, line);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        let line = self.line();
        self.frame_mut().chunk.emit_jump(op, line)
    }

    fn patch_jump(&mut self, at: usize) {
        self.frame_mut().chunk.patch_jump(at);
    }

    fn emit_loop(&mut self, start: usize) {
        let line = self.line();
        self.frame_mut().chunk.emit_loop(start, line);
    }

    fn current_offset(&self) -> usize {
        self.frame().chunk.len()
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.frame_mut().chunk.add_constant(value);
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.gc.intern(name);
        self.make_constant(Value::Obj(s))
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit(Op::Constant);
        self.emit_u8(idx);
    }

    // ── Scopes & locals ──────────────────────────────────────────────────

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.line();
        self.frame_mut().scope_depth -= 1;
        let depth = self.frame().scope_depth;
        while let Some(local) = self.frame().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.frame().locals.last().unwrap().is_captured {
                self.emit_op(Op::CloseUpvalue, line);
            } else {
                self.emit_op(Op::Pop, line);
            }
            self.frame_mut().locals.pop();
        }
    }

    /// Reserves a real stack slot for an internal value the user can never
    /// name or re-declare (e.g. a destructuring source), so later locals
    /// still get correct slot indices. Skips `declare_local`'s duplicate
    /// check, which would otherwise fire between two sibling destructuring
    /// statements in the same block (unlike `foreach`'s own hidden `iter`
    /// local, which is safe only because it's wrapped in its own
    /// begin_scope/end_scope pair).
    fn declare_hidden_local(&mut self) -> u8 {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
        }
        let depth = self.frame().scope_depth;
        self.frame_mut().locals.push(Local {
            name: String::new(),
            depth,
            is_captured: false,
        });
        (self.frame().locals.len() - 1) as u8
    }

    fn declare_local(&mut self, name: &str) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        let depth = self.frame().scope_depth;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("duplicate local variable in this scope");
                return;
            }
        }
        self.frame_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            is_captured: false,
        });
    }

    fn resolve_local(frame: &Frame, name: &str) -> Option<u8> {
        frame
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u8)
    }

    fn add_upvalue(frame: &mut Frame, index: u8, is_local: bool) -> u8 {
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        frame.upvalues.push(UpvalueDef { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(frames: &mut [Frame], idx: usize, name: &str) -> Option<u8> {
        if idx == 0 {
            return None;
        }
        if let Some(local) = Self::resolve_local(&frames[idx - 1], name) {
            frames[idx - 1].locals[local as usize].is_captured = true;
            return Some(Self::add_upvalue(&mut frames[idx], local, true));
        }
        if let Some(upval) = Self::resolve_upvalue(frames, idx - 1, name) {
            return Some(Self::add_upvalue(&mut frames[idx], upval, false));
        }
        None
    }

    // ── Variable definition ──────────────────────────────────────────────

    fn declare_variable(&mut self, name: &str) {
        if self.frame().scope_depth == 0 {
            return;
        }
        self.declare_local(name);
    }

    fn define_variable(&mut self, name: &str) {
        if self.frame().scope_depth > 0 {
            return;
        }
        let idx = self.identifier_constant(name);
        self.emit(Op::DefineGlobal);
        self.emit_u8(idx);
    }

    // ── Declarations ──────────────────────────────────────────────────────

    fn declaration(&mut self) {
        if self.match_token(&TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(&TokenKind::Function) {
            self.fun_declaration();
        } else if self.match_token(&TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(&TokenKind::Import) {
            self.import_declaration();
        } else if self.match_token(&TokenKind::From) {
            self.from_import_declaration();
        } else if self.match_token(&TokenKind::Export) {
            self.export_statement();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        self.consume(&TokenKind::Identifier, "expected variable name");
        let first = self.previous.lexeme.to_string();
        let line = self.line();

        if self.check(&TokenKind::Comma) {
            let mut names = vec![first];
            while self.match_token(&TokenKind::Comma) {
                self.consume(&TokenKind::Identifier, "expected variable name");
                names.push(self.previous.lexeme.to_string());
                if names.len() > MAX_DESTRUCTURE {
                    self.error("too many destructuring targets");
                    break;
                }
            }
            if self.match_token(&TokenKind::LeftArrow) {
                self.expression();
                self.compile_destructure_by_name(&names, line);
            } else {
                self.consume(&TokenKind::Equal, "expected '=' or '<-' after destructuring targets");
                self.expression();
                self.compile_destructure_positional(&names, line);
            }
            self.consume(&TokenKind::Semicolon, "expected ';' after variable declaration");
            return;
        }

        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Null, line);
        }
        self.consume(&TokenKind::Semicolon, "expected ';' after variable declaration");
        self.declare_variable(&first);
        self.define_variable(&first);
    }

    /// Each target needs its own copy of the shared source value to index
    /// or to read a property from. For a global target the copy is consumed
    /// immediately by `DefineGlobal`, so the source stays on top of the
    /// stack and a plain `Dup` reaches it next iteration. For a local
    /// target nothing pops the copy — it becomes the local's stack slot —
    /// so the source gets buried one slot deeper per local declared so far,
    /// and `DupOffset` is used to reach back down to it instead.
    fn compile_destructure_positional(&mut self, names: &[String], line: u32) {
        let mut buried = 0u8;
        for (i, name) in names.iter().enumerate() {
            if buried == 0 {
                self.emit_op(Op::Dup, line);
            } else {
                self.emit_op(Op::DupOffset, line);
                self.emit_u8(buried);
            }
            self.emit_constant(Value::Number(i as f64));
            self.emit_op(Op::GetIndex, line);
            self.declare_variable(name);
            if self.frame().scope_depth == 0 {
                let idx = self.identifier_constant(name);
                self.emit(Op::DefineGlobal);
                self.emit_u8(idx);
            } else {
                buried += 1;
            }
        }
        self.emit_op(Op::Pop, line);
    }

    fn compile_destructure_by_name(&mut self, names: &[String], line: u32) {
        let mut buried = 0u8;
        for name in names {
            if buried == 0 {
                self.emit_op(Op::Dup, line);
            } else {
                self.emit_op(Op::DupOffset, line);
                self.emit_u8(buried);
            }
            let idx = self.identifier_constant(name);
            self.emit(Op::GetProperty);
            self.emit_u8(idx);
            self.declare_variable(name);
            if self.frame().scope_depth == 0 {
                let gidx = self.identifier_constant(name);
                self.emit(Op::DefineGlobal);
                self.emit_u8(gidx);
            } else {
                buried += 1;
            }
        }
        self.emit_op(Op::Pop, line);
    }

    fn fun_declaration(&mut self) {
        self.consume(&TokenKind::Identifier, "expected function name");
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name);
        self.function(FunctionKind::Function, name.clone());
        self.define_variable(&name);
    }

    /// Parses a parameter list, a body (either `{ ... }` or `= expr` for a
    /// single-expression function), and emits `OP_CLOSURE` in the enclosing
    /// frame.
    fn function(&mut self, kind: FunctionKind, name: String) {
        self.frames.push(Frame::new(kind, Some(name.clone())));
        self.begin_scope();

        self.consume(&TokenKind::LeftParen, "expected '(' after function name");
        let mut arity: u16 = 0;
        let mut varargs = false;
        if !self.check(&TokenKind::RightParen) {
            loop {
                if arity as usize >= MAX_PARAMS {
                    self.error("too many parameters (max 255)");
                }
                self.consume(&TokenKind::Identifier, "expected parameter name");
                let pname = self.previous.lexeme.to_string();
                if self.match_token(&TokenKind::DotDotDot) {
                    varargs = true;
                }
                self.declare_local(&pname);
                arity += 1;
                if varargs || !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after parameters");
        self.frame_mut().arity = arity as u8;
        self.frame_mut().varargs = varargs;

        if self.match_token(&TokenKind::Equal) {
            self.expression();
            let line = self.line();
            self.emit_op(Op::Return, line);
            self.consume(&TokenKind::Semicolon, "expected ';' after expression body");
        } else {
            self.consume(&TokenKind::LeftBrace, "expected '{' before function body");
            self.block();
            let line = self.line();
            if matches!(kind, FunctionKind::Initializer) {
                self.emit_op(Op::GetLocal, line);
                self.emit_u8(0);
            } else {
                self.emit_op(Op::Null, line);
            }
            self.emit_op(Op::Return, line);
        }

        let finished = self.frames.pop().unwrap();
        let upvalue_count = finished.upvalues.len() as u8;
        let fname = self.gc.intern(&name);
        let func_ref = self.gc.new_function(
            Some(fname),
            finished.arity,
            finished.lambda,
            finished.varargs,
            finished.chunk,
        );
        if let ObjData::Function(f) = &mut *func_ref.data_mut() {
            f.upvalue_count = upvalue_count;
        }

        let idx = self.make_constant(Value::Obj(func_ref));
        self.emit(Op::Closure);
        self.emit_u8(idx);
        for up in &finished.upvalues {
            self.emit_u8(up.is_local as u8);
            self.emit_u8(up.index);
        }
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.frames.push(Frame::new(FunctionKind::Lambda, None));
        self.begin_scope();

        let was_pipe_pipe = self.previous.kind == TokenKind::PipePipe;
        let mut arity: u16 = 0;
        if !was_pipe_pipe {
            if !self.check(&TokenKind::Pipe) {
                loop {
                    self.consume(&TokenKind::Identifier, "expected parameter name");
                    let pname = self.previous.lexeme.to_string();
                    self.declare_local(&pname);
                    arity += 1;
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::Pipe, "expected '|' after lambda parameters");
        }
        self.frame_mut().arity = arity as u8;

        if self.match_token(&TokenKind::LeftBrace) {
            self.block();
            let line = self.line();
            self.emit_op(Op::Null, line);
            self.emit_op(Op::Return, line);
        } else {
            self.expression();
            let line = self.line();
            self.emit_op(Op::Return, line);
        }

        let finished = self.frames.pop().unwrap();
        let upvalue_count = finished.upvalues.len() as u8;
        let func_ref = self
            .gc
            .new_function(None, finished.arity, true, false, finished.chunk);
        if let ObjData::Function(f) = &mut *func_ref.data_mut() {
            f.upvalue_count = upvalue_count;
        }

        let idx = self.make_constant(Value::Obj(func_ref));
        self.emit(Op::Closure);
        self.emit_u8(idx);
        for up in &finished.upvalues {
            self.emit_u8(up.is_local as u8);
            self.emit_u8(up.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(&TokenKind::Identifier, "expected class name");
        let class_name = self.previous.lexeme.to_string();
        let line = self.line();
        self.declare_variable(&class_name);

        let idx = self.identifier_constant(&class_name);
        self.emit(Op::Class);
        self.emit_u8(idx);
        self.define_variable(&class_name);

        let mut has_superclass = false;
        if self.match_token(&TokenKind::Extends) {
            self.consume(&TokenKind::Identifier, "expected superclass name");
            let super_name = self.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("a class cannot inherit from itself");
            }
            // Pushes the superclass value once; it becomes the `super`
            // local directly and is never popped for the rest of the body.
            self.named_variable(&super_name, false);
            self.begin_scope();
            self.declare_local("super");
            self.named_variable(&class_name, false);
            self.emit_op(Op::Inherit, line); // consumes only the subclass copy
            has_superclass = true;
        } else if class_name != "Object" {
            // No explicit superclass: default to the builtin `Object`
            // class so `super` always resolves to something.
            self.named_variable("Object", false);
            self.begin_scope();
            self.declare_local("super");
            self.named_variable(&class_name, false);
            self.emit_op(Op::Inherit, line);
            has_superclass = true;
        }

        // Long-lived copy of the class value that every `method()` call
        // peeks under its own freshly pushed closure.
        self.named_variable(&class_name, false);

        if self.match_token(&TokenKind::Implements) {
            loop {
                self.consume(&TokenKind::Identifier, "expected interface name");
                let iface = self.previous.lexeme.to_string();
                self.named_variable(&iface, false);
                self.named_variable(&class_name, false);
                self.emit_op(Op::Inherit, line);
                self.emit_op(Op::Pop, line); // drop the interface value
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.classes.push(ClassCtx { has_superclass });

        self.consume(&TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.method(&class_name);
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after class body");

        self.frame_mut().chunk.emit_op(Op::Pop, line); // discard the class-for-methods copy

        self.classes.pop();
        if has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self, class_name: &str) {
        let mut name = if self.match_token(&TokenKind::Identifier) {
            self.previous.lexeme.to_string()
        } else {
            self.consume(&TokenKind::Identifier, "expected method name");
            self.previous.lexeme.to_string()
        };
        // `operator <tok>` method names: the spelling is the operator token.
        if name == "operator" {
            self.advance();
            name = format!("operator{}", self.previous.lexeme);
        }
        let kind = if name == class_name {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        let line = self.line();
        self.function(kind, name.clone());
        let idx = self.identifier_constant(&name);
        self.emit_op(Op::Method, line);
        self.emit_u8(idx);
    }

    fn import_declaration(&mut self) {
        let (path, line) = self.parse_import_path();
        let alias = if self.match_token(&TokenKind::As) {
            self.consume(&TokenKind::Identifier, "expected alias after 'as'");
            self.previous.lexeme.to_string()
        } else {
            path.rsplit('/').next().unwrap_or(&path).to_string()
        };
        self.consume(&TokenKind::Semicolon, "expected ';' after import");

        let path_idx = self.identifier_constant(&path);
        let file_idx = self.identifier_constant(&path);
        self.emit_op(Op::Import, line);
        self.emit_u8(path_idx);
        self.emit_u8(file_idx);
        self.declare_variable(&alias);
        self.define_variable(&alias);
    }

    fn from_import_declaration(&mut self) {
        let (path, line) = self.parse_import_path();
        self.consume(&TokenKind::Import, "expected 'import' after module path");

        if self.match_token(&TokenKind::Star) {
            if self.frame().scope_depth != 0 {
                self.error("'from ... import *' is only legal at global scope");
            }
            self.consume(&TokenKind::Semicolon, "expected ';' after import");
            let path_idx = self.identifier_constant(&path);
            let file_idx = self.identifier_constant(&path);
            self.emit_op(Op::ImportStar, line);
            self.emit_u8(path_idx);
            self.emit_u8(file_idx);
            return;
        }

        let path_idx = self.identifier_constant(&path);
        let file_idx = self.identifier_constant(&path);
        self.emit_op(Op::Import, line);
        self.emit_u8(path_idx);
        self.emit_u8(file_idx);

        let mut names = Vec::new();
        loop {
            self.consume(&TokenKind::Identifier, "expected imported name");
            names.push(self.previous.lexeme.to_string());
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::Semicolon, "expected ';' after import");

        for (i, name) in names.iter().enumerate() {
            if i + 1 < names.len() {
                self.emit_op(Op::Dup, line);
            }
            let idx = self.identifier_constant(name);
            self.emit_op(Op::GetProperty, line);
            self.emit_u8(idx);
            self.declare_variable(name);
            self.define_variable(name);
        }
    }

    fn parse_import_path(&mut self) -> (String, u32) {
        self.consume(&TokenKind::Identifier, "expected module path");
        let line = self.line();
        let mut parts = vec![self.previous.lexeme.to_string()];
        while self.match_token(&TokenKind::Dot) {
            self.consume(&TokenKind::Identifier, "expected identifier in module path");
            parts.push(self.previous.lexeme.to_string());
        }
        (parts.join("/"), line)
    }

    fn export_statement(&mut self) {
        let line = self.line();
        if self.frame().scope_depth != 0 {
            self.error("'export' is only legal at global scope");
        }
        self.expression();
        self.consume(&TokenKind::As, "expected 'as' after exported value");
        self.consume(&TokenKind::Identifier, "expected export name");
        let name = self.previous.lexeme.to_string();
        self.consume(&TokenKind::Semicolon, "expected ';' after export");
        let idx = self.identifier_constant(&name);
        self.emit_op(Op::Export, line);
        self.emit_u8(idx);
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn statement(&mut self) {
        if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.match_token(&TokenKind::Switch) {
            self.switch_statement(false);
        } else if self.match_token(&TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(&TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(&TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        let line = self.line();
        self.consume(&TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(Op::Pop, line);
    }

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(&TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);

        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.frame_mut().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });

        self.consume(&TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(&TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.statement();
        self.patch_continue_jumps(loop_start);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.patch_break_jumps();
    }

    fn patch_continue_jumps(&mut self, loop_start: usize) {
        let ctx = self.frame_mut().loops.last_mut().unwrap();
        let jumps = std::mem::take(&mut ctx.continue_jumps);
        for at in jumps {
            self.frame_mut().chunk.patch_jump(at);
        }
        let _ = loop_start;
    }

    fn patch_break_jumps(&mut self) {
        let ctx = self.frame_mut().loops.pop().unwrap();
        for at in ctx.break_jumps {
            self.frame_mut().chunk.patch_jump(at);
        }
    }

    fn for_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'for'");
        self.begin_scope();

        if self.match_token(&TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_offset();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
        }

        if !self.check(&TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.current_offset();
            self.expression();
            let line = self.line();
            self.emit_op(Op::Pop, line);
            self.consume(&TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            self.patch_jump(body_jump);
            loop_start = increment_start;
        } else {
            self.consume(&TokenKind::RightParen, "expected ')' after for clauses");
        }

        self.frame_mut().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });

        self.statement();
        self.patch_continue_jumps(loop_start);
        self.emit_loop(loop_start);

        if let Some(at) = exit_jump {
            self.patch_jump(at);
        }
        self.patch_break_jumps();
        self.end_scope();
    }

    /// `foreach(var x in expr) body` desugars to the classic
    /// `iter = expr.iterator(); while (!iter.done()) { x = iter.next(); body }`.
    fn foreach_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'foreach'");
        self.consume(&TokenKind::Var, "expected 'var' in foreach binding");
        self.consume(&TokenKind::Identifier, "expected loop variable name");
        let var_name = self.previous.lexeme.to_string();
        self.consume(&TokenKind::In, "expected 'in' in foreach binding");
        let line = self.line();

        self.begin_scope();
        self.expression();
        let iter_name = self.identifier_constant("iterator");
        self.emit_op(Op::Invoke, line);
        self.emit_u8(iter_name);
        self.emit_u8(0);
        self.consume(&TokenKind::RightParen, "expected ')' after foreach clause");
        // `iter` becomes an unnamed local holding the iterator.
        self.declare_local("");
        let iter_slot = (self.frame().locals.len() - 1) as u8;

        self.emit_op(Op::Null, line); // placeholder slot for the loop variable
        self.declare_local(&var_name);
        let var_slot = (self.frame().locals.len() - 1) as u8;

        let loop_start = self.current_offset();
        self.frame_mut().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });

        self.emit_op(Op::GetLocal, line);
        self.emit_u8(iter_slot);
        let done_name = self.identifier_constant("done");
        self.emit_op(Op::Invoke, line);
        self.emit_u8(done_name);
        self.emit_u8(0);
        let exit_jump = self.emit_jump(Op::JumpIfFalseS);
        self.emit_op(Op::Pop, line); // drop the `done()` boolean on the taken branch

        self.emit_op(Op::GetLocal, line);
        self.emit_u8(iter_slot);
        let next_name = self.identifier_constant("next");
        self.emit_op(Op::Invoke, line);
        self.emit_u8(next_name);
        self.emit_u8(0);
        self.emit_op(Op::SetLocal, line);
        self.emit_u8(var_slot);
        self.emit_op(Op::Pop, line);

        self.statement();
        self.patch_continue_jumps(loop_start);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop, line); // the `done()` boolean that short-circuited the loop
        self.patch_break_jumps();
        self.end_scope();
    }

    /// Handles both statement and expression `switch`. `as_expression`
    /// leaves the matched arm's value on the stack; the statement form
    /// discards it.
    fn switch_statement(&mut self, as_expression: bool) {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'switch'");
        self.expression();
        self.consume(&TokenKind::RightParen, "expected ')' after switch subject");
        self.consume(&TokenKind::LeftBrace, "expected '{' before switch body");

        self.frame_mut().loops.push(LoopCtx {
            continue_target: 0,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });

        let mut end_jumps = Vec::new();
        let mut had_else = false;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let line = self.line();
            let is_else = self.match_token(&TokenKind::Else);
            if is_else {
                had_else = true;
            } else {
                self.emit_op(Op::Dup, line);
                self.compile_pattern();
            }
            let mismatch_jump = if !is_else {
                self.emit_jump(Op::JumpIfFalse)
            } else {
                usize::MAX
            };
            self.consume(&TokenKind::Colon, "expected ':' after switch pattern");

            if as_expression {
                self.expression();
            } else {
                self.statement();
                if self.match_token(&TokenKind::Break) {
                    self.consume(&TokenKind::Semicolon, "expected ';' after break");
                }
            }
            end_jumps.push(self.emit_jump(Op::Jump));
            if mismatch_jump != usize::MAX {
                self.patch_jump(mismatch_jump);
            }
            if is_else {
                break;
            }
        }
        let line = self.line();
        if !had_else {
            if as_expression {
                self.emit_op(Op::Null, line);
            }
        }
        for at in end_jumps {
            self.patch_jump(at);
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after switch body");
        self.emit_op(Op::Pop, line); // discard the subject
        if !as_expression {
            // statement form already discarded each arm's value
        }
        self.frame_mut().loops.pop();
    }

    /// Compiles one switch-arm pattern. The caller has already duplicated
    /// the subject onto the stack; this consumes that copy (plus whatever
    /// it parses) and leaves a single boolean behind.
    fn compile_pattern(&mut self) {
        let line = self.line();
        if self.match_token(&TokenKind::Bang) {
            // `!<pattern>`: the nested pattern consumes the same subject
            // copy this call was handed; negate its resulting boolean.
            self.compile_pattern();
            self.emit_op(Op::Not, line);
            return;
        }
        if self.match_token(&TokenKind::In) {
            self.expression_no_assign();
            self.emit_op(Op::In, line);
            return;
        }
        if self.match_token(&TokenKind::Is) {
            self.expression_no_assign();
            self.emit_op(Op::Is, line);
            return;
        }
        if self.match_token(&TokenKind::Pipe) {
            // `|expr`: apply `expr` as a one-argument predicate to the
            // switched value. Stack holds [subject] after the caller's
            // `Dup`; push the predicate, swap so the callee is beneath its
            // argument, then call it with the subject as the sole arg.
            self.expression_no_assign();
            self.emit_op(Op::Swap, line);
            self.emit_op(Op::Call, line);
            self.emit_u8(1);
            return;
        }
        self.expression_no_assign();
        self.emit_op(Op::Equal, line);
    }

    fn expression_no_assign(&mut self) {
        self.parse_precedence(Precedence::Ternary.next());
    }

    fn try_statement(&mut self) {
        let line = self.line();
        let try_begin = self.emit_jump(Op::TryBegin);
        self.statement();
        self.emit_op(Op::TryEnd, line);
        let finally_start = self.emit_jump(Op::Jump);
        self.patch_jump(try_begin);

        self.consume(&TokenKind::Catch, "expected 'catch' after try block");
        self.begin_scope();
        let mut has_param = false;
        if self.match_token(&TokenKind::LeftParen) {
            self.consume(&TokenKind::Identifier, "expected exception parameter name");
            let pname = self.previous.lexeme.to_string();
            self.declare_local(&pname);
            has_param = true;
            self.consume(&TokenKind::RightParen, "expected ')' after catch parameter");
        }
        if !has_param {
            self.emit_op(Op::Pop, line);
        }
        self.statement();
        self.end_scope();
        self.patch_jump(finally_start);

        if self.match_token(&TokenKind::Finally) {
            self.statement();
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        let line = self.line();
        self.consume(&TokenKind::Semicolon, "expected ';' after thrown value");
        self.emit_op(Op::Throw, line);
    }

    fn return_statement(&mut self) {
        let line = self.line();
        if matches!(self.frame().kind, FunctionKind::Script) {
            self.error("cannot return from top-level code");
        }
        if self.match_token(&TokenKind::Semicolon) {
            self.emit_implicit_return(line);
        } else {
            if matches!(self.frame().kind, FunctionKind::Initializer) {
                self.error("cannot return a value from an initializer");
            }
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(Op::Return, line);
        }
    }

    fn emit_implicit_return(&mut self, line: u32) {
        if matches!(self.frame().kind, FunctionKind::Initializer) {
            self.emit_op(Op::GetLocal, line);
            self.emit_u8(0);
        } else {
            self.emit_op(Op::Null, line);
        }
        self.emit_op(Op::Return, line);
    }

    fn break_statement(&mut self) {
        self.consume(&TokenKind::Semicolon, "expected ';' after 'break'");
        if self.frame().loops.is_empty() {
            self.error("'break' outside loop");
            return;
        }
        let jump = self.emit_jump(Op::Jump);
        self.frame_mut().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(&TokenKind::Semicolon, "expected ';' after 'continue'");
        if self.frame().loops.is_empty() {
            self.error("'continue' outside loop");
            return;
        }
        let jump = self.emit_jump(Op::Jump);
        self.frame_mut().loops.last_mut().unwrap().continue_jumps.push(jump);
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn expression(&mut self) {
        self.frame_mut().lvalue = Lvalue::None;
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(can_assign) {
            self.error("expected expression");
            return;
        }

        while precedence <= infix_precedence(&self.current.kind) {
            self.advance();
            self.infix(can_assign);
        }

        if can_assign && self.match_assignment_token() {
            self.error("invalid assignment target");
        }
    }

    fn match_assignment_token(&mut self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::PercentEqual
                | TokenKind::AmpEqual
                | TokenKind::PipeEqual
                | TokenKind::CaretEqual
                | TokenKind::ShiftLeftEqual
                | TokenKind::ShiftRightEqual
                | TokenKind::UnsignedShiftRightEqual
        )
    }

    fn prefix(&mut self, can_assign: bool) -> bool {
        match self.previous.kind.clone() {
            TokenKind::Number(n) => self.number(n),
            TokenKind::String(ref s) => self.string(s.clone()),
            TokenKind::True => self.emit(Op::True),
            TokenKind::False => self.emit(Op::False),
            TokenKind::Null => self.emit(Op::Null),
            TokenKind::Identifier => {
                let name = self.previous.lexeme.to_string();
                self.named_variable(&name, can_assign);
            }
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::Minus => self.unary(Op::Negate),
            TokenKind::Bang => self.unary(Op::Not),
            TokenKind::Tilde => self.unary(Op::BitwiseNot),
            TokenKind::Typeof => self.unary(Op::Typeof),
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.prefix_incdec(),
            TokenKind::Pipe | TokenKind::PipePipe => self.lambda(can_assign),
            TokenKind::Switch => self.switch_statement(true),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, can_assign: bool) {
        match self.previous.kind.clone() {
            TokenKind::Plus => self.binary(Op::Add, Precedence::Term),
            TokenKind::Minus => self.binary(Op::Sub, Precedence::Term),
            TokenKind::Star => self.binary(Op::Mul, Precedence::Factor),
            TokenKind::Slash => self.binary(Op::Div, Precedence::Factor),
            TokenKind::Percent => self.binary(Op::Mod, Precedence::Factor),
            TokenKind::Amp => self.binary(Op::BitwiseAnd, Precedence::BitAnd),
            TokenKind::Pipe => self.binary(Op::BitwiseOr, Precedence::BitOr),
            TokenKind::CaretOp => self.binary(Op::Xor, Precedence::Xor),
            TokenKind::ShiftLeft => self.binary(Op::Lsh, Precedence::Shift),
            TokenKind::ShiftRight => self.binary(Op::Rsh, Precedence::Shift),
            TokenKind::UnsignedShiftRight => self.binary(Op::Ash, Precedence::Shift),
            TokenKind::EqualEqual => self.binary(Op::Equal, Precedence::Equality),
            TokenKind::BangEqual => {
                self.binary(Op::Equal, Precedence::Equality);
                self.emit(Op::Not);
            }
            TokenKind::Less => self.binary(Op::Less, Precedence::Comparison),
            TokenKind::LessEqual => self.binary(Op::LessEq, Precedence::Comparison),
            TokenKind::Greater => self.binary(Op::Greater, Precedence::Comparison),
            TokenKind::GreaterEqual => self.binary(Op::GreaterEq, Precedence::Comparison),
            TokenKind::Is => self.binary(Op::Is, Precedence::Equality),
            TokenKind::In => self.binary(Op::In, Precedence::Equality),
            TokenKind::Implements => self.binary(Op::Implements, Precedence::Equality),
            TokenKind::DotDot => self.binary(Op::Range, Precedence::Range),
            TokenKind::AmpAmp | TokenKind::And => self.and_expr(),
            TokenKind::PipePipe | TokenKind::Or => self.or_expr(),
            TokenKind::PipeArrow => self.pipe_expr(),
            TokenKind::Question => self.ternary_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::LeftBracket => self.index_expr(can_assign),
            TokenKind::Dot => self.dot_expr(can_assign),
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.postfix_incdec(),
            TokenKind::Equal
            | TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::PercentEqual
            | TokenKind::AmpEqual
            | TokenKind::PipeEqual
            | TokenKind::CaretEqual
            | TokenKind::ShiftLeftEqual
            | TokenKind::ShiftRightEqual
            | TokenKind::UnsignedShiftRightEqual => self.finish_assignment(),
            _ => {}
        }
    }

    fn number(&mut self, n: f64) {
        self.emit_constant(Value::Number(n));
    }

    fn string(&mut self, s: String) {
        let obj = self.gc.intern(&s);
        self.emit_constant(Value::Obj(obj));
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(&TokenKind::RightParen, "expected ')' after expression");
    }

    fn list_literal(&mut self) {
        let line = self.line();
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count as usize > 255 {
                    self.error("too many list elements in one literal");
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RightBracket) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBracket, "expected ']' after list elements");
        self.emit_op(Op::List, line);
        self.emit_u8(count as u8);
    }

    fn unary(&mut self, op: Op) {
        let line = self.line();
        self.parse_precedence(Precedence::Unary);
        self.emit_op(op, line);
    }

    fn binary(&mut self, op: Op, precedence: Precedence) {
        let line = self.line();
        self.parse_precedence(precedence.next());
        self.emit_op(op, line);
    }

    fn and_expr(&mut self) {
        let line = self.line();
        let end_jump = self.emit_jump(Op::JumpIfFalseS);
        self.emit_op(Op::Pop, line);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let line = self.line();
        let else_jump = self.emit_jump(Op::JumpIfFalseS);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop, line);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `a |> f` compiles to `f(a)`.
    fn pipe_expr(&mut self) {
        let line = self.line();
        self.parse_precedence(Precedence::Pipe.next());
        // Stack is [a, f]; swap so the call convention (callee, args...)
        // holds, then call with one argument.
        self.emit_op(Op::Swap, line);
        self.emit_op(Op::Call, line);
        self.emit_u8(1);
    }

    /// `cond ? a : b`. The `:` branch defaults to `null` when omitted.
    fn ternary_expr(&mut self) {
        let line = self.line();
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        self.parse_precedence(Precedence::Ternary);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        if self.match_token(&TokenKind::Colon) {
            self.parse_precedence(Precedence::Ternary);
        } else {
            self.emit_op(Op::Null, line);
        }
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let line = self.line();
        let arg_count = self.argument_list();
        self.emit_op(Op::Call, line);
        self.emit_u8(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count as usize > 255 {
                    self.error("too many arguments in call (max 255)");
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after arguments");
        count as u8
    }

    fn index_expr(&mut self, can_assign: bool) {
        let line = self.line();
        self.expression();
        self.consume(&TokenKind::RightBracket, "expected ']' after index");

        if can_assign && self.match_assignment_token() {
            let op = Self::compound_op(&self.current.kind);
            self.advance(); // consume the assignment token
            if let Some(op) = op {
                self.emit_op(Op::DupOffset, line);
                self.emit_u8(1);
                self.emit_op(Op::DupOffset, line);
                self.emit_u8(1);
                self.emit_op(Op::GetIndex, line);
                self.expression();
                self.emit_op(op, line);
            } else {
                self.expression();
            }
            self.emit_op(Op::SetIndex, line);
        } else {
            self.emit_op(Op::GetIndex, line);
        }
        self.frame_mut().lvalue = Lvalue::Index;
    }

    fn dot_expr(&mut self, can_assign: bool) {
        let line = self.line();
        self.consume(&TokenKind::Identifier, "expected property name after '.'");
        let name = self.previous.lexeme.to_string();
        let idx = self.identifier_constant(&name);

        if self.match_token(&TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(Op::Invoke, line);
            self.emit_u8(idx);
            self.emit_u8(arg_count);
            return;
        }

        if can_assign && self.match_assignment_token() {
            let op = Self::compound_op(&self.current.kind);
            self.advance();
            if let Some(op) = op {
                self.emit_op(Op::Dup, line);
                self.emit_op(Op::GetProperty, line);
                self.emit_u8(idx);
                self.expression();
                self.emit_op(op, line);
            } else {
                self.expression();
            }
            self.emit_op(Op::SetProperty, line);
            self.emit_u8(idx);
        } else {
            self.emit_op(Op::GetProperty, line);
            self.emit_u8(idx);
        }
        self.frame_mut().lvalue = Lvalue::Property(idx);
    }

    /// Maps a compound-assignment token to the binary op it expands to;
    /// `None` for plain `=`. Callers pass whichever token currently holds
    /// the assign-op: `index_expr`/`dot_expr` check `self.current` before
    /// consuming it, while `finish_assignment` is entered with the assign
    /// token already consumed into `self.previous`.
    fn compound_op(kind: &TokenKind) -> Option<Op> {
        match kind {
            TokenKind::Equal => None,
            TokenKind::PlusEqual => Some(Op::Add),
            TokenKind::MinusEqual => Some(Op::Sub),
            TokenKind::StarEqual => Some(Op::Mul),
            TokenKind::SlashEqual => Some(Op::Div),
            TokenKind::PercentEqual => Some(Op::Mod),
            TokenKind::AmpEqual => Some(Op::BitwiseAnd),
            TokenKind::PipeEqual => Some(Op::BitwiseOr),
            TokenKind::CaretEqual => Some(Op::Xor),
            TokenKind::ShiftLeftEqual => Some(Op::Lsh),
            TokenKind::ShiftRightEqual => Some(Op::Rsh),
            TokenKind::UnsignedShiftRightEqual => Some(Op::Ash),
            _ => None,
        }
    }

    fn finish_assignment(&mut self) {
        // Only reached for the bare identifier / global / local / upvalue
        // case: `dot`/`index` already consumed their own assignment token.
        // `parse_precedence` already advanced past the assign-op token to
        // get here (mirroring `binary()`), so it sits in `self.previous`
        // and `self.current` is already the first token of the RHS.
        let line = self.line();
        let op = Self::compound_op(&self.previous.kind);
        let lvalue = self.frame().lvalue.clone();
        match lvalue {
            Lvalue::Local(slot) => {
                if let Some(op) = op {
                    self.emit_op(Op::GetLocal, line);
                    self.emit_u8(slot);
                    self.expression();
                    self.emit_op(op, line);
                } else {
                    self.expression();
                }
                self.emit_op(Op::SetLocal, line);
                self.emit_u8(slot);
            }
            Lvalue::Upvalue(slot) => {
                if let Some(op) = op {
                    self.emit_op(Op::GetUpvalue, line);
                    self.emit_u8(slot);
                    self.expression();
                    self.emit_op(op, line);
                } else {
                    self.expression();
                }
                self.emit_op(Op::SetUpvalue, line);
                self.emit_u8(slot);
            }
            Lvalue::Global(idx) => {
                if let Some(op) = op {
                    self.emit_op(Op::GetGlobal, line);
                    self.emit_u8(idx);
                    self.expression();
                    self.emit_op(op, line);
                } else {
                    self.expression();
                }
                self.emit_op(Op::SetGlobal, line);
                self.emit_u8(idx);
            }
            _ => self.error("invalid assignment target"),
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let line = self.line();
        if let Some(slot) = Self::resolve_local(self.frame(), name) {
            if can_assign {
                self.frame_mut().lvalue = Lvalue::Local(slot);
                // `finish_assignment` fetches its own operand when the
                // assignment is compound, and needs no operand at all for
                // plain `=`; emitting it here too would leave it stranded
                // under the assignment's result.
                if self.match_assignment_token() {
                    return;
                }
            }
            self.emit_op(Op::GetLocal, line);
            self.emit_u8(slot);
            return;
        }
        let frame_idx = self.frames.len() - 1;
        if let Some(slot) = Self::resolve_upvalue(&mut self.frames, frame_idx, name) {
            if can_assign {
                self.frame_mut().lvalue = Lvalue::Upvalue(slot);
                if self.match_assignment_token() {
                    return;
                }
            }
            self.emit_op(Op::GetUpvalue, line);
            self.emit_u8(slot);
            return;
        }
        let idx = self.identifier_constant(name);
        if can_assign {
            self.frame_mut().lvalue = Lvalue::Global(idx);
            if self.match_assignment_token() {
                return;
            }
        }
        self.emit_op(Op::GetGlobal, line);
        self.emit_u8(idx);
    }

    /// Resolved like any other name rather than hard-coded to local slot 0,
    /// so a lambda nested inside a method captures the enclosing `this` as
    /// an upvalue instead of reading its own (unrelated) slot 0.
    fn this_expr(&mut self) {
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        match self.classes.last() {
            None => self.error("'super' can only be used inside a class"),
            Some(c) if !c.has_superclass => self.error("'super' used in a class with no superclass"),
            _ => {}
        }
        let line = self.line();
        self.consume(&TokenKind::Dot, "expected '.' after 'super'");
        self.consume(&TokenKind::Identifier, "expected superclass method name");
        let name = self.previous.lexeme.to_string();
        let idx = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(&TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(Op::SuperInvoke, line);
            self.emit_u8(idx);
            self.emit_u8(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op(Op::GetSuper, line);
            self.emit_u8(idx);
        }
    }

    /// Prefix `++x` / `--x`: parses the operand as an lvalue, then emits the
    /// in-place op followed by a store back through the same lvalue path.
    fn prefix_incdec(&mut self) {
        let is_inc = self.previous.kind == TokenKind::PlusPlus;
        let line = self.line();
        self.parse_precedence(Precedence::Unary);
        let lvalue = self.frame().lvalue.clone();
        let op = if is_inc { Op::Increment } else { Op::Decrement };
        match lvalue {
            Lvalue::Local(slot) => {
                self.emit_op(op, line);
                self.emit_op(Op::SetLocal, line);
                self.emit_u8(slot);
            }
            Lvalue::Upvalue(slot) => {
                self.emit_op(op, line);
                self.emit_op(Op::SetUpvalue, line);
                self.emit_u8(slot);
            }
            Lvalue::Global(idx) => {
                self.emit_op(op, line);
                self.emit_op(Op::SetGlobal, line);
                self.emit_u8(idx);
            }
            _ => self.error("invalid operand for prefix increment/decrement"),
        }
    }

    /// Postfix `x++` / `x--`: duplicates the pre-increment value so the
    /// expression yields the original, then stores the incremented value.
    fn postfix_incdec(&mut self) {
        let is_inc = self.previous.kind == TokenKind::PlusPlus;
        let line = self.line();
        let lvalue = self.frame().lvalue.clone();
        let op = if is_inc { Op::Increment } else { Op::Decrement };
        match lvalue {
            Lvalue::Local(slot) => {
                self.emit_op(Op::Dup, line);
                self.emit_op(op, line);
                self.emit_op(Op::SetLocal, line);
                self.emit_u8(slot);
                self.emit_op(Op::Pop, line);
            }
            Lvalue::Upvalue(slot) => {
                self.emit_op(Op::Dup, line);
                self.emit_op(op, line);
                self.emit_op(Op::SetUpvalue, line);
                self.emit_u8(slot);
                self.emit_op(Op::Pop, line);
            }
            Lvalue::Global(idx) => {
                self.emit_op(Op::Dup, line);
                self.emit_op(op, line);
                self.emit_op(Op::SetGlobal, line);
                self.emit_u8(idx);
                self.emit_op(Op::Pop, line);
            }
            _ => self.error("invalid operand for postfix increment/decrement"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(source: &str) -> Chunk {
        let mut gc = Gc::new();
        let func = compile(source, &mut gc).unwrap_or_else(|e| panic!("compile error: {:?}", e));
        match &mut *func.data_mut() {
            ObjData::Function(f) => std::mem::replace(&mut f.chunk, Chunk::new()),
            _ => unreachable!(),
        }
    }

    fn compile_errors(source: &str) -> Vec<CompileError> {
        let mut gc = Gc::new();
        compile(source, &mut gc).expect_err("expected a compile error")
    }

    #[test]
    fn simple_script_ends_with_null_return() {
        let chunk = chunk_of("var x = 1;");
        assert_eq!(chunk.code.last().copied(), Some(Op::Return as u8));
    }

    #[test]
    fn too_many_parameters_is_a_compile_error() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("function f({}) {{ }}", params.join(", "));
        let errors = compile_errors(&source);
        assert!(errors.iter().any(|e| e.message.contains("too many parameters")));
    }

    #[test]
    fn two_hundred_fifty_five_parameters_is_accepted() {
        let params: Vec<String> = (0..255).map(|i| format!("p{i}")).collect();
        let source = format!("function f({}) {{ }}", params.join(", "));
        let mut gc = Gc::new();
        assert!(compile(&source, &mut gc).is_ok());
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let errors = compile_errors("break;");
        assert!(errors.iter().any(|e| e.message.to_lowercase().contains("break")));
    }

    #[test]
    fn continue_outside_loop_is_a_compile_error() {
        let errors = compile_errors("continue;");
        assert!(errors.iter().any(|e| e.message.to_lowercase().contains("continue")));
    }

    #[test]
    fn assigning_to_an_rvalue_is_a_compile_error() {
        let errors = compile_errors("1 + 2 = 3;");
        assert!(!errors.is_empty());
    }

    #[test]
    fn duplicate_local_in_same_scope_is_a_compile_error() {
        let errors = compile_errors("{ var a = 1; var a = 2; }");
        assert!(errors.iter().any(|e| e.message.to_lowercase().contains("duplicate")));
    }

    #[test]
    fn errors_accumulate_past_one_statement_boundary() {
        let errors = compile_errors("break; continue; var ok = 1;");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn if_statement_emits_a_patched_jump_over_the_else_branch() {
        let chunk = chunk_of("if (true) { 1; } else { 2; }");
        assert!(chunk.code.contains(&(Op::JumpIfFalse as u8)));
        assert!(chunk.code.contains(&(Op::Jump as u8)));
    }

    #[test]
    fn while_loop_emits_a_backward_loop_instruction() {
        let chunk = chunk_of("while (false) { }");
        assert!(chunk.code.contains(&(Op::Loop as u8)));
    }

    #[test]
    fn ternary_emits_jump_if_false_and_jump() {
        let chunk = chunk_of("true ? 1 : 2;");
        assert!(chunk.code.contains(&(Op::JumpIfFalse as u8)));
        assert!(chunk.code.contains(&(Op::Jump as u8)));
    }

    #[test]
    fn ternary_without_colon_defaults_the_false_branch_to_null() {
        // One `Op::Null` for the omitted `:` branch, one for the script's
        // own implicit trailing return.
        let chunk = chunk_of("true ? 1;");
        let null_count = chunk.code.iter().filter(|&&b| b == Op::Null as u8).count();
        assert_eq!(null_count, 2);
    }
}
