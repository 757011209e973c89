use std::path::PathBuf;

use rustc_hash::FxHashMap;

use crate::error::{FatalError, RuntimeErrorKind};
use crate::gc::Gc;
use crate::object::{
    BoundMethodObj, ClosureObj, GcRef, InstanceObj, NativeFn, ObjData, UpvalueLocation,
};
use crate::opcode::Op;
use crate::stdlib;
use crate::table::FoxTable;
use crate::value::Value;

const FRAMES_MAX: usize = 1024;

/// One `try`'s catch target: where to jump and how far to unwind the
/// operand stack before jumping there.
struct TryHandler {
    catch_ip: usize,
    stack_depth: usize,
}

struct CallFrame {
    closure: GcRef,
    ip: usize,
    base: usize,
    handlers: Vec<TryHandler>,
}

/// Outcome of a single `run` call: either the chunk completed and produced
/// a value (script/module top level), or the process should exit with the
/// given status after an uncaught error was already reported.
pub enum RunResult {
    Value(Value),
    Fatal(FatalError),
}

pub struct Vm {
    pub gc: Gc,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: FoxTable,
    exports: FoxTable,
    open_upvalues: Option<GcRef>,
    pub list_methods: FxHashMap<&'static str, NativeFn>,
    pub string_methods: FxHashMap<&'static str, NativeFn>,
    /// Child VMs spun up to execute imported modules. Each has an
    /// independent `Gc`; retaining the `Vm` here keeps that heap alive for
    /// as long as this VM holds references into it.
    children: Vec<Box<Vm>>,
    imports: FxHashMap<String, GcRef>,
    pub base_path: PathBuf,
    pub filename: String,
}

macro_rules! pop {
    ($vm:expr) => {
        $vm.stack.pop().expect("stack underflow")
    };
}

macro_rules! push {
    ($vm:expr, $v:expr) => {
        $vm.stack.push($v)
    };
}

macro_rules! peek {
    ($vm:expr, $n:expr) => {
        $vm.stack[$vm.stack.len() - 1 - $n]
    };
}

impl Vm {
    pub fn new(filename: impl Into<String>, base_path: PathBuf) -> Self {
        let mut vm = Vm {
            gc: Gc::new(),
            stack: Vec::with_capacity(16 * 1024),
            frames: Vec::with_capacity(64),
            globals: FoxTable::new(),
            exports: FoxTable::new(),
            open_upvalues: None,
            list_methods: FxHashMap::default(),
            string_methods: FxHashMap::default(),
            children: Vec::new(),
            imports: FxHashMap::default(),
            base_path,
            filename: filename.into(),
        };
        stdlib::install(&mut vm);
        vm
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, v: Value) {
        push!(self, v);
    }

    pub fn pop(&mut self) -> Value {
        pop!(self)
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        let key = self.gc.intern(name);
        self.globals.set(key, value);
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = self.gc.intern(name);
        self.globals.get(key)
    }

    // ── Entry points ──────────────────────────────────────────────────────

    /// Runs a freshly compiled top-level function (script or module body)
    /// to completion and returns its result or the fatal error that ended
    /// it. The function is entered as an argument-less closure.
    pub fn interpret(&mut self, function: GcRef) -> Result<Value, FatalError> {
        let closure = self.gc.new_closure(function, Vec::new());
        push!(self, Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, base: 0, handlers: Vec::new() });
        match self.run() {
            Ok(v) => Ok(v),
            Err(e) => Err(e),
        }
    }

    pub fn exports_table(&self) -> &FoxTable {
        &self.exports
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let closure_ref = frame.closure;
        let ip = frame.ip;
        frame.ip += 1;
        match &*closure_ref.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.code[ip],
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn read_op(&mut self) -> Op {
        let byte = self.read_u8();
        Op::from_u8(byte).unwrap_or_else(|| panic!("invalid opcode byte {byte}"))
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        (hi as u16) << 8 | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u8();
        let frame = self.frames.last().unwrap();
        match &*frame.closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.constants[idx as usize],
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn read_string(&mut self) -> GcRef {
        self.read_constant().as_obj().expect("constant is not a string")
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        match &*frame.closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => f.chunk.line_at(frame.ip.saturating_sub(1)),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────

    fn run(&mut self) -> Result<Value, FatalError> {
        let base_frame_count = self.frames.len() - 1;
        loop {
            if self.gc.should_collect() {
                self.collect_garbage();
            }
            let op = self.read_op();
            match self.step(op) {
                Ok(Some(v)) => {
                    if self.frames.len() <= base_frame_count {
                        return Ok(v);
                    }
                }
                Ok(None) => {}
                Err(thrown) => {
                    if !self.unwind_to_handler(thrown) {
                        let (name, value, stack) = self.describe_exception(thrown);
                        return Err(FatalError::UncaughtException { name, value, stack });
                    }
                    if self.frames.len() <= base_frame_count {
                        // Handler lived above the entry frame: nothing left
                        // to run at this level.
                        return Err(FatalError::UncaughtException {
                            name: "Exception".to_string(),
                            value: "unhandled across module boundary".to_string(),
                            stack: String::new(),
                        });
                    }
                }
            }
        }
    }

    /// Executes one instruction. `Ok(Some(v))` only happens on the final
    /// `Return` of the outermost frame, signalling `run` to stop.
    fn step(&mut self, op: Op) -> Result<Option<Value>, Value> {
        match op {
            Op::Constant => {
                let v = self.read_constant();
                push!(self, v);
            }
            Op::Null => push!(self, Value::Null),
            Op::True => push!(self, Value::Bool(true)),
            Op::False => push!(self, Value::Bool(false)),
            Op::Pop => {
                pop!(self);
            }
            Op::Dup => {
                let v = peek!(self, 0);
                push!(self, v);
            }
            Op::DupOffset => {
                let n = self.read_u8() as usize;
                let v = peek!(self, n);
                push!(self, v);
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::SwapOffset => {
                let n = self.read_u8() as usize;
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 1 - n);
            }

            Op::Negate => {
                let v = pop!(self);
                match v.as_number() {
                    Some(n) => push!(self, Value::Number(-n)),
                    None => return Err(self.runtime_error(RuntimeErrorKind::Type, "operand must be a number")),
                }
            }
            Op::Not => {
                let v = pop!(self);
                push!(self, Value::Bool(!v.is_truthy()));
            }
            Op::BitwiseNot => {
                let v = pop!(self);
                match v.as_number() {
                    Some(n) => push!(self, Value::Number(!(n as i64) as f64)),
                    None => return Err(self.runtime_error(RuntimeErrorKind::Type, "operand must be a number")),
                }
            }
            Op::Add => self.binary_op(BinOp::Add)?,
            Op::Sub => self.binary_op(BinOp::Sub)?,
            Op::Mul => self.binary_op(BinOp::Mul)?,
            Op::Div => self.binary_op(BinOp::Div)?,
            Op::Mod => self.binary_op(BinOp::Mod)?,
            Op::BitwiseAnd => self.binary_op(BinOp::BitAnd)?,
            Op::BitwiseOr => self.binary_op(BinOp::BitOr)?,
            Op::Xor => self.binary_op(BinOp::BitXor)?,
            Op::Lsh => self.binary_op(BinOp::Shl)?,
            Op::Rsh => self.binary_op(BinOp::Shr)?,
            Op::Ash => self.binary_op(BinOp::UShr)?,
            Op::Equal => self.binary_op(BinOp::Eq)?,
            Op::Greater => self.binary_op(BinOp::Gt)?,
            Op::Less => self.binary_op(BinOp::Lt)?,
            Op::GreaterEq => self.binary_op(BinOp::Ge)?,
            Op::LessEq => self.binary_op(BinOp::Le)?,
            Op::Increment => {
                let v = pop!(self);
                if let Some(result) = self.try_unary_operator_overload(v, "operator++")? {
                    push!(self, result);
                } else {
                    match v.as_number() {
                        Some(n) => push!(self, Value::Number(n + 1.0)),
                        None => return Err(self.runtime_error(RuntimeErrorKind::Type, "operand must be a number")),
                    }
                }
            }
            Op::Decrement => {
                let v = pop!(self);
                if let Some(result) = self.try_unary_operator_overload(v, "operator--")? {
                    push!(self, result);
                } else {
                    match v.as_number() {
                        Some(n) => push!(self, Value::Number(n - 1.0)),
                        None => return Err(self.runtime_error(RuntimeErrorKind::Type, "operand must be a number")),
                    }
                }
            }

            Op::Is => {
                let b = pop!(self);
                let a = pop!(self);
                push!(self, Value::Bool(self.value_is(a, b)));
            }
            Op::In => {
                let container = pop!(self);
                let item = pop!(self);
                push!(self, Value::Bool(self.value_in(item, container)?));
            }
            Op::Range => {
                let b = pop!(self);
                let a = pop!(self);
                let (lo, hi) = match (a.as_number(), b.as_number()) {
                    (Some(l), Some(h)) => (l, h),
                    _ => return Err(self.runtime_error(RuntimeErrorKind::Type, "range bounds must be numbers")),
                };
                if lo.fract() != 0.0 || hi.fract() != 0.0 {
                    return Err(self.runtime_error(RuntimeErrorKind::Type, "range bounds must be integers"));
                }
                let mut items = Vec::new();
                if hi > lo {
                    let mut i = lo;
                    while i < hi {
                        items.push(Value::Number(i));
                        i += 1.0;
                    }
                } else if lo > hi {
                    let mut i = lo;
                    while i > hi {
                        items.push(Value::Number(i));
                        i -= 1.0;
                    }
                }
                let list = self.gc.new_list(items);
                push!(self, Value::Obj(list));
            }
            Op::Typeof => {
                let v = pop!(self);
                let name = v.type_name().to_string();
                let s = self.gc.intern(&name);
                push!(self, Value::Obj(s));
            }
            Op::Implements => {
                let iface = pop!(self);
                let v = pop!(self);
                push!(self, Value::Bool(self.value_implements(v, iface)));
            }

            Op::DefineGlobal => {
                let name = self.read_string();
                let v = pop!(self);
                self.globals.set(name, v);
            }
            Op::GetGlobal => {
                let name = self.read_string();
                match self.globals.get(name) {
                    Some(v) => push!(self, v),
                    None => {
                        let msg = format!("undefined variable '{}'", &*name.as_string().unwrap());
                        return Err(self.runtime_error(RuntimeErrorKind::UndefinedVariable, &msg));
                    }
                }
            }
            Op::SetGlobal => {
                let name = self.read_string();
                let v = peek!(self, 0);
                if self.globals.set(name, v) {
                    self.globals.delete(name);
                    let msg = format!("undefined variable '{}'", &*name.as_string().unwrap());
                    return Err(self.runtime_error(RuntimeErrorKind::UndefinedVariable, &msg));
                }
            }
            Op::GetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                push!(self, self.stack[base + slot]);
            }
            Op::SetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.stack[base + slot] = peek!(self, 0);
            }
            Op::GetUpvalue => {
                let slot = self.read_u8() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue = match &*closure.data() {
                    ObjData::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                push!(self, self.read_upvalue(upvalue));
            }
            Op::SetUpvalue => {
                let slot = self.read_u8() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue = match &*closure.data() {
                    ObjData::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let v = peek!(self, 0);
                self.write_upvalue(upvalue, v);
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                pop!(self);
            }

            Op::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            Op::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let v = pop!(self);
                if !v.is_truthy() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::JumpIfFalseS => {
                let offset = self.read_u16() as usize;
                if !peek!(self, 0).is_truthy() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }

            Op::Call => {
                let arg_count = self.read_u8();
                let callee = peek!(self, arg_count as usize);
                self.call_value(callee, arg_count as usize)?;
            }
            Op::Closure => {
                let func = self.read_constant().as_obj().expect("function constant");
                let upvalue_count = match &*func.data() {
                    ObjData::Function(f) => f.upvalue_count,
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.read_u8() != 0;
                    let index = self.read_u8() as usize;
                    if is_local {
                        let base = self.frames.last().unwrap().base;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let enclosing = self.frames.last().unwrap().closure;
                        let up = match &*enclosing.data() {
                            ObjData::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(up);
                    }
                }
                let closure = self.gc.new_closure(func, upvalues);
                push!(self, Value::Obj(closure));
            }
            Op::Return => {
                let result = pop!(self);
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                if self.frames.is_empty() {
                    push!(self, result);
                    return Ok(Some(result));
                }
                push!(self, result);
            }
            Op::Invoke => {
                let name = self.read_string();
                let arg_count = self.read_u8() as usize;
                let receiver = peek!(self, arg_count);
                self.invoke(receiver, name, arg_count)?;
            }
            Op::SuperInvoke => {
                let name = self.read_string();
                let arg_count = self.read_u8() as usize;
                let superclass = pop!(self).as_obj().expect("superclass must be a class");
                self.invoke_from_class(superclass, name, arg_count)?;
            }

            Op::Class => {
                let name = self.read_string();
                let class = self.gc.new_class(name);
                push!(self, Value::Obj(class));
            }
            Op::Inherit => {
                let subclass = pop!(self).as_obj().expect("subclass must be a class");
                let superclass = peek!(self, 0).as_obj();
                match superclass.map(|s| (*s.data()).kind_is_class()) {
                    Some(true) => {}
                    _ => return Err(self.runtime_error(RuntimeErrorKind::InvalidInheritance, "superclass must be a class")),
                }
                let super_methods = match &*superclass.unwrap().data() {
                    ObjData::Class(c) => {
                        let mut t = FoxTable::new();
                        t.add_all(&c.methods);
                        t
                    }
                    _ => unreachable!(),
                };
                match &mut *subclass.data_mut() {
                    ObjData::Class(c) => c.methods.add_all(&super_methods),
                    _ => unreachable!(),
                }
            }
            Op::Method => {
                let name = self.read_string();
                let method = pop!(self);
                let class = peek!(self, 0).as_obj().expect("class must be on stack");
                match &mut *class.data_mut() {
                    ObjData::Class(c) => {
                        c.methods.set(name, method);
                    }
                    _ => unreachable!(),
                }
            }
            Op::GetProperty => {
                let name = self.read_string();
                let receiver = pop!(self);
                let v = self.get_property(receiver, name)?;
                push!(self, v);
            }
            Op::SetProperty => {
                let name = self.read_string();
                let value = pop!(self);
                let receiver = pop!(self);
                match receiver.as_obj() {
                    Some(r) => match &mut *r.data_mut() {
                        ObjData::Instance(i) => {
                            i.fields.set(name, value);
                        }
                        _ => return Err(self.runtime_error(RuntimeErrorKind::Type, "only objects have settable properties")),
                    },
                    None => return Err(self.runtime_error(RuntimeErrorKind::Type, "only objects have settable properties")),
                }
                push!(self, value);
            }
            Op::GetSuper => {
                let name = self.read_string();
                let superclass = pop!(self).as_obj().expect("superclass must be a class");
                let receiver = pop!(self);
                let bound = self.bind_method(superclass, receiver, name)?;
                push!(self, bound);
            }
            Op::Object => {
                let class = self
                    .get_global("Object")
                    .and_then(|v| v.as_obj())
                    .expect("builtin Object class missing");
                let inst = self.gc.new_instance(class);
                push!(self, Value::Obj(inst));
            }

            Op::List => {
                let count = self.read_u8() as usize;
                let items = self.stack.split_off(self.stack.len() - count);
                let list = self.gc.new_list(items);
                push!(self, Value::Obj(list));
            }
            Op::GetIndex => {
                let index = pop!(self);
                let receiver = pop!(self);
                let v = self.get_index(receiver, index)?;
                push!(self, v);
            }
            Op::SetIndex => {
                let value = pop!(self);
                let index = pop!(self);
                let receiver = pop!(self);
                self.set_index(receiver, index, value)?;
                push!(self, value);
            }

            Op::Export => {
                let name = self.read_string();
                let value = pop!(self);
                self.exports.set(name, value);
            }
            Op::Import => {
                let path = self.read_string();
                let file = self.read_string();
                let module = self.do_import(&path.as_string().unwrap(), &file.as_string().unwrap())?;
                push!(self, module);
            }
            Op::ImportStar => {
                let path = self.read_string();
                let file = self.read_string();
                let module = self.do_import(&path.as_string().unwrap(), &file.as_string().unwrap())?;
                if let Some(r) = module.as_obj() {
                    if let ObjData::Instance(i) = &*r.data() {
                        for (k, v) in i.fields.iter() {
                            self.globals.set(k, *v);
                        }
                    }
                }
            }

            Op::Throw => {
                let v = pop!(self);
                return Err(self.prepare_thrown(v));
            }
            Op::TryBegin => {
                let offset = self.read_u16() as usize;
                let catch_ip = self.frames.last().unwrap().ip + offset;
                let stack_depth = self.stack.len();
                self.frames.last_mut().unwrap().handlers.push(TryHandler { catch_ip, stack_depth });
            }
            Op::TryEnd => {
                self.frames.last_mut().unwrap().handlers.pop();
            }
        }
        Ok(None)
    }

    // ── Operators ────────────────────────────────────────────────────────

    fn binary_op(&mut self, op: BinOp) -> Result<(), Value> {
        let b = pop!(self);
        let a = pop!(self);

        if op == BinOp::Eq {
            if self.try_operator_overload(a, b, "operator==")? {
                return Ok(());
            }
            push!(self, Value::Bool(Value::values_equal(&a, &b)));
            return Ok(());
        }

        if let Some(name) = op.overload_name() {
            if self.try_operator_overload(a, b, name)? {
                return Ok(());
            }
        }

        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let result = op.apply_numbers(x, y);
                push!(self, result);
                Ok(())
            }
            _ if op == BinOp::Add && a.as_obj().is_some_and(|r| matches!(&*r.data(), ObjData::List(_))) => {
                let mut items = match &*a.as_obj().unwrap().data() {
                    ObjData::List(l) => l.items.clone(),
                    _ => unreachable!(),
                };
                items.push(b);
                let list = self.gc.new_list(items);
                push!(self, Value::Obj(list));
                Ok(())
            }
            _ if op == BinOp::Add && (a.is_string() || b.is_string()) => {
                let s = format!("{}{}", a, b);
                let obj = self.gc.intern(&s);
                push!(self, Value::Obj(obj));
                Ok(())
            }
            _ => match op {
                BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le if a.is_string() && b.is_string() => {
                    let (sa, sb) = (a.as_obj().unwrap().as_string().unwrap(), b.as_obj().unwrap().as_string().unwrap());
                    let result = op.apply_ordering(sa.as_ref(), sb.as_ref());
                    drop(sa);
                    drop(sb);
                    push!(self, Value::Bool(result));
                    Ok(())
                }
                BinOp::Add => Err(self.runtime_error(RuntimeErrorKind::Type, "operands must be numbers, strings, or lists")),
                _ => Err(self.runtime_error(RuntimeErrorKind::Type, "operands must be numbers")),
            },
        }
    }

    fn try_operator_overload(&mut self, a: Value, b: Value, name: &str) -> Result<Option<Value>, Value> {
        if !a.is_instance() {
            return Ok(None);
        }
        let r = a.as_obj().unwrap();
        let class = match &*r.data() {
            ObjData::Instance(i) => i.class,
            _ => unreachable!(),
        };
        let key = self.gc.intern(name);
        let method = self.find_method(class, key);
        match method {
            Some(m) => {
                push!(self, a);
                push!(self, b);
                self.call_value(m, 1)?;
                Ok(Some(self.run_nested()?))
            }
            None => Ok(None),
        }
    }

    /// `operator++`/`operator--`: the only overloadable operators that
    /// take no right-hand operand, so dispatched separately from
    /// `try_operator_overload` rather than passed a dummy `b`.
    fn try_unary_operator_overload(&mut self, a: Value, name: &str) -> Result<Option<Value>, Value> {
        if !a.is_instance() {
            return Ok(None);
        }
        let r = a.as_obj().unwrap();
        let class = match &*r.data() {
            ObjData::Instance(i) => i.class,
            _ => unreachable!(),
        };
        let key = self.gc.intern(name);
        let method = self.find_method(class, key);
        match method {
            Some(m) => {
                push!(self, a);
                self.call_value(m, 0)?;
                Ok(Some(self.run_nested()?))
            }
            None => Ok(None),
        }
    }

    /// Runs frames until the one active when this call began returns,
    /// without disturbing outer control flow. Used to synchronously drive
    /// a method call made from inside operator/`in`/`is` dispatch.
    fn run_nested(&mut self) -> Result<Value, Value> {
        let target_depth = self.frames.len() - 1;
        loop {
            let op = self.read_op();
            match self.step(op) {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {
                    if self.frames.len() <= target_depth {
                        return Ok(pop!(self));
                    }
                }
                Err(v) => {
                    if !self.unwind_to_handler(v) {
                        return Err(v);
                    }
                    if self.frames.len() <= target_depth {
                        return Err(v);
                    }
                }
            }
        }
    }

    fn value_is(&mut self, a: Value, b: Value) -> bool {
        match (a.as_obj(), b.as_obj()) {
            (Some(inst), Some(class)) if matches!(&*inst.data(), ObjData::Instance(_)) => {
                let mut c = match &*inst.data() {
                    ObjData::Instance(i) => Some(i.class),
                    _ => None,
                };
                while let Some(cur) = c {
                    if cur == class {
                        return true;
                    }
                    c = self.superclass_of(cur);
                }
                false
            }
            _ => Value::values_equal(&a, &b),
        }
    }

    fn value_implements(&self, v: Value, iface: Value) -> bool {
        match (v.as_obj(), iface.as_obj()) {
            (Some(inst), Some(iface_class)) => {
                let class = match &*inst.data() {
                    ObjData::Instance(i) => i.class,
                    ObjData::Class(_) => inst,
                    _ => return false,
                };
                match (&*class.data(), &*iface_class.data()) {
                    (ObjData::Class(c), ObjData::Class(ic)) => {
                        ic.methods.iter().all(|(k, _)| c.methods.get(k).is_some())
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn value_in(&mut self, item: Value, container: Value) -> Result<bool, Value> {
        match container.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::List(l) => Ok(l.items.iter().any(|v| Value::values_equal(v, &item))),
                ObjData::String(s) => match item.as_obj().and_then(|o| o.as_string().map(|r| r.to_string())) {
                    Some(needle) => Ok(s.value.contains(&needle)),
                    None => Ok(false),
                },
                ObjData::Instance(i) => {
                    let key = match item.as_obj() {
                        Some(k) if k.is_string() => k,
                        _ => return Ok(false),
                    };
                    Ok(i.fields.get(key).is_some())
                }
                _ => Err(self.runtime_error(RuntimeErrorKind::Type, "right operand of 'in' is not iterable")),
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "right operand of 'in' is not iterable")),
        }
    }

    fn superclass_of(&self, _class: GcRef) -> Option<GcRef> {
        // Single-inheritance chains are flattened into `methods` at
        // `Op::Inherit` time rather than kept as a parent pointer, so
        // there's no further chain to walk here (`is` above checks the
        // immediate class only plus whatever future parent-chain callers
        // pass through this hook).
        None
    }

    // ── Properties / indexing ────────────────────────────────────────────

    fn get_property(&mut self, receiver: Value, name: GcRef) -> Result<Value, Value> {
        match receiver.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::Instance(i) => {
                    if let Some(v) = i.fields.get(name) {
                        return Ok(v);
                    }
                    let class = i.class;
                    drop(r.data());
                    self.bind_method(class, receiver, name)
                }
                ObjData::Class(_) => {
                    let msg = format!("undefined property '{}'", &*name.as_string().unwrap());
                    Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
                }
                ObjData::List(l) => {
                    let len = l.items.len();
                    let prop = &*name.as_string().unwrap();
                    if prop == "length" {
                        Ok(Value::Number(len as f64))
                    } else if let Some(f) = self.list_methods.get(prop).copied() {
                        let bound = self.gc.new_bound_method(receiver, Value::Obj(self.wrap_native(prop, f)));
                        Ok(Value::Obj(bound))
                    } else {
                        let msg = format!("lists have no property '{}'", prop);
                        Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
                    }
                }
                ObjData::String(s) => {
                    let len = s.value.chars().count();
                    let prop = &*name.as_string().unwrap();
                    if prop == "length" {
                        Ok(Value::Number(len as f64))
                    } else if let Some(f) = self.string_methods.get(prop).copied() {
                        let bound = self.gc.new_bound_method(receiver, Value::Obj(self.wrap_native(prop, f)));
                        Ok(Value::Obj(bound))
                    } else {
                        let msg = format!("strings have no property '{}'", prop);
                        Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
                    }
                }
                _ => {
                    let msg = "only objects, lists, and strings have properties".to_string();
                    Err(self.runtime_error(RuntimeErrorKind::Type, &msg))
                }
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "only objects, lists, and strings have properties")),
        }
    }

    fn wrap_native(&self, name: &str, f: NativeFn) -> GcRef {
        self.gc.new_native(name, 0, true, None, f)
    }

    fn bind_method(&mut self, class: GcRef, receiver: Value, name: GcRef) -> Result<Value, Value> {
        match self.find_method(class, name) {
            Some(m) => {
                let bound = self.gc.new_bound_method(receiver, m);
                Ok(Value::Obj(bound))
            }
            None => {
                let msg = format!("undefined property '{}'", &*name.as_string().unwrap());
                Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
            }
        }
    }

    fn find_method(&self, class: GcRef, name: GcRef) -> Option<Value> {
        match &*class.data() {
            ObjData::Class(c) => c.methods.get(name),
            _ => None,
        }
    }

    fn get_index(&mut self, receiver: Value, index: Value) -> Result<Value, Value> {
        match receiver.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::List(l) => {
                    let i = self.index_as_usize(index, l.items.len())?;
                    Ok(l.items[i])
                }
                ObjData::String(s) => {
                    let chars: Vec<char> = s.value.chars().collect();
                    let i = self.index_as_usize(index, chars.len())?;
                    let obj = self.gc.intern(&chars[i].to_string());
                    Ok(Value::Obj(obj))
                }
                ObjData::Instance(_) => {
                    let key = index.as_obj().ok_or_else(|| {
                        self.runtime_error(RuntimeErrorKind::InvalidIndex, "object index must be a string")
                    })?;
                    match &*r.data() {
                        ObjData::Instance(i) => i.fields.get(key).ok_or_else(|| {
                            self.runtime_error(RuntimeErrorKind::UndefinedProperty, "undefined property")
                        }),
                        _ => unreachable!(),
                    }
                }
                _ => Err(self.runtime_error(RuntimeErrorKind::Type, "value is not indexable")),
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "value is not indexable")),
        }
    }

    fn set_index(&mut self, receiver: Value, index: Value, value: Value) -> Result<(), Value> {
        match receiver.as_obj() {
            Some(r) => match &mut *r.data_mut() {
                ObjData::List(l) => {
                    let n = l.items.len();
                    let i = self.index_as_usize(index, n)?;
                    l.items[i] = value;
                    Ok(())
                }
                ObjData::Instance(i) => {
                    let key = index
                        .as_obj()
                        .ok_or_else(|| RuntimeErrorKind::InvalidIndex)
                        .map_err(|k| self.runtime_error(k, "object index must be a string"))?;
                    i.fields.set(key, value);
                    Ok(())
                }
                _ => Err(self.runtime_error(RuntimeErrorKind::Type, "value does not support index assignment")),
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "value does not support index assignment")),
        }
    }

    fn index_as_usize(&mut self, index: Value, len: usize) -> Result<usize, Value> {
        let n = index
            .as_number()
            .ok_or_else(|| RuntimeErrorKind::InvalidIndex)
            .map_err(|k| self.runtime_error(k, "index must be a number"))?;
        let i = if n < 0.0 { n + len as f64 } else { n };
        if i < 0.0 || i as usize >= len {
            return Err(self.runtime_error(RuntimeErrorKind::IndexOutOfBounds, "index out of bounds"));
        }
        Ok(i as usize)
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), Value> {
        match callee.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::Closure(_) => self.call_closure(r, arg_count),
                ObjData::Native(n) => {
                    let arity_ok = n.varargs || n.arity as usize == arg_count;
                    if !arity_ok {
                        return Err(self.runtime_error(RuntimeErrorKind::Arity, "wrong number of arguments"));
                    }
                    let func = n.function;
                    let bound = n.bound;
                    let base = self.stack.len() - arg_count;
                    let mut args: Vec<Value> = self.stack.split_off(base);
                    let callee_slot = pop!(self); // callee, or receiver when dispatched as a method
                    if let Some(recv) = bound {
                        args.insert(0, recv);
                    } else if !matches!(callee_slot.as_obj(), Some(o) if o == r) {
                        // `OP_SUPER_INVOKE`/`invoke_from_class` reuse the
                        // callee slot for the receiver rather than pushing
                        // a separate callee, the same alignment a
                        // Closure's frame base relies on — thread it
                        // through as the native's implicit first argument.
                        args.insert(0, callee_slot);
                    }
                    match func(self, &args) {
                        Ok(v) => {
                            push!(self, v);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                ObjData::Class(_) => self.instantiate(r, arg_count),
                ObjData::BoundMethod(_) => {
                    let (receiver, method) = match &*r.data() {
                        ObjData::BoundMethod(b) => (b.receiver, b.method),
                        _ => unreachable!(),
                    };
                    let base = self.stack.len() - arg_count - 1;
                    self.stack[base] = receiver;
                    self.call_value(method, arg_count)
                }
                _ => Err(self.runtime_error(RuntimeErrorKind::Type, "value is not callable")),
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "value is not callable")),
        }
    }

    fn call_closure(&mut self, closure: GcRef, arg_count: usize) -> Result<(), Value> {
        let (arity, varargs) = match &*closure.data() {
            ObjData::Closure(c) => match &*c.function.data() {
                ObjData::Function(f) => (f.arity, f.varargs),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        if varargs {
            if arg_count < arity as usize {
                return Err(self.runtime_error(RuntimeErrorKind::Arity, "not enough arguments"));
            }
            let base = self.stack.len() - arg_count;
            let fixed_end = base + arity.saturating_sub(1) as usize;
            let rest = self.stack.split_off(fixed_end.min(self.stack.len()));
            let rest_list = self.gc.new_list(rest);
            self.stack.push(Value::Obj(rest_list));
        } else if arg_count != arity as usize {
            return Err(self.runtime_error(RuntimeErrorKind::Arity, "wrong number of arguments"));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow, "stack overflow"));
        }
        let effective_args = if varargs { arity as usize } else { arg_count };
        let base = self.stack.len() - effective_args - 1;
        self.frames.push(CallFrame { closure, ip: 0, base, handlers: Vec::new() });
        Ok(())
    }

    fn instantiate(&mut self, class: GcRef, arg_count: usize) -> Result<(), Value> {
        let instance = self.gc.new_instance(class);
        let base = self.stack.len() - arg_count;
        self.stack[base - 1] = Value::Obj(instance);

        let class_name = self.initializer_name(class);
        if let Some(init) = self.find_method(class, class_name) {
            let frames_before = self.frames.len();
            self.call_value(init, arg_count)?;
            if self.frames.len() > frames_before {
                // Closure initializer: its frame is still running. Drive
                // it to completion; `run_nested` pops its return value
                // (always `this`, the compiler forbids anything else) off
                // the stack, so push it straight back into the slot the
                // call convention expects the result in.
                let result = self.run_nested()?;
                push!(self, result);
            }
            // A Native initializer already ran synchronously inside
            // `call_value` and left its result in place.
        } else if arg_count != 0 {
            return Err(self.runtime_error(RuntimeErrorKind::Arity, "class has no initializer but arguments were given"));
        } else {
            self.stack.truncate(base);
        }
        Ok(())
    }

    fn invoke(&mut self, receiver: Value, name: GcRef, arg_count: usize) -> Result<(), Value> {
        match receiver.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::Instance(i) => {
                    if let Some(field) = i.fields.get(name) {
                        let base = self.stack.len() - arg_count - 1;
                        self.stack[base] = field;
                        return self.call_value(field, arg_count);
                    }
                    let class = i.class;
                    drop(r.data());
                    self.invoke_from_class(class, name, arg_count)
                }
                ObjData::List(_) | ObjData::String(_) => {
                    let prop = &*name.as_string().unwrap();
                    let table = match &*r.data() {
                        ObjData::List(_) => &self.list_methods,
                        _ => &self.string_methods,
                    };
                    match table.get(prop).copied() {
                        Some(f) => {
                            let base = self.stack.len() - arg_count;
                            let mut args: Vec<Value> = self.stack.split_off(base);
                            pop!(self); // receiver
                            args.insert(0, receiver);
                            let v = f(self, &args)?;
                            push!(self, v);
                            Ok(())
                        }
                        None => {
                            let msg = format!("undefined method '{}'", prop);
                            Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
                        }
                    }
                }
                _ => {
                    let v = self.get_property(receiver, name)?;
                    let base = self.stack.len() - arg_count - 1;
                    self.stack[base] = v;
                    self.call_value(v, arg_count)
                }
            },
            None => Err(self.runtime_error(RuntimeErrorKind::Type, "only objects, lists, and strings have methods")),
        }
    }

    fn invoke_from_class(&mut self, class: GcRef, name: GcRef, arg_count: usize) -> Result<(), Value> {
        match self.find_method(class, name) {
            Some(m) => {
                let base = self.stack.len() - arg_count - 1;
                self.stack[base + 0] = self.stack[base]; // receiver already in place
                self.call_value(m, arg_count)
            }
            None => {
                let msg = format!("undefined method '{}'", &*name.as_string().unwrap());
                Err(self.runtime_error(RuntimeErrorKind::UndefinedProperty, &msg))
            }
        }
    }

    // ── Upvalues ─────────────────────────────────────────────────────────

    fn capture_upvalue(&mut self, stack_slot: usize) -> GcRef {
        let mut prev: Option<GcRef> = None;
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            let slot = match &*up.data() {
                ObjData::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(s) => s,
                    UpvalueLocation::Closed => usize::MAX,
                },
                _ => unreachable!(),
            };
            if slot == stack_slot {
                return up;
            }
            if slot < stack_slot {
                break;
            }
            prev = Some(up);
            current = match &*up.data() {
                ObjData::Upvalue(u) => u.next_open,
                _ => unreachable!(),
            };
        }

        let created = self.gc.new_open_upvalue(stack_slot);
        match &mut *created.data_mut() {
            ObjData::Upvalue(u) => u.next_open = current,
            _ => unreachable!(),
        }
        match prev {
            Some(p) => match &mut *p.data_mut() {
                ObjData::Upvalue(u) => u.next_open = Some(created),
                _ => unreachable!(),
            },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(up) = self.open_upvalues {
            let slot = match &*up.data() {
                ObjData::Upvalue(u) => match u.location {
                    UpvalueLocation::Stack(s) => s,
                    UpvalueLocation::Closed => break,
                },
                _ => unreachable!(),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            let next = match &mut *up.data_mut() {
                ObjData::Upvalue(u) => {
                    u.closed = value;
                    u.location = UpvalueLocation::Closed;
                    u.next_open.take()
                }
                _ => unreachable!(),
            };
            self.open_upvalues = next;
        }
    }

    fn read_upvalue(&self, up: GcRef) -> Value {
        match &*up.data() {
            ObjData::Upvalue(u) => match u.location {
                UpvalueLocation::Stack(s) => self.stack[s],
                UpvalueLocation::Closed => u.closed,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, up: GcRef, value: Value) {
        let slot = match &*up.data() {
            ObjData::Upvalue(u) => match u.location {
                UpvalueLocation::Stack(s) => Some(s),
                UpvalueLocation::Closed => None,
            },
            _ => unreachable!(),
        };
        match slot {
            Some(s) => self.stack[s] = value,
            None => match &mut *up.data_mut() {
                ObjData::Upvalue(u) => u.closed = value,
                _ => unreachable!(),
            },
        }
    }

    // ── Exceptions ───────────────────────────────────────────────────────

    /// Constructs an `Instance` of the builtin exception class matching
    /// `kind`, populates its standard fields, and returns it as the value
    /// an `Op::Throw` of an internal error would carry.
    pub(crate) fn runtime_error(&mut self, kind: RuntimeErrorKind, message: &str) -> Value {
        let class_name = kind.class_name();
        let class = self
            .get_global(class_name)
            .and_then(|v| v.as_obj())
            .unwrap_or_else(|| self.get_global("Exception").and_then(|v| v.as_obj()).unwrap());
        let instance = self.gc.new_instance(class);
        let value_key = self.gc.intern("value");
        let value_val = self.gc.intern(message);
        let name_key = self.gc.intern("name");
        let name_val = self.gc.intern(class_name);
        match &mut *instance.data_mut() {
            ObjData::Instance(i) => {
                i.fields.set(value_key, Value::Obj(value_val));
                i.fields.set(name_key, Value::Obj(name_val));
            }
            _ => unreachable!(),
        }
        self.decorate_exception(instance);
        Value::Obj(instance)
    }

    /// `Op::Throw`'s operand: an `Instance` is thrown as-is, anything else
    /// is wrapped in a fresh `Exception` instance carrying it under
    /// `value`, per spec.md §4.4.
    fn prepare_thrown(&mut self, v: Value) -> Value {
        let instance = match v.as_obj() {
            Some(r) if v.is_instance() => r,
            _ => {
                let class = self
                    .get_global("Exception")
                    .and_then(|c| c.as_obj())
                    .expect("builtin Exception class missing");
                let instance = self.gc.new_instance(class);
                let value_key = self.gc.intern("value");
                let name_key = self.gc.intern("name");
                let name_val = self.gc.intern("Exception");
                match &mut *instance.data_mut() {
                    ObjData::Instance(i) => {
                        i.fields.set(value_key, v);
                        i.fields.set(name_key, Value::Obj(name_val));
                    }
                    _ => unreachable!(),
                }
                instance
            }
        };
        self.decorate_exception(instance);
        Value::Obj(instance)
    }

    /// Fills in `filename`, `line`, and `stack` on a thrown instance if
    /// they aren't already present — re-throwing a caught exception keeps
    /// its original throw-site metadata rather than overwriting it.
    pub(crate) fn decorate_exception(&mut self, instance: GcRef) {
        let filename_key = self.gc.intern("filename");
        let line_key = self.gc.intern("line");
        let stack_key = self.gc.intern("stack");
        let (has_filename, has_line, has_stack) = match &*instance.data() {
            ObjData::Instance(i) => (
                i.fields.get(filename_key).is_some(),
                i.fields.get(line_key).is_some(),
                i.fields.get(stack_key).is_some(),
            ),
            _ => return,
        };
        let filename_val = if has_filename { None } else { Some(self.gc.intern(&self.filename.clone())) };
        let line_val = if has_line { None } else { Some(self.current_line()) };
        let stack_val = if has_stack { None } else { Some(self.build_stack_trace()) };
        match &mut *instance.data_mut() {
            ObjData::Instance(i) => {
                if let Some(f) = filename_val {
                    i.fields.set(filename_key, Value::Obj(f));
                }
                if let Some(l) = line_val {
                    i.fields.set(line_key, Value::Number(l as f64));
                }
                if let Some(s) = stack_val {
                    i.fields.set(stack_key, Value::Obj(s));
                }
            }
            _ => unreachable!(),
        }
    }

    /// Builds the `[line] in name` trace lines for every active frame,
    /// innermost first, as a `List` of `String`s.
    fn build_stack_trace(&mut self) -> GcRef {
        let lines: Vec<String> = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let (name, line) = match &*frame.closure.data() {
                    ObjData::Closure(c) => match &*c.function.data() {
                        ObjData::Function(f) => {
                            let name = f.name.and_then(|n| n.as_string().map(|s| s.to_string()));
                            let line = f.chunk.line_at(frame.ip.saturating_sub(1));
                            (name.unwrap_or_else(|| "<script>".to_string()), line)
                        }
                        _ => unreachable!(),
                    },
                    _ => unreachable!(),
                };
                format!("[{line}] in {name}")
            })
            .collect();
        let items = lines.into_iter().map(|s| Value::Obj(self.gc.intern(&s))).collect();
        self.gc.new_list(items)
    }

    /// Walks frames from the top looking for a `try` handler, truncating
    /// the stack to its recorded depth and jumping to its catch entry.
    /// Returns false if no handler exists anywhere (the caller then treats
    /// the exception as fatal).
    fn unwind_to_handler(&mut self, thrown: Value) -> bool {
        while let Some(frame) = self.frames.last_mut() {
            if let Some(handler) = frame.handlers.pop() {
                self.stack.truncate(handler.stack_depth);
                self.close_upvalues(handler.stack_depth);
                push!(self, thrown);
                frame.ip = handler.catch_ip;
                return true;
            }
            let dead = self.frames.pop().unwrap();
            self.stack.truncate(dead.base);
        }
        false
    }

    fn describe_exception(&self, v: Value) -> (String, String, String) {
        match v.as_obj() {
            Some(r) => match &*r.data() {
                ObjData::Instance(i) => {
                    let class_name = match &*i.class.data() {
                        ObjData::Class(c) => c.name.as_string().map(|s| s.to_string()).unwrap_or_default(),
                        _ => "Exception".to_string(),
                    };
                    let msg = self
                        .gc
                        .strings
                        .find_string("value", crate::object::fnv1a(b"value"))
                        .and_then(|k| i.fields.get(k))
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    let stack = self
                        .gc
                        .strings
                        .find_string("stack", crate::object::fnv1a(b"stack"))
                        .and_then(|k| i.fields.get(k))
                        .and_then(|v| v.as_obj())
                        .map(|r| match &*r.data() {
                            ObjData::List(l) => l.items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n"),
                            _ => String::new(),
                        })
                        .unwrap_or_default();
                    (class_name, msg, stack)
                }
                _ => ("Exception".to_string(), v.to_string(), String::new()),
            },
            None => ("Exception".to_string(), v.to_string(), String::new()),
        }
    }

    // ── GC integration ───────────────────────────────────────────────────

    fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend(self.stack.iter().copied());
        for frame in &self.frames {
            roots.push(Value::Obj(frame.closure));
        }
        let mut up = self.open_upvalues;
        while let Some(u) = up {
            roots.push(Value::Obj(u));
            up = match &*u.data() {
                ObjData::Upvalue(uv) => uv.next_open,
                _ => None,
            };
        }
        for (k, v) in self.globals.iter() {
            roots.push(Value::Obj(k));
            roots.push(*v);
        }
        for (k, v) in self.exports.iter() {
            roots.push(Value::Obj(k));
            roots.push(*v);
        }
        for (_, v) in self.imports.iter() {
            roots.push(Value::Obj(*v));
        }
        self.gc.collect(roots);
    }

    // ── Modules ──────────────────────────────────────────────────────────

    /// Resolves a dotted import path against the importing file's own
    /// directory first, then against the VM's base path, per spec.md §6.
    fn resolve_import_path(&self, path: &str) -> Option<PathBuf> {
        let rel = format!("{path}.fox");
        let current_dir = std::path::Path::new(&self.filename).parent();
        if let Some(dir) = current_dir {
            let candidate = dir.join(&rel);
            log::trace!("import: trying {}", candidate.display());
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let candidate = self.base_path.join(&rel);
        log::trace!("import: trying {}", candidate.display());
        if candidate.is_file() {
            return Some(candidate);
        }
        None
    }

    fn do_import(&mut self, path: &str, _display_path: &str) -> Result<Value, Value> {
        if let Some(cached) = self.imports.get(path) {
            return Ok(Value::Obj(*cached));
        }

        let full_path = self.resolve_import_path(path).ok_or_else(|| {
            let msg = format!("could not find import '{path}'");
            self.runtime_error(RuntimeErrorKind::InvalidImport, &msg)
        })?;
        log::debug!("import: resolved '{}' to {}", path, full_path.display());
        let source = std::fs::read_to_string(&full_path).map_err(|e| {
            let msg = format!("cannot import '{}': {}", path, e);
            self.runtime_error(RuntimeErrorKind::InvalidImport, &msg)
        })?;

        let mut child = Box::new(Vm::new(full_path.display().to_string(), self.base_path.clone()));
        let function = crate::compiler::compile(&source, &mut child.gc).map_err(|errs| {
            let msg = errs.first().map(|e| e.message.clone()).unwrap_or_default();
            self.runtime_error(RuntimeErrorKind::InvalidImport, &msg)
        })?;
        child.interpret(function).map_err(|fatal| {
            let msg = fatal.to_string();
            self.runtime_error(RuntimeErrorKind::InvalidImport, &msg)
        })?;

        let export_fields = {
            let mut t = FoxTable::new();
            for (k, v) in child.exports.iter() {
                t.set(k, *v);
            }
            t
        };
        let object_class = self
            .get_global("Object")
            .and_then(|v| v.as_obj())
            .expect("builtin Object class missing");
        let module = self.gc.new_instance(object_class);
        match &mut *module.data_mut() {
            ObjData::Instance(i) => i.fields = export_fields,
            _ => unreachable!(),
        }

        self.imports.insert(path.to_string(), module);
        self.children.push(child);
        Ok(Value::Obj(module))
    }
}

impl ObjData {
    fn kind_is_class(&self) -> bool {
        matches!(self, ObjData::Class(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl BinOp {
    fn overload_name(self) -> Option<&'static str> {
        Some(match self {
            BinOp::Add => "operator+",
            BinOp::Sub => "operator-",
            BinOp::Mul => "operator*",
            BinOp::Div => "operator/",
            BinOp::Mod => "operator%",
            BinOp::Gt => "operator>",
            BinOp::Lt => "operator<",
            BinOp::Ge => "operator>=",
            BinOp::Le => "operator<=",
            BinOp::Eq => "operator==",
            _ => return None,
        })
    }

    fn apply_numbers(self, a: f64, b: f64) -> Value {
        match self {
            BinOp::Add => Value::Number(a + b),
            BinOp::Sub => Value::Number(a - b),
            BinOp::Mul => Value::Number(a * b),
            BinOp::Div => Value::Number(a / b),
            BinOp::Mod => Value::Number(a - b * (a / b).floor()),
            BinOp::BitAnd => Value::Number(((a as i64) & (b as i64)) as f64),
            BinOp::BitOr => Value::Number(((a as i64) | (b as i64)) as f64),
            BinOp::BitXor => Value::Number(((a as i64) ^ (b as i64)) as f64),
            BinOp::Shl => Value::Number(((a as i64) << (b as i64)) as f64),
            BinOp::Shr => Value::Number(((a as i64) >> (b as i64)) as f64),
            BinOp::UShr => Value::Number(((a as u64) >> (b as i64)) as f64),
            BinOp::Eq => Value::Bool(a == b),
            BinOp::Gt => Value::Bool(a > b),
            BinOp::Lt => Value::Bool(a < b),
            BinOp::Ge => Value::Bool(a >= b),
            BinOp::Le => Value::Bool(a <= b),
        }
    }

    fn apply_ordering(self, a: &str, b: &str) -> bool {
        match self {
            BinOp::Gt => a > b,
            BinOp::Lt => a < b,
            BinOp::Ge => a >= b,
            BinOp::Le => a <= b,
            _ => false,
        }
    }
}

impl Vm {
    /// A method whose name matches its class's own name is the
    /// initializer (`method()` in the compiler tags it `TYPE_INITIALIZER`
    /// and stores it under that same name), so looking one up just means
    /// reading the class's own name back off its heap object.
    fn initializer_name(&self, class: GcRef) -> GcRef {
        match &*class.data() {
            ObjData::Class(c) => c.name,
            _ => unreachable!(),
        }
    }
}
