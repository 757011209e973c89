//! Built-in globals, classes, and per-primitive method tables installed
//! into every freshly constructed `Vm`, mirroring `initVM`/`defineNative`
//! in the original C sources (`natives/globals.c`, `natives/objectNative.c`,
//! `natives/exception.c`, `natives/iterator.c`, `natives/list.c`,
//! `natives/string.c`) but expressed as Rust `NativeFn`s over the `Value`
//! tagged union instead of raw `Value*` C arrays.

use crate::error::RuntimeErrorKind;
use crate::object::{GcRef, NativeFn, ObjData};
use crate::table::FoxTable;
use crate::value::Value;
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    install_globals(vm);
    install_object_class(vm);
    install_exception_classes(vm);
    install_iterator_class(vm);
    install_list_methods(vm);
    install_string_methods(vm);
}

fn define_native_global(vm: &mut Vm, name: &str, arity: u8, varargs: bool, f: NativeFn) {
    let native = vm.gc.new_native(name, arity, varargs, None, f);
    vm.define_global(name, Value::Obj(native));
}

fn define_native_method(vm: &mut Vm, class: GcRef, name: &str, arity: u8, varargs: bool, f: NativeFn) {
    let key = vm.gc.intern(name);
    let native = vm.gc.new_native(name, arity, varargs, None, f);
    match &mut *class.data_mut() {
        ObjData::Class(c) => {
            c.methods.set(key, Value::Obj(native));
        }
        _ => unreachable!(),
    }
}

// ── Globals: clock, sqrt, input, read, print ────────────────────────────

fn install_globals(vm: &mut Vm) {
    define_native_global(vm, "clock", 0, false, native_clock);
    define_native_global(vm, "sqrt", 1, false, native_sqrt);
    define_native_global(vm, "input", 0, true, native_input);
    define_native_global(vm, "read", 1, false, native_read);
    define_native_global(vm, "print", 0, true, native_print);
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, Value> {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(secs))
}

fn native_sqrt(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    match args.first().and_then(|v| v.as_number()) {
        Some(n) => Ok(Value::Number(n.sqrt())),
        None => Err(vm.runtime_error(RuntimeErrorKind::Type, "expected first parameter to be a number")),
    }
}

/// Prints its arguments space-joined with no trailing newline, then reads
/// one line from stdin, per `natives/globals.c::inputNative`.
fn native_input(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    use std::io::Write;
    let prompt = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(Value::Obj(vm.gc.intern(trimmed)))
}

fn native_read(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let path_obj = args.first().and_then(|v| v.as_obj());
    let path = match path_obj {
        Some(o) if o.kind_name() == "string" => o.as_string().unwrap().to_string(),
        _ => return Err(vm.runtime_error(RuntimeErrorKind::Type, "expected first parameter to be a string")),
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(Value::Obj(vm.gc.intern(&contents))),
        Err(e) => Err(vm.runtime_error(RuntimeErrorKind::Io, &format!("cannot read '{path}': {e}"))),
    }
}

fn native_print(_vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let text = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    println!("{text}");
    Ok(Value::Null)
}

// ── Object: keys(), values(), hasProp(name) ─────────────────────────────

fn install_object_class(vm: &mut Vm) {
    let name_ref = vm.gc.intern("Object");
    let class = vm.gc.new_class(name_ref);
    define_native_method(vm, class, "keys", 0, false, object_keys);
    define_native_method(vm, class, "values", 0, false, object_values);
    define_native_method(vm, class, "hasProp", 1, false, object_has_prop);
    vm.define_global("Object", Value::Obj(class));
}

fn object_keys(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "keys() receiver must be an object"))?;
    let keys: Vec<Value> = match &*inst.data() {
        ObjData::Instance(i) => i.fields.iter().map(|(k, _)| Value::Obj(k)).collect(),
        _ => return Err(vm.runtime_error(RuntimeErrorKind::Type, "keys() receiver must be an object")),
    };
    Ok(Value::Obj(vm.gc.new_list(keys)))
}

fn object_values(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "values() receiver must be an object"))?;
    let values: Vec<Value> = match &*inst.data() {
        ObjData::Instance(i) => i.fields.iter().map(|(_, v)| *v).collect(),
        _ => return Err(vm.runtime_error(RuntimeErrorKind::Type, "values() receiver must be an object")),
    };
    Ok(Value::Obj(vm.gc.new_list(values)))
}

fn object_has_prop(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "hasProp() receiver must be an object"))?;
    let key = match args.get(1).and_then(|v| v.as_obj()) {
        Some(k) if k.kind_name() == "string" => k,
        _ => return Err(vm.runtime_error(RuntimeErrorKind::Type, "expected first parameter to be a string")),
    };
    let has = match &*inst.data() {
        ObjData::Instance(i) => i.fields.get(key).is_some(),
        _ => false,
    };
    Ok(Value::Bool(has))
}

// ── Exception & its catchable subclasses ────────────────────────────────

const EXCEPTION_SUBCLASSES: &[&str] = &[
    "ArityException",
    "TypeException",
    "InvalidOperationException",
    "InvalidIndexException",
    "IndexOutOfBoundsException",
    "UndefinedVariableException",
    "UndefinedPropertyException",
    "InvalidInheritanceException",
    "InvalidImportException",
    "IOException",
    "StackOverflowException",
];

fn install_exception_classes(vm: &mut Vm) {
    let name_ref = vm.gc.intern("Exception");
    let exception_class = vm.gc.new_class(name_ref);
    define_native_method(vm, exception_class, "Exception", 0, false, exception_init);
    define_native_method(vm, exception_class, "getStackTrace", 0, false, exception_get_stack_trace);
    vm.define_global("Exception", Value::Obj(exception_class));

    let inherited = match &*exception_class.data() {
        ObjData::Class(c) => {
            let mut t = FoxTable::new();
            t.add_all(&c.methods);
            t
        }
        _ => unreachable!(),
    };

    for name in EXCEPTION_SUBCLASSES {
        let sub_name_ref = vm.gc.intern(name);
        let sub_class = vm.gc.new_class(sub_name_ref);
        match &mut *sub_class.data_mut() {
            ObjData::Class(c) => c.methods.add_all(&inherited),
            _ => unreachable!(),
        }
        vm.define_global(name, Value::Obj(sub_class));
    }
}

/// `Exception()`'s initializer, matching `exceptionInitializer` in
/// `natives/exception.c`: sets `filename`/`line` from the throwing frame.
/// `name`/`value`/`stack` are populated separately by the VM's own
/// throw-site decoration (`Vm::decorate_exception`), which this defers to
/// so both the explicit-construction and bare-`throw` paths stay in sync.
fn exception_init(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0];
    if let Some(r) = inst.as_obj() {
        vm.decorate_exception(r);
    }
    Ok(inst)
}

fn exception_get_stack_trace(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "getStackTrace() receiver must be an exception"))?;
    let stack_key = vm.gc.intern("stack");
    let stack_val = match &*inst.data() {
        ObjData::Instance(i) => i.fields.get(stack_key),
        _ => None,
    };
    let text = match stack_val.and_then(|v| v.as_obj()) {
        Some(list_ref) => match &*list_ref.data() {
            ObjData::List(l) => l.items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n"),
            _ => String::new(),
        },
        None => String::new(),
    };
    Ok(Value::Obj(vm.gc.intern(&text)))
}

// ── Iterator ─────────────────────────────────────────────────────────────

fn install_iterator_class(vm: &mut Vm) {
    let name_ref = vm.gc.intern("Iterator");
    let class = vm.gc.new_class(name_ref);
    define_native_method(vm, class, "Iterator", 1, false, iterator_init);
    define_native_method(vm, class, "iterator", 0, false, iterator_iterator);
    define_native_method(vm, class, "next", 0, false, iterator_next);
    define_native_method(vm, class, "done", 0, false, iterator_done);
    vm.define_global("Iterator", Value::Obj(class));
}

fn iterator_init(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0];
    let data = args.get(1).copied().unwrap_or(Value::Null);
    if let Some(r) = inst.as_obj() {
        let index_key = vm.gc.intern("index");
        let data_key = vm.gc.intern("data");
        if let ObjData::Instance(i) = &mut *r.data_mut() {
            i.fields.set(index_key, Value::Number(0.0));
            i.fields.set(data_key, data);
        }
    }
    Ok(inst)
}

fn iterator_iterator(_vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    Ok(args[0])
}

/// Shared by `next()`/`done()`: reads back `data`/`index`, validating both
/// are present and `index` is a non-negative integer, exactly as
/// `iteratorNext`/`iteratorDone` in `natives/iterator.c` do before touching
/// either field.
fn iterator_state(vm: &mut Vm, inst: GcRef) -> Result<(Value, usize), Value> {
    let data_key = vm.gc.intern("data");
    let index_key = vm.gc.intern("index");
    let (data, index) = match &*inst.data() {
        ObjData::Instance(i) => (i.fields.get(data_key), i.fields.get(index_key)),
        _ => (None, None),
    };
    let data = data.ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "Iterator object must have a 'data' property"))?;
    let index = match index.and_then(|v| v.as_number()) {
        Some(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
        Some(_) => return Err(vm.runtime_error(RuntimeErrorKind::Type, "Iterator object's 'index' must be an integer")),
        None => return Err(vm.runtime_error(RuntimeErrorKind::Type, "Iterator object must have an 'index' property")),
    };
    Ok((data, index))
}

fn iterable_length(vm: &mut Vm, data: Value) -> Result<usize, Value> {
    match data.as_obj() {
        Some(r) => match &*r.data() {
            ObjData::List(l) => Ok(l.items.len()),
            ObjData::String(s) => Ok(s.value.chars().count()),
            _ => Err(vm.runtime_error(RuntimeErrorKind::Type, "Iterator object's 'data' must be a list or a string")),
        },
        None => Err(vm.runtime_error(RuntimeErrorKind::Type, "Iterator object's 'data' must be a list or a string")),
    }
}

fn iterator_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "next() receiver must be an Iterator"))?;
    let (data, index) = iterator_state(vm, inst)?;
    let len = iterable_length(vm, data)?;
    if index >= len {
        return Err(vm.runtime_error(RuntimeErrorKind::IndexOutOfBounds, "iterator index out of bounds"));
    }
    let data_ref = data.as_obj().expect("validated by iterable_length");
    let item = match &*data_ref.data() {
        ObjData::List(l) => l.items[index],
        ObjData::String(s) => {
            let ch = s.value.chars().nth(index).expect("index checked above");
            Value::Obj(vm.gc.intern(&ch.to_string()))
        }
        _ => unreachable!("validated by iterable_length"),
    };
    let index_key = vm.gc.intern("index");
    if let ObjData::Instance(i) = &mut *inst.data_mut() {
        i.fields.set(index_key, Value::Number((index + 1) as f64));
    }
    Ok(item)
}

fn iterator_done(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let inst = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "done() receiver must be an Iterator"))?;
    let (data, index) = iterator_state(vm, inst)?;
    let len = iterable_length(vm, data)?;
    Ok(Value::Bool(index >= len))
}

fn make_iterator(vm: &mut Vm, data: Value) -> Value {
    let class = vm
        .get_global("Iterator")
        .and_then(|v| v.as_obj())
        .expect("builtin Iterator class missing");
    let inst = vm.gc.new_instance(class);
    let index_key = vm.gc.intern("index");
    let data_key = vm.gc.intern("data");
    if let ObjData::Instance(i) = &mut *inst.data_mut() {
        i.fields.set(index_key, Value::Number(0.0));
        i.fields.set(data_key, data);
    }
    Value::Obj(inst)
}

// ── List: length() (special-cased in Vm::get_property), append(x), iterator() ──

fn install_list_methods(vm: &mut Vm) {
    vm.list_methods.insert("append", list_append);
    vm.list_methods.insert("iterator", list_iterator);
}

fn list_append(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    let r = args[0]
        .as_obj()
        .ok_or_else(|| vm.runtime_error(RuntimeErrorKind::Type, "append() receiver must be a list"))?;
    let value = args.get(1).copied().unwrap_or(Value::Null);
    match &mut *r.data_mut() {
        ObjData::List(l) => l.items.push(value),
        _ => return Err(vm.runtime_error(RuntimeErrorKind::Type, "append() receiver must be a list")),
    }
    Ok(Value::Null)
}

fn list_iterator(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    Ok(make_iterator(vm, args[0]))
}

// ── String: length() (special-cased in Vm::get_property), iterator() ────

fn install_string_methods(vm: &mut Vm) {
    vm.string_methods.insert("iterator", string_iterator);
}

fn string_iterator(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
    Ok(make_iterator(vm, args[0]))
}
