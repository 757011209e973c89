use std::fmt;

use crate::object::{GcRef, ObjData};

/// Tagged union of every value the VM can hold in a register or on the
/// stack. `Obj` is a thin handle into the heap; copying a `Value` never
/// copies heap data.
#[derive(Clone, Copy)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Obj(GcRef),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self.as_obj().map(|o| o.kind_name()), Some("string"))
    }

    pub fn is_instance(&self) -> bool {
        match self.as_obj() {
            Some(r) => matches!(&*r.data(), ObjData::Instance(_)),
            None => false,
        }
    }

    /// Canonical name for `typeof`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Obj(r) => match &*r.data() {
                ObjData::String(_) => "string",
                ObjData::Function(_) | ObjData::Closure(_) | ObjData::Native(_) | ObjData::BoundMethod(_) => {
                    "function"
                }
                ObjData::Class(_) => "class",
                ObjData::Instance(_) => "object",
                ObjData::List(_) => "list",
                ObjData::Upvalue(_) => "upvalue",
            },
        }
    }

    /// Structural equality for primitives; `Obj` equality is identity
    /// (strings compare equal here because interning guarantees equal
    /// strings share one reference).
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x == y,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Value::values_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Obj(r) => match &*r.data() {
                ObjData::String(s) => write!(f, "{}", s.value),
                ObjData::Function(func) => match func.name {
                    Some(name) => write!(f, "<function {}>", &*name.as_string().unwrap()),
                    None => write!(f, "<script>"),
                },
                ObjData::Closure(c) => fmt::Display::fmt(&Value::Obj(c.function), f),
                ObjData::Native(n) => write!(f, "<native {}>", n.name),
                ObjData::Class(c) => write!(f, "<class {}>", &*c.name.as_string().unwrap()),
                ObjData::Instance(i) => {
                    let class = &*i.class.data();
                    let name = match class {
                        ObjData::Class(c) => c.name,
                        _ => unreachable!(),
                    };
                    write!(f, "<object {}>", &*name.as_string().unwrap())
                }
                ObjData::BoundMethod(_) => write!(f, "<bound method>"),
                ObjData::List(l) => {
                    write!(f, "[")?;
                    for (i, item) in l.items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", item)?;
                    }
                    write!(f, "]")
                }
                ObjData::Upvalue(_) => write!(f, "<upvalue>"),
            },
        }
    }
}
