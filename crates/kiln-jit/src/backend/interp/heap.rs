//! Reference-counting host heap for the reference executor
//!
//! `RefHeap` implements every [`HostFn`] over a small object model and
//! tracks each reference it hands out. Tests use it to check that compiled
//! code releases exactly what it owns: after a run, [`RefHeap::live`] must be
//! back at its starting value and [`RefHeap::audit`] must pass.

use kiln_bytecode::{CmpOp, Constant, NbOp};
use rustc_hash::FxHashMap;

use crate::host::{HostFn, UnaryOp};

use super::{HostRuntime, Raised, Value};

/// Handle to a heap object; `ObjRef::NULL` is the absent reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    pub fn is_null(self) -> bool {
        self == ObjRef::NULL
    }
}

impl std::fmt::Display for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Callables the heap provides as globals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Range,
    Len,
}

/// A heap object
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjRef>),
    List(Vec<ObjRef>),
    Dict(Vec<(ObjRef, ObjRef)>),
    Range { start: i64, stop: i64, step: i64 },
    /// Iterator over a snapshot of a sequence's items
    SeqIter { items: Vec<ObjRef>, next: usize },
    RangeIter { next: i64, stop: i64, step: i64 },
    /// Cell content, null when empty
    Cell(ObjRef),
    Exception { kind: String, arg: ObjRef },
    ExceptionType(String),
    Builtin(Builtin),
    Module(String),
    /// Object with settable attributes
    Namespace(Vec<(String, ObjRef)>),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Range { .. } => "range",
            Object::SeqIter { .. } | Object::RangeIter { .. } => "iterator",
            Object::Cell(_) => "cell",
            Object::Exception { .. } => "exception",
            Object::ExceptionType(_) => "type",
            Object::Builtin(_) => "builtin_function",
            Object::Module(_) => "module",
            Object::Namespace(_) => "namespace",
        }
    }

    /// References this object owns
    fn children(&self) -> Vec<ObjRef> {
        match self {
            Object::Tuple(items) | Object::List(items) => items.clone(),
            Object::Dict(entries) => entries.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            Object::SeqIter { items, next } => items[*next..].to_vec(),
            Object::Cell(content) => vec![*content],
            Object::Exception { arg, .. } => vec![*arg],
            Object::Namespace(attrs) => attrs.iter().map(|(_, v)| *v).collect(),
            _ => Vec::new(),
        }
    }
}

/// Contract violations detected by the heap
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("{0} released more often than it was referenced")]
    OverRelease(ObjRef),
    #[error("{0} used after it was freed")]
    UseAfterFree(ObjRef),
    #[error("execution lock released twice")]
    DoubleRelease,
    #[error("execution lock acquired while held")]
    DoubleAcquire,
    #[error("execution lock still released at the end")]
    LockNotReacquired,
}

#[derive(Debug)]
struct Entry {
    object: Option<Object>,
    refs: u32,
}

const EXCEPTION_TYPES: &[&str] = &[
    "Exception",
    "ValueError",
    "TypeError",
    "KeyError",
    "IndexError",
    "NameError",
    "UnboundLocalError",
    "AttributeError",
    "ZeroDivisionError",
    "OverflowError",
    "RuntimeError",
    "StopIteration",
];

/// Reference-counting object heap
#[derive(Debug)]
pub struct RefHeap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    none: ObjRef,
    true_: ObjRef,
    false_: ObjRef,
    globals: FxHashMap<String, ObjRef>,
    /// Exception set by a failing call, owned by the heap
    active: ObjRef,
    /// Exception being handled, owned by the heap
    handled: ObjRef,
    lock_released: bool,
    lock_brackets: usize,
    violations: Vec<HeapError>,
    allocated: usize,
    freed: usize,
}

impl Default for RefHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RefHeap {
    /// A heap holding the singletons, the builtin callables and the
    /// exception types as globals
    pub fn new() -> Self {
        let mut heap = RefHeap {
            entries: vec![Entry { object: None, refs: 0 }],
            free: Vec::new(),
            none: ObjRef::NULL,
            true_: ObjRef::NULL,
            false_: ObjRef::NULL,
            globals: FxHashMap::default(),
            active: ObjRef::NULL,
            handled: ObjRef::NULL,
            lock_released: false,
            lock_brackets: 0,
            violations: Vec::new(),
            allocated: 0,
            freed: 0,
        };
        heap.none = heap.alloc(Object::None);
        heap.true_ = heap.alloc(Object::Bool(true));
        heap.false_ = heap.alloc(Object::Bool(false));
        let range = heap.alloc(Object::Builtin(Builtin::Range));
        heap.set_global("range", range);
        let len = heap.alloc(Object::Builtin(Builtin::Len));
        heap.set_global("len", len);
        for kind in EXCEPTION_TYPES {
            let ty = heap.alloc(Object::ExceptionType(kind.to_string()));
            heap.set_global(kind, ty);
        }
        heap
    }

    // ===== Allocation & Inspection =====

    /// Allocate `object` with one reference
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.allocated += 1;
        let entry = Entry { object: Some(object), refs: 1 };
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = entry;
                ObjRef(index)
            }
            None => {
                self.entries.push(entry);
                ObjRef(self.entries.len() as u32 - 1)
            }
        }
    }

    pub fn int(&mut self, value: i64) -> ObjRef {
        self.alloc(Object::Int(value))
    }

    pub fn str(&mut self, value: impl Into<String>) -> ObjRef {
        self.alloc(Object::Str(value.into()))
    }

    /// Build a list, stealing `items`
    pub fn list(&mut self, items: Vec<ObjRef>) -> ObjRef {
        self.alloc(Object::List(items))
    }

    /// A new reference to `None`
    pub fn none(&mut self) -> ObjRef {
        self.incref(self.none);
        self.none
    }

    pub fn is_none(&self, obj: ObjRef) -> bool {
        obj == self.none
    }

    fn boxed_bool(&mut self, flag: bool) -> ObjRef {
        let obj = if flag { self.true_ } else { self.false_ };
        self.incref(obj);
        obj
    }

    pub fn get(&self, obj: ObjRef) -> Option<&Object> {
        self.entries.get(obj.0 as usize).and_then(|e| e.object.as_ref())
    }

    fn get_mut(&mut self, obj: ObjRef) -> Option<&mut Object> {
        self.entries.get_mut(obj.0 as usize).and_then(|e| e.object.as_mut())
    }

    pub fn refcount(&self, obj: ObjRef) -> u32 {
        self.entries.get(obj.0 as usize).map_or(0, |e| e.refs)
    }

    pub fn as_int(&self, obj: ObjRef) -> Option<i64> {
        match self.get(obj)? {
            Object::Int(v) => Some(*v),
            Object::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Objects currently alive, the heap's own roots included
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.object.is_some()).count()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn freed(&self) -> usize {
        self.freed
    }

    /// Number of completed release/acquire brackets of the execution lock
    pub fn lock_brackets(&self) -> usize {
        self.lock_brackets
    }

    /// Render an object for display
    pub fn repr(&self, obj: ObjRef) -> String {
        let Some(object) = self.get(obj) else { return obj.to_string() };
        let seq = |items: &[ObjRef]| {
            items.iter().map(|i| self.repr(*i)).collect::<Vec<_>>().join(", ")
        };
        match object {
            Object::None => "None".to_string(),
            Object::Bool(b) => (if *b { "True" } else { "False" }).to_string(),
            Object::Int(v) => v.to_string(),
            Object::Float(v) => format!("{:?}", v),
            Object::Str(s) => format!("{:?}", s),
            Object::Tuple(items) if items.len() == 1 => format!("({},)", seq(items)),
            Object::Tuple(items) => format!("({})", seq(items)),
            Object::List(items) => format!("[{}]", seq(items)),
            Object::Dict(entries) => {
                let body: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.repr(*k), self.repr(*v)))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            Object::Range { start, stop, step } => format!("range({}, {}, {})", start, stop, step),
            Object::Exception { kind, arg } if self.is_none(*arg) => format!("{}()", kind),
            Object::Exception { kind, arg } => format!("{}({})", kind, self.repr(*arg)),
            Object::ExceptionType(kind) => format!("<class '{}'>", kind),
            Object::Module(name) => format!("<module '{}'>", name),
            other => format!("<{}>", other.type_name()),
        }
    }

    // ===== Globals & Exceptions =====

    /// Bind a global, stealing `value`
    pub fn set_global(&mut self, name: &str, value: ObjRef) {
        if let Some(old) = self.globals.insert(name.to_string(), value) {
            self.decref(old);
        }
    }

    pub fn global(&self, name: &str) -> Option<ObjRef> {
        self.globals.get(name).copied()
    }

    /// Take the active exception, transferring its reference
    pub fn take_exception(&mut self) -> Option<ObjRef> {
        let exc = std::mem::replace(&mut self.active, ObjRef::NULL);
        (!exc.is_null()).then_some(exc)
    }

    /// Exception kind of `obj`, if it is an exception
    pub fn exception_kind(&self, obj: ObjRef) -> Option<&str> {
        match self.get(obj)? {
            Object::Exception { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Set a new exception of `kind` with a string argument
    pub fn raise_new(&mut self, kind: &str, message: &str) -> Raised {
        let arg = self.str(message);
        let exc = self.alloc(Object::Exception { kind: kind.to_string(), arg });
        self.set_active(exc)
    }

    /// Make `exc` the active exception, stealing it
    fn set_active(&mut self, exc: ObjRef) -> Raised {
        let old = std::mem::replace(&mut self.active, exc);
        if !old.is_null() {
            self.decref(old);
        }
        Raised
    }

    /// Report every contract violation seen so far
    pub fn audit(&self) -> Result<(), HeapError> {
        if let Some(first) = self.violations.first() {
            return Err(first.clone());
        }
        if self.lock_released {
            return Err(HeapError::LockNotReacquired);
        }
        Ok(())
    }

    pub fn violations(&self) -> &[HeapError] {
        &self.violations
    }

    // ===== Reference Counting =====

    pub fn incref(&mut self, obj: ObjRef) {
        match self.entries.get_mut(obj.0 as usize) {
            Some(entry) if entry.object.is_some() => entry.refs += 1,
            _ => self.violations.push(HeapError::UseAfterFree(obj)),
        }
    }

    pub fn decref(&mut self, obj: ObjRef) {
        let mut pending = vec![obj];
        while let Some(obj) = pending.pop() {
            if obj.is_null() {
                continue;
            }
            let Some(entry) = self.entries.get_mut(obj.0 as usize) else {
                self.violations.push(HeapError::UseAfterFree(obj));
                continue;
            };
            if entry.object.is_none() || entry.refs == 0 {
                self.violations.push(HeapError::OverRelease(obj));
                continue;
            }
            entry.refs -= 1;
            if entry.refs == 0 {
                if let Some(object) = entry.object.take() {
                    pending.extend(object.children());
                }
                self.free.push(obj.0);
                self.freed += 1;
            }
        }
    }

    fn checked(&mut self, obj: ObjRef) -> Result<&Object, Raised> {
        if self.get(obj).is_none() {
            self.violations.push(HeapError::UseAfterFree(obj));
            return Err(self.raise_new("RuntimeError", "invalid object reference"));
        }
        self.get(obj).ok_or(Raised)
    }

    // ===== Object Semantics =====

    fn truthy(&self, obj: ObjRef) -> bool {
        match self.get(obj) {
            Some(Object::None) | None => false,
            Some(Object::Bool(b)) => *b,
            Some(Object::Int(v)) => *v != 0,
            Some(Object::Float(v)) => *v != 0.0,
            Some(Object::Str(s)) => !s.is_empty(),
            Some(Object::Tuple(items)) | Some(Object::List(items)) => !items.is_empty(),
            Some(Object::Dict(entries)) => !entries.is_empty(),
            Some(Object::Range { start, stop, step }) => range_len(*start, *stop, *step) > 0,
            Some(_) => true,
        }
    }

    /// Value equality for the hashable-ish subset, identity otherwise
    fn equal(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Some(Object::Str(x)), Some(Object::Str(y))) => x == y,
            (Some(Object::Float(x)), Some(Object::Float(y))) => x == y,
            (Some(Object::Tuple(x)), Some(Object::Tuple(y)))
            | (Some(Object::List(x)), Some(Object::List(y))) => {
                x.len() == y.len() && x.iter().zip(y).all(|(p, q)| self.equal(*p, *q))
            }
            _ => match (self.number(a), self.number(b)) {
                (Some(Number::Int(x)), Some(Number::Int(y))) => x == y,
                (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                _ => false,
            },
        }
    }

    fn number(&self, obj: ObjRef) -> Option<Number> {
        match self.get(obj)? {
            Object::Int(v) => Some(Number::Int(*v)),
            Object::Bool(b) => Some(Number::Int(*b as i64)),
            Object::Float(v) => Some(Number::Float(*v)),
            _ => None,
        }
    }

    fn type_error(&mut self, message: String) -> Raised {
        self.raise_new("TypeError", &message)
    }

    fn type_name(&self, obj: ObjRef) -> &'static str {
        self.get(obj).map_or("null", Object::type_name)
    }

    fn binary(&mut self, op: NbOp, lhs: ObjRef, rhs: ObjRef) -> Result<ObjRef, Raised> {
        let base = op.base();
        match (self.number(lhs), self.number(rhs)) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => return self.int_binary(base, a, b),
            (Some(a), Some(b)) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                let value = match base {
                    NbOp::Add => a + b,
                    NbOp::Subtract => a - b,
                    NbOp::Multiply => a * b,
                    NbOp::TrueDivide | NbOp::FloorDivide | NbOp::Remainder if b == 0.0 => {
                        return Err(self.raise_new("ZeroDivisionError", "float division by zero"));
                    }
                    NbOp::TrueDivide => a / b,
                    NbOp::FloorDivide => (a / b).floor(),
                    NbOp::Remainder => a - b * (a / b).floor(),
                    NbOp::Power => a.powf(b),
                    _ => return Err(self.unsupported_operands(op, lhs, rhs)),
                };
                return Ok(self.alloc(Object::Float(value)));
            }
            _ => {}
        }
        let concat = match (self.get(lhs), self.get(rhs), base) {
            (Some(Object::Str(a)), Some(Object::Str(b)), NbOp::Add) => {
                Some(Object::Str(format!("{}{}", a, b)))
            }
            (Some(Object::List(a)), Some(Object::List(b)), NbOp::Add) => {
                Some(Object::List(a.iter().chain(b.iter()).copied().collect()))
            }
            (Some(Object::Tuple(a)), Some(Object::Tuple(b)), NbOp::Add) => {
                Some(Object::Tuple(a.iter().chain(b.iter()).copied().collect()))
            }
            _ => None,
        };
        match concat {
            Some(object) => {
                for child in object.children() {
                    self.incref(child);
                }
                Ok(self.alloc(object))
            }
            None => Err(self.unsupported_operands(op, lhs, rhs)),
        }
    }

    fn unsupported_operands(&mut self, op: NbOp, lhs: ObjRef, rhs: ObjRef) -> Raised {
        let message = format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            self.type_name(lhs),
            self.type_name(rhs)
        );
        self.type_error(message)
    }

    fn int_binary(&mut self, op: NbOp, a: i64, b: i64) -> Result<ObjRef, Raised> {
        let int_op = crate::ir::IntBinOp::from_nb(op);
        let value = match (op, int_op) {
            (_, Some(int_op)) => match int_op.eval(a, b) {
                Some(v) => v,
                None => return Err(self.arithmetic_error(int_op, b)),
            },
            (NbOp::TrueDivide, _) => {
                if b == 0 {
                    return Err(self.raise_new("ZeroDivisionError", "division by zero"));
                }
                return Ok(self.alloc(Object::Float(a as f64 / b as f64)));
            }
            (NbOp::Power, _) if b >= 0 => {
                match u32::try_from(b).ok().and_then(|e| a.checked_pow(e)) {
                    Some(v) => v,
                    None => return Err(self.raise_new("OverflowError", "integer overflow")),
                }
            }
            (NbOp::Power, _) => return Ok(self.alloc(Object::Float((a as f64).powf(b as f64)))),
            _ => {
                let message =
                    format!("unsupported operand type(s) for {}: 'int' and 'int'", op.symbol());
                return Err(self.type_error(message));
            }
        };
        Ok(self.int(value))
    }

    /// Set the exception a failed checked integer operation raises
    pub fn arithmetic_error(&mut self, op: crate::ir::IntBinOp, rhs: i64) -> Raised {
        use crate::ir::IntBinOp;
        match op {
            IntBinOp::FloorDiv | IntBinOp::Mod if rhs == 0 => {
                self.raise_new("ZeroDivisionError", "integer division or modulo by zero")
            }
            IntBinOp::Shl | IntBinOp::Shr if rhs < 0 => {
                self.raise_new("ValueError", "negative shift count")
            }
            _ => self.raise_new("OverflowError", "integer overflow"),
        }
    }

    fn compare(&mut self, op: CmpOp, lhs: ObjRef, rhs: ObjRef) -> Result<ObjRef, Raised> {
        let ordering = match (self.number(lhs), self.number(rhs)) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => match (self.get(lhs), self.get(rhs)) {
                (Some(Object::Str(a)), Some(Object::Str(b))) => Some(a.cmp(b)),
                _ => None,
            },
        };
        let flag = match (op, ordering) {
            (CmpOp::Eq, _) => self.equal(lhs, rhs),
            (CmpOp::Ne, _) => !self.equal(lhs, rhs),
            (CmpOp::Lt, Some(o)) => o.is_lt(),
            (CmpOp::Le, Some(o)) => o.is_le(),
            (CmpOp::Gt, Some(o)) => o.is_gt(),
            (CmpOp::Ge, Some(o)) => o.is_ge(),
            (_, None) => {
                let message = format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    self.type_name(lhs),
                    self.type_name(rhs)
                );
                return Err(self.type_error(message));
            }
        };
        Ok(self.boxed_bool(flag))
    }

    fn unary(&mut self, op: UnaryOp, operand: ObjRef) -> Result<ObjRef, Raised> {
        match (op, self.number(operand)) {
            (UnaryOp::Not, _) => {
                let flag = !self.truthy(operand);
                Ok(self.boxed_bool(flag))
            }
            (UnaryOp::Negative, Some(Number::Int(v))) => match v.checked_neg() {
                Some(v) => Ok(self.int(v)),
                None => Err(self.raise_new("OverflowError", "integer overflow")),
            },
            (UnaryOp::Negative, Some(Number::Float(v))) => Ok(self.alloc(Object::Float(-v))),
            (UnaryOp::Invert, Some(Number::Int(v))) => Ok(self.int(!v)),
            _ => {
                let message = format!(
                    "bad operand type for unary {}: '{}'",
                    op.symbol(),
                    self.type_name(operand)
                );
                Err(self.type_error(message))
            }
        }
    }

    fn index(&mut self, len: usize, key: ObjRef) -> Result<usize, Raised> {
        let Some(i) = self.as_int(key) else {
            let message = format!("indices must be integers, not '{}'", self.type_name(key));
            return Err(self.type_error(message));
        };
        let resolved = if i < 0 { i + len as i64 } else { i };
        if resolved < 0 || resolved >= len as i64 {
            return Err(self.raise_new("IndexError", "index out of range"));
        }
        Ok(resolved as usize)
    }

    fn get_item(&mut self, container: ObjRef, key: ObjRef) -> Result<ObjRef, Raised> {
        let found = match self.checked(container)?.clone() {
            Object::List(items) | Object::Tuple(items) => {
                let i = self.index(items.len(), key)?;
                items[i]
            }
            Object::Dict(entries) => match entries.iter().find(|(k, _)| self.equal(*k, key)) {
                Some((_, v)) => *v,
                None => {
                    let message = self.repr(key);
                    return Err(self.raise_new("KeyError", &message));
                }
            },
            Object::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = self.index(chars.len(), key)?;
                return Ok(self.str(chars[i].to_string()));
            }
            other => {
                let message = format!("'{}' object is not subscriptable", other.type_name());
                return Err(self.type_error(message));
            }
        };
        self.incref(found);
        Ok(found)
    }

    fn set_item(&mut self, container: ObjRef, key: ObjRef, value: ObjRef) -> Result<(), Raised> {
        let replaced = match self.checked(container)?.clone() {
            Object::List(items) => {
                let i = self.index(items.len(), key)?;
                self.incref(value);
                match self.get_mut(container) {
                    Some(Object::List(items)) => std::mem::replace(&mut items[i], value),
                    _ => return Err(Raised),
                }
            }
            Object::Dict(entries) => {
                let position = entries.iter().position(|(k, _)| self.equal(*k, key));
                self.incref(value);
                if position.is_none() {
                    self.incref(key);
                }
                match self.get_mut(container) {
                    Some(Object::Dict(entries)) => match position {
                        Some(i) => std::mem::replace(&mut entries[i].1, value),
                        None => {
                            entries.push((key, value));
                            ObjRef::NULL
                        }
                    },
                    _ => return Err(Raised),
                }
            }
            other => {
                let message =
                    format!("'{}' object does not support item assignment", other.type_name());
                return Err(self.type_error(message));
            }
        };
        self.decref(replaced);
        Ok(())
    }

    fn contains(&mut self, item: ObjRef, container: ObjRef) -> Result<bool, Raised> {
        Ok(match self.checked(container)?.clone() {
            Object::List(items) | Object::Tuple(items) => {
                items.iter().any(|i| self.equal(*i, item))
            }
            Object::Dict(entries) => entries.iter().any(|(k, _)| self.equal(*k, item)),
            Object::Str(haystack) => match self.get(item) {
                Some(Object::Str(needle)) => haystack.contains(needle.as_str()),
                _ => {
                    let message = "'in <string>' requires string as left operand".into();
                    return Err(self.type_error(message));
                }
            },
            Object::Range { start, stop, step } => match self.as_int(item) {
                Some(v) => {
                    let inside = if step > 0 {
                        start <= v && v < stop
                    } else {
                        stop < v && v <= start
                    };
                    inside && (v - start) % step == 0
                }
                None => false,
            },
            other => {
                let message = format!("argument of type '{}' is not iterable", other.type_name());
                return Err(self.type_error(message));
            }
        })
    }

    fn get_iter(&mut self, obj: ObjRef) -> Result<ObjRef, Raised> {
        match self.checked(obj)?.clone() {
            Object::List(items) | Object::Tuple(items) => {
                for item in &items {
                    self.incref(*item);
                }
                Ok(self.alloc(Object::SeqIter { items, next: 0 }))
            }
            Object::Dict(entries) => {
                let keys: Vec<ObjRef> = entries.iter().map(|(k, _)| *k).collect();
                for key in &keys {
                    self.incref(*key);
                }
                Ok(self.alloc(Object::SeqIter { items: keys, next: 0 }))
            }
            Object::Range { start, stop, step } => Ok(self.alloc(Object::RangeIter {
                next: start,
                stop,
                step,
            })),
            Object::SeqIter { .. } | Object::RangeIter { .. } => {
                self.incref(obj);
                Ok(obj)
            }
            other => {
                Err(self.type_error(format!("'{}' object is not iterable", other.type_name())))
            }
        }
    }

    /// Advance an iterator; null when exhausted
    fn iter_next(&mut self, iter: ObjRef) -> Result<ObjRef, Raised> {
        match self.get_mut(iter) {
            // The iterator's reference to the item moves to the caller.
            Some(Object::SeqIter { items, next }) => {
                let item = items.get(*next).copied().unwrap_or(ObjRef::NULL);
                if !item.is_null() {
                    *next += 1;
                }
                Ok(item)
            }
            Some(Object::RangeIter { next, stop, step }) => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return Ok(ObjRef::NULL);
                }
                let value = *next;
                *next = value.saturating_add(*step);
                Ok(self.int(value))
            }
            Some(other) => {
                let message = format!("'{}' object is not an iterator", other.type_name());
                Err(self.type_error(message))
            }
            None => Err(self.raise_new("RuntimeError", "invalid iterator")),
        }
    }

    fn call_object(&mut self, callable: ObjRef, args: &[ObjRef]) -> Result<ObjRef, Raised> {
        match self.checked(callable)?.clone() {
            Object::Builtin(Builtin::Range) => {
                let ints: Option<Vec<i64>> = args.iter().map(|a| self.as_int(*a)).collect();
                let (start, stop, step) = match ints.as_deref() {
                    Some([stop]) => (0, *stop, 1),
                    Some([start, stop]) => (*start, *stop, 1),
                    Some([start, stop, step]) => (*start, *stop, *step),
                    _ => {
                        return Err(self.type_error("range expects 1 to 3 integer arguments".into()))
                    }
                };
                if step == 0 {
                    return Err(self.raise_new("ValueError", "range() arg 3 must not be zero"));
                }
                Ok(self.alloc(Object::Range { start, stop, step }))
            }
            Object::Builtin(Builtin::Len) => {
                let len = match args.first().and_then(|a| self.get(*a)) {
                    Some(Object::List(items)) | Some(Object::Tuple(items)) => items.len() as i64,
                    Some(Object::Dict(entries)) => entries.len() as i64,
                    Some(Object::Str(s)) => s.chars().count() as i64,
                    Some(Object::Range { start, stop, step }) => range_len(*start, *stop, *step),
                    _ => return Err(self.type_error("object has no len()".into())),
                };
                Ok(self.int(len))
            }
            Object::ExceptionType(kind) => {
                let arg = match args.first() {
                    Some(&a) => {
                        self.incref(a);
                        a
                    }
                    None => self.none(),
                };
                Ok(self.alloc(Object::Exception { kind, arg }))
            }
            other => {
                Err(self.type_error(format!("'{}' object is not callable", other.type_name())))
            }
        }
    }

    /// Turn a raised operand into an exception instance, as a new reference
    fn instantiate(&mut self, exc: ObjRef) -> Result<ObjRef, Raised> {
        match self.checked(exc)?.clone() {
            Object::Exception { .. } => {
                self.incref(exc);
                Ok(exc)
            }
            Object::ExceptionType(_) => self.call_object(exc, &[]),
            _ => Err(self.type_error("exceptions must derive from BaseException".into())),
        }
    }

    fn raise(&mut self, exc: ObjRef) -> Raised {
        match self.instantiate(exc) {
            Ok(instance) => self.set_active(instance),
            Err(raised) => raised,
        }
    }

    fn exception_matches(&mut self, exc: ObjRef, ty: ObjRef) -> Result<bool, Raised> {
        let kind = self.exception_kind(exc).map(str::to_string);
        match self.checked(ty)?.clone() {
            Object::ExceptionType(expected) => {
                Ok(expected == "Exception" || kind.as_deref() == Some(&expected))
            }
            Object::Tuple(types) => {
                for t in types {
                    if self.exception_matches(exc, t)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(self.type_error(
                "catching classes that do not inherit from BaseException is not allowed".into(),
            )),
        }
    }

    fn get_attr(&mut self, obj: ObjRef, name: &str) -> Result<ObjRef, Raised> {
        let found = match self.checked(obj)?.clone() {
            Object::Namespace(attrs) => attrs.iter().find(|(n, _)| n == name).map(|(_, v)| *v),
            Object::Exception { arg, .. } if name == "args" => Some(arg),
            Object::Module(module) => {
                let qualified = format!("{}.{}", module, name);
                return Ok(self.str(qualified));
            }
            _ => None,
        };
        match found {
            Some(value) => {
                self.incref(value);
                Ok(value)
            }
            None => {
                let message =
                    format!("'{}' object has no attribute '{}'", self.type_name(obj), name);
                Err(self.raise_new("AttributeError", &message))
            }
        }
    }

    fn set_attr(&mut self, obj: ObjRef, name: &str, value: ObjRef) -> Result<(), Raised> {
        if !matches!(self.checked(obj)?, Object::Namespace(_)) {
            let message =
                format!("'{}' object has no attribute '{}'", self.type_name(obj), name);
            return Err(self.raise_new("AttributeError", &message));
        }
        self.incref(value);
        let replaced = match self.get_mut(obj) {
            Some(Object::Namespace(attrs)) => match attrs.iter_mut().find(|(n, _)| n == name) {
                Some((_, slot)) => std::mem::replace(slot, value),
                None => {
                    attrs.push((name.to_string(), value));
                    ObjRef::NULL
                }
            },
            _ => ObjRef::NULL,
        };
        self.decref(replaced);
        Ok(())
    }

    fn cell_get(&mut self, cell: ObjRef) -> Result<ObjRef, Raised> {
        match self.checked(cell)? {
            Object::Cell(content) if !content.is_null() => {
                let content = *content;
                self.incref(content);
                Ok(content)
            }
            Object::Cell(_) => {
                Err(self.raise_new("NameError", "free variable referenced before assignment"))
            }
            other => {
                let message = format!("expected a cell, found '{}'", other.type_name());
                Err(self.type_error(message))
            }
        }
    }

    fn cell_set(&mut self, cell: ObjRef, value: ObjRef) {
        self.incref(value);
        let old = match self.get_mut(cell) {
            Some(Object::Cell(content)) => std::mem::replace(content, value),
            _ => value,
        };
        self.decref(old);
    }

    fn obj_arg(&mut self, args: &[Value], i: usize) -> Result<ObjRef, Raised> {
        match args.get(i) {
            Some(Value::Obj(obj)) => Ok(*obj),
            _ => Err(self.raise_new("RuntimeError", "host call given a non-object argument")),
        }
    }

    fn name<'n>(&mut self, names: &'n [String], index: u32) -> Result<&'n str, Raised> {
        match names.get(index as usize) {
            Some(name) => Ok(name),
            None => Err(self.raise_new("RuntimeError", "name index out of range")),
        }
    }
}

fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

impl HostRuntime for RefHeap {
    fn constant(&mut self, constant: &Constant) -> ObjRef {
        match constant {
            Constant::None => self.none(),
            Constant::Bool(b) => self.boxed_bool(*b),
            Constant::Int(v) => self.int(*v),
            Constant::Float(v) => self.alloc(Object::Float(*v)),
            Constant::Str(s) => self.str(s.clone()),
            Constant::Tuple(items) => {
                let items = items.iter().map(|c| self.constant(c)).collect();
                self.alloc(Object::Tuple(items))
            }
        }
    }

    fn call(
        &mut self,
        names: &[String],
        func: HostFn,
        args: &[Value],
    ) -> Result<Option<Value>, Raised> {
        let obj = |o: ObjRef| Ok(Some(Value::Obj(o)));
        let flag = |b: bool| Ok(Some(Value::Bool(b)));
        match func {
            HostFn::GetAttr { name } => {
                let name = self.name(names, name)?;
                let target = self.obj_arg(args, 0)?;
                obj(self.get_attr(target, name)?)
            }
            HostFn::SetAttr { name } => {
                let name = self.name(names, name)?;
                let (target, value) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                self.set_attr(target, name, value)?;
                Ok(None)
            }
            HostFn::GetItem => {
                let (container, key) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                obj(self.get_item(container, key)?)
            }
            HostFn::SetItem => {
                let container = self.obj_arg(args, 0)?;
                let (key, value) = (self.obj_arg(args, 1)?, self.obj_arg(args, 2)?);
                self.set_item(container, key, value)?;
                Ok(None)
            }
            HostFn::Call { .. } => {
                let callable = self.obj_arg(args, 0)?;
                let rest: Vec<ObjRef> = (1..args.len())
                    .map(|i| self.obj_arg(args, i))
                    .collect::<Result<_, _>>()?;
                obj(self.call_object(callable, &rest)?)
            }
            HostFn::ImportName { name } => {
                let name = self.name(names, name)?.to_string();
                obj(self.alloc(Object::Module(name)))
            }
            HostFn::ImportFrom { name } => {
                let name = self.name(names, name)?;
                let module = self.obj_arg(args, 0)?;
                obj(self.get_attr(module, name)?)
            }
            HostFn::LoadGlobal { name } => {
                let name = self.name(names, name)?;
                match self.global(name) {
                    Some(value) => {
                        self.incref(value);
                        obj(value)
                    }
                    None => {
                        let message = format!("name '{}' is not defined", name);
                        Err(self.raise_new("NameError", &message))
                    }
                }
            }
            HostFn::StoreGlobal { name } => {
                let name = self.name(names, name)?;
                let value = self.obj_arg(args, 0)?;
                self.incref(value);
                self.set_global(name, value);
                Ok(None)
            }
            HostFn::BuildTuple { .. } | HostFn::BuildList { .. } => {
                let items: Vec<ObjRef> = (0..args.len())
                    .map(|i| self.obj_arg(args, i))
                    .collect::<Result<_, _>>()?;
                let object = if matches!(func, HostFn::BuildTuple { .. }) {
                    Object::Tuple(items)
                } else {
                    Object::List(items)
                };
                obj(self.alloc(object))
            }
            HostFn::BuildMap { .. } => {
                let mut entries = Vec::with_capacity(args.len() / 2);
                for pair in 0..args.len() / 2 {
                    let key = self.obj_arg(args, 2 * pair)?;
                    let value = self.obj_arg(args, 2 * pair + 1)?;
                    self.incref(key);
                    self.incref(value);
                    entries.push((key, value));
                }
                obj(self.alloc(Object::Dict(entries)))
            }
            HostFn::GetIter => {
                let target = self.obj_arg(args, 0)?;
                obj(self.get_iter(target)?)
            }
            HostFn::IterNext => {
                let iter = self.obj_arg(args, 0)?;
                obj(self.iter_next(iter)?)
            }
            HostFn::Binary(op) => {
                let (lhs, rhs) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                obj(self.binary(op, lhs, rhs)?)
            }
            HostFn::Compare(op) => {
                let (lhs, rhs) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                obj(self.compare(op, lhs, rhs)?)
            }
            HostFn::Unary(op) => {
                let operand = self.obj_arg(args, 0)?;
                obj(self.unary(op, operand)?)
            }
            HostFn::IsTrue => {
                let value = self.obj_arg(args, 0)?;
                flag(self.truthy(value))
            }
            HostFn::Is => {
                let (a, b) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                flag(a == b)
            }
            HostFn::IsNone => {
                let value = self.obj_arg(args, 0)?;
                flag(self.is_none(value))
            }
            HostFn::Contains => {
                let (item, container) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                flag(self.contains(item, container)?)
            }
            HostFn::BoxBool => match args.first() {
                Some(Value::Bool(b)) => obj(self.boxed_bool(*b)),
                _ => Err(self.raise_new("RuntimeError", "box.bool given a non-flag")),
            },
            HostFn::BoxInt => match args.first() {
                Some(Value::Int(v)) => obj(self.int(*v)),
                _ => Err(self.raise_new("RuntimeError", "box.int given a non-integer")),
            },
            HostFn::MakeCell => {
                let content = self.obj_arg(args, 0)?;
                if !content.is_null() {
                    self.incref(content);
                }
                obj(self.alloc(Object::Cell(content)))
            }
            HostFn::CellGet => {
                let cell = self.obj_arg(args, 0)?;
                obj(self.cell_get(cell)?)
            }
            HostFn::CellSet => {
                let (cell, value) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                self.cell_set(cell, value);
                Ok(None)
            }
            HostFn::ExceptionMatch => {
                let (exc, ty) = (self.obj_arg(args, 0)?, self.obj_arg(args, 1)?);
                flag(self.exception_matches(exc, ty)?)
            }
            HostFn::Raise | HostFn::RaiseFrom => {
                let exc = self.obj_arg(args, 0)?;
                Err(self.raise(exc))
            }
            HostFn::ReraiseActive => {
                let handled = self.handled;
                if handled.is_null() {
                    return Err(self.raise_new("RuntimeError", "No active exception to reraise"));
                }
                self.incref(handled);
                Err(self.set_active(handled))
            }
            HostFn::Reraise => {
                let exc = self.obj_arg(args, 0)?;
                self.incref(exc);
                Err(self.set_active(exc))
            }
            HostFn::PushExcInfo => {
                let exc = self.obj_arg(args, 0)?;
                self.incref(exc);
                let previous = std::mem::replace(&mut self.handled, exc);
                let previous = if previous.is_null() { self.none() } else { previous };
                obj(previous)
            }
            HostFn::PopExcInfo => {
                let previous = self.obj_arg(args, 0)?;
                let restored = if self.is_none(previous) {
                    self.decref(previous);
                    ObjRef::NULL
                } else {
                    previous
                };
                let old = std::mem::replace(&mut self.handled, restored);
                self.decref(old);
                Ok(None)
            }
            HostFn::GetAwaitable => {
                let value = self.obj_arg(args, 0)?;
                self.incref(value);
                obj(value)
            }
            HostFn::FrameExhausted => {
                Err(self.raise_new("RuntimeError", "cannot resume a finished frame"))
            }
        }
    }

    fn incref(&mut self, obj: ObjRef) {
        RefHeap::incref(self, obj)
    }

    fn decref(&mut self, obj: ObjRef) {
        RefHeap::decref(self, obj)
    }

    fn fetch_exception(&mut self) -> ObjRef {
        match self.take_exception() {
            Some(exc) => exc,
            None => {
                let _ = self.raise_new("RuntimeError", "no active exception");
                self.take_exception().unwrap_or(ObjRef::NULL)
            }
        }
    }

    fn raise_error(&mut self, kind: &str, message: &str) {
        let _ = self.raise_new(kind, message);
    }

    fn arithmetic_failed(&mut self, op: crate::ir::IntBinOp, rhs: i64) {
        let _ = self.arithmetic_error(op, rhs);
    }

    fn release_lock(&mut self) {
        if self.lock_released {
            self.violations.push(HeapError::DoubleRelease);
        }
        self.lock_released = true;
    }

    fn acquire_lock(&mut self) {
        if !self.lock_released {
            self.violations.push(HeapError::DoubleAcquire);
        } else {
            self.lock_brackets += 1;
        }
        self.lock_released = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(heap: &mut RefHeap, func: HostFn, args: &[ObjRef]) -> Result<Option<Value>, Raised> {
        let args: Vec<Value> = args.iter().map(|a| Value::Obj(*a)).collect();
        heap.call(&[], func, &args)
    }

    fn obj(result: Result<Option<Value>, Raised>) -> ObjRef {
        match result {
            Ok(Some(Value::Obj(o))) => o,
            other => panic!("expected an object, got {:?}", other),
        }
    }

    #[test]
    fn test_release_frees_children() {
        let mut heap = RefHeap::new();
        let baseline = heap.live();
        let a = heap.int(1);
        let b = heap.int(2);
        let list = heap.list(vec![a, b]);
        assert_eq!(heap.live(), baseline + 3);
        heap.decref(list);
        assert_eq!(heap.live(), baseline);
        assert_eq!(heap.audit(), Ok(()));
    }

    #[test]
    fn test_over_release_is_reported() {
        let mut heap = RefHeap::new();
        let x = heap.int(5);
        heap.decref(x);
        heap.decref(x);
        assert_eq!(heap.audit(), Err(HeapError::OverRelease(x)));
    }

    #[test]
    fn test_integer_arithmetic_and_errors() {
        let mut heap = RefHeap::new();
        let seven = heap.int(7);
        let two = heap.int(-2);
        let q = obj(call(&mut heap, HostFn::Binary(NbOp::FloorDivide), &[seven, two]));
        assert_eq!(heap.as_int(q), Some(-4));
        let zero = heap.int(0);
        assert!(call(&mut heap, HostFn::Binary(NbOp::Remainder), &[seven, zero]).is_err());
        let exc = heap.take_exception().unwrap();
        assert_eq!(heap.exception_kind(exc), Some("ZeroDivisionError"));
        for o in [q, zero, two, seven, exc] {
            heap.decref(o);
        }
        assert_eq!(heap.audit(), Ok(()));
    }

    #[test]
    fn test_iterating_a_list_moves_item_references() {
        let mut heap = RefHeap::new();
        let baseline = heap.live();
        let item = heap.int(10);
        let list = heap.list(vec![item]);
        let iter = obj(call(&mut heap, HostFn::GetIter, &[list]));
        let first = obj(call(&mut heap, HostFn::IterNext, &[iter]));
        assert_eq!(first, item);
        assert_eq!(heap.refcount(item), 2);
        assert!(obj(call(&mut heap, HostFn::IterNext, &[iter])).is_null());
        for o in [first, iter, list] {
            heap.decref(o);
        }
        assert_eq!(heap.live(), baseline);
    }

    #[test]
    fn test_exception_info_stack() {
        let mut heap = RefHeap::new();
        let baseline = heap.live();
        let _ = heap.raise_new("ValueError", "bad");
        let exc = heap.fetch_exception();
        let previous = obj(call(&mut heap, HostFn::PushExcInfo, &[exc]));
        assert!(heap.is_none(previous));
        let ty = heap.global("ValueError").unwrap();
        assert_eq!(
            call(&mut heap, HostFn::ExceptionMatch, &[exc, ty]),
            Ok(Some(Value::Bool(true)))
        );
        heap.decref(exc);
        call(&mut heap, HostFn::PopExcInfo, &[previous]).unwrap();
        assert_eq!(heap.live(), baseline);
        assert_eq!(heap.audit(), Ok(()));
    }

    #[test]
    fn test_lock_brackets_must_balance() {
        let mut heap = RefHeap::new();
        heap.release_lock();
        assert_eq!(heap.audit(), Err(HeapError::LockNotReacquired));
        heap.acquire_lock();
        assert_eq!(heap.lock_brackets(), 1);
        heap.acquire_lock();
        assert_eq!(heap.audit(), Err(HeapError::DoubleAcquire));
    }
}
