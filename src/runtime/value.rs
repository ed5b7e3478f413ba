//! Value representation for the reference interpreter
//!
//! Immediates (nil, booleans, fixnums, flonums, symbols) are "special
//! constants"; every other value is a heap reference. Equality and hashing
//! follow Ruby's `==` / `eql?` for the builtin types.

use super::class::ClassId;
use super::intern::Sym;
use super::vm::Block;
use num_bigint::BigInt;
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Largest fixnum (62-bit signed range)
pub const FIXNUM_MAX: i64 = (1 << 62) - 1;
/// Smallest fixnum
pub const FIXNUM_MIN: i64 = -(1 << 62);

/// Whether `n` fits in a fixnum
#[inline]
pub fn fixable(n: i128) -> bool {
    n >= FIXNUM_MIN as i128 && n <= FIXNUM_MAX as i128
}

/// Whether a float has an immediate (flonum) representation
///
/// Doubles whose exponent falls in the middle of the range are stored
/// inline; +0.0 is special-cased in, everything else is heap allocated.
#[inline]
pub fn is_flonum(x: f64) -> bool {
    let bits = x.to_bits();
    if bits == 0 {
        return true;
    }
    let top = (bits >> 60) & 0x7;
    bits != 0x3000_0000_0000_0000 && (top == 3 || top == 4)
}

/// A Ruby value
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    True,
    False,
    /// 62-bit integer
    Fixnum(i64),
    /// Integer outside the fixnum range
    Bignum(Rc<BigInt>),
    /// Double (immediate or heap depending on [`is_flonum`])
    Float(f64),
    Symbol(Sym),
    String(Rc<RefCell<String>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Hash(Rc<RefCell<HashValue>>),
    Range(Rc<RangeValue>),
    Regexp(Rc<RegexpValue>),
    Time(Rc<TimeValue>),
    Object(Rc<RefCell<ObjectValue>>),
    /// A class or module
    Class(ClassId),
    /// A block captured as a value
    Proc(Rc<Block>),
}

/// `a..b` / `a...b`
#[derive(Debug, Clone)]
pub struct RangeValue {
    pub low: Value,
    pub high: Value,
    pub exclusive: bool,
}

/// Compiled regular expression
#[derive(Debug, Clone)]
pub struct RegexpValue {
    pub source: String,
    pub regex: regex::Regex,
}

impl RegexpValue {
    pub fn new(source: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            regex: regex::Regex::new(source)?,
        })
    }

    /// Character index of the first match in `text`, as `=~` returns it
    pub fn match_index(&self, text: &str) -> Option<usize> {
        self.regex
            .find(text)
            .map(|m| text[..m.start()].chars().count())
    }
}

/// Point in time, seconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeValue {
    pub secs: f64,
}

/// Instance of a user class
#[derive(Debug, Clone)]
pub struct ObjectValue {
    pub class: ClassId,
    /// Instance variables in the class's slot order
    pub ivars: Vec<Value>,
}

impl ObjectValue {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            ivars: Vec::new(),
        }
    }

    pub fn get(&self, index: usize) -> Value {
        self.ivars.get(index).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if self.ivars.len() <= index {
            self.ivars.resize(index + 1, Value::Nil);
        }
        self.ivars[index] = value;
    }
}

/// Hash key with `eql?` semantics
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Nil,
    True,
    False,
    Int(i64),
    Big(BigInt),
    Float(u64),
    Sym(Sym),
    Str(String),
    Class(ClassId),
    /// Identity of any other heap value
    Ref(usize),
}

/// Insertion-ordered hash table
#[derive(Debug, Clone, Default)]
pub struct HashValue {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl HashValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.index
            .get(&key.hash_key())
            .map(|&i| self.entries[i].1.clone())
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        let hk = key.hash_key();
        match self.index.get(&hk) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hk, self.entries.len());
                // string keys are copied so later mutation cannot move them
                let key = match &key {
                    Value::String(s) => Value::string(s.borrow().as_str()),
                    _ => key,
                };
                self.entries.push((key, value));
            }
        }
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.index.contains_key(&key.hash_key())
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

impl Value {
    // ==================== Constructors ====================

    pub fn bool(b: bool) -> Value {
        if b {
            Value::True
        } else {
            Value::False
        }
    }

    /// Integer, promoted to a bignum outside the fixnum range
    pub fn int(n: i128) -> Value {
        if fixable(n) {
            Value::Fixnum(n as i64)
        } else {
            Value::Bignum(Rc::new(BigInt::from(n)))
        }
    }

    /// Integer from a bignum, demoted to a fixnum when it fits
    pub fn bigint(n: BigInt) -> Value {
        match i64::try_from(&n) {
            Ok(small) if fixable(small as i128) => Value::Fixnum(small),
            _ => Value::Bignum(Rc::new(n)),
        }
    }

    pub fn string(s: &str) -> Value {
        Value::String(Rc::new(RefCell::new(s.to_string())))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn hash(h: HashValue) -> Value {
        Value::Hash(Rc::new(RefCell::new(h)))
    }

    pub fn range(low: Value, high: Value, exclusive: bool) -> Value {
        Value::Range(Rc::new(RangeValue {
            low,
            high,
            exclusive,
        }))
    }

    pub fn time(secs: f64) -> Value {
        Value::Time(Rc::new(TimeValue { secs }))
    }

    // ==================== Predicates ====================

    /// Everything except nil and false
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Immediate values: not heap references
    #[inline]
    pub fn is_special_const(&self) -> bool {
        match self {
            Value::Nil | Value::True | Value::False | Value::Fixnum(_) | Value::Symbol(_) => true,
            Value::Float(x) => is_flonum(*x),
            _ => false,
        }
    }

    #[inline]
    pub fn is_fixnum(&self) -> bool {
        matches!(self, Value::Fixnum(_))
    }

    #[inline]
    pub fn is_flonum(&self) -> bool {
        matches!(self, Value::Float(x) if is_flonum(*x))
    }

    /// Float that lives on the heap
    #[inline]
    pub fn is_heap_float(&self) -> bool {
        matches!(self, Value::Float(x) if !is_flonum(*x))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    #[inline]
    pub fn is_hash(&self) -> bool {
        matches!(self, Value::Hash(_))
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Short type description for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::True => "true",
            Value::False => "false",
            Value::Fixnum(_) | Value::Bignum(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Symbol(_) => "Symbol",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Range(_) => "Range",
            Value::Regexp(_) => "Regexp",
            Value::Time(_) => "Time",
            Value::Object(_) => "Object",
            Value::Class(_) => "Class",
            Value::Proc(_) => "Proc",
        }
    }

    // ==================== Identity ====================

    /// `equal?`: same immediate or same heap object
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::True, Value::True) | (Value::False, Value::False) => true,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => match (self.heap_addr(), other.heap_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Address of the heap allocation behind a reference value
    pub fn heap_addr(&self) -> Option<usize> {
        let addr = match self {
            Value::Bignum(b) => Rc::as_ptr(b) as *const u8 as usize,
            Value::String(s) => Rc::as_ptr(s) as *const u8 as usize,
            Value::Array(a) => Rc::as_ptr(a) as *const u8 as usize,
            Value::Hash(h) => Rc::as_ptr(h) as *const u8 as usize,
            Value::Range(r) => Rc::as_ptr(r) as *const u8 as usize,
            Value::Regexp(r) => Rc::as_ptr(r) as *const u8 as usize,
            Value::Time(t) => Rc::as_ptr(t) as *const u8 as usize,
            Value::Object(o) => Rc::as_ptr(o) as *const u8 as usize,
            Value::Proc(p) => Rc::as_ptr(p) as *const u8 as usize,
            _ => return None,
        };
        Some(addr)
    }

    /// Key for hash tables (`eql?` semantics)
    pub fn hash_key(&self) -> HashKey {
        match self {
            Value::Nil => HashKey::Nil,
            Value::True => HashKey::True,
            Value::False => HashKey::False,
            Value::Fixnum(n) => HashKey::Int(*n),
            Value::Bignum(b) => HashKey::Big((**b).clone()),
            Value::Float(x) => HashKey::Float(x.to_bits()),
            Value::Symbol(s) => HashKey::Sym(*s),
            Value::String(s) => HashKey::Str(s.borrow().clone()),
            Value::Class(c) => HashKey::Class(*c),
            other => HashKey::Ref(other.heap_addr().unwrap_or(0)),
        }
    }
}

/// Ruby `==` for builtin values; user objects compare by identity
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Fixnum(a), Value::Float(b)) | (Value::Float(b), Value::Fixnum(a)) => {
                *a as f64 == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bignum(a), Value::Bignum(b)) => a == b,
            (Value::String(a), Value::String(b)) => *a.borrow() == *b.borrow(),
            (Value::Array(a), Value::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Hash(a), Value::Hash(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a
                        .entries()
                        .iter()
                        .all(|(k, v)| b.get(k).map(|bv| bv == *v).unwrap_or(false))
            }
            (Value::Range(a), Value::Range(b)) => {
                a.low == b.low && a.high == b.high && a.exclusive == b.exclusive
            }
            (Value::Regexp(a), Value::Regexp(b)) => a.source == b.source,
            (Value::Time(a), Value::Time(b)) => a.secs == b.secs,
            _ => self.same(other),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n as i128)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}
