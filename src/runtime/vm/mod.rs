//! Reference interpreter for the host instruction set
//!
//! A YARV-shaped stack machine. All loaded instruction sequences share one
//! flat code space addressed by [`Pc`]. Method receivers and arguments stay
//! on the caller's operand stack while the callee runs; the callee's frame
//! records how many slots to drop when it returns.

mod cache;
mod types;

pub use cache::{CallCache, ConstCache, InlineCaches, IvarCache};
pub use types::{Block, Env, EnvRef, Frame, FrameKind};

use super::builtins::{self, NativeFn};
use super::class::{BasicOp, ClassId, ClassTable, IseqId, MethodEntry, MethodKind};
use super::intern::{Sym, SymbolTable};
use super::value::{HashValue, ObjectValue, RegexpValue, Value};
use crate::bytecode::{CallFlags, CallInfo, CheckMatchKind, Insn, IseqKind, Literal, MethodBody, Pc, Program};
use crate::error::{CodeLocation, Error, Result, RuntimeErrorKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Maximum call stack depth
const MAX_CALL_DEPTH: usize = 1024;

/// Seed of `Kernel#rand`, so runs are reproducible
const RAND_SEED: u64 = 0x5eed;

/// An instruction sequence placed in the code space
#[derive(Debug, Clone)]
pub struct LoadedIseq {
    pub name: String,
    pub kind: IseqKind,
    /// Address of the first instruction
    pub start: Pc,
    pub len: u32,
    pub params: u32,
    pub locals: u32,
    pub lines: Vec<u32>,
}

impl LoadedIseq {
    /// Whether `pc` falls inside this sequence
    pub fn contains(&self, pc: Pc) -> bool {
        pc.0 >= self.start.0 && pc.0 < self.start.0 + self.len
    }
}

/// Outcome of one interpreter step
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    /// A finish frame returned this value to native code
    Return(Value),
}

/// The reference virtual machine
pub struct Machine {
    symbols: SymbolTable,
    classes: ClassTable,
    /// Every loaded instruction, addressed by `Pc`
    code: Rc<Vec<Insn>>,
    iseqs: Vec<LoadedIseq>,
    iseq_by_name: HashMap<String, IseqId>,
    entry: Option<IseqId>,
    /// Operand stack shared by all frames
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: HashMap<Sym, Value>,
    constants: HashMap<Sym, Value>,
    class_vars: HashMap<(ClassId, Sym), Value>,
    /// Bumped on every constant assignment
    constant_state: u64,
    constants_redefined: bool,
    caches: InlineCaches,
    main: Value,
    output: String,
    echo: bool,
    rng: StdRng,
    pending_error: Option<Error>,
    instructions: u64,
    trace_events: u64,
}

impl Machine {
    /// Create a machine with all builtins installed
    pub fn new() -> Self {
        let mut machine = Self {
            symbols: SymbolTable::new(),
            classes: ClassTable::new(),
            code: Rc::new(Vec::new()),
            iseqs: Vec::new(),
            iseq_by_name: HashMap::default(),
            entry: None,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: HashMap::default(),
            constants: HashMap::default(),
            class_vars: HashMap::default(),
            constant_state: 1,
            constants_redefined: false,
            caches: InlineCaches::new(),
            main: Value::Object(Rc::new(RefCell::new(ObjectValue::new(ClassId::OBJECT)))),
            output: String::new(),
            echo: false,
            rng: StdRng::seed_from_u64(RAND_SEED),
            pending_error: None,
            instructions: 0,
            trace_events: 0,
        };
        builtins::register_builtins(&mut machine);
        machine.classes.seal_builtins();
        for id in 0..=ClassId::MATH.0 {
            let class = ClassId(id);
            let name = machine.symbols.intern(machine.classes.name(class));
            machine.constants.insert(name, Value::Class(class));
        }
        machine
    }

    // ==================== Loading ====================

    /// Load a program: place its sequences in the code space and define its
    /// classes and methods
    pub fn load(&mut self, program: &Program) -> Result<()> {
        program.validate()?;
        let code = Rc::make_mut(&mut self.code);
        let first = self.iseqs.len();
        for iseq in &program.iseqs {
            if self.iseq_by_name.contains_key(&iseq.name) {
                return Err(Error::bytecode(format!("iseq {} already loaded", iseq.name)));
            }
            let id = IseqId(self.iseqs.len() as u32);
            self.iseqs.push(LoadedIseq {
                name: iseq.name.clone(),
                kind: iseq.kind,
                start: Pc(code.len() as u32),
                len: iseq.code.len() as u32,
                params: iseq.params,
                locals: iseq.locals.max(iseq.params),
                lines: iseq.lines.clone(),
            });
            code.extend(iseq.code.iter().cloned());
            self.iseq_by_name.insert(iseq.name.clone(), id);
        }

        let mut claimed = rustc_hash::FxHashSet::default();
        for class_def in &program.classes {
            let superclass = match &class_def.superclass {
                Some(name) => Some(
                    self.classes
                        .by_name(name)
                        .ok_or_else(|| Error::bytecode(format!("unknown superclass {}", name)))?,
                ),
                None => None,
            };
            let class = self.classes.define_class(&class_def.name, superclass);
            let name = self.symbols.intern(&class_def.name);
            self.constants.insert(name, Value::Class(class));
            let meta = self.classes.meta(class);
            for (target, methods) in [(class, &class_def.methods), (meta, &class_def.singleton_methods)] {
                for method in methods {
                    let kind = match &method.body {
                        MethodBody::Iseq(iseq) => {
                            claimed.insert(iseq.as_str());
                            MethodKind::Iseq(self.iseq_id(iseq)?)
                        }
                        MethodBody::AttrReader(ivar) => MethodKind::AttrReader(self.symbols.intern(ivar)),
                        MethodBody::AttrWriter(ivar) => MethodKind::AttrWriter(self.symbols.intern(ivar)),
                    };
                    self.define_method(target, &method.name, kind);
                }
            }
        }

        // unclaimed method sequences become methods of Object
        for index in first..self.iseqs.len() {
            let iseq = &self.iseqs[index];
            if iseq.kind == IseqKind::Method && !claimed.contains(iseq.name.as_str()) {
                let name = iseq.name.clone();
                self.define_method(ClassId::OBJECT, &name, MethodKind::Iseq(IseqId(index as u32)));
            }
        }

        self.entry = Some(self.iseq_id(&program.entry)?);
        Ok(())
    }

    fn iseq_id(&self, name: &str) -> Result<IseqId> {
        self.iseq_by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::bytecode(format!("iseq {} not loaded", name)))
    }

    /// Push the top-level frame of the loaded entry sequence
    pub fn start(&mut self) -> Result<()> {
        let entry = self
            .entry
            .ok_or_else(|| Error::internal("no program loaded"))?;
        self.stack.clear();
        self.frames.clear();
        let info = &self.iseqs[entry.index()];
        let frame = Frame {
            iseq: entry,
            pc: info.start,
            self_value: self.main.clone(),
            env: Env::new(info.locals as usize, None),
            block: None,
            sp_base: 0,
            stack_args: 0,
            kind: FrameKind::Top,
            finish: true,
        };
        self.frames.push(frame);
        Ok(())
    }

    /// Run the loaded program to completion without a JIT
    pub fn run(&mut self) -> Result<Value> {
        self.start()?;
        self.run_until_finish()
    }

    // ==================== Accessors ====================

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn intern(&mut self, name: &str) -> Sym {
        self.symbols.intern(name)
    }

    pub fn symbol_name(&self, sym: Sym) -> &str {
        self.symbols.resolve(sym)
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Instruction at `pc`
    #[inline]
    pub fn fetch(&self, pc: Pc) -> Option<&Insn> {
        self.code.get(pc.index())
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn iseqs(&self) -> &[LoadedIseq] {
        &self.iseqs
    }

    pub fn iseq(&self, id: IseqId) -> &LoadedIseq {
        &self.iseqs[id.index()]
    }

    pub fn iseq_by_name(&self, name: &str) -> Option<IseqId> {
        self.iseq_by_name.get(name).copied()
    }

    /// Sequence containing `pc`
    pub fn iseq_at(&self, pc: Pc) -> Option<IseqId> {
        let idx = self.iseqs.partition_point(|i| i.start.0 <= pc.0);
        idx.checked_sub(1)
            .filter(|&i| self.iseqs[i].contains(pc))
            .map(|i| IseqId(i as u32))
    }

    /// Source position of `pc`
    pub fn location(&self, pc: Pc) -> CodeLocation {
        match self.iseq_at(pc) {
            Some(id) => {
                let info = &self.iseqs[id.index()];
                let offset = pc.0 - info.start.0;
                CodeLocation {
                    iseq: info.name.clone(),
                    line: info.lines.get(offset as usize).copied().unwrap_or(0),
                    offset,
                }
            }
            None => CodeLocation {
                iseq: "<unknown>".into(),
                line: 0,
                offset: pc.0,
            },
        }
    }

    /// Program counter of the current frame
    #[inline]
    pub fn pc(&self) -> Pc {
        self.frames.last().map(|f| f.pc).unwrap_or_default()
    }

    pub fn set_pc(&mut self, pc: Pc) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut Vec<Frame> {
        &mut self.frames
    }

    fn top(&self) -> Result<&Frame> {
        self.frames.last().ok_or_else(no_frame)
    }

    fn top_mut(&mut self) -> Result<&mut Frame> {
        self.frames.last_mut().ok_or_else(no_frame)
    }

    /// `self` of the current frame
    pub fn self_value(&self) -> Value {
        self.frames
            .last()
            .map(|f| f.self_value.clone())
            .unwrap_or_else(|| self.main.clone())
    }

    /// Block passed to the current frame
    pub fn current_block(&self) -> Option<Rc<Block>> {
        self.frames.last().and_then(|f| f.block.clone())
    }

    pub fn main_object(&self) -> Value {
        self.main.clone()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn trace_events(&self) -> u64 {
        self.trace_events
    }

    pub fn record_trace_event(&mut self) {
        self.trace_events += 1;
    }

    // ==================== Operand stack ====================

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::internal("operand stack underflow"))
    }

    /// Value `n` slots below the top of the stack
    #[inline]
    pub fn topn(&self, n: usize) -> Result<Value> {
        self.stack
            .len()
            .checked_sub(n + 1)
            .map(|i| self.stack[i].clone())
            .ok_or_else(|| Error::internal("operand stack underflow"))
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate_stack(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| Error::internal("operand stack underflow"))?;
        Ok(self.stack.split_off(at))
    }

    // ==================== Variables ====================

    fn env_at(&self, level: u32) -> Result<EnvRef> {
        let mut env = Rc::clone(&self.top()?.env);
        for _ in 0..level {
            let parent = env
                .borrow()
                .parent
                .clone()
                .ok_or_else(|| Error::internal(format!("no environment at level {}", level)))?;
            env = parent;
        }
        Ok(env)
    }

    /// Local `idx` of the environment `level` frames out
    pub fn local(&self, level: u32, idx: u32) -> Result<Value> {
        let env = self.env_at(level)?;
        let value = env.borrow().locals.get(idx as usize).cloned().unwrap_or(Value::Nil);
        Ok(value)
    }

    pub fn set_local(&mut self, level: u32, idx: u32, value: Value) -> Result<()> {
        let env = self.env_at(level)?;
        let mut env = env.borrow_mut();
        let idx = idx as usize;
        if env.locals.len() <= idx {
            env.locals.resize(idx + 1, Value::Nil);
        }
        env.locals[idx] = value;
        Ok(())
    }

    pub fn global(&self, name: Sym) -> Value {
        self.globals.get(&name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_global(&mut self, name: Sym, value: Value) {
        self.globals.insert(name, value);
    }

    pub fn constant(&self, name: Sym) -> Result<Value> {
        self.constants.get(&name).cloned().ok_or_else(|| {
            Error::name_error(format!("uninitialized constant {}", self.symbols.resolve(name)))
        })
    }

    pub fn set_constant(&mut self, name: Sym, value: Value) {
        if self.constants.insert(name, value).is_some() {
            self.constants_redefined = true;
        }
        self.constant_state += 1;
    }

    pub fn constant_state(&self) -> u64 {
        self.constant_state
    }

    /// Whether a constant was reassigned since the last call
    pub fn take_constants_redefined(&mut self) -> bool {
        std::mem::take(&mut self.constants_redefined)
    }

    /// Cached value of the `getinlinecache` at `pc`, if still valid
    pub fn constant_cache(&self, pc: Pc) -> Option<Value> {
        let Some(Insn::GetInlineCache { slot, .. }) = self.fetch(pc) else {
            return None;
        };
        let iseq = self.iseq_at(pc)?;
        self.caches
            .constant(iseq, *slot, self.constant_state)
            .cloned()
    }

    fn cvar_owner(&self) -> ClassId {
        match self.self_value() {
            Value::Class(c) => c,
            other => self.class_of(&other),
        }
    }

    /// Instance variable of `recv` (nil when unset)
    pub fn ivar_get(&mut self, recv: &Value, name: Sym) -> Value {
        match recv {
            Value::Object(obj) => {
                let class = obj.borrow().class;
                match self.classes.ivar_slot(class, name, false) {
                    Some(slot) => obj.borrow().get(slot),
                    None => Value::Nil,
                }
            }
            _ => Value::Nil,
        }
    }

    pub fn ivar_set(&mut self, recv: &Value, name: Sym, value: Value) -> Result<()> {
        match recv {
            Value::Object(obj) => {
                let class = obj.borrow().class;
                if let Some(slot) = self.classes.ivar_slot(class, name, true) {
                    obj.borrow_mut().set(slot, value);
                }
                Ok(())
            }
            other => Err(Error::type_error(format!("can't modify frozen {}", other.type_name()))),
        }
    }

    /// Slot of instance variable `name` on `recv`, filling the inline cache
    /// of the instruction at `pc`
    pub fn ivar_slot(&mut self, pc: Pc, recv: &Value, name: Sym, define: bool) -> Option<IvarCache> {
        let Value::Object(obj) = recv else {
            return None;
        };
        let klass = obj.borrow().class;
        let serial = self.classes.serial(klass);
        if let Some(index) = self.caches.ivar(pc, klass, serial) {
            return Some(IvarCache {
                klass,
                class_serial: serial,
                index,
            });
        }
        let index = self.classes.ivar_slot(klass, name, define)?;
        let cache = IvarCache {
            klass,
            class_serial: serial,
            index,
        };
        self.caches.ivars.insert(pc, cache);
        Some(cache)
    }

    // ==================== Classes and methods ====================

    /// Class used for method lookup on `value`
    pub fn class_of(&self, value: &Value) -> ClassId {
        match value {
            Value::Nil => ClassId::NIL,
            Value::True => ClassId::TRUE,
            Value::False => ClassId::FALSE,
            Value::Fixnum(_) | Value::Bignum(_) => ClassId::INTEGER,
            Value::Float(_) => ClassId::FLOAT,
            Value::Symbol(_) => ClassId::SYMBOL,
            Value::String(_) => ClassId::STRING,
            Value::Array(_) => ClassId::ARRAY,
            Value::Hash(_) => ClassId::HASH,
            Value::Range(_) => ClassId::RANGE,
            Value::Regexp(_) => ClassId::REGEXP,
            Value::Time(_) => ClassId::TIME,
            Value::Object(obj) => obj.borrow().class,
            Value::Class(c) => self.classes.meta(*c),
            Value::Proc(_) => ClassId::PROC,
        }
    }

    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        let class = self.classes.define_class(name, superclass);
        let sym = self.symbols.intern(name);
        self.constants.insert(sym, Value::Class(class));
        class
    }

    /// Define or redefine a method
    pub fn define_method(&mut self, class: ClassId, name: &str, kind: MethodKind) {
        let sym = self.symbols.intern(name);
        self.classes.define_method(class, sym, kind, &self.symbols);
    }

    /// Whether `op` still has its builtin meaning for instances of `class`
    pub fn basic_op_unredefined(&self, op: BasicOp, class: ClassId) -> bool {
        self.classes.basic_op_unredefined(op, class)
    }

    /// Resolve `mid` on `recv` through the call cache of the call site at `pc`
    pub fn search_method(&mut self, pc: Pc, mid: Sym, argc: u32, recv: &Value) -> Option<CallCache> {
        let klass = self.class_of(recv);
        let serial = self.classes.serial(klass);
        let state = self.classes.method_state();
        if let Some(cc) = self.caches.call(pc, mid, klass, serial, state) {
            return Some(cc.clone());
        }
        let method = self.classes.lookup(klass, mid)?.clone();
        let cc = CallCache {
            mid,
            argc,
            klass,
            class_serial: serial,
            method_state: state,
            method,
        };
        self.caches.calls.insert(pc, cc.clone());
        Some(cc)
    }

    fn no_method_error(&self, mid: Sym, recv: &Value) -> Error {
        let class = match recv {
            Value::Class(c) => *c,
            other => self.class_of(other),
        };
        Error::no_method(format!(
            "undefined method `{}' for {}",
            self.symbols.resolve(mid),
            self.classes.name(class)
        ))
    }

    /// Allocate an instance of `class` without initializing it
    pub fn allocate(&self, class: ClassId) -> Result<Value> {
        match class {
            ClassId::ARRAY => Ok(Value::array(Vec::new())),
            ClassId::HASH => Ok(Value::hash(HashValue::new())),
            ClassId::STRING => Ok(Value::string("")),
            ClassId::OBJECT => Ok(Value::Object(Rc::new(RefCell::new(ObjectValue::new(class))))),
            c if c.0 > ClassId::MATH.0 && self.classes.get(c).attached.is_none() => {
                Ok(Value::Object(Rc::new(RefCell::new(ObjectValue::new(c)))))
            }
            c => Err(Error::type_error(format!(
                "allocator undefined for {}",
                self.classes.name(c)
            ))),
        }
    }

    /// Convert a value to a string the way `tostring` does
    pub fn obj_as_string(&mut self, value: &Value) -> Result<Value> {
        if let Value::String(_) = value {
            return Ok(value.clone());
        }
        let result = self.call_method(value.clone(), "to_s", Vec::new(), None)?;
        if result.is_string() {
            Ok(result)
        } else {
            Ok(Value::string(&builtins::to_s(self, value)))
        }
    }

    // ==================== Output and misc ====================

    pub fn write_output(&mut self, text: &str) {
        if self.echo {
            print!("{}", text);
        }
        self.output.push_str(text);
    }

    /// Everything the program printed so far
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Also print program output to stdout
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn random_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn random_below(&mut self, n: i64) -> i64 {
        self.rng.gen_range(0..n)
    }

    /// Record an error raised inside compiled code
    pub fn set_pending_error(&mut self, error: Error) {
        self.pending_error = Some(error);
    }

    pub fn take_pending_error(&mut self) -> Option<Error> {
        self.pending_error.take()
    }

    // ==================== Literals ====================

    fn materialize(&mut self, lit: &Literal) -> Result<Value> {
        Ok(match lit {
            Literal::Nil => Value::Nil,
            Literal::True => Value::True,
            Literal::False => Value::False,
            Literal::Int(n) => Value::int(*n as i128),
            Literal::Float(x) => Value::Float(*x),
            Literal::Str(s) => Value::string(s),
            Literal::Sym(s) => Value::Symbol(self.symbols.intern(s)),
            Literal::Regexp(src) => Value::Regexp(Rc::new(compile_regexp(src)?)),
            Literal::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.materialize(item)?);
                }
                Value::array(values)
            }
        })
    }

    /// The literal object of the instruction at `pc`, created once and
    /// shared by every execution of that instruction
    pub fn literal(&mut self, pc: Pc) -> Result<Value> {
        if let Some(v) = self.caches.literals.get(&pc) {
            return Ok(v.clone());
        }
        let lit = match self.fetch(pc) {
            Some(Insn::PutObject { value }) => value.clone(),
            Some(Insn::DupArray { value }) => Literal::Array(value.clone()),
            Some(Insn::PutString { value })
            | Some(Insn::OptStrFreeze { value })
            | Some(Insn::OptArefWith { key: value })
            | Some(Insn::OptAsetWith { key: value }) => Literal::Str(value.clone()),
            Some(Insn::OptRegexpMatch1 { pattern }) => Literal::Regexp(pattern.clone()),
            other => {
                return Err(Error::internal(format!(
                    "no literal at {}: {:?}",
                    pc,
                    other.map(Insn::name)
                )))
            }
        };
        let value = self.materialize(&lit)?;
        self.caches.literals.insert(pc, value.clone());
        Ok(value)
    }

    // ==================== Frames ====================

    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::runtime(RuntimeErrorKind::RangeError, "stack level too deep"));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Enter iseq method `iseq`; receiver and `argc` arguments are on the
    /// stack and stay there until the method returns
    pub fn enter_method(
        &mut self,
        iseq: IseqId,
        recv: Value,
        argc: usize,
        block: Option<Rc<Block>>,
        finish: bool,
    ) -> Result<()> {
        let info = &self.iseqs[iseq.index()];
        if argc != info.params as usize {
            return Err(Error::argument_error(format!(
                "wrong number of arguments (given {}, expected {})",
                argc, info.params
            )));
        }
        let start = info.start;
        let env = Env::new(info.locals as usize, None);
        {
            let base = self.stack.len() - argc;
            let mut env = env.borrow_mut();
            env.locals[..argc].clone_from_slice(&self.stack[base..]);
        }
        self.push_frame(Frame {
            iseq,
            pc: start,
            self_value: recv,
            env,
            block,
            sp_base: self.stack.len(),
            stack_args: argc + 1,
            kind: FrameKind::Method,
            finish,
        })
    }

    /// Enter `block` with `argc` arguments on the stack
    pub fn enter_block(&mut self, block: &Rc<Block>, argc: usize, finish: bool) -> Result<()> {
        let info = &self.iseqs[block.iseq.index()];
        let start = info.start;
        let params = info.params as usize;
        let env = Env::new(info.locals as usize, Some(Rc::clone(&block.env)));
        {
            let base = self.stack.len() - argc;
            let mut env = env.borrow_mut();
            for i in 0..params.min(argc) {
                env.locals[i] = self.stack[base + i].clone();
            }
        }
        self.push_frame(Frame {
            iseq: block.iseq,
            pc: start,
            self_value: block.self_value.clone(),
            env,
            block: block.outer_block.clone(),
            sp_base: self.stack.len(),
            stack_args: argc,
            kind: FrameKind::Block,
            finish,
        })
    }

    /// Return from the current frame with `value`
    pub fn leave_frame(&mut self, value: Value) -> Result<Step> {
        let frame = self.frames.pop().ok_or_else(no_frame)?;
        self.stack.truncate(frame.sp_base);
        let len = self.stack.len().saturating_sub(frame.stack_args);
        self.stack.truncate(len);
        if frame.finish || self.frames.is_empty() {
            return Ok(Step::Return(value));
        }
        self.push(value);
        Ok(Step::Continue)
    }

    // ==================== Inlined frames ====================

    /// Push the frame of a method inlined into a compiled trace. The caller
    /// resumes at `return_pc`; the operand stack is rebuilt at trace exit.
    pub fn enter_inlined_method(
        &mut self,
        iseq: IseqId,
        recv: Value,
        args: &[Value],
        block: Option<Rc<Block>>,
        return_pc: Pc,
    ) -> Result<()> {
        let info = &self.iseqs[iseq.index()];
        let (start, locals) = (info.start, info.locals as usize);
        let env = Env::new(locals.max(args.len()), None);
        env.borrow_mut().locals[..args.len()].clone_from_slice(args);
        self.top_mut()?.pc = return_pc;
        self.push_frame(Frame {
            iseq,
            pc: start,
            self_value: recv,
            env,
            block,
            sp_base: self.stack.len(),
            stack_args: args.len() + 1,
            kind: FrameKind::Method,
            finish: false,
        })
    }

    /// Push the frame of a block inlined into a compiled trace
    pub fn enter_inlined_block(&mut self, block: &Rc<Block>, args: &[Value], return_pc: Pc) -> Result<()> {
        let info = &self.iseqs[block.iseq.index()];
        let (start, locals, params) = (info.start, info.locals as usize, info.params as usize);
        let env = Env::new(locals, Some(Rc::clone(&block.env)));
        {
            let mut env = env.borrow_mut();
            for (slot, arg) in env.locals.iter_mut().zip(args.iter().take(params)) {
                *slot = arg.clone();
            }
        }
        self.top_mut()?.pc = return_pc;
        self.push_frame(Frame {
            iseq: block.iseq,
            pc: start,
            self_value: block.self_value.clone(),
            env,
            block: block.outer_block.clone(),
            sp_base: self.stack.len(),
            stack_args: args.len(),
            kind: FrameKind::Block,
            finish: false,
        })
    }

    /// Pop the frame of an inlined call; its stack slots live in trace
    /// registers
    pub fn leave_inlined_frame(&mut self) -> Result<()> {
        self.frames.pop().map(|_| ()).ok_or_else(no_frame)
    }

    /// Whether `leave` in the current frame hands its value to native code
    pub fn returns_to_native(&self) -> bool {
        self.frames.last().map_or(true, |f| f.finish)
    }

    /// Block object for `iseq` closing over the current frame, as a block
    /// literal at a call site creates it
    pub fn block_for(&self, iseq: IseqId) -> Result<Rc<Block>> {
        let frame = self.top()?;
        Ok(Rc::new(Block {
            iseq,
            self_value: frame.self_value.clone(),
            env: Rc::clone(&frame.env),
            outer_block: frame.block.clone(),
        }))
    }

    // ==================== Nested calls ====================

    fn run_until_finish(&mut self) -> Result<Value> {
        loop {
            if let Step::Return(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// Invoke a resolved method from native code
    pub fn invoke_method(
        &mut self,
        entry: &MethodEntry,
        recv: Value,
        args: Vec<Value>,
        block: Option<Rc<Block>>,
    ) -> Result<Value> {
        match &entry.kind {
            MethodKind::Native(func) => builtins::call(self, *func, recv, args, block),
            MethodKind::AttrReader(name) => {
                if !args.is_empty() {
                    return Err(Error::argument_error(format!(
                        "wrong number of arguments (given {}, expected 0)",
                        args.len()
                    )));
                }
                Ok(self.ivar_get(&recv, *name))
            }
            MethodKind::AttrWriter(name) => {
                let [value] = <[Value; 1]>::try_from(args).map_err(|args| {
                    Error::argument_error(format!(
                        "wrong number of arguments (given {}, expected 1)",
                        args.len()
                    ))
                })?;
                self.ivar_set(&recv, *name, value.clone())?;
                Ok(value)
            }
            MethodKind::Iseq(iseq) => {
                let argc = args.len();
                self.push(recv.clone());
                self.stack.extend(args);
                self.enter_method(*iseq, recv, argc, block, true)?;
                self.run_until_finish()
            }
        }
    }

    /// Call method `name` on `recv` from native code
    pub fn call_method(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Rc<Block>>,
    ) -> Result<Value> {
        let mid = self.symbols.intern(name);
        let klass = self.class_of(&recv);
        let entry = match self.classes.lookup(klass, mid) {
            Some(entry) => entry.clone(),
            None => return Err(self.no_method_error(mid, &recv)),
        };
        self.invoke_method(&entry, recv, args, block)
    }

    /// Call a top-level method on the main object
    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        let main = self.main.clone();
        self.call_method(main, name, args, None)
    }

    /// Run `block` with `args` from native code
    pub fn yield_block(&mut self, block: &Rc<Block>, args: Vec<Value>) -> Result<Value> {
        let argc = args.len();
        self.stack.extend(args);
        self.enter_block(block, argc, true)?;
        self.run_until_finish()
    }

    /// Run a builtin directly (used by compiled traces)
    pub fn call_native(&mut self, func: NativeFn, recv: Value, args: Vec<Value>) -> Result<Value> {
        builtins::call(self, func, recv, args, None)
    }

    // ==================== Execution ====================

    /// Execute the instruction at the current pc
    pub fn step(&mut self) -> Result<Step> {
        let pc = self.pc();
        let code = Rc::clone(&self.code);
        let insn = code
            .get(pc.index())
            .ok_or_else(|| Error::internal(format!("pc {} outside loaded code", pc)))?;
        self.top_mut()?.pc = pc.next();
        self.instructions += 1;
        self.execute(pc, insn)
            .map_err(|e| e.with_location(self.location(pc)))
    }

    fn jump(&mut self, pc: Pc, offset: i32) -> Result<()> {
        self.top_mut()?.pc = pc.branch_target(offset);
        Ok(())
    }

    fn execute(&mut self, pc: Pc, insn: &Insn) -> Result<Step> {
        match insn {
            Insn::Nop => {}

            // ---- Variables ----
            Insn::GetLocal { idx, level } => {
                let value = self.local(*level, *idx)?;
                self.push(value);
            }
            Insn::SetLocal { idx, level } => {
                let value = self.pop()?;
                self.set_local(*level, *idx, value)?;
            }
            Insn::GetInstanceVariable { name } => {
                let recv = self.self_value();
                let name = self.symbols.intern(ivar_name(name));
                let value = match self.ivar_slot(pc, &recv, name, false) {
                    Some(ic) => match &recv {
                        Value::Object(obj) => obj.borrow().get(ic.index),
                        _ => Value::Nil,
                    },
                    None => Value::Nil,
                };
                self.push(value);
            }
            Insn::SetInstanceVariable { name } => {
                let value = self.pop()?;
                let recv = self.self_value();
                let name = self.symbols.intern(ivar_name(name));
                match self.ivar_slot(pc, &recv, name, true) {
                    Some(ic) => {
                        if let Value::Object(obj) = &recv {
                            obj.borrow_mut().set(ic.index, value);
                        }
                    }
                    None => self.ivar_set(&recv, name, value)?,
                }
            }
            Insn::GetClassVariable { name } => {
                let sym = self.symbols.intern(name);
                let mut class = Some(self.cvar_owner());
                let mut found = None;
                while let Some(c) = class {
                    if let Some(v) = self.class_vars.get(&(c, sym)) {
                        found = Some(v.clone());
                        break;
                    }
                    class = self.classes.get(c).superclass;
                }
                let value = found.ok_or_else(|| {
                    Error::name_error(format!("uninitialized class variable {}", name))
                })?;
                self.push(value);
            }
            Insn::SetClassVariable { name } => {
                let value = self.pop()?;
                let sym = self.symbols.intern(name);
                let owner = self.cvar_owner();
                let mut class = Some(owner);
                let mut target = owner;
                while let Some(c) = class {
                    if self.class_vars.contains_key(&(c, sym)) {
                        target = c;
                        break;
                    }
                    class = self.classes.get(c).superclass;
                }
                self.class_vars.insert((target, sym), value);
            }
            Insn::GetConstant { name } => {
                let sym = self.symbols.intern(name);
                let value = self.constant(sym)?;
                self.push(value);
            }
            Insn::SetConstant { name } => {
                let value = self.pop()?;
                let sym = self.symbols.intern(name);
                self.set_constant(sym, value);
            }
            Insn::GetGlobal { name } => {
                let sym = self.symbols.intern(name);
                let value = self.global(sym);
                self.push(value);
            }
            Insn::SetGlobal { name } => {
                let value = self.pop()?;
                let sym = self.symbols.intern(name);
                self.set_global(sym, value);
            }

            // ---- Literals ----
            Insn::PutNil => self.push(Value::Nil),
            Insn::PutSelf => {
                let value = self.self_value();
                self.push(value);
            }
            Insn::PutObject { .. } => {
                let value = self.literal(pc)?;
                self.push(value);
            }
            Insn::PutString { value } => self.push(Value::string(value)),
            Insn::ConcatStrings { count } => {
                let parts = self.pop_n(*count as usize)?;
                let mut s = String::new();
                for part in &parts {
                    match part {
                        Value::String(p) => s.push_str(&p.borrow()),
                        other => {
                            return Err(Error::type_error(format!(
                                "no implicit conversion of {} into String",
                                other.type_name()
                            )))
                        }
                    }
                }
                self.push(Value::string(&s));
            }
            Insn::ToString => {
                let value = self.pop()?;
                let s = self.obj_as_string(&value)?;
                self.push(s);
            }
            Insn::ToRegexp { count } => {
                let parts = self.pop_n(*count as usize)?;
                let mut source = String::new();
                for part in &parts {
                    source.push_str(&builtins::to_s(self, part));
                }
                self.push(Value::Regexp(Rc::new(compile_regexp(&source)?)));
            }
            Insn::NewArray { count } => {
                let items = self.pop_n(*count as usize)?;
                self.push(Value::array(items));
            }
            Insn::DupArray { .. } => {
                let literal = self.literal(pc)?;
                let copy = match &literal {
                    Value::Array(items) => Value::array(items.borrow().clone()),
                    other => other.clone(),
                };
                self.push(copy);
            }
            Insn::NewHash { count } => {
                let items = self.pop_n(*count as usize)?;
                self.push(builtins::hash_from_pairs(items));
            }
            Insn::NewRange { exclusive } => {
                let high = self.pop()?;
                let low = self.pop()?;
                self.push(Value::range(low, high, *exclusive));
            }

            // ---- Stack ----
            Insn::Pop => {
                self.pop()?;
            }
            Insn::Dup => {
                let top = self.topn(0)?;
                self.push(top);
            }
            Insn::DupN { n } => {
                let n = *n as usize;
                let at = self
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or_else(|| Error::internal("operand stack underflow"))?;
                let copies = self.stack[at..].to_vec();
                self.stack.extend(copies);
            }
            Insn::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Insn::Reput => {}
            Insn::TopN { n } => {
                let value = self.topn(*n as usize)?;
                self.push(value);
            }
            Insn::SetN { n } => {
                let value = self.topn(0)?;
                let len = self.stack.len();
                let slot = len
                    .checked_sub(*n as usize + 1)
                    .ok_or_else(|| Error::internal("operand stack underflow"))?;
                self.stack[slot] = value;
            }
            Insn::AdjustStack { n } => {
                self.pop_n(*n as usize)?;
            }

            // ---- Misc ----
            Insn::CheckMatch { kind, array } => {
                let pattern = self.pop()?;
                let target = self.pop()?;
                let matched = match (&pattern, array) {
                    (Value::Array(items), true) => {
                        let items = items.borrow().clone();
                        let mut any = false;
                        for p in &items {
                            if self.check_match(*kind, p, &target)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                    _ => self.check_match(*kind, &pattern, &target)?,
                };
                self.push(Value::bool(matched));
            }
            Insn::Trace { .. } => self.trace_events += 1,

            // ---- Calls ----
            Insn::Send { ci } => {
                let block = match &ci.block {
                    Some(name) => Some(self.capture_block(name)?),
                    None => None,
                };
                return self.send(pc, ci, block);
            }
            Insn::OptSendSimple { ci } => return self.send(pc, ci, None),
            Insn::OptStrFreeze { .. } => {
                let literal = self.literal(pc)?;
                if self.basic_op_unredefined(BasicOp::Freeze, ClassId::STRING) {
                    self.push(literal);
                } else {
                    self.push(literal);
                    let mid = self.symbols.intern("freeze");
                    return self.dispatch(pc, mid, 0, None);
                }
            }
            Insn::InvokeBlock { ci } => {
                let block = self.current_block().ok_or_else(|| {
                    Error::runtime(RuntimeErrorKind::LocalJumpError, "no block given (yield)")
                })?;
                self.enter_block(&block, ci.argc as usize, false)?;
            }
            Insn::Leave => {
                let value = self.pop()?;
                return self.leave_frame(value);
            }
            Insn::Throw => {
                let value = self.pop()?;
                return Err(Error::runtime(
                    RuntimeErrorKind::LocalJumpError,
                    format!("unexpected throw of {}", builtins::inspect(self, &value)),
                ));
            }

            // ---- Control flow ----
            Insn::Jump { offset } => self.jump(pc, *offset)?,
            Insn::BranchIf { offset } => {
                if self.pop()?.is_truthy() {
                    self.jump(pc, *offset)?;
                }
            }
            Insn::BranchUnless { offset } => {
                if !self.pop()?.is_truthy() {
                    self.jump(pc, *offset)?;
                }
            }
            Insn::GetInlineCache { offset, .. } => {
                if let Some(value) = self.constant_cache(pc) {
                    self.push(value);
                    self.jump(pc, *offset)?;
                }
            }
            Insn::SetInlineCache { slot } => {
                let value = self.topn(0)?;
                let iseq = self.top()?.iseq;
                self.caches.consts.insert(
                    (iseq, *slot),
                    ConstCache {
                        value,
                        constant_state: self.constant_state,
                    },
                );
            }

            // ---- Specialized operators ----
            Insn::OptArefWith { .. } => {
                let key = self.literal(pc)?;
                let recv = self.topn(0)?;
                if recv.is_hash() && self.basic_op_unredefined(BasicOp::Aref, ClassId::HASH) {
                    self.pop()?;
                    let value = builtins::call(self, NativeFn::HashAref, recv, vec![key], None)?;
                    self.push(value);
                } else {
                    self.push(key);
                    let mid = self.symbols.intern("[]");
                    return self.dispatch(pc, mid, 1, None);
                }
            }
            Insn::OptAsetWith { .. } => {
                let key = self.literal(pc)?;
                let recv = self.topn(1)?;
                let value = self.pop()?;
                if recv.is_hash() && self.basic_op_unredefined(BasicOp::Aset, ClassId::HASH) {
                    self.pop()?;
                    let result = builtins::call(self, NativeFn::HashAset, recv, vec![key, value], None)?;
                    self.push(result);
                } else {
                    self.push(key);
                    self.push(value);
                    let mid = self.symbols.intern("[]=");
                    return self.dispatch(pc, mid, 2, None);
                }
            }
            Insn::OptRegexpMatch1 { .. } => {
                let regexp = self.literal(pc)?;
                let target = self.topn(0)?;
                if target.is_string() && self.basic_op_unredefined(BasicOp::Match, ClassId::REGEXP) {
                    self.pop()?;
                    let result = builtins::call(self, NativeFn::ReMatch, regexp, vec![target], None)?;
                    self.push(result);
                } else {
                    self.pop()?;
                    self.push(regexp);
                    self.push(target);
                    let mid = self.symbols.intern("=~");
                    return self.dispatch(pc, mid, 1, None);
                }
            }
            _ => {
                if let Some((name, argc)) = insn.basic_call() {
                    return self.opt_basic(pc, insn, name, argc as usize);
                }
                return Err(Error::internal(format!("unhandled instruction {}", insn.name())));
            }
        }
        Ok(Step::Continue)
    }

    pub fn check_match(&mut self, kind: CheckMatchKind, pattern: &Value, target: &Value) -> Result<bool> {
        match kind {
            CheckMatchKind::When => Ok(pattern.is_truthy()),
            CheckMatchKind::Case | CheckMatchKind::Rescue => {
                let result = self.call_method(pattern.clone(), "===", vec![target.clone()], None)?;
                Ok(result.is_truthy())
            }
        }
    }

    fn capture_block(&self, name: &str) -> Result<Rc<Block>> {
        let iseq = self.iseq_id(name)?;
        self.block_for(iseq)
    }

    fn send(&mut self, pc: Pc, ci: &CallInfo, block: Option<Rc<Block>>) -> Result<Step> {
        let mut argc = ci.argc as usize;
        let mut block = block;
        if ci.flags.contains(CallFlags::ARGS_BLOCKARG) {
            argc = argc.saturating_sub(1);
            match self.pop()? {
                Value::Nil => {}
                Value::Proc(b) => block = Some(b),
                other => {
                    return Err(Error::type_error(format!(
                        "wrong argument type {} (expected Proc)",
                        other.type_name()
                    )))
                }
            }
        }
        if ci.flags.contains(CallFlags::ARGS_SPLAT) {
            match self.pop()? {
                Value::Array(items) => {
                    let items = items.borrow().clone();
                    argc = argc - 1 + items.len();
                    self.stack.extend(items);
                }
                other => self.push(other),
            }
        }
        let mid = self.symbols.intern(&ci.mid);
        self.dispatch(pc, mid, argc, block)
    }

    /// Call `mid` with the receiver and `argc` arguments on the stack
    fn dispatch(&mut self, pc: Pc, mid: Sym, argc: usize, block: Option<Rc<Block>>) -> Result<Step> {
        let recv = self.topn(argc)?;
        let cc = match self.search_method(pc, mid, argc as u32, &recv) {
            Some(cc) => cc,
            None => return Err(self.no_method_error(mid, &recv)),
        };
        if let MethodKind::Iseq(iseq) = cc.method.kind {
            self.enter_method(iseq, recv, argc, block, false)?;
            return Ok(Step::Continue);
        }
        let args = self.pop_n(argc)?;
        self.pop()?;
        let result = self.invoke_method(&cc.method, recv, args, block)?;
        self.push(result);
        Ok(Step::Continue)
    }

    /// Builtin implementing an `opt_*` instruction for these operands, when
    /// the operator is not redefined
    fn basic_native(&self, insn: &Insn, recv: &Value, arg: Option<&Value>) -> Option<NativeFn> {
        use NativeFn::*;
        use Value as V;
        let (op, func) = match (insn, recv, arg) {
            (Insn::OptPlus, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Plus, IntPlus),
            (Insn::OptPlus, V::Float(_), Some(V::Float(_))) => (BasicOp::Plus, FloPlus),
            (Insn::OptPlus, V::String(_), Some(V::String(_))) => (BasicOp::Plus, StrPlus),
            (Insn::OptPlus, V::Array(_), Some(V::Array(_))) => (BasicOp::Plus, AryPlus),
            (Insn::OptMinus, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Minus, IntMinus),
            (Insn::OptMinus, V::Float(_), Some(V::Float(_))) => (BasicOp::Minus, FloMinus),
            (Insn::OptMult, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Mult, IntMul),
            (Insn::OptMult, V::Float(_), Some(V::Float(_))) => (BasicOp::Mult, FloMul),
            (Insn::OptDiv, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Div, IntDiv),
            (Insn::OptDiv, V::Float(_), Some(V::Float(_))) => (BasicOp::Div, FloDiv),
            (Insn::OptMod, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Mod, IntMod),
            (Insn::OptMod, V::Float(_), Some(V::Float(_))) => (BasicOp::Mod, FloMod),
            (Insn::OptEq | Insn::OptNeq, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Eq, IntEq),
            (Insn::OptEq | Insn::OptNeq, V::Float(_), Some(V::Float(_))) => (BasicOp::Eq, FloEq),
            (Insn::OptEq | Insn::OptNeq, V::String(_), Some(V::String(_))) => (BasicOp::Eq, StrEq),
            (Insn::OptLt, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Lt, IntLt),
            (Insn::OptLt, V::Float(_), Some(V::Float(_))) => (BasicOp::Lt, FloLt),
            (Insn::OptLe, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Le, IntLe),
            (Insn::OptLe, V::Float(_), Some(V::Float(_))) => (BasicOp::Le, FloLe),
            (Insn::OptGt, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Gt, IntGt),
            (Insn::OptGt, V::Float(_), Some(V::Float(_))) => (BasicOp::Gt, FloGt),
            (Insn::OptGe, V::Fixnum(_), Some(V::Fixnum(_))) => (BasicOp::Ge, IntGe),
            (Insn::OptGe, V::Float(_), Some(V::Float(_))) => (BasicOp::Ge, FloGe),
            (Insn::OptLtLt, V::String(_), Some(V::String(_))) => (BasicOp::LtLt, StrAppend),
            (Insn::OptLtLt, V::Array(_), Some(_)) => (BasicOp::LtLt, AryPush),
            (Insn::OptAref, V::Array(_), Some(V::Fixnum(_))) => (BasicOp::Aref, AryAref),
            (Insn::OptAref, V::Hash(_), Some(_)) => (BasicOp::Aref, HashAref),
            (Insn::OptLength, V::String(_), None) => (BasicOp::Length, StrLength),
            (Insn::OptLength, V::Array(_), None) => (BasicOp::Length, AryLength),
            (Insn::OptLength, V::Hash(_), None) => (BasicOp::Length, HashLength),
            (Insn::OptSize, V::String(_), None) => (BasicOp::Size, StrLength),
            (Insn::OptSize, V::Array(_), None) => (BasicOp::Size, AryLength),
            (Insn::OptSize, V::Hash(_), None) => (BasicOp::Size, HashLength),
            (Insn::OptEmptyP, V::String(_), None) => (BasicOp::EmptyP, StrEmptyP),
            (Insn::OptEmptyP, V::Array(_), None) => (BasicOp::EmptyP, AryEmptyP),
            (Insn::OptEmptyP, V::Hash(_), None) => (BasicOp::EmptyP, HashEmptyP),
            (Insn::OptSucc, V::Fixnum(_), None) => (BasicOp::Succ, IntSucc),
            (Insn::OptSucc, V::String(_), None) => (BasicOp::Succ, StrSucc),
            (Insn::OptSucc, V::Time(_), None) => (BasicOp::Succ, TimeSucc),
            (Insn::OptNot, _, None) => (BasicOp::Not, ObjNot),
            (Insn::OptRegexpMatch2, V::String(_), Some(V::Regexp(_))) => (BasicOp::Match, StrMatch),
            _ => return None,
        };
        let klass = self.class_of(recv);
        let unredefined = self.basic_op_unredefined(op, klass)
            && (!matches!(insn, Insn::OptNeq) || self.basic_op_unredefined(BasicOp::Neq, klass));
        unredefined.then_some(func)
    }

    fn opt_basic(&mut self, pc: Pc, insn: &Insn, name: &str, argc: usize) -> Result<Step> {
        // opt_aset's fast path needs two arguments; handle it separately
        if let Insn::OptAset = insn {
            let recv = self.topn(2)?;
            let key = self.topn(1)?;
            let fast = match (&recv, &key) {
                (Value::Array(_), Value::Fixnum(_)) => Some((NativeFn::AryAset, ClassId::ARRAY)),
                (Value::Hash(_), _) => Some((NativeFn::HashAset, ClassId::HASH)),
                _ => None,
            };
            let fast = fast
                .filter(|(_, class)| self.basic_op_unredefined(BasicOp::Aset, *class))
                .map(|(func, _)| func);
            if let Some(func) = fast {
                let args = self.pop_n(2)?;
                self.pop()?;
                let result = builtins::call(self, func, recv, args, None)?;
                self.push(result);
                return Ok(Step::Continue);
            }
        } else {
            let recv = self.topn(argc)?;
            let arg = if argc == 1 { Some(self.topn(0)?) } else { None };
            if let Some(func) = self.basic_native(insn, &recv, arg.as_ref()) {
                let args = self.pop_n(argc)?;
                self.pop()?;
                let mut result = builtins::call(self, func, recv, args, None)?;
                if let Insn::OptNeq = insn {
                    result = Value::bool(!result.is_truthy());
                }
                self.push(result);
                return Ok(Step::Continue);
            }
        }
        let mid = self.symbols.intern(name);
        self.dispatch(pc, mid, argc, None)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

fn no_frame() -> Error {
    Error::internal("no active frame")
}

/// Instance variable names are stored without the leading `@`
fn ivar_name(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

fn compile_regexp(source: &str) -> Result<RegexpValue> {
    RegexpValue::new(source).map_err(|e| Error::runtime(RuntimeErrorKind::RegexpError, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{assemble, IseqBuilder};

    fn run(src: &str) -> (Value, String) {
        let program = assemble(src).unwrap();
        let mut m = Machine::new();
        m.load(&program).unwrap();
        let value = m.run().unwrap();
        (value, m.take_output())
    }

    #[test]
    fn test_counter_loop() {
        let (value, _) = run(
            "top main locals=1
               putobject 0
               setlocal 0 0
             loop:
               getlocal 0 0
               putobject 1
               opt_plus
               setlocal 0 0
               getlocal 0 0
               putobject 100
               opt_lt
               branchif loop
               getlocal 0 0
               leave
             end",
        );
        assert_eq!(value, Value::Fixnum(100));
    }

    #[test]
    fn test_method_call_pops_arguments() {
        let (value, _) = run(
            "def add params=2 locals=2
               getlocal 0 0
               getlocal 1 0
               opt_plus
               leave
             end
             top main
               putself
               putobject 2
               putobject 3
               send add 2
               leave
             end
             entry main",
        );
        assert_eq!(value, Value::Fixnum(5));
    }

    #[test]
    fn test_zero_division_has_location() {
        let mut b = IseqBuilder::new("main", IseqKind::Top);
        b.line(7).putobject_int(1).putobject_int(0).opt_div().leave();
        let program = Program::new("main").with_iseq(b.build().unwrap());
        let mut m = Machine::new();
        m.load(&program).unwrap();
        let err = m.run().unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: divided by 0 at main:7");
    }

    #[test]
    fn test_block_and_puts() {
        let (_, out) = run(
            "block each_body params=1 locals=1
               putself
               getlocal 0 0
               send puts 1
               leave
             end
             top main
               putobject 3
               send times 0 &each_body
               leave
             end
             entry main",
        );
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn test_class_new_runs_initialize() {
        let (value, _) = run(
            "class Point
               attr_reader x
               def initialize params=1 locals=1
                 getlocal 0 0
                 setinstancevariable @x
                 putnil
                 leave
               end
             end
             top main
               getconstant Point
               putobject 42
               send new 1
               send x 0
               leave
             end
             entry main",
        );
        assert_eq!(value, Value::Fixnum(42));
    }

    #[test]
    fn test_redefined_operator_is_dispatched() {
        let mut m = Machine::new();
        let program = assemble(
            "top main
               putobject 1
               putobject 2
               opt_plus
               leave
             end",
        )
        .unwrap();
        m.load(&program).unwrap();
        m.define_method(ClassId::INTEGER, "+", MethodKind::Native(NativeFn::IntMinus));
        assert!(!m.basic_op_unredefined(BasicOp::Plus, ClassId::INTEGER));
        assert_eq!(m.run().unwrap(), Value::Fixnum(-1));
    }

    #[test]
    fn test_iseq_at_and_location() {
        let program = assemble(
            "top main
               putnil
               leave
             end
             def other
               putnil
               leave
             end
             entry main",
        )
        .unwrap();
        let mut m = Machine::new();
        m.load(&program).unwrap();
        assert_eq!(m.iseq_at(Pc(0)), m.iseq_by_name("main"));
        assert_eq!(m.iseq_at(Pc(3)), m.iseq_by_name("other"));
        assert_eq!(m.iseq_at(Pc(4)), None);
        assert_eq!(m.location(Pc(3)).offset, 1);
    }

    #[test]
    fn test_literal_identity_per_pc() {
        let program = assemble("top main\n putobject \"s\"\n leave\nend").unwrap();
        let mut m = Machine::new();
        m.load(&program).unwrap();
        let a = m.literal(Pc(0)).unwrap();
        let b = m.literal(Pc(0)).unwrap();
        assert!(a.same(&b));
    }

    #[test]
    fn test_constant_inline_cache() {
        let (value, _) = run(
            "top main
               putobject 5
               setconstant LIMIT
             again:
               getinlinecache done 0
               getconstant LIMIT
               setinlinecache 0
             done:
               leave
             end",
        );
        assert_eq!(value, Value::Fixnum(5));
    }
}
