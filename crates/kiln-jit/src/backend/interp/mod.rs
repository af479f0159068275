//! Portable backend that executes verified IR directly
//!
//! The executor walks blocks from the entry, evaluates phis as a parallel
//! copy from the edge taken, runs ops in order and follows an op's unwind
//! edge when it fails. Object operations go through a [`HostRuntime`]; the
//! bundled [`RefHeap`] implements one that checks every reference count.
//!
//! State machines run against a caller-owned [`Frame`]: [`InterpBackend::start`]
//! creates it and each [`InterpBackend::resume`] runs until the next
//! suspension, return or raise.

pub mod heap;

use kiln_bytecode::{CodeObject, Constant};
use rustc_hash::FxHashMap;

use super::traits::*;
use crate::host::HostFn;
use crate::ir::{BlockRef, FrameField, Function, IntBinOp, IrType, Op, Terminator, ValueId};
use crate::pipeline::CompiledArtifact;
use crate::suspend::{FrameLayout, FrameSlotKind, TERMINAL_STATE};

pub use heap::{HeapError, ObjRef, Object, RefHeap};

/// Marker for a failed host operation; the exception is in the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised;

/// A runtime value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Obj(ObjRef),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn ty(&self) -> IrType {
        match self {
            Value::Obj(_) => IrType::Obj,
            Value::Int(_) => IrType::I64,
            Value::Bool(_) => IrType::Bool,
        }
    }

    fn zero(ty: IrType) -> Self {
        match ty {
            IrType::Obj => Value::Obj(ObjRef::NULL),
            IrType::I64 => Value::Int(0),
            IrType::Bool => Value::Bool(false),
        }
    }
}

/// The host object model the executor calls into
pub trait HostRuntime {
    /// A new reference to a constant
    fn constant(&mut self, constant: &Constant) -> ObjRef;

    /// Perform `func`, following its reference-count contract
    fn call(
        &mut self,
        names: &[String],
        func: HostFn,
        args: &[Value],
    ) -> Result<Option<Value>, Raised>;

    fn incref(&mut self, obj: ObjRef);

    fn decref(&mut self, obj: ObjRef);

    /// Take the active exception as a new reference
    fn fetch_exception(&mut self) -> ObjRef;

    /// Set a new active exception
    fn raise_error(&mut self, kind: &str, message: &str);

    /// Set the exception a failed checked integer operation raises
    fn arithmetic_failed(&mut self, op: IntBinOp, rhs: i64);

    fn release_lock(&mut self);

    fn acquire_lock(&mut self);
}

/// How one execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Returned a value; an object result is a new reference
    Returned(Value),
    /// Failed with the runtime's active exception set
    Raised,
    /// Paused a state machine, yielding a new reference
    Suspended(Value),
}

/// Malformed IR or misuse detected while executing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("{0} used before definition")]
    UndefinedValue(ValueId),
    #[error("{value} is not of type {expected}")]
    TypeMismatch { value: ValueId, expected: IrType },
    #[error("reached unreachable code in {0}")]
    Unreachable(BlockRef),
    #[error("{0} has no terminator")]
    Unterminated(BlockRef),
    #[error("frame field {0} accessed without a frame")]
    MissingFrame(FrameField),
    #[error("failing op in {0} has no unwind edge")]
    MissingUnwind(BlockRef),
    #[error("expected {expected} arguments, got {found}")]
    ArgCount { expected: usize, found: usize },
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    #[error("constant {0} out of range")]
    BadConstant(u32),
    #[error("{block} entered from {from:?} without a phi incoming")]
    MissingPhiIncoming { block: BlockRef, from: Option<BlockRef> },
    #[error("{0} released while null")]
    NullRelease(ValueId),
    #[error("state-machine function run without a frame")]
    NeedsFrame,
}

/// Persistent state of a suspended function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub state: i64,
    pub sent: ObjRef,
    pub thrown: ObjRef,
    pub slots: Vec<ObjRef>,
}

impl Frame {
    /// A fresh frame with the arguments and free variables filled in
    ///
    /// `args` lists the positional arguments followed by the free variables;
    /// the frame takes a new reference to each.
    pub fn new(
        layout: &FrameLayout,
        args: &[ObjRef],
        runtime: &mut dyn HostRuntime,
    ) -> Result<Self, ExecError> {
        let positional = layout
            .slots
            .iter()
            .filter(|s| matches!(s.kind, FrameSlotKind::Arg(_)))
            .count();
        let free = layout.slots.iter().filter(|s| matches!(s.kind, FrameSlotKind::Free(_))).count();
        if args.len() != positional + free {
            return Err(ExecError::ArgCount { expected: positional + free, found: args.len() });
        }
        let mut slots = vec![ObjRef::NULL; layout.len()];
        for (field, slot) in slots.iter_mut().zip(&layout.slots) {
            let source = match slot.kind {
                FrameSlotKind::Arg(i) => args[i as usize],
                FrameSlotKind::Free(j) => args[positional + j as usize],
                _ => continue,
            };
            runtime.incref(source);
            *field = source;
        }
        Ok(Frame { state: 0, sent: ObjRef::NULL, thrown: ObjRef::NULL, slots })
    }

    pub fn is_finished(&self) -> bool {
        self.state == TERMINAL_STATE as i64
    }

    /// Drop every reference held by an abandoned frame
    pub fn release(&mut self, runtime: &mut dyn HostRuntime) {
        for obj in self.slots.iter_mut().chain([&mut self.sent, &mut self.thrown]) {
            let obj = std::mem::replace(obj, ObjRef::NULL);
            if !obj.is_null() {
                runtime.decref(obj);
            }
        }
        self.state = TERMINAL_STATE as i64;
    }
}

/// What the resumer hands a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// First entry
    Start,
    /// Deliver a value, stolen by the frame
    Send(ObjRef),
    /// Raise an exception at the suspension point, stolen by the frame
    Throw(ObjRef),
}

enum Step {
    Next,
    Unwind(BlockRef),
}

struct Executor<'a> {
    code: &'a CodeObject,
    func: &'a Function,
    runtime: &'a mut dyn HostRuntime,
    args: &'a [Value],
    frame: Option<&'a mut Frame>,
    values: FxHashMap<ValueId, Value>,
    slots: Vec<Value>,
    step_limit: usize,
    steps: usize,
}

impl Executor<'_> {
    fn get(&self, value: ValueId) -> Result<Value, ExecError> {
        self.values.get(&value).copied().ok_or(ExecError::UndefinedValue(value))
    }

    fn int(&self, value: ValueId) -> Result<i64, ExecError> {
        match self.get(value)? {
            Value::Int(i) => Ok(i),
            _ => Err(ExecError::TypeMismatch { value, expected: IrType::I64 }),
        }
    }

    fn boolean(&self, value: ValueId) -> Result<bool, ExecError> {
        match self.get(value)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ExecError::TypeMismatch { value, expected: IrType::Bool }),
        }
    }

    fn obj(&self, value: ValueId) -> Result<ObjRef, ExecError> {
        match self.get(value)? {
            Value::Obj(o) => Ok(o),
            _ => Err(ExecError::TypeMismatch { value, expected: IrType::Obj }),
        }
    }

    fn tick(&mut self) -> Result<(), ExecError> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(ExecError::StepLimit(self.step_limit));
        }
        Ok(())
    }

    fn frame_mut(&mut self, field: FrameField) -> Result<&mut Frame, ExecError> {
        self.frame.as_deref_mut().ok_or(ExecError::MissingFrame(field))
    }

    fn load_frame(&mut self, field: FrameField) -> Result<Value, ExecError> {
        let frame = self.frame_mut(field)?;
        Ok(match field {
            FrameField::State => Value::Int(frame.state),
            FrameField::SentValue => Value::Obj(frame.sent),
            FrameField::Thrown => Value::Obj(frame.thrown),
            FrameField::Slot(i) => Value::Obj(
                *frame
                    .slots
                    .get(i as usize)
                    .ok_or(ExecError::MissingFrame(field))?,
            ),
        })
    }

    fn store_frame(&mut self, field: FrameField, value: ValueId) -> Result<(), ExecError> {
        if field == FrameField::State {
            let state = self.int(value)?;
            self.frame_mut(field)?.state = state;
            return Ok(());
        }
        let obj = self.obj(value)?;
        let frame = self.frame_mut(field)?;
        let target = match field {
            FrameField::SentValue => &mut frame.sent,
            FrameField::Thrown => &mut frame.thrown,
            FrameField::Slot(i) => frame
                .slots
                .get_mut(i as usize)
                .ok_or(ExecError::MissingFrame(field))?,
            FrameField::State => return Ok(()),
        };
        *target = obj;
        Ok(())
    }

    fn fail(&self, block: BlockRef, unwind: Option<BlockRef>) -> Result<Step, ExecError> {
        unwind.map(Step::Unwind).ok_or(ExecError::MissingUnwind(block))
    }

    fn step(&mut self, block: BlockRef, op: &Op) -> Result<Step, ExecError> {
        let result = match op {
            Op::ConstInt { value, .. } => Value::Int(*value),
            Op::ConstBool { value, .. } => Value::Bool(*value),
            Op::ConstObj { index, .. } => {
                let constant = self
                    .code
                    .constants
                    .get(*index as usize)
                    .ok_or(ExecError::BadConstant(*index))?;
                Value::Obj(self.runtime.constant(constant))
            }
            Op::ConstNull { .. } => Value::Obj(ObjRef::NULL),
            Op::LoadArg { index, .. } => *self
                .args
                .get(*index as usize)
                .ok_or(ExecError::ArgCount {
                    expected: self.func.param_count as usize,
                    found: self.args.len(),
                })?,
            Op::LoadSlot { slot, .. } => self.slots[slot.0 as usize],
            Op::StoreSlot { slot, value } => {
                self.slots[slot.0 as usize] = self.get(*value)?;
                return Ok(Step::Next);
            }
            Op::LoadFrame { field, .. } => self.load_frame(*field)?,
            Op::StoreFrame { field, value } => {
                self.store_frame(*field, *value)?;
                return Ok(Step::Next);
            }
            Op::IntBinary { op, lhs, rhs, unwind, .. } => {
                let (a, b) = (self.int(*lhs)?, self.int(*rhs)?);
                match op.eval(a, b) {
                    Some(v) => Value::Int(v),
                    None => {
                        self.runtime.arithmetic_failed(*op, b);
                        return self.fail(block, *unwind);
                    }
                }
            }
            Op::IntCompare { op, lhs, rhs, .. } => {
                Value::Bool(op.eval(self.int(*lhs)?, self.int(*rhs)?))
            }
            Op::IntNeg { operand, unwind, .. } => match self.int(*operand)?.checked_neg() {
                Some(v) => Value::Int(v),
                None => {
                    self.runtime.raise_error("OverflowError", "integer overflow");
                    return Ok(Step::Unwind(*unwind));
                }
            },
            Op::IntNot { operand, .. } => Value::Int(!self.int(*operand)?),
            Op::BoolNot { operand, .. } => Value::Bool(!self.boolean(*operand)?),
            Op::BoolToInt { operand, .. } => Value::Int(self.boolean(*operand)? as i64),
            Op::IntToBool { operand, .. } => Value::Bool(self.int(*operand)? != 0),
            Op::IsNull { value, .. } => Value::Bool(self.obj(*value)?.is_null()),
            Op::CallHost { dest, func, args, unwind } => {
                let args = args.iter().map(|v| self.get(*v)).collect::<Result<Vec<_>, _>>()?;
                match self.runtime.call(&self.code.names, *func, &args) {
                    Ok(result) => match (dest, result) {
                        (Some(dest), Some(value)) => {
                            self.values.insert(*dest, value);
                            return Ok(Step::Next);
                        }
                        (Some(dest), None) => {
                            return Err(ExecError::TypeMismatch {
                                value: *dest,
                                expected: func.result_type().unwrap_or(IrType::Obj),
                            })
                        }
                        (None, _) => return Ok(Step::Next),
                    },
                    Err(Raised) => return self.fail(block, *unwind),
                }
            }
            Op::GuardBound { value, local, unwind } => {
                if self.obj(*value)?.is_null() {
                    let name = self.code.slot_name(*local as usize).unwrap_or("?");
                    let message = format!(
                        "cannot access local variable '{}' where it is not associated with a value",
                        name
                    );
                    self.runtime.raise_error("UnboundLocalError", &message);
                    return Ok(Step::Unwind(*unwind));
                }
                return Ok(Step::Next);
            }
            Op::IncRef { value } => {
                let obj = self.obj(*value)?;
                if obj.is_null() {
                    return Err(ExecError::NullRelease(*value));
                }
                self.runtime.incref(obj);
                return Ok(Step::Next);
            }
            Op::DecRef { value } => {
                let obj = self.obj(*value)?;
                if obj.is_null() {
                    return Err(ExecError::NullRelease(*value));
                }
                self.runtime.decref(obj);
                return Ok(Step::Next);
            }
            Op::XDecRef { value } => {
                let obj = self.obj(*value)?;
                if !obj.is_null() {
                    self.runtime.decref(obj);
                }
                return Ok(Step::Next);
            }
            Op::FetchException { .. } => Value::Obj(self.runtime.fetch_exception()),
            Op::GilRelease => {
                self.runtime.release_lock();
                return Ok(Step::Next);
            }
            Op::GilAcquire => {
                self.runtime.acquire_lock();
                return Ok(Step::Next);
            }
        };
        if let Some(dest) = op.dest() {
            self.values.insert(dest, result);
        }
        Ok(Step::Next)
    }

    fn enter(&mut self, block: BlockRef, from: Option<BlockRef>) -> Result<(), ExecError> {
        let phis = &self.func.block(block).phis;
        if phis.is_empty() {
            return Ok(());
        }
        let mut copies = Vec::with_capacity(phis.len());
        for phi in phis {
            let source = from
                .and_then(|pred| phi.incoming.iter().find(|(p, _)| *p == pred))
                .map(|(_, v)| *v)
                .ok_or(ExecError::MissingPhiIncoming { block, from })?;
            copies.push((phi.dest, self.get(source)?));
        }
        self.values.extend(copies);
        Ok(())
    }

    fn run(&mut self) -> Result<Outcome, ExecError> {
        let func = self.func;
        let mut current = func.entry;
        let mut from = None;
        loop {
            self.tick()?;
            self.enter(current, from)?;
            let block = func.block(current);
            tracing::trace!(block = %current, origin = %block.origin, "interp block");
            let mut unwound = None;
            for op in &block.ops {
                self.tick()?;
                if let Step::Unwind(target) = self.step(current, op)? {
                    unwound = Some(target);
                    break;
                }
            }
            let next = match unwound {
                Some(target) => target,
                None => match &block.terminator {
                    Terminator::Jump(target) => *target,
                    Terminator::Branch { cond, then_block, else_block } => {
                        if self.boolean(*cond)? {
                            *then_block
                        } else {
                            *else_block
                        }
                    }
                    Terminator::Switch { value, cases, default } => {
                        let key = self.int(*value)?;
                        cases.iter().find(|(k, _)| *k == key).map_or(*default, |(_, b)| *b)
                    }
                    Terminator::Return(value) => return Ok(Outcome::Returned(self.get(*value)?)),
                    Terminator::Suspend(value) => return Ok(Outcome::Suspended(self.get(*value)?)),
                    Terminator::Raise => return Ok(Outcome::Raised),
                    Terminator::Unreachable => return Err(ExecError::Unreachable(current)),
                    Terminator::None => return Err(ExecError::Unterminated(current)),
                },
            };
            from = Some(current);
            current = next;
        }
    }
}

/// Backend that runs IR on the portable executor
#[derive(Debug, Clone)]
pub struct InterpBackend {
    /// Maximum number of blocks plus ops evaluated per run
    pub step_limit: usize,
}

impl Default for InterpBackend {
    fn default() -> Self {
        InterpBackend { step_limit: 1_000_000 }
    }
}

impl InterpBackend {
    pub fn new(step_limit: usize) -> Self {
        InterpBackend { step_limit }
    }

    fn execute(
        &self,
        code: &CodeObject,
        artifact: &CompiledArtifact,
        runtime: &mut dyn HostRuntime,
        args: &[Value],
        frame: Option<&mut Frame>,
    ) -> Result<Outcome, ExecError> {
        let func = &artifact.function;
        let mut executor = Executor {
            code,
            func,
            runtime,
            args,
            frame,
            values: FxHashMap::default(),
            slots: func.slots.iter().map(|s| Value::zero(s.ty)).collect(),
            step_limit: self.step_limit,
            steps: 0,
        };
        executor.run()
    }

    /// Run a function that is not a state machine
    ///
    /// `args` are borrowed for the duration of the call.
    pub fn run(
        &self,
        code: &CodeObject,
        artifact: &CompiledArtifact,
        runtime: &mut dyn HostRuntime,
        args: &[Value],
    ) -> Result<Outcome, ExecError> {
        if artifact.is_state_machine() {
            return Err(ExecError::NeedsFrame);
        }
        if args.len() != artifact.function.param_count as usize {
            return Err(ExecError::ArgCount {
                expected: artifact.function.param_count as usize,
                found: args.len(),
            });
        }
        self.execute(code, artifact, runtime, args, None)
    }

    /// Create the frame of a state machine
    pub fn start(
        &self,
        artifact: &CompiledArtifact,
        runtime: &mut dyn HostRuntime,
        args: &[ObjRef],
    ) -> Result<Frame, ExecError> {
        let layout = artifact.frame.as_ref().ok_or(ExecError::MissingFrame(FrameField::State))?;
        Frame::new(layout, args, runtime)
    }

    /// Run a state machine until it suspends, returns or raises
    pub fn resume(
        &self,
        code: &CodeObject,
        artifact: &CompiledArtifact,
        runtime: &mut dyn HostRuntime,
        frame: &mut Frame,
        resume: Resume,
    ) -> Result<Outcome, ExecError> {
        match resume {
            Resume::Start => {}
            Resume::Send(value) => frame.sent = value,
            Resume::Throw(exc) => frame.thrown = exc,
        }
        self.execute(code, artifact, runtime, &[], Some(frame))
    }
}

impl CodegenBackend for InterpBackend {
    fn name(&self) -> &str {
        "interp"
    }

    /// The "code" is the textual IR the executor will walk
    fn compile_function(&self, artifact: &CompiledArtifact) -> Result<CompiledCode, CodegenError> {
        Ok(CompiledCode {
            code: artifact.function.to_string().into_bytes(),
            entry_offset: 0,
            relocations: host_relocations(artifact),
        })
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::Portable, pointer_size: std::mem::size_of::<usize>() }
    }
}
