//! Two-pass lowering from the analyzed CFG to IR
//!
//! Pass 1 allocates one IR block per CFG block, one phi per merge
//! placeholder and one slot per local, cell and free variable. Pass 2 walks
//! the blocks in reverse postorder with an abstract operand stack: pops read
//! handles without materializing anything, pushes record produced values, and
//! every outgoing edge hands its stack to the successor, completing
//! placeholders as the last predecessor arrives.
//!
//! Opcode semantics sit behind [`OpcodeLowering`], implemented once per mode.

pub mod integer;
pub mod object;
pub mod stack;
pub mod unwind;

use rustc_hash::FxHashMap;

use kiln_bytecode::{CodeObject, Opcode};

use crate::analysis::{BlockId, ControlFlowGraph, EdgeKind, Instruction, Traversal};
use crate::error::{StructuralVerificationError, UnsupportedOpcode};
use crate::host::HostFn;
use crate::ir::{
    BlockOrigin, BlockRef, FrameField, Function, IrBuilder, IrType, Mode, Op, Phi, SlotId, SlotKind,
    Terminator, ValueId,
};
use crate::ssa::{self, MergePlan, MergeTable, StackValue};
use crate::suspend::{DispatchTable, FrameLayout, SuspensionPlan};

pub use integer::IntegerLowering;
pub use object::ObjectLowering;
pub use stack::{AbstractStack, Borrowed, Owned};
use unwind::{HandlerSpill, PadKey};

/// Failure while lowering one function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LowerError {
    #[error(transparent)]
    Structural(#[from] StructuralVerificationError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOpcode),
}

/// Lowering parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerOptions {
    pub mode: Mode,
    /// Bracket calls into uncompiled code with `GilRelease`/`GilAcquire`
    pub release_gil: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions { mode: Mode::Object, release_gil: false }
    }
}

/// Result of lowering one function
#[derive(Debug, Clone)]
pub struct LowerOutput {
    pub function: Function,
    pub placeholders: usize,
    pub completed_placeholders: usize,
    pub landing_pads: usize,
    pub dispatch: Option<DispatchTable>,
    pub frame: Option<FrameLayout>,
}

/// Whether lowering continues after an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The current block was terminated (an unconditional raise)
    Terminated,
}

/// Condition of a two-way jump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchCond {
    pub value: ValueId,
    /// The jump is taken when `value` equals this
    pub jump_if: bool,
}

/// Mode-specific opcode semantics
pub trait OpcodeLowering {
    fn mode(&self) -> Mode;

    /// Lower an instruction that does not transfer control
    fn lower(&self, cx: &mut FunctionLowering<'_>, instr: &Instruction) -> Result<Flow, LowerError>;

    /// Pop the operand of a conditional jump and produce its condition
    fn branch_condition(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<BranchCond, LowerError>;

    /// Materialize constant `index` as an owned value
    fn constant(&self, cx: &mut FunctionLowering<'_>, index: u32) -> Result<Owned, LowerError>;

    /// Advance the iterator at TOS, returning the item or null when exhausted
    fn iterate(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<ValueId, LowerError> {
        Err(cx.unsupported(instr).into())
    }
}

/// Lowering state of one CFG block
#[derive(Debug, Clone)]
pub struct BlockState {
    pub ir: BlockRef,
    /// Entry stack of a single-predecessor block, set by its incoming edge
    pub entry: Option<Vec<StackValue>>,
    pub expected: usize,
    pub received: usize,
    pub compiled: bool,
}

/// Where a local slot index lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStorage {
    Slot(SlotId),
    Frame(FrameField),
}

/// Per-function lowering context
pub struct FunctionLowering<'a> {
    pub(crate) code: &'a CodeObject,
    pub(crate) cfg: &'a ControlFlowGraph,
    pub(crate) options: LowerOptions,
    pub(crate) func: Function,
    pub(crate) current: BlockRef,
    pub(crate) stack: AbstractStack,
    /// Owned temporaries not yet released, stolen or pushed
    pub(crate) temps: Vec<ValueId>,
    pub(crate) instr: Option<Instruction>,
    pub(crate) merges: MergeTable,
    pub(crate) states: Vec<BlockState>,
    pub(crate) locals: Vec<LocalStorage>,
    pub(crate) handler_spills: FxHashMap<u32, HandlerSpill>,
    pub(crate) pads: FxHashMap<PadKey, BlockRef>,
    pub(crate) raise_block: Option<BlockRef>,
    pub(crate) suspension: Option<&'a SuspensionPlan>,
    pub(crate) resume_blocks: FxHashMap<u32, BlockRef>,
}

/// Lower an analyzed function
///
/// `cfg` must have depths and traversal order computed. `suspension` is
/// present exactly when the function becomes a state machine.
pub fn lower_function(
    code: &CodeObject,
    cfg: &ControlFlowGraph,
    traversal: &Traversal,
    plan: &MergePlan,
    suspension: Option<&SuspensionPlan>,
    options: LowerOptions,
) -> Result<LowerOutput, LowerError> {
    // Rejected opcodes fail before any IR exists
    for instr in &cfg.instructions {
        if instr.opcode.is_outside_compiled_subset() {
            return Err(UnsupportedOpcode {
                opcode: instr.opcode,
                offset: instr.offset,
                mode: options.mode,
            }
            .into());
        }
    }

    let mut cx = FunctionLowering::new(code, cfg, suspension, options);
    let emitter: &dyn OpcodeLowering = match options.mode {
        Mode::Object => &ObjectLowering,
        Mode::Integer => &IntegerLowering,
    };

    cx.allocate(traversal, plan);
    cx.emit_entry()?;

    for &id in &traversal.rpo {
        cx.lower_block(emitter, id)?;
    }

    cx.finish(traversal)
}

impl<'a> FunctionLowering<'a> {
    fn new(
        code: &'a CodeObject,
        cfg: &'a ControlFlowGraph,
        suspension: Option<&'a SuspensionPlan>,
        options: LowerOptions,
    ) -> Self {
        let param_count = if suspension.is_some() {
            0
        } else {
            code.arg_count + code.freevars.len() as u32
        };
        let mut func = Function::new(code.name.clone(), options.mode, param_count);
        let entry_origin = if suspension.is_some() {
            BlockOrigin::Dispatch
        } else {
            BlockOrigin::Prologue
        };
        func.entry = func.add_block(entry_origin);
        let current = func.entry;
        FunctionLowering {
            code,
            cfg,
            options,
            func,
            current,
            stack: AbstractStack::default(),
            temps: Vec::new(),
            instr: None,
            merges: MergeTable::new(),
            states: Vec::new(),
            locals: Vec::new(),
            handler_spills: FxHashMap::default(),
            pads: FxHashMap::default(),
            raise_block: None,
            suspension,
            resume_blocks: FxHashMap::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    pub fn code(&self) -> &'a CodeObject {
        self.code
    }

    /// Byte offset of the instruction being lowered
    pub fn offset(&self) -> u32 {
        self.instr.map(|i| i.offset).unwrap_or(0)
    }

    pub(crate) fn builder(&mut self) -> IrBuilder<'_> {
        let mut b = IrBuilder::new(&mut self.func);
        b.switch_to_block(self.current);
        b
    }

    pub(crate) fn unsupported(&self, instr: &Instruction) -> UnsupportedOpcode {
        UnsupportedOpcode { opcode: instr.opcode, offset: instr.offset, mode: self.options.mode }
    }

    // ===== Pass 1 =====

    fn allocate(&mut self, traversal: &Traversal, plan: &MergePlan) {
        let stack_ty = self.options.mode.stack_type();
        let local_ty = stack_ty;

        // Local, cell and free-variable storage
        for index in 0..self.code.slot_count() {
            let frame_field = self.suspension.and_then(|s| s.layout.local_field(index));
            let storage = match frame_field {
                Some(field) => LocalStorage::Frame(field),
                None => {
                    let name = self.code.slot_name(index).unwrap_or("?").to_string();
                    let kind = if index < self.code.varnames.len() {
                        SlotKind::Local(index as u32)
                    } else {
                        SlotKind::Cell(index as u32)
                    };
                    LocalStorage::Slot(self.func.add_slot(name, local_ty, kind))
                }
            };
            self.locals.push(storage);
        }
        if let Some(suspension) = self.suspension {
            self.func.frame_slots = suspension.layout.types();
        }

        // Blocks and merge phis
        for block in &self.cfg.blocks {
            let ir = self.func.add_block(BlockOrigin::Bytecode(block.start));
            let expected = if traversal.is_reachable(block.id) {
                ssa::reachable_predecessors(self.cfg, traversal, block.id)
            } else {
                0
            };
            if let Some(spec) = plan.get(block.id) {
                let dests: Vec<ValueId> = (0..spec.placeholders)
                    .map(|_| self.func.alloc_value(stack_ty))
                    .collect();
                self.func.block_mut(ir).phis = dests
                    .iter()
                    .map(|&dest| Phi {
                        dest,
                        ty: stack_ty,
                        incoming: Vec::new(),
                    })
                    .collect();
                self.merges.open(block.id, &dests, spec.predecessors);
            }
            self.states.push(BlockState {
                ir,
                entry: None,
                expected,
                received: 0,
                compiled: false,
            });
        }

        // Spill slots for every handler
        for region in &self.cfg.regions {
            if self.handler_spills.contains_key(&region.target) {
                continue;
            }
            let slots = (0..region.depth)
                .map(|i| {
                    let kind = SlotKind::Spill { handler: region.target, index: i };
                    self.func.add_slot(format!("spill{}@{}", i, region.target), IrType::Obj, kind)
                })
                .collect();
            let lasti = region.lasti.then(|| {
                let kind = SlotKind::Lasti { handler: region.target };
                self.func.add_slot(format!("lasti@{}", region.target), IrType::Obj, kind)
            });
            self.handler_spills.insert(region.target, HandlerSpill { slots, lasti });
        }

        // Resumption entry points
        if let Some(suspension) = self.suspension {
            for point in &suspension.points {
                let block = self.func.add_block(BlockOrigin::Resume(point.state));
                self.resume_blocks.insert(point.state, block);
            }
        }
    }

    fn emit_entry(&mut self) -> Result<(), LowerError> {
        let Some(entry) = self.cfg.entry() else {
            return Err(
                StructuralVerificationError::MalformedIr("function has no code".into()).into(),
            );
        };
        let entry_ir = self.states[entry.index()].ir;
        self.current = self.func.entry;
        if self.suspension.is_some() {
            self.emit_dispatch(entry_ir)?;
        } else {
            self.emit_prologue();
            self.builder().terminate(Terminator::Jump(entry_ir));
        }
        let state = &mut self.states[entry.index()];
        state.received += 1;
        state.entry = Some(Vec::new());
        Ok(())
    }

    /// Copy arguments into slots and clear everything else
    fn emit_prologue(&mut self) {
        let mode = self.options.mode;
        let ty = mode.stack_type();
        let arg_count = self.code.arg_count as usize;
        let free_base = self.code.varnames.len() + self.code.cellvars.len();
        for index in 0..self.locals.len() {
            let LocalStorage::Slot(slot) = self.locals[index] else { continue };
            let arg = if index < arg_count {
                Some(index as u32)
            } else if index >= free_base {
                Some((arg_count + index - free_base) as u32)
            } else {
                None
            };
            let mut b = self.builder();
            let value = match (arg, mode) {
                (Some(arg), _) => {
                    let v = b.load_arg(arg, ty);
                    if ty.is_refcounted() {
                        b.inc_ref(v);
                    }
                    v
                }
                (None, Mode::Object) => b.const_null(),
                (None, Mode::Integer) => b.const_int(0),
            };
            b.store_slot(slot, value);
        }
    }

    // ===== Pass 2 =====

    fn lower_block(&mut self, emitter: &dyn OpcodeLowering, id: BlockId) -> Result<(), LowerError> {
        let cfg = self.cfg;
        let block = cfg.block(id);
        self.current = self.states[id.index()].ir;
        self.temps.clear();

        let entry = if block.is_exception_handler {
            self.handler_entry_stack(id)?
        } else if let Some(stack) = self.merges.entry_stack(id) {
            stack
        } else {
            let expected = self.states[id.index()].expected;
            self.states[id.index()].entry.take().ok_or(
                StructuralVerificationError::IncomingCountMismatch {
                    block: block.start,
                    expected,
                    found: 0,
                },
            )?
        };
        self.stack = AbstractStack::new(entry);
        tracing::trace!(
            block = %id,
            start = block.start,
            depth = self.stack.len(),
            "lowering block"
        );

        let instrs = cfg.instrs(id);
        let Some((last, body)) = instrs.split_last() else {
            return Err(
                StructuralVerificationError::MalformedIr(format!("empty block {}", id)).into(),
            );
        };
        for instr in body {
            self.instr = Some(*instr);
            if self.lower_one(emitter, instr)? == Flow::Terminated {
                return Err(StructuralVerificationError::MalformedIr(format!(
                    "{} at offset {} terminates mid-block",
                    instr.opcode, instr.offset
                ))
                .into());
            }
            self.check_temps(instr)?;
        }
        self.instr = Some(*last);
        self.lower_exit(emitter, id, last)?;
        self.check_temps(last)?;
        self.states[id.index()].compiled = true;
        Ok(())
    }

    fn check_temps(&self, instr: &Instruction) -> Result<(), LowerError> {
        if self.temps.is_empty() {
            Ok(())
        } else {
            Err(StructuralVerificationError::MalformedIr(format!(
                "{} at offset {} leaves {} owned temporaries",
                instr.opcode,
                instr.offset,
                self.temps.len()
            ))
            .into())
        }
    }

    /// Stack housekeeping shared by both modes, then the mode's own semantics
    fn lower_one(
        &mut self,
        emitter: &dyn OpcodeLowering,
        instr: &Instruction,
    ) -> Result<Flow, LowerError> {
        match instr.opcode {
            Opcode::Nop | Opcode::Resume => {}
            Opcode::PopTop => {
                let v = self.pop()?;
                self.release(v);
            }
            Opcode::Copy => {
                let depth = (instr.arg as usize)
                    .checked_sub(1)
                    .ok_or_else(|| self.underflow(instr))?;
                let v = self.peek(depth)?;
                let copy = self.dup(v);
                self.push(copy);
            }
            Opcode::EndFor => {
                let iterator = self.pop()?;
                self.release(iterator);
            }
            Opcode::Swap => {
                if !self.stack.swap_top(instr.arg as usize) {
                    return Err(self.underflow(instr).into());
                }
            }
            _ => return emitter.lower(self, instr),
        }
        Ok(Flow::Continue)
    }

    /// Lower the last instruction of block `id` and hand its stack to successors
    fn lower_exit(
        &mut self,
        emitter: &dyn OpcodeLowering,
        id: BlockId,
        instr: &Instruction,
    ) -> Result<(), LowerError> {
        let op = instr.opcode;
        let cfg = self.cfg;
        let succ = |kind: EdgeKind| successor(cfg, id, kind);

        if op.is_unconditional_jump() {
            let target = succ(EdgeKind::Unconditional)?;
            self.jump_to(target)?;
        } else if op == Opcode::ForIter {
            let item = succ(EdgeKind::IterItem)?;
            let exhausted = succ(EdgeKind::IterExhausted)?;
            let next = emitter.iterate(self, instr)?;
            let is_done = self.builder().is_null(next);
            let from = self.current;
            let (item_ir, done_ir) = (self.ir_of(item), self.ir_of(exhausted));
            let base = self.stack.as_slice().to_vec();
            self.deliver(exhausted, from, &base)?;
            let mut with_item = base;
            with_item.push(StackValue::Concrete(next));
            self.deliver(item, from, &with_item)?;
            self.builder().terminate(Terminator::Branch {
                cond: is_done,
                then_block: done_ir,
                else_block: item_ir,
            });
        } else if op.is_conditional_jump() {
            let taken = succ(EdgeKind::ConditionalTrue)?;
            let not_taken = succ(EdgeKind::ConditionalFalse)?;
            let cond = emitter.branch_condition(self, instr)?;
            let from = self.current;
            let stack = self.stack.as_slice().to_vec();
            self.deliver(taken, from, &stack)?;
            self.deliver(not_taken, from, &stack)?;
            let (t, f) = (self.ir_of(taken), self.ir_of(not_taken));
            let (then_block, else_block) = if cond.jump_if { (t, f) } else { (f, t) };
            self.builder().terminate(Terminator::Branch {
                cond: cond.value,
                then_block,
                else_block,
            });
        } else if op.is_return() {
            let value = match op {
                Opcode::ReturnConst => emitter.constant(self, instr.arg)?,
                _ => self.pop()?,
            };
            self.emit_return(value)?;
        } else if op.is_suspension() && self.suspension.is_some() {
            let cont = succ(EdgeKind::Resume)?;
            self.lower_suspension(instr, cont)?;
        } else {
            let flow = self.lower_one(emitter, instr)?;
            if flow == Flow::Continue {
                let next = succ(EdgeKind::FallThrough)?;
                self.jump_to(next)?;
            } else if !op.is_raise() {
                return Err(StructuralVerificationError::MalformedIr(format!(
                    "{} at offset {} terminated its block",
                    op, instr.offset
                ))
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn ir_of(&self, block: BlockId) -> BlockRef {
        self.states[block.index()].ir
    }

    fn jump_to(&mut self, target: BlockId) -> Result<(), LowerError> {
        let from = self.current;
        let stack = self.stack.as_slice().to_vec();
        self.deliver(target, from, &stack)?;
        let ir = self.ir_of(target);
        self.builder().terminate(Terminator::Jump(ir));
        Ok(())
    }

    /// Hand an outgoing stack to `target` along the edge from IR block `from`
    pub(crate) fn deliver(
        &mut self,
        target: BlockId,
        from: BlockRef,
        stack: &[StackValue],
    ) -> Result<(), LowerError> {
        let start = self.cfg.block(target).start;
        let values: Vec<ValueId> = stack.iter().map(|&v| self.merges.resolve(v)).collect();
        let state = &mut self.states[target.index()];
        state.received += 1;
        let (received, expected, ir) = (state.received, state.expected, state.ir);

        if let Some(ids) = self.merges.placeholders(target).map(<[_]>::to_vec) {
            if ids.len() != values.len() {
                return Err(StructuralVerificationError::DepthMismatch {
                    block: start,
                    expected: ids.len() as u32,
                    found: values.len() as u32,
                }
                .into());
            }
            for (pos, (id, value)) in ids.into_iter().zip(values).enumerate() {
                if let Some(incoming) = self.merges.add_incoming(id, from, value)? {
                    self.func.block_mut(ir).phis[pos].incoming = incoming;
                }
            }
        } else if expected > 1 {
            // A merge of empty stacks has nothing to carry.
            if !values.is_empty() {
                return Err(StructuralVerificationError::DepthMismatch {
                    block: start,
                    expected: 0,
                    found: values.len() as u32,
                }
                .into());
            }
            if received == 1 {
                self.states[target.index()].entry = Some(Vec::new());
            }
        } else if received > 1 || self.states[target.index()].entry.is_some() {
            return Err(StructuralVerificationError::IncomingCountMismatch {
                block: start,
                expected,
                found: received,
            }
            .into());
        } else {
            self.states[target.index()].entry =
                Some(values.into_iter().map(StackValue::Concrete).collect());
        }
        Ok(())
    }

    fn finish(mut self, traversal: &Traversal) -> Result<LowerOutput, LowerError> {
        self.merges.finish()?;
        for block in &self.cfg.blocks {
            let state = &self.states[block.id.index()];
            if traversal.is_reachable(block.id)
                && state.received != state.expected
                && !block.is_exception_handler
            {
                return Err(StructuralVerificationError::IncomingCountMismatch {
                    block: block.start,
                    expected: state.expected,
                    found: state.received,
                }
                .into());
            }
        }

        let landing_pads = self.pads.len();
        let placeholders = self.merges.len();
        let completed_placeholders = self.merges.completed_count();
        let remap = self.func.remove_unreachable();
        let dispatch = self.suspension.map(|_| {
            let mut entries: Vec<(u32, BlockRef)> = self
                .resume_blocks
                .iter()
                .filter_map(|(&state, &block)| remap[block.index()].map(|b| (state, b)))
                .collect();
            entries.sort_unstable();
            DispatchTable { entry: self.func.entry, states: entries }
        });
        tracing::debug!(
            name = %self.func.name,
            blocks = self.func.blocks.len(),
            placeholders,
            landing_pads,
            "lowered function"
        );
        Ok(LowerOutput {
            function: self.func,
            placeholders,
            completed_placeholders,
            landing_pads,
            dispatch,
            frame: self.suspension.map(|s| s.layout.clone()),
        })
    }

    // ===== Handles =====

    fn underflow(&self, instr: &Instruction) -> StructuralVerificationError {
        let fx = instr.effect();
        StructuralVerificationError::StackUnderflow {
            opcode: instr.opcode,
            offset: instr.offset,
            pops: fx.pops,
            depth: self.stack.len() as u32,
        }
    }

    fn underflow_here(&self) -> StructuralVerificationError {
        match self.instr {
            Some(instr) => self.underflow(&instr),
            None => StructuralVerificationError::MalformedIr("pop outside an instruction".into()),
        }
    }

    /// Take ownership of a fresh reference
    pub(crate) fn adopt(&mut self, value: ValueId) -> Owned {
        self.temps.push(value);
        Owned::new(value)
    }

    fn disown(&mut self, value: ValueId) {
        if let Some(pos) = self.temps.iter().rposition(|&t| t == value) {
            self.temps.remove(pos);
        }
    }

    /// Pop TOS, taking over the stack's reference
    pub fn pop(&mut self) -> Result<Owned, LowerError> {
        let entry = self.stack.pop().ok_or_else(|| self.underflow_here())?;
        let value = self.merges.resolve(entry);
        Ok(self.adopt(value))
    }

    /// View of the entry `n` below TOS
    pub fn peek(&self, n: usize) -> Result<Borrowed<'static>, LowerError> {
        let entry = self.stack.peek(n).ok_or_else(|| self.underflow_here())?;
        Ok(Borrowed::unowned(self.merges.resolve(entry)))
    }

    /// Push, handing the reference to the stack
    pub fn push(&mut self, value: Owned) {
        let value = self.hand_off(value);
        self.stack.push(StackValue::Concrete(value));
    }

    /// Give up the handle once the reference moved out of the function
    pub(crate) fn hand_off(&mut self, value: Owned) -> ValueId {
        let value = value.into_value();
        self.disown(value);
        value
    }

    /// Give up a reference
    pub fn release(&mut self, value: Owned) {
        let value = self.hand_off(value);
        if self.func.value_type(value).is_some_and(|t| t.is_refcounted()) {
            self.builder().dec_ref(value);
        }
    }

    /// A new reference to a borrowed value
    pub fn dup(&mut self, value: Borrowed<'_>) -> Owned {
        let value = value.value();
        if self.func.value_type(value).is_some_and(|t| t.is_refcounted()) {
            self.builder().inc_ref(value);
        }
        self.adopt(value)
    }

    // ===== Host calls =====

    fn emit_call(
        &mut self,
        func: HostFn,
        args: Vec<ValueId>,
    ) -> Result<Option<ValueId>, LowerError> {
        let bracket = self.options.release_gil
            && func.enters_interpreter()
            && self.options.mode == Mode::Object;
        let unwind = if func.can_fail() {
            Some(self.unwind_target(bracket)?)
        } else {
            None
        };
        let mut b = self.builder();
        if bracket {
            b.emit(Op::GilRelease);
        }
        let result = b.call_host(func, args, unwind);
        if bracket {
            b.emit(Op::GilAcquire);
        }
        Ok(result)
    }

    fn call_result(&mut self, func: HostFn, args: &[Borrowed<'_>]) -> Result<ValueId, LowerError> {
        let values = args.iter().map(|a| a.value()).collect();
        self.emit_call(func, values)?
            .ok_or_else(|| {
                StructuralVerificationError::MalformedIr(format!("{} has no result", func)).into()
            })
    }

    /// Call returning a new reference
    pub fn call_new(&mut self, func: HostFn, args: &[Borrowed<'_>]) -> Result<Owned, LowerError> {
        let value = self.call_result(func, args)?;
        Ok(self.adopt(value))
    }

    /// Call returning an unboxed flag
    pub fn call_flag(
        &mut self,
        func: HostFn,
        args: &[Borrowed<'_>],
    ) -> Result<ValueId, LowerError> {
        self.call_result(func, args)
    }

    /// Call returning a new reference or null, which is left unowned
    pub fn call_raw(&mut self, func: HostFn, args: &[Borrowed<'_>]) -> Result<ValueId, LowerError> {
        self.call_result(func, args)
    }

    /// Call with no result
    pub fn call_void(&mut self, func: HostFn, args: &[Borrowed<'_>]) -> Result<(), LowerError> {
        let values = args.iter().map(|a| a.value()).collect();
        self.emit_call(func, values)?;
        Ok(())
    }

    /// Call that steals every argument
    pub fn call_stealing(
        &mut self,
        func: HostFn,
        args: Vec<Owned>,
    ) -> Result<Option<Owned>, LowerError> {
        let values: Vec<ValueId> = args.into_iter().map(Owned::into_value).collect();
        for &v in &values {
            self.disown(v);
        }
        let result = self.emit_call(func, values)?;
        Ok(result.map(|v| self.adopt(v)))
    }

    /// Call that never returns normally; ends the current block
    ///
    /// The arguments are borrowed by the call and released on the unwind path.
    pub fn call_raise(&mut self, func: HostFn, args: Vec<Owned>) -> Result<Flow, LowerError> {
        let values: Vec<ValueId> = args.iter().map(Owned::value).collect();
        self.emit_call(func, values.clone())?;
        for owned in args {
            self.disown(owned.into_value());
        }
        self.builder().terminate(Terminator::Unreachable);
        Ok(Flow::Terminated)
    }

    /// Box an unboxed flag
    pub fn box_bool(&mut self, flag: ValueId) -> Result<Owned, LowerError> {
        let value = self
            .emit_call(HostFn::BoxBool, vec![flag])?
            .ok_or_else(|| {
                StructuralVerificationError::MalformedIr("box.bool has no result".into())
            })?;
        Ok(self.adopt(value))
    }

    // ===== Locals =====

    pub(crate) fn storage(&self, index: u32) -> Result<LocalStorage, LowerError> {
        self.locals.get(index as usize).copied().ok_or_else(|| {
            StructuralVerificationError::MalformedIr(format!("local {} has no storage", index))
                .into()
        })
    }

    /// Current content of a local, still owned by its storage
    pub fn load_local(&mut self, index: u32) -> Result<Borrowed<'static>, LowerError> {
        let value = match self.storage(index)? {
            LocalStorage::Slot(slot) => self.builder().load_slot(slot),
            LocalStorage::Frame(field) => self.builder().load_frame(field),
        };
        Ok(Borrowed::unowned(value))
    }

    fn write_local(&mut self, index: u32, value: ValueId) -> Result<(), LowerError> {
        match self.storage(index)? {
            LocalStorage::Slot(slot) => self.builder().store_slot(slot, value),
            LocalStorage::Frame(field) => self.builder().store_frame(field, value),
        }
        Ok(())
    }

    /// Move a reference into a local, overwriting without releasing
    pub fn store_local(&mut self, index: u32, value: Owned) -> Result<(), LowerError> {
        let value = self.hand_off(value);
        self.write_local(index, value)
    }

    /// Unbind a local without releasing its content
    pub fn clear_local(&mut self, index: u32) -> Result<(), LowerError> {
        let null = self.builder().const_null();
        self.write_local(index, null)
    }

    /// Raise `UnboundLocalError` through the unwind path when `value` is null
    pub fn guard_bound(&mut self, value: Borrowed<'_>, local: u32) -> Result<(), LowerError> {
        let unwind = self.unwind_target(false)?;
        self.builder().emit(Op::GuardBound { value: value.value(), local, unwind });
        Ok(())
    }

    // ===== Exits =====

    /// Release every slot-resident local
    pub(crate) fn release_slot_locals(&mut self) {
        if !self.options.mode.stack_type().is_refcounted() {
            return;
        }
        let slots: Vec<SlotId> = self
            .locals
            .iter()
            .filter_map(|s| match s {
                LocalStorage::Slot(slot) => Some(*slot),
                LocalStorage::Frame(_) => None,
            })
            .collect();
        let mut b = self.builder();
        for slot in slots {
            let v = b.load_slot(slot);
            b.xdec_ref(v);
        }
    }

    /// Release the stack, every local and, in a state machine, the frame
    pub(crate) fn emit_exit_cleanup(&mut self, stack: &[ValueId]) {
        for &v in stack.iter().rev() {
            if self.func.value_type(v).is_some_and(|t| t.is_refcounted()) {
                self.builder().dec_ref(v);
            }
        }
        self.release_slot_locals();
        if self.suspension.is_some() {
            self.emit_frame_exit();
        }
    }

    fn emit_return(&mut self, value: Owned) -> Result<(), LowerError> {
        let remaining: Vec<ValueId> = self
            .stack
            .take()
            .into_iter()
            .map(|v| self.merges.resolve(v))
            .collect();
        let value = self.hand_off(value);
        self.emit_exit_cleanup(&remaining);
        self.builder().terminate(Terminator::Return(value));
        Ok(())
    }

    /// Shared block that returns failure without releasing anything
    pub(crate) fn bare_raise_block(&mut self) -> BlockRef {
        if let Some(block) = self.raise_block {
            return block;
        }
        let block = self.func.add_block(BlockOrigin::Raise);
        self.func.block_mut(block).terminator = Terminator::Raise;
        self.raise_block = Some(block);
        block
    }
}

fn successor(
    cfg: &ControlFlowGraph,
    id: BlockId,
    kind: EdgeKind,
) -> Result<BlockId, StructuralVerificationError> {
    cfg.block(id)
        .succs
        .iter()
        .find(|e| e.kind == kind)
        .map(|e| e.target)
        .ok_or_else(|| {
            StructuralVerificationError::MalformedIr(format!("block {} has no {} edge", id, kind))
        })
}

#[cfg(test)]
mod tests;
