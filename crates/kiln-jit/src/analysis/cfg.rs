//! Control-flow graph construction from decoded wordcode
//!
//! Blocks come from the partitioner; successor edges are derived from each
//! block's last instruction. Exception regions add implicit edges from every
//! block overlapping a protected range to that range's handler. Those edges
//! live in a separate list: handler entry depth comes from the exception
//! table, not from fall-through propagation.

use std::ops::Range;

use rustc_hash::FxHashMap;

use kiln_bytecode::Opcode;

use super::decoder::{DecodedFunction, ExceptionRegion, Instruction};
use super::partition::{self, BlockSpan};
use crate::error::StructuralVerificationError;

/// Unique identifier for a basic block in the CFG
///
/// Ids are dense and assigned in start-offset order, so they double as
/// arena indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Why control moves along an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Next block in offset order after a non-branching instruction
    FallThrough,
    /// Target of an unconditional jump
    Unconditional,
    /// Jump taken: the condition tested by the opcode held
    ConditionalTrue,
    /// Jump not taken: fall-through after a conditional jump
    ConditionalFalse,
    /// `ForIter` produced an item
    IterItem,
    /// `ForIter` found the iterator exhausted
    IterExhausted,
    /// Continuation after a suspension point
    Resume,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EdgeKind::FallThrough => "fallthrough",
            EdgeKind::Unconditional => "jump",
            EdgeKind::ConditionalTrue => "taken",
            EdgeKind::ConditionalFalse => "not-taken",
            EdgeKind::IterItem => "item",
            EdgeKind::IterExhausted => "exhausted",
            EdgeKind::Resume => "resume",
        };
        f.write_str(name)
    }
}

/// A normal successor edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub target: BlockId,
    pub kind: EdgeKind,
    /// Set by [`super::order::mark_back_edges`]
    pub back_edge: bool,
}

/// A normal predecessor edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredEdge {
    pub from: BlockId,
    pub kind: EdgeKind,
}

/// An implicit edge to an exception handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEdge {
    pub handler: BlockId,
    /// Index into [`ControlFlowGraph::regions`]
    pub region: usize,
}

/// A basic block in the CFG
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Byte offset of the first instruction (the block's stable key)
    pub start: u32,
    /// Byte offset just past the last instruction
    pub end: u32,
    /// Indices into [`ControlFlowGraph::instructions`]
    pub instrs: Range<usize>,
    pub succs: Vec<Edge>,
    /// One entry per incoming normal edge, in discovery order
    pub preds: Vec<PredEdge>,
    pub exception_edges: Vec<ExceptionEdge>,
    /// Regions whose handler is this block
    pub handler_of: Vec<usize>,
    pub entry_depth: Option<u32>,
    pub exit_depth: Option<u32>,
    pub is_entry: bool,
    pub is_loop_header: bool,
    pub is_exception_handler: bool,
}

impl BasicBlock {
    /// Whether the block needs merge placeholders (more than one normal predecessor)
    pub fn is_merge(&self) -> bool {
        self.preds.len() > 1
    }
}

/// Options that change block boundaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfgOptions {
    /// End a block after every suspension point
    pub split_suspensions: bool,
}

/// A control-flow graph built from decoded wordcode
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub instructions: Vec<Instruction>,
    pub regions: Vec<ExceptionRegion>,
    /// Map from a block's start offset to its id
    pub offset_to_block: FxHashMap<u32, BlockId>,
    /// Stack depth before each instruction, filled in by depth propagation
    pub depth_before: Vec<Option<u32>>,
    pub options: CfgOptions,
}

impl ControlFlowGraph {
    /// The entry block, if the function has any code
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().map(|b| b.id)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    /// Block starting at `offset`
    pub fn block_at(&self, offset: u32) -> Option<BlockId> {
        self.offset_to_block.get(&offset).copied()
    }

    /// Instructions of `id`
    pub fn instrs(&self, id: BlockId) -> &[Instruction] {
        &self.instructions[self.block(id).instrs.clone()]
    }

    /// Last instruction of `id`
    pub fn terminator(&self, id: BlockId) -> &Instruction {
        let range = &self.block(id).instrs;
        &self.instructions[range.end - 1]
    }

    /// The region that protects `offset`
    ///
    /// Regions in a well-formed table never overlap; the first match wins.
    pub fn region_for(&self, offset: u32) -> Option<usize> {
        self.regions.iter().position(|r| r.covers(offset))
    }

    /// Normal successor targets of `id`
    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.block(id).succs.iter().map(|e| e.target)
    }

    /// Successor `n` of `id` for traversal: normal edges first, then handlers
    pub fn traversal_successor(&self, id: BlockId, n: usize) -> Option<(BlockId, bool)> {
        let block = self.block(id);
        if let Some(edge) = block.succs.get(n) {
            return Some((edge.target, false));
        }
        block
            .exception_edges
            .get(n - block.succs.len())
            .map(|e| (e.handler, true))
    }

    /// Total normal edge count
    pub fn edge_count(&self) -> usize {
        self.blocks.iter().map(|b| b.succs.len()).sum()
    }
}

fn successor_edges(
    instr: &Instruction,
    span: &BlockSpan,
    options: CfgOptions,
    code_len: u32,
) -> Result<Vec<(u32, EdgeKind)>, StructuralVerificationError> {
    let op = instr.opcode;
    let next = instr.next_offset;
    let fallthrough = || {
        if next >= code_len {
            Err(StructuralVerificationError::FallsOffEnd(span.start))
        } else {
            Ok(next)
        }
    };

    if op.is_terminator() {
        return Ok(Vec::new());
    }
    if let Some(target) = instr.target {
        return Ok(if op.is_unconditional_jump() {
            vec![(target, EdgeKind::Unconditional)]
        } else if op == Opcode::ForIter {
            vec![(fallthrough()?, EdgeKind::IterItem), (target, EdgeKind::IterExhausted)]
        } else {
            vec![(target, EdgeKind::ConditionalTrue), (fallthrough()?, EdgeKind::ConditionalFalse)]
        });
    }
    if options.split_suspensions && op.is_suspension() {
        return Ok(vec![(fallthrough()?, EdgeKind::Resume)]);
    }
    Ok(vec![(fallthrough()?, EdgeKind::FallThrough)])
}

/// Build a control-flow graph from decoded instructions
pub fn build_cfg(
    decoded: DecodedFunction,
    options: CfgOptions,
) -> Result<ControlFlowGraph, StructuralVerificationError> {
    // Step 1: Partition into blocks
    let spans = partition::partition(&decoded, options.split_suspensions);

    // Step 2: Map start offsets to block ids
    let mut offset_to_block = FxHashMap::default();
    for (idx, span) in spans.iter().enumerate() {
        offset_to_block.insert(span.start, BlockId(idx as u32));
    }

    // Step 3: Create blocks and their successor edges
    let mut blocks = Vec::with_capacity(spans.len());
    for (idx, span) in spans.iter().enumerate() {
        let last = &decoded.instructions[span.last - 1];
        let mut succs = Vec::new();
        for (offset, kind) in successor_edges(last, span, options, decoded.code_len)? {
            let target = offset_to_block
                .get(&offset)
                .copied()
                .ok_or_else(|| {
                    StructuralVerificationError::MalformedIr(format!(
                        "edge from {} to {} does not land on a block",
                        span.start, offset
                    ))
                })?;
            succs.push(Edge { target, kind, back_edge: false });
        }
        blocks.push(BasicBlock {
            id: BlockId(idx as u32),
            start: span.start,
            end: span.end,
            instrs: span.first..span.last,
            succs,
            preds: Vec::new(),
            exception_edges: Vec::new(),
            handler_of: Vec::new(),
            entry_depth: None,
            exit_depth: None,
            is_entry: idx == 0,
            is_loop_header: false,
            is_exception_handler: false,
        });
    }

    // Step 4: Predecessors
    for idx in 0..blocks.len() {
        let from = BlockId(idx as u32);
        for edge in blocks[idx].succs.clone() {
            blocks[edge.target.index()].preds.push(PredEdge { from, kind: edge.kind });
        }
    }

    // Step 5: Exception edges from every overlapping block to the handler
    for (region_idx, region) in decoded.regions.iter().enumerate() {
        let Some(&handler) = offset_to_block.get(&region.target) else { continue };
        blocks[handler.index()].is_exception_handler = true;
        blocks[handler.index()].handler_of.push(region_idx);
        for block in blocks.iter_mut() {
            if block.start < region.end && region.start < block.end {
                block.exception_edges.push(ExceptionEdge { handler, region: region_idx });
            }
        }
    }

    let depth_before = vec![None; decoded.instructions.len()];
    Ok(ControlFlowGraph {
        blocks,
        instructions: decoded.instructions,
        regions: decoded.regions,
        offset_to_block,
        depth_before,
        options,
    })
}
