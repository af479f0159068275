//! Bytecode analysis: decoding, block partitioning, CFG construction,
//! stack-depth propagation, traversal order and local liveness

pub mod bitset;
pub mod cfg;
pub mod decoder;
pub mod depth;
pub mod effect;
pub mod liveness;
pub mod order;
pub mod partition;

pub use bitset::BitSet;
pub use cfg::{BasicBlock, BlockId, CfgOptions, ControlFlowGraph, Edge, EdgeKind, ExceptionEdge};
pub use decoder::{decode_function, DecodeError, DecodedFunction, ExceptionRegion, Instruction};
pub use depth::{propagate_depths, DepthSummary};
pub use effect::{edge_effect, stack_effect, StackEffect, ASYMMETRIC_OPCODES};
pub use liveness::Liveness;
pub use order::{compute_order, reverse_postorder, Traversal};
