//! Target IR: SSA values, mutable slots, phis and foreign calls

pub mod builder;
pub mod display;
pub mod instr;
pub mod types;
pub mod verify;

pub use builder::IrBuilder;
pub use instr::{
    Block, BlockOrigin, BlockRef, FrameField, Function, IntBinOp, IntCmpOp, Op, Phi, SlotId,
    SlotInfo, SlotKind, Terminator, ValueId,
};
pub use types::{IrType, Mode};
pub use verify::verify_function;
