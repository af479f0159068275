//! Wordcode assembler
//!
//! [`Assembler`] writes instructions with symbolic jump targets and protected
//! ranges, then resolves them into wordcode. Wide arguments get
//! `ExtendedArg` prefixes; because prefixes change instruction sizes and
//! therefore jump distances, layout is iterated until sizes are stable.

use crate::code::CodeObject;
use crate::exception_table::{self, ExceptionTableEntry};
use crate::opcode::Opcode;
use thiserror::Error;

/// Errors produced while assembling
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// A label was referenced but never bound
    #[error("label L{0} is never bound")]
    UnboundLabel(u32),

    /// A label was bound twice
    #[error("label L{0} is bound twice")]
    Rebound(u32),

    /// A label operand was attached to an opcode that does not jump
    #[error("{0} does not take a jump target")]
    NotAJump(Opcode),

    /// A jump points the wrong way for its opcode
    #[error("{opcode} at instruction {index} cannot reach its target in that direction")]
    WrongDirection {
        /// Offending opcode
        opcode: Opcode,
        /// Instruction index within the assembler
        index: usize,
    },

    /// A fused local operand does not fit in a nibble
    #[error("super-instruction operand {0} does not fit in 4 bits")]
    NibbleOverflow(u32),
}

/// A symbolic position in the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy)]
enum Operand {
    Imm(u32),
    Target(Label),
}

#[derive(Debug, Clone, Copy)]
struct Item {
    opcode: Opcode,
    operand: Operand,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    start: Label,
    end: Label,
    handler: Label,
    depth: u32,
    lasti: bool,
}

/// Output of [`Assembler::finish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Wordcode bytes
    pub code: Vec<u8>,
    /// Encoded exception table
    pub exception_table: Vec<u8>,
    /// Decoded form of the exception table, in code units
    pub entries: Vec<ExceptionTableEntry>,
}

/// Label-based wordcode writer
#[derive(Debug, Default)]
pub struct Assembler {
    items: Vec<Item>,
    labels: Vec<Option<usize>>,
    regions: Vec<Region>,
}

fn prefix_count(arg: u32) -> u32 {
    match arg {
        0..=0xFF => 0,
        0x100..=0xFFFF => 1,
        0x1_0000..=0xFF_FFFF => 2,
        _ => 3,
    }
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions written so far
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Allocate an unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the next instruction written
    pub fn bind(&mut self, label: Label) -> Result<(), AssembleError> {
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(AssembleError::Rebound(label.0));
        }
        *slot = Some(self.items.len());
        Ok(())
    }

    /// Allocate a label bound to the next instruction written
    pub fn here(&mut self) -> Label {
        self.labels.push(Some(self.items.len()));
        Label(self.labels.len() as u32 - 1)
    }

    /// Write an instruction with an immediate argument
    pub fn emit(&mut self, opcode: Opcode, arg: u32) -> &mut Self {
        self.items.push(Item { opcode, operand: Operand::Imm(arg) });
        self
    }

    /// Write an instruction whose argument is unused
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.emit(opcode, 0)
    }

    /// Write a jump to `target`
    pub fn jump(&mut self, opcode: Opcode, target: Label) -> Result<&mut Self, AssembleError> {
        if !opcode.is_jump() {
            return Err(AssembleError::NotAJump(opcode));
        }
        self.items.push(Item { opcode, operand: Operand::Target(target) });
        Ok(self)
    }

    /// Write a fused local-variable instruction operating on `first` then `second`
    pub fn fused(
        &mut self,
        opcode: Opcode,
        first: u32,
        second: u32,
    ) -> Result<&mut Self, AssembleError> {
        for v in [first, second] {
            if v > 0xF {
                return Err(AssembleError::NibbleOverflow(v));
            }
        }
        Ok(self.emit(opcode, first << 4 | second))
    }

    /// Protect instructions in `[start, end)` with the handler at `handler`
    pub fn protect(&mut self, start: Label, end: Label, handler: Label, depth: u32, lasti: bool) {
        self.regions.push(Region { start, end, handler, depth, lasti });
    }

    fn position(&self, label: Label, starts: &[u32]) -> Result<u32, AssembleError> {
        let index = self.labels[label.0 as usize].ok_or(AssembleError::UnboundLabel(label.0))?;
        Ok(starts[index])
    }

    fn resolve_args(&self, sizes: &[u32], starts: &[u32]) -> Result<Vec<u32>, AssembleError> {
        let mut args = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.iter().enumerate() {
            let arg = match item.operand {
                Operand::Imm(arg) => arg,
                Operand::Target(label) => {
                    let next = starts[index] + sizes[index];
                    let target = self.position(label, starts)?;
                    let distance = if item.opcode.is_backward_jump() {
                        next.checked_sub(target)
                    } else {
                        target.checked_sub(next)
                    };
                    distance.ok_or(AssembleError::WrongDirection { opcode: item.opcode, index })?
                }
            };
            args.push(arg);
        }
        Ok(args)
    }

    /// Resolve labels and produce wordcode plus the exception table
    pub fn finish(&self) -> Result<Assembled, AssembleError> {
        let mut sizes = vec![1u32; self.items.len()];
        let (starts, args) = loop {
            let mut starts = Vec::with_capacity(self.items.len() + 1);
            let mut unit = 0u32;
            for size in &sizes {
                starts.push(unit);
                unit += size;
            }
            starts.push(unit);

            let args = self.resolve_args(&sizes, &starts)?;
            let mut changed = false;
            for (size, arg) in sizes.iter_mut().zip(&args) {
                let needed = 1 + prefix_count(*arg);
                // Sizes only grow, so the layout converges.
                if needed > *size {
                    *size = needed;
                    changed = true;
                }
            }
            if !changed {
                break (starts, args);
            }
        };

        let mut code = Vec::with_capacity(starts[self.items.len()] as usize * 2);
        for ((item, size), arg) in self.items.iter().zip(&sizes).zip(&args) {
            for shift in (1..*size).rev() {
                code.push(Opcode::ExtendedArg.to_u8());
                code.push((arg >> (8 * shift)) as u8);
            }
            code.push(item.opcode.to_u8());
            code.push(*arg as u8);
        }

        let mut entries = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            entries.push(ExceptionTableEntry {
                start: self.position(region.start, &starts)?,
                end: self.position(region.end, &starts)?,
                target: self.position(region.handler, &starts)?,
                depth: region.depth,
                lasti: region.lasti,
            });
        }

        Ok(Assembled {
            code,
            exception_table: exception_table::encode(&entries),
            entries,
        })
    }

    /// Assemble into `code`, replacing its wordcode and exception table
    pub fn finish_into(&self, mut code: CodeObject) -> Result<CodeObject, AssembleError> {
        let assembled = self.finish()?;
        code.code = assembled.code;
        code.exception_table = assembled.exception_table;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0).op(Opcode::ReturnValue);
        let out = asm.finish().unwrap();
        assert_eq!(out.code, vec![0x10, 0, 0x46, 0]);
        assert!(out.exception_table.is_empty());
    }

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut asm = Assembler::new();
        let top = asm.here();
        let done = asm.new_label();
        asm.emit(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, done).unwrap();
        asm.jump(Opcode::JumpBackward, top).unwrap();
        asm.bind(done).unwrap();
        asm.emit(Opcode::ReturnConst, 0);
        let out = asm.finish().unwrap();
        // PopJumpIfFalse at unit 1 skips one unit; JumpBackward at unit 2 goes back 3.
        assert_eq!(out.code, vec![0x11, 0, 0x42, 1, 0x41, 3, 0x47, 0]);
    }

    #[test]
    fn test_extended_arg_prefix() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0x1234).op(Opcode::ReturnValue);
        let out = asm.finish().unwrap();
        assert_eq!(out.code, vec![0x05, 0x12, 0x10, 0x34, 0x46, 0]);
    }

    #[test]
    fn test_long_jump_grows_layout() {
        let mut asm = Assembler::new();
        let end = asm.new_label();
        asm.jump(Opcode::JumpForward, end).unwrap();
        for _ in 0..300 {
            asm.op(Opcode::Nop);
        }
        asm.bind(end).unwrap();
        asm.emit(Opcode::ReturnConst, 0);
        let out = asm.finish().unwrap();
        assert_eq!(&out.code[..4], &[0x05, 0x01, 0x40, 0x2C]);
    }

    #[test]
    fn test_unbound_label() {
        let mut asm = Assembler::new();
        let nowhere = asm.new_label();
        asm.jump(Opcode::JumpForward, nowhere).unwrap();
        assert_eq!(asm.finish(), Err(AssembleError::UnboundLabel(0)));
    }

    #[test]
    fn test_wrong_direction() {
        let mut asm = Assembler::new();
        let top = asm.here();
        asm.op(Opcode::Nop);
        asm.jump(Opcode::JumpForward, top).unwrap();
        assert!(matches!(asm.finish(), Err(AssembleError::WrongDirection { .. })));
    }

    #[test]
    fn test_not_a_jump() {
        let mut asm = Assembler::new();
        let l = asm.new_label();
        assert!(matches!(asm.jump(Opcode::LoadFast, l), Err(AssembleError::NotAJump(_))));
    }

    #[test]
    fn test_fused_operands() {
        let mut asm = Assembler::new();
        asm.fused(Opcode::LoadFastLoadFast, 1, 2).unwrap();
        assert_eq!(asm.finish().unwrap().code, vec![0x14, 0x12]);
        assert_eq!(
            asm.fused(Opcode::LoadFastLoadFast, 16, 0).err(),
            Some(AssembleError::NibbleOverflow(16))
        );
    }

    #[test]
    fn test_protected_region() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadGlobal, 0);
        let end = asm.here();
        asm.op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::PopTop);
        asm.emit(Opcode::ReturnConst, 0);
        asm.protect(start, end, handler, 0, false);
        let out = asm.finish().unwrap();
        assert_eq!(
            out.entries,
            vec![ExceptionTableEntry { start: 0, end: 1, target: 2, depth: 0, lasti: false }]
        );
    }
}
