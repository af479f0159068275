//! Wordcode instruction decoder
//!
//! Decodes a code object's wordcode into a flat list of [`Instruction`]s:
//! `ExtendedArg` prefixes are folded into the operand of the instruction they
//! precede, jump distances are resolved to absolute byte offsets, and fused
//! super-instructions are split into two single-effect records.

use kiln_bytecode::{CmpOp, CodeObject, ExceptionTableError, NbOp, Opcode};
use rustc_hash::FxHashMap;

use super::effect::{self, StackEffect};

/// Most prefixes a 32-bit operand can need
const MAX_PREFIXES: u32 = 3;

/// Error during bytecode decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid opcode byte {byte:#x} at offset {offset}")]
    InvalidOpcode { byte: u8, offset: u32 },
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(u32),
    #[error("More than {MAX_PREFIXES} EXTENDED_ARG prefixes at offset {0}")]
    TooManyPrefixes(u32),
    #[error("Jump at offset {offset} targets {target}, outside the code")]
    JumpOutOfRange { offset: u32, target: i64 },
    #[error("Jump at offset {offset} targets {target}, inside another instruction")]
    JumpIntoInstruction { offset: u32, target: u32 },
    #[error("{opcode} at offset {offset}: operand {operand} out of range (table size {len})")]
    OperandOutOfRange { opcode: Opcode, offset: u32, operand: u32, len: usize },
    #[error("{opcode} at offset {offset}: invalid operand {operand}")]
    InvalidOperand { opcode: Opcode, offset: u32, operand: u32 },
    #[error("Exception table: {0}")]
    ExceptionTable(#[from] ExceptionTableError),
    #[error("Exception region {index} ({start}..{end} -> {target}) is outside the code")]
    BadRegion { index: usize, start: u32, end: u32, target: u32 },
}

/// A decoded instruction
///
/// Offsets are byte offsets. The offset of an instruction with prefixes is
/// the offset of its first prefix, which is where jumps land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode (never `ExtendedArg` or a fused opcode)
    pub opcode: Opcode,
    /// Operand after prefix folding
    pub arg: u32,
    /// Byte offset; odd for the second half of a split super-instruction
    pub offset: u32,
    /// Byte offset of the next record
    pub next_offset: u32,
    /// Absolute jump target for jump opcodes
    pub target: Option<u32>,
    /// Half of a split super-instruction
    pub fused: bool,
}

impl Instruction {
    /// Stack effect along fall-through (or the only) path
    pub fn effect(&self) -> StackEffect {
        effect::stack_effect(self.opcode, self.arg)
    }

    /// Code units occupied, prefixes included
    ///
    /// The unit of a split super-instruction is counted on its first half.
    pub fn size(&self) -> u32 {
        if self.fused && self.offset % 2 == 1 {
            0
        } else {
            (self.next_offset - self.offset).div_ceil(2)
        }
    }

    /// Absolute jump target; `None` for non-jumps
    pub fn jump_target(&self) -> Option<u32> {
        self.target
    }

    /// Operand as a binary operator selector
    pub fn nb_op(&self) -> Option<NbOp> {
        NbOp::from_arg(self.arg)
    }

    /// Operand as a comparison selector
    pub fn cmp_op(&self) -> Option<CmpOp> {
        CmpOp::from_arg(self.arg)
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>4} {}", self.offset, self.opcode)?;
        if let Some(target) = self.target {
            write!(f, " -> {}", target)
        } else if self.opcode.has_arg() {
            write!(f, " {}", self.arg)
        } else {
            Ok(())
        }
    }
}

/// A protected byte range, converted from the code-unit exception table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// First protected byte offset
    pub start: u32,
    /// One past the last protected byte offset
    pub end: u32,
    /// Handler byte offset
    pub target: u32,
    /// Stack depth preserved beneath the handler's pushed values
    pub depth: u32,
    /// Whether the failing offset is pushed before the exception
    pub lasti: bool,
}

impl ExceptionRegion {
    /// Whether byte offset `offset` is protected
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Stack depth on entry to the handler
    pub fn handler_depth(&self) -> u32 {
        self.depth + self.lasti as u32 + 1
    }
}

/// Decoded instructions plus exception regions of one function
#[derive(Debug, Clone)]
pub struct DecodedFunction {
    pub instructions: Vec<Instruction>,
    pub regions: Vec<ExceptionRegion>,
    /// Code length in bytes
    pub code_len: u32,
    offset_index: FxHashMap<u32, usize>,
}

impl DecodedFunction {
    /// Index of the instruction starting at `offset`
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.offset_index.get(&offset).copied()
    }
}

fn check_operand(
    opcode: Opcode,
    offset: u32,
    operand: u32,
    len: usize,
) -> Result<(), DecodeError> {
    if (operand as usize) < len {
        Ok(())
    } else {
        Err(DecodeError::OperandOutOfRange { opcode, offset, operand, len })
    }
}

fn validate_operand(code: &CodeObject, instr: &Instruction) -> Result<(), DecodeError> {
    let (opcode, offset, arg) = (instr.opcode, instr.offset, instr.arg);
    let invalid = || DecodeError::InvalidOperand { opcode, offset, operand: arg };
    match opcode {
        Opcode::LoadConst | Opcode::ReturnConst => {
            check_operand(opcode, offset, arg, code.constants.len())
        }
        Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
            check_operand(opcode, offset, arg, code.varnames.len())
        }
        Opcode::LoadDeref | Opcode::StoreDeref | Opcode::MakeCell => {
            check_operand(opcode, offset, arg, code.slot_count())
        }
        Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::LoadAttr
        | Opcode::StoreAttr
        | Opcode::ImportName
        | Opcode::ImportFrom => check_operand(opcode, offset, arg, code.names.len()),
        Opcode::BinaryOp => NbOp::from_arg(arg).map(|_| ()).ok_or_else(invalid),
        Opcode::CompareOp => CmpOp::from_arg(arg).map(|_| ()).ok_or_else(invalid),
        Opcode::Copy if arg == 0 => Err(invalid()),
        Opcode::Swap if arg < 2 => Err(invalid()),
        Opcode::RaiseVarargs if arg > 2 => Err(invalid()),
        Opcode::IsOp | Opcode::ContainsOp if arg > 1 => Err(invalid()),
        _ => Ok(()),
    }
}

/// Split a fused local-variable instruction into its two halves
fn split_super(instr: Instruction) -> [Instruction; 2] {
    let (first_op, second_op) = match instr.opcode {
        Opcode::LoadFastLoadFast => (Opcode::LoadFast, Opcode::LoadFast),
        Opcode::StoreFastLoadFast => (Opcode::StoreFast, Opcode::LoadFast),
        _ => (Opcode::StoreFast, Opcode::StoreFast),
    };
    [
        Instruction {
            opcode: first_op,
            arg: instr.arg >> 4,
            offset: instr.offset,
            next_offset: instr.offset + 1,
            target: None,
            fused: true,
        },
        Instruction {
            opcode: second_op,
            arg: instr.arg & 0xF,
            offset: instr.offset + 1,
            next_offset: instr.next_offset,
            target: None,
            fused: true,
        },
    ]
}

/// Decode all instructions and exception regions of a code object
pub fn decode_function(code: &CodeObject) -> Result<DecodedFunction, DecodeError> {
    let bytes = &code.code;
    let code_len = bytes.len() as u32;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::UnexpectedEnd(code_len - 1));
    }

    let mut instructions = Vec::with_capacity(bytes.len() / 2);
    let mut pos = 0usize;
    let mut ext: u32 = 0;
    let mut prefixes = 0u32;
    let mut start: Option<u32> = None;

    while pos < bytes.len() {
        let offset = pos as u32;
        let byte = bytes[pos];
        let raw_arg = bytes[pos + 1] as u32;
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode { byte, offset })?;
        let first = *start.get_or_insert(offset);
        let arg = ext << 8 | raw_arg;
        pos += 2;

        if opcode == Opcode::ExtendedArg {
            prefixes += 1;
            if prefixes > MAX_PREFIXES {
                return Err(DecodeError::TooManyPrefixes(first));
            }
            ext = arg;
            continue;
        }
        ext = 0;
        prefixes = 0;
        start = None;

        let next_offset = pos as u32;
        let target = if opcode.is_jump() {
            let distance = arg as i64 * 2;
            let target = if opcode.is_backward_jump() {
                next_offset as i64 - distance
            } else {
                next_offset as i64 + distance
            };
            if target < 0 || target >= code_len as i64 {
                return Err(DecodeError::JumpOutOfRange { offset: first, target });
            }
            Some(target as u32)
        } else {
            None
        };

        let instr = Instruction { opcode, arg, offset: first, next_offset, target, fused: false };
        if opcode.is_super_instruction() {
            for half in split_super(instr) {
                validate_operand(code, &half)?;
                instructions.push(half);
            }
        } else {
            validate_operand(code, &instr)?;
            instructions.push(instr);
        }
    }
    if let Some(first) = start {
        return Err(DecodeError::UnexpectedEnd(first));
    }

    let mut offset_index = FxHashMap::default();
    for (i, instr) in instructions.iter().enumerate() {
        offset_index.insert(instr.offset, i);
    }

    for instr in &instructions {
        if let Some(target) = instr.target {
            // Odd offsets belong to the second half of a split super-instruction.
            if target % 2 != 0 || !offset_index.contains_key(&target) {
                return Err(DecodeError::JumpIntoInstruction { offset: instr.offset, target });
            }
        }
    }

    let mut regions = Vec::new();
    for (index, entry) in code.exception_entries()?.into_iter().enumerate() {
        let region = ExceptionRegion {
            start: entry.start * 2,
            end: entry.end * 2,
            target: entry.target * 2,
            depth: entry.depth,
            lasti: entry.lasti,
        };
        let valid = region.start < region.end
            && region.end <= code_len
            && offset_index.contains_key(&region.target);
        if !valid {
            return Err(DecodeError::BadRegion {
                index,
                start: region.start,
                end: region.end,
                target: region.target,
            });
        }
        regions.push(region);
    }

    Ok(DecodedFunction { instructions, regions, code_len, offset_index })
}
