//! Instruction decoder for 16-bit x86 code segments.
//!
//! Code segments are decoded exactly once, when they are registered with
//! the segment store. The raw decoding is done by `iced-x86` in 16-bit mode;
//! each result is then folded into the small [`Instruction`] model the
//! dispatch loop works with. Only the fields the interpreter consults are
//! kept, so an instruction is a plain `Copy` value.

use crate::cpu::registers::Register;
use iced_x86::{ConstantOffsets, Decoder, DecoderOptions, MemorySize, OpKind};
use thiserror::Error;

/// Mnemonics the dispatch loop knows about.
///
/// Everything else still decodes (so a segment never fails to load just
/// because it contains an opcode the interpreter lacks), but is carried as
/// [`Mnemonic::Other`] and rejected when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    // Arithmetic / logic
    Add,
    Cmp,
    Inc,
    Imul,
    Xor,
    Or,
    Shl,

    // Data transfer
    Mov,
    Lea,
    Push,
    Pop,
    Stosw,

    // Stack frames
    Enter,
    Leave,

    // Control flow
    Call,
    Jmp,
    Je,
    Jne,
    Jl,
    Jb,
    Jge,
    Jle,
    Jbe,

    Nop,

    /// Decoded fine, but the interpreter has no handler for it.
    Other(iced_x86::Mnemonic),
}

impl Mnemonic {
    fn from_iced(mnemonic: iced_x86::Mnemonic) -> Self {
        use iced_x86::Mnemonic as M;

        match mnemonic {
            M::Add => Mnemonic::Add,
            M::Cmp => Mnemonic::Cmp,
            M::Inc => Mnemonic::Inc,
            M::Imul => Mnemonic::Imul,
            M::Xor => Mnemonic::Xor,
            M::Or => Mnemonic::Or,
            M::Shl => Mnemonic::Shl,
            M::Mov => Mnemonic::Mov,
            M::Lea => Mnemonic::Lea,
            M::Push => Mnemonic::Push,
            M::Pop => Mnemonic::Pop,
            M::Stosw => Mnemonic::Stosw,
            M::Enter => Mnemonic::Enter,
            M::Leave => Mnemonic::Leave,
            M::Call => Mnemonic::Call,
            M::Jmp => Mnemonic::Jmp,
            M::Je => Mnemonic::Je,
            M::Jne => Mnemonic::Jne,
            M::Jl => Mnemonic::Jl,
            M::Jb => Mnemonic::Jb,
            M::Jge => Mnemonic::Jge,
            M::Jle => Mnemonic::Jle,
            M::Jbe => Mnemonic::Jbe,
            M::Nop => Mnemonic::Nop,
            other => Mnemonic::Other(other),
        }
    }
}

impl std::fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mnemonic::Add => "add",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Inc => "inc",
            Mnemonic::Imul => "imul",
            Mnemonic::Xor => "xor",
            Mnemonic::Or => "or",
            Mnemonic::Shl => "shl",
            Mnemonic::Mov => "mov",
            Mnemonic::Lea => "lea",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Stosw => "stosw",
            Mnemonic::Enter => "enter",
            Mnemonic::Leave => "leave",
            Mnemonic::Call => "call",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Je => "je",
            Mnemonic::Jne => "jne",
            Mnemonic::Jl => "jl",
            Mnemonic::Jb => "jb",
            Mnemonic::Jge => "jge",
            Mnemonic::Jle => "jle",
            Mnemonic::Jbe => "jbe",
            Mnemonic::Nop => "nop",
            Mnemonic::Other(m) => return write!(f, "{}", format!("{:?}", m).to_lowercase()),
        };
        f.write_str(name)
    }
}

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWidth {
    Byte,
    Word,
    /// Far pointers, dwords, ... never read or written by the core.
    Other,
}

/// Addressing fields of an instruction's memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    /// Effective segment register (override prefix or default).
    pub segment: Register,
    pub base: Option<Register>,
    pub index: Option<Register>,
    /// Raw 16-bit displacement; negative displacements arrive as their
    /// two's complement (`[bp-2]` carries `0xFFFE`).
    pub displacement: u16,
    pub width: MemoryWidth,
}

/// A single decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Immediate8(u8),
    Immediate16(u16),
    /// 8-bit immediate that the CPU sign-extends to 16 bits.
    Immediate8to16(i16),
    /// See [`Instruction::memory`] for the addressing fields.
    Memory,
    NearBranch(u16),
    FarBranch { selector: u16, offset: u16 },
    /// Implicit string operands and anything outside 16-bit real mode.
    Other,
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the first byte within its code segment.
    pub offset: u16,
    /// Encoded length in bytes.
    pub len: u8,
    pub mnemonic: Mnemonic,
    operands: [Operand; 3],
    op_count: u8,
    pub memory: Option<MemoryOperand>,
    /// Position of the 16-bit immediate inside the encoding, if any.
    pub immediate_offset: Option<u8>,
}

impl Instruction {
    fn from_iced(raw: &iced_x86::Instruction, offsets: &ConstantOffsets) -> Self {
        let memory = memory_operand(raw);
        let op_count = raw.op_count().min(3);

        let mut operands = [Operand::Other; 3];
        for (i, slot) in operands.iter_mut().enumerate().take(op_count as usize) {
            *slot = operand(raw, i as u32, memory.is_some());
        }

        Self {
            offset: raw.ip16(),
            len: raw.len() as u8,
            mnemonic: Mnemonic::from_iced(raw.mnemonic()),
            operands,
            op_count: op_count as u8,
            memory,
            immediate_offset: offsets
                .has_immediate()
                .then(|| offsets.immediate_offset() as u8),
        }
    }

    /// The instruction's explicit operands.
    pub fn operands(&self) -> &[Operand] {
        &self.operands[..self.op_count as usize]
    }

    /// Operand `n`, or [`Operand::Other`] when the instruction has fewer.
    pub fn op(&self, n: usize) -> Operand {
        self.operands().get(n).copied().unwrap_or(Operand::Other)
    }

    /// Offset of the instruction that follows this one.
    pub fn next_ip(&self) -> u16 {
        self.offset.wrapping_add(self.len as u16)
    }
}

fn operand(raw: &iced_x86::Instruction, n: u32, has_memory: bool) -> Operand {
    match raw.op_kind(n) {
        OpKind::Register => Register::from_iced(raw.op_register(n))
            .map(Operand::Register)
            .unwrap_or(Operand::Other),
        OpKind::Immediate8 => Operand::Immediate8(raw.immediate8()),
        OpKind::Immediate8_2nd => Operand::Immediate8(raw.immediate8_2nd()),
        OpKind::Immediate16 => Operand::Immediate16(raw.immediate16()),
        OpKind::Immediate8to16 => Operand::Immediate8to16(raw.immediate8to16()),
        OpKind::NearBranch16 => Operand::NearBranch(raw.near_branch16()),
        OpKind::FarBranch16 => Operand::FarBranch {
            selector: raw.far_branch_selector(),
            offset: raw.far_branch16(),
        },
        OpKind::Memory if has_memory => Operand::Memory,
        _ => Operand::Other,
    }
}

fn memory_operand(raw: &iced_x86::Instruction) -> Option<MemoryOperand> {
    let has_memory = (0..raw.op_count()).any(|n| raw.op_kind(n) == OpKind::Memory);
    if !has_memory {
        return None;
    }

    let segment = Register::from_iced(raw.memory_segment())?;
    let base = optional_register(raw.memory_base())?;
    let index = optional_register(raw.memory_index())?;

    let width = match raw.memory_size() {
        MemorySize::UInt8 | MemorySize::Int8 => MemoryWidth::Byte,
        MemorySize::UInt16 | MemorySize::Int16 | MemorySize::WordOffset => MemoryWidth::Word,
        _ => MemoryWidth::Other,
    };

    Some(MemoryOperand {
        segment,
        base,
        index,
        displacement: raw.memory_displacement32() as u16,
        width,
    })
}

/// `Some(None)` for "no register", `None` for a register we cannot model.
fn optional_register(reg: iced_x86::Register) -> Option<Option<Register>> {
    if reg == iced_x86::Register::None {
        Some(None)
    } else {
        Register::from_iced(reg).map(Some)
    }
}

/// Decode a code image from offset 0 until every byte is consumed.
///
/// Instructions come back ordered by offset.
pub fn decode_segment(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut decoder = Decoder::with_ip(16, code, 0, DecoderOptions::NONE);
    let mut raw = iced_x86::Instruction::default();
    let mut instructions = Vec::new();

    while decoder.can_decode() {
        let offset = decoder.ip() as u16;
        decoder.decode_out(&mut raw);

        if raw.is_invalid() {
            return Err(DecodeError::InvalidInstruction {
                offset,
                reason: format!("{:?}", decoder.last_error()),
            });
        }

        let offsets = decoder.get_constant_offsets(&raw);
        instructions.push(Instruction::from_iced(&raw, &offsets));
    }

    Ok(instructions)
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match op {
                Operand::Register(reg) => write!(f, "{}", reg)?,
                Operand::Immediate8(value) => write!(f, "{:#x}", value)?,
                Operand::Immediate16(value) => write!(f, "{:#x}", value)?,
                Operand::Immediate8to16(value) => write!(f, "{:#x}", *value as u16)?,
                Operand::NearBranch(target) => write!(f, "{:#06x}", target)?,
                Operand::FarBranch { selector, offset } => {
                    write!(f, "{:#06x}:{:#06x}", selector, offset)?
                }
                Operand::Memory => match &self.memory {
                    Some(mem) => format_memory(f, mem)?,
                    None => f.write_str("[?]")?,
                },
                Operand::Other => f.write_str("?")?,
            }
        }
        Ok(())
    }
}

fn format_memory(f: &mut std::fmt::Formatter<'_>, mem: &MemoryOperand) -> std::fmt::Result {
    match mem.width {
        MemoryWidth::Byte => f.write_str("byte ptr ")?,
        MemoryWidth::Word => f.write_str("word ptr ")?,
        MemoryWidth::Other => {}
    }
    write!(f, "{}:[", mem.segment)?;

    let mut wrote_register = false;
    for reg in [mem.base, mem.index].into_iter().flatten() {
        if wrote_register {
            f.write_str("+")?;
        }
        write!(f, "{}", reg)?;
        wrote_register = true;
    }

    if !wrote_register {
        write!(f, "{:#06x}", mem.displacement)?;
    } else if mem.displacement >= 0x8000 {
        write!(f, "-{:#x}", mem.displacement.wrapping_neg())?;
    } else if mem.displacement != 0 {
        write!(f, "+{:#x}", mem.displacement)?;
    }
    f.write_str("]")
}

/// Errors that can occur during instruction decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid instruction at offset {offset:#06x}: {reason}")]
    InvalidInstruction { offset: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_single(bytes: &[u8]) -> Instruction {
        let decoded = decode_segment(bytes).unwrap();
        assert_eq!(decoded.len(), 1, "expected exactly one instruction");
        decoded[0]
    }

    #[test]
    fn test_decode_mov_immediate() {
        // mov ax, 0x5
        let instr = decode_single(&[0xB8, 0x05, 0x00]);
        assert_eq!(instr.mnemonic, Mnemonic::Mov);
        assert_eq!(instr.len, 3);
        assert_eq!(instr.op(0), Operand::Register(Register::Ax));
        assert_eq!(instr.op(1), Operand::Immediate16(5));
        assert_eq!(instr.immediate_offset, Some(1));
        assert_eq!(instr.to_string(), "mov ax, 0x5");
    }

    #[test]
    fn test_decode_sign_extended_immediate() {
        // add ax, -1
        let instr = decode_single(&[0x83, 0xC0, 0xFF]);
        assert_eq!(instr.mnemonic, Mnemonic::Add);
        assert_eq!(instr.op(1), Operand::Immediate8to16(-1));
    }

    #[test]
    fn test_decode_bp_relative_memory() {
        // mov ax, [bp-2]
        let instr = decode_single(&[0x8B, 0x46, 0xFE]);
        assert_eq!(instr.op(1), Operand::Memory);

        let mem = instr.memory.unwrap();
        assert_eq!(mem.base, Some(Register::Bp));
        assert_eq!(mem.index, None);
        assert_eq!(mem.segment, Register::Ss);
        assert_eq!(mem.displacement, 0xFFFE);
        assert_eq!(mem.width, MemoryWidth::Word);
        assert_eq!(instr.to_string(), "mov ax, word ptr ss:[bp-0x2]");
    }

    #[test]
    fn test_decode_segment_override() {
        // mov al, es:[bx]
        let instr = decode_single(&[0x26, 0x8A, 0x07]);
        let mem = instr.memory.unwrap();
        assert_eq!(mem.segment, Register::Es);
        assert_eq!(mem.base, Some(Register::Bx));
        assert_eq!(mem.width, MemoryWidth::Byte);
    }

    #[test]
    fn test_decode_enter() {
        // enter 0x4, 0x0
        let instr = decode_single(&[0xC8, 0x04, 0x00, 0x00]);
        assert_eq!(instr.mnemonic, Mnemonic::Enter);
        assert_eq!(instr.op(0), Operand::Immediate16(4));
        assert_eq!(instr.op(1), Operand::Immediate8(0));
    }

    #[test]
    fn test_decode_far_call() {
        // call 0x0000:0xFFFF
        let instr = decode_single(&[0x9A, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(instr.mnemonic, Mnemonic::Call);
        assert_eq!(
            instr.op(0),
            Operand::FarBranch {
                selector: 0,
                offset: 0xFFFF
            }
        );
        assert_eq!(instr.len, 5);
    }

    #[test]
    fn test_decode_near_branch_is_absolute() {
        // nop; jmp short -3 (back to offset 0)
        let decoded = decode_segment(&[0x90, 0xEB, 0xFD]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].offset, 1);
        assert_eq!(decoded[1].op(0), Operand::NearBranch(0));
    }

    #[test]
    fn test_decode_unsupported_mnemonic_still_decodes() {
        // hlt
        let instr = decode_single(&[0xF4]);
        assert_eq!(instr.mnemonic, Mnemonic::Other(iced_x86::Mnemonic::Hlt));
        assert_eq!(instr.mnemonic.to_string(), "hlt");
    }

    #[test]
    fn test_decode_offsets_are_ordered() {
        // mov ax, 5; add ax, 3; nop
        let decoded = decode_segment(&[0xB8, 0x05, 0x00, 0x83, 0xC0, 0x03, 0x90]).unwrap();
        let offsets: Vec<u16> = decoded.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(decoded[1].next_ip(), 6);
    }

    #[test]
    fn test_decode_truncated_instruction_fails() {
        // nop; mov ax, <missing high byte>
        let err = decode_segment(&[0x90, 0xB8, 0x05]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidInstruction { offset: 1, .. }));
    }
}
