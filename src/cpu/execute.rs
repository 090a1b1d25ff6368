//! Dispatch loop for the 16-bit interpreter.
//!
//! Implements the fetch-execute cycle and every supported opcode. The host
//! drives execution one [`Cpu::step`] at a time; a step runs to completion
//! or fails, there is no suspension point inside it.

use crate::cpu::decode::{Instruction, MemoryOperand, MemoryWidth, Mnemonic, Operand};
use crate::cpu::memory::{
    ImportOrdinal, Memory, MemoryError, RelocationTarget, EXTRA_SEGMENT, HOST_MEMORY_SEGMENT,
    RELOCATION_SENTINEL, STACK_SEGMENT,
};
use crate::cpu::registers::{Flag, Register, Registers};
use thiserror::Error;
use tracing::{debug, trace, Span};

/// Initial SP of a fresh context.
pub const STACK_BASE: u16 = 0xFFFF;

/// Segment values above this belong to the host rather than the module.
pub const HOST_SEGMENT_THRESHOLD: u16 = 0xFF;

/// Failure reported by a host capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Host capability: run an imported function.
///
/// The implementation sees the caller's registers and memory, so it can
/// read stacked arguments and leave its result in AX. The returned word is
/// substituted when the import was referenced by a `MOV` immediate and
/// ignored for calls.
pub trait ExternalFunctions {
    fn invoke(
        &mut self,
        regs: &mut Registers,
        mem: &mut Memory,
        import: ImportOrdinal,
    ) -> Result<u16, HostError>;
}

impl<F> ExternalFunctions for F
where
    F: FnMut(&mut Registers, &mut Memory, ImportOrdinal) -> Result<u16, HostError>,
{
    fn invoke(
        &mut self,
        regs: &mut Registers,
        mem: &mut Memory,
        import: ImportOrdinal,
    ) -> Result<u16, HostError> {
        self(regs, mem, import)
    }
}

/// Host capability: read a word of host-owned memory.
pub trait ExternalMemory {
    fn read_word(&mut self, segment: u16, offset: u16) -> Result<u16, HostError>;
}

impl<F> ExternalMemory for F
where
    F: FnMut(u16, u16) -> Result<u16, HostError>,
{
    fn read_word(&mut self, segment: u16, offset: u16) -> Result<u16, HostError> {
        self(segment, offset)
    }
}

/// A host that provides nothing; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlinked;

impl ExternalFunctions for Unlinked {
    fn invoke(
        &mut self,
        _regs: &mut Registers,
        _mem: &mut Memory,
        import: ImportOrdinal,
    ) -> Result<u16, HostError> {
        Err(HostError(format!(
            "no host linked for import {}:{}",
            import.module, import.function
        )))
    }
}

impl ExternalMemory for Unlinked {
    fn read_word(&mut self, segment: u16, offset: u16) -> Result<u16, HostError> {
        Err(HostError(format!(
            "no host memory linked for {:04X}:{:04X}",
            segment, offset
        )))
    }
}

/// Whether a handler left IP for the dispatch loop to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Jump,
}

/// One execution context: registers, memory and the host capabilities.
pub struct Cpu<F = Unlinked, M = Unlinked> {
    /// CPU registers.
    pub regs: Registers,
    /// Segment store.
    pub mem: Memory,
    /// Imported function dispatch.
    pub functions: F,
    /// Host-owned memory reads.
    pub external_memory: M,
    /// Instructions executed so far.
    pub steps: u64,
    span: Span,
}

impl<F: ExternalFunctions, M: ExternalMemory> Cpu<F, M> {
    /// Create a context with the stack, extra and host segments in place.
    ///
    /// SS:SP points at the top of [`STACK_SEGMENT`], ES at
    /// [`EXTRA_SEGMENT`]; everything else is zero.
    pub fn new(functions: F, external_memory: M) -> Result<Self, CpuError> {
        let mut mem = Memory::new();
        mem.reserve_segment(STACK_SEGMENT)?;
        mem.reserve_segment(EXTRA_SEGMENT)?;
        mem.reserve_segment(HOST_MEMORY_SEGMENT)?;

        let mut regs = Registers::new();
        regs.sp = STACK_BASE;
        regs.ss = STACK_SEGMENT;
        regs.es = EXTRA_SEGMENT;

        Ok(Self {
            regs,
            mem,
            functions,
            external_memory,
            steps: 0,
            span: Span::none(),
        })
    }

    /// Attribute everything this context logs to `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Execute the instruction at CS:IP.
    ///
    /// Returns the instruction that was executed.
    pub fn step(&mut self) -> Result<Instruction, CpuError> {
        let _entered = self.span.clone().entered();

        let instr = *self.mem.fetch(self.regs.cs, self.regs.ip)?;
        trace!("{:04X}:{:04X}  {}", self.regs.cs, self.regs.ip, instr);

        if self.execute(&instr)? == Flow::Next {
            self.regs.ip = self.regs.ip.wrapping_add(instr.len as u16);
        }

        self.steps += 1;
        Ok(instr)
    }

    /// Run for at most `max_steps` instructions.
    ///
    /// Returns the number of instructions executed.
    pub fn run_limited(&mut self, max_steps: u64) -> Result<u64, CpuError> {
        let start = self.steps;
        while self.steps - start < max_steps {
            self.step()?;
        }
        Ok(self.steps - start)
    }

    /// Push a word onto SS:SP.
    pub fn push(&mut self, value: u16) -> Result<(), MemoryError> {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        self.mem.write_word(self.regs.ss, self.regs.sp, value)
    }

    /// Pop a word from SS:SP.
    pub fn pop(&mut self) -> Result<u16, MemoryError> {
        let value = self.mem.read_word(self.regs.ss, self.regs.sp)?;
        self.regs.sp = self.regs.sp.wrapping_add(2);
        Ok(value)
    }

    fn execute(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        match instr.mnemonic {
            // ==================== Arithmetic ====================
            Mnemonic::Add => self.op_add(instr),
            Mnemonic::Cmp => self.op_cmp(instr),
            Mnemonic::Inc => self.op_inc(instr),
            Mnemonic::Imul => self.op_imul(instr),
            Mnemonic::Xor => self.op_logic(instr, |a, b| a ^ b),
            Mnemonic::Or => self.op_logic(instr, |a, b| a | b),
            Mnemonic::Shl => self.op_shl(instr),

            // ==================== Data Transfer ====================
            Mnemonic::Mov => self.op_mov(instr),
            Mnemonic::Lea => self.op_lea(instr),
            Mnemonic::Push => self.op_push(instr),
            Mnemonic::Pop => self.op_pop(instr),
            Mnemonic::Stosw => self.op_stosw(),

            // ==================== Stack Frames ====================
            Mnemonic::Enter => self.op_enter(instr),
            Mnemonic::Leave => self.op_leave(),

            // ==================== Control Flow ====================
            Mnemonic::Call => self.op_call(instr),
            Mnemonic::Jmp => self.op_branch(instr, true),
            Mnemonic::Je => {
                let taken = self.regs.zf();
                self.op_branch(instr, taken)
            }
            Mnemonic::Jne => {
                let taken = !self.regs.zf();
                self.op_branch(instr, taken)
            }
            Mnemonic::Jl | Mnemonic::Jb => {
                let taken = !self.regs.zf() && self.regs.cf();
                self.op_branch(instr, taken)
            }
            Mnemonic::Jge => {
                let taken = !self.regs.cf();
                self.op_branch(instr, taken)
            }
            Mnemonic::Jle => {
                let taken = self.regs.zf() != self.regs.cf();
                self.op_branch(instr, taken)
            }
            Mnemonic::Jbe => {
                // ZF only; CF is not tested.
                let taken = self.regs.zf();
                self.op_branch(instr, taken)
            }

            Mnemonic::Nop => Ok(Flow::Next),

            Mnemonic::Other(_) => Err(self.unsupported(instr, "no handler for mnemonic")),
        }
    }

    fn unsupported(&self, instr: &Instruction, detail: &'static str) -> CpuError {
        CpuError::UnsupportedInstruction {
            segment: self.regs.cs,
            offset: instr.offset,
            instruction: instr.to_string(),
            detail,
        }
    }

    // ==================== Operand Resolution ====================

    fn read_operand(&mut self, instr: &Instruction, op: Operand) -> Result<u16, CpuError> {
        match op {
            Operand::Register(reg) => Ok(self.regs.get(reg)),
            Operand::Immediate8(value) => Ok(value as u16),
            Operand::Immediate16(value) => Ok(value),
            Operand::Immediate8to16(value) => Ok(value as u16),
            Operand::Memory => self.read_memory(instr),
            _ => Err(self.unsupported(instr, "operand kind cannot be read")),
        }
    }

    fn memory_operand(&self, instr: &Instruction) -> Result<MemoryOperand, CpuError> {
        instr
            .memory
            .ok_or_else(|| self.unsupported(instr, "memory operand outside 16-bit addressing"))
    }

    /// Offset part of a memory operand's effective address.
    fn effective_offset(&self, mem: &MemoryOperand) -> u16 {
        let mut offset = match mem.base {
            // Negative displacements come in as two's complement.
            Some(Register::Bp) => self
                .regs
                .bp
                .wrapping_sub(0xFFFFu16.wrapping_sub(mem.displacement).wrapping_add(1)),
            Some(base) => self.regs.get(base).wrapping_add(mem.displacement),
            None => mem.displacement,
        };
        if let Some(index) = mem.index {
            offset = offset.wrapping_add(self.regs.get(index));
        }
        offset
    }

    fn read_memory(&mut self, instr: &Instruction) -> Result<u16, CpuError> {
        let mem = self.memory_operand(instr)?;
        let segment = self.regs.get(mem.segment);
        let offset = self.effective_offset(&mem);

        if mem.segment == Register::Es && segment > HOST_SEGMENT_THRESHOLD {
            let word = self.external_memory.read_word(segment, offset)?;
            trace!(segment, offset, word, "read host memory");
            return Ok(match mem.width {
                MemoryWidth::Byte => word & 0x00FF,
                _ => word,
            });
        }

        match mem.width {
            MemoryWidth::Byte => Ok(self.mem.read_byte(segment, offset)? as u16),
            MemoryWidth::Word => Ok(self.mem.read_word(segment, offset)?),
            MemoryWidth::Other => Err(self.unsupported(instr, "memory operand width")),
        }
    }

    fn write_memory(&mut self, instr: &Instruction, value: u16) -> Result<(), CpuError> {
        let mem = self.memory_operand(instr)?;
        let segment = self.regs.get(mem.segment);
        let offset = self.effective_offset(&mem);

        match mem.width {
            MemoryWidth::Byte => self.mem.write_byte(segment, offset, value as u8)?,
            MemoryWidth::Word => self.mem.write_word(segment, offset, value)?,
            MemoryWidth::Other => return Err(self.unsupported(instr, "memory operand width")),
        }
        Ok(())
    }

    /// Resolve a 16-bit immediate that may be a link-time placeholder.
    fn relocated_immediate(&mut self, instr: &Instruction, value: u16) -> Result<u16, CpuError> {
        if value != RELOCATION_SENTINEL {
            return Ok(value);
        }

        let position = instr.immediate_offset.unwrap_or(1) as u16;
        let site = self.regs.ip.wrapping_add(position);
        let target = self.mem.find_relocation(self.regs.cs, site).map(|r| r.target);

        match target {
            Some(RelocationTarget::Import(import)) => {
                debug!(
                    module = import.module,
                    function = import.function,
                    "resolving relocated immediate through host"
                );
                Ok(self.functions.invoke(&mut self.regs, &mut self.mem, import)?)
            }
            Some(RelocationTarget::Internal { value }) => Ok(value),
            None => Ok(RELOCATION_SENTINEL),
        }
    }

    // ==================== Arithmetic ====================

    fn op_add(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let Operand::Register(dst) = instr.op(0) else {
            return Err(self.unsupported(instr, "ADD destination must be a register"));
        };
        let source = match instr.op(1) {
            op @ (Operand::Register(_)
            | Operand::Immediate8(_)
            | Operand::Immediate16(_)
            | Operand::Immediate8to16(_)) => self.read_operand(instr, op)?,
            _ => return Err(self.unsupported(instr, "ADD source must be a register or immediate")),
        };

        let old = self.regs.get(dst);
        let new = old.wrapping_add(source) & dst.mask();
        self.regs.set(dst, new);

        self.regs.update_flag(Flag::Zero, new == 0);
        // CF tracks a flip of the destination's sign bit, not the carry out.
        self.regs
            .update_flag(Flag::Carry, (old ^ new) & dst.sign_bit() != 0);
        Ok(Flow::Next)
    }

    fn op_cmp(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let destination = self.read_operand(instr, instr.op(0))?;
        let source = self.read_operand(instr, instr.op(1))?;

        self.regs.update_flag(Flag::Zero, destination == source);
        self.regs.update_flag(Flag::Carry, destination < source);
        Ok(Flow::Next)
    }

    fn op_inc(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let Operand::Register(reg) = instr.op(0) else {
            return Err(self.unsupported(instr, "INC operand must be a register"));
        };

        let new = self.regs.get(reg).wrapping_add(1) & reg.mask();
        self.regs.set(reg, new);
        self.regs.update_flag(Flag::Zero, new == 0);
        Ok(Flow::Next)
    }

    fn op_imul(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let (Operand::Register(dst), 3) = (instr.op(0), instr.operands().len()) else {
            return Err(self.unsupported(instr, "only the three-operand IMUL form is supported"));
        };

        let multiplicand = self.read_operand(instr, instr.op(1))?;
        let multiplier = self.read_operand(instr, instr.op(2))?;
        self.regs.set(dst, multiplicand.wrapping_mul(multiplier));
        Ok(Flow::Next)
    }

    fn op_logic(&mut self, instr: &Instruction, combine: fn(u16, u16) -> u16) -> Result<Flow, CpuError> {
        let Operand::Register(dst) = instr.op(0) else {
            return Err(self.unsupported(instr, "destination must be a register"));
        };

        let value = self.regs.get(dst);
        let source = self.read_operand(instr, instr.op(1))?;
        self.regs.set(dst, combine(value, source));
        Ok(Flow::Next)
    }

    fn op_shl(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let (Operand::Register(reg), Operand::Immediate8(_)) = (instr.op(0), instr.op(1)) else {
            return Err(self.unsupported(instr, "SHL must shift a register by an immediate"));
        };

        // Module code only ever shifts by one.
        self.regs.set(reg, self.regs.get(reg) << 1);
        Ok(Flow::Next)
    }

    // ==================== Data Transfer ====================

    fn op_mov(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        match (instr.op(0), instr.op(1)) {
            // MOV r8, imm8
            (Operand::Register(dst), Operand::Immediate8(value)) => {
                self.regs.set(dst, value as u16);
            }

            // MOV r16, imm16
            (Operand::Register(dst), Operand::Immediate16(value)) => {
                let value = self.relocated_immediate(instr, value)?;
                self.regs.set(dst, value);
            }

            // MOV r, r (segment registers included)
            (Operand::Register(dst), Operand::Register(src)) => {
                let value = self.regs.get(src);
                self.regs.set(dst, value);
            }

            // MOV r, r/m
            (Operand::Register(dst), Operand::Memory) => {
                let value = self.read_memory(instr)?;
                self.regs.set(dst, value);
            }

            // MOV r/m16, imm16
            (Operand::Memory, Operand::Immediate16(value)) => {
                let value = self.relocated_immediate(instr, value)?;
                self.write_memory(instr, value)?;
            }

            // MOV r/m8, imm8
            (Operand::Memory, Operand::Immediate8(value)) => {
                self.write_memory(instr, value as u16)?;
            }

            // MOV r/m, r
            (Operand::Memory, Operand::Register(src)) => {
                let value = self.regs.get(src);
                self.write_memory(instr, value)?;
            }

            _ => return Err(self.unsupported(instr, "MOV operand combination")),
        }
        Ok(Flow::Next)
    }

    fn op_lea(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let Operand::Register(dst) = instr.op(0) else {
            return Err(self.unsupported(instr, "LEA destination must be a register"));
        };
        let mem = self.memory_operand(instr)?;
        if mem.base != Some(Register::Bp) || mem.index.is_some() {
            return Err(self.unsupported(instr, "LEA supports only [bp+disp]"));
        }

        let offset = self.effective_offset(&mem);
        self.regs.set(dst, offset);
        Ok(Flow::Next)
    }

    fn op_push(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let value = match instr.op(0) {
            op @ (Operand::Register(_)
            | Operand::Immediate8(_)
            | Operand::Immediate16(_)
            | Operand::Immediate8to16(_)
            | Operand::Memory) => self.read_operand(instr, op)?,
            _ => return Err(self.unsupported(instr, "PUSH operand kind")),
        };
        self.push(value)?;
        Ok(Flow::Next)
    }

    fn op_pop(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let Operand::Register(reg) = instr.op(0) else {
            return Err(self.unsupported(instr, "POP destination must be a register"));
        };

        let value = self.pop()?;
        self.regs.set(reg, value);
        Ok(Flow::Next)
    }

    fn op_stosw(&mut self) -> Result<Flow, CpuError> {
        // CX drops by two per stored word. An odd count stops at zero
        // rather than wrapping around.
        while self.regs.cx != 0 {
            self.mem
                .write_word(self.regs.es, self.regs.di, self.regs.ax)?;
            self.regs.di = self.regs.di.wrapping_add(2);
            self.regs.cx = self.regs.cx.saturating_sub(2);
        }
        Ok(Flow::Next)
    }

    // ==================== Stack Frames ====================

    fn op_enter(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        let (Operand::Immediate16(size), Operand::Immediate8(0)) = (instr.op(0), instr.op(1)) else {
            return Err(self.unsupported(instr, "ENTER with a non-zero nesting level"));
        };

        self.enter_frame(size)?;
        Ok(Flow::Next)
    }

    fn op_leave(&mut self) -> Result<Flow, CpuError> {
        self.leave_frame()?;

        // LEAVE doubles as the far return: unwind the CS:IP pair the call
        // pushed and resume after that call.
        let cs = self.pop()?;
        let ip = self.pop()?;
        let call = *self.mem.fetch(cs, ip)?;
        self.regs.cs = cs;
        self.regs.ip = call.next_ip();
        Ok(Flow::Jump)
    }

    fn enter_frame(&mut self, size: u16) -> Result<(), CpuError> {
        self.push(self.regs.bp)?;
        self.regs.bp = self.regs.sp;
        self.regs.sp = self.regs.sp.wrapping_sub(size);
        Ok(())
    }

    fn leave_frame(&mut self) -> Result<(), CpuError> {
        self.regs.sp = self.regs.bp;
        self.regs.bp = self.pop()?;
        Ok(())
    }

    // ==================== Control Flow ====================

    fn op_branch(&mut self, instr: &Instruction, taken: bool) -> Result<Flow, CpuError> {
        let Operand::NearBranch(target) = instr.op(0) else {
            return Err(self.unsupported(instr, "branch target must be a near offset"));
        };

        if taken {
            self.regs.ip = target;
            Ok(Flow::Jump)
        } else {
            Ok(Flow::Next)
        }
    }

    /// Push the caller's IP and CS and open the callee's frame.
    fn push_call_frame(&mut self) -> Result<(), CpuError> {
        self.push(self.regs.ip)?;
        self.push(self.regs.cs)?;
        self.regs.bp = self.regs.sp;
        Ok(())
    }

    fn op_call(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        match instr.op(0) {
            Operand::NearBranch(target) => {
                self.push_call_frame()?;
                self.regs.ip = target;
                Ok(Flow::Jump)
            }
            Operand::FarBranch {
                offset: RELOCATION_SENTINEL,
                ..
            } => self.call_import(instr),
            Operand::FarBranch { selector, offset } => {
                self.push_call_frame()?;
                self.regs.cs = selector;
                self.regs.ip = offset;
                Ok(Flow::Jump)
            }
            _ => Err(self.unsupported(instr, "indirect CALL")),
        }
    }

    /// Far call through a relocation into a host-implemented import.
    fn call_import(&mut self, instr: &Instruction) -> Result<Flow, CpuError> {
        self.push_call_frame()?;

        let site = self.regs.ip.wrapping_add(1);
        let target = self.mem.find_relocation(self.regs.cs, site).map(|r| r.target);

        match target {
            Some(RelocationTarget::Import(import)) => {
                debug!(
                    module = import.module,
                    function = import.function,
                    "calling host import"
                );
                self.functions
                    .invoke(&mut self.regs, &mut self.mem, import)?;

                // The host did the callee's work; return on its behalf.
                self.regs.cs = self.pop()?;
                self.regs.ip = self.pop()?.wrapping_add(instr.len as u16);
                Ok(Flow::Jump)
            }
            Some(RelocationTarget::Internal { .. }) => {
                Err(self.unsupported(instr, "far call through an internal relocation"))
            }
            None => Err(CpuError::UnresolvedExternalCall {
                segment: self.regs.cs,
                offset: instr.offset,
            }),
        }
    }
}

impl<F, M> std::fmt::Debug for Cpu<F, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("steps", &self.steps)
            .field("regs", &self.regs)
            .field("mem", &self.mem)
            .finish()
    }
}

/// Errors that can occur during CPU execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("unsupported instruction at {segment:04X}:{offset:04X} `{instruction}`: {detail}")]
    UnsupportedInstruction {
        segment: u16,
        offset: u16,
        instruction: String,
        detail: &'static str,
    },

    #[error("unresolved external call at {segment:04X}:{offset:04X}")]
    UnresolvedExternalCall { segment: u16, offset: u16 },

    #[error("host error: {0}")]
    Host(#[from] HostError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::memory::RelocationRecord;
    use proptest::prelude::*;

    const CODE: u16 = 1;
    const DATA: u16 = 2;

    #[derive(Default)]
    struct TestHost {
        calls: Vec<ImportOrdinal>,
        reads: Vec<(u16, u16)>,
        returns: u16,
        ax: Option<u16>,
    }

    impl ExternalFunctions for TestHost {
        fn invoke(
            &mut self,
            regs: &mut Registers,
            _mem: &mut Memory,
            import: ImportOrdinal,
        ) -> Result<u16, HostError> {
            self.calls.push(import);
            if let Some(ax) = self.ax {
                regs.ax = ax;
            }
            Ok(self.returns)
        }
    }

    impl ExternalMemory for TestHost {
        fn read_word(&mut self, segment: u16, offset: u16) -> Result<u16, HostError> {
            self.reads.push((segment, offset));
            Ok(self.returns)
        }
    }

    fn import(offset: u16, module: u16, function: u16) -> RelocationRecord {
        RelocationRecord {
            offset,
            target: RelocationTarget::Import(ImportOrdinal { module, function }),
        }
    }

    fn cpu_with_relocations(code: &[u8], relocations: Vec<RelocationRecord>) -> Cpu<TestHost, TestHost> {
        let mut cpu = Cpu::new(TestHost::default(), TestHost::default()).unwrap();
        cpu.mem.register_segment(CODE, code, true, relocations).unwrap();
        cpu.mem.reserve_segment(DATA).unwrap();
        cpu.regs.cs = CODE;
        cpu.regs.ds = DATA;
        cpu.regs.ip = 0;
        cpu
    }

    fn cpu_with_code(code: &[u8]) -> Cpu<TestHost, TestHost> {
        cpu_with_relocations(code, Vec::new())
    }

    // ==================== Scenarios ====================

    #[test]
    fn test_mov_then_add() {
        // mov ax, 5; add ax, 3
        let mut cpu = cpu_with_code(&[0xB8, 0x05, 0x00, 0x83, 0xC0, 0x03]);

        let first = cpu.step().unwrap();
        let second = cpu.step().unwrap();

        assert_eq!(cpu.regs.ax, 8);
        assert_eq!(cpu.regs.ip, first.len as u16 + second.len as u16);
        assert_eq!(cpu.steps, 2);
    }

    #[test]
    fn test_run_limited() {
        let mut cpu = cpu_with_code(&[0x90, 0x90, 0x90, 0xF4]);
        assert_eq!(cpu.run_limited(2).unwrap(), 2);
        assert_eq!(cpu.regs.ip, 2);

        // The fourth instruction (HLT) has no handler.
        assert!(matches!(
            cpu.run_limited(10),
            Err(CpuError::UnsupportedInstruction { offset: 3, .. })
        ));
    }

    #[test]
    fn test_fetch_mid_instruction_is_invalid_control_flow() {
        let mut cpu = cpu_with_code(&[0xB8, 0x05, 0x00]);
        cpu.regs.ip = 1;
        assert_eq!(
            cpu.step(),
            Err(CpuError::Memory(MemoryError::InvalidControlFlow {
                segment: CODE,
                ip: 1
            }))
        );
    }

    #[test]
    fn test_unsupported_mnemonic() {
        // hlt
        let mut cpu = cpu_with_code(&[0xF4]);
        let err = cpu.step().unwrap_err();
        assert!(matches!(err, CpuError::UnsupportedInstruction { segment: CODE, offset: 0, .. }));
        assert!(err.to_string().contains("hlt"));
        assert_eq!(cpu.regs.ip, 0);
    }

    // ==================== Relocations ====================

    #[test]
    fn test_mov_immediate_resolves_import() {
        // 9 x nop; mov ax, 0xFFFF at offset 9, immediate at offset 10
        let mut code = vec![0x90; 9];
        code.extend_from_slice(&[0xB8, 0xFF, 0xFF]);
        let mut cpu = cpu_with_relocations(&code, vec![import(10, 3, 7)]);
        cpu.functions.returns = 0x1234;

        cpu.run_limited(10).unwrap();

        assert_eq!(cpu.functions.calls, vec![ImportOrdinal { module: 3, function: 7 }]);
        assert_eq!(cpu.regs.ax, 0x1234);
        assert_eq!(cpu.regs.ip, 12);
    }

    #[test]
    fn test_mov_immediate_internal_relocation() {
        // mov bx, 0xFFFF
        let relocation = RelocationRecord {
            offset: 1,
            target: RelocationTarget::Internal { value: 2 },
        };
        let mut cpu = cpu_with_relocations(&[0xBB, 0xFF, 0xFF], vec![relocation]);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.bx, 2);
        assert!(cpu.functions.calls.is_empty());
    }

    #[test]
    fn test_mov_immediate_without_relocation_keeps_sentinel() {
        let mut cpu = cpu_with_code(&[0xBB, 0xFF, 0xFF]);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.bx, 0xFFFF);
    }

    #[test]
    fn test_mov_memory_immediate_uses_immediate_position() {
        // mov word [0x10], 0xFFFF; the immediate sits at offset 4
        let relocation = RelocationRecord {
            offset: 4,
            target: RelocationTarget::Internal { value: 0x0003 },
        };
        let mut cpu =
            cpu_with_relocations(&[0xC7, 0x06, 0x10, 0x00, 0xFF, 0xFF], vec![relocation]);
        cpu.step().unwrap();
        assert_eq!(cpu.mem.read_word(DATA, 0x10).unwrap(), 3);
    }

    #[test]
    fn test_far_call_into_host_import() {
        // call 0x0000:0xFFFF
        let mut cpu = cpu_with_relocations(&[0x9A, 0xFF, 0xFF, 0x00, 0x00], vec![import(1, 9, 2)]);
        cpu.functions.returns = 42;
        cpu.functions.ax = Some(42);

        cpu.step().unwrap();

        assert_eq!(cpu.functions.calls, vec![ImportOrdinal { module: 9, function: 2 }]);
        assert_eq!(cpu.regs.ax, 42);
        assert_eq!(cpu.regs.cs, CODE);
        assert_eq!(cpu.regs.ip, 5);
        assert_eq!(cpu.regs.sp, STACK_BASE);
        // The callee saw BP at the pushed return frame.
        assert_eq!(cpu.regs.bp, STACK_BASE - 4);
    }

    #[test]
    fn test_far_call_host_sees_return_frame() {
        let mut seen = None;
        let functions = |regs: &mut Registers,
                         mem: &mut Memory,
                         _import: ImportOrdinal|
         -> Result<u16, HostError> {
            let cs = mem.read_word(regs.ss, regs.bp).map_err(|e| HostError::new(e.to_string()))?;
            let ip = mem
                .read_word(regs.ss, regs.bp + 2)
                .map_err(|e| HostError::new(e.to_string()))?;
            seen = Some((cs, ip));
            Ok(0)
        };
        let mut cpu = Cpu::new(functions, Unlinked).unwrap();
        cpu.mem
            .register_segment(CODE, &[0x90, 0x9A, 0xFF, 0xFF, 0x00, 0x00], true, vec![import(2, 1, 1)])
            .unwrap();
        cpu.regs.cs = CODE;

        cpu.run_limited(2).unwrap();
        drop(cpu);

        assert_eq!(seen, Some((CODE, 1)));
    }

    #[test]
    fn test_far_call_without_relocation_is_fatal() {
        let mut cpu = cpu_with_code(&[0x9A, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(
            cpu.step(),
            Err(CpuError::UnresolvedExternalCall {
                segment: CODE,
                offset: 0
            })
        );
    }

    #[test]
    fn test_host_failure_propagates() {
        let mut cpu = Cpu::new(Unlinked, Unlinked).unwrap();
        cpu.mem
            .register_segment(CODE, &[0x9A, 0xFF, 0xFF, 0x00, 0x00], true, vec![import(1, 4, 4)])
            .unwrap();
        cpu.regs.cs = CODE;
        assert!(matches!(cpu.step(), Err(CpuError::Host(_))));
    }

    #[test]
    fn test_far_call_with_literal_target() {
        // 0: call 0x0001:0x0006; 5: nop; 6: nop
        let mut cpu = cpu_with_code(&[0x9A, 0x06, 0x00, 0x01, 0x00, 0x90, 0x90]);
        cpu.step().unwrap();
        assert_eq!((cpu.regs.cs, cpu.regs.ip), (CODE, 6));
        assert_eq!(cpu.pop().unwrap(), CODE);
        assert_eq!(cpu.pop().unwrap(), 0);
    }

    // ==================== Arithmetic ====================

    #[test]
    fn test_add_carry_heuristic() {
        // add ax, 1
        let cases = [
            (0x0001u16, 0x0002u16, false, false),
            (0x7FFF, 0x8000, false, true),
            (0xFFFF, 0x0000, true, true),
            (0x8000, 0x8001, false, false),
        ];
        for (before, after, zf, cf) in cases {
            let mut cpu = cpu_with_code(&[0x83, 0xC0, 0x01]);
            cpu.regs.ax = before;
            cpu.step().unwrap();
            assert_eq!(cpu.regs.ax, after);
            assert_eq!(cpu.regs.zf(), zf, "ZF for {:#06x}", before);
            assert_eq!(cpu.regs.cf(), cf, "CF for {:#06x}", before);
        }
    }

    #[test]
    fn test_add_sign_extends_byte_immediate() {
        // add ax, -1
        let mut cpu = cpu_with_code(&[0x83, 0xC0, 0xFF]);
        cpu.regs.ax = 5;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 4);
    }

    #[test]
    fn test_add_byte_register_wraps_at_eight_bits() {
        // add al, 1
        let mut cpu = cpu_with_code(&[0x04, 0x01]);
        cpu.regs.ax = 0x12FF;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0x1200);
        assert!(cpu.regs.zf());
    }

    #[test]
    fn test_add_memory_source_is_unsupported() {
        // add ax, [0x10]
        let mut cpu = cpu_with_code(&[0x03, 0x06, 0x10, 0x00]);
        assert!(matches!(cpu.step(), Err(CpuError::UnsupportedInstruction { .. })));
    }

    #[test]
    fn test_inc_updates_zero_flag_only() {
        // inc ax
        let mut cpu = cpu_with_code(&[0x40]);
        cpu.regs.ax = 0xFFFF;
        cpu.regs.set_flag(Flag::Carry);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0);
        assert!(cpu.regs.zf());
        assert!(cpu.regs.cf());
    }

    #[test]
    fn test_inc_memory_is_unsupported() {
        // inc word [0x10]
        let mut cpu = cpu_with_code(&[0xFF, 0x06, 0x10, 0x00]);
        assert!(matches!(cpu.step(), Err(CpuError::UnsupportedInstruction { .. })));
    }

    #[test]
    fn test_xor_and_or() {
        // xor ax, ax; or ax, bx
        let mut cpu = cpu_with_code(&[0x31, 0xC0, 0x09, 0xD8]);
        cpu.regs.ax = 0x1234;
        cpu.regs.bx = 0x00F0;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0x00F0);
    }

    #[test]
    fn test_shl_shifts_by_one() {
        // shl ax, 1
        let mut cpu = cpu_with_code(&[0xD1, 0xE0]);
        cpu.regs.ax = 0xC001;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0x8002);
    }

    #[test]
    fn test_imul_three_operand() {
        // imul ax, bx, 5
        let mut cpu = cpu_with_code(&[0x6B, 0xC3, 0x05]);
        cpu.regs.bx = 7;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 35);
    }

    // ==================== Data Transfer ====================

    #[test]
    fn test_mov_register_and_segment_forms() {
        // mov al, 0x7F; mov ds, ax; mov bx, es
        let mut cpu = cpu_with_code(&[0xB0, 0x7F, 0x8E, 0xD8, 0x8C, 0xC3]);
        cpu.regs.ax = 0x1200;
        cpu.run_limited(3).unwrap();
        assert_eq!(cpu.regs.ax, 0x127F);
        assert_eq!(cpu.regs.ds, 0x127F);
        assert_eq!(cpu.regs.bx, EXTRA_SEGMENT);
    }

    #[test]
    fn test_mov_displacement_memory() {
        // mov [0x20], al; mov ax, [0x20]
        let mut cpu = cpu_with_code(&[0xA2, 0x20, 0x00, 0xA1, 0x20, 0x00]);
        cpu.mem.write_byte(DATA, 0x21, 0xAB).unwrap();
        cpu.regs.ax = 0x0042;

        cpu.step().unwrap();
        assert_eq!(cpu.mem.read_byte(DATA, 0x20).unwrap(), 0x42);

        cpu.regs.ax = 0;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0xAB42);
    }

    #[test]
    fn test_mov_bp_relative_memory() {
        // mov [bp-4], ax; mov bx, [bp-4]
        let mut cpu = cpu_with_code(&[0x89, 0x46, 0xFC, 0x8B, 0x5E, 0xFC]);
        cpu.regs.bp = 0x0100;
        cpu.regs.ax = 0xBEEF;
        cpu.run_limited(2).unwrap();
        assert_eq!(cpu.mem.read_word(STACK_SEGMENT, 0x00FC).unwrap(), 0xBEEF);
        assert_eq!(cpu.regs.bx, 0xBEEF);
    }

    #[test]
    fn test_mov_byte_immediate_through_bx() {
        // mov byte [bx], 5
        let mut cpu = cpu_with_code(&[0xC6, 0x07, 0x05]);
        cpu.regs.bx = 0x30;
        cpu.step().unwrap();
        assert_eq!(cpu.mem.read_byte(DATA, 0x30).unwrap(), 5);
        assert_eq!(cpu.mem.read_byte(DATA, 0x31).unwrap(), 0);
    }

    #[test]
    fn test_host_owned_extra_segment_reads_through_callback() {
        // mov ax, es:[bx]
        let mut cpu = cpu_with_code(&[0x26, 0x8B, 0x07]);
        cpu.regs.es = 0x1234;
        cpu.regs.bx = 0x40;
        cpu.external_memory.returns = 0xCAFE;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0xCAFE);
        assert_eq!(cpu.external_memory.reads, vec![(0x1234, 0x40)]);
    }

    #[test]
    fn test_local_extra_segment_reads_memory() {
        // mov ax, es:[bx]
        let mut cpu = cpu_with_code(&[0x26, 0x8B, 0x07]);
        cpu.regs.bx = 0x40;
        cpu.mem.write_word(EXTRA_SEGMENT, 0x40, 0x1111).unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0x1111);
        assert!(cpu.external_memory.reads.is_empty());
    }

    #[test]
    fn test_lea_bp_relative() {
        // lea ax, [bp-6]
        let mut cpu = cpu_with_code(&[0x8D, 0x46, 0xFA]);
        cpu.regs.bp = 0x0100;
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ax, 0x00FA);
    }

    #[test]
    fn test_lea_other_addressing_is_unsupported() {
        // lea ax, [bx+2]
        let mut cpu = cpu_with_code(&[0x8D, 0x47, 0x02]);
        assert!(matches!(cpu.step(), Err(CpuError::UnsupportedInstruction { .. })));
    }

    #[test]
    fn test_push_sources() {
        // push 0x1234; push -1; push word [0x10]; push word [bp-2]
        let mut cpu = cpu_with_code(&[
            0x68, 0x34, 0x12, 0x6A, 0xFF, 0xFF, 0x36, 0x10, 0x00, 0xFF, 0x76, 0xFE,
        ]);
        cpu.mem.write_word(DATA, 0x10, 0xAAAA).unwrap();
        cpu.mem.write_word(STACK_SEGMENT, 0x0FE, 0xBBBB).unwrap();
        cpu.regs.bp = 0x0100;

        cpu.run_limited(4).unwrap();

        assert_eq!(cpu.pop().unwrap(), 0xBBBB);
        assert_eq!(cpu.pop().unwrap(), 0xAAAA);
        assert_eq!(cpu.pop().unwrap(), 0xFFFF);
        assert_eq!(cpu.pop().unwrap(), 0x1234);
        assert_eq!(cpu.regs.sp, STACK_BASE);
    }

    #[test]
    fn test_pop_past_stack_top_faults() {
        // pop ax
        let mut cpu = cpu_with_code(&[0x58]);
        assert!(matches!(
            cpu.step(),
            Err(CpuError::Memory(MemoryError::SegmentFault { .. }))
        ));
    }

    #[test]
    fn test_stosw_consumes_two_from_cx_per_word() {
        let mut cpu = cpu_with_code(&[0xAB]);
        cpu.regs.cx = 4;
        cpu.regs.ax = 0x1234;
        cpu.regs.di = 0x100;
        cpu.regs.es = DATA;

        cpu.step().unwrap();

        assert_eq!(cpu.mem.read_word(DATA, 0x100).unwrap(), 0x1234);
        assert_eq!(cpu.mem.read_word(DATA, 0x102).unwrap(), 0x1234);
        // Two iterations, not four.
        assert_eq!(cpu.mem.read_word(DATA, 0x104).unwrap(), 0);
        assert_eq!(cpu.regs.di, 0x104);
        assert_eq!(cpu.regs.cx, 0);
    }

    #[test]
    fn test_stosw_odd_count_terminates() {
        let mut cpu = cpu_with_code(&[0xAB]);
        cpu.regs.cx = 3;
        cpu.regs.ax = 0x5555;
        cpu.regs.es = DATA;

        cpu.step().unwrap();

        assert_eq!(cpu.regs.di, 4);
        assert_eq!(cpu.regs.cx, 0);
    }

    // ==================== Frames & Branches ====================

    #[test]
    fn test_near_call_enter_leave_returns_after_call() {
        // 0: call 0x0005; 3: nop; 4: nop; 5: enter 4, 0; 9: leave
        let mut cpu = cpu_with_code(&[
            0xE8, 0x02, 0x00, 0x90, 0x90, 0xC8, 0x04, 0x00, 0x00, 0xC9,
        ]);
        cpu.regs.bp = 0x1111;

        cpu.step().unwrap();
        assert_eq!(cpu.regs.ip, 5);
        assert_eq!(cpu.regs.sp, STACK_BASE - 4);
        assert_eq!(cpu.regs.bp, STACK_BASE - 4);

        cpu.step().unwrap();
        assert_eq!(cpu.regs.bp, STACK_BASE - 6);
        assert_eq!(cpu.regs.sp, STACK_BASE - 10);

        cpu.step().unwrap();
        assert_eq!((cpu.regs.cs, cpu.regs.ip), (CODE, 3));
        assert_eq!(cpu.regs.sp, STACK_BASE);
        assert_eq!(cpu.regs.bp, STACK_BASE - 4);
    }

    #[test]
    fn test_enter_with_nesting_is_unsupported() {
        // enter 4, 1
        let mut cpu = cpu_with_code(&[0xC8, 0x04, 0x00, 0x01]);
        assert!(matches!(cpu.step(), Err(CpuError::UnsupportedInstruction { .. })));
    }

    fn branch_ip(opcode: u8, zf: bool, cf: bool) -> u16 {
        // jcc +2; nop; nop; nop
        let mut cpu = cpu_with_code(&[opcode, 0x02, 0x90, 0x90, 0x90]);
        cpu.regs.update_flag(Flag::Zero, zf);
        cpu.regs.update_flag(Flag::Carry, cf);
        cpu.step().unwrap();
        cpu.regs.ip
    }

    #[test]
    fn test_conditional_jumps() {
        const TAKEN: u16 = 4;
        const FALLTHROUGH: u16 = 2;

        // (opcode, zf, cf, expected)
        let cases = [
            (0x74, true, false, TAKEN),        // je
            (0x74, false, false, FALLTHROUGH), // je
            (0x75, false, true, TAKEN),        // jne
            (0x75, true, false, FALLTHROUGH),  // jne
            (0x7C, false, true, TAKEN),        // jl
            (0x7C, true, false, FALLTHROUGH),  // jl
            (0x72, false, true, TAKEN),        // jb
            (0x72, false, false, FALLTHROUGH), // jb
            (0x7D, false, false, TAKEN),       // jge
            (0x7D, true, false, TAKEN),        // jge
            (0x7D, false, true, FALLTHROUGH),  // jge
            (0x7E, true, false, TAKEN),        // jle
            (0x7E, false, true, TAKEN),        // jle
            (0x7E, false, false, FALLTHROUGH), // jle
            (0x76, true, false, TAKEN),        // jbe
            (0x76, false, true, FALLTHROUGH),  // jbe ignores CF
            (0x76, true, true, TAKEN),         // jbe
            (0x76, false, false, FALLTHROUGH), // jbe
            (0xEB, false, false, TAKEN),       // jmp
        ];
        for (opcode, zf, cf, expected) in cases {
            assert_eq!(
                branch_ip(opcode, zf, cf),
                expected,
                "opcode {:#04x} zf={} cf={}",
                opcode,
                zf,
                cf
            );
        }
    }

    #[test]
    fn test_jump_into_instruction_fails_on_next_step() {
        // jmp +1 (lands inside mov ax, 5)
        let mut cpu = cpu_with_code(&[0xEB, 0x01, 0xB8, 0x05, 0x00]);
        cpu.step().unwrap();
        assert_eq!(cpu.regs.ip, 3);
        assert!(matches!(
            cpu.step(),
            Err(CpuError::Memory(MemoryError::InvalidControlFlow { ip: 3, .. }))
        ));
    }

    // ==================== Properties ====================

    proptest! {
        #[test]
        fn add_wraps_and_sets_zero_flag(a: u16, b: u16) {
            // add ax, bx
            let mut cpu = cpu_with_code(&[0x01, 0xD8]);
            cpu.regs.ax = a;
            cpu.regs.bx = b;
            cpu.step().unwrap();

            let expected = ((a as u32 + b as u32) % 65536) as u16;
            prop_assert_eq!(cpu.regs.ax, expected);
            prop_assert_eq!(cpu.regs.zf(), expected == 0);
        }

        #[test]
        fn push_then_pop_restores_sp(value: u16) {
            // push ax; pop bx
            let mut cpu = cpu_with_code(&[0x50, 0x5B]);
            cpu.regs.ax = value;
            cpu.run_limited(2).unwrap();
            prop_assert_eq!(cpu.regs.bx, value);
            prop_assert_eq!(cpu.regs.sp, STACK_BASE);
        }

        #[test]
        fn enter_then_frame_teardown_restores_sp_and_bp(size: u16, bp: u16) {
            let mut cpu = cpu_with_code(&[0x90]);
            cpu.regs.bp = bp;
            let sp = cpu.regs.sp;

            cpu.enter_frame(size).unwrap();
            cpu.leave_frame().unwrap();

            prop_assert_eq!(cpu.regs.sp, sp);
            prop_assert_eq!(cpu.regs.bp, bp);
        }

        #[test]
        fn call_enter_leave_restores_sp_and_bp(size: u16) {
            // 0: call 0x0004; 3: nop; 4: enter size, 0; 8: leave
            let [lo, hi] = size.to_le_bytes();
            let mut cpu = cpu_with_code(&[0xE8, 0x01, 0x00, 0x90, 0xC8, lo, hi, 0x00, 0xC9]);

            cpu.step().unwrap();
            let (sp, bp) = (cpu.regs.sp, cpu.regs.bp);

            cpu.step().unwrap();
            prop_assert_eq!(cpu.regs.sp, sp.wrapping_sub(2).wrapping_sub(size));

            cpu.step().unwrap();
            prop_assert_eq!(cpu.regs.bp, bp);
            prop_assert_eq!(cpu.regs.sp, STACK_BASE);
            prop_assert_eq!((cpu.regs.cs, cpu.regs.ip), (CODE, 3));
        }

        #[test]
        fn cmp_sets_flags_like_unsigned_compare(a: u16, b: u16) {
            // cmp ax, bx
            let mut cpu = cpu_with_code(&[0x39, 0xD8]);
            cpu.regs.ax = a;
            cpu.regs.bx = b;
            cpu.step().unwrap();

            prop_assert_eq!(cpu.regs.zf(), a == b);
            prop_assert_eq!(cpu.regs.cf(), a < b);
            prop_assert_eq!(cpu.regs.ax, a);
        }
    }
}
