//! CPU emulation for 16-bit segmented module code.
//!
//! This module implements the interpreter core:
//! - A segment store of 64KB segments keyed by ordinal, with pre-decoded code
//! - The 16-bit register file with CF/ZF
//! - A dispatch loop over the instruction subset module code uses
//! - Far calls and relocated immediates routed to host-implemented imports

pub mod memory;
pub mod registers;
pub mod decode;
pub mod execute;

pub use memory::{ImportOrdinal, Memory, MemoryError, RelocationRecord, RelocationTarget, Segment};
pub use registers::{Flag, Register, Registers};
pub use decode::{DecodeError, Instruction, Mnemonic, Operand};
pub use execute::{Cpu, CpuError, ExternalFunctions, ExternalMemory, HostError, Unlinked};
