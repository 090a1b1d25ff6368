//! # MBBS CPU
//!
//! A software interpreter for the 16-bit segmented x86 code found in
//! legacy bulletin-board modules.
//!
//! Module segments are loaded into a per-context segment store, executed
//! one instruction at a time, and any far call or immediate that the
//! module's relocation table points at an imported function is handed to
//! the host.

pub mod cpu;
pub mod disasm;
pub mod image;

// Re-export commonly used types
pub use cpu::{
    Cpu, CpuError, ExternalFunctions, ExternalMemory, HostError, ImportOrdinal, Instruction,
    Memory, MemoryError, Registers, RelocationRecord, RelocationTarget, Unlinked,
};
pub use disasm::{disassemble, disassemble_instruction};
pub use image::{load_image, ImageError, ModuleImage, SegmentImage};
