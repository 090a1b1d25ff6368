//! Disassembler for loaded code segments.
//!
//! Renders the pre-decoded instruction index back to readable assembly,
//! annotating relocated operands with the import or value they resolve to.

use crate::cpu::decode::Instruction;
use crate::cpu::memory::{RelocationTarget, Segment};

/// Disassemble a single instruction to text.
pub fn disassemble_instruction(instr: &Instruction) -> String {
    instr.to_string()
}

/// Disassemble every instruction of a code segment.
///
/// Data segments produce only the header line.
pub fn disassemble(segment: &Segment) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "; segment {:04X} ({} instructions, {} relocations)\n",
        segment.ordinal(),
        segment.instructions().len(),
        segment.relocations().len()
    ));

    for instr in segment.instructions() {
        let start = instr.offset as usize;
        let bytes = &segment.bytes()[start..start + instr.len as usize];
        let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();

        output.push_str(&format!(
            "{:04X}: {:<14} {}",
            instr.offset,
            hex,
            disassemble_instruction(instr)
        ));
        if let Some(note) = relocation_note(segment, instr) {
            output.push_str("  ; ");
            output.push_str(&note);
        }
        output.push('\n');
    }

    output
}

/// Describe the relocation that patches bytes of `instr`, if any.
fn relocation_note(segment: &Segment, instr: &Instruction) -> Option<String> {
    let end = instr.next_ip();
    segment
        .relocations()
        .iter()
        .find(|r| r.offset > instr.offset && (r.offset < end || end < instr.offset))
        .map(|r| match r.target {
            RelocationTarget::Import(import) => {
                format!("import {}:{}", import.module, import.function)
            }
            RelocationTarget::Internal { value } => format!("internal {:#06x}", value),
        })
}
