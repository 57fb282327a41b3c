//! Instruction decoding for state reports.

/// Instructions shown from the stop address on.
pub const CONTEXT_INSTRUCTIONS: usize = 4;

/// One line per instruction decoded from `code`, which was read at
/// `address`. Bytes that do not decode are shown as a single hex line.
pub fn disassemble(code: &[u8], address: u64, count: usize) -> Vec<String> {
    match decode(code, address, count) {
        Some(lines) if !lines.is_empty() => lines,
        _ => vec![format_line(address, code, "")],
    }
}

#[cfg(target_arch = "x86_64")]
fn decode(code: &[u8], address: u64, count: usize) -> Option<Vec<String>> {
    use capstone::prelude::*;
    use log::debug;

    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .inspect_err(|err| debug!("disassembler unavailable: {err}"))
        .ok()?;
    let instructions = cs.disasm_count(code, address, count).ok()?;

    Some(
        instructions
            .iter()
            .map(|insn| {
                let text = match (insn.mnemonic(), insn.op_str()) {
                    (Some(mnemonic), Some(operands)) if !operands.is_empty() => format!("{mnemonic} {operands}"),
                    (Some(mnemonic), _) => mnemonic.to_string(),
                    _ => "??".to_string(),
                };
                format_line(insn.address(), insn.bytes(), &text)
            })
            .collect(),
    )
}

#[cfg(not(target_arch = "x86_64"))]
fn decode(_code: &[u8], _address: u64, _count: usize) -> Option<Vec<String>> {
    None
}

fn format_line(address: u64, bytes: &[u8], text: &str) -> String {
    format!("{address:016x}  {:<24} {text}", hex(bytes)).trim_end().to_string()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
