//! Disassembler built on iced-x86

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};

use super::{Disassembler, NATIVE_BITNESS};

/// Produces NASM-style listings that [`IcedAssembler`](super::IcedAssembler) can read back
#[derive(Debug, Clone, Copy)]
pub struct IcedDisassembler {
    /// 32 or 64
    bitness: u32,
}

impl Default for IcedDisassembler {
    fn default() -> Self {
        Self::new(NATIVE_BITNESS)
    }
}

impl IcedDisassembler {
    /// Creates a disassembler for 32 or 64 bit code
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    /// Formatter configured to print operands the assembler accepts
    fn formatter() -> NasmFormatter {
        let mut formatter = NasmFormatter::new();
        let options = formatter.options_mut();
        options.set_hex_prefix("0x");
        options.set_hex_suffix("");
        options.set_uppercase_hex(false);
        options.set_space_after_operand_separator(true);
        options.set_show_branch_size(false);
        options.set_branch_leading_zeros(false);
        // `[rax+rax+0x0]` and `[rax+rax]` encode differently
        options.set_show_zero_displacements(true);
        formatter
    }
}

impl Disassembler for IcedDisassembler {
    fn disassemble(&self, code: &[u8], ip: u64) -> String {
        let mut decoder = Decoder::with_ip(self.bitness, code, ip, DecoderOptions::NONE);
        let mut formatter = Self::formatter();
        let mut instruction = Instruction::default();
        let mut lines = Vec::new();

        while decoder.can_decode() {
            let position = decoder.position();
            decoder.decode_out(&mut instruction);

            if instruction.is_invalid() {
                // keep undecodable bytes as data so the listing still reassembles
                let end = (position + instruction.len().max(1)).min(code.len());
                let bytes: Vec<_> = code[position..end]
                    .iter()
                    .map(|b| format!("{b:#04x}"))
                    .collect();
                lines.push(format!("db {}", bytes.join(", ")));
                continue;
            }

            let mut line = String::new();
            formatter.format(&instruction, &mut line);
            lines.push(line);
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::IcedDisassembler;
    use crate::backend::Disassembler;

    #[test]
    fn test_listing() {
        let disassembler = IcedDisassembler::new(64);
        // mov eax, 5; nop; ret
        let text = disassembler.disassemble(&[0xb8, 0x05, 0x00, 0x00, 0x00, 0x90, 0xc3], 0x1000);

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines, ["mov eax, 5", "nop", "ret"]);
    }

    #[test]
    /// Branch targets are printed as absolute addresses
    fn test_branch_target() {
        let disassembler = IcedDisassembler::new(64);
        // jmp +0x10 from 0x1000
        let text = disassembler.disassemble(&[0xeb, 0x0e], 0x1000);

        assert_eq!(text, "jmp 0x1010");
    }

    #[test]
    /// Rip-relative operands are printed with their absolute target
    fn test_rip_relative() {
        let disassembler = IcedDisassembler::new(64);
        // mov eax, [rip+0x10] at 0x1000
        let text = disassembler.disassemble(&[0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000);

        assert_eq!(text, "mov eax, [rel 0x1016]");
    }

    #[test]
    fn test_empty() {
        assert_eq!(IcedDisassembler::new(32).disassemble(&[], 0), "");
    }
}
