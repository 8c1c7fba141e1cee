//! Intel-syntax assembler built on iced-x86's encoders
//!
//! Reads back the NASM-style listings [`IcedDisassembler`](super::IcedDisassembler) produces,
//! along with the usual hand-written variations (`dword ptr`, condition code aliases such as
//! `jz`, `short`/`near` branch hints). Any legacy or VEX encoded instruction iced knows about
//! can be written: the operands are tried against every [`Code`] sharing the mnemonic and the
//! shortest encoding wins. One statement per line, with `;` or `#` starting a comment.

use std::collections::HashMap;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Encoder, EncodingKind, IcedError, Instruction,
    InstructionBlock, MemoryOperand, Mnemonic, OpCodeOperandKind, Register, RepPrefixKind,
};
use lazy_static::lazy_static;

use super::{Assembler, NATIVE_BITNESS};
use crate::error::AssembleError;

/// Assembles text for 16, 32 or 64 bit code at a given instruction pointer
#[derive(Debug, Clone, Copy)]
pub struct IcedAssembler {
    /// 16, 32 or 64
    bitness: u32,
}

impl Default for IcedAssembler {
    fn default() -> Self {
        Self::new(NATIVE_BITNESS)
    }
}

lazy_static! {
    /// Registers by lowercase name
    static ref REGISTERS: HashMap<String, Register> = {
        let mut registers: HashMap<String, Register> = Register::values()
            .filter(|&register| register != Register::None)
            .map(|register| (format!("{register:?}").to_ascii_lowercase(), register))
            .collect();
        // NASM spells the low bytes of r8-r15 with a `b`
        let low_bytes = [
            Register::R8L, Register::R9L, Register::R10L, Register::R11L,
            Register::R12L, Register::R13L, Register::R14L, Register::R15L,
        ];
        for (number, register) in (8..).zip(low_bytes) {
            registers.insert(format!("r{number}b"), register);
        }
        registers
    };

    /// Encodable forms of each mnemonic, in opcode order
    static ref FORMS: HashMap<Mnemonic, Vec<Code>> = {
        let mut forms: HashMap<Mnemonic, Vec<Code>> = HashMap::new();
        for code in Code::values() {
            let op_code = code.op_code();
            if op_code.is_instruction()
                && matches!(op_code.encoding(), EncodingKind::Legacy | EncodingKind::VEX)
            {
                forms.entry(code.mnemonic()).or_default().push(code);
            }
        }
        forms
    };

    /// Mnemonics by lowercase name
    static ref MNEMONICS: HashMap<String, Mnemonic> = FORMS
        .keys()
        .map(|&mnemonic| (format!("{mnemonic:?}").to_ascii_lowercase(), mnemonic))
        .collect();
}

/// Alternative condition code spellings and the name iced uses for them
const CONDITION_ALIASES: &[(&str, &str)] = &[
    ("z", "e"),
    ("nz", "ne"),
    ("c", "b"),
    ("nae", "b"),
    ("nb", "ae"),
    ("nc", "ae"),
    ("na", "be"),
    ("nbe", "a"),
    ("pe", "p"),
    ("po", "np"),
    ("nge", "l"),
    ("nl", "ge"),
    ("ng", "le"),
    ("nle", "g"),
];

/// Memory operand size keywords and their size in bytes
const SIZES: &[(&str, usize)] = &[
    ("byte", 1),
    ("word", 2),
    ("dword", 4),
    ("fword", 6),
    ("qword", 8),
    ("tword", 10),
    ("oword", 16),
    ("xmmword", 16),
    ("yword", 32),
    ("ymmword", 32),
    ("zword", 64),
    ("zmmword", 64),
];

/// A parsed memory operand
#[derive(Debug, Clone, Copy)]
struct Memory {
    /// Address expression
    operand: MemoryOperand,
    /// Size keyword, in bytes
    size: Option<usize>,
    /// For `[rip+disp]`, the displacement from the end of the instruction
    rip_offset: Option<i64>,
}

/// A parsed operand
#[derive(Debug, Clone, Copy)]
enum Operand {
    /// Any register
    Reg(Register),
    /// Memory
    Mem(Memory),
    /// Immediate or absolute branch target
    Imm(i64),
}

/// An operand converted to what one particular [`Code`] expects
#[derive(Debug, Clone, Copy)]
enum Arg {
    /// Register
    Reg(Register),
    /// Memory
    Mem(MemoryOperand),
    /// Immediate of up to 32 bits
    Imm(i32),
    /// 64 bit immediate
    Imm64(u64),
    /// Near branch target
    Branch(u64),
}

/// Prefixes written before the mnemonic
#[derive(Debug, Clone, Copy)]
struct Prefixes {
    /// `lock`
    lock: bool,
    /// `rep`/`repe`/`repz` or `repne`/`repnz`
    rep: RepPrefixKind,
}

impl Prefixes {
    /// Sets the prefixes on `instruction`
    fn apply(self, instruction: &mut Instruction) {
        instruction.set_has_lock_prefix(self.lock);
        match self.rep {
            RepPrefixKind::Repe => instruction.set_has_repe_prefix(true),
            RepPrefixKind::Repne => instruction.set_has_repne_prefix(true),
            RepPrefixKind::None => {}
        }
    }
}

/// Builds a string instruction for an address size and repeat prefix
type StringForm = fn(u32, RepPrefixKind) -> Result<Instruction, IcedError>;

/// Constructor for string instructions written without operands, e.g. `rep movsq`
fn string_form(mnemonic: Mnemonic) -> Option<StringForm> {
    let form: StringForm = match mnemonic {
        Mnemonic::Movsb => |size, rep| Instruction::with_movsb(size, Register::None, rep),
        Mnemonic::Movsw => |size, rep| Instruction::with_movsw(size, Register::None, rep),
        Mnemonic::Movsd => |size, rep| Instruction::with_movsd(size, Register::None, rep),
        Mnemonic::Movsq => |size, rep| Instruction::with_movsq(size, Register::None, rep),
        Mnemonic::Stosb => Instruction::with_stosb,
        Mnemonic::Stosw => Instruction::with_stosw,
        Mnemonic::Stosd => Instruction::with_stosd,
        Mnemonic::Stosq => Instruction::with_stosq,
        _ => return None,
    };
    Some(form)
}

/// Builds a syntax error for `line`
fn syntax(line: usize, message: impl Into<String>) -> AssembleError {
    AssembleError::Syntax {
        line,
        message: message.into(),
    }
}

/// Looks up a register by name
fn register(name: &str) -> Option<Register> {
    REGISTERS.get(name).copied()
}

/// Looks up a mnemonic by name, accepting condition code aliases (`jz`, `setnae`, `cmovc`, ...)
fn mnemonic(name: &str) -> Option<Mnemonic> {
    if let Some(&mnemonic) = MNEMONICS.get(name) {
        return Some(mnemonic);
    }
    ["cmov", "set", "j"].iter().find_map(|prefix| {
        let condition = name.strip_prefix(prefix)?;
        let (_, canonical) = CONDITION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == condition)?;
        MNEMONICS.get(&format!("{prefix}{canonical}")).copied()
    })
}

/// Parses decimal, `0x` prefixed or `h` suffixed hex, with an optional leading `-`
fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, text),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = digits
        .strip_suffix('h')
        .filter(|h| h.starts_with(|c: char| c.is_ascii_digit()))
    {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };
    // 64 bit immediates are written unsigned, so wrap instead of rejecting them
    let value = value as i64;
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Strips a leading size keyword such as `dword` or `dword ptr`
fn strip_size(text: &str) -> (Option<usize>, &str) {
    for &(keyword, size) in SIZES {
        let rest = match text.strip_prefix(keyword) {
            Some(rest) if rest.starts_with(|c: char| c.is_whitespace() || c == '[') => rest,
            _ => continue,
        };
        let rest = rest.trim_start();
        let rest = rest
            .strip_prefix("ptr")
            .filter(|r| !r.starts_with(|c: char| c.is_ascii_alphanumeric()))
            .unwrap_or(rest)
            .trim_start();
        return (Some(size), rest);
    }
    (None, text)
}

/// Converts an immediate to the 32 bit value iced expects for an operand of `kind`
///
/// Listings print sign-extended immediates as the extended unsigned value, e.g.
/// `add eax, 0xfffffff0` for an 8 bit `-16`, so those are folded back first.
fn immediate(kind: OpCodeOperandKind, value: i64) -> Option<i32> {
    match kind {
        OpCodeOperandKind::imm8sex16 if (0xff80..=0xffff).contains(&value) => {
            i32::try_from(value - 0x1_0000).ok()
        }
        OpCodeOperandKind::imm8sex32 if (0xffff_ff80..=0xffff_ffff).contains(&value) => {
            i32::try_from(value - 0x1_0000_0000).ok()
        }
        // the value ends up sign extended to 64 bits, so it has to be in range as written
        OpCodeOperandKind::imm8sex64 | OpCodeOperandKind::imm32sex64 => i32::try_from(value).ok(),
        _ => i32::try_from(value)
            .ok()
            .or_else(|| u32::try_from(value).ok().map(|v| v as i32)),
    }
}

/// Converts `operand` into what operand `kind` of an instruction form expects
fn arg(kind: OpCodeOperandKind, operand: &Operand) -> Option<Arg> {
    match *operand {
        Operand::Reg(register) => Some(Arg::Reg(register)),
        Operand::Mem(memory) => Some(Arg::Mem(memory.operand)),
        Operand::Imm(value) => match kind {
            OpCodeOperandKind::br16_1
            | OpCodeOperandKind::br32_1
            | OpCodeOperandKind::br64_1
            | OpCodeOperandKind::br16_2
            | OpCodeOperandKind::br32_4
            | OpCodeOperandKind::br64_4 => Some(Arg::Branch(value as u64)),
            OpCodeOperandKind::imm64 => Some(Arg::Imm64(value as u64)),
            _ => immediate(kind, value).map(Arg::Imm),
        },
    }
}

/// Builds `code` with `operands`, or `None` if the operands can't be expressed for it.
/// Register classes and fixed registers aren't checked here, the encoder rejects those.
fn build(code: Code, operands: &[Operand]) -> Option<Instruction> {
    let op_code = code.op_code();
    if op_code.op_count() as usize != operands.len() {
        return None;
    }
    let args = operands
        .iter()
        .enumerate()
        .map(|(index, operand)| arg(op_code.op_kind(index as u32), operand))
        .collect::<Option<Vec<_>>>()?;

    let instruction = match *args.as_slice() {
        [] => Ok(Instruction::with(code)),
        [Arg::Branch(target)] => Instruction::with_branch(code, target),
        [Arg::Reg(a)] => Instruction::with1(code, a),
        [Arg::Mem(a)] => Instruction::with1(code, a),
        [Arg::Imm(a)] => Instruction::with1(code, a),
        [Arg::Reg(a), Arg::Reg(b)] => Instruction::with2(code, a, b),
        [Arg::Reg(a), Arg::Mem(b)] => Instruction::with2(code, a, b),
        [Arg::Reg(a), Arg::Imm(b)] => Instruction::with2(code, a, b),
        [Arg::Reg(a), Arg::Imm64(b)] => Instruction::with2(code, a, b),
        [Arg::Mem(a), Arg::Reg(b)] => Instruction::with2(code, a, b),
        [Arg::Mem(a), Arg::Imm(b)] => Instruction::with2(code, a, b),
        [Arg::Imm(a), Arg::Reg(b)] => Instruction::with2(code, a, b),
        [Arg::Imm(a), Arg::Imm(b)] => Instruction::with2(code, a, b),
        [Arg::Reg(a), Arg::Reg(b), Arg::Reg(c)] => Instruction::with3(code, a, b, c),
        [Arg::Reg(a), Arg::Reg(b), Arg::Mem(c)] => Instruction::with3(code, a, b, c),
        [Arg::Reg(a), Arg::Reg(b), Arg::Imm(c)] => Instruction::with3(code, a, b, c),
        [Arg::Reg(a), Arg::Mem(b), Arg::Reg(c)] => Instruction::with3(code, a, b, c),
        [Arg::Reg(a), Arg::Mem(b), Arg::Imm(c)] => Instruction::with3(code, a, b, c),
        [Arg::Mem(a), Arg::Reg(b), Arg::Reg(c)] => Instruction::with3(code, a, b, c),
        [Arg::Mem(a), Arg::Reg(b), Arg::Imm(c)] => Instruction::with3(code, a, b, c),
        _ => return None,
    };
    instruction.ok()
}

impl IcedAssembler {
    /// Creates an assembler for 16, 32 or 64 bit code
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    /// Whether `code` can be encoded in the target mode
    fn available(&self, code: Code) -> bool {
        let op_code = code.op_code();
        match self.bitness {
            16 => op_code.mode16(),
            32 => op_code.mode32(),
            _ => op_code.mode64(),
        }
    }

    /// Length of `instruction` when encoded at `ip`, or `None` if it can't be encoded
    fn encoded_len(&self, instruction: &Instruction, ip: u64) -> Result<Option<usize>, AssembleError> {
        let mut encoder = Encoder::try_new(self.bitness)?;
        Ok(encoder.encode(instruction, ip).ok())
    }

    /// Parses the inside of `[...]`
    fn parse_memory(&self, line: usize, inner: &str) -> Result<(MemoryOperand, Option<i64>), AssembleError> {
        let (segment, inner) = match inner.split_once(':') {
            Some((prefix, rest)) => match register(prefix.trim()) {
                Some(segment) if segment.is_segment_register() => (segment, rest.trim()),
                _ => return Err(syntax(line, format!("bad segment `{prefix}`"))),
            },
            None => (Register::None, inner.trim()),
        };

        if let Some(target) = inner.strip_prefix("rel ") {
            let target = parse_int(target.trim())
                .ok_or_else(|| syntax(line, format!("bad address `{target}`")))?;
            let operand =
                MemoryOperand::new(Register::RIP, Register::None, 1, target, 8, false, segment);
            return Ok((operand, None));
        }

        let mut base = Register::None;
        let mut index = Register::None;
        let mut scale = 1u32;
        let mut displacement = 0i64;
        let mut has_displacement = false;

        let normalized = inner.replace('-', "+-");
        for term in normalized.split('+').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((lhs, rhs)) = term.split_once('*') {
                let (lhs, rhs) = (lhs.trim(), rhs.trim());
                let (reg, factor) = match (register(lhs), parse_int(rhs), register(rhs), parse_int(lhs)) {
                    (Some(reg), Some(factor), _, _) | (_, _, Some(reg), Some(factor)) => (reg, factor),
                    _ => return Err(syntax(line, format!("bad scaled index `{term}`"))),
                };
                if index != Register::None {
                    return Err(syntax(line, "more than one index register"));
                }
                index = reg;
                scale = match factor {
                    1 | 2 | 4 | 8 => factor as u32,
                    _ => return Err(syntax(line, format!("bad scale `{factor}`"))),
                };
            } else if let Some(reg) = register(term) {
                if base == Register::None {
                    base = reg;
                } else if index == Register::None {
                    index = reg;
                } else {
                    return Err(syntax(line, "too many registers in memory operand"));
                }
            } else if let Some(value) = parse_int(term) {
                displacement = displacement.wrapping_add(value);
                has_displacement = true;
            } else {
                return Err(syntax(line, format!("bad memory term `{term}`")));
            }
        }

        if base == Register::RIP {
            if index != Register::None {
                return Err(syntax(line, "`rip` can't be combined with an index"));
            }
            // the absolute target is filled in once the instruction's length is known
            let operand = MemoryOperand::new(Register::RIP, Register::None, 1, 0, 8, false, segment);
            return Ok((operand, Some(displacement)));
        }

        let displ_size = if base == Register::None {
            self.bitness / 8
        } else if has_displacement {
            // iced widens this when the value doesn't fit a byte
            1
        } else {
            0
        };
        let operand =
            MemoryOperand::new(base, index, scale, displacement, displ_size, false, segment);
        Ok((operand, None))
    }

    /// Parses a single operand
    fn parse_operand(&self, line: usize, text: &str) -> Result<Operand, AssembleError> {
        let text = text.trim().to_ascii_lowercase();
        let (size, rest) = strip_size(&text);
        // branch hints carry no meaning for the block encoder
        let rest = ["short ", "near "]
            .iter()
            .find_map(|hint| rest.strip_prefix(hint))
            .unwrap_or(rest)
            .trim();

        if let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let (operand, rip_offset) = self.parse_memory(line, inner)?;
            return Ok(Operand::Mem(Memory {
                operand,
                size,
                rip_offset,
            }));
        }
        if size.is_some() {
            return Err(syntax(line, format!("size given for non-memory operand `{text}`")));
        }
        if let Some(register) = register(rest) {
            return Ok(Operand::Reg(register));
        }
        parse_int(rest)
            .map(Operand::Imm)
            .ok_or_else(|| syntax(line, format!("unknown operand `{rest}`")))
    }

    /// Picks the shortest form of `mnemonic` that encodes `operands` at `ip`
    fn select(
        &self,
        line: usize,
        name: &str,
        mnemonic: Mnemonic,
        prefixes: Prefixes,
        operands: &[Operand],
        ip: u64,
    ) -> Result<(Instruction, usize), AssembleError> {
        if operands.is_empty() {
            if let Some(form) = string_form(mnemonic) {
                let instruction = form(self.bitness, prefixes.rep)?;
                let len = self
                    .encoded_len(&instruction, ip)?
                    .ok_or_else(|| syntax(line, format!("`{name}` can't be encoded here")))?;
                return Ok((instruction, len));
            }
        }

        let memory = operands.iter().find_map(|operand| match *operand {
            Operand::Mem(memory) => Some(memory),
            _ => None,
        });
        let mut best: Option<(Instruction, usize)> = None;
        let mut memory_sizes = Vec::new();

        let forms = FORMS.get(&mnemonic).map(Vec::as_slice).unwrap_or_default();
        for &code in forms.iter().filter(|&&code| self.available(code)) {
            let mut instruction = match build(code, operands) {
                Some(instruction) => instruction,
                None => continue,
            };
            prefixes.apply(&mut instruction);

            let memory_size = instruction.memory_size().size();
            if let Some(Memory { size: Some(size), .. }) = memory {
                if memory_size != 0 && memory_size != size {
                    continue;
                }
            }

            let rip_offset = memory.and_then(|memory| memory.rip_offset);
            if rip_offset.is_some() {
                instruction.set_memory_displacement64(ip);
            }
            let len = match self.encoded_len(&instruction, ip)? {
                Some(len) => len,
                None => continue,
            };
            if let Some(offset) = rip_offset {
                let target = ip.wrapping_add(len as u64).wrapping_add(offset as u64);
                instruction.set_memory_displacement64(target);
            }

            if memory.is_some() && !memory_sizes.contains(&memory_size) {
                memory_sizes.push(memory_size);
            }
            if best.as_ref().map_or(true, |&(_, shortest)| len < shortest) {
                best = Some((instruction, len));
            }
        }

        if matches!(memory, Some(Memory { size: None, .. })) && memory_sizes.len() > 1 {
            return Err(syntax(line, "memory operand needs a size (byte, word, dword or qword)"));
        }
        best.ok_or_else(|| syntax(line, format!("invalid operands for `{name}`")))
    }

    /// Encodes one statement at `ip` into `out`, returning how many bytes it takes
    fn statement(
        &self,
        line: usize,
        statement: &str,
        ip: u64,
        out: &mut Vec<Instruction>,
    ) -> Result<usize, AssembleError> {
        let mut prefixes = Prefixes {
            lock: false,
            rep: RepPrefixKind::None,
        };
        let mut rest = statement;
        let name = loop {
            let (word, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let word = word.to_ascii_lowercase();
            rest = tail.trim_start();
            match word.as_str() {
                "lock" => prefixes.lock = true,
                "rep" | "repe" | "repz" => prefixes.rep = RepPrefixKind::Repe,
                "repne" | "repnz" => prefixes.rep = RepPrefixKind::Repne,
                _ => break word,
            }
        };

        let operands = rest
            .split(',')
            .map(str::trim)
            .filter(|op| !op.is_empty())
            .map(|op| self.parse_operand(line, op))
            .collect::<Result<Vec<_>, _>>()?;

        if name == "db" {
            let bytes = operands
                .iter()
                .map(|operand| match *operand {
                    Operand::Imm(value) if (-128..=255).contains(&value) => Ok(value as u8),
                    _ => Err(syntax(line, "`db` takes byte values")),
                })
                .collect::<Result<Vec<u8>, _>>()?;
            if bytes.is_empty() {
                return Err(syntax(line, "`db` needs at least one byte"));
            }
            for chunk in bytes.chunks(16) {
                out.push(Instruction::with_declare_byte(chunk)?);
            }
            return Ok(bytes.len());
        }

        let mnemonic = mnemonic(&name).ok_or_else(|| AssembleError::Unsupported {
            line,
            mnemonic: name.clone(),
        })?;
        let (instruction, len) = self.select(line, &name, mnemonic, prefixes, &operands, ip)?;
        out.push(instruction);
        Ok(len)
    }

    /// Parses every statement in `text`, laying them out from `ip`
    fn parse(&self, text: &str, ip: u64) -> Result<Vec<Instruction>, AssembleError> {
        let mut instructions = Vec::new();
        let mut ip = ip;

        for (index, raw) in text.lines().enumerate() {
            let statement = raw
                .split(|c| c == ';' || c == '#')
                .next()
                .unwrap_or_default()
                .trim();
            if statement.is_empty() {
                continue;
            }

            let len = self.statement(index + 1, statement, ip, &mut instructions)?;
            ip = ip.wrapping_add(len as u64);
        }

        Ok(instructions)
    }
}

impl Assembler for IcedAssembler {
    fn assemble(&self, text: &str, ip: u64) -> Result<Vec<u8>, AssembleError> {
        let instructions = self.parse(text, ip)?;
        if instructions.is_empty() {
            return Ok(Vec::new());
        }

        let block = InstructionBlock::new(&instructions, ip);
        let result = BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE)?;
        Ok(result.code_buffer)
    }
}
