//! Line based x86 assembler front end.
//!
//! Accepts a small Intel-syntax subset, one instruction per line, and lowers
//! it onto `iced_x86`'s code assembler. Enough to write the kind of short
//! leaf functions the engine runs; there are no labels or jumps.

use iced_x86::{
    code_asm::{self as x86, AsmMemoryOperand, AsmRegister32, AsmRegister64, AsmRegister8, CodeAssembler},
    Encoder, IcedError,
};
use tracing::debug;

use crate::{CodeBuffer, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Bitness::X64
        } else {
            Bitness::X86
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Bitness::X86 => 32,
            Bitness::X64 => 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assembler {
    bitness: Bitness,
    lines: Vec<String>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(Bitness::host())
    }
}

impl Assembler {
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            lines: Vec::new(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn add_line(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    /// Adds a line whose `{N}` placeholders are replaced by `args[N]`.
    /// `{{` and `}}` stand for literal braces.
    pub fn add_line_with(&mut self, template: &str, args: &[i64]) -> Result<&mut Self> {
        let line = format_line(template, args).map_err(|message| Error::Assembly {
            line: self.lines.len() + 1,
            text: template.to_string(),
            message,
        })?;
        Ok(self.add_line(line))
    }

    pub fn assemble(&self) -> Result<CodeBuffer> {
        let mut bitness = self.bitness;
        let mut parsed = Vec::new();

        for (i, text) in self.lines.iter().enumerate() {
            let line = i + 1;
            let fail = |message: String| Error::Assembly {
                line,
                text: text.clone(),
                message,
            };

            let source = text.split(';').next().unwrap_or_default().trim();
            if source.is_empty() {
                continue;
            }
            let mode = match source.to_ascii_lowercase().as_str() {
                "use32" => Some(Bitness::X86),
                "use64" => Some(Bitness::X64),
                _ => None,
            };
            match mode {
                Some(_) if !parsed.is_empty() => {
                    return Err(fail("mode can only change before the first instruction".into()))
                }
                Some(mode) => bitness = mode,
                None => parsed.push((i, parse_line(source).map_err(fail)?)),
            }
        }

        let Some(&(last, _)) = parsed.last() else {
            return Ok(CodeBuffer::from(Vec::<u8>::new()));
        };
        let fail = |i: usize, err: IcedError| Error::Assembly {
            line: i + 1,
            text: self.lines[i].clone(),
            message: err.to_string(),
        };

        let mut asm = CodeAssembler::new(bitness.bits()).map_err(|err| fail(0, err))?;
        let mut encoder = Encoder::new(bitness.bits());
        for (i, (mnemonic, operands)) in &parsed {
            let start = asm.instructions().len();
            emit(&mut asm, mnemonic, operands).map_err(|message| Error::Assembly {
                line: i + 1,
                text: self.lines[*i].clone(),
                message,
            })?;
            // Catches operands the mode cannot encode while the line is still known.
            for instruction in &asm.instructions()[start..] {
                encoder.encode(instruction, 0).map_err(|err| fail(*i, err))?;
            }
        }

        let bytes = asm.assemble(0).map_err(|err| fail(last, err))?;
        debug!(lines = self.lines.len(), len = bytes.len(), bits = bitness.bits(), "assembled code");
        Ok(bytes.into())
    }
}

fn format_line(template: &str, args: &[i64]) -> std::result::Result<String, String> {
    let mut line = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                line.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                line.push('}');
            }
            '{' => {
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => index.push(c),
                        None => return Err("unterminated placeholder".into()),
                    }
                }
                let n: usize = index
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid placeholder `{{{index}}}`"))?;
                let arg = args
                    .get(n)
                    .ok_or_else(|| format!("placeholder {{{n}}} has no argument ({} given)", args.len()))?;
                line.push_str(&arg.to_string());
            }
            '}' => return Err("unmatched `}`".into()),
            c => line.push(c),
        }
    }
    Ok(line)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Size {
    Byte,
    Word,
    Dword,
    Qword,
}

#[derive(Clone, Copy)]
struct Memory {
    size: Option<Size>,
    operand: AsmMemoryOperand,
}

impl Memory {
    /// Applies the explicit size, or `implied` when the line gave none.
    fn sized(self, implied: Option<Size>) -> std::result::Result<AsmMemoryOperand, String> {
        let size = match (self.size, implied) {
            (Some(size), Some(implied)) if size != implied => {
                return Err("operand sizes do not match".into())
            }
            (Some(size), _) | (None, Some(size)) => size,
            (None, None) => return Err("operand size not specified".into()),
        };
        Ok(match size {
            Size::Byte => x86::byte_ptr(self.operand),
            Size::Word => x86::word_ptr(self.operand),
            Size::Dword => x86::dword_ptr(self.operand),
            Size::Qword => x86::qword_ptr(self.operand),
        })
    }
}

#[derive(Clone, Copy)]
enum Operand {
    R8(AsmRegister8),
    R32(AsmRegister32),
    R64(AsmRegister64),
    Imm(i64),
    Mem(Memory),
}

#[derive(Clone, Copy)]
enum AddressRegister {
    R32(AsmRegister32),
    R64(AsmRegister64),
}

impl AddressRegister {
    fn r32(self) -> Option<AsmRegister32> {
        match self {
            AddressRegister::R32(reg) => Some(reg),
            AddressRegister::R64(_) => None,
        }
    }

    fn r64(self) -> Option<AsmRegister64> {
        match self {
            AddressRegister::R64(reg) => Some(reg),
            AddressRegister::R32(_) => None,
        }
    }
}

fn parse_line(source: &str) -> std::result::Result<(String, Vec<Operand>), String> {
    let (mnemonic, rest) = match source.split_once(char::is_whitespace) {
        Some((mnemonic, rest)) => (mnemonic, rest.trim()),
        None => (source, ""),
    };
    let operands = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',')
            .map(|operand| parse_operand(operand.trim()))
            .collect::<std::result::Result<_, _>>()?
    };
    Ok((mnemonic.to_ascii_lowercase(), operands))
}

fn parse_operand(text: &str) -> std::result::Result<Operand, String> {
    let lower = text.to_ascii_lowercase();
    let mut words = lower.split_whitespace().peekable();
    let size = match words.peek().copied() {
        Some("byte") => Some(Size::Byte),
        Some("word") => Some(Size::Word),
        Some("dword") => Some(Size::Dword),
        Some("qword") => Some(Size::Qword),
        _ => None,
    };
    if size.is_some() {
        words.next();
        if words.peek().copied() == Some("ptr") {
            words.next();
        }
    }
    let rest = words.collect::<Vec<_>>().join(" ");

    if let Some(inner) = rest.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let operand = parse_address(inner)?;
        return Ok(Operand::Mem(Memory { size, operand }));
    }
    if size.is_some() {
        return Err(format!("expected a memory operand after the size in `{text}`"));
    }
    if let Some(register) = register(&rest) {
        return Ok(register);
    }
    parse_int(&rest)
        .map(Operand::Imm)
        .ok_or_else(|| format!("unknown operand `{text}`"))
}

fn parse_address(inner: &str) -> std::result::Result<AsmMemoryOperand, String> {
    let compact = inner.replace(char::is_whitespace, "");
    let mut base = None;
    let mut index = None;
    let mut disp: i64 = 0;

    let mut terms = Vec::new();
    let mut start = 0;
    for (i, c) in compact.char_indices() {
        if (c == '+' || c == '-') && i > 0 {
            terms.push(&compact[start..i]);
            start = i;
        }
    }
    terms.push(&compact[start..]);

    for term in terms {
        let (negative, term) = match term.strip_prefix('-') {
            Some(term) => (true, term),
            None => (false, term.strip_prefix('+').unwrap_or(term)),
        };
        if let Some((left, right)) = term.split_once('*') {
            let (reg, scale) = match (address_register(left), address_register(right)) {
                (Some(reg), None) => (reg, right),
                (None, Some(reg)) => (reg, left),
                _ => return Err(format!("invalid scaled index `{term}`")),
            };
            let scale = match parse_int(scale) {
                Some(scale @ (1 | 2 | 4 | 8)) => scale as u32,
                _ => return Err(format!("scale must be 1, 2, 4 or 8 in `{term}`")),
            };
            if negative || index.replace((reg, scale)).is_some() {
                return Err(format!("invalid index in `[{inner}]`"));
            }
        } else if let Some(reg) = address_register(term) {
            if negative {
                return Err(format!("registers cannot be subtracted in `[{inner}]`"));
            }
            if base.is_none() {
                base = Some(reg);
            } else if index.is_none() {
                index = Some((reg, 1));
            } else {
                return Err(format!("too many registers in `[{inner}]`"));
            }
        } else {
            let value = parse_int(term).ok_or_else(|| format!("unknown term `{term}` in `[{inner}]`"))?;
            disp = if negative {
                disp.checked_sub(value)
            } else {
                disp.checked_add(value)
            }
            .ok_or_else(|| format!("displacement overflows in `[{inner}]`"))?;
        }
    }

    let disp = i32::try_from(disp).map_err(|_| format!("displacement out of range in `[{inner}]`"))?;
    let registers = || base.into_iter().chain(index.map(|(reg, _)| reg));
    let operand = if registers().all(|reg| matches!(reg, AddressRegister::R64(_))) {
        address64(
            base.and_then(AddressRegister::r64),
            index.and_then(|(reg, scale)| Some((reg.r64()?, scale))),
            disp,
        )
    } else if registers().all(|reg| matches!(reg, AddressRegister::R32(_))) {
        address32(
            base.and_then(AddressRegister::r32),
            index.and_then(|(reg, scale)| Some((reg.r32()?, scale))),
            disp,
        )
    } else {
        return Err(format!("mixed address sizes in `[{inner}]`"));
    };
    operand.ok_or_else(|| "absolute addresses are not supported".into())
}

macro_rules! address {
    ($name:ident, $reg:ty) => {
        fn $name(base: Option<$reg>, index: Option<($reg, u32)>, disp: i32) -> Option<AsmMemoryOperand> {
            Some(match (base, index) {
                (Some(base), Some((index, scale))) => base + index * scale + disp,
                (Some(base), None) => base + disp,
                (None, Some((index, scale))) => index * scale + disp,
                (None, None) => return None,
            })
        }
    };
}

address!(address32, AsmRegister32);
address!(address64, AsmRegister64);

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x") {
        // from_str_radix would take a sign after the prefix.
        Some(hex) if hex.starts_with(|c: char| c.is_ascii_hexdigit()) => {
            i64::from_str_radix(hex, 16).ok()?
        }
        None if digits.starts_with(|c: char| c.is_ascii_digit()) => digits.parse().ok()?,
        _ => return None,
    };
    Some(if negative { -value } else { value })
}

fn address_register(name: &str) -> Option<AddressRegister> {
    match register(name)? {
        Operand::R32(reg) => Some(AddressRegister::R32(reg)),
        Operand::R64(reg) => Some(AddressRegister::R64(reg)),
        _ => None,
    }
}

fn register(name: &str) -> Option<Operand> {
    Some(match name {
        "al" => Operand::R8(x86::al),
        "cl" => Operand::R8(x86::cl),
        "dl" => Operand::R8(x86::dl),
        "bl" => Operand::R8(x86::bl),
        "eax" => Operand::R32(x86::eax),
        "ecx" => Operand::R32(x86::ecx),
        "edx" => Operand::R32(x86::edx),
        "ebx" => Operand::R32(x86::ebx),
        "esp" => Operand::R32(x86::esp),
        "ebp" => Operand::R32(x86::ebp),
        "esi" => Operand::R32(x86::esi),
        "edi" => Operand::R32(x86::edi),
        "r8d" => Operand::R32(x86::r8d),
        "r9d" => Operand::R32(x86::r9d),
        "r10d" => Operand::R32(x86::r10d),
        "r11d" => Operand::R32(x86::r11d),
        "rax" => Operand::R64(x86::rax),
        "rcx" => Operand::R64(x86::rcx),
        "rdx" => Operand::R64(x86::rdx),
        "rbx" => Operand::R64(x86::rbx),
        "rsp" => Operand::R64(x86::rsp),
        "rbp" => Operand::R64(x86::rbp),
        "rsi" => Operand::R64(x86::rsi),
        "rdi" => Operand::R64(x86::rdi),
        "r8" => Operand::R64(x86::r8),
        "r9" => Operand::R64(x86::r9),
        "r10" => Operand::R64(x86::r10),
        "r11" => Operand::R64(x86::r11),
        _ => return None,
    })
}

/// Immediate that fits an imm32 field. `unsigned` also admits values up to
/// `u32::MAX`, which only makes sense when the destination is 32 bits wide.
fn imm32(value: i64, unsigned: bool) -> std::result::Result<i32, String> {
    match i32::try_from(value) {
        Ok(value) => Ok(value),
        Err(_) if unsigned && u32::try_from(value).is_ok() => Ok(value as u32 as i32),
        Err(_) => Err(format!("immediate {value} does not fit in 32 bits")),
    }
}

macro_rules! alu {
    ($asm:expr, $op:ident, $dst:expr, $src:expr) => {
        match ($dst, $src) {
            (Operand::R8(dst), Operand::R8(src)) => $asm.$op(dst, src),
            (Operand::R32(dst), Operand::R32(src)) => $asm.$op(dst, src),
            (Operand::R64(dst), Operand::R64(src)) => $asm.$op(dst, src),
            (Operand::R8(dst), Operand::Mem(src)) => $asm.$op(dst, src.sized(Some(Size::Byte))?),
            (Operand::R32(dst), Operand::Mem(src)) => $asm.$op(dst, src.sized(Some(Size::Dword))?),
            (Operand::R64(dst), Operand::Mem(src)) => $asm.$op(dst, src.sized(Some(Size::Qword))?),
            (Operand::Mem(dst), Operand::R8(src)) => $asm.$op(dst.sized(Some(Size::Byte))?, src),
            (Operand::Mem(dst), Operand::R32(src)) => $asm.$op(dst.sized(Some(Size::Dword))?, src),
            (Operand::Mem(dst), Operand::R64(src)) => $asm.$op(dst.sized(Some(Size::Qword))?, src),
            (Operand::R8(dst), Operand::Imm(src)) => $asm.$op(dst, imm32(src, true)?),
            (Operand::R32(dst), Operand::Imm(src)) => $asm.$op(dst, imm32(src, true)?),
            (Operand::R64(dst), Operand::Imm(src)) => $asm.$op(dst, imm32(src, false)?),
            (Operand::Mem(dst), Operand::Imm(src)) => $asm.$op(dst.sized(None)?, imm32(src, false)?),
            _ => return Err(unsupported(stringify!($op))),
        }
    };
}

macro_rules! unary {
    ($asm:expr, $op:ident, $operand:expr) => {
        match $operand {
            Operand::R8(reg) => $asm.$op(reg),
            Operand::R32(reg) => $asm.$op(reg),
            Operand::R64(reg) => $asm.$op(reg),
            Operand::Mem(mem) => $asm.$op(mem.sized(None)?),
            Operand::Imm(_) => return Err(unsupported(stringify!($op))),
        }
    };
}

fn unsupported(mnemonic: &str) -> String {
    format!("unsupported operands for `{mnemonic}`")
}

fn emit(asm: &mut CodeAssembler, mnemonic: &str, operands: &[Operand]) -> std::result::Result<(), String> {
    let native = if asm.bitness() == 64 { Size::Qword } else { Size::Dword };
    let result: std::result::Result<(), IcedError> = match (mnemonic, operands) {
        ("nop", []) => asm.nop(),
        ("ret", []) => asm.ret(),
        ("ret", [Operand::Imm(n)]) => asm.ret_1(imm32(*n, false)?),
        ("leave", []) => asm.leave(),
        ("mov", [dst, src]) => match (*dst, *src) {
            (Operand::R8(dst), Operand::Imm(src)) => asm.mov(dst, imm32(src, true)?),
            (Operand::R32(dst), Operand::Imm(src)) => asm.mov(dst, imm32(src, true)?),
            (Operand::R64(dst), Operand::Imm(src)) => asm.mov(dst, src),
            (Operand::R8(dst), Operand::R8(src)) => asm.mov(dst, src),
            (Operand::R32(dst), Operand::R32(src)) => asm.mov(dst, src),
            (Operand::R64(dst), Operand::R64(src)) => asm.mov(dst, src),
            (Operand::R8(dst), Operand::Mem(src)) => asm.mov(dst, src.sized(Some(Size::Byte))?),
            (Operand::R32(dst), Operand::Mem(src)) => asm.mov(dst, src.sized(Some(Size::Dword))?),
            (Operand::R64(dst), Operand::Mem(src)) => asm.mov(dst, src.sized(Some(Size::Qword))?),
            (Operand::Mem(dst), Operand::R8(src)) => asm.mov(dst.sized(Some(Size::Byte))?, src),
            (Operand::Mem(dst), Operand::R32(src)) => asm.mov(dst.sized(Some(Size::Dword))?, src),
            (Operand::Mem(dst), Operand::R64(src)) => asm.mov(dst.sized(Some(Size::Qword))?, src),
            (Operand::Mem(dst), Operand::Imm(src)) => asm.mov(dst.sized(None)?, imm32(src, false)?),
            _ => return Err(unsupported(mnemonic)),
        },
        ("movzx", [dst, src]) => match (*dst, *src) {
            (Operand::R32(dst), Operand::R8(src)) => asm.movzx(dst, src),
            (Operand::R64(dst), Operand::R8(src)) => asm.movzx(dst, src),
            (Operand::R32(dst), Operand::Mem(src)) => asm.movzx(dst, src.sized(Some(Size::Byte))?),
            (Operand::R64(dst), Operand::Mem(src)) => asm.movzx(dst, src.sized(Some(Size::Byte))?),
            _ => return Err(unsupported(mnemonic)),
        },
        ("lea", [dst, Operand::Mem(src)]) => match *dst {
            Operand::R32(dst) => asm.lea(dst, src.operand),
            Operand::R64(dst) => asm.lea(dst, src.operand),
            _ => return Err(unsupported(mnemonic)),
        },
        ("add", [dst, src]) => alu!(asm, add, *dst, *src),
        ("sub", [dst, src]) => alu!(asm, sub, *dst, *src),
        ("and", [dst, src]) => alu!(asm, and, *dst, *src),
        ("or", [dst, src]) => alu!(asm, or, *dst, *src),
        ("xor", [dst, src]) => alu!(asm, xor, *dst, *src),
        ("cmp", [dst, src]) => alu!(asm, cmp, *dst, *src),
        ("test", [dst, src]) => match (*dst, *src) {
            (Operand::R32(dst), Operand::R32(src)) => asm.test(dst, src),
            (Operand::R64(dst), Operand::R64(src)) => asm.test(dst, src),
            (Operand::R8(dst), Operand::R8(src)) => asm.test(dst, src),
            (Operand::R32(dst), Operand::Imm(src)) => asm.test(dst, imm32(src, true)?),
            (Operand::R64(dst), Operand::Imm(src)) => asm.test(dst, imm32(src, false)?),
            _ => return Err(unsupported(mnemonic)),
        },
        ("imul", [dst, src]) => match (*dst, *src) {
            (Operand::R32(dst), Operand::R32(src)) => asm.imul_2(dst, src),
            (Operand::R64(dst), Operand::R64(src)) => asm.imul_2(dst, src),
            (Operand::R32(dst), Operand::Mem(src)) => asm.imul_2(dst, src.sized(Some(Size::Dword))?),
            (Operand::R64(dst), Operand::Mem(src)) => asm.imul_2(dst, src.sized(Some(Size::Qword))?),
            _ => return Err(unsupported(mnemonic)),
        },
        ("imul", [dst, src, Operand::Imm(factor)]) => match (*dst, *src) {
            (Operand::R32(dst), Operand::R32(src)) => asm.imul_3(dst, src, imm32(*factor, false)?),
            (Operand::R64(dst), Operand::R64(src)) => asm.imul_3(dst, src, imm32(*factor, false)?),
            _ => return Err(unsupported(mnemonic)),
        },
        ("neg", [operand]) => unary!(asm, neg, *operand),
        ("not", [operand]) => unary!(asm, not, *operand),
        ("inc", [operand]) => unary!(asm, inc, *operand),
        ("dec", [operand]) => unary!(asm, dec, *operand),
        ("push", [operand]) => match *operand {
            Operand::R32(reg) => asm.push(reg),
            Operand::R64(reg) => asm.push(reg),
            Operand::Imm(value) => asm.push(imm32(value, false)?),
            Operand::Mem(mem) => asm.push(mem.sized(Some(native))?),
            Operand::R8(_) => return Err(unsupported(mnemonic)),
        },
        ("pop", [operand]) => match *operand {
            Operand::R32(reg) => asm.pop(reg),
            Operand::R64(reg) => asm.pop(reg),
            Operand::Mem(mem) => asm.pop(mem.sized(Some(native))?),
            _ => return Err(unsupported(mnemonic)),
        },
        (
            "nop" | "ret" | "leave" | "mov" | "movzx" | "lea" | "add" | "sub" | "and" | "or" | "xor" | "cmp"
            | "test" | "imul" | "neg" | "not" | "inc" | "dec" | "push" | "pop",
            _,
        ) => return Err(format!("wrong number of operands for `{mnemonic}`")),
        _ => return Err(format!("unknown instruction `{mnemonic}`")),
    };
    result.map_err(|err| err.to_string())
}

#[test]
fn test_format_line() {
    assert_eq!(format_line("mov eax, {0}", &[1]).unwrap(), "mov eax, 1");
    assert_eq!(format_line("mov eax, [ebp+{1}] ; {0}", &[3, 8]).unwrap(), "mov eax, [ebp+8] ; 3");
    assert_eq!(format_line("{{0}}", &[]).unwrap(), "{0}");
    assert!(format_line("mov eax, {1}", &[1]).is_err());
    assert!(format_line("mov eax, {x}", &[1]).is_err());
}

#[test]
fn test_assemble_return_constant() {
    for bitness in [Bitness::X86, Bitness::X64] {
        let mut asm = Assembler::new(bitness);
        asm.add_line_with("mov eax, {0}", &[1]).unwrap().add_line("ret");
        let code = asm.assemble().unwrap();
        assert_eq!(code, crate::samples::return_constant(1));
    }
}

#[test]
fn test_assemble_cdecl_add() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("use32")
        .add_line("push ebp")
        .add_line("mov ebp, esp")
        .add_line("mov eax, [ebp+8]   ; second argument")
        .add_line("mov edx, dword [ebp + 12]")
        .add_line("add eax, edx")
        .add_line("pop ebp")
        .add_line("ret");
    assert_eq!(asm.assemble().unwrap().as_bytes(), &crate::samples::CDECL_ADD_X86);
}

#[test]
fn test_assemble_moves() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("mov rcx, [rdi+8]")
        .add_line("mov [rax], ecx")
        .add_line("mov dword ptr [rax], 5")
        .add_line("mov rax, 0x123456789");
    assert_eq!(
        asm.assemble().unwrap().as_bytes(),
        &[
            0x48, 0x8b, 0x4f, 0x08, // mov rcx, [rdi+8]
            0x89, 0x08, // mov [rax], ecx
            0xc7, 0x00, 0x05, 0x00, 0x00, 0x00, // mov dword [rax], 5
            0x48, 0xb8, 0x89, 0x67, 0x45, 0x23, 0x01, 0x00, 0x00, 0x00, // mov rax, 0x123456789
        ]
    );
}

#[test]
fn test_parse_int() {
    assert_eq!(parse_int("12"), Some(12));
    assert_eq!(parse_int("-0x10"), Some(-16));
    assert_eq!(parse_int("0xff"), Some(255));
    for text in ["0x-5", "0x+5", "0x", "+5", "--5", "x5"] {
        assert_eq!(parse_int(text), None, "{text}");
    }
}

#[test]
fn test_assemble_is_deterministic() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("lea rax, [rdi + rsi*2 - 16]")
        .add_line("imul rax, rax, 3")
        .add_line("xor ecx, ecx")
        .add_line("ret");
    assert_eq!(asm.assemble().unwrap(), asm.assemble().unwrap());
    assert_eq!(asm.clone().assemble().unwrap(), asm.assemble().unwrap());
}

#[test]
fn test_unknown_instruction_reports_line() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("mov eax, 1").add_line("").add_line("frobnicate eax");
    match asm.assemble().unwrap_err() {
        Error::Assembly { line, text, message } => {
            assert_eq!(line, 3);
            assert_eq!(text, "frobnicate eax");
            assert!(message.contains("unknown instruction"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_64_bit_register_in_32_bit_mode_fails() {
    let mut asm = Assembler::new(Bitness::X86);
    asm.add_line("push rbp");
    assert!(matches!(asm.assemble(), Err(Error::Assembly { line: 1, .. })));
}

#[test]
fn test_mode_change_after_instruction_fails() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("nop").add_line("use32");
    assert!(matches!(asm.assemble(), Err(Error::Assembly { line: 2, .. })));
}

#[test]
fn test_operand_errors() {
    for line in ["mov eax", "mov eax, [foo]", "inc [rax]", "mov rax, [rax*3]", "add rax, 0x100000000", "mov eax, [12]"] {
        let mut asm = Assembler::new(Bitness::X64);
        asm.add_line(line);
        assert!(
            matches!(asm.assemble(), Err(Error::Assembly { line: 1, .. })),
            "{line} should not assemble"
        );
    }
}

#[test]
fn test_missing_placeholder_argument() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("nop");
    let err = asm.add_line_with("mov eax, {2}", &[1, 2]).unwrap_err();
    assert!(matches!(err, Error::Assembly { line: 2, .. }));
    assert_eq!(asm.lines().len(), 1);
}

#[test]
fn test_empty_source_assembles_to_nothing() {
    let mut asm = Assembler::new(Bitness::X64);
    asm.add_line("; nothing here");
    assert!(asm.assemble().unwrap().is_empty());
}
