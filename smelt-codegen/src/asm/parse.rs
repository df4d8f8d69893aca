//! Parsing of the textual assembly surface.
//!
//! The assembler consumes machine-generated text (plus whatever the
//! programmer wrote inline), one item per line: segment headers, `global` /
//! `extern` directives, labels, data directives and instructions. Operands
//! reduce to at most one register pair, one summed displacement and one
//! identifier; the encoder works from that normal form.

use crate::asm::AsmError;
use smallvec::SmallVec;

/// An 8086 register the assembler knows.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reg {
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
}

impl Reg {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "al" => Self::Al,
            "cl" => Self::Cl,
            "dl" => Self::Dl,
            "bl" => Self::Bl,
            "ah" => Self::Ah,
            "ch" => Self::Ch,
            "dh" => Self::Dh,
            "bh" => Self::Bh,
            "ax" => Self::Ax,
            "cx" => Self::Cx,
            "dx" => Self::Dx,
            "bx" => Self::Bx,
            "sp" => Self::Sp,
            "bp" => Self::Bp,
            "si" => Self::Si,
            "di" => Self::Di,
            _ => return None,
        })
    }

    /// The 3-bit register number used in ModR/M and short-form opcodes.
    pub fn encoding(self) -> u8 {
        match self {
            Self::Al | Self::Ax => 0,
            Self::Cl | Self::Cx => 1,
            Self::Dl | Self::Dx => 2,
            Self::Bl | Self::Bx => 3,
            Self::Ah | Self::Sp => 4,
            Self::Ch | Self::Bp => 5,
            Self::Dh | Self::Si => 6,
            Self::Bh | Self::Di => 7,
        }
    }

    /// Is this one of the 16-bit registers?
    pub fn is_word(self) -> bool {
        matches!(
            self,
            Self::Ax | Self::Cx | Self::Dx | Self::Bx | Self::Sp | Self::Bp | Self::Si | Self::Di
        )
    }

    /// May this register appear inside a memory operand?
    fn is_addressable(self) -> bool {
        matches!(self, Self::Bx | Self::Bp | Self::Si | Self::Di)
    }
}

/// Operand width hint (`byte`/`word` prefixes).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Width {
    Byte,
    Word,
}

/// An instruction mnemonic the assembler accepts.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mnemonic {
    Mov,
    Push,
    Pop,
    Add,
    Sub,
    Mul,
    Imul,
    Div,
    Idiv,
    Xor,
    And,
    Or,
    Cmp,
    Test,
    Xchg,
    Int,
    Lea,
    Call,
    Ret,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jb,
    Jbe,
    Ja,
    Jae,
    Loop,
    Shl,
    Rcl,
    Rcr,
    Inc,
    Dec,
    Lodsb,
    Stosb,
}

impl Mnemonic {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "mov" => Self::Mov,
            "push" => Self::Push,
            "pop" => Self::Pop,
            "add" => Self::Add,
            "sub" => Self::Sub,
            "mul" => Self::Mul,
            "imul" => Self::Imul,
            "div" => Self::Div,
            "idiv" => Self::Idiv,
            "xor" => Self::Xor,
            "and" => Self::And,
            "or" => Self::Or,
            "cmp" => Self::Cmp,
            "test" => Self::Test,
            "xchg" => Self::Xchg,
            "int" => Self::Int,
            "lea" => Self::Lea,
            "call" => Self::Call,
            "ret" => Self::Ret,
            "jmp" => Self::Jmp,
            "je" => Self::Je,
            "jne" => Self::Jne,
            "jl" => Self::Jl,
            "jle" => Self::Jle,
            "jg" => Self::Jg,
            "jge" => Self::Jge,
            "jb" => Self::Jb,
            "jbe" => Self::Jbe,
            "ja" => Self::Ja,
            "jae" => Self::Jae,
            "loop" => Self::Loop,
            "shl" => Self::Shl,
            "rcl" => Self::Rcl,
            "rcr" => Self::Rcr,
            "inc" => Self::Inc,
            "dec" => Self::Dec,
            "lodsb" => Self::Lodsb,
            "stosb" => Self::Stosb,
            _ => return None,
        })
    }
}

/// An operand reduced to normal form: an optional base/index register pair,
/// one summed displacement, and at most one identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Operand {
    /// `byte`/`word` prefix, used where the form leaves the width ambiguous.
    pub size_hint: Option<Width>,
    /// Was the operand written as a memory access (`[...]`)?
    pub memory: bool,
    /// The base register (`bx`/`bp`), or the register itself for a register
    /// operand, or a lone `si`/`di`.
    pub base: Option<Reg>,
    /// The index register (`si`/`di`) of a two-register memory operand.
    pub index: Option<Reg>,
    /// Sum of the numeric terms.
    pub disp: i32,
    /// The referenced label, if any.
    pub ident: Option<String>,
}

impl Operand {
    /// A plain register operand.
    pub fn is_register(&self) -> bool {
        !self.memory && self.base.is_some()
    }

    /// An immediate (number, label or both) with no register and no memory
    /// access.
    pub fn is_immediate(&self) -> bool {
        !self.memory && self.base.is_none() && self.index.is_none()
    }

    /// Any memory access.
    pub fn is_memory(&self) -> bool {
        self.memory
    }

    /// A direct-address memory access with no registers involved.
    pub fn is_direct_memory(&self) -> bool {
        self.memory && self.base.is_none() && self.index.is_none()
    }

    /// The register of a register operand.
    pub fn reg(&self) -> Option<Reg> {
        if self.is_register() {
            self.base
        } else {
            None
        }
    }
}

/// One `db` element: a byte value or a quoted string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbItem {
    Byte(u8),
    Text(String),
}

/// A parsed instruction with its source line.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub ops: SmallVec<[Operand; 2]>,
    pub line: u32,
}

/// One parsed line.
#[derive(Clone, Debug)]
pub enum Item {
    /// `name:`
    Label(String),
    /// `global name`
    Global(String),
    /// `extern name`
    Extern(String),
    /// `db v [, v]*`
    Db(Vec<DbItem>),
    /// `dw v [, v]*` where each element is an immediate operand.
    Dw(Vec<Operand>),
    /// `rb count`
    Rb(u32),
    /// An instruction.
    Ins(Instruction),
}

/// The contents of one `segment` block.
#[derive(Debug)]
pub struct SegmentBlock {
    pub name: String,
    pub line: u32,
    pub items: Vec<(Item, u32)>,
}

/// Parse assembly text into segment blocks.
pub fn parse_source(source: &str) -> Result<Vec<SegmentBlock>, AsmError> {
    let mut blocks: Vec<SegmentBlock> = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx as u32 + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix("segment ") {
            let name = name.trim();
            if blocks.iter().any(|b| b.name == name) {
                return Err(AsmError::new(
                    line_no,
                    format!("segment \"{name}\" is defined twice"),
                ));
            }
            blocks.push(SegmentBlock {
                name: name.to_string(),
                line: line_no,
                items: Vec::new(),
            });
            continue;
        }

        let item = parse_item(line, line_no)?;
        match blocks.last_mut() {
            Some(block) => block.items.push((item, line_no)),
            None => {
                return Err(AsmError::new(
                    line_no,
                    "an item appears before the first segment",
                ))
            }
        }
    }
    Ok(blocks)
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if in_quote => escaped = !escaped,
            '\'' if !escaped => in_quote = !in_quote,
            ';' if !in_quote => return &line[..i],
            _ => escaped = false,
        }
    }
    line
}

fn parse_item(line: &str, line_no: u32) -> Result<Item, AsmError> {
    // A label is a lone identifier with a trailing colon.
    if let Some(name) = line.strip_suffix(':') {
        if is_identifier(name) {
            return Ok(Item::Label(name.to_string()));
        }
    }

    let (head, rest) = match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim()),
        None => (line, ""),
    };

    match head {
        "global" => return Ok(Item::Global(expect_identifier(rest, line_no)?)),
        "extern" => return Ok(Item::Extern(expect_identifier(rest, line_no)?)),
        "db" => return parse_db(rest, line_no),
        "dw" => return parse_dw(rest, line_no),
        "rb" => {
            let count = parse_number(rest).ok_or_else(|| {
                AsmError::new(line_no, format!("\"{rest}\" is not a valid reservation size"))
            })?;
            return Ok(Item::Rb(count as u32));
        }
        _ => {}
    }

    let Some(mnemonic) = Mnemonic::from_name(head) else {
        return Err(AsmError::new(
            line_no,
            format!("\"{head}\" is not a recognised instruction"),
        ));
    };

    let mut ops: SmallVec<[Operand; 2]> = SmallVec::new();
    if !rest.is_empty() {
        for part in rest.split(',') {
            if ops.len() == 2 {
                return Err(AsmError::new(line_no, "too many operands"));
            }
            ops.push(parse_operand(part.trim(), line_no)?);
        }
    }
    Ok(Item::Ins(Instruction {
        mnemonic,
        ops,
        line: line_no,
    }))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn expect_identifier(s: &str, line_no: u32) -> Result<String, AsmError> {
    if is_identifier(s) {
        Ok(s.to_string())
    } else {
        Err(AsmError::new(
            line_no,
            format!("\"{s}\" is not a valid symbol name"),
        ))
    }
}

fn parse_number(s: &str) -> Option<i32> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = if let Some(hex) = body.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        body.parse::<i64>().ok()?
    };
    let value = if neg { -value } else { value };
    i32::try_from(value).ok()
}

fn parse_db(rest: &str, line_no: u32) -> Result<Item, AsmError> {
    let mut items = Vec::new();
    for part in split_data_elements(rest) {
        let part = part.trim();
        if let Some(text) = parse_quoted(part) {
            items.push(DbItem::Text(text));
        } else if let Some(v) = parse_number(part) {
            items.push(DbItem::Byte(v as u8));
        } else {
            return Err(AsmError::new(
                line_no,
                format!("\"{part}\" is not a valid byte value"),
            ));
        }
    }
    Ok(Item::Db(items))
}

fn parse_dw(rest: &str, line_no: u32) -> Result<Item, AsmError> {
    let mut items = Vec::new();
    for part in rest.split(',') {
        let op = parse_operand(part.trim(), line_no)?;
        if !op.is_immediate() {
            return Err(AsmError::new(
                line_no,
                "dw elements must be numbers or labels",
            ));
        }
        items.push(op);
    }
    Ok(Item::Dw(items))
}

/// Split `db` elements on commas that sit outside quoted strings.
fn split_data_elements(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if in_quote => escaped = !escaped,
            '\'' if !escaped => in_quote = !in_quote,
            ',' if !in_quote => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_quoted(s: &str) -> Option<String> {
    let body = s.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(body.len());
    let mut escaped = false;
    for c in body.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Parse one operand into normal form.
pub fn parse_operand(text: &str, line_no: u32) -> Result<Operand, AsmError> {
    let mut op = Operand::default();
    let mut rest = text;

    if let Some(r) = rest.strip_prefix("byte ") {
        op.size_hint = Some(Width::Byte);
        rest = r.trim();
    } else if let Some(r) = rest.strip_prefix("word ") {
        op.size_hint = Some(Width::Word);
        rest = r.trim();
    }

    let inner = if let Some(r) = rest.strip_prefix('[') {
        op.memory = true;
        r.strip_suffix(']').ok_or_else(|| {
            AsmError::new(line_no, format!("\"{text}\" is missing a closing bracket"))
        })?
    } else {
        rest
    };

    let mut regs: SmallVec<[Reg; 2]> = SmallVec::new();
    let mut sign = 1i32;
    for token in tokenize_expr(inner) {
        match token {
            "+" => sign = 1,
            "-" => sign = -1,
            t => {
                if let Some(reg) = Reg::from_name(t) {
                    if sign < 0 {
                        return Err(AsmError::new(line_no, "a register cannot be subtracted"));
                    }
                    regs.push(reg);
                } else if let Some(v) = parse_number(t) {
                    op.disp += sign * v;
                    sign = 1;
                } else if is_identifier(t) {
                    if op.ident.is_some() {
                        return Err(AsmError::new(
                            line_no,
                            "only one label may appear in an operand",
                        ));
                    }
                    if sign < 0 {
                        return Err(AsmError::new(line_no, "a label cannot be subtracted"));
                    }
                    op.ident = Some(t.to_string());
                } else {
                    return Err(AsmError::new(
                        line_no,
                        format!("\"{t}\" is not a valid operand term"),
                    ));
                }
            }
        }
    }

    match regs.len() {
        0 => {}
        1 => {
            let reg = regs[0];
            if op.memory && !reg.is_addressable() {
                return Err(AsmError::new(
                    line_no,
                    format!("register {reg:?} cannot address memory"),
                ));
            }
            op.base = Some(reg);
        }
        2 => {
            if !op.memory {
                return Err(AsmError::new(line_no, "too many registers in an operand"));
            }
            let (base, index) = match (regs[0], regs[1]) {
                (b @ (Reg::Bx | Reg::Bp), i @ (Reg::Si | Reg::Di)) => (b, i),
                (i @ (Reg::Si | Reg::Di), b @ (Reg::Bx | Reg::Bp)) => (b, i),
                _ => {
                    return Err(AsmError::new(
                        line_no,
                        "this register pair cannot address memory",
                    ))
                }
            };
            op.base = Some(base);
            op.index = Some(index);
        }
        _ => return Err(AsmError::new(line_no, "too many registers in an operand")),
    }

    if !op.memory && op.base.is_some() && (op.disp != 0 || op.ident.is_some()) {
        return Err(AsmError::new(
            line_no,
            "a register operand cannot carry a displacement",
        ));
    }
    Ok(op)
}

/// Split an operand expression into identifier, number and sign tokens.
fn tokenize_expr(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c == '+' || c == '-' {
            tokens.push(&s[i..i + 1]);
            i += 1;
        } else {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_whitespace() || c == '+' || c == '-' {
                    break;
                }
                i += 1;
            }
            tokens.push(&s[start..i]);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(text: &str) -> Operand {
        parse_operand(text, 1).unwrap()
    }

    #[test]
    fn register_operand() {
        let o = op("ax");
        assert!(o.is_register());
        assert_eq!(o.reg(), Some(Reg::Ax));
    }

    #[test]
    fn immediate_operands() {
        assert_eq!(op("42").disp, 42);
        assert_eq!(op("-1").disp, -1);
        assert_eq!(op("0x21").disp, 0x21);
        let o = op("_start+2");
        assert_eq!(o.ident.as_deref(), Some("_start"));
        assert_eq!(o.disp, 2);
        assert!(o.is_immediate());
    }

    #[test]
    fn memory_operands() {
        let o = op("[bp-1]");
        assert!(o.is_memory());
        assert_eq!(o.base, Some(Reg::Bp));
        assert_eq!(o.disp, -1);

        let o = op("[_data+3+di]");
        assert_eq!(o.base, Some(Reg::Di));
        assert_eq!(o.ident.as_deref(), Some("_data"));
        assert_eq!(o.disp, 3);

        let o = op("[bp-6+di]");
        assert_eq!(o.base, Some(Reg::Bp));
        assert_eq!(o.index, Some(Reg::Di));
        assert_eq!(o.disp, -6);
    }

    #[test]
    fn size_hints() {
        assert_eq!(op("byte [bx]").size_hint, Some(Width::Byte));
        assert_eq!(op("word [bp-2]").size_hint, Some(Width::Word));
    }

    #[test]
    fn bad_operands_are_rejected() {
        assert!(parse_operand("ax+1", 1).is_err());
        assert!(parse_operand("[ax]", 1).is_err());
        assert!(parse_operand("_a+_b", 1).is_err());
        assert!(parse_operand("[bx+cx]", 1).is_err());
        assert!(parse_operand("[bx", 1).is_err());
    }

    #[test]
    fn register_numbering_matches_the_isa() {
        assert_eq!(Reg::Ax.encoding(), 0);
        assert_eq!(Reg::Cl.encoding(), 1);
        assert_eq!(Reg::Bx.encoding(), 3);
        assert_eq!(Reg::Sp.encoding(), 4);
        assert_eq!(Reg::Ch.encoding(), 5);
        assert_eq!(Reg::Si.encoding(), 6);
        assert_eq!(Reg::Di.encoding(), 7);
    }

    #[test]
    fn parse_lines() {
        let blocks = parse_source(
            "segment code\n_main:\nmov ax, 1\nret\nsegment data\n_g:\ndb 5\n",
        )
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "code");
        assert_eq!(blocks[0].items.len(), 3);
        assert!(matches!(blocks[0].items[0].0, Item::Label(ref n) if n == "_main"));
        assert!(matches!(blocks[1].items[1].0, Item::Db(_)));
    }

    #[test]
    fn db_strings_and_bytes() {
        let Item::Db(items) = parse_item("db 'hi, there', 0", 1).unwrap() else {
            panic!("not a db");
        };
        assert_eq!(
            items,
            vec![DbItem::Text("hi, there".to_string()), DbItem::Byte(0)]
        );
    }

    #[test]
    fn comments_are_stripped() {
        let blocks = parse_source("segment code\nret ; done\n").unwrap();
        assert_eq!(blocks[0].items.len(), 1);
    }

    #[test]
    fn unknown_instruction_is_an_error() {
        let err = parse_source("segment code\nfrobnicate ax\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("frobnicate"));
    }
}
