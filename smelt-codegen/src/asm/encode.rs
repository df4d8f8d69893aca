//! Instruction classification, sizing and byte emission.
//!
//! Pass 1 derives an [`InsForm`] from the operand shapes and asks it for a
//! size; pass 2 derives the same form again and emits the bytes. Sizing
//! never needs symbol resolution: an operand that references an identifier
//! always sizes as a 16-bit displacement, so the two passes agree by
//! construction (`size_of(ins) == len(emit(ins))` is asserted after every
//! instruction).

use super::parse::{Instruction, Mnemonic, Operand, Reg, Width};
use super::AsmError;
use smelt_object::{RelocKind, Relocation, SegOffset, VirtualSegment};

/// The two-operand arithmetic/logic family sharing one encoding scheme.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_mnemonic(m: Mnemonic) -> Option<Self> {
        Some(match m {
            Mnemonic::Add => Self::Add,
            Mnemonic::Or => Self::Or,
            Mnemonic::And => Self::And,
            Mnemonic::Sub => Self::Sub,
            Mnemonic::Xor => Self::Xor,
            Mnemonic::Cmp => Self::Cmp,
            _ => return None,
        })
    }

    /// Base opcode of the `op r/m, r` row.
    fn base(self) -> u8 {
        match self {
            Self::Add => 0x00,
            Self::Or => 0x08,
            Self::And => 0x20,
            Self::Sub => 0x28,
            Self::Xor => 0x30,
            Self::Cmp => 0x38,
        }
    }

    /// The `rrr` opcode extension of the `80`/`81` immediate row.
    fn ext(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Or => 1,
            Self::And => 4,
            Self::Sub => 5,
            Self::Xor => 6,
            Self::Cmp => 7,
        }
    }
}

/// The `F6`/`F7` group: multiply and divide by a register.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Group3Op {
    Mul,
    Imul,
    Div,
    Idiv,
}

impl Group3Op {
    fn ext(self) -> u8 {
        match self {
            Self::Mul => 4,
            Self::Imul => 5,
            Self::Div => 6,
            Self::Idiv => 7,
        }
    }
}

/// The rotate/shift group (`D0`-`D3`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ShiftOp {
    Rcl,
    Rcr,
    Shl,
}

impl ShiftOp {
    fn ext(self) -> u8 {
        match self {
            Self::Rcl => 2,
            Self::Rcr => 3,
            Self::Shl => 4,
        }
    }
}

/// A conditional jump and its short-form opcode.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cc {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
}

impl Cc {
    fn from_mnemonic(m: Mnemonic) -> Option<Self> {
        Some(match m {
            Mnemonic::Je => Self::E,
            Mnemonic::Jne => Self::Ne,
            Mnemonic::Jl => Self::L,
            Mnemonic::Jle => Self::Le,
            Mnemonic::Jg => Self::G,
            Mnemonic::Jge => Self::Ge,
            Mnemonic::Jb => Self::B,
            Mnemonic::Jbe => Self::Be,
            Mnemonic::Ja => Self::A,
            Mnemonic::Jae => Self::Ae,
            _ => return None,
        })
    }

    fn opcode(self) -> u8 {
        match self {
            Self::E => 0x74,
            Self::Ne => 0x75,
            Self::B => 0x72,
            Self::Ae => 0x73,
            Self::Be => 0x76,
            Self::A => 0x77,
            Self::L => 0x7C,
            Self::Ge => 0x7D,
            Self::Le => 0x7E,
            Self::G => 0x7F,
        }
    }
}

/// The opcode variant an instruction encodes as, selected from the operand
/// shapes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InsForm {
    MovRegReg(Width),
    MovImmReg(Width),
    MovImmMem(Width),
    /// `mov al/ax, [moffs]` — the accumulator short form.
    MovMemToAcc(Width),
    /// `mov [moffs], al/ax`.
    MovAccToMem(Width),
    MovMemToReg(Width),
    MovRegToMem(Width),
    AluRegReg(AluOp, Width),
    AluImmReg(AluOp, Width),
    AluImmMem(AluOp, Width),
    Group3Reg(Group3Op, Width),
    TestRegReg(Width),
    XchgAxReg,
    PushReg,
    PopReg,
    IntImm,
    LeaRegMem,
    CallNear,
    RetNear,
    JmpNear,
    Jcc(Cc),
    LoopShort,
    ShiftRegOne(ShiftOp, Width),
    ShiftRegCl(ShiftOp, Width),
    IncReg16,
    DecReg16,
    Lodsb,
    Stosb,
}

fn width_of(reg: Reg) -> Width {
    if reg.is_word() {
        Width::Word
    } else {
        Width::Byte
    }
}

fn imm_len(w: Width) -> u32 {
    match w {
        Width::Byte => 1,
        Width::Word => 2,
    }
}

fn unsupported(ins: &Instruction) -> AsmError {
    AsmError::new(
        ins.line,
        format!("unsupported operand combination for {:?}", ins.mnemonic),
    )
}

/// Select the encoding for an instruction, or fail with the token position
/// when the operand combination is not supported.
pub fn classify(ins: &Instruction) -> Result<InsForm, AsmError> {
    use Mnemonic as M;

    let ops = &ins.ops;
    let two = |a: fn(&Operand) -> bool, b: fn(&Operand) -> bool| {
        ops.len() == 2 && a(&ops[0]) && b(&ops[1])
    };

    match ins.mnemonic {
        M::Mov => {
            if two(Operand::is_register, Operand::is_register) {
                let (l, r) = (ops[0].reg().unwrap(), ops[1].reg().unwrap());
                if l.is_word() != r.is_word() {
                    return Err(unsupported(ins));
                }
                Ok(InsForm::MovRegReg(width_of(l)))
            } else if two(Operand::is_register, Operand::is_immediate) {
                Ok(InsForm::MovImmReg(width_of(ops[0].reg().unwrap())))
            } else if two(Operand::is_register, Operand::is_memory) {
                let reg = ops[0].reg().unwrap();
                if matches!(reg, Reg::Al | Reg::Ax) && ops[1].is_direct_memory() {
                    Ok(InsForm::MovMemToAcc(width_of(reg)))
                } else {
                    Ok(InsForm::MovMemToReg(width_of(reg)))
                }
            } else if two(Operand::is_memory, Operand::is_register) {
                let reg = ops[1].reg().unwrap();
                if matches!(reg, Reg::Al | Reg::Ax) && ops[0].is_direct_memory() {
                    Ok(InsForm::MovAccToMem(width_of(reg)))
                } else {
                    Ok(InsForm::MovRegToMem(width_of(reg)))
                }
            } else if two(Operand::is_memory, Operand::is_immediate) {
                let w = match ops[0].size_hint {
                    Some(Width::Word) => Width::Word,
                    _ => Width::Byte,
                };
                Ok(InsForm::MovImmMem(w))
            } else {
                Err(unsupported(ins))
            }
        }
        M::Add | M::Or | M::And | M::Sub | M::Xor | M::Cmp => {
            let op = AluOp::from_mnemonic(ins.mnemonic).expect("alu mnemonic");
            if two(Operand::is_register, Operand::is_register) {
                let (l, r) = (ops[0].reg().unwrap(), ops[1].reg().unwrap());
                if l.is_word() != r.is_word() {
                    return Err(unsupported(ins));
                }
                Ok(InsForm::AluRegReg(op, width_of(l)))
            } else if two(Operand::is_register, Operand::is_immediate) {
                Ok(InsForm::AluImmReg(op, width_of(ops[0].reg().unwrap())))
            } else if two(Operand::is_memory, Operand::is_immediate) {
                let w = match ops[0].size_hint {
                    Some(Width::Word) => Width::Word,
                    _ => Width::Byte,
                };
                Ok(InsForm::AluImmMem(op, w))
            } else {
                Err(unsupported(ins))
            }
        }
        M::Test => {
            if two(Operand::is_register, Operand::is_register) {
                Ok(InsForm::TestRegReg(width_of(ops[0].reg().unwrap())))
            } else {
                Err(unsupported(ins))
            }
        }
        M::Xchg => {
            if two(Operand::is_register, Operand::is_register) {
                let (l, r) = (ops[0].reg().unwrap(), ops[1].reg().unwrap());
                if (l == Reg::Ax && r.is_word()) || (r == Reg::Ax && l.is_word()) {
                    return Ok(InsForm::XchgAxReg);
                }
            }
            Err(unsupported(ins))
        }
        M::Mul | M::Imul | M::Div | M::Idiv => {
            let op = match ins.mnemonic {
                M::Mul => Group3Op::Mul,
                M::Imul => Group3Op::Imul,
                M::Div => Group3Op::Div,
                _ => Group3Op::Idiv,
            };
            match ops.first() {
                Some(o) if ops.len() == 1 && o.is_register() => {
                    Ok(InsForm::Group3Reg(op, width_of(o.reg().unwrap())))
                }
                _ => Err(unsupported(ins)),
            }
        }
        M::Push | M::Pop => match ops.first() {
            Some(o) if ops.len() == 1 && o.reg().is_some_and(Reg::is_word) => {
                if ins.mnemonic == M::Push {
                    Ok(InsForm::PushReg)
                } else {
                    Ok(InsForm::PopReg)
                }
            }
            _ => Err(unsupported(ins)),
        },
        M::Int => match ops.first() {
            Some(o) if ops.len() == 1 && o.is_immediate() && o.ident.is_none() => {
                Ok(InsForm::IntImm)
            }
            _ => Err(unsupported(ins)),
        },
        M::Lea => {
            if two(Operand::is_register, Operand::is_memory)
                && ops[0].reg().is_some_and(Reg::is_word)
            {
                Ok(InsForm::LeaRegMem)
            } else {
                Err(unsupported(ins))
            }
        }
        M::Call => match ops.first() {
            Some(o) if ops.len() == 1 && o.is_immediate() && o.ident.is_some() => {
                Ok(InsForm::CallNear)
            }
            _ => Err(unsupported(ins)),
        },
        M::Ret => {
            if ops.is_empty() {
                Ok(InsForm::RetNear)
            } else {
                Err(unsupported(ins))
            }
        }
        M::Jmp => match ops.first() {
            Some(o) if ops.len() == 1 && o.is_immediate() && o.ident.is_some() => {
                Ok(InsForm::JmpNear)
            }
            _ => Err(unsupported(ins)),
        },
        M::Je | M::Jne | M::Jl | M::Jle | M::Jg | M::Jge | M::Jb | M::Jbe | M::Ja | M::Jae => {
            let cc = Cc::from_mnemonic(ins.mnemonic).expect("jcc mnemonic");
            match ops.first() {
                Some(o) if ops.len() == 1 && o.is_immediate() && o.ident.is_some() => {
                    Ok(InsForm::Jcc(cc))
                }
                _ => Err(unsupported(ins)),
            }
        }
        M::Loop => match ops.first() {
            Some(o) if ops.len() == 1 && o.is_immediate() && o.ident.is_some() => {
                Ok(InsForm::LoopShort)
            }
            _ => Err(unsupported(ins)),
        },
        M::Shl | M::Rcl | M::Rcr => {
            let op = match ins.mnemonic {
                M::Shl => ShiftOp::Shl,
                M::Rcl => ShiftOp::Rcl,
                _ => ShiftOp::Rcr,
            };
            if ops.len() == 2 && ops[0].is_register() {
                let w = width_of(ops[0].reg().unwrap());
                if ops[1].is_immediate() && ops[1].disp == 1 && ops[1].ident.is_none() {
                    return Ok(InsForm::ShiftRegOne(op, w));
                }
                if ops[1].reg() == Some(Reg::Cl) {
                    return Ok(InsForm::ShiftRegCl(op, w));
                }
            }
            Err(unsupported(ins))
        }
        M::Inc | M::Dec => match ops.first() {
            Some(o) if ops.len() == 1 && o.reg().is_some_and(Reg::is_word) => {
                if ins.mnemonic == M::Inc {
                    Ok(InsForm::IncReg16)
                } else {
                    Ok(InsForm::DecReg16)
                }
            }
            _ => Err(unsupported(ins)),
        },
        M::Lodsb => {
            if ops.is_empty() {
                Ok(InsForm::Lodsb)
            } else {
                Err(unsupported(ins))
            }
        }
        M::Stosb => {
            if ops.is_empty() {
                Ok(InsForm::Stosb)
            } else {
                Err(unsupported(ins))
            }
        }
    }
}

// ----------------------------------------------------------------------
// ModR/M.
// ----------------------------------------------------------------------

/// Displacement width of a memory operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Disp {
    None,
    D8,
    D16,
}

impl Disp {
    fn len(self) -> u32 {
        match self {
            Self::None => 0,
            Self::D8 => 1,
            Self::D16 => 2,
        }
    }
}

/// The `oo`/`mmm` encoding of a memory operand.
///
/// An operand referencing an identifier always takes a 16-bit displacement
/// so that sizing stays independent of symbol resolution.
fn mem_enc(op: &Operand) -> Result<(u8, u8, Disp), ()> {
    let mmm = match (op.base, op.index) {
        (None, None) => return Ok((0b00, 0b110, Disp::D16)),
        (Some(Reg::Bx), Some(Reg::Si)) => 0b000,
        (Some(Reg::Bx), Some(Reg::Di)) => 0b001,
        (Some(Reg::Bp), Some(Reg::Si)) => 0b010,
        (Some(Reg::Bp), Some(Reg::Di)) => 0b011,
        (Some(Reg::Si), None) => 0b100,
        (Some(Reg::Di), None) => 0b101,
        (Some(Reg::Bp), None) => 0b110,
        (Some(Reg::Bx), None) => 0b111,
        _ => return Err(()),
    };
    let (oo, disp) = if op.ident.is_some() {
        (0b10, Disp::D16)
    } else if op.disp == 0 && mmm != 0b110 {
        (0b00, Disp::None)
    } else if (-128..=127).contains(&op.disp) {
        (0b01, Disp::D8)
    } else {
        (0b10, Disp::D16)
    };
    Ok((oo, mmm, disp))
}

fn bind_modrm(oo: u8, rrr: u8, mmm: u8) -> u8 {
    (oo << 6) | (rrr << 3) | mmm
}

fn mem_operand<'a>(ins: &'a Instruction) -> Result<&'a Operand, AsmError> {
    ins.ops
        .iter()
        .find(|o| o.is_memory())
        .ok_or_else(|| unsupported(ins))
}

/// The encoded size of an instruction in bytes. Derived entirely from the
/// form and the operand shapes; pass 1 fixes label offsets with it.
pub fn size_of(form: InsForm, ins: &Instruction) -> Result<u32, AsmError> {
    use InsForm as F;
    let mem_disp = |ins| -> Result<u32, AsmError> {
        let (_, _, disp) = mem_enc(mem_operand(ins)?).map_err(|()| unsupported(ins))?;
        Ok(disp.len())
    };
    Ok(match form {
        F::MovRegReg(_) => 2,
        F::MovImmReg(w) => 1 + imm_len(w),
        F::MovImmMem(w) => 2 + mem_disp(ins)? + imm_len(w),
        F::MovMemToAcc(_) | F::MovAccToMem(_) => 3,
        F::MovMemToReg(_) | F::MovRegToMem(_) => 2 + mem_disp(ins)?,
        F::AluRegReg(..) => 2,
        F::AluImmReg(_, w) => 2 + imm_len(w),
        F::AluImmMem(_, w) => 2 + mem_disp(ins)? + imm_len(w),
        F::Group3Reg(..) => 2,
        F::TestRegReg(_) => 2,
        F::XchgAxReg => 1,
        F::PushReg | F::PopReg => 1,
        F::IntImm => 2,
        F::LeaRegMem => 2 + mem_disp(ins)?,
        F::CallNear | F::JmpNear => 3,
        F::RetNear => 1,
        F::Jcc(_) | F::LoopShort => 2,
        F::ShiftRegOne(..) | F::ShiftRegCl(..) => 2,
        F::IncReg16 | F::DecReg16 => 1,
        F::Lodsb | F::Stosb => 1,
    })
}

// ----------------------------------------------------------------------
// Emission.
// ----------------------------------------------------------------------

/// Symbol tables the emitter resolves against.
pub struct SymbolTable<'a> {
    /// Every label across all segments: name -> (segment, offset).
    pub labels: &'a rustc_hash::FxHashMap<String, (String, SegOffset)>,
    /// Names declared `extern`.
    pub externs: &'a [String],
}

impl SymbolTable<'_> {
    fn lookup(&self, name: &str) -> Option<(&str, SegOffset)> {
        self.labels.get(name).map(|(seg, off)| (seg.as_str(), *off))
    }

    fn is_extern(&self, name: &str) -> bool {
        self.externs.iter().any(|e| e == name)
    }
}

/// Resolve an immediate operand to a 16-bit value, registering a relocation
/// on the segment when the operand references a symbol. `at` is the offset
/// of the value's first byte. Also serves the `dw` data directive.
pub(super) fn resolve_imm16(
    op: &Operand,
    at: SegOffset,
    seg: &mut VirtualSegment,
    symbols: &SymbolTable,
    line: u32,
) -> Result<u16, AsmError> {
    let Some(ident) = &op.ident else {
        return Ok(op.disp as u16);
    };
    let value = if let Some((_, off)) = symbols.lookup(ident) {
        off as i32 + op.disp
    } else if symbols.is_extern(ident) {
        op.disp
    } else {
        return Err(AsmError::new(
            line,
            format!("the label \"{ident}\" could not be resolved"),
        ));
    };
    seg.add_relocation(Relocation {
        kind: RelocKind::Abs16,
        offset: at,
        target: ident.clone(),
        addend: op.disp,
    });
    Ok(value as u16)
}

/// Emit a memory operand's ModR/M byte and displacement, resolving any
/// label in the displacement.
fn emit_modrm_mem(
    op: &Operand,
    rrr: u8,
    seg: &mut VirtualSegment,
    symbols: &SymbolTable,
    line: u32,
) -> Result<(), AsmError> {
    let (oo, mmm, disp) = mem_enc(op).map_err(|()| {
        AsmError::new(line, "this operand cannot be encoded as a memory access")
    })?;
    seg.stream_mut().write8(bind_modrm(oo, rrr, mmm));
    match disp {
        Disp::None => {}
        Disp::D8 => seg.stream_mut().write8(op.disp as u8),
        Disp::D16 => {
            let at = seg.current_offset();
            let value = resolve_imm16(op, at, seg, symbols, line)?;
            seg.stream_mut().write16(value);
        }
    }
    Ok(())
}

fn emit_imm(
    op: &Operand,
    w: Width,
    seg: &mut VirtualSegment,
    symbols: &SymbolTable,
    line: u32,
) -> Result<(), AsmError> {
    match w {
        Width::Byte => {
            if op.ident.is_some() {
                return Err(AsmError::new(
                    line,
                    "a label cannot be used as an 8-bit immediate",
                ));
            }
            seg.stream_mut().write8(op.disp as u8);
        }
        Width::Word => {
            let at = seg.current_offset();
            let value = resolve_imm16(op, at, seg, symbols, line)?;
            seg.stream_mut().write16(value);
        }
    }
    Ok(())
}

/// The jump distance from the end of an instruction to a label that must
/// live in the current segment.
fn branch_target(
    op: &Operand,
    end_of_ins: SegOffset,
    current_segment: &str,
    symbols: &SymbolTable,
    line: u32,
) -> Result<i32, AsmError> {
    let ident = op.ident.as_deref().expect("branch operands carry a label");
    match symbols.lookup(ident) {
        Some((seg, off)) if seg == current_segment => {
            Ok(off as i32 + op.disp - end_of_ins as i32)
        }
        Some(_) => Err(AsmError::new(
            line,
            format!("the jump target \"{ident}\" is in another segment"),
        )),
        None => Err(AsmError::new(
            line,
            format!("the jump target \"{ident}\" could not be resolved"),
        )),
    }
}

/// Emit one instruction into the segment.
pub fn emit(
    form: InsForm,
    ins: &Instruction,
    seg: &mut VirtualSegment,
    symbols: &SymbolTable,
) -> Result<(), AsmError> {
    use InsForm as F;
    let line = ins.line;
    let ops = &ins.ops;
    match form {
        F::MovRegReg(w) => {
            let opcode = if w == Width::Word { 0x89 } else { 0x88 };
            seg.stream_mut().write8(opcode);
            let rrr = ops[1].reg().expect("reg operand").encoding();
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, rrr, mmm));
        }
        F::MovImmReg(w) => {
            let reg = ops[0].reg().expect("reg operand");
            let base = if w == Width::Word { 0xB8 } else { 0xB0 };
            seg.stream_mut().write8(base + reg.encoding());
            emit_imm(&ops[1], w, seg, symbols, line)?;
        }
        F::MovImmMem(w) => {
            let opcode = if w == Width::Word { 0xC7 } else { 0xC6 };
            seg.stream_mut().write8(opcode);
            emit_modrm_mem(&ops[0], 0, seg, symbols, line)?;
            emit_imm(&ops[1], w, seg, symbols, line)?;
        }
        F::MovMemToAcc(w) => {
            let opcode = if w == Width::Word { 0xA1 } else { 0xA0 };
            seg.stream_mut().write8(opcode);
            let at = seg.current_offset();
            let value = resolve_imm16(&ops[1], at, seg, symbols, line)?;
            seg.stream_mut().write16(value);
        }
        F::MovAccToMem(w) => {
            let opcode = if w == Width::Word { 0xA3 } else { 0xA2 };
            seg.stream_mut().write8(opcode);
            let at = seg.current_offset();
            let value = resolve_imm16(&ops[0], at, seg, symbols, line)?;
            seg.stream_mut().write16(value);
        }
        F::MovMemToReg(w) => {
            let opcode = if w == Width::Word { 0x8B } else { 0x8A };
            seg.stream_mut().write8(opcode);
            let rrr = ops[0].reg().expect("reg operand").encoding();
            emit_modrm_mem(&ops[1], rrr, seg, symbols, line)?;
        }
        F::MovRegToMem(w) => {
            let opcode = if w == Width::Word { 0x89 } else { 0x88 };
            seg.stream_mut().write8(opcode);
            let rrr = ops[1].reg().expect("reg operand").encoding();
            emit_modrm_mem(&ops[0], rrr, seg, symbols, line)?;
        }
        F::AluRegReg(op, w) => {
            let opcode = op.base() + if w == Width::Word { 1 } else { 0 };
            seg.stream_mut().write8(opcode);
            let rrr = ops[1].reg().expect("reg operand").encoding();
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, rrr, mmm));
        }
        F::AluImmReg(op, w) => {
            let opcode = if w == Width::Word { 0x81 } else { 0x80 };
            seg.stream_mut().write8(opcode);
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, op.ext(), mmm));
            emit_imm(&ops[1], w, seg, symbols, line)?;
        }
        F::AluImmMem(op, w) => {
            let opcode = if w == Width::Word { 0x81 } else { 0x80 };
            seg.stream_mut().write8(opcode);
            emit_modrm_mem(&ops[0], op.ext(), seg, symbols, line)?;
            emit_imm(&ops[1], w, seg, symbols, line)?;
        }
        F::Group3Reg(op, w) => {
            let opcode = if w == Width::Word { 0xF7 } else { 0xF6 };
            seg.stream_mut().write8(opcode);
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, op.ext(), mmm));
        }
        F::TestRegReg(w) => {
            let opcode = if w == Width::Word { 0x85 } else { 0x84 };
            seg.stream_mut().write8(opcode);
            let rrr = ops[1].reg().expect("reg operand").encoding();
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, rrr, mmm));
        }
        F::XchgAxReg => {
            let other = if ops[0].reg() == Some(Reg::Ax) {
                ops[1].reg().expect("reg operand")
            } else {
                ops[0].reg().expect("reg operand")
            };
            seg.stream_mut().write8(0x90 + other.encoding());
        }
        F::PushReg => {
            let reg = ops[0].reg().expect("reg operand");
            seg.stream_mut().write8(0x50 + reg.encoding());
        }
        F::PopReg => {
            let reg = ops[0].reg().expect("reg operand");
            seg.stream_mut().write8(0x58 + reg.encoding());
        }
        F::IntImm => {
            seg.stream_mut().write8(0xCD);
            seg.stream_mut().write8(ops[0].disp as u8);
        }
        F::LeaRegMem => {
            seg.stream_mut().write8(0x8D);
            let rrr = ops[0].reg().expect("reg operand").encoding();
            emit_modrm_mem(&ops[1], rrr, seg, symbols, line)?;
        }
        F::CallNear => {
            seg.stream_mut().write8(0xE8);
            let op = &ops[0];
            let ident = op.ident.as_deref().expect("call target");
            let end = seg.current_offset() + 2;
            match symbols.lookup(ident) {
                Some((target_seg, off)) if target_seg == seg.name() => {
                    // Same-segment calls are position independent.
                    let rel = off as i32 + op.disp - end as i32;
                    seg.stream_mut().write16(rel as u16);
                }
                Some(_) => {
                    let at = seg.current_offset();
                    seg.add_relocation(Relocation {
                        kind: RelocKind::PcRel16,
                        offset: at,
                        target: ident.to_string(),
                        addend: op.disp,
                    });
                    seg.stream_mut().write16(op.disp as u16);
                }
                None if symbols.is_extern(ident) => {
                    let at = seg.current_offset();
                    seg.add_relocation(Relocation {
                        kind: RelocKind::PcRel16,
                        offset: at,
                        target: ident.to_string(),
                        addend: op.disp,
                    });
                    seg.stream_mut().write16(op.disp as u16);
                }
                None => {
                    return Err(AsmError::new(
                        line,
                        format!("the call target \"{ident}\" could not be resolved"),
                    ))
                }
            }
        }
        F::RetNear => seg.stream_mut().write8(0xC3),
        F::JmpNear => {
            seg.stream_mut().write8(0xE9);
            let name = seg.name().to_string();
            let end = seg.current_offset() + 2;
            let rel = branch_target(&ops[0], end, &name, symbols, line)?;
            seg.stream_mut().write16(rel as u16);
        }
        F::Jcc(cc) => {
            seg.stream_mut().write8(cc.opcode());
            let name = seg.name().to_string();
            let end = seg.current_offset() + 1;
            let rel = branch_target(&ops[0], end, &name, symbols, line)?;
            if !(-128..=127).contains(&rel) {
                return Err(AsmError::new(
                    line,
                    format!("the conditional jump target is out of range ({rel} bytes)"),
                ));
            }
            seg.stream_mut().write8(rel as u8);
        }
        F::LoopShort => {
            seg.stream_mut().write8(0xE2);
            let name = seg.name().to_string();
            let end = seg.current_offset() + 1;
            let rel = branch_target(&ops[0], end, &name, symbols, line)?;
            if !(-128..=127).contains(&rel) {
                return Err(AsmError::new(
                    line,
                    format!("the loop target is out of range ({rel} bytes)"),
                ));
            }
            seg.stream_mut().write8(rel as u8);
        }
        F::ShiftRegOne(op, w) => {
            let opcode = if w == Width::Word { 0xD1 } else { 0xD0 };
            seg.stream_mut().write8(opcode);
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, op.ext(), mmm));
        }
        F::ShiftRegCl(op, w) => {
            let opcode = if w == Width::Word { 0xD3 } else { 0xD2 };
            seg.stream_mut().write8(opcode);
            let mmm = ops[0].reg().expect("reg operand").encoding();
            seg.stream_mut().write8(bind_modrm(0b11, op.ext(), mmm));
        }
        F::IncReg16 => {
            let reg = ops[0].reg().expect("reg operand");
            seg.stream_mut().write8(0x40 + reg.encoding());
        }
        F::DecReg16 => {
            let reg = ops[0].reg().expect("reg operand");
            seg.stream_mut().write8(0x48 + reg.encoding());
        }
        F::Lodsb => seg.stream_mut().write8(0xAC),
        F::Stosb => seg.stream_mut().write8(0xAA),
    }
    Ok(())
}
