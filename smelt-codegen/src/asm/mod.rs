//! The two-pass 8086 assembler.
//!
//! Consumes the textual assembly surface the code generator produces (plus
//! inline assembly written by the programmer) and writes bytes, labels and
//! relocation records into a [`VirtualObject`].
//!
//! Pass 1 walks every segment fixing label offsets: each instruction's size
//! is derived from its operand shapes alone, so no symbol resolution happens
//! yet. Pass 2 emits bytes, resolving identifiers against the pass-1 label
//! tables; references to labels register [`Relocation`]s (the segment's
//! final load address is the linker's business), `extern` names register
//! external references, and anything else is a hard error carrying the
//! source line.
//!
//! [`Relocation`]: smelt_object::Relocation

mod encode;
mod parse;

use encode::SymbolTable;
use parse::{DbItem, Item, SegmentBlock};
use rustc_hash::FxHashMap;
use smelt_object::{SegOffset, VirtualObject};

/// An assembly failure, reported with the offending source line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct AsmError {
    /// 1-based line within the assembly text.
    pub line: u32,
    /// What went wrong.
    pub message: String,
}

impl AsmError {
    pub(crate) fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Assemble a complete program text into the given object.
pub fn assemble(source: &str, object: &mut VirtualObject) -> Result<(), AsmError> {
    log::debug!("assembling {} bytes of text", source.len());
    let blocks = parse::parse_source(source)?;

    // Pass 1: fix the offset of every label, across all segments.
    let mut labels: FxHashMap<String, (String, SegOffset)> = FxHashMap::default();
    let mut globals: Vec<(String, u32)> = Vec::new();
    let mut externs: Vec<String> = Vec::new();
    for block in &blocks {
        pass_1_segment(block, &mut labels, &mut globals, &mut externs)?;
    }

    // Pass 2: emit bytes and relocations.
    let symbols = SymbolTable {
        labels: &labels,
        externs: &externs,
    };
    for block in &blocks {
        pass_2_segment(block, object, &symbols)?;
    }

    // Names declared global are exported at their resolved offsets.
    for (name, line) in globals {
        match labels.get(&name) {
            Some((segment, offset)) => {
                object
                    .register_global_reference(segment, &name, *offset)
                    .map_err(|e| AsmError::new(line, e.to_string()))?;
            }
            None => {
                return Err(AsmError::new(
                    line,
                    format!("\"{name}\" is declared global but never defined"),
                ))
            }
        }
    }
    for name in externs {
        object.register_external_reference(name);
    }
    Ok(())
}

fn pass_1_segment(
    block: &SegmentBlock,
    labels: &mut FxHashMap<String, (String, SegOffset)>,
    globals: &mut Vec<(String, u32)>,
    externs: &mut Vec<String>,
) -> Result<(), AsmError> {
    let mut offset: SegOffset = 0;
    for (item, line) in &block.items {
        match item {
            Item::Label(name) => {
                if labels.contains_key(name) {
                    return Err(AsmError::new(
                        *line,
                        format!("the label \"{name}\" is defined twice"),
                    ));
                }
                labels.insert(name.clone(), (block.name.clone(), offset));
            }
            Item::Global(name) => globals.push((name.clone(), *line)),
            Item::Extern(name) => {
                if !externs.contains(name) {
                    externs.push(name.clone());
                }
            }
            Item::Db(items) => offset += db_len(items),
            Item::Dw(items) => offset += 2 * items.len() as SegOffset,
            Item::Rb(count) => offset += count,
            Item::Ins(ins) => {
                let form = encode::classify(ins)?;
                offset += encode::size_of(form, ins)?;
            }
        }
    }
    log::trace!("segment {} sized at {offset} bytes", block.name);
    Ok(())
}

fn db_len(items: &[DbItem]) -> SegOffset {
    items
        .iter()
        .map(|i| match i {
            DbItem::Byte(_) => 1,
            DbItem::Text(t) => t.len() as SegOffset,
        })
        .sum()
}

fn pass_2_segment(
    block: &SegmentBlock,
    object: &mut VirtualObject,
    symbols: &SymbolTable,
) -> Result<(), AsmError> {
    let seg = object.create_segment(&block.name);
    for (item, line) in &block.items {
        match item {
            Item::Label(name) => {
                let declared = seg.declare_label(name.clone(), seg.current_offset());
                debug_assert!(declared, "pass 1 checked for duplicates");
            }
            Item::Global(_) | Item::Extern(_) => {}
            Item::Db(items) => {
                for i in items {
                    match i {
                        DbItem::Byte(b) => seg.stream_mut().write8(*b),
                        DbItem::Text(t) => seg.stream_mut().write_bytes(t.as_bytes()),
                    }
                }
            }
            Item::Dw(items) => {
                for op in items {
                    let at = seg.current_offset();
                    let value = encode::resolve_imm16(op, at, seg, symbols, *line)?;
                    seg.stream_mut().write16(value);
                }
            }
            Item::Rb(count) => {
                for _ in 0..*count {
                    seg.stream_mut().write8(0);
                }
            }
            Item::Ins(ins) => {
                let form = encode::classify(ins)?;
                let before = seg.current_offset();
                encode::emit(form, ins, seg, symbols)?;
                debug_assert_eq!(
                    seg.current_offset() - before,
                    encode::size_of(form, ins)?,
                    "pass 1 and pass 2 disagree about an instruction size"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_object::RelocKind;

    fn assemble_ok(src: &str) -> VirtualObject {
        let mut obj = VirtualObject::new();
        assemble(src, &mut obj).unwrap();
        obj
    }

    #[test]
    fn labels_and_bytes() {
        let obj = assemble_ok(
            "segment code\n\
             global _main\n\
             _main:\n\
             push bp\n\
             mov bp, sp\n\
             pop bp\n\
             ret\n",
        );
        let code = obj.segment("code").unwrap();
        assert_eq!(code.stream().as_slice(), &[0x55, 0x89, 0xE5, 0x5D, 0xC3]);
        assert_eq!(code.label_offset("_main"), Some(0));
        let main = &obj.global_references()[0];
        assert_eq!((main.name.as_str(), main.offset), ("_main", 0));
    }

    #[test]
    fn segment_size_equals_sum_of_instruction_sizes() {
        let obj = assemble_ok(
            "segment code\n\
             mov ax, 1\n\
             add ax, cx\n\
             push ax\n\
             pop cx\n\
             ret\n",
        );
        // 3 + 2 + 1 + 1 + 1
        assert_eq!(obj.segment("code").unwrap().stream().size(), 8);
    }

    #[test]
    fn local_branches_resolve_without_relocations() {
        let obj = assemble_ok(
            "segment code\n\
             _top:\n\
             mov ax, 0\n\
             jmp _top\n",
        );
        let code = obj.segment("code").unwrap();
        // jmp rel16 back over both instructions: target 0, end 6.
        assert_eq!(code.stream().as_slice(), &[0xB8, 0, 0, 0xE9, 0xFA, 0xFF]);
        assert!(code.relocations().is_empty());
    }

    #[test]
    fn conditional_jumps_are_short() {
        let obj = assemble_ok(
            "segment code\n\
             cmp ax, 0\n\
             je _done\n\
             mov ax, 1\n\
             _done:\n\
             ret\n",
        );
        let code = obj.segment("code").unwrap();
        // 81 F8 00 00 / 74 03 / B8 01 00 / C3
        assert_eq!(
            code.stream().as_slice(),
            &[0x81, 0xF8, 0, 0, 0x74, 3, 0xB8, 1, 0, 0xC3]
        );
    }

    #[test]
    fn data_references_create_relocations() {
        let obj = assemble_ok(
            "segment code\n\
             mov al, [_data+2+di]\n\
             ret\n\
             segment data\n\
             _data:\n\
             db 1, 2, 3\n",
        );
        let code = obj.segment("code").unwrap();
        // 8A 85 <disp16> : mmm=101 (di), oo=10.
        assert_eq!(&code.stream().as_slice()[..2], &[0x8A, 0x85]);
        assert_eq!(code.stream().peek16(2), Ok(2));
        let reloc = &code.relocations()[0];
        assert_eq!(reloc.target, "_data");
        assert_eq!(reloc.offset, 2);
        assert_eq!(reloc.addend, 2);
        assert_eq!(reloc.kind, RelocKind::Abs16);
    }

    #[test]
    fn extern_calls_relocate() {
        let obj = assemble_ok(
            "segment code\n\
             extern _write\n\
             call _write\n\
             ret\n",
        );
        let code = obj.segment("code").unwrap();
        assert_eq!(code.stream().as_slice(), &[0xE8, 0, 0, 0xC3]);
        let reloc = &code.relocations()[0];
        assert_eq!(reloc.kind, RelocKind::PcRel16);
        assert_eq!(reloc.offset, 1);
        assert!(obj.has_external_reference("_write"));
    }

    #[test]
    fn same_segment_calls_are_relative() {
        let obj = assemble_ok(
            "segment code\n\
             _f:\n\
             ret\n\
             _main:\n\
             call _f\n\
             ret\n",
        );
        let code = obj.segment("code").unwrap();
        // call rel16: target 0, end of call = 1 + 3 = 4 -> rel = -4.
        assert_eq!(code.stream().as_slice(), &[0xC3, 0xE8, 0xFC, 0xFF, 0xC3]);
        assert!(code.relocations().is_empty());
    }

    #[test]
    fn strings_and_reservations() {
        let obj = assemble_ok(
            "segment data\n\
             _msg:\n\
             db 'hi', 0\n\
             _buf:\n\
             rb 4\n",
        );
        let data = obj.segment("data").unwrap();
        assert_eq!(data.stream().as_slice(), b"hi\0\0\0\0\0");
        assert_eq!(data.label_offset("_buf"), Some(3));
    }

    #[test]
    fn dw_with_label_relocates() {
        let obj = assemble_ok(
            "segment code\n\
             _entry:\n\
             ret\n\
             segment data\n\
             _vector:\n\
             dw _entry\n",
        );
        let data = obj.segment("data").unwrap();
        assert_eq!(data.relocations()[0].target, "_entry");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut obj = VirtualObject::new();
        let err = assemble("segment code\n_a:\n_a:\nret\n", &mut obj).unwrap_err();
        assert!(err.message.contains("defined twice"));
    }

    #[test]
    fn unresolved_references_are_rejected() {
        let mut obj = VirtualObject::new();
        let err = assemble("segment code\ncall _nowhere\n", &mut obj).unwrap_err();
        assert!(err.message.contains("_nowhere"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn undefined_global_is_rejected() {
        let mut obj = VirtualObject::new();
        let err = assemble("segment code\nglobal _ghost\nret\n", &mut obj).unwrap_err();
        assert!(err.message.contains("_ghost"));
    }
}
