//! Virtual segments: named byte streams with labels and relocations.

use crate::stream::Stream;
use rustc_hash::FxHashMap;

/// Offset in bytes from the beginning of a segment.
///
/// The compiler can cross-assemble for the 8086 from any host, so segment
/// offsets use a fixed-width type rather than `usize`.
pub type SegOffset = u32;

/// Addend applied to a relocation target's resolved address.
pub type Addend = i32;

/// How the bytes at a relocation site are to be patched at link time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 16-bit address of the target.
    Abs16,
    /// 16-bit displacement relative to the end of the patched field.
    PcRel16,
}

/// A fixup the linker must apply to a segment's bytes.
///
/// The assembler records one of these whenever it emits bytes whose final
/// value depends on where a symbol lands: same-segment references (the
/// segment's own load address is unknown), cross-segment references, and
/// references to external names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Patch style.
    pub kind: RelocKind,
    /// Where in this segment the patch bytes start.
    pub offset: SegOffset,
    /// The symbol whose address is patched in.
    pub target: String,
    /// Constant added to the resolved address.
    pub addend: Addend,
}

/// A named byte stream inside a virtual object.
pub struct VirtualSegment {
    name: String,
    origin: u32,
    stream: Stream,
    relocations: Vec<Relocation>,
    labels: FxHashMap<String, SegOffset>,
    label_order: Vec<String>,
}

impl VirtualSegment {
    /// Create an empty segment.
    pub fn new(name: impl Into<String>, origin: u32) -> Self {
        Self {
            name: name.into(),
            origin,
            stream: Stream::new(),
            relocations: Vec::new(),
            labels: FxHashMap::default(),
            label_order: Vec::new(),
        }
    }

    /// The segment name (`code`, `data`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The load origin the segment was created with.
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// The segment's byte stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// The segment's byte stream, writable.
    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Current write offset, which is where the next instruction lands.
    pub fn current_offset(&self) -> SegOffset {
        self.stream.size() as SegOffset
    }

    /// Record a label at an offset. Returns `false` when the label already
    /// exists (the caller reports the duplicate).
    pub fn declare_label(&mut self, name: impl Into<String>, offset: SegOffset) -> bool {
        let name = name.into();
        if self.labels.contains_key(&name) {
            return false;
        }
        log::trace!("segment {}: label {name} at {offset:#x}", self.name);
        self.label_order.push(name.clone());
        self.labels.insert(name, offset);
        true
    }

    /// The offset of a label defined in this segment.
    pub fn label_offset(&self, name: &str) -> Option<SegOffset> {
        self.labels.get(name).copied()
    }

    /// The labels defined in this segment, in definition order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, SegOffset)> + '_ {
        self.label_order
            .iter()
            .map(move |n| (n.as_str(), self.labels[n]))
    }

    /// Record a relocation on this segment.
    pub fn add_relocation(&mut self, reloc: Relocation) {
        log::trace!(
            "segment {}: reloc {:?} -> {} at {:#x}",
            self.name,
            reloc.kind,
            reloc.target,
            reloc.offset
        );
        self.relocations.push(reloc);
    }

    /// The relocations recorded on this segment.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Merge another segment of the same name into this one: its bytes are
    /// appended and its labels, relocations and label order are rebased by
    /// this segment's current size. Returns the name of a clashing label if
    /// the merge is impossible.
    pub(crate) fn absorb(&mut self, other: VirtualSegment) -> Result<(), String> {
        debug_assert_eq!(self.name, other.name);
        let base = self.current_offset();
        for name in &other.label_order {
            if self.labels.contains_key(name) {
                return Err(name.clone());
            }
        }
        self.stream.write_bytes(other.stream.as_slice());
        for name in other.label_order {
            let offset = other.labels[&name] + base;
            self.label_order.push(name.clone());
            self.labels.insert(name, offset);
        }
        for mut reloc in other.relocations {
            reloc.offset += base;
            self.relocations.push(reloc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_record_in_order() {
        let mut seg = VirtualSegment::new("code", 0);
        assert!(seg.declare_label("_start", 0));
        seg.stream_mut().write16(0x9089);
        assert!(seg.declare_label("_next", 2));
        assert!(!seg.declare_label("_start", 4));

        assert_eq!(seg.label_offset("_next"), Some(2));
        let names: Vec<_> = seg.labels().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, ["_start", "_next"]);
    }

    #[test]
    fn absorb_rebases_labels_and_relocs() {
        let mut a = VirtualSegment::new("code", 0);
        a.stream_mut().write_bytes(&[1, 2, 3]);
        a.declare_label("_a", 0);

        let mut b = VirtualSegment::new("code", 0);
        b.stream_mut().write_bytes(&[4, 5]);
        b.declare_label("_b", 1);
        b.add_relocation(Relocation {
            kind: RelocKind::Abs16,
            offset: 0,
            target: "_a".into(),
            addend: 0,
        });

        a.absorb(b).unwrap();
        assert_eq!(a.stream().as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(a.label_offset("_b"), Some(4));
        assert_eq!(a.relocations()[0].offset, 3);
    }

    #[test]
    fn absorb_rejects_label_clash() {
        let mut a = VirtualSegment::new("code", 0);
        a.declare_label("_dup", 0);
        let mut b = VirtualSegment::new("code", 0);
        b.declare_label("_dup", 0);
        assert_eq!(a.absorb(b), Err("_dup".to_string()));
    }
}
