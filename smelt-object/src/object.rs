//! The virtual object container.
//!
//! A `VirtualObject` is the abstract shape every concrete object format
//! shares: an ordered list of named segments, the global symbols the object
//! exports (name, segment, offset), and the external names it imports.
//! Serializing this structure to disk is the job of a format backend; the
//! container only guarantees that everything a linker needs is present.

use crate::segment::{SegOffset, VirtualSegment};

/// A failure while manipulating a virtual object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// Two merged objects define the same label in the same segment.
    #[error("label \"{label}\" is defined by both objects in segment \"{segment}\"")]
    DuplicateLabel {
        /// The segment both definitions live in.
        segment: String,
        /// The clashing label.
        label: String,
    },
    /// A reference names a segment the object does not have.
    #[error("segment \"{0}\" does not exist")]
    NoSuchSegment(String),
}

/// An exported symbol: a name pinned to an offset inside a segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalRef {
    /// The exported name.
    pub name: String,
    /// The segment the symbol lives in.
    pub segment: String,
    /// The symbol's offset within that segment.
    pub offset: SegOffset,
}

/// An ordered collection of segments plus the object's symbol tables.
#[derive(Default)]
pub struct VirtualObject {
    segments: Vec<VirtualSegment>,
    globals: Vec<GlobalRef>,
    externals: Vec<String>,
}

impl VirtualObject {
    /// Create an empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a segment (with origin 0) or return the existing one of the
    /// same name.
    pub fn create_segment(&mut self, name: &str) -> &mut VirtualSegment {
        self.create_segment_with_origin(name, 0)
    }

    /// Create a segment with a load origin, or return the existing one.
    pub fn create_segment_with_origin(&mut self, name: &str, origin: u32) -> &mut VirtualSegment {
        if let Some(idx) = self.segments.iter().position(|s| s.name() == name) {
            return &mut self.segments[idx];
        }
        log::debug!("creating segment \"{name}\"");
        self.segments.push(VirtualSegment::new(name, origin));
        self.segments.last_mut().expect("just pushed")
    }

    /// Does a segment of this name exist?
    pub fn has_segment(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name() == name)
    }

    /// Fetch a segment by name.
    pub fn segment(&self, name: &str) -> Option<&VirtualSegment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Fetch a segment by name, writable.
    pub fn segment_mut(&mut self, name: &str) -> Option<&mut VirtualSegment> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    /// The segments in creation order.
    pub fn segments(&self) -> &[VirtualSegment] {
        &self.segments
    }

    /// Export `name` at `offset` inside `segment`.
    pub fn register_global_reference(
        &mut self,
        segment: &str,
        name: impl Into<String>,
        offset: SegOffset,
    ) -> Result<(), ObjectError> {
        if !self.has_segment(segment) {
            return Err(ObjectError::NoSuchSegment(segment.to_string()));
        }
        self.globals.push(GlobalRef {
            name: name.into(),
            segment: segment.to_string(),
            offset,
        });
        Ok(())
    }

    /// The exported symbols.
    pub fn global_references(&self) -> &[GlobalRef] {
        &self.globals
    }

    /// The exported symbols living in one segment.
    pub fn global_references_for_segment<'a>(
        &'a self,
        segment: &'a str,
    ) -> impl Iterator<Item = &'a GlobalRef> {
        self.globals.iter().filter(move |g| g.segment == segment)
    }

    /// Does the object export this name?
    pub fn has_global_reference(&self, name: &str) -> bool {
        self.globals.iter().any(|g| g.name == name)
    }

    /// Import an external name. Duplicates collapse.
    pub fn register_external_reference(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.externals.contains(&name) {
            self.externals.push(name);
        }
    }

    /// The imported names.
    pub fn external_references(&self) -> &[String] {
        &self.externals
    }

    /// Does the object import this name?
    pub fn has_external_reference(&self, name: &str) -> bool {
        self.externals.iter().any(|e| e == name)
    }

    /// Merge another object into this one.
    ///
    /// Same-named segments are concatenated; the absorbed side's labels,
    /// relocations and global references are rebased by the size the
    /// receiving segment had before the merge. External references merge
    /// and deduplicate, and imports that the merged object turns out to
    /// define are dropped.
    pub fn append(&mut self, other: VirtualObject) -> Result<(), ObjectError> {
        let mut rebase: Vec<(String, SegOffset)> = Vec::new();
        for seg in other.segments {
            let name = seg.name().to_string();
            match self.segments.iter_mut().find(|s| s.name() == name) {
                Some(existing) => {
                    let base = existing.current_offset();
                    existing.absorb(seg).map_err(|label| {
                        ObjectError::DuplicateLabel {
                            segment: name.clone(),
                            label,
                        }
                    })?;
                    rebase.push((name, base));
                }
                None => {
                    self.segments.push(seg);
                    rebase.push((name, 0));
                }
            }
        }
        for mut global in other.globals {
            if let Some(&(_, base)) = rebase.iter().find(|(name, _)| *name == global.segment) {
                global.offset += base;
            }
            self.globals.push(global);
        }
        for ext in other.externals {
            if !self.has_global_reference(&ext) {
                self.register_external_reference(ext);
            }
        }
        // Imports satisfied by the other side's exports are no longer
        // external.
        let globals = &self.globals;
        self.externals.retain(|e| !globals.iter().any(|g| &g.name == e));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{RelocKind, Relocation};

    #[test]
    fn create_segment_is_idempotent() {
        let mut obj = VirtualObject::new();
        obj.create_segment("code").stream_mut().write8(1);
        obj.create_segment("code").stream_mut().write8(2);
        assert_eq!(obj.segments().len(), 1);
        assert_eq!(obj.segment("code").unwrap().stream().as_slice(), &[1, 2]);
    }

    #[test]
    fn global_reference_requires_segment() {
        let mut obj = VirtualObject::new();
        assert_eq!(
            obj.register_global_reference("code", "_main", 0),
            Err(ObjectError::NoSuchSegment("code".to_string()))
        );
        obj.create_segment("code");
        obj.register_global_reference("code", "_main", 0).unwrap();
        assert!(obj.has_global_reference("_main"));
    }

    #[test]
    fn externals_deduplicate() {
        let mut obj = VirtualObject::new();
        obj.register_external_reference("_printf");
        obj.register_external_reference("_printf");
        assert_eq!(obj.external_references().len(), 1);
    }

    #[test]
    fn append_rebases_merged_segments() {
        let mut a = VirtualObject::new();
        {
            let code = a.create_segment("code");
            code.stream_mut().write_bytes(&[0x90, 0x90]);
            code.declare_label("_main", 0);
        }
        a.register_global_reference("code", "_main", 0).unwrap();

        let mut b = VirtualObject::new();
        {
            let code = b.create_segment("code");
            code.stream_mut().write_bytes(&[0xC3]);
            code.declare_label("_helper", 0);
            code.add_relocation(Relocation {
                kind: RelocKind::Abs16,
                offset: 0,
                target: "_main".into(),
                addend: 0,
            });
        }
        b.register_global_reference("code", "_helper", 0).unwrap();
        b.create_segment("data").stream_mut().write8(5);

        a.append(b).unwrap();
        let code = a.segment("code").unwrap();
        assert_eq!(code.stream().as_slice(), &[0x90, 0x90, 0xC3]);
        assert_eq!(code.label_offset("_helper"), Some(2));
        assert_eq!(code.relocations()[0].offset, 2);
        let helper = a
            .global_references()
            .iter()
            .find(|g| g.name == "_helper")
            .unwrap();
        assert_eq!(helper.offset, 2);
        assert!(a.has_segment("data"));
    }

    #[test]
    fn append_resolves_satisfied_imports() {
        let mut a = VirtualObject::new();
        a.register_external_reference("_helper");

        let mut b = VirtualObject::new();
        b.create_segment("code").declare_label("_helper", 0);
        b.register_global_reference("code", "_helper", 0).unwrap();

        a.append(b).unwrap();
        assert!(!a.has_external_reference("_helper"));
        assert!(a.has_global_reference("_helper"));
    }

    #[test]
    fn append_rejects_duplicate_labels() {
        let mut a = VirtualObject::new();
        a.create_segment("code").declare_label("_main", 0);
        let mut b = VirtualObject::new();
        b.create_segment("code").declare_label("_main", 0);
        assert_eq!(
            a.append(b),
            Err(ObjectError::DuplicateLabel {
                segment: "code".to_string(),
                label: "_main".to_string()
            })
        );
    }
}
