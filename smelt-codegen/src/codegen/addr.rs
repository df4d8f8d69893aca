//! The variable-address resolver.
//!
//! Given a variable use — possibly with array indexes and a structure access
//! chain — produce the abstract address of the accessed bytes: a base
//! (the `data` segment start, the frame pointer, or the `bx` scratch
//! register), a signed offset, and whether the scaled index register `di`
//! participates.
//!
//! A chain whose every step is computable at compile time resolves without
//! emitting any code. One runtime array index or one hop through a pointer
//! forces the dynamic path for the whole chain: index expressions are
//! evaluated into `di` (scaled by the element size), and pointer hops load
//! the address accumulated so far into `bx` and continue from there.
//!
//! Pointer dereferences never pre-load the base: `*p` at depth `d` loads the
//! pointer's value once and then digs `bx` exactly `d - 1` further times, so
//! no depth compensation exists anywhere.

use crate::codegen::{CodeGen, GenError, GenResult};
use core::fmt;
use smelt_ast::{Node, NodeKind, Role, VarClass};

/// The base a variable address is computed from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Base {
    /// The start of the `data` segment (`_data`).
    Data,
    /// The frame pointer (`bp`).
    Bp,
    /// The scratch base register (`bx`), holding a runtime-computed address.
    Bx,
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Data => f.write_str("_data"),
            Self::Bp => f.write_str("bp"),
            Self::Bx => f.write_str("bx"),
        }
    }
}

/// An abstract address: `base ± offset [+ di]`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VarAddress {
    /// The address base.
    pub base: Base,
    /// Offset from the base. Negative offsets grow away from the frame
    /// pointer into the locals area.
    pub offset: i32,
    /// Whether the scaled index register `di` is applied on top.
    pub index: bool,
}

impl VarAddress {
    fn new(base: Base, offset: i32) -> Self {
        Self {
            base,
            offset,
            index: false,
        }
    }
}

impl fmt::Display for VarAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if self.offset > 0 {
            write!(f, "+{}", self.offset)?;
        } else if self.offset < 0 {
            write!(f, "-{}", -self.offset)?;
        }
        if self.index {
            write!(f, "+di")?;
        }
        Ok(())
    }
}

impl<'t> CodeGen<'t> {
    /// Resolve the address of a variable use. Dynamic chains emit address
    /// arithmetic through `bx`/`di` as a side effect; the returned address
    /// is valid immediately after the emitted code.
    pub(crate) fn resolve_var(&mut self, var_iden: Node) -> GenResult<VarAddress> {
        let root_def = self.use_definition(var_iden)?;
        if self.chain_is_static(var_iden, root_def) {
            self.resolve_static(var_iden, root_def)
        } else {
            self.resolve_dynamic(var_iden, root_def)
        }
    }

    /// The definition of the use's root variable.
    pub(crate) fn use_definition(&mut self, var_iden: Node) -> GenResult<Node> {
        if let Some(def) = self.tree.var_def(var_iden) {
            return Ok(def);
        }
        // The improver attaches definitions; falling back to a fresh lookup
        // keeps hand-built trees working.
        match self.tree.resolve_vdef(var_iden, false) {
            Some(def) => Ok(def),
            None => {
                let name = self.tree.var_name(var_iden).to_string();
                self.diags.error(
                    format!("the variable \"{name}\" could not be found"),
                    self.tree.pos(var_iden),
                );
                Err(GenError::User)
            }
        }
    }

    /// The definition of the final element the chain lands on.
    pub(crate) fn final_definition(&mut self, var_iden: Node) -> GenResult<Node> {
        let root = self.use_definition(var_iden)?;
        match self.tree.follow_struct_access(root, var_iden) {
            Some(d) => Ok(d),
            None => {
                self.diags.error(
                    format!(
                        "the structure access on \"{}\" does not resolve",
                        self.tree.var_name(var_iden)
                    ),
                    self.tree.pos(var_iden),
                );
                Err(GenError::User)
            }
        }
    }

    /// Is the whole access chain computable at compile time?
    ///
    /// Any runtime index forces dynamic mode, as does any access through a
    /// pointer: an indexed pointer that declares no bounds (the
    /// character-array idiom) and any `->` step both need a runtime load.
    fn chain_is_static(&self, var_iden: Node, root_def: Node) -> bool {
        let mut def = root_def;
        let mut use_site = var_iden;
        loop {
            let indexed = self.tree.role(use_site, Role::RootArrayIndex).is_some();
            if indexed {
                if self.tree.vdef_is_pointer(def) {
                    return false;
                }
                if !self.indexes_are_literal(use_site) {
                    return false;
                }
            }
            match self.tree.role(use_site, Role::StructAccess) {
                Some(access) => {
                    if self.tree.vdef_is_pointer(def) {
                        return false;
                    }
                    let member_iden = match self.tree.role(access, Role::VarIdentifier) {
                        Some(m) => m,
                        None => return true,
                    };
                    def = match self.tree.var_def(member_iden) {
                        Some(d) => d,
                        None => return true,
                    };
                    use_site = member_iden;
                }
                None => return true,
            }
        }
    }

    fn indexes_are_literal(&self, use_site: Node) -> bool {
        let mut index = self.tree.role(use_site, Role::RootArrayIndex);
        while let Some(idx) = index {
            match self.tree.role(idx, Role::Value) {
                Some(v) if self.tree.kind(v) == NodeKind::Number => {}
                _ => return false,
            }
            index = self.tree.role(idx, Role::Next);
        }
        true
    }

    /// Sum of the literal index values on a use site.
    fn literal_index_sum(&self, use_site: Node) -> i32 {
        let mut sum = 0;
        let mut index = self.tree.role(use_site, Role::RootArrayIndex);
        while let Some(idx) = index {
            if let Some(v) = self.tree.role(idx, Role::Value) {
                sum += self.tree.text(v).parse::<i32>().unwrap_or(0);
            }
            index = self.tree.role(idx, Role::Next);
        }
        sum
    }

    /// The base and offset of the first byte of the root variable, by
    /// storage class. For a local with an access chain the offset points at
    /// the element's end (locals grow below the frame pointer, so inner
    /// offsets are added back toward the frame pointer).
    pub(super) fn root_address(&mut self, root_def: Node) -> GenResult<VarAddress> {
        match self.tree.vdef_class(root_def) {
            VarClass::Global => {
                let pos = self.size_query(self.tree.global_position(root_def), root_def)?;
                Ok(VarAddress::new(Base::Data, pos as i32))
            }
            VarClass::FunctionLocal => {
                // Locals are addressed at their end: the frame grows down
                // from the frame pointer, so inner array and member offsets
                // are added back toward it.
                let pos = self.size_query(self.tree.frame_position(root_def, true), root_def)?;
                Ok(VarAddress::new(Base::Bp, -(pos as i32)))
            }
            VarClass::FunctionArgument => {
                let pos = self.size_query(self.tree.argument_position(root_def), root_def)?;
                // The caller pushed the return address and the saved frame
                // pointer between `bp` and the first argument.
                Ok(VarAddress::new(Base::Bp, pos as i32 + 4))
            }
        }
    }

    fn resolve_static(&mut self, var_iden: Node, root_def: Node) -> GenResult<VarAddress> {
        let mut addr = self.root_address(root_def)?;
        let mut def = root_def;
        let mut use_site = var_iden;
        loop {
            if self.tree.role(use_site, Role::RootArrayIndex).is_some() {
                let elem = self.size_query(self.tree.vdef_element_size(def, false), def)?;
                addr.offset += elem as i32 * self.literal_index_sum(use_site);
            }
            match self.tree.role(use_site, Role::StructAccess) {
                Some(access) => {
                    let member_iden = self.tree.required_role(access, Role::VarIdentifier)?;
                    let member_def = self.member_definition(def, member_iden)?;
                    addr.offset += self.member_offset_of(def, member_def)? as i32;
                    def = member_def;
                    use_site = member_iden;
                }
                None => return Ok(addr),
            }
        }
    }

    fn resolve_dynamic(&mut self, var_iden: Node, root_def: Node) -> GenResult<VarAddress> {
        let mut addr = self.root_address(root_def)?;
        let mut def = root_def;
        let mut use_site = var_iden;
        loop {
            if self.tree.role(use_site, Role::RootArrayIndex).is_some() {
                // A pointer with no declared bounds indexed at the use is the
                // character-array idiom: load the pointer's value, then index
                // by the pointed-to element size.
                let mut ignore_pointer = false;
                if self.tree.vdef_is_pointer(def) && !self.def_declares_index(def) {
                    self.emit(format!("mov bx, [{addr}]"));
                    addr = VarAddress::new(Base::Bx, 0);
                    ignore_pointer = true;
                }
                let elem = self.size_query(self.tree.vdef_element_size(def, ignore_pointer), def)?;
                if self.indexes_are_literal(use_site) {
                    addr.offset += elem as i32 * self.literal_index_sum(use_site);
                } else {
                    self.emit_index_into_di(use_site, elem)?;
                    addr.index = true;
                }
            }
            match self.tree.role(use_site, Role::StructAccess) {
                Some(access) => {
                    let member_iden = self.tree.required_role(access, Role::VarIdentifier)?;
                    let member_def = self.member_definition(def, member_iden)?;
                    if self.tree.vdef_is_pointer(def) {
                        // Hop through the pointer: the structure lives
                        // wherever the pointer says.
                        self.emit(format!("mov bx, [{addr}]"));
                        addr = VarAddress::new(Base::Bx, 0);
                    } else if addr.index {
                        // A runtime-indexed structure element; materialise
                        // its address before stepping inside.
                        self.emit(format!("lea bx, [{addr}]"));
                        addr = VarAddress::new(Base::Bx, 0);
                    }
                    addr.offset += self.member_offset_of(def, member_def)? as i32;
                    def = member_def;
                    use_site = member_iden;
                }
                None => return Ok(addr),
            }
        }
    }

    /// Evaluate a use site's index chain into `di`, scaled by the element
    /// size. `ax` is preserved around the computation.
    fn emit_index_into_di(&mut self, use_site: Node, elem_size: u32) -> GenResult<()> {
        self.emit("push ax");
        let mut first = true;
        let mut index = self.tree.role(use_site, Role::RootArrayIndex);
        while let Some(idx) = index {
            let value = self.tree.required_role(idx, Role::Value)?;
            if first {
                self.emit_expr_into_ax(value)?;
            } else {
                self.emit("push ax");
                self.emit_expr_into_ax(value)?;
                self.emit("pop cx");
                self.emit("add ax, cx");
            }
            first = false;
            index = self.tree.role(idx, Role::Next);
        }
        match elem_size {
            1 => {}
            2 => self.emit("shl ax, 1"),
            n => {
                self.emit(format!("mov cx, {n}"));
                self.emit("mul cx");
            }
        }
        self.emit("mov di, ax");
        self.emit("pop ax");
        Ok(())
    }

    /// Does the definition declare array bounds of its own?
    fn def_declares_index(&self, def: Node) -> bool {
        self.tree
            .role(def, Role::VarIdentifier)
            .and_then(|iden| self.tree.role(iden, Role::RootArrayIndex))
            .is_some()
    }

    fn member_definition(&mut self, def: Node, member_iden: Node) -> GenResult<Node> {
        if let Some(d) = self.tree.var_def(member_iden) {
            return Ok(d);
        }
        let tag = self.tree.vdef_data_type(def).to_string();
        let member_name = self.tree.var_name(member_iden).to_string();
        let found = self
            .tree
            .global_struct(&tag)
            .and_then(|s| self.tree.role(s, Role::StructBody))
            .and_then(|body| self.tree.find_vdef_in_scope(body, &member_name, None));
        match found {
            Some(d) => Ok(d),
            None => {
                self.diags.error(
                    format!("the variable \"{member_name}\" does not exist in structure \"{tag}\""),
                    self.tree.pos(member_iden),
                );
                Err(GenError::User)
            }
        }
    }

    fn member_offset_of(&mut self, struct_def: Node, member_def: Node) -> GenResult<u32> {
        let tag = self.tree.vdef_data_type(struct_def).to_string();
        let offset = self
            .tree
            .global_struct(&tag)
            .and_then(|s| self.tree.role(s, Role::StructBody))
            .and_then(|body| self.tree.member_offset(body, member_def));
        match offset {
            Some(o) => Ok(o),
            None => Err(GenError::Internal(format!(
                "no layout for member of structure \"{tag}\""
            ))),
        }
    }

    /// Unwrap a size computed from the tree; `None` after validation means
    /// the tree changed under us.
    pub(crate) fn size_query(&mut self, size: Option<u32>, at: Node) -> GenResult<u32> {
        match size {
            Some(s) => Ok(s),
            None => {
                self.diags.error(
                    "a size in this declaration is not computable",
                    self.tree.pos(at),
                );
                Err(GenError::User)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Base, VarAddress};

    fn addr(base: Base, offset: i32, index: bool) -> VarAddress {
        VarAddress {
            base,
            offset,
            index,
        }
    }

    #[test]
    fn address_rendering() {
        assert_eq!(addr(Base::Data, 0, false).to_string(), "_data");
        assert_eq!(addr(Base::Data, 4, true).to_string(), "_data+4+di");
        assert_eq!(addr(Base::Bp, -3, false).to_string(), "bp-3");
        assert_eq!(addr(Base::Bp, -6, true).to_string(), "bp-6+di");
        assert_eq!(addr(Base::Bp, 4, false).to_string(), "bp+4");
        assert_eq!(addr(Base::Bx, 0, false).to_string(), "bx");
        assert_eq!(addr(Base::Bx, 1, false).to_string(), "bx+1");
    }
}
