//! Lexical scopes, variable sizes and frame positions.
//!
//! Four node kinds introduce a scope: `ROOT` (globals), `BODY` (locals),
//! `FOR` (its init clause) and `STRUCT` (member definitions). This module
//! implements everything the validator and the code generator ask of scopes:
//! enumerate declarations, measure declared bytes, compute the position of a
//! variable inside its frame or segment, and look a name up through the
//! scope chain and through structure accesses.
//!
//! Sizes are `Option<u32>`: a size is unknown when a declaration references
//! an undeclared structure tag or uses a non-literal array bound. The
//! semantic validator reports those as user errors; the code generator
//! treats a `None` that survives validation as an internal fault.

use crate::node::{NodeKind, Role, VarClass};
use crate::{Node, Tree};

/// Byte size of a primitive data type name, or `None` for structure tags.
pub fn primitive_size(name: &str) -> Option<u32> {
    match name {
        "int8" | "uint8" => Some(1),
        "int16" | "uint16" => Some(2),
        _ => None,
    }
}

/// Is this data type name one of the built-in integer types?
pub fn is_primitive(name: &str) -> bool {
    primitive_size(name).is_some()
}

/// Pointers are machine words on the 8086.
pub const POINTER_SIZE: u32 = 2;

impl Tree {
    /// The declared data type name of a variable definition.
    pub fn vdef_data_type(&self, vdef: Node) -> &str {
        match self.role(vdef, Role::DataType) {
            Some(ty) => self.text(ty),
            None => "",
        }
    }

    /// The declared name of a variable definition.
    pub fn vdef_name(&self, vdef: Node) -> &str {
        self.role(vdef, Role::VarIdentifier)
            .map(|v| self.var_name(v))
            .unwrap_or("")
    }

    /// The name a variable use refers to.
    pub fn var_name(&self, var_iden: Node) -> &str {
        match self.role(var_iden, Role::Name) {
            Some(name) => self.text(name),
            None => "",
        }
    }

    /// Is a variable definition's declared type signed?
    pub fn vdef_is_signed(&self, vdef: Node) -> bool {
        matches!(self.vdef_data_type(vdef), "int8" | "int16")
    }

    /// Is a variable definition's declared type primitive?
    pub fn vdef_is_primitive(&self, vdef: Node) -> bool {
        is_primitive(self.vdef_data_type(vdef))
    }

    /// Size in bytes of one element of this definition.
    ///
    /// A pointer is a machine word unless `ignore_pointer` asks for the
    /// pointed-to size (the character-array-through-pointer idiom indexes a
    /// `uint8*` by byte). Function arguments are pushed as machine words
    /// whatever their declared type, and a custom size override wins over
    /// the declared type.
    pub fn vdef_element_size(&self, vdef: Node, ignore_pointer: bool) -> Option<u32> {
        if !ignore_pointer {
            if self.vdef_is_pointer(vdef) {
                return Some(POINTER_SIZE);
            }
            if self.vdef_class(vdef) == VarClass::FunctionArgument {
                return Some(POINTER_SIZE);
            }
            if let Some(custom) = self.vdef_custom_size(vdef) {
                return Some(u32::from(custom));
            }
        }
        let ty = self.vdef_data_type(vdef);
        match primitive_size(ty) {
            Some(s) => Some(s),
            None => {
                let strukt = self.global_struct(ty)?;
                self.struct_size(strukt)
            }
        }
    }

    /// Total declared size of a definition: element size times the product
    /// of its literal array bounds.
    pub fn vdef_size(&self, vdef: Node) -> Option<u32> {
        let mut size = self.vdef_element_size(vdef, false)?;
        let var_iden = self.role(vdef, Role::VarIdentifier)?;
        let mut index = self.role(var_iden, Role::RootArrayIndex);
        while let Some(idx) = index {
            let value = self.role(idx, Role::Value)?;
            if self.kind(value) != NodeKind::Number {
                // Array bounds in declarations are literal integers.
                return None;
            }
            size *= self.text(value).parse::<u32>().ok()?;
            index = self.role(idx, Role::Next);
        }
        Some(size)
    }

    /// Find a globally declared structure by name.
    pub fn global_struct(&self, name: &str) -> Option<Node> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&c| self.kind(c) == NodeKind::Struct && self.struct_name(c) == name)
    }

    /// The declared name of a `STRUCT` node.
    pub fn struct_name(&self, strukt: Node) -> &str {
        match self.role(strukt, Role::Name) {
            Some(n) => self.text(n),
            None => "",
        }
    }

    /// Total size of a structure: members laid out in declaration order with
    /// no padding.
    pub fn struct_size(&self, strukt: Node) -> Option<u32> {
        let body = self.role(strukt, Role::StructBody)?;
        self.scope_declared_size(body)
    }

    /// Byte offset of a member inside its structure: the sum of the sizes of
    /// the members declared before it.
    pub fn member_offset(&self, struct_body: Node, member: Node) -> Option<u32> {
        self.scope_size_until(struct_body, member, false)
    }

    /// The variable definitions declared directly in a scope, in order.
    /// For a `FOR` scope this is the init-clause definition, if any; the
    /// loop body is a scope of its own.
    pub fn declared_vdefs(&self, scope: Node) -> Vec<Node> {
        debug_assert!(self.kind(scope).is_scope());
        if self.kind(scope) == NodeKind::For {
            return match self.role(scope, Role::Init) {
                Some(init) if self.kind(init).is_vdef() => vec![init],
                _ => Vec::new(),
            };
        }
        self.children(scope)
            .iter()
            .copied()
            .filter(|&c| self.kind(c).is_vdef())
            .collect()
    }

    /// Total bytes declared directly in a scope.
    pub fn scope_declared_size(&self, scope: Node) -> Option<u32> {
        let mut size = 0;
        for vdef in self.declared_vdefs(scope) {
            size += self.vdef_size(vdef)?;
        }
        Some(size)
    }

    /// Bytes declared in a scope before reaching `stop` (a child of the
    /// scope, or a node inside one of its children). With `include_stop`,
    /// the declaration containing `stop` is counted too.
    pub fn scope_size_until(&self, scope: Node, stop: Node, include_stop: bool) -> Option<u32> {
        let mut size = 0;
        for vdef in self.declared_vdefs(scope) {
            if self.is_ancestor(vdef, stop) {
                if include_stop {
                    size += self.vdef_size(vdef)?;
                }
                return Some(size);
            }
            size += self.vdef_size(vdef)?;
        }
        Some(size)
    }

    /// Is this scope the top scope of a function frame?
    pub fn is_function_body(&self, scope: Node) -> bool {
        self.kind(scope) == NodeKind::Body
            && self
                .parent(scope)
                .is_some_and(|p| self.kind(p) == NodeKind::Func)
    }

    /// Position of a global variable relative to the start of the `data`
    /// segment: the sum of the sizes of the globals declared before it.
    pub fn global_position(&self, vdef: Node) -> Option<u32> {
        self.scope_size_until(self.root(), vdef, false)
    }

    /// Position of a function-local variable inside its frame.
    ///
    /// The frame lays scopes out outside-in: the function body's
    /// declarations first, then each nested scope's declarations in nesting
    /// order. A local's position is the bytes declared before it in its own
    /// scope, plus the full declared size of every scope between it and the
    /// function body. With `include_self` the variable's own size is added,
    /// which yields the frame-pointer displacement of its last byte
    /// (locals grow downward from the frame pointer).
    pub fn frame_position(&self, vdef: Node, include_self: bool) -> Option<u32> {
        let mut scope = self.scope_of(vdef)?;
        let mut pos = self.scope_size_until(scope, vdef, include_self)?;
        while !self.is_function_body(scope) {
            let outer = self.scope_of(scope)?;
            if self.kind(outer) == NodeKind::Root {
                // Improperly classed variable; treat like a top-level frame.
                break;
            }
            pos += self.scope_declared_size(outer)?;
            scope = outer;
        }
        Some(pos)
    }

    /// Position of a function argument relative to the first argument.
    /// Arguments are pushed by the caller and are each one machine word.
    pub fn argument_position(&self, vdef: Node) -> Option<u32> {
        let args = self.parent(vdef)?;
        let mut pos = 0;
        for &arg in self.children(args) {
            if arg == vdef {
                return Some(pos);
            }
            pos += POINTER_SIZE;
        }
        None
    }

    /// Sum of the declared sizes of every scope from `from` (inclusive)
    /// up to `until` (inclusive), walking enclosing scopes. Used to restore
    /// the stack pointer when control leaves nested scopes.
    pub fn unwind_size(&self, from: Node, until: Node) -> Option<u32> {
        let mut scope = from;
        let mut size = 0;
        loop {
            size += self.scope_declared_size(scope)?;
            if scope == until {
                return Some(size);
            }
            if self.kind(scope) == NodeKind::Root {
                return Some(size);
            }
            scope = self.scope_of(scope)?;
        }
    }

    // ------------------------------------------------------------------
    // Name lookup.
    // ------------------------------------------------------------------

    /// Find the definition a variable use refers to by walking up the scope
    /// chain from the use site. Lookup in each scope stops at the statement
    /// containing the use: definitions never apply above their declaration.
    ///
    /// With `follow_access`, a use carrying a structure access chain
    /// resolves through the chain to the final member definition.
    pub fn resolve_vdef(&self, var_iden: Node, follow_access: bool) -> Option<Node> {
        let name = self.var_name(var_iden).to_string();
        let mut scope = self.scope_of(var_iden)?;
        let found = loop {
            if let Some(vdef) = self.find_vdef_in_scope(scope, &name, Some(var_iden)) {
                break vdef;
            }
            if self.is_function_body(scope) {
                // Function arguments sit beside the body, not above it.
                let func = self.parent(scope)?;
                if let Some(args) = self.role(func, Role::Arguments) {
                    if let Some(vdef) = self.find_vdef_in_scope(args, &name, None) {
                        break vdef;
                    }
                }
            }
            if self.kind(scope) == NodeKind::Root {
                return None;
            }
            scope = self.scope_of(scope)?;
        };
        if follow_access {
            self.follow_struct_access(found, var_iden)
        } else {
            Some(found)
        }
    }

    /// Find a definition by name among a scope's own declarations. When a
    /// use site is given, the scan stops at the declaration-order position
    /// of the use.
    pub fn find_vdef_in_scope(
        &self,
        scope: Node,
        name: &str,
        use_site: Option<Node>,
    ) -> Option<Node> {
        if self.kind(scope) == NodeKind::For {
            let init = self.role(scope, Role::Init)?;
            if self.kind(init).is_vdef() && self.vdef_name(init) == name {
                return Some(init);
            }
            return None;
        }
        for &child in self.children(scope) {
            if self.kind(child).is_vdef() && self.vdef_name(child) == name {
                return Some(child);
            }
            if let Some(site) = use_site {
                if !self.kind(child).is_vdef() && self.is_ancestor(child, site) {
                    // Definitions won't be below the access.
                    return None;
                }
            }
        }
        None
    }

    /// Resolve a use's structure access chain starting from the definition
    /// of its root variable, returning the definition of the final member.
    pub fn follow_struct_access(&self, root_vdef: Node, var_iden: Node) -> Option<Node> {
        let mut vdef = root_vdef;
        let mut use_site = var_iden;
        while let Some(access) = self.role(use_site, Role::StructAccess) {
            if self.kind(vdef) != NodeKind::StructDef {
                return None;
            }
            let tag = self.vdef_data_type(vdef);
            let strukt = self.global_struct(tag)?;
            let body = self.role(strukt, Role::StructBody)?;
            let member_iden = self.role(access, Role::VarIdentifier)?;
            let member_name = self.var_name(member_iden);
            vdef = self.find_vdef_in_scope(body, member_name, None)?;
            use_site = member_iden;
        }
        Some(vdef)
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::TreeBuilder;
    use crate::node::Role;

    #[test]
    fn primitive_sizes() {
        use super::primitive_size;
        assert_eq!(primitive_size("uint8"), Some(1));
        assert_eq!(primitive_size("int8"), Some(1));
        assert_eq!(primitive_size("uint16"), Some(2));
        assert_eq!(primitive_size("int16"), Some(2));
        assert_eq!(primitive_size("Point"), None);
    }

    #[test]
    fn global_positions_are_prefix_sums() {
        let mut b = TreeBuilder::new();
        let a = b.global_var("uint8", "a", None);
        let c = b.global_var("uint16", "c", None);
        let d = b.global_var("uint8", "d", None);
        let t = b.finish();

        assert_eq!(t.global_position(a), Some(0));
        assert_eq!(t.global_position(c), Some(1));
        assert_eq!(t.global_position(d), Some(3));
    }

    #[test]
    fn array_size_is_element_times_bounds() {
        let mut b = TreeBuilder::new();
        let buf = b.global_array("uint16", "buf", &[4, 3]);
        let t = b.finish();
        assert_eq!(t.vdef_size(buf), Some(24));
    }

    #[test]
    fn struct_layout_has_no_padding() {
        let mut b = TreeBuilder::new();
        let strukt = b.struct_decl("P", &[("uint8", "a"), ("uint16", "b"), ("uint8", "c")]);
        let t = b.finish();

        assert_eq!(t.struct_size(strukt), Some(4));
        let body = t.role(strukt, Role::StructBody).unwrap();
        let members = t.declared_vdefs(body);
        assert_eq!(t.member_offset(body, members[0]), Some(0));
        assert_eq!(t.member_offset(body, members[1]), Some(1));
        assert_eq!(t.member_offset(body, members[2]), Some(3));
    }

    #[test]
    fn pointer_to_struct_is_word_sized() {
        let mut b = TreeBuilder::new();
        b.struct_decl("P", &[("uint8", "a"), ("uint16", "b")]);
        let q = b.global_struct_var("P", "q", 1);
        let t = b.finish();
        assert_eq!(t.vdef_size(q), Some(2));
        assert_eq!(t.vdef_element_size(q, false), Some(2));
        assert_eq!(t.vdef_element_size(q, true), Some(3));
    }

    #[test]
    fn local_lookup_walks_scopes() {
        let mut b = TreeBuilder::new();
        b.global_var("uint8", "g", None);
        let a = b.vdef("uint8", "a", None);
        let use_a = b.var("a");
        let use_g = b.var("g");
        let ret = b.ret(Some(use_a));
        let ret2 = b.ret(Some(use_g));
        b.func("int8", "main", vec![], vec![a, ret, ret2]);
        let t = b.finish();

        let found = t.resolve_vdef(use_a, true).unwrap();
        assert_eq!(found, a);
        let g = t.resolve_vdef(use_g, true).unwrap();
        assert_eq!(t.vdef_name(g), "g");
    }

    #[test]
    fn lookup_misses_undeclared() {
        let mut b = TreeBuilder::new();
        let use_x = b.var("x");
        let ret = b.ret(Some(use_x));
        b.func("int8", "main", vec![], vec![ret]);
        let t = b.finish();
        assert_eq!(t.resolve_vdef(use_x, true), None);
    }

    #[test]
    fn struct_access_resolves_member() {
        let mut b = TreeBuilder::new();
        b.struct_decl("P", &[("uint8", "a"), ("uint16", "b")]);
        let p = b.global_struct_var("P", "p", 0);
        let use_pb = b.var_access("p", &[("b", false)]);
        let one = b.number(1);
        let assign = b.assign(use_pb, one);
        b.func("int8", "main", vec![], vec![assign]);
        let t = b.finish();

        let root_def = t.resolve_vdef(use_pb, false).unwrap();
        assert_eq!(root_def, p);
        let member = t.resolve_vdef(use_pb, true).unwrap();
        assert_eq!(t.vdef_name(member), "b");
        assert_eq!(t.vdef_data_type(member), "uint16");
    }

    #[test]
    fn frame_positions_stack_nested_scopes() {
        // main() { uint8 a; if (1) { uint8 b; } uint16 c; }
        let mut b = TreeBuilder::new();
        let a = b.vdef("uint8", "a", None);
        let bv = b.vdef("uint8", "b", None);
        let cond = b.number(1);
        let ifs = b.if_stmt(cond, vec![bv], None, None);
        let c = b.vdef("uint16", "c", None);
        b.func("int8", "main", vec![], vec![a, ifs, c]);
        let t = b.finish();

        // Frame: [a, c] then the if-body [b].
        assert_eq!(t.frame_position(a, true), Some(1));
        assert_eq!(t.frame_position(c, true), Some(3));
        assert_eq!(t.frame_position(bv, true), Some(4));
    }

    #[test]
    fn argument_positions_are_word_slots() {
        let mut b = TreeBuilder::new();
        let x = b.vdef("uint8", "x", None);
        let y = b.vdef("uint16", "y", None);
        let ret = b.ret(None);
        b.func("int8", "f", vec![x, y], vec![ret]);
        let t = b.finish();

        assert_eq!(t.argument_position(x), Some(0));
        assert_eq!(t.argument_position(y), Some(2));
    }
}
