//! The syntax tree arena and its mutation operations.
//!
//! All nodes of a translation unit live in one [`Tree`]. Child links are
//! owning; parent, root and enclosing-scope links are non-owning handle
//! copies that every mutation keeps in sync for the whole affected subtree.
//! Removed nodes stay in the arena (handles are never reused) but are marked
//! removed, lose their parent, and become unreachable from the root.
//!
//! Operations that require a node to be present — removing a non-child,
//! fetching a missing role — fail with [`TreeError`]. These indicate compiler
//! bugs, not user errors, and abort the compilation.

use crate::node::{KindData, NodeData, NodeKind, Role, SourcePos, VarClass};
use crate::entity::{PackedOption, PrimaryMap};
use crate::Node;
use smallvec::SmallVec;

/// A structural failure while operating on the tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The given node is not a child of the given parent.
    #[error("{child} is not a child of {parent}")]
    NotAChild {
        /// The parent that was searched.
        parent: Node,
        /// The node that was expected among its children.
        child: Node,
    },
    /// Attempted to attach a node that already has a parent.
    #[error("{node} is already attached to a parent")]
    AlreadyAttached {
        /// The node that was being attached.
        node: Node,
    },
    /// The operation needs a parent but the node has none.
    #[error("{node} has no parent")]
    NoParent {
        /// The orphan node.
        node: Node,
    },
    /// A role lookup failed on a node that must carry the role.
    #[error("no {role:?} child registered on this {kind} node")]
    MissingRole {
        /// Kind of the node that was queried.
        kind: NodeKind,
        /// The missing role.
        role: Role,
    },
    /// A node has the wrong number of children for its kind.
    #[error("{kind} node has {got} children where {want} were expected")]
    BadArity {
        /// Kind of the offending node.
        kind: NodeKind,
        /// Expected child count.
        want: usize,
        /// Actual child count.
        got: usize,
    },
    /// The `before` sibling passed to an insertion is not a child of the
    /// parent.
    #[error("sibling {before} is not a child of {parent}")]
    BadSibling {
        /// The parent that was searched.
        parent: Node,
        /// The node that was expected to be a sibling.
        before: Node,
    },
}

/// The arena owning every node of one parsed translation unit.
pub struct Tree {
    nodes: PrimaryMap<Node, NodeData>,
    root: Node,
}

impl Tree {
    /// Create a tree holding only a `ROOT` node.
    pub fn new() -> Self {
        let mut nodes: PrimaryMap<Node, NodeData> = PrimaryMap::new();
        let root = nodes.push(NodeData::new(NodeKind::Root, String::new(), SourcePos::NONE));
        nodes[root].root = root.into();
        Self { nodes, root }
    }

    /// The root node.
    pub fn root(&self) -> Node {
        self.root
    }

    /// Allocate a new detached node.
    pub fn make(&mut self, kind: NodeKind, text: impl Into<String>) -> Node {
        self.make_at(kind, text, SourcePos::NONE)
    }

    /// Allocate a new detached node carrying a source position.
    pub fn make_at(&mut self, kind: NodeKind, text: impl Into<String>, pos: SourcePos) -> Node {
        self.nodes.push(NodeData::new(kind, text.into(), pos))
    }

    /// The kind tag of a node.
    pub fn kind(&self, n: Node) -> NodeKind {
        self.nodes[n].kind
    }

    /// The text payload of a node.
    pub fn text(&self, n: Node) -> &str {
        &self.nodes[n].text
    }

    /// Overwrite the text payload of a node.
    pub fn set_text(&mut self, n: Node, text: impl Into<String>) {
        self.nodes[n].text = text.into();
    }

    /// The source position attached to a node, walking down to the first
    /// positioned descendant when the node itself was synthesized.
    pub fn pos(&self, n: Node) -> SourcePos {
        let own = self.nodes[n].pos;
        if own.line != 0 {
            return own;
        }
        for &c in &self.nodes[n].children {
            let p = self.pos(c);
            if p.line != 0 {
                return p;
            }
        }
        own
    }

    /// The ordered children of a node.
    pub fn children(&self, n: Node) -> &[Node] {
        &self.nodes[n].children
    }

    /// The parent of a node, if attached.
    pub fn parent(&self, n: Node) -> Option<Node> {
        self.nodes[n].parent.expand()
    }

    /// The root back-edge of a node. Detached subtrees have none.
    pub fn root_of(&self, n: Node) -> Option<Node> {
        self.nodes[n].root.expand()
    }

    /// The innermost scope node enclosing `n` (not `n` itself).
    pub fn scope_of(&self, n: Node) -> Option<Node> {
        self.nodes[n].scope.expand()
    }

    /// Whether this node was removed from the tree.
    pub fn is_removed(&self, n: Node) -> bool {
        self.nodes[n].removed
    }

    /// The node that logically replaced this one, if any.
    pub fn replacement(&self, n: Node) -> Option<Node> {
        self.nodes[n].replaced_by.expand()
    }

    /// Is `anc` equal to `n` or one of its ancestors?
    pub fn is_ancestor(&self, anc: Node, n: Node) -> bool {
        let mut cur = Some(n);
        while let Some(c) = cur {
            if c == anc {
                return true;
            }
            cur = self.parent(c);
        }
        false
    }

    // ------------------------------------------------------------------
    // Kind-specific payload.
    // ------------------------------------------------------------------

    /// The storage class of a variable definition.
    pub fn vdef_class(&self, n: Node) -> VarClass {
        match self.nodes[n].variant {
            KindData::VDef { class, .. } => class,
            _ => VarClass::Global,
        }
    }

    /// Tag a variable definition with its storage class.
    pub fn set_vdef_class(&mut self, n: Node, class: VarClass) {
        if let KindData::VDef { class: c, .. } = &mut self.nodes[n].variant {
            *c = class;
        }
    }

    /// Pointer depth of a variable definition; 0 means not a pointer.
    pub fn vdef_ptr_depth(&self, n: Node) -> u8 {
        match self.nodes[n].variant {
            KindData::VDef { ptr_depth, .. } => ptr_depth,
            _ => 0,
        }
    }

    /// Is this variable definition a pointer?
    pub fn vdef_is_pointer(&self, n: Node) -> bool {
        self.vdef_ptr_depth(n) > 0
    }

    /// Mark a variable definition as a pointer of the given depth.
    pub fn set_vdef_pointer(&mut self, n: Node, depth: u8) {
        if let KindData::VDef { ptr_depth, .. } = &mut self.nodes[n].variant {
            *ptr_depth = depth;
        }
    }

    /// Size override on a variable definition, in bytes.
    pub fn vdef_custom_size(&self, n: Node) -> Option<u16> {
        match self.nodes[n].variant {
            KindData::VDef { custom_size, .. } => custom_size,
            _ => None,
        }
    }

    /// Override the data type size of a variable definition.
    pub fn set_vdef_custom_size(&mut self, n: Node, size: u16) {
        if let KindData::VDef { custom_size, .. } = &mut self.nodes[n].variant {
            *custom_size = Some(size);
        }
    }

    /// The defining `V_DEF` attached to a variable use by the improver.
    pub fn var_def(&self, n: Node) -> Option<Node> {
        match self.nodes[n].variant {
            KindData::VarUse { def } => def.expand(),
            _ => None,
        }
    }

    /// Attach the defining `V_DEF` to a variable use.
    pub fn set_var_def(&mut self, n: Node, vdef: Node) {
        if let KindData::VarUse { def } = &mut self.nodes[n].variant {
            *def = vdef.into();
        }
    }

    /// Dereference depth of a `PTR` node.
    pub fn ptr_depth(&self, n: Node) -> u8 {
        match self.nodes[n].variant {
            KindData::Ptr { depth } => depth,
            _ => 0,
        }
    }

    /// Set the dereference depth of a `PTR` node.
    pub fn set_ptr_depth(&mut self, n: Node, depth: u8) {
        if let KindData::Ptr { depth: d } = &mut self.nodes[n].variant {
            *d = depth;
        }
    }

    /// Does this `STRUCT_ACCESS` node access through a pointer (`->`)?
    pub fn access_as_pointer(&self, n: Node) -> bool {
        match self.nodes[n].variant {
            KindData::StructAccess { as_pointer } => as_pointer,
            _ => false,
        }
    }

    /// Mark a `STRUCT_ACCESS` node as accessing through a pointer.
    pub fn set_access_as_pointer(&mut self, n: Node, as_pointer: bool) {
        if let KindData::StructAccess { as_pointer: p } = &mut self.nodes[n].variant {
            *p = as_pointer;
        }
    }

    // ------------------------------------------------------------------
    // Role-named children.
    // ------------------------------------------------------------------

    /// Look up a role-named child.
    pub fn role(&self, n: Node, role: Role) -> Option<Node> {
        self.nodes[n]
            .roles
            .iter()
            .find(|&&(r, _)| r == role)
            .map(|&(_, c)| c)
    }

    /// Look up a role-named child that the node's kind requires.
    pub fn required_role(&self, n: Node, role: Role) -> Result<Node, TreeError> {
        self.role(n, role).ok_or(TreeError::MissingRole {
            kind: self.kind(n),
            role,
        })
    }

    /// Register `child` under `role` on `n`, also appending it to the
    /// ordered child list. Replaces the previous holder of the role if any.
    pub fn set_role(&mut self, n: Node, role: Role, child: Node) -> Result<(), TreeError> {
        if let Some(old) = self.role(n, role) {
            self.replace_child(n, old, child)?;
            return Ok(());
        }
        self.add_child(n, child)?;
        self.nodes[n].roles.push((role, child));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation.
    // ------------------------------------------------------------------

    /// Append a detached node to `parent`'s children.
    pub fn add_child(&mut self, parent: Node, child: Node) -> Result<(), TreeError> {
        self.add_child_opts(parent, child, None, false)
    }

    /// Insert a detached node into `parent`'s children, optionally before an
    /// existing sibling. With `force`, an already-attached child is detached
    /// from its previous parent first.
    pub fn add_child_opts(
        &mut self,
        parent: Node,
        child: Node,
        before: Option<Node>,
        force: bool,
    ) -> Result<(), TreeError> {
        if self.nodes[child].parent.is_some() {
            if !force {
                return Err(TreeError::AlreadyAttached { node: child });
            }
            let old_parent = self.nodes[child].parent.expand().unwrap_or(child);
            self.detach(old_parent, child)?;
        }
        match before {
            None => self.nodes[parent].children.push(child),
            Some(b) => {
                let idx = self
                    .child_index(parent, b)
                    .ok_or(TreeError::BadSibling { parent, before: b })?;
                self.nodes[parent].children.insert(idx, child);
            }
        }
        self.nodes[child].parent = parent.into();
        self.nodes[child].removed = false;
        self.refresh_back_edges(child);
        Ok(())
    }

    /// Replace `old` (a child of `parent`) with the detached node `new`,
    /// preserving position and any role registration.
    pub fn replace_child(&mut self, parent: Node, old: Node, new: Node) -> Result<(), TreeError> {
        if self.nodes[new].parent.is_some() {
            return Err(TreeError::AlreadyAttached { node: new });
        }
        let idx = self
            .child_index(parent, old)
            .ok_or(TreeError::NotAChild { parent, child: old })?;
        self.nodes[parent].children[idx] = new;
        for entry in self.nodes[parent].roles.iter_mut() {
            if entry.1 == old {
                entry.1 = new;
            }
        }
        self.orphan(old);
        self.nodes[new].parent = parent.into();
        self.refresh_back_edges(new);
        Ok(())
    }

    /// Replace this node with the detached node `new` in its parent's child
    /// list, recording the replacement on the old node.
    pub fn replace_self(&mut self, n: Node, new: Node) -> Result<(), TreeError> {
        let parent = self.parent(n).ok_or(TreeError::NoParent { node: n })?;
        self.replace_child(parent, n, new)?;
        self.nodes[n].replaced_by = new.into();
        Ok(())
    }

    /// Remove `child` from `parent`, marking it removed.
    pub fn remove_child(&mut self, parent: Node, child: Node) -> Result<(), TreeError> {
        let idx = self
            .child_index(parent, child)
            .ok_or(TreeError::NotAChild { parent, child })?;
        self.nodes[parent].children.remove(idx);
        self.nodes[parent].roles.retain(|&mut (_, c)| c != child);
        self.orphan(child);
        Ok(())
    }

    /// Remove this node from its parent.
    pub fn remove_self(&mut self, n: Node) -> Result<(), TreeError> {
        let parent = self.parent(n).ok_or(TreeError::NoParent { node: n })?;
        self.remove_child(parent, n)
    }

    /// Replace this node with its own children, spliced into the parent at
    /// the node's position in order.
    pub fn replace_with_children(&mut self, n: Node) -> Result<(), TreeError> {
        let parent = self.parent(n).ok_or(TreeError::NoParent { node: n })?;
        let idx = self
            .child_index(parent, n)
            .ok_or(TreeError::NotAChild { parent, child: n })?;
        let children: Vec<Node> = core::mem::take(&mut self.nodes[n].children);
        self.nodes[n].roles.clear();
        self.nodes[parent].children.remove(idx);
        self.nodes[parent].roles.retain(|&mut (_, c)| c != n);
        for (i, &c) in children.iter().enumerate() {
            self.nodes[parent].children.insert(idx + i, c);
            self.nodes[c].parent = parent.into();
        }
        self.orphan(n);
        for &c in &children {
            self.refresh_back_edges(c);
        }
        Ok(())
    }

    /// Deep-clone the subtree rooted at `n`. Role registrations are mapped
    /// onto the cloned children; the clone is detached.
    pub fn clone_subtree(&mut self, n: Node) -> Node {
        let kind = self.kind(n);
        let text = self.nodes[n].text.clone();
        let pos = self.nodes[n].pos;
        let variant = self.nodes[n].variant.clone();
        let children = self.nodes[n].children.clone();
        let roles = self.nodes[n].roles.clone();

        let clone = self.make_at(kind, text, pos);
        self.nodes[clone].variant = variant;

        let mut mapped: SmallVec<[(Node, Node); 8]> = SmallVec::new();
        for c in children {
            let cc = self.clone_subtree(c);
            mapped.push((c, cc));
            self.nodes[clone].children.push(cc);
            self.nodes[cc].parent = clone.into();
        }
        for (role, old) in roles {
            if let Some(&(_, new)) = mapped.iter().find(|&&(o, _)| o == old) {
                self.nodes[clone].roles.push((role, new));
            }
        }
        clone
    }

    /// Collapse degenerate forms after a mutation. A binary expression with
    /// one child becomes that child; with zero children it removes itself.
    pub fn rebuild(&mut self, n: Node) -> Result<(), TreeError> {
        if self.kind(n) != NodeKind::Expr {
            return Ok(());
        }
        match self.nodes[n].children.len() {
            1 => {
                let only = self.nodes[n].children[0];
                self.detach(n, only)?;
                self.replace_self(n, only)
            }
            0 => self.remove_self(n),
            _ => Ok(()),
        }
    }

    /// Check per-kind structural invariants of the subtree rooted at `n`.
    pub fn validity_check(&self, n: Node) -> Result<(), TreeError> {
        match self.kind(n) {
            NodeKind::Expr => {
                let got = self.children(n).len();
                if got != 2 {
                    return Err(TreeError::BadArity {
                        kind: NodeKind::Expr,
                        want: 2,
                        got,
                    });
                }
            }
            NodeKind::VDef | NodeKind::StructDef => {
                self.required_role(n, Role::DataType)?;
                self.required_role(n, Role::VarIdentifier)?;
            }
            NodeKind::VarIdentifier => {
                self.required_role(n, Role::Name)?;
            }
            NodeKind::ArrayIndex => {
                self.required_role(n, Role::Value)?;
            }
            _ => {}
        }
        for &c in self.children(n) {
            self.validity_check(c)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search.
    // ------------------------------------------------------------------

    /// The first direct child of the given kind.
    pub fn first_child_of_kind(&self, n: Node, kind: NodeKind) -> Option<Node> {
        self.children(n).iter().copied().find(|&c| self.kind(c) == kind)
    }

    /// Does the node have a direct child of the given kind?
    pub fn has_child_of_kind(&self, n: Node, kind: NodeKind) -> bool {
        self.first_child_of_kind(n, kind).is_some()
    }

    /// Count direct children matching a predicate.
    pub fn count_children(&self, n: Node, mut pred: impl FnMut(Node) -> bool) -> usize {
        self.children(n).iter().filter(|&&c| pred(c)).count()
    }

    /// Walk up from `n` (inclusive) until a node of the given kind is found.
    pub fn look_up_until_kind(&self, n: Node, kind: NodeKind) -> Option<Node> {
        let mut cur = Some(n);
        while let Some(c) = cur {
            if self.kind(c) == kind {
                return Some(c);
            }
            cur = self.parent(c);
        }
        None
    }

    /// Preorder search for the first descendant of the given kind,
    /// excluding `n` itself.
    pub fn look_down_first_of_kind(&self, n: Node, kind: NodeKind) -> Option<Node> {
        for &c in self.children(n) {
            if self.kind(c) == kind {
                return Some(c);
            }
            if let Some(hit) = self.look_down_first_of_kind(c, kind) {
                return Some(hit);
            }
        }
        None
    }

    /// Preorder search for the last descendant of the given kind.
    pub fn look_down_last_of_kind(&self, n: Node, kind: NodeKind) -> Option<Node> {
        let mut last = None;
        self.walk(n, &mut |c| {
            if c != n && self.kind(c) == kind {
                last = Some(c);
            }
        });
        last
    }

    /// Preorder traversal of the subtree rooted at `n`, including `n`.
    pub fn walk(&self, n: Node, f: &mut impl FnMut(Node)) {
        f(n);
        // Children may be mutated by callers between walks, so clone the
        // slice handle up front.
        let children = self.nodes[n].children.clone();
        for c in children {
            self.walk(c, f);
        }
    }

    // ------------------------------------------------------------------
    // Internals.
    // ------------------------------------------------------------------

    fn child_index(&self, parent: Node, child: Node) -> Option<usize> {
        self.nodes[parent].children.iter().position(|&c| c == child)
    }

    /// Detach `child` from `parent` without marking it removed; used when the
    /// child is about to be re-attached elsewhere.
    fn detach(&mut self, parent: Node, child: Node) -> Result<(), TreeError> {
        let idx = self
            .child_index(parent, child)
            .ok_or(TreeError::NotAChild { parent, child })?;
        self.nodes[parent].children.remove(idx);
        self.nodes[parent].roles.retain(|&mut (_, c)| c != child);
        self.nodes[child].parent = Default::default();
        Ok(())
    }

    /// Clear back-edges and mark removed.
    fn orphan(&mut self, n: Node) {
        let data = &mut self.nodes[n];
        data.parent = Default::default();
        data.root = Default::default();
        data.scope = Default::default();
        data.removed = true;
    }

    /// Recompute the root and enclosing-scope back-edges of `n` and all its
    /// descendants from `n`'s parent.
    pub(crate) fn refresh_back_edges(&mut self, n: Node) {
        let parent = match self.parent(n) {
            Some(p) => p,
            None => return,
        };
        let root = self.nodes[parent].root;
        let scope: PackedOption<Node> = if self.kind(parent).is_scope() {
            parent.into()
        } else {
            self.nodes[parent].scope
        };
        self.refresh_down(n, root, scope);
    }

    fn refresh_down(&mut self, n: Node, root: PackedOption<Node>, scope: PackedOption<Node>) {
        self.nodes[n].root = root;
        self.nodes[n].scope = scope;
        self.nodes[n].removed = false;
        let child_scope: PackedOption<Node> = if self.kind(n).is_scope() {
            n.into()
        } else {
            scope
        };
        let children = self.nodes[n].children.clone();
        for c in children {
            self.refresh_down(c, root, child_scope);
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, Role};

    fn leaf(t: &mut Tree, text: &str) -> Node {
        t.make(NodeKind::Number, text)
    }

    #[test]
    fn add_child_sets_back_edges() {
        let mut t = Tree::new();
        let body = t.make(NodeKind::Body, "");
        let a = leaf(&mut t, "1");
        t.add_child(t.root(), body).unwrap();
        t.add_child(body, a).unwrap();

        assert_eq!(t.parent(a), Some(body));
        assert_eq!(t.root_of(a), Some(t.root()));
        // The nearest scope of a node inside a body is that body; the body's
        // own scope is the root.
        assert_eq!(t.scope_of(a), Some(body));
        assert_eq!(t.scope_of(body), Some(t.root()));
    }

    #[test]
    fn add_child_twice_is_an_error() {
        let mut t = Tree::new();
        let a = leaf(&mut t, "1");
        t.add_child(t.root(), a).unwrap();
        assert_eq!(
            t.add_child(t.root(), a),
            Err(TreeError::AlreadyAttached { node: a })
        );
    }

    #[test]
    fn insert_before_sibling() {
        let mut t = Tree::new();
        let a = leaf(&mut t, "1");
        let b = leaf(&mut t, "2");
        let c = leaf(&mut t, "3");
        t.add_child(t.root(), a).unwrap();
        t.add_child(t.root(), c).unwrap();
        t.add_child_opts(t.root(), b, Some(c), false).unwrap();
        let texts: Vec<_> = t.children(t.root()).iter().map(|&n| t.text(n)).collect();
        assert_eq!(texts, ["1", "2", "3"]);
    }

    #[test]
    fn replace_self_records_replacement() {
        let mut t = Tree::new();
        let a = leaf(&mut t, "1");
        let b = leaf(&mut t, "2");
        t.add_child(t.root(), a).unwrap();
        t.replace_self(a, b).unwrap();

        assert_eq!(t.replacement(a), Some(b));
        assert!(t.is_removed(a));
        assert_eq!(t.parent(a), None);
        assert_eq!(t.children(t.root()), [b]);
        assert_eq!(t.root_of(b), Some(t.root()));
    }

    #[test]
    fn remove_self_clears_parent() {
        let mut t = Tree::new();
        let a = leaf(&mut t, "1");
        t.add_child(t.root(), a).unwrap();
        t.remove_self(a).unwrap();
        assert!(t.is_removed(a));
        assert_eq!(t.parent(a), None);
        assert!(t.children(t.root()).is_empty());
    }

    #[test]
    fn remove_non_child_is_an_error() {
        let mut t = Tree::new();
        let a = leaf(&mut t, "1");
        let b = leaf(&mut t, "2");
        t.add_child(t.root(), a).unwrap();
        assert_eq!(
            t.remove_child(a, b),
            Err(TreeError::NotAChild { parent: a, child: b })
        );
    }

    #[test]
    fn replace_with_children_splices_in_order() {
        let mut t = Tree::new();
        let head = leaf(&mut t, "0");
        let holder = t.make(NodeKind::Body, "");
        let a = leaf(&mut t, "1");
        let b = leaf(&mut t, "2");
        let tail = leaf(&mut t, "3");
        t.add_child(t.root(), head).unwrap();
        t.add_child(t.root(), holder).unwrap();
        t.add_child(t.root(), tail).unwrap();
        t.add_child(holder, a).unwrap();
        t.add_child(holder, b).unwrap();

        t.replace_with_children(holder).unwrap();
        let texts: Vec<_> = t.children(t.root()).iter().map(|&n| t.text(n)).collect();
        assert_eq!(texts, ["0", "1", "2", "3"]);
        assert!(t.is_removed(holder));
        assert_eq!(t.parent(a), Some(t.root()));
        // The spliced children left the body scope, so their scope pointer
        // must now be the root.
        assert_eq!(t.scope_of(a), Some(t.root()));
    }

    #[test]
    fn rebuild_collapses_single_child_expression() {
        let mut t = Tree::new();
        let e = t.make(NodeKind::Expr, "+");
        let n = leaf(&mut t, "5");
        t.add_child(t.root(), e).unwrap();
        t.add_child(e, n).unwrap();

        t.rebuild(e).unwrap();
        assert_eq!(t.children(t.root()), [n]);
        assert_eq!(t.replacement(e), Some(n));
    }

    #[test]
    fn rebuild_removes_empty_expression() {
        let mut t = Tree::new();
        let e = t.make(NodeKind::Expr, "+");
        t.add_child(t.root(), e).unwrap();
        t.rebuild(e).unwrap();
        assert!(t.is_removed(e));
        assert!(t.children(t.root()).is_empty());
    }

    #[test]
    fn validity_check_rejects_one_child_expression() {
        let mut t = Tree::new();
        let e = t.make(NodeKind::Expr, "+");
        let n = leaf(&mut t, "5");
        t.add_child(t.root(), e).unwrap();
        t.add_child(e, n).unwrap();
        assert_eq!(
            t.validity_check(t.root()),
            Err(TreeError::BadArity {
                kind: NodeKind::Expr,
                want: 2,
                got: 1
            })
        );
    }

    #[test]
    fn roles_follow_replacement() {
        let mut t = Tree::new();
        let vdef = t.make(NodeKind::VDef, "");
        let ty = t.make(NodeKind::Keyword, "uint8");
        let ty2 = t.make(NodeKind::Keyword, "uint16");
        t.add_child(t.root(), vdef).unwrap();
        t.set_role(vdef, Role::DataType, ty).unwrap();
        assert_eq!(t.role(vdef, Role::DataType), Some(ty));

        t.replace_child(vdef, ty, ty2).unwrap();
        assert_eq!(t.role(vdef, Role::DataType), Some(ty2));
    }

    #[test]
    fn clone_subtree_copies_roles() {
        let mut t = Tree::new();
        let vdef = t.make(NodeKind::VDef, "");
        let ty = t.make(NodeKind::Keyword, "uint8");
        t.add_child(t.root(), vdef).unwrap();
        t.set_role(vdef, Role::DataType, ty).unwrap();

        let clone = t.clone_subtree(vdef);
        assert_ne!(clone, vdef);
        assert_eq!(t.parent(clone), None);
        let cloned_ty = t.role(clone, Role::DataType).unwrap();
        assert_ne!(cloned_ty, ty);
        assert_eq!(t.text(cloned_ty), "uint8");
    }

    #[test]
    fn parent_child_agreement_after_mutations() {
        // Universal invariant: for every reachable node, the parent's child
        // list contains it.
        let mut t = Tree::new();
        let body = t.make(NodeKind::Body, "");
        let e = t.make(NodeKind::Expr, "+");
        let l = leaf(&mut t, "1");
        let r = leaf(&mut t, "2");
        t.add_child(t.root(), body).unwrap();
        t.add_child(body, e).unwrap();
        t.add_child(e, l).unwrap();
        t.add_child(e, r).unwrap();

        t.remove_child(e, l).unwrap();
        let l2 = leaf(&mut t, "3");
        t.add_child_opts(e, l2, Some(r), false).unwrap();

        t.walk(t.root(), &mut |n| {
            if let Some(p) = t.parent(n) {
                assert!(t.children(p).contains(&n), "{n} missing from {p}");
            }
            if n != t.root() {
                assert_eq!(t.root_of(n), Some(t.root()));
            }
        });
    }
}
