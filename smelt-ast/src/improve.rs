//! The tree improver.
//!
//! The parser hands over a tree in which variable uses do not yet know their
//! definitions and variable definitions do not know their storage class.
//! The improver runs once, after preprocessing and before validation, and
//! fixes that up: it tags every definition with its class, attaches the
//! defining `V_DEF` to every resolvable use (including the members of a
//! structure access chain), and canonicalises expressions so that no
//! degenerate `E` node survives into later phases.

use crate::node::{NodeKind, Role, VarClass};
use crate::tree::TreeError;
use crate::{Node, Tree};

/// One-shot improvement pass over a parsed tree.
pub struct TreeImprover<'t> {
    tree: &'t mut Tree,
    /// Structure declarations currently entered, innermost last. Member
    /// identifiers resolve against these before the global scope.
    struct_stack: Vec<Node>,
    current_class: VarClass,
}

impl<'t> TreeImprover<'t> {
    /// Create an improver for the given tree.
    pub fn new(tree: &'t mut Tree) -> Self {
        Self {
            tree,
            struct_stack: Vec::new(),
            current_class: VarClass::Global,
        }
    }

    /// Run the pass.
    pub fn improve(&mut self) -> Result<(), TreeError> {
        log::debug!("improving tree");
        let top: Vec<Node> = self.tree.children(self.tree.root()).to_vec();
        for child in top {
            self.improve_branch(child)?;
        }
        Ok(())
    }

    fn improve_branch(&mut self, n: Node) -> Result<(), TreeError> {
        if self.tree.is_removed(n) {
            // A rebuild may have collapsed this node away already.
            return Ok(());
        }
        match self.tree.kind(n) {
            NodeKind::Func => self.improve_func(n),
            NodeKind::FuncDef => self.improve_args(n),
            NodeKind::Body => self.improve_children(n),
            NodeKind::VDef | NodeKind::StructDef => self.improve_vdef(n),
            NodeKind::Struct => self.improve_struct(n),
            NodeKind::VarIdentifier => self.improve_var_iden(n),
            NodeKind::Expr => self.improve_expression(n),
            NodeKind::Assign => {
                self.improve_role(n, Role::VarIdentifier)?;
                self.improve_role(n, Role::Value)
            }
            NodeKind::FuncCall => {
                let args = self.tree.required_role(n, Role::Arguments)?;
                self.improve_children(args)
            }
            NodeKind::Return => self.improve_role_opt(n, Role::Exp),
            NodeKind::Ptr => self.improve_role(n, Role::Exp),
            NodeKind::AddressOf => self.improve_role(n, Role::VarIdentifier),
            NodeKind::LogicalNot => self.improve_role(n, Role::Subject),
            NodeKind::If => {
                self.improve_role(n, Role::Cond)?;
                self.improve_role(n, Role::Body)?;
                self.improve_role_opt(n, Role::ElseIf)?;
                if let Some(els) = self.tree.role(n, Role::Else) {
                    self.improve_role(els, Role::Body)?;
                }
                Ok(())
            }
            NodeKind::While => {
                self.improve_role(n, Role::Cond)?;
                self.improve_role(n, Role::Body)
            }
            NodeKind::For => {
                self.improve_role(n, Role::Init)?;
                self.improve_role(n, Role::Cond)?;
                self.improve_role(n, Role::Loop)?;
                self.improve_role(n, Role::Body)
            }
            NodeKind::Asm => {
                let args = self.tree.required_role(n, Role::AsmArgs)?;
                for arg in self.tree.children(args).to_vec() {
                    self.improve_role(arg, Role::Value)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn improve_children(&mut self, n: Node) -> Result<(), TreeError> {
        for child in self.tree.children(n).to_vec() {
            self.improve_branch(child)?;
        }
        Ok(())
    }

    fn improve_role(&mut self, n: Node, role: Role) -> Result<(), TreeError> {
        let child = self.tree.required_role(n, role)?;
        self.improve_branch(child)
    }

    fn improve_role_opt(&mut self, n: Node, role: Role) -> Result<(), TreeError> {
        match self.tree.role(n, role) {
            Some(child) => self.improve_branch(child),
            None => Ok(()),
        }
    }

    fn improve_func(&mut self, n: Node) -> Result<(), TreeError> {
        self.improve_args(n)?;
        let saved = self.current_class;
        self.current_class = VarClass::FunctionLocal;
        self.improve_role(n, Role::Body)?;
        self.current_class = saved;
        Ok(())
    }

    fn improve_args(&mut self, n: Node) -> Result<(), TreeError> {
        let args = self.tree.required_role(n, Role::Arguments)?;
        for arg in self.tree.children(args).to_vec() {
            if self.tree.kind(arg).is_vdef() {
                self.tree.set_vdef_class(arg, VarClass::FunctionArgument);
            }
        }
        Ok(())
    }

    fn improve_vdef(&mut self, n: Node) -> Result<(), TreeError> {
        self.tree.set_vdef_class(n, self.current_class);
        // Array bound expressions in the declaration may still be trees.
        let iden = self.tree.required_role(n, Role::VarIdentifier)?;
        let mut index = self.tree.role(iden, Role::RootArrayIndex);
        while let Some(idx) = index {
            self.improve_role(idx, Role::Value)?;
            index = self.tree.role(idx, Role::Next);
        }
        self.improve_role_opt(n, Role::ValueExp)
    }

    fn improve_struct(&mut self, n: Node) -> Result<(), TreeError> {
        self.struct_stack.push(n);
        let r = self.improve_role(n, Role::StructBody);
        self.struct_stack.pop();
        r
    }

    /// Attach the defining `V_DEF` to a use, then walk its structure access
    /// chain attaching member definitions and improving index expressions.
    fn improve_var_iden(&mut self, n: Node) -> Result<(), TreeError> {
        self.improve_indexes(n)?;

        let root_def = match self.resolve_use(n) {
            Some(d) => d,
            // Unresolved uses are reported by the semantic validator; the
            // improver leaves them untouched.
            None => return Ok(()),
        };
        self.tree.set_var_def(n, root_def);

        let mut vdef = root_def;
        let mut use_site = n;
        while let Some(access) = self.tree.role(use_site, Role::StructAccess) {
            let member_iden = self.tree.required_role(access, Role::VarIdentifier)?;
            self.improve_indexes(member_iden)?;
            let tag = self.tree.vdef_data_type(vdef).to_string();
            let member = self
                .tree
                .global_struct(&tag)
                .and_then(|s| self.tree.role(s, Role::StructBody))
                .and_then(|body| {
                    let name = self.tree.var_name(member_iden).to_string();
                    self.tree.find_vdef_in_scope(body, &name, None)
                });
            match member {
                Some(m) => {
                    self.tree.set_var_def(member_iden, m);
                    vdef = m;
                    use_site = member_iden;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn improve_indexes(&mut self, var_iden: Node) -> Result<(), TreeError> {
        let mut index = self.tree.role(var_iden, Role::RootArrayIndex);
        while let Some(idx) = index {
            self.improve_role(idx, Role::Value)?;
            index = self.tree.role(idx, Role::Next);
        }
        Ok(())
    }

    /// Resolve a use against the entered structure declarations first, then
    /// the lexical scope chain.
    fn resolve_use(&self, n: Node) -> Option<Node> {
        let name = self.tree.var_name(n).to_string();
        for &strukt in self.struct_stack.iter().rev() {
            if let Some(body) = self.tree.role(strukt, Role::StructBody) {
                if let Some(d) = self.tree.find_vdef_in_scope(body, &name, None) {
                    return Some(d);
                }
            }
        }
        self.tree.resolve_vdef(n, false)
    }

    /// Canonicalise an expression node: collapse degenerate forms, then
    /// improve whatever the node became.
    fn improve_expression(&mut self, n: Node) -> Result<(), TreeError> {
        match self.tree.children(n).len() {
            2 => self.improve_children(n),
            _ => {
                self.tree.rebuild(n)?;
                match self.tree.replacement(n) {
                    Some(r) => self.improve_branch(r),
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;

    #[test]
    fn classes_are_assigned() {
        let mut b = TreeBuilder::new();
        let g = b.global_var("uint8", "g", None);
        let arg = b.vdef("uint8", "x", None);
        let local = b.vdef("uint8", "a", None);
        let ret = b.ret(None);
        b.func("int8", "f", vec![arg], vec![local, ret]);
        let mut t = b.finish();

        TreeImprover::new(&mut t).improve().unwrap();
        assert_eq!(t.vdef_class(g), VarClass::Global);
        assert_eq!(t.vdef_class(arg), VarClass::FunctionArgument);
        assert_eq!(t.vdef_class(local), VarClass::FunctionLocal);
    }

    #[test]
    fn uses_get_definitions_attached() {
        let mut b = TreeBuilder::new();
        let local = b.vdef("uint8", "a", None);
        let use_a = b.var("a");
        let ret = b.ret(Some(use_a));
        b.func("int8", "f", vec![], vec![local, ret]);
        let mut t = b.finish();

        TreeImprover::new(&mut t).improve().unwrap();
        assert_eq!(t.var_def(use_a), Some(local));
    }

    #[test]
    fn argument_uses_resolve() {
        let mut b = TreeBuilder::new();
        let arg = b.vdef("uint8", "x", None);
        let use_x = b.var("x");
        let ret = b.ret(Some(use_x));
        b.func("int8", "f", vec![arg], vec![ret]);
        let mut t = b.finish();

        TreeImprover::new(&mut t).improve().unwrap();
        assert_eq!(t.var_def(use_x), Some(arg));
    }

    #[test]
    fn member_uses_resolve_through_chain() {
        let mut b = TreeBuilder::new();
        b.struct_decl("P", &[("uint8", "a"), ("uint16", "b")]);
        b.global_struct_var("P", "p", 0);
        let use_pb = b.var_access("p", &[("b", false)]);
        let one = b.number(1);
        let assign = b.assign(use_pb, one);
        b.func("int8", "main", vec![], vec![assign]);
        let mut t = b.finish();

        TreeImprover::new(&mut t).improve().unwrap();
        let access = t.role(use_pb, Role::StructAccess).unwrap();
        let member_iden = t.role(access, Role::VarIdentifier).unwrap();
        let member_def = t.var_def(member_iden).unwrap();
        assert_eq!(t.vdef_name(member_def), "b");
    }

    #[test]
    fn degenerate_expression_is_collapsed() {
        let mut b = TreeBuilder::new();
        let five = b.number(5);
        // Build an E node with a single child, as a sloppy front end might.
        let e = b.tree_mut().make(NodeKind::Expr, "+");
        b.tree_mut().add_child(e, five).unwrap();
        let ret = b.ret(Some(e));
        b.func("int8", "f", vec![], vec![ret]);
        let mut t = b.finish();

        TreeImprover::new(&mut t).improve().unwrap();
        assert_eq!(t.replacement(e), Some(five));
        assert_eq!(t.role(ret, Role::Exp), Some(five));
    }
}
