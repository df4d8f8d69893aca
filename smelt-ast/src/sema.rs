//! The semantic validator.
//!
//! Runs on the improved tree and checks everything that must hold before
//! code generation: names resolve, nothing is declared twice, structure
//! accesses name real members, referenced structure tags exist. Problems
//! are collected as diagnostics so a single run reports as much as it can;
//! only a `Fatal` diagnostic (redeclaring a function) stops the pass.

use crate::diag::Diagnostics;
use crate::node::{NodeKind, Role, VarClass};
use crate::{Node, Tree};
use rustc_hash::FxHashMap;

/// Raised internally to unwind the pass after a fatal diagnostic.
struct FatalError;

/// Validates an improved tree.
pub struct SemanticValidator<'t> {
    tree: &'t Tree,
    functions: FxHashMap<String, Node>,
    diags: Diagnostics,
}

impl<'t> SemanticValidator<'t> {
    /// Create a validator for the given tree.
    pub fn new(tree: &'t Tree) -> Self {
        Self {
            tree,
            functions: FxHashMap::default(),
            diags: Diagnostics::new(),
        }
    }

    /// Run validation and return the collected diagnostics.
    pub fn validate(mut self) -> Diagnostics {
        log::debug!("validating tree");
        let top: Vec<Node> = self.tree.children(self.tree.root()).to_vec();
        for child in top {
            if self.validate_part(child).is_err() {
                break;
            }
        }
        self.diags
    }

    fn validate_part(&mut self, n: Node) -> Result<(), FatalError> {
        match self.tree.kind(n) {
            NodeKind::Func => self.validate_function(n),
            NodeKind::FuncDef => self.register_function(n),
            NodeKind::Body => self.validate_children(n),
            NodeKind::VDef => self.validate_vdef(n),
            NodeKind::StructDef => self.validate_struct_def(n),
            NodeKind::Struct => self.validate_struct(n),
            NodeKind::VarIdentifier => {
                self.validate_var_access(n);
                Ok(())
            }
            NodeKind::Assign => self.validate_assignment(n),
            NodeKind::Expr => self.validate_children(n),
            NodeKind::FuncCall => {
                if let Some(args) = self.tree.role(n, Role::Arguments) {
                    self.validate_children(args)?;
                }
                Ok(())
            }
            NodeKind::Return => self.validate_role_opt(n, Role::Exp),
            NodeKind::Ptr => self.validate_role_opt(n, Role::Exp),
            NodeKind::AddressOf => self.validate_role_opt(n, Role::VarIdentifier),
            NodeKind::LogicalNot => self.validate_role_opt(n, Role::Subject),
            NodeKind::If => {
                self.validate_role_opt(n, Role::Cond)?;
                self.validate_role_opt(n, Role::Body)?;
                self.validate_role_opt(n, Role::ElseIf)?;
                if let Some(els) = self.tree.role(n, Role::Else) {
                    self.validate_role_opt(els, Role::Body)?;
                }
                Ok(())
            }
            NodeKind::While => {
                self.validate_role_opt(n, Role::Cond)?;
                self.validate_role_opt(n, Role::Body)
            }
            NodeKind::For => {
                self.validate_role_opt(n, Role::Init)?;
                self.validate_role_opt(n, Role::Cond)?;
                self.validate_role_opt(n, Role::Loop)?;
                self.validate_role_opt(n, Role::Body)
            }
            _ => Ok(()),
        }
    }

    fn validate_children(&mut self, n: Node) -> Result<(), FatalError> {
        for child in self.tree.children(n).to_vec() {
            self.validate_part(child)?;
        }
        Ok(())
    }

    fn validate_role_opt(&mut self, n: Node, role: Role) -> Result<(), FatalError> {
        match self.tree.role(n, role) {
            Some(child) => self.validate_part(child),
            None => Ok(()),
        }
    }

    fn validate_function(&mut self, n: Node) -> Result<(), FatalError> {
        self.register_function(n)?;
        if let Some(args) = self.tree.role(n, Role::Arguments) {
            self.validate_children(args)?;
        }
        self.validate_role_opt(n, Role::Body)
    }

    /// Function names share one global registry; declaring one twice is not
    /// recoverable.
    fn register_function(&mut self, n: Node) -> Result<(), FatalError> {
        let name = match self.tree.role(n, Role::Name) {
            Some(name) => self.tree.text(name).to_string(),
            None => return Ok(()),
        };
        if self.functions.contains_key(&name) {
            self.diags.fatal(
                format!(
                    "the function \"{name}\" has already been declared but is being redeclared"
                ),
                self.tree.pos(n),
            );
            return Err(FatalError);
        }
        self.functions.insert(name, n);
        Ok(())
    }

    /// No two definitions may share a name within one scope. Arguments form
    /// their own namespace beside the function body.
    fn validate_vdef(&mut self, n: Node) -> Result<(), FatalError> {
        let name = self.tree.vdef_name(n).to_string();
        let siblings: Vec<Node> = if self.tree.vdef_class(n) == VarClass::FunctionArgument {
            match self.tree.parent(n) {
                Some(args) => self
                    .tree
                    .children(args)
                    .iter()
                    .copied()
                    .filter(|&c| self.tree.kind(c).is_vdef())
                    .collect(),
                None => Vec::new(),
            }
        } else {
            match self.tree.scope_of(n) {
                Some(scope) => self.tree.declared_vdefs(scope),
                None => Vec::new(),
            }
        };
        for other in siblings {
            if other != n && self.tree.vdef_name(other) == name {
                self.diags.error(
                    format!("the variable \"{name}\" has been redeclared"),
                    self.tree.pos(n),
                );
                break;
            }
        }
        self.validate_role_opt(n, Role::ValueExp)
    }

    /// A structure variable must reference a declared structure tag, and is
    /// otherwise checked like any other definition.
    fn validate_struct_def(&mut self, n: Node) -> Result<(), FatalError> {
        let tag = self.tree.vdef_data_type(n).to_string();
        if self.tree.global_struct(&tag).is_none() {
            self.diags.error(
                format!("the structure variable has an illegal type of \"{tag}\""),
                self.tree.pos(n),
            );
        }
        self.validate_vdef(n)
    }

    fn validate_struct(&mut self, n: Node) -> Result<(), FatalError> {
        let name = self.tree.struct_name(n).to_string();
        let first = self.tree.global_struct(&name);
        if first.is_some() && first != Some(n) {
            self.diags.error(
                format!("the structure \"{name}\" has been redeclared"),
                self.tree.pos(n),
            );
        }
        self.validate_role_opt(n, Role::StructBody)
    }

    /// A use must have a reachable definition, and each step of a structure
    /// access chain must name a member of the structure at that step.
    fn validate_var_access(&mut self, n: Node) {
        let root_def = match self.tree.resolve_vdef(n, false) {
            Some(d) => d,
            None => {
                self.diags.error(
                    format!("the variable \"{}\" could not be found", self.tree.var_name(n)),
                    self.tree.pos(n),
                );
                return;
            }
        };

        if self.tree.role(n, Role::StructAccess).is_none() {
            return;
        }
        if self.tree.kind(root_def) != NodeKind::StructDef {
            self.diags.error(
                format!(
                    "the variable \"{}\" is not a structure but is accessed like one",
                    self.tree.var_name(n)
                ),
                self.tree.pos(n),
            );
            return;
        }

        let mut vdef = root_def;
        let mut use_site = n;
        while let Some(access) = self.tree.role(use_site, Role::StructAccess) {
            let tag = self.tree.vdef_data_type(vdef).to_string();
            let strukt = match self.tree.global_struct(&tag) {
                Some(s) => s,
                None => {
                    self.diags.error(
                        format!("the structure \"{tag}\" does not exist"),
                        self.tree.pos(use_site),
                    );
                    return;
                }
            };
            let member_iden = match self.tree.role(access, Role::VarIdentifier) {
                Some(m) => m,
                None => return,
            };
            let member_name = self.tree.var_name(member_iden).to_string();
            let body = match self.tree.role(strukt, Role::StructBody) {
                Some(b) => b,
                None => return,
            };
            match self.tree.find_vdef_in_scope(body, &member_name, None) {
                Some(m) => {
                    vdef = m;
                    use_site = member_iden;
                }
                None => {
                    self.diags.error(
                        format!(
                            "the variable \"{member_name}\" does not exist in structure \"{}\"",
                            self.tree.struct_name(strukt)
                        ),
                        self.tree.pos(member_iden),
                    );
                    return;
                }
            }
        }
    }

    /// The target access is validated; the value expression is validated
    /// structurally. Type compatibility checking is a design hook left open
    /// here.
    fn validate_assignment(&mut self, n: Node) -> Result<(), FatalError> {
        if let Some(target) = self.tree.role(n, Role::VarIdentifier) {
            self.validate_part(target)?;
        }
        self.validate_role_opt(n, Role::Value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;
    use crate::diag::Severity;
    use crate::TreeImprover;

    fn validate(mut t: Tree) -> Diagnostics {
        TreeImprover::new(&mut t).improve().unwrap();
        SemanticValidator::new(&t).validate()
    }

    fn messages(d: &Diagnostics) -> Vec<String> {
        d.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn clean_program_validates() {
        let mut b = TreeBuilder::new();
        let a = b.vdef("uint8", "a", None);
        let seven = b.number(7);
        let target = b.var("a");
        let assign = b.assign(target, seven);
        let zero = b.number(0);
        let ret = b.ret(Some(zero));
        b.func("int8", "main", vec![], vec![a, assign, ret]);
        let d = validate(b.finish());
        assert!(d.is_empty(), "unexpected diagnostics: {d}");
    }

    #[test]
    fn undeclared_variable_is_reported() {
        let mut b = TreeBuilder::new();
        let use_x = b.var("x");
        let ret = b.ret(Some(use_x));
        b.func("int8", "main", vec![], vec![ret]);
        let d = validate(b.finish());
        assert!(d.has_errors());
        assert!(messages(&d)[0].contains("\"x\" could not be found"));
    }

    #[test]
    fn redeclared_variable_is_reported() {
        let mut b = TreeBuilder::new();
        let a1 = b.vdef("uint8", "a", None);
        let a2 = b.vdef("uint16", "a", None);
        let ret = b.ret(None);
        b.func("int8", "main", vec![], vec![a1, a2, ret]);
        let d = validate(b.finish());
        // Both declarations see the clash.
        assert_eq!(d.iter().filter(|d| d.severity == Severity::Error).count(), 2);
        assert!(messages(&d)[0].contains("\"a\" has been redeclared"));
    }

    #[test]
    fn redeclared_function_is_fatal() {
        let mut b = TreeBuilder::new();
        let r1 = b.ret(None);
        b.func("int8", "f", vec![], vec![r1]);
        let r2 = b.ret(None);
        b.func("int8", "f", vec![], vec![r2]);
        let d = validate(b.finish());
        assert!(d.iter().any(|d| d.severity == Severity::Fatal));
    }

    #[test]
    fn unknown_struct_tag_is_reported() {
        let mut b = TreeBuilder::new();
        b.global_struct_var("Ghost", "g", 0);
        let d = validate(b.finish());
        assert!(messages(&d)[0].contains("illegal type of \"Ghost\""));
    }

    #[test]
    fn redeclared_structure_is_reported() {
        let mut b = TreeBuilder::new();
        b.struct_decl("P", &[("uint8", "a")]);
        b.struct_decl("P", &[("uint8", "b")]);
        let d = validate(b.finish());
        assert!(messages(&d).iter().any(|m| m.contains("\"P\" has been redeclared")));
    }

    #[test]
    fn missing_member_is_reported() {
        let mut b = TreeBuilder::new();
        b.struct_decl("P", &[("uint8", "a")]);
        b.global_struct_var("P", "p", 0);
        let use_bad = b.var_access("p", &[("missing", false)]);
        let one = b.number(1);
        let assign = b.assign(use_bad, one);
        b.func("int8", "main", vec![], vec![assign]);
        let d = validate(b.finish());
        assert!(messages(&d)
            .iter()
            .any(|m| m.contains("\"missing\" does not exist in structure \"P\"")));
    }

    #[test]
    fn errors_accumulate_across_declarations() {
        let mut b = TreeBuilder::new();
        let use_x = b.var("x");
        let r1 = b.ret(Some(use_x));
        b.func("int8", "f", vec![], vec![r1]);
        let use_y = b.var("y");
        let r2 = b.ret(Some(use_y));
        b.func("int8", "g", vec![], vec![r2]);
        let d = validate(b.finish());
        assert_eq!(d.len(), 2);
    }
}
