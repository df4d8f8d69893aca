//! The tree-rewriting preprocessor.
//!
//! Runs before the improver. `MACRO_DEFINE` nodes record a definition and
//! disappear; `MACRO_IFDEF` nodes either splice their guarded declarations
//! into the surrounding tree (when the tested symbol is defined) or vanish
//! with everything they guard. Definition values are constant-folded so a
//! definition can reference earlier definitions.

use crate::node::{NodeKind, Role};
use crate::tree::TreeError;
use crate::{Node, Tree};
use rustc_hash::FxHashMap;

/// The macro definitions table and the rewriting pass over a tree.
///
/// The table is per-compilation state: create one `Preprocessor` per
/// translation unit.
#[derive(Default)]
pub struct Preprocessor {
    definitions: FxHashMap<String, String>,
}

impl Preprocessor {
    /// Create an empty preprocessor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Is this name a preprocessor macro keyword?
    pub fn is_macro(&self, name: &str) -> bool {
        matches!(name, "ifdef" | "define")
    }

    /// Has this definition been registered?
    pub fn is_definition_registered(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Register a definition, overwriting any previous value.
    pub fn define_definition(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.definitions.insert(name.into(), value.into());
    }

    /// The value of a registered definition.
    pub fn get_definition_value(&self, name: &str) -> Option<&str> {
        self.definitions.get(name).map(String::as_str)
    }

    /// Rewrite every macro subtree in the tree.
    pub fn process(&mut self, tree: &mut Tree) -> Result<(), TreeError> {
        log::debug!("preprocessing tree");
        // Splicing an ifdef body can expose further macros at the spliced
        // position, so repeatedly take the first remaining macro node in
        // document order.
        loop {
            let mut next = None;
            tree.walk(tree.root(), &mut |n| {
                if next.is_none()
                    && matches!(tree.kind(n), NodeKind::MacroDefine | NodeKind::MacroIfDef)
                {
                    next = Some(n);
                }
            });
            let Some(macro_node) = next else {
                return Ok(());
            };
            match tree.kind(macro_node) {
                NodeKind::MacroDefine => self.process_define(tree, macro_node)?,
                NodeKind::MacroIfDef => self.process_ifdef(tree, macro_node)?,
                _ => unreachable!(),
            }
        }
    }

    fn process_define(&mut self, tree: &mut Tree, n: Node) -> Result<(), TreeError> {
        let name = tree.required_role(n, Role::Name)?;
        let name = tree.text(name).to_string();
        let value = match tree.role(n, Role::Value) {
            Some(v) => self.evaluate(tree, v),
            None => String::new(),
        };
        log::trace!("define {name} = \"{value}\"");
        self.definitions.insert(name, value);
        tree.remove_self(n)
    }

    fn process_ifdef(&mut self, tree: &mut Tree, n: Node) -> Result<(), TreeError> {
        let requirement = tree.required_role(n, Role::Requirement)?;
        let defined = self.is_definition_registered(tree.text(requirement));
        if defined {
            // Splice the guarded subtrees into whatever holds the ifdef.
            let parent = tree.parent(n).ok_or(TreeError::NoParent { node: n })?;
            let body = tree.required_role(n, Role::Body)?;
            for child in tree.children(body).to_vec() {
                tree.add_child_opts(parent, child, Some(n), true)?;
            }
        }
        tree.remove_self(n)
    }

    /// Evaluate a definition value: a literal, a reference to an earlier
    /// definition, or a constant expression over those.
    fn evaluate(&self, tree: &Tree, n: Node) -> String {
        match tree.kind(n) {
            NodeKind::Number | NodeKind::Str => tree.text(n).to_string(),
            NodeKind::Identifier => self
                .get_definition_value(tree.text(n))
                .unwrap_or("")
                .to_string(),
            NodeKind::Expr => {
                let children = tree.children(n);
                if children.len() != 2 {
                    return String::new();
                }
                let left = self.evaluate(tree, children[0]);
                let right = self.evaluate(tree, children[1]);
                let (Ok(l), Ok(r)) = (left.parse::<i64>(), right.parse::<i64>()) else {
                    return String::new();
                };
                let folded = match tree.text(n) {
                    "+" => l.wrapping_add(r),
                    "-" => l.wrapping_sub(r),
                    "*" => l.wrapping_mul(r),
                    "/" if r != 0 => l / r,
                    _ => return String::new(),
                };
                folded.to_string()
            }
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;

    #[test]
    fn define_records_and_disappears() {
        let mut b = TreeBuilder::new();
        let v = b.number(10);
        b.macro_define("LIMIT", Some(v));
        let mut t = b.finish();

        let mut pp = Preprocessor::new();
        pp.process(&mut t).unwrap();
        assert_eq!(pp.get_definition_value("LIMIT"), Some("10"));
        assert!(t.children(t.root()).is_empty());
    }

    #[test]
    fn define_folds_constant_expressions() {
        let mut b = TreeBuilder::new();
        let two = b.number(2);
        let eight = b.number(8);
        let e = b.expr("*", two, eight);
        b.macro_define("SIZE", Some(e));
        let mut t = b.finish();

        let mut pp = Preprocessor::new();
        pp.process(&mut t).unwrap();
        assert_eq!(pp.get_definition_value("SIZE"), Some("16"));
    }

    #[test]
    fn ifdef_splices_when_defined() {
        let mut b = TreeBuilder::new();
        b.macro_define("DEBUG", None);
        let g = b.vdef("uint8", "trace_level", None);
        b.macro_ifdef("DEBUG", vec![g]);
        let after = b.global_var("uint8", "tail", None);
        let mut t = b.finish();

        let mut pp = Preprocessor::new();
        pp.process(&mut t).unwrap();

        let kids = t.children(t.root()).to_vec();
        assert_eq!(kids, vec![g, after]);
        assert_eq!(t.scope_of(g), Some(t.root()));
    }

    #[test]
    fn ifdef_drops_when_undefined() {
        let mut b = TreeBuilder::new();
        let g = b.vdef("uint8", "trace_level", None);
        b.macro_ifdef("DEBUG", vec![g]);
        let mut t = b.finish();

        let mut pp = Preprocessor::new();
        pp.process(&mut t).unwrap();
        assert!(t.children(t.root()).is_empty());
        let mut reachable = false;
        t.walk(t.root(), &mut |n| {
            if n == g {
                reachable = true;
            }
        });
        assert!(!reachable);
    }

    #[test]
    fn nested_ifdefs_process_in_document_order() {
        let mut b = TreeBuilder::new();
        b.macro_define("A", None);
        let inner_var = b.vdef("uint8", "x", None);
        let inner = {
            let n = b.tree_mut().make(NodeKind::MacroIfDef, "");
            let req = b.identifier("A");
            b.tree_mut().set_role(n, Role::Requirement, req).unwrap();
            let body = b.body(vec![inner_var]);
            b.tree_mut().set_role(n, Role::Body, body).unwrap();
            n
        };
        b.macro_ifdef("A", vec![inner]);
        let mut t = b.finish();

        let mut pp = Preprocessor::new();
        pp.process(&mut t).unwrap();
        assert_eq!(t.children(t.root()), [inner_var]);
    }
}
