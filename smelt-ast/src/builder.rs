//! A checked construction surface for syntax trees.
//!
//! The parser that normally produces trees is an external collaborator, so
//! embedders (and this repository's own tests) need a way to build
//! well-formed trees directly. `TreeBuilder` plays the role that a function
//! builder plays for an instruction-based IR: it allocates nodes, wires up
//! role registrations and keeps the ordered child lists consistent, so the
//! caller can think in terms of the source constructs.
//!
//! Structural errors from the underlying tree operations are programming
//! errors in the caller; the builder panics on them rather than returning
//! results from every helper.

use crate::node::{NodeKind, Role, SourcePos};
use crate::{Node, Tree};

/// Builds a [`Tree`] bottom-up.
///
/// Statement and expression helpers return detached nodes; `func`,
/// `global_var` and friends attach finished declarations to the root.
pub struct TreeBuilder {
    tree: Tree,
}

impl TreeBuilder {
    /// Create a builder holding an empty tree.
    pub fn new() -> Self {
        Self { tree: Tree::new() }
    }

    /// Finish building and take the tree.
    pub fn finish(self) -> Tree {
        self.tree
    }

    /// Access the tree under construction.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Mutable access to the tree under construction, for surgery the
    /// helpers don't cover.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    // ------------------------------------------------------------------
    // Tokens.
    // ------------------------------------------------------------------

    /// A numeric literal token.
    pub fn number(&mut self, value: i64) -> Node {
        self.tree.make(NodeKind::Number, value.to_string())
    }

    /// A string literal token.
    pub fn str_lit(&mut self, value: &str) -> Node {
        self.tree.make(NodeKind::Str, value)
    }

    /// An identifier token.
    pub fn identifier(&mut self, name: &str) -> Node {
        self.tree.make(NodeKind::Identifier, name)
    }

    /// An identifier token carrying a source position.
    pub fn identifier_at(&mut self, name: &str, pos: SourcePos) -> Node {
        self.tree.make_at(NodeKind::Identifier, name, pos)
    }

    // ------------------------------------------------------------------
    // Variables.
    // ------------------------------------------------------------------

    /// A bare variable use.
    pub fn var(&mut self, name: &str) -> Node {
        let iden = self.tree.make(NodeKind::VarIdentifier, "");
        let name = self.identifier(name);
        self.tree.set_role(iden, Role::Name, name).unwrap();
        iden
    }

    /// A variable use with an array index chain.
    pub fn var_indexed(&mut self, name: &str, indexes: Vec<Node>) -> Node {
        let iden = self.var(name);
        self.attach_indexes(iden, indexes);
        iden
    }

    /// A variable use followed by a structure access chain; each element is
    /// `(member_name, accessed_through_pointer)`.
    pub fn var_access(&mut self, name: &str, members: &[(&str, bool)]) -> Node {
        let root = self.var(name);
        let mut cur = root;
        for &(member, as_pointer) in members {
            let access = self.tree.make(NodeKind::StructAccess, "");
            self.tree.set_access_as_pointer(access, as_pointer);
            let member_iden = self.var(member);
            self.tree
                .set_role(access, Role::VarIdentifier, member_iden)
                .unwrap();
            self.tree.set_role(cur, Role::StructAccess, access).unwrap();
            cur = member_iden;
        }
        root
    }

    /// Attach an array index chain to an existing variable use.
    pub fn attach_indexes(&mut self, var_iden: Node, indexes: Vec<Node>) {
        let mut prev: Option<Node> = None;
        for value in indexes {
            let index = self.tree.make(NodeKind::ArrayIndex, "");
            self.tree.set_role(index, Role::Value, value).unwrap();
            match prev {
                None => self
                    .tree
                    .set_role(var_iden, Role::RootArrayIndex, index)
                    .unwrap(),
                Some(p) => self.tree.set_role(p, Role::Next, index).unwrap(),
            }
            prev = Some(index);
        }
    }

    /// A variable definition. The kind becomes `STRUCT_DEF` when the data
    /// type is not primitive.
    pub fn vdef(&mut self, data_type: &str, name: &str, value: Option<Node>) -> Node {
        self.vdef_full(data_type, name, 0, &[], value)
    }

    /// A pointer variable definition.
    pub fn vdef_ptr(&mut self, data_type: &str, name: &str, depth: u8) -> Node {
        self.vdef_full(data_type, name, depth, &[], None)
    }

    /// An array variable definition with literal bounds.
    pub fn vdef_array(&mut self, data_type: &str, name: &str, dims: &[u32]) -> Node {
        self.vdef_full(data_type, name, 0, dims, None)
    }

    /// The general variable definition constructor.
    pub fn vdef_full(
        &mut self,
        data_type: &str,
        name: &str,
        ptr_depth: u8,
        dims: &[u32],
        value: Option<Node>,
    ) -> Node {
        let kind = if crate::scope::is_primitive(data_type) {
            NodeKind::VDef
        } else {
            NodeKind::StructDef
        };
        let vdef = self.tree.make(kind, "");
        let ty = self.tree.make(NodeKind::Keyword, data_type);
        self.tree.set_role(vdef, Role::DataType, ty).unwrap();
        let dim_nodes: Vec<Node> = dims.iter().map(|&d| self.number(i64::from(d))).collect();
        let iden = self.var_indexed(name, dim_nodes);
        self.tree.set_role(vdef, Role::VarIdentifier, iden).unwrap();
        if ptr_depth > 0 {
            self.tree.set_vdef_pointer(vdef, ptr_depth);
        }
        if let Some(v) = value {
            self.tree.set_role(vdef, Role::ValueExp, v).unwrap();
        }
        vdef
    }

    /// Declare a global variable on the root.
    pub fn global_var(&mut self, data_type: &str, name: &str, value: Option<Node>) -> Node {
        let vdef = self.vdef(data_type, name, value);
        let root = self.tree.root();
        self.tree.add_child(root, vdef).unwrap();
        vdef
    }

    /// Declare a global array on the root.
    pub fn global_array(&mut self, data_type: &str, name: &str, dims: &[u32]) -> Node {
        let vdef = self.vdef_array(data_type, name, dims);
        let root = self.tree.root();
        self.tree.add_child(root, vdef).unwrap();
        vdef
    }

    /// Declare a global structure variable (or pointer to one) on the root.
    pub fn global_struct_var(&mut self, tag: &str, name: &str, ptr_depth: u8) -> Node {
        let vdef = self.vdef_full(tag, name, ptr_depth, &[], None);
        let root = self.tree.root();
        self.tree.add_child(root, vdef).unwrap();
        vdef
    }

    /// Declare a structure type on the root.
    pub fn struct_decl(&mut self, name: &str, members: &[(&str, &str)]) -> Node {
        let strukt = self.tree.make(NodeKind::Struct, "");
        let name = self.identifier(name);
        self.tree.set_role(strukt, Role::Name, name).unwrap();
        let body = self.tree.make(NodeKind::Body, "");
        for &(ty, member) in members {
            let vdef = self.vdef(ty, member, None);
            self.tree.add_child(body, vdef).unwrap();
        }
        self.tree.set_role(strukt, Role::StructBody, body).unwrap();
        let root = self.tree.root();
        self.tree.add_child(root, strukt).unwrap();
        strukt
    }

    // ------------------------------------------------------------------
    // Expressions.
    // ------------------------------------------------------------------

    /// A binary expression.
    pub fn expr(&mut self, op: &str, left: Node, right: Node) -> Node {
        let e = self.tree.make(NodeKind::Expr, op);
        self.tree.add_child(e, left).unwrap();
        self.tree.add_child(e, right).unwrap();
        e
    }

    /// `&variable`.
    pub fn addr_of(&mut self, var_iden: Node) -> Node {
        let n = self.tree.make(NodeKind::AddressOf, "");
        self.tree.set_role(n, Role::VarIdentifier, var_iden).unwrap();
        n
    }

    /// A pointer dereference of the given depth around an expression.
    pub fn deref(&mut self, exp: Node, depth: u8) -> Node {
        let n = self.tree.make(NodeKind::Ptr, "");
        self.tree.set_ptr_depth(n, depth);
        self.tree.set_role(n, Role::Exp, exp).unwrap();
        n
    }

    /// `!expression`.
    pub fn logical_not(&mut self, exp: Node) -> Node {
        let n = self.tree.make(NodeKind::LogicalNot, "");
        self.tree.set_role(n, Role::Subject, exp).unwrap();
        n
    }

    /// A call expression or statement.
    pub fn call(&mut self, name: &str, params: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::FuncCall, "");
        let name = self.identifier(name);
        self.tree.set_role(n, Role::Name, name).unwrap();
        let holder = self.tree.make(NodeKind::Args, "");
        for p in params {
            self.tree.add_child(holder, p).unwrap();
        }
        self.tree.set_role(n, Role::Arguments, holder).unwrap();
        n
    }

    // ------------------------------------------------------------------
    // Statements.
    // ------------------------------------------------------------------

    /// An assignment with the plain `=` operator.
    pub fn assign(&mut self, target: Node, value: Node) -> Node {
        self.assign_op("=", target, value)
    }

    /// An assignment with the given operator (`=`, `+=`, `<<=`, ...).
    /// The target is a variable use or a `PTR` dereference.
    pub fn assign_op(&mut self, op: &str, target: Node, value: Node) -> Node {
        let n = self.tree.make(NodeKind::Assign, op);
        self.tree.set_role(n, Role::VarIdentifier, target).unwrap();
        self.tree.set_role(n, Role::Value, value).unwrap();
        n
    }

    /// A `return` statement.
    pub fn ret(&mut self, exp: Option<Node>) -> Node {
        let n = self.tree.make(NodeKind::Return, "");
        if let Some(e) = exp {
            self.tree.set_role(n, Role::Exp, e).unwrap();
        }
        n
    }

    /// An `if` statement. `else_if` chains another `if` node; `else_body`
    /// attaches a final `else` arm.
    pub fn if_stmt(
        &mut self,
        cond: Node,
        body: Vec<Node>,
        else_if: Option<Node>,
        else_body: Option<Vec<Node>>,
    ) -> Node {
        let n = self.tree.make(NodeKind::If, "");
        self.tree.set_role(n, Role::Cond, cond).unwrap();
        let body = self.body(body);
        self.tree.set_role(n, Role::Body, body).unwrap();
        if let Some(ei) = else_if {
            self.tree.set_role(n, Role::ElseIf, ei).unwrap();
        } else if let Some(eb) = else_body {
            let els = self.tree.make(NodeKind::Else, "");
            let else_body = self.body(eb);
            self.tree.set_role(els, Role::Body, else_body).unwrap();
            self.tree.set_role(n, Role::Else, els).unwrap();
        }
        n
    }

    /// A `while` loop.
    pub fn while_stmt(&mut self, cond: Node, body: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::While, "");
        self.tree.set_role(n, Role::Cond, cond).unwrap();
        let body = self.body(body);
        self.tree.set_role(n, Role::Body, body).unwrap();
        n
    }

    /// A `for` loop with init, condition and step clauses.
    pub fn for_stmt(&mut self, init: Node, cond: Node, step: Node, body: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::For, "");
        self.tree.set_role(n, Role::Init, init).unwrap();
        self.tree.set_role(n, Role::Cond, cond).unwrap();
        self.tree.set_role(n, Role::Loop, step).unwrap();
        let body = self.body(body);
        self.tree.set_role(n, Role::Body, body).unwrap();
        n
    }

    /// `break`.
    pub fn brk(&mut self) -> Node {
        self.tree.make(NodeKind::Break, "")
    }

    /// `continue`.
    pub fn cont(&mut self) -> Node {
        self.tree.make(NodeKind::Continue, "")
    }

    /// An inline assembly statement: the opening text plus a sequence of
    /// `(substituted_value, following_text)` arguments.
    pub fn asm_stmt(&mut self, start: &str, args: Vec<(Node, &str)>) -> Node {
        let n = self.tree.make(NodeKind::Asm, "");
        let start = self.tree.make(NodeKind::Str, start);
        self.tree.set_role(n, Role::AsmStart, start).unwrap();
        let holder = self.tree.make(NodeKind::Args, "");
        for (value, next) in args {
            let arg = self.tree.make(NodeKind::AsmArg, "");
            self.tree.set_role(arg, Role::Value, value).unwrap();
            let next = self.tree.make(NodeKind::Str, next);
            self.tree.set_role(arg, Role::Next, next).unwrap();
            self.tree.add_child(holder, arg).unwrap();
        }
        self.tree.set_role(n, Role::AsmArgs, holder).unwrap();
        n
    }

    // ------------------------------------------------------------------
    // Declarations.
    // ------------------------------------------------------------------

    /// A function definition attached to the root. `args` are variable
    /// definitions; `body` is the ordered statement list.
    pub fn func(&mut self, ret_type: &str, name: &str, args: Vec<Node>, body: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::Func, "");
        let ty = self.tree.make(NodeKind::Keyword, ret_type);
        self.tree.set_role(n, Role::ReturnType, ty).unwrap();
        let name = self.identifier(name);
        self.tree.set_role(n, Role::Name, name).unwrap();
        let holder = self.tree.make(NodeKind::Args, "");
        for a in args {
            self.tree.add_child(holder, a).unwrap();
        }
        self.tree.set_role(n, Role::Arguments, holder).unwrap();
        let body = self.body(body);
        self.tree.set_role(n, Role::Body, body).unwrap();
        let root = self.tree.root();
        self.tree.add_child(root, n).unwrap();
        n
    }

    /// A bodiless function declaration (external function) attached to the
    /// root.
    pub fn func_decl(&mut self, ret_type: &str, name: &str, args: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::FuncDef, "");
        let ty = self.tree.make(NodeKind::Keyword, ret_type);
        self.tree.set_role(n, Role::ReturnType, ty).unwrap();
        let name = self.identifier(name);
        self.tree.set_role(n, Role::Name, name).unwrap();
        let holder = self.tree.make(NodeKind::Args, "");
        for a in args {
            self.tree.add_child(holder, a).unwrap();
        }
        self.tree.set_role(n, Role::Arguments, holder).unwrap();
        let root = self.tree.root();
        self.tree.add_child(root, n).unwrap();
        n
    }

    /// A `MACRO_DEFINE` attached to the root.
    pub fn macro_define(&mut self, name: &str, value: Option<Node>) -> Node {
        let n = self.tree.make(NodeKind::MacroDefine, "");
        let name = self.identifier(name);
        self.tree.set_role(n, Role::Name, name).unwrap();
        if let Some(v) = value {
            self.tree.set_role(n, Role::Value, v).unwrap();
        }
        let root = self.tree.root();
        self.tree.add_child(root, n).unwrap();
        n
    }

    /// A `MACRO_IFDEF` attached to the root, guarding the given
    /// declarations.
    pub fn macro_ifdef(&mut self, requirement: &str, guarded: Vec<Node>) -> Node {
        let n = self.tree.make(NodeKind::MacroIfDef, "");
        let req = self.identifier(requirement);
        self.tree.set_role(n, Role::Requirement, req).unwrap();
        let body = self.body(guarded);
        self.tree.set_role(n, Role::Body, body).unwrap();
        let root = self.tree.root();
        self.tree.add_child(root, n).unwrap();
        n
    }

    /// Wrap statements into a `BODY` scope node.
    pub fn body(&mut self, stmts: Vec<Node>) -> Node {
        let body = self.tree.make(NodeKind::Body, "");
        for s in stmts {
            self.tree.add_child(body, s).unwrap();
        }
        body
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
