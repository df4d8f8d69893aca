//! The 8086 code generator.
//!
//! Walks an improved, validated tree and emits textual assembly, one line
//! per instruction, into a `code` and a `data` section. The text then goes
//! through the in-process assembler (see [`crate::asm`]) to become segment
//! bytes and relocation records.
//!
//! Register convention:
//!
//! - `ax` holds expression results and return values;
//! - `cx` holds the right operand of a binary operation;
//! - `bx` is the scratch base for runtime-computed addresses;
//! - `di` is the scaled array index;
//! - `si`/`di` are the source and destination of block moves;
//! - `bp` anchors the frame: locals below it, arguments above the saved
//!   frame pointer and return address.
//!
//! Binary expressions evaluate the deeper operand first so its result can
//! rest in `ax` while the shallow side loads into `cx`; when both sides are
//! full expressions the right side is evaluated first and parked on the
//! stack. Comparison and logical operators compile to a per-expression label
//! triple (`true`/`false`/`end`); a pending `&&` jumps to the false label on
//! a failed comparison, a pending `||` jumps to the true label on a passed
//! one, and whoever owns the triple materialises `0`/`1` into `ax` at the
//! end unless a statement consumes the labels for its own branching.

mod addr;

pub use addr::{Base, VarAddress};

use smelt_ast::{Diagnostics, Node, NodeKind, Role, Tree, TreeError, POINTER_SIZE};

/// A hard failure that aborts the whole compilation; user-correctable
/// problems are reported as diagnostics instead.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// A tree-structural invariant did not hold; this is a compiler bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result alternative used inside the generator.
///
/// `User` means a diagnostic has been recorded and the current function
/// should be abandoned; generation continues with the next top-level
/// declaration. `Internal` aborts everything.
pub(crate) enum GenError {
    User,
    Internal(String),
}

impl From<TreeError> for GenError {
    fn from(e: TreeError) -> Self {
        Self::Internal(e.to_string())
    }
}

pub(crate) type GenResult<T> = Result<T, GenError>;

/// Destination register of a leaf operand.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Dest {
    Ax,
    Cx,
}

impl Dest {
    fn word(self) -> &'static str {
        match self {
            Self::Ax => "ax",
            Self::Cx => "cx",
        }
    }

    fn byte(self) -> &'static str {
        match self {
            Self::Ax => "al",
            Self::Cx => "cl",
        }
    }
}

/// The logical operator governing how a comparison branches.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Logic {
    None,
    And,
    Or,
}

/// The label triple of an in-flight comparison expression.
struct CmpLabels {
    true_lbl: String,
    false_lbl: String,
    end_lbl: String,
    last_logic: Logic,
}

/// Labels and unwind boundaries of an enclosing loop.
struct LoopLabels {
    break_label: String,
    continue_label: String,
    /// Scope whose size (inclusive) a `break` must restore before jumping.
    break_until: Node,
    /// Scope a `continue` unwinds to.
    continue_until: Node,
    /// Whether `continue` restores `continue_until` itself. A `while`
    /// releases its body every iteration, so continuing restores the body;
    /// a `for` keeps its frame live across iterations.
    continue_inclusive: bool,
}

/// Generates 8086 assembly text from a tree.
pub struct CodeGen<'t> {
    pub(crate) tree: &'t Tree,
    pub(crate) diags: Diagnostics,
    code: Vec<String>,
    data: Vec<String>,
    label_index: u32,
    cmp: Option<CmpLabels>,
    signed: bool,
    byte_compare: bool,
    loops: Vec<LoopLabels>,
    cur_func: Option<Node>,
}

/// Generate assembly text for a whole tree. Returns the text and the
/// user diagnostics collected along the way; a function with errors is
/// skipped, everything else still generates.
pub fn generate(tree: &Tree) -> Result<(String, Diagnostics), CodegenError> {
    let mut cg = CodeGen::new(tree);
    cg.run()?;
    Ok(cg.finish())
}

impl<'t> CodeGen<'t> {
    fn new(tree: &'t Tree) -> Self {
        let mut cg = Self {
            tree,
            diags: Diagnostics::new(),
            code: Vec::new(),
            data: Vec::new(),
            label_index: 0,
            cmp: None,
            signed: false,
            byte_compare: false,
            loops: Vec::new(),
            cur_func: None,
        };
        // Globals are addressed relative to the start of the data segment.
        cg.emit_data("_data:");
        cg
    }

    fn run(&mut self) -> Result<(), CodegenError> {
        log::debug!("generating 8086 assembly");
        let top: Vec<Node> = self.tree.children(self.tree.root()).to_vec();

        // Globals first: their offsets are prefix sums over the data
        // segment, so string constants from function bodies must land after
        // every global.
        for &child in &top {
            let r = match self.tree.kind(child) {
                NodeKind::VDef | NodeKind::StructDef => self.emit_global_var(child),
                NodeKind::FuncDef => self.emit_function_decl(child),
                _ => Ok(()),
            };
            self.absorb(r)?;
        }
        for &child in &top {
            let r = match self.tree.kind(child) {
                NodeKind::Func => self.emit_function(child),
                NodeKind::Asm => self.emit_inline_asm(child),
                _ => Ok(()),
            };
            self.absorb(r)?;
        }
        Ok(())
    }

    /// A user error abandons the current declaration; reset per-function
    /// state and carry on. Internal errors abort.
    fn absorb(&mut self, r: GenResult<()>) -> Result<(), CodegenError> {
        match r {
            Ok(()) => Ok(()),
            Err(GenError::User) => {
                self.cmp = None;
                self.signed = false;
                self.byte_compare = false;
                self.loops.clear();
                self.cur_func = None;
                Ok(())
            }
            Err(GenError::Internal(msg)) => Err(CodegenError::Internal(msg)),
        }
    }

    fn finish(self) -> (String, Diagnostics) {
        let mut out = String::new();
        out.push_str("segment code\n");
        for line in &self.code {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("segment data\n");
        for line in &self.data {
            out.push_str(line);
            out.push('\n');
        }
        (out, self.diags)
    }

    // ------------------------------------------------------------------
    // Emission primitives.
    // ------------------------------------------------------------------

    pub(crate) fn emit(&mut self, line: impl Into<String>) {
        self.code.push(line.into());
    }

    fn emit_data(&mut self, line: impl Into<String>) {
        self.data.push(line.into());
    }

    fn make_label(&mut self, name: &str) {
        self.code.push(format!("_{name}:"));
    }

    fn unique_label(&mut self) -> String {
        let label = format!("_u{}", self.label_index);
        self.label_index += 1;
        label
    }

    fn place_label(&mut self, label: &str) {
        self.code.push(format!("{label}:"));
    }

    /// Allocate a NUL-terminated string constant in the data segment and
    /// return its label.
    fn make_string_const(&mut self, text: &str) -> String {
        let label = self.unique_label();
        // Quotes would terminate the literal early in the assembly text.
        let escaped = text.replace('\'', "\\'");
        self.emit_data(format!("{label}:"));
        self.emit_data(format!("db '{escaped}', 0"));
        label
    }

    // ------------------------------------------------------------------
    // Top-level declarations.
    // ------------------------------------------------------------------

    /// A global lands in the data segment: a label, then an initial-value
    /// directive (`db`/`dw`) for scalars or a reservation (`rb`) for arrays
    /// and in-place structures.
    fn emit_global_var(&mut self, vdef: Node) -> GenResult<()> {
        let name = self.tree.vdef_name(vdef).to_string();
        self.emit_data(format!("_{name}:"));

        let iden = self.tree.required_role(vdef, Role::VarIdentifier)?;
        let is_array = self.tree.role(iden, Role::RootArrayIndex).is_some();
        let in_place_struct =
            self.tree.kind(vdef) == NodeKind::StructDef && !self.tree.vdef_is_pointer(vdef);

        if is_array || in_place_struct {
            let size = self.size_query(self.tree.vdef_size(vdef), vdef)?;
            self.emit_data(format!("rb {size}"));
            return Ok(());
        }

        let elem = self.size_query(self.tree.vdef_element_size(vdef, false), vdef)?;
        let directive = if elem == 2 { "dw" } else { "db" };
        let value = match self.tree.role(vdef, Role::ValueExp) {
            None => "0".to_string(),
            Some(v) if self.tree.kind(v) == NodeKind::Number => self.tree.text(v).to_string(),
            Some(v) => {
                self.diags.error(
                    format!("the global variable \"{name}\" must be initialised with a constant"),
                    self.tree.pos(v),
                );
                return Err(GenError::User);
            }
        };
        self.emit_data(format!("{directive} {value}"));
        Ok(())
    }

    /// A bodiless declaration imports the symbol.
    fn emit_function_decl(&mut self, n: Node) -> GenResult<()> {
        let name = self.tree.required_role(n, Role::Name)?;
        let name = self.tree.text(name).to_string();
        self.emit(format!("extern _{name}"));
        Ok(())
    }

    fn emit_function(&mut self, f: Node) -> GenResult<()> {
        let name = self.tree.required_role(f, Role::Name)?;
        let name = self.tree.text(name).to_string();
        log::trace!("generating function _{name}");
        let body = self.tree.required_role(f, Role::Body)?;

        self.emit(format!("global _{name}"));
        self.make_label(&name);
        self.cur_func = Some(f);

        self.emit("push bp");
        self.emit("mov bp, sp");
        let frame = self.size_query(self.tree.scope_declared_size(body), f)?;
        if frame > 0 {
            self.emit(format!("sub sp, {frame}"));
        }

        self.emit_body(body)?;

        // Fall-off-the-end functions still need an epilogue.
        let last = self.tree.children(body).last().copied();
        if last.map(|n| self.tree.kind(n)) != Some(NodeKind::Return) {
            if frame > 0 {
                self.emit(format!("add sp, {frame}"));
            }
            self.emit("pop bp");
            self.emit("ret");
        }
        self.cur_func = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements.
    // ------------------------------------------------------------------

    fn emit_body(&mut self, body: Node) -> GenResult<()> {
        for stmt in self.tree.children(body).to_vec() {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, n: Node) -> GenResult<()> {
        // Operand-width hints don't survive across statements.
        self.byte_compare = false;
        match self.tree.kind(n) {
            NodeKind::Assign => self.emit_assign(n),
            NodeKind::Asm => self.emit_inline_asm(n),
            NodeKind::FuncCall => self.emit_call(n),
            NodeKind::Return => self.emit_return(n),
            NodeKind::VDef | NodeKind::StructDef => self.emit_local_decl(n),
            NodeKind::If => self.emit_if(n),
            NodeKind::While => self.emit_while(n),
            NodeKind::For => self.emit_for(n),
            NodeKind::Break => self.emit_break(n),
            NodeKind::Continue => self.emit_continue(n),
            // A bare expression statement evaluates for its side effects.
            NodeKind::Expr | NodeKind::VarIdentifier | NodeKind::Ptr => self.emit_expr_into_ax(n),
            kind => Err(GenError::Internal(format!(
                "{kind} is not a statement kind"
            ))),
        }
    }

    /// Space for locals is reserved by the enclosing scope; a declaration
    /// only has work to do when it carries an initializer.
    fn emit_local_decl(&mut self, vdef: Node) -> GenResult<()> {
        let Some(value) = self.tree.role(vdef, Role::ValueExp) else {
            return Ok(());
        };
        self.emit_expr_into_ax(value)?;
        let addr = self.local_address(vdef)?;
        let size = self.size_query(self.tree.vdef_element_size(vdef, false), vdef)?;
        self.emit_store(&addr, size);
        Ok(())
    }

    fn emit_assign(&mut self, n: Node) -> GenResult<()> {
        let target = self.tree.required_role(n, Role::VarIdentifier)?;
        let value = self.tree.required_role(n, Role::Value)?;
        let op = self.tree.text(n).to_string();

        if self.tree.kind(target) == NodeKind::Ptr {
            // Store through a pointer: evaluate the value, then compute the
            // target address (which may itself evaluate expressions).
            self.emit_expr_into_ax(value)?;
            self.emit("push ax");
            let place = self.emit_ptr_place(target)?;
            self.emit("pop ax");
            let size = self.pointee_size(target)?;
            if op != "=" {
                self.emit_appendment(&op, &place)?;
                self.emit("mov ax, dx");
            }
            self.emit_store(&place, size);
            return Ok(());
        }

        let final_def = self.final_definition(target)?;

        // Whole-structure assignment is a block move.
        if self.tree.kind(final_def) == NodeKind::StructDef
            && !self.tree.vdef_is_pointer(final_def)
            && op == "="
            && self.tree.kind(value) == NodeKind::VarIdentifier
        {
            return self.emit_struct_copy(target, value, final_def);
        }

        self.emit_expr_into_ax(value)?;
        let addr = self.resolve_var(target)?;
        let size = self.load_size(final_def, target)?;
        if op != "=" {
            self.emit_appendment(&op, &addr)?;
            self.emit("mov ax, dx");
        }
        self.emit_store(&addr, size);
        Ok(())
    }

    fn emit_store(&mut self, addr: &VarAddress, size: u32) {
        if size == 2 {
            self.emit(format!("mov [{addr}], ax"));
        } else {
            self.emit(format!("mov [{addr}], al"));
        }
    }

    /// Read-modify-write for compound assignment: the old value is loaded
    /// into `dx`, combined with the new value in `ax`, and left in `dx`.
    fn emit_appendment(&mut self, op: &str, addr: &VarAddress) -> GenResult<()> {
        self.emit(format!("mov dx, [{addr}]"));
        match op {
            "+=" => self.emit("add dx, ax"),
            "-=" => self.emit("sub dx, ax"),
            "^=" => self.emit("xor dx, ax"),
            "|=" => self.emit("or dx, ax"),
            "&=" => self.emit("and dx, ax"),
            "<<=" => {
                self.emit("push cx");
                self.emit("mov cl, al");
                self.emit("rcl dx, cl");
                self.emit("pop cx");
            }
            ">>=" => {
                self.emit("push cx");
                self.emit("mov cl, al");
                self.emit("rcr dx, cl");
                self.emit("pop cx");
            }
            "*=" | "/=" | "%=" => {
                // Multiplication and division operate on dx:ax, so shuffle
                // the operands through cx.
                self.emit("push cx");
                self.emit("mov cx, ax");
                self.emit("mov ax, dx");
                self.emit("xor dx, dx");
                match op {
                    "*=" => {
                        if self.signed {
                            self.emit("imul cx");
                        } else {
                            self.emit("mul cx");
                        }
                        self.emit("mov dx, ax");
                    }
                    "/=" => {
                        if self.signed {
                            self.emit("idiv cx");
                        } else {
                            self.emit("div cx");
                        }
                        self.emit("mov dx, ax");
                    }
                    // The 16-bit remainder is already in dx.
                    _ => self.emit("div cx"),
                }
                self.emit("pop cx");
            }
            _ => {
                return Err(GenError::Internal(format!(
                    "\"{op}\" is not an assignment operator"
                )))
            }
        }
        self.signed = false;
        Ok(())
    }

    fn emit_struct_copy(&mut self, target: Node, value: Node, def: Node) -> GenResult<()> {
        let size = self.size_query(self.tree.vdef_element_size(def, true), def)?;
        let src = self.resolve_var(value)?;
        self.emit(format!("lea si, [{src}]"));
        let dst = self.resolve_var(target)?;
        self.emit(format!("lea di, [{dst}]"));
        self.emit(format!("mov cx, {size}"));
        let label = self.unique_label();
        self.place_label(&label);
        self.emit("lodsb");
        self.emit("stosb");
        self.emit(format!("loop {label}"));
        Ok(())
    }

    fn emit_return(&mut self, n: Node) -> GenResult<()> {
        if let Some(exp) = self.tree.role(n, Role::Exp) {
            self.emit_expr_into_ax(exp)?;
        }
        let func = self
            .cur_func
            .ok_or_else(|| GenError::Internal("return outside of a function".to_string()))?;
        let body = self.tree.required_role(func, Role::Body)?;
        let scope = self
            .tree
            .scope_of(n)
            .ok_or_else(|| GenError::Internal("statement without a scope".to_string()))?;
        let restore = self.unwind_incl(scope, body)?;
        if restore > 0 {
            self.emit(format!("add sp, {restore}"));
        }
        self.emit("pop bp");
        self.emit("ret");
        Ok(())
    }

    fn emit_call(&mut self, n: Node) -> GenResult<()> {
        let name = self.tree.required_role(n, Role::Name)?;
        let name = self.tree.text(name).to_string();
        let holder = self.tree.required_role(n, Role::Arguments)?;
        let params = self.tree.children(holder).to_vec();
        // The callee indexes arguments upward from the frame pointer, so
        // they are pushed in reverse.
        for &param in params.iter().rev() {
            self.emit_expr_into_ax(param)?;
            self.emit("push ax");
        }
        self.emit(format!("call _{name}"));
        if !params.is_empty() {
            self.emit(format!("add sp, {}", params.len() * 2));
        }
        Ok(())
    }

    fn emit_if(&mut self, n: Node) -> GenResult<()> {
        let cond = self.tree.required_role(n, Role::Cond)?;
        let body = self.tree.required_role(n, Role::Body)?;

        self.emit_expr(cond)?;
        let (true_lbl, false_lbl) = self.consume_cond()?;
        let end_lbl = self.unique_label();

        self.place_label(&true_lbl);
        let size = self.size_query(self.tree.scope_declared_size(body), body)?;
        if size > 0 {
            self.emit(format!("sub sp, {size}"));
        }
        self.emit_body(body)?;
        if size > 0 {
            self.emit(format!("add sp, {size}"));
        }
        self.emit(format!("jmp {end_lbl}"));

        // Else-if chains and else arms live below the false label.
        self.place_label(&false_lbl);
        if let Some(else_if) = self.tree.role(n, Role::ElseIf) {
            self.emit_if(else_if)?;
        } else if let Some(els) = self.tree.role(n, Role::Else) {
            let else_body = self.tree.required_role(els, Role::Body)?;
            let size = self.size_query(self.tree.scope_declared_size(else_body), else_body)?;
            if size > 0 {
                self.emit(format!("sub sp, {size}"));
            }
            self.emit_body(else_body)?;
            if size > 0 {
                self.emit(format!("add sp, {size}"));
            }
        }
        self.place_label(&end_lbl);
        Ok(())
    }

    fn emit_while(&mut self, n: Node) -> GenResult<()> {
        let cond = self.tree.required_role(n, Role::Cond)?;
        let body = self.tree.required_role(n, Role::Body)?;
        let cond_lbl = self.unique_label();
        let break_lbl = self.unique_label();

        self.loops.push(LoopLabels {
            break_label: break_lbl.clone(),
            continue_label: cond_lbl.clone(),
            break_until: body,
            continue_until: body,
            continue_inclusive: true,
        });

        self.place_label(&cond_lbl);
        self.emit_expr(cond)?;
        let (true_lbl, false_lbl) = self.consume_cond()?;

        self.place_label(&true_lbl);
        let size = self.size_query(self.tree.scope_declared_size(body), body)?;
        if size > 0 {
            self.emit(format!("sub sp, {size}"));
        }
        self.emit_body(body)?;
        if size > 0 {
            self.emit(format!("add sp, {size}"));
        }
        self.emit(format!("jmp {cond_lbl}"));

        self.place_label(&false_lbl);
        self.place_label(&break_lbl);
        self.loops.pop();
        Ok(())
    }

    fn emit_for(&mut self, n: Node) -> GenResult<()> {
        let init = self.tree.required_role(n, Role::Init)?;
        let cond = self.tree.required_role(n, Role::Cond)?;
        let step = self.tree.required_role(n, Role::Loop)?;
        let body = self.tree.required_role(n, Role::Body)?;

        let cond_lbl = self.unique_label();
        let step_lbl = self.unique_label();
        let break_lbl = self.unique_label();

        // The loop frame covers the init clause and the body, reserved once
        // for the whole loop.
        let frame = self.size_query(self.tree.scope_declared_size(n), n)?
            + self.size_query(self.tree.scope_declared_size(body), body)?;
        if frame > 0 {
            self.emit(format!("sub sp, {frame}"));
        }
        self.emit_stmt(init)?;

        self.loops.push(LoopLabels {
            break_label: break_lbl.clone(),
            continue_label: step_lbl.clone(),
            break_until: n,
            continue_until: body,
            continue_inclusive: false,
        });

        self.place_label(&cond_lbl);
        self.emit_expr(cond)?;
        let (true_lbl, false_lbl) = self.consume_cond()?;

        self.place_label(&true_lbl);
        self.emit_body(body)?;
        self.place_label(&step_lbl);
        self.emit_stmt(step)?;
        self.emit(format!("jmp {cond_lbl}"));

        self.place_label(&false_lbl);
        if frame > 0 {
            self.emit(format!("add sp, {frame}"));
        }
        self.place_label(&break_lbl);
        self.loops.pop();
        Ok(())
    }

    fn emit_break(&mut self, n: Node) -> GenResult<()> {
        let (label, until) = match self.loops.last() {
            Some(top) => (top.break_label.clone(), top.break_until),
            None => {
                self.diags
                    .error("break used outside of a loop", self.tree.pos(n));
                return Err(GenError::User);
            }
        };
        let scope = self
            .tree
            .scope_of(n)
            .ok_or_else(|| GenError::Internal("statement without a scope".to_string()))?;
        let restore = self.unwind_incl(scope, until)?;
        if restore > 0 {
            self.emit(format!("add sp, {restore}"));
        }
        self.emit(format!("jmp {label}"));
        Ok(())
    }

    fn emit_continue(&mut self, n: Node) -> GenResult<()> {
        let (label, until, inclusive) = match self.loops.last() {
            Some(top) => (
                top.continue_label.clone(),
                top.continue_until,
                top.continue_inclusive,
            ),
            None => {
                self.diags
                    .error("continue used outside of a loop", self.tree.pos(n));
                return Err(GenError::User);
            }
        };
        let scope = self
            .tree
            .scope_of(n)
            .ok_or_else(|| GenError::Internal("statement without a scope".to_string()))?;
        let restore = if inclusive {
            self.unwind_incl(scope, until)?
        } else {
            self.unwind_excl(scope, until)?
        };
        if restore > 0 {
            self.emit(format!("add sp, {restore}"));
        }
        self.emit(format!("jmp {label}"));
        Ok(())
    }

    /// Inline assembly: the opening text, then alternating substituted
    /// values (variable addresses or numbers) and literal continuations.
    fn emit_inline_asm(&mut self, n: Node) -> GenResult<()> {
        let start = self.tree.required_role(n, Role::AsmStart)?;
        let mut line = self.tree.text(start).to_string();
        let holder = self.tree.required_role(n, Role::AsmArgs)?;
        for arg in self.tree.children(holder).to_vec() {
            let value = self.tree.required_role(arg, Role::Value)?;
            let substituted = match self.tree.kind(value) {
                NodeKind::Number => self.tree.text(value).to_string(),
                NodeKind::VarIdentifier => {
                    let addr = self.resolve_var(value)?;
                    addr.to_string()
                }
                kind => {
                    self.diags.error(
                        format!("a {kind} cannot be used as an inline assembly argument"),
                        self.tree.pos(value),
                    );
                    return Err(GenError::User);
                }
            };
            line.push_str(&substituted);
            let next = self.tree.required_role(arg, Role::Next)?;
            line.push_str(self.tree.text(next));
        }
        self.emit(line);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions.
    // ------------------------------------------------------------------

    /// Emit a self-contained expression and force the result into `ax`,
    /// materialising its comparison (if it is one) into `0`/`1`.
    ///
    /// The label triple of an enclosing comparison — this may be an array
    /// index or call argument evaluated in the middle of one — is parked
    /// and restored around the nested expression.
    pub(crate) fn emit_expr_into_ax(&mut self, e: Node) -> GenResult<()> {
        let enclosing = self.cmp.take();
        let result = self.emit_expr(e);
        self.finalize_cmp();
        self.cmp = enclosing;
        result
    }

    fn emit_expr(&mut self, e: Node) -> GenResult<()> {
        if self.tree.kind(e) != NodeKind::Expr {
            return self.emit_leaf(e, Dest::Ax);
        }
        let op = self.tree.text(e).to_string();
        if op == "&&" || op == "||" {
            return self.emit_logical(e, &op);
        }

        let children = self.tree.children(e);
        if children.len() != 2 {
            return Err(GenError::Internal(format!(
                "E node has {} children where 2 were expected",
                children.len()
            )));
        }
        let (l, r) = (children[0], children[1]);
        let l_deep = self.tree.kind(l) == NodeKind::Expr;
        let r_deep = self.tree.kind(r) == NodeKind::Expr;

        match (l_deep, r_deep) {
            (false, false) => {
                self.emit_leaf(l, Dest::Ax)?;
                self.emit_leaf(r, Dest::Cx)?;
            }
            (true, false) => {
                self.emit_expr(l)?;
                self.emit_leaf(r, Dest::Cx)?;
            }
            (false, true) => {
                self.emit_expr(r)?;
                self.emit("push ax");
                self.emit_leaf(l, Dest::Ax)?;
                self.emit("pop cx");
            }
            (true, true) => {
                self.emit_expr(r)?;
                self.emit("push ax");
                self.emit_expr(l)?;
                self.emit("pop cx");
            }
        }

        if is_compare_op(&op) {
            if self.cmp.is_none() {
                self.setup_cmp();
            }
            let byte = self.byte_compare;
            self.byte_compare = false;
            let (lr, rr) = if byte { ("al", "cl") } else { ("ax", "cx") };
            self.emit_compare(&op, lr, rr)?;
        } else {
            self.emit_math(&op)?;
        }
        Ok(())
    }

    fn emit_leaf(&mut self, e: Node, dest: Dest) -> GenResult<()> {
        match self.tree.kind(e) {
            NodeKind::Number => {
                self.emit(format!("mov {}, {}", dest.word(), self.tree.text(e)));
                Ok(())
            }
            NodeKind::Str => {
                let text = self.tree.text(e).to_string();
                let label = self.make_string_const(&text);
                self.emit(format!("mov {}, {label}", dest.word()));
                Ok(())
            }
            NodeKind::VarIdentifier => self.emit_var_load(e, dest),
            NodeKind::FuncCall => {
                if dest == Dest::Cx {
                    // The call's own result arrives in ax, which already
                    // holds the left operand.
                    self.emit("push ax");
                    self.emit_call(e)?;
                    self.emit("mov cx, ax");
                    self.emit("pop ax");
                } else {
                    self.emit_call(e)?;
                }
                Ok(())
            }
            NodeKind::AddressOf => {
                let iden = self.tree.required_role(e, Role::VarIdentifier)?;
                let addr = self.resolve_var(iden)?;
                self.emit(format!("lea {}, [{addr}]", dest.word()));
                Ok(())
            }
            NodeKind::LogicalNot => self.emit_logical_not(e, dest),
            NodeKind::Ptr => {
                let place = self.emit_ptr_place(e)?;
                let size = self.pointee_size(e)?;
                self.emit_load(dest, &place, size);
                Ok(())
            }
            NodeKind::Assign => {
                // An assignment used as a value leaves the stored value in ax.
                self.emit_assign(e)?;
                if dest == Dest::Cx {
                    self.emit("mov cx, ax");
                }
                Ok(())
            }
            NodeKind::Expr => {
                self.emit_expr(e)?;
                if dest == Dest::Cx {
                    self.emit("mov cx, ax");
                }
                Ok(())
            }
            kind => Err(GenError::Internal(format!(
                "{kind} cannot appear in an expression"
            ))),
        }
    }

    fn emit_var_load(&mut self, var_iden: Node, dest: Dest) -> GenResult<()> {
        let final_def = self.final_definition(var_iden)?;
        if self.tree.vdef_is_signed(final_def) {
            // Signed operands select the signed instruction variants.
            self.signed = true;
        }
        let addr = self.resolve_var(var_iden)?;

        // An array named without an index decays to its address.
        let final_iden = self.final_identifier(var_iden)?;
        let decays = self.def_has_bounds(final_def)
            && self.tree.role(final_iden, Role::RootArrayIndex).is_none();
        if decays {
            self.emit(format!("lea {}, [{addr}]", dest.word()));
            return Ok(());
        }

        let size = self.load_size(final_def, var_iden)?;
        self.emit_load(dest, &addr, size);
        Ok(())
    }

    fn emit_load(&mut self, dest: Dest, addr: &VarAddress, size: u32) {
        if size == 1 {
            // Nothing may linger in the high half.
            self.emit(format!("xor {0}, {0}", dest.word()));
            self.emit(format!("mov {}, [{addr}]", dest.byte()));
            self.byte_compare = true;
        } else {
            self.emit(format!("mov {}, [{addr}]", dest.word()));
        }
    }

    /// The size of the bytes a use actually reads or writes.
    fn load_size(&mut self, final_def: Node, var_iden: Node) -> GenResult<u32> {
        let final_iden = self.final_identifier(var_iden)?;
        let indexed = self.tree.role(final_iden, Role::RootArrayIndex).is_some();
        // Indexing a pointer that declares no bounds reads the pointed-to
        // element, not the pointer.
        let ignore_pointer = indexed
            && self.tree.vdef_is_pointer(final_def)
            && !self.def_has_bounds(final_def);
        self.size_query(self.tree.vdef_element_size(final_def, ignore_pointer), final_def)
    }

    /// The last variable identifier of an access chain.
    fn final_identifier(&self, var_iden: Node) -> GenResult<Node> {
        let mut cur = var_iden;
        while let Some(access) = self.tree.role(cur, Role::StructAccess) {
            cur = self.tree.required_role(access, Role::VarIdentifier)?;
        }
        Ok(cur)
    }

    fn def_has_bounds(&self, def: Node) -> bool {
        self.tree
            .role(def, Role::VarIdentifier)
            .and_then(|iden| self.tree.role(iden, Role::RootArrayIndex))
            .is_some()
    }

    /// The address of a declaration's own storage (used for initializers).
    /// The declaration's identifier carries array bounds, not indexes, so
    /// this resolves the bare variable.
    fn local_address(&mut self, vdef: Node) -> GenResult<VarAddress> {
        self.root_address(vdef)
    }

    // ------------------------------------------------------------------
    // Pointers.
    // ------------------------------------------------------------------

    /// Compute the place a `PTR` node designates: load the pointer's value
    /// into `bx` and dig one level per extra dereference. The pointer is
    /// never pre-loaded, so the depth is applied exactly.
    fn emit_ptr_place(&mut self, ptr: Node) -> GenResult<VarAddress> {
        let inner = self.tree.required_role(ptr, Role::Exp)?;
        let depth = self.tree.ptr_depth(ptr).max(1);
        if self.tree.kind(inner) == NodeKind::VarIdentifier {
            let addr = self.resolve_var(inner)?;
            self.emit(format!("mov bx, [{addr}]"));
        } else {
            self.emit_expr_into_ax(inner)?;
            self.emit("mov bx, ax");
        }
        for _ in 1..depth {
            self.emit("mov bx, [bx]");
        }
        Ok(VarAddress {
            base: Base::Bx,
            offset: 0,
            index: false,
        })
    }

    /// How many bytes a dereference touches: the full element only when the
    /// dereference depth consumes the whole declared pointer depth.
    fn pointee_size(&mut self, ptr: Node) -> GenResult<u32> {
        let inner = self.tree.required_role(ptr, Role::Exp)?;
        if self.tree.kind(inner) != NodeKind::VarIdentifier {
            return Ok(POINTER_SIZE);
        }
        let def = self.final_definition(inner)?;
        let depth = self.tree.ptr_depth(ptr).max(1);
        if depth == self.tree.vdef_ptr_depth(def) {
            self.size_query(self.tree.vdef_element_size(def, true), def)
        } else {
            Ok(POINTER_SIZE)
        }
    }

    // ------------------------------------------------------------------
    // Comparisons and logic.
    // ------------------------------------------------------------------

    fn setup_cmp(&mut self) {
        debug_assert!(self.cmp.is_none(), "already comparing");
        self.cmp = Some(CmpLabels {
            false_lbl: self.unique_label(),
            end_lbl: self.unique_label(),
            true_lbl: self.unique_label(),
            last_logic: Logic::None,
        });
    }

    /// Materialise a pending comparison into `0`/`1` in `ax`.
    fn finalize_cmp(&mut self) {
        let Some(cmp) = self.cmp.take() else {
            return;
        };
        self.place_label(&cmp.false_lbl);
        self.emit("mov ax, 0");
        self.emit(format!("jmp {}", cmp.end_lbl));
        self.place_label(&cmp.true_lbl);
        self.emit("mov ax, 1");
        self.place_label(&cmp.end_lbl);
    }

    /// Hand a statement the pending comparison's labels, or synthesise a
    /// zero test when the condition was a plain value.
    fn consume_cond(&mut self) -> GenResult<(String, String)> {
        if let Some(cmp) = self.cmp.take() {
            return Ok((cmp.true_lbl, cmp.false_lbl));
        }
        let true_lbl = self.unique_label();
        let false_lbl = self.unique_label();
        self.emit("cmp ax, 0");
        self.emit(format!("je {false_lbl}"));
        Ok((true_lbl, false_lbl))
    }

    fn emit_logical(&mut self, e: Node, op: &str) -> GenResult<()> {
        let children = self.tree.children(e);
        if children.len() != 2 {
            return Err(GenError::Internal(format!(
                "E node has {} children where 2 were expected",
                children.len()
            )));
        }
        let (l, r) = (children[0], children[1]);
        let logic = if op == "&&" { Logic::And } else { Logic::Or };

        let owner = self.cmp.is_none();
        if owner {
            self.setup_cmp();
        }
        if let Some(cmp) = self.cmp.as_mut() {
            cmp.last_logic = logic;
        }
        self.emit_expr(l)?;
        if let Some(cmp) = self.cmp.as_mut() {
            cmp.last_logic = logic;
        }
        self.emit_expr(r)?;

        if op == "&&" {
            // Both comparisons passed by falling through.
            let true_lbl = self.cmp.as_ref().map(|c| c.true_lbl.clone());
            if let Some(lbl) = true_lbl {
                self.emit(format!("jmp {lbl}"));
            }
        } else if !owner {
            // All alternatives of a nested `||` were exhausted.
            let false_lbl = self.cmp.as_ref().map(|c| c.false_lbl.clone());
            if let Some(lbl) = false_lbl {
                self.emit(format!("jmp {lbl}"));
            }
        }

        if owner {
            self.finalize_cmp();
        }
        Ok(())
    }

    fn emit_compare(&mut self, op: &str, lreg: &str, rreg: &str) -> GenResult<()> {
        self.emit(format!("cmp {lreg}, {rreg}"));
        let (and_mode, false_lbl, true_lbl) = match self.cmp.as_ref() {
            Some(cmp) => (
                cmp.last_logic != Logic::Or,
                cmp.false_lbl.clone(),
                cmp.true_lbl.clone(),
            ),
            None => {
                return Err(GenError::Internal(
                    "comparison without labels".to_string(),
                ))
            }
        };
        let signed = self.signed;
        // In `&&` (or bare) context a failing comparison bails to the false
        // label; in `||` context a passing one escapes to the true label.
        let (jump, target) = match (op, and_mode, signed) {
            ("==", true, _) => ("jne", false_lbl),
            ("==", false, _) => ("je", true_lbl),
            ("!=", true, _) => ("je", false_lbl),
            ("!=", false, _) => ("jne", true_lbl),
            ("<=", true, true) => ("jg", false_lbl),
            ("<=", true, false) => ("ja", false_lbl),
            ("<=", false, true) => ("jle", true_lbl),
            ("<=", false, false) => ("jbe", true_lbl),
            (">=", true, true) => ("jl", false_lbl),
            (">=", true, false) => ("jb", false_lbl),
            (">=", false, true) => ("jge", true_lbl),
            (">=", false, false) => ("jae", true_lbl),
            ("<", true, true) => ("jge", false_lbl),
            ("<", true, false) => ("jae", false_lbl),
            ("<", false, true) => ("jl", true_lbl),
            ("<", false, false) => ("jb", true_lbl),
            (">", true, true) => ("jle", false_lbl),
            (">", true, false) => ("jbe", false_lbl),
            (">", false, true) => ("jg", true_lbl),
            (">", false, false) => ("ja", true_lbl),
            _ => {
                return Err(GenError::Internal(format!(
                    "\"{op}\" is not a comparison operator"
                )))
            }
        };
        self.emit(format!("{jump} {target}"));
        self.signed = false;
        Ok(())
    }

    fn emit_logical_not(&mut self, e: Node, dest: Dest) -> GenResult<()> {
        let subject = self.tree.required_role(e, Role::Subject)?;
        self.emit_expr_into_ax(subject)?;
        let zero_lbl = self.unique_label();
        let end_lbl = self.unique_label();
        self.emit("test ax, ax");
        self.emit(format!("je {zero_lbl}"));
        self.emit("xor ax, ax");
        self.emit(format!("jmp {end_lbl}"));
        self.place_label(&zero_lbl);
        self.emit("mov ax, 1");
        self.place_label(&end_lbl);
        if dest == Dest::Cx {
            self.emit("mov cx, ax");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arithmetic.
    // ------------------------------------------------------------------

    fn emit_math(&mut self, op: &str) -> GenResult<()> {
        match op {
            "+" => self.emit("add ax, cx"),
            "-" => self.emit("sub ax, cx"),
            "*" => {
                // mul/imul widen into dx:ax.
                self.emit("xor dx, dx");
                if self.signed {
                    self.emit("imul cx");
                } else {
                    self.emit("mul cx");
                }
            }
            "/" => {
                self.emit("xor dx, dx");
                if self.signed {
                    self.emit("idiv cx");
                } else {
                    self.emit("div cx");
                }
            }
            "%" => {
                self.emit("xor dx, dx");
                self.emit("div cx");
                self.emit("mov ax, dx");
            }
            "^" => self.emit("xor ax, cx"),
            "|" => self.emit("or ax, cx"),
            "&" => self.emit("and ax, cx"),
            "<<" => self.emit("rcl ax, cl"),
            ">>" => self.emit("rcr ax, cl"),
            _ => {
                return Err(GenError::Internal(format!(
                    "\"{op}\" is not a binary operator"
                )))
            }
        }
        self.signed = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stack unwinding.
    // ------------------------------------------------------------------

    /// Bytes declared by every scope from `from` up to and including
    /// `until`.
    fn unwind_incl(&mut self, from: Node, until: Node) -> GenResult<u32> {
        let mut scope = from;
        let mut size = 0;
        loop {
            size += self.size_query(self.tree.scope_declared_size(scope), scope)?;
            if scope == until || self.tree.kind(scope) == NodeKind::Root {
                return Ok(size);
            }
            scope = self
                .tree
                .scope_of(scope)
                .ok_or_else(|| GenError::Internal("scope chain broke".to_string()))?;
        }
    }

    /// Bytes declared by every scope from `from` up to but excluding
    /// `until`.
    fn unwind_excl(&mut self, from: Node, until: Node) -> GenResult<u32> {
        if from == until {
            return Ok(0);
        }
        let mut scope = from;
        let mut size = 0;
        loop {
            size += self.size_query(self.tree.scope_declared_size(scope), scope)?;
            let next = self
                .tree
                .scope_of(scope)
                .ok_or_else(|| GenError::Internal("scope chain broke".to_string()))?;
            if next == until || self.tree.kind(scope) == NodeKind::Root {
                return Ok(size);
            }
            scope = next;
        }
    }

}

fn is_compare_op(op: &str) -> bool {
    matches!(op, "==" | "!=" | "<=" | ">=" | "<" | ">")
}
