//! Syntax tree node definitions.
//!
//! A [`Node`](crate::Node) is an entity reference into the [`Tree`] arena;
//! this module defines the data stored behind it. Every node has a kind tag,
//! a text payload (operator text, literal text or identifier name), an
//! ordered child list, and a small table of role-named children for the kinds
//! that address their children by role rather than position. Parent, root and
//! enclosing-scope back-edges are packed handle copies, never references.
//!
//! [`Tree`]: crate::Tree

use crate::entity::PackedOption;
use crate::Node;
use core::fmt;
use smallvec::SmallVec;

/// The kind tag of a syntax tree node.
///
/// The `Display` implementation renders the historical tag names used by
/// diagnostics and debug dumps (`V_DEF`, `VAR_IDENTIFIER`, ...); token kinds
/// render in lower case (`number`, `identifier`, ...).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum NodeKind {
    /// The root of a parsed translation unit.
    Root,
    /// A function definition with a body.
    Func,
    /// A function declaration without a body (an external function).
    FuncDef,
    /// A brace-delimited statement list; introduces a lexical scope.
    Body,
    /// A variable definition.
    VDef,
    /// A structure declaration (`struct Name { ... }`).
    Struct,
    /// A variable definition whose data type is a structure tag.
    StructDef,
    /// A `.` or `->` access hanging off a variable identifier.
    StructAccess,
    /// An assignment statement; the payload holds the operator (`=`, `+=`, ...).
    Assign,
    /// A binary expression; the payload holds the operator.
    Expr,
    /// A use of a variable, optionally with indexes and structure access.
    VarIdentifier,
    /// One array index in a chain; holds the index value and optionally the
    /// next index.
    ArrayIndex,
    /// A pointer dereference around an expression.
    Ptr,
    /// `&variable`.
    AddressOf,
    /// `!expression`.
    LogicalNot,
    /// A call to a function.
    FuncCall,
    /// A `return` statement with an optional value expression.
    Return,
    /// An `if` statement, optionally chaining an else-if or else.
    If,
    /// The `else` arm of an `if`.
    Else,
    /// A `for` loop; introduces a lexical scope covering its init clause.
    For,
    /// A `while` loop.
    While,
    /// `break`.
    Break,
    /// `continue`.
    Continue,
    /// An inline assembly statement.
    Asm,
    /// One substitution argument inside an inline assembly statement.
    AsmArg,
    /// A preprocessor `ifdef` block.
    MacroIfDef,
    /// A preprocessor `define`.
    MacroDefine,
    /// A plain holder for ordered children: function arguments, call
    /// parameters, inline-asm arguments. Not a scope.
    Args,

    // Token kinds produced by the lexer.
    /// A numeric literal token.
    Number,
    /// A string literal token.
    Str,
    /// An identifier token.
    Identifier,
    /// A keyword token (data type names and friends).
    Keyword,
    /// An operator token.
    Operator,
    /// A punctuation token.
    Symbol,
    /// A register name token (inline assembly).
    Register,
}

impl NodeKind {
    /// Does this kind introduce a lexical scope?
    ///
    /// Scope nodes are the anchors of name lookup and of stack frame size
    /// computation: `ROOT` holds globals, `BODY` holds locals, `FOR` holds
    /// its init clause's variable, and `STRUCT` holds member definitions.
    pub fn is_scope(self) -> bool {
        matches!(self, Self::Root | Self::Body | Self::For | Self::Struct)
    }

    /// Is this a variable definition kind? `STRUCT_DEF` is a `V_DEF` whose
    /// data type names a structure; everywhere a definition is expected both
    /// kinds qualify.
    pub fn is_vdef(self) -> bool {
        matches!(self, Self::VDef | Self::StructDef)
    }

    /// Is this a leaf token kind produced by the lexer?
    pub fn is_token(self) -> bool {
        matches!(
            self,
            Self::Number
                | Self::Str
                | Self::Identifier
                | Self::Keyword
                | Self::Operator
                | Self::Symbol
                | Self::Register
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Root => "ROOT",
            Self::Func => "FUNC",
            Self::FuncDef => "FUNC_DEF",
            Self::Body => "BODY",
            Self::VDef => "V_DEF",
            Self::Struct => "STRUCT",
            Self::StructDef => "STRUCT_DEF",
            Self::StructAccess => "STRUCT_ACCESS",
            Self::Assign => "ASSIGN",
            Self::Expr => "E",
            Self::VarIdentifier => "VAR_IDENTIFIER",
            Self::ArrayIndex => "ARRAY_INDEX",
            Self::Ptr => "PTR",
            Self::AddressOf => "ADDRESS_OF",
            Self::LogicalNot => "LOGICAL_NOT",
            Self::FuncCall => "FUNC_CALL",
            Self::Return => "RETURN",
            Self::If => "IF",
            Self::Else => "ELSE",
            Self::For => "FOR",
            Self::While => "WHILE",
            Self::Break => "BREAK",
            Self::Continue => "CONTINUE",
            Self::Asm => "ASM",
            Self::AsmArg => "ASM_ARG",
            Self::MacroIfDef => "MACRO_IFDEF",
            Self::MacroDefine => "MACRO_DEFINE",
            Self::Args => "ARGUMENTS",
            Self::Number => "number",
            Self::Str => "string",
            Self::Identifier => "identifier",
            Self::Keyword => "keyword",
            Self::Operator => "operator",
            Self::Symbol => "symbol",
            Self::Register => "register",
        };
        f.write_str(name)
    }
}

/// The role under which a child is registered on its parent.
///
/// Role lookup is how structured kinds address their children: a `V_DEF`
/// fetches its `DataType` and `VarIdentifier` branches by role, not by child
/// position. Children registered under a role are also present in the
/// ordered child list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// A function's return type keyword.
    ReturnType,
    /// The name token of a function, structure, call or macro.
    Name,
    /// A function's argument list holder, or a call's parameter list holder.
    Arguments,
    /// A function, loop or conditional body.
    Body,
    /// The data type keyword of a variable definition.
    DataType,
    /// The variable identifier of a definition, assignment target or
    /// address-of.
    VarIdentifier,
    /// The initializer expression of a variable definition.
    ValueExp,
    /// The first array index hanging off a variable identifier.
    RootArrayIndex,
    /// The structure access hanging off a variable identifier.
    StructAccess,
    /// A structure declaration's member body.
    StructBody,
    /// A generic single value child (array index value, assignment value,
    /// macro definition value, inline-asm argument value).
    Value,
    /// The next link in an array index chain, or the trailing text of an
    /// inline-asm argument.
    Next,
    /// A loop or conditional condition expression.
    Cond,
    /// A `for` loop's init clause.
    Init,
    /// A `for` loop's step clause.
    Loop,
    /// The chained `else if` of an `if` statement.
    ElseIf,
    /// The `else` arm of an `if` statement.
    Else,
    /// A wrapped expression (`return`, `PTR`).
    Exp,
    /// The operand of a logical not.
    Subject,
    /// The literal text that starts an inline assembly statement.
    AsmStart,
    /// The argument list holder of an inline assembly statement.
    AsmArgs,
    /// The symbol a `MACRO_IFDEF` tests for.
    Requirement,
}

/// The storage class of a defined variable, deciding which base its address
/// is computed from.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VarClass {
    /// Lives in the `data` segment; addressed relative to its start.
    #[default]
    Global,
    /// Lives in the current stack frame below the frame pointer.
    FunctionLocal,
    /// Pushed by the caller; lives above the saved frame pointer and return
    /// address.
    FunctionArgument,
}

/// A source position carried by tokens and reported in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SourcePos {
    /// 1-based line number, or 0 when synthesized.
    pub line: u32,
    /// 1-based column number, or 0 when synthesized.
    pub col: u32,
}

impl SourcePos {
    /// A position for synthesized nodes with no source location.
    pub const NONE: Self = Self { line: 0, col: 0 };

    /// Create a source position.
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.line == 0 {
            write!(f, "<generated>")
        } else {
            write!(f, "{}:{}", self.line, self.col)
        }
    }
}

/// Kind-specific payload stored inline in the node record.
#[derive(Clone, Debug, Default)]
pub enum KindData {
    /// No extra payload.
    #[default]
    None,
    /// Payload of `V_DEF` and `STRUCT_DEF` nodes.
    VDef {
        /// Storage class, assigned by the tree improver.
        class: VarClass,
        /// Pointer flag and depth; depth 0 means not a pointer.
        ptr_depth: u8,
        /// Size override in bytes. Function arguments are widened to the
        /// machine word by the code generator.
        custom_size: Option<u16>,
    },
    /// Payload of `VAR_IDENTIFIER` nodes: the defining `V_DEF`, attached by
    /// the tree improver.
    VarUse {
        /// The resolved definition, if the improver found one.
        def: PackedOption<Node>,
    },
    /// Payload of `PTR` nodes: how many `*` were applied.
    Ptr {
        /// Dereference depth, at least 1.
        depth: u8,
    },
    /// Payload of `STRUCT_ACCESS` nodes.
    StructAccess {
        /// `true` for `->`, `false` for `.`.
        as_pointer: bool,
    },
}

/// The record stored in the arena for one node.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub(crate) kind: NodeKind,
    pub(crate) text: String,
    pub(crate) pos: SourcePos,
    pub(crate) children: Vec<Node>,
    pub(crate) roles: SmallVec<[(Role, Node); 4]>,
    pub(crate) parent: PackedOption<Node>,
    pub(crate) root: PackedOption<Node>,
    pub(crate) scope: PackedOption<Node>,
    pub(crate) replaced_by: PackedOption<Node>,
    pub(crate) removed: bool,
    pub(crate) variant: KindData,
}

impl NodeData {
    pub(crate) fn new(kind: NodeKind, text: String, pos: SourcePos) -> Self {
        let variant = match kind {
            NodeKind::VDef | NodeKind::StructDef => KindData::VDef {
                class: VarClass::Global,
                ptr_depth: 0,
                custom_size: None,
            },
            NodeKind::VarIdentifier => KindData::VarUse {
                def: Default::default(),
            },
            NodeKind::Ptr => KindData::Ptr { depth: 1 },
            NodeKind::StructAccess => KindData::StructAccess { as_pointer: false },
            _ => KindData::None,
        };
        Self {
            kind,
            text,
            pos,
            children: Vec::new(),
            roles: SmallVec::new(),
            parent: Default::default(),
            root: Default::default(),
            scope: Default::default(),
            replaced_by: Default::default(),
            removed: false,
            variant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_tag_names() {
        assert_eq!(NodeKind::VDef.to_string(), "V_DEF");
        assert_eq!(NodeKind::Expr.to_string(), "E");
        assert_eq!(NodeKind::Number.to_string(), "number");
    }

    #[test]
    fn scope_kinds() {
        assert!(NodeKind::Root.is_scope());
        assert!(NodeKind::Body.is_scope());
        assert!(NodeKind::For.is_scope());
        assert!(NodeKind::Struct.is_scope());
        assert!(!NodeKind::If.is_scope());
        assert!(!NodeKind::Func.is_scope());
    }

    #[test]
    fn pos_display() {
        assert_eq!(SourcePos::new(3, 14).to_string(), "3:14");
        assert_eq!(SourcePos::NONE.to_string(), "<generated>");
    }
}
