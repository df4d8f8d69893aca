//! A compilation context.
//!
//! The context owns per-compilation pass state (the preprocessor's
//! definitions table) and strings the phases together: preprocess, improve,
//! validate, generate, assemble. Holding onto a context between compilations
//! avoids nothing — the compiler is stateless across invocations — but gives
//! embedders one place to preregister macro definitions.

use crate::asm;
use crate::codegen;
use smelt_ast::{Diagnostics, Preprocessor, SemanticValidator, Tree, TreeImprover};
use smelt_object::VirtualObject;

/// A hard failure of the pipeline. User-correctable input problems are
/// reported through the returned [`Diagnostics`] instead.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The code generator tripped over a structural invariant.
    #[error(transparent)]
    Codegen(#[from] codegen::CodegenError),
    /// A tree mutation failed during preprocessing or improvement.
    #[error("tree error: {0}")]
    Tree(#[from] smelt_ast::TreeError),
    /// The assembler rejected the assembly text. For generated text this is
    /// a compiler bug; for inline assembly it is the programmer's, and the
    /// line number points into the assembled text.
    #[error("assembler error: {0}")]
    Asm(#[from] asm::AsmError),
}

/// Drives a tree through the full middle and back end.
#[derive(Default)]
pub struct Context {
    /// The preprocessor, exposed so embedders can seed definitions before
    /// compiling (command-line `-D` style).
    pub preprocessor: Preprocessor,
}

impl Context {
    /// Create a fresh context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a freshly parsed tree into `object`.
    ///
    /// Runs the preprocessor and the tree improver first, then validates,
    /// generates 8086 assembly and assembles it. Returns the collected
    /// diagnostics; when they contain errors the object was not written to.
    pub fn compile(
        &mut self,
        tree: &mut Tree,
        object: &mut VirtualObject,
    ) -> Result<Diagnostics, CompileError> {
        self.preprocessor.process(tree)?;
        TreeImprover::new(tree).improve()?;
        self.compile_improved(tree, object)
    }

    /// Compile a tree that has already been improved.
    ///
    /// This is the library entry point for front ends that run the improver
    /// themselves: semantic validation, code generation and assembly into
    /// the object sink, with diagnostics returned.
    pub fn compile_improved(
        &mut self,
        tree: &Tree,
        object: &mut VirtualObject,
    ) -> Result<Diagnostics, CompileError> {
        let mut diags = SemanticValidator::new(tree).validate();
        if diags.has_errors() {
            return Ok(diags);
        }
        let (text, gen_diags) = codegen::generate(tree)?;
        diags.extend(gen_diags);
        if diags.has_errors() {
            return Ok(diags);
        }
        log::trace!("generated assembly:\n{text}");
        asm::assemble(&text, object)?;
        Ok(diags)
    }
}
