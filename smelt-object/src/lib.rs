//! Relocatable virtual object containers for the Smelt compiler.
//!
//! The assembler in `smelt-codegen` emits machine code into the structures
//! defined here: little-endian byte [`Stream`]s, named [`VirtualSegment`]s
//! carrying label tables and [`Relocation`] records, and the
//! [`VirtualObject`] container that groups segments with the global and
//! external symbol references a linker needs.
//!
//! Concrete on-disk object formats are written as backends over this crate:
//! a format serializes the container however it likes, but the abstract
//! structure — segments, label offsets, relocations, global references,
//! external references — is fixed here.

#![warn(missing_docs)]

mod object;
mod segment;
mod stream;

pub use object::{GlobalRef, ObjectError, VirtualObject};
pub use segment::{Addend, RelocKind, Relocation, SegOffset, VirtualSegment};
pub use stream::{Stream, StreamError};
