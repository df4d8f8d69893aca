//! Diagnostics collected during semantic analysis and code generation.
//!
//! User-correctable problems never abort the pipeline through `Err`; they
//! accumulate here so one run can surface as many of them as possible. A
//! `Fatal` diagnostic is the exception: the pass that produced it stops.

use crate::node::SourcePos;
use core::fmt;

/// How bad a diagnostic is.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Severity {
    /// Informational only.
    Note,
    /// Suspicious but accepted.
    Warn,
    /// The input is invalid; later phases will not run.
    Error,
    /// The input is invalid and the current pass cannot continue.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Note => "note",
            Self::Warn => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One reported problem.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Severity class.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Where in the source the problem was found.
    pub pos: SourcePos,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} at {}", self.severity, self.message, self.pos)
    }
}

/// An ordered collection of diagnostics.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    /// An empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a diagnostic.
    pub fn push(&mut self, severity: Severity, message: impl Into<String>, pos: SourcePos) {
        let message = message.into();
        log::debug!("diagnostic: {severity}: {message} at {pos}");
        self.list.push(Diagnostic {
            severity,
            message,
            pos,
        });
    }

    /// Append an `Error` diagnostic.
    pub fn error(&mut self, message: impl Into<String>, pos: SourcePos) {
        self.push(Severity::Error, message, pos);
    }

    /// Append a `Warn` diagnostic.
    pub fn warn(&mut self, message: impl Into<String>, pos: SourcePos) {
        self.push(Severity::Warn, message, pos);
    }

    /// Append a `Fatal` diagnostic.
    pub fn fatal(&mut self, message: impl Into<String>, pos: SourcePos) {
        self.push(Severity::Fatal, message, pos);
    }

    /// Did anything at `Error` severity or worse get reported?
    pub fn has_errors(&self) -> bool {
        self.list.iter().any(|d| d.severity >= Severity::Error)
    }

    /// Number of collected diagnostics.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Is the collection empty?
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Iterate over the diagnostics in report order.
    pub fn iter(&self) -> core::slice::Iter<'_, Diagnostic> {
        self.list.iter()
    }

    /// Absorb another collection, keeping report order.
    pub fn extend(&mut self, other: Diagnostics) {
        self.list.extend(other.list);
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for d in &self.list {
            writeln!(f, "{d}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = core::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Fatal > Severity::Error);
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Warn > Severity::Note);
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let mut d = Diagnostics::new();
        d.warn("looks odd", SourcePos::NONE);
        assert!(!d.has_errors());
        d.error("broken", SourcePos::NONE);
        assert!(d.has_errors());
        assert_eq!(d.len(), 2);
    }
}
