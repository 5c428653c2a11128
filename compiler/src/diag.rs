// diag.rs — Diagnostics for the HLO front end
//
// Shared diagnostic types used while resolving parsed HLO text into a module.
// Resolution keeps going after the first problem so a single run reports
// every broken reference.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0102`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Two computations share a name.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Two instructions in one computation share a name.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Operand names an instruction not defined earlier in the computation.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Unknown opcode.
    pub const E0103: DiagCode = DiagCode("E0103");
    /// Unknown element type.
    pub const E0104: DiagCode = DiagCode("E0104");
    /// `calls=` / `to_apply=` names an unknown computation.
    pub const E0105: DiagCode = DiagCode("E0105");
    /// Missing or duplicated ENTRY computation.
    pub const E0106: DiagCode = DiagCode("E0106");
    /// Computation has no instructions.
    pub const E0107: DiagCode = DiagCode("E0107");
    /// Layout is not a permutation of the shape's dimensions.
    pub const E0108: DiagCode = DiagCode("E0108");
    /// Parameter numbering is missing, duplicated or does not match the caller.
    pub const E0109: DiagCode = DiagCode("E0109");
    /// Attribute is missing or malformed for the opcode.
    pub const E0110: DiagCode = DiagCode("E0110");
    /// Operand count or shape does not fit the opcode.
    pub const E0111: DiagCode = DiagCode("E0111");

    /// Attribute the analyzer does not know; it is ignored.
    pub const W0120: DiagCode = DiagCode("W0120");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A front-end diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    /// Shorthand for a coded error.
    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    /// Shorthand for a coded warning.
    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        write!(f, " at {}..{}", self.span.start, self.span.end)?;
        for related in &self.related_spans {
            write!(f, "\n  note: {} at {}..{}", related.label, related.span.start, related.span.end)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
