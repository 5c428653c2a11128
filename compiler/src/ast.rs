// ast.rs — Untyped syntax tree for HLO module text
//
// Produced by the parser, consumed by `hlo::build_module`. Names are still
// strings here; resolution to instruction/computation ids happens in the
// builder. Every node carries a `SimpleSpan` for error reporting.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// A name with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

/// Top-level module: optional `HloModule name` header plus computations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleAst {
    pub name: Option<Ident>,
    pub computations: Vec<ComputationAst>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputationAst {
    pub name: Ident,
    pub is_entry: bool,
    pub instructions: Vec<InstructionAst>,
    pub span: Span,
}

/// `[ROOT] name = shape opcode(operands), attr=value, ...`
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionAst {
    pub name: Ident,
    pub is_root: bool,
    pub shape: ShapeAst,
    pub opcode: Ident,
    pub operands: Vec<OperandAst>,
    pub attributes: Vec<AttributeAst>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeAst {
    /// `f32[32,64]{1,0}`; the layout is optional.
    Array {
        element_type: Ident,
        dims: Vec<i64>,
        layout: Option<Vec<i64>>,
        span: Span,
    },
    /// `(f32[8], s32[8])`
    Tuple(Vec<ShapeAst>, Span),
}

impl ShapeAst {
    pub fn span(&self) -> Span {
        match self {
            ShapeAst::Array { span, .. } => *span,
            ShapeAst::Tuple(_, span) => *span,
        }
    }
}

/// Operand position inside `opcode(...)`: an instruction name, or a literal
/// for `parameter(0)` / `constant(1.5)`.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandAst {
    Name(Ident),
    Int(i64, Span),
    Float(f64, Span),
}

impl OperandAst {
    pub fn span(&self) -> Span {
        match self {
            OperandAst::Name(ident) => ident.span,
            OperandAst::Int(_, span) | OperandAst::Float(_, span) => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeAst {
    pub name: Ident,
    pub value: AttrValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// `{1,0}`
    Ints(Vec<i64>, Span),
    /// `{[0:16:1], [2:34]}`
    Slices(Vec<SliceAst>, Span),
    /// `fused_computation`, `kLoop`, `GT`
    Name(Ident),
    /// `1`
    Int(i64, Span),
}

impl AttrValue {
    pub fn span(&self) -> Span {
        match self {
            AttrValue::Ints(_, span) | AttrValue::Slices(_, span) | AttrValue::Int(_, span) => *span,
            AttrValue::Name(ident) => ident.span,
        }
    }
}

/// One `[start:limit(:stride)?]` entry of a `slice=` attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceAst {
    pub start: i64,
    pub limit: i64,
    pub stride: Option<i64>,
}
