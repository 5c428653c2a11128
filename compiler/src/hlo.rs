// hlo.rs — Read-only HLO module model and name resolution
//
// The analyzer reads this IR and never mutates it. `build_module` turns the
// parsed AST into a module with stable `InstrId`/`ComputationId` identity and
// validates the structural facts that index derivation relies on (operand
// arity, permutation attributes, layouts, parameter numbering).
//
// Preconditions: `ast` is a parser result with no syntax errors.
// Postconditions: returns a module whose instructions reference only
//                 instructions defined earlier in the same computation.
// Failure modes: unresolved names, bad attributes, bad layouts → `Diagnostic`s.
// Side effects: none.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::ast::*;
use crate::diag::{codes, Diagnostic};
use crate::error::FrontendError;
use crate::id::{ComputationId, IdAllocator, InstrId};

// ── Element types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
}

impl PrimitiveType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "pred" => PrimitiveType::Pred,
            "s8" => PrimitiveType::S8,
            "s16" => PrimitiveType::S16,
            "s32" => PrimitiveType::S32,
            "s64" => PrimitiveType::S64,
            "u8" => PrimitiveType::U8,
            "u16" => PrimitiveType::U16,
            "u32" => PrimitiveType::U32,
            "u64" => PrimitiveType::U64,
            "f16" => PrimitiveType::F16,
            "bf16" => PrimitiveType::Bf16,
            "f32" => PrimitiveType::F32,
            "f64" => PrimitiveType::F64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S8 => "s8",
            PrimitiveType::S16 => "s16",
            PrimitiveType::S32 => "s32",
            PrimitiveType::S64 => "s64",
            PrimitiveType::U8 => "u8",
            PrimitiveType::U16 => "u16",
            PrimitiveType::U32 => "u32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::F16 => "f16",
            PrimitiveType::Bf16 => "bf16",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            PrimitiveType::Pred | PrimitiveType::S8 | PrimitiveType::U8 => 1,
            PrimitiveType::S16 | PrimitiveType::U16 | PrimitiveType::F16 | PrimitiveType::Bf16 => 2,
            PrimitiveType::S32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::S64 | PrimitiveType::U64 | PrimitiveType::F64 => 8,
        }
    }
}

// ── Shapes ──────────────────────────────────────────────────────────────────

/// A dense array shape with a physical layout.
///
/// `minor_to_major[0]` is the logical dimension that varies fastest in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub element_type: PrimitiveType,
    pub dims: Vec<i64>,
    pub minor_to_major: Vec<usize>,
}

impl ArrayShape {
    /// Shape with the default (row-major) layout.
    pub fn new(element_type: PrimitiveType, dims: Vec<i64>) -> Self {
        let minor_to_major = (0..dims.len()).rev().collect();
        ArrayShape {
            element_type,
            dims,
            minor_to_major,
        }
    }

    pub fn with_layout(element_type: PrimitiveType, dims: Vec<i64>, minor_to_major: Vec<usize>) -> Self {
        ArrayShape {
            element_type,
            dims,
            minor_to_major,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Element stride of each logical dimension in the physical buffer.
    pub fn physical_strides(&self) -> Vec<i64> {
        let mut strides = vec![0; self.rank()];
        let mut stride = 1;
        for &dim in &self.minor_to_major {
            strides[dim] = stride;
            stride *= self.dims[dim];
        }
        strides
    }

    /// The fastest-varying logical dimension whose size is not 1.
    pub fn minor_most_non_degenerate_dim(&self) -> Option<usize> {
        self.minor_to_major
            .iter()
            .copied()
            .find(|&dim| self.dims[dim] != 1)
    }

    pub fn has_default_layout(&self) -> bool {
        self.minor_to_major
            .iter()
            .copied()
            .eq((0..self.rank()).rev())
    }
}

impl fmt::Display for ArrayShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{}[{}]", self.element_type.name(), dims.join(","))?;
        if self.rank() > 0 {
            let layout: Vec<String> = self.minor_to_major.iter().map(|d| d.to_string()).collect();
            write!(f, "{{{}}}", layout.join(","))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<ArrayShape>),
}

impl Shape {
    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Shape::Array(shape) => Some(shape),
            Shape::Tuple(_) => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array(shape) => write!(f, "{}", shape),
            Shape::Tuple(elems) => {
                let elems: Vec<String> = elems.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", elems.join(", "))
            }
        }
    }
}

// ── Opcodes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Opcode {
    Parameter,
    Constant,
    Iota,
    Broadcast,
    Transpose,
    Reshape,
    Bitcast,
    Copy,
    Slice,
    Concatenate,
    Reduce,
    DynamicSlice,
    Gather,
    Scatter,
    Tuple,
    Fusion,
    // Elementwise.
    Abs,
    Add,
    And,
    Compare,
    Convert,
    Divide,
    Exp,
    Log,
    Maximum,
    Minimum,
    Multiply,
    Negate,
    Or,
    Power,
    Rsqrt,
    Select,
    Sqrt,
    Subtract,
    Tanh,
}

const OPCODE_NAMES: &[(Opcode, &str)] = &[
    (Opcode::Parameter, "parameter"),
    (Opcode::Constant, "constant"),
    (Opcode::Iota, "iota"),
    (Opcode::Broadcast, "broadcast"),
    (Opcode::Transpose, "transpose"),
    (Opcode::Reshape, "reshape"),
    (Opcode::Bitcast, "bitcast"),
    (Opcode::Copy, "copy"),
    (Opcode::Slice, "slice"),
    (Opcode::Concatenate, "concatenate"),
    (Opcode::Reduce, "reduce"),
    (Opcode::DynamicSlice, "dynamic-slice"),
    (Opcode::Gather, "gather"),
    (Opcode::Scatter, "scatter"),
    (Opcode::Tuple, "tuple"),
    (Opcode::Fusion, "fusion"),
    (Opcode::Abs, "abs"),
    (Opcode::Add, "add"),
    (Opcode::And, "and"),
    (Opcode::Compare, "compare"),
    (Opcode::Convert, "convert"),
    (Opcode::Divide, "divide"),
    (Opcode::Exp, "exponential"),
    (Opcode::Log, "log"),
    (Opcode::Maximum, "maximum"),
    (Opcode::Minimum, "minimum"),
    (Opcode::Multiply, "multiply"),
    (Opcode::Negate, "negate"),
    (Opcode::Or, "or"),
    (Opcode::Power, "power"),
    (Opcode::Rsqrt, "rsqrt"),
    (Opcode::Select, "select"),
    (Opcode::Sqrt, "sqrt"),
    (Opcode::Subtract, "subtract"),
    (Opcode::Tanh, "tanh"),
];

impl Opcode {
    pub fn from_name(name: &str) -> Option<Self> {
        // `exp` is accepted as a short alias.
        if name == "exp" {
            return Some(Opcode::Exp);
        }
        OPCODE_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(op, _)| *op)
    }

    pub fn name(self) -> &'static str {
        OPCODE_NAMES
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }

    pub fn is_elementwise(self) -> bool {
        self.elementwise_arity().is_some()
    }

    fn elementwise_arity(self) -> Option<usize> {
        match self {
            Opcode::Abs
            | Opcode::Convert
            | Opcode::Exp
            | Opcode::Log
            | Opcode::Negate
            | Opcode::Rsqrt
            | Opcode::Sqrt
            | Opcode::Tanh => Some(1),
            Opcode::Add
            | Opcode::And
            | Opcode::Compare
            | Opcode::Divide
            | Opcode::Maximum
            | Opcode::Minimum
            | Opcode::Multiply
            | Opcode::Or
            | Opcode::Power
            | Opcode::Subtract => Some(2),
            Opcode::Select => Some(3),
            _ => None,
        }
    }

    /// Exact operand count, where the opcode fixes one.
    fn arity(self) -> Option<usize> {
        if let Some(n) = self.elementwise_arity() {
            return Some(n);
        }
        match self {
            Opcode::Parameter | Opcode::Constant | Opcode::Iota => Some(0),
            Opcode::Broadcast
            | Opcode::Transpose
            | Opcode::Reshape
            | Opcode::Bitcast
            | Opcode::Copy
            | Opcode::Slice => Some(1),
            Opcode::Gather => Some(2),
            Opcode::Scatter => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Instructions and computations ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceDim {
    pub start: i64,
    pub limit: i64,
    pub stride: i64,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstrId,
    pub name: String,
    pub opcode: Opcode,
    pub shape: Shape,
    pub operands: Vec<InstrId>,
    pub parent: ComputationId,
    /// `dimensions={...}`: broadcast mapping, transpose permutation, reduced
    /// or concatenated dimensions.
    pub dimensions: Vec<usize>,
    pub slice: Vec<SliceDim>,
    /// `calls=` for fusions, `to_apply=` for reductions.
    pub called_computation: Option<ComputationId>,
    pub parameter_number: Option<usize>,
    pub iota_dimension: Option<usize>,
}

impl Instruction {
    pub fn array_shape(&self) -> Option<&ArrayShape> {
        self.shape.as_array()
    }
}

#[derive(Debug, Clone)]
pub struct Computation {
    pub id: ComputationId,
    pub name: String,
    pub is_entry: bool,
    /// Definition order; every operand precedes its user.
    pub instructions: Vec<InstrId>,
    pub root: InstrId,
    /// Indexed by parameter number.
    pub parameters: Vec<InstrId>,
}

#[derive(Debug, Clone)]
pub struct HloModule {
    pub name: String,
    instructions: Vec<Instruction>,
    computations: Vec<Computation>,
    entry: ComputationId,
    warnings: Vec<Diagnostic>,
}

impl HloModule {
    /// Lex, parse and resolve HLO text.
    pub fn parse(text: &str) -> Result<Self, FrontendError> {
        let result = crate::parser::parse(text);
        if !result.errors.is_empty() {
            return Err(FrontendError::Syntax(
                result.errors.iter().map(|e| e.to_string()).collect(),
            ));
        }
        let ast = result
            .module
            .ok_or_else(|| FrontendError::Syntax(vec!["empty module".to_string()]))?;
        build_module(&ast).map_err(FrontendError::Invalid)
    }

    /// Non-fatal diagnostics from resolution.
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn instr(&self, id: InstrId) -> &Instruction {
        &self.instructions[id.0 as usize]
    }

    pub fn computation(&self, id: ComputationId) -> &Computation {
        &self.computations[id.0 as usize]
    }

    pub fn computations(&self) -> &[Computation] {
        &self.computations
    }

    pub fn entry(&self) -> &Computation {
        self.computation(self.entry)
    }

    /// Find an instruction by name, preferring the entry computation.
    pub fn find_instruction(&self, name: &str) -> Option<InstrId> {
        let in_comp = |comp: &Computation| {
            comp.instructions
                .iter()
                .copied()
                .find(|&id| self.instr(id).name == name)
        };
        in_comp(self.entry()).or_else(|| {
            self.computations
                .iter()
                .filter(|c| c.id != self.entry)
                .find_map(in_comp)
        })
    }

    pub fn find_computation(&self, name: &str) -> Option<ComputationId> {
        self.computations
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    /// The fused body of a fusion instruction.
    pub fn fused_computation(&self, id: InstrId) -> Option<&Computation> {
        let instr = self.instr(id);
        if instr.opcode != Opcode::Fusion {
            return None;
        }
        instr.called_computation.map(|c| self.computation(c))
    }

    /// Render one instruction in HLO text form.
    pub fn instruction_to_string(&self, id: InstrId) -> String {
        let instr = self.instr(id);
        let mut out = format!("{} = {} {}(", instr.name, instr.shape, instr.opcode);
        let args: Vec<String> = match instr.opcode {
            Opcode::Parameter => vec![instr.parameter_number.unwrap_or(0).to_string()],
            _ => instr
                .operands
                .iter()
                .map(|&op| self.instr(op).name.clone())
                .collect(),
        };
        out.push_str(&args.join(", "));
        out.push(')');
        if !instr.dimensions.is_empty() {
            let dims: Vec<String> = instr.dimensions.iter().map(|d| d.to_string()).collect();
            out.push_str(&format!(", dimensions={{{}}}", dims.join(",")));
        }
        if !instr.slice.is_empty() {
            let entries: Vec<String> = instr
                .slice
                .iter()
                .map(|s| format!("[{}:{}:{}]", s.start, s.limit, s.stride))
                .collect();
            out.push_str(&format!(", slice={{{}}}", entries.join(", ")));
        }
        if let Some(dim) = instr.iota_dimension {
            out.push_str(&format!(", iota_dimension={}", dim));
        }
        if let Some(comp) = instr.called_computation {
            let key = if instr.opcode == Opcode::Fusion {
                "calls"
            } else {
                "to_apply"
            };
            out.push_str(&format!(", {}={}", key, self.computation(comp).name));
        }
        out
    }
}

impl fmt::Display for HloModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HloModule {}", self.name)?;
        for comp in &self.computations {
            writeln!(f)?;
            if comp.is_entry {
                write!(f, "ENTRY ")?;
            }
            writeln!(f, "{} {{", comp.name)?;
            for &id in &comp.instructions {
                let root = if id == comp.root { "ROOT " } else { "" };
                writeln!(f, "  {}{}", root, self.instruction_to_string(id))?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

// ── Module builder ──────────────────────────────────────────────────────────

/// Attributes accepted without effect on indexing.
const IGNORED_ATTRIBUTES: &[&str] = &[
    "kind",
    "direction",
    "comparison_type",
    "metadata",
    "backend_config",
    "sharding",
    "index_vector_dim",
    "slice_sizes",
    "dynamic_slice_sizes",
];

/// Resolve a parsed module. Collects every diagnostic before failing.
pub fn build_module(ast: &ModuleAst) -> Result<HloModule, Vec<Diagnostic>> {
    let mut builder = ModuleBuilder::new(ast);
    builder.declare_computations();
    for (index, comp) in ast.computations.iter().enumerate() {
        builder.build_computation(index, comp);
    }
    builder.check_entry();
    builder.check_fusions();
    builder.finish()
}

struct ModuleBuilder<'a> {
    ast: &'a ModuleAst,
    ids: IdAllocator,
    computation_ids: HashMap<&'a str, ComputationId>,
    instructions: Vec<Instruction>,
    computations: Vec<Option<Computation>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> ModuleBuilder<'a> {
    fn new(ast: &'a ModuleAst) -> Self {
        ModuleBuilder {
            ast,
            ids: IdAllocator::new(),
            computation_ids: HashMap::new(),
            instructions: Vec::new(),
            computations: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn declare_computations(&mut self) {
        for comp in &self.ast.computations {
            let id = self.ids.alloc_computation();
            self.computations.push(None);
            if self
                .computation_ids
                .insert(comp.name.name.as_str(), id)
                .is_some()
            {
                self.diagnostics.push(Diagnostic::error(
                    codes::E0100,
                    comp.name.span,
                    format!("duplicate computation '{}'", comp.name.name),
                ));
            }
        }
    }

    fn build_computation(&mut self, index: usize, comp: &'a ComputationAst) {
        let comp_id = ComputationId(index as u32);
        let mut names: HashMap<&str, InstrId> = HashMap::new();
        // Instructions that failed to resolve; references to them are not
        // reported again.
        let mut poisoned: HashSet<&str> = HashSet::new();
        let mut instructions = Vec::new();
        let mut roots = Vec::new();
        let mut parameters: Vec<(usize, InstrId, Span)> = Vec::new();

        for instr_ast in &comp.instructions {
            let name = instr_ast.name.name.as_str();
            if names.contains_key(name) || poisoned.contains(name) {
                self.diagnostics.push(Diagnostic::error(
                    codes::E0101,
                    instr_ast.name.span,
                    format!("duplicate instruction '{}' in '{}'", name, comp.name.name),
                ));
                continue;
            }
            match self.resolve_instruction(comp_id, instr_ast, &names, &poisoned) {
                Some(mut instr) => {
                    let id = self.ids.alloc_instr();
                    instr.id = id;
                    if let Some(number) = instr.parameter_number {
                        parameters.push((number, id, instr_ast.span));
                    }
                    if instr_ast.is_root {
                        roots.push(id);
                    }
                    names.insert(name, id);
                    instructions.push(id);
                    self.instructions.push(instr);
                }
                None => {
                    poisoned.insert(name);
                }
            }
        }

        if comp.instructions.is_empty() {
            self.diagnostics.push(Diagnostic::error(
                codes::E0107,
                comp.span,
                format!("computation '{}' has no instructions", comp.name.name),
            ));
            return;
        }
        if roots.len() > 1 {
            self.diagnostics.push(Diagnostic::error(
                codes::E0107,
                comp.span,
                format!("computation '{}' has {} ROOT instructions", comp.name.name, roots.len()),
            ));
            return;
        }
        // Without an explicit ROOT the last instruction is the root.
        let root = match roots.first().or(instructions.last()) {
            Some(&root) => root,
            None => return,
        };

        parameters.sort_by_key(|(number, _, _)| *number);
        let mut ordered = Vec::with_capacity(parameters.len());
        for (expected, (number, id, span)) in parameters.into_iter().enumerate() {
            if number != expected {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::E0109,
                        span,
                        format!(
                            "parameter numbers in '{}' must be 0..n without gaps or repeats",
                            comp.name.name
                        ),
                    )
                    .with_hint(format!("expected parameter({}) here, found parameter({})", expected, number)),
                );
                break;
            }
            ordered.push(id);
        }

        self.computations[index] = Some(Computation {
            id: comp_id,
            name: comp.name.name.clone(),
            is_entry: comp.is_entry,
            instructions,
            root,
            parameters: ordered,
        });
    }

    fn resolve_instruction(
        &mut self,
        comp_id: ComputationId,
        ast: &InstructionAst,
        names: &HashMap<&str, InstrId>,
        poisoned: &HashSet<&str>,
    ) -> Option<Instruction> {
        let before = self.error_count();

        let opcode = Opcode::from_name(&ast.opcode.name);
        if opcode.is_none() {
            self.diagnostics.push(Diagnostic::error(
                codes::E0103,
                ast.opcode.span,
                format!("unknown opcode '{}'", ast.opcode.name),
            ));
        }
        let shape = self.resolve_shape(&ast.shape);

        let mut operands = Vec::new();
        let mut parameter_number = None;
        let mut cascaded = false;
        match opcode {
            Some(Opcode::Parameter) => match ast.operands.as_slice() {
                [OperandAst::Int(n, _)] if *n >= 0 => parameter_number = Some(*n as usize),
                _ => self.diagnostics.push(Diagnostic::error(
                    codes::E0109,
                    ast.span,
                    format!("parameter '{}' needs a non-negative number", ast.name.name),
                )),
            },
            // Literal payloads are not needed by the analysis.
            Some(Opcode::Constant) => {}
            _ => {
                for operand in &ast.operands {
                    match operand {
                        OperandAst::Name(ident) => match names.get(ident.name.as_str()) {
                            Some(&id) => operands.push(id),
                            None if poisoned.contains(ident.name.as_str()) => cascaded = true,
                            None => self.diagnostics.push(
                                Diagnostic::error(
                                    codes::E0102,
                                    ident.span,
                                    format!("undefined operand '{}'", ident.name),
                                )
                                .with_hint("operands must be defined earlier in the same computation"),
                            ),
                        },
                        other => self.diagnostics.push(Diagnostic::error(
                            codes::E0111,
                            other.span(),
                            format!("'{}' takes instruction operands, not literals", ast.opcode.name),
                        )),
                    }
                }
            }
        }

        let mut dimensions = Vec::new();
        let mut slice = Vec::new();
        let mut called_computation = None;
        let mut iota_dimension = None;
        for attr in &ast.attributes {
            match (attr.name.name.as_str(), &attr.value) {
                ("dimensions", AttrValue::Ints(values, span)) => {
                    if values.iter().any(|&v| v < 0) {
                        self.diagnostics.push(Diagnostic::error(
                            codes::E0110,
                            *span,
                            "dimensions must be non-negative",
                        ));
                    } else {
                        dimensions = values.iter().map(|&v| v as usize).collect();
                    }
                }
                ("slice", AttrValue::Slices(entries, span)) => {
                    for entry in entries {
                        let stride = entry.stride.unwrap_or(1);
                        if entry.start < 0 || entry.limit < entry.start || stride <= 0 {
                            self.diagnostics.push(Diagnostic::error(
                                codes::E0110,
                                *span,
                                format!(
                                    "invalid slice entry [{}:{}:{}]",
                                    entry.start, entry.limit, stride
                                ),
                            ));
                        }
                        slice.push(SliceDim {
                            start: entry.start,
                            limit: entry.limit,
                            stride,
                        });
                    }
                }
                ("calls" | "to_apply", AttrValue::Name(target)) => {
                    match self.computation_ids.get(target.name.as_str()) {
                        Some(&id) => called_computation = Some(id),
                        None => self.diagnostics.push(Diagnostic::error(
                            codes::E0105,
                            target.span,
                            format!("unknown computation '{}'", target.name),
                        )),
                    }
                }
                ("iota_dimension", AttrValue::Int(n, span)) => {
                    if *n < 0 {
                        self.diagnostics.push(Diagnostic::error(
                            codes::E0110,
                            *span,
                            "iota_dimension must be non-negative",
                        ));
                    } else {
                        iota_dimension = Some(*n as usize);
                    }
                }
                ("dimensions" | "slice" | "calls" | "to_apply" | "iota_dimension", value) => {
                    self.diagnostics.push(Diagnostic::error(
                        codes::E0110,
                        value.span(),
                        format!("malformed '{}' attribute", attr.name.name),
                    ));
                }
                // Recognized but irrelevant to indexing.
                (name, _) if IGNORED_ATTRIBUTES.contains(&name) => {}
                (name, value) => self.diagnostics.push(Diagnostic::warning(
                    codes::W0120,
                    value.span(),
                    format!("unknown attribute '{}' ignored", name),
                )),
            }
        }

        if self.error_count() > before || cascaded {
            return None;
        }
        let (opcode, shape) = (opcode?, shape?);
        let instr = Instruction {
            id: InstrId(u32::MAX),
            name: ast.name.name.clone(),
            opcode,
            shape,
            operands,
            parent: comp_id,
            dimensions,
            slice,
            called_computation,
            parameter_number,
            iota_dimension,
        };
        match self.check_structure(&instr) {
            Ok(()) => Some(instr),
            Err(message) => {
                self.diagnostics
                    .push(Diagnostic::error(codes::E0111, ast.span, message));
                None
            }
        }
    }

    fn resolve_shape(&mut self, ast: &ShapeAst) -> Option<Shape> {
        match ast {
            ShapeAst::Array { .. } => self.resolve_array_shape(ast).map(Shape::Array),
            ShapeAst::Tuple(elems, _) => {
                let mut shapes = Vec::with_capacity(elems.len());
                for elem in elems {
                    shapes.push(self.resolve_array_shape(elem)?);
                }
                Some(Shape::Tuple(shapes))
            }
        }
    }

    fn resolve_array_shape(&mut self, ast: &ShapeAst) -> Option<ArrayShape> {
        let ShapeAst::Array {
            element_type,
            dims,
            layout,
            span,
        } = ast
        else {
            self.diagnostics.push(Diagnostic::error(
                codes::E0104,
                ast.span(),
                "nested tuple shapes are not supported",
            ));
            return None;
        };
        let Some(ty) = PrimitiveType::from_name(&element_type.name) else {
            self.diagnostics.push(Diagnostic::error(
                codes::E0104,
                element_type.span,
                format!("unknown element type '{}'", element_type.name),
            ));
            return None;
        };
        if dims.iter().any(|&d| d < 0) {
            self.diagnostics.push(Diagnostic::error(
                codes::E0104,
                *span,
                "dimension sizes must be non-negative",
            ));
            return None;
        }
        match layout {
            None => Some(ArrayShape::new(ty, dims.clone())),
            Some(layout) => {
                let mut seen = vec![false; dims.len()];
                let valid = layout.len() == dims.len()
                    && layout.iter().all(|&d| {
                        d >= 0 && (d as usize) < dims.len() && !std::mem::replace(&mut seen[d as usize], true)
                    });
                if !valid {
                    self.diagnostics.push(Diagnostic::error(
                        codes::E0108,
                        *span,
                        format!("layout {:?} is not a permutation of 0..{}", layout, dims.len()),
                    ));
                    return None;
                }
                Some(ArrayShape::with_layout(
                    ty,
                    dims.clone(),
                    layout.iter().map(|&d| d as usize).collect(),
                ))
            }
        }
    }

    fn operand_array(&self, instr: &Instruction, i: usize) -> Option<&ArrayShape> {
        let id = instr.operands.get(i)?;
        self.instructions.get(id.0 as usize)?.array_shape()
    }

    /// Opcode-specific invariants that index derivation depends on.
    fn check_structure(&self, instr: &Instruction) -> Result<(), String> {
        let op = instr.opcode;
        if let Some(arity) = op.arity() {
            if instr.operands.len() != arity {
                return Err(format!(
                    "{} expects {} operand(s), found {}",
                    op,
                    arity,
                    instr.operands.len()
                ));
            }
        }
        let operand_shape = |i: usize| self.operand_array(instr, i);
        let needs_arrays = !matches!(op, Opcode::Tuple | Opcode::Fusion);
        if needs_arrays {
            if instr.array_shape().is_none() {
                return Err(format!("{} must produce an array", op));
            }
            if (0..instr.operands.len()).any(|i| operand_shape(i).is_none()) {
                return Err(format!("{} operands must be arrays", op));
            }
        }
        let Some(out) = instr.array_shape() else {
            return Ok(());
        };
        let rank = out.rank();
        let is_permutation = |dims: &[usize], n: usize| {
            let mut sorted = dims.to_vec();
            sorted.sort_unstable();
            sorted.iter().copied().eq(0..n)
        };

        match op {
            _ if op.is_elementwise() => {
                for i in 0..instr.operands.len() {
                    let Some(shape) = operand_shape(i) else { continue };
                    // `select` may take a scalar predicate.
                    let scalar_pred = op == Opcode::Select && i == 0 && shape.rank() == 0;
                    if shape.dims != out.dims && !scalar_pred {
                        return Err(format!("{} operand {} has dims {:?}, expected {:?}", op, i, shape.dims, out.dims));
                    }
                }
            }
            Opcode::Copy => {
                if operand_shape(0).map(|s| &s.dims) != Some(&out.dims) {
                    return Err("copy must preserve logical dimensions".to_string());
                }
            }
            Opcode::Transpose => {
                let in_rank = operand_shape(0).map_or(0, |s| s.rank());
                if in_rank != rank || !is_permutation(&instr.dimensions, rank) {
                    return Err(format!(
                        "transpose dimensions {:?} are not a permutation of 0..{}",
                        instr.dimensions, rank
                    ));
                }
            }
            Opcode::Broadcast => {
                let in_rank = operand_shape(0).map_or(0, |s| s.rank());
                if instr.dimensions.len() != in_rank || instr.dimensions.iter().any(|&d| d >= rank) {
                    return Err(format!(
                        "broadcast dimensions {:?} do not map a rank-{} operand into rank {}",
                        instr.dimensions, in_rank, rank
                    ));
                }
            }
            Opcode::Reshape | Opcode::Bitcast => {
                let in_elems = operand_shape(0).map_or(-1, |s| s.num_elements());
                if in_elems != out.num_elements() {
                    return Err(format!("{} must preserve the element count", op));
                }
            }
            Opcode::Slice => {
                let in_rank = operand_shape(0).map_or(0, |s| s.rank());
                if instr.slice.len() != in_rank || in_rank != rank {
                    return Err("slice needs one [start:limit:stride] entry per dimension".to_string());
                }
            }
            Opcode::Concatenate => {
                if instr.dimensions.len() != 1 || instr.dimensions[0] >= rank || instr.operands.is_empty() {
                    return Err("concatenate needs one dimension and at least one operand".to_string());
                }
            }
            Opcode::Reduce => {
                let n = instr.operands.len();
                if n < 2 || n % 2 != 0 {
                    return Err("reduce takes inputs followed by as many init values".to_string());
                }
                let in_rank = operand_shape(0).map_or(0, |s| s.rank());
                if instr.dimensions.iter().any(|&d| d >= in_rank)
                    || in_rank != rank + instr.dimensions.len()
                {
                    return Err(format!(
                        "reduce dimensions {:?} do not fit a rank-{} input",
                        instr.dimensions, in_rank
                    ));
                }
            }
            Opcode::DynamicSlice => {
                let in_rank = operand_shape(0).map_or(0, |s| s.rank());
                if instr.operands.len() != 1 + in_rank || in_rank != rank {
                    return Err("dynamic-slice takes an operand plus one scalar index per dimension".to_string());
                }
            }
            Opcode::Iota => {
                if instr.iota_dimension.is_some_and(|d| d >= rank.max(1)) {
                    return Err("iota_dimension out of range".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn check_entry(&mut self) {
        let entries: Vec<&ComputationAst> = self
            .ast
            .computations
            .iter()
            .filter(|c| c.is_entry)
            .collect();
        if entries.len() > 1 {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::E0106,
                    entries[1].name.span,
                    "more than one ENTRY computation",
                )
                .with_related(entries[0].name.span, "first ENTRY here"),
            );
        }
    }

    fn check_fusions(&mut self) {
        let mut problems = Vec::new();
        for instr in &self.instructions {
            if instr.opcode != Opcode::Fusion {
                continue;
            }
            let Some(callee) = instr.called_computation else {
                problems.push((codes::E0110, instr, "fusion requires calls=<computation>".to_string()));
                continue;
            };
            if let Some(comp) = &self.computations[callee.0 as usize] {
                if comp.parameters.len() != instr.operands.len() {
                    problems.push((
                        codes::E0109,
                        instr,
                        format!(
                            "fusion '{}' passes {} operand(s) to '{}', which has {} parameter(s)",
                            instr.name,
                            instr.operands.len(),
                            comp.name,
                            comp.parameters.len()
                        ),
                    ));
                }
            }
        }
        let spans: HashMap<&str, Span> = self
            .ast
            .computations
            .iter()
            .flat_map(|c| c.instructions.iter())
            .map(|i| (i.name.name.as_str(), i.span))
            .collect();
        let new: Vec<Diagnostic> = problems
            .into_iter()
            .map(|(code, instr, message)| {
                let span = spans
                    .get(instr.name.as_str())
                    .copied()
                    .unwrap_or_else(|| (0..0).into());
                Diagnostic::error(code, span, message)
            })
            .collect();
        self.diagnostics.extend(new);
    }

    fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    fn finish(self) -> Result<HloModule, Vec<Diagnostic>> {
        if self.error_count() > 0 {
            return Err(self.diagnostics);
        }
        let computations: Vec<Computation> = self.computations.into_iter().flatten().collect();
        let entry = computations
            .iter()
            .find(|c| c.is_entry)
            .or(computations.last())
            .map(|c| c.id);
        let Some(entry) = entry else {
            return Err(vec![Diagnostic::error(
                codes::E0106,
                (0..0).into(),
                "module has no computations",
            )]);
        };
        Ok(HloModule {
            name: self
                .ast
                .name
                .as_ref()
                .map(|n| n.name.clone())
                .unwrap_or_else(|| "module".to_string()),
            instructions: self.instructions,
            computations,
            entry,
            warnings: self.diagnostics,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
