// fusion.rs — Flattened view of a node or producer/consumer fusion
//
// Turns a plain instruction, a fusion instruction, or a producer fused into
// its consumer into one DAG of fused nodes. Leaves of the DAG are *read
// operands*: instructions outside the fusion whose buffers the kernel reads.
//
// Preconditions: `module` was produced by `hlo::build_module`.
// Postconditions: nodes are in topological order (inputs before users);
//                 every fused parameter is replaced by what it is bound to.
// Failure modes: none; unsupported opcodes are left for the analyses to judge.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::hlo::{Computation, HloModule, Instruction, Opcode};
use crate::id::InstrId;

// ── Public types ────────────────────────────────────────────────────────────

/// Index of a node inside one `FusionAdaptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Where a fused node's input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusedInput {
    /// Another node of the same fusion.
    Node(NodeId),
    /// A buffer read from outside the fusion.
    Operand(InstrId),
}

#[derive(Debug, Clone)]
pub struct FusedNode {
    pub id: NodeId,
    /// The instruction this node evaluates (inside a fused body, or the
    /// plain instruction itself).
    pub instr: InstrId,
    pub inputs: Vec<FusedInput>,
}

#[derive(Debug, Clone)]
pub struct FusionAdaptor<'m> {
    module: &'m HloModule,
    nodes: Vec<FusedNode>,
    roots: Vec<FusedInput>,
    read_operands: Vec<InstrId>,
    producer: Option<InstrId>,
    consumer: InstrId,
}

impl<'m> FusionAdaptor<'m> {
    /// View a single instruction (fusion or not) as a fusion.
    pub fn for_instruction(module: &'m HloModule, instr: InstrId) -> Self {
        let mut builder = Builder::new(module);
        let bindings: Vec<FusedInput> = module
            .instr(instr)
            .operands
            .iter()
            .map(|&op| FusedInput::Operand(op))
            .collect();
        let root = builder.add_instruction(instr, bindings);
        let read_operands = dedup(module.instr(instr).operands.iter().copied());
        builder.finish(root, None, instr, read_operands)
    }

    /// View `producer` fused into `consumer`: the consumer's uses of the
    /// producer read the producer's root instead of a buffer.
    pub fn for_producer_consumer(module: &'m HloModule, producer: InstrId, consumer: InstrId) -> Self {
        debug_assert!(
            is_producer_of(module, producer, consumer),
            "{} is not an operand of {}",
            producer,
            consumer
        );
        let mut builder = Builder::new(module);
        let producer_bindings: Vec<FusedInput> = module
            .instr(producer)
            .operands
            .iter()
            .map(|&op| FusedInput::Operand(op))
            .collect();
        let producer_root = builder.add_instruction(producer, producer_bindings);

        let consumer_instr = module.instr(consumer);
        let bindings: Vec<FusedInput> = consumer_instr
            .operands
            .iter()
            .map(|&op| {
                if op == producer {
                    producer_root
                } else {
                    FusedInput::Operand(op)
                }
            })
            .collect();
        let root = builder.add_instruction(consumer, bindings);

        let read_operands = dedup(consumer_instr.operands.iter().flat_map(|&op| {
            if op == producer {
                module.instr(producer).operands.clone()
            } else {
                vec![op]
            }
        }));
        builder.finish(root, Some(producer), consumer, read_operands)
    }

    pub fn module(&self) -> &'m HloModule {
        self.module
    }

    pub fn nodes(&self) -> &[FusedNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &FusedNode {
        &self.nodes[id.0 as usize]
    }

    /// The instruction a node evaluates.
    pub fn instr(&self, id: NodeId) -> &'m Instruction {
        self.module.instr(self.node(id).instr)
    }

    /// Fusion outputs, one per element of a `tuple` root.
    pub fn roots(&self) -> &[FusedInput] {
        &self.roots
    }

    /// The instruction producing an input: a fused node's instruction or the
    /// outer operand itself.
    pub fn input_instr(&self, input: FusedInput) -> &'m Instruction {
        match input {
            FusedInput::Node(id) => self.instr(id),
            FusedInput::Operand(op) => self.module.instr(op),
        }
    }

    /// Outer instructions read by the fusion, deduplicated, in first-use
    /// order.
    pub fn read_operands(&self) -> &[InstrId] {
        &self.read_operands
    }

    pub fn producer(&self) -> Option<InstrId> {
        self.producer
    }

    pub fn consumer(&self) -> InstrId {
        self.consumer
    }

    /// Nodes evaluating `opcode`, in topological order.
    pub fn nodes_with_opcode(&self, opcode: Opcode) -> impl Iterator<Item = &FusedNode> + '_ {
        self.nodes
            .iter()
            .filter(move |n| self.module.instr(n.instr).opcode == opcode)
    }

    /// Whether any fused node evaluates `opcode`.
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.nodes_with_opcode(opcode).next().is_some()
    }
}

impl fmt::Display for FusionAdaptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input_name = |input: &FusedInput| match input {
            FusedInput::Node(id) => format!("n{}", id.0),
            FusedInput::Operand(op) => self.module.instr(*op).name.clone(),
        };
        for node in &self.nodes {
            let instr = self.module.instr(node.instr);
            let inputs: Vec<String> = node.inputs.iter().map(input_name).collect();
            writeln!(
                f,
                "n{} = {} {}({})",
                node.id.0,
                instr.shape,
                instr.opcode,
                inputs.join(", ")
            )?;
        }
        let roots: Vec<String> = self.roots.iter().map(input_name).collect();
        write!(f, "roots: {}", roots.join(", "))
    }
}

fn dedup(ids: impl IntoIterator<Item = InstrId>) -> Vec<InstrId> {
    let mut out: Vec<InstrId> = Vec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

// ── Construction ────────────────────────────────────────────────────────────

struct Builder<'m> {
    module: &'m HloModule,
    nodes: Vec<FusedNode>,
}

impl<'m> Builder<'m> {
    fn new(module: &'m HloModule) -> Self {
        Builder {
            module,
            nodes: Vec::new(),
        }
    }

    fn add_node(&mut self, instr: InstrId, inputs: Vec<FusedInput>) -> FusedInput {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(FusedNode { id, instr, inputs });
        FusedInput::Node(id)
    }

    /// Add `instr` with its operands bound to `bindings`; fusions are expanded
    /// into their bodies. Returns what the instruction's value is bound to.
    fn add_instruction(&mut self, instr: InstrId, bindings: Vec<FusedInput>) -> FusedInput {
        match self.module.fused_computation(instr) {
            Some(body) => self.expand(body, &bindings),
            None => self.add_node(instr, bindings),
        }
    }

    fn expand(&mut self, body: &'m Computation, bindings: &[FusedInput]) -> FusedInput {
        let mut values: HashMap<InstrId, FusedInput> = HashMap::new();
        for &id in &body.instructions {
            let instr = self.module.instr(id);
            let value = match instr.opcode {
                Opcode::Parameter => {
                    // The builder checked that fusion operand and parameter
                    // counts agree.
                    match instr.parameter_number.and_then(|n| bindings.get(n)) {
                        Some(&bound) => bound,
                        None => self.add_node(id, Vec::new()),
                    }
                }
                _ => {
                    let inputs = instr
                        .operands
                        .iter()
                        .filter_map(|op| values.get(op).copied())
                        .collect();
                    self.add_instruction(id, inputs)
                }
            };
            values.insert(id, value);
        }
        values
            .get(&body.root)
            .copied()
            .unwrap_or(FusedInput::Operand(body.root))
    }

    fn finish(
        self,
        root: FusedInput,
        producer: Option<InstrId>,
        consumer: InstrId,
        read_operands: Vec<InstrId>,
    ) -> FusionAdaptor<'m> {
        let roots = match root {
            FusedInput::Node(id) if self.module.instr(self.nodes[id.0 as usize].instr).opcode == Opcode::Tuple => {
                self.nodes[id.0 as usize].inputs.clone()
            }
            other => vec![other],
        };
        FusionAdaptor {
            module: self.module,
            nodes: self.nodes,
            roots,
            read_operands,
            producer,
            consumer,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

/// Whether `consumer` reads `producer` directly, so the two can be fused.
pub fn is_producer_of(module: &HloModule, producer: InstrId, consumer: InstrId) -> bool {
    module.instr(consumer).operands.contains(&producer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(text: &str) -> HloModule {
        HloModule::parse(text).expect("test module should build")
    }

    fn opcodes(adaptor: &FusionAdaptor<'_>) -> Vec<Opcode> {
        adaptor
            .nodes()
            .iter()
            .map(|n| adaptor.module().instr(n.instr).opcode)
            .collect()
    }

    #[test]
    fn plain_instruction_reads_its_operands() {
        let m = module(
            r#"
            ENTRY e {
              a = f32[8] parameter(0)
              b = f32[8] parameter(1)
              ROOT s = f32[8] add(a, b)
            }
            "#,
        );
        let s = m.find_instruction("s").unwrap();
        let adaptor = FusionAdaptor::for_instruction(&m, s);
        assert_eq!(opcodes(&adaptor), vec![Opcode::Add]);
        assert_eq!(adaptor.read_operands().len(), 2);
        assert_eq!(adaptor.roots(), &[FusedInput::Node(NodeId(0))]);
    }

    #[test]
    fn fusion_body_binds_parameters_to_outer_operands() {
        let m = module(
            r#"
            body {
              p0 = f32[8] parameter(0)
              p1 = f32[8] parameter(1)
              n = f32[8] negate(p1)
              ROOT m = f32[8] multiply(p0, n)
            }
            ENTRY e {
              a = f32[8] parameter(0)
              b = f32[8] parameter(1)
              ROOT f = f32[8] fusion(a, b), kind=kLoop, calls=body
            }
            "#,
        );
        let f = m.find_instruction("f").unwrap();
        let adaptor = FusionAdaptor::for_instruction(&m, f);
        assert_eq!(opcodes(&adaptor), vec![Opcode::Negate, Opcode::Multiply]);
        let b = m.find_instruction("b").unwrap();
        assert_eq!(adaptor.node(NodeId(0)).inputs, vec![FusedInput::Operand(b)]);
        let a = m.find_instruction("a").unwrap();
        assert_eq!(
            adaptor.node(NodeId(1)).inputs,
            vec![FusedInput::Operand(a), FusedInput::Node(NodeId(0))]
        );
    }

    #[test]
    fn producer_is_spliced_into_consumer() {
        let m = module(
            r#"
            ENTRY e {
              a = f32[8] parameter(0)
              b = f32[8] parameter(1)
              p = f32[8] exponential(a)
              ROOT c = f32[8] add(p, b)
            }
            "#,
        );
        let (p, c) = (m.find_instruction("p").unwrap(), m.find_instruction("c").unwrap());
        let adaptor = FusionAdaptor::for_producer_consumer(&m, p, c);
        assert_eq!(opcodes(&adaptor), vec![Opcode::Exp, Opcode::Add]);
        let names: Vec<&str> = adaptor
            .read_operands()
            .iter()
            .map(|&id| m.instr(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(adaptor.node(NodeId(1)).inputs[0], FusedInput::Node(NodeId(0)));
        assert_eq!(adaptor.producer(), Some(p));
        assert_eq!(adaptor.consumer(), c);
    }

    #[test]
    fn producer_must_feed_consumer() {
        let m = module(
            r#"
            ENTRY e {
              a = f32[8] parameter(0)
              p = f32[8] negate(a)
              q = f32[8] exponential(a)
              ROOT c = f32[8] add(p, a)
            }
            "#,
        );
        let id = |name: &str| m.find_instruction(name).unwrap();
        assert!(is_producer_of(&m, id("p"), id("c")));
        assert!(is_producer_of(&m, id("a"), id("c")));
        assert!(!is_producer_of(&m, id("q"), id("c")));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is not an operand of")]
    fn disconnected_pair_is_rejected() {
        let m = module(
            r#"
            ENTRY e {
              a = f32[8] parameter(0)
              q = f32[8] exponential(a)
              ROOT c = f32[8] negate(a)
            }
            "#,
        );
        let (q, c) = (m.find_instruction("q").unwrap(), m.find_instruction("c").unwrap());
        FusionAdaptor::for_producer_consumer(&m, q, c);
    }

    #[test]
    fn shared_operand_is_read_once() {
        let m = module(
            r#"
            ENTRY e {
              a = f32[8] parameter(0)
              p = f32[8] negate(a)
              ROOT c = f32[8] add(p, a)
            }
            "#,
        );
        let (p, c) = (m.find_instruction("p").unwrap(), m.find_instruction("c").unwrap());
        let adaptor = FusionAdaptor::for_producer_consumer(&m, p, c);
        assert_eq!(adaptor.read_operands(), &[m.find_instruction("a").unwrap()]);
    }

    #[test]
    fn tuple_root_yields_one_root_per_element() {
        let m = module(
            r#"
            body {
              p0 = f32[8] parameter(0)
              n = f32[8] negate(p0)
              x = f32[8] exponential(p0)
              ROOT t = (f32[8], f32[8]) tuple(n, x)
            }
            ENTRY e {
              a = f32[8] parameter(0)
              ROOT f = (f32[8], f32[8]) fusion(a), kind=kLoop, calls=body
            }
            "#,
        );
        let f = m.find_instruction("f").unwrap();
        let adaptor = FusionAdaptor::for_instruction(&m, f);
        assert_eq!(adaptor.roots(), &[FusedInput::Node(NodeId(0)), FusedInput::Node(NodeId(1))]);
        assert!(adaptor.contains(Opcode::Tuple));
    }
}
