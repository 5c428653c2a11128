// id.rs — Stable identifiers for HLO module artifacts
//
// Instruction and computation identity is the id, never the value. Ids are
// allocated in source order while the module is built, so two builds of the
// same text assign the same ids.

use std::fmt;

use serde::Serialize;

/// Stable identifier for an instruction anywhere in a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstrId(pub u32);

/// Stable identifier for a computation (entry or fused body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ComputationId(pub u32);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comp#{}", self.0)
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation (source) order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_instr: u32,
    next_computation: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_instr(&mut self) -> InstrId {
        let id = InstrId(self.next_instr);
        self.next_instr += 1;
        id
    }

    pub fn alloc_computation(&mut self) -> ComputationId {
        let id = ComputationId(self.next_computation);
        self.next_computation += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_allocated_in_order() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.alloc_instr(), InstrId(0));
        assert_eq!(alloc.alloc_instr(), InstrId(1));
        assert_eq!(alloc.alloc_computation(), ComputationId(0));
        assert_eq!(alloc.alloc_instr(), InstrId(2));
    }
}
