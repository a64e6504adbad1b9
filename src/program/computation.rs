//! Source programs handed to a [`ProgramCompiler`](super::ProgramCompiler)
//!
//! A [`Computation`] is a flat list of instructions in definition order.
//! Operands refer to earlier instructions by position, so a well-formed
//! program is acyclic by construction. One instruction is the root whose
//! value becomes the execution result.

use crate::codec::HostValue;
use crate::shape::Shape;

/// Reference to an instruction inside the builder that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand(usize);

impl Operand {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Elementwise binary arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Maximum,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Program argument number `index`
    Parameter { index: usize, shape: Shape },
    Constant(HostValue),
    Binary {
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Replicate a scalar into an array of `dims`
    Broadcast { operand: Operand, dims: Vec<usize> },
    Tuple(Vec<Operand>),
    GetTupleElement { operand: Operand, index: usize },
    /// Index of the replica running the program, as an S32 scalar
    ReplicaId,
    /// Dequeue one value of `shape` from the device infeed
    Infeed(Shape),
    /// Enqueue the operand on the device outfeed; yields an empty tuple
    Outfeed(Operand),
    /// Call a host function registered on the platform under `target`
    CustomCall {
        target: String,
        operands: Vec<Operand>,
        shape: Shape,
    },
}

impl Instruction {
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Instruction::Parameter { .. }
            | Instruction::Constant(_)
            | Instruction::ReplicaId
            | Instruction::Infeed(_) => Vec::new(),
            Instruction::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instruction::Broadcast { operand, .. }
            | Instruction::GetTupleElement { operand, .. }
            | Instruction::Outfeed(operand) => vec![*operand],
            Instruction::Tuple(operands) | Instruction::CustomCall { operands, .. } => {
                operands.clone()
            }
        }
    }
}

/// An uncompiled program
#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    name: String,
    instructions: Vec<Instruction>,
    root: Operand,
}

impl Computation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn root(&self) -> Operand {
        self.root
    }

    pub fn parameter_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Parameter { .. }))
            .count()
    }
}

/// Incremental construction of a [`Computation`]
#[derive(Debug)]
pub struct ComputationBuilder {
    name: String,
    instructions: Vec<Instruction>,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ComputationBuilder {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    fn push(&mut self, instruction: Instruction) -> Operand {
        self.instructions.push(instruction);
        Operand(self.instructions.len() - 1)
    }

    pub fn parameter(&mut self, index: usize, shape: Shape) -> Operand {
        self.push(Instruction::Parameter { index, shape })
    }

    pub fn constant(&mut self, value: HostValue) -> Operand {
        self.push(Instruction::Constant(value))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        self.push(Instruction::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn subtract(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinaryOp::Subtract, lhs, rhs)
    }

    pub fn multiply(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinaryOp::Multiply, lhs, rhs)
    }

    pub fn maximum(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinaryOp::Maximum, lhs, rhs)
    }

    pub fn broadcast_scalar(&mut self, operand: Operand, dims: &[usize]) -> Operand {
        self.push(Instruction::Broadcast {
            operand,
            dims: dims.to_vec(),
        })
    }

    pub fn tuple(&mut self, elements: &[Operand]) -> Operand {
        self.push(Instruction::Tuple(elements.to_vec()))
    }

    pub fn get_tuple_element(&mut self, operand: Operand, index: usize) -> Operand {
        self.push(Instruction::GetTupleElement { operand, index })
    }

    pub fn replica_id(&mut self) -> Operand {
        self.push(Instruction::ReplicaId)
    }

    pub fn infeed(&mut self, shape: Shape) -> Operand {
        self.push(Instruction::Infeed(shape))
    }

    pub fn outfeed(&mut self, operand: Operand) -> Operand {
        self.push(Instruction::Outfeed(operand))
    }

    pub fn custom_call(
        &mut self,
        target: impl Into<String>,
        operands: &[Operand],
        shape: Shape,
    ) -> Operand {
        self.push(Instruction::CustomCall {
            target: target.into(),
            operands: operands.to_vec(),
            shape,
        })
    }

    /// Finish the program with `root` as its result
    pub fn build(self, root: Operand) -> Computation {
        Computation {
            name: self.name,
            instructions: self.instructions,
            root,
        }
    }
}
