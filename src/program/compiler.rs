//! Program compiler interface and the reference host compiler

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{HostValueCodec, NativeCodec};
use crate::program::computation::{Computation, Instruction, Operand};
use crate::program::options::BuildOptions;
use crate::shape::{ElementType, Shape};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("invalid program: {0}")]
    InvalidProgram(String),
    #[error("invalid build options: {0}")]
    InvalidOptions(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Immutable output of a [`ProgramCompiler`].
///
/// Holds the lowered program together with the shapes the compiler
/// resolved. Device platforms execute artifacts; the core only passes
/// them through.
#[derive(Debug)]
pub struct CompiledArtifact {
    name: String,
    computation: Arc<Computation>,
    parameter_shapes: Vec<Shape>,
    instruction_shapes: Vec<Shape>,
    result_shape: Shape,
    options: BuildOptions,
}

impl CompiledArtifact {
    pub fn new(
        computation: Computation,
        parameter_shapes: Vec<Shape>,
        instruction_shapes: Vec<Shape>,
        result_shape: Shape,
        options: BuildOptions,
    ) -> Self {
        CompiledArtifact {
            name: computation.name().to_string(),
            computation: Arc::new(computation),
            parameter_shapes,
            instruction_shapes,
            result_shape,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    pub fn parameter_shapes(&self) -> &[Shape] {
        &self.parameter_shapes
    }

    /// Shape of every instruction, indexed like `computation().instructions()`
    pub fn instruction_shapes(&self) -> &[Shape] {
        &self.instruction_shapes
    }

    pub fn result_shape(&self) -> &Shape {
        &self.result_shape
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn num_replicas(&self) -> usize {
        self.options.num_replicas()
    }
}

/// Lowers a source program into a [`CompiledArtifact`]
pub trait ProgramCompiler: Send + Sync + fmt::Debug {
    fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        options: &BuildOptions,
    ) -> CompileResult<CompiledArtifact>;
}

/// Compiler for the host platform: type-checks the program and resolves
/// every instruction shape. No lowering beyond that is needed because the
/// host platform interprets the instruction list directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCompiler;

impl ProgramCompiler for HostCompiler {
    fn compile(
        &self,
        computation: &Computation,
        argument_layouts: &[Shape],
        options: &BuildOptions,
    ) -> CompileResult<CompiledArtifact> {
        if options.num_replicas() == 0 {
            return Err(CompileError::InvalidOptions(
                "num_replicas must be at least 1".to_string(),
            ));
        }

        let instruction_shapes = infer_shapes(computation, argument_layouts)?;
        let root = computation.root().index();
        let result_shape = instruction_shapes
            .get(root)
            .cloned()
            .ok_or_else(|| {
                CompileError::InvalidProgram(format!(
                    "root instruction {} is out of range ({} instructions)",
                    root,
                    instruction_shapes.len()
                ))
            })?;

        if let Some(expected) = options.result_shape() {
            if *expected != result_shape {
                return Err(CompileError::InvalidProgram(format!(
                    "program result shape {} does not match requested result shape {}",
                    result_shape, expected
                )));
            }
        }

        tracing::debug!(
            program = computation.name(),
            instructions = instruction_shapes.len(),
            result = %result_shape,
            "HostCompiler: compiled program"
        );

        Ok(CompiledArtifact::new(
            computation.clone(),
            argument_layouts.to_vec(),
            instruction_shapes,
            result_shape,
            options.clone(),
        ))
    }
}

fn infer_shapes(computation: &Computation, argument_layouts: &[Shape]) -> CompileResult<Vec<Shape>> {
    let instructions = computation.instructions();
    if instructions.is_empty() {
        return Err(CompileError::InvalidProgram(format!(
            "program {} has no instructions",
            computation.name()
        )));
    }

    let mut shapes: Vec<Shape> = Vec::with_capacity(instructions.len());
    let mut seen_parameters = BTreeSet::new();

    for (position, instruction) in instructions.iter().enumerate() {
        for operand in instruction.operands() {
            if operand.index() >= position {
                return Err(CompileError::InvalidProgram(format!(
                    "instruction {} uses operand {} which is not defined before it",
                    position,
                    operand.index()
                )));
            }
        }
        let operand_shape = |operand: &Operand| &shapes[operand.index()];

        let shape = match instruction {
            Instruction::Parameter { index, shape } => {
                if !seen_parameters.insert(*index) {
                    return Err(CompileError::InvalidProgram(format!(
                        "parameter {} is declared twice",
                        index
                    )));
                }
                let layout = argument_layouts.get(*index).ok_or_else(|| {
                    CompileError::InvalidProgram(format!(
                        "parameter {} has no argument layout ({} supplied)",
                        index,
                        argument_layouts.len()
                    ))
                })?;
                if layout != shape {
                    return Err(CompileError::InvalidProgram(format!(
                        "parameter {} has shape {} but its argument layout is {}",
                        index, shape, layout
                    )));
                }
                shape.clone()
            }
            Instruction::Constant(value) => NativeCodec
                .encode(value)
                .map_err(|e| CompileError::InvalidProgram(format!("bad constant: {}", e)))?
                .shape,
            Instruction::Binary { op, lhs, rhs } => {
                let (lhs, rhs) = (operand_shape(lhs), operand_shape(rhs));
                if lhs != rhs || !lhs.is_array() {
                    return Err(CompileError::InvalidProgram(format!(
                        "{:?} needs two arrays of the same shape, got {} and {}",
                        op, lhs, rhs
                    )));
                }
                if lhs.element_type() == Some(ElementType::Pred) {
                    return Err(CompileError::InvalidProgram(format!(
                        "{:?} is not defined for pred arrays",
                        op
                    )));
                }
                lhs.clone()
            }
            Instruction::Broadcast { operand, dims } => {
                let operand = operand_shape(operand);
                match operand.element_type() {
                    Some(element_type) if operand.dims().is_empty() => {
                        Shape::array(element_type, dims)
                    }
                    _ => {
                        return Err(CompileError::InvalidProgram(format!(
                            "broadcast operand must be a scalar, got {}",
                            operand
                        )))
                    }
                }
            }
            Instruction::Tuple(elements) => {
                Shape::tuple(elements.iter().map(|e| operand_shape(e).clone()).collect())
            }
            Instruction::GetTupleElement { operand, index } => {
                let operand = operand_shape(operand);
                operand.tuple_elements().get(*index).cloned().ok_or_else(|| {
                    CompileError::InvalidProgram(format!(
                        "tuple element {} is out of range for {}",
                        index, operand
                    ))
                })?
            }
            Instruction::ReplicaId => Shape::scalar(ElementType::S32),
            Instruction::Infeed(shape) => shape.clone(),
            Instruction::Outfeed(_) => Shape::empty_tuple(),
            Instruction::CustomCall {
                target,
                operands,
                shape,
            } => {
                if target.is_empty() {
                    return Err(CompileError::InvalidProgram(
                        "custom call target name is empty".to_string(),
                    ));
                }
                if let Some(bad) = operands.iter().map(operand_shape).find(|s| s.is_tuple()) {
                    return Err(CompileError::Unimplemented(format!(
                        "custom call {} with tuple operand {}",
                        target, bad
                    )));
                }
                if shape.is_tuple() {
                    return Err(CompileError::Unimplemented(format!(
                        "custom call {} with tuple result {}",
                        target, shape
                    )));
                }
                shape.clone()
            }
        };
        if shape.checked_byte_size().is_none() {
            return Err(CompileError::InvalidProgram(format!(
                "instruction {} has shape {} whose size overflows",
                position, shape
            )));
        }
        shapes.push(shape);
    }

    let expected: BTreeSet<usize> = (0..argument_layouts.len()).collect();
    if seen_parameters != expected {
        return Err(CompileError::InvalidProgram(format!(
            "program {} declares parameters {:?} but {} argument layouts were supplied",
            computation.name(),
            seen_parameters,
            argument_layouts.len()
        )));
    }

    Ok(shapes)
}
