//! Programs: the source IR, build options and the compiler interface

pub mod compiler;
pub mod computation;
pub mod options;

pub use compiler::{CompileError, CompileResult, CompiledArtifact, HostCompiler, ProgramCompiler};
pub use computation::{BinaryOp, Computation, ComputationBuilder, Instruction, Operand};
pub use options::BuildOptions;
