//! Reference interpreter used by the host platform
//!
//! Evaluates a compiled program instruction by instruction on host values.
//! Side effects (infeed, outfeed, custom calls) go through [`Effects`] so the
//! interpreter stays independent of how the platform stores device state.

use half::{bf16, f16};

use crate::codec::{HostValue, NativeType};
use crate::platform::{DriverError, DriverResult};
use crate::program::{BinaryOp, CompiledArtifact, Instruction};
use crate::shape::{ElementType, Shape};

/// Device side effects available to a running program
pub(crate) trait Effects {
    /// Dequeue the next infeed value; it must have `shape`
    fn infeed(&self, shape: &Shape) -> DriverResult<HostValue>;

    fn outfeed(&self, value: &HostValue) -> DriverResult<()>;

    fn custom_call(
        &self,
        target: &str,
        operands: &[&HostValue],
        shape: &Shape,
    ) -> DriverResult<HostValue>;
}

/// Evaluate `artifact` as replica `replica` with already-read arguments
pub(crate) fn evaluate(
    artifact: &CompiledArtifact,
    replica: usize,
    arguments: &[HostValue],
    effects: &dyn Effects,
) -> DriverResult<HostValue> {
    let computation = artifact.computation();
    let mut values: Vec<HostValue> = Vec::with_capacity(computation.instructions().len());

    for instruction in computation.instructions() {
        let value = match instruction {
            Instruction::Parameter { index, .. } => arguments
                .get(*index)
                .cloned()
                .ok_or_else(|| {
                    DriverError::ExecutionFailed(format!("missing argument {}", index))
                })?,
            Instruction::Constant(value) => value.clone(),
            Instruction::Binary { op, lhs, rhs } => {
                binary(*op, &values[lhs.index()], &values[rhs.index()])?
            }
            Instruction::Broadcast { operand, dims } => broadcast(&values[operand.index()], dims)?,
            Instruction::Tuple(elements) => HostValue::tuple(
                elements
                    .iter()
                    .map(|e| values[e.index()].clone())
                    .collect(),
            ),
            Instruction::GetTupleElement { operand, index } => values[operand.index()]
                .tuple_elements()
                .and_then(|elements| elements.get(*index))
                .cloned()
                .ok_or_else(|| {
                    DriverError::ExecutionFailed(format!("tuple element {} out of range", index))
                })?,
            Instruction::ReplicaId => {
                let id = i32::try_from(replica).map_err(|_| {
                    DriverError::ExecutionFailed(format!("replica id {} exceeds s32", replica))
                })?;
                HostValue::scalar(id)
            }
            Instruction::Infeed(shape) => effects.infeed(shape)?,
            Instruction::Outfeed(operand) => {
                effects.outfeed(&values[operand.index()])?;
                HostValue::tuple(Vec::new())
            }
            Instruction::CustomCall {
                target,
                operands,
                shape,
            } => {
                let operands: Vec<&HostValue> =
                    operands.iter().map(|o| &values[o.index()]).collect();
                effects.custom_call(target, &operands, shape)?
            }
        };
        values.push(value);
    }

    let root = computation.root().index();
    if root >= values.len() {
        return Err(DriverError::ExecutionFailed(format!(
            "root instruction {} was never evaluated",
            root
        )));
    }
    Ok(values.swap_remove(root))
}

/// Elementwise arithmetic for one element type
trait Arith: NativeType {
    fn apply(op: BinaryOp, lhs: Self, rhs: Self) -> Self;
}

macro_rules! integer_arith {
    ($($ty:ty),*) => {
        $(
            impl Arith for $ty {
                fn apply(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
                    match op {
                        BinaryOp::Add => lhs.wrapping_add(rhs),
                        BinaryOp::Subtract => lhs.wrapping_sub(rhs),
                        BinaryOp::Multiply => lhs.wrapping_mul(rhs),
                        BinaryOp::Maximum => lhs.max(rhs),
                    }
                }
            }
        )*
    };
}

integer_arith!(i8, i32, i64, u8, u32, u64);

macro_rules! float_arith {
    ($($ty:ty),*) => {
        $(
            impl Arith for $ty {
                fn apply(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
                    match op {
                        BinaryOp::Add => lhs + rhs,
                        BinaryOp::Subtract => lhs - rhs,
                        BinaryOp::Multiply => lhs * rhs,
                        // NaN propagates
                        BinaryOp::Maximum => {
                            if lhs.is_nan() || rhs.is_nan() {
                                <$ty>::NAN
                            } else {
                                lhs.max(rhs)
                            }
                        }
                    }
                }
            }
        )*
    };
}

float_arith!(f32, f64);

macro_rules! half_arith {
    ($($ty:ty),*) => {
        $(
            impl Arith for $ty {
                fn apply(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
                    <$ty>::from_f32(f32::apply(op, lhs.to_f32(), rhs.to_f32()))
                }
            }
        )*
    };
}

half_arith!(f16, bf16);

fn apply_typed<T: Arith>(op: BinaryOp, lhs: &HostValue, rhs: &HostValue) -> DriverResult<HostValue> {
    let (a, b) = match (lhs.to_vec::<T>(), rhs.to_vec::<T>()) {
        (Some(a), Some(b)) if a.len() == b.len() => (a, b),
        _ => {
            return Err(DriverError::ExecutionFailed(format!(
                "{:?} operands {} and {} are not compatible",
                op,
                lhs.shape(),
                rhs.shape()
            )))
        }
    };
    let out: Vec<T> = a
        .into_iter()
        .zip(b)
        .map(|(x, y)| T::apply(op, x, y))
        .collect();
    Ok(HostValue::from_slice(&out, lhs.dims()))
}

pub(crate) fn binary(op: BinaryOp, lhs: &HostValue, rhs: &HostValue) -> DriverResult<HostValue> {
    match lhs.element_type() {
        Some(ElementType::S8) => apply_typed::<i8>(op, lhs, rhs),
        Some(ElementType::S32) => apply_typed::<i32>(op, lhs, rhs),
        Some(ElementType::S64) => apply_typed::<i64>(op, lhs, rhs),
        Some(ElementType::U8) => apply_typed::<u8>(op, lhs, rhs),
        Some(ElementType::U32) => apply_typed::<u32>(op, lhs, rhs),
        Some(ElementType::U64) => apply_typed::<u64>(op, lhs, rhs),
        Some(ElementType::F16) => apply_typed::<f16>(op, lhs, rhs),
        Some(ElementType::BF16) => apply_typed::<bf16>(op, lhs, rhs),
        Some(ElementType::F32) => apply_typed::<f32>(op, lhs, rhs),
        Some(ElementType::F64) => apply_typed::<f64>(op, lhs, rhs),
        Some(ElementType::Pred) | None => Err(DriverError::ExecutionFailed(format!(
            "{:?} is not defined for {}",
            op,
            lhs.shape()
        ))),
    }
}

/// Replicate a scalar into an array of `dims`
pub(crate) fn broadcast(operand: &HostValue, dims: &[usize]) -> DriverResult<HostValue> {
    match (operand.element_type(), operand.bytes()) {
        (Some(element_type), Some(bytes)) if operand.dims().is_empty() => {
            let count = Shape::array(element_type, dims).element_count();
            Ok(HostValue::from_raw(element_type, dims, bytes.repeat(count)))
        }
        _ => Err(DriverError::ExecutionFailed(format!(
            "cannot broadcast {} to {:?}",
            operand.shape(),
            dims
        ))),
    }
}
