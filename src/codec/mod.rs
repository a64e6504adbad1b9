//! Host value codec
//!
//! The codec turns host values into a shape plus one flat byte payload per
//! array leaf (depth-first order), and back. The execution core only ever
//! moves encoded payloads; [`NativeCodec`] is the codec for [`HostValue`].

mod value;

pub use value::{HostValue, NativeType};

use thiserror::Error;

use crate::shape::{ElementType, Shape};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("value of shape {shape} needs {expected} bytes, got {actual}")]
    ByteLengthMismatch {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
    #[error("shape {shape} has {expected} leaves but {actual} payloads were supplied")]
    LeafCountMismatch {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
    #[error("predicate element {index} has value {value}, expected 0 or 1")]
    InvalidPredicate { index: usize, value: u8 },
    #[error("unsupported host value: {0}")]
    Unsupported(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encoded form of a host value: its shape and one payload per array leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    pub shape: Shape,
    pub leaves: Vec<Vec<u8>>,
}

impl EncodedValue {
    pub fn total_bytes(&self) -> usize {
        self.leaves.iter().map(Vec::len).sum()
    }
}

/// Conversion between a host value type and device byte layouts
pub trait HostValueCodec: Send + Sync {
    type Value;

    fn encode(&self, value: &Self::Value) -> CodecResult<EncodedValue>;

    fn decode(&self, shape: &Shape, leaves: Vec<Vec<u8>>) -> CodecResult<Self::Value>;
}

/// Codec for [`HostValue`]: bytes are already in device layout
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

impl HostValueCodec for NativeCodec {
    type Value = HostValue;

    fn encode(&self, value: &HostValue) -> CodecResult<EncodedValue> {
        let shape = value.shape();
        let mut leaves = Vec::with_capacity(shape.leaf_count());
        encode_leaves(value, &mut leaves)?;
        Ok(EncodedValue { shape, leaves })
    }

    fn decode(&self, shape: &Shape, leaves: Vec<Vec<u8>>) -> CodecResult<HostValue> {
        let expected = shape.leaf_count();
        if leaves.len() != expected {
            return Err(CodecError::LeafCountMismatch {
                shape: shape.clone(),
                expected,
                actual: leaves.len(),
            });
        }
        let mut leaves = leaves.into_iter();
        decode_value(shape, &mut leaves)
    }
}

fn encode_leaves(value: &HostValue, out: &mut Vec<Vec<u8>>) -> CodecResult<()> {
    match value {
        HostValue::Array {
            element_type,
            dims,
            bytes,
        } => {
            let shape = Shape::array(*element_type, dims);
            check_leaf_bytes(&shape, bytes)?;
            out.push(bytes.clone());
        }
        HostValue::Tuple(elements) => {
            for element in elements {
                encode_leaves(element, out)?;
            }
        }
    }
    Ok(())
}

fn decode_value(
    shape: &Shape,
    leaves: &mut impl Iterator<Item = Vec<u8>>,
) -> CodecResult<HostValue> {
    match shape {
        Shape::Array { element_type, dims } => {
            let bytes = leaves
                .next()
                .ok_or_else(|| CodecError::Unsupported("ran out of leaf payloads".to_string()))?;
            check_leaf_bytes(shape, &bytes)?;
            Ok(HostValue::from_raw(*element_type, dims, bytes))
        }
        Shape::Tuple(elements) => {
            let decoded = elements
                .iter()
                .map(|element| decode_value(element, leaves))
                .collect::<CodecResult<Vec<_>>>()?;
            Ok(HostValue::Tuple(decoded))
        }
    }
}

fn check_leaf_bytes(shape: &Shape, bytes: &[u8]) -> CodecResult<()> {
    if shape.element_count() == usize::MAX {
        return Err(CodecError::Unsupported(format!(
            "element count of {} overflows",
            shape
        )));
    }
    let expected = shape.byte_size();
    if bytes.len() != expected {
        return Err(CodecError::ByteLengthMismatch {
            shape: shape.clone(),
            expected,
            actual: bytes.len(),
        });
    }
    if shape.element_type() == Some(ElementType::Pred) {
        if let Some(index) = bytes.iter().position(|&b| b > 1) {
            return Err(CodecError::InvalidPredicate {
                index,
                value: bytes[index],
            });
        }
    }
    Ok(())
}
