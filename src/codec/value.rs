//! Host-side values moved to and from devices

use half::{bf16, f16};

use crate::shape::{ElementType, Shape};

/// Rust scalar types with a direct device element representation
pub trait NativeType: bytemuck::Pod {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! native_type {
    ($($ty:ty => $element:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$element;
            }
        )*
    };
}

native_type! {
    i8 => S8,
    i32 => S32,
    i64 => S64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
}

/// A host value: a dense array in native byte order, or a tuple of values.
///
/// Arrays store raw bytes so any element type can be carried without a
/// typed variant per type; use [`HostValue::to_vec`] to read them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Array {
        element_type: ElementType,
        dims: Vec<usize>,
        bytes: Vec<u8>,
    },
    Tuple(Vec<HostValue>),
}

impl HostValue {
    /// Array value copied from a typed slice
    pub fn from_slice<T: NativeType>(data: &[T], dims: &[usize]) -> Self {
        HostValue::Array {
            element_type: T::ELEMENT_TYPE,
            dims: dims.to_vec(),
            bytes: bytemuck::cast_slice::<T, u8>(data).to_vec(),
        }
    }

    /// One-dimensional array value
    pub fn vector<T: NativeType>(data: &[T]) -> Self {
        Self::from_slice(data, &[data.len()])
    }

    pub fn scalar<T: NativeType>(value: T) -> Self {
        Self::from_slice(std::slice::from_ref(&value), &[])
    }

    /// Predicate array, one byte per element
    pub fn pred(data: &[bool], dims: &[usize]) -> Self {
        HostValue::Array {
            element_type: ElementType::Pred,
            dims: dims.to_vec(),
            bytes: data.iter().map(|&b| b as u8).collect(),
        }
    }

    /// Array value from already-encoded bytes; not validated until encoded
    pub fn from_raw(element_type: ElementType, dims: &[usize], bytes: Vec<u8>) -> Self {
        HostValue::Array {
            element_type,
            dims: dims.to_vec(),
            bytes,
        }
    }

    pub fn tuple(elements: Vec<HostValue>) -> Self {
        HostValue::Tuple(elements)
    }

    /// Shape implied by this value's structure and dimensions
    pub fn shape(&self) -> Shape {
        match self {
            HostValue::Array {
                element_type, dims, ..
            } => Shape::array(*element_type, dims),
            HostValue::Tuple(elements) => {
                Shape::tuple(elements.iter().map(HostValue::shape).collect())
            }
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, HostValue::Tuple(_))
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            HostValue::Array { element_type, .. } => Some(*element_type),
            HostValue::Tuple(_) => None,
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            HostValue::Array { dims, .. } => dims,
            HostValue::Tuple(_) => &[],
        }
    }

    /// Raw array bytes, `None` for tuples
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Array { bytes, .. } => Some(bytes),
            HostValue::Tuple(_) => None,
        }
    }

    pub fn tuple_elements(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Tuple(elements) => Some(elements),
            HostValue::Array { .. } => None,
        }
    }

    /// Copy array elements out as `T`.
    ///
    /// Returns `None` for tuples, for a different element type, or when the
    /// byte length is not a whole number of elements.
    pub fn to_vec<T: NativeType>(&self) -> Option<Vec<T>> {
        let (element_type, bytes) = match self {
            HostValue::Array {
                element_type,
                bytes,
                ..
            } => (*element_type, bytes),
            HostValue::Tuple(_) => return None,
        };
        if element_type != T::ELEMENT_TYPE || bytes.len() % std::mem::size_of::<T>() != 0 {
            return None;
        }
        // Copy through a typed buffer so the result is aligned for T
        let mut out = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
        Some(out)
    }

    /// Predicate elements as booleans, `None` if this is not a PRED array
    pub fn to_pred_vec(&self) -> Option<Vec<bool>> {
        match self {
            HostValue::Array {
                element_type: ElementType::Pred,
                bytes,
                ..
            } => Some(bytes.iter().map(|&b| b != 0).collect()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_round_trip() {
        let value = HostValue::from_slice(&[1.5f32, -2.0, 3.25, 0.0], &[2, 2]);
        assert_eq!(value.shape(), Shape::array(ElementType::F32, &[2, 2]));
        assert_eq!(value.to_vec::<f32>(), Some(vec![1.5, -2.0, 3.25, 0.0]));
        assert_eq!(value.to_vec::<i32>(), None);
    }

    #[test]
    fn test_half_types() {
        let data = [f16::from_f32(1.0), f16::from_f32(-0.5)];
        let value = HostValue::vector(&data);
        assert_eq!(value.element_type(), Some(ElementType::F16));
        assert_eq!(value.bytes().map(|b| b.len()), Some(4));
        assert_eq!(value.to_vec::<f16>(), Some(data.to_vec()));
    }

    #[test]
    fn test_tuple_shape() {
        let value = HostValue::tuple(vec![
            HostValue::scalar(7i32),
            HostValue::pred(&[true, false], &[2]),
        ]);
        assert!(value.is_tuple());
        assert_eq!(
            value.shape(),
            Shape::tuple(vec![
                Shape::scalar(ElementType::S32),
                Shape::array(ElementType::Pred, &[2]),
            ])
        );
        assert_eq!(value.to_vec::<i32>(), None);
        let elements = value.tuple_elements().unwrap();
        assert_eq!(elements[1].to_pred_vec(), Some(vec![true, false]));
    }
}
