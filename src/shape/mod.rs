//! Array and tuple shapes shared by host values, device buffers and programs
//!
//! A [`Shape`] is either a dense row-major array of a single [`ElementType`]
//! or a tuple of other shapes. Leaves are always enumerated depth-first,
//! left to right; codec payloads and device transfers rely on that order.

use std::fmt;

/// Size in bytes of one entry in a tuple index table on device.
pub const TUPLE_ENTRY_BYTES: usize = 8;

/// Path of tuple indices from the root of a shape to one of its subshapes.
pub type ShapeIndex = Vec<usize>;

/// Primitive element type of an array shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Boolean stored as one byte (0 or 1)
    Pred,
    S8,
    S32,
    S64,
    U8,
    U32,
    U64,
    F16,
    BF16,
    F32,
    F64,
}

impl ElementType {
    /// Width of a single element in bytes
    pub fn byte_width(&self) -> usize {
        match self {
            ElementType::Pred | ElementType::S8 | ElementType::U8 => 1,
            ElementType::F16 | ElementType::BF16 => 2,
            ElementType::S32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::S64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            ElementType::F16 | ElementType::BF16 | ElementType::F32 | ElementType::F64
        )
    }

    /// Short lowercase name used when printing shapes
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Pred => "pred",
            ElementType::S8 => "s8",
            ElementType::S32 => "s32",
            ElementType::S64 => "s64",
            ElementType::U8 => "u8",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::F16 => "f16",
            ElementType::BF16 => "bf16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a host value or device buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Dense row-major array; an empty `dims` is a scalar
    Array {
        element_type: ElementType,
        dims: Vec<usize>,
    },
    /// Ordered collection of element shapes
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element_type: ElementType, dims: &[usize]) -> Self {
        Shape::Array {
            element_type,
            dims: dims.to_vec(),
        }
    }

    pub fn scalar(element_type: ElementType) -> Self {
        Shape::Array {
            element_type,
            dims: Vec::new(),
        }
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn empty_tuple() -> Self {
        Shape::Tuple(Vec::new())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array { .. })
    }

    /// Number of tuple elements, `None` for arrays
    pub fn tuple_arity(&self) -> Option<usize> {
        match self {
            Shape::Tuple(elements) => Some(elements.len()),
            Shape::Array { .. } => None,
        }
    }

    /// Tuple element shapes; empty for arrays
    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array { .. } => &[],
        }
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            Shape::Array { element_type, .. } => Some(*element_type),
            Shape::Tuple(_) => None,
        }
    }

    /// Array dimensions; empty for scalars and tuples
    pub fn dims(&self) -> &[usize] {
        match self {
            Shape::Array { dims, .. } => dims,
            Shape::Tuple(_) => &[],
        }
    }

    /// Number of array elements (saturating on overflow); zero for tuples
    pub fn element_count(&self) -> usize {
        match self {
            Shape::Array { dims, .. } => dims
                .iter()
                .copied()
                .fold(1usize, |acc, x| acc.checked_mul(x).unwrap_or(usize::MAX)),
            Shape::Tuple(_) => 0,
        }
    }

    /// Size of the device allocation backing this node (not its children).
    ///
    /// Arrays hold their elements; tuples hold an index table with one
    /// [`TUPLE_ENTRY_BYTES`] entry per element.
    pub fn byte_size(&self) -> usize {
        match self {
            Shape::Array { element_type, .. } => self
                .element_count()
                .saturating_mul(element_type.byte_width()),
            Shape::Tuple(elements) => elements.len() * TUPLE_ENTRY_BYTES,
        }
    }

    /// Like [`Shape::byte_size`], but `None` when the size does not fit in `usize`
    pub fn checked_byte_size(&self) -> Option<usize> {
        match self {
            Shape::Array { element_type, dims } => dims
                .iter()
                .try_fold(1usize, |acc, &x| acc.checked_mul(x))?
                .checked_mul(element_type.byte_width()),
            Shape::Tuple(elements) => elements.len().checked_mul(TUPLE_ENTRY_BYTES),
        }
    }

    /// Number of array leaves in depth-first order
    pub fn leaf_count(&self) -> usize {
        match self {
            Shape::Array { .. } => 1,
            Shape::Tuple(elements) => elements.iter().map(Shape::leaf_count).sum(),
        }
    }

    /// Array leaves in depth-first, left-to-right order
    pub fn leaf_shapes(&self) -> Vec<&Shape> {
        let mut leaves = Vec::with_capacity(self.leaf_count());
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Shape>) {
        match self {
            Shape::Array { .. } => out.push(self),
            Shape::Tuple(elements) => {
                for element in elements {
                    element.collect_leaves(out);
                }
            }
        }
    }

    /// Subshape addressed by `index`, or `None` if the path leaves the shape
    pub fn subshape(&self, index: &[usize]) -> Option<&Shape> {
        let mut current = self;
        for &i in index {
            current = current.tuple_elements().get(i)?;
        }
        Some(current)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { element_type, dims } => {
                write!(f, "{}[", element_type)?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", d)?;
                }
                f.write_str("]")
            }
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                f.write_str(")")
            }
        }
    }
}
