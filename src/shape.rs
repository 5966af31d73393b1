use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

pub type Array = SmallVec<[u32; 8]>;

/// Maximum number of dimensions a native tensor may have.
pub const MAX_RANK: usize = 8;

pub fn display_comma(arr: &[u32]) -> String {
    arr.iter().map(|s| s.to_string()).join(", ")
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ShapeError {
    #[error("cannot broadcast [{}] to [{}]", display_comma(.from), display_comma(.to))]
    InvalidBroadcast { from: Vec<u32>, to: Vec<u32> },

    #[error("[{}] is not a permutation of {} axes", display_comma(.permutation), .rank)]
    InvalidPermutation { permutation: Vec<u32>, rank: usize },

    #[error("axis {axis} is out of range for a tensor of rank {rank}")]
    AxisOutOfBounds { axis: u32, rank: usize },

    #[error("dimension {index} has size 0")]
    ZeroDimension { index: usize },

    #[error("the byte length of the tensor is too large")]
    Overflow,

    #[error("{count} elements cannot be addressed with 32-bit strides")]
    TooManyElements { count: u64 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Int8,
    Uint8,
}

impl DataType {
    pub fn size_in_bytes(self) -> u64 {
        match self {
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Float16 => 2,
            DataType::Int64 | DataType::Uint64 => 8,
            DataType::Int8 | DataType::Uint8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Uint8 => "uint8",
        };
        f.write_str(name)
    }
}

/// Binding behavior of a tensor.
///
/// `OwnedByBackend` marks graph inputs whose contents are handed to the
/// backend once at initialization (constant weights) instead of being bound
/// on every execution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum TensorFlags {
    #[default]
    None,
    OwnedByBackend,
}

/// Which edge the existing dimensions stay anchored to when the rank grows.
///
/// `Trailing` keeps the dimensions at the end and pads at the front, so
/// `[3, 4]` becomes `[1, 1, 3, 4]`. `Leading` pads at the back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Alignment {
    Leading,
    Trailing,
}

/// Checked byte length of a densely packed tensor.
pub fn byte_length(data_type: DataType, dims: &[u32]) -> Result<u64, ShapeError> {
    let mut count: u64 = 1;
    for (index, &dim) in dims.iter().enumerate() {
        if dim == 0 {
            return Err(ShapeError::ZeroDimension { index });
        }
        count = count.checked_mul(dim as u64).ok_or(ShapeError::Overflow)?;
    }
    count
        .checked_mul(data_type.size_in_bytes())
        .ok_or(ShapeError::Overflow)
}

/// Rejects shapes whose element count does not fit the `u32` strides of a
/// [`TensorDescriptor`].
pub fn check_element_count(dims: &[u32]) -> Result<(), ShapeError> {
    let count = dims
        .iter()
        .try_fold(1u64, |count, &dim| count.checked_mul(dim as u64))
        .ok_or(ShapeError::Overflow)?;
    if count > u32::MAX as u64 {
        return Err(ShapeError::TooManyElements { count });
    }
    Ok(())
}

/// Bidirectional broadcast of two shapes, aligned at the trailing edge.
pub fn broadcast_shapes(a: &[u32], b: &[u32]) -> Result<Array, ShapeError> {
    let (longer, shorter) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let pad = longer.len() - shorter.len();

    let mut out = Array::from_slice(longer);
    for (i, &s) in shorter.iter().enumerate() {
        let l = longer[pad + i];
        if l != s {
            if l == 1 {
                out[pad + i] = s;
            } else if s != 1 {
                return Err(ShapeError::InvalidBroadcast {
                    from: a.to_vec(),
                    to: b.to_vec(),
                });
            }
        }
    }
    Ok(out)
}

pub fn validate_permutation(permutation: &[u32], rank: usize) -> Result<(), ShapeError> {
    let mut seen = [false; MAX_RANK];
    let valid = permutation.len() == rank
        && rank <= MAX_RANK
        && permutation.iter().all(|&axis| {
            let axis = axis as usize;
            axis < rank && !std::mem::replace(&mut seen[axis], true)
        });
    if valid {
        Ok(())
    } else {
        Err(ShapeError::InvalidPermutation {
            permutation: permutation.to_vec(),
            rank,
        })
    }
}

/// Shape, strides and element type of a tensor as the native backend reads it.
///
/// Strides are counted in elements. A descriptor produced by `transpose` or
/// `broadcast_to` is a view: it addresses the same buffer with a different
/// pattern and never implies a copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDescriptor {
    data_type: DataType,
    flags: TensorFlags,
    dims: Array,
    strides: Array,
}

impl TensorDescriptor {
    /// Row-major strides. Shapes that passed [`check_element_count`] never
    /// saturate.
    pub fn default_strides(dims: &[u32]) -> Array {
        let mut strides: Array = dims
            .iter()
            .rev()
            .scan(1u32, |size, &dim| {
                let stride = *size;
                *size = size.saturating_mul(dim);
                Some(stride)
            })
            .collect();
        strides.reverse();
        strides
    }

    pub fn new(data_type: DataType, dims: &[u32]) -> Self {
        Self::with_flags(data_type, TensorFlags::None, dims)
    }

    pub fn with_flags(data_type: DataType, flags: TensorFlags, dims: &[u32]) -> Self {
        TensorDescriptor {
            data_type,
            flags,
            dims: Array::from_slice(dims),
            strides: Self::default_strides(dims),
        }
    }

    pub fn with_strides(
        data_type: DataType,
        flags: TensorFlags,
        dims: &[u32],
        strides: &[u32],
    ) -> Self {
        assert_eq!(dims.len(), strides.len(), "dims and strides must have the same rank");
        TensorDescriptor {
            data_type,
            flags,
            dims: Array::from_slice(dims),
            strides: Array::from_slice(strides),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn flags(&self) -> TensorFlags {
        self.flags
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn strides(&self) -> &[u32] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> u64 {
        self.dims.iter().map(|&d| d as u64).product()
    }

    /// Smallest buffer, in bytes, that covers every element this descriptor
    /// addresses, rounded up to 4 bytes.
    pub fn total_tensor_size_in_bytes(&self) -> u64 {
        if self.dims.iter().any(|&d| d == 0) {
            return 0;
        }
        let last_index: u64 = self
            .dims
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| (d as u64 - 1) * s as u64)
            .sum();
        let bytes = (last_index + 1) * self.data_type.size_in_bytes();
        (bytes + 3) & !3
    }

    pub fn is_default_strided(&self) -> bool {
        self.strides == Self::default_strides(&self.dims)
    }

    pub fn is_broadcastable_to(&self, target: &[u32]) -> bool {
        self.is_broadcastable_to_ignoring(target, 0)
    }

    pub fn is_broadcastable_to_ignoring(&self, target: &[u32], ignorable_dims: usize) -> bool {
        if self.rank() > target.len() {
            return false;
        }
        let pad = target.len() - self.rank();
        let checked = target.len().saturating_sub(ignorable_dims);
        self.dims.iter().enumerate().all(|(i, &d)| {
            let t = target[pad + i];
            pad + i >= checked || d == t || d == 1
        })
    }

    pub fn broadcast_to(&mut self, target: &[u32]) {
        self.broadcast_to_ignoring(target, 0)
    }

    /// Broadcasts every dimension except the trailing `ignorable_dims`, which
    /// keep their own sizes (the matrix dimensions of a batched matmul).
    pub fn broadcast_to_ignoring(&mut self, target: &[u32], ignorable_dims: usize) {
        assert!(
            self.rank() <= target.len(),
            "cannot broadcast rank {} to rank {}",
            self.rank(),
            target.len()
        );
        self.ensure_minimum_rank(target.len(), Alignment::Trailing);

        let checked = target.len().saturating_sub(ignorable_dims);
        for ((dim, stride), &t) in self
            .dims
            .iter_mut()
            .zip(self.strides.iter_mut())
            .zip(target.iter())
            .take(checked)
        {
            if *dim != t {
                // broadcast axes read the same element again, so their stride is 0
                assert_eq!(*dim, 1, "invalid broadcast of size {} to {}", dim, t);
                *dim = t;
                *stride = 0;
            }
        }
    }

    pub fn transpose(&mut self, permutation: &[u32]) {
        assert_eq!(permutation.len(), self.rank(), "permutation rank mismatch");
        let (dims, strides) = permutation
            .iter()
            .map(|&axis| (self.dims[axis as usize], self.strides[axis as usize]))
            .unzip();
        self.dims = dims;
        self.strides = strides;
    }

    pub fn ensure_minimum_rank(&mut self, rank: usize, alignment: Alignment) {
        if self.rank() >= rank {
            return;
        }
        let missing = rank - self.rank();
        match alignment {
            Alignment::Trailing => {
                self.dims.insert_many(0, std::iter::repeat(1).take(missing));
                self.strides.insert_many(0, std::iter::repeat(0).take(missing));
            }
            Alignment::Leading => {
                self.dims.extend(std::iter::repeat(1).take(missing));
                self.strides.extend(std::iter::repeat(0).take(missing));
            }
        }
    }

    /// Places this tensor's dimensions at `axes` of a tensor of rank `rank`.
    /// All other dimensions get size 1 and stride 0.
    pub fn make_broadcast_compatible(&mut self, rank: usize, axes: &[u32]) {
        assert_eq!(axes.len(), self.rank(), "one axis per dimension is required");
        let mut dims = Array::from_elem(1, rank);
        let mut strides = Array::from_elem(0, rank);
        for (i, &axis) in axes.iter().enumerate() {
            dims[axis as usize] = self.dims[i];
            strides[axis as usize] = self.strides[i];
        }
        self.dims = dims;
        self.strides = strides;
    }

    /// Element offset of the `index`-th element in logical row-major order.
    pub fn translate(&self, index: u64) -> u64 {
        let mut offset = 0;
        let mut rem = index;
        for (&dim, &stride) in self.dims.iter().zip(self.strides.iter()).rev() {
            let dim = dim as u64;
            offset += (rem % dim) * stride as u64;
            rem /= dim;
        }
        offset
    }

    pub fn iter(&self) -> IndexIter {
        IndexIter::new(self)
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] strides [{}]",
            self.data_type,
            display_comma(&self.dims),
            display_comma(&self.strides)
        )
    }
}

/// Visits the element offsets of a descriptor in logical row-major order.
pub struct IndexIter {
    dims: Array,
    strides: Array,
    counter: Array,
    offset: u64,
    remaining: u64,
}

impl IndexIter {
    pub fn new(desc: &TensorDescriptor) -> Self {
        IndexIter {
            dims: desc.dims.clone(),
            strides: desc.strides.clone(),
            counter: Array::from_elem(0, desc.rank()),
            offset: 0,
            remaining: desc.element_count(),
        }
    }
}

impl Iterator for IndexIter {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.offset;
        self.remaining -= 1;

        // odometer step from the innermost axis
        for axis in (0..self.dims.len()).rev() {
            self.counter[axis] += 1;
            self.offset += self.strides[axis] as u64;
            if self.counter[axis] < self.dims[axis] {
                break;
            }
            self.offset -= self.strides[axis] as u64 * self.dims[axis] as u64;
            self.counter[axis] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for IndexIter {}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn broadcast_pair() -> impl Strategy<Value = (Vec<u32>, Vec<u32>)> {
        prop::collection::vec((1u32..6, any::<bool>()), 1..6).prop_map(|axes| {
            let target = axes.iter().map(|(d, _)| *d).collect::<Vec<_>>();
            let source = axes
                .iter()
                .map(|(d, squeezed)| if *squeezed { 1 } else { *d })
                .collect::<Vec<_>>();
            (source, target)
        })
    }

    proptest! {
        /// Only the axes that actually broadcast get a zero stride.
        #[test]
        fn broadcast_zeroes_exactly_the_broadcast_axes((source, target) in broadcast_pair()) {
            let before = TensorDescriptor::new(DataType::Float32, &source);
            let mut after = before.clone();
            after.broadcast_to(&target);

            prop_assert_eq!(after.dims(), target.as_slice());
            for i in 0..source.len() {
                if source[i] == 1 && target[i] != 1 {
                    prop_assert_eq!(after.strides()[i], 0);
                } else {
                    prop_assert_eq!(after.strides()[i], before.strides()[i]);
                }
            }
        }

        /// A broadcast view never addresses bytes beyond the source tensor.
        #[test]
        fn broadcast_stays_within_source((source, target) in broadcast_pair()) {
            let mut desc = TensorDescriptor::new(DataType::Float32, &source);
            let bytes = desc.total_tensor_size_in_bytes();
            desc.broadcast_to(&target);
            prop_assert!(desc.total_tensor_size_in_bytes() <= bytes);
            prop_assert!(desc.iter().all(|offset| (offset + 1) * 4 <= bytes));
        }
    }
}
