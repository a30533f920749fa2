//! Host-resident array values used by eager evaluation.
//!
//! Elements are stored as `f64` in row-major order regardless of the [`DataType`]. Integer and boolean arrays hold
//! integral values; [`HostArray::new`] and the arithmetic helpers keep them integral.

use std::fmt::Display;

use thiserror::Error;

use crate::mesh::{Mesh, MeshPlacement};
use crate::types::{ArrayType, DataType, Shape};

/// Error type for operations on [`HostArray`]s.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueError {
    /// Error returned when the number of elements does not match the shape.
    #[error("shape {shape:?} holds {expected} element(s), but got {actual}")]
    ElementCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },

    /// Error returned when two shapes cannot be broadcast together.
    #[error("shapes {lhs:?} and {rhs:?} cannot be broadcast together")]
    IncompatibleShapes { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Error returned when an axis index is out of range.
    #[error("axis {axis} is out of range for an array of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Error returned when an axis cannot be split into equally sized blocks.
    #[error("axis {axis} of size {size} cannot be split into {parts} equal blocks")]
    NotDivisible { axis: usize, size: usize, parts: usize },

    /// Error returned when concatenating no arrays.
    #[error("cannot concatenate an empty list of arrays")]
    EmptyConcatenation,

    /// Error returned when concatenated arrays disagree on the non-concatenated dimensions.
    #[error("cannot concatenate arrays of shapes {lhs:?} and {rhs:?} along axis {axis}")]
    ConcatenationMismatch { axis: usize, lhs: Vec<usize>, rhs: Vec<usize> },
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

fn normalize(data_type: DataType, value: f64) -> f64 {
    match data_type {
        DataType::Boolean => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        DataType::Int32 | DataType::Int64 => value.trunc(),
        DataType::Float32 => value as f32 as f64,
        DataType::Float64 => value,
    }
}

/// Dense array stored on the host.
#[derive(Clone, Debug, PartialEq)]
pub struct HostArray {
    data_type: DataType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl HostArray {
    /// Creates an array from row-major data.
    pub fn new(data_type: DataType, shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ValueError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(ValueError::ElementCountMismatch { shape, expected, actual: data.len() });
        }
        let data = data.into_iter().map(|value| normalize(data_type, value)).collect();
        Ok(Self { data_type, shape, data })
    }

    /// Creates a scalar.
    pub fn scalar(data_type: DataType, value: f64) -> Self {
        Self { data_type, shape: Vec::new(), data: vec![normalize(data_type, value)] }
    }

    /// Creates an array filled with `value`.
    pub fn full(data_type: DataType, shape: Vec<usize>, value: f64) -> Self {
        let count = shape.iter().product::<usize>();
        Self { data_type, shape, data: vec![normalize(data_type, value); count] }
    }

    /// Creates an array of zeros.
    pub fn zeros(data_type: DataType, shape: Vec<usize>) -> Self {
        Self::full(data_type, shape, 0.0)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    pub fn data(&self) -> &[f64] {
        self.data.as_slice()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the type of this array, replicated and with no varying axes.
    pub fn array_type(&self) -> ArrayType {
        ArrayType::new(self.data_type, Shape::of(&self.shape))
    }

    /// Returns the single element of a one-element array.
    pub fn scalar_value(&self) -> Option<f64> {
        (self.data.len() == 1).then(|| self.data[0])
    }

    /// Applies `f` elementwise, producing an array of `data_type`.
    pub fn map<F: Fn(f64) -> f64>(&self, data_type: DataType, f: F) -> Self {
        let data = self.data.iter().map(|value| normalize(data_type, f(*value))).collect();
        Self { data_type, shape: self.shape.clone(), data }
    }

    /// Returns a copy with a different data type, converting the elements.
    pub fn cast(&self, data_type: DataType) -> Self {
        self.map(data_type, |value| value)
    }

    /// Combines two arrays elementwise with NumPy-like broadcasting.
    pub fn zip_with<F>(&self, other: &Self, data_type: DataType, f: F) -> Result<Self, ValueError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let rank = self.rank().max(other.rank());
        let pad = |shape: &[usize]| {
            let mut padded = vec![1usize; rank - shape.len()];
            padded.extend_from_slice(shape);
            padded
        };
        let lhs_shape = pad(&self.shape);
        let rhs_shape = pad(&other.shape);
        let mut shape = Vec::with_capacity(rank);
        for (lhs, rhs) in lhs_shape.iter().zip(rhs_shape.iter()) {
            match (lhs, rhs) {
                (a, b) if a == b => shape.push(*a),
                (1, b) => shape.push(*b),
                (a, 1) => shape.push(*a),
                _ => {
                    return Err(ValueError::IncompatibleShapes { lhs: self.shape.clone(), rhs: other.shape.clone() });
                }
            }
        }

        let out_strides = strides(&shape);
        let lhs_strides = strides(&lhs_shape);
        let rhs_strides = strides(&rhs_shape);
        let count = shape.iter().product::<usize>();
        let mut data = Vec::with_capacity(count);
        for index in 0..count {
            let (mut lhs_index, mut rhs_index) = (0usize, 0usize);
            for axis in 0..rank {
                let coordinate = (index / out_strides[axis]) % shape[axis];
                if lhs_shape[axis] != 1 {
                    lhs_index += coordinate * lhs_strides[axis];
                }
                if rhs_shape[axis] != 1 {
                    rhs_index += coordinate * rhs_strides[axis];
                }
            }
            data.push(normalize(data_type, f(self.data[lhs_index], other.data[rhs_index])));
        }
        Ok(Self { data_type, shape, data })
    }

    /// Returns the `block`-th of `parts` equally sized blocks along `axis`.
    pub fn block(&self, axis: usize, block: usize, parts: usize) -> Result<Self, ValueError> {
        let size = *self.shape.get(axis).ok_or(ValueError::AxisOutOfRange { axis, rank: self.rank() })?;
        if parts == 0 || size % parts != 0 {
            return Err(ValueError::NotDivisible { axis, size, parts });
        }
        let block_size = size / parts;
        let outer = self.shape[..axis].iter().product::<usize>();
        let inner = self.shape[axis + 1..].iter().product::<usize>();
        let mut data = Vec::with_capacity(outer * block_size * inner);
        for o in 0..outer {
            let start = (o * size + block * block_size) * inner;
            data.extend_from_slice(&self.data[start..start + block_size * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = block_size;
        Ok(Self { data_type: self.data_type, shape, data })
    }

    /// Concatenates arrays along `axis`.
    pub fn concatenate(parts: &[Self], axis: usize) -> Result<Self, ValueError> {
        let first = parts.first().ok_or(ValueError::EmptyConcatenation)?;
        if axis >= first.rank() {
            return Err(ValueError::AxisOutOfRange { axis, rank: first.rank() });
        }
        for part in parts {
            let compatible = part.rank() == first.rank()
                && part.shape.iter().zip(first.shape.iter()).enumerate().all(|(a, (l, r))| a == axis || l == r);
            if !compatible {
                return Err(ValueError::ConcatenationMismatch {
                    axis,
                    lhs: first.shape.clone(),
                    rhs: part.shape.clone(),
                });
            }
        }

        let outer = first.shape[..axis].iter().product::<usize>();
        let inner = first.shape[axis + 1..].iter().product::<usize>();
        let mut data = Vec::with_capacity(parts.iter().map(|part| part.data.len()).sum());
        for o in 0..outer {
            for part in parts {
                let chunk = part.shape[axis] * inner;
                data.extend_from_slice(&part.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape[axis] = parts.iter().map(|part| part.shape[axis]).sum();
        Ok(Self { data_type: first.data_type, shape, data })
    }

    /// Sums over the provided axes, removing them.
    pub fn reduce_sum(&self, axes: &[usize]) -> Result<Self, ValueError> {
        if let Some(axis) = axes.iter().find(|axis| **axis >= self.rank()) {
            return Err(ValueError::AxisOutOfRange { axis: *axis, rank: self.rank() });
        }
        let shape = self
            .shape
            .iter()
            .enumerate()
            .filter_map(|(axis, size)| (!axes.contains(&axis)).then_some(*size))
            .collect::<Vec<_>>();
        let in_strides = strides(&self.shape);
        let out_strides = strides(&shape);
        let mut data = vec![0.0; shape.iter().product::<usize>()];
        for (index, value) in self.data.iter().enumerate() {
            let mut out_index = 0usize;
            let mut out_axis = 0usize;
            for axis in 0..self.rank() {
                if axes.contains(&axis) {
                    continue;
                }
                out_index += ((index / in_strides[axis]) % self.shape[axis]) * out_strides[out_axis];
                out_axis += 1;
            }
            data[out_index] += value;
        }
        let data = data.into_iter().map(|value| normalize(self.data_type, value)).collect();
        Ok(Self { data_type: self.data_type, shape, data })
    }

    /// Returns the same elements with a different shape.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, ValueError> {
        let expected = shape.iter().product::<usize>();
        if expected != self.data.len() {
            return Err(ValueError::ElementCountMismatch { shape, expected, actual: self.data.len() });
        }
        Ok(Self { data_type: self.data_type, shape, data: self.data.clone() })
    }

    /// Returns `true` if any element is NaN.
    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|value| value.is_nan())
    }

    /// Returns `true` if any element is infinite.
    pub fn has_inf(&self) -> bool {
        self.data.iter().any(|value| value.is_infinite())
    }
}

impl Display for HostArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.data.iter().map(|value| value.to_string()).collect::<Vec<_>>();
        write!(f, "{}{:?}[{}]", self.data_type, self.shape, values.join(", "))
    }
}

/// Global array value, optionally placed on a concrete mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalArray {
    pub array: HostArray,
    pub mesh: Option<Mesh>,
}

impl GlobalArray {
    /// Creates a host-local array.
    pub fn host(array: HostArray) -> Self {
        Self { array, mesh: None }
    }

    /// Creates an array placed on `mesh`.
    pub fn placed(array: HostArray, mesh: Mesh) -> Self {
        Self { array, mesh: Some(mesh) }
    }
}

impl MeshPlacement for GlobalArray {
    fn placement_mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: Vec<usize>) -> HostArray {
        let count = shape.iter().product::<usize>();
        HostArray::new(DataType::Float32, shape, (0..count).map(|i| i as f64).collect()).unwrap()
    }

    #[test]
    fn test_new_checks_element_count_and_normalizes() {
        assert!(matches!(
            HostArray::new(DataType::Float32, vec![2, 2], vec![1.0]),
            Err(ValueError::ElementCountMismatch { expected: 4, actual: 1, .. }),
        ));
        let array = HostArray::new(DataType::Int32, vec![2], vec![1.7, -2.5]).unwrap();
        assert_eq!(array.data(), &[1.0, -2.0]);
    }

    #[test]
    fn test_zip_with_broadcasts() {
        let x = iota(vec![2, 3]);
        let y = HostArray::new(DataType::Float32, vec![3], vec![10.0, 20.0, 30.0]).unwrap();
        let z = x.zip_with(&y, DataType::Float32, |a, b| a + b).unwrap();
        assert_eq!(z.shape(), &[2, 3]);
        assert_eq!(z.data(), &[10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
        let s = HostArray::scalar(DataType::Float32, 2.0);
        assert_eq!(x.zip_with(&s, DataType::Float32, |a, b| a * b).unwrap().data()[5], 10.0);
        assert!(x.zip_with(&iota(vec![2]), DataType::Float32, |a, _| a).is_err());
    }

    #[test]
    fn test_block_and_concatenate_are_inverse() {
        let x = iota(vec![4, 3]);
        let blocks = (0..2).map(|b| x.block(0, b, 2).unwrap()).collect::<Vec<_>>();
        assert_eq!(blocks[1].data(), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(HostArray::concatenate(&blocks, 0).unwrap(), x);

        let blocks = (0..3).map(|b| x.block(1, b, 3).unwrap()).collect::<Vec<_>>();
        assert_eq!(blocks[2].data(), &[2.0, 5.0, 8.0, 11.0]);
        assert_eq!(HostArray::concatenate(&blocks, 1).unwrap(), x);

        assert!(matches!(x.block(0, 0, 3), Err(ValueError::NotDivisible { axis: 0, size: 4, parts: 3 })));
        assert!(matches!(HostArray::concatenate(&[], 0), Err(ValueError::EmptyConcatenation)));
    }

    #[test]
    fn test_reduce_sum() {
        let x = iota(vec![2, 3]);
        assert_eq!(x.reduce_sum(&[0]).unwrap().data(), &[3.0, 5.0, 7.0]);
        assert_eq!(x.reduce_sum(&[1]).unwrap().data(), &[3.0, 12.0]);
        assert_eq!(x.reduce_sum(&[0, 1]).unwrap().scalar_value(), Some(15.0));
    }
}
