//! Array types and the shard/unshard type transform applied at region boundaries.
//!
//! An [`ArrayType`] describes a value flowing through a [`Graph`](crate::graph::Graph): its [`DataType`], its
//! [`Shape`], how its dimensions are partitioned over mesh axes (a [`PartitionSpec`]), and the set of mesh axes
//! along which it may differ between devices (its *varying axes*, the complement of its replication inside a
//! sharded region).
//!
//! When a value enters a sharded region, [`shard_type`] turns its global type into the per-device local type: every
//! dimension split over axes `(a, b)` is divided by `size(a) * size(b)`. When a value leaves, [`unshard_type`]
//! multiplies the dimension back. For every valid assignment:
//!
//! ```rust
//! # use shmap_core::axes::{AxisAssignment, AxisSet};
//! # use shmap_core::mesh::{AbstractMesh, MeshAxis};
//! # use shmap_core::types::{shard_type, unshard_type, ArrayType, DataType, Shape, Size};
//! let mesh = AbstractMesh::new(vec![MeshAxis::new("x", 4).unwrap()]).unwrap();
//! let assignment = AxisAssignment::replicated().with_dimension(0, ["x"]);
//! let global = ArrayType::new(DataType::Float32, Shape::new(vec![Size::Static(8), Size::Static(3)]));
//! let local = shard_type(&mesh, &AxisSet::new(), true, &assignment, &global).unwrap();
//! assert_eq!(local.shape, Shape::new(vec![Size::Static(2), Size::Static(3)]));
//! let restored = unshard_type(&mesh, &AxisSet::new(), true, &assignment, &local).unwrap();
//! assert_eq!(restored.shape, global.shape);
//! assert_eq!(restored.sharding, assignment.to_spec(2));
//! ```

use std::fmt::Display;

use thiserror::Error;

use crate::axes::{AxisAssignment, AxisName, AxisSet, PartitionDimension, PartitionSpec};
use crate::mesh::AbstractMesh;

/// Element type of an array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    /// Boolean.
    Boolean,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit IEEE floating-point number.
    Float32,
    /// 64-bit IEEE floating-point number.
    Float64,
}

impl DataType {
    /// Returns `true` for floating-point data types.
    pub fn is_floating_point(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Returns `true` for integer data types.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    /// Returns the narrowest data type that every provided data type can be promoted to.
    ///
    /// Promotion follows the chain `bool < i32 < i64 < f32 < f64`.
    pub fn promoted(data_types: &[&Self]) -> Option<Self> {
        data_types.iter().map(|data_type| **data_type).max()
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            DataType::Boolean => write!(f, "bool"),
            DataType::Int32 => write!(f, "i32"),
            DataType::Int64 => write!(f, "i64"),
            DataType::Float32 => write!(f, "f32"),
            DataType::Float64 => write!(f, "f64"),
        }
    }
}

/// Size of an array dimension. Dynamic sizes may carry an exclusive upper bound.
///
/// The [`Display`] implementation renders static sizes as a number, bounded dynamic sizes as `<` followed by the
/// bound, and unbounded dynamic sizes as `*`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Size {
    /// Size known while the graph is built.
    Static(usize),

    /// Size only known at runtime, with an optional exclusive upper bound.
    Dynamic(Option<usize>),
}

impl Size {
    /// Static size, or `None` for dynamic sizes.
    #[inline]
    pub fn value(&self) -> Option<usize> {
        match *self {
            Self::Static(size) => Some(size),
            Self::Dynamic(_) => None,
        }
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::Static(size) => write!(f, "{size}"),
            Self::Dynamic(Some(upper_bound)) => write!(f, "<{upper_bound}"),
            Self::Dynamic(None) => write!(f, "*"),
        }
    }
}

impl From<usize> for Size {
    fn from(value: usize) -> Self {
        Self::Static(value)
    }
}

/// Shape of an array, as the [`Size`]s of its dimensions from outermost to innermost.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Shape {
    pub dimensions: Vec<Size>,
}

impl Shape {
    #[inline]
    pub fn new(dimensions: Vec<Size>) -> Self {
        Self { dimensions }
    }

    /// Constructs a fully static [`Shape`].
    #[inline]
    pub fn of(dimensions: &[usize]) -> Self {
        Self::new(dimensions.iter().map(|size| Size::Static(*size)).collect())
    }

    /// Constructs a new scalar [`Shape`].
    #[inline]
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Returns the static dimension sizes, or `None` if any dimension is dynamic.
    pub fn static_dimensions(&self) -> Option<Vec<usize>> {
        self.dimensions.iter().map(Size::value).collect()
    }

    /// Shape that every one of `shapes` broadcasts to under NumPy rules, or `None` if two of them conflict or
    /// `shapes` is empty. Dynamic sizes only broadcast against a size of `1` or an identical dynamic size.
    ///
    /// ```rust
    /// # use shmap_core::types::{Shape, Size};
    /// let scalar = Shape::scalar();
    /// let matrix = Shape::of(&[42, 42]);
    /// let bounded = Shape::new(vec![Size::Dynamic(Some(10))]);
    /// let mixed = Shape::new(vec![Size::Static(42), Size::Dynamic(Some(10))]);
    ///
    /// assert_eq!(Shape::broadcast(&[&scalar, &bounded]), Some(bounded.clone()));
    /// assert_eq!(Shape::broadcast(&[&mixed, &bounded]), Some(mixed.clone()));
    /// assert_eq!(Shape::broadcast(&[&matrix, &scalar, &bounded, &mixed]), None);
    /// ```
    pub fn broadcast(shapes: &[&Self]) -> Option<Self> {
        let (first, rest) = shapes.split_first()?;
        rest.iter().try_fold((*first).clone(), |result, shape| {
            let rank = result.rank().max(shape.rank());
            // Dimensions are aligned on the right. Missing leading dimensions act as size 1.
            let padded = |shape: &Shape, index: usize| {
                (index + shape.rank()).checked_sub(rank).map_or(Size::Static(1), |index| shape.dimensions[index])
            };
            let dimensions = (0..rank)
                .map(|index| match (padded(&result, index), padded(shape, index)) {
                    (size, Size::Static(1)) | (Size::Static(1), size) => Some(size),
                    (lhs, rhs) if lhs == rhs => Some(lhs),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Shape::new(dimensions))
        })
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.dimensions.iter().map(|dimension| dimension.to_string()).collect::<Vec<_>>().join(", "))
    }
}

/// Type of a value in a [`Graph`](crate::graph::Graph).
///
/// The [`Display`] implementation renders the data type followed by the shape, and the varying axes (if any) in
/// braces, e.g., `f32[2, 3]{V:x}`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ArrayType {
    /// [`DataType`] of the elements stored in the array.
    pub data_type: DataType,

    /// [`Shape`] of the array.
    pub shape: Shape,

    /// Partitioning of the array dimensions over mesh axes of enclosing regions. Always has the rank of
    /// [`ArrayType::shape`].
    pub sharding: PartitionSpec,

    /// Manual mesh axes along which this value may differ between devices.
    pub varying_axes: AxisSet,
}

impl ArrayType {
    /// Constructs a replicated, non-varying [`ArrayType`].
    #[inline]
    pub fn new(data_type: DataType, shape: Shape) -> Self {
        let sharding = PartitionSpec::replicated(shape.rank());
        Self { data_type, shape, sharding, varying_axes: AxisSet::new() }
    }

    /// Constructs a scalar [`ArrayType`].
    #[inline]
    pub fn scalar(data_type: DataType) -> Self {
        Self::new(data_type, Shape::scalar())
    }

    /// Returns a copy of this type with the provided varying axes.
    pub fn with_varying_axes(mut self, varying_axes: AxisSet) -> Self {
        self.varying_axes = varying_axes;
        self
    }

    /// Returns a copy of this type with a different shape and a replicated sharding of the matching rank.
    pub fn with_shape(&self, shape: Shape) -> Self {
        let sharding = PartitionSpec::replicated(shape.rank());
        Self { data_type: self.data_type, shape, sharding, varying_axes: self.varying_axes.clone() }
    }

    /// Returns the rank of this type.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Returns `true` if both types have the same data type and shape. Sharding and varying axes are ignored.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.data_type == other.data_type && self.shape == other.shape
    }
}

impl Display for ArrayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.data_type, self.shape)?;
        if !self.varying_axes.is_empty() {
            let axes = self.varying_axes.iter().map(String::as_str).collect::<Vec<_>>();
            write!(f, "{{V:{}}}", axes.join(","))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shard/unshard
// ---------------------------------------------------------------------------

/// Error returned when a global type cannot be split according to an [`AxisAssignment`] (or a local type cannot be
/// reassembled).
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DivisibilityError {
    /// Error returned when the combined size of the assigned axes does not divide the dimension size.
    #[error(
        "assignment maps array dimension {dimension} (of size {size}) to {described}, but {product} does not \
         evenly divide {size}",
        described = describe_axes(.axes, *.product)
    )]
    NotDivisible { dimension: usize, size: usize, axes: Vec<AxisName>, product: usize },

    /// Error returned when an assigned dimension does not have a static size.
    #[error("assignment maps array dimension {dimension} to mesh axes, but that dimension has dynamic size {size}")]
    DynamicDimension { dimension: usize, size: Size },

    /// Error returned when an assignment refers to a dimension beyond the rank of the type.
    #[error("assignment refers to array dimension {dimension}, but the value has rank {rank}")]
    DimensionOutOfRange { dimension: usize, rank: usize },

    /// Error returned when an unsharded dimension size overflows.
    #[error("size of array dimension {dimension} overflows when multiplied by {product}")]
    Overflow { dimension: usize, product: usize },
}

fn describe_axes(axes: &[AxisName], product: usize) -> String {
    match axes {
        [axis] => format!("mesh axis '{axis}' (of size {product})"),
        _ => format!("mesh axes ({}) (of total size {product})", axes.join(", ")),
    }
}

fn assigned_dimensions<'a>(
    assignment: &'a AxisAssignment,
    tpe: &ArrayType,
) -> Result<impl Iterator<Item = (usize, &'a [AxisName])>, DivisibilityError> {
    if assignment.required_rank() > tpe.rank() {
        return Err(DivisibilityError::DimensionOutOfRange {
            dimension: assignment.required_rank() - 1,
            rank: tpe.rank(),
        });
    }
    Ok(assignment.dimensions())
}

fn sharding_entry(tpe: &ArrayType, dimension: usize) -> Vec<AxisName> {
    tpe.sharding.dimensions().get(dimension).map(|entry| entry.mesh_axes().to_vec()).unwrap_or_default()
}

fn sharding_dimension(axes: Vec<AxisName>) -> PartitionDimension {
    if axes.is_empty() { PartitionDimension::Unsharded } else { PartitionDimension::Sharded(axes) }
}

/// Computes the per-device local type of a value entering a sharded region.
///
/// Every assigned dimension is divided by the product of its axes' sizes and those axes are removed from the
/// dimension's sharding. When `check` is enabled, the assigned axes that are not in `auto` are added to the varying
/// axes.
pub fn shard_type(
    mesh: &AbstractMesh,
    auto: &AxisSet,
    check: bool,
    assignment: &AxisAssignment,
    global: &ArrayType,
) -> Result<ArrayType, DivisibilityError> {
    let mut dimensions = global.shape.dimensions.clone();
    let mut sharding = (0..global.rank()).map(|dimension| sharding_entry(global, dimension)).collect::<Vec<_>>();
    for (dimension, axes) in assigned_dimensions(assignment, global)? {
        let size = match dimensions[dimension] {
            Size::Static(size) => size,
            size => return Err(DivisibilityError::DynamicDimension { dimension, size }),
        };
        let product = mesh.axes_size(axes);
        if size % product != 0 {
            return Err(DivisibilityError::NotDivisible { dimension, size, axes: axes.to_vec(), product });
        }
        dimensions[dimension] = Size::Static(size / product);
        sharding[dimension].retain(|axis| !axes.contains(axis));
    }

    let mut varying_axes = global.varying_axes.clone();
    if check {
        varying_axes.extend(assignment.mentioned_axes().difference(auto).cloned());
    }
    Ok(ArrayType {
        data_type: global.data_type,
        shape: Shape::new(dimensions),
        sharding: PartitionSpec::new(sharding.into_iter().map(sharding_dimension).collect()),
        varying_axes,
    })
}

/// Computes the global type of a value leaving a sharded region.
///
/// Every assigned dimension is multiplied back by the product of its axes' sizes and the assigned axes are
/// prepended to the dimension's sharding. When `check` is enabled the varying axes that are not manual axes of the
/// region are retained; otherwise the result has no varying axes.
pub fn unshard_type(
    mesh: &AbstractMesh,
    auto: &AxisSet,
    check: bool,
    assignment: &AxisAssignment,
    local: &ArrayType,
) -> Result<ArrayType, DivisibilityError> {
    let mut dimensions = local.shape.dimensions.clone();
    let mut sharding = (0..local.rank()).map(|dimension| sharding_entry(local, dimension)).collect::<Vec<_>>();
    for (dimension, axes) in assigned_dimensions(assignment, local)? {
        let size = match dimensions[dimension] {
            Size::Static(size) => size,
            size => return Err(DivisibilityError::DynamicDimension { dimension, size }),
        };
        let product = mesh.axes_size(axes);
        let size = size.checked_mul(product).ok_or(DivisibilityError::Overflow { dimension, product })?;
        dimensions[dimension] = Size::Static(size);
        let mut merged = axes.to_vec();
        merged.append(&mut sharding[dimension]);
        sharding[dimension] = merged;
    }

    let varying_axes = if check {
        let is_manual = |axis: &AxisName| mesh.contains_axis(axis.as_str()) && !auto.contains(axis);
        local.varying_axes.iter().filter(|axis| !is_manual(axis)).cloned().collect()
    } else {
        AxisSet::new()
    };
    Ok(ArrayType {
        data_type: local.data_type,
        shape: Shape::new(dimensions),
        sharding: PartitionSpec::new(sharding.into_iter().map(sharding_dimension).collect()),
        varying_axes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::axis_set;
    use crate::mesh::MeshAxis;

    fn test_mesh() -> AbstractMesh {
        AbstractMesh::new(vec![MeshAxis::new("x", 4).unwrap(), MeshAxis::new("y", 2).unwrap()]).unwrap()
    }

    #[test]
    fn test_array_type_display() {
        assert_eq!(ArrayType::scalar(DataType::Boolean).to_string(), "bool[]");
        let tpe = ArrayType::new(DataType::Float32, Shape::new(vec![Size::Static(42), Size::Dynamic(Some(10))]));
        assert_eq!(tpe.to_string(), "f32[42, <10]");
        let tpe = ArrayType::new(DataType::Int64, Shape::of(&[2])).with_varying_axes(axis_set(["y", "x"]));
        assert_eq!(tpe.to_string(), "i64[2]{V:x,y}");
    }

    #[test]
    fn test_data_type_promotion() {
        assert_eq!(DataType::promoted(&[&DataType::Int32, &DataType::Float32]), Some(DataType::Float32));
        assert_eq!(DataType::promoted(&[&DataType::Boolean]), Some(DataType::Boolean));
        assert_eq!(DataType::promoted(&[]), None);
    }

    #[test]
    fn test_shard_type_divides_assigned_dimensions() {
        let mesh = test_mesh();
        let assignment = AxisAssignment::replicated().with_dimension(1, ["x", "y"]);
        let global = ArrayType::new(DataType::Float32, Shape::of(&[3, 16]));
        let local = shard_type(&mesh, &AxisSet::new(), true, &assignment, &global).unwrap();
        assert_eq!(local.shape, Shape::of(&[3, 2]));
        assert_eq!(local.varying_axes, axis_set(["x", "y"]));
        let local = shard_type(&mesh, &AxisSet::new(), false, &assignment, &global).unwrap();
        assert!(local.varying_axes.is_empty());
    }

    #[test]
    fn test_shard_type_reports_non_divisible_dimensions() {
        let mesh = test_mesh();
        let assignment = AxisAssignment::replicated().with_dimension(0, ["x"]);
        let global = ArrayType::new(DataType::Float32, Shape::of(&[10]));
        let error = shard_type(&mesh, &AxisSet::new(), true, &assignment, &global).unwrap_err();
        assert_eq!(
            error,
            DivisibilityError::NotDivisible { dimension: 0, size: 10, axes: vec!["x".to_string()], product: 4 },
        );
        assert_eq!(
            error.to_string(),
            "assignment maps array dimension 0 (of size 10) to mesh axis 'x' (of size 4), but 4 does not evenly \
             divide 10",
        );

        let assignment = AxisAssignment::replicated().with_dimension(0, ["x", "y"]);
        let global = ArrayType::new(DataType::Float32, Shape::of(&[12]));
        let error = shard_type(&mesh, &AxisSet::new(), true, &assignment, &global).unwrap_err();
        assert!(error.to_string().contains("mesh axes (x, y) (of total size 8)"));
    }

    #[test]
    fn test_shard_type_rejects_dynamic_and_out_of_range_dimensions() {
        let mesh = test_mesh();
        let assignment = AxisAssignment::replicated().with_dimension(0, ["x"]);
        let global = ArrayType::new(DataType::Float32, Shape::new(vec![Size::Dynamic(None)]));
        assert!(matches!(
            shard_type(&mesh, &AxisSet::new(), true, &assignment, &global),
            Err(DivisibilityError::DynamicDimension { dimension: 0, .. }),
        ));
        let global = ArrayType::scalar(DataType::Float32);
        assert!(matches!(
            shard_type(&mesh, &AxisSet::new(), true, &assignment, &global),
            Err(DivisibilityError::DimensionOutOfRange { dimension: 0, rank: 0 }),
        ));
    }

    #[test]
    fn test_unshard_type_merges_sharding_and_drops_manual_varying_axes() {
        let mesh = test_mesh();
        let auto = axis_set(["y"]);
        let assignment = AxisAssignment::replicated().with_dimension(0, ["x"]);
        let mut local = ArrayType::new(DataType::Float32, Shape::of(&[2, 5]));
        local.sharding = PartitionSpec::new(vec![PartitionDimension::sharded("z"), PartitionDimension::unsharded()]);
        local.varying_axes = axis_set(["x", "y", "z"]);
        let global = unshard_type(&mesh, &auto, true, &assignment, &local).unwrap();
        assert_eq!(global.shape, Shape::of(&[8, 5]));
        assert_eq!(
            global.sharding,
            PartitionSpec::new(vec![PartitionDimension::sharded_by(["x", "z"]), PartitionDimension::unsharded()]),
        );
        assert_eq!(global.varying_axes, axis_set(["y", "z"]));
    }

    #[test]
    fn test_shard_then_unshard_round_trips() {
        let mesh = test_mesh();
        let assignment = AxisAssignment::replicated().with_dimension(0, ["y"]).with_dimension(1, ["x"]);
        let mut global = ArrayType::new(DataType::Int32, Shape::of(&[6, 8]));
        global.sharding = PartitionSpec::new(vec![PartitionDimension::sharded("y"), PartitionDimension::sharded("x")]);
        let local = shard_type(&mesh, &AxisSet::new(), true, &assignment, &global).unwrap();
        assert_eq!(local.sharding, PartitionSpec::replicated(2));
        assert_eq!(unshard_type(&mesh, &AxisSet::new(), true, &assignment, &local).unwrap(), global);
    }
}
