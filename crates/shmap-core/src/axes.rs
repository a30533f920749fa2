//! Axis assignments and replication sets.
//!
//! This module holds the two pieces of per-value metadata that the replication checker reasons about:
//!
//! - **[`AxisAssignment`]**: which mesh axes each array dimension is split over at a region boundary. It is the
//!   canonical form of a user-facing [`PartitionSpec`], written `{dimension: (axis, ...)}`.
//! - **[`Replication`]**: the set of mesh axes over which a value is statically known to be identical on every
//!   mesh slice, or the [`Replication::Unconstrained`] sentinel used for literals whose replication is
//!   decided by whatever consumes them.
//!
//! # Partition specs vs axis assignments
//!
//! A [`PartitionSpec`] lists one [`PartitionDimension`] per array dimension:
//!
//! | Constructor | Rendered as |
//! |---|---|
//! | `PartitionSpec::new(vec![sharded("x"), unsharded()])` | `P(x, None)` |
//! | `PartitionSpec::new(vec![sharded_by(["x", "y"])])` | `P((x, y))` |
//! | `PartitionSpec::replicated(0)` | `P()` |
//!
//! [`AxisAssignment::canonicalize`] drops unsharded dimensions and keeps a sorted map from dimension index to the
//! ordered tuple of axis names for that dimension. A dimension split over `("x", "y")` is divided into
//! `size(x) * size(y)` blocks, with `x` as the major index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use thiserror::Error;

use crate::mesh::AbstractMesh;

/// Name of a mesh axis.
pub type AxisName = String;

/// Set of mesh axis names. Iteration is in lexicographic order; use [`in_mesh_order`] when the order matters.
pub type AxisSet = BTreeSet<AxisName>;

/// Returns the axes of `axes` that belong to `mesh`, in mesh order.
pub fn in_mesh_order(mesh: &AbstractMesh, axes: &AxisSet) -> Vec<AxisName> {
    mesh.axis_names().into_iter().filter(|name| axes.contains(*name)).map(str::to_string).collect()
}

/// Renders an axis set as `{x, y}`.
pub fn format_axis_set(axes: &AxisSet) -> String {
    format!("{{{}}}", axes.iter().map(String::as_str).collect::<Vec<_>>().join(", "))
}

/// Builds an [`AxisSet`] from anything that yields axis names.
pub fn axis_set<I, S>(names: I) -> AxisSet
where
    I: IntoIterator<Item = S>,
    S: Into<AxisName>,
{
    names.into_iter().map(Into::into).collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for region boundary specifications.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpecError {
    /// Error returned when a spec refers to an axis that is not part of the mesh.
    #[error(
        "partition spec maps array dimension {dimension} to mesh axis '{axis_name}', which is not an axis of the \
         mesh with axis names {mesh_axis_names:?}"
    )]
    UnknownAxis { axis_name: AxisName, dimension: usize, mesh_axis_names: Vec<AxisName> },

    /// Error returned when a spec refers to an axis that was declared auto for the region.
    #[error(
        "partition spec maps array dimension {dimension} to mesh axis '{axis_name}', but that axis is auto for \
         this region and specs may only refer to manual axes"
    )]
    AutoAxis { axis_name: AxisName, dimension: usize },

    /// Error returned when a mesh axis is used more than once in the same spec.
    #[error(
        "mesh axis '{axis_name}' is used more than once in the same partition spec (again in dimension {dimension})"
    )]
    DuplicateAxis { axis_name: AxisName, dimension: usize },

    /// Error returned when a sharded dimension lists no axes.
    #[error("dimension {dimension} is sharded over an empty list of mesh axes")]
    EmptyAxisList { dimension: usize },

    /// Error returned when a region spec leaves a dimension unconstrained.
    #[error("dimension {dimension} is unconstrained, but sharded region specs must be fully specified")]
    UnconstrainedDimension { dimension: usize },

    /// Error returned when an argument spec is longer than the rank of the argument.
    #[error(
        "{position} has rank {rank}, but its partition spec {spec} has {spec_rank} entries; if the value is a \
         scalar, use P() instead"
    )]
    SpecTooLong { position: String, spec: String, spec_rank: usize, rank: usize },

    /// Error returned when an output assignment refers to a dimension beyond the output's rank.
    #[error(
        "output #{output} has rank {rank}, but its spec {spec} requires rank at least {required_rank}; if using \
         a rank-0 output, consider adding a singleton axis and mapping that instead"
    )]
    OutputRankTooSmall { output: usize, spec: String, rank: usize, required_rank: usize },

    /// Error returned when the number of specs does not match the number of values.
    #[error("expected {expected} {kind}, but got {actual}")]
    SpecCountMismatch { kind: String, expected: usize, actual: usize },
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Statically known replication of a value inside a sharded region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Replication {
    /// No constraint is known. Literals read as this; rules treat it conservatively.
    Unconstrained,
    /// The value is identical across every slice of the mesh along these axes.
    Axes(AxisSet),
}

impl Replication {
    /// Creates a replication over the given axes.
    pub fn over<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AxisName>,
    {
        Self::Axes(axis_set(names))
    }

    /// Returns the replication set, unless this is [`Replication::Unconstrained`].
    pub fn as_axes(&self) -> Option<&AxisSet> {
        match self {
            Self::Unconstrained => None,
            Self::Axes(axes) => Some(axes),
        }
    }

    /// Returns the replication set, reading [`Replication::Unconstrained`] as `all`.
    pub fn resolve(&self, all: &AxisSet) -> AxisSet {
        match self {
            Self::Unconstrained => all.clone(),
            Self::Axes(axes) => axes.clone(),
        }
    }

    /// Compares two replications, reading [`Replication::Unconstrained`] as `all`.
    pub fn equivalent(&self, other: &Self, all: &AxisSet) -> bool {
        self.resolve(all) == other.resolve(all)
    }
}

impl From<AxisSet> for Replication {
    fn from(axes: AxisSet) -> Self {
        Self::Axes(axes)
    }
}

impl Display for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconstrained => write!(f, "unconstrained"),
            Self::Axes(axes) => write!(f, "{}", format_axis_set(axes)),
        }
    }
}

// ---------------------------------------------------------------------------
// Partition specs
// ---------------------------------------------------------------------------

/// Per-dimension entry of a [`PartitionSpec`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PartitionDimension {
    /// The dimension is not split.
    Unsharded,
    /// The dimension is split over these mesh axes, major to minor.
    Sharded(Vec<AxisName>),
    /// The dimension is left to an external partitioner. Not allowed at region boundaries.
    Unconstrained,
}

impl PartitionDimension {
    /// Creates an unsharded dimension.
    pub fn unsharded() -> Self {
        Self::Unsharded
    }

    /// Creates a dimension sharded over a single mesh axis.
    pub fn sharded<N: Into<AxisName>>(axis_name: N) -> Self {
        Self::Sharded(vec![axis_name.into()])
    }

    /// Creates a dimension sharded over several mesh axes, major to minor.
    pub fn sharded_by<I, S>(axis_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AxisName>,
    {
        Self::Sharded(axis_names.into_iter().map(Into::into).collect())
    }

    /// Creates an unconstrained dimension.
    pub fn unconstrained() -> Self {
        Self::Unconstrained
    }

    /// Returns the mesh axes this dimension is split over.
    pub fn mesh_axes(&self) -> &[AxisName] {
        match self {
            Self::Sharded(axes) => axes.as_slice(),
            _ => &[],
        }
    }
}

impl Display for PartitionDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsharded => write!(f, "None"),
            Self::Unconstrained => write!(f, "UNCONSTRAINED"),
            Self::Sharded(axes) if axes.len() == 1 => write!(f, "{}", axes[0]),
            Self::Sharded(axes) => write!(f, "({})", axes.join(", ")),
        }
    }
}

/// Per-dimension partitioning of an array over mesh axes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    dimensions: Vec<PartitionDimension>,
}

impl PartitionSpec {
    /// Creates a partition spec from per-dimension entries.
    pub fn new(dimensions: Vec<PartitionDimension>) -> Self {
        Self { dimensions }
    }

    /// Creates a fully replicated spec of the given rank.
    pub fn replicated(rank: usize) -> Self {
        Self { dimensions: vec![PartitionDimension::Unsharded; rank] }
    }

    /// Returns the per-dimension entries.
    pub fn dimensions(&self) -> &[PartitionDimension] {
        self.dimensions.as_slice()
    }

    /// Returns the number of dimensions this spec covers.
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }
}

impl Display for PartitionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dimensions = self.dimensions.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "P({})", dimensions.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Axis assignments
// ---------------------------------------------------------------------------

/// Canonical map from array dimension to the ordered mesh axes that dimension is split over.
///
/// Dimensions that are not split are absent. An assignment with no entries describes a value that is fully
/// replicated across the region boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AxisAssignment {
    dimensions: BTreeMap<usize, Vec<AxisName>>,
}

impl AxisAssignment {
    /// Creates an assignment that splits no dimension.
    pub fn replicated() -> Self {
        Self::default()
    }

    /// Returns a copy of this assignment with `dimension` split over `axis_names`. An empty list removes the entry.
    pub fn with_dimension<I, S>(mut self, dimension: usize, axis_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AxisName>,
    {
        let axis_names = axis_names.into_iter().map(Into::into).collect::<Vec<_>>();
        if axis_names.is_empty() {
            self.dimensions.remove(&dimension);
        } else {
            self.dimensions.insert(dimension, axis_names);
        }
        self
    }

    /// Normalizes a partition spec into an assignment, dropping unsharded dimensions.
    ///
    /// Fails when a dimension is [`PartitionDimension::Unconstrained`], when a sharded dimension lists no axes, or
    /// when an axis appears more than once anywhere in the spec.
    pub fn canonicalize(spec: &PartitionSpec) -> Result<Self, SpecError> {
        let mut seen = AxisSet::new();
        let mut dimensions = BTreeMap::new();
        for (dimension, entry) in spec.dimensions().iter().enumerate() {
            match entry {
                PartitionDimension::Unsharded => {}
                PartitionDimension::Unconstrained => return Err(SpecError::UnconstrainedDimension { dimension }),
                PartitionDimension::Sharded(axis_names) => {
                    if axis_names.is_empty() {
                        return Err(SpecError::EmptyAxisList { dimension });
                    }
                    for axis_name in axis_names {
                        if !seen.insert(axis_name.clone()) {
                            return Err(SpecError::DuplicateAxis { axis_name: axis_name.clone(), dimension });
                        }
                    }
                    dimensions.insert(dimension, axis_names.clone());
                }
            }
        }
        Ok(Self { dimensions })
    }

    /// Renders this assignment back into a partition spec of the given rank.
    pub fn to_spec(&self, rank: usize) -> PartitionSpec {
        let rank = rank.max(self.required_rank());
        let dimensions = (0..rank)
            .map(|dimension| match self.dimensions.get(&dimension) {
                Some(axis_names) => PartitionDimension::Sharded(axis_names.clone()),
                None => PartitionDimension::Unsharded,
            })
            .collect();
        PartitionSpec::new(dimensions)
    }

    /// Checks that every axis belongs to `mesh`, that no axis is in `auto`, and that no axis is repeated.
    pub fn validate(&self, mesh: &AbstractMesh, auto: &AxisSet) -> Result<(), SpecError> {
        let mut seen = AxisSet::new();
        for (&dimension, axis_names) in &self.dimensions {
            for axis_name in axis_names {
                if !mesh.contains_axis(axis_name) {
                    return Err(SpecError::UnknownAxis {
                        axis_name: axis_name.clone(),
                        dimension,
                        mesh_axis_names: mesh.axis_names().into_iter().map(str::to_string).collect(),
                    });
                }
                if auto.contains(axis_name) {
                    return Err(SpecError::AutoAxis { axis_name: axis_name.clone(), dimension });
                }
                if !seen.insert(axis_name.clone()) {
                    return Err(SpecError::DuplicateAxis { axis_name: axis_name.clone(), dimension });
                }
            }
        }
        Ok(())
    }

    /// Returns the split dimensions and their axes, in dimension order.
    pub fn dimensions(&self) -> impl Iterator<Item = (usize, &[AxisName])> {
        self.dimensions.iter().map(|(dimension, axis_names)| (*dimension, axis_names.as_slice()))
    }

    /// Returns the axes that `dimension` is split over, if any.
    pub fn axes_for(&self, dimension: usize) -> Option<&[AxisName]> {
        self.dimensions.get(&dimension).map(Vec::as_slice)
    }

    /// Returns `true` if this assignment splits no dimension.
    pub fn is_replicated(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Returns the smallest rank a value needs for this assignment to apply to it.
    pub fn required_rank(&self) -> usize {
        self.dimensions.keys().next_back().map_or(0, |dimension| dimension + 1)
    }

    /// Returns every axis mentioned by this assignment.
    pub fn mentioned_axes(&self) -> AxisSet {
        self.dimensions.values().flatten().cloned().collect()
    }

    /// Returns the mesh axes not mentioned by this assignment, in mesh order.
    pub fn unmentioned(&self, mesh: &AbstractMesh) -> Vec<AxisName> {
        let mentioned = self.mentioned_axes();
        mesh.axis_names().into_iter().filter(|name| !mentioned.contains(*name)).map(str::to_string).collect()
    }

    /// Returns the axes over which a value entering a region with this assignment is replicated, which are all
    /// mesh axes the assignment does not mention.
    pub fn replication(&self, mesh: &AbstractMesh) -> AxisSet {
        self.unmentioned(mesh).into_iter().collect()
    }

    /// Returns the assignment of the same value after a batch dimension is inserted at `batch_dimension`.
    pub fn shift_for_batch(&self, batch_dimension: Option<usize>) -> Self {
        let dimensions = self
            .dimensions
            .iter()
            .map(|(&dimension, axis_names)| {
                let shifted = match batch_dimension {
                    Some(batch_dimension) if batch_dimension <= dimension => dimension + 1,
                    _ => dimension,
                };
                (shifted, axis_names.clone())
            })
            .collect();
        Self { dimensions }
    }
}

impl Display for AxisAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .dimensions
            .iter()
            .map(|(dimension, axis_names)| format!("{dimension}: ({})", axis_names.join(", ")))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
