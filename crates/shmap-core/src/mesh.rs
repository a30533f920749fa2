//! Logical device meshes over which sharded regions are mapped.
//!
//! A mesh arranges devices in a grid whose dimensions are named [`MeshAxis`] values. Argument and result
//! assignments split array dimensions along these names, and collectives inside a region communicate along them.
//!
//! Replication checking, rewriting, and staging only look at the topology, which is what [`AbstractMesh`] holds.
//! Eager evaluation additionally needs to know which device sits at which grid position, so it works with a
//! [`Mesh`]. A region declared over an [`AbstractMesh`] recovers its devices from the arguments it is called with
//! (see [`resolve_eager_mesh`]).

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use thiserror::Error;

use crate::axes::AxisSet;

/// Identifier of a single device in a [`Mesh`].
pub type DeviceId = usize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeshError {
    #[error("mesh axes need a name")]
    UnnamedAxis,

    #[error("mesh axis '{axis}' has size 0")]
    EmptyAxis { axis: String },

    #[error("mesh axis '{axis}' is declared twice")]
    RepeatedAxis { axis: String },

    #[error("device {device} is placed twice in the mesh")]
    RepeatedDevice { device: DeviceId },

    #[error("the mesh shape {shape} holds {expected} device(s) but {actual} were given")]
    WrongDeviceCount { shape: String, expected: usize, actual: usize },

    #[error("the number of devices in mesh {shape} does not fit in a machine word")]
    TooManyDevices { shape: String },

    /// An auto axis is not part of the mesh.
    #[error("auto axis '{axis_name}' is not an axis of the mesh with axis names {mesh_axis_names:?}")]
    UnknownAutoAxis { axis_name: String, mesh_axis_names: Vec<String> },

    /// Two arguments of an eagerly evaluated region live on meshes of different shapes.
    #[error(
        "mesh shape of the input {argument_mesh_shape} does not match the mesh shape {declared_mesh_shape} \
         passed to the sharded region, for argument #{argument}"
    )]
    MeshShapeMismatch { argument: usize, argument_mesh_shape: String, declared_mesh_shape: String },

    /// A region declared over an [`AbstractMesh`] is evaluated eagerly without any argument placed on a mesh.
    #[error(
        "eager evaluation of a sharded region declared over an abstract mesh requires at least one argument that \
         is placed on a concrete mesh"
    )]
    MissingConcreteMesh,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// One named dimension of a device grid.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self, MeshError> {
        let axis = Self { name: name.into(), size };
        axis.validate()?;
        Ok(axis)
    }

    fn validate(&self) -> Result<(), MeshError> {
        if self.name.is_empty() {
            Err(MeshError::UnnamedAxis)
        } else if self.size == 0 {
            Err(MeshError::EmptyAxis { axis: self.name.clone() })
        } else {
            Ok(())
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Ordered list of mesh axes, without devices.
///
/// Grid positions are row-major: the last axis varies fastest. A position is identified either by its coordinate
/// (one entry per axis) or by its linear index into the grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbstractMesh {
    axes: Vec<MeshAxis>,
    positions: HashMap<String, usize>,
}

impl AbstractMesh {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self, MeshError> {
        let mut positions = HashMap::with_capacity(axes.len());
        for (position, axis) in axes.iter().enumerate() {
            axis.validate()?;
            if positions.insert(axis.name.clone(), position).is_some() {
                return Err(MeshError::RepeatedAxis { axis: axis.name.clone() });
            }
        }
        Ok(Self { axes, positions })
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    /// Axis names in mesh order.
    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(MeshAxis::name).collect()
    }

    pub fn axis_set(&self) -> AxisSet {
        self.axes.iter().map(|axis| axis.name.clone()).collect()
    }

    /// Position of `axis_name` in the axis list.
    pub fn axis_index<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.positions.get(axis_name.as_ref()).copied()
    }

    pub fn axis_size<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index(axis_name).map(|index| self.axes[index].size)
    }

    pub fn contains_axis<S: AsRef<str>>(&self, axis_name: S) -> bool {
        self.positions.contains_key(axis_name.as_ref())
    }

    /// Number of grid positions, i.e. the product of all axis sizes.
    pub fn device_count(&self) -> Result<usize, MeshError> {
        self.axes
            .iter()
            .try_fold(1usize, |count, axis| count.checked_mul(axis.size))
            .ok_or_else(|| MeshError::TooManyDevices { shape: self.to_string() })
    }

    /// Number of devices that a dimension split over `axis_names` is divided among. Names that are not mesh axes
    /// do not split anything.
    pub fn axes_size<S: AsRef<str>>(&self, axis_names: &[S]) -> usize {
        axis_names.iter().filter_map(|name| self.axis_size(name)).product()
    }

    /// Same axis names and sizes in the same order. Devices are not compared.
    pub fn has_same_shape(&self, other: &Self) -> bool {
        self.axes == other.axes
    }

    /// Checks that a region over this mesh can leave `auto` under automatic partitioning.
    pub fn validate_auto_axes(&self, auto: &AxisSet) -> Result<(), MeshError> {
        if let Some(axis_name) = auto.iter().find(|name| !self.contains_axis(name.as_str())) {
            return Err(MeshError::UnknownAutoAxis {
                axis_name: axis_name.clone(),
                mesh_axis_names: self.axis_names().into_iter().map(str::to_string).collect(),
            });
        }
        Ok(())
    }

    /// Grid coordinate of the position with linear index `device_index`.
    pub fn coordinate_for_device_index(&self, device_index: usize) -> Vec<usize> {
        let mut remainder = device_index;
        let mut coordinate = self
            .axes
            .iter()
            .rev()
            .map(|axis| {
                let position = remainder % axis.size;
                remainder /= axis.size;
                position
            })
            .collect::<Vec<_>>();
        coordinate.reverse();
        coordinate
    }

    /// Linear index of the position at `coordinate`.
    pub fn device_index_for_coordinate(&self, coordinate: &[usize]) -> usize {
        self.axes.iter().zip(coordinate).fold(0, |index, (axis, position)| index * axis.size + position)
    }
}

/// Formats the mesh shape as `(x=2, y=4)`. Error messages identify meshes this way.
impl Display for AbstractMesh {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "(")?;
        for (index, axis) in self.axes.iter().enumerate() {
            if index > 0 {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{}={}", axis.name, axis.size)?;
        }
        write!(formatter, ")")
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// [`AbstractMesh`] with a device at every grid position. `devices[i]` sits at linear index `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mesh {
    topology: AbstractMesh,
    devices: Vec<DeviceId>,
}

impl Mesh {
    pub fn new(topology: AbstractMesh, devices: Vec<DeviceId>) -> Result<Self, MeshError> {
        let expected = topology.device_count()?;
        if devices.len() != expected {
            return Err(MeshError::WrongDeviceCount { shape: topology.to_string(), expected, actual: devices.len() });
        }
        let mut seen = HashSet::with_capacity(devices.len());
        for device in &devices {
            if !seen.insert(*device) {
                return Err(MeshError::RepeatedDevice { device: *device });
            }
        }
        Ok(Self { topology, devices })
    }

    /// Mesh over devices `0..n` in order, where `n` is the product of the axis sizes.
    pub fn local(axes: Vec<MeshAxis>) -> Result<Self, MeshError> {
        let topology = AbstractMesh::new(axes)?;
        let devices = (0..topology.device_count()?).collect();
        Self::new(topology, devices)
    }

    pub fn abstract_mesh(&self) -> &AbstractMesh {
        &self.topology
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Grid coordinate of `device`, or `None` if it is not part of this mesh.
    pub fn coordinate_for_device(&self, device: DeviceId) -> Option<Vec<usize>> {
        let index = self.devices.iter().position(|candidate| *candidate == device)?;
        Some(self.topology.coordinate_for_device_index(index))
    }
}

/// Mesh declared for a sharded region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshRef {
    /// Topology only. Eager evaluation recovers the devices from the arguments.
    Abstract(AbstractMesh),
    Concrete(Mesh),
}

impl MeshRef {
    pub fn abstract_mesh(&self) -> &AbstractMesh {
        match self {
            Self::Abstract(mesh) => mesh,
            Self::Concrete(mesh) => mesh.abstract_mesh(),
        }
    }
}

impl From<AbstractMesh> for MeshRef {
    fn from(mesh: AbstractMesh) -> Self {
        Self::Abstract(mesh)
    }
}

impl From<Mesh> for MeshRef {
    fn from(mesh: Mesh) -> Self {
        Self::Concrete(mesh)
    }
}

/// Implemented by argument values that may already be distributed over a mesh.
pub trait MeshPlacement {
    /// Mesh this value is distributed over, or `None` for host-local values.
    fn placement_mesh(&self) -> Option<&Mesh>;
}

/// Resolves the concrete mesh used for eager evaluation of a sharded region.
///
/// Every placed argument must live on a mesh with the same shape as the declared one. If the declared mesh is
/// concrete it is returned as is. Otherwise the mesh of the last placed argument is used.
pub fn resolve_eager_mesh<P: MeshPlacement>(declared: &MeshRef, arguments: &[P]) -> Result<Mesh, MeshError> {
    let topology = declared.abstract_mesh();
    let mut placed = None;
    for (argument, value) in arguments.iter().enumerate() {
        let Some(mesh) = value.placement_mesh() else { continue };
        if !mesh.abstract_mesh().has_same_shape(topology) {
            return Err(MeshError::MeshShapeMismatch {
                argument,
                argument_mesh_shape: mesh.abstract_mesh().to_string(),
                declared_mesh_shape: topology.to_string(),
            });
        }
        placed = Some(mesh);
    }
    match declared {
        MeshRef::Concrete(mesh) => Ok(mesh.clone()),
        MeshRef::Abstract(_) => placed.cloned().ok_or(MeshError::MissingConcreteMesh),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
