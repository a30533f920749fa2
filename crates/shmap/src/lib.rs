pub use shmap_core as core;

pub use shmap_core::axes::{AxisAssignment, AxisName, AxisSet, PartitionDimension, PartitionSpec, Replication};
pub use shmap_core::config::ShardMapConfig;
pub use shmap_core::errors::Error;
pub use shmap_core::graph::{Atom, AtomId, Graph, GraphBuilder, Op};
pub use shmap_core::mesh::{AbstractMesh, Mesh, MeshAxis, MeshRef};
pub use shmap_core::replication::RuleRegistry;
pub use shmap_core::shard_map::{
    BodyTransform, Mode, ModeOutput, OutSpecs, ShardMapOp, ShardMapSpec, shard_map, shard_map_eager,
};
pub use shmap_core::types::{ArrayType, DataType, Shape};
pub use shmap_core::values::{GlobalArray, HostArray};
