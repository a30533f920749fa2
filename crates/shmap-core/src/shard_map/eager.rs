use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    axes::AxisAssignment,
    graph::{EvalContext, EvalError, Graph, Op},
    mesh::resolve_eager_mesh,
    shard_map::ShardMapOp,
    values::{GlobalArray, HostArray, ValueError},
};

/// Returns the block of `value` that `device` holds under `assignment`.
fn split(
    context: &EvalContext<'_>,
    assignment: &AxisAssignment,
    value: &HostArray,
    device: usize,
) -> Result<HostArray, EvalError> {
    let mut block = value.clone();
    for (dimension, axes) in assignment.dimensions() {
        let parts = context.mesh().map_or(1, |mesh| mesh.axes_size(axes));
        block = block.block(dimension, context.axis_position(device, axes)?, parts)?;
    }
    Ok(block)
}

/// Concatenates blocks indexed by their position along each of `dimensions`.
fn assemble(blocks: Vec<(Vec<usize>, HostArray)>, dimensions: &[usize]) -> Result<HostArray, EvalError> {
    let Some((&dimension, rest)) = dimensions.split_first() else {
        return blocks.into_iter().next().map(|(_, block)| block).ok_or(ValueError::EmptyConcatenation.into());
    };
    let mut groups = BTreeMap::<usize, Vec<(Vec<usize>, HostArray)>>::new();
    for (mut position, block) in blocks {
        let index = position.remove(0);
        groups.entry(index).or_default().push((position, block));
    }
    let parts = groups.into_values().map(|group| assemble(group, rest)).collect::<Result<Vec<_>, _>>()?;
    Ok(HostArray::concatenate(parts.as_slice(), dimension)?)
}

/// Reassembles the global value of an output from its per-device `values`. Devices that only differ along axes the
/// assignment does not mention hold the same block, so only the devices at coordinate `0` along those axes are read.
fn unsplit(
    context: &EvalContext<'_>,
    assignment: &AxisAssignment,
    values: Vec<HostArray>,
) -> Result<HostArray, EvalError> {
    let Some(mesh) = context.mesh() else {
        return values.into_iter().next().ok_or(ValueError::EmptyConcatenation.into());
    };
    let mentioned = assignment.mentioned_axes();
    let unmentioned = mesh
        .axes()
        .iter()
        .enumerate()
        .filter(|(_, axis)| !mentioned.contains(axis.name()))
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    let mut blocks = Vec::new();
    for (device, value) in values.into_iter().enumerate() {
        let coordinate = mesh.coordinate_for_device_index(device);
        if unmentioned.iter().any(|index| coordinate[*index] != 0) {
            continue;
        }
        let position = assignment
            .dimensions()
            .map(|(_, axes)| context.axis_position(device, axes))
            .collect::<Result<Vec<_>, _>>()?;
        blocks.push((position, value));
    }
    let dimensions = assignment.dimensions().map(|(dimension, _)| dimension).collect::<Vec<_>>();
    assemble(blocks, dimensions.as_slice())
}

impl ShardMapOp {
    /// Evaluates the body once per device of the mesh and reassembles the global results.
    ///
    /// A transposed region that hits a numeric fault is evaluated once more with its de-optimized body. If that
    /// evaluation fails as well, its error is returned.
    pub(crate) fn evaluate_eagerly(&self, arguments: &[GlobalArray]) -> Result<Vec<GlobalArray>, EvalError> {
        match (self.evaluate_body(&self.body, arguments), &self.deoptimized_body) {
            (Err(error @ EvalError::NumericFault { .. }), Some(deoptimized_body)) => {
                warn!(%error, "numeric fault in transposed sharded region; retrying with the de-optimized body");
                self.evaluate_body(deoptimized_body, arguments)
            }
            (result, _) => result,
        }
    }

    fn evaluate_body(&self, body: &Graph, arguments: &[GlobalArray]) -> Result<Vec<GlobalArray>, EvalError> {
        if arguments.len() != self.in_assignments.len() {
            return Err(EvalError::InvalidInputCount { expected: self.in_assignments.len(), got: arguments.len() });
        }
        let argument_types = arguments.iter().map(|argument| argument.array.array_type()).collect::<Vec<_>>();
        self.infer_output_types(argument_types.iter().collect::<Vec<_>>().as_slice())?;

        let mesh = resolve_eager_mesh(&self.mesh, arguments)?;
        let context = EvalContext::spmd(mesh.abstract_mesh(), self.manual_axes())?
            .with_numeric_checks(self.config.debug_nans, self.config.debug_infs);
        debug!(mesh = %mesh.abstract_mesh(), devices = context.device_count(), "evaluating sharded region");

        let inputs = arguments
            .iter()
            .zip(self.in_assignments.iter())
            .map(|(argument, assignment)| {
                (0..context.device_count())
                    .map(|device| split(&context, assignment, &argument.array, device))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = body.evaluate(&context, inputs)?;
        outputs
            .into_iter()
            .zip(self.out_assignments.iter())
            .map(|(values, assignment)| Ok(GlobalArray::placed(unsplit(&context, assignment, values)?, mesh.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::axis_set;
    use crate::config::ShardMapConfig;
    use crate::errors::Error;
    use crate::graph::{Atom, AtomId, GraphBuilder, NumericFault};
    use crate::mesh::{AbstractMesh, Mesh, MeshAxis, MeshError, MeshRef};
    use crate::ops::{AllGatherOp, AxisIndexOp, DivOp, MulOp, PsumOp, ReshapeOp};
    use crate::replication::ReplicationError;
    use crate::shard_map::tests::{mesh, p};
    use crate::shard_map::{Mode, ModeOutput, ShardMapSpec, shard_map_eager};
    use crate::types::{ArrayType, DataType, Shape};

    fn iota(shape: Vec<usize>) -> HostArray {
        let count = shape.iter().product::<usize>();
        HostArray::new(DataType::Float32, shape, (0..count).map(|i| i as f64).collect()).unwrap()
    }

    fn local_mesh() -> Mesh {
        Mesh::local(mesh().axes().to_vec()).unwrap()
    }

    #[test]
    fn test_split_and_unsplit() {
        let mesh = mesh();
        let context = EvalContext::spmd(&mesh, mesh.axis_set()).unwrap();
        let value = iota(vec![4, 2]);
        let assignment = AxisAssignment::replicated().with_dimension(0, ["y", "x"]);
        let blocks =
            (0..4).map(|device| split(&context, &assignment, &value, device).unwrap()).collect::<Vec<_>>();
        // Device 1 is at (x=0, y=1), which is position 2 along (y, x).
        assert_eq!(blocks[1].data(), &[4.0, 5.0]);
        assert_eq!(blocks[2].data(), &[2.0, 3.0]);
        assert_eq!(unsplit(&context, &assignment, blocks).unwrap(), value);

        let assignment = AxisAssignment::replicated().with_dimension(1, ["x"]);
        let blocks =
            (0..4).map(|device| split(&context, &assignment, &value, device).unwrap()).collect::<Vec<_>>();
        assert_eq!(blocks[0], blocks[1]);
        assert_eq!(blocks[2].data(), &[1.0, 3.0, 5.0, 7.0]);
        assert_eq!(unsplit(&context, &assignment, blocks).unwrap(), value);
    }

    #[test]
    fn test_shard_map_eager() {
        let spec = ShardMapSpec::new(local_mesh(), vec![p(&[Some("x"), None])], vec![p(&[Some("x"), None])]);
        let arguments = vec![GlobalArray::host(iota(vec![4, 2]))];
        let outputs = shard_map_eager(&spec, arguments.as_slice(), |builder, inputs| {
            let outputs = builder.add_equation(MulOp, vec![inputs[0].into(), Atom::literal(2.0, DataType::Float32)])?;
            Ok(outputs.into_iter().map(Atom::from).collect())
        })
        .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].array.data(), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
        assert_eq!(outputs[0].mesh, Some(local_mesh()));
    }

    #[test]
    fn test_shard_map_eager_collectives() {
        let body = |builder: &mut GraphBuilder, inputs: &[AtomId]| -> Result<Vec<Atom>, Error> {
            let total = builder.add_equation(PsumOp::new(["x", "y"]), vec![inputs[0].into()])?[0];
            let total = builder.add_equation(ReshapeOp::new(Vec::new()), vec![total.into()])?[0];
            let gather = AllGatherOp { axes: vec!["x".to_string()], dimension: 0, axis_size: 2 };
            let gathered = builder.add_equation(gather, vec![inputs[0].into()])?[0];
            let gather = AllGatherOp { axes: vec!["y".to_string()], dimension: 1, axis_size: 2 };
            let gathered = builder.add_equation(gather, vec![gathered.into()])?[0];
            Ok(vec![total.into(), gathered.into()])
        };
        let spec = ShardMapSpec::new(local_mesh(), vec![p(&[Some("x"), Some("y")])], vec![p(&[]), p(&[None, None])]);
        let arguments = vec![GlobalArray::host(iota(vec![2, 2]))];

        // Gathered values vary over the gathered axes, so only an unchecked region can return them as replicated.
        assert!(matches!(
            shard_map_eager(&spec, arguments.as_slice(), body),
            Err(Error::Replication(ReplicationError::CannotProveOutputReplication { output: 1, missing, .. }))
                if missing == axis_set(["x", "y"]),
        ));

        let spec = spec.with_config(ShardMapConfig::default().with_check_replication(false));
        let outputs = shard_map_eager(&spec, arguments.as_slice(), body).unwrap();
        assert_eq!(outputs[0].array.data(), &[6.0]);
        assert_eq!(outputs[1].array, iota(vec![2, 2]));
    }

    #[test]
    fn test_shard_map_eager_axis_index() {
        let spec = ShardMapSpec::new(local_mesh(), Vec::new(), vec![p(&[Some("x")])]);
        let outputs = shard_map_eager(&spec, &[], |builder, _| {
            let index = builder.add_equation(AxisIndexOp::new(["x"]), Vec::new())?[0];
            let index = builder.add_equation(ReshapeOp::new(vec![1]), vec![index.into()])?[0];
            Ok(vec![index.into()])
        })
        .unwrap();
        assert_eq!(outputs[0].array.data(), &[0.0, 1.0]);
    }

    #[test]
    fn test_shard_map_eager_mesh_resolution() {
        let spec = ShardMapSpec::new(mesh(), vec![p(&[Some("x"), None])], vec![p(&[Some("x"), None])]);
        let body = |_: &mut GraphBuilder, inputs: &[AtomId]| -> Result<Vec<Atom>, Error> {
            Ok(vec![inputs[0].into()])
        };

        let arguments = vec![GlobalArray::host(iota(vec![4, 2]))];
        assert!(matches!(
            shard_map_eager(&spec, arguments.as_slice(), body),
            Err(Error::Eval(EvalError::Mesh(MeshError::MissingConcreteMesh))),
        ));

        let arguments = vec![GlobalArray::placed(iota(vec![4, 2]), local_mesh())];
        let outputs = shard_map_eager(&spec, arguments.as_slice(), body).unwrap();
        assert_eq!(outputs[0].array, iota(vec![4, 2]));

        let other = Mesh::local(vec![MeshAxis::new("x", 4).unwrap()]).unwrap();
        let arguments = vec![GlobalArray::placed(iota(vec![4, 2]), other)];
        assert!(matches!(
            shard_map_eager(&spec, arguments.as_slice(), body),
            Err(Error::Eval(EvalError::Mesh(MeshError::MeshShapeMismatch { argument: 0, .. }))),
        ));
    }

    #[test]
    fn test_shard_map_eager_numeric_faults() {
        let config = ShardMapConfig::default().with_debug_nans(true);
        let spec = ShardMapSpec::new(local_mesh(), vec![p(&[Some("x")])], vec![p(&[Some("x")])]).with_config(config);
        let arguments = vec![GlobalArray::host(HostArray::zeros(DataType::Float32, vec![2]))];
        let result = shard_map_eager(&spec, arguments.as_slice(), |builder, inputs| {
            let outputs = builder.add_equation(DivOp, vec![inputs[0].into(), inputs[0].into()])?;
            Ok(outputs.into_iter().map(Atom::from).collect())
        });
        assert!(matches!(
            result,
            Err(Error::Eval(EvalError::NumericFault { op, kind: NumericFault::Nan })) if op == "div",
        ));
    }

    #[test]
    fn test_shard_map_eager_deoptimized_retry() {
        let mesh = AbstractMesh::new(vec![MeshAxis::new("x", 2).unwrap()]).unwrap();
        let config = ShardMapConfig::default().with_check_replication(false).with_debug_nans(true);
        let assignment = AxisAssignment::replicated().with_dimension(0, ["x"]);
        let tpe = ArrayType::new(DataType::Float32, Shape::of(&[1]));

        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(tpe.clone());
        let y = builder.add_equation(DivOp, vec![x.into(), x.into()]).unwrap()[0];
        let faulty = builder.build(vec![x], vec![y.into()]).unwrap();

        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(tpe);
        let healthy = builder.build(vec![x], vec![x.into()]).unwrap();

        let region = ShardMapOp::new(
            MeshRef::Concrete(Mesh::local(mesh.axes().to_vec()).unwrap()),
            vec![assignment.clone()],
            vec![assignment],
            faulty.clone(),
            config,
        )
        .unwrap();
        let arguments = vec![GlobalArray::host(HostArray::zeros(DataType::Float32, vec![2]))];
        assert!(matches!(
            region.process(Mode::Eager { arguments: arguments.as_slice() }),
            Err(Error::Eval(EvalError::NumericFault { .. })),
        ));

        let retried = region.clone().with_deoptimized_body(healthy);
        match retried.process(Mode::Eager { arguments: arguments.as_slice() }).unwrap() {
            ModeOutput::Values(values) => assert_eq!(values[0].array.data(), &[0.0, 0.0]),
            output => panic!("unexpected output: {output:?}"),
        }

        let retried = region.with_deoptimized_body(faulty);
        assert!(matches!(
            retried.process(Mode::Eager { arguments: arguments.as_slice() }),
            Err(Error::Eval(EvalError::NumericFault { .. })),
        ));
    }
}
