//! Rules for collectives, which act over a subset of the manual mesh axes.

use crate::{
    axes::{AxisSet, Replication},
    graph::{Atom, GraphBuilder, GraphError, Op},
    ops::PsumInvariantOp,
    replication::{Analysis, ReplicationError, rewrite::insert_pvary},
};

fn collective_axes(op: &dyn Op) -> Result<AxisSet, ReplicationError> {
    op.collective_axes()
        .map(|axes| axes.iter().cloned().collect())
        .ok_or_else(|| ReplicationError::UnexpectedOp { op: op.to_string(), expected: "collective" })
}

fn single_input<'r, T>(op: &dyn Op, reps: &'r [T]) -> Result<&'r T, ReplicationError> {
    match reps {
        [rep] => Ok(rep),
        _ => Err(GraphError::InvalidInputCount { op: op.to_string(), expected: 1, got: reps.len() }.into()),
    }
}

/// Requires `rep` to be known and to vary over every axis in `axes`.
fn require_varying<'r>(
    op: &dyn Op,
    rep: &'r Replication,
    axes: &AxisSet,
) -> Result<&'r AxisSet, ReplicationError> {
    let Replication::Axes(rep) = rep else {
        return Err(ReplicationError::UnconstrainedCollectiveInput { op: op.name().to_string() });
    };
    let overlap = rep.intersection(axes).cloned().collect::<AxisSet>();
    if !overlap.is_empty() {
        return Err(ReplicationError::ReplicatedCollectiveInput { op: op.name().to_string(), axes: overlap });
    }
    Ok(rep)
}

fn emit_single(
    builder: &mut GraphBuilder,
    op: &dyn Op,
    input: Atom,
    output_rep: AxisSet,
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let outputs = builder.add_boxed_equation(dyn_clone::clone_box(op), vec![input])?;
    let output_reps = vec![output_rep; outputs.len()];
    Ok((outputs.into_iter().map(Atom::from).collect(), output_reps))
}

/// Collectives that move data between devices along their axes (e.g., `all_gather` or `ppermute`). The input must
/// vary over the axes and the output keeps the replication of the input.
pub fn standard_collective_check(
    _: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let axes = collective_axes(op)?;
    let rep = require_varying(op, single_input(op, input_reps)?, &axes)?;
    Ok(vec![Replication::Axes(rep.clone())])
}

/// Marks the input as varying over the axes it is replicated over before emitting the collective. The output varies
/// over all the collective axes.
pub fn standard_collective_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let axes = collective_axes(op)?;
    let rep = single_input(op, input_reps)?;
    let overlap = rep.intersection(&axes).cloned().collect();
    let input = insert_pvary(analysis, builder, *single_input(op, inputs)?, &overlap)?;
    emit_single(builder, op, input, rep.difference(&axes).cloned().collect())
}

/// Collectives that reduce along their axes (e.g., `pmin`). The input must vary over the axes and the output is
/// additionally replicated over them.
pub fn reduction_collective_check(
    _: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let axes = collective_axes(op)?;
    let rep = require_varying(op, single_input(op, input_reps)?, &axes)?;
    Ok(vec![Replication::Axes(rep.union(&axes).cloned().collect())])
}

pub fn reduction_collective_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let axes = collective_axes(op)?;
    let rep = single_input(op, input_reps)?;
    let overlap = rep.intersection(&axes).cloned().collect();
    let input = insert_pvary(analysis, builder, *single_input(op, inputs)?, &overlap)?;
    emit_single(builder, op, input, rep.union(&axes).cloned().collect())
}

/// `psum_invariant` (and `psum`, which is always rewritten into it) requires inputs that vary over its axes and
/// produces outputs replicated over them.
pub fn psum_invariant_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let axes = collective_axes(op)?;
    for rep in input_reps {
        if let Replication::Axes(rep) = rep {
            let overlap = rep.intersection(&axes).cloned().collect::<AxisSet>();
            if !overlap.is_empty() {
                return Err(ReplicationError::ReplicatedCollectiveInput { op: op.name().to_string(), axes: overlap });
            }
        }
    }
    Ok(input_reps
        .iter()
        .map(|rep| Replication::Axes(analysis.resolve(rep).union(&axes).cloned().collect()))
        .collect())
}

/// Replaces `psum` with `psum_invariant`, first marking every input as varying over the summed axes it is replicated
/// over. A `psum` of a value replicated over the summed axes thus multiplies it by the size of those axes.
pub fn psum_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let axes = collective_axes(op)?;
    let input_rep = single_input(op, input_reps)?;
    let input = insert_pvary(
        analysis,
        builder,
        *single_input(op, inputs)?,
        &input_rep.intersection(&axes).cloned().collect(),
    )?;
    let output_rep = input_rep.union(&axes).cloned().collect();
    let psum = PsumInvariantOp::new(analysis.in_mesh_order(&axes));
    emit_single(builder, &psum, input, output_rep)
}

/// `pvary` requires every known input to be replicated over at least one of its axes, and removes those axes from
/// the replication of its output.
pub fn pvary_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let axes = collective_axes(op)?;
    for rep in input_reps {
        if let Replication::Axes(rep) = rep
            && rep.is_disjoint(&axes)
        {
            return Err(ReplicationError::NotReplicatedOver { op: op.name().to_string(), axes, input: rep.clone() });
        }
    }
    Ok(input_reps
        .iter()
        .map(|rep| Replication::Axes(analysis.resolve(rep).difference(&axes).cloned().collect()))
        .collect())
}

/// The index along some axes is replicated over every other manual axis.
pub fn axis_index_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    _: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let axes = collective_axes(op)?;
    Ok(vec![Replication::Axes(analysis.manual_axes().difference(&axes).cloned().collect())])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::axis_set;
    use crate::mesh::{AbstractMesh, MeshAxis};
    use crate::ops::{AllGatherOp, AxisIndexOp, PmaxOp, PsumOp, PvaryOp, SinOp};
    use crate::replication::RuleRegistry;
    use crate::types::{ArrayType, DataType, Shape};

    fn mesh() -> AbstractMesh {
        AbstractMesh::new(vec![MeshAxis::new("x", 2).unwrap(), MeshAxis::new("y", 2).unwrap()]).unwrap()
    }

    #[test]
    fn test_collective_checks() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::new();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let all_gather = AllGatherOp { axes: vec!["x".to_string()], dimension: 0, axis_size: 2 };
        let y = Replication::over(["y"]);

        assert_eq!(standard_collective_check(&analysis, &all_gather, &[y.clone()], 1).unwrap(), vec![y.clone()]);
        assert_eq!(
            reduction_collective_check(&analysis, &PmaxOp::new(["x"]), &[y.clone()], 1).unwrap(),
            vec![Replication::over(["x", "y"])],
        );
        assert_eq!(
            standard_collective_check(&analysis, &all_gather, &[Replication::Unconstrained], 1),
            Err(ReplicationError::UnconstrainedCollectiveInput { op: "all_gather".to_string() }),
        );
        assert_eq!(
            reduction_collective_check(&analysis, &PmaxOp::new(["x", "y"]), &[y.clone()], 1),
            Err(ReplicationError::ReplicatedCollectiveInput { op: "pmax".to_string(), axes: axis_set(["y"]) }),
        );
        assert!(matches!(
            standard_collective_check(&analysis, &SinOp, &[y], 1),
            Err(ReplicationError::UnexpectedOp { expected: "collective", .. }),
        ));
    }

    #[test]
    fn test_psum_and_pvary_checks() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::new();
        let analysis = Analysis::new(&mesh, &auto, &registry);

        assert_eq!(
            psum_invariant_check(&analysis, &PsumOp::new(["x"]), &[Replication::over(["y"])], 1).unwrap(),
            vec![Replication::over(["x", "y"])],
        );
        assert_eq!(
            psum_invariant_check(&analysis, &PsumOp::new(["x"]), &[Replication::Unconstrained], 1).unwrap(),
            vec![Replication::over(["x", "y"])],
        );
        assert!(psum_invariant_check(&analysis, &PsumOp::new(["x"]), &[Replication::over(["x"])], 1).is_err());

        assert_eq!(
            pvary_check(&analysis, &PvaryOp::new(["x"]), &[Replication::over(["x", "y"])], 1).unwrap(),
            vec![Replication::over(["y"])],
        );
        assert_eq!(
            pvary_check(&analysis, &PvaryOp::new(["x"]), &[Replication::Unconstrained], 1).unwrap(),
            vec![Replication::over(["y"])],
        );
        assert_eq!(
            pvary_check(&analysis, &PvaryOp::new(["x"]), &[Replication::over(["y"])], 1),
            Err(ReplicationError::NotReplicatedOver {
                op: "pvary".to_string(),
                axes: axis_set(["x"]),
                input: axis_set(["y"]),
            }),
        );

        assert_eq!(
            axis_index_check(&analysis, &AxisIndexOp::new(["y"]), &[], 1).unwrap(),
            vec![Replication::over(["x"])],
        );
    }

    #[test]
    fn test_collective_rewrites() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::new();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(ArrayType::new(DataType::Float32, Shape::of(&[4])));

        let all_gather = AllGatherOp { axes: vec!["x".to_string()], dimension: 0, axis_size: 2 };
        let (gathered, reps) =
            standard_collective_rewrite(&analysis, &mut builder, &all_gather, &[x.into()], &[axis_set(["x", "y"])])
                .unwrap();
        assert_eq!(reps, vec![axis_set(["y"])]);

        let (summed, reps) =
            psum_rewrite(&analysis, &mut builder, &PsumOp::new(["y"]), &gathered, &[axis_set(["y"])]).unwrap();
        assert_eq!(reps, vec![axis_set(["y"])]);
        assert_eq!(
            psum_rewrite(&analysis, &mut builder, &PsumOp::new(["y"]), &gathered, &[]),
            Err(ReplicationError::Graph(GraphError::InvalidInputCount {
                op: "psum[axes=(y)]".to_string(),
                expected: 1,
                got: 0,
            })),
        );

        let (maxed, reps) =
            reduction_collective_rewrite(&analysis, &mut builder, &PmaxOp::new(["x"]), &summed, &[AxisSet::new()])
                .unwrap();
        assert_eq!(reps, vec![axis_set(["x"])]);

        let graph = builder.build(vec![x], maxed).unwrap();
        let ops = graph.equations().iter().map(|equation| equation.op.to_string()).collect::<Vec<_>>();
        assert_eq!(
            ops,
            vec![
                "pvary[axes=(x)]",
                "all_gather[axes=(x), dimension=0]",
                "pvary[axes=(y)]",
                "psum_invariant[axes=(y)]",
                "pmax[axes=(x)]",
            ],
        );
    }
}
