//! Rules for operations that act independently on every device.

use crate::{
    axes::{AxisSet, Replication},
    graph::{Atom, GraphBuilder, Op},
    replication::{Analysis, ReplicationError, rewrite::insert_pvary},
};

/// Requires every input that is not [`Replication::Unconstrained`] to have the same replication, and returns it for
/// every output (or [`Replication::Unconstrained`] when all inputs are unconstrained).
pub fn standard_check(
    _: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    output_count: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let mut known = input_reps.iter().filter(|rep| matches!(rep, Replication::Axes(_)));
    let Some(first) = known.next() else {
        return Ok(vec![Replication::Unconstrained; output_count]);
    };
    if known.any(|rep| rep != first) {
        return Err(ReplicationError::MismatchedReplication { op: op.name().to_string(), reps: input_reps.to_vec() });
    }
    Ok(vec![first.clone(); output_count])
}

/// Emits `op` after inserting `pvary` on every input that is replicated over more axes than the intersection of all
/// input replications. Every output is replicated over that intersection (or over all manual axes when there are no
/// inputs).
pub fn standard_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let output_rep = match input_reps.split_first() {
        Some((first, rest)) => rest.iter().fold(first.clone(), |acc, rep| acc.intersection(rep).cloned().collect()),
        None => analysis.manual_axes(),
    };
    let inputs = inputs
        .iter()
        .zip(input_reps)
        .map(|(input, rep)| {
            let axes = rep.difference(&output_rep).cloned().collect::<AxisSet>();
            insert_pvary(analysis, builder, *input, &axes)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = builder.add_boxed_equation(dyn_clone::clone_box(op), inputs)?;
    let output_reps = vec![output_rep; outputs.len()];
    Ok((outputs.into_iter().map(Atom::from).collect(), output_reps))
}

/// `debug_callback` has no outputs.
pub fn debug_callback_check(
    _: &Analysis<'_>,
    _: &dyn Op,
    _: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    Ok(Vec::new())
}

/// Nothing is known about the results of host callbacks, so they are replicated over no axes.
pub fn callback_check(
    _: &Analysis<'_>,
    _: &dyn Op,
    _: &[Replication],
    output_count: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    Ok(vec![Replication::Axes(AxisSet::new()); output_count])
}

/// `device_put` passes the replication of every input through to the corresponding output.
pub fn device_put_check(
    _: &Analysis<'_>,
    _: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    Ok(input_reps.to_vec())
}

/// `tie` returns its first input.
pub fn tie_check(
    _: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    match input_reps.first() {
        Some(rep) => Ok(vec![rep.clone()]),
        None => Err(ReplicationError::Graph(crate::graph::GraphError::InvalidInputCount {
            op: op.to_string(),
            expected: 2,
            got: 0,
        })),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::axis_set;
    use crate::mesh::{AbstractMesh, MeshAxis};
    use crate::ops::{AddOp, PvaryOp};
    use crate::replication::RuleRegistry;
    use crate::types::{ArrayType, DataType, Shape};

    fn mesh() -> AbstractMesh {
        AbstractMesh::new(vec![MeshAxis::new("x", 2).unwrap(), MeshAxis::new("y", 2).unwrap()]).unwrap()
    }

    #[test]
    fn test_standard_check() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::new();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let x = Replication::over(["x"]);
        let reps = standard_check(&analysis, &AddOp, &[x.clone(), Replication::Unconstrained, x.clone()], 1).unwrap();
        assert_eq!(reps, vec![x.clone()]);
        let reps = standard_check(&analysis, &AddOp, &[Replication::Unconstrained], 2).unwrap();
        assert_eq!(reps, vec![Replication::Unconstrained; 2]);
        assert!(matches!(
            standard_check(&analysis, &AddOp, &[x, Replication::over(["x", "y"])], 1),
            Err(ReplicationError::MismatchedReplication { op, .. }) if op == "add",
        ));
    }

    #[test]
    fn test_standard_rewrite() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::new();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let mut builder = GraphBuilder::new();
        let tpe = ArrayType::new(DataType::Float32, Shape::of(&[4]));
        let lhs = builder.add_variable(tpe.clone());
        let rhs = builder.add_variable(tpe);
        let (outputs, reps) = standard_rewrite(
            &analysis,
            &mut builder,
            &AddOp,
            &[lhs.into(), rhs.into()],
            &[axis_set(["x", "y"]), axis_set(["x"])],
        )
        .unwrap();
        assert_eq!(reps, vec![axis_set(["x"])]);
        let graph = builder.build(vec![lhs, rhs], outputs).unwrap();
        assert_eq!(graph.equations().len(), 2);
        let pvary = graph.equations()[0].op.as_any().downcast_ref::<PvaryOp>().unwrap();
        assert_eq!(pvary.axes, vec!["y".to_string()]);
        assert_eq!(graph.equations()[0].inputs, vec![Atom::Variable(lhs)]);
        assert_eq!(graph.equations()[1].op.name(), "add");
    }
}
