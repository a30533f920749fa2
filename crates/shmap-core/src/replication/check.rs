use std::collections::HashMap;

use tracing::trace;

use crate::{
    axes::{AxisAssignment, AxisSet, Replication},
    graph::{Atom, AtomId, Graph, GraphError},
    replication::{Analysis, ReplicationError, RuleKind},
};

/// Computes the replication of every output of `graph` given the replication of its inputs.
///
/// Literals are [`Replication::Unconstrained`] and constants are replicated over every manual axis.
pub fn check_graph(
    analysis: &Analysis<'_>,
    graph: &Graph,
    input_reps: &[Replication],
) -> Result<Vec<Replication>, ReplicationError> {
    if input_reps.len() != graph.input_count() {
        return Err(GraphError::InvalidInputCount {
            op: "graph".to_string(),
            expected: graph.input_count(),
            got: input_reps.len(),
        }
        .into());
    }

    let mut environment = HashMap::<AtomId, Replication>::new();
    for (input, rep) in graph.inputs().iter().zip(input_reps) {
        environment.insert(input.id, rep.clone());
    }
    let manual_axes = Replication::Axes(analysis.manual_axes());
    for constant in graph.constants() {
        environment.insert(constant.id, manual_axes.clone());
    }

    let read = |environment: &HashMap<AtomId, Replication>, atom: &Atom| match atom {
        Atom::Variable(id) => environment.get(id).cloned().ok_or(ReplicationError::UnresolvedVariable { id: *id }),
        Atom::Literal(_) => Ok(Replication::Unconstrained),
    };

    for equation in graph.equations() {
        let op = equation.op.as_ref();
        let rule = analysis
            .registry()
            .check_rule(op.name())
            .ok_or_else(|| ReplicationError::MissingRule { op: op.name().to_string(), kind: RuleKind::Check })?;
        let reps = equation.inputs.iter().map(|input| read(&environment, input)).collect::<Result<Vec<_>, _>>()?;
        let output_reps = rule.check(analysis, op, reps.as_slice(), equation.outputs.len())?;
        if output_reps.len() != equation.outputs.len() {
            return Err(GraphError::InvalidOutputCount {
                op: op.to_string(),
                expected: equation.outputs.len(),
                got: output_reps.len(),
            }
            .into());
        }
        trace!(op = %op, output_reps = ?output_reps, "checked equation");
        for (output, rep) in equation.outputs.iter().zip(output_reps) {
            environment.insert(output.id, rep);
        }
    }

    graph.outputs().iter().map(|output| read(&environment, output)).collect()
}

/// Checks that the value returned as output `output` of a sharded region, whose inferred replication is `rep`, is
/// replicated over every manual mesh axis that its output assignment does not mention.
pub fn check_output_replication(
    analysis: &Analysis<'_>,
    output: usize,
    assignment: &AxisAssignment,
    rank: usize,
    rep: &Replication,
) -> Result<(), ReplicationError> {
    let Replication::Axes(inferred) = rep else {
        return Ok(());
    };
    let required = assignment
        .unmentioned(analysis.mesh())
        .into_iter()
        .filter(|axis| !analysis.auto().contains(axis))
        .collect::<AxisSet>();
    if required.is_subset(inferred) {
        return Ok(());
    }
    Err(ReplicationError::CannotProveOutputReplication {
        output,
        spec: assignment.to_spec(rank).to_string(),
        missing: required.difference(inferred).cloned().collect(),
        required,
        inferred: inferred.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
