use std::collections::HashMap;

use tracing::{debug, trace};

use crate::{
    axes::{AxisSet, format_axis_set},
    graph::{Atom, AtomId, Graph, GraphBuilder, GraphError},
    ops::{PsumInvariantOp, PvaryOp},
    replication::{Analysis, ReplicationError, RuleKind},
};

/// Emits a `pvary` over `axes` (in mesh order) applied to `atom`, or returns `atom` unchanged when `axes` is empty.
pub(crate) fn insert_pvary(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    atom: Atom,
    axes: &AxisSet,
) -> Result<Atom, ReplicationError> {
    if axes.is_empty() {
        return Ok(atom);
    }
    debug!(input = %atom, axes = %format_axis_set(axes), "inserting pvary");
    let outputs = builder.add_equation(PvaryOp::new(analysis.in_mesh_order(axes)), vec![atom])?;
    single_output(outputs, "pvary")
}

fn single_output(outputs: Vec<AtomId>, op: &str) -> Result<Atom, ReplicationError> {
    match outputs.as_slice() {
        [output] => Ok(Atom::Variable(*output)),
        _ => Err(GraphError::InvalidOutputCount { op: op.to_string(), expected: 1, got: outputs.len() }.into()),
    }
}

/// Converts `atom`, which is replicated over `src`, into a value replicated over exactly `dst`. Axes in `dst` but
/// not in `src` are reduced away with `psum_invariant`, and axes in `src` but not in `dst` are marked varying with
/// `pvary`.
pub fn match_replication(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    atom: Atom,
    src: &AxisSet,
    dst: &AxisSet,
) -> Result<Atom, ReplicationError> {
    let mut atom = atom;
    let reduced = dst.difference(src).cloned().collect::<AxisSet>();
    if !reduced.is_empty() {
        let outputs = builder.add_equation(PsumInvariantOp::new(analysis.in_mesh_order(&reduced)), vec![atom])?;
        atom = single_output(outputs, "psum_invariant")?;
    }
    insert_pvary(analysis, builder, atom, &src.difference(dst).cloned().collect())
}

/// Re-emits every equation of `graph` into `builder`, reading the graph inputs from `inputs` (replicated over
/// `input_reps`). Returns the rewritten outputs along with their replication.
pub fn rewrite_into(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    graph: &Graph,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    if inputs.len() != graph.input_count() || input_reps.len() != graph.input_count() {
        return Err(GraphError::InvalidInputCount {
            op: "graph".to_string(),
            expected: graph.input_count(),
            got: inputs.len().min(input_reps.len()),
        }
        .into());
    }

    let manual_axes = analysis.manual_axes();
    let mut environment = HashMap::<AtomId, (Atom, AxisSet)>::new();
    for ((variable, input), rep) in graph.inputs().iter().zip(inputs).zip(input_reps) {
        environment.insert(variable.id, (*input, rep.clone()));
    }
    for constant in graph.constants() {
        let id = builder.add_constant(constant.value.clone());
        environment.insert(constant.id, (Atom::Variable(id), manual_axes.clone()));
    }

    let read = |environment: &HashMap<AtomId, (Atom, AxisSet)>, atom: &Atom| match atom {
        Atom::Variable(id) => environment.get(id).cloned().ok_or(ReplicationError::UnresolvedVariable { id: *id }),
        Atom::Literal(_) => Ok((*atom, manual_axes.clone())),
    };

    for equation in graph.equations() {
        let op = equation.op.as_ref();
        let rule = analysis
            .registry()
            .rewrite_rule(op.name())
            .ok_or_else(|| ReplicationError::MissingRule { op: op.name().to_string(), kind: RuleKind::Rewrite })?;
        let (inputs, reps): (Vec<_>, Vec<_>) = equation
            .inputs
            .iter()
            .map(|input| read(&environment, input))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        let (outputs, output_reps) = rule.rewrite(analysis, builder, op, inputs.as_slice(), reps.as_slice())?;
        if outputs.len() != equation.outputs.len() || output_reps.len() != equation.outputs.len() {
            return Err(GraphError::InvalidOutputCount {
                op: op.to_string(),
                expected: equation.outputs.len(),
                got: outputs.len(),
            }
            .into());
        }
        trace!(op = %op, output_reps = ?output_reps, "rewrote equation");
        for ((variable, output), rep) in equation.outputs.iter().zip(outputs).zip(output_reps) {
            environment.insert(variable.id, (output, rep));
        }
    }

    let (outputs, output_reps) = graph
        .outputs()
        .iter()
        .map(|output| read(&environment, output))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .unzip();
    Ok((outputs, output_reps))
}

/// Starts a new graph with the same inputs as `graph`. The input types are marked as varying over every manual axis
/// that they are not replicated over.
pub(crate) fn fresh_inputs(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    graph: &Graph,
    input_reps: &[AxisSet],
) -> Result<Vec<AtomId>, ReplicationError> {
    if input_reps.len() != graph.input_count() {
        return Err(GraphError::InvalidInputCount {
            op: "graph".to_string(),
            expected: graph.input_count(),
            got: input_reps.len(),
        }
        .into());
    }
    let manual_axes = analysis.manual_axes();
    Ok(graph
        .inputs()
        .iter()
        .zip(input_reps)
        .map(|(input, rep)| {
            let varying_axes = manual_axes.difference(rep).cloned().collect();
            builder.add_variable(input.tpe.clone().with_varying_axes(varying_axes))
        })
        .collect())
}

/// Rewrites `graph` whose inputs are replicated over `input_reps`, returning the new graph along with the inferred
/// replication of its outputs.
pub fn rewrite_graph(
    analysis: &Analysis<'_>,
    graph: &Graph,
    input_reps: &[AxisSet],
) -> Result<(Graph, Vec<AxisSet>), ReplicationError> {
    let mut builder = GraphBuilder::new();
    let inputs = fresh_inputs(analysis, &mut builder, graph, input_reps)?;
    let atoms = inputs.iter().copied().map(Atom::from).collect::<Vec<_>>();
    let (outputs, output_reps) = rewrite_into(analysis, &mut builder, graph, atoms.as_slice(), input_reps)?;
    Ok((builder.build(inputs, outputs)?, output_reps))
}

/// Rewrites `graph` whose inputs are replicated over `input_reps` such that its outputs are replicated over exactly
/// `output_reps`. Each declared output replication must be a subset of the inferred one; the difference is marked
/// varying with `pvary`.
pub fn rewrite_graph_matching(
    analysis: &Analysis<'_>,
    graph: &Graph,
    input_reps: &[AxisSet],
    output_reps: &[AxisSet],
) -> Result<Graph, ReplicationError> {
    if output_reps.len() != graph.output_count() {
        return Err(GraphError::InvalidOutputCount {
            op: "graph".to_string(),
            expected: graph.output_count(),
            got: output_reps.len(),
        }
        .into());
    }
    let mut builder = GraphBuilder::new();
    let inputs = fresh_inputs(analysis, &mut builder, graph, input_reps)?;
    let atoms = inputs.iter().copied().map(Atom::from).collect::<Vec<_>>();
    let (outputs, inferred_reps) = rewrite_into(analysis, &mut builder, graph, atoms.as_slice(), input_reps)?;
    let outputs = outputs
        .into_iter()
        .zip(inferred_reps)
        .zip(output_reps)
        .enumerate()
        .map(|(index, ((output, inferred), declared))| {
            if !declared.is_subset(&inferred) {
                return Err(ReplicationError::RewriteMismatch {
                    output: index,
                    declared: declared.clone(),
                    inferred,
                });
            }
            insert_pvary(analysis, &mut builder, output, &inferred.difference(declared).cloned().collect())
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(builder.build(inputs, outputs)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
