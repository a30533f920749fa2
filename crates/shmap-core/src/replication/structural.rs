//! Rules for operations that own nested graphs.
//!
//! Checking recurses into the nested graphs. Rewriting rewrites the nested graphs and, for loops, first iterates the
//! replication of the loop carries to a fixpoint: a carry can only lose replication from one iteration to the next,
//! so the iteration stops after at most one round per carry (plus one round to confirm the result).

use tracing::trace;

use crate::{
    axes::{AxisSet, Replication},
    graph::{Atom, Graph, GraphBuilder, GraphError, Op},
    ops::{CallOp, CondOp, CustomJvpCallOp, CustomVjpCallOp, RematOp, ScanOp, WhileOp},
    replication::{
        Analysis, ReplicationError, check_graph, downcast,
        rewrite::{fresh_inputs, insert_pvary, match_replication, rewrite_graph, rewrite_graph_matching, rewrite_into},
    },
};

fn intersect(lhs: &[AxisSet], rhs: &[AxisSet]) -> Vec<AxisSet> {
    lhs.iter().zip(rhs).map(|(lhs, rhs)| lhs.intersection(rhs).cloned().collect()).collect()
}

fn all_equivalent(analysis: &Analysis<'_>, lhs: &[Replication], rhs: &[Replication]) -> bool {
    let manual_axes = analysis.manual_axes();
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(lhs, rhs)| lhs.equivalent(rhs, &manual_axes))
}

/// Marks every input as varying over the axes in its replication `src` that are missing from `dst`.
fn pvary_inputs(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    inputs: &[Atom],
    src: &[AxisSet],
    dst: &[AxisSet],
) -> Result<Vec<Atom>, ReplicationError> {
    inputs
        .iter()
        .zip(src.iter().zip(dst))
        .map(|(input, (src, dst))| insert_pvary(analysis, builder, *input, &src.difference(dst).cloned().collect()))
        .collect()
}

fn emit(
    builder: &mut GraphBuilder,
    op: Box<dyn Op>,
    inputs: Vec<Atom>,
    output_reps: Vec<AxisSet>,
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let outputs = builder.add_boxed_equation(op, inputs)?;
    if outputs.len() != output_reps.len() {
        return Err(GraphError::InvalidOutputCount {
            op: "nested graph".to_string(),
            expected: output_reps.len(),
            got: outputs.len(),
        }
        .into());
    }
    Ok((outputs.into_iter().map(Atom::from).collect(), output_reps))
}

fn split_inputs<'a, T>(op: &dyn Op, values: &'a [T], at: usize) -> Result<(&'a [T], &'a [T]), ReplicationError> {
    if values.len() < at {
        return Err(GraphError::InvalidInputCount { op: op.to_string(), expected: at, got: values.len() }.into());
    }
    Ok(values.split_at(at))
}

// ======================================================= CALL ======================================================

fn body<'o>(op: &'o dyn Op) -> Result<&'o Graph, ReplicationError> {
    op.sub_graphs()
        .first()
        .copied()
        .ok_or_else(|| ReplicationError::UnexpectedOp { op: op.to_string(), expected: "call" })
}

/// Checks `call`, `remat`, and `custom_jvp_call` by checking their body.
pub fn call_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    check_graph(analysis, body(op)?, input_reps)
}

/// Rewrites the body of `call`, `remat`, or `custom_jvp_call`, and re-emits the same kind of operation around it.
pub fn call_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let (body, output_reps) = rewrite_graph(analysis, body(op)?, input_reps)?;
    let any = op.as_any();
    let rewritten: Box<dyn Op> = if any.is::<CallOp>() {
        Box::new(CallOp::new(body))
    } else if any.is::<RematOp>() {
        Box::new(RematOp::new(body))
    } else if any.is::<CustomJvpCallOp>() {
        Box::new(CustomJvpCallOp::new(body))
    } else {
        return Err(ReplicationError::UnexpectedOp { op: op.to_string(), expected: "call" });
    };
    emit(builder, rewritten, inputs.to_vec(), output_reps)
}

// ================================================= CUSTOM VJP CALL =================================================

pub fn custom_vjp_call_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let op = downcast::<CustomVjpCallOp>(op, "custom_vjp_call")?;
    check_graph(analysis, &op.fun, input_reps)
}

/// Rewrites the primal function, and rewrites the backward function such that every cotangent it returns has the
/// replication of the corresponding primal input.
pub fn custom_vjp_call_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let vjp = downcast::<CustomVjpCallOp>(op, "custom_vjp_call")?;
    let (fun, output_reps) = rewrite_graph(analysis, &vjp.fun, input_reps)?;
    let (_, primal_reps) = split_inputs(op, input_reps, vjp.num_consts)?;

    let bwd_input_reps = primal_reps.iter().chain(output_reps.iter()).cloned().collect::<Vec<_>>();
    let mut bwd_builder = GraphBuilder::new();
    let bwd_inputs = fresh_inputs(analysis, &mut bwd_builder, &vjp.bwd, bwd_input_reps.as_slice())?;
    let bwd_atoms = bwd_inputs.iter().copied().map(Atom::from).collect::<Vec<_>>();
    let (cotangents, cotangent_reps) =
        rewrite_into(analysis, &mut bwd_builder, &vjp.bwd, bwd_atoms.as_slice(), bwd_input_reps.as_slice())?;
    if cotangents.len() != primal_reps.len() {
        return Err(GraphError::InvalidOutputCount {
            op: op.to_string(),
            expected: primal_reps.len(),
            got: cotangents.len(),
        }
        .into());
    }
    let cotangents = cotangents
        .into_iter()
        .zip(cotangent_reps.iter().zip(primal_reps))
        .map(|(cotangent, (src, dst))| match_replication(analysis, &mut bwd_builder, cotangent, src, dst))
        .collect::<Result<Vec<_>, _>>()?;
    let bwd = bwd_builder.build(bwd_inputs, cotangents)?;

    let rewritten = CustomVjpCallOp { fun, bwd, num_consts: vjp.num_consts };
    emit(builder, Box::new(rewritten), inputs.to_vec(), output_reps)
}

// ======================================================= COND ======================================================

/// Checks every branch against the operands (the branch index does not participate) and requires all branches to
/// agree.
pub fn cond_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let cond = downcast::<CondOp>(op, "cond")?;
    let (_, operand_reps) = split_inputs(op, input_reps, 1)?;
    let Some((first, rest)) = cond.branches.split_first() else {
        return Ok(Vec::new());
    };
    let expected = check_graph(analysis, first, operand_reps)?;
    for (index, branch) in rest.iter().enumerate() {
        let got = check_graph(analysis, branch, operand_reps)?;
        if !all_equivalent(analysis, expected.as_slice(), got.as_slice()) {
            return Err(ReplicationError::BranchMismatch { branch: index + 1, expected, got });
        }
    }
    Ok(expected)
}

/// Every output is replicated over the axes that every branch output and the branch index are replicated over.
pub fn cond_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let cond = downcast::<CondOp>(op, "cond")?;
    let [index_rep, operand_reps @ ..] = input_reps else {
        return Err(GraphError::InvalidInputCount { op: op.to_string(), expected: 1, got: 0 }.into());
    };
    let mut output_reps: Option<Vec<AxisSet>> = None;
    for branch in &cond.branches {
        let (_, branch_reps) = rewrite_graph(analysis, branch, operand_reps)?;
        output_reps = Some(match output_reps {
            Some(output_reps) => intersect(output_reps.as_slice(), branch_reps.as_slice()),
            None => branch_reps,
        });
    }
    let output_reps = output_reps
        .unwrap_or_default()
        .into_iter()
        .map(|rep| rep.intersection(index_rep).cloned().collect())
        .collect::<Vec<AxisSet>>();
    let branches = cond
        .branches
        .iter()
        .map(|branch| rewrite_graph_matching(analysis, branch, operand_reps, output_reps.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    emit(builder, Box::new(CondOp::new(branches)), inputs.to_vec(), output_reps)
}

// ======================================================= SCAN ======================================================

/// Checks the body and requires every carry to have the same replication before and after an iteration.
pub fn scan_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let scan = downcast::<ScanOp>(op, "scan")?;
    let (_, rest) = split_inputs(op, input_reps, scan.num_consts)?;
    let (carry_in, _) = split_inputs(op, rest, scan.num_carry)?;
    let output_reps = check_graph(analysis, &scan.body, input_reps)?;
    let carry_out = &output_reps[..scan.num_carry.min(output_reps.len())];
    if !all_equivalent(analysis, carry_in, carry_out) {
        return Err(ReplicationError::CarryMismatch {
            op: op.name().to_string(),
            carry_in: carry_in.to_vec(),
            carry_out: carry_out.to_vec(),
        });
    }
    Ok(output_reps)
}

/// Iterates the carry replication to a fixpoint, then marks the inputs as varying to match the fixpoint and rewrites
/// the body such that its carry outputs have exactly the fixpoint replication.
pub fn scan_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let scan = downcast::<ScanOp>(op, "scan")?;
    let (const_reps, rest) = split_inputs(op, input_reps, scan.num_consts)?;
    let (carry_reps, xs_reps) = split_inputs(op, rest, scan.num_carry)?;

    let rounds = 1 + scan.num_carry;
    let mut carry_in = carry_reps.to_vec();
    let mut fixpoint = None;
    for round in 0..rounds {
        let body_reps = const_reps.iter().chain(carry_in.iter()).chain(xs_reps).cloned().collect::<Vec<_>>();
        let (_, output_reps) = rewrite_graph(analysis, &scan.body, body_reps.as_slice())?;
        let (carry_out, ys_reps) = output_reps.split_at(scan.num_carry.min(output_reps.len()));
        let carry_out = intersect(carry_in.as_slice(), carry_out);
        trace!(op = "scan", round, carry_in = ?carry_in, carry_out = ?carry_out, "iterating carry replication");
        if carry_out == carry_in {
            fixpoint = Some((body_reps, carry_out, ys_reps.to_vec()));
            break;
        }
        carry_in = carry_out;
    }
    let Some((body_reps, carry_out, ys_reps)) = fixpoint else {
        return Err(ReplicationError::FixpointNotReached { op: op.name().to_string(), rounds });
    };

    let inputs = pvary_inputs(analysis, builder, inputs, input_reps, body_reps.as_slice())?;
    let output_reps = carry_out.into_iter().chain(ys_reps).collect::<Vec<_>>();
    let body = rewrite_graph_matching(analysis, &scan.body, body_reps.as_slice(), output_reps.as_slice())?;
    let rewritten = ScanOp { body, num_consts: scan.num_consts, num_carry: scan.num_carry, length: scan.length };
    emit(builder, Box::new(rewritten), inputs, output_reps)
}

// ======================================================= WHILE =====================================================

/// Checks the body against its constants and the carries, and requires every carry to have the same replication
/// before and after an iteration.
pub fn while_check(
    analysis: &Analysis<'_>,
    op: &dyn Op,
    input_reps: &[Replication],
    _: usize,
) -> Result<Vec<Replication>, ReplicationError> {
    let while_op = downcast::<WhileOp>(op, "while")?;
    let (_, body_inputs) = split_inputs(op, input_reps, while_op.cond_consts)?;
    let (_, carry_in) = split_inputs(op, body_inputs, while_op.body_consts)?;
    let carry_out = check_graph(analysis, &while_op.body, body_inputs)?;
    if !all_equivalent(analysis, carry_in, carry_out.as_slice()) {
        return Err(ReplicationError::CarryMismatch {
            op: op.name().to_string(),
            carry_in: carry_in.to_vec(),
            carry_out,
        });
    }
    Ok(carry_out)
}

/// Iterates the carry replication to a fixpoint, then rewrites the condition against it and the body to produce it.
pub fn while_rewrite(
    analysis: &Analysis<'_>,
    builder: &mut GraphBuilder,
    op: &dyn Op,
    inputs: &[Atom],
    input_reps: &[AxisSet],
) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
    let while_op = downcast::<WhileOp>(op, "while")?;
    let (cond_const_reps, rest) = split_inputs(op, input_reps, while_op.cond_consts)?;
    let (body_const_reps, carry_reps) = split_inputs(op, rest, while_op.body_consts)?;

    let rounds = 1 + carry_reps.len();
    let mut carry_in = carry_reps.to_vec();
    let mut fixpoint = false;
    for round in 0..rounds {
        let body_reps = body_const_reps.iter().chain(carry_in.iter()).cloned().collect::<Vec<_>>();
        let (_, carry_out) = rewrite_graph(analysis, &while_op.body, body_reps.as_slice())?;
        trace!(op = "while", round, carry_in = ?carry_in, carry_out = ?carry_out, "iterating carry replication");
        if carry_out == carry_in {
            fixpoint = true;
            break;
        }
        carry_in = intersect(carry_in.as_slice(), carry_out.as_slice());
    }
    if !fixpoint {
        return Err(ReplicationError::FixpointNotReached { op: op.name().to_string(), rounds });
    }

    let cond_reps = cond_const_reps.iter().chain(carry_in.iter()).cloned().collect::<Vec<_>>();
    let (cond, _) = rewrite_graph(analysis, &while_op.cond, cond_reps.as_slice())?;
    let body_reps = body_const_reps.iter().chain(carry_in.iter()).cloned().collect::<Vec<_>>();
    let body = rewrite_graph_matching(analysis, &while_op.body, body_reps.as_slice(), carry_in.as_slice())?;
    let input_dst = cond_const_reps.iter().chain(body_reps.iter()).cloned().collect::<Vec<_>>();
    let inputs = pvary_inputs(analysis, builder, inputs, input_reps, input_dst.as_slice())?;
    let rewritten = WhileOp { cond, body, cond_consts: while_op.cond_consts, body_consts: while_op.body_consts };
    emit(builder, Box::new(rewritten), inputs, carry_in)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::fmt::Display;
    use std::sync::Arc;

    use super::*;

    use crate::axes::axis_set;
    use crate::graph::{EvalContext, EvalError};
    use crate::mesh::{AbstractMesh, MeshAxis};
    use crate::ops::{AddOp, LtOp, MulOp, PsumOp, SinOp};
    use crate::replication::RuleRegistry;
    use crate::types::{ArrayType, DataType, Shape};
    use crate::values::HostArray;

    fn mesh() -> AbstractMesh {
        AbstractMesh::new(vec![
            MeshAxis::new("x", 2).unwrap(),
            MeshAxis::new("y", 2).unwrap(),
            MeshAxis::new("z", 2).unwrap(),
        ])
        .unwrap()
    }

    fn scalar() -> ArrayType {
        ArrayType::scalar(DataType::Float32)
    }

    fn op_names(graph: &Graph) -> Vec<String> {
        graph.equations().iter().map(|equation| equation.op.to_string()).collect()
    }

    /// Body `(c, x) -> (c * x, sin(x))`.
    fn multiply_body() -> Graph {
        let mut builder = GraphBuilder::new();
        let carry = builder.add_variable(scalar());
        let x = builder.add_variable(scalar());
        let product = builder.add_equation(MulOp, vec![carry.into(), x.into()]).unwrap()[0];
        let sine = builder.add_equation(SinOp, vec![x.into()]).unwrap()[0];
        builder.build(vec![carry, x], vec![product.into(), sine.into()]).unwrap()
    }

    #[test]
    fn test_call_rules() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::with_builtin_rules();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let op = RematOp::new(multiply_body());

        let reps = call_check(&analysis, &op, &[Replication::over(["x"]), Replication::over(["x"])], 2).unwrap();
        assert_eq!(reps, vec![Replication::over(["x"]), Replication::over(["x"])]);

        let mut builder = GraphBuilder::new();
        let c = builder.add_variable(scalar());
        let x = builder.add_variable(scalar());
        let (outputs, reps) =
            call_rewrite(&analysis, &mut builder, &op, &[c.into(), x.into()], &[axis_set(["x", "y"]), axis_set(["x"])])
                .unwrap();
        assert_eq!(reps, vec![axis_set(["x"]), axis_set(["x"])]);
        let graph = builder.build(vec![c, x], outputs).unwrap();
        let remat = graph.equations()[0].op.as_any().downcast_ref::<RematOp>().unwrap();
        assert_eq!(op_names(&remat.body), vec!["pvary[axes=(y)]", "mul", "sin"]);
    }

    #[test]
    fn test_scan_rules() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::with_builtin_rules();
        let analysis = Analysis::new(&mesh, &auto, &registry);
        let op = ScanOp { body: multiply_body(), num_consts: 0, num_carry: 1, length: 3 };

        assert_eq!(
            scan_check(&analysis, &op, &[Replication::over(["x"]), Replication::over(["x"])], 2).unwrap(),
            vec![Replication::over(["x"]), Replication::over(["x"])],
        );
        assert!(matches!(
            scan_check(&analysis, &op, &[Replication::over(["x", "y"]), Replication::over(["x"])], 2),
            Err(ReplicationError::MismatchedReplication { .. }),
        ));

        let mut builder = GraphBuilder::new();
        let c = builder.add_variable(scalar());
        let xs = builder.add_variable(ArrayType::new(DataType::Float32, Shape::of(&[3])));
        let (outputs, reps) = scan_rewrite(
            &analysis,
            &mut builder,
            &op,
            &[c.into(), xs.into()],
            &[axis_set(["x", "y"]), axis_set(["x", "z"])],
        )
        .unwrap();
        assert_eq!(reps, vec![axis_set(["x"]), axis_set(["x", "z"])]);
        let graph = builder.build(vec![c, xs], outputs).unwrap();
        assert_eq!(op_names(&graph), vec!["pvary[axes=(y)]", "scan[length=3, num_consts=0, num_carry=1]"]);
        let scan = graph.equations()[1].op.as_any().downcast_ref::<ScanOp>().unwrap();
        assert_eq!(op_names(&scan.body), vec!["pvary[axes=(z)]", "mul", "sin"]);
    }

    #[test]
    fn test_while_rules() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::with_builtin_rules();
        let analysis = Analysis::new(&mesh, &auto, &registry);

        // cond: (limit, i, acc) -> i < limit
        let mut builder = GraphBuilder::new();
        let limit = builder.add_variable(scalar());
        let i = builder.add_variable(scalar());
        let acc = builder.add_variable(scalar());
        let lt = builder.add_equation(LtOp, vec![i.into(), limit.into()]).unwrap()[0];
        let cond = builder.build(vec![limit, i, acc], vec![lt.into()]).unwrap();

        // body: (i, acc) -> (i + 1, acc + psum_x(i))
        let mut builder = GraphBuilder::new();
        let i = builder.add_variable(scalar());
        let acc = builder.add_variable(scalar());
        let next = builder.add_equation(AddOp, vec![i.into(), Atom::literal(1.0, DataType::Float32)]).unwrap()[0];
        let summed = builder.add_equation(PsumOp::new(["x"]), vec![i.into()]).unwrap()[0];
        let total = builder.add_equation(AddOp, vec![acc.into(), summed.into()]).unwrap()[0];
        let body = builder.build(vec![i, acc], vec![next.into(), total.into()]).unwrap();

        let op = WhileOp { cond, body, cond_consts: 1, body_consts: 0 };
        let all = Replication::over(["x", "y", "z"]);
        assert!(matches!(
            while_check(&analysis, &op, &[all.clone(), all.clone(), all.clone()], 2),
            Err(ReplicationError::ReplicatedCollectiveInput { .. }),
        ));
        assert_eq!(
            while_check(
                &analysis,
                &op,
                &[all.clone(), Replication::over(["y", "z"]), Replication::over(["x", "y", "z"])],
                2,
            )
            .unwrap(),
            vec![Replication::over(["y", "z"]), Replication::over(["x", "y", "z"])],
        );

        let mut builder = GraphBuilder::new();
        let limit = builder.add_variable(scalar());
        let i = builder.add_variable(scalar());
        let acc = builder.add_variable(scalar());
        let manual = axis_set(["x", "y", "z"]);
        let (outputs, reps) = while_rewrite(
            &analysis,
            &mut builder,
            &op,
            &[limit.into(), i.into(), acc.into()],
            &[manual.clone(), manual.clone(), manual.clone()],
        )
        .unwrap();
        assert_eq!(reps, vec![manual.clone(), manual]);
        let graph = builder.build(vec![limit, i, acc], outputs).unwrap();
        assert_eq!(op_names(&graph), vec!["while[cond_consts=1, body_consts=0]"]);
    }

    #[test]
    fn test_cond_rules() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::with_builtin_rules();
        let analysis = Analysis::new(&mesh, &auto, &registry);

        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar());
        let identity = builder.build(vec![x], vec![x.into()]).unwrap();
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar());
        let summed = builder.add_equation(PsumOp::new(["y"]), vec![x.into()]).unwrap()[0];
        let summing = builder.build(vec![x], vec![summed.into()]).unwrap();
        let op = CondOp::new(vec![identity, summing]);

        let index = Replication::over(["x", "y", "z"]);
        assert_eq!(
            cond_check(&analysis, &op, &[index.clone(), Replication::over(["x"])], 1),
            Err(ReplicationError::BranchMismatch {
                branch: 1,
                expected: vec![Replication::over(["x"])],
                got: vec![Replication::over(["x", "y"])],
            }),
        );

        let mut builder = GraphBuilder::new();
        let index = builder.add_variable(ArrayType::scalar(DataType::Int32));
        let x = builder.add_variable(scalar());
        let (outputs, reps) = cond_rewrite(
            &analysis,
            &mut builder,
            &op,
            &[index.into(), x.into()],
            &[axis_set(["x", "z"]), axis_set(["x", "z"])],
        )
        .unwrap();
        assert_eq!(reps, vec![axis_set(["x", "z"])]);
        let graph = builder.build(vec![index, x], outputs).unwrap();
        let cond = graph.equations()[0].op.as_any().downcast_ref::<CondOp>().unwrap();
        assert!(op_names(&cond.branches[0]).is_empty());
        assert_eq!(op_names(&cond.branches[1]), vec!["psum_invariant[axes=(y)]", "pvary[axes=(y)]"]);

        let mut builder = GraphBuilder::new();
        assert!(matches!(
            cond_rewrite(&analysis, &mut builder, &op, &[], &[]),
            Err(ReplicationError::Graph(GraphError::InvalidInputCount { expected: 1, got: 0, .. })),
        ));
    }

    #[test]
    fn test_custom_vjp_call_rewrite() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = RuleRegistry::with_builtin_rules();
        let analysis = Analysis::new(&mesh, &auto, &registry);

        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar());
        let y = builder.add_equation(SinOp, vec![x.into()]).unwrap()[0];
        let fun = builder.build(vec![x], vec![y.into()]).unwrap();

        // bwd: (x, ct) -> psum_y(ct)
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar());
        let ct = builder.add_variable(scalar());
        let summed = builder.add_equation(PsumOp::new(["y"]), vec![ct.into()]).unwrap()[0];
        let bwd = builder.build(vec![x, ct], vec![summed.into()]).unwrap();

        let op = CustomVjpCallOp { fun, bwd, num_consts: 0 };
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar());
        let (outputs, reps) =
            custom_vjp_call_rewrite(&analysis, &mut builder, &op, &[x.into()], &[axis_set(["x"])]).unwrap();
        assert_eq!(reps, vec![axis_set(["x"])]);
        let graph = builder.build(vec![x], outputs).unwrap();
        let vjp = graph.equations()[0].op.as_any().downcast_ref::<CustomVjpCallOp>().unwrap();
        assert_eq!(op_names(&vjp.bwd), vec!["psum_invariant[axes=(y)]", "pvary[axes=(y)]"]);
    }

    /// Identity whose rewrite rule drops the first axis (in mesh order) of its input replication.
    #[derive(Clone, Debug)]
    struct DropAxisOp;

    impl Display for DropAxisOp {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "drop_axis")
        }
    }

    impl Op for DropAxisOp {
        fn name(&self) -> &'static str {
            "drop_axis"
        }

        fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
            Ok(input_types.iter().map(|tpe| (*tpe).clone()).collect())
        }

        fn evaluate(&self, _: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
            Ok(inputs.iter().map(|values| values.to_vec()).collect())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn drop_first_axis(
        analysis: &Analysis<'_>,
        builder: &mut GraphBuilder,
        op: &dyn Op,
        inputs: &[Atom],
        input_reps: &[AxisSet],
    ) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
        let outputs = builder.add_boxed_equation(dyn_clone::clone_box(op), inputs.to_vec())?;
        let reps = input_reps
            .iter()
            .map(|rep| analysis.in_mesh_order(rep).into_iter().skip(1).collect::<AxisSet>())
            .collect::<Vec<_>>();
        Ok((outputs.into_iter().map(Atom::from).collect(), reps))
    }

    #[test]
    fn test_scan_fixpoint_not_reached() {
        let mesh = mesh();
        let auto = AxisSet::new();
        let registry = Arc::new(RuleRegistry::with_builtin_rules());
        registry.register_rewrite("drop_axis", drop_first_axis).unwrap();
        let analysis = Analysis::new(&mesh, &auto, &registry);

        let mut builder = GraphBuilder::new();
        let carry = builder.add_variable(scalar());
        let dropped = builder.add_equation(DropAxisOp, vec![carry.into()]).unwrap()[0];
        let body = builder.build(vec![carry], vec![dropped.into()]).unwrap();
        let op = ScanOp { body, num_consts: 0, num_carry: 1, length: 4 };

        let mut builder = GraphBuilder::new();
        let carry = builder.add_variable(scalar());
        let result = scan_rewrite(&analysis, &mut builder, &op, &[carry.into()], &[axis_set(["x", "y", "z"])]);
        assert_eq!(result, Err(ReplicationError::FixpointNotReached { op: "scan".to_string(), rounds: 2 }));
        assert!(result.unwrap_err().to_string().contains("internal error"));
    }
}
