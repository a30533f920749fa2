//! Structural operations that own sub-graphs.

use std::any::Any;
use std::fmt::Display;

use crate::{
    assert_input_count_matches,
    graph::{EvalContext, EvalError, Graph, GraphError, Op},
    types::{ArrayType, DataType, Shape, Size},
    values::HostArray,
};

fn check_graph_inputs(op: &dyn Op, graph: &Graph, input_types: &[&ArrayType]) -> Result<(), GraphError> {
    assert_input_count_matches!(op, input_types.len(), graph.input_count());
    for (input, tpe) in graph.inputs().iter().zip(input_types) {
        if !input.tpe.is_compatible_with(tpe) {
            return Err(GraphError::InvalidAtomType {
                id: input.id,
                expected: input.tpe.to_string(),
                got: tpe.to_string(),
            });
        }
    }
    Ok(())
}

fn evaluate_graph(
    graph: &Graph,
    context: &EvalContext<'_>,
    inputs: &[&[HostArray]],
) -> Result<Vec<Vec<HostArray>>, EvalError> {
    graph.evaluate(context, inputs.iter().map(|values| values.to_vec()).collect())
}

fn prune_graph(graph: &Graph, used_outputs: &[bool]) -> Result<(Graph, Vec<bool>), GraphError> {
    graph.dead_code_elimination(used_outputs)
}

macro_rules! call_op {
    ($(#[$attribute:meta])* $ty:ident, $name:literal) => {
        $(#[$attribute])*
        #[derive(Clone, Debug)]
        pub struct $ty {
            pub body: Graph,
        }

        impl $ty {
            pub fn new(body: Graph) -> Self {
                Self { body }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, $name)
            }
        }

        impl Op for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
                check_graph_inputs(self, &self.body, input_types)?;
                self.body.output_types()
            }

            fn evaluate(
                &self,
                context: &EvalContext<'_>,
                inputs: &[&[HostArray]],
            ) -> Result<Vec<Vec<HostArray>>, EvalError> {
                evaluate_graph(&self.body, context, inputs)
            }

            fn sub_graphs(&self) -> Vec<&Graph> {
                vec![&self.body]
            }

            fn prune(&self, used_outputs: &[bool]) -> Result<Option<(Box<dyn Op>, Vec<bool>)>, GraphError> {
                let (body, used_inputs) = prune_graph(&self.body, used_outputs)?;
                Ok(Some((Box::new(Self { body }), used_inputs)))
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

// ======================================================= CALL ======================================================

call_op!(
    /// Calls a nested graph.
    CallOp,
    "call"
);

// ======================================================= REMAT =====================================================

call_op!(
    /// Calls a nested graph whose intermediate values are recomputed rather than stored for differentiation.
    RematOp,
    "remat"
);

// ================================================= CUSTOM JVP CALL =================================================

call_op!(
    /// Calls a nested graph that has a user-defined forward-mode derivative. Only the primal body is represented here;
    /// the derivative rule is applied by the differentiation transform.
    CustomJvpCallOp,
    "custom_jvp_call"
);

// ================================================= CUSTOM VJP CALL =================================================

/// Calls `fun`, which has a user-defined reverse-mode derivative `bwd`.
///
/// The first `num_consts` inputs are closed-over constants. `bwd` takes the remaining (primal) inputs followed by
/// one cotangent per output of `fun`, and returns one cotangent per primal input.
#[derive(Clone, Debug)]
pub struct CustomVjpCallOp {
    pub fun: Graph,
    pub bwd: Graph,
    pub num_consts: usize,
}

impl Display for CustomVjpCallOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "custom_vjp_call[num_consts={}]", self.num_consts)
    }
}

impl Op for CustomVjpCallOp {
    fn name(&self) -> &'static str {
        "custom_vjp_call"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        check_graph_inputs(self, &self.fun, input_types)?;
        let primal_count = input_types.len().saturating_sub(self.num_consts);
        let expected = primal_count + self.fun.output_count();
        if self.bwd.input_count() != expected || self.bwd.output_count() != primal_count {
            return Err(GraphError::InvalidParameter {
                op: self.to_string(),
                message: format!(
                    "the backward graph must take {expected} input(s) and return {primal_count} output(s), but it \
                     takes {} and returns {}",
                    self.bwd.input_count(),
                    self.bwd.output_count(),
                ),
            });
        }
        self.fun.output_types()
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        evaluate_graph(&self.fun, context, inputs)
    }

    fn sub_graphs(&self) -> Vec<&Graph> {
        vec![&self.fun, &self.bwd]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ======================================================= COND ======================================================

/// Selects one of `branches` based on its first input, an integer or boolean scalar index. The remaining inputs are
/// passed to the selected branch. Out-of-range indices are clamped.
#[derive(Clone, Debug)]
pub struct CondOp {
    pub branches: Vec<Graph>,
}

impl CondOp {
    pub fn new(branches: Vec<Graph>) -> Self {
        Self { branches }
    }
}

impl Display for CondOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cond[branches={}]", self.branches.len())
    }
}

impl Op for CondOp {
    fn name(&self) -> &'static str {
        "cond"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        let Some((index_type, operand_types)) = input_types.split_first() else {
            return Err(GraphError::InvalidInputCount { op: self.to_string(), expected: 1, got: 0 });
        };
        if index_type.rank() != 0 || index_type.data_type.is_floating_point() {
            return Err(GraphError::InvalidParameter {
                op: self.to_string(),
                message: format!("the branch index must be an integer or boolean scalar, but got {index_type}"),
            });
        }
        let Some((first, rest)) = self.branches.split_first() else {
            return Err(GraphError::InvalidParameter { op: self.to_string(), message: "no branches".to_string() });
        };
        check_graph_inputs(self, first, operand_types)?;
        let mut output_types = first.output_types()?;
        for branch in rest {
            check_graph_inputs(self, branch, operand_types)?;
            let branch_types = branch.output_types()?;
            let compatible = branch_types.len() == output_types.len()
                && branch_types.iter().zip(output_types.iter()).all(|(lhs, rhs)| lhs.is_compatible_with(rhs));
            if !compatible {
                let types = branch_types.iter().map(|tpe| tpe.to_string()).collect::<Vec<_>>().join(", ");
                return Err(GraphError::IncompatibleTypes { op: self.to_string(), types });
            }
            for (output_type, branch_type) in output_types.iter_mut().zip(branch_types) {
                output_type.varying_axes.extend(branch_type.varying_axes);
            }
        }
        for output_type in output_types.iter_mut() {
            output_type.varying_axes.extend(index_type.varying_axes.iter().cloned());
        }
        Ok(output_types)
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        let Some((indices, operands)) = inputs.split_first() else {
            return Err(EvalError::InvalidInputCount { expected: 1, got: 0 });
        };
        let last = self.branches.len().saturating_sub(1);
        let selected = indices
            .iter()
            .map(|index| index.scalar_value().map(|value| (value.max(0.0) as usize).min(last)))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EvalError::Unsupported { message: "non-scalar branch index".to_string() })?;

        let mut branch_outputs = vec![None; self.branches.len()];
        for branch in selected.iter() {
            if branch_outputs[*branch].is_none() {
                branch_outputs[*branch] = Some(evaluate_graph(&self.branches[*branch], context, operands)?);
            }
        }

        let output_count = self.branches.first().map(Graph::output_count).unwrap_or_default();
        let mut outputs = vec![Vec::with_capacity(selected.len()); output_count];
        for (device, branch) in selected.iter().enumerate() {
            if let Some(values) = &branch_outputs[*branch] {
                for (output, values) in outputs.iter_mut().zip(values) {
                    output.push(values[device].clone());
                }
            }
        }
        Ok(outputs)
    }

    fn sub_graphs(&self) -> Vec<&Graph> {
        self.branches.iter().collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ======================================================= SCAN ======================================================

/// Loops `body` over the leading dimension of the scanned inputs.
///
/// Inputs are `num_consts` constants, `num_carry` loop carries, and the scanned inputs, whose leading dimension must
/// be `length`. `body` takes the constants, the carries, and one slice of every scanned input, and returns the new
/// carries followed by one slice of every stacked output. The op returns the final carries followed by the stacked
/// outputs.
#[derive(Clone, Debug)]
pub struct ScanOp {
    pub body: Graph,
    pub num_consts: usize,
    pub num_carry: usize,
    pub length: usize,
}

impl Display for ScanOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scan[length={}, num_consts={}, num_carry={}]", self.length, self.num_consts, self.num_carry)
    }
}

impl ScanOp {
    fn slice(&self, value: &HostArray, step: usize) -> Result<HostArray, EvalError> {
        let block = value.block(0, step, self.length)?;
        Ok(block.reshape(value.shape()[1..].to_vec())?)
    }

    fn stack(&self, slices: Vec<HostArray>, tpe: &ArrayType) -> Result<HostArray, EvalError> {
        if slices.is_empty() {
            let mut shape = vec![0];
            shape.extend(tpe.shape.static_dimensions().ok_or_else(|| EvalError::Unsupported {
                message: format!("stacking values of dynamically shaped type {tpe}"),
            })?);
            return Ok(HostArray::zeros(tpe.data_type, shape));
        }
        let slices = slices
            .into_iter()
            .map(|slice| {
                let mut shape = vec![1];
                shape.extend_from_slice(slice.shape());
                slice.reshape(shape)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HostArray::concatenate(slices.as_slice(), 0)?)
    }
}

impl Op for ScanOp {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        let fixed = self.num_consts + self.num_carry;
        if input_types.len() < fixed {
            return Err(GraphError::InvalidInputCount { op: self.to_string(), expected: fixed, got: input_types.len() });
        }
        let mut body_input_types = input_types[..fixed].iter().map(|tpe| (*tpe).clone()).collect::<Vec<_>>();
        for tpe in &input_types[fixed..] {
            match tpe.shape.dimensions.split_first() {
                Some((Size::Static(length), rest)) if *length == self.length => {
                    body_input_types.push(tpe.with_shape(Shape::new(rest.to_vec())))
                }
                _ => {
                    return Err(GraphError::InvalidParameter {
                        op: self.to_string(),
                        message: format!("scanned input of type {tpe} does not have leading dimension {}", self.length),
                    });
                }
            }
        }
        check_graph_inputs(self, &self.body, body_input_types.iter().collect::<Vec<_>>().as_slice())?;

        let body_output_types = self.body.output_types()?;
        if body_output_types.len() < self.num_carry {
            return Err(GraphError::InvalidOutputCount {
                op: self.to_string(),
                expected: self.num_carry,
                got: body_output_types.len(),
            });
        }
        for (carry_in, carry_out) in input_types[self.num_consts..fixed].iter().zip(&body_output_types) {
            if !carry_in.is_compatible_with(carry_out) {
                return Err(GraphError::IncompatibleTypes {
                    op: self.to_string(),
                    types: format!("carry {carry_in} becomes {carry_out}"),
                });
            }
        }
        let mut output_types = body_output_types[..self.num_carry].to_vec();
        for tpe in &body_output_types[self.num_carry..] {
            let mut dimensions = vec![Size::Static(self.length)];
            dimensions.extend(tpe.shape.dimensions.iter().copied());
            output_types.push(tpe.with_shape(Shape::new(dimensions)));
        }
        Ok(output_types)
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        let fixed = self.num_consts + self.num_carry;
        if inputs.len() < fixed {
            return Err(EvalError::InvalidInputCount { expected: fixed, got: inputs.len() });
        }
        let consts = inputs[..self.num_consts].iter().map(|values| values.to_vec()).collect::<Vec<_>>();
        let mut carry = inputs[self.num_consts..fixed].iter().map(|values| values.to_vec()).collect::<Vec<_>>();
        let output_types = self.body.output_types()?;
        let stacked_count = output_types.len().saturating_sub(self.num_carry);
        let mut ys = vec![vec![Vec::with_capacity(self.length); context.device_count()]; stacked_count];

        for step in 0..self.length {
            let xs = inputs[fixed..]
                .iter()
                .map(|values| values.iter().map(|value| self.slice(value, step)).collect::<Result<Vec<_>, _>>())
                .collect::<Result<Vec<_>, _>>()?;
            let body_inputs = consts.iter().cloned().chain(carry.drain(..)).chain(xs).collect();
            let mut outputs = self.body.evaluate(context, body_inputs)?;
            let slices = outputs.split_off(self.num_carry);
            carry = outputs;
            for (stacked, slice) in ys.iter_mut().zip(slices) {
                for (device, value) in slice.into_iter().enumerate() {
                    stacked[device].push(value);
                }
            }
        }

        let mut outputs = carry;
        for (stacked, tpe) in ys.into_iter().zip(&output_types[self.num_carry..]) {
            outputs.push(stacked.into_iter().map(|slices| self.stack(slices, tpe)).collect::<Result<Vec<_>, _>>()?);
        }
        Ok(outputs)
    }

    fn sub_graphs(&self) -> Vec<&Graph> {
        vec![&self.body]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ======================================================= WHILE =====================================================

/// Applies `body` to the loop carries while `cond` returns `true`.
///
/// Inputs are `cond_consts` constants for `cond`, `body_consts` constants for `body`, and the loop carries. `cond`
/// takes its constants followed by the carries and returns a boolean scalar. `body` takes its constants followed by
/// the carries and returns the new carries. Devices whose condition becomes `false` keep their carries while the
/// other devices continue.
#[derive(Clone, Debug)]
pub struct WhileOp {
    pub cond: Graph,
    pub body: Graph,
    pub cond_consts: usize,
    pub body_consts: usize,
}

impl Display for WhileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "while[cond_consts={}, body_consts={}]", self.cond_consts, self.body_consts)
    }
}

impl Op for WhileOp {
    fn name(&self) -> &'static str {
        "while"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        let consts = self.cond_consts + self.body_consts;
        if input_types.len() < consts {
            let got = input_types.len();
            return Err(GraphError::InvalidInputCount { op: self.to_string(), expected: consts, got });
        }
        let carry_types = &input_types[consts..];
        let cond_input_types = input_types[..self.cond_consts].iter().chain(carry_types).copied().collect::<Vec<_>>();
        check_graph_inputs(self, &self.cond, cond_input_types.as_slice())?;
        let body_input_types = input_types[self.cond_consts..].to_vec();
        check_graph_inputs(self, &self.body, body_input_types.as_slice())?;

        match self.cond.output_types()?.as_slice() {
            [predicate] if predicate.rank() == 0 && predicate.data_type == DataType::Boolean => {}
            types => {
                let types = types.iter().map(|tpe| tpe.to_string()).collect::<Vec<_>>().join(", ");
                return Err(GraphError::InvalidParameter {
                    op: self.to_string(),
                    message: format!("the condition must return a single boolean scalar, but returns ({types})"),
                });
            }
        }
        let output_types = self.body.output_types()?;
        let compatible = output_types.len() == carry_types.len()
            && output_types.iter().zip(carry_types).all(|(lhs, rhs)| lhs.is_compatible_with(rhs));
        if !compatible {
            let types = output_types.iter().map(|tpe| tpe.to_string()).collect::<Vec<_>>().join(", ");
            return Err(GraphError::IncompatibleTypes { op: self.to_string(), types });
        }
        Ok(output_types)
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        let consts = self.cond_consts + self.body_consts;
        if inputs.len() < consts {
            return Err(EvalError::InvalidInputCount { expected: consts, got: inputs.len() });
        }
        let cond_consts = inputs[..self.cond_consts].iter().map(|values| values.to_vec()).collect::<Vec<_>>();
        let body_consts = inputs[self.cond_consts..consts].iter().map(|values| values.to_vec()).collect::<Vec<_>>();
        let mut carry = inputs[consts..].iter().map(|values| values.to_vec()).collect::<Vec<_>>();
        loop {
            let cond_inputs = cond_consts.iter().chain(carry.iter()).cloned().collect();
            let predicates = self.cond.evaluate(context, cond_inputs)?;
            let active = predicates
                .first()
                .map(|values| values.iter().map(|value| value.scalar_value().is_some_and(|v| v != 0.0)).collect())
                .unwrap_or_else(|| vec![false; context.device_count()]);
            if !active.iter().any(|active| *active) {
                return Ok(carry);
            }
            let body_inputs = body_consts.iter().chain(carry.iter()).cloned().collect();
            let updated = self.body.evaluate(context, body_inputs)?;
            for (values, updated) in carry.iter_mut().zip(updated) {
                for (device, value) in updated.into_iter().enumerate() {
                    if active[device] {
                        values[device] = value;
                    }
                }
            }
        }
    }

    fn sub_graphs(&self) -> Vec<&Graph> {
        vec![&self.cond, &self.body]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::graph::{Atom, GraphBuilder};
    use crate::ops::{AddOp, DebugCallbackOp, LtOp, MulOp, NegOp};

    fn scalar(data_type: DataType) -> ArrayType {
        ArrayType::scalar(data_type)
    }

    fn unary_graph<O: Op>(op: O) -> Graph {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar(DataType::Float32));
        let y = builder.add_equation(op, vec![x.into()]).unwrap()[0];
        builder.build(vec![x], vec![y.into()]).unwrap()
    }

    fn identity_graph() -> Graph {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar(DataType::Float32));
        builder.build(vec![x], vec![x.into()]).unwrap()
    }

    #[test]
    fn test_call_evaluate_and_prune() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar(DataType::Float32));
        let y = builder.add_variable(scalar(DataType::Float32));
        let n = builder.add_equation(NegOp, vec![x.into()]).unwrap()[0];
        let body = builder.build(vec![x, y], vec![n.into(), y.into()]).unwrap();

        let op = CallOp::new(body);
        let tpe = scalar(DataType::Float32);
        assert_eq!(op.infer_output_types(&[&tpe, &tpe]).unwrap().len(), 2);
        assert!(matches!(op.infer_output_types(&[&tpe]), Err(GraphError::InvalidInputCount { .. })));

        let context = EvalContext::host();
        let x = HostArray::scalar(DataType::Float32, 2.0);
        let y = HostArray::scalar(DataType::Float32, 3.0);
        let outputs = op.evaluate(&context, &[std::slice::from_ref(&x), std::slice::from_ref(&y)]).unwrap();
        assert_eq!(outputs[0][0].scalar_value(), Some(-2.0));
        assert_eq!(outputs[1][0].scalar_value(), Some(3.0));

        let (pruned, used_inputs) = op.prune(&[false, true]).unwrap().unwrap();
        assert_eq!(used_inputs, vec![false, true]);
        assert_eq!(pruned.sub_graphs()[0].equations().len(), 0);
    }

    #[test]
    fn test_cond() {
        let op = CondOp::new(vec![unary_graph(NegOp), identity_graph()]);
        let index = scalar(DataType::Int32);
        let operand = scalar(DataType::Float32);
        assert_eq!(op.infer_output_types(&[&index, &operand]).unwrap(), vec![operand.clone()]);
        assert!(op.infer_output_types(&[&operand, &operand]).is_err());

        let context = EvalContext::host();
        let x = HostArray::scalar(DataType::Float32, 5.0);
        for (index, expected) in [(0.0, -5.0), (1.0, 5.0), (7.0, 5.0)] {
            let index = HostArray::scalar(DataType::Int32, index);
            let outputs = op.evaluate(&context, &[std::slice::from_ref(&index), std::slice::from_ref(&x)]).unwrap();
            assert_eq!(outputs[0][0].scalar_value(), Some(expected));
        }
    }

    #[test]
    fn test_cond_with_effects() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(scalar(DataType::Float32));
        builder.add_equation(DebugCallbackOp::new("branch"), vec![x.into()]).unwrap();
        let branch = builder.build(vec![x], vec![x.into()]).unwrap();
        let op = CondOp::new(vec![branch, identity_graph()]);
        assert!(op.has_effects());
        assert!(!CondOp::new(vec![identity_graph()]).has_effects());
    }

    #[test]
    fn test_scan() {
        // carry = carry + x; y = carry * x
        let mut builder = GraphBuilder::new();
        let carry = builder.add_variable(scalar(DataType::Float32));
        let x = builder.add_variable(scalar(DataType::Float32));
        let next = builder.add_equation(AddOp, vec![carry.into(), x.into()]).unwrap()[0];
        let y = builder.add_equation(MulOp, vec![next.into(), x.into()]).unwrap()[0];
        let body = builder.build(vec![carry, x], vec![next.into(), y.into()]).unwrap();
        let op = ScanOp { body, num_consts: 0, num_carry: 1, length: 3 };

        let xs_type = ArrayType::new(DataType::Float32, Shape::of(&[3]));
        let output_types = op.infer_output_types(&[&scalar(DataType::Float32), &xs_type]).unwrap();
        assert_eq!(output_types, vec![scalar(DataType::Float32), xs_type.clone()]);
        let bad_type = ArrayType::new(DataType::Float32, Shape::of(&[4]));
        assert!(op.infer_output_types(&[&scalar(DataType::Float32), &bad_type]).is_err());

        let context = EvalContext::host();
        let init = HostArray::scalar(DataType::Float32, 0.0);
        let xs = HostArray::new(DataType::Float32, vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let outputs = op.evaluate(&context, &[std::slice::from_ref(&init), std::slice::from_ref(&xs)]).unwrap();
        assert_eq!(outputs[0][0].scalar_value(), Some(6.0));
        assert_eq!(outputs[1][0].data(), &[1.0, 6.0, 18.0]);
    }

    #[test]
    fn test_while() {
        // while carry < limit: carry = carry + 1
        let mut builder = GraphBuilder::new();
        let limit = builder.add_variable(scalar(DataType::Float32));
        let carry = builder.add_variable(scalar(DataType::Float32));
        let predicate = builder.add_equation(LtOp, vec![carry.into(), limit.into()]).unwrap()[0];
        let cond = builder.build(vec![limit, carry], vec![predicate.into()]).unwrap();

        let mut builder = GraphBuilder::new();
        let carry = builder.add_variable(scalar(DataType::Float32));
        let one = Atom::literal(1.0, DataType::Float32);
        let next = builder.add_equation(AddOp, vec![carry.into(), one]).unwrap()[0];
        let body = builder.build(vec![carry], vec![next.into()]).unwrap();

        let op = WhileOp { cond, body, cond_consts: 1, body_consts: 0 };
        let tpe = scalar(DataType::Float32);
        assert_eq!(op.infer_output_types(&[&tpe, &tpe]).unwrap(), vec![tpe.clone()]);

        let context = EvalContext::host();
        let limit = HostArray::scalar(DataType::Float32, 4.5);
        let init = HostArray::scalar(DataType::Float32, 1.0);
        let outputs = op.evaluate(&context, &[std::slice::from_ref(&limit), std::slice::from_ref(&init)]).unwrap();
        assert_eq!(outputs[0][0].scalar_value(), Some(5.0));

        let invalid = WhileOp { cond: identity_graph(), body: identity_graph(), cond_consts: 0, body_consts: 0 };
        assert!(matches!(invalid.infer_output_types(&[&tpe]), Err(GraphError::InvalidParameter { .. })));
    }
}
