use std::any::Any;
use std::fmt::Display;

use crate::{
    assert_input_count_matches,
    axes::AxisSet,
    graph::{EvalContext, EvalError, GraphError, NumericFault, Op},
    types::{ArrayType, DataType, Shape},
    values::HostArray,
};

fn incompatible_types(op: &dyn Op, input_types: &[&ArrayType]) -> GraphError {
    let types = input_types.iter().map(|tpe| tpe.to_string()).collect::<Vec<_>>().join(", ");
    GraphError::IncompatibleTypes { op: op.name().to_string(), types }
}

fn unary_type(op: &dyn Op, input_types: &[&ArrayType], floating_only: bool) -> Result<Vec<ArrayType>, GraphError> {
    assert_input_count_matches!(op, input_types.len(), 1);
    if floating_only && !input_types[0].data_type.is_floating_point() {
        return Err(incompatible_types(op, input_types));
    }
    Ok(vec![input_types[0].clone()])
}

fn binary_type(
    op: &dyn Op,
    input_types: &[&ArrayType],
    output_data_type: Option<DataType>,
) -> Result<Vec<ArrayType>, GraphError> {
    assert_input_count_matches!(op, input_types.len(), 2);
    let (lhs, rhs) = (input_types[0], input_types[1]);
    if lhs.data_type != rhs.data_type {
        return Err(incompatible_types(op, input_types));
    }
    let shape = Shape::broadcast(&[&lhs.shape, &rhs.shape]).ok_or_else(|| incompatible_types(op, input_types))?;
    let varying_axes = lhs.varying_axes.union(&rhs.varying_axes).cloned().collect::<AxisSet>();
    let data_type = output_data_type.unwrap_or(lhs.data_type);
    Ok(vec![ArrayType::new(data_type, shape).with_varying_axes(varying_axes)])
}

fn evaluate_unary<F>(inputs: &[&[HostArray]], f: F) -> Result<Vec<Vec<HostArray>>, EvalError>
where
    F: Fn(&HostArray) -> Result<HostArray, EvalError>,
{
    Ok(vec![inputs[0].iter().map(f).collect::<Result<Vec<_>, _>>()?])
}

fn evaluate_binary<F>(inputs: &[&[HostArray]], f: F) -> Result<Vec<Vec<HostArray>>, EvalError>
where
    F: Fn(&HostArray, &HostArray) -> Result<HostArray, EvalError>,
{
    let outputs = inputs[0].iter().zip(inputs[1].iter()).map(|(lhs, rhs)| f(lhs, rhs));
    Ok(vec![outputs.collect::<Result<Vec<_>, _>>()?])
}

macro_rules! unary_op {
    ($(#[$attribute:meta])* $ty:ident, $name:literal, floating_only = $floating_only:expr, $f:expr) => {
        $(#[$attribute])*
        #[derive(Copy, Clone, Debug, Default)]
        pub struct $ty;

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
                unary_type(self, input_types, $floating_only)
            }

            fn evaluate(
                &self,
                _: &EvalContext<'_>,
                inputs: &[&[HostArray]],
            ) -> Result<Vec<Vec<HostArray>>, EvalError> {
                assert_input_count_matches!(self, inputs.len(), 1);
                evaluate_unary(inputs, |x| Ok(x.map(x.data_type(), $f)))
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

macro_rules! binary_op {
    ($(#[$attribute:meta])* $ty:ident, $name:literal, output = $output:expr, $f:expr) => {
        $(#[$attribute])*
        #[derive(Copy, Clone, Debug, Default)]
        pub struct $ty;

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
                binary_type(self, input_types, $output)
            }

            fn evaluate(
                &self,
                _: &EvalContext<'_>,
                inputs: &[&[HostArray]],
            ) -> Result<Vec<Vec<HostArray>>, EvalError> {
                assert_input_count_matches!(self, inputs.len(), 2);
                let output: Option<DataType> = $output;
                evaluate_binary(inputs, |lhs, rhs| Ok(lhs.zip_with(rhs, output.unwrap_or(lhs.data_type()), $f)?))
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

// ======================================================= NEG =======================================================

unary_op!(NegOp, "neg", floating_only = false, |x| -x);

// ===================================================== SIN/COS =====================================================

unary_op!(SinOp, "sin", floating_only = true, f64::sin);
unary_op!(CosOp, "cos", floating_only = true, f64::cos);

// ===================================================== EXP/LOG =====================================================

unary_op!(ExpOp, "exp", floating_only = true, f64::exp);

unary_op!(
    /// Natural logarithm. Non-positive inputs produce NaN or negative infinity rather than an error; evaluation with
    /// NaN/Inf checks enabled reports them as numeric faults.
    LogOp,
    "log",
    floating_only = true,
    f64::ln
);

// ==================================================== ADD/SUB/MUL ==================================================

binary_op!(AddOp, "add", output = None, |lhs, rhs| lhs + rhs);
binary_op!(SubOp, "sub", output = None, |lhs, rhs| lhs - rhs);
binary_op!(MulOp, "mul", output = None, |lhs, rhs| lhs * rhs);

// ===================================================== MAX/MIN =====================================================

binary_op!(MaxOp, "max", output = None, f64::max);
binary_op!(MinOp, "min", output = None, f64::min);

// ======================================================= LT ========================================================

binary_op!(LtOp, "lt", output = Some(DataType::Boolean), |lhs, rhs| if lhs < rhs { 1.0 } else { 0.0 });

// ======================================================= DIV =======================================================

/// Elementwise division. Integer division truncates toward zero and fails with a numeric fault when dividing by
/// zero. Floating-point division follows IEEE 754.
#[derive(Copy, Clone, Debug, Default)]
pub struct DivOp;

impl Display for DivOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "div")
    }
}

impl Op for DivOp {
    fn name(&self) -> &'static str {
        "div"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        binary_type(self, input_types, None)
    }

    fn evaluate(&self, _: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 2);
        evaluate_binary(inputs, |lhs, rhs| {
            if !lhs.data_type().is_floating_point() && rhs.data().contains(&0.0) {
                return Err(EvalError::NumericFault { op: self.name().to_string(), kind: NumericFault::DivisionByZero });
            }
            Ok(lhs.zip_with(rhs, lhs.data_type(), |lhs, rhs| lhs / rhs)?)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =================================================== REDUCE SUM ====================================================

/// Sums over `axes`, removing them from the shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReduceSumOp {
    pub axes: Vec<usize>,
}

impl ReduceSumOp {
    pub fn new(axes: Vec<usize>) -> Self {
        Self { axes }
    }
}

impl Display for ReduceSumOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axes = self.axes.iter().map(|axis| axis.to_string()).collect::<Vec<_>>();
        write!(f, "reduce_sum[axes=({})]", axes.join(", "))
    }
}

impl Op for ReduceSumOp {
    fn name(&self) -> &'static str {
        "reduce_sum"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let input_type = input_types[0];
        for (index, axis) in self.axes.iter().enumerate() {
            if *axis >= input_type.rank() || self.axes[..index].contains(axis) {
                return Err(GraphError::InvalidParameter {
                    op: self.to_string(),
                    message: format!("invalid reduction axis {axis} for a value of type {input_type}"),
                });
            }
        }
        let dimensions = input_type
            .shape
            .dimensions
            .iter()
            .enumerate()
            .filter_map(|(axis, size)| (!self.axes.contains(&axis)).then_some(*size))
            .collect();
        Ok(vec![input_type.with_shape(Shape::new(dimensions))])
    }

    fn evaluate(&self, _: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        evaluate_unary(inputs, |x| Ok(x.reduce_sum(self.axes.as_slice())?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===================================================== RESHAPE =====================================================

/// Reinterprets the elements of a statically shaped value with a new shape of the same element count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReshapeOp {
    pub shape: Vec<usize>,
}

impl ReshapeOp {
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape }
    }
}

impl Display for ReshapeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self.shape.iter().map(|size| size.to_string()).collect::<Vec<_>>();
        write!(f, "reshape[shape=({})]", shape.join(", "))
    }
}

impl Op for ReshapeOp {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let input_type = input_types[0];
        let element_count = input_type.shape.static_dimensions().map(|dimensions| dimensions.iter().product::<usize>());
        if element_count != Some(self.shape.iter().product::<usize>()) {
            return Err(GraphError::InvalidParameter {
                op: self.to_string(),
                message: format!("cannot reshape a value of type {input_type}"),
            });
        }
        Ok(vec![input_type.with_shape(Shape::of(self.shape.as_slice()))])
    }

    fn evaluate(&self, _: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        evaluate_unary(inputs, |x| Ok(x.reshape(self.shape.clone())?))
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

    use crate::axes::axis_set;

    fn f32_type(dimensions: &[usize]) -> ArrayType {
        ArrayType::new(DataType::Float32, Shape::of(dimensions))
    }

    fn values(data_type: DataType, shape: Vec<usize>, data: Vec<f64>) -> HostArray {
        HostArray::new(data_type, shape, data).unwrap()
    }

    #[test]
    fn test_binary_type_inference() {
        let lhs = f32_type(&[2, 3]).with_varying_axes(axis_set(["x"]));
        let rhs = f32_type(&[3]).with_varying_axes(axis_set(["y"]));
        let output = AddOp.infer_output_types(&[&lhs, &rhs]).unwrap();
        assert_eq!(output, vec![f32_type(&[2, 3]).with_varying_axes(axis_set(["x", "y"]))]);
        assert_eq!(LtOp.infer_output_types(&[&lhs, &rhs]).unwrap()[0].data_type, DataType::Boolean);
        assert!(matches!(
            AddOp.infer_output_types(&[&lhs, &ArrayType::scalar(DataType::Int32)]),
            Err(GraphError::IncompatibleTypes { op, .. }) if op == "add",
        ));
        assert!(matches!(
            MulOp.infer_output_types(&[&lhs]),
            Err(GraphError::InvalidInputCount { expected: 2, got: 1, .. }),
        ));
    }

    #[test]
    fn test_unary_type_inference() {
        let integer = ArrayType::new(DataType::Int32, Shape::of(&[4]));
        assert_eq!(NegOp.infer_output_types(&[&integer]).unwrap(), vec![integer.clone()]);
        assert!(matches!(SinOp.infer_output_types(&[&integer]), Err(GraphError::IncompatibleTypes { .. })));
    }

    #[test]
    fn test_evaluate_elementwise() {
        let context = EvalContext::host();
        let x = values(DataType::Float32, vec![3], vec![1.0, -2.0, 4.0]);
        let y = values(DataType::Float32, vec![], vec![2.0]);
        let inputs = [std::slice::from_ref(&x), std::slice::from_ref(&y)];
        assert_eq!(AddOp.evaluate(&context, &inputs).unwrap()[0][0].data(), &[3.0, 0.0, 6.0]);
        assert_eq!(MaxOp.evaluate(&context, &inputs).unwrap()[0][0].data(), &[2.0, 2.0, 4.0]);
        assert_eq!(DivOp.evaluate(&context, &inputs).unwrap()[0][0].data(), &[0.5, -1.0, 2.0]);
        assert_eq!(LtOp.evaluate(&context, &inputs).unwrap()[0][0].data(), &[1.0, 1.0, 0.0]);
        assert_eq!(NegOp.evaluate(&context, &inputs[..1]).unwrap()[0][0].data(), &[-1.0, 2.0, -4.0]);
    }

    #[test]
    fn test_integer_division_by_zero() {
        let context = EvalContext::host();
        let x = values(DataType::Int32, vec![2], vec![7.0, -7.0]);
        let y = values(DataType::Int32, vec![2], vec![2.0, 0.0]);
        let inputs = [std::slice::from_ref(&x), std::slice::from_ref(&y)];
        assert!(matches!(
            DivOp.evaluate(&context, &inputs),
            Err(EvalError::NumericFault { kind: NumericFault::DivisionByZero, .. }),
        ));
        let y = values(DataType::Int32, vec![2], vec![2.0, 2.0]);
        let inputs = [std::slice::from_ref(&x), std::slice::from_ref(&y)];
        assert_eq!(DivOp.evaluate(&context, &inputs).unwrap()[0][0].data(), &[3.0, -3.0]);
    }

    #[test]
    fn test_reduce_sum_and_reshape() {
        let tpe = f32_type(&[2, 3]).with_varying_axes(axis_set(["x"]));
        let reduced = ReduceSumOp::new(vec![1]).infer_output_types(&[&tpe]).unwrap();
        assert_eq!(reduced, vec![f32_type(&[2]).with_varying_axes(axis_set(["x"]))]);
        assert!(matches!(
            ReduceSumOp::new(vec![2]).infer_output_types(&[&tpe]),
            Err(GraphError::InvalidParameter { .. }),
        ));
        assert_eq!(ReshapeOp::new(vec![3, 2]).infer_output_types(&[&tpe]).unwrap()[0].shape, Shape::of(&[3, 2]));
        assert!(ReshapeOp::new(vec![4]).infer_output_types(&[&tpe]).is_err());
        assert_eq!(ReduceSumOp::new(vec![0, 1]).to_string(), "reduce_sum[axes=(0, 1)]");

        let x = values(DataType::Float32, vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let context = EvalContext::host();
        let inputs = [std::slice::from_ref(&x)];
        assert_eq!(ReduceSumOp::new(vec![1]).evaluate(&context, &inputs).unwrap()[0][0].data(), &[6.0, 15.0]);
        assert_eq!(ReshapeOp::new(vec![6]).evaluate(&context, &inputs).unwrap()[0][0].shape(), &[6]);
    }
}
