//! Collective operations over the manual mesh axes of a sharded region.
//!
//! Every collective carries the mesh axes it acts on. During evaluation, devices that share their coordinates on all
//! other axes form a group (see [`EvalContext::groups`]), and the collective combines the values within each group.
//! The position of a device within its group is its row-major index over the acted-on axes, in the order in which
//! they are listed.

use std::any::Any;
use std::fmt::Display;

use crate::{
    assert_input_count_matches,
    axes::{AxisName, AxisSet},
    graph::{EvalContext, EvalError, GraphError, Op},
    types::{ArrayType, DataType, Shape, Size},
    values::HostArray,
};

fn format_axes(axes: &[AxisName]) -> String {
    axes.join(", ")
}

/// Applies `f` to every group of devices communicating over `axes`. `f` receives the values of the group members in
/// group order along with the position of the receiving device.
fn collective<F>(
    context: &EvalContext<'_>,
    axes: &[AxisName],
    inputs: &[HostArray],
    f: F,
) -> Result<Vec<HostArray>, EvalError>
where
    F: Fn(&[&HostArray], usize) -> Result<HostArray, EvalError>,
{
    if axes.is_empty() {
        return Ok(inputs.to_vec());
    }
    let mut outputs = inputs.to_vec();
    for group in context.groups(axes)? {
        let members = group.iter().map(|device| &inputs[*device]).collect::<Vec<_>>();
        for (position, device) in group.iter().enumerate() {
            outputs[*device] = f(members.as_slice(), position)?;
        }
    }
    Ok(outputs)
}

fn reduce<F: Fn(f64, f64) -> f64 + Copy>(members: &[&HostArray], f: F) -> Result<HostArray, EvalError> {
    let mut result = members[0].clone();
    for member in &members[1..] {
        result = result.zip_with(member, result.data_type(), f)?;
    }
    Ok(result)
}

fn check_group_size(op: &dyn Op, members: &[&HostArray], axis_size: usize) -> Result<(), EvalError> {
    if members.len() != axis_size {
        return Err(EvalError::Graph(GraphError::InvalidParameter {
            op: op.to_string(),
            message: format!("the acted-on mesh axes have total size {}, not {axis_size}", members.len()),
        }));
    }
    Ok(())
}

fn static_dimension(op: &dyn Op, tpe: &ArrayType, dimension: usize) -> Result<usize, GraphError> {
    match tpe.shape.dimensions.get(dimension) {
        Some(Size::Static(size)) => Ok(*size),
        _ => Err(GraphError::InvalidParameter {
            op: op.to_string(),
            message: format!("dimension {dimension} of {tpe} is not a static dimension"),
        }),
    }
}

fn with_dimension(tpe: &ArrayType, dimension: usize, size: usize) -> ArrayType {
    let mut dimensions = tpe.shape.dimensions.clone();
    dimensions[dimension] = Size::Static(size);
    tpe.with_shape(Shape::new(dimensions))
}

macro_rules! axes_collective {
    ($(#[$attribute:meta])* $ty:ident, $name:literal, varying = $varying:expr, evaluate = $evaluate:expr) => {
        $(#[$attribute])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $ty {
            pub axes: Vec<AxisName>,
        }

        impl $ty {
            pub fn new<I, S>(axes: I) -> Self
            where
                I: IntoIterator<Item = S>,
                S: Into<AxisName>,
            {
                Self { axes: axes.into_iter().map(Into::into).collect() }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}[axes=({})]", $name, format_axes(&self.axes))
            }
        }

        impl Op for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
                assert_input_count_matches!(self, input_types.len(), 1);
                let input_type = input_types[0];
                let axes = self.axes.iter().cloned().collect::<AxisSet>();
                let varying: fn(&AxisSet, &AxisSet) -> AxisSet = $varying;
                Ok(vec![input_type.clone().with_varying_axes(varying(&input_type.varying_axes, &axes))])
            }

            fn evaluate(
                &self,
                context: &EvalContext<'_>,
                inputs: &[&[HostArray]],
            ) -> Result<Vec<Vec<HostArray>>, EvalError> {
                assert_input_count_matches!(self, inputs.len(), 1);
                let evaluate: fn(&[&HostArray], usize) -> Result<HostArray, EvalError> = $evaluate;
                Ok(vec![collective(context, &self.axes, inputs[0], evaluate)?])
            }

            fn collective_axes(&self) -> Option<&[AxisName]> {
                Some(self.axes.as_slice())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

fn remove_axes(varying: &AxisSet, axes: &AxisSet) -> AxisSet {
    varying.difference(axes).cloned().collect()
}

fn add_axes(varying: &AxisSet, axes: &AxisSet) -> AxisSet {
    varying.union(axes).cloned().collect()
}

fn sum(members: &[&HostArray], _: usize) -> Result<HostArray, EvalError> {
    reduce(members, |lhs, rhs| lhs + rhs)
}

// ======================================================= PSUM ======================================================

axes_collective!(
    /// Sums a value that varies over `axes` across those axes. The result is invariant over `axes`.
    PsumOp,
    "psum",
    varying = remove_axes,
    evaluate = sum
);

// ================================================== PSUM INVARIANT =================================================

axes_collective!(
    /// Sums a value across `axes`, without requiring it to vary over them. Summing a value that is invariant over an
    /// axis of size `n` multiplies it by `n`.
    PsumInvariantOp,
    "psum_invariant",
    varying = remove_axes,
    evaluate = sum
);

// ====================================================== PVARY ======================================================

axes_collective!(
    /// Marks a value that is invariant over `axes` as varying over them. This is the identity on values; its
    /// transpose is a [`PsumInvariantOp`].
    PvaryOp,
    "pvary",
    varying = add_axes,
    evaluate = |members, position| Ok(members[position].clone())
);

// ==================================================== PMIN/PMAX ====================================================

axes_collective!(PminOp, "pmin", varying = remove_axes, evaluate = |members, _| reduce(members, f64::min));
axes_collective!(PmaxOp, "pmax", varying = remove_axes, evaluate = |members, _| reduce(members, f64::max));

// ==================================================== ALL GATHER ===================================================

/// Concatenates the values of every device along `dimension`, in group order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllGatherOp {
    pub axes: Vec<AxisName>,
    pub dimension: usize,
    pub axis_size: usize,
}

impl Display for AllGatherOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all_gather[axes=({}), dimension={}]", format_axes(&self.axes), self.dimension)
    }
}

impl Op for AllGatherOp {
    fn name(&self) -> &'static str {
        "all_gather"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let size = static_dimension(self, input_types[0], self.dimension)?;
        Ok(vec![with_dimension(input_types[0], self.dimension, size * self.axis_size)])
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        let outputs = collective(context, &self.axes, inputs[0], |members, _| {
            check_group_size(self, members, self.axis_size)?;
            let members = members.iter().map(|member| (*member).clone()).collect::<Vec<_>>();
            Ok(HostArray::concatenate(members.as_slice(), self.dimension)?)
        })?;
        Ok(vec![outputs])
    }

    fn collective_axes(&self) -> Option<&[AxisName]> {
        Some(self.axes.as_slice())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ================================================== REDUCE SCATTER =================================================

/// Sums the values of every device and scatters the result along `dimension`, such that the device at group
/// position `i` receives the `i`-th block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReduceScatterOp {
    pub axes: Vec<AxisName>,
    pub dimension: usize,
    pub axis_size: usize,
}

impl Display for ReduceScatterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reduce_scatter[axes=({}), dimension={}]", format_axes(&self.axes), self.dimension)
    }
}

impl Op for ReduceScatterOp {
    fn name(&self) -> &'static str {
        "reduce_scatter"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let size = static_dimension(self, input_types[0], self.dimension)?;
        if self.axis_size == 0 || size % self.axis_size != 0 {
            return Err(GraphError::InvalidParameter {
                op: self.to_string(),
                message: format!(
                    "dimension {} of size {size} cannot be scattered {} ways",
                    self.dimension, self.axis_size,
                ),
            });
        }
        Ok(vec![with_dimension(input_types[0], self.dimension, size / self.axis_size)])
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        let outputs = collective(context, &self.axes, inputs[0], |members, position| {
            check_group_size(self, members, self.axis_size)?;
            Ok(reduce(members, |lhs, rhs| lhs + rhs)?.block(self.dimension, position, members.len())?)
        })?;
        Ok(vec![outputs])
    }

    fn collective_axes(&self) -> Option<&[AxisName]> {
        Some(self.axes.as_slice())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ==================================================== ALL TO ALL ===================================================

/// Splits every device's value into blocks along `split_axis` and sends the `j`-th block to the device at group
/// position `j`, which concatenates the received blocks along `concat_axis`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllToAllOp {
    pub axes: Vec<AxisName>,
    pub split_axis: usize,
    pub concat_axis: usize,
    pub axis_size: usize,
}

impl Display for AllToAllOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all_to_all[axes=({}), split_axis={}, concat_axis={}]",
            format_axes(&self.axes),
            self.split_axis,
            self.concat_axis,
        )
    }
}

impl Op for AllToAllOp {
    fn name(&self) -> &'static str {
        "all_to_all"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let split_size = static_dimension(self, input_types[0], self.split_axis)?;
        let concat_size = static_dimension(self, input_types[0], self.concat_axis)?;
        if self.axis_size == 0 || split_size % self.axis_size != 0 {
            return Err(GraphError::InvalidParameter {
                op: self.to_string(),
                message: format!(
                    "dimension {} of size {split_size} cannot be split {} ways",
                    self.split_axis, self.axis_size,
                ),
            });
        }
        let output_type = with_dimension(input_types[0], self.split_axis, split_size / self.axis_size);
        let concat_size = if self.split_axis == self.concat_axis { split_size / self.axis_size } else { concat_size };
        Ok(vec![with_dimension(&output_type, self.concat_axis, concat_size * self.axis_size)])
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        let outputs = collective(context, &self.axes, inputs[0], |members, position| {
            check_group_size(self, members, self.axis_size)?;
            let blocks = members
                .iter()
                .map(|member| member.block(self.split_axis, position, members.len()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(HostArray::concatenate(blocks.as_slice(), self.concat_axis)?)
        })?;
        Ok(vec![outputs])
    }

    fn collective_axes(&self) -> Option<&[AxisName]> {
        Some(self.axes.as_slice())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ===================================================== PPERMUTE ====================================================

/// Sends the value of the device at group position `source` to the device at position `destination`, for every
/// `(source, destination)` pair. Devices that receive nothing produce zeros.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PpermuteOp {
    pub axes: Vec<AxisName>,
    pub permutation: Vec<(usize, usize)>,
}

impl Display for PpermuteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let permutation = self
            .permutation
            .iter()
            .map(|(source, destination)| format!("({source}, {destination})"))
            .collect::<Vec<_>>();
        write!(f, "ppermute[axes=({}), permutation=({})]", format_axes(&self.axes), permutation.join(", "))
    }
}

impl Op for PpermuteOp {
    fn name(&self) -> &'static str {
        "ppermute"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 1);
        let destinations = self.permutation.iter().map(|(_, destination)| *destination).collect::<Vec<_>>();
        for (index, destination) in destinations.iter().enumerate() {
            if destinations[..index].contains(destination) {
                return Err(GraphError::InvalidParameter {
                    op: self.to_string(),
                    message: format!("device position {destination} receives more than one value"),
                });
            }
        }
        Ok(vec![input_types[0].clone()])
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 1);
        let outputs = collective(context, &self.axes, inputs[0], |members, position| {
            match self.permutation.iter().find(|(_, destination)| *destination == position) {
                Some((source, _)) => members.get(*source).map(|member| (*member).clone()).ok_or_else(|| {
                    EvalError::Graph(GraphError::InvalidParameter {
                        op: self.to_string(),
                        message: format!("source position {source} is out of range"),
                    })
                }),
                None => {
                    let member = members[position];
                    Ok(HostArray::zeros(member.data_type(), member.shape().to_vec()))
                }
            }
        })?;
        Ok(vec![outputs])
    }

    fn collective_axes(&self) -> Option<&[AxisName]> {
        Some(self.axes.as_slice())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ==================================================== AXIS INDEX ===================================================

/// Returns the position of the current device along `axes`, as an `i32` scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisIndexOp {
    pub axes: Vec<AxisName>,
}

impl AxisIndexOp {
    pub fn new<I, S>(axes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AxisName>,
    {
        Self { axes: axes.into_iter().map(Into::into).collect() }
    }
}

impl Display for AxisIndexOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "axis_index[axes=({})]", format_axes(&self.axes))
    }
}

impl Op for AxisIndexOp {
    fn name(&self) -> &'static str {
        "axis_index"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 0);
        let varying_axes = self.axes.iter().cloned().collect();
        Ok(vec![ArrayType::scalar(DataType::Int32).with_varying_axes(varying_axes)])
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 0);
        let outputs = (0..context.device_count())
            .map(|device| -> Result<HostArray, EvalError> {
                let position = if self.axes.is_empty() { 0 } else { context.axis_position(device, &self.axes)? };
                Ok(HostArray::scalar(DataType::Int32, position as f64))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vec![outputs])
    }

    fn collective_axes(&self) -> Option<&[AxisName]> {
        Some(self.axes.as_slice())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
