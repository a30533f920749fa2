//! Region-level bookkeeping for batching, differentiation, partial evaluation, transposition, and dead code
//! elimination. The transformations of the body graph itself are either provided by a [`BodyTransform`] or
//! implemented by [`Graph`].

use tracing::debug;

use crate::{
    axes::{AxisAssignment, AxisName, AxisSet, Replication, format_axis_set, in_mesh_order},
    errors::Error,
    graph::{Atom, Graph, GraphBuilder, GraphError},
    ops::{CallOp, DivOp, PsumOp, ReshapeOp},
    replication::check_graph,
    shard_map::{BodyTransform, ModeOutput, ShardMapError, ShardMapOp, check_mode_argument},
    types::{DivisibilityError, Shape},
};

fn select<T: Clone>(values: &[T], mask: &[bool], keep: bool) -> Vec<T> {
    values.iter().zip(mask).filter_map(|(value, selected)| (*selected == keep).then(|| value.clone())).collect()
}

fn invalid_body(transform: &str, message: String) -> ShardMapError {
    ShardMapError::InvalidTransformedBody { transform: transform.to_string(), message }
}

fn check_signature(transform: &str, body: &Graph, inputs: usize, outputs: usize) -> Result<(), ShardMapError> {
    if body.input_count() != inputs || body.output_count() != outputs {
        return Err(invalid_body(
            transform,
            format!(
                "expected {inputs} input(s) and {outputs} output(s), but got {} input(s) and {} output(s)",
                body.input_count(),
                body.output_count(),
            ),
        ));
    }
    Ok(())
}

/// Emits a call to `graph` on fresh inputs of the given types, returning the inputs and the call outputs.
fn call(builder: &mut GraphBuilder, graph: Graph, inputs: Vec<Atom>) -> Result<Vec<Atom>, GraphError> {
    Ok(builder.add_equation(CallOp::new(graph), inputs)?.into_iter().map(Atom::from).collect())
}

fn reshape(builder: &mut GraphBuilder, atom: Atom, shape: Vec<usize>) -> Result<Atom, GraphError> {
    let outputs = builder.add_equation(ReshapeOp::new(shape), vec![atom])?;
    outputs.first().copied().map(Atom::from).ok_or(GraphError::InvalidOutputCount {
        op: "reshape".to_string(),
        expected: 1,
        got: outputs.len(),
    })
}

impl ShardMapOp {
    /// Re-creates this region around a new body and new assignments, keeping the mesh and configuration.
    fn with_body(
        &self,
        in_assignments: Vec<AxisAssignment>,
        out_assignments: Vec<AxisAssignment>,
        body: Graph,
    ) -> Result<Self, Error> {
        ShardMapOp::new(self.mesh.clone(), in_assignments, out_assignments, body, self.config.clone())
    }

    /// Checks that named batching axes are not already used by `assignments`.
    fn check_spmd_axes(
        &self,
        specs: &str,
        assignments: &[AxisAssignment],
        spmd_axes: Option<&[AxisName]>,
    ) -> Result<(), ShardMapError> {
        let Some(spmd_axes) = spmd_axes else {
            return Ok(());
        };
        let used = assignments.iter().flat_map(AxisAssignment::mentioned_axes).collect::<AxisSet>();
        let colliding = spmd_axes.iter().filter(|axis| used.contains(*axis)).cloned().collect::<AxisSet>();
        if !colliding.is_empty() {
            return Err(ShardMapError::SpmdAxisInUse { specs: specs.to_string(), axes: format_axis_set(&colliding) });
        }
        Ok(())
    }

    fn batch_assignments(
        assignments: &[AxisAssignment],
        batch_dimensions: &[Option<usize>],
        spmd_axes: Option<&[AxisName]>,
    ) -> Vec<AxisAssignment> {
        assignments
            .iter()
            .zip(batch_dimensions)
            .map(|(assignment, batch_dimension)| {
                let shifted = assignment.shift_for_batch(*batch_dimension);
                match (batch_dimension, spmd_axes) {
                    (Some(dimension), Some(axes)) if !axes.is_empty() => {
                        shifted.with_dimension(*dimension, axes.iter().cloned())
                    }
                    _ => shifted,
                }
            })
            .collect()
    }

    pub(super) fn batch(
        &self,
        transform: &dyn BodyTransform,
        batch_dimensions: &[Option<usize>],
        batch_size: usize,
        spmd_axes: Option<&[AxisName]>,
    ) -> Result<(ShardMapOp, Vec<Option<usize>>), Error> {
        check_mode_argument("batching", "batch dimensions", self.in_assignments.len(), batch_dimensions.len())?;
        self.check_spmd_axes("in_specs", &self.in_assignments, spmd_axes)?;
        let local_batch_size = match spmd_axes {
            Some(axes) => {
                let product = self.abstract_mesh().axes_size(axes);
                if product == 0 || batch_size % product != 0 {
                    return Err(DivisibilityError::NotDivisible {
                        dimension: batch_dimensions.iter().flatten().next().copied().unwrap_or_default(),
                        size: batch_size,
                        axes: axes.to_vec(),
                        product,
                    }
                    .into());
                }
                batch_size / product
            }
            None => batch_size,
        };

        let (body, output_batch_dimensions) = transform.batch(&self.body, batch_dimensions, local_batch_size)?;
        check_signature("batching", &body, self.in_assignments.len(), self.out_assignments.len())?;
        check_mode_argument(
            "batching",
            "output batch dimensions",
            self.out_assignments.len(),
            output_batch_dimensions.len(),
        )?;
        self.check_spmd_axes("out_specs", &self.out_assignments, spmd_axes)?;

        let in_assignments = Self::batch_assignments(&self.in_assignments, batch_dimensions, spmd_axes);
        let out_assignments = Self::batch_assignments(&self.out_assignments, &output_batch_dimensions, spmd_axes);
        let region = self.with_body(in_assignments, out_assignments, body)?;
        Ok((region, output_batch_dimensions))
    }

    pub(super) fn jvp(
        &self,
        transform: &dyn BodyTransform,
        nonzero_tangents: &[bool],
    ) -> Result<(ShardMapOp, Vec<bool>), Error> {
        check_mode_argument("differentiation", "tangent flags", self.in_assignments.len(), nonzero_tangents.len())?;
        let (body, nonzero_tangent_outputs) = transform.jvp(&self.body, nonzero_tangents)?;
        check_mode_argument(
            "differentiation",
            "output tangent flags",
            self.out_assignments.len(),
            nonzero_tangent_outputs.len(),
        )?;
        let tangent_assignments = select(&self.in_assignments, nonzero_tangents, true);
        let in_assignments = [self.in_assignments.clone(), tangent_assignments].concat();
        let out_assignments =
            [self.out_assignments.clone(), select(&self.out_assignments, &nonzero_tangent_outputs, true)].concat();
        check_signature("differentiation", &body, in_assignments.len(), out_assignments.len())?;
        let region = self.with_body(in_assignments, out_assignments, body)?;
        Ok((region, nonzero_tangent_outputs))
    }

    /// Returns the assignment of every residual. A residual is split along its first dimension over the manual axes
    /// it varies over when replication checking is enabled, and over every manual axis otherwise.
    fn residual_assignments(
        &self,
        known: &Graph,
        known_inputs: &[bool],
        residual_count: usize,
    ) -> Result<Vec<AxisAssignment>, Error> {
        let manual_axes = self.manual_axes();
        let varying_axes = if self.config.check_replication {
            let analysis = self.analysis();
            let input_reps = select(&self.input_replication(), known_inputs, true)
                .into_iter()
                .map(Replication::Axes)
                .collect::<Vec<_>>();
            let output_reps = check_graph(&analysis, known, input_reps.as_slice())?;
            output_reps[output_reps.len() - residual_count..]
                .iter()
                .map(|rep| manual_axes.difference(&analysis.resolve(rep)).cloned().collect::<AxisSet>())
                .collect::<Vec<_>>()
        } else {
            vec![manual_axes; residual_count]
        };
        let mesh = self.abstract_mesh();
        Ok(varying_axes
            .into_iter()
            .map(|axes| {
                let axes = in_mesh_order(mesh, &axes);
                if axes.is_empty() {
                    AxisAssignment::replicated()
                } else {
                    AxisAssignment::replicated().with_dimension(0, axes)
                }
            })
            .collect())
    }

    pub(super) fn partial_eval(&self, known_inputs: &[bool]) -> Result<ModeOutput, Error> {
        check_mode_argument("partial evaluation", "input flags", self.in_assignments.len(), known_inputs.len())?;
        let split = self.body.partial_eval(known_inputs)?;
        let known_output_count = split.known.output_count() - split.residual_count;
        let residual_assignments = self.residual_assignments(&split.known, known_inputs, split.residual_count)?;

        // Residuals are split along their first dimension, and so scalar residuals are promoted to rank 1.
        let residual_types = split.known.output_types()?.split_off(known_output_count);
        let scalar_residuals = residual_types.iter().map(|tpe| tpe.rank() == 0).collect::<Vec<_>>();
        let (known_body, staged_body) = if scalar_residuals.iter().any(|scalar| *scalar) {
            let mut builder = GraphBuilder::new();
            let inputs = split.known.input_types().into_iter().map(|tpe| builder.add_variable(tpe)).collect::<Vec<_>>();
            let mut outputs = call(&mut builder, split.known, inputs.iter().copied().map(Atom::from).collect())?;
            for (output, scalar) in outputs[known_output_count..].iter_mut().zip(scalar_residuals.iter()) {
                if *scalar {
                    *output = reshape(&mut builder, *output, vec![1])?;
                }
            }
            let known_body = builder.build(inputs, outputs)?;

            let mut builder = GraphBuilder::new();
            let inputs = split
                .staged
                .input_types()
                .into_iter()
                .enumerate()
                .map(|(index, tpe)| match scalar_residuals.get(index) {
                    Some(true) => builder.add_variable(tpe.with_shape(Shape::of(&[1]))),
                    _ => builder.add_variable(tpe),
                })
                .collect::<Vec<_>>();
            let mut arguments = inputs.iter().copied().map(Atom::from).collect::<Vec<_>>();
            for (argument, scalar) in arguments.iter_mut().zip(scalar_residuals.iter()) {
                if *scalar {
                    *argument = reshape(&mut builder, *argument, Vec::new())?;
                }
            }
            let outputs = call(&mut builder, split.staged, arguments)?;
            (known_body, builder.build(inputs, outputs)?)
        } else {
            (split.known, split.staged)
        };

        let known_out_assignments = select(&self.out_assignments, &split.known_outputs, true);
        let known = self.with_body(
            select(&self.in_assignments, known_inputs, true),
            [known_out_assignments, residual_assignments.clone()].concat(),
            known_body,
        )?;
        let staged = self.with_body(
            [residual_assignments, select(&self.in_assignments, known_inputs, false)].concat(),
            select(&self.out_assignments, &split.known_outputs, false),
            staged_body,
        )?;
        debug!(residuals = split.residual_count, "partially evaluated sharded region");
        Ok(ModeOutput::PartialEval {
            known,
            staged,
            known_outputs: split.known_outputs,
            residual_count: split.residual_count,
        })
    }

    /// Wraps a transposed body such that every cotangent input is divided by the number of devices that hold a
    /// copy of it and every cotangent output is summed over the devices that hold a copy of the corresponding
    /// primal input. Division by `1` is skipped unless `always_divide` is set.
    fn unmentioned_adjustment(
        &self,
        body: Graph,
        cotangent_assignments: &[AxisAssignment],
        output_assignments: &[AxisAssignment],
        always_divide: bool,
    ) -> Result<Graph, Error> {
        let mesh = self.abstract_mesh();
        let auto_axes = &self.config.auto_axes;
        let unmentioned = |assignment: &AxisAssignment| {
            assignment.unmentioned(mesh).into_iter().filter(|axis| !auto_axes.contains(axis)).collect::<Vec<_>>()
        };

        let mut builder = GraphBuilder::new();
        let inputs = body.input_types().into_iter().map(|tpe| builder.add_variable(tpe)).collect::<Vec<_>>();
        let mut arguments = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let tpe = builder.atom_type(&Atom::from(*input))?;
            let argument = match cotangent_assignments.get(index) {
                Some(assignment) if tpe.data_type.is_floating_point() => {
                    let factor = mesh.axes_size(unmentioned(assignment).as_slice());
                    if factor != 1 || always_divide {
                        let divisor = Atom::literal(factor as f64, tpe.data_type);
                        builder.add_single_output_equation(DivOp, vec![Atom::from(*input), divisor])?.into()
                    } else {
                        Atom::from(*input)
                    }
                }
                _ => Atom::from(*input),
            };
            arguments.push(argument);
        }
        let mut outputs = call(&mut builder, body, arguments)?;
        for (output, assignment) in outputs.iter_mut().zip(output_assignments) {
            let axes = unmentioned(assignment);
            if !axes.is_empty() {
                *output = builder.add_single_output_equation(PsumOp::new(axes), vec![*output])?.into();
            }
        }
        Ok(builder.build(inputs, outputs)?)
    }

    pub(super) fn transpose(
        &self,
        transform: &dyn BodyTransform,
        linear_inputs: &[bool],
        nonzero_cotangents: &[bool],
    ) -> Result<(ShardMapOp, Vec<bool>), Error> {
        check_mode_argument("transposition", "linearity flags", self.in_assignments.len(), linear_inputs.len())?;
        check_mode_argument(
            "transposition",
            "cotangent flags",
            self.out_assignments.len(),
            nonzero_cotangents.len(),
        )?;
        let (body, nonzero_input_cotangents) = transform.transpose(&self.body, linear_inputs, nonzero_cotangents)?;
        check_mode_argument(
            "transposition",
            "input cotangent flags",
            self.in_assignments.len(),
            nonzero_input_cotangents.len(),
        )?;
        let nonlinear_cotangent =
            nonzero_input_cotangents.iter().zip(linear_inputs).position(|(cotangent, linear)| *cotangent && !*linear);
        if let Some(index) = nonlinear_cotangent {
            let message = format!("input #{index} is not linear but has a cotangent");
            return Err(invalid_body("transposition", message).into());
        }

        let cotangent_assignments = select(&self.out_assignments, nonzero_cotangents, true);
        let output_assignments = select(&self.in_assignments, &nonzero_input_cotangents, true);
        let in_assignments =
            [cotangent_assignments.clone(), select(&self.in_assignments, linear_inputs, false)].concat();
        check_signature("transposition", &body, in_assignments.len(), output_assignments.len())?;

        let (body, deoptimized_body) = if self.config.rewrites() {
            (body.clone(), body)
        } else {
            let deoptimized =
                self.unmentioned_adjustment(body.clone(), &cotangent_assignments, &output_assignments, true)?;
            (self.unmentioned_adjustment(body, &cotangent_assignments, &output_assignments, false)?, deoptimized)
        };
        let region =
            self.with_body(in_assignments, output_assignments, body)?.with_deoptimized_body(deoptimized_body);
        Ok((region, nonzero_input_cotangents))
    }

    /// Prunes the region to its used outputs. Returns `None` when the region can be dropped entirely.
    pub(super) fn prune_region(&self, used_outputs: &[bool]) -> Result<Option<(ShardMapOp, Vec<bool>)>, GraphError> {
        let has_effects = self.body.has_effects();
        if !used_outputs.iter().any(|used| *used) && !has_effects {
            debug!("dropping unused sharded region");
            return Ok(None);
        }
        let (body, used_inputs) = self.body.dead_code_elimination(used_outputs)?;
        debug!(
            used_inputs = used_inputs.iter().filter(|used| **used).count(),
            used_outputs = used_outputs.iter().filter(|used| **used).count(),
            "pruned sharded region",
        );
        let region = ShardMapOp {
            in_assignments: select(&self.in_assignments, &used_inputs, true),
            out_assignments: select(&self.out_assignments, used_outputs, true),
            body,
            deoptimized_body: None,
            ..self.clone()
        };
        Ok(Some((region, used_inputs)))
    }

    pub(super) fn dce(&self, used_outputs: &[bool]) -> Result<(Option<ShardMapOp>, Vec<bool>), Error> {
        check_mode_argument("dead code elimination", "output flags", self.out_assignments.len(), used_outputs.len())?;
        Ok(match self.prune_region(used_outputs)? {
            Some((region, used_inputs)) => (Some(region), used_inputs),
            None => (None, vec![false; self.in_assignments.len()]),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
