//! Sharded regions.
//!
//! A sharded region runs a body graph once per device of a mesh. Every argument is split into per-device blocks
//! according to an [`AxisAssignment`] and every result is reassembled from per-device blocks according to another.
//! Values that an assignment does not split along some manual mesh axis must hold identical data on every device
//! along that axis. When replication checking is enabled this is proven statically (see [`crate::replication`]).
//!
//! Regions are built with [`shard_map`], which stages a [`ShardMapOp`] into an enclosing graph, or evaluated
//! directly with [`shard_map_eager`]. Every other interpretation of a region (batching, differentiation, partial
//! evaluation, transposition, and dead code elimination) goes through [`ShardMapOp::process`].

use std::any::Any;
use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{
    axes::{AxisAssignment, AxisName, AxisSet, PartitionSpec, Replication, SpecError, format_axis_set},
    config::ShardMapConfig,
    errors::Error,
    graph::{Atom, AtomId, EvalContext, EvalError, Graph, GraphBuilder, GraphError, Op},
    mesh::{AbstractMesh, MeshRef},
    replication::{Analysis, check_graph, check_output_replication, rewrite_graph, rewrite_graph_matching},
    types::{ArrayType, shard_type, unshard_type},
    values::{GlobalArray, HostArray},
};

mod eager;
mod transforms;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for sharded region interpretation modes.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ShardMapError {
    /// Error returned when a named batching axis is already used by the specs of the batched region.
    #[error("spmd batching axes {axes} cannot appear in the {specs} of a sharded region")]
    SpmdAxisInUse { specs: String, axes: String },

    /// Error returned when a mode receives a mask or list whose length does not match the region.
    #[error("{mode} expects {expected} {kind}, but got {got}")]
    InvalidModeArgument { mode: String, kind: String, expected: usize, got: usize },

    /// Error returned when a [`BodyTransform`] returns a graph that does not have the expected signature.
    #[error("the {transform} of the region body is invalid: {message}")]
    InvalidTransformedBody { transform: String, message: String },
}

fn check_mode_argument(mode: &str, kind: &str, expected: usize, got: usize) -> Result<(), ShardMapError> {
    if expected != got {
        return Err(ShardMapError::InvalidModeArgument {
            mode: mode.to_string(),
            kind: kind.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Region declaration
// ---------------------------------------------------------------------------

/// Partition specs of the results of a sharded region.
#[derive(Clone)]
pub enum OutSpecs {
    Fixed(Vec<PartitionSpec>),

    /// Specs computed from the (per-device) result types of the body, once the body has been built.
    Lazy(Arc<dyn Fn(&[ArrayType]) -> Vec<PartitionSpec> + Send + Sync>),
}

impl OutSpecs {
    pub fn lazy<F: Fn(&[ArrayType]) -> Vec<PartitionSpec> + Send + Sync + 'static>(f: F) -> Self {
        Self::Lazy(Arc::new(f))
    }

    fn resolve(&self, output_types: &[ArrayType]) -> Vec<PartitionSpec> {
        match self {
            Self::Fixed(specs) => specs.clone(),
            Self::Lazy(f) => f(output_types),
        }
    }
}

impl std::fmt::Debug for OutSpecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(specs) => f.debug_tuple("Fixed").field(specs).finish(),
            Self::Lazy(_) => write!(f, "Lazy(..)"),
        }
    }
}

impl From<Vec<PartitionSpec>> for OutSpecs {
    fn from(specs: Vec<PartitionSpec>) -> Self {
        Self::Fixed(specs)
    }
}

/// Declaration of a sharded region: its mesh, how its arguments and results are split over that mesh, and how it
/// is checked.
#[derive(Clone, Debug)]
pub struct ShardMapSpec {
    pub mesh: MeshRef,
    pub in_specs: Vec<PartitionSpec>,
    pub out_specs: OutSpecs,
    pub config: ShardMapConfig,
}

impl ShardMapSpec {
    pub fn new<M: Into<MeshRef>, O: Into<OutSpecs>>(mesh: M, in_specs: Vec<PartitionSpec>, out_specs: O) -> Self {
        Self { mesh: mesh.into(), in_specs, out_specs: out_specs.into(), config: ShardMapConfig::default() }
    }

    pub fn with_config(mut self, config: ShardMapConfig) -> Self {
        self.config = config;
        self
    }
}

// ---------------------------------------------------------------------------
// Region operation
// ---------------------------------------------------------------------------

/// Sharded region embedded in a graph as a single equation.
///
/// The inputs and outputs of the equation are global values. The body graph operates on per-device values, whose
/// types are obtained with [`shard_type`] from the global input types.
#[derive(Clone, Debug)]
pub struct ShardMapOp {
    pub mesh: MeshRef,
    pub in_assignments: Vec<AxisAssignment>,
    pub out_assignments: Vec<AxisAssignment>,
    pub body: Graph,
    pub config: ShardMapConfig,

    /// Body used to re-run eager evaluation of a transposed region after a numeric fault.
    deoptimized_body: Option<Graph>,
}

impl ShardMapOp {
    /// Creates a new region. This validates the assignments against the mesh and the body signature, but does not
    /// check replication (see [`ShardMapOp::checked`]).
    pub fn new(
        mesh: MeshRef,
        in_assignments: Vec<AxisAssignment>,
        out_assignments: Vec<AxisAssignment>,
        body: Graph,
        config: ShardMapConfig,
    ) -> Result<Self, Error> {
        let abstract_mesh = mesh.abstract_mesh();
        abstract_mesh.validate_auto_axes(&config.auto_axes)?;
        if in_assignments.len() != body.input_count() {
            return Err(SpecError::SpecCountMismatch {
                kind: "in_specs".to_string(),
                expected: body.input_count(),
                actual: in_assignments.len(),
            }
            .into());
        }
        if out_assignments.len() != body.output_count() {
            return Err(SpecError::SpecCountMismatch {
                kind: "out_specs".to_string(),
                expected: body.output_count(),
                actual: out_assignments.len(),
            }
            .into());
        }
        for assignment in in_assignments.iter().chain(out_assignments.iter()) {
            assignment.validate(abstract_mesh, &config.auto_axes)?;
        }
        for (output, (assignment, tpe)) in out_assignments.iter().zip(body.output_types()?).enumerate() {
            if assignment.required_rank() > tpe.rank() {
                return Err(SpecError::OutputRankTooSmall {
                    output,
                    spec: assignment.to_spec(tpe.rank()).to_string(),
                    rank: tpe.rank(),
                    required_rank: assignment.required_rank(),
                }
                .into());
            }
        }
        Ok(Self { mesh, in_assignments, out_assignments, body, config, deoptimized_body: None })
    }

    pub(crate) fn with_deoptimized_body(mut self, body: Graph) -> Self {
        self.deoptimized_body = Some(body);
        self
    }

    /// Returns the topology of the region mesh.
    pub fn abstract_mesh(&self) -> &AbstractMesh {
        self.mesh.abstract_mesh()
    }

    /// Mesh axes that are manual inside the region.
    pub fn manual_axes(&self) -> AxisSet {
        self.abstract_mesh().axis_set().difference(&self.config.auto_axes).cloned().collect()
    }

    fn analysis(&self) -> Analysis<'_> {
        Analysis::new(self.abstract_mesh(), &self.config.auto_axes, self.config.registry())
    }

    /// Manual axes over which a value with `assignment` is replicated.
    fn replication(&self, assignment: &AxisAssignment) -> AxisSet {
        assignment.replication(self.abstract_mesh()).difference(&self.config.auto_axes).cloned().collect()
    }

    fn input_replication(&self) -> Vec<AxisSet> {
        self.in_assignments.iter().map(|assignment| self.replication(assignment)).collect()
    }

    /// Checks that every output of the body is replicated over the manual axes its assignment does not mention.
    pub fn check_replication(&self) -> Result<(), Error> {
        let analysis = self.analysis();
        let input_reps = self.input_replication().into_iter().map(Replication::Axes).collect::<Vec<_>>();
        let output_reps = check_graph(&analysis, &self.body, input_reps.as_slice())?;
        let output_types = self.body.output_types()?;
        for (output, ((assignment, rep), tpe)) in
            self.out_assignments.iter().zip(output_reps.iter()).zip(output_types.iter()).enumerate()
        {
            check_output_replication(&analysis, output, assignment, tpe.rank(), rep)?;
        }
        Ok(())
    }

    /// Checks replication when enabled, returning the region unchanged or, when rewriting is enabled, with its body
    /// rewritten such that every output is replicated over exactly the axes its assignment does not mention.
    ///
    /// When rewriting, the output replication is inferred on the rewritten body, since the rewrite is what makes
    /// values of different replication compatible.
    pub fn checked(self) -> Result<Self, Error> {
        if !self.config.check_replication {
            return Ok(self);
        }
        if !self.config.rewrites() {
            self.check_replication()?;
            return Ok(self);
        }
        let analysis = self.analysis();
        let input_reps = self.input_replication();
        let (_, inferred_reps) = rewrite_graph(&analysis, &self.body, input_reps.as_slice())?;
        let output_types = self.body.output_types()?;
        for (output, ((assignment, rep), tpe)) in
            self.out_assignments.iter().zip(inferred_reps).zip(output_types.iter()).enumerate()
        {
            check_output_replication(&analysis, output, assignment, tpe.rank(), &Replication::Axes(rep))?;
        }
        let output_reps =
            self.out_assignments.iter().map(|assignment| self.replication(assignment)).collect::<Vec<_>>();
        let body = rewrite_graph_matching(&analysis, &self.body, input_reps.as_slice(), output_reps.as_slice())?;
        Ok(Self { body, ..self })
    }

    /// Computes the per-device types of the body inputs for global argument types.
    pub fn local_input_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        crate::assert_input_count_matches!(self, input_types.len(), self.in_assignments.len());
        let mesh = self.abstract_mesh();
        let check = self.config.check_replication;
        self.in_assignments
            .iter()
            .zip(input_types)
            .map(|(assignment, tpe)| Ok(shard_type(mesh, &self.config.auto_axes, check, assignment, tpe)?))
            .collect()
    }

    /// Verifies that the body accepts the sharded argument types, that the body is well typed, and (when checking is
    /// enabled) that its outputs are replicated as the output assignments require. Returns the global output types.
    pub fn type_check(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, Error> {
        let output_types = self.infer_output_types(input_types)?;
        self.body.type_check()?;
        if self.config.check_replication {
            self.check_replication()?;
        }
        Ok(output_types)
    }

    /// Interprets this region in the provided mode.
    pub fn process(&self, mode: Mode<'_>) -> Result<ModeOutput, Error> {
        match mode {
            Mode::Eager { arguments } => Ok(ModeOutput::Values(self.evaluate_eagerly(arguments)?)),
            Mode::Batch { transform, batch_dimensions, batch_size, spmd_axes } => {
                let (region, output_batch_dimensions) =
                    self.batch(transform, batch_dimensions, batch_size, spmd_axes)?;
                Ok(ModeOutput::Batched { region, output_batch_dimensions })
            }
            Mode::Jvp { transform, nonzero_tangents } => {
                let (region, nonzero_tangent_outputs) = self.jvp(transform, nonzero_tangents)?;
                Ok(ModeOutput::Jvp { region, nonzero_tangent_outputs })
            }
            Mode::PartialEval { known_inputs } => self.partial_eval(known_inputs),
            Mode::Transpose { transform, linear_inputs, nonzero_cotangents } => {
                let (region, nonzero_input_cotangents) = self.transpose(transform, linear_inputs, nonzero_cotangents)?;
                Ok(ModeOutput::Transposed { region, nonzero_input_cotangents })
            }
            Mode::Dce { used_outputs } => {
                let (region, used_inputs) = self.dce(used_outputs)?;
                Ok(ModeOutput::Pruned { region, used_inputs })
            }
        }
    }
}

impl Display for ShardMapOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let format = |assignments: &[AxisAssignment]| {
            assignments.iter().map(|assignment| assignment.to_string()).collect::<Vec<_>>().join(", ")
        };
        write!(
            f,
            "shard_map[mesh={}, in_specs=({}), out_specs=({}), check_replication={}, auto={}]",
            self.abstract_mesh(),
            format(&self.in_assignments),
            format(&self.out_assignments),
            self.config.check_replication,
            format_axis_set(&self.config.auto_axes),
        )
    }
}

impl Op for ShardMapOp {
    fn name(&self) -> &'static str {
        "shard_map"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        let local_types = self.local_input_types(input_types)?;
        for (input, tpe) in self.body.inputs().iter().zip(local_types.iter()) {
            if !input.tpe.is_compatible_with(tpe) {
                return Err(GraphError::InvalidAtomType {
                    id: input.id,
                    expected: input.tpe.to_string(),
                    got: tpe.to_string(),
                });
            }
        }
        let mesh = self.abstract_mesh();
        let check = self.config.check_replication;
        self.out_assignments
            .iter()
            .zip(self.body.output_types()?)
            .map(|(assignment, tpe)| Ok(unshard_type(mesh, &self.config.auto_axes, check, assignment, &tpe)?))
            .collect()
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        if context.device_count() != 1 {
            return Err(EvalError::Unsupported {
                message: "sharded regions nested in other sharded regions cannot be evaluated".to_string(),
            });
        }
        let arguments = inputs
            .iter()
            .map(|values| values.first().cloned().map(GlobalArray::host))
            .collect::<Option<Vec<_>>>()
            .ok_or(EvalError::InvalidDeviceCount { expected: 1, got: 0 })?;
        let outputs = self.evaluate_eagerly(arguments.as_slice())?;
        Ok(outputs.into_iter().map(|output| vec![output.array]).collect())
    }

    fn sub_graphs(&self) -> Vec<&Graph> {
        vec![&self.body]
    }

    fn prune(&self, used_outputs: &[bool]) -> Result<Option<(Box<dyn Op>, Vec<bool>)>, GraphError> {
        Ok(self.prune_region(used_outputs)?.map(|(region, used_inputs)| (Box::new(region) as Box<dyn Op>, used_inputs)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Stages a sharded region applied to `arguments` into `builder` and returns its (global) results.
///
/// `body` builds the region body. It receives a fresh builder along with one input per argument, typed with the
/// per-device type of that argument, and returns the body results. The region is validated, its replication is
/// checked, and its body is rewritten according to `spec.config`.
pub fn shard_map<F>(
    builder: &mut GraphBuilder,
    spec: &ShardMapSpec,
    arguments: &[Atom],
    body: F,
) -> Result<Vec<AtomId>, Error>
where
    F: FnOnce(&mut GraphBuilder, &[AtomId]) -> Result<Vec<Atom>, Error>,
{
    let mesh = spec.mesh.abstract_mesh();
    let config = &spec.config;
    mesh.validate_auto_axes(&config.auto_axes)?;
    if spec.in_specs.len() != arguments.len() {
        return Err(SpecError::SpecCountMismatch {
            kind: "in_specs".to_string(),
            expected: arguments.len(),
            actual: spec.in_specs.len(),
        }
        .into());
    }

    let mut body_builder = GraphBuilder::new();
    let mut body_inputs = Vec::with_capacity(arguments.len());
    let mut in_assignments = Vec::with_capacity(arguments.len());
    for (index, (argument, in_spec)) in arguments.iter().zip(spec.in_specs.iter()).enumerate() {
        let tpe = builder.atom_type(argument)?;
        if in_spec.rank() > tpe.rank() {
            return Err(SpecError::SpecTooLong {
                position: format!("argument #{index}"),
                spec: in_spec.to_string(),
                spec_rank: in_spec.rank(),
                rank: tpe.rank(),
            }
            .into());
        }
        let assignment = AxisAssignment::canonicalize(in_spec)?;
        assignment.validate(mesh, &config.auto_axes)?;
        let local_type = shard_type(mesh, &config.auto_axes, config.check_replication, &assignment, &tpe)?;
        body_inputs.push(body_builder.add_variable(local_type));
        in_assignments.push(assignment);
    }

    let outputs = body(&mut body_builder, body_inputs.as_slice())?;
    let output_types =
        outputs.iter().map(|output| body_builder.atom_type(output)).collect::<Result<Vec<_>, _>>()?;
    let out_specs = spec.out_specs.resolve(output_types.as_slice());
    if out_specs.len() != outputs.len() {
        return Err(SpecError::SpecCountMismatch {
            kind: "out_specs".to_string(),
            expected: outputs.len(),
            actual: out_specs.len(),
        }
        .into());
    }
    let out_assignments = out_specs.iter().map(AxisAssignment::canonicalize).collect::<Result<Vec<_>, _>>()?;

    let body = body_builder.build(body_inputs, outputs)?;
    let region = ShardMapOp::new(spec.mesh.clone(), in_assignments, out_assignments, body, config.clone())?.checked()?;
    debug!(region = %region, equations = region.body.equations().len(), "staged sharded region");
    Ok(builder.add_equation(region, arguments.to_vec())?)
}

/// Stages a sharded region over the provided arguments and evaluates it immediately.
pub fn shard_map_eager<F>(spec: &ShardMapSpec, arguments: &[GlobalArray], body: F) -> Result<Vec<GlobalArray>, Error>
where
    F: FnOnce(&mut GraphBuilder, &[AtomId]) -> Result<Vec<Atom>, Error>,
{
    let mut builder = GraphBuilder::new();
    let inputs = arguments
        .iter()
        .map(|argument| Atom::from(builder.add_variable(argument.array.array_type())))
        .collect::<Vec<_>>();
    shard_map(&mut builder, spec, inputs.as_slice(), body)?;
    let graph = builder.build(inputs.iter().filter_map(Atom::variable).collect(), Vec::new())?;
    let region = graph
        .equations()
        .last()
        .and_then(|equation| equation.op.as_any().downcast_ref::<ShardMapOp>())
        .ok_or_else(|| GraphError::InvalidParameter {
            op: "shard_map".to_string(),
            message: "staging did not produce a sharded region".to_string(),
        })?;
    match region.process(Mode::Eager { arguments })? {
        ModeOutput::Values(values) => Ok(values),
        _ => Err(EvalError::Unsupported { message: "eager evaluation returned a staged region".to_string() }.into()),
    }
}

// ---------------------------------------------------------------------------
// Interpretation modes
// ---------------------------------------------------------------------------

/// Graph-level transformations of a region body that a sharded region delegates to.
///
/// A sharded region only keeps track of how the arguments and results of its body are split over the mesh. The
/// transformation of the body itself is provided by the caller.
pub trait BodyTransform {
    /// Batches `body` along `batch_dimensions` (one per input; `None` for unbatched inputs), where the per-device
    /// batch size is `batch_size`. Returns the batched body along with the batch dimension of every output.
    fn batch(
        &self,
        body: &Graph,
        batch_dimensions: &[Option<usize>],
        batch_size: usize,
    ) -> Result<(Graph, Vec<Option<usize>>), Error>;

    /// Computes the forward-mode derivative of `body` for the inputs marked in `nonzero_tangents`. The returned graph
    /// takes the primal inputs followed by the nonzero tangents, and returns the primal outputs followed by the
    /// nonzero output tangents, which are marked in the returned mask.
    fn jvp(&self, body: &Graph, nonzero_tangents: &[bool]) -> Result<(Graph, Vec<bool>), Error>;

    /// Transposes `body` with respect to the inputs marked in `linear_inputs`. The returned graph takes the nonzero
    /// output cotangents (marked in `nonzero_cotangents`) followed by the inputs that are not linear, and returns the
    /// nonzero cotangents of the linear inputs, which are marked in the returned mask (one entry per input).
    fn transpose(
        &self,
        body: &Graph,
        linear_inputs: &[bool],
        nonzero_cotangents: &[bool],
    ) -> Result<(Graph, Vec<bool>), Error>;
}

/// Interpretation of a sharded region, processed by [`ShardMapOp::process`].
#[derive(Clone, Copy)]
pub enum Mode<'a> {
    /// Evaluates the region on concrete global arrays.
    Eager { arguments: &'a [GlobalArray] },

    /// Batches the region. `batch_size` is the global batch size. When `spmd_axes` is provided, the batch dimension
    /// is additionally split over those mesh axes.
    Batch {
        transform: &'a dyn BodyTransform,
        batch_dimensions: &'a [Option<usize>],
        batch_size: usize,
        spmd_axes: Option<&'a [AxisName]>,
    },

    /// Forward-mode differentiation.
    Jvp { transform: &'a dyn BodyTransform, nonzero_tangents: &'a [bool] },

    /// Splits the region into a known and a staged part.
    PartialEval { known_inputs: &'a [bool] },

    /// Transposition with respect to the linear inputs.
    Transpose { transform: &'a dyn BodyTransform, linear_inputs: &'a [bool], nonzero_cotangents: &'a [bool] },

    /// Dead code elimination.
    Dce { used_outputs: &'a [bool] },
}

/// Result of [`ShardMapOp::process`].
#[derive(Clone, Debug)]
pub enum ModeOutput {
    Values(Vec<GlobalArray>),
    Batched { region: ShardMapOp, output_batch_dimensions: Vec<Option<usize>> },
    Jvp { region: ShardMapOp, nonzero_tangent_outputs: Vec<bool> },
    PartialEval { known: ShardMapOp, staged: ShardMapOp, known_outputs: Vec<bool>, residual_count: usize },
    Transposed { region: ShardMapOp, nonzero_input_cotangents: Vec<bool> },

    /// `region` is `None` when the region was dropped entirely.
    Pruned { region: Option<ShardMapOp>, used_inputs: Vec<bool> },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::{PartitionDimension, axis_set};
    use crate::mesh::MeshAxis;
    use crate::ops::{AddOp, AllGatherOp, PsumOp, PvaryOp, SinOp};
    use crate::replication::ReplicationError;
    use crate::types::{DataType, DivisibilityError, Shape};

    pub(super) fn mesh() -> AbstractMesh {
        AbstractMesh::new(vec![MeshAxis::new("x", 2).unwrap(), MeshAxis::new("y", 2).unwrap()]).unwrap()
    }

    pub(super) fn p(dimensions: &[Option<&str>]) -> PartitionSpec {
        PartitionSpec::new(
            dimensions
                .iter()
                .map(|dimension| match dimension {
                    Some(axis) => PartitionDimension::sharded(*axis),
                    None => PartitionDimension::unsharded(),
                })
                .collect(),
        )
    }

    pub(super) fn stage<F>(
        spec: &ShardMapSpec,
        input_types: &[ArrayType],
        body: F,
    ) -> Result<(Graph, ShardMapOp), Error>
    where
        F: FnOnce(&mut GraphBuilder, &[AtomId]) -> Result<Vec<Atom>, Error>,
    {
        let mut builder = GraphBuilder::new();
        let inputs = input_types.iter().map(|tpe| builder.add_variable(tpe.clone())).collect::<Vec<_>>();
        let atoms = inputs.iter().copied().map(Atom::from).collect::<Vec<_>>();
        let outputs = shard_map(&mut builder, spec, atoms.as_slice(), body)?;
        let graph = builder.build(inputs, outputs.into_iter().map(Atom::from).collect())?;
        let region = graph.equations()[0].op.as_any().downcast_ref::<ShardMapOp>().unwrap().clone();
        Ok((graph, region))
    }

    fn f32_matrix(rows: usize, columns: usize) -> ArrayType {
        ArrayType::new(DataType::Float32, Shape::of(&[rows, columns]))
    }

    #[test]
    fn test_shard_map_staging() {
        let in_specs = vec![p(&[Some("x"), None]), p(&[None, Some("y")])];
        let spec = ShardMapSpec::new(mesh(), in_specs, vec![p(&[Some("x"), Some("y")])]);
        let (graph, region) = stage(&spec, &[f32_matrix(4, 2), f32_matrix(2, 4)], |builder, inputs| {
            let outputs = builder.add_equation(AddOp, vec![inputs[0].into(), inputs[1].into()])?;
            Ok(outputs.into_iter().map(Atom::from).collect())
        })
        .unwrap();

        assert_eq!(graph.output_types().unwrap()[0].shape, Shape::of(&[4, 4]));
        assert_eq!(region.body.input_types()[0].shape, Shape::of(&[2, 2]));
        assert_eq!(region.body.input_types()[1].shape, Shape::of(&[2, 2]));
        assert_eq!(
            region.body.equations().iter().map(|equation| equation.op.to_string()).collect::<Vec<_>>(),
            vec!["pvary[axes=(y)]", "pvary[axes=(x)]", "add"],
        );
        assert_eq!(
            region.to_string(),
            "shard_map[mesh=(x=2, y=2), in_specs=({0: (x)}, {1: (y)}), out_specs=({0: (x), 1: (y)}), \
             check_replication=true, auto={}]",
        );
        assert!(graph.type_check().is_ok());
        let input_types = graph.input_types();
        let input_types = input_types.iter().collect::<Vec<_>>();
        assert!(region.type_check(input_types.as_slice()).is_ok());
    }

    #[test]
    fn test_shard_map_replication_errors() {
        let spec = ShardMapSpec::new(mesh(), vec![p(&[Some("x"), None])], vec![p(&[])]);
        let result = stage(&spec, &[f32_matrix(4, 2)], |builder, inputs| {
            Ok(builder.add_equation(SinOp, vec![inputs[0].into()])?.into_iter().map(Atom::from).collect())
        });
        assert!(matches!(
            result,
            Err(Error::Replication(ReplicationError::CannotProveOutputReplication { output: 0, .. })),
        ));

        let result = stage(&spec, &[f32_matrix(4, 2)], |builder, inputs| {
            let outputs = builder.add_equation(PsumOp::new(["x"]), vec![inputs[0].into()])?;
            Ok(outputs.into_iter().map(Atom::from).collect())
        });
        assert!(result.is_ok());

        let gather = |builder: &mut GraphBuilder, inputs: &[AtomId]| -> Result<Vec<Atom>, Error> {
            let op = AllGatherOp { axes: vec!["x".to_string()], dimension: 0, axis_size: 2 };
            Ok(builder.add_equation(op, vec![inputs[0].into()])?.into_iter().map(Atom::from).collect())
        };
        let spec = ShardMapSpec::new(mesh(), vec![p(&[None, None])], vec![p(&[])]);
        assert!(matches!(
            stage(&spec, &[f32_matrix(4, 2)], gather),
            Err(Error::Replication(ReplicationError::CannotProveOutputReplication { output: 0, missing, .. }))
                if missing == axis_set(["x"]),
        ));

        let spec = ShardMapSpec::new(mesh(), vec![p(&[None, None])], vec![p(&[Some("x")])]);
        let (_, region) = stage(&spec, &[f32_matrix(4, 2)], gather).unwrap();
        assert_eq!(
            region.body.equations().iter().map(|equation| equation.op.to_string()).collect::<Vec<_>>(),
            vec!["pvary[axes=(x)]", "all_gather[axes=(x), dimension=0]"],
        );

        let checked = spec.clone().with_config(ShardMapConfig::default().with_rewrite(false));
        assert!(matches!(
            stage(&checked, &[f32_matrix(4, 2)], gather),
            Err(Error::Replication(ReplicationError::ReplicatedCollectiveInput { op, .. })) if op == "all_gather",
        ));

        let unchecked = spec.with_config(ShardMapConfig::default().with_check_replication(false));
        let (_, region) = stage(&unchecked, &[f32_matrix(4, 2)], gather).unwrap();
        assert!(region.body.equations().iter().all(|equation| !equation.op.as_any().is::<PvaryOp>()));
    }

    #[test]
    fn test_shard_map_spec_errors() {
        let identity = |_: &mut GraphBuilder, inputs: &[AtomId]| -> Result<Vec<Atom>, Error> {
            Ok(vec![Atom::from(inputs[0])])
        };

        let spec = ShardMapSpec::new(mesh(), vec![p(&[Some("x"), None, None])], vec![p(&[])]);
        assert!(matches!(
            stage(&spec, &[f32_matrix(4, 2)], identity),
            Err(Error::Spec(SpecError::SpecTooLong { position, spec_rank: 3, rank: 2, .. }))
                if position == "argument #0",
        ));

        let spec = ShardMapSpec::new(mesh(), vec![p(&[Some("z"), None])], vec![p(&[])]);
        assert!(matches!(
            stage(&spec, &[f32_matrix(4, 2)], identity),
            Err(Error::Spec(SpecError::UnknownAxis { .. })),
        ));

        let spec = ShardMapSpec::new(mesh(), vec![p(&[None, Some("x")])], vec![p(&[None, Some("x")])]);
        assert!(matches!(
            stage(&spec, &[f32_matrix(4, 3)], identity),
            Err(Error::Divisibility(DivisibilityError::NotDivisible { dimension: 1, size: 3, product: 2, .. })),
        ));

        let spec = ShardMapSpec::new(mesh(), vec![p(&[])], vec![p(&[Some("x")])]);
        let scalar = ArrayType::scalar(DataType::Float32);
        assert!(matches!(
            stage(&spec, &[scalar.clone()], identity),
            Err(Error::Spec(SpecError::OutputRankTooSmall { output: 0, rank: 0, required_rank: 1, .. })),
        ));

        let spec = ShardMapSpec::new(mesh(), vec![p(&[])], vec![p(&[])])
            .with_config(ShardMapConfig::default().with_auto_axes(["z"]));
        assert!(matches!(stage(&spec, &[scalar], identity), Err(Error::Mesh(_))));
    }

    #[test]
    fn test_shard_map_lazy_out_specs() {
        let spec = ShardMapSpec::new(
            mesh(),
            vec![p(&[Some("x"), None])],
            OutSpecs::lazy(|types: &[ArrayType]| {
                types
                    .iter()
                    .map(|tpe| {
                        let mut dimensions = vec![None; tpe.rank()];
                        dimensions[0] = Some("x");
                        p(dimensions.as_slice())
                    })
                    .collect()
            }),
        );
        let (graph, region) = stage(&spec, &[f32_matrix(4, 2)], |builder, inputs| {
            Ok(builder.add_equation(SinOp, vec![inputs[0].into()])?.into_iter().map(Atom::from).collect())
        })
        .unwrap();
        assert_eq!(region.out_assignments, vec![AxisAssignment::replicated().with_dimension(0, ["x"])]);
        assert_eq!(graph.output_types().unwrap()[0].shape, Shape::of(&[4, 2]));
    }
}
