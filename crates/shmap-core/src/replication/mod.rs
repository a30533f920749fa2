//! Static replication analysis for the bodies of sharded regions.
//!
//! Every value inside a sharded region is either known to hold identical data on every device along some set of
//! manual mesh axes, or [`Replication::Unconstrained`] (literals). The analysis comes in two flavors:
//!
//!   - [`check_graph`] computes the replication of every output of a graph, failing when an operation receives
//!     inputs whose replication does not fit its semantics.
//!   - [`rewrite_graph`] and [`rewrite_graph_matching`] build a new graph in which `pvary` operations are inserted
//!     wherever values with different replication meet, so that every operation receives consistently typed inputs
//!     and the result stays correct under transposition.
//!
//! Both flavors dispatch on [`Op::name`] through a [`RuleRegistry`]. The registry is open: new operation kinds are
//! supported by registering a [`CheckRule`] and a [`RewriteRule`] for them.

use thiserror::Error;

use crate::{
    axes::{AxisName, AxisSet, Replication, in_mesh_order},
    graph::{Atom, GraphBuilder, GraphError, Op},
    mesh::AbstractMesh,
};

pub mod check;
pub mod collectives;
pub mod registry;
pub mod rewrite;
pub mod standard;
pub mod structural;

pub use check::{check_graph, check_output_replication};
pub use registry::{RegistryError, RuleKind, RuleRegistry};
pub use rewrite::{match_replication, rewrite_graph, rewrite_graph_matching};

/// Hint appended to every error that reports a failure to prove replication.
pub const ESCAPE_HATCH: &str =
    "if this is expected, the check can be disabled by setting `check_replication: false` for the sharded region";

/// Context shared by every rule invocation of a single analysis.
#[derive(Copy, Clone, Debug)]
pub struct Analysis<'a> {
    mesh: &'a AbstractMesh,
    auto: &'a AxisSet,
    registry: &'a RuleRegistry,
}

impl<'a> Analysis<'a> {
    pub fn new(mesh: &'a AbstractMesh, auto: &'a AxisSet, registry: &'a RuleRegistry) -> Self {
        Self { mesh, auto, registry }
    }

    pub fn mesh(&self) -> &'a AbstractMesh {
        self.mesh
    }

    pub fn auto(&self) -> &'a AxisSet {
        self.auto
    }

    pub fn registry(&self) -> &'a RuleRegistry {
        self.registry
    }

    /// Mesh axes that are manual in the analyzed region (i.e., every mesh axis that is not automatic).
    pub fn manual_axes(&self) -> AxisSet {
        self.mesh.axis_set().difference(self.auto).cloned().collect()
    }

    /// Returns `axes` in mesh order.
    pub fn in_mesh_order(&self, axes: &AxisSet) -> Vec<AxisName> {
        in_mesh_order(self.mesh, axes)
    }

    /// Resolves [`Replication::Unconstrained`] to all manual axes.
    pub fn resolve(&self, replication: &Replication) -> AxisSet {
        replication.resolve(&self.manual_axes())
    }
}

/// Rule computing the replication of the outputs of an operation from the replication of its inputs.
pub trait CheckRule: Send + Sync {
    /// Returns one [`Replication`] per output. `output_count` is the number of outputs of the checked equation.
    fn check(
        &self,
        analysis: &Analysis<'_>,
        op: &dyn Op,
        input_reps: &[Replication],
        output_count: usize,
    ) -> Result<Vec<Replication>, ReplicationError>;
}

impl<F> CheckRule for F
where
    F: Fn(&Analysis<'_>, &dyn Op, &[Replication], usize) -> Result<Vec<Replication>, ReplicationError> + Send + Sync,
{
    fn check(
        &self,
        analysis: &Analysis<'_>,
        op: &dyn Op,
        input_reps: &[Replication],
        output_count: usize,
    ) -> Result<Vec<Replication>, ReplicationError> {
        self(analysis, op, input_reps, output_count)
    }
}

/// Rule that emits an operation into a graph being rewritten, inserting `pvary` operations where needed.
pub trait RewriteRule: Send + Sync {
    /// Emits `op` applied to `inputs` (whose replication is `input_reps`) into `builder`, and returns its outputs
    /// along with their replication.
    fn rewrite(
        &self,
        analysis: &Analysis<'_>,
        builder: &mut GraphBuilder,
        op: &dyn Op,
        inputs: &[Atom],
        input_reps: &[AxisSet],
    ) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError>;
}

impl<F> RewriteRule for F
where
    F: Fn(
            &Analysis<'_>,
            &mut GraphBuilder,
            &dyn Op,
            &[Atom],
            &[AxisSet],
        ) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError>
        + Send
        + Sync,
{
    fn rewrite(
        &self,
        analysis: &Analysis<'_>,
        builder: &mut GraphBuilder,
        op: &dyn Op,
        inputs: &[Atom],
        input_reps: &[AxisSet],
    ) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
        self(analysis, builder, op, inputs, input_reps)
    }
}

fn format_reps(reps: &[Replication]) -> String {
    reps.iter().map(|rep| rep.to_string()).collect::<Vec<_>>().join(", ")
}

/// Error type for replication checking and rewriting.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ReplicationError {
    /// Error returned when no rule is registered for an operation kind.
    #[error(
        "no replication {kind} rule is registered for '{op}'; register one with the rule registry, or {hint}",
        hint = ESCAPE_HATCH
    )]
    MissingRule { op: String, kind: RuleKind },

    /// Error returned when an operation requires its inputs to have the same replication.
    #[error(
        "'{op}' requires the replication of its arguments to match, but got [{reps}]; {hint}",
        reps = format_reps(.reps),
        hint = ESCAPE_HATCH
    )]
    MismatchedReplication { op: String, reps: Vec<Replication> },

    /// Error returned when a collective is applied to a value of unknown replication.
    #[error(
        "collective '{op}' must be applied to a device-varying value, but got a value with unconstrained \
         replication; {hint}",
        hint = ESCAPE_HATCH
    )]
    UnconstrainedCollectiveInput { op: String },

    /// Error returned when a collective acts on mesh axes over which its input is already replicated.
    #[error(
        "collective '{op}' must be applied to a device-varying value, but got a value replicated over {axes} \
         (which the collective acts on); {hint}",
        axes = crate::axes::format_axis_set(.axes),
        hint = ESCAPE_HATCH
    )]
    ReplicatedCollectiveInput { op: String, axes: AxisSet },

    /// Error returned when `pvary` is applied to a value that does not vary over any of its axes.
    #[error(
        "'{op}' over {axes} requires a value that is replicated over at least one of those axes, but got a value \
         replicated over {input}; {hint}",
        axes = crate::axes::format_axis_set(.axes),
        input = crate::axes::format_axis_set(.input),
        hint = ESCAPE_HATCH
    )]
    NotReplicatedOver { op: String, axes: AxisSet, input: AxisSet },

    /// Error returned when a loop carry has different replication at the start and at the end of an iteration.
    #[error(
        "the carries of '{op}' have mismatched replication: [{carry_in}] at input and [{carry_out}] at output; {hint}",
        carry_in = format_reps(.carry_in),
        carry_out = format_reps(.carry_out),
        hint = ESCAPE_HATCH
    )]
    CarryMismatch { op: String, carry_in: Vec<Replication>, carry_out: Vec<Replication> },

    /// Error returned when the branches of a conditional produce outputs with different replication.
    #[error(
        "the branches of 'cond' produce mismatched replication: branch 0 produces [{expected}] but branch \
         {branch} produces [{got}]; {hint}",
        expected = format_reps(.expected),
        got = format_reps(.got),
        hint = ESCAPE_HATCH
    )]
    BranchMismatch { branch: usize, expected: Vec<Replication>, got: Vec<Replication> },

    /// Error returned when an output spec requires more replication than can be inferred for the output value.
    #[error(
        "out_specs[{output}] is {spec} which implies that the corresponding output value is replicated across mesh \
         axes {required}, but could only infer replication over {inferred}, which is missing the required axes \
         {missing}; check whether the output is meant to be replicated over those axes and, if not, revise the \
         output spec; otherwise, {hint}",
        required = crate::axes::format_axis_set(.required),
        inferred = crate::axes::format_axis_set(.inferred),
        missing = crate::axes::format_axis_set(.missing),
        hint = ESCAPE_HATCH
    )]
    CannotProveOutputReplication {
        output: usize,
        spec: String,
        required: AxisSet,
        inferred: AxisSet,
        missing: AxisSet,
    },

    /// Error returned when a rewritten output is declared to be replicated over axes it is not replicated over.
    #[error(
        "output {output} is required to be replicated over {declared}, but is only replicated over {inferred}; {hint}",
        declared = crate::axes::format_axis_set(.declared),
        inferred = crate::axes::format_axis_set(.inferred),
        hint = ESCAPE_HATCH
    )]
    RewriteMismatch { output: usize, declared: AxisSet, inferred: AxisSet },

    /// Internal error returned when loop carry replication does not stabilize.
    #[error(
        "internal error: the replication of the carries of '{op}' did not reach a fixpoint after {rounds} rounds; \
         please report this as a bug, and {hint} in the meantime",
        hint = ESCAPE_HATCH
    )]
    FixpointNotReached { op: String, rounds: usize },

    /// Internal error returned when a variable is read before its replication has been computed.
    #[error("internal error: the replication of variable %{id} was read before it was computed")]
    UnresolvedVariable { id: usize },

    /// Internal error returned when a rule is applied to an operation of an unexpected type.
    #[error("internal error: the replication rule for '{expected}' was applied to '{op}'")]
    UnexpectedOp { op: String, expected: &'static str },

    #[error("{0}")]
    Graph(#[from] GraphError),
}

/// Downcasts `op` to the concrete type handled by a rule.
pub(crate) fn downcast<'o, T: Op>(op: &'o dyn Op, expected: &'static str) -> Result<&'o T, ReplicationError> {
    op.as_any().downcast_ref::<T>().ok_or_else(|| ReplicationError::UnexpectedOp { op: op.to_string(), expected })
}
