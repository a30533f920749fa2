use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, hash_map::Entry};
use std::fmt::{Debug, Display};

use dyn_clone::{DynClone, clone_trait_object};
use thiserror::Error;

use crate::axes::{AxisName, AxisSet, SpecError};
use crate::mesh::{AbstractMesh, MeshError};
use crate::replication::ReplicationError;
use crate::types::{ArrayType, DataType, DivisibilityError};
use crate::values::{HostArray, ValueError};

pub type AtomId = usize;

#[derive(Clone, Debug, PartialEq)]
pub struct Constant {
    pub id: AtomId,
    pub value: HostArray,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Variable {
    pub id: AtomId,
    pub tpe: ArrayType,
}

/// Scalar constant inlined into an equation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Literal {
    pub value: f64,
    pub data_type: DataType,
}

impl Literal {
    pub fn tpe(&self) -> ArrayType {
        ArrayType::scalar(self.data_type)
    }
}

/// Operand of an [`Equation`] or output of a [`Graph`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Atom {
    Variable(AtomId),
    Literal(Literal),
}

impl Atom {
    pub fn literal(value: f64, data_type: DataType) -> Self {
        Self::Literal(Literal { value, data_type })
    }

    /// Returns the variable this atom refers to, if it is not a literal.
    pub fn variable(&self) -> Option<AtomId> {
        match self {
            Self::Variable(id) => Some(*id),
            Self::Literal(_) => None,
        }
    }
}

impl From<AtomId> for Atom {
    fn from(id: AtomId) -> Self {
        Self::Variable(id)
    }
}

impl Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Variable(id) => write!(f, "%{id}"),
            Self::Literal(literal) => write!(f, "{}:{}", literal.value, literal.data_type),
        }
    }
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// Operation kind appearing in a [`Graph`].
///
/// Operation parameters are fields of the implementing type. Replication rules are looked up by [`Op::name`], so two
/// different implementations must never share a name.
pub trait Op: Display + DynClone + Send + Sync + 'static {
    /// Name of the operation kind (e.g., `"add"` or `"psum"`).
    fn name(&self) -> &'static str;

    /// Type checks the operation's inputs and returns the types of its outputs.
    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError>;

    /// Evaluates this operation in lockstep over every device of `context`. `inputs[i][d]` is the value of the
    /// `i`-th input on device `d`, and the result is indexed the same way.
    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError>;

    /// Graphs owned by this operation.
    fn sub_graphs(&self) -> Vec<&Graph> {
        Vec::new()
    }

    /// Returns `true` if this operation must not be removed even when none of its outputs are used.
    fn has_effects(&self) -> bool {
        self.sub_graphs().iter().any(|graph| graph.has_effects())
    }

    /// Mesh axes a collective acts on, or `None` for non-collective operations.
    fn collective_axes(&self) -> Option<&[AxisName]> {
        None
    }

    /// Returns a copy of this operation that only produces the used outputs, along with a mask of the inputs the
    /// copy still reads. `None` means the operation cannot be pruned and is kept whole.
    fn prune(&self, used_outputs: &[bool]) -> Result<Option<(Box<dyn Op>, Vec<bool>)>, GraphError> {
        let _ = used_outputs;
        Ok(None)
    }

    fn as_any(&self) -> &dyn Any;
}

impl Debug for dyn Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

clone_trait_object!(Op);

#[macro_export]
macro_rules! assert_input_count_matches {
    ($op:expr, $input_count:expr, $expected_input_count:expr) => {
        let input_count = $input_count;
        let expected_input_count = $expected_input_count;
        if input_count != expected_input_count {
            return Err($crate::graph::GraphError::InvalidInputCount {
                op: $op.to_string(),
                expected: expected_input_count,
                got: input_count,
            }
            .into());
        }
    };
}

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Kind of numeric fault detected while evaluating a graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NumericFault {
    Nan,
    Inf,
    DivisionByZero,
}

impl Display for NumericFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nan => write!(f, "invalid value (nan)"),
            Self::Inf => write!(f, "invalid value (inf)"),
            Self::DivisionByZero => write!(f, "integer division by zero"),
        }
    }
}

/// Devices and mesh axes a graph is evaluated over.
///
/// At the top level there is a single device and no manual axes. Inside a sharded region there is one device per
/// mesh position, and collectives communicate over the manual axes.
#[derive(Clone, Debug)]
pub struct EvalContext<'a> {
    mesh: Option<&'a AbstractMesh>,
    manual_axes: AxisSet,
    device_count: usize,
    debug_nans: bool,
    debug_infs: bool,
}

impl<'a> EvalContext<'a> {
    /// Creates a single-device context.
    pub fn host() -> Self {
        Self { mesh: None, manual_axes: AxisSet::new(), device_count: 1, debug_nans: false, debug_infs: false }
    }

    /// Creates a context with one device per position of `mesh`, where `manual_axes` can be used by collectives.
    pub fn spmd(mesh: &'a AbstractMesh, manual_axes: AxisSet) -> Result<Self, EvalError> {
        let device_count = mesh.device_count()?;
        Ok(Self { mesh: Some(mesh), manual_axes, device_count, debug_nans: false, debug_infs: false })
    }

    /// Returns a copy of this context with numeric fault detection configured.
    pub fn with_numeric_checks(mut self, debug_nans: bool, debug_infs: bool) -> Self {
        self.debug_nans = debug_nans;
        self.debug_infs = debug_infs;
        self
    }

    pub fn mesh(&self) -> Option<&'a AbstractMesh> {
        self.mesh
    }

    pub fn manual_axes(&self) -> &AxisSet {
        &self.manual_axes
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn debug_nans(&self) -> bool {
        self.debug_nans
    }

    pub fn debug_infs(&self) -> bool {
        self.debug_infs
    }

    fn manual_mesh(&self, axes: &[AxisName]) -> Result<&'a AbstractMesh, EvalError> {
        let mesh = self.mesh.ok_or_else(|| EvalError::UnboundAxis { axis: axes.join(", ") })?;
        match axes.iter().find(|axis| !self.manual_axes.contains(*axis)) {
            Some(axis) => Err(EvalError::UnboundAxis { axis: axis.clone() }),
            None => Ok(mesh),
        }
    }

    /// Returns the position of `device` along `axes`, as a row-major index over those axes in the given order.
    pub fn axis_position(&self, device: usize, axes: &[AxisName]) -> Result<usize, EvalError> {
        let mesh = self.manual_mesh(axes)?;
        let coordinate = mesh.coordinate_for_device_index(device);
        Ok(axes.iter().fold(0, |position, axis| {
            let index = mesh.axis_index(axis).unwrap_or_default();
            position * mesh.axes()[index].size() + coordinate[index]
        }))
    }

    /// Partitions the devices into groups that communicate over `axes`. Devices in a group share their coordinates
    /// on every other axis and are ordered by [`EvalContext::axis_position`].
    pub fn groups(&self, axes: &[AxisName]) -> Result<Vec<Vec<usize>>, EvalError> {
        let mesh = self.manual_mesh(axes)?;
        let mut groups = BTreeMap::<Vec<usize>, Vec<(usize, usize)>>::new();
        for device in 0..self.device_count {
            let mut key = mesh.coordinate_for_device_index(device);
            for axis in axes {
                if let Some(index) = mesh.axis_index(axis) {
                    key[index] = 0;
                }
            }
            let position = self.axis_position(device, axes)?;
            groups.entry(key).or_default().push((position, device));
        }
        Ok(groups
            .into_values()
            .map(|mut group| {
                group.sort_unstable();
                group.into_iter().map(|(_, device)| device).collect()
            })
            .collect())
    }

    fn check_numerics(&self, op: &dyn Op, outputs: &[Vec<HostArray>]) -> Result<(), EvalError> {
        if !self.debug_nans && !self.debug_infs {
            return Ok(());
        }
        for value in outputs.iter().flatten() {
            if self.debug_nans && value.has_nan() {
                return Err(EvalError::NumericFault { op: op.name().to_string(), kind: NumericFault::Nan });
            }
            if self.debug_infs && value.has_inf() {
                return Err(EvalError::NumericFault { op: op.name().to_string(), kind: NumericFault::Inf });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graphs
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Equation {
    pub op: Box<dyn Op>,
    pub inputs: Vec<Atom>,
    pub outputs: Vec<Variable>,
}

impl Display for Equation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outputs = self.outputs.iter().map(|output| format!("%{}:{}", output.id, output.tpe)).collect::<Vec<_>>();
        let inputs = self.inputs.iter().map(|input| input.to_string()).collect::<Vec<_>>();
        write!(f, "{} = {} {}", outputs.join(", "), self.op, inputs.join(" "))
    }
}

/// Immutable graph of [`Equation`]s in topological order.
#[derive(Clone, Debug)]
pub struct Graph {
    inputs: Vec<Variable>,
    constants: Vec<Constant>,
    equations: Vec<Equation>,
    outputs: Vec<Atom>,
}

/// Result of [`Graph::partial_eval`].
#[derive(Clone, Debug)]
pub struct PartialEvalGraphs {
    /// Graph over the known inputs, returning the known outputs followed by the residuals.
    pub known: Graph,
    /// Graph over the residuals followed by the unknown inputs, returning the unknown outputs.
    pub staged: Graph,
    /// Which outputs of the original graph are produced by `known`.
    pub known_outputs: Vec<bool>,
    /// Number of residuals passed from `known` to `staged`.
    pub residual_count: usize,
}

impl Graph {
    pub fn inputs(&self) -> &[Variable] {
        self.inputs.as_slice()
    }

    pub fn constants(&self) -> &[Constant] {
        self.constants.as_slice()
    }

    pub fn equations(&self) -> &[Equation] {
        self.equations.as_slice()
    }

    pub fn outputs(&self) -> &[Atom] {
        self.outputs.as_slice()
    }

    #[inline]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    #[inline]
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_types(&self) -> Vec<ArrayType> {
        self.inputs.iter().map(|input| input.tpe.clone()).collect()
    }

    /// Returns the types of every atom bound in this graph.
    pub fn atom_types(&self) -> HashMap<AtomId, ArrayType> {
        let mut types = HashMap::new();
        types.extend(self.inputs.iter().map(|input| (input.id, input.tpe.clone())));
        types.extend(self.constants.iter().map(|constant| (constant.id, constant.value.array_type())));
        for equation in &self.equations {
            types.extend(equation.outputs.iter().map(|output| (output.id, output.tpe.clone())));
        }
        types
    }

    pub fn output_types(&self) -> Result<Vec<ArrayType>, GraphError> {
        let types = self.atom_types();
        self.outputs
            .iter()
            .map(|output| match output {
                Atom::Variable(id) => types.get(id).cloned().ok_or(GraphError::UnboundAtomId { id: *id }),
                Atom::Literal(literal) => Ok(literal.tpe()),
            })
            .collect()
    }

    /// Returns `true` if any equation, including those of nested graphs, has effects.
    pub fn has_effects(&self) -> bool {
        self.equations.iter().any(|equation| equation.op.has_effects())
    }

    /// Performs type checking for this [`Graph`] and its nested graphs.
    pub fn type_check(&self) -> Result<(), GraphError> {
        let mut atom_types = HashMap::new();
        for input in &self.inputs {
            match atom_types.entry(input.id) {
                Entry::Occupied(_) => return Err(GraphError::DuplicateAtomId { id: input.id }),
                Entry::Vacant(entry) => _ = entry.insert(input.tpe.clone()),
            }
        }
        for constant in &self.constants {
            match atom_types.entry(constant.id) {
                Entry::Occupied(_) => return Err(GraphError::DuplicateAtomId { id: constant.id }),
                Entry::Vacant(entry) => _ = entry.insert(constant.value.array_type()),
            }
        }

        for equation in &self.equations {
            for graph in equation.op.sub_graphs() {
                graph.type_check()?;
            }
            let input_types = equation
                .inputs
                .iter()
                .map(|input| match input {
                    Atom::Variable(id) => atom_types.get(id).cloned().ok_or(GraphError::UnboundAtomId { id: *id }),
                    Atom::Literal(literal) => Ok(literal.tpe()),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let input_types = input_types.iter().collect::<Vec<_>>();
            let output_types = equation.op.infer_output_types(input_types.as_slice())?;
            if output_types.len() != equation.outputs.len() {
                return Err(GraphError::InvalidOutputCount {
                    op: equation.op.to_string(),
                    expected: output_types.len(),
                    got: equation.outputs.len(),
                });
            }
            for (output, output_type) in equation.outputs.iter().zip(output_types) {
                if !output_type.is_compatible_with(&output.tpe) {
                    return Err(GraphError::InvalidAtomType {
                        id: output.id,
                        expected: output.tpe.to_string(),
                        got: output_type.to_string(),
                    });
                }
                match atom_types.entry(output.id) {
                    Entry::Occupied(_) => return Err(GraphError::DuplicateAtomId { id: output.id }),
                    Entry::Vacant(entry) => _ = entry.insert(output_type),
                }
            }
        }

        for output in &self.outputs {
            if let Atom::Variable(id) = output {
                if !atom_types.contains_key(id) {
                    return Err(GraphError::UnboundAtomId { id: *id });
                }
            }
        }
        Ok(())
    }

    /// Evaluates this graph in lockstep over the devices of `context`. `inputs[i][d]` is the value of the `i`-th
    /// input on device `d`.
    pub fn evaluate(
        &self,
        context: &EvalContext<'_>,
        inputs: Vec<Vec<HostArray>>,
    ) -> Result<Vec<Vec<HostArray>>, EvalError> {
        if inputs.len() != self.inputs.len() {
            return Err(EvalError::InvalidInputCount { expected: self.inputs.len(), got: inputs.len() });
        }
        let device_count = context.device_count();
        let mut environment = HashMap::<AtomId, Vec<HostArray>>::new();
        for (variable, values) in self.inputs.iter().zip(inputs) {
            if values.len() != device_count {
                return Err(EvalError::InvalidDeviceCount { expected: device_count, got: values.len() });
            }
            environment.insert(variable.id, values);
        }
        for constant in &self.constants {
            environment.insert(constant.id, vec![constant.value.clone(); device_count]);
        }

        let read = |environment: &HashMap<AtomId, Vec<HostArray>>, atom: &Atom| match atom {
            Atom::Variable(id) => {
                environment.get(id).cloned().ok_or(EvalError::Graph(GraphError::UnboundAtomId { id: *id }))
            }
            Atom::Literal(literal) => Ok(vec![HostArray::scalar(literal.data_type, literal.value); device_count]),
        };

        for equation in &self.equations {
            let values = equation.inputs.iter().map(|input| read(&environment, input)).collect::<Result<Vec<_>, _>>()?;
            let values = values.iter().map(Vec::as_slice).collect::<Vec<_>>();
            let outputs = equation.op.evaluate(context, values.as_slice())?;
            if outputs.len() != equation.outputs.len() {
                return Err(EvalError::Graph(GraphError::InvalidOutputCount {
                    op: equation.op.to_string(),
                    expected: equation.outputs.len(),
                    got: outputs.len(),
                }));
            }
            context.check_numerics(equation.op.as_ref(), outputs.as_slice())?;
            for (variable, values) in equation.outputs.iter().zip(outputs) {
                environment.insert(variable.id, values);
            }
        }

        self.outputs.iter().map(|output| read(&environment, output)).collect()
    }

    /// Interprets this graph on a single host device. This is a slow path meant for debugging and testing.
    pub fn interpret(&self, inputs: &[HostArray]) -> Result<Vec<HostArray>, EvalError> {
        self.interpret_with(&EvalContext::host(), inputs)
    }

    /// Interprets this graph on a single host device using the numeric checks configured in `context`.
    pub fn interpret_with(&self, context: &EvalContext<'_>, inputs: &[HostArray]) -> Result<Vec<HostArray>, EvalError> {
        self.type_check()?;
        if inputs.len() != self.inputs.len() {
            return Err(EvalError::InvalidInputCount { expected: self.inputs.len(), got: inputs.len() });
        }
        for (index, (variable, value)) in self.inputs.iter().zip(inputs).enumerate() {
            if !value.array_type().is_compatible_with(&variable.tpe) {
                return Err(EvalError::InvalidInputType {
                    index,
                    expected: variable.tpe.to_string(),
                    got: value.array_type().to_string(),
                });
            }
        }
        let inputs = inputs.iter().map(|value| vec![value.clone()]).collect();
        let outputs = self.evaluate(context, inputs)?;
        Ok(outputs.into_iter().filter_map(|values| values.into_iter().next()).collect())
    }

    /// Removes equations that do not contribute to the used outputs and have no effects.
    ///
    /// Returns the pruned graph, which only has the used outputs and the inputs that are still read, together with
    /// a mask of the inputs that are still read.
    pub fn dead_code_elimination(&self, used_outputs: &[bool]) -> Result<(Graph, Vec<bool>), GraphError> {
        if used_outputs.len() != self.outputs.len() {
            return Err(GraphError::InvalidOutputCount {
                op: "dead code elimination".to_string(),
                expected: self.outputs.len(),
                got: used_outputs.len(),
            });
        }
        let mut live = self
            .outputs
            .iter()
            .zip(used_outputs)
            .filter_map(|(output, used)| if *used { output.variable() } else { None })
            .collect::<HashSet<_>>();

        let mut equations = Vec::with_capacity(self.equations.len());
        for equation in self.equations.iter().rev() {
            let used = equation.outputs.iter().map(|output| live.contains(&output.id)).collect::<Vec<_>>();
            if !used.iter().any(|used| *used) && !equation.op.has_effects() {
                continue;
            }
            let equation = match equation.op.prune(used.as_slice())? {
                Some((op, used_inputs)) => Equation {
                    op,
                    inputs: equation
                        .inputs
                        .iter()
                        .zip(used_inputs)
                        .filter_map(|(input, used)| used.then_some(*input))
                        .collect(),
                    outputs: equation
                        .outputs
                        .iter()
                        .zip(used.iter())
                        .filter_map(|(output, used)| used.then(|| output.clone()))
                        .collect(),
                },
                None => equation.clone(),
            };
            live.extend(equation.inputs.iter().filter_map(Atom::variable));
            equations.push(equation);
        }
        equations.reverse();

        let used_inputs = self.inputs.iter().map(|input| live.contains(&input.id)).collect::<Vec<_>>();
        let graph = Graph {
            inputs: self.inputs.iter().filter(|input| live.contains(&input.id)).cloned().collect(),
            constants: self.constants.iter().filter(|constant| live.contains(&constant.id)).cloned().collect(),
            equations,
            outputs: self
                .outputs
                .iter()
                .zip(used_outputs)
                .filter_map(|(output, used)| used.then_some(*output))
                .collect(),
        };
        Ok((graph, used_inputs))
    }

    /// Splits this graph into a part that only depends on the known inputs and a staged part for the rest.
    ///
    /// Equations with effects are always staged. Known variables read by staged equations become residuals.
    pub fn partial_eval(&self, known_inputs: &[bool]) -> Result<PartialEvalGraphs, GraphError> {
        if known_inputs.len() != self.inputs.len() {
            return Err(GraphError::InvalidInputCount {
                op: "partial evaluation".to_string(),
                expected: self.inputs.len(),
                got: known_inputs.len(),
            });
        }
        let types = self.atom_types();
        let mut known = self
            .inputs
            .iter()
            .zip(known_inputs)
            .filter_map(|(input, known)| known.then_some(input.id))
            .chain(self.constants.iter().map(|constant| constant.id))
            .collect::<HashSet<_>>();
        let is_known = |known: &HashSet<AtomId>, atom: &Atom| atom.variable().is_none_or(|id| known.contains(&id));

        let mut known_equations = Vec::new();
        let mut staged_equations = Vec::new();
        let mut residuals = Vec::<AtomId>::new();
        for equation in &self.equations {
            if !equation.op.has_effects() && equation.inputs.iter().all(|input| is_known(&known, input)) {
                known.extend(equation.outputs.iter().map(|output| output.id));
                known_equations.push(equation.clone());
            } else {
                staged_equations.push(equation.clone());
            }
        }
        let constant_ids = self.constants.iter().map(|constant| constant.id).collect::<HashSet<_>>();
        for equation in &staged_equations {
            for id in equation.inputs.iter().filter_map(Atom::variable) {
                if known.contains(&id) && !constant_ids.contains(&id) && !residuals.contains(&id) {
                    residuals.push(id);
                }
            }
        }

        let known_outputs = self.outputs.iter().map(|output| is_known(&known, output)).collect::<Vec<_>>();
        let residual_variables = residuals
            .iter()
            .map(|id| types.get(id).cloned().map(|tpe| Variable { id: *id, tpe }))
            .collect::<Option<Vec<_>>>()
            .ok_or(GraphError::UnboundAtomId { id: residuals.first().copied().unwrap_or_default() })?;

        let known_graph = Graph {
            inputs: self.inputs.iter().zip(known_inputs).filter_map(|(input, k)| k.then(|| input.clone())).collect(),
            constants: self.constants.clone(),
            equations: known_equations,
            outputs: self
                .outputs
                .iter()
                .zip(known_outputs.iter())
                .filter_map(|(output, k)| k.then_some(*output))
                .chain(residuals.iter().map(|id| Atom::Variable(*id)))
                .collect(),
        };
        let staged_graph = Graph {
            inputs: residual_variables
                .into_iter()
                .chain(self.inputs.iter().zip(known_inputs).filter_map(|(input, k)| (!k).then(|| input.clone())))
                .collect(),
            constants: self.constants.clone(),
            equations: staged_equations,
            outputs: self
                .outputs
                .iter()
                .zip(known_outputs.iter())
                .filter_map(|(output, k)| (!k).then_some(*output))
                .collect(),
        };
        Ok(PartialEvalGraphs {
            known: known_graph,
            staged: staged_graph,
            known_outputs,
            residual_count: residuals.len(),
        })
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs = self
            .inputs
            .iter()
            .map(|input| format!("%{}:{}", input.id, input.tpe))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "lambda {inputs} .")?;
        for (index, equation) in self.equations.iter().enumerate() {
            let prefix = if index == 0 { "let" } else { "   " };
            writeln!(f, "{prefix} {equation}")?;
        }
        let outputs = self.outputs.iter().map(|output| output.to_string()).collect::<Vec<_>>().join(", ");
        write!(f, "in ({outputs})")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incrementally constructs a [`Graph`]. Every added equation is type checked immediately.
#[derive(Clone, Debug, Default)]
pub struct GraphBuilder {
    constants: Vec<Constant>,
    free_variables: Vec<Variable>,
    equations: Vec<Equation>,
    atom_types: HashMap<AtomId, ArrayType>,
    atom_count: usize,
}

impl GraphBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the type of `atom`.
    pub fn atom_type(&self, atom: &Atom) -> Result<ArrayType, GraphError> {
        match atom {
            Atom::Variable(id) => self.atom_types.get(id).cloned().ok_or(GraphError::UnboundAtomId { id: *id }),
            Atom::Literal(literal) => Ok(literal.tpe()),
        }
    }

    #[inline]
    pub fn add_constant(&mut self, value: HostArray) -> AtomId {
        let id = self.atom_count;
        self.atom_types.insert(id, value.array_type());
        self.atom_count += 1;
        self.constants.push(Constant { id, value });
        id
    }

    /// Adds a free variable, which must be listed as an input when the graph is built.
    #[inline]
    pub fn add_variable(&mut self, tpe: ArrayType) -> AtomId {
        let id = self.fresh_id(tpe.clone());
        self.free_variables.push(Variable { id, tpe });
        id
    }

    fn fresh_id(&mut self, tpe: ArrayType) -> AtomId {
        let id = self.atom_count;
        self.atom_types.insert(id, tpe);
        self.atom_count += 1;
        id
    }

    #[inline]
    pub fn add_equation<O: Op>(&mut self, op: O, inputs: Vec<Atom>) -> Result<Vec<AtomId>, GraphError> {
        self.add_boxed_equation(Box::new(op), inputs)
    }

    /// Adds an equation for an op that produces exactly one output, and returns that output.
    pub fn add_single_output_equation<O: Op>(&mut self, op: O, inputs: Vec<Atom>) -> Result<AtomId, GraphError> {
        let name = op.to_string();
        match self.add_equation(op, inputs)?.as_slice() {
            [output] => Ok(*output),
            outputs => Err(GraphError::InvalidOutputCount { op: name, expected: 1, got: outputs.len() }),
        }
    }

    pub fn add_boxed_equation(&mut self, op: Box<dyn Op>, inputs: Vec<Atom>) -> Result<Vec<AtomId>, GraphError> {
        let input_types = inputs.iter().map(|input| self.atom_type(input)).collect::<Result<Vec<_>, _>>()?;
        let input_types = input_types.iter().collect::<Vec<_>>();
        let output_types = op.infer_output_types(input_types.as_slice())?;
        let outputs = output_types
            .into_iter()
            .map(|tpe| Variable { id: self.fresh_id(tpe.clone()), tpe })
            .collect::<Vec<_>>();
        let ids = outputs.iter().map(|output| output.id).collect();
        self.equations.push(Equation { op, inputs, outputs });
        Ok(ids)
    }

    /// Finishes the graph. `inputs` must be free variables of this builder, and every free variable that is read
    /// must be one of `inputs`.
    pub fn build(self, inputs: Vec<AtomId>, outputs: Vec<Atom>) -> Result<Graph, GraphError> {
        let free_variables = self.free_variables.into_iter().map(|v| (v.id, v)).collect::<HashMap<_, _>>();
        let mut input_variables = Vec::with_capacity(inputs.len());
        let mut bound = HashSet::with_capacity(inputs.len());
        for id in inputs {
            let variable = free_variables.get(&id).ok_or(GraphError::NotAFreeVariable { id })?;
            if !bound.insert(id) {
                return Err(GraphError::DuplicateAtomId { id });
            }
            input_variables.push(variable.clone());
        }

        let reads = self
            .equations
            .iter()
            .flat_map(|equation| equation.inputs.iter())
            .chain(outputs.iter())
            .filter_map(Atom::variable);
        for id in reads {
            if free_variables.contains_key(&id) && !bound.contains(&id) {
                return Err(GraphError::UnboundAtomId { id });
            }
            if !self.atom_types.contains_key(&id) {
                return Err(GraphError::UnboundAtomId { id });
            }
        }

        Ok(Graph { inputs: input_variables, constants: self.constants, equations: self.equations, outputs })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid number of inputs for {op}; got {got} but expected {expected}")]
    InvalidInputCount { op: String, expected: usize, got: usize },

    #[error("invalid number of outputs for {op}; got {got} but expected {expected}")]
    InvalidOutputCount { op: String, expected: usize, got: usize },

    #[error("unbound atom id: {id}")]
    UnboundAtomId { id: AtomId },

    #[error("duplicate atom id: {id}")]
    DuplicateAtomId { id: AtomId },

    #[error("atom id {id} is not a free variable and cannot be a graph input")]
    NotAFreeVariable { id: AtomId },

    #[error("invalid type for atom {id}; got {got} but expected {expected}")]
    InvalidAtomType { id: AtomId, expected: String, got: String },

    #[error("incompatible input types for {op}: {types}")]
    IncompatibleTypes { op: String, types: String },

    #[error("invalid parameter for {op}: {message}")]
    InvalidParameter { op: String, message: String },

    #[error("{0}")]
    Divisibility(#[from] DivisibilityError),

    #[error("{0}")]
    Spec(#[from] SpecError),
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum EvalError {
    #[error("invalid number of inputs; got {got} but expected {expected}")]
    InvalidInputCount { expected: usize, got: usize },

    #[error("invalid number of per-device values; got {got} but expected {expected}")]
    InvalidDeviceCount { expected: usize, got: usize },

    #[error("invalid type for input #{index}; got {got} but expected {expected}")]
    InvalidInputType { index: usize, expected: String, got: String },

    #[error("{kind} encountered in {op}")]
    NumericFault { op: String, kind: NumericFault },

    #[error("unbound axis name: {axis}; collectives may only act on manual axes of an enclosing sharded region")]
    UnboundAxis { axis: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Value(#[from] ValueError),

    #[error("{0}")]
    Mesh(#[from] MeshError),

    #[error("{0}")]
    Spec(#[from] SpecError),

    #[error("{0}")]
    Divisibility(#[from] DivisibilityError),

    #[error("{0}")]
    Replication(#[from] ReplicationError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mesh::MeshAxis;
    use crate::ops::{AddOp, DebugCallbackOp, MulOp, NegOp, SinOp};
    use crate::types::Shape;

    fn f32_vector(size: usize) -> ArrayType {
        ArrayType::new(DataType::Float32, Shape::of(&[size]))
    }

    fn vector(values: &[f64]) -> HostArray {
        HostArray::new(DataType::Float32, vec![values.len()], values.to_vec()).unwrap()
    }

    /// Builds `lambda x, y . (neg (sin x), mul x y)`.
    fn test_graph() -> Graph {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(3));
        let y = builder.add_variable(f32_vector(3));
        let s = builder.add_equation(SinOp, vec![x.into()]).unwrap()[0];
        let n = builder.add_equation(NegOp, vec![s.into()]).unwrap()[0];
        let m = builder.add_equation(MulOp, vec![x.into(), y.into()]).unwrap()[0];
        builder.build(vec![x, y], vec![n.into(), m.into()]).unwrap()
    }

    #[test]
    fn test_builder_and_type_check() {
        let graph = test_graph();
        assert!(graph.type_check().is_ok());
        assert_eq!(graph.input_count(), 2);
        assert_eq!(graph.output_types().unwrap(), vec![f32_vector(3), f32_vector(3)]);
        assert_eq!(
            graph.to_string(),
            "lambda %0:f32[3], %1:f32[3] .\nlet %2:f32[3] = sin %0\n    %3:f32[3] = neg %2\n    \
             %4:f32[3] = mul %0 %1\nin (%3, %4)",
        );
    }

    #[test]
    fn test_builder_rejects_unbound_inputs() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(3));
        let y = builder.add_variable(f32_vector(3));
        let z = builder.add_equation(AddOp, vec![x.into(), y.into()]).unwrap()[0];
        assert!(matches!(
            builder.clone().build(vec![x], vec![z.into()]),
            Err(GraphError::UnboundAtomId { id }) if id == y,
        ));
        assert!(matches!(builder.clone().build(vec![z], vec![z.into()]), Err(GraphError::NotAFreeVariable { .. })));
        assert!(matches!(builder.build(vec![x, x, y], vec![z.into()]), Err(GraphError::DuplicateAtomId { .. })));
    }

    #[test]
    fn test_builder_single_output_equations() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(3));
        let s = builder.add_single_output_equation(SinOp, vec![x.into()]).unwrap();
        assert_eq!(builder.atom_type(&s.into()).unwrap(), f32_vector(3));
        assert_eq!(
            builder.add_single_output_equation(DebugCallbackOp::new("x"), vec![x.into()]),
            Err(GraphError::InvalidOutputCount { op: "debug_callback[label=x]".to_string(), expected: 1, got: 0 }),
        );
    }

    #[test]
    fn test_builder_rejects_incompatible_types() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(3));
        let y = builder.add_variable(f32_vector(2));
        assert!(matches!(
            builder.add_equation(AddOp, vec![x.into(), y.into()]),
            Err(GraphError::IncompatibleTypes { .. }),
        ));
    }

    #[test]
    fn test_interpret() {
        let graph = test_graph();
        let outputs = graph.interpret(&[vector(&[0.0, 1.0, 2.0]), vector(&[3.0, 4.0, 5.0])]).unwrap();
        assert_eq!(outputs[1].data(), &[0.0, 4.0, 10.0]);
        assert_eq!(outputs[0].data()[0], 0.0);
        assert!(matches!(
            graph.interpret(&[vector(&[1.0])]),
            Err(EvalError::InvalidInputCount { expected: 2, got: 1 }),
        ));
        assert!(matches!(
            graph.interpret(&[vector(&[1.0]), vector(&[1.0])]),
            Err(EvalError::InvalidInputType { index: 0, .. }),
        ));
    }

    #[test]
    fn test_interpret_detects_nans() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(1));
        let y = builder.add_equation(MulOp, vec![x.into(), Atom::literal(0.0, DataType::Float32)]).unwrap()[0];
        let graph = builder.build(vec![x], vec![y.into()]).unwrap();
        let inputs = [vector(&[f64::INFINITY])];
        assert!(graph.interpret(&inputs).unwrap()[0].has_nan());
        let context = EvalContext::host().with_numeric_checks(true, false);
        assert!(matches!(
            graph.interpret_with(&context, &inputs),
            Err(EvalError::NumericFault { op, kind: NumericFault::Nan }) if op == "mul",
        ));
    }

    #[test]
    fn test_dead_code_elimination() {
        let graph = test_graph();
        let (pruned, used_inputs) = graph.dead_code_elimination(&[true, false]).unwrap();
        assert_eq!(used_inputs, vec![true, false]);
        assert_eq!(pruned.equations().len(), 2);
        assert_eq!(pruned.output_count(), 1);
        assert!(pruned.type_check().is_ok());

        let (pruned, used_inputs) = graph.dead_code_elimination(&[false, false]).unwrap();
        assert_eq!(used_inputs, vec![false, false]);
        assert!(pruned.equations().is_empty());
    }

    #[test]
    fn test_dead_code_elimination_keeps_effects() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_variable(f32_vector(3));
        builder.add_equation(DebugCallbackOp::new("print"), vec![x.into()]).unwrap();
        let y = builder.add_equation(NegOp, vec![x.into()]).unwrap()[0];
        let graph = builder.build(vec![x], vec![y.into()]).unwrap();
        assert!(graph.has_effects());
        let (pruned, used_inputs) = graph.dead_code_elimination(&[false]).unwrap();
        assert_eq!(used_inputs, vec![true]);
        assert_eq!(pruned.equations().len(), 1);
        assert_eq!(pruned.equations()[0].op.name(), "debug_callback");
    }

    #[test]
    fn test_partial_eval() {
        let graph = test_graph();
        let split = graph.partial_eval(&[true, false]).unwrap();
        assert_eq!(split.known_outputs, vec![true, false]);
        assert_eq!(split.residual_count, 1);
        assert_eq!(split.known.input_count(), 1);
        assert_eq!(split.known.output_count(), 2);
        assert_eq!(split.staged.input_count(), 2);
        assert_eq!(split.staged.output_count(), 1);
        assert!(split.known.type_check().is_ok());
        assert!(split.staged.type_check().is_ok());

        let x = vector(&[0.5, 1.0, 2.0]);
        let y = vector(&[3.0, 4.0, 5.0]);
        let expected = graph.interpret(&[x.clone(), y.clone()]).unwrap();
        let known = split.known.interpret(&[x]).unwrap();
        let staged = split.staged.interpret(&[known[1].clone(), y]).unwrap();
        assert_eq!(known[0], expected[0]);
        assert_eq!(staged[0], expected[1]);
    }

    #[test]
    fn test_eval_context_groups() {
        let mesh = AbstractMesh::new(vec![MeshAxis::new("x", 2).unwrap(), MeshAxis::new("y", 3).unwrap()]).unwrap();
        let context = EvalContext::spmd(&mesh, mesh.axis_set()).unwrap();
        assert_eq!(context.device_count(), 6);
        assert_eq!(context.groups(&["x".to_string()]).unwrap(), vec![vec![0, 3], vec![1, 4], vec![2, 5]]);
        assert_eq!(context.groups(&["y".to_string()]).unwrap(), vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(context.axis_position(5, &["y".to_string(), "x".to_string()]).unwrap(), 5);
        assert_eq!(context.axis_position(4, &["y".to_string(), "x".to_string()]).unwrap(), 3);
        assert!(matches!(context.groups(&["z".to_string()]), Err(EvalError::UnboundAxis { axis }) if axis == "z"));
        assert!(matches!(EvalContext::host().groups(&["x".to_string()]), Err(EvalError::UnboundAxis { .. })));
    }
}
