use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use tracing::debug;

use crate::{
    assert_input_count_matches,
    graph::{EvalContext, EvalError, GraphError, Op},
    types::ArrayType,
    values::HostArray,
};

/// Host function invoked once per device with that device's input values.
pub type HostCallback = Arc<dyn Fn(&[HostArray]) -> Result<Vec<HostArray>, EvalError> + Send + Sync>;

// ================================================== DEBUG CALLBACK =================================================

/// Logs its inputs on every device. Has no outputs and is never removed by dead code elimination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugCallbackOp {
    pub label: String,
}

impl DebugCallbackOp {
    pub fn new<L: Into<String>>(label: L) -> Self {
        Self { label: label.into() }
    }
}

impl Display for DebugCallbackOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "debug_callback[label={}]", self.label)
    }
}

impl Op for DebugCallbackOp {
    fn name(&self) -> &'static str {
        "debug_callback"
    }

    fn infer_output_types(&self, _: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        Ok(Vec::new())
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        for device in 0..context.device_count() {
            let values = inputs.iter().filter_map(|values| values.get(device)).map(|value| value.to_string());
            debug!(label = %self.label, device, values = %values.collect::<Vec<_>>().join(", "), "debug callback");
        }
        Ok(Vec::new())
    }

    fn has_effects(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================== PURE/IO HOST CALLBACK ==============================================

/// Kind of a [`HostCallbackOp`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// Side-effect free callback, which may be removed when its results are unused.
    Pure,

    /// Callback with side effects, which is never removed.
    Io,
}

/// Calls a host function with declared result types.
///
/// The results of a callback are replicated over no mesh axes, since nothing is known about the host function.
#[derive(Clone)]
pub struct HostCallbackOp {
    pub label: String,
    pub kind: CallbackKind,
    pub result_types: Vec<ArrayType>,
    pub callback: HostCallback,
}

impl HostCallbackOp {
    pub fn pure<L: Into<String>>(label: L, result_types: Vec<ArrayType>, callback: HostCallback) -> Self {
        Self { label: label.into(), kind: CallbackKind::Pure, result_types, callback }
    }

    pub fn io<L: Into<String>>(label: L, result_types: Vec<ArrayType>, callback: HostCallback) -> Self {
        Self { label: label.into(), kind: CallbackKind::Io, result_types, callback }
    }
}

impl Debug for HostCallbackOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallbackOp")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("result_types", &self.result_types)
            .finish_non_exhaustive()
    }
}

impl Display for HostCallbackOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[label={}]", self.name(), self.label)
    }
}

impl Op for HostCallbackOp {
    fn name(&self) -> &'static str {
        match self.kind {
            CallbackKind::Pure => "pure_callback",
            CallbackKind::Io => "io_callback",
        }
    }

    fn infer_output_types(&self, _: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        Ok(self.result_types.clone())
    }

    fn evaluate(&self, context: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        let mut outputs = vec![Vec::with_capacity(context.device_count()); self.result_types.len()];
        for device in 0..context.device_count() {
            let device_inputs = inputs.iter().filter_map(|values| values.get(device).cloned()).collect::<Vec<_>>();
            let results = (self.callback)(device_inputs.as_slice())?;
            if results.len() != self.result_types.len() {
                return Err(EvalError::Graph(GraphError::InvalidOutputCount {
                    op: self.to_string(),
                    expected: self.result_types.len(),
                    got: results.len(),
                }));
            }
            for (index, (output, result)) in outputs.iter_mut().zip(results).enumerate() {
                if !result.array_type().is_compatible_with(&self.result_types[index]) {
                    return Err(EvalError::InvalidInputType {
                        index,
                        expected: self.result_types[index].to_string(),
                        got: result.array_type().to_string(),
                    });
                }
                output.push(result);
            }
        }
        Ok(outputs)
    }

    fn has_effects(&self) -> bool {
        self.kind == CallbackKind::Io
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ==================================================== DEVICE PUT ===================================================

/// Identity on any number of values, marking a placement change.
#[derive(Copy, Clone, Debug, Default)]
pub struct DevicePutOp;

impl Display for DevicePutOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device_put")
    }
}

impl Op for DevicePutOp {
    fn name(&self) -> &'static str {
        "device_put"
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

// ======================================================= TIE =======================================================

/// Returns its first input, sequenced after its second input.
#[derive(Copy, Clone, Debug, Default)]
pub struct TieOp;

impl Display for TieOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tie")
    }
}

impl Op for TieOp {
    fn name(&self) -> &'static str {
        "tie"
    }

    fn infer_output_types(&self, input_types: &[&ArrayType]) -> Result<Vec<ArrayType>, GraphError> {
        assert_input_count_matches!(self, input_types.len(), 2);
        Ok(vec![input_types[0].clone()])
    }

    fn evaluate(&self, _: &EvalContext<'_>, inputs: &[&[HostArray]]) -> Result<Vec<Vec<HostArray>>, EvalError> {
        assert_input_count_matches!(self, inputs.len(), 2);
        Ok(vec![inputs[0].to_vec()])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
