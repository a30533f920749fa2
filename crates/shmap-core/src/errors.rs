use thiserror::Error;

use crate::axes::SpecError;
use crate::graph::{EvalError, GraphError};
use crate::mesh::MeshError;
use crate::replication::{RegistryError, ReplicationError};
use crate::shard_map::ShardMapError;
use crate::types::DivisibilityError;
use crate::values::ValueError;

/// Umbrella error type returned by the sharded region entry points.
///
/// Every module has its own error type. This one only wraps them so that callers can use `?` across module
/// boundaries.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    Mesh(#[from] MeshError),

    #[error("{0}")]
    Spec(#[from] SpecError),

    #[error("{0}")]
    Divisibility(#[from] DivisibilityError),

    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Eval(#[from] EvalError),

    #[error("{0}")]
    Value(#[from] ValueError),

    #[error("{0}")]
    Replication(#[from] ReplicationError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    ShardMap(#[from] ShardMapError),
}

impl Error {
    /// Returns `true` if this error reports a numeric fault (e.g., a `nan`) detected during evaluation.
    pub fn is_numeric_fault(&self) -> bool {
        matches!(self, Self::Eval(EvalError::NumericFault { .. }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::graph::NumericFault;

    #[test]
    fn test_error_conversions() {
        let spec_error = SpecError::EmptyAxisList { dimension: 1 };
        let error = Error::from(spec_error.clone());
        assert!(matches!(error, Error::Spec(SpecError::EmptyAxisList { dimension: 1 })));
        assert_eq!(error.to_string(), spec_error.to_string());
        assert!(!error.is_numeric_fault());

        let error = Error::from(EvalError::NumericFault { op: "div".to_string(), kind: NumericFault::Nan });
        assert!(error.is_numeric_fault());
        assert_eq!(error.to_string(), "invalid value (nan) encountered in div");
    }
}
