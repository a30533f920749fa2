use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use thiserror::Error;

use crate::{
    axes::{AxisSet, Replication},
    graph::{Atom, GraphBuilder, Op},
    replication::{
        Analysis, CheckRule, ReplicationError, RewriteRule,
        collectives::{
            axis_index_check, psum_invariant_check, psum_rewrite, pvary_check, reduction_collective_check,
            reduction_collective_rewrite, standard_collective_check, standard_collective_rewrite,
        },
        standard::{
            callback_check, debug_callback_check, device_put_check, standard_check, standard_rewrite, tie_check,
        },
        structural::{
            call_check, call_rewrite, cond_check, cond_rewrite, custom_vjp_call_check, custom_vjp_call_rewrite,
            scan_check, scan_rewrite, while_check, while_rewrite,
        },
    },
};

/// Kind of a replication rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Check,
    Rewrite,
}

impl Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Check => write!(f, "check"),
            Self::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Error type for [`RuleRegistry`] registrations.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegistryError {
    /// Error returned when a rule of the same kind is already registered for an operation kind.
    #[error("a replication {kind} rule is already registered for '{op}'")]
    DuplicateRule { op: String, kind: RuleKind },

    /// Error returned when a no-rewrite registration precedes the check rule it relies on.
    #[error("cannot register '{op}' as not needing a rewrite before registering its check rule")]
    MissingCheckRule { op: String },
}

/// Rewrite rule that emits the operation unchanged, with output replication given by its check rule.
struct NoRewrite {
    check: Arc<dyn CheckRule>,
}

impl RewriteRule for NoRewrite {
    fn rewrite(
        &self,
        analysis: &Analysis<'_>,
        builder: &mut GraphBuilder,
        op: &dyn Op,
        inputs: &[Atom],
        input_reps: &[AxisSet],
    ) -> Result<(Vec<Atom>, Vec<AxisSet>), ReplicationError> {
        let outputs = builder.add_boxed_equation(dyn_clone::clone_box(op), inputs.to_vec())?;
        let input_reps = input_reps.iter().cloned().map(Replication::Axes).collect::<Vec<_>>();
        let output_reps = self.check.check(analysis, op, input_reps.as_slice(), outputs.len())?;
        let output_reps = output_reps.iter().map(|rep| analysis.resolve(rep)).collect();
        Ok((outputs.into_iter().map(Atom::from).collect(), output_reps))
    }
}

/// Table of replication rules keyed by operation kind ([`Op::name`]).
///
/// Every operation kind has at most one check rule and at most one rewrite rule, and registering a second rule of
/// the same kind is an error. Registration only needs a shared reference, so a registry can be extended after it has
/// been shared (e.g., through [`RuleRegistry::global`]).
pub struct RuleRegistry {
    check_rules: RwLock<HashMap<String, Arc<dyn CheckRule>>>,
    rewrite_rules: RwLock<HashMap<String, Arc<dyn RewriteRule>>>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { check_rules: RwLock::new(HashMap::new()), rewrite_rules: RwLock::new(HashMap::new()) }
    }

    /// Creates a registry containing the rules for every operation in [`crate::ops`].
    pub fn with_builtin_rules() -> Self {
        let registry = Self::new();
        registry.install_builtin_rules();
        registry
    }

    /// Returns the process-wide registry, which starts out with the built-in rules.
    pub fn global() -> &'static RuleRegistry {
        static GLOBAL: OnceLock<RuleRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtin_rules)
    }

    pub fn check_rule(&self, op: &str) -> Option<Arc<dyn CheckRule>> {
        self.check_rules.read().unwrap_or_else(PoisonError::into_inner).get(op).cloned()
    }

    pub fn rewrite_rule(&self, op: &str) -> Option<Arc<dyn RewriteRule>> {
        self.rewrite_rules.read().unwrap_or_else(PoisonError::into_inner).get(op).cloned()
    }

    pub fn register_check<R: CheckRule + 'static>(&self, op: &str, rule: R) -> Result<(), RegistryError> {
        self.insert_check(op, Arc::new(rule))
    }

    pub fn register_rewrite<R: RewriteRule + 'static>(&self, op: &str, rule: R) -> Result<(), RegistryError> {
        self.insert_rewrite(op, Arc::new(rule))
    }

    /// Registers a rewrite rule for `op` that emits it unchanged. The check rule for `op` must already be
    /// registered, and determines the replication of the outputs.
    pub fn register_no_rewrite(&self, op: &str) -> Result<(), RegistryError> {
        let check = self.check_rule(op).ok_or_else(|| RegistryError::MissingCheckRule { op: op.to_string() })?;
        self.insert_rewrite(op, Arc::new(NoRewrite { check }))
    }

    /// Registers the standard rules for `op`: all inputs must have the same replication, which is also the
    /// replication of every output.
    pub fn register_standard(&self, op: &str) -> Result<(), RegistryError> {
        self.register_check(op, standard_check)?;
        self.register_rewrite(op, standard_rewrite)
    }

    /// Registers the rules for a collective whose input must vary over the acted-on axes, and whose output keeps
    /// varying over them.
    pub fn register_standard_collective(&self, op: &str) -> Result<(), RegistryError> {
        self.register_check(op, standard_collective_check)?;
        self.register_rewrite(op, standard_collective_rewrite)
    }

    /// Registers the rules for a collective whose input must vary over the acted-on axes, and whose output is
    /// replicated over them.
    pub fn register_reduction_collective(&self, op: &str) -> Result<(), RegistryError> {
        self.register_check(op, reduction_collective_check)?;
        self.register_rewrite(op, reduction_collective_rewrite)
    }

    fn insert_check(&self, op: &str, rule: Arc<dyn CheckRule>) -> Result<(), RegistryError> {
        let mut rules = self.check_rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.contains_key(op) {
            return Err(RegistryError::DuplicateRule { op: op.to_string(), kind: RuleKind::Check });
        }
        rules.insert(op.to_string(), rule);
        Ok(())
    }

    fn insert_rewrite(&self, op: &str, rule: Arc<dyn RewriteRule>) -> Result<(), RegistryError> {
        let mut rules = self.rewrite_rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.contains_key(op) {
            return Err(RegistryError::DuplicateRule { op: op.to_string(), kind: RuleKind::Rewrite });
        }
        rules.insert(op.to_string(), rule);
        Ok(())
    }

    fn install_builtin_rules(&self) {
        let mut check_rules = self.check_rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut rewrite_rules = self.rewrite_rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut install = |op: &str, check: Arc<dyn CheckRule>, rewrite: Option<Arc<dyn RewriteRule>>| {
            let rewrite: Arc<dyn RewriteRule> = match rewrite {
                Some(rewrite) => rewrite,
                None => Arc::new(NoRewrite { check: check.clone() }),
            };
            check_rules.insert(op.to_string(), check);
            rewrite_rules.insert(op.to_string(), rewrite);
        };

        for op in [
            "neg", "sin", "cos", "exp", "log", "add", "sub", "mul", "div", "max", "min", "lt", "reduce_sum", "reshape",
        ] {
            install(op, Arc::new(standard_check), Some(Arc::new(standard_rewrite)));
        }

        install("psum", Arc::new(psum_invariant_check), Some(Arc::new(psum_rewrite)));
        install("psum_invariant", Arc::new(psum_invariant_check), None);
        install("pvary", Arc::new(pvary_check), None);
        for op in ["all_gather", "all_to_all", "ppermute", "reduce_scatter"] {
            install(op, Arc::new(standard_collective_check), Some(Arc::new(standard_collective_rewrite)));
        }
        for op in ["pmin", "pmax"] {
            install(op, Arc::new(reduction_collective_check), Some(Arc::new(reduction_collective_rewrite)));
        }
        install("axis_index", Arc::new(axis_index_check), None);

        for op in ["call", "remat", "custom_jvp_call"] {
            install(op, Arc::new(call_check), Some(Arc::new(call_rewrite)));
        }
        install("custom_vjp_call", Arc::new(custom_vjp_call_check), Some(Arc::new(custom_vjp_call_rewrite)));
        install("cond", Arc::new(cond_check), Some(Arc::new(cond_rewrite)));
        install("scan", Arc::new(scan_check), Some(Arc::new(scan_rewrite)));
        install("while", Arc::new(while_check), Some(Arc::new(while_rewrite)));

        install("debug_callback", Arc::new(debug_callback_check), None);
        install("pure_callback", Arc::new(callback_check), None);
        install("io_callback", Arc::new(callback_check), None);
        install("device_put", Arc::new(device_put_check), None);
        install("tie", Arc::new(tie_check), None);
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}

impl Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut check_rules =
            self.check_rules.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect::<Vec<_>>();
        let mut rewrite_rules =
            self.rewrite_rules.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect::<Vec<_>>();
        check_rules.sort();
        rewrite_rules.sort();
        f.debug_struct("RuleRegistry")
            .field("check_rules", &check_rules)
            .field("rewrite_rules", &rewrite_rules)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
