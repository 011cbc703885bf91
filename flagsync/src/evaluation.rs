//! Read side of the caches.
//!
//! Matching a key against conditions is left to an [`Evaluator`]. This module
//! only resolves flags, segments and prerequisites from the caches, and guards
//! recursion between flags with an explicit [`EvaluationStack`].

use crate::cache::Caches;
use crate::readiness::{ReadinessGates, Resource};
use crate::types::{RuleBasedSegment, Split};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Treatment returned whenever a flag cannot be evaluated.
pub const CONTROL: &str = "control";

const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("the caches are not ready yet")]
    NotReady,

    #[error("the client was destroyed")]
    Destroyed,

    #[error("{0} not found")]
    NotFound(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("flag {0} depends on itself")]
    Cycle(String),

    #[error("dependency chain deeper than {0}")]
    TooDeep(usize),
}

/// Flags currently being evaluated, innermost last.
#[derive(Debug)]
pub struct EvaluationStack {
    flags: Vec<String>,
    max_depth: usize,
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationStack {
    pub fn new() -> Self {
        Self::with_max_depth(DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        EvaluationStack {
            flags: Vec::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, flag: &str) -> Result<(), EvaluationError> {
        if self.flags.iter().any(|f| f == flag) {
            return Err(EvaluationError::Cycle(flag.to_string()));
        }
        if self.flags.len() >= self.max_depth {
            return Err(EvaluationError::TooDeep(self.max_depth));
        }
        self.flags.push(flag.to_string());
        Ok(())
    }

    pub fn pop(&mut self) {
        self.flags.pop();
    }

    pub fn depth(&self) -> usize {
        self.flags.len()
    }
}

/// The matcher tree. Implementations evaluate `split`'s conditions for `key`
/// and return the treatment of the first matching condition, or `None` when
/// none matched.
///
/// Dependency matchers resolve other flags through [`RuleView::evaluate`],
/// passing `stack` along.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        split: &Split,
        key: &str,
        view: &RuleView,
        stack: &mut EvaluationStack,
    ) -> Result<Option<String>, EvaluationError>;
}

/// Consistent reads over one client's caches.
#[derive(Clone)]
pub struct RuleView {
    caches: Caches,
    gates: Arc<ReadinessGates>,
    destroyed: Arc<AtomicBool>,
}

impl RuleView {
    pub fn new(caches: Caches, gates: Arc<ReadinessGates>, destroyed: Arc<AtomicBool>) -> Self {
        RuleView {
            caches,
            gates,
            destroyed,
        }
    }

    fn check(&self, resource: Resource) -> Result<(), LookupError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LookupError::Destroyed);
        }
        if !self.gates.is_ready(resource) {
            return Err(LookupError::NotReady);
        }
        Ok(())
    }

    pub fn split(&self, name: &str) -> Result<Arc<Split>, LookupError> {
        self.check(Resource::Flags)?;
        self.caches
            .splits
            .get(name)
            .ok_or_else(|| LookupError::NotFound(format!("flag {name}")))
    }

    pub fn rule_based_segment(&self, name: &str) -> Result<Arc<RuleBasedSegment>, LookupError> {
        self.check(Resource::Flags)?;
        self.caches
            .rule_based_segments
            .get(name)
            .ok_or_else(|| LookupError::NotFound(format!("rule-based segment {name}")))
    }

    /// Membership of `key`. A segment that was never fetched has no members.
    pub fn in_segment(&self, segment: &str, key: &str) -> Result<bool, LookupError> {
        self.check(Resource::Segments)?;
        Ok(self.caches.segments.contains(segment, key).unwrap_or(false))
    }

    /// Treatment of `flag` for `key`, or [`CONTROL`] if it cannot be evaluated.
    pub fn treatment(&self, flag: &str, key: &str, evaluator: &dyn Evaluator) -> String {
        let mut stack = EvaluationStack::new();
        match self.evaluate(flag, key, evaluator, &mut stack) {
            Ok(treatment) => treatment,
            Err(e) => {
                tracing::debug!(flag, error = %e, "returning control treatment");
                CONTROL.to_string()
            }
        }
    }

    /// Evaluates `flag` within an ongoing evaluation.
    pub fn evaluate(
        &self,
        flag: &str,
        key: &str,
        evaluator: &dyn Evaluator,
        stack: &mut EvaluationStack,
    ) -> Result<String, EvaluationError> {
        stack.push(flag)?;
        let result = self.evaluate_split(flag, key, evaluator, stack);
        stack.pop();
        result
    }

    fn evaluate_split(
        &self,
        flag: &str,
        key: &str,
        evaluator: &dyn Evaluator,
        stack: &mut EvaluationStack,
    ) -> Result<String, EvaluationError> {
        let split = self.split(flag)?;
        if split.killed {
            return Ok(split.default_treatment.clone());
        }

        for prerequisite in split.prerequisites.iter().flatten() {
            let treatment = match self.evaluate(&prerequisite.flag_name, key, evaluator, stack) {
                Ok(treatment) => treatment,
                Err(EvaluationError::Lookup(LookupError::NotFound(_))) => CONTROL.to_string(),
                Err(e) => return Err(e),
            };
            if !prerequisite.treatments.contains(&treatment) {
                return Ok(split.default_treatment.clone());
            }
        }

        let treatment = evaluator.evaluate(&split, key, self, stack)?;
        Ok(treatment.unwrap_or_else(|| split.default_treatment.clone()))
    }
}
