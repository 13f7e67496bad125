//! Plan - Collection of Effects
//!
//! A Plan is an ordered list of steps, each holding one Effect and the
//! steps it must wait for. No side effects occur until the Plan is applied.

use std::fmt;

use crate::effect::Effect;

/// One Effect plus the indices of the steps that must finish first
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub effect: Effect,
    /// Indices of earlier steps this one waits for
    pub after: Vec<usize>,
}

/// Plan containing Effects to be executed
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step and return its index
    pub fn add(&mut self, effect: Effect, mut after: Vec<usize>) -> usize {
        let index = self.steps.len();
        after.retain(|i| *i < index);
        after.sort_unstable();
        after.dedup();
        self.steps.push(Step { effect, after });
        index
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn effects(&self) -> impl Iterator<Item = &Effect> {
        self.steps.iter().map(|s| &s.effect)
    }

    /// Whether the plan would change nothing
    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    /// Number of mutating Effects
    pub fn mutation_count(&self) -> usize {
        self.effects().filter(|e| e.is_mutating()).count()
    }

    /// Generate a summary of the Plan for display
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for effect in self.effects() {
            match effect {
                Effect::Create(_) => summary.create += 1,
                Effect::Update { .. } => summary.update += 1,
                Effect::Replace { .. } => summary.replace += 1,
                Effect::Delete { .. } => summary.delete += 1,
                Effect::NoOp(_) => summary.unchanged += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn has_changes(&self) -> bool {
        self.create + self.update + self.replace + self.delete > 0
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}
