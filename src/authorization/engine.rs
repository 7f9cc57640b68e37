//! Authorization rule evaluation.
//!
//! Specification rules run entirely against evidence. Legacy query rules
//! are split at the first successor join: the predecessor-only prefix runs
//! against evidence, the remainder against storage.

use std::sync::Arc;

use crate::error::{ExecutionError, FactlineError, FactlineResult};
use crate::executor;
use crate::fact::{FactEnvelope, FactReference};
use crate::query::{Direction, Projection, Specification, Step, StepQuery};
use crate::storage::Storage;

use super::evidence::EvidenceBundle;
use super::rules::{AuthorizationRule, AuthorizationRules, DefaultPolicy};

/// Evaluates registered rules against submissions.
pub struct AuthorizationEngine {
    rules: AuthorizationRules,
    storage: Arc<dyn Storage>,
}

impl AuthorizationEngine {
    /// Creates an engine over a rule registry and the shared storage.
    #[must_use]
    pub fn new(rules: AuthorizationRules, storage: Arc<dyn Storage>) -> Self {
        Self { rules, storage }
    }

    /// Decides whether the submitting user may publish this envelope.
    ///
    /// Fails with `Forbidden` naming the fact type; nothing is persisted
    /// by this call.
    pub fn authorize(
        &self,
        envelope: &FactEnvelope,
        evidence: &EvidenceBundle,
        user: Option<&FactReference>,
    ) -> FactlineResult<()> {
        let fact_type = envelope.fact.fact_type.clone();
        let Some(rules) = self.rules.rules_for(&fact_type) else {
            return match self.rules.default_policy() {
                DefaultPolicy::Permissive => Ok(()),
                DefaultPolicy::Strict => {
                    Err(FactlineError::Execution(ExecutionError::Forbidden { fact_type }))
                }
            };
        };

        for rule in rules {
            if self.evaluate(rule, envelope, evidence, user)? {
                return Ok(());
            }
        }
        Err(FactlineError::Execution(ExecutionError::Forbidden { fact_type }))
    }

    fn evaluate(
        &self,
        rule: &AuthorizationRule,
        envelope: &FactEnvelope,
        evidence: &EvidenceBundle,
        user: Option<&FactReference>,
    ) -> FactlineResult<bool> {
        match rule {
            AuthorizationRule::Any => Ok(true),
            AuthorizationRule::NoOne => {
                tracing::warn!(
                    fact_type = %envelope.fact.fact_type,
                    "fact type admits no author"
                );
                Ok(false)
            }
            AuthorizationRule::Query(query) => {
                let Some(user) = user else {
                    return Ok(false);
                };
                let reference = envelope.reference().map_err(FactlineError::from)?;
                Ok(self.evaluate_query(query, &reference, evidence)?.contains(user))
            }
            AuthorizationRule::Specification(specification) => {
                let Some(user) = user else {
                    return Ok(false);
                };
                let reference = envelope.reference().map_err(FactlineError::from)?;
                Ok(evaluate_specification(specification, &reference, evidence)?
                    .contains(user))
            }
        }
    }

    /// Runs the evidence-executable prefix, then the remaining suffix
    /// against storage from each intermediate result.
    fn evaluate_query(
        &self,
        query: &StepQuery,
        start: &FactReference,
        evidence: &EvidenceBundle,
    ) -> FactlineResult<Vec<FactReference>> {
        let split = query
            .steps
            .iter()
            .position(|step| match step {
                Step::Join {
                    direction: Direction::Successor,
                    ..
                } => true,
                Step::Existential { steps, .. } => crate::query::steps::steps_seek_successors(steps),
                _ => false,
            })
            .unwrap_or(query.steps.len());

        let prefix = StepQuery::new(query.steps[..split].to_vec());
        let intermediate = executor::execute_steps(evidence, start, &prefix);
        if split == query.steps.len() {
            return Ok(intermediate);
        }

        let suffix = StepQuery::new(query.steps[split..].to_vec());
        let mut results = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for reference in intermediate {
            for found in self
                .storage
                .query(&reference, &suffix)
                .map_err(FactlineError::from)?
            {
                if seen.insert(found.key()) {
                    results.push(found);
                }
            }
        }
        Ok(results)
    }
}

fn evaluate_specification(
    specification: &Specification,
    start: &FactReference,
    evidence: &EvidenceBundle,
) -> FactlineResult<Vec<FactReference>> {
    let environments =
        executor::evaluate(evidence, specification, std::slice::from_ref(start))?;
    let Projection::Label { label } = &specification.projection else {
        // Registration vets the projection; fail closed regardless.
        return Ok(Vec::new());
    };
    Ok(environments
        .iter()
        .filter_map(|env| {
            env.iter()
                .find(|(name, _)| name == label)
                .map(|(_, reference)| reference.clone())
        })
        .collect())
}
