//! Authorization rule registry.
//!
//! A fact may be saved when at least one rule registered for its type
//! admits it, or when its type has no rules and the default policy is
//! permissive. Specification rules are vetted at registration: they must
//! carry exactly one given, a single-label projection, and no
//! successor-direction path.

use std::collections::HashMap;

use crate::error::{FactlineResult, ValidationError};
use crate::query::{MatchCondition, Projection, Specification, StepQuery};

/// A single authorization rule.
#[derive(Debug, Clone)]
pub enum AuthorizationRule {
    /// Always authorized.
    Any,
    /// Never authorized.
    NoOne,
    /// Legacy step query from the candidate fact; the submitting user must
    /// be among the results.
    Query(StepQuery),
    /// Specification from the candidate fact; the submitting user must be
    /// among the single-label results.
    Specification(Specification),
}

/// What to do for fact types with no registered rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    /// Admit unknown types.
    #[default]
    Permissive,
    /// Reject unknown types.
    Strict,
}

/// The per-type rule registry.
#[derive(Debug, Default)]
pub struct AuthorizationRules {
    rules: HashMap<String, Vec<AuthorizationRule>>,
    default_policy: DefaultPolicy,
}

impl AuthorizationRules {
    /// An empty registry with the given default policy.
    #[must_use]
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self {
            rules: HashMap::new(),
            default_policy,
        }
    }

    /// Admits every fact of this type.
    #[must_use]
    pub fn any(mut self, fact_type: impl Into<String>) -> Self {
        self.rules
            .entry(fact_type.into())
            .or_default()
            .push(AuthorizationRule::Any);
        self
    }

    /// Rejects every fact of this type.
    #[must_use]
    pub fn no_one(mut self, fact_type: impl Into<String>) -> Self {
        self.rules
            .entry(fact_type.into())
            .or_default()
            .push(AuthorizationRule::NoOne);
        self
    }

    /// Registers a legacy query rule.
    #[must_use]
    pub fn with_query(mut self, fact_type: impl Into<String>, query: StepQuery) -> Self {
        self.rules
            .entry(fact_type.into())
            .or_default()
            .push(AuthorizationRule::Query(query));
        self
    }

    /// Registers a specification rule, vetting it first.
    ///
    /// Rejected outright when the specification has more than one given,
    /// a non-label projection, a given type other than the registered fact
    /// type, or any successor-direction path. Successor walks cannot be
    /// proven against evidence, so they are refused here rather than
    /// silently permitted or denied at save time.
    pub fn with_specification(
        mut self,
        fact_type: impl Into<String>,
        specification: Specification,
    ) -> FactlineResult<Self> {
        let fact_type = fact_type.into();
        specification.validate()?;

        if specification.given.len() != 1 {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "authorization rule for '{fact_type}' must have exactly one given"
                ),
            }
            .into());
        }
        if specification.given[0].fact_type != fact_type {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "authorization rule given is '{}', expected '{fact_type}'",
                    specification.given[0].fact_type
                ),
            }
            .into());
        }
        if !matches!(specification.projection, Projection::Label { .. }) {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "authorization rule for '{fact_type}' must project a single label"
                ),
            }
            .into());
        }
        if specification_seeks_successors(&specification) {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "authorization rule for '{fact_type}' walks successors; evidence cannot prove their absence"
                ),
            }
            .into());
        }

        self.rules
            .entry(fact_type)
            .or_default()
            .push(AuthorizationRule::Specification(specification));
        Ok(self)
    }

    /// Rules registered for a type, if any.
    #[must_use]
    pub fn rules_for(&self, fact_type: &str) -> Option<&[AuthorizationRule]> {
        self.rules.get(fact_type).map(Vec::as_slice)
    }

    /// The policy for unregistered types.
    #[must_use]
    pub const fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    /// True when no rules are registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// True when any path condition at any depth ascends toward successors.
fn specification_seeks_successors(specification: &Specification) -> bool {
    fn matches_seek(matches: &[crate::query::Match]) -> bool {
        matches.iter().any(|m| {
            m.conditions.iter().any(|condition| match condition {
                MatchCondition::Path(path) => !path.roles_left.is_empty(),
                MatchCondition::Existential(existential) => matches_seek(&existential.matches),
            })
        })
    }
    matches_seek(&specification.matches)
}
