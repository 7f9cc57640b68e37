//! The abstract storage contract.
//!
//! Backends persist facts, the edges derived from their predecessors, the
//! precomputed ancestor closures, per-feed bookmarks, and session logins.
//! Saves are idempotent on `(type, hash)`; there is no overwrite and no
//! conflict.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ExecutionError, FactlineError, ValidationError};
use crate::fact::{FactEnvelope, FactReference};
use crate::query::{Projected, Specification, StepQuery};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A reference was required but is not present.
    #[error("Fact not found: {0}")]
    NotFound(String),

    /// An ancestor closure entry is missing; the store is damaged.
    #[error("Ancestor closure missing for {0}")]
    Corrupt(String),

    /// No bookmark recorded for the feed.
    #[error("Bookmark not found for feed '{0}'")]
    BookmarkNotFound(String),

    /// A fact or specification handed to the store failed validation.
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl From<StorageError> for FactlineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(reference) => {
                Self::Execution(ExecutionError::NotFound { reference })
            }
            StorageError::Corrupt(reference) => {
                Self::Execution(ExecutionError::Corrupt { reference })
            }
            StorageError::BookmarkNotFound(feed) => Self::Execution(ExecutionError::NotFound {
                reference: format!("bookmark:{feed}"),
            }),
            StorageError::Invalid(reason) => {
                Self::Validation(ValidationError::MalformedSpecification { reason })
            }
            StorageError::BackendError(message) => {
                Self::Execution(ExecutionError::Storage { message })
            }
        }
    }
}

/// A derived successor edge: `successor` names `predecessor` under `role`.
///
/// Edges exist solely to make successor-direction walks efficient; they are
/// created on save and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub successor: FactReference,
    pub predecessor: FactReference,
    pub role: String,
}

/// Names a server feed together with the starting references it is
/// evaluated from. Hash of the rendered key identifies shared subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDescriptor {
    /// Server-assigned feed name.
    pub name: String,
    /// The specification the feed evaluates.
    pub specification: Specification,
    /// Starting references for the specification's given labels.
    pub given: Vec<FactReference>,
}

impl FeedDescriptor {
    /// A stable identity for subscriber sharing: feed name plus starts.
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = self.name.clone();
        for reference in &self.given {
            key.push('|');
            key.push_str(&reference.key());
        }
        key
    }
}

/// One page of a feed: references past the requested bookmark and the
/// bookmark to resume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedResponse {
    /// References newly matching the feed.
    pub references: Vec<FactReference>,
    /// Opaque resume position.
    pub bookmark: String,
}

/// A session login: the user's identity fact and a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub user: FactReference,
    pub display_name: String,
}

/// One specification result: the full tuple bindings and the projection
/// computed from them. Observers key tuples by the bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecificationResult {
    /// Label bindings in binding order (givens first).
    pub bindings: Vec<(String, FactReference)>,
    /// The projected value for this tuple.
    pub projection: Projected,
}

impl SpecificationResult {
    /// A stable identity for this tuple within an observer's lifetime.
    #[must_use]
    pub fn tuple_key(&self) -> String {
        let mut key = String::new();
        for (label, reference) in &self.bindings {
            key.push_str(label);
            key.push('=');
            key.push_str(&reference.key());
            key.push(';');
        }
        key
    }
}

/// The storage contract.
///
/// Implementations must be safe for shared use; all mutation goes through
/// `&self`.
pub trait Storage: Send + Sync {
    /// Saves each envelope at most once; returns only those newly written.
    ///
    /// Batches are accepted topologically: every predecessor must already
    /// be stored or appear earlier in the same batch.
    fn save(&self, envelopes: &[FactEnvelope]) -> Result<Vec<FactEnvelope>, StorageError>;

    /// Saves a batch and advances a feed bookmark in one atomic step, so a
    /// crash cannot separate the two.
    fn save_with_bookmark(
        &self,
        envelopes: &[FactEnvelope],
        feed: &str,
        bookmark: &str,
    ) -> Result<Vec<FactEnvelope>, StorageError>;

    /// Returns the union of ancestor closures of the given references,
    /// ordered predecessors-first. Unknown references contribute nothing.
    fn load(&self, references: &[FactReference]) -> Result<Vec<FactEnvelope>, StorageError>;

    /// Returns the subset of references already present. Pure query.
    fn which_exist(
        &self,
        references: &[FactReference],
    ) -> Result<Vec<FactReference>, StorageError>;

    /// Executes a legacy step walk from a starting fact.
    fn query(
        &self,
        start: &FactReference,
        query: &StepQuery,
    ) -> Result<Vec<FactReference>, StorageError>;

    /// Executes a specification, returning bindings and projections.
    fn read_results(
        &self,
        given: &[FactReference],
        specification: &Specification,
    ) -> Result<Vec<SpecificationResult>, StorageError>;

    /// Executes a specification, returning projections only.
    fn read(
        &self,
        given: &[FactReference],
        specification: &Specification,
    ) -> Result<Vec<Projected>, StorageError> {
        Ok(self
            .read_results(given, specification)?
            .into_iter()
            .map(|result| result.projection)
            .collect())
    }

    /// Returns references newly matching a feed past a bookmark.
    fn feed(
        &self,
        descriptor: &FeedDescriptor,
        bookmark: &str,
    ) -> Result<FeedResponse, StorageError>;

    /// Loads the durable bookmark for a feed.
    fn load_bookmark(&self, feed: &str) -> Result<String, StorageError>;

    /// Persists the bookmark for a feed.
    fn save_bookmark(&self, feed: &str, bookmark: &str) -> Result<(), StorageError>;

    /// Looks up a session login.
    fn load_login(&self, session_token: &str) -> Result<Option<LoginRecord>, StorageError>;

    /// Records a session login.
    fn save_login(&self, session_token: &str, login: LoginRecord) -> Result<(), StorageError>;
}
