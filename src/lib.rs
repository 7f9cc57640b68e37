//! # Factline — a content-addressed, partially-ordered fact store
//!
//! Factline models application state as an append-only DAG of immutable
//! *facts*, each naming its predecessors by content hash. The partial
//! order induced by predecessor references makes concurrent offline writes
//! safe to merge without coordination: there are no conflicts, only set
//! union.
//!
//! ## Core concepts
//!
//! - **Fact**: an immutable typed record with scalar fields and named
//!   predecessor references
//! - **Specification**: a compilable query with labeled unknowns, path and
//!   existential conditions, and composable projections
//! - **Observer**: a live subscription invoking `added`/`removed` callbacks
//!   as specification results change
//! - **Fork**: the offline-capable write path with a durable outbox
//!
//! ## Usage
//!
//! ```rust,ignore
//! use factline::{Fact, FactManager, FactlineConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! let manager = FactlineConfig::default()
//!     .create_manager(Arc::new(MemoryStore::new()))?;
//!
//! let list = Fact::new("List").with_field("name", "Chores");
//! let task = Fact::new("Task")
//!     .with_field("description", "take out the trash")
//!     .with_predecessor("list", list.reference()?);
//!
//! manager.save_facts(vec![list, task])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core model
pub mod error;
pub mod fact;
pub mod value;

// Query surfaces and evaluation
pub mod executor;
pub mod query;

// Storage
pub mod storage;

// Reactive pipeline
pub mod observable;

// Authorization
pub mod authorization;

// Synchronization
pub mod config;
pub mod fork;
pub mod http;
pub mod manager;
pub mod remote;
pub mod subscriber;

// Re-export primary types at crate root for convenience
pub use authorization::{AuthorizationRule, AuthorizationRules, DefaultPolicy, EvidenceBundle};
pub use config::FactlineConfig;
pub use error::{ExecutionError, FactlineError, FactlineResult, TransportError, ValidationError};
pub use fact::{topological_order, Fact, FactEnvelope, FactReference, FactSignature};
pub use manager::FactManager;
pub use observable::{AddedResponse, Observable, Observer, WatchHandlers};
pub use query::{
    Direction, ExistentialCondition, Label, Match, MatchCondition, PathCondition, Projected,
    Projection, Quantifier, Role, Specification, Step, StepQuery,
};
pub use remote::{
    AuthenticationProvider, FeedConnection, FeedEvent, NullAuthenticationProvider, RemoteEndpoint,
};
pub use storage::{
    Edge, FeedDescriptor, FeedResponse, LoginRecord, MemoryStore, SpecificationResult, Storage,
    StorageError,
};
pub use subscriber::Subscriber;
pub use value::FieldValue;
