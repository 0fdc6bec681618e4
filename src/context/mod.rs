//! Hierarchical contexts: Global → Project → Branch → Task.
//!
//! Each level stores a JSON document. A level's effective context is the deep
//! merge of every context above it, root first. See [`ContextService::resolve`].

mod model;
pub mod service;
pub mod validator;

pub use model::{ContextLevel, ContextRecord, Delegation, DelegationStatus, ResolvedContext};
pub use service::{ContextService, ContextUpdate, CreatedContext, GLOBAL_ALIAS};
pub use validator::{ContextHierarchyValidator, MissingContext, ValidationOutcome};
