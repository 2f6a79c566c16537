//! Error types for the authorization engine
//!
//! Authorization outcomes are not errors: a resource that fails its rules is
//! reported as [`crate::Decision::NotAuthorized`] and a scope that matches
//! nothing is an ordinary query. The variants below cover structural problems
//! only, either in how a policy was defined or in resolving it against a
//! concrete resource or query.

use crate::value::{StorageType, Value};
use thiserror::Error;

/// Errors raised while defining a policy or resolving it at a call site
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthorizationError {
    /// A hook with the same name is already attached for the same scope
    #[error("Hook \"{name}\" is already attached for {scope}")]
    DuplicateHook {
        /// Name of the hook
        name: String,
        /// Scope it was attached for
        scope: String,
    },

    /// A rule or query refers to a resource type the schema doesn't know
    #[error("Unknown resource type \"{resource_type}\"")]
    UnknownResourceType {
        /// The unknown type
        resource_type: String,
    },

    /// A clause refers to a field the resource type doesn't declare
    #[error("Resource type \"{resource_type}\" has no field \"{field}\"")]
    UnknownField {
        /// Type the field was looked up on
        resource_type: String,
        /// The missing field
        field: String,
    },

    /// A clause or preload refers to an association that doesn't exist
    #[error("Resource type \"{resource_type}\" has no association \"{association}\"")]
    UnknownAssociation {
        /// Type the association was looked up on
        resource_type: String,
        /// The missing association
        association: String,
    },

    /// Derived permissions need a primary key to correlate subqueries
    #[error("Resource type \"{resource_type}\" does not declare a primary key")]
    MissingPrimaryKey {
        /// Type without a primary key
        resource_type: String,
    },

    /// Derived permissions nest deeper than the configured bound, or
    /// derive from each other in a cycle
    #[error(
        "Derived permission \"{action}\" on \"{resource_type}\" exceeded the maximum depth of {depth}"
    )]
    DerivationDepthExceeded {
        /// Type of the rule that could not be reached
        resource_type: String,
        /// Action of that rule
        action: String,
        /// The configured bound
        depth: usize,
    },

    /// An escape-hatch predicate failed to produce a result
    #[error("Predicate on field \"{field}\" failed: {message}")]
    Predicate {
        /// Field the predicate was attached to
        field: String,
        /// What went wrong
        message: String,
    },

    /// The resource type of a query could not be determined
    #[error("Cannot determine the resource type of query source \"{source_name}\"")]
    UnresolvedResourceType {
        /// Name of the raw source
        source_name: String,
    },

    /// An association needed by a clause is not loaded and loading on
    /// demand was not requested
    #[error("Association \"{association}\" of \"{resource_type}\" is not loaded")]
    NotLoaded {
        /// Type of the record
        resource_type: String,
        /// The association that is missing
        association: String,
    },

    /// A literal value cannot be stored in the field it is compared against
    #[error("Cannot coerce {value:?} into {expected} for field \"{field}\"")]
    Coercion {
        /// Field the literal is compared against
        field: String,
        /// The literal
        value: Value,
        /// Storage type of the field
        expected: StorageType,
    },

    /// A hook returned a subject that doesn't belong to the running stage
    #[error("Hook \"{hook}\" returned a {actual} subject during the {stage} stage")]
    HookSubject {
        /// Name of the hook
        hook: String,
        /// Stage that was running
        stage: String,
        /// Kind of subject the hook returned
        actual: String,
    },

    /// The association loader failed
    #[error("Failed to load \"{association}\" of \"{resource_type}\": {message}")]
    Load {
        /// Type of the record being loaded for
        resource_type: String,
        /// The association being loaded
        association: String,
        /// Message of the loader's error
        message: String,
    },
}

impl AuthorizationError {
    /// Returns `true` for errors that point at a malformed policy rather
    /// than at the resource or query being checked.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            AuthorizationError::DuplicateHook { .. }
                | AuthorizationError::UnknownResourceType { .. }
                | AuthorizationError::UnknownField { .. }
                | AuthorizationError::UnknownAssociation { .. }
                | AuthorizationError::MissingPrimaryKey { .. }
                | AuthorizationError::DerivationDepthExceeded { .. }
                | AuthorizationError::Predicate { .. }
        )
    }
}

/// Result type for authorization operations
pub type AuthorizationResult<T> = Result<T, AuthorizationError>;

/// Raised when a value cannot be dumped into a storage type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    /// The value has no representation in the storage type
    #[error("Type mismatch: expected {expected}, got {actual:?}")]
    Mismatch {
        /// Storage type asked for
        expected: StorageType,
        /// The value given
        actual: Value,
    },
}

impl TypeError {
    /// Attach the field name this coercion was performed for.
    pub fn for_field(self, field: &str) -> AuthorizationError {
        match self {
            TypeError::Mismatch { expected, actual } => AuthorizationError::Coercion {
                field: field.to_string(),
                value: actual,
                expected,
            },
        }
    }
}

/// Raised by an association [`crate::Loader`]
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct LoadError {
    /// What went wrong
    pub message: String,
}

impl LoadError {
    /// A load failure described by `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Raised by [`crate::MemoryStore`] while executing a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The query reads from a resource type the store has no table for
    #[error("No table for \"{name}\"")]
    UnknownTable { name: String },
}
