//! Warden
//!
//! A declarative authorization engine. Applications register allow and deny
//! rules per resource type and action in a [`Policy`], then ask the same
//! policy two kinds of questions:
//!
//! - [`Engine::authorize`]: is this loaded record authorized?
//! - [`Engine::scope`]: which records of a query are authorized? The answer
//!   is a [`Query`] carrying the compiled predicate, its joins and,
//!   optionally, plans that restrict preloaded associations to authorized
//!   records.
//!
//! Both answers are derived from the same rules and agree: a stored record
//! is authorized exactly when the scoped query selects it.
//!
//! ```
//! use warden::{allows, Engine, Entity, Policy, Record, Registry, StorageType, Where};
//!
//! let registry = Registry::new()
//!     .entity(Entity::new("thread").field("archived", StorageType::Boolean))
//!     .entity(
//!         Entity::new("post")
//!             .field("thread_id", StorageType::Integer)
//!             .belongs_to("thread", "thread", "thread_id"),
//!     );
//!
//! let policy = Policy::new()
//!     .allow("read", "thread", Where::new().field("archived", false))
//!     .allow("read", "post", Where::new().field("thread", allows("read")));
//!
//! let thread = Record::new("thread").with("id", 1).with("archived", true);
//! let post = Record::new("post")
//!     .with("id", 7)
//!     .with("thread_id", 1)
//!     .with_loaded("thread", warden::Loaded::One(Some(Box::new(thread))));
//!
//! let engine = Engine::new(registry);
//! assert_eq!(engine.is_authorized(&post, "read", &policy), Ok(false));
//! ```

#![warn(missing_docs)]

/// Compilation of rules into query predicates.
pub mod compiler;
/// Conditions, clauses and the vocabulary used to write them.
pub mod condition;
/// Engine configuration.
pub mod config;
/// The façade tying policies, evaluation and compilation together.
pub mod engine;
/// Error types.
pub mod error;
/// In-memory evaluation of rules.
pub mod evaluator;
/// Hooks run before evaluation and compilation.
pub mod hook;
/// Boolean folds shared by evaluation and compilation.
pub mod logic;
/// A reference backend over in-memory tables.
pub mod memory;
/// Policies and the builders that produce them.
pub mod policy;
/// Backend-agnostic query model.
pub mod query;
/// Loaded resources and association loading.
pub mod record;
/// Rules and actions.
pub mod rule;
/// Schema reflection.
pub mod schema;
/// Field values and storage types.
pub mod value;

pub use condition::{Clause, Condition, FnPredicate, Matcher, Predicate, Where, allows, predicate};
pub use config::Config;
pub use engine::{AuthorizeOptions, Decision, Engine, ScopeOptions};
pub use error::{AuthorizationError, AuthorizationResult, LoadError, StoreError, TypeError};
pub use hook::{Flow, Hook, HookScope, Stage, Subject};
pub use memory::MemoryStore;
pub use policy::{AsPolicy, BuildPolicy, ForActor, Policy};
pub use query::{
    Backend, Binding, Correlated, Direction, Expr, IntoQuery, Join, Op, Order, Preload,
    PreloadPlan, Query, Source,
};
pub use record::{Loaded, Loader, Record};
pub use rule::{Action, Rule};
pub use schema::{AssociationInfo, Cardinality, Entity, Registry, ResourceType, Schema};
pub use value::{StorageType, Value};
