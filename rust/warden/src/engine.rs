//! The entry points of the engine.

use tracing::debug;

use crate::compiler::Compiler;
use crate::config::Config;
use crate::error::{AuthorizationError, AuthorizationResult};
use crate::evaluator::Evaluator;
use crate::policy::AsPolicy;
use crate::query::{IntoQuery, Preload, Query, Source};
use crate::record::{Loader, Record};
use crate::rule::Action;
use crate::schema::Schema;

/// Outcome of [`Engine::authorize`]
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The resource, with any associations loaded while checking it.
    Authorized(Record),
    /// No rule grants the action, or a hook halted.
    NotAuthorized,
}

impl Decision {
    /// Returns `true` for [`Decision::Authorized`].
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::Authorized(_))
    }

    /// The authorized resource, if any.
    pub fn into_record(self) -> Option<Record> {
        match self {
            Decision::Authorized(record) => Some(record),
            Decision::NotAuthorized => None,
        }
    }
}

/// Per-call options of [`Engine::authorize`]
#[derive(Clone, Copy, Default)]
pub struct AuthorizeOptions<'a> {
    loader: Option<&'a dyn Loader>,
    force_load: bool,
}

impl<'a> AuthorizeOptions<'a> {
    /// Options that never load associations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies a loader, used when [`Config::load_associations`] is set.
    pub fn loader(mut self, loader: &'a dyn Loader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Loads missing associations through `loader` for this call,
    /// whatever the configuration says.
    pub fn load_associations(mut self, loader: &'a dyn Loader) -> Self {
        self.loader = Some(loader);
        self.force_load = true;
        self
    }
}

/// Per-call options of [`Engine::scope`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeOptions {
    preloads: Vec<Preload>,
}

impl ScopeOptions {
    /// Options without preloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `preload` along with the scoped rows, keeping only the related
    /// records authorized for the same action.
    pub fn preload_authorized(mut self, preload: impl Into<Preload>) -> Self {
        self.preloads.push(preload.into());
        self
    }
}

/// Answers authorization questions about the resources a [`Schema`]
/// describes
///
/// ```
/// use warden::{
///     AuthorizeOptions, Backend, Condition, Engine, Entity, MemoryStore, Policy, Record,
///     Registry, ScopeOptions, StorageType, Where,
/// };
///
/// let registry = Registry::new().entity(Entity::new("thread").field("archived", StorageType::Boolean));
/// let store = MemoryStore::new(registry)
///     .with(Record::new("thread").with("id", 1).with("archived", false))
///     .with(Record::new("thread").with("id", 2).with("archived", true));
///
/// let policy = Policy::new()
///     .allow("read", "thread", Condition::always())
///     .deny("read", "thread", Where::new().field("archived", true));
///
/// let engine = Engine::new(&store);
/// let archived = store.rows("thread")[1].clone();
/// let decision = engine
///     .authorize(archived, "read", &policy, AuthorizeOptions::new())
///     .unwrap();
/// assert!(!decision.is_authorized());
///
/// let query = engine
///     .scope("thread", "read", &policy, ScopeOptions::new())
///     .unwrap();
/// assert_eq!(store.all(&query).unwrap().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Engine<S> {
    schema: S,
    config: Config,
}

impl<S: Schema> Engine<S> {
    /// Creates an engine with the default [`Config`].
    pub fn new(schema: S) -> Self {
        Self {
            schema,
            config: Config::default(),
        }
    }

    /// Replaces the engine's configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The schema resources and queries are resolved against.
    pub fn schema(&self) -> &S {
        &self.schema
    }

    /// The configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks a loaded resource against the rule for its type and
    /// `action`, after running the authorize hooks.
    ///
    /// Associations a clause needs must be loaded on `resource` unless
    /// loading is enabled, see [`AuthorizeOptions`].
    pub fn authorize(
        &self,
        resource: Record,
        action: impl Into<Action>,
        policy: &impl AsPolicy,
        options: AuthorizeOptions<'_>,
    ) -> AuthorizationResult<Decision> {
        let action = action.into();
        let policy = policy.as_policy()?;
        debug!(resource_type = %resource.resource_type(), %action, "Authorizing resource");

        let loader = if options.force_load || self.config.load_associations {
            options.loader
        } else {
            None
        };
        let evaluator = Evaluator::new(
            &self.schema,
            &policy,
            loader,
            self.config.max_derivation_depth,
        );

        Ok(match evaluator.authorize(resource, &action, 0)? {
            Some(record) => Decision::Authorized(record),
            None => Decision::NotAuthorized,
        })
    }

    /// Like [`Engine::authorize`] with default options, for callers only
    /// interested in the verdict.
    pub fn is_authorized(
        &self,
        resource: &Record,
        action: impl Into<Action>,
        policy: &impl AsPolicy,
    ) -> AuthorizationResult<bool> {
        self.authorize(resource.clone(), action, policy, AuthorizeOptions::new())
            .map(|decision| decision.is_authorized())
    }

    /// Returns `true` if some resource of the subject's type could be
    /// authorized for `action`. The type must be known to the schema.
    pub fn any_authorized(
        &self,
        subject: impl IntoQuery,
        action: impl Into<Action>,
        policy: &impl AsPolicy,
    ) -> AuthorizationResult<bool> {
        let query = subject.into_query();
        let resource_type = match &query.source {
            Source::Type(resource_type) => resource_type,
            Source::Unlabeled(name) => {
                return Err(AuthorizationError::UnresolvedResourceType {
                    source_name: name.clone(),
                });
            }
        };
        if !self.schema.contains(resource_type) {
            return Err(AuthorizationError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            });
        }
        Ok(policy.as_policy()?.any_authorized(action, resource_type))
    }

    /// Restricts a query to the resources authorized for `action`, after
    /// running the scope hooks. Preloads requested in `options` are planned
    /// so that each row only receives authorized related records.
    pub fn scope(
        &self,
        subject: impl IntoQuery,
        action: impl Into<Action>,
        policy: &impl AsPolicy,
        options: ScopeOptions,
    ) -> AuthorizationResult<Query> {
        let action = action.into();
        let policy = policy.as_policy()?;
        let compiler = Compiler::new(&self.schema, &policy, self.config.max_derivation_depth);
        compiler.scope(subject.into_query(), &action, &options.preloads, 0)
    }
}
