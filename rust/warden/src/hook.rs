//! Interceptors that run before a rule is evaluated or compiled.
//!
//! A [`Hook`] sees the subject of the current call (the record being
//! authorized or the query being scoped) and either lets it through,
//! possibly transformed, or halts the call. A halted `authorize` is not
//! authorized; a halted `scope` selects nothing.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use tracing::debug;

use crate::error::{AuthorizationError, AuthorizationResult};
use crate::query::Query;
use crate::record::Record;
use crate::rule::Action;
use crate::schema::ResourceType;

/// The façade operation a hook is running for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// In-memory authorization of a record.
    Authorize,
    /// Compilation of a query scope.
    Scope,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Authorize => write!(f, "authorize"),
            Stage::Scope => write!(f, "scope"),
        }
    }
}

/// What a hook inspects: a record during [`Stage::Authorize`], a query
/// during [`Stage::Scope`]
#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    /// The record being authorized
    Record(Record),
    /// The query being scoped
    Query(Query),
}

impl Subject {
    fn kind(&self) -> &'static str {
        match self {
            Subject::Record(_) => "record",
            Subject::Query(_) => "query",
        }
    }

    fn fits(&self, stage: Stage) -> bool {
        matches!(
            (self, stage),
            (Subject::Record(_), Stage::Authorize) | (Subject::Query(_), Stage::Scope)
        )
    }
}

/// Outcome of a single hook
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Go on with the given subject.
    Continue(Subject),
    /// Stop here and deny.
    Halt,
}

/// Which resource types a hook applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookScope {
    /// Every resource type
    All,
    /// Only the given resource type
    Type(ResourceType),
}

impl HookScope {
    fn covers(&self, resource_type: &ResourceType) -> bool {
        match self {
            HookScope::All => true,
            HookScope::Type(scoped) => scoped == resource_type,
        }
    }
}

impl Display for HookScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HookScope::All => write!(f, "all resource types"),
            HookScope::Type(resource_type) => write!(f, "resource type \"{resource_type}\""),
        }
    }
}

impl From<ResourceType> for HookScope {
    fn from(resource_type: ResourceType) -> Self {
        HookScope::Type(resource_type)
    }
}

impl From<&str> for HookScope {
    fn from(resource_type: &str) -> Self {
        HookScope::Type(resource_type.into())
    }
}

/// Hook function type.
pub type HookFn = Arc<dyn Fn(Stage, Subject, &Action) -> AuthorizationResult<Flow> + Send + Sync>;

/// A named interceptor
#[derive(Clone)]
pub struct Hook {
    name: String,
    scope: HookScope,
    run: HookFn,
}

impl Hook {
    /// A hook registered under `name` for `scope`.
    ///
    /// `run` receives the stage, the current subject and the action. It
    /// returns [`Flow::Continue`] with the subject to pass on, possibly
    /// transformed, or [`Flow::Halt`] to deny.
    pub fn new<F>(name: impl Into<String>, scope: impl Into<HookScope>, run: F) -> Self
    where
        F: Fn(Stage, Subject, &Action) -> AuthorizationResult<Flow> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            scope: scope.into(),
            run: Arc::new(run),
        }
    }

    /// Name the hook is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource types the hook runs for.
    pub fn scope(&self) -> &HookScope {
        &self.scope
    }

    /// Returns `true` if this hook is registered under `name` for `scope`.
    pub fn collides_with(&self, name: &str, scope: &HookScope) -> bool {
        self.name == name && &self.scope == scope
    }
}

impl Debug for Hook {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Runs the hooks that apply to `resource_type`: those scoped to all types
/// first, then those scoped to the type itself, each group in registration
/// order. Returns `None` when a hook halted.
pub fn run_hooks(
    hooks: &[Hook],
    stage: Stage,
    resource_type: &ResourceType,
    mut subject: Subject,
    action: &Action,
) -> AuthorizationResult<Option<Subject>> {
    let global = hooks.iter().filter(|hook| hook.scope == HookScope::All);
    let scoped = hooks
        .iter()
        .filter(|hook| hook.scope != HookScope::All && hook.scope.covers(resource_type));

    for hook in global.chain(scoped) {
        match (hook.run)(stage, subject, action)? {
            Flow::Continue(next) if next.fits(stage) => subject = next,
            Flow::Continue(next) => {
                return Err(AuthorizationError::HookSubject {
                    hook: hook.name.clone(),
                    stage: stage.to_string(),
                    actual: next.kind().to_string(),
                });
            }
            Flow::Halt => {
                debug!(
                    hook = %hook.name,
                    %stage,
                    %resource_type,
                    %action,
                    "Hook halted"
                );
                return Ok(None);
            }
        }
    }

    Ok(Some(subject))
}
