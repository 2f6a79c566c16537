//! Rules: the allow and deny conditions of one resource type and action.

use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::schema::ResourceType;

/// What an actor wants to do with a resource, such as `"read"` or `"edit"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action(Arc<str>);

impl Action {
    /// Creates an action from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the name of this action.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&Action> for Action {
    fn from(action: &Action) -> Self {
        action.clone()
    }
}

impl Borrow<str> for Action {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The allow and deny conditions registered for one resource type and action.
///
/// Both lists are kept most recent first. A resource is authorized when any
/// allow condition matches and no deny condition does.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Resource type the rule applies to.
    pub resource_type: ResourceType,
    /// Action the rule applies to.
    pub action: Action,
    /// Conditions granting the action.
    pub allow: Vec<Condition>,
    /// Conditions revoking the action.
    pub deny: Vec<Condition>,
}

impl Rule {
    /// A rule without conditions. It authorizes nothing.
    pub fn new(resource_type: impl Into<ResourceType>, action: impl Into<Action>) -> Self {
        Self {
            resource_type: resource_type.into(),
            action: action.into(),
            allow: vec![],
            deny: vec![],
        }
    }

    /// Returns `true` if some condition could grant the action.
    pub fn any_allowed(&self) -> bool {
        !self.allow.is_empty()
    }

    /// Returns `true` if an unconditional deny has been registered.
    pub fn is_blanket_denied(&self) -> bool {
        self.deny.iter().any(Condition::is_always)
    }

    /// Adds an allow condition. A blanket deny shadows every later allow,
    /// so in that case the condition is dropped.
    pub fn allow(mut self, condition: Condition) -> Self {
        if self.is_blanket_denied() {
            return self;
        }
        self.allow.insert(0, condition);
        self
    }

    /// Adds a deny condition. An unconditional deny makes every allow
    /// registered so far unreachable, so it replaces both lists.
    pub fn deny(mut self, condition: Condition) -> Self {
        if condition.is_always() {
            self.allow.clear();
            self.deny = vec![condition];
        } else {
            self.deny.insert(0, condition);
        }
        self
    }
}
