//! Policies: every rule and hook that applies to one actor.
//!
//! A [`Policy`] is a value. Each builder method consumes it and returns the
//! updated policy, so a finished policy can be cached and shared between
//! threads without coordination.

use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::trace;

use crate::condition::{Clause, Condition};
use crate::error::{AuthorizationError, AuthorizationResult};
use crate::hook::{Hook, HookScope};
use crate::rule::{Action, Rule};
use crate::schema::{ResourceType, Schema};

/// Rules keyed by resource type and action, plus the hooks that run before
/// any of them
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: BTreeMap<(ResourceType, Action), Rule>,
    hooks: Vec<Hook>,
}

impl Policy {
    /// An empty policy. It authorizes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `action` on resources of `resource_type` that match
    /// `condition`.
    ///
    /// Does nothing once an unconditional deny has been registered for the
    /// same resource type and action.
    pub fn allow(
        self,
        action: impl Into<Action>,
        resource_type: impl Into<ResourceType>,
        condition: impl Into<Condition>,
    ) -> Self {
        let condition = condition.into();
        self.update(action.into(), resource_type.into(), |rule| {
            rule.allow(condition)
        })
    }

    /// Revokes `action` on resources of `resource_type` that match
    /// `condition`.
    ///
    /// An unconditional deny discards every allow registered so far for
    /// the same resource type and action.
    pub fn deny(
        self,
        action: impl Into<Action>,
        resource_type: impl Into<ResourceType>,
        condition: impl Into<Condition>,
    ) -> Self {
        let condition = condition.into();
        self.update(action.into(), resource_type.into(), |rule| rule.deny(condition))
    }

    fn update(
        mut self,
        action: Action,
        resource_type: ResourceType,
        change: impl FnOnce(Rule) -> Rule,
    ) -> Self {
        let key = (resource_type, action);
        let rule = self
            .rules
            .remove(&key)
            .unwrap_or_else(|| Rule::new(key.0.clone(), key.1.clone()));
        self.rules.insert(key, change(rule));
        self
    }

    /// The rule registered for `action` on `resource_type`, or an empty
    /// rule when there is none.
    pub fn rule_for(
        &self,
        action: impl Into<Action>,
        resource_type: impl Into<ResourceType>,
    ) -> Cow<'_, Rule> {
        let key = (resource_type.into(), action.into());
        match self.rules.get(&key) {
            Some(rule) => Cow::Borrowed(rule),
            None => Cow::Owned(Rule::new(key.0, key.1)),
        }
    }

    /// Returns `true` if some resource of `resource_type` could be
    /// authorized for `action`. A `false` answer means no permission exists
    /// at all, as opposed to a permission that happens to match nothing.
    pub fn any_authorized(
        &self,
        action: impl Into<Action>,
        resource_type: impl Into<ResourceType>,
    ) -> bool {
        self.rule_for(action, resource_type).any_allowed()
    }

    /// Iterates over all registered rules.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Hooks in registration order.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Attaches a hook. Fails when a hook with the same name is already
    /// attached for the same scope.
    pub fn attach_hook(mut self, hook: Hook) -> AuthorizationResult<Self> {
        if self.has_hook(hook.name(), hook.scope()) {
            return Err(AuthorizationError::DuplicateHook {
                name: hook.name().to_string(),
                scope: hook.scope().to_string(),
            });
        }
        self.hooks.push(hook);
        Ok(self)
    }

    /// Attaches a hook unless one with the same name is already attached
    /// for the same scope.
    pub fn attach_new_hook(mut self, hook: Hook) -> Self {
        if !self.has_hook(hook.name(), hook.scope()) {
            self.hooks.push(hook);
        }
        self
    }

    /// Removes the hook attached under `name` for `scope`, if any.
    pub fn detach_hook(mut self, name: &str, scope: impl Into<HookScope>) -> Self {
        let scope = scope.into();
        self.hooks.retain(|hook| !hook.collides_with(name, &scope));
        self
    }

    fn has_hook(&self, name: &str, scope: &HookScope) -> bool {
        self.hooks.iter().any(|hook| hook.collides_with(name, scope))
    }

    /// Checks the rule for `action` on `resource_type` and every rule it
    /// derives from, without looking at any record or query.
    ///
    /// Both ways of applying a policy run this first, so a malformed rule
    /// fails the same way whatever it is applied to. Besides the checks of
    /// [`Condition::validate`], derived permissions need a primary key and
    /// may not nest more than `max_depth` times. A cycle of derived
    /// permissions always fails with
    /// [`AuthorizationError::DerivationDepthExceeded`].
    pub fn check<S: Schema + ?Sized>(
        &self,
        schema: &S,
        action: &Action,
        resource_type: &ResourceType,
        max_depth: usize,
    ) -> AuthorizationResult<()> {
        let mut derivations = Derivations {
            policy: self,
            schema,
            max_depth,
            path: vec![],
            heights: BTreeMap::new(),
        };
        derivations.visit((resource_type.clone(), action.clone()))?;
        Ok(())
    }

    /// Checks every condition against `schema`, reporting the first unknown
    /// resource type, field or association, or the first literal that
    /// cannot be coerced.
    pub fn validate<S: Schema + ?Sized>(&self, schema: &S) -> AuthorizationResult<()> {
        for rule in self.rules.values() {
            for condition in rule.allow.iter().chain(&rule.deny) {
                condition.validate(schema, &rule.resource_type)?;
            }
        }
        for hook in &self.hooks {
            if let HookScope::Type(resource_type) = hook.scope() {
                if !schema.contains(resource_type) {
                    return Err(AuthorizationError::UnknownResourceType {
                        resource_type: resource_type.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Depth-first walk over the rules a rule derives from
struct Derivations<'a, S: Schema + ?Sized> {
    policy: &'a Policy,
    schema: &'a S,
    max_depth: usize,
    /// Rules being checked, outermost first
    path: Vec<(ResourceType, Action)>,
    /// Longest chain of derivations below each rule already checked
    heights: BTreeMap<(ResourceType, Action), usize>,
}

impl<S: Schema + ?Sized> Derivations<'_, S> {
    fn exceeded(&self, (resource_type, action): &(ResourceType, Action)) -> AuthorizationError {
        AuthorizationError::DerivationDepthExceeded {
            resource_type: resource_type.to_string(),
            action: action.to_string(),
            depth: self.max_depth,
        }
    }

    /// Checks the rule under `key` and returns the height of its
    /// derivation chain.
    fn visit(&mut self, key: (ResourceType, Action)) -> AuthorizationResult<usize> {
        let depth = self.path.len();
        if let Some(height) = self.heights.get(&key) {
            if depth + height > self.max_depth {
                return Err(self.exceeded(&key));
            }
            return Ok(*height);
        }
        if depth > self.max_depth || self.path.contains(&key) {
            return Err(self.exceeded(&key));
        }

        let rule = self.policy.rule_for(key.1.clone(), key.0.clone());
        let mut derived = vec![];
        for condition in rule.allow.iter().chain(&rule.deny) {
            condition.validate(self.schema, &key.0)?;
            self.collect(condition, &key.0, &mut derived)?;
        }

        trace!(resource_type = %key.0, action = %key.1, depth, "Checking derivations");
        self.path.push(key.clone());
        let mut height = 0;
        for target in derived {
            height = height.max(self.visit(target)? + 1);
        }
        self.path.pop();

        self.heights.insert(key, height);
        Ok(height)
    }

    /// Gathers the rules `condition` derives from, following associations
    /// into the related types.
    fn collect(
        &self,
        condition: &Condition,
        resource_type: &ResourceType,
        derived: &mut Vec<(ResourceType, Action)>,
    ) -> AuthorizationResult<()> {
        for clause in condition.clauses() {
            match clause {
                Clause::Derived(action) => {
                    if self.schema.primary_key(resource_type).is_none() {
                        return Err(AuthorizationError::MissingPrimaryKey {
                            resource_type: resource_type.to_string(),
                        });
                    }
                    derived.push((resource_type.clone(), action.clone()));
                }
                Clause::Negate(condition) => self.collect(condition, resource_type, derived)?,
                Clause::Or(left, right) => {
                    self.collect(left, resource_type, derived)?;
                    self.collect(right, resource_type, derived)?;
                }
                Clause::Association { field, condition } => {
                    if let Some(info) = self.schema.association(resource_type, field) {
                        self.collect(condition, &info.related, derived)?;
                    }
                }
                Clause::Equals { .. } | Clause::IsNull { .. } | Clause::Predicate { .. } => {}
            }
        }
        Ok(())
    }
}

/// Anything a façade call accepts as "the policy": a ready [`Policy`], or
/// an actor paired with the [`BuildPolicy`] that derives its policy
pub trait AsPolicy {
    /// The policy to apply, borrowed when it already exists.
    fn as_policy(&self) -> AuthorizationResult<Cow<'_, Policy>>;
}

impl AsPolicy for Policy {
    fn as_policy(&self) -> AuthorizationResult<Cow<'_, Policy>> {
        Ok(Cow::Borrowed(self))
    }
}

impl<P: AsPolicy + ?Sized> AsPolicy for &P {
    fn as_policy(&self) -> AuthorizationResult<Cow<'_, Policy>> {
        (**self).as_policy()
    }
}

/// Builds the policy of an actor
///
/// ```
/// use warden::{AuthorizationResult, BuildPolicy, Policy, Where};
///
/// struct Forum;
///
/// impl BuildPolicy for Forum {
///     type Actor = i64;
///
///     fn build_policy(&self, policy: Policy, user_id: &i64) -> AuthorizationResult<Policy> {
///         Ok(policy
///             .allow("read", "thread", Where::new().field("archived", false))
///             .allow("edit", "post", Where::new().field("author_id", *user_id)))
///     }
/// }
///
/// let policy = Forum.policy_for(&7).unwrap();
/// assert!(policy.any_authorized("edit", "post"));
/// ```
pub trait BuildPolicy {
    /// Whoever the policy is built for
    type Actor;

    /// Adds the actor's rules and hooks to `policy`.
    fn build_policy(&self, policy: Policy, actor: &Self::Actor) -> AuthorizationResult<Policy>;

    /// Builds the actor's policy starting from an empty one.
    fn policy_for(&self, actor: &Self::Actor) -> AuthorizationResult<Policy> {
        self.build_policy(Policy::new(), actor)
    }

    /// Pairs this builder with an actor, to be passed where a policy is
    /// expected.
    fn for_actor<'a>(&'a self, actor: &'a Self::Actor) -> ForActor<'a, Self>
    where
        Self: Sized,
    {
        ForActor {
            builder: self,
            actor,
        }
    }
}

/// An actor whose policy is built on demand
pub struct ForActor<'a, B: BuildPolicy> {
    builder: &'a B,
    actor: &'a B::Actor,
}

impl<B: BuildPolicy> AsPolicy for ForActor<'_, B> {
    fn as_policy(&self) -> AuthorizationResult<Cow<'_, Policy>> {
        Ok(Cow::Owned(self.builder.policy_for(self.actor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Where, allows};
    use crate::hook::Flow;
    use crate::schema::{Entity, Registry};
    use crate::value::StorageType;
    use pretty_assertions::assert_eq;

    fn pass(name: &str, scope: impl Into<HookScope>) -> Hook {
        Hook::new(name, scope, |_, subject, _| Ok(Flow::Continue(subject)))
    }

    #[test]
    fn test_unregistered_rule_is_empty() {
        let policy = Policy::new();
        let rule = policy.rule_for("read", "thread");

        assert_eq!(rule.allow, vec![]);
        assert_eq!(rule.deny, vec![]);
        assert!(!policy.any_authorized("read", "thread"));
    }

    #[test]
    fn test_rules_are_merged_per_key() {
        let policy = Policy::new()
            .allow("read", "thread", Where::new().field("archived", false))
            .allow("read", "thread", Where::new().field("pinned", true))
            .allow("edit", "thread", Condition::always());

        assert_eq!(policy.rules().count(), 2);
        assert_eq!(policy.rule_for("read", "thread").allow.len(), 2);
    }

    #[test]
    fn test_blanket_deny_shadows_later_allow() {
        let policy = Policy::new()
            .allow("read", "thread", Condition::always())
            .deny("read", "thread", Condition::always())
            .allow("read", "thread", Where::new().field("archived", false));

        assert!(!policy.any_authorized("read", "thread"));
        assert_eq!(policy.rule_for("read", "thread").allow, vec![]);
    }

    #[test]
    fn test_policies_are_values() {
        let base = Policy::new().allow("read", "thread", Condition::always());
        let extended = base.clone().deny("read", "thread", Condition::always());

        assert!(base.any_authorized("read", "thread"));
        assert!(!extended.any_authorized("read", "thread"));
    }

    #[test]
    fn test_duplicate_hook_is_rejected() {
        let policy = Policy::new()
            .attach_hook(pass("preload", HookScope::All))
            .and_then(|policy| policy.attach_hook(pass("preload", "thread")));
        assert!(policy.is_ok());

        let duplicate = policy.and_then(|policy| policy.attach_hook(pass("preload", "thread")));
        assert_eq!(
            duplicate.map(|policy| policy.hooks().len()),
            Err(AuthorizationError::DuplicateHook {
                name: "preload".into(),
                scope: "resource type \"thread\"".into(),
            })
        );
    }

    #[test]
    fn test_attach_new_hook_keeps_the_first() {
        let policy = Policy::new()
            .attach_new_hook(pass("preload", HookScope::All))
            .attach_new_hook(pass("preload", HookScope::All));

        assert_eq!(policy.hooks().len(), 1);
    }

    #[test]
    fn test_detach_hook() {
        let policy = Policy::new()
            .attach_new_hook(pass("preload", HookScope::All))
            .attach_new_hook(pass("preload", "thread"))
            .detach_hook("preload", "thread")
            .detach_hook("missing", HookScope::All);

        assert_eq!(policy.hooks().len(), 1);
        assert_eq!(policy.hooks()[0].scope(), &HookScope::All);
    }

    #[test]
    fn test_validate_walks_every_rule() {
        let registry = Registry::new().entity(
            Entity::new("thread")
                .field("archived", StorageType::Boolean)
                .field("pinned", StorageType::Boolean),
        );

        let valid = Policy::new()
            .allow("read", "thread", Where::new().field("archived", false))
            .deny("read", "thread", Where::new().field("pinned", false));
        assert_eq!(valid.validate(&registry), Ok(()));

        let invalid = valid.deny("read", "thread", Where::new().field("locked", true));
        assert_eq!(
            invalid.validate(&registry),
            Err(AuthorizationError::UnknownField {
                resource_type: "thread".into(),
                field: "locked".into(),
            })
        );

        let unknown_type = Policy::new().allow("read", "forum", Condition::always());
        assert_eq!(
            unknown_type.validate(&registry),
            Err(AuthorizationError::UnknownResourceType {
                resource_type: "forum".into(),
            })
        );
    }

    fn forum() -> Registry {
        Registry::new()
            .entity(
                Entity::new("thread")
                    .field("archived", StorageType::Boolean)
                    .has_many("posts", "post", "thread_id"),
            )
            .entity(
                Entity::new("post")
                    .field("thread_id", StorageType::Integer)
                    .belongs_to("thread", "thread", "thread_id"),
            )
    }

    #[test]
    fn test_check_follows_derived_rules() {
        let registry = forum();
        let post = ResourceType::from("post");
        let read = Action::from("read");
        let chained = Policy::new()
            .allow("read", "post", Where::new().field("thread", allows("view")))
            .allow("view", "thread", Where::new().allows("moderate"))
            .allow("moderate", "thread", Where::new().field("archived", false));

        assert_eq!(chained.check(&registry, &read, &post, 2), Ok(()));
        assert_eq!(
            chained.check(&registry, &read, &post, 1),
            Err(AuthorizationError::DerivationDepthExceeded {
                resource_type: "thread".into(),
                action: "moderate".into(),
                depth: 1,
            })
        );

        let broken = chained.allow("moderate", "thread", Where::new().field("locked", true));
        assert_eq!(
            broken.check(&registry, &read, &post, 16),
            Err(AuthorizationError::UnknownField {
                resource_type: "thread".into(),
                field: "locked".into(),
            })
        );
    }

    #[test]
    fn test_check_rejects_cycles_behind_alternatives() {
        let registry = forum();
        let policy = Policy::new()
            .allow(
                "read",
                "thread",
                Condition::new()
                    .r#where(Where::new().field("archived", false))
                    .or_where(Where::new().field("posts", allows("read"))),
            )
            .allow("read", "post", Where::new().field("thread", allows("read")));

        assert_eq!(
            policy.check(&registry, &Action::from("read"), &ResourceType::from("thread"), 16),
            Err(AuthorizationError::DerivationDepthExceeded {
                resource_type: "thread".into(),
                action: "read".into(),
                depth: 16,
            })
        );
    }

    #[test]
    fn test_check_reuses_shared_derivations() {
        let registry = forum();
        let policy = Policy::new()
            .allow("read", "post", Where::new().field("thread", allows("view")))
            .allow("read", "post", Where::new().allows("audit"))
            .allow("audit", "post", Where::new().field("thread", allows("view")))
            .allow("view", "thread", Where::new().field("archived", false));
        let post = ResourceType::from("post");

        assert_eq!(policy.check(&registry, &Action::from("read"), &post, 2), Ok(()));
        assert_eq!(
            policy.check(&registry, &Action::from("read"), &post, 1),
            Err(AuthorizationError::DerivationDepthExceeded {
                resource_type: "thread".into(),
                action: "view".into(),
                depth: 1,
            })
        );
    }

    struct Moderators;

    impl BuildPolicy for Moderators {
        type Actor = bool;

        fn build_policy(&self, policy: Policy, moderator: &bool) -> AuthorizationResult<Policy> {
            if *moderator {
                Ok(policy.allow("moderate", "thread", Condition::always()))
            } else {
                Ok(policy)
            }
        }
    }

    #[test]
    fn test_policy_built_for_actor() -> anyhow::Result<()> {
        let builder = Moderators;
        let moderator = builder.for_actor(&true);
        let member = builder.for_actor(&false);

        assert!(moderator.as_policy()?.any_authorized("moderate", "thread"));
        assert!(!member.as_policy()?.any_authorized("moderate", "thread"));
        Ok(())
    }
}
