//! Lowering of rules into query predicates.
//!
//! The compiler walks the same clause trees as [`crate::evaluator`] and
//! folds them with the same [`crate::logic`] helpers, producing an [`Expr`]
//! over bindings instead of a `bool`:
//!
//! - `Equals` and `IsNull` test a field of the current binding.
//! - A to-one `Association` left-joins the related type under a fresh
//!   binding and requires the joined row to be present.
//! - A to-many `Association` becomes a correlated [`Expr::Exists`], so that
//!   "some related record matches" keeps its meaning under negation.
//! - `Derived` compiles the scope of the same resource type for the
//!   delegated action and keeps the rows whose primary key it selects.
//! - `Predicate` defers to the predicate's query form.

use tracing::{debug, trace};

use crate::condition::{Clause, Condition};
use crate::error::{AuthorizationError, AuthorizationResult};
use crate::hook::{Stage, Subject, run_hooks};
use crate::logic::{Logic, all, any, permit};
use crate::policy::Policy;
use crate::query::{Binding, Correlated, Expr, Join, Preload, PreloadPlan, Query, Source};
use crate::rule::{Action, Rule};
use crate::schema::{Cardinality, ResourceType, Schema};

/// Joins collected while compiling a predicate, and the next free binding
#[derive(Debug)]
struct Filter {
    next: Binding,
    joins: Vec<Join>,
}

impl Filter {
    fn starting_at(next: Binding) -> Self {
        Self {
            next,
            joins: vec![],
        }
    }

    fn fresh(&mut self) -> Binding {
        let binding = self.next;
        self.next = binding.next();
        binding
    }

    /// A filter for a correlated subquery: joins of its own, bindings
    /// still unique within the enclosing query.
    fn nested(&self) -> Filter {
        Filter::starting_at(self.next)
    }

    fn resume_after(&mut self, nested: &Filter) {
        self.next = self.next.max(nested.next);
    }
}

/// Compiles rules of a policy into predicates of a [`Query`]
pub struct Compiler<'a, S: Schema + ?Sized> {
    schema: &'a S,
    policy: &'a Policy,
    max_depth: usize,
}

impl<'a, S: Schema + ?Sized> Compiler<'a, S> {
    /// Derived permissions may nest at most `max_depth` times.
    pub fn new(schema: &'a S, policy: &'a Policy, max_depth: usize) -> Self {
        Self {
            schema,
            policy,
            max_depth,
        }
    }

    /// Restricts `query` to the rows authorized for `action` and attaches
    /// a plan for each requested preload.
    ///
    /// At depth zero the rule and everything it derives from are checked
    /// with [`Policy::check`] first, unless a hook halted.
    pub fn scope(
        &self,
        query: Query,
        action: &Action,
        preloads: &[Preload],
        depth: usize,
    ) -> AuthorizationResult<Query> {
        let resource_type = self.resolve(&query)?;
        debug!(%resource_type, %action, depth, "Compiling scope");

        let halted = query.clone();
        let (query, rule) = match run_hooks(
            self.policy.hooks(),
            Stage::Scope,
            &resource_type,
            Subject::Query(query),
            action,
        )? {
            Some(Subject::Query(query)) => {
                let resource_type = self.resolve(&query)?;
                if depth == 0 {
                    self.policy
                        .check(self.schema, action, &resource_type, self.max_depth)?;
                }
                let rule = self.policy.rule_for(action, resource_type);
                (query, rule.into_owned())
            }
            _ => (halted, Rule::new(resource_type, action)),
        };
        let resource_type = rule.resource_type.clone();

        let mut filter = Filter::starting_at(query.last_binding().next());
        let predicate = self.rule(&rule, &resource_type, Binding::ROOT, &mut filter, depth)?;

        let mut query = query.filter(predicate);
        query.joins.extend(filter.joins.drain(..));
        for preload in preloads {
            let plan = self.preload(
                preload,
                &resource_type,
                Binding::ROOT,
                &mut filter,
                action,
                depth,
            )?;
            query.preloads.push(plan);
        }
        Ok(query)
    }

    fn resolve(&self, query: &Query) -> AuthorizationResult<ResourceType> {
        let resource_type = match &query.source {
            Source::Type(resource_type) => resource_type.clone(),
            Source::Unlabeled(name) => {
                return Err(AuthorizationError::UnresolvedResourceType {
                    source_name: name.clone(),
                });
            }
        };
        if !self.schema.contains(&resource_type) {
            return Err(AuthorizationError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            });
        }
        Ok(resource_type)
    }

    fn rule(
        &self,
        rule: &Rule,
        resource_type: &ResourceType,
        binding: Binding,
        filter: &mut Filter,
        depth: usize,
    ) -> AuthorizationResult<Expr> {
        let allowed = any(&rule.allow, |condition| {
            self.condition(condition, resource_type, binding, filter, depth)
        })?;
        permit(allowed, || {
            any(&rule.deny, |condition| {
                self.condition(condition, resource_type, binding, filter, depth)
            })
        })
    }

    fn condition(
        &self,
        condition: &Condition,
        resource_type: &ResourceType,
        binding: Binding,
        filter: &mut Filter,
        depth: usize,
    ) -> AuthorizationResult<Expr> {
        all(condition.clauses(), |clause| {
            self.clause(clause, resource_type, binding, filter, depth)
        })
    }

    fn clause(
        &self,
        clause: &Clause,
        resource_type: &ResourceType,
        binding: Binding,
        filter: &mut Filter,
        depth: usize,
    ) -> AuthorizationResult<Expr> {
        match clause {
            Clause::Equals { field, value } => {
                let storage_type = self.schema.field_type(resource_type, field).ok_or_else(|| {
                    unknown_field(resource_type, field)
                })?;
                let literal = self
                    .schema
                    .dump(storage_type, value)
                    .map_err(|error| error.for_field(field))?;
                Ok(Expr::eq(binding, field.as_str(), literal))
            }
            Clause::IsNull { field } => {
                self.require_field(resource_type, field)?;
                Ok(Expr::is_null(binding, field.as_str()))
            }
            Clause::Negate(condition) => Ok(self
                .condition(condition, resource_type, binding, filter, depth)?
                .not()),
            Clause::Or(left, right) => any([left, right], |condition| {
                self.condition(condition, resource_type, binding, filter, depth)
            }),
            Clause::Association { field, condition } => {
                self.association(field, condition, resource_type, binding, filter, depth)
            }
            Clause::Derived(action) => self.derived(action, resource_type, binding, depth),
            Clause::Predicate { field, predicate } => {
                self.require_field(resource_type, field)?;
                predicate.as_predicate(binding, field)
            }
        }
    }

    fn association(
        &self,
        association: &str,
        condition: &Condition,
        resource_type: &ResourceType,
        binding: Binding,
        filter: &mut Filter,
        depth: usize,
    ) -> AuthorizationResult<Expr> {
        let info = self
            .schema
            .association(resource_type, association)
            .ok_or_else(|| AuthorizationError::UnknownAssociation {
                resource_type: resource_type.to_string(),
                association: association.to_string(),
            })?;
        let related = filter.fresh();

        match info.cardinality {
            Cardinality::One => {
                filter
                    .joins
                    .push(Join::new(binding, association, related, info));
                let predicate = self.condition(condition, &info.related, related, filter, depth)?;
                Ok(Expr::Present(related).and(predicate))
            }
            Cardinality::Many => {
                let mut nested = filter.nested();
                let predicate =
                    self.condition(condition, &info.related, related, &mut nested, depth)?;
                filter.resume_after(&nested);
                if predicate.is_never() {
                    return Ok(Expr::False);
                }
                Ok(Expr::Exists(Box::new(Correlated {
                    parent: binding,
                    association: association.to_string(),
                    binding: related,
                    related: info.related.clone(),
                    owner_key: info.owner_key.clone(),
                    related_key: info.related_key.clone(),
                    joins: nested.joins,
                    predicate,
                })))
            }
        }
    }

    fn derived(
        &self,
        action: &Action,
        resource_type: &ResourceType,
        binding: Binding,
        depth: usize,
    ) -> AuthorizationResult<Expr> {
        if depth >= self.max_depth {
            return Err(AuthorizationError::DerivationDepthExceeded {
                resource_type: resource_type.to_string(),
                action: action.to_string(),
                depth: self.max_depth,
            });
        }
        let primary_key = self.schema.primary_key(resource_type).ok_or_else(|| {
            AuthorizationError::MissingPrimaryKey {
                resource_type: resource_type.to_string(),
            }
        })?;
        trace!(%resource_type, %action, depth, "Compiling derived permission");

        let subquery = self.scope(Query::from(resource_type), action, &[], depth + 1)?;
        if subquery.predicate.is_never() {
            return Ok(Expr::False);
        }
        Ok(Expr::InQuery {
            binding,
            field: primary_key.to_string(),
            query: Box::new(subquery),
        })
    }

    fn preload(
        &self,
        preload: &Preload,
        resource_type: &ResourceType,
        parent: Binding,
        filter: &mut Filter,
        action: &Action,
        depth: usize,
    ) -> AuthorizationResult<PreloadPlan> {
        let info = self
            .schema
            .association(resource_type, &preload.association)
            .ok_or_else(|| AuthorizationError::UnknownAssociation {
                resource_type: resource_type.to_string(),
                association: preload.association.clone(),
            })?;
        let binding = filter.fresh();
        trace!(
            %resource_type,
            association = %preload.association,
            %binding,
            "Planning authorized preload"
        );

        let rule = self.policy.rule_for(action, &info.related);
        let mut nested = filter.nested();
        let predicate = self.rule(&rule, &info.related, binding, &mut nested, depth)?;
        filter.resume_after(&nested);

        let mut preloads = vec![];
        for child in &preload.nested {
            preloads.push(self.preload(child, &info.related, binding, filter, action, depth)?);
        }

        Ok(PreloadPlan {
            association: preload.association.clone(),
            parent,
            binding,
            related: info.related.clone(),
            owner_key: info.owner_key.clone(),
            related_key: info.related_key.clone(),
            cardinality: info.cardinality,
            joins: nested.joins,
            predicate,
            query: preload.query.clone().map(Box::new),
            preloads,
        })
    }

    fn require_field(&self, resource_type: &ResourceType, field: &str) -> AuthorizationResult<()> {
        match self.schema.field_type(resource_type, field) {
            Some(_) => Ok(()),
            None => Err(unknown_field(resource_type, field)),
        }
    }
}

fn unknown_field(resource_type: &ResourceType, field: &str) -> AuthorizationError {
    AuthorizationError::UnknownField {
        resource_type: resource_type.to_string(),
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Where, allows};
    use crate::query::Op;
    use crate::schema::{Entity, Registry};
    use crate::value::StorageType;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::new()
            .entity(
                Entity::new("thread")
                    .field("archived", StorageType::Boolean)
                    .has_many("posts", "post", "thread_id"),
            )
            .entity(
                Entity::new("post")
                    .field("thread_id", StorageType::Integer)
                    .field("hidden", StorageType::Boolean)
                    .belongs_to("thread", "thread", "thread_id"),
            )
    }

    fn archived(binding: Binding, flag: bool) -> Expr {
        Expr::eq(binding, "archived", flag)
    }

    #[test]
    fn test_allow_and_deny_combine() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new()
            .allow("read", "thread", Where::new().field("archived", false))
            .deny("read", "thread", Where::new().field("archived", true));
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(Query::from("thread"), &"read".into(), &[], 0)?;

        assert_eq!(
            query.predicate,
            archived(Binding::ROOT, false).and(archived(Binding::ROOT, true).not())
        );
        Ok(())
    }

    #[test]
    fn test_empty_rule_selects_nothing() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new()
            .allow("read", "thread", Condition::always())
            .deny("read", "thread", Condition::always());
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(Query::from("thread"), &"read".into(), &[], 0)?;

        assert_eq!(query.predicate, Expr::False);
        Ok(())
    }

    #[test]
    fn test_to_one_association_joins_a_fresh_binding() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new().allow(
            "read",
            "post",
            Where::new().field("thread", Where::new().field("archived", false)),
        );
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(Query::from("post"), &"read".into(), &[], 0)?;

        assert_eq!(query.joins.len(), 1);
        assert_eq!(query.joins[0].binding, Binding(1));
        assert_eq!(query.joins[0].owner_key, "thread_id");
        assert_eq!(
            query.predicate,
            Expr::Present(Binding(1)).and(archived(Binding(1), false))
        );
        Ok(())
    }

    #[test]
    fn test_to_many_association_is_correlated() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new().allow(
            "read",
            "thread",
            Condition::new()
                .where_not(Where::new().field("posts", Where::new().field("hidden", true))),
        );
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(Query::from("thread"), &"read".into(), &[], 0)?;

        let Expr::Not(inner) = &query.predicate else {
            panic!("expected a negation, got {}", query.predicate);
        };
        let Expr::Exists(correlated) = inner.as_ref() else {
            panic!("expected a correlated subquery, got {inner}");
        };
        assert_eq!(correlated.parent, Binding::ROOT);
        assert_eq!(correlated.related_key, "thread_id");
        assert_eq!(
            correlated.predicate,
            Expr::compare(correlated.binding, "hidden", Op::Eq, true)
        );
        assert!(query.joins.is_empty());
        Ok(())
    }

    #[test]
    fn test_derived_permission_compiles_to_subquery() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new()
            .allow("read", "post", Where::new().field("thread", allows("read")))
            .allow("read", "thread", Where::new().field("archived", false));
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(Query::from("post"), &"read".into(), &[], 0)?;

        let expected_subquery = Query::from("thread").filter(archived(Binding::ROOT, false));
        assert_eq!(
            query.predicate,
            Expr::Present(Binding(1)).and(Expr::InQuery {
                binding: Binding(1),
                field: "id".into(),
                query: Box::new(expected_subquery),
            })
        );
        Ok(())
    }

    #[test]
    fn test_unlabeled_source_cannot_be_scoped() {
        let registry = registry();
        let policy = Policy::new();
        let compiler = Compiler::new(&registry, &policy, 16);

        assert_eq!(
            compiler.scope(Query::unlabeled("threads"), &"read".into(), &[], 0),
            Err(AuthorizationError::UnresolvedResourceType {
                source_name: "threads".into(),
            })
        );
    }

    #[test]
    fn test_coercion_failure_is_reported() {
        let registry = registry();
        let policy = Policy::new().allow("read", "thread", Where::new().field("archived", 3.5));
        let compiler = Compiler::new(&registry, &policy, 16);

        assert!(matches!(
            compiler.scope(Query::from("thread"), &"read".into(), &[], 0),
            Err(AuthorizationError::Coercion { expected: StorageType::Boolean, .. })
        ));
    }

    #[test]
    fn test_preload_plan_filters_related_rows() -> anyhow::Result<()> {
        let registry = registry();
        let policy = Policy::new()
            .allow("read", "thread", Condition::always())
            .allow("read", "post", Where::new().field("hidden", false));
        let compiler = Compiler::new(&registry, &policy, 16);

        let query = compiler.scope(
            Query::from("thread"),
            &"read".into(),
            &[Preload::new("posts")],
            0,
        )?;

        assert_eq!(query.preloads.len(), 1);
        let plan = &query.preloads[0];
        assert_eq!(plan.parent, Binding::ROOT);
        assert_eq!(plan.cardinality, Cardinality::Many);
        assert_eq!(
            plan.predicate,
            Expr::eq(plan.binding, "hidden", false)
        );
        Ok(())
    }
}
