//! In-memory evaluation of rules against loaded records.

use tracing::trace;

use crate::condition::{Clause, Condition};
use crate::error::{AuthorizationError, AuthorizationResult};
use crate::hook::{Stage, Subject, run_hooks};
use crate::logic::{all, any, permit};
use crate::policy::Policy;
use crate::query::Op;
use crate::record::{Loaded, Loader, Record};
use crate::rule::{Action, Rule};
use crate::schema::{ResourceType, Schema};
use crate::value::StorageType;

/// Walks the rules of a policy over a record and the records associated
/// with it.
///
/// Associations are read from the record. A missing association is loaded
/// through `loader` when there is one and is an error otherwise. Loaded
/// associations stay attached, so the record handed back on success may
/// carry more than the one passed in.
pub struct Evaluator<'a, S: Schema + ?Sized> {
    schema: &'a S,
    policy: &'a Policy,
    loader: Option<&'a dyn Loader>,
    max_depth: usize,
}

impl<'a, S: Schema + ?Sized> Evaluator<'a, S> {
    /// Derived permissions may nest at most `max_depth` times.
    pub fn new(
        schema: &'a S,
        policy: &'a Policy,
        loader: Option<&'a dyn Loader>,
        max_depth: usize,
    ) -> Self {
        Self {
            schema,
            policy,
            loader,
            max_depth,
        }
    }

    /// Runs the authorize hooks, then the rule for the record's type and
    /// `action`. Returns the record when it is authorized.
    ///
    /// At depth zero the rule and everything it derives from are checked
    /// with [`Policy::check`] first.
    pub fn authorize(
        &self,
        record: Record,
        action: &Action,
        depth: usize,
    ) -> AuthorizationResult<Option<Record>> {
        let resource_type = record.resource_type().clone();
        let mut record = match run_hooks(
            self.policy.hooks(),
            Stage::Authorize,
            &resource_type,
            Subject::Record(record),
            action,
        )? {
            Some(Subject::Record(record)) => record,
            _ => return Ok(None),
        };

        let resource_type = record.resource_type().clone();
        if !self.schema.contains(&resource_type) {
            return Err(AuthorizationError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            });
        }

        if depth == 0 {
            self.policy
                .check(self.schema, action, &resource_type, self.max_depth)?;
        }

        let rule = self.policy.rule_for(action, &resource_type);
        if self.rule_matches(&rule, &mut record, depth)? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    fn rule_matches(&self, rule: &Rule, record: &mut Record, depth: usize) -> AuthorizationResult<bool> {
        let allowed = any(&rule.allow, |condition| {
            self.condition_matches(condition, record, depth)
        })?;
        permit(allowed, || {
            any(&rule.deny, |condition| {
                self.condition_matches(condition, record, depth)
            })
        })
    }

    fn condition_matches(
        &self,
        condition: &Condition,
        record: &mut Record,
        depth: usize,
    ) -> AuthorizationResult<bool> {
        all(condition.clauses(), |clause| {
            self.clause_matches(clause, record, depth)
        })
    }

    fn clause_matches(
        &self,
        clause: &Clause,
        record: &mut Record,
        depth: usize,
    ) -> AuthorizationResult<bool> {
        match clause {
            Clause::Equals { field, value } => {
                let storage_type = self.field_type(record.resource_type(), field)?;
                let literal = self
                    .schema
                    .dump(storage_type, value)
                    .map_err(|error| error.for_field(field))?;
                Ok(Op::Eq.test(record.get(field), &literal))
            }
            Clause::IsNull { field } => {
                self.field_type(record.resource_type(), field)?;
                Ok(record.get(field).is_null())
            }
            Clause::Negate(condition) => Ok(!self.condition_matches(condition, record, depth)?),
            Clause::Or(left, right) => any([left, right], |condition| {
                self.condition_matches(condition, record, depth)
            }),
            Clause::Association { field, condition } => {
                self.association_matches(field, condition, record, depth)
            }
            Clause::Derived(action) => self.derived_matches(action, record, depth),
            Clause::Predicate { field, predicate } => {
                self.field_type(record.resource_type(), field)?;
                predicate.as_boolean(record, field)
            }
        }
    }

    fn association_matches(
        &self,
        association: &str,
        condition: &Condition,
        record: &mut Record,
        depth: usize,
    ) -> AuthorizationResult<bool> {
        let resource_type = record.resource_type().clone();
        if self.schema.association(&resource_type, association).is_none() {
            return Err(AuthorizationError::UnknownAssociation {
                resource_type: resource_type.to_string(),
                association: association.to_string(),
            });
        }

        if !record.is_loaded(association) {
            let Some(loader) = self.loader else {
                return Err(AuthorizationError::NotLoaded {
                    resource_type: resource_type.to_string(),
                    association: association.to_string(),
                });
            };
            let loaded = loader.load(record, association).map_err(|error| {
                AuthorizationError::Load {
                    resource_type: resource_type.to_string(),
                    association: association.to_string(),
                    message: error.message,
                }
            })?;
            record.set_loaded(association, loaded);
        }

        match record.loaded_mut(association) {
            Some(Loaded::One(Some(related))) => self.condition_matches(condition, related, depth),
            Some(Loaded::Many(related)) => any(related.iter_mut(), |related| {
                self.condition_matches(condition, related, depth)
            }),
            Some(Loaded::One(None)) | None => Ok(false),
        }
    }

    fn derived_matches(
        &self,
        action: &Action,
        record: &mut Record,
        depth: usize,
    ) -> AuthorizationResult<bool> {
        if depth >= self.max_depth {
            return Err(AuthorizationError::DerivationDepthExceeded {
                resource_type: record.resource_type().to_string(),
                action: action.to_string(),
                depth: self.max_depth,
            });
        }
        trace!(resource_type = %record.resource_type(), %action, depth, "Evaluating derived permission");

        match self.authorize(record.clone(), action, depth + 1)? {
            Some(authorized) => {
                *record = authorized;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn field_type(
        &self,
        resource_type: &ResourceType,
        field: &str,
    ) -> AuthorizationResult<StorageType> {
        self.schema
            .field_type(resource_type, field)
            .ok_or_else(|| AuthorizationError::UnknownField {
                resource_type: resource_type.to_string(),
                field: field.to_string(),
            })
    }
}
