//! Conditions and the vocabulary used to write them.
//!
//! A [`Condition`] is a list of [`Clause`]s that must all match. Conditions
//! are written with [`Where`] field lists combined through
//! [`Condition::r#where`], [`Condition::where_not`] and
//! [`Condition::or_where`]:
//!
//! ```
//! use warden::{allows, Condition, Where};
//!
//! let condition = Condition::new()
//!     .r#where(Where::new().field("archived", false))
//!     .or_where(Where::new().field("thread", allows("moderate")));
//! assert_eq!(condition.clauses().len(), 1);
//! ```

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use itertools::Itertools;

use crate::error::{AuthorizationError, AuthorizationResult};
use crate::logic::Logic;
use crate::query::{Binding, Expr};
use crate::record::Record;
use crate::rule::Action;
use crate::schema::{ResourceType, Schema};
use crate::value::{StorageType, Value};

/// One atomic test of a condition
#[derive(Clone)]
pub enum Clause {
    /// The field equals the value.
    Equals {
        /// Field name
        field: String,
        /// Literal, coerced to the field's storage type before comparing
        value: Value,
    },
    /// The field has no value.
    IsNull {
        /// Field name
        field: String,
    },
    /// The wrapped condition does not match.
    Negate(Condition),
    /// Either condition matches.
    Or(Condition, Condition),
    /// The condition matches the associated record, or for to-many
    /// associations any of the associated records.
    Association {
        /// Association name
        field: String,
        /// Condition on the related records
        condition: Condition,
    },
    /// The current resource is itself authorized for another action.
    Derived(Action),
    /// An escape hatch deciding the match through custom code.
    Predicate {
        /// Field handed to the predicate
        field: String,
        /// Decides the match
        predicate: Arc<dyn Predicate>,
    },
}

impl PartialEq for Clause {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Clause::Equals { field, value },
                Clause::Equals {
                    field: other_field,
                    value: other_value,
                },
            ) => field == other_field && value == other_value,
            (Clause::IsNull { field }, Clause::IsNull { field: other }) => field == other,
            (Clause::Negate(condition), Clause::Negate(other)) => condition == other,
            (Clause::Or(left, right), Clause::Or(other_left, other_right)) => {
                left == other_left && right == other_right
            }
            (
                Clause::Association { field, condition },
                Clause::Association {
                    field: other_field,
                    condition: other_condition,
                },
            ) => field == other_field && condition == other_condition,
            (Clause::Derived(action), Clause::Derived(other)) => action == other,
            (
                Clause::Predicate { field, predicate },
                Clause::Predicate {
                    field: other_field,
                    predicate: other_predicate,
                },
            ) => field == other_field && Arc::ptr_eq(predicate, other_predicate),
            _ => false,
        }
    }
}

impl Debug for Clause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Clause::Equals { field, value } => f
                .debug_struct("Equals")
                .field("field", field)
                .field("value", value)
                .finish(),
            Clause::IsNull { field } => f.debug_struct("IsNull").field("field", field).finish(),
            Clause::Negate(condition) => f.debug_tuple("Negate").field(condition).finish(),
            Clause::Or(left, right) => f.debug_tuple("Or").field(left).field(right).finish(),
            Clause::Association { field, condition } => f
                .debug_struct("Association")
                .field("field", field)
                .field("condition", condition)
                .finish(),
            Clause::Derived(action) => f.debug_tuple("Derived").field(action).finish(),
            Clause::Predicate { field, .. } => f
                .debug_struct("Predicate")
                .field("field", field)
                .finish_non_exhaustive(),
        }
    }
}

impl Display for Clause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Clause::Equals { field, value } => write!(f, "{field} == {value}"),
            Clause::IsNull { field } => write!(f, "{field} is null"),
            Clause::Negate(condition) => write!(f, "!({condition})"),
            Clause::Or(left, right) => write!(f, "(({left}) || ({right}))"),
            Clause::Association { field, condition } => write!(f, "{field}.({condition})"),
            Clause::Derived(action) => write!(f, "allows({action})"),
            Clause::Predicate { field, .. } => write!(f, "{field} ~ <predicate>"),
        }
    }
}

/// Clauses that must all match. The empty condition always matches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Condition(Vec<Clause>);

impl Condition {
    /// Creates an empty condition.
    pub fn new() -> Self {
        Self(vec![])
    }

    /// The condition that matches every resource.
    pub fn always() -> Self {
        Self::new()
    }

    /// Creates a condition out of raw clauses.
    pub fn from_clauses(clauses: Vec<Clause>) -> Self {
        Self(clauses)
    }

    /// Returns `true` if this condition has no clauses and thus always
    /// matches.
    pub fn is_always(&self) -> bool {
        self.0.is_empty()
    }

    /// The clauses of this condition, in the order they are tested.
    pub fn clauses(&self) -> &[Clause] {
        &self.0
    }

    /// Requires every entry of `fields` to match as well.
    pub fn r#where(self, fields: impl Into<Where>) -> Self {
        self.and(Condition::from(fields.into()))
    }

    /// Requires `fields` not to match as a whole.
    pub fn where_not(self, fields: impl Into<Where>) -> Self {
        self.and(Condition::from(fields.into()).not())
    }

    /// Matches when everything accumulated so far matches, or `fields`
    /// match. Later calls keep folding to the left.
    pub fn or_where(self, fields: impl Into<Where>) -> Self {
        self.or(Condition::from(fields.into()))
    }

    /// Appends a raw clause.
    pub fn clause(mut self, clause: Clause) -> Self {
        self.0.push(clause);
        self
    }

    /// Checks that every field and association named by this condition
    /// exists on `resource_type`, following associations into the related
    /// types, and that every compared literal can be stored in its field.
    pub fn validate<S: Schema + ?Sized>(
        &self,
        schema: &S,
        resource_type: &ResourceType,
    ) -> AuthorizationResult<()> {
        if !schema.contains(resource_type) {
            return Err(AuthorizationError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            });
        }

        for clause in &self.0 {
            match clause {
                Clause::Equals { field, value } => {
                    let storage_type = known_field(schema, resource_type, field)?;
                    schema
                        .dump(storage_type, value)
                        .map_err(|error| error.for_field(field))?;
                }
                Clause::IsNull { field } | Clause::Predicate { field, .. } => {
                    known_field(schema, resource_type, field)?;
                }
                Clause::Negate(condition) => condition.validate(schema, resource_type)?,
                Clause::Or(left, right) => {
                    left.validate(schema, resource_type)?;
                    right.validate(schema, resource_type)?;
                }
                Clause::Association { field, condition } => {
                    let info = schema.association(resource_type, field).ok_or_else(|| {
                        AuthorizationError::UnknownAssociation {
                            resource_type: resource_type.to_string(),
                            association: field.clone(),
                        }
                    })?;
                    condition.validate(schema, &info.related)?;
                }
                Clause::Derived(_) => {}
            }
        }
        Ok(())
    }
}

fn known_field<S: Schema + ?Sized>(
    schema: &S,
    resource_type: &ResourceType,
    field: &str,
) -> AuthorizationResult<StorageType> {
    schema
        .field_type(resource_type, field)
        .ok_or_else(|| AuthorizationError::UnknownField {
            resource_type: resource_type.to_string(),
            field: field.to_string(),
        })
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "true")
        } else {
            write!(f, "{}", self.0.iter().join(" && "))
        }
    }
}

/// Conditions combine like the values they are evaluated to. The
/// condition that never matches is a negated empty condition.
impl Logic for Condition {
    fn always() -> Self {
        Condition::new()
    }

    fn never() -> Self {
        Condition(vec![Clause::Negate(Condition::new())])
    }

    fn is_always(&self) -> bool {
        self.0.is_empty()
    }

    fn is_never(&self) -> bool {
        self.0
            .iter()
            .any(|clause| matches!(clause, Clause::Negate(inner) if inner.0.is_empty()))
    }

    fn and(mut self, other: Self) -> Self {
        if Logic::is_never(&self) || Logic::is_always(&other) {
            self
        } else if Logic::is_never(&other) || Logic::is_always(&self) {
            other
        } else {
            self.0.extend(other.0);
            self
        }
    }

    fn or(self, other: Self) -> Self {
        if Logic::is_always(&self) || Logic::is_never(&other) {
            self
        } else if Logic::is_always(&other) || Logic::is_never(&self) {
            other
        } else {
            Condition(vec![Clause::Or(self, other)])
        }
    }

    fn not(mut self) -> Self {
        match self.0.as_mut_slice() {
            [Clause::Negate(inner)] => std::mem::take(inner),
            _ => Condition(vec![Clause::Negate(self)]),
        }
    }
}

impl From<Where> for Condition {
    fn from(fields: Where) -> Self {
        Condition(fields.into_clauses())
    }
}

/// Two faces of a custom test: one for loaded records, one for compiled
/// queries. Both must describe the same set of resources.
pub trait Predicate: Send + Sync {
    /// Decides whether `subject` matches, looking at `field`.
    fn as_boolean(&self, subject: &Record, field: &str) -> AuthorizationResult<bool>;

    /// Builds the query predicate selecting matching rows of `binding`.
    fn as_predicate(&self, binding: Binding, field: &str) -> AuthorizationResult<Expr>;
}

/// A [`Predicate`] made of two closures
pub struct FnPredicate<B, Q> {
    boolean: B,
    query: Q,
}

impl<B, Q> FnPredicate<B, Q>
where
    B: Fn(&Record, &str) -> bool + Send + Sync,
    Q: Fn(Binding, &str) -> Expr + Send + Sync,
{
    /// Pairs the boolean form with the query form.
    pub fn new(boolean: B, query: Q) -> Self {
        Self { boolean, query }
    }
}

impl<B, Q> Predicate for FnPredicate<B, Q>
where
    B: Fn(&Record, &str) -> bool + Send + Sync,
    Q: Fn(Binding, &str) -> Expr + Send + Sync,
{
    fn as_boolean(&self, subject: &Record, field: &str) -> AuthorizationResult<bool> {
        Ok((self.boolean)(subject, field))
    }

    fn as_predicate(&self, binding: Binding, field: &str) -> AuthorizationResult<Expr> {
        Ok((self.query)(binding, field))
    }
}

/// Wraps two closures into a [`Matcher`] usable in a [`Where`] list.
pub fn predicate<B, Q>(boolean: B, query: Q) -> Matcher
where
    B: Fn(&Record, &str) -> bool + Send + Sync + 'static,
    Q: Fn(Binding, &str) -> Expr + Send + Sync + 'static,
{
    Matcher::Predicate(Arc::new(FnPredicate::new(boolean, query)))
}

/// Matches an association whose target is authorized for `action`.
pub fn allows(action: impl Into<Action>) -> Matcher {
    Matcher::Allows(action.into())
}

/// What a single field of a [`Where`] list is tested against
#[derive(Clone)]
pub enum Matcher {
    /// Equality with a literal; `Null` tests for absence.
    Value(Value),
    /// The field is an association and its target must match.
    Where(Where),
    /// The field is an association and its target must be authorized.
    Allows(Action),
    /// Custom test.
    Predicate(Arc<dyn Predicate>),
}

impl Debug for Matcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Matcher::Where(fields) => f.debug_tuple("Where").field(fields).finish(),
            Matcher::Allows(action) => f.debug_tuple("Allows").field(action).finish(),
            Matcher::Predicate(_) => f.debug_tuple("Predicate").finish_non_exhaustive(),
        }
    }
}

macro_rules! matcher_from_value {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for Matcher {
                fn from(value: $source) -> Self {
                    Matcher::Value(value.into())
                }
            }
        )*
    };
}

matcher_from_value!(Value, bool, i64, i32, u32, f64, &str, String);

impl From<Where> for Matcher {
    fn from(fields: Where) -> Self {
        Matcher::Where(fields)
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Field(String, Matcher),
    Allows(Action),
}

/// An ordered list of field tests, all of which must match
#[derive(Debug, Clone, Default)]
pub struct Where(Vec<Entry>);

impl Where {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self(vec![])
    }

    /// Tests `field` against `matcher`.
    pub fn field(mut self, field: impl Into<String>, matcher: impl Into<Matcher>) -> Self {
        self.0.push(Entry::Field(field.into(), matcher.into()));
        self
    }

    /// Requires the current resource to be authorized for `action` too.
    pub fn allows(mut self, action: impl Into<Action>) -> Self {
        self.0.push(Entry::Allows(action.into()));
        self
    }

    fn into_clauses(self) -> Vec<Clause> {
        self.0
            .into_iter()
            .map(|entry| match entry {
                Entry::Field(field, Matcher::Value(Value::Null)) => Clause::IsNull { field },
                Entry::Field(field, Matcher::Value(value)) => Clause::Equals { field, value },
                Entry::Field(field, Matcher::Where(fields)) => Clause::Association {
                    field,
                    condition: fields.into(),
                },
                Entry::Field(field, Matcher::Allows(action)) => Clause::Association {
                    field,
                    condition: Condition(vec![Clause::Derived(action)]),
                },
                Entry::Field(field, Matcher::Predicate(predicate)) => {
                    Clause::Predicate { field, predicate }
                }
                Entry::Allows(action) => Clause::Derived(action),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Entity, Registry};
    use crate::value::StorageType;
    use pretty_assertions::assert_eq;

    fn equals(field: &str, value: impl Into<Value>) -> Clause {
        Clause::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_where_entries_become_clauses_in_order() {
        let condition: Condition = Where::new()
            .field("archived", false)
            .field("deleted_at", Value::Null)
            .field("thread", allows("read"))
            .field("author", Where::new().field("banned", false))
            .allows("edit")
            .into();

        assert_eq!(
            condition.clauses(),
            &[
                equals("archived", false),
                Clause::IsNull {
                    field: "deleted_at".into()
                },
                Clause::Association {
                    field: "thread".into(),
                    condition: Condition::from_clauses(vec![Clause::Derived("read".into())]),
                },
                Clause::Association {
                    field: "author".into(),
                    condition: Condition::from_clauses(vec![equals("banned", false)]),
                },
                Clause::Derived("edit".into()),
            ]
        );
    }

    #[test]
    fn test_where_not_wraps_the_whole_list() {
        let condition = Condition::new()
            .r#where(Where::new().field("a", 1))
            .where_not(Where::new().field("b", 2).field("c", 3));

        assert_eq!(
            condition.clauses(),
            &[
                equals("a", 1),
                Clause::Negate(Condition::from_clauses(vec![equals("b", 2), equals("c", 3)])),
            ]
        );
    }

    #[test]
    fn test_or_where_folds_to_the_left() {
        let condition = Condition::new()
            .r#where(Where::new().field("a", 1))
            .or_where(Where::new().field("b", 2))
            .r#where(Where::new().field("c", 3))
            .or_where(Where::new().field("d", 4));

        let inner = Clause::Or(
            Condition::from_clauses(vec![equals("a", 1)]),
            Condition::from_clauses(vec![equals("b", 2)]),
        );
        let expected = Clause::Or(
            Condition::from_clauses(vec![inner, equals("c", 3)]),
            Condition::from_clauses(vec![equals("d", 4)]),
        );
        assert_eq!(condition.clauses(), &[expected]);
    }

    #[test]
    fn test_algebra_simplifies_constants() {
        let archived: Condition = Where::new().field("archived", true).into();

        assert_eq!(Condition::never().and(archived.clone()), Condition::never());
        assert_eq!(Condition::always().and(archived.clone()), archived);
        assert_eq!(Condition::always().or(archived.clone()), Condition::always());
        assert_eq!(Condition::never().or(archived.clone()), archived);
        assert_eq!(archived.clone().not().not(), archived);
        assert!(Logic::is_never(&Condition::always().not()));
    }

    #[test]
    fn test_or_where_on_empty_condition_always_matches() {
        let condition = Condition::new().or_where(Where::new().field("a", 1));
        assert!(condition.is_always());
    }

    #[test]
    fn test_display() {
        let condition = Condition::new()
            .r#where(Where::new().field("archived", false))
            .where_not(Where::new().field("thread", allows("read")));

        assert_eq!(
            condition.to_string(),
            "archived == false && !(thread.(allows(read)))"
        );
        assert_eq!(Condition::always().to_string(), "true");
    }

    #[test]
    fn test_predicates_compare_by_identity() {
        let matcher = predicate(|_, _| true, |_, _| Expr::True);
        let first: Condition = Where::new().field("title", matcher.clone()).into();
        let second: Condition = Where::new().field("title", matcher).into();
        let other: Condition = Where::new()
            .field("title", predicate(|_, _| true, |_, _| Expr::True))
            .into();

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_validate_reports_unknown_names() {
        let registry = Registry::new()
            .entity(
                Entity::new("post")
                    .field("thread_id", StorageType::Integer)
                    .belongs_to("thread", "thread", "thread_id"),
            )
            .entity(Entity::new("thread").field("archived", StorageType::Boolean));
        let post = ResourceType::from("post");

        let valid: Condition = Where::new()
            .field("thread", Where::new().field("archived", false))
            .into();
        assert_eq!(valid.validate(&registry, &post), Ok(()));

        let unknown_field: Condition = Where::new()
            .field("thread", Where::new().field("locked", false))
            .into();
        assert_eq!(
            unknown_field.validate(&registry, &post),
            Err(AuthorizationError::UnknownField {
                resource_type: "thread".into(),
                field: "locked".into(),
            })
        );

        let unknown_association: Condition = Where::new().field("author", allows("read")).into();
        assert_eq!(
            unknown_association.validate(&registry, &post),
            Err(AuthorizationError::UnknownAssociation {
                resource_type: "post".into(),
                association: "author".into(),
            })
        );
    }

    #[test]
    fn test_validate_coerces_every_literal() {
        let registry = Registry::new().entity(
            Entity::new("thread")
                .field("archived", StorageType::Boolean)
                .field("title", StorageType::String),
        );
        let thread = ResourceType::from("thread");

        let behind_a_false_clause = Condition::new()
            .r#where(Where::new().field("archived", false))
            .where_not(Where::new().field("title", 7));
        assert_eq!(
            behind_a_false_clause.validate(&registry, &thread),
            Err(AuthorizationError::Coercion {
                field: "title".into(),
                value: Value::Integer(7),
                expected: StorageType::String,
            })
        );
    }
}
