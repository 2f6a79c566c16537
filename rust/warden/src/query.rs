//! Backend-agnostic query description
//!
//! The query compiler doesn't produce SQL. It produces a [`Query`]: a source
//! resource type, a predicate tree over named [`Binding`]s, the joins that
//! introduce those bindings and, optionally, scoped preload plans. A
//! [`Backend`] turns that description into rows.
//!
//! Rows are addressed by binding: the query's root rows are bound to
//! [`Binding::ROOT`], every [`Join`] introduces a new binding for the related
//! row of its parent binding. Joins are left joins: a parent without a
//! related row still produces a result, and any field test against the
//! missing row does not hold.

use std::fmt::{Display, Formatter};

use itertools::Itertools;

use crate::logic::Logic;
use crate::record::Record;
use crate::schema::{AssociationInfo, Cardinality, ResourceType};
use crate::value::Value;

/// Names a row within a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding(pub usize);

impl Binding {
    /// The rows of the query source.
    pub const ROOT: Binding = Binding(0);

    /// The binding following this one.
    pub fn next(self) -> Binding {
        Binding(self.0 + 1)
    }
}

impl Display for Binding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Comparison operator of [`Expr::Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

impl Op {
    /// Applies the operator. Comparisons involving `Null` or values
    /// without a mutual order never hold.
    pub fn test(&self, left: &Value, right: &Value) -> bool {
        if left.is_null() || right.is_null() {
            return false;
        }
        let Some(ordering) = left.compare(right) else {
            return false;
        };
        match self {
            Op::Eq => ordering.is_eq(),
            Op::Ne => ordering.is_ne(),
            Op::Lt => ordering.is_lt(),
            Op::Le => ordering.is_le(),
            Op::Gt => ordering.is_gt(),
            Op::Ge => ordering.is_ge(),
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        };
        write!(f, "{symbol}")
    }
}

/// Boolean predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Holds for every row.
    True,
    /// Holds for no row.
    False,
    /// Compares a field of a bound row with a literal. Never holds when the
    /// row or the field value is missing.
    Compare {
        /// Row holding the field
        binding: Binding,
        /// Field name
        field: String,
        /// How the field compares to `value`
        op: Op,
        /// Literal, already coerced to the field's storage type
        value: Value,
    },
    /// The bound row exists and the field has no value.
    IsNull {
        /// Row holding the field
        binding: Binding,
        /// Field name
        field: String,
    },
    /// A row is bound, i.e. the join introducing the binding found one.
    Present(Binding),
    /// Both hold.
    And(Box<Expr>, Box<Expr>),
    /// Either holds.
    Or(Box<Expr>, Box<Expr>),
    /// Does not hold.
    Not(Box<Expr>),
    /// Some related row of a to-many association satisfies a predicate.
    Exists(Box<Correlated>),
    /// The field of the bound row is among the values the subquery returns
    /// for that field.
    InQuery {
        /// Row holding the field
        binding: Binding,
        /// Field looked up in the subquery, usually the primary key
        field: String,
        /// Subquery selecting the accepted rows
        query: Box<Query>,
    },
}

impl Expr {
    /// `binding.field == value`
    pub fn eq(binding: Binding, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(binding, field, Op::Eq, value)
    }

    /// `binding.field <op> value`
    pub fn compare(
        binding: Binding,
        field: impl Into<String>,
        op: Op,
        value: impl Into<Value>,
    ) -> Self {
        Expr::Compare {
            binding,
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `binding.field is null`
    pub fn is_null(binding: Binding, field: impl Into<String>) -> Self {
        Expr::IsNull {
            binding,
            field: field.into(),
        }
    }

    /// The highest binding mentioned by this predicate. Subqueries of
    /// [`Expr::InQuery`] have bindings of their own and are not visited.
    pub fn last_binding(&self) -> Binding {
        match self {
            Expr::True | Expr::False => Binding::ROOT,
            Expr::Compare { binding, .. }
            | Expr::IsNull { binding, .. }
            | Expr::Present(binding)
            | Expr::InQuery { binding, .. } => *binding,
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.last_binding().max(right.last_binding())
            }
            Expr::Not(inner) => inner.last_binding(),
            Expr::Exists(correlated) => correlated
                .joins
                .iter()
                .map(|join| join.binding)
                .chain([correlated.binding, correlated.predicate.last_binding()])
                .max()
                .unwrap_or(correlated.binding),
        }
    }
}

impl Logic for Expr {
    fn always() -> Self {
        Expr::True
    }

    fn never() -> Self {
        Expr::False
    }

    fn is_always(&self) -> bool {
        matches!(self, Expr::True)
    }

    fn is_never(&self) -> bool {
        matches!(self, Expr::False)
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Expr::False, _) | (_, Expr::False) => Expr::False,
            (Expr::True, other) | (other, Expr::True) => other,
            (left, right) => Expr::And(Box::new(left), Box::new(right)),
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (Expr::True, _) | (_, Expr::True) => Expr::True,
            (Expr::False, other) | (other, Expr::False) => other,
            (left, right) => Expr::Or(Box::new(left), Box::new(right)),
        }
    }

    fn not(self) -> Self {
        match self {
            Expr::True => Expr::False,
            Expr::False => Expr::True,
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::True => write!(f, "true"),
            Expr::False => write!(f, "false"),
            Expr::Compare {
                binding,
                field,
                op,
                value,
            } => write!(f, "{binding}.{field} {op} {value}"),
            Expr::IsNull { binding, field } => write!(f, "{binding}.{field} is null"),
            Expr::Present(binding) => write!(f, "present({binding})"),
            Expr::And(left, right) => write!(f, "({left} and {right})"),
            Expr::Or(left, right) => write!(f, "({left} or {right})"),
            Expr::Not(inner) => write!(f, "not {inner}"),
            Expr::Exists(correlated) => write!(f, "{correlated}"),
            Expr::InQuery {
                binding,
                field,
                query,
            } => write!(f, "{binding}.{field} in ({query})"),
        }
    }
}

/// Introduces `binding` as the row related to `parent` through a to-one
/// association
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Row the association starts from
    pub parent: Binding,
    /// Name of the association on the parent's type
    pub association: String,
    /// Binding of the joined row
    pub binding: Binding,
    /// Resource type of the joined row
    pub related: ResourceType,
    /// Field of the parent row matched against `related_key`
    pub owner_key: String,
    /// Field of the joined row matched against `owner_key`
    pub related_key: String,
}

impl Join {
    /// Joins the target of `info` to `parent` under `binding`.
    pub fn new(
        parent: Binding,
        association: impl Into<String>,
        binding: Binding,
        info: &AssociationInfo,
    ) -> Self {
        Self {
            parent,
            association: association.into(),
            binding,
            related: info.related.clone(),
            owner_key: info.owner_key.clone(),
            related_key: info.related_key.clone(),
        }
    }
}

impl Display for Join {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "left join {} as {} on {}.{} = {}.{}",
            self.related, self.binding, self.binding, self.related_key, self.parent, self.owner_key
        )
    }
}

/// A subquery over the related rows of `parent`, used by [`Expr::Exists`].
///
/// The subquery sees the bindings of the enclosing query; its own rows are
/// bound to `binding` and `joins` hang off that binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlated {
    /// Row whose related rows are searched
    pub parent: Binding,
    /// Name of the to-many association on the parent's type
    pub association: String,
    /// Binding of the candidate related row
    pub binding: Binding,
    /// Resource type of the related rows
    pub related: ResourceType,
    /// Field of the parent row
    pub owner_key: String,
    /// Field of the related row that must equal `owner_key`
    pub related_key: String,
    /// Joins hanging off `binding`
    pub joins: Vec<Join>,
    /// Test some related row has to pass
    pub predicate: Expr,
}

impl Display for Correlated {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "exists({} as {} where {}.{} = {}.{}",
            self.related, self.binding, self.binding, self.related_key, self.parent, self.owner_key
        )?;
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        write!(f, " and {})", self.predicate)
    }
}

/// Where the rows of a query come from
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// All records of a resource type.
    Type(ResourceType),
    /// A raw source, such as a table name, that isn't tied to a resource
    /// type. Rules cannot be applied to it.
    Unlabeled(String),
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first
    Asc,
    /// Largest first
    Desc,
}

/// Sort key of a query, always on the root binding
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Field of the root row
    pub field: String,
    /// Sort direction
    pub direction: Direction,
}

/// Requests that an association be loaded with authorized records only
///
/// The optional `query` further restricts, orders and limits the related
/// records of each parent. `nested` preloads apply to the related records.
#[derive(Debug, Clone, PartialEq)]
pub struct Preload {
    /// Association to load
    pub association: String,
    /// Narrows the related records of each parent
    pub query: Option<Query>,
    /// Preloads applied to the related records
    pub nested: Vec<Preload>,
}

impl Preload {
    /// Preloads every authorized record of `association`.
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            query: None,
            nested: vec![],
        }
    }

    /// Selects, per parent, only the related records `query` would select.
    pub fn query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Preloads an association of the related records as well.
    pub fn preload(mut self, nested: Preload) -> Self {
        self.nested.push(nested);
        self
    }
}

impl From<&str> for Preload {
    fn from(association: &str) -> Self {
        Preload::new(association)
    }
}

/// Restricts, per parent row, which related rows get attached to the
/// parent under `association`.
///
/// Candidate rows are those whose `related_key` equals the parent's
/// `owner_key`. They are kept when `predicate` holds (with the candidate
/// bound to `binding` and `joins` applied), then, when a nested `query` is
/// given, when the nested query's own predicate holds for them; finally the
/// nested query's ordering and limit pick the top rows for each parent.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadPlan {
    /// Association the related rows are attached under
    pub association: String,
    /// Binding of the parent rows
    pub parent: Binding,
    /// Binding of the candidate related row
    pub binding: Binding,
    /// Resource type of the related rows
    pub related: ResourceType,
    /// Field of the parent row
    pub owner_key: String,
    /// Field of the related row that must equal `owner_key`
    pub related_key: String,
    /// Whether one or many rows get attached
    pub cardinality: Cardinality,
    /// Joins needed by `predicate`, hanging off `binding`
    pub joins: Vec<Join>,
    /// Authorization filter for the related rows
    pub predicate: Expr,
    /// Narrows, orders and limits the authorized rows of each parent
    pub query: Option<Box<Query>>,
    /// Plans for the related rows' own preloads
    pub preloads: Vec<PreloadPlan>,
}

impl Display for PreloadPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "preload {} as {} from {} where {}",
            self.association, self.binding, self.related, self.predicate
        )?;
        if let Some(query) = &self.query {
            write!(f, " top ({query})")?;
        }
        for nested in &self.preloads {
            write!(f, " [{nested}]")?;
        }
        Ok(())
    }
}

/// A query over resources
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Where the root rows come from
    pub source: Source,
    /// Filter over the root row and its joins
    pub predicate: Expr,
    /// Left joins introducing the bindings `predicate` refers to
    pub joins: Vec<Join>,
    /// Sort keys, most significant first
    pub order_by: Vec<Order>,
    /// Maximum number of rows
    pub limit: Option<usize>,
    /// Related rows to attach to each result
    pub preloads: Vec<PreloadPlan>,
}

impl Query {
    /// Selects every record of `resource_type`.
    pub fn from(resource_type: impl Into<ResourceType>) -> Self {
        Self::with_source(Source::Type(resource_type.into()))
    }

    /// Selects every row of a raw source.
    pub fn unlabeled(name: impl Into<String>) -> Self {
        Self::with_source(Source::Unlabeled(name.into()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            predicate: Expr::True,
            joins: vec![],
            order_by: vec![],
            limit: None,
            preloads: vec![],
        }
    }

    /// The resource type of the source, when it has one.
    pub fn resource_type(&self) -> Option<&ResourceType> {
        match &self.source {
            Source::Type(resource_type) => Some(resource_type),
            Source::Unlabeled(_) => None,
        }
    }

    /// Keeps only the rows for which `predicate` also holds.
    pub fn filter(mut self, predicate: Expr) -> Self {
        let current = std::mem::replace(&mut self.predicate, Expr::True);
        self.predicate = current.and(predicate);
        self
    }

    /// Adds a join. Its binding must not clash with existing ones.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Adds a sort key.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(Order {
            field: field.into(),
            direction,
        });
        self
    }

    /// Caps the number of rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The highest binding this query uses in its joins and predicate.
    pub fn last_binding(&self) -> Binding {
        self.joins
            .iter()
            .map(|join| join.binding)
            .chain([self.predicate.last_binding()])
            .max()
            .unwrap_or(Binding::ROOT)
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Source::Type(resource_type) => write!(f, "from {resource_type} as {}", Binding::ROOT)?,
            Source::Unlabeled(name) => write!(f, "from \"{name}\" as {}", Binding::ROOT)?,
        }
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        write!(f, " where {}", self.predicate)?;
        if !self.order_by.is_empty() {
            let keys = self.order_by.iter().format_with(", ", |order, f| {
                let direction = match order.direction {
                    Direction::Asc => "asc",
                    Direction::Desc => "desc",
                };
                f(&format_args!("{} {direction}", order.field))
            });
            write!(f, " order by {keys}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit}")?;
        }
        for preload in &self.preloads {
            write!(f, " [{preload}]")?;
        }
        Ok(())
    }
}

/// Anything that can be scoped: a resource type or an existing query
pub trait IntoQuery {
    /// The query selecting the subject's rows.
    fn into_query(self) -> Query;
}

impl IntoQuery for Query {
    fn into_query(self) -> Query {
        self
    }
}

impl IntoQuery for &Query {
    fn into_query(self) -> Query {
        self.clone()
    }
}

impl IntoQuery for ResourceType {
    fn into_query(self) -> Query {
        Query::from(self)
    }
}

impl IntoQuery for &ResourceType {
    fn into_query(self) -> Query {
        Query::from(self.clone())
    }
}

impl IntoQuery for &str {
    fn into_query(self) -> Query {
        Query::from(self)
    }
}

/// Executes queries
pub trait Backend {
    /// Raised when a query cannot be executed
    type Error: std::error::Error;

    /// Returns the rows selected by `query`, with preloaded associations
    /// attached.
    fn all(&self, query: &Query) -> Result<Vec<Record>, Self::Error>;
}
