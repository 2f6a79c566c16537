//! An in-memory store that executes [`Query`] values.
//!
//! [`MemoryStore`] keeps records in per-type tables and serves as
//! [`Schema`], [`Loader`] and [`Backend`] at once. It evaluates queries row
//! by row: joins bind at most one related row, correlated subqueries scan
//! the related table for each candidate, and preload plans pick the related
//! rows of each parent separately.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::error::{LoadError, StoreError};
use crate::query::{Backend, Binding, Direction, Expr, Join, Op, Order, PreloadPlan, Query, Source};
use crate::record::{Loaded, Loader, Record};
use crate::schema::{AssociationInfo, Cardinality, Registry, ResourceType, Schema};
use crate::value::{StorageType, Value};

/// Rows bound to the bindings of a query. `None` records a join that found
/// no related row.
type Env<'r> = BTreeMap<Binding, Option<&'r Record>>;

fn lookup<'r>(env: &Env<'r>, binding: Binding) -> Option<&'r Record> {
    env.get(&binding).copied().flatten()
}

/// Tables of records described by a [`Registry`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    registry: Registry,
    tables: IndexMap<String, Vec<Record>>,
}

impl MemoryStore {
    /// An empty store for the resource types of `registry`.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            tables: IndexMap::new(),
        }
    }

    /// Adds a record to the table of its resource type, builder style.
    pub fn with(mut self, record: Record) -> Self {
        self.insert(record);
        self
    }

    /// Adds a record to the table of its resource type.
    pub fn insert(&mut self, record: Record) {
        self.tables
            .entry(record.resource_type().to_string())
            .or_default()
            .push(record);
    }

    /// All records stored under `name`, in insertion order.
    pub fn rows(&self, name: &str) -> &[Record] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// The schema of the stored records.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn table(&self, name: &str) -> Result<&[Record], StoreError> {
        if self.tables.contains_key(name) || self.registry.contains(&ResourceType::from(name)) {
            Ok(self.rows(name))
        } else {
            Err(StoreError::UnknownTable {
                name: name.to_string(),
            })
        }
    }

    /// Rows of `related` whose `related_key` equals `key`.
    fn related(
        &self,
        related: &ResourceType,
        related_key: &str,
        key: &Value,
    ) -> Result<Vec<&Record>, StoreError> {
        Ok(self
            .table(related.as_str())?
            .iter()
            .filter(|row| Op::Eq.test(row.get(related_key), key))
            .collect())
    }

    fn select(&self, query: &Query) -> Result<Vec<&Record>, StoreError> {
        let name = match &query.source {
            Source::Type(resource_type) => resource_type.as_str(),
            Source::Unlabeled(name) => name.as_str(),
        };

        let mut selected = vec![];
        for row in self.table(name)? {
            let mut env = Env::new();
            env.insert(Binding::ROOT, Some(row));
            self.bind(&query.joins, &mut env)?;
            if self.holds(&query.predicate, &env)? {
                selected.push(row);
            }
        }

        sort(&mut selected, &query.order_by);
        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }
        Ok(selected)
    }

    fn bind<'r>(&'r self, joins: &[Join], env: &mut Env<'r>) -> Result<(), StoreError> {
        for join in joins {
            let row = match lookup(env, join.parent) {
                Some(parent) => self
                    .related(&join.related, &join.related_key, parent.get(&join.owner_key))?
                    .into_iter()
                    .next(),
                None => None,
            };
            env.insert(join.binding, row);
        }
        Ok(())
    }

    fn holds<'r>(&'r self, expr: &Expr, env: &Env<'r>) -> Result<bool, StoreError> {
        Ok(match expr {
            Expr::True => true,
            Expr::False => false,
            Expr::Compare {
                binding,
                field,
                op,
                value,
            } => lookup(env, *binding).is_some_and(|row| op.test(row.get(field), value)),
            Expr::IsNull { binding, field } => {
                lookup(env, *binding).is_some_and(|row| row.get(field).is_null())
            }
            Expr::Present(binding) => lookup(env, *binding).is_some(),
            Expr::And(left, right) => self.holds(left, env)? && self.holds(right, env)?,
            Expr::Or(left, right) => self.holds(left, env)? || self.holds(right, env)?,
            Expr::Not(inner) => !self.holds(inner, env)?,
            Expr::Exists(correlated) => {
                let Some(parent) = lookup(env, correlated.parent) else {
                    return Ok(false);
                };
                let candidates = self.related(
                    &correlated.related,
                    &correlated.related_key,
                    parent.get(&correlated.owner_key),
                )?;
                for candidate in candidates {
                    let mut scope = env.clone();
                    scope.insert(correlated.binding, Some(candidate));
                    self.bind(&correlated.joins, &mut scope)?;
                    if self.holds(&correlated.predicate, &scope)? {
                        return Ok(true);
                    }
                }
                false
            }
            Expr::InQuery {
                binding,
                field,
                query,
            } => {
                let Some(row) = lookup(env, *binding) else {
                    return Ok(false);
                };
                let value = row.get(field);
                self.select(query)?
                    .iter()
                    .any(|selected| Op::Eq.test(selected.get(field), value))
            }
        })
    }

    /// Attaches to `record` the related rows `plan` selects for it.
    fn attach(&self, record: &mut Record, plan: &PreloadPlan) -> Result<(), StoreError> {
        let candidates = self.related(
            &plan.related,
            &plan.related_key,
            record.get(&plan.owner_key),
        )?;

        let mut kept = vec![];
        for candidate in candidates {
            let mut env = Env::new();
            env.insert(plan.binding, Some(candidate));
            self.bind(&plan.joins, &mut env)?;
            if !self.holds(&plan.predicate, &env)? {
                continue;
            }
            if let Some(query) = &plan.query {
                let mut env = Env::new();
                env.insert(Binding::ROOT, Some(candidate));
                self.bind(&query.joins, &mut env)?;
                if !self.holds(&query.predicate, &env)? {
                    continue;
                }
            }
            kept.push(candidate);
        }

        if let Some(query) = &plan.query {
            sort(&mut kept, &query.order_by);
            if let Some(limit) = query.limit {
                kept.truncate(limit);
            }
        }

        let mut children: Vec<Record> = kept.into_iter().cloned().collect();
        for child in &mut children {
            for nested in &plan.preloads {
                self.attach(child, nested)?;
            }
        }

        let loaded = match plan.cardinality {
            Cardinality::One => Loaded::One(children.into_iter().next().map(Box::new)),
            Cardinality::Many => Loaded::Many(children),
        };
        record.set_loaded(plan.association.as_str(), loaded);
        Ok(())
    }
}

fn sort(rows: &mut [&Record], order_by: &[Order]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|left, right| {
        order_by
            .iter()
            .map(|order| {
                let ordering = left
                    .get(&order.field)
                    .compare(right.get(&order.field))
                    .unwrap_or(Ordering::Equal);
                match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

impl Backend for MemoryStore {
    type Error = StoreError;

    fn all(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let mut records: Vec<Record> = self.select(query)?.into_iter().cloned().collect();
        for record in &mut records {
            for plan in &query.preloads {
                self.attach(record, plan)?;
            }
        }
        Ok(records)
    }
}

impl Loader for MemoryStore {
    fn load(&self, record: &Record, association: &str) -> Result<Loaded, LoadError> {
        let info = self
            .registry
            .association(record.resource_type(), association)
            .ok_or_else(|| {
                LoadError::new(format!(
                    "\"{}\" has no association \"{association}\"",
                    record.resource_type()
                ))
            })?;
        let rows = self
            .related(&info.related, &info.related_key, record.get(&info.owner_key))
            .map_err(|error| LoadError::new(error.to_string()))?;

        Ok(match info.cardinality {
            Cardinality::One => Loaded::One(rows.first().map(|row| Box::new((*row).clone()))),
            Cardinality::Many => Loaded::Many(rows.into_iter().cloned().collect()),
        })
    }
}

impl Schema for MemoryStore {
    fn contains(&self, resource_type: &ResourceType) -> bool {
        self.registry.contains(resource_type)
    }

    fn primary_key(&self, resource_type: &ResourceType) -> Option<&str> {
        self.registry.primary_key(resource_type)
    }

    fn fields(&self, resource_type: &ResourceType) -> Vec<&str> {
        self.registry.fields(resource_type)
    }

    fn field_type(&self, resource_type: &ResourceType, field: &str) -> Option<StorageType> {
        self.registry.field_type(resource_type, field)
    }

    fn associations(&self, resource_type: &ResourceType) -> Vec<&str> {
        self.registry.associations(resource_type)
    }

    fn association(&self, resource_type: &ResourceType, name: &str) -> Option<&AssociationInfo> {
        self.registry.association(resource_type, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::Logic;
    use crate::query::Correlated;
    use crate::schema::Entity;
    use pretty_assertions::assert_eq;

    fn store() -> MemoryStore {
        let registry = Registry::new()
            .entity(
                Entity::new("thread")
                    .field("archived", StorageType::Boolean)
                    .has_many("posts", "post", "thread_id"),
            )
            .entity(
                Entity::new("post")
                    .field("thread_id", StorageType::Integer)
                    .field("rank", StorageType::Integer)
                    .belongs_to("thread", "thread", "thread_id"),
            );
        MemoryStore::new(registry)
            .with(Record::new("thread").with("id", 1).with("archived", false))
            .with(Record::new("thread").with("id", 2).with("archived", true))
            .with(Record::new("thread").with("id", 3).with("archived", false))
            .with(Record::new("post").with("id", 10).with("thread_id", 1).with("rank", 2))
            .with(Record::new("post").with("id", 11).with("thread_id", 1).with("rank", 5))
            .with(Record::new("post").with("id", 12).with("thread_id", 2).with("rank", 1))
            .with(Record::new("post").with("id", 13).with("rank", 7))
    }

    fn ids(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .filter_map(|record| match record.get("id") {
                Value::Integer(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn thread_join(store: &MemoryStore) -> Join {
        let info = store
            .association(&"post".into(), "thread")
            .expect("post belongs to thread");
        Join::new(Binding::ROOT, "thread", Binding(1), info)
    }

    #[test]
    fn test_filter_order_and_limit() -> anyhow::Result<()> {
        let store = store();
        let query = Query::from("post")
            .filter(Expr::compare(Binding::ROOT, "rank", Op::Ge, 2))
            .order_by("rank", Direction::Desc)
            .limit(2);

        assert_eq!(ids(&store.all(&query)?), vec![13, 11]);
        Ok(())
    }

    #[test]
    fn test_left_join_binds_missing_rows_as_absent() -> anyhow::Result<()> {
        let store = store();
        let query = Query::from("post")
            .join(thread_join(&store))
            .filter(Expr::eq(Binding(1), "archived", true).not());

        assert_eq!(ids(&store.all(&query)?), vec![10, 11, 13]);

        let present = Query::from("post")
            .join(thread_join(&store))
            .filter(Expr::Present(Binding(1)));
        assert_eq!(
            ids(&store.all(&present)?),
            vec![10, 11, 12]
        );
        Ok(())
    }

    #[test]
    fn test_exists_scans_related_rows() -> anyhow::Result<()> {
        let store = store();
        let query = Query::from("thread").filter(Expr::Exists(Box::new(Correlated {
            parent: Binding::ROOT,
            association: "posts".into(),
            binding: Binding(1),
            related: "post".into(),
            owner_key: "id".into(),
            related_key: "thread_id".into(),
            joins: vec![],
            predicate: Expr::compare(Binding(1), "rank", Op::Gt, 3),
        })));

        assert_eq!(ids(&store.all(&query)?), vec![1]);
        Ok(())
    }

    #[test]
    fn test_in_query_matches_selected_keys() -> anyhow::Result<()> {
        let store = store();
        let open = Query::from("thread").filter(Expr::eq(Binding::ROOT, "archived", false));
        let query = Query::from("thread").filter(Expr::InQuery {
            binding: Binding::ROOT,
            field: "id".into(),
            query: Box::new(open),
        });

        assert_eq!(ids(&store.all(&query)?), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn test_loader_follows_association_keys() -> anyhow::Result<()> {
        let store = store();
        let thread = store.rows("thread")[0].clone();

        let posts = store.load(&thread, "posts")?;
        assert_eq!(posts.len(), 2);

        let orphan = store.rows("post")[3].clone();
        assert_eq!(store.load(&orphan, "thread")?, Loaded::One(None));
        Ok(())
    }

    #[test]
    fn test_unknown_table() {
        let store = store();

        assert_eq!(
            store.all(&Query::unlabeled("comments")),
            Err(StoreError::UnknownTable {
                name: "comments".into(),
            })
        );
    }
}
