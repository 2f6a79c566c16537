//! Loaded resources
//!
//! A [`Record`] is the dynamic form of a resource: its type, its field values
//! and whichever associations have been loaded so far. An association that
//! is missing from the record is *not loaded*, which is different from a
//! loaded association that turned out to be empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::schema::ResourceType;
use crate::value::Value;

static NULL: Value = Value::Null;

/// A resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    resource_type: ResourceType,
    fields: BTreeMap<String, Value>,
    #[serde(default)]
    associations: BTreeMap<String, Loaded>,
}

/// The loaded contents of an association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Loaded {
    /// A to-one association, `None` when there is no related record.
    One(Option<Box<Record>>),
    /// A to-many association.
    Many(Vec<Record>),
}

impl Loaded {
    /// Iterates over the loaded records.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        let (one, many) = match self {
            Loaded::One(record) => (record.as_deref(), &[] as &[Record]),
            Loaded::Many(records) => (None, records.as_slice()),
        };
        one.into_iter().chain(many)
    }

    /// Number of loaded records.
    pub fn len(&self) -> usize {
        match self {
            Loaded::One(record) => usize::from(record.is_some()),
            Loaded::Many(records) => records.len(),
        }
    }

    /// Returns `true` when no related record was found.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Record {
    /// Creates a record with no fields set.
    pub fn new(resource_type: impl Into<ResourceType>) -> Self {
        Self {
            resource_type: resource_type.into(),
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    /// Sets a field, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets a loaded association, builder style.
    pub fn with_loaded(mut self, association: impl Into<String>, loaded: Loaded) -> Self {
        self.set_loaded(association, loaded);
        self
    }

    /// The type of this resource.
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Reads a field. Fields that were never set read as [`Value::Null`].
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Sets a field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Iterates over all set fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the association if it is loaded.
    pub fn loaded(&self, association: &str) -> Option<&Loaded> {
        self.associations.get(association)
    }

    /// Returns the association mutably if it is loaded.
    pub fn loaded_mut(&mut self, association: &str) -> Option<&mut Loaded> {
        self.associations.get_mut(association)
    }

    /// Returns `true` if the association is loaded.
    pub fn is_loaded(&self, association: &str) -> bool {
        self.associations.contains_key(association)
    }

    /// Stores a loaded association.
    pub fn set_loaded(&mut self, association: impl Into<String>, loaded: Loaded) {
        self.associations.insert(association.into(), loaded);
    }

    /// Forgets a loaded association.
    pub fn unload(&mut self, association: &str) -> Option<Loaded> {
        self.associations.remove(association)
    }
}

/// Loads associations that a record doesn't carry yet
pub trait Loader {
    /// Loads `association` for `record`.
    fn load(&self, record: &Record, association: &str) -> Result<Loaded, LoadError>;
}

impl<L: Loader + ?Sized> Loader for &L {
    fn load(&self, record: &Record, association: &str) -> Result<Loaded, LoadError> {
        (**self).load(record, association)
    }
}
