//! Schema reflection
//!
//! The engine never inspects resources on its own terms: it asks a [`Schema`]
//! which fields a resource type has, how they are stored and how its
//! associations connect to other resource types. [`Registry`] is a
//! ready-made schema assembled from [`Entity`] descriptions.

use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::value::{StorageType, Value};

/// Identifies a kind of resource, such as `"post"` or `"thread"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType(Arc<str>);

impl ResourceType {
    /// Creates a resource type from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the name of this resource type.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceType {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&ResourceType> for ResourceType {
    fn from(resource_type: &ResourceType) -> Self {
        resource_type.clone()
    }
}

impl AsRef<str> for ResourceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ResourceType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Cardinality indicates whether an association holds one or many records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// At most one related record per owner.
    One,
    /// Any number of related records per owner.
    Many,
}

/// How an association links an owner record to its related records.
///
/// A related record belongs to an owner when its `related_key` field equals
/// the owner's `owner_key` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationInfo {
    /// Resource type of the related records.
    pub related: ResourceType,
    /// Field on the owner.
    pub owner_key: String,
    /// Field on the related record.
    pub related_key: String,
    /// Whether the owner has one or many related records.
    pub cardinality: Cardinality,
}

/// Reflection over resource types
pub trait Schema {
    /// Returns `true` if the resource type is known.
    fn contains(&self, resource_type: &ResourceType) -> bool;

    /// Name of the field uniquely identifying records of this type.
    fn primary_key(&self, resource_type: &ResourceType) -> Option<&str>;

    /// Names of all plain fields of the resource type.
    fn fields(&self, resource_type: &ResourceType) -> Vec<&str>;

    /// Declared storage type of a field, `None` if there's no such field.
    fn field_type(&self, resource_type: &ResourceType, field: &str) -> Option<StorageType>;

    /// Names of all associations of the resource type.
    fn associations(&self, resource_type: &ResourceType) -> Vec<&str>;

    /// Describes an association, `None` if there's no such association.
    fn association(&self, resource_type: &ResourceType, name: &str) -> Option<&AssociationInfo>;

    /// Dump a literal into the storage type of a field.
    fn dump(&self, storage_type: StorageType, value: &Value) -> Result<Value, TypeError> {
        storage_type.dump(value)
    }
}

impl<S: Schema + ?Sized> Schema for &S {
    fn contains(&self, resource_type: &ResourceType) -> bool {
        (**self).contains(resource_type)
    }

    fn primary_key(&self, resource_type: &ResourceType) -> Option<&str> {
        (**self).primary_key(resource_type)
    }

    fn fields(&self, resource_type: &ResourceType) -> Vec<&str> {
        (**self).fields(resource_type)
    }

    fn field_type(&self, resource_type: &ResourceType, field: &str) -> Option<StorageType> {
        (**self).field_type(resource_type, field)
    }

    fn associations(&self, resource_type: &ResourceType) -> Vec<&str> {
        (**self).associations(resource_type)
    }

    fn association(&self, resource_type: &ResourceType, name: &str) -> Option<&AssociationInfo> {
        (**self).association(resource_type, name)
    }

    fn dump(&self, storage_type: StorageType, value: &Value) -> Result<Value, TypeError> {
        (**self).dump(storage_type, value)
    }
}

impl<S: Schema + ?Sized> Schema for Arc<S> {
    fn contains(&self, resource_type: &ResourceType) -> bool {
        (**self).contains(resource_type)
    }

    fn primary_key(&self, resource_type: &ResourceType) -> Option<&str> {
        (**self).primary_key(resource_type)
    }

    fn fields(&self, resource_type: &ResourceType) -> Vec<&str> {
        (**self).fields(resource_type)
    }

    fn field_type(&self, resource_type: &ResourceType, field: &str) -> Option<StorageType> {
        (**self).field_type(resource_type, field)
    }

    fn associations(&self, resource_type: &ResourceType) -> Vec<&str> {
        (**self).associations(resource_type)
    }

    fn association(&self, resource_type: &ResourceType, name: &str) -> Option<&AssociationInfo> {
        (**self).association(resource_type, name)
    }

    fn dump(&self, storage_type: StorageType, value: &Value) -> Result<Value, TypeError> {
        (**self).dump(storage_type, value)
    }
}

/// Describes a single resource type for a [`Registry`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    name: ResourceType,
    primary_key: Option<String>,
    fields: IndexMap<String, StorageType>,
    associations: IndexMap<String, AssociationInfo>,
}

impl Entity {
    /// Starts describing a resource type. The primary key defaults to an
    /// integer `id` field.
    pub fn new(name: impl Into<ResourceType>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            fields: IndexMap::new(),
            associations: IndexMap::new(),
        }
        .primary_key("id", StorageType::Integer)
    }

    /// Returns the resource type this entity describes.
    pub fn name(&self) -> &ResourceType {
        &self.name
    }

    /// Declares the primary key field, replacing the default `id`.
    pub fn primary_key(mut self, field: impl Into<String>, storage_type: StorageType) -> Self {
        if let Some(previous) = self.primary_key.take() {
            self.fields.shift_remove(&previous);
        }
        let field = field.into();
        self.fields.insert(field.clone(), storage_type);
        self.primary_key = Some(field);
        self
    }

    /// Declares a plain field.
    pub fn field(mut self, name: impl Into<String>, storage_type: StorageType) -> Self {
        self.fields.insert(name.into(), storage_type);
        self
    }

    /// The owner holds a foreign key `foreign_key` to the related record's
    /// primary key.
    pub fn belongs_to(
        mut self,
        name: impl Into<String>,
        related: impl Into<ResourceType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.insert(
            name.into(),
            AssociationInfo {
                related: related.into(),
                owner_key: foreign_key.into(),
                related_key: "id".into(),
                cardinality: Cardinality::One,
            },
        );
        self
    }

    /// The related record holds a foreign key `foreign_key` to this
    /// record's `id` and there is at most one such record.
    pub fn has_one(
        mut self,
        name: impl Into<String>,
        related: impl Into<ResourceType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.insert(
            name.into(),
            AssociationInfo {
                related: related.into(),
                owner_key: "id".into(),
                related_key: foreign_key.into(),
                cardinality: Cardinality::One,
            },
        );
        self
    }

    /// The related records hold a foreign key `foreign_key` to this
    /// record's `id`.
    pub fn has_many(
        mut self,
        name: impl Into<String>,
        related: impl Into<ResourceType>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations.insert(
            name.into(),
            AssociationInfo {
                related: related.into(),
                owner_key: "id".into(),
                related_key: foreign_key.into(),
                cardinality: Cardinality::Many,
            },
        );
        self
    }

    /// Declares an association with explicit keys.
    pub fn association(mut self, name: impl Into<String>, info: AssociationInfo) -> Self {
        self.associations.insert(name.into(), info);
        self
    }
}

/// A [`Schema`] built from [`Entity`] descriptions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    entities: IndexMap<ResourceType, Entity>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the description of a resource type.
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Returns the description of a resource type.
    pub fn get(&self, resource_type: &ResourceType) -> Option<&Entity> {
        self.entities.get(resource_type)
    }

    /// Iterates over all registered resource types.
    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.entities.keys()
    }
}

impl Schema for Registry {
    fn contains(&self, resource_type: &ResourceType) -> bool {
        self.entities.contains_key(resource_type)
    }

    fn primary_key(&self, resource_type: &ResourceType) -> Option<&str> {
        self.get(resource_type)?.primary_key.as_deref()
    }

    fn fields(&self, resource_type: &ResourceType) -> Vec<&str> {
        self.get(resource_type)
            .map(|entity| entity.fields.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn field_type(&self, resource_type: &ResourceType, field: &str) -> Option<StorageType> {
        self.get(resource_type)?.fields.get(field).copied()
    }

    fn associations(&self, resource_type: &ResourceType) -> Vec<&str> {
        self.get(resource_type)
            .map(|entity| entity.associations.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn association(&self, resource_type: &ResourceType, name: &str) -> Option<&AssociationInfo> {
        self.get(resource_type)?.associations.get(name)
    }
}
