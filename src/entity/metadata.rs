//! Per-type mapping metadata.
//!
//! Entities register their members through [`EntityDescriptor`]. The
//! registration is validated once and the resulting [`EntityMetadata`] is cached
//! process-wide keyed by `TypeId`. Validation failures are not cached.

use super::field::EntityField;
use super::row::TableRow;
use super::TableEntity;
use crate::error::{Error, Result};
use crate::value::{Properties, PropertyValue, ValueKind};
use dashmap::DashMap;
use lazy_static::lazy_static;
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const PARTITION_KEY_PROPERTY: &str = "PartitionKey";

type ReadFn<T> = Box<dyn Fn(&T) -> PropertyValue + Send + Sync>;
type WriteFn<T> = Box<dyn Fn(&mut T, &PropertyValue) -> Result<()> + Send + Sync>;
type ReadKeyFn<T> = Box<dyn Fn(&T) -> Result<String> + Send + Sync>;
type WriteKeyFn<T> = Box<dyn Fn(&mut T, &str) -> Result<()> + Send + Sync>;

lazy_static! {
    static ref METADATA_CACHE: DashMap<TypeId, Arc<dyn Any + Send + Sync>> = DashMap::new();
}

/// Typed accessor pair for one member
pub struct MemberAccessor<T> {
    name: String,
    kind: ValueKind,
    nullable: bool,
    read: ReadFn<T>,
    write: WriteFn<T>,
    read_key: ReadKeyFn<T>,
    write_key: WriteKeyFn<T>,
}

impl<T: 'static> MemberAccessor<T> {
    fn new<F, G, S>(name: &str, get: G, set: S) -> Self
    where
        F: EntityField,
        G: Fn(&T) -> &F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        let get = Arc::new(get);
        let set = Arc::new(set);
        let key_get = Arc::clone(&get);
        let key_set = Arc::clone(&set);

        Self {
            name: name.to_string(),
            kind: F::KIND,
            nullable: F::NULLABLE,
            read: Box::new(move |entity: &T| (*get)(entity).to_value()),
            write: Box::new(move |entity: &mut T, value: &PropertyValue| {
                (*set)(entity, F::from_value(value)?);
                Ok(())
            }),
            read_key: Box::new(move |entity: &T| (*key_get)(entity).to_key()),
            write_key: Box::new(move |entity: &mut T, key: &str| {
                (*key_set)(entity, F::from_key(key)?);
                Ok(())
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    PartitionKey,
    RowKey,
    Property,
}

/// Registration surface handed to [`TableEntity::describe`]
pub struct EntityDescriptor<T> {
    members: Vec<(Role, MemberAccessor<T>)>,
    const_partition_keys: Vec<String>,
    ignored: Vec<String>,
}

impl<T: 'static> EntityDescriptor<T> {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            const_partition_keys: Vec::new(),
            ignored: Vec::new(),
        }
    }

    /// Member supplying the partition key
    pub fn partition_key<F, G, S>(&mut self, name: &str, get: G, set: S) -> &mut Self
    where
        F: EntityField,
        G: Fn(&T) -> &F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        self.members
            .push((Role::PartitionKey, MemberAccessor::new(name, get, set)));
        self
    }

    /// Fixed partition key shared by every row of the type
    pub fn const_partition_key(&mut self, value: impl Into<String>) -> &mut Self {
        self.const_partition_keys.push(value.into());
        self
    }

    /// Member supplying the row key
    pub fn row_key<F, G, S>(&mut self, name: &str, get: G, set: S) -> &mut Self
    where
        F: EntityField,
        G: Fn(&T) -> &F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        self.members
            .push((Role::RowKey, MemberAccessor::new(name, get, set)));
        self
    }

    /// Ordinary mapped member
    pub fn property<F, G, S>(&mut self, name: &str, get: G, set: S) -> &mut Self
    where
        F: EntityField,
        G: Fn(&T) -> &F + Send + Sync + 'static,
        S: Fn(&mut T, F) + Send + Sync + 'static,
    {
        self.members
            .push((Role::Property, MemberAccessor::new(name, get, set)));
        self
    }

    /// Exclude a member from mapping
    pub fn ignore(&mut self, name: &str) -> &mut Self {
        self.ignored.push(name.to_string());
        self
    }
}

enum PartitionKeySource<T> {
    Member(MemberAccessor<T>),
    Constant(String),
}

/// Validated mapping metadata of an entity type
pub struct EntityMetadata<T> {
    type_name: &'static str,
    partition_key: PartitionKeySource<T>,
    row_key: MemberAccessor<T>,
    properties: Vec<MemberAccessor<T>>,
}

impl<T: TableEntity> EntityMetadata<T> {
    fn build() -> Result<Self> {
        let type_name = std::any::type_name::<T>();
        let mut descriptor = EntityDescriptor::<T>::new();
        T::describe(&mut descriptor);
        Self::validate(type_name, descriptor)
    }

    fn validate(type_name: &'static str, descriptor: EntityDescriptor<T>) -> Result<Self> {
        let fail = |msg: String| Err(Error::Configuration(format!("entity {}: {}", type_name, msg)));

        let EntityDescriptor {
            members,
            mut const_partition_keys,
            ignored,
        } = descriptor;

        let ignored: HashSet<String> = ignored.iter().map(|n| n.to_ascii_lowercase()).collect();

        let mut seen = HashSet::new();
        for (_, member) in &members {
            if !seen.insert(member.name.to_ascii_lowercase()) {
                return fail(format!("member '{}' is registered more than once", member.name));
            }
        }

        let mut partition_keys = Vec::new();
        let mut row_keys = Vec::new();
        let mut properties = Vec::new();
        for (role, member) in members {
            match role {
                Role::PartitionKey => partition_keys.push(member),
                Role::RowKey => row_keys.push(member),
                Role::Property if ignored.contains(&member.name.to_ascii_lowercase()) => {}
                Role::Property => properties.push(member),
            }
        }

        for key in partition_keys.iter().chain(row_keys.iter()) {
            if key.nullable {
                return fail(format!(
                    "key member '{}' is nullable; nullable keys are not supported",
                    key.name
                ));
            }
            if !key.kind.is_key_compatible() {
                return fail(format!(
                    "key member '{}' has type {} which cannot be used as a key",
                    key.name, key.kind
                ));
            }
        }

        if const_partition_keys.len() > 1 {
            return fail("more than one constant partition key".to_string());
        }
        if partition_keys.len() > 1 {
            return fail("more than one partition key member".to_string());
        }

        let partition_key = match (partition_keys.pop(), const_partition_keys.pop()) {
            (Some(_), Some(_)) => {
                return fail(
                    "a partition key member cannot be combined with a constant partition key"
                        .to_string(),
                )
            }
            (None, None) => return fail("no partition key member or constant".to_string()),
            (None, Some(constant)) if constant.trim().is_empty() => {
                return fail("constant partition key must not be empty".to_string())
            }
            (None, Some(constant)) => PartitionKeySource::Constant(constant),
            (Some(member), None) => PartitionKeySource::Member(member),
        };

        // The constant wins over a property that would shadow the key
        if matches!(partition_key, PartitionKeySource::Constant(_)) {
            properties.retain(|p| {
                let shadows = p.name.eq_ignore_ascii_case(PARTITION_KEY_PROPERTY);
                if shadows {
                    debug!(
                        entity = type_name,
                        member = %p.name,
                        "Skipping property shadowed by constant partition key"
                    );
                }
                !shadows
            });
        }

        if row_keys.len() > 1 {
            return fail("more than one row key member".to_string());
        }
        let row_key = match row_keys.pop() {
            Some(member) => member,
            None => return fail("no row key member".to_string()),
        };

        Ok(Self {
            type_name,
            partition_key,
            row_key,
            properties,
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Constant partition key, if the type uses one
    pub fn const_partition_key(&self) -> Option<&str> {
        match &self.partition_key {
            PartitionKeySource::Constant(c) => Some(c),
            PartitionKeySource::Member(_) => None,
        }
    }

    /// Mapped (non-key) members
    pub fn properties(&self) -> &[MemberAccessor<T>] {
        &self.properties
    }

    pub fn partition_key_of(&self, entity: &T) -> Result<String> {
        match &self.partition_key {
            PartitionKeySource::Constant(c) => Ok(c.clone()),
            PartitionKeySource::Member(member) => (member.read_key)(entity),
        }
    }

    pub fn row_key_of(&self, entity: &T) -> Result<String> {
        (self.row_key.read_key)(entity)
    }

    /// Map an entity to a row. `None` members become null markers.
    pub fn to_row(&self, entity: &T) -> Result<TableRow> {
        let mut properties = Properties::new();
        for member in &self.properties {
            properties.set(member.name.as_str(), (member.read)(entity));
        }

        Ok(TableRow {
            partition_key: self.partition_key_of(entity)?,
            row_key: self.row_key_of(entity)?,
            etag: None,
            timestamp: None,
            properties,
        })
    }

    /// Build an entity from a row. Unknown properties are ignored, missing
    /// ones keep the type's defaults.
    pub fn from_row(&self, row: &TableRow) -> Result<T> {
        let mut entity = T::default();

        if let PartitionKeySource::Member(member) = &self.partition_key {
            (member.write_key)(&mut entity, &row.partition_key)?;
        }
        (self.row_key.write_key)(&mut entity, &row.row_key)?;

        for member in &self.properties {
            match row.properties.get(&member.name) {
                Some(value) if !value.is_null() => (member.write)(&mut entity, value)
                    .map_err(|e| {
                        Error::Serialization(format!(
                            "{}.{}: {}",
                            self.type_name, member.name, e
                        ))
                    })?,
                _ => {}
            }
        }

        Ok(entity)
    }

    /// Map a slice of rows, failing on the first row that does not fit
    pub fn from_rows(&self, rows: &[TableRow]) -> Result<Vec<T>> {
        rows.iter().map(|row| self.from_row(row)).collect()
    }
}

/// Metadata for `T`, built on first use and cached for the process lifetime
pub fn describe<T: TableEntity>() -> Result<Arc<EntityMetadata<T>>> {
    let id = TypeId::of::<T>();

    let cached = METADATA_CACHE.get(&id).map(|entry| Arc::clone(entry.value()));
    let erased = match cached {
        Some(erased) => erased,
        None => {
            let built: Arc<dyn Any + Send + Sync> = Arc::new(EntityMetadata::<T>::build()?);
            debug!(entity = std::any::type_name::<T>(), "Entity metadata built");
            // first writer wins; concurrent builders all observe the same instance
            let entry = METADATA_CACHE.entry(id).or_insert(built);
            Arc::clone(entry.value())
        }
    };

    erased.downcast::<EntityMetadata<T>>().map_err(|_| {
        Error::Internal(format!(
            "metadata cache holds a foreign type for {}",
            std::any::type_name::<T>()
        ))
    })
}
