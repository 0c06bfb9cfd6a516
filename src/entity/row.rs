//! Schemaless row format

use crate::value::{Properties, PropertyName, PropertyValue};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A stored row: partition key, row key and a bag of typed properties.
///
/// `etag` and `timestamp` are assigned by the store and are `None` on rows that
/// were produced by mapping an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: Properties,
}

impl TableRow {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            ..Default::default()
        }
    }

    /// Builder-style property setter
    pub fn with_property(
        mut self,
        name: impl Into<PropertyName>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.set(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Row as it is persisted: null markers dropped
    pub fn stored(mut self) -> Self {
        self.properties = self.properties.without_nulls();
        self
    }

    /// Overlay `other` onto this row. Null values remove the property,
    /// properties missing from `other` are kept.
    pub fn merge_from(&mut self, other: &TableRow) {
        for (name, value) in other.properties.iter() {
            if value.is_null() {
                self.properties.remove(name.as_str());
            } else {
                self.properties.set(name.clone(), value.clone());
            }
        }
    }

    /// Discard current contents and take the non-null properties of `other`
    pub fn replace_with(&mut self, other: &TableRow) {
        self.properties = other.properties.clone().without_nulls();
    }
}
