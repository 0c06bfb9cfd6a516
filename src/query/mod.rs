//! Query model: filter expressions, table queries and filter generators.
//!
//! Filters render to the service's textual filter syntax
//! (`PartitionKey eq 'a' and RowKey ge '2024'`). Remote stores receive them
//! as-is; the in-memory table only understands conjunctions (see
//! [`ConjunctiveQuery`]).

mod conjunctive;

pub use conjunctive::ConjunctiveQuery;

use crate::entity::TableRow;
use crate::error::{Error, Result};
use crate::value::PropertyValue;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";

/// Comparison operator of a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComparison {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl QueryComparison {
    /// Whether `left <op> right` holds given `left.cmp(right)`
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            QueryComparison::Equal => ordering == Ordering::Equal,
            QueryComparison::NotEqual => ordering != Ordering::Equal,
            QueryComparison::GreaterThan => ordering == Ordering::Greater,
            QueryComparison::GreaterThanOrEqual => ordering != Ordering::Less,
            QueryComparison::LessThan => ordering == Ordering::Less,
            QueryComparison::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for QueryComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            QueryComparison::Equal => "eq",
            QueryComparison::NotEqual => "ne",
            QueryComparison::GreaterThan => "gt",
            QueryComparison::GreaterThanOrEqual => "ge",
            QueryComparison::LessThan => "lt",
            QueryComparison::LessThanOrEqual => "le",
        };
        f.write_str(op)
    }
}

impl FromStr for QueryComparison {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eq" => Ok(QueryComparison::Equal),
            "ne" => Ok(QueryComparison::NotEqual),
            "gt" => Ok(QueryComparison::GreaterThan),
            "ge" => Ok(QueryComparison::GreaterThanOrEqual),
            "lt" => Ok(QueryComparison::LessThan),
            "le" => Ok(QueryComparison::LessThanOrEqual),
            other => Err(Error::BadRequest(format!("unknown comparison '{}'", other))),
        }
    }
}

/// `property <op> literal`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub property: String,
    pub op: QueryComparison,
    pub value: PropertyValue,
}

impl Condition {
    /// Evaluate against a row. Missing properties and incomparable kinds never match.
    pub fn matches(&self, row: &TableRow) -> bool {
        let actual = if self.property.eq_ignore_ascii_case(PARTITION_KEY) {
            PropertyValue::String(row.partition_key.clone())
        } else if self.property.eq_ignore_ascii_case(ROW_KEY) {
            PropertyValue::String(row.row_key.clone())
        } else if self.property.eq_ignore_ascii_case(TIMESTAMP) {
            match row.timestamp {
                Some(ts) => PropertyValue::DateTime(ts),
                None => return false,
            }
        } else {
            match row.properties.get(&self.property) {
                Some(value) if !value.is_null() => value.clone(),
                _ => return false,
            }
        };

        actual
            .compare(&self.value)
            .map(|ordering| self.op.holds(ordering))
            .unwrap_or(false)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.property, self.op, self.value)
    }
}

/// Filter expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Condition(Condition),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn condition(
        property: impl Into<String>,
        op: QueryComparison,
        value: impl Into<PropertyValue>,
    ) -> Self {
        Filter::Condition(Condition {
            property: property.into(),
            op,
            value: value.into(),
        })
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// `PartitionKey eq '<pk>'`
    pub fn partition_key_eq(partition_key: impl Into<String>) -> Self {
        Filter::condition(PARTITION_KEY, QueryComparison::Equal, partition_key.into())
    }

    /// `RowKey <op> '<rk>'`
    pub fn row_key(op: QueryComparison, row_key: impl Into<String>) -> Self {
        Filter::condition(ROW_KEY, op, row_key.into())
    }

    /// Join with `or`; `None` for an empty input
    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Option<Filter> {
        filters.into_iter().reduce(Filter::or)
    }

    /// Join with `and`; `None` for an empty input
    pub fn all_of(filters: impl IntoIterator<Item = Filter>) -> Option<Filter> {
        filters.into_iter().reduce(Filter::and)
    }

    /// Full evaluation, including disjunctions
    pub fn matches(&self, row: &TableRow) -> bool {
        match self {
            Filter::Condition(c) => c.matches(row),
            Filter::And(a, b) => a.matches(row) && b.matches(row),
            Filter::Or(a, b) => a.matches(row) || b.matches(row),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Condition(c) => write!(f, "{}", c),
            Filter::And(a, b) => write!(f, "({}) and ({})", a, b),
            Filter::Or(a, b) => write!(f, "({}) or ({})", a, b),
        }
    }
}

/// Parses the conjunctive subset of the filter syntax
impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let conditions = conjunctive::parse_conditions(s)?;
        Filter::all_of(conditions.into_iter().map(Filter::Condition))
            .ok_or_else(|| Error::BadRequest("empty filter".to_string()))
    }
}

/// Filter, row limit and projection sent to the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    pub filter: Option<Filter>,
    pub take: Option<usize>,
    pub select: Option<Vec<String>>,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Default::default()
        }
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Evaluate the filter against a row; no filter matches everything
    pub fn matches(&self, row: &TableRow) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(row))
    }

    /// Apply the projection to a row. Keys are always kept.
    pub fn project(&self, mut row: TableRow) -> TableRow {
        if let Some(columns) = &self.select {
            let projected = columns
                .iter()
                .filter_map(|c| {
                    row.properties
                        .get(c)
                        .map(|v| (crate::value::PropertyName::new(c.as_str()), v.clone()))
                })
                .collect();
            row.properties = projected;
        }
        row
    }
}

impl fmt::Display for TableQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}", filter)?,
            None => write!(f, "<all>")?,
        }
        if let Some(take) = self.take {
            write!(f, " take {}", take)?;
        }
        Ok(())
    }
}

/// All rows of a partition
pub fn partition_filter(partition_key: &str) -> Filter {
    Filter::partition_key_eq(partition_key)
}

/// Given rows of one partition
pub fn row_keys_filter<S: AsRef<str>>(partition_key: &str, row_keys: &[S]) -> Option<Filter> {
    let rows = Filter::any_of(
        row_keys
            .iter()
            .map(|rk| Filter::row_key(QueryComparison::Equal, rk.as_ref())),
    )?;
    Some(Filter::partition_key_eq(partition_key).and(rows))
}

/// All rows of the given partitions
pub fn partition_keys_filter<S: AsRef<str>>(partition_keys: &[S]) -> Option<Filter> {
    Filter::any_of(
        partition_keys
            .iter()
            .map(|pk| Filter::partition_key_eq(pk.as_ref())),
    )
}

/// Exact (partition key, row key) pairs
pub fn keys_filter<P: AsRef<str>, R: AsRef<str>>(keys: &[(P, R)]) -> Option<Filter> {
    Filter::any_of(keys.iter().map(|(pk, rk)| {
        Filter::partition_key_eq(pk.as_ref())
            .and(Filter::row_key(QueryComparison::Equal, rk.as_ref()))
    }))
}

/// Rows of a partition whose row key lies in `[from, to)`
pub fn row_key_range_filter(partition_key: &str, from: &str, to: &str) -> Filter {
    Filter::partition_key_eq(partition_key)
        .and(Filter::row_key(QueryComparison::GreaterThanOrEqual, from))
        .and(Filter::row_key(QueryComparison::LessThan, to))
}
