//! Entity mapping between plain Rust structs and table rows.
//!
//! Instead of runtime reflection every entity type lists its members once in
//! [`TableEntity::describe`], handing the descriptor a name plus a getter and
//! a setter per member:
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Default)]
//! struct Trade {
//!     account: String,
//!     id: Uuid,
//!     amount: Decimal,
//!     note: Option<String>,
//! }
//!
//! impl TableEntity for Trade {
//!     fn describe(d: &mut EntityDescriptor<Self>) {
//!         d.partition_key("Account", |t: &Trade| &t.account, |t, v| t.account = v)
//!             .row_key("Id", |t: &Trade| &t.id, |t, v| t.id = v)
//!             .property("Amount", |t: &Trade| &t.amount, |t, v| t.amount = v)
//!             .property("Note", |t: &Trade| &t.note, |t, v| t.note = v);
//!     }
//! }
//! ```
//!
//! The registration is validated on first use (see [`describe`]).

mod field;
mod metadata;
mod row;

pub use field::EntityField;
pub use metadata::{describe, EntityDescriptor, EntityMetadata, MemberAccessor};
pub use row::TableRow;

use crate::error::Result;

/// A type that can be stored in a table
pub trait TableEntity: Default + Clone + Send + Sync + 'static {
    /// Register key sources and mapped members
    fn describe(descriptor: &mut EntityDescriptor<Self>);
}

/// Map an entity to its row representation
pub fn to_row<T: TableEntity>(entity: &T) -> Result<TableRow> {
    describe::<T>()?.to_row(entity)
}

/// Rebuild an entity from a row
pub fn from_row<T: TableEntity>(row: &TableRow) -> Result<T> {
    describe::<T>()?.from_row(row)
}
