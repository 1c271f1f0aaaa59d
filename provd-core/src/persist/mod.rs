//! Document persistence.
//!
//! A mutable document store with MongoDB-flavoured selectors, dotted-key
//! traversal, optional dotted-key indexes and an optional JSON file
//! backend for durability. Documents are JSON objects; every document
//! carries a string id under the `"id"` key.

mod collection;
mod id;
mod selector;

pub use collection::{DocumentCollection, FindOptions, SortDirection};
pub use id::IdGenerator;
pub use selector::{contains_operator, matches, retrieve_doc_values};

/// Key under which every document stores its id.
pub const ID_KEY: &str = "id";

/// A stored document.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// A selector over documents (dotted keys to values or operator objects).
pub type Selector = serde_json::Map<String, serde_json::Value>;
