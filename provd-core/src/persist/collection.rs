//! Backend-based document collection.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProvdError, Result};

use super::selector::{contains_operator, matches};
use super::{Document, IdGenerator, Selector, ID_KEY};

/// Upper bound on id-generation attempts before giving up.
const MAX_ID_ATTEMPTS: usize = 1000;

/// Sort direction for [`FindOptions::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Options for [`DocumentCollection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Project the result documents to these dotted keys (`id` always kept).
    pub fields: Option<Vec<String>>,
    /// Number of matching documents to skip.
    pub skip: usize,
    /// Maximum number of documents returned; 0 means no limit.
    pub limit: usize,
    /// Sort by a dotted key. Missing keys sort last ascending.
    pub sort: Option<(String, SortDirection)>,
}

#[derive(Debug)]
struct Inner {
    documents: HashMap<String, Document>,
    // dotted key -> serialized value -> ids
    indexes: HashMap<String, HashMap<String, Vec<String>>>,
    generator: IdGenerator,
    path: Option<PathBuf>,
}

/// A mutable document collection with optional JSON file durability.
///
/// Each call is internally consistent; callers needing cross-call
/// atomicity serialize through the application lock.
#[derive(Debug)]
pub struct DocumentCollection {
    inner: Mutex<Inner>,
}

impl DocumentCollection {
    /// Create a purely in-memory collection.
    pub fn new_memory(generator: IdGenerator) -> Self {
        Self {
            inner: Mutex::new(Inner {
                documents: HashMap::new(),
                indexes: HashMap::new(),
                generator,
                path: None,
            }),
        }
    }

    /// Open a collection backed by a JSON file, loading existing content.
    pub async fn open(path: impl Into<PathBuf>, generator: IdGenerator) -> Result<Self> {
        let path = path.into();
        let mut documents = HashMap::new();
        if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read(&path).await?;
            let loaded: HashMap<String, Document> = serde_json::from_slice(&data)?;
            info!("Loaded {} documents from {:?}", loaded.len(), path);
            documents = loaded;
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                documents,
                indexes: HashMap::new(),
                generator,
                path: Some(path),
            }),
        })
    }

    /// Insert a document, allocating an id when absent.
    ///
    /// Returns the document id. Fails with `InvalidId` when the provided
    /// id already exists.
    pub async fn insert(&self, mut document: Document) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let document_id = match document.get(ID_KEY).and_then(Value::as_str) {
            Some(id) => {
                if inner.documents.contains_key(id) {
                    return Err(ProvdError::invalid_id(id));
                }
                id.to_string()
            }
            None => {
                let id = inner.generate_new_id()?;
                document.insert(ID_KEY.to_string(), Value::String(id.clone()));
                id
            }
        };
        inner.add_to_indexes(&document_id, &document);
        inner.documents.insert(document_id.clone(), document);
        inner.persist().await?;
        Ok(document_id)
    }

    /// Replace a document. Fails with `InvalidId` when the id is unknown.
    pub async fn update(&self, document: Document) -> Result<()> {
        let document_id = document
            .get(ID_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| ProvdError::InvalidDocument("no id key in document".to_string()))?
            .to_string();
        let mut inner = self.inner.lock().await;
        let old_document = inner
            .documents
            .remove(&document_id)
            .ok_or_else(|| ProvdError::invalid_id(&document_id))?;
        inner.remove_from_indexes(&document_id, &old_document);
        inner.add_to_indexes(&document_id, &document);
        inner.documents.insert(document_id, document);
        inner.persist().await?;
        Ok(())
    }

    /// Delete a document.
    ///
    /// Fails with `InvalidId` when unknown and `NonDeletable` when the
    /// document carries `deletable=false`.
    pub async fn delete(&self, document_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let document = inner
            .documents
            .get(document_id)
            .ok_or_else(|| ProvdError::invalid_id(document_id))?;
        if document.get("deletable") == Some(&Value::Bool(false)) {
            return Err(ProvdError::NonDeletable(document_id.to_string()));
        }
        let old_document = inner
            .documents
            .remove(document_id)
            .ok_or_else(|| ProvdError::invalid_id(document_id))?;
        inner.remove_from_indexes(document_id, &old_document);
        inner.persist().await?;
        Ok(())
    }

    /// Return the document with the given id, or `None`.
    pub async fn retrieve(&self, document_id: &str) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner.documents.get(document_id).cloned())
    }

    /// Return every document matching the selector.
    pub async fn find(&self, selector: &Selector, options: &FindOptions) -> Result<Vec<Document>> {
        debug!(
            "find: selector={:?} skip={} limit={}",
            selector, options.skip, options.limit
        );
        let inner = self.inner.lock().await;
        let mut documents = inner.matching_documents(selector);
        if let Some((key, direction)) = &options.sort {
            sort_documents(&mut documents, key, *direction);
        }
        let documents = documents
            .into_iter()
            .skip(options.skip)
            .take(if options.limit == 0 {
                usize::MAX
            } else {
                options.limit
            });
        let projected = match &options.fields {
            None => documents.collect(),
            Some(fields) => documents.map(|d| project_fields(&d, fields)).collect(),
        };
        Ok(projected)
    }

    /// Return the first document matching the selector, or `None`.
    pub async fn find_one(&self, selector: &Selector) -> Result<Option<Document>> {
        let results = self
            .find(
                selector,
                &FindOptions {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await?;
        Ok(results.into_iter().next())
    }

    /// Declare an index on a dotted key. Idempotent.
    pub async fn ensure_index(&self, complex_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.indexes.contains_key(complex_key) {
            return Ok(());
        }
        info!("Creating index on complex key {}", complex_key);
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for (document_id, document) in &inner.documents {
            if let Some(value) = complex_key_value(complex_key, document) {
                index_value(&mut index, document_id, value);
            }
        }
        inner.indexes.insert(complex_key.to_string(), index);
        Ok(())
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.documents.len()
    }

    /// True when the collection holds no documents.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Flush to the backing file, when one is configured.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.persist().await
    }
}

impl Inner {
    fn generate_new_id(&mut self) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.generator.next_id();
            if !self.documents.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ProvdError::IdGeneration(MAX_ID_ATTEMPTS))
    }

    async fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let data = serde_json::to_vec_pretty(&self.documents)?;
            tokio::fs::write(path, data).await?;
            debug!("Persisted {} documents to {:?}", self.documents.len(), path);
        }
        Ok(())
    }

    fn add_to_indexes(&mut self, document_id: &str, document: &Document) {
        for (complex_key, index) in self.indexes.iter_mut() {
            if let Some(value) = complex_key_value(complex_key, document) {
                index_value(index, document_id, value);
            }
        }
    }

    fn remove_from_indexes(&mut self, document_id: &str, document: &Document) {
        for (complex_key, index) in self.indexes.iter_mut() {
            if let Some(value) = complex_key_value(complex_key, document) {
                unindex_value(index, document_id, value);
            }
        }
    }

    fn matching_documents(&self, selector: &Selector) -> Vec<Document> {
        // common case optimization when only the id is selected on
        if selector.len() == 1 {
            if let Some(id_value) = selector.get(ID_KEY) {
                if !contains_operator(id_value) {
                    if let Some(id) = id_value.as_str() {
                        return self.documents.get(id).cloned().into_iter().collect();
                    }
                }
            }
        }

        // split into an index-usable part and a regular part
        let mut indexed: Vec<(&String, &Value)> = Vec::new();
        let mut regular = Selector::new();
        for (s_key, s_value) in selector {
            if self.indexes.contains_key(s_key) && !contains_operator(s_value) {
                indexed.push((s_key, s_value));
            } else {
                regular.insert(s_key.clone(), s_value.clone());
            }
        }

        let candidates: Vec<&Document> = if indexed.is_empty() {
            self.documents.values().collect()
        } else {
            let mut ids: Option<HashSet<&String>> = None;
            for (s_key, s_value) in indexed {
                let index = &self.indexes[s_key];
                let entry = index
                    .get(&serialize_index_key(s_value))
                    .map(|ids| ids.iter().collect::<HashSet<_>>())
                    .unwrap_or_default();
                ids = Some(match ids {
                    None => entry,
                    Some(acc) => acc.intersection(&entry).copied().collect(),
                });
            }
            ids.unwrap_or_default()
                .into_iter()
                .filter_map(|id| self.documents.get(id))
                .collect()
        };

        candidates
            .into_iter()
            .filter(|d| matches(&regular, d))
            .cloned()
            .collect()
    }
}

fn serialize_index_key(value: &Value) -> String {
    value.to_string()
}

fn index_value(index: &mut HashMap<String, Vec<String>>, document_id: &str, value: &Value) {
    let mut push = |value: &Value| {
        let entry = index.entry(serialize_index_key(value)).or_default();
        if !entry.iter().any(|id| id == document_id) {
            entry.push(document_id.to_string());
        }
    };
    push(value);
    if let Value::Array(items) = value {
        for item in items {
            push(item);
        }
    }
}

fn unindex_value(index: &mut HashMap<String, Vec<String>>, document_id: &str, value: &Value) {
    let mut pop = |value: &Value| {
        let key = serialize_index_key(value);
        if let Some(entry) = index.get_mut(&key) {
            entry.retain(|id| id != document_id);
            if entry.is_empty() {
                index.remove(&key);
            }
        }
    };
    pop(value);
    if let Value::Array(items) = value {
        for item in items {
            pop(item);
        }
    }
}

/// Descend a dotted key through nested objects, without list flattening.
fn complex_key_value<'a>(complex_key: &str, document: &'a Document) -> Option<&'a Value> {
    let mut tokens = complex_key.split('.');
    let first = tokens.next()?;
    let mut current = document.get(first)?;
    for token in tokens {
        current = current.as_object()?.get(token)?;
    }
    Some(current)
}

fn compare_sort_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn sort_documents(documents: &mut [Document], key: &str, direction: SortDirection) {
    documents.sort_by(|a, b| {
        let va = complex_key_value(key, a);
        let vb = complex_key_value(key, b);
        let ordering = match (&va, &vb) {
            (Some(x), Some(y)) => compare_sort_values(x, y),
            // missing keys sort last ascending
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

fn project_fields(document: &Document, fields: &[String]) -> Document {
    let mut result = Document::new();
    if let Some(id) = document.get(ID_KEY) {
        result.insert(ID_KEY.to_string(), id.clone());
    }
    for field in fields {
        let Some(value) = complex_key_value(field, document) else {
            continue;
        };
        let tokens: Vec<&str> = field.split('.').collect();
        let mut current = &mut result;
        for token in &tokens[..tokens.len() - 1] {
            let entry = current
                .entry(token.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            current = match entry {
                Value::Object(map) => map,
                // a scalar already projected under this prefix wins
                _ => return result,
            };
        }
        current.insert(tokens[tokens.len() - 1].to_string(), value.clone());
    }
    result
}
