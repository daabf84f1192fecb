//! Document persistence
//!
//! Analysis state snapshots and final results are JSON documents addressed by
//! `(collection, id)`:
//!
//! | collection          | id        | content                         |
//! |---------------------|-----------|---------------------------------|
//! | `analysis_states`   | `task_id` | latest [`AnalysisState`]        |
//! | `analysis_results`  | `task_id` | final report of a completed run |
//!
//! Backends implement [`DocumentStore`]. Two decorators wrap any backend:
//!
//! - [`RetryingStore`] retries transient failures with the policy table
//! - [`ContextPooledStore`] opens one connection per isolation context, so a
//!   connection is never shared between concurrently running tasks

use crate::error::{PipelineError, Result};
use crate::isolation::IsolationContext;
use crate::retry::{retry_with_backoff, RetryPolicyTable};
use crate::state::AnalysisState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

/// Well-known collection names
pub mod collections {
    pub const ANALYSIS_STATES: &str = "analysis_states";
    pub const ANALYSIS_RESULTS: &str = "analysis_results";
}

/// Equality filter for [`DocumentStore::query`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreFilter {
    /// Top-level field that must equal the value
    pub equals: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl StoreFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

/// Persistence for JSON documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or replace
    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Documents matching `filter`, ordered by id
    async fn query(&self, collection: &str, filter: &StoreFilter) -> Result<Vec<(String, Value)>>;
}

/// Persist the latest snapshot of a run
pub async fn save_state(store: &dyn DocumentStore, state: &AnalysisState) -> Result<()> {
    store
        .put(collections::ANALYSIS_STATES, &state.task_id, serde_json::to_value(state)?)
        .await
}

/// Load the latest snapshot of a run
pub async fn load_state(store: &dyn DocumentStore, task_id: &str) -> Result<Option<AnalysisState>> {
    match store.get(collections::ANALYSIS_STATES, task_id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// In-memory document store
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    data: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.data.read().await.get(collection).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.data
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self
            .data
            .write()
            .await
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn query(&self, collection: &str, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        let data = self.data.read().await;
        let Some(docs) = data.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }
}

fn validate_key(kind: &str, key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!("{} {:?} is not a valid store key", kind, key)))
    }
}

fn io_error(e: std::io::Error) -> PipelineError {
    PipelineError::TransientStore(e.to_string())
}

/// Documents as `<root>/<collection>/<id>.json`
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_key("collection", collection)?;
        validate_key("document id", id)?;
        Ok(self.root.join(collection).join(format!("{}.json", id)))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let path = self.path(collection, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        let path = self.path(collection, id)?;
        let dir = self.root.join(collection);
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;

        let tmp = dir.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)
            .await
            .map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let path = self.path(collection, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn query(&self, collection: &str, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        validate_key("collection", collection)?;
        let dir = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for id in ids {
            if out.len() >= limit {
                break;
            }
            if let Some(doc) = self.get(collection, &id).await? {
                if filter.matches(&doc) {
                    out.push((id, doc));
                }
            }
        }
        Ok(out)
    }
}

/// Retries transient failures of the wrapped store
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn DocumentStore>,
    policies: RetryPolicyTable,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn DocumentStore>, policies: RetryPolicyTable) -> Self {
        Self { inner, policies }
    }
}

#[async_trait]
impl DocumentStore for RetryingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        retry_with_backoff(&self.policies, "store.get", || self.inner.get(collection, id)).await
    }

    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        retry_with_backoff(&self.policies, "store.put", || {
            self.inner.put(collection, id, document.clone())
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        retry_with_backoff(&self.policies, "store.delete", || self.inner.delete(collection, id)).await
    }

    async fn query(&self, collection: &str, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        retry_with_backoff(&self.policies, "store.query", || self.inner.query(collection, filter)).await
    }
}

/// Opens a store connection
pub type StoreConnector = Arc<dyn Fn() -> Result<Arc<dyn DocumentStore>> + Send + Sync>;

const POOL_NAME: &str = "document-store";

/// Resolves a connection from the current isolation context's pool on every call
///
/// Outside any context a single ambient connection is used.
#[derive(Clone)]
pub struct ContextPooledStore {
    connector: StoreConnector,
    ambient: Arc<Mutex<Option<Arc<dyn DocumentStore>>>>,
}

impl ContextPooledStore {
    pub fn new(connector: StoreConnector) -> Self {
        Self {
            connector,
            ambient: Arc::new(Mutex::new(None)),
        }
    }

    fn connection(&self) -> Result<Arc<dyn DocumentStore>> {
        if let Some(ctx) = IsolationContext::try_current() {
            let connector = self.connector.clone();
            let pool = ctx.pool(POOL_NAME, move || connector())?;
            let lease = pool.acquire()?;
            return Ok(lease.get()?.clone());
        }

        let mut ambient = self.ambient.lock().unwrap_or_else(|p| p.into_inner());
        match ambient.as_ref() {
            Some(conn) => Ok(conn.clone()),
            None => {
                debug!("Opening ambient document store connection");
                let conn = (self.connector)()?;
                *ambient = Some(conn.clone());
                Ok(conn)
            }
        }
    }
}

#[async_trait]
impl DocumentStore for ContextPooledStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.connection()?.get(collection, id).await
    }

    async fn put(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.connection()?.put(collection, id, document).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.connection()?.delete(collection, id).await
    }

    async fn query(&self, collection: &str, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        self.connection()?.query(collection, filter).await
    }
}
