//! Persistent memory store: named, durable collections of records with a
//! deterministic lexical query path.
//!
//! Layout:
//!   {base_path}/{collection}.jsonl — header line + one record per line
//!
//! Collections are opened at store construction and live for the store's
//! lifetime. Reads are concurrent (readers never block readers); the
//! write/ingest surface ([`MemoryStore::insert`]) is Rust-level only and is
//! never reachable from inside a sandbox.

mod record;

pub use record::{CollectionEntry, MemoryRecord};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// How often the scoring loop checks the call deadline.
const DEADLINE_CHECK_INTERVAL: usize = 1024;

/// Failure modes of the query path, mapped by the bridge into
/// host-function diagnostics.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("collection '{name}' does not exist")]
    UnknownCollection { name: String, available: Vec<String> },
    #[error("query interrupted by the call deadline")]
    Interrupted,
}

/// A record as held in memory, with its term frequencies precomputed at
/// load/insert time so queries only read.
struct StoredRecord {
    id: String,
    content: String,
    metadata: Map<String, Value>,
    terms: HashMap<String, u32>,
    token_total: usize,
}

impl StoredRecord {
    fn new(id: String, content: String, metadata: Map<String, Value>) -> Self {
        let tokens = tokenize(&content);
        let token_total = tokens.len();
        let mut terms: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *terms.entry(token).or_insert(0) += 1;
        }
        Self {
            id,
            content,
            metadata,
            terms,
            token_total,
        }
    }

    fn to_record(&self, collection: &str, score: Option<f64>) -> MemoryRecord {
        MemoryRecord {
            id: self.id.clone(),
            collection: collection.to_string(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            score,
        }
    }
}

struct Collection {
    name: String,
    path: PathBuf,
    records: RwLock<Vec<StoredRecord>>,
}

/// Store counters, observable by callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub collections: usize,
    pub records: usize,
    pub queries: u64,
}

pub struct MemoryStore {
    base_path: PathBuf,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    query_count: AtomicU64,
}

impl MemoryStore {
    /// Opens or creates a store rooted at `path`, loading every
    /// `{collection}.jsonl` file found there. Query results for unchanged
    /// data are identical across restarts.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("creating store directory {}", path.display()))?;

        let mut collections = HashMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                let name = file_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                if name.is_empty() {
                    continue;
                }
                let collection = load_collection(&name, &file_path)?;
                collections.insert(name, Arc::new(collection));
            }
        }

        let record_total: usize = collections
            .values()
            .map(|c| c.records.read().unwrap().len())
            .sum();
        info!(
            "Memory store opened at {} ({} collections, {} records)",
            path.display(),
            collections.len(),
            record_total
        );

        Ok(Self {
            base_path: path.to_path_buf(),
            collections: RwLock::new(collections),
            query_count: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Creates a durable collection. Idempotent: opening an existing name
    /// is a no-op.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("invalid collection name '{name}': use [A-Za-z0-9_-] only");
        }

        let mut collections = self.collections.write().unwrap();
        if collections.contains_key(name) {
            return Ok(());
        }

        let path = self.base_path.join(format!("{name}.jsonl"));
        let header = CollectionEntry::Header {
            version: 1,
            created: chrono::Utc::now().to_rfc3339(),
            name: name.to_string(),
        };
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", serde_json::to_string(&header)?)?;

        collections.insert(
            name.to_string(),
            Arc::new(Collection {
                name: name.to_string(),
                path,
                records: RwLock::new(Vec::new()),
            }),
        );
        info!("Created collection '{name}'");
        Ok(())
    }

    /// Appends a record to a collection and returns its id.
    ///
    /// This is the external ingest surface — sandboxed scripts have no path
    /// to it.
    pub fn insert(
        &self,
        collection: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        let coll = {
            let collections = self.collections.read().unwrap();
            match collections.get(collection) {
                Some(c) => c.clone(),
                None => bail!("collection '{collection}' does not exist"),
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let entry = CollectionEntry::Record {
            id: id.clone(),
            content: content.to_string(),
            metadata: metadata.clone(),
        };
        let line = serde_json::to_string(&entry)?;

        // Hold the write lock across file append + in-memory push so the
        // two stay consistent under concurrent inserts.
        let mut records = coll.records.write().unwrap();
        let mut file = OpenOptions::new().append(true).open(&coll.path)?;
        writeln!(file, "{line}")?;
        records.push(StoredRecord::new(id.clone(), content.to_string(), metadata));
        Ok(id)
    }

    pub fn collection_exists(&self, name: &str) -> bool {
        self.collections.read().unwrap().contains_key(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().unwrap();
        match collections.get(collection) {
            Some(c) => Ok(c.records.read().unwrap().len()),
            None => bail!("collection '{collection}' does not exist"),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let collections = self.collections.read().unwrap();
        let records = collections
            .values()
            .map(|c| c.records.read().unwrap().len())
            .sum();
        StoreStats {
            collections: collections.len(),
            records,
            queries: self.query_count.load(Ordering::Relaxed),
        }
    }

    /// Ranks records in `collection` against `text`.
    ///
    /// Guarantees: deterministic ordering for identical store state and
    /// query (ties broken by ascending record id), monotonically
    /// non-increasing score, at most `limit` results, and no record from
    /// another collection. Passing a `deadline` bounds the scan so a query
    /// can never outlive its call's wall-clock budget.
    pub fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
        deadline: Option<Instant>,
    ) -> std::result::Result<Vec<MemoryRecord>, QueryError> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let coll = {
            let collections = self.collections.read().unwrap();
            match collections.get(collection) {
                Some(c) => c.clone(),
                None => {
                    return Err(QueryError::UnknownCollection {
                        name: collection.to_string(),
                        available: collections.keys().cloned().collect(),
                    })
                }
            }
        };

        let mut query_terms = tokenize(text);
        query_terms.sort();
        query_terms.dedup();

        let records = coll.records.read().unwrap();
        let mut scored: Vec<(f64, usize)> = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if index % DEADLINE_CHECK_INTERVAL == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(QueryError::Interrupted);
                    }
                }
            }
            let score = score(&query_terms, record);
            if score > 0.0 {
                scored.push((score, index));
            }
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| records[a.1].id.cmp(&records[b.1].id))
        });
        scored.truncate(limit);

        debug!(
            "query collection='{}' terms={} matched={}",
            coll.name,
            query_terms.len(),
            scored.len()
        );

        Ok(scored
            .into_iter()
            .map(|(s, index)| records[index].to_record(&coll.name, Some(s)))
            .collect())
    }
}

/// Lowercased alphanumeric word tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Normalized term-frequency overlap in (0, 1]; 0 means no overlap.
///
/// Log-damped term frequency over matched query terms, normalized by the
/// query width and a length damping so short relevant records outrank long
/// rambling ones. Purely lexical and deterministic — the ranking model is a
/// black box to the rest of the engine.
fn score(query_terms: &[String], record: &StoredRecord) -> f64 {
    if query_terms.is_empty() || record.token_total == 0 {
        return 0.0;
    }
    let mut hits = 0.0;
    for term in query_terms {
        if let Some(tf) = record.terms.get(term) {
            hits += 1.0 + (*tf as f64).ln();
        }
    }
    if hits == 0.0 {
        return 0.0;
    }
    hits / (query_terms.len() as f64 * (1.0 + (record.token_total as f64).ln()))
}

fn load_collection(name: &str, path: &Path) -> Result<Collection> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading collection file {}", path.display()))?;

    let mut records = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<CollectionEntry>(line) {
            Ok(CollectionEntry::Header { .. }) => {}
            Ok(CollectionEntry::Record {
                id,
                content,
                metadata,
            }) => records.push(StoredRecord::new(id, content, metadata)),
            // Skip malformed lines rather than refusing to open the store
            Err(e) => debug!("skipping malformed line in {name}.jsonl: {e}"),
        }
    }

    Ok(Collection {
        name: name.to_string(),
        path: path.to_path_buf(),
        records: RwLock::new(records),
    })
}
