//! In-process driver backed by a shared in-memory document store.
//!
//! The store outlives individual links, so data written before a link drop
//! is still visible after a reconnect. Connect failures, connect latency,
//! and forced link loss can all be scripted, which is what the connection
//! lifecycle tests are built on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::driver::{
    ConnectTarget, Document, Driver, DriverCollection, DriverCursor, DriverLink, FindOptions,
    UpdateOptions,
};
use crate::error::{BurrowError, Result};

#[derive(Default)]
struct MemoryState {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    fail_connects: Mutex<u32>,
    connect_delay: Mutex<Option<Duration>>,
    connect_attempts: AtomicU32,
    collection_resolutions: AtomicU32,
    active_close: Mutex<Option<watch::Sender<bool>>>,
}

/// A [`Driver`] over an in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        *self.state.fail_connects.lock().unwrap() = n;
    }

    /// Delay every connect attempt by `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Forcibly close the most recently established link.
    pub fn sever(&self) {
        if let Some(tx) = self.state.active_close.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Total connect attempts made, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// How many times a link resolved a collection handle.
    pub fn collection_resolutions(&self) -> u32 {
        self.state.collection_resolutions.load(Ordering::SeqCst)
    }

    /// Snapshot of a collection's documents, for assertions.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, _target: &ConnectTarget) -> Result<Box<dyn DriverLink>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut remaining = self.state.fail_connects.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BurrowError::Connect("scripted connect failure".into()));
            }
        }

        let (close_tx, close_rx) = watch::channel(false);
        *self.state.active_close.lock().unwrap() = Some(close_tx);

        Ok(Box::new(MemoryLink {
            state: Arc::clone(&self.state),
            closed: close_rx,
        }))
    }
}

struct MemoryLink {
    state: Arc<MemoryState>,
    closed: watch::Receiver<bool>,
}

impl MemoryLink {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl DriverLink for MemoryLink {
    async fn collection(&self, name: &str) -> Result<Box<dyn DriverCollection>> {
        if self.is_closed() {
            return Err(BurrowError::Driver("link is closed".into()));
        }
        self.state
            .collection_resolutions
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCollection {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            closed: self.closed.clone(),
        }))
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        loop {
            if *closed.borrow() {
                return;
            }
            // Sender dropped counts as closed too.
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

struct MemoryCollection {
    name: String,
    state: Arc<MemoryState>,
    closed: watch::Receiver<bool>,
}

impl MemoryCollection {
    fn guard(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(BurrowError::Driver("link is closed".into()));
        }
        Ok(())
    }

    fn with_docs<T>(&self, f: impl FnOnce(&mut Vec<Document>) -> T) -> T {
        let mut collections = self.state.collections.lock().unwrap();
        let docs = collections.entry(self.name.clone()).or_default();
        f(docs)
    }
}

#[async_trait]
impl DriverCollection for MemoryCollection {
    async fn find(&self, query: Document, options: FindOptions) -> Result<Box<dyn DriverCursor>> {
        self.guard()?;
        let mut matched: Vec<Document> =
            self.with_docs(|docs| docs.iter().filter(|d| matches(d, &query)).cloned().collect());
        if let Some(limit) = options.limit {
            matched.truncate(limit as usize);
        }
        Ok(Box::new(MemoryCursor { remaining: matched }))
    }

    async fn find_one(&self, query: Document) -> Result<Option<Document>> {
        self.guard()?;
        Ok(self.with_docs(|docs| docs.iter().find(|d| matches(d, &query)).cloned()))
    }

    async fn insert(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.guard()?;
        let mut stored = Vec::with_capacity(docs.len());
        for mut doc in docs {
            ensure_id(&mut doc)?;
            self.with_docs(|all| all.push(doc.clone()));
            stored.push(doc);
        }
        Ok(stored)
    }

    async fn save(&self, mut doc: Document) -> Result<Document> {
        self.guard()?;
        ensure_id(&mut doc)?;
        let id = doc.get("_id").cloned();
        self.with_docs(|all| {
            match all.iter_mut().find(|d| d.get("_id") == id.as_ref()) {
                Some(existing) => *existing = doc.clone(),
                None => all.push(doc.clone()),
            }
        });
        Ok(doc)
    }

    async fn update(
        &self,
        criteria: Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> Result<u64> {
        self.guard()?;
        let count = self.with_docs(|all| {
            let mut count = 0u64;
            for doc in all.iter_mut() {
                if !matches(doc, &criteria) {
                    continue;
                }
                let id = doc.get("_id").cloned();
                let mut next = replacement.clone();
                // A replacement never changes the document's identity.
                if let (Some(id), Some(mapping)) = (id, next.as_mapping_mut()) {
                    mapping.insert(Document::String("_id".into()), id);
                }
                *doc = next;
                count += 1;
                if !options.multi {
                    break;
                }
            }
            count
        });

        if count == 0 && options.upsert {
            let mut doc = replacement;
            ensure_id(&mut doc)?;
            self.with_docs(|all| all.push(doc));
        }
        Ok(count)
    }

    async fn remove(&self, criteria: Document) -> Result<u64> {
        self.guard()?;
        Ok(self.with_docs(|all| {
            let before = all.len();
            all.retain(|d| !matches(d, &criteria));
            (before - all.len()) as u64
        }))
    }
}

struct MemoryCursor {
    remaining: Vec<Document>,
}

#[async_trait]
impl DriverCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        if self.remaining.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.remaining.remove(0)))
        }
    }
}

/// Equality match: every query field must equal the document's field.
/// A null or empty query matches everything.
fn matches(doc: &Document, query: &Document) -> bool {
    match query {
        Document::Null => true,
        Document::Mapping(fields) => fields
            .iter()
            .all(|(key, value)| doc.get(key.as_str().unwrap_or_default()) == Some(value)),
        _ => false,
    }
}

fn ensure_id(doc: &mut Document) -> Result<()> {
    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| BurrowError::Driver("document must be a mapping".into()))?;
    let key = Document::String("_id".into());
    let missing = match mapping.get(&key) {
        None | Some(Document::Null) => true,
        Some(_) => false,
    };
    if missing {
        mapping.insert(key, Document::String(uuid::Uuid::new_v4().to_string()));
    }
    Ok(())
}
