//! Connection lifecycle: the state machine, the one-shot ready queue, the
//! collection cache, and the interval-driven reconnect loop.
//!
//! A [`Connection`] is created in `Start` and resolves its first connect
//! attempt in the background. Operations issued before resolution are parked
//! in the ready queue and drained exactly once, in FIFO order, all receiving
//! the same outcome. After a link drop the connection keeps passing
//! operations through (they race the dead link and fail naturally) while the
//! reconnect loop retries on a fixed interval until it succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::driver::{
    ConnectTarget, Document, Driver, DriverCollection, DriverCursor, DriverLink, FindOptions,
    UpdateOptions,
};
use crate::error::{BurrowError, Result};
use crate::model::ModelDefinition;

/// Exactly one state holds at any instant. `Error` is terminal for the
/// connection instance; the reconnect loop only ever runs out of
/// `ReadyDisconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    ReadyConnected,
    ReadyDisconnected,
    Error,
}

/// Lifecycle notifications, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Ready,
    Error(BurrowError),
    Disconnect,
    Reconnect,
}

/// Connection configuration. Interval and give-up policy are explicit rather
/// than baked in; the default is the conventional 2s interval with no
/// attempt limit (retry forever).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub database: String,
    pub host: String,
    pub port: u16,
    pub reconnect_interval: Duration,
    /// `None` retries forever. `Some(n)` gives up after `n` failed attempts,
    /// leaving the connection in `ReadyDisconnected`.
    pub reconnect_limit: Option<u32>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            database: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 27017,
            reconnect_interval: Duration::from_millis(2000),
            reconnect_limit: None,
        }
    }
}

impl ConnectConfig {
    fn target(&self) -> ConnectTarget {
        ConnectTarget {
            database: self.database.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

struct LinkState {
    state: ConnectionState,
    /// Populated only while in `Start`; drained exactly once.
    ready_queue: Vec<oneshot::Sender<Result<()>>>,
    link: Option<Arc<dyn DriverLink>>,
    /// Memoized collection handles, cleared wholesale on disconnect.
    collections: HashMap<String, Arc<dyn DriverCollection>>,
    /// Bumped whenever `link` is replaced; guards against stale close
    /// watchers and stale cache inserts racing a disconnect.
    generation: u64,
}

pub(crate) struct ConnectionInner {
    driver: Arc<dyn Driver>,
    config: ConnectConfig,
    link: Mutex<LinkState>,
    events: broadcast::Sender<ConnectionEvent>,
    pub(crate) models: Mutex<HashMap<String, Arc<ModelDefinition>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Handle to one connection instance. Cheap to clone; all clones share the
/// same state machine, cache, and model registry.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection and start the first connect attempt in the
    /// background. Returns immediately in `Start`; operations issued before
    /// the attempt resolves are queued. Must be called within a tokio
    /// runtime.
    pub fn open(driver: Arc<dyn Driver>, config: ConnectConfig) -> Connection {
        let (events, _) = broadcast::channel(32);
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                driver,
                config,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Start,
                    ready_queue: Vec::new(),
                    link: None,
                    collections: HashMap::new(),
                    generation: 0,
                }),
                events,
                models: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                closing: AtomicBool::new(false),
            }),
        };
        spawn_task(&conn.inner, initial_connect(Arc::clone(&conn.inner)));
        conn
    }

    /// Whether two handles refer to the same connection instance.
    pub fn same_instance(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().unwrap().state
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events. Only events emitted after subscription
    /// are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The readiness gate. In `Start` the caller parks in the ready queue
    /// and resumes with the shared outcome of the first connect attempt; in
    /// `Error` it fails immediately; once ready, connected or not, it
    /// proceeds, letting disconnected calls race the link.
    pub async fn when_ready(&self) -> Result<()> {
        let pending = {
            let mut st = self.inner.link.lock().unwrap();
            match st.state {
                ConnectionState::ReadyConnected | ConnectionState::ReadyDisconnected => {
                    return Ok(())
                }
                ConnectionState::Error => return Err(BurrowError::NotConnected),
                ConnectionState::Start => {
                    let (tx, rx) = oneshot::channel();
                    st.ready_queue.push(tx);
                    rx
                }
            }
        };
        match pending.await {
            Ok(outcome) => outcome,
            // The connection was closed before the first attempt resolved.
            Err(_) => Err(BurrowError::NotConnected),
        }
    }

    /// Resolve a collection handle, memoized until the next disconnect.
    pub async fn collection(&self, name: &str) -> Result<Arc<dyn DriverCollection>> {
        self.when_ready().await?;

        let (link, generation) = {
            let st = self.inner.link.lock().unwrap();
            if let Some(cached) = st.collections.get(name) {
                return Ok(Arc::clone(cached));
            }
            let link = st.link.clone().ok_or(BurrowError::NotConnected)?;
            (link, st.generation)
        };

        let handle: Arc<dyn DriverCollection> = Arc::from(link.collection(name).await?);

        let mut st = self.inner.link.lock().unwrap();
        // A disconnect may have cleared the cache while we were resolving;
        // never let a stale handle repopulate it.
        if st.generation == generation {
            st.collections.insert(name.to_string(), Arc::clone(&handle));
        }
        Ok(handle)
    }

    /// A bound per-collection handle.
    pub fn collection_ref(&self, name: impl Into<String>) -> CollectionRef {
        CollectionRef {
            conn: self.clone(),
            name: name.into(),
        }
    }

    // ── Raw operations ───────────────────────────────────────────────

    /// Materialize the full result set.
    pub async fn find(
        &self,
        collection: &str,
        query: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>> {
        let mut cursor = self.find_cursor(collection, query, options).await?;
        let mut results = Vec::new();
        while let Some(doc) = cursor.next().await? {
            results.push(doc);
        }
        Ok(results)
    }

    /// Stream results one document at a time. The channel closing is the end
    /// marker; a failure mid-stream arrives as a final `Err`.
    pub async fn find_each(
        &self,
        collection: &str,
        query: Document,
        options: FindOptions,
    ) -> Result<mpsc::Receiver<Result<Document>>> {
        let cursor = self.find_cursor(collection, query, options).await?;
        Ok(stream_cursor(cursor))
    }

    /// Raw cursor passthrough.
    pub async fn find_cursor(
        &self,
        collection: &str,
        query: Document,
        options: FindOptions,
    ) -> Result<Box<dyn DriverCursor>> {
        let col = self.collection(collection).await?;
        col.find(query, options).await
    }

    pub async fn find_one(&self, collection: &str, query: Document) -> Result<Option<Document>> {
        let col = self.collection(collection).await?;
        col.find_one(query).await
    }

    pub async fn insert(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<Document>> {
        let col = self.collection(collection).await?;
        col.insert(docs).await
    }

    pub async fn save(&self, collection: &str, doc: Document) -> Result<Document> {
        let col = self.collection(collection).await?;
        col.save(doc).await
    }

    pub async fn update(
        &self,
        collection: &str,
        criteria: Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> Result<u64> {
        let col = self.collection(collection).await?;
        col.update(criteria, replacement, options).await
    }

    pub async fn remove(&self, collection: &str, criteria: Document) -> Result<u64> {
        let col = self.collection(collection).await?;
        col.remove(criteria).await
    }

    /// Shut the connection down: cancel the reconnect loop and close
    /// watcher, fail any still-queued waiters, and drop the link.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut st = self.inner.link.lock().unwrap();
        drain_ready_queue(&mut st, Err(BurrowError::NotConnected));
        st.state = ConnectionState::Error;
        st.collections.clear();
        st.link = None;
        st.generation += 1;
    }
}

/// A connection handle bound to one collection name.
#[derive(Clone)]
pub struct CollectionRef {
    conn: Connection,
    name: String,
}

impl CollectionRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn find(&self, query: Document, options: FindOptions) -> Result<Vec<Document>> {
        self.conn.find(&self.name, query, options).await
    }

    pub async fn find_each(
        &self,
        query: Document,
        options: FindOptions,
    ) -> Result<mpsc::Receiver<Result<Document>>> {
        self.conn.find_each(&self.name, query, options).await
    }

    pub async fn find_cursor(
        &self,
        query: Document,
        options: FindOptions,
    ) -> Result<Box<dyn DriverCursor>> {
        self.conn.find_cursor(&self.name, query, options).await
    }

    pub async fn find_one(&self, query: Document) -> Result<Option<Document>> {
        self.conn.find_one(&self.name, query).await
    }

    pub async fn insert(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.conn.insert(&self.name, docs).await
    }

    pub async fn save(&self, doc: Document) -> Result<Document> {
        self.conn.save(&self.name, doc).await
    }

    pub async fn update(
        &self,
        criteria: Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> Result<u64> {
        self.conn.update(&self.name, criteria, replacement, options).await
    }

    pub async fn remove(&self, criteria: Document) -> Result<u64> {
        self.conn.remove(&self.name, criteria).await
    }
}

// ── Lifecycle tasks ──────────────────────────────────────────────────

fn spawn_task(
    inner: &Arc<ConnectionInner>,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let handle = tokio::spawn(task);
    let mut tasks = inner.tasks.lock().unwrap();
    // Every disconnect cycle spawns a watcher and a loop; drop the handles
    // of cycles already over so a flaky link cannot grow this unboundedly.
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

fn drain_ready_queue(st: &mut LinkState, outcome: Result<()>) {
    for waiter in st.ready_queue.drain(..) {
        let _ = waiter.send(outcome.clone());
    }
}

async fn initial_connect(inner: Arc<ConnectionInner>) {
    let target = inner.config.target();
    match inner.driver.connect(&target).await {
        Ok(link) => {
            let link: Arc<dyn DriverLink> = Arc::from(link);
            let generation = {
                let mut st = inner.link.lock().unwrap();
                st.state = ConnectionState::ReadyConnected;
                st.link = Some(Arc::clone(&link));
                st.generation += 1;
                drain_ready_queue(&mut st, Ok(()));
                st.generation
            };
            log::info!(
                "connected to {}:{}/{}",
                target.host,
                target.port,
                target.database
            );
            let _ = inner.events.send(ConnectionEvent::Ready);
            watch_link(inner, link, generation);
        }
        Err(err) => {
            {
                let mut st = inner.link.lock().unwrap();
                st.state = ConnectionState::Error;
                drain_ready_queue(&mut st, Err(err.clone()));
            }
            log::warn!("initial connect failed: {err}");
            // Every queued waiter already carries the cause; the event is
            // only for subscribers that exist.
            if inner.events.receiver_count() > 0 {
                let _ = inner.events.send(ConnectionEvent::Error(err));
            }
        }
    }
}

/// Watch one link for closure. On close: mark disconnected, drop the whole
/// collection cache, and start the reconnect loop.
fn watch_link(inner: Arc<ConnectionInner>, link: Arc<dyn DriverLink>, generation: u64) {
    let task_inner = Arc::clone(&inner);
    spawn_task(&inner, async move {
        link.wait_closed().await;
        if task_inner.closing.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut st = task_inner.link.lock().unwrap();
            // A newer link is already in place; this closure is history.
            if st.generation != generation {
                return;
            }
            st.state = ConnectionState::ReadyDisconnected;
            st.collections.clear();
            // Invalidate resolutions still in flight against the dead link,
            // so they cannot repopulate the cache they just missed clearing.
            st.generation += 1;
        }
        log::warn!("link closed, reconnecting every {:?}", task_inner.config.reconnect_interval);
        let _ = task_inner.events.send(ConnectionEvent::Disconnect);
        let loop_inner = Arc::clone(&task_inner);
        spawn_task(&task_inner, reconnect_loop(loop_inner));
    });
}

/// Fixed-interval, backoff-free retry. Ends only on the first success, on
/// the configured attempt limit, or on `close()`.
async fn reconnect_loop(inner: Arc<ConnectionInner>) {
    let target = inner.config.target();
    let mut interval = tokio::time::interval(inner.config.reconnect_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // every attempt waits a full interval.
    interval.tick().await;

    let mut attempts: u32 = 0;
    loop {
        interval.tick().await;
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Some(limit) = inner.config.reconnect_limit {
            if attempts >= limit {
                log::warn!("giving up reconnection after {attempts} attempts");
                return;
            }
        }
        attempts += 1;
        match inner.driver.connect(&target).await {
            Ok(link) => {
                let link: Arc<dyn DriverLink> = Arc::from(link);
                let generation = {
                    let mut st = inner.link.lock().unwrap();
                    st.state = ConnectionState::ReadyConnected;
                    st.link = Some(Arc::clone(&link));
                    st.generation += 1;
                    st.generation
                };
                log::info!("reconnected after {attempts} attempt(s)");
                let _ = inner.events.send(ConnectionEvent::Reconnect);
                watch_link(Arc::clone(&inner), link, generation);
                return;
            }
            Err(err) => {
                log::debug!("reconnect attempt {attempts} failed: {err}");
            }
        }
    }
}

/// Forward a cursor into a bounded channel, one document per message.
pub(crate) fn stream_cursor(mut cursor: Box<dyn DriverCursor>) -> mpsc::Receiver<Result<Document>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            match cursor.next().await {
                Ok(Some(doc)) => {
                    if tx.send(Ok(doc)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });
    rx
}

// ── Process-wide default connection ──────────────────────────────────

static SHARED: Lazy<Mutex<Option<Connection>>> = Lazy::new(|| Mutex::new(None));

/// Open a connection and install it as the process-wide default if no
/// default exists yet.
pub fn connect(driver: Arc<dyn Driver>, config: ConnectConfig) -> Connection {
    let conn = Connection::open(driver, config);
    let mut shared = SHARED.lock().unwrap();
    if shared.is_none() {
        *shared = Some(conn.clone());
    }
    conn
}

/// The process-wide default connection, if one has been installed.
pub fn shared() -> Option<Connection> {
    SHARED.lock().unwrap().clone()
}

/// Replace the process-wide default connection, returning the previous one.
pub fn set_shared(conn: Connection) -> Option<Connection> {
    SHARED.lock().unwrap().replace(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;

    async fn wait_for_reconnect(rx: &mut broadcast::Receiver<ConnectionEvent>) {
        loop {
            if let ConnectionEvent::Reconnect = rx.recv().await.unwrap() {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_lifecycle_tasks_are_pruned() {
        let driver = MemoryDriver::new();
        let conn = Connection::open(Arc::new(driver.clone()), ConnectConfig::default());
        let mut events = conn.subscribe();
        loop {
            if let ConnectionEvent::Ready = events.recv().await.unwrap() {
                break;
            }
        }

        for _ in 0..4 {
            driver.sever();
            wait_for_reconnect(&mut events).await;
        }

        // Each cycle spawns a watcher and a reconnect loop; only the live
        // watcher and at most the cycle that just finished may remain.
        let live = conn.inner.tasks.lock().unwrap().len();
        assert!(live <= 3, "stale task handles retained: {live}");
    }
}
