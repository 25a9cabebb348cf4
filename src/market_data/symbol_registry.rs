// =============================================================================
// Symbol Registry — tracked universe + cached subscription topics
// =============================================================================
//
// One mutex serialises every mutation and every topic-cache read, so universe
// updates and cache rebuilds are linearised per registry.  Snapshots are
// copied out under the lock and handed to the caller.
//
// Change detection uses a 64-bit FxHash over the sorted, comma-joined symbol
// list.  Two different universes colliding would make a refresh look like a
// no-op; that risk is accepted against a once-a-day change cadence.
// =============================================================================

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHasher;
use tokio::sync::watch;
use tracing::{debug, info};

/// Every kline topic starts with this prefix.
pub const KLINE_TOPIC_PREFIX: &str = "kline.";

/// Build the subscription topic for one symbol: `kline.<interval>.<symbol>`.
pub fn kline_topic(interval: &str, symbol: &str) -> String {
    format!("{KLINE_TOPIC_PREFIX}{interval}.{symbol}")
}

/// Order-independent content hash of a symbol set.
pub fn universe_hash<'a, I>(symbols: I) -> u64
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<&str> = symbols.into_iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = FxHasher::default();
    hasher.write(sorted.join(",").as_bytes());
    hasher.finish()
}

/// Result of replacing the universe with [`SymbolRegistry::sync_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Same content hash as the current universe; nothing was touched.
    Unchanged,
    /// The universe was replaced and the topic list rebuilt.
    Changed {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

struct RegistryInner {
    symbols: HashSet<String>,
    /// Hash of `symbols`, kept current on every mutation.
    hash: u64,
    topics: Arc<Vec<String>>,
    /// Hash the cached topic list was built from; `None` until first build.
    topics_hash: Option<u64>,
    topics_interval: String,
    rebuilds: u64,
}

impl RegistryInner {
    fn rebuild_topics(&mut self, interval: &str) -> Arc<Vec<String>> {
        let mut sorted: Vec<&String> = self.symbols.iter().collect();
        sorted.sort_unstable();

        let topics: Vec<String> = sorted.iter().map(|s| kline_topic(interval, s)).collect();

        self.topics = Arc::new(topics);
        self.topics_hash = Some(self.hash);
        self.topics_interval = interval.to_string();
        self.rebuilds += 1;

        debug!(
            count = self.topics.len(),
            interval = %interval,
            "subscription topics rebuilt"
        );
        self.topics.clone()
    }

    fn cache_valid_for(&self, interval: &str) -> bool {
        self.topics_hash == Some(self.hash) && self.topics_interval == interval
    }
}

/// Concurrent set of tracked symbols with a cached, sorted topic list.
pub struct SymbolRegistry {
    inner: Mutex<RegistryInner>,
    interval: String,
    /// Bumped whenever the universe content changes.
    generation: watch::Sender<u64>,
}

impl SymbolRegistry {
    /// Create an empty registry streaming klines of `interval` (API form).
    pub fn new(interval: impl Into<String>) -> Self {
        let symbols = HashSet::new();
        let hash = universe_hash(&symbols);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Mutex::new(RegistryInner {
                symbols,
                hash,
                topics: Arc::new(Vec::new()),
                topics_hash: None,
                topics_interval: String::new(),
                rebuilds: 0,
            }),
            interval: interval.into(),
            generation,
        }
    }

    /// The configured stream interval.
    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn add(&self, symbol: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        let inserted = inner.symbols.insert(symbol.into());
        if inserted {
            inner.hash = universe_hash(&inner.symbols);
            drop(inner);
            self.bump_generation();
        }
        inserted
    }

    pub fn remove(&self, symbol: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.symbols.remove(symbol);
        if removed {
            inner.hash = universe_hash(&inner.symbols);
            drop(inner);
            self.bump_generation();
        }
        removed
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.inner.lock().symbols.contains(symbol)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().symbols.len()
    }

    /// Snapshot copy of the current universe.
    pub fn all(&self) -> HashSet<String> {
        self.inner.lock().symbols.clone()
    }

    /// Snapshot of the universe in lexicographic order.
    pub fn sorted(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.all().into_iter().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Current content hash.
    pub fn hash(&self) -> u64 {
        self.inner.lock().hash
    }

    /// Topic list for `interval`, rebuilt only if the universe hash moved
    /// since the cache was built.
    pub fn topics(&self, interval: &str) -> Arc<Vec<String>> {
        let mut inner = self.inner.lock();
        if inner.cache_valid_for(interval) {
            return inner.topics.clone();
        }
        inner.rebuild_topics(interval)
    }

    /// Unconditionally rebuild the topic list.
    pub fn refresh_topics(&self, interval: &str) -> Arc<Vec<String>> {
        self.inner.lock().rebuild_topics(interval)
    }

    /// Number of topic-list rebuilds since creation.
    pub fn topic_rebuilds(&self) -> u64 {
        self.inner.lock().rebuilds
    }

    /// Replace the whole universe.
    ///
    /// A set with the same content hash is a no-op: no rebuild and no
    /// generation bump, so a live subscription is left alone.
    pub fn sync_from<I>(&self, symbols: I) -> SyncOutcome
    where
        I: IntoIterator<Item = String>,
    {
        let incoming: HashSet<String> = symbols.into_iter().collect();
        let incoming_hash = universe_hash(&incoming);

        let mut inner = self.inner.lock();
        if incoming_hash == inner.hash {
            debug!(count = incoming.len(), "symbol universe unchanged");
            return SyncOutcome::Unchanged;
        }

        let mut removed: Vec<String> = inner.symbols.difference(&incoming).cloned().collect();
        let mut added: Vec<String> = incoming.difference(&inner.symbols).cloned().collect();
        removed.sort_unstable();
        added.sort_unstable();

        inner.symbols = incoming;
        inner.hash = incoming_hash;
        let topics = inner.rebuild_topics(&self.interval);
        drop(inner);

        info!(
            added = added.len(),
            removed = removed.len(),
            topics = topics.len(),
            "symbol universe updated"
        );
        if !added.is_empty() {
            debug!(symbols = ?added, "symbols added");
        }
        if !removed.is_empty() {
            debug!(symbols = ?removed, "symbols removed");
        }

        self.bump_generation();
        SyncOutcome::Changed { added, removed }
    }

    /// Receiver that wakes whenever the universe changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn bump_generation(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
