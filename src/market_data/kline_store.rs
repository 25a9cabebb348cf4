use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::Kline;

// ---------------------------------------------------------------------------
// KlineStore -- append-only candle history per symbol
// ---------------------------------------------------------------------------

type Shard = Arc<Mutex<Vec<Kline>>>;

/// Thread-safe in-memory candle history keyed by symbol.
///
/// The outer `RwLock` only guards shard existence; appends take the shard's
/// own mutex, so writers for different symbols never wait on each other.
/// Nothing is deduplicated or evicted here -- the database owns uniqueness.
pub struct KlineStore {
    shards: RwLock<HashMap<String, Shard>>,
}

impl KlineStore {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Append `kline` to the history of `symbol`, creating the shard on first
    /// use.
    pub fn add(&self, symbol: &str, kline: Kline) {
        let shard = self.shard(symbol);
        shard.lock().push(kline);
    }

    fn shard(&self, symbol: &str) -> Shard {
        if let Some(shard) = self.shards.read().get(symbol) {
            return shard.clone();
        }

        // Another writer may have created it between the two locks.
        let mut map = self.shards.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Copy of the history for `symbol` (empty if unseen).
    pub fn get_by_symbol(&self, symbol: &str) -> Vec<Kline> {
        let shard = self.shards.read().get(symbol).cloned();
        match shard {
            Some(shard) => shard.lock().clone(),
            None => Vec::new(),
        }
    }

    /// Copy of every symbol's history.
    pub fn get_all(&self) -> HashMap<String, Vec<Kline>> {
        let map = self.shards.read();
        map.iter()
            .map(|(symbol, shard)| (symbol.clone(), shard.lock().clone()))
            .collect()
    }

    /// Total number of candles across all symbols.
    pub fn count_all(&self) -> usize {
        let map = self.shards.read();
        map.values().map(|shard| shard.lock().len()).sum()
    }

    /// Number of symbols with at least one stored candle.
    pub fn symbol_count(&self) -> usize {
        self.shards.read().len()
    }
}

impl Default for KlineStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
