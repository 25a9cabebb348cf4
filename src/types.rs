// =============================================================================
// Shared types used across the kline collector
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A single candlestick as delivered by the Bybit kline stream.
///
/// Prices and volumes stay as the decimal text Bybit sends so nothing is
/// rounded before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    /// Interval start (epoch ms).
    pub start: i64,
    /// Interval end (epoch ms, inclusive).
    pub end: i64,
    /// Interval label in API form, e.g. "1", "60", "D".
    pub interval: String,
    pub open: String,
    pub close: String,
    pub high: String,
    pub low: String,
    pub volume: String,
    pub turnover: String,
    /// True once the interval has closed.
    pub confirm: bool,
    /// Event generation time (epoch ms).
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Kline intervals
// ---------------------------------------------------------------------------

/// A supported kline interval with both of its textual forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlineInterval {
    api: &'static str,
    db: &'static str,
    minutes: u32,
}

const VALID_INTERVALS: &[KlineInterval] = &[
    KlineInterval { api: "1", db: "1m", minutes: 1 },
    KlineInterval { api: "3", db: "3m", minutes: 3 },
    KlineInterval { api: "5", db: "5m", minutes: 5 },
    KlineInterval { api: "15", db: "15m", minutes: 15 },
    KlineInterval { api: "30", db: "30m", minutes: 30 },
    KlineInterval { api: "60", db: "1h", minutes: 60 },
    KlineInterval { api: "120", db: "2h", minutes: 120 },
    KlineInterval { api: "240", db: "4h", minutes: 240 },
    KlineInterval { api: "360", db: "6h", minutes: 360 },
    KlineInterval { api: "720", db: "12h", minutes: 720 },
    KlineInterval { api: "D", db: "1d", minutes: 1_440 },
    KlineInterval { api: "W", db: "1w", minutes: 10_080 },
    // Months are treated as 30 days.
    KlineInterval { api: "M", db: "1M", minutes: 43_200 },
];

impl KlineInterval {
    /// Parse the API form of an interval ("1", "15", "D", ...).
    pub fn parse(value: &str) -> Result<Self> {
        match VALID_INTERVALS.iter().find(|iv| iv.api == value) {
            Some(iv) => Ok(*iv),
            None => bail!("invalid kline interval: {value}"),
        }
    }

    /// Look up an interval by its storage form ("1m", "1h", ...).
    #[cfg(test)]
    pub fn from_db_value(value: &str) -> Result<Self> {
        match VALID_INTERVALS.iter().find(|iv| iv.db == value) {
            Some(iv) => Ok(*iv),
            None => bail!("invalid stored kline interval: {value}"),
        }
    }

    pub fn api_value(&self) -> &'static str {
        self.api
    }

    pub fn db_value(&self) -> &'static str {
        self.db
    }

    #[cfg(test)]
    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn duration_ms(&self) -> i64 {
        i64::from(self.minutes) * 60_000
    }
}

impl std::fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_intervals() {
        let hourly = KlineInterval::parse("60").unwrap();
        assert_eq!(hourly.db_value(), "1h");
        assert_eq!(hourly.duration_ms(), 3_600_000);

        let daily = KlineInterval::parse("D").unwrap();
        assert_eq!(daily.db_value(), "1d");
        assert_eq!(daily.minutes(), 1_440);
    }

    #[test]
    fn parse_rejects_unknown_interval() {
        assert!(KlineInterval::parse("1m").is_err());
        assert!(KlineInterval::parse("").is_err());
        assert!(KlineInterval::parse("2").is_err());
    }

    #[test]
    fn db_value_maps_back_to_api_value() {
        for iv in VALID_INTERVALS {
            let back = KlineInterval::from_db_value(iv.db_value()).unwrap();
            assert_eq!(back.api_value(), iv.api_value());
        }
    }

    #[test]
    fn kline_deserialises_from_stream_shape() {
        let json = r#"{
            "start": 1672324800000,
            "end": 1672324859999,
            "interval": "1",
            "open": "16649.5",
            "close": "16677",
            "high": "16677",
            "low": "16608",
            "volume": "2.081",
            "turnover": "34666.4005",
            "confirm": false,
            "timestamp": 1672324805767
        }"#;
        let kline: Kline = serde_json::from_str(json).unwrap();
        assert_eq!(kline.start, 1_672_324_800_000);
        assert_eq!(kline.close, "16677");
        assert!(!kline.confirm);
    }
}
