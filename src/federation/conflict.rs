//! Anchor conflict resolution.
//!
//! When competing anchors reference the same record id with different
//! content, the winner is chosen by a total order: anchor class first
//! (BTC > EVM > TSA > unknown), then earliest anchor timestamp (parsed
//! permissively; missing or invalid timestamps sort last), then lowest
//! lowercased anchor reference. Losers are retained and marked superseded.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attestation classes in priority order; strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnchorClass {
    Btc = 0,
    Evm = 1,
    Tsa = 2,
    Unknown = 3,
}

impl AnchorClass {
    pub fn parse(chain: &str) -> Self {
        match chain.to_ascii_uppercase().as_str() {
            "BTC" => Self::Btc,
            "EVM" => Self::Evm,
            "TSA" => Self::Tsa,
            _ => Self::Unknown,
        }
    }
}

/// One external attestation pinning a record's content to a trust domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub record_id: String,
    pub chain: String,
    #[serde(default)]
    pub anchor_ts: Option<String>,
    pub tx_ref: String,
    #[serde(default)]
    pub superseded: bool,
}

impl Anchor {
    fn class(&self) -> AnchorClass {
        AnchorClass::parse(&self.chain)
    }

    /// Permissive timestamp parse; `None` sorts last.
    fn parsed_ts(&self) -> Option<DateTime<Utc>> {
        let raw = self.anchor_ts.as_deref()?;
        parse_permissive(raw)
    }

    fn sort_key(&self) -> (AnchorClass, (u8, i64), String) {
        let ts_key = match self.parsed_ts() {
            Some(dt) => (0u8, dt.timestamp_millis()),
            None => (1u8, i64::MAX),
        };
        (self.class(), ts_key, self.tx_ref.to_lowercase())
    }
}

fn parse_permissive(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Trailing Z without offset support, or naive timestamps: assume UTC.
    let trimmed = raw.trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
        if fmt == "%Y-%m-%d" {
            if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, fmt) {
                return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
            }
        }
    }
    None
}

/// Pick the winner among competing anchors. Total and stable: the result is
/// independent of input order. Returns the winner and the losers marked
/// superseded.
pub fn resolve_conflict(anchors: Vec<Anchor>) -> Option<(Anchor, Vec<Anchor>)> {
    if anchors.is_empty() {
        return None;
    }
    let mut sorted = anchors;
    sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let mut iter = sorted.into_iter();
    let winner = iter.next().expect("non-empty");
    let losers = iter
        .map(|mut a| {
            a.superseded = true;
            a
        })
        .collect();
    Some((winner, losers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(chain: &str, ts: &str, tx: &str) -> Anchor {
        Anchor {
            record_id: "mem-1".to_string(),
            chain: chain.to_string(),
            anchor_ts: if ts.is_empty() {
                None
            } else {
                Some(ts.to_string())
            },
            tx_ref: tx.to_string(),
            superseded: false,
        }
    }

    #[test]
    fn test_btc_wins_regardless_of_order() {
        let base = vec![
            anchor("EVM", "2025-10-24T12:00:02Z", "0x2"),
            anchor("BTC", "2025-10-24T12:00:03Z", "0x1"),
            anchor("TSA", "2025-10-24T12:00:01Z", "0x3"),
        ];
        // Every rotation produces the same winner
        for rotation in 0..base.len() {
            let mut shuffled = base.clone();
            shuffled.rotate_left(rotation);
            let (winner, losers) = resolve_conflict(shuffled).unwrap();
            assert_eq!(winner.chain, "BTC");
            assert_eq!(losers.len(), 2);
            assert!(losers.iter().all(|l| l.superseded));
        }
    }

    #[test]
    fn test_same_class_earliest_timestamp_wins() {
        let anchors = vec![
            anchor("EVM", "2025-10-24T12:00:05Z", "0x9"),
            anchor("EVM", "2025-10-24T12:00:01Z", "0x8"),
        ];
        let (winner, _) = resolve_conflict(anchors).unwrap();
        assert_eq!(winner.tx_ref, "0x8");
    }

    #[test]
    fn test_missing_or_invalid_timestamp_sorts_last() {
        let anchors = vec![
            anchor("EVM", "", "0x1"),
            anchor("EVM", "not-a-date", "0x2"),
            anchor("EVM", "2025-10-24T12:00:00Z", "0x3"),
        ];
        let (winner, _) = resolve_conflict(anchors).unwrap();
        assert_eq!(winner.tx_ref, "0x3");
    }

    #[test]
    fn test_tie_breaks_on_lowercased_tx_ref() {
        let anchors = vec![
            anchor("EVM", "2025-10-24T12:00:00Z", "0xB"),
            anchor("EVM", "2025-10-24T12:00:00Z", "0xa"),
        ];
        let (winner, _) = resolve_conflict(anchors).unwrap();
        assert_eq!(winner.tx_ref, "0xa");
    }

    #[test]
    fn test_naive_timestamp_parses_as_utc() {
        let anchors = vec![
            anchor("EVM", "2025-10-24T12:00:00", "0x1"),
            anchor("EVM", "2025-10-24T12:00:00Z", "0x0"),
        ];
        // Equal instants; tx_ref decides
        let (winner, _) = resolve_conflict(anchors).unwrap();
        assert_eq!(winner.tx_ref, "0x0");
    }

    #[test]
    fn test_unknown_chain_ranks_below_tsa() {
        let anchors = vec![
            anchor("SOLANA", "2025-10-24T12:00:00Z", "0x1"),
            anchor("TSA", "2025-10-24T12:00:00Z", "0x2"),
        ];
        let (winner, _) = resolve_conflict(anchors).unwrap();
        assert_eq!(winner.chain, "TSA");
    }

    #[test]
    fn test_empty_input_is_none() {
        assert!(resolve_conflict(Vec::new()).is_none());
    }
}
