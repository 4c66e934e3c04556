use crate::cache::segment_map::{SegmentMap, hash_string};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

/// Last heartbeat seen for one monitored entity.
///
/// On the wire a record is the string `server:last_time_sec:count`. Parsing
/// starts from the right so a `server` holding an IPv6 address survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub server: String,
    pub last_time_sec: i64,
    pub count: i64,
}

impl HeartbeatRecord {
    pub fn new(server: impl Into<String>, last_time_sec: i64) -> Self {
        Self {
            server: server.into(),
            last_time_sec,
            count: 1,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl Display for HeartbeatRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.server, self.last_time_sec, self.count)
    }
}

impl FromStr for HeartbeatRecord {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.rsplitn(3, ':');

        let (Some(count), Some(last_time_sec), Some(server)) =
            (parts.next(), parts.next(), parts.next())
        else {
            bail!("malformed heartbeat record '{value}'");
        };

        Ok(Self {
            server: server.to_string(),
            last_time_sec: last_time_sec
                .parse()
                .with_context(|| format!("invalid heartbeat time in '{value}'"))?,
            count: count
                .parse()
                .with_context(|| format!("invalid heartbeat count in '{value}'"))?,
        })
    }
}

/// In-process heartbeat store backing the local peer.
///
/// Records live in a [`SegmentMap`], so writes to one key are serialized on
/// its shard lock and the newest write wins.
pub struct RecordStore {
    records: SegmentMap<String, HeartbeatRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            records: SegmentMap::with_default_shards(hash_string),
        }
    }

    pub fn with_shards(shard_count: usize) -> Self {
        Self {
            records: SegmentMap::new(shard_count, hash_string),
        }
    }

    /// Returns the records present for `keys`. Missing keys are omitted.
    pub fn get(&self, keys: &[String]) -> HashMap<String, HeartbeatRecord> {
        keys.iter()
            .filter_map(|key| self.records.load(key).map(|record| (key.clone(), record)))
            .collect()
    }

    pub fn get_one(&self, key: &str) -> Option<HeartbeatRecord> {
        self.records.load(&key.to_string())
    }

    /// Writes every record. Server and time are replaced, the beat count
    /// accumulates across writes of the same key.
    pub fn put(&self, records: impl IntoIterator<Item = (String, HeartbeatRecord)>) -> usize {
        let mut written = 0;

        for (key, record) in records {
            self.records.upsert(key, |previous| HeartbeatRecord {
                count: previous.map_or(0, |p| p.count) + record.count,
                ..record
            });
            written += 1;
        }

        written
    }

    /// Adds records taken over from another node. A key keeps whichever
    /// record saw the later heartbeat.
    pub fn merge(&self, records: impl IntoIterator<Item = (String, HeartbeatRecord)>) -> usize {
        let mut merged = 0;

        for (key, record) in records {
            self.records.upsert(key, |previous| match previous {
                Some(previous) if previous.last_time_sec >= record.last_time_sec => {
                    previous.clone()
                }
                _ => record,
            });
            merged += 1;
        }

        merged
    }

    pub fn del(&self, keys: &[String]) -> usize {
        keys.iter()
            .filter(|key| self.records.delete(key).is_some())
            .count()
    }

    pub fn snapshot(&self) -> Vec<(String, HeartbeatRecord)> {
        let mut entries = Vec::with_capacity(self.records.len());
        self.records
            .range(|key, record| entries.push((key.clone(), record.clone())));

        entries
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_parses_ipv6_server() -> Result<()> {
        let record = HeartbeatRecord {
            server: "fd12:cd60:9071::2c5f".to_string(),
            last_time_sec: 1_700_000_000,
            count: 3,
        };

        let encoded = record.encode();
        assert_eq!(encoded, "fd12:cd60:9071::2c5f:1700000000:3");
        assert_eq!(encoded.parse::<HeartbeatRecord>()?, record);

        Ok(())
    }

    #[test]
    fn test_malformed_records_are_rejected() {
        assert!("".parse::<HeartbeatRecord>().is_err());
        assert!("10.0.0.1:12".parse::<HeartbeatRecord>().is_err());
        assert!("10.0.0.1:soon:1".parse::<HeartbeatRecord>().is_err());
        assert!("10.0.0.1:12:many".parse::<HeartbeatRecord>().is_err());
    }

    #[test]
    fn test_put_accumulates_count_and_keeps_latest_time() {
        let store = RecordStore::with_shards(4);

        store.put([("svc-1".to_string(), HeartbeatRecord::new("10.0.0.1", 100))]);
        store.put([("svc-1".to_string(), HeartbeatRecord::new("10.0.0.2", 105))]);

        let record = store.get_one("svc-1");
        assert_eq!(
            record,
            Some(HeartbeatRecord {
                server: "10.0.0.2".to_string(),
                last_time_sec: 105,
                count: 2,
            })
        );
    }

    #[test]
    fn test_merge_keeps_newest_heartbeat() {
        let store = RecordStore::with_shards(4);
        store.put([("svc-1".to_string(), HeartbeatRecord::new("10.0.0.1", 200))]);

        let merged = store.merge([
            ("svc-1".to_string(), HeartbeatRecord::new("10.0.0.9", 150)),
            ("svc-2".to_string(), HeartbeatRecord::new("10.0.0.9", 150)),
        ]);

        assert_eq!(merged, 2);
        assert_eq!(store.get_one("svc-1").map(|r| r.last_time_sec), Some(200));
        assert_eq!(store.get_one("svc-2").map(|r| r.server), Some("10.0.0.9".to_string()));
    }

    #[test]
    fn test_get_omits_missing_and_del_counts_removed() {
        let store = RecordStore::with_shards(4);
        store.put([
            ("a".to_string(), HeartbeatRecord::new("h", 1)),
            ("b".to_string(), HeartbeatRecord::new("h", 2)),
        ]);

        let found = store.get(&["a".to_string(), "missing".to_string()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"].last_time_sec, 1);

        assert_eq!(store.del(&["a".to_string(), "missing".to_string()]), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot().len(), 1);

        store.clear();
        assert!(store.is_empty());
    }
}
