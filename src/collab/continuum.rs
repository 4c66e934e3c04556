use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Digest iterations a bucket gets when all buckets weigh the same.
const POINTS_PER_BUCKET: u64 = 40;
/// Every MD5 digest is split into this many 32-bit points.
const POINTS_PER_DIGEST: usize = 4;

/// A weighted member of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket {
    pub host: String,
    pub weight: u32,
}

impl Bucket {
    pub fn new(host: impl Into<String>, weight: u32) -> Self {
        Self {
            host: host.into(),
            weight,
        }
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.host, self.weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Point {
    value: u32,
    host: usize,
}

/// Consistent hashing ring (ketama style).
///
/// Each bucket contributes `floor(weight / total_weight * 40 * n)` MD5 digests
/// of `"{host}-{i}"`, and every digest yields four points. Points are sorted
/// by `(value, host)`, so the same bucket set always produces the same ring
/// no matter the order buckets were supplied in.
///
/// A continuum is immutable. Membership changes build a new one which the
/// owner swaps in, readers keep using the old one until they drop it.
#[derive(Debug, Clone)]
pub struct Continuum {
    hosts: Vec<String>,
    points: Vec<Point>,
}

impl Continuum {
    /// Builds the ring. Fails when no bucket has a positive weight.
    ///
    /// Duplicate hosts are collapsed, the last weight wins.
    pub fn new<'a>(buckets: impl IntoIterator<Item = &'a Bucket>) -> Result<Self> {
        let weights: BTreeMap<&str, u32> = buckets
            .into_iter()
            .map(|bucket| (bucket.host.as_str(), bucket.weight))
            .collect();
        let weights: Vec<(&str, u32)> = weights
            .into_iter()
            .filter(|(_, weight)| *weight > 0)
            .collect();

        if weights.is_empty() {
            bail!("cannot build a continuum without weighted buckets");
        }

        let total_weight: u64 = weights.iter().map(|(_, weight)| *weight as u64).sum();
        let bucket_count = weights.len() as u64;

        let mut hosts = Vec::with_capacity(weights.len());
        let mut points = Vec::new();

        for (index, (host, weight)) in weights.into_iter().enumerate() {
            // floor(weight / total * 40 * n) in integer math, so equal weights
            // always get exactly 40 digests. Every weighted bucket gets at least
            // one, otherwise a tiny weight would drop the host from the ring.
            let iterations =
                ((weight as u64 * POINTS_PER_BUCKET * bucket_count) / total_weight).max(1);

            for i in 0..iterations {
                let digest = md5::compute(format!("{host}-{i}"));
                for chunk in digest.0.chunks_exact(4).take(POINTS_PER_DIGEST) {
                    let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push(Point { value, host: index });
                }
            }

            hosts.push(host.to_string());
        }

        points.sort_unstable();

        Ok(Self { hosts, points })
    }

    /// Returns the host owning `hash`: the first point `>= hash`, wrapping
    /// around to the start of the ring.
    pub fn locate(&self, hash: u32) -> &str {
        let index = self.points.partition_point(|point| point.value < hash);
        // `new` guarantees at least one point
        let point = self.points.get(index).unwrap_or(&self.points[0]);

        &self.hosts[point.host]
    }

    /// Owner of an arbitrary key, hashed with [`hash_key`].
    pub fn locate_key(&self, key: &str) -> &str {
        self.locate(hash_key(key))
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// Hash used to place monitored entities and heartbeat keys on the ring.
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}
