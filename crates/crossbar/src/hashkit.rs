//! Key hashing: hash functions, hash-tag trimming, and the weighted
//! consistent-hash ring used for non-cluster backends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;

use crate::error::ProxyError;

/// Hash function selection, named as in the cluster config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HashMethod {
    #[serde(rename = "fnv1a_64")]
    Fnv1a64,
}

impl Default for HashMethod {
    fn default() -> Self {
        HashMethod::Fnv1a64
    }
}

impl HashMethod {
    pub fn hash(self, key: &[u8]) -> u64 {
        match self {
            HashMethod::Fnv1a64 => fnv1a_64(key),
        }
    }
}

/// Key distribution over the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HashDistribution {
    #[serde(rename = "ketama")]
    Ketama,
}

impl Default for HashDistribution {
    fn default() -> Self {
        HashDistribution::Ketama
    }
}

/// 64-bit FNV-1a.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET;
    for &b in data {
        h ^= u64::from(b);
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// CRC16 (CCITT, XMODEM variant) as used for Redis Cluster key slots.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc = (crc << 8) ^ CRC16_TAB[usize::from((crc >> 8) as u8 ^ b)];
    }
    crc
}

/// Trim a key down to its hash-tag content.
///
/// When `tag` holds two characters and the key contains both in order with
/// non-empty content between them, only that inner substring is hashed.
pub fn trim_hash_tag<'a>(key: &'a [u8], tag: &[u8]) -> &'a [u8] {
    if tag.len() != 2 {
        return key;
    }
    let Some(open) = key.iter().position(|&b| b == tag[0]) else {
        return key;
    };
    let rest = &key[open + 1..];
    let Some(close) = rest.iter().position(|&b| b == tag[1]) else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &rest[..close]
}

/// Virtual points placed on the ring per unit of node weight.
const POINTS_PER_WEIGHT: u32 = 160;

#[derive(Default)]
struct RingTable {
    /// Sorted by (hash, virtual id).
    points: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl RingTable {
    fn build(method: HashMethod, weights: &BTreeMap<String, u32>) -> RingTable {
        let nodes: Vec<String> = weights.keys().cloned().collect();
        let mut scratch: Vec<(u64, String, usize)> = Vec::new();
        for (idx, (name, weight)) in weights.iter().enumerate() {
            for rep in 0..weight * POINTS_PER_WEIGHT {
                let vid = format!("{name}-{rep}");
                scratch.push((method.hash(vid.as_bytes()), vid, idx));
            }
        }
        // Ties in ring position break lexicographically on virtual id.
        scratch.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        RingTable {
            points: scratch.into_iter().map(|(h, _, idx)| (h, idx)).collect(),
            nodes,
        }
    }

    fn get(&self, hash: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let mut i = self.points.partition_point(|&(h, _)| h < hash);
        if i == self.points.len() {
            i = 0;
        }
        Some(&self.nodes[self.points[i].1])
    }
}

/// Weighted consistent-hash ring.
///
/// Lookups run against an immutable snapshot; add/remove rebuild a fresh
/// table off-line and publish it with one pointer swap, so an in-flight
/// lookup observes either the old or the new ring, never a torn one.
pub struct HashRing {
    method: HashMethod,
    weights: Mutex<BTreeMap<String, u32>>,
    table: RwLock<Arc<RingTable>>,
}

impl HashRing {
    pub fn new(method: HashMethod, _distribution: HashDistribution) -> Self {
        Self {
            method,
            weights: Mutex::new(BTreeMap::new()),
            table: RwLock::new(Arc::new(RingTable::default())),
        }
    }

    /// Populate the ring from parallel node/weight lists.
    pub fn init(&self, names: &[String], weights: &[u32]) -> Result<(), ProxyError> {
        if names.len() != weights.len() {
            return Err(ProxyError::Config(
                "ring node and weight counts differ".into(),
            ));
        }
        let mut map = lock_poisoned(self.weights.lock());
        map.clear();
        for (name, &w) in names.iter().zip(weights) {
            if w == 0 {
                return Err(ProxyError::Config(format!("node {name} has zero weight")));
            }
            map.insert(name.clone(), w);
        }
        self.publish(&map);
        Ok(())
    }

    /// Map a (pre-trimmed) key to a node, or `None` when the ring is empty.
    pub fn get(&self, key: &[u8]) -> Option<String> {
        let table = {
            let guard = lock_poisoned(self.table.read());
            Arc::clone(&guard)
        };
        table.get(self.method.hash(key)).map(str::to_owned)
    }

    /// Re-admit (or add) a node at the given weight.
    pub fn add_node(&self, name: &str, weight: u32) {
        let mut map = lock_poisoned(self.weights.lock());
        map.insert(name.to_owned(), weight.max(1));
        self.publish(&map);
    }

    /// Remove a node; in-flight lookups keep resolving against the old table.
    pub fn remove_node(&self, name: &str) {
        let mut map = lock_poisoned(self.weights.lock());
        if map.remove(name).is_some() {
            self.publish(&map);
        }
    }

    pub fn is_empty(&self) -> bool {
        lock_poisoned(self.weights.lock()).is_empty()
    }

    fn publish(&self, weights: &BTreeMap<String, u32>) {
        let table = Arc::new(RingTable::build(self.method, weights));
        *lock_poisoned(self.table.write()) = table;
    }
}

/// Ring and seed-set locks are never held across await points or panics in
/// this crate; treat poisoning as unreachable rather than propagating.
fn lock_poisoned<G>(r: Result<G, std::sync::PoisonError<G>>) -> G {
    match r {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[rustfmt::skip]
const CRC16_TAB: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn fnv1a_64_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn crc16_vectors() {
        assert_eq!(crc16(b"123456789"), 12739);
        assert_eq!(crc16(b"foo"), 44950);
        assert_eq!(crc16(b"foo") & 0x3fff, 12182);
    }

    #[test]
    fn hash_tag_trimming() {
        assert_eq!(trim_hash_tag(b"user{1000}data", b"{}"), b"1000");
        assert_eq!(trim_hash_tag(b"{1000}", b"{}"), b"1000");
        // Empty tag content hashes the whole key.
        assert_eq!(trim_hash_tag(b"a{}b", b"{}"), b"a{}b");
        // Missing open or close falls back to the whole key.
        assert_eq!(trim_hash_tag(b"plain", b"{}"), b"plain");
        assert_eq!(trim_hash_tag(b"open{only", b"{}"), b"open{only");
        // No tag configured.
        assert_eq!(trim_hash_tag(b"user{1000}data", b""), b"user{1000}data");
    }

    fn ring_of(nodes: &[(&str, u32)]) -> HashRing {
        let ring = HashRing::new(HashMethod::Fnv1a64, HashDistribution::Ketama);
        let names: Vec<String> = nodes.iter().map(|(n, _)| (*n).to_owned()).collect();
        let weights: Vec<u32> = nodes.iter().map(|(_, w)| *w).collect();
        ring.init(&names, &weights).unwrap();
        ring
    }

    #[test]
    fn empty_ring_has_no_route() {
        let ring = HashRing::new(HashMethod::Fnv1a64, HashDistribution::Ketama);
        assert!(ring.get(b"anything").is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn lookup_is_stable_for_identical_state() {
        let ring = ring_of(&[("10.0.0.1:11211", 1), ("10.0.0.2:11211", 1)]);
        for i in 0..1000 {
            let key = format!("stable-key-{i}");
            assert_eq!(ring.get(key.as_bytes()), ring.get(key.as_bytes()));
        }
    }

    #[test]
    fn removing_a_node_only_remaps_its_own_keys() {
        let ring = ring_of(&[("a:1", 1), ("b:1", 1), ("c:1", 1)]);
        let keys: Vec<String> = (0..2000).map(|i| format!("k{i}")).collect();
        let before: Vec<Option<String>> = keys.iter().map(|k| ring.get(k.as_bytes())).collect();

        ring.remove_node("b:1");
        for (key, owner) in keys.iter().zip(&before) {
            let owner = owner.as_deref().unwrap();
            if owner != "b:1" {
                assert_eq!(ring.get(key.as_bytes()).as_deref(), Some(owner));
            } else {
                assert_ne!(ring.get(key.as_bytes()).as_deref(), Some("b:1"));
            }
        }

        // Re-adding at the original weight restores the original mapping.
        ring.add_node("b:1", 1);
        let after: Vec<Option<String>> = keys.iter().map(|k| ring.get(k.as_bytes())).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn equal_weights_distribute_evenly() {
        let nodes = ["n1:1", "n2:1", "n3:1", "n4:1"];
        let ring = ring_of(&nodes.map(|n| (n, 1)));
        let mut counts = std::collections::HashMap::new();
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        const KEYS: usize = 100_000;
        for _ in 0..KEYS {
            let key = format!("key-{}", rng.gen::<u64>());
            let node = ring.get(key.as_bytes()).unwrap();
            *counts.entry(node).or_insert(0usize) += 1;
        }
        let expected = KEYS / nodes.len();
        for node in nodes {
            let got = counts.get(node).copied().unwrap_or(0);
            let deviation = (got as f64 - expected as f64).abs() / expected as f64;
            assert!(
                deviation < 0.05,
                "node {node} holds {got} keys ({deviation:.3} off uniform)"
            );
        }
    }

    #[test]
    fn weighted_node_receives_proportional_share() {
        let ring = ring_of(&[("small:1", 1), ("big:1", 3)]);
        let mut big = 0usize;
        const KEYS: usize = 50_000;
        for i in 0..KEYS {
            let key = format!("wkey-{i}");
            if ring.get(key.as_bytes()).as_deref() == Some("big:1") {
                big += 1;
            }
        }
        let share = big as f64 / KEYS as f64;
        assert!(share > 0.65 && share < 0.85, "big node share {share:.3}");
    }
}
