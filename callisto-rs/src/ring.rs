//! Provides the consistent hash ring used to place keys on peers.
//!
//! Each real peer is represented by a configurable number of virtual nodes on the ring. A key is
//! owned by the peer whose next virtual node (in ascending hash order, wrapping around at the
//! end) follows the key's own hash. Thanks to the virtual nodes, adding a peer to a ring of N
//! peers only relocates roughly 1/N of all keys while keeping the load reasonably balanced.
//!
//! The ring itself is a plain data structure without any synchronization. The
//! [HttpPool](crate::http::HttpPool) builds a fresh ring on every
//! [set](crate::http::HttpPool::set) and treats it as read-only afterwards.
//!
//! # Example
//!
//! ```
//! # use callisto::ring::HashRing;
//! let mut ring = HashRing::new(50);
//! ring.add(&["http://localhost:8001", "http://localhost:8002"]);
//!
//! // Each key is consistently owned by exactly one of the peers...
//! let owner = ring.get("Tom").unwrap();
//! assert_eq!(ring.get("Tom").unwrap(), owner);
//! ```
use std::collections::HashMap;

/// Computes the ring position for the given bytes.
///
/// The default is CRC32 (IEEE). Tests inject simpler functions to obtain predictable layouts.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Maps keys to peer names via a sorted ring of hashed virtual nodes.
pub struct HashRing {
    replicas: usize,
    keys: Vec<u32>,
    mapping: HashMap<u32, String>,
    hash: HashFn,
}

impl HashRing {
    /// Creates an empty ring which represents each peer by **replicas** virtual nodes.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, Box::new(|data| crc32fast::hash(data)))
    }

    /// Creates an empty ring using a custom hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            replicas,
            keys: Vec::new(),
            mapping: HashMap::new(),
            hash,
        }
    }

    /// Places the given peers on the ring.
    ///
    /// For each peer, **replicas** virtual nodes are generated by hashing the replica index
    /// concatenated with the peer name. Should two virtual nodes collide on the same ring
    /// position, the peer added last wins.
    pub fn add<S: AsRef<str>>(&mut self, peers: &[S]) {
        for peer in peers {
            for replica in 0..self.replicas {
                let hash = (self.hash)(format!("{}{}", replica, peer.as_ref()).as_bytes());
                self.keys.push(hash);
                let _ = self.mapping.insert(hash, peer.as_ref().to_owned());
            }
        }

        self.keys.sort_unstable();
    }

    /// Returns the peer owning the given key or **None** if the ring is empty.
    ///
    /// The owner is the peer behind the first virtual node with a ring position of at least the
    /// key's hash. If the key hashes beyond the last virtual node, the ring wraps around to the
    /// first one.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let mut index = self.keys.partition_point(|&position| position < hash);
        if index == self.keys.len() {
            index = 0;
        }

        self.mapping.get(&self.keys[index]).map(|peer| peer.as_str())
    }

    /// Determines if any peers have been placed on the ring.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
