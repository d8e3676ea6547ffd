//! Defines the seams between a cache group and the peer transport.
//!
//! A [Group](crate::group::Group) never talks to the network itself. It only asks a
//! [PeerPicker] which peer owns a key and, if one was picked, fetches the value through the
//! returned [PeerFetcher]. The HTTP based implementation of both traits lives in
//! [http](crate::http), but tests are free to plug in whatever they like.
use std::sync::Arc;

use async_trait::async_trait;

/// Selects the peer owning a given key.
pub trait PeerPicker: Send + Sync {
    /// Returns a client for the peer owning the given key.
    ///
    /// Returns **None** if the key is owned by the local process (or if no peers are known at
    /// all). In this case the group falls back to its own loader.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>>;
}

/// A client which retrieves a cached value from one specific remote peer.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// Fetches the value for the given key from the given group on the remote peer.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}
