//! Provides the cache namespaces which orchestrate the whole read-through flow.
//!
//! A [Group] is a named cache namespace. It owns a local, size constrained LRU cache and a
//! [Loader] which is invoked whenever a value has to be obtained from the underlying data
//! source. If a [PeerPicker](crate::peers::PeerPicker) has been attached, the group first
//! determines which peer of the cluster owns the requested key and - unless that is the local
//! process itself - fetches the value from there instead of loading it locally.
//!
//! ```text
//!                                 yes
//! receive key -> cached locally? ----> return cached value (1)
//!                     | no                           yes
//!                     |-----> owned by a remote peer ----> fetch from peer -> return value (2)
//!                                 | no
//!                                 |-----> invoke the loader, populate the cache,
//!                                         return the value (3)
//! ```
//!
//! All misses for one key are funneled through a [SingleFlight](crate::singleflight) coordinator
//! so that an arbitrary number of concurrent callers causes at most one load.
//!
//! Groups are kept in a process wide registry. This way the HTTP handler serving peer requests
//! can resolve a group by the name found in the request path, without any back-reference from
//! the transport to the groups it serves.
//!
//! # Example
//!
//! ```
//! # use callisto::group;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let group = group::new_group("docs-example", 2 << 10, |key: &str| {
//!     // Talk to the actual data source here...
//!     Ok(format!("value of {}", key).into_bytes())
//! });
//!
//! let view = group.get("Foo").await.unwrap();
//! assert_eq!(view.to_string(), "value of Foo");
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::byteview::ByteView;
use crate::fmt::format_size;
use crate::lru::{ByteSize, LRUCache};
use crate::peers::PeerPicker;
use crate::singleflight::SingleFlight;

/// Loads the value for a key from the underlying data source.
///
/// This is the callback invoked by a [Group] on a cache miss for keys owned by the local
/// process. It is implemented for all matching closures, so both a function value and a
/// dedicated struct can be passed to [new_group].
pub trait Loader: Send + Sync + 'static {
    /// Produces the value for the given key or reports why it cannot be obtained.
    ///
    /// Errors (e.g. "no such entry") are passed through verbatim to the caller of
    /// [Group::get]. Nothing is cached in this case.
    fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

impl<F> Loader for F
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
{
    fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self(key)
    }
}

/// Wraps the LRU cache of a group behind a mutex.
///
/// A plain mutex (and not a reader/writer lock) is all we can use here, as even reads promote
/// the touched entry and therefore mutate the cache. The inner cache is created lazily on the
/// first write, so a group which never stores anything never allocates a cache either. A lookup
/// on the not-yet-created cache is indistinguishable from a miss.
struct MainCache {
    cache_bytes: usize,
    lru: Mutex<Option<LRUCache<ByteView>>>,
}

impl MainCache {
    fn new(cache_bytes: usize) -> Self {
        MainCache {
            cache_bytes,
            lru: Mutex::new(None),
        }
    }

    fn add(&self, key: &str, value: ByteView) {
        let mut guard = self.lru.lock().unwrap();
        guard
            .get_or_insert_with(|| {
                LRUCache::new(
                    self.cache_bytes,
                    Some(Box::new(|key, value: ByteView| {
                        log::debug!(
                            "Evicting {} ({}) from the cache...",
                            key,
                            format_size(value.allocated_size())
                        );
                    })),
                )
            })
            .add(key.to_owned(), value);
    }

    fn get(&self, key: &str) -> Option<ByteView> {
        let mut guard = self.lru.lock().unwrap();
        guard.as_mut()?.get(key).cloned()
    }
}

/// A named cache namespace with its own loader and local LRU cache.
pub struct Group {
    name: String,
    loader: Box<dyn Loader>,
    main_cache: MainCache,
    peers: Mutex<Option<Arc<dyn PeerPicker>>>,
    flights: SingleFlight<ByteView>,
}

lazy_static::lazy_static! {
    /// The process wide registry of all known groups.
    ///
    /// Writes (creating a group) are exclusive, lookups by the transport layer run under the
    /// shared read lock.
    static ref GROUPS: RwLock<HashMap<String, Arc<Group>>> = RwLock::new(HashMap::new());
}

/// Creates a group with the given name and registers it in the process wide registry.
///
/// The local cache of the group may allocate up to **cache_bytes** of memory (0 = unlimited).
/// Creating a second group under an already taken name replaces the previous registration.
pub fn new_group(name: &str, cache_bytes: usize, loader: impl Loader) -> Arc<Group> {
    let group = Arc::new(Group {
        name: name.to_owned(),
        loader: Box::new(loader),
        main_cache: MainCache::new(cache_bytes),
        peers: Mutex::new(None),
        flights: SingleFlight::new(),
    });

    let _ = GROUPS
        .write()
        .unwrap()
        .insert(name.to_owned(), group.clone());

    group
}

/// Returns the group previously created under the given name.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    GROUPS.read().unwrap().get(name).cloned()
}

impl Group {
    /// Returns the name under which this group has been registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the peer picker which routes keys to the peers of the cluster.
    ///
    /// Without a picker, every miss is answered by the local loader.
    ///
    /// # Panics
    /// Panics if a picker has already been attached - re-routing a live group is a programming
    /// error.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) {
        let mut peers = self.peers.lock().unwrap();
        if peers.is_some() {
            panic!("register_peers was called more than once for group {}!", self.name);
        }
        *peers = Some(picker);
    }

    /// Returns the value cached for the given key.
    ///
    /// If the value is not present in the local cache, it is either fetched from the peer
    /// owning the key or synthesized via the loader (and then kept in the local cache).
    /// Requesting an empty key is reported as an error.
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if key.is_empty() {
            return Err(anyhow::anyhow!("key is required"));
        }

        if let Some(view) = self.main_cache.get(key) {
            log::debug!("Cache hit for {} in group {}...", key, self.name);
            return Ok(view);
        }

        self.load(key).await
    }

    /// Obtains a value which is not present in the local cache.
    ///
    /// The whole decision (remote peer vs. local loader) runs inside the single-flight
    /// coordinator, therefore concurrent misses for one key perform exactly one load and share
    /// its outcome.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        self.flights
            .execute(key, async {
                let picker = self.peers.lock().unwrap().clone();
                if let Some(picker) = picker {
                    if let Some(peer) = picker.pick_peer(key) {
                        match peer.fetch(&self.name, key).await {
                            Ok(bytes) => return Ok(ByteView::new(bytes)),
                            Err(error) => {
                                // A failed peer fetch is deliberately NOT routed to the local
                                // loader: the owner of the key is another process and loading
                                // the value everywhere would defeat the placement. The caller
                                // observes an empty view instead of a hard error.
                                log::warn!(
                                    "Failed to fetch {} for group {} from its peer: {:#}",
                                    key,
                                    self.name,
                                    error
                                );
                                return Ok(ByteView::empty());
                            }
                        }
                    }
                }

                self.load_locally(key)
            })
            .await
            .map_err(|error| anyhow::anyhow!(error))
    }

    /// Invokes the loader and populates the local cache with its result.
    fn load_locally(&self, key: &str) -> anyhow::Result<ByteView> {
        let bytes = self.loader.load(key)?;

        // The buffer moves into the view, so no reference through which the cached bytes could
        // be modified survives this call...
        let view = ByteView::new(bytes);
        self.main_cache.add(key, view.clone());

        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::group;
    use crate::peers::{PeerFetcher, PeerPicker};
    use crate::testing::test_async;

    fn sample_db() -> HashMap<&'static str, &'static str> {
        let mut db = HashMap::new();
        let _ = db.insert("Tom", "630");
        let _ = db.insert("Jack", "589");
        let _ = db.insert("Sam", "567");
        db
    }

    /// Builds a loader over the sample data set which counts its invocations.
    fn counting_loader(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static {
        move |key: &str| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            match sample_db().get(key) {
                Some(value) => Ok(value.as_bytes().to_vec()),
                None => Err(anyhow::anyhow!("{} not exist", key)),
            }
        }
    }

    #[test]
    fn values_are_loaded_once_and_then_cached() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let group = group::new_group("scores_cached", 2 << 10, counting_loader(loads.clone()));

            let view = group.get("Tom").await.unwrap();
            assert_eq!(view.to_string(), "630");
            assert_eq!(loads.load(Ordering::SeqCst), 1);

            // The second lookup is a pure cache hit...
            let view = group.get("Tom").await.unwrap();
            assert_eq!(view.to_string(), "630");
            assert_eq!(loads.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn an_empty_key_is_rejected() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let group = group::new_group("scores_empty", 2 << 10, counting_loader(loads.clone()));

            let error = group.get("").await.unwrap_err();
            assert_eq!(error.to_string(), "key is required");
            assert_eq!(loads.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn loader_errors_are_reported_and_not_cached() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let group = group::new_group("scores_errors", 2 << 10, counting_loader(loads.clone()));

            let error = group.get("unknown").await.unwrap_err();
            assert_eq!(error.to_string().contains("not exist"), true);

            // A failed load leaves no cache entry behind, so the loader runs again...
            let _ = group.get("unknown").await.unwrap_err();
            assert_eq!(loads.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn groups_are_resolvable_by_name() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let _ = group::new_group("scores_registry", 2 << 10, counting_loader(loads));

            let group = group::get_group("scores_registry").unwrap();
            assert_eq!(group.name(), "scores_registry");
            assert_eq!(group::get_group("missing_registry_entry").is_none(), true);
        });
    }

    struct StaticFetcher {
        payload: Option<&'static str>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerFetcher for StaticFetcher {
        async fn fetch(&self, _group: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.payload {
                Some(payload) => Ok(payload.as_bytes().to_vec()),
                None => Err(anyhow::anyhow!("peer is unreachable")),
            }
        }
    }

    struct StaticPicker {
        fetcher: Option<Arc<dyn PeerFetcher>>,
    }

    impl PeerPicker for StaticPicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerFetcher>> {
            self.fetcher.clone()
        }
    }

    #[test]
    fn remote_keys_are_fetched_from_their_peer() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let fetches = Arc::new(AtomicUsize::new(0));

            let group = group::new_group("scores_remote", 2 << 10, counting_loader(loads.clone()));
            group.register_peers(Arc::new(StaticPicker {
                fetcher: Some(Arc::new(StaticFetcher {
                    payload: Some("630"),
                    fetches: fetches.clone(),
                })),
            }));

            let view = group.get("Tom").await.unwrap();
            assert_eq!(view.to_string(), "630");

            // The peer answered, so the local loader was never consulted...
            assert_eq!(fetches.load(Ordering::SeqCst), 1);
            assert_eq!(loads.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn local_keys_are_loaded_locally() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));

            let group = group::new_group("scores_local", 2 << 10, counting_loader(loads.clone()));
            // A picker which never picks stands for "every key is owned by this process"...
            group.register_peers(Arc::new(StaticPicker { fetcher: None }));

            let view = group.get("Tom").await.unwrap();
            assert_eq!(view.to_string(), "630");
            assert_eq!(loads.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn failed_peer_fetches_yield_an_empty_view() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let fetches = Arc::new(AtomicUsize::new(0));

            let group = group::new_group("scores_failing", 2 << 10, counting_loader(loads.clone()));
            group.register_peers(Arc::new(StaticPicker {
                fetcher: Some(Arc::new(StaticFetcher {
                    payload: None,
                    fetches: fetches.clone(),
                })),
            }));

            // The fetch fails, but the caller sees an empty view instead of an error. In
            // particular, the failure does NOT re-route the load to the local loader...
            let view = group.get("Tom").await.unwrap();
            assert_eq!(view.is_empty(), true);
            assert_eq!(fetches.load(Ordering::SeqCst), 1);
            assert_eq!(loads.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    #[should_panic]
    fn peers_can_only_be_registered_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let group = group::new_group("scores_twice", 2 << 10, counting_loader(loads));

        group.register_peers(Arc::new(StaticPicker { fetcher: None }));
        group.register_peers(Arc::new(StaticPicker { fetcher: None }));
    }
}
