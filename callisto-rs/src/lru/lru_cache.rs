use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

/// Invoked with the key and value of an entry which has just been evicted.
pub type EvictionHandler<V> = Box<dyn FnMut(String, V) + Send>;

/// Provides a size constrained LRU cache.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, once
/// the memory allocated by its entries (the key length plus the value size as reported via
/// [ByteSize]) exceeds the given limit, old (least recently used) entries will be evicted -
/// hence the name LRU cache. A limit of **0** disables the constraint entirely.
///
/// An entry counts as "used" whenever it is read via [get](LRUCache::get) or written via
/// [add](LRUCache::add). There is no notion of time involved, recency is purely the position in
/// the internal ordering.
///
/// Note that the cache itself performs no synchronization at all. Concurrent access has to be
/// arranged by the caller (see [Group](crate::group::Group) which guards its cache with a mutex -
/// even reads promote entries and are therefore writes).
///
/// # Examples
/// ```
/// # use callisto::lru::LRUCache;
/// // Specifies a cache which can allocate up to 32 bytes before evicting entries...
/// let mut lru = LRUCache::new(32, None);
///
/// lru.add("Foo".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // this will still fit..
/// lru.add("Foo1".to_owned(), "X".repeat(12));
/// assert_eq!(lru.get("Foo").is_some(), true);
/// assert_eq!(lru.get("Foo1").is_some(), true);
///
/// // this will hit the memory constraint and therefore throw the oldest entry out...
/// lru.add("Foo2".to_owned(), "X".repeat(12));
/// assert_eq!(lru.get("Foo").is_some(), false);
/// assert_eq!(lru.get("Foo1").is_some(), true);
/// assert_eq!(lru.get("Foo2").is_some(), true);
/// ```
pub struct LRUCache<V: ByteSize> {
    max_bytes: usize,
    current_bytes: usize,
    map: LinkedHashMap<String, V>,
    on_evicted: Option<EvictionHandler<V>>,
}

impl<V: ByteSize> LRUCache<V> {
    /// Creates a new cache which can allocate up to **max_bytes** of memory for its entries.
    ///
    /// Passing **0** as **max_bytes** yields an unconstrained cache. An optional eviction
    /// handler is notified for every entry which is thrown out (but not for replaced values).
    pub fn new(max_bytes: usize, on_evicted: Option<EvictionHandler<V>>) -> Self {
        LRUCache {
            max_bytes,
            current_bytes: 0,
            map: LinkedHashMap::new(),
            on_evicted,
        }
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced and the entry becomes the most
    /// recently used one. Afterwards, least recently used entries are evicted until the memory
    /// constraint holds again - a single add may therefore evict many entries.
    ///
    /// # Examples
    /// ```
    /// # use callisto::lru::LRUCache;
    /// let mut lru = LRUCache::new(1024, None);
    ///
    /// lru.add("Foo".to_owned(), "Bar".to_owned());
    /// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
    /// assert_eq!(lru.current_bytes(), 6);
    ///
    /// // Replacing a value keeps the key accounted once...
    /// lru.add("Foo".to_owned(), "Barbara".to_owned());
    /// assert_eq!(lru.current_bytes(), 10);
    /// ```
    pub fn add(&mut self, key: String, value: V) {
        let key_size = key.len();
        let value_size = value.allocated_size();

        match self.map.insert(key, value) {
            // The key was known: the entry has been moved to the most recently used position
            // by the insert, we only need to account for the changed value size...
            Some(previous) => {
                self.current_bytes = self.current_bytes + value_size - previous.allocated_size();
            }
            None => {
                self.current_bytes += key_size + value_size;
            }
        }

        while self.max_bytes != 0 && self.current_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no value is present.
    ///
    /// A successful lookup marks the entry as the most recently used one.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        match self.map.get_refresh(key) {
            Some(value) => Some(&*value),
            None => None,
        }
    }

    /// Removes the least recently used entry.
    ///
    /// If an eviction handler is present, it is invoked with the removed key and value. Calling
    /// this on an empty cache is a no-op.
    pub fn remove_oldest(&mut self) {
        if let Some((key, value)) = self.map.pop_front() {
            self.current_bytes -= key.len() + value.allocated_size();
            if let Some(handler) = &mut self.on_evicted {
                handler(key, value);
            }
        }
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the amount of memory currently allocated by the keys and values of this cache.
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Returns the maximal amount of memory to be occupied by this cache (0 = unlimited).
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
