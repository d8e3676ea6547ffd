//! Callisto is a library for building distributed, read-through in-memory caches.
//!
//! # Introduction
//! **Callisto** distributes a namespaced key/value cache across a fixed set of peer processes.
//! An application asks any peer for a value by name: the cache either returns a previously
//! computed value from local memory, fetches it from the peer responsible for that key, or -
//! on the responsible peer itself - synthesizes it via an application supplied loader.
//!
//! Three properties make this worthwhile:
//!
//! * **Bounded memory**: each [group](group) keeps its hot values in a size constrained
//!   [LRU cache](lru) which evicts the least recently used entries under pressure.
//! * **Stable placement**: keys are assigned to peers via a
//!   [consistent hash ring](ring), so growing a cluster of N peers only relocates about 1/N of
//!   all keys.
//! * **Load coalescing**: concurrent misses for one key are collapsed into a
//!   [single flight](singleflight) - no matter how many callers pile up, the backing data
//!   source sees one load.
//!
//! Peers talk to each other via a compact [HTTP transport](http): values travel as
//! [length-prefixed binary envelopes](protocol) below a dedicated path prefix, served by a
//! config aware [server](server).
//!
//! # Modules
//! * **group**: the cache namespaces and their read-through flow - this is the main entry
//!   point, see [group::new_group].
//! * **lru**: the size constrained LRU cache underneath each group.
//! * **ring**: consistent-hash based peer selection.
//! * **singleflight**: request coalescing for concurrent misses.
//! * **http** / **protocol** / **server**: the peer transport.
//! * **config** / **node**: process plumbing (reload aware configuration, lifecycle and
//!   signal driven shutdown).
//!
//! # Example
//! A complete, runnable cache node can be found in the **callisto-io** crate of this
//! workspace. The short version:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use callisto::config::Config;
//! # use callisto::http::HttpPool;
//! # use callisto::node::Node;
//! # use callisto::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     callisto::init_logging();
//!
//!     let node = Node::new();
//!     Node::terminate_on_signals(&node);
//!
//!     let config = Arc::new(Config::new("config/settings.yml"));
//!     config.load_from_string("
//!         server:
//!             port: 8001
//!     ", None).unwrap();
//!
//!     // A group answering cache misses from the actual data source...
//!     let group = callisto::group::new_group("scores", 2 << 10, |key: &str| {
//!         Ok(format!("value of {}", key).into_bytes())
//!     });
//!
//!     // ...distributed across a (here: single peer) cluster.
//!     let pool = HttpPool::new("http://localhost:8001");
//!     pool.set(&["http://localhost:8001".to_owned()]);
//!     group.register_peers(pool.clone());
//!
//!     Server::new(node, config, "server", 8001, pool).event_loop().await;
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod byteview;
pub mod config;
pub mod fmt;
pub mod group;
pub mod http;
pub mod lru;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod singleflight;

/// Contains the version of the callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the callisto build being used.
pub const CALLISTO_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// As we intend cache nodes to run in docker containers, logging to stdout is all that is
/// needed. The date format being used is digestible by established tools like **greylog**.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is mainly our test port (18211) on which we start a local server
        /// for integration tests. Using this lock, we can still execute all other tests in
        /// parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
