//! Provides the HTTP based peer transport.
//!
//! Each process of the cluster runs an [HttpPool]. The pool plays two roles at once:
//!
//! * It is the [PeerPicker](crate::peers::PeerPicker) of the process: given a key, it consults
//!   its consistent hash ring and either returns a client bound to the owning peer or **None**
//!   if the key is owned by the local process.
//! * It is the [HttpHandler](crate::server::HttpHandler) which answers the cache requests of
//!   all other peers. Requests arrive as `GET <base_path><group>/<key>` and are answered with
//!   a binary [response envelope](crate::protocol).
//!
//! The peer set is installed via [set](HttpPool::set) which rebuilds the ring and the client
//! map in one go. Peers are expected to be configured identically on all processes so that
//! every process routes a given key to the same owner.
//!
//! The served paths start with a common base path (`/_dcache/` by default) so that the
//! transport can coexist with other endpoints on the same host.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};

use crate::group;
use crate::peers::{PeerFetcher, PeerPicker};
use crate::protocol;
use crate::ring::HashRing;
use crate::server::HttpHandler;

/// The default path prefix below which peers talk to each other.
pub const DEFAULT_BASE_PATH: &str = "/_dcache/";

/// The default number of virtual nodes per peer on the consistent hash ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// Routes keys to the peers of the cluster and serves the values owned by this process.
pub struct HttpPool {
    self_address: String,
    base_path: String,
    state: Mutex<PoolState>,
}

/// The ring and the per-peer clients are replaced wholesale by [HttpPool::set].
struct PoolState {
    ring: HashRing,
    fetchers: HashMap<String, Arc<HttpFetcher>>,
}

impl HttpPool {
    /// Creates a pool for the process reachable under the given address.
    ///
    /// The address (e.g. `http://localhost:8001`) has to match the entry for this process in
    /// the peer list passed to [set](HttpPool::set) - this is how the pool recognizes itself.
    pub fn new(self_address: &str) -> Arc<Self> {
        Arc::new(HttpPool {
            self_address: self_address.to_owned(),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                fetchers: HashMap::new(),
            }),
        })
    }

    /// Installs the peer set of the cluster.
    ///
    /// This rebuilds the consistent hash ring and creates an HTTP client per peer. The
    /// previous ring and clients are discarded atomically.
    pub fn set(&self, peers: &[String]) {
        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add(peers);

        let mut fetchers = HashMap::new();
        for peer in peers {
            let _ = fetchers.insert(
                peer.clone(),
                Arc::new(HttpFetcher {
                    base_url: format!("{}{}", peer, self.base_path),
                }),
            );
        }

        *self.state.lock().unwrap() = PoolState { ring, fetchers };
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>> {
        let state = self.state.lock().unwrap();

        let peer = state.ring.get(key)?;
        if peer == self.self_address {
            return None;
        }

        log::debug!("[{}] Picked peer {} for {}...", self.self_address, peer, key);
        let fetcher = state.fetchers.get(peer)?.clone();
        Some(fetcher)
    }
}

#[async_trait]
impl HttpHandler for HttpPool {
    /// Serves a cache request issued by another peer.
    ///
    /// The path is expected to be `<base_path><group>/<key>` with both parts URL-escaped.
    /// A malformed path yields a 400, an unknown group a 404 and a failed load a 500. On
    /// success the value travels as an `application/octet-stream` encoded response envelope.
    async fn handle(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
        let path = request.uri().path().to_owned();
        if !path.starts_with(&self.base_path) {
            // The server only mounts this handler below its base path, everything else
            // reaching us is a wiring error we cannot recover from...
            panic!("HttpPool serving unexpected path: {}", path);
        }

        log::debug!("[{}] {} {}", self.self_address, request.method(), path);

        let (group_name, key) = match parse_cache_path(&path[self.base_path.len()..]) {
            Some(parts) => parts,
            None => return Ok(text_response(StatusCode::BAD_REQUEST, "bad request")),
        };

        let group = match group::get_group(&group_name) {
            Some(group) => group,
            None => {
                return Ok(text_response(
                    StatusCode::NOT_FOUND,
                    format!("no such group: {}", group_name),
                ))
            }
        };

        match group.get(&key).await {
            Ok(view) => {
                let mut response = Response::new(Body::from(protocol::encode_response(
                    &view.to_vec(),
                )));
                let _ = response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                Ok(response)
            }
            Err(error) => Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
            )),
        }
    }
}

/// Splits `<group>/<key>` on the first slash and unescapes both parts.
///
/// Keys containing a slash therefore have to be URL-escaped by the requesting side (which
/// [HttpFetcher] does).
fn parse_cache_path(path: &str) -> Option<(String, String)> {
    let (group_name, key) = path.split_once('/')?;

    let group_name = urlencoding::decode(group_name).ok()?;
    let key = urlencoding::decode(key).ok()?;

    Some((group_name.into_owned(), key.into_owned()))
}

/// Builds a plain text response with the given status.
fn text_response(status: StatusCode, message: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(message.into());
    *response.status_mut() = status;
    response
}

/// The HTTP client bound to one remote peer.
struct HttpFetcher {
    base_url: String,
}

#[async_trait]
impl PeerFetcher for HttpFetcher {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(group),
            urlencoding::encode(key)
        );
        let uri = Uri::from_str(&url).context("Failed to assemble the peer URL.")?;

        let response = Client::new()
            .get(uri)
            .await
            .context("Failed to reach the peer.")?;

        if response.status() != StatusCode::OK {
            return Err(anyhow!("The peer returned: {}", response.status()));
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read the peer response.")?;

        protocol::decode_response(&body).context("Failed to decode the peer response.")
    }
}
