//! Contains the HTTP server hosting the peer transport (and the optional API front-end).
//!
//! A [Server] opens a server socket on the address found in its config section (e.g.
//! **server.host** / **server.port**) and serves incoming requests via the [HttpHandler] it was
//! created with. The peer transport passes the [HttpPool](crate::http::HttpPool) here, the node
//! binary additionally runs a second server for its public API.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port. Therefore a "new" instance
//! can be started while the "old" one bleeds out and the port will be "handed through" with
//! minimal downtime. Also, this listens to change events of the config and will relocate to
//! another port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use callisto::config::Config;
//! # use callisto::node::Node;
//! # use callisto::server::Server;
//! # use callisto::http::HttpPool;
//! #[tokio::main]
//! async fn main() {
//!     let node = Node::new();
//!     let config = Arc::new(Config::new("config/settings.yml"));
//!     config.load_from_string("
//!         server:
//!             port: 8001
//!     ", None).unwrap();
//!
//!     let pool = HttpPool::new("http://localhost:8001");
//!
//!     // Run the peer transport...
//!     Server::new(node, config, "server", 8001, pool).event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};

use crate::config::Config;
use crate::node::Node;
use crate::spawn;

/// Specifies the interval in which a failed bind is retried.
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Specifies the interval in which the running server checks for a requested shutdown.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Answers the requests received by a [Server].
///
/// This is the seam between the generic socket handling here and the actual endpoints: the
/// peer transport ([HttpPool](crate::http::HttpPool)) implements it and so does the API
/// front-end of the node binary. An **Err** returned by a handler is turned into a plain 500
/// response.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    /// Produces the response for the given request.
    async fn handle(&self, request: Request<Body>) -> anyhow::Result<Response<Body>>;
}

/// Represents a server which binds a socket and serves requests via its [HttpHandler].
pub struct Server {
    node: Arc<Node>,
    config: Arc<Config>,
    section: &'static str,
    default_port: u16,
    handler: Arc<dyn HttpHandler>,
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
}

impl Server {
    /// Creates a new server.
    ///
    /// The listen address is resolved from `<section>.host` and `<section>.port` of the system
    /// config, falling back to `0.0.0.0` and the given default port. Note that this will not
    /// technically start the server - this has to be done via [event_loop](Server::event_loop),
    /// as it is most probably done in the main task.
    pub fn new(
        node: Arc<Node>,
        config: Arc<Config>,
        section: &'static str,
        default_port: u16,
        handler: Arc<dyn HttpHandler>,
    ) -> Arc<Self> {
        Arc::new(Server {
            node,
            config,
            section,
            default_port,
            handler,
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
        })
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Node::is_running** this is not used to control the shutdown of the
    /// whole process. Rather we toggle this flag to *false* if a config and therefore address
    /// change was detected. This way the serve loop winds down and a new server socket for the
    /// appropriate address is set up by the [event_loop](Server::event_loop).
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used.
    fn address(&self) -> String {
        let handle = self.config.current();
        let config = handle.config();

        format!(
            "{}:{}",
            config[self.section]["host"].as_str().unwrap_or("0.0.0.0"),
            config[self.section]["port"]
                .as_i64()
                .filter(|port| *port > 0 && *port <= i64::from(u16::MAX))
                .unwrap_or_else(|| i64::from(self.default_port))
        )
    }

    /// Starts the event loop in a separate task.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// task.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the server socket is bound.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Tries to open a server socket on the configured address and serves incoming requests.
    ///
    /// Once the socket is bound, we serve requests until either the node is terminated (then
    /// this loop returns for good) or until the config changed the server address (then the
    /// socket is re-created). A failed bind is retried every 500ms, with a log message at most
    /// every 5s so that we do not jam the log.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.node.is_running() {
            // If the server is started for the first time or if it has been restarted due to
            // a config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            let socket_address = match address.parse::<SocketAddr>() {
                Ok(socket_address) => socket_address,
                Err(_) => {
                    self.report_bind_error(&address, &mut last_bind_error_reported);
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                    continue;
                }
            };

            match hyper::server::Server::try_bind(&socket_address) {
                Ok(builder) => {
                    log::info!("Opened server socket on {}...", &address);
                    *self.current_address.lock().unwrap() = Some(address.clone());

                    let handler = self.handler.clone();
                    let service = make_service_fn(move |_connection| {
                        let handler = handler.clone();
                        async move {
                            Ok::<_, Infallible>(service_fn(move |request| {
                                dispatch(handler.clone(), request)
                            }))
                        }
                    });

                    let result = builder
                        .serve(service)
                        .with_graceful_shutdown(self.shutdown_signal(&address))
                        .await;
                    if let Err(error) = result {
                        log::error!("The server on {} terminated abnormally: {}", &address, error);
                    }

                    log::info!("Closing server socket on {}.", &address);
                }
                Err(_) => {
                    self.report_bind_error(&address, &mut last_bind_error_reported);
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Logs a failed bind, suppressing repetitions within 5 seconds.
    fn report_bind_error(&self, address: &str, last_reported: &mut Instant) {
        if Instant::now().duration_since(*last_reported).as_secs() > 5 {
            log::error!(
                "Cannot open server address: {}. Retrying every 500ms...",
                address
            );
            *last_reported = Instant::now();
        }
    }

    /// Resolves once the running server socket should be torn down.
    ///
    /// This is either the case because the node is being terminated or because a config change
    /// moved the server to another address. In the latter case the running flag is cleared so
    /// that the event loop re-resolves the address and binds a fresh socket.
    async fn shutdown_signal(&self, address: &str) {
        let mut config_changed = self.config.notifier();

        loop {
            tokio::select! {
                // We use a timeout here so that a requested termination is detected even if no
                // config change ever arrives...
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {
                    if !self.node.is_running() {
                        return;
                    }
                }
                _ = config_changed.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    if self.address() != address {
                        log::info!("Server address has changed. Restarting server socket...");
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

/// Invokes the handler and converts a failure into a plain 500 response.
async fn dispatch(
    handler: Arc<dyn HttpHandler>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    match handler.handle(request).await {
        Ok(response) => Ok(response),
        Err(error) => {
            log::error!("Failed to handle a request: {:#}", error);

            let mut response = Response::new(Body::from(error.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use hyper::{Client, StatusCode, Uri};

    use crate::config::Config;
    use crate::group;
    use crate::http::HttpPool;
    use crate::node::Node;
    use crate::protocol;
    use crate::server::Server;
    use crate::testing::test_async;

    async fn get(url: &str) -> (StatusCode, Vec<u8>) {
        let response = Client::new()
            .get(Uri::from_str(url).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();

        (status, body.to_vec())
    }

    #[test]
    fn integration_test() {
        // We want exclusive access to the 18211 port on which we fire up a test-server for
        // our integration tests...
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let node = Node::new();
            let config = Arc::new(Config::new("callisto_test_settings.yml"));
            config
                .load_from_string(
                    "
                server:
                    port: 18211
            ",
                    None,
                )
                .unwrap();

            let group = group::new_group("scores_transport", 2 << 10, |key: &str| match key {
                "Tom" => Ok(b"630".to_vec()),
                _ => Err(anyhow::anyhow!("{} not exist", key)),
            });

            // A single-peer cluster: the pool always routes to the local loader...
            let pool = HttpPool::new("http://127.0.0.1:18211");
            pool.set(&["http://127.0.0.1:18211".to_owned()]);
            group.register_peers(pool.clone());

            let server = Server::new(node.clone(), config, "server", 8001, pool);
            Server::fork_and_await(&server).await;

            // A proper request is answered with an encoded envelope...
            let (status, body) = get("http://127.0.0.1:18211/_dcache/scores_transport/Tom").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(protocol::decode_response(&body).unwrap(), b"630".to_vec());

            // A path without a key cannot be routed...
            let (status, _) = get("http://127.0.0.1:18211/_dcache/scores_transport").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);

            // An unknown group yields a 404...
            let (status, body) = get("http://127.0.0.1:18211/_dcache/missing_group/Tom").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(String::from_utf8_lossy(&body), "no such group: missing_group");

            // A failing loader yields a 500 carrying the error text...
            let (status, body) = get("http://127.0.0.1:18211/_dcache/scores_transport/Nemo").await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(String::from_utf8_lossy(&body).contains("not exist"), true);

            node.terminate();
        });
    }
}
