use std::collections::HashMap;
use std::panic::{set_hook, take_hook};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use clap::Parser;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};

use callisto::group::{self, Group};
use callisto::http::HttpPool;
use callisto::node::Node;
use callisto::server::{HttpHandler, Server};

/// A ready-to-run callisto cache node.
///
/// Each node serves its share of the "scores" group. Start three of them (ports 8001, 8002 and
/// 8003) to obtain a complete cluster and add `--api` to one of them to expose the public
/// front-end on port 9999.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port on which the peer transport of this node listens.
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Also start the public API front-end on port 9999.
    #[arg(long)]
    api: bool,
}

lazy_static::lazy_static! {
    /// Stands in for the slow backing database behind the cache.
    static ref DB: HashMap<&'static str, &'static str> = {
        let mut db = HashMap::new();
        let _ = db.insert("Tom", "630");
        let _ = db.insert("Jack", "589");
        let _ = db.insert("Sam", "567");
        db
    };
}

/// Creates the "scores" group backed by the sample database.
fn create_group(cache_bytes: usize) -> Arc<Group> {
    group::new_group("scores", cache_bytes, |key: &str| {
        log::info!("[SlowDB] searching for {}...", key);
        match DB.get(key) {
            Some(value) => Ok(value.as_bytes().to_vec()),
            None => Err(anyhow::anyhow!("{} not exist", key)),
        }
    })
}

/// Serves `GET /api?key=...` by delegating to the local group.
///
/// In contrast to the peer transport, this hands out the raw value bytes without any envelope,
/// as its clients are end users and not other cache nodes.
struct ApiHandler {
    group: Arc<Group>,
}

#[async_trait]
impl HttpHandler for ApiHandler {
    async fn handle(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
        if request.uri().path() != "/api" {
            let mut response = Response::new(Body::from("not found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }

        let key = query_parameter(request.uri().query(), "key").unwrap_or_default();

        match self.group.get(&key).await {
            Ok(view) => {
                let mut response = Response::new(Body::from(view.to_vec()));
                let _ = response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                Ok(response)
            }
            Err(error) => {
                let mut response = Response::new(Body::from(error.to_string()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                Ok(response)
            }
        }
    }
}

/// Extracts a single parameter from a query string.
fn query_parameter(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            urlencoding::decode(value).ok().map(|value| value.into_owned())
        } else {
            None
        }
    })
}

/// Turns every panic into a process exit.
///
/// A panicking task would otherwise leave the node in a half-dead state: its sockets stay
/// open and peers keep routing keys here, but nobody answers anymore. Dying loudly instead
/// lets the supervisor (docker-compose, systemd, ...) replace the node with a healthy
/// instance.
fn abort_on_panic() {
    let default_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        default_handler(panic_info);
        eprintln!("A task panicked - terminating this cache node so it can be restarted cleanly.");
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() {
    abort_on_panic();

    let args = Args::parse();

    callisto::init_logging();
    log::info!(
        "||. CALLISTO (v {} - rev {}) running on {} core(s) in {} CPU(s)",
        callisto::CALLISTO_VERSION,
        callisto::CALLISTO_REVISION,
        num_cpus::get(),
        num_cpus::get_physical()
    );

    let node = Node::new();
    Node::terminate_on_signals(&node);

    let config = callisto::config::install(node.clone()).await;

    // The cache size can be tuned via settings.yml before the command line flags are applied
    // on top...
    let cache_bytes = match config.current().config()["cache"]["max_memory"].as_str() {
        Some(size) => match callisto::fmt::parse_size(size) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::error!("Ignoring cache.max_memory: {}", error);
                2 << 10
            }
        },
        None => 2 << 10,
    };

    if let Err(error) = config.load_from_string(
        &format!("server:\n    port: {}\napi:\n    port: 9999\n", args.port),
        Some(SystemTime::now()),
    ) {
        log::error!("Failed to apply the command line settings: {}", error);
    }

    let group = create_group(cache_bytes);

    // The cluster is a static set of three local processes. Every node knows the full list, so
    // all of them route a given key to the same owner...
    let self_address = format!("http://localhost:{}", args.port);
    let peers = [8001, 8002, 8003]
        .iter()
        .map(|port| format!("http://localhost:{}", port))
        .collect::<Vec<_>>();

    let pool = HttpPool::new(&self_address);
    pool.set(&peers);
    group.register_peers(pool.clone());

    if args.api {
        let api_server = Server::new(
            node.clone(),
            config.clone(),
            "api",
            9999,
            Arc::new(ApiHandler {
                group: group.clone(),
            }),
        );
        log::info!("API front-end is running at http://localhost:9999/api...");
        callisto::spawn!(async move { api_server.event_loop().await });
    }

    log::info!("Cache node is running at {}...", self_address);
    Server::new(node, config, "server", 8001, pool).event_loop().await;
}
