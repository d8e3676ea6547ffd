//! Represents the lifecycle of a cache process.
//!
//! A [Node] is little more than a central "is running" flag which is shared by all long
//! running tasks of the process (the server loops, the config watcher, ...). Once
//! [Node::terminate](Node::terminate) is invoked, all of these tasks wind down gracefully -
//! in-flight cache requests are still answered, but no new sockets are opened.
//!
//! For a deployable node, [terminate_on_signals](Node::terminate_on_signals) ties the
//! termination to the usual process signals.
//!
//! # Example
//!
//! ```
//! # use callisto::node::Node;
//! let node = Node::new();
//! assert_eq!(node.is_running(), true);
//!
//! node.terminate();
//! assert_eq!(node.is_running(), false);
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::spawn;

/// Keeps the central lifecycle flag of the process.
pub struct Node {
    is_running: AtomicBool,
}

impl Node {
    /// Creates a new node in the "running" state.
    pub fn new() -> Arc<Self> {
        Arc::new(Node {
            is_running: AtomicBool::new(true),
        })
    }

    /// Determines if the node is still running or if [terminate](Node::terminate) has already
    /// been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Initiates the shutdown of the process.
    ///
    /// All tasks observing this node will exit their loops within their next check interval.
    pub fn terminate(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    /// Terminates the given node once the process receives **CTRL-C** or **SIGHUP**.
    ///
    /// This forks a task which sleeps until one of the signals arrives and then simply calls
    /// [terminate](Node::terminate). Should the SIGHUP listener be unavailable (e.g. in exotic
    /// sandboxes), the node still reacts to CTRL-C.
    pub fn terminate_on_signals(node: &Arc<Node>) {
        let node = node.clone();
        spawn!(async move {
            let received = match tokio::signal::unix::signal(SignalKind::hangup()) {
                Ok(mut hangup) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => "CTRL-C",
                        _ = hangup.recv() => "SIGHUP",
                    }
                }
                Err(error) => {
                    log::warn!(
                        "Cannot listen for SIGHUP ({}). Only CTRL-C will stop this node...",
                        error
                    );
                    let _ = tokio::signal::ctrl_c().await;
                    "CTRL-C"
                }
            };

            log::info!("Received {}. Winding the cache node down...", received);
            node.terminate();
        });
    }
}
