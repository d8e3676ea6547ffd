//! Coalesces concurrent loads for the same key into a single execution.
//!
//! When many callers miss the cache for the same key at the same time, performing the expensive
//! load (a remote fetch or a hit on the backing data source) once is enough. The
//! [SingleFlight](SingleFlight) coordinator ensures that for each key at most one load is in
//! flight at any point in time. All concurrent callers for that key simply wait for the ongoing
//! load and share its outcome.
//!
//! The coordinator performs no caching whatsoever: once a call has completed and has been
//! removed from the in-flight map, the next caller starts a fresh execution. Longer term
//! memoization is the job of the [Group](crate::group::Group) cache.
//!
//! # Example
//!
//! ```
//! # use callisto::singleflight::SingleFlight;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let flights: SingleFlight<i32> = SingleFlight::new();
//!
//! let result = flights.execute("answer", async { Ok(42) }).await.unwrap();
//! assert_eq!(result, 42);
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Represents one in-flight load.
///
/// The first caller for a key creates a call, performs the work and publishes the outcome.
/// Everyone else arriving while the call is still listed simply awaits the completion signal.
struct Call<T> {
    done: Notify,
    result: Mutex<Option<Result<T, Arc<anyhow::Error>>>>,
}

/// Deduplicates concurrent executions which share a key.
///
/// Errors are wrapped in an **Arc** as a single failure is observed by every waiting caller.
pub struct SingleFlight<T: Clone> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    /// Creates a coordinator without any in-flight calls.
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given task unless a call for the same key is already in flight.
    ///
    /// The first caller for a key becomes the executor: it runs the task, publishes the outcome
    /// and removes the call again. Callers arriving in the meantime block until the completion
    /// signal fires and then observe the very same outcome. Callers arriving after the call has
    /// been removed trigger a fresh execution.
    ///
    /// The call is removed on every exit path of the executor. Should the executor be abandoned
    /// mid-flight (or panic), a guard publishes an error so that no waiter hangs forever.
    pub async fn execute<F>(&self, key: &str, task: F) -> Result<T, Arc<anyhow::Error>>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        // `true` means the call already existed (and therefore is owned by some other in-flight
        // execution), `false` means this caller just registered a brand new call.
        let (call_existed, call) = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(key) {
                Some(call) => (true, call.clone()),
                None => {
                    let call = Arc::new(Call {
                        done: Notify::new(),
                        result: Mutex::new(None),
                    });
                    let _ = calls.insert(key.to_owned(), call.clone());
                    (false, call)
                }
            }
        };

        if call_existed {
            // The completion signal has to be requested before re-checking the result.
            // Otherwise a completion occurring in between would be lost and we'd wait
            // forever...
            let done = call.done.notified();
            let existing_result = call.result.lock().unwrap().clone();
            if let Some(result) = existing_result {
                return result;
            }
            done.await;

            let final_result = call.result.lock().unwrap().clone();
            return match final_result {
                Some(result) => result,
                None => unreachable!(
                    "A single-flight call signalled completion without publishing a result!"
                ),
            };
        }

        let guard = CallGuard {
            calls: &self.calls,
            key,
            call: &call,
        };

        let result = task.await.map_err(Arc::new);
        *call.result.lock().unwrap() = Some(result.clone());
        drop(guard);

        result
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

/// Removes the call from the in-flight map once the executor is done.
///
/// Being a **Drop** implementation, this also runs if the executor panics or if its future is
/// dropped before completion. In that case a placeholder error is published so that all waiters
/// are released rather than stuck.
struct CallGuard<'a, T: Clone> {
    calls: &'a Mutex<HashMap<String, Arc<Call<T>>>>,
    key: &'a str,
    call: &'a Arc<Call<T>>,
}

impl<T: Clone> Drop for CallGuard<'_, T> {
    fn drop(&mut self) {
        {
            let mut calls = self.calls.lock().unwrap();
            if let Some(current) = calls.get(self.key) {
                if Arc::ptr_eq(current, self.call) {
                    let _ = calls.remove(self.key);
                }
            }
        }

        {
            let mut result = self.call.result.lock().unwrap();
            if result.is_none() {
                *result = Some(Err(Arc::new(anyhow::anyhow!(
                    "The load for this key was abandoned before it completed."
                ))));
            }
        }

        self.call.done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::singleflight::SingleFlight;
    use crate::testing::test_async;

    #[test]
    fn concurrent_calls_share_one_execution() {
        test_async(async {
            let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let flights = flights.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .execute("shared", async {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            // Yield long enough for all other callers to pile up behind us...
                            tokio::time::sleep(Duration::from_millis(25)).await;
                            Ok("value".to_owned())
                        })
                        .await
                }));
            }

            for task in tasks {
                let result = task.await.unwrap().unwrap();
                assert_eq!(result, "value");
            }

            assert_eq!(executions.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn sequential_calls_execute_again() {
        test_async(async {
            let flights: SingleFlight<i32> = SingleFlight::new();
            let executions = AtomicUsize::new(0);

            for _ in 0..2 {
                let result = flights
                    .execute("key", async {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
                    .unwrap();
                assert_eq!(result, 1);
            }

            // Once a call completed and was removed, the next caller starts a fresh one...
            assert_eq!(executions.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn failures_are_shared_and_not_sticky() {
        test_async(async {
            let flights: Arc<SingleFlight<i32>> = Arc::new(SingleFlight::new());
            let executions = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..4 {
                let flights = flights.clone();
                let executions = executions.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .execute("broken", async {
                            let _ = executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(25)).await;
                            Err(anyhow::anyhow!("no such entry"))
                        })
                        .await
                }));
            }

            // All concurrent callers observe the very same error...
            for task in tasks {
                let error = task.await.unwrap().unwrap_err();
                assert_eq!(error.to_string(), "no such entry");
            }
            assert_eq!(executions.load(Ordering::SeqCst), 1);

            // ...but the error is not cached: the next call executes again.
            let result = flights.execute("broken", async { Ok(42) }).await.unwrap();
            assert_eq!(result, 42);
            assert_eq!(executions.load(Ordering::SeqCst), 1);
        });
    }
}
