//! Request/response matching over a channel that also carries unrelated traffic.
//!
//! Each request gets a locally unique id. The response (or error) tagged with
//! that id settles the request exactly once; timeouts, caller cancellation and
//! channel teardown all remove the entry so nothing leaks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Settle<T> = oneshot::Sender<Result<T>>;

struct Table<T> {
    pending: HashMap<String, Settle<T>>,
    /// Set by `fail_all`; later requests fail fast with this reason.
    closed: Option<String>,
}

pub struct Correlator<T> {
    table: Arc<Mutex<Table<T>>>,
    prefix: &'static str,
    what: &'static str,
    timeout: Duration,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            prefix: self.prefix,
            what: self.what,
            timeout: self.timeout,
        }
    }
}

/// Removes a pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a, T> {
    table: &'a Mutex<Table<T>>,
    id: String,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        lock(self.table).pending.remove(&self.id);
    }
}

fn lock<T>(table: &Mutex<Table<T>>) -> std::sync::MutexGuard<'_, Table<T>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Time + random id, e.g. `ss-1718000000000-3f9a1c2b7`.
pub fn new_request_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{millis}-{}", &entropy[..9])
}

impl<T: Send + 'static> Correlator<T> {
    /// `prefix` starts every generated id; `what` names the request in errors and logs.
    pub fn new(prefix: &'static str, what: &'static str, timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                pending: HashMap::new(),
                closed: None,
            })),
            prefix,
            what,
            timeout,
        }
    }

    /// Register a request, hand its id to `transmit`, and wait for the match.
    ///
    /// Fails fast if the correlator has been closed or if `transmit` fails.
    pub async fn send<F, Fut>(&self, transmit: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let id = new_request_id(self.prefix);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&self.table);
            if let Some(reason) = &table.closed {
                return Err(Error::Closed(reason.clone()));
            }
            table.pending.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            table: &self.table,
            id: id.clone(),
        };

        debug!(%id, what = self.what, "Sending request");
        transmit(id.clone()).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without settling: table torn down underneath us
            Ok(Err(_)) => Err(Error::Closed(format!("{} abandoned", self.what))),
            Err(_) => {
                warn!(%id, what = self.what, "Request timed out");
                Err(Error::Timeout {
                    what: self.what,
                    after: self.timeout,
                })
            }
        }
    }

    /// Settle `id` successfully. Returns false for unknown or already settled ids.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.settle(id, Ok(value))
    }

    /// Settle `id` with the remote side's error message.
    pub fn reject(&self, id: &str, message: impl Into<String>) -> bool {
        self.settle(id, Err(Error::Remote(message.into())))
    }

    fn settle(&self, id: &str, outcome: Result<T>) -> bool {
        let Some(tx) = lock(&self.table).pending.remove(id) else {
            warn!(id, what = self.what, "Response for unknown or already handled request");
            return false;
        };
        if tx.send(outcome).is_err() {
            debug!(id, what = self.what, "Requester went away before the response");
        }
        true
    }

    /// Reject every pending request and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut table = lock(&self.table);
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), what = self.what, reason, "Rejecting pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::Closed(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).pending.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.table).closed.is_some()
    }
}
