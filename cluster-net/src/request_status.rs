//! Per-sender record of the requests this node has accepted.
//!
//! Every inbound request is recorded as `ReceivedNotProcessed` on arrival
//! and moved to `Processed` once its reply is on its way. A requester that
//! has waited too long asks for this record (see
//! [`HeaderType::GetReqStatus`]) to tell a lost request from a slow one.
//!
//! Records expire a fixed time after arrival. A [`StatusCleaner`] thread
//! sweeps them periodically.
//!
//! [`HeaderType::GetReqStatus`]: crate::header::HeaderType::GetReqStatus

use {
    crate::{address::Address, error::Result, header::RequestState},
    crossbeam_channel::{bounded, RecvTimeoutError, Sender},
    log::*,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::Arc,
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, Copy)]
struct StatusEntry {
    state: RequestState,
    arrived_at: Instant,
}

/// Request states keyed by sender, then by request id.
#[derive(Debug)]
pub struct RequestStatusTable {
    expiry: Duration,
    nodes: Mutex<HashMap<Address, HashMap<i64, StatusEntry>>>,
}

impl RequestStatusTable {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_arrived(&self, req_id: i64, node: &Address) {
        self.nodes.lock().entry(*node).or_default().insert(
            req_id,
            StatusEntry {
                state: RequestState::ReceivedNotProcessed,
                arrived_at: Instant::now(),
            },
        );
    }

    /// Only requests recorded by [`mark_arrived`](Self::mark_arrived) and
    /// not yet swept are updated.
    pub fn mark_processed(&self, req_id: i64, node: &Address) {
        if let Some(entry) = self
            .nodes
            .lock()
            .get_mut(node)
            .and_then(|requests| requests.get_mut(&req_id))
        {
            entry.state = RequestState::Processed;
        }
    }

    pub fn status(&self, req_id: i64, node: &Address) -> RequestState {
        self.nodes
            .lock()
            .get(node)
            .and_then(|requests| requests.get(&req_id))
            .map(|entry| entry.state)
            .unwrap_or(RequestState::NotReceived)
    }

    /// Forget everything recorded for `node`, e.g. after it left the view.
    pub fn remove_node(&self, node: &Address) {
        self.nodes.lock().remove(node);
    }

    /// Drop expired records. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut nodes = self.nodes.lock();
        for requests in nodes.values_mut() {
            let before = requests.len();
            requests.retain(|_, entry| now.duration_since(entry.arrived_at) < self.expiry);
            removed += before - requests.len();
        }
        nodes.retain(|_, requests| !requests.is_empty());
        removed
    }

    /// Number of live records across all senders.
    pub fn len(&self) -> usize {
        self.nodes.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Cleaner ─────────────────────────────────────────────────────────────────

/// Background thread that sweeps a [`RequestStatusTable`].
pub(crate) struct StatusCleaner {
    exit: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StatusCleaner {
    pub(crate) fn start(table: Arc<RequestStatusTable>, interval: Duration) -> Result<Self> {
        let (exit_sender, exit) = bounded::<()>(1);
        let thread = Builder::new()
            .name("cmReqStatusGc".to_string())
            .spawn(move || loop {
                match exit.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let removed = table.sweep();
                if removed > 0 {
                    debug!(
                        "request status sweep removed {} record(s), {} left",
                        removed,
                        table.len()
                    );
                }
            })?;
        Ok(Self {
            exit: Mutex::new(Some(exit_sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn stop(&self) {
        drop(self.exit.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("request status cleaner panicked");
            }
        }
    }
}

impl Drop for StatusCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread::sleep};

    fn node(port: u16) -> Address {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_arrived_then_processed() {
        let table = RequestStatusTable::new(Duration::from_secs(15));
        let a = node(1);
        assert_eq!(table.status(7, &a), RequestState::NotReceived);

        table.mark_arrived(7, &a);
        assert_eq!(table.status(7, &a), RequestState::ReceivedNotProcessed);
        table.mark_processed(7, &a);
        assert_eq!(table.status(7, &a), RequestState::Processed);

        // Same id from another sender is a different request.
        assert_eq!(table.status(7, &node(2)), RequestState::NotReceived);
    }

    #[test]
    fn test_processed_without_arrival_is_ignored() {
        let table = RequestStatusTable::new(Duration::from_secs(15));
        table.mark_processed(3, &node(1));
        assert!(table.is_empty());
        assert_eq!(table.status(3, &node(1)), RequestState::NotReceived);
    }

    #[test]
    fn test_sweep_drops_expired_records() {
        let table = RequestStatusTable::new(Duration::from_millis(50));
        table.mark_arrived(1, &node(1));
        table.mark_arrived(2, &node(2));
        assert_eq!(table.sweep(), 0);

        sleep(Duration::from_millis(80));
        table.mark_arrived(3, &node(2));
        assert_eq!(table.sweep(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.status(3, &node(2)), RequestState::ReceivedNotProcessed);
    }

    #[test]
    fn test_remove_node() {
        let table = RequestStatusTable::new(Duration::from_secs(15));
        table.mark_arrived(1, &node(1));
        table.mark_arrived(1, &node(2));
        table.remove_node(&node(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.status(1, &node(1)), RequestState::NotReceived);
    }

    #[test]
    fn test_cleaner_sweeps_in_background() {
        let table = Arc::new(RequestStatusTable::new(Duration::from_millis(20)));
        table.mark_arrived(1, &node(1));
        let cleaner = StatusCleaner::start(table.clone(), Duration::from_millis(10)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !table.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(10));
        }
        assert!(table.is_empty());
        cleaner.stop();
        // Stopping twice is harmless.
        cleaner.stop();
    }
}
