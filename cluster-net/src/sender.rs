//! Dedicated per-peer sender threads.
//!
//! Producers never write to a socket themselves when dedicated senders are
//! enabled. They push encoded messages into the peer's [`SendQueue`] and
//! return. One sender thread per connection to that peer drains the shared
//! queue, batches what it finds into a single frame (Nagling) and writes
//! the frame through its [`PeerConnection`].
//!
//! A failed write on the primary connection asks the table to reconnect and
//! resends the frame on the new connection. A failed write on any other
//! connection puts the batch back into the queue for the remaining senders
//! and stops that thread.

use {
    crate::{
        address::Address,
        codec::{BinaryMessage, FrameBuilder, FRAME_HEADER_LEN},
        connection::{Nic, PeerConnection, SocketSlot},
        error::{ClusterNetError, Result},
        message::Priority,
        stats::TransportStats,
    },
    log::*,
    parking_lot::{Condvar, Mutex},
    std::{
        collections::VecDeque,
        sync::{Arc, Weak},
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

// ── Queue ───────────────────────────────────────────────────────────────────

struct QueueState {
    lanes: [VecDeque<BinaryMessage>; 3],
    len: usize,
    closed: bool,
}

/// Bounded, closable three-lane priority queue of encoded messages.
pub struct SendQueue {
    peer: Address,
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    stats: Arc<TransportStats>,
}

impl SendQueue {
    pub fn new(peer: Address, capacity: usize, stats: Arc<TransportStats>) -> Self {
        Self {
            peer,
            capacity,
            state: Mutex::new(QueueState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                len: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            stats,
        }
    }

    /// Enqueue `msg` in the lane of its priority.
    pub fn add(&self, msg: BinaryMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClusterNetError::QueueClosed);
        }
        if state.len >= self.capacity {
            self.stats.queue_rejections.inc();
            return Err(ClusterNetError::QueueFull {
                peer: self.peer,
                capacity: self.capacity,
            });
        }
        state.lanes[msg.priority.lane()].push_back(msg);
        state.len = state.len.saturating_add(1);
        self.stats.queued_messages.inc();
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Put messages that could not be sent back at the head of their lanes,
    /// preserving their order. Capacity is not enforced.
    pub fn requeue(&self, msgs: impl DoubleEndedIterator<Item = BinaryMessage>) {
        let mut state = self.state.lock();
        for msg in msgs.rev() {
            state.lanes[msg.priority.lane()].push_front(msg);
            state.len = state.len.saturating_add(1);
            self.stats.queued_messages.inc();
        }
        drop(state);
        self.not_empty.notify_all();
    }

    /// Block until at least one message is queued, then move a batch into
    /// `out`.
    ///
    /// With `nagling_size` set, messages keep being taken while the frame
    /// they form stays within that many bytes. The first message is always
    /// taken.
    pub fn next_batch(
        &self,
        nagling_size: Option<usize>,
        out: &mut Vec<BinaryMessage>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        while state.len == 0 && !state.closed {
            self.not_empty.wait(&mut state);
        }
        if state.closed {
            return Err(ClusterNetError::QueueClosed);
        }

        let mut frame_len = FRAME_HEADER_LEN;
        'lanes: for priority in Priority::ALL {
            let lane = &mut state.lanes[priority.lane()];
            while let Some(next) = lane.front() {
                let grown = frame_len.saturating_add(next.size());
                if !out.is_empty() && !nagling_size.is_some_and(|limit| grown <= limit) {
                    break 'lanes;
                }
                frame_len = grown;
                out.extend(lane.pop_front());
            }
        }
        state.len = state.len.saturating_sub(out.len());
        self.stats.queued_messages.sub(out.len() as i64);
        Ok(())
    }

    /// Close the queue, waking every blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.stats.queued_messages.sub(state.len as i64);
        state.len = 0;
        state.lanes.iter_mut().for_each(VecDeque::clear);
        drop(state);
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ── Recovery hooks ──────────────────────────────────────────────────────────

/// What a sender needs from the connection table when a write fails.
pub trait ConnectionRecovery: Send + Sync {
    /// Re-dial `peer` and return the new primary connection.
    fn reconnect(&self, peer: &Address) -> Option<Arc<PeerConnection>>;
    /// A sender gave up on `conn`.
    fn sender_failed(&self, conn: &Arc<PeerConnection>);
}

fn is_primary_connection(conn: &PeerConnection) -> bool {
    conn.nic() == Nic::Primary && conn.slot() == SocketSlot::Primary
}

// ── Sender threads ──────────────────────────────────────────────────────────

/// Settings shared by every sender thread of a manager.
#[derive(Debug, Clone, Copy)]
pub struct SenderSettings {
    pub nagling_size: Option<usize>,
    pub frame_capacity: usize,
    pub resend_delay: Duration,
}

struct SenderHandle {
    nic: Nic,
    slot: SocketSlot,
    connection: Arc<Mutex<Arc<PeerConnection>>>,
    thread: JoinHandle<()>,
}

/// The sender threads and shared queue of one peer.
pub struct DedicatedSenderManager {
    peer: Address,
    queue: Arc<SendQueue>,
    senders: Mutex<Vec<SenderHandle>>,
    recovery: Weak<dyn ConnectionRecovery>,
    settings: SenderSettings,
    stats: Arc<TransportStats>,
}

impl DedicatedSenderManager {
    pub fn new(
        peer: Address,
        capacity: usize,
        settings: SenderSettings,
        recovery: Weak<dyn ConnectionRecovery>,
        stats: Arc<TransportStats>,
    ) -> Self {
        Self {
            peer,
            queue: Arc::new(SendQueue::new(peer, capacity, stats.clone())),
            senders: Mutex::new(Vec::new()),
            recovery,
            settings,
            stats,
        }
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.queue
    }

    pub fn enqueue(&self, msg: BinaryMessage) -> Result<()> {
        self.queue.add(msg)
    }

    /// Start a sender for `conn`, or point the running sender of the same
    /// NIC and socket slot at it.
    pub fn add_sender(&self, conn: Arc<PeerConnection>) -> Result<()> {
        let mut senders = self.senders.lock();
        senders.retain(|sender| !sender.thread.is_finished());
        if let Some(sender) = senders
            .iter()
            .find(|sender| sender.nic == conn.nic() && sender.slot == conn.slot())
        {
            *sender.connection.lock() = conn;
            return Ok(());
        }

        let nic = conn.nic();
        let slot = conn.slot();
        let connection = Arc::new(Mutex::new(conn));
        let context = SenderContext {
            peer: self.peer,
            queue: self.queue.clone(),
            connection: connection.clone(),
            recovery: self.recovery.clone(),
            settings: self.settings,
            stats: self.stats.clone(),
        };
        let thread = Builder::new()
            .name("cmDmSender".to_string())
            .spawn(move || context.run())?;
        senders.push(SenderHandle {
            nic,
            slot,
            connection,
            thread,
        });
        Ok(())
    }

    /// Close the queue and wait for every sender thread to exit.
    pub fn dispose(&self) {
        self.queue.close();
        let senders = std::mem::take(&mut *self.senders.lock());
        let current = thread::current().id();
        for sender in senders {
            if sender.thread.thread().id() != current && sender.thread.join().is_err() {
                warn!("sender thread for {} panicked", self.peer);
            }
        }
        debug!("disposed dedicated sender for {}", self.peer);
    }
}

struct SenderContext {
    peer: Address,
    queue: Arc<SendQueue>,
    connection: Arc<Mutex<Arc<PeerConnection>>>,
    recovery: Weak<dyn ConnectionRecovery>,
    settings: SenderSettings,
    stats: Arc<TransportStats>,
}

impl SenderContext {
    fn run(self) {
        let mut frame = FrameBuilder::with_capacity(self.settings.frame_capacity);
        let mut batch = Vec::new();
        loop {
            batch.clear();
            if let Err(e) = self.queue.next_batch(self.settings.nagling_size, &mut batch) {
                trace!("sender for {} stopping: {}", self.peer, e);
                return;
            }
            frame.clear();
            batch.iter().for_each(|msg| frame.push(msg));
            if batch.len() > 1 {
                self.stats.messages_batched.add(batch.len() as u64);
            }

            if let Some(conn) = self.send_frame(&mut frame, &mut batch) {
                if let Some(recovery) = self.recovery.upgrade() {
                    recovery.sender_failed(&conn);
                }
                return;
            }
        }
    }

    /// Write the frame, reconnecting the primary connection as needed.
    /// Returns the connection this sender gave up on.
    fn send_frame(
        &self,
        frame: &mut FrameBuilder,
        batch: &mut Vec<BinaryMessage>,
    ) -> Option<Arc<PeerConnection>> {
        loop {
            let conn = self.connection.lock().clone();
            let bytes = match frame.finish() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("dropping batch of {} for {}: {}", batch.len(), self.peer, e);
                    return None;
                }
            };
            let Err(e) = conn.send(&[bytes], None) else {
                return None;
            };
            if self.queue.is_closed() {
                trace!("sender for {} disposed during a failed send", self.peer);
                return None;
            }

            if !is_primary_connection(&conn) {
                debug!(
                    "secondary connection to {} failed ({}), requeueing {} messages",
                    self.peer,
                    e,
                    batch.len()
                );
                self.queue.requeue(batch.drain(..));
                return Some(conn);
            }
            if conn.is_leaving_gracefully() {
                return Some(conn);
            }

            warn!("send to {} failed ({}), reconnecting", self.peer, e);
            let reconnected = self
                .recovery
                .upgrade()
                .and_then(|recovery| recovery.reconnect(&self.peer));
            let Some(new_conn) = reconnected else {
                return Some(conn);
            };
            *self.connection.lock() = new_conn;
            if !self.settings.resend_delay.is_zero() {
                thread::sleep(self.settings.resend_delay);
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            codec::{decode_frame, encode_frame},
            connection::tests::{connected_pair_with, OwnerEvent},
            message::Message,
        },
        assert_matches::assert_matches,
        crossbeam_channel::{unbounded, Receiver, Sender},
    };

    fn peer() -> Address {
        "10.0.0.2:100".parse().unwrap()
    }

    fn encoded(body: Vec<u8>, priority: Priority) -> BinaryMessage {
        BinaryMessage::encode(&Message::new(None, body).with_priority(priority)).unwrap()
    }

    fn queue(capacity: usize) -> SendQueue {
        SendQueue::new(peer(), capacity, Arc::new(TransportStats::default()))
    }

    #[test]
    fn test_priority_lanes() {
        let queue = queue(10);
        queue.add(encoded(vec![3], Priority::Low)).unwrap();
        queue.add(encoded(vec![2], Priority::Normal)).unwrap();
        queue.add(encoded(vec![1], Priority::High)).unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let mut batch = Vec::new();
            queue.next_batch(None, &mut batch).unwrap();
            assert_eq!(batch.len(), 1);
            order.push(batch[0].priority);
        }
        assert_eq!(order, [Priority::High, Priority::Normal, Priority::Low]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_nagling_respects_size_limit() {
        let queue = queue(100);
        let one = encoded(vec![0; 100], Priority::Normal);
        let size = one.size();
        for _ in 0..10 {
            queue.add(one.clone()).unwrap();
        }

        let mut batch = Vec::new();
        queue
            .next_batch(Some(FRAME_HEADER_LEN + 3 * size), &mut batch)
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.len(), 7);

        // A limit smaller than one message still yields one message.
        batch.clear();
        queue.next_batch(Some(1), &mut batch).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_queue_full() {
        let queue = queue(2);
        queue.add(encoded(vec![], Priority::Normal)).unwrap();
        queue.add(encoded(vec![], Priority::Normal)).unwrap();
        assert_matches!(
            queue.add(encoded(vec![], Priority::Normal)),
            Err(ClusterNetError::QueueFull { capacity: 2, .. })
        );
        assert_eq!(queue.stats.queue_rejections.get(), 1);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = Arc::new(queue(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.next_batch(None, &mut Vec::new()))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_matches!(consumer.join().unwrap(), Err(ClusterNetError::QueueClosed));
        assert_matches!(
            queue.add(encoded(vec![], Priority::Normal)),
            Err(ClusterNetError::QueueClosed)
        );
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let queue = queue(10);
        queue.add(encoded(vec![3], Priority::Normal)).unwrap();
        queue.requeue(
            vec![
                encoded(vec![1], Priority::Normal),
                encoded(vec![2], Priority::Normal),
            ]
            .into_iter(),
        );
        let mut batch = Vec::new();
        queue.next_batch(Some(usize::MAX), &mut batch).unwrap();
        let bodies = decode_frame(&encode_frame(&batch).unwrap())
            .unwrap()
            .into_iter()
            .map(|msg| msg.body)
            .collect::<Vec<_>>();
        assert_eq!(bodies, [vec![1], vec![2], vec![3]]);
        assert_eq!(queue.stats.queued_messages.get(), 0);
    }

    #[derive(Default)]
    struct MockRecovery {
        replacement: Mutex<Option<Arc<PeerConnection>>>,
        failed: Mutex<Vec<Address>>,
        notify: Mutex<Option<Sender<()>>>,
    }

    impl ConnectionRecovery for MockRecovery {
        fn reconnect(&self, _peer: &Address) -> Option<Arc<PeerConnection>> {
            self.replacement.lock().take()
        }
        fn sender_failed(&self, conn: &Arc<PeerConnection>) {
            self.failed.lock().push(conn.peer());
            if let Some(notify) = self.notify.lock().as_ref() {
                let _ = notify.send(());
            }
        }
    }

    fn settings() -> SenderSettings {
        SenderSettings {
            nagling_size: Some(64 * 1024),
            frame_capacity: 64 * 1024,
            resend_delay: Duration::ZERO,
        }
    }

    fn manager(
        recovery: &Arc<MockRecovery>,
        stats: Arc<TransportStats>,
    ) -> DedicatedSenderManager {
        let weak: Weak<dyn ConnectionRecovery> =
            Arc::downgrade(recovery) as Weak<dyn ConnectionRecovery>;
        DedicatedSenderManager::new(peer(), 1_000, settings(), weak, stats)
    }

    fn expect_bodies(events: &Receiver<OwnerEvent>, count: u8) {
        for i in 0..count {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                OwnerEvent::Delivered(msg) => assert_eq!(msg.body, vec![i]),
                _ => panic!("unexpected event"),
            }
        }
    }

    #[test]
    fn test_queued_messages_go_out_in_one_frame() {
        let stats = Arc::new(TransportStats::default());
        let ((a, _oa, _ea), (_b, _ob, events_b)) =
            connected_pair_with(stats.clone(), SocketSlot::Primary);
        let recovery = Arc::new(MockRecovery::default());
        let manager = manager(&recovery, stats.clone());
        for i in 0..20u8 {
            manager.enqueue(encoded(vec![i], Priority::Normal)).unwrap();
        }
        manager.add_sender(a).unwrap();

        expect_bodies(&events_b, 20);
        assert_eq!(stats.frames_sent.get(), 1);
        assert_eq!(stats.messages_batched.get(), 20);
        manager.dispose();
        assert!(recovery.failed.lock().is_empty());
    }

    #[test]
    fn test_secondary_failure_requeues_batch() {
        let stats = Arc::new(TransportStats::default());
        let ((a, _oa, _ea), _b) = connected_pair_with(stats.clone(), SocketSlot::Secondary);
        a.destroy();
        let recovery = Arc::new(MockRecovery::default());
        let (notify, notified) = unbounded();
        *recovery.notify.lock() = Some(notify);
        let manager = manager(&recovery, stats);
        manager.add_sender(a).unwrap();
        manager.enqueue(encoded(vec![1], Priority::Normal)).unwrap();

        notified.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(manager.queue().len(), 1);
        assert_eq!(recovery.failed.lock().len(), 1);
        manager.dispose();
    }

    #[test]
    fn test_primary_failure_reconnects_and_resends() {
        let stats = Arc::new(TransportStats::default());
        let ((old, _oa, _ea), _b) = connected_pair_with(stats.clone(), SocketSlot::Primary);
        let ((fresh, _ofa, _efa), (_fresh_b, _ofb, fresh_events)) =
            connected_pair_with(stats.clone(), SocketSlot::Primary);
        old.destroy();

        let recovery = Arc::new(MockRecovery::default());
        *recovery.replacement.lock() = Some(fresh);
        let manager = manager(&recovery, stats);
        manager.add_sender(old).unwrap();
        manager.enqueue(encoded(vec![0], Priority::Normal)).unwrap();
        manager.enqueue(encoded(vec![1], Priority::Normal)).unwrap();

        expect_bodies(&fresh_events, 2);
        assert!(recovery.failed.lock().is_empty());
        manager.dispose();
    }

    #[test]
    fn test_primary_failure_without_reconnect_gives_up() {
        let stats = Arc::new(TransportStats::default());
        let ((a, _oa, _ea), _b) = connected_pair_with(stats.clone(), SocketSlot::Primary);
        a.destroy();
        let recovery = Arc::new(MockRecovery::default());
        let (notify, notified) = unbounded();
        *recovery.notify.lock() = Some(notify);
        let manager = manager(&recovery, stats);
        manager.add_sender(a).unwrap();
        manager.enqueue(encoded(vec![1], Priority::Normal)).unwrap();

        notified.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(recovery.failed.lock().as_slice(), &[peer()]);
        manager.dispose();
    }
}
