//! Request/response correlation over the cluster transport.
//!
//! ```text
//!   GroupRequest ──send_request(id)──► RequestCorrelator ──► Transport
//!        ▲                                  │    ▲
//!        │ receive_response / suspect /     │    │ Event::Msg (REQ, RSP, ...)
//!        │ view_change                      ▼    │
//!        └────────── pending[id] ◄──── receive(event)
//!                                           │
//!                                           ▼
//!                                    RequestHandler
//! ```
//!
//! Every correlated message carries a [`CorrelatorHeader`]. Requests are
//! handed to the [`RequestHandler`] and answered with a reply carrying the
//! same id; replies are routed to the [`RspCollector`] registered under
//! that id. Replies always carry a bincode [`ResponsePayload`], so a
//! handler error reaches the caller as `Failure` instead of a timeout.
//!
//! n-hop requests let a node forward work to a next hop which answers the
//! original requester directly. The first hop tells the requester, through
//! `expect_response_from`, to wait for that extra reply.

use {
    crate::{
        address::{Address, View},
        config::CorrelatorConfig,
        error::Result,
        group_request::GroupRequest,
        header::{CorrelatorHeader, HeaderType, RequestState, ResponsePayload},
        message::{Header, Message, MessageFlags},
        request_status::{RequestStatusTable, StatusCleaner},
        transport::{MessageReceiver, Transport},
    },
    log::*,
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
};

/// Inputs the correlator reacts to.
#[derive(Debug, Clone)]
pub enum Event {
    Msg(Message),
    Suspect(Address),
    ViewChange(View),
    SetLocalAddress(Address),
    /// The sequencer restarted its numbering; collectors may re-enquire.
    ResetSequence,
}

/// Error returned by a [`RequestHandler`]. The text travels back to the
/// requester as [`ResponsePayload::Failure`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Answer of a handler to an n-hop request.
#[derive(Debug, Clone)]
pub struct NHopResponse {
    /// Reply body for the requester.
    pub value: Vec<u8>,
    /// Message to forward and the node that must receive it. That node
    /// answers the original requester directly.
    pub next_hop: Option<(Address, Message)>,
}

/// Application logic invoked for every inbound request.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Message) -> std::result::Result<Vec<u8>, HandlerError>;

    fn handle_nhop_request(
        &self,
        request: &Message,
    ) -> std::result::Result<NHopResponse, HandlerError> {
        self.handle(request).map(|value| NHopResponse {
            value,
            next_hop: None,
        })
    }
}

/// Receives the replies and membership events of one pending request.
pub trait RspCollector: Send + Sync {
    fn receive_response(&self, msg: Message);

    fn suspect(&self, member: &Address);

    fn view_change(&self, view: &View);

    /// An n-hop reply announced that `from` will answer as well.
    fn expect_nhop_response(&self, _from: &Address) {}

    fn sequence_reset(&self) {}
}

pub struct RequestCorrelator {
    config: CorrelatorConfig,
    transport: Arc<dyn Transport>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    /// Messages without a correlator header are passed here.
    upstream: RwLock<Option<Arc<dyn MessageReceiver>>>,
    pending: RwLock<HashMap<i64, Arc<dyn RspCollector>>>,
    last_req_id: Mutex<i64>,
    /// Members of the last installed view; `None` until the first one.
    members: RwLock<Option<Vec<Address>>>,
    local: RwLock<Option<Address>>,
    stop_replying: AtomicBool,
    statuses: Arc<RequestStatusTable>,
    cleaner: Mutex<Option<StatusCleaner>>,
}

impl RequestCorrelator {
    pub fn new(config: CorrelatorConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let statuses = Arc::new(RequestStatusTable::new(Duration::from_millis(
            config.status_expiry_ms,
        )));
        Arc::new(Self {
            config,
            transport,
            handler: RwLock::new(None),
            upstream: RwLock::new(None),
            pending: RwLock::new(HashMap::new()),
            last_req_id: Mutex::new(-1),
            members: RwLock::new(None),
            local: RwLock::new(None),
            stop_replying: AtomicBool::new(false),
            statuses,
            cleaner: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_upstream(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.upstream.write() = Some(receiver);
    }

    /// Start the request-status cleaner.
    pub fn start(&self) -> Result<()> {
        self.config.validate()?;
        let mut cleaner = self.cleaner.lock();
        if cleaner.is_none() {
            *cleaner = Some(StatusCleaner::start(
                self.statuses.clone(),
                Duration::from_millis(self.config.status_sweep_interval_ms),
            )?);
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.stop();
        }
    }

    /// Suppress replies, e.g. while the node is leaving the cluster.
    pub fn stop_replying(&self) {
        self.stop_replying.store(true, Ordering::Release);
    }

    pub fn start_replying(&self) {
        self.stop_replying.store(false, Ordering::Release);
    }

    pub fn local_address(&self) -> Option<Address> {
        let local = *self.local.read();
        local.or_else(|| self.transport.local_address())
    }

    pub fn statuses(&self) -> &RequestStatusTable {
        &self.statuses
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_member(&self, addr: &Address) -> bool {
        self.members
            .read()
            .as_ref()
            .is_some_and(|members| members.contains(addr))
    }

    // ── Sending ─────────────────────────────────────────────────────────────

    /// Allocate a request id. Ids count up from 0, wrap to 0 after
    /// `i64::MAX` and skip ids that are still pending.
    pub fn next_request_id(&self) -> i64 {
        let mut last = self.last_req_id.lock();
        let pending = self.pending.read();
        loop {
            *last = if *last == i64::MAX { 0 } else { *last + 1 };
            if !pending.contains_key(&*last) {
                return *last;
            }
        }
    }

    /// Send `msg` to `dests` as request `id`. With a collector the request
    /// expects replies, which are routed to it until [`done`](Self::done).
    pub fn send_request(
        &self,
        id: i64,
        dests: &[Address],
        msg: Message,
        collector: Option<Arc<dyn RspCollector>>,
    ) -> Result<()> {
        let hdr = CorrelatorHeader::new(HeaderType::Req, id, collector.is_some());
        self.dispatch(hdr, dests, msg, collector)
    }

    /// Like [`send_request`](Self::send_request), but receivers run
    /// [`RequestHandler::handle_nhop_request`].
    pub fn send_nhop_request(
        &self,
        id: i64,
        dests: &[Address],
        msg: Message,
        collector: Option<Arc<dyn RspCollector>>,
    ) -> Result<()> {
        let hdr = CorrelatorHeader::new(HeaderType::NHopReq, id, collector.is_some());
        self.dispatch(hdr, dests, msg, collector)
    }

    /// Ask `dests` what they know about request `status_req_id`.
    pub(crate) fn send_status_request(
        &self,
        id: i64,
        dests: &[Address],
        msg: Message,
        collector: Option<Arc<dyn RspCollector>>,
        status_req_id: i64,
    ) -> Result<()> {
        let mut hdr = CorrelatorHeader::new(HeaderType::GetReqStatus, id, collector.is_some());
        hdr.status_req_id = status_req_id;
        self.dispatch(hdr, dests, msg, collector)
    }

    fn dispatch(
        &self,
        mut hdr: CorrelatorHeader,
        dests: &[Address],
        mut msg: Message,
        collector: Option<Arc<dyn RspCollector>>,
    ) -> Result<()> {
        match dests {
            [dest] => {
                msg.dest = Some(*dest);
                msg.dests = None;
            }
            _ => {
                msg.dest = None;
                msg.dests = Some(dests.to_vec());
                hdr.dest_members = Some(dests.to_vec());
            }
        }
        if let Some(collector) = collector {
            msg.flags.insert(MessageFlags::RESPONSE_EXPECTED);
            self.pending.write().insert(hdr.id, collector.clone());
            // Nodes outside the view will never answer.
            let unknown: Vec<Address> = match self.members.read().as_ref() {
                Some(members) => dests
                    .iter()
                    .filter(|dest| !members.contains(dest))
                    .copied()
                    .collect(),
                None => Vec::new(),
            };
            for dest in &unknown {
                debug!("request {}: {} is not a member, suspecting it", hdr.id, dest);
                collector.suspect(dest);
            }
        }
        trace!("sending {} {} to {:?}", hdr.kind(), hdr.id, dests);
        msg.put_header(Header::Correlator(hdr));
        self.transport.send(msg)
    }

    /// Forget request `id`. Late replies are dropped afterwards.
    pub fn done(&self, id: i64) {
        self.pending.write().remove(&id);
    }

    /// Query `nodes` for the state of request `req_id`. Nodes that do not
    /// answer within `status_fetch_timeout_ms` map to `None`.
    pub fn fetch_request_status(
        self: &Arc<Self>,
        nodes: &[Address],
        cluster_membership: &[Address],
        req_id: i64,
    ) -> HashMap<Address, Option<RequestState>> {
        if nodes.is_empty() {
            return HashMap::new();
        }
        let request = GroupRequest::status_query(
            self.clone(),
            nodes.to_vec(),
            cluster_membership.to_vec(),
            req_id,
            Duration::from_millis(self.config.status_fetch_timeout_ms),
        );
        request.execute();
        request
            .results()
            .iter()
            .map(|rsp| {
                let state = match rsp.payload() {
                    Some(Ok(ResponsePayload::Status(state))) => Some(state),
                    Some(Ok(other)) => {
                        warn!("unexpected status reply from {}: {:?}", rsp.sender, other);
                        None
                    }
                    Some(Err(e)) => {
                        warn!("undecodable status reply from {}: {}", rsp.sender, e);
                        None
                    }
                    None => None,
                };
                debug!("request {} on {}: {:?}", req_id, rsp.sender, state);
                (rsp.sender, state)
            })
            .collect()
    }

    // ── Receiving ───────────────────────────────────────────────────────────

    pub fn receive(&self, event: Event) {
        match event {
            Event::Msg(msg) => self.receive_message(msg),
            Event::Suspect(member) => {
                debug!("suspecting {}", member);
                for collector in self.collectors() {
                    collector.suspect(&member);
                }
            }
            Event::ViewChange(view) => self.receive_view(&view),
            Event::SetLocalAddress(addr) => *self.local.write() = Some(addr),
            Event::ResetSequence => {
                for collector in self.collectors() {
                    collector.sequence_reset();
                }
            }
        }
    }

    fn collectors(&self) -> Vec<Arc<dyn RspCollector>> {
        self.pending.read().values().cloned().collect()
    }

    fn find(&self, id: i64) -> Option<Arc<dyn RspCollector>> {
        self.pending.read().get(&id).cloned()
    }

    fn receive_view(&self, view: &View) {
        let departed: Vec<Address> = {
            let mut members = self.members.write();
            let departed = members
                .as_ref()
                .map(|old| {
                    old.iter()
                        .filter(|member| !view.contains(member))
                        .copied()
                        .collect()
                })
                .unwrap_or_default();
            *members = Some(view.members.clone());
            departed
        };
        info!("view {} installed with {} member(s)", view.id, view.members.len());
        for collector in self.collectors() {
            collector.view_change(view);
        }
        for member in &departed {
            self.statuses.remove_node(member);
        }
    }

    fn receive_message(&self, msg: Message) {
        let Some(hdr) = msg.correlator_header().cloned() else {
            match self.upstream.read().clone() {
                Some(upstream) => upstream.receive(msg),
                None => trace!("dropping uncorrelated {} message", msg.kind()),
            }
            return;
        };
        if let (Some(dests), Some(local)) = (&hdr.dest_members, self.local_address()) {
            if !dests.contains(&local) {
                debug!(
                    "discarding {} {} from {:?}: not addressed to {}",
                    hdr.kind(),
                    hdr.id,
                    msg.src,
                    local
                );
                return;
            }
        }
        if !hdr.do_process {
            return;
        }

        match hdr.header_type {
            HeaderType::Req | HeaderType::GetReqStatus => self.handle_request(msg, &hdr),
            HeaderType::NHopReq => self.handle_nhop_request(msg, &hdr),
            HeaderType::Rsp | HeaderType::GetReqStatusRsp => {
                let mut msg = msg;
                msg.remove_correlator_header();
                match self.find(hdr.id) {
                    Some(collector) => collector.receive_response(msg),
                    None => trace!("no pending request {} for reply from {:?}", hdr.id, msg.src),
                }
            }
            HeaderType::NHopRsp => {
                let mut msg = msg;
                msg.remove_correlator_header();
                if let Some(collector) = self.find(hdr.id) {
                    if let Some(from) = &hdr.expect_response_from {
                        collector.expect_nhop_response(from);
                    }
                    collector.receive_response(msg);
                }
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().clone()
    }

    fn handle_request(&self, mut req: Message, hdr: &CorrelatorHeader) {
        req.remove_correlator_header();
        let Some(src) = req.src else {
            warn!("{} {} has no source; dropping", hdr.kind(), hdr.id);
            return;
        };

        if hdr.header_type == HeaderType::GetReqStatus {
            let state = self.statuses.status(hdr.status_req_id, &src);
            debug!("status of request {} from {}: {:?}", hdr.status_req_id, src, state);
            if hdr.rsp_expected {
                self.send_reply(
                    src,
                    hdr.id,
                    HeaderType::GetReqStatusRsp,
                    &ResponsePayload::Status(state),
                    None,
                );
            }
            return;
        }

        let Some(handler) = self.handler() else {
            debug!("no request handler; dropping request {} from {}", hdr.id, src);
            return;
        };
        self.statuses.mark_arrived(hdr.id, &src);
        let payload = match handler.handle(&req) {
            Ok(value) => ResponsePayload::Value(value),
            Err(e) => {
                warn!("request {} from {} failed: {}", hdr.id, src, e);
                ResponsePayload::Failure(e.to_string())
            }
        };
        if hdr.rsp_expected {
            let reply_to = hdr.whom_to_reply.unwrap_or(src);
            self.send_reply(reply_to, hdr.id, HeaderType::Rsp, &payload, None);
        }
        self.statuses.mark_processed(hdr.id, &src);
    }

    fn handle_nhop_request(&self, mut req: Message, hdr: &CorrelatorHeader) {
        req.remove_correlator_header();
        let Some(src) = req.src else {
            warn!("n-hop request {} has no source; dropping", hdr.id);
            return;
        };
        let Some(handler) = self.handler() else {
            debug!("no request handler; dropping n-hop request {} from {}", hdr.id, src);
            return;
        };
        self.statuses.mark_arrived(hdr.id, &src);
        let (payload, next_hop) = match handler.handle_nhop_request(&req) {
            Ok(NHopResponse { value, next_hop }) => (ResponsePayload::Value(value), next_hop),
            Err(e) => {
                warn!("n-hop request {} from {} failed: {}", hdr.id, src, e);
                (ResponsePayload::Failure(e.to_string()), None)
            }
        };
        if !hdr.rsp_expected || self.stop_replying.load(Ordering::Acquire) {
            self.statuses.mark_processed(hdr.id, &src);
            return;
        }

        let expect_from = next_hop.map(|(next, mut forward)| {
            let mut fwd_hdr = CorrelatorHeader::new(HeaderType::Req, hdr.id, true);
            fwd_hdr.whom_to_reply = Some(src);
            forward.dest = Some(next);
            forward.dests = None;
            forward.flags.insert(MessageFlags::RESPONSE_EXPECTED);
            forward.put_header(Header::Correlator(fwd_hdr));
            // A lost forward shows up at the requester as a suspect or timeout.
            if let Err(e) = self.transport.send(forward) {
                warn!("failed to forward request {} to {}: {}", hdr.id, next, e);
            }
            next
        });
        self.send_reply(src, hdr.id, HeaderType::NHopRsp, &payload, expect_from);
        self.statuses.mark_processed(hdr.id, &src);
    }

    fn send_reply(
        &self,
        dest: Address,
        id: i64,
        header_type: HeaderType,
        payload: &ResponsePayload,
        expect_response_from: Option<Address>,
    ) {
        if self.stop_replying.load(Ordering::Acquire) {
            trace!("not replying to {} {}", dest, id);
            return;
        }
        let body = match payload.encode() {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode reply {} for {}: {}", id, dest, e);
                return;
            }
        };
        let mut rsp = Message::new(Some(dest), body);
        let mut hdr = CorrelatorHeader::new(header_type, id, false);
        hdr.expect_response_from = expect_response_from;
        rsp.put_header(Header::Correlator(hdr));

        let local = self.local_address();
        if local == Some(dest) {
            rsp.src = local;
            self.receive_message(rsp);
            return;
        }
        trace!("sending reply {} to {}", id, dest);
        if let Err(e) = self.transport.send(rsp) {
            warn!("failed to send reply {} to {}: {}", id, dest, e);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_request_id(&self, id: i64) {
        *self.last_req_id.lock() = id;
    }
}

impl MessageReceiver for RequestCorrelator {
    fn receive(&self, msg: Message) {
        RequestCorrelator::receive(self, Event::Msg(msg));
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            error::ClusterNetError,
            group_request::{ResponseMode, RspStatus},
        },
        assert_matches::assert_matches,
        std::{collections::HashSet, sync::Weak},
    };

    /// Routes messages between correlators in memory, on the sending thread.
    #[derive(Default)]
    pub(crate) struct Hub {
        nodes: RwLock<HashMap<Address, Weak<RequestCorrelator>>>,
        unreachable: RwLock<HashSet<Address>>,
        drop_next: Mutex<HashSet<Address>>,
    }

    impl Hub {
        pub(crate) fn join(
            self: &Arc<Self>,
            addr: Address,
            config: CorrelatorConfig,
        ) -> Arc<RequestCorrelator> {
            let transport = Arc::new(HubTransport {
                hub: self.clone(),
                local: addr,
            });
            let corr = RequestCorrelator::new(config, transport);
            self.nodes.write().insert(addr, Arc::downgrade(&corr));
            corr
        }

        /// Messages to `addr` are silently lost.
        pub(crate) fn cut(&self, addr: Address) {
            self.unreachable.write().insert(addr);
        }

        pub(crate) fn heal(&self, addr: &Address) {
            self.unreachable.write().remove(addr);
        }

        /// Lose only the next message sent to `addr`.
        pub(crate) fn drop_next(&self, addr: Address) {
            self.drop_next.lock().insert(addr);
        }

        fn deliver(&self, from: Address, dest: Address, mut msg: Message) -> Result<()> {
            if self.unreachable.read().contains(&dest) || self.drop_next.lock().remove(&dest) {
                return Ok(());
            }
            let corr = self.nodes.read().get(&dest).and_then(Weak::upgrade);
            let corr = corr.ok_or_else(|| {
                ClusterNetError::ConnectionFailed(dest, "unknown node".to_string())
            })?;
            msg.src = Some(from);
            msg.dest = Some(dest);
            corr.receive(Event::Msg(msg));
            Ok(())
        }
    }

    pub(crate) struct HubTransport {
        hub: Arc<Hub>,
        local: Address,
    }

    impl Transport for HubTransport {
        fn send(&self, msg: Message) -> Result<()> {
            match msg.dests.clone() {
                Some(dests) => {
                    for dest in dests {
                        let _ = self.hub.deliver(self.local, dest, msg.clone());
                    }
                    Ok(())
                }
                None => {
                    let dest = msg.dest.ok_or_else(|| {
                        ClusterNetError::Framing("message has no destination".to_string())
                    })?;
                    self.hub.deliver(self.local, dest, msg)
                }
            }
        }

        fn local_address(&self) -> Option<Address> {
            Some(self.local)
        }
    }

    /// Answers with the request body prefixed by the node's port.
    pub(crate) struct EchoHandler {
        pub(crate) tag: u8,
    }

    impl RequestHandler for EchoHandler {
        fn handle(&self, request: &Message) -> std::result::Result<Vec<u8>, HandlerError> {
            if request.body == b"fail" {
                return Err(HandlerError::new("refused"));
            }
            let mut value = vec![self.tag];
            value.extend_from_slice(&request.body);
            Ok(value)
        }
    }

    pub(crate) fn addr(n: u8) -> Address {
        format!("10.0.0.{n}:7800").parse().unwrap()
    }

    pub(crate) fn node(hub: &Arc<Hub>, n: u8) -> Arc<RequestCorrelator> {
        let corr = hub.join(addr(n), CorrelatorConfig::dev_default());
        corr.set_handler(Arc::new(EchoHandler { tag: n }));
        corr
    }

    /// Collects replies for assertions.
    #[derive(Default)]
    struct Recorder {
        replies: Mutex<Vec<Message>>,
        suspects: Mutex<Vec<Address>>,
        expected: Mutex<Vec<Address>>,
        resets: Mutex<usize>,
    }

    impl RspCollector for Recorder {
        fn receive_response(&self, msg: Message) {
            self.replies.lock().push(msg);
        }

        fn suspect(&self, member: &Address) {
            self.suspects.lock().push(*member);
        }

        fn view_change(&self, _view: &View) {}

        fn expect_nhop_response(&self, from: &Address) {
            self.expected.lock().push(*from);
        }

        fn sequence_reset(&self) {
            *self.resets.lock() += 1;
        }
    }

    #[test]
    fn test_request_ids_wrap_and_skip_pending() {
        let hub = Arc::new(Hub::default());
        let corr = node(&hub, 1);
        assert_eq!(corr.next_request_id(), 0);
        assert_eq!(corr.next_request_id(), 1);

        corr.set_last_request_id(i64::MAX - 1);
        assert_eq!(corr.next_request_id(), i64::MAX);
        assert_eq!(corr.next_request_id(), 0);

        // 1 and 2 are still pending after the counter wraps again.
        let recorder: Arc<dyn RspCollector> = Arc::new(Recorder::default());
        corr.pending.write().insert(1, recorder.clone());
        corr.pending.write().insert(2, recorder);
        corr.set_last_request_id(i64::MAX);
        assert_eq!(corr.next_request_id(), 0);
        assert_eq!(corr.next_request_id(), 3);
    }

    #[test]
    fn test_request_and_reply() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let _b = node(&hub, 2);
        let recorder = Arc::new(Recorder::default());

        let id = a.next_request_id();
        a.send_request(id, &[addr(2)], Message::new(None, b"ping".to_vec()), Some(recorder.clone()))
            .unwrap();

        let replies = recorder.replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].src, Some(addr(2)));
        assert!(replies[0].correlator_header().is_none());
        assert_eq!(
            ResponsePayload::decode(&replies[0].body).unwrap(),
            ResponsePayload::Value(b"\x02ping".to_vec())
        );
        drop(replies);

        a.done(id);
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn test_handler_error_becomes_failure_reply() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        let recorder = Arc::new(Recorder::default());

        a.send_request(7, &[addr(2)], Message::new(None, b"fail".to_vec()), Some(recorder.clone()))
            .unwrap();

        let replies = recorder.replies.lock();
        assert_eq!(
            ResponsePayload::decode(&replies[0].body).unwrap(),
            ResponsePayload::Failure("refused".to_string())
        );
        // The failed request still counts as processed.
        assert_eq!(b.statuses().status(7, &addr(1)), RequestState::Processed);
    }

    #[test]
    fn test_request_without_collector_gets_no_reply() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        a.send_request(3, &[addr(2)], Message::new(None, b"async".to_vec()), None)
            .unwrap();
        assert_eq!(a.pending_count(), 0);
        assert_eq!(b.statuses().status(3, &addr(1)), RequestState::Processed);
    }

    #[test]
    fn test_non_member_destination_is_suspected() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let _b = node(&hub, 2);
        let recorder = Arc::new(Recorder::default());

        // Without a view nothing is suspected.
        a.send_request(1, &[addr(2)], Message::default(), Some(recorder.clone()))
            .unwrap();
        assert!(recorder.suspects.lock().is_empty());

        a.receive(Event::ViewChange(View::new(1, vec![addr(1)])));
        hub.cut(addr(2));
        a.send_request(2, &[addr(2)], Message::default(), Some(recorder.clone()))
            .unwrap();
        assert_eq!(*recorder.suspects.lock(), vec![addr(2)]);
    }

    #[test]
    fn test_message_for_other_members_is_dropped() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        let recorder = Arc::new(Recorder::default());
        a.pending.write().insert(5, recorder.clone());

        let mut hdr = CorrelatorHeader::new(HeaderType::Req, 5, true);
        hdr.dest_members = Some(vec![addr(3)]);
        let mut msg = Message::new(Some(addr(2)), b"x".to_vec());
        msg.src = Some(addr(1));
        msg.put_header(Header::Correlator(hdr));
        b.receive(Event::Msg(msg));

        assert!(recorder.replies.lock().is_empty());
        assert_eq!(b.statuses().status(5, &addr(1)), RequestState::NotReceived);
    }

    #[test]
    fn test_local_request_replies_without_transport() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let recorder = Arc::new(Recorder::default());
        hub.cut(addr(2));

        a.send_request(9, &[addr(1), addr(2)], Message::new(None, b"me".to_vec()), Some(recorder.clone()))
            .unwrap();
        let replies = recorder.replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].src, Some(addr(1)));
    }

    struct ForwardingHandler {
        next: Address,
    }

    impl RequestHandler for ForwardingHandler {
        fn handle(&self, _request: &Message) -> std::result::Result<Vec<u8>, HandlerError> {
            Ok(b"replica".to_vec())
        }

        fn handle_nhop_request(
            &self,
            request: &Message,
        ) -> std::result::Result<NHopResponse, HandlerError> {
            Ok(NHopResponse {
                value: b"primary".to_vec(),
                next_hop: Some((self.next, Message::new(None, request.body.clone()))),
            })
        }
    }

    #[test]
    fn test_nhop_request_announces_next_hop() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        let c = node(&hub, 3);
        b.set_handler(Arc::new(ForwardingHandler { next: addr(3) }));
        let recorder = Arc::new(Recorder::default());

        a.send_nhop_request(4, &[addr(2)], Message::new(None, b"put".to_vec()), Some(recorder.clone()))
            .unwrap();

        assert_eq!(*recorder.expected.lock(), vec![addr(3)]);
        let replies = recorder.replies.lock();
        let senders: Vec<_> = replies.iter().map(|msg| msg.src).collect();
        assert_eq!(replies.len(), 2);
        assert!(senders.contains(&Some(addr(2))));
        assert!(senders.contains(&Some(addr(3))));
        // The replica recorded the request under the forwarding node.
        assert_eq!(c.statuses().status(4, &addr(2)), RequestState::Processed);
    }

    #[test]
    fn test_status_request_answers_from_table() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        b.statuses().mark_arrived(42, &addr(1));

        let statuses = a.fetch_request_status(&[addr(2)], &[addr(1), addr(2)], 42);
        assert_eq!(statuses[&addr(2)], Some(RequestState::ReceivedNotProcessed));

        let statuses = a.fetch_request_status(&[addr(2)], &[], 43);
        assert_eq!(statuses[&addr(2)], Some(RequestState::NotReceived));
        assert_eq!(a.pending_count(), 0);
    }

    #[test]
    fn test_status_request_to_unreachable_node() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let _b = node(&hub, 2);
        hub.cut(addr(2));
        let statuses = a.fetch_request_status(&[addr(2)], &[], 1);
        assert_eq!(statuses[&addr(2)], None);
    }

    #[test]
    fn test_stop_replying() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let b = node(&hub, 2);
        let recorder = Arc::new(Recorder::default());
        b.stop_replying();
        a.send_request(1, &[addr(2)], Message::default(), Some(recorder.clone()))
            .unwrap();
        assert!(recorder.replies.lock().is_empty());

        b.start_replying();
        a.send_request(2, &[addr(2)], Message::default(), Some(recorder.clone()))
            .unwrap();
        assert_eq!(recorder.replies.lock().len(), 1);
    }

    #[test]
    fn test_events_reach_pending_collectors() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let recorder = Arc::new(Recorder::default());
        a.pending.write().insert(1, recorder.clone());

        a.receive(Event::Suspect(addr(4)));
        a.receive(Event::ResetSequence);
        assert_eq!(*recorder.suspects.lock(), vec![addr(4)]);
        assert_eq!(*recorder.resets.lock(), 1);

        a.done(1);
        a.receive(Event::Suspect(addr(5)));
        assert_eq!(recorder.suspects.lock().len(), 1);
    }

    #[test]
    fn test_view_change_drops_departed_status() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        a.receive(Event::ViewChange(View::new(1, vec![addr(1), addr(2)])));
        a.statuses().mark_arrived(1, &addr(2));
        assert!(a.is_member(&addr(2)));

        a.receive(Event::ViewChange(View::new(2, vec![addr(1)])));
        assert!(!a.is_member(&addr(2)));
        assert_eq!(a.statuses().status(1, &addr(2)), RequestState::NotReceived);
    }

    #[test]
    fn test_set_local_address_overrides_transport() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        assert_eq!(a.local_address(), Some(addr(1)));
        a.receive(Event::SetLocalAddress(addr(9)));
        assert_eq!(a.local_address(), Some(addr(9)));
    }

    #[test]
    fn test_uncorrelated_message_goes_upstream() {
        struct Upstream(Mutex<Vec<Vec<u8>>>);
        impl MessageReceiver for Upstream {
            fn receive(&self, msg: Message) {
                self.0.lock().push(msg.body);
            }
        }

        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let upstream = Arc::new(Upstream(Mutex::new(Vec::new())));
        a.set_upstream(upstream.clone());
        MessageReceiver::receive(a.as_ref(), Message::new(None, b"raw".to_vec()));
        assert_eq!(*upstream.0.lock(), vec![b"raw".to_vec()]);
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let hub = Arc::new(Hub::default());
        let mut config = CorrelatorConfig::dev_default();
        config.status_sweep_interval_ms = 0;
        let corr = hub.join(addr(1), config);
        assert_matches!(corr.start(), Err(ClusterNetError::Config(_)));

        let ok = node(&hub, 2);
        ok.start().unwrap();
        ok.stop();
    }

    #[test]
    fn test_group_request_over_hub() {
        let hub = Arc::new(Hub::default());
        let a = node(&hub, 1);
        let _b = node(&hub, 2);
        let _c = node(&hub, 3);
        let members = vec![addr(1), addr(2), addr(3)];

        let request = GroupRequest::new(
            Message::new(None, b"get".to_vec()),
            a.clone(),
            members.clone(),
            members,
            ResponseMode::GetAll,
            Some(Duration::from_secs(5)),
        );
        assert!(request.execute());
        let results = request.results();
        assert_eq!(results.num_received(), 3);
        for rsp in results.iter() {
            assert_eq!(rsp.status, RspStatus::Received);
            let value = rsp.value().unwrap().unwrap();
            assert_eq!(value[1..].to_vec(), b"get".to_vec());
        }
        assert_eq!(a.pending_count(), 0);
    }
}
