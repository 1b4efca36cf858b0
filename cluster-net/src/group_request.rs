//! Response collector for one multicast request.
//!
//! A [`GroupRequest`] sends one message to a fixed set of members and
//! blocks in [`execute`](GroupRequest::execute) until its
//! [`ResponseMode`] is satisfied or the timeout passes. Each member is
//! tracked as `NotReceived`, `Received` or `Suspected`:
//!
//! ```text
//!               receive_response
//!   NotReceived ─────────────────► Received
//!        │                            │
//!        └──── suspect / view_change ─┴──► Suspected
//! ```
//!
//! The member set never grows after construction. A member joining in a
//! later view never saw the request and would never answer.
//!
//! n-hop replies can announce an extra responder (the next hop). Those
//! responders are tracked separately from the members and only the n-hop
//! modes wait for them.
//!
//! With request enquiry enabled the wait wakes every enquiry interval,
//! asks the silent members what happened to the request and resends it
//! to those that never got it.

use {
    crate::{
        address::{Address, View},
        correlator::{RequestCorrelator, RspCollector},
        error::{ClusterNetError, Result},
        header::{RequestState, ResponsePayload},
        message::Message,
    },
    log::*,
    parking_lot::{Condvar, Mutex, MutexGuard},
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Weak},
        time::{Duration, Instant},
    },
};

/// Suspected members remembered across executions.
const MAX_SUSPECTS: usize = 40;
const MAX_ENQUIRY_FAILURES: u32 = 3;
const MAX_RETRIES_AFTER_SEQ_RESET: u32 = 3;

/// When a [`GroupRequest`] is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One reply, or every member suspected.
    GetFirst,
    /// No member left in `NotReceived`.
    GetAll,
    /// `n` replies. Behaves as `GetAll` when `n` covers every member.
    GetN(usize),
    /// Fire and forget.
    GetNone,
    /// `GetFirst`, plus every announced next hop answered or suspected.
    GetFirstNHop,
    /// `GetAll`, plus every announced next hop answered or suspected.
    GetAllNHop,
}

impl ResponseMode {
    pub fn is_nhop(self) -> bool {
        matches!(self, Self::GetFirstNHop | Self::GetAllNHop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RspStatus {
    #[default]
    NotReceived,
    Received,
    Suspected,
}

/// Outcome for one responder.
#[derive(Debug, Clone)]
pub struct Rsp {
    pub sender: Address,
    pub status: RspStatus,
    /// The reply, correlator header removed.
    pub response: Option<Message>,
}

impl Rsp {
    pub fn was_received(&self) -> bool {
        self.status == RspStatus::Received
    }

    pub fn was_suspected(&self) -> bool {
        self.status == RspStatus::Suspected
    }

    pub fn payload(&self) -> Option<Result<ResponsePayload>> {
        self.response
            .as_ref()
            .map(|msg| ResponsePayload::decode(&msg.body))
    }

    /// The handler's return value, `None` when no reply arrived.
    /// A handler failure is returned as [`ClusterNetError::Handler`].
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let Some(payload) = self.payload() else {
            return Ok(None);
        };
        match payload? {
            ResponsePayload::Value(value) => Ok(Some(value)),
            ResponsePayload::Failure(message) => Err(ClusterNetError::Handler(message)),
            ResponsePayload::Status(state) => Err(ClusterNetError::Framing(format!(
                "status reply {state:?} where a value was expected"
            ))),
        }
    }
}

/// Per-responder outcomes of a [`GroupRequest`], in membership order.
#[derive(Debug, Clone, Default)]
pub struct RspList(Vec<Rsp>);

impl RspList {
    pub fn get(&self, sender: &Address) -> Option<&Rsp> {
        self.0.iter().find(|rsp| rsp.sender == *sender)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rsp> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn num_received(&self) -> usize {
        self.0.iter().filter(|rsp| rsp.was_received()).count()
    }

    pub fn num_suspected(&self) -> usize {
        self.0.iter().filter(|rsp| rsp.was_suspected()).count()
    }

    pub fn first_received(&self) -> Option<&Rsp> {
        self.0.iter().find(|rsp| rsp.was_received())
    }

    /// Responders still in `NotReceived`.
    pub fn not_received(&self) -> Vec<Address> {
        self.0
            .iter()
            .filter(|rsp| rsp.status == RspStatus::NotReceived)
            .map(|rsp| rsp.sender)
            .collect()
    }
}

impl<'a> IntoIterator for &'a RspList {
    type Item = &'a Rsp;
    type IntoIter = std::slice::Iter<'a, Rsp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct NHopEntry {
    /// A first-hop reply named this node as an extra responder.
    announced: bool,
    status: RspStatus,
    response: Option<Message>,
}

#[derive(Debug)]
struct GroupState {
    req_id: i64,
    membership: Vec<Address>,
    statuses: Vec<RspStatus>,
    responses: Vec<Option<Message>>,
    nhops: HashMap<Address, NHopEntry>,
    suspects: VecDeque<Address>,
    /// Whole-cluster view, used to spot departed next hops.
    cluster_membership: Vec<Address>,
    done: bool,
    seq_reset: bool,
    retries_after_seq_reset: u32,
}

impl GroupState {
    fn new(membership: Vec<Address>, cluster_membership: Vec<Address>) -> Self {
        let len = membership.len();
        Self {
            req_id: -1,
            membership,
            statuses: vec![RspStatus::NotReceived; len],
            responses: vec![None; len],
            nhops: HashMap::new(),
            suspects: VecDeque::new(),
            cluster_membership,
            done: false,
            seq_reset: false,
            retries_after_seq_reset: 0,
        }
    }

    /// Clear all outcomes for a new execution. Known suspects stay suspected.
    fn reset(&mut self, req_id: i64) {
        self.req_id = req_id;
        self.done = false;
        self.seq_reset = false;
        self.retries_after_seq_reset = 0;
        self.nhops.clear();
        for (i, member) in self.membership.iter().enumerate() {
            self.responses[i] = None;
            self.statuses[i] = if self.suspects.contains(member) {
                RspStatus::Suspected
            } else {
                RspStatus::NotReceived
            };
        }
    }

    fn index_of(&self, addr: &Address) -> Option<usize> {
        self.membership.iter().position(|member| member == addr)
    }

    fn count(&self, status: RspStatus) -> usize {
        self.statuses.iter().filter(|s| **s == status).count()
    }

    fn not_received(&self) -> Vec<Address> {
        self.membership
            .iter()
            .zip(&self.statuses)
            .filter(|(_, status)| **status == RspStatus::NotReceived)
            .map(|(member, _)| *member)
            .collect()
    }

    fn add_suspect(&mut self, member: Address) {
        if !self.suspects.contains(&member) {
            self.suspects.push_back(member);
            if self.suspects.len() > MAX_SUSPECTS {
                self.suspects.pop_front();
            }
        }
    }

    fn mark_suspected(&mut self, index: usize) {
        let member = self.membership[index];
        self.add_suspect(member);
        self.statuses[index] = RspStatus::Suspected;
        self.responses[index] = None;
    }

    fn is_complete(&self, mode: ResponseMode) -> bool {
        let received = self.count(RspStatus::Received);
        let not_received = self.count(RspStatus::NotReceived);
        let suspected = self.count(RspStatus::Suspected);
        let total = self.membership.len();
        let nhops_settled = self
            .nhops
            .values()
            .filter(|hop| hop.announced)
            .all(|hop| hop.status != RspStatus::NotReceived);

        match mode {
            ResponseMode::GetFirst => received > 0 || suspected >= total,
            ResponseMode::GetFirstNHop => (received > 0 && nhops_settled) || suspected >= total,
            ResponseMode::GetAll => not_received == 0,
            ResponseMode::GetAllNHop => not_received == 0 && nhops_settled,
            ResponseMode::GetN(n) if n >= total => not_received == 0,
            ResponseMode::GetN(n) => {
                received >= n || (received + not_received < n && received + suspected >= n)
            }
            ResponseMode::GetNone => true,
        }
    }

    fn results(&self) -> RspList {
        RspList(
            self.membership
                .iter()
                .zip(&self.statuses)
                .zip(&self.responses)
                .map(|((sender, status), response)| Rsp {
                    sender: *sender,
                    status: *status,
                    response: response.clone(),
                })
                .collect(),
        )
    }
}

// ── GroupRequest ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Enquiry {
    interval: Duration,
    retries: u32,
}

/// Removes the correlator entry of an execution on every exit path.
struct PendingGuard<'a> {
    corr: &'a RequestCorrelator,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.corr.done(self.id);
    }
}

pub struct GroupRequest {
    request: Message,
    corr: Arc<RequestCorrelator>,
    mode: ResponseMode,
    /// `None` waits until the mode is satisfied.
    timeout: Option<Duration>,
    enquiry: Option<Enquiry>,
    /// Set for status queries: the request whose state is asked for.
    status_of: Option<i64>,
    state: Mutex<GroupState>,
    cond: Condvar,
    me: Weak<Self>,
}

impl GroupRequest {
    /// `members` receive the request. `cluster_membership` is the whole
    /// current view. A zero timeout waits indefinitely.
    pub fn new(
        request: Message,
        corr: Arc<RequestCorrelator>,
        members: Vec<Address>,
        cluster_membership: Vec<Address>,
        mode: ResponseMode,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::build(request, corr, members, cluster_membership, mode, timeout, None)
    }

    /// Status query about request `req_id`, answered from the members'
    /// request-status tables.
    pub(crate) fn status_query(
        corr: Arc<RequestCorrelator>,
        nodes: Vec<Address>,
        cluster_membership: Vec<Address>,
        req_id: i64,
        timeout: Duration,
    ) -> Arc<Self> {
        Self::build(
            Message::default(),
            corr,
            nodes,
            cluster_membership,
            ResponseMode::GetAll,
            Some(timeout),
            Some(req_id),
        )
    }

    fn build(
        request: Message,
        corr: Arc<RequestCorrelator>,
        members: Vec<Address>,
        cluster_membership: Vec<Address>,
        mode: ResponseMode,
        timeout: Option<Duration>,
        status_of: Option<i64>,
    ) -> Arc<Self> {
        let config = corr.config();
        // Status queries never enquire about themselves.
        let enquiry = (config.allow_request_enquiry && status_of.is_none()).then(|| Enquiry {
            interval: Duration::from_millis(config.request_enquiry_interval_ms),
            retries: config.request_enquiry_retries,
        });
        Arc::new_cyclic(|me| Self {
            request,
            corr,
            mode,
            timeout: timeout.filter(|timeout| !timeout.is_zero()),
            enquiry,
            status_of,
            state: Mutex::new(GroupState::new(members, cluster_membership)),
            cond: Condvar::new(),
            me: me.clone(),
        })
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Id of the current or last execution, -1 before the first one.
    pub fn request_id(&self) -> i64 {
        self.state.lock().req_id
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Per-member outcomes.
    pub fn results(&self) -> RspList {
        self.state.lock().results()
    }

    /// Outcomes of the responders that are not members, i.e. next hops.
    pub fn nhop_results(&self) -> RspList {
        let state = self.state.lock();
        let mut hops: Vec<Rsp> = state
            .nhops
            .iter()
            .map(|(sender, hop)| Rsp {
                sender: *sender,
                status: hop.status,
                response: hop.response.clone(),
            })
            .collect();
        hops.sort_by_key(|rsp| rsp.sender);
        RspList(hops)
    }

    pub fn suspects(&self) -> Vec<Address> {
        self.state.lock().suspects.iter().copied().collect()
    }

    /// Send the request and wait for the response mode to be satisfied.
    ///
    /// Returns false on timeout, when the request could not be sent, or
    /// when enquiry gave up. [`results`](Self::results) tells which
    /// members did not answer.
    pub fn execute(&self) -> bool {
        let req_id = match self.mode {
            ResponseMode::GetNone => -1,
            _ => self.corr.next_request_id(),
        };
        let targets = {
            let mut state = self.state.lock();
            state.reset(req_id);
            state.membership.clone()
        };

        if self.mode == ResponseMode::GetNone {
            let sent = self.send(req_id, &targets, None);
            self.state.lock().done = true;
            return match sent {
                Ok(()) => true,
                Err(e) => {
                    warn!("fire-and-forget request could not be sent: {}", e);
                    false
                }
            };
        }

        let _pending = PendingGuard {
            corr: &self.corr,
            id: req_id,
        };
        debug!("sending request {} to {} member(s)", req_id, targets.len());
        let completed = match self.send(req_id, &targets, self.collector()) {
            Ok(()) => self.wait(req_id),
            Err(e) => {
                warn!("request {} could not be sent: {}", req_id, e);
                false
            }
        };
        self.state.lock().done = true;
        completed
    }

    fn collector(&self) -> Option<Arc<dyn RspCollector>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn RspCollector>)
    }

    fn send(
        &self,
        req_id: i64,
        targets: &[Address],
        collector: Option<Arc<dyn RspCollector>>,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let msg = self.request.clone();
        match self.status_of {
            Some(status_req_id) => {
                self.corr
                    .send_status_request(req_id, targets, msg, collector, status_req_id)
            }
            None if self.mode.is_nhop() => {
                self.corr.send_nhop_request(req_id, targets, msg, collector)
            }
            None => self.corr.send_request(req_id, targets, msg, collector),
        }
    }

    fn wait(&self, req_id: i64) -> bool {
        let started = Instant::now();
        let mut state = self.state.lock();
        let mut retries = self.enquiry.map_or(0, |enquiry| enquiry.retries);
        let mut failures = 0;

        loop {
            if state.is_complete(self.mode) {
                trace!("request {} complete", req_id);
                return true;
            }
            let Some(timeout) = self.timeout else {
                self.cond.wait(&mut state);
                continue;
            };
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let wake = self
                .enquiry
                .map_or(remaining, |enquiry| enquiry.interval.min(remaining));
            let timed_out = self.cond.wait_for(&mut state, wake).timed_out();

            let Some(enquiry) = self.enquiry else {
                continue;
            };
            if !(timed_out || state.seq_reset) || state.is_complete(self.mode) {
                continue;
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            if retries == 0 || enquiry.interval >= remaining {
                continue;
            }
            if state.seq_reset {
                state.retries_after_seq_reset += 1;
            }
            retries -= 1;

            let silent = state.not_received();
            let cluster = state.cluster_membership.clone();
            let total = state.membership.len();
            let enquire_again = MutexGuard::unlocked(&mut state, || {
                self.enquire(req_id, &silent, &cluster, total)
            });
            if !enquire_again {
                failures += 1;
            }
            if failures >= MAX_ENQUIRY_FAILURES
                || state.retries_after_seq_reset > MAX_RETRIES_AFTER_SEQ_RESET
            {
                warn!(
                    "request {}: giving up after {} failed enquiries ({} retries since sequence reset)",
                    req_id, failures, state.retries_after_seq_reset
                );
                return false;
            }
        }

        warn!(
            "request {} timed out after {:?}; no response from {:?}",
            req_id,
            self.timeout,
            state.not_received()
        );
        false
    }

    /// Ask `silent` members about the request and resend it where it was
    /// lost. Returns false when enquiring again is pointless.
    fn enquire(&self, req_id: i64, silent: &[Address], cluster: &[Address], total: usize) -> bool {
        if silent.is_empty() {
            return true;
        }
        debug!("request {}: enquiring on {:?}", req_id, silent);
        let statuses = self.corr.fetch_request_status(silent, cluster, req_id);
        let seq_required = self.request.is_seq_required();

        let mut resend = Vec::new();
        let mut not_responding = 0;
        for node in silent {
            match statuses.get(node).copied().flatten() {
                Some(RequestState::NotReceived) => resend.push(*node),
                Some(RequestState::Processed) if !seq_required => resend.push(*node),
                Some(_) => {}
                None => not_responding += 1,
            }
        }

        let mut enquire_again = true;
        // Sequenced requests are only replayed to the whole group.
        if seq_required && resend.len() != total {
            if not_responding == 0 {
                enquire_again = false;
            }
            resend.clear();
        }
        if !resend.is_empty() {
            info!("request {}: resending to {:?}", req_id, resend);
            if let Err(e) = self.send(req_id, &resend, self.collector()) {
                warn!("request {}: resend failed: {}", req_id, e);
            }
        }
        enquire_again
    }
}

impl RspCollector for GroupRequest {
    fn receive_response(&self, msg: Message) {
        let Some(sender) = msg.src else {
            warn!("dropping reply without a source");
            return;
        };
        let mut state = self.state.lock();
        if state.done {
            debug!("request {} is done; dropping reply from {}", state.req_id, sender);
            return;
        }
        if state.suspects.contains(&sender) {
            warn!(
                "request {}: dropping reply from suspected member {}",
                state.req_id, sender
            );
            return;
        }
        match state.index_of(&sender) {
            Some(i) => {
                if state.statuses[i] == RspStatus::NotReceived {
                    trace!("request {}: reply from {}", state.req_id, sender);
                    state.statuses[i] = RspStatus::Received;
                    state.responses[i] = Some(msg);
                }
            }
            None => {
                let hop = state.nhops.entry(sender).or_default();
                hop.status = RspStatus::Received;
                hop.response = Some(msg);
            }
        }
        self.cond.notify_all();
    }

    fn suspect(&self, member: &Address) {
        let mut state = self.state.lock();
        match state.index_of(member) {
            Some(i) => state.mark_suspected(i),
            None => {
                if state.cluster_membership.contains(member) || state.nhops.contains_key(member) {
                    state.nhops.entry(*member).or_default().status = RspStatus::Suspected;
                }
            }
        }
        self.cond.notify_all();
    }

    fn view_change(&self, view: &View) {
        let mut state = self.state.lock();
        if state.membership.is_empty() {
            return;
        }
        let old_cluster = std::mem::replace(&mut state.cluster_membership, view.members.clone());
        for i in 0..state.membership.len() {
            if !view.contains(&state.membership[i]) {
                state.mark_suspected(i);
            }
        }
        // Departed nodes outside the request can only have been next hops.
        for member in old_cluster {
            if !state.membership.contains(&member) && !view.contains(&member) {
                state.nhops.entry(member).or_default().status = RspStatus::Suspected;
            }
        }
        self.cond.notify_all();
    }

    fn expect_nhop_response(&self, from: &Address) {
        self.state.lock().nhops.entry(*from).or_default().announced = true;
    }

    fn sequence_reset(&self) {
        let mut state = self.state.lock();
        state.seq_reset = true;
        state.retries_after_seq_reset = 0;
        self.cond.notify_all();
    }
}
