//! One TCP connection to one peer.
//!
//! A connection goes through
//!
//! ```text
//! Connecting ─► Handshaking ─► Established ─┬─► Closing     (peer sent LEAVE)
//!                                           ├─► Broken      (socket error)
//!                                           └─► SelfClosed  (local destroy or CLOSE_SILENT)
//! ```
//!
//! The handshake is performed on the bare stream by [`Handshake::connect`]
//! or [`Handshake::accept`]; the connection table then decides whether the
//! result survives a duplicate-connect race before wrapping it in a
//! [`PeerConnection`] and starting its receive loop.
//!
//! Handshake wire sequence, both directions:
//!
//! ```text
//! dialer   ── [u32 len][Hello] ──►  acceptor
//! dialer   ◄── [u32 len][Hello] ──  acceptor
//! greater address ── [cookie: 6][u32 len][ConnectInfo] ──► smaller address
//! ```

use {
    crate::{
        address::Address,
        codec::{single_message_header, BinaryMessage, FrameReader},
        config::{ProductVersion, TransportConfig},
        error::{ClusterNetError, Result},
        message::{ConnectionHeader, Message},
        stats::TransportStats,
    },
    log::*,
    parking_lot::{Condvar, Mutex},
    serde::{Deserialize, Serialize},
    socket2::{Domain, Protocol, SockAddr, Socket, Type},
    std::{
        io::{self, Read, Write},
        net::{IpAddr, Shutdown, SocketAddr, TcpStream},
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
            Arc, Weak,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Upper bound of a serialized handshake structure.
const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

// ── Connection identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectStatus {
    FirstTime,
    Reconnecting,
}

/// Identity of one physical connection, agreed on during the handshake.
///
/// Both endpoints see the same value because only the endpoint with the
/// greater [`Address`] generates it. When two connections to the same peer
/// race, both nodes keep the one with the lower `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub status: ConnectStatus,
    pub id: u32,
}

/// Per-table source of [`ConnectInfo`] ids.
#[derive(Debug, Default)]
pub struct ConnectIdGenerator(AtomicU32);

impl ConnectIdGenerator {
    pub fn next_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Which local NIC a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nic {
    Primary,
    Secondary,
}

/// Which of the (up to two) sockets per peer and NIC a connection fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketSlot {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Broken,
    SelfClosed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Broken | Self::SelfClosed)
    }
}

// ── Handshake ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    address: Address,
    connecting_first_time: bool,
    product_version: ProductVersion,
}

/// What a handshake needs from the local node.
pub struct HandshakeParams<'a> {
    pub config: &'a TransportConfig,
    /// Primary address of the local node, advertised on every NIC.
    pub local: Address,
    pub ids: &'a ConnectIdGenerator,
}

/// A stream whose handshake completed.
#[derive(Debug)]
pub struct Handshake {
    pub stream: TcpStream,
    /// Primary address the peer advertised.
    pub peer: Address,
    pub connect_info: ConnectInfo,
    /// The peer's "connecting first time" flag (meaningful on accept).
    pub peer_connecting_first_time: bool,
}

impl Handshake {
    /// Dial `target` and run the outbound handshake.
    ///
    /// `bind_ip` pins the local end to a NIC. The returned `peer` is the
    /// address the remote side advertised, which differs from `target`
    /// when dialing a secondary NIC.
    pub fn connect(
        params: &HandshakeParams,
        target: Address,
        bind_ip: Option<IpAddr>,
        connecting_first_time: bool,
    ) -> Result<Self> {
        let mut stream = dial(params.config, target, bind_ip)
            .map_err(|e| ClusterNetError::ConnectionFailed(target, e.to_string()))?;
        stream.set_read_timeout(Some(params.config.handshake_timeout()))?;

        write_hello(
            &mut stream,
            &Hello {
                address: params.local,
                connecting_first_time,
                product_version: params.config.product_version,
            },
        )?;
        let remote = read_hello(&mut stream)?;
        check_product_version(params.config, &remote);

        let connect_info =
            exchange_connect_info(&mut stream, params, remote.address, connecting_first_time)?;
        stream.set_read_timeout(None)?;
        debug!(
            "connected to {} (via {}), connect id {}",
            remote.address, target, connect_info.id
        );
        Ok(Self {
            stream,
            peer: remote.address,
            connect_info,
            peer_connecting_first_time: remote.connecting_first_time,
        })
    }

    /// Run the inbound handshake on an accepted stream.
    pub fn accept(params: &HandshakeParams, mut stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(params.config.handshake_timeout()))?;

        let remote = read_hello(&mut stream)?;
        write_hello(
            &mut stream,
            &Hello {
                address: params.local,
                connecting_first_time: true,
                product_version: params.config.product_version,
            },
        )?;
        check_product_version(params.config, &remote);

        let connect_info = exchange_connect_info(
            &mut stream,
            params,
            remote.address,
            remote.connecting_first_time,
        )?;
        stream.set_read_timeout(None)?;
        debug!(
            "accepted connection from {}, connect id {}",
            remote.address, connect_info.id
        );
        Ok(Self {
            stream,
            peer: remote.address,
            connect_info,
            peer_connecting_first_time: remote.connecting_first_time,
        })
    }

    /// Close the bare stream of a handshake that lost a race.
    pub fn discard(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("shutdown of discarded stream to {} failed: {}", self.peer, e);
        }
    }
}

fn dial(config: &TransportConfig, target: Address, bind_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let addr = target.socket_addr();
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    if let Some(ip) = bind_ip {
        socket.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    }
    socket.connect_timeout(&SockAddr::from(addr), config.connect_timeout())?;
    let stream = TcpStream::from(socket);
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn exchange_connect_info(
    stream: &mut TcpStream,
    params: &HandshakeParams,
    remote: Address,
    dialer_first_time: bool,
) -> Result<ConnectInfo> {
    if params.local > remote {
        let info = ConnectInfo {
            status: if dialer_first_time {
                ConnectStatus::FirstTime
            } else {
                ConnectStatus::Reconnecting
            },
            id: params.ids.next_id(),
        };
        let body = bincode::serialize(&info)?;
        let mut buf = Vec::with_capacity(body.len().saturating_add(10));
        buf.extend_from_slice(&params.config.version_cookie);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        stream.write_all(&buf)?;
        Ok(info)
    } else {
        let mut cookie = [0u8; 6];
        stream.read_exact(&mut cookie)?;
        if cookie != params.config.version_cookie {
            warn!(
                "version cookie mismatch with {}: {:?}",
                remote,
                String::from_utf8_lossy(&cookie)
            );
            return Err(ClusterNetError::VersionMismatch {
                peer: remote.to_string(),
            });
        }
        let body = read_handshake_block(stream)?;
        Ok(bincode::deserialize(&body)?)
    }
}

fn write_hello(stream: &mut TcpStream, hello: &Hello) -> Result<()> {
    let body = bincode::serialize(hello)?;
    let mut buf = Vec::with_capacity(body.len().saturating_add(4));
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    stream.write_all(&buf)?;
    Ok(())
}

fn read_hello(stream: &mut TcpStream) -> Result<Hello> {
    let body = read_handshake_block(stream)?;
    Ok(bincode::deserialize(&body)?)
}

fn read_handshake_block(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_HANDSHAKE_LEN {
        return Err(ClusterNetError::Framing(format!(
            "handshake block of {len} bytes"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn check_product_version(config: &TransportConfig, remote: &Hello) {
    if remote.product_version != config.product_version {
        warn!(
            "peer {} runs version {}, local version is {}",
            remote.address, remote.product_version, config.product_version
        );
    }
}

// ── Owner callbacks ─────────────────────────────────────────────────────────

/// Callbacks a receive loop makes into the component that owns its connection.
pub trait ConnectionOwner: Send + Sync {
    /// An application message arrived.
    fn deliver(&self, msg: Message);
    /// The socket failed while reading.
    fn connection_broken(&self, conn: &Arc<PeerConnection>);
    /// The peer announced that it is leaving the cluster.
    fn peer_left(&self, conn: &Arc<PeerConnection>);
    /// The peer closed this socket on purpose.
    fn closed_silently(&self, conn: &Arc<PeerConnection>);
    /// Whether the local node finished initializing.
    fn is_operational(&self) -> bool;
    /// Listener address of the local secondary NIC.
    fn secondary_address(&self) -> Option<Address>;
}

// ── Peer connection ─────────────────────────────────────────────────────────

/// Socket writer plus the scratch buffer that bounds individual writes.
struct SocketWriter {
    stream: TcpStream,
    scratch: Vec<u8>,
    capacity: usize,
}

impl SocketWriter {
    fn stage(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let room = self.capacity.saturating_sub(self.scratch.len());
            let take = room.min(bytes.len());
            self.scratch.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.scratch.len() >= self.capacity {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.scratch.is_empty() {
            self.stream.write_all(&self.scratch)?;
            self.scratch.clear();
        }
        Ok(())
    }
}

#[derive(Default)]
struct ControlReplies {
    secondary_address: Option<Option<Address>>,
    initialization_phase: Option<bool>,
}

pub struct PeerConnection {
    peer: Address,
    connect_info: ConnectInfo,
    nic: Nic,
    slot: SocketSlot,
    initiator: bool,
    stream: TcpStream,
    writer: Mutex<SocketWriter>,
    state: Mutex<ConnectionState>,
    socket_error: AtomicBool,
    part_of_cluster: AtomicBool,
    created: Instant,
    last_access_ms: AtomicU64,
    receiver: Mutex<Option<JoinHandle<()>>>,
    control: Mutex<ControlReplies>,
    control_cond: Condvar,
    recv_buffer_size: usize,
    max_frame_size: usize,
    control_timeout: Duration,
    stats: Arc<TransportStats>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("connect_info", &self.connect_info)
            .field("nic", &self.nic)
            .field("slot", &self.slot)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a completed handshake. The receive loop is not started yet.
    pub fn new(
        handshake: Handshake,
        nic: Nic,
        slot: SocketSlot,
        initiator: bool,
        config: &TransportConfig,
        stats: Arc<TransportStats>,
    ) -> Result<Arc<Self>> {
        let Handshake {
            stream,
            peer,
            connect_info,
            ..
        } = handshake;
        let capacity = config.send_buffer_size.max(1);
        let writer = SocketWriter {
            stream: stream.try_clone()?,
            scratch: Vec::with_capacity(capacity),
            capacity,
        };
        Ok(Arc::new(Self {
            peer,
            connect_info,
            nic,
            slot,
            initiator,
            stream,
            writer: Mutex::new(writer),
            state: Mutex::new(ConnectionState::Established),
            socket_error: AtomicBool::new(false),
            part_of_cluster: AtomicBool::new(false),
            created: Instant::now(),
            last_access_ms: AtomicU64::new(0),
            receiver: Mutex::new(None),
            control: Mutex::new(ControlReplies::default()),
            control_cond: Condvar::new(),
            recv_buffer_size: config.recv_buffer_size,
            max_frame_size: config.max_frame_size,
            control_timeout: config.control_response_timeout(),
            stats,
        }))
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn connect_info(&self) -> ConnectInfo {
        self.connect_info
    }

    pub fn nic(&self) -> Nic {
        self.nic
    }

    pub fn slot(&self) -> SocketSlot {
        self.slot
    }

    /// Whether this node dialed the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Established && !self.socket_error.load(Ordering::Acquire)
    }

    pub fn has_socket_error(&self) -> bool {
        self.socket_error.load(Ordering::Acquire)
    }

    pub fn is_leaving_gracefully(&self) -> bool {
        self.state() == ConnectionState::Closing
    }

    pub fn is_self_closed(&self) -> bool {
        self.state() == ConnectionState::SelfClosed
    }

    pub fn is_part_of_cluster(&self) -> bool {
        self.part_of_cluster.load(Ordering::Acquire)
    }

    pub fn mark_part_of_cluster(&self) {
        self.part_of_cluster.store(true, Ordering::Release);
    }

    /// Time since the last successful send or received frame.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_access_ms.store(now, Ordering::Relaxed);
    }

    /// Move to `next` unless a terminal state was already reached.
    fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
        *state
    }

    // ── Sending ─────────────────────────────────────────────────────────────

    /// Write `buffers` followed by the payload chunks as one contiguous
    /// byte sequence. Callers pass fully framed data.
    pub fn send(&self, buffers: &[&[u8]], payload: Option<&[Vec<u8>]>) -> Result<usize> {
        let mut writer = self.writer.lock();
        if !self.is_connected() {
            return Err(ClusterNetError::ConnectionBroken(self.peer));
        }
        let result = buffers
            .iter()
            .copied()
            .chain(payload.into_iter().flatten().map(Vec::as_slice))
            .try_fold(0usize, |sent, bytes| {
                writer.stage(bytes).map(|()| sent.saturating_add(bytes.len()))
            })
            .and_then(|sent| writer.flush().map(|()| sent));
        match result {
            Ok(sent) => {
                self.touch();
                self.stats.bytes_sent.add(sent as u64);
                self.stats.frames_sent.inc();
                Ok(sent)
            }
            Err(e) => {
                writer.scratch.clear();
                self.socket_error.store(true, Ordering::Release);
                self.transition(ConnectionState::Broken);
                debug!("send to {} failed: {}", self.peer, e);
                Err(ClusterNetError::ConnectionBroken(self.peer))
            }
        }
    }

    /// Send one encoded message as a frame of its own.
    pub fn send_message(&self, msg: &BinaryMessage) -> Result<usize> {
        let header = single_message_header(msg.size())?;
        let mut buffers = Vec::with_capacity(msg.buffers.len().saturating_add(1));
        buffers.push(&header[..]);
        buffers.extend(msg.buffers.iter().map(Vec::as_slice));
        self.send(&buffers, msg.user_payload.as_deref())
    }

    fn send_internal(&self, msg: &Message) -> Result<usize> {
        self.send_message(&BinaryMessage::encode(msg)?)
    }

    pub fn send_leave_notification(&self) -> Result<()> {
        self.send_internal(&Message::control(ConnectionHeader::Leave))
            .map(|_| ())
    }

    /// Ask the peer for the listener address of its secondary NIC.
    pub fn secondary_address(&self) -> Result<Option<Address>> {
        self.control.lock().secondary_address = None;
        self.send_internal(&Message::control(ConnectionHeader::GetSecondAddressReq))?;
        let mut replies = self.control.lock();
        let deadline = Instant::now() + self.control_timeout;
        while replies.secondary_address.is_none() {
            if self
                .control_cond
                .wait_until(&mut replies, deadline)
                .timed_out()
            {
                return Err(ClusterNetError::RequestTimeout(
                    self.control_timeout.as_millis() as u64,
                ));
            }
        }
        Ok(replies.secondary_address.take().flatten())
    }

    /// Ask the peer whether it is still initializing.
    pub fn is_peer_in_initialization_phase(&self) -> Result<bool> {
        self.control.lock().initialization_phase = None;
        self.send_internal(&Message::control(
            ConnectionHeader::AreYouInInitializationPhase,
        ))?;
        let mut replies = self.control.lock();
        let deadline = Instant::now() + self.control_timeout;
        loop {
            if let Some(initializing) = replies.initialization_phase.take() {
                return Ok(initializing);
            }
            if self
                .control_cond
                .wait_until(&mut replies, deadline)
                .timed_out()
            {
                return Err(ClusterNetError::RequestTimeout(
                    self.control_timeout.as_millis() as u64,
                ));
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Close the socket and stop the receive loop.
    pub fn destroy(&self) {
        self.transition(ConnectionState::SelfClosed);
        let handle = self.receiver.lock().take();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("shutdown of connection to {} failed: {}", self.peer, e);
        }
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("receive loop for {} panicked", self.peer);
            }
        }
    }

    /// Tell the peer this close is deliberate, then destroy.
    pub fn destroy_silent(&self) {
        if self.is_connected() {
            if let Err(e) = self.send_internal(&Message::control(ConnectionHeader::CloseSilent)) {
                debug!("could not send close notice to {}: {}", self.peer, e);
            }
        }
        self.destroy();
    }

    // ── Receiving ───────────────────────────────────────────────────────────

    /// Spawn the receive loop.
    pub fn start_receiving(self: &Arc<Self>, owner: Weak<dyn ConnectionOwner>) -> Result<()> {
        let reader = self.stream.try_clone()?;
        let conn = Arc::clone(self);
        let handle = Builder::new()
            .name("cmConnRecv".to_string())
            .spawn(move || conn.receive_loop(reader, owner))?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    fn receive_loop(self: Arc<Self>, mut reader: TcpStream, owner: Weak<dyn ConnectionOwner>) {
        let mut frames = FrameReader::new(self.recv_buffer_size, self.max_frame_size);
        'frames: loop {
            let frame = match frames.read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(e) => {
                    if self.state().is_terminal() {
                        trace!("receive loop for {} stopping: {}", self.peer, e);
                    } else {
                        debug!("receive from {} failed: {}", self.peer, e);
                        self.socket_error.store(true, Ordering::Release);
                        self.transition(ConnectionState::Broken);
                    }
                    break;
                }
            };
            self.touch();
            self.stats.frames_received.inc();
            self.stats.bytes_received.add(frame.wire_len as u64);

            for mut msg in frame.messages {
                if let Some(control) = msg.connection_header() {
                    if !self.handle_control(control, &owner) {
                        break 'frames;
                    }
                    continue;
                }
                let Some(owner) = owner.upgrade() else {
                    break 'frames;
                };
                self.stats.messages_received.inc();
                msg.src = Some(self.peer);
                msg.arrived_at = Some(Instant::now());
                trace!("received {} from {}", msg.kind(), self.peer);
                owner.deliver(msg);
            }
        }

        let Some(owner) = owner.upgrade() else {
            return;
        };
        match self.state() {
            ConnectionState::Closing => owner.peer_left(&self),
            ConnectionState::Broken => owner.connection_broken(&self),
            ConnectionState::SelfClosed if !self.initiated_close() => owner.closed_silently(&self),
            _ => {}
        }
    }

    /// Whether the local side tore the connection down itself.
    fn initiated_close(&self) -> bool {
        self.receiver.lock().is_none()
    }

    /// Handle a control message. Returns false when the loop must stop.
    fn handle_control(&self, control: ConnectionHeader, owner: &Weak<dyn ConnectionOwner>) -> bool {
        trace!("control {} from {}", control.type_tag(), self.peer);
        match control {
            ConnectionHeader::CloseSilent => {
                self.transition(ConnectionState::SelfClosed);
                false
            }
            ConnectionHeader::Leave => {
                self.transition(ConnectionState::Closing);
                false
            }
            ConnectionHeader::GetSecondAddressReq => {
                let addr = owner.upgrade().and_then(|owner| owner.secondary_address());
                self.reply(ConnectionHeader::GetSecondAddressRsp(addr));
                true
            }
            ConnectionHeader::GetSecondAddressRsp(addr) => {
                self.control.lock().secondary_address = Some(addr);
                self.control_cond.notify_all();
                true
            }
            ConnectionHeader::AreYouInInitializationPhase => {
                let operational = owner.upgrade().is_some_and(|owner| owner.is_operational());
                self.reply(ConnectionHeader::InitializationPhaseRsp(!operational));
                true
            }
            ConnectionHeader::InitializationPhaseRsp(initializing) => {
                self.control.lock().initialization_phase = Some(initializing);
                self.control_cond.notify_all();
                true
            }
        }
    }

    fn reply(&self, header: ConnectionHeader) {
        if let Err(e) = self.send_internal(&Message::control(header)) {
            debug!("control reply to {} failed: {}", self.peer, e);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        crossbeam_channel::{unbounded, Receiver, Sender},
        std::net::TcpListener,
    };

    #[derive(Debug)]
    pub(crate) enum OwnerEvent {
        Delivered(Message),
        Broken(Address),
        Left(Address),
        ClosedSilently(Address),
    }

    pub(crate) struct RecordingOwner {
        events: Sender<OwnerEvent>,
        secondary: Option<Address>,
        operational: bool,
    }

    impl RecordingOwner {
        pub(crate) fn new() -> (Arc<Self>, Receiver<OwnerEvent>) {
            let (events, receiver) = unbounded();
            (
                Arc::new(Self {
                    events,
                    secondary: Some("10.1.0.1:7900".parse().unwrap()),
                    operational: false,
                }),
                receiver,
            )
        }
    }

    impl ConnectionOwner for RecordingOwner {
        fn deliver(&self, msg: Message) {
            let _ = self.events.send(OwnerEvent::Delivered(msg));
        }
        fn connection_broken(&self, conn: &Arc<PeerConnection>) {
            let _ = self.events.send(OwnerEvent::Broken(conn.peer()));
        }
        fn peer_left(&self, conn: &Arc<PeerConnection>) {
            let _ = self.events.send(OwnerEvent::Left(conn.peer()));
        }
        fn closed_silently(&self, conn: &Arc<PeerConnection>) {
            let _ = self.events.send(OwnerEvent::ClosedSilently(conn.peer()));
        }
        fn is_operational(&self) -> bool {
            self.operational
        }
        fn secondary_address(&self) -> Option<Address> {
            self.secondary
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    /// Handshake a loopback socket pair. `dialer` and `acceptor` are the
    /// addresses each side advertises.
    fn handshake_pair(
        dialer: Address,
        acceptor: Address,
        acceptor_config: TransportConfig,
    ) -> (Result<Handshake>, Result<Handshake>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = Address::from(listener.local_addr().unwrap());
        let accept_side = thread::spawn(move || {
            let ids = ConnectIdGenerator::default();
            let (stream, _) = listener.accept().unwrap();
            let params = HandshakeParams {
                config: &acceptor_config,
                local: acceptor,
                ids: &ids,
            };
            Handshake::accept(&params, stream)
        });
        let config = TransportConfig::dev_default();
        let ids = ConnectIdGenerator::default();
        let params = HandshakeParams {
            config: &config,
            local: dialer,
            ids: &ids,
        };
        let dialed = Handshake::connect(&params, target, None, true);
        (dialed, accept_side.join().unwrap())
    }

    pub(crate) type Side = (Arc<PeerConnection>, Arc<RecordingOwner>, Receiver<OwnerEvent>);

    fn connected_pair() -> (Side, Side) {
        connected_pair_with(Arc::new(TransportStats::default()), SocketSlot::Primary)
    }

    /// Two established connections over loopback; the first side advertises
    /// `10.0.0.1:100` and the second `10.0.0.2:100`.
    pub(crate) fn connected_pair_with(stats: Arc<TransportStats>, slot: SocketSlot) -> (Side, Side) {
        let (dialed, accepted) = handshake_pair(
            addr("10.0.0.1:100"),
            addr("10.0.0.2:100"),
            TransportConfig::dev_default(),
        );
        let config = TransportConfig::dev_default();
        let mut sides = Vec::new();
        for (handshake, initiator) in [(dialed.unwrap(), true), (accepted.unwrap(), false)] {
            let conn = PeerConnection::new(
                handshake,
                Nic::Primary,
                slot,
                initiator,
                &config,
                stats.clone(),
            )
            .unwrap();
            let (owner, events) = RecordingOwner::new();
            let weak: Weak<dyn ConnectionOwner> = Arc::downgrade(&owner) as Weak<dyn ConnectionOwner>;
            conn.start_receiving(weak).unwrap();
            sides.push((conn, owner, events));
        }
        let b = sides.pop().unwrap();
        let a = sides.pop().unwrap();
        (a, b)
    }

    #[test]
    fn test_greater_address_sends_connect_info() {
        let (dialed, accepted) = handshake_pair(
            addr("10.0.0.1:100"),
            addr("10.0.0.2:100"),
            TransportConfig::dev_default(),
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(dialed.peer, addr("10.0.0.2:100"));
        assert_eq!(accepted.peer, addr("10.0.0.1:100"));
        // The acceptor is greater, so its generator produced the id.
        assert_eq!(dialed.connect_info, accepted.connect_info);
        assert_eq!(accepted.connect_info.id, 1);
        assert_eq!(accepted.connect_info.status, ConnectStatus::FirstTime);
        assert!(accepted.peer_connecting_first_time);
    }

    #[test]
    fn test_cookie_mismatch_is_version_mismatch() {
        let mut foreign = TransportConfig::dev_default();
        foreign.version_cookie = *b"OTHER1";
        // The dialer is greater and sends; the acceptor reads and rejects.
        let (_dialed, accepted) =
            handshake_pair(addr("10.0.0.9:100"), addr("10.0.0.1:100"), foreign);
        assert_matches!(accepted, Err(ClusterNetError::VersionMismatch { .. }));
    }

    #[test]
    fn test_messages_arrive_in_order_with_source() {
        let ((a, _owner_a, _events_a), (_b, _owner_b, events_b)) = connected_pair();
        for i in 0..10u8 {
            let msg = BinaryMessage::encode(&Message::new(None, vec![i])).unwrap();
            a.send_message(&msg).unwrap();
        }
        for i in 0..10u8 {
            match events_b.recv_timeout(WAIT).unwrap() {
                OwnerEvent::Delivered(msg) => {
                    assert_eq!(msg.body, vec![i]);
                    assert_eq!(msg.src, Some(addr("10.0.0.1:100")));
                    assert!(msg.arrived_at.is_some());
                }
                _ => panic!("unexpected event"),
            }
        }
    }

    #[test]
    fn test_payload_larger_than_send_buffer() {
        let ((a, _owner_a, _events_a), (_b, _owner_b, events_b)) = connected_pair();
        let payload = vec![7u8; 3 * 1_048_576];
        let msg = Message::new(None, b"big".to_vec()).with_payload(vec![payload.clone()]);
        let sent = a.send_message(&BinaryMessage::encode(&msg).unwrap()).unwrap();
        assert!(sent > payload.len());
        match events_b.recv_timeout(WAIT).unwrap() {
            OwnerEvent::Delivered(msg) => assert_eq!(msg.payload_bytes(), payload),
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn test_close_silent_is_not_breakage() {
        let ((a, _owner_a, events_a), (_b, _owner_b, events_b)) = connected_pair();
        a.destroy_silent();
        assert!(a.is_self_closed());
        assert_matches!(
            events_b.recv_timeout(WAIT).unwrap(),
            OwnerEvent::ClosedSilently(peer) if peer == addr("10.0.0.1:100")
        );
        // The destroying side reports nothing.
        assert!(events_a.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_leave_notification() {
        let ((a, _owner_a, _events_a), (b, _owner_b, events_b)) = connected_pair();
        a.send_leave_notification().unwrap();
        assert_matches!(events_b.recv_timeout(WAIT).unwrap(), OwnerEvent::Left(_));
        assert!(b.is_leaving_gracefully());
        a.destroy();
    }

    #[test]
    fn test_socket_loss_reports_breakage() {
        let ((a, _owner_a, _events_a), (b, _owner_b, events_b)) = connected_pair();
        a.destroy();
        assert_matches!(events_b.recv_timeout(WAIT).unwrap(), OwnerEvent::Broken(_));
        assert!(b.has_socket_error());
        assert!(!b.is_connected());
        assert_matches!(
            b.send(&[b"x"], None),
            Err(ClusterNetError::ConnectionBroken(_))
        );
    }

    #[test]
    fn test_control_requests() {
        let ((a, _owner_a, _events_a), (_b, _owner_b, _events_b)) = connected_pair();
        assert_eq!(a.secondary_address().unwrap(), Some(addr("10.1.0.1:7900")));
        // RecordingOwner is not operational, so the peer is initializing.
        assert!(a.is_peer_in_initialization_phase().unwrap());
    }

    #[test]
    fn test_idle_time_resets_on_send() {
        let ((a, _owner_a, _events_a), _b) = connected_pair();
        thread::sleep(Duration::from_millis(50));
        assert!(a.idle_for() >= Duration::from_millis(50));
        a.send_message(&BinaryMessage::encode(&Message::default()).unwrap())
            .unwrap();
        assert!(a.idle_for() < Duration::from_millis(50));
    }
}
