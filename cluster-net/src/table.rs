//! The connection table: every live connection of the local node.
//!
//! Connections are indexed by the primary address the peer advertised, the
//! local NIC they run over and the socket slot they fill:
//!
//! ```text
//!                  SocketSlot::Primary      SocketSlot::Secondary
//!  Nic::Primary    { peer ─► conn }         { peer ─► conn }   (dual socket)
//!  Nic::Secondary  { peer ─► conn }         { peer ─► conn }
//! ```
//!
//! At most one entry exists per peer, NIC and slot. When two connections to
//! the same peer race (both sides dialing at once), both nodes keep the one
//! with the lower [`ConnectInfo`] id and close the other silently; the id is
//! generated by the greater address and sent during the handshake, so both
//! ends reach the same verdict.
//!
//! Only the node that appears later in the membership list dials; the
//! earlier node waits for the connection.
//!
//! [`ConnectInfo`]: crate::connection::ConnectInfo

use {
    crate::{
        address::Address,
        codec::BinaryMessage,
        config::TransportConfig,
        connection::{
            ConnectIdGenerator, ConnectionOwner, Handshake, HandshakeParams, Nic,
            PeerConnection, SocketSlot,
        },
        error::{ClusterNetError, Result},
        message::Message,
        sender::{ConnectionRecovery, DedicatedSenderManager, SenderSettings},
        stats::TransportStats,
        transport::{ConnectionListener, Loopback, MessageReceiver},
    },
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender},
    dashmap::DashMap,
    log::*,
    parking_lot::{Mutex, RwLock},
    socket2::{Domain, Protocol, SockAddr, Socket, Type},
    std::{
        collections::HashMap,
        net::{SocketAddr, TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Weak,
        },
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

const LISTEN_BACKLOG: i32 = 1024;

// ── Connection maps ─────────────────────────────────────────────────────────

fn map_index(nic: Nic, slot: SocketSlot) -> usize {
    match (nic, slot) {
        (Nic::Primary, SocketSlot::Primary) => 0,
        (Nic::Primary, SocketSlot::Secondary) => 1,
        (Nic::Secondary, SocketSlot::Primary) => 2,
        (Nic::Secondary, SocketSlot::Secondary) => 3,
    }
}

fn is_primary(conn: &PeerConnection) -> bool {
    conn.nic() == Nic::Primary && conn.slot() == SocketSlot::Primary
}

#[derive(Default)]
struct ConnectionMaps([HashMap<Address, Arc<PeerConnection>>; 4]);

impl ConnectionMaps {
    fn get(&self, nic: Nic, slot: SocketSlot, peer: &Address) -> Option<&Arc<PeerConnection>> {
        self.0[map_index(nic, slot)].get(peer)
    }

    fn insert(&mut self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        self.0[map_index(conn.nic(), conn.slot())].insert(conn.peer(), conn)
    }

    fn remove(&mut self, nic: Nic, slot: SocketSlot, peer: &Address) -> Option<Arc<PeerConnection>> {
        self.0[map_index(nic, slot)].remove(peer)
    }

    /// Remove `conn` only if it is still the registered entry.
    fn remove_same(&mut self, conn: &Arc<PeerConnection>) -> bool {
        let map = &mut self.0[map_index(conn.nic(), conn.slot())];
        if map
            .get(&conn.peer())
            .is_some_and(|registered| Arc::ptr_eq(registered, conn))
        {
            map.remove(&conn.peer());
            true
        } else {
            false
        }
    }

    fn drain_where(
        &mut self,
        mut pred: impl FnMut(&PeerConnection) -> bool,
    ) -> Vec<Arc<PeerConnection>> {
        let mut drained = Vec::new();
        for map in &mut self.0 {
            map.retain(|_, conn| {
                if pred(conn) {
                    drained.push(conn.clone());
                    false
                } else {
                    true
                }
            });
        }
        drained
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<PeerConnection>> {
        self.0.iter().flat_map(HashMap::values)
    }

    fn len(&self) -> usize {
        self.0.iter().map(HashMap::len).sum()
    }
}

// ── Table ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Services {
    listen_addrs: Vec<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
    reaper_exit: Option<Sender<()>>,
    loopback: Option<Loopback>,
}

pub struct ConnectionTable {
    config: TransportConfig,
    stats: Arc<TransportStats>,
    ids: ConnectIdGenerator,
    local: RwLock<Option<Address>>,
    local_secondary: RwLock<Option<Address>>,
    conns: RwLock<ConnectionMaps>,
    senders: DashMap<Address, Arc<DedicatedSenderManager>>,
    /// Serializes dials toward one peer.
    dial_locks: DashMap<Address, Arc<Mutex<()>>>,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    /// Membership as of the last `synchronize_membership`.
    members: RwLock<Vec<Address>>,
    operational: AtomicBool,
    started: AtomicBool,
    exit: AtomicBool,
    round_robin: AtomicUsize,
    services: Mutex<Services>,
    me: Weak<ConnectionTable>,
}

impl ConnectionTable {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            stats: Arc::new(TransportStats::default()),
            ids: ConnectIdGenerator::default(),
            local: RwLock::new(None),
            local_secondary: RwLock::new(None),
            conns: RwLock::new(ConnectionMaps::default()),
            senders: DashMap::new(),
            dial_locks: DashMap::new(),
            receiver: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            members: RwLock::new(Vec::new()),
            operational: AtomicBool::new(false),
            started: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            services: Mutex::new(Services::default()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    fn owner(&self) -> Weak<dyn ConnectionOwner> {
        self.me.clone()
    }

    fn recovery(&self) -> Weak<dyn ConnectionRecovery> {
        self.me.clone()
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.exit.load(Ordering::Acquire)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Bind the listeners and start the acceptor, loopback and reaper
    /// threads. Returns the local primary address.
    pub fn start(&self) -> Result<Address> {
        self.config.validate()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return self.local_address().ok_or(ClusterNetError::NotStarted);
        }

        let primary = match bind_listener(self.config.bind_addr, self.config.port_range) {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let local = Address::from(primary.local_addr()?);
        *self.local.write() = Some(local);

        let mut services = self.services.lock();
        services.listen_addrs.push(local.socket_addr());
        services
            .threads
            .push(spawn_acceptor(self.me.clone(), primary, Nic::Primary)?);

        if let Some(ip) = self.config.secondary_bind_addr {
            let listener = bind_listener(
                SocketAddr::new(ip, self.config.bind_addr.port()),
                self.config.port_range,
            )?;
            let secondary = Address::from(listener.local_addr()?);
            *self.local_secondary.write() = Some(secondary);
            services.listen_addrs.push(secondary.socket_addr());
            services
                .threads
                .push(spawn_acceptor(self.me.clone(), listener, Nic::Secondary)?);
            info!("secondary NIC listening on {}", secondary);
        }

        let me = self.me.clone();
        services.loopback = Some(Loopback::start(move |msg| {
            if let Some(table) = me.upgrade() {
                table.deliver(msg);
            }
        })?);

        if self.config.use_idle_reaper {
            let (exit_sender, exit_receiver) = bounded(1);
            services.reaper_exit = Some(exit_sender);
            services.threads.push(spawn_reaper(
                self.me.clone(),
                exit_receiver,
                Duration::from_millis(self.config.reaper_interval_ms),
                Duration::from_millis(self.config.conn_expire_time_ms),
            )?);
        }

        info!("connection table listening on {}", local);
        Ok(local)
    }

    /// Announce departure on every primary connection, close everything and
    /// join the service threads.
    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) || self.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        let (listen_addrs, threads, reaper_exit, loopback) = {
            let mut services = self.services.lock();
            (
                std::mem::take(&mut services.listen_addrs),
                std::mem::take(&mut services.threads),
                services.reaper_exit.take(),
                services.loopback.take(),
            )
        };
        drop(reaper_exit);

        // Unblock acceptors parked in accept().
        for addr in &listen_addrs {
            if let Err(e) = TcpStream::connect_timeout(addr, Duration::from_secs(1)) {
                debug!("could not wake acceptor on {}: {}", addr, e);
            }
        }

        let managers: Vec<_> = self
            .senders
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.senders.clear();
        managers.iter().for_each(|manager| manager.dispose());

        let conns = self.conns.write().drain_where(|_| true);
        for conn in &conns {
            if is_primary(conn) && conn.is_connected() {
                if let Err(e) = conn.send_leave_notification() {
                    debug!("could not announce leave to {}: {}", conn.peer(), e);
                }
            }
            conn.destroy();
            self.stats.connections_closed.inc();
        }

        if let Some(loopback) = loopback {
            loopback.stop();
        }
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() != current && thread.join().is_err() {
                warn!("connection table service thread panicked");
            }
        }
        info!("connection table stopped ({} connections closed)", conns.len());
    }

    // ── Registration ────────────────────────────────────────────────────────

    fn handle_accepted(&self, stream: TcpStream, nic: Nic) {
        let Some(local) = self.local_address() else {
            return;
        };
        let params = HandshakeParams {
            config: &self.config,
            local,
            ids: &self.ids,
        };
        let handshake = match Handshake::accept(&params, stream) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("inbound handshake on {:?} NIC failed: {}", nic, e);
                return;
            }
        };
        let peer = handshake.peer;
        if !handshake.peer_connecting_first_time && !self.is_member_or_unknown(&peer) {
            info!("{} reconnected but is no longer a member, asking it to leave", peer);
            match PeerConnection::new(
                handshake,
                nic,
                SocketSlot::Primary,
                false,
                &self.config,
                self.stats.clone(),
            ) {
                Ok(conn) => {
                    if let Err(e) = conn.send_leave_notification() {
                        debug!("leave notice to {} failed: {}", peer, e);
                    }
                    conn.destroy();
                }
                Err(e) => debug!("could not wrap rejected connection from {}: {}", peer, e),
            }
            return;
        }
        if let Err(e) = self.register(handshake, nic, SocketSlot::Primary, false) {
            warn!("could not register connection from {}: {}", peer, e);
        }
    }

    /// Insert a completed handshake, resolving a race with an existing
    /// entry. Returns the connection that holds the entry afterwards.
    fn register(
        &self,
        handshake: Handshake,
        nic: Nic,
        requested: SocketSlot,
        initiator: bool,
    ) -> Result<Arc<PeerConnection>> {
        let peer = handshake.peer;
        let id = handshake.connect_info.id;
        let mut conns = self.conns.write();

        let slot = if !initiator
            && nic == Nic::Primary
            && self.config.use_dual_socket
            && conns
                .get(nic, SocketSlot::Primary, &peer)
                .is_some_and(|conn| conn.is_connected())
            && conns.get(nic, SocketSlot::Secondary, &peer).is_none()
        {
            SocketSlot::Secondary
        } else {
            requested
        };

        let existing = conns.get(nic, slot, &peer).cloned();
        if let Some(existing) = &existing {
            if existing.is_connected() && existing.connect_info().id < id {
                drop(conns);
                debug!(
                    "keeping connection {} to {}, discarding {}",
                    existing.connect_info().id,
                    peer,
                    id
                );
                self.discard_loser(handshake, nic, slot, initiator);
                return Ok(existing.clone());
            }
        }

        let conn = PeerConnection::new(
            handshake,
            nic,
            slot,
            initiator,
            &self.config,
            self.stats.clone(),
        )?;
        conns.insert(conn.clone());
        drop(conns);

        if let Some(old) = existing {
            debug!(
                "connection {} to {} replaced by {}",
                old.connect_info().id,
                peer,
                id
            );
            old.destroy_silent();
            self.stats.connections_closed.inc();
        }

        if let Err(e) = conn.start_receiving(self.owner()) {
            self.conns.write().remove_same(&conn);
            conn.destroy();
            return Err(e);
        }
        self.stats.connections_opened.inc();

        if self.config.use_dedicated_sender {
            if let Err(e) = self.sender_for(peer).add_sender(conn.clone()) {
                warn!("could not start sender for {}: {}", peer, e);
            }
        }
        if nic == Nic::Primary && slot == SocketSlot::Primary {
            self.notify(|listener| listener.connection_opened(&peer));
        }
        info!(
            "connection {} to {} established ({:?} NIC, {:?} slot, {})",
            id,
            peer,
            nic,
            slot,
            if initiator { "outbound" } else { "inbound" }
        );
        Ok(conn)
    }

    fn discard_loser(&self, handshake: Handshake, nic: Nic, slot: SocketSlot, initiator: bool) {
        let peer = handshake.peer;
        match PeerConnection::new(
            handshake,
            nic,
            slot,
            initiator,
            &self.config,
            self.stats.clone(),
        ) {
            Ok(loser) => loser.destroy_silent(),
            Err(e) => debug!("dropping losing connection to {}: {}", peer, e),
        }
    }

    fn discard_if_registered(&self, conn: &Arc<PeerConnection>) -> bool {
        self.conns.write().remove_same(conn)
    }

    fn sender_for(&self, peer: Address) -> Arc<DedicatedSenderManager> {
        self.senders
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(DedicatedSenderManager::new(
                    peer,
                    self.config.sender_queue_capacity,
                    SenderSettings {
                        nagling_size: self.config.nagling.then_some(self.config.nagling_size),
                        frame_capacity: self.config.nagling_size,
                        resend_delay: Duration::from_millis(
                            self.config.reconnect_resend_delay_ms,
                        ),
                    },
                    self.recovery(),
                    self.stats.clone(),
                ))
            })
            .value()
            .clone()
    }

    // ── Dialing ─────────────────────────────────────────────────────────────

    fn dial_lock(&self, peer: &Address) -> Arc<Mutex<()>> {
        self.dial_locks
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn dial_and_register(
        &self,
        peer: Address,
        target: Address,
        nic: Nic,
        slot: SocketSlot,
        connecting_first_time: bool,
    ) -> Result<Arc<PeerConnection>> {
        let local = self.local_address().ok_or(ClusterNetError::NotStarted)?;
        let params = HandshakeParams {
            config: &self.config,
            local,
            ids: &self.ids,
        };
        let bind_ip = match nic {
            Nic::Primary => Some(local.ip()),
            Nic::Secondary => self.config.secondary_bind_addr,
        };
        let handshake = Handshake::connect(&params, target, bind_ip, connecting_first_time)?;
        if handshake.peer != peer {
            let advertised = handshake.peer;
            handshake.discard();
            return Err(ClusterNetError::ConnectionFailed(
                target,
                format!("expected {peer}, peer advertised {advertised}"),
            ));
        }
        self.register(handshake, nic, slot, true)
    }

    fn dial(&self, peer: &Address, connecting_first_time: bool) -> Option<Arc<PeerConnection>> {
        match self.dial_and_register(
            *peer,
            *peer,
            Nic::Primary,
            SocketSlot::Primary,
            connecting_first_time,
        ) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("could not connect to {}: {}", peer, e);
                self.notify(|listener| listener.could_not_connect_to(peer));
                None
            }
        }
    }

    /// Return a connected connection to `peer`, dialing one when
    /// `reestablish` is set and none exists.
    pub fn get_or_create(&self, peer: &Address, reestablish: bool) -> Option<Arc<PeerConnection>> {
        if let Some(conn) = self.connection(peer) {
            return Some(conn);
        }
        if !reestablish || !self.is_running() {
            return None;
        }
        let lock = self.dial_lock(peer);
        let _guard = lock.lock();
        if let Some(conn) = self.connection(peer) {
            return Some(conn);
        }
        let conn = self.dial(peer, true)?;
        if self.config.use_dual_socket {
            if let Err(e) =
                self.dial_and_register(*peer, *peer, Nic::Primary, SocketSlot::Secondary, true)
            {
                debug!("second socket to {} failed: {}", peer, e);
            }
        }
        Some(conn)
    }

    /// Replace a dead primary connection to `peer`. Concurrent callers
    /// converge on the same connection.
    pub fn reestablish(&self, peer: &Address) -> Option<Arc<PeerConnection>> {
        if !self.is_running() {
            return None;
        }
        let lock = self.dial_lock(peer);
        // Bounded wait: the holder may be tearing down a connection whose
        // sender is the caller.
        let Some(_guard) = lock.try_lock_for(self.config.connect_timeout()) else {
            return self.connection(peer);
        };
        if let Some(conn) = self
            .conns
            .read()
            .get(Nic::Primary, SocketSlot::Primary, peer)
            .filter(|conn| conn.is_connected())
        {
            return Some(conn.clone());
        }
        self.dial(peer, false)
    }

    /// Retry [`Self::reestablish`] for a member of the current view.
    pub fn reconnect(&self, peer: &Address) -> Option<Arc<PeerConnection>> {
        if !self.members.read().contains(peer) {
            debug!("not reconnecting to {}: not a member", peer);
            return None;
        }
        let retries = self.config.connection_retries.max(1);
        for attempt in 1..=retries {
            if !self.is_running() {
                return None;
            }
            if let Some(conn) = self.reestablish(peer) {
                self.stats.reconnects.inc();
                info!("reconnected to {} (attempt {})", peer, attempt);
                return Some(conn);
            }
            if attempt < retries {
                thread::sleep(Duration::from_millis(
                    self.config.connection_retry_interval_ms,
                ));
            }
        }
        warn!("giving up on {} after {} attempts", peer, retries);
        None
    }

    /// The primary connection to `peer` is gone and will not come back.
    fn connection_lost(&self, peer: &Address) {
        self.notify(|listener| listener.connection_closed(peer));
        self.remove(peer, true);
    }

    /// Dial the secondary NIC of `peer`, asking its primary connection for
    /// the address first.
    pub fn connect_to_peer_on_secondary_address(
        &self,
        peer: &Address,
    ) -> Result<Option<Arc<PeerConnection>>> {
        if self.config.secondary_bind_addr.is_none() {
            return Ok(None);
        }
        let primary = self.connection(peer).ok_or_else(|| {
            ClusterNetError::ConnectionFailed(*peer, "no primary connection".to_string())
        })?;
        let Some(target) = primary.secondary_address()? else {
            debug!("{} has no secondary NIC", peer);
            return Ok(None);
        };
        self.dial_and_register(*peer, target, Nic::Secondary, SocketSlot::Primary, true)
            .map(Some)
    }

    // ── Membership ──────────────────────────────────────────────────────────

    fn is_member_or_unknown(&self, peer: &Address) -> bool {
        let members = self.members.read();
        members.is_empty() || members.contains(peer)
    }

    /// Whether the local node is the one that dials `peer`.
    fn should_dial(&self, peer: &Address) -> bool {
        let Some(local) = self.local_address() else {
            return false;
        };
        let members = self.members.read();
        let position = |addr: &Address| members.iter().position(|m| m == addr);
        matches!((position(peer), position(&local)), (Some(p), Some(l)) if p < l)
    }

    /// Bring the table in line with `members`: dial every member that
    /// precedes the local node, wait for the dials, and close connections
    /// to former members. Returns the members that could not be reached.
    pub fn synchronize_membership(
        &self,
        members: &[Address],
        establish_secondary: bool,
    ) -> Result<Vec<Address>> {
        let local = self.local_address().ok_or(ClusterNetError::NotStarted)?;
        *self.members.write() = members.to_vec();
        let seniors = members
            .iter()
            .position(|member| *member == local)
            .map_or(&[][..], |index| &members[..index]);

        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for peer in seniors.iter().copied() {
            if self.connection(&peer).is_some() {
                continue;
            }
            let (done, wait) = bounded(1);
            let me = self.me.clone();
            let spawned = Builder::new()
                .name("cmConnect".to_string())
                .spawn(move || {
                    let connected = me
                        .upgrade()
                        .and_then(|table| table.get_or_create(&peer, true))
                        .is_some();
                    let _ = done.send(connected);
                });
            match spawned {
                Ok(_) => pending.push((peer, wait)),
                Err(e) => {
                    warn!("could not spawn dial to {}: {}", peer, e);
                    failed.push(peer);
                }
            }
        }
        let wait_for = Duration::from_millis(self.config.async_connect_wait_ms);
        for (peer, wait) in pending {
            if !matches!(wait.recv_timeout(wait_for), Ok(true)) {
                failed.push(peer);
            }
        }

        self.conns
            .read()
            .iter()
            .filter(|conn| members.contains(&conn.peer()))
            .for_each(|conn| conn.mark_part_of_cluster());

        let departed = self
            .conns
            .write()
            .drain_where(|conn| conn.is_part_of_cluster() && !members.contains(&conn.peer()));
        for conn in &departed {
            info!("closing connection to departed member {}", conn.peer());
            conn.destroy_silent();
            self.stats.connections_closed.inc();
            if is_primary(conn) {
                if let Some((_, manager)) = self.senders.remove(&conn.peer()) {
                    manager.dispose();
                }
            }
        }

        if establish_secondary && self.config.secondary_bind_addr.is_some() {
            for peer in seniors.iter().filter(|peer| !failed.contains(*peer)) {
                let has_secondary = self
                    .conns
                    .read()
                    .get(Nic::Secondary, SocketSlot::Primary, peer)
                    .is_some_and(|conn| conn.is_connected());
                if has_secondary {
                    continue;
                }
                if let Err(e) = self.connect_to_peer_on_secondary_address(peer) {
                    warn!("secondary NIC connection to {} failed: {}", peer, e);
                }
            }
        }

        if !failed.is_empty() {
            warn!("could not reach members {:?}", failed);
            self.notify(|listener| listener.failed_nodes(&failed));
        }
        Ok(failed)
    }

    pub fn members(&self) -> Vec<Address> {
        self.members.read().clone()
    }

    // ── Removal ─────────────────────────────────────────────────────────────

    /// Close connections to `peer`. With `is_primary` every connection and
    /// the peer's sender go; otherwise only the second socket of the
    /// primary NIC.
    pub fn remove(&self, peer: &Address, is_primary: bool) {
        let removed = {
            let mut conns = self.conns.write();
            let mut removed = Vec::new();
            if is_primary {
                removed.extend(conns.remove(Nic::Primary, SocketSlot::Primary, peer));
                removed.extend(conns.remove(Nic::Secondary, SocketSlot::Primary, peer));
                removed.extend(conns.remove(Nic::Secondary, SocketSlot::Secondary, peer));
            }
            removed.extend(conns.remove(Nic::Primary, SocketSlot::Secondary, peer));
            removed
        };
        for conn in &removed {
            conn.destroy();
            self.stats.connections_closed.inc();
        }
        if is_primary {
            if let Some((_, manager)) = self.senders.remove(peer) {
                manager.dispose();
            }
        }
        debug!("removed {} connection(s) to {}", removed.len(), peer);
    }

    /// Destroy connections idle for longer than `expiry`.
    fn reap_idle(&self, expiry: Duration) -> usize {
        let idle = self
            .conns
            .write()
            .drain_where(|conn| conn.idle_for() > expiry);
        for conn in &idle {
            info!(
                "reaping connection to {} idle for {:?}",
                conn.peer(),
                conn.idle_for()
            );
            conn.destroy_silent();
            self.stats.connections_closed.inc();
            if is_primary(conn) {
                if let Some((_, manager)) = self.senders.remove(&conn.peer()) {
                    manager.dispose();
                }
            }
        }
        idle.len()
    }

    // ── Messaging ───────────────────────────────────────────────────────────

    /// Encode and send `msg` to `dest`.
    pub fn send_to(&self, dest: &Address, msg: &Message, reestablish: bool) -> Result<()> {
        self.send_binary(dest, BinaryMessage::encode(msg)?, reestablish)
    }

    /// Send an encoded message to `dest`. With dedicated senders the
    /// message is queued; a full queue is reported to the caller.
    pub fn send_binary(&self, dest: &Address, msg: BinaryMessage, reestablish: bool) -> Result<()> {
        if !self.is_running() {
            return Err(ClusterNetError::NotStarted);
        }
        if self.config.use_dedicated_sender {
            if let Some(manager) = self.senders.get(dest).map(|entry| entry.value().clone()) {
                return manager.enqueue(msg);
            }
            self.get_or_create(dest, reestablish).ok_or_else(|| {
                ClusterNetError::ConnectionFailed(*dest, "no connection".to_string())
            })?;
            let manager = self
                .senders
                .get(dest)
                .map(|entry| entry.value().clone())
                .ok_or(ClusterNetError::ConnectionBroken(*dest))?;
            return manager.enqueue(msg);
        }

        let conn = self.get_or_create(dest, reestablish).ok_or_else(|| {
            ClusterNetError::ConnectionFailed(*dest, "no connection".to_string())
        })?;
        match conn.send_message(&msg) {
            Ok(_) => Ok(()),
            Err(ClusterNetError::ConnectionBroken(_)) if reestablish => {
                let conn = self
                    .reestablish(dest)
                    .ok_or(ClusterNetError::ConnectionBroken(*dest))?;
                conn.send_message(&msg).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a message for delivery to the local receiver.
    pub fn deliver_local(&self, mut msg: Message) -> Result<()> {
        msg.src = self.local_address();
        let services = self.services.lock();
        let loopback = services
            .loopback
            .as_ref()
            .ok_or(ClusterNetError::NotStarted)?;
        loopback.send(msg)
    }

    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, f: impl Fn(&dyn ConnectionListener)) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    pub fn set_operational(&self, operational: bool) {
        self.operational.store(operational, Ordering::Release);
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn local_address(&self) -> Option<Address> {
        *self.local.read()
    }

    pub fn local_secondary_address(&self) -> Option<Address> {
        *self.local_secondary.read()
    }

    /// A connected primary-NIC connection to `peer`. With dual sockets the
    /// two sockets are used in turn.
    pub fn connection(&self, peer: &Address) -> Option<Arc<PeerConnection>> {
        let conns = self.conns.read();
        let primary = conns
            .get(Nic::Primary, SocketSlot::Primary, peer)
            .filter(|conn| conn.is_connected());
        if self.config.use_dual_socket {
            let second = conns
                .get(Nic::Primary, SocketSlot::Secondary, peer)
                .filter(|conn| conn.is_connected());
            match (primary, second) {
                (Some(first), Some(second)) => {
                    let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
                    let chosen = if turn % 2 == 0 { first } else { second };
                    return Some(chosen.clone());
                }
                (None, Some(second)) => return Some(second.clone()),
                _ => {}
            }
        }
        primary.cloned()
    }

    /// Every registered connection to `peer`, live or not.
    pub fn connections_to(&self, peer: &Address) -> Vec<Arc<PeerConnection>> {
        self.conns
            .read()
            .iter()
            .filter(|conn| conn.peer() == *peer)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, peer: &Address) -> bool {
        self.conns
            .read()
            .get(Nic::Primary, SocketSlot::Primary, peer)
            .is_some_and(|conn| conn.is_connected())
    }

    /// Id of the primary connection to `peer`.
    pub fn connect_id(&self, peer: &Address) -> Option<u32> {
        self.conns
            .read()
            .get(Nic::Primary, SocketSlot::Primary, peer)
            .map(|conn| conn.connect_info().id)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    /// Ask `peer` whether it is still initializing.
    pub fn is_peer_in_initialization_phase(&self, peer: &Address) -> Result<bool> {
        self.connection(peer)
            .ok_or(ClusterNetError::ConnectionBroken(*peer))?
            .is_peer_in_initialization_phase()
    }
}

impl Drop for ConnectionTable {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Callbacks from connections and senders ──────────────────────────────────

impl ConnectionOwner for ConnectionTable {
    fn deliver(&self, msg: Message) {
        let receiver = self.receiver.read().clone();
        match receiver {
            Some(receiver) => receiver.receive(msg),
            None => trace!("no receiver, dropping {} from {:?}", msg.kind(), msg.src),
        }
    }

    fn connection_broken(&self, conn: &Arc<PeerConnection>) {
        if !self.is_running() || !self.discard_if_registered(conn) {
            return;
        }
        self.stats.connections_closed.inc();
        let peer = conn.peer();
        warn!("connection {} to {} broke", conn.connect_info().id, peer);
        if !is_primary(conn) || !self.should_dial(&peer) {
            return;
        }
        let me = self.me.clone();
        let spawned = Builder::new()
            .name("cmReconnect".to_string())
            .spawn(move || {
                if let Some(table) = me.upgrade() {
                    if table.reconnect(&peer).is_none() && table.is_running() {
                        table.connection_lost(&peer);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("could not spawn reconnect to {}: {}", peer, e);
        }
    }

    fn peer_left(&self, conn: &Arc<PeerConnection>) {
        let peer = conn.peer();
        info!("{} is leaving", peer);
        if is_primary(conn) {
            self.connection_lost(&peer);
        } else if self.discard_if_registered(conn) {
            self.stats.connections_closed.inc();
        }
    }

    fn closed_silently(&self, conn: &Arc<PeerConnection>) {
        if self.discard_if_registered(conn) {
            self.stats.connections_closed.inc();
            debug!(
                "{} closed connection {}",
                conn.peer(),
                conn.connect_info().id
            );
        }
    }

    fn is_operational(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    fn secondary_address(&self) -> Option<Address> {
        self.local_secondary_address()
    }
}

impl ConnectionRecovery for ConnectionTable {
    fn reconnect(&self, peer: &Address) -> Option<Arc<PeerConnection>> {
        ConnectionTable::reconnect(self, peer)
    }

    fn sender_failed(&self, conn: &Arc<PeerConnection>) {
        if !self.is_running() {
            return;
        }
        if is_primary(conn) {
            warn!("lost {}, no connection could be re-established", conn.peer());
            self.connection_lost(&conn.peer());
        } else if self.discard_if_registered(conn) {
            conn.destroy();
            self.stats.connections_closed.inc();
        }
    }
}

// ── Service threads ─────────────────────────────────────────────────────────

fn bind_listener(addr: SocketAddr, port_range: u16) -> Result<TcpListener> {
    let mut last_error = None;
    let attempts = if addr.port() == 0 { 1 } else { port_range.max(1) };
    for offset in 0..attempts {
        let Some(port) = addr.port().checked_add(offset) else {
            break;
        };
        let candidate = SocketAddr::new(addr.ip(), port);
        let bound = Socket::new(Domain::for_address(candidate), Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| {
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(candidate))?;
                socket.listen(LISTEN_BACKLOG)?;
                Ok(socket)
            });
        match bound {
            Ok(socket) => return Ok(TcpListener::from(socket)),
            Err(e) => {
                debug!("could not bind {}: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| std::io::Error::other(format!("no port available from {addr}")))
        .into())
}

fn spawn_acceptor(
    table: Weak<ConnectionTable>,
    listener: TcpListener,
    nic: Nic,
) -> Result<JoinHandle<()>> {
    Ok(Builder::new()
        .name("cmAcceptor".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                let Some(table) = table.upgrade() else {
                    break;
                };
                if table.exit.load(Ordering::Acquire) {
                    break;
                }
                match stream {
                    Ok(stream) => table.handle_accepted(stream, nic),
                    Err(e) => debug!("accept on {:?} NIC failed: {}", nic, e),
                }
            }
            trace!("acceptor for {:?} NIC exiting", nic);
        })?)
}

fn spawn_reaper(
    table: Weak<ConnectionTable>,
    exit: Receiver<()>,
    interval: Duration,
    expiry: Duration,
) -> Result<JoinHandle<()>> {
    Ok(Builder::new()
        .name("cmConnReaper".to_string())
        .spawn(move || loop {
            match exit.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(table) = table.upgrade() else {
                break;
            };
            let started = Instant::now();
            let reaped = table.reap_idle(expiry);
            if reaped > 0 {
                debug!("reaped {} idle connection(s) in {:?}", reaped, started.elapsed());
            }
        })?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
