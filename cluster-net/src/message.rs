//! Message types carried by the cluster transport.
//!
//! A [`Message`] is the unit handed between the connection table, the
//! request correlator and the application. Protocol layers attach typed
//! headers from the closed [`Header`] enum; the body and the optional
//! payload chunks are opaque bytes produced by the application codec.
//!
//! On the wire the destination, headers and body travel as one bincode
//! envelope. The flags travel in the flag byte of the frame entry and the
//! payload chunks follow the envelope raw (see [`crate::codec`]).

use {
    crate::{
        address::Address,
        error::{ClusterNetError, Result},
        header::CorrelatorHeader,
    },
    bitflags::bitflags,
    serde::{Deserialize, Serialize},
    std::time::Instant,
};

bitflags! {
    /// Per-message flags carried in the frame entry's flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// Connection-level control message, consumed by the receive loop.
        const CONTROL = 0b0000_0001;
        /// The message belongs to a sequenced (totally ordered) stream.
        const SEQ_REQUIRED = 0b0000_0010;
        /// The sender waits for an answer.
        const RESPONSE_EXPECTED = 0b0000_0100;
    }
}

/// Outbound scheduling class used by the dedicated sender queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub(crate) const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

// ── Headers ─────────────────────────────────────────────────────────────────

/// Connection-level control header.
///
/// Control messages have no body; whatever they carry lives in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionHeader {
    /// The sender is closing this socket on purpose; do not reconnect.
    CloseSilent,
    /// The sender is leaving the cluster.
    Leave,
    /// Ask the peer for the address of its secondary NIC listener.
    GetSecondAddressReq,
    /// Answer to [`ConnectionHeader::GetSecondAddressReq`].
    GetSecondAddressRsp(Option<Address>),
    /// Ask whether the peer is still initializing.
    AreYouInInitializationPhase,
    /// Answer to [`ConnectionHeader::AreYouInInitializationPhase`].
    InitializationPhaseRsp(bool),
}

impl ConnectionHeader {
    /// Integer tag of the control type, used in logs.
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::CloseSilent => 1,
            Self::Leave => 2,
            Self::GetSecondAddressReq => 3,
            Self::GetSecondAddressRsp(_) => 4,
            Self::AreYouInInitializationPhase => 5,
            Self::InitializationPhaseRsp(_) => 6,
        }
    }
}

/// Every header kind a message may carry, one variant per protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    Connection(ConnectionHeader),
    Correlator(CorrelatorHeader),
}

// ── Message ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Unicast destination.
    pub dest: Option<Address>,
    /// Multicast destinations; takes precedence over `dest` when set.
    pub dests: Option<Vec<Address>>,
    /// Sender, stamped by the receiving connection.
    pub src: Option<Address>,
    pub headers: Vec<Header>,
    pub flags: MessageFlags,
    pub body: Vec<u8>,
    /// Out-of-band payload chunks appended to the frame without re-encoding.
    pub payload: Option<Vec<Vec<u8>>>,
    pub priority: Priority,
    /// When the receive loop decoded this message.
    pub arrived_at: Option<Instant>,
}

/// Borrowed form of the wire envelope, used for encoding.
#[derive(Serialize)]
struct EnvelopeRef<'a> {
    dest: &'a Option<Address>,
    headers: &'a [Header],
    body: &'a [u8],
}

/// Owned form of the wire envelope, produced by decoding.
#[derive(Deserialize)]
struct Envelope {
    dest: Option<Address>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl Message {
    pub fn new(dest: Option<Address>, body: Vec<u8>) -> Self {
        Self {
            dest,
            body,
            ..Self::default()
        }
    }

    /// A body-less connection-level control message.
    pub fn control(header: ConnectionHeader) -> Self {
        Self {
            headers: vec![Header::Connection(header)],
            flags: MessageFlags::CONTROL,
            priority: Priority::High,
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Vec<Vec<u8>>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn connection_header(&self) -> Option<ConnectionHeader> {
        self.headers.iter().find_map(|header| match header {
            Header::Connection(hdr) => Some(*hdr),
            Header::Correlator(_) => None,
        })
    }

    pub fn correlator_header(&self) -> Option<&CorrelatorHeader> {
        self.headers.iter().find_map(|header| match header {
            Header::Correlator(hdr) => Some(hdr),
            Header::Connection(_) => None,
        })
    }

    /// Attach `header`, replacing any header of the same layer.
    pub fn put_header(&mut self, header: Header) {
        let same_layer = |existing: &Header| {
            std::mem::discriminant(existing) == std::mem::discriminant(&header)
        };
        match self.headers.iter().position(same_layer) {
            Some(index) => self.headers[index] = header,
            None => self.headers.push(header),
        }
    }

    pub fn remove_correlator_header(&mut self) -> Option<CorrelatorHeader> {
        let index = self
            .headers
            .iter()
            .position(|header| matches!(header, Header::Correlator(_)))?;
        match self.headers.remove(index) {
            Header::Correlator(hdr) => Some(hdr),
            Header::Connection(_) => None,
        }
    }

    pub fn is_seq_required(&self) -> bool {
        self.flags.contains(MessageFlags::SEQ_REQUIRED)
    }

    /// Total size of the payload chunks in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload
            .as_ref()
            .map(|chunks| chunks.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// The payload chunks flattened into one buffer.
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payload.as_ref().map(|chunks| chunks.concat()).unwrap_or_default()
    }

    /// Serialize destination, headers and body into the wire envelope.
    pub(crate) fn encode_envelope(&self) -> Result<Vec<u8>> {
        bincode::serialize(&EnvelopeRef {
            dest: &self.dest,
            headers: &self.headers,
            body: &self.body,
        })
        .map_err(ClusterNetError::Serialization)
    }

    /// Rebuild a message from a decoded envelope, its flag byte and payload.
    pub(crate) fn decode_envelope(
        envelope: &[u8],
        flags: u8,
        payload: Option<Vec<Vec<u8>>>,
    ) -> Result<Self> {
        let Envelope {
            dest,
            headers,
            body,
        } = bincode::deserialize(envelope).map_err(ClusterNetError::Serialization)?;
        Ok(Self {
            dest,
            headers,
            flags: MessageFlags::from_bits_truncate(flags),
            body,
            payload,
            ..Self::default()
        })
    }

    /// Return a human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        if let Some(hdr) = self.connection_header() {
            return match hdr {
                ConnectionHeader::CloseSilent => "close_silent",
                ConnectionHeader::Leave => "leave",
                ConnectionHeader::GetSecondAddressReq => "get_second_address_req",
                ConnectionHeader::GetSecondAddressRsp(_) => "get_second_address_rsp",
                ConnectionHeader::AreYouInInitializationPhase => "are_you_in_init_phase",
                ConnectionHeader::InitializationPhaseRsp(_) => "init_phase_rsp",
            };
        }
        match self.correlator_header() {
            Some(hdr) => hdr.kind(),
            None => "data",
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
