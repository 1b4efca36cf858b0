//! Cachemesh Cluster Transport
//!
//! This crate moves messages between the nodes of a Cachemesh cluster and
//! correlates the replies to the requests that caused them. It handles:
//!
//! - **Framing**: batches of messages, each with an optional raw payload,
//!   are written as length-prefixed frames over TCP.
//! - **Connections**: one table per node holds a connection to every
//!   member, resolves simultaneous dials, reconnects on demand and can
//!   hand a peer its own sender thread and queue.
//! - **Request correlation**: requests carry an id, replies are routed
//!   back to whoever is waiting, and a requester that has waited too long
//!   can ask a peer whether the request arrived at all.
//! - **Group requests**: one request sent to several members, completed
//!   according to a response mode and bounded by a timeout, with support
//!   for requests that are forwarded to further replicas (n-hop).
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  Cache (owner of the handler and the requests)  │
//!  └───────────────┬──────────────────▲──────────────┘
//!                  │ GroupRequest     │ RequestHandler
//!  ┌───────────────▼──────────────────┴──────────────┐
//!  │  RequestCorrelator                              │
//!  │  • request ids, pending collectors              │
//!  │  • replies, status enquiries, n-hop forwarding  │
//!  └───────────────┬──────────────────▲──────────────┘
//!                  │ Transport        │ MessageReceiver
//!  ┌───────────────▼──────────────────┴──────────────┐
//!  │  ConnectionTable                                │
//!  │  • listener, PeerConnection per member          │
//!  │  • dedicated senders, loopback delivery         │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`address`]        | Member addresses and views |
//! | [`codec`]          | Frame encoding, incremental frame reader |
//! | [`config`]         | `TransportConfig` and `CorrelatorConfig` with dev overrides |
//! | [`connection`]     | Handshake and a single peer connection |
//! | [`correlator`]     | Request ids, reply routing, request status enquiries |
//! | [`error`]          | Crate-wide error enum |
//! | [`group_request`]  | Multi-member requests and response modes |
//! | [`header`]         | Correlator header and reply payloads |
//! | [`message`]        | Messages, priorities and connection headers |
//! | [`request_status`] | Record of accepted requests and its cleaner |
//! | [`sender`]         | Per-peer send queues and sender threads |
//! | [`stats`]          | Transport counters |
//! | [`table`]          | The connection table |
//! | [`transport`]      | Seams between the table and the correlator |

pub mod address;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod group_request;
pub mod header;
pub mod message;
pub mod request_status;
pub mod sender;
pub mod stats;
pub mod table;
pub mod transport;
