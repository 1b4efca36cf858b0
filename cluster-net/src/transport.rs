//! The seams between the connection table and the layers above it.
//!
//! ```text
//!   RequestCorrelator ──Transport::send──►  ConnectionTable ──► peers
//!          ▲                                      │
//!          └──────MessageReceiver::receive────────┘
//! ```
//!
//! Messages addressed to the local node never touch a socket. They are
//! handed to a [`Loopback`] worker and delivered on its thread, so a
//! caller that holds a lock while sending cannot re-enter itself.

use {
    crate::{
        address::Address,
        codec::BinaryMessage,
        error::{ClusterNetError, Result},
        message::Message,
        table::ConnectionTable,
    },
    crossbeam_channel::{unbounded, Sender},
    log::*,
    parking_lot::Mutex,
    std::thread::{Builder, JoinHandle},
};

/// Outbound half of the transport, as seen by the correlator.
pub trait Transport: Send + Sync {
    /// Send `msg` to every address in `msg.dests`, or to `msg.dest` when
    /// `dests` is unset.
    fn send(&self, msg: Message) -> Result<()>;

    /// Primary address of the local node, once known.
    fn local_address(&self) -> Option<Address>;
}

/// Inbound half: receives every application message the table accepts.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, msg: Message);
}

/// Connection lifecycle notifications.
pub trait ConnectionListener: Send + Sync {
    fn connection_opened(&self, _peer: &Address) {}

    /// The primary connection to `peer` is gone for good.
    fn connection_closed(&self, _peer: &Address) {}

    fn could_not_connect_to(&self, _peer: &Address) {}

    /// Members `synchronize_membership` could not reach.
    fn failed_nodes(&self, _nodes: &[Address]) {}
}

// ── Loopback ────────────────────────────────────────────────────────────────

/// Worker thread that delivers locally addressed messages.
pub(crate) struct Loopback {
    sender: Mutex<Option<Sender<Message>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Loopback {
    pub(crate) fn start<F>(deliver: F) -> Result<Self>
    where
        F: Fn(Message) + Send + 'static,
    {
        let (sender, receiver) = unbounded::<Message>();
        let thread = Builder::new()
            .name("cmLoopback".to_string())
            .spawn(move || {
                for msg in receiver.iter() {
                    deliver(msg);
                }
                trace!("loopback worker exiting");
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn send(&self, msg: Message) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ClusterNetError::NotStarted)?;
        sender.send(msg).map_err(|_| ClusterNetError::QueueClosed)
    }

    /// Drain what is queued, then stop the worker.
    pub(crate) fn stop(&self) {
        drop(self.sender.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
                warn!("loopback worker panicked");
            }
        }
    }
}

// ── Table as transport ──────────────────────────────────────────────────────

impl Transport for ConnectionTable {
    fn send(&self, msg: Message) -> Result<()> {
        let local = self.local_address().ok_or(ClusterNetError::NotStarted)?;
        let Some(dests) = msg.dests.clone() else {
            let dest = msg.dest.ok_or_else(|| {
                ClusterNetError::Framing("message has no destination".to_string())
            })?;
            return if dest == local {
                self.deliver_local(msg)
            } else {
                self.send_to(&dest, &msg, true)
            };
        };

        // Failures toward single members are left to suspicion and timeouts.
        let binary = BinaryMessage::encode(&msg)?;
        for dest in &dests {
            let result = if *dest == local {
                let mut copy = msg.clone();
                copy.dest = Some(*dest);
                self.deliver_local(copy)
            } else {
                self.send_binary(dest, binary.clone(), true)
            };
            if let Err(e) = result {
                warn!("multicast to {} failed: {}", dest, e);
            }
        }
        Ok(())
    }

    fn local_address(&self) -> Option<Address> {
        ConnectionTable::local_address(self)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn test_loopback_delivers_in_order() {
        let (tx, rx) = unbounded();
        let loopback = Loopback::start(move |msg: Message| {
            let _ = tx.send(msg.body);
        })
        .unwrap();
        for i in 0..5u8 {
            loopback.send(Message::new(None, vec![i])).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![i]);
        }
        loopback.stop();
        assert!(matches!(
            loopback.send(Message::default()),
            Err(ClusterNetError::NotStarted)
        ));
    }
}
