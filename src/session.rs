//! Peer sessions.
//!
//! The wire transport itself lives outside the engine; these traits are its
//! contract. A [`Session`] is a message-framed, reliable-per-session channel
//! to one peer that reconnects on its own; a [`Transport`] opens sessions
//! from an address. Inbound messages do not arrive here — the host feeds
//! them to [`crate::Raft::deliver`].
//!
//! The [`SessionRegistry`] keeps one logical session per known server plus
//! sessions learned from incoming connections, consolidated under the
//! sender id taken from the first RPC on the wire.

use std::collections::HashMap;

use crate::error::Result;
use crate::rpc::Envelope;
use crate::types::ServerId;

/// An outbound channel to one peer.
pub trait Session: Send {
    /// Queue one message. Messages to an unreachable peer may be dropped;
    /// the engine never retries blindly, Raft's own timers recover.
    fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Whether the underlying connection is currently up.
    fn is_connected(&self) -> bool;

    /// Connection generation: bumped by the transport on every successful
    /// (re)connect, so the engine can re-introduce itself.
    fn seqno(&self) -> u64;
}

/// Factory for outbound sessions.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &str) -> Box<dyn Session>;
}

struct Slot {
    session: Box<dyn Session>,
    seen_seqno: u64,
}

/// One logical session per server, plus address-keyed sessions used while
/// joining (before the peers' ids are known).
#[derive(Default)]
pub struct SessionRegistry {
    peers: HashMap<ServerId, Slot>,
    pending: HashMap<String, Slot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a session to `sid` exists, connecting if needed.
    pub fn ensure(&mut self, sid: ServerId, address: &str, transport: &dyn Transport) {
        self.peers.entry(sid).or_insert_with(|| Slot {
            session: transport.connect(address),
            seen_seqno: 0,
        });
    }

    /// Adopt a session learned from an incoming connection. An existing
    /// outbound session wins.
    pub fn attach(&mut self, sid: ServerId, session: Box<dyn Session>) {
        self.peers.entry(sid).or_insert(Slot {
            session,
            seen_seqno: 0,
        });
    }

    /// Open an address-keyed session, used while joining.
    pub fn ensure_pending(&mut self, address: &str, transport: &dyn Transport) {
        if !self.pending.contains_key(address) {
            self.pending.insert(
                address.to_string(),
                Slot {
                    session: transport.connect(address),
                    seen_seqno: 0,
                },
            );
        }
    }

    pub fn remove(&mut self, sid: ServerId) {
        self.peers.remove(&sid);
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.pending.clear();
    }

    /// Send to a peer by id. Returns false if there is no live session;
    /// the message is dropped in that case.
    pub fn send_to(&mut self, sid: ServerId, envelope: &Envelope) -> bool {
        match self.peers.get_mut(&sid) {
            Some(slot) if slot.session.is_connected() => {
                if let Err(err) = slot.session.send(envelope) {
                    tracing::debug!(peer = %sid.short(), error = %err, "send failed");
                    return false;
                }
                true
            }
            _ => false,
        }
    }

    /// Peers whose sessions (re)connected since the last call.
    pub fn reconnected(&mut self) -> Vec<ServerId> {
        let mut fresh = Vec::new();
        for (sid, slot) in &mut self.peers {
            let seqno = slot.session.seqno();
            if seqno != slot.seen_seqno && slot.session.is_connected() {
                slot.seen_seqno = seqno;
                fresh.push(*sid);
            }
        }
        fresh
    }

    /// Pending (address-keyed) sessions that (re)connected since the last
    /// call. Each may carry one join request.
    pub fn pending_reconnected(&mut self) -> Vec<String> {
        let mut fresh = Vec::new();
        for (address, slot) in &mut self.pending {
            let seqno = slot.session.seqno();
            if seqno != slot.seen_seqno && slot.session.is_connected() {
                slot.seen_seqno = seqno;
                fresh.push(address.clone());
            }
        }
        fresh
    }

    /// Send on a pending session by address.
    pub fn send_pending(&mut self, address: &str, envelope: &Envelope) -> bool {
        match self.pending.get_mut(address) {
            Some(slot) if slot.session.is_connected() => {
                slot.session.send(envelope).is_ok()
            }
            _ => false,
        }
    }

    /// Drop the address-keyed sessions once joining is over.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("peers", &self.peers.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Message;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeWire {
        sent: Mutex<Vec<Envelope>>,
        seqno: AtomicU64,
        connected: std::sync::atomic::AtomicBool,
    }

    struct FakeSession(Arc<FakeWire>);

    impl Session for FakeSession {
        fn send(&mut self, envelope: &Envelope) -> Result<()> {
            self.0.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst)
        }

        fn seqno(&self) -> u64 {
            self.0.seqno.load(Ordering::SeqCst)
        }
    }

    struct FakeTransport(Arc<FakeWire>);

    impl Transport for FakeTransport {
        fn connect(&self, _address: &str) -> Box<dyn Session> {
            Box::new(FakeSession(Arc::clone(&self.0)))
        }
    }

    fn hello(from: ServerId) -> Envelope {
        Envelope {
            to: None,
            from,
            cluster: None,
            message: Message::Hello,
        }
    }

    #[test]
    fn test_send_requires_live_session() {
        let wire = Arc::new(FakeWire::default());
        let transport = FakeTransport(Arc::clone(&wire));
        let sid = ServerId::generate();

        let mut registry = SessionRegistry::new();
        assert!(!registry.send_to(sid, &hello(sid)));

        registry.ensure(sid, "tcp:10.0.0.2", &transport);
        assert!(!registry.send_to(sid, &hello(sid)));

        wire.connected.store(true, Ordering::SeqCst);
        assert!(registry.send_to(sid, &hello(sid)));
        assert_eq!(wire.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reconnected_fires_once_per_generation() {
        let wire = Arc::new(FakeWire::default());
        let transport = FakeTransport(Arc::clone(&wire));
        let sid = ServerId::generate();

        let mut registry = SessionRegistry::new();
        registry.ensure(sid, "tcp:10.0.0.2", &transport);
        assert!(registry.reconnected().is_empty());

        wire.connected.store(true, Ordering::SeqCst);
        wire.seqno.store(1, Ordering::SeqCst);
        assert_eq!(registry.reconnected(), vec![sid]);
        assert!(registry.reconnected().is_empty());

        wire.seqno.store(2, Ordering::SeqCst);
        assert_eq!(registry.reconnected(), vec![sid]);
    }

    #[test]
    fn test_attach_does_not_replace_outbound() {
        let wire_a = Arc::new(FakeWire::default());
        let wire_b = Arc::new(FakeWire::default());
        wire_a.connected.store(true, Ordering::SeqCst);
        wire_b.connected.store(true, Ordering::SeqCst);
        let transport = FakeTransport(Arc::clone(&wire_a));
        let sid = ServerId::generate();

        let mut registry = SessionRegistry::new();
        registry.ensure(sid, "tcp:10.0.0.2", &transport);
        registry.attach(sid, Box::new(FakeSession(Arc::clone(&wire_b))));

        registry.send_to(sid, &hello(sid));
        assert_eq!(wire_a.sent.lock().unwrap().len(), 1);
        assert!(wire_b.sent.lock().unwrap().is_empty());
    }
}
