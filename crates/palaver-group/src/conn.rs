//! Per-peer connection state: session keys, lossless send and receive
//! windows, timers, and pending-handshake bookkeeping.
//!
//! Each direction of a peer pair carries 64 in-flight lossless packets
//! at most. The sender parks every outbound packet in a circular window
//! indexed by `message_id % 64` until it is acked; the receiver mirrors
//! that window to reorder out-of-order arrivals. The handshake itself
//! consumes message id 1 on both sides, which is why `send_message_id`
//! starts at 1 and `recv_message_id` at 0.

use palaver_crypto::hash::{self, contexts};
use palaver_crypto::x25519::X25519KeyPair;
use palaver_types::network::{IpPort, RelayNode};
use palaver_types::{PublicKey, SigPublicKey};
use palaver_wire::kinds::{HandshakeRequestType, InnerKind};

use crate::timing;
use crate::{GroupError, Result};

/// Slots in each direction's window.
pub const WINDOW_SIZE: u64 = 64;

/// Relays remembered per peer.
const MAX_SHARED_RELAYS: usize = 4;

/// An unacked outbound packet.
#[derive(Clone, Debug)]
struct SendEntry {
    message_id: u64,
    packet: Vec<u8>,
    time_added: u64,
    last_send_try: u64,
}

/// A buffered out-of-order inbound payload.
#[derive(Clone, Debug)]
struct RecvEntry {
    message_id: u64,
    payload: LosslessPayload,
}

/// A decrypted lossless payload awaiting in-order delivery.
#[derive(Clone, Debug)]
pub struct LosslessPayload {
    pub inner: InnerKind,
    pub body: Vec<u8>,
}

/// Outcome of receiving a lossless packet.
#[derive(Debug)]
pub enum RecvAction {
    /// In order: deliver this payload, then any drained successors.
    Deliver(Vec<(u64, LosslessPayload)>),
    /// Already seen; ack it again so the sender clears its slot.
    Duplicate,
    /// Ahead of the cursor; buffered. Ack with a request for the gap.
    Buffered,
    /// Outside the window; dropped silently.
    OutOfWindow,
}

/// Connection state for one non-self peer.
pub struct PeerConnection {
    /// The peer's long-term encryption public key.
    pub public_key: PublicKey,
    /// The peer's signing public key; zeroed until the handshake.
    pub sig_pk: SigPublicKey,
    /// Direct address, if we know one. Relay-only peers have none.
    pub addr: Option<IpPort>,
    /// Our ephemeral session keypair for this connection.
    session: X25519KeyPair,
    /// Symmetric session key, present after a handshake exchange.
    pub session_key: Option<[u8; 32]>,

    pub handshaked: bool,
    pub confirmed: bool,
    pub pending_sync_request: bool,
    pub pending_state_sync: bool,

    send_window: Vec<Option<SendEntry>>,
    recv_window: Vec<Option<RecvEntry>>,
    /// Next message id to assign to an outbound packet.
    pub send_message_id: u64,
    /// Earliest unacked outbound id.
    send_window_start: u64,
    /// Last in-order delivered inbound id.
    pub recv_message_id: u64,

    /// Relays the peer shared with us, newest last.
    relays: Vec<RelayNode>,
    /// Relay to route an out-of-band handshake through.
    pub oob_relay: Option<RelayNode>,

    /// Unix deadline for sending a scheduled handshake; zero when none.
    pub pending_handshake: u64,
    pub pending_handshake_type: HandshakeRequestType,
    pub is_pending_handshake_response: bool,
    pub is_oob_handshake: bool,

    pub last_rcvd_ping: u64,
    pub last_tcp_relays_shared: u64,
    pub last_ip_port_shared: u64,
    pub time_added: u64,

    /// Shared-state version we advertised in our handshake to this peer.
    pub self_sent_shared_state_version: Option<u32>,
    /// Shared-state version the peer last reported.
    pub peer_shared_state_version: u32,
}

impl PeerConnection {
    /// Create a connection for a newly inserted peer.
    ///
    /// `ping_jitter` desynchronizes the first timeout check across peers.
    pub fn new(public_key: PublicKey, addr: Option<IpPort>, now: u64, ping_jitter: u64) -> Self {
        Self {
            public_key,
            sig_pk: [0u8; 32],
            addr,
            session: X25519KeyPair::generate(),
            session_key: None,
            handshaked: false,
            confirmed: false,
            pending_sync_request: false,
            pending_state_sync: false,
            send_window: vec![None; WINDOW_SIZE as usize],
            recv_window: vec![None; WINDOW_SIZE as usize],
            send_message_id: 1,
            send_window_start: 1,
            recv_message_id: 0,
            relays: Vec::new(),
            oob_relay: None,
            pending_handshake: 0,
            pending_handshake_type: HandshakeRequestType::InviteRequest,
            is_pending_handshake_response: false,
            is_oob_handshake: false,
            last_rcvd_ping: now + (ping_jitter % timing::PING_INTERVAL),
            last_tcp_relays_shared: 0,
            last_ip_port_shared: 0,
            time_added: now,
            self_sent_shared_state_version: None,
            peer_shared_state_version: 0,
        }
    }

    /// Our session public key, sent in handshakes.
    pub fn session_public_key(&self) -> PublicKey {
        self.session.public
    }

    /// Derive and install the symmetric session key from the peer's
    /// session public key.
    pub fn establish_session_key(&mut self, peer_session_pk: &PublicKey) {
        let shared = self.session.secret.diffie_hellman(peer_session_pk);
        self.session_key = Some(hash::derive_key(contexts::SESSION_KEY, shared.as_bytes()));
    }

    /// Remember a relay the peer shared; the newest
    /// [`MAX_SHARED_RELAYS`] are kept.
    pub fn save_relay(&mut self, relay: RelayNode) {
        self.relays.retain(|r| r.public_key != relay.public_key);
        if self.relays.len() >= MAX_SHARED_RELAYS {
            self.relays.remove(0);
        }
        self.relays.push(relay);
    }

    /// The relay most recently shared by this peer, if any.
    pub fn last_relay(&self) -> Option<&RelayNode> {
        self.relays.last()
    }

    // --- send window ---

    /// Park an outbound packet in the send window and claim its id.
    ///
    /// # Errors
    ///
    /// [`GroupError::TransportFailure`] when the slot for this id is
    /// still occupied (64 unacked packets in flight).
    pub fn add_send_entry(&mut self, packet: Vec<u8>, now: u64) -> Result<u64> {
        let message_id = self.send_message_id;
        let slot = (message_id % WINDOW_SIZE) as usize;
        if self.send_window[slot].is_some() {
            return Err(GroupError::TransportFailure);
        }
        self.send_window[slot] = Some(SendEntry {
            message_id,
            packet,
            time_added: now,
            last_send_try: now,
        });
        self.send_message_id = self
            .send_message_id
            .checked_add(1)
            .ok_or(GroupError::VersionStale)?;
        Ok(message_id)
    }

    /// Consume a message id without parking a packet. The handshake
    /// occupies id 1 this way on the initiator side.
    pub fn consume_send_id(&mut self) {
        if self.send_window_start == self.send_message_id {
            self.send_window_start += 1;
        }
        self.send_message_id = self.send_message_id.saturating_add(1);
    }

    /// Clear the slot acknowledged by `read_id` and advance the window.
    pub fn handle_ack(&mut self, read_id: u64) {
        let slot = (read_id % WINDOW_SIZE) as usize;
        if self
            .send_window[slot]
            .as_ref()
            .is_some_and(|e| e.message_id == read_id)
        {
            self.send_window[slot] = None;
        }

        while self.send_window_start < self.send_message_id {
            let idx = (self.send_window_start % WINDOW_SIZE) as usize;
            if self.send_window[idx].is_some() {
                break;
            }
            self.send_window_start += 1;
        }
    }

    /// Fetch the raw packet for a peer-requested resend, marking the try.
    pub fn requested_packet(&mut self, request_id: u64, now: u64) -> Option<Vec<u8>> {
        let slot = (request_id % WINDOW_SIZE) as usize;
        let entry = self.send_window[slot].as_mut()?;
        if entry.message_id != request_id {
            return None;
        }
        entry.last_send_try = now;
        Some(entry.packet.clone())
    }

    /// Collect packets due for retransmission. Entries further from the
    /// window start back off longer between tries.
    ///
    /// # Errors
    ///
    /// [`GroupError::TransportFailure`] when the oldest unacked entry
    /// has exceeded the drop timeout; the caller evicts the peer.
    pub fn packets_to_resend(&mut self, now: u64) -> Result<Vec<Vec<u8>>> {
        let mut due = Vec::new();
        for entry in self.send_window.iter_mut().flatten() {
            if now.saturating_sub(entry.time_added) >= timing::UNACKED_DROP_TIMEOUT {
                return Err(GroupError::TransportFailure);
            }
            let backoff = 1 + entry.message_id.saturating_sub(self.send_window_start) / 8;
            if now.saturating_sub(entry.last_send_try) >= backoff {
                entry.last_send_try = now;
                due.push(entry.packet.clone());
            }
        }
        Ok(due)
    }

    /// Unacked packets currently in flight.
    pub fn unacked_count(&self) -> usize {
        self.send_window.iter().flatten().count()
    }

    // --- receive window ---

    /// Process an inbound lossless payload with its message id.
    pub fn handle_recv(&mut self, message_id: u64, payload: LosslessPayload) -> RecvAction {
        if message_id == self.recv_message_id + 1 {
            self.recv_message_id = message_id;
            let mut delivered = vec![(message_id, payload)];

            // Drain buffered successors in order.
            loop {
                let next = self.recv_message_id + 1;
                let slot = (next % WINDOW_SIZE) as usize;
                match self.recv_window[slot].take() {
                    Some(entry) if entry.message_id == next => {
                        self.recv_message_id = next;
                        delivered.push((next, entry.payload));
                    }
                    Some(entry) => {
                        // Not the id we need; put it back.
                        self.recv_window[slot] = Some(entry);
                        break;
                    }
                    None => break,
                }
            }
            return RecvAction::Deliver(delivered);
        }

        if message_id <= self.recv_message_id {
            return RecvAction::Duplicate;
        }

        if message_id - self.recv_message_id > WINDOW_SIZE {
            return RecvAction::OutOfWindow;
        }

        let slot = (message_id % WINDOW_SIZE) as usize;
        if self.recv_window[slot].is_none() {
            self.recv_window[slot] = Some(RecvEntry {
                message_id,
                payload,
            });
        }
        RecvAction::Buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8) -> LosslessPayload {
        LosslessPayload {
            inner: InnerKind::Broadcast,
            body: vec![tag],
        }
    }

    fn conn() -> PeerConnection {
        PeerConnection::new([1u8; 32], None, 1000, 0)
    }

    #[test]
    fn initial_ids() {
        let c = conn();
        assert_eq!(c.send_message_id, 1);
        assert_eq!(c.recv_message_id, 0);
    }

    #[test]
    fn in_order_delivery() {
        let mut c = conn();
        let RecvAction::Deliver(items) = c.handle_recv(1, payload(1)) else {
            unreachable!("in-order packet must deliver")
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, 1);
        assert_eq!(c.recv_message_id, 1);
    }

    #[test]
    fn out_of_order_buffering_drains_in_order() {
        let mut c = conn();
        c.recv_message_id = 4;

        let RecvAction::Deliver(items) = c.handle_recv(5, payload(5)) else {
            unreachable!("in-order packet must deliver")
        };
        assert_eq!(items.len(), 1);
        assert!(matches!(c.handle_recv(7, payload(7)), RecvAction::Buffered));
        let RecvAction::Deliver(items) = c.handle_recv(6, payload(6)) else {
            unreachable!("gap fill must deliver")
        };
        let ids: Vec<u64> = items.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![6, 7]);
        assert_eq!(c.recv_message_id, 7);
    }

    #[test]
    fn duplicates_and_window_bounds() {
        let mut c = conn();
        c.recv_message_id = 10;
        assert!(matches!(c.handle_recv(10, payload(0)), RecvAction::Duplicate));
        assert!(matches!(c.handle_recv(3, payload(0)), RecvAction::Duplicate));
        assert!(matches!(
            c.handle_recv(10 + WINDOW_SIZE + 1, payload(0)),
            RecvAction::OutOfWindow
        ));
        assert!(matches!(
            c.handle_recv(10 + WINDOW_SIZE, payload(0)),
            RecvAction::Buffered
        ));
    }

    #[test]
    fn replayed_id_never_delivers_twice() {
        let mut c = conn();
        assert!(matches!(c.handle_recv(1, payload(1)), RecvAction::Deliver(_)));
        assert!(matches!(c.handle_recv(1, payload(1)), RecvAction::Duplicate));
        assert!(matches!(c.handle_recv(1, payload(1)), RecvAction::Duplicate));
    }

    #[test]
    fn ack_clears_and_advances_window() {
        let mut c = conn();
        let id1 = c.add_send_entry(vec![1], 1000).expect("add");
        let id2 = c.add_send_entry(vec![2], 1000).expect("add");
        assert_eq!((id1, id2), (1, 2));
        assert_eq!(c.unacked_count(), 2);

        c.handle_ack(2);
        assert_eq!(c.unacked_count(), 1);
        // Window start cannot pass the unacked id 1.
        c.handle_ack(1);
        assert_eq!(c.unacked_count(), 0);

        // The freed slots accept new ids.
        for _ in 0..WINDOW_SIZE {
            c.add_send_entry(vec![0], 1001).expect("add");
        }
        assert!(c.add_send_entry(vec![0], 1001).is_err());
    }

    #[test]
    fn full_window_rejects_sends() {
        let mut c = conn();
        for _ in 0..WINDOW_SIZE {
            c.add_send_entry(vec![0], 1000).expect("add");
        }
        assert!(matches!(
            c.add_send_entry(vec![0], 1000),
            Err(GroupError::TransportFailure)
        ));
    }

    #[test]
    fn resend_backoff_and_drop_timeout() {
        let mut c = conn();
        c.add_send_entry(vec![7], 1000).expect("add");

        // Not due immediately.
        assert!(c.packets_to_resend(1000).expect("resend").is_empty());
        // Due after the minimum interval.
        let due = c.packets_to_resend(1001).expect("resend");
        assert_eq!(due.len(), 1);
        // Not due again right away.
        assert!(c.packets_to_resend(1001).expect("resend").is_empty());

        // An entry past the drop timeout kills the connection.
        assert!(c
            .packets_to_resend(1000 + timing::UNACKED_DROP_TIMEOUT)
            .is_err());
    }

    #[test]
    fn requested_resend_checks_id() {
        let mut c = conn();
        c.add_send_entry(vec![9], 1000).expect("add");
        assert_eq!(c.requested_packet(1, 1001), Some(vec![9]));
        assert_eq!(c.requested_packet(2, 1001), None);
    }

    #[test]
    fn session_key_agreement() {
        let mut a = conn();
        let mut b = conn();
        let a_pk = a.session_public_key();
        let b_pk = b.session_public_key();
        a.establish_session_key(&b_pk);
        b.establish_session_key(&a_pk);
        assert_eq!(a.session_key, b.session_key);
        assert!(a.session_key.is_some());
    }

    #[test]
    fn relay_ring_keeps_newest() {
        let mut c = conn();
        for i in 0..6u8 {
            c.save_relay(RelayNode {
                public_key: [i; 32],
                ip_port: palaver_types::network::IpPort::unspecified(),
            });
        }
        assert_eq!(c.last_relay().map(|r| r.public_key), Some([5u8; 32]));
    }
}
