//! In-memory overlay harness for multi-session integration tests.
//!
//! Each [`Party`] owns a real [`Session`] plus a [`TestNet`] that
//! records outbound traffic instead of touching sockets. The [`World`]
//! routes recorded packets between parties: UDP by address, relay and
//! out-of-band sends by the recipient's public key (the relay hop is
//! simulated away), and friend packets by party index. A shared
//! [`MockClock`] advances one second at a time so handshake delays,
//! retransmission backoff, and ping intervals run deterministically.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use palaver_group::{Callbacks, Overlay, Session};
use palaver_types::events::{MessageType, ModerationEvent, RejectReason};
use palaver_types::network::{IpPort, RelayNode};
use palaver_types::peer::PeerStatus;
use palaver_types::time::Clock;
use palaver_types::{FriendId, PeerId, PublicKey};

/// A controllable clock shared between the world and every session.
#[derive(Clone, Default)]
pub struct MockClock(Rc<Cell<u64>>);

impl MockClock {
    pub fn at(start: u64) -> Self {
        Self(Rc::new(Cell::new(start)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.set(self.0.get() + secs);
    }

    pub fn now(&self) -> u64 {
        self.0.get()
    }
}

impl Clock for MockClock {
    fn unix_time(&self) -> u64 {
        self.0.get()
    }
}

/// One recorded outbound packet.
#[derive(Clone, Debug)]
pub enum Outbound {
    Udp {
        to: IpPort,
        packet: Vec<u8>,
    },
    Relay {
        to_pk: PublicKey,
        packet: Vec<u8>,
    },
    Oob {
        relay_pk: PublicKey,
        to_pk: PublicKey,
        packet: Vec<u8>,
    },
    Friend {
        friend: FriendId,
        packet: Vec<u8>,
    },
}

/// An overlay that records instead of sending.
pub struct TestNet {
    pub addr: IpPort,
    pub relay: RelayNode,
    pub outbox: Vec<Outbound>,
}

impl TestNet {
    fn new(index: usize) -> Self {
        let addr = IpPort::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, index as u8 + 1)), 33445);
        let mut relay_pk = [0u8; 32];
        relay_pk[0] = 0xAA;
        relay_pk[1] = index as u8;
        Self {
            addr,
            relay: RelayNode {
                public_key: relay_pk,
                ip_port: addr,
            },
            outbox: Vec::new(),
        }
    }
}

impl Overlay for TestNet {
    fn send_udp(&mut self, to: IpPort, packet: &[u8]) -> bool {
        self.outbox.push(Outbound::Udp {
            to,
            packet: packet.to_vec(),
        });
        true
    }

    fn send_relay(&mut self, _relay_pk: &PublicKey, to_pk: &PublicKey, packet: &[u8]) -> bool {
        self.outbox.push(Outbound::Relay {
            to_pk: *to_pk,
            packet: packet.to_vec(),
        });
        true
    }

    fn send_oob(&mut self, relay: &RelayNode, to_pk: &PublicKey, packet: &[u8]) -> bool {
        self.outbox.push(Outbound::Oob {
            relay_pk: relay.public_key,
            to_pk: *to_pk,
            packet: packet.to_vec(),
        });
        true
    }

    fn send_friend_packet(&mut self, friend: FriendId, packet: &[u8]) -> bool {
        self.outbox.push(Outbound::Friend {
            friend,
            packet: packet.to_vec(),
        });
        true
    }

    fn self_relay(&mut self) -> Option<RelayNode> {
        Some(self.relay)
    }

    fn self_ip_port(&mut self) -> Option<IpPort> {
        Some(self.addr)
    }
}

/// Everything the callbacks observed, for assertions.
#[derive(Default)]
pub struct EventLog {
    pub messages: Vec<(u32, PeerId, MessageType, Vec<u8>)>,
    pub private_messages: Vec<(u32, PeerId, Vec<u8>)>,
    pub custom_packets: Vec<(u32, PeerId, Vec<u8>)>,
    pub moderation: Vec<(u32, PeerId, PeerId, ModerationEvent)>,
    pub topic_changes: Vec<(u32, Vec<u8>)>,
    pub peer_joins: Vec<(u32, PeerId)>,
    pub peer_exits: Vec<(u32, PeerId, Vec<u8>)>,
    pub self_joins: Vec<u32>,
    pub rejected: Vec<(u32, RejectReason)>,
    pub nick_changes: Vec<(u32, PeerId, Vec<u8>)>,
    pub status_changes: Vec<(u32, PeerId, PeerStatus)>,
    pub password_changes: Vec<(u32, Vec<u8>)>,
}

fn recording_callbacks(log: &Rc<RefCell<EventLog>>) -> Callbacks {
    let mut callbacks = Callbacks::default();

    let l = Rc::clone(log);
    callbacks.message = Some(Box::new(move |g, p, k, m| {
        l.borrow_mut().messages.push((g, p, k, m.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.private_message = Some(Box::new(move |g, p, m| {
        l.borrow_mut().private_messages.push((g, p, m.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.custom_packet = Some(Box::new(move |g, p, d| {
        l.borrow_mut().custom_packets.push((g, p, d.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.moderation = Some(Box::new(move |g, s, t, e| {
        l.borrow_mut().moderation.push((g, s, t, e));
    }));
    let l = Rc::clone(log);
    callbacks.topic_change = Some(Box::new(move |g, _p, t| {
        l.borrow_mut().topic_changes.push((g, t.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.peer_join = Some(Box::new(move |g, p| {
        l.borrow_mut().peer_joins.push((g, p));
    }));
    let l = Rc::clone(log);
    callbacks.peer_exit = Some(Box::new(move |g, p, m| {
        l.borrow_mut().peer_exits.push((g, p, m.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.self_join = Some(Box::new(move |g| {
        l.borrow_mut().self_joins.push(g);
    }));
    let l = Rc::clone(log);
    callbacks.rejected = Some(Box::new(move |g, r| {
        l.borrow_mut().rejected.push((g, r));
    }));
    let l = Rc::clone(log);
    callbacks.nick_change = Some(Box::new(move |g, p, n| {
        l.borrow_mut().nick_changes.push((g, p, n.to_vec()));
    }));
    let l = Rc::clone(log);
    callbacks.status_change = Some(Box::new(move |g, p, s| {
        l.borrow_mut().status_changes.push((g, p, s));
    }));
    let l = Rc::clone(log);
    callbacks.password = Some(Box::new(move |g, p| {
        l.borrow_mut().password_changes.push((g, p.to_vec()));
    }));

    callbacks
}

/// One simulated participant.
pub struct Party {
    pub session: Session,
    pub net: TestNet,
    pub log: Rc<RefCell<EventLog>>,
    /// Packets from friends that the host must handle itself (invites).
    pub friend_inbox: Vec<(FriendId, Vec<u8>)>,
}

impl Party {
    fn new(index: usize, clock: MockClock) -> Self {
        let log = Rc::new(RefCell::new(EventLog::default()));
        let callbacks = recording_callbacks(&log);
        Self {
            session: Session::with_env(
                callbacks,
                Box::new(clock),
                Box::new(rand::rngs::OsRng),
            ),
            net: TestNet::new(index),
            log,
            friend_inbox: Vec::new(),
        }
    }

    /// All encryption public keys this party uses across its chats.
    fn self_pks(&self) -> Vec<PublicKey> {
        self.session
            .iter_chats()
            .map(|c| c.self_keys.public.enc)
            .collect()
    }
}

/// The simulated network of parties.
pub struct World {
    pub clock: MockClock,
    pub parties: Vec<Party>,
    /// Drop the next N non-friend packets sent by the given party.
    pub drop_from: Option<(usize, usize)>,
}

/// Install a test subscriber once so `RUST_LOG=debug` surfaces the
/// core's tracing output during a failing run.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl World {
    pub fn new(parties: usize) -> Self {
        init_tracing();
        let clock = MockClock::at(1_700_000_000);
        Self {
            parties: (0..parties).map(|i| Party::new(i, clock.clone())).collect(),
            clock,
            drop_from: None,
        }
    }

    fn party_by_addr(&self, addr: IpPort) -> Option<usize> {
        self.parties.iter().position(|p| p.net.addr == addr)
    }

    fn party_by_pk(&self, pk: &PublicKey) -> Option<usize> {
        self.parties.iter().position(|p| p.self_pks().contains(pk))
    }

    /// Drain every outbox once, delivering to the recipients. Returns
    /// the number of packets delivered.
    pub fn route_once(&mut self) -> usize {
        let mut delivered = 0;
        for from in 0..self.parties.len() {
            let outbox = std::mem::take(&mut self.parties[from].net.outbox);
            let from_addr = self.parties[from].net.addr;

            for item in outbox {
                if !matches!(item, Outbound::Friend { .. }) {
                    if let Some((party, remaining)) = self.drop_from.as_mut() {
                        if *party == from && *remaining > 0 {
                            *remaining -= 1;
                            continue;
                        }
                    }
                }

                match item {
                    Outbound::Udp { to, packet } => {
                        if let Some(target) = self.party_by_addr(to) {
                            let Party { session, net, .. } = &mut self.parties[target];
                            let _ = session.handle_packet(net, Some(from_addr), &packet);
                            delivered += 1;
                        }
                    }
                    Outbound::Relay { to_pk, packet } => {
                        if let Some(target) = self.party_by_pk(&to_pk) {
                            let Party { session, net, .. } = &mut self.parties[target];
                            let _ = session.handle_packet(net, None, &packet);
                            delivered += 1;
                        }
                    }
                    Outbound::Oob {
                        relay_pk,
                        to_pk,
                        packet,
                    } => {
                        if let Some(target) = self.party_by_pk(&to_pk) {
                            let Party { session, net, .. } = &mut self.parties[target];
                            let _ = session.handle_oob_packet(net, relay_pk, &packet);
                            delivered += 1;
                        }
                    }
                    Outbound::Friend { friend, packet } => {
                        let target = friend as usize;
                        if target >= self.parties.len() {
                            continue;
                        }
                        // Invites go to the host; the rest of the dance
                        // is handled by the session directly.
                        if packet.first() == Some(&1) {
                            self.parties[target].friend_inbox.push((from as FriendId, packet));
                        } else {
                            let Party { session, net, .. } = &mut self.parties[target];
                            let _ = session.handle_friend_packet(net, from as FriendId, &packet);
                        }
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Route until all queues drain.
    pub fn route_all(&mut self) {
        while self.route_once() > 0 {}
    }

    /// Tick every session once.
    pub fn tick_all(&mut self) {
        for party in &mut self.parties {
            let Party { session, net, .. } = party;
            session.tick(net);
        }
    }

    /// Advance simulated time one second at a time, ticking and routing
    /// until quiet, for `secs` seconds.
    pub fn run(&mut self, secs: u64) {
        for _ in 0..secs {
            self.clock.advance(1);
            self.tick_all();
            self.route_all();
        }
    }
}

/// Convenience: self info with the given nick.
pub fn self_info(nick: &[u8]) -> palaver_types::identity::SelfPeerInfo {
    palaver_types::identity::SelfPeerInfo {
        nick: nick.to_vec(),
        status: PeerStatus::None,
    }
}

/// Seed a joiner's announce store with the founder's coordinates so a
/// public join can discover it without a live DHT.
pub fn seed_announce(world: &mut World, joiner: usize, founder: usize, group: u32) {
    let chat_id = world.parties[founder]
        .session
        .chat_id(group)
        .expect("founder chat id");
    let founder_pk = world.parties[founder]
        .session
        .chat(group)
        .expect("founder chat")
        .self_keys
        .public
        .enc;
    let relay = world.parties[founder].net.relay;
    let now = world.clock.now();
    world.parties[joiner]
        .session
        .announces_mut()
        .add_announce(chat_id, founder_pk, relay, now);
}
