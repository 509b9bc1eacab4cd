//! The overlay network boundary.
//!
//! The friend-to-friend overlay that carries group packets (UDP sends,
//! TCP-relay multiplexing, friend packet delivery) lives in the host
//! application. The group core reaches it exclusively through the
//! [`Overlay`] trait; every send is non-blocking and fire-and-forget.

use palaver_types::network::{IpPort, RelayNode};
use palaver_types::time::Clock;
use palaver_types::{FriendId, PublicKey};
use rand_core::RngCore;

/// Host-provided packet transmission.
///
/// Returning `false` from a send means the packet was not queued; the
/// core treats that as a transient transport failure and relies on its
/// own retransmission to recover.
pub trait Overlay {
    /// Send a datagram directly to an address.
    fn send_udp(&mut self, to: IpPort, packet: &[u8]) -> bool;

    /// Send a packet to `to_pk` through an established TCP relay.
    fn send_relay(&mut self, relay_pk: &PublicKey, to_pk: &PublicKey, packet: &[u8]) -> bool;

    /// Send an out-of-band packet to `to_pk` through a relay we are not
    /// necessarily connected to. Used for discovery handshakes.
    fn send_oob(&mut self, relay: &RelayNode, to_pk: &PublicKey, packet: &[u8]) -> bool;

    /// Deliver an invite payload to a friend over the friend connection.
    fn send_friend_packet(&mut self, friend: FriendId, packet: &[u8]) -> bool;

    /// A relay this node is currently reachable through, if any. Shared
    /// in handshakes and announces so others can reach us.
    fn self_relay(&mut self) -> Option<RelayNode>;

    /// Our own address as seen by the overlay, if known.
    fn self_ip_port(&mut self) -> Option<IpPort>;
}

/// Mutable per-call context threaded through the core: the overlay, the
/// injected clock, and the injected id source.
pub struct Ctx<'a> {
    pub net: &'a mut dyn Overlay,
    pub clock: &'a dyn Clock,
    pub rng: &'a mut dyn RngCore,
}

impl Ctx<'_> {
    /// Current Unix time in seconds.
    pub fn now(&self) -> u64 {
        self.clock.unix_time()
    }
}
