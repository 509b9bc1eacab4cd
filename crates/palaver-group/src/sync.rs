//! Peer synchronization: pings with version vectors, the sync
//! request/response exchange that transfers the whole replicated state,
//! and the peer-info exchange that confirms a connection.

use palaver_types::network::RelayNode;
use palaver_types::peer::ConnectionState;
use palaver_types::PublicKey;
use palaver_wire::bytes::{Reader, Writer};
use palaver_wire::kinds::{HandshakeRequestType, InnerKind};
use palaver_wire::records::{self, PeerInfo};

use crate::chat::Chat;
use crate::events::GroupEvent;
use crate::overlay::Ctx;
use crate::timing;
use crate::{GroupError, Result};

/// Ping body: confirmed peers, shared state, sanctions creds, topic.
const PING_DATA_SIZE: usize = 4 * 4;

impl Chat {
    // --- ping ---

    /// Send a ping with our version vector to every confirmed peer.
    pub(crate) fn ping_group(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now();
        if !palaver_types::time::is_timeout(now, self.last_sent_ping_time, timing::PING_INTERVAL) {
            return;
        }

        let mut body = Writer::with_capacity(PING_DATA_SIZE);
        body.put_u32(self.confirmed_count() as u32);
        body.put_u32(self.shared_state.version);
        body.put_u32(self.sanctions_creds.version);
        body.put_u32(self.topic_info.version);
        let body = body.into_vec();

        self.send_lossy_all(ctx, InnerKind::Ping, &body);
        self.last_sent_ping_time = now;
    }

    /// Handle a ping: refresh liveness and compare version vectors. We
    /// only ask for a sync on the second consecutive ping that still
    /// shows us behind, so transient disagreement does not cause sync
    /// storms.
    pub(crate) fn handle_ping(&mut self, ctx: &mut Ctx<'_>, index: usize, body: &[u8]) -> Result<()> {
        if body.len() != PING_DATA_SIZE {
            return Err(GroupError::Malformed("bad ping size".into()));
        }
        let confirmed = self
            .conn(index)
            .ok_or(GroupError::PeerUnknown)?
            .confirmed;
        if !confirmed {
            return Err(GroupError::TransportFailure);
        }

        let mut r = Reader::new(body);
        let their_peers = r.take_u32()?;
        let sstate_version = r.take_u32()?;
        let screds_version = r.take_u32()?;
        let topic_version = r.take_u32()?;

        let behind = their_peers > self.confirmed_count() as u32
            || sstate_version > self.shared_state.version
            || screds_version > self.sanctions_creds.version
            || topic_version > self.topic_info.version;

        let now = ctx.now();
        let sync_now = {
            let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
            conn.last_rcvd_ping = now;
            if behind {
                let due = conn.pending_state_sync;
                conn.pending_state_sync = !due;
                due
            } else {
                conn.pending_state_sync = false;
                false
            }
        };

        if sync_now {
            self.send_sync_request(ctx, index, 0)?;
        }
        Ok(())
    }

    // --- sync request/response ---

    /// Ask the peer at `index` for the group state. `num_peers` is how
    /// many confirmed peers we already know (zero on first join).
    pub(crate) fn send_sync_request(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        num_peers: u32,
    ) -> Result<()> {
        {
            let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
            if conn.pending_sync_request {
                return Ok(());
            }
            conn.pending_sync_request = true;
        }

        let mut body = Writer::new();
        body.put_u32(num_peers);
        let mut password = [0u8; palaver_types::MAX_PASSWORD_SIZE];
        let len = self.shared_state.password.len().min(password.len());
        password[..len].copy_from_slice(&self.shared_state.password[..len]);
        body.put(&password);

        self.send_lossless(ctx, index, InnerKind::SyncRequest, &body.into_vec())
    }

    /// Answer a sync request: the four state packets in strict order,
    /// then the peer list, announcing the requester to everyone else.
    pub(crate) fn handle_sync_request(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        if self.connection_state != ConnectionState::Connected || !self.has_shared_state() {
            return Err(GroupError::TransportFailure);
        }

        let mut r = Reader::new(body);
        let _num_peers_known = r.take_u32()?;
        let password: [u8; palaver_types::MAX_PASSWORD_SIZE] = r.take_array()?;

        if !self.shared_state.password.is_empty() {
            let expected = &self.shared_state.password;
            if &password[..expected.len()] != expected.as_slice() {
                return Err(GroupError::InvalidPassword);
            }
        }

        // Headers must precede the peer entries; receivers apply them
        // in this order.
        let shared_state = self.shared_state_packet_body();
        self.send_lossless(ctx, index, InnerKind::SharedState, &shared_state)?;
        let mods = self.mod_list_packet_body();
        self.send_lossless(ctx, index, InnerKind::ModList, &mods)?;
        let sanctions = self.sanctions_packet_body();
        self.send_lossless(ctx, index, InnerKind::SanctionsList, &sanctions)?;
        let topic = self.topic_packet_body();
        self.send_lossless(ctx, index, InnerKind::Topic, &topic)?;

        let requester_pk = self.conn(index).ok_or(GroupError::PeerUnknown)?.public_key;
        let requester_relay = self
            .conn(index)
            .and_then(|c| c.last_relay().copied())
            .or_else(|| ctx.net.self_relay());

        // Collect every other confirmed peer for the response. Entries
        // and relay nodes must stay 1:1, so peers we know no relay for
        // are left out of this response; the requester still learns of
        // them through later announces.
        let mut others: Vec<(usize, PublicKey, RelayNode)> = Vec::new();
        for i in 1..self.peer_count() {
            if i == index {
                continue;
            }
            let Some(conn) = self.conn(i) else { continue };
            if !conn.confirmed || conn.public_key == requester_pk {
                continue;
            }
            match conn.last_relay() {
                Some(relay) => others.push((i, conn.public_key, *relay)),
                None => tracing::debug!(
                    group = self.group_number,
                    index = i,
                    "peer omitted from sync response, no known relay"
                ),
            }
        }

        // The response is fully packed before the announcement fan-out
        // so the announced key always matches the response contents.
        let mut response = Writer::new();
        response.put_u32(others.len() as u32);
        for (_, _, relay) in &others {
            records::pack_relay_nodes(&mut response, std::slice::from_ref(relay));
        }
        for (_, pk, _) in &others {
            response.put(pk);
        }
        let response = response.into_vec();

        let mut announce = Writer::new();
        announce.put(&requester_pk);
        if let Some(relay) = &requester_relay {
            records::pack_relay_nodes(&mut announce, std::slice::from_ref(relay));
        }
        let announce = announce.into_vec();

        for (i, _, _) in &others {
            if let Err(err) = self.send_lossless(ctx, *i, InnerKind::PeerAnnounce, &announce) {
                tracing::debug!(group = self.group_number, index = i, %err, "peer announce failed");
            }
        }

        self.send_lossless(ctx, index, InnerKind::SyncResponse, &response)
    }

    /// Apply a sync response: add each announced peer and schedule a
    /// peer-info handshake toward it.
    pub(crate) fn handle_sync_response(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        {
            let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
            if !conn.pending_sync_request {
                return Ok(());
            }
            conn.pending_sync_request = false;
        }

        let mut r = Reader::new(body);
        let num_peers = r.take_u32()? as usize;
        if num_peers > palaver_types::MAX_GROUP_PACKET_SIZE / 64 {
            return Err(GroupError::Malformed("absurd peer count".into()));
        }

        let relays = records::unpack_relay_nodes(&mut r, num_peers)?;
        let mut peer_pks: Vec<PublicKey> = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            peer_pks.push(r.take_array()?);
        }

        let now = ctx.now();
        let self_pk = self.self_keys.public.enc;
        for (i, pk) in peer_pks.iter().enumerate() {
            if *pk == self_pk {
                continue;
            }
            let peer_index = match self.peer_add(ctx.rng, *pk, None, now) {
                Ok(idx) => idx,
                Err(GroupError::PeerDuplicate) => continue,
                Err(err) => return Err(err),
            };
            if let Some(relay) = relays.get(i) {
                if let Some(conn) = self.conn_mut(peer_index) {
                    conn.save_relay(*relay);
                }
            }
            self.schedule_handshake(
                peer_index,
                HandshakeRequestType::PeerInfoExchange,
                false,
                false,
                now,
            );
        }

        self.set_self_connected(now);
        self.send_peer_exchange(ctx, index)?;
        self.push_event(GroupEvent::SelfJoin);
        Ok(())
    }

    // --- peer info exchange ---

    /// PEER_INFO_RESPONSE body: the group password plus our packed info.
    fn self_info_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        let mut password = [0u8; palaver_types::MAX_PASSWORD_SIZE];
        let len = self.shared_state.password.len().min(password.len());
        password[..len].copy_from_slice(&self.shared_state.password[..len]);
        w.put(&password);
        records::pack_peer_info(
            &mut w,
            &PeerInfo {
                nick: self.self_peer().nick.clone(),
                status: self.self_peer().status,
                role: self.self_peer().role,
            },
        );
        w.into_vec()
    }

    /// Send our own info to the peer.
    pub(crate) fn send_self_to_peer(&mut self, ctx: &mut Ctx<'_>, index: usize) -> Result<()> {
        let body = self.self_info_body();
        self.send_lossless(ctx, index, InnerKind::PeerInfoResponse, &body)
    }

    /// Send both halves of the peer-info exchange.
    pub(crate) fn send_peer_exchange(&mut self, ctx: &mut Ctx<'_>, index: usize) -> Result<()> {
        self.send_self_to_peer(ctx, index)?;
        self.send_lossless(ctx, index, InnerKind::PeerInfoRequest, &[0u8])
    }

    /// A peer asked for our info.
    pub(crate) fn handle_peer_info_request(&mut self, ctx: &mut Ctx<'_>, index: usize) -> Result<()> {
        let confirmed = self
            .conn(index)
            .ok_or(GroupError::PeerUnknown)?
            .confirmed;
        if !confirmed && self.confirmed_count() as u32 >= self.shared_state.max_peers {
            return Err(GroupError::GroupFull);
        }
        self.send_self_to_peer(ctx, index)
    }

    /// Apply a peer's info: validate the password, the nick, and the
    /// claimed role, then confirm the connection.
    pub(crate) fn handle_peer_info_response(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        if self.connection_state != ConnectionState::Connected {
            return Err(GroupError::TransportFailure);
        }
        let was_confirmed = self
            .conn(index)
            .ok_or(GroupError::PeerUnknown)?
            .confirmed;
        if !was_confirmed && self.confirmed_count() as u32 >= self.shared_state.max_peers {
            return Err(GroupError::GroupFull);
        }

        let mut r = Reader::new(body);
        let password: [u8; palaver_types::MAX_PASSWORD_SIZE] = r.take_array()?;
        if !self.shared_state.password.is_empty() {
            let expected = &self.shared_state.password;
            if &password[..expected.len()] != expected.as_slice() {
                return Err(GroupError::InvalidPassword);
            }
        }

        let info = records::unpack_peer_info(&mut r)?;
        self.peer_update(index, &info)?;

        if self.validate_peer_role(index).is_err() {
            tracing::warn!(group = self.group_number, "peer role mismatch, deleting");
            self.peer_delete(index, b"");
            return Err(GroupError::RoleInsufficient);
        }

        let peer_id = self.peer_id_at(index).unwrap_or(0);
        let newly_confirmed = {
            let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
            let first = !conn.confirmed;
            conn.confirmed = true;
            first
        };
        if newly_confirmed {
            self.push_event(GroupEvent::PeerJoin { peer_id });
        }
        let _ = ctx;
        Ok(())
    }

    /// An existing member told us about a new arrival; connect to it.
    pub(crate) fn handle_peer_announce(
        &mut self,
        ctx: &mut Ctx<'_>,
        _index: usize,
        body: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(body);
        let peer_pk: PublicKey = r.take_array()?;
        if peer_pk == self.self_keys.public.enc {
            return Ok(());
        }
        let relays = records::unpack_relay_nodes(&mut r, 1)?;

        let now = ctx.now();
        let peer_index = match self.peer_add(ctx.rng, peer_pk, None, now) {
            Ok(idx) => idx,
            Err(GroupError::PeerDuplicate) => return Ok(()),
            Err(err) => return Err(err),
        };
        if let Some(relay) = relays.first() {
            if let Some(conn) = self.conn_mut(peer_index) {
                conn.save_relay(*relay);
            }
        }
        self.schedule_handshake(
            peer_index,
            HandshakeRequestType::PeerInfoExchange,
            false,
            false,
            now,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::identity::SelfPeerInfo;
    use palaver_types::peer::{PeerStatus, Privacy};
    use rand::rngs::OsRng;

    fn founder_chat() -> Chat {
        Chat::create(
            0,
            Privacy::Public,
            b"sync",
            &SelfPeerInfo {
                nick: b"founder".to_vec(),
                status: PeerStatus::None,
            },
            1000,
        )
        .expect("create")
    }

    #[test]
    fn two_ping_rule() {
        let mut chat = founder_chat();
        let index = chat.peer_add(&mut OsRng, [9u8; 32], None, 1000).expect("add");
        if let Some(conn) = chat.conn_mut(index) {
            conn.confirmed = true;
            conn.handshaked = true;
        }

        // A ping showing the peer ahead of us.
        let mut body = Writer::new();
        body.put_u32(5); // they claim 5 confirmed peers
        body.put_u32(chat.shared_state.version);
        body.put_u32(chat.sanctions_creds.version);
        body.put_u32(chat.topic_info.version);
        let body = body.into_vec();

        let mut net = crate::session::tests_support::NullOverlay;
        let clock = palaver_types::time::SystemClock;
        let mut rng = OsRng;
        let mut ctx = Ctx {
            net: &mut net,
            clock: &clock,
            rng: &mut rng,
        };

        // First ping: mark pending, no sync yet.
        chat.handle_ping(&mut ctx, index, &body).expect("ping");
        assert!(chat.conn(index).expect("conn").pending_state_sync);
        assert!(!chat.conn(index).expect("conn").pending_sync_request);

        // Second ping still behind: a sync request goes out.
        chat.handle_ping(&mut ctx, index, &body).expect("ping");
        assert!(chat.conn(index).expect("conn").pending_sync_request);
    }

    #[test]
    fn ping_in_agreement_clears_pending() {
        let mut chat = founder_chat();
        let index = chat.peer_add(&mut OsRng, [9u8; 32], None, 1000).expect("add");
        if let Some(conn) = chat.conn_mut(index) {
            conn.confirmed = true;
            conn.handshaked = true;
            conn.pending_state_sync = true;
        }

        let mut body = Writer::new();
        body.put_u32(1);
        body.put_u32(chat.shared_state.version);
        body.put_u32(chat.sanctions_creds.version);
        body.put_u32(chat.topic_info.version);
        let body = body.into_vec();

        let mut net = crate::session::tests_support::NullOverlay;
        let clock = palaver_types::time::SystemClock;
        let mut rng = OsRng;
        let mut ctx = Ctx {
            net: &mut net,
            clock: &clock,
            rng: &mut rng,
        };
        chat.handle_ping(&mut ctx, index, &body).expect("ping");
        assert!(!chat.conn(index).expect("conn").pending_state_sync);
    }

    #[test]
    fn unconfirmed_ping_is_rejected() {
        let mut chat = founder_chat();
        let index = chat.peer_add(&mut OsRng, [9u8; 32], None, 1000).expect("add");
        if let Some(conn) = chat.conn_mut(index) {
            conn.handshaked = true;
        }

        let body = vec![0u8; PING_DATA_SIZE];
        let mut net = crate::session::tests_support::NullOverlay;
        let clock = palaver_types::time::SystemClock;
        let mut rng = OsRng;
        let mut ctx = Ctx {
            net: &mut net,
            clock: &clock,
            rng: &mut rng,
        };
        assert!(chat.handle_ping(&mut ctx, index, &body).is_err());
    }
}
