//! The top-level group session: the chat table, the host callback
//! record, packet routing, the friend-invite dance, and the tick.
//!
//! The host drives everything: it feeds inbound packets in, calls
//! `tick` at a steady cadence, and supplies the [`Overlay`] for
//! outbound traffic on every call. Callbacks fire synchronously before
//! the call that produced them returns; they must not call back into
//! mutating APIs of the same chat within the same tick.

use palaver_announce::AnnounceStore;
use palaver_types::events::{MessageType, ModerationEvent, RejectReason};
use palaver_types::identity::SelfPeerInfo;
use palaver_types::network::IpPort;
use palaver_types::peer::{ConnectionState, JoinType, PeerStatus, Privacy, Role};
use palaver_types::time::{Clock, SystemClock};
use palaver_types::{ChatId, FriendId, PeerId, PublicKey};
use palaver_wire::bytes::{Reader, Writer};
use palaver_wire::kinds::{HandshakeRequestType, PacketKind};
use palaver_wire::packet;
use palaver_wire::records;
use rand_core::RngCore;

use crate::chat::Chat;
use crate::events::GroupEvent;
use crate::overlay::{Ctx, Overlay};
use crate::saved::SavedGroup;
use crate::{GroupError, Result};

/// Friend-channel invite packet tags.
const FRIEND_INVITE: u8 = 1;
const FRIEND_INVITE_ACCEPTED: u8 = 2;
const FRIEND_INVITE_CONFIRMATION: u8 = 3;

/// How many announce targets a public join contacts at once.
const MAX_JOIN_TARGETS: usize = 4;

/// Host callbacks, registered at session creation.
#[derive(Default)]
#[allow(clippy::type_complexity)]
pub struct Callbacks {
    pub message: Option<Box<dyn FnMut(u32, PeerId, MessageType, &[u8])>>,
    pub private_message: Option<Box<dyn FnMut(u32, PeerId, &[u8])>>,
    pub custom_packet: Option<Box<dyn FnMut(u32, PeerId, &[u8])>>,
    pub moderation: Option<Box<dyn FnMut(u32, PeerId, PeerId, ModerationEvent)>>,
    pub nick_change: Option<Box<dyn FnMut(u32, PeerId, &[u8])>>,
    pub status_change: Option<Box<dyn FnMut(u32, PeerId, PeerStatus)>>,
    pub topic_change: Option<Box<dyn FnMut(u32, PeerId, &[u8])>>,
    pub peer_limit: Option<Box<dyn FnMut(u32, u32)>>,
    pub privacy_state: Option<Box<dyn FnMut(u32, Privacy)>>,
    pub password: Option<Box<dyn FnMut(u32, &[u8])>>,
    pub peer_join: Option<Box<dyn FnMut(u32, PeerId)>>,
    pub peer_exit: Option<Box<dyn FnMut(u32, PeerId, &[u8])>>,
    pub self_join: Option<Box<dyn FnMut(u32)>>,
    pub rejected: Option<Box<dyn FnMut(u32, RejectReason)>>,
}

impl Callbacks {
    fn dispatch(&mut self, group: u32, event: GroupEvent) {
        match event {
            GroupEvent::Message {
                peer_id,
                kind,
                message,
            } => {
                if let Some(cb) = self.message.as_mut() {
                    cb(group, peer_id, kind, &message);
                }
            }
            GroupEvent::PrivateMessage { peer_id, message } => {
                if let Some(cb) = self.private_message.as_mut() {
                    cb(group, peer_id, &message);
                }
            }
            GroupEvent::CustomPacket { peer_id, data } => {
                if let Some(cb) = self.custom_packet.as_mut() {
                    cb(group, peer_id, &data);
                }
            }
            GroupEvent::Moderation {
                src_peer_id,
                target_peer_id,
                event,
            } => {
                if let Some(cb) = self.moderation.as_mut() {
                    cb(group, src_peer_id, target_peer_id, event);
                }
            }
            GroupEvent::NickChange { peer_id, nick } => {
                if let Some(cb) = self.nick_change.as_mut() {
                    cb(group, peer_id, &nick);
                }
            }
            GroupEvent::StatusChange { peer_id, status } => {
                if let Some(cb) = self.status_change.as_mut() {
                    cb(group, peer_id, status);
                }
            }
            GroupEvent::TopicChange { peer_id, topic } => {
                if let Some(cb) = self.topic_change.as_mut() {
                    cb(group, peer_id, &topic);
                }
            }
            GroupEvent::PeerLimit { max_peers } => {
                if let Some(cb) = self.peer_limit.as_mut() {
                    cb(group, max_peers);
                }
            }
            GroupEvent::PrivacyState { privacy } => {
                if let Some(cb) = self.privacy_state.as_mut() {
                    cb(group, privacy);
                }
            }
            GroupEvent::Password { password } => {
                if let Some(cb) = self.password.as_mut() {
                    cb(group, &password);
                }
            }
            GroupEvent::PeerJoin { peer_id } => {
                if let Some(cb) = self.peer_join.as_mut() {
                    cb(group, peer_id);
                }
            }
            GroupEvent::PeerExit {
                peer_id,
                part_message,
            } => {
                if let Some(cb) = self.peer_exit.as_mut() {
                    cb(group, peer_id, &part_message);
                }
            }
            GroupEvent::SelfJoin => {
                if let Some(cb) = self.self_join.as_mut() {
                    cb(group);
                }
            }
            GroupEvent::Rejected { reason } => {
                if let Some(cb) = self.rejected.as_mut() {
                    cb(group, reason);
                }
            }
        }
    }
}

/// A group-chat session holding any number of chats.
pub struct Session {
    chats: Vec<Option<Chat>>,
    callbacks: Callbacks,
    announces: AnnounceStore,
    clock: Box<dyn Clock>,
    rng: Box<dyn RngCore>,
}

impl Session {
    /// Create a session with the system clock and OS randomness.
    pub fn new(callbacks: Callbacks) -> Self {
        Self::with_env(callbacks, Box::new(SystemClock), Box::new(rand::rngs::OsRng))
    }

    /// Create a session with an injected clock and id source, for
    /// deterministic tests.
    pub fn with_env(callbacks: Callbacks, clock: Box<dyn Clock>, rng: Box<dyn RngCore>) -> Self {
        Self {
            chats: Vec::new(),
            callbacks,
            announces: AnnounceStore::new(),
            clock,
            rng,
        }
    }

    /// The process-wide announce store.
    pub fn announces(&self) -> &AnnounceStore {
        &self.announces
    }

    /// Feed externally learned announces (e.g. from a DHT lookup).
    pub fn announces_mut(&mut self) -> &mut AnnounceStore {
        &mut self.announces
    }

    fn free_slot(&mut self) -> u32 {
        for (i, slot) in self.chats.iter().enumerate() {
            if slot.is_none() {
                return i as u32;
            }
        }
        self.chats.push(None);
        (self.chats.len() - 1) as u32
    }

    /// The chat with this group number.
    pub fn chat(&self, group_number: u32) -> Result<&Chat> {
        self.chats
            .get(group_number as usize)
            .and_then(|c| c.as_ref())
            .ok_or(GroupError::GroupUnknown)
    }

    /// The chat with this group number, mutably.
    pub fn chat_mut(&mut self, group_number: u32) -> Result<&mut Chat> {
        self.chats
            .get_mut(group_number as usize)
            .and_then(|c| c.as_mut())
            .ok_or(GroupError::GroupUnknown)
    }

    /// Number of live chats.
    pub fn count_groups(&self) -> usize {
        self.chats.iter().flatten().count()
    }

    /// Iterate over all live chats.
    pub fn iter_chats(&self) -> impl Iterator<Item = &Chat> {
        self.chats.iter().flatten()
    }

    fn chat_by_id(&self, chat_id: &ChatId) -> Option<u32> {
        self.chats
            .iter()
            .flatten()
            .find(|c| &c.chat_id == chat_id)
            .map(|c| c.group_number)
    }

    fn drain_events(&mut self) {
        for slot in &mut self.chats {
            let Some(chat) = slot.as_mut() else { continue };
            let group = chat.group_number;
            let chat_id = chat.chat_id;
            for event in std::mem::take(&mut chat.events) {
                if matches!(
                    event,
                    GroupEvent::PrivacyState {
                        privacy: Privacy::Private
                    }
                ) {
                    self.announces.cleanup(&chat_id);
                }
                self.callbacks.dispatch(group, event);
            }
        }
    }

    // --- group lifecycle ---

    /// Create a new group and become its founder.
    pub fn group_add(
        &mut self,
        privacy: Privacy,
        group_name: &[u8],
        self_info: &SelfPeerInfo,
    ) -> Result<u32> {
        let group_number = self.free_slot();
        let chat = Chat::create(
            group_number,
            privacy,
            group_name,
            self_info,
            self.clock.unix_time(),
        )?;
        self.chats[group_number as usize] = Some(chat);
        Ok(group_number)
    }

    /// Join a public group by chat id, using any announces already
    /// known for it.
    pub fn group_join_public(
        &mut self,
        chat_id: ChatId,
        password: &[u8],
        self_info: &SelfPeerInfo,
    ) -> Result<u32> {
        if self.chat_by_id(&chat_id).is_some() {
            return Err(GroupError::PeerDuplicate);
        }

        let group_number = self.free_slot();
        let now = self.clock.unix_time();
        let mut chat = Chat::join(
            group_number,
            chat_id,
            password,
            self_info,
            JoinType::Public,
            now,
        )?;

        let self_pk = chat.self_keys.public.enc;
        let targets = self.announces.get_announces(&chat_id, MAX_JOIN_TARGETS, &self_pk);
        for announce in &targets {
            let Ok(index) = chat.peer_add(
                self.rng.as_mut(),
                announce.peer_public_key,
                None,
                now,
            ) else {
                continue;
            };
            if let Some(conn) = chat.conn_mut(index) {
                conn.save_relay(announce.relay);
                conn.oob_relay = Some(announce.relay);
            }
            chat.schedule_handshake(index, HandshakeRequestType::InviteRequest, false, true, now);
        }
        tracing::info!(
            group = group_number,
            targets = targets.len(),
            "joining public group"
        );

        self.chats[group_number as usize] = Some(chat);
        Ok(group_number)
    }

    /// Restore a previously saved group.
    pub fn group_load(&mut self, saved: &SavedGroup) -> Result<u32> {
        if self.chat_by_id(&saved.chat_id).is_some() {
            return Err(GroupError::PeerDuplicate);
        }
        let group_number = self.free_slot();
        let now = self.clock.unix_time();
        let chat = Chat::from_saved(group_number, saved, self.rng.as_mut(), now)?;
        self.chats[group_number as usize] = Some(chat);
        Ok(group_number)
    }

    /// Snapshot a group for persistence.
    pub fn saved_group(&self, group_number: u32) -> Result<SavedGroup> {
        Ok(self.chat(group_number)?.to_saved())
    }

    /// Leave a group: broadcast a part message now, delete on the next
    /// tick.
    pub fn group_exit(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        part_message: &[u8],
    ) -> Result<()> {
        let mut ctx = Ctx {
            net,
            clock: self.clock.as_ref(),
            rng: self.rng.as_mut(),
        };
        let chat = self
            .chats
            .get_mut(group_number as usize)
            .and_then(|c| c.as_mut())
            .ok_or(GroupError::GroupUnknown)?;
        let _ = chat.send_self_exit(&mut ctx, part_message);
        chat.connection_state = ConnectionState::Closing;
        Ok(())
    }

    /// Force a reconnect attempt for a disconnected group.
    pub fn rejoin(&mut self, group_number: u32) -> Result<()> {
        let chat = self.chat_mut(group_number)?;
        if chat.connection_state == ConnectionState::Connected {
            return Ok(());
        }
        chat.connection_state = ConnectionState::Disconnected;
        chat.last_join_attempt = 0;
        Ok(())
    }

    // --- friend invites ---

    /// Invite a friend to a group over the friend channel.
    pub fn invite_friend(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        friend: FriendId,
    ) -> Result<()> {
        let chat = self.chat_mut(group_number)?;
        let mut w = Writer::new();
        w.put_u8(FRIEND_INVITE);
        w.put(&chat.chat_id);
        w.put(&chat.self_keys.public.enc);
        if !net.send_friend_packet(friend, &w.into_vec()) {
            return Err(GroupError::TransportFailure);
        }
        chat.remember_invited_friend(friend);
        Ok(())
    }

    /// Accept a friend's invite (the raw payload of a FRIEND_INVITE
    /// packet) and create the corresponding chat.
    pub fn accept_friend_invite(
        &mut self,
        net: &mut dyn Overlay,
        friend: FriendId,
        invite: &[u8],
        password: &[u8],
        self_info: &SelfPeerInfo,
    ) -> Result<u32> {
        let mut r = Reader::new(invite);
        let tag = r.take_u8()?;
        if tag != FRIEND_INVITE {
            return Err(GroupError::Malformed("not an invite".into()));
        }
        let chat_id: ChatId = r.take_array()?;
        let inviter_pk: PublicKey = r.take_array()?;

        if self.chat_by_id(&chat_id).is_some() {
            return Err(GroupError::PeerDuplicate);
        }

        let group_number = self.free_slot();
        let now = self.clock.unix_time();
        let mut chat = Chat::join(
            group_number,
            chat_id,
            password,
            self_info,
            JoinType::Private,
            now,
        )?;
        chat.peer_add(self.rng.as_mut(), inviter_pk, None, now)?;

        let mut w = Writer::new();
        w.put_u8(FRIEND_INVITE_ACCEPTED);
        w.put(&chat_id);
        w.put(&chat.self_keys.public.enc);
        if !net.send_friend_packet(friend, &w.into_vec()) {
            return Err(GroupError::TransportFailure);
        }

        self.chats[group_number as usize] = Some(chat);
        Ok(group_number)
    }

    /// Handle a friend-channel packet (invite acceptance and
    /// confirmation legs).
    pub fn handle_friend_packet(
        &mut self,
        net: &mut dyn Overlay,
        friend: FriendId,
        data: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(data);
        match r.take_u8()? {
            FRIEND_INVITE_ACCEPTED => {
                let chat_id: ChatId = r.take_array()?;
                let invitee_pk: PublicKey = r.take_array()?;
                let now = self.clock.unix_time();
                let relay = net.self_relay();

                let Session { chats, rng, .. } = self;
                let chat = chats
                    .iter_mut()
                    .flatten()
                    .find(|c| c.chat_id == chat_id)
                    .ok_or(GroupError::GroupUnknown)?;
                if !chat.friend_was_invited(friend) {
                    return Err(GroupError::Malformed("unsolicited acceptance".into()));
                }
                match chat.peer_add(rng.as_mut(), invitee_pk, None, now) {
                    Ok(_) | Err(GroupError::PeerDuplicate) => {}
                    Err(err) => return Err(err),
                }

                let mut w = Writer::new();
                w.put_u8(FRIEND_INVITE_CONFIRMATION);
                w.put(&chat_id);
                w.put(&chat.self_keys.public.enc);
                if let Some(relay) = relay {
                    records::pack_relay_nodes(&mut w, std::slice::from_ref(&relay));
                }
                if !net.send_friend_packet(friend, &w.into_vec()) {
                    return Err(GroupError::TransportFailure);
                }
                Ok(())
            }
            FRIEND_INVITE_CONFIRMATION => {
                let chat_id: ChatId = r.take_array()?;
                let inviter_pk: PublicKey = r.take_array()?;
                let relays = records::unpack_relay_nodes(&mut r, 4)?;

                let group_number = self
                    .chat_by_id(&chat_id)
                    .ok_or(GroupError::GroupUnknown)?;
                let now = self.clock.unix_time();
                let chat = self.chat_mut(group_number)?;

                let index = chat
                    .peer_index_by_pk(&inviter_pk)
                    .ok_or(GroupError::PeerUnknown)?;
                let has_relay = !relays.is_empty();
                if let Some(conn) = chat.conn_mut(index) {
                    for relay in &relays {
                        conn.save_relay(*relay);
                    }
                    conn.oob_relay = relays.first().copied();
                }
                chat.schedule_handshake(
                    index,
                    HandshakeRequestType::InviteRequest,
                    false,
                    has_relay,
                    now,
                );
                chat.connection_state = ConnectionState::Connecting;
                chat.last_join_attempt = now;
                Ok(())
            }
            _ => Err(GroupError::Malformed("unknown friend packet".into())),
        }
    }

    // --- packet routing ---

    /// Handle an inbound group packet from UDP (`source` set) or a TCP
    /// relay (`source` empty).
    pub fn handle_packet(
        &mut self,
        net: &mut dyn Overlay,
        source: Option<IpPort>,
        data: &[u8],
    ) -> Result<()> {
        let header = packet::parse_outer(data)?;
        let result = self.route_packet(net, &header, data, source, None);
        self.drain_events();
        result
    }

    /// Handle an out-of-band packet received through a relay; only
    /// handshakes arrive this way.
    pub fn handle_oob_packet(
        &mut self,
        net: &mut dyn Overlay,
        relay_pk: PublicKey,
        data: &[u8],
    ) -> Result<()> {
        let header = packet::parse_outer(data)?;
        if header.kind != PacketKind::Handshake {
            return Err(GroupError::Malformed("non-handshake oob packet".into()));
        }
        let result = self.route_packet(net, &header, data, None, Some(relay_pk));
        self.drain_events();
        result
    }

    fn route_packet(
        &mut self,
        net: &mut dyn Overlay,
        header: &packet::OuterHeader,
        data: &[u8],
        source: Option<IpPort>,
        oob_relay_pk: Option<PublicKey>,
    ) -> Result<()> {
        let Session {
            chats, clock, rng, ..
        } = self;
        let chat = chats
            .iter_mut()
            .flatten()
            .find(|c| c.chat_id_hash == header.chat_id_hash)
            .ok_or(GroupError::GroupUnknown)?;

        let mut ctx = Ctx {
            net,
            clock: clock.as_ref(),
            rng: rng.as_mut(),
        };

        match header.kind {
            PacketKind::Handshake => {
                if chat.block_handshakes {
                    return Err(GroupError::RateLimited);
                }
                chat.handle_handshake_packet(&mut ctx, data, source, oob_relay_pk)
            }
            PacketKind::Lossless | PacketKind::Lossy => {
                chat.handle_data_packet(&mut ctx, header, data, source)
            }
        }
    }

    // --- tick ---

    /// Drive every chat one step: pending handshakes, pings, timers,
    /// retransmissions, announce refresh, and deferred deletion.
    pub fn tick(&mut self, net: &mut dyn Overlay) {
        let now = self.clock.unix_time();

        for slot in &mut self.chats {
            let Some(chat) = slot.as_mut() else { continue };

            if chat.connection_state == ConnectionState::Closing {
                tracing::info!(group = chat.group_number, "deleting closed group");
                *slot = None;
                continue;
            }

            let mut ctx = Ctx {
                net: &mut *net,
                clock: self.clock.as_ref(),
                rng: self.rng.as_mut(),
            };
            chat.do_tick(&mut ctx);

            // Refresh our announce while the group is public and alive.
            if chat.is_public()
                && chat.connection_state == ConnectionState::Connected
                && palaver_types::time::is_timeout(
                    now,
                    chat.last_self_announce,
                    palaver_announce::ANNOUNCE_TIMEOUT_SECS / 2,
                )
            {
                if let Some(relay) = net.self_relay() {
                    self.announces.add_announce(
                        chat.chat_id,
                        chat.self_keys.public.enc,
                        relay,
                        now,
                    );
                    chat.last_self_announce = now;
                }
            }
        }

        self.announces.do_tick(now);
        self.drain_events();
    }

    // --- accessors ---

    /// Our peer id within a group.
    pub fn self_peer_id(&self, group_number: u32) -> Result<PeerId> {
        Ok(self.chat(group_number)?.self_peer().peer_id)
    }

    /// Our role within a group.
    pub fn self_role(&self, group_number: u32) -> Result<Role> {
        Ok(self.chat(group_number)?.self_peer().role)
    }

    /// Our nick within a group.
    pub fn self_nick(&self, group_number: u32) -> Result<Vec<u8>> {
        Ok(self.chat(group_number)?.self_peer().nick.clone())
    }

    /// A group's chat id.
    pub fn chat_id(&self, group_number: u32) -> Result<ChatId> {
        Ok(self.chat(group_number)?.chat_id)
    }

    /// A peer's nick.
    pub fn peer_nick(&self, group_number: u32, peer_id: PeerId) -> Result<Vec<u8>> {
        let chat = self.chat(group_number)?;
        let index = chat.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        Ok(chat.entries[index].peer.nick.clone())
    }

    /// A peer's status.
    pub fn peer_status(&self, group_number: u32, peer_id: PeerId) -> Result<PeerStatus> {
        let chat = self.chat(group_number)?;
        let index = chat.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        Ok(chat.entries[index].peer.status)
    }

    /// A peer's role.
    pub fn peer_role(&self, group_number: u32, peer_id: PeerId) -> Result<Role> {
        let chat = self.chat(group_number)?;
        let index = chat.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        Ok(chat.entries[index].peer.role)
    }

    /// A peer's long-term encryption public key.
    pub fn peer_public_key(&self, group_number: u32, peer_id: PeerId) -> Result<PublicKey> {
        let chat = self.chat(group_number)?;
        let index = chat.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        if index == 0 {
            return Ok(chat.self_keys.public.enc);
        }
        Ok(chat.conn(index).ok_or(GroupError::PeerUnknown)?.public_key)
    }

    /// The current topic.
    pub fn topic(&self, group_number: u32) -> Result<Vec<u8>> {
        Ok(self.chat(group_number)?.topic_info.topic.clone())
    }

    /// The group name from the shared state.
    pub fn group_name(&self, group_number: u32) -> Result<Vec<u8>> {
        Ok(self.chat(group_number)?.shared_state.group_name.clone())
    }

    /// The group password from the shared state.
    pub fn password(&self, group_number: u32) -> Result<Vec<u8>> {
        Ok(self.chat(group_number)?.shared_state.password.clone())
    }

    /// The group peer limit.
    pub fn max_peers(&self, group_number: u32) -> Result<u32> {
        Ok(self.chat(group_number)?.shared_state.max_peers)
    }

    /// The group privacy state.
    pub fn privacy_state(&self, group_number: u32) -> Result<Privacy> {
        Ok(self.chat(group_number)?.shared_state.privacy)
    }

    /// Leave every group and drop all state. The session is unusable
    /// for those groups afterwards.
    pub fn kill(&mut self, net: &mut dyn Overlay) {
        let groups: Vec<u32> = self.iter_chats().map(|c| c.group_number).collect();
        for group in groups {
            let _ = self.group_exit(net, group, b"");
        }
        for slot in &mut self.chats {
            *slot = None;
        }
    }

    // --- mutators needing the overlay ---

    /// Send a message to a group.
    pub fn send_message(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        kind: MessageType,
        message: &[u8],
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.send_message(ctx, kind, message)
        })
    }

    /// Send a private message to one peer.
    pub fn send_private_message(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        peer_id: PeerId,
        message: &[u8],
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.send_private_message(ctx, peer_id, message)
        })
    }

    /// Send a custom packet to every confirmed peer.
    pub fn send_custom_packet(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        lossless: bool,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Err(GroupError::Malformed("empty custom packet".into()));
        }
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            if lossless {
                chat.send_lossless_all(ctx, palaver_wire::kinds::InnerKind::CustomPacket, data);
            } else {
                chat.send_lossy_all(ctx, palaver_wire::kinds::InnerKind::CustomPacket, data);
            }
            Ok(())
        })
    }

    /// Set the group topic.
    pub fn set_topic(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        topic: &[u8],
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| chat.set_topic(ctx, topic))
    }

    /// Change our nick.
    pub fn set_self_nick(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        nick: &[u8],
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| chat.set_self_nick(ctx, nick))
    }

    /// Change our status.
    pub fn set_self_status(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        status: PeerStatus,
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.set_self_status(ctx, status)
        })
    }

    /// Founder: set the group password.
    pub fn founder_set_password(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        password: &[u8],
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.founder_set_password(ctx, password)
        })
    }

    /// Founder: set the privacy state.
    pub fn founder_set_privacy(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        privacy: Privacy,
    ) -> Result<()> {
        let result = self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.founder_set_privacy(ctx, privacy)
        });
        if result.is_ok() && privacy == Privacy::Private {
            if let Ok(chat_id) = self.chat_id(group_number) {
                self.announces.cleanup(&chat_id);
            }
        }
        result
    }

    /// Founder: set the peer limit.
    pub fn founder_set_max_peers(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        max_peers: u32,
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.founder_set_max_peers(ctx, max_peers)
        })
    }

    /// Change a peer's role.
    pub fn set_peer_role(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        peer_id: PeerId,
        role: Role,
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            let index = chat.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
            chat.set_peer_role(ctx, index, role)
        })
    }

    /// Kick or ban a peer.
    pub fn remove_peer(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        peer_id: PeerId,
        ban: bool,
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| {
            chat.remove_peer(ctx, peer_id, ban)
        })
    }

    /// Lift a ban.
    pub fn remove_ban(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        ban_id: u32,
    ) -> Result<()> {
        self.with_chat_ctx(net, group_number, |chat, ctx| chat.remove_ban(ctx, ban_id))
    }

    /// Toggle local ignore for a peer.
    pub fn toggle_ignore(&mut self, group_number: u32, peer_id: PeerId, ignore: bool) -> Result<()> {
        self.chat_mut(group_number)?.toggle_ignore(peer_id, ignore)
    }

    fn with_chat_ctx<T>(
        &mut self,
        net: &mut dyn Overlay,
        group_number: u32,
        f: impl FnOnce(&mut Chat, &mut Ctx<'_>) -> Result<T>,
    ) -> Result<T> {
        let Session {
            chats, clock, rng, ..
        } = self;
        let chat = chats
            .get_mut(group_number as usize)
            .and_then(|c| c.as_mut())
            .ok_or(GroupError::GroupUnknown)?;
        let mut ctx = Ctx {
            net,
            clock: clock.as_ref(),
            rng: rng.as_mut(),
        };
        let result = f(chat, &mut ctx);
        self.drain_events();
        result
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use palaver_types::network::RelayNode;

    /// An overlay that accepts and discards everything.
    pub struct NullOverlay;

    impl Overlay for NullOverlay {
        fn send_udp(&mut self, _to: IpPort, _packet: &[u8]) -> bool {
            true
        }
        fn send_relay(&mut self, _relay_pk: &PublicKey, _to_pk: &PublicKey, _packet: &[u8]) -> bool {
            true
        }
        fn send_oob(&mut self, _relay: &RelayNode, _to_pk: &PublicKey, _packet: &[u8]) -> bool {
            true
        }
        fn send_friend_packet(&mut self, _friend: FriendId, _packet: &[u8]) -> bool {
            true
        }
        fn self_relay(&mut self) -> Option<RelayNode> {
            None
        }
        fn self_ip_port(&mut self) -> Option<IpPort> {
            None
        }
    }
}
