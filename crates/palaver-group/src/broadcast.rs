//! Typed broadcast packets: the 13-byte inner header, the send paths
//! the host drives (messages, nick and status changes, exits, kicks,
//! bans), and the matching handlers.
//!
//! Broadcasts go lossless to every confirmed peer; a private message is
//! the one unicast exception.

use palaver_types::events::{MessageType, ModerationEvent};
use palaver_types::peer::{PeerStatus, Role};
use palaver_types::state::SanctionKind;
use palaver_types::PeerId;
use palaver_wire::bytes::{Reader, Writer};
use palaver_wire::kinds::{BroadcastKind, InnerKind};
use palaver_wire::records;

use crate::chat::Chat;
use crate::events::GroupEvent;
use crate::overlay::Ctx;
use crate::{GroupError, Result};

/// Broadcast inner header: type, chat id hash, unix time.
const BROADCAST_HEADER_SIZE: usize = 1 + 4 + 8;

impl Chat {
    fn broadcast_body(&self, ctx: &Ctx<'_>, kind: BroadcastKind, payload: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(BROADCAST_HEADER_SIZE + payload.len());
        w.put_u8(kind as u8);
        w.put_u32(self.chat_id_hash);
        w.put_u64(ctx.now());
        w.put(payload);
        w.into_vec()
    }

    /// Send a broadcast to every confirmed peer.
    pub(crate) fn send_broadcast(
        &mut self,
        ctx: &mut Ctx<'_>,
        kind: BroadcastKind,
        payload: &[u8],
    ) -> Result<()> {
        let body = self.broadcast_body(ctx, kind, payload);
        self.send_lossless_all(ctx, InnerKind::Broadcast, &body);
        Ok(())
    }

    /// Send a broadcast to a single peer.
    fn send_broadcast_to(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        kind: BroadcastKind,
        payload: &[u8],
    ) -> Result<()> {
        let body = self.broadcast_body(ctx, kind, payload);
        self.send_lossless(ctx, index, InnerKind::Broadcast, &body)
    }

    // --- host-driven sends ---

    /// Send a plain or action message to the group.
    pub fn send_message(&mut self, ctx: &mut Ctx<'_>, kind: MessageType, message: &[u8]) -> Result<()> {
        if message.len() > palaver_types::MAX_MESSAGE_SIZE {
            return Err(GroupError::Malformed("message too long".into()));
        }
        if message.is_empty() {
            return Err(GroupError::Malformed("empty message".into()));
        }
        if self.self_peer().role == Role::Observer {
            return Err(GroupError::RoleInsufficient);
        }

        let bc = match kind {
            MessageType::Plain => BroadcastKind::PlainMessage,
            MessageType::Action => BroadcastKind::ActionMessage,
        };
        self.send_broadcast(ctx, bc, message)
    }

    /// Send a private message to a single peer.
    pub fn send_private_message(
        &mut self,
        ctx: &mut Ctx<'_>,
        peer_id: PeerId,
        message: &[u8],
    ) -> Result<()> {
        if message.len() > palaver_types::MAX_MESSAGE_SIZE {
            return Err(GroupError::Malformed("message too long".into()));
        }
        if message.is_empty() {
            return Err(GroupError::Malformed("empty message".into()));
        }
        if self.self_peer().role == Role::Observer {
            return Err(GroupError::RoleInsufficient);
        }
        let index = self.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        self.send_broadcast_to(ctx, index, BroadcastKind::PrivateMessage, message)
    }

    /// Change our nick and tell the group.
    pub fn set_self_nick(&mut self, ctx: &mut Ctx<'_>, nick: &[u8]) -> Result<()> {
        if nick.is_empty() || nick.len() > palaver_types::MAX_NICK_SIZE {
            return Err(GroupError::DuplicateNick);
        }
        if self.peer_index_by_nick(nick).is_some_and(|i| i != 0) {
            return Err(GroupError::DuplicateNick);
        }
        self.self_peer_mut().nick = nick.to_vec();
        self.send_broadcast(ctx, BroadcastKind::Nick, nick)
    }

    /// Change our status and tell the group.
    pub fn set_self_status(&mut self, ctx: &mut Ctx<'_>, status: PeerStatus) -> Result<()> {
        self.self_peer_mut().status = status;
        self.send_broadcast(ctx, BroadcastKind::Status, &[status as u8])
    }

    /// Announce our departure with an optional part message.
    pub(crate) fn send_self_exit(&mut self, ctx: &mut Ctx<'_>, part_message: &[u8]) -> Result<()> {
        if part_message.len() > palaver_types::MAX_PART_MESSAGE_SIZE {
            return Err(GroupError::Malformed("part message too long".into()));
        }
        self.send_broadcast(ctx, BroadcastKind::PeerExit, part_message)
    }

    /// Kick or ban the peer with `peer_id`.
    pub fn remove_peer(&mut self, ctx: &mut Ctx<'_>, peer_id: PeerId, ban: bool) -> Result<()> {
        let index = self.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        if index == 0 {
            return Err(GroupError::PeerUnknown);
        }
        let target_role = self.entries[index].peer.role;
        let self_role = self.self_peer().role;

        if !self_role.is_privileged() || target_role == Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        if self_role != Role::Founder && target_role == Role::Moderator {
            return Err(GroupError::RoleInsufficient);
        }

        // Strip any privileged or sanctioned role first so the group's
        // lists stay consistent with the removal.
        if matches!(target_role, Role::Moderator | Role::Observer) {
            self.set_peer_role(ctx, index, Role::User)?;
        }

        let target_pk = self.conn(index).ok_or(GroupError::PeerUnknown)?.public_key;
        let mut payload = Writer::new();
        let event = if ban {
            payload.put_u8(ModerationEvent::Ban as u8);
            payload.put(&target_pk);

            let ip_port = self
                .conn(index)
                .and_then(|c| c.addr)
                .unwrap_or_else(palaver_types::network::IpPort::unspecified);
            let sanction = self.make_sanction(
                SanctionKind::Ban {
                    ip_port,
                    ban_id: self.next_ban_id(),
                },
                ctx.now(),
            )?;
            self.sanctions.push(sanction.clone());
            self.regenerate_sanctions_creds(true)?;

            records::pack_sanction(&mut payload, &sanction);
            records::pack_creds(&mut payload, &self.sanctions_creds);
            ModerationEvent::Ban
        } else {
            payload.put_u8(ModerationEvent::Kick as u8);
            payload.put(&target_pk);
            ModerationEvent::Kick
        };

        self.send_broadcast(ctx, BroadcastKind::RemovePeer, &payload.into_vec())?;

        let src = self.self_peer().peer_id;
        self.push_event(GroupEvent::Moderation {
            src_peer_id: src,
            target_peer_id: peer_id,
            event,
        });
        self.peer_delete(index, b"");
        Ok(())
    }

    /// Lift a ban by id and distribute fresh credentials.
    pub fn remove_ban(&mut self, ctx: &mut Ctx<'_>, ban_id: u32) -> Result<()> {
        if !self.self_peer().role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }

        let before = self.sanctions.len();
        self.sanctions.retain(
            |s| !matches!(s.kind, SanctionKind::Ban { ban_id: id, .. } if id == ban_id),
        );
        if self.sanctions.len() == before {
            return Err(GroupError::PeerUnknown);
        }
        self.regenerate_sanctions_creds(true)?;

        let mut payload = Writer::new();
        payload.put_u32(ban_id);
        records::pack_creds(&mut payload, &self.sanctions_creds);
        self.send_broadcast(ctx, BroadcastKind::RemoveBan, &payload.into_vec())
    }

    // --- handlers ---

    /// Dispatch an inbound BROADCAST packet.
    pub(crate) fn handle_broadcast(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(body);
        let kind = BroadcastKind::from_u8(r.take_u8()?)
            .ok_or_else(|| GroupError::Malformed("unknown broadcast type".into()))?;
        let _chat_id_hash = r.take_u32()?;
        let _timestamp = r.take_u64()?;
        let payload = r.take_rest();

        match kind {
            BroadcastKind::Status => self.handle_bc_status(index, payload),
            BroadcastKind::Nick => self.handle_bc_nick(index, payload),
            BroadcastKind::PlainMessage => {
                self.handle_bc_message(index, payload, MessageType::Plain)
            }
            BroadcastKind::ActionMessage => {
                self.handle_bc_message(index, payload, MessageType::Action)
            }
            BroadcastKind::PrivateMessage => self.handle_bc_private_message(index, payload),
            BroadcastKind::PeerExit => {
                self.peer_delete(index, payload);
                Ok(())
            }
            BroadcastKind::RemovePeer => self.handle_bc_remove_peer(ctx, index, payload),
            BroadcastKind::RemoveBan => self.handle_bc_remove_ban(index, payload),
            BroadcastKind::SetMod => self.handle_bc_set_mod(index, payload),
            BroadcastKind::SetObserver => self.handle_bc_set_observer(index, payload),
        }
    }

    fn handle_bc_status(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let byte = *payload.first().ok_or(GroupError::ShortBuffer)?;
        let status = PeerStatus::from_u8(byte)
            .ok_or_else(|| GroupError::Malformed("invalid status".into()))?;

        let entry = self.entries.get_mut(index).ok_or(GroupError::PeerUnknown)?;
        entry.peer.status = status;
        let peer_id = entry.peer.peer_id;
        self.push_event(GroupEvent::StatusChange { peer_id, status });
        Ok(())
    }

    fn handle_bc_nick(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > palaver_types::MAX_NICK_SIZE {
            self.peer_delete(index, b"invalid nick");
            return Err(GroupError::DuplicateNick);
        }
        if let Some(holder) = self.peer_index_by_nick(payload) {
            if holder != index {
                self.peer_delete(index, b"duplicate nick");
                return Err(GroupError::DuplicateNick);
            }
        }

        let entry = self.entries.get_mut(index).ok_or(GroupError::PeerUnknown)?;
        entry.peer.nick = payload.to_vec();
        let peer_id = entry.peer.peer_id;
        self.push_event(GroupEvent::NickChange {
            peer_id,
            nick: payload.to_vec(),
        });
        Ok(())
    }

    fn handle_bc_message(&mut self, index: usize, payload: &[u8], kind: MessageType) -> Result<()> {
        if payload.is_empty() || payload.len() > palaver_types::MAX_MESSAGE_SIZE {
            return Err(GroupError::Malformed("bad message length".into()));
        }
        let entry = self.entries.get(index).ok_or(GroupError::PeerUnknown)?;
        if entry.peer.role == Role::Observer {
            return Err(GroupError::RoleInsufficient);
        }
        if entry.peer.ignore {
            return Ok(());
        }
        let peer_id = entry.peer.peer_id;
        self.push_event(GroupEvent::Message {
            peer_id,
            kind,
            message: payload.to_vec(),
        });
        Ok(())
    }

    fn handle_bc_private_message(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > palaver_types::MAX_MESSAGE_SIZE {
            return Err(GroupError::Malformed("bad message length".into()));
        }
        let entry = self.entries.get(index).ok_or(GroupError::PeerUnknown)?;
        if entry.peer.role == Role::Observer || entry.peer.ignore {
            return Ok(());
        }
        let peer_id = entry.peer.peer_id;
        self.push_event(GroupEvent::PrivateMessage {
            peer_id,
            message: payload.to_vec(),
        });
        Ok(())
    }

    fn handle_bc_remove_peer(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        payload: &[u8],
    ) -> Result<()> {
        let sender_role = self
            .entries
            .get(index)
            .ok_or(GroupError::PeerUnknown)?
            .peer
            .role;
        if !sender_role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }

        let mut r = Reader::new(payload);
        let event = ModerationEvent::from_u8(r.take_u8()?)
            .ok_or_else(|| GroupError::Malformed("bad moderation event".into()))?;
        if !matches!(event, ModerationEvent::Kick | ModerationEvent::Ban) {
            return Err(GroupError::Malformed("bad removal event".into()));
        }
        let target_pk: palaver_types::PublicKey = r.take_array()?;
        let target_index = self.peer_index_by_pk(&target_pk);

        // Moderators and the founder cannot be removed this way.
        if let Some(target) = target_index {
            if self.entries[target].peer.role.is_privileged() {
                return Err(GroupError::RoleInsufficient);
            }
        }

        let src_peer_id = self.peer_id_at(index).unwrap_or(0);

        // We are the target: the group is gone for us.
        if target_index == Some(0) {
            self.push_event(GroupEvent::Moderation {
                src_peer_id,
                target_peer_id: self.self_peer().peer_id,
                event,
            });
            self.connection_state = palaver_types::peer::ConnectionState::Closing;
            return Ok(());
        }

        if event == ModerationEvent::Ban {
            let sanction = records::unpack_sanction(&mut r)?;
            let creds = records::unpack_creds(&mut r)?;
            crate::moderation::verify_sanction(
                &sanction,
                &self.mod_list,
                &self.shared_state.founder.sig,
            )?;
            if creds.version >= self.sanctions_creds.version {
                self.sanctions.push(sanction);
                self.sanctions_creds = creds;
            }
        }

        let Some(target) = target_index else {
            return Ok(());
        };
        let target_peer_id = self.peer_id_at(target).unwrap_or(0);
        self.push_event(GroupEvent::Moderation {
            src_peer_id,
            target_peer_id,
            event,
        });
        self.peer_delete(target, b"");
        let _ = ctx;
        Ok(())
    }

    fn handle_bc_remove_ban(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let sender_role = self
            .entries
            .get(index)
            .ok_or(GroupError::PeerUnknown)?
            .peer
            .role;
        if !sender_role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }

        let mut r = Reader::new(payload);
        let ban_id = r.take_u32()?;
        let creds = records::unpack_creds(&mut r)?;
        if creds.version < self.sanctions_creds.version {
            return Ok(());
        }

        self.sanctions.retain(
            |s| !matches!(s.kind, SanctionKind::Ban { ban_id: id, .. } if id == ban_id),
        );
        self.sanctions_creds = creds;
        Ok(())
    }

    fn handle_bc_set_mod(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let sender = self.entries.get(index).ok_or(GroupError::PeerUnknown)?;
        if sender.peer.role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        let src_peer_id = sender.peer.peer_id;

        let mut r = Reader::new(payload);
        let add = r.take_u8()? != 0;
        let sig_pk: palaver_types::SigPublicKey = r.take_array()?;

        let target = self.peer_index_by_sig_pk(&sig_pk);
        if target == Some(index) {
            return Err(GroupError::Malformed("founder self-mod".into()));
        }

        if add {
            if !self.mod_list.iter().any(|k| *k == sig_pk) {
                self.mod_list.push(sig_pk);
            }
        } else {
            self.mod_list.retain(|k| *k != sig_pk);
        }
        self.shared_state.mod_list_hash = crate::moderation::mod_list_hash(&self.mod_list);
        self.validate_self_role();

        let Some(target) = target else { return Ok(()) };
        let role = if add { Role::Moderator } else { Role::User };
        self.entries[target].peer.role = role;
        let target_peer_id = self.entries[target].peer.peer_id;
        self.push_event(GroupEvent::Moderation {
            src_peer_id,
            target_peer_id,
            event: if add {
                ModerationEvent::Moderator
            } else {
                ModerationEvent::User
            },
        });
        Ok(())
    }

    fn handle_bc_set_observer(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        let sender = self.entries.get(index).ok_or(GroupError::PeerUnknown)?;
        if !sender.peer.role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }
        let src_peer_id = sender.peer.peer_id;

        let mut r = Reader::new(payload);
        let add = r.take_u8()? != 0;
        let enc_pk: palaver_types::PublicKey = r.take_array()?;
        let sig_pk: palaver_types::SigPublicKey = r.take_array()?;

        // Moderators cannot be made observers directly.
        if self.is_privileged_sig_pk(&sig_pk) {
            return Err(GroupError::RoleInsufficient);
        }
        let target = self.peer_index_by_pk(&enc_pk);
        if target == Some(index) {
            return Err(GroupError::Malformed("self-sanction".into()));
        }

        if add {
            let sanction = records::unpack_sanction(&mut r)?;
            let creds = records::unpack_creds(&mut r)?;
            crate::moderation::verify_sanction(
                &sanction,
                &self.mod_list,
                &self.shared_state.founder.sig,
            )?;
            if creds.version < self.sanctions_creds.version {
                return Ok(());
            }
            self.sanctions.push(sanction);
            self.sanctions_creds = creds;
        } else {
            let creds = records::unpack_creds(&mut r)?;
            if creds.version < self.sanctions_creds.version {
                return Ok(());
            }
            self.sanctions.retain(|s| {
                !matches!(&s.kind, SanctionKind::Observer { public_key } if *public_key == enc_pk)
            });
            self.sanctions_creds = creds;
        }
        self.validate_self_role();

        let Some(target) = target else { return Ok(()) };
        let role = if add { Role::Observer } else { Role::User };
        self.entries[target].peer.role = role;
        let target_peer_id = self.entries[target].peer.peer_id;
        self.push_event(GroupEvent::Moderation {
            src_peer_id,
            target_peer_id,
            event: if add {
                ModerationEvent::Observer
            } else {
                ModerationEvent::User
            },
        });
        Ok(())
    }

    /// Toggle the local-only ignore flag for a peer.
    pub fn toggle_ignore(&mut self, peer_id: PeerId, ignore: bool) -> Result<()> {
        let index = self.peer_index_by_id(peer_id).ok_or(GroupError::PeerUnknown)?;
        self.entries[index].peer.ignore = ignore;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::identity::SelfPeerInfo;
    use palaver_types::peer::Privacy;

    fn founder_chat() -> Chat {
        Chat::create(
            0,
            Privacy::Public,
            b"bc",
            &SelfPeerInfo {
                nick: b"founder".to_vec(),
                status: PeerStatus::None,
            },
            1000,
        )
        .expect("create")
    }

    #[test]
    fn observer_messages_are_refused() {
        let mut chat = founder_chat();
        let mut rng = rand::rngs::OsRng;
        let index = chat.peer_add(&mut rng, [9u8; 32], None, 1000).expect("add");
        chat.entries[index].peer.role = Role::Observer;

        assert!(matches!(
            chat.handle_bc_message(index, b"hi", MessageType::Plain),
            Err(GroupError::RoleInsufficient)
        ));
    }

    #[test]
    fn ignored_peer_messages_are_dropped_silently() {
        let mut chat = founder_chat();
        let mut rng = rand::rngs::OsRng;
        let index = chat.peer_add(&mut rng, [9u8; 32], None, 1000).expect("add");
        chat.entries[index].peer.role = Role::User;
        chat.entries[index].peer.ignore = true;

        chat.handle_bc_message(index, b"hi", MessageType::Plain)
            .expect("ok");
        assert!(chat.events.is_empty());
    }

    #[test]
    fn nick_collision_deletes_sender() {
        let mut chat = founder_chat();
        let mut rng = rand::rngs::OsRng;
        let a = chat.peer_add(&mut rng, [1u8; 32], None, 1000).expect("add");
        let b = chat.peer_add(&mut rng, [2u8; 32], None, 1000).expect("add");
        chat.entries[a].peer.nick = b"alice".to_vec();
        chat.entries[a].peer.role = Role::User;
        chat.entries[b].peer.role = Role::User;

        assert!(chat.handle_bc_nick(b, b"alice").is_err());
        assert!(chat.peer_index_by_pk(&[2u8; 32]).is_none());
        assert!(chat.peer_index_by_pk(&[1u8; 32]).is_some());
    }

    #[test]
    fn unprivileged_remove_peer_is_refused() {
        let mut chat = founder_chat();
        let mut rng = rand::rngs::OsRng;
        let sender = chat.peer_add(&mut rng, [1u8; 32], None, 1000).expect("add");
        chat.peer_add(&mut rng, [2u8; 32], None, 1000).expect("add");
        chat.entries[sender].peer.role = Role::User;

        let mut payload = Writer::new();
        payload.put_u8(ModerationEvent::Kick as u8);
        payload.put(&[2u8; 32]);

        let mut net = crate::session::tests_support::NullOverlay;
        let clock = palaver_types::time::SystemClock;
        let mut rng2 = rand::rngs::OsRng;
        let mut ctx = Ctx {
            net: &mut net,
            clock: &clock,
            rng: &mut rng2,
        };
        assert!(chat
            .handle_bc_remove_peer(&mut ctx, sender, &payload.into_vec())
            .is_err());
        assert_eq!(chat.peer_count(), 3);
    }
}
