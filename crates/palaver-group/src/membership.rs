//! Peer table operations: insert, update, delete, lookup, and role
//! validation.
//!
//! The table compacts deletions in O(1) by swapping with the last slot;
//! `peer_id` is the stable handle the host uses across compactions.

use rand_core::RngCore;

use palaver_types::network::IpPort;
use palaver_types::peer::Role;
use palaver_types::state::SanctionKind;
use palaver_types::{PeerId, PublicKey, SigPublicKey};
use palaver_wire::records::PeerInfo;

use crate::chat::Chat;
use crate::conn::PeerConnection;
use crate::events::GroupEvent;
use crate::peer::{Peer, PeerEntry};
use crate::{GroupError, Result};

impl Chat {
    /// Index of the peer with this encryption public key.
    pub fn peer_index_by_pk(&self, pk: &PublicKey) -> Option<usize> {
        // Slot 0 is self; our encryption key lives in self_keys.
        if &self.self_keys.public.enc == pk {
            return Some(0);
        }
        self.entries
            .iter()
            .position(|e| e.conn.as_ref().is_some_and(|c| &c.public_key == pk))
    }

    /// Index of the peer with this signing public key.
    pub fn peer_index_by_sig_pk(&self, sig_pk: &SigPublicKey) -> Option<usize> {
        if &self.self_keys.public.sig == sig_pk {
            return Some(0);
        }
        self.entries
            .iter()
            .position(|e| e.conn.as_ref().is_some_and(|c| &c.sig_pk == sig_pk))
    }

    /// Index of the peer with this host-visible id.
    pub fn peer_index_by_id(&self, peer_id: PeerId) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.peer_id == peer_id)
    }

    /// Index of the peer using this nick, if any.
    pub fn peer_index_by_nick(&self, nick: &[u8]) -> Option<usize> {
        if nick.is_empty() {
            return None;
        }
        self.entries.iter().position(|e| e.peer.nick == nick)
    }

    /// A peer's connection, when it has one (never for self).
    pub fn conn(&self, index: usize) -> Option<&PeerConnection> {
        self.entries.get(index)?.conn.as_ref()
    }

    /// A peer's connection, mutably.
    pub fn conn_mut(&mut self, index: usize) -> Option<&mut PeerConnection> {
        self.entries.get_mut(index)?.conn.as_mut()
    }

    /// Allocate a peer id no existing peer uses.
    fn new_peer_id(&self, rng: &mut dyn RngCore) -> PeerId {
        loop {
            let id = rng.next_u32();
            if !self.entries.iter().any(|e| e.peer.peer_id == id) {
                return id;
            }
        }
    }

    /// Insert a new, unvalidated peer.
    ///
    /// # Errors
    ///
    /// [`GroupError::PeerDuplicate`] if the key is already present.
    pub fn peer_add(
        &mut self,
        rng: &mut dyn RngCore,
        public_key: PublicKey,
        addr: Option<IpPort>,
        now: u64,
    ) -> Result<usize> {
        if self.peer_index_by_pk(&public_key).is_some() {
            return Err(GroupError::PeerDuplicate);
        }

        let peer_id = self.new_peer_id(rng);
        let jitter = u64::from(rng.next_u32());
        self.entries.push(PeerEntry {
            peer: Peer::unvalidated(peer_id),
            conn: Some(PeerConnection::new(public_key, addr, now, jitter)),
        });

        tracing::debug!(
            group = self.group_number,
            peer = %palaver_types::fmt_key(&public_key),
            index = self.entries.len() - 1,
            "added peer"
        );
        Ok(self.entries.len() - 1)
    }

    /// Apply received peer info to the peer at `index`.
    ///
    /// # Errors
    ///
    /// [`GroupError::DuplicateNick`] for an empty nick, or when another
    /// peer already uses the nick; the offender is deleted in the
    /// latter case and the caller must not touch the index again.
    pub fn peer_update(&mut self, index: usize, info: &PeerInfo) -> Result<()> {
        if info.nick.is_empty() {
            return Err(GroupError::DuplicateNick);
        }

        if let Some(holder) = self.peer_index_by_nick(&info.nick) {
            if holder != index {
                tracing::warn!(
                    group = self.group_number,
                    nick = %String::from_utf8_lossy(&info.nick),
                    "duplicate nick, deleting offender"
                );
                self.peer_delete(index, b"duplicate nick");
                return Err(GroupError::DuplicateNick);
            }
        }

        let entry = self.entries.get_mut(index).ok_or(GroupError::PeerUnknown)?;
        entry.peer.nick = info.nick.clone();
        entry.peer.status = info.status;
        entry.peer.role = info.role;
        Ok(())
    }

    /// Remove the peer at `index`, compacting the table.
    ///
    /// Handshaked identities are remembered in the reconnect ring, and a
    /// peer-exit event fires for confirmed peers.
    pub fn peer_delete(&mut self, index: usize, part_message: &[u8]) {
        if index == 0 || index >= self.entries.len() {
            return;
        }

        let entry = self.entries.swap_remove(index);
        let Some(conn) = entry.conn else { return };

        if conn.handshaked {
            self.remember_confirmed_peer(conn.public_key);
        }
        if conn.confirmed {
            self.push_event(GroupEvent::PeerExit {
                peer_id: entry.peer.peer_id,
                part_message: part_message.to_vec(),
            });
        }

        tracing::debug!(
            group = self.group_number,
            peer = %palaver_types::fmt_key(&conn.public_key),
            "deleted peer"
        );
    }

    /// Expected role for the peer at `index`, derived from the
    /// replicated state.
    fn derived_role(&self, index: usize) -> Result<Role> {
        let (enc_pk, sig_pk) = if index == 0 {
            (self.self_keys.public.enc, self.self_keys.public.sig)
        } else {
            let conn = self.conn(index).ok_or(GroupError::PeerUnknown)?;
            (conn.public_key, conn.sig_pk)
        };

        if enc_pk == self.shared_state.founder.enc {
            return Ok(Role::Founder);
        }
        if self.mod_list.iter().any(|k| *k == sig_pk) {
            return Ok(Role::Moderator);
        }
        let observed = self.sanctions.iter().any(|s| {
            matches!(&s.kind, SanctionKind::Observer { public_key } if *public_key == enc_pk)
        });
        if observed {
            return Ok(Role::Observer);
        }
        Ok(Role::User)
    }

    /// Check the peer's claimed role against the replicated state.
    ///
    /// # Errors
    ///
    /// [`GroupError::RoleInsufficient`] on mismatch; the caller deletes
    /// the peer.
    pub fn validate_peer_role(&self, index: usize) -> Result<()> {
        let claimed = self
            .entries
            .get(index)
            .ok_or(GroupError::PeerUnknown)?
            .peer
            .role;
        if claimed == Role::Invalid {
            return Err(GroupError::RoleInsufficient);
        }
        if claimed != self.derived_role(index)? {
            return Err(GroupError::RoleInsufficient);
        }
        Ok(())
    }

    /// Re-derive our own role after any moderation-state change.
    pub fn validate_self_role(&mut self) {
        if let Ok(role) = self.derived_role(0) {
            self.entries[0].peer.role = role;
        }
    }

    /// True if this address is covered by a ban sanction.
    pub fn is_ip_banned(&self, addr: &IpPort) -> bool {
        self.sanctions.iter().any(|s| {
            matches!(&s.kind, SanctionKind::Ban { ip_port, .. } if ip_port.ip == addr.ip)
        })
    }

    /// True if this signing key belongs to a moderator or the founder.
    pub fn is_privileged_sig_pk(&self, sig_pk: &SigPublicKey) -> bool {
        sig_pk == &self.shared_state.founder.sig || self.mod_list.iter().any(|k| k == sig_pk)
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
            b"Test",
            &SelfPeerInfo {
                nick: b"founder".to_vec(),
                status: PeerStatus::None,
            },
            1000,
        )
        .expect("create")
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut chat = founder_chat();
        let idx = chat
            .peer_add(&mut OsRng, [9u8; 32], None, 1000)
            .expect("add");
        assert_eq!(idx, 1);
        assert!(matches!(
            chat.peer_add(&mut OsRng, [9u8; 32], None, 1000),
            Err(GroupError::PeerDuplicate)
        ));
    }

    #[test]
    fn peer_ids_are_unique() {
        let mut chat = founder_chat();
        for i in 1..=20u8 {
            chat.peer_add(&mut OsRng, [i; 32], None, 1000).expect("add");
        }
        let mut ids: Vec<PeerId> = chat.entries.iter().map(|e| e.peer.peer_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), chat.peer_count());
    }

    #[test]
    fn duplicate_nick_deletes_offender() {
        let mut chat = founder_chat();
        let a = chat.peer_add(&mut OsRng, [1u8; 32], None, 1000).expect("add");
        let b = chat.peer_add(&mut OsRng, [2u8; 32], None, 1000).expect("add");

        chat.peer_update(
            a,
            &PeerInfo {
                nick: b"alice".to_vec(),
                status: PeerStatus::None,
                role: Role::User,
            },
        )
        .expect("update");

        let err = chat.peer_update(
            b,
            &PeerInfo {
                nick: b"alice".to_vec(),
                status: PeerStatus::None,
                role: Role::User,
            },
        );
        assert!(matches!(err, Err(GroupError::DuplicateNick)));
        assert_eq!(chat.peer_count(), 2);
        assert!(chat.peer_index_by_pk(&[2u8; 32]).is_none());
    }

    #[test]
    fn delete_compacts_and_remembers_handshaked() {
        let mut chat = founder_chat();
        let a = chat.peer_add(&mut OsRng, [1u8; 32], None, 1000).expect("add");
        chat.peer_add(&mut OsRng, [2u8; 32], None, 1000).expect("add");

        if let Some(conn) = chat.conn_mut(a) {
            conn.handshaked = true;
        }
        chat.peer_delete(a, b"");

        assert_eq!(chat.peer_count(), 2);
        assert!(chat.is_peer_remembered(&[1u8; 32]));
        // The swapped-in peer is still reachable by key.
        assert!(chat.peer_index_by_pk(&[2u8; 32]).is_some());
    }

    #[test]
    fn self_role_follows_mod_list() {
        let mut chat = founder_chat();
        assert_eq!(chat.self_peer().role, Role::Founder);

        // A user chat whose sig key enters the mod list becomes moderator.
        let mut joiner = Chat::join(
            1,
            chat.chat_id,
            b"",
            &SelfPeerInfo {
                nick: b"user".to_vec(),
                status: PeerStatus::None,
            },
            palaver_types::peer::JoinType::Public,
            1000,
        )
        .expect("join");
        joiner.shared_state = chat.shared_state.clone();
        joiner.validate_self_role();
        assert_eq!(joiner.self_peer().role, Role::User);

        joiner.mod_list.push(joiner.self_keys.public.sig);
        joiner.validate_self_role();
        assert_eq!(joiner.self_peer().role, Role::Moderator);
    }
}
