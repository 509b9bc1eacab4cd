//! Replication of the four signed, versioned group artifacts (shared
//! state, moderator list, sanctions list, topic) and the founder and
//! moderator operations that mutate them.
//!
//! Higher version wins everywhere; equal versions keep the cached copy.
//! A peer that ships unverifiable state is deleted and, when other
//! peers remain, replaced as a sync source.

use palaver_crypto::ed25519;
use palaver_types::events::ModerationEvent;
use palaver_types::peer::{ConnectionState, Privacy, Role};
use palaver_types::state::{SanctionKind, SharedState, TopicInfo};
use palaver_types::SigPublicKey;
use palaver_wire::bytes::{Reader, Writer};
use palaver_wire::kinds::{BroadcastKind, InnerKind};
use palaver_wire::records;

use crate::chat::Chat;
use crate::events::GroupEvent;
use crate::overlay::Ctx;
use crate::{GroupError, Result};

impl Chat {
    // --- packet bodies ---

    /// SHARED_STATE body: detached signature followed by the packed
    /// state.
    pub(crate) fn shared_state_packet_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put(&self.shared_state_sig);
        records::pack_shared_state(&mut w, &self.shared_state);
        w.into_vec()
    }

    /// MOD_LIST body: count then the signing keys.
    pub(crate) fn mod_list_packet_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        records::pack_mod_list(&mut w, &self.mod_list);
        w.into_vec()
    }

    /// SANCTIONS_LIST body: count, entries, credentials.
    pub(crate) fn sanctions_packet_body(&self) -> Vec<u8> {
        records::pack_sanctions_packet(&self.sanctions, &self.sanctions_creds)
    }

    /// TOPIC body: detached signature followed by the packed topic info.
    pub(crate) fn topic_packet_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put(&self.topic_sig);
        records::pack_topic_info(&mut w, &self.topic_info);
        w.into_vec()
    }

    // --- shared state ---

    /// Increment the version and re-sign the shared state with the chat
    /// key. Founder only.
    ///
    /// # Errors
    ///
    /// [`GroupError::RoleInsufficient`] for non-founders,
    /// [`GroupError::VersionStale`] on version exhaustion.
    pub(crate) fn sign_shared_state(&mut self) -> Result<()> {
        if self.self_peer().role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        let secret = self
            .chat_sig_secret
            .as_ref()
            .ok_or(GroupError::RoleInsufficient)?;

        self.shared_state.version = self
            .shared_state
            .version
            .checked_add(1)
            .ok_or(GroupError::VersionStale)?;

        let signable = records::shared_state_signable(&self.shared_state);
        self.shared_state_sig = secret.sign(&signable).to_bytes();
        Ok(())
    }

    /// Push the current shared state to every confirmed peer.
    pub(crate) fn broadcast_shared_state(&mut self, ctx: &mut Ctx<'_>) {
        let body = self.shared_state_packet_body();
        self.send_lossless_all(ctx, InnerKind::SharedState, &body);
    }

    fn validate_shared_state(state: &SharedState) -> Result<()> {
        if state.max_peers == 0 {
            return Err(GroupError::Malformed("zero peer limit".into()));
        }
        if state.group_name.is_empty()
            || state.group_name.len() > palaver_types::MAX_GROUP_NAME_SIZE
        {
            return Err(GroupError::Malformed("bad group name".into()));
        }
        if state.password.len() > palaver_types::MAX_PASSWORD_SIZE {
            return Err(GroupError::Malformed("bad password length".into()));
        }
        Ok(())
    }

    /// Handle an inbound SHARED_STATE packet.
    pub(crate) fn handle_shared_state(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        let outcome = (|| -> Result<Option<SharedState>> {
            let mut r = Reader::new(body);
            let signature: [u8; 64] = r.take_array()?;
            let packed = r.take(records::PACKED_SHARED_STATE_SIZE)?;

            ed25519::verify_detached(&self.chat_id, packed, &signature)?;

            let state = records::unpack_shared_state(&mut Reader::new(packed))?;
            Self::validate_shared_state(&state)?;

            if state.version < self.shared_state.version {
                return Ok(None);
            }
            self.shared_state_sig = signature;
            Ok(Some(state))
        })();

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(new_state)) => {
                let old = std::mem::replace(&mut self.shared_state, new_state);
                self.emit_shared_state_changes(&old);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(group = self.group_number, %err, "bad shared state from peer");
                self.bad_peer_action(ctx, index, b"BAD SHARED STATE");
                Err(err)
            }
        }
    }

    /// Surface host-visible differences after a shared-state update.
    fn emit_shared_state_changes(&mut self, old: &SharedState) {
        if self.shared_state.max_peers != old.max_peers {
            self.push_event(GroupEvent::PeerLimit {
                max_peers: self.shared_state.max_peers,
            });
        }
        if self.shared_state.privacy != old.privacy {
            self.push_event(GroupEvent::PrivacyState {
                privacy: self.shared_state.privacy,
            });
        }
        if self.shared_state.password != old.password {
            self.push_event(GroupEvent::Password {
                password: self.shared_state.password.clone(),
            });
        }
    }

    /// Delete a peer that shipped unverifiable state, then try to heal
    /// from another peer if one exists.
    pub(crate) fn bad_peer_action(&mut self, ctx: &mut Ctx<'_>, index: usize, reason: &[u8]) {
        self.peer_delete(index, reason);

        if !self.has_shared_state() {
            self.connection_state = ConnectionState::Disconnected;
            return;
        }
        if self.peer_count() > 1 {
            let _ = self.send_sync_request(ctx, 1, 0);
        }
    }

    // --- moderator list ---

    /// Handle an inbound MOD_LIST packet.
    pub(crate) fn handle_mod_list(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        if self.self_peer().role == Role::Founder {
            return Ok(());
        }

        let outcome = (|| -> Result<Vec<SigPublicKey>> {
            let mods = records::unpack_mod_list(&mut Reader::new(body))?;
            let hash = crate::moderation::mod_list_hash(&mods);
            if hash != self.shared_state.mod_list_hash {
                return Err(GroupError::BadSignature);
            }
            Ok(mods)
        })();

        match outcome {
            Ok(mods) => {
                self.mod_list = mods;
                self.validate_self_role();
                Ok(())
            }
            Err(err) => {
                tracing::warn!(group = self.group_number, %err, "mod list hash mismatch");
                self.bad_peer_action(ctx, index, b"BAD MLIST");
                Err(err)
            }
        }
    }

    // --- sanctions ---

    /// Handle an inbound SANCTIONS_LIST packet.
    pub(crate) fn handle_sanctions_list(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        let outcome = (|| {
            let (sanctions, creds) = records::unpack_sanctions_packet(body)?;
            crate::moderation::verify_sanctions_list(
                &sanctions,
                &creds,
                &self.mod_list,
                &self.shared_state.founder.sig,
            )?;
            Ok::<_, GroupError>((sanctions, creds))
        })();

        match outcome {
            Ok((sanctions, creds)) => {
                if creds.version < self.sanctions_creds.version {
                    return Ok(());
                }
                self.sanctions = sanctions;
                self.sanctions_creds = creds;
                self.validate_self_role();
                Ok(())
            }
            Err(err) => {
                // A stale source cannot regress us; ignore silently when
                // our replica is already authenticated.
                if self.sanctions_creds.version > 0 {
                    return Ok(());
                }
                tracing::warn!(group = self.group_number, %err, "bad sanctions list from peer");
                self.bad_peer_action(ctx, index, b"BAD SCREDS");
                Err(err)
            }
        }
    }

    /// Push the current sanctions list to every confirmed peer.
    pub(crate) fn broadcast_sanctions_list(&mut self, ctx: &mut Ctx<'_>) {
        let body = self.sanctions_packet_body();
        self.send_lossless_all(ctx, InnerKind::SanctionsList, &body);
    }

    // --- topic ---

    /// Install a new topic locally: bump the version, record ourselves
    /// as setter, and sign. No broadcast.
    pub(crate) fn set_topic_local(&mut self, topic: &[u8]) -> Result<()> {
        if topic.len() > palaver_types::MAX_TOPIC_SIZE {
            return Err(GroupError::Malformed("topic too long".into()));
        }
        if !self.self_peer().role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }

        let version = self
            .topic_info
            .version
            .checked_add(1)
            .ok_or(GroupError::VersionStale)?;

        self.topic_info = TopicInfo {
            topic: topic.to_vec(),
            setter_sig_pk: self.self_keys.public.sig,
            version,
        };
        self.topic_sig = self
            .self_keys
            .sig_secret
            .sign(&records::topic_signable(&self.topic_info))
            .to_bytes();
        Ok(())
    }

    /// Set and broadcast a new topic. Moderator or founder only.
    pub fn set_topic(&mut self, ctx: &mut Ctx<'_>, topic: &[u8]) -> Result<()> {
        self.set_topic_local(topic)?;
        let body = self.topic_packet_body();
        self.send_lossless_all(ctx, InnerKind::Topic, &body);
        Ok(())
    }

    /// Re-sign the topic as ourselves if `removed_sig_pk` set it. Keeps
    /// the topic verifiable after a moderator demotion; the version
    /// advances as with any topic change.
    fn update_topic_after_removal(
        &mut self,
        ctx: &mut Ctx<'_>,
        removed_sig_pk: &SigPublicKey,
    ) -> Result<()> {
        if &self.topic_info.setter_sig_pk != removed_sig_pk {
            return Ok(());
        }
        let topic = self.topic_info.topic.clone();
        self.set_topic(ctx, &topic)
    }

    /// Handle an inbound TOPIC packet.
    pub(crate) fn handle_topic(
        &mut self,
        _ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(body);
        let signature: [u8; 64] = r.take_array()?;
        let packed = r.take_rest();
        let info = records::unpack_topic_info(&mut Reader::new(packed))?;

        if !self.is_privileged_sig_pk(&info.setter_sig_pk) {
            return Err(GroupError::RoleInsufficient);
        }
        ed25519::verify_detached(
            &info.setter_sig_pk,
            &records::topic_signable(&info),
            &signature,
        )?;

        if info.version < self.topic_info.version {
            return Ok(());
        }

        let changed = info.topic != self.topic_info.topic;
        self.topic_info = info;
        self.topic_sig = signature;

        if changed && self.connection_state == ConnectionState::Connected {
            let peer_id = self.peer_id_at(index).unwrap_or(0);
            let topic = self.topic_info.topic.clone();
            self.push_event(GroupEvent::TopicChange { peer_id, topic });
        }
        Ok(())
    }

    // --- founder and moderator operations ---

    /// Add or remove the peer at `index` from the moderator list,
    /// re-sign the shared state, and distribute everything in order:
    /// SET_MOD broadcast, new mod list, new shared state. Founder only.
    pub(crate) fn founder_set_moderator(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        add: bool,
    ) -> Result<()> {
        if self.self_peer().role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        let target_sig_pk = self.conn(index).ok_or(GroupError::PeerUnknown)?.sig_pk;

        if add {
            if self.mod_list.len() >= palaver_types::MAX_MODERATORS {
                self.prune_mod_list();
            }
            if self.mod_list.iter().any(|k| *k == target_sig_pk) {
                return Err(GroupError::PeerDuplicate);
            }
            self.mod_list.push(target_sig_pk);
        } else {
            let pos = self
                .mod_list
                .iter()
                .position(|k| *k == target_sig_pk)
                .ok_or(GroupError::PeerUnknown)?;
            self.mod_list.remove(pos);

            let now = ctx.now();
            self.reissue_sanctions_of(&target_sig_pk, now)?;
            self.update_topic_after_removal(ctx, &target_sig_pk)?;
        }

        let old_hash = self.shared_state.mod_list_hash;
        self.shared_state.mod_list_hash = crate::moderation::mod_list_hash(&self.mod_list);
        if let Err(err) = self.sign_shared_state() {
            self.shared_state.mod_list_hash = old_hash;
            return Err(err);
        }

        // SET_MOD first so receivers learn the role change, then the
        // list that proves it, then the state that pins the list.
        let mut bc = Writer::new();
        bc.put_u8(u8::from(add));
        bc.put(&target_sig_pk);
        self.send_broadcast(ctx, BroadcastKind::SetMod, &bc.into_vec())?;

        let mods = self.mod_list_packet_body();
        self.send_lossless_all(ctx, InnerKind::ModList, &mods);
        self.broadcast_shared_state(ctx);

        if !add {
            self.broadcast_sanctions_list(ctx);
        }

        if let Some(entry) = self.entries.get_mut(index) {
            entry.peer.role = if add { Role::Moderator } else { Role::User };
        }
        Ok(())
    }

    /// Add or remove the peer at `index` as observer, updating the
    /// sanctions list and broadcasting SET_OBSERVER with the fresh
    /// credentials. Moderator or founder only.
    pub(crate) fn set_observer(&mut self, ctx: &mut Ctx<'_>, index: usize, add: bool) -> Result<()> {
        if !self.self_peer().role.is_privileged() {
            return Err(GroupError::RoleInsufficient);
        }
        let target = self.conn(index).ok_or(GroupError::PeerUnknown)?;
        let target_enc_pk = target.public_key;
        let target_sig_pk = target.sig_pk;
        let now = ctx.now();

        let mut bc = Writer::new();
        bc.put_u8(u8::from(add));
        bc.put(&target_enc_pk);
        bc.put(&target_sig_pk);

        if add {
            let sanction = self.make_sanction(
                SanctionKind::Observer {
                    public_key: target_enc_pk,
                },
                now,
            )?;
            self.sanctions.push(sanction.clone());
            self.regenerate_sanctions_creds(true)?;

            records::pack_sanction(&mut bc, &sanction);
            records::pack_creds(&mut bc, &self.sanctions_creds);
        } else {
            let before = self.sanctions.len();
            self.sanctions.retain(|s| {
                !matches!(&s.kind, SanctionKind::Observer { public_key } if *public_key == target_enc_pk)
            });
            if self.sanctions.len() == before {
                return Err(GroupError::PeerUnknown);
            }
            self.regenerate_sanctions_creds(true)?;
            records::pack_creds(&mut bc, &self.sanctions_creds);
        }

        self.send_broadcast(ctx, BroadcastKind::SetObserver, &bc.into_vec())?;

        if let Some(entry) = self.entries.get_mut(index) {
            entry.peer.role = if add { Role::Observer } else { Role::User };
        }
        Ok(())
    }

    /// Change a peer's role through the appropriate moderation path.
    pub fn set_peer_role(&mut self, ctx: &mut Ctx<'_>, index: usize, role: Role) -> Result<()> {
        if matches!(role, Role::Founder | Role::Invalid) {
            return Err(GroupError::Malformed("role not assignable".into()));
        }
        if index == 0 {
            return Err(GroupError::PeerUnknown);
        }
        let current = self
            .entries
            .get(index)
            .ok_or(GroupError::PeerUnknown)?
            .peer
            .role;
        let self_role = self.self_peer().role;

        if !self_role.is_privileged() || current == Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        // Only the founder touches the moderator list.
        if self_role != Role::Founder && (role == Role::Moderator || current == Role::Moderator) {
            return Err(GroupError::RoleInsufficient);
        }
        if current == role {
            return Err(GroupError::Malformed("role unchanged".into()));
        }

        let event = match role {
            Role::Moderator => ModerationEvent::Moderator,
            Role::Observer => ModerationEvent::Observer,
            _ => ModerationEvent::User,
        };

        // The old role is removed before the new one is applied.
        match current {
            Role::Moderator => {
                self.founder_set_moderator(ctx, index, false)?;
                if role == Role::Observer {
                    self.set_observer(ctx, index, true)?;
                }
            }
            Role::Observer => {
                self.set_observer(ctx, index, false)?;
                if role == Role::Moderator {
                    self.founder_set_moderator(ctx, index, true)?;
                }
            }
            _ => match role {
                Role::Moderator => self.founder_set_moderator(ctx, index, true)?,
                Role::Observer => self.set_observer(ctx, index, true)?,
                _ => return Err(GroupError::Malformed("role unchanged".into())),
            },
        }

        let src = self.self_peer().peer_id;
        let target = self.peer_id_at(index).unwrap_or(0);
        self.push_event(GroupEvent::Moderation {
            src_peer_id: src,
            target_peer_id: target,
            event,
        });
        if let Some(entry) = self.entries.get_mut(index) {
            entry.peer.role = role;
        }
        Ok(())
    }

    /// Founder: set or clear the group password and distribute the new
    /// shared state.
    pub fn founder_set_password(&mut self, ctx: &mut Ctx<'_>, password: &[u8]) -> Result<()> {
        if self.self_peer().role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        if password.len() > palaver_types::MAX_PASSWORD_SIZE {
            return Err(GroupError::Malformed("password too long".into()));
        }

        let old = std::mem::take(&mut self.shared_state.password);
        self.shared_state.password = password.to_vec();
        if let Err(err) = self.sign_shared_state() {
            self.shared_state.password = old;
            return Err(err);
        }
        self.broadcast_shared_state(ctx);
        Ok(())
    }

    /// Founder: change the privacy state and distribute the new shared
    /// state. Going private also drops the group from discovery; the
    /// session handles that through the emitted event.
    pub fn founder_set_privacy(&mut self, ctx: &mut Ctx<'_>, privacy: Privacy) -> Result<()> {
        if self.self_peer().role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        if self.shared_state.privacy == privacy {
            return Ok(());
        }

        let old = self.shared_state.privacy;
        self.shared_state.privacy = privacy;
        if let Err(err) = self.sign_shared_state() {
            self.shared_state.privacy = old;
            return Err(err);
        }
        self.push_event(GroupEvent::PrivacyState { privacy });
        self.broadcast_shared_state(ctx);
        Ok(())
    }

    /// Founder: change the peer limit and distribute the new shared
    /// state.
    pub fn founder_set_max_peers(&mut self, ctx: &mut Ctx<'_>, max_peers: u32) -> Result<()> {
        if self.self_peer().role != Role::Founder {
            return Err(GroupError::RoleInsufficient);
        }
        if max_peers == 0 {
            return Err(GroupError::Malformed("zero peer limit".into()));
        }
        if max_peers == self.shared_state.max_peers {
            return Ok(());
        }

        let old = self.shared_state.max_peers;
        self.shared_state.max_peers = max_peers;
        if let Err(err) = self.sign_shared_state() {
            self.shared_state.max_peers = old;
            return Err(err);
        }
        self.broadcast_shared_state(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation;
    use palaver_types::identity::SelfPeerInfo;
    use palaver_types::peer::PeerStatus;

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
    fn creation_invariants() {
        let chat = founder_chat();
        assert_eq!(chat.shared_state.version, 1);
        assert!(chat.mod_list.is_empty());
        assert_eq!(chat.topic_info.topic, b" ");
        assert_eq!(chat.topic_info.version, 1);
        assert_eq!(chat.self_peer().role, Role::Founder);
        assert_eq!(chat.peer_count(), 1);
    }

    #[test]
    fn created_state_verifies_under_chat_id() {
        let chat = founder_chat();
        ed25519::verify_detached(
            &chat.chat_id,
            &records::shared_state_signable(&chat.shared_state),
            &chat.shared_state_sig,
        )
        .expect("state signature");
        assert_eq!(
            chat.shared_state.mod_list_hash,
            moderation::mod_list_hash(&chat.mod_list)
        );
    }

    #[test]
    fn topic_signature_verifies_under_setter() {
        let chat = founder_chat();
        ed25519::verify_detached(
            &chat.topic_info.setter_sig_pk,
            &records::topic_signable(&chat.topic_info),
            &chat.topic_sig,
        )
        .expect("topic signature");
        assert_eq!(chat.topic_info.setter_sig_pk, chat.self_keys.public.sig);
    }

    #[test]
    fn sign_bumps_version_and_rejects_non_founder() {
        let mut chat = founder_chat();
        let v = chat.shared_state.version;
        chat.sign_shared_state().expect("sign");
        assert_eq!(chat.shared_state.version, v + 1);

        chat.self_peer_mut().role = Role::User;
        assert!(matches!(
            chat.sign_shared_state(),
            Err(GroupError::RoleInsufficient)
        ));
    }

    #[test]
    fn topic_version_saturates_with_error() {
        let mut chat = founder_chat();
        chat.topic_info.version = u32::MAX;
        assert!(matches!(
            chat.set_topic_local(b"x"),
            Err(GroupError::VersionStale)
        ));
        assert_eq!(chat.topic_info.version, u32::MAX);
    }

    #[test]
    fn observer_cannot_set_topic() {
        let mut chat = founder_chat();
        chat.self_peer_mut().role = Role::Observer;
        assert!(matches!(
            chat.set_topic_local(b"nope"),
            Err(GroupError::RoleInsufficient)
        ));
    }
}
