//! The per-group chat state machine.
//!
//! A [`Chat`] owns its peer table (self is always slot 0), the four
//! replicated state artifacts, the reconnect and invite rings, and the
//! per-tick rate-limiter bookkeeping. The surrounding modules implement
//! its behavior: membership, handshake, transport, broadcasts,
//! replication, and sync.

use palaver_crypto::ed25519;
use palaver_crypto::identity::ExtendedKeyPair;
use palaver_types::identity::SelfPeerInfo;
use palaver_types::peer::{ConnectionState, JoinType, PeerStatus, Privacy, Role};
use palaver_types::state::{Sanction, SanctionsCreds, SharedState, TopicInfo};
use palaver_types::{
    ChatId, ChatIdHash, FriendId, PeerId, PublicKey, SigPublicKey, SignatureBytes,
    MAX_CONFIRMED_PEERS, MAX_SAVED_INVITES,
};
use palaver_wire::jenkins_hash;

use crate::events::GroupEvent;
use crate::overlay::Ctx;
use crate::peer::{Peer, PeerEntry};
use crate::timing;
use crate::{GroupError, Result};

/// Default peer cap for a new group, bounded by what a sync response can
/// carry in one packet.
pub const DEFAULT_MAX_PEERS: u32 = 512;

/// One group chat replica.
pub struct Chat {
    /// Index in the session's chat table.
    pub group_number: u32,
    /// The chat's public signing key; identifies the group.
    pub chat_id: ChatId,
    /// The chat's derived encryption identity.
    pub chat_enc_pk: PublicKey,
    /// The chat's signing secret. Founder only.
    pub chat_sig_secret: Option<ed25519::SigningKey>,
    /// Routing hash of the chat id.
    pub chat_id_hash: ChatIdHash,

    /// Our extended identity within this group.
    pub self_keys: ExtendedKeyPair,
    /// Routing hash of our encryption public key.
    pub self_pk_hash: ChatIdHash,

    pub connection_state: ConnectionState,
    pub join_type: JoinType,

    /// Peer table; slot 0 is always self.
    pub(crate) entries: Vec<PeerEntry>,

    /// Founder-signed shared state; version 0 until synced or created.
    pub shared_state: SharedState,
    pub shared_state_sig: SignatureBytes,

    /// Moderator signing keys, order preserved.
    pub mod_list: Vec<SigPublicKey>,
    /// Sanctions list with its credentials.
    pub sanctions: Vec<Sanction>,
    pub sanctions_creds: SanctionsCreds,

    /// Topic and its detached signature.
    pub topic_info: TopicInfo,
    pub topic_sig: SignatureBytes,

    /// Ring of identities that completed a handshake with us; grants
    /// reconnection to non-public groups.
    pub(crate) confirmed_peers: Vec<PublicKey>,
    pub(crate) confirmed_peers_index: usize,

    /// Ring of friends we invited; gates GROUP_INVITE_ACCEPTED.
    pub(crate) saved_invites: Vec<FriendId>,
    pub(crate) saved_invites_index: usize,

    pub(crate) last_sent_ping_time: u64,
    pub(crate) last_join_attempt: u64,
    pub(crate) last_self_announce: u64,

    /// New-connection rate limiter.
    pub(crate) connection_o_meter: u32,
    pub(crate) connection_cooldown_timer: u64,
    pub(crate) block_handshakes: bool,

    /// Events produced by handlers, drained by the session.
    pub(crate) events: Vec<GroupEvent>,
}

fn placeholder_shared_state() -> SharedState {
    SharedState {
        founder: Default::default(),
        max_peers: 0,
        group_name: Vec::new(),
        privacy: Privacy::Private,
        password: Vec::new(),
        mod_list_hash: [0u8; 32],
        version: 0,
    }
}

impl Chat {
    /// Common construction: a chat with self as the only peer.
    fn empty(group_number: u32, self_info: &SelfPeerInfo, self_role: Role, now: u64) -> Self {
        let self_keys = ExtendedKeyPair::generate();
        let self_pk_hash = jenkins_hash(&self_keys.public.enc);

        let self_peer = Peer {
            nick: self_info.nick.clone(),
            status: self_info.status,
            role: self_role,
            peer_id: 0,
            ignore: false,
        };

        Self {
            group_number,
            chat_id: [0u8; 32],
            chat_enc_pk: [0u8; 32],
            chat_sig_secret: None,
            chat_id_hash: 0,
            self_keys,
            self_pk_hash,
            connection_state: ConnectionState::Disconnected,
            join_type: JoinType::Private,
            entries: vec![PeerEntry {
                peer: self_peer,
                conn: None,
            }],
            shared_state: placeholder_shared_state(),
            shared_state_sig: [0u8; 64],
            mod_list: Vec::new(),
            sanctions: Vec::new(),
            sanctions_creds: SanctionsCreds::default(),
            topic_info: TopicInfo {
                topic: Vec::new(),
                setter_sig_pk: [0u8; 32],
                version: 0,
            },
            topic_sig: [0u8; 64],
            confirmed_peers: Vec::new(),
            confirmed_peers_index: 0,
            saved_invites: Vec::new(),
            saved_invites_index: 0,
            last_sent_ping_time: now,
            last_join_attempt: 0,
            last_self_announce: 0,
            connection_o_meter: 0,
            connection_cooldown_timer: 0,
            block_handshakes: false,
            events: Vec::new(),
        }
    }

    /// Create a brand-new group with ourselves as founder. Signs shared
    /// state version 1 and sets the initial topic.
    pub fn create(
        group_number: u32,
        privacy: Privacy,
        group_name: &[u8],
        self_info: &SelfPeerInfo,
        now: u64,
    ) -> Result<Self> {
        if group_name.is_empty() || group_name.len() > palaver_types::MAX_GROUP_NAME_SIZE {
            return Err(GroupError::Malformed("bad group name length".into()));
        }
        if !self_info.is_valid() {
            return Err(GroupError::Malformed("bad self info".into()));
        }

        let mut chat = Self::empty(group_number, self_info, Role::Founder, now);

        let chat_keys = ed25519::KeyPair::generate();
        chat.chat_id = chat_keys.verifying_key.to_bytes();
        chat.chat_enc_pk = chat_keys.verifying_key.to_encryption_key();
        chat.chat_sig_secret = Some(chat_keys.signing_key);
        chat.chat_id_hash = jenkins_hash(&chat.chat_id);

        chat.shared_state = SharedState {
            founder: chat.self_keys.public,
            max_peers: DEFAULT_MAX_PEERS,
            group_name: group_name.to_vec(),
            privacy,
            password: Vec::new(),
            mod_list_hash: crate::moderation::mod_list_hash(&[]),
            version: 0,
        };
        chat.sign_shared_state()?;
        chat.init_sanctions_creds(now)?;
        chat.set_topic_local(b" ")?;

        chat.connection_state = ConnectionState::Connected;
        tracing::info!(
            group = group_number,
            chat = %palaver_types::fmt_key(&chat.chat_id),
            "created group"
        );
        Ok(chat)
    }

    /// Create an empty replica for joining an existing group by chat id.
    pub fn join(
        group_number: u32,
        chat_id: ChatId,
        password: &[u8],
        self_info: &SelfPeerInfo,
        join_type: JoinType,
        now: u64,
    ) -> Result<Self> {
        if !self_info.is_valid() {
            return Err(GroupError::Malformed("bad self info".into()));
        }
        if password.len() > palaver_types::MAX_PASSWORD_SIZE {
            return Err(GroupError::Malformed("password too long".into()));
        }

        let mut chat = Self::empty(group_number, self_info, Role::User, now);
        let expanded = palaver_crypto::identity::expand_chat_id(&chat_id)?;
        chat.chat_id = chat_id;
        chat.chat_enc_pk = expanded.enc;
        chat.chat_id_hash = jenkins_hash(&chat_id);
        chat.join_type = join_type;
        chat.connection_state = ConnectionState::Connecting;
        chat.last_join_attempt = now;
        chat.shared_state.password = password.to_vec();
        Ok(chat)
    }

    // --- small accessors used across modules ---

    /// Number of peers including self.
    pub fn peer_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of peers whose connection is confirmed, counting self.
    pub fn confirmed_count(&self) -> usize {
        1 + self
            .entries
            .iter()
            .skip(1)
            .filter(|e| e.conn.as_ref().is_some_and(|c| c.confirmed))
            .count()
    }

    /// Our own peer record.
    pub fn self_peer(&self) -> &Peer {
        &self.entries[0].peer
    }

    /// Our own peer record, mutably.
    pub fn self_peer_mut(&mut self) -> &mut Peer {
        &mut self.entries[0].peer
    }

    /// True if the shared state says this group is public.
    pub fn is_public(&self) -> bool {
        self.shared_state.privacy == Privacy::Public
    }

    /// True once we have a synced (or self-created) shared state.
    pub fn has_shared_state(&self) -> bool {
        self.shared_state.version > 0
    }

    /// Record an event for the host.
    pub(crate) fn push_event(&mut self, event: GroupEvent) {
        self.events.push(event);
    }

    /// Record a peer identity in the reconnect ring.
    pub(crate) fn remember_confirmed_peer(&mut self, pk: PublicKey) {
        if self.confirmed_peers.iter().any(|p| *p == pk) {
            return;
        }
        if self.confirmed_peers.len() < MAX_CONFIRMED_PEERS {
            self.confirmed_peers.push(pk);
        } else {
            self.confirmed_peers[self.confirmed_peers_index % MAX_CONFIRMED_PEERS] = pk;
        }
        self.confirmed_peers_index = (self.confirmed_peers_index + 1) % MAX_CONFIRMED_PEERS;
    }

    /// True if this identity completed a handshake with us before.
    pub fn is_peer_remembered(&self, pk: &PublicKey) -> bool {
        self.confirmed_peers.iter().any(|p| p == pk)
    }

    /// Record a friend we invited so their acceptance can be validated.
    pub(crate) fn remember_invited_friend(&mut self, friend: FriendId) {
        if self.saved_invites.len() < MAX_SAVED_INVITES {
            self.saved_invites.push(friend);
        } else {
            self.saved_invites[self.saved_invites_index % MAX_SAVED_INVITES] = friend;
        }
        self.saved_invites_index = (self.saved_invites_index + 1) % MAX_SAVED_INVITES;
    }

    /// True if we invited this friend.
    pub fn friend_was_invited(&self, friend: FriendId) -> bool {
        self.saved_invites.iter().any(|f| *f == friend)
    }

    /// Mark ourselves connected (first sync response processed).
    pub(crate) fn set_self_connected(&mut self, now: u64) {
        if self.connection_state != ConnectionState::Connected {
            tracing::info!(group = self.group_number, "connected to group");
        }
        self.connection_state = ConnectionState::Connected;
        self.last_sent_ping_time = now;
    }

    /// Look up a peer's id by table index.
    pub fn peer_id_at(&self, index: usize) -> Option<PeerId> {
        self.entries.get(index).map(|e| e.peer.peer_id)
    }

    // --- per-tick driving ---

    /// Run one tick of this chat's state machine.
    pub fn do_tick(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now();
        self.send_pending_handshakes(ctx);

        match self.connection_state {
            ConnectionState::Connected => {
                self.ping_group(ctx);
                self.do_peer_connections(ctx);
                self.do_new_connection_cooldown(now);
            }
            ConnectionState::Connecting => {
                if palaver_types::time::is_timeout(
                    now,
                    self.last_join_attempt,
                    timing::JOIN_ATTEMPT_INTERVAL,
                ) {
                    self.connection_state = ConnectionState::Disconnected;
                    tracing::debug!(group = self.group_number, "join attempt timed out");
                }
            }
            ConnectionState::Disconnected => {
                if self.peer_count() > 1
                    && palaver_types::time::is_timeout(
                        now,
                        self.last_join_attempt,
                        timing::JOIN_ATTEMPT_INTERVAL,
                    )
                {
                    self.last_join_attempt = now;
                    self.connection_state = ConnectionState::Connecting;
                    for entry in self.entries.iter_mut().skip(1) {
                        if let Some(conn) = entry.conn.as_mut() {
                            if !conn.handshaked && conn.pending_handshake == 0 {
                                conn.pending_handshake = now + timing::HANDSHAKE_SENDING_TIMEOUT;
                            }
                        }
                    }
                    tracing::debug!(group = self.group_number, "rejoining group");
                }
            }
            ConnectionState::None
            | ConnectionState::Failed
            | ConnectionState::Closing => {}
        }
    }

    /// Decay the new-connection rate limiter once per second.
    pub(crate) fn do_new_connection_cooldown(&mut self, now: u64) {
        if self.connection_o_meter == 0 {
            return;
        }
        if self.connection_cooldown_timer < now {
            self.connection_cooldown_timer = now;
            self.connection_o_meter -= 1;
            if self.connection_o_meter == 0 {
                self.block_handshakes = false;
                tracing::debug!(group = self.group_number, "handshake rate limiter cleared");
            }
        }
    }

    /// Current self status, for tests and accessors.
    pub fn self_status(&self) -> PeerStatus {
        self.entries[0].peer.status
    }
}
