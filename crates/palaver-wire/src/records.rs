//! Canonical big-endian packing of the protocol's fixed-layout records.
//!
//! Pack and unpack are exact inverses for every record; unpack never
//! reads past the declared lengths and fails with
//! [`WireError::MalformedRecord`] on any value violation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use palaver_types::network::{IpPort, RelayNode, SavedPeer};
use palaver_types::peer::{PeerStatus, Privacy, Role};
use palaver_types::state::{Sanction, SanctionKind, SanctionsCreds, SharedState, TopicInfo};
use palaver_types::{
    identity::ExtendedPublicKey, SigPublicKey, MAX_GROUP_NAME_SIZE, MAX_MODERATORS, MAX_NICK_SIZE,
    MAX_PASSWORD_SIZE, MAX_TOPIC_SIZE,
};

use crate::bytes::{Reader, Writer};
use crate::{Result, WireError};

/// Packed size of a peer-info record.
pub const PACKED_PEER_INFO_SIZE: usize = 2 + MAX_NICK_SIZE + 1 + 1;

/// Packed size of the shared state.
pub const PACKED_SHARED_STATE_SIZE: usize =
    64 + 4 + 2 + MAX_GROUP_NAME_SIZE + 1 + 2 + MAX_PASSWORD_SIZE + 32 + 4;

/// Packed size of the sanctions credentials.
pub const PACKED_CREDS_SIZE: usize = 4 + 32 + 32 + 64;

/// Peer info as carried in PEER_INFO_RESPONSE packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub nick: Vec<u8>,
    pub status: PeerStatus,
    pub role: Role,
}

// --- addresses ---

/// IP family tags on the wire.
const AF_INET: u8 = 4;
const AF_INET6: u8 = 6;

/// Pack an ip+port pair.
pub fn pack_ip_port(w: &mut Writer, ipp: &IpPort) {
    match ipp.ip {
        IpAddr::V4(v4) => {
            w.put_u8(AF_INET);
            w.put(&v4.octets());
        }
        IpAddr::V6(v6) => {
            w.put_u8(AF_INET6);
            w.put(&v6.octets());
        }
    }
    w.put_u16(ipp.port);
}

/// Unpack an ip+port pair.
///
/// # Errors
///
/// `MalformedRecord` on an unknown family tag.
pub fn unpack_ip_port(r: &mut Reader<'_>) -> Result<IpPort> {
    let ip = match r.take_u8()? {
        AF_INET => IpAddr::V4(Ipv4Addr::from(r.take_array::<4>()?)),
        AF_INET6 => IpAddr::V6(Ipv6Addr::from(r.take_array::<16>()?)),
        _ => return Err(WireError::MalformedRecord("bad ip family".into())),
    };
    let port = r.take_u16()?;
    Ok(IpPort::new(ip, port))
}

/// Pack relay nodes back to back, no count prefix.
pub fn pack_relay_nodes(w: &mut Writer, nodes: &[RelayNode]) {
    for node in nodes {
        pack_ip_port(w, &node.ip_port);
        w.put(&node.public_key);
    }
}

/// Unpack up to `max` relay nodes, stopping at end of input.
///
/// # Errors
///
/// Propagates truncation or bad-family errors from a partially present
/// node.
pub fn unpack_relay_nodes(r: &mut Reader<'_>, max: usize) -> Result<Vec<RelayNode>> {
    let mut nodes = Vec::new();
    while nodes.len() < max && !r.is_empty() {
        let ip_port = unpack_ip_port(r)?;
        let public_key = r.take_array()?;
        nodes.push(RelayNode {
            public_key,
            ip_port,
        });
    }
    Ok(nodes)
}

/// Pack saved peer addresses: `public_key` then the relay node.
pub fn pack_saved_peers(w: &mut Writer, peers: &[SavedPeer]) {
    for peer in peers {
        w.put(&peer.public_key);
        pack_relay_nodes(w, std::slice::from_ref(&peer.relay));
    }
}

/// Unpack up to `max` saved peer addresses.
///
/// # Errors
///
/// Propagates truncation errors from a partially present entry.
pub fn unpack_saved_peers(r: &mut Reader<'_>, max: usize) -> Result<Vec<SavedPeer>> {
    let mut peers = Vec::new();
    while peers.len() < max && !r.is_empty() {
        let public_key = r.take_array()?;
        let ip_port = unpack_ip_port(r)?;
        let relay_pk = r.take_array()?;
        peers.push(SavedPeer {
            public_key,
            relay: RelayNode {
                public_key: relay_pk,
                ip_port,
            },
        });
    }
    Ok(peers)
}

// --- peer info ---

/// Pack a peer-info record. The nick field is fixed-width.
pub fn pack_peer_info(w: &mut Writer, info: &PeerInfo) {
    let nick_len = info.nick.len().min(MAX_NICK_SIZE);
    w.put_u16(nick_len as u16);
    let mut nick = [0u8; MAX_NICK_SIZE];
    nick[..nick_len].copy_from_slice(&info.nick[..nick_len]);
    w.put(&nick);
    w.put_u8(info.status as u8);
    w.put_u8(info.role as u8);
}

/// Unpack a peer-info record.
///
/// # Errors
///
/// `MalformedRecord` on an invalid status or role byte.
pub fn unpack_peer_info(r: &mut Reader<'_>) -> Result<PeerInfo> {
    let nick_len = (r.take_u16()? as usize).min(MAX_NICK_SIZE);
    let nick_field = r.take(MAX_NICK_SIZE)?;
    let status = PeerStatus::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad status".into()))?;
    let role = Role::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad role".into()))?;
    Ok(PeerInfo {
        nick: nick_field[..nick_len].to_vec(),
        status,
        role,
    })
}

// --- shared state ---

/// Pack the shared state into its fixed canonical layout. This is also
/// the byte string the founder signs.
pub fn pack_shared_state(w: &mut Writer, state: &SharedState) {
    w.put(&state.founder.enc);
    w.put(&state.founder.sig);
    w.put_u32(state.max_peers);

    let name_len = state.group_name.len().min(MAX_GROUP_NAME_SIZE);
    w.put_u16(name_len as u16);
    let mut name = [0u8; MAX_GROUP_NAME_SIZE];
    name[..name_len].copy_from_slice(&state.group_name[..name_len]);
    w.put(&name);

    w.put_u8(state.privacy as u8);

    let pass_len = state.password.len().min(MAX_PASSWORD_SIZE);
    w.put_u16(pass_len as u16);
    let mut password = [0u8; MAX_PASSWORD_SIZE];
    password[..pass_len].copy_from_slice(&state.password[..pass_len]);
    w.put(&password);

    w.put(&state.mod_list_hash);
    w.put_u32(state.version);
}

/// The canonical signable encoding of a shared state.
pub fn shared_state_signable(state: &SharedState) -> Vec<u8> {
    let mut w = Writer::with_capacity(PACKED_SHARED_STATE_SIZE);
    pack_shared_state(&mut w, state);
    w.into_vec()
}

/// Unpack a shared state.
///
/// # Errors
///
/// `MalformedRecord` on a bad privacy byte or an empty group name.
pub fn unpack_shared_state(r: &mut Reader<'_>) -> Result<SharedState> {
    let enc = r.take_array()?;
    let sig = r.take_array()?;
    let max_peers = r.take_u32()?;

    let name_len = (r.take_u16()? as usize).min(MAX_GROUP_NAME_SIZE);
    let name_field = r.take(MAX_GROUP_NAME_SIZE)?;
    if name_len == 0 {
        return Err(WireError::MalformedRecord("empty group name".into()));
    }

    let privacy = Privacy::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad privacy state".into()))?;

    let pass_len = (r.take_u16()? as usize).min(MAX_PASSWORD_SIZE);
    let pass_field = r.take(MAX_PASSWORD_SIZE)?;

    let mod_list_hash = r.take_array()?;
    let version = r.take_u32()?;

    Ok(SharedState {
        founder: ExtendedPublicKey::new(enc, sig),
        max_peers,
        group_name: name_field[..name_len].to_vec(),
        privacy,
        password: pass_field[..pass_len].to_vec(),
        mod_list_hash,
        version,
    })
}

// --- topic ---

/// Pack topic info. This is also the byte string the setter signs.
pub fn pack_topic_info(w: &mut Writer, info: &TopicInfo) {
    let len = info.topic.len().min(MAX_TOPIC_SIZE);
    w.put_u16(len as u16);
    w.put(&info.topic[..len]);
    w.put(&info.setter_sig_pk);
    w.put_u32(info.version);
}

/// The canonical signable encoding of a topic.
pub fn topic_signable(info: &TopicInfo) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + info.topic.len() + 32 + 4);
    pack_topic_info(&mut w, info);
    w.into_vec()
}

/// Unpack topic info.
///
/// # Errors
///
/// `ShortBuffer` if the declared topic length overruns the input.
pub fn unpack_topic_info(r: &mut Reader<'_>) -> Result<TopicInfo> {
    let len = (r.take_u16()? as usize).min(MAX_TOPIC_SIZE);
    let topic = r.take(len)?.to_vec();
    let setter_sig_pk = r.take_array()?;
    let version = r.take_u32()?;
    Ok(TopicInfo {
        topic,
        setter_sig_pk,
        version,
    })
}

// --- moderator list ---

/// Pack the moderator list: a count followed by the signing keys.
pub fn pack_mod_list(w: &mut Writer, mods: &[SigPublicKey]) {
    w.put_u16(mods.len() as u16);
    for key in mods {
        w.put(key);
    }
}

/// The byte string hashed into `shared_state.mod_list_hash`: the keys
/// alone, in list order.
pub fn mod_list_hashable(mods: &[SigPublicKey]) -> Vec<u8> {
    let mut w = Writer::with_capacity(mods.len() * 32);
    for key in mods {
        w.put(key);
    }
    w.into_vec()
}

/// Unpack a moderator list.
///
/// # Errors
///
/// `MalformedRecord` if the count exceeds the moderator capacity.
pub fn unpack_mod_list(r: &mut Reader<'_>) -> Result<Vec<SigPublicKey>> {
    let count = r.take_u16()? as usize;
    if count > MAX_MODERATORS {
        return Err(WireError::MalformedRecord("mod list too long".into()));
    }
    let mut mods = Vec::with_capacity(count);
    for _ in 0..count {
        mods.push(r.take_array()?);
    }
    Ok(mods)
}

// --- sanctions ---

/// Sanction target tags on the wire.
const SANCTION_OBSERVER: u8 = 0;
const SANCTION_BAN: u8 = 1;

fn pack_sanction_body(w: &mut Writer, sanction: &Sanction) {
    w.put_u8(sanction.kind.tag());
    w.put(&sanction.issuer_sig_pk);
    w.put_u64(sanction.timestamp);
    match &sanction.kind {
        SanctionKind::Observer { public_key } => w.put(public_key),
        SanctionKind::Ban { ip_port, ban_id } => {
            pack_ip_port(w, ip_port);
            w.put_u32(*ban_id);
        }
    }
}

/// The byte string an issuer signs for a sanction entry.
pub fn sanction_signable(sanction: &Sanction) -> Vec<u8> {
    let mut w = Writer::new();
    pack_sanction_body(&mut w, sanction);
    w.into_vec()
}

/// Pack a sanction entry including its signature.
pub fn pack_sanction(w: &mut Writer, sanction: &Sanction) {
    pack_sanction_body(w, sanction);
    w.put(&sanction.signature);
}

/// Unpack a sanction entry.
///
/// # Errors
///
/// `MalformedRecord` on an unknown target tag.
pub fn unpack_sanction(r: &mut Reader<'_>) -> Result<Sanction> {
    let tag = r.take_u8()?;
    let issuer_sig_pk = r.take_array()?;
    let timestamp = r.take_u64()?;
    let kind = match tag {
        SANCTION_OBSERVER => SanctionKind::Observer {
            public_key: r.take_array()?,
        },
        SANCTION_BAN => {
            let ip_port = unpack_ip_port(r)?;
            let ban_id = r.take_u32()?;
            SanctionKind::Ban { ip_port, ban_id }
        }
        _ => return Err(WireError::MalformedRecord("bad sanction tag".into())),
    };
    let signature = r.take_array()?;
    Ok(Sanction {
        issuer_sig_pk,
        timestamp,
        kind,
        signature,
    })
}

/// Pack the sanctions credentials.
pub fn pack_creds(w: &mut Writer, creds: &SanctionsCreds) {
    w.put_u32(creds.version);
    w.put(&creds.checksum);
    w.put(&creds.sig_pk);
    w.put(&creds.signature);
}

/// The byte string the most recent editor signs: version then checksum.
pub fn creds_signable(version: u32, checksum: &[u8; 32]) -> Vec<u8> {
    let mut w = Writer::with_capacity(4 + 32);
    w.put_u32(version);
    w.put(checksum);
    w.into_vec()
}

/// Unpack the sanctions credentials.
///
/// # Errors
///
/// `ShortBuffer` on truncation.
pub fn unpack_creds(r: &mut Reader<'_>) -> Result<SanctionsCreds> {
    Ok(SanctionsCreds {
        version: r.take_u32()?,
        checksum: r.take_array()?,
        sig_pk: r.take_array()?,
        signature: r.take_array()?,
    })
}

/// The byte string hashed into the credentials checksum: every packed
/// sanction entry in list order.
pub fn sanctions_hashable(sanctions: &[Sanction]) -> Vec<u8> {
    let mut w = Writer::new();
    for sanction in sanctions {
        pack_sanction(&mut w, sanction);
    }
    w.into_vec()
}

/// Pack a full sanctions-list packet body: count, entries, credentials.
pub fn pack_sanctions_packet(sanctions: &[Sanction], creds: &SanctionsCreds) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(sanctions.len() as u32);
    for sanction in sanctions {
        pack_sanction(&mut w, sanction);
    }
    pack_creds(&mut w, creds);
    w.into_vec()
}

/// Unpack a sanctions-list packet body.
///
/// # Errors
///
/// Propagates entry-level errors; `MalformedRecord` if trailing bytes
/// remain after the credentials.
pub fn unpack_sanctions_packet(data: &[u8]) -> Result<(Vec<Sanction>, SanctionsCreds)> {
    let mut r = Reader::new(data);
    let count = r.take_u32()? as usize;
    let mut sanctions = Vec::new();
    for _ in 0..count {
        sanctions.push(unpack_sanction(&mut r)?);
    }
    let creds = unpack_creds(&mut r)?;
    if !r.is_empty() {
        return Err(WireError::MalformedRecord(
            "trailing bytes after sanctions".into(),
        ));
    }
    Ok((sanctions, creds))
}
