//! Outer packet framing: seal and open for the three packet kinds.

use palaver_crypto::{aead, sealed, x25519::X25519StaticSecret};
use palaver_types::network::RelayNode;
use palaver_types::peer::JoinType;
use palaver_types::{ChatIdHash, PublicKey, SigPublicKey, MAX_PACKET_PADDING};

use crate::bytes::{Reader, Writer};
use crate::kinds::{HandshakeRequestType, HandshakeType, InnerKind, PacketKind};
use crate::records;
use crate::{Result, WireError, MAX_PACKET_SIZE};

/// Size of the plaintext outer header preceding the ciphertext.
pub const OUTER_HEADER_SIZE: usize = 1 + 4 + 32 + aead::NONCE_SIZE;

/// Size of the lossless message id field.
pub const MESSAGE_ID_SIZE: usize = 8;

/// The plaintext outer header of any group packet.
#[derive(Clone, Copy, Debug)]
pub struct OuterHeader {
    pub kind: PacketKind,
    pub chat_id_hash: ChatIdHash,
    pub sender_pk: PublicKey,
}

/// Decrypted payload of a lossless or lossy packet.
#[derive(Clone, Debug)]
pub struct DataPayload {
    pub inner: InnerKind,
    /// Zero for lossy packets.
    pub message_id: u64,
    pub body: Vec<u8>,
}

/// Parse the plaintext outer header without touching the ciphertext.
///
/// # Errors
///
/// `ShortBuffer` on truncation, `MalformedRecord` on an unknown kind.
pub fn parse_outer(packet: &[u8]) -> Result<OuterHeader> {
    let mut r = Reader::new(packet);
    let kind = PacketKind::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("unknown packet kind".into()))?;
    let chat_id_hash = r.take_u32()?;
    let sender_pk = r.take_array()?;
    Ok(OuterHeader {
        kind,
        chat_id_hash,
        sender_pk,
    })
}

/// Number of leading zero padding bytes for a body of `body_len` bytes.
fn padding_len(body_len: usize) -> usize {
    (MAX_PACKET_SIZE - body_len) % MAX_PACKET_PADDING
}

/// Seal a lossless or lossy packet under the per-peer session key.
///
/// `message_id` is only framed for [`PacketKind::Lossless`].
///
/// # Errors
///
/// `PayloadTooLarge` if the sealed packet would exceed the maximum
/// packet size.
pub fn seal_data(
    kind: PacketKind,
    chat_id_hash: ChatIdHash,
    sender_pk: &PublicKey,
    session_key: &[u8; 32],
    inner: InnerKind,
    message_id: u64,
    body: &[u8],
) -> Result<Vec<u8>> {
    debug_assert!(kind != PacketKind::Handshake);

    let pad = padding_len(body.len());
    let id_len = if kind == PacketKind::Lossless {
        MESSAGE_ID_SIZE
    } else {
        0
    };

    let total = OUTER_HEADER_SIZE + pad + 1 + id_len + body.len() + aead::TAG_SIZE;
    if total > MAX_PACKET_SIZE {
        return Err(WireError::PayloadTooLarge(body.len()));
    }

    let mut plain = Writer::with_capacity(pad + 1 + id_len + body.len());
    plain.put(&[0u8; MAX_PACKET_PADDING][..pad]);
    plain.put_u8(inner as u8);
    if kind == PacketKind::Lossless {
        plain.put_u64(message_id);
    }
    plain.put(body);

    let nonce = aead::random_nonce();
    let ciphertext = aead::encrypt(session_key, &nonce, &plain.into_vec())?;

    let mut packet = Writer::with_capacity(total);
    packet.put_u8(kind as u8);
    packet.put_u32(chat_id_hash);
    packet.put(sender_pk);
    packet.put(&nonce);
    packet.put(&ciphertext);
    Ok(packet.into_vec())
}

/// Open a lossless or lossy packet sealed with [`seal_data`].
///
/// # Errors
///
/// `DecryptFailed` on authentication failure; `MalformedRecord` when the
/// plaintext is all padding or carries an unknown inner kind.
pub fn open_data(session_key: &[u8; 32], packet: &[u8]) -> Result<DataPayload> {
    let mut r = Reader::new(packet);
    let kind = PacketKind::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("unknown packet kind".into()))?;
    let _chat_id_hash = r.take_u32()?;
    let _sender_pk: PublicKey = r.take_array()?;
    let nonce: [u8; aead::NONCE_SIZE] = r.take_array()?;
    let plain = aead::decrypt(session_key, &nonce, r.take_rest())?;

    // Strip leading zero padding; the inner kind byte is never zero.
    let start = plain.iter().position(|&b| b != 0).ok_or_else(|| {
        WireError::MalformedRecord("payload is all padding".into())
    })?;

    let mut body = Reader::new(&plain[start..]);
    let inner = InnerKind::from_u8(body.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("unknown inner kind".into()))?;
    let message_id = if kind == PacketKind::Lossless {
        body.take_u64()?
    } else {
        0
    };

    Ok(DataPayload {
        inner,
        message_id,
        body: body.take_rest().to_vec(),
    })
}

/// Plaintext contents of a handshake packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeData {
    pub handshake_type: HandshakeType,
    /// Routing hash of the sender's encryption public key.
    pub sender_pk_hash: u32,
    /// Fresh session public key for this connection.
    pub session_pk: PublicKey,
    /// The sender's long-term signing public key.
    pub sig_pk: SigPublicKey,
    pub request: HandshakeRequestType,
    pub join: JoinType,
    /// The sender's current shared-state version.
    pub shared_state_version: u32,
    /// One TCP relay the sender can be reached through.
    pub relay: Option<RelayNode>,
}

/// Seal a handshake packet to the recipient's long-term encryption key.
///
/// # Errors
///
/// Propagates AEAD failures from the sealed-box layer.
pub fn seal_handshake(
    chat_id_hash: ChatIdHash,
    sender_pk: &PublicKey,
    sender_enc_secret: &X25519StaticSecret,
    recipient_pk: &PublicKey,
    data: &HandshakeData,
) -> Result<Vec<u8>> {
    let mut plain = Writer::new();
    plain.put_u8(data.handshake_type as u8);
    plain.put_u32(data.sender_pk_hash);
    plain.put(&data.session_pk);
    plain.put(&data.sig_pk);
    plain.put_u8(data.request as u8);
    plain.put_u8(data.join as u8);
    plain.put_u32(data.shared_state_version);
    match &data.relay {
        Some(relay) => records::pack_relay_nodes(&mut plain, std::slice::from_ref(relay)),
        None => records::pack_relay_nodes(&mut plain, &[]),
    }

    let nonce = aead::random_nonce();
    let ciphertext = sealed::seal(recipient_pk, sender_enc_secret, &nonce, &plain.into_vec())?;

    let mut packet = Writer::new();
    packet.put_u8(PacketKind::Handshake as u8);
    packet.put_u32(chat_id_hash);
    packet.put(sender_pk);
    packet.put(&nonce);
    packet.put(&ciphertext);
    Ok(packet.into_vec())
}

/// Open a handshake packet. Returns the sender's long-term encryption
/// public key (from the outer header) and the decoded contents.
///
/// # Errors
///
/// `DecryptFailed` if the sealed box does not open with our long-term
/// key; `MalformedRecord` on any layout violation.
pub fn open_handshake(
    self_enc_secret: &X25519StaticSecret,
    packet: &[u8],
) -> Result<(PublicKey, HandshakeData)> {
    let mut r = Reader::new(packet);
    let kind = PacketKind::from_u8(r.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("unknown packet kind".into()))?;
    if kind != PacketKind::Handshake {
        return Err(WireError::MalformedRecord("not a handshake packet".into()));
    }
    let _chat_id_hash = r.take_u32()?;
    let sender_pk: PublicKey = r.take_array()?;
    let nonce: [u8; aead::NONCE_SIZE] = r.take_array()?;
    let plain = sealed::open(&sender_pk, self_enc_secret, &nonce, r.take_rest())?;

    let mut p = Reader::new(&plain);
    let handshake_type = HandshakeType::from_u8(p.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad handshake type".into()))?;
    let sender_pk_hash = p.take_u32()?;
    let session_pk: PublicKey = p.take_array()?;
    let sig_pk: SigPublicKey = p.take_array()?;
    let request = HandshakeRequestType::from_u8(p.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad request type".into()))?;
    let join = JoinType::from_u8(p.take_u8()?)
        .ok_or_else(|| WireError::MalformedRecord("bad join type".into()))?;
    let shared_state_version = p.take_u32()?;
    let relays = records::unpack_relay_nodes(&mut p, 1)?;

    Ok((
        sender_pk,
        HandshakeData {
            handshake_type,
            sender_pk_hash,
            session_pk,
            sig_pk,
            request,
            join,
            shared_state_version,
            relay: relays.into_iter().next(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_crypto::x25519::X25519KeyPair;
    use std::net::{IpAddr, Ipv4Addr};

    fn session_key() -> [u8; 32] {
        [0x11; 32]
    }

    #[test]
    fn lossless_round_trip() {
        let packet = seal_data(
            PacketKind::Lossless,
            0xDEADBEEF,
            &[5u8; 32],
            &session_key(),
            InnerKind::Broadcast,
            42,
            b"hello",
        )
        .expect("seal");

        let header = parse_outer(&packet).expect("header");
        assert_eq!(header.kind, PacketKind::Lossless);
        assert_eq!(header.chat_id_hash, 0xDEADBEEF);
        assert_eq!(header.sender_pk, [5u8; 32]);

        let payload = open_data(&session_key(), &packet).expect("open");
        assert_eq!(payload.inner, InnerKind::Broadcast);
        assert_eq!(payload.message_id, 42);
        assert_eq!(payload.body, b"hello");
    }

    #[test]
    fn lossy_carries_no_message_id() {
        let packet = seal_data(
            PacketKind::Lossy,
            1,
            &[5u8; 32],
            &session_key(),
            InnerKind::Ping,
            99, // ignored
            b"ping body",
        )
        .expect("seal");

        let payload = open_data(&session_key(), &packet).expect("open");
        assert_eq!(payload.inner, InnerKind::Ping);
        assert_eq!(payload.message_id, 0);
        assert_eq!(payload.body, b"ping body");
    }

    #[test]
    fn padding_preserves_body_with_leading_zeros() {
        // A body starting with zero bytes must survive padding removal:
        // the padding stripper stops at the nonzero inner kind, which
        // precedes the body.
        let body = [0u8, 0, 0, 7, 7];
        let packet = seal_data(
            PacketKind::Lossless,
            1,
            &[5u8; 32],
            &session_key(),
            InnerKind::CustomPacket,
            1,
            &body,
        )
        .expect("seal");
        let payload = open_data(&session_key(), &packet).expect("open");
        assert_eq!(payload.body, body);
    }

    #[test]
    fn wrong_session_key_fails() {
        let packet = seal_data(
            PacketKind::Lossless,
            1,
            &[5u8; 32],
            &session_key(),
            InnerKind::Ping,
            1,
            b"x",
        )
        .expect("seal");
        assert!(matches!(
            open_data(&[0x22; 32], &packet),
            Err(WireError::DecryptFailed)
        ));
    }

    #[test]
    fn oversize_body_is_rejected() {
        let body = vec![0u8; MAX_PACKET_SIZE];
        assert!(matches!(
            seal_data(
                PacketKind::Lossless,
                1,
                &[5u8; 32],
                &session_key(),
                InnerKind::CustomPacket,
                1,
                &body,
            ),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn handshake_round_trip() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();

        let data = HandshakeData {
            handshake_type: HandshakeType::Request,
            sender_pk_hash: 77,
            session_pk: [9u8; 32],
            sig_pk: [8u8; 32],
            request: HandshakeRequestType::InviteRequest,
            join: JoinType::Public,
            shared_state_version: 3,
            relay: Some(RelayNode {
                public_key: [2u8; 32],
                ip_port: palaver_types::network::IpPort::new(
                    IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
                    33445,
                ),
            }),
        };

        let packet = seal_handshake(5, &alice.public, &alice.secret, &bob.public, &data)
            .expect("seal");
        let (sender, opened) = open_handshake(&bob.secret, &packet).expect("open");
        assert_eq!(sender, alice.public);
        assert_eq!(opened, data);
    }

    #[test]
    fn handshake_to_other_recipient_fails() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();
        let eve = X25519KeyPair::generate();

        let data = HandshakeData {
            handshake_type: HandshakeType::Response,
            sender_pk_hash: 0,
            session_pk: [0u8; 32],
            sig_pk: [0u8; 32],
            request: HandshakeRequestType::PeerInfoExchange,
            join: JoinType::Private,
            shared_state_version: 0,
            relay: None,
        };
        let packet = seal_handshake(5, &alice.public, &alice.secret, &bob.public, &data)
            .expect("seal");
        assert!(open_handshake(&eve.secret, &packet).is_err());
    }
}
