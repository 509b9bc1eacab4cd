//! Packet transmission and reception for one chat: wrapping, lossless
//! window flow, acks, retransmission, and dispatch by inner kind.
//!
//! Inbound packets are processed before any outbound work within a tick
//! so windows stay bounded.

use palaver_types::network::IpPort;
use palaver_types::PublicKey;
use palaver_wire::bytes::{Reader, Writer};
use palaver_wire::kinds::{InnerKind, PacketKind};
use palaver_wire::packet::{self, OuterHeader};
use palaver_wire::records;

use crate::chat::Chat;
use crate::conn::{LosslessPayload, RecvAction};
use crate::overlay::Ctx;
use crate::timing;
use crate::{GroupError, Result};

impl Chat {
    /// Push a raw packet toward the peer at `index`: direct first, then
    /// through its most recent relay.
    pub(crate) fn send_raw(&self, ctx: &mut Ctx<'_>, index: usize, packet: &[u8]) -> bool {
        let Some(conn) = self.conn(index) else {
            return false;
        };
        let mut sent = false;
        if let Some(addr) = conn.addr {
            sent = ctx.net.send_udp(addr, packet);
        }
        if !sent {
            if let Some(relay) = conn.last_relay() {
                sent = ctx.net.send_relay(&relay.public_key, &conn.public_key, packet);
            }
        }
        sent
    }

    /// Send a lossy packet to the peer at `index`.
    pub(crate) fn send_lossy(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        inner: InnerKind,
        body: &[u8],
    ) -> Result<()> {
        let self_pk = self.self_keys.public.enc;
        let chat_id_hash = self.chat_id_hash;
        let conn = self.conn(index).ok_or(GroupError::PeerUnknown)?;
        if !conn.handshaked {
            return Err(GroupError::TransportFailure);
        }
        let key = conn.session_key.ok_or(GroupError::TransportFailure)?;

        let packet = packet::seal_data(
            PacketKind::Lossy,
            chat_id_hash,
            &self_pk,
            &key,
            inner,
            0,
            body,
        )?;
        if !self.send_raw(ctx, index, &packet) {
            return Err(GroupError::TransportFailure);
        }
        Ok(())
    }

    /// Send a lossless packet to the peer at `index`, parking it in the
    /// send window until acked.
    pub(crate) fn send_lossless(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        inner: InnerKind,
        body: &[u8],
    ) -> Result<()> {
        let self_pk = self.self_keys.public.enc;
        let chat_id_hash = self.chat_id_hash;
        let now = ctx.now();

        let conn = self.conn(index).ok_or(GroupError::PeerUnknown)?;
        if !conn.handshaked {
            return Err(GroupError::TransportFailure);
        }
        let key = conn.session_key.ok_or(GroupError::TransportFailure)?;
        let message_id = conn.send_message_id;

        let packet = packet::seal_data(
            PacketKind::Lossless,
            chat_id_hash,
            &self_pk,
            &key,
            inner,
            message_id,
            body,
        )?;

        let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
        conn.add_send_entry(packet.clone(), now)?;

        // A failed send is not an error: the entry retransmits on tick.
        if !self.send_raw(ctx, index, &packet) {
            tracing::debug!(
                group = self.group_number,
                message_id,
                "initial lossless send failed, awaiting retransmit"
            );
        }
        Ok(())
    }

    /// Send a lossless packet to every confirmed peer.
    pub(crate) fn send_lossless_all(&mut self, ctx: &mut Ctx<'_>, inner: InnerKind, body: &[u8]) {
        for index in 1..self.peer_count() {
            if self.conn(index).is_some_and(|c| c.confirmed) {
                if let Err(err) = self.send_lossless(ctx, index, inner, body) {
                    tracing::debug!(group = self.group_number, index, %err, "broadcast send failed");
                }
            }
        }
    }

    /// Send a lossy packet to every confirmed peer.
    pub(crate) fn send_lossy_all(&mut self, ctx: &mut Ctx<'_>, inner: InnerKind, body: &[u8]) {
        for index in 1..self.peer_count() {
            if self.conn(index).is_some_and(|c| c.confirmed) {
                if let Err(err) = self.send_lossy(ctx, index, inner, body) {
                    tracing::debug!(group = self.group_number, index, %err, "lossy send failed");
                }
            }
        }
    }

    /// Acknowledge a lossless packet: `read_id` confirms receipt,
    /// `request_id` asks for a resend. At most one may be nonzero.
    pub(crate) fn send_message_ack(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        read_id: u64,
        request_id: u64,
    ) -> Result<()> {
        let mut body = Writer::with_capacity(16);
        body.put_u64(read_id);
        body.put_u64(request_id);
        self.send_lossy(ctx, index, InnerKind::MessageAck, &body.into_vec())
    }

    /// Handle an inbound MESSAGE_ACK.
    pub(crate) fn handle_message_ack(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        body: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(body);
        let read_id = r.take_u64()?;
        let request_id = r.take_u64()?;
        if read_id > 0 && request_id > 0 {
            return Err(GroupError::Malformed("ack with both ids set".into()));
        }

        let now = ctx.now();
        let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
        if read_id > 0 {
            conn.handle_ack(read_id);
            return Ok(());
        }

        if let Some(packet) = conn.requested_packet(request_id, now) {
            self.send_raw(ctx, index, &packet);
        }
        Ok(())
    }

    /// Handle an inbound LOSSLESS or LOSSY packet already routed to this
    /// chat by its id hash.
    pub(crate) fn handle_data_packet(
        &mut self,
        ctx: &mut Ctx<'_>,
        header: &OuterHeader,
        packet: &[u8],
        direct: Option<IpPort>,
    ) -> Result<()> {
        let index = self
            .peer_index_by_pk(&header.sender_pk)
            .ok_or(GroupError::PeerUnknown)?;
        if index == 0 {
            return Err(GroupError::Malformed("packet from own key".into()));
        }

        let conn = self.conn(index).ok_or(GroupError::PeerUnknown)?;
        let key = conn.session_key.ok_or(GroupError::DecryptFailed)?;
        let payload = packet::open_data(&key, packet)?;

        match header.kind {
            PacketKind::Lossless => {
                self.handle_lossless(ctx, index, header.sender_pk, payload, direct)
            }
            PacketKind::Lossy => self.handle_lossy(ctx, index, payload),
            PacketKind::Handshake => Err(GroupError::Malformed("handshake in data path".into())),
        }
    }

    fn handle_lossless(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        sender_pk: PublicKey,
        payload: packet::DataPayload,
        direct: Option<IpPort>,
    ) -> Result<()> {
        let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
        if payload.inner != InnerKind::HsResponseAck && !conn.handshaked {
            return Err(GroupError::TransportFailure);
        }
        if let Some(addr) = direct {
            conn.addr = Some(addr);
        }

        let message_id = payload.message_id;
        let action = conn.handle_recv(
            message_id,
            LosslessPayload {
                inner: payload.inner,
                body: payload.body,
            },
        );

        match action {
            RecvAction::Deliver(items) => {
                for (id, item) in items {
                    // The handler may delete or move the sender; resolve
                    // the index fresh for each delivery.
                    let Some(cur) = self.peer_index_by_pk(&sender_pk) else {
                        break;
                    };
                    if let Err(err) = self.dispatch_lossless(ctx, cur, &item) {
                        tracing::warn!(
                            group = self.group_number,
                            kind = ?item.inner,
                            %err,
                            "lossless handler failed"
                        );
                    }
                    if let Some(cur) = self.peer_index_by_pk(&sender_pk) {
                        let _ = self.send_message_ack(ctx, cur, id, 0);
                    }
                }
                Ok(())
            }
            RecvAction::Duplicate => self.send_message_ack(ctx, index, message_id, 0),
            RecvAction::Buffered => {
                let next = self
                    .conn(index)
                    .map(|c| c.recv_message_id + 1)
                    .unwrap_or(1);
                self.send_message_ack(ctx, index, 0, next)
            }
            RecvAction::OutOfWindow => {
                tracing::debug!(
                    group = self.group_number,
                    message_id,
                    "lossless packet outside window"
                );
                Ok(())
            }
        }
    }

    fn handle_lossy(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        payload: packet::DataPayload,
    ) -> Result<()> {
        let conn = self.conn(index).ok_or(GroupError::PeerUnknown)?;
        if !conn.handshaked {
            return Err(GroupError::TransportFailure);
        }
        if !payload.inner.is_lossy() {
            return Err(GroupError::Malformed("lossless kind in lossy packet".into()));
        }

        match payload.inner {
            InnerKind::Ping => self.handle_ping(ctx, index, &payload.body),
            InnerKind::MessageAck => self.handle_message_ack(ctx, index, &payload.body),
            InnerKind::IpPort => self.handle_ip_port(index, &payload.body),
            InnerKind::TcpRelays => self.handle_tcp_relays(index, &payload.body),
            InnerKind::InviteResponseReject => self.handle_invite_reject(&payload.body),
            InnerKind::CustomPacket => self.handle_custom_packet(index, &payload.body),
            _ => Err(GroupError::Malformed("unhandled lossy kind".into())),
        }
    }

    fn dispatch_lossless(
        &mut self,
        ctx: &mut Ctx<'_>,
        index: usize,
        payload: &LosslessPayload,
    ) -> Result<()> {
        match payload.inner {
            InnerKind::Broadcast => self.handle_broadcast(ctx, index, &payload.body),
            InnerKind::PeerAnnounce => self.handle_peer_announce(ctx, index, &payload.body),
            InnerKind::PeerInfoRequest => self.handle_peer_info_request(ctx, index),
            InnerKind::PeerInfoResponse => self.handle_peer_info_response(ctx, index, &payload.body),
            InnerKind::SyncRequest => self.handle_sync_request(ctx, index, &payload.body),
            InnerKind::SyncResponse => self.handle_sync_response(ctx, index, &payload.body),
            InnerKind::InviteRequest => self.handle_invite_request(ctx, index, &payload.body),
            InnerKind::InviteResponse => self.handle_invite_response(ctx, index, &payload.body),
            InnerKind::Topic => self.handle_topic(ctx, index, &payload.body),
            InnerKind::SharedState => self.handle_shared_state(ctx, index, &payload.body),
            InnerKind::ModList => self.handle_mod_list(ctx, index, &payload.body),
            InnerKind::SanctionsList => self.handle_sanctions_list(ctx, index, &payload.body),
            InnerKind::HsResponseAck => self.handle_hs_response_ack(ctx, index),
            InnerKind::CustomPacket => self.handle_custom_packet(index, &payload.body),
            other => Err(GroupError::Malformed(format!(
                "unhandled lossless kind {other:?}"
            ))),
        }
    }

    /// Application custom packets surface directly to the host.
    fn handle_custom_packet(&mut self, index: usize, body: &[u8]) -> Result<()> {
        let peer_id = self.peer_id_at(index).ok_or(GroupError::PeerUnknown)?;
        if self
            .entries
            .get(index)
            .is_some_and(|e| e.peer.ignore)
        {
            return Ok(());
        }
        self.push_event(crate::events::GroupEvent::CustomPacket {
            peer_id,
            data: body.to_vec(),
        });
        Ok(())
    }

    /// Share our reachable address with the peer.
    pub(crate) fn send_ip_port(&mut self, ctx: &mut Ctx<'_>, index: usize) -> Result<()> {
        let Some(ipp) = ctx.net.self_ip_port() else {
            return Ok(());
        };
        let mut body = Writer::new();
        records::pack_ip_port(&mut body, &ipp);
        self.send_lossy(ctx, index, InnerKind::IpPort, &body.into_vec())
    }

    fn handle_ip_port(&mut self, index: usize, body: &[u8]) -> Result<()> {
        let ipp = records::unpack_ip_port(&mut Reader::new(body))?;
        if ipp.is_unspecified() {
            return Err(GroupError::Malformed("unspecified ip+port".into()));
        }
        let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
        conn.addr = Some(ipp);
        Ok(())
    }

    /// Share our relay with the peer.
    pub(crate) fn send_tcp_relays(&mut self, ctx: &mut Ctx<'_>, index: usize) -> Result<()> {
        let Some(relay) = ctx.net.self_relay() else {
            return Ok(());
        };
        let mut body = Writer::new();
        records::pack_relay_nodes(&mut body, std::slice::from_ref(&relay));
        self.send_lossy(ctx, index, InnerKind::TcpRelays, &body.into_vec())
    }

    fn handle_tcp_relays(&mut self, index: usize, body: &[u8]) -> Result<()> {
        let relays = records::unpack_relay_nodes(&mut Reader::new(body), 4)?;
        if relays.is_empty() {
            return Err(GroupError::Malformed("empty relay share".into()));
        }
        let conn = self.conn_mut(index).ok_or(GroupError::PeerUnknown)?;
        for relay in relays {
            conn.save_relay(relay);
        }
        Ok(())
    }

    /// Drive timers for every peer connection: periodic shares, timeout
    /// eviction, and retransmission.
    pub(crate) fn do_peer_connections(&mut self, ctx: &mut Ctx<'_>) {
        let now = ctx.now();
        let mut index = 1;
        while index < self.peer_count() {
            let Some(conn) = self.conn(index) else {
                index += 1;
                continue;
            };

            let confirmed = conn.confirmed;
            let timeout = if confirmed {
                timing::CONFIRMED_PEER_TIMEOUT
            } else {
                timing::UNCONFIRMED_PEER_TIMEOUT
            };
            if palaver_types::time::is_timeout(now, conn.last_rcvd_ping, timeout) {
                tracing::info!(
                    group = self.group_number,
                    peer = %palaver_types::fmt_key(&conn.public_key),
                    "peer timed out"
                );
                self.peer_delete(index, b"Timed out");
                continue;
            }

            if confirmed {
                if palaver_types::time::is_timeout(
                    now,
                    conn.last_tcp_relays_shared,
                    timing::TCP_RELAYS_SHARE_INTERVAL,
                ) {
                    if let Some(c) = self.conn_mut(index) {
                        c.last_tcp_relays_shared = now;
                    }
                    let _ = self.send_tcp_relays(ctx, index);
                }
                if self.conn(index).is_some_and(|c| {
                    palaver_types::time::is_timeout(
                        now,
                        c.last_ip_port_shared,
                        timing::IP_PORT_SHARE_INTERVAL,
                    )
                }) {
                    if let Some(c) = self.conn_mut(index) {
                        c.last_ip_port_shared = now;
                    }
                    let _ = self.send_ip_port(ctx, index);
                }
            }

            let resend = self
                .conn_mut(index)
                .map(|c| c.packets_to_resend(now))
                .unwrap_or(Ok(Vec::new()));
            match resend {
                Ok(packets) => {
                    for packet in packets {
                        self.send_raw(ctx, index, &packet);
                    }
                }
                Err(_) => {
                    tracing::info!(
                        group = self.group_number,
                        index,
                        "dropping peer with stuck send window"
                    );
                    self.peer_delete(index, b"Timed out");
                    continue;
                }
            }

            index += 1;
        }
    }
}
