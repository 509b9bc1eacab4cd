//! Integration test: private group join through the friend-invite
//! dance (invite, acceptance, confirmation, out-of-band handshake).

use palaver_integration_tests::{self_info, World};
use palaver_types::peer::{ConnectionState, Privacy};

#[test]
fn private_group_friend_invite_join() {
    let mut world = World::new(2);

    let group = world.parties[0]
        .session
        .group_add(Privacy::Private, b"Sanctum", &self_info(b"founder"))
        .expect("group add");

    // Founder invites friend 1 (party indexes double as friend ids).
    {
        let party = &mut world.parties[0];
        party
            .session
            .invite_friend(&mut party.net, group, 1)
            .expect("invite");
    }
    world.route_all();

    // The invite arrived on the friend channel; accept it.
    let (from_friend, invite) = world.parties[1]
        .friend_inbox
        .pop()
        .expect("invite delivered");
    let joined = {
        let party = &mut world.parties[1];
        party
            .session
            .accept_friend_invite(&mut party.net, from_friend, &invite, b"", &self_info(b"guest"))
            .expect("accept")
    };

    // Acceptance and confirmation flow over the friend channel, then
    // the OOB handshake and sync run over the group transport.
    world.run(30);

    let founder_chat = world.parties[0].session.chat(group).expect("chat");
    let guest_chat = world.parties[1].session.chat(joined).expect("chat");

    assert_eq!(founder_chat.confirmed_count(), 2);
    assert_eq!(guest_chat.confirmed_count(), 2);
    assert_eq!(guest_chat.connection_state, ConnectionState::Connected);
    assert_eq!(guest_chat.shared_state, founder_chat.shared_state);
    assert_eq!(world.parties[1].log.borrow().self_joins, vec![joined]);
}

#[test]
fn unsolicited_acceptance_is_ignored() {
    let mut world = World::new(2);

    let group = world.parties[0]
        .session
        .group_add(Privacy::Private, b"Sanctum", &self_info(b"founder"))
        .expect("group add");
    let chat_id = world.parties[0].session.chat_id(group).expect("chat id");

    // Party 1 forges an acceptance without ever being invited.
    let mut packet = vec![2u8]; // FRIEND_INVITE_ACCEPTED
    packet.extend_from_slice(&chat_id);
    packet.extend_from_slice(&[9u8; 32]);

    let party = &mut world.parties[0];
    assert!(party
        .session
        .handle_friend_packet(&mut party.net, 1, &packet)
        .is_err());
    assert_eq!(party.session.chat(group).expect("chat").peer_count(), 1);
}
