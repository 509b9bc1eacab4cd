//! Integration test: lossless delivery over a lossy overlay.
//!
//! Drops the first transmission of a message and verifies the
//! retransmission path delivers it exactly once, clearing the sender's
//! window slot.

use palaver_integration_tests::{seed_announce, self_info, World};
use palaver_types::events::MessageType;
use palaver_types::peer::Privacy;

fn connected_pair(world: &mut World) -> (u32, u32) {
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Chat", &self_info(b"founder"))
        .expect("group add");
    seed_announce(world, 1, 0, group);
    let group_chat_id = world.parties[0].session.chat_id(group).expect("chat id");
    let joined = world.parties[1]
        .session
        .group_join_public(group_chat_id, b"", &self_info(b"joiner"))
        .expect("join");
    world.run(30);
    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        2
    );
    (group, joined)
}

#[test]
fn dropped_message_is_retransmitted_exactly_once() {
    let mut world = World::new(2);
    let (group, joined) = connected_pair(&mut world);

    let before = world.parties[1].log.borrow().messages.len();

    // Send with the wire cut for exactly one packet.
    {
        let party = &mut world.parties[0];
        party
            .session
            .send_message(&mut party.net, group, MessageType::Plain, b"are you there")
            .expect("send");
    }
    world.drop_from = Some((0, 1));
    world.route_all();

    // Nothing arrived.
    assert_eq!(world.parties[1].log.borrow().messages.len(), before);

    // The retransmission timer fires within a few ticks and the message
    // arrives exactly once.
    world.run(5);
    let log = world.parties[1].log.borrow();
    let received: Vec<_> = log
        .messages
        .iter()
        .filter(|(g, _, _, m)| *g == joined && m == b"are you there")
        .collect();
    assert_eq!(received.len(), 1);
    drop(log);

    // The ack cleared the sender's window.
    let founder_chat = world.parties[0].session.chat(group).expect("chat");
    let joiner_pk = world.parties[1]
        .session
        .chat(joined)
        .expect("chat")
        .self_keys
        .public
        .enc;
    let index = founder_chat
        .peer_index_by_pk(&joiner_pk)
        .expect("joiner index");
    assert_eq!(
        founder_chat.conn(index).expect("conn").unacked_count(),
        0
    );
}

#[test]
fn messages_survive_sustained_loss() {
    let mut world = World::new(2);
    let (group, joined) = connected_pair(&mut world);

    // Ten messages, first transmission of each dropped.
    for i in 0..10u8 {
        {
            let party = &mut world.parties[0];
            party
                .session
                .send_message(&mut party.net, group, MessageType::Plain, &[b'm', i])
                .expect("send");
        }
        world.drop_from = Some((0, 1));
        world.route_all();
        world.run(3);
    }

    let log = world.parties[1].log.borrow();
    let received: Vec<_> = log
        .messages
        .iter()
        .filter(|(g, _, _, m)| *g == joined && m.len() == 2 && m[0] == b'm')
        .map(|(_, _, _, m)| m[1])
        .collect();

    // Exactly once each, in order.
    assert_eq!(received, (0..10u8).collect::<Vec<_>>());
}

#[test]
fn private_message_reaches_only_its_addressee() {
    let mut world = World::new(3);
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Chat", &self_info(b"founder"))
        .expect("group add");
    let chat_id = world.parties[0].session.chat_id(group).expect("chat id");

    seed_announce(&mut world, 1, 0, group);
    let j1 = world.parties[1]
        .session
        .group_join_public(chat_id, b"", &self_info(b"alice"))
        .expect("join");
    world.run(30);
    seed_announce(&mut world, 2, 0, group);
    let j2 = world.parties[2]
        .session
        .group_join_public(chat_id, b"", &self_info(b"bob"))
        .expect("join");
    world.run(40);

    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        3
    );

    // Founder whispers to alice.
    let alice_pk = world.parties[1]
        .session
        .chat(j1)
        .expect("chat")
        .self_keys
        .public
        .enc;
    let alice_peer_id = {
        let chat = world.parties[0].session.chat(group).expect("chat");
        let index = chat.peer_index_by_pk(&alice_pk).expect("alice");
        chat.peer_id_at(index).expect("peer id")
    };
    {
        let party = &mut world.parties[0];
        party
            .session
            .send_private_message(&mut party.net, group, alice_peer_id, b"psst")
            .expect("send");
    }
    world.run(3);

    assert_eq!(world.parties[1].log.borrow().private_messages.len(), 1);
    assert!(world.parties[2].log.borrow().private_messages.is_empty());
    let _ = j2;
}
