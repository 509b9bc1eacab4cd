//! Integration test: public join with and without a password.
//!
//! A joiner discovers the founder through a seeded announce, walks the
//! handshake + invite + sync pipeline, and both sides end with two
//! confirmed peers. A wrong password is rejected with the right code.

use palaver_integration_tests::{seed_announce, self_info, World};
use palaver_types::events::RejectReason;
use palaver_types::peer::{ConnectionState, Privacy, Role};

fn founder_with_password(world: &mut World, password: &[u8]) -> u32 {
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Club", &self_info(b"founder"))
        .expect("group add");
    if !password.is_empty() {
        let party = &mut world.parties[0];
        party
            .session
            .founder_set_password(&mut party.net, group, password)
            .expect("set password");
    }
    group
}

#[test]
fn open_group_join_completes() {
    let mut world = World::new(2);
    let group = founder_with_password(&mut world, b"");
    seed_announce(&mut world, 1, 0, group);

    let group_chat_id = world.parties[0].session.chat_id(group).expect("chat id");
    let joined = world.parties[1]
        .session
        .group_join_public(group_chat_id, b"", &self_info(b"joiner"))
        .expect("join");

    world.run(30);

    let founder_chat = world.parties[0].session.chat(group).expect("founder chat");
    let joiner_chat = world.parties[1].session.chat(joined).expect("joiner chat");

    assert_eq!(founder_chat.confirmed_count(), 2);
    assert_eq!(joiner_chat.confirmed_count(), 2);
    assert_eq!(joiner_chat.connection_state, ConnectionState::Connected);
    assert_eq!(joiner_chat.self_peer().role, Role::User);

    // The replicas agree on the founder-signed state.
    assert_eq!(joiner_chat.shared_state, founder_chat.shared_state);
    assert_eq!(joiner_chat.topic_info, founder_chat.topic_info);

    // Callbacks fired on both ends.
    assert_eq!(world.parties[1].log.borrow().self_joins, vec![joined]);
    let founder_log = world.parties[0].log.borrow();
    assert_eq!(founder_log.peer_joins.len(), 1);
    assert_eq!(founder_log.peer_joins[0].0, group);
}

#[test]
fn wrong_password_is_rejected_then_correct_succeeds() {
    let mut world = World::new(3);
    let group = founder_with_password(&mut world, b"hunter2");
    let chat_id = world.parties[0].session.chat_id(group).expect("chat id");

    // Party 1 tries the wrong password.
    seed_announce(&mut world, 1, 0, group);
    world.parties[1]
        .session
        .group_join_public(chat_id, b"wrong", &self_info(b"mallory"))
        .expect("join starts");
    world.run(30);

    {
        let log = world.parties[1].log.borrow();
        assert_eq!(log.rejected.len(), 1);
        assert_eq!(log.rejected[0].1, RejectReason::InvalidPassword);
        assert!(log.self_joins.is_empty());
    }
    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        1
    );

    // Party 2 uses the correct password.
    seed_announce(&mut world, 2, 0, group);
    let joined = world.parties[2]
        .session
        .group_join_public(chat_id, b"hunter2", &self_info(b"alice"))
        .expect("join starts");
    world.run(30);

    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        2
    );
    assert_eq!(world.parties[2].log.borrow().self_joins, vec![joined]);
    // The joiner learned the password from the synced shared state.
    assert_eq!(
        world.parties[2]
            .session
            .chat(joined)
            .expect("chat")
            .shared_state
            .password,
        b"hunter2".to_vec()
    );
}

#[test]
fn nick_collision_is_rejected() {
    let mut world = World::new(3);
    let group = founder_with_password(&mut world, b"");
    let chat_id = world.parties[0].session.chat_id(group).expect("chat id");

    seed_announce(&mut world, 1, 0, group);
    world.parties[1]
        .session
        .group_join_public(chat_id, b"", &self_info(b"alice"))
        .expect("join starts");
    world.run(30);
    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        2
    );

    // A second joiner claims the same nick.
    seed_announce(&mut world, 2, 0, group);
    world.parties[2]
        .session
        .group_join_public(chat_id, b"", &self_info(b"alice"))
        .expect("join starts");
    world.run(30);

    let log = world.parties[2].log.borrow();
    assert_eq!(log.rejected.len(), 1);
    assert_eq!(log.rejected[0].1, RejectReason::NickTaken);
    assert_eq!(
        world.parties[0]
            .session
            .chat(group)
            .expect("chat")
            .confirmed_count(),
        2
    );
}
