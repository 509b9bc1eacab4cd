//! Integration test: moderation lifecycle.
//!
//! Promotes a peer to moderator, lets it set the topic, demotes it
//! (which re-signs the topic as the founder at a higher version), and
//! finally kicks it. Every replica converges after each step.

use palaver_group::moderation::mod_list_hash;
use palaver_integration_tests::{seed_announce, self_info, World};
use palaver_types::events::ModerationEvent;
use palaver_types::peer::{Privacy, Role};
use palaver_types::PeerId;

struct Pair {
    group: u32,
    joined: u32,
    joiner_peer_id: PeerId,
}

fn connected_pair(world: &mut World) -> Pair {
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Modtest", &self_info(b"founder"))
        .expect("group add");
    seed_announce(world, 1, 0, group);
    let group_chat_id = world.parties[0].session.chat_id(group).expect("chat id");
    let joined = world.parties[1]
        .session
        .group_join_public(group_chat_id, b"", &self_info(b"joiner"))
        .expect("join");
    world.run(30);

    let joiner_pk = world.parties[1]
        .session
        .chat(joined)
        .expect("chat")
        .self_keys
        .public
        .enc;
    let chat = world.parties[0].session.chat(group).expect("chat");
    let index = chat.peer_index_by_pk(&joiner_pk).expect("joiner");
    let joiner_peer_id = chat.peer_id_at(index).expect("peer id");
    assert_eq!(chat.confirmed_count(), 2);

    Pair {
        group,
        joined,
        joiner_peer_id,
    }
}

#[test]
fn promote_set_topic_demote_kick() {
    let mut world = World::new(2);
    let pair = connected_pair(&mut world);

    // --- promote to moderator ---
    let state_version_before = world.parties[0]
        .session
        .chat(pair.group)
        .expect("chat")
        .shared_state
        .version;
    {
        let party = &mut world.parties[0];
        party
            .session
            .set_peer_role(&mut party.net, pair.group, pair.joiner_peer_id, Role::Moderator)
            .expect("promote");
    }
    world.run(3);

    let joiner_chat = world.parties[1].session.chat(pair.joined).expect("chat");
    assert_eq!(joiner_chat.self_peer().role, Role::Moderator);
    assert_eq!(joiner_chat.mod_list.len(), 1);
    // The mod-list hash invariant holds on the synced replica.
    assert_eq!(
        joiner_chat.shared_state.mod_list_hash,
        mod_list_hash(&joiner_chat.mod_list)
    );
    assert_eq!(
        joiner_chat.shared_state.version,
        state_version_before + 1
    );

    // --- the new moderator sets the topic ---
    {
        let party = &mut world.parties[1];
        party
            .session
            .set_topic(&mut party.net, pair.joined, b"moderated topic")
            .expect("set topic");
    }
    world.run(3);

    let founder_chat = world.parties[0].session.chat(pair.group).expect("chat");
    assert_eq!(founder_chat.topic_info.topic, b"moderated topic");
    let moderator_sig_pk = world.parties[1]
        .session
        .chat(pair.joined)
        .expect("chat")
        .self_keys
        .public
        .sig;
    assert_eq!(founder_chat.topic_info.setter_sig_pk, moderator_sig_pk);
    let topic_version_as_mod = founder_chat.topic_info.version;
    assert!(!world.parties[0].log.borrow().topic_changes.is_empty());

    // --- demote: the founder re-signs the topic at a higher version ---
    {
        let party = &mut world.parties[0];
        party
            .session
            .set_peer_role(&mut party.net, pair.group, pair.joiner_peer_id, Role::User)
            .expect("demote");
    }
    world.run(3);

    let founder_chat = world.parties[0].session.chat(pair.group).expect("chat");
    let founder_sig_pk = founder_chat.self_keys.public.sig;
    assert!(founder_chat.mod_list.is_empty());
    assert_eq!(founder_chat.topic_info.setter_sig_pk, founder_sig_pk);
    assert!(founder_chat.topic_info.version > topic_version_as_mod);

    let joiner_chat = world.parties[1].session.chat(pair.joined).expect("chat");
    assert_eq!(joiner_chat.self_peer().role, Role::User);
    assert!(joiner_chat.mod_list.is_empty());
    assert_eq!(joiner_chat.topic_info.setter_sig_pk, founder_sig_pk);
    assert_eq!(joiner_chat.topic_info.version, founder_chat.topic_info.version);

    // --- kick ---
    {
        let party = &mut world.parties[0];
        party
            .session
            .remove_peer(&mut party.net, pair.group, pair.joiner_peer_id, false)
            .expect("kick");
    }
    world.run(3);

    assert_eq!(
        world.parties[0]
            .session
            .chat(pair.group)
            .expect("chat")
            .peer_count(),
        1
    );
    // The kicked peer saw the moderation event and dropped the group.
    assert!(world.parties[1]
        .log
        .borrow()
        .moderation
        .iter()
        .any(|(_, _, _, e)| *e == ModerationEvent::Kick));
    assert_eq!(world.parties[1].session.count_groups(), 0);
}

#[test]
fn observer_sanction_round_trip() {
    let mut world = World::new(2);
    let pair = connected_pair(&mut world);

    {
        let party = &mut world.parties[0];
        party
            .session
            .set_peer_role(&mut party.net, pair.group, pair.joiner_peer_id, Role::Observer)
            .expect("sanction");
    }
    world.run(3);

    let joiner_chat = world.parties[1].session.chat(pair.joined).expect("chat");
    assert_eq!(joiner_chat.self_peer().role, Role::Observer);
    assert_eq!(joiner_chat.sanctions.len(), 1);
    assert_eq!(joiner_chat.sanctions_creds.version, 1);

    // An observer cannot send messages.
    {
        let party = &mut world.parties[1];
        let result = party.session.send_message(
            &mut party.net,
            pair.joined,
            palaver_types::events::MessageType::Plain,
            b"muted",
        );
        assert!(result.is_err());
    }

    // Lift the sanction.
    {
        let party = &mut world.parties[0];
        party
            .session
            .set_peer_role(&mut party.net, pair.group, pair.joiner_peer_id, Role::User)
            .expect("unsanction");
    }
    world.run(3);

    let joiner_chat = world.parties[1].session.chat(pair.joined).expect("chat");
    assert_eq!(joiner_chat.self_peer().role, Role::User);
    assert!(joiner_chat.sanctions.is_empty());
    assert_eq!(joiner_chat.sanctions_creds.version, 2);
}

#[test]
fn founder_config_changes_propagate() {
    let mut world = World::new(2);
    let pair = connected_pair(&mut world);

    {
        let party = &mut world.parties[0];
        party
            .session
            .founder_set_max_peers(&mut party.net, pair.group, 64)
            .expect("max peers");
        party
            .session
            .founder_set_password(&mut party.net, pair.group, b"sesame")
            .expect("password");
    }
    world.run(3);

    let joiner_chat = world.parties[1].session.chat(pair.joined).expect("chat");
    assert_eq!(joiner_chat.shared_state.max_peers, 64);
    assert_eq!(joiner_chat.shared_state.password, b"sesame".to_vec());

    let log = world.parties[1].log.borrow();
    assert!(!log.password_changes.is_empty());
}
