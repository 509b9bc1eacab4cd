//! Integration test: group creation and persistence.
//!
//! Covers the founder self-join invariants (shared state version 1,
//! empty mod list, single-space topic at version 1, founder role, one
//! peer) and the save/load round trip.

use palaver_integration_tests::{self_info, World};
use palaver_types::peer::{ConnectionState, Privacy, Role};

#[test]
fn founder_create_invariants() {
    let mut world = World::new(1);
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Test", &self_info(b"founder"))
        .expect("group add");

    let chat = world.parties[0].session.chat(group).expect("chat");
    assert_eq!(chat.shared_state.version, 1);
    assert!(chat.mod_list.is_empty());
    assert_eq!(chat.topic_info.topic, b" ");
    assert_eq!(chat.topic_info.version, 1);
    assert_eq!(chat.self_peer().role, Role::Founder);
    assert_eq!(chat.peer_count(), 1);
    assert_eq!(chat.connection_state, ConnectionState::Connected);

    // The founder's signature over the shared state verifies under the
    // chat id.
    let signable = palaver_wire::records::shared_state_signable(&chat.shared_state);
    palaver_crypto::ed25519::verify_detached(&chat.chat_id, &signable, &chat.shared_state_sig)
        .expect("shared state signature");
}

#[test]
fn save_and_reload_keeps_identity() {
    let mut world = World::new(1);
    let session = &mut world.parties[0].session;
    let group = session
        .group_add(Privacy::Private, b"Persist", &self_info(b"founder"))
        .expect("group add");

    let saved = session.saved_group(group).expect("save");
    let chat_id = session.chat_id(group).expect("chat id");

    // Reload into a fresh session, as after a restart.
    let mut world2 = World::new(1);
    let restored = world2.parties[0]
        .session
        .group_load(&saved)
        .expect("group load");
    let chat = world2.parties[0].session.chat(restored).expect("chat");

    assert_eq!(chat.chat_id, chat_id);
    assert_eq!(chat.self_peer().role, Role::Founder);
    assert!(chat.chat_sig_secret.is_some());
    assert_eq!(chat.shared_state.group_name, b"Persist");
    assert_eq!(chat.connection_state, ConnectionState::Connecting);

    // Loading the same group twice is refused.
    assert!(world2.parties[0].session.group_load(&saved).is_err());
}

#[test]
fn public_group_announces_itself_on_tick() {
    let mut world = World::new(1);
    let group = world.parties[0]
        .session
        .group_add(Privacy::Public, b"Visible", &self_info(b"founder"))
        .expect("group add");
    let chat_id = world.parties[0].session.chat_id(group).expect("chat id");

    world.run(2);

    let announces =
        world.parties[0]
            .session
            .announces()
            .get_announces(&chat_id, 4, &[0xFF; 32]);
    assert_eq!(announces.len(), 1);
}
