//! # palaver-announce
//!
//! In-memory rendezvous store for public groups. Peers of a public chat
//! place announce records here (chat id, their public key, a relay they
//! are reachable through); joiners query by chat id to find handshake
//! targets.
//!
//! Each chat id owns a fixed-capacity ring of recent announces: new
//! entries overwrite the oldest when the ring is full. Buckets whose
//! last insertion is older than the announce timeout are pruned on a
//! periodic tick, and a bucket is dropped outright when its group goes
//! private.
//!
//! The store is logically process-wide but is only ever mutated from
//! within a session tick; cross-thread use is the embedder's concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use palaver_types::network::RelayNode;
use palaver_types::{ChatId, PublicKey};

/// Maximum announces retained per chat id.
pub const MAX_ANNOUNCES_PER_CHAT: usize = 16;

/// Seconds after which an idle bucket is pruned.
pub const ANNOUNCE_TIMEOUT_SECS: u64 = 30;

/// A single peer announce record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    /// The chat being announced.
    pub chat_id: ChatId,
    /// The announcing peer's long-term encryption public key.
    pub peer_public_key: PublicKey,
    /// A relay the peer can be reached through.
    pub relay: RelayNode,
    /// Unix time the announce was stored.
    pub timestamp: u64,
}

/// Per-chat ring of announces.
#[derive(Clone, Debug, Default)]
struct Bucket {
    /// Ring slots, oldest overwritten first once full.
    entries: Vec<PeerAnnounce>,
    /// Next slot to write.
    index: usize,
    /// Unix time of the most recent insertion.
    last_insert: u64,
}

/// The process-wide announce store.
#[derive(Clone, Debug, Default)]
pub struct AnnounceStore {
    buckets: HashMap<ChatId, Bucket>,
}

impl AnnounceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an announce for `chat_id`, overwriting the oldest entry
    /// when the ring is full.
    pub fn add_announce(
        &mut self,
        chat_id: ChatId,
        peer_public_key: PublicKey,
        relay: RelayNode,
        now: u64,
    ) {
        let bucket = self.buckets.entry(chat_id).or_default();
        let announce = PeerAnnounce {
            chat_id,
            peer_public_key,
            relay,
            timestamp: now,
        };

        if bucket.entries.len() < MAX_ANNOUNCES_PER_CHAT {
            bucket.entries.push(announce);
        } else {
            bucket.entries[bucket.index % MAX_ANNOUNCES_PER_CHAT] = announce;
        }
        bucket.index = (bucket.index + 1) % MAX_ANNOUNCES_PER_CHAT;
        bucket.last_insert = now;

        tracing::debug!(
            chat = %palaver_types::fmt_key(&chat_id),
            peer = %palaver_types::fmt_key(&peer_public_key),
            "stored peer announce"
        );
    }

    /// Fetch up to `max` announces for `chat_id` with distinct peer
    /// public keys, excluding `except`. Newest entries win on duplicate
    /// keys.
    pub fn get_announces(
        &self,
        chat_id: &ChatId,
        max: usize,
        except: &PublicKey,
    ) -> Vec<PeerAnnounce> {
        let Some(bucket) = self.buckets.get(chat_id) else {
            return Vec::new();
        };

        // Walk newest to oldest so fresher relays shadow stale ones.
        // Slot order is not age order once the ring has wrapped.
        let mut by_age: Vec<&PeerAnnounce> = bucket.entries.iter().collect();
        by_age.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut out: Vec<PeerAnnounce> = Vec::new();
        for announce in by_age {
            if out.len() >= max {
                break;
            }
            if &announce.peer_public_key == except {
                continue;
            }
            if out
                .iter()
                .any(|a| a.peer_public_key == announce.peer_public_key)
            {
                continue;
            }
            out.push(announce.clone());
        }
        out
    }

    /// Drop the bucket for `chat_id`. Called when a group goes private.
    pub fn cleanup(&mut self, chat_id: &ChatId) {
        if self.buckets.remove(chat_id).is_some() {
            tracing::debug!(chat = %palaver_types::fmt_key(chat_id), "dropped announce bucket");
        }
    }

    /// Prune buckets whose last insertion is older than the announce
    /// timeout. Called once per tick.
    pub fn do_tick(&mut self, now: u64) {
        self.buckets.retain(|_, bucket| {
            bucket.last_insert.saturating_add(ANNOUNCE_TIMEOUT_SECS) > now
        });
    }

    /// Number of chats currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn relay(seed: u8) -> RelayNode {
        RelayNode {
            public_key: [seed; 32],
            ip_port: palaver_types::network::IpPort::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)),
                33445,
            ),
        }
    }

    #[test]
    fn add_and_get_excludes_caller() {
        let mut store = AnnounceStore::new();
        let chat = [1u8; 32];
        store.add_announce(chat, [10u8; 32], relay(1), 100);
        store.add_announce(chat, [11u8; 32], relay(2), 101);

        let got = store.get_announces(&chat, 8, &[10u8; 32]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].peer_public_key, [11u8; 32]);
    }

    #[test]
    fn duplicate_keys_collapse_to_newest() {
        let mut store = AnnounceStore::new();
        let chat = [1u8; 32];
        store.add_announce(chat, [10u8; 32], relay(1), 100);
        store.add_announce(chat, [10u8; 32], relay(2), 105);

        let got = store.get_announces(&chat, 8, &[0u8; 32]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].relay, relay(2));
        assert_eq!(got[0].timestamp, 105);
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let mut store = AnnounceStore::new();
        let chat = [1u8; 32];
        for i in 0..(MAX_ANNOUNCES_PER_CHAT + 2) {
            store.add_announce(chat, [i as u8; 32], relay(i as u8), 100 + i as u64);
        }

        let got = store.get_announces(&chat, MAX_ANNOUNCES_PER_CHAT + 2, &[0xFF; 32]);
        assert_eq!(got.len(), MAX_ANNOUNCES_PER_CHAT);
        // The two oldest entries were overwritten.
        assert!(!got.iter().any(|a| a.peer_public_key == [0u8; 32]));
        assert!(!got.iter().any(|a| a.peer_public_key == [1u8; 32]));
        assert!(got.iter().any(|a| a.peer_public_key == [2u8; 32]));
    }

    #[test]
    fn max_limits_results() {
        let mut store = AnnounceStore::new();
        let chat = [1u8; 32];
        for i in 0..6u8 {
            store.add_announce(chat, [i; 32], relay(i), 100);
        }
        assert_eq!(store.get_announces(&chat, 4, &[0xFF; 32]).len(), 4);
    }

    #[test]
    fn cleanup_removes_bucket() {
        let mut store = AnnounceStore::new();
        let chat = [1u8; 32];
        store.add_announce(chat, [10u8; 32], relay(1), 100);
        assert_eq!(store.bucket_count(), 1);
        store.cleanup(&chat);
        assert_eq!(store.bucket_count(), 0);
        assert!(store.get_announces(&chat, 8, &[0u8; 32]).is_empty());
    }

    #[test]
    fn tick_prunes_idle_buckets() {
        let mut store = AnnounceStore::new();
        store.add_announce([1u8; 32], [10u8; 32], relay(1), 100);
        store.add_announce([2u8; 32], [11u8; 32], relay(2), 120);

        store.do_tick(100 + ANNOUNCE_TIMEOUT_SECS);
        assert_eq!(store.bucket_count(), 1);
        assert!(store.get_announces(&[1u8; 32], 8, &[0u8; 32]).is_empty());
        assert!(!store.get_announces(&[2u8; 32], 8, &[0u8; 32]).is_empty());
    }
}
