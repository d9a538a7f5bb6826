//! Presence tracking for Huddle.
//!
//! The registry holds one membership row per `(channel, user)` with an
//! online flag and a last-seen timestamp. Rows are never removed; leaving
//! only flips the flag. Concurrent writers for the same key converge to a
//! single row with last-write-wins on `last_seen_at`.

use crate::message::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{MemberRole, MemberRow};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Membership state for one user in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub channel_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub online: bool,
    /// Unix milliseconds.
    pub last_seen_at: u64,
}

impl Membership {
    /// Create an online membership seen now.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>, role: MemberRole) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            role,
            online: true,
            last_seen_at: now_millis(),
        }
    }

    /// Convert to the storage row.
    #[must_use]
    pub fn to_row(&self) -> MemberRow {
        MemberRow {
            channel_id: self.channel_id.clone(),
            user_id: self.user_id.clone(),
            role: self.role,
            online: self.online,
            last_seen_at: self.last_seen_at,
        }
    }
}

impl From<MemberRow> for Membership {
    fn from(row: MemberRow) -> Self {
        Self {
            channel_id: row.channel_id,
            user_id: row.user_id,
            role: row.role,
            online: row.online,
            last_seen_at: row.last_seen_at,
        }
    }
}

type MemberKey = (String, String);

fn key(channel_id: &str, user_id: &str) -> MemberKey {
    (channel_id.to_string(), user_id.to_string())
}

/// Roster of channel members.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    members: DashMap<MemberKey, Membership>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across all channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Get a membership row.
    #[must_use]
    pub fn get(&self, channel_id: &str, user_id: &str) -> Option<Membership> {
        self.members
            .get(&key(channel_id, user_id))
            .map(|entry| entry.value().clone())
    }

    /// Insert an online membership, or mark an existing one online.
    ///
    /// `role` only applies when the row is created. Returns the resulting row.
    pub fn upsert(&self, channel_id: &str, user_id: &str, role: MemberRole) -> Membership {
        let now = now_millis();
        match self.members.entry(key(channel_id, user_id)) {
            Entry::Occupied(mut entry) => {
                let member = entry.get_mut();
                member.online = true;
                member.last_seen_at = member.last_seen_at.max(now);
                trace!(channel = %channel_id, user = %user_id, "Presence: member refreshed");
                member.clone()
            }
            Entry::Vacant(entry) => {
                debug!(channel = %channel_id, user = %user_id, "Presence: member joined");
                entry
                    .insert(Membership::new(channel_id, user_id, role))
                    .value()
                    .clone()
            }
        }
    }

    /// Mark a member offline and refresh its last-seen time.
    ///
    /// Returns the updated row, or `None` if the member is unknown.
    pub fn mark_offline(&self, channel_id: &str, user_id: &str) -> Option<Membership> {
        let mut member = self.members.get_mut(&key(channel_id, user_id))?;
        member.online = false;
        member.last_seen_at = member.last_seen_at.max(now_millis());
        debug!(channel = %channel_id, user = %user_id, "Presence: member offline");
        Some(member.clone())
    }

    /// Apply a row received from the store or the change feed.
    ///
    /// The incoming row wins unless the stored row was seen more recently.
    /// Returns `true` if the registry changed.
    pub fn apply(&self, incoming: Membership) -> bool {
        match self
            .members
            .entry(key(&incoming.channel_id, &incoming.user_id))
        {
            Entry::Occupied(mut entry) => {
                if incoming.last_seen_at < entry.get().last_seen_at {
                    trace!(
                        channel = %incoming.channel_id,
                        user = %incoming.user_id,
                        "Presence: ignoring older row"
                    );
                    return false;
                }
                let changed = *entry.get() != incoming;
                entry.insert(incoming);
                changed
            }
            Entry::Vacant(entry) => {
                entry.insert(incoming);
                true
            }
        }
    }

    /// Members of a channel currently online, ordered by user id.
    #[must_use]
    pub fn online_members(&self, channel_id: &str) -> Vec<Membership> {
        let mut online: Vec<Membership> = self
            .members
            .iter()
            .filter(|entry| entry.channel_id == channel_id && entry.online)
            .map(|entry| entry.value().clone())
            .collect();
        online.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn row(user: &str, online: bool, last_seen_at: u64) -> Membership {
        Membership {
            channel_id: "ws-1".into(),
            user_id: user.into(),
            role: MemberRole::Member,
            online,
            last_seen_at,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let presence = PresenceRegistry::new();

        let first = presence.upsert("ws-1", "u-1", MemberRole::Admin);
        let second = presence.upsert("ws-1", "u-1", MemberRole::Member);

        assert_eq!(presence.len(), 1);
        assert!(second.online);
        // Role is fixed at creation.
        assert_eq!(second.role, MemberRole::Admin);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[test]
    fn test_mark_offline() {
        let presence = PresenceRegistry::new();
        presence.upsert("ws-1", "u-1", MemberRole::Member);
        presence.upsert("ws-1", "u-2", MemberRole::Member);

        let offline = presence.mark_offline("ws-1", "u-1").unwrap();
        assert!(!offline.online);
        assert!(presence.mark_offline("ws-1", "u-9").is_none());

        let online = presence.online_members("ws-1");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, "u-2");
        // The row is kept.
        assert_eq!(presence.len(), 2);
    }

    #[test]
    fn test_apply_last_write_wins() {
        let presence = PresenceRegistry::new();

        assert!(presence.apply(row("u-1", true, 100)));
        assert!(!presence.apply(row("u-1", false, 50)));
        assert!(presence.get("ws-1", "u-1").unwrap().online);

        assert!(presence.apply(row("u-1", false, 150)));
        assert!(!presence.get("ws-1", "u-1").unwrap().online);
        // Same row again: no change.
        assert!(!presence.apply(row("u-1", false, 150)));
    }

    #[test]
    fn test_online_members_scoped_by_channel() {
        let presence = PresenceRegistry::new();
        presence.upsert("ws-1", "u-b", MemberRole::Member);
        presence.upsert("ws-1", "u-a", MemberRole::Member);
        presence.upsert("ws-2", "u-c", MemberRole::Member);

        let ids: Vec<String> = presence
            .online_members("ws-1")
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(ids, vec!["u-a".to_string(), "u-b".to_string()]);
    }

    #[test]
    fn test_concurrent_upserts_converge() {
        let presence = Arc::new(PresenceRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let presence = Arc::clone(&presence);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        presence.upsert("ws-1", "u-1", MemberRole::Member);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(presence.len(), 1);
        assert!(presence.get("ws-1", "u-1").unwrap().online);
    }
}
