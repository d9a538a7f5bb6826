//! Ordered message log for one channel.
//!
//! The log merges optimistic entries (rendered before the store confirms
//! them) with confirmed entries arriving from history, the change feed, or
//! the direct write response. It holds at most one entry per server id and
//! never moves an entry once it is placed: a confirmed message replaces its
//! optimistic counterpart in the same slot.

use crate::message::{Message, MessageId};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Outcome of merging a confirmed message into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// An optimistic entry was replaced in place.
    Replaced { index: usize },
    /// The server id was already present; nothing changed.
    Duplicate,
    /// No optimistic counterpart; appended at the tail.
    Appended { index: usize },
}

/// The message log of one channel.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    /// Ids of confirmed entries.
    confirmed: HashSet<MessageId>,
}

impl MessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, optimistic ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in display order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.iter().find(|m| m.id == id)
    }

    /// Position of an entry by id.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }

    /// Number of entries still awaiting confirmation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|m| m.optimistic).count()
    }

    /// Whether a confirmed entry with this server id is present.
    #[must_use]
    pub fn contains_confirmed(&self, id: &str) -> bool {
        self.confirmed.contains(id)
    }

    /// Insert at the tail and return the entry id as a handle for later resolution.
    ///
    /// A confirmed message whose id is already present is not inserted again.
    pub fn append(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        if message.is_confirmed() && !self.confirmed.insert(id.clone()) {
            trace!(message = %id, "Skipping duplicate append");
            return id;
        }
        self.entries.push(message);
        id
    }

    /// Load bootstrap history, ordered by creation time ascending.
    ///
    /// Returns the number of entries added.
    pub fn load_history(&mut self, mut history: Vec<Message>) -> usize {
        history.sort_by_key(|m| m.created_at);
        let before = self.entries.len();
        for message in history {
            self.append(message);
        }
        self.entries.len() - before
    }

    /// Merge a confirmed message delivered by the change feed.
    ///
    /// Matching order: an already-confirmed id is a duplicate; a row carrying
    /// a correlation id replaces the optimistic entry with that temporary id;
    /// a row without one falls back to the earliest optimistic entry with the
    /// same sender and content.
    pub fn reconcile(&mut self, confirmed: Message) -> Reconciliation {
        if self.confirmed.contains(&confirmed.id) {
            debug!(message = %confirmed.id, "Ignoring duplicate delivery");
            return Reconciliation::Duplicate;
        }

        let slot = match confirmed.correlation_id.as_deref() {
            Some(correlation) => self.pending_position(correlation),
            None => self.entries.iter().position(|m| {
                m.optimistic && m.sender_id == confirmed.sender_id && m.content == confirmed.content
            }),
        };

        match slot {
            Some(index) => self.replace_at(index, confirmed),
            None => self.push_confirmed(confirmed),
        }
    }

    /// Merge the direct write response for the optimistic entry `handle`.
    pub fn resolve(&mut self, handle: &str, confirmed: Message) -> Reconciliation {
        if self.confirmed.contains(&confirmed.id) {
            debug!(message = %confirmed.id, handle = %handle, "Write response already reconciled");
            return Reconciliation::Duplicate;
        }

        match self.pending_position(handle) {
            Some(index) => self.replace_at(index, confirmed),
            None => self.push_confirmed(confirmed),
        }
    }

    /// Drop an unconfirmed entry after a failed send.
    ///
    /// Confirmed entries are never removed.
    pub fn remove_optimistic(&mut self, id: &str) -> Option<Message> {
        let index = self.pending_position(id)?;
        Some(self.entries.remove(index))
    }

    /// Drop every unconfirmed entry. Returns how many were dropped.
    pub fn drop_pending(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| !m.optimistic);
        before - self.entries.len()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.confirmed.clear();
    }

    fn pending_position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.optimistic && m.id == id)
    }

    fn replace_at(&mut self, index: usize, mut confirmed: Message) -> Reconciliation {
        confirmed.optimistic = false;
        trace!(
            from = %self.entries[index].id,
            to = %confirmed.id,
            index,
            "Replacing optimistic entry"
        );
        self.confirmed.insert(confirmed.id.clone());
        self.entries[index] = confirmed;
        Reconciliation::Replaced { index }
    }

    fn push_confirmed(&mut self, mut confirmed: Message) -> Reconciliation {
        confirmed.optimistic = false;
        self.confirmed.insert(confirmed.id.clone());
        self.entries.push(confirmed);
        Reconciliation::Appended {
            index: self.entries.len() - 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::MessageKind;

    fn confirmed(id: &str, sender: &str, content: &str, correlation: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            channel_id: "ws-1".into(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            created_at: 10,
            correlation_id: correlation.map(str::to_string),
            optimistic: false,
        }
    }

    fn pending(temp: &str, sender: &str, content: &str) -> Message {
        Message::optimistic(temp, "ws-1", sender, sender, content)
    }

    #[test]
    fn test_feed_echo_replaces_optimistic() {
        let mut log = MessageLog::new();
        log.append(pending("temp_a", "u-1", "hello"));
        assert_eq!(log.len(), 1);
        assert!(log.messages()[0].optimistic);

        // Legacy echo without a correlation id: matched by sender + content.
        let outcome = log.reconcile(confirmed("42", "u-1", "hello", None));
        assert_eq!(outcome, Reconciliation::Replaced { index: 0 });
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].id, "42");
        assert!(!log.messages()[0].optimistic);
    }

    #[test]
    fn test_uncorrelated_echo_takes_earliest_match() {
        let mut log = MessageLog::new();
        log.append(pending("temp_a", "u-1", "ok"));
        log.append(pending("temp_b", "u-1", "ok"));

        let outcome = log.reconcile(confirmed("42", "u-1", "ok", None));
        assert_eq!(outcome, Reconciliation::Replaced { index: 0 });
        assert_eq!(log.messages()[0].id, "42");
        assert!(!log.messages()[0].optimistic);
        assert_eq!(log.messages()[1].id, "temp_b");
        assert!(log.messages()[1].optimistic);
        assert_eq!(log.pending_count(), 1);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut log = MessageLog::new();
        assert_eq!(
            log.reconcile(confirmed("7", "u-2", "hey", None)),
            Reconciliation::Appended { index: 0 }
        );
        assert_eq!(log.reconcile(confirmed("7", "u-2", "hey", None)), Reconciliation::Duplicate);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_reconcile_keeps_position() {
        let mut log = MessageLog::new();
        log.append(confirmed("1", "u-2", "first", None));
        log.append(pending("temp_a", "u-1", "mine"));
        log.reconcile(confirmed("2", "u-3", "someone else", None));

        let outcome = log.reconcile(confirmed("3", "u-1", "mine", Some("temp_a")));
        assert_eq!(outcome, Reconciliation::Replaced { index: 1 });

        let ids: Vec<&str> = log.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
    }

    #[test]
    fn test_correlation_disambiguates_identical_content() {
        let mut log = MessageLog::new();
        log.append(pending("temp_a", "u-1", "ok"));
        log.append(pending("temp_b", "u-1", "ok"));

        // The second send is confirmed first.
        log.reconcile(confirmed("11", "u-1", "ok", Some("temp_b")));
        assert_eq!(log.messages()[0].id, "temp_a");
        assert_eq!(log.messages()[1].id, "11");

        log.reconcile(confirmed("10", "u-1", "ok", Some("temp_a")));
        let ids: Vec<&str> = log.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "11"]);
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn test_unknown_correlation_appends() {
        let mut log = MessageLog::new();
        log.append(pending("temp_a", "u-1", "same"));

        // Another tab of the same user sent identical content.
        let outcome = log.reconcile(confirmed("5", "u-1", "same", Some("temp_other_tab")));
        assert_eq!(outcome, Reconciliation::Appended { index: 1 });
        assert!(log.messages()[0].optimistic);
    }

    #[test]
    fn test_resolve_then_feed_echo() {
        let mut log = MessageLog::new();
        let handle = log.append(pending("temp_a", "u-1", "hi"));

        assert_eq!(
            log.resolve(&handle, confirmed("9", "u-1", "hi", Some("temp_a"))),
            Reconciliation::Replaced { index: 0 }
        );
        assert_eq!(
            log.reconcile(confirmed("9", "u-1", "hi", Some("temp_a"))),
            Reconciliation::Duplicate
        );
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_feed_echo_then_resolve() {
        let mut log = MessageLog::new();
        let handle = log.append(pending("temp_a", "u-1", "hi"));

        log.reconcile(confirmed("9", "u-1", "hi", Some("temp_a")));
        assert_eq!(
            log.resolve(&handle, confirmed("9", "u-1", "hi", Some("temp_a"))),
            Reconciliation::Duplicate
        );
        assert_eq!(log.len(), 1);
        assert!(log.contains_confirmed("9"));
    }

    #[test]
    fn test_remove_optimistic() {
        let mut log = MessageLog::new();
        log.append(confirmed("1", "u-2", "kept", None));
        let handle = log.append(pending("temp_a", "u-1", "lost"));

        assert!(log.remove_optimistic(&handle).is_some());
        assert!(log.remove_optimistic(&handle).is_none());
        // Confirmed entries cannot be removed this way.
        assert!(log.remove_optimistic("1").is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_load_history_orders_by_creation() {
        let mut log = MessageLog::new();
        let mut late = confirmed("2", "u-1", "late", None);
        late.created_at = 200;
        let mut early = confirmed("1", "u-2", "early", None);
        early.created_at = 100;

        let added = log.load_history(vec![late.clone(), early, late]);
        assert_eq!(added, 2);
        assert_eq!(log.messages()[0].id, "1");
        assert_eq!(log.messages()[1].id, "2");
    }

    #[test]
    fn test_drop_pending_keeps_confirmed() {
        let mut log = MessageLog::new();
        log.append(pending("temp_a", "u-1", "unsent"));
        log.append(confirmed("1", "u-2", "kept", None));
        log.append(pending("temp_b", "u-1", "also unsent"));

        assert_eq!(log.drop_pending(), 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages()[0].id, "1");
        assert_eq!(log.drop_pending(), 0);
    }
}
