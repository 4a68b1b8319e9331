//! Cursor presence: ephemeral, best-effort, never persisted.
//!
//! Cursors are high-frequency and tolerant of loss, so they bypass the
//! durable write path entirely and fan out on per-document broadcast
//! topics. A subscriber that has not seen a user's cursor within the
//! presence timeout treats that user as gone; eviction is a client-side
//! heuristic, not a server contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{DocumentId, UserId};

/// Default window after which an unseen participant's cursor is evicted.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(10);

const TOPIC_CAPACITY: usize = 256;

/// Colour assigned to a participant for cursor highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

const PALETTE: [UserColor; 8] = [
    UserColor::new(0x2f, 0x81, 0xf7),
    UserColor::new(0xe3, 0x52, 0x4d),
    UserColor::new(0x2e, 0xa0, 0x43),
    UserColor::new(0xd2, 0x99, 0x22),
    UserColor::new(0x89, 0x57, 0xe5),
    UserColor::new(0x1b, 0x9e, 0xa3),
    UserColor::new(0xd9, 0x5a, 0xb0),
    UserColor::new(0xbf, 0x56, 0x1d),
];

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Palette colour for the given first-join index. Join order is stable
    /// per document, so the same participant keeps the same colour across
    /// sessions.
    pub fn for_join_index(index: usize) -> Self {
        PALETTE[index % PALETTE.len()]
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// A participant's cursor inside a document. Ephemeral; discarded when the
/// owning session unsubscribes or goes stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub user_id: UserId,
    pub user_name: String,
    /// Offset into the document content.
    pub position: usize,
    pub color: UserColor,
}

/// Per-document fan-out of cursor events to all current subscribers.
///
/// No ordering or delivery guarantee beyond "eventually, if the link is up";
/// publish is fire-and-forget and a lagging subscriber simply misses events.
pub struct PresenceChannel {
    topics: DashMap<DocumentId, broadcast::Sender<CursorPosition>>,
}

impl PresenceChannel {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn topic(&self, document_id: DocumentId) -> broadcast::Sender<CursorPosition> {
        self.topics
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Fire-and-forget publish. A topic with no subscribers drops the event.
    pub fn publish(&self, document_id: DocumentId, cursor: CursorPosition) {
        let _ = self.topic(document_id).send(cursor);
    }

    pub fn subscribe(&self, document_id: DocumentId) -> broadcast::Receiver<CursorPosition> {
        self.topic(document_id).subscribe()
    }
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling set of last-seen cursors for one document, pruned by staleness.
pub struct CursorRoster {
    seen: HashMap<UserId, (CursorPosition, Instant)>,
    timeout: Duration,
}

impl CursorRoster {
    pub fn new(timeout: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            timeout,
        }
    }

    pub fn observe(&mut self, cursor: CursorPosition) {
        self.seen.insert(cursor.user_id, (cursor, Instant::now()));
    }

    /// Evict cursors not refreshed within the timeout as of `now`. Returns
    /// true when anything was removed.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.seen.len();
        let timeout = self.timeout;
        self.seen
            .retain(|_, (_, observed)| now.duration_since(*observed) < timeout);
        self.seen.len() != before
    }

    /// Current cursors, ordered by user id for a stable presentation.
    pub fn snapshot(&self) -> Vec<CursorPosition> {
        let mut cursors: Vec<_> = self.seen.values().map(|(c, _)| c.clone()).collect();
        cursors.sort_by_key(|c| c.user_id.0);
        cursors
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(user_id: UserId, position: usize) -> CursorPosition {
        CursorPosition {
            user_id,
            user_name: "Alice".to_string(),
            position,
            color: UserColor::for_join_index(0),
        }
    }

    #[test]
    fn color_hex_format() {
        let color = UserColor::new(0x2f, 0x81, 0xf7);
        assert_eq!(color.to_hex(), "#2F81F7");
    }

    #[test]
    fn join_index_wraps_palette() {
        assert_eq!(UserColor::for_join_index(0), UserColor::for_join_index(8));
        assert_ne!(UserColor::for_join_index(0), UserColor::for_join_index(1));
    }

    #[test]
    fn roster_keeps_latest_cursor_per_user() {
        let user = UserId::new();
        let mut roster = CursorRoster::new(Duration::from_secs(10));
        roster.observe(cursor(user, 3));
        roster.observe(cursor(user, 7));

        let snapshot = roster.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].position, 7);
    }

    #[test]
    fn roster_evicts_stale_cursors() {
        let mut roster = CursorRoster::new(Duration::from_millis(50));
        roster.observe(cursor(UserId::new(), 0));

        assert!(!roster.prune(Instant::now()));
        assert!(roster.prune(Instant::now() + Duration::from_millis(100)));
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let channel = PresenceChannel::new();
        let doc = DocumentId::new();
        let mut rx = channel.subscribe(doc);

        let user = UserId::new();
        channel.publish(doc, cursor(user, 5));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, user);
        assert_eq!(received.position, 5);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let channel = PresenceChannel::new();
        channel.publish(DocumentId::new(), cursor(UserId::new(), 0));
    }
}
