//! Per-document publish/subscribe combining the content-change feed and the
//! presence feed behind one subscription handle.
//!
//! The bus republishes every committed write on the document's topic without
//! suppressing the writer's own notification; sessions are responsible for
//! ignoring their own echo. Cursor events flow through the presence channel
//! and the bus maintains the rolling cursor set on behalf of subscribers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    Actor, CursorPosition, CursorRoster, Document, DocumentId, DocumentKind, DocumentStore,
    EntityId, NewDocument, PresenceChannel, Result, StoreError, UserId, DEFAULT_PRESENCE_TIMEOUT,
};

const TOPIC_CAPACITY: usize = 64;

pub struct SyncBus {
    store: Arc<DocumentStore>,
    topics: DashMap<DocumentId, broadcast::Sender<Document>>,
    presence: PresenceChannel,
    presence_timeout: Duration,
    #[cfg(test)]
    write_faults: std::sync::atomic::AtomicU32,
}

impl SyncBus {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self::with_presence_timeout(store, DEFAULT_PRESENCE_TIMEOUT)
    }

    pub fn with_presence_timeout(store: Arc<DocumentStore>, presence_timeout: Duration) -> Self {
        Self {
            store,
            topics: DashMap::new(),
            presence: PresenceChannel::new(),
            presence_timeout,
            #[cfg(test)]
            write_faults: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Make the next `n` writes fail with a retryable storage error.
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&self, n: u32) {
        self.write_faults
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_write_fault(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let armed = self
            .write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "storage offline",
            ))
            .into());
        }
        Ok(())
    }

    fn topic(&self, document_id: DocumentId) -> broadcast::Sender<Document> {
        self.topics
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn fetch(&self, document_id: DocumentId) -> Result<Document> {
        Ok(self.store.get(document_id)?)
    }

    /// Find the document linked to `entity`, creating it on first open.
    ///
    /// A racing creator that loses to the UNIQUE constraint resolves to the
    /// winner's document, so concurrent first opens converge on one record.
    pub fn fetch_or_create_for_entity(&self, entity: &EntityId, actor: &Actor) -> Result<Document> {
        match self.store.get_by_linked_entity(entity) {
            Ok(doc) => Ok(doc),
            Err(StoreError::NotFound) => {
                let created = self.store.create(NewDocument {
                    title: format!("Notes for {entity}"),
                    kind: DocumentKind::FreeText,
                    created_by: actor.user_id,
                    linked_entity_id: Some(entity.clone()),
                });
                match created {
                    Ok(doc) => Ok(doc),
                    Err(StoreError::AlreadyLinked(_)) => {
                        Ok(self.store.get_by_linked_entity(entity)?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register `user` as a participant and return its first-join index,
    /// which determines the cursor colour.
    pub fn join(&self, document_id: DocumentId, user: UserId) -> Result<usize> {
        self.store.add_participant(document_id, user)?;
        let participants = self.store.participants(document_id)?;
        let index = participants.iter().position(|p| *p == user).unwrap_or(0);
        Ok(index)
    }

    /// Compare-and-set write followed by a republish of the committed
    /// document. On conflict nothing is published and the caller must
    /// re-fetch to converge.
    pub fn write(
        &self,
        document_id: DocumentId,
        content: &str,
        writer: UserId,
        expected_version: u64,
    ) -> Result<u64> {
        #[cfg(test)]
        self.take_write_fault()?;
        let new_version = self
            .store
            .write(document_id, content, writer, expected_version)?;
        match self.store.get(document_id) {
            Ok(doc) => {
                let _ = self.topic(document_id).send(doc);
            }
            Err(e) => warn!(document = %document_id, error = %e, "republish fetch failed"),
        }
        Ok(new_version)
    }

    /// Subscribe to one document's content and presence feeds.
    ///
    /// Performs an initial full fetch so the caller starts from a known
    /// version. `on_document` fires on every stored-version change,
    /// including ones caused by the subscriber's own writes; `on_cursors`
    /// delivers the pruned rolling cursor set on every presence event and
    /// on the periodic prune tick.
    pub fn subscribe(
        self: &Arc<Self>,
        document_id: DocumentId,
        on_document: impl Fn(Document) + Send + Sync + 'static,
        on_cursors: impl Fn(Vec<CursorPosition>) + Send + Sync + 'static,
    ) -> Result<(Document, Subscription)> {
        let mut doc_rx = self.topic(document_id).subscribe();
        let mut cursor_rx = self.presence.subscribe(document_id);
        // Receivers first, snapshot second: a commit landing in between is
        // buffered and reaches the callback with a version above the
        // snapshot's, so no version falls through the gap.
        let initial = self.store.get(document_id)?;

        let doc_task = tokio::spawn(async move {
            loop {
                match doc_rx.recv().await {
                    Ok(doc) => on_document(doc),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Whole-document payloads make lost intermediates
                        // harmless; the next event carries the full state.
                        debug!(skipped, "document feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let timeout = self.presence_timeout;
        let cursor_task = tokio::spawn(async move {
            let mut roster = CursorRoster::new(timeout);
            let mut tick = tokio::time::interval(timeout / 2);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    event = cursor_rx.recv() => match event {
                        Ok(cursor) => {
                            roster.observe(cursor);
                            roster.prune(Instant::now());
                            on_cursors(roster.snapshot());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tick.tick() => {
                        if roster.prune(Instant::now()) {
                            on_cursors(roster.snapshot());
                        }
                    }
                }
            }
        });

        debug!(document = %document_id, "bus subscription established");
        Ok((
            initial,
            Subscription {
                document_id,
                bus: Arc::clone(self),
                tasks: vec![doc_task, cursor_task],
            },
        ))
    }
}

/// The single handle an editing session holds per open document.
///
/// Dropping it releases both feed registrations, so no callback outlives the
/// subscriber on any exit path.
pub struct Subscription {
    document_id: DocumentId,
    bus: Arc<SyncBus>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Forward a cursor to the presence channel. Fire-and-forget.
    pub fn send_cursor(&self, cursor: CursorPosition) {
        self.bus.presence.publish(self.document_id, cursor);
    }

    /// Tear down both feed registrations.
    pub fn unsubscribe(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollabError, UserColor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn bus() -> Arc<SyncBus> {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        Arc::new(SyncBus::new(store))
    }

    fn create_doc(bus: &SyncBus, user: UserId) -> Document {
        bus.store
            .create(NewDocument {
                title: "doc".to_string(),
                kind: DocumentKind::FreeText,
                created_by: user,
                linked_entity_id: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_returns_initial_document() {
        let bus = bus();
        let user = UserId::new();
        let doc = create_doc(&bus, user);

        let (initial, sub) = bus.subscribe(doc.id, |_| {}, |_| {}).unwrap();
        assert_eq!(initial.id, doc.id);
        assert_eq!(initial.version, 0);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn write_republishes_to_all_subscribers_including_writer() {
        let bus = bus();
        let user = UserId::new();
        let doc = create_doc(&bus, user);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let (_, sub) = bus
            .subscribe(
                doc.id,
                move |d| seen_clone.lock().unwrap().push(d.version),
                |_| {},
            )
            .unwrap();

        let version = bus.write(doc.id, "hello", user, 0).unwrap();
        assert_eq!(version, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[1]);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn conflicting_write_publishes_nothing() {
        let bus = bus();
        let user = UserId::new();
        let doc = create_doc(&bus, user);
        bus.write(doc.id, "first", user, 0).unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = Arc::clone(&notified);
        let (_, sub) = bus
            .subscribe(
                doc.id,
                move |_| {
                    notified_clone.fetch_add(1, Ordering::SeqCst);
                },
                |_| {},
            )
            .unwrap();

        let err = bus.write(doc.id, "stale", user, 0).unwrap_err();
        assert!(matches!(
            err,
            CollabError::Store(StoreError::Conflict { .. })
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn no_cursor_delivery_after_unsubscribe() {
        let bus = bus();
        let user = UserId::new();
        let doc = create_doc(&bus, user);

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);
        let (_, sub) = bus
            .subscribe(doc.id, |_| {}, move |_| {
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Keep the topic alive with a second subscriber.
        let (_, other) = bus.subscribe(doc.id, |_| {}, |_| {}).unwrap();

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.presence.publish(
            doc.id,
            CursorPosition {
                user_id: UserId::new(),
                user_name: "Bob".to_string(),
                position: 1,
                color: UserColor::for_join_index(1),
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        other.unsubscribe();
    }

    #[tokio::test]
    async fn snapshot_and_feed_cover_every_commit() {
        let bus = bus();
        let user = UserId::new();
        let doc = create_doc(&bus, user);
        let doc_id = doc.id;

        let writer_bus = Arc::clone(&bus);
        let writer = tokio::spawn(async move {
            let mut version = 0;
            for i in 0..40 {
                version = writer_bus
                    .write(doc_id, &format!("rev {i}"), user, version)
                    .unwrap();
                tokio::task::yield_now().await;
            }
        });

        // Subscribing while commits land: every version committed by the
        // time subscribe returns must show up in the snapshot or the feed.
        for _ in 0..8 {
            let seen = Arc::new(Mutex::new(0u64));
            let seen_clone = Arc::clone(&seen);
            let (initial, sub) = bus
                .subscribe(
                    doc_id,
                    move |d| {
                        let mut max = seen_clone.lock().unwrap();
                        if d.version > *max {
                            *max = d.version;
                        }
                    },
                    |_| {},
                )
                .unwrap();
            let floor = bus.fetch(doc_id).unwrap().version;

            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let observed = (*seen.lock().unwrap()).max(initial.version);
                if observed >= floor {
                    break;
                }
                assert!(
                    Instant::now() < deadline,
                    "commit {floor} lost between snapshot and feed"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            sub.unsubscribe();
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_or_create_is_idempotent_per_entity() {
        let bus = bus();
        let actor = Actor::new(UserId::new(), "Alice");
        let entity = EntityId::from("task-42");

        let first = bus.fetch_or_create_for_entity(&entity, &actor).unwrap();
        let second = bus.fetch_or_create_for_entity(&entity, &actor).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn join_assigns_stable_indices() {
        let bus = bus();
        let creator = UserId::new();
        let doc = create_doc(&bus, creator);

        let alice = UserId::new();
        let bob = UserId::new();
        assert_eq!(bus.join(doc.id, alice).unwrap(), 0);
        assert_eq!(bus.join(doc.id, bob).unwrap(), 1);
        // Re-joining keeps the original index.
        assert_eq!(bus.join(doc.id, alice).unwrap(), 0);
    }
}
