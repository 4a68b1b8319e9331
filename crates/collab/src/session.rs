//! The editing session: local echo, debounced saves, and convergence.
//!
//! A session owns one local replica of a document. Keystrokes land in the
//! buffer immediately and a single-slot debounce timer coalesces them into
//! compare-and-set writes. Remote versions arriving while local edits are
//! pending are deferred until the pending write resolves, at which point the
//! version numbers decide who wins.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    Actor, CollabError, ConvergencePolicy, CursorPosition, Document, DocumentId, EntityId,
    Resolution, Result, StoreError, Subscription, SyncBus, UserColor,
};

/// Debounce window between the last keystroke and the save attempt.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

/// Minimum interval between outgoing cursor publishes.
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

/// How to address the document when opening a session.
#[derive(Debug, Clone)]
pub enum DocumentRef {
    Id(DocumentId),
    LinkedEntity(EntityId),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub debounce: Duration,
    pub cursor_min_interval: Duration,
    pub max_save_attempts: u32,
    pub retry_backoff: Duration,
    pub policy: ConvergencePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            cursor_min_interval: DEFAULT_CURSOR_INTERVAL,
            max_save_attempts: 5,
            retry_backoff: Duration::from_millis(250),
            policy: ConvergencePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Loading,
    Editing,
    /// Terminal. Recovery requires opening a fresh session.
    Failed,
}

/// User-visible persistence indicator for the local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Saved,
    Dirty,
    Saving,
    Retrying,
    Failed,
}

/// One-directional observer feed. The UI holds the receiver; the session
/// holds no back-reference.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ContentReplaced { content: String, version: u64 },
    SaveStateChanged(SaveState),
    CursorsUpdated(Vec<CursorPosition>),
    StatusChanged(SessionStatus),
}

enum SaveOutcome {
    Committed(u64),
    Adopted { content: String, version: u64 },
    Failed(CollabError),
}

struct SessionState {
    content: String,
    version: u64,
    status: SessionStatus,
    save_state: SaveState,
    /// Local edits not yet snapshotted by a save.
    dirty: bool,
    in_flight: bool,
    deferred_remote: Option<Document>,
    remote_cursors: Vec<CursorPosition>,
    debounce: Option<JoinHandle<()>>,
    last_cursor_sent: Option<Instant>,
    closed: bool,
}

struct Inner {
    bus: Arc<SyncBus>,
    document_id: DocumentId,
    actor: Actor,
    color: UserColor,
    config: SessionConfig,
    state: Mutex<SessionState>,
    subscription: Mutex<Option<Subscription>>,
    events: broadcast::Sender<SessionEvent>,
}

pub struct EditingSession {
    inner: Arc<Inner>,
}

impl EditingSession {
    /// Resolve the document, join it, and subscribe. Any failure before the
    /// session is handed out tears the partial setup down via `Drop`.
    pub async fn open(
        bus: Arc<SyncBus>,
        doc_ref: DocumentRef,
        actor: Actor,
        config: SessionConfig,
    ) -> Result<EditingSession> {
        let document = match &doc_ref {
            DocumentRef::Id(id) => bus.fetch(*id)?,
            DocumentRef::LinkedEntity(entity) => bus.fetch_or_create_for_entity(entity, &actor)?,
        };
        let join_index = bus.join(document.id, actor.user_id)?;
        let color = UserColor::for_join_index(join_index);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            bus: Arc::clone(&bus),
            document_id: document.id,
            actor,
            color,
            config,
            state: Mutex::new(SessionState {
                content: document.content,
                version: document.version,
                status: SessionStatus::Loading,
                save_state: SaveState::Saved,
                dirty: false,
                in_flight: false,
                deferred_remote: None,
                remote_cursors: Vec::new(),
                debounce: None,
                last_cursor_sent: None,
                closed: false,
            }),
            subscription: Mutex::new(None),
            events,
        });

        let doc_inner = Arc::downgrade(&inner);
        let cur_inner = Arc::downgrade(&inner);
        let own_user = inner.actor.user_id;
        let (initial, subscription) = bus.subscribe(
            document.id,
            move |doc| {
                if let Some(inner) = doc_inner.upgrade() {
                    inner.handle_remote_document(doc);
                }
            },
            move |cursors| {
                if let Some(inner) = cur_inner.upgrade() {
                    let remote: Vec<_> = cursors
                        .into_iter()
                        .filter(|c| c.user_id != own_user)
                        .collect();
                    inner.handle_remote_cursors(remote);
                }
            },
        )?;

        {
            let mut st = inner.state_lock();
            // The callbacks are already live, so a remote commit may have
            // been adopted before we get here. Never step backwards.
            if initial.version > st.version {
                st.content = initial.content;
                st.version = initial.version;
            }
            st.status = SessionStatus::Editing;
        }
        *lock_recover(&inner.subscription) = Some(subscription);

        info!(document = %inner.document_id, user = %inner.actor.user_id, "session opened");
        Ok(EditingSession { inner })
    }

    /// Apply a keystroke: immediate local echo, re-armed debounce, throttled
    /// cursor publish. Never blocks on an in-flight write.
    pub fn on_keystroke(&self, new_content: String, cursor_offset: usize) -> Result<()> {
        let inner = &self.inner;
        let marked_dirty;
        {
            let mut st = inner.state_lock();
            if st.closed {
                return Err(CollabError::SessionClosed);
            }
            st.content = new_content;
            st.dirty = true;
            marked_dirty = !st.in_flight;
            if marked_dirty {
                st.save_state = SaveState::Dirty;
            }

            if let Some(handle) = st.debounce.take() {
                handle.abort();
            }
            let weak = Arc::downgrade(inner);
            let debounce = inner.config.debounce;
            st.debounce = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Some(inner) = weak.upgrade() {
                    // Detached so that aborting the debounce slot can never
                    // cancel a write already underway.
                    Inner::try_begin_save(&inner);
                }
            }));
        }
        if marked_dirty {
            inner.emit(SessionEvent::SaveStateChanged(SaveState::Dirty));
        }

        self.move_cursor(cursor_offset);
        Ok(())
    }

    /// Publish the local cursor, dropped when inside the throttle window.
    pub fn move_cursor(&self, offset: usize) {
        let inner = &self.inner;
        {
            let mut st = inner.state_lock();
            if st.closed {
                return;
            }
            let now = Instant::now();
            if let Some(last) = st.last_cursor_sent {
                if now.duration_since(last) < inner.config.cursor_min_interval {
                    return;
                }
            }
            st.last_cursor_sent = Some(now);
        }
        let cursor = CursorPosition {
            user_id: inner.actor.user_id,
            user_name: inner.actor.user_name.clone(),
            position: offset,
            color: inner.color,
        };
        if let Some(sub) = lock_recover(&inner.subscription).as_ref() {
            sub.send_cursor(cursor);
        }
    }

    /// Force an immediate save of the current buffer, bypassing the
    /// debounce. No-op when the buffer is clean.
    pub fn flush(&self) {
        let dirty = {
            let mut st = self.inner.state_lock();
            if st.closed {
                return;
            }
            if let Some(handle) = st.debounce.take() {
                handle.abort();
            }
            st.dirty
        };
        if dirty {
            Inner::try_begin_save(&self.inner);
        }
    }

    /// Cancel the pending debounce and release the subscription. An
    /// in-flight write runs to completion; its result is discarded.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut st = self.inner.state_lock();
            if st.closed {
                return;
            }
            st.closed = true;
            if let Some(handle) = st.debounce.take() {
                handle.abort();
            }
        }
        if let Some(sub) = lock_recover(&self.inner.subscription).take() {
            sub.unsubscribe();
        }
        info!(document = %self.inner.document_id, "session closed");
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.document_id
    }

    pub fn color(&self) -> UserColor {
        self.inner.color
    }

    pub fn content(&self) -> String {
        self.inner.state_lock().content.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.state_lock().version
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state_lock().status
    }

    pub fn save_state(&self) -> SaveState {
        self.inner.state_lock().save_state
    }

    pub fn remote_cursors(&self) -> Vec<CursorPosition> {
        self.inner.state_lock().remote_cursors.clone()
    }
}

impl Drop for EditingSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn state_lock(&self) -> MutexGuard<'_, SessionState> {
        lock_recover(&self.state)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Start a save unless one is already running; a running save picks the
    /// dirty buffer up again when it settles.
    fn try_begin_save(inner: &Arc<Inner>) {
        let spawn = {
            let mut st = inner.state_lock();
            if st.closed || st.in_flight || !st.dirty {
                false
            } else {
                st.in_flight = true;
                true
            }
        };
        if spawn {
            tokio::spawn(Arc::clone(inner).save_loop());
        }
    }

    /// Runs until the buffer is clean, adopted, or the session has failed.
    /// Holds the session's single in-flight slot for its whole lifetime.
    async fn save_loop(self: Arc<Self>) {
        loop {
            let (content, expected) = {
                let mut st = self.state_lock();
                if st.closed {
                    st.in_flight = false;
                    return;
                }
                st.dirty = false;
                st.save_state = SaveState::Saving;
                (st.content.clone(), st.version)
            };
            self.emit(SessionEvent::SaveStateChanged(SaveState::Saving));

            match self.attempt_save(&content, expected).await {
                SaveOutcome::Committed(version) => {
                    let settled = {
                        let mut st = self.state_lock();
                        if st.closed {
                            st.in_flight = false;
                            return;
                        }
                        if version > st.version {
                            st.version = version;
                        }
                        if st.dirty {
                            // More keystrokes landed while writing; go
                            // around again with the fresh buffer.
                            false
                        } else {
                            if let Some(doc) = st.deferred_remote.take() {
                                if doc.version > st.version {
                                    st.content = doc.content.clone();
                                    st.version = doc.version;
                                    st.in_flight = false;
                                    st.save_state = SaveState::Saved;
                                    drop(st);
                                    self.emit(SessionEvent::ContentReplaced {
                                        content: doc.content,
                                        version: doc.version,
                                    });
                                    self.emit(SessionEvent::SaveStateChanged(SaveState::Saved));
                                    return;
                                }
                            }
                            st.save_state = SaveState::Saved;
                            st.in_flight = false;
                            true
                        }
                    };
                    if settled {
                        debug!(document = %self.document_id, version, "buffer saved");
                        self.emit(SessionEvent::SaveStateChanged(SaveState::Saved));
                        return;
                    }
                }
                SaveOutcome::Adopted { content, version } => {
                    {
                        let mut st = self.state_lock();
                        if st.closed {
                            st.in_flight = false;
                            return;
                        }
                        st.content = content.clone();
                        st.version = version;
                        st.dirty = false;
                        st.deferred_remote = None;
                        st.save_state = SaveState::Saved;
                        st.in_flight = false;
                    }
                    info!(document = %self.document_id, version, "adopted remote content after conflict");
                    self.emit(SessionEvent::ContentReplaced { content, version });
                    self.emit(SessionEvent::SaveStateChanged(SaveState::Saved));
                    return;
                }
                SaveOutcome::Failed(error) => {
                    {
                        let mut st = self.state_lock();
                        st.status = SessionStatus::Failed;
                        st.save_state = SaveState::Failed;
                        st.in_flight = false;
                    }
                    warn!(document = %self.document_id, error = %error, "session failed");
                    self.emit(SessionEvent::SaveStateChanged(SaveState::Failed));
                    self.emit(SessionEvent::StatusChanged(SessionStatus::Failed));
                    return;
                }
            }
        }
    }

    /// One buffer snapshot through the write path: conflicts are resolved by
    /// policy, infrastructure errors retried with linear backoff.
    async fn attempt_save(&self, content: &str, mut expected: u64) -> SaveOutcome {
        let mut attempts: u32 = 0;
        loop {
            match self
                .bus
                .write(self.document_id, content, self.actor.user_id, expected)
            {
                Ok(version) => return SaveOutcome::Committed(version),
                Err(CollabError::Store(StoreError::Conflict {
                    current_version,
                    current_content,
                })) => {
                    debug!(
                        document = %self.document_id,
                        expected,
                        current_version,
                        "write conflict"
                    );
                    match self.config.policy.resolve(current_version, current_content) {
                        Resolution::AdoptRemote { content, version } => {
                            return SaveOutcome::Adopted { content, version }
                        }
                        Resolution::RetryWrite { expected_version } => {
                            expected = expected_version;
                        }
                    }
                }
                Err(error) if error.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.config.max_save_attempts {
                        return SaveOutcome::Failed(error);
                    }
                    warn!(
                        document = %self.document_id,
                        attempt = attempts,
                        error = %error,
                        "save failed, retrying"
                    );
                    {
                        let mut st = self.state_lock();
                        st.save_state = SaveState::Retrying;
                    }
                    self.emit(SessionEvent::SaveStateChanged(SaveState::Retrying));
                    tokio::time::sleep(self.config.retry_backoff * attempts).await;
                }
                Err(error) => return SaveOutcome::Failed(error),
            }
        }
    }

    /// A committed version from the bus. Own echoes arrive here too and are
    /// dropped by the version comparison.
    fn handle_remote_document(&self, doc: Document) {
        let event = {
            let mut st = self.state_lock();
            if st.closed || doc.version <= st.version {
                return;
            }
            if st.dirty || st.in_flight {
                // Keep only the newest; it supersedes earlier deferred ones.
                debug!(document = %self.document_id, version = doc.version, "deferring remote update");
                st.deferred_remote = Some(doc);
                return;
            }
            st.content = doc.content.clone();
            st.version = doc.version;
            SessionEvent::ContentReplaced {
                content: doc.content,
                version: doc.version,
            }
        };
        self.emit(event);
    }

    fn handle_remote_cursors(&self, cursors: Vec<CursorPosition>) {
        {
            let mut st = self.state_lock();
            if st.closed {
                return;
            }
            st.remote_cursors = cursors.clone();
        }
        self.emit(SessionEvent::CursorsUpdated(cursors));
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
