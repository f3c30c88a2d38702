//! Room history reconciliation.
//!
//! Each pass refreshes backend state, pulls one backward page of the active
//! room, renders it, and redraws the whole log only when the rendered result
//! differs from the cached one.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::events::{SyncBatch, TimelineEvent};
use crate::interactive::UiHandle;

/// Maximum number of rendered messages kept and displayed.
pub const HISTORY_CAPACITY: usize = 200;

/// Events requested per history page.
pub const HISTORY_PAGE_SIZE: u32 = 200;

/// A message as displayed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedMessage {
    Text {
        sender: String,
        body: String,
    },
    Image {
        sender: String,
        filename: String,
        url: String,
        /// Downloaded image bytes; `None` when the download failed.
        preview: Option<Arc<Vec<u8>>>,
    },
    File {
        sender: String,
        filename: String,
        url: String,
    },
}

impl RenderedMessage {
    /// One-line plain text rendering.
    pub fn line(&self) -> String {
        match self {
            RenderedMessage::Text { sender, body } => format!("{sender}: {body}"),
            RenderedMessage::Image {
                sender, filename, ..
            } => format!("{sender}: [image] {filename}"),
            RenderedMessage::File {
                sender, filename, ..
            } => format!("{sender}: [file] {filename}"),
        }
    }

    /// Content locator for messages offering a download.
    pub fn download_url(&self) -> Option<&str> {
        match self {
            RenderedMessage::Text { .. } => None,
            RenderedMessage::Image { url, .. } | RenderedMessage::File { url, .. } => Some(url),
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            RenderedMessage::Text { .. } => None,
            RenderedMessage::Image { filename, .. } | RenderedMessage::File { filename, .. } => {
                Some(filename)
            }
        }
    }
}

/// The last rendered snapshot, bounded to a fixed capacity.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<RenderedMessage>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<RenderedMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn matches(&self, messages: &[RenderedMessage]) -> bool {
        self.entries.len() == messages.len() && self.entries.iter().eq(messages.iter())
    }

    /// Replace the whole snapshot, keeping only the newest `capacity` entries.
    fn replace(&mut self, messages: Vec<RenderedMessage>) {
        self.entries.clear();
        self.entries.extend(messages);

        let overflow = self.entries.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.entries.drain(..overflow);
        }
    }

    fn trim_to_capacity(&self, mut messages: Vec<RenderedMessage>) -> Vec<RenderedMessage> {
        let overflow = messages.len().saturating_sub(self.capacity);
        if overflow > 0 {
            messages.drain(..overflow);
        }
        messages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// No room is active; only the sync ran.
    NoRoom,
    Unchanged,
    Redrawn,
    /// The active room changed while the page was in flight.
    Discarded,
    /// The sync succeeded but the history fetch failed.
    Failed,
}

/// What one pass produced. The sync batch is kept even when the history
/// fetch fails so inbound events are not lost.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub batch: SyncBatch,
    pub outcome: PassOutcome,
}

pub struct HistoryReconciler {
    backend: Rc<dyn Backend>,
    ui: UiHandle,
    active_room: RefCell<Option<String>>,
    /// Serializes passes; guards the cached snapshot.
    log: Mutex<MessageLog>,
    /// Preview outcome per image url; `None` records a failed download.
    previews: RefCell<HashMap<String, Option<Arc<Vec<u8>>>>>,
    sync_timeout_ms: u64,
    page_size: u32,
    last_error: RefCell<Option<String>>,
    failures: Cell<u64>,
    redraws: Cell<u64>,
}

impl HistoryReconciler {
    pub fn new(
        backend: Rc<dyn Backend>,
        ui: UiHandle,
        sync_timeout_ms: u64,
        page_size: u32,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            ui,
            active_room: RefCell::new(None),
            log: Mutex::new(MessageLog::new(capacity)),
            previews: RefCell::new(HashMap::new()),
            sync_timeout_ms,
            page_size,
            last_error: RefCell::new(None),
            failures: Cell::new(0),
            redraws: Cell::new(0),
        }
    }

    pub fn active_room(&self) -> Option<String> {
        self.active_room.borrow().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    pub fn redraws(&self) -> u64 {
        self.redraws.get()
    }

    pub async fn snapshot(&self) -> Vec<RenderedMessage> {
        self.log.lock().await.to_vec()
    }

    /// Make `room_id` the active room and blank the displayed log. An
    /// in-flight pass for the previous room sees the change and discards
    /// its result.
    pub async fn select_room(&self, room_id: &str) {
        *self.active_room.borrow_mut() = Some(room_id.to_string());
        tracing::info!(room_id, "active room changed");

        let mut log = self.log.lock().await;
        log.clear();
        self.previews.borrow_mut().clear();
        let _ = self.ui.redraw_history(Vec::new());
    }

    /// Run one pass, recording any error. Returns `None` when the sync
    /// itself failed.
    pub async fn reconcile(&self) -> Option<PassReport> {
        let mut log = self.log.lock().await;
        let room_id = self.active_room();

        let batch = match self.backend.sync(self.sync_timeout_ms).await {
            Ok(batch) => batch,
            Err(e) => {
                self.record_failure(format!("sync: {e}"));
                return None;
            }
        };

        let Some(room_id) = room_id else {
            return Some(PassReport {
                batch,
                outcome: PassOutcome::NoRoom,
            });
        };

        let chunk = match self
            .backend
            .room_messages(&room_id, &batch.next_batch, self.page_size)
            .await
        {
            Ok(chunk) => chunk,
            Err(e) => {
                self.record_failure(format!("history for {room_id}: {e}"));
                return Some(PassReport {
                    batch,
                    outcome: PassOutcome::Failed,
                });
            }
        };

        let messages = self.render(&chunk).await;

        if self.active_room.borrow().as_deref() != Some(room_id.as_str()) {
            tracing::debug!(room_id, "room changed during fetch, discarding pass");
            return Some(PassReport {
                batch,
                outcome: PassOutcome::Discarded,
            });
        }

        let messages = log.trim_to_capacity(messages);
        self.prune_previews(&messages);

        let outcome = if log.matches(&messages) {
            PassOutcome::Unchanged
        } else {
            log.replace(messages);
            self.redraws.set(self.redraws.get() + 1);
            tracing::debug!(room_id, entries = log.len(), "history changed, redrawing");
            let _ = self.ui.redraw_history(log.to_vec());
            PassOutcome::Redrawn
        };

        Some(PassReport { batch, outcome })
    }

    fn record_failure(&self, message: String) {
        tracing::warn!("reconciliation failed: {message}");
        self.failures.set(self.failures.get() + 1);
        *self.last_error.borrow_mut() = Some(message);
    }

    /// Render a backward page in chronological order.
    async fn render(&self, chunk: &[TimelineEvent]) -> Vec<RenderedMessage> {
        let mut messages = Vec::with_capacity(chunk.len());

        for ev in chunk.iter().rev() {
            if ev.event_type != "m.room.message" {
                continue;
            }
            let sender = localpart(&ev.sender).to_string();
            let body = ev.content_str("body").unwrap_or_default().to_string();
            let url = ev.content_str("url");

            match (ev.msgtype(), url) {
                (Some("m.text" | "m.notice"), _) => {
                    messages.push(RenderedMessage::Text { sender, body });
                }
                (Some("m.image"), Some(url)) => {
                    let preview = self.preview(url).await;
                    messages.push(RenderedMessage::Image {
                        sender,
                        filename: body,
                        url: url.to_string(),
                        preview,
                    });
                }
                (Some("m.file"), Some(url)) => {
                    messages.push(RenderedMessage::File {
                        sender,
                        filename: body,
                        url: url.to_string(),
                    });
                }
                _ => {}
            }
        }

        messages
    }

    /// Downloaded image bytes, memoised per url. A failed download is
    /// memoised too and only retried after a room switch or once the image
    /// has left the log.
    async fn preview(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(memo) = self.previews.borrow().get(url) {
            return memo.clone();
        }
        let preview = match self.backend.download(url).await {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                tracing::debug!(url, "image preview unavailable: {e}");
                None
            }
        };
        self.previews
            .borrow_mut()
            .insert(url.to_string(), preview.clone());
        preview
    }

    fn prune_previews(&self, messages: &[RenderedMessage]) {
        let live: HashSet<&str> = messages
            .iter()
            .filter_map(|m| match m {
                RenderedMessage::Image { url, .. } => Some(url.as_str()),
                _ => None,
            })
            .collect();
        self.previews
            .borrow_mut()
            .retain(|url, _| live.contains(url.as_str()));
    }
}

/// `@alice:example.org` → `@alice`.
fn localpart(user_id: &str) -> &str {
    user_id.split(':').next().unwrap_or(user_id)
}
