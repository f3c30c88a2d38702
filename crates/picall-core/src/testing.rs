//! In-crate fakes for the backend, shell and media seams.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::LocalBoxFuture;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::backend::Backend;
use crate::bridge::ContextThread;
use crate::errors::PicallError;
use crate::events::{SyncBatch, TimelineEvent, TrackKind};
use crate::history::RenderedMessage;
use crate::interactive::{Shell, Surface, UiHandle, spawn_interactive};
use crate::media::{LocalCapture, MediaBackend, PeerConnection, PeerEvent};
use crate::renderer::{BoxVideoTrack, DisplayImage, VideoFrame, VideoTrack};
use crate::rooms::RoomEntry;
use crate::signaling::{Candidate, INVITE_LIFETIME_MS, Signal};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn rgb_frame(width: u32, height: u32) -> VideoFrame {
    VideoFrame {
        width,
        height,
        rgb: vec![128; width as usize * height as usize * 3],
    }
}

fn event(room_id: &str, sender: &str, event_type: &str, content: Value) -> TimelineEvent {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    TimelineEvent {
        event_id: format!("$ev{seq}"),
        room_id: room_id.into(),
        sender: sender.into(),
        event_type: event_type.into(),
        content,
        age_ms: Some(100),
    }
}

pub fn text_event(room_id: &str, sender: &str, body: &str) -> TimelineEvent {
    event(
        room_id,
        sender,
        "m.room.message",
        json!({ "msgtype": "m.text", "body": body }),
    )
}

pub fn image_event(room_id: &str, sender: &str, filename: &str, url: &str) -> TimelineEvent {
    event(
        room_id,
        sender,
        "m.room.message",
        json!({ "msgtype": "m.image", "body": filename, "url": url }),
    )
}

pub fn file_event(room_id: &str, sender: &str, filename: &str, url: &str) -> TimelineEvent {
    event(
        room_id,
        sender,
        "m.room.message",
        json!({ "msgtype": "m.file", "body": filename, "url": url }),
    )
}

pub fn invite_event(room_id: &str, sender: &str, call_id: &str) -> TimelineEvent {
    let content = Signal::invite(call_id, INVITE_LIFETIME_MS)
        .to_content()
        .unwrap();
    event(room_id, sender, "m.call.invite", content)
}

// ---- backend ----

#[derive(Default)]
pub struct FakeBackend {
    user_id: String,
    logins: RefCell<Vec<String>>,
    syncs: RefCell<VecDeque<Result<SyncBatch, String>>>,
    sync_count: Cell<u64>,
    history: RefCell<HashMap<String, Vec<TimelineEvent>>>,
    history_error: Cell<bool>,
    history_delay: Cell<Option<Duration>>,
    history_requests: Cell<u64>,
    history_in_flight: Cell<u32>,
    max_history_in_flight: Cell<u32>,
    sent: RefCell<Vec<(String, String, Value)>>,
    fail_send: Cell<bool>,
    uploads: RefCell<Vec<(String, String, usize)>>,
    downloads: RefCell<HashMap<String, Vec<u8>>>,
    download_counts: RefCell<HashMap<String, usize>>,
}

impl FakeBackend {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn queue_sync(&self, batch: SyncBatch) {
        self.syncs.borrow_mut().push_back(Ok(batch));
    }

    pub fn fail_next_sync(&self, message: &str) {
        self.syncs.borrow_mut().push_front(Err(message.into()));
    }

    /// History page for `room_id`, newest event first.
    pub fn set_history(&self, room_id: &str, events: Vec<TimelineEvent>) {
        self.history.borrow_mut().insert(room_id.into(), events);
    }

    pub fn fail_history(&self, fail: bool) {
        self.history_error.set(fail);
    }

    pub fn delay_history(&self, delay: Duration) {
        self.history_delay.set(Some(delay));
    }

    pub fn history_requests(&self) -> u64 {
        self.history_requests.get()
    }

    /// Most history requests ever outstanding at the same time.
    pub fn max_history_in_flight(&self) -> u32 {
        self.max_history_in_flight.get()
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.set(fail);
    }

    /// `(room_id, event_type, content)` of every sent event.
    pub fn sent(&self) -> Vec<(String, String, Value)> {
        self.sent.borrow().clone()
    }

    /// `(filename, content_type, size)` of every upload.
    pub fn uploads(&self) -> Vec<(String, String, usize)> {
        self.uploads.borrow().clone()
    }

    pub fn add_download(&self, url: &str, bytes: Vec<u8>) {
        self.downloads.borrow_mut().insert(url.into(), bytes);
    }

    pub fn download_count(&self, url: &str) -> usize {
        self.download_counts.borrow().get(url).copied().unwrap_or(0)
    }

    pub fn logins(&self) -> Vec<String> {
        self.logins.borrow().clone()
    }
}

#[async_trait(?Send)]
impl Backend for FakeBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn login(&self, password: &str) -> Result<(), PicallError> {
        self.logins.borrow_mut().push(password.into());
        Ok(())
    }

    async fn sync(&self, _timeout_ms: u64) -> Result<SyncBatch, PicallError> {
        let n = self.sync_count.get() + 1;
        self.sync_count.set(n);
        let next = self.syncs.borrow_mut().pop_front();
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(PicallError::Http(message)),
            None => Ok(SyncBatch {
                next_batch: format!("s{n}"),
                ..SyncBatch::default()
            }),
        }
    }

    async fn room_messages(
        &self,
        room_id: &str,
        _from: &str,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>, PicallError> {
        self.history_requests.set(self.history_requests.get() + 1);
        let in_flight = self.history_in_flight.get() + 1;
        self.history_in_flight.set(in_flight);
        self.max_history_in_flight
            .set(self.max_history_in_flight.get().max(in_flight));
        if let Some(delay) = self.history_delay.get() {
            tokio::time::sleep(delay).await;
        }
        self.history_in_flight.set(in_flight - 1);
        if self.history_error.get() {
            return Err(PicallError::Http("history unavailable".into()));
        }
        let mut page = self
            .history
            .borrow()
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, PicallError> {
        if self.fail_send.get() {
            return Err(PicallError::Http("send refused".into()));
        }
        let mut sent = self.sent.borrow_mut();
        sent.push((room_id.into(), event_type.into(), content));
        Ok(format!("$sent{}", sent.len()))
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, PicallError> {
        let mut uploads = self.uploads.borrow_mut();
        uploads.push((filename.into(), content_type.into(), data.len()));
        Ok(format!("mxc://example.org/upload{}", uploads.len()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PicallError> {
        *self
            .download_counts
            .borrow_mut()
            .entry(url.into())
            .or_default() += 1;
        self.downloads
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| PicallError::Http(format!("{url} not found")))
    }
}

// ---- shell ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCall {
    RoomDiscovered(String),
    Redraw(Vec<RenderedMessage>),
    ScrollToLatest,
    ShowOverlay,
    RestoreChat,
    Frame(Surface, u32, u32),
    Notice(String, String),
    Confirm(String),
}

type PendingPrompts = Arc<Mutex<VecDeque<oneshot::Sender<bool>>>>;

/// Shell that records every call and leaves prompts open until answered.
pub struct RecordingShell {
    calls: Arc<Mutex<Vec<ShellCall>>>,
    prompts: PendingPrompts,
}

impl RecordingShell {
    fn record(&self, call: ShellCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Shell for RecordingShell {
    fn room_discovered(&mut self, room: &RoomEntry) {
        self.record(ShellCall::RoomDiscovered(room.title.clone()));
    }

    fn redraw_history(&mut self, messages: &[RenderedMessage]) {
        self.record(ShellCall::Redraw(messages.to_vec()));
    }

    fn scroll_to_latest(&mut self) {
        self.record(ShellCall::ScrollToLatest);
    }

    fn show_call_overlay(&mut self) {
        self.record(ShellCall::ShowOverlay);
    }

    fn restore_chat_view(&mut self) {
        self.record(ShellCall::RestoreChat);
    }

    fn show_frame(&mut self, surface: Surface, image: &DisplayImage) {
        self.record(ShellCall::Frame(surface, image.width, image.height));
    }

    fn show_notice(&mut self, title: &str, message: &str) {
        self.record(ShellCall::Notice(title.into(), message.into()));
    }

    fn confirm(&mut self, _title: &str, message: &str) -> LocalBoxFuture<'static, bool> {
        let (tx, rx) = oneshot::channel();
        self.prompts.lock().unwrap().push_back(tx);
        self.record(ShellCall::Confirm(message.into()));
        Box::pin(async move { rx.await.unwrap_or(false) })
    }
}

/// An interactive context running a [`RecordingShell`].
pub struct ShellFixture {
    calls: Arc<Mutex<Vec<ShellCall>>>,
    prompts: PendingPrompts,
    ui: UiHandle,
    thread: ContextThread,
}

impl ShellFixture {
    pub fn spawn() -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let prompts: PendingPrompts = Arc::new(Mutex::new(VecDeque::new()));
        let shell = RecordingShell {
            calls: calls.clone(),
            prompts: prompts.clone(),
        };
        let (ui, thread) = spawn_interactive(move || Box::new(shell) as Box<dyn Shell>).unwrap();
        Self {
            calls,
            prompts,
            ui,
            thread,
        }
    }

    pub fn ui(&self) -> UiHandle {
        self.ui.clone()
    }

    /// Another shell recording into this screen, for contexts spawned elsewhere.
    pub fn shell(&self) -> RecordingShell {
        RecordingShell {
            calls: self.calls.clone(),
            prompts: self.prompts.clone(),
        }
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Answer the oldest open prompt.
    pub fn answer(&self, accept: bool) {
        if let Some(tx) = self.prompts.lock().unwrap().pop_front() {
            let _ = tx.send(accept);
        }
    }

    /// Whether the oldest open prompt has been dropped by its asker.
    pub fn prompt_withdrawn(&self) -> bool {
        self.prompts
            .lock()
            .unwrap()
            .front()
            .is_some_and(|tx| tx.is_closed())
    }

    pub async fn wait_for(&self, pred: impl Fn(&[ShellCall]) -> bool) {
        eventually(|| pred(&self.calls())).await;
    }

    /// Wait until every job submitted so far has run.
    pub async fn settle(&self) {
        let _ = self.ui.context().submit(|_| async {}).await;
    }

    pub fn shutdown(self) {
        self.thread.shutdown();
    }
}

// ---- media ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    PeerCreated,
    CaptureBound(TrackKind),
    CaptureStopped(TrackKind),
    PeerClosed,
    Answer(String),
    RemoteCandidate(String),
    TrackDropped(String),
}

pub type MediaLog = Arc<Mutex<Vec<MediaCall>>>;

fn log_call(log: &MediaLog, call: MediaCall) {
    log.lock().unwrap().push(call);
}

type FrameFeed = mpsc::UnboundedSender<Result<VideoFrame, PicallError>>;

pub struct FakeTrack {
    label: String,
    frames: mpsc::UnboundedReceiver<Result<VideoFrame, PicallError>>,
    log: Option<MediaLog>,
}

impl FakeTrack {
    pub fn channel(label: &str) -> (FrameFeed, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                label: label.into(),
                frames: rx,
                log: None,
            },
        )
    }

    /// Like [`channel`](Self::channel), recording the track's drop in `log`.
    pub fn channel_logged(label: &str, log: MediaLog) -> (FrameFeed, Self) {
        let (tx, mut track) = Self::channel(label);
        track.log = Some(log);
        (tx, track)
    }
}

#[async_trait(?Send)]
impl VideoTrack for FakeTrack {
    async fn next_frame(&mut self) -> Result<Option<VideoFrame>, PicallError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for FakeTrack {
    fn drop(&mut self) {
        if let Some(log) = &self.log {
            log_call(log, MediaCall::TrackDropped(self.label.clone()));
        }
    }
}

#[derive(Default, Clone)]
struct Faults {
    create: bool,
    bind: HashSet<TrackKind>,
    stop: HashSet<TrackKind>,
    close: bool,
}

pub struct FakeMedia {
    devices: Vec<TrackKind>,
    log: MediaLog,
    faults: RefCell<Faults>,
    events: RefCell<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl FakeMedia {
    pub fn with_devices(devices: &[TrackKind]) -> Self {
        Self {
            devices: devices.to_vec(),
            log: Arc::new(Mutex::new(Vec::new())),
            faults: RefCell::new(Faults::default()),
            events: RefCell::new(None),
        }
    }

    pub fn fail_create(&self) {
        self.faults.borrow_mut().create = true;
    }

    pub fn fail_bind(&self, kind: TrackKind) {
        self.faults.borrow_mut().bind.insert(kind);
    }

    pub fn fail_stop(&self, kind: TrackKind) {
        self.faults.borrow_mut().stop.insert(kind);
    }

    pub fn fail_close(&self) {
        self.faults.borrow_mut().close = true;
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.log.lock().unwrap().clone()
    }

    pub fn log(&self) -> MediaLog {
        self.log.clone()
    }

    /// Raise an event on the most recently created peer connection.
    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.borrow().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl MediaBackend for FakeMedia {
    fn create_peer_connection(
        &self,
    ) -> Result<(Rc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), PicallError> {
        let faults = self.faults.borrow().clone();
        if faults.create {
            return Err(PicallError::Media("peer connection unavailable".into()));
        }
        log_call(&self.log, MediaCall::PeerCreated);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.borrow_mut() = Some(tx);
        let peer = FakePeer {
            devices: self.devices.clone(),
            log: self.log.clone(),
            faults,
        };
        Ok((Rc::new(peer), rx))
    }
}

struct FakePeer {
    devices: Vec<TrackKind>,
    log: MediaLog,
    faults: Faults,
}

#[async_trait(?Send)]
impl PeerConnection for FakePeer {
    fn bind_capture(&self, kind: TrackKind) -> Result<Option<Box<dyn LocalCapture>>, PicallError> {
        if self.faults.bind.contains(&kind) {
            return Err(PicallError::Media(format!("{kind:?} device busy")));
        }
        if !self.devices.contains(&kind) {
            return Ok(None);
        }
        log_call(&self.log, MediaCall::CaptureBound(kind));
        Ok(Some(Box::new(FakeCapture {
            kind,
            log: self.log.clone(),
            fail_stop: self.faults.stop.contains(&kind),
            preview_feed: None,
        })))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), PicallError> {
        log_call(&self.log, MediaCall::Answer(sdp.into()));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PicallError> {
        log_call(&self.log, MediaCall::RemoteCandidate(candidate.candidate.clone()));
        Ok(())
    }

    fn close(&self) -> Result<(), PicallError> {
        log_call(&self.log, MediaCall::PeerClosed);
        if self.faults.close {
            return Err(PicallError::Media("close failed".into()));
        }
        Ok(())
    }
}

struct FakeCapture {
    kind: TrackKind,
    log: MediaLog,
    fail_stop: bool,
    preview_feed: Option<FrameFeed>,
}

impl LocalCapture for FakeCapture {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn preview(&mut self) -> Option<BoxVideoTrack> {
        if self.kind != TrackKind::Video {
            return None;
        }
        let (feed, track) = FakeTrack::channel_logged("preview", self.log.clone());
        self.preview_feed = Some(feed);
        Some(Box::new(track))
    }

    fn stop(&mut self) -> Result<(), PicallError> {
        log_call(&self.log, MediaCall::CaptureStopped(self.kind));
        self.preview_feed = None;
        if self.fail_stop {
            return Err(PicallError::Media("device did not stop".into()));
        }
        Ok(())
    }
}
