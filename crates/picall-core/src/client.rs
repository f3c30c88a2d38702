//! Client assembly: the network context state, its sync loop, and the
//! handle other threads use to reach it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;

use crate::backend::Backend;
use crate::bridge::{CancelSignal, ContextHandle, ContextThread, PendingFuture, spawn_context};
use crate::call::{CallState, SessionController};
use crate::config::ClientConfig;
use crate::errors::PicallError;
use crate::events::SyncBatch;
use crate::history::{HistoryReconciler, RenderedMessage};
use crate::interactive::{Shell, UiHandle, spawn_interactive};
use crate::media::MediaBackend;
use crate::rooms::{RoomEntry, RoomRegistry};
use crate::signaling::InboundSignal;

/// State owned by the network context.
pub struct Network {
    config: ClientConfig,
    backend: Rc<dyn Backend>,
    ui: UiHandle,
    rooms: RefCell<RoomRegistry>,
    history: HistoryReconciler,
    calls: Rc<SessionController>,
}

impl Network {
    pub fn new(
        config: ClientConfig,
        backend: Rc<dyn Backend>,
        media: Rc<dyn MediaBackend>,
        ui: UiHandle,
    ) -> Self {
        let history = HistoryReconciler::new(
            backend.clone(),
            ui.clone(),
            config.sync_timeout_ms,
            config.history_page_size,
            config.history_capacity,
        );
        let calls = Rc::new(SessionController::new(
            backend.clone(),
            media,
            ui.clone(),
            config.call_lifetime_ms,
        ));
        Self {
            rooms: RefCell::new(RoomRegistry::new(ui.clone())),
            config,
            backend,
            ui,
            history,
            calls,
        }
    }

    pub fn calls(&self) -> &Rc<SessionController> {
        &self.calls
    }

    pub fn history(&self) -> &HistoryReconciler {
        &self.history
    }

    pub fn rooms(&self) -> Vec<RoomEntry> {
        self.rooms.borrow().rooms().to_vec()
    }

    /// Log in, then select the configured room and run the first pass.
    pub async fn login(&self, password: &str) -> Result<(), PicallError> {
        self.backend.login(password).await?;
        tracing::info!(user_id = self.backend.user_id(), "logged in");

        if let Some(room_id) = self.config.initial_room.clone() {
            self.history.select_room(&room_id).await;
        }
        self.step().await;
        Ok(())
    }

    /// One reconciliation pass followed by routing of the synced events.
    pub async fn step(&self) {
        let Some(report) = self.history.reconcile().await else {
            return;
        };
        self.absorb(report.batch).await;
    }

    async fn absorb(&self, batch: SyncBatch) {
        {
            let mut rooms = self.rooms.borrow_mut();
            for room in &batch.rooms {
                rooms.observe(room);
            }
        }

        if self.history.active_room().is_none() {
            let first = self.rooms.borrow().rooms().first().map(|r| r.room_id.clone());
            if let Some(room_id) = first {
                self.history.select_room(&room_id).await;
            }
        }

        for event in &batch.events {
            match InboundSignal::from_event(event) {
                Ok(Some(signal)) => self.calls.dispatch(signal).await,
                Ok(None) => {}
                Err(e) => tracing::debug!(event_id = %event.event_id, "skipping malformed signal: {e}"),
            }
        }
    }

    /// Run passes at the configured cadence until cancelled. Errors never
    /// end the loop; a slow pass delays the next tick rather than bursting.
    pub async fn run(self: Rc<Self>, mut cancel: CancelSignal) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.sync_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.config.sync_interval_ms, "sync loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.step().await;
        }
        tracing::info!("sync loop stopped");
    }

    fn require_room(&self) -> Result<String, PicallError> {
        self.history
            .active_room()
            .ok_or_else(|| PicallError::Room("no active room".into()))
    }

    /// Send a text message to the active room. Blank input is ignored.
    pub async fn send_text(&self, text: &str) -> Result<Option<String>, PicallError> {
        let body = text.trim();
        if body.is_empty() {
            return Ok(None);
        }
        let result = async {
            let room_id = self.require_room()?;
            self.backend
                .send(&room_id, "m.room.message", json!({ "msgtype": "m.text", "body": body }))
                .await
        }
        .await;

        match result {
            Ok(event_id) => Ok(Some(event_id)),
            Err(e) => {
                tracing::warn!("failed to send message: {e}");
                let _ = self.ui.notice("Send Failed", e.to_string());
                Err(e)
            }
        }
    }

    /// Upload a file and post it to the active room as an image or a file.
    pub async fn send_file(&self, path: &Path) -> Result<String, PicallError> {
        let result = self.upload_and_post(path).await;
        if let Err(e) = &result {
            tracing::warn!("failed to upload {}: {e}", path.display());
            let _ = self.ui.notice("Upload Failed", e.to_string());
        }
        result
    }

    async fn upload_and_post(&self, path: &Path) -> Result<String, PicallError> {
        let room_id = self.require_room()?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PicallError::Io(format!("{} has no file name", path.display())))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        let size = data.len();
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        let url = self
            .backend
            .upload(data, mime.essence_str(), &filename)
            .await?;
        let msgtype = if mime.type_() == mime_guess::mime::IMAGE {
            "m.image"
        } else {
            "m.file"
        };
        tracing::info!(room_id = %room_id, %url, msgtype, "posting upload");

        self.backend
            .send(
                &room_id,
                "m.room.message",
                json!({
                    "msgtype": msgtype,
                    "body": filename,
                    "url": url,
                    "info": { "mimetype": mime.essence_str(), "size": size },
                }),
            )
            .await
    }

    /// Fetch content by url and write it to `dest`.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), PicallError> {
        let result = async {
            let bytes = self.backend.download(url).await?;
            tokio::fs::write(dest, bytes).await?;
            Ok::<_, PicallError>(())
        }
        .await;

        match &result {
            Ok(()) => tracing::info!(url, "saved to {}", dest.display()),
            Err(e) => {
                tracing::warn!(url, "download failed: {e}");
                let _ = self.ui.notice("Download Error", e.to_string());
            }
        }
        result
    }

    /// Switch rooms and reconcile right away.
    pub async fn select_room(&self, room_id: &str) {
        self.history.select_room(room_id).await;
        self.step().await;
    }

    pub async fn start_call(&self) -> Result<String, PicallError> {
        let room_id = self.require_room()?;
        self.calls.start_call(&room_id).await
    }
}

/// `Send` handle to the network context.
#[derive(Clone)]
pub struct ClientHandle {
    ctx: ContextHandle<Network>,
}

impl ClientHandle {
    pub fn login(&self, password: String) -> PendingFuture<Result<(), PicallError>> {
        self.ctx
            .submit(move |net: Rc<Network>| async move { net.login(&password).await })
    }

    pub fn send_text(&self, text: String) -> PendingFuture<Result<Option<String>, PicallError>> {
        self.ctx
            .submit(move |net: Rc<Network>| async move { net.send_text(&text).await })
    }

    pub fn send_file(&self, path: PathBuf) -> PendingFuture<Result<String, PicallError>> {
        self.ctx
            .submit(move |net: Rc<Network>| async move { net.send_file(&path).await })
    }

    pub fn download(&self, url: String, dest: PathBuf) -> PendingFuture<Result<(), PicallError>> {
        self.ctx
            .submit(move |net: Rc<Network>| async move { net.download(&url, &dest).await })
    }

    pub fn select_room(&self, room_id: String) -> PendingFuture<()> {
        self.ctx
            .submit(move |net: Rc<Network>| async move { net.select_room(&room_id).await })
    }

    pub fn start_call(&self) -> PendingFuture<Result<String, PicallError>> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.start_call().await })
    }

    pub fn end_call(&self) -> PendingFuture<Result<(), PicallError>> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.calls().end_call().await })
    }

    pub fn call_state(&self) -> PendingFuture<CallState> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.calls().state() })
    }

    pub fn active_room(&self) -> PendingFuture<Option<String>> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.history().active_room() })
    }

    pub fn rooms(&self) -> PendingFuture<Vec<RoomEntry>> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.rooms() })
    }

    pub fn history(&self) -> PendingFuture<Vec<RenderedMessage>> {
        self.ctx
            .submit(|net: Rc<Network>| async move { net.history().snapshot().await })
    }
}

/// A running client: the interactive and network contexts plus the sync loop.
pub struct Client {
    handle: ClientHandle,
    sync: Option<PendingFuture<()>>,
    network: ContextThread,
    interactive: ContextThread,
}

impl Client {
    /// Spawn both contexts. The factories run on the thread that will own
    /// what they build.
    pub fn start<FB, FM, FS>(
        config: ClientConfig,
        make_backend: FB,
        make_media: FM,
        make_shell: FS,
    ) -> Result<Self, PicallError>
    where
        FB: FnOnce() -> Rc<dyn Backend> + Send + 'static,
        FM: FnOnce() -> Rc<dyn MediaBackend> + Send + 'static,
        FS: FnOnce() -> Box<dyn Shell> + Send + 'static,
    {
        let (ui, interactive) = spawn_interactive(make_shell)?;
        let (ctx, network) = match spawn_context("network", move || {
            Network::new(config, make_backend(), make_media(), ui)
        }) {
            Ok(spawned) => spawned,
            Err(e) => {
                interactive.shutdown();
                return Err(e);
            }
        };

        Ok(Self {
            handle: ClientHandle { ctx },
            sync: None,
            network,
            interactive,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub async fn login(&self, password: &str) -> Result<(), PicallError> {
        self.handle.login(password.to_string()).await?
    }

    /// Start the periodic sync loop. Calling it twice has no effect.
    pub fn start_sync(&mut self) {
        if self.sync.is_some() {
            return;
        }
        self.sync = Some(
            self.handle
                .ctx
                .submit_cancellable(|net: Rc<Network>, cancel| net.run(cancel)),
        );
    }

    /// Stop the sync loop, hang up any call, and stop both contexts.
    pub async fn shutdown(mut self) {
        if let Some(sync) = self.sync.take() {
            sync.cancel();
            let _ = sync.await;
        }
        match self.handle.end_call().await {
            Ok(Ok(())) | Ok(Err(PicallError::NoActiveCall)) => {}
            Ok(Err(e)) => tracing::warn!("failed to end call on shutdown: {e}"),
            Err(e) => tracing::warn!("network context unavailable on shutdown: {e}"),
        }
        self.network.shutdown();
        self.interactive.shutdown();
        tracing::info!("client stopped");
    }
}
