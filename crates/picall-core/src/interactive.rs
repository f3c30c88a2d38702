//! The interactive side: display surfaces and prompts.
//!
//! A [`Shell`] lives on the interactive context and is only ever touched from
//! there. The network context drives it through a [`UiHandle`], which turns
//! every display change into a job submitted over the bridge.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;

use crate::bridge::{ContextHandle, ContextThread, PendingFuture, spawn_context};
use crate::errors::PicallError;
use crate::history::RenderedMessage;
use crate::renderer::DisplayImage;
use crate::rooms::RoomEntry;

/// Display surfaces a video renderer can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Local,
    Remote,
}

/// Widget toolkit seam implemented by front-ends.
pub trait Shell {
    fn room_discovered(&mut self, room: &RoomEntry);

    /// Replace the whole displayed message log.
    fn redraw_history(&mut self, messages: &[RenderedMessage]);

    fn scroll_to_latest(&mut self);

    fn show_call_overlay(&mut self);

    /// Put the chat view back in place of the call overlay.
    fn restore_chat_view(&mut self);

    fn show_frame(&mut self, surface: Surface, image: &DisplayImage);

    /// A visible, dismissable notice.
    fn show_notice(&mut self, title: &str, message: &str);

    /// Ask a yes/no question. The returned future must not borrow the shell,
    /// so other display work can proceed while the user decides.
    fn confirm(&mut self, title: &str, message: &str) -> LocalBoxFuture<'static, bool>;
}

/// State owned by the interactive context.
pub struct Interactive {
    shell: RefCell<Box<dyn Shell>>,
    overlay_visible: Cell<bool>,
}

impl Interactive {
    pub fn new(shell: Box<dyn Shell>) -> Self {
        Self {
            shell: RefCell::new(shell),
            overlay_visible: Cell::new(false),
        }
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible.get()
    }

    fn show_call_overlay(&self) {
        if self.overlay_visible.replace(true) {
            return;
        }
        self.shell.borrow_mut().show_call_overlay();
    }

    fn restore_chat_view(&self) {
        if !self.overlay_visible.replace(false) {
            return;
        }
        self.shell.borrow_mut().restore_chat_view();
    }
}

/// Start the interactive context. `make_shell` runs on the new thread, so the
/// shell itself need not be `Send`.
pub fn spawn_interactive<F>(make_shell: F) -> Result<(UiHandle, ContextThread), PicallError>
where
    F: FnOnce() -> Box<dyn Shell> + Send + 'static,
{
    let (ctx, thread) = spawn_context("interactive", move || Interactive::new(make_shell()))?;
    Ok((UiHandle::new(ctx), thread))
}

/// Network-side handle for display work.
#[derive(Clone)]
pub struct UiHandle {
    ctx: ContextHandle<Interactive>,
}

impl UiHandle {
    pub fn new(ctx: ContextHandle<Interactive>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ContextHandle<Interactive> {
        &self.ctx
    }

    pub fn room_discovered(&self, room: RoomEntry) -> PendingFuture<()> {
        self.ctx.submit(move |ui: Rc<Interactive>| async move {
            ui.shell.borrow_mut().room_discovered(&room);
        })
    }

    /// Full redraw of the message log followed by a scroll to the latest entry.
    pub fn redraw_history(&self, messages: Vec<RenderedMessage>) -> PendingFuture<()> {
        self.ctx.submit(move |ui: Rc<Interactive>| async move {
            let mut shell = ui.shell.borrow_mut();
            shell.redraw_history(&messages);
            shell.scroll_to_latest();
        })
    }

    pub fn show_call_overlay(&self) -> PendingFuture<()> {
        self.ctx
            .submit(|ui: Rc<Interactive>| async move { ui.show_call_overlay() })
    }

    pub fn restore_chat_view(&self) -> PendingFuture<()> {
        self.ctx
            .submit(|ui: Rc<Interactive>| async move { ui.restore_chat_view() })
    }

    pub fn show_frame(&self, surface: Surface, image: DisplayImage) -> PendingFuture<()> {
        self.ctx.submit(move |ui: Rc<Interactive>| async move {
            // Frames racing a teardown must not land on the chat view.
            if ui.overlay_visible() {
                ui.shell.borrow_mut().show_frame(surface, &image);
            }
        })
    }

    pub fn notice(&self, title: impl Into<String>, message: impl Into<String>) -> PendingFuture<()> {
        let (title, message) = (title.into(), message.into());
        self.ctx.submit(move |ui: Rc<Interactive>| async move {
            ui.shell.borrow_mut().show_notice(&title, &message);
        })
    }

    /// Ask a yes/no question. Cancelling the returned handle withdraws the
    /// prompt: the shell's answer future is dropped unanswered.
    pub fn confirm(&self, title: impl Into<String>, message: impl Into<String>) -> PendingFuture<bool> {
        let (title, message) = (title.into(), message.into());
        self.ctx
            .submit_cancellable(move |ui: Rc<Interactive>, mut cancel| async move {
                let answer = ui.shell.borrow_mut().confirm(&title, &message);
                tokio::select! {
                    accepted = answer => accepted,
                    _ = cancel.cancelled() => false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ShellCall, ShellFixture};

    #[tokio::test]
    async fn overlay_show_and_restore_are_idempotent() {
        let screen = ShellFixture::spawn();
        let ui = screen.ui();

        ui.show_call_overlay().await.unwrap();
        ui.show_call_overlay().await.unwrap();
        ui.restore_chat_view().await.unwrap();
        ui.restore_chat_view().await.unwrap();

        assert_eq!(
            screen.calls(),
            vec![ShellCall::ShowOverlay, ShellCall::RestoreChat]
        );
        screen.shutdown();
    }

    #[tokio::test]
    async fn redraw_scrolls_to_latest() {
        let screen = ShellFixture::spawn();
        let messages = vec![RenderedMessage::Text {
            sender: "@a".into(),
            body: "hi".into(),
        }];

        screen.ui().redraw_history(messages.clone()).await.unwrap();

        assert_eq!(
            screen.calls(),
            vec![ShellCall::Redraw(messages), ShellCall::ScrollToLatest]
        );
        screen.shutdown();
    }

    #[tokio::test]
    async fn frames_are_dropped_without_overlay() {
        let screen = ShellFixture::spawn();
        let ui = screen.ui();
        let image = DisplayImage {
            width: 2,
            height: 2,
            jpeg: vec![0xff, 0xd8],
        };

        ui.show_frame(Surface::Remote, image.clone()).await.unwrap();
        ui.show_call_overlay().await.unwrap();
        ui.show_frame(Surface::Remote, image).await.unwrap();

        assert_eq!(
            screen.calls(),
            vec![ShellCall::ShowOverlay, ShellCall::Frame(Surface::Remote, 2, 2)]
        );
        screen.shutdown();
    }

    #[tokio::test]
    async fn confirm_waits_for_the_answer() {
        let screen = ShellFixture::spawn();
        let pending = screen.ui().confirm("Video Call", "Accept call?");

        screen
            .wait_for(|calls| calls.contains(&ShellCall::Confirm("Accept call?".into())))
            .await;
        // Other display work is not blocked by the open prompt.
        screen.ui().notice("Info", "still responsive").await.unwrap();
        screen.answer(false);

        assert_eq!(pending.await, Ok(false));
        screen.shutdown();
    }

    #[tokio::test]
    async fn cancelled_confirm_withdraws_the_prompt() {
        let screen = ShellFixture::spawn();
        let pending = screen.ui().confirm("Video Call", "Accept call?");
        screen
            .wait_for(|calls| calls.contains(&ShellCall::Confirm("Accept call?".into())))
            .await;
        assert!(!screen.prompt_withdrawn());

        assert!(pending.cancel());
        assert_eq!(pending.await, Err(crate::bridge::BridgeError::Cancelled));
        assert!(screen.prompt_withdrawn());
        screen.shutdown();
    }
}
