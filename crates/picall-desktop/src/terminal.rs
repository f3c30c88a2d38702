//! Line-oriented shell for terminals.

use std::collections::HashMap;
use std::io::Write;

use futures_util::future::LocalBoxFuture;
use picall_core::history::RenderedMessage;
use picall_core::{DisplayImage, RoomEntry, Shell, Surface};
use tokio::sync::{mpsc, oneshot};

/// Open prompts are handed to the command loop, which owns stdin.
pub type PromptSender = mpsc::UnboundedSender<oneshot::Sender<bool>>;

pub struct TerminalShell {
    prompts: PromptSender,
    frames: HashMap<Surface, u64>,
}

impl TerminalShell {
    pub fn new(prompts: PromptSender) -> Self {
        Self {
            prompts,
            frames: HashMap::new(),
        }
    }
}

fn render(index: usize, message: &RenderedMessage) -> String {
    match message {
        RenderedMessage::Image {
            preview: Some(bytes),
            ..
        } => format!("[{index}] {} ({} bytes)", message.line(), bytes.len()),
        _ => format!("[{index}] {}", message.line()),
    }
}

impl Shell for TerminalShell {
    fn room_discovered(&mut self, room: &RoomEntry) {
        println!("* room {} ({})", room.title, room.room_id);
    }

    fn redraw_history(&mut self, messages: &[RenderedMessage]) {
        println!("----");
        for (i, message) in messages.iter().enumerate() {
            println!("{}", render(i + 1, message));
        }
    }

    fn scroll_to_latest(&mut self) {
        let _ = std::io::stdout().flush();
    }

    fn show_call_overlay(&mut self) {
        println!("=== call ===");
    }

    fn restore_chat_view(&mut self) {
        self.frames.clear();
        println!("=== call ended ===");
    }

    fn show_frame(&mut self, surface: Surface, image: &DisplayImage) {
        let count = self.frames.entry(surface).or_default();
        *count += 1;
        if *count == 1 {
            println!(
                "[video] {surface:?} {}x{} ({} byte frames)",
                image.width,
                image.height,
                image.jpeg.len()
            );
        }
    }

    fn show_notice(&mut self, title: &str, message: &str) {
        eprintln!("! {title}: {message}");
    }

    fn confirm(&mut self, title: &str, message: &str) -> LocalBoxFuture<'static, bool> {
        println!("? {title}: {message} [y/n]");
        let (tx, rx) = oneshot::channel();
        if self.prompts.send(tx).is_err() {
            tracing::warn!("no input loop to answer prompt, declining");
        }
        Box::pin(async move { rx.await.unwrap_or(false) })
    }
}
