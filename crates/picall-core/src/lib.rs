//! picall core: chat history, call signaling and media session logic.
//!
//! Everything here runs on one of two cooperative contexts, the interactive
//! one that owns the display and the network one that owns the backend and
//! call state. Platform WebRTC and widget toolkits plug in through the
//! [`MediaBackend`] and [`Shell`] traits.

pub mod backend;
pub mod bridge;
pub mod call;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod history;
pub mod interactive;
pub mod matrix;
pub mod media;
pub mod renderer;
pub mod rooms;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use backend::Backend;
pub use bridge::{BridgeError, CancelSignal, ContextHandle, ContextThread, PendingFuture};
pub use call::{CallState, SessionController};
pub use client::{Client, ClientHandle};
pub use config::ClientConfig;
pub use errors::PicallError;
pub use events::TrackKind;
pub use history::RenderedMessage;
pub use interactive::{Shell, Surface, UiHandle};
pub use matrix::MatrixBackend;
pub use media::{LocalCapture, MediaBackend, PeerConnection, PeerEvent, RemoteTrack};
pub use renderer::{BoxVideoTrack, DisplayImage, VideoFrame, VideoTrack};
pub use rooms::RoomEntry;
pub use signaling::Candidate;
