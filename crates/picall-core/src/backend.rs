use async_trait::async_trait;
use serde_json::Value;

use crate::errors::PicallError;
use crate::events::{SyncBatch, TimelineEvent};

/// Messaging backend used by the network context.
///
/// Implementations are only ever driven from the network context, so their
/// futures do not need to be `Send`.
#[async_trait(?Send)]
pub trait Backend {
    /// Fully qualified id of the logged-in user.
    fn user_id(&self) -> &str;

    async fn login(&self, password: &str) -> Result<(), PicallError>;

    /// Fetch everything new since the previous sync.
    async fn sync(&self, timeout_ms: u64) -> Result<SyncBatch, PicallError>;

    /// One page of a room's history, newest first, paginating backwards
    /// from the `from` token.
    async fn room_messages(
        &self,
        room_id: &str,
        from: &str,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>, PicallError>;

    /// Send an event and return its id.
    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, PicallError>;

    /// Upload media and return its content locator.
    async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, PicallError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, PicallError>;
}
