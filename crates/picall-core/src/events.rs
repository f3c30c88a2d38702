use serde_json::Value;

/// A room event as delivered by sync or history pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub content: Value,
    /// Milliseconds since the event was sent, when the server reports it.
    pub age_ms: Option<u64>,
}

impl TimelineEvent {
    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(Value::as_str)
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// A joined room as seen by the latest sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: String,
    pub display_name: Option<String>,
}

impl RoomSummary {
    /// The room name, falling back to its id.
    pub fn title(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.room_id)
    }
}

/// Result of one sync round-trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub next_batch: String,
    pub rooms: Vec<RoomSummary>,
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}
