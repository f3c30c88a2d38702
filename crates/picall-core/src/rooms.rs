use std::collections::HashSet;

use crate::events::RoomSummary;
use crate::interactive::UiHandle;

/// A room as listed by the interactive side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEntry {
    pub room_id: String,
    pub title: String,
}

/// Rooms seen so far. Each room is announced to the interactive side once.
pub struct RoomRegistry {
    ui: UiHandle,
    known: HashSet<String>,
    rooms: Vec<RoomEntry>,
}

impl RoomRegistry {
    pub fn new(ui: UiHandle) -> Self {
        Self {
            ui,
            known: HashSet::new(),
            rooms: Vec::new(),
        }
    }

    /// Record a room from a sync batch. Returns true when it was new.
    pub fn observe(&mut self, room: &RoomSummary) -> bool {
        if !self.known.insert(room.room_id.clone()) {
            return false;
        }
        let entry = RoomEntry {
            room_id: room.room_id.clone(),
            title: room.title().to_string(),
        };
        tracing::info!(room_id = %entry.room_id, title = %entry.title, "room discovered");
        let _ = self.ui.room_discovered(entry.clone());
        self.rooms.push(entry);
        true
    }

    /// Rooms in discovery order.
    pub fn rooms(&self) -> &[RoomEntry] {
        &self.rooms
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.known.contains(room_id)
    }

    pub fn title(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .iter()
            .find(|r| r.room_id == room_id)
            .map(|r| r.title.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ShellCall, ShellFixture};

    fn summary(id: &str, name: Option<&str>) -> RoomSummary {
        RoomSummary {
            room_id: id.into(),
            display_name: name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn rooms_are_announced_once() {
        let screen = ShellFixture::spawn();
        let mut registry = RoomRegistry::new(screen.ui());

        assert!(registry.observe(&summary("!a:x", Some("Lobby"))));
        assert!(!registry.observe(&summary("!a:x", Some("Lobby renamed"))));
        assert!(registry.observe(&summary("!b:x", None)));
        screen.settle().await;

        let announced: Vec<ShellCall> = screen
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ShellCall::RoomDiscovered(_)))
            .collect();
        assert_eq!(
            announced,
            vec![
                ShellCall::RoomDiscovered("Lobby".into()),
                ShellCall::RoomDiscovered("!b:x".into()),
            ]
        );
        assert_eq!(registry.rooms().len(), 2);
        assert_eq!(registry.title("!a:x"), Some("Lobby"));
        assert!(registry.contains("!b:x"));
        screen.shutdown();
    }
}
