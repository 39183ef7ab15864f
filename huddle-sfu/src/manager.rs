//! Process-wide room registry
//!
//! Rooms are created on first join and deleted on last leave. The registry
//! lock guards only map mutation; room-local traffic never touches it. The
//! one permitted nesting is taking a room's membership lock while holding
//! the registry lock, which `delete` needs to verify emptiness atomically.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::room::Room;
use crate::types::RoomId;

#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

impl RoomManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live room.
    pub async fn get(&self, name: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Return the room with this name, creating an empty one if absent.
    ///
    /// `capacity` and `ice_servers` apply only when the room is actually
    /// created; a later call with different values returns the existing
    /// room unchanged.
    pub async fn get_or_create(
        &self,
        name: &RoomId,
        capacity: usize,
        ice_servers: &[String],
    ) -> Result<Arc<Room>> {
        if !name.is_valid() {
            return Err(Error::RoomNotCreated);
        }

        if let Some(room) = self.get(name).await {
            return Ok(room);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Ok(Arc::clone(room));
        }

        let room = Arc::new(Room::new(name.clone(), capacity, ice_servers.to_vec()));
        rooms.insert(name.clone(), Arc::clone(&room));
        info!(room = %name, total_rooms = rooms.len(), "created new room");
        Ok(room)
    }

    /// Remove a room, but only if it is empty. Deleting a room that still
    /// has peers is a logged no-op.
    pub async fn delete(&self, name: &RoomId) {
        let mut rooms = self.rooms.write().await;

        let Some(room) = rooms.get(name) else {
            return;
        };
        if !room.is_empty().await {
            warn!(room = %name, "attempted to delete non-empty room");
            return;
        }

        rooms.remove(name);
        info!(room = %name, remaining_rooms = rooms.len(), "deleted empty room");
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
