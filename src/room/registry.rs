#![forbid(unsafe_code)]

// Process-wide room-id -> Room map

use crate::media::{MediaEngine, MediaError};
use crate::metrics::ServerMetrics;
use crate::room::Room;
use crate::session::{SessionError, SessionResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info};

/// Room entry for the discovery endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub participants: usize,
}

/// Owns every live room.
///
/// The outer map is a std RwLock held only for lookups and inserts, never
/// across an await. A room is inserted before its router exists so that
/// concurrent joins of the same id wait on a single router creation.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    engine: Arc<dyn MediaEngine>,
    max_rooms: usize,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, max_rooms: usize, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            engine,
            max_rooms,
            metrics,
        }
    }

    fn lookup(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    /// Returns a room whose router is ready
    pub fn find(&self, room_id: &str) -> SessionResult<Arc<Room>> {
        self.lookup(room_id)
            .filter(|room| room.router().is_some())
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))
    }

    /// Returns the room, creating it and its router on first use
    pub async fn get_or_create(&self, room_id: &str) -> SessionResult<Arc<Room>> {
        let room = match self.lookup(room_id) {
            Some(room) => room,
            None => {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                match rooms.get(room_id) {
                    Some(room) => room.clone(),
                    None => {
                        if self.max_rooms > 0 && rooms.len() >= self.max_rooms {
                            return Err(SessionError::TooManyRooms);
                        }
                        let room = Arc::new(Room::new(room_id));
                        rooms.insert(room_id.to_string(), room.clone());
                        room
                    }
                }
            }
        };

        let created = room
            .router_cell()
            .get_or_try_init(|| async {
                let router = self.engine.create_router().await?;
                info!("Created room {} with router {}", room_id, router.id);
                self.metrics.inc_rooms_created();
                Ok::<_, MediaError>(router)
            })
            .await;

        if let Err(e) = created {
            self.discard_unrouted(&room);
            return Err(e.into());
        }
        Ok(room)
    }

    /// Whether `room` is still the registered room for its id
    pub(crate) fn is_current(&self, room: &Arc<Room>) -> bool {
        self.lookup(&room.id)
            .is_some_and(|current| Arc::ptr_eq(&current, room))
    }

    fn discard_unrouted(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let registered = rooms
            .get(&room.id)
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if registered && room.router().is_none() {
            rooms.remove(&room.id);
            debug!("Discarded room {} after failed router creation", room.id);
        }
    }

    /// Removes the room and closes its router if nobody is in it.
    /// Safe to call redundantly; returns whether this call removed it.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let Some(room) = self.lookup(room_id) else {
            return false;
        };

        let router_id = {
            let mut state = room.lock().await;
            if state.is_closed() || !state.participants.is_empty() {
                return false;
            }
            // No router yet means a join is still creating it
            let Some(router) = room.router() else {
                return false;
            };
            state.close();

            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms
                .get(room_id)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(room_id);
            }
            router.id.clone()
        };

        self.engine.close_router(&router_id).await;
        info!("Room {} is empty, removed", room_id);
        true
    }

    /// Takes every room out of the map (shutdown)
    pub(crate) fn drain(&self) -> Vec<Arc<Room>> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.drain().map(|(_, room)| room).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Rooms with a live router, sorted by id
    pub fn list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .snapshot()
            .into_iter()
            .filter(|room| room.router().is_some())
            .map(|room| RoomSummary {
                id: room.id.clone(),
                participants: room.participant_count(),
            })
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn participant_count(&self) -> usize {
        self.snapshot().iter().map(|r| r.participant_count()).sum()
    }
}
