#![forbid(unsafe_code)]

// Room module - Room state and participant resource tracking
pub mod registry;

pub use registry::{RoomRegistry, RoomSummary};

use crate::media::{MediaKind, RouterInfo, TransportDirection};
use crate::signaling::protocol::Notification;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, warn};

/// Outbound channel of one client connection (pre-serialized frames)
pub type NotificationSender = mpsc::Sender<Arc<String>>;

/// Consumer lifecycle after creation; a closed consumer is removed from its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Active,
}

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub kind: MediaKind,
    pub transport_id: String,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub kind: MediaKind,
    pub producer_id: String,
    pub transport_id: String,
    pub state: ConsumerState,
}

/// Participant in a room, owning everything it negotiated
pub struct Participant {
    pub id: String,
    pub sender: NotificationSender,
    pub producer_transports: HashSet<String>,
    pub consumer_transports: HashSet<String>,
    pub producers: HashMap<String, ProducerEntry>,
    pub consumers: HashMap<String, ConsumerEntry>,
    /// Producers of this participant that have already been closed
    pub closed_producers: HashSet<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, sender: NotificationSender) -> Self {
        Self {
            id: id.into(),
            sender,
            producer_transports: HashSet::new(),
            consumer_transports: HashSet::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            closed_producers: HashSet::new(),
        }
    }

    pub fn transports(&self, direction: TransportDirection) -> &HashSet<String> {
        match direction {
            TransportDirection::Producer => &self.producer_transports,
            TransportDirection::Consumer => &self.consumer_transports,
        }
    }

    pub fn transports_mut(&mut self, direction: TransportDirection) -> &mut HashSet<String> {
        match direction {
            TransportDirection::Producer => &mut self.producer_transports,
            TransportDirection::Consumer => &mut self.consumer_transports,
        }
    }

    /// Transport ids of both directions
    pub fn all_transports(&self) -> Vec<String> {
        self.producer_transports
            .iter()
            .chain(self.consumer_transports.iter())
            .cloned()
            .collect()
    }
}

/// Mutable part of a room, guarded by the room's mutex
pub struct RoomState {
    room_id: String,
    pub participants: HashMap<String, Participant>,
    participant_count: Arc<AtomicUsize>,
    closed: bool,
}

impl RoomState {
    /// A closed room has been taken out of the registry and accepts nothing
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub fn insert_participant(&mut self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
        self.participant_count
            .store(self.participants.len(), Ordering::Relaxed);
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        let removed = self.participants.remove(participant_id);
        self.participant_count
            .store(self.participants.len(), Ordering::Relaxed);
        removed
    }

    /// Linear scan for a producer; returns its owner and entry
    pub fn find_producer(&self, producer_id: &str) -> Option<(&str, &ProducerEntry)> {
        self.participants.values().find_map(|p| {
            p.producers
                .get(producer_id)
                .map(|entry| (p.id.as_str(), entry))
        })
    }

    /// (owner, consumer id) for every consumer of `producer_id`
    pub fn consumers_of(&self, producer_id: &str) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for participant in self.participants.values() {
            for (consumer_id, entry) in &participant.consumers {
                if entry.producer_id == producer_id {
                    found.push((participant.id.clone(), consumer_id.clone()));
                }
            }
        }
        found
    }

    pub fn owner_of_transport(&self, transport_id: &str) -> Option<String> {
        self.participants
            .values()
            .find(|p| {
                p.producer_transports.contains(transport_id)
                    || p.consumer_transports.contains(transport_id)
            })
            .map(|p| p.id.clone())
    }

    pub fn owner_of_producer(&self, producer_id: &str) -> Option<String> {
        self.find_producer(producer_id)
            .map(|(owner, _)| owner.to_string())
    }

    pub fn owner_of_consumer(&self, consumer_id: &str) -> Option<String> {
        self.participants
            .values()
            .find(|p| p.consumers.contains_key(consumer_id))
            .map(|p| p.id.clone())
    }

    /// Broadcast a notification to all participants except `sender_id`
    pub fn broadcast_except(&self, sender_id: &str, notification: &Notification) -> usize {
        let Some(json) = self.serialize(notification) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, participant) in &self.participants {
            if id != sender_id && self.deliver(participant, json.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of participants a `broadcast_except(sender_id, ..)` addresses
    pub fn recipients_except(&self, sender_id: &str) -> usize {
        self.participants
            .keys()
            .filter(|id| id.as_str() != sender_id)
            .count()
    }

    /// Send a notification to a single participant
    pub fn send_to(&self, participant_id: &str, notification: &Notification) -> bool {
        let Some(participant) = self.participants.get(participant_id) else {
            debug!(
                "Participant {} left room {}, notification dropped",
                participant_id, self.room_id
            );
            return false;
        };
        match self.serialize(notification) {
            Some(json) => self.deliver(participant, json),
            None => false,
        }
    }

    fn serialize(&self, notification: &Notification) -> Option<Arc<String>> {
        match serde_json::to_string(notification) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize notification: {}", e);
                None
            }
        }
    }

    fn deliver(&self, participant: &Participant, json: Arc<String>) -> bool {
        match participant.sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for participant {} in room {}, dropping notification",
                    participant.id, self.room_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for participant {} in room {} (disconnected)",
                    participant.id, self.room_id
                );
                false
            }
        }
    }
}

/// A named group of participants sharing one router
pub struct Room {
    pub id: String,
    router: OnceCell<RouterInfo>,
    state: Arc<TokioMutex<RoomState>>,
    participant_count: Arc<AtomicUsize>,
}

impl Room {
    pub(crate) fn new(id: &str) -> Self {
        let participant_count = Arc::new(AtomicUsize::new(0));
        Self {
            id: id.to_string(),
            router: OnceCell::new(),
            state: Arc::new(TokioMutex::new(RoomState {
                room_id: id.to_string(),
                participants: HashMap::new(),
                participant_count: participant_count.clone(),
                closed: false,
            })),
            participant_count,
        }
    }

    /// The room's router; `None` while the creating join is still in flight
    pub fn router(&self) -> Option<&RouterInfo> {
        self.router.get()
    }

    pub(crate) fn router_cell(&self) -> &OnceCell<RouterInfo> {
        &self.router
    }

    /// Enters the room's serialized section
    pub async fn lock(&self) -> OwnedMutexGuard<RoomState> {
        self.state.clone().lock_owned().await
    }

    /// Participant count as of the last mutation (readable without the lock)
    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }
}
