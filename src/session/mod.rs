#![forbid(unsafe_code)]

// Session orchestration - validates requests against room state, drives the
// media engine, and emits notifications.
pub mod error;

pub use error::{SessionError, SessionResult};

use crate::config::RoomLimits;
use crate::media::{
    ConsumerInfo, MediaEngine, MediaError, MediaEvent, MediaEvents, MediaKind, TransportDirection,
    TransportInfo,
};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{
    ConsumerEntry, ConsumerState, NotificationSender, Participant, ProducerEntry, RoomRegistry,
    RoomState,
};
use crate::signaling::protocol::{Notification, ProducerSummary};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_ROOM_ID_LEN: usize = 128;

/// Owns the room registry and runs every signaling operation.
///
/// Each operation locks exactly one room for its whole duration, including
/// media engine round trips, so operations on the same room are serialized
/// while different rooms proceed independently.
pub struct SessionOrchestrator {
    registry: RoomRegistry,
    engine: Arc<dyn MediaEngine>,
    max_participants_per_room: usize,
    metrics: ServerMetrics,
    engine_alive: AtomicBool,
    shutdown: CancellationToken,
}

fn validate_room_id(room_id: &str) -> SessionResult<()> {
    let len = room_id.chars().count();
    if len == 0 || len > MAX_ROOM_ID_LEN {
        return Err(SessionError::InvalidRequest(format!(
            "roomId must be 1-{MAX_ROOM_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn member<'a>(
    state: &'a mut RoomState,
    room_id: &str,
    participant_id: &str,
) -> SessionResult<&'a mut Participant> {
    state
        .participants
        .get_mut(participant_id)
        .ok_or_else(|| SessionError::ParticipantNotFound {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        })
}

impl SessionOrchestrator {
    /// Creates the orchestrator and spawns the task that applies engine events.
    /// `shutdown` is cancelled if the engine dies.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        events: MediaEvents,
        limits: RoomLimits,
        metrics: ServerMetrics,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            registry: RoomRegistry::new(engine.clone(), limits.max_rooms, metrics.clone()),
            engine,
            max_participants_per_room: limits.max_participants_per_room,
            metrics,
            engine_alive: AtomicBool::new(true),
            shutdown,
        });
        tokio::spawn(Self::media_event_task(events, Arc::downgrade(&orchestrator)));
        orchestrator
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// False once the media engine has died
    pub fn is_accepting(&self) -> bool {
        self.engine_alive.load(Ordering::SeqCst)
    }

    /// Looks up a routed room and enters its serialized section
    async fn enter(&self, room_id: &str) -> SessionResult<(String, OwnedMutexGuard<RoomState>)> {
        let room = self.registry.find(room_id)?;
        let router_id = room
            .router()
            .map(|r| r.id.clone())
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))?;
        let state = room.lock().await;
        if state.is_closed() {
            return Err(SessionError::RoomNotFound(room_id.to_string()));
        }
        Ok((router_id, state))
    }

    /// Adds the participant to the room, creating the room on first join.
    /// Joining a room twice is a no-op.
    pub async fn join_room(
        &self,
        room_id: &str,
        participant_id: &str,
        sender: NotificationSender,
    ) -> SessionResult<()> {
        validate_room_id(room_id)?;
        if !self.is_accepting() {
            return Err(SessionError::EngineUnavailable);
        }

        loop {
            let room = self.registry.get_or_create(room_id).await?;
            let mut state = room.lock().await;
            if state.is_closed() {
                // Emptied and removed while we waited; the next lookup creates a new one
                continue;
            }
            if !self.registry.is_current(&room) {
                // Orphaned by a failed creation racing with ours
                state.close();
                drop(state);
                if let Some(router) = room.router() {
                    self.engine.close_router(&router.id).await;
                }
                continue;
            }

            if state.participants.contains_key(participant_id) {
                debug!("Participant {} already in room {}", participant_id, room_id);
                return Ok(());
            }
            if self.max_participants_per_room > 0
                && state.participants.len() >= self.max_participants_per_room
            {
                return Err(SessionError::RoomFull(room_id.to_string()));
            }

            state.insert_participant(Participant::new(participant_id, sender));
            self.metrics.inc_joins();
            info!(
                "Participant {} joined room {} ({} participants)",
                participant_id,
                room_id,
                state.participants.len()
            );
            return Ok(());
        }
    }

    pub async fn get_router_rtp_capabilities(&self, room_id: &str) -> SessionResult<Value> {
        let room = self.registry.find(room_id)?;
        room.router()
            .map(|r| r.rtp_capabilities.clone())
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))
    }

    /// Allocates a transport in the caller's producer or consumer set
    pub async fn create_transport(
        &self,
        room_id: &str,
        participant_id: &str,
        direction: TransportDirection,
    ) -> SessionResult<TransportInfo> {
        let (router_id, mut state) = self.enter(room_id).await?;
        let participant = member(&mut state, room_id, participant_id)?;

        let info = self.engine.create_transport(&router_id, direction).await?;
        participant.transports_mut(direction).insert(info.id.clone());

        debug!(
            "Created {} transport {} for participant {} in room {}",
            direction, info.id, participant_id, room_id
        );
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        participant_id: &str,
        direction: TransportDirection,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SessionResult<()> {
        let (_, mut state) = self.enter(room_id).await?;
        let participant = member(&mut state, room_id, participant_id)?;
        if !participant.transports(direction).contains(transport_id) {
            return Err(SessionError::TransportNotFound(transport_id.to_string()));
        }

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        debug!(
            "Connected {} transport {} for participant {}",
            direction, transport_id, participant_id
        );
        Ok(())
    }

    /// Creates a producer and announces it to everyone else in the room
    pub async fn produce(
        &self,
        room_id: &str,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> SessionResult<String> {
        let (_, mut state) = self.enter(room_id).await?;
        let participant = member(&mut state, room_id, participant_id)?;
        if !participant.producer_transports.contains(transport_id) {
            return Err(SessionError::TransportNotFound(transport_id.to_string()));
        }

        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters, app_data)
            .await?;
        participant.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                kind,
                transport_id: transport_id.to_string(),
            },
        );
        self.metrics.inc(Counter::ProducersCreated);

        self.broadcast(
            &state,
            participant_id,
            &Notification::NewProducer {
                producer_id: producer_id.clone(),
                producer_socket_id: participant_id.to_string(),
                kind,
            },
        );

        info!(
            "Created {} producer {} for participant {} in room {}",
            kind, producer_id, participant_id, room_id
        );
        Ok(producer_id)
    }

    /// Producers of every other participant in the room
    pub async fn get_producers(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> SessionResult<Vec<ProducerSummary>> {
        let (_, mut state) = self.enter(room_id).await?;
        member(&mut state, room_id, participant_id)?;

        let mut producers: Vec<ProducerSummary> = state
            .participants
            .values()
            .filter(|p| p.id != participant_id)
            .flat_map(|p| {
                p.producers.iter().map(|(id, entry)| ProducerSummary {
                    id: id.clone(),
                    kind: entry.kind,
                    participant_id: p.id.clone(),
                })
            })
            .collect();
        producers.sort_by(|a, b| (&a.participant_id, &a.id).cmp(&(&b.participant_id, &b.id)));
        Ok(producers)
    }

    /// Subscribes the caller to a producer; the consumer starts paused
    pub async fn consume(
        &self,
        room_id: &str,
        participant_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SessionResult<ConsumerInfo> {
        let (router_id, mut state) = self.enter(room_id).await?;
        member(&mut state, room_id, participant_id)?;
        if state.find_producer(producer_id).is_none() {
            return Err(SessionError::ProducerNotFound(producer_id.to_string()));
        }
        let participant = member(&mut state, room_id, participant_id)?;
        if !participant.consumer_transports.contains(transport_id) {
            return Err(SessionError::TransportNotFound(transport_id.to_string()));
        }
        // The engine may already have dropped the producer with its event still queued
        match self
            .engine
            .can_consume(&router_id, producer_id, &rtp_capabilities)
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(SessionError::IncompatibleCapabilities(
                    producer_id.to_string(),
                ));
            }
            Err(MediaError::ResourceNotFound(_)) => {
                return Err(SessionError::ProducerNotFound(producer_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let info = self
            .engine
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;
        participant.consumers.insert(
            info.id.clone(),
            ConsumerEntry {
                kind: info.kind,
                producer_id: producer_id.to_string(),
                transport_id: transport_id.to_string(),
                state: ConsumerState::Paused,
            },
        );
        self.metrics.inc(Counter::ConsumersCreated);

        debug!(
            "Created consumer {} of producer {} for participant {} in room {}",
            info.id, producer_id, participant_id, room_id
        );
        Ok(info)
    }

    /// Moves one of the caller's consumers to `target`; repeating a transition is a no-op
    async fn set_consumer_state(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
        target: ConsumerState,
    ) -> SessionResult<()> {
        let (_, mut state) = self.enter(room_id).await?;
        let participant = member(&mut state, room_id, participant_id)?;
        let entry = participant
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::ConsumerNotFound(consumer_id.to_string()))?;
        if entry.state == target {
            return Ok(());
        }

        match target {
            ConsumerState::Active => self.engine.resume_consumer(consumer_id).await?,
            ConsumerState::Paused => self.engine.pause_consumer(consumer_id).await?,
        }
        entry.state = target;
        debug!(
            "Consumer {} of participant {} is now {:?}",
            consumer_id, participant_id, target
        );
        Ok(())
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
    ) -> SessionResult<()> {
        self.set_consumer_state(room_id, participant_id, consumer_id, ConsumerState::Active)
            .await
    }

    pub async fn pause_consumer(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
    ) -> SessionResult<()> {
        self.set_consumer_state(room_id, participant_id, consumer_id, ConsumerState::Paused)
            .await
    }

    /// Stops one of the caller's producers and every consumer of it
    pub async fn close_producer(
        &self,
        room_id: &str,
        participant_id: &str,
        producer_id: &str,
    ) -> SessionResult<()> {
        let (_, mut state) = self.enter(room_id).await?;
        let participant = member(&mut state, room_id, participant_id)?;
        if !participant.producers.contains_key(producer_id) {
            if participant.closed_producers.contains(producer_id) {
                debug!("Producer {} already closed", producer_id);
                return Ok(());
            }
            return Err(SessionError::ProducerNotFound(producer_id.to_string()));
        }

        self.close_producer_in(&mut state, participant_id, producer_id)
            .await;
        info!(
            "Participant {} closed producer {} in room {}",
            participant_id, producer_id, room_id
        );
        Ok(())
    }

    /// Removes the participant and everything it owns, then drops the room if empty
    pub async fn leave_room(&self, room_id: &str, participant_id: &str) -> SessionResult<()> {
        {
            let (_, mut state) = self.enter(room_id).await?;
            member(&mut state, room_id, participant_id)?;
            self.remove_participant_in(&mut state, participant_id)
                .await;
            info!(
                "Participant {} left room {} ({} remaining)",
                participant_id,
                room_id,
                state.participants.len()
            );
        }
        self.registry.remove_if_empty(room_id).await;
        Ok(())
    }

    /// Full cleanup for a closed connection across every room it joined
    pub async fn disconnect(&self, participant_id: &str, rooms: &HashSet<String>) {
        for room_id in rooms {
            match self.leave_room(room_id, participant_id).await {
                Ok(()) => {}
                Err(
                    SessionError::RoomNotFound(_) | SessionError::ParticipantNotFound { .. },
                ) => {
                    debug!(
                        "Participant {} already gone from room {}",
                        participant_id, room_id
                    );
                }
                Err(e) => {
                    warn!(
                        "Cleanup of participant {} in room {} failed: {}",
                        participant_id, room_id, e
                    );
                }
            }
        }
    }

    /// Current state of one of a participant's consumers
    pub async fn consumer_state(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
    ) -> Option<ConsumerState> {
        let (_, state) = self.enter(room_id).await.ok()?;
        state
            .participants
            .get(participant_id)?
            .consumers
            .get(consumer_id)
            .map(|c| c.state)
    }

    /// Fans a notification out to everyone but `sender_id`, counting the ones dropped
    fn broadcast(&self, state: &RoomState, sender_id: &str, notification: &Notification) {
        let recipients = state.recipients_except(sender_id);
        let delivered = state.broadcast_except(sender_id, notification);
        self.metrics.add(
            Counter::NotificationsDropped,
            recipients.saturating_sub(delivered) as u64,
        );
    }

    // --- cascades (caller holds the room lock) ---

    async fn drop_consumer_in(&self, state: &mut RoomState, owner_id: &str, consumer_id: &str) -> bool {
        let removed = state
            .participants
            .get_mut(owner_id)
            .and_then(|p| p.consumers.remove(consumer_id));
        if removed.is_none() {
            return false;
        }

        self.engine.close_consumer(consumer_id).await;
        self.metrics.inc(Counter::ConsumersClosed);
        let delivered = state.send_to(
            owner_id,
            &Notification::ConsumerClosed {
                consumer_id: consumer_id.to_string(),
            },
        );
        if !delivered {
            self.metrics.inc(Counter::NotificationsDropped);
        }
        true
    }

    async fn close_producer_in(&self, state: &mut RoomState, owner_id: &str, producer_id: &str) -> bool {
        let Some(owner) = state.participants.get_mut(owner_id) else {
            return false;
        };
        if owner.producers.remove(producer_id).is_none() {
            return false;
        }
        owner.closed_producers.insert(producer_id.to_string());

        self.engine.close_producer(producer_id).await;
        for (consumer_owner, consumer_id) in state.consumers_of(producer_id) {
            self.drop_consumer_in(state, &consumer_owner, &consumer_id)
                .await;
        }
        debug!("Closed producer {} of participant {}", producer_id, owner_id);
        true
    }

    async fn close_transport_in(&self, state: &mut RoomState, owner_id: &str, transport_id: &str) -> bool {
        let Some(participant) = state.participants.get_mut(owner_id) else {
            return false;
        };
        let was_producer = participant.producer_transports.remove(transport_id);
        let was_consumer = participant.consumer_transports.remove(transport_id);
        if !was_producer && !was_consumer {
            return false;
        }

        let producers: Vec<String> = participant
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        let consumers: Vec<String> = participant
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();

        for producer_id in &producers {
            self.close_producer_in(state, owner_id, producer_id).await;
        }
        for consumer_id in &consumers {
            self.drop_consumer_in(state, owner_id, consumer_id).await;
        }
        self.engine.close_transport(transport_id).await;
        debug!("Closed transport {} of participant {}", transport_id, owner_id);
        true
    }

    async fn remove_participant_in(&self, state: &mut RoomState, participant_id: &str) -> bool {
        let Some(participant) = state.participants.get(participant_id) else {
            return false;
        };
        for transport_id in participant.all_transports() {
            self.close_transport_in(state, participant_id, &transport_id)
                .await;
        }

        state.remove_participant(participant_id);
        self.metrics.inc_leaves();
        self.broadcast(
            state,
            participant_id,
            &Notification::ParticipantLeft {
                participant_id: participant_id.to_string(),
            },
        );
        true
    }

    // --- media engine events ---

    async fn media_event_task(mut events: MediaEvents, orchestrator: Weak<Self>) {
        while let Some(event) = events.recv().await {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            orchestrator.handle_media_event(event).await;
        }
        debug!("Media event stream ended");
    }

    /// Applies a resource closure or failure reported by the engine
    pub async fn handle_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::TransportClosed { transport_id } => {
                for room in self.registry.snapshot() {
                    let mut state = room.lock().await;
                    if let Some(owner) = state.owner_of_transport(&transport_id) {
                        warn!(
                            "Transport {} of participant {} closed by the media engine",
                            transport_id, owner
                        );
                        self.close_transport_in(&mut state, &owner, &transport_id)
                            .await;
                        return;
                    }
                }
            }
            MediaEvent::ProducerClosed { producer_id } => {
                for room in self.registry.snapshot() {
                    let mut state = room.lock().await;
                    if let Some(owner) = state.owner_of_producer(&producer_id) {
                        warn!(
                            "Producer {} of participant {} closed by the media engine",
                            producer_id, owner
                        );
                        self.close_producer_in(&mut state, &owner, &producer_id)
                            .await;
                        return;
                    }
                }
            }
            MediaEvent::ConsumerClosed { consumer_id } => {
                for room in self.registry.snapshot() {
                    let mut state = room.lock().await;
                    if let Some(owner) = state.owner_of_consumer(&consumer_id) {
                        self.drop_consumer_in(&mut state, &owner, &consumer_id)
                            .await;
                        return;
                    }
                }
            }
            MediaEvent::EngineDied { reason } => {
                if self.engine_alive.swap(false, Ordering::SeqCst) {
                    error!("Media engine died ({}), shutting down", reason);
                    self.shutdown.cancel();
                }
            }
        }
    }

    /// Closes every room and its resources
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let rooms = self.registry.drain();
        for room in &rooms {
            let mut state = room.lock().await;
            let participant_ids: Vec<String> = state.participants.keys().cloned().collect();
            for participant_id in &participant_ids {
                self.remove_participant_in(&mut state, participant_id)
                    .await;
            }
            state.close();
            drop(state);

            if let Some(router) = room.router() {
                self.engine.close_router(&router.id).await;
            }
            info!(
                "Shut down room {} ({} participants)",
                room.id,
                participant_ids.len()
            );
        }
        info!("All rooms shut down ({} total)", rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LoopbackEngine, MediaResult, RouterInfo};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        engine: Arc<LoopbackEngine>,
        orchestrator: Arc<SessionOrchestrator>,
        shutdown: CancellationToken,
    }

    struct Client {
        id: String,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        async fn next(&mut self) -> Notification {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("channel closed");
            serde_json::from_str(&frame).unwrap()
        }
    }

    fn harness_with(limits: RoomLimits) -> Harness {
        let (engine, events) = LoopbackEngine::new();
        let engine = Arc::new(engine);
        let shutdown = CancellationToken::new();
        let orchestrator = SessionOrchestrator::new(
            engine.clone(),
            events,
            limits,
            ServerMetrics::new(),
            shutdown.clone(),
        );
        Harness {
            engine,
            orchestrator,
            shutdown,
        }
    }

    fn harness() -> Harness {
        harness_with(RoomLimits::default())
    }

    fn video_rtp_parameters() -> Value {
        json!({
            "mid": "0",
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 22222222 }]
        })
    }

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }] })
    }

    impl Harness {
        async fn join(&self, room_id: &str, id: &str) -> Client {
            let (tx, rx) = mpsc::channel(64);
            self.orchestrator.join_room(room_id, id, tx).await.unwrap();
            Client { id: id.to_string(), rx }
        }

        /// Producer transport + video producer; returns the producer id
        async fn publish(&self, room_id: &str, client: &Client) -> String {
            let o = &self.orchestrator;
            let t = o
                .create_transport(room_id, &client.id, TransportDirection::Producer)
                .await
                .unwrap();
            o.connect_transport(room_id, &client.id, TransportDirection::Producer, &t.id, dtls())
                .await
                .unwrap();
            o.produce(room_id, &client.id, &t.id, MediaKind::Video, video_rtp_parameters(), json!({}))
                .await
                .unwrap()
        }

        async fn consumer_transport(&self, room_id: &str, client: &Client) -> String {
            let o = &self.orchestrator;
            let t = o
                .create_transport(room_id, &client.id, TransportDirection::Consumer)
                .await
                .unwrap();
            o.connect_transport(room_id, &client.id, TransportDirection::Consumer, &t.id, dtls())
                .await
                .unwrap();
            t.id
        }

        async fn subscribe(&self, room_id: &str, client: &Client, producer_id: &str) -> ConsumerInfo {
            let transport_id = self.consumer_transport(room_id, client).await;
            self.orchestrator
                .consume(
                    room_id,
                    &client.id,
                    &transport_id,
                    producer_id,
                    LoopbackEngine::router_capabilities(),
                )
                .await
                .unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_share_one_router() {
        let h = harness();
        let mut handles = Vec::new();
        for i in 0..12 {
            let orchestrator = h.orchestrator.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(8);
                orchestrator
                    .join_room("r1", &format!("p{i}"), tx)
                    .await
                    .unwrap();
                rx
            }));
        }
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }

        assert_eq!(h.engine.routers_created(), 1);
        assert_eq!(h.orchestrator.registry().room_count(), 1);
        assert_eq!(h.orchestrator.registry().participant_count(), 12);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let h = harness();
        let _a = h.join("r1", "a").await;
        let (tx, _rx) = mpsc::channel(8);
        h.orchestrator.join_room("r1", "a", tx).await.unwrap();
        assert_eq!(h.orchestrator.registry().participant_count(), 1);
        assert_eq!(h.engine.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_join_validation_and_limits() {
        let h = harness_with(RoomLimits {
            max_rooms: 1,
            max_participants_per_room: 2,
        });
        let (tx, _rx) = mpsc::channel(8);

        assert!(matches!(
            h.orchestrator.join_room("", "a", tx.clone()).await,
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.orchestrator.join_room(&"x".repeat(129), "a", tx.clone()).await,
            Err(SessionError::InvalidRequest(_))
        ));

        let _a = h.join("r1", "a").await;
        let _b = h.join("r1", "b").await;
        let err = h.orchestrator.join_room("r1", "c", tx.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "RoomFull");
        let err = h.orchestrator.join_room("r2", "c", tx).await.unwrap_err();
        assert_eq!(err.kind(), "TooManyRooms");
    }

    #[tokio::test]
    async fn test_unknown_room_and_non_member() {
        let h = harness();
        let o = &h.orchestrator;
        assert!(matches!(
            o.get_router_rtp_capabilities("nope").await,
            Err(SessionError::RoomNotFound(_))
        ));
        assert!(matches!(
            o.create_transport("nope", "a", TransportDirection::Producer).await,
            Err(SessionError::RoomNotFound(_))
        ));

        let _a = h.join("r1", "a").await;
        let caps = o.get_router_rtp_capabilities("r1").await.unwrap();
        assert!(caps["codecs"].is_array());
        assert!(matches!(
            o.create_transport("r1", "stranger", TransportDirection::Producer).await,
            Err(SessionError::ParticipantNotFound { .. })
        ));
        assert!(matches!(
            o.get_producers("r1", "stranger").await,
            Err(SessionError::ParticipantNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_lookup_is_per_owner_and_direction() {
        let h = harness();
        let o = &h.orchestrator;
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;

        let send = o
            .create_transport("r1", &a.id, TransportDirection::Producer)
            .await
            .unwrap();

        // Another participant cannot touch it
        let err = o
            .connect_transport("r1", &b.id, TransportDirection::Producer, &send.id, dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportNotFound(_)));

        // Wrong direction
        let err = o
            .connect_transport("r1", &a.id, TransportDirection::Consumer, &send.id, dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportNotFound(_)));

        // Engine rejects malformed parameters
        let err = o
            .connect_transport("r1", &a.id, TransportDirection::Producer, &send.id, json!(42))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MediaEngineError");

        let err = o
            .produce("r1", &b.id, &send.id, MediaKind::Audio, json!({}), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_new_producer_goes_to_everyone_else() {
        let h = harness();
        let mut a = h.join("r1", "a").await;
        let mut b = h.join("r1", "b").await;
        let mut c = h.join("r1", "c").await;

        let producer_id = h.publish("r1", &a).await;

        let expected = Notification::NewProducer {
            producer_id: producer_id.clone(),
            producer_socket_id: "a".into(),
            kind: MediaKind::Video,
        };
        assert_eq!(b.drain(), vec![expected.clone()]);
        assert_eq!(c.drain(), vec![expected]);
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_get_producers_excludes_caller() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;
        let pa = h.publish("r1", &a).await;
        let pb = h.publish("r1", &b).await;

        let seen_by_a = h.orchestrator.get_producers("r1", "a").await.unwrap();
        assert_eq!(
            seen_by_a,
            vec![ProducerSummary {
                id: pb.clone(),
                kind: MediaKind::Video,
                participant_id: "b".into(),
            }]
        );
        let seen_by_b = h.orchestrator.get_producers("r1", "b").await.unwrap();
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].id, pa);
    }

    #[tokio::test]
    async fn test_consume_missing_producer() {
        let h = harness();
        let b = h.join("r1", "b").await;
        let transport_id = h.consumer_transport("r1", &b).await;

        let err = h
            .orchestrator
            .consume("r1", "b", &transport_id, "ghost", LoopbackEngine::router_capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProducerNotFound(_)));
        assert_eq!(h.engine.consumer_count(), 0);

        let (_, state) = h.orchestrator.enter("r1").await.unwrap();
        assert!(state.participants.values().all(|p| p.consumers.is_empty()));
    }

    #[tokio::test]
    async fn test_consume_incompatible_capabilities() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;
        let producer_id = h.publish("r1", &a).await;
        let transport_id = h.consumer_transport("r1", &b).await;

        let audio_only = json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] });
        let err = h
            .orchestrator
            .consume("r1", "b", &transport_id, &producer_id, audio_only)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "IncompatibleCapabilities");
        assert_eq!(h.engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_state_machine() {
        let h = harness();
        let o = &h.orchestrator;
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;
        let producer_id = h.publish("r1", &a).await;

        let consumer = h.subscribe("r1", &b, &producer_id).await;
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(o.consumer_state("r1", "b", &consumer.id).await, Some(ConsumerState::Paused));
        assert_eq!(h.engine.consumer_paused(&consumer.id), Some(true));

        o.resume_consumer("r1", "b", &consumer.id).await.unwrap();
        assert_eq!(o.consumer_state("r1", "b", &consumer.id).await, Some(ConsumerState::Active));
        assert_eq!(h.engine.consumer_paused(&consumer.id), Some(false));
        o.resume_consumer("r1", "b", &consumer.id).await.unwrap();

        o.pause_consumer("r1", "b", &consumer.id).await.unwrap();
        assert_eq!(o.consumer_state("r1", "b", &consumer.id).await, Some(ConsumerState::Paused));

        // Not the owner
        assert!(matches!(
            o.resume_consumer("r1", "a", &consumer.id).await,
            Err(SessionError::ConsumerNotFound(_))
        ));
        assert!(matches!(
            o.resume_consumer("r1", "b", "ghost").await,
            Err(SessionError::ConsumerNotFound(_))
        ));

        o.close_producer("r1", "a", &producer_id).await.unwrap();
        assert!(matches!(
            o.resume_consumer("r1", "b", &consumer.id).await,
            Err(SessionError::ConsumerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_producer_closes_each_consumer_once() {
        let h = harness();
        let o = &h.orchestrator;
        let a = h.join("r1", "a").await;
        let mut b = h.join("r1", "b").await;
        let mut c = h.join("r1", "c").await;
        let producer_id = h.publish("r1", &a).await;
        let other_producer = h.publish("r1", &c).await;

        let cb = h.subscribe("r1", &b, &producer_id).await;
        let cc = h.subscribe("r1", &c, &producer_id).await;
        let cb_other = h.subscribe("r1", &b, &other_producer).await;
        b.drain();
        c.drain();

        assert!(matches!(
            o.close_producer("r1", "b", &producer_id).await,
            Err(SessionError::ProducerNotFound(_))
        ));
        o.close_producer("r1", "a", &producer_id).await.unwrap();

        assert_eq!(b.drain(), vec![Notification::ConsumerClosed { consumer_id: cb.id.clone() }]);
        assert_eq!(c.drain(), vec![Notification::ConsumerClosed { consumer_id: cc.id.clone() }]);
        assert!(!h.engine.has_producer(&producer_id));
        assert!(!h.engine.has_consumer(&cb.id));
        assert!(h.engine.has_consumer(&cb_other.id));

        // Second close by the owner is a no-op and notifies nobody
        o.close_producer("r1", "a", &producer_id).await.unwrap();
        assert!(b.drain().is_empty());
        assert!(c.drain().is_empty());
        assert_eq!(h.orchestrator.metrics.get(Counter::ConsumersClosed), 2);

        // Anyone else still gets ProducerNotFound
        assert!(matches!(
            o.close_producer("r1", "c", &producer_id).await,
            Err(SessionError::ProducerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_broadcasts_are_counted() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;
        let mut c = h.join("r1", "c").await;
        drop(b);

        h.publish("r1", &a).await;
        assert_eq!(c.drain().len(), 1);
        assert_eq!(h.orchestrator.metrics.get(Counter::NotificationsDropped), 1);

        h.orchestrator.leave_room("r1", "a").await.unwrap();
        assert_eq!(
            c.drain(),
            vec![Notification::ParticipantLeft { participant_id: "a".into() }]
        );
        assert_eq!(h.orchestrator.metrics.get(Counter::NotificationsDropped), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cascades() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let mut b = h.join("r1", "b").await;
        let mut c = h.join("r1", "c").await;
        let producer_id = h.publish("r1", &a).await;
        let consumer = h.subscribe("r1", &b, &producer_id).await;
        b.drain();
        c.drain();

        let rooms: HashSet<String> = ["r1".to_string()].into_iter().collect();
        h.orchestrator.disconnect("a", &rooms).await;

        assert_eq!(h.orchestrator.registry().participant_count(), 2);
        assert_eq!(
            b.drain(),
            vec![
                Notification::ConsumerClosed { consumer_id: consumer.id.clone() },
                Notification::ParticipantLeft { participant_id: "a".into() },
            ]
        );
        assert_eq!(
            c.drain(),
            vec![Notification::ParticipantLeft { participant_id: "a".into() }]
        );
        assert!(!h.engine.has_producer(&producer_id));

        // Redundant cleanup is harmless
        h.orchestrator.disconnect("a", &rooms).await;
        assert!(b.drain().is_empty());
        assert!(h.orchestrator.get_producers("r1", "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_leave_removes_room() {
        let h = harness();
        let _a = h.join("r1", "a").await;
        let _b = h.join("r1", "b").await;

        h.orchestrator.leave_room("r1", "a").await.unwrap();
        assert!(h.orchestrator.registry().find("r1").is_ok());
        h.orchestrator.leave_room("r1", "b").await.unwrap();

        assert!(matches!(
            h.orchestrator.registry().find("r1"),
            Err(SessionError::RoomNotFound(_))
        ));
        assert_eq!(h.engine.router_count(), 0);
        assert!(matches!(
            h.orchestrator.leave_room("r1", "b").await,
            Err(SessionError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scenario_late_viewer() {
        let h = harness();
        let o = &h.orchestrator;

        let mut a = h.join("r1", "A").await;
        let caps = o.get_router_rtp_capabilities("r1").await.unwrap();
        assert!(caps.is_object());
        let p1 = h.publish("r1", &a).await;

        let b = h.join("r1", "B").await;
        let producers = o.get_producers("r1", "B").await.unwrap();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].id, p1);
        assert_eq!(producers[0].participant_id, "A");

        let consumer = h.subscribe("r1", &b, &p1).await;
        assert_eq!(o.consumer_state("r1", "B", &consumer.id).await, Some(ConsumerState::Paused));
        o.resume_consumer("r1", "B", &consumer.id).await.unwrap();
        assert_eq!(o.consumer_state("r1", "B", &consumer.id).await, Some(ConsumerState::Active));

        // A joined first, so it heard nothing about B's (absent) producers
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_publisher_drops_mid_stream() {
        let h = harness();
        let a = h.join("r1", "A").await;
        let p1 = h.publish("r1", &a).await;
        let mut b = h.join("r1", "B").await;
        let consumer = h.subscribe("r1", &b, &p1).await;
        h.orchestrator.resume_consumer("r1", "B", &consumer.id).await.unwrap();

        let rooms: HashSet<String> = ["r1".to_string()].into_iter().collect();
        drop(a);
        h.orchestrator.disconnect("A", &rooms).await;

        let notes = b.drain();
        assert!(notes.contains(&Notification::ConsumerClosed { consumer_id: consumer.id.clone() }));
        assert!(notes.contains(&Notification::ParticipantLeft { participant_id: "A".into() }));

        h.orchestrator.leave_room("r1", "B").await.unwrap();
        assert_eq!(h.orchestrator.registry().room_count(), 0);
        assert_eq!(h.engine.router_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_closes_transport_underneath() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let mut b = h.join("r1", "b").await;
        let producer_id = h.publish("r1", &a).await;
        let consumer = h.subscribe("r1", &b, &producer_id).await;
        b.drain();

        let transport_id = {
            let (_, state) = h.orchestrator.enter("r1").await.unwrap();
            state.participants["b"].consumers[&consumer.id].transport_id.clone()
        };
        h.engine.fail_transport(&transport_id);

        assert_eq!(
            b.next().await,
            Notification::ConsumerClosed { consumer_id: consumer.id.clone() }
        );
        let (_, state) = h.orchestrator.enter("r1").await.unwrap();
        assert!(state.participants["b"].consumer_transports.is_empty());
    }

    #[tokio::test]
    async fn test_engine_closes_producer_underneath() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let mut b = h.join("r1", "b").await;
        let producer_id = h.publish("r1", &a).await;
        let consumer = h.subscribe("r1", &b, &producer_id).await;
        b.drain();

        h.engine.fail_producer(&producer_id);
        assert_eq!(
            b.next().await,
            Notification::ConsumerClosed { consumer_id: consumer.id }
        );
        assert!(h.orchestrator.get_producers("r1", "b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consume_before_producer_event_applies() {
        // Orchestrator listens on a stream the engine never writes to, so the
        // engine-side closure is not yet reflected in room state
        let (engine, _undelivered) = LoopbackEngine::new();
        let engine = Arc::new(engine);
        let (_sink, idle_events) = mpsc::unbounded_channel();
        let h = Harness {
            orchestrator: SessionOrchestrator::new(
                engine.clone(),
                idle_events,
                RoomLimits::default(),
                ServerMetrics::new(),
                CancellationToken::new(),
            ),
            engine,
            shutdown: CancellationToken::new(),
        };
        let a = h.join("r1", "a").await;
        let b = h.join("r1", "b").await;
        let producer_id = h.publish("r1", &a).await;
        let transport_id = h.consumer_transport("r1", &b).await;

        h.engine.fail_producer(&producer_id);
        let err = h
            .orchestrator
            .consume("r1", "b", &transport_id, &producer_id, LoopbackEngine::router_capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProducerNotFound(_)));
        assert_eq!(h.engine.consumer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_produce_and_leave_do_not_interleave() {
        let h = harness();
        for round in 0..50 {
            let room_id = format!("r{round}");
            let a = h.join(&room_id, "a").await;
            let mut b = h.join(&room_id, "b").await;
            let transport = h
                .orchestrator
                .create_transport(&room_id, "a", TransportDirection::Producer)
                .await
                .unwrap();
            h.orchestrator
                .connect_transport(&room_id, "a", TransportDirection::Producer, &transport.id, dtls())
                .await
                .unwrap();

            let o = h.orchestrator.clone();
            let (room, tid) = (room_id.clone(), transport.id.clone());
            let produce = tokio::spawn(async move {
                o.produce(&room, "a", &tid, MediaKind::Video, video_rtp_parameters(), json!({}))
                    .await
            });
            let o = h.orchestrator.clone();
            let room = room_id.clone();
            let leave = tokio::spawn(async move { o.leave_room(&room, "b").await });

            let producer_id = produce.await.unwrap().unwrap();
            leave.await.unwrap().unwrap();

            // b either heard about the producer before leaving or not at all,
            // and the room holds no sender for it afterwards
            let mut heard = Vec::new();
            while let Some(frame) = tokio::time::timeout(Duration::from_secs(2), b.rx.recv())
                .await
                .expect("room still holds a sender for b")
            {
                heard.push(serde_json::from_str::<Notification>(&frame).unwrap());
            }
            assert!(heard.len() <= 1, "round {round}: {heard:?}");
            if let Some(note) = heard.first() {
                assert_eq!(
                    note,
                    &Notification::NewProducer {
                        producer_id: producer_id.clone(),
                        producer_socket_id: "a".into(),
                        kind: MediaKind::Video,
                    }
                );
            }
            assert!(h.engine.has_producer(&producer_id));
            h.orchestrator.leave_room(&room_id, &a.id).await.unwrap();
        }
        assert_eq!(h.orchestrator.registry().room_count(), 0);
        assert_eq!(h.orchestrator.metrics.get(Counter::NotificationsDropped), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consume_and_close_producer_do_not_interleave() {
        let h = harness();
        for round in 0..50 {
            let room_id = format!("r{round}");
            let a = h.join(&room_id, "a").await;
            let mut b = h.join(&room_id, "b").await;
            let producer_id = h.publish(&room_id, &a).await;
            let transport_id = h.consumer_transport(&room_id, &b).await;
            b.drain();

            let o = h.orchestrator.clone();
            let (room, tid, pid) = (room_id.clone(), transport_id.clone(), producer_id.clone());
            let consume = tokio::spawn(async move {
                o.consume(&room, "b", &tid, &pid, LoopbackEngine::router_capabilities())
                    .await
            });
            let o = h.orchestrator.clone();
            let (room, pid) = (room_id.clone(), producer_id.clone());
            let close = tokio::spawn(async move { o.close_producer(&room, "a", &pid).await });

            let consumed = consume.await.unwrap();
            close.await.unwrap().unwrap();

            match consumed {
                // Consumer was created first, so the close must have taken it down
                Ok(info) => {
                    assert!(!h.engine.has_consumer(&info.id), "round {round}");
                    assert_eq!(
                        b.drain(),
                        vec![Notification::ConsumerClosed { consumer_id: info.id.clone() }]
                    );
                    assert_eq!(h.orchestrator.consumer_state(&room_id, "b", &info.id).await, None);
                }
                Err(err) => {
                    assert!(matches!(err, SessionError::ProducerNotFound(_)), "round {round}: {err:?}");
                    assert!(b.drain().is_empty());
                }
            }
            assert_eq!(h.engine.consumer_count(), 0);
            assert!(!h.engine.has_producer(&producer_id));

            h.orchestrator.leave_room(&room_id, &a.id).await.unwrap();
            h.orchestrator.leave_room(&room_id, &b.id).await.unwrap();
        }
    }

    /// Loopback engine whose `produce` waits until the test opens the gate
    struct GatedEngine {
        inner: LoopbackEngine,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl MediaEngine for GatedEngine {
        async fn create_router(&self) -> MediaResult<RouterInfo> {
            self.inner.create_router().await
        }

        async fn close_router(&self, router_id: &str) {
            self.inner.close_router(router_id).await
        }

        async fn create_transport(
            &self,
            router_id: &str,
            direction: TransportDirection,
        ) -> MediaResult<TransportInfo> {
            self.inner.create_transport(router_id, direction).await
        }

        async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
            self.inner.connect_transport(transport_id, dtls_parameters).await
        }

        async fn close_transport(&self, transport_id: &str) {
            self.inner.close_transport(transport_id).await
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: Value,
            app_data: Value,
        ) -> MediaResult<String> {
            let _open = self.gate.acquire().await.unwrap();
            self.inner
                .produce(transport_id, kind, rtp_parameters, app_data)
                .await
        }

        async fn close_producer(&self, producer_id: &str) {
            self.inner.close_producer(producer_id).await
        }

        fn can_consume(
            &self,
            router_id: &str,
            producer_id: &str,
            rtp_capabilities: &Value,
        ) -> MediaResult<bool> {
            self.inner.can_consume(router_id, producer_id, rtp_capabilities)
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            rtp_capabilities: Value,
        ) -> MediaResult<ConsumerInfo> {
            self.inner
                .consume(transport_id, producer_id, rtp_capabilities)
                .await
        }

        async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
            self.inner.pause_consumer(consumer_id).await
        }

        async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
            self.inner.resume_consumer(consumer_id).await
        }

        async fn close_consumer(&self, consumer_id: &str) {
            self.inner.close_consumer(consumer_id).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_invisible_until_engine_confirms() {
        let (inner, events) = LoopbackEngine::new();
        let engine = Arc::new(GatedEngine {
            inner,
            gate: tokio::sync::Semaphore::new(0),
        });
        let o = SessionOrchestrator::new(
            engine.clone(),
            events,
            RoomLimits::default(),
            ServerMetrics::new(),
            CancellationToken::new(),
        );
        let (tx, _rx_a) = mpsc::channel(8);
        o.join_room("r1", "a", tx).await.unwrap();
        let (tx, mut rx_b) = mpsc::channel(8);
        o.join_room("r1", "b", tx).await.unwrap();
        let transport = o
            .create_transport("r1", "a", TransportDirection::Producer)
            .await
            .unwrap();
        o.connect_transport("r1", "a", TransportDirection::Producer, &transport.id, dtls())
            .await
            .unwrap();

        let producer = {
            let o = o.clone();
            tokio::spawn(async move {
                o.produce("r1", "a", &transport.id, MediaKind::Video, video_rtp_parameters(), json!({}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listing = {
            let o = o.clone();
            tokio::spawn(async move { o.get_producers("r1", "b").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The engine has not answered yet: nothing listed, nothing announced
        assert!(!producer.is_finished());
        assert!(!listing.is_finished());
        assert!(rx_b.try_recv().is_err());

        engine.gate.add_permits(1);
        let producer_id = producer.await.unwrap().unwrap();
        let listed = listing.await.unwrap().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, producer_id);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_engine_death_stops_admission() {
        let h = harness();
        let _a = h.join("r1", "a").await;

        h.engine.kill("worker crashed");
        tokio::time::timeout(Duration::from_secs(2), h.shutdown.cancelled())
            .await
            .expect("shutdown was not requested");

        assert!(!h.orchestrator.is_accepting());
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            h.orchestrator.join_room("r2", "b", tx).await,
            Err(SessionError::EngineUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let h = harness();
        let a = h.join("r1", "a").await;
        let _b = h.join("r2", "b").await;
        let producer_id = h.publish("r1", &a).await;

        h.orchestrator.shutdown().await;
        assert_eq!(h.orchestrator.registry().room_count(), 0);
        assert_eq!(h.engine.router_count(), 0);
        assert!(!h.engine.has_producer(&producer_id));
    }
}
