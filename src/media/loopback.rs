#![forbid(unsafe_code)]

// In-process media engine without a packet path.
// Keeps the same resource graph a real SFU keeps (router -> transport ->
// producer/consumer) so the session layer can be driven end to end.

use crate::media::types::{
    ConsumerInfo, MediaError, MediaEvent, MediaKind, MediaResult, RouterInfo, TransportDirection,
    TransportInfo,
};
use crate::media::{MediaEngine, MediaEventSink, MediaEvents};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

struct LoopbackTransport {
    router_id: String,
    direction: TransportDirection,
    connected: bool,
}

struct LoopbackProducer {
    router_id: String,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
}

struct LoopbackConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct LoopbackState {
    routers: HashMap<String, Value>,
    transports: HashMap<String, LoopbackTransport>,
    producers: HashMap<String, LoopbackProducer>,
    consumers: HashMap<String, LoopbackConsumer>,
}

impl LoopbackState {
    fn drop_consumers_where(&mut self, pred: impl Fn(&LoopbackConsumer) -> bool) {
        self.consumers.retain(|_, c| !pred(c));
    }

    fn drop_producer(&mut self, producer_id: &str) {
        if self.producers.remove(producer_id).is_some() {
            self.drop_consumers_where(|c| c.producer_id == producer_id);
        }
    }

    fn drop_transport(&mut self, transport_id: &str) -> bool {
        if self.transports.remove(transport_id).is_none() {
            return false;
        }
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.drop_producer(&producer_id);
        }
        self.drop_consumers_where(|c| c.transport_id == transport_id);
        true
    }
}

/// Media engine that keeps all state in memory
pub struct LoopbackEngine {
    state: StdRwLock<LoopbackState>,
    events: MediaEventSink,
    alive: AtomicBool,
    routers_created: AtomicUsize,
    next_port: AtomicU16,
}

impl LoopbackEngine {
    /// Creates the engine together with the receiving end of its event stream
    pub fn new() -> (Self, MediaEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        info!("Loopback media engine started (no media path)");
        let engine = Self {
            state: StdRwLock::new(LoopbackState::default()),
            events: tx,
            alive: AtomicBool::new(true),
            routers_created: AtomicUsize::new(0),
            next_port: AtomicU16::new(40000),
        };
        (engine, rx)
    }

    /// Capabilities advertised by every loopback router
    pub fn router_capabilities() -> Value {
        json!({
            "codecs": [
                {
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "preferredPayloadType": 111,
                    "clockRate": 48000,
                    "channels": 2,
                    "parameters": { "minptime": 10, "useinbandfec": 1 },
                    "rtcpFeedback": [{ "type": "transport-cc", "parameter": "" }]
                },
                {
                    "kind": "video",
                    "mimeType": "video/VP8",
                    "preferredPayloadType": 96,
                    "clockRate": 90000,
                    "parameters": {},
                    "rtcpFeedback": [
                        { "type": "nack", "parameter": "" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "ccm", "parameter": "fir" },
                        { "type": "transport-cc", "parameter": "" }
                    ]
                },
                {
                    "kind": "video",
                    "mimeType": "video/H264",
                    "preferredPayloadType": 102,
                    "clockRate": 90000,
                    "parameters": {
                        "level-asymmetry-allowed": 1,
                        "packetization-mode": 1,
                        "profile-level-id": "42e01f"
                    },
                    "rtcpFeedback": [
                        { "type": "nack", "parameter": "" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "transport-cc", "parameter": "" }
                    ]
                }
            ],
            "headerExtensions": []
        })
    }

    /// Number of routers ever created by this engine
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }

    pub fn router_count(&self) -> usize {
        self.read().routers.len()
    }

    pub fn has_transport(&self, transport_id: &str) -> bool {
        self.read().transports.contains_key(transport_id)
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.read().producers.contains_key(producer_id)
    }

    pub fn has_consumer(&self, consumer_id: &str) -> bool {
        self.read().consumers.contains_key(consumer_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.read().consumers.len()
    }

    /// `Some(paused)` for a live consumer
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.read().consumers.get(consumer_id).map(|c| c.paused)
    }

    /// Closes a transport as if its router shut it down, raising an event
    pub fn fail_transport(&self, transport_id: &str) {
        let removed = self.write().drop_transport(transport_id);
        if removed {
            self.emit(MediaEvent::TransportClosed {
                transport_id: transport_id.to_string(),
            });
        }
    }

    /// Closes a producer underneath its owner, raising an event
    pub fn fail_producer(&self, producer_id: &str) {
        let removed = {
            let mut state = self.write();
            let existed = state.producers.contains_key(producer_id);
            state.drop_producer(producer_id);
            existed
        };
        if removed {
            self.emit(MediaEvent::ProducerClosed {
                producer_id: producer_id.to_string(),
            });
        }
    }

    /// Simulates the engine process dying
    pub fn kill(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            error!("Loopback media engine died: {}", reason);
            *self.write() = LoopbackState::default();
            self.emit(MediaEvent::EngineDied {
                reason: reason.to_string(),
            });
        }
    }

    fn emit(&self, event: MediaEvent) {
        if self.events.send(event).is_err() {
            debug!("Media event dropped: no listener");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LoopbackState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LoopbackState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_alive(&self) -> MediaResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MediaError::EngineClosed)
        }
    }
}

/// Mime types in a codec list (`codecs[].mimeType`), lower-cased
fn mime_types(value: &Value) -> Vec<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self) -> MediaResult<RouterInfo> {
        self.ensure_alive()?;
        let id = Uuid::new_v4().to_string();
        let rtp_capabilities = Self::router_capabilities();
        self.write().routers.insert(id.clone(), rtp_capabilities.clone());
        self.routers_created.fetch_add(1, Ordering::Relaxed);
        debug!("Created loopback router {}", id);
        Ok(RouterInfo {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) {
        let mut state = self.write();
        if state.routers.remove(router_id).is_none() {
            return;
        }
        let transports: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            state.drop_transport(&transport_id);
        }
        debug!("Closed loopback router {}", router_id);
    }

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        self.ensure_alive()?;
        let mut state = self.write();
        if !state.routers.contains_key(router_id) {
            return Err(MediaError::RouterError(format!("Router not found: {router_id}")));
        }

        let id = Uuid::new_v4().to_string();
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let fingerprint = Uuid::new_v4().simple().to_string().to_uppercase();
        let info = TransportInfo {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1076302079u32,
                "address": "127.0.0.1",
                "protocol": "udp",
                "port": port,
                "type": "host"
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }]
            }),
        };
        state.transports.insert(
            id,
            LoopbackTransport {
                router_id: router_id.to_string(),
                direction,
                connected: false,
            },
        );
        Ok(info)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_alive()?;
        if !dtls_parameters.is_object() {
            return Err(MediaError::InvalidParameters(
                "dtlsParameters must be an object".to_string(),
            ));
        }
        let mut state = self.write();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Transport {transport_id}")))?;
        if transport.connected {
            return Err(MediaError::TransportError(format!(
                "Transport {transport_id} is already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) {
        self.write().drop_transport(transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        _app_data: Value,
    ) -> MediaResult<String> {
        self.ensure_alive()?;
        if !rtp_parameters.is_object() {
            return Err(MediaError::InvalidParameters(
                "rtpParameters must be an object".to_string(),
            ));
        }
        let mut state = self.write();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Transport {transport_id}")))?;
        if transport.direction != TransportDirection::Producer {
            return Err(MediaError::ProducerError(format!(
                "Transport {transport_id} cannot send media"
            )));
        }
        let router_id = transport.router_id.clone();

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            LoopbackProducer {
                router_id,
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters,
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) {
        self.write().drop_producer(producer_id);
    }

    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> MediaResult<bool> {
        let state = self.read();
        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| p.router_id == router_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Producer {producer_id}")))?;

        let offered = mime_types(rtp_capabilities);
        let sent = mime_types(&producer.rtp_parameters);
        let prefix = format!("{}/", producer.kind);
        Ok(if sent.is_empty() {
            offered.iter().any(|m| m.starts_with(&prefix))
        } else {
            sent.iter().any(|m| offered.contains(m))
        })
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        self.ensure_alive()?;
        let mut state = self.write();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Transport {transport_id}")))?;
        if transport.direction != TransportDirection::Consumer {
            return Err(MediaError::ConsumerError(format!(
                "Transport {transport_id} cannot receive media"
            )));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Producer {producer_id}")))?;

        let info = ConsumerInfo {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        };
        state.consumers.insert(
            info.id.clone(),
            LoopbackConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );
        Ok(info)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.ensure_alive()?;
        let mut state = self.write();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Consumer {consumer_id}")))?;
        consumer.paused = true;
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.ensure_alive()?;
        let mut state = self.write();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Consumer {consumer_id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.write().consumers.remove(consumer_id);
    }
}
