#![forbid(unsafe_code)]

// Media engine backed by a pool of mediasoup workers

use crate::config::MediaSettings;
use crate::media::config;
use crate::media::types::{
    ConsumerInfo, MediaError, MediaEvent, MediaKind, MediaResult, RouterInfo, TransportDirection,
    TransportInfo,
};
use crate::media::{MediaEngine, MediaEventSink, MediaEvents};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::MediaKind as SfuMediaKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Media engine using mediasoup workers, one router per room
pub struct MediasoupEngine {
    _worker_manager: mediasoup::worker_manager::WorkerManager,
    workers: Vec<Worker>,
    next_worker_idx: AtomicUsize,
    listen_info: ListenInfo,
    routers: StdRwLock<HashMap<String, Router>>,
    transports: StdRwLock<HashMap<String, WebRtcTransport>>,
    producers: StdRwLock<HashMap<String, (Producer, String)>>,
    consumers: StdRwLock<HashMap<String, (Consumer, String)>>,
    events: MediaEventSink,
}

impl MediasoupEngine {
    /// Spawns the worker pool
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn new(settings: &MediaSettings) -> MediaResult<(Self, MediaEvents)> {
        let num_workers = config::worker_count(settings);
        info!("Creating mediasoup engine with {} workers", num_workers);

        let (events, rx) = mpsc::unbounded_channel();
        let worker_manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let worker = worker_manager
                .create_worker(config::worker_settings(settings))
                .await
                .map_err(|e| MediaError::RouterError(format!("Failed to create worker: {e}")))?;
            info!("Created worker {} with id: {}", i, worker.id());

            let sink = events.clone();
            worker
                .on_dead(move |reason| {
                    error!("Worker (index {}) died: {:?}", i, reason);
                    let _ = sink.send(MediaEvent::EngineDied {
                        reason: format!("worker {i} died: {reason:?}"),
                    });
                })
                .detach();

            workers.push(worker);
        }

        let engine = Self {
            _worker_manager: worker_manager,
            workers,
            next_worker_idx: AtomicUsize::new(0),
            listen_info: config::listen_info(settings),
            routers: StdRwLock::new(HashMap::new()),
            transports: StdRwLock::new(HashMap::new()),
            producers: StdRwLock::new(HashMap::new()),
            consumers: StdRwLock::new(HashMap::new()),
            events,
        };
        Ok((engine, rx))
    }

    fn next_worker(&self) -> MediaResult<&Worker> {
        if self.workers.is_empty() {
            return Err(MediaError::EngineClosed);
        }
        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[idx];
        if worker.closed() {
            return Err(MediaError::EngineClosed);
        }
        Ok(worker)
    }

    fn router(&self, router_id: &str) -> MediaResult<Router> {
        self.routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(router_id)
            .cloned()
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Router {router_id}")))
    }

    fn transport(&self, transport_id: &str) -> MediaResult<WebRtcTransport> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(transport_id)
            .cloned()
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Transport {transport_id}")))
    }

    fn consumer(&self, consumer_id: &str) -> MediaResult<Consumer> {
        self.consumers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(consumer_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Consumer {consumer_id}")))
    }

    /// Removes handles whose producer was closed; dropping them closes them in the worker
    fn forget_consumers_of(&self, producer_id: ProducerId) {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, (c, _)| c.producer_id() != producer_id);
    }

    fn setup_transport_handlers(&self, transport: &WebRtcTransport) {
        let transport_id = transport.id().to_string();
        let sink = self.events.clone();
        transport
            .on_close(Box::new(move || {
                debug!("Transport {} closed", transport_id);
                let _ = sink.send(MediaEvent::TransportClosed { transport_id });
            }))
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer) {
        let producer_id = producer.id().to_string();
        let sink = self.events.clone();
        producer
            .on_close(move || {
                debug!("Producer {} closed", producer_id);
                let _ = sink.send(MediaEvent::ProducerClosed { producer_id });
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer) {
        let consumer_id = consumer.id().to_string();
        let sink = self.events.clone();
        consumer
            .on_close(move || {
                debug!("Consumer {} closed", consumer_id);
                let _ = sink.send(MediaEvent::ConsumerClosed { consumer_id });
            })
            .detach();
    }
}

fn from_blob<T: DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

fn to_blob<T: Serialize>(value: &T) -> MediaResult<Value> {
    serde_json::to_value(value).map_err(|e| MediaError::InvalidParameters(e.to_string()))
}

fn to_sfu_kind(kind: MediaKind) -> SfuMediaKind {
    match kind {
        MediaKind::Audio => SfuMediaKind::Audio,
        MediaKind::Video => SfuMediaKind::Video,
    }
}

fn from_sfu_kind(kind: SfuMediaKind) -> MediaKind {
    match kind {
        SfuMediaKind::Audio => MediaKind::Audio,
        SfuMediaKind::Video => MediaKind::Video,
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self) -> MediaResult<RouterInfo> {
        let worker = self.next_worker()?;
        let router = worker
            .create_router(RouterOptions::new(config::media_codecs()))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        let id = router.id().to_string();
        let rtp_capabilities = to_blob(router.rtp_capabilities())?;
        info!("Created router {} on worker {}", id, worker.id());

        self.routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), router);
        Ok(RouterInfo {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) {
        // Router is closed when its last handle is dropped
        if self
            .routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(router_id)
            .is_some()
        {
            info!("Removed router {}", router_id);
        }
    }

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let router = self.router(router_id)?;
        let options =
            WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(self.listen_info.clone()));
        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| {
                MediaError::TransportError(format!("Failed to create {direction} transport: {e}"))
            })?;

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: to_blob(transport.ice_parameters())?,
            ice_candidates: to_blob(transport.ice_candidates())?,
            dtls_parameters: to_blob(&transport.dtls_parameters())?,
        };
        self.setup_transport_handlers(&transport);
        self.transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.id.clone(), transport);

        debug!("Created {} transport {} on router {}", direction, info.id, router_id);
        Ok(info)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_blob(dtls_parameters, "dtlsParameters")?;
        let transport = self.transport(transport_id)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) {
        let removed = self
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(transport_id);
        if removed.is_none() {
            return;
        }

        let producers: Vec<Producer> = {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = producers
                .iter()
                .filter(|(_, (_, t))| t == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| producers.remove(id).map(|(p, _)| p))
                .collect()
        };
        for producer in producers {
            self.forget_consumers_of(producer.id());
        }
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, (_, t)| t != transport_id);
        debug!("Closed transport {}", transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> MediaResult<String> {
        let rtp_parameters: RtpParameters = from_blob(rtp_parameters, "rtpParameters")?;
        let transport = self.transport(transport_id)?;

        let mut options = ProducerOptions::new(to_sfu_kind(kind), rtp_parameters);
        options.app_data = AppData::new(app_data);
        let producer = transport
            .produce(options)
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let id = producer.id().to_string();
        self.setup_producer_handlers(&producer);
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), (producer, transport_id.to_string()));
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) {
        let removed = self
            .producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(producer_id);
        if let Some((producer, _)) = removed {
            self.forget_consumers_of(producer.id());
        }
    }

    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> MediaResult<bool> {
        let router = self.router(router_id)?;
        let sfu_producer_id = self
            .producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(producer_id)
            .filter(|(p, _)| !p.closed())
            .map(|(p, _)| p.id())
            .ok_or_else(|| MediaError::ResourceNotFound(format!("Producer {producer_id}")))?;
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(caps) => Ok(router.can_consume(&sfu_producer_id, &caps)),
            Err(e) => {
                warn!("Unparseable rtpCapabilities: {}", e);
                Ok(false)
            }
        }
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        let rtp_capabilities: RtpCapabilities = from_blob(rtp_capabilities, "rtpCapabilities")?;
        let sfu_producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::InvalidParameters(format!("Invalid producer id: {producer_id}")))?;
        let transport = self.transport(transport_id)?;

        let mut options = ConsumerOptions::new(sfu_producer_id, rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: from_sfu_kind(consumer.kind()),
            rtp_parameters: to_blob(consumer.rtp_parameters())?,
            consumer_type: format!("{:?}", consumer.r#type()).to_lowercase(),
            producer_paused: consumer.producer_paused(),
        };
        self.setup_consumer_handlers(&consumer);
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.id.clone(), (consumer, transport_id.to_string()));
        Ok(info)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self.consumer(consumer_id)?;
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self.consumer(consumer_id)?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(consumer_id);
    }
}
