#![forbid(unsafe_code)]

// Media module - adapter over the SFU engine
// The session layer only issues lifecycle calls through `MediaEngine` and
// receives opaque ids and parameter blobs back.

#[cfg(feature = "mediasoup")]
pub mod config;
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

pub use loopback::LoopbackEngine;
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;
pub use types::{
    ConsumerInfo, MediaError, MediaEvent, MediaKind, MediaResult, RouterInfo, TransportDirection,
    TransportInfo,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Receiving end of the engine's event stream
pub type MediaEvents = mpsc::UnboundedReceiver<MediaEvent>;

/// Sending end of the engine's event stream (usable from sync callbacks)
pub type MediaEventSink = mpsc::UnboundedSender<MediaEvent>;

/// Lifecycle operations the session layer needs from a media engine.
///
/// Close operations are idempotent: closing an unknown or already-closed id is
/// a no-op. Closing a transport closes every producer and consumer created on
/// it, and closing a producer closes every consumer of it, without raising
/// events for those closures.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a router (one per room)
    async fn create_router(&self) -> MediaResult<RouterInfo>;

    async fn close_router(&self, router_id: &str);

    /// Allocates a WebRTC transport on a router
    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo>;

    /// Completes the DTLS handshake parameters for a transport
    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    async fn close_transport(&self, transport_id: &str);

    /// Starts receiving a track on a producer transport, returning the producer id
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> MediaResult<String>;

    async fn close_producer(&self, producer_id: &str);

    /// Whether a client with `rtp_capabilities` can receive the producer.
    /// `ResourceNotFound` if the producer is not live on that router.
    fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> MediaResult<bool>;

    /// Creates a consumer on a consumer transport. Consumers always start paused.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo>;

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn close_consumer(&self, consumer_id: &str);
}
