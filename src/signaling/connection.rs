#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{
    error_response, recover_request_id, success_response, ClientRequest, ProducerList, Produced,
    RequestEnvelope, RoomJoined, RouterCapabilities,
};
use crate::media::TransportDirection;
use crate::metrics::{Counter, ServerMetrics};
use crate::room::NotificationSender;
use crate::session::{SessionError, SessionOrchestrator, SessionResult};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per client. Notifications beyond this are dropped;
/// responses wait for room.
pub const CHANNEL_CAPACITY: usize = 64;

/// Interval between server pings, half the idle timeout
fn keepalive_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(Duration::from_millis(100))
}

/// Per-connection protocol state
pub struct ClientSession {
    participant_id: String,
    sender: NotificationSender,
    joined_rooms: HashSet<String>,
}

impl ClientSession {
    pub fn new(participant_id: impl Into<String>, sender: NotificationSender) -> Self {
        Self {
            participant_id: participant_id.into(),
            sender,
            joined_rooms: HashSet::new(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn joined_rooms(&self) -> &HashSet<String> {
        &self.joined_rooms
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    orchestrator: Arc<SessionOrchestrator>,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let participant_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", participant_id);
    let _conn_guard = metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_id = participant_id.clone();
    let send_metrics = metrics.clone();
    let ping_period = keepalive_period(idle_timeout);
    let send_task = tokio::spawn(async move {
        // A listen-only client still answers pings, so it never goes idle
        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
        loop {
            let outgoing = tokio::select! {
                json = rx.recv() => match json {
                    Some(json) => {
                        send_metrics.inc(Counter::MessagesSent);
                        Message::Text((*json).clone().into())
                    }
                    None => break,
                },
                _ = keepalive.tick() => Message::Ping(Default::default()),
            };
            if ws_sender.send(outgoing).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for participant: {}", send_id);
    });

    let mut session = ClientSession::new(participant_id.clone(), tx.clone());

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Closing connection {} for shutdown", participant_id);
                break;
            }
            next = tokio::time::timeout(idle_timeout, ws_receiver.next()) => match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!("WebSocket error for participant {}: {}", participant_id, e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Idle timeout for participant {}", participant_id);
                    break;
                }
            },
        };

        let reply = match msg {
            Message::Text(text) => {
                handle_frame(&orchestrator, &mut session, &metrics, text.as_str()).await
            }
            Message::Binary(_) => {
                metrics.inc(Counter::MessagesReceived);
                metrics.inc_errors();
                error_response(0, "InvalidRequest", "Binary frames are not supported")
            }
            Message::Close(_) => {
                info!("Client {} closed connection", participant_id);
                break;
            }
            // Pongs answer our keepalive; either way the idle timer has been reset
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        // Responses share the queue with notifications so a client never sees
        // a notification about a resource before the response creating it
        if tx.send(Arc::new(reply)).await.is_err() {
            break;
        }
    }

    orchestrator
        .disconnect(&participant_id, session.joined_rooms())
        .await;

    drop(session);
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for participant: {}", participant_id);
}

/// Parses and runs one text frame, returning the response frame
pub async fn handle_frame(
    orchestrator: &SessionOrchestrator,
    session: &mut ClientSession,
    metrics: &ServerMetrics,
    text: &str,
) -> String {
    metrics.inc(Counter::MessagesReceived);

    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                "Invalid message format from {}: {}",
                session.participant_id, e
            );
            metrics.inc_errors();
            return error_response(
                recover_request_id(text),
                "InvalidRequest",
                &format!("Invalid message format: {e}"),
            );
        }
    };

    let request_id = envelope.request_id;
    let name = envelope.request.name();
    let start = Instant::now();
    let result = dispatch(orchestrator, session, envelope.request).await;
    metrics.observe_message_handling(start.elapsed());

    match result {
        Ok(payload) => {
            debug!(
                "Request {} ({}) from {} succeeded",
                request_id, name, session.participant_id
            );
            success_response(request_id, payload)
        }
        Err(e) => {
            debug!(
                "Request {} ({}) from {} failed: {}",
                request_id, name, session.participant_id, e
            );
            metrics.inc_errors();
            error_response(request_id, e.kind(), &e.to_string())
        }
    }
}

fn payload<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Routes a request to its orchestrator operation
async fn dispatch(
    orchestrator: &SessionOrchestrator,
    session: &mut ClientSession,
    request: ClientRequest,
) -> SessionResult<Value> {
    let pid = session.participant_id.as_str();

    match request {
        ClientRequest::JoinRoom { room_id } => {
            orchestrator
                .join_room(&room_id, pid, session.sender.clone())
                .await?;
            session.joined_rooms.insert(room_id.clone());
            Ok(payload(RoomJoined { room_id }))
        }

        ClientRequest::GetRouterRtpCapabilities { room_id } => {
            let rtp_capabilities = orchestrator.get_router_rtp_capabilities(&room_id).await?;
            Ok(payload(RouterCapabilities { rtp_capabilities }))
        }

        ClientRequest::CreateProducerTransport { room_id } => {
            let info = orchestrator
                .create_transport(&room_id, pid, TransportDirection::Producer)
                .await?;
            Ok(payload(info))
        }

        ClientRequest::CreateConsumerTransport { room_id } => {
            let info = orchestrator
                .create_transport(&room_id, pid, TransportDirection::Consumer)
                .await?;
            Ok(payload(info))
        }

        ClientRequest::ConnectProducerTransport {
            room_id,
            transport_id,
            dtls_parameters,
        } => {
            orchestrator
                .connect_transport(
                    &room_id,
                    pid,
                    TransportDirection::Producer,
                    &transport_id,
                    dtls_parameters,
                )
                .await?;
            Ok(Value::Null)
        }

        ClientRequest::ConnectConsumerTransport {
            room_id,
            transport_id,
            dtls_parameters,
        } => {
            orchestrator
                .connect_transport(
                    &room_id,
                    pid,
                    TransportDirection::Consumer,
                    &transport_id,
                    dtls_parameters,
                )
                .await?;
            Ok(Value::Null)
        }

        ClientRequest::Produce {
            room_id,
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            let id = orchestrator
                .produce(&room_id, pid, &transport_id, kind, rtp_parameters, app_data)
                .await?;
            Ok(payload(Produced { id }))
        }

        ClientRequest::Consume {
            room_id,
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let info = orchestrator
                .consume(&room_id, pid, &transport_id, &producer_id, rtp_capabilities)
                .await?;
            Ok(payload(info))
        }

        ClientRequest::ResumeConsumer {
            room_id,
            consumer_id,
        } => {
            orchestrator
                .resume_consumer(&room_id, pid, &consumer_id)
                .await?;
            Ok(Value::Null)
        }

        ClientRequest::PauseConsumer {
            room_id,
            consumer_id,
        } => {
            orchestrator
                .pause_consumer(&room_id, pid, &consumer_id)
                .await?;
            Ok(Value::Null)
        }

        ClientRequest::GetProducers { room_id } => {
            let producers = orchestrator.get_producers(&room_id, pid).await?;
            Ok(payload(ProducerList { producers }))
        }

        ClientRequest::CloseProducer {
            room_id,
            producer_id,
        } => {
            orchestrator
                .close_producer(&room_id, pid, &producer_id)
                .await?;
            Ok(Value::Null)
        }

        ClientRequest::LeaveRoom { room_id } => {
            if !session.joined_rooms.contains(&room_id) {
                return Err(SessionError::ParticipantNotFound {
                    room_id,
                    participant_id: pid.to_string(),
                });
            }
            orchestrator.leave_room(&room_id, pid).await?;
            session.joined_rooms.remove(&room_id);
            Ok(Value::Null)
        }
    }
}
