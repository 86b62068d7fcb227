#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request frame: `{"requestId": n, "type": "<operation>", ...fields}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Client-to-Server operations
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Join (and create on first use) a room
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities { room_id: String },
    #[serde(rename_all = "camelCase")]
    CreateProducerTransport { room_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        room_id: String,
        transport_id: String,
        dtls_parameters: Value,
    },
    /// Publish a track on a producer transport
    #[serde(rename_all = "camelCase")]
    Produce {
        room_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },
    #[serde(rename_all = "camelCase")]
    CreateConsumerTransport { room_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport {
        room_id: String,
        transport_id: String,
        dtls_parameters: Value,
    },
    /// Subscribe to another participant's producer
    #[serde(rename_all = "camelCase")]
    Consume {
        room_id: String,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { room_id: String, consumer_id: String },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { room_id: String, consumer_id: String },
    /// List producers of the other participants
    #[serde(rename_all = "camelCase")]
    GetProducers { room_id: String },
    #[serde(rename_all = "camelCase")]
    CloseProducer { room_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
}

impl ClientRequest {
    /// Operation name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "joinRoom",
            ClientRequest::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            ClientRequest::CreateProducerTransport { .. } => "createProducerTransport",
            ClientRequest::ConnectProducerTransport { .. } => "connectProducerTransport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::CreateConsumerTransport { .. } => "createConsumerTransport",
            ClientRequest::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resumeConsumer",
            ClientRequest::PauseConsumer { .. } => "pauseConsumer",
            ClientRequest::GetProducers { .. } => "getProducers",
            ClientRequest::CloseProducer { .. } => "closeProducer",
            ClientRequest::LeaveRoom { .. } => "leaveRoom",
        }
    }
}

/// Server-pushed notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Another participant started producing
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        producer_socket_id: String,
        kind: MediaKind,
    },
    /// One of the recipient's consumers was closed by the server
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },
}

/// Producer entry returned by getProducers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub kind: MediaKind,
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Produced {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerList {
    pub producers: Vec<ProducerSummary>,
}

/// Outcome tag of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

fn response_frame(request_id: u64, status: ResponseStatus, mut body: Map<String, Value>) -> String {
    body.insert("type".to_string(), Value::from("response"));
    body.insert("requestId".to_string(), Value::from(request_id));
    body.insert(
        "status".to_string(),
        serde_json::to_value(status).unwrap_or(Value::Null),
    );
    Value::Object(body).to_string()
}

/// Builds a success response; object payloads are merged into the frame
pub fn success_response(request_id: u64, payload: Value) -> String {
    let body = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    response_frame(request_id, ResponseStatus::Success, body)
}

/// Builds an error response carrying the failure kind and a message
pub fn error_response(request_id: u64, kind: &str, message: &str) -> String {
    let mut body = Map::new();
    body.insert("error".to_string(), Value::from(kind));
    body.insert("message".to_string(), Value::from(message));
    response_frame(request_id, ResponseStatus::Error, body)
}

/// Best-effort `requestId` of a frame that failed to parse; 0 when absent
pub fn recover_request_id(text: &str) -> u64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("requestId").and_then(Value::as_u64))
        .unwrap_or(0)
}
